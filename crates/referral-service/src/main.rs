//! referrald - referral enrollment and commission daemon

use anyhow::Context;
use clap::{Parser, ValueEnum};
use referral_core::StorageConfig;
use referral_service::config::ServiceConfig;
use referral_service::{build_router, ServiceState};
use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StorageKind {
    Memory,
    Postgres,
}

/// referrald CLI
#[derive(Parser)]
#[command(name = "referrald")]
#[command(about = "Referral enrollment and commission service", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "REFERRAL_CONFIG")]
    config: Option<String>,

    /// Listen address
    #[arg(short, long, env = "REFERRAL_LISTEN_ADDR")]
    listen: Option<String>,

    /// Storage backend
    #[arg(long, env = "REFERRAL_STORAGE", value_enum)]
    storage: Option<StorageKind>,

    /// PostgreSQL connection URL
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Log level
    #[arg(long, env = "REFERRAL_LOG_LEVEL")]
    log_level: Option<String>,

    /// Enable JSON logging
    #[arg(long, env = "REFERRAL_LOG_JSON")]
    json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config =
        ServiceConfig::load(cli.config.as_deref()).context("failed to load configuration")?;
    apply_overrides(&mut config, &cli)?;

    init_tracing(&config);

    let state = ServiceState::bootstrap(&config)
        .await
        .context("failed to start referral engine")?;
    let app = build_router(state, &config.server);

    let addr = config.server.listen_addr;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    tracing::info!(
        %addr,
        storage = config.storage().label(),
        version = env!("CARGO_PKG_VERSION"),
        "referrald listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    tracing::info!("referrald shut down");
    Ok(())
}

fn apply_overrides(config: &mut ServiceConfig, cli: &Cli) -> anyhow::Result<()> {
    if let Some(listen) = &cli.listen {
        config.server.listen_addr = listen
            .parse()
            .with_context(|| format!("invalid listen address '{listen}'"))?;
    }
    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }
    if cli.json {
        config.logging.json = true;
    }

    match (cli.storage, &cli.database_url) {
        (Some(StorageKind::Memory), _) => config.engine.storage = StorageConfig::Memory,
        (Some(StorageKind::Postgres), Some(url)) => {
            config.engine.storage = match &config.engine.storage {
                StorageConfig::Postgres {
                    max_connections,
                    connect_timeout_secs,
                    ..
                } => StorageConfig::Postgres {
                    url: url.clone(),
                    max_connections: *max_connections,
                    connect_timeout_secs: *connect_timeout_secs,
                },
                StorageConfig::Memory => StorageConfig::postgres(url.clone(), 10),
            };
        }
        (Some(StorageKind::Postgres), None) => {
            if !matches!(config.engine.storage, StorageConfig::Postgres { .. }) {
                anyhow::bail!("postgres storage requires --database-url or DATABASE_URL");
            }
        }
        (None, Some(url)) => {
            if let StorageConfig::Postgres { url: current, .. } = &mut config.engine.storage {
                *current = url.clone();
            }
        }
        (None, None) => {}
    }
    Ok(())
}

fn init_tracing(config: &ServiceConfig) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| config.logging.level.clone().into());

    if config.logging.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(%err, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!(%err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("received Ctrl+C, shutting down");
        }
        _ = terminate => {
            tracing::info!("received terminate signal, shutting down");
        }
    }
}
