//! Storage contract for the referral engine.
//!
//! Every trait method is a single atomic step against the backing store. The
//! uniqueness guarantees the engine relies on live here, not in callers:
//! - one enrollment per `(program_id, participant_id)`
//! - one tracking row per `enrollment_id`
//! - unique code values and one active code per trainer
//! - bounded `current_uses` increments
//! - a code use is counted exactly once per tracking row

mod error;
pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;
mod traits;

pub use error::{StorageError, StorageResult};
pub use memory::InMemoryReferralStorage;
pub use traits::{
    CodeStore, ConsumeOutcome, EnrollmentStore, ParticipantStore, PolicyStore, ProfileStore,
    ProgramStore, RecordedUse, ReferralStorage, TrackingStore,
};

use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Storage backend configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    /// Process-local state, for development and tests.
    Memory,
    /// PostgreSQL, the transactional source of truth.
    Postgres {
        url: String,
        #[serde(default = "default_max_connections")]
        max_connections: u32,
        #[serde(default = "default_connect_timeout")]
        connect_timeout_secs: u64,
    },
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::Memory
    }
}

impl StorageConfig {
    pub fn postgres(url: impl Into<String>, max_connections: u32) -> Self {
        Self::Postgres {
            url: url.into(),
            max_connections,
            connect_timeout_secs: default_connect_timeout(),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Postgres { .. } => "postgres",
        }
    }

    /// Open the configured backend, creating schema where needed.
    pub async fn open(&self) -> StorageResult<Arc<dyn ReferralStorage>> {
        match self {
            Self::Memory => Ok(Arc::new(InMemoryReferralStorage::new())),
            #[cfg(feature = "postgres")]
            Self::Postgres {
                url,
                max_connections,
                connect_timeout_secs,
            } => {
                let store = postgres::PostgresReferralStorage::connect_with_options(
                    url,
                    *max_connections,
                    *connect_timeout_secs,
                )
                .await?;
                Ok(Arc::new(store))
            }
            #[cfg(not(feature = "postgres"))]
            Self::Postgres { .. } => Err(StorageError::Backend(
                "postgres storage requires the `postgres` feature".to_string(),
            )),
        }
    }
}

fn default_max_connections() -> u32 {
    10
}

fn default_connect_timeout() -> u64 {
    5
}
