use crate::error::{FieldError, ReferralError, ReferralResult};
use crate::flow::EnrollmentEvent;
use crate::issuer::{CodeIssuer, IssuerConfig};
use crate::ledger::TrackingLedger;
use crate::notify::{EnrollmentNotifier, LogNotifier, NotifierRegistry};
use crate::orchestrator::{
    EnrollmentOrchestrator, EnrollmentOutcome, EnrollmentRequest, StatusChange,
};
use crate::policy::{PolicyResolver, RatePrecedence};
use crate::registry::{CodeRegistry, ValidCode};
use crate::stats::{LeaderboardPeriod, LeaderboardScope, LeaderboardStat, StatsAggregator};
use crate::storage::{ProfileStore, ProgramStore, ReferralStorage, StorageConfig};
use crate::types::{
    Enrollment, NewReferralCode, PolicyDraft, Profile, Program, ReferralCode, ReferralPolicy,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Referral engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReferralEngineConfig {
    pub precedence: RatePrecedence,
    pub issuer: IssuerConfig,
    pub storage: StorageConfig,
    /// Register the tracing-backed notifier at bootstrap.
    pub log_notifications: bool,
}

impl Default for ReferralEngineConfig {
    fn default() -> Self {
        Self {
            precedence: RatePrecedence::default(),
            issuer: IssuerConfig::default(),
            storage: StorageConfig::default(),
            log_notifications: true,
        }
    }
}

/// Facade wiring the referral components over one store.
#[derive(Clone)]
pub struct ReferralEngine {
    store: Arc<dyn ReferralStorage>,
    registry: CodeRegistry,
    resolver: PolicyResolver,
    issuer: CodeIssuer,
    orchestrator: EnrollmentOrchestrator,
    stats: StatsAggregator,
    notifiers: Arc<NotifierRegistry>,
    config: ReferralEngineConfig,
}

impl ReferralEngine {
    /// Open the configured store and assemble the engine.
    pub async fn bootstrap(config: ReferralEngineConfig) -> ReferralResult<Self> {
        let store = config.storage.open().await?;
        let engine = Self::with_storage(store, config);
        if engine.config.log_notifications {
            engine.register_notifier(Arc::new(LogNotifier));
        }
        info!(
            storage = engine.storage_backend(),
            precedence = ?engine.config.precedence,
            "referral engine ready"
        );
        Ok(engine)
    }

    pub fn with_storage(store: Arc<dyn ReferralStorage>, config: ReferralEngineConfig) -> Self {
        let registry = CodeRegistry::new(store.clone());
        let resolver = PolicyResolver::new(store.clone(), config.precedence);
        let issuer = CodeIssuer::new(store.clone(), config.issuer.clone());
        let ledger = TrackingLedger::new(store.clone());
        let notifiers = Arc::new(NotifierRegistry::new());
        let orchestrator = EnrollmentOrchestrator::new(
            store.clone(),
            registry.clone(),
            resolver.clone(),
            ledger,
            notifiers.clone(),
        );
        let stats = StatsAggregator::new(store.clone());

        Self {
            store,
            registry,
            resolver,
            issuer,
            orchestrator,
            stats,
            notifiers,
            config,
        }
    }

    /// Swap the code issuer, e.g. for a custom generator.
    pub fn with_issuer(mut self, issuer: CodeIssuer) -> Self {
        self.issuer = issuer;
        self
    }

    pub fn config(&self) -> &ReferralEngineConfig {
        &self.config
    }

    pub fn storage_backend(&self) -> &'static str {
        self.store.backend_label()
    }

    pub fn store(&self) -> Arc<dyn ReferralStorage> {
        self.store.clone()
    }

    pub fn register_notifier(&self, notifier: Arc<dyn EnrollmentNotifier>) {
        info!(channel = notifier.channel(), "enrollment notifier registered");
        self.notifiers.register(notifier);
    }

    pub async fn validate_code(&self, code: &str) -> ReferralResult<ValidCode> {
        self.registry.validate(code).await
    }

    pub async fn enroll(&self, request: EnrollmentRequest) -> ReferralResult<EnrollmentOutcome> {
        self.orchestrator.enroll(request).await
    }

    pub async fn apply_status_event(
        &self,
        enrollment_id: Uuid,
        event: EnrollmentEvent,
    ) -> ReferralResult<StatusChange> {
        self.orchestrator
            .apply_status_event(enrollment_id, event)
            .await
    }

    pub async fn enrollments_for_participant(&self, user_id: Uuid) -> ReferralResult<Vec<Enrollment>> {
        self.orchestrator.enrollments_for_participant(user_id).await
    }

    pub async fn leaderboard(
        &self,
        scope: LeaderboardScope,
        period: LeaderboardPeriod,
        limit: Option<usize>,
    ) -> ReferralResult<Vec<LeaderboardStat>> {
        self.stats.leaderboard(scope, period, limit).await
    }

    pub async fn get_or_create_code(&self, trainer_id: Uuid) -> ReferralResult<ReferralCode> {
        self.issuer.get_or_create(trainer_id).await
    }

    pub async fn create_code(&self, code: NewReferralCode) -> ReferralResult<ReferralCode> {
        self.issuer.create(code).await
    }

    pub async fn deactivate_code(&self, code_id: Uuid) -> ReferralResult<ReferralCode> {
        self.registry.deactivate(code_id).await
    }

    pub async fn list_policies(&self, program_id: Option<Uuid>) -> ReferralResult<Vec<ReferralPolicy>> {
        self.resolver.list_policies(program_id).await
    }

    pub async fn get_policy(&self, id: Uuid) -> ReferralResult<ReferralPolicy> {
        self.resolver.get_policy(id).await
    }

    pub async fn create_policy(&self, draft: PolicyDraft) -> ReferralResult<ReferralPolicy> {
        self.resolver.create_policy(draft).await
    }

    pub async fn update_policy(&self, id: Uuid, draft: PolicyDraft) -> ReferralResult<ReferralPolicy> {
        self.resolver.update_policy(id, draft).await
    }

    pub async fn delete_policy(&self, id: Uuid) -> ReferralResult<()> {
        self.resolver.delete_policy(id).await
    }

    /// Mirror a catalog program.
    pub async fn upsert_program(&self, program: Program) -> ReferralResult<Program> {
        let mut errors = Vec::new();
        if program.title.trim().is_empty() {
            errors.push(FieldError::new("title", "must not be empty"));
        }
        if program.price < 0 {
            errors.push(FieldError::new("price", "must not be negative"));
        }
        if !errors.is_empty() {
            return Err(ReferralError::Validation(errors));
        }
        self.store.upsert_program(program.clone()).await?;
        Ok(program)
    }

    pub async fn get_program(&self, id: Uuid) -> ReferralResult<Program> {
        self.store
            .get_program(id)
            .await?
            .ok_or_else(|| ReferralError::not_found("program", id))
    }

    /// Mirror an identity profile.
    pub async fn upsert_profile(&self, profile: Profile) -> ReferralResult<Profile> {
        if profile.full_name.trim().is_empty() {
            return Err(ReferralError::invalid_field("full_name", "must not be empty"));
        }
        self.store.upsert_profile(profile.clone()).await?;
        Ok(profile)
    }

    pub async fn get_profile(&self, id: Uuid) -> ReferralResult<Option<Profile>> {
        Ok(self.store.get_profile(id).await?)
    }
}
