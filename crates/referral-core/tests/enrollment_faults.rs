use async_trait::async_trait;
use chrono::{DateTime, Utc};
use referral_core::storage::{
    CodeStore, ConsumeOutcome, EnrollmentStore, ParticipantStore, PolicyStore, ProfileStore,
    ProgramStore, RecordedUse, TrackingStore,
};
use referral_core::{
    Enrollment, EnrollmentNotice, EnrollmentNotifier, EnrollmentRequest, EnrollmentStatus,
    InMemoryReferralStorage, NewEnrollment, NewReferralCode, NewTracking, NotifyError,
    Participant, ParticipantFields, PaymentStatus, PolicyDraft, Profile, Program, ProgramStatus,
    ReferralCode, ReferralEngine, ReferralEngineConfig, ReferralError, ReferralLinkage,
    ReferralPolicy, ReferralStorage, ReferralTracking, StorageError, StorageResult,
    TrackingStatus,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Fault {
    Nothing,
    UpsertParticipant,
    RecordUse,
}

/// In-memory store that fails one chosen method once.
struct FaultyStorage {
    inner: InMemoryReferralStorage,
    fault: Fault,
    armed: AtomicBool,
}

impl FaultyStorage {
    fn new(fault: Fault) -> Self {
        Self {
            inner: InMemoryReferralStorage::new(),
            fault,
            armed: AtomicBool::new(true),
        }
    }

    fn trip(&self, at: Fault) -> StorageResult<()> {
        if self.fault == at && self.armed.swap(false, Ordering::SeqCst) {
            return Err(StorageError::Backend(format!("connection reset during {at:?}")));
        }
        Ok(())
    }
}

impl ReferralStorage for FaultyStorage {
    fn backend_label(&self) -> &'static str {
        "faulty-memory"
    }
}

#[async_trait]
impl ProgramStore for FaultyStorage {
    async fn get_program(&self, id: Uuid) -> StorageResult<Option<Program>> {
        self.inner.get_program(id).await
    }

    async fn upsert_program(&self, program: Program) -> StorageResult<()> {
        self.inner.upsert_program(program).await
    }
}

#[async_trait]
impl ProfileStore for FaultyStorage {
    async fn get_profile(&self, id: Uuid) -> StorageResult<Option<Profile>> {
        self.inner.get_profile(id).await
    }

    async fn upsert_profile(&self, profile: Profile) -> StorageResult<()> {
        self.inner.upsert_profile(profile).await
    }

    async fn profiles_by_ids(&self, ids: &[Uuid]) -> StorageResult<Vec<Profile>> {
        self.inner.profiles_by_ids(ids).await
    }
}

#[async_trait]
impl ParticipantStore for FaultyStorage {
    async fn upsert_participant(
        &self,
        fields: &ParticipantFields,
        at: DateTime<Utc>,
    ) -> StorageResult<Participant> {
        self.trip(Fault::UpsertParticipant)?;
        self.inner.upsert_participant(fields, at).await
    }

    async fn participant_by_user(&self, user_id: Uuid) -> StorageResult<Option<Participant>> {
        self.inner.participant_by_user(user_id).await
    }
}

#[async_trait]
impl CodeStore for FaultyStorage {
    async fn find_code(&self, code: &str) -> StorageResult<Option<ReferralCode>> {
        self.inner.find_code(code).await
    }

    async fn get_code(&self, id: Uuid) -> StorageResult<Option<ReferralCode>> {
        self.inner.get_code(id).await
    }

    async fn active_code_for_trainer(
        &self,
        trainer_id: Uuid,
    ) -> StorageResult<Option<ReferralCode>> {
        self.inner.active_code_for_trainer(trainer_id).await
    }

    async fn code_exists(&self, code: &str) -> StorageResult<bool> {
        self.inner.code_exists(code).await
    }

    async fn insert_code(
        &self,
        code: NewReferralCode,
        at: DateTime<Utc>,
    ) -> StorageResult<ReferralCode> {
        self.inner.insert_code(code, at).await
    }

    async fn consume_code(&self, id: Uuid) -> StorageResult<ConsumeOutcome> {
        self.inner.consume_code(id).await
    }

    async fn deactivate_code(&self, id: Uuid) -> StorageResult<ReferralCode> {
        self.inner.deactivate_code(id).await
    }
}

#[async_trait]
impl PolicyStore for FaultyStorage {
    async fn list_policies(&self, program_id: Option<Uuid>) -> StorageResult<Vec<ReferralPolicy>> {
        self.inner.list_policies(program_id).await
    }

    async fn get_policy(&self, id: Uuid) -> StorageResult<Option<ReferralPolicy>> {
        self.inner.get_policy(id).await
    }

    async fn insert_policy(
        &self,
        draft: PolicyDraft,
        at: DateTime<Utc>,
    ) -> StorageResult<ReferralPolicy> {
        self.inner.insert_policy(draft, at).await
    }

    async fn update_policy(
        &self,
        id: Uuid,
        draft: PolicyDraft,
        at: DateTime<Utc>,
    ) -> StorageResult<ReferralPolicy> {
        self.inner.update_policy(id, draft, at).await
    }

    async fn delete_policy(&self, id: Uuid) -> StorageResult<bool> {
        self.inner.delete_policy(id).await
    }

    async fn active_policies_for_program(
        &self,
        program_id: Uuid,
    ) -> StorageResult<Vec<ReferralPolicy>> {
        self.inner.active_policies_for_program(program_id).await
    }
}

#[async_trait]
impl EnrollmentStore for FaultyStorage {
    async fn get_enrollment(&self, id: Uuid) -> StorageResult<Option<Enrollment>> {
        self.inner.get_enrollment(id).await
    }

    async fn find_enrollment(
        &self,
        program_id: Uuid,
        participant_id: Uuid,
    ) -> StorageResult<Option<Enrollment>> {
        self.inner.find_enrollment(program_id, participant_id).await
    }

    async fn insert_enrollment(
        &self,
        enrollment: NewEnrollment,
        at: DateTime<Utc>,
    ) -> StorageResult<Enrollment> {
        self.inner.insert_enrollment(enrollment, at).await
    }

    async fn link_referral(
        &self,
        id: Uuid,
        linkage: ReferralLinkage,
        note: String,
        at: DateTime<Utc>,
    ) -> StorageResult<Enrollment> {
        self.inner.link_referral(id, linkage, note, at).await
    }

    async fn unlink_referral(
        &self,
        id: Uuid,
        code_id: Uuid,
        note: String,
        at: DateTime<Utc>,
    ) -> StorageResult<Enrollment> {
        self.inner.unlink_referral(id, code_id, note, at).await
    }

    async fn remove_enrollment(&self, id: Uuid) -> StorageResult<bool> {
        self.inner.remove_enrollment(id).await
    }

    async fn transition_enrollment(
        &self,
        id: Uuid,
        expected: EnrollmentStatus,
        next: EnrollmentStatus,
        payment: Option<PaymentStatus>,
        at: DateTime<Utc>,
    ) -> StorageResult<Enrollment> {
        self.inner
            .transition_enrollment(id, expected, next, payment, at)
            .await
    }

    async fn enrollments_for_participant(
        &self,
        participant_id: Uuid,
    ) -> StorageResult<Vec<Enrollment>> {
        self.inner.enrollments_for_participant(participant_id).await
    }
}

#[async_trait]
impl TrackingStore for FaultyStorage {
    async fn insert_tracking(
        &self,
        tracking: NewTracking,
        at: DateTime<Utc>,
    ) -> StorageResult<ReferralTracking> {
        self.inner.insert_tracking(tracking, at).await
    }

    async fn record_use(
        &self,
        tracking: NewTracking,
        at: DateTime<Utc>,
    ) -> StorageResult<RecordedUse> {
        self.trip(Fault::RecordUse)?;
        self.inner.record_use(tracking, at).await
    }

    async fn tracking_for_enrollment(
        &self,
        enrollment_id: Uuid,
    ) -> StorageResult<Option<ReferralTracking>> {
        self.inner.tracking_for_enrollment(enrollment_id).await
    }

    async fn set_tracking_status(
        &self,
        enrollment_id: Uuid,
        status: TrackingStatus,
        at: DateTime<Utc>,
    ) -> StorageResult<Option<ReferralTracking>> {
        self.inner
            .set_tracking_status(enrollment_id, status, at)
            .await
    }

    async fn list_tracking(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> StorageResult<Vec<ReferralTracking>> {
        self.inner.list_tracking(since).await
    }
}

struct Setup {
    store: Arc<FaultyStorage>,
    engine: ReferralEngine,
    program: Program,
    code: ReferralCode,
}

async fn setup(fault: Fault) -> Setup {
    let store = Arc::new(FaultyStorage::new(fault));
    let engine = ReferralEngine::with_storage(
        store.clone(),
        ReferralEngineConfig {
            log_notifications: false,
            ..ReferralEngineConfig::default()
        },
    );
    let program = engine
        .upsert_program(Program {
            id: Uuid::new_v4(),
            title: "Coaching Clinic".to_string(),
            price: 300_000,
            status: ProgramStatus::Published,
        })
        .await
        .unwrap();
    let code = engine
        .create_code(NewReferralCode {
            max_uses: Some(1),
            ..NewReferralCode::issued("SOLO0001", Uuid::new_v4())
        })
        .await
        .unwrap();
    Setup {
        store,
        engine,
        program,
        code,
    }
}

fn request(program_id: Uuid, user_id: Uuid) -> EnrollmentRequest {
    EnrollmentRequest {
        program_id,
        participant: ParticipantFields {
            user_id,
            full_name: "Rina Kusuma".to_string(),
            email: format!("{user_id}@example.com"),
            phone: None,
            organization: None,
        },
        referral_code: Some("SOLO0001".to_string()),
    }
}

async fn uses(setup: &Setup) -> u32 {
    setup
        .store
        .get_code(setup.code.id)
        .await
        .unwrap()
        .unwrap()
        .current_uses
}

#[tokio::test]
async fn participant_upsert_failure_writes_nothing() {
    let setup = setup(Fault::UpsertParticipant).await;
    let user = Uuid::new_v4();

    assert!(matches!(
        setup.engine.enroll(request(setup.program.id, user)).await,
        Err(ReferralError::Persistence(_))
    ));
    assert!(setup.store.participant_by_user(user).await.unwrap().is_none());
    assert!(setup
        .engine
        .enrollments_for_participant(user)
        .await
        .unwrap()
        .is_empty());
    assert!(setup.store.list_tracking(None).await.unwrap().is_empty());
    assert_eq!(uses(&setup).await, 0);

    let outcome = setup
        .engine
        .enroll(request(setup.program.id, user))
        .await
        .unwrap();
    assert!(outcome.tracking.is_some());
    assert_eq!(uses(&setup).await, 1);
}

#[tokio::test]
async fn retry_after_failed_tracking_write_counts_the_use_once() {
    let setup = setup(Fault::RecordUse).await;
    let user = Uuid::new_v4();

    assert!(matches!(
        setup.engine.enroll(request(setup.program.id, user)).await,
        Err(ReferralError::Persistence(_))
    ));
    let stranded = setup.engine.enrollments_for_participant(user).await.unwrap();
    assert_eq!(stranded.len(), 1);
    assert_eq!(
        stranded[0].referral.as_ref().map(|link| link.code_id),
        Some(setup.code.id)
    );
    assert!(setup.store.list_tracking(None).await.unwrap().is_empty());
    assert_eq!(uses(&setup).await, 0);

    let retry = setup
        .engine
        .enroll(request(setup.program.id, user))
        .await
        .unwrap();
    assert_eq!(retry.enrollment.id, stranded[0].id);
    assert!(!retry.replayed);
    assert_eq!(retry.tracking.map(|row| row.code_id), Some(setup.code.id));
    assert_eq!(uses(&setup).await, 1);

    assert!(matches!(
        setup
            .engine
            .enroll(request(setup.program.id, Uuid::new_v4()))
            .await,
        Err(ReferralError::QuotaExceeded { .. })
    ));
    assert_eq!(uses(&setup).await, 1);
    assert_eq!(setup.store.list_tracking(None).await.unwrap().len(), 1);
}

struct RejectingNotifier {
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl EnrollmentNotifier for RejectingNotifier {
    fn channel(&self) -> &'static str {
        "rejecting"
    }

    async fn notify(&self, _notice: &EnrollmentNotice) -> Result<(), NotifyError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(NotifyError::Delivery {
            channel: "rejecting".to_string(),
            message: "smtp relay refused connection".to_string(),
        })
    }
}

struct StalledNotifier;

#[async_trait]
impl EnrollmentNotifier for StalledNotifier {
    fn channel(&self) -> &'static str {
        "stalled"
    }

    async fn notify(&self, _notice: &EnrollmentNotice) -> Result<(), NotifyError> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(())
    }
}

#[tokio::test]
async fn broken_notifiers_neither_fail_nor_delay_enrollment() {
    let setup = setup(Fault::Nothing).await;
    let calls = Arc::new(AtomicUsize::new(0));
    setup.engine.register_notifier(Arc::new(RejectingNotifier {
        calls: calls.clone(),
    }));
    setup.engine.register_notifier(Arc::new(StalledNotifier));

    let outcome = tokio::time::timeout(
        Duration::from_secs(5),
        setup.engine.enroll(request(setup.program.id, Uuid::new_v4())),
    )
    .await
    .expect("enrollment waited on a notifier")
    .unwrap();
    assert_eq!(outcome.enrollment.status, EnrollmentStatus::Pending);
    assert!(outcome.tracking.is_some());

    for _ in 0..100 {
        if calls.load(Ordering::SeqCst) > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}
