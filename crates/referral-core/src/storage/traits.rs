use super::StorageResult;
use crate::types::{
    Enrollment, EnrollmentStatus, NewEnrollment, NewReferralCode, NewTracking, Participant,
    ParticipantFields, PaymentStatus, PolicyDraft, Profile, Program, ReferralCode,
    ReferralLinkage, ReferralPolicy, ReferralTracking, TrackingStatus,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Result of an atomic, bounds-checked usage increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeOutcome {
    Consumed { current_uses: u32 },
    Exhausted,
}

/// Result of recording an attribution together with its code use.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordedUse {
    Recorded {
        tracking: ReferralTracking,
        current_uses: u32,
    },
    /// A row already existed for the enrollment; no use was taken.
    AlreadyRecorded(ReferralTracking),
    /// The code is inactive or at its usage bound; nothing was written.
    Exhausted,
}

/// Programs are owned by the catalog; the engine only reads them.
#[async_trait]
pub trait ProgramStore: Send + Sync {
    async fn get_program(&self, id: Uuid) -> StorageResult<Option<Program>>;

    /// Mirror a catalog program (collaborator sync).
    async fn upsert_program(&self, program: Program) -> StorageResult<()>;
}

#[async_trait]
pub trait ProfileStore: Send + Sync {
    async fn get_profile(&self, id: Uuid) -> StorageResult<Option<Profile>>;

    /// Mirror an identity profile (collaborator sync).
    async fn upsert_profile(&self, profile: Profile) -> StorageResult<()>;

    async fn profiles_by_ids(&self, ids: &[Uuid]) -> StorageResult<Vec<Profile>>;
}

#[async_trait]
pub trait ParticipantStore: Send + Sync {
    /// Insert or refresh contact fields, keyed by user id.
    async fn upsert_participant(
        &self,
        fields: &ParticipantFields,
        at: DateTime<Utc>,
    ) -> StorageResult<Participant>;

    async fn participant_by_user(&self, user_id: Uuid) -> StorageResult<Option<Participant>>;
}

#[async_trait]
pub trait CodeStore: Send + Sync {
    async fn find_code(&self, code: &str) -> StorageResult<Option<ReferralCode>>;

    async fn get_code(&self, id: Uuid) -> StorageResult<Option<ReferralCode>>;

    async fn active_code_for_trainer(&self, trainer_id: Uuid)
        -> StorageResult<Option<ReferralCode>>;

    async fn code_exists(&self, code: &str) -> StorageResult<bool>;

    /// Insert a code. Fails with `Conflict` when the code value is taken or the
    /// trainer already owns an active code.
    async fn insert_code(
        &self,
        code: NewReferralCode,
        at: DateTime<Utc>,
    ) -> StorageResult<ReferralCode>;

    /// Increment `current_uses` only while it is below `max_uses`.
    async fn consume_code(&self, id: Uuid) -> StorageResult<ConsumeOutcome>;

    async fn deactivate_code(&self, id: Uuid) -> StorageResult<ReferralCode>;
}

#[async_trait]
pub trait PolicyStore: Send + Sync {
    async fn list_policies(&self, program_id: Option<Uuid>) -> StorageResult<Vec<ReferralPolicy>>;

    async fn get_policy(&self, id: Uuid) -> StorageResult<Option<ReferralPolicy>>;

    async fn insert_policy(
        &self,
        draft: PolicyDraft,
        at: DateTime<Utc>,
    ) -> StorageResult<ReferralPolicy>;

    async fn update_policy(
        &self,
        id: Uuid,
        draft: PolicyDraft,
        at: DateTime<Utc>,
    ) -> StorageResult<ReferralPolicy>;

    async fn delete_policy(&self, id: Uuid) -> StorageResult<bool>;

    /// Policies flagged active for a program, regardless of validity window.
    async fn active_policies_for_program(
        &self,
        program_id: Uuid,
    ) -> StorageResult<Vec<ReferralPolicy>>;
}

#[async_trait]
pub trait EnrollmentStore: Send + Sync {
    async fn get_enrollment(&self, id: Uuid) -> StorageResult<Option<Enrollment>>;

    async fn find_enrollment(
        &self,
        program_id: Uuid,
        participant_id: Uuid,
    ) -> StorageResult<Option<Enrollment>>;

    /// Insert; `Conflict` when `(program_id, participant_id)` already exists.
    async fn insert_enrollment(
        &self,
        enrollment: NewEnrollment,
        at: DateTime<Utc>,
    ) -> StorageResult<Enrollment>;

    /// Attach referral linkage to an unattributed enrollment and append `note`.
    /// `Conflict` when the enrollment already carries a linkage.
    async fn link_referral(
        &self,
        id: Uuid,
        linkage: ReferralLinkage,
        note: String,
        at: DateTime<Utc>,
    ) -> StorageResult<Enrollment>;

    /// Clear the linkage if it still points at `code_id`, appending `note`.
    async fn unlink_referral(
        &self,
        id: Uuid,
        code_id: Uuid,
        note: String,
        at: DateTime<Utc>,
    ) -> StorageResult<Enrollment>;

    async fn remove_enrollment(&self, id: Uuid) -> StorageResult<bool>;

    /// Compare-and-set status change; `Conflict` when the stored status is not `expected`.
    async fn transition_enrollment(
        &self,
        id: Uuid,
        expected: EnrollmentStatus,
        next: EnrollmentStatus,
        payment: Option<PaymentStatus>,
        at: DateTime<Utc>,
    ) -> StorageResult<Enrollment>;

    async fn enrollments_for_participant(
        &self,
        participant_id: Uuid,
    ) -> StorageResult<Vec<Enrollment>>;
}

#[async_trait]
pub trait TrackingStore: Send + Sync {
    /// Insert; `Conflict` when a row already exists for the enrollment.
    async fn insert_tracking(
        &self,
        tracking: NewTracking,
        at: DateTime<Utc>,
    ) -> StorageResult<ReferralTracking>;

    /// Take one use of `tracking.code_id` and insert the row as one atomic step.
    ///
    /// Keyed by enrollment: when a row already exists it is returned and the
    /// code is left untouched. `NotFound` when the code does not exist.
    async fn record_use(
        &self,
        tracking: NewTracking,
        at: DateTime<Utc>,
    ) -> StorageResult<RecordedUse>;

    async fn tracking_for_enrollment(
        &self,
        enrollment_id: Uuid,
    ) -> StorageResult<Option<ReferralTracking>>;

    async fn set_tracking_status(
        &self,
        enrollment_id: Uuid,
        status: TrackingStatus,
        at: DateTime<Utc>,
    ) -> StorageResult<Option<ReferralTracking>>;

    /// Rows created at or after `since`, or all rows.
    async fn list_tracking(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> StorageResult<Vec<ReferralTracking>>;
}

/// Unified storage bundle used by the referral engine.
pub trait ReferralStorage:
    ProgramStore
    + ProfileStore
    + ParticipantStore
    + CodeStore
    + PolicyStore
    + EnrollmentStore
    + TrackingStore
    + Send
    + Sync
{
    fn backend_label(&self) -> &'static str;
}
