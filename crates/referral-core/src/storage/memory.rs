//! In-memory reference implementation of the referral storage traits.
//!
//! All tables sit behind one lock, so each trait method is atomic with respect to
//! every other, which gives the same uniqueness and bounded-increment guarantees
//! the PostgreSQL adapter gets from constraints and conditional updates.

use super::traits::{
    CodeStore, ConsumeOutcome, EnrollmentStore, ParticipantStore, PolicyStore, ProfileStore,
    ProgramStore, RecordedUse, ReferralStorage, TrackingStore,
};
use super::{StorageError, StorageResult};
use crate::types::{
    Enrollment, EnrollmentStatus, NewEnrollment, NewReferralCode, NewTracking, Participant,
    ParticipantFields, PaymentStatus, PolicyDraft, Profile, Program, ReferralCode,
    ReferralLinkage, ReferralPolicy, ReferralTracking, TrackingStatus,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use uuid::Uuid;

#[derive(Default)]
struct State {
    programs: HashMap<Uuid, Program>,
    profiles: HashMap<Uuid, Profile>,
    /// Keyed by user id.
    participants: HashMap<Uuid, Participant>,
    codes: HashMap<Uuid, ReferralCode>,
    policies: HashMap<Uuid, ReferralPolicy>,
    enrollments: HashMap<Uuid, Enrollment>,
    /// Keyed by enrollment id.
    tracking: HashMap<Uuid, ReferralTracking>,
}

/// In-memory referral storage adapter.
#[derive(Default)]
pub struct InMemoryReferralStorage {
    state: RwLock<State>,
}

impl InMemoryReferralStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> StorageResult<RwLockReadGuard<'_, State>> {
        self.state
            .read()
            .map_err(|_| StorageError::Backend("referral state lock poisoned".to_string()))
    }

    fn write(&self) -> StorageResult<RwLockWriteGuard<'_, State>> {
        self.state
            .write()
            .map_err(|_| StorageError::Backend("referral state lock poisoned".to_string()))
    }
}

impl ReferralStorage for InMemoryReferralStorage {
    fn backend_label(&self) -> &'static str {
        "memory"
    }
}

#[async_trait]
impl ProgramStore for InMemoryReferralStorage {
    async fn get_program(&self, id: Uuid) -> StorageResult<Option<Program>> {
        Ok(self.read()?.programs.get(&id).cloned())
    }

    async fn upsert_program(&self, program: Program) -> StorageResult<()> {
        if program.price < 0 {
            return Err(StorageError::InvalidInput(format!(
                "program {} has negative price",
                program.id
            )));
        }
        self.write()?.programs.insert(program.id, program);
        Ok(())
    }
}

#[async_trait]
impl ProfileStore for InMemoryReferralStorage {
    async fn get_profile(&self, id: Uuid) -> StorageResult<Option<Profile>> {
        Ok(self.read()?.profiles.get(&id).cloned())
    }

    async fn upsert_profile(&self, profile: Profile) -> StorageResult<()> {
        self.write()?.profiles.insert(profile.id, profile);
        Ok(())
    }

    async fn profiles_by_ids(&self, ids: &[Uuid]) -> StorageResult<Vec<Profile>> {
        let guard = self.read()?;
        Ok(ids
            .iter()
            .filter_map(|id| guard.profiles.get(id).cloned())
            .collect())
    }
}

#[async_trait]
impl ParticipantStore for InMemoryReferralStorage {
    async fn upsert_participant(
        &self,
        fields: &ParticipantFields,
        at: DateTime<Utc>,
    ) -> StorageResult<Participant> {
        let mut guard = self.write()?;
        let participant = guard
            .participants
            .entry(fields.user_id)
            .and_modify(|existing| {
                existing.full_name = fields.full_name.clone();
                existing.email = fields.email.clone();
                existing.phone = fields.phone.clone();
                existing.organization = fields.organization.clone();
                existing.updated_at = at;
            })
            .or_insert_with(|| Participant {
                id: Uuid::new_v4(),
                user_id: fields.user_id,
                full_name: fields.full_name.clone(),
                email: fields.email.clone(),
                phone: fields.phone.clone(),
                organization: fields.organization.clone(),
                created_at: at,
                updated_at: at,
            });
        Ok(participant.clone())
    }

    async fn participant_by_user(&self, user_id: Uuid) -> StorageResult<Option<Participant>> {
        Ok(self.read()?.participants.get(&user_id).cloned())
    }
}

#[async_trait]
impl CodeStore for InMemoryReferralStorage {
    async fn find_code(&self, code: &str) -> StorageResult<Option<ReferralCode>> {
        Ok(self
            .read()?
            .codes
            .values()
            .find(|candidate| candidate.code == code)
            .cloned())
    }

    async fn get_code(&self, id: Uuid) -> StorageResult<Option<ReferralCode>> {
        Ok(self.read()?.codes.get(&id).cloned())
    }

    async fn active_code_for_trainer(
        &self,
        trainer_id: Uuid,
    ) -> StorageResult<Option<ReferralCode>> {
        Ok(self
            .read()?
            .codes
            .values()
            .find(|code| code.trainer_id == trainer_id && code.is_active)
            .cloned())
    }

    async fn code_exists(&self, code: &str) -> StorageResult<bool> {
        Ok(self.read()?.codes.values().any(|c| c.code == code))
    }

    async fn insert_code(
        &self,
        code: NewReferralCode,
        at: DateTime<Utc>,
    ) -> StorageResult<ReferralCode> {
        let mut guard = self.write()?;

        if guard.codes.values().any(|existing| existing.code == code.code) {
            return Err(StorageError::Conflict(format!(
                "referral code {} already exists",
                code.code
            )));
        }
        if guard
            .codes
            .values()
            .any(|existing| existing.trainer_id == code.trainer_id && existing.is_active)
        {
            return Err(StorageError::Conflict(format!(
                "trainer {} already owns an active referral code",
                code.trainer_id
            )));
        }

        let record = ReferralCode {
            id: Uuid::new_v4(),
            code: code.code,
            trainer_id: code.trainer_id,
            is_active: true,
            valid_until: code.valid_until,
            max_uses: code.max_uses,
            current_uses: 0,
            discount: code.discount,
            commission: code.commission,
            created_at: at,
        };
        guard.codes.insert(record.id, record.clone());
        Ok(record)
    }

    async fn consume_code(&self, id: Uuid) -> StorageResult<ConsumeOutcome> {
        let mut guard = self.write()?;
        let code = guard
            .codes
            .get_mut(&id)
            .ok_or_else(|| StorageError::NotFound(format!("referral code {id}")))?;

        if !code.is_active || code.quota_exhausted() {
            return Ok(ConsumeOutcome::Exhausted);
        }
        code.current_uses += 1;
        Ok(ConsumeOutcome::Consumed {
            current_uses: code.current_uses,
        })
    }

    async fn deactivate_code(&self, id: Uuid) -> StorageResult<ReferralCode> {
        let mut guard = self.write()?;
        let code = guard
            .codes
            .get_mut(&id)
            .ok_or_else(|| StorageError::NotFound(format!("referral code {id}")))?;
        code.is_active = false;
        Ok(code.clone())
    }
}

#[async_trait]
impl PolicyStore for InMemoryReferralStorage {
    async fn list_policies(&self, program_id: Option<Uuid>) -> StorageResult<Vec<ReferralPolicy>> {
        let guard = self.read()?;
        let mut values = guard
            .policies
            .values()
            .filter(|policy| program_id.map(|id| policy.program_id == id).unwrap_or(true))
            .cloned()
            .collect::<Vec<_>>();
        values.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(a.id.cmp(&b.id)));
        Ok(values)
    }

    async fn get_policy(&self, id: Uuid) -> StorageResult<Option<ReferralPolicy>> {
        Ok(self.read()?.policies.get(&id).cloned())
    }

    async fn insert_policy(
        &self,
        draft: PolicyDraft,
        at: DateTime<Utc>,
    ) -> StorageResult<ReferralPolicy> {
        let policy = ReferralPolicy {
            id: Uuid::new_v4(),
            program_id: draft.program_id,
            name: draft.name,
            discount: draft.discount,
            commission: draft.commission,
            max_uses_per_code: draft.max_uses_per_code,
            valid_from: draft.valid_from,
            valid_until: draft.valid_until,
            is_active: draft.is_active,
            created_at: at,
            updated_at: at,
        };
        self.write()?.policies.insert(policy.id, policy.clone());
        Ok(policy)
    }

    async fn update_policy(
        &self,
        id: Uuid,
        draft: PolicyDraft,
        at: DateTime<Utc>,
    ) -> StorageResult<ReferralPolicy> {
        let mut guard = self.write()?;
        let policy = guard
            .policies
            .get_mut(&id)
            .ok_or_else(|| StorageError::NotFound(format!("referral policy {id}")))?;
        policy.program_id = draft.program_id;
        policy.name = draft.name;
        policy.discount = draft.discount;
        policy.commission = draft.commission;
        policy.max_uses_per_code = draft.max_uses_per_code;
        policy.valid_from = draft.valid_from;
        policy.valid_until = draft.valid_until;
        policy.is_active = draft.is_active;
        policy.updated_at = at;
        Ok(policy.clone())
    }

    async fn delete_policy(&self, id: Uuid) -> StorageResult<bool> {
        Ok(self.write()?.policies.remove(&id).is_some())
    }

    async fn active_policies_for_program(
        &self,
        program_id: Uuid,
    ) -> StorageResult<Vec<ReferralPolicy>> {
        Ok(self
            .read()?
            .policies
            .values()
            .filter(|policy| policy.program_id == program_id && policy.is_active)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl EnrollmentStore for InMemoryReferralStorage {
    async fn get_enrollment(&self, id: Uuid) -> StorageResult<Option<Enrollment>> {
        Ok(self.read()?.enrollments.get(&id).cloned())
    }

    async fn find_enrollment(
        &self,
        program_id: Uuid,
        participant_id: Uuid,
    ) -> StorageResult<Option<Enrollment>> {
        Ok(self
            .read()?
            .enrollments
            .values()
            .find(|e| e.program_id == program_id && e.participant_id == participant_id)
            .cloned())
    }

    async fn insert_enrollment(
        &self,
        enrollment: NewEnrollment,
        at: DateTime<Utc>,
    ) -> StorageResult<Enrollment> {
        let mut guard = self.write()?;
        if guard.enrollments.values().any(|e| {
            e.program_id == enrollment.program_id && e.participant_id == enrollment.participant_id
        }) {
            return Err(StorageError::Conflict(format!(
                "enrollment for program {} and participant {} already exists",
                enrollment.program_id, enrollment.participant_id
            )));
        }

        let record = Enrollment {
            id: Uuid::new_v4(),
            program_id: enrollment.program_id,
            participant_id: enrollment.participant_id,
            status: enrollment.status,
            payment_status: enrollment.payment_status,
            amount_paid: 0,
            referral: enrollment.referral,
            notes: enrollment.notes,
            created_at: at,
            updated_at: at,
        };
        guard.enrollments.insert(record.id, record.clone());
        Ok(record)
    }

    async fn link_referral(
        &self,
        id: Uuid,
        linkage: ReferralLinkage,
        note: String,
        at: DateTime<Utc>,
    ) -> StorageResult<Enrollment> {
        let mut guard = self.write()?;
        let enrollment = guard
            .enrollments
            .get_mut(&id)
            .ok_or_else(|| StorageError::NotFound(format!("enrollment {id}")))?;
        if enrollment.referral.is_some() {
            return Err(StorageError::Conflict(format!(
                "enrollment {id} already carries a referral"
            )));
        }
        enrollment.referral = Some(linkage);
        enrollment.notes.push(note);
        enrollment.updated_at = at;
        Ok(enrollment.clone())
    }

    async fn unlink_referral(
        &self,
        id: Uuid,
        code_id: Uuid,
        note: String,
        at: DateTime<Utc>,
    ) -> StorageResult<Enrollment> {
        let mut guard = self.write()?;
        let enrollment = guard
            .enrollments
            .get_mut(&id)
            .ok_or_else(|| StorageError::NotFound(format!("enrollment {id}")))?;
        if enrollment.referral.as_ref().map(|link| link.code_id) != Some(code_id) {
            return Err(StorageError::Conflict(format!(
                "enrollment {id} is not linked to referral code {code_id}"
            )));
        }
        enrollment.referral = None;
        enrollment.notes.push(note);
        enrollment.updated_at = at;
        Ok(enrollment.clone())
    }

    async fn remove_enrollment(&self, id: Uuid) -> StorageResult<bool> {
        Ok(self.write()?.enrollments.remove(&id).is_some())
    }

    async fn transition_enrollment(
        &self,
        id: Uuid,
        expected: EnrollmentStatus,
        next: EnrollmentStatus,
        payment: Option<PaymentStatus>,
        at: DateTime<Utc>,
    ) -> StorageResult<Enrollment> {
        let mut guard = self.write()?;
        let enrollment = guard
            .enrollments
            .get_mut(&id)
            .ok_or_else(|| StorageError::NotFound(format!("enrollment {id}")))?;
        if enrollment.status != expected {
            return Err(StorageError::Conflict(format!(
                "enrollment {id} is {}, expected {}",
                enrollment.status.as_str(),
                expected.as_str()
            )));
        }
        enrollment.status = next;
        if let Some(payment) = payment {
            enrollment.payment_status = payment;
        }
        enrollment.updated_at = at;
        Ok(enrollment.clone())
    }

    async fn enrollments_for_participant(
        &self,
        participant_id: Uuid,
    ) -> StorageResult<Vec<Enrollment>> {
        let guard = self.read()?;
        let mut values = guard
            .enrollments
            .values()
            .filter(|e| e.participant_id == participant_id)
            .cloned()
            .collect::<Vec<_>>();
        values.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(values)
    }
}

#[async_trait]
impl TrackingStore for InMemoryReferralStorage {
    async fn insert_tracking(
        &self,
        tracking: NewTracking,
        at: DateTime<Utc>,
    ) -> StorageResult<ReferralTracking> {
        let mut guard = self.write()?;
        if guard.tracking.contains_key(&tracking.enrollment_id) {
            return Err(StorageError::Conflict(format!(
                "tracking for enrollment {} already exists",
                tracking.enrollment_id
            )));
        }
        let record = tracking_record(tracking, at);
        guard.tracking.insert(record.enrollment_id, record.clone());
        Ok(record)
    }

    async fn record_use(
        &self,
        tracking: NewTracking,
        at: DateTime<Utc>,
    ) -> StorageResult<RecordedUse> {
        let mut guard = self.write()?;
        if let Some(existing) = guard.tracking.get(&tracking.enrollment_id) {
            return Ok(RecordedUse::AlreadyRecorded(existing.clone()));
        }

        let code = guard
            .codes
            .get_mut(&tracking.code_id)
            .ok_or_else(|| StorageError::NotFound(format!("referral code {}", tracking.code_id)))?;
        if !code.is_active || code.quota_exhausted() {
            return Ok(RecordedUse::Exhausted);
        }
        code.current_uses += 1;
        let current_uses = code.current_uses;

        let record = tracking_record(tracking, at);
        guard.tracking.insert(record.enrollment_id, record.clone());
        Ok(RecordedUse::Recorded {
            tracking: record,
            current_uses,
        })
    }

    async fn tracking_for_enrollment(
        &self,
        enrollment_id: Uuid,
    ) -> StorageResult<Option<ReferralTracking>> {
        Ok(self.read()?.tracking.get(&enrollment_id).cloned())
    }

    async fn set_tracking_status(
        &self,
        enrollment_id: Uuid,
        status: TrackingStatus,
        at: DateTime<Utc>,
    ) -> StorageResult<Option<ReferralTracking>> {
        let mut guard = self.write()?;
        Ok(guard.tracking.get_mut(&enrollment_id).map(|row| {
            row.status = status;
            row.updated_at = at;
            row.clone()
        }))
    }

    async fn list_tracking(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> StorageResult<Vec<ReferralTracking>> {
        let guard = self.read()?;
        let mut values = guard
            .tracking
            .values()
            .filter(|row| since.map(|from| row.created_at >= from).unwrap_or(true))
            .cloned()
            .collect::<Vec<_>>();
        values.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(values)
    }
}

fn tracking_record(tracking: NewTracking, at: DateTime<Utc>) -> ReferralTracking {
    ReferralTracking {
        id: Uuid::new_v4(),
        code_id: tracking.code_id,
        trainer_id: tracking.trainer_id,
        participant_id: tracking.participant_id,
        enrollment_id: tracking.enrollment_id,
        program_id: tracking.program_id,
        discount_applied: tracking.discount_applied,
        commission_earned: tracking.commission_earned,
        status: tracking.status,
        created_at: at,
        updated_at: at,
    }
}
