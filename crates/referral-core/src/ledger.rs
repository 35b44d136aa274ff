use crate::error::{ReferralError, ReferralResult};
use crate::flow::tracking_status_for;
use crate::registry::ValidCode;
use crate::storage::{RecordedUse, ReferralStorage, StorageError, TrackingStore};
use crate::types::{Enrollment, NewTracking, ReferralTracking};
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// A tracking row plus whether this call created it.
#[derive(Debug, Clone, PartialEq)]
pub struct Attribution {
    pub tracking: ReferralTracking,
    /// False when the row was already on file and no code use was taken.
    pub fresh: bool,
}

/// Append-once ledger of referral attributions, one row per enrollment.
#[derive(Clone)]
pub struct TrackingLedger {
    store: Arc<dyn ReferralStorage>,
}

impl TrackingLedger {
    pub fn new(store: Arc<dyn ReferralStorage>) -> Self {
        Self { store }
    }

    /// Record the attribution for `enrollment` and take one use of `code`, or
    /// return the row already on file without touching the code.
    ///
    /// Commission is stored as zero; settlement happens outside this engine.
    pub async fn record(
        &self,
        enrollment: &Enrollment,
        code: &ValidCode,
        discount_applied: i64,
    ) -> ReferralResult<Attribution> {
        let row = NewTracking {
            code_id: code.code_id,
            trainer_id: code.trainer_id,
            participant_id: enrollment.participant_id,
            enrollment_id: enrollment.id,
            program_id: enrollment.program_id,
            discount_applied,
            commission_earned: 0,
            status: tracking_status_for(enrollment.status),
        };

        match self.store.record_use(row, Utc::now()).await {
            Ok(RecordedUse::Recorded {
                tracking,
                current_uses,
            }) => {
                info!(
                    enrollment = %enrollment.id,
                    trainer = %tracking.trainer_id,
                    code = %code.code,
                    current_uses,
                    status = tracking.status.as_str(),
                    "referral tracked"
                );
                Ok(Attribution {
                    tracking,
                    fresh: true,
                })
            }
            Ok(RecordedUse::AlreadyRecorded(tracking)) => {
                debug!(enrollment = %enrollment.id, "tracking already recorded");
                Ok(Attribution {
                    tracking,
                    fresh: false,
                })
            }
            Ok(RecordedUse::Exhausted) => Err(ReferralError::QuotaExceeded {
                code: code.code.clone(),
                max_uses: code.max_uses.unwrap_or(code.current_uses),
            }),
            Err(StorageError::NotFound(_)) => Err(ReferralError::CodeNotFound(code.code.clone())),
            Err(other) => Err(other.into()),
        }
    }

    /// Re-derive the tracking status after an enrollment transition.
    ///
    /// Returns `None` for enrollments without a referral.
    pub async fn sync_status(
        &self,
        enrollment: &Enrollment,
    ) -> ReferralResult<Option<ReferralTracking>> {
        let status = tracking_status_for(enrollment.status);
        let updated = self
            .store
            .set_tracking_status(enrollment.id, status, Utc::now())
            .await?;
        if let Some(row) = &updated {
            debug!(enrollment = %enrollment.id, status = row.status.as_str(), "tracking synced");
        }
        Ok(updated)
    }

    pub async fn for_enrollment(&self, enrollment_id: Uuid) -> ReferralResult<Option<ReferralTracking>> {
        Ok(self.store.tracking_for_enrollment(enrollment_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{CodeStore, EnrollmentStore, InMemoryReferralStorage};
    use crate::types::{
        EnrollmentStatus, NewEnrollment, NewReferralCode, PaymentStatus, RateRule, TrackingStatus,
    };

    async fn seed_code(store: &InMemoryReferralStorage, max_uses: Option<u32>) -> ValidCode {
        let record = store
            .insert_code(
                NewReferralCode {
                    max_uses,
                    discount: RateRule::Percentage(10.0),
                    commission: RateRule::Percentage(5.0),
                    ..NewReferralCode::issued("ABC123", Uuid::new_v4())
                },
                Utc::now(),
            )
            .await
            .unwrap();
        ValidCode::from(&record)
    }

    async fn seed_enrollment(store: &InMemoryReferralStorage, status: EnrollmentStatus) -> Enrollment {
        store
            .insert_enrollment(
                NewEnrollment {
                    program_id: Uuid::new_v4(),
                    participant_id: Uuid::new_v4(),
                    status,
                    payment_status: PaymentStatus::Unpaid,
                    referral: None,
                    notes: Vec::new(),
                },
                Utc::now(),
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn record_is_idempotent_per_enrollment() {
        let store = Arc::new(InMemoryReferralStorage::new());
        let ledger = TrackingLedger::new(store.clone());
        let enrollment = seed_enrollment(&store, EnrollmentStatus::Pending).await;
        let code = seed_code(&store, None).await;

        let first = ledger.record(&enrollment, &code, 50_000).await.unwrap();
        let second = ledger.record(&enrollment, &code, 50_000).await.unwrap();
        assert!(first.fresh);
        assert!(!second.fresh);
        assert_eq!(first.tracking.id, second.tracking.id);
        assert_eq!(first.tracking.commission_earned, 0);
        assert_eq!(first.tracking.status, TrackingStatus::Pending);
        assert_eq!(store.get_code(code.code_id).await.unwrap().unwrap().current_uses, 1);
    }

    #[tokio::test]
    async fn spent_code_records_nothing() {
        let store = Arc::new(InMemoryReferralStorage::new());
        let ledger = TrackingLedger::new(store.clone());
        let code = seed_code(&store, Some(1)).await;
        let first = seed_enrollment(&store, EnrollmentStatus::Pending).await;
        let second = seed_enrollment(&store, EnrollmentStatus::Pending).await;

        ledger.record(&first, &code, 10).await.unwrap();
        assert!(matches!(
            ledger.record(&second, &code, 10).await,
            Err(ReferralError::QuotaExceeded { max_uses: 1, .. })
        ));
        assert!(ledger.for_enrollment(second.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn approved_enrollment_is_confirmed_at_creation() {
        let store = Arc::new(InMemoryReferralStorage::new());
        let ledger = TrackingLedger::new(store.clone());
        let enrollment = seed_enrollment(&store, EnrollmentStatus::Approved).await;
        let code = seed_code(&store, None).await;

        let row = ledger.record(&enrollment, &code, 0).await.unwrap();
        assert_eq!(row.tracking.status, TrackingStatus::Confirmed);
    }

    #[tokio::test]
    async fn sync_follows_enrollment_status() {
        let store = Arc::new(InMemoryReferralStorage::new());
        let ledger = TrackingLedger::new(store.clone());
        let mut enrollment = seed_enrollment(&store, EnrollmentStatus::Pending).await;
        let code = seed_code(&store, None).await;
        ledger.record(&enrollment, &code, 10).await.unwrap();

        enrollment.status = EnrollmentStatus::Rejected;
        let synced = ledger.sync_status(&enrollment).await.unwrap().unwrap();
        assert_eq!(synced.status, TrackingStatus::Cancelled);

        let unattributed = seed_enrollment(&store, EnrollmentStatus::Pending).await;
        assert!(ledger.sync_status(&unattributed).await.unwrap().is_none());
    }
}
