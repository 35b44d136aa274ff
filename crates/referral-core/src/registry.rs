use crate::error::{ReferralError, ReferralResult};
use crate::storage::{CodeStore, ConsumeOutcome, ReferralStorage, StorageError};
use crate::types::{RateRule, ReferralCode};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// A code that passed eligibility checks at a given instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidCode {
    pub code_id: Uuid,
    pub code: String,
    pub trainer_id: Uuid,
    pub discount: RateRule,
    pub commission: RateRule,
    pub max_uses: Option<u32>,
    pub current_uses: u32,
    pub valid_until: Option<DateTime<Utc>>,
}

impl From<&ReferralCode> for ValidCode {
    fn from(code: &ReferralCode) -> Self {
        Self {
            code_id: code.id,
            code: code.code.clone(),
            trainer_id: code.trainer_id,
            discount: code.discount,
            commission: code.commission,
            max_uses: code.max_uses,
            current_uses: code.current_uses,
            valid_until: code.valid_until,
        }
    }
}

/// Canonical form used for storage and lookup.
pub fn normalize_code(raw: &str) -> String {
    raw.trim().to_ascii_uppercase()
}

/// Read-side eligibility checks plus the explicit usage increment.
#[derive(Clone)]
pub struct CodeRegistry {
    store: Arc<dyn ReferralStorage>,
}

impl CodeRegistry {
    pub fn new(store: Arc<dyn ReferralStorage>) -> Self {
        Self { store }
    }

    pub async fn validate(&self, code: &str) -> ReferralResult<ValidCode> {
        self.validate_at(code, Utc::now()).await
    }

    /// Check a code without side effects.
    ///
    /// Expiry is checked before quota so an expired code always reports `Expired`.
    pub async fn validate_at(&self, code: &str, now: DateTime<Utc>) -> ReferralResult<ValidCode> {
        let normalized = normalize_code(code);
        if normalized.is_empty() {
            return Err(ReferralError::CodeNotFound(normalized));
        }

        let record = match self.store.find_code(&normalized).await? {
            Some(record) if record.is_active => record,
            _ => {
                debug!(code = %normalized, "referral code not found or inactive");
                return Err(ReferralError::CodeNotFound(normalized));
            }
        };

        if record.is_expired_at(now) {
            if let Some(valid_until) = record.valid_until {
                return Err(ReferralError::Expired {
                    code: record.code,
                    valid_until,
                });
            }
        }
        if let Some(max_uses) = record.max_uses {
            if record.current_uses >= max_uses {
                return Err(ReferralError::QuotaExceeded {
                    code: record.code,
                    max_uses,
                });
            }
        }

        Ok(ValidCode::from(&record))
    }

    /// Atomically take one use of `code`. Returns the new usage count.
    pub async fn consume(&self, code: &ValidCode) -> ReferralResult<u32> {
        match self.store.consume_code(code.code_id).await {
            Ok(ConsumeOutcome::Consumed { current_uses }) => {
                debug!(code = %code.code, current_uses, "referral code consumed");
                Ok(current_uses)
            }
            Ok(ConsumeOutcome::Exhausted) => Err(ReferralError::QuotaExceeded {
                code: code.code.clone(),
                max_uses: code.max_uses.unwrap_or(code.current_uses),
            }),
            Err(StorageError::NotFound(_)) => {
                Err(ReferralError::CodeNotFound(code.code.clone()))
            }
            Err(other) => Err(other.into()),
        }
    }

    /// Codes are never deleted; deactivation frees the owner to hold a new one.
    pub async fn deactivate(&self, code_id: Uuid) -> ReferralResult<ReferralCode> {
        let code = match self.store.deactivate_code(code_id).await {
            Ok(code) => code,
            Err(StorageError::NotFound(_)) => {
                return Err(ReferralError::not_found("referral code", code_id))
            }
            Err(other) => return Err(other.into()),
        };
        info!(code = %code.code, trainer = %code.trainer_id, "referral code deactivated");
        Ok(code)
    }
}
