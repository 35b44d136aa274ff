use crate::storage::StorageError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result alias for referral engine operations.
pub type ReferralResult<T> = Result<T, ReferralError>;

/// A single rejected input field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Referral engine errors.
///
/// Code-eligibility failures (`CodeNotFound`, `Expired`, `QuotaExceeded`) keep their
/// precise variant all the way to the caller; see [`ReferralError::reason`].
#[derive(Debug, Error)]
pub enum ReferralError {
    #[error("validation failed: {}", render_fields(.0))]
    Validation(Vec<FieldError>),

    #[error("{entity} '{key}' not found")]
    NotFound { entity: &'static str, key: String },

    #[error("referral code '{0}' not found or inactive")]
    CodeNotFound(String),

    #[error("referral code '{code}' expired at {valid_until}")]
    Expired {
        code: String,
        valid_until: DateTime<Utc>,
    },

    #[error("referral code '{code}' reached its usage limit of {max_uses}")]
    QuotaExceeded { code: String, max_uses: u32 },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid status transition: {0}")]
    InvalidTransition(String),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("referral code generation exhausted after {attempts} attempts")]
    GenerationExhausted { attempts: u32 },
}

impl ReferralError {
    pub fn not_found(entity: &'static str, key: impl ToString) -> Self {
        Self::NotFound {
            entity,
            key: key.to_string(),
        }
    }

    pub fn invalid_field(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation(vec![FieldError::new(field, message)])
    }

    /// Machine-readable reason code for programmatic callers.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::CodeNotFound(_) => "CODE_NOT_FOUND",
            Self::Expired { .. } => "CODE_EXPIRED",
            Self::QuotaExceeded { .. } => "QUOTA_EXCEEDED",
            Self::Conflict(_) => "CONFLICT",
            Self::InvalidTransition(_) => "INVALID_TRANSITION",
            Self::Persistence(_) => "PERSISTENCE_ERROR",
            Self::GenerationExhausted { .. } => "GENERATION_EXHAUSTED",
        }
    }

    /// True for failures of the referral code itself rather than of the request.
    pub fn is_code_rejection(&self) -> bool {
        matches!(
            self,
            Self::CodeNotFound(_) | Self::Expired { .. } | Self::QuotaExceeded { .. }
        )
    }
}

impl From<StorageError> for ReferralError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(key) => Self::NotFound {
                entity: "record",
                key,
            },
            StorageError::Conflict(message) => Self::Conflict(message),
            StorageError::InvalidInput(message) => {
                Self::Validation(vec![FieldError::new("input", message)])
            }
            other => Self::Persistence(other.to_string()),
        }
    }
}

fn render_fields(fields: &[FieldError]) -> String {
    fields
        .iter()
        .map(|f| format!("{}: {}", f.field, f.message))
        .collect::<Vec<_>>()
        .join("; ")
}
