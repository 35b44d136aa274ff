use crate::error::FieldError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Publication state of a training program (owned by the catalog, read-only here).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgramStatus {
    Draft,
    Published,
    Archived,
}

impl ProgramStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Published => "published",
            Self::Archived => "archived",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "draft" => Some(Self::Draft),
            "published" => Some(Self::Published),
            "archived" => Some(Self::Archived),
            _ => None,
        }
    }
}

/// Training program as seen by the referral engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Program {
    pub id: Uuid,
    pub title: String,
    /// Price in the currency's smallest unit. Never negative.
    pub price: i64,
    pub status: ProgramStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfileRole {
    Participant,
    Trainer,
    Manager,
    Admin,
}

impl ProfileRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Participant => "participant",
            Self::Trainer => "trainer",
            Self::Manager => "manager",
            Self::Admin => "admin",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "participant" => Some(Self::Participant),
            "trainer" => Some(Self::Trainer),
            "manager" => Some(Self::Manager),
            "admin" => Some(Self::Admin),
            _ => None,
        }
    }
}

/// Authenticated user profile, supplied by the identity collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub id: Uuid,
    pub full_name: String,
    pub email: String,
    pub role: ProfileRole,
}

/// Discount or commission rule.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum RateRule {
    /// Percentage of the program price, `0..=100`.
    Percentage(f64),
    /// Fixed amount in the currency's smallest unit.
    Fixed(i64),
}

impl Default for RateRule {
    fn default() -> Self {
        Self::none()
    }
}

impl RateRule {
    pub fn none() -> Self {
        Self::Fixed(0)
    }

    pub fn is_zero(&self) -> bool {
        match *self {
            Self::Percentage(pct) => pct == 0.0,
            Self::Fixed(amount) => amount == 0,
        }
    }

    /// Raw amount this rule yields against `price`, floored at zero.
    pub fn amount_for(&self, price: i64) -> i64 {
        let raw = match *self {
            Self::Percentage(pct) => (price as f64 * pct / 100.0).round() as i64,
            Self::Fixed(amount) => amount,
        };
        raw.max(0)
    }

    pub fn check(&self, field: &str) -> Option<FieldError> {
        match *self {
            Self::Percentage(pct) if !pct.is_finite() || !(0.0..=100.0).contains(&pct) => Some(
                FieldError::new(field, "percentage must be between 0 and 100"),
            ),
            Self::Fixed(amount) if amount < 0 => {
                Some(FieldError::new(field, "fixed amount must not be negative"))
            }
            _ => None,
        }
    }
}

/// Shareable referral code owned by a trainer (or another referring user).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferralCode {
    pub id: Uuid,
    pub code: String,
    pub trainer_id: Uuid,
    pub is_active: bool,
    pub valid_until: Option<DateTime<Utc>>,
    pub max_uses: Option<u32>,
    pub current_uses: u32,
    pub discount: RateRule,
    pub commission: RateRule,
    pub created_at: DateTime<Utc>,
}

impl ReferralCode {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.valid_until.map(|until| until < now).unwrap_or(false)
    }

    pub fn quota_exhausted(&self) -> bool {
        self.max_uses
            .map(|max| self.current_uses >= max)
            .unwrap_or(false)
    }
}

/// Insert payload for a referral code. Usage always starts at zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewReferralCode {
    pub code: String,
    pub trainer_id: Uuid,
    #[serde(default)]
    pub valid_until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub max_uses: Option<u32>,
    #[serde(default)]
    pub discount: RateRule,
    #[serde(default)]
    pub commission: RateRule,
}

impl NewReferralCode {
    /// Self-service code: unlimited, no expiry, zero embedded rates.
    pub fn issued(code: impl Into<String>, trainer_id: Uuid) -> Self {
        Self {
            code: code.into(),
            trainer_id,
            valid_until: None,
            max_uses: None,
            discount: RateRule::none(),
            commission: RateRule::none(),
        }
    }
}

/// Admin-configured discount/commission rule scoped to one program.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferralPolicy {
    pub id: Uuid,
    pub program_id: Uuid,
    pub name: String,
    pub discount: RateRule,
    pub commission: RateRule,
    pub max_uses_per_code: Option<u32>,
    pub valid_from: Option<DateTime<Utc>>,
    pub valid_until: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ReferralPolicy {
    pub fn is_effective_at(&self, now: DateTime<Utc>) -> bool {
        self.is_active
            && self.valid_from.map(|from| from <= now).unwrap_or(true)
            && self.valid_until.map(|until| now <= until).unwrap_or(true)
    }
}

/// Create/update payload for a referral policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyDraft {
    pub program_id: Uuid,
    pub name: String,
    pub discount: RateRule,
    pub commission: RateRule,
    #[serde(default)]
    pub max_uses_per_code: Option<u32>,
    #[serde(default)]
    pub valid_from: Option<DateTime<Utc>>,
    #[serde(default)]
    pub valid_until: Option<DateTime<Utc>>,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

fn default_true() -> bool {
    true
}

/// Contact/profile fields a participant submits at registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantFields {
    pub user_id: Uuid,
    pub full_name: String,
    pub email: String,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub organization: Option<String>,
}

impl ParticipantFields {
    pub fn check(&self) -> Vec<FieldError> {
        let mut errors = Vec::new();
        if self.user_id.is_nil() {
            errors.push(FieldError::new("user_id", "must not be nil"));
        }
        if self.full_name.trim().is_empty() {
            errors.push(FieldError::new("full_name", "must not be empty"));
        }
        let email = self.email.trim();
        if email.is_empty() || !email.contains('@') {
            errors.push(FieldError::new("email", "must be a valid email address"));
        }
        errors
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    pub id: Uuid,
    pub user_id: Uuid,
    pub full_name: String,
    pub email: String,
    pub phone: Option<String>,
    pub organization: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrollmentStatus {
    Pending,
    Approved,
    Rejected,
    Completed,
}

impl EnrollmentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Completed => "completed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Unpaid,
    Paid,
}

impl PaymentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unpaid => "unpaid",
            Self::Paid => "paid",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "unpaid" => Some(Self::Unpaid),
            "paid" => Some(Self::Paid),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackingStatus {
    Pending,
    Confirmed,
    Cancelled,
}

impl TrackingStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Confirmed => "confirmed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "confirmed" => Some(Self::Confirmed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

/// Referral attribution carried by an enrollment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferralLinkage {
    pub code: String,
    pub code_id: Uuid,
    pub trainer_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Enrollment {
    pub id: Uuid,
    pub program_id: Uuid,
    pub participant_id: Uuid,
    pub status: EnrollmentStatus,
    pub payment_status: PaymentStatus,
    pub amount_paid: i64,
    pub referral: Option<ReferralLinkage>,
    pub notes: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewEnrollment {
    pub program_id: Uuid,
    pub participant_id: Uuid,
    pub status: EnrollmentStatus,
    pub payment_status: PaymentStatus,
    pub referral: Option<ReferralLinkage>,
    pub notes: Vec<String>,
}

/// Ledger fact connecting one code use to one enrollment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferralTracking {
    pub id: Uuid,
    pub code_id: Uuid,
    pub trainer_id: Uuid,
    pub participant_id: Uuid,
    pub enrollment_id: Uuid,
    pub program_id: Uuid,
    pub discount_applied: i64,
    /// Stored as zero at creation; settlement happens elsewhere.
    pub commission_earned: i64,
    pub status: TrackingStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTracking {
    pub code_id: Uuid,
    pub trainer_id: Uuid,
    pub participant_id: Uuid,
    pub enrollment_id: Uuid,
    pub program_id: Uuid,
    pub discount_applied: i64,
    pub commission_earned: i64,
    pub status: TrackingStatus,
}
