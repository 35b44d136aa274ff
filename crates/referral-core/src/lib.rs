//! Referral-driven enrollment and commission engine.
//!
//! This crate owns the invariants of the referral subsystem of the training platform:
//! - referral code eligibility (active, unexpired, under quota) and atomic consumption
//! - one authoritative discount/commission resolution per request
//! - collision-safe issuance of a trainer's shareable code
//! - exactly-once enrollment and referral-tracking writes
//! - time-windowed leaderboard aggregation
//!
//! Persistence goes through the [`storage`] traits; the in-memory adapter is always
//! available and the PostgreSQL adapter is enabled with the `postgres` feature.

#![deny(unsafe_code)]
#![warn(rust_2018_idioms)]

pub mod engine;
pub mod error;
pub mod flow;
pub mod issuer;
pub mod ledger;
pub mod notify;
pub mod orchestrator;
pub mod policy;
pub mod registry;
pub mod stats;
pub mod storage;
pub mod types;

pub use engine::{ReferralEngine, ReferralEngineConfig};
pub use error::{FieldError, ReferralError, ReferralResult};
pub use flow::{next_status, tracking_status_for, EnrollmentEvent, Transition};
pub use issuer::{CodeGenerator, CodeIssuer, IssuerConfig, RandomCodeGenerator};
pub use ledger::{Attribution, TrackingLedger};
pub use notify::{
    EnrollmentNotice, EnrollmentNotifier, LogNotifier, NotifierRegistry, NotifyError,
};
pub use orchestrator::{EnrollmentOrchestrator, EnrollmentOutcome, EnrollmentRequest, StatusChange};
pub use policy::{PolicyResolver, PriceQuote, RatePrecedence, RateSource};
pub use registry::{normalize_code, CodeRegistry, ValidCode};
pub use stats::{LeaderboardPeriod, LeaderboardScope, LeaderboardStat, StatsAggregator};
pub use storage::{
    InMemoryReferralStorage, ReferralStorage, StorageConfig, StorageError, StorageResult,
};
pub use types::{
    Enrollment, EnrollmentStatus, NewEnrollment, NewReferralCode, NewTracking, Participant,
    ParticipantFields, PaymentStatus, PolicyDraft, Profile, ProfileRole, Program, ProgramStatus,
    RateRule, ReferralCode, ReferralLinkage, ReferralPolicy, ReferralTracking, TrackingStatus,
};
