use crate::error::{ReferralError, ReferralResult};
use crate::types::{EnrollmentStatus, PaymentStatus, TrackingStatus};
use serde::{Deserialize, Serialize};

/// Everything that can move an enrollment (and its tracking row) between states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrollmentEvent {
    /// First registration. `free` is true when the final price is zero.
    Registered { free: bool },
    /// A referral code was attached to an existing enrollment.
    ReferralLinked,
    Approve,
    Reject,
    Complete,
    MarkPaid,
}

impl EnrollmentEvent {
    pub fn name(self) -> &'static str {
        match self {
            Self::Registered { .. } => "registered",
            Self::ReferralLinked => "referral_linked",
            Self::Approve => "approve",
            Self::Reject => "reject",
            Self::Complete => "complete",
            Self::MarkPaid => "mark_paid",
        }
    }
}

/// Target state produced by [`next_status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub enrollment: EnrollmentStatus,
    /// `None` leaves the payment status untouched.
    pub payment: Option<PaymentStatus>,
    pub tracking: TrackingStatus,
}

/// Tracking status implied by an enrollment status.
pub fn tracking_status_for(status: EnrollmentStatus) -> TrackingStatus {
    match status {
        EnrollmentStatus::Pending => TrackingStatus::Pending,
        EnrollmentStatus::Approved | EnrollmentStatus::Completed => TrackingStatus::Confirmed,
        EnrollmentStatus::Rejected => TrackingStatus::Cancelled,
    }
}

/// The single place enrollment and tracking statuses are decided.
///
/// `current` is `None` before the enrollment exists. Any pair not listed here is
/// an [`ReferralError::InvalidTransition`].
pub fn next_status(
    current: Option<EnrollmentStatus>,
    event: EnrollmentEvent,
) -> ReferralResult<Transition> {
    use EnrollmentEvent as E;
    use EnrollmentStatus as S;

    let (enrollment, payment) = match (current, event) {
        (None, E::Registered { free: true }) => (S::Approved, Some(PaymentStatus::Paid)),
        (None, E::Registered { free: false }) => (S::Pending, Some(PaymentStatus::Unpaid)),
        (Some(status), E::ReferralLinked) => (status, None),
        (Some(S::Pending), E::Approve) => (S::Approved, None),
        (Some(S::Pending | S::Approved), E::Reject) => (S::Rejected, None),
        (Some(S::Approved), E::Complete) => (S::Completed, None),
        (Some(status @ (S::Pending | S::Approved)), E::MarkPaid) => {
            (status, Some(PaymentStatus::Paid))
        }
        (current, event) => {
            return Err(ReferralError::InvalidTransition(format!(
                "{} cannot be applied to {}",
                event.name(),
                current.map(S::as_str).unwrap_or("a missing enrollment")
            )))
        }
    };

    Ok(Transition {
        enrollment,
        payment,
        tracking: tracking_status_for(enrollment),
    })
}
