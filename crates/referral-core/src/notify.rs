use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::types::{Enrollment, EnrollmentStatus, Participant};

/// What a notification channel learns about a new or newly attributed enrollment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrollmentNotice {
    pub enrollment_id: Uuid,
    pub program_id: Uuid,
    pub participant_name: String,
    pub participant_email: String,
    pub status: EnrollmentStatus,
    pub referral_code: Option<String>,
    pub trainer_id: Option<Uuid>,
    pub final_price: i64,
    pub discount_applied: i64,
}

impl EnrollmentNotice {
    pub fn new(
        enrollment: &Enrollment,
        participant: &Participant,
        final_price: i64,
        discount_applied: i64,
    ) -> Self {
        Self {
            enrollment_id: enrollment.id,
            program_id: enrollment.program_id,
            participant_name: participant.full_name.clone(),
            participant_email: participant.email.clone(),
            status: enrollment.status,
            referral_code: enrollment.referral.as_ref().map(|link| link.code.clone()),
            trainer_id: enrollment.referral.as_ref().map(|link| link.trainer_id),
            final_price,
            discount_applied,
        }
    }
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("{channel} delivery failed: {message}")]
    Delivery { channel: String, message: String },
}

/// Outbound notification channel (mail, chat, webhook).
#[async_trait]
pub trait EnrollmentNotifier: Send + Sync {
    fn channel(&self) -> &'static str;

    async fn notify(&self, notice: &EnrollmentNotice) -> Result<(), NotifyError>;
}

/// Channels keyed by name. Delivery is fire-and-forget.
#[derive(Default)]
pub struct NotifierRegistry {
    notifiers: RwLock<BTreeMap<String, Arc<dyn EnrollmentNotifier>>>,
}

impl NotifierRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a channel, replacing any previous one with the same name.
    pub fn register(&self, notifier: Arc<dyn EnrollmentNotifier>) {
        let mut guard = self
            .notifiers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.insert(notifier.channel().to_string(), notifier);
    }

    pub fn channels(&self) -> Vec<String> {
        self.notifiers
            .read()
            .map(|guard| guard.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Spawn one delivery task per channel. Failures are logged, never returned.
    pub fn dispatch(&self, notice: EnrollmentNotice) -> Vec<JoinHandle<()>> {
        let notifiers = match self.notifiers.read() {
            Ok(guard) => guard.values().cloned().collect::<Vec<_>>(),
            Err(_) => {
                warn!(enrollment = %notice.enrollment_id, "notifier registry unavailable");
                return Vec::new();
            }
        };

        notifiers
            .into_iter()
            .map(|notifier| {
                let notice = notice.clone();
                tokio::spawn(async move {
                    if let Err(err) = notifier.notify(&notice).await {
                        warn!(
                            channel = notifier.channel(),
                            enrollment = %notice.enrollment_id,
                            error = %err,
                            "enrollment notification failed"
                        );
                    }
                })
            })
            .collect()
    }
}

/// Writes notices to the tracing pipeline.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl EnrollmentNotifier for LogNotifier {
    fn channel(&self) -> &'static str {
        "log"
    }

    async fn notify(&self, notice: &EnrollmentNotice) -> Result<(), NotifyError> {
        info!(
            enrollment = %notice.enrollment_id,
            program = %notice.program_id,
            status = notice.status.as_str(),
            referral = notice.referral_code.as_deref().unwrap_or("-"),
            final_price = notice.final_price,
            "enrollment registered"
        );
        Ok(())
    }
}
