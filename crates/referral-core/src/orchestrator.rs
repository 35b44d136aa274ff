//! Registration workflow.
//!
//! Order of effects for one `enroll` call:
//! 1. validate the code and resolve the price (no writes)
//! 2. upsert the participant
//! 3. create the enrollment, or attach the referral to the existing one
//! 4. consume one code use and record tracking in one store step; on a lost
//!    race undo step 3
//! 5. notify
//!
//! A code use is counted exactly when the tracking row is written, so re-invoking
//! `enroll` after an interruption at any step converges to the same state.

use crate::error::{FieldError, ReferralError, ReferralResult};
use crate::flow::{next_status, EnrollmentEvent};
use crate::ledger::TrackingLedger;
use crate::notify::{EnrollmentNotice, NotifierRegistry};
use crate::policy::{PolicyResolver, PriceQuote, RateSource};
use crate::registry::{normalize_code, CodeRegistry, ValidCode};
use crate::storage::{
    CodeStore, EnrollmentStore, ParticipantStore, ProgramStore, ReferralStorage, StorageError,
};
use crate::types::{
    Enrollment, NewEnrollment, Participant, ParticipantFields, PaymentStatus, Program,
    ReferralLinkage, ReferralTracking,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrollmentRequest {
    pub program_id: Uuid,
    pub participant: ParticipantFields,
    #[serde(default)]
    pub referral_code: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrollmentOutcome {
    pub enrollment: Enrollment,
    pub tracking: Option<ReferralTracking>,
    pub final_price: i64,
    pub discount_applied: i64,
    /// Reported only; commission is not settled here.
    pub commission_computed: i64,
    pub rate_source: RateSource,
    /// True when this call committed nothing new: the tracking row (or, without a
    /// referral, the enrollment) was already on file.
    pub replayed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusChange {
    pub enrollment: Enrollment,
    pub tracking: Option<ReferralTracking>,
}

enum EnrollmentWrite {
    Created(Enrollment),
    Linked(Enrollment),
    Unchanged(Enrollment),
}

impl EnrollmentWrite {
    fn enrollment(&self) -> &Enrollment {
        match self {
            Self::Created(e) | Self::Linked(e) | Self::Unchanged(e) => e,
        }
    }

    fn into_enrollment(self) -> Enrollment {
        match self {
            Self::Created(e) | Self::Linked(e) | Self::Unchanged(e) => e,
        }
    }

    fn wrote(&self) -> bool {
        !matches!(self, Self::Unchanged(_))
    }
}

#[derive(Clone)]
pub struct EnrollmentOrchestrator {
    store: Arc<dyn ReferralStorage>,
    registry: CodeRegistry,
    resolver: PolicyResolver,
    ledger: TrackingLedger,
    notifiers: Arc<NotifierRegistry>,
}

impl EnrollmentOrchestrator {
    pub fn new(
        store: Arc<dyn ReferralStorage>,
        registry: CodeRegistry,
        resolver: PolicyResolver,
        ledger: TrackingLedger,
        notifiers: Arc<NotifierRegistry>,
    ) -> Self {
        Self {
            store,
            registry,
            resolver,
            ledger,
            notifiers,
        }
    }

    pub async fn enroll(&self, request: EnrollmentRequest) -> ReferralResult<EnrollmentOutcome> {
        let mut errors = request.participant.check();
        if request.program_id.is_nil() {
            errors.push(FieldError::new("program_id", "must not be nil"));
        }
        if !errors.is_empty() {
            return Err(ReferralError::Validation(errors));
        }

        // Blank form fields mean "no referral".
        let presented = request
            .referral_code
            .as_deref()
            .map(normalize_code)
            .filter(|code| !code.is_empty());

        let code = match presented.as_deref() {
            None => None,
            Some(raw) => match self.registry.validate(raw).await {
                Ok(valid) => Some(valid),
                Err(err @ ReferralError::QuotaExceeded { .. }) => {
                    if let Some(outcome) = self.replay(&request, raw).await? {
                        return Ok(outcome);
                    }
                    return Err(err);
                }
                Err(err) => return Err(err),
            },
        };

        let program = self.program(request.program_id).await?;
        let quote = self.resolver.resolve(&program, code.as_ref()).await?;
        let participant = self
            .store
            .upsert_participant(&request.participant, Utc::now())
            .await?;

        let write = self
            .write_enrollment(&program, &participant, code.as_ref(), &quote)
            .await?;

        let (tracking, tracked_now) = match code.as_ref() {
            Some(valid) => {
                match self
                    .ledger
                    .record(write.enrollment(), valid, quote.discount_amount)
                    .await
                {
                    Ok(attribution) => (Some(attribution.tracking), attribution.fresh),
                    Err(err) => {
                        if err.is_code_rejection() {
                            self.compensate(&write, valid).await;
                        }
                        return Err(err);
                    }
                }
            }
            None => (self.ledger.for_enrollment(write.enrollment().id).await?, false),
        };

        // With a referral, the tracking row is the commit point.
        let committed = if code.is_some() {
            tracked_now
        } else {
            write.wrote()
        };
        if committed {
            let notice = EnrollmentNotice::new(
                write.enrollment(),
                &participant,
                quote.final_price,
                quote.discount_amount,
            );
            // Handles are dropped; delivery never blocks or fails registration.
            drop(self.notifiers.dispatch(notice));
        }

        let replayed = !committed;
        let enrollment = write.into_enrollment();
        info!(
            enrollment = %enrollment.id,
            program = %program.id,
            participant = %participant.id,
            status = enrollment.status.as_str(),
            referral = presented.as_deref().unwrap_or("-"),
            final_price = quote.final_price,
            replayed,
            "enrollment processed"
        );

        Ok(EnrollmentOutcome {
            enrollment,
            tracking,
            final_price: quote.final_price,
            discount_applied: quote.discount_amount,
            commission_computed: quote.commission_amount,
            rate_source: quote.source,
            replayed,
        })
    }

    /// Apply an external approval action and keep tracking in step.
    pub async fn apply_status_event(
        &self,
        enrollment_id: Uuid,
        event: EnrollmentEvent,
    ) -> ReferralResult<StatusChange> {
        if matches!(
            event,
            EnrollmentEvent::Registered { .. } | EnrollmentEvent::ReferralLinked
        ) {
            return Err(ReferralError::InvalidTransition(format!(
                "{} is applied by registration only",
                event.name()
            )));
        }

        let current = self
            .store
            .get_enrollment(enrollment_id)
            .await?
            .ok_or_else(|| ReferralError::not_found("enrollment", enrollment_id))?;
        let transition = next_status(Some(current.status), event)?;

        let enrollment = self
            .store
            .transition_enrollment(
                enrollment_id,
                current.status,
                transition.enrollment,
                transition.payment,
                Utc::now(),
            )
            .await?;
        let tracking = self.ledger.sync_status(&enrollment).await?;

        info!(
            enrollment = %enrollment_id,
            event = event.name(),
            from = current.status.as_str(),
            to = enrollment.status.as_str(),
            payment = enrollment.payment_status.as_str(),
            "enrollment status changed"
        );
        Ok(StatusChange {
            enrollment,
            tracking,
        })
    }

    /// Server-side view of a user's enrollments, newest first.
    pub async fn enrollments_for_participant(&self, user_id: Uuid) -> ReferralResult<Vec<Enrollment>> {
        match self.store.participant_by_user(user_id).await? {
            Some(participant) => Ok(self
                .store
                .enrollments_for_participant(participant.id)
                .await?),
            None => Ok(Vec::new()),
        }
    }

    async fn program(&self, program_id: Uuid) -> ReferralResult<Program> {
        self.store
            .get_program(program_id)
            .await?
            .ok_or_else(|| ReferralError::not_found("program", program_id))
    }

    async fn write_enrollment(
        &self,
        program: &Program,
        participant: &Participant,
        code: Option<&ValidCode>,
        quote: &PriceQuote,
    ) -> ReferralResult<EnrollmentWrite> {
        let linkage = code.map(linkage_for);

        if let Some(existing) = self
            .store
            .find_enrollment(program.id, participant.id)
            .await?
        {
            return self.attach(existing, linkage).await;
        }

        let registered = next_status(
            None,
            EnrollmentEvent::Registered {
                free: quote.is_free(),
            },
        )?;
        let notes = linkage
            .as_ref()
            .map(|link| vec![format!("registered with referral code {}", link.code)])
            .unwrap_or_default();
        let new = NewEnrollment {
            program_id: program.id,
            participant_id: participant.id,
            status: registered.enrollment,
            payment_status: registered.payment.unwrap_or(PaymentStatus::Unpaid),
            referral: linkage.clone(),
            notes,
        };

        match self.store.insert_enrollment(new, Utc::now()).await {
            Ok(created) => Ok(EnrollmentWrite::Created(created)),
            Err(StorageError::Conflict(_)) => {
                debug!(program = %program.id, participant = %participant.id, "concurrent registration, re-reading");
                let winner = self
                    .store
                    .find_enrollment(program.id, participant.id)
                    .await?
                    .ok_or_else(|| {
                        ReferralError::Conflict(format!(
                            "enrollment for program {} vanished during registration",
                            program.id
                        ))
                    })?;
                self.attach(winner, linkage).await
            }
            Err(other) => Err(other.into()),
        }
    }

    /// Bring an existing enrollment in line with the presented referral.
    async fn attach(
        &self,
        existing: Enrollment,
        linkage: Option<ReferralLinkage>,
    ) -> ReferralResult<EnrollmentWrite> {
        let Some(linkage) = linkage else {
            return Ok(EnrollmentWrite::Unchanged(existing));
        };

        match &existing.referral {
            Some(current) if current.code_id == linkage.code_id => {
                return Ok(EnrollmentWrite::Unchanged(existing))
            }
            Some(current) => {
                return Err(ReferralError::Conflict(format!(
                    "enrollment {} is already attributed to referral code {}",
                    existing.id, current.code
                )))
            }
            None => {}
        }

        // Status is carried over untouched.
        next_status(Some(existing.status), EnrollmentEvent::ReferralLinked)?;
        let note = format!("referral code {} applied", linkage.code);
        match self
            .store
            .link_referral(existing.id, linkage.clone(), note, Utc::now())
            .await
        {
            Ok(linked) => Ok(EnrollmentWrite::Linked(linked)),
            Err(StorageError::Conflict(_)) => {
                let current = self
                    .store
                    .get_enrollment(existing.id)
                    .await?
                    .ok_or_else(|| ReferralError::not_found("enrollment", existing.id))?;
                match &current.referral {
                    Some(link) if link.code_id == linkage.code_id => {
                        Ok(EnrollmentWrite::Unchanged(current))
                    }
                    _ => Err(ReferralError::Conflict(format!(
                        "enrollment {} was attributed concurrently",
                        existing.id
                    ))),
                }
            }
            Err(other) => Err(other.into()),
        }
    }

    /// Release a referral whose code use could not be taken.
    ///
    /// Only enrollments without a tracking row are touched: a row means some
    /// call already holds the use for this enrollment.
    async fn compensate(&self, write: &EnrollmentWrite, code: &ValidCode) {
        let enrollment = write.enrollment();
        match self.ledger.for_enrollment(enrollment.id).await {
            Ok(None) => {}
            Ok(Some(_)) => {
                debug!(enrollment = %enrollment.id, "referral already tracked, nothing to roll back");
                return;
            }
            Err(err) => {
                error!(
                    enrollment = %enrollment.id,
                    code = %code.code,
                    error = %err,
                    "failed to check tracking before roll back"
                );
                return;
            }
        }

        let result = match write {
            EnrollmentWrite::Created(_) => self
                .store
                .remove_enrollment(enrollment.id)
                .await
                .map(|_| ()),
            EnrollmentWrite::Linked(_) | EnrollmentWrite::Unchanged(_) => self
                .store
                .unlink_referral(
                    enrollment.id,
                    code.code_id,
                    format!("referral code {} released: usage limit reached", code.code),
                    Utc::now(),
                )
                .await
                .map(|_| ()),
        };

        match result {
            Ok(()) => warn!(
                enrollment = %enrollment.id,
                code = %code.code,
                "referral code use rejected, enrollment write rolled back"
            ),
            Err(err) => error!(
                enrollment = %enrollment.id,
                code = %code.code,
                error = %err,
                "failed to roll back enrollment after rejected code use"
            ),
        }
    }

    /// A quota rejection for a code this participant already used here is a retry.
    async fn replay(
        &self,
        request: &EnrollmentRequest,
        code: &str,
    ) -> ReferralResult<Option<EnrollmentOutcome>> {
        let Some(participant) = self
            .store
            .participant_by_user(request.participant.user_id)
            .await?
        else {
            return Ok(None);
        };
        let Some(enrollment) = self
            .store
            .find_enrollment(request.program_id, participant.id)
            .await?
        else {
            return Ok(None);
        };
        if enrollment.referral.as_ref().map(|link| link.code.as_str()) != Some(code) {
            return Ok(None);
        }
        let Some(record) = self.store.find_code(code).await? else {
            return Ok(None);
        };

        let valid = ValidCode::from(&record);
        let program = self.program(request.program_id).await?;
        let quote = self.resolver.resolve(&program, Some(&valid)).await?;
        let attribution = match self
            .ledger
            .record(&enrollment, &valid, quote.discount_amount)
            .await
        {
            Ok(attribution) => attribution,
            Err(err) if err.is_code_rejection() => {
                // Linked by an interrupted call whose use was never counted.
                self.compensate(&EnrollmentWrite::Unchanged(enrollment), &valid)
                    .await;
                return Ok(None);
            }
            Err(err) => return Err(err),
        };

        debug!(enrollment = %enrollment.id, code, "enrollment replayed");
        Ok(Some(EnrollmentOutcome {
            enrollment,
            tracking: Some(attribution.tracking),
            final_price: quote.final_price,
            discount_applied: quote.discount_amount,
            commission_computed: quote.commission_amount,
            rate_source: quote.source,
            replayed: !attribution.fresh,
        }))
    }
}

fn linkage_for(code: &ValidCode) -> ReferralLinkage {
    ReferralLinkage {
        code: code.code.clone(),
        code_id: code.code_id,
        trainer_id: code.trainer_id,
    }
}
