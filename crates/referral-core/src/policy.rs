use crate::error::{FieldError, ReferralError, ReferralResult};
use crate::registry::ValidCode;
use crate::storage::{PolicyStore, ProgramStore, ReferralStorage, StorageError};
use crate::types::{PolicyDraft, Program, RateRule, ReferralPolicy};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// Which rate source wins when both a policy and a code carry rates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RatePrecedence {
    /// The program's active policy wins; code rates apply only without one.
    #[default]
    PolicyGoverns,
    /// Non-zero code rates win; the policy applies when the code carries none.
    CodeGoverns,
}

/// Where the rates in a [`PriceQuote`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RateSource {
    Policy { policy_id: Uuid },
    Code { code_id: Uuid },
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceQuote {
    pub base_price: i64,
    pub discount_amount: i64,
    /// Computed for reporting; never charged.
    pub commission_amount: i64,
    pub final_price: i64,
    pub source: RateSource,
}

impl PriceQuote {
    pub fn is_free(&self) -> bool {
        self.final_price == 0
    }
}

/// Apply one discount/commission pair to a price.
///
/// Discount lands in `[0, price]`, commission is floored at zero.
pub fn quote(price: i64, discount: RateRule, commission: RateRule, source: RateSource) -> PriceQuote {
    let base_price = price.max(0);
    let discount_amount = discount.amount_for(base_price).min(base_price);
    PriceQuote {
        base_price,
        discount_amount,
        commission_amount: commission.amount_for(base_price),
        final_price: (base_price - discount_amount).max(0),
        source,
    }
}

/// Pick the governing policy among candidates for one program.
///
/// Only policies effective at `now` qualify; the most recently updated wins,
/// ties broken by lowest id.
pub fn select_policy(policies: &[ReferralPolicy], now: DateTime<Utc>) -> Option<&ReferralPolicy> {
    policies
        .iter()
        .filter(|policy| policy.is_effective_at(now))
        .min_by(|a, b| b.updated_at.cmp(&a.updated_at).then(a.id.cmp(&b.id)))
}

/// Single authority for discount and commission amounts.
#[derive(Clone)]
pub struct PolicyResolver {
    store: Arc<dyn ReferralStorage>,
    precedence: RatePrecedence,
}

impl PolicyResolver {
    pub fn new(store: Arc<dyn ReferralStorage>, precedence: RatePrecedence) -> Self {
        Self { store, precedence }
    }

    pub fn precedence(&self) -> RatePrecedence {
        self.precedence
    }

    pub async fn resolve(
        &self,
        program: &Program,
        code: Option<&ValidCode>,
    ) -> ReferralResult<PriceQuote> {
        self.resolve_at(program, code, Utc::now()).await
    }

    pub async fn resolve_at(
        &self,
        program: &Program,
        code: Option<&ValidCode>,
        now: DateTime<Utc>,
    ) -> ReferralResult<PriceQuote> {
        // Referral discounts require a referral.
        let Some(code) = code else {
            return Ok(quote(
                program.price,
                RateRule::none(),
                RateRule::none(),
                RateSource::None,
            ));
        };

        let code_source = RateSource::Code {
            code_id: code.code_id,
        };
        let code_has_rates = !code.discount.is_zero() || !code.commission.is_zero();
        if self.precedence == RatePrecedence::CodeGoverns && code_has_rates {
            return Ok(quote(program.price, code.discount, code.commission, code_source));
        }

        let candidates = self.store.active_policies_for_program(program.id).await?;
        let resolved = match select_policy(&candidates, now) {
            Some(policy) => quote(
                program.price,
                policy.discount,
                policy.commission,
                RateSource::Policy {
                    policy_id: policy.id,
                },
            ),
            None => quote(program.price, code.discount, code.commission, code_source),
        };
        debug!(
            program = %program.id,
            code = %code.code,
            discount = resolved.discount_amount,
            final_price = resolved.final_price,
            "price resolved"
        );
        Ok(resolved)
    }

    pub async fn list_policies(&self, program_id: Option<Uuid>) -> ReferralResult<Vec<ReferralPolicy>> {
        Ok(self.store.list_policies(program_id).await?)
    }

    pub async fn get_policy(&self, id: Uuid) -> ReferralResult<ReferralPolicy> {
        self.store
            .get_policy(id)
            .await?
            .ok_or_else(|| ReferralError::not_found("referral policy", id))
    }

    pub async fn create_policy(&self, draft: PolicyDraft) -> ReferralResult<ReferralPolicy> {
        self.check_draft(&draft).await?;
        let policy = self.store.insert_policy(draft, Utc::now()).await?;
        info!(policy = %policy.id, program = %policy.program_id, "referral policy created");
        Ok(policy)
    }

    pub async fn update_policy(&self, id: Uuid, draft: PolicyDraft) -> ReferralResult<ReferralPolicy> {
        self.check_draft(&draft).await?;
        let policy = match self.store.update_policy(id, draft, Utc::now()).await {
            Ok(policy) => policy,
            Err(StorageError::NotFound(_)) => {
                return Err(ReferralError::not_found("referral policy", id))
            }
            Err(other) => return Err(other.into()),
        };
        info!(policy = %policy.id, active = policy.is_active, "referral policy updated");
        Ok(policy)
    }

    pub async fn delete_policy(&self, id: Uuid) -> ReferralResult<()> {
        if !self.store.delete_policy(id).await? {
            return Err(ReferralError::not_found("referral policy", id));
        }
        info!(policy = %id, "referral policy deleted");
        Ok(())
    }

    async fn check_draft(&self, draft: &PolicyDraft) -> ReferralResult<()> {
        let mut errors: Vec<FieldError> = Vec::new();
        if draft.name.trim().is_empty() {
            errors.push(FieldError::new("name", "must not be empty"));
        }
        errors.extend(draft.discount.check("discount"));
        errors.extend(draft.commission.check("commission"));
        if let (Some(from), Some(until)) = (draft.valid_from, draft.valid_until) {
            if from > until {
                errors.push(FieldError::new("valid_until", "must not precede valid_from"));
            }
        }
        if !errors.is_empty() {
            return Err(ReferralError::Validation(errors));
        }

        if self.store.get_program(draft.program_id).await?.is_none() {
            return Err(ReferralError::not_found("program", draft.program_id));
        }
        Ok(())
    }
}
