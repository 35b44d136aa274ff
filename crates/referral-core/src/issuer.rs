use crate::error::{FieldError, ReferralError, ReferralResult};
use crate::registry::normalize_code;
use crate::storage::{CodeStore, ReferralStorage, StorageError};
use crate::types::{NewReferralCode, ReferralCode};
use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

const CODE_CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Source of candidate code strings.
pub trait CodeGenerator: Send + Sync {
    fn generate(&self, length: usize) -> String;
}

/// Uniform random codes over `[A-Z0-9]`.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomCodeGenerator;

impl CodeGenerator for RandomCodeGenerator {
    fn generate(&self, length: usize) -> String {
        let mut rng = rand::thread_rng();
        (0..length)
            .map(|_| CODE_CHARSET[rng.gen_range(0..CODE_CHARSET.len())] as char)
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IssuerConfig {
    pub code_length: usize,
    pub max_attempts: u32,
    /// Longer codes tried once the primary attempts all collide.
    pub fallback_code_length: Option<usize>,
    pub fallback_attempts: u32,
}

impl Default for IssuerConfig {
    fn default() -> Self {
        Self {
            code_length: 8,
            max_attempts: 10,
            fallback_code_length: Some(12),
            fallback_attempts: 10,
        }
    }
}

impl IssuerConfig {
    fn phases(&self) -> Vec<(usize, u32)> {
        let mut phases = vec![(self.code_length, self.max_attempts)];
        if let Some(length) = self.fallback_code_length {
            phases.push((length, self.fallback_attempts));
        }
        phases
    }

    fn total_attempts(&self) -> u32 {
        self.phases().iter().map(|(_, attempts)| attempts).sum()
    }
}

/// Issues at most one active code per trainer.
#[derive(Clone)]
pub struct CodeIssuer {
    store: Arc<dyn ReferralStorage>,
    generator: Arc<dyn CodeGenerator>,
    config: IssuerConfig,
}

impl CodeIssuer {
    pub fn new(store: Arc<dyn ReferralStorage>, config: IssuerConfig) -> Self {
        Self::with_generator(store, config, Arc::new(RandomCodeGenerator))
    }

    pub fn with_generator(
        store: Arc<dyn ReferralStorage>,
        config: IssuerConfig,
        generator: Arc<dyn CodeGenerator>,
    ) -> Self {
        Self {
            store,
            generator,
            config,
        }
    }

    /// Return the trainer's active code, creating one if none exists.
    ///
    /// Concurrent callers for the same trainer converge on one persisted code:
    /// the store admits a single active code per trainer and the loser re-reads it.
    pub async fn get_or_create(&self, trainer_id: Uuid) -> ReferralResult<ReferralCode> {
        if let Some(existing) = self.store.active_code_for_trainer(trainer_id).await? {
            return Ok(existing);
        }

        for (length, attempts) in self.config.phases() {
            for attempt in 1..=attempts {
                let candidate = self.generator.generate(length);
                if self.store.code_exists(&candidate).await? {
                    debug!(length, attempt, "generated referral code collided");
                    continue;
                }

                match self
                    .store
                    .insert_code(NewReferralCode::issued(candidate, trainer_id), Utc::now())
                    .await
                {
                    Ok(code) => {
                        info!(trainer = %trainer_id, code = %code.code, "referral code issued");
                        return Ok(code);
                    }
                    Err(StorageError::Conflict(_)) => {
                        if let Some(winner) = self.store.active_code_for_trainer(trainer_id).await? {
                            return Ok(winner);
                        }
                        debug!(length, attempt, "referral code insert conflicted");
                    }
                    Err(other) => return Err(other.into()),
                }
            }
        }

        let attempts = self.config.total_attempts();
        warn!(trainer = %trainer_id, attempts, "referral code generation exhausted");
        Err(ReferralError::GenerationExhausted { attempts })
    }

    /// Insert an operator-specified code with its own limits and rates.
    pub async fn create(&self, mut code: NewReferralCode) -> ReferralResult<ReferralCode> {
        code.code = normalize_code(&code.code);

        let mut errors = Vec::new();
        if code.code.is_empty() {
            errors.push(FieldError::new("code", "must not be empty"));
        } else if !code.code.bytes().all(|b| CODE_CHARSET.contains(&b)) {
            errors.push(FieldError::new("code", "must contain only letters and digits"));
        }
        errors.extend(code.discount.check("discount"));
        errors.extend(code.commission.check("commission"));
        if !errors.is_empty() {
            return Err(ReferralError::Validation(errors));
        }

        let created = self.store.insert_code(code, Utc::now()).await?;
        info!(trainer = %created.trainer_id, code = %created.code, "referral code created");
        Ok(created)
    }
}
