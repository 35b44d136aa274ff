//! PostgreSQL adapter for referral storage.
//!
//! Uniqueness is enforced by the schema (unique code values, a partial unique
//! index for one active code per trainer, one enrollment per program and
//! participant, one tracking row per enrollment). Usage increments and status
//! changes are conditional `UPDATE`s so concurrent callers cannot overshoot.

use super::traits::{
    CodeStore, ConsumeOutcome, EnrollmentStore, ParticipantStore, PolicyStore, ProfileStore,
    ProgramStore, RecordedUse, ReferralStorage, TrackingStore,
};
use super::{StorageError, StorageResult};
use crate::types::{
    Enrollment, EnrollmentStatus, NewEnrollment, NewReferralCode, NewTracking, Participant,
    ParticipantFields, PaymentStatus, PolicyDraft, Profile, ProfileRole, Program, ProgramStatus,
    RateRule, ReferralCode, ReferralLinkage, ReferralPolicy, ReferralTracking, TrackingStatus,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row};
use uuid::Uuid;

const ENROLLMENT_COLUMNS: &str = "id, program_id, participant_id, status, payment_status, \
     amount_paid, referral_code, referral_code_id, referral_trainer_id, notes, created_at, updated_at";

/// PostgreSQL-backed referral storage.
#[derive(Clone)]
pub struct PostgresReferralStorage {
    pool: PgPool,
}

impl PostgresReferralStorage {
    /// Connect to PostgreSQL and initialize required schema.
    pub async fn connect(database_url: &str) -> StorageResult<Self> {
        Self::connect_with_options(database_url, 10, 5).await
    }

    /// Connect with explicit pool parameters.
    pub async fn connect_with_options(
        database_url: &str,
        max_connections: u32,
        connect_timeout_secs: u64,
    ) -> StorageResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(std::time::Duration::from_secs(connect_timeout_secs))
            .connect(database_url)
            .await
            .map_err(|e| StorageError::Backend(format!("failed to connect postgres: {e}")))?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    pub async fn from_pool(pool: PgPool) -> StorageResult<Self> {
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn init_schema(&self) -> StorageResult<()> {
        let ddl = [
            r#"
            CREATE TABLE IF NOT EXISTS programs (
                id UUID PRIMARY KEY,
                title TEXT NOT NULL,
                price BIGINT NOT NULL CHECK (price >= 0),
                status TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS profiles (
                id UUID PRIMARY KEY,
                full_name TEXT NOT NULL,
                email TEXT NOT NULL,
                role TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS participants (
                id UUID PRIMARY KEY,
                user_id UUID NOT NULL UNIQUE,
                full_name TEXT NOT NULL,
                email TEXT NOT NULL,
                phone TEXT,
                organization TEXT,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS referral_codes (
                id UUID PRIMARY KEY,
                code TEXT NOT NULL UNIQUE,
                trainer_id UUID NOT NULL,
                is_active BOOLEAN NOT NULL,
                valid_until TIMESTAMPTZ,
                max_uses BIGINT,
                current_uses BIGINT NOT NULL DEFAULT 0,
                discount JSONB NOT NULL,
                commission JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL
            )
            "#,
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS referral_codes_one_active_per_trainer
                ON referral_codes (trainer_id) WHERE is_active
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS referral_policies (
                id UUID PRIMARY KEY,
                program_id UUID NOT NULL,
                name TEXT NOT NULL,
                discount JSONB NOT NULL,
                commission JSONB NOT NULL,
                max_uses_per_code BIGINT,
                valid_from TIMESTAMPTZ,
                valid_until TIMESTAMPTZ,
                is_active BOOLEAN NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS enrollments (
                id UUID PRIMARY KEY,
                program_id UUID NOT NULL,
                participant_id UUID NOT NULL,
                status TEXT NOT NULL,
                payment_status TEXT NOT NULL,
                amount_paid BIGINT NOT NULL DEFAULT 0,
                referral_code TEXT,
                referral_code_id UUID,
                referral_trainer_id UUID,
                notes JSONB NOT NULL DEFAULT '[]'::JSONB,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL,
                UNIQUE (program_id, participant_id)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS referral_tracking (
                id UUID PRIMARY KEY,
                code_id UUID NOT NULL,
                trainer_id UUID NOT NULL,
                participant_id UUID NOT NULL,
                enrollment_id UUID NOT NULL UNIQUE,
                program_id UUID NOT NULL,
                discount_applied BIGINT NOT NULL,
                commission_earned BIGINT NOT NULL DEFAULT 0,
                status TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS referral_tracking_created_idx ON referral_tracking (created_at)",
        ];

        for stmt in ddl {
            sqlx::query(stmt)
                .execute(&self.pool)
                .await
                .map_err(|e| StorageError::Backend(format!("schema init failed: {e}")))?;
        }
        Ok(())
    }
}

impl ReferralStorage for PostgresReferralStorage {
    fn backend_label(&self) -> &'static str {
        "postgres"
    }
}

#[async_trait]
impl ProgramStore for PostgresReferralStorage {
    async fn get_program(&self, id: Uuid) -> StorageResult<Option<Program>> {
        sqlx::query("SELECT id, title, price, status FROM programs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?
            .map(program_from_row)
            .transpose()
    }

    async fn upsert_program(&self, program: Program) -> StorageResult<()> {
        if program.price < 0 {
            return Err(StorageError::InvalidInput(format!(
                "program {} has negative price",
                program.id
            )));
        }
        sqlx::query(
            r#"
            INSERT INTO programs (id, title, price, status)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (id) DO UPDATE
               SET title = EXCLUDED.title,
                   price = EXCLUDED.price,
                   status = EXCLUDED.status
            "#,
        )
        .bind(program.id)
        .bind(program.title)
        .bind(program.price)
        .bind(program.status.as_str())
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(())
    }
}

#[async_trait]
impl ProfileStore for PostgresReferralStorage {
    async fn get_profile(&self, id: Uuid) -> StorageResult<Option<Profile>> {
        sqlx::query("SELECT id, full_name, email, role FROM profiles WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?
            .map(profile_from_row)
            .transpose()
    }

    async fn upsert_profile(&self, profile: Profile) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO profiles (id, full_name, email, role)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (id) DO UPDATE
               SET full_name = EXCLUDED.full_name,
                   email = EXCLUDED.email,
                   role = EXCLUDED.role
            "#,
        )
        .bind(profile.id)
        .bind(profile.full_name)
        .bind(profile.email)
        .bind(profile.role.as_str())
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(())
    }

    async fn profiles_by_ids(&self, ids: &[Uuid]) -> StorageResult<Vec<Profile>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        sqlx::query("SELECT id, full_name, email, role FROM profiles WHERE id = ANY($1)")
            .bind(ids.to_vec())
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?
            .into_iter()
            .map(profile_from_row)
            .collect()
    }
}

#[async_trait]
impl ParticipantStore for PostgresReferralStorage {
    async fn upsert_participant(
        &self,
        fields: &ParticipantFields,
        at: DateTime<Utc>,
    ) -> StorageResult<Participant> {
        let row = sqlx::query(
            r#"
            INSERT INTO participants
                (id, user_id, full_name, email, phone, organization, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $7)
            ON CONFLICT (user_id) DO UPDATE
               SET full_name = EXCLUDED.full_name,
                   email = EXCLUDED.email,
                   phone = EXCLUDED.phone,
                   organization = EXCLUDED.organization,
                   updated_at = EXCLUDED.updated_at
            RETURNING id, user_id, full_name, email, phone, organization, created_at, updated_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(fields.user_id)
        .bind(&fields.full_name)
        .bind(&fields.email)
        .bind(&fields.phone)
        .bind(&fields.organization)
        .bind(at)
        .fetch_one(&self.pool)
        .await
        .map_err(backend)?;
        participant_from_row(row)
    }

    async fn participant_by_user(&self, user_id: Uuid) -> StorageResult<Option<Participant>> {
        sqlx::query(
            r#"
            SELECT id, user_id, full_name, email, phone, organization, created_at, updated_at
              FROM participants
             WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?
        .map(participant_from_row)
        .transpose()
    }
}

#[async_trait]
impl CodeStore for PostgresReferralStorage {
    async fn find_code(&self, code: &str) -> StorageResult<Option<ReferralCode>> {
        sqlx::query("SELECT * FROM referral_codes WHERE code = $1")
            .bind(code)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?
            .map(code_from_row)
            .transpose()
    }

    async fn get_code(&self, id: Uuid) -> StorageResult<Option<ReferralCode>> {
        sqlx::query("SELECT * FROM referral_codes WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?
            .map(code_from_row)
            .transpose()
    }

    async fn active_code_for_trainer(
        &self,
        trainer_id: Uuid,
    ) -> StorageResult<Option<ReferralCode>> {
        sqlx::query("SELECT * FROM referral_codes WHERE trainer_id = $1 AND is_active")
            .bind(trainer_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?
            .map(code_from_row)
            .transpose()
    }

    async fn code_exists(&self, code: &str) -> StorageResult<bool> {
        sqlx::query_scalar::<_, bool>("SELECT EXISTS (SELECT 1 FROM referral_codes WHERE code = $1)")
            .bind(code)
            .fetch_one(&self.pool)
            .await
            .map_err(backend)
    }

    async fn insert_code(
        &self,
        code: NewReferralCode,
        at: DateTime<Utc>,
    ) -> StorageResult<ReferralCode> {
        let row = sqlx::query(
            r#"
            INSERT INTO referral_codes
                (id, code, trainer_id, is_active, valid_until, max_uses, current_uses, discount, commission, created_at)
            VALUES ($1, $2, $3, TRUE, $4, $5, 0, $6, $7, $8)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&code.code)
        .bind(code.trainer_id)
        .bind(code.valid_until)
        .bind(code.max_uses.map(i64::from))
        .bind(rule_to_json(&code.discount)?)
        .bind(rule_to_json(&code.commission)?)
        .bind(at)
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx_conflict)?;
        code_from_row(row)
    }

    async fn consume_code(&self, id: Uuid) -> StorageResult<ConsumeOutcome> {
        let updated = sqlx::query_scalar::<_, i64>(
            r#"
            UPDATE referral_codes
               SET current_uses = current_uses + 1
             WHERE id = $1
               AND is_active
               AND (max_uses IS NULL OR current_uses < max_uses)
            RETURNING current_uses
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;

        match updated {
            Some(current_uses) => Ok(ConsumeOutcome::Consumed {
                current_uses: to_u32(current_uses, "current_uses")?,
            }),
            None if self.get_code(id).await?.is_some() => Ok(ConsumeOutcome::Exhausted),
            None => Err(StorageError::NotFound(format!("referral code {id}"))),
        }
    }

    async fn deactivate_code(&self, id: Uuid) -> StorageResult<ReferralCode> {
        sqlx::query("UPDATE referral_codes SET is_active = FALSE WHERE id = $1 RETURNING *")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?
            .map(code_from_row)
            .transpose()?
            .ok_or_else(|| StorageError::NotFound(format!("referral code {id}")))
    }
}

#[async_trait]
impl PolicyStore for PostgresReferralStorage {
    async fn list_policies(&self, program_id: Option<Uuid>) -> StorageResult<Vec<ReferralPolicy>> {
        sqlx::query(
            r#"
            SELECT * FROM referral_policies
             WHERE ($1::UUID IS NULL OR program_id = $1)
             ORDER BY updated_at DESC, id ASC
            "#,
        )
        .bind(program_id)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?
        .into_iter()
        .map(policy_from_row)
        .collect()
    }

    async fn get_policy(&self, id: Uuid) -> StorageResult<Option<ReferralPolicy>> {
        sqlx::query("SELECT * FROM referral_policies WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?
            .map(policy_from_row)
            .transpose()
    }

    async fn insert_policy(
        &self,
        draft: PolicyDraft,
        at: DateTime<Utc>,
    ) -> StorageResult<ReferralPolicy> {
        let row = sqlx::query(
            r#"
            INSERT INTO referral_policies
                (id, program_id, name, discount, commission, max_uses_per_code, valid_from, valid_until, is_active, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $10)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(draft.program_id)
        .bind(&draft.name)
        .bind(rule_to_json(&draft.discount)?)
        .bind(rule_to_json(&draft.commission)?)
        .bind(draft.max_uses_per_code.map(i64::from))
        .bind(draft.valid_from)
        .bind(draft.valid_until)
        .bind(draft.is_active)
        .bind(at)
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx_conflict)?;
        policy_from_row(row)
    }

    async fn update_policy(
        &self,
        id: Uuid,
        draft: PolicyDraft,
        at: DateTime<Utc>,
    ) -> StorageResult<ReferralPolicy> {
        sqlx::query(
            r#"
            UPDATE referral_policies
               SET program_id = $2,
                   name = $3,
                   discount = $4,
                   commission = $5,
                   max_uses_per_code = $6,
                   valid_from = $7,
                   valid_until = $8,
                   is_active = $9,
                   updated_at = $10
             WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(draft.program_id)
        .bind(&draft.name)
        .bind(rule_to_json(&draft.discount)?)
        .bind(rule_to_json(&draft.commission)?)
        .bind(draft.max_uses_per_code.map(i64::from))
        .bind(draft.valid_from)
        .bind(draft.valid_until)
        .bind(draft.is_active)
        .bind(at)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?
        .map(policy_from_row)
        .transpose()?
        .ok_or_else(|| StorageError::NotFound(format!("referral policy {id}")))
    }

    async fn delete_policy(&self, id: Uuid) -> StorageResult<bool> {
        let result = sqlx::query("DELETE FROM referral_policies WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(result.rows_affected() > 0)
    }

    async fn active_policies_for_program(
        &self,
        program_id: Uuid,
    ) -> StorageResult<Vec<ReferralPolicy>> {
        sqlx::query("SELECT * FROM referral_policies WHERE program_id = $1 AND is_active")
            .bind(program_id)
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?
            .into_iter()
            .map(policy_from_row)
            .collect()
    }
}

#[async_trait]
impl EnrollmentStore for PostgresReferralStorage {
    async fn get_enrollment(&self, id: Uuid) -> StorageResult<Option<Enrollment>> {
        sqlx::query(&format!(
            "SELECT {ENROLLMENT_COLUMNS} FROM enrollments WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?
        .map(enrollment_from_row)
        .transpose()
    }

    async fn find_enrollment(
        &self,
        program_id: Uuid,
        participant_id: Uuid,
    ) -> StorageResult<Option<Enrollment>> {
        sqlx::query(&format!(
            "SELECT {ENROLLMENT_COLUMNS} FROM enrollments WHERE program_id = $1 AND participant_id = $2"
        ))
        .bind(program_id)
        .bind(participant_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?
        .map(enrollment_from_row)
        .transpose()
    }

    async fn insert_enrollment(
        &self,
        enrollment: NewEnrollment,
        at: DateTime<Utc>,
    ) -> StorageResult<Enrollment> {
        let notes = serde_json::to_value(&enrollment.notes)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        let referral = enrollment.referral.as_ref();
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO enrollments
                (id, program_id, participant_id, status, payment_status, amount_paid,
                 referral_code, referral_code_id, referral_trainer_id, notes, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, 0, $6, $7, $8, $9, $10, $10)
            RETURNING {ENROLLMENT_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(enrollment.program_id)
        .bind(enrollment.participant_id)
        .bind(enrollment.status.as_str())
        .bind(enrollment.payment_status.as_str())
        .bind(referral.map(|link| link.code.clone()))
        .bind(referral.map(|link| link.code_id))
        .bind(referral.map(|link| link.trainer_id))
        .bind(notes)
        .bind(at)
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx_conflict)?;
        enrollment_from_row(row)
    }

    async fn link_referral(
        &self,
        id: Uuid,
        linkage: ReferralLinkage,
        note: String,
        at: DateTime<Utc>,
    ) -> StorageResult<Enrollment> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE enrollments
               SET referral_code = $2,
                   referral_code_id = $3,
                   referral_trainer_id = $4,
                   notes = notes || jsonb_build_array($5::TEXT),
                   updated_at = $6
             WHERE id = $1
               AND referral_code_id IS NULL
            RETURNING {ENROLLMENT_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(&linkage.code)
        .bind(linkage.code_id)
        .bind(linkage.trainer_id)
        .bind(note)
        .bind(at)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;

        match row {
            Some(row) => enrollment_from_row(row),
            None if self.get_enrollment(id).await?.is_some() => Err(StorageError::Conflict(
                format!("enrollment {id} already carries a referral"),
            )),
            None => Err(StorageError::NotFound(format!("enrollment {id}"))),
        }
    }

    async fn unlink_referral(
        &self,
        id: Uuid,
        code_id: Uuid,
        note: String,
        at: DateTime<Utc>,
    ) -> StorageResult<Enrollment> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE enrollments
               SET referral_code = NULL,
                   referral_code_id = NULL,
                   referral_trainer_id = NULL,
                   notes = notes || jsonb_build_array($3::TEXT),
                   updated_at = $4
             WHERE id = $1
               AND referral_code_id = $2
            RETURNING {ENROLLMENT_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(code_id)
        .bind(note)
        .bind(at)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;

        match row {
            Some(row) => enrollment_from_row(row),
            None if self.get_enrollment(id).await?.is_some() => Err(StorageError::Conflict(
                format!("enrollment {id} is not linked to referral code {code_id}"),
            )),
            None => Err(StorageError::NotFound(format!("enrollment {id}"))),
        }
    }

    async fn remove_enrollment(&self, id: Uuid) -> StorageResult<bool> {
        let result = sqlx::query("DELETE FROM enrollments WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(result.rows_affected() > 0)
    }

    async fn transition_enrollment(
        &self,
        id: Uuid,
        expected: EnrollmentStatus,
        next: EnrollmentStatus,
        payment: Option<PaymentStatus>,
        at: DateTime<Utc>,
    ) -> StorageResult<Enrollment> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE enrollments
               SET status = $3,
                   payment_status = COALESCE($4, payment_status),
                   updated_at = $5
             WHERE id = $1
               AND status = $2
            RETURNING {ENROLLMENT_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(expected.as_str())
        .bind(next.as_str())
        .bind(payment.map(PaymentStatus::as_str))
        .bind(at)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;

        match row {
            Some(row) => enrollment_from_row(row),
            None if self.get_enrollment(id).await?.is_some() => Err(StorageError::Conflict(
                format!("enrollment {id} is no longer {}", expected.as_str()),
            )),
            None => Err(StorageError::NotFound(format!("enrollment {id}"))),
        }
    }

    async fn enrollments_for_participant(
        &self,
        participant_id: Uuid,
    ) -> StorageResult<Vec<Enrollment>> {
        sqlx::query(&format!(
            "SELECT {ENROLLMENT_COLUMNS} FROM enrollments WHERE participant_id = $1 ORDER BY created_at DESC"
        ))
        .bind(participant_id)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?
        .into_iter()
        .map(enrollment_from_row)
        .collect()
    }
}

#[async_trait]
impl TrackingStore for PostgresReferralStorage {
    async fn insert_tracking(
        &self,
        tracking: NewTracking,
        at: DateTime<Utc>,
    ) -> StorageResult<ReferralTracking> {
        let row = sqlx::query(
            r#"
            INSERT INTO referral_tracking
                (id, code_id, trainer_id, participant_id, enrollment_id, program_id,
                 discount_applied, commission_earned, status, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $10)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(tracking.code_id)
        .bind(tracking.trainer_id)
        .bind(tracking.participant_id)
        .bind(tracking.enrollment_id)
        .bind(tracking.program_id)
        .bind(tracking.discount_applied)
        .bind(tracking.commission_earned)
        .bind(tracking.status.as_str())
        .bind(at)
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx_conflict)?;
        tracking_from_row(row)
    }

    async fn record_use(
        &self,
        tracking: NewTracking,
        at: DateTime<Utc>,
    ) -> StorageResult<RecordedUse> {
        let enrollment_id = tracking.enrollment_id;
        let code_id = tracking.code_id;
        let mut tx = self.pool.begin().await.map_err(backend)?;

        // The unique enrollment_id serializes concurrent claims for one enrollment.
        let inserted = sqlx::query(
            r#"
            INSERT INTO referral_tracking
                (id, code_id, trainer_id, participant_id, enrollment_id, program_id,
                 discount_applied, commission_earned, status, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $10)
            ON CONFLICT (enrollment_id) DO NOTHING
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(tracking.code_id)
        .bind(tracking.trainer_id)
        .bind(tracking.participant_id)
        .bind(tracking.enrollment_id)
        .bind(tracking.program_id)
        .bind(tracking.discount_applied)
        .bind(tracking.commission_earned)
        .bind(tracking.status.as_str())
        .bind(at)
        .fetch_optional(&mut *tx)
        .await
        .map_err(backend)?;

        let Some(row) = inserted else {
            tx.rollback().await.map_err(backend)?;
            return self
                .tracking_for_enrollment(enrollment_id)
                .await?
                .map(RecordedUse::AlreadyRecorded)
                .ok_or_else(|| {
                    StorageError::Conflict(format!(
                        "tracking for enrollment {enrollment_id} conflicted but is missing"
                    ))
                });
        };

        let consumed = sqlx::query_scalar::<_, i64>(
            r#"
            UPDATE referral_codes
               SET current_uses = current_uses + 1
             WHERE id = $1
               AND is_active
               AND (max_uses IS NULL OR current_uses < max_uses)
            RETURNING current_uses
            "#,
        )
        .bind(code_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(backend)?;

        let Some(current_uses) = consumed else {
            tx.rollback().await.map_err(backend)?;
            return match self.get_code(code_id).await? {
                Some(_) => Ok(RecordedUse::Exhausted),
                None => Err(StorageError::NotFound(format!("referral code {code_id}"))),
            };
        };

        let tracking = tracking_from_row(row)?;
        tx.commit().await.map_err(backend)?;
        Ok(RecordedUse::Recorded {
            tracking,
            current_uses: to_u32(current_uses, "current_uses")?,
        })
    }

    async fn tracking_for_enrollment(
        &self,
        enrollment_id: Uuid,
    ) -> StorageResult<Option<ReferralTracking>> {
        sqlx::query("SELECT * FROM referral_tracking WHERE enrollment_id = $1")
            .bind(enrollment_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?
            .map(tracking_from_row)
            .transpose()
    }

    async fn set_tracking_status(
        &self,
        enrollment_id: Uuid,
        status: TrackingStatus,
        at: DateTime<Utc>,
    ) -> StorageResult<Option<ReferralTracking>> {
        sqlx::query(
            r#"
            UPDATE referral_tracking
               SET status = $2, updated_at = $3
             WHERE enrollment_id = $1
            RETURNING *
            "#,
        )
        .bind(enrollment_id)
        .bind(status.as_str())
        .bind(at)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?
        .map(tracking_from_row)
        .transpose()
    }

    async fn list_tracking(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> StorageResult<Vec<ReferralTracking>> {
        sqlx::query(
            r#"
            SELECT * FROM referral_tracking
             WHERE ($1::TIMESTAMPTZ IS NULL OR created_at >= $1)
             ORDER BY created_at ASC
            "#,
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?
        .into_iter()
        .map(tracking_from_row)
        .collect()
    }
}

fn backend(err: sqlx::Error) -> StorageError {
    StorageError::Backend(err.to_string())
}

fn map_sqlx_conflict(err: sqlx::Error) -> StorageError {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err.code().as_deref() == Some("23505") {
            return StorageError::Conflict(db_err.message().to_string());
        }
    }
    StorageError::Backend(err.to_string())
}

fn col<'r, T>(row: &'r PgRow, name: &str) -> StorageResult<T>
where
    T: sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>,
{
    row.try_get(name)
        .map_err(|e| StorageError::Backend(format!("column {name}: {e}")))
}

fn to_u32(value: i64, field: &str) -> StorageResult<u32> {
    u32::try_from(value)
        .map_err(|_| StorageError::Serialization(format!("{field} out of range: {value}")))
}

fn rule_to_json(rule: &RateRule) -> StorageResult<serde_json::Value> {
    serde_json::to_value(rule).map_err(|e| StorageError::Serialization(e.to_string()))
}

fn rule_from_row(row: &PgRow, name: &str) -> StorageResult<RateRule> {
    let value: serde_json::Value = col(row, name)?;
    serde_json::from_value(value).map_err(|e| StorageError::Serialization(e.to_string()))
}

fn parse_enum<T>(raw: &str, parse: impl Fn(&str) -> Option<T>, what: &str) -> StorageResult<T> {
    parse(raw).ok_or_else(|| StorageError::Serialization(format!("unknown {what} '{raw}'")))
}

fn program_from_row(row: PgRow) -> StorageResult<Program> {
    let status: String = col(&row, "status")?;
    Ok(Program {
        id: col(&row, "id")?,
        title: col(&row, "title")?,
        price: col(&row, "price")?,
        status: parse_enum(&status, ProgramStatus::parse, "program status")?,
    })
}

fn profile_from_row(row: PgRow) -> StorageResult<Profile> {
    let role: String = col(&row, "role")?;
    Ok(Profile {
        id: col(&row, "id")?,
        full_name: col(&row, "full_name")?,
        email: col(&row, "email")?,
        role: parse_enum(&role, ProfileRole::parse, "profile role")?,
    })
}

fn participant_from_row(row: PgRow) -> StorageResult<Participant> {
    Ok(Participant {
        id: col(&row, "id")?,
        user_id: col(&row, "user_id")?,
        full_name: col(&row, "full_name")?,
        email: col(&row, "email")?,
        phone: col(&row, "phone")?,
        organization: col(&row, "organization")?,
        created_at: col(&row, "created_at")?,
        updated_at: col(&row, "updated_at")?,
    })
}

fn code_from_row(row: PgRow) -> StorageResult<ReferralCode> {
    let max_uses: Option<i64> = col(&row, "max_uses")?;
    Ok(ReferralCode {
        id: col(&row, "id")?,
        code: col(&row, "code")?,
        trainer_id: col(&row, "trainer_id")?,
        is_active: col(&row, "is_active")?,
        valid_until: col(&row, "valid_until")?,
        max_uses: max_uses.map(|v| to_u32(v, "max_uses")).transpose()?,
        current_uses: to_u32(col(&row, "current_uses")?, "current_uses")?,
        discount: rule_from_row(&row, "discount")?,
        commission: rule_from_row(&row, "commission")?,
        created_at: col(&row, "created_at")?,
    })
}

fn policy_from_row(row: PgRow) -> StorageResult<ReferralPolicy> {
    let max_uses: Option<i64> = col(&row, "max_uses_per_code")?;
    Ok(ReferralPolicy {
        id: col(&row, "id")?,
        program_id: col(&row, "program_id")?,
        name: col(&row, "name")?,
        discount: rule_from_row(&row, "discount")?,
        commission: rule_from_row(&row, "commission")?,
        max_uses_per_code: max_uses
            .map(|v| to_u32(v, "max_uses_per_code"))
            .transpose()?,
        valid_from: col(&row, "valid_from")?,
        valid_until: col(&row, "valid_until")?,
        is_active: col(&row, "is_active")?,
        created_at: col(&row, "created_at")?,
        updated_at: col(&row, "updated_at")?,
    })
}

fn enrollment_from_row(row: PgRow) -> StorageResult<Enrollment> {
    let status: String = col(&row, "status")?;
    let payment: String = col(&row, "payment_status")?;
    let code: Option<String> = col(&row, "referral_code")?;
    let code_id: Option<Uuid> = col(&row, "referral_code_id")?;
    let trainer_id: Option<Uuid> = col(&row, "referral_trainer_id")?;
    let notes: serde_json::Value = col(&row, "notes")?;

    let referral = match (code, code_id, trainer_id) {
        (Some(code), Some(code_id), Some(trainer_id)) => Some(ReferralLinkage {
            code,
            code_id,
            trainer_id,
        }),
        _ => None,
    };

    Ok(Enrollment {
        id: col(&row, "id")?,
        program_id: col(&row, "program_id")?,
        participant_id: col(&row, "participant_id")?,
        status: parse_enum(&status, EnrollmentStatus::parse, "enrollment status")?,
        payment_status: parse_enum(&payment, PaymentStatus::parse, "payment status")?,
        amount_paid: col(&row, "amount_paid")?,
        referral,
        notes: serde_json::from_value(notes)
            .map_err(|e| StorageError::Serialization(e.to_string()))?,
        created_at: col(&row, "created_at")?,
        updated_at: col(&row, "updated_at")?,
    })
}

fn tracking_from_row(row: PgRow) -> StorageResult<ReferralTracking> {
    let status: String = col(&row, "status")?;
    Ok(ReferralTracking {
        id: col(&row, "id")?,
        code_id: col(&row, "code_id")?,
        trainer_id: col(&row, "trainer_id")?,
        participant_id: col(&row, "participant_id")?,
        enrollment_id: col(&row, "enrollment_id")?,
        program_id: col(&row, "program_id")?,
        discount_applied: col(&row, "discount_applied")?,
        commission_earned: col(&row, "commission_earned")?,
        status: parse_enum(&status, TrackingStatus::parse, "tracking status")?,
        created_at: col(&row, "created_at")?,
        updated_at: col(&row, "updated_at")?,
    })
}
