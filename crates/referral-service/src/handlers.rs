//! HTTP handlers
//!
//! Handlers translate between the wire schema and [`ReferralEngine`] calls; every
//! referral rule lives in the engine.

use crate::error::{ApiError, ApiResult};
use crate::extract::{Caller, ValidJson};
use crate::ServiceState;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::{DateTime, Utc};
use referral_core::{
    Enrollment, EnrollmentEvent, EnrollmentOutcome, EnrollmentRequest, LeaderboardPeriod,
    LeaderboardScope, LeaderboardStat, NewReferralCode, ParticipantFields, PolicyDraft, Profile,
    ProfileRole, Program, ProgramStatus, RateRule, ReferralCode, ReferralPolicy, StatusChange,
    ValidCode,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

const MAX_LEADERBOARD_LIMIT: usize = 100;

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: &'static str,
    pub version: &'static str,
    pub storage: &'static str,
}

pub async fn health(State(state): State<ServiceState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service: "referral-service",
        version: env!("CARGO_PKG_VERSION"),
        storage: state.engine.storage_backend(),
    })
}

#[derive(Debug, Deserialize)]
pub struct ValidateQuery {
    pub code: String,
}

pub async fn validate_code(
    State(state): State<ServiceState>,
    Query(query): Query<ValidateQuery>,
) -> ApiResult<Json<ValidCode>> {
    Ok(Json(state.engine.validate_code(&query.code).await?))
}

#[derive(Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct ParticipantBody {
    #[validate(length(min = 1, max = 200))]
    pub full_name: String,
    #[validate(email)]
    pub email: String,
    #[serde(default)]
    #[validate(length(min = 5, max = 32))]
    pub phone: Option<String>,
    #[serde(default)]
    #[validate(length(max = 200))]
    pub organization: Option<String>,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct EnrollBody {
    pub program_id: Uuid,
    #[validate(nested)]
    pub participant: ParticipantBody,
    #[serde(default)]
    #[validate(length(max = 64))]
    pub referral_code: Option<String>,
}

pub async fn enroll(
    State(state): State<ServiceState>,
    Caller(user_id): Caller,
    ValidJson(body): ValidJson<EnrollBody>,
) -> ApiResult<Json<EnrollmentOutcome>> {
    let request = EnrollmentRequest {
        program_id: body.program_id,
        participant: ParticipantFields {
            user_id,
            full_name: body.participant.full_name,
            email: body.participant.email,
            phone: body.participant.phone,
            organization: body.participant.organization,
        },
        referral_code: body.referral_code,
    };
    Ok(Json(state.engine.enroll(request).await?))
}

#[derive(Debug, Deserialize)]
pub struct EnrollmentsQuery {
    pub participant_id: Option<Uuid>,
}

/// Callers read their own enrollments; staff may read anyone's.
pub async fn list_enrollments(
    State(state): State<ServiceState>,
    Caller(caller): Caller,
    Query(query): Query<EnrollmentsQuery>,
) -> ApiResult<Json<Vec<Enrollment>>> {
    let user_id = query.participant_id.unwrap_or(caller);
    if user_id != caller {
        let role = state.engine.get_profile(caller).await?.map(|p| p.role);
        if !matches!(role, Some(ProfileRole::Admin | ProfileRole::Manager)) {
            return Err(ApiError::Forbidden(
                "only staff may read another user's enrollments".to_string(),
            ));
        }
    }
    Ok(Json(state.engine.enrollments_for_participant(user_id).await?))
}

#[derive(Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct StatusEventBody {
    pub event: EnrollmentEvent,
}

pub async fn apply_status_event(
    State(state): State<ServiceState>,
    _caller: Caller,
    Path(enrollment_id): Path<Uuid>,
    ValidJson(body): ValidJson<StatusEventBody>,
) -> ApiResult<Json<StatusChange>> {
    Ok(Json(
        state
            .engine
            .apply_status_event(enrollment_id, body.event)
            .await?,
    ))
}

#[derive(Debug, Deserialize)]
pub struct LeaderboardQuery {
    pub scope: Option<String>,
    pub period: Option<String>,
    pub limit: Option<usize>,
}

pub async fn leaderboard(
    State(state): State<ServiceState>,
    Query(query): Query<LeaderboardQuery>,
) -> ApiResult<Json<Vec<LeaderboardStat>>> {
    let scope = match query.scope.as_deref() {
        None => LeaderboardScope::default(),
        Some(value) => LeaderboardScope::parse(&value.to_ascii_lowercase()).ok_or_else(|| {
            ApiError::BadRequest(format!(
                "invalid scope '{}'; expected trainer or user",
                value
            ))
        })?,
    };
    let period = match query.period.as_deref() {
        None => LeaderboardPeriod::default(),
        Some(value) => LeaderboardPeriod::parse(&value.to_ascii_lowercase()).ok_or_else(|| {
            ApiError::BadRequest(format!(
                "invalid period '{}'; expected all, week, month or year",
                value
            ))
        })?,
    };
    let limit = query.limit.map(|limit| limit.min(MAX_LEADERBOARD_LIMIT));

    Ok(Json(state.engine.leaderboard(scope, period, limit).await?))
}

/// Issue (or return) the caller's own shareable code.
pub async fn my_code(
    State(state): State<ServiceState>,
    Caller(caller): Caller,
) -> ApiResult<Json<ReferralCode>> {
    let profile = state.engine.get_profile(caller).await?;
    if profile.map(|p| p.role) != Some(ProfileRole::Trainer) {
        return Err(ApiError::Forbidden(
            "referral codes are issued to trainers only".to_string(),
        ));
    }
    Ok(Json(state.engine.get_or_create_code(caller).await?))
}

#[derive(Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct CodeBody {
    #[validate(length(min = 4, max = 32))]
    pub code: String,
    pub trainer_id: Uuid,
    #[serde(default)]
    pub valid_until: Option<DateTime<Utc>>,
    #[serde(default)]
    #[validate(range(min = 1))]
    pub max_uses: Option<u32>,
    #[serde(default)]
    pub discount: RateRule,
    #[serde(default)]
    pub commission: RateRule,
}

pub async fn create_code(
    State(state): State<ServiceState>,
    _caller: Caller,
    ValidJson(body): ValidJson<CodeBody>,
) -> ApiResult<Json<ReferralCode>> {
    let code = NewReferralCode {
        code: body.code,
        trainer_id: body.trainer_id,
        valid_until: body.valid_until,
        max_uses: body.max_uses,
        discount: body.discount,
        commission: body.commission,
    };
    Ok(Json(state.engine.create_code(code).await?))
}

pub async fn deactivate_code(
    State(state): State<ServiceState>,
    _caller: Caller,
    Path(code_id): Path<Uuid>,
) -> ApiResult<Json<ReferralCode>> {
    Ok(Json(state.engine.deactivate_code(code_id).await?))
}

#[derive(Debug, Deserialize)]
pub struct PoliciesQuery {
    pub program_id: Option<Uuid>,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct PolicyBody {
    pub program_id: Uuid,
    #[validate(length(min = 1, max = 120))]
    pub name: String,
    pub discount: RateRule,
    pub commission: RateRule,
    #[serde(default)]
    #[validate(range(min = 1))]
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

impl From<PolicyBody> for PolicyDraft {
    fn from(body: PolicyBody) -> Self {
        PolicyDraft {
            program_id: body.program_id,
            name: body.name,
            discount: body.discount,
            commission: body.commission,
            max_uses_per_code: body.max_uses_per_code,
            valid_from: body.valid_from,
            valid_until: body.valid_until,
            is_active: body.is_active,
        }
    }
}

pub async fn list_policies(
    State(state): State<ServiceState>,
    _caller: Caller,
    Query(query): Query<PoliciesQuery>,
) -> ApiResult<Json<Vec<ReferralPolicy>>> {
    Ok(Json(state.engine.list_policies(query.program_id).await?))
}

pub async fn create_policy(
    State(state): State<ServiceState>,
    _caller: Caller,
    ValidJson(body): ValidJson<PolicyBody>,
) -> ApiResult<(StatusCode, Json<ReferralPolicy>)> {
    let policy = state.engine.create_policy(body.into()).await?;
    Ok((StatusCode::CREATED, Json(policy)))
}

pub async fn get_policy(
    State(state): State<ServiceState>,
    _caller: Caller,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<ReferralPolicy>> {
    Ok(Json(state.engine.get_policy(id).await?))
}

pub async fn update_policy(
    State(state): State<ServiceState>,
    _caller: Caller,
    Path(id): Path<Uuid>,
    ValidJson(body): ValidJson<PolicyBody>,
) -> ApiResult<Json<ReferralPolicy>> {
    Ok(Json(state.engine.update_policy(id, body.into()).await?))
}

pub async fn delete_policy(
    State(state): State<ServiceState>,
    _caller: Caller,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    state.engine.delete_policy(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct ProgramBody {
    #[validate(length(min = 1, max = 200))]
    pub title: String,
    #[validate(range(min = 0))]
    pub price: i64,
    pub status: ProgramStatus,
}

/// Catalog sync: mirror a program's price and status.
pub async fn put_program(
    State(state): State<ServiceState>,
    _caller: Caller,
    Path(id): Path<Uuid>,
    ValidJson(body): ValidJson<ProgramBody>,
) -> ApiResult<Json<Program>> {
    let program = Program {
        id,
        title: body.title,
        price: body.price,
        status: body.status,
    };
    Ok(Json(state.engine.upsert_program(program).await?))
}

#[derive(Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct ProfileBody {
    #[validate(length(min = 1, max = 200))]
    pub full_name: String,
    #[validate(email)]
    pub email: String,
    pub role: ProfileRole,
}

/// Identity sync: mirror a user's display name and role.
pub async fn put_profile(
    State(state): State<ServiceState>,
    _caller: Caller,
    Path(id): Path<Uuid>,
    ValidJson(body): ValidJson<ProfileBody>,
) -> ApiResult<Json<Profile>> {
    let profile = Profile {
        id,
        full_name: body.full_name,
        email: body.email,
        role: body.role,
    };
    Ok(Json(state.engine.upsert_profile(profile).await?))
}
