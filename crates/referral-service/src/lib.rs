//! REST surface of the referral engine.
//!
//! Caller identity is asserted by the authenticating gateway through the
//! `x-user-id` header; this service trusts it and checks roles against the
//! mirrored profiles where an operation is role-restricted.

#![deny(unsafe_code)]

pub mod config;
pub mod error;
pub mod extract;
pub mod handlers;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post, put};
use axum::Router;
use config::{ServerConfig, ServiceConfig};
use error::ServiceError;
use referral_core::ReferralEngine;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Shared handler state
#[derive(Clone)]
pub struct ServiceState {
    pub engine: Arc<ReferralEngine>,
}

impl ServiceState {
    pub async fn bootstrap(config: &ServiceConfig) -> Result<Self, ServiceError> {
        let engine = ReferralEngine::bootstrap(config.engine.clone()).await?;
        Ok(Self::new(engine))
    }

    pub fn new(engine: ReferralEngine) -> Self {
        Self {
            engine: Arc::new(engine),
        }
    }
}

pub fn build_router(state: ServiceState, server: &ServerConfig) -> Router {
    let router = Router::new()
        .route("/v1/health", get(handlers::health))
        // Referral codes
        .route("/v1/referral/validate", get(handlers::validate_code))
        .route("/v1/referral/codes", post(handlers::my_code))
        .route("/v1/referral/leaderboard", get(handlers::leaderboard))
        // Enrollments
        .route(
            "/v1/enrollments",
            get(handlers::list_enrollments).post(handlers::enroll),
        )
        // Administration
        .route(
            "/v1/admin/enrollments/:id/status",
            post(handlers::apply_status_event),
        )
        .route(
            "/v1/admin/referral-policies",
            get(handlers::list_policies).post(handlers::create_policy),
        )
        .route(
            "/v1/admin/referral-policies/:id",
            get(handlers::get_policy)
                .put(handlers::update_policy)
                .delete(handlers::delete_policy),
        )
        .route("/v1/admin/referral-codes", post(handlers::create_code))
        .route(
            "/v1/admin/referral-codes/:id/deactivate",
            post(handlers::deactivate_code),
        )
        // Collaborator sync
        .route("/v1/admin/programs/:id", put(handlers::put_program))
        .route("/v1/admin/profiles/:id", put(handlers::put_profile))
        .layer(DefaultBodyLimit::max(server.max_body_size))
        .layer(TraceLayer::new_for_http());

    let router = if server.enable_cors {
        router.layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
    } else {
        router
    };

    router.with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use referral_core::ReferralEngineConfig;
    use serde_json::{json, Value};
    use tower::ServiceExt;
    use uuid::Uuid;

    async fn app() -> Router {
        let config = ServiceConfig {
            engine: ReferralEngineConfig {
                log_notifications: false,
                ..ReferralEngineConfig::default()
            },
            ..ServiceConfig::default()
        };
        let state = ServiceState::bootstrap(&config).await.unwrap();
        build_router(state, &config.server)
    }

    async fn send(
        app: &Router,
        method: &str,
        uri: &str,
        user: Option<Uuid>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut request = Request::builder().method(method).uri(uri);
        if let Some(user) = user {
            request = request.header("x-user-id", user.to_string());
        }
        let request = match body {
            Some(body) => request
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => request.body(Body::empty()).unwrap(),
        };

        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    async fn seed_program(app: &Router, admin: Uuid, price: i64) -> Uuid {
        let id = Uuid::new_v4();
        let (status, _) = send(
            app,
            "PUT",
            &format!("/v1/admin/programs/{id}"),
            Some(admin),
            Some(json!({"title": "Public Speaking Bootcamp", "price": price, "status": "published"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        id
    }

    async fn seed_profile(app: &Router, admin: Uuid, id: Uuid, role: &str) {
        let (status, _) = send(
            app,
            "PUT",
            &format!("/v1/admin/profiles/{id}"),
            Some(admin),
            Some(json!({"full_name": "Rina Wijaya", "email": "rina@example.com", "role": role})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    fn enroll_body(program_id: Uuid, code: Option<&str>) -> Value {
        json!({
            "program_id": program_id,
            "participant": {
                "full_name": "Bima Santoso",
                "email": "bima@example.com",
                "organization": "PT Maju"
            },
            "referral_code": code
        })
    }

    #[tokio::test]
    async fn health_reports_storage_backend() {
        let app = app().await;
        let (status, body) = send(&app, "GET", "/v1/health", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["storage"], "memory");
    }

    #[tokio::test]
    async fn trainer_code_drives_a_discounted_enrollment() {
        let app = app().await;
        let admin = Uuid::new_v4();
        let trainer = Uuid::new_v4();
        let participant = Uuid::new_v4();
        let program_id = seed_program(&app, admin, 400_000).await;
        seed_profile(&app, admin, trainer, "trainer").await;

        let (status, policy) = send(
            &app,
            "POST",
            "/v1/admin/referral-policies",
            Some(admin),
            Some(json!({
                "program_id": program_id,
                "name": "Launch promo",
                "discount": {"type": "percentage", "value": 10.0},
                "commission": {"type": "fixed", "value": 15000}
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(policy["is_active"], true);

        let (status, code) = send(&app, "POST", "/v1/referral/codes", Some(trainer), None).await;
        assert_eq!(status, StatusCode::OK);
        let value = code["code"].as_str().unwrap().to_string();

        let (status, again) = send(&app, "POST", "/v1/referral/codes", Some(trainer), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(again["id"], code["id"]);

        let (status, valid) = send(
            &app,
            "GET",
            &format!("/v1/referral/validate?code={}", value.to_lowercase()),
            None,
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(valid["code_id"], code["id"]);

        let (status, outcome) = send(
            &app,
            "POST",
            "/v1/enrollments",
            Some(participant),
            Some(enroll_body(program_id, Some(&value))),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(outcome["final_price"], 360_000);
        assert_eq!(outcome["discount_applied"], 40_000);
        assert_eq!(outcome["commission_computed"], 15_000);
        assert_eq!(outcome["enrollment"]["status"], "pending");
        assert_eq!(outcome["tracking"]["status"], "pending");
        assert_eq!(outcome["replayed"], false);

        let (status, listed) = send(&app, "GET", "/v1/enrollments", Some(participant), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(listed.as_array().unwrap().len(), 1);

        let enrollment_id = outcome["enrollment"]["id"].as_str().unwrap().to_string();
        let (status, change) = send(
            &app,
            "POST",
            &format!("/v1/admin/enrollments/{enrollment_id}/status"),
            Some(admin),
            Some(json!({"event": "approve"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(change["enrollment"]["status"], "approved");
        assert_eq!(change["tracking"]["status"], "confirmed");

        let (status, err) = send(
            &app,
            "POST",
            &format!("/v1/admin/enrollments/{enrollment_id}/status"),
            Some(admin),
            Some(json!({"event": "approve"})),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(err["code"], "INVALID_TRANSITION");

        let (status, board) = send(
            &app,
            "GET",
            "/v1/referral/leaderboard?scope=trainer&period=month&limit=5",
            None,
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(board[0]["actor_name"], "Rina Wijaya");
        assert_eq!(board[0]["confirmed_referrals"], 1);
        assert_eq!(board[0]["conversion_rate"], 100.0);
    }

    #[tokio::test]
    async fn identity_and_role_are_enforced() {
        let app = app().await;
        let admin = Uuid::new_v4();
        let participant = Uuid::new_v4();
        seed_profile(&app, admin, participant, "participant").await;

        let (status, body) = send(&app, "POST", "/v1/referral/codes", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["code"], "UNAUTHENTICATED");

        let (status, body) = send(&app, "POST", "/v1/referral/codes", Some(participant), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["code"], "FORBIDDEN");

        let (status, _) = send(
            &app,
            "GET",
            &format!("/v1/enrollments?participant_id={}", Uuid::new_v4()),
            Some(participant),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn request_schema_is_strict() {
        let app = app().await;
        let user = Uuid::new_v4();
        let program_id = seed_program(&app, user, 100_000).await;

        let mut unknown = enroll_body(program_id, None);
        unknown["status"] = json!("approved");
        let (status, body) = send(&app, "POST", "/v1/enrollments", Some(user), Some(unknown)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "BAD_REQUEST");

        let mut bad_email = enroll_body(program_id, None);
        bad_email["participant"]["email"] = json!("not-an-email");
        let (status, body) =
            send(&app, "POST", "/v1/enrollments", Some(user), Some(bad_email)).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["code"], "VALIDATION_ERROR");
        assert!(body["details"].is_object());
    }

    #[tokio::test]
    async fn code_rejections_keep_their_reasons() {
        let app = app().await;
        let admin = Uuid::new_v4();
        let program_id = seed_program(&app, admin, 250_000).await;

        let (status, body) =
            send(&app, "GET", "/v1/referral/validate?code=NOPE99", None, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "CODE_NOT_FOUND");

        let (status, _) = send(
            &app,
            "POST",
            "/v1/admin/referral-codes",
            Some(admin),
            Some(json!({"code": "ONCE01", "trainer_id": Uuid::new_v4(), "max_uses": 1})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = send(
            &app,
            "POST",
            "/v1/admin/referral-codes",
            Some(admin),
            Some(json!({
                "code": "GONE01",
                "trainer_id": Uuid::new_v4(),
                "valid_until": "2020-01-01T00:00:00Z"
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = send(
            &app,
            "POST",
            "/v1/enrollments",
            Some(Uuid::new_v4()),
            Some(enroll_body(program_id, Some("ONCE01"))),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = send(
            &app,
            "POST",
            "/v1/enrollments",
            Some(Uuid::new_v4()),
            Some(enroll_body(program_id, Some("ONCE01"))),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["code"], "QUOTA_EXCEEDED");

        let (status, body) =
            send(&app, "GET", "/v1/referral/validate?code=GONE01", None, None).await;
        assert_eq!(status, StatusCode::GONE);
        assert_eq!(body["code"], "CODE_EXPIRED");
    }

    #[tokio::test]
    async fn policy_crud_round_trip() {
        let app = app().await;
        let admin = Uuid::new_v4();
        let program_id = seed_program(&app, admin, 500_000).await;
        let draft = json!({
            "program_id": program_id,
            "name": "Alumni",
            "discount": {"type": "fixed", "value": 50000},
            "commission": {"type": "percentage", "value": 5.0}
        });

        let (status, created) = send(
            &app,
            "POST",
            "/v1/admin/referral-policies",
            Some(admin),
            Some(draft.clone()),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let id = created["id"].as_str().unwrap().to_string();
        let path = format!("/v1/admin/referral-policies/{id}");

        let mut renamed = draft;
        renamed["name"] = json!("Alumni 2024");
        let (status, updated) = send(&app, "PUT", &path, Some(admin), Some(renamed)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(updated["name"], "Alumni 2024");

        let (status, listed) = send(
            &app,
            "GET",
            &format!("/v1/admin/referral-policies?program_id={program_id}"),
            Some(admin),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(listed.as_array().unwrap().len(), 1);

        let (status, _) = send(&app, "DELETE", &path, Some(admin), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, body) = send(&app, "GET", &path, Some(admin), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "NOT_FOUND");
    }

    #[tokio::test]
    async fn leaderboard_rejects_unknown_scope() {
        let app = app().await;
        let (status, body) = send(
            &app,
            "GET",
            "/v1/referral/leaderboard?scope=everyone",
            None,
            None,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "BAD_REQUEST");
    }
}
