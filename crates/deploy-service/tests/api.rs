//! Integration tests for the Deploy Service API

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{Method, Request, StatusCode},
};
use deploy_hooks_common::{
    ApiError, BuildJob, DeploymentDetails, DeploymentRecord, DeploymentState, DeploymentSummary,
    TriggerResponse,
};
use deploy_service::{
    auth::{parse_users, NONCE_HEADER},
    create_router, settings::DeployCredentials, settings::SettingKey, AppState, Authenticator,
    DeploymentApi, DeploymentCache, MemoryStore, NonceAction, OverrideCredentials, Settings,
    StatusTracker,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::Notify;
use tower::ServiceExt; // for `oneshot`

const USERS: &str = "alice:alice-token:deploy+adjust_settings,bob:bob-token:deploy";
const SECRET: &str = "integration-secret";

/// Upstream that always reports a single building deployment
struct FakeApi;

#[async_trait]
impl DeploymentApi for FakeApi {
    async fn list_deployments(
        &self,
        _credentials: &DeployCredentials,
        _from: &str,
        _limit: u32,
    ) -> Result<Vec<DeploymentSummary>, ApiError> {
        Ok(vec![DeploymentSummary {
            uid: "dpl_abc".to_string(),
            state: Some(DeploymentState::building()),
            created: None,
        }])
    }

    async fn get_deployment(
        &self,
        _credentials: &DeployCredentials,
        id: &str,
    ) -> Result<DeploymentDetails, ApiError> {
        DeploymentDetails::from_value(json!({
            "uid": id,
            "state": "BUILDING",
            "created": 1704067200000_i64,
            "url": "site-abc.vercel.app"
        }))
    }

    async fn trigger_build(
        &self,
        _credentials: &DeployCredentials,
    ) -> Result<TriggerResponse, ApiError> {
        Ok(TriggerResponse {
            job: BuildJob {
                id: "job_1".to_string(),
                state: DeploymentState::pending(),
                created_at: "1704067100000".to_string(),
            },
        })
    }
}

struct TestApp {
    router: axum::Router,
    tracker: Arc<StatusTracker>,
    /// Same users and secret as the router, used to mint nonces
    auth: Authenticator,
}

impl TestApp {
    async fn new() -> Self {
        let store = Arc::new(MemoryStore::new());
        let settings = Settings::new(store.clone(), OverrideCredentials::default());
        settings
            .set(SettingKey::WebhookAddress, "https://hooks.example/deploy")
            .await
            .unwrap();
        settings
            .set(SettingKey::BearerToken, "vercel-secret-token")
            .await
            .unwrap();

        let tracker = Arc::new(StatusTracker::new(
            Arc::new(FakeApi),
            DeploymentCache::new(store),
            settings,
        ));

        let state = AppState {
            tracker: tracker.clone(),
            auth: Authenticator::new(parse_users(USERS).unwrap(), SECRET),
            schedule_notify: Arc::new(Notify::new()),
        };

        Self {
            router: create_router(state),
            tracker,
            auth: Authenticator::new(parse_users(USERS).unwrap(), SECRET),
        }
    }

    fn nonce(&self, token: &str, action: NonceAction) -> String {
        let users = parse_users(USERS).unwrap();
        self.auth.issue_nonce(&users[token], action).unwrap()
    }

    async fn send(
        &self,
        method: Method,
        uri: &str,
        token: Option<&str>,
        nonce: Option<String>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut request = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            request = request.header("authorization", format!("Bearer {}", token));
        }
        if let Some(nonce) = nonce {
            request = request.header(NONCE_HEADER, nonce);
        }
        let body = match body {
            Some(body) => {
                request = request.header("content-type", "application/json");
                Body::from(serde_json::to_vec(&body).unwrap())
            }
            None => Body::empty(),
        };

        let response = self
            .router
            .clone()
            .oneshot(request.body(body).unwrap())
            .await
            .unwrap();

        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }
}

#[tokio::test]
async fn test_health_check() {
    let app = TestApp::new().await;
    let (status, json) = app.send(Method::GET, "/health", None, None, None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "healthy");
    assert_eq!(json["service"], "deploy-service");
}

#[tokio::test]
async fn test_missing_token_is_unauthorized() {
    let app = TestApp::new().await;
    let (status, json) = app
        .send(Method::GET, "/api/deployment", None, None, None)
        .await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(json["status"], "error");
    assert_eq!(json["kind"], "unauthorized");
}

#[tokio::test]
async fn test_nonce_bundle_depends_on_capabilities() {
    let app = TestApp::new().await;

    let (status, alice) = app
        .send(Method::GET, "/api/nonces", Some("alice-token"), None, None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert!(alice["update_settings"].is_string());
    assert_eq!(alice["check_status"], app.nonce("alice-token", NonceAction::CheckStatus));

    let (_, bob) = app
        .send(Method::GET, "/api/nonces", Some("bob-token"), None, None)
        .await;
    assert!(bob.get("update_settings").is_none());
}

#[tokio::test]
async fn test_check_status_requires_nonce_and_timestamp() {
    let app = TestApp::new().await;

    let (status, json) = app
        .send(
            Method::GET,
            "/api/deployment/status?timestamp=1704067100000",
            Some("bob-token"),
            None,
            None,
        )
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(json["kind"], "forbidden");

    // A nonce for another action is rejected too
    let (status, _) = app
        .send(
            Method::GET,
            "/api/deployment/status?timestamp=1704067100000",
            Some("bob-token"),
            Some(app.nonce("bob-token", NonceAction::UpdateStatus)),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, json) = app
        .send(
            Method::GET,
            "/api/deployment/status",
            Some("bob-token"),
            Some(app.nonce("bob-token", NonceAction::CheckStatus)),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["kind"], "invalid_input");
}

#[tokio::test]
async fn test_check_status_returns_raw_details_and_caches_record() {
    let app = TestApp::new().await;

    let (status, json) = app
        .send(
            Method::GET,
            "/api/deployment/status?timestamp=1704067100000",
            Some("bob-token"),
            Some(app.nonce("bob-token", NonceAction::CheckStatus)),
            None,
        )
        .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["state"], "BUILDING");
    assert_eq!(json["url"], "site-abc.vercel.app");

    let (status, json) = app
        .send(Method::GET, "/api/deployment", Some("bob-token"), None, None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["deployment"]["id"], "dpl_abc");
    assert_eq!(json["deployment"]["status"], "BUILDING");
    assert_eq!(json["deployment"]["created"], "1704067200000");
    // The discovery write left PENDING behind as the previous status
    assert_eq!(json["previous_status"], "PENDING");
}

#[tokio::test]
async fn test_update_status() {
    let app = TestApp::new().await;
    app.tracker
        .cache()
        .put(&DeploymentRecord::new("dpl_abc", DeploymentState::building(), "1"))
        .await
        .unwrap();

    let (status, json) = app
        .send(
            Method::POST,
            "/api/deployment/status",
            Some("bob-token"),
            Some(app.nonce("bob-token", NonceAction::UpdateStatus)),
            Some(json!({ "status": "READY" })),
        )
        .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["success"], true);
    assert_eq!(json["status"], "READY");

    let record = app.tracker.cache().get().await.unwrap().unwrap();
    assert_eq!(record.status.as_str(), "READY");
    assert_eq!(
        app.tracker.cache().get_previous().await.unwrap(),
        Some(DeploymentState::building())
    );

    let (status, json) = app
        .send(
            Method::POST,
            "/api/deployment/status",
            Some("bob-token"),
            Some(app.nonce("bob-token", NonceAction::UpdateStatus)),
            Some(json!({})),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["message"], "Invalid input: Status param value is required");
}

#[tokio::test]
async fn test_trigger_build_and_overlap_guard() {
    let app = TestApp::new().await;

    let (status, json) = app
        .send(
            Method::POST,
            "/api/deployment/build",
            Some("bob-token"),
            Some(app.nonce("bob-token", NonceAction::TriggerBuild)),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["job"]["id"], "job_1");
    assert_eq!(json["job"]["createdAt"], "1704067100000");

    app.tracker
        .cache()
        .put(&DeploymentRecord::new("dpl_abc", DeploymentState::building(), "1"))
        .await
        .unwrap();

    let (status, json) = app
        .send(
            Method::POST,
            "/api/deployment/build",
            Some("bob-token"),
            Some(app.nonce("bob-token", NonceAction::TriggerBuild)),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(json["kind"], "conflict");
}

#[tokio::test]
async fn test_settings_require_capability_and_mask_token() {
    let app = TestApp::new().await;

    let (status, _) = app
        .send(Method::GET, "/api/settings", Some("bob-token"), None, None)
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, json) = app
        .send(Method::GET, "/api/settings", Some("alice-token"), None, None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["credentials_source"], "stored");
    assert_eq!(json["bearer_token"], "***************oken");

    let (status, json) = app
        .send(
            Method::PUT,
            "/api/settings",
            Some("alice-token"),
            Some(app.nonce("alice-token", NonceAction::UpdateSettings)),
            Some(json!({
                "team_id": "team_42",
                "enable_scheduled_builds": true,
                "schedule_interval": "twicedaily",
                "schedule_time": "06:15"
            })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["team_id"], "team_42");
    assert_eq!(json["enable_scheduled_builds"], true);
    assert_eq!(json["schedule_interval"], "twicedaily");
    assert_eq!(json["schedule_time"], "06:15");

    let (status, _) = app
        .send(
            Method::PUT,
            "/api/settings",
            Some("alice-token"),
            Some(app.nonce("alice-token", NonceAction::UpdateSettings)),
            Some(json!({ "schedule_time": "noon" })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_publish_hook_respects_setting() {
    let app = TestApp::new().await;
    let event = json!({
        "event": "transition",
        "new_status": "publish",
        "old_status": "draft"
    });

    let (status, json) = app
        .send(
            Method::POST,
            "/api/hooks/publish",
            Some("bob-token"),
            None,
            Some(event.clone()),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["triggered"], false);

    app.tracker
        .settings()
        .set(SettingKey::EnableOnPostUpdate, "true")
        .await
        .unwrap();

    let (status, json) = app
        .send(
            Method::POST,
            "/api/hooks/publish",
            Some("bob-token"),
            None,
            Some(event),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["triggered"], true);
    assert_eq!(json["job"]["id"], "job_1");
}

#[tokio::test]
async fn test_auth_runs_before_body_is_parsed() {
    let app = TestApp::new().await;

    let (status, json) = app
        .send(Method::POST, "/api/deployment/status", None, None, None)
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(json["kind"], "unauthorized");

    let (status, json) = app
        .send(
            Method::POST,
            "/api/hooks/publish",
            Some("wrong-token"),
            None,
            Some(json!("not an event")),
        )
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(json["kind"], "unauthorized");

    let (status, json) = app
        .send(
            Method::PUT,
            "/api/settings",
            Some("bob-token"),
            None,
            Some(json!(["not", "settings"])),
        )
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(json["kind"], "forbidden");
}

#[tokio::test]
async fn test_malformed_body_is_invalid_input() {
    let app = TestApp::new().await;

    let (status, json) = app
        .send(
            Method::POST,
            "/api/deployment/status",
            Some("bob-token"),
            Some(app.nonce("bob-token", NonceAction::UpdateStatus)),
            Some(json!({ "status": 5 })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["status"], "error");
    assert_eq!(json["kind"], "invalid_input");

    let (status, json) = app
        .send(
            Method::POST,
            "/api/deployment/status",
            Some("bob-token"),
            Some(app.nonce("bob-token", NonceAction::UpdateStatus)),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["kind"], "invalid_input");
}
