//! API handlers for the deploy service

use axum::{
    extract::{rejection::JsonRejection, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use deploy_hooks_common::{
    CheckStatusQuery, CurrentDeploymentResponse, Error, ErrorBody, NonceBundle, TriggerResponse,
    UpdateStatusRequest, UpdateStatusResponse,
};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{error, info, warn};

use crate::auth::{Authenticator, Capability, NonceAction};
use crate::settings::{SettingsUpdate, SettingsView};
use crate::tracker::{StatusTracker, TriggerSource};
use crate::triggers::{handle_publish, PublishEvent, PublishOutcome};

/// Shared application state
pub struct AppState {
    pub tracker: Arc<StatusTracker>,
    pub auth: Authenticator,
    /// Wakes the build scheduler after schedule settings change
    pub schedule_notify: Arc<Notify>,
}

/// Error returned by every handler
#[derive(Debug)]
pub struct HandlerError {
    pub status: StatusCode,
    pub body: ErrorBody,
}

impl IntoResponse for HandlerError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

impl From<Error> for HandlerError {
    fn from(err: Error) -> Self {
        let kind = err.kind();
        let status =
            StatusCode::from_u16(kind.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        if status.is_server_error() {
            error!("Request failed: {}", err);
        } else {
            warn!("Request rejected: {}", err);
        }

        HandlerError {
            status,
            body: ErrorBody::new(kind, err.to_string()),
        }
    }
}

type HandlerResult<T> = Result<Json<T>, HandlerError>;

/// Request body, unpacked only after the caller is authorized
type Body<T> = Result<Json<T>, JsonRejection>;

fn body<T>(payload: Body<T>) -> Result<T, Error> {
    payload
        .map(|Json(value)| value)
        .map_err(|rejection| Error::InvalidInput(rejection.body_text()))
}

/// Health check
pub async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "deploy-service"
    }))
}

/// Issue the caller's action nonces
pub async fn nonces_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> HandlerResult<NonceBundle> {
    let principal = state.auth.authorize(&headers, Capability::Deploy, None)?;
    Ok(Json(state.auth.nonce_bundle(&principal)?))
}

/// Cached deployment and previous status, no upstream call
pub async fn current_deployment_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> HandlerResult<CurrentDeploymentResponse> {
    state.auth.authorize(&headers, Capability::Deploy, None)?;
    Ok(Json(state.tracker.current().await?))
}

/// Refresh the tracked deployment and return the platform's details
pub async fn check_status_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<CheckStatusQuery>,
) -> HandlerResult<serde_json::Value> {
    state
        .auth
        .authorize(&headers, Capability::Deploy, Some(NonceAction::CheckStatus))?;

    let from = query
        .timestamp
        .filter(|t| !t.trim().is_empty())
        .ok_or_else(|| Error::InvalidInput("\"From\" param value is required".to_string()))?;

    let details = state.tracker.check_status(&from).await?;
    Ok(Json(details.raw))
}

/// Record a status reported by a poller
pub async fn update_status_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    payload: Body<UpdateStatusRequest>,
) -> HandlerResult<UpdateStatusResponse> {
    state
        .auth
        .authorize(&headers, Capability::Deploy, Some(NonceAction::UpdateStatus))?;
    let payload = body(payload)?;

    let status = payload
        .status
        .ok_or_else(|| Error::InvalidInput("Status param value is required".to_string()))?;

    let status = state.tracker.update_status(&status).await?;
    Ok(Json(UpdateStatusResponse {
        success: true,
        status,
    }))
}

/// Start a build through the deploy hook
pub async fn trigger_build_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> HandlerResult<TriggerResponse> {
    let principal = state
        .auth
        .authorize(&headers, Capability::Deploy, Some(NonceAction::TriggerBuild))?;

    info!("Build requested by {}", principal.name);
    Ok(Json(state.tracker.start_build(TriggerSource::Manual).await?))
}

/// Content publish notification
pub async fn publish_hook_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    event: Body<PublishEvent>,
) -> HandlerResult<PublishOutcome> {
    state.auth.authorize(&headers, Capability::Deploy, None)?;
    let event = body(event)?;
    Ok(Json(handle_publish(&state.tracker, &event).await?))
}

pub async fn get_settings_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> HandlerResult<SettingsView> {
    state
        .auth
        .authorize(&headers, Capability::AdjustSettings, None)?;
    Ok(Json(state.tracker.settings().view().await?))
}

/// Partial settings update
pub async fn update_settings_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    update: Body<SettingsUpdate>,
) -> HandlerResult<SettingsView> {
    let principal = state.auth.authorize(
        &headers,
        Capability::AdjustSettings,
        Some(NonceAction::UpdateSettings),
    )?;
    let update = body(update)?;

    let settings = state.tracker.settings();
    if settings.apply(&update).await? {
        state.schedule_notify.notify_one();
    }
    info!("Settings updated by {}", principal.name);

    Ok(Json(settings.view().await?))
}
