//! Deploy Service
//!
//! Triggers static-site builds through a deploy hook and tracks the resulting
//! deployment until it settles. Builds start manually, on content publish
//! events or on a schedule.

pub mod auth;
pub mod cache;
pub mod config;
pub mod handlers;
pub mod settings;
pub mod store;
pub mod tracker;
pub mod triggers;
pub mod vercel;

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub use auth::{Authenticator, Capability, NonceAction, Principal};
pub use cache::DeploymentCache;
pub use config::{ServiceConfig, StoreBackend};
pub use handlers::AppState;
pub use settings::{OverrideCredentials, Settings, SettingsUpdate};
pub use store::{KvStore, MemoryStore, RedisStore};
pub use tracker::{StatusTracker, TriggerSource};
pub use triggers::{PublishEvent, Schedule, ScheduleInterval, Scheduler};
pub use vercel::{DeploymentApi, VercelClient};

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    let shared_state = Arc::new(state);

    Router::new()
        .route("/health", get(handlers::health_handler))
        .route("/api/nonces", get(handlers::nonces_handler))
        .route("/api/deployment", get(handlers::current_deployment_handler))
        .route(
            "/api/deployment/status",
            get(handlers::check_status_handler).post(handlers::update_status_handler),
        )
        .route("/api/deployment/build", post(handlers::trigger_build_handler))
        .route("/api/hooks/publish", post(handlers::publish_hook_handler))
        .route(
            "/api/settings",
            get(handlers::get_settings_handler).put(handlers::update_settings_handler),
        )
        .with_state(shared_state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}
