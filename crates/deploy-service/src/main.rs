//! Deploy Service
//!
//! REST API for deploy hooks + background build scheduler

use anyhow::{Context, Result};
use deploy_service::{
    auth::parse_users, create_router, AppState, Authenticator, DeploymentCache, KvStore,
    MemoryStore, OverrideCredentials, RedisStore, Scheduler, ServiceConfig, Settings,
    StatusTracker, StoreBackend, VercelClient,
};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "deploy_service=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load environment variables
    dotenvy::dotenv().ok();

    let config = ServiceConfig::from_env().context("Failed to load configuration")?;

    info!("Starting Deploy Service");
    info!("Store backend: {:?}", config.store_backend);
    info!("Deployment API: {}", config.vercel_api_url);

    let store: Arc<dyn KvStore> = match config.store_backend {
        StoreBackend::Memory => Arc::new(MemoryStore::new()),
        StoreBackend::Redis => {
            info!("Redis URL: {}", config.redis_url);
            Arc::new(
                RedisStore::new(&config.redis_url)
                    .await
                    .context("Failed to connect to Redis")?,
            )
        }
    };

    let users = parse_users(&config.users).context("Invalid DEPLOY_USERS")?;
    if users.is_empty() {
        warn!("DEPLOY_USERS is empty, every API call will be rejected");
    }

    let api = VercelClient::new(&config.vercel_api_url, config.api_timeout())
        .context("Failed to create deployment API client")?;

    let settings = Settings::new(store.clone(), OverrideCredentials::from_env());
    let tracker = Arc::new(StatusTracker::new(
        Arc::new(api),
        DeploymentCache::new(store),
        settings,
    ));
    let schedule_notify = Arc::new(Notify::new());

    // Spawn scheduler task
    let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
    let scheduler_handle = if config.scheduler_enabled {
        let scheduler = Scheduler::new(tracker.clone(), schedule_notify.clone());
        Some(tokio::spawn(scheduler.run(shutdown_rx)))
    } else {
        info!("Build scheduler disabled");
        None
    };

    let state = AppState {
        tracker,
        auth: Authenticator::new(users, config.nonce_secret.clone()),
        schedule_notify,
    };
    let app = create_router(state);

    // Start API server
    let addr = config.api_address();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    info!("Deploy Service API running on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            info!("Shutdown signal received");
        })
        .await
        .context("Server error")?;

    shutdown_tx.send(()).await.ok();
    if let Some(handle) = scheduler_handle {
        handle.await.context("Scheduler task panicked")?;
    }

    Ok(())
}
