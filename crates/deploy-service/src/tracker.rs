//! Deployment status tracking
//!
//! [`StatusTracker`] drives the tracked deployment through its lifecycle:
//!
//! ```text
//! NONE -> PENDING -> BUILDING -> READY | ERROR | ...
//! ```
//!
//! `NONE` is an empty cache slot. A record reaches `PENDING` when a status check
//! discovers a deployment id, follows the platform's state on every later check,
//! and returns to `NONE` when its TTL runs out or a new build replaces it.
//! While the cached record is `BUILDING`, status checks reuse its id instead of
//! discovering a new one and new builds are refused, so at most one build
//! lineage is tracked at a time. The guarantee is cache-only: two callers that
//! both observe an empty slot can still race.

use deploy_hooks_common::{
    CurrentDeploymentResponse, DeploymentDetails, DeploymentRecord, DeploymentState, Error, Result,
    TriggerResponse,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::cache::DeploymentCache;
use crate::settings::Settings;
use crate::vercel::DeploymentApi;

/// What asked for a build
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    Manual,
    Schedule,
    Publish,
}

impl fmt::Display for TriggerSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TriggerSource::Manual => "manual",
            TriggerSource::Schedule => "schedule",
            TriggerSource::Publish => "publish",
        };
        f.write_str(name)
    }
}

/// The deployment status state machine
pub struct StatusTracker {
    api: Arc<dyn DeploymentApi>,
    cache: DeploymentCache,
    settings: Settings,
}

impl StatusTracker {
    pub fn new(api: Arc<dyn DeploymentApi>, cache: DeploymentCache, settings: Settings) -> Self {
        Self {
            api,
            cache,
            settings,
        }
    }

    pub fn cache(&self) -> &DeploymentCache {
        &self.cache
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Refresh the tracked deployment from the platform.
    ///
    /// `from` correlates the check with a build: when no build is in flight it
    /// is used to discover the most recent deployment created since then.
    /// Returns the platform's raw deployment details.
    pub async fn check_status(&self, from: &str) -> Result<DeploymentDetails> {
        let from = from.trim();
        if from.is_empty() {
            return Err(Error::InvalidInput("\"from\" timestamp is required".to_string()));
        }

        let credentials = self.settings.credentials().await?;

        let (id, known_created) = match self.cache.get().await? {
            Some(record) if record.is_building() => {
                debug!("Reusing in-flight deployment: {}", record.id);
                (record.id, record.created)
            }
            _ => {
                let deployments = self.api.list_deployments(&credentials, from, 1).await?;
                let first = deployments
                    .into_iter()
                    .next()
                    .ok_or_else(|| Error::NotFound("No deployments found".to_string()))?;

                info!("Discovered deployment {} for build started at {}", first.uid, from);

                let record = DeploymentRecord::pending(first.uid.clone(), from);
                self.cache.put(&record).await?;
                (first.uid, from.to_string())
            }
        };

        let details = self.api.get_deployment(&credentials, &id).await?;

        // The platform's creation time supersedes the caller's from-timestamp
        let created = details.created.clone().unwrap_or(known_created);
        let record = DeploymentRecord::new(id, details.state.clone(), created);
        self.cache.put(&record).await?;

        debug!("Deployment {} is {}", record.id, record.status);
        Ok(details)
    }

    /// Record a status observed by a poller.
    ///
    /// Without a tracked deployment this succeeds without writing anything.
    pub async fn update_status(&self, new_status: &str) -> Result<DeploymentState> {
        let new_status = new_status.trim();
        if new_status.is_empty() {
            return Err(Error::InvalidInput("Status param value is required".to_string()));
        }
        let status = DeploymentState::from(new_status);

        match self.cache.get().await? {
            Some(mut record) => {
                info!(
                    "Deployment {} status: {} -> {}",
                    record.id, record.status, status
                );
                record.status = status.clone();
                self.cache.put(&record).await?;
            }
            None => debug!("No tracked deployment, ignoring status {}", status),
        }

        Ok(status)
    }

    /// Fire the deploy hook and seed the cache with the returned job.
    ///
    /// Nothing is cached when the hook call fails.
    pub async fn start_build(&self, source: TriggerSource) -> Result<TriggerResponse> {
        let credentials = self.settings.credentials().await?;
        if credentials.webhook_url.is_empty() {
            return Err(Error::NotConfigured(
                "No deploy webhook address is configured".to_string(),
            ));
        }

        if let Some(record) = self.cache.get().await? {
            if record.is_building() {
                warn!(
                    "Refusing {} build, deployment {} is still building",
                    source, record.id
                );
                return Err(Error::BuildInProgress(record.id));
            }
        }

        let response = self.api.trigger_build(&credentials).await?;

        self.cache.put(&response.seed_record()).await?;
        info!(
            "Started {} build: job {} ({}) created at {}",
            source, response.job.id, response.job.state, response.job.created_at
        );

        Ok(response)
    }

    /// Cached record and previous status, without touching the platform
    pub async fn current(&self) -> Result<CurrentDeploymentResponse> {
        Ok(CurrentDeploymentResponse {
            deployment: self.cache.get().await?,
            previous_status: self.cache.get_previous().await?,
        })
    }
}
