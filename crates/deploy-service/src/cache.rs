//! Single-slot cache of the tracked deployment

use deploy_hooks_common::{DeploymentRecord, DeploymentState, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::store::KvStore;

/// Key holding the current [`DeploymentRecord`]
pub const CURRENT_DEPLOYMENT_KEY: &str = "deploy:current_deployment";

/// Key holding the status the current record had before its last write
pub const PREVIOUS_STATUS_KEY: &str = "deploy:previous_deployment_status";

/// Lifetime of both keys, counted from the last write
pub const DEPLOYMENT_TTL: Duration = Duration::from_secs(12 * 60 * 60);

/// Owner of the tracked deployment.
///
/// Every component reads and writes the record through this type; nothing
/// holds a private copy.
#[derive(Clone)]
pub struct DeploymentCache {
    store: Arc<dyn KvStore>,
    ttl: Duration,
}

impl DeploymentCache {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self::with_ttl(store, DEPLOYMENT_TTL)
    }

    pub fn with_ttl(store: Arc<dyn KvStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    /// Current record, `None` if never set or expired
    pub async fn get(&self) -> Result<Option<DeploymentRecord>> {
        match self.store.get(CURRENT_DEPLOYMENT_KEY).await? {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    /// Replace the current record.
    ///
    /// The outgoing record's status is copied to the previous-status slot first.
    pub async fn put(&self, record: &DeploymentRecord) -> Result<()> {
        if let Some(outgoing) = self.get().await? {
            let previous = serde_json::to_string(&outgoing.status)?;
            self.store
                .set(PREVIOUS_STATUS_KEY, &previous, Some(self.ttl))
                .await?;
        }

        let json = serde_json::to_string(record)?;
        self.store
            .set(CURRENT_DEPLOYMENT_KEY, &json, Some(self.ttl))
            .await?;

        debug!(
            "Cached deployment: {} status: {} created: {}",
            record.id, record.status, record.created
        );
        Ok(())
    }

    /// Status the record had before the last write
    pub async fn get_previous(&self) -> Result<Option<DeploymentState>> {
        match self.store.get(PREVIOUS_STATUS_KEY).await? {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }
}
