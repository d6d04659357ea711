//! Deployment status poller
//!
//! Watches a deployment until it settles. Ticks are completion-chained: the
//! next check is scheduled `interval` after the previous one returned, so at
//! most one request is in flight.

use async_trait::async_trait;
use deploy_hooks_common::{DeploymentDetails, DeploymentState, Error, ErrorKind, Result};
use std::time::Duration;
use tracing::{info, warn};

/// Where the poller reads and reports deployment status
#[async_trait]
pub trait StatusSource: Send + Sync {
    async fn check_status(&self, from: &str) -> Result<DeploymentDetails>;

    async fn update_status(&self, state: &DeploymentState) -> Result<()>;
}

/// Poller configuration
#[derive(Debug, Clone)]
pub struct PollerConfig {
    /// Delay between the end of one check and the start of the next
    pub interval: Duration,

    /// Consecutive `NotFound` answers tolerated before the deployment shows up
    pub not_found_grace: u32,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            not_found_grace: 3,
        }
    }
}

/// How a watch ended
#[derive(Debug)]
pub enum PollOutcome {
    /// Deployment settled and the service recorded it
    Finished {
        state: DeploymentState,
        details: DeploymentDetails,
    },
    /// Deployment settled but reporting the state back failed
    UpdateFailed {
        state: DeploymentState,
        error: Error,
    },
    /// Checking the status failed
    Failed { error: Error, ticks: u32 },
}

pub struct Poller<S> {
    source: S,
    config: PollerConfig,
}

impl<S: StatusSource> Poller<S> {
    pub fn new(source: S, config: PollerConfig) -> Self {
        Self { source, config }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Poll until the deployment created since `from` reaches a terminal state
    pub async fn run(&self, from: &str) -> PollOutcome {
        let mut ticks = 0u32;
        let mut not_found = 0u32;
        let mut seen = false;

        loop {
            tokio::time::sleep(self.config.interval).await;
            ticks += 1;

            let details = match self.source.check_status(from).await {
                Ok(details) => details,
                Err(error) => {
                    if error.kind() == ErrorKind::NotFound
                        && !seen
                        && not_found < self.config.not_found_grace
                    {
                        not_found += 1;
                        warn!(
                            "Deployment not visible yet ({}/{}), retrying",
                            not_found, self.config.not_found_grace
                        );
                        continue;
                    }
                    warn!("Status check failed after {} ticks: {}", ticks, error);
                    return PollOutcome::Failed { error, ticks };
                }
            };
            seen = true;

            let state = details.state.clone();
            if !state.is_terminal() {
                info!("Deployment is {} (tick {})", state, ticks);
                continue;
            }

            info!("Deployment finished: {}", state);
            return match self.source.update_status(&state).await {
                Ok(()) => PollOutcome::Finished { state, details },
                Err(error) => {
                    warn!("Failed to record final status {}: {}", state, error);
                    PollOutcome::UpdateFailed { state, error }
                }
            };
        }
    }
}
