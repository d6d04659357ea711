//! Deploy service client
//!
//! Thin reqwest wrapper over the deploy service endpoints. Action nonces are
//! fetched on first use and reused until the service rejects one, which
//! happens once their tick rolls over or the service secret changes.

use async_trait::async_trait;
use deploy_hooks_common::{
    ApiError, CurrentDeploymentResponse, DeploymentDetails, DeploymentState, Error, ErrorBody,
    ErrorKind, NonceBundle, Result, TriggerResponse, UpdateStatusResponse,
};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

use crate::poller::StatusSource;

/// Header carrying the action nonce
pub const NONCE_HEADER: &str = "x-deploy-nonce";

#[derive(Debug, Clone, Copy)]
enum Action {
    CheckStatus,
    UpdateStatus,
    TriggerBuild,
}

/// Client for the deploy service
pub struct ServiceClient {
    base_url: String,
    token: String,
    client: reqwest::Client,
    nonces: Mutex<Option<NonceBundle>>,
}

impl ServiceClient {
    /// Create a new client
    ///
    /// # Arguments
    /// * `base_url` - The URL of the deploy service (e.g., "http://localhost:8090")
    /// * `token` - Bearer token of a user with the `deploy` capability
    pub fn new(base_url: impl Into<String>, token: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ApiError::transport(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
            client,
            nonces: Mutex::new(None),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send<T: DeserializeOwned>(&self, request: reqwest::RequestBuilder) -> Result<T> {
        let response = request
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| ApiError::transport(format!("Failed to reach deploy service: {}", e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ApiError::transport(format!("Failed to read response: {}", e)))?;

        if !status.is_success() {
            return Err(match serde_json::from_str::<ErrorBody>(&body) {
                Ok(error) => Error::from_kind(error.kind, error.message),
                Err(_) => Error::from_kind(
                    ErrorKind::from_http_status(status.as_u16()),
                    format!("HTTP {}", status),
                ),
            });
        }

        serde_json::from_str(&body)
            .map_err(|e| ApiError::malformed(format!("Failed to parse response: {}", e)).into())
    }

    async fn nonce(&self, action: Action) -> Result<String> {
        let mut cached = self.nonces.lock().await;
        if cached.is_none() {
            *cached = Some(self.nonces().await?);
        }

        let bundle = cached
            .as_ref()
            .ok_or_else(|| Error::Forbidden("no nonces issued".to_string()))?;
        Ok(match action {
            Action::CheckStatus => bundle.check_status.clone(),
            Action::UpdateStatus => bundle.update_status.clone(),
            Action::TriggerBuild => bundle.trigger_build.clone(),
        })
    }

    /// Send a nonce-guarded request, refetching the bundle once on Forbidden
    async fn send_with_nonce<T, F>(&self, action: Action, build: F) -> Result<T>
    where
        T: DeserializeOwned,
        F: Fn(String) -> reqwest::RequestBuilder,
    {
        let nonce = self.nonce(action).await?;
        match self.send(build(nonce)).await {
            Err(Error::Forbidden(reason)) => {
                debug!("Nonce rejected ({}), refetching", reason);
                *self.nonces.lock().await = None;
                let nonce = self.nonce(action).await?;
                self.send(build(nonce)).await
            }
            result => result,
        }
    }

    /// Health check for the deploy service
    pub async fn health_check(&self) -> Result<bool> {
        let response = self
            .client
            .get(self.url("/health"))
            .send()
            .await
            .map_err(|e| ApiError::transport(format!("Failed to reach deploy service: {}", e)))?;

        Ok(response.status().is_success())
    }

    /// Fetch a fresh nonce bundle
    pub async fn nonces(&self) -> Result<NonceBundle> {
        self.send(self.client.get(self.url("/api/nonces"))).await
    }

    /// Cached deployment as seen by the service
    pub async fn current(&self) -> Result<CurrentDeploymentResponse> {
        self.send(self.client.get(self.url("/api/deployment"))).await
    }

    /// Start a build through the deploy hook
    pub async fn trigger_build(&self) -> Result<TriggerResponse> {
        self.send_with_nonce(Action::TriggerBuild, |nonce| {
            self.client
                .post(self.url("/api/deployment/build"))
                .header(NONCE_HEADER, nonce)
        })
        .await
    }

    /// Refresh the tracked deployment, returning the platform's details
    pub async fn check_status(&self, from: &str) -> Result<DeploymentDetails> {
        debug!("Checking deployment status from {}", from);

        let raw: serde_json::Value = self
            .send_with_nonce(Action::CheckStatus, |nonce| {
                self.client
                    .get(self.url("/api/deployment/status"))
                    .query(&[("timestamp", from)])
                    .header(NONCE_HEADER, nonce)
            })
            .await?;

        Ok(DeploymentDetails::from_value(raw)?)
    }

    /// Report a status back to the service
    pub async fn update_status(&self, status: &DeploymentState) -> Result<UpdateStatusResponse> {
        self.send_with_nonce(Action::UpdateStatus, |nonce| {
            self.client
                .post(self.url("/api/deployment/status"))
                .header(NONCE_HEADER, nonce)
                .json(&serde_json::json!({ "status": status }))
        })
        .await
    }
}

#[async_trait]
impl StatusSource for ServiceClient {
    async fn check_status(&self, from: &str) -> Result<DeploymentDetails> {
        ServiceClient::check_status(self, from).await
    }

    async fn update_status(&self, state: &DeploymentState) -> Result<()> {
        ServiceClient::update_status(self, state).await?;
        Ok(())
    }
}
