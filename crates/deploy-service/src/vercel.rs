//! Client for the Vercel deployments API and deploy hooks

use async_trait::async_trait;
use deploy_hooks_common::{
    ApiError, DeploymentDetails, DeploymentList, DeploymentSummary, TriggerResponse,
};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::debug;

use crate::settings::DeployCredentials;

/// Default Vercel REST endpoint
pub const DEFAULT_API_URL: &str = "https://api.vercel.com";

/// Operations the status tracker needs from the deployment platform.
///
/// Implementations never retry; that is left to whoever polls.
#[async_trait]
pub trait DeploymentApi: Send + Sync {
    /// Most recent deployments created since `from`
    async fn list_deployments(
        &self,
        credentials: &DeployCredentials,
        from: &str,
        limit: u32,
    ) -> Result<Vec<DeploymentSummary>, ApiError>;

    /// Full details of one deployment
    async fn get_deployment(
        &self,
        credentials: &DeployCredentials,
        id: &str,
    ) -> Result<DeploymentDetails, ApiError>;

    /// POST to the configured deploy hook
    async fn trigger_build(
        &self,
        credentials: &DeployCredentials,
    ) -> Result<TriggerResponse, ApiError>;
}

/// reqwest-based [`DeploymentApi`]
pub struct VercelClient {
    base_url: String,
    client: reqwest::Client,
}

impl VercelClient {
    /// Create a client with a bounded per-request timeout
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ApiError::transport(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    fn scope_params(credentials: &DeployCredentials) -> Vec<(&'static str, String)> {
        let mut params = Vec::new();
        if let Some(team_id) = credentials.team_id() {
            params.push(("teamId", team_id.to_string()));
        }
        if let Some(project_id) = credentials.project_id() {
            params.push(("projectId", project_id.to_string()));
        }
        params
    }

    fn authorize(
        request: reqwest::RequestBuilder,
        credentials: &DeployCredentials,
    ) -> reqwest::RequestBuilder {
        if credentials.bearer_token.is_empty() {
            request
        } else {
            request.bearer_auth(&credentials.bearer_token)
        }
    }

    async fn send<T: DeserializeOwned>(
        request: reqwest::RequestBuilder,
        what: &str,
    ) -> Result<T, ApiError> {
        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                ApiError::transport(format!("Timed out fetching {}", what))
            } else {
                ApiError::transport(format!("Failed to fetch {}: {}", what, e))
            }
        })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ApiError::transport(format!("Failed to read {}: {}", what, e)))?;

        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(ApiError::not_found(format!("{} returned 404", what)));
        }

        if !status.is_success() {
            return Err(ApiError::transport(format!(
                "Failed to fetch {}: HTTP {}: {}",
                what,
                status,
                truncate(&body, 200)
            )));
        }

        serde_json::from_str(&body)
            .map_err(|e| ApiError::malformed(format!("Failed to parse {}: {}", what, e)))
    }
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[async_trait]
impl DeploymentApi for VercelClient {
    async fn list_deployments(
        &self,
        credentials: &DeployCredentials,
        from: &str,
        limit: u32,
    ) -> Result<Vec<DeploymentSummary>, ApiError> {
        let url = format!("{}/v3/deployments", self.base_url);
        let mut params = Self::scope_params(credentials);
        params.push(("limit", limit.to_string()));
        params.push(("from", from.to_string()));

        debug!("Listing deployments: {} from={}", url, from);

        let request = Self::authorize(self.client.get(&url).query(&params), credentials);
        let list: DeploymentList = Self::send(request, "deployment list").await?;
        Ok(list.deployments)
    }

    async fn get_deployment(
        &self,
        credentials: &DeployCredentials,
        id: &str,
    ) -> Result<DeploymentDetails, ApiError> {
        let url = format!("{}/v3/deployments/{}", self.base_url, id);
        let params = Self::scope_params(credentials);

        debug!("Fetching deployment details: {}", url);

        let request = Self::authorize(self.client.get(&url).query(&params), credentials);
        let raw: serde_json::Value = Self::send(request, "deployment details").await?;
        DeploymentDetails::from_value(raw)
    }

    async fn trigger_build(
        &self,
        credentials: &DeployCredentials,
    ) -> Result<TriggerResponse, ApiError> {
        debug!("Posting to deploy hook");

        let request = Self::authorize(self.client.post(&credentials.webhook_url), credentials);
        Self::send(request, "deploy hook response").await
    }
}
