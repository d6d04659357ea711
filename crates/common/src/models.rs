//! Data model shared by the deploy service and its clients

use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

use crate::error::{ApiError, ErrorKind};

/// Deployment state as reported by the deployment platform.
///
/// The set of values is owned by the platform, so this is an opaque string.
/// Only `BUILDING` carries meaning here: it marks the one build in flight.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeploymentState(String);

impl DeploymentState {
    pub const BUILDING: &'static str = "BUILDING";
    pub const PENDING: &'static str = "PENDING";
    pub const READY: &'static str = "READY";
    pub const ERROR: &'static str = "ERROR";

    pub fn new(state: impl Into<String>) -> Self {
        Self(state.into())
    }

    pub fn building() -> Self {
        Self::new(Self::BUILDING)
    }

    pub fn pending() -> Self {
        Self::new(Self::PENDING)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_building(&self) -> bool {
        self.0 == Self::BUILDING
    }

    /// Whether a watcher can stop polling
    pub fn is_terminal(&self) -> bool {
        self.0 != Self::BUILDING && self.0 != Self::PENDING
    }
}

impl fmt::Display for DeploymentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeploymentState {
    fn from(state: &str) -> Self {
        Self::new(state)
    }
}

/// The single tracked deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentRecord {
    /// Identifier assigned by the deployment platform
    pub id: String,

    /// Last known state
    pub status: DeploymentState,

    /// Correlation timestamp, platform supplied or caller supplied
    pub created: String,
}

impl DeploymentRecord {
    pub fn new(id: impl Into<String>, status: DeploymentState, created: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status,
            created: created.into(),
        }
    }

    /// Record for a deployment whose id is known but whose state is not yet confirmed
    pub fn pending(id: impl Into<String>, created: impl Into<String>) -> Self {
        Self::new(id, DeploymentState::pending(), created)
    }

    pub fn is_building(&self) -> bool {
        self.status.is_building()
    }
}

/// Accepts either a JSON string or a JSON number and keeps it as text.
///
/// The platform reports epoch milliseconds while callers pass whatever the
/// trigger response gave them, so both shapes end up in the same field.
pub fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Int(i64),
        Float(f64),
    }

    Ok(match Raw::deserialize(deserializer)? {
        Raw::Text(text) => text,
        Raw::Int(n) => n.to_string(),
        Raw::Float(n) => n.to_string(),
    })
}

fn timestamp_from_value(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// One entry of `GET /deployments`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentSummary {
    pub uid: String,

    #[serde(default)]
    pub state: Option<DeploymentState>,

    #[serde(default, deserialize_with = "deserialize_optional_timestamp")]
    pub created: Option<String>,
}

fn deserialize_optional_timestamp<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(timestamp_from_value))
}

/// Body of `GET /deployments`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeploymentList {
    #[serde(default)]
    pub deployments: Vec<DeploymentSummary>,
}

/// Body of `GET /deployments/{id}`, parsed for the fields the tracker needs
/// while keeping the raw document for the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct DeploymentDetails {
    pub state: DeploymentState,
    pub created: Option<String>,
    pub raw: serde_json::Value,
}

impl DeploymentDetails {
    pub fn from_value(raw: serde_json::Value) -> Result<Self, ApiError> {
        let state = raw
            .get("state")
            .and_then(|s| s.as_str())
            .map(DeploymentState::from)
            .ok_or_else(|| ApiError::malformed("Invalid deployment details format"))?;

        let created = raw.get("created").and_then(timestamp_from_value);

        Ok(Self {
            state,
            created,
            raw,
        })
    }
}

/// Job descriptor returned by the deploy hook
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildJob {
    pub id: String,

    pub state: DeploymentState,

    #[serde(rename = "createdAt", deserialize_with = "deserialize_timestamp")]
    pub created_at: String,
}

/// Body of a deploy hook POST
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerResponse {
    pub job: BuildJob,
}

impl TriggerResponse {
    /// Cache record seeded from the job descriptor
    pub fn seed_record(&self) -> DeploymentRecord {
        DeploymentRecord::new(
            self.job.id.clone(),
            self.job.state.clone(),
            self.job.created_at.clone(),
        )
    }
}

/// Query of the status-check endpoint
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckStatusQuery {
    #[serde(default)]
    pub timestamp: Option<String>,
}

/// Body of the status-update endpoint
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateStatusRequest {
    #[serde(default)]
    pub status: Option<String>,
}

/// Response from the status-update endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateStatusResponse {
    pub success: bool,
    pub status: DeploymentState,
}

/// Snapshot of the cached deployment
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CurrentDeploymentResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deployment: Option<DeploymentRecord>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_status: Option<DeploymentState>,
}

/// Action tokens issued to an authenticated caller
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NonceBundle {
    pub check_status: String,
    pub update_status: String,
    pub trigger_build: String,

    /// Only issued to callers allowed to change settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_settings: Option<String>,
}

/// Structured failure body returned by every endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub status: String,
    pub kind: ErrorKind,
    pub message: String,
}

impl ErrorBody {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            status: "error".to_string(),
            kind,
            message: message.into(),
        }
    }
}
