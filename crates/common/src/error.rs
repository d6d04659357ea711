use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Failure classes of the deployment platform client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiErrorKind {
    /// Network failure, timeout or non-2xx response
    Transport,
    /// Upstream answered 404
    NotFound,
    /// Body could not be decoded or lacks required fields
    MalformedResponse,
}

/// Typed error surfaced by every deployment platform call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind}: {detail}")]
pub struct ApiError {
    pub kind: ApiErrorKind,
    pub detail: String,
}

impl ApiError {
    pub fn transport(detail: impl Into<String>) -> Self {
        Self {
            kind: ApiErrorKind::Transport,
            detail: detail.into(),
        }
    }

    pub fn not_found(detail: impl Into<String>) -> Self {
        Self {
            kind: ApiErrorKind::NotFound,
            detail: detail.into(),
        }
    }

    pub fn malformed(detail: impl Into<String>) -> Self {
        Self {
            kind: ApiErrorKind::MalformedResponse,
            detail: detail.into(),
        }
    }
}

impl fmt::Display for ApiErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ApiErrorKind::Transport => "transport error",
            ApiErrorKind::NotFound => "not found",
            ApiErrorKind::MalformedResponse => "malformed response",
        };
        f.write_str(label)
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Not configured: {0}")]
    NotConfigured(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("A build is already in progress: {0}")]
    BuildInProgress(String),

    #[error("Deployment API error: {0}")]
    Api(#[from] ApiError),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Flat classification used for HTTP mapping and retry decisions.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidInput(_) => ErrorKind::InvalidInput,
            Error::Unauthorized => ErrorKind::Unauthorized,
            Error::Forbidden(_) => ErrorKind::Forbidden,
            Error::NotConfigured(_) => ErrorKind::NotConfigured,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::BuildInProgress(_) => ErrorKind::Conflict,
            Error::Api(api) => match api.kind {
                ApiErrorKind::Transport => ErrorKind::Transport,
                ApiErrorKind::NotFound => ErrorKind::NotFound,
                ApiErrorKind::MalformedResponse => ErrorKind::MalformedUpstream,
            },
            Error::Storage(_) | Error::Json(_) => ErrorKind::Storage,
        }
    }

    /// Rebuild an error from its wire classification, as seen by a client.
    pub fn from_kind(kind: ErrorKind, message: impl Into<String>) -> Self {
        let message = message.into();
        match kind {
            ErrorKind::InvalidInput => Error::InvalidInput(message),
            ErrorKind::Unauthorized => Error::Unauthorized,
            ErrorKind::Forbidden => Error::Forbidden(message),
            ErrorKind::NotConfigured => Error::NotConfigured(message),
            ErrorKind::NotFound => Error::NotFound(message),
            ErrorKind::Conflict => Error::BuildInProgress(message),
            ErrorKind::Transport => Error::Api(ApiError::transport(message)),
            ErrorKind::MalformedUpstream => Error::Api(ApiError::malformed(message)),
            ErrorKind::Storage => Error::Storage(message),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Error classification shared by the service and its clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidInput,
    Unauthorized,
    Forbidden,
    NotConfigured,
    NotFound,
    Conflict,
    Transport,
    MalformedUpstream,
    Storage,
}

impl ErrorKind {
    /// HTTP status code the service answers with for this kind.
    pub fn http_status(self) -> u16 {
        match self {
            ErrorKind::InvalidInput => 400,
            ErrorKind::Unauthorized => 401,
            ErrorKind::Forbidden => 403,
            ErrorKind::NotFound => 404,
            ErrorKind::Conflict => 409,
            ErrorKind::NotConfigured => 412,
            ErrorKind::Storage => 500,
            ErrorKind::Transport | ErrorKind::MalformedUpstream => 502,
        }
    }

    /// Best-effort reverse mapping for responses without an error body.
    pub fn from_http_status(status: u16) -> Self {
        match status {
            400 => ErrorKind::InvalidInput,
            401 => ErrorKind::Unauthorized,
            403 => ErrorKind::Forbidden,
            404 => ErrorKind::NotFound,
            409 => ErrorKind::Conflict,
            412 => ErrorKind::NotConfigured,
            500 => ErrorKind::Storage,
            _ => ErrorKind::Transport,
        }
    }
}
