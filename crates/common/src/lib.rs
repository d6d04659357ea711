//! Shared types for the deploy hooks workspace.

pub mod error;
pub mod models;

pub use error::{ApiError, ApiErrorKind, Error, ErrorKind, Result};
pub use models::{
    BuildJob, CheckStatusQuery, CurrentDeploymentResponse, DeploymentDetails, DeploymentList,
    DeploymentRecord, DeploymentState, DeploymentSummary, ErrorBody, NonceBundle,
    TriggerResponse, UpdateStatusRequest, UpdateStatusResponse,
};
