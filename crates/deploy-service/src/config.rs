//! Configuration for the deploy service
//!
//! Loads configuration from environment variables with sensible defaults.
//! The deploy credentials override set is read separately, see
//! [`OverrideCredentials::from_env`](crate::settings::OverrideCredentials::from_env).

use anyhow::{Context, Result};
use std::env;
use std::time::Duration;

use crate::vercel::DEFAULT_API_URL;

/// Backing store for the deployment cache and settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Memory,
    Redis,
}

impl std::str::FromStr for StoreBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "memory" => Ok(StoreBackend::Memory),
            "redis" => Ok(StoreBackend::Redis),
            other => anyhow::bail!("Unknown STORE_BACKEND: {} (expected memory or redis)", other),
        }
    }
}

/// Service configuration
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub host: String,
    pub port: u16,

    pub store_backend: StoreBackend,
    pub redis_url: String,

    /// Deployment platform REST endpoint
    pub vercel_api_url: String,

    /// Per-request timeout for upstream calls
    pub api_timeout_secs: u64,

    /// Key for action nonces
    pub nonce_secret: String,

    /// `name:token:cap+cap,...`
    pub users: String,

    pub scheduler_enabled: bool,
}

impl ServiceConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from an arbitrary variable source
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let config = ServiceConfig {
            host: var("DEPLOY_HOST", "0.0.0.0"),

            port: var("DEPLOY_PORT", "8090")
                .parse()
                .context("Invalid DEPLOY_PORT")?,

            store_backend: var("STORE_BACKEND", "memory").parse()?,

            redis_url: var("REDIS_URL", "redis://127.0.0.1:6379"),

            vercel_api_url: var("VERCEL_API_URL", DEFAULT_API_URL),

            api_timeout_secs: var("API_TIMEOUT_SECS", "20")
                .parse()
                .context("Invalid API_TIMEOUT_SECS")?,

            nonce_secret: var("NONCE_SECRET", ""),

            users: var("DEPLOY_USERS", ""),

            scheduler_enabled: var("SCHEDULER_ENABLED", "true")
                .parse()
                .context("Invalid SCHEDULER_ENABLED (expected true/false)")?,
        };

        config.validate()?;

        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.port == 0 {
            anyhow::bail!("DEPLOY_PORT must be greater than 0");
        }

        if self.api_timeout_secs == 0 {
            anyhow::bail!("API_TIMEOUT_SECS must be greater than 0");
        }

        if self.nonce_secret.trim().is_empty() {
            anyhow::bail!("NONCE_SECRET is required");
        }

        if self.store_backend == StoreBackend::Redis && self.redis_url.trim().is_empty() {
            anyhow::bail!("REDIS_URL is required when STORE_BACKEND=redis");
        }

        Ok(())
    }

    pub fn api_timeout(&self) -> Duration {
        Duration::from_secs(self.api_timeout_secs)
    }

    /// Get the API server address
    pub fn api_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
