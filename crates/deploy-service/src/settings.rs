//! Deploy hook settings
//!
//! Credentials come from one of two places. The immutable override set is read
//! from the environment at startup and, when it names a webhook address, wins
//! for all four credentials at once. Otherwise each value is read from the
//! mutable per-key settings kept in the [`KvStore`].

use chrono::NaiveTime;
use deploy_hooks_common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::sync::Arc;
use tracing::info;

use crate::store::KvStore;
use crate::triggers::ScheduleInterval;

const SETTINGS_PREFIX: &str = "settings:";

/// Format of `select_time_build`
pub const SCHEDULE_TIME_FORMAT: &str = "%H:%M";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SettingKey {
    WebhookAddress,
    BearerToken,
    TeamId,
    ProjectId,
    EnableOnPostUpdate,
    EnableScheduledBuilds,
    ScheduleInterval,
    ScheduleTime,
    /// Written by the scheduler, never by users
    ScheduleAnchor,
}

impl SettingKey {
    pub fn name(self) -> &'static str {
        match self {
            SettingKey::WebhookAddress => "webhook_address",
            SettingKey::BearerToken => "bearer_token",
            SettingKey::TeamId => "team_id",
            SettingKey::ProjectId => "project_id",
            SettingKey::EnableOnPostUpdate => "enable_on_post_update",
            SettingKey::EnableScheduledBuilds => "enable_scheduled_builds",
            SettingKey::ScheduleInterval => "select_schedule_builds",
            SettingKey::ScheduleTime => "select_time_build",
            SettingKey::ScheduleAnchor => "schedule_anchor",
        }
    }

    fn storage_key(self) -> String {
        format!("{}{}", SETTINGS_PREFIX, self.name())
    }
}

/// Where the credentials in effect come from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialSource {
    Override,
    Stored,
}

/// Deployment-time credentials that take precedence over stored settings
#[derive(Debug, Clone, Default)]
pub struct OverrideCredentials {
    pub webhook_address: Option<String>,
    pub bearer_token: Option<String>,
    pub team_id: Option<String>,
    pub project_id: Option<String>,
}

impl OverrideCredentials {
    /// Read `DEPLOY_WEBHOOK_ADDRESS`, `DEPLOY_BEARER_TOKEN`, `DEPLOY_TEAM_ID`, `DEPLOY_PROJECT_ID`
    pub fn from_env() -> Self {
        Self {
            webhook_address: env::var("DEPLOY_WEBHOOK_ADDRESS").ok(),
            bearer_token: env::var("DEPLOY_BEARER_TOKEN").ok(),
            team_id: env::var("DEPLOY_TEAM_ID").ok(),
            project_id: env::var("DEPLOY_PROJECT_ID").ok(),
        }
    }

    /// The set is all-or-nothing, keyed on the webhook address
    pub fn is_active(&self) -> bool {
        self.webhook_address
            .as_deref()
            .is_some_and(|address| !address.is_empty())
    }

    fn get(&self, key: SettingKey) -> Option<&str> {
        let value = match key {
            SettingKey::WebhookAddress => &self.webhook_address,
            SettingKey::BearerToken => &self.bearer_token,
            SettingKey::TeamId => &self.team_id,
            SettingKey::ProjectId => &self.project_id,
            _ => return None,
        };
        Some(value.as_deref().unwrap_or(""))
    }
}

/// Resolved credentials for talking to the deployment platform
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeployCredentials {
    pub webhook_url: String,
    pub bearer_token: String,
    pub team_id: String,
    pub project_id: String,
}

impl DeployCredentials {
    pub fn team_id(&self) -> Option<&str> {
        non_empty(&self.team_id)
    }

    pub fn project_id(&self) -> Option<&str> {
        non_empty(&self.project_id)
    }
}

fn non_empty(value: &str) -> Option<&str> {
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(value.trim().to_lowercase().as_str(), "1" | "true" | "on" | "yes")
}

/// Partial settings update, `None` leaves a value untouched
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SettingsUpdate {
    #[serde(default)]
    pub webhook_address: Option<String>,
    #[serde(default)]
    pub bearer_token: Option<String>,
    #[serde(default)]
    pub team_id: Option<String>,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub enable_on_post_update: Option<bool>,
    #[serde(default)]
    pub enable_scheduled_builds: Option<bool>,
    #[serde(default)]
    pub schedule_interval: Option<ScheduleInterval>,
    #[serde(default)]
    pub schedule_time: Option<String>,
}

impl SettingsUpdate {
    fn touches_schedule(&self) -> bool {
        self.enable_scheduled_builds.is_some()
            || self.schedule_interval.is_some()
            || self.schedule_time.is_some()
    }
}

/// Settings as shown to administrators
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettingsView {
    pub credentials_source: CredentialSource,
    pub webhook_address: String,
    /// Masked, only the last four characters are shown
    pub bearer_token: String,
    pub team_id: String,
    pub project_id: String,
    pub enable_on_post_update: bool,
    pub enable_scheduled_builds: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schedule_interval: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schedule_time: Option<String>,
}

fn mask_secret(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() <= 4 {
        return "*".repeat(chars.len());
    }
    let visible: String = chars[chars.len() - 4..].iter().collect();
    format!("{}{}", "*".repeat(chars.len() - 4), visible)
}

/// Config resolver over the override set and the stored settings
#[derive(Clone)]
pub struct Settings {
    store: Arc<dyn KvStore>,
    overrides: OverrideCredentials,
}

impl Settings {
    pub fn new(store: Arc<dyn KvStore>, overrides: OverrideCredentials) -> Self {
        if overrides.is_active() {
            info!("Deploy credentials are pinned by the environment");
        }
        Self { store, overrides }
    }

    pub fn credential_source(&self) -> CredentialSource {
        if self.overrides.is_active() {
            CredentialSource::Override
        } else {
            CredentialSource::Stored
        }
    }

    /// Resolve a setting, absent values resolve to an empty string
    pub async fn resolve(&self, key: SettingKey) -> Result<String> {
        if self.overrides.is_active() {
            if let Some(value) = self.overrides.get(key) {
                return Ok(value.to_string());
            }
        }
        Ok(self.stored(key).await?.unwrap_or_default())
    }

    /// Value from the mutable settings only
    pub async fn stored(&self, key: SettingKey) -> Result<Option<String>> {
        self.store.get(&key.storage_key()).await
    }

    pub async fn set(&self, key: SettingKey, value: &str) -> Result<()> {
        self.store.set(&key.storage_key(), value, None).await
    }

    pub async fn clear(&self, key: SettingKey) -> Result<()> {
        self.store.delete(&key.storage_key()).await?;
        Ok(())
    }

    pub async fn flag(&self, key: SettingKey) -> Result<bool> {
        Ok(parse_flag(&self.resolve(key).await?))
    }

    pub async fn credentials(&self) -> Result<DeployCredentials> {
        Ok(DeployCredentials {
            webhook_url: self.resolve(SettingKey::WebhookAddress).await?,
            bearer_token: self.resolve(SettingKey::BearerToken).await?,
            team_id: self.resolve(SettingKey::TeamId).await?,
            project_id: self.resolve(SettingKey::ProjectId).await?,
        })
    }

    /// Apply a partial update.
    ///
    /// Returns whether any schedule setting changed; the schedule anchor is
    /// dropped in that case so the scheduler re-anchors on its next pass.
    pub async fn apply(&self, update: &SettingsUpdate) -> Result<bool> {
        if let Some(time) = &update.schedule_time {
            NaiveTime::parse_from_str(time, SCHEDULE_TIME_FORMAT).map_err(|_| {
                Error::InvalidInput(format!("schedule_time must be HH:MM, got {:?}", time))
            })?;
        }

        let text_fields = [
            (SettingKey::WebhookAddress, &update.webhook_address),
            (SettingKey::BearerToken, &update.bearer_token),
            (SettingKey::TeamId, &update.team_id),
            (SettingKey::ProjectId, &update.project_id),
            (SettingKey::ScheduleTime, &update.schedule_time),
        ];
        for (key, value) in text_fields {
            if let Some(value) = value {
                self.set(key, value.trim()).await?;
            }
        }

        let flags = [
            (SettingKey::EnableOnPostUpdate, update.enable_on_post_update),
            (SettingKey::EnableScheduledBuilds, update.enable_scheduled_builds),
        ];
        for (key, value) in flags {
            if let Some(value) = value {
                self.set(key, if value { "true" } else { "false" }).await?;
            }
        }

        if let Some(interval) = update.schedule_interval {
            self.set(SettingKey::ScheduleInterval, interval.name()).await?;
        }

        let schedule_changed = update.touches_schedule();
        if schedule_changed {
            self.clear(SettingKey::ScheduleAnchor).await?;
        }

        info!("Settings updated (schedule changed: {})", schedule_changed);
        Ok(schedule_changed)
    }

    pub async fn view(&self) -> Result<SettingsView> {
        let credentials = self.credentials().await?;
        Ok(SettingsView {
            credentials_source: self.credential_source(),
            webhook_address: credentials.webhook_url,
            bearer_token: mask_secret(&credentials.bearer_token),
            team_id: credentials.team_id,
            project_id: credentials.project_id,
            enable_on_post_update: self.flag(SettingKey::EnableOnPostUpdate).await?,
            enable_scheduled_builds: self.flag(SettingKey::EnableScheduledBuilds).await?,
            schedule_interval: self.stored(SettingKey::ScheduleInterval).await?,
            schedule_time: self.stored(SettingKey::ScheduleTime).await?,
        })
    }
}
