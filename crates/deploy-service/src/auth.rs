//! Caller identity, capabilities and action nonces
//!
//! Every deploy endpoint requires an authenticated principal holding the right
//! capability. State-changing and upstream-hitting endpoints additionally
//! require a nonce bound to the principal and to one action, so a token
//! obtained for checking status cannot be replayed to trigger a build.

use axum::http::{header, HeaderMap};
use chrono::Utc;
use deploy_hooks_common::{Error, NonceBundle, Result};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, warn};

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the action nonce
pub const NONCE_HEADER: &str = "x-deploy-nonce";

/// Nonces roll over every tick and stay valid for two ticks
pub const NONCE_TICK: Duration = Duration::from_secs(12 * 60 * 60);

/// Bytes of the HMAC kept in a nonce
const NONCE_BYTES: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    /// Trigger builds and follow their status
    Deploy,
    /// Read and change deploy settings
    AdjustSettings,
}

impl FromStr for Capability {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "deploy" => Ok(Capability::Deploy),
            "adjust_settings" => Ok(Capability::AdjustSettings),
            other => Err(Error::InvalidInput(format!("unknown capability: {}", other))),
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Capability::Deploy => "deploy",
            Capability::AdjustSettings => "adjust_settings",
        })
    }
}

/// Actions protected by a nonce
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonceAction {
    CheckStatus,
    UpdateStatus,
    TriggerBuild,
    UpdateSettings,
}

impl NonceAction {
    fn name(self) -> &'static str {
        match self {
            NonceAction::CheckStatus => "check_status",
            NonceAction::UpdateStatus => "update_status",
            NonceAction::TriggerBuild => "trigger_build",
            NonceAction::UpdateSettings => "update_settings",
        }
    }
}

/// An authenticated caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub name: String,
    capabilities: HashSet<Capability>,
}

impl Principal {
    pub fn new(name: impl Into<String>, capabilities: impl IntoIterator<Item = Capability>) -> Self {
        Self {
            name: name.into(),
            capabilities: capabilities.into_iter().collect(),
        }
    }

    pub fn can(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }
}

/// Parse `name:token:cap+cap,name:token:cap` into a token → principal map
pub fn parse_users(list: &str) -> Result<HashMap<String, Principal>> {
    let mut users = HashMap::new();

    for entry in list.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let mut parts = entry.splitn(3, ':');
        let (name, token, caps) = match (parts.next(), parts.next(), parts.next()) {
            (Some(name), Some(token), Some(caps)) if !name.is_empty() && !token.is_empty() => {
                (name, token, caps)
            }
            _ => {
                return Err(Error::InvalidInput(format!(
                    "user entry must be name:token:capabilities, got {:?}",
                    entry.split(':').next().unwrap_or_default()
                )))
            }
        };

        let capabilities = caps
            .split('+')
            .filter(|c| !c.trim().is_empty())
            .map(Capability::from_str)
            .collect::<Result<Vec<_>>>()?;

        if users
            .insert(token.to_string(), Principal::new(name, capabilities))
            .is_some()
        {
            return Err(Error::InvalidInput(format!(
                "duplicate token for user {}",
                name
            )));
        }
    }

    Ok(users)
}

/// Resolves callers and checks their nonces
#[derive(Clone)]
pub struct Authenticator {
    users: HashMap<String, Principal>,
    secret: Vec<u8>,
}

impl Authenticator {
    pub fn new(users: HashMap<String, Principal>, secret: impl Into<Vec<u8>>) -> Self {
        Self {
            users,
            secret: secret.into(),
        }
    }

    /// Resolve the bearer token of a request
    pub fn authenticate(&self, headers: &HeaderMap) -> Result<Principal> {
        let token = headers
            .get(header::AUTHORIZATION)
            .and_then(|h| h.to_str().ok())
            .and_then(|h| h.strip_prefix("Bearer "))
            .map(str::trim);

        match token.and_then(|t| self.users.get(t)) {
            Some(principal) => Ok(principal.clone()),
            None => {
                warn!("Rejected request with missing or unknown bearer token");
                Err(Error::Unauthorized)
            }
        }
    }

    /// Authenticate, check the capability and, if given, the action nonce
    pub fn authorize(
        &self,
        headers: &HeaderMap,
        capability: Capability,
        action: Option<NonceAction>,
    ) -> Result<Principal> {
        let principal = self.authenticate(headers)?;

        if !principal.can(capability) {
            warn!("User {} lacks capability {}", principal.name, capability);
            return Err(Error::Forbidden(format!("missing capability {}", capability)));
        }

        if let Some(action) = action {
            let nonce = headers
                .get(NONCE_HEADER)
                .and_then(|h| h.to_str().ok())
                .unwrap_or_default();
            if let Err(e) = self.verify_nonce(&principal, action, nonce) {
                warn!("Invalid {} nonce from {}", action.name(), principal.name);
                return Err(e);
            }
        }

        debug!("Authorized {} for {}", principal.name, capability);
        Ok(principal)
    }

    fn current_tick() -> i64 {
        Utc::now()
            .timestamp()
            .div_euclid(NONCE_TICK.as_secs() as i64)
    }

    fn mac(&self, principal: &Principal, action: NonceAction, tick: i64) -> Result<HmacSha256> {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|_| Error::Forbidden("nonce key is unusable".to_string()))?;
        mac.update(action.name().as_bytes());
        mac.update(b"|");
        mac.update(principal.name.as_bytes());
        mac.update(b"|");
        mac.update(tick.to_string().as_bytes());
        Ok(mac)
    }

    fn nonce_at(&self, principal: &Principal, action: NonceAction, tick: i64) -> Result<String> {
        let tag = self.mac(principal, action, tick)?.finalize().into_bytes();
        Ok(hex::encode(&tag[..NONCE_BYTES]))
    }

    fn verify_at(
        &self,
        principal: &Principal,
        action: NonceAction,
        nonce: &str,
        tick: i64,
    ) -> Result<()> {
        let stale = || Error::Forbidden(format!("invalid or expired {} nonce", action.name()));

        let tag = hex::decode(nonce.trim()).map_err(|_| stale())?;
        if tag.len() != NONCE_BYTES {
            return Err(stale());
        }

        for candidate in [tick, tick - 1] {
            if self
                .mac(principal, action, candidate)?
                .verify_truncated_left(&tag)
                .is_ok()
            {
                return Ok(());
            }
        }
        Err(stale())
    }

    pub fn issue_nonce(&self, principal: &Principal, action: NonceAction) -> Result<String> {
        self.nonce_at(principal, action, Self::current_tick())
    }

    pub fn verify_nonce(&self, principal: &Principal, action: NonceAction, nonce: &str) -> Result<()> {
        self.verify_at(principal, action, nonce, Self::current_tick())
    }

    /// Every nonce the principal may use
    pub fn nonce_bundle(&self, principal: &Principal) -> Result<NonceBundle> {
        let update_settings = if principal.can(Capability::AdjustSettings) {
            Some(self.issue_nonce(principal, NonceAction::UpdateSettings)?)
        } else {
            None
        };

        Ok(NonceBundle {
            check_status: self.issue_nonce(principal, NonceAction::CheckStatus)?,
            update_status: self.issue_nonce(principal, NonceAction::UpdateStatus)?,
            trigger_build: self.issue_nonce(principal, NonceAction::TriggerBuild)?,
            update_settings,
        })
    }
}
