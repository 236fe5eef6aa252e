//! TLS identity provisioning.
//!
//! The engine authenticates sessions with two identities: a server identity
//! for the accepting listener and a client identity for initiated sessions.
//! Issuance itself is the platform's concern; this module models the
//! provisioning contract the engine needs: per-label handles that are
//! created once and reused on every later request.

use crate::config::IdentityConfig;
use crate::error::Result;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

const MILLIS_PER_YEAR: u64 = 365 * 24 * 60 * 60 * 1000;

/// Which end of a session an identity authenticates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdentityRole {
    Server,
    Client,
}

impl std::fmt::Display for IdentityRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Server => write!(f, "server"),
            Self::Client => write!(f, "client"),
        }
    }
}

/// A provisioned identity handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Keystore label the identity is stored under.
    pub label: String,
    pub role: IdentityRole,
    /// Certificate common name.
    pub common_name: String,
    /// Stable fingerprint of the identity material.
    pub fingerprint: String,
    /// Expiry as epoch millis.
    pub expires_at_ms: u64,
}

impl Identity {
    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms >= self.expires_at_ms
    }
}

/// Idempotent identity provider.
///
/// `get_or_create` returns the already-provisioned identity when the label
/// is known, so repeated engine restarts reuse the same certificate instead
/// of minting a new one per run.
pub struct IdentityVault {
    config: IdentityConfig,
    provisioned: Mutex<HashMap<String, Identity>>,
}

impl IdentityVault {
    pub fn new(config: IdentityConfig) -> Self {
        Self {
            config,
            provisioned: Mutex::new(HashMap::new()),
        }
    }

    /// The listener's identity, under the configured server label.
    pub fn server_identity(&self) -> Result<Identity> {
        self.get_or_create(
            IdentityRole::Server,
            &self.config.server_label,
            &self.config.server_common_name,
        )
    }

    /// The initiating side's identity, under the configured client label.
    pub fn client_identity(&self) -> Result<Identity> {
        self.get_or_create(
            IdentityRole::Client,
            &self.config.client_label,
            &self.config.client_common_name,
        )
    }

    /// Fetch the identity under `label`, provisioning it on first use.
    pub fn get_or_create(
        &self,
        role: IdentityRole,
        label: &str,
        common_name: &str,
    ) -> Result<Identity> {
        let mut provisioned = self
            .provisioned
            .lock()
            .map_err(|_| crate::error::EngineError::Internal("identity lock poisoned".into()))?;

        if let Some(existing) = provisioned.get(label) {
            return Ok(existing.clone());
        }

        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        let expires_at_ms =
            now_ms + u64::from(self.config.validity_years) * MILLIS_PER_YEAR;

        let mut hasher = Sha256::new();
        hasher.update(label.as_bytes());
        hasher.update(common_name.as_bytes());
        hasher.update(now_ms.to_be_bytes());
        let fingerprint = hex::encode(&hasher.finalize()[..16]);

        let identity = Identity {
            label: label.to_string(),
            role,
            common_name: common_name.to_string(),
            fingerprint,
            expires_at_ms,
        };
        tracing::info!(
            label = %label,
            role = %role,
            common_name = %common_name,
            "provisioned identity"
        );
        provisioned.insert(label.to_string(), identity.clone());
        Ok(identity)
    }
}
