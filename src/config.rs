//! Configuration for the sync engine.
//!
//! All configuration types passed to [`SyncEngine::new()`](crate::SyncEngine::new).
//! Can be constructed programmatically or deserialized from JSON.
//!
//! # Quick Start
//!
//! ```rust
//! use beacon_sync::config::EngineConfig;
//!
//! let config = EngineConfig {
//!     device_id: "pixel7-field-unit".into(),
//!     ..Default::default()
//! };
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! EngineConfig
//! ├── device_id: String            # This device's unique ID
//! ├── database_name: String        # Logical store / endpoint path name
//! ├── channels: Vec<String>        # Replicated channels
//! ├── discovery: DiscoveryConfig   # Service advertisement + browse
//! ├── gateway: GatewayConfig       # Optional central sync gateway
//! ├── session: SessionConfig       # Replication session tuning
//! └── identity: IdentityConfig     # TLS identity labels and names
//! ```

use crate::resolver::ConflictPolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config: passed to SyncEngine::new()
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level config object passed to `SyncEngine::new()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Unique identifier for this device. Used in the advertised service
    /// name and to filter "self" out of browse results.
    pub device_id: String,

    /// Logical database name. Forms the path component of replication
    /// endpoints (`ws://host:port/{database_name}`).
    #[serde(default = "default_database_name")]
    pub database_name: String,

    /// Channels replicated by every session.
    #[serde(default = "default_channels")]
    pub channels: Vec<String>,

    #[serde(default)]
    pub discovery: DiscoveryConfig,

    #[serde(default)]
    pub gateway: GatewayConfig,

    #[serde(default)]
    pub session: SessionConfig,

    #[serde(default)]
    pub identity: IdentityConfig,
}

fn default_database_name() -> String {
    "beacon".to_string()
}

fn default_channels() -> Vec<String> {
    vec![crate::document::EMERGENCY_CHANNEL.to_string()]
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            device_id: "beacon-dev-device".to_string(),
            database_name: default_database_name(),
            channels: default_channels(),
            discovery: DiscoveryConfig::default(),
            gateway: GatewayConfig::default(),
            session: SessionConfig::default(),
            identity: IdentityConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Create a minimal config for testing: fast timers, gateway disabled.
    pub fn for_testing(device_id: &str) -> Self {
        Self {
            device_id: device_id.to_string(),
            database_name: default_database_name(),
            channels: default_channels(),
            discovery: DiscoveryConfig::default(),
            gateway: GatewayConfig {
                enabled: false,
                ..Default::default()
            },
            session: SessionConfig {
                poll_interval: "10ms".to_string(),
                drain_timeout: "100ms".to_string(),
                ..Default::default()
            },
            identity: IdentityConfig::default(),
        }
    }

    /// The service name this device advertises, e.g. `"BeaconP2P-pixel7"`.
    pub fn service_name(&self) -> String {
        format!("{}{}", self.discovery.service_name_prefix, self.device_id)
    }

    /// Validate cross-field constraints. Called once at engine construction.
    pub fn validate(&self) -> Result<(), String> {
        if self.device_id.is_empty() {
            return Err("device_id must not be empty".to_string());
        }
        if self.channels.is_empty() {
            return Err("at least one channel is required".to_string());
        }
        if self.gateway.enabled && self.gateway.host.is_empty() {
            return Err("gateway.host required when gateway.enabled".to_string());
        }
        if !self.session.continuous {
            return Err("one-shot sessions are not supported; session.continuous must be true".to_string());
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// DiscoveryConfig: service advertisement and browse
// ═══════════════════════════════════════════════════════════════════════════════

/// Peer discovery (service advertisement + browse) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Whether mesh discovery runs at all. With discovery off the engine
    /// still serves the gateway session.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// DNS-SD service type to advertise and browse.
    #[serde(default = "default_service_type")]
    pub service_type: String,

    /// Prefix for the advertised service name; the device id is appended.
    #[serde(default = "default_service_name_prefix")]
    pub service_name_prefix: String,

    /// TCP port the replication listener binds and advertises.
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
}

fn default_service_type() -> String {
    "_beaconp2p._tcp.".to_string()
}

fn default_service_name_prefix() -> String {
    "BeaconP2P-".to_string()
}

fn default_listen_port() -> u16 {
    55990
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            service_type: default_service_type(),
            service_name_prefix: default_service_name_prefix(),
            listen_port: default_listen_port(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// GatewayConfig: optional central sync gateway
// ═══════════════════════════════════════════════════════════════════════════════

/// Central sync gateway configuration.
///
/// When enabled, the engine keeps one continuous session to the gateway in
/// addition to the per-peer mesh sessions. The gateway session runs the
/// stricter timestamp-based conflict policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_false")]
    pub enabled: bool,

    /// Gateway host (IP or DNS name).
    #[serde(default)]
    pub host: String,

    #[serde(default = "default_gateway_port")]
    pub port: u16,
}

fn default_gateway_port() -> u16 {
    4984
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: String::new(),
            port: default_gateway_port(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SessionConfig: replication session tuning
// ═══════════════════════════════════════════════════════════════════════════════

/// Replication session tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Continuous mode: sessions stay up and auto-resume. One-shot mode is
    /// not implemented; `validate()` rejects `false`. The flag exists so
    /// configs stay forward-compatible.
    #[serde(default = "default_true")]
    pub continuous: bool,

    /// How often an active session polls the store for outbound changes,
    /// as a duration string (e.g. "500ms").
    #[serde(default = "default_poll_interval")]
    pub poll_interval: String,

    /// How long shutdown waits for sessions to drain before abandoning them,
    /// as a duration string (e.g. "5s").
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout: String,

    /// Conflict policy for peer (mesh) sessions.
    #[serde(default = "default_mesh_policy")]
    pub mesh_policy: ConflictPolicy,

    /// Conflict policy for the gateway session.
    #[serde(default = "default_gateway_policy")]
    pub gateway_policy: ConflictPolicy,
}

fn default_poll_interval() -> String {
    "500ms".to_string()
}

fn default_drain_timeout() -> String {
    "5s".to_string()
}

fn default_mesh_policy() -> ConflictPolicy {
    ConflictPolicy::Mesh
}

fn default_gateway_policy() -> ConflictPolicy {
    ConflictPolicy::Gateway
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            continuous: true,
            poll_interval: default_poll_interval(),
            drain_timeout: default_drain_timeout(),
            mesh_policy: ConflictPolicy::Mesh,
            gateway_policy: ConflictPolicy::Gateway,
        }
    }
}

impl SessionConfig {
    /// Parse the poll_interval string to a Duration.
    pub fn poll_interval_duration(&self) -> Duration {
        humantime::parse_duration(&self.poll_interval).unwrap_or(Duration::from_millis(500))
    }

    /// Parse the drain_timeout string to a Duration.
    pub fn drain_timeout_duration(&self) -> Duration {
        humantime::parse_duration(&self.drain_timeout).unwrap_or(Duration::from_secs(5))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// IdentityConfig: TLS identity labels and certificate names
// ═══════════════════════════════════════════════════════════════════════════════

/// TLS identity provisioning configuration.
///
/// The engine provisions two identities: a server identity for the
/// accepting listener and a client identity for initiated sessions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    #[serde(default = "default_server_label")]
    pub server_label: String,

    #[serde(default = "default_client_label")]
    pub client_label: String,

    #[serde(default = "default_server_common_name")]
    pub server_common_name: String,

    #[serde(default = "default_client_common_name")]
    pub client_common_name: String,

    /// Certificate validity in years.
    #[serde(default = "default_validity_years")]
    pub validity_years: u32,
}

fn default_server_label() -> String {
    "server-key".to_string()
}

fn default_client_label() -> String {
    "client-key".to_string()
}

fn default_server_common_name() -> String {
    "BeaconServer".to_string()
}

fn default_client_common_name() -> String {
    "BeaconClient".to_string()
}

fn default_validity_years() -> u32 {
    5
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            server_label: default_server_label(),
            client_label: default_client_label(),
            server_common_name: default_server_common_name(),
            client_common_name: default_client_common_name(),
            validity_years: 5,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_false() -> bool {
    false
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_config_default() {
        let config = EngineConfig::default();
        assert_eq!(config.database_name, "beacon");
        assert_eq!(config.channels, vec!["emergency_requests"]);
        assert!(config.discovery.enabled);
        assert!(!config.gateway.enabled);
    }

    #[test]
    fn test_service_name() {
        let config = EngineConfig {
            device_id: "pixel7".to_string(),
            ..Default::default()
        };
        assert_eq!(config.service_name(), "BeaconP2P-pixel7");
    }

    #[test]
    fn test_discovery_defaults() {
        let config = DiscoveryConfig::default();
        assert_eq!(config.service_type, "_beaconp2p._tcp.");
        assert_eq!(config.listen_port, 55990);
    }

    #[test]
    fn test_gateway_defaults() {
        let config = GatewayConfig::default();
        assert!(!config.enabled);
        assert_eq!(config.port, 4984);
    }

    #[test]
    fn test_session_duration_parsing() {
        let config = SessionConfig {
            poll_interval: "250ms".to_string(),
            drain_timeout: "10s".to_string(),
            ..Default::default()
        };
        assert_eq!(config.poll_interval_duration(), Duration::from_millis(250));
        assert_eq!(config.drain_timeout_duration(), Duration::from_secs(10));
    }

    #[test]
    fn test_session_duration_invalid_fallback() {
        let config = SessionConfig {
            poll_interval: "soon".to_string(),
            drain_timeout: "eventually".to_string(),
            ..Default::default()
        };
        // Should fall back to built-in defaults
        assert_eq!(config.poll_interval_duration(), Duration::from_millis(500));
        assert_eq!(config.drain_timeout_duration(), Duration::from_secs(5));
    }

    #[test]
    fn test_session_policy_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.mesh_policy, ConflictPolicy::Mesh);
        assert_eq!(config.gateway_policy, ConflictPolicy::Gateway);
    }

    #[test]
    fn test_identity_defaults() {
        let config = IdentityConfig::default();
        assert_eq!(config.server_label, "server-key");
        assert_eq!(config.client_label, "client-key");
        assert_eq!(config.server_common_name, "BeaconServer");
        assert_eq!(config.client_common_name, "BeaconClient");
        assert_eq!(config.validity_years, 5);
    }

    #[test]
    fn test_for_testing_config() {
        let config = EngineConfig::for_testing("test-device");
        assert_eq!(config.device_id, "test-device");
        assert!(!config.gateway.enabled);
        assert_eq!(config.session.poll_interval_duration(), Duration::from_millis(10));
    }

    #[test]
    fn test_validate_ok() {
        assert!(EngineConfig::for_testing("d1").validate().is_ok());
    }

    #[test]
    fn test_validate_empty_device_id() {
        let config = EngineConfig {
            device_id: String::new(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_gateway_without_host() {
        let config = EngineConfig {
            gateway: GatewayConfig {
                enabled: true,
                host: String::new(),
                port: 4984,
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_one_shot() {
        let mut config = EngineConfig::default();
        config.session.continuous = false;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_no_channels() {
        let config = EngineConfig {
            channels: Vec::new(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_json_roundtrip() {
        let config = EngineConfig {
            device_id: "roundtrip".to_string(),
            gateway: GatewayConfig {
                enabled: true,
                host: "10.0.0.5".to_string(),
                port: 4984,
            },
            ..Default::default()
        };

        let json = serde_json::to_string(&config).unwrap();
        let parsed: EngineConfig = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.device_id, "roundtrip");
        assert!(parsed.gateway.enabled);
        assert_eq!(parsed.gateway.host, "10.0.0.5");
    }

    #[test]
    fn test_config_defaults_from_sparse_json() {
        let parsed: EngineConfig =
            serde_json::from_str(r#"{"device_id": "sparse"}"#).unwrap();
        assert_eq!(parsed.device_id, "sparse");
        assert_eq!(parsed.discovery.listen_port, 55990);
        assert_eq!(parsed.session.mesh_policy, ConflictPolicy::Mesh);
        assert_eq!(parsed.identity.validity_years, 5);
    }
}
