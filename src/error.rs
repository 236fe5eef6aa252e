// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the sync engine.
//!
//! Errors are categorized by where they occur (discovery, transport, store)
//! and by whether the operation should be retried.
//!
//! # Error Categories
//!
//! | Error Type | Transient | Description |
//! |------------------------|-----------|-------------------------------------------------|
//! | `Transport` | Yes | Timeout, connection reset, peer unreachable |
//! | `ResolveFailed` | Yes | Service record could not be resolved to an addr |
//! | `DiscoveryUnavailable` | No | Network stack refused registration or browse |
//! | `AuthFailed` | No | Identity rejected by peer or gateway |
//! | `Store` | No | Local document store failure |
//! | `Config` | No | Configuration invalid |
//! | `InvalidState` | No | Lifecycle state machine violation |
//! | `Shutdown` | No | Engine is shutting down |
//! | `Internal` | No | Unexpected internal error |
//!
//! # Propagation Policy
//!
//! Transient errors are retried locally with backoff and never interrupt the
//! caller. Structural errors (auth, permanent resolve failure) are reported
//! through the status surface and logged; they are never thrown across the
//! engine boundary as uncaught failures. Use
//! [`EngineError::is_transient()`] to decide whether to retry.

use thiserror::Error;

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors that can occur during discovery, replication, or resolution.
///
/// Use [`is_transient()`](Self::is_transient) to check whether the
/// operation should be retried with backoff.
#[derive(Error, Debug, Clone)]
pub enum EngineError {
    /// The OS network stack refused to register or browse service records.
    ///
    /// Fatal to discovery, non-fatal to the process: mesh sessions will not
    /// form, but the gateway session keeps running. Retry on the next
    /// explicit discovery start.
    #[error("Discovery unavailable: {0}")]
    DiscoveryUnavailable(String),

    /// A found service record could not be resolved to a host and port.
    ///
    /// Retried with backoff; the candidate is dropped only after retries
    /// are exhausted.
    #[error("Resolve failed ({service}): {message}")]
    ResolveFailed { service: String, message: String },

    /// The peer or gateway rejected our identity.
    ///
    /// Fatal to that one session. Reported via status, never retried.
    #[error("Authentication failed ({target}): {message}")]
    AuthFailed { target: String, message: String },

    /// Transport-level failure: timeout, connection reset, peer unreachable.
    ///
    /// Transient. The session moves to `Offline` and auto-resumes with the
    /// transport's backoff; never surfaced as a hard failure.
    #[error("Transport error ({target}): {message}")]
    Transport { target: String, message: String },

    /// Local document store failure.
    ///
    /// Not transient: indicates a local problem that needs attention.
    #[error("Store error: {0}")]
    Store(String),

    /// Invalid or missing configuration.
    ///
    /// Not transient: fix the configuration and restart.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Lifecycle state machine violation.
    ///
    /// Occurs when an operation is attempted in the wrong state
    /// (e.g., calling `start()` on an already-running engine).
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Shutdown in progress.
    ///
    /// Returned when operations are attempted during shutdown.
    #[error("Shutdown in progress")]
    Shutdown,

    /// Unexpected internal error.
    ///
    /// Catch-all for errors that shouldn't happen.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Create a transport error for a target.
    pub fn transport(target: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transport {
            target: target.into(),
            message: message.into(),
        }
    }

    /// Create an authentication error for a target.
    pub fn auth(target: impl Into<String>, message: impl Into<String>) -> Self {
        Self::AuthFailed {
            target: target.into(),
            message: message.into(),
        }
    }

    /// Check if this error is transient (should be retried with backoff).
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport { .. } => true,
            Self::ResolveFailed { .. } => true,
            Self::DiscoveryUnavailable(_) => false,
            Self::AuthFailed { .. } => false,
            Self::Store(_) => false,
            Self::Config(_) => false,
            Self::InvalidState { .. } => false,
            Self::Shutdown => false,
            Self::Internal(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_transport() {
        let err = EngineError::transport("peer ws://10.0.0.2:55990/", "connection reset");
        assert!(err.is_transient());
        assert!(err.to_string().contains("10.0.0.2"));
    }

    #[test]
    fn test_transient_resolve_failed() {
        let err = EngineError::ResolveFailed {
            service: "BeaconP2P-pixel7".to_string(),
            message: "timed out".to_string(),
        };
        assert!(err.is_transient());
        assert!(err.to_string().contains("BeaconP2P-pixel7"));
    }

    #[test]
    fn test_not_transient_auth() {
        let err = EngineError::auth("gateway", "certificate expired");
        assert!(!err.is_transient());
        assert!(err.to_string().contains("gateway"));
    }

    #[test]
    fn test_not_transient_discovery_unavailable() {
        let err = EngineError::DiscoveryUnavailable("no active network".to_string());
        assert!(!err.is_transient());
    }

    #[test]
    fn test_not_transient_store() {
        let err = EngineError::Store("document vanished mid-save".to_string());
        assert!(!err.is_transient());
    }

    #[test]
    fn test_not_transient_config() {
        let err = EngineError::Config("gateway host missing".to_string());
        assert!(!err.is_transient());
    }

    #[test]
    fn test_not_transient_invalid_state() {
        let err = EngineError::InvalidState {
            expected: "Created".to_string(),
            actual: "Running".to_string(),
        };
        assert!(!err.is_transient());
        assert!(err.to_string().contains("Created"));
        assert!(err.to_string().contains("Running"));
    }

    #[test]
    fn test_not_transient_shutdown() {
        assert!(!EngineError::Shutdown.is_transient());
    }

    #[test]
    fn test_not_transient_internal() {
        let err = EngineError::Internal("unexpected".to_string());
        assert!(!err.is_transient());
    }
}
