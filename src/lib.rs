//! # Beacon Sync
//!
//! An offline-first synchronization engine for cooperative emergency
//! request routing: devices track and route emergency-service requests
//! between requesters and responders without a central server, replicating
//! a small shared document store over an ad-hoc local mesh and an optional
//! central gateway.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                             beacon-sync                              │
//! │                                                                      │
//! │  ┌───────────────┐    ┌─────────────────────┐    ┌───────────────┐   │
//! │  │ PeerDiscovery │───►│ SyncEngine          │───►│ Replication   │   │
//! │  │ (advertise/   │    │ (reconcile loop,    │    │ Session       │   │
//! │  │  browse/      │    │  session table)     │    │ (per target)  │   │
//! │  │  resolve)     │    └─────────────────────┘    └───────────────┘   │
//! │  └───────────────┘               │                       │           │
//! │                                  ▼                       ▼           │
//! │                      ┌──────────────────────┐   ┌────────────────┐   │
//! │                      │ DocumentStore        │◄──│ ConflictPolicy │   │
//! │                      │ (revisions, changes, │   │ (mesh union /  │   │
//! │                      │  apply_replicated)   │   │  gateway ts)   │   │
//! │                      └──────────────────────┘   └────────────────┘   │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! One continuous push-and-pull session runs per target: every discovered
//! mesh peer plus, when configured, the central gateway. Pulled revisions
//! pass through deterministic conflict resolution before they become
//! visible, so all replicas converge without coordination.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use beacon_sync::{EngineConfig, MemoryStore, SyncEngine};
//! use std::sync::Arc;
//!
//! # async fn example(
//! #     discovery: Arc<dyn beacon_sync::discovery::DiscoveryTransport>,
//! #     wire: Arc<dyn beacon_sync::transport::ReplicationTransport>,
//! # ) -> beacon_sync::Result<()> {
//! let config = EngineConfig {
//!     device_id: "field-unit-1".into(),
//!     ..Default::default()
//! };
//! let engine = Arc::new(SyncEngine::new(
//!     config,
//!     Arc::new(MemoryStore::new()),
//!     discovery,
//!     wire,
//! ));
//! engine.start().await?;
//!
//! // Engine runs until shutdown
//! engine.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod discovery;
pub mod document;
pub mod engine;
pub mod error;
pub mod identity;
pub mod metrics;
pub mod resilience;
pub mod resolver;
pub mod session;
pub mod store;
pub mod testing;
pub mod transport;

// Re-exports for convenience
pub use config::{DiscoveryConfig, EngineConfig, GatewayConfig, IdentityConfig, SessionConfig};
pub use discovery::{PeerDiscovery, PeerEndpoint, PeerEvent};
pub use document::{Document, EmergencyRequest, EmergencyType, RequestStatus, ResponderProfile};
pub use engine::{EngineState, SessionHealth, SyncEngine, SyncStatus};
pub use error::{EngineError, Result};
pub use identity::{Identity, IdentityRole, IdentityVault};
pub use resilience::RetryConfig;
pub use resolver::ConflictPolicy;
pub use session::{ActivityLevel, ReplicationSession, SessionState, SessionStatus};
pub use store::{ApplyOutcome, ChangeEvent, DocumentStore, MemoryStore, Predicate};
pub use transport::{ReplicationLink, ReplicationTransport, SessionTarget};

/// Milliseconds since the Unix epoch.
pub(crate) fn epoch_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
