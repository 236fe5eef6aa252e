//! Replication transport abstraction.
//!
//! A session replicates with exactly one [`SessionTarget`]: a mesh peer or
//! the central gateway. The secure document-sync wire protocol itself sits
//! behind [`ReplicationTransport`]; the engine only needs an accepting
//! listener plus per-target [`ReplicationLink`]s that move batches of
//! revisions with their ancestry.

use crate::discovery::PeerEndpoint;
use crate::document::Document;
use crate::error::Result;
use crate::identity::Identity;
use crate::store::BoxFuture;

/// A batch entry on the wire: a revision plus its revision ancestry
/// (oldest first, the carried revision excluded).
pub type RevisionBatch = Vec<(Document, Vec<String>)>;

/// The remote end of a replication session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SessionTarget {
    Peer(PeerEndpoint),
    Gateway { host: String, port: u16 },
}

impl SessionTarget {
    pub fn gateway(host: impl Into<String>, port: u16) -> Self {
        Self::Gateway {
            host: host.into(),
            port,
        }
    }

    /// Replication endpoint URL for the given logical database.
    pub fn endpoint_url(&self, database: &str) -> String {
        match self {
            Self::Peer(endpoint) => {
                format!("ws://{}:{}/{}", endpoint.host, endpoint.port, database)
            }
            Self::Gateway { host, port } => format!("ws://{}:{}/{}", host, port, database),
        }
    }

    pub fn is_gateway(&self) -> bool {
        matches!(self, Self::Gateway { .. })
    }
}

impl std::fmt::Display for SessionTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Peer(endpoint) => write!(f, "peer {}:{}", endpoint.host, endpoint.port),
            Self::Gateway { host, port } => write!(f, "gateway {}:{}", host, port),
        }
    }
}

/// An open replication link to one target.
pub trait ReplicationLink: Send {
    /// Push a batch of local revisions. Returns the number accepted.
    fn push<'a>(&'a mut self, batch: RevisionBatch) -> BoxFuture<'a, Result<usize>>;

    /// Pull the next batch of remote revisions. An empty batch means the
    /// remote has nothing new right now.
    fn pull(&mut self) -> BoxFuture<'_, Result<RevisionBatch>>;

    /// Close the link gracefully.
    fn close(&mut self) -> BoxFuture<'_, Result<()>>;
}

/// An accepting listener for inbound sessions.
pub trait ListenerHandle: Send {
    fn port(&self) -> u16;

    /// Stop accepting and tear down inbound sessions.
    fn stop(&mut self) -> BoxFuture<'_, Result<()>>;
}

/// The wire capability the engine is constructed with.
pub trait ReplicationTransport: Send + Sync {
    /// Bind the accepting listener, authenticated with the server identity.
    fn listen<'a>(
        &'a self,
        port: u16,
        identity: &'a Identity,
    ) -> BoxFuture<'a, Result<Box<dyn ListenerHandle>>>;

    /// Open a link to a target, scoped to the channel set and authenticated
    /// with the client identity. Transient failures surface as
    /// [`EngineError::Transport`](crate::error::EngineError::Transport),
    /// rejection of the identity as
    /// [`EngineError::AuthFailed`](crate::error::EngineError::AuthFailed).
    fn connect<'a>(
        &'a self,
        target: &'a SessionTarget,
        database: &'a str,
        channels: &'a [String],
        identity: &'a Identity,
    ) -> BoxFuture<'a, Result<Box<dyn ReplicationLink>>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer_target() -> SessionTarget {
        SessionTarget::Peer(PeerEndpoint {
            name: "BeaconP2P-pixel7".to_string(),
            host: "10.0.0.2".to_string(),
            port: 55990,
            discovered_at_ms: 0,
        })
    }

    #[test]
    fn test_endpoint_url() {
        assert_eq!(peer_target().endpoint_url("beacon"), "ws://10.0.0.2:55990/beacon");
        assert_eq!(
            SessionTarget::gateway("sync.example.org", 4984).endpoint_url("beacon"),
            "ws://sync.example.org:4984/beacon"
        );
    }

    #[test]
    fn test_display() {
        assert_eq!(peer_target().to_string(), "peer 10.0.0.2:55990");
        assert_eq!(
            SessionTarget::gateway("10.0.0.5", 4984).to_string(),
            "gateway 10.0.0.5:4984"
        );
    }

    #[test]
    fn test_target_identity_ignores_service_name() {
        let a = peer_target();
        let SessionTarget::Peer(mut endpoint) = peer_target() else {
            unreachable!()
        };
        endpoint.name = "BeaconP2P-renamed".to_string();
        assert_eq!(a, SessionTarget::Peer(endpoint));
    }
}
