//! Peer discovery over local service advertisement.
//!
//! Devices advertise a service record (`_beaconp2p._tcp.`) on the local
//! network and browse for each other. The OS-level advertise/browse/resolve
//! machinery sits behind the [`DiscoveryTransport`] trait; [`PeerDiscovery`]
//! turns raw service events into a deduplicated peer set and a stream of
//! [`PeerEvent`]s for the engine's reconciliation loop.
//!
//! Browse results name a service but not an address. Resolution is a
//! separate asynchronous step and fails sporadically on congested networks,
//! so each found record gets its own resolve task retrying with exponential
//! backoff; the candidate is dropped only after retries are exhausted.

use crate::config::DiscoveryConfig;
use crate::error::{EngineError, Result};
use crate::resilience::RetryConfig;
use crate::store::BoxFuture;
use dashmap::{DashMap, DashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument};

/// A replication-capable peer, resolved to a reachable address.
#[derive(Debug, Clone)]
pub struct PeerEndpoint {
    /// Advertised service name, e.g. `"BeaconP2P-pixel7"`.
    pub name: String,
    pub host: String,
    pub port: u16,
    /// Epoch millis when the peer was resolved.
    pub discovered_at_ms: u64,
}

// Identity is the reachable address; the same device re-advertising under
// a refreshed name is still the same endpoint.
impl PartialEq for PeerEndpoint {
    fn eq(&self, other: &Self) -> bool {
        self.host == other.host && self.port == other.port
    }
}

impl Eq for PeerEndpoint {}

impl std::hash::Hash for PeerEndpoint {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.host.hash(state);
        self.port.hash(state);
    }
}

impl std::fmt::Display for PeerEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({}:{})", self.name, self.host, self.port)
    }
}

/// An unresolved service record from the browser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRecord {
    pub name: String,
    pub service_type: String,
}

/// Raw browse events from the OS transport.
#[derive(Debug, Clone)]
pub enum ServiceEvent {
    Found(ServiceRecord),
    Lost(ServiceRecord),
}

/// Peer-set changes emitted to the engine.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    Found(PeerEndpoint),
    Lost(PeerEndpoint),
}

/// OS advertise/browse/resolve capability.
pub trait DiscoveryTransport: Send + Sync {
    /// Register a service record. Fails with
    /// [`EngineError::DiscoveryUnavailable`] when the network stack refuses.
    fn advertise<'a>(
        &'a self,
        name: &'a str,
        service_type: &'a str,
        port: u16,
    ) -> BoxFuture<'a, Result<()>>;

    /// Withdraw this device's service record.
    fn unadvertise(&self) -> BoxFuture<'_, Result<()>>;

    /// Start browsing for the service type. Found/lost records arrive on the
    /// returned channel; dropping the receiver ends the browse.
    fn browse<'a>(
        &'a self,
        service_type: &'a str,
    ) -> BoxFuture<'a, Result<mpsc::Receiver<ServiceEvent>>>;

    /// Resolve a found record to a host and port.
    fn resolve<'a>(&'a self, record: &'a ServiceRecord) -> BoxFuture<'a, Result<(String, u16)>>;
}

/// Handle for an active advertisement. Withdraws the record on `stop()`.
pub struct AdvertisementHandle {
    transport: Arc<dyn DiscoveryTransport>,
    active: bool,
}

impl AdvertisementHandle {
    /// Withdraw the advertisement. Idempotent.
    pub async fn stop(&mut self) -> Result<()> {
        if self.active {
            self.active = false;
            self.transport.unadvertise().await?;
        }
        Ok(())
    }
}

/// Discovery manager: one browse task plus one resolve task per candidate.
pub struct PeerDiscovery {
    config: DiscoveryConfig,
    /// Our own advertised service name, filtered out of browse results.
    service_name: String,
    transport: Arc<dyn DiscoveryTransport>,
    retry: RetryConfig,
    peers: Arc<DashMap<String, PeerEndpoint>>,
    /// Names with a resolve task in flight. A lost event cancels the
    /// candidate by removing its entry before the task finishes.
    resolving: Arc<DashSet<String>>,
    shutdown_tx: watch::Sender<bool>,
    browse_task: Mutex<Option<JoinHandle<()>>>,
}

impl PeerDiscovery {
    pub fn new(
        config: DiscoveryConfig,
        service_name: String,
        transport: Arc<dyn DiscoveryTransport>,
        retry: RetryConfig,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config,
            service_name,
            transport,
            retry,
            peers: Arc::new(DashMap::new()),
            resolving: Arc::new(DashSet::new()),
            shutdown_tx,
            browse_task: Mutex::new(None),
        }
    }

    /// Register our service record on the configured port.
    pub async fn advertise(&self) -> Result<AdvertisementHandle> {
        self.transport
            .advertise(
                &self.service_name,
                &self.config.service_type,
                self.config.listen_port,
            )
            .await?;
        crate::metrics::record_advertise();
        info!(
            service = %self.service_name,
            port = self.config.listen_port,
            "advertising service"
        );
        Ok(AdvertisementHandle {
            transport: Arc::clone(&self.transport),
            active: true,
        })
    }

    /// Start browsing. Resolved peers are reported on `events`.
    pub async fn start(&self, events: mpsc::Sender<PeerEvent>) -> Result<()> {
        let mut task = self.browse_task.lock().await;
        if task.is_some() {
            return Err(EngineError::InvalidState {
                expected: "stopped".to_string(),
                actual: "browsing".to_string(),
            });
        }

        let mut records = self.transport.browse(&self.config.service_type).await?;
        info!(service_type = %self.config.service_type, "browsing for peers");

        let own_name = self.service_name.clone();
        let transport = Arc::clone(&self.transport);
        let retry = self.retry.clone();
        let peers = Arc::clone(&self.peers);
        let resolving = Arc::clone(&self.resolving);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        let span = info_span!("discovery");
        *task = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            debug!("browse task shutting down");
                            break;
                        }
                    }
                    event = records.recv() => {
                        let Some(event) = event else {
                            warn!("browse channel closed");
                            break;
                        };
                        match event {
                            ServiceEvent::Found(record) => {
                                if record.name == own_name {
                                    continue;
                                }
                                if peers.contains_key(&record.name) {
                                    debug!(service = %record.name, "duplicate found event ignored");
                                    continue;
                                }
                                if !resolving.insert(record.name.clone()) {
                                    debug!(service = %record.name, "resolve already in flight");
                                    continue;
                                }
                                spawn_resolve_task(
                                    record,
                                    Arc::clone(&transport),
                                    retry.clone(),
                                    Arc::clone(&peers),
                                    Arc::clone(&resolving),
                                    events.clone(),
                                    shutdown_rx.clone(),
                                );
                            }
                            ServiceEvent::Lost(record) => {
                                if resolving.remove(&record.name).is_some() {
                                    debug!(service = %record.name, "lost while resolving, candidate cancelled");
                                }
                                if let Some((_, endpoint)) = peers.remove(&record.name) {
                                    info!(peer = %endpoint, "peer lost");
                                    crate::metrics::record_peer_lost();
                                    crate::metrics::set_known_peers(peers.len());
                                    let _ = events.send(PeerEvent::Lost(endpoint)).await;
                                }
                            }
                        }
                    }
                }
            }
        }.instrument(span)));
        Ok(())
    }

    /// Snapshot of the resolved peer set. Non-blocking.
    pub fn current_peers(&self) -> Vec<PeerEndpoint> {
        self.peers.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Stop browsing and resolution. Idempotent. Clears the peer set, so
    /// `current_peers()` reports nothing once discovery is down.
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(task) = self.browse_task.lock().await.take() {
            let _ = task.await;
        }
        self.resolving.clear();
        self.peers.clear();
        crate::metrics::set_known_peers(0);
    }
}

/// Resolve one found record with backoff, then report it as a peer.
fn spawn_resolve_task(
    record: ServiceRecord,
    transport: Arc<dyn DiscoveryTransport>,
    retry: RetryConfig,
    peers: Arc<DashMap<String, PeerEndpoint>>,
    resolving: Arc<DashSet<String>>,
    events: mpsc::Sender<PeerEvent>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        for attempt in 1..=retry.max_attempts {
            match transport.resolve(&record).await {
                Ok((host, port)) => {
                    // A lost event cancels the candidate by removing its
                    // resolving entry; only a still-pending entry may
                    // become a peer.
                    if resolving.remove(&record.name).is_none() {
                        debug!(service = %record.name, "lost while resolving, dropping");
                        return;
                    }
                    let endpoint = PeerEndpoint {
                        name: record.name.clone(),
                        host,
                        port,
                        discovered_at_ms: crate::epoch_millis(),
                    };
                    if peers.insert(record.name.clone(), endpoint.clone()).is_none() {
                        info!(peer = %endpoint, attempt, "peer resolved");
                        crate::metrics::record_peer_found();
                        crate::metrics::set_known_peers(peers.len());
                        let _ = events.send(PeerEvent::Found(endpoint)).await;
                    }
                    return;
                }
                Err(err) if err.is_transient() && attempt < retry.max_attempts => {
                    let delay = retry.delay_for_attempt(attempt);
                    debug!(
                        service = %record.name,
                        attempt,
                        error = %err,
                        delay_ms = delay.as_millis() as u64,
                        "resolve failed, retrying"
                    );
                    crate::metrics::record_resolve_retry();
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown_rx.changed() => {
                            if *shutdown_rx.borrow() {
                                return;
                            }
                        }
                    }
                }
                Err(err) => {
                    warn!(service = %record.name, error = %err, "resolve failed, dropping candidate");
                    resolving.remove(&record.name);
                    return;
                }
            }
        }
        resolving.remove(&record.name);
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(host: &str, port: u16, name: &str) -> PeerEndpoint {
        PeerEndpoint {
            name: name.to_string(),
            host: host.to_string(),
            port,
            discovered_at_ms: 0,
        }
    }

    #[test]
    fn test_endpoint_identity_is_address() {
        let a = endpoint("10.0.0.2", 55990, "BeaconP2P-a");
        let b = endpoint("10.0.0.2", 55990, "BeaconP2P-b");
        let c = endpoint("10.0.0.3", 55990, "BeaconP2P-a");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_endpoint_hash_matches_eq() {
        use std::collections::HashSet;
        let mut set = HashSet::new();
        set.insert(endpoint("10.0.0.2", 55990, "x"));
        assert!(set.contains(&endpoint("10.0.0.2", 55990, "y")));
        assert!(!set.contains(&endpoint("10.0.0.2", 55991, "x")));
    }

    #[test]
    fn test_endpoint_display() {
        let e = endpoint("10.0.0.2", 55990, "BeaconP2P-pixel7");
        assert_eq!(e.to_string(), "BeaconP2P-pixel7 (10.0.0.2:55990)");
    }

    fn discovery(transport: Arc<crate::testing::MockDiscovery>) -> PeerDiscovery {
        PeerDiscovery::new(
            crate::config::DiscoveryConfig::default(),
            "BeaconP2P-self".to_string(),
            transport,
            RetryConfig::testing(),
        )
    }

    #[tokio::test]
    async fn test_stop_clears_peer_set() {
        let transport = Arc::new(crate::testing::MockDiscovery::new());
        let discovery = discovery(transport.clone());
        let (tx, mut rx) = mpsc::channel(8);
        discovery.start(tx).await.unwrap();

        transport.announce("BeaconP2P-other", "10.0.0.2", 55990).await;
        assert!(matches!(rx.recv().await, Some(PeerEvent::Found(_))));
        assert_eq!(discovery.current_peers().len(), 1);

        discovery.stop().await;
        assert!(discovery.current_peers().is_empty());
    }

    #[tokio::test]
    async fn test_lost_mid_resolve_cancels_candidate() {
        let transport = Arc::new(crate::testing::MockDiscovery::new());
        // First resolve fails; the retry would succeed after the backoff
        transport.fail_resolves("BeaconP2P-flap", 1);
        let discovery = discovery(transport.clone());
        let (tx, mut rx) = mpsc::channel(8);
        discovery.start(tx).await.unwrap();

        transport.announce("BeaconP2P-flap", "10.0.0.9", 55990).await;
        transport.report_lost("BeaconP2P-flap").await;

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert!(discovery.current_peers().is_empty());
        assert!(rx.try_recv().is_err());
        discovery.stop().await;
    }
}
