//! Test doubles for the discovery and replication transports.
//!
//! Used by this crate's own tests and available to downstream crates that
//! want to exercise the engine without a real network. [`MockDiscovery`]
//! lets a test script found/lost service records and resolution outcomes;
//! [`MockWire`] records pushes, serves scripted pulls, and injects
//! connect/link failures.

use crate::discovery::{DiscoveryTransport, ServiceEvent, ServiceRecord};
use crate::document::Document;
use crate::error::{EngineError, Result};
use crate::identity::Identity;
use crate::store::BoxFuture;
use crate::transport::{ListenerHandle, ReplicationLink, ReplicationTransport, RevisionBatch, SessionTarget};
use dashmap::DashMap;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

// ═══════════════════════════════════════════════════════════════════════════════
// MockDiscovery
// ═══════════════════════════════════════════════════════════════════════════════

/// Scriptable [`DiscoveryTransport`].
pub struct MockDiscovery {
    browse_tx: Mutex<Option<mpsc::Sender<ServiceEvent>>>,
    /// name → (host, port) answered by `resolve`.
    resolutions: DashMap<String, (String, u16)>,
    /// name → remaining transient resolve failures before success.
    resolve_failures: DashMap<String, usize>,
    refuse_advertise: AtomicBool,
    advertised: Mutex<Vec<String>>,
    unadvertised: AtomicUsize,
}

impl Default for MockDiscovery {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDiscovery {
    pub fn new() -> Self {
        Self {
            browse_tx: Mutex::new(None),
            resolutions: DashMap::new(),
            resolve_failures: DashMap::new(),
            refuse_advertise: AtomicBool::new(false),
            advertised: Mutex::new(Vec::new()),
            unadvertised: AtomicUsize::new(0),
        }
    }

    /// Make every `advertise` call fail with `DiscoveryUnavailable`.
    pub fn refuse_advertisements(&self) {
        self.refuse_advertise.store(true, Ordering::SeqCst);
    }

    /// Names registered through `advertise`.
    pub fn advertised_names(&self) -> Vec<String> {
        self.advertised.lock().unwrap().clone()
    }

    pub fn unadvertise_count(&self) -> usize {
        self.unadvertised.load(Ordering::SeqCst)
    }

    /// Inject `count` transient resolve failures before `name` resolves.
    pub fn fail_resolves(&self, name: &str, count: usize) {
        self.resolve_failures.insert(name.to_string(), count);
    }

    /// Announce a resolvable service: the browser reports it found and
    /// `resolve` answers with the given address.
    pub async fn announce(&self, name: &str, host: &str, port: u16) {
        self.resolutions
            .insert(name.to_string(), (host.to_string(), port));
        self.send(ServiceEvent::Found(ServiceRecord {
            name: name.to_string(),
            service_type: "_beaconp2p._tcp.".to_string(),
        }))
        .await;
    }

    /// Announce a service with no registered resolution; `resolve` fails.
    pub async fn announce_unresolvable(&self, name: &str) {
        self.send(ServiceEvent::Found(ServiceRecord {
            name: name.to_string(),
            service_type: "_beaconp2p._tcp.".to_string(),
        }))
        .await;
    }

    /// Report a service lost while keeping its resolution registered, as
    /// when a record disappears from the browser mid-resolve.
    pub async fn report_lost(&self, name: &str) {
        self.send(ServiceEvent::Lost(ServiceRecord {
            name: name.to_string(),
            service_type: "_beaconp2p._tcp.".to_string(),
        }))
        .await;
    }

    /// Withdraw a previously announced service.
    pub async fn withdraw(&self, name: &str) {
        self.resolutions.remove(name);
        self.send(ServiceEvent::Lost(ServiceRecord {
            name: name.to_string(),
            service_type: "_beaconp2p._tcp.".to_string(),
        }))
        .await;
    }

    async fn send(&self, event: ServiceEvent) {
        let tx = self.browse_tx.lock().unwrap().clone();
        if let Some(tx) = tx {
            let _ = tx.send(event).await;
        }
    }
}

impl DiscoveryTransport for MockDiscovery {
    fn advertise<'a>(
        &'a self,
        name: &'a str,
        _service_type: &'a str,
        _port: u16,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            if self.refuse_advertise.load(Ordering::SeqCst) {
                return Err(EngineError::DiscoveryUnavailable(
                    "registration refused".to_string(),
                ));
            }
            self.advertised.lock().unwrap().push(name.to_string());
            Ok(())
        })
    }

    fn unadvertise(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.unadvertised.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    fn browse<'a>(
        &'a self,
        _service_type: &'a str,
    ) -> BoxFuture<'a, Result<mpsc::Receiver<ServiceEvent>>> {
        Box::pin(async move {
            let (tx, rx) = mpsc::channel(64);
            *self.browse_tx.lock().unwrap() = Some(tx);
            Ok(rx)
        })
    }

    fn resolve<'a>(&'a self, record: &'a ServiceRecord) -> BoxFuture<'a, Result<(String, u16)>> {
        Box::pin(async move {
            if let Some(mut remaining) = self.resolve_failures.get_mut(&record.name) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(EngineError::ResolveFailed {
                        service: record.name.clone(),
                        message: "injected failure".to_string(),
                    });
                }
            }
            match self.resolutions.get(&record.name) {
                Some(addr) => Ok(addr.clone()),
                None => Err(EngineError::ResolveFailed {
                    service: record.name.clone(),
                    message: "no such host".to_string(),
                }),
            }
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// MockWire
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Default)]
struct WireState {
    /// url → batches the engine pushed.
    pushed: HashMap<String, Vec<RevisionBatch>>,
    /// url → batches to serve on pull.
    to_pull: HashMap<String, VecDeque<RevisionBatch>>,
    /// urls whose next link operation fails transiently.
    broken: HashSet<String>,
}

/// Scriptable [`ReplicationTransport`].
pub struct MockWire {
    state: Arc<Mutex<WireState>>,
    fail_connects: AtomicUsize,
    reject_auth: AtomicBool,
    listens: AtomicUsize,
    connects: AtomicUsize,
}

impl Default for MockWire {
    fn default() -> Self {
        Self::new()
    }
}

impl MockWire {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(WireState::default())),
            fail_connects: AtomicUsize::new(0),
            reject_auth: AtomicBool::new(false),
            listens: AtomicUsize::new(0),
            connects: AtomicUsize::new(0),
        }
    }

    /// Fail the next `count` connect attempts with a transport error.
    pub fn fail_next_connects(&self, count: usize) {
        self.fail_connects.store(count, Ordering::SeqCst);
    }

    /// Reject every connect with an auth failure.
    pub fn reject_auth(&self, reject: bool) {
        self.reject_auth.store(reject, Ordering::SeqCst);
    }

    /// Make the next push or pull on `url` fail transiently, as if the
    /// link dropped mid-session.
    pub fn break_link(&self, url: &str) {
        self.state.lock().unwrap().broken.insert(url.to_string());
    }

    /// Queue a batch for the engine to pull from `url`.
    pub fn enqueue_pull(&self, url: &str, batch: RevisionBatch) {
        self.state
            .lock()
            .unwrap()
            .to_pull
            .entry(url.to_string())
            .or_default()
            .push_back(batch);
    }

    /// Everything pushed to `url`, flattened.
    pub fn pushed_docs(&self, url: &str) -> Vec<Document> {
        self.state
            .lock()
            .unwrap()
            .pushed
            .get(url)
            .map(|batches| {
                batches
                    .iter()
                    .flatten()
                    .map(|(doc, _)| doc.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn listen_count(&self) -> usize {
        self.listens.load(Ordering::SeqCst)
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

struct MockListener {
    port: u16,
    stopped: bool,
}

impl ListenerHandle for MockListener {
    fn port(&self) -> u16 {
        self.port
    }

    fn stop(&mut self) -> BoxFuture<'_, Result<()>> {
        self.stopped = true;
        Box::pin(async { Ok(()) })
    }
}

struct MockLink {
    url: String,
    state: Arc<Mutex<WireState>>,
}

impl MockLink {
    fn check_broken(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.broken.remove(&self.url) {
            return Err(EngineError::transport(self.url.clone(), "link dropped"));
        }
        Ok(())
    }
}

impl ReplicationLink for MockLink {
    fn push<'a>(&'a mut self, batch: RevisionBatch) -> BoxFuture<'a, Result<usize>> {
        let result = self.check_broken().map(|()| {
            let count = batch.len();
            self.state
                .lock()
                .unwrap()
                .pushed
                .entry(self.url.clone())
                .or_default()
                .push(batch);
            count
        });
        Box::pin(async move { result })
    }

    fn pull(&mut self) -> BoxFuture<'_, Result<RevisionBatch>> {
        let result = self.check_broken().map(|()| {
            self.state
                .lock()
                .unwrap()
                .to_pull
                .get_mut(&self.url)
                .and_then(VecDeque::pop_front)
                .unwrap_or_default()
        });
        Box::pin(async move { result })
    }

    fn close(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }
}

impl ReplicationTransport for MockWire {
    fn listen<'a>(
        &'a self,
        port: u16,
        _identity: &'a Identity,
    ) -> BoxFuture<'a, Result<Box<dyn ListenerHandle>>> {
        Box::pin(async move {
            self.listens.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(MockListener {
                port,
                stopped: false,
            }) as Box<dyn ListenerHandle>)
        })
    }

    fn connect<'a>(
        &'a self,
        target: &'a SessionTarget,
        database: &'a str,
        _channels: &'a [String],
        _identity: &'a Identity,
    ) -> BoxFuture<'a, Result<Box<dyn ReplicationLink>>> {
        Box::pin(async move {
            self.connects.fetch_add(1, Ordering::SeqCst);
            if self.reject_auth.load(Ordering::SeqCst) {
                return Err(EngineError::auth(target.to_string(), "identity rejected"));
            }
            let remaining = self.fail_connects.load(Ordering::SeqCst);
            if remaining > 0 {
                self.fail_connects.store(remaining - 1, Ordering::SeqCst);
                return Err(EngineError::transport(
                    target.to_string(),
                    "connection refused",
                ));
            }
            Ok(Box::new(MockLink {
                url: target.endpoint_url(database),
                state: Arc::clone(&self.state),
            }) as Box<dyn ReplicationLink>)
        })
    }
}
