// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Sync engine coordinator.
//!
//! The main orchestrator that ties together:
//! - The local document store via [`crate::store::DocumentStore`]
//! - Identity provisioning via [`crate::identity::IdentityVault`]
//! - Peer discovery via [`crate::discovery::PeerDiscovery`]
//! - Replication sessions via [`crate::session::ReplicationSession`]
//!
//! # Architecture
//!
//! Startup follows a fixed order: store, identities, listener, discovery,
//! sessions. Shutdown runs the same steps in reverse, draining sessions
//! with a timeout.
//!
//! All topology changes flow through one mpsc event queue consumed by a
//! single reconciliation loop: peer found/lost events from discovery,
//! session exits, and a periodic tick that re-reconciles against the
//! current peer snapshot. The session table is only mutated from that loop
//! and from the lifecycle calls, always behind one lock, so a session can
//! never be double-started or torn down twice.

mod types;

pub use types::{EngineState, SessionHealth, SyncStatus};

use crate::config::EngineConfig;
use crate::discovery::{AdvertisementHandle, DiscoveryTransport, PeerDiscovery, PeerEndpoint, PeerEvent};
use crate::document::{Document, EmergencyRequest};
use crate::error::{EngineError, Result};
use crate::identity::IdentityVault;
use crate::metrics;
use crate::resilience::RetryConfig;
use crate::session::{ReplicationSession, SessionContext, SessionExit};
use crate::store::{ChangeEvent, DocumentStore, Predicate};
use crate::transport::{ListenerHandle, ReplicationTransport, SessionTarget};
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Everything the reconciliation loop reacts to.
#[derive(Debug)]
enum EngineEvent {
    PeerFound(PeerEndpoint),
    PeerLost(PeerEndpoint),
    SessionEnded(SessionExit),
}

/// How often the loop re-reconciles against the peer snapshot, catching
/// anything a dropped event could have missed.
const RECONCILE_TICK: Duration = Duration::from_secs(30);

/// The sync engine.
///
/// Owns discovery, the accepting listener, and one replication session per
/// target. Constructed with its collaborators, started explicitly:
///
/// ```rust,no_run
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// use beacon_sync::{EngineConfig, MemoryStore, SyncEngine};
/// use std::sync::Arc;
/// # let discovery_transport = todo!();
/// # let replication_transport = todo!();
///
/// let engine = Arc::new(SyncEngine::new(
///     EngineConfig::for_testing("field-unit-1"),
///     Arc::new(MemoryStore::new()),
///     discovery_transport,
///     replication_transport,
/// ));
/// engine.start().await?;
/// # Ok(())
/// # }
/// ```
pub struct SyncEngine {
    config: EngineConfig,
    store: Arc<dyn DocumentStore>,
    transport: Arc<dyn ReplicationTransport>,
    identities: IdentityVault,
    discovery: Arc<PeerDiscovery>,

    state_tx: watch::Sender<EngineState>,
    state_rx: watch::Receiver<EngineState>,
    shutdown_tx: watch::Sender<bool>,

    sessions: Arc<Mutex<HashMap<SessionTarget, Arc<ReplicationSession>>>>,
    next_session_id: AtomicU64,
    session_retry: RetryConfig,

    exit_tx: mpsc::Sender<SessionExit>,
    exit_rx: Mutex<Option<mpsc::Receiver<SessionExit>>>,

    listener: Mutex<Option<Box<dyn ListenerHandle>>>,
    advertisement: Mutex<Option<AdvertisementHandle>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SyncEngine {
    /// Create a new engine. Starts in `Created` state; call
    /// [`start()`](Self::start) to go live.
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn DocumentStore>,
        discovery_transport: Arc<dyn DiscoveryTransport>,
        replication_transport: Arc<dyn ReplicationTransport>,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(EngineState::Created);
        let (shutdown_tx, _) = watch::channel(false);
        let (exit_tx, exit_rx) = mpsc::channel(64);

        let discovery = Arc::new(PeerDiscovery::new(
            config.discovery.clone(),
            config.service_name(),
            discovery_transport,
            RetryConfig::resolve(),
        ));
        let identities = IdentityVault::new(config.identity.clone());

        Self {
            config,
            store,
            transport: replication_transport,
            identities,
            discovery,
            state_tx,
            state_rx,
            shutdown_tx,
            sessions: Arc::new(Mutex::new(HashMap::new())),
            next_session_id: AtomicU64::new(1),
            session_retry: RetryConfig::session(),
            exit_tx,
            exit_rx: Mutex::new(Some(exit_rx)),
            listener: Mutex::new(None),
            advertisement: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Replace the session retry schedule. For tests that need fast
    /// reconnects.
    pub fn with_session_retry(mut self, retry: RetryConfig) -> Self {
        self.session_retry = retry;
        self
    }

    /// Current engine state.
    pub fn state(&self) -> EngineState {
        *self.state_rx.borrow()
    }

    /// Watch state changes.
    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.state_rx.clone()
    }

    pub fn is_running(&self) -> bool {
        self.state().is_running()
    }

    pub fn device_id(&self) -> &str {
        &self.config.device_id
    }

    fn set_state(&self, state: EngineState) {
        let _ = self.state_tx.send(state);
        metrics::set_engine_state(&state.to_string());
    }

    /// Start the engine.
    ///
    /// 1. Validates configuration
    /// 2. Provisions server and client identities
    /// 3. Binds the accepting replication listener
    /// 4. Advertises and starts browsing (failure here is non-fatal:
    ///    mesh sessions will not form but the gateway still syncs)
    /// 5. Starts the gateway session and the reconciliation loop
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.state() != EngineState::Created {
            return Err(EngineError::InvalidState {
                expected: "Created".to_string(),
                actual: self.state().to_string(),
            });
        }

        info!(
            device_id = %self.config.device_id,
            database = %self.config.database_name,
            "starting sync engine"
        );
        self.set_state(EngineState::Starting);

        if let Err(message) = self.config.validate() {
            self.set_state(EngineState::Failed);
            return Err(EngineError::Config(message));
        }

        // Identities before the listener: the listener binds with the
        // server identity, sessions connect with the client one.
        let server_identity = match self.identities.server_identity() {
            Ok(identity) => identity,
            Err(err) => {
                self.set_state(EngineState::Failed);
                return Err(err);
            }
        };
        if let Err(err) = self.identities.client_identity() {
            self.set_state(EngineState::Failed);
            return Err(err);
        }

        match self
            .transport
            .listen(self.config.discovery.listen_port, &server_identity)
            .await
        {
            Ok(handle) => {
                info!(port = handle.port(), "replication listener bound");
                *self.listener.lock().await = Some(handle);
            }
            Err(err) => {
                self.set_state(EngineState::Failed);
                return Err(err);
            }
        }

        let (peer_tx, peer_rx) = mpsc::channel::<PeerEvent>(64);
        if self.config.discovery.enabled {
            match self.discovery.advertise().await {
                Ok(handle) => *self.advertisement.lock().await = Some(handle),
                Err(err) => {
                    // Mesh formation degrades; gateway replication continues.
                    warn!(error = %err, "advertisement failed, running without mesh visibility");
                }
            }
            if let Err(err) = self.discovery.start(peer_tx).await {
                warn!(error = %err, "discovery unavailable, running gateway-only");
            }
        }

        self.spawn_reconcile_loop(peer_rx).await;

        if self.config.gateway.enabled {
            let target =
                SessionTarget::gateway(self.config.gateway.host.clone(), self.config.gateway.port);
            self.start_session(target).await?;
        }

        self.set_state(EngineState::Running);
        info!("sync engine running");
        Ok(())
    }

    /// Spawn the single consumer of the engine event queue.
    async fn spawn_reconcile_loop(self: &Arc<Self>, mut peer_rx: mpsc::Receiver<PeerEvent>) {
        let (event_tx, mut event_rx) = mpsc::channel::<EngineEvent>(128);

        // Forward discovery events into the single queue.
        let tx = event_tx.clone();
        let forward_peers = tokio::spawn(async move {
            while let Some(event) = peer_rx.recv().await {
                let event = match event {
                    PeerEvent::Found(endpoint) => EngineEvent::PeerFound(endpoint),
                    PeerEvent::Lost(endpoint) => EngineEvent::PeerLost(endpoint),
                };
                if tx.send(event).await.is_err() {
                    break;
                }
            }
        });

        // Forward session exits into the single queue.
        let mut exit_rx = self
            .exit_rx
            .lock()
            .await
            .take()
            .expect("engine started twice");
        let tx = event_tx;
        // The engine holds a live exit_tx for its whole life, so recv()
        // alone would never see the channel close; shut down via the watch.
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let forward_exits = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    exit = exit_rx.recv() => {
                        let Some(exit) = exit else { break };
                        if tx.send(EngineEvent::SessionEnded(exit)).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        let engine = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let reconcile_loop = tokio::spawn(async move {
            let mut tick = tokio::time::interval(RECONCILE_TICK);
            tick.tick().await; // first tick fires immediately, skip it
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            debug!("reconcile loop stopping");
                            break;
                        }
                    }
                    _ = tick.tick() => {
                        let peers = engine.discovery.current_peers();
                        if let Err(err) = engine.reconcile(peers).await {
                            warn!(error = %err, "periodic reconcile failed");
                        }
                    }
                    event = event_rx.recv() => {
                        let Some(event) = event else { break };
                        engine.handle_event(event).await;
                    }
                }
            }
        });

        let mut tasks = self.tasks.lock().await;
        tasks.push(forward_peers);
        tasks.push(forward_exits);
        tasks.push(reconcile_loop);
    }

    async fn handle_event(self: &Arc<Self>, event: EngineEvent) {
        match event {
            EngineEvent::PeerFound(endpoint) => {
                if let Err(err) = self.start_session(SessionTarget::Peer(endpoint)).await {
                    warn!(error = %err, "failed to start peer session");
                }
            }
            EngineEvent::PeerLost(endpoint) => {
                self.stop_session(&SessionTarget::Peer(endpoint)).await;
            }
            EngineEvent::SessionEnded(exit) => {
                let mut sessions = self.sessions.lock().await;
                match exit.error {
                    None => {
                        // Remove only if the table still holds this exact
                        // session; a newer one may have taken the slot.
                        if sessions
                            .get(&exit.target)
                            .is_some_and(|session| session.id() == exit.id)
                        {
                            sessions.remove(&exit.target);
                            metrics::set_active_sessions(sessions.len());
                        }
                    }
                    Some(err) => {
                        // Fatal exit: keep the stopped session in the table
                        // so its error stays visible in status() and the
                        // reconcile tick does not blindly restart it.
                        warn!(target = %exit.target, error = %err, "session ended fatally");
                    }
                }
            }
        }
    }

    /// Bring the session table in line with a peer snapshot: start sessions
    /// for new peers, stop sessions for vanished ones. Idempotent.
    pub async fn reconcile(self: &Arc<Self>, current_peers: Vec<PeerEndpoint>) -> Result<()> {
        let existing: Vec<SessionTarget> = {
            let sessions = self.sessions.lock().await;
            sessions.keys().cloned().collect()
        };

        for target in &existing {
            let SessionTarget::Peer(endpoint) = target else {
                continue;
            };
            if !current_peers.contains(endpoint) {
                self.stop_session(target).await;
            }
        }

        for endpoint in current_peers {
            let target = SessionTarget::Peer(endpoint);
            if !existing.contains(&target) {
                self.start_session(target).await?;
            }
        }
        Ok(())
    }

    /// Start a session for a target. Idempotent: a target that already has
    /// a session (running or fatally stopped) is left alone. Never blocks
    /// on network I/O; the connection happens in the session task.
    pub async fn start_session(self: &Arc<Self>, target: SessionTarget) -> Result<()> {
        if self.state().is_terminal() {
            return Err(EngineError::Shutdown);
        }

        let mut sessions = self.sessions.lock().await;
        if sessions.contains_key(&target) {
            debug!(target = %target, "session already exists");
            return Ok(());
        }

        let identity = self.identities.client_identity()?;
        let policy = if target.is_gateway() {
            self.config.session.gateway_policy
        } else {
            self.config.session.mesh_policy
        };
        let id = self.next_session_id.fetch_add(1, Ordering::Relaxed);

        info!(target = %target, id, policy = %policy, "starting session");
        let session = ReplicationSession::spawn(SessionContext {
            id,
            target: target.clone(),
            store: Arc::clone(&self.store),
            transport: Arc::clone(&self.transport),
            identity,
            database: self.config.database_name.clone(),
            channels: self.config.channels.clone(),
            policy,
            retry: self.session_retry.clone(),
            poll_interval: self.config.session.poll_interval_duration(),
            exit_tx: self.exit_tx.clone(),
        });
        sessions.insert(target, Arc::new(session));
        metrics::set_active_sessions(sessions.len());
        Ok(())
    }

    /// Stop a target's session and forget it. Idempotent.
    pub async fn stop_session(self: &Arc<Self>, target: &SessionTarget) {
        let session = {
            let mut sessions = self.sessions.lock().await;
            let session = sessions.remove(target);
            metrics::set_active_sessions(sessions.len());
            session
        };
        if let Some(session) = session {
            info!(target = %target, id = session.id(), "stopping session");
            session
                .stop_with_timeout(self.config.session.drain_timeout_duration())
                .await;
        }
    }

    /// Engine-wide status snapshot. Performs no network I/O.
    pub async fn status(&self) -> SyncStatus {
        let sessions = self.sessions.lock().await;
        let sessions = sessions
            .iter()
            .map(|(target, session)| SessionHealth {
                target: target.clone(),
                status: session.status(),
            })
            .collect();
        SyncStatus {
            state: self.state(),
            known_peers: self.discovery.current_peers().len(),
            sessions,
        }
    }

    /// Resolved peers currently known to discovery.
    pub fn current_peers(&self) -> Vec<PeerEndpoint> {
        self.discovery.current_peers()
    }

    /// Shut down gracefully, in reverse start order: sessions drain first,
    /// then discovery stops, the advertisement is withdrawn, and the
    /// listener closes. Idempotent.
    pub async fn shutdown(self: &Arc<Self>) {
        if self.state().is_terminal() {
            return;
        }
        info!("shutting down sync engine");
        self.set_state(EngineState::ShuttingDown);

        // Drain every session concurrently; each respects the drain timeout.
        let sessions: Vec<Arc<ReplicationSession>> = {
            let mut table = self.sessions.lock().await;
            metrics::set_active_sessions(0);
            table.drain().map(|(_, session)| session).collect()
        };
        let drain = self.config.session.drain_timeout_duration();
        futures::future::join_all(
            sessions
                .iter()
                .map(|session| session.stop_with_timeout(drain)),
        )
        .await;

        self.discovery.stop().await;

        if let Some(mut advertisement) = self.advertisement.lock().await.take() {
            if let Err(err) = advertisement.stop().await {
                warn!(error = %err, "failed to withdraw advertisement");
            }
        }

        if let Some(mut listener) = self.listener.lock().await.take() {
            if let Err(err) = listener.stop().await {
                warn!(error = %err, "failed to stop listener");
            }
        }

        let _ = self.shutdown_tx.send(true);
        let tasks: Vec<_> = std::mem::take(&mut *self.tasks.lock().await);
        for task in tasks {
            let _ = task.await;
        }

        self.set_state(EngineState::Stopped);
        info!("sync engine stopped");
    }

    // ─────────────────────────────────────────────────────────────────────
    // Responder workflow
    // ─────────────────────────────────────────────────────────────────────

    /// Save a new emergency request. It replicates to every connected
    /// target on the next sync round.
    pub async fn save_emergency_request(&self, request: EmergencyRequest) -> Result<Document> {
        let doc = Document::with_generated_id(request.into_fields());
        info!(doc_id = %doc.id, "saving emergency request");
        self.store.save(doc).await
    }

    /// Accept an open request as `responder_id`.
    ///
    /// Status is monotonic: accepting an already-responded request is a
    /// no-op returning the current revision, never a revert.
    pub async fn accept_request(&self, doc_id: &str, responder_id: &str) -> Result<Document> {
        let Some(doc) = self.store.get(doc_id).await? else {
            return Err(EngineError::Store(format!("document {} not found", doc_id)));
        };
        if doc.get_str("status") == Some("responded") {
            debug!(doc_id, "request already responded, leaving as-is");
            return Ok(doc);
        }

        let mut fields = doc.fields.clone();
        fields.insert("status".to_string(), json!("responded"));
        fields.insert("responded_by".to_string(), json!(responder_id));
        fields.insert("responded_at".to_string(), json!(crate::epoch_millis()));
        let revised = doc.revise(fields);
        info!(doc_id, responder_id, "accepting emergency request");
        self.store.save(revised).await
    }

    /// Subscribe to changes matching a predicate. This is the only surface
    /// the presentation layer needs: map markers and dialogs hang off it.
    pub fn subscribe(&self, predicate: Predicate) -> mpsc::UnboundedReceiver<ChangeEvent> {
        let mut changes = self.store.subscribe();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            loop {
                match changes.recv().await {
                    Ok(event) => {
                        if predicate.matches(&event.doc) && tx.send(event).is_err() {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "change subscriber lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        rx
    }
}
