// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replication session supervision.
//!
//! One [`ReplicationSession`] runs per target as a supervised task doing
//! continuous push-and-pull replication.
//!
//! # Session Lifecycle
//!
//! ```text
//! Connecting → Active(Idle) ⇄ Active(Busy)
//!     ↑             ↓
//!     └── Offline ←─┘            (transient error, auto-resumes)
//!
//! any state → Stopped            (stop() or fatal error)
//! ```
//!
//! Transient transport errors move the session to `Offline`; it reconnects
//! with exponential backoff and no outside help. Auth failures are fatal to
//! the session: they surface through status and the exit notification and
//! are never retried. Progress and the last error are published on a watch
//! channel so `status()` never touches the network.

use crate::error::{EngineError, Result};
use crate::identity::Identity;
use crate::resilience::RetryConfig;
use crate::resolver::ConflictPolicy;
use crate::store::{ApplyOutcome, DocumentStore};
use crate::transport::{ReplicationLink, ReplicationTransport, SessionTarget};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, info_span, warn, Instrument};

/// Whether an active session is currently moving documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityLevel {
    Idle,
    Busy,
}

/// State of a replication session. See module docs for the diagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Connection attempt in progress.
    Connecting,
    /// Connected; replicating or waiting for changes.
    Active(ActivityLevel),
    /// Transient failure; reconnecting with backoff.
    Offline,
    /// Stopped, by request or fatally. Terminal.
    Stopped,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Active(ActivityLevel::Idle) => "idle",
            Self::Active(ActivityLevel::Busy) => "busy",
            Self::Offline => "offline",
            Self::Stopped => "stopped",
        }
    }
}

/// Point-in-time session status, published on a watch channel.
#[derive(Debug, Clone)]
pub struct SessionStatus {
    pub state: SessionState,
    pub last_error: Option<EngineError>,
    pub docs_completed: u64,
    pub docs_total: u64,
}

impl Default for SessionStatus {
    fn default() -> Self {
        Self {
            state: SessionState::Connecting,
            last_error: None,
            docs_completed: 0,
            docs_total: 0,
        }
    }
}

/// Sent to the engine when a session task exits for any reason.
#[derive(Debug, Clone)]
pub struct SessionExit {
    /// Unique id of the exiting session, so a stale exit cannot tear down
    /// a newer session for the same target.
    pub id: u64,
    pub target: SessionTarget,
    /// The fatal error, if the exit was not a requested stop.
    pub error: Option<EngineError>,
}

/// Everything a session task needs, handed over at spawn.
pub struct SessionContext {
    pub id: u64,
    pub target: SessionTarget,
    pub store: Arc<dyn DocumentStore>,
    pub transport: Arc<dyn ReplicationTransport>,
    pub identity: Identity,
    pub database: String,
    pub channels: Vec<String>,
    pub policy: ConflictPolicy,
    pub retry: RetryConfig,
    pub poll_interval: Duration,
    pub exit_tx: mpsc::Sender<SessionExit>,
}

/// Handle to a running session task.
pub struct ReplicationSession {
    id: u64,
    target: SessionTarget,
    status_rx: watch::Receiver<SessionStatus>,
    shutdown_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ReplicationSession {
    /// Spawn the session task. Returns immediately; connection happens in
    /// the background.
    pub fn spawn(ctx: SessionContext) -> Self {
        let (status_tx, status_rx) = watch::channel(SessionStatus::default());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let id = ctx.id;
        let target = ctx.target.clone();

        let span = info_span!("session", id, target = %target);
        let task = tokio::spawn(run_session(ctx, status_tx, shutdown_rx).instrument(span));

        Self {
            id,
            target,
            status_rx,
            shutdown_tx,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn target(&self) -> &SessionTarget {
        &self.target
    }

    /// Current status snapshot. No I/O.
    pub fn status(&self) -> SessionStatus {
        self.status_rx.borrow().clone()
    }

    /// Watch the status for changes.
    pub fn subscribe_status(&self) -> watch::Receiver<SessionStatus> {
        self.status_rx.clone()
    }

    /// Graceful stop. Idempotent; returns once the task has drained.
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(task) = self.task.lock().await.take() {
            let _ = task.await;
        }
    }

    /// Stop, abandoning the task if it does not drain within `drain`.
    pub async fn stop_with_timeout(&self, drain: Duration) {
        let _ = self.shutdown_tx.send(true);
        if let Some(task) = self.task.lock().await.take() {
            if timeout(drain, task).await.is_err() {
                warn!(target = %self.target, "session did not drain in time, abandoning");
            }
        }
    }
}

fn publish(
    status_tx: &watch::Sender<SessionStatus>,
    target: &SessionTarget,
    state: SessionState,
    error: Option<EngineError>,
) {
    crate::metrics::record_session_transition(&target.to_string(), state.as_str());
    status_tx.send_modify(|status| {
        status.state = state;
        if error.is_some() {
            status.last_error = error;
        }
    });
}

async fn run_session(
    ctx: SessionContext,
    status_tx: watch::Sender<SessionStatus>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let target_label = ctx.target.to_string();
    info!(target = %target_label, id = ctx.id, policy = %ctx.policy, "session starting");

    // Push checkpoint survives reconnects within the session.
    let mut checkpoint: u64 = 0;

    'reconnect: loop {
        publish(&status_tx, &ctx.target, SessionState::Connecting, None);

        let mut link = match connect_with_backoff(&ctx, &status_tx, &mut shutdown_rx).await {
            Ok(link) => link,
            Err(SessionEnd::Requested) => {
                publish(&status_tx, &ctx.target, SessionState::Stopped, None);
                notify_exit(&ctx, None).await;
                return;
            }
            Err(SessionEnd::Fatal(err)) => {
                warn!(target = %target_label, error = %err, "session failed fatally");
                publish(&status_tx, &ctx.target, SessionState::Stopped, Some(err.clone()));
                notify_exit(&ctx, Some(err)).await;
                return;
            }
        };

        publish(&status_tx, &ctx.target, SessionState::Active(ActivityLevel::Idle), None);

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        debug!(target = %target_label, "session stop requested");
                        let _ = link.close().await;
                        publish(&status_tx, &ctx.target, SessionState::Stopped, None);
                        notify_exit(&ctx, None).await;
                        return;
                    }
                }
                _ = sleep(ctx.poll_interval) => {
                    match sync_round(&ctx, link.as_mut(), &status_tx, &mut checkpoint).await {
                        Ok(()) => {}
                        Err(err) if err.is_transient() => {
                            warn!(target = %target_label, error = %err, "transport error, going offline");
                            publish(&status_tx, &ctx.target, SessionState::Offline, Some(err));
                            let _ = link.close().await;
                            continue 'reconnect;
                        }
                        Err(err) => {
                            warn!(target = %target_label, error = %err, "session failed fatally");
                            let _ = link.close().await;
                            publish(&status_tx, &ctx.target, SessionState::Stopped, Some(err.clone()));
                            notify_exit(&ctx, Some(err)).await;
                            return;
                        }
                    }
                }
            }
        }
    }
}

enum SessionEnd {
    /// Stop was requested while connecting.
    Requested,
    /// Non-transient error; the session will not recover.
    Fatal(EngineError),
}

async fn connect_with_backoff(
    ctx: &SessionContext,
    status_tx: &watch::Sender<SessionStatus>,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> std::result::Result<Box<dyn ReplicationLink>, SessionEnd> {
    let target_label = ctx.target.to_string();
    let mut attempt: usize = 0;

    loop {
        attempt += 1;
        let result = timeout(
            ctx.retry.connect_timeout,
            ctx.transport
                .connect(&ctx.target, &ctx.database, &ctx.channels, &ctx.identity),
        )
        .await
        .unwrap_or_else(|_| {
            Err(EngineError::transport(
                target_label.clone(),
                "connect timed out",
            ))
        });

        match result {
            Ok(link) => {
                crate::metrics::record_session_connect(&target_label, true);
                info!(target = %target_label, attempt, "session connected");
                return Ok(link);
            }
            Err(err) if !err.is_transient() => {
                crate::metrics::record_session_connect(&target_label, false);
                return Err(SessionEnd::Fatal(err));
            }
            Err(err) => {
                crate::metrics::record_session_connect(&target_label, false);
                if attempt >= ctx.retry.max_attempts {
                    return Err(SessionEnd::Fatal(err));
                }
                let delay = ctx.retry.delay_for_attempt(attempt);
                debug!(
                    target = %target_label,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "connect failed, backing off"
                );
                publish(status_tx, &ctx.target, SessionState::Offline, Some(err));
                tokio::select! {
                    _ = sleep(delay) => {}
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            return Err(SessionEnd::Requested);
                        }
                    }
                }
            }
        }
    }
}

/// One push-then-pull round over an open link.
async fn sync_round(
    ctx: &SessionContext,
    link: &mut dyn ReplicationLink,
    status_tx: &watch::Sender<SessionStatus>,
    checkpoint: &mut u64,
) -> Result<()> {
    let target_label = ctx.target.to_string();
    let started = Instant::now();

    let (outbound, next_checkpoint) = ctx.store.changes_since(*checkpoint).await?;
    let pushed = outbound.len();

    // Work is counted as pending the moment a batch is sized, and as
    // completed only once it actually lands, so status() shows in-flight
    // transfers rather than a perpetual 100%.
    if pushed > 0 {
        publish(status_tx, &ctx.target, SessionState::Active(ActivityLevel::Busy), None);
        status_tx.send_modify(|status| status.docs_total += pushed as u64);
        if let Err(err) = link.push(outbound).await {
            // The batch never made it; un-count it. It will be re-sized
            // from the unchanged checkpoint after reconnect.
            status_tx.send_modify(|status| status.docs_total -= pushed as u64);
            return Err(err);
        }
        // Only move the checkpoint once the remote accepted the batch.
        *checkpoint = next_checkpoint;
        status_tx.send_modify(|status| status.docs_completed += pushed as u64);
    }

    let inbound = link.pull().await?;
    let pulled = inbound.len();
    if pulled > 0 {
        if pushed == 0 {
            publish(status_tx, &ctx.target, SessionState::Active(ActivityLevel::Busy), None);
        }
        status_tx.send_modify(|status| status.docs_total += pulled as u64);
    }

    let mut applied = 0u64;
    for (doc, ancestry) in inbound {
        match ctx.store.apply_replicated(doc, ancestry, ctx.policy).await? {
            ApplyOutcome::Applied(_) | ApplyOutcome::Merged(_) => applied += 1,
            ApplyOutcome::Unchanged => {}
        }
        status_tx.send_modify(|status| status.docs_completed += 1);
    }

    if pushed > 0 || pulled > 0 {
        crate::metrics::record_docs_pushed(&target_label, pushed);
        crate::metrics::record_docs_pulled(&target_label, pulled);
        crate::metrics::record_sync_round(&target_label, started.elapsed());
        debug!(target = %target_label, pushed, pulled, applied, "sync round complete");
    }
    status_tx.send_modify(|status| {
        status.state = SessionState::Active(ActivityLevel::Idle);
    });
    Ok(())
}

async fn notify_exit(ctx: &SessionContext, error: Option<EngineError>) {
    let _ = ctx
        .exit_tx
        .send(SessionExit {
            id: ctx.id,
            target: ctx.target.clone(),
            error,
        })
        .await;
}
