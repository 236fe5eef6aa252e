//! Engine lifecycle and status types.

use crate::session::SessionStatus;
use crate::transport::SessionTarget;

/// Lifecycle state of the engine.
///
/// ```text
/// Created → Starting → Running → ShuttingDown → Stopped
///               ↓
///            Failed        (unrecoverable startup error)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Constructed, not yet started.
    Created,
    /// `start()` in progress: provisioning identities, binding the
    /// listener, starting discovery.
    Starting,
    /// Discovery and sessions are live.
    Running,
    /// `shutdown()` in progress: draining sessions, withdrawing the
    /// advertisement.
    ShuttingDown,
    /// Cleanly shut down. Terminal.
    Stopped,
    /// Startup failed unrecoverably. Terminal.
    Failed,
}

impl EngineState {
    /// Whether the engine accepts work in this state.
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }

    /// Whether this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Created => "Created",
            Self::Starting => "Starting",
            Self::Running => "Running",
            Self::ShuttingDown => "ShuttingDown",
            Self::Stopped => "Stopped",
            Self::Failed => "Failed",
        };
        write!(f, "{}", s)
    }
}

/// One session's health as seen from the status surface.
#[derive(Debug, Clone)]
pub struct SessionHealth {
    pub target: SessionTarget,
    pub status: SessionStatus,
}

/// Engine-wide status snapshot. Produced without any network I/O.
#[derive(Debug, Clone)]
pub struct SyncStatus {
    pub state: EngineState,
    /// Resolved peers currently known to discovery.
    pub known_peers: usize,
    pub sessions: Vec<SessionHealth>,
}

impl SyncStatus {
    /// Look up one target's status.
    pub fn session(&self, target: &SessionTarget) -> Option<&SessionStatus> {
        self.sessions
            .iter()
            .find(|health| &health.target == target)
            .map(|health| &health.status)
    }
}
