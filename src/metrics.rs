//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Peer discovery (found/lost/resolve retries)
//! - Session lifecycle and progress
//! - Conflict resolutions by policy
//! - Engine state
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `beacon_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)

use crate::resolver::ConflictPolicy;
use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Record a service advertisement registration.
pub fn record_advertise() {
    counter!("beacon_advertisements_total").increment(1);
}

/// Record a peer resolved and added to the peer set.
pub fn record_peer_found() {
    counter!("beacon_peers_found_total").increment(1);
}

/// Record a peer removed from the peer set.
pub fn record_peer_lost() {
    counter!("beacon_peers_lost_total").increment(1);
}

/// Record a service-record resolve retry.
pub fn record_resolve_retry() {
    counter!("beacon_resolve_retries_total").increment(1);
}

/// Gauge for the resolved peer set size.
pub fn set_known_peers(count: usize) {
    gauge!("beacon_known_peers").set(count as f64);
}

/// Record a session state transition.
pub fn record_session_transition(target: &str, state: &str) {
    counter!(
        "beacon_session_transitions_total",
        "target" => target.to_string(),
        "state" => state.to_string()
    )
    .increment(1);
}

/// Record a session connect attempt outcome.
pub fn record_session_connect(target: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!(
        "beacon_session_connects_total",
        "target" => target.to_string(),
        "status" => status
    )
    .increment(1);
}

/// Gauge for the number of live sessions.
pub fn set_active_sessions(count: usize) {
    gauge!("beacon_active_sessions").set(count as f64);
}

/// Record documents pushed to a target.
pub fn record_docs_pushed(target: &str, count: usize) {
    if count > 0 {
        counter!("beacon_docs_pushed_total", "target" => target.to_string())
            .increment(count as u64);
    }
}

/// Record documents pulled and applied from a target.
pub fn record_docs_pulled(target: &str, count: usize) {
    if count > 0 {
        counter!("beacon_docs_pulled_total", "target" => target.to_string())
            .increment(count as u64);
    }
}

/// Record one sync round's duration for a target.
pub fn record_sync_round(target: &str, duration: Duration) {
    histogram!("beacon_sync_round_duration_seconds", "target" => target.to_string())
        .record(duration.as_secs_f64());
}

/// Record a conflict resolution by policy.
pub fn record_conflict_resolved(policy: ConflictPolicy) {
    counter!(
        "beacon_conflicts_resolved_total",
        "policy" => policy.to_string()
    )
    .increment(1);
}

/// Gauge for engine state.
pub fn set_engine_state(state: &str) {
    // Encode state as numeric for alerting.
    let value = match state {
        "Created" => 0.0,
        "Starting" => 1.0,
        "Running" => 2.0,
        "ShuttingDown" => 3.0,
        "Stopped" => 4.0,
        "Failed" => 5.0,
        _ => -1.0,
    };
    gauge!("beacon_engine_state").set(value);
}
