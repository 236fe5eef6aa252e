//! Deterministic conflict resolution.
//!
//! When a pulled revision conflicts with a local revision, the store invokes
//! [`resolve`] before making any revision visible. Resolution is pure and
//! total: same inputs always give the same output, any input pair gives
//! some output, and it never touches I/O. Two policies exist:
//!
//! - [`ConflictPolicy::Mesh`]: field-set union, remote overwrites local on
//!   key collision. Used on peer links, where both sides are field devices
//!   and losing either side's edits is worse than a biased merge.
//! - [`ConflictPolicy::Gateway`]: the earlier effective timestamp wins and
//!   the winning document is kept verbatim. `responded_at` is compared if
//!   present, else `requested_at`; a document with neither is infinitely
//!   stale and loses. Earlier-wins makes the first responder to accept a
//!   request keep it, no matter in which order replicas exchange edits.
//!
//! Every replica resolving the same pair picks the same winner, so replicas
//! converge without coordination.

use crate::document::Document;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Timestamp assigned to a side with no usable domain timestamp.
/// Such a side always loses the gateway comparison.
const STALE_SENTINEL: i64 = i64::MAX;

/// Which resolution rule a session applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConflictPolicy {
    /// Field-set union, remote overwrites local on collision.
    Mesh,
    /// Earlier effective timestamp wins, winner kept verbatim.
    Gateway,
}

impl std::fmt::Display for ConflictPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Mesh => write!(f, "mesh"),
            Self::Gateway => write!(f, "gateway"),
        }
    }
}

/// Resolve a conflict between a local and a remote revision of `doc_id`.
///
/// Either side may be absent (purged or never materialized). Resolving two
/// absent sides yields an explicit tombstone so the session never has to
/// abort on bad input.
pub fn resolve(
    policy: ConflictPolicy,
    doc_id: &str,
    local: Option<&Document>,
    remote: Option<&Document>,
) -> Document {
    match (local, remote) {
        (None, None) => Document::tombstone(doc_id),
        (Some(doc), None) | (None, Some(doc)) => doc.clone(),
        (Some(local), Some(remote)) => match policy {
            ConflictPolicy::Mesh => mesh_merge(local, remote),
            ConflictPolicy::Gateway => gateway_winner(local, remote).clone(),
        },
    }
}

/// Union of both field sets; remote overwrites local on key collision.
///
/// If the union adds nothing over one side, that side is returned unchanged
/// so repeated resolution is a fixed point (`resolve(D, D) == D`).
fn mesh_merge(local: &Document, remote: &Document) -> Document {
    if local.deleted {
        return remote.clone();
    }
    if remote.deleted {
        return local.clone();
    }

    let mut merged: BTreeMap<String, Value> = local.fields.clone();
    for (key, value) in &remote.fields {
        merged.insert(key.clone(), value.clone());
    }

    if merged == remote.fields {
        return remote.clone();
    }
    if merged == local.fields {
        return local.clone();
    }

    let base = if local.generation() >= remote.generation() {
        local
    } else {
        remote
    };
    base.revise(merged)
}

/// Pick the winner under the gateway rule. The winner is returned as-is;
/// cloning it verbatim keeps resolution commutative.
fn gateway_winner<'a>(local: &'a Document, remote: &'a Document) -> &'a Document {
    let local_ts = effective_or_stale(local);
    let remote_ts = effective_or_stale(remote);

    if local_ts != remote_ts {
        return if local_ts < remote_ts { local } else { remote };
    }
    // Equal timestamps. Tie-break on the smaller revision id so both sides
    // of an exchange agree on the winner.
    if local.rev <= remote.rev {
        local
    } else {
        remote
    }
}

/// The comparison timestamp: `responded_at`, else `requested_at`, else the
/// stale sentinel. Tombstones carry no fields and so are always stale.
fn effective_or_stale(doc: &Document) -> i64 {
    doc.effective_timestamp().unwrap_or(STALE_SENTINEL)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{EmergencyRequest, EmergencyType};
    use serde_json::json;

    fn request_doc(id: &str, requested_at: i64, responded_at: Option<i64>) -> Document {
        let mut req =
            EmergencyRequest::new_open(EmergencyType::Ambulance, "stockholm", "1", requested_at);
        if let Some(at) = responded_at {
            req.responded_at = Some(at);
            req.responded_by = Some("responder".to_string());
        }
        Document::new(id, req.into_fields())
    }

    fn doc_with(id: &str, pairs: &[(&str, Value)]) -> Document {
        let fields = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        Document::new(id, fields)
    }

    // ── Gateway policy ──────────────────────────────────────────────────

    #[test]
    fn test_gateway_first_responder_wins() {
        let early = request_doc("r1", 1000, Some(1400));
        let late = request_doc("r1", 1000, Some(1500));

        let resolved = resolve(ConflictPolicy::Gateway, "r1", Some(&early), Some(&late));
        assert_eq!(resolved, early);

        // Same winner with the sides swapped
        let resolved = resolve(ConflictPolicy::Gateway, "r1", Some(&late), Some(&early));
        assert_eq!(resolved, early);
    }

    #[test]
    fn test_gateway_responded_beats_requested() {
        // responded_at 1400 < requested_at-only 1450? No: the side with
        // responded_at compares on 1400, the open side on its requested_at.
        let responded = request_doc("r1", 1000, Some(1400));
        let open = request_doc("r1", 1450, None);

        let resolved = resolve(ConflictPolicy::Gateway, "r1", Some(&open), Some(&responded));
        assert_eq!(resolved, responded);
    }

    #[test]
    fn test_gateway_missing_timestamps_lose() {
        let with_ts = request_doc("r1", 2000, None);
        let without = doc_with("r1", &[("type", json!("emergency_request"))]);

        let resolved = resolve(ConflictPolicy::Gateway, "r1", Some(&without), Some(&with_ts));
        assert_eq!(resolved, with_ts);
        let resolved = resolve(ConflictPolicy::Gateway, "r1", Some(&with_ts), Some(&without));
        assert_eq!(resolved, with_ts);
    }

    #[test]
    fn test_gateway_tie_breaks_on_rev() {
        let a = doc_with("r1", &[("requested_at", json!(1000)), ("city", json!("oslo"))]);
        let b = doc_with("r1", &[("requested_at", json!(1000)), ("city", json!("umea"))]);
        assert_ne!(a.rev, b.rev);

        let winner = if a.rev < b.rev { &a } else { &b };
        assert_eq!(resolve(ConflictPolicy::Gateway, "r1", Some(&a), Some(&b)), *winner);
        assert_eq!(resolve(ConflictPolicy::Gateway, "r1", Some(&b), Some(&a)), *winner);
    }

    #[test]
    fn test_gateway_winner_verbatim() {
        // The loser's extra fields must not leak into the result.
        let mut winner = request_doc("r1", 1000, Some(1400));
        winner.fields.insert("note".into(), json!("first"));
        winner = Document::new("r1", winner.fields);
        let mut loser = request_doc("r1", 1000, Some(1500));
        loser.fields.insert("extra".into(), json!("second"));
        loser = Document::new("r1", loser.fields);

        let resolved = resolve(ConflictPolicy::Gateway, "r1", Some(&loser), Some(&winner));
        assert_eq!(resolved, winner);
        assert!(!resolved.fields.contains_key("extra"));
    }

    // ── Mesh policy ─────────────────────────────────────────────────────

    #[test]
    fn test_mesh_disjoint_union() {
        let local = doc_with("r1", &[("a", json!(1))]);
        let remote = doc_with("r1", &[("b", json!(2))]);

        let resolved = resolve(ConflictPolicy::Mesh, "r1", Some(&local), Some(&remote));
        assert_eq!(resolved.fields.get("a"), Some(&json!(1)));
        assert_eq!(resolved.fields.get("b"), Some(&json!(2)));
    }

    #[test]
    fn test_mesh_remote_overwrites_on_collision() {
        let local = doc_with("r1", &[("city", json!("oslo")), ("a", json!(1))]);
        let remote = doc_with("r1", &[("city", json!("umea"))]);

        let resolved = resolve(ConflictPolicy::Mesh, "r1", Some(&local), Some(&remote));
        assert_eq!(resolved.fields.get("city"), Some(&json!("umea")));
        assert_eq!(resolved.fields.get("a"), Some(&json!(1)));
    }

    #[test]
    fn test_mesh_identical_is_fixed_point() {
        let doc = request_doc("r1", 1000, None);
        let resolved = resolve(ConflictPolicy::Mesh, "r1", Some(&doc), Some(&doc));
        assert_eq!(resolved, doc);
    }

    #[test]
    fn test_mesh_superset_side_returned_unchanged() {
        let small = doc_with("r1", &[("a", json!(1))]);
        let big = doc_with("r1", &[("a", json!(1)), ("b", json!(2))]);

        assert_eq!(resolve(ConflictPolicy::Mesh, "r1", Some(&small), Some(&big)), big);
        assert_eq!(resolve(ConflictPolicy::Mesh, "r1", Some(&big), Some(&small)), big);
    }

    #[test]
    fn test_mesh_tombstone_loses_to_content() {
        let live = request_doc("r1", 1000, None);
        let dead = Document::tombstone("r1");

        assert_eq!(resolve(ConflictPolicy::Mesh, "r1", Some(&dead), Some(&live)), live);
        assert_eq!(resolve(ConflictPolicy::Mesh, "r1", Some(&live), Some(&dead)), live);
    }

    #[test]
    fn test_mesh_merge_bumps_generation() {
        let local = doc_with("r1", &[("a", json!(1))]);
        let remote = doc_with("r1", &[("b", json!(2))]);
        let resolved = resolve(ConflictPolicy::Mesh, "r1", Some(&local), Some(&remote));
        assert_eq!(resolved.generation(), 2);
    }

    // ── Absent sides ────────────────────────────────────────────────────

    #[test]
    fn test_one_side_absent() {
        let doc = request_doc("r1", 1000, None);
        for policy in [ConflictPolicy::Mesh, ConflictPolicy::Gateway] {
            assert_eq!(resolve(policy, "r1", Some(&doc), None), doc);
            assert_eq!(resolve(policy, "r1", None, Some(&doc)), doc);
        }
    }

    #[test]
    fn test_both_sides_absent_yields_tombstone() {
        for policy in [ConflictPolicy::Mesh, ConflictPolicy::Gateway] {
            let resolved = resolve(policy, "gone", None, None);
            assert!(resolved.deleted);
            assert_eq!(resolved.id, "gone");
        }
    }
}
