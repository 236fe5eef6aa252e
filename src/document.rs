//! Document model.
//!
//! A [`Document`] is a revisioned map of field name to JSON value, identified
//! by a stable id. Revisions are `"{generation}-{hash}"` strings: the
//! generation counts mutations, the hash digests the body so two replicas
//! that make the same edit produce the same revision id.
//!
//! Two typed views exist over the raw field map:
//!
//! - [`EmergencyRequest`]: an open call for help (`status` moves `open` →
//!   `responded`, one-directional, never reverts).
//! - [`ResponderProfile`]: a responder's capability and location record.
//!
//! The views are lossy projections for application code; replication always
//! moves the raw field map so unknown fields survive round-trips.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// `type` discriminator for emergency request documents.
pub const TYPE_EMERGENCY_REQUEST: &str = "emergency_request";

/// `type` discriminator for responder profile documents.
pub const TYPE_USER: &str = "user";

/// The static replication channel for emergency requests.
///
/// City-based channel routing is a stub for now: every request lands in one
/// topic regardless of city.
pub const EMERGENCY_CHANNEL: &str = "emergency_requests";

/// Replication channel for responder profiles.
pub const USERS_CHANNEL: &str = "users";

/// Kind of emergency service being requested (or offered by a responder).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EmergencyType {
    Ambulance,
    Doctor,
    FireTruck,
    RescueTeam,
    Generator,
    WaterSupply,
}

impl EmergencyType {
    /// Wire name, matching the document field values.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ambulance => "Ambulance",
            Self::Doctor => "Doctor",
            Self::FireTruck => "FireTruck",
            Self::RescueTeam => "RescueTeam",
            Self::Generator => "Generator",
            Self::WaterSupply => "WaterSupply",
        }
    }

    /// Parse a wire name. Returns `None` for unknown values.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Ambulance" => Some(Self::Ambulance),
            "Doctor" => Some(Self::Doctor),
            "FireTruck" => Some(Self::FireTruck),
            "RescueTeam" => Some(Self::RescueTeam),
            "Generator" => Some(Self::Generator),
            "WaterSupply" => Some(Self::WaterSupply),
            _ => None,
        }
    }
}

impl std::fmt::Display for EmergencyType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Status of an emergency request. Transitions are one-directional:
/// `Open` → `Responded`, never back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestStatus {
    Open,
    Responded,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Responded => "responded",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "open" => Some(Self::Open),
            "responded" => Some(Self::Responded),
            _ => None,
        }
    }
}

/// A revisioned document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Stable, globally unique id. Never changes across revisions.
    pub id: String,
    /// Current revision id, `"{generation}-{hash}"`.
    pub rev: String,
    /// Tombstone flag. A deleted document keeps its id and revision
    /// lineage but carries no fields.
    pub deleted: bool,
    /// Field map. `BTreeMap` so serialization order is deterministic and
    /// revision hashes are stable.
    pub fields: BTreeMap<String, Value>,
}

impl Document {
    /// Create a first-generation document with the given id and fields.
    pub fn new(id: impl Into<String>, fields: BTreeMap<String, Value>) -> Self {
        let id = id.into();
        let rev = compute_rev(1, &id, &fields, false);
        Self {
            id,
            rev,
            deleted: false,
            fields,
        }
    }

    /// Create a first-generation document with a random id.
    pub fn with_generated_id(fields: BTreeMap<String, Value>) -> Self {
        Self::new(uuid::Uuid::new_v4().to_string(), fields)
    }

    /// Create a tombstone for the given id.
    ///
    /// Used by the resolver when a conflict arrives with no usable document
    /// on either side: resolution must still produce a value.
    pub fn tombstone(id: impl Into<String>) -> Self {
        let id = id.into();
        let fields = BTreeMap::new();
        let rev = compute_rev(1, &id, &fields, true);
        Self {
            id,
            rev,
            deleted: true,
            fields,
        }
    }

    /// Produce the next revision of this document with replaced fields.
    pub fn revise(&self, fields: BTreeMap<String, Value>) -> Self {
        let generation = self.generation() + 1;
        let rev = compute_rev(generation, &self.id, &fields, false);
        Self {
            id: self.id.clone(),
            rev,
            deleted: false,
            fields,
        }
    }

    /// Produce a tombstone revision of this document.
    pub fn delete_revision(&self) -> Self {
        let generation = self.generation() + 1;
        let fields = BTreeMap::new();
        let rev = compute_rev(generation, &self.id, &fields, true);
        Self {
            id: self.id.clone(),
            rev,
            deleted: true,
            fields,
        }
    }

    /// Revision generation (the numeric prefix of the revision id).
    pub fn generation(&self) -> u64 {
        self.rev
            .split('-')
            .next()
            .and_then(|g| g.parse().ok())
            .unwrap_or(0)
    }

    /// The `type` discriminator field, if present.
    pub fn doc_type(&self) -> Option<&str> {
        self.get_str("type")
    }

    /// The replication channel this document belongs to.
    pub fn channel(&self) -> &'static str {
        match self.doc_type() {
            Some(TYPE_USER) => USERS_CHANNEL,
            _ => EMERGENCY_CHANNEL,
        }
    }

    /// String field accessor.
    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(Value::as_str)
    }

    /// Integer field accessor.
    pub fn get_i64(&self, name: &str) -> Option<i64> {
        self.fields.get(name).and_then(Value::as_i64)
    }

    /// The domain timestamp used for gateway conflict comparison:
    /// `responded_at` if present, else `requested_at`, else `None`.
    ///
    /// A document with neither field is "infinitely stale" for resolution
    /// purposes; the resolver maps `None` to `i64::MAX` so it loses.
    pub fn effective_timestamp(&self) -> Option<i64> {
        self.get_i64("responded_at")
            .or_else(|| self.get_i64("requested_at"))
    }
}

/// Compute a revision id: `"{generation}-{hash8}"`.
///
/// The hash covers the id, the tombstone flag, and the serialized field map
/// (BTreeMap, so deterministic ordering).
fn compute_rev(generation: u64, id: &str, fields: &BTreeMap<String, Value>, deleted: bool) -> String {
    let mut hasher = Sha256::new();
    hasher.update(id.as_bytes());
    hasher.update([deleted as u8]);
    hasher.update(serde_json::to_vec(fields).unwrap_or_default());
    let digest = hasher.finalize();
    format!("{}-{}", generation, &hex::encode(digest)[..8])
}

/// Typed view over an emergency request document.
#[derive(Debug, Clone, PartialEq)]
pub struct EmergencyRequest {
    pub emergency_type: EmergencyType,
    pub city: String,
    pub status: RequestStatus,
    pub requested_by: String,
    /// Epoch millis when the request was raised.
    pub requested_at: i64,
    pub responded_by: Option<String>,
    /// Epoch millis when a responder accepted, if any.
    pub responded_at: Option<i64>,
}

impl EmergencyRequest {
    /// Build a new open request.
    pub fn new_open(
        emergency_type: EmergencyType,
        city: impl Into<String>,
        requested_by: impl Into<String>,
        requested_at: i64,
    ) -> Self {
        Self {
            emergency_type,
            city: city.into(),
            status: RequestStatus::Open,
            requested_by: requested_by.into(),
            requested_at,
            responded_by: None,
            responded_at: None,
        }
    }

    /// Project from a raw document. Returns `None` if the document is not an
    /// emergency request or required fields are missing.
    pub fn from_document(doc: &Document) -> Option<Self> {
        if doc.deleted || doc.doc_type() != Some(TYPE_EMERGENCY_REQUEST) {
            return None;
        }
        Some(Self {
            emergency_type: EmergencyType::parse(doc.get_str("emergency_type")?)?,
            city: doc.get_str("city")?.to_string(),
            status: RequestStatus::parse(doc.get_str("status")?)?,
            requested_by: doc.get_str("requested_by")?.to_string(),
            requested_at: doc.get_i64("requested_at")?,
            responded_by: doc.get_str("responded_by").map(str::to_string),
            responded_at: doc.get_i64("responded_at"),
        })
    }

    /// Lower into a raw field map for storage.
    pub fn into_fields(self) -> BTreeMap<String, Value> {
        let mut fields = BTreeMap::new();
        fields.insert("type".into(), Value::from(TYPE_EMERGENCY_REQUEST));
        fields.insert("emergency_type".into(), Value::from(self.emergency_type.as_str()));
        fields.insert("city".into(), Value::from(self.city));
        fields.insert("status".into(), Value::from(self.status.as_str()));
        fields.insert("requested_by".into(), Value::from(self.requested_by));
        fields.insert("requested_at".into(), Value::from(self.requested_at));
        if let Some(by) = self.responded_by {
            fields.insert("responded_by".into(), Value::from(by));
        }
        if let Some(at) = self.responded_at {
            fields.insert("responded_at".into(), Value::from(at));
        }
        fields
    }
}

/// Whether a responder is currently taking requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponderStatus {
    Active,
    Inactive,
}

impl ResponderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "inactive" => Some(Self::Inactive),
            _ => None,
        }
    }
}

/// Typed view over a responder profile document.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponderProfile {
    pub user_id: String,
    pub response_type: EmergencyType,
    pub status: ResponderStatus,
    pub latitude: f64,
    pub longitude: f64,
}

impl ResponderProfile {
    /// Project from a raw document.
    pub fn from_document(doc: &Document) -> Option<Self> {
        if doc.deleted || doc.doc_type() != Some(TYPE_USER) {
            return None;
        }
        Some(Self {
            user_id: doc.get_str("user_id")?.to_string(),
            response_type: EmergencyType::parse(doc.get_str("response_type")?)?,
            status: ResponderStatus::parse(doc.get_str("status")?)?,
            latitude: doc.fields.get("latitude").and_then(Value::as_f64)?,
            longitude: doc.fields.get("longitude").and_then(Value::as_f64)?,
        })
    }

    /// Lower into a raw field map for storage.
    pub fn into_fields(self) -> BTreeMap<String, Value> {
        let mut fields = BTreeMap::new();
        fields.insert("type".into(), Value::from(TYPE_USER));
        fields.insert("user_id".into(), Value::from(self.user_id));
        fields.insert("response_type".into(), Value::from(self.response_type.as_str()));
        fields.insert("status".into(), Value::from(self.status.as_str()));
        fields.insert("latitude".into(), Value::from(self.latitude));
        fields.insert("longitude".into(), Value::from(self.longitude));
        fields
    }
}
