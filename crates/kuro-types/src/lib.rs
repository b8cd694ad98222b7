use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Identity of a memory atom: re-observing the same triple always addresses
/// the same row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AtomKey {
    pub entity_id: String,
    /// Behavioral axis, e.g. `"trust"`.
    pub dimension: String,
    /// Opaque fingerprint of the observation circumstances.
    pub context_hash: String,
}

impl AtomKey {
    pub fn new(
        entity_id: impl Into<String>,
        dimension: impl Into<String>,
        context_hash: impl Into<String>,
    ) -> Self {
        Self {
            entity_id: entity_id.into(),
            dimension: dimension.into(),
            context_hash: context_hash.into(),
        }
    }
}

/// A single persisted weighted observation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Atom {
    pub key: AtomKey,
    /// Signed strength, saturating in `[-1.0, 1.0]`.
    pub magnitude: f64,
    /// Belief strength in `[0.0, 1.0]`, blended across updates.
    pub confidence: f64,
    /// Exponential decay constant in hours⁻¹, fixed at creation.
    pub decay_rate: f64,
    pub last_updated: DateTime<Utc>,
}

/// A named scalar behavioral bias.
///
/// Unlike [`Atom::magnitude`], `value` is additive and unbounded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Preference {
    pub key: String,
    pub value: f64,
    pub confidence: f64,
    pub updated_at: DateTime<Utc>,
}

/// One row of the per-dimension diagnostic report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DimensionStat {
    pub dimension: String,
    pub atom_count: u64,
    /// Sum of `|magnitude|` over every atom in the dimension.
    pub total_magnitude: f64,
}

// ─────────────────────────────────────────────────────────────────────────────
// Service payloads
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContextRequest {
    #[serde(default)]
    pub entities: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextResponse {
    pub memory_summaries: Vec<String>,
    pub preferences: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposeMemoryRequest {
    pub entity_id: String,
    pub dimension: String,
    pub delta: f64,
    pub context_hash: String,
    pub confidence: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdatePreferenceRequest {
    pub key: String,
    pub value: f64,
}

/// Outcome of a mutating call. Storage failures are reported here instead of
/// being raised to the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryStatus {
    pub success: bool,
    pub message: String,
}

impl MemoryStatus {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServingStatus {
    Serving,
    NotServing,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub service: String,
    pub status: ServingStatus,
    pub decay_running: bool,
}

/// A request on the newline-delimited JSON wire.
///
/// ```json
/// {"method": "ProposeMemory", "params": {"entity_id": "u1", ...}}
/// {"method": "Health"}
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", content = "params")]
pub enum Request {
    GetContext(ContextRequest),
    ProposeMemory(ProposeMemoryRequest),
    UpdatePreference(UpdatePreferenceRequest),
    Health,
}

/// One response line per [`Request`], in request order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum Response {
    Context(ContextResponse),
    Status(MemoryStatus),
    Health(HealthStatus),
    Error { message: String },
}

/// Error type shared across crate boundaries (service start-up, transport,
/// configuration).
#[derive(Error, Debug, Serialize, Deserialize)]
pub enum KuroError {
    #[error("Storage Error: {0}")]
    Storage(String),

    #[error("Transport Error: {0}")]
    Transport(String),

    #[error("Configuration Error: {0}")]
    Config(String),
}
