//! Provenance events describing the lifecycle of versioned objects.
//!
//! Events are immutable facts appended to a partitioned log. Every event
//! names the agent that caused it, the kind of object it affects and, for
//! versioned target types, the lineage (version chain) it belongs to. The
//! lineage key doubles as the partition-assignment key, which is what turns
//! the distributed ordering problem into a single-partition one.
//!
//! # Serialization
//!
//! Events are serialized with `bincode` on the wire: compact, fast, and
//! identical for every Rust producer and consumer of the log.
//!
//! # Example
//!
//! ```
//! use lineage_core::event::{EventKind, ProvenanceEvent, TargetType};
//! use chrono::Utc;
//!
//! let event = ProvenanceEvent {
//!     id: "event:1".to_string(),
//!     target_type: TargetType::Object,
//!     agent: "agent:alice".to_string(),
//!     lineage_key: Some("lineage-003164".to_string()),
//!     started_at: Utc::now(),
//!     ended_at: None,
//!     kind: EventKind::Creation {
//!         created_object_ids: vec!["obj:v1".to_string()],
//!     },
//! };
//! assert_eq!(event.kind_name(), "Creation.v1");
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error types for event wire encoding.
#[derive(Error, Debug)]
pub enum EventCodecError {
    /// Failed to serialize an event to bytes.
    #[error("Failed to serialize event: {0}")]
    Serialization(String),

    /// Failed to deserialize an event from bytes.
    #[error("Failed to deserialize event: {0}")]
    Deserialization(String),
}

/// The kind of object an event affects.
///
/// Versioned target types carry a lineage key; unversioned ones do not and
/// are outside the partitioner's contract.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TargetType {
    /// A versioned aggregate object. Events for these always carry a lineage key.
    Object,
    /// An agent record. Not versioned; no lineage key.
    Agent,
}

impl TargetType {
    /// Whether objects of this type form version lineages.
    #[must_use]
    pub const fn is_versioned(self) -> bool {
        matches!(self, Self::Object)
    }
}

/// Type-specific object references carried by each event kind.
///
/// Invariant: a `Derivation` names exactly one source and one derived
/// object, both sharing the event's lineage key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    /// One or more objects came into existence.
    Creation {
        /// URIs of the created objects.
        created_object_ids: Vec<String>,
    },
    /// A new version was derived from an existing one, superseding it.
    Derivation {
        /// URI of the version being superseded.
        source_object_id: String,
        /// URI of the newly derived version.
        derived_object_id: String,
    },
    /// A version was marked inactive without a successor.
    Inactivation {
        /// URI of the affected version.
        affected_object_id: String,
    },
    /// A version was withdrawn from current queries but remains addressable.
    Tombstone {
        /// URI of the affected version.
        affected_object_id: String,
    },
    /// A version was removed; only the deletion record itself is retained.
    Deletion {
        /// URI of the affected version.
        affected_object_id: String,
    },
}

/// An immutable provenance event.
///
/// The `id` is the stable identifier assigned by the upstream store and is
/// reused as the `event_uri` of every document materialized from this event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProvenanceEvent {
    /// Opaque stable event identifier.
    pub id: String,
    /// Kind of object affected.
    pub target_type: TargetType,
    /// URI of the agent associated with the event.
    pub agent: String,
    /// Version-chain identifier; present only for versioned target types.
    pub lineage_key: Option<String>,
    /// When the event began.
    pub started_at: DateTime<Utc>,
    /// When the event completed, if it has.
    pub ended_at: Option<DateTime<Utc>>,
    /// Type-specific object references.
    pub kind: EventKind,
}

impl ProvenanceEvent {
    /// Versioned event-type identifier, stable across schema evolution.
    #[must_use]
    pub const fn kind_name(&self) -> &'static str {
        match self.kind {
            EventKind::Creation { .. } => "Creation.v1",
            EventKind::Derivation { .. } => "Derivation.v1",
            EventKind::Inactivation { .. } => "Inactivation.v1",
            EventKind::Tombstone { .. } => "Tombstone.v1",
            EventKind::Deletion { .. } => "Deletion.v1",
        }
    }

    /// Serialize this event to bincode bytes for the log.
    ///
    /// # Errors
    ///
    /// Returns [`EventCodecError::Serialization`] if encoding fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>, EventCodecError> {
        bincode::serialize(self).map_err(|e| EventCodecError::Serialization(e.to_string()))
    }

    /// Deserialize an event from bincode bytes.
    ///
    /// # Errors
    ///
    /// Returns [`EventCodecError::Deserialization`] if the bytes are corrupt
    /// or were produced by an incompatible schema.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, EventCodecError> {
        bincode::deserialize(bytes).map_err(|e| EventCodecError::Deserialization(e.to_string()))
    }
}
