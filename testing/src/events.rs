//! Event fixtures for lineage tests.
//!
//! Each builder produces a well-formed [`ProvenanceEvent`] for a versioned
//! object, with the event id derived from a counter the test controls so
//! scenarios stay readable: `creation("lin", 1, &["obj:v1"])` is event
//! `event:1` of lineage `lin`.

use chrono::Utc;
use lineage_core::event::{EventKind, ProvenanceEvent, TargetType};

/// The lineage key whose partition assignments are pinned by the
/// partitioner's reference table.
pub const REFERENCE_LINEAGE: &str = "lineage-003164";

fn base(lineage: &str, seq: u32, kind: EventKind) -> ProvenanceEvent {
    ProvenanceEvent {
        id: format!("event:{seq}"),
        target_type: TargetType::Object,
        agent: "agent:test".to_string(),
        lineage_key: Some(lineage.to_string()),
        started_at: Utc::now(),
        ended_at: Some(Utc::now()),
        kind,
    }
}

/// A creation event for the given objects.
#[must_use]
pub fn creation(lineage: &str, seq: u32, created: &[&str]) -> ProvenanceEvent {
    base(
        lineage,
        seq,
        EventKind::Creation {
            created_object_ids: created.iter().map(ToString::to_string).collect(),
        },
    )
}

/// A derivation event superseding `source` with `derived`.
#[must_use]
pub fn derivation(lineage: &str, seq: u32, source: &str, derived: &str) -> ProvenanceEvent {
    base(
        lineage,
        seq,
        EventKind::Derivation {
            source_object_id: source.to_string(),
            derived_object_id: derived.to_string(),
        },
    )
}

/// An inactivation event for one object version.
#[must_use]
pub fn inactivation(lineage: &str, seq: u32, affected: &str) -> ProvenanceEvent {
    base(
        lineage,
        seq,
        EventKind::Inactivation {
            affected_object_id: affected.to_string(),
        },
    )
}

/// A tombstone event for one object version.
#[must_use]
pub fn tombstone(lineage: &str, seq: u32, affected: &str) -> ProvenanceEvent {
    base(
        lineage,
        seq,
        EventKind::Tombstone {
            affected_object_id: affected.to_string(),
        },
    )
}

/// A deletion event for one object version.
#[must_use]
pub fn deletion(lineage: &str, seq: u32, affected: &str) -> ProvenanceEvent {
    base(
        lineage,
        seq,
        EventKind::Deletion {
            affected_object_id: affected.to_string(),
        },
    )
}
