//! Materialized-view documents derived from provenance events.
//!
//! One [`Document`] exists per event × affected-object pair, keyed uniquely
//! by `(object_uri, event_uri)`. Re-applying the same event overwrites the
//! same document rather than duplicating it, which is what makes
//! at-least-once delivery safe downstream.
//!
//! The document also records where in the log its owning event sits
//! (`log_topic`, `log_partition`, `log_offset`). The per-partition maximum of
//! `log_offset` is the consumer's recovery checkpoint: the store itself is
//! the durability boundary, so there is no second offset ledger to drift out
//! of sync with it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Lifecycle status of one object version within its lineage.
///
/// Per lineage member the transitions are
/// `ACTIVE → INACTIVE → {TOMBSTONED | DELETED}`, with the direct
/// `ACTIVE → TOMBSTONED/DELETED` shortcut. Tombstoned and deleted are
/// terminal. Among the non-terminal documents of one lineage at most one
/// object is ACTIVE at any time; that property falls out of in-order
/// processing, not locking.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    /// The current version of its lineage.
    Active,
    /// Superseded by a later version, or explicitly inactivated.
    Inactive,
    /// Withdrawn from current queries; content remains addressable upstream.
    Tombstoned,
    /// Removed; only the deletion record is retained for audit.
    Deleted,
}

impl Status {
    /// Whether this status ends the object's lifecycle.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Tombstoned | Self::Deleted)
    }

    /// Stable wire string used by the materialized store.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Inactive => "INACTIVE",
            Self::Tombstoned => "TOMBSTONED",
            Self::Deleted => "DELETED",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing a status string from the store.
#[derive(Error, Debug)]
#[error("Unknown document status: {0}")]
pub struct ParseStatusError(String);

impl FromStr for Status {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ACTIVE" => Ok(Self::Active),
            "INACTIVE" => Ok(Self::Inactive),
            "TOMBSTONED" => Ok(Self::Tombstoned),
            "DELETED" => Ok(Self::Deleted),
            other => Err(ParseStatusError(other.to_string())),
        }
    }
}

/// Whether a document reflects its object as the event's primary target or
/// as a superseded source (the old version named by a derivation).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventDirection {
    /// The object is the event's primary target.
    Target,
    /// The object is the source a derivation superseded.
    Source,
}

impl EventDirection {
    /// Stable wire string used by the materialized store.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Target => "TARGET",
            Self::Source => "SOURCE",
        }
    }
}

impl FromStr for EventDirection {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "TARGET" => Ok(Self::Target),
            "SOURCE" => Ok(Self::Source),
            other => Err(ParseStatusError(other.to_string())),
        }
    }
}

/// A record's position within the partitioned log.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogPosition {
    /// Topic the record was read from.
    pub topic: String,
    /// Partition within the topic.
    pub partition: i32,
    /// Offset within the partition.
    pub offset: i64,
}

impl LogPosition {
    /// Create a new log position.
    #[must_use]
    pub fn new(topic: impl Into<String>, partition: i32, offset: i64) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset,
        }
    }
}

impl fmt::Display for LogPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]@{}", self.topic, self.partition, self.offset)
    }
}

/// One materialized-view record: an event's effect on one object.
///
/// Created by the materializer when its owning event is processed; never
/// deleted except by a deletion event's cleanup. After creation only
/// `status` changes, and only through later events in the same lineage.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// URI of the affected object version.
    pub object_uri: String,
    /// URI of the owning event.
    pub event_uri: String,
    /// Version-chain identifier shared by all sibling versions.
    pub lineage_key: String,
    /// Current lifecycle status of the object.
    pub status: Status,
    /// Whether the object was the event's target or a superseded source.
    pub event_direction: EventDirection,
    /// URI of the agent associated with the owning event.
    pub agent_uri: String,
    /// Topic the owning event was read from.
    pub log_topic: String,
    /// Partition of the owning event.
    pub log_partition: i32,
    /// Offset of the owning event within its partition.
    pub log_offset: i64,
    /// When this document was last written.
    pub last_updated: DateTime<Utc>,
}

impl Document {
    /// The unique key of this document in the materialized store.
    #[must_use]
    pub fn key(&self) -> (String, String) {
        (self.object_uri.clone(), self.event_uri.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_wire_roundtrip() {
        for status in [
            Status::Active,
            Status::Inactive,
            Status::Tombstoned,
            Status::Deleted,
        ] {
            #[allow(clippy::unwrap_used)]
            let parsed: Status = status.as_str().parse().unwrap();
            assert_eq!(parsed, status);
        }
    }

    #[test]
    fn unknown_status_is_rejected() {
        assert!("PENDING".parse::<Status>().is_err());
    }

    #[test]
    fn terminal_statuses() {
        assert!(!Status::Active.is_terminal());
        assert!(!Status::Inactive.is_terminal());
        assert!(Status::Tombstoned.is_terminal());
        assert!(Status::Deleted.is_terminal());
    }

    #[test]
    fn log_position_display() {
        let pos = LogPosition::new("provenance-events", 4, 1207);
        assert_eq!(pos.to_string(), "provenance-events[4]@1207");
    }
}
