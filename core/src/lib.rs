//! # Lineage Core
//!
//! Core types and logic for the lineage indexing pipeline: the provenance
//! event model, the deterministic lineage partitioner, the materialized-view
//! document model, the narrow store contract and the event-to-document
//! materializer.
//!
//! ## Pipeline shape
//!
//! ```text
//! producer ──partition_for_event──▶ partitioned log
//!                                        │ poll, in partition order
//!                                        ▼
//!                                  Materializer ──upsert──▶ MaterializedStore
//!                                        ▲
//!                  recovery: latest_applied_offset(topic, partition)
//! ```
//!
//! The lineage key pins every event of a version chain to one partition, so
//! one consumer sees the chain in log order and the status state machine
//! needs no cross-writer coordination. Recovery reads the resume point back
//! out of the materialized view itself rather than trusting the broker's
//! offset store alone.

// Re-export commonly used types
pub use chrono::{DateTime, Utc};

pub mod document;
pub mod event;
pub mod materializer;
pub mod partitioner;
pub mod store;

pub use document::{Document, EventDirection, LogPosition, Status};
pub use event::{EventKind, ProvenanceEvent, TargetType};
pub use materializer::{MaterializeError, Materializer, change_for};
pub use partitioner::{PartitionError, partition_for_event, partition_for_key};
pub use store::{MaterializedStore, SortOrder, StoreError, latest_applied_offset};
