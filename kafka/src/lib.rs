//! Kafka transport for the lineage index.
//!
//! Two halves of the partitioned log:
//!
//! - [`producer::EventPublisher`] appends provenance events, assigning each
//!   to its lineage's partition with the shared hash and refusing keyless
//!   events and leaderless partitions.
//! - [`consumer::IndexingConsumer`] joins a consumer group, repositions
//!   assigned partitions from the materialized view's own checkpoints, and
//!   applies records in log order with idempotent writes.
//!
//! The rebalance protocol — view-derived resume points on assign, defensive
//! broker commits on revoke — lives in [`rebalance`] behind a mockable
//! trait.

pub mod consumer;
pub mod producer;
pub mod rebalance;

pub use consumer::{IndexError, IndexerConfig, IndexingConsumer};
pub use producer::{EventPublisher, PublishError};
pub use rebalance::{DefaultSeek, ResumeMode, SeekTarget};
