//! Contract with the external materialized store.
//!
//! The store is an external document database consumed through a narrow
//! read/write contract: idempotent upsert-by-key plus a handful of filtered,
//! sorted queries. Everything the indexing pipeline needs from it — including
//! crash recovery — is expressible through this trait.
//!
//! # Offsets live in the view
//!
//! There is no separate checkpoint table. The consumer's resume point for a
//! partition is derived with [`latest_applied_offset`]: the highest
//! `log_offset` among documents of that `(topic, partition)`. Anchoring
//! recovery to what is actually visible downstream removes the classic
//! commit/write race between a broker offset commit and the matching store
//! write.

use crate::document::{Document, Status};
use std::future::Future;
use thiserror::Error;

/// Error type for materialized-store operations.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The store is unreachable or rejected the request.
    #[error("Storage error: {0}")]
    Storage(String),

    /// A stored document could not be decoded into the document model.
    #[error("Malformed document in store: {0}")]
    Malformed(String),
}

/// Sort direction for offset-ordered queries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SortOrder {
    /// Lowest offset first.
    Ascending,
    /// Highest offset first.
    Descending,
}

/// The narrow contract the pipeline requires from the document store.
///
/// All writes are idempotent upserts keyed by `(object_uri, event_uri)`, so
/// concurrent writers (a rebuild job and the live consumer, say) converge to
/// the same state provided both observe the full ordered event history for
/// each lineage. No distributed lock or transaction is needed.
pub trait MaterializedStore: Send + Sync {
    /// Insert or overwrite the document with this key.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Storage`] if the write does not land. Callers
    /// must not treat the owning record as processed when this fails.
    fn upsert(&self, document: &Document) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Remove one document by key.
    ///
    /// Only the deletion-event cleanup path calls this; documents are never
    /// deleted otherwise.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Storage`] if the delete fails.
    fn delete(
        &self,
        object_uri: &str,
        event_uri: &str,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// All documents recorded for one object version.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Storage`] if the query fails.
    fn documents_for_object(
        &self,
        object_uri: &str,
    ) -> impl Future<Output = Result<Vec<Document>, StoreError>> + Send;

    /// Up to `limit` documents for `(topic, partition)` ordered by
    /// `log_offset`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Storage`] if the query fails. An empty result
    /// is `Ok(vec![])`, never an error.
    fn documents_for_partition(
        &self,
        topic: &str,
        partition: i32,
        order: SortOrder,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<Document>, StoreError>> + Send;

    /// Documents matching `(lineage_key, status)`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Storage`] if the query fails.
    fn documents_by_lineage_status(
        &self,
        lineage_key: &str,
        status: Status,
    ) -> impl Future<Output = Result<Vec<Document>, StoreError>> + Send;

    /// Documents matching a status across all lineages.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Storage`] if the query fails.
    fn documents_by_status(
        &self,
        status: Status,
    ) -> impl Future<Output = Result<Vec<Document>, StoreError>> + Send;
}

/// Highest log offset already reflected in the view for one partition.
///
/// Returns `None` for a partition with no documents yet — the caller then
/// falls back to its configured default seek. A store that answers with an
/// empty collection is treated the same as one with no matching documents.
///
/// # Errors
///
/// Returns [`StoreError`] only if the underlying query itself fails.
pub async fn latest_applied_offset<S: MaterializedStore>(
    store: &S,
    topic: &str,
    partition: i32,
) -> Result<Option<i64>, StoreError> {
    let top = store
        .documents_for_partition(topic, partition, SortOrder::Descending, 1)
        .await?;
    Ok(top.first().map(|doc| doc.log_offset))
}
