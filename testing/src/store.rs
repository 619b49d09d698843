//! In-memory materialized store for fast, deterministic tests.

use lineage_core::document::{Document, Status};
use lineage_core::store::{MaterializedStore, SortOrder, StoreError};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// `HashMap`-backed implementation of the full store contract.
///
/// Behaves like the production document store under the same narrow
/// contract: upserts keyed by `(object_uri, event_uri)`, offset-sorted
/// partition queries and status filters. Cloning shares the underlying map,
/// so a clone handed to a materializer can be inspected by the test.
///
/// # Example
///
/// ```
/// use lineage_testing::InMemoryMaterializedStore;
/// use lineage_core::store::{MaterializedStore, latest_applied_offset};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store = InMemoryMaterializedStore::new();
/// assert_eq!(latest_applied_offset(&store, "events", 0).await?, None);
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug, Default)]
pub struct InMemoryMaterializedStore {
    documents: Arc<RwLock<HashMap<(String, String), Document>>>,
}

impl InMemoryMaterializedStore {
    /// Create a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored documents.
    #[must_use]
    pub fn len(&self) -> usize {
        self.documents.read().unwrap().len()
    }

    /// Whether the store holds no documents.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.documents.read().unwrap().is_empty()
    }

    /// Remove every document (for test isolation).
    pub fn clear(&self) {
        self.documents.write().unwrap().clear();
    }

    /// Snapshot of all documents, ordered by `(object_uri, event_uri)`.
    ///
    /// Useful for whole-state assertions such as replay-idempotence checks.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Document> {
        let mut docs: Vec<Document> = self.documents.read().unwrap().values().cloned().collect();
        docs.sort_by(|a, b| a.key().cmp(&b.key()));
        docs
    }

    /// One document by key, if present.
    #[must_use]
    pub fn get(&self, object_uri: &str, event_uri: &str) -> Option<Document> {
        self.documents
            .read()
            .unwrap()
            .get(&(object_uri.to_string(), event_uri.to_string()))
            .cloned()
    }
}

impl MaterializedStore for InMemoryMaterializedStore {
    async fn upsert(&self, document: &Document) -> Result<(), StoreError> {
        self.documents
            .write()
            .unwrap()
            .insert(document.key(), document.clone());
        Ok(())
    }

    async fn delete(&self, object_uri: &str, event_uri: &str) -> Result<(), StoreError> {
        self.documents
            .write()
            .unwrap()
            .remove(&(object_uri.to_string(), event_uri.to_string()));
        Ok(())
    }

    async fn documents_for_object(&self, object_uri: &str) -> Result<Vec<Document>, StoreError> {
        Ok(self
            .documents
            .read()
            .unwrap()
            .values()
            .filter(|doc| doc.object_uri == object_uri)
            .cloned()
            .collect())
    }

    async fn documents_for_partition(
        &self,
        topic: &str,
        partition: i32,
        order: SortOrder,
        limit: usize,
    ) -> Result<Vec<Document>, StoreError> {
        let mut docs: Vec<Document> = self
            .documents
            .read()
            .unwrap()
            .values()
            .filter(|doc| doc.log_topic == topic && doc.log_partition == partition)
            .cloned()
            .collect();
        match order {
            SortOrder::Ascending => docs.sort_by_key(|doc| doc.log_offset),
            SortOrder::Descending => docs.sort_by_key(|doc| std::cmp::Reverse(doc.log_offset)),
        }
        docs.truncate(limit);
        Ok(docs)
    }

    async fn documents_by_lineage_status(
        &self,
        lineage_key: &str,
        status: Status,
    ) -> Result<Vec<Document>, StoreError> {
        Ok(self
            .documents
            .read()
            .unwrap()
            .values()
            .filter(|doc| doc.lineage_key == lineage_key && doc.status == status)
            .cloned()
            .collect())
    }

    async fn documents_by_status(&self, status: Status) -> Result<Vec<Document>, StoreError> {
        Ok(self
            .documents
            .read()
            .unwrap()
            .values()
            .filter(|doc| doc.status == status)
            .cloned()
            .collect())
    }
}
