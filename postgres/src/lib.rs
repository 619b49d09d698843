//! `PostgreSQL` materialized store for the lineage index.
//!
//! Implements the pipeline's store contract over a single
//! `lineage_documents` table: idempotent upserts keyed by
//! `(object_uri, event_uri)` plus the filtered, sorted queries the indexer
//! and its recovery path need. Statuses and event directions are stored as
//! their stable wire strings so the table stays readable from `psql`.
//!
//! # Example
//!
//! ```ignore
//! use lineage_postgres::PostgresMaterializedStore;
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = PostgresMaterializedStore::new_with_url("postgres://localhost/lineage").await?;
//!     store.migrate().await?;
//!     Ok(())
//! }
//! ```

use lineage_core::document::{Document, EventDirection, Status};
use lineage_core::store::{MaterializedStore, SortOrder, StoreError};
use sqlx::postgres::{PgPool, PgPoolOptions};

/// Raw row shape of the `lineage_documents` table.
#[derive(sqlx::FromRow)]
struct DocumentRow {
    object_uri: String,
    event_uri: String,
    lineage_key: String,
    status: String,
    event_direction: String,
    agent_uri: String,
    log_topic: String,
    log_partition: i32,
    log_offset: i64,
    last_updated: chrono::DateTime<chrono::Utc>,
}

impl TryFrom<DocumentRow> for Document {
    type Error = StoreError;

    fn try_from(row: DocumentRow) -> Result<Self, Self::Error> {
        let status: Status = row
            .status
            .parse()
            .map_err(|e| StoreError::Malformed(format!("{}/{}: {e}", row.object_uri, row.event_uri)))?;
        let event_direction: EventDirection = row
            .event_direction
            .parse()
            .map_err(|e| StoreError::Malformed(format!("{}/{}: {e}", row.object_uri, row.event_uri)))?;

        Ok(Self {
            object_uri: row.object_uri,
            event_uri: row.event_uri,
            lineage_key: row.lineage_key,
            status,
            event_direction,
            agent_uri: row.agent_uri,
            log_topic: row.log_topic,
            log_partition: row.log_partition,
            log_offset: row.log_offset,
            last_updated: row.last_updated,
        })
    }
}

fn documents_from(rows: Vec<DocumentRow>) -> Result<Vec<Document>, StoreError> {
    rows.into_iter().map(Document::try_from).collect()
}

fn storage_error(context: &str) -> impl Fn(sqlx::Error) -> StoreError + '_ {
    move |e| StoreError::Storage(format!("{context}: {e}"))
}

/// PostgreSQL-backed implementation of the materialized-store contract.
#[derive(Clone)]
pub struct PostgresMaterializedStore {
    pool: PgPool,
}

impl PostgresMaterializedStore {
    /// Create a store over an existing connection pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create a store with its own connection pool.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Storage`] if the connection fails.
    pub async fn new_with_url(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(|e| StoreError::Storage(format!("Failed to connect: {e}")))?;
        Ok(Self::new(pool))
    }

    /// Run database migrations, creating the `lineage_documents` table and
    /// its indexes if they don't already exist.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Storage`] if migration fails.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Storage(format!("Migration failed: {e}")))?;
        tracing::info!("Lineage document migrations applied");
        Ok(())
    }

    /// The underlying connection pool, for custom queries.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }
}

impl MaterializedStore for PostgresMaterializedStore {
    async fn upsert(&self, document: &Document) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO lineage_documents
                 (object_uri, event_uri, lineage_key, status, event_direction,
                  agent_uri, log_topic, log_partition, log_offset, last_updated)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
             ON CONFLICT (object_uri, event_uri) DO UPDATE
             SET lineage_key = EXCLUDED.lineage_key,
                 status = EXCLUDED.status,
                 event_direction = EXCLUDED.event_direction,
                 agent_uri = EXCLUDED.agent_uri,
                 log_topic = EXCLUDED.log_topic,
                 log_partition = EXCLUDED.log_partition,
                 log_offset = EXCLUDED.log_offset,
                 last_updated = EXCLUDED.last_updated",
        )
        .bind(&document.object_uri)
        .bind(&document.event_uri)
        .bind(&document.lineage_key)
        .bind(document.status.as_str())
        .bind(document.event_direction.as_str())
        .bind(&document.agent_uri)
        .bind(&document.log_topic)
        .bind(document.log_partition)
        .bind(document.log_offset)
        .bind(document.last_updated)
        .execute(&self.pool)
        .await
        .map_err(storage_error("Failed to upsert document"))?;

        Ok(())
    }

    async fn delete(&self, object_uri: &str, event_uri: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM lineage_documents WHERE object_uri = $1 AND event_uri = $2")
            .bind(object_uri)
            .bind(event_uri)
            .execute(&self.pool)
            .await
            .map_err(storage_error("Failed to delete document"))?;

        Ok(())
    }

    async fn documents_for_object(&self, object_uri: &str) -> Result<Vec<Document>, StoreError> {
        let rows: Vec<DocumentRow> = sqlx::query_as(
            "SELECT * FROM lineage_documents
             WHERE object_uri = $1
             ORDER BY log_offset ASC",
        )
        .bind(object_uri)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_error("Failed to query by object"))?;

        documents_from(rows)
    }

    async fn documents_for_partition(
        &self,
        topic: &str,
        partition: i32,
        order: SortOrder,
        limit: usize,
    ) -> Result<Vec<Document>, StoreError> {
        // Sort direction cannot be bound as a parameter; both variants are
        // static strings.
        let query = match order {
            SortOrder::Ascending => {
                "SELECT * FROM lineage_documents
                 WHERE log_topic = $1 AND log_partition = $2
                 ORDER BY log_offset ASC
                 LIMIT $3"
            }
            SortOrder::Descending => {
                "SELECT * FROM lineage_documents
                 WHERE log_topic = $1 AND log_partition = $2
                 ORDER BY log_offset DESC
                 LIMIT $3"
            }
        };

        let rows: Vec<DocumentRow> = sqlx::query_as(query)
            .bind(topic)
            .bind(partition)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await
            .map_err(storage_error("Failed to query by partition"))?;

        documents_from(rows)
    }

    async fn documents_by_lineage_status(
        &self,
        lineage_key: &str,
        status: Status,
    ) -> Result<Vec<Document>, StoreError> {
        let rows: Vec<DocumentRow> = sqlx::query_as(
            "SELECT * FROM lineage_documents
             WHERE lineage_key = $1 AND status = $2
             ORDER BY log_offset ASC",
        )
        .bind(lineage_key)
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(storage_error("Failed to query by lineage and status"))?;

        documents_from(rows)
    }

    async fn documents_by_status(&self, status: Status) -> Result<Vec<Document>, StoreError> {
        let rows: Vec<DocumentRow> = sqlx::query_as(
            "SELECT * FROM lineage_documents
             WHERE status = $1
             ORDER BY log_topic, log_partition, log_offset ASC",
        )
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(storage_error("Failed to query by status"))?;

        documents_from(rows)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    // Integration tests against a real Postgres instance belong in a
    // deployment's test environment; these cover the row mapping.

    fn row(status: &str, direction: &str) -> DocumentRow {
        DocumentRow {
            object_uri: "obj:v1".to_string(),
            event_uri: "event:1".to_string(),
            lineage_key: "lineage-003164".to_string(),
            status: status.to_string(),
            event_direction: direction.to_string(),
            agent_uri: "agent:test".to_string(),
            log_topic: "provenance-events".to_string(),
            log_partition: 4,
            log_offset: 12,
            last_updated: chrono::Utc::now(),
        }
    }

    #[test]
    fn row_maps_to_document() {
        let doc = Document::try_from(row("ACTIVE", "TARGET")).unwrap();
        assert_eq!(doc.status, Status::Active);
        assert_eq!(doc.event_direction, EventDirection::Target);
        assert_eq!(doc.log_offset, 12);
    }

    #[test]
    fn unknown_status_is_malformed() {
        let result = Document::try_from(row("PENDING", "TARGET"));
        assert!(matches!(result, Err(StoreError::Malformed(_))));
    }

    #[test]
    fn unknown_direction_is_malformed() {
        let result = Document::try_from(row("ACTIVE", "SIDEWAYS"));
        assert!(matches!(result, Err(StoreError::Malformed(_))));
    }
}
