//! Event-to-document materialization.
//!
//! The materializer converts one provenance event into the set of
//! materialized-view writes it implies: fresh documents for the event's own
//! event × object pairs, status rewrites for the sibling documents those
//! transitions supersede, and — for deletions — a purge of the object's
//! other documents.
//!
//! Derivation is split from application so the transition logic stays a pure
//! function: [`change_for`] computes a [`MaterializedChange`] without
//! touching the store, and [`Materializer::apply`] plays that change against
//! a [`MaterializedStore`].
//!
//! # Ordering and idempotence
//!
//! All events of a lineage arrive on one partition and are applied strictly
//! in log order by a single consumer, so no cross-writer coordination is
//! needed: the single-ACTIVE-per-lineage invariant is a consequence of the
//! transitions themselves. Every write is an upsert keyed by
//! `(object_uri, event_uri)`, so replaying any ordered suffix of a
//! lineage's history after an ungraceful restart converges to the same
//! final document set.

use crate::document::{Document, EventDirection, LogPosition, Status};
use crate::event::{EventKind, ProvenanceEvent};
use crate::store::{MaterializedStore, StoreError};
use chrono::Utc;
use std::sync::Arc;
use thiserror::Error;

/// Error type for materialization.
#[derive(Error, Debug)]
pub enum MaterializeError {
    /// The event's target type carries no lineage key.
    ///
    /// Fatal for the record, mirroring the partitioner: a keyless event on a
    /// lineage-ordered partition means the producer routed it incorrectly.
    #[error("Event {event_id} has no lineage key; cannot materialize")]
    MissingLineageKey {
        /// Identifier of the offending event.
        event_id: String,
    },

    /// A store operation failed; the owning record is not processed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Cleanup of an object's documents after a deletion event.
///
/// Every document of the object is removed except the deletion record
/// itself, which is retained for audit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PurgeObject {
    /// Object whose documents are purged.
    pub object_uri: String,
    /// Event URI of the deletion record to retain.
    pub retain_event_uri: String,
}

/// The full set of store writes one event implies.
#[derive(Clone, Debug, Default)]
pub struct MaterializedChange {
    /// Documents created (or overwritten) for this event's own pairs.
    pub documents: Vec<Document>,
    /// Objects whose existing documents move to a new status.
    pub restatus: Vec<(String, Status)>,
    /// Deletion cleanup, if this is a deletion event.
    pub purge: Option<PurgeObject>,
}

/// Compute the materialized change implied by one event.
///
/// Pure: depends only on the event and its log position.
///
/// # Errors
///
/// Returns [`MaterializeError::MissingLineageKey`] for events without a
/// lineage key.
pub fn change_for(
    event: &ProvenanceEvent,
    position: &LogPosition,
) -> Result<MaterializedChange, MaterializeError> {
    let lineage_key =
        event
            .lineage_key
            .as_deref()
            .ok_or_else(|| MaterializeError::MissingLineageKey {
                event_id: event.id.clone(),
            })?;

    let doc = |object_uri: &str, status: Status, direction: EventDirection| Document {
        object_uri: object_uri.to_string(),
        event_uri: event.id.clone(),
        lineage_key: lineage_key.to_string(),
        status,
        event_direction: direction,
        agent_uri: event.agent.clone(),
        log_topic: position.topic.clone(),
        log_partition: position.partition,
        log_offset: position.offset,
        last_updated: Utc::now(),
    };

    let change = match &event.kind {
        EventKind::Creation { created_object_ids } => MaterializedChange {
            documents: created_object_ids
                .iter()
                .map(|id| doc(id, Status::Active, EventDirection::Target))
                .collect(),
            ..MaterializedChange::default()
        },
        EventKind::Derivation {
            source_object_id,
            derived_object_id,
        } => MaterializedChange {
            documents: vec![
                doc(derived_object_id, Status::Active, EventDirection::Target),
                doc(source_object_id, Status::Inactive, EventDirection::Source),
            ],
            restatus: vec![(source_object_id.clone(), Status::Inactive)],
            purge: None,
        },
        EventKind::Inactivation { affected_object_id } => MaterializedChange {
            documents: vec![doc(affected_object_id, Status::Inactive, EventDirection::Target)],
            restatus: vec![(affected_object_id.clone(), Status::Inactive)],
            purge: None,
        },
        EventKind::Tombstone { affected_object_id } => MaterializedChange {
            documents: vec![doc(
                affected_object_id,
                Status::Tombstoned,
                EventDirection::Target,
            )],
            restatus: vec![(affected_object_id.clone(), Status::Tombstoned)],
            purge: None,
        },
        EventKind::Deletion { affected_object_id } => MaterializedChange {
            documents: vec![doc(
                affected_object_id,
                Status::Deleted,
                EventDirection::Target,
            )],
            restatus: Vec::new(),
            purge: Some(PurgeObject {
                object_uri: affected_object_id.clone(),
                retain_event_uri: event.id.clone(),
            }),
        },
    };

    Ok(change)
}

/// Applies events to the materialized store, one at a time, in log order.
pub struct Materializer<S> {
    store: Arc<S>,
}

impl<S> Materializer<S> {
    /// Create a materializer over a shared store handle.
    #[must_use]
    pub const fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// The store this materializer writes to.
    #[must_use]
    pub const fn store(&self) -> &Arc<S> {
        &self.store
    }
}

impl<S: MaterializedStore> Materializer<S> {
    /// Apply one event at the given log position.
    ///
    /// Upserts the event's own documents, then rewrites the status of
    /// superseded sibling documents, then performs deletion cleanup. The
    /// caller must not advance past the record until this returns `Ok`.
    ///
    /// # Errors
    ///
    /// Returns [`MaterializeError::MissingLineageKey`] for keyless events
    /// and [`MaterializeError::Store`] if any store operation fails.
    pub async fn apply(
        &self,
        event: &ProvenanceEvent,
        position: &LogPosition,
    ) -> Result<(), MaterializeError> {
        let change = change_for(event, position)?;

        for document in &change.documents {
            self.store.upsert(document).await?;
        }

        for (object_uri, status) in &change.restatus {
            let existing = self.store.documents_for_object(object_uri).await?;
            for mut document in existing {
                if document.status != *status {
                    document.status = *status;
                    self.store.upsert(&document).await?;
                }
            }
        }

        if let Some(purge) = &change.purge {
            let existing = self.store.documents_for_object(&purge.object_uri).await?;
            for document in existing {
                if document.event_uri != purge.retain_event_uri {
                    self.store
                        .delete(&document.object_uri, &document.event_uri)
                        .await?;
                }
            }
        }

        tracing::debug!(
            event_id = %event.id,
            kind = event.kind_name(),
            position = %position,
            documents = change.documents.len(),
            "Event materialized"
        );
        Ok(())
    }
}
