//! End-to-end materialization scenarios against the in-memory store.

#![allow(clippy::unwrap_used)]
#![allow(clippy::cast_possible_wrap)]

use lineage_core::document::{EventDirection, LogPosition, Status};
use lineage_core::materializer::Materializer;
use lineage_core::store::{MaterializedStore, SortOrder, latest_applied_offset};
use lineage_testing::InMemoryMaterializedStore;
use lineage_testing::events::{REFERENCE_LINEAGE, creation, deletion, derivation, tombstone};
use std::sync::Arc;

const TOPIC: &str = "provenance-events";
const PARTITION: i32 = 1;

fn pos(offset: i64) -> LogPosition {
    LogPosition::new(TOPIC, PARTITION, offset)
}

/// Everything that matters for state comparison; `last_updated` is wall
/// clock and deliberately excluded.
fn fingerprint(store: &InMemoryMaterializedStore) -> Vec<(String, String, Status, EventDirection, i64)> {
    store
        .snapshot()
        .into_iter()
        .map(|doc| {
            (
                doc.object_uri,
                doc.event_uri,
                doc.status,
                doc.event_direction,
                doc.log_offset,
            )
        })
        .collect()
}

async fn apply_lineage_history(
    materializer: &Materializer<InMemoryMaterializedStore>,
) -> Result<(), lineage_core::materializer::MaterializeError> {
    let history = [
        creation(REFERENCE_LINEAGE, 1, &["obj:v1"]),
        derivation(REFERENCE_LINEAGE, 2, "obj:v1", "obj:v2"),
        derivation(REFERENCE_LINEAGE, 3, "obj:v2", "obj:v3"),
        tombstone(REFERENCE_LINEAGE, 4, "obj:v2"),
    ];
    for (offset, event) in history.iter().enumerate() {
        materializer.apply(event, &pos(offset as i64)).await?;
    }
    Ok(())
}

#[tokio::test]
async fn lineage_scenario_derives_expected_statuses() {
    let store = InMemoryMaterializedStore::new();
    let materializer = Materializer::new(Arc::new(store.clone()));

    apply_lineage_history(&materializer).await.unwrap();

    // v1 was superseded by v2: every v1 document is INACTIVE.
    for doc in store.documents_for_object("obj:v1").await.unwrap() {
        assert_eq!(doc.status, Status::Inactive, "obj:v1 via {}", doc.event_uri);
    }

    // v2 was tombstoned: every v2 document is TOMBSTONED.
    let v2_docs = store.documents_for_object("obj:v2").await.unwrap();
    assert!(!v2_docs.is_empty());
    for doc in &v2_docs {
        assert_eq!(doc.status, Status::Tombstoned, "obj:v2 via {}", doc.event_uri);
    }

    // v3 is the lineage's single current version.
    let active = store
        .documents_by_lineage_status(REFERENCE_LINEAGE, Status::Active)
        .await
        .unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].object_uri, "obj:v3");
    assert_eq!(active[0].event_direction, EventDirection::Target);
}

#[tokio::test]
async fn replaying_full_history_is_idempotent() {
    let store = InMemoryMaterializedStore::new();
    let materializer = Materializer::new(Arc::new(store.clone()));

    apply_lineage_history(&materializer).await.unwrap();
    let first_pass = fingerprint(&store);

    // At-least-once delivery: the whole ordered sequence arrives again.
    apply_lineage_history(&materializer).await.unwrap();
    let second_pass = fingerprint(&store);

    assert_eq!(first_pass, second_pass);
}

#[tokio::test]
async fn deletion_purges_object_but_keeps_audit_record() {
    let store = InMemoryMaterializedStore::new();
    let materializer = Materializer::new(Arc::new(store.clone()));

    materializer
        .apply(&creation(REFERENCE_LINEAGE, 1, &["obj:v1"]), &pos(0))
        .await
        .unwrap();
    materializer
        .apply(
            &derivation(REFERENCE_LINEAGE, 2, "obj:v1", "obj:v2"),
            &pos(1),
        )
        .await
        .unwrap();
    materializer
        .apply(&deletion(REFERENCE_LINEAGE, 3, "obj:v2"), &pos(2))
        .await
        .unwrap();

    // Only the deletion record survives for the deleted object.
    let v2_docs = store.documents_for_object("obj:v2").await.unwrap();
    assert_eq!(v2_docs.len(), 1);
    assert_eq!(v2_docs[0].event_uri, "event:3");
    assert_eq!(v2_docs[0].status, Status::Deleted);

    // The superseded predecessor is untouched by the purge.
    let v1_docs = store.documents_for_object("obj:v1").await.unwrap();
    assert!(!v1_docs.is_empty());
    for doc in &v1_docs {
        assert_eq!(doc.status, Status::Inactive);
    }

    // Nothing in the lineage answers "current" any more.
    let active = store
        .documents_by_lineage_status(REFERENCE_LINEAGE, Status::Active)
        .await
        .unwrap();
    assert!(active.is_empty());
}

#[tokio::test]
async fn offset_lookup_round_trip() {
    let store = InMemoryMaterializedStore::new();
    let materializer = Materializer::new(Arc::new(store.clone()));

    for offset in [5, 12, 7] {
        let event = creation(REFERENCE_LINEAGE, u32::try_from(offset).unwrap(), &["obj:v1"]);
        materializer.apply(&event, &pos(offset)).await.unwrap();
    }

    assert_eq!(
        latest_applied_offset(&store, TOPIC, PARTITION).await.unwrap(),
        Some(12)
    );

    // A partition with no documents yields no checkpoint, not an error.
    assert_eq!(
        latest_applied_offset(&store, TOPIC, PARTITION + 1)
            .await
            .unwrap(),
        None
    );
    assert_eq!(
        latest_applied_offset(&store, "other-topic", PARTITION)
            .await
            .unwrap(),
        None
    );
}

#[tokio::test]
async fn partition_query_orders_by_offset() {
    let store = InMemoryMaterializedStore::new();
    let materializer = Materializer::new(Arc::new(store.clone()));

    for offset in [5, 12, 7] {
        let event = creation(REFERENCE_LINEAGE, u32::try_from(offset).unwrap(), &["obj:v1"]);
        materializer.apply(&event, &pos(offset)).await.unwrap();
    }

    let ascending = store
        .documents_for_partition(TOPIC, PARTITION, SortOrder::Ascending, 10)
        .await
        .unwrap();
    let offsets: Vec<i64> = ascending.iter().map(|doc| doc.log_offset).collect();
    assert_eq!(offsets, vec![5, 7, 12]);

    let top = store
        .documents_for_partition(TOPIC, PARTITION, SortOrder::Descending, 1)
        .await
        .unwrap();
    assert_eq!(top.len(), 1);
    assert_eq!(top[0].log_offset, 12);
}
