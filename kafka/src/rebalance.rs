//! Consumer-group rebalance coordination.
//!
//! Two callbacks fire on the polling thread whenever group membership
//! changes, with processing fully paused for the duration:
//!
//! - **revoke**: the consumer's current position for each revoked partition
//!   is committed to the broker's native offset store. This is a defensive
//!   secondary checkpoint only — it is never the authority used for
//!   recovery, and a failed commit costs at most some reprocessing.
//! - **assign**: for each assigned partition the resume point is derived
//!   from the materialized view itself ([`latest_applied_offset`]) and the
//!   consumer is repositioned with exactly one seek before polling resumes.
//!
//! Anchoring recovery to what is actually visible downstream — instead of
//! the broker's committed offsets — removes the commit/write race that
//! silently loses updates when a crash lands between the two operations.
//!
//! The seek/commit mechanics live behind the [`ConsumerOps`] trait so the
//! contracts can be exercised against a mock without a broker; the rdkafka
//! wiring is [`IndexingContext`], which bridges the synchronous callbacks to
//! the async store through a captured runtime handle.

use lineage_core::store::{MaterializedStore, StoreError, latest_applied_offset};
use rdkafka::ClientContext;
use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer, ConsumerContext, Rebalance};
use rdkafka::topic_partition_list::{Offset, TopicPartitionList};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::runtime::Handle;

/// Where a partition starts when the materialized view holds no checkpoint
/// for it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DefaultSeek {
    /// Start at the partition's oldest record.
    Earliest,
    /// Start at the partition's end (only new records).
    Latest,
}

/// How assigned partitions are repositioned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResumeMode {
    /// Normal operation: resume after the last offset reflected in the
    /// materialized view, falling back to the default seek when the view
    /// holds nothing for the partition.
    FromView(DefaultSeek),
    /// Full rebuild: ignore any prior checkpoint and start every partition
    /// at its oldest record.
    Rebuild,
}

/// The single repositioning applied to one assigned partition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SeekTarget {
    /// Seek to `checkpoint + 1`: strictly after the last record durably
    /// reflected in the view. No gap, minimal reprocessing.
    After(i64),
    /// Seek to the partition's start.
    Beginning,
    /// Seek to the partition's end.
    End,
}

/// Derive the seek target for one partition from its view checkpoint.
#[must_use]
pub const fn resume_target(checkpoint: Option<i64>, mode: ResumeMode) -> SeekTarget {
    match mode {
        ResumeMode::Rebuild => SeekTarget::Beginning,
        ResumeMode::FromView(default_seek) => match checkpoint {
            Some(offset) => SeekTarget::After(offset),
            None => match default_seek {
                DefaultSeek::Earliest => SeekTarget::Beginning,
                DefaultSeek::Latest => SeekTarget::End,
            },
        },
    }
}

/// A defensive broker-side checkpoint for one revoked partition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartitionCheckpoint {
    /// Topic of the revoked partition.
    pub topic: String,
    /// Partition id.
    pub partition: i32,
    /// The consumer's next-offset-to-read at revoke time.
    pub offset: i64,
    /// Provenance tag recorded alongside the commit.
    pub metadata: String,
}

/// Error type for rebalance-time repositioning and checkpointing.
#[derive(Error, Debug)]
pub enum RebalanceError {
    /// A seek call was rejected by the client.
    #[error("Seek failed for {topic}[{partition}]: {reason}")]
    Seek {
        /// Topic of the partition being repositioned.
        topic: String,
        /// Partition id.
        partition: i32,
        /// Client-reported reason.
        reason: String,
    },

    /// The consumer's position could not be read.
    #[error("Position read failed for {topic}[{partition}]: {reason}")]
    Position {
        /// Topic of the partition.
        topic: String,
        /// Partition id.
        partition: i32,
        /// Client-reported reason.
        reason: String,
    },

    /// The defensive broker commit failed.
    #[error("Offset commit failed: {0}")]
    Commit(String),

    /// The materialized view could not answer the checkpoint query.
    #[error("Checkpoint lookup failed: {0}")]
    Lookup(#[from] StoreError),

    /// Shutdown was requested while waiting for the view to come back.
    #[error("Repositioning cancelled by shutdown")]
    Cancelled,
}

/// The consumer operations rebalance handling needs.
///
/// Implemented for `BaseConsumer<IndexingContext<S>>` in production and by a
/// recording mock in tests.
pub trait ConsumerOps {
    /// Reposition one partition. Exactly one call per assigned partition.
    ///
    /// # Errors
    ///
    /// Returns [`RebalanceError::Seek`] if the client rejects the seek.
    fn seek_partition(
        &self,
        topic: &str,
        partition: i32,
        target: SeekTarget,
    ) -> Result<(), RebalanceError>;

    /// The consumer's next-offset-to-read for one partition, if known.
    ///
    /// # Errors
    ///
    /// Returns [`RebalanceError::Position`] if the position query fails.
    fn position_of(&self, topic: &str, partition: i32) -> Result<Option<i64>, RebalanceError>;

    /// Commit defensive checkpoints to the broker's offset store.
    ///
    /// # Errors
    ///
    /// Returns [`RebalanceError::Commit`] if the broker rejects the commit.
    fn commit_checkpoints(&self, checkpoints: &[PartitionCheckpoint]) -> Result<(), RebalanceError>;
}

const LOOKUP_RETRY_INITIAL: Duration = Duration::from_millis(500);
const LOOKUP_RETRY_MAX: Duration = Duration::from_secs(5);

/// Reposition every assigned partition before polling resumes.
///
/// Per partition: one checkpoint lookup against the materialized view
/// (skipped in rebuild mode), exactly one seek, then a position read to log
/// the landing point. A view that is temporarily unavailable stalls the
/// rebalance with backoff rather than guessing a resume point.
///
/// # Errors
///
/// Returns [`RebalanceError`] if a seek or position read fails, or if
/// shutdown is requested while the view is unavailable.
pub fn handle_assigned<O, L>(
    ops: &O,
    lookup: L,
    mode: ResumeMode,
    partitions: &[(String, i32)],
    cancelled: &AtomicBool,
) -> Result<(), RebalanceError>
where
    O: ConsumerOps,
    L: Fn(&str, i32) -> Result<Option<i64>, StoreError>,
{
    for (topic, partition) in partitions {
        let checkpoint = match mode {
            ResumeMode::Rebuild => None,
            ResumeMode::FromView(_) => {
                lookup_with_backoff(&lookup, topic, *partition, cancelled)?
            }
        };

        let target = resume_target(checkpoint, mode);
        ops.seek_partition(topic, *partition, target)?;
        let position = ops.position_of(topic, *partition)?;

        tracing::info!(
            topic = %topic,
            partition = partition,
            checkpoint = ?checkpoint,
            target = ?target,
            position = ?position,
            "Partition repositioned"
        );
    }
    Ok(())
}

fn lookup_with_backoff<L>(
    lookup: &L,
    topic: &str,
    partition: i32,
    cancelled: &AtomicBool,
) -> Result<Option<i64>, RebalanceError>
where
    L: Fn(&str, i32) -> Result<Option<i64>, StoreError>,
{
    let mut backoff = LOOKUP_RETRY_INITIAL;
    loop {
        match lookup(topic, partition) {
            Ok(checkpoint) => return Ok(checkpoint),
            Err(error) => {
                if cancelled.load(Ordering::Relaxed) {
                    return Err(RebalanceError::Cancelled);
                }
                tracing::warn!(
                    topic = %topic,
                    partition = partition,
                    error = %error,
                    backoff_ms = backoff.as_millis() as u64,
                    "Materialized view unavailable during recovery, stalling"
                );
                std::thread::sleep(backoff);
                backoff = (backoff * 2).min(LOOKUP_RETRY_MAX);
            }
        }
    }
}

/// Checkpoint every revoked partition to the broker before giving it up.
///
/// Reads the consumer's current position per partition and commits it with
/// a metadata tag. Failures are logged and swallowed: the broker commit is
/// a secondary safety net, and losing it costs at most extra reprocessing
/// by the next owner — never data, since downstream writes are idempotent.
pub fn handle_revoked<O: ConsumerOps>(ops: &O, partitions: &[(String, i32)]) {
    let mut checkpoints = Vec::with_capacity(partitions.len());
    for (topic, partition) in partitions {
        match ops.position_of(topic, *partition) {
            Ok(Some(offset)) => checkpoints.push(PartitionCheckpoint {
                topic: topic.clone(),
                partition: *partition,
                offset,
                metadata: format!("lineage-index revoke checkpoint @{offset}"),
            }),
            Ok(None) => {
                tracing::debug!(
                    topic = %topic,
                    partition = partition,
                    "No position yet for revoked partition, nothing to commit"
                );
            }
            Err(error) => {
                tracing::warn!(
                    topic = %topic,
                    partition = partition,
                    error = %error,
                    "Could not read position for revoked partition"
                );
            }
        }
    }

    if checkpoints.is_empty() {
        return;
    }

    if let Err(error) = ops.commit_checkpoints(&checkpoints) {
        tracing::warn!(
            error = %error,
            partitions = checkpoints.len(),
            "Defensive offset commit failed (next owner may reprocess)"
        );
    } else {
        tracing::info!(
            partitions = checkpoints.len(),
            "Defensive offsets committed for revoked partitions"
        );
    }
}

/// rdkafka consumer context that runs the rebalance protocol on the polling
/// thread.
///
/// Holds a runtime handle so the synchronous callbacks can drive the async
/// store lookup; the consumer's poll loop runs on a dedicated blocking
/// thread, so blocking here is safe.
pub struct IndexingContext<S> {
    store: Arc<S>,
    runtime: Handle,
    mode: ResumeMode,
    cancelled: Arc<AtomicBool>,
    failure: Arc<Mutex<Option<RebalanceError>>>,
}

impl<S> IndexingContext<S> {
    /// Create a context over the recovery store.
    #[must_use]
    pub fn new(store: Arc<S>, runtime: Handle, mode: ResumeMode) -> Self {
        Self {
            store,
            runtime,
            mode,
            cancelled: Arc::new(AtomicBool::new(false)),
            failure: Arc::new(Mutex::new(None)),
        }
    }

    /// Flag checked by in-progress recovery stalls; set on shutdown.
    #[must_use]
    pub fn cancellation_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }

    /// Slot holding a repositioning failure for the poll loop to surface.
    #[must_use]
    pub fn failure_slot(&self) -> Arc<Mutex<Option<RebalanceError>>> {
        Arc::clone(&self.failure)
    }

    fn record_failure(&self, error: RebalanceError) {
        tracing::error!(error = %error, "Partition repositioning failed");
        *self
            .failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(error);
    }
}

fn partitions_of(tpl: &TopicPartitionList) -> Vec<(String, i32)> {
    tpl.elements()
        .iter()
        .map(|elem| (elem.topic().to_string(), elem.partition()))
        .collect()
}

impl<S: MaterializedStore + 'static> ClientContext for IndexingContext<S> {}

impl<S: MaterializedStore + 'static> ConsumerContext for IndexingContext<S> {
    fn pre_rebalance(&self, consumer: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        if let Rebalance::Revoke(tpl) = rebalance {
            let partitions = partitions_of(tpl);
            tracing::info!(partitions = partitions.len(), "Partitions being revoked");
            handle_revoked(consumer, &partitions);
        }
    }

    fn post_rebalance(&self, consumer: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        match rebalance {
            Rebalance::Assign(tpl) => {
                let partitions = partitions_of(tpl);
                tracing::info!(partitions = partitions.len(), "Partitions assigned");
                let lookup = |topic: &str, partition: i32| {
                    self.runtime
                        .block_on(latest_applied_offset(&*self.store, topic, partition))
                };
                if let Err(error) =
                    handle_assigned(consumer, lookup, self.mode, &partitions, &self.cancelled)
                {
                    self.record_failure(error);
                }
            }
            Rebalance::Revoke(_) => {}
            Rebalance::Error(error) => {
                tracing::warn!(error = %error, "Rebalance protocol error");
            }
        }
    }
}

impl<S: MaterializedStore + 'static> ConsumerOps for BaseConsumer<IndexingContext<S>> {
    fn seek_partition(
        &self,
        topic: &str,
        partition: i32,
        target: SeekTarget,
    ) -> Result<(), RebalanceError> {
        let offset = match target {
            SeekTarget::After(checkpoint) => Offset::Offset(checkpoint + 1),
            SeekTarget::Beginning => Offset::Beginning,
            SeekTarget::End => Offset::End,
        };
        self.seek(topic, partition, offset, Duration::from_secs(5))
            .map_err(|e| RebalanceError::Seek {
                topic: topic.to_string(),
                partition,
                reason: e.to_string(),
            })
    }

    fn position_of(&self, topic: &str, partition: i32) -> Result<Option<i64>, RebalanceError> {
        let positions = self.position().map_err(|e| RebalanceError::Position {
            topic: topic.to_string(),
            partition,
            reason: e.to_string(),
        })?;
        Ok(positions
            .find_partition(topic, partition)
            .and_then(|elem| match elem.offset() {
                Offset::Offset(offset) => Some(offset),
                _ => None,
            }))
    }

    fn commit_checkpoints(&self, checkpoints: &[PartitionCheckpoint]) -> Result<(), RebalanceError> {
        let mut tpl = TopicPartitionList::new();
        for checkpoint in checkpoints {
            tpl.add_partition_offset(
                &checkpoint.topic,
                checkpoint.partition,
                Offset::Offset(checkpoint.offset),
            )
            .map_err(|e| RebalanceError::Commit(e.to_string()))?;
        }
        self.commit(&tpl, CommitMode::Sync)
            .map_err(|e| RebalanceError::Commit(e.to_string()))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Records every call so the seek/commit contracts can be asserted.
    #[derive(Default)]
    struct MockOps {
        positions: Mutex<std::collections::HashMap<(String, i32), i64>>,
        seeks: Mutex<Vec<(String, i32, SeekTarget)>>,
        position_reads: Mutex<Vec<(String, i32)>>,
        commits: Mutex<Vec<Vec<PartitionCheckpoint>>>,
    }

    impl MockOps {
        fn with_position(self, topic: &str, partition: i32, offset: i64) -> Self {
            self.positions
                .lock()
                .unwrap()
                .insert((topic.to_string(), partition), offset);
            self
        }
    }

    impl ConsumerOps for MockOps {
        fn seek_partition(
            &self,
            topic: &str,
            partition: i32,
            target: SeekTarget,
        ) -> Result<(), RebalanceError> {
            self.seeks
                .lock()
                .unwrap()
                .push((topic.to_string(), partition, target));
            // Seeking establishes the position a subsequent read observes.
            let position = match target {
                SeekTarget::After(checkpoint) => checkpoint + 1,
                SeekTarget::Beginning => 0,
                SeekTarget::End => 1_000_000,
            };
            self.positions
                .lock()
                .unwrap()
                .insert((topic.to_string(), partition), position);
            Ok(())
        }

        fn position_of(
            &self,
            topic: &str,
            partition: i32,
        ) -> Result<Option<i64>, RebalanceError> {
            self.position_reads
                .lock()
                .unwrap()
                .push((topic.to_string(), partition));
            Ok(self
                .positions
                .lock()
                .unwrap()
                .get(&(topic.to_string(), partition))
                .copied())
        }

        fn commit_checkpoints(
            &self,
            checkpoints: &[PartitionCheckpoint],
        ) -> Result<(), RebalanceError> {
            self.commits.lock().unwrap().push(checkpoints.to_vec());
            Ok(())
        }
    }

    fn no_cancel() -> AtomicBool {
        AtomicBool::new(false)
    }

    #[test]
    fn resume_target_prefers_view_checkpoint() {
        let mode = ResumeMode::FromView(DefaultSeek::Latest);
        assert_eq!(resume_target(Some(12), mode), SeekTarget::After(12));
        assert_eq!(resume_target(None, mode), SeekTarget::End);
        assert_eq!(
            resume_target(None, ResumeMode::FromView(DefaultSeek::Earliest)),
            SeekTarget::Beginning
        );
        // Rebuild ignores any checkpoint.
        assert_eq!(
            resume_target(Some(12), ResumeMode::Rebuild),
            SeekTarget::Beginning
        );
    }

    #[test]
    fn assign_with_checkpoint_seeks_exactly_once_past_it() {
        let ops = MockOps::default();
        let partitions = vec![("events".to_string(), 4)];
        let cancelled = no_cancel();

        handle_assigned(
            &ops,
            |_, _| Ok(Some(12)),
            ResumeMode::FromView(DefaultSeek::Earliest),
            &partitions,
            &cancelled,
        )
        .unwrap();

        let seeks = ops.seeks.lock().unwrap().clone();
        assert_eq!(seeks, vec![("events".to_string(), 4, SeekTarget::After(12))]);

        // A position read follows the seek.
        let reads = ops.position_reads.lock().unwrap().clone();
        assert_eq!(reads, vec![("events".to_string(), 4)]);
    }

    #[test]
    fn assign_without_checkpoint_uses_default_seek() {
        for (default_seek, expected) in [
            (DefaultSeek::Earliest, SeekTarget::Beginning),
            (DefaultSeek::Latest, SeekTarget::End),
        ] {
            let ops = MockOps::default();
            let partitions = vec![("events".to_string(), 0)];
            let cancelled = no_cancel();

            handle_assigned(
                &ops,
                |_, _| Ok(None),
                ResumeMode::FromView(default_seek),
                &partitions,
                &cancelled,
            )
            .unwrap();

            let seeks = ops.seeks.lock().unwrap().clone();
            assert_eq!(seeks, vec![("events".to_string(), 0, expected)]);
        }
    }

    #[test]
    fn rebuild_mode_never_consults_the_view() {
        let ops = MockOps::default();
        let partitions = vec![("events".to_string(), 2), ("events".to_string(), 5)];
        let cancelled = no_cancel();

        handle_assigned(
            &ops,
            |_, _| -> Result<Option<i64>, StoreError> {
                Err(StoreError::Storage("lookup must not run".to_string()))
            },
            ResumeMode::Rebuild,
            &partitions,
            &cancelled,
        )
        .unwrap();

        let seeks = ops.seeks.lock().unwrap().clone();
        assert_eq!(
            seeks,
            vec![
                ("events".to_string(), 2, SeekTarget::Beginning),
                ("events".to_string(), 5, SeekTarget::Beginning),
            ]
        );
    }

    #[test]
    fn assign_stall_aborts_on_cancellation() {
        let ops = MockOps::default();
        let partitions = vec![("events".to_string(), 0)];
        let cancelled = AtomicBool::new(true);

        let result = handle_assigned(
            &ops,
            |_, _| -> Result<Option<i64>, StoreError> {
                Err(StoreError::Storage("view down".to_string()))
            },
            ResumeMode::FromView(DefaultSeek::Earliest),
            &partitions,
            &cancelled,
        );

        assert!(matches!(result, Err(RebalanceError::Cancelled)));
        assert!(ops.seeks.lock().unwrap().is_empty());
    }

    #[test]
    fn revoke_commits_current_position_with_metadata() {
        let ops = MockOps::default()
            .with_position("events", 3, 42)
            .with_position("events", 7, 1207);
        let partitions = vec![("events".to_string(), 3), ("events".to_string(), 7)];

        handle_revoked(&ops, &partitions);

        let commits = ops.commits.lock().unwrap().clone();
        assert_eq!(commits.len(), 1);
        let checkpoints = &commits[0];
        assert_eq!(checkpoints.len(), 2);
        assert_eq!(checkpoints[0].offset, 42);
        assert_eq!(checkpoints[1].offset, 1207);
        for checkpoint in checkpoints {
            assert!(checkpoint.metadata.contains(&checkpoint.offset.to_string()));
        }
    }

    #[test]
    fn revoke_with_no_position_commits_nothing() {
        let ops = MockOps::default();
        let partitions = vec![("events".to_string(), 0)];

        handle_revoked(&ops, &partitions);

        assert!(ops.commits.lock().unwrap().is_empty());
    }
}
