//! The indexing consumer: a consumer-group member that materializes
//! provenance events into the document view.
//!
//! One consumer instance owns a dynamic subset of the topic's partitions
//! and applies each partition's records strictly in log order. Delivery is
//! at-least-once; the materializer's writes are idempotent upserts, so
//! reprocessing after a crash or rebalance converges to the same view.
//!
//! Broker auto-commit is disabled. Recovery positions come from the
//! materialized view itself (see the rebalance module); the only broker
//! commits are the defensive checkpoints written on revoke and shutdown.

use crate::rebalance::{
    DefaultSeek, IndexingContext, RebalanceError, ResumeMode, handle_revoked,
};
use lineage_core::document::LogPosition;
use lineage_core::event::{EventCodecError, ProvenanceEvent};
use lineage_core::materializer::{MaterializeError, Materializer};
use lineage_core::store::MaterializedStore;
use rdkafka::ClientConfig;
use rdkafka::consumer::{BaseConsumer, Consumer};
use rdkafka::message::Message;
use std::sync::PoisonError;
use std::sync::atomic::Ordering;
use std::time::Duration;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::watch;

/// Error types for the indexing consumer.
#[derive(Error, Debug)]
pub enum IndexError {
    /// The consumer client could not be created.
    #[error("Failed to create consumer: {0}")]
    Client(String),

    /// The topic subscription was rejected.
    #[error("Failed to subscribe to topic '{0}': {1}")]
    Subscription(String, String),

    /// A record's payload is not a decodable provenance event.
    ///
    /// Fatal: a corrupt record means either a broken producer or schema
    /// drift, and skipping it would silently hole the view. The operator
    /// decides whether to fix the producer or rebuild past the record.
    #[error("Undecodable record at {position}: {source}")]
    Decode {
        /// Coordinate of the corrupt record.
        position: LogPosition,
        /// Codec failure detail.
        source: EventCodecError,
    },

    /// A record carries no payload at all.
    ///
    /// Distinct from a corrupt payload so the fatal log names the actual
    /// condition; this topic never carries tombstone-style null records.
    #[error("Record at {0} has no payload")]
    MissingPayload(LogPosition),

    /// An event carries no lineage key on a lineage-ordered partition.
    ///
    /// Fatal for the same reason as a decode failure: it indicates a
    /// misrouting producer, not a transient condition.
    #[error(transparent)]
    Materialize(MaterializeError),

    /// Partition repositioning failed during a rebalance.
    #[error(transparent)]
    Recovery(#[from] RebalanceError),

    /// The consumer was constructed outside a tokio runtime.
    #[error("Indexing consumer requires a tokio runtime: {0}")]
    NoRuntime(String),
}

/// Configuration for [`IndexingConsumer`].
#[derive(Clone, Debug)]
pub struct IndexerConfig {
    brokers: String,
    topic: String,
    group_id: String,
    default_seek: DefaultSeek,
    rebuild: bool,
    poll_timeout: Duration,
}

impl IndexerConfig {
    /// Configuration with production defaults: seek to earliest for
    /// partitions the view knows nothing about, 1s poll timeout.
    #[must_use]
    pub fn new(brokers: &str, topic: &str, group_id: &str) -> Self {
        Self {
            brokers: brokers.to_string(),
            topic: topic.to_string(),
            group_id: group_id.to_string(),
            default_seek: DefaultSeek::Earliest,
            rebuild: false,
            poll_timeout: Duration::from_secs(1),
        }
    }

    /// Where to start a partition the view has no checkpoint for.
    #[must_use]
    pub const fn default_seek(mut self, seek: DefaultSeek) -> Self {
        self.default_seek = seek;
        self
    }

    /// Ignore view checkpoints and reprocess every partition from the
    /// beginning. Used to rebuild the view in place.
    #[must_use]
    pub const fn rebuild(mut self) -> Self {
        self.rebuild = true;
        self
    }

    /// How long each poll blocks waiting for a record.
    #[must_use]
    pub const fn poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    const fn resume_mode(&self) -> ResumeMode {
        if self.rebuild {
            ResumeMode::Rebuild
        } else {
            ResumeMode::FromView(self.default_seek)
        }
    }
}

/// What one poll iteration decided.
enum PollOutcome {
    /// A record was applied to the view (or the poll returned nothing).
    Continue,
    /// The shutdown signal flipped.
    ShutdownRequested,
}

const STALL_RETRY_INITIAL: Duration = Duration::from_millis(500);
const STALL_RETRY_MAX: Duration = Duration::from_secs(5);

/// Decode one record's payload into an event.
fn decode_record(
    payload: Option<&[u8]>,
    position: &LogPosition,
) -> Result<ProvenanceEvent, IndexError> {
    let payload = payload.ok_or_else(|| IndexError::MissingPayload(position.clone()))?;
    ProvenanceEvent::from_bytes(payload).map_err(|source| IndexError::Decode {
        position: position.clone(),
        source,
    })
}

/// A consumer-group member that indexes provenance events into the
/// materialized view.
pub struct IndexingConsumer<S: MaterializedStore + 'static> {
    consumer: BaseConsumer<IndexingContext<S>>,
    materializer: Materializer<S>,
    runtime: Handle,
    config: IndexerConfig,
    shutdown: watch::Receiver<bool>,
}

impl<S: MaterializedStore + 'static> IndexingConsumer<S> {
    /// Create a consumer, join the group, and return it together with the
    /// shutdown trigger.
    ///
    /// Must be called from within a tokio runtime; the runtime handle is
    /// captured so rebalance callbacks and the poll loop can drive async
    /// store operations.
    ///
    /// # Errors
    ///
    /// Returns [`IndexError::NoRuntime`] outside a runtime,
    /// [`IndexError::Client`] if the client cannot be created, and
    /// [`IndexError::Subscription`] if the subscription is rejected.
    pub fn consume(
        config: IndexerConfig,
        store: std::sync::Arc<S>,
    ) -> Result<(Self, watch::Sender<bool>), IndexError> {
        let runtime = Handle::try_current().map_err(|e| IndexError::NoRuntime(e.to_string()))?;

        let context =
            IndexingContext::new(std::sync::Arc::clone(&store), runtime.clone(), config.resume_mode());

        let auto_offset_reset = match config.default_seek {
            DefaultSeek::Earliest => "earliest",
            DefaultSeek::Latest => "latest",
        };

        let consumer: BaseConsumer<IndexingContext<S>> = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("group.id", &config.group_id)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", auto_offset_reset)
            .set("session.timeout.ms", "6000")
            .set("enable.partition.eof", "false")
            .create_with_context(context)
            .map_err(|e| IndexError::Client(e.to_string()))?;

        consumer
            .subscribe(&[&config.topic])
            .map_err(|e| IndexError::Subscription(config.topic.clone(), e.to_string()))?;

        tracing::info!(
            topic = %config.topic,
            group_id = %config.group_id,
            rebuild = config.rebuild,
            "Indexing consumer joined group"
        );

        let (sender, receiver) = watch::channel(false);
        Ok((
            Self {
                consumer,
                materializer: Materializer::new(store),
                runtime,
                config,
                shutdown: receiver,
            },
            sender,
        ))
    }

    /// Create a rebuilding consumer: every assigned partition starts at its
    /// oldest record regardless of view checkpoints.
    ///
    /// # Errors
    ///
    /// Same as [`IndexingConsumer::consume`].
    pub fn consume_from_earliest(
        config: IndexerConfig,
        store: std::sync::Arc<S>,
    ) -> Result<(Self, watch::Sender<bool>), IndexError> {
        Self::consume(config.rebuild(), store)
    }

    /// Run the poll loop until shutdown or a fatal error.
    ///
    /// Blocks its thread; callers run it via `spawn_blocking` or a
    /// dedicated thread. On shutdown the current assignment is checkpointed
    /// to the broker before the consumer leaves the group.
    ///
    /// # Errors
    ///
    /// Returns [`IndexError::Decode`] or [`IndexError::Materialize`] for
    /// poison records, and [`IndexError::Recovery`] if a rebalance left a
    /// partition unpositioned.
    pub fn run(mut self) -> Result<(), IndexError> {
        let failure = self.consumer.context().failure_slot();
        let cancelled = self.consumer.context().cancellation_flag();

        let result = loop {
            // A repositioning failure recorded by a rebalance callback is
            // fatal: polling would read from an undefined position.
            if let Some(error) = failure
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take()
            {
                break Err(IndexError::Recovery(error));
            }

            if *self.shutdown.borrow() {
                break Ok(());
            }

            match self.poll_once() {
                Ok(PollOutcome::Continue) => {}
                Ok(PollOutcome::ShutdownRequested) => break Ok(()),
                Err(error) => break Err(error),
            }
        };

        cancelled.store(true, Ordering::Relaxed);
        self.checkpoint_assignment();
        tracing::info!(
            topic = %self.config.topic,
            group_id = %self.config.group_id,
            "Indexing consumer stopped"
        );
        result
    }

    /// Poll for one record and apply it, stalling in place while the store
    /// is unavailable.
    fn poll_once(&mut self) -> Result<PollOutcome, IndexError> {
        let Some(delivery) = self.consumer.poll(self.config.poll_timeout) else {
            return Ok(PollOutcome::Continue);
        };

        let message = match delivery {
            Ok(message) => message,
            Err(error) => {
                // Transport errors heal on their own; keep polling.
                tracing::warn!(error = %error, "Consumer poll error");
                return Ok(PollOutcome::Continue);
            }
        };

        let position = LogPosition::new(message.topic(), message.partition(), message.offset());
        let event = decode_record(message.payload(), &position)?;

        self.apply_with_stall(&event, &position)
    }

    /// Apply one event, retrying with backoff while the store is down.
    ///
    /// The record is never skipped and never acknowledged until applied;
    /// the partition simply stalls, which is the honest behavior when the
    /// view cannot accept writes.
    fn apply_with_stall(
        &mut self,
        event: &ProvenanceEvent,
        position: &LogPosition,
    ) -> Result<PollOutcome, IndexError> {
        let mut backoff = STALL_RETRY_INITIAL;
        loop {
            match self.runtime.block_on(self.materializer.apply(event, position)) {
                Ok(()) => return Ok(PollOutcome::Continue),
                Err(error @ MaterializeError::MissingLineageKey { .. }) => {
                    return Err(IndexError::Materialize(error));
                }
                Err(MaterializeError::Store(error)) => {
                    if *self.shutdown.borrow() {
                        tracing::info!(
                            position = %position,
                            "Shutdown during store stall; record will be reprocessed"
                        );
                        return Ok(PollOutcome::ShutdownRequested);
                    }
                    tracing::warn!(
                        position = %position,
                        error = %error,
                        backoff_ms = backoff.as_millis() as u64,
                        "Store unavailable, stalling partition"
                    );
                    std::thread::sleep(backoff);
                    backoff = (backoff * 2).min(STALL_RETRY_MAX);
                }
            }
        }
    }

    /// Defensively commit the current assignment's positions on shutdown.
    fn checkpoint_assignment(&self) {
        match self.consumer.assignment() {
            Ok(assignment) => {
                let partitions: Vec<(String, i32)> = assignment
                    .elements()
                    .iter()
                    .map(|elem| (elem.topic().to_string(), elem.partition()))
                    .collect();
                if !partitions.is_empty() {
                    handle_revoked(&self.consumer, &partitions);
                }
            }
            Err(error) => {
                tracing::warn!(error = %error, "Could not read assignment at shutdown");
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_to_earliest_from_view() {
        let config = IndexerConfig::new("localhost:9092", "provenance-events", "lineage-index");
        assert_eq!(
            config.resume_mode(),
            ResumeMode::FromView(DefaultSeek::Earliest)
        );
        assert_eq!(config.poll_timeout, Duration::from_secs(1));
    }

    #[test]
    fn rebuild_overrides_default_seek() {
        let config = IndexerConfig::new("localhost:9092", "provenance-events", "lineage-index")
            .default_seek(DefaultSeek::Latest)
            .rebuild();
        assert_eq!(config.resume_mode(), ResumeMode::Rebuild);
    }

    #[test]
    fn payloadless_record_is_reported_distinctly_from_corrupt_bytes() {
        let position = LogPosition::new("provenance-events", 4, 12);

        assert!(matches!(
            decode_record(None, &position),
            Err(IndexError::MissingPayload(_))
        ));
        assert!(matches!(
            decode_record(Some(&[0xff, 0x00, 0x13]), &position),
            Err(IndexError::Decode { .. })
        ));

        let event = lineage_testing::events::creation("lineage-003164", 1, &["obj:v1"]);
        let bytes = event.to_bytes().unwrap();
        assert_eq!(decode_record(Some(&bytes), &position).unwrap(), event);
    }

    #[tokio::test]
    async fn join_outside_runtime_is_detected() {
        // Handle::try_current succeeds here; the error path is exercised by
        // calling from a plain thread.
        let handle = std::thread::spawn(|| Handle::try_current().is_err());
        assert!(handle.join().unwrap());
    }
}
