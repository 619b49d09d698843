//! Publishing provenance events to the partitioned log.
//!
//! The publisher owns partition assignment end to end: it hashes the
//! event's lineage key itself and stamps the explicit partition on every
//! record, rather than trusting whatever partitioner the client library
//! ships with. The returned [`LogPosition`] is the broker-acknowledged
//! coordinate of the appended record.

use lineage_core::document::LogPosition;
use lineage_core::event::{EventCodecError, ProvenanceEvent};
use lineage_core::partitioner::{PartitionError, partition_for_event};
use rdkafka::ClientConfig;
use rdkafka::producer::future_producer::Delivery;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;
use thiserror::Error;

/// Error types for event publishing.
#[derive(Error, Debug)]
pub enum PublishError {
    /// The producer client could not be created.
    #[error("Failed to create producer: {0}")]
    Connection(String),

    /// The topic's metadata could not be fetched.
    #[error("Failed to fetch metadata for topic '{0}': {1}")]
    Metadata(String, String),

    /// The topic does not exist or reports no partitions.
    #[error("Topic '{0}' is unknown or has no partitions")]
    UnknownTopic(String),

    /// The event could not be assigned a partition.
    #[error(transparent)]
    Partition(#[from] PartitionError),

    /// The assigned partition currently has no leader broker.
    ///
    /// Publishing anyway would park the record in the client's buffer with
    /// no delivery bound; the caller retries after the cluster heals.
    #[error("Partition {partition} of topic '{topic}' has no leader")]
    PartitionLeaderUnavailable {
        /// Topic being published to.
        topic: String,
        /// Partition with no leader.
        partition: i32,
    },

    /// The event could not be serialized for the wire.
    #[error(transparent)]
    Serialization(#[from] EventCodecError),

    /// The broker did not acknowledge the record.
    #[error("Delivery failed: {0}")]
    Delivery(String),
}

/// Builder for [`EventPublisher`].
pub struct EventPublisherBuilder {
    brokers: String,
    topic: String,
    acks: String,
    compression: String,
    timeout: Duration,
}

impl EventPublisherBuilder {
    /// Require acknowledgement from all in-sync replicas (default).
    #[must_use]
    pub fn acks_all(mut self) -> Self {
        self.acks = "all".to_string();
        self
    }

    /// Set the compression codec (default `lz4`).
    #[must_use]
    pub fn compression(mut self, codec: &str) -> Self {
        self.compression = codec.to_string();
        self
    }

    /// Set the per-record delivery timeout (default 30s).
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Create the producer client and fetch the topic's partition layout.
    ///
    /// # Errors
    ///
    /// Returns [`PublishError::Connection`] if the client cannot be created,
    /// [`PublishError::Metadata`] if the metadata fetch fails, and
    /// [`PublishError::UnknownTopic`] if the topic has no partitions.
    pub fn build(self) -> Result<EventPublisher, PublishError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &self.brokers)
            .set("acks", &self.acks)
            .set("compression.type", &self.compression)
            .set("enable.idempotence", "true")
            .set("message.timeout.ms", self.timeout.as_millis().to_string())
            .create()
            .map_err(|e| PublishError::Connection(e.to_string()))?;

        let leaders = fetch_partition_leaders(&producer, &self.topic)?;
        tracing::info!(
            topic = %self.topic,
            partitions = leaders.len(),
            "Event publisher ready"
        );

        Ok(EventPublisher {
            producer,
            topic: self.topic,
            timeout: self.timeout,
            leaders: RwLock::new(leaders),
        })
    }
}

fn fetch_partition_leaders(
    producer: &FutureProducer,
    topic: &str,
) -> Result<Vec<i32>, PublishError> {
    let metadata = producer
        .client()
        .fetch_metadata(Some(topic), Duration::from_secs(10))
        .map_err(|e| PublishError::Metadata(topic.to_string(), e.to_string()))?;

    let leaders: Vec<i32> = metadata
        .topics()
        .iter()
        .find(|t| t.name() == topic)
        .map(|t| t.partitions().iter().map(|p| p.leader()).collect())
        .unwrap_or_default();

    if leaders.is_empty() {
        return Err(PublishError::UnknownTopic(topic.to_string()));
    }
    Ok(leaders)
}

/// Publishes provenance events to their lineage-assigned partitions.
pub struct EventPublisher {
    producer: FutureProducer,
    topic: String,
    timeout: Duration,
    // Leader broker id per partition, -1 where leaderless. Refreshed on
    // demand, not on every publish.
    leaders: RwLock<Vec<i32>>,
}

impl EventPublisher {
    /// Start building a publisher for one topic.
    #[must_use]
    pub fn builder(brokers: &str, topic: &str) -> EventPublisherBuilder {
        EventPublisherBuilder {
            brokers: brokers.to_string(),
            topic: topic.to_string(),
            acks: "all".to_string(),
            compression: "lz4".to_string(),
            timeout: Duration::from_secs(30),
        }
    }

    /// Number of partitions in the topic at last metadata fetch.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
    pub fn partition_count(&self) -> i32 {
        self.leaders
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len() as i32
    }

    /// Re-fetch the topic's partition layout from the cluster.
    ///
    /// # Errors
    ///
    /// Returns [`PublishError::Metadata`] or [`PublishError::UnknownTopic`]
    /// if the fetch fails; the cached layout is kept in that case.
    pub fn refresh_metadata(&self) -> Result<(), PublishError> {
        let leaders = fetch_partition_leaders(&self.producer, &self.topic)?;
        *self
            .leaders
            .write()
            .unwrap_or_else(PoisonError::into_inner) = leaders;
        Ok(())
    }

    /// Publish one event and wait for broker acknowledgement.
    ///
    /// The partition is computed from the event's lineage key with the
    /// shared hash, checked for a live leader, and stamped on the record
    /// explicitly. The record key carries the lineage key so external
    /// tooling observes the same keying.
    ///
    /// # Errors
    ///
    /// Returns [`PublishError::Partition`] for keyless events,
    /// [`PublishError::PartitionLeaderUnavailable`] when the target
    /// partition is leaderless, and [`PublishError::Delivery`] if the broker
    /// does not acknowledge within the timeout.
    pub async fn publish(&self, event: &ProvenanceEvent) -> Result<LogPosition, PublishError> {
        let partition = {
            let leaders = self
                .leaders
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
            let partition = partition_for_event(event, leaders.len() as i32)?;
            if leaders.get(partition.unsigned_abs() as usize) == Some(&-1) {
                return Err(PublishError::PartitionLeaderUnavailable {
                    topic: self.topic.clone(),
                    partition,
                });
            }
            partition
        };

        let payload = event.to_bytes()?;
        // partition_for_event already rejected keyless events.
        let key = event.lineage_key.clone().unwrap_or_default();

        let record = FutureRecord::to(&self.topic)
            .partition(partition)
            .key(&key)
            .payload(&payload);

        let Delivery {
            partition: acked_partition,
            offset,
            ..
        } = self
            .producer
            .send(record, Timeout::After(self.timeout))
            .await
            .map_err(|(e, _)| PublishError::Delivery(e.to_string()))?;

        tracing::debug!(
            event_id = %event.id,
            kind = event.kind_name(),
            topic = %self.topic,
            partition = acked_partition,
            offset,
            "Event published"
        );

        Ok(LogPosition::new(&self.topic, acked_partition, offset))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use lineage_core::partitioner::partition_for_key;
    use lineage_testing::events::{REFERENCE_LINEAGE, creation};

    #[test]
    fn keyless_event_is_rejected_before_any_network_io() {
        let mut event = creation(REFERENCE_LINEAGE, 1, &["obj:v1"]);
        event.lineage_key = None;
        assert!(matches!(
            partition_for_event(&event, 8),
            Err(PartitionError::MissingLineageKey { .. })
        ));
    }

    #[test]
    fn publisher_partitioning_matches_shared_hash() {
        // The publisher delegates to the shared partitioner; the reference
        // lineage must land on the pinned partition for the 8-way layout.
        let event = creation(REFERENCE_LINEAGE, 1, &["obj:v1"]);
        assert_eq!(
            partition_for_event(&event, 8).unwrap(),
            partition_for_key(REFERENCE_LINEAGE, 8).unwrap()
        );
        assert_eq!(partition_for_event(&event, 8).unwrap(), 4);
    }

    #[test]
    fn builder_defaults() {
        let builder = EventPublisher::builder("localhost:9092", "provenance-events");
        assert_eq!(builder.acks, "all");
        assert_eq!(builder.compression, "lz4");
        assert_eq!(builder.timeout, Duration::from_secs(30));
    }
}
