//! Deterministic lineage-to-partition assignment.
//!
//! All events sharing a lineage key must land on the same partition so that
//! one consumer observes them in log order. This module is the single shared
//! implementation of that mapping for producers and consumers; the two sides
//! have no type-level way to enforce that they agree, so the conformance
//! table in the tests below is the contract.
//!
//! The hash is the murmur2 variant used by the Kafka default partitioner
//! (seed `0x9747b28c`, result masked positive before the modulo), so events
//! published by any client using that partitioner with the lineage key as
//! the record key land on the same partition this module computes.

use crate::event::ProvenanceEvent;
use thiserror::Error;

/// Error types for partition assignment.
#[derive(Error, Debug)]
pub enum PartitionError {
    /// The event's target type carries no lineage key.
    ///
    /// There is deliberately no fallback partition: silently routing keyless
    /// events to a fixed partition would corrupt the ordering guarantee of
    /// whatever lineage is already pinned there. Unversioned target types
    /// must be routed to a separate topic by the caller.
    #[error("Event {event_id} has no lineage key; cannot assign a partition")]
    MissingLineageKey {
        /// Identifier of the offending event.
        event_id: String,
    },

    /// The partition count is not a positive number.
    #[error("Invalid partition count: {0}")]
    InvalidPartitionCount(i32),
}

const SEED: u32 = 0x9747_b28c;
const M: u32 = 0x5bd1_e995;
const R: u32 = 24;

/// Kafka-compatible murmur2 hash.
///
/// Byte-for-byte equivalent to the hash inside the Kafka default
/// partitioner. Stable across processes, platforms and releases; never
/// change it for a deployed topic.
#[must_use]
#[allow(clippy::cast_possible_truncation)] // Length truncation matches the reference hash
pub fn murmur2(data: &[u8]) -> u32 {
    let mut h: u32 = SEED ^ (data.len() as u32);

    let mut chunks = data.chunks_exact(4);
    for chunk in &mut chunks {
        let mut k = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        k = k.wrapping_mul(M);
        k ^= k >> R;
        k = k.wrapping_mul(M);
        h = h.wrapping_mul(M);
        h ^= k;
    }

    let rem = chunks.remainder();
    if rem.len() == 3 {
        h ^= u32::from(rem[2]) << 16;
    }
    if rem.len() >= 2 {
        h ^= u32::from(rem[1]) << 8;
    }
    if !rem.is_empty() {
        h ^= u32::from(rem[0]);
        h = h.wrapping_mul(M);
    }

    h ^= h >> 13;
    h = h.wrapping_mul(M);
    h ^= h >> 15;
    h
}

/// Map a lineage key to a partition id.
///
/// Pure and total for any key: equal keys map to equal partitions for a
/// fixed `num_partitions`, which is the load-bearing correctness property of
/// the whole pipeline.
///
/// # Errors
///
/// Returns [`PartitionError::InvalidPartitionCount`] if `num_partitions` is
/// not positive.
#[allow(clippy::cast_possible_wrap, clippy::cast_sign_loss)] // Masked positive before the modulo
pub fn partition_for_key(lineage_key: &str, num_partitions: i32) -> Result<i32, PartitionError> {
    if num_partitions <= 0 {
        return Err(PartitionError::InvalidPartitionCount(num_partitions));
    }
    let positive = murmur2(lineage_key.as_bytes()) & 0x7fff_ffff;
    Ok((positive % num_partitions as u32) as i32)
}

/// Map an event to a partition id via its lineage key.
///
/// # Errors
///
/// Returns [`PartitionError::MissingLineageKey`] for events whose target
/// type carries no lineage key, and [`PartitionError::InvalidPartitionCount`]
/// if `num_partitions` is not positive.
pub fn partition_for_event(
    event: &ProvenanceEvent,
    num_partitions: i32,
) -> Result<i32, PartitionError> {
    let key = event
        .lineage_key
        .as_deref()
        .ok_or_else(|| PartitionError::MissingLineageKey {
            event_id: event.id.clone(),
        })?;
    partition_for_key(key, num_partitions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventKind, TargetType};
    use chrono::Utc;
    use proptest::prelude::*;

    #[test]
    #[allow(clippy::unwrap_used)]
    fn reference_partition_table() {
        // Contract with every producer that ever wrote the topic. If this
        // table changes, per-lineage ordering is broken for existing data.
        let expected = [0, 0, 1, 0, 1, 4, 4, 4, 7, 6];
        for (n, want) in (1..=10).zip(expected) {
            assert_eq!(
                partition_for_key("lineage-003164", n).unwrap(),
                want,
                "partition count {n}"
            );
        }
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn single_partition_always_zero() {
        for key in ["a", "lineage-003164", "", "urn:lineage:42"] {
            assert_eq!(partition_for_key(key, 1).unwrap(), 0);
        }
    }

    #[test]
    fn invalid_partition_count_is_rejected() {
        assert!(matches!(
            partition_for_key("lineage-003164", 0),
            Err(PartitionError::InvalidPartitionCount(0))
        ));
        assert!(matches!(
            partition_for_key("lineage-003164", -3),
            Err(PartitionError::InvalidPartitionCount(-3))
        ));
    }

    #[test]
    fn missing_lineage_key_is_fatal() {
        let event = ProvenanceEvent {
            id: "event:agent-1".to_string(),
            target_type: TargetType::Agent,
            agent: "agent:alice".to_string(),
            lineage_key: None,
            started_at: Utc::now(),
            ended_at: None,
            kind: EventKind::Creation {
                created_object_ids: vec!["agent:bob".to_string()],
            },
        };
        assert!(matches!(
            partition_for_event(&event, 8),
            Err(PartitionError::MissingLineageKey { .. })
        ));
    }

    proptest! {
        #[test]
        #[allow(clippy::unwrap_used)]
        fn equal_keys_pin_to_equal_partitions(key in ".{0,64}", n in 1i32..64) {
            let first = partition_for_key(&key, n).unwrap();
            let second = partition_for_key(&key, n).unwrap();
            prop_assert_eq!(first, second);
            prop_assert!((0..n).contains(&first));
        }
    }
}
