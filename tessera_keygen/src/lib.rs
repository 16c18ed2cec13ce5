//! Collision-free record id generation.
//!
//! Ids must be unique across every shard, so they are never taken from a
//! per-shard auto-increment. [`Snowflake`] packs a millisecond timestamp, a
//! worker id and a sequence number into 63 bits.
#![deny(missing_docs)]

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use tessera_shard::RecordId;
use time::OffsetDateTime;

/// 2016-11-01T00:00:00Z in unix milliseconds.
pub const EPOCH_MS: u64 = 1_477_929_600_000;

const SEQUENCE_BITS: u32 = 12;
const WORKER_BITS: u32 = 10;
const SEQUENCE_MASK: u64 = (1 << SEQUENCE_BITS) - 1;
/// Largest accepted worker id.
pub const MAX_WORKER_ID: u16 = (1 << WORKER_BITS) - 1;

/// Source of record ids handed to the router.
pub trait IdGenerator: Send + Sync {
    /// Allocate a fresh id.
    fn next_id(&self) -> RecordId;
}

/// Key generator errors.
#[derive(Debug, thiserror::Error)]
pub enum KeygenError {
    /// Worker id does not fit in 10 bits.
    #[error("worker id {0} exceeds {MAX_WORKER_ID}")]
    WorkerOutOfRange(u16),
}

/// Key generator settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeygenConfig {
    /// Worker id, unique per process writing to the same table.
    pub worker_id: u16,
}

impl Default for KeygenConfig {
    fn default() -> Self {
        Self { worker_id: 1 }
    }
}

/// Snowflake-style generator: `timestamp(41) | worker(10) | sequence(12)`.
///
/// The last issued `(millis, sequence)` pair lives in one atomic word. When
/// the wall clock stalls, goes backwards, or a millisecond runs out of
/// sequence numbers, the generator moves on to the next logical millisecond
/// instead of blocking, so ids stay strictly increasing.
#[derive(Debug)]
pub struct Snowflake {
    worker_id: u64,
    state: AtomicU64,
}

impl Snowflake {
    /// Create a generator for `worker_id` (0..=1023).
    pub fn new(worker_id: u16) -> Result<Self, KeygenError> {
        if worker_id > MAX_WORKER_ID {
            return Err(KeygenError::WorkerOutOfRange(worker_id));
        }
        Ok(Self { worker_id: worker_id as u64, state: AtomicU64::new(0) })
    }

    /// Create a generator from configuration.
    pub fn from_config(cfg: &KeygenConfig) -> Result<Self, KeygenError> {
        Self::new(cfg.worker_id)
    }

    /// Split an id into `(unix_millis, worker_id, sequence)`.
    pub fn decompose(id: RecordId) -> (u64, u16, u16) {
        let seq = id.0 & SEQUENCE_MASK;
        let worker = (id.0 >> SEQUENCE_BITS) & MAX_WORKER_ID as u64;
        let millis = (id.0 >> (SEQUENCE_BITS + WORKER_BITS)) + EPOCH_MS;
        (millis, worker as u16, seq as u16)
    }

    fn now_ms() -> u64 {
        let unix_ms = OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000;
        (unix_ms as u64).saturating_sub(EPOCH_MS)
    }
}

impl IdGenerator for Snowflake {
    fn next_id(&self) -> RecordId {
        let now = Self::now_ms();
        let mut prev = self.state.load(Ordering::Acquire);
        loop {
            let prev_ms = prev >> SEQUENCE_BITS;
            let prev_seq = prev & SEQUENCE_MASK;
            let (ms, seq) = if now > prev_ms {
                (now, 0)
            } else if prev_seq < SEQUENCE_MASK {
                (prev_ms, prev_seq + 1)
            } else {
                (prev_ms + 1, 0)
            };
            let next = (ms << SEQUENCE_BITS) | seq;
            match self.state.compare_exchange_weak(prev, next, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => {
                    return RecordId((ms << (SEQUENCE_BITS + WORKER_BITS)) | (self.worker_id << SEQUENCE_BITS) | seq)
                }
                Err(actual) => prev = actual,
            }
        }
    }
}

/// Monotonic counter; deterministic ids for tests and single-process tools.
#[derive(Debug)]
pub struct CounterGenerator {
    counter: AtomicU64,
}

impl CounterGenerator {
    /// Start counting at `first`.
    pub fn starting_at(first: u64) -> Self {
        Self { counter: AtomicU64::new(first) }
    }
}

impl Default for CounterGenerator {
    fn default() -> Self {
        Self::starting_at(1)
    }
}

impl IdGenerator for CounterGenerator {
    #[inline]
    fn next_id(&self) -> RecordId {
        RecordId(self.counter.fetch_add(1, Ordering::Relaxed))
    }
}
