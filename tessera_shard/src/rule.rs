//! Sharding rules mapping a shard key to a shard.
use std::fmt;
use std::io::Cursor;

use crate::config::RangeSpec;
use crate::directory::TopologyError;
use crate::{ShardId, ShardKey, UnroutableKey};

/// A pure, deterministic mapping from shard key to shard.
///
/// Implementations are built once at startup and never mutated, so they can be
/// shared between tasks without locking.
pub trait ShardingRule: Send + Sync + fmt::Debug {
    /// Rule name as it appears in configuration.
    fn name(&self) -> &'static str;

    /// Map a key to its shard.
    fn resolve(&self, key: &ShardKey) -> Result<ShardId, UnroutableKey>;
}

/// `shards[k mod n]` over non-negative integer keys.
#[derive(Debug, Clone)]
pub struct ModuloRule {
    shards: Vec<ShardId>,
}

impl ModuloRule {
    /// Create a modulo rule over the given shards, in order.
    pub fn new(shards: Vec<ShardId>) -> Result<Self, TopologyError> {
        if shards.is_empty() {
            return Err(TopologyError::NoShards);
        }
        Ok(Self { shards })
    }
}

impl ShardingRule for ModuloRule {
    fn name(&self) -> &'static str {
        "modulo"
    }

    fn resolve(&self, key: &ShardKey) -> Result<ShardId, UnroutableKey> {
        match key {
            ShardKey::Int(k) if *k >= 0 => {
                let idx = (*k as u64 % self.shards.len() as u64) as usize;
                Ok(self.shards[idx])
            }
            ShardKey::Int(_) => Err(UnroutableKey::OutOfDomain { rule: self.name(), key: key.clone() }),
            ShardKey::Text(_) => Err(UnroutableKey::WrongType {
                rule: self.name(),
                kind: key.kind(),
                key: key.clone(),
            }),
        }
    }
}

/// MurmurHash3 (32-bit) of the canonical key bytes, modulo the shard count.
///
/// Integers hash as 8 little-endian bytes and text as its UTF-8 bytes, so the
/// placement is stable across processes and builds.
#[derive(Debug, Clone)]
pub struct HashRule {
    shards: Vec<ShardId>,
    seed: u32,
}

impl HashRule {
    /// Create a hash rule with the given seed.
    pub fn new(shards: Vec<ShardId>, seed: u32) -> Result<Self, TopologyError> {
        if shards.is_empty() {
            return Err(TopologyError::NoShards);
        }
        Ok(Self { shards, seed })
    }

    fn hash(&self, key: &ShardKey) -> std::io::Result<u32> {
        match key {
            ShardKey::Int(v) => murmur3::murmur3_32(&mut Cursor::new(v.to_le_bytes()), self.seed),
            ShardKey::Text(s) => murmur3::murmur3_32(&mut Cursor::new(s.as_bytes()), self.seed),
        }
    }
}

impl ShardingRule for HashRule {
    fn name(&self) -> &'static str {
        "hash"
    }

    fn resolve(&self, key: &ShardKey) -> Result<ShardId, UnroutableKey> {
        // Reading from an in-memory cursor cannot fail; map it anyway.
        let h = self
            .hash(key)
            .map_err(|_| UnroutableKey::OutOfDomain { rule: self.name(), key: key.clone() })?;
        Ok(self.shards[(h as usize) % self.shards.len()])
    }
}

/// Half-open integer ranges `[start, end)`, each owned by one shard.
#[derive(Debug, Clone)]
pub struct RangeRule {
    ranges: Vec<RangeSpec>, // sorted by start, non-overlapping
}

impl RangeRule {
    /// Build a range rule, validating the ranges against the topology.
    pub fn new(mut ranges: Vec<RangeSpec>, shards: &[ShardId]) -> Result<Self, TopologyError> {
        if ranges.is_empty() {
            return Err(TopologyError::NoRanges);
        }
        for r in &ranges {
            if r.start >= r.end {
                return Err(TopologyError::EmptyRange { start: r.start, end: r.end });
            }
            if !shards.contains(&r.shard) {
                return Err(TopologyError::UnknownShard(r.shard));
            }
        }
        ranges.sort_by_key(|r| r.start);
        for pair in ranges.windows(2) {
            if pair[1].start < pair[0].end {
                return Err(TopologyError::OverlappingRanges { first: pair[0].clone(), second: pair[1].clone() });
            }
        }
        Ok(Self { ranges })
    }
}

impl ShardingRule for RangeRule {
    fn name(&self) -> &'static str {
        "range"
    }

    fn resolve(&self, key: &ShardKey) -> Result<ShardId, UnroutableKey> {
        let k = match key {
            ShardKey::Int(k) => *k,
            ShardKey::Text(_) => {
                return Err(UnroutableKey::WrongType { rule: self.name(), kind: key.kind(), key: key.clone() })
            }
        };
        // First range whose start is beyond k; the candidate is the one before it.
        let idx = self.ranges.partition_point(|r| r.start <= k);
        match idx.checked_sub(1).map(|i| &self.ranges[i]) {
            Some(r) if k < r.end => Ok(r.shard),
            _ => Err(UnroutableKey::OutOfDomain { rule: self.name(), key: key.clone() }),
        }
    }
}
