//! Shard directory: the fixed topology plus its routing rule.
use std::collections::HashSet;
use std::sync::Arc;

use crate::config::{RangeSpec, RuleConfig, TopologyConfig};
use crate::rule::{HashRule, ModuloRule, RangeRule, ShardingRule};
use crate::{ShardId, ShardKey, UnroutableKey};

/// Invalid topology configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TopologyError {
    /// The topology declares no shards.
    #[error("topology declares no shards")]
    NoShards,
    /// The same shard id appears twice.
    #[error("shard {0} declared more than once")]
    DuplicateShard(ShardId),
    /// A range rule without ranges.
    #[error("range rule declares no ranges")]
    NoRanges,
    /// A range with `start >= end`.
    #[error("range [{start}, {end}) is empty")]
    EmptyRange {
        /// Lower bound.
        start: i64,
        /// Upper bound.
        end: i64,
    },
    /// Two ranges share keys.
    #[error("ranges {first:?} and {second:?} overlap")]
    OverlappingRanges {
        /// Earlier range.
        first: RangeSpec,
        /// Later range.
        second: RangeSpec,
    },
    /// A range names a shard outside the topology.
    #[error("range references unknown shard {0}")]
    UnknownShard(ShardId),
}

/// Read-only mapping from key to shard for the lifetime of the process.
#[derive(Debug, Clone)]
pub struct ShardDirectory {
    shards: Vec<ShardId>,
    rule: Arc<dyn ShardingRule>,
}

impl ShardDirectory {
    /// Build a directory with an explicit rule.
    pub fn new(shards: Vec<ShardId>, rule: Arc<dyn ShardingRule>) -> Result<Self, TopologyError> {
        validate_shards(&shards)?;
        Ok(Self { shards, rule })
    }

    /// Build the directory described by a topology configuration.
    pub fn from_config(cfg: &TopologyConfig) -> Result<Self, TopologyError> {
        validate_shards(&cfg.shards)?;
        let shards = cfg.shards.clone();
        let rule: Arc<dyn ShardingRule> = match &cfg.rule {
            RuleConfig::Modulo => Arc::new(ModuloRule::new(shards.clone())?),
            RuleConfig::Hash { seed } => Arc::new(HashRule::new(shards.clone(), *seed)?),
            RuleConfig::Range { ranges } => Arc::new(RangeRule::new(ranges.clone(), &shards)?),
        };
        Ok(Self { shards, rule })
    }

    /// Modulo directory over shards `0..count`.
    pub fn modulo(count: u32) -> Result<Self, TopologyError> {
        Self::from_config(&TopologyConfig { shards: (0..count).map(ShardId).collect(), rule: RuleConfig::Modulo })
    }

    /// Resolve the shard owning `key`.
    pub fn resolve(&self, key: &ShardKey) -> Result<ShardId, UnroutableKey> {
        self.rule.resolve(key)
    }

    /// All shards of the topology.
    pub fn shards(&self) -> &[ShardId] {
        &self.shards
    }

    /// Whether `shard` belongs to the topology.
    pub fn contains(&self, shard: ShardId) -> bool {
        self.shards.contains(&shard)
    }

    /// Name of the active rule.
    pub fn rule_name(&self) -> &'static str {
        self.rule.name()
    }
}

fn validate_shards(shards: &[ShardId]) -> Result<(), TopologyError> {
    if shards.is_empty() {
        return Err(TopologyError::NoShards);
    }
    let mut seen = HashSet::with_capacity(shards.len());
    for s in shards {
        if !seen.insert(*s) {
            return Err(TopologyError::DuplicateShard(*s));
        }
    }
    Ok(())
}
