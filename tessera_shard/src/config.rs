//! Topology configuration as read from YAML.
use serde::{Deserialize, Serialize};

use crate::ShardId;

/// Fixed shard list plus the parameters of the sharding rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopologyConfig {
    /// Shard identifiers, in rule order.
    pub shards: Vec<ShardId>,
    /// Rule mapping keys onto `shards`.
    #[serde(default)]
    pub rule: RuleConfig,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self { shards: vec![ShardId(0), ShardId(1)], rule: RuleConfig::Modulo }
    }
}

/// Rule selection.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RuleConfig {
    /// `shards[k mod n]` for non-negative integer keys.
    #[default]
    Modulo,
    /// MurmurHash3 of the key bytes.
    Hash {
        /// Hash seed.
        #[serde(default)]
        seed: u32,
    },
    /// Explicit integer ranges.
    Range {
        /// Half-open ranges; must not overlap.
        ranges: Vec<RangeSpec>,
    },
}

/// One `[start, end)` range owned by `shard`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeSpec {
    /// Inclusive lower bound.
    pub start: i64,
    /// Exclusive upper bound.
    pub end: i64,
    /// Owning shard.
    pub shard: ShardId,
}

impl TopologyConfig {
    /// Parse a topology from a YAML document.
    pub fn from_yaml(doc: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(doc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_modulo_default_rule() {
        let cfg = TopologyConfig::from_yaml("shards: [0, 1, 2]").unwrap();
        assert_eq!(cfg.shards.len(), 3);
        assert_eq!(cfg.rule, RuleConfig::Modulo);
    }

    #[test]
    fn parse_hash_and_range() {
        let cfg = TopologyConfig::from_yaml("shards: [0, 1]\nrule: { kind: hash, seed: 7 }").unwrap();
        assert_eq!(cfg.rule, RuleConfig::Hash { seed: 7 });

        let doc = r#"
shards: [0, 1]
rule:
  kind: range
  ranges:
    - { start: 0, end: 1000, shard: 0 }
    - { start: 1000, end: 2000, shard: 1 }
"#;
        let cfg = TopologyConfig::from_yaml(doc).unwrap();
        match cfg.rule {
            RuleConfig::Range { ranges } => {
                assert_eq!(ranges[1], RangeSpec { start: 1000, end: 2000, shard: ShardId(1) })
            }
            other => panic!("unexpected rule {other:?}"),
        }
    }
}
