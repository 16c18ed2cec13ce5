//! Sharding primitives for Tessera: identifiers, shard keys and routing rules.
#![deny(missing_docs)]

use serde::{Deserialize, Serialize};
use std::fmt;

pub mod config;
pub mod directory;
pub mod rule;

pub use config::{RangeSpec, RuleConfig, TopologyConfig};
pub use directory::{ShardDirectory, TopologyError};
pub use rule::{HashRule, ModuloRule, RangeRule, ShardingRule};

/// Identifier of one physical partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShardId(pub u32);

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "shard_{}", self.0)
    }
}

impl From<u32> for ShardId {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

/// Globally unique record identifier, independent of the record's shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(pub u64);

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for RecordId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// Value of a shard-determining field.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ShardKey {
    /// Integer key (user ids, tenant numbers).
    Int(i64),
    /// Text key.
    Text(String),
}

impl ShardKey {
    /// Short name of the key type, used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            ShardKey::Int(_) => "int",
            ShardKey::Text(_) => "text",
        }
    }
}

impl fmt::Display for ShardKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShardKey::Int(v) => write!(f, "{v}"),
            ShardKey::Text(s) => write!(f, "{s:?}"),
        }
    }
}

impl From<i64> for ShardKey {
    fn from(value: i64) -> Self {
        ShardKey::Int(value)
    }
}

impl From<&str> for ShardKey {
    fn from(value: &str) -> Self {
        ShardKey::Text(value.to_owned())
    }
}

impl From<String> for ShardKey {
    fn from(value: String) -> Self {
        ShardKey::Text(value)
    }
}

/// A key that the active rule cannot map to a shard.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UnroutableKey {
    /// The key has a type the rule does not accept.
    #[error("{rule} rule cannot route {kind} key {key}")]
    WrongType {
        /// Rule name.
        rule: &'static str,
        /// Key type name.
        kind: &'static str,
        /// Offending key.
        key: ShardKey,
    },
    /// The key has the right type but lies outside the declared domain.
    #[error("key {key} is outside the domain of the {rule} rule")]
    OutOfDomain {
        /// Rule name.
        rule: &'static str,
        /// Offending key.
        key: ShardKey,
    },
}
