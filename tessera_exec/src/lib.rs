//! Shard executor boundary.
//!
//! The router never talks to a physical store directly. It submits typed
//! [`Statement`]s against one shard at a time through [`ShardExecutor`] and
//! opens independent per-shard transactions through [`ShardTxn`]. Nothing here
//! spans more than one shard.
#![deny(missing_docs)]

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tessera_shard::{RecordId, ShardId};

pub mod memory;

pub use memory::MemoryExecutor;

/// Result type alias for executor operations.
pub type Result<T> = std::result::Result<T, ExecError>;

/// Executor errors. Every variant names the shard it came from.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecError {
    /// The physical store could not be reached.
    #[error("{shard} unavailable: {reason}")]
    ShardUnavailable {
        /// Target shard.
        shard: ShardId,
        /// Driver message.
        reason: String,
    },
    /// Malformed or constraint-violating statement.
    #[error("statement failed on {shard}: {reason}")]
    Statement {
        /// Target shard.
        shard: ShardId,
        /// Driver message.
        reason: String,
    },
}

impl ExecError {
    /// Shard the error came from.
    pub fn shard(&self) -> ShardId {
        match self {
            ExecError::ShardUnavailable { shard, .. } | ExecError::Statement { shard, .. } => *shard,
        }
    }

    /// Whether a caller may retry after backing off.
    pub fn is_transient(&self) -> bool {
        matches!(self, ExecError::ShardUnavailable { .. })
    }
}

/// One stored row: the record id plus the serialized record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    /// Record id, the primary key within a shard.
    pub id: RecordId,
    /// Serialized record document.
    pub data: serde_json::Value,
}

/// Single-table, single-record statements understood by every executor.
#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    /// Insert a new row; fails if the id already exists.
    Insert(Row),
    /// Read every row of the shard.
    SelectAll,
    /// Point read. Inside a transaction `for_update` locks the row until
    /// commit or rollback.
    SelectById {
        /// Row id.
        id: RecordId,
        /// Take a row lock.
        for_update: bool,
    },
    /// Replace an existing row; affects zero rows if it does not exist.
    Update(Row),
    /// Delete by id; affects zero rows if it does not exist.
    DeleteById(RecordId),
}

impl Statement {
    /// Short operation name for logs and metrics.
    pub fn op(&self) -> &'static str {
        match self {
            Statement::Insert(_) => "insert",
            Statement::SelectAll => "select_all",
            Statement::SelectById { .. } => "select_by_id",
            Statement::Update(_) => "update",
            Statement::DeleteById(_) => "delete",
        }
    }
}

/// Statement result.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Rows returned by a read.
    Rows(Vec<Row>),
    /// Number of rows affected by a write.
    Count(u64),
}

impl Outcome {
    /// Rows of a read; a write yields none.
    pub fn into_rows(self) -> Vec<Row> {
        match self {
            Outcome::Rows(rows) => rows,
            Outcome::Count(_) => Vec::new(),
        }
    }

    /// Affected or returned row count.
    pub fn count(&self) -> u64 {
        match self {
            Outcome::Rows(rows) => rows.len() as u64,
            Outcome::Count(n) => *n,
        }
    }
}

/// Access to the physical stores behind each shard.
#[async_trait]
pub trait ShardExecutor: Send + Sync {
    /// Execute one auto-committed statement against `shard`.
    async fn execute(&self, shard: ShardId, stmt: Statement) -> Result<Outcome>;

    /// Open a transaction on `shard`. Transactions on different shards are
    /// fully independent.
    async fn begin(&self, shard: ShardId) -> Result<Box<dyn ShardTxn>>;
}

/// An open transaction on a single shard.
///
/// Dropping an open transaction without committing discards its writes.
#[async_trait]
pub trait ShardTxn: Send {
    /// Shard the transaction runs on.
    fn shard(&self) -> ShardId;

    /// Execute a statement inside the transaction.
    async fn execute(&mut self, stmt: Statement) -> Result<Outcome>;

    /// Commit staged writes.
    async fn commit(self: Box<Self>) -> Result<()>;

    /// Discard staged writes and release locks.
    async fn rollback(self: Box<Self>) -> Result<()>;
}
