use std::fmt;
use std::time::Duration;

use serde::Serialize;
use tessera_exec::ExecError;
use tessera_shard::{RecordId, ShardId, ShardKey, UnroutableKey};

use crate::migration::MigrationPlan;

/// Result type alias for router operations.
pub type Result<T> = std::result::Result<T, RouterError>;

/// Router errors.
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    /// The key is outside the rule's domain. Not retryable.
    #[error(transparent)]
    UnroutableKey(#[from] UnroutableKey),
    /// A single-shard operation failed; the error names the shard.
    #[error(transparent)]
    Shard(#[from] ExecError),
    /// A scatter operation failed on some shards.
    #[error("scan failed on {} of {} shards", .failed.len(), .failed.len() + .succeeded.len())]
    PartialScanFailure {
        /// Shards that answered.
        succeeded: Vec<ShardId>,
        /// Per-shard failures.
        failed: Vec<ExecError>,
    },
    /// No record with this id where it was expected.
    #[error("record {id} not found")]
    RecordNotFound {
        /// Requested id.
        id: RecordId,
    },
    /// The record has no id yet.
    #[error("record has no id")]
    MissingRecordId,
    /// The stored shard key is not the one the caller expected to replace.
    #[error("record {id} has shard key {stored}, expected {expected}")]
    StaleShardKey {
        /// Record id.
        id: RecordId,
        /// Key the caller passed as the current one.
        expected: ShardKey,
        /// Key actually stored.
        stored: ShardKey,
    },
    /// A cross-shard move stopped half way. Requires reconciliation, not retry.
    #[error(transparent)]
    MigrationFailed(#[from] MigrationFailure),
    /// The operation deadline expired before any commit was requested.
    #[error("{op} timed out after {after:?}")]
    Timeout {
        /// Step that was running.
        op: &'static str,
        /// Configured budget.
        after: Duration,
    },
    /// The record could not be serialized.
    #[error("cannot encode record: {0}")]
    Encode(#[source] serde_json::Error),
    /// A stored row does not decode into the record type.
    #[error("row {id} on {shard} does not decode: {source}")]
    Decode {
        /// Row id.
        id: RecordId,
        /// Shard holding the row.
        shard: ShardId,
        /// Decoder error.
        source: serde_json::Error,
    },
}

impl RouterError {
    /// Whether the error leaves the one-shard-per-record invariant in doubt.
    pub fn needs_reconciliation(&self) -> bool {
        matches!(self, RouterError::MigrationFailed(_))
    }
}

/// Step of a shard-key update that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationPhase {
    /// Destination commit failed; the source was rolled back.
    Insert,
    /// Destination committed, source delete did not.
    Cleanup,
    /// A commit was sent but never acknowledged.
    Unknown,
}

impl fmt::Display for MigrationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MigrationPhase::Insert => "insert",
            MigrationPhase::Cleanup => "cleanup",
            MigrationPhase::Unknown => "unknown",
        })
    }
}

/// Failure of a shard-key update whose outcome is not a clean rollback.
///
/// Same-shard updates only fail this way under [`MigrationPhase::Unknown`].
/// `duplicated` is true only when the record is known to be committed in both
/// shards. Under [`MigrationPhase::Unknown`] it is false and the placement
/// must be established by reconciliation.
#[derive(Debug, Clone, thiserror::Error)]
#[error(
    "migration of record {} from {} to {} failed in {phase} phase (duplicated: {duplicated})",
    .plan.record_id, .plan.source, .plan.dest
)]
pub struct MigrationFailure {
    /// The move that was attempted.
    pub plan: MigrationPlan,
    /// Failing step.
    pub phase: MigrationPhase,
    /// Record committed in both shards.
    pub duplicated: bool,
    /// Executor error, absent when the deadline expired.
    #[source]
    pub cause: Option<ExecError>,
}
