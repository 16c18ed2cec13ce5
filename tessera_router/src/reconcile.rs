//! Placement audit across all shards.
use std::collections::BTreeMap;

use serde::Serialize;
use tessera_exec::Statement;
use tessera_shard::{RecordId, ShardId, ShardKey};
use tracing::{info, instrument, warn};

use crate::error::{Result, RouterError};
use crate::migration::{MigrationPlan, Relocation};
use crate::record::{decode, Record};
use crate::router::ShardingRouter;

/// A record id found in more than one shard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Duplicate {
    /// Record id.
    pub record_id: RecordId,
    /// Every copy with the key it carries, in topology order.
    pub copies: Vec<(ShardId, ShardKey)>,
}

/// A record stored outside the shard its key resolves to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Misplaced {
    /// Record id.
    pub record_id: RecordId,
    /// Shard holding the copy.
    pub found: ShardId,
    /// Key carried by the copy.
    pub key: ShardKey,
    /// Shard the key resolves to; `None` if the key is unroutable.
    pub expected: Option<ShardId>,
}

/// Result of a full placement scan.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileReport {
    /// Rows scanned over all shards.
    pub scanned: usize,
    /// Ids present in more than one shard.
    pub duplicates: Vec<Duplicate>,
    /// Copies outside their resolved shard.
    pub misplaced: Vec<Misplaced>,
}

impl ReconcileReport {
    /// Every record lives in exactly the shard its key resolves to.
    pub fn is_clean(&self) -> bool {
        self.duplicates.is_empty() && self.misplaced.is_empty()
    }
}

impl<R: Record> ShardingRouter<R> {
    /// Scan every shard and report records that break the one-shard rule.
    ///
    /// Needs every shard to answer; a partial view could hide duplicates.
    #[instrument(skip(self))]
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        let results = self.scatter(Statement::SelectAll).await?;
        let mut report = ReconcileReport::default();
        let mut copies: BTreeMap<RecordId, Vec<(ShardId, ShardKey)>> = BTreeMap::new();
        let mut failed = Vec::new();
        let mut succeeded = Vec::new();
        for (shard, res) in results {
            let outcome = match res {
                Ok(outcome) => outcome,
                Err(e) => {
                    failed.push(e);
                    continue;
                }
            };
            succeeded.push(shard);
            for row in outcome.into_rows() {
                report.scanned += 1;
                let id = row.id;
                let record: R = decode(shard, row)?;
                let key: ShardKey = record.shard_key().into();
                let expected = self.directory().resolve(&key).ok();
                if expected != Some(shard) {
                    report.misplaced.push(Misplaced { record_id: id, found: shard, key: key.clone(), expected });
                }
                copies.entry(id).or_default().push((shard, key));
            }
        }
        if !failed.is_empty() {
            return Err(RouterError::PartialScanFailure { succeeded, failed });
        }
        report.duplicates = copies
            .into_iter()
            .filter(|(_, c)| c.len() > 1)
            .map(|(record_id, copies)| Duplicate { record_id, copies })
            .collect();
        if report.is_clean() {
            info!(scanned = report.scanned, "placement clean");
        } else {
            warn!(
                scanned = report.scanned,
                duplicates = report.duplicates.len(),
                misplaced = report.misplaced.len(),
                "placement violations found"
            );
        }
        Ok(report)
    }

    /// Settle a move reported as failed: delete the source copy if the
    /// destination holds the record under the new key, otherwise keep it.
    #[instrument(skip(self))]
    pub async fn complete_migration(&self, plan: &MigrationPlan) -> Result<Relocation> {
        self.coordinator().complete::<R>(plan).await
    }
}
