//! Key migration: moving a record whose shard key changed.
//!
//! The two shards cannot share a transaction, so a move is an insert into the
//! destination followed by a delete from the source, each in its own shard
//! transaction:
//!
//! ```text
//! source: BEGIN, SELECT .. FOR UPDATE                       DELETE, COMMIT
//! dest:   BEGIN,                       INSERT, COMMIT
//! ```
//!
//! The destination always commits first. Losing the source row before the
//! destination holds a copy cannot be undone; a leftover source copy can.
//! The source row stays locked for the whole window, so a concurrent move of
//! the same record fails instead of interleaving.
use std::time::Duration;

use serde::Serialize;
use tessera_exec::{ExecError, ShardExecutor, ShardTxn, Statement};
use tessera_shard::{RecordId, ShardDirectory, ShardId, ShardKey};
use tracing::{error, info, warn};

use crate::deadline::Deadline;
use crate::error::{MigrationFailure, MigrationPhase, Result, RouterError};
use crate::metrics::RELOCATIONS_TOTAL;
use crate::record::{decode, encode, Record};

/// One planned move, valid for a single call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationPlan {
    /// Record being moved.
    pub record_id: RecordId,
    /// Shard owning the old key.
    pub source: ShardId,
    /// Shard owning the new key.
    pub dest: ShardId,
    /// Key before the update.
    pub old_key: ShardKey,
    /// Key after the update.
    pub new_key: ShardKey,
}

impl MigrationPlan {
    /// Whether old and new key resolve to the same shard.
    pub fn is_local(&self) -> bool {
        self.source == self.dest
    }
}

/// Where a record lives after a shard-key update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Relocation {
    /// Record id, unchanged.
    pub record_id: RecordId,
    /// Shard now holding the record.
    pub shard: ShardId,
    /// Whether the record changed shard.
    pub moved: bool,
}

/// Runs shard-key updates for one router.
pub struct MigrationCoordinator<'a> {
    directory: &'a ShardDirectory,
    executor: &'a dyn ShardExecutor,
    timeout: Option<Duration>,
}

impl<'a> MigrationCoordinator<'a> {
    pub(crate) fn new(directory: &'a ShardDirectory, executor: &'a dyn ShardExecutor, timeout: Option<Duration>) -> Self {
        Self { directory, executor, timeout }
    }

    /// Resolve both keys into a plan.
    pub fn plan(&self, record_id: RecordId, old_key: ShardKey, new_key: ShardKey) -> Result<MigrationPlan> {
        let source = self.directory.resolve(&old_key)?;
        let dest = self.directory.resolve(&new_key)?;
        Ok(MigrationPlan { record_id, source, dest, old_key, new_key })
    }

    /// Replace the shard key of `record_id`, moving the record when the new key
    /// resolves to another shard.
    pub async fn migrate<R: Record>(&self, record_id: RecordId, old_key: R::Key, new_key: R::Key) -> Result<Relocation> {
        let plan = self.plan(record_id, old_key.clone().into(), new_key.clone().into())?;
        let deadline = Deadline::after(self.timeout);
        if plan.is_local() {
            self.update_in_place::<R>(&plan, &old_key, new_key, deadline).await
        } else {
            self.relocate::<R>(plan, &old_key, new_key, deadline).await
        }
    }

    async fn update_in_place<R: Record>(
        &self,
        plan: &MigrationPlan,
        old_key: &R::Key,
        new_key: R::Key,
        deadline: Deadline,
    ) -> Result<Relocation> {
        let mut txn = deadline.run("begin", self.executor.begin(plan.source)).await??;
        let staged = deadline
            .run("update", async {
                let mut record = read_for_update::<R>(&mut txn, plan, old_key).await?;
                record.set_shard_key(new_key);
                let row = encode(plan.record_id, &record)?;
                txn.execute(Statement::Update(row)).await?;
                Ok::<_, RouterError>(())
            })
            .await
            .and_then(|r| r);
        if let Err(e) = staged {
            self.abort(txn).await;
            return Err(e);
        }
        match deadline.run("commit", txn.commit()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                RELOCATIONS_TOTAL.with_label_values(&["aborted"]).inc();
                return Err(e.into());
            }
            // Commit was sent; whether it applied is unknown.
            Err(_) => return Err(self.failed(plan.clone(), MigrationPhase::Unknown, false, None)),
        }
        RELOCATIONS_TOTAL.with_label_values(&["in_place"]).inc();
        info!(record_id = %plan.record_id, shard = %plan.source, "shard key updated in place");
        Ok(Relocation { record_id: plan.record_id, shard: plan.source, moved: false })
    }

    async fn relocate<R: Record>(
        &self,
        plan: MigrationPlan,
        old_key: &R::Key,
        new_key: R::Key,
        deadline: Deadline,
    ) -> Result<Relocation> {
        let mut source = deadline.run("begin", self.executor.begin(plan.source)).await??;
        let mut dest = match deadline.run("begin", self.executor.begin(plan.dest)).await {
            Ok(Ok(txn)) => txn,
            Ok(Err(e)) => {
                self.abort(source).await;
                return Err(e.into());
            }
            Err(e) => {
                self.abort(source).await;
                return Err(e);
            }
        };

        // Read the source row under lock and stage the copy in the destination.
        let staged = deadline
            .run("stage", async {
                let mut record = read_for_update::<R>(&mut source, &plan, old_key).await?;
                record.set_shard_key(new_key);
                let row = encode(plan.record_id, &record)?;
                dest.execute(Statement::Insert(row)).await?;
                Ok::<_, RouterError>(())
            })
            .await
            .and_then(|r| r);
        if let Err(e) = staged {
            self.abort(source).await;
            self.abort(dest).await;
            RELOCATIONS_TOTAL.with_label_values(&["aborted"]).inc();
            return Err(e);
        }

        match deadline.run("commit", dest.commit()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                self.abort(source).await;
                return Err(self.failed(plan, MigrationPhase::Insert, false, Some(e)));
            }
            Err(_) => {
                self.abort(source).await;
                return Err(self.failed(plan, MigrationPhase::Unknown, false, None));
            }
        }

        // Destination committed: cleanup runs on a fresh budget.
        let cleanup = Deadline::after(self.timeout);
        match cleanup.run("delete", source.execute(Statement::DeleteById(plan.record_id))).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                self.abort(source).await;
                return Err(self.failed(plan, MigrationPhase::Cleanup, true, Some(e)));
            }
            Err(_) => {
                self.abort(source).await;
                return Err(self.failed(plan, MigrationPhase::Cleanup, true, None));
            }
        }
        match cleanup.run("commit", source.commit()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(self.failed(plan, MigrationPhase::Cleanup, true, Some(e))),
            Err(_) => return Err(self.failed(plan, MigrationPhase::Unknown, false, None)),
        }

        RELOCATIONS_TOTAL.with_label_values(&["moved"]).inc();
        info!(record_id = %plan.record_id, source = %plan.source, dest = %plan.dest, "record relocated");
        Ok(Relocation { record_id: plan.record_id, shard: plan.dest, moved: true })
    }

    /// Finish or settle a failed move after the fact.
    ///
    /// If the destination holds the record under the new key, any source copy
    /// is deleted and the move counts as done. If the destination does not
    /// hold it, the move never happened and the source copy stays. A
    /// same-shard plan has a single copy; nothing is deleted.
    pub async fn complete<R: Record>(&self, plan: &MigrationPlan) -> Result<Relocation> {
        let deadline = Deadline::after(self.timeout);
        let lookup = Statement::SelectById { id: plan.record_id, for_update: false };
        let dest_rows = deadline.run("select_by_id", self.executor.execute(plan.dest, lookup)).await??.into_rows();
        let landed = match dest_rows.into_iter().next() {
            Some(row) => {
                let record: R = decode(plan.dest, row)?;
                let key: ShardKey = record.shard_key().into();
                key == plan.new_key
            }
            None => false,
        };
        if plan.is_local() {
            info!(record_id = %plan.record_id, shard = %plan.source, landed, "in-place update settled");
            return Ok(Relocation { record_id: plan.record_id, shard: plan.source, moved: false });
        }
        if !landed {
            info!(record_id = %plan.record_id, shard = %plan.source, "move never landed; source copy kept");
            return Ok(Relocation { record_id: plan.record_id, shard: plan.source, moved: false });
        }
        let removed = deadline
            .run("delete", self.executor.execute(plan.source, Statement::DeleteById(plan.record_id)))
            .await??
            .count();
        info!(record_id = %plan.record_id, source = %plan.source, dest = %plan.dest, removed, "move completed");
        RELOCATIONS_TOTAL.with_label_values(&["completed"]).inc();
        Ok(Relocation { record_id: plan.record_id, shard: plan.dest, moved: true })
    }

    async fn abort(&self, txn: Box<dyn ShardTxn>) {
        let shard = txn.shard();
        match Deadline::after(self.timeout).run("rollback", txn.rollback()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(%shard, error = %e, "rollback failed"),
            Err(e) => warn!(%shard, error = %e, "rollback timed out"),
        }
    }

    fn failed(&self, plan: MigrationPlan, phase: MigrationPhase, duplicated: bool, cause: Option<ExecError>) -> RouterError {
        let outcome = match phase {
            MigrationPhase::Insert => "failed_insert",
            MigrationPhase::Cleanup => "failed_cleanup",
            MigrationPhase::Unknown => "failed_unknown",
        };
        RELOCATIONS_TOTAL.with_label_values(&[outcome]).inc();
        error!(
            record_id = %plan.record_id,
            source = %plan.source,
            dest = %plan.dest,
            %phase,
            duplicated,
            cause = ?cause,
            "MIGRATION FAILED, reconciliation required"
        );
        RouterError::MigrationFailed(MigrationFailure { plan, phase, duplicated, cause })
    }
}

/// Read and lock the source row, checking it still carries `old_key`.
async fn read_for_update<R: Record>(txn: &mut Box<dyn ShardTxn>, plan: &MigrationPlan, old_key: &R::Key) -> Result<R> {
    let shard = txn.shard();
    let rows = txn
        .execute(Statement::SelectById { id: plan.record_id, for_update: true })
        .await?
        .into_rows();
    let row = rows.into_iter().next().ok_or(RouterError::RecordNotFound { id: plan.record_id })?;
    let record: R = decode(shard, row)?;
    let stored = record.shard_key();
    if &stored != old_key {
        return Err(RouterError::StaleShardKey {
            id: plan.record_id,
            expected: old_key.clone().into(),
            stored: stored.into(),
        });
    }
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::{account, setup};
    use tessera_exec::MemoryExecutor;

    #[tokio::test]
    async fn moves_record_between_shards() {
        let (router, exec) = setup(2);
        let mut a = account(4, "four");
        let id = router.insert(&mut a).await.unwrap();
        assert!(exec.contains(ShardId(0), id));

        let moved = router.update_shard_key(id, 4, 5).await.unwrap();
        assert_eq!(moved, Relocation { record_id: id, shard: ShardId(1), moved: true });
        assert!(exec.contains(ShardId(1), id));
        assert!(!exec.contains(ShardId(0), id));
        assert!(!exec.is_locked(ShardId(0), id));

        let found = router.query_by_id(id).await.unwrap().unwrap();
        assert_eq!(found.user_id, 5);
        assert_eq!(found.name, "four");
        assert!(router.reconcile().await.unwrap().is_clean());
    }

    #[tokio::test]
    async fn same_shard_update_stays_in_place() {
        let (router, exec) = setup(2);
        let mut a = account(2, "two");
        let id = router.insert(&mut a).await.unwrap();
        let other_before = exec.calls(ShardId(1));

        let res = router.update_shard_key(id, 2, 6).await.unwrap();
        assert_eq!(res, Relocation { record_id: id, shard: ShardId(0), moved: false });
        assert_eq!(exec.calls(ShardId(1)), other_before);
        assert_eq!(router.query_by_key(id, &6).await.unwrap().unwrap().user_id, 6);
    }

    #[tokio::test]
    async fn failed_destination_commit_leaves_source_untouched() {
        let (router, exec) = setup(2);
        let mut a = account(4, "keep");
        let id = router.insert(&mut a).await.unwrap();
        exec.fail_next_commit(ShardId(1));

        match router.update_shard_key(id, 4, 5).await.unwrap_err() {
            RouterError::MigrationFailed(f) => {
                assert_eq!(f.phase, MigrationPhase::Insert);
                assert!(!f.duplicated);
                assert_eq!(f.cause.map(|e| e.shard()), Some(ShardId(1)));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(!exec.contains(ShardId(1), id));
        assert!(!exec.is_locked(ShardId(0), id));
        let kept = router.query_by_id(id).await.unwrap().unwrap();
        assert_eq!(kept, a);
    }

    #[tokio::test]
    async fn failed_source_commit_reports_duplicate() {
        let (router, exec) = setup(2);
        let mut a = account(4, "twice");
        let id = router.insert(&mut a).await.unwrap();
        exec.fail_next_commit(ShardId(0));

        let err = router.update_shard_key(id, 4, 5).await.unwrap_err();
        assert!(err.needs_reconciliation());
        let failure = match err {
            RouterError::MigrationFailed(f) => f,
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(failure.phase, MigrationPhase::Cleanup);
        assert!(failure.duplicated);

        let report = router.reconcile().await.unwrap();
        assert_eq!(report.duplicates.len(), 1);
        assert_eq!(report.duplicates[0].record_id, id);
        let shards: Vec<_> = report.duplicates[0].copies.iter().map(|(s, _)| *s).collect();
        assert_eq!(shards, vec![ShardId(0), ShardId(1)]);

        let settled = router.complete_migration(&failure.plan).await.unwrap();
        assert_eq!(settled.shard, ShardId(1));
        assert!(!exec.contains(ShardId(0), id));
        assert!(router.reconcile().await.unwrap().is_clean());
    }

    #[tokio::test]
    async fn lost_commit_ack_is_unknown() {
        let exec = MemoryExecutor::new(&[ShardId(0), ShardId(1)]);
        let (router, _) = crate::testkit::setup_with(exec.clone());
        let router = router.with_timeout(Some(Duration::from_millis(100)));
        let mut a = account(4, "limbo");
        let id = router.insert(&mut a).await.unwrap();
        exec.stall_next_commit(ShardId(1));

        match router.update_shard_key(id, 4, 5).await.unwrap_err() {
            RouterError::MigrationFailed(f) => {
                assert_eq!(f.phase, MigrationPhase::Unknown);
                assert!(f.cause.is_none());
                let settled = router.complete_migration(&f.plan).await.unwrap();
                assert!(settled.moved);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(exec.contains(ShardId(1), id));
        assert!(!exec.contains(ShardId(0), id));
        assert!(!exec.is_locked(ShardId(0), id));
    }

    #[tokio::test]
    async fn lost_commit_ack_in_place_is_unknown() {
        let exec = MemoryExecutor::new(&[ShardId(0), ShardId(1)]);
        let (router, _) = crate::testkit::setup_with(exec.clone());
        let router = router.with_timeout(Some(Duration::from_millis(100)));
        let mut a = account(2, "limbo");
        let id = router.insert(&mut a).await.unwrap();
        exec.stall_next_commit(ShardId(0));

        let err = router.update_shard_key(id, 2, 6).await.unwrap_err();
        assert!(err.needs_reconciliation());
        match err {
            RouterError::MigrationFailed(f) => {
                assert_eq!(f.phase, MigrationPhase::Unknown);
                assert!(!f.duplicated);
                assert!(f.plan.is_local());
                let settled = router.complete_migration(&f.plan).await.unwrap();
                assert_eq!(settled, Relocation { record_id: id, shard: ShardId(0), moved: false });
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(router.query_by_key(id, &6).await.unwrap().unwrap().user_id, 6);
        assert!(!exec.is_locked(ShardId(0), id));
    }

    #[tokio::test]
    async fn failed_in_place_commit_keeps_old_key() {
        let (router, exec) = setup(2);
        let mut a = account(2, "same");
        let id = router.insert(&mut a).await.unwrap();
        exec.fail_next_commit(ShardId(0));

        let err = router.update_shard_key(id, 2, 6).await.unwrap_err();
        assert!(matches!(err, RouterError::Shard(ExecError::ShardUnavailable { shard: ShardId(0), .. })));
        assert!(!err.needs_reconciliation());
        assert_eq!(router.query_by_id(id).await.unwrap().unwrap(), a);
        assert!(!exec.is_locked(ShardId(0), id));
        router.update_shard_key(id, 2, 6).await.unwrap();
    }

    #[tokio::test]
    async fn failed_source_delete_reports_duplicate() {
        let (router, exec) = setup(2);
        let mut a = account(4, "stuck");
        let id = router.insert(&mut a).await.unwrap();
        exec.fail_next_statement(ShardId(0), "delete");

        let failure = match router.update_shard_key(id, 4, 5).await.unwrap_err() {
            RouterError::MigrationFailed(f) => f,
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(failure.phase, MigrationPhase::Cleanup);
        assert!(failure.duplicated);
        assert_eq!(failure.cause.as_ref().map(|e| e.shard()), Some(ShardId(0)));
        assert!(exec.contains(ShardId(0), id));
        assert!(exec.contains(ShardId(1), id));
        assert!(!exec.is_locked(ShardId(0), id));

        router.complete_migration(&failure.plan).await.unwrap();
        assert!(!exec.contains(ShardId(0), id));
        assert!(router.reconcile().await.unwrap().is_clean());
    }

    #[tokio::test]
    async fn complete_keeps_source_when_move_never_landed() {
        let (router, exec) = setup(2);
        let mut a = account(4, "stay");
        let id = router.insert(&mut a).await.unwrap();
        exec.fail_next_commit(ShardId(1));
        let plan = match router.update_shard_key(id, 4, 5).await.unwrap_err() {
            RouterError::MigrationFailed(f) => f.plan,
            other => panic!("unexpected {other:?}"),
        };
        let settled = router.complete_migration(&plan).await.unwrap();
        assert_eq!(settled, Relocation { record_id: id, shard: ShardId(0), moved: false });
        assert!(exec.contains(ShardId(0), id));
    }

    #[tokio::test]
    async fn missing_record_is_not_found() {
        let (router, exec) = setup(2);
        let err = router.update_shard_key(RecordId(99), 4, 5).await.unwrap_err();
        assert!(matches!(err, RouterError::RecordNotFound { id: RecordId(99) }));
        assert!(!exec.is_locked(ShardId(0), RecordId(99)));
        assert!(exec.rows(ShardId(1)).is_empty());
    }

    #[tokio::test]
    async fn stale_old_key_moves_nothing() {
        let (router, exec) = setup(2);
        let mut a = account(4, "stale");
        let id = router.insert(&mut a).await.unwrap();
        let err = router.update_shard_key(id, 6, 7).await.unwrap_err();
        assert!(matches!(err, RouterError::StaleShardKey { .. }));
        assert!(exec.contains(ShardId(0), id));
        assert!(!exec.contains(ShardId(1), id));
    }

    #[tokio::test]
    async fn unroutable_new_key() {
        let (router, exec) = setup(2);
        let mut a = account(4, "x");
        let id = router.insert(&mut a).await.unwrap();
        assert!(matches!(router.update_shard_key(id, 4, -1).await, Err(RouterError::UnroutableKey(_))));
        assert!(exec.contains(ShardId(0), id));
    }

    #[tokio::test]
    async fn destination_down_aborts_cleanly() {
        let (router, exec) = setup(2);
        let mut a = account(4, "x");
        let id = router.insert(&mut a).await.unwrap();
        exec.set_unavailable(ShardId(1), true);
        let err = router.update_shard_key(id, 4, 5).await.unwrap_err();
        assert!(matches!(err, RouterError::Shard(ExecError::ShardUnavailable { shard: ShardId(1), .. })));
        assert!(!exec.is_locked(ShardId(0), id));
        exec.set_unavailable(ShardId(1), false);
        router.update_shard_key(id, 4, 5).await.unwrap();
    }

    #[tokio::test]
    async fn concurrent_move_of_a_locked_record_fails() {
        let (router, exec) = setup(2);
        let mut a = account(4, "busy");
        let id = router.insert(&mut a).await.unwrap();
        let mut holder = exec.begin(ShardId(0)).await.unwrap();
        holder.execute(Statement::SelectById { id, for_update: true }).await.unwrap();

        let err = router.update_shard_key(id, 4, 5).await.unwrap_err();
        assert!(matches!(err, RouterError::Shard(ExecError::Statement { shard: ShardId(0), .. })));
        assert!(!exec.contains(ShardId(1), id));
        holder.rollback().await.unwrap();
        router.update_shard_key(id, 4, 5).await.unwrap();
    }

    #[tokio::test]
    async fn slow_destination_times_out_and_rolls_back() {
        let exec = MemoryExecutor::new(&[ShardId(0), ShardId(1)]);
        let (router, _) = crate::testkit::setup_with(exec.clone());
        let mut a = account(4, "slow");
        let id = router.insert(&mut a).await.unwrap();
        let router = router.with_timeout(Some(Duration::from_millis(100)));
        exec.set_latency(ShardId(1), Some(Duration::from_millis(300)));

        let err = router.update_shard_key(id, 4, 5).await.unwrap_err();
        assert!(matches!(err, RouterError::Timeout { .. }));
        exec.set_latency(ShardId(1), None);
        assert!(exec.contains(ShardId(0), id));
        assert!(!exec.contains(ShardId(1), id));
        assert!(!exec.is_locked(ShardId(0), id));
    }

    #[test]
    fn plan_resolves_both_keys() {
        let dir = ShardDirectory::modulo(2).unwrap();
        let exec = MemoryExecutor::new(&[ShardId(0), ShardId(1)]);
        let coord = MigrationCoordinator::new(&dir, &exec, None);
        let plan = coord.plan(RecordId(1), ShardKey::Int(4), ShardKey::Int(5)).unwrap();
        assert_eq!((plan.source, plan.dest), (ShardId(0), ShardId(1)));
        assert!(!plan.is_local());
        assert!(coord.plan(RecordId(1), ShardKey::Int(4), ShardKey::Int(8)).unwrap().is_local());
    }
}
