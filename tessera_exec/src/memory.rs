//! In-memory shard stores with row locks and fault injection.
//!
//! Each shard owns an ordered table keyed by record id. Transactions stage
//! their writes privately and lock every row they touch; commit applies the
//! staged writes in one step. Faults (unreachable shard, failing commit, lost
//! commit acknowledgement, latency) can be armed per shard.
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tessera_shard::{RecordId, ShardId};
use tracing::debug;

use crate::{ExecError, Outcome, Result, Row, ShardExecutor, ShardTxn, Statement};

type TxnId = u64;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Default)]
struct Faults {
    unavailable: bool,
    failing_commits: u32,
    stalled_commits: u32,
    failing_ops: HashMap<&'static str, u32>,
    latency: Option<Duration>,
}

#[derive(Debug, Default)]
struct ShardState {
    rows: Mutex<BTreeMap<RecordId, Row>>,
    locks: Mutex<HashMap<RecordId, TxnId>>,
    faults: Mutex<Faults>,
    calls: AtomicU64,
}

impl ShardState {
    /// Apply latency and availability faults, then count the call.
    async fn admit(&self, shard: ShardId) -> Result<()> {
        let (unavailable, latency) = {
            let f = lock(&self.faults);
            (f.unavailable, f.latency)
        };
        if let Some(d) = latency {
            tokio::time::sleep(d).await;
        }
        if unavailable {
            return Err(ExecError::ShardUnavailable { shard, reason: "connection refused".into() });
        }
        self.calls.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Consume an armed statement failure for `op`, if any.
    fn take_failure(&self, shard: ShardId, op: &'static str) -> Result<()> {
        let mut f = lock(&self.faults);
        match f.failing_ops.get_mut(op) {
            Some(n) if *n > 0 => {
                *n -= 1;
                Err(ExecError::Statement { shard, reason: format!("injected {op} failure") })
            }
            _ => Ok(()),
        }
    }

    fn lock_row(&self, shard: ShardId, id: RecordId, txn: TxnId) -> Result<()> {
        let mut locks = lock(&self.locks);
        match locks.get(&id) {
            Some(owner) if *owner != txn => Err(ExecError::Statement {
                shard,
                reason: format!("row {id} is locked by another transaction"),
            }),
            Some(_) => Ok(()),
            None => {
                locks.insert(id, txn);
                Ok(())
            }
        }
    }

    fn check_unlocked(&self, shard: ShardId, id: RecordId) -> Result<()> {
        if lock(&self.locks).contains_key(&id) {
            return Err(ExecError::Statement { shard, reason: format!("row {id} is locked by another transaction") });
        }
        Ok(())
    }

    fn release(&self, txn: TxnId) {
        lock(&self.locks).retain(|_, owner| *owner != txn);
    }
}

#[derive(Debug, Default)]
struct Inner {
    shards: HashMap<ShardId, ShardState>,
    next_txn: AtomicU64,
}

impl Inner {
    fn shard(&self, shard: ShardId) -> Result<&ShardState> {
        self.shards
            .get(&shard)
            .ok_or_else(|| ExecError::ShardUnavailable { shard, reason: "no such shard".into() })
    }
}

/// A set of in-memory shards behind the [`ShardExecutor`] interface.
#[derive(Debug, Clone, Default)]
pub struct MemoryExecutor {
    inner: Arc<Inner>,
}

impl MemoryExecutor {
    /// Create empty shards with the given ids.
    pub fn new(shards: &[ShardId]) -> Self {
        let shards = shards.iter().map(|s| (*s, ShardState::default())).collect();
        Self { inner: Arc::new(Inner { shards, next_txn: AtomicU64::new(1) }) }
    }

    /// Shard ids, sorted.
    pub fn shards(&self) -> Vec<ShardId> {
        let mut ids: Vec<_> = self.inner.shards.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Committed rows of a shard in id order.
    pub fn rows(&self, shard: ShardId) -> Vec<Row> {
        self.inner
            .shards
            .get(&shard)
            .map(|s| lock(&s.rows).values().cloned().collect())
            .unwrap_or_default()
    }

    /// Committed row with `id`, if present on `shard`.
    pub fn get(&self, shard: ShardId, id: RecordId) -> Option<Row> {
        self.inner.shards.get(&shard).and_then(|s| lock(&s.rows).get(&id).cloned())
    }

    /// Whether `shard` holds a committed row with `id`.
    pub fn contains(&self, shard: ShardId, id: RecordId) -> bool {
        self.get(shard, id).is_some()
    }

    /// Whether any transaction holds a lock on `id` in `shard`.
    pub fn is_locked(&self, shard: ShardId, id: RecordId) -> bool {
        self.inner.shards.get(&shard).map(|s| lock(&s.locks).contains_key(&id)).unwrap_or(false)
    }

    /// Calls (statements, begins, commits, rollbacks) that reached `shard`.
    pub fn calls(&self, shard: ShardId) -> u64 {
        self.inner.shards.get(&shard).map(|s| s.calls.load(Ordering::Relaxed)).unwrap_or(0)
    }

    /// Make `shard` refuse every call until cleared.
    pub fn set_unavailable(&self, shard: ShardId, unavailable: bool) {
        self.with_faults(shard, |f| f.unavailable = unavailable);
    }

    /// Fail the next commit on `shard`; staged writes are discarded.
    pub fn fail_next_commit(&self, shard: ShardId) {
        self.with_faults(shard, |f| f.failing_commits += 1);
    }

    /// Fail the next statement of kind `op` (see [`Statement::op`]) on `shard`.
    pub fn fail_next_statement(&self, shard: ShardId, op: &'static str) {
        self.with_faults(shard, |f| *f.failing_ops.entry(op).or_default() += 1);
    }

    /// Apply the next commit on `shard` but never acknowledge it.
    pub fn stall_next_commit(&self, shard: ShardId) {
        self.with_faults(shard, |f| f.stalled_commits += 1);
    }

    /// Delay every call to `shard`.
    pub fn set_latency(&self, shard: ShardId, latency: Option<Duration>) {
        self.with_faults(shard, |f| f.latency = latency);
    }

    fn with_faults(&self, shard: ShardId, f: impl FnOnce(&mut Faults)) {
        if let Some(state) = self.inner.shards.get(&shard) {
            f(&mut lock(&state.faults));
        }
    }
}

#[async_trait]
impl ShardExecutor for MemoryExecutor {
    async fn execute(&self, shard: ShardId, stmt: Statement) -> Result<Outcome> {
        let state = self.inner.shard(shard)?;
        state.admit(shard).await?;
        state.take_failure(shard, stmt.op())?;
        debug!(%shard, op = stmt.op(), "execute");
        match stmt {
            Statement::Insert(row) => {
                state.check_unlocked(shard, row.id)?;
                let mut rows = lock(&state.rows);
                if rows.contains_key(&row.id) {
                    return Err(ExecError::Statement { shard, reason: format!("duplicate record id {}", row.id) });
                }
                rows.insert(row.id, row);
                Ok(Outcome::Count(1))
            }
            Statement::SelectAll => Ok(Outcome::Rows(lock(&state.rows).values().cloned().collect())),
            Statement::SelectById { id, .. } => Ok(Outcome::Rows(lock(&state.rows).get(&id).cloned().into_iter().collect())),
            Statement::Update(row) => {
                state.check_unlocked(shard, row.id)?;
                let mut rows = lock(&state.rows);
                match rows.get_mut(&row.id) {
                    Some(slot) => {
                        *slot = row;
                        Ok(Outcome::Count(1))
                    }
                    None => Ok(Outcome::Count(0)),
                }
            }
            Statement::DeleteById(id) => {
                state.check_unlocked(shard, id)?;
                Ok(Outcome::Count(lock(&state.rows).remove(&id).map_or(0, |_| 1)))
            }
        }
    }

    async fn begin(&self, shard: ShardId) -> Result<Box<dyn ShardTxn>> {
        let state = self.inner.shard(shard)?;
        state.admit(shard).await?;
        let txn = self.inner.next_txn.fetch_add(1, Ordering::Relaxed);
        debug!(%shard, txn, "begin");
        Ok(Box::new(MemoryTxn { exec: self.inner.clone(), shard, txn, staged: BTreeMap::new(), open: true }))
    }
}

/// Transaction over one in-memory shard.
#[derive(Debug)]
pub struct MemoryTxn {
    exec: Arc<Inner>,
    shard: ShardId,
    txn: TxnId,
    /// `None` marks a staged delete.
    staged: BTreeMap<RecordId, Option<Row>>,
    open: bool,
}

impl MemoryTxn {
    fn visible(&self, state: &ShardState, id: RecordId) -> Option<Row> {
        match self.staged.get(&id) {
            Some(staged) => staged.clone(),
            None => lock(&state.rows).get(&id).cloned(),
        }
    }

    fn closed(&self) -> ExecError {
        ExecError::Statement { shard: self.shard, reason: "transaction already finished".into() }
    }
}

#[async_trait]
impl ShardTxn for MemoryTxn {
    fn shard(&self) -> ShardId {
        self.shard
    }

    async fn execute(&mut self, stmt: Statement) -> Result<Outcome> {
        if !self.open {
            return Err(self.closed());
        }
        let exec = self.exec.clone();
        let shard = self.shard;
        let state = exec.shard(shard)?;
        state.admit(shard).await?;
        state.take_failure(shard, stmt.op())?;
        debug!(%shard, txn = self.txn, op = stmt.op(), "execute");
        match stmt {
            Statement::Insert(row) => {
                state.lock_row(shard, row.id, self.txn)?;
                if self.visible(state, row.id).is_some() {
                    return Err(ExecError::Statement { shard, reason: format!("duplicate record id {}", row.id) });
                }
                self.staged.insert(row.id, Some(row));
                Ok(Outcome::Count(1))
            }
            Statement::SelectAll => {
                let mut view = lock(&state.rows).clone();
                for (id, staged) in &self.staged {
                    match staged {
                        Some(row) => view.insert(*id, row.clone()),
                        None => view.remove(id),
                    };
                }
                Ok(Outcome::Rows(view.into_values().collect()))
            }
            Statement::SelectById { id, for_update } => {
                if for_update {
                    state.lock_row(shard, id, self.txn)?;
                }
                Ok(Outcome::Rows(self.visible(state, id).into_iter().collect()))
            }
            Statement::Update(row) => {
                state.lock_row(shard, row.id, self.txn)?;
                if self.visible(state, row.id).is_none() {
                    return Ok(Outcome::Count(0));
                }
                self.staged.insert(row.id, Some(row));
                Ok(Outcome::Count(1))
            }
            Statement::DeleteById(id) => {
                state.lock_row(shard, id, self.txn)?;
                if self.visible(state, id).is_none() {
                    return Ok(Outcome::Count(0));
                }
                self.staged.insert(id, None);
                Ok(Outcome::Count(1))
            }
        }
    }

    async fn commit(mut self: Box<Self>) -> Result<()> {
        if !self.open {
            return Err(self.closed());
        }
        let exec = self.exec.clone();
        let shard = self.shard;
        let state = exec.shard(shard)?;
        state.admit(shard).await?;
        let (fail, stall) = {
            let mut f = lock(&state.faults);
            if f.failing_commits > 0 {
                f.failing_commits -= 1;
                (true, false)
            } else if f.stalled_commits > 0 {
                f.stalled_commits -= 1;
                (false, true)
            } else {
                (false, false)
            }
        };
        if fail {
            debug!(%shard, txn = self.txn, "commit failed");
            return Err(ExecError::ShardUnavailable { shard, reason: "connection lost during commit".into() });
        }
        {
            let mut rows = lock(&state.rows);
            for (id, staged) in std::mem::take(&mut self.staged) {
                match staged {
                    Some(row) => rows.insert(id, row),
                    None => rows.remove(&id),
                };
            }
        }
        state.release(self.txn);
        self.open = false;
        debug!(%shard, txn = self.txn, "commit");
        if stall {
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn rollback(mut self: Box<Self>) -> Result<()> {
        if !self.open {
            return Err(self.closed());
        }
        self.staged.clear();
        if let Ok(state) = self.exec.shard(self.shard) {
            state.release(self.txn);
        }
        self.open = false;
        let exec = self.exec.clone();
        exec.shard(self.shard)?.admit(self.shard).await?;
        debug!(shard = %self.shard, txn = self.txn, "rollback");
        Ok(())
    }
}

impl Drop for MemoryTxn {
    fn drop(&mut self) {
        if self.open {
            if let Ok(state) = self.exec.shard(self.shard) {
                state.release(self.txn);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(id: u64, v: i64) -> Row {
        Row { id: RecordId(id), data: json!({ "v": v }) }
    }

    fn exec() -> MemoryExecutor {
        MemoryExecutor::new(&[ShardId(0), ShardId(1)])
    }

    #[tokio::test]
    async fn autocommit_crud() {
        let ex = exec();
        let s = ShardId(0);
        assert_eq!(ex.execute(s, Statement::Insert(row(1, 10))).await.unwrap(), Outcome::Count(1));
        assert!(ex.execute(s, Statement::Insert(row(1, 11))).await.is_err());
        assert_eq!(ex.execute(s, Statement::Update(row(1, 12))).await.unwrap().count(), 1);
        assert_eq!(ex.execute(s, Statement::Update(row(2, 12))).await.unwrap().count(), 0);
        let rows = ex.execute(s, Statement::SelectById { id: RecordId(1), for_update: false }).await.unwrap();
        assert_eq!(rows.into_rows(), vec![row(1, 12)]);
        assert_eq!(ex.execute(s, Statement::DeleteById(RecordId(1))).await.unwrap().count(), 1);
        assert!(ex.rows(s).is_empty());
        assert_eq!(ex.calls(ShardId(1)), 0);
    }

    #[tokio::test]
    async fn txn_writes_invisible_until_commit() {
        let ex = exec();
        let s = ShardId(1);
        let mut txn = ex.begin(s).await.unwrap();
        txn.execute(Statement::Insert(row(5, 1))).await.unwrap();
        assert!(!ex.contains(s, RecordId(5)));
        let seen = txn.execute(Statement::SelectAll).await.unwrap();
        assert_eq!(seen.count(), 1);
        txn.commit().await.unwrap();
        assert!(ex.contains(s, RecordId(5)));
        assert!(!ex.is_locked(s, RecordId(5)));
    }

    #[tokio::test]
    async fn rollback_discards_and_unlocks() {
        let ex = exec();
        let s = ShardId(0);
        ex.execute(s, Statement::Insert(row(1, 1))).await.unwrap();
        let mut txn = ex.begin(s).await.unwrap();
        txn.execute(Statement::DeleteById(RecordId(1))).await.unwrap();
        assert!(ex.is_locked(s, RecordId(1)));
        txn.rollback().await.unwrap();
        assert!(ex.contains(s, RecordId(1)));
        assert!(!ex.is_locked(s, RecordId(1)));
    }

    #[tokio::test]
    async fn row_lock_conflicts() {
        let ex = exec();
        let s = ShardId(0);
        ex.execute(s, Statement::Insert(row(1, 1))).await.unwrap();
        let mut a = ex.begin(s).await.unwrap();
        let mut b = ex.begin(s).await.unwrap();
        a.execute(Statement::SelectById { id: RecordId(1), for_update: true }).await.unwrap();
        let err = b.execute(Statement::SelectById { id: RecordId(1), for_update: true }).await.unwrap_err();
        assert!(matches!(err, ExecError::Statement { .. }));
        assert!(ex.execute(s, Statement::DeleteById(RecordId(1))).await.is_err());
        drop(a);
        b.execute(Statement::SelectById { id: RecordId(1), for_update: true }).await.unwrap();
    }

    #[tokio::test]
    async fn unavailable_shard() {
        let ex = exec();
        ex.set_unavailable(ShardId(1), true);
        let err = ex.execute(ShardId(1), Statement::SelectAll).await.unwrap_err();
        assert_eq!(err.shard(), ShardId(1));
        assert!(err.is_transient());
        assert!(ex.begin(ShardId(1)).await.is_err());
        assert!(ex.execute(ShardId(7), Statement::SelectAll).await.is_err());
    }

    #[tokio::test]
    async fn failed_commit_discards_writes() {
        let ex = exec();
        let s = ShardId(0);
        ex.fail_next_commit(s);
        let mut txn = ex.begin(s).await.unwrap();
        txn.execute(Statement::Insert(row(9, 9))).await.unwrap();
        assert!(txn.commit().await.is_err());
        assert!(!ex.contains(s, RecordId(9)));
        assert!(!ex.is_locked(s, RecordId(9)));
    }

    #[tokio::test]
    async fn stalled_commit_applies_without_ack() {
        let ex = exec();
        let s = ShardId(0);
        ex.stall_next_commit(s);
        let mut txn = ex.begin(s).await.unwrap();
        txn.execute(Statement::Insert(row(3, 3))).await.unwrap();
        let res = tokio::time::timeout(Duration::from_millis(50), txn.commit()).await;
        assert!(res.is_err());
        assert!(ex.contains(s, RecordId(3)));
    }

    #[tokio::test]
    async fn injected_statement_failure_fires_once() {
        let ex = exec();
        let s = ShardId(0);
        ex.execute(s, Statement::Insert(row(4, 4))).await.unwrap();
        ex.fail_next_statement(s, "delete");
        let mut txn = ex.begin(s).await.unwrap();
        let err = txn.execute(Statement::DeleteById(RecordId(4))).await.unwrap_err();
        assert!(matches!(err, ExecError::Statement { shard: ShardId(0), .. }));
        txn.execute(Statement::DeleteById(RecordId(4))).await.unwrap();
        txn.rollback().await.unwrap();
        assert!(ex.contains(s, RecordId(4)));
    }
}
