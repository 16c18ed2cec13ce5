//! Sharding router: routed point operations and scatter-gather scans.
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tessera_exec::{ExecError, Outcome, ShardExecutor, Statement};
use tessera_keygen::IdGenerator;
use tessera_shard::{RecordId, ShardDirectory, ShardId};
use tracing::{debug, instrument, warn};

use crate::deadline::Deadline;
use crate::error::{Result, RouterError};
use crate::metrics::{ROUTED_STATEMENTS_TOTAL, SCATTER_LATENCY_SECS};
use crate::migration::{MigrationCoordinator, Relocation};
use crate::record::{decode, encode, Record};

/// Router settings.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Deadline for one router operation, in milliseconds. Unbounded if unset.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl RouterConfig {
    /// Deadline as a duration.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

/// Outcome of a best-effort scan.
#[derive(Debug)]
pub struct ScanReport<R> {
    /// Records from the shards that answered.
    pub records: Vec<R>,
    /// Shards that answered.
    pub succeeded: Vec<ShardId>,
    /// Shards that failed.
    pub failed: Vec<ExecError>,
}

impl<R> ScanReport<R> {
    /// Whether every shard answered.
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

type ShardResults = Vec<(ShardId, tessera_exec::Result<Outcome>)>;

/// Routes single-record operations of one logical table onto its shards.
///
/// Collaborators are passed in explicitly: the directory decides placement,
/// the executor reaches the stores and the id generator assigns record ids.
pub struct ShardingRouter<R> {
    directory: Arc<ShardDirectory>,
    executor: Arc<dyn ShardExecutor>,
    ids: Arc<dyn IdGenerator>,
    timeout: Option<Duration>,
    _record: PhantomData<fn() -> R>,
}

impl<R> Clone for ShardingRouter<R> {
    fn clone(&self) -> Self {
        Self {
            directory: self.directory.clone(),
            executor: self.executor.clone(),
            ids: self.ids.clone(),
            timeout: self.timeout,
            _record: PhantomData,
        }
    }
}

impl<R: Record> ShardingRouter<R> {
    /// Create a router without an operation deadline.
    pub fn new(directory: Arc<ShardDirectory>, executor: Arc<dyn ShardExecutor>, ids: Arc<dyn IdGenerator>) -> Self {
        Self { directory, executor, ids, timeout: None, _record: PhantomData }
    }

    /// Apply router settings.
    pub fn with_config(self, cfg: &RouterConfig) -> Self {
        self.with_timeout(cfg.timeout())
    }

    /// Bound every operation by `timeout`. On expiry in-flight shard calls are
    /// dropped and open transactions rolled back.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// The topology this router routes over.
    pub fn directory(&self) -> &ShardDirectory {
        &self.directory
    }

    /// Shard owning `key`.
    pub fn shard_of(&self, key: &R::Key) -> Result<ShardId> {
        Ok(self.directory.resolve(&key.clone().into())?)
    }

    /// Coordinator for shard-key updates over this router's topology.
    pub fn coordinator(&self) -> MigrationCoordinator<'_> {
        MigrationCoordinator::new(&self.directory, self.executor.as_ref(), self.timeout)
    }

    /// Insert a record into the shard owning its key, assigning an id if it
    /// has none. The id is written back into `record` once the shard has
    /// accepted the row; a failed insert leaves `record` untouched.
    #[instrument(skip(self, record), fields(shard))]
    pub async fn insert(&self, record: &mut R) -> Result<RecordId> {
        let shard = self.directory.resolve(&record.shard_key().into())?;
        tracing::Span::current().record("shard", tracing::field::display(shard));
        let id = record.record_id().unwrap_or_else(|| self.ids.next_id());
        let row = encode(id, record)?;
        self.routed(shard, Statement::Insert(row)).await?;
        record.set_record_id(id);
        debug!(%id, %shard, "inserted");
        Ok(id)
    }

    /// Every record of every shard. Fails as a whole if any shard fails.
    ///
    /// Rows keep their order within a shard; the order between shards is not
    /// specified.
    #[instrument(skip(self))]
    pub async fn find_all(&self) -> Result<Vec<R>> {
        let results = self.scatter(Statement::SelectAll).await?;
        let mut records = Vec::new();
        for (shard, outcome) in gather(results)? {
            for row in outcome.into_rows() {
                records.push(decode(shard, row)?);
            }
        }
        Ok(records)
    }

    /// [`find_all`](Self::find_all) merged into a total order by `sort_key`.
    pub async fn find_all_sorted_by<K, F>(&self, sort_key: F) -> Result<Vec<R>>
    where
        K: Ord,
        F: FnMut(&R) -> K,
    {
        let mut records = self.find_all().await?;
        records.sort_by_key(sort_key);
        Ok(records)
    }

    /// Scan that returns what the healthy shards hold alongside the failures.
    #[instrument(skip(self))]
    pub async fn find_all_best_effort(&self) -> Result<ScanReport<R>> {
        let results = self.scatter(Statement::SelectAll).await?;
        let mut report = ScanReport { records: Vec::new(), succeeded: Vec::new(), failed: Vec::new() };
        for (shard, res) in results {
            match res {
                Ok(outcome) => {
                    report.succeeded.push(shard);
                    for row in outcome.into_rows() {
                        report.records.push(decode(shard, row)?);
                    }
                }
                Err(e) => {
                    warn!(%shard, error = %e, "shard skipped in best-effort scan");
                    report.failed.push(e);
                }
            }
        }
        Ok(report)
    }

    /// Look a record up by id alone.
    ///
    /// Ids carry no placement, so the lookup is sent to every shard and the
    /// first hit in topology order wins. Use [`query_by_key`](Self::query_by_key)
    /// when the current shard key is known.
    #[instrument(skip(self))]
    pub async fn query_by_id(&self, id: RecordId) -> Result<Option<R>> {
        let results = self.scatter(Statement::SelectById { id, for_update: false }).await?;
        let mut hits = Vec::new();
        for (shard, outcome) in gather(results)? {
            hits.extend(outcome.into_rows().into_iter().map(|row| (shard, row)));
        }
        if hits.len() > 1 {
            let shards: Vec<String> = hits.iter().map(|(s, _)| s.to_string()).collect();
            warn!(%id, shards = ?shards, "record present in more than one shard");
        }
        match hits.into_iter().next() {
            Some((shard, row)) => Ok(Some(decode(shard, row)?)),
            None => Ok(None),
        }
    }

    /// Look a record up in the shard owning `key`.
    #[instrument(skip(self))]
    pub async fn query_by_key(&self, id: RecordId, key: &R::Key) -> Result<Option<R>> {
        let shard = self.shard_of(key)?;
        let rows = self.routed(shard, Statement::SelectById { id, for_update: false }).await?.into_rows();
        rows.into_iter().next().map(|row| decode(shard, row)).transpose()
    }

    /// Overwrite a record in place, in the shard owning its current key.
    ///
    /// This never moves a record; use [`update_shard_key`](Self::update_shard_key)
    /// to change the key across shards.
    #[instrument(skip(self, record))]
    pub async fn update(&self, record: &R) -> Result<()> {
        let id = record.record_id().ok_or(RouterError::MissingRecordId)?;
        let shard = self.directory.resolve(&record.shard_key().into())?;
        let row = encode(id, record)?;
        match self.routed(shard, Statement::Update(row)).await?.count() {
            0 => Err(RouterError::RecordNotFound { id }),
            _ => Ok(()),
        }
    }

    /// Delete a record from the shard owning `key`.
    #[instrument(skip(self))]
    pub async fn delete(&self, id: RecordId, key: &R::Key) -> Result<()> {
        let shard = self.shard_of(key)?;
        match self.routed(shard, Statement::DeleteById(id)).await?.count() {
            0 => Err(RouterError::RecordNotFound { id }),
            _ => Ok(()),
        }
    }

    /// Change a record's shard key, moving it to another shard if the new key
    /// resolves elsewhere. See [`MigrationCoordinator`].
    #[instrument(skip(self))]
    pub async fn update_shard_key(&self, id: RecordId, old_key: R::Key, new_key: R::Key) -> Result<Relocation> {
        self.coordinator().migrate::<R>(id, old_key, new_key).await
    }

    /// Execute one statement on one shard within the operation deadline.
    pub(crate) async fn routed(&self, shard: ShardId, stmt: Statement) -> Result<Outcome> {
        let op = stmt.op();
        ROUTED_STATEMENTS_TOTAL.with_label_values(&[op]).inc();
        debug!(%shard, op, "routed");
        Ok(Deadline::after(self.timeout).run(op, self.executor.execute(shard, stmt)).await??)
    }

    /// Send the same statement to every shard concurrently.
    pub(crate) async fn scatter(&self, stmt: Statement) -> Result<ShardResults> {
        let op = stmt.op();
        let started = Instant::now();
        let calls = self.directory.shards().iter().map(|&shard| {
            let stmt = stmt.clone();
            ROUTED_STATEMENTS_TOTAL.with_label_values(&[op]).inc();
            async move { (shard, self.executor.execute(shard, stmt).await) }
        });
        let results = Deadline::after(self.timeout).run(op, join_all(calls)).await?;
        SCATTER_LATENCY_SECS.observe(started.elapsed().as_secs_f64());
        debug!(op, shards = results.len(), "scatter complete");
        Ok(results)
    }
}

/// Keep successes only if every shard succeeded.
fn gather(results: ShardResults) -> Result<Vec<(ShardId, Outcome)>> {
    let mut ok = Vec::with_capacity(results.len());
    let mut failed = Vec::new();
    for (shard, res) in results {
        match res {
            Ok(outcome) => ok.push((shard, outcome)),
            Err(e) => failed.push(e),
        }
    }
    if failed.is_empty() {
        Ok(ok)
    } else {
        let succeeded = ok.into_iter().map(|(s, _)| s).collect();
        Err(RouterError::PartialScanFailure { succeeded, failed })
    }
}
