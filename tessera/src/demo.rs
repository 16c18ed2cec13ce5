//! User and health-record services over the sharded tables, and the scripted
//! demo run by `tessera demo`.
use serde::Serialize;
use tessera_router::{ReconcileReport, Relocation, Result, ShardingRouter};
use tessera_shard::{RecordId, ShardId};
use tracing::{info, instrument};

use crate::cluster::Cluster;
use crate::entity::{HealthRecord, HealthTask, User};

/// Users seeded by [`HealthService::process_health_records`]: `0..=10`.
pub const SEED_USERS: i64 = 11;

/// Users seeded by [`UserService::process_users`]: `0..=5`.
pub const SEED_ACCOUNTS: i64 = 6;

/// The user table.
#[derive(Clone)]
pub struct UserService {
    users: ShardingRouter<User>,
}

impl UserService {
    /// Service over the user table of `cluster`.
    pub fn new(cluster: &Cluster) -> Self {
        Self { users: cluster.router() }
    }

    /// Router of the user table.
    pub fn users(&self) -> &ShardingRouter<User> {
        &self.users
    }

    /// Seed `userName{i}` for every user in `0..SEED_ACCOUNTS`.
    #[instrument(skip(self))]
    pub async fn process_users(&self) -> Result<Vec<User>> {
        let mut seeded = Vec::new();
        for i in 0..SEED_ACCOUNTS {
            let mut user = User::new(i, format!("userName{i}"));
            self.users.insert(&mut user).await?;
            seeded.push(user);
        }
        info!(users = seeded.len(), "users seeded");
        Ok(seeded)
    }

    /// Every user, ordered by user id.
    pub async fn find_all(&self) -> Result<Vec<User>> {
        self.users.find_all_sorted_by(|u| u.user_id).await
    }
}

/// Records and tasks of the health tables.
#[derive(Clone)]
pub struct HealthService {
    records: ShardingRouter<HealthRecord>,
    tasks: ShardingRouter<HealthTask>,
}

impl HealthService {
    /// Service over the tables of `cluster`.
    pub fn new(cluster: &Cluster) -> Self {
        Self { records: cluster.router(), tasks: cluster.router() }
    }

    /// Router of the record table.
    pub fn records(&self) -> &ShardingRouter<HealthRecord> {
        &self.records
    }

    /// Router of the task table.
    pub fn tasks(&self) -> &ShardingRouter<HealthTask> {
        &self.tasks
    }

    /// Seed one record and one task for every user in `0..SEED_USERS`.
    #[instrument(skip(self))]
    pub async fn process_health_records(&self) -> Result<Vec<HealthRecord>> {
        let mut seeded = Vec::new();
        for i in 0..SEED_USERS {
            let mut record = HealthRecord::new(i, (i % 5) as i32, format!("Remark{i}"));
            let record_id = self.records.insert(&mut record).await?;
            let mut task = HealthTask::new(record_id, i, format!("TaskName{i}"));
            self.tasks.insert(&mut task).await?;
            seeded.push(record);
        }
        info!(records = seeded.len(), "health records seeded");
        Ok(seeded)
    }

    /// Every record, ordered by id.
    pub async fn query_all(&self) -> Result<Vec<HealthRecord>> {
        self.records.find_all_sorted_by(|r| r.record_id).await
    }

    /// Tasks attached to `record_id`.
    pub async fn tasks_of(&self, record_id: RecordId) -> Result<Vec<HealthTask>> {
        let mut tasks = self.tasks.find_all().await?;
        tasks.retain(|t| t.record_id == record_id);
        Ok(tasks)
    }

    /// Hand a record, and the tasks attached to it, over to another user.
    ///
    /// Each row moves on its own; a failure leaves the rows moved so far
    /// with the new user.
    #[instrument(skip(self))]
    pub async fn reassign(&self, record_id: RecordId, from: i64, to: i64) -> Result<Relocation> {
        let relocation = self.records.update_shard_key(record_id, from, to).await?;
        for task in self.tasks_of(record_id).await? {
            if let Some(task_id) = task.task_id {
                if task.user_id == from {
                    self.tasks.update_shard_key(task_id, from, to).await?;
                }
            }
        }
        Ok(relocation)
    }
}

/// What `tessera demo` did.
#[derive(Debug, Serialize)]
pub struct DemoSummary {
    /// Users inserted.
    pub users: usize,
    /// Records inserted.
    pub seeded: usize,
    /// Rows per shard after seeding.
    pub rows_per_shard: Vec<(ShardId, usize)>,
    /// Records returned by the full scan.
    pub scanned: usize,
    /// The shard-key update performed.
    pub relocation: Relocation,
    /// Placement audit at the end.
    pub record_audit: ReconcileReport,
    /// Placement audit of the task table.
    pub task_audit: ReconcileReport,
}

/// Seed the user and health tables, scan them, reassign one record to another user and audit
/// placement.
pub async fn run(cluster: &Cluster) -> Result<DemoSummary> {
    let users = UserService::new(cluster);
    users.process_users().await?;
    let service = HealthService::new(cluster);
    let seeded = service.process_health_records().await?;
    let rows_per_shard = cluster
        .directory()
        .shards()
        .iter()
        .map(|&s| (s, cluster.executor().rows(s).len()))
        .collect();
    let scanned = service.query_all().await?.len();

    let moved = &seeded[1];
    let record_id = moved.record_id.ok_or(tessera_router::RouterError::MissingRecordId)?;
    let relocation = service.reassign(record_id, moved.user_id, moved.user_id + 1).await?;

    Ok(DemoSummary {
        users: users.find_all().await?.len(),
        seeded: seeded.len(),
        rows_per_shard,
        scanned,
        relocation,
        record_audit: service.records().reconcile().await?,
        task_audit: service.tasks().reconcile().await?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TesseraConfig;

    fn cluster() -> Cluster {
        Cluster::from_config(&TesseraConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn seeds_eleven_records_with_tasks() {
        let cluster = cluster();
        let service = HealthService::new(&cluster);
        let seeded = service.process_health_records().await.unwrap();
        assert_eq!(seeded.len(), 11);
        assert_eq!(seeded[7].level_id, 2);
        assert_eq!(seeded[7].remark, "Remark7");

        // Two modulo shards: even users on shard_0, odd on shard_1, records and tasks together.
        assert_eq!(cluster.executor().rows(ShardId(0)).len(), 12);
        assert_eq!(cluster.executor().rows(ShardId(1)).len(), 10);

        let all = service.query_all().await.unwrap();
        assert_eq!(all, seeded);
        let id = seeded[4].record_id.unwrap();
        let tasks = service.tasks_of(id).await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].task_name, "TaskName4");
    }

    #[tokio::test]
    async fn seeds_six_users_and_scans_them_back() {
        let cluster = cluster();
        let service = UserService::new(&cluster);
        let seeded = service.process_users().await.unwrap();
        assert_eq!(seeded.len(), 6);

        let all = service.find_all().await.unwrap();
        assert_eq!(all, seeded);
        let names: Vec<_> = all.iter().map(|u| u.user_name.as_str()).collect();
        assert_eq!(names, ["userName0", "userName1", "userName2", "userName3", "userName4", "userName5"]);
        assert_eq!(cluster.executor().rows(ShardId(0)).len(), 3);
        assert_eq!(cluster.executor().rows(ShardId(1)).len(), 3);
        assert!(service.users().reconcile().await.unwrap().is_clean());
    }

    #[tokio::test]
    async fn reassign_moves_record_and_tasks() {
        let cluster = cluster();
        let service = HealthService::new(&cluster);
        let seeded = service.process_health_records().await.unwrap();
        let id = seeded[2].record_id.unwrap();

        let relocation = service.reassign(id, 2, 3).await.unwrap();
        assert_eq!(relocation.shard, ShardId(1));
        assert!(relocation.moved);
        assert!(cluster.executor().contains(ShardId(1), id));
        assert!(!cluster.executor().contains(ShardId(0), id));
        let tasks = service.tasks_of(id).await.unwrap();
        assert!(tasks.iter().all(|t| t.user_id == 3));
        assert!(service.records().reconcile().await.unwrap().is_clean());
        assert!(service.tasks().reconcile().await.unwrap().is_clean());
    }

    #[tokio::test]
    async fn demo_runs_clean() {
        let summary = run(&cluster()).await.unwrap();
        assert_eq!(summary.users, 6);
        assert_eq!(summary.seeded, 11);
        assert_eq!(summary.scanned, 11);
        assert!(summary.relocation.moved);
        assert!(summary.record_audit.is_clean());
        assert!(summary.task_audit.is_clean());
        assert_eq!(summary.rows_per_shard.iter().map(|(_, n)| n).sum::<usize>(), 28);
    }
}
