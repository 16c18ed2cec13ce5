//! Tessera sharding router.
//!
//! Routes single-record operations of one logical table across a fixed set of
//! shards and moves records between shards when their shard key changes.
//! See [`ShardingRouter`] for the entry points and [`migration`] for the move
//! protocol.
#![deny(missing_docs)]

mod deadline;
mod error;
pub mod metrics;
pub mod migration;
mod record;
pub mod reconcile;
pub mod router;

pub use error::{MigrationFailure, MigrationPhase, Result, RouterError};
pub use migration::{MigrationCoordinator, MigrationPlan, Relocation};
pub use reconcile::{Duplicate, Misplaced, ReconcileReport};
pub use record::Record;
pub use router::{RouterConfig, ScanReport, ShardingRouter};

#[cfg(test)]
mod testkit {
    use std::sync::Arc;

    use serde::{Deserialize, Serialize};
    use tessera_exec::MemoryExecutor;
    use tessera_keygen::CounterGenerator;
    use tessera_shard::{RecordId, ShardDirectory, ShardId};

    use crate::{Record, ShardingRouter};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct Account {
        pub id: Option<RecordId>,
        pub user_id: i64,
        pub name: String,
    }

    impl Record for Account {
        type Key = i64;

        fn record_id(&self) -> Option<RecordId> {
            self.id
        }

        fn set_record_id(&mut self, id: RecordId) {
            self.id = Some(id);
        }

        fn shard_key(&self) -> i64 {
            self.user_id
        }

        fn set_shard_key(&mut self, key: i64) {
            self.user_id = key;
        }
    }

    pub fn account(user_id: i64, name: &str) -> Account {
        Account { id: None, user_id, name: name.to_owned() }
    }

    /// Modulo router over `shards` in-memory shards.
    pub fn setup(shards: u32) -> (ShardingRouter<Account>, MemoryExecutor) {
        let ids: Vec<ShardId> = (0..shards).map(ShardId).collect();
        setup_with(MemoryExecutor::new(&ids))
    }

    pub fn setup_with(exec: MemoryExecutor) -> (ShardingRouter<Account>, MemoryExecutor) {
        let count = exec.shards().len() as u32;
        let directory = Arc::new(ShardDirectory::modulo(count).expect("topology"));
        let router = ShardingRouter::new(directory, Arc::new(exec.clone()), Arc::new(CounterGenerator::starting_at(1_000)));
        (router, exec)
    }
}
