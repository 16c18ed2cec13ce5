//! In-process cluster: topology, in-memory shards and the id generator,
//! shared by every table router.
use std::sync::Arc;

use tessera_exec::MemoryExecutor;
use tessera_keygen::{IdGenerator, Snowflake};
use tessera_router::{Record, RouterConfig, ShardingRouter};
use tessera_shard::ShardDirectory;
use tracing::info;

use crate::config::{ConfigError, TesseraConfig};

/// Shards plus everything a router needs to reach them.
#[derive(Clone)]
pub struct Cluster {
    directory: Arc<ShardDirectory>,
    executor: MemoryExecutor,
    ids: Arc<dyn IdGenerator>,
    router: RouterConfig,
}

impl Cluster {
    /// Validate `cfg` and start one in-memory store per configured shard.
    pub fn from_config(cfg: &TesseraConfig) -> Result<Self, ConfigError> {
        let directory = ShardDirectory::from_config(&cfg.topology)?;
        let ids = Snowflake::from_config(&cfg.keygen)?;
        let executor = MemoryExecutor::new(directory.shards());
        info!(shards = directory.shards().len(), rule = directory.rule_name(), "cluster ready");
        Ok(Self { directory: Arc::new(directory), executor, ids: Arc::new(ids), router: cfg.router.clone() })
    }

    /// Router for the table of `R`.
    pub fn router<R: Record>(&self) -> ShardingRouter<R> {
        ShardingRouter::new(self.directory.clone(), Arc::new(self.executor.clone()), self.ids.clone())
            .with_config(&self.router)
    }

    /// The topology.
    pub fn directory(&self) -> &ShardDirectory {
        &self.directory
    }

    /// The in-memory shards, for inspection and fault injection.
    pub fn executor(&self) -> &MemoryExecutor {
        &self.executor
    }
}
