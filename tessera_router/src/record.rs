use std::fmt;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tessera_exec::Row;
use tessera_shard::{RecordId, ShardId, ShardKey};

use crate::error::{Result, RouterError};

/// An entity stored in a sharded table.
///
/// The router is written once against this trait; each entity only says where
/// its id and shard key live. Shard membership is never stored on the entity:
/// it is recomputed from [`Record::shard_key`] on every call.
pub trait Record: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Type of the shard-key field.
    type Key: Into<ShardKey> + Clone + PartialEq + fmt::Debug + Send + Sync;

    /// Assigned id, `None` before the first insert.
    fn record_id(&self) -> Option<RecordId>;

    /// Assign the id. Called once, by the router, on insert.
    fn set_record_id(&mut self, id: RecordId);

    /// Current shard-key value.
    fn shard_key(&self) -> Self::Key;

    /// Replace the shard-key value.
    fn set_shard_key(&mut self, key: Self::Key);
}

pub(crate) fn encode<R: Record>(id: RecordId, record: &R) -> Result<Row> {
    let data = serde_json::to_value(record).map_err(RouterError::Encode)?;
    Ok(Row { id, data })
}

pub(crate) fn decode<R: Record>(shard: ShardId, row: Row) -> Result<R> {
    let id = row.id;
    let mut record: R = serde_json::from_value(row.data).map_err(|source| RouterError::Decode { id, shard, source })?;
    record.set_record_id(id);
    Ok(record)
}
