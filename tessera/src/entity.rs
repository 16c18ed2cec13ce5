//! User and health-tracking tables, all sharded by `user_id`.
use serde::{Deserialize, Serialize};
use tessera_router::Record;
use tessera_shard::RecordId;

/// A user's health record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthRecord {
    /// Assigned on insert.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_id: Option<RecordId>,
    /// Shard key.
    pub user_id: i64,
    /// Health level, 0..5.
    pub level_id: i32,
    /// Free text.
    pub remark: String,
}

impl HealthRecord {
    /// Unsaved record.
    pub fn new(user_id: i64, level_id: i32, remark: impl Into<String>) -> Self {
        Self { record_id: None, user_id, level_id, remark: remark.into() }
    }
}

impl Record for HealthRecord {
    type Key = i64;

    fn record_id(&self) -> Option<RecordId> {
        self.record_id
    }

    fn set_record_id(&mut self, id: RecordId) {
        self.record_id = Some(id);
    }

    fn shard_key(&self) -> i64 {
        self.user_id
    }

    fn set_shard_key(&mut self, key: i64) {
        self.user_id = key;
    }
}

/// A task attached to a health record. Lives with its owner's records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthTask {
    /// Assigned on insert.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<RecordId>,
    /// Owning record.
    pub record_id: RecordId,
    /// Shard key.
    pub user_id: i64,
    /// Task label.
    pub task_name: String,
}

impl HealthTask {
    /// Unsaved task for `record`.
    pub fn new(record_id: RecordId, user_id: i64, task_name: impl Into<String>) -> Self {
        Self { task_id: None, record_id, user_id, task_name: task_name.into() }
    }
}

impl Record for HealthTask {
    type Key = i64;

    fn record_id(&self) -> Option<RecordId> {
        self.task_id
    }

    fn set_record_id(&mut self, id: RecordId) {
        self.task_id = Some(id);
    }

    fn shard_key(&self) -> i64 {
        self.user_id
    }

    fn set_shard_key(&mut self, key: i64) {
        self.user_id = key;
    }
}

/// An account holder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    /// Assigned on insert.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RecordId>,
    /// Shard key.
    pub user_id: i64,
    /// Display name.
    pub user_name: String,
}

impl User {
    /// Unsaved user.
    pub fn new(user_id: i64, user_name: impl Into<String>) -> Self {
        Self { id: None, user_id, user_name: user_name.into() }
    }
}

impl Record for User {
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
