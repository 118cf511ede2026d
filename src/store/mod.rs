//! Persistence seams for the relay core.
//!
//! The core only depends on the three traits below. Every backend must make
//! `reserve_quota` an atomic check-and-decrement and every status transition a
//! compare-and-set, so callers never need their own locking for correctness.

pub mod memory;
#[cfg(feature = "store-redis")]
pub mod redis;
#[cfg(feature = "store-sqlite")]
pub mod sqlite;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::order::TopUpOrder;
use crate::task::{Task, TaskCursor, TaskStatus, TaskUpdate};

pub use memory::MemoryStore;
#[cfg(feature = "store-redis")]
pub use self::redis::{RedisOrderLocker, RedisOrderStatusCache};
#[cfg(feature = "store-sqlite")]
pub use sqlite::SqliteStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("user not found: {user_id}")]
    UserNotFound { user_id: i64 },
    #[error("insufficient quota: balance={balance} required={required}")]
    InsufficientQuota { balance: i64, required: i64 },
    #[error("duplicate {entity}: {id}")]
    Duplicate { entity: &'static str, id: String },
    #[error("invalid stored value: {0}")]
    Invalid(String),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("store join error: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[cfg(feature = "store-sqlite")]
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[cfg(feature = "store-redis")]
    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: i64,
    pub group: String,
    pub quota: i64,
    #[serde(default)]
    pub used_quota: i64,
    #[serde(default)]
    pub request_count: i64,
}

impl UserRecord {
    pub fn new(id: i64, group: impl Into<String>, quota: i64) -> Self {
        Self {
            id,
            group: group.into(),
            quota,
            used_quota: 0,
            request_count: 0,
        }
    }
}

/// A provisional debit already applied to the user's balance.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationRecord {
    pub request_id: String,
    pub user_id: i64,
    pub channel_id: i64,
    pub token_id: Option<i64>,
    pub quota: i64,
    pub ts_ms: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommittedReservation {
    pub user_id: i64,
    pub channel_id: i64,
    pub token_id: Option<i64>,
    pub reserved: i64,
    pub charged: i64,
    pub refunded: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogKind {
    Consume,
    Topup,
    Refund,
}

impl LogKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Consume => "consume",
            Self::Topup => "topup",
            Self::Refund => "refund",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "consume" => Some(Self::Consume),
            "topup" => Some(Self::Topup),
            "refund" => Some(Self::Refund),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UsageLogEntry {
    pub kind: LogKind,
    pub user_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub quota: i64,
    pub content: String,
    #[serde(default)]
    pub other: serde_json::Value,
}

impl UsageLogEntry {
    pub fn new(kind: LogKind, user_id: i64, quota: i64, content: impl Into<String>) -> Self {
        Self {
            kind,
            user_id,
            channel_id: None,
            token_id: None,
            token_name: None,
            model: None,
            quota,
            content: content.into(),
            other: serde_json::Value::Null,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UsageLogRecord {
    pub id: i64,
    pub ts_ms: u64,
    #[serde(flatten)]
    pub entry: UsageLogEntry,
}

#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn user(&self, user_id: i64) -> Result<UserRecord, StoreError>;

    /// Atomically debits `reservation.quota` when the balance covers it and
    /// remembers the reservation under its request id. Returns the balance
    /// after the debit.
    async fn reserve_quota(&self, reservation: &ReservationRecord) -> Result<i64, StoreError>;

    /// Converts a reservation into a final charge of at most the reserved
    /// amount, crediting the difference back. Unknown request ids are a no-op.
    async fn commit_reservation(
        &self,
        request_id: &str,
        charged: i64,
    ) -> Result<Option<CommittedReservation>, StoreError>;

    /// Returns the full reservation to the user. Unknown request ids are a no-op.
    async fn rollback_reservation(
        &self,
        request_id: &str,
    ) -> Result<Option<ReservationRecord>, StoreError>;

    async fn increase_quota(&self, user_id: i64, amount: i64) -> Result<(), StoreError>;

    /// Bumps per-user and per-channel cumulative counters.
    async fn record_consumption(
        &self,
        user_id: i64,
        channel_id: i64,
        quota: i64,
    ) -> Result<(), StoreError>;

    async fn channel_used_quota(&self, channel_id: i64) -> Result<i64, StoreError>;

    async fn append_log(&self, entry: UsageLogEntry) -> Result<(), StoreError>;

    async fn list_logs(
        &self,
        user_id: Option<i64>,
        limit: usize,
    ) -> Result<Vec<UsageLogRecord>, StoreError>;
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn insert_task(&self, task: &Task) -> Result<(), StoreError>;

    /// Looks a task up by gateway id first, then by provider task id.
    async fn find_task(&self, user_id: Option<i64>, id: &str) -> Result<Option<Task>, StoreError>;

    async fn find_tasks(&self, user_id: i64, ids: &[String]) -> Result<Vec<Task>, StoreError>;

    /// Applies `update` only while the stored status still equals `expected`.
    async fn compare_and_update_task(
        &self,
        task_id: &str,
        expected: TaskStatus,
        update: &TaskUpdate,
    ) -> Result<bool, StoreError>;

    /// Non-terminal tasks in `(submit_time_ms, id)` order, strictly after
    /// `after` when given.
    async fn unfinished_tasks(
        &self,
        after: Option<&TaskCursor>,
        limit: usize,
    ) -> Result<Vec<Task>, StoreError>;
}

#[async_trait]
pub trait OrderStore: Send + Sync {
    async fn insert_order(&self, order: &TopUpOrder) -> Result<(), StoreError>;

    async fn order(&self, trade_no: &str) -> Result<Option<TopUpOrder>, StoreError>;

    /// Moves a `pending` order to `success`; returns `false` when it was not pending.
    async fn complete_order(
        &self,
        trade_no: &str,
        transaction_id: &str,
        completed_at: i64,
    ) -> Result<bool, StoreError>;
}

pub(crate) fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|duration| duration.as_millis() as u64)
        .unwrap_or(0)
}
