use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::OptionalExtension;

use super::{
    CommittedReservation, LedgerStore, LogKind, OrderStore, ReservationRecord, StoreError,
    TaskStore, UsageLogEntry, UsageLogRecord, UserRecord, now_millis,
};
use crate::order::{OrderStatus, TopUpOrder};
use crate::task::{Task, TaskCursor, TaskStatus, TaskUpdate};

const TASK_COLUMNS: &str = "id, provider_task_id, platform, action, user_id, channel_id, token_id,
     status, progress, fail_reason, quota, submit_time_ms, start_time_ms, finish_time_ms, data_json";

const ORDER_COLUMNS: &str =
    "trade_no, user_id, amount, money_cents, status, created_at, completed_at, transaction_id";

/// File-backed store. Each call opens its own connection on the blocking
/// pool; atomicity comes from sqlite transactions and conditional updates.
#[derive(Clone, Debug)]
pub struct SqliteStore {
    path: PathBuf,
}

impl SqliteStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn init(&self) -> Result<(), StoreError> {
        self.run(|_| Ok(())).await
    }

    async fn run<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut rusqlite::Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<T, StoreError> {
            let mut conn = open_connection(path)?;
            init_schema(&conn)?;
            f(&mut conn)
        })
        .await?
    }

    /// Inserts or overwrites a user, balance included.
    pub async fn upsert_user(&self, user: UserRecord) -> Result<(), StoreError> {
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO users (id, grp, quota, used_quota, request_count)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(id) DO UPDATE SET
                     grp = excluded.grp,
                     quota = excluded.quota,
                     used_quota = excluded.used_quota,
                     request_count = excluded.request_count",
                rusqlite::params![
                    user.id,
                    user.group,
                    user.quota,
                    user.used_quota,
                    user.request_count
                ],
            )?;
            Ok(())
        })
        .await
    }

    /// Inserts a user only when the id is unknown, so restarts keep balances.
    pub async fn seed_user(&self, user: UserRecord) -> Result<bool, StoreError> {
        self.run(move |conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO users (id, grp, quota, used_quota, request_count)
                 VALUES (?1, ?2, ?3, 0, 0)",
                rusqlite::params![user.id, user.group, user.quota],
            )?;
            Ok(inserted == 1)
        })
        .await
    }

    pub async fn pending_reservations(&self) -> Result<usize, StoreError> {
        self.run(|conn| {
            let count: i64 =
                conn.query_row("SELECT COUNT(*) FROM reservations", [], |row| row.get(0))?;
            Ok(count.max(0) as usize)
        })
        .await
    }
}

/// Takes the write lock up front. A deferred transaction that reads first
/// cannot wait out a concurrent writer when it upgrades; it fails with
/// SQLITE_BUSY regardless of the busy timeout.
fn write_transaction(
    conn: &mut rusqlite::Connection,
) -> Result<rusqlite::Transaction<'_>, rusqlite::Error> {
    conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)
}

fn load_user(conn: &rusqlite::Connection, user_id: i64) -> Result<Option<UserRecord>, StoreError> {
    Ok(conn
        .query_row(
            "SELECT id, grp, quota, used_quota, request_count FROM users WHERE id = ?1",
            rusqlite::params![user_id],
            |row| {
                Ok(UserRecord {
                    id: row.get(0)?,
                    group: row.get(1)?,
                    quota: row.get(2)?,
                    used_quota: row.get(3)?,
                    request_count: row.get(4)?,
                })
            },
        )
        .optional()?)
}

#[async_trait]
impl LedgerStore for SqliteStore {
    async fn user(&self, user_id: i64) -> Result<UserRecord, StoreError> {
        self.run(move |conn| {
            load_user(conn, user_id)?.ok_or(StoreError::UserNotFound { user_id })
        })
        .await
    }

    async fn reserve_quota(&self, reservation: &ReservationRecord) -> Result<i64, StoreError> {
        let reservation = reservation.clone();
        self.run(move |conn| {
            let tx = write_transaction(conn)?;
            let exists: Option<i64> = tx
                .query_row(
                    "SELECT 1 FROM reservations WHERE request_id = ?1",
                    rusqlite::params![reservation.request_id],
                    |row| row.get(0),
                )
                .optional()?;
            if exists.is_some() {
                return Err(StoreError::Duplicate {
                    entity: "reservation",
                    id: reservation.request_id,
                });
            }

            let updated = tx.execute(
                "UPDATE users SET quota = quota - ?2 WHERE id = ?1 AND quota >= ?2",
                rusqlite::params![reservation.user_id, reservation.quota],
            )?;
            if updated == 0 {
                return Err(match load_user(&tx, reservation.user_id)? {
                    None => StoreError::UserNotFound {
                        user_id: reservation.user_id,
                    },
                    Some(user) => StoreError::InsufficientQuota {
                        balance: user.quota,
                        required: reservation.quota,
                    },
                });
            }

            tx.execute(
                "INSERT INTO reservations (request_id, user_id, channel_id, token_id, quota, ts_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    reservation.request_id,
                    reservation.user_id,
                    reservation.channel_id,
                    reservation.token_id,
                    reservation.quota,
                    reservation.ts_ms as i64
                ],
            )?;
            let balance: i64 = tx.query_row(
                "SELECT quota FROM users WHERE id = ?1",
                rusqlite::params![reservation.user_id],
                |row| row.get(0),
            )?;
            tx.commit()?;
            Ok(balance)
        })
        .await
    }

    async fn commit_reservation(
        &self,
        request_id: &str,
        charged: i64,
    ) -> Result<Option<CommittedReservation>, StoreError> {
        let request_id = request_id.to_string();
        self.run(move |conn| {
            let tx = write_transaction(conn)?;
            let Some(reservation) = take_reservation(&tx, &request_id)? else {
                return Ok(None);
            };
            let reserved = reservation.quota.max(0);
            let charged = charged.clamp(0, reserved);
            let refunded = reserved - charged;
            if refunded > 0 {
                tx.execute(
                    "UPDATE users SET quota = quota + ?2 WHERE id = ?1",
                    rusqlite::params![reservation.user_id, refunded],
                )?;
            }
            tx.commit()?;
            Ok(Some(CommittedReservation {
                user_id: reservation.user_id,
                channel_id: reservation.channel_id,
                token_id: reservation.token_id,
                reserved,
                charged,
                refunded,
            }))
        })
        .await
    }

    async fn rollback_reservation(
        &self,
        request_id: &str,
    ) -> Result<Option<ReservationRecord>, StoreError> {
        let request_id = request_id.to_string();
        self.run(move |conn| {
            let tx = write_transaction(conn)?;
            let Some(reservation) = take_reservation(&tx, &request_id)? else {
                return Ok(None);
            };
            tx.execute(
                "UPDATE users SET quota = quota + ?2 WHERE id = ?1",
                rusqlite::params![reservation.user_id, reservation.quota.max(0)],
            )?;
            tx.commit()?;
            Ok(Some(reservation))
        })
        .await
    }

    async fn increase_quota(&self, user_id: i64, amount: i64) -> Result<(), StoreError> {
        self.run(move |conn| {
            let updated = conn.execute(
                "UPDATE users SET quota = quota + ?2 WHERE id = ?1",
                rusqlite::params![user_id, amount],
            )?;
            if updated == 0 {
                return Err(StoreError::UserNotFound { user_id });
            }
            Ok(())
        })
        .await
    }

    async fn record_consumption(
        &self,
        user_id: i64,
        channel_id: i64,
        quota: i64,
    ) -> Result<(), StoreError> {
        self.run(move |conn| {
            let tx = write_transaction(conn)?;
            tx.execute(
                "UPDATE users
                 SET used_quota = used_quota + ?2,
                     request_count = request_count + 1
                 WHERE id = ?1",
                rusqlite::params![user_id, quota],
            )?;
            tx.execute(
                "INSERT INTO channel_usage (channel_id, used_quota) VALUES (?1, ?2)
                 ON CONFLICT(channel_id) DO UPDATE SET used_quota = used_quota + excluded.used_quota",
                rusqlite::params![channel_id, quota],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn channel_used_quota(&self, channel_id: i64) -> Result<i64, StoreError> {
        self.run(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT used_quota FROM channel_usage WHERE channel_id = ?1",
                    rusqlite::params![channel_id],
                    |row| row.get::<_, i64>(0),
                )
                .optional()?
                .unwrap_or(0))
        })
        .await
    }

    async fn append_log(&self, entry: UsageLogEntry) -> Result<(), StoreError> {
        let other_json = serde_json::to_string(&entry.other)?;
        let ts_ms = now_millis() as i64;
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO usage_logs
                     (ts_ms, kind, user_id, channel_id, token_id, token_name, model, quota, content, other_json)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                rusqlite::params![
                    ts_ms,
                    entry.kind.as_str(),
                    entry.user_id,
                    entry.channel_id,
                    entry.token_id,
                    entry.token_name,
                    entry.model,
                    entry.quota,
                    entry.content,
                    other_json
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn list_logs(
        &self,
        user_id: Option<i64>,
        limit: usize,
    ) -> Result<Vec<UsageLogRecord>, StoreError> {
        let limit = limit.max(1) as i64;
        self.run(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, ts_ms, kind, user_id, channel_id, token_id, token_name, model, quota, content, other_json
                 FROM usage_logs
                 WHERE (?1 IS NULL OR user_id = ?1)
                 ORDER BY id DESC
                 LIMIT ?2",
            )?;
            let rows = stmt.query_map(rusqlite::params![user_id, limit], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    UsageLogEntry {
                        kind: LogKind::Consume,
                        user_id: row.get(3)?,
                        channel_id: row.get(4)?,
                        token_id: row.get(5)?,
                        token_name: row.get(6)?,
                        model: row.get(7)?,
                        quota: row.get(8)?,
                        content: row.get(9)?,
                        other: serde_json::Value::Null,
                    },
                    row.get::<_, String>(10)?,
                ))
            })?;

            let mut out = Vec::new();
            for row in rows {
                let (id, ts_ms, kind, mut entry, other_json) = row?;
                entry.kind = LogKind::parse(&kind)
                    .ok_or_else(|| StoreError::Invalid(format!("unknown log kind {kind}")))?;
                entry.other = serde_json::from_str(&other_json)?;
                out.push(UsageLogRecord {
                    id,
                    ts_ms: ts_ms.max(0) as u64,
                    entry,
                });
            }
            Ok(out)
        })
        .await
    }
}

fn take_reservation(
    tx: &rusqlite::Transaction<'_>,
    request_id: &str,
) -> Result<Option<ReservationRecord>, StoreError> {
    let reservation = tx
        .query_row(
            "SELECT request_id, user_id, channel_id, token_id, quota, ts_ms
             FROM reservations WHERE request_id = ?1",
            rusqlite::params![request_id],
            |row| {
                Ok(ReservationRecord {
                    request_id: row.get(0)?,
                    user_id: row.get(1)?,
                    channel_id: row.get(2)?,
                    token_id: row.get(3)?,
                    quota: row.get(4)?,
                    ts_ms: row.get::<_, i64>(5)?.max(0) as u64,
                })
            },
        )
        .optional()?;
    if reservation.is_some() {
        tx.execute(
            "DELETE FROM reservations WHERE request_id = ?1",
            rusqlite::params![request_id],
        )?;
    }
    Ok(reservation)
}

fn conversion_error(
    idx: usize,
    err: impl Into<Box<dyn std::error::Error + Send + Sync>>,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, err.into())
}

fn read_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<Task> {
    let status: String = row.get(7)?;
    let status = TaskStatus::parse(&status)
        .ok_or_else(|| conversion_error(7, format!("unknown task status {status}")))?;
    let data_json: String = row.get(14)?;
    let data = serde_json::from_str(&data_json).map_err(|err| conversion_error(14, err))?;
    let optional_ms = |value: Option<i64>| value.map(|ms| ms.max(0) as u64);
    Ok(Task {
        id: row.get(0)?,
        provider_task_id: row.get(1)?,
        platform: row.get(2)?,
        action: row.get(3)?,
        user_id: row.get(4)?,
        channel_id: row.get(5)?,
        token_id: row.get(6)?,
        status,
        progress: row.get(8)?,
        fail_reason: row.get(9)?,
        quota: row.get(10)?,
        submit_time_ms: row.get::<_, i64>(11)?.max(0) as u64,
        start_time_ms: optional_ms(row.get(12)?),
        finish_time_ms: optional_ms(row.get(13)?),
        data,
    })
}

fn lookup_task(
    conn: &rusqlite::Connection,
    user_id: Option<i64>,
    id: &str,
) -> Result<Option<Task>, StoreError> {
    let by_id = format!(
        "SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1 AND (?2 IS NULL OR user_id = ?2)"
    );
    if let Some(task) = conn
        .query_row(&by_id, rusqlite::params![id, user_id], read_task)
        .optional()?
    {
        return Ok(Some(task));
    }
    let by_provider = format!(
        "SELECT {TASK_COLUMNS} FROM tasks
         WHERE provider_task_id = ?1 AND (?2 IS NULL OR user_id = ?2)
         ORDER BY submit_time_ms DESC
         LIMIT 1"
    );
    Ok(conn
        .query_row(&by_provider, rusqlite::params![id, user_id], read_task)
        .optional()?)
}

#[async_trait]
impl TaskStore for SqliteStore {
    async fn insert_task(&self, task: &Task) -> Result<(), StoreError> {
        let task = task.clone();
        let data_json = serde_json::to_string(&task.data)?;
        self.run(move |conn| {
            let inserted = conn.execute(
                &format!(
                    "INSERT OR IGNORE INTO tasks ({TASK_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)"
                ),
                rusqlite::params![
                    task.id,
                    task.provider_task_id,
                    task.platform,
                    task.action,
                    task.user_id,
                    task.channel_id,
                    task.token_id,
                    task.status.as_str(),
                    task.progress,
                    task.fail_reason,
                    task.quota,
                    task.submit_time_ms as i64,
                    task.start_time_ms.map(|ms| ms as i64),
                    task.finish_time_ms.map(|ms| ms as i64),
                    data_json
                ],
            )?;
            if inserted == 0 {
                return Err(StoreError::Duplicate {
                    entity: "task",
                    id: task.id,
                });
            }
            Ok(())
        })
        .await
    }

    async fn find_task(&self, user_id: Option<i64>, id: &str) -> Result<Option<Task>, StoreError> {
        let id = id.to_string();
        self.run(move |conn| lookup_task(conn, user_id, &id)).await
    }

    async fn find_tasks(&self, user_id: i64, ids: &[String]) -> Result<Vec<Task>, StoreError> {
        let ids = ids.to_vec();
        self.run(move |conn| {
            let mut out: Vec<Task> = Vec::new();
            for id in &ids {
                if let Some(task) = lookup_task(conn, Some(user_id), id)? {
                    if !out.iter().any(|existing| existing.id == task.id) {
                        out.push(task);
                    }
                }
            }
            Ok(out)
        })
        .await
    }

    async fn compare_and_update_task(
        &self,
        task_id: &str,
        expected: TaskStatus,
        update: &TaskUpdate,
    ) -> Result<bool, StoreError> {
        let task_id = task_id.to_string();
        let update = update.clone();
        let data_json = serde_json::to_string(&update.data)?;
        self.run(move |conn| {
            let updated = conn.execute(
                "UPDATE tasks
                 SET status = ?3,
                     progress = ?4,
                     fail_reason = ?5,
                     data_json = ?6,
                     start_time_ms = ?7,
                     finish_time_ms = ?8
                 WHERE id = ?1 AND status = ?2",
                rusqlite::params![
                    task_id,
                    expected.as_str(),
                    update.status.as_str(),
                    update.progress,
                    update.fail_reason,
                    data_json,
                    update.start_time_ms.map(|ms| ms as i64),
                    update.finish_time_ms.map(|ms| ms as i64)
                ],
            )?;
            Ok(updated == 1)
        })
        .await
    }

    async fn unfinished_tasks(
        &self,
        after: Option<&TaskCursor>,
        limit: usize,
    ) -> Result<Vec<Task>, StoreError> {
        let limit = limit.max(1) as i64;
        let (after_time, after_id) = match after {
            Some(cursor) => (cursor.submit_time_ms as i64, cursor.id.clone()),
            None => (-1, String::new()),
        };
        self.run(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {TASK_COLUMNS} FROM tasks
                 WHERE status IN ('pending', 'running')
                   AND (submit_time_ms > ?2 OR (submit_time_ms = ?2 AND id > ?3))
                 ORDER BY submit_time_ms, id
                 LIMIT ?1"
            ))?;
            let rows = stmt.query_map(
                rusqlite::params![limit, after_time, after_id],
                read_task,
            )?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
        .await
    }
}

fn read_order(row: &rusqlite::Row<'_>) -> rusqlite::Result<TopUpOrder> {
    let status: String = row.get(4)?;
    let status = OrderStatus::parse(&status)
        .ok_or_else(|| conversion_error(4, format!("unknown order status {status}")))?;
    Ok(TopUpOrder {
        trade_no: row.get(0)?,
        user_id: row.get(1)?,
        amount: row.get(2)?,
        money_cents: row.get(3)?,
        status,
        created_at: row.get(5)?,
        completed_at: row.get(6)?,
        transaction_id: row.get(7)?,
    })
}

#[async_trait]
impl OrderStore for SqliteStore {
    async fn insert_order(&self, order: &TopUpOrder) -> Result<(), StoreError> {
        let order = order.clone();
        self.run(move |conn| {
            let inserted = conn.execute(
                &format!(
                    "INSERT OR IGNORE INTO topup_orders ({ORDER_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"
                ),
                rusqlite::params![
                    order.trade_no,
                    order.user_id,
                    order.amount,
                    order.money_cents,
                    order.status.as_str(),
                    order.created_at,
                    order.completed_at,
                    order.transaction_id
                ],
            )?;
            if inserted == 0 {
                return Err(StoreError::Duplicate {
                    entity: "order",
                    id: order.trade_no,
                });
            }
            Ok(())
        })
        .await
    }

    async fn order(&self, trade_no: &str) -> Result<Option<TopUpOrder>, StoreError> {
        let trade_no = trade_no.to_string();
        self.run(move |conn| {
            Ok(conn
                .query_row(
                    &format!("SELECT {ORDER_COLUMNS} FROM topup_orders WHERE trade_no = ?1"),
                    rusqlite::params![trade_no],
                    read_order,
                )
                .optional()?)
        })
        .await
    }

    async fn complete_order(
        &self,
        trade_no: &str,
        transaction_id: &str,
        completed_at: i64,
    ) -> Result<bool, StoreError> {
        let trade_no = trade_no.to_string();
        let transaction_id = transaction_id.to_string();
        self.run(move |conn| {
            let updated = conn.execute(
                "UPDATE topup_orders
                 SET status = 'success', completed_at = ?2, transaction_id = ?3
                 WHERE trade_no = ?1 AND status = 'pending'",
                rusqlite::params![trade_no, completed_at, transaction_id],
            )?;
            Ok(updated == 1)
        })
        .await
    }
}

fn init_schema(conn: &rusqlite::Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS users (
            id INTEGER PRIMARY KEY NOT NULL,
            grp TEXT NOT NULL DEFAULT 'default',
            quota INTEGER NOT NULL DEFAULT 0,
            used_quota INTEGER NOT NULL DEFAULT 0,
            request_count INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS reservations (
            request_id TEXT PRIMARY KEY NOT NULL,
            user_id INTEGER NOT NULL,
            channel_id INTEGER NOT NULL,
            token_id INTEGER,
            quota INTEGER NOT NULL,
            ts_ms INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS channel_usage (
            channel_id INTEGER PRIMARY KEY NOT NULL,
            used_quota INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS usage_logs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            ts_ms INTEGER NOT NULL,
            kind TEXT NOT NULL,
            user_id INTEGER NOT NULL,
            channel_id INTEGER,
            token_id INTEGER,
            token_name TEXT,
            model TEXT,
            quota INTEGER NOT NULL,
            content TEXT NOT NULL,
            other_json TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_usage_logs_user_id
            ON usage_logs(user_id, id);

        CREATE TABLE IF NOT EXISTS tasks (
            id TEXT PRIMARY KEY NOT NULL,
            provider_task_id TEXT NOT NULL,
            platform TEXT NOT NULL,
            action TEXT NOT NULL,
            user_id INTEGER NOT NULL,
            channel_id INTEGER NOT NULL,
            token_id INTEGER,
            status TEXT NOT NULL,
            progress TEXT,
            fail_reason TEXT,
            quota INTEGER NOT NULL,
            submit_time_ms INTEGER NOT NULL,
            start_time_ms INTEGER,
            finish_time_ms INTEGER,
            data_json TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_tasks_provider_task_id
            ON tasks(provider_task_id);
        CREATE INDEX IF NOT EXISTS idx_tasks_status
            ON tasks(status, submit_time_ms);

        CREATE TABLE IF NOT EXISTS topup_orders (
            trade_no TEXT PRIMARY KEY NOT NULL,
            user_id INTEGER NOT NULL,
            amount INTEGER NOT NULL,
            money_cents INTEGER NOT NULL,
            status TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            completed_at INTEGER,
            transaction_id TEXT
        );",
    )?;
    Ok(())
}

fn open_connection(path: PathBuf) -> Result<rusqlite::Connection, rusqlite::Error> {
    let conn = rusqlite::Connection::open(path)?;
    let _ = conn.busy_timeout(Duration::from_secs(5));
    let _ = conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;");
    Ok(conn)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reservation(request_id: &str, user_id: i64, quota: i64) -> ReservationRecord {
        ReservationRecord {
            request_id: request_id.to_string(),
            user_id,
            channel_id: 7,
            token_id: Some(3),
            quota,
            ts_ms: 1,
        }
    }

    fn task(id: &str, provider_task_id: &str, user_id: i64) -> Task {
        Task {
            id: id.to_string(),
            provider_task_id: provider_task_id.to_string(),
            platform: "suno".to_string(),
            action: "MUSIC".to_string(),
            user_id,
            channel_id: 7,
            token_id: None,
            status: TaskStatus::Pending,
            progress: None,
            fail_reason: None,
            quota: 75_000,
            submit_time_ms: 10,
            start_time_ms: None,
            finish_time_ms: None,
            data: serde_json::json!({"prompt": "x"}),
        }
    }

    #[tokio::test]
    async fn sqlite_store_reservations_enforce_balance() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SqliteStore::new(dir.path().join("relay.sqlite"));
        store.init().await.expect("init");
        store
            .upsert_user(UserRecord::new(1, "default", 5))
            .await
            .expect("user");

        assert_eq!(store.reserve_quota(&reservation("r1", 1, 3)).await.unwrap(), 2);
        let err = store.reserve_quota(&reservation("r2", 1, 3)).await;
        assert!(matches!(
            err,
            Err(StoreError::InsufficientQuota {
                balance: 2,
                required: 3
            })
        ));
        let err = store.reserve_quota(&reservation("r1", 1, 1)).await;
        assert!(matches!(err, Err(StoreError::Duplicate { .. })));

        let committed = store
            .commit_reservation("r1", 2)
            .await
            .expect("commit")
            .expect("reservation exists");
        assert_eq!((committed.charged, committed.refunded), (2, 1));
        assert_eq!(store.user(1).await.unwrap().quota, 3);
        assert!(store.rollback_reservation("r1").await.unwrap().is_none());
        assert_eq!(store.pending_reservations().await.unwrap(), 0);

        let err = store.reserve_quota(&reservation("r9", 99, 1)).await;
        assert!(matches!(err, Err(StoreError::UserNotFound { user_id: 99 })));
    }

    #[tokio::test]
    async fn sqlite_store_seed_keeps_existing_balance() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SqliteStore::new(dir.path().join("relay.sqlite"));
        assert!(store.seed_user(UserRecord::new(1, "vip", 100)).await.unwrap());
        store.increase_quota(1, 50).await.unwrap();
        assert!(!store.seed_user(UserRecord::new(1, "vip", 100)).await.unwrap());
        let user = store.user(1).await.unwrap();
        assert_eq!(user.quota, 150);
        assert_eq!(user.group, "vip");
    }

    #[tokio::test]
    async fn sqlite_store_tasks_compare_and_set() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SqliteStore::new(dir.path().join("relay.sqlite"));
        store.insert_task(&task("task_a", "up-1", 1)).await.unwrap();
        assert!(matches!(
            store.insert_task(&task("task_a", "up-1", 1)).await,
            Err(StoreError::Duplicate { .. })
        ));

        let by_provider = store.find_task(Some(1), "up-1").await.unwrap().unwrap();
        assert_eq!(by_provider.id, "task_a");
        assert!(store.find_task(Some(2), "task_a").await.unwrap().is_none());

        let update = TaskUpdate {
            status: TaskStatus::Succeeded,
            progress: Some("100%".to_string()),
            fail_reason: None,
            data: serde_json::json!({"audio_url": "https://cdn/a.mp3"}),
            start_time_ms: Some(11),
            finish_time_ms: Some(12),
        };
        assert!(
            store
                .compare_and_update_task("task_a", TaskStatus::Pending, &update)
                .await
                .unwrap()
        );
        assert!(
            !store
                .compare_and_update_task("task_a", TaskStatus::Pending, &update)
                .await
                .unwrap()
        );
        assert!(store.unfinished_tasks(None, 10).await.unwrap().is_empty());

        let found = store
            .find_tasks(1, &["task_a".to_string(), "up-1".to_string()])
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].data["audio_url"], "https://cdn/a.mp3");
    }

    #[tokio::test]
    async fn sqlite_store_orders_complete_once() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SqliteStore::new(dir.path().join("relay.sqlite"));
        let order = TopUpOrder {
            trade_no: "USR1NOabc1231700000000".to_string(),
            user_id: 1,
            amount: 10,
            money_cents: 7300,
            status: OrderStatus::Pending,
            created_at: 1_700_000_000,
            completed_at: None,
            transaction_id: None,
        };
        store.insert_order(&order).await.unwrap();
        assert!(
            store
                .complete_order(&order.trade_no, "tx-1", 1_700_000_100)
                .await
                .unwrap()
        );
        assert!(
            !store
                .complete_order(&order.trade_no, "tx-2", 1_700_000_200)
                .await
                .unwrap()
        );
        let stored = store.order(&order.trade_no).await.unwrap().unwrap();
        assert_eq!(stored.status, OrderStatus::Success);
        assert_eq!(stored.transaction_id.as_deref(), Some("tx-1"));
    }

    #[tokio::test]
    async fn sqlite_store_logs_filter_by_user() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SqliteStore::new(dir.path().join("relay.sqlite"));
        store
            .append_log(UsageLogEntry::new(LogKind::Consume, 1, 120, "suno_music"))
            .await
            .unwrap();
        store
            .append_log(UsageLogEntry::new(LogKind::Topup, 2, 5000, "top-up"))
            .await
            .unwrap();
        let logs = store.list_logs(Some(2), 10).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].entry.kind, LogKind::Topup);
        assert_eq!(store.list_logs(None, 10).await.unwrap().len(), 2);
    }
}
