use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{
    CommittedReservation, LedgerStore, OrderStore, ReservationRecord, StoreError, TaskStore,
    UsageLogEntry, UsageLogRecord, UserRecord, now_millis,
};
use crate::order::{OrderStatus, TopUpOrder};
use crate::task::{Task, TaskCursor, TaskStatus, TaskUpdate};

/// Single-process store. One mutex guards all state, which makes every
/// check-and-mutate sequence below atomic.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    users: BTreeMap<i64, UserRecord>,
    reservations: HashMap<String, ReservationRecord>,
    channel_used: BTreeMap<i64, i64>,
    logs: Vec<UsageLogRecord>,
    tasks: BTreeMap<String, Task>,
    provider_index: HashMap<String, String>,
    orders: BTreeMap<String, TopUpOrder>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn upsert_user(&self, user: UserRecord) {
        let mut inner = self.inner.lock().await;
        inner.users.insert(user.id, user);
    }

    pub async fn pending_reservations(&self) -> usize {
        self.inner.lock().await.reservations.len()
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn user(&self, user_id: i64) -> Result<UserRecord, StoreError> {
        let inner = self.inner.lock().await;
        inner
            .users
            .get(&user_id)
            .cloned()
            .ok_or(StoreError::UserNotFound { user_id })
    }

    async fn reserve_quota(&self, reservation: &ReservationRecord) -> Result<i64, StoreError> {
        let mut inner = self.inner.lock().await;
        if let Some(existing) = inner.reservations.get(&reservation.request_id) {
            return Err(StoreError::Duplicate {
                entity: "reservation",
                id: existing.request_id.clone(),
            });
        }
        let user = inner
            .users
            .get_mut(&reservation.user_id)
            .ok_or(StoreError::UserNotFound {
                user_id: reservation.user_id,
            })?;
        if user.quota < reservation.quota {
            return Err(StoreError::InsufficientQuota {
                balance: user.quota,
                required: reservation.quota,
            });
        }
        user.quota -= reservation.quota;
        let balance = user.quota;
        inner
            .reservations
            .insert(reservation.request_id.clone(), reservation.clone());
        Ok(balance)
    }

    async fn commit_reservation(
        &self,
        request_id: &str,
        charged: i64,
    ) -> Result<Option<CommittedReservation>, StoreError> {
        let mut inner = self.inner.lock().await;
        let Some(reservation) = inner.reservations.remove(request_id) else {
            return Ok(None);
        };
        let reserved = reservation.quota.max(0);
        let charged = charged.clamp(0, reserved);
        let refunded = reserved - charged;
        if refunded > 0 {
            if let Some(user) = inner.users.get_mut(&reservation.user_id) {
                user.quota += refunded;
            }
        }
        Ok(Some(CommittedReservation {
            user_id: reservation.user_id,
            channel_id: reservation.channel_id,
            token_id: reservation.token_id,
            reserved,
            charged,
            refunded,
        }))
    }

    async fn rollback_reservation(
        &self,
        request_id: &str,
    ) -> Result<Option<ReservationRecord>, StoreError> {
        let mut inner = self.inner.lock().await;
        let Some(reservation) = inner.reservations.remove(request_id) else {
            return Ok(None);
        };
        if let Some(user) = inner.users.get_mut(&reservation.user_id) {
            user.quota += reservation.quota.max(0);
        }
        Ok(Some(reservation))
    }

    async fn increase_quota(&self, user_id: i64, amount: i64) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let user = inner
            .users
            .get_mut(&user_id)
            .ok_or(StoreError::UserNotFound { user_id })?;
        user.quota = user.quota.saturating_add(amount);
        Ok(())
    }

    async fn record_consumption(
        &self,
        user_id: i64,
        channel_id: i64,
        quota: i64,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if let Some(user) = inner.users.get_mut(&user_id) {
            user.used_quota = user.used_quota.saturating_add(quota);
            user.request_count = user.request_count.saturating_add(1);
        }
        let used = inner.channel_used.entry(channel_id).or_insert(0);
        *used = used.saturating_add(quota);
        Ok(())
    }

    async fn channel_used_quota(&self, channel_id: i64) -> Result<i64, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.channel_used.get(&channel_id).copied().unwrap_or(0))
    }

    async fn append_log(&self, entry: UsageLogEntry) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let id = inner.logs.len() as i64 + 1;
        inner.logs.push(UsageLogRecord {
            id,
            ts_ms: now_millis(),
            entry,
        });
        Ok(())
    }

    async fn list_logs(
        &self,
        user_id: Option<i64>,
        limit: usize,
    ) -> Result<Vec<UsageLogRecord>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .logs
            .iter()
            .rev()
            .filter(|log| user_id.is_none_or(|id| log.entry.user_id == id))
            .take(limit.max(1))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn insert_task(&self, task: &Task) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if inner.tasks.contains_key(&task.id) {
            return Err(StoreError::Duplicate {
                entity: "task",
                id: task.id.clone(),
            });
        }
        inner
            .provider_index
            .insert(task.provider_task_id.clone(), task.id.clone());
        inner.tasks.insert(task.id.clone(), task.clone());
        Ok(())
    }

    async fn find_task(&self, user_id: Option<i64>, id: &str) -> Result<Option<Task>, StoreError> {
        let inner = self.inner.lock().await;
        let task = inner.tasks.get(id).or_else(|| {
            inner
                .provider_index
                .get(id)
                .and_then(|task_id| inner.tasks.get(task_id))
        });
        Ok(task
            .filter(|task| user_id.is_none_or(|uid| task.user_id == uid))
            .cloned())
    }

    async fn find_tasks(&self, user_id: i64, ids: &[String]) -> Result<Vec<Task>, StoreError> {
        let inner = self.inner.lock().await;
        let mut out = Vec::new();
        for id in ids {
            let task = inner.tasks.get(id).or_else(|| {
                inner
                    .provider_index
                    .get(id)
                    .and_then(|task_id| inner.tasks.get(task_id))
            });
            if let Some(task) = task.filter(|task| task.user_id == user_id) {
                if !out.iter().any(|existing: &Task| existing.id == task.id) {
                    out.push(task.clone());
                }
            }
        }
        Ok(out)
    }

    async fn compare_and_update_task(
        &self,
        task_id: &str,
        expected: TaskStatus,
        update: &TaskUpdate,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        let Some(task) = inner.tasks.get_mut(task_id) else {
            return Ok(false);
        };
        if task.status != expected {
            return Ok(false);
        }
        task.status = update.status;
        task.progress = update.progress.clone();
        task.fail_reason = update.fail_reason.clone();
        task.data = update.data.clone();
        task.start_time_ms = update.start_time_ms;
        task.finish_time_ms = update.finish_time_ms;
        Ok(true)
    }

    async fn unfinished_tasks(
        &self,
        after: Option<&TaskCursor>,
        limit: usize,
    ) -> Result<Vec<Task>, StoreError> {
        let inner = self.inner.lock().await;
        let mut unfinished: Vec<Task> = inner
            .tasks
            .values()
            .filter(|task| !task.status.is_terminal())
            .filter(|task| after.is_none_or(|after| after.precedes(task)))
            .cloned()
            .collect();
        unfinished.sort_by(|a, b| (a.submit_time_ms, &a.id).cmp(&(b.submit_time_ms, &b.id)));
        unfinished.truncate(limit.max(1));
        Ok(unfinished)
    }
}

#[async_trait]
impl OrderStore for MemoryStore {
    async fn insert_order(&self, order: &TopUpOrder) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if inner.orders.contains_key(&order.trade_no) {
            return Err(StoreError::Duplicate {
                entity: "order",
                id: order.trade_no.clone(),
            });
        }
        inner.orders.insert(order.trade_no.clone(), order.clone());
        Ok(())
    }

    async fn order(&self, trade_no: &str) -> Result<Option<TopUpOrder>, StoreError> {
        Ok(self.inner.lock().await.orders.get(trade_no).cloned())
    }

    async fn complete_order(
        &self,
        trade_no: &str,
        transaction_id: &str,
        completed_at: i64,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        let Some(order) = inner.orders.get_mut(trade_no) else {
            return Ok(false);
        };
        if order.status != OrderStatus::Pending {
            return Ok(false);
        }
        order.status = OrderStatus::Success;
        order.completed_at = Some(completed_at);
        order.transaction_id = Some(transaction_id.to_string());
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reservation(request_id: &str, user_id: i64, quota: i64) -> ReservationRecord {
        ReservationRecord {
            request_id: request_id.to_string(),
            user_id,
            channel_id: 1,
            token_id: None,
            quota,
            ts_ms: 0,
        }
    }

    #[tokio::test]
    async fn memory_store_reservations_enforce_balance() {
        let store = MemoryStore::new();
        store.upsert_user(UserRecord::new(1, "default", 5)).await;

        assert_eq!(store.reserve_quota(&reservation("r1", 1, 3)).await.unwrap(), 2);
        let err = store.reserve_quota(&reservation("r2", 1, 3)).await;
        assert!(matches!(
            err,
            Err(StoreError::InsufficientQuota {
                balance: 2,
                required: 3
            })
        ));

        store.rollback_reservation("r1").await.expect("rollback");
        assert_eq!(store.user(1).await.unwrap().quota, 5);

        store.reserve_quota(&reservation("r3", 1, 3)).await.unwrap();
        let committed = store
            .commit_reservation("r3", 2)
            .await
            .expect("commit")
            .expect("reservation exists");
        assert_eq!(committed.charged, 2);
        assert_eq!(committed.refunded, 1);
        assert_eq!(store.user(1).await.unwrap().quota, 3);

        assert!(store.commit_reservation("r3", 2).await.unwrap().is_none());
        assert_eq!(store.pending_reservations().await, 0);
    }

    #[tokio::test]
    async fn memory_store_commit_never_charges_more_than_reserved() {
        let store = MemoryStore::new();
        store.upsert_user(UserRecord::new(1, "default", 10)).await;
        store.reserve_quota(&reservation("r1", 1, 4)).await.unwrap();
        let committed = store.commit_reservation("r1", 9).await.unwrap().unwrap();
        assert_eq!(committed.charged, 4);
        assert_eq!(committed.refunded, 0);
        assert_eq!(store.user(1).await.unwrap().quota, 6);
    }

    #[tokio::test]
    async fn memory_store_unknown_user_is_reported() {
        let store = MemoryStore::new();
        let err = store.reserve_quota(&reservation("r1", 42, 1)).await;
        assert!(matches!(err, Err(StoreError::UserNotFound { user_id: 42 })));
    }
}
