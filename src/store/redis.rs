//! Redis-backed order lock and order-status cache for multi-instance
//! deployments.

use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;

use super::StoreError;
use crate::order::{
    DEFAULT_ORDER_STATUS_TTL_SECS, OrderLockGuard, OrderLocker, OrderStatus, OrderStatusCache,
    PaymentError,
};
use crate::utils::ids;

const DEFAULT_LOCK_TTL_MS: u64 = 30_000;
const DEFAULT_LOCK_WAIT: Duration = Duration::from_secs(10);
const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(50);

// Delete only if the lock still carries our token.
const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
  return redis.call("DEL", KEYS[1])
end
return 0
"#;

async fn connection(
    client: &redis::Client,
) -> Result<redis::aio::MultiplexedConnection, redis::RedisError> {
    client.get_multiplexed_async_connection().await
}

/// `SET NX PX` lock keyed by trade number. The TTL bounds how long a crashed
/// holder can block an order.
#[derive(Clone, Debug)]
pub struct RedisOrderLocker {
    client: redis::Client,
    prefix: String,
    ttl_ms: u64,
    max_wait: Duration,
}

impl RedisOrderLocker {
    pub fn new(url: impl AsRef<str>) -> Result<Self, StoreError> {
        Ok(Self {
            client: redis::Client::open(url.as_ref())?,
            prefix: "ditto_relay".to_string(),
            ttl_ms: DEFAULT_LOCK_TTL_MS,
            max_wait: DEFAULT_LOCK_WAIT,
        })
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl_ms = (ttl.as_millis() as u64).max(1);
        self
    }

    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait;
        self
    }

    fn key(&self, trade_no: &str) -> String {
        format!("{}:order_lock:{trade_no}", self.prefix)
    }
}

async fn release_lock(client: redis::Client, key: String, token: String) -> Result<(), StoreError> {
    let mut conn = connection(&client).await?;
    let _: i64 = redis::Script::new(RELEASE_SCRIPT)
        .key(key)
        .arg(token)
        .invoke_async(&mut conn)
        .await?;
    Ok(())
}

#[async_trait]
impl OrderLocker for RedisOrderLocker {
    async fn acquire(&self, trade_no: &str) -> Result<OrderLockGuard, PaymentError> {
        let key = self.key(trade_no);
        let token = ids::random_string(24);
        let mut conn = connection(&self.client).await.map_err(StoreError::from)?;
        let deadline = tokio::time::Instant::now() + self.max_wait;

        loop {
            let acquired: Option<String> = redis::cmd("SET")
                .arg(&key)
                .arg(&token)
                .arg("NX")
                .arg("PX")
                .arg(self.ttl_ms)
                .query_async(&mut conn)
                .await
                .map_err(StoreError::from)?;
            if acquired.is_some() {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(PaymentError::Lock {
                    message: format!("timed out waiting for order lock {trade_no}"),
                });
            }
            tokio::time::sleep(LOCK_RETRY_INTERVAL).await;
        }

        let client = self.client.clone();
        Ok(OrderLockGuard::new(move || async move {
            if let Err(err) = release_lock(client, key.clone(), token).await {
                tracing::warn!(%key, error = %err, "failed to release order lock; waiting for ttl");
            }
        }))
    }
}

#[derive(Clone, Debug)]
pub struct RedisOrderStatusCache {
    client: redis::Client,
    prefix: String,
    ttl_secs: u64,
}

impl RedisOrderStatusCache {
    pub fn new(url: impl AsRef<str>) -> Result<Self, StoreError> {
        Ok(Self {
            client: redis::Client::open(url.as_ref())?,
            prefix: "ditto_relay".to_string(),
            ttl_secs: DEFAULT_ORDER_STATUS_TTL_SECS,
        })
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn with_ttl_secs(mut self, ttl_secs: u64) -> Self {
        self.ttl_secs = ttl_secs.max(1);
        self
    }

    fn key(&self, trade_no: &str) -> String {
        format!("{}:topup_order::{trade_no}", self.prefix)
    }
}

#[async_trait]
impl OrderStatusCache for RedisOrderStatusCache {
    async fn get(&self, trade_no: &str) -> Result<Option<OrderStatus>, StoreError> {
        let mut conn = connection(&self.client).await?;
        let raw: Option<String> = conn.get(self.key(trade_no)).await?;
        Ok(raw.as_deref().and_then(OrderStatus::parse))
    }

    async fn set(&self, trade_no: &str, status: OrderStatus) -> Result<(), StoreError> {
        let mut conn = connection(&self.client).await?;
        let _: () = conn
            .set_ex(self.key(trade_no), status.as_str(), self.ttl_secs)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env_nonempty(key: &str) -> Option<String> {
        std::env::var(key)
            .ok()
            .filter(|value| !value.trim().is_empty())
    }

    fn redis_url() -> Option<String> {
        env_nonempty("DITTO_REDIS_URL").or_else(|| env_nonempty("REDIS_URL"))
    }

    #[tokio::test]
    async fn redis_order_lock_excludes_second_holder() {
        let Some(url) = redis_url() else {
            return;
        };
        let prefix = format!("ditto_relay_test:{}", ids::random_string(8));
        let locker = RedisOrderLocker::new(&url)
            .expect("locker")
            .with_prefix(prefix)
            .with_max_wait(Duration::from_millis(200));

        let guard = locker.acquire("USR1NOabc").await.expect("first acquire");
        let err = locker.acquire("USR1NOabc").await.unwrap_err();
        assert!(matches!(err, PaymentError::Lock { .. }));
        locker.acquire("USR2NOabc").await.expect("other key");

        drop(guard);
        tokio::time::sleep(Duration::from_millis(100)).await;
        let locker = locker.with_max_wait(Duration::from_secs(2));
        locker.acquire("USR1NOabc").await.expect("reacquire");
    }

    #[tokio::test]
    async fn redis_order_lock_is_free_when_the_locked_section_returns() {
        let Some(url) = redis_url() else {
            return;
        };
        let locker = RedisOrderLocker::new(&url)
            .expect("locker")
            .with_prefix(format!("ditto_relay_test:{}", ids::random_string(8)))
            .with_max_wait(Duration::ZERO);

        for _ in 0..3 {
            crate::order::with_order_lock(&locker, "USR1NOabc", || async {})
                .await
                .expect("locked section");
        }
        let guard = locker.acquire("USR1NOabc").await.expect("no wait needed");
        guard.release().await;
    }

    #[tokio::test]
    async fn redis_status_cache_round_trips() {
        let Some(url) = redis_url() else {
            return;
        };
        let cache = RedisOrderStatusCache::new(&url)
            .expect("cache")
            .with_prefix(format!("ditto_relay_test:{}", ids::random_string(8)))
            .with_ttl_secs(5);
        assert_eq!(cache.get("USR1NOx").await.unwrap(), None);
        cache.set("USR1NOx", OrderStatus::Pending).await.unwrap();
        assert_eq!(cache.get("USR1NOx").await.unwrap(), Some(OrderStatus::Pending));
    }
}
