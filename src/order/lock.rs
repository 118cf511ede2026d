use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;

use super::PaymentError;

type ReleaseFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
type ReleaseFn = Box<dyn FnOnce() -> ReleaseFuture + Send>;

/// Held while a trade number is locked.
///
/// [`OrderLockGuard::release`] waits until the lock is actually free. A guard
/// dropped instead (early return, cancellation, unwind) spawns the release in
/// the background.
pub struct OrderLockGuard {
    release: Option<ReleaseFn>,
}

impl OrderLockGuard {
    /// `release` runs exactly once. Work done before it returns the future
    /// happens even when no runtime is available at drop time.
    pub fn new<F, Fut>(release: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self {
            release: Some(Box::new(move || Box::pin(release()) as ReleaseFuture)),
        }
    }

    pub async fn release(mut self) {
        if let Some(release) = self.release.take() {
            release().await;
        }
    }
}

impl Drop for OrderLockGuard {
    fn drop(&mut self) {
        let Some(release) = self.release.take() else {
            return;
        };
        let pending = release();
        // Without a runtime, backends that release asynchronously fall back
        // to their own expiry.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(pending);
        }
    }
}

impl std::fmt::Debug for OrderLockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderLockGuard")
            .field("held", &self.release.is_some())
            .finish()
    }
}

/// Serializes mutations per trade number.
#[async_trait]
pub trait OrderLocker: Send + Sync {
    async fn acquire(&self, trade_no: &str) -> Result<OrderLockGuard, PaymentError>;
}

/// In-process keyed mutex registry for single-instance deployments. Entries
/// are removed once no holder or waiter references them.
#[derive(Debug, Default)]
pub struct KeyedMutexLocker {
    locks: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl KeyedMutexLocker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active_keys(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[async_trait]
impl OrderLocker for KeyedMutexLocker {
    async fn acquire(&self, trade_no: &str) -> Result<OrderLockGuard, PaymentError> {
        let entry = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            locks.entry(trade_no.to_string()).or_default().clone()
        };
        let held = entry.clone().lock_owned().await;

        let locks = self.locks.clone();
        let key = trade_no.to_string();
        Ok(OrderLockGuard::new(move || {
            let mut map = locks.lock().unwrap_or_else(PoisonError::into_inner);
            drop(held);
            // map entry plus ours
            if Arc::strong_count(&entry) <= 2 {
                map.remove(&key);
            }
            std::future::ready(())
        }))
    }
}

/// Runs `f` while holding the lock for `trade_no`.
pub async fn with_order_lock<F, Fut, T>(
    locker: &dyn OrderLocker,
    trade_no: &str,
    f: F,
) -> Result<T, PaymentError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = T>,
{
    let guard = locker.acquire(trade_no).await?;
    let out = f().await;
    guard.release().await;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn same_trade_number_is_serialized() {
        let locker = Arc::new(KeyedMutexLocker::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let locker = locker.clone();
            let inside = inside.clone();
            let max_inside = max_inside.clone();
            handles.push(tokio::spawn(async move {
                with_order_lock(locker.as_ref(), "USR1NOabc", || async {
                    let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                    max_inside.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(2)).await;
                    inside.fetch_sub(1, Ordering::SeqCst);
                })
                .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
        assert_eq!(locker.active_keys(), 0);
    }

    /// Frees its key only after a few scheduler turns, like a remote lock.
    #[derive(Default)]
    struct SlowReleaseLocker {
        held: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl OrderLocker for SlowReleaseLocker {
        async fn acquire(&self, trade_no: &str) -> Result<OrderLockGuard, PaymentError> {
            {
                let mut keys = self.held.lock().unwrap();
                if keys.iter().any(|key| key == trade_no) {
                    return Err(PaymentError::Lock {
                        message: format!("{trade_no} is held"),
                    });
                }
                keys.push(trade_no.to_string());
            }
            let held = self.held.clone();
            let key = trade_no.to_string();
            Ok(OrderLockGuard::new(move || async move {
                for _ in 0..3 {
                    tokio::task::yield_now().await;
                }
                held.lock().unwrap().retain(|k| *k != key);
            }))
        }
    }

    #[tokio::test]
    async fn lock_is_free_once_the_locked_section_returns() {
        let locker = SlowReleaseLocker::default();
        for _ in 0..3 {
            let value = with_order_lock(&locker, "USR1NOabc", || async { 7 })
                .await
                .unwrap();
            assert_eq!(value, 7);
            assert!(locker.held.lock().unwrap().is_empty());
        }

        let keyed = KeyedMutexLocker::new();
        with_order_lock(&keyed, "USR1NOabc", || async {}).await.unwrap();
        assert_eq!(keyed.active_keys(), 0);
        let again = tokio::time::timeout(Duration::ZERO, keyed.acquire("USR1NOabc")).await;
        assert!(again.is_ok());
    }

    #[tokio::test]
    async fn dropped_guard_still_releases() {
        let locker = SlowReleaseLocker::default();
        drop(locker.acquire("t1").await.unwrap());
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(locker.held.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn different_trade_numbers_do_not_block() {
        let locker = KeyedMutexLocker::new();
        let _a = locker.acquire("a").await.unwrap();
        let b = tokio::time::timeout(Duration::from_millis(50), locker.acquire("b")).await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn lock_is_released_after_panic() {
        let locker = Arc::new(KeyedMutexLocker::new());
        let panicking = {
            let locker = locker.clone();
            tokio::spawn(async move {
                with_order_lock(locker.as_ref(), "t1", || async {
                    panic!("boom");
                })
                .await
            })
        };
        assert!(panicking.await.is_err());
        let again = tokio::time::timeout(Duration::from_millis(50), locker.acquire("t1")).await;
        assert!(again.is_ok());
    }
}
