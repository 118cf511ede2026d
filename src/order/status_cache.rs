use std::sync::Arc;

use async_trait::async_trait;

use super::OrderStatus;
use crate::cache::TtlCache;
use crate::clock::Clock;
use crate::store::StoreError;

pub const DEFAULT_ORDER_STATUS_TTL_SECS: u64 = 6 * 60;

/// Short-lived, non-authoritative view of order status for the polling page.
#[async_trait]
pub trait OrderStatusCache: Send + Sync {
    async fn get(&self, trade_no: &str) -> Result<Option<OrderStatus>, StoreError>;

    async fn set(&self, trade_no: &str, status: OrderStatus) -> Result<(), StoreError>;
}

pub struct MemoryOrderStatusCache {
    entries: TtlCache<String, OrderStatus>,
}

impl MemoryOrderStatusCache {
    pub fn new(ttl_seconds: u64, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: TtlCache::new(ttl_seconds, clock),
        }
    }
}

#[async_trait]
impl OrderStatusCache for MemoryOrderStatusCache {
    async fn get(&self, trade_no: &str) -> Result<Option<OrderStatus>, StoreError> {
        Ok(self.entries.get(&trade_no.to_string()))
    }

    async fn set(&self, trade_no: &str, status: OrderStatus) -> Result<(), StoreError> {
        self.entries.insert(trade_no.to_string(), status);
        Ok(())
    }
}
