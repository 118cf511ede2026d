//! Top-up orders, the per-trade lock that serializes their mutations and the
//! payment confirmation flow that credits quota.

pub mod lock;
pub mod payment;
pub mod status_cache;

use serde::{Deserialize, Serialize};

pub use lock::{KeyedMutexLocker, OrderLockGuard, OrderLocker, with_order_lock};
pub use payment::{
    ConfirmOutcome, HmacNotificationVerifier, HttpPaymentGateway, NotificationVerifier,
    OpenedOrder, PaymentAck, PaymentConfig, PaymentError, PaymentGateway, PaymentNotification,
    PaymentService, PaymentServiceParts, PrepayRequest, SIGNATURE_HEADER, SignedNotification,
    UnconfiguredPaymentGateway,
};
pub use status_cache::{DEFAULT_ORDER_STATUS_TTL_SECS, MemoryOrderStatusCache, OrderStatusCache};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Success,
}

impl OrderStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Success => "success",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(Self::Pending),
            "success" => Some(Self::Success),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopUpOrder {
    pub trade_no: String,
    pub user_id: i64,
    /// Requested top-up in currency units; credited as `amount * quota_per_unit`.
    pub amount: i64,
    /// What the payer is asked to pay, in cents.
    pub money_cents: i64,
    pub status: OrderStatus,
    pub created_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
}
