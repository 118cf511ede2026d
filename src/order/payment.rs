use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

use super::{OrderLocker, OrderStatus, OrderStatusCache, TopUpOrder, with_order_lock};
use crate::error::RelayError;
use crate::ledger::QuotaLedger;
use crate::observability::Observability;
use crate::pricing::PricingTable;
use crate::store::{LogKind, OrderStore, StoreError, UsageLogEntry};
use crate::utils::http::{MAX_ERROR_BODY_BYTES, response_text_truncated};
use crate::utils::ids;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "x-payment-signature";

#[derive(Clone, Serialize, Deserialize)]
pub struct PaymentConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_min_topup")]
    pub min_topup: i64,
    /// Currency charged per unit of top-up.
    #[serde(default = "default_price")]
    pub price: f64,
    #[serde(default)]
    pub topup_group_ratios: BTreeMap<String, f64>,
    /// When false, requested amounts are quota units and are divided by
    /// `quota_per_unit` before pricing.
    #[serde(default = "default_display_in_currency")]
    pub display_in_currency: bool,
    #[serde(default)]
    pub callback_address: String,
    #[serde(default)]
    pub prepay_url: Option<String>,
    #[serde(default)]
    pub prepay_key: Option<String>,
    #[serde(default)]
    pub prepay_key_env: Option<String>,
    #[serde(default)]
    pub notify_secret: Option<String>,
    #[serde(default)]
    pub notify_secret_env: Option<String>,
    #[serde(default = "default_order_status_ttl_secs")]
    pub order_status_ttl_secs: u64,
}

fn default_min_topup() -> i64 {
    1
}

fn default_price() -> f64 {
    7.3
}

fn default_display_in_currency() -> bool {
    true
}

fn default_order_status_ttl_secs() -> u64 {
    super::status_cache::DEFAULT_ORDER_STATUS_TTL_SECS
}

impl Default for PaymentConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            min_topup: default_min_topup(),
            price: default_price(),
            topup_group_ratios: BTreeMap::new(),
            display_in_currency: default_display_in_currency(),
            callback_address: String::new(),
            prepay_url: None,
            prepay_key: None,
            prepay_key_env: None,
            notify_secret: None,
            notify_secret_env: None,
            order_status_ttl_secs: default_order_status_ttl_secs(),
        }
    }
}

impl std::fmt::Debug for PaymentConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PaymentConfig")
            .field("enabled", &self.enabled)
            .field("min_topup", &self.min_topup)
            .field("price", &self.price)
            .field("topup_group_ratios", &self.topup_group_ratios)
            .field("display_in_currency", &self.display_in_currency)
            .field("callback_address", &self.callback_address)
            .field("prepay_url", &self.prepay_url)
            .field("prepay_key", &self.prepay_key.as_ref().map(|_| "<redacted>"))
            .field("notify_secret", &self.notify_secret.as_ref().map(|_| "<redacted>"))
            .field("order_status_ttl_secs", &self.order_status_ttl_secs)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum PaymentError {
    #[error("payment is not configured")]
    NotConfigured,
    #[error("top-up amount must be at least {min}")]
    BelowMinimum { min: i64 },
    #[error("top-up money is too low")]
    AmountTooLow,
    #[error("invalid notification signature")]
    InvalidSignature,
    #[error("invalid notification: {0}")]
    InvalidNotification(String),
    #[error("order not found: {trade_no}")]
    OrderNotFound { trade_no: String },
    #[error("paid amount mismatch: expected {expected_cents} cents, paid {paid_cents} cents")]
    AmountMismatch { expected_cents: i64, paid_cents: i64 },
    #[error("prepay failed: {message}")]
    Prepay { message: String },
    #[error("order lock error: {message}")]
    Lock { message: String },
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error(transparent)]
    Relay(#[from] RelayError),
}

impl PaymentError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotConfigured => "payment_not_configured",
            Self::BelowMinimum { .. } => "topup_below_minimum",
            Self::AmountTooLow => "topup_amount_too_low",
            Self::InvalidSignature => "invalid_signature",
            Self::InvalidNotification(_) => "invalid_notification",
            Self::OrderNotFound { .. } => "order_not_found",
            Self::AmountMismatch { .. } => "amount_mismatch",
            Self::Prepay { .. } => "prepay_failed",
            Self::Lock { .. } => "order_lock_failed",
            Self::Store(_) => "store_error",
            Self::Relay(err) => err.code(),
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Self::BelowMinimum { .. }
            | Self::AmountTooLow
            | Self::InvalidNotification(_)
            | Self::AmountMismatch { .. } => 400,
            Self::InvalidSignature => 401,
            Self::OrderNotFound { .. } => 404,
            Self::NotConfigured => 503,
            Self::Prepay { .. } => 502,
            Self::Lock { .. } | Self::Store(_) => 500,
            Self::Relay(err) => err.status_code(),
        }
    }
}

/// Acknowledgment body returned to the payment network.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentAck {
    pub code: String,
    pub message: String,
}

impl PaymentAck {
    pub fn ok() -> Self {
        Self {
            code: "SUCCESS".to_string(),
            message: "OK".to_string(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            code: "ERROR".to_string(),
            message: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == "SUCCESS"
    }
}

/// Raw webhook delivery as received.
#[derive(Clone, Debug)]
pub struct SignedNotification {
    pub signature: Option<String>,
    pub body: Bytes,
}

/// Verified content of a payment notification.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentNotification {
    #[serde(alias = "out_trade_no")]
    pub trade_no: String,
    pub transaction_id: String,
    /// What the payer actually paid, in cents.
    #[serde(alias = "payer_total")]
    pub paid_cents: i64,
}

/// Authenticates and decodes webhook deliveries.
pub trait NotificationVerifier: Send + Sync {
    fn verify(&self, notification: &SignedNotification) -> Result<PaymentNotification, PaymentError>;
}

/// Hex HMAC-SHA256 of the raw body under a shared secret.
pub struct HmacNotificationVerifier {
    secret: Vec<u8>,
}

impl HmacNotificationVerifier {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    pub fn sign(&self, body: &[u8]) -> Result<String, PaymentError> {
        let mut mac = self.mac()?;
        mac.update(body);
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    fn mac(&self) -> Result<HmacSha256, PaymentError> {
        HmacSha256::new_from_slice(&self.secret).map_err(|_| PaymentError::InvalidSignature)
    }
}

impl NotificationVerifier for HmacNotificationVerifier {
    fn verify(&self, notification: &SignedNotification) -> Result<PaymentNotification, PaymentError> {
        let signature = notification
            .signature
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or(PaymentError::InvalidSignature)?;
        let expected = hex::decode(signature).map_err(|_| PaymentError::InvalidSignature)?;
        let mut mac = self.mac()?;
        mac.update(&notification.body);
        mac.verify_slice(&expected)
            .map_err(|_| PaymentError::InvalidSignature)?;

        serde_json::from_slice(&notification.body)
            .map_err(|err| PaymentError::InvalidNotification(err.to_string()))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PrepayRequest {
    pub trade_no: String,
    pub description: String,
    pub notify_url: String,
    pub total_cents: i64,
}

/// Opens a payment intent with the payment provider and returns the URL the
/// payer scans or visits.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn prepay(&self, request: &PrepayRequest) -> Result<String, PaymentError>;
}

/// Prepay over HTTP: POSTs the request as JSON and reads `code_url` back.
pub struct HttpPaymentGateway {
    client: reqwest::Client,
    url: String,
    key: Option<String>,
}

impl HttpPaymentGateway {
    pub fn new(client: reqwest::Client, url: impl Into<String>, key: Option<String>) -> Self {
        Self {
            client,
            url: url.into(),
            key,
        }
    }
}

#[derive(Deserialize)]
struct PrepayReply {
    code_url: String,
}

#[async_trait]
impl PaymentGateway for HttpPaymentGateway {
    async fn prepay(&self, request: &PrepayRequest) -> Result<String, PaymentError> {
        let mut req = self.client.post(&self.url).json(request);
        if let Some(key) = &self.key {
            req = req.bearer_auth(key);
        }
        let response = req.send().await.map_err(|err| PaymentError::Prepay {
            message: err.to_string(),
        })?;
        let status = response.status();
        if !status.is_success() {
            let body = response_text_truncated(response, MAX_ERROR_BODY_BYTES).await;
            return Err(PaymentError::Prepay {
                message: format!("status {status}: {body}"),
            });
        }
        let reply: PrepayReply = response.json().await.map_err(|err| PaymentError::Prepay {
            message: format!("decode reply: {err}"),
        })?;
        Ok(reply.code_url)
    }
}

/// Used when no payment provider is configured.
#[derive(Debug, Default)]
pub struct UnconfiguredPaymentGateway;

#[async_trait]
impl PaymentGateway for UnconfiguredPaymentGateway {
    async fn prepay(&self, _request: &PrepayRequest) -> Result<String, PaymentError> {
        Err(PaymentError::NotConfigured)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct OpenedOrder {
    pub trade_no: String,
    pub pay_url: String,
    pub money: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConfirmOutcome {
    Credited { quota: i64 },
    AlreadyCompleted,
}

pub struct PaymentService {
    config: PaymentConfig,
    orders: Arc<dyn OrderStore>,
    ledger: Arc<QuotaLedger>,
    pricing: Arc<PricingTable>,
    locker: Arc<dyn OrderLocker>,
    status_cache: Arc<dyn OrderStatusCache>,
    gateway: Arc<dyn PaymentGateway>,
    verifier: Arc<dyn NotificationVerifier>,
    observability: Arc<Observability>,
}

pub struct PaymentServiceParts {
    pub orders: Arc<dyn OrderStore>,
    pub ledger: Arc<QuotaLedger>,
    pub pricing: Arc<PricingTable>,
    pub locker: Arc<dyn OrderLocker>,
    pub status_cache: Arc<dyn OrderStatusCache>,
    pub gateway: Arc<dyn PaymentGateway>,
    pub verifier: Arc<dyn NotificationVerifier>,
    pub observability: Arc<Observability>,
}

impl PaymentService {
    pub fn new(config: PaymentConfig, parts: PaymentServiceParts) -> Self {
        Self {
            config,
            orders: parts.orders,
            ledger: parts.ledger,
            pricing: parts.pricing,
            locker: parts.locker,
            status_cache: parts.status_cache,
            gateway: parts.gateway,
            verifier: parts.verifier,
            observability: parts.observability,
        }
    }

    fn topup_group_ratio(&self, group: &str) -> f64 {
        match self.config.topup_group_ratios.get(group) {
            Some(ratio) if ratio.is_finite() && *ratio > 0.0 => *ratio,
            _ => 1.0,
        }
    }

    /// Currency units a requested amount maps to.
    fn amount_in_currency(&self, requested: i64) -> i64 {
        if self.config.display_in_currency {
            return requested;
        }
        let per_unit = self.pricing.quota_per_unit();
        if per_unit <= 0.0 {
            return requested;
        }
        (requested as f64 / per_unit) as i64
    }

    /// Creates a pending order and a payment intent for it.
    pub async fn open_order(&self, user_id: i64, amount: i64) -> Result<OpenedOrder, PaymentError> {
        if !self.config.enabled {
            return Err(PaymentError::NotConfigured);
        }
        if amount < self.config.min_topup {
            return Err(PaymentError::BelowMinimum {
                min: self.config.min_topup,
            });
        }
        let group = self.ledger.user_group(user_id).await?;
        let amount = self.amount_in_currency(amount);
        let money = amount as f64 * self.config.price * self.topup_group_ratio(&group);
        if !money.is_finite() || money < 0.01 {
            return Err(PaymentError::AmountTooLow);
        }
        let money_cents = (money * 100.0).round() as i64;

        let created_at = now_unix_seconds();
        let order = TopUpOrder {
            trade_no: ids::trade_no(user_id, created_at),
            user_id,
            amount,
            money_cents,
            status: OrderStatus::Pending,
            created_at,
            completed_at: None,
            transaction_id: None,
        };
        self.orders.insert_order(&order).await?;

        let pay_url = self
            .gateway
            .prepay(&PrepayRequest {
                trade_no: order.trade_no.clone(),
                description: format!("top-up order of user {user_id}"),
                notify_url: format!(
                    "{}/api/user/topup/notify",
                    self.config.callback_address.trim_end_matches('/')
                ),
                total_cents: money_cents,
            })
            .await?;

        self.cache_status(&order.trade_no, OrderStatus::Pending).await;
        tracing::info!(
            trade_no = %order.trade_no,
            user_id,
            amount,
            money_cents,
            "top-up order opened"
        );
        Ok(OpenedOrder {
            trade_no: order.trade_no,
            pay_url,
            money: money_cents as f64 / 100.0,
        })
    }

    /// Verifies and applies a webhook delivery, always producing an ack.
    pub async fn handle_notification(&self, notification: SignedNotification) -> PaymentAck {
        let result = match self.verifier.verify(&notification) {
            Ok(notification) => self.confirm(notification).await,
            Err(err) => Err(err),
        };
        match result {
            Ok(_) => PaymentAck::ok(),
            Err(err) => {
                self.observability.record_payment_rejected();
                tracing::warn!(code = err.code(), error = %err, "payment notification rejected");
                PaymentAck::error(err.to_string())
            }
        }
    }

    /// Moves a pending order to success and credits the user exactly once.
    ///
    /// The order is marked before the credit, so a failure in between can
    /// lose a credit (logged for reconciliation) but never double it.
    pub async fn confirm(
        &self,
        notification: PaymentNotification,
    ) -> Result<ConfirmOutcome, PaymentError> {
        let trade_no = notification.trade_no.clone();
        with_order_lock(self.locker.as_ref(), &trade_no, || {
            self.confirm_locked(notification)
        })
        .await?
    }

    async fn confirm_locked(
        &self,
        notification: PaymentNotification,
    ) -> Result<ConfirmOutcome, PaymentError> {
        let trade_no = notification.trade_no.as_str();
        let order = self
            .orders
            .order(trade_no)
            .await?
            .ok_or_else(|| PaymentError::OrderNotFound {
                trade_no: trade_no.to_string(),
            })?;
        if notification.paid_cents != order.money_cents {
            return Err(PaymentError::AmountMismatch {
                expected_cents: order.money_cents,
                paid_cents: notification.paid_cents,
            });
        }
        if order.status != OrderStatus::Pending {
            tracing::debug!(%trade_no, "order already completed");
            return Ok(ConfirmOutcome::AlreadyCompleted);
        }

        let completed = self
            .orders
            .complete_order(trade_no, &notification.transaction_id, now_unix_seconds())
            .await?;
        if !completed {
            return Ok(ConfirmOutcome::AlreadyCompleted);
        }

        let quota = self.pricing.quota_for_amount(order.amount);
        if let Err(err) = self.ledger.credit(order.user_id, quota).await {
            tracing::error!(
                %trade_no,
                user_id = order.user_id,
                quota,
                error = %err,
                "order marked paid but quota credit failed"
            );
            return Err(err.into());
        }

        let content = format!(
            "online top-up succeeded: credited {quota} quota, paid {:.2}",
            order.money_cents as f64 / 100.0
        );
        let mut entry = UsageLogEntry::new(LogKind::Topup, order.user_id, quota, content);
        entry.other = serde_json::json!({
            "trade_no": trade_no,
            "transaction_id": notification.transaction_id,
        });
        if let Err(err) = self.ledger.store().append_log(entry).await {
            tracing::error!(%trade_no, error = %err, "failed to write top-up log");
        }
        self.cache_status(trade_no, OrderStatus::Success).await;
        self.observability.record_payment_confirmed();
        tracing::info!(%trade_no, user_id = order.user_id, quota, "top-up credited");
        Ok(ConfirmOutcome::Credited { quota })
    }

    /// Last known status: the cache first, then the order store.
    pub async fn order_status(&self, trade_no: &str) -> Result<Option<OrderStatus>, PaymentError> {
        match self.status_cache.get(trade_no).await {
            Ok(Some(status)) => return Ok(Some(status)),
            Ok(None) => {}
            Err(err) => tracing::warn!(%trade_no, error = %err, "order status cache read failed"),
        }
        let Some(order) = self.orders.order(trade_no).await? else {
            return Ok(None);
        };
        self.cache_status(trade_no, order.status).await;
        Ok(Some(order.status))
    }

    async fn cache_status(&self, trade_no: &str, status: OrderStatus) {
        if let Err(err) = self.status_cache.set(trade_no, status).await {
            tracing::warn!(%trade_no, error = %err, "order status cache write failed");
        }
    }
}

fn now_unix_seconds() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|duration| duration.as_secs() as i64)
        .unwrap_or(0)
}
