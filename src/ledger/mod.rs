//! Prepaid quota accounting.
//!
//! A call debits its estimated cost up front through [`QuotaLedger::reserve`]
//! and the returned [`Reservation`] must then be settled or released. A
//! reservation dropped without either is rolled back on the runtime, so no
//! debit outlives the request that made it.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::cache::TtlCache;
use crate::clock::Clock;
use crate::error::{RelayError, Result};
use crate::observability::Observability;
use crate::store::{LedgerStore, LogKind, ReservationRecord, UsageLogEntry, now_millis};
use crate::utils::ids;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// Freshness window for cached balances; `0` disables the cache.
    #[serde(default = "default_balance_cache_ttl_secs")]
    pub balance_cache_ttl_secs: u64,
}

fn default_balance_cache_ttl_secs() -> u64 {
    60
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            balance_cache_ttl_secs: default_balance_cache_ttl_secs(),
        }
    }
}

/// Everything the ledger needs to debit a call and later log its usage.
#[derive(Clone, Debug)]
pub struct ReserveRequest {
    pub user_id: i64,
    pub channel_id: i64,
    pub token_id: Option<i64>,
    pub token_name: Option<String>,
    pub model: String,
    pub estimated_quota: i64,
    /// Human-readable usage log line written at settlement.
    pub description: String,
    pub other: serde_json::Value,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Settlement {
    pub request_id: String,
    pub reserved: i64,
    pub charged: i64,
    pub refunded: i64,
}

pub struct QuotaLedger {
    store: Arc<dyn LedgerStore>,
    balances: TtlCache<i64, i64>,
    observability: Arc<Observability>,
}

impl QuotaLedger {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        config: &LedgerConfig,
        clock: Arc<dyn Clock>,
        observability: Arc<Observability>,
    ) -> Self {
        Self {
            store,
            balances: TtlCache::new(config.balance_cache_ttl_secs, clock),
            observability,
        }
    }

    pub fn store(&self) -> &Arc<dyn LedgerStore> {
        &self.store
    }

    /// Current balance, possibly up to one cache window stale. Never used for
    /// reservation decisions.
    pub async fn get_balance(&self, user_id: i64) -> Result<i64> {
        if let Some(balance) = self.balances.get(&user_id) {
            return Ok(balance);
        }
        let user = self.store.user(user_id).await?;
        self.balances.insert(user_id, user.quota);
        Ok(user.quota)
    }

    pub async fn user_group(&self, user_id: i64) -> Result<String> {
        Ok(self.store.user(user_id).await?.group)
    }

    /// Debits `estimated_quota` atomically in the store. Fails without
    /// touching the balance when it cannot cover the estimate.
    pub async fn reserve(&self, request: ReserveRequest) -> Result<Reservation> {
        if request.estimated_quota < 0 {
            return Err(RelayError::invalid_request(
                "invalid_quota",
                "estimated quota must not be negative",
            ));
        }
        let record = ReservationRecord {
            request_id: ids::request_id(),
            user_id: request.user_id,
            channel_id: request.channel_id,
            token_id: request.token_id,
            quota: request.estimated_quota,
            ts_ms: now_millis(),
        };

        let balance = match self.store.reserve_quota(&record).await {
            Ok(balance) => balance,
            Err(err) => {
                let err = RelayError::from(err);
                if matches!(err, RelayError::InsufficientQuota { .. }) {
                    self.observability.record_quota_rejected();
                }
                return Err(err);
            }
        };
        self.balances.invalidate(&request.user_id);
        tracing::debug!(
            request_id = %record.request_id,
            user_id = request.user_id,
            channel_id = request.channel_id,
            quota = request.estimated_quota,
            balance,
            "quota reserved"
        );

        Ok(Reservation {
            request_id: record.request_id,
            request,
            store: Some(self.store.clone()),
        })
    }

    /// Converts a reservation into its final charge.
    ///
    /// With `refundable` the charge is `min(actual, estimate)` and the rest is
    /// credited back; otherwise the full estimate is kept. Usage log and
    /// counter failures after the commit are logged, not returned.
    pub async fn settle(
        &self,
        mut reservation: Reservation,
        actual_quota: i64,
        refundable: bool,
    ) -> Result<Settlement> {
        let request = &reservation.request;
        let estimate = request.estimated_quota;
        if actual_quota > estimate {
            tracing::warn!(
                request_id = %reservation.request_id,
                model = %request.model,
                estimate,
                actual = actual_quota,
                "actual cost exceeds estimate; charging the estimate"
            );
        }
        let charged = if refundable {
            actual_quota.clamp(0, estimate)
        } else {
            estimate
        };

        let committed = self
            .store
            .commit_reservation(&reservation.request_id, charged)
            .await;
        self.balances.invalidate(&request.user_id);
        let committed = match committed {
            Ok(committed) => committed,
            Err(err) => {
                tracing::error!(
                    request_id = %reservation.request_id,
                    error = %err,
                    "failed to commit reservation; releasing it"
                );
                // Still armed: if this rollback fails too, the drop retries it.
                if self
                    .store
                    .rollback_reservation(&reservation.request_id)
                    .await
                    .is_ok()
                {
                    reservation.disarm();
                }
                return Err(err.into());
            }
        };
        reservation.disarm();
        let request = &reservation.request;
        let Some(committed) = committed else {
            tracing::warn!(
                request_id = %reservation.request_id,
                "reservation already settled"
            );
            return Ok(Settlement {
                request_id: reservation.request_id.clone(),
                reserved: estimate,
                charged: 0,
                refunded: 0,
            });
        };
        self.observability.record_settlement();

        if committed.charged > 0 {
            if let Err(err) = self
                .store
                .record_consumption(request.user_id, request.channel_id, committed.charged)
                .await
            {
                tracing::error!(
                    request_id = %reservation.request_id,
                    error = %err,
                    "failed to update usage counters"
                );
            }
        }
        if committed.reserved != 0 {
            let mut entry = UsageLogEntry::new(
                LogKind::Consume,
                request.user_id,
                committed.charged,
                request.description.clone(),
            );
            entry.channel_id = Some(request.channel_id);
            entry.token_id = request.token_id;
            entry.token_name = request.token_name.clone();
            entry.model = Some(request.model.clone());
            entry.other = request.other.clone();
            if let Err(err) = self.store.append_log(entry).await {
                tracing::error!(
                    request_id = %reservation.request_id,
                    error = %err,
                    "failed to write usage log"
                );
            }
        }

        tracing::info!(
            request_id = %reservation.request_id,
            user_id = request.user_id,
            channel_id = request.channel_id,
            reserved = committed.reserved,
            charged = committed.charged,
            refunded = committed.refunded,
            "quota settled"
        );
        Ok(Settlement {
            request_id: reservation.request_id.clone(),
            reserved: committed.reserved,
            charged: committed.charged,
            refunded: committed.refunded,
        })
    }

    /// Returns the whole reservation; used when no upstream cost was incurred.
    pub async fn release(&self, mut reservation: Reservation) -> Result<()> {
        let released = self
            .store
            .rollback_reservation(&reservation.request_id)
            .await;
        self.balances.invalidate(&reservation.request.user_id);
        // A failed rollback leaves the guard armed so the drop retries it.
        let released = released?;
        reservation.disarm();
        if released.is_some() {
            self.observability.record_release();
            tracing::info!(
                request_id = %reservation.request_id,
                user_id = reservation.request.user_id,
                quota = reservation.request.estimated_quota,
                "quota released"
            );
        }
        Ok(())
    }

    /// Purely additive top-up.
    pub async fn credit(&self, user_id: i64, amount: i64) -> Result<()> {
        if amount < 0 {
            return Err(RelayError::invalid_request(
                "invalid_quota",
                "credit amount must not be negative",
            ));
        }
        let result = self.store.increase_quota(user_id, amount).await;
        self.balances.invalidate(&user_id);
        result?;
        Ok(())
    }

    /// Credits back quota charged for work that later failed, with a refund log.
    pub async fn refund(
        &self,
        user_id: i64,
        quota: i64,
        channel_id: Option<i64>,
        content: String,
    ) -> Result<()> {
        self.credit(user_id, quota).await?;
        let mut entry = UsageLogEntry::new(LogKind::Refund, user_id, quota, content);
        entry.channel_id = channel_id;
        if let Err(err) = self.store.append_log(entry).await {
            tracing::error!(user_id, quota, error = %err, "failed to write refund log");
        }
        Ok(())
    }
}

/// An outstanding debit. Settle or release it; dropping it rolls it back.
pub struct Reservation {
    request_id: String,
    request: ReserveRequest,
    store: Option<Arc<dyn LedgerStore>>,
}

impl Reservation {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn user_id(&self) -> i64 {
        self.request.user_id
    }

    pub fn channel_id(&self) -> i64 {
        self.request.channel_id
    }

    pub fn estimated_quota(&self) -> i64 {
        self.request.estimated_quota
    }

    fn disarm(&mut self) {
        self.store = None;
    }
}

impl std::fmt::Debug for Reservation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reservation")
            .field("request_id", &self.request_id)
            .field("user_id", &self.request.user_id)
            .field("channel_id", &self.request.channel_id)
            .field("estimated_quota", &self.request.estimated_quota)
            .finish()
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        let Some(store) = self.store.take() else {
            return;
        };
        let request_id = std::mem::take(&mut self.request_id);
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::error!(%request_id, "reservation dropped outside a runtime; quota not released");
            return;
        };
        tracing::warn!(%request_id, "reservation dropped unsettled; releasing");
        handle.spawn(async move {
            if let Err(err) = store.rollback_reservation(&request_id).await {
                tracing::error!(%request_id, error = %err, "failed to release dropped reservation");
            }
        });
    }
}
