//! Upstream channels: the configured credentials/endpoints a call can be
//! routed to, their observed health and any disable requests raised by the
//! relay path.

pub mod health;
pub mod selector;

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::store::now_millis;

pub use health::{ChannelHealth, ChannelHealthSnapshot, CircuitBreakerConfig, FailureKind};
pub use selector::ChannelSelector;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelStatus {
    #[default]
    Enabled,
    ManuallyDisabled,
    AutoDisabled,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct Channel {
    pub id: i64,
    #[serde(default)]
    pub name: String,
    pub platform: String,
    pub base_url: String,
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub models: Vec<String>,
    #[serde(default)]
    pub status: ChannelStatus,
    #[serde(default)]
    pub priority: i64,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    1
}

impl Channel {
    pub fn is_enabled(&self) -> bool {
        self.status == ChannelStatus::Enabled
    }

    pub fn supports_model(&self, model: &str) -> bool {
        self.models.iter().any(|m| m == model)
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("platform", &self.platform)
            .field("base_url", &self.base_url)
            .field("key", &"<redacted>")
            .field("models", &self.models)
            .field("status", &self.status)
            .field("priority", &self.priority)
            .field("weight", &self.weight)
            .finish()
    }
}

/// A request for an operator to disable a channel. The relay never flips
/// channel status itself.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisableRequest {
    pub channel_id: i64,
    pub reason: String,
    pub requested_at_ms: u64,
}

/// Read-mostly channel table plus advisory health state.
pub struct ChannelRegistry {
    channels: RwLock<BTreeMap<i64, Arc<Channel>>>,
    health: Mutex<HashMap<i64, ChannelHealth>>,
    disable_requests: Mutex<BTreeMap<i64, DisableRequest>>,
    circuit_breaker: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
}

impl ChannelRegistry {
    pub fn new(
        channels: impl IntoIterator<Item = Channel>,
        circuit_breaker: CircuitBreakerConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let channels = channels
            .into_iter()
            .map(|channel| (channel.id, Arc::new(channel)))
            .collect();
        Self {
            channels: RwLock::new(channels),
            health: Mutex::new(HashMap::new()),
            disable_requests: Mutex::new(BTreeMap::new()),
            circuit_breaker,
            clock,
        }
    }

    pub fn get(&self, channel_id: i64) -> Option<Arc<Channel>> {
        let channels = self.channels.read().unwrap_or_else(PoisonError::into_inner);
        channels.get(&channel_id).cloned()
    }

    pub fn snapshot(&self) -> Vec<Arc<Channel>> {
        let channels = self.channels.read().unwrap_or_else(PoisonError::into_inner);
        channels.values().cloned().collect()
    }

    /// Administrative upsert; the only path that changes a channel record.
    pub fn upsert(&self, channel: Channel) {
        let mut channels = self.channels.write().unwrap_or_else(PoisonError::into_inner);
        channels.insert(channel.id, Arc::new(channel));
    }

    pub fn is_healthy(&self, channel_id: i64) -> bool {
        let now = self.clock.now_epoch_seconds();
        let health = self.health.lock().unwrap_or_else(PoisonError::into_inner);
        health
            .get(&channel_id)
            .map(|state| state.is_healthy(now))
            .unwrap_or(true)
    }

    pub fn record_success(&self, channel_id: i64) {
        let mut health = self.health.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(state) = health.get_mut(&channel_id) {
            state.record_success();
        }
    }

    pub fn record_failure(&self, channel_id: i64, kind: FailureKind, message: String) {
        let now = self.clock.now_epoch_seconds();
        let mut health = self.health.lock().unwrap_or_else(PoisonError::into_inner);
        health
            .entry(channel_id)
            .or_default()
            .record_failure(now, &self.circuit_breaker, kind, message);
    }

    pub fn health_snapshot(&self) -> Vec<ChannelHealthSnapshot> {
        let health = self.health.lock().unwrap_or_else(PoisonError::into_inner);
        let mut out: Vec<_> = health
            .iter()
            .map(|(channel_id, state)| state.snapshot(*channel_id))
            .collect();
        out.sort_by_key(|snapshot| snapshot.channel_id);
        out
    }

    /// Records an advisory disable request. Returns `true` only for the first
    /// request per channel until the requests are drained.
    pub fn request_disable(&self, channel_id: i64, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        let mut requests = self
            .disable_requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if requests.contains_key(&channel_id) {
            return false;
        }
        tracing::warn!(channel_id, %reason, "requesting channel disable");
        requests.insert(
            channel_id,
            DisableRequest {
                channel_id,
                reason,
                requested_at_ms: now_millis(),
            },
        );
        true
    }

    pub fn disable_requests(&self) -> Vec<DisableRequest> {
        let requests = self
            .disable_requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        requests.values().cloned().collect()
    }

    pub fn drain_disable_requests(&self) -> Vec<DisableRequest> {
        let mut requests = self
            .disable_requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        std::mem::take(&mut *requests).into_values().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    pub(crate) fn channel(id: i64, platform: &str, models: &[&str]) -> Channel {
        Channel {
            id,
            name: format!("channel-{id}"),
            platform: platform.to_string(),
            base_url: "http://localhost".to_string(),
            key: "sk-secret".to_string(),
            models: models.iter().map(|m| m.to_string()).collect(),
            status: ChannelStatus::Enabled,
            priority: 0,
            weight: 1,
        }
    }

    #[test]
    fn debug_redacts_key() {
        let rendered = format!("{:?}", channel(1, "suno", &["suno_music"]));
        assert!(!rendered.contains("sk-secret"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn disable_requests_are_deduplicated() {
        let registry = ChannelRegistry::new(
            [channel(1, "suno", &["suno_music"])],
            CircuitBreakerConfig::default(),
            Arc::new(ManualClock::new(0)),
        );
        assert!(registry.request_disable(1, "status 500"));
        assert!(!registry.request_disable(1, "status 502"));
        assert_eq!(registry.disable_requests().len(), 1);
        assert!(registry.get(1).is_some_and(|c| c.is_enabled()));

        assert_eq!(registry.drain_disable_requests().len(), 1);
        assert!(registry.request_disable(1, "again"));
    }

    #[test]
    fn failures_mark_channel_unhealthy_until_cooldown() {
        let clock = Arc::new(ManualClock::new(1_000));
        let registry = ChannelRegistry::new(
            [channel(1, "suno", &["suno_music"])],
            CircuitBreakerConfig {
                enabled: true,
                failure_threshold: 1,
                cooldown_seconds: 10,
            },
            clock.clone(),
        );
        registry.record_failure(1, FailureKind::Status(502), "bad gateway".to_string());
        assert!(!registry.is_healthy(1));
        clock.advance(10);
        assert!(registry.is_healthy(1));
    }
}
