use serde::{Deserialize, Serialize};

use crate::error::RelayError;
use crate::store::now_millis;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_cooldown_seconds")]
    pub cooldown_seconds: u64,
}

fn default_enabled() -> bool {
    true
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_cooldown_seconds() -> u64 {
    30
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            failure_threshold: default_failure_threshold(),
            cooldown_seconds: default_cooldown_seconds(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelHealthSnapshot {
    pub channel_id: i64,
    pub consecutive_failures: u32,
    pub unhealthy_until_epoch_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_failure_ts_ms: Option<u64>,
}

#[derive(Clone, Debug, Default)]
pub struct ChannelHealth {
    consecutive_failures: u32,
    unhealthy_until_epoch_seconds: Option<u64>,
    last_error: Option<String>,
    last_failure_ts_ms: Option<u64>,
}

impl ChannelHealth {
    pub fn snapshot(&self, channel_id: i64) -> ChannelHealthSnapshot {
        ChannelHealthSnapshot {
            channel_id,
            consecutive_failures: self.consecutive_failures,
            unhealthy_until_epoch_seconds: self.unhealthy_until_epoch_seconds,
            last_error: self.last_error.clone(),
            last_failure_ts_ms: self.last_failure_ts_ms,
        }
    }

    pub fn is_healthy(&self, now_epoch_seconds: u64) -> bool {
        match self.unhealthy_until_epoch_seconds {
            Some(until) => now_epoch_seconds >= until,
            None => true,
        }
    }

    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.unhealthy_until_epoch_seconds = None;
        self.last_error = None;
        self.last_failure_ts_ms = None;
    }

    pub fn record_failure(
        &mut self,
        now_epoch_seconds: u64,
        circuit_breaker: &CircuitBreakerConfig,
        kind: FailureKind,
        message: String,
    ) {
        self.last_error = Some(message);
        self.last_failure_ts_ms = Some(now_millis());

        if !circuit_breaker.enabled || !kind.counts() {
            return;
        }

        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        if self.consecutive_failures >= circuit_breaker.failure_threshold {
            self.unhealthy_until_epoch_seconds =
                Some(now_epoch_seconds.saturating_add(circuit_breaker.cooldown_seconds));
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureKind {
    Network,
    Timeout,
    Status(u16),
}

impl FailureKind {
    pub fn from_error(err: &RelayError) -> Option<Self> {
        match err {
            RelayError::Transport { .. } => Some(Self::Network),
            RelayError::Timeout { .. } => Some(Self::Timeout),
            RelayError::Upstream { status, .. } => Some(Self::Status(*status)),
            _ => None,
        }
    }

    /// Only failures attributable to the channel trip the breaker.
    pub fn counts(self) -> bool {
        match self {
            Self::Network | Self::Timeout => true,
            Self::Status(code) => code >= 500,
        }
    }
}
