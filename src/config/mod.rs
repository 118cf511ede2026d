//! File configuration for the relay: channels, tokens, seed users, pricing
//! and the knobs of every service. Loaded once; reloading means building a
//! new set of services from a fresh [`RelayConfig`].

mod env;

use std::collections::BTreeSet;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::channel::{Channel, ChannelStatus, CircuitBreakerConfig};
use crate::ledger::LedgerConfig;
use crate::order::PaymentConfig;
use crate::pricing::PricingConfig;
use crate::relay::RelaySettings;
use crate::store::UserRecord;
use crate::task::TaskPollConfig;

pub use env::{Env, parse_dotenv};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {message}")]
    Parse { path: String, message: String },
    #[error("unsupported config format: {path} (expected .toml, .json or .yaml)")]
    UnsupportedFormat { path: String },
    #[error("missing secret for {what}: env {env} is not set")]
    MissingSecret { what: String, env: String },
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConfigFormat {
    Toml,
    Json,
    Yaml,
}

impl ConfigFormat {
    pub fn from_path(path: &Path) -> Option<Self> {
        match path.extension()?.to_str()?.to_ascii_lowercase().as_str() {
            "toml" => Some(Self::Toml),
            "json" => Some(Self::Json),
            "yaml" | "yml" => Some(Self::Yaml),
            _ => None,
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub id: i64,
    #[serde(default)]
    pub name: String,
    pub platform: String,
    pub base_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_env: Option<String>,
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

impl std::fmt::Debug for ChannelConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelConfig")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("platform", &self.platform)
            .field("base_url", &self.base_url)
            .field("key", &self.key.as_ref().map(|_| "<redacted>"))
            .field("key_env", &self.key_env)
            .field("models", &self.models)
            .field("status", &self.status)
            .field("priority", &self.priority)
            .field("weight", &self.weight)
            .finish()
    }
}

impl ChannelConfig {
    pub fn resolve(&self, env: &Env) -> Result<Channel, ConfigError> {
        let key = env
            .resolve(
                &format!("channel {}", self.id),
                self.key.as_deref(),
                self.key_env.as_deref(),
            )?
            .unwrap_or_default();
        Ok(Channel {
            id: self.id,
            name: self.name.clone(),
            platform: self.platform.clone(),
            base_url: self.base_url.clone(),
            key,
            models: self.models.clone(),
            status: self.status,
            priority: self.priority,
            weight: self.weight,
        })
    }
}

/// Caller credential: `Authorization: Bearer <key>` bills `user_id`.
#[derive(Clone, Serialize, Deserialize)]
pub struct TokenConfig {
    pub id: i64,
    pub key: String,
    #[serde(default)]
    pub name: String,
    pub user_id: i64,
    #[serde(default = "default_token_enabled")]
    pub enabled: bool,
}

fn default_token_enabled() -> bool {
    true
}

impl std::fmt::Debug for TokenConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenConfig")
            .field("id", &self.id)
            .field("key", &"<redacted>")
            .field("name", &self.name)
            .field("user_id", &self.user_id)
            .field("enabled", &self.enabled)
            .finish()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UserSeed {
    pub id: i64,
    #[serde(default = "default_group")]
    pub group: String,
    #[serde(default)]
    pub quota: i64,
}

fn default_group() -> String {
    "default".to_string()
}

impl From<&UserSeed> for UserRecord {
    fn from(seed: &UserSeed) -> Self {
        UserRecord::new(seed.id, seed.group.clone(), seed.quota)
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub channels: Vec<ChannelConfig>,
    #[serde(default)]
    pub tokens: Vec<TokenConfig>,
    #[serde(default)]
    pub users: Vec<UserSeed>,
    #[serde(default)]
    pub pricing: PricingConfig,
    #[serde(default)]
    pub relay: RelaySettings,
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(default)]
    pub task_poll: TaskPollConfig,
    #[serde(default)]
    pub payment: PaymentConfig,
}

impl RelayConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let display = path.display().to_string();
        let format = ConfigFormat::from_path(path).ok_or_else(|| ConfigError::UnsupportedFormat {
            path: display.clone(),
        })?;
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: display.clone(),
            source,
        })?;
        Self::parse(&raw, format, &display)
    }

    pub fn parse(raw: &str, format: ConfigFormat, origin: &str) -> Result<Self, ConfigError> {
        let parse_err = |message: String| ConfigError::Parse {
            path: origin.to_string(),
            message,
        };
        let config: Self = match format {
            ConfigFormat::Toml => toml::from_str(raw).map_err(|err| parse_err(err.to_string()))?,
            ConfigFormat::Json => {
                serde_json::from_str(raw).map_err(|err| parse_err(err.to_string()))?
            }
            #[cfg(feature = "config-yaml")]
            ConfigFormat::Yaml => {
                serde_yaml::from_str(raw).map_err(|err| parse_err(err.to_string()))?
            }
            #[cfg(not(feature = "config-yaml"))]
            ConfigFormat::Yaml => {
                return Err(parse_err(
                    "yaml config requires the `config-yaml` feature".to_string(),
                ));
            }
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut channel_ids = BTreeSet::new();
        for channel in &self.channels {
            if !channel_ids.insert(channel.id) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate channel id {}",
                    channel.id
                )));
            }
            if channel.platform.trim().is_empty() || channel.base_url.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "channel {} needs a platform and base_url",
                    channel.id
                )));
            }
        }

        let mut token_keys = BTreeSet::new();
        for token in &self.tokens {
            if token.key.trim().is_empty() {
                return Err(ConfigError::Invalid(format!("token {} has an empty key", token.id)));
            }
            if !token_keys.insert(token.key.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "token {} reuses another token's key",
                    token.id
                )));
            }
        }

        if self.pricing.quota_per_unit <= 0.0 || !self.pricing.quota_per_unit.is_finite() {
            return Err(ConfigError::Invalid(
                "pricing.quota_per_unit must be positive".to_string(),
            ));
        }
        if self.payment.enabled && self.payment.price <= 0.0 {
            return Err(ConfigError::Invalid(
                "payment.price must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn resolve_channels(&self, env: &Env) -> Result<Vec<Channel>, ConfigError> {
        self.channels.iter().map(|channel| channel.resolve(env)).collect()
    }

    pub fn notify_secret(&self, env: &Env) -> Result<Option<String>, ConfigError> {
        env.resolve(
            "payment notify secret",
            self.payment.notify_secret.as_deref(),
            self.payment.notify_secret_env.as_deref(),
        )
    }

    pub fn prepay_key(&self, env: &Env) -> Result<Option<String>, ConfigError> {
        env.resolve(
            "payment prepay key",
            self.payment.prepay_key.as_deref(),
            self.payment.prepay_key_env.as_deref(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[[channels]]
id = 1
name = "suno-main"
platform = "suno"
base_url = "https://suno.example"
key_env = "DITTO_RELAY_TEST_SUNO_KEY"
models = ["suno_music", "suno_lyrics"]
priority = 10

[[tokens]]
id = 1
key = "sk-user-1"
name = "default"
user_id = 1

[[users]]
id = 1
quota = 1000

[pricing]
quota_per_unit = 1000.0

[pricing.model_prices]
suno_music = 0.15

[task_poll]
interval_secs = 5
"#;

    #[test]
    fn toml_config_loads_with_defaults() {
        let config = RelayConfig::parse(SAMPLE, ConfigFormat::Toml, "relay.toml").unwrap();
        assert_eq!(config.channels.len(), 1);
        assert_eq!(config.users[0].group, "default");
        assert_eq!(config.task_poll.interval_secs, 5);
        assert_eq!(config.task_poll.batch_size, 100);
        assert_eq!(config.relay.upstream_timeout_secs, 300);
        assert!(!config.payment.enabled);

        let env = Env::parse_dotenv("DITTO_RELAY_TEST_SUNO_KEY=sk-suno");
        let channels = config.resolve_channels(&env).unwrap();
        assert_eq!(channels[0].key, "sk-suno");
        assert!(channels[0].is_enabled());
    }

    #[test]
    fn duplicate_channel_ids_are_rejected() {
        let raw = r#"{"channels": [
            {"id": 1, "platform": "suno", "base_url": "http://a"},
            {"id": 1, "platform": "suno", "base_url": "http://b"}
        ]}"#;
        let err = RelayConfig::parse(raw, ConfigFormat::Json, "relay.json").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn format_follows_extension() {
        assert_eq!(
            ConfigFormat::from_path(Path::new("relay.TOML")),
            Some(ConfigFormat::Toml)
        );
        assert_eq!(
            ConfigFormat::from_path(Path::new("relay.yml")),
            Some(ConfigFormat::Yaml)
        );
        assert_eq!(ConfigFormat::from_path(Path::new("relay.ini")), None);
    }

    #[test]
    fn debug_output_hides_secrets() {
        let config = RelayConfig::parse(SAMPLE, ConfigFormat::Toml, "relay.toml").unwrap();
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("sk-user-1"));
    }
}
