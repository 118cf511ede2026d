//! Per-platform translation between the relay's canonical request and an
//! upstream wire format.
//!
//! The orchestrator drives every adaptor through the same sequence:
//! `validate_request_and_set_action` (before any channel or quota work),
//! `init` once a channel is bound, then `build_request_body`, `do_request`
//! and `do_response`. Async platforms additionally answer `fetch_tasks` for
//! the background poller.

pub mod openai;
pub mod suno;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::channel::Channel;
use crate::error::{RelayError, Result};
use crate::task::ProviderTaskUpdate;
use crate::utils::http::{
    MAX_ERROR_BODY_BYTES, MAX_RESPONSE_BODY_BYTES, response_bytes_truncated, truncated_text,
};

pub use openai::OpenAiAdaptor;
pub use suno::SunoAdaptor;

/// Per-call context bound to an adaptor by [`TaskAdaptor::init`].
#[derive(Clone)]
pub struct RelayInfo {
    pub request_id: String,
    pub platform: String,
    pub action: String,
    pub model: String,
    pub user_id: i64,
    pub token_id: Option<i64>,
    pub channel_id: i64,
    pub base_url: String,
    pub api_key: String,
    pub origin_task_id: Option<String>,
}

impl RelayInfo {
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }
}

impl std::fmt::Debug for RelayInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayInfo")
            .field("request_id", &self.request_id)
            .field("platform", &self.platform)
            .field("action", &self.action)
            .field("model", &self.model)
            .field("user_id", &self.user_id)
            .field("channel_id", &self.channel_id)
            .field("base_url", &self.base_url)
            .field("api_key", &"<redacted>")
            .finish()
    }
}

/// Canonical inbound call. `model` and `origin_task_id` are filled in by
/// validation; `origin_provider_task_id` once the origin task is resolved.
#[derive(Clone, Debug, Default)]
pub struct TaskRequest {
    pub action: String,
    pub model: String,
    pub body: serde_json::Value,
    pub origin_task_id: Option<String>,
    /// Provider-side id of the origin task. Upstream bodies carry this one.
    pub origin_provider_task_id: Option<String>,
}

impl TaskRequest {
    pub fn new(action: impl Into<String>, body: serde_json::Value) -> Self {
        Self {
            action: action.into(),
            model: String::new(),
            body,
            origin_task_id: None,
            origin_provider_task_id: None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct UpstreamResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Bytes,
}

/// What an accepted upstream call produced.
#[derive(Clone, Debug)]
pub struct TaskSubmission {
    /// Provider job id; `None` for synchronous platforms.
    pub task_id: Option<String>,
    /// Opaque payload stored on the task.
    pub data: serde_json::Value,
    /// Reply returned to the caller as-is.
    pub body: Bytes,
    pub content_type: Option<String>,
    /// Work done in units of one priced call.
    pub billed_units: f64,
}

#[async_trait]
pub trait TaskAdaptor: Send + Sync {
    fn platform(&self) -> &'static str;

    /// Whether accepted calls become tracked tasks.
    fn is_async(&self) -> bool;

    fn init(&mut self, info: RelayInfo);

    fn validate_request_and_set_action(&mut self, request: &mut TaskRequest) -> Result<()>;

    fn build_request_body(&self, request: &TaskRequest) -> Result<Bytes>;

    /// Sends the call. Non-2xx replies and transport failures are errors.
    async fn do_request(&self, body: Bytes) -> Result<UpstreamResponse>;

    fn do_response(&self, response: UpstreamResponse) -> Result<TaskSubmission>;

    /// Current provider-side status of jobs submitted through `channel`.
    async fn fetch_tasks(
        &self,
        _channel: &Channel,
        _provider_task_ids: &[String],
    ) -> Result<Vec<ProviderTaskUpdate>> {
        Ok(Vec::new())
    }
}

pub type AdaptorFactory = Arc<dyn Fn(reqwest::Client) -> Box<dyn TaskAdaptor> + Send + Sync>;

/// Platform tag to adaptor constructor. Every call gets a fresh adaptor
/// sharing one HTTP client.
#[derive(Clone)]
pub struct AdaptorRegistry {
    client: reqwest::Client,
    factories: BTreeMap<String, AdaptorFactory>,
}

impl AdaptorRegistry {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            factories: BTreeMap::new(),
        }
    }

    pub fn with_defaults(client: reqwest::Client) -> Self {
        let mut registry = Self::new(client);
        registry.register(
            suno::PLATFORM,
            Arc::new(|client: reqwest::Client| {
                Box::new(SunoAdaptor::new(client)) as Box<dyn TaskAdaptor>
            }),
        );
        registry.register(
            openai::PLATFORM,
            Arc::new(|client: reqwest::Client| {
                Box::new(OpenAiAdaptor::new(client)) as Box<dyn TaskAdaptor>
            }),
        );
        registry
    }

    pub fn register(&mut self, platform: impl Into<String>, factory: AdaptorFactory) {
        self.factories.insert(platform.into(), factory);
    }

    pub fn platforms(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    pub fn create(&self, platform: &str) -> Result<Box<dyn TaskAdaptor>> {
        let factory = self
            .factories
            .get(platform)
            .ok_or_else(|| RelayError::InvalidPlatform {
                platform: platform.to_string(),
            })?;
        Ok(factory(self.client.clone()))
    }
}

impl std::fmt::Debug for AdaptorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdaptorRegistry")
            .field("platforms", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

pub fn build_http_client(timeout_secs: u64) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs.max(1)))
        .build()
        .map_err(|err| RelayError::Transport {
            message: format!("http client error: {err}"),
        })
}

pub(crate) fn require_info(info: Option<&RelayInfo>) -> Result<&RelayInfo> {
    info.ok_or_else(|| RelayError::invalid_request("adaptor_not_initialized", "adaptor used before init"))
}

/// POSTs a JSON body with bearer auth and reads the reply within size bounds.
pub(crate) async fn post_json(
    client: &reqwest::Client,
    url: &str,
    api_key: &str,
    body: Bytes,
) -> Result<UpstreamResponse> {
    let response = client
        .post(url)
        .bearer_auth(api_key)
        .header(reqwest::header::CONTENT_TYPE, "application/json")
        .body(body)
        .send()
        .await
        .map_err(|err| RelayError::Transport {
            message: format!("{err}"),
        })?;

    let status = response.status();
    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    if !status.is_success() {
        let (bytes, truncated) = response_bytes_truncated(response, MAX_ERROR_BODY_BYTES).await;
        return Err(RelayError::Upstream {
            status: status.as_u16(),
            body: truncated_text(&bytes, truncated),
        });
    }

    let (body, truncated) = response_bytes_truncated(response, MAX_RESPONSE_BODY_BYTES).await;
    if truncated {
        return Err(RelayError::InvalidResponse {
            message: format!("upstream response exceeds {MAX_RESPONSE_BODY_BYTES} bytes"),
        });
    }
    Ok(UpstreamResponse {
        status: status.as_u16(),
        content_type,
        body,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_platform_is_rejected() {
        let registry = AdaptorRegistry::with_defaults(reqwest::Client::new());
        let err = match registry.create("midjourney") {
            Ok(_) => panic!("expected invalid platform"),
            Err(err) => err,
        };
        assert_eq!(err.code(), "invalid_api_platform");
        assert_eq!(registry.platforms().collect::<Vec<_>>(), vec!["openai", "suno"]);
    }

    #[test]
    fn relay_info_joins_urls_and_hides_key() {
        let info = RelayInfo {
            request_id: "req".to_string(),
            platform: "suno".to_string(),
            action: "MUSIC".to_string(),
            model: "suno_music".to_string(),
            user_id: 1,
            token_id: None,
            channel_id: 1,
            base_url: "http://upstream/".to_string(),
            api_key: "sk-live".to_string(),
            origin_task_id: None,
        };
        assert_eq!(info.url("/suno/fetch"), "http://upstream/suno/fetch");
        assert!(!format!("{info:?}").contains("sk-live"));
    }
}
