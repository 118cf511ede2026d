use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;

use super::{
    RelayInfo, TaskAdaptor, TaskRequest, TaskSubmission, UpstreamResponse, post_json, require_info,
};
use crate::error::{RelayError, Result};

pub const PLATFORM: &str = "openai";
pub const ACTION_CHAT: &str = "chat";
pub const ACTION_IMAGE: &str = "image";

fn path_for_action(action: &str) -> Option<&'static str> {
    match action {
        ACTION_CHAT => Some("/v1/chat/completions"),
        ACTION_IMAGE => Some("/v1/images/generations"),
        _ => None,
    }
}

/// Synchronous OpenAI-compatible text and image calls. The upstream reply is
/// handed back verbatim and no task is recorded.
pub struct OpenAiAdaptor {
    client: reqwest::Client,
    info: Option<RelayInfo>,
}

impl OpenAiAdaptor {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client, info: None }
    }
}

#[async_trait]
impl TaskAdaptor for OpenAiAdaptor {
    fn platform(&self) -> &'static str {
        PLATFORM
    }

    fn is_async(&self) -> bool {
        false
    }

    fn init(&mut self, info: RelayInfo) {
        self.info = Some(info);
    }

    fn validate_request_and_set_action(&mut self, request: &mut TaskRequest) -> Result<()> {
        let action = request.action.trim().to_ascii_lowercase();
        if path_for_action(&action).is_none() {
            return Err(RelayError::invalid_request(
                "invalid_action",
                format!("unsupported openai action: {}", request.action),
            ));
        }
        let Some(object) = request.body.as_object() else {
            return Err(RelayError::invalid_request(
                "invalid_request",
                "request body must be a JSON object",
            ));
        };
        let model = object
            .get("model")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|model| !model.is_empty())
            .ok_or_else(|| RelayError::invalid_request("invalid_request", "model is required"))?;
        if action == ACTION_CHAT && !object.get("messages").is_some_and(Value::is_array) {
            return Err(RelayError::invalid_request(
                "invalid_request",
                "messages must be an array",
            ));
        }
        if object.get("stream").and_then(Value::as_bool) == Some(true) {
            return Err(RelayError::invalid_request(
                "invalid_request",
                "streaming responses are not supported",
            ));
        }

        request.model = model.to_string();
        request.action = action;
        Ok(())
    }

    fn build_request_body(&self, request: &TaskRequest) -> Result<Bytes> {
        serde_json::to_vec(&request.body).map(Bytes::from).map_err(|err| {
            RelayError::invalid_request("invalid_request", format!("encode body: {err}"))
        })
    }

    async fn do_request(&self, body: Bytes) -> Result<UpstreamResponse> {
        let info = require_info(self.info.as_ref())?;
        let path = path_for_action(&info.action).ok_or_else(|| {
            RelayError::invalid_request("invalid_action", info.action.clone())
        })?;
        post_json(&self.client, &info.url(path), &info.api_key, body).await
    }

    fn do_response(&self, response: UpstreamResponse) -> Result<TaskSubmission> {
        let data: Value =
            serde_json::from_slice(&response.body).map_err(|err| RelayError::InvalidResponse {
                message: format!("decode openai reply: {err}"),
            })?;
        if data.get("error").is_some_and(|error| !error.is_null()) {
            return Err(RelayError::Upstream {
                status: response.status,
                body: String::from_utf8_lossy(&response.body).to_string(),
            });
        }
        Ok(TaskSubmission {
            task_id: None,
            data: Value::Null,
            body: response.body,
            content_type: response.content_type,
            billed_units: 1.0,
        })
    }
}
