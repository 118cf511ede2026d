use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use serde_json::Value;

use super::{
    RelayInfo, TaskAdaptor, TaskRequest, TaskSubmission, UpstreamResponse, post_json, require_info,
};
use crate::channel::Channel;
use crate::error::{RelayError, Result};
use crate::task::{ProviderTaskUpdate, TaskStatus};

pub const PLATFORM: &str = "suno";
pub const ACTION_MUSIC: &str = "MUSIC";
pub const ACTION_LYRICS: &str = "LYRICS";

const MAX_PROMPT_CHARS: usize = 3000;
const DEFAULT_MUSIC_MODEL_VERSION: &str = "chirp-v3-0";

pub fn model_for_action(action: &str) -> &'static str {
    match action {
        ACTION_LYRICS => "suno_lyrics",
        _ => "suno_music",
    }
}

/// Suno job submission and polling.
pub struct SunoAdaptor {
    client: reqwest::Client,
    info: Option<RelayInfo>,
}

impl SunoAdaptor {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client, info: None }
    }
}

#[derive(Debug, Deserialize)]
struct SunoReply<T> {
    code: String,
    #[serde(default)]
    message: String,
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
struct SunoTask {
    task_id: String,
    status: String,
    #[serde(default)]
    progress: Option<String>,
    #[serde(default)]
    fail_reason: Option<String>,
    #[serde(default)]
    data: Value,
}

fn map_status(raw: &str) -> Option<TaskStatus> {
    match raw {
        "NOT_START" | "SUBMITTED" | "QUEUED" | "" => Some(TaskStatus::Pending),
        "IN_PROGRESS" => Some(TaskStatus::Running),
        "SUCCESS" => Some(TaskStatus::Succeeded),
        "FAILURE" => Some(TaskStatus::Failed),
        _ => None,
    }
}

fn non_empty_str<'a>(body: &'a Value, field: &str) -> Option<&'a str> {
    body.get(field)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

#[async_trait]
impl TaskAdaptor for SunoAdaptor {
    fn platform(&self) -> &'static str {
        PLATFORM
    }

    fn is_async(&self) -> bool {
        true
    }

    fn init(&mut self, info: RelayInfo) {
        self.info = Some(info);
    }

    fn validate_request_and_set_action(&mut self, request: &mut TaskRequest) -> Result<()> {
        let action = request.action.trim().to_ascii_uppercase();
        if action != ACTION_MUSIC && action != ACTION_LYRICS {
            return Err(RelayError::invalid_request(
                "invalid_action",
                format!("unsupported suno action: {}", request.action),
            ));
        }
        if !request.body.is_object() {
            return Err(RelayError::invalid_request(
                "invalid_request",
                "request body must be a JSON object",
            ));
        }

        let prompt = non_empty_str(&request.body, "prompt");
        let description = non_empty_str(&request.body, "gpt_description_prompt");
        match action.as_str() {
            ACTION_LYRICS if prompt.is_none() => {
                return Err(RelayError::invalid_request("prompt_empty", "prompt is required"));
            }
            ACTION_MUSIC if prompt.is_none() && description.is_none() => {
                return Err(RelayError::invalid_request(
                    "prompt_empty",
                    "prompt or gpt_description_prompt is required",
                ));
            }
            _ => {}
        }
        for text in [prompt, description].into_iter().flatten() {
            if text.chars().count() > MAX_PROMPT_CHARS {
                return Err(RelayError::invalid_request(
                    "prompt_too_long",
                    format!("prompt exceeds {MAX_PROMPT_CHARS} characters"),
                ));
            }
        }

        request.origin_task_id = non_empty_str(&request.body, "task_id").map(str::to_string);
        request.model = model_for_action(&action).to_string();
        request.action = action;
        Ok(())
    }

    fn build_request_body(&self, request: &TaskRequest) -> Result<Bytes> {
        let mut body = request.body.clone();
        if let (Some(provider_id), Some(object)) =
            (request.origin_provider_task_id.as_deref(), body.as_object_mut())
        {
            object.insert("task_id".to_string(), Value::String(provider_id.to_string()));
        }
        if request.action == ACTION_MUSIC {
            if let Some(object) = body.as_object_mut() {
                let has_version = object
                    .get("mv")
                    .and_then(Value::as_str)
                    .is_some_and(|mv| !mv.is_empty());
                if !has_version {
                    object.insert(
                        "mv".to_string(),
                        Value::String(DEFAULT_MUSIC_MODEL_VERSION.to_string()),
                    );
                }
            }
        }
        serde_json::to_vec(&body).map(Bytes::from).map_err(|err| {
            RelayError::invalid_request("invalid_request", format!("encode body: {err}"))
        })
    }

    async fn do_request(&self, body: Bytes) -> Result<UpstreamResponse> {
        let info = require_info(self.info.as_ref())?;
        let url = info.url(&format!("/suno/submit/{}", info.action.to_ascii_lowercase()));
        post_json(&self.client, &url, &info.api_key, body).await
    }

    fn do_response(&self, response: UpstreamResponse) -> Result<TaskSubmission> {
        let reply: SunoReply<String> =
            serde_json::from_slice(&response.body).map_err(|err| RelayError::InvalidResponse {
                message: format!("decode suno reply: {err}"),
            })?;
        if reply.code != "success" {
            return Err(RelayError::Upstream {
                status: response.status,
                body: format!("{}: {}", reply.code, reply.message),
            });
        }
        let task_id = reply
            .data
            .filter(|id| !id.is_empty())
            .ok_or_else(|| RelayError::InvalidResponse {
                message: "suno reply carries no task id".to_string(),
            })?;
        Ok(TaskSubmission {
            task_id: Some(task_id),
            data: Value::Null,
            body: response.body,
            content_type: response.content_type,
            billed_units: 1.0,
        })
    }

    async fn fetch_tasks(
        &self,
        channel: &Channel,
        provider_task_ids: &[String],
    ) -> Result<Vec<ProviderTaskUpdate>> {
        if provider_task_ids.is_empty() {
            return Ok(Vec::new());
        }
        let url = format!("{}/suno/fetch", channel.base_url.trim_end_matches('/'));
        let body = serde_json::to_vec(&serde_json::json!({ "ids": provider_task_ids }))
            .map_err(|err| RelayError::invalid_request("invalid_request", err.to_string()))?;
        let response = post_json(&self.client, &url, &channel.key, Bytes::from(body)).await?;
        let reply: SunoReply<Vec<SunoTask>> =
            serde_json::from_slice(&response.body).map_err(|err| RelayError::InvalidResponse {
                message: format!("decode suno fetch reply: {err}"),
            })?;
        if reply.code != "success" {
            return Err(RelayError::Upstream {
                status: response.status,
                body: format!("{}: {}", reply.code, reply.message),
            });
        }

        let mut updates = Vec::new();
        for task in reply.data.unwrap_or_default() {
            let Some(status) = map_status(&task.status) else {
                tracing::warn!(
                    provider_task_id = %task.task_id,
                    status = %task.status,
                    "unknown suno task status"
                );
                continue;
            };
            updates.push(ProviderTaskUpdate {
                provider_task_id: task.task_id,
                status,
                progress: task.progress.filter(|p| !p.is_empty()),
                fail_reason: task.fail_reason.filter(|r| !r.is_empty()),
                data: task.data,
            });
        }
        Ok(updates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn validation_infers_action_model_and_origin() {
        let mut adaptor = SunoAdaptor::new(reqwest::Client::new());
        let mut request = TaskRequest::new(
            "music",
            json!({"prompt": "lofi", "task_id": "task_abc"}),
        );
        adaptor
            .validate_request_and_set_action(&mut request)
            .expect("valid");
        assert_eq!(request.action, ACTION_MUSIC);
        assert_eq!(request.model, "suno_music");
        assert_eq!(request.origin_task_id.as_deref(), Some("task_abc"));

        let body = adaptor.build_request_body(&request).expect("body");
        let body: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["mv"], "chirp-v3-0");
    }

    #[test]
    fn continuation_body_carries_the_provider_task_id() {
        let mut adaptor = SunoAdaptor::new(reqwest::Client::new());
        let mut request = TaskRequest::new(
            "music",
            json!({"prompt": "more", "task_id": "task_gateway", "mv": "chirp-v3-5"}),
        );
        adaptor
            .validate_request_and_set_action(&mut request)
            .expect("valid");
        request.origin_provider_task_id = Some("up-42".to_string());

        let body = adaptor.build_request_body(&request).expect("body");
        let body: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["task_id"], "up-42");
        assert_eq!(body["mv"], "chirp-v3-5");
    }

    #[test]
    fn lyrics_require_a_prompt() {
        let mut adaptor = SunoAdaptor::new(reqwest::Client::new());
        let mut request =
            TaskRequest::new("lyrics", json!({"gpt_description_prompt": "a song"}));
        let err = adaptor
            .validate_request_and_set_action(&mut request)
            .unwrap_err();
        assert_eq!(err.code(), "prompt_empty");
    }

    #[test]
    fn unknown_action_is_rejected() {
        let mut adaptor = SunoAdaptor::new(reqwest::Client::new());
        let mut request = TaskRequest::new("video", json!({"prompt": "x"}));
        assert_eq!(
            adaptor
                .validate_request_and_set_action(&mut request)
                .unwrap_err()
                .code(),
            "invalid_action"
        );
    }

    #[test]
    fn submit_reply_yields_provider_task_id() {
        let adaptor = SunoAdaptor::new(reqwest::Client::new());
        let submission = adaptor
            .do_response(UpstreamResponse {
                status: 200,
                content_type: None,
                body: Bytes::from_static(br#"{"code":"success","message":"","data":"up-42"}"#),
            })
            .expect("parsed");
        assert_eq!(submission.task_id.as_deref(), Some("up-42"));

        let err = adaptor
            .do_response(UpstreamResponse {
                status: 200,
                content_type: None,
                body: Bytes::from_static(br#"{"code":"error","message":"banned","data":null}"#),
            })
            .unwrap_err();
        assert!(matches!(err, RelayError::Upstream { .. }));
    }

    #[test]
    fn provider_statuses_map_onto_task_states() {
        assert_eq!(map_status("QUEUED"), Some(TaskStatus::Pending));
        assert_eq!(map_status("IN_PROGRESS"), Some(TaskStatus::Running));
        assert_eq!(map_status("SUCCESS"), Some(TaskStatus::Succeeded));
        assert_eq!(map_status("FAILURE"), Some(TaskStatus::Failed));
        assert_eq!(map_status("WEIRD"), None);
    }
}
