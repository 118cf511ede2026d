use axum::Json;
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::{ApiError, RelayHttpState};
use crate::adaptor::{openai, suno};
use crate::error::RelayError;
use crate::relay::{RelayRequest, RelayResponse};
use crate::task::FeedQuery;

#[derive(Debug, Serialize)]
struct SubmitReply {
    code: &'static str,
    message: &'static str,
    data: String,
}

#[derive(Debug, Deserialize)]
struct FetchBody {
    #[serde(default)]
    ids: Vec<String>,
}

fn parse_json<T: serde::de::DeserializeOwned>(body: &Bytes) -> Result<T, ApiError> {
    serde_json::from_slice(body).map_err(|err| {
        ApiError::Relay(RelayError::invalid_request(
            "invalid_request",
            format!("invalid json body: {err}"),
        ))
    })
}

async fn relay_call(
    state: &RelayHttpState,
    headers: &HeaderMap,
    platform: &str,
    action: String,
    body: Bytes,
) -> Result<Response, ApiError> {
    let caller = state.authenticate(headers)?;
    let body: serde_json::Value = parse_json(&body)?;
    let response = state
        .orchestrator
        .relay_detached(RelayRequest {
            caller,
            platform: platform.to_string(),
            action,
            body,
        })
        .await?;
    Ok(match response {
        RelayResponse::Task { task_id, .. } => Json(SubmitReply {
            code: "success",
            message: "",
            data: task_id,
        })
        .into_response(),
        RelayResponse::Sync {
            body, content_type, ..
        } => passthrough(body, content_type.as_deref()),
    })
}

fn passthrough(body: Bytes, content_type: Option<&str>) -> Response {
    let content_type = content_type
        .and_then(|value| HeaderValue::from_str(value).ok())
        .unwrap_or_else(|| HeaderValue::from_static("application/json"));
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = StatusCode::OK;
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, content_type);
    response
}

pub(super) async fn submit_suno(
    State(state): State<RelayHttpState>,
    Path(action): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    relay_call(&state, &headers, suno::PLATFORM, action, body).await
}

pub(super) async fn chat_completions(
    State(state): State<RelayHttpState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    relay_call(&state, &headers, openai::PLATFORM, openai::ACTION_CHAT.to_string(), body).await
}

pub(super) async fn image_generations(
    State(state): State<RelayHttpState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    relay_call(&state, &headers, openai::PLATFORM, openai::ACTION_IMAGE.to_string(), body).await
}

pub(super) async fn fetch_suno_tasks(
    State(state): State<RelayHttpState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let caller = state.authenticate(&headers)?;
    let query: FetchBody = parse_json(&body)?;
    let document = state
        .orchestrator
        .tasks()
        .feed(caller.user_id, FeedQuery::Many(query.ids))
        .await?;
    Ok(passthrough(Bytes::from(document), None))
}

pub(super) async fn fetch_suno_task(
    State(state): State<RelayHttpState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let caller = state.authenticate(&headers)?;
    let document = state
        .orchestrator
        .tasks()
        .feed(caller.user_id, FeedQuery::One(id))
        .await?;
    Ok(passthrough(Bytes::from(document), None))
}
