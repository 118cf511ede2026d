//! axum surface over the relay, task feed and top-up services.

mod relay;
mod topup;

use std::collections::HashMap;
use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use serde::Serialize;

use crate::channel::{ChannelHealthSnapshot, DisableRequest};
use crate::config::TokenConfig;
use crate::error::RelayError;
use crate::observability::{Observability, ObservabilitySnapshot};
use crate::order::{PaymentError, PaymentService};
use crate::relay::{Caller, RelayOrchestrator};

#[derive(Clone)]
pub struct RelayHttpState {
    orchestrator: Arc<RelayOrchestrator>,
    payments: Option<Arc<PaymentService>>,
    tokens: Arc<HashMap<String, TokenConfig>>,
    observability: Arc<Observability>,
}

impl RelayHttpState {
    pub fn new(
        orchestrator: Arc<RelayOrchestrator>,
        tokens: impl IntoIterator<Item = TokenConfig>,
        observability: Arc<Observability>,
    ) -> Self {
        let tokens = tokens
            .into_iter()
            .map(|token| (token.key.clone(), token))
            .collect();
        Self {
            orchestrator,
            payments: None,
            tokens: Arc::new(tokens),
            observability,
        }
    }

    pub fn with_payments(mut self, payments: Arc<PaymentService>) -> Self {
        self.payments = Some(payments);
        self
    }

    fn authenticate(&self, headers: &HeaderMap) -> Result<Caller, ApiError> {
        let key = extract_bearer(headers).ok_or(RelayError::Unauthorized)?;
        let token = self
            .tokens
            .get(&key)
            .filter(|token| token.enabled)
            .ok_or(RelayError::Unauthorized)?;
        Ok(Caller {
            user_id: token.user_id,
            token_id: Some(token.id),
            token_name: Some(token.name.clone()),
        })
    }

    fn payments(&self) -> Result<&Arc<PaymentService>, ApiError> {
        self.payments
            .as_ref()
            .ok_or(ApiError::Payment(PaymentError::NotConfigured))
    }
}

pub fn router(state: RelayHttpState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/suno/submit/:action", post(relay::submit_suno))
        .route("/suno/fetch", post(relay::fetch_suno_tasks))
        .route("/suno/fetch/:id", get(relay::fetch_suno_task))
        .route("/v1/chat/completions", post(relay::chat_completions))
        .route("/v1/images/generations", post(relay::image_generations))
        .route("/api/user/topup/native", post(topup::open_order))
        .route("/api/user/topup/notify", post(topup::notify))
        .route("/api/user/topup/status", get(topup::order_status))
        .with_state(state)
}

fn extract_bearer(headers: &HeaderMap) -> Option<String> {
    let auth = headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())?
        .trim()
        .to_string();
    let rest = auth
        .strip_prefix("Bearer ")
        .or_else(|| auth.strip_prefix("bearer "))?;
    let token = rest.trim();
    (!token.is_empty()).then(|| token.to_string())
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

#[derive(Debug, Serialize)]
struct MetricsResponse {
    counters: ObservabilitySnapshot,
    channels: Vec<ChannelHealthSnapshot>,
    disable_requests: Vec<DisableRequest>,
}

async fn metrics(State(state): State<RelayHttpState>) -> Json<MetricsResponse> {
    let registry = state.orchestrator.selector().registry();
    Json(MetricsResponse {
        counters: state.observability.snapshot(),
        channels: registry.health_snapshot(),
        disable_requests: registry.disable_requests(),
    })
}

#[derive(Debug, Serialize)]
struct ErrorDetail {
    message: String,
    #[serde(rename = "type")]
    kind: &'static str,
    code: &'static str,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

#[derive(Debug)]
pub(crate) enum ApiError {
    Relay(RelayError),
    Payment(PaymentError),
}

impl From<RelayError> for ApiError {
    fn from(err: RelayError) -> Self {
        Self::Relay(err)
    }
}

impl From<PaymentError> for ApiError {
    fn from(err: PaymentError) -> Self {
        Self::Payment(err)
    }
}

fn error_kind(status: u16) -> &'static str {
    match status {
        401 => "authentication_error",
        403 => "insufficient_quota",
        400..=499 => "invalid_request_error",
        _ => "api_error",
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind, code, message) = match &self {
            Self::Relay(err) => (err.status_code(), err.error_type(), err.code(), err.to_string()),
            Self::Payment(err) => (
                err.status_code(),
                error_kind(err.status_code()),
                err.code(),
                err.to_string(),
            ),
        };
        let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (
            status,
            Json(ErrorResponse {
                error: ErrorDetail {
                    message,
                    kind,
                    code,
                },
            }),
        )
            .into_response()
    }
}
