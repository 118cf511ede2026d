use thiserror::Error;

use crate::pricing::PricingError;
use crate::store::StoreError;

/// Caller-facing failure of a relay, feed or top-up call.
///
/// Every variant maps to a stable machine-readable [`code`](RelayError::code)
/// and an HTTP status so transports never have to inspect messages.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("invalid request: {reason}")]
    InvalidRequest { code: &'static str, reason: String },
    #[error("unauthorized token")]
    Unauthorized,
    #[error("invalid api platform: {platform}")]
    InvalidPlatform { platform: String },
    #[error("no available channel for model {model} (platform {platform})")]
    NoAvailableChannel { model: String, platform: String },
    #[error("channel {channel_id} owning the task is disabled")]
    ChannelDisabled { channel_id: i64 },
    #[error("channel not found: {channel_id}")]
    ChannelNotFound { channel_id: i64 },
    #[error("task not found: {task_id}")]
    TaskNotFound { task_id: String },
    #[error("user not found: {user_id}")]
    UserNotFound { user_id: i64 },
    #[error("user quota is not enough: balance={balance} required={required}")]
    InsufficientQuota { balance: i64, required: i64 },
    #[error("upstream returned status {status}: {body}")]
    Upstream { status: u16, body: String },
    #[error("upstream request failed: {message}")]
    Transport { message: String },
    #[error("upstream request timed out after {seconds}s")]
    Timeout { seconds: u64 },
    #[error("invalid upstream response: {message}")]
    InvalidResponse { message: String },
    #[error("store error: {0}")]
    Store(#[source] StoreError),
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl RelayError {
    pub fn invalid_request(code: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidRequest {
            code,
            reason: reason.into(),
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidRequest { code, .. } => code,
            Self::Unauthorized => "invalid_token",
            Self::InvalidPlatform { .. } => "invalid_api_platform",
            Self::NoAvailableChannel { .. } => "no_available_channel",
            Self::ChannelDisabled { .. } => "task_channel_disable",
            Self::ChannelNotFound { .. } => "channel_not_found",
            Self::TaskNotFound { .. } => "task_not_exist",
            Self::UserNotFound { .. } => "user_not_found",
            Self::InsufficientQuota { .. } => "quota_not_enough",
            Self::Upstream { .. } => "fail_to_fetch_task",
            Self::Transport { .. } => "do_request_failed",
            Self::Timeout { .. } => "upstream_timeout",
            Self::InvalidResponse { .. } => "invalid_upstream_response",
            Self::Store(_) => "store_error",
            Self::Internal { .. } => "internal_error",
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidRequest { .. }
            | Self::InvalidPlatform { .. }
            | Self::ChannelDisabled { .. }
            | Self::ChannelNotFound { .. }
            | Self::TaskNotFound { .. } => 400,
            Self::Unauthorized => 401,
            Self::InsufficientQuota { .. } => 403,
            Self::UserNotFound { .. } => 404,
            Self::NoAvailableChannel { .. } => 503,
            Self::Upstream { status, .. } if (400..600).contains(status) => *status,
            Self::Upstream { .. } | Self::Transport { .. } | Self::InvalidResponse { .. } => 502,
            Self::Timeout { .. } => 504,
            Self::Store(_) | Self::Internal { .. } => 500,
        }
    }

    /// Whether the failure is attributable to the channel that served the call.
    pub fn is_channel_fault(&self) -> bool {
        match self {
            Self::Transport { .. } | Self::Timeout { .. } => true,
            Self::Upstream { status, .. } => *status >= 500,
            _ => false,
        }
    }

    pub(crate) fn error_type(&self) -> &'static str {
        match self.status_code() {
            401 => "authentication_error",
            403 => "insufficient_quota",
            400..=499 => "invalid_request_error",
            _ => "api_error",
        }
    }
}

impl From<StoreError> for RelayError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::InsufficientQuota { balance, required } => {
                Self::InsufficientQuota { balance, required }
            }
            StoreError::UserNotFound { user_id } => Self::UserNotFound { user_id },
            other => Self::Store(other),
        }
    }
}

impl From<PricingError> for RelayError {
    fn from(err: PricingError) -> Self {
        Self::invalid_request("model_price_error", err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;
