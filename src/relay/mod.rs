//! Control flow for one inbound relay call.
//!
//! ```text
//! Received -> ChannelResolved -> QuotaReserved -> Dispatched -> ResponseReceived -> Settled
//! ```
//!
//! Failures before `QuotaReserved` touch no quota. Failures after it release
//! the reservation in full. The reservation is moved into exactly one of
//! `settle`/`release`, and its drop guard covers anything that escapes.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::adaptor::{AdaptorRegistry, RelayInfo, TaskAdaptor, TaskRequest, TaskSubmission};
use crate::channel::{Channel, ChannelSelector, FailureKind};
use crate::error::{RelayError, Result};
use crate::ledger::{QuotaLedger, Reservation, ReserveRequest};
use crate::observability::Observability;
use crate::pricing::{PriceQuote, PricingTable};
use crate::task::{NewTask, Task, TaskService};
use crate::utils::ids;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RelaySettings {
    #[serde(default = "default_upstream_timeout_secs")]
    pub upstream_timeout_secs: u64,
}

fn default_upstream_timeout_secs() -> u64 {
    300
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            upstream_timeout_secs: default_upstream_timeout_secs(),
        }
    }
}

/// Authenticated identity a call is billed to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Caller {
    pub user_id: i64,
    pub token_id: Option<i64>,
    pub token_name: Option<String>,
}

impl Caller {
    pub fn user(user_id: i64) -> Self {
        Self {
            user_id,
            token_id: None,
            token_name: None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct RelayRequest {
    pub caller: Caller,
    pub platform: String,
    pub action: String,
    pub body: serde_json::Value,
}

#[derive(Clone, Debug)]
pub enum RelayResponse {
    /// Accepted async job; `task_id` is the gateway id.
    Task {
        task_id: String,
        provider_task_id: String,
        quota: i64,
    },
    Sync {
        body: Bytes,
        content_type: Option<String>,
        quota: i64,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RelayState {
    Received,
    ChannelResolved,
    QuotaReserved,
    Dispatched,
    ResponseReceived,
    SettledSuccess,
    SettledFailed,
}

impl RelayState {
    fn can_advance_to(self, next: RelayState) -> bool {
        use RelayState::*;
        matches!(
            (self, next),
            (Received, ChannelResolved)
                | (ChannelResolved, QuotaReserved)
                | (QuotaReserved, Dispatched)
                | (QuotaReserved, SettledFailed)
                | (Dispatched, ResponseReceived)
                | (Dispatched, SettledFailed)
                | (ResponseReceived, SettledSuccess)
                | (ResponseReceived, SettledFailed)
        )
    }
}

struct RelayTrace {
    request_id: String,
    state: RelayState,
}

impl RelayTrace {
    fn new() -> Self {
        Self {
            request_id: ids::request_id(),
            state: RelayState::Received,
        }
    }

    fn advance(&mut self, next: RelayState) {
        debug_assert!(
            self.state.can_advance_to(next),
            "illegal relay transition {:?} -> {next:?}",
            self.state
        );
        tracing::debug!(request_id = %self.request_id, from = ?self.state, to = ?next, "relay state");
        self.state = next;
    }
}

pub struct RelayOrchestrator {
    selector: ChannelSelector,
    ledger: Arc<QuotaLedger>,
    tasks: Arc<TaskService>,
    adaptors: Arc<AdaptorRegistry>,
    pricing: Arc<PricingTable>,
    settings: RelaySettings,
    observability: Arc<Observability>,
}

impl RelayOrchestrator {
    pub fn new(
        selector: ChannelSelector,
        ledger: Arc<QuotaLedger>,
        tasks: Arc<TaskService>,
        adaptors: Arc<AdaptorRegistry>,
        pricing: Arc<PricingTable>,
        settings: RelaySettings,
        observability: Arc<Observability>,
    ) -> Self {
        Self {
            selector,
            ledger,
            tasks,
            adaptors,
            pricing,
            settings,
            observability,
        }
    }

    pub fn tasks(&self) -> &Arc<TaskService> {
        &self.tasks
    }

    pub fn ledger(&self) -> &Arc<QuotaLedger> {
        &self.ledger
    }

    pub fn selector(&self) -> &ChannelSelector {
        &self.selector
    }

    /// Runs the call on its own task so dropping the caller's future cannot
    /// cancel a dispatched upstream call or its settlement.
    pub async fn relay_detached(self: &Arc<Self>, request: RelayRequest) -> Result<RelayResponse> {
        let orchestrator = self.clone();
        tokio::spawn(async move { orchestrator.relay(request).await })
            .await
            .map_err(|err| RelayError::Internal {
                message: format!("relay task failed: {err}"),
            })?
    }

    pub async fn relay(&self, request: RelayRequest) -> Result<RelayResponse> {
        self.observability.record_request();
        let mut trace = RelayTrace::new();
        let caller = request.caller;

        let mut adaptor = self.adaptors.create(&request.platform)?;
        let mut task_request = TaskRequest::new(request.action, request.body);
        adaptor.validate_request_and_set_action(&mut task_request)?;

        let group = self.ledger.user_group(caller.user_id).await?;
        let quote = self.pricing.quote(&task_request.model, &group)?;

        let origin = match task_request.origin_task_id.as_deref() {
            Some(origin_id) => Some(
                self.tasks
                    .get_task_status(Some(caller.user_id), origin_id)
                    .await?,
            ),
            None => None,
        };
        task_request.origin_provider_task_id =
            origin.as_ref().map(|task| task.provider_task_id.clone());
        let channel = self.resolve_channel(&task_request.model, &request.platform, origin.as_ref())?;
        trace.advance(RelayState::ChannelResolved);
        let body = adaptor.build_request_body(&task_request)?;

        let reservation = self
            .ledger
            .reserve(ReserveRequest {
                user_id: caller.user_id,
                channel_id: channel.id,
                token_id: caller.token_id,
                token_name: caller.token_name.clone(),
                model: task_request.model.clone(),
                estimated_quota: quote.quota,
                description: format!(
                    "model price {:.4}, group ratio {:.2}, action {}",
                    quote.model_price, quote.group_ratio, task_request.action
                ),
                other: serde_json::json!({
                    "request_id": trace.request_id,
                    "platform": request.platform,
                    "action": task_request.action,
                    "model_price": quote.model_price,
                    "group_ratio": quote.group_ratio,
                }),
            })
            .await?;
        trace.advance(RelayState::QuotaReserved);

        adaptor.init(RelayInfo {
            request_id: trace.request_id.clone(),
            platform: request.platform.clone(),
            action: task_request.action.clone(),
            model: task_request.model.clone(),
            user_id: caller.user_id,
            token_id: caller.token_id,
            channel_id: channel.id,
            base_url: channel.base_url.clone(),
            api_key: channel.key.clone(),
            origin_task_id: task_request.origin_task_id.clone(),
        });

        let submission = match self
            .dispatch(adaptor.as_ref(), body, &channel, &mut trace)
            .await
        {
            Ok(submission) => submission,
            Err(err) => return Err(self.fail(&mut trace, reservation, err).await),
        };
        self.selector.registry().record_success(channel.id);

        if adaptor.is_async() && submission.task_id.is_none() {
            let err = RelayError::InvalidResponse {
                message: "async platform reply carries no task id".to_string(),
            };
            return Err(self.fail(&mut trace, reservation, err).await);
        }

        Ok(self
            .complete(
                &mut trace,
                reservation,
                &quote,
                submission,
                adaptor.is_async(),
                &request.platform,
                &task_request,
                &caller,
                channel.id,
            )
            .await)
    }

    fn resolve_channel(
        &self,
        model: &str,
        platform: &str,
        origin: Option<&Task>,
    ) -> Result<Arc<Channel>> {
        let selected = self.selector.select_channel(model, platform);
        let result = match (origin, selected) {
            (None, selected) => selected,
            (Some(origin), Ok(current)) => self.selector.failover(origin, current.id),
            (Some(origin), Err(RelayError::NoAvailableChannel { .. })) => {
                self.selector.failover(origin, origin.channel_id)
            }
            (Some(_), Err(err)) => Err(err),
        };
        if matches!(result, Err(RelayError::NoAvailableChannel { .. })) {
            self.observability.record_no_channel();
        }
        result
    }

    async fn dispatch(
        &self,
        adaptor: &dyn TaskAdaptor,
        body: Bytes,
        channel: &Channel,
        trace: &mut RelayTrace,
    ) -> Result<TaskSubmission> {
        trace.advance(RelayState::Dispatched);

        let timeout = Duration::from_secs(self.settings.upstream_timeout_secs.max(1));
        let response = match tokio::time::timeout(timeout, adaptor.do_request(body)).await {
            Ok(Ok(response)) => response,
            Ok(Err(err)) => {
                self.record_channel_failure(channel, &err);
                return Err(err);
            }
            Err(_) => {
                let err = RelayError::Timeout {
                    seconds: timeout.as_secs(),
                };
                self.record_channel_failure(channel, &err);
                return Err(err);
            }
        };
        trace.advance(RelayState::ResponseReceived);
        adaptor.do_response(response)
    }

    fn record_channel_failure(&self, channel: &Channel, err: &RelayError) {
        let Some(kind) = FailureKind::from_error(err) else {
            return;
        };
        let registry = self.selector.registry();
        registry.record_failure(channel.id, kind, err.to_string());
        if kind.counts() && !registry.is_healthy(channel.id) {
            registry.request_disable(channel.id, format!("circuit open after: {err}"));
        }
    }

    /// Releases the whole reservation and hands the error back.
    async fn fail(
        &self,
        trace: &mut RelayTrace,
        reservation: Reservation,
        err: RelayError,
    ) -> RelayError {
        trace.advance(RelayState::SettledFailed);
        self.observability.record_upstream_failure();
        tracing::warn!(
            request_id = %trace.request_id,
            channel_id = reservation.channel_id(),
            code = err.code(),
            error = %err,
            "relay failed"
        );
        if let Err(release_err) = self.ledger.release(reservation).await {
            tracing::error!(
                request_id = %trace.request_id,
                error = %release_err,
                "failed to release reservation"
            );
        }
        err
    }

    #[allow(clippy::too_many_arguments)]
    async fn complete(
        &self,
        trace: &mut RelayTrace,
        reservation: Reservation,
        quote: &PriceQuote,
        submission: TaskSubmission,
        is_async: bool,
        platform: &str,
        request: &TaskRequest,
        caller: &Caller,
        channel_id: i64,
    ) -> RelayResponse {
        let actual = self.pricing.actual_quota(quote, submission.billed_units);
        let charged = actual.clamp(0, quote.quota);

        let response = match submission.task_id {
            Some(provider_task_id) if is_async => {
                let created = self
                    .tasks
                    .create_task(NewTask {
                        platform: platform.to_string(),
                        action: request.action.clone(),
                        user_id: caller.user_id,
                        channel_id,
                        token_id: caller.token_id,
                        provider_task_id: provider_task_id.clone(),
                        quota: charged,
                        data: submission.data,
                    })
                    .await;
                let task_id = match created {
                    Ok(task) => task.id,
                    Err(err) => {
                        tracing::error!(
                            request_id = %trace.request_id,
                            %provider_task_id,
                            error = %err,
                            "upstream accepted the job but the task record was not written"
                        );
                        provider_task_id.clone()
                    }
                };
                RelayResponse::Task {
                    task_id,
                    provider_task_id,
                    quota: charged,
                }
            }
            _ => RelayResponse::Sync {
                body: submission.body,
                content_type: submission.content_type,
                quota: charged,
            },
        };

        match self.ledger.settle(reservation, actual, true).await {
            Ok(settlement) => {
                tracing::info!(
                    request_id = %trace.request_id,
                    user_id = caller.user_id,
                    channel_id,
                    charged = settlement.charged,
                    refunded = settlement.refunded,
                    "relay settled"
                );
            }
            Err(err) => {
                tracing::error!(
                    request_id = %trace.request_id,
                    error = %err,
                    "failed to settle quota after a successful upstream call"
                );
            }
        }
        trace.advance(RelayState::SettledSuccess);
        response
    }
}
