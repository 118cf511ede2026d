use axum::Json;
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::{ApiError, RelayHttpState};
use crate::error::RelayError;
use crate::order::{PaymentAck, PaymentError, SIGNATURE_HEADER, SignedNotification};

#[derive(Debug, Deserialize)]
pub(super) struct TopUpBody {
    amount: i64,
}

#[derive(Debug, Serialize)]
pub(super) struct OpenOrderReply {
    message: &'static str,
    data: String,
    url: String,
    money: f64,
}

pub(super) async fn open_order(
    State(state): State<RelayHttpState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<OpenOrderReply>, ApiError> {
    let caller = state.authenticate(&headers)?;
    let payments = state.payments()?;
    let body: TopUpBody = serde_json::from_slice(&body).map_err(|err| {
        ApiError::Relay(RelayError::invalid_request(
            "invalid_request",
            format!("invalid top-up body: {err}"),
        ))
    })?;
    let opened = payments.open_order(caller.user_id, body.amount).await?;
    Ok(Json(OpenOrderReply {
        message: "success",
        data: opened.trade_no,
        url: opened.pay_url,
        money: opened.money,
    }))
}

/// Always answers 200; the ack body tells the payment network whether to
/// redeliver.
pub(super) async fn notify(
    State(state): State<RelayHttpState>,
    headers: HeaderMap,
    body: Bytes,
) -> Json<PaymentAck> {
    let Some(payments) = state.payments.as_ref() else {
        return Json(PaymentAck::error("payments are not configured"));
    };
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string());
    Json(
        payments
            .handle_notification(SignedNotification { signature, body })
            .await,
    )
}

#[derive(Debug, Deserialize)]
pub(super) struct StatusQuery {
    #[serde(rename = "orderId")]
    order_id: String,
}

#[derive(Debug, Serialize)]
pub(super) struct StatusReply {
    message: &'static str,
    data: &'static str,
}

pub(super) async fn order_status(
    State(state): State<RelayHttpState>,
    headers: HeaderMap,
    Query(query): Query<StatusQuery>,
) -> Result<Json<StatusReply>, ApiError> {
    let caller = state.authenticate(&headers)?;
    let payments = state.payments()?;
    // Trade numbers embed the owner, so foreign ids read as missing.
    if !query
        .order_id
        .starts_with(&format!("USR{}NO", caller.user_id))
    {
        return Err(PaymentError::OrderNotFound {
            trade_no: query.order_id,
        }
        .into());
    }
    let status = payments
        .order_status(&query.order_id)
        .await?
        .ok_or_else(|| PaymentError::OrderNotFound {
            trade_no: query.order_id.clone(),
        })?;
    Ok(Json(StatusReply {
        message: "success",
        data: status.as_str(),
    }))
}
