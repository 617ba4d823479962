use axum::body::Bytes;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Query, State};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use tracing::{error, warn};

use crate::auth::MaybeCaller;
use crate::gateways::mpesa::StkCallbackEnvelope;
use crate::handlers::json_body;
use crate::services::BookingRequest;
use crate::state::AppState;
use crate::utils::error::AppError;
use crate::utils::response::{created, success};

pub async fn create_booking(
    State(state): State<AppState>,
    MaybeCaller(caller): MaybeCaller,
    payload: Result<Json<BookingRequest>, JsonRejection>,
) -> Result<Response, AppError> {
    let request = json_body(payload)?;
    let receipt = state
        .booking
        .book(request, caller.map(|user| user.id))
        .await?;
    Ok(created(
        receipt,
        "Payment request sent. Enter your M-Pesa PIN to complete the booking",
    ))
}

#[derive(Debug, Deserialize)]
pub struct CallbackQuery {
    token: Option<String>,
}

/// Daraja result webhook. Once the body parses the gateway always gets an
/// acknowledgement; anything this side fails to apply is picked up by the
/// sweeper through an STK query.
pub async fn stk_callback(
    State(state): State<AppState>,
    Query(query): Query<CallbackQuery>,
    body: Bytes,
) -> Result<Response, AppError> {
    if let Some(expected) = &state.config.mpesa.callback_token {
        if query.token.as_deref() != Some(expected.as_str()) {
            warn!("STK callback with missing or wrong token rejected");
            return Err(AppError::Forbidden("Invalid callback token".to_string()));
        }
    }

    let envelope: StkCallbackEnvelope = serde_json::from_slice(&body).map_err(|e| {
        warn!(error = %e, "Unparseable STK callback");
        AppError::ValidationError("Malformed callback payload".to_string())
    })?;
    let callback = envelope.body.stk_callback;

    if let Err(e) = state.reconciler.handle_callback(&callback).await {
        error!(
            checkout_request_id = %callback.checkout_request_id,
            error = %e,
            "Could not apply STK callback"
        );
    }

    Ok(Json(json!({ "ResultCode": 0, "ResultDesc": "Accepted" })).into_response())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckPaymentQuery {
    checkout_request_id: Option<String>,
}

pub async fn check_payment(
    State(state): State<AppState>,
    Query(query): Query<CheckPaymentQuery>,
) -> Result<Response, AppError> {
    let checkout_request_id = query
        .checkout_request_id
        .filter(|id| !id.trim().is_empty())
        .ok_or_else(|| AppError::ValidationError("checkoutRequestId is required".to_string()))?;

    let view = state
        .reconciler
        .payment_status(checkout_request_id.trim())
        .await?;
    Ok(success(view, "Payment status retrieved"))
}
