use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::response::Response;
use axum::Json;
use serde::Deserialize;
use tracing::info;

use crate::auth::AdminCaller;
use crate::handlers::json_body;
use crate::state::AppState;
use crate::utils::error::AppError;
use crate::utils::phone::{mask_msisdn, normalize_msisdn};
use crate::utils::response::success;

/// Longest message Africa's Talking accepts (six concatenated segments).
const MAX_MESSAGE_LEN: usize = 918;

#[derive(Debug, Deserialize)]
pub struct SendSms {
    to: String,
    message: String,
}

pub async fn send_sms(
    State(state): State<AppState>,
    AdminCaller(admin): AdminCaller,
    payload: Result<Json<SendSms>, JsonRejection>,
) -> Result<Response, AppError> {
    let body = json_body(payload)?;
    let to = normalize_msisdn(&body.to)?;
    let message = body.message.trim();
    if message.is_empty() || message.chars().count() > MAX_MESSAGE_LEN {
        return Err(AppError::ValidationError(format!(
            "message must be between 1 and {} characters",
            MAX_MESSAGE_LEN
        )));
    }

    let receipt = state.sms.send(&to, message).await?;
    info!(to = %mask_msisdn(&to), admin = %admin.id, status = %receipt.status, "SMS sent");
    Ok(success(receipt, "SMS sent"))
}
