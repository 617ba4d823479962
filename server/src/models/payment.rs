use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::UnknownVariant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Completed,
    Failed,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Completed => "completed",
            PaymentStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaymentStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(PaymentStatus::Pending),
            "completed" => Ok(PaymentStatus::Completed),
            "failed" => Ok(PaymentStatus::Failed),
            other => Err(UnknownVariant::new("payment status", other)),
        }
    }
}

/// One STK push attempt, keyed by the gateway's CheckoutRequestID.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequest {
    pub checkout_request_id: String,
    pub merchant_request_id: String,
    pub match_id: Uuid,
    pub user_id: Option<String>,
    pub account_reference: String,
    pub phone: String,
    pub amount: Decimal,
    pub status: PaymentStatus,
    pub result_code: Option<i64>,
    pub result_desc: Option<String>,
    pub mpesa_receipt: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Ledger entry written once per completed payment request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Payment {
    pub id: Uuid,
    pub checkout_request_id: String,
    pub match_id: Uuid,
    pub user_id: Option<String>,
    pub mpesa_receipt: Option<String>,
    pub amount: Decimal,
    pub phone: String,
    pub ticket_count: i32,
    pub paid_at: DateTime<Utc>,
}

/// Final answer for a payment request, from the callback or a status query.
#[derive(Debug, Clone, PartialEq)]
pub enum PaymentOutcome {
    Paid {
        receipt: Option<String>,
        amount: Option<Decimal>,
        phone: Option<String>,
        paid_at: DateTime<Utc>,
    },
    Failed {
        result_code: Option<i64>,
        reason: String,
    },
}

impl PaymentOutcome {
    pub fn status(&self) -> PaymentStatus {
        match self {
            PaymentOutcome::Paid { .. } => PaymentStatus::Completed,
            PaymentOutcome::Failed { .. } => PaymentStatus::Failed,
        }
    }

    pub fn result_code(&self) -> Option<i64> {
        match self {
            PaymentOutcome::Paid { .. } => Some(0),
            PaymentOutcome::Failed { result_code, .. } => *result_code,
        }
    }

    pub fn description(&self) -> String {
        match self {
            PaymentOutcome::Paid { .. } => "The service request is processed successfully.".to_string(),
            PaymentOutcome::Failed { reason, .. } => reason.clone(),
        }
    }

    pub fn receipt(&self) -> Option<&str> {
        match self {
            PaymentOutcome::Paid { receipt, .. } => receipt.as_deref(),
            PaymentOutcome::Failed { .. } => None,
        }
    }
}
