//! Outbound ports: the mobile-money gateway and the SMS gateway.

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

pub mod mpesa;
pub mod sms;

pub use mpesa::MpesaClient;
pub use sms::{AfricasTalkingSms, LoggingSms};

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("{service} is not configured: {reason}")]
    NotConfigured {
        service: &'static str,
        reason: String,
    },

    #[error("could not reach {service}: {message}")]
    Transport {
        service: &'static str,
        message: String,
    },

    #[error("{service} rejected the request: {message}")]
    Rejected {
        service: &'static str,
        code: Option<String>,
        message: String,
    },

    #[error("unexpected response from {service}: {message}")]
    Decode {
        service: &'static str,
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StkPushRequest {
    /// Normalised `254XXXXXXXXX`.
    pub phone: String,
    /// Whole shillings.
    pub amount: u64,
    pub account_reference: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StkPushAccepted {
    pub merchant_request_id: String,
    pub checkout_request_id: String,
    pub customer_message: String,
}

/// What the gateway reports when asked about an earlier STK push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StkQueryStatus {
    /// The customer has not answered the prompt yet.
    Pending,
    Completed,
    Failed { result_code: i64, reason: String },
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn initiate_stk_push(
        &self,
        request: &StkPushRequest,
    ) -> Result<StkPushAccepted, GatewayError>;

    async fn query_stk_status(
        &self,
        checkout_request_id: &str,
    ) -> Result<StkQueryStatus, GatewayError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SmsReceipt {
    pub message_id: Option<String>,
    pub status: String,
}

#[async_trait]
pub trait SmsSender: Send + Sync {
    async fn send(&self, to: &str, message: &str) -> Result<SmsReceipt, GatewayError>;
}
