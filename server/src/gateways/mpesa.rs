//! Safaricom Daraja client: OAuth, Lipa na M-Pesa Online (STK push) and the
//! STK status query, plus the shape of the asynchronous result callback.

use std::str::FromStr;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::Utc;
use reqwest::{Client, StatusCode};
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{GatewayError, PaymentGateway, StkPushAccepted, StkPushRequest, StkQueryStatus};
use crate::config::MpesaConfig;
use crate::models::PaymentOutcome;
use crate::utils::time::{daraja_timestamp, parse_daraja_timestamp};

const SERVICE: &str = "M-Pesa";
const OAUTH_PATH: &str = "/oauth/v1/generate?grant_type=client_credentials";
const STK_PUSH_PATH: &str = "/mpesa/stkpush/v1/processrequest";
const STK_QUERY_PATH: &str = "/mpesa/stkpushquery/v1/query";
const TRANSACTION_TYPE: &str = "CustomerPayBillOnline";
const DEFAULT_TOKEN_LIFETIME_SECS: u64 = 3599;
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);
/// Daraja's "The transaction is being processed" error code.
const STILL_PROCESSING: &str = "500.001.1001";
const SUCCESS_CODE: i64 = 0;
const MAX_DESCRIPTION_LEN: usize = 13;

struct AccessToken {
    value: String,
    expires_at: Instant,
}

pub struct MpesaClient {
    client: Client,
    config: MpesaConfig,
    callback_url: String,
    token: Mutex<Option<AccessToken>>,
}

impl MpesaClient {
    pub fn new(config: MpesaConfig) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(config.request_timeout).build()?;
        Ok(Self {
            client,
            callback_url: callback_url(&config),
            config,
            token: Mutex::new(None),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    async fn access_token(&self) -> Result<String, GatewayError> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if token.expires_at > Instant::now() {
                return Ok(token.value.clone());
            }
        }

        if self.config.consumer_key.is_empty() || self.config.consumer_secret.is_empty() {
            return Err(GatewayError::NotConfigured {
                service: SERVICE,
                reason: "MPESA_CONSUMER_KEY and MPESA_CONSUMER_SECRET must be set".to_string(),
            });
        }

        let response = self
            .client
            .get(self.url(OAUTH_PATH))
            .basic_auth(&self.config.consumer_key, Some(&self.config.consumer_secret))
            .send()
            .await
            .map_err(transport_error)?;
        let status = response.status();
        let body = response.bytes().await.map_err(transport_error)?;
        if !status.is_success() {
            return Err(rejection(status, &body));
        }

        let decoded: OAuthResponse = serde_json::from_slice(&body).map_err(decode_error)?;
        let lifetime = lenient_u64(&decoded.expires_in).unwrap_or(DEFAULT_TOKEN_LIFETIME_SECS);
        let expires_at = Instant::now()
            + Duration::from_secs(lifetime).saturating_sub(TOKEN_REFRESH_MARGIN);
        debug!(lifetime_secs = lifetime, "Fetched Daraja access token");

        *cached = Some(AccessToken {
            value: decoded.access_token.clone(),
            expires_at,
        });
        Ok(decoded.access_token)
    }

    async fn post_json<B>(&self, path: &str, body: &B) -> Result<(StatusCode, Vec<u8>), GatewayError>
    where
        B: Serialize + Sync,
    {
        let token = self.access_token().await?;
        let response = self
            .client
            .post(self.url(path))
            .bearer_auth(token)
            .json(body)
            .send()
            .await
            .map_err(transport_error)?;
        let status = response.status();
        let bytes = response.bytes().await.map_err(transport_error)?;
        Ok((status, bytes.to_vec()))
    }

    fn credentials(&self) -> (String, String) {
        let timestamp = daraja_timestamp(Utc::now());
        let password = stk_password(&self.config.shortcode, &self.config.passkey, &timestamp);
        (password, timestamp)
    }
}

#[async_trait]
impl PaymentGateway for MpesaClient {
    async fn initiate_stk_push(
        &self,
        request: &StkPushRequest,
    ) -> Result<StkPushAccepted, GatewayError> {
        let (password, timestamp) = self.credentials();
        let body = StkPushBody {
            business_short_code: &self.config.shortcode,
            password: &password,
            timestamp: &timestamp,
            transaction_type: TRANSACTION_TYPE,
            amount: request.amount,
            party_a: &request.phone,
            party_b: &self.config.shortcode,
            phone_number: &request.phone,
            callback_url: &self.callback_url,
            account_reference: &request.account_reference,
            transaction_desc: truncate(&request.description, MAX_DESCRIPTION_LEN),
        };

        let (status, bytes) = self.post_json(STK_PUSH_PATH, &body).await?;
        let accepted = interpret_push(status, &bytes)?;
        info!(
            checkout_request_id = %accepted.checkout_request_id,
            amount = request.amount,
            "STK push accepted"
        );
        Ok(accepted)
    }

    async fn query_stk_status(
        &self,
        checkout_request_id: &str,
    ) -> Result<StkQueryStatus, GatewayError> {
        let (password, timestamp) = self.credentials();
        let body = StkQueryBody {
            business_short_code: &self.config.shortcode,
            password: &password,
            timestamp: &timestamp,
            checkout_request_id,
        };

        let (status, bytes) = self.post_json(STK_QUERY_PATH, &body).await?;
        interpret_query(status, &bytes)
    }
}

/// The configured callback URL carrying the shared token, if one is set.
fn callback_url(config: &MpesaConfig) -> String {
    match &config.callback_token {
        Some(token) if !config.callback_url.contains("token=") => {
            let sep = if config.callback_url.contains('?') { '&' } else { '?' };
            format!("{}{}token={}", config.callback_url, sep, token)
        }
        _ => config.callback_url.clone(),
    }
}

/// `base64(shortcode + passkey + timestamp)`.
pub fn stk_password(shortcode: &str, passkey: &str, timestamp: &str) -> String {
    STANDARD.encode(format!("{shortcode}{passkey}{timestamp}"))
}

fn interpret_push(status: StatusCode, body: &[u8]) -> Result<StkPushAccepted, GatewayError> {
    if !status.is_success() {
        return Err(rejection(status, body));
    }
    let decoded: StkPushResponse = serde_json::from_slice(body).map_err(decode_error)?;
    if lenient_i64(&decoded.response_code) != Some(SUCCESS_CODE) {
        return Err(GatewayError::Rejected {
            service: SERVICE,
            code: decoded.response_code.as_str().map(String::from),
            message: decoded.response_description,
        });
    }
    Ok(StkPushAccepted {
        merchant_request_id: decoded.merchant_request_id,
        checkout_request_id: decoded.checkout_request_id,
        customer_message: decoded.customer_message.unwrap_or_default(),
    })
}

fn interpret_query(status: StatusCode, body: &[u8]) -> Result<StkQueryStatus, GatewayError> {
    if !status.is_success() {
        return match serde_json::from_slice::<DarajaError>(body) {
            Ok(err) if err.error_code == STILL_PROCESSING => Ok(StkQueryStatus::Pending),
            _ => Err(rejection(status, body)),
        };
    }
    let decoded: StkQueryResponse = serde_json::from_slice(body).map_err(decode_error)?;
    Ok(match decoded.result_code.as_ref().and_then(lenient_i64) {
        Some(SUCCESS_CODE) => StkQueryStatus::Completed,
        Some(code) => StkQueryStatus::Failed {
            result_code: code,
            reason: decoded.result_desc.unwrap_or_default(),
        },
        None => StkQueryStatus::Pending,
    })
}

fn rejection(status: StatusCode, body: &[u8]) -> GatewayError {
    match serde_json::from_slice::<DarajaError>(body) {
        Ok(err) => GatewayError::Rejected {
            service: SERVICE,
            code: Some(err.error_code),
            message: err.error_message,
        },
        Err(_) => GatewayError::Rejected {
            service: SERVICE,
            code: Some(status.as_u16().to_string()),
            message: truncate(&String::from_utf8_lossy(body), 200).to_string(),
        },
    }
}

fn transport_error(err: reqwest::Error) -> GatewayError {
    GatewayError::Transport {
        service: SERVICE,
        message: err.to_string(),
    }
}

fn decode_error(err: serde_json::Error) -> GatewayError {
    GatewayError::Decode {
        service: SERVICE,
        message: err.to_string(),
    }
}

fn truncate(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

fn lenient_u64(value: &Value) -> Option<u64> {
    value
        .as_u64()
        .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
}

fn lenient_i64(value: &Value) -> Option<i64> {
    value
        .as_i64()
        .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
}

fn lenient_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[derive(Deserialize)]
struct OAuthResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Value,
}

#[derive(Deserialize)]
struct DarajaError {
    #[serde(rename = "errorCode")]
    error_code: String,
    #[serde(rename = "errorMessage", default)]
    error_message: String,
}

#[derive(Serialize)]
struct StkPushBody<'a> {
    #[serde(rename = "BusinessShortCode")]
    business_short_code: &'a str,
    #[serde(rename = "Password")]
    password: &'a str,
    #[serde(rename = "Timestamp")]
    timestamp: &'a str,
    #[serde(rename = "TransactionType")]
    transaction_type: &'a str,
    #[serde(rename = "Amount")]
    amount: u64,
    #[serde(rename = "PartyA")]
    party_a: &'a str,
    #[serde(rename = "PartyB")]
    party_b: &'a str,
    #[serde(rename = "PhoneNumber")]
    phone_number: &'a str,
    #[serde(rename = "CallBackURL")]
    callback_url: &'a str,
    #[serde(rename = "AccountReference")]
    account_reference: &'a str,
    #[serde(rename = "TransactionDesc")]
    transaction_desc: &'a str,
}

#[derive(Deserialize)]
struct StkPushResponse {
    #[serde(rename = "MerchantRequestID")]
    merchant_request_id: String,
    #[serde(rename = "CheckoutRequestID")]
    checkout_request_id: String,
    #[serde(rename = "ResponseCode")]
    response_code: Value,
    #[serde(rename = "ResponseDescription", default)]
    response_description: String,
    #[serde(rename = "CustomerMessage")]
    customer_message: Option<String>,
}

#[derive(Serialize)]
struct StkQueryBody<'a> {
    #[serde(rename = "BusinessShortCode")]
    business_short_code: &'a str,
    #[serde(rename = "Password")]
    password: &'a str,
    #[serde(rename = "Timestamp")]
    timestamp: &'a str,
    #[serde(rename = "CheckoutRequestID")]
    checkout_request_id: &'a str,
}

#[derive(Deserialize)]
struct StkQueryResponse {
    #[serde(rename = "ResultCode")]
    result_code: Option<Value>,
    #[serde(rename = "ResultDesc")]
    result_desc: Option<String>,
}

/// Body Daraja posts to the callback URL once the customer answers the prompt.
#[derive(Debug, Clone, Deserialize)]
pub struct StkCallbackEnvelope {
    #[serde(rename = "Body")]
    pub body: StkCallbackBody,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StkCallbackBody {
    #[serde(rename = "stkCallback")]
    pub stk_callback: StkCallback,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StkCallback {
    #[serde(rename = "MerchantRequestID")]
    pub merchant_request_id: String,
    #[serde(rename = "CheckoutRequestID")]
    pub checkout_request_id: String,
    #[serde(rename = "ResultCode", deserialize_with = "result_code")]
    pub result_code: i64,
    #[serde(rename = "ResultDesc", default)]
    pub result_desc: String,
    #[serde(rename = "CallbackMetadata")]
    pub callback_metadata: Option<CallbackMetadata>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CallbackMetadata {
    #[serde(rename = "Item", default)]
    pub items: Vec<CallbackItem>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CallbackItem {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Value")]
    pub value: Option<Value>,
}

impl StkCallback {
    fn metadata(&self, name: &str) -> Option<&Value> {
        self.callback_metadata
            .as_ref()?
            .items
            .iter()
            .find(|item| item.name == name)?
            .value
            .as_ref()
    }

    pub fn is_success(&self) -> bool {
        self.result_code == SUCCESS_CODE
    }

    pub fn outcome(&self) -> PaymentOutcome {
        if !self.is_success() {
            return PaymentOutcome::Failed {
                result_code: Some(self.result_code),
                reason: self.result_desc.clone(),
            };
        }

        let amount = self
            .metadata("Amount")
            .and_then(lenient_string)
            .and_then(|raw| Decimal::from_str(&raw).ok());
        let paid_at = self
            .metadata("TransactionDate")
            .and_then(lenient_string)
            .and_then(|raw| parse_daraja_timestamp(&raw))
            .unwrap_or_else(Utc::now);

        PaymentOutcome::Paid {
            receipt: self.metadata("MpesaReceiptNumber").and_then(lenient_string),
            amount,
            phone: self.metadata("PhoneNumber").and_then(lenient_string),
            paid_at,
        }
    }
}

fn result_code<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Value::deserialize(deserializer)?;
    lenient_i64(&raw).ok_or_else(|| serde::de::Error::custom("ResultCode is not an integer"))
}
