//! SMS delivery. Africa's Talking is used when an API key is configured;
//! otherwise messages are only logged.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::info;

use super::{GatewayError, SmsReceipt, SmsSender};
use crate::config::SmsConfig;
use crate::utils::phone::mask_msisdn;

const SERVICE: &str = "SMS gateway";
const MESSAGING_PATH: &str = "/version1/messaging";
const SENT_STATUS: &str = "Success";

pub struct AfricasTalkingSms {
    client: Client,
    endpoint: String,
    username: String,
    api_key: String,
    sender_id: Option<String>,
}

impl AfricasTalkingSms {
    pub fn new(config: &SmsConfig, api_key: String) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(15))
            .build()?;
        Ok(Self {
            client,
            endpoint: format!("{}{}", config.base_url.trim_end_matches('/'), MESSAGING_PATH),
            username: config.username.clone(),
            api_key,
            sender_id: config.sender_id.clone(),
        })
    }
}

#[async_trait]
impl SmsSender for AfricasTalkingSms {
    async fn send(&self, to: &str, message: &str) -> Result<SmsReceipt, GatewayError> {
        let recipient = format!("+{}", to.trim_start_matches('+'));
        let mut form = vec![
            ("username", self.username.as_str()),
            ("to", recipient.as_str()),
            ("message", message),
        ];
        if let Some(sender) = &self.sender_id {
            form.push(("from", sender.as_str()));
        }

        let response = self
            .client
            .post(&self.endpoint)
            .header("apiKey", &self.api_key)
            .header(reqwest::header::ACCEPT, "application/json")
            .form(&form)
            .send()
            .await
            .map_err(|e| GatewayError::Transport {
                service: SERVICE,
                message: e.to_string(),
            })?;

        let status = response.status();
        let body = response.text().await.map_err(|e| GatewayError::Transport {
            service: SERVICE,
            message: e.to_string(),
        })?;
        if !status.is_success() {
            return Err(GatewayError::Rejected {
                service: SERVICE,
                code: Some(status.as_u16().to_string()),
                message: body,
            });
        }

        interpret_send(&body)
    }
}

fn interpret_send(body: &str) -> Result<SmsReceipt, GatewayError> {
    let decoded: SendResponse = serde_json::from_str(body).map_err(|e| GatewayError::Decode {
        service: SERVICE,
        message: e.to_string(),
    })?;
    let data = decoded.sms_message_data;

    match data.recipients.into_iter().next() {
        Some(recipient) if recipient.status == SENT_STATUS => Ok(SmsReceipt {
            message_id: recipient.message_id,
            status: recipient.status,
        }),
        Some(recipient) => Err(GatewayError::Rejected {
            service: SERVICE,
            code: recipient.status_code.map(|c| c.to_string()),
            message: recipient.status,
        }),
        None => Err(GatewayError::Rejected {
            service: SERVICE,
            code: None,
            message: data.message,
        }),
    }
}

/// Stand-in used when no SMS credentials are configured.
#[derive(Default)]
pub struct LoggingSms;

#[async_trait]
impl SmsSender for LoggingSms {
    async fn send(&self, to: &str, message: &str) -> Result<SmsReceipt, GatewayError> {
        info!(
            to = %mask_msisdn(to),
            len = message.chars().count(),
            message = %redact_secrets(message),
            "SMS (not sent, no gateway configured)"
        );
        Ok(SmsReceipt {
            message_id: None,
            status: "logged".to_string(),
        })
    }
}

/// Ticket links carry `secret=<guest secret>`; logs get the link without it.
fn redact_secrets(message: &str) -> String {
    const KEY: &str = "secret=";
    let mut out = String::with_capacity(message.len());
    let mut rest = message;
    while let Some(at) = rest.find(KEY) {
        let value_start = at + KEY.len();
        out.push_str(&rest[..value_start]);
        out.push_str("***");
        let tail = &rest[value_start..];
        let value_len = tail
            .find(|c: char| c.is_whitespace() || c == '&')
            .unwrap_or(tail.len());
        rest = &tail[value_len..];
    }
    out.push_str(rest);
    out
}

#[derive(Deserialize)]
struct SendResponse {
    #[serde(rename = "SMSMessageData")]
    sms_message_data: SmsMessageData,
}

#[derive(Deserialize)]
struct SmsMessageData {
    #[serde(rename = "Message", default)]
    message: String,
    #[serde(rename = "Recipients", default)]
    recipients: Vec<Recipient>,
}

#[derive(Deserialize)]
struct Recipient {
    status: String,
    #[serde(rename = "statusCode")]
    status_code: Option<i64>,
    #[serde(rename = "messageId")]
    message_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delivered_recipient_gives_receipt() {
        let body = r#"{"SMSMessageData":{"Message":"Sent to 1/1 Total Cost: KES 0.8000",
            "Recipients":[{"statusCode":101,"number":"+254711XXXYYY","status":"Success",
            "cost":"KES 0.8000","messageId":"ATPid_SampleTxnId123"}]}}"#;
        let receipt = interpret_send(body).unwrap();
        assert_eq!(receipt.message_id.as_deref(), Some("ATPid_SampleTxnId123"));
    }

    #[test]
    fn test_failed_recipient_is_rejected() {
        let body = r#"{"SMSMessageData":{"Message":"Sent to 0/1",
            "Recipients":[{"statusCode":403,"number":"+254711XXXYYY","status":"InvalidPhoneNumber"}]}}"#;
        assert!(matches!(
            interpret_send(body),
            Err(GatewayError::Rejected { .. })
        ));
    }

    #[test]
    fn test_no_recipients_is_rejected() {
        let body = r#"{"SMSMessageData":{"Message":"InvalidSenderId","Recipients":[]}}"#;
        match interpret_send(body) {
            Err(GatewayError::Rejected { message, .. }) => assert_eq!(message, "InvalidSenderId"),
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    #[test]
    fn test_redacted_message_hides_guest_secrets() {
        let message = "Tickets: https://tickets.example/tickets/1?secret=Ab12Cd34 \
                       https://tickets.example/tickets/2?secret=Zz99&x=1 Enjoy";
        let logged = redact_secrets(message);
        assert!(!logged.contains("Ab12Cd34"));
        assert!(!logged.contains("Zz99"));
        assert!(logged.contains("/tickets/1?secret=*** "));
        assert!(logged.contains("?secret=***&x=1 Enjoy"));
        assert_eq!(redact_secrets("no links here"), "no links here");
    }

    #[tokio::test]
    async fn test_logging_sender_always_succeeds() {
        let receipt = LoggingSms.send("254712345678", "hello").await.unwrap();
        assert_eq!(receipt.status, "logged");
    }
}
