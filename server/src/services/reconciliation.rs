//! Applies final payment answers. This is the only path that moves a payment
//! request or its tickets out of `pending`.

use std::sync::Arc;

use serde::Serialize;
use tracing::{error, info, warn};

use crate::gateways::mpesa::StkCallback;
use crate::gateways::{PaymentGateway, StkQueryStatus};
use crate::models::{PaymentOutcome, PaymentStatus, Ticket};
use crate::services::notifier::Notifier;
use crate::store::{SettleResult, Store};
use crate::utils::error::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettleOutcome {
    Applied(PaymentStatus),
    AlreadySettled(PaymentStatus),
    UnknownRequest,
    /// A success report the gateway did not confirm; left for the sweeper.
    Unconfirmed,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentStatusView {
    pub checkout_request_id: String,
    pub status: PaymentStatus,
    pub payment_confirmed: bool,
    pub result_desc: Option<String>,
    pub mpesa_receipt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tickets: Option<Vec<Ticket>>,
}

pub struct Reconciler {
    store: Arc<dyn Store>,
    gateway: Arc<dyn PaymentGateway>,
    notifier: Arc<Notifier>,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn Store>,
        gateway: Arc<dyn PaymentGateway>,
        notifier: Arc<Notifier>,
    ) -> Self {
        Self {
            store,
            gateway,
            notifier,
        }
    }

    /// Applies a webhook result. The webhook is unauthenticated input, so a
    /// success for a pending request is only applied once the gateway's own
    /// status query agrees.
    pub async fn handle_callback(&self, callback: &StkCallback) -> Result<SettleOutcome, AppError> {
        let checkout_request_id = callback.checkout_request_id.as_str();
        info!(
            checkout_request_id,
            result_code = callback.result_code,
            "STK callback received"
        );

        let outcome = callback.outcome();
        if callback.is_success() && self.awaits_confirmation(checkout_request_id).await? {
            match self.gateway.query_stk_status(checkout_request_id).await {
                Ok(StkQueryStatus::Completed) => {}
                Ok(status) => {
                    warn!(
                        checkout_request_id,
                        gateway_status = ?status,
                        "Success callback not confirmed by gateway; ignored"
                    );
                    return Ok(SettleOutcome::Unconfirmed);
                }
                Err(e) => {
                    warn!(
                        checkout_request_id,
                        error = %e,
                        "Could not confirm success callback; left for the sweeper"
                    );
                    return Ok(SettleOutcome::Unconfirmed);
                }
            }
        }
        self.settle(checkout_request_id, outcome).await
    }

    async fn awaits_confirmation(&self, checkout_request_id: &str) -> Result<bool, AppError> {
        Ok(self
            .store
            .get_payment_request(checkout_request_id)
            .await?
            .is_some_and(|request| request.status == PaymentStatus::Pending))
    }

    pub async fn settle(
        &self,
        checkout_request_id: &str,
        outcome: PaymentOutcome,
    ) -> Result<SettleOutcome, AppError> {
        match self
            .store
            .settle_payment(checkout_request_id, &outcome)
            .await?
        {
            SettleResult::Applied(settlement) => {
                let status = settlement.request.status;
                info!(
                    checkout_request_id,
                    match_id = %settlement.request.match_id,
                    status = %status,
                    tickets = settlement.tickets.len(),
                    receipt = settlement.request.mpesa_receipt.as_deref().unwrap_or("-"),
                    "Payment settled"
                );
                if status == PaymentStatus::Completed {
                    self.notifier.spawn_confirmation(settlement);
                }
                Ok(SettleOutcome::Applied(status))
            }
            SettleResult::AlreadySettled(request) => {
                if request.status == PaymentStatus::Failed
                    && matches!(outcome, PaymentOutcome::Paid { .. })
                {
                    // Seats were already released; money must go back by hand.
                    error!(
                        checkout_request_id,
                        match_id = %request.match_id,
                        receipt = outcome.receipt().unwrap_or("-"),
                        amount = %request.amount,
                        "Late payment for an expired request; refund required"
                    );
                } else {
                    info!(
                        checkout_request_id,
                        status = %request.status,
                        "Duplicate payment result ignored"
                    );
                }
                Ok(SettleOutcome::AlreadySettled(request.status))
            }
            SettleResult::UnknownRequest => {
                warn!(checkout_request_id, "Payment result for unknown request");
                Ok(SettleOutcome::UnknownRequest)
            }
        }
    }

    pub async fn payment_status(
        &self,
        checkout_request_id: &str,
    ) -> Result<PaymentStatusView, AppError> {
        let request = self
            .store
            .get_payment_request(checkout_request_id)
            .await?
            .ok_or_else(|| AppError::NotFound("Payment request not found".to_string()))?;

        let confirmed = request.status == PaymentStatus::Completed;
        let tickets = if confirmed {
            Some(self.store.tickets_for_checkout(checkout_request_id).await?)
        } else {
            None
        };

        Ok(PaymentStatusView {
            checkout_request_id: request.checkout_request_id,
            status: request.status,
            payment_confirmed: confirmed,
            result_desc: request.result_desc,
            mpesa_receipt: request.mpesa_receipt,
            tickets,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateways::mpesa::StkCallbackEnvelope;
    use crate::gateways::{
        GatewayError, SmsReceipt, SmsSender, StkPushAccepted, StkPushRequest,
    };
    use crate::models::{NewMatch, SeatType, TicketStatus};
    use crate::store::{MemoryStore, SeatHold, SeatReservation};
    use crate::utils::account_reference::AccountReference;
    use async_trait::async_trait;
    use chrono::Utc;
    use rust_decimal::Decimal;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingSms {
        sent: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl SmsSender for RecordingSms {
        async fn send(&self, to: &str, message: &str) -> Result<SmsReceipt, GatewayError> {
            self.sent
                .lock()
                .unwrap()
                .push((to.to_string(), message.to_string()));
            Ok(SmsReceipt {
                message_id: None,
                status: "Success".to_string(),
            })
        }
    }

    /// Answers every status query with the same result.
    struct FixedStatusGateway(Option<StkQueryStatus>);

    #[async_trait]
    impl PaymentGateway for FixedStatusGateway {
        async fn initiate_stk_push(
            &self,
            _: &StkPushRequest,
        ) -> Result<StkPushAccepted, GatewayError> {
            unreachable!("reconciliation never pushes")
        }

        async fn query_stk_status(&self, _: &str) -> Result<StkQueryStatus, GatewayError> {
            self.0.clone().ok_or_else(|| GatewayError::Transport {
                service: "M-Pesa",
                message: "timed out".to_string(),
            })
        }
    }

    fn reconciler(
        store: &Arc<MemoryStore>,
        sms: Arc<RecordingSms>,
        gateway_says: Option<StkQueryStatus>,
    ) -> Reconciler {
        let notifier = Arc::new(Notifier::new(sms, "https://tickets.example"));
        Reconciler::new(
            store.clone(),
            Arc::new(FixedStatusGateway(gateway_says)),
            notifier,
        )
    }

    fn success_callback(checkout_id: &str) -> StkCallback {
        let raw = serde_json::json!({
            "Body": { "stkCallback": {
                "MerchantRequestID": "m",
                "CheckoutRequestID": checkout_id,
                "ResultCode": 0,
                "ResultDesc": "The service request is processed successfully.",
                "CallbackMetadata": { "Item": [
                    { "Name": "MpesaReceiptNumber", "Value": "QKCONFIRM1" }
                ] }
            } }
        });
        serde_json::from_value::<StkCallbackEnvelope>(raw)
            .unwrap()
            .body
            .stk_callback
    }

    async fn pending_booking(store: &MemoryStore, checkout_id: &str) -> uuid::Uuid {
        let m = store
            .create_match(NewMatch {
                home_team: "Gor Mahia".to_string(),
                away_team: "AFC Leopards".to_string(),
                venue: "Nyayo Stadium".to_string(),
                match_date: Utc::now() + chrono::Duration::days(7),
                ticket_price: Decimal::new(500, 0),
                vip_ticket_price: None,
                total_seats: 5,
            })
            .await
            .unwrap();
        let tickets = store
            .reserve_tickets(SeatReservation {
                match_id: m.id,
                user_id: None,
                seats: vec![SeatHold {
                    seat_number: "B4".to_string(),
                    seat_type: SeatType::Regular,
                    price: Decimal::new(500, 0),
                    guest_secret: "s".repeat(32),
                }],
            })
            .await
            .unwrap();
        let ids: Vec<_> = tickets.iter().map(|t| t.id).collect();
        let now = Utc::now();
        store
            .open_payment_request(
                &crate::models::PaymentRequest {
                    checkout_request_id: checkout_id.to_string(),
                    merchant_request_id: "m".to_string(),
                    match_id: m.id,
                    user_id: None,
                    account_reference: AccountReference::new(m.id, ids.clone()).to_string(),
                    phone: "254712345678".to_string(),
                    amount: Decimal::new(500, 0),
                    status: PaymentStatus::Pending,
                    result_code: None,
                    result_desc: None,
                    mpesa_receipt: None,
                    created_at: now,
                    updated_at: now,
                },
                &ids,
            )
            .await
            .unwrap();
        m.id
    }

    fn paid(receipt: &str) -> PaymentOutcome {
        PaymentOutcome::Paid {
            receipt: Some(receipt.to_string()),
            amount: Some(Decimal::new(500, 0)),
            phone: Some("254712345678".to_string()),
            paid_at: Utc::now(),
        }
    }

    async fn wait_for_sms(sms: &RecordingSms, count: usize) {
        for _ in 0..50 {
            if sms.sent.lock().unwrap().len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_duplicate_success_sends_one_sms() {
        let store = Arc::new(MemoryStore::new());
        let sms = Arc::new(RecordingSms::default());
        let reconciler = reconciler(&store, sms.clone(), None);
        pending_booking(&store, "ws_CO_1").await;

        let first = reconciler.settle("ws_CO_1", paid("QK12ABC")).await.unwrap();
        let second = reconciler.settle("ws_CO_1", paid("QK12ABC")).await.unwrap();
        assert_eq!(first, SettleOutcome::Applied(PaymentStatus::Completed));
        assert_eq!(second, SettleOutcome::AlreadySettled(PaymentStatus::Completed));

        wait_for_sms(&sms, 1).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        let sent = sms.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "254712345678");
        assert!(sent[0].1.contains("Gor Mahia vs AFC Leopards"));
        assert!(sent[0].1.contains("QK12ABC"));
    }

    #[tokio::test]
    async fn test_status_view_lists_tickets_only_once_confirmed() {
        let store = Arc::new(MemoryStore::new());
        let reconciler = reconciler(&store, Arc::new(RecordingSms::default()), None);
        pending_booking(&store, "ws_CO_2").await;

        let pending = reconciler.payment_status("ws_CO_2").await.unwrap();
        assert!(!pending.payment_confirmed);
        assert!(pending.tickets.is_none());

        reconciler.settle("ws_CO_2", paid("QK99XYZ")).await.unwrap();
        let done = reconciler.payment_status("ws_CO_2").await.unwrap();
        assert!(done.payment_confirmed);
        assert_eq!(done.mpesa_receipt.as_deref(), Some("QK99XYZ"));
        let tickets = done.tickets.unwrap();
        assert_eq!(tickets.len(), 1);
        assert_eq!(tickets[0].status, TicketStatus::Active);
    }

    #[tokio::test]
    async fn test_late_success_after_failure_changes_nothing() {
        let store = Arc::new(MemoryStore::new());
        let sms = Arc::new(RecordingSms::default());
        let reconciler = reconciler(&store, sms.clone(), None);
        let match_id = pending_booking(&store, "ws_CO_3").await;

        let failed = PaymentOutcome::Failed {
            result_code: Some(1032),
            reason: "Request cancelled by user".to_string(),
        };
        assert_eq!(
            reconciler.settle("ws_CO_3", failed).await.unwrap(),
            SettleOutcome::Applied(PaymentStatus::Failed)
        );
        assert_eq!(
            reconciler.settle("ws_CO_3", paid("QK00LATE")).await.unwrap(),
            SettleOutcome::AlreadySettled(PaymentStatus::Failed)
        );

        assert_eq!(store.get_match(match_id).await.unwrap().available_seats, 5);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(sms.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_checkout_id() {
        let store = Arc::new(MemoryStore::new());
        let reconciler = reconciler(&store, Arc::new(RecordingSms::default()), None);
        assert_eq!(
            reconciler.settle("nope", paid("X")).await.unwrap(),
            SettleOutcome::UnknownRequest
        );
        assert!(matches!(
            reconciler.payment_status("nope").await,
            Err(AppError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_unconfirmed_success_callback_is_not_applied() {
        let store = Arc::new(MemoryStore::new());
        let match_id = pending_booking(&store, "ws_CO_4").await;

        for gateway_says in [
            Some(StkQueryStatus::Pending),
            Some(StkQueryStatus::Failed {
                result_code: 1032,
                reason: "Request cancelled by user".to_string(),
            }),
            None,
        ] {
            let reconciler = reconciler(&store, Arc::new(RecordingSms::default()), gateway_says);
            assert_eq!(
                reconciler
                    .handle_callback(&success_callback("ws_CO_4"))
                    .await
                    .unwrap(),
                SettleOutcome::Unconfirmed
            );
        }

        let request = store.get_payment_request("ws_CO_4").await.unwrap().unwrap();
        assert_eq!(request.status, PaymentStatus::Pending);
        assert!(store.payments_for_match(match_id).await.unwrap().is_empty());
        let tickets = store.tickets_for_checkout("ws_CO_4").await.unwrap();
        assert_eq!(tickets[0].status, TicketStatus::PendingPayment);
    }

    #[tokio::test]
    async fn test_confirmed_success_callback_is_applied() {
        let store = Arc::new(MemoryStore::new());
        pending_booking(&store, "ws_CO_5").await;
        let reconciler = reconciler(
            &store,
            Arc::new(RecordingSms::default()),
            Some(StkQueryStatus::Completed),
        );

        assert_eq!(
            reconciler
                .handle_callback(&success_callback("ws_CO_5"))
                .await
                .unwrap(),
            SettleOutcome::Applied(PaymentStatus::Completed)
        );
        let request = store.get_payment_request("ws_CO_5").await.unwrap().unwrap();
        assert_eq!(request.mpesa_receipt.as_deref(), Some("QKCONFIRM1"));
    }
}
