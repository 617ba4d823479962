//! Background settlement of payment requests whose callback never arrived.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::config::BookingConfig;
use crate::gateways::{PaymentGateway, StkQueryStatus};
use crate::models::{PaymentOutcome, PaymentRequest};
use crate::services::reconciliation::{Reconciler, SettleOutcome};
use crate::store::Store;
use crate::utils::error::AppError;

pub const EXPIRED_REASON: &str = "Payment request expired without confirmation";

pub struct PaymentSweeper {
    store: Arc<dyn Store>,
    gateway: Arc<dyn PaymentGateway>,
    reconciler: Arc<Reconciler>,
    config: BookingConfig,
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(365))
}

impl PaymentSweeper {
    pub fn new(
        store: Arc<dyn Store>,
        gateway: Arc<dyn PaymentGateway>,
        reconciler: Arc<Reconciler>,
        config: BookingConfig,
    ) -> Self {
        Self {
            store,
            gateway,
            reconciler,
            config,
        }
    }

    /// Runs until the task is dropped.
    pub async fn run(self) {
        info!(
            sweep_interval = ?self.config.sweep_interval,
            payment_timeout = ?self.config.payment_timeout,
            payment_expiry = ?self.config.payment_expiry,
            "Starting payment sweeper"
        );

        let mut ticker = interval(self.config.sweep_interval);
        loop {
            ticker.tick().await;
            match self.sweep_once(Utc::now()).await {
                Ok(0) => {}
                Ok(settled) => info!(settled, "Sweeper settled stale payments"),
                Err(e) => warn!(error = %e, "Payment sweep failed"),
            }
        }
    }

    /// One pass over requests pending longer than the payment timeout.
    /// Returns how many were settled by this pass.
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> Result<usize, AppError> {
        let opened_before = now - to_chrono(self.config.payment_timeout);
        let stale = self.store.stale_payment_requests(opened_before).await?;
        if !stale.is_empty() {
            debug!(count = stale.len(), "Checking stale payment requests");
        }

        let mut settled = 0;
        for request in stale {
            let Some(outcome) = self.resolve(&request, now).await else {
                continue;
            };
            match self
                .reconciler
                .settle(&request.checkout_request_id, outcome)
                .await
            {
                Ok(SettleOutcome::Applied(_)) => settled += 1,
                Ok(_) => {}
                Err(e) => warn!(
                    checkout_request_id = %request.checkout_request_id,
                    error = %e,
                    "Could not settle stale payment"
                ),
            }
        }
        Ok(settled)
    }

    /// The final outcome for a stale request, or `None` to look again later.
    async fn resolve(&self, request: &PaymentRequest, now: DateTime<Utc>) -> Option<PaymentOutcome> {
        match self
            .gateway
            .query_stk_status(&request.checkout_request_id)
            .await
        {
            Ok(StkQueryStatus::Completed) => {
                return Some(PaymentOutcome::Paid {
                    receipt: None,
                    amount: Some(request.amount),
                    phone: Some(request.phone.clone()),
                    paid_at: now,
                })
            }
            Ok(StkQueryStatus::Failed {
                result_code,
                reason,
            }) => {
                return Some(PaymentOutcome::Failed {
                    result_code: Some(result_code),
                    reason,
                })
            }
            Ok(StkQueryStatus::Pending) => {}
            Err(e) => warn!(
                checkout_request_id = %request.checkout_request_id,
                error = %e,
                "STK query failed"
            ),
        }

        if now - request.created_at >= to_chrono(self.config.payment_expiry) {
            info!(
                checkout_request_id = %request.checkout_request_id,
                "Expiring unanswered payment request"
            );
            Some(PaymentOutcome::Failed {
                result_code: None,
                reason: EXPIRED_REASON.to_string(),
            })
        } else {
            None
        }
    }
}
