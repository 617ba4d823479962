use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::gateways::SmsSender;
use crate::store::Settlement;
use crate::utils::phone::mask_msisdn;
use crate::utils::time::display_kickoff;

/// Sends booking confirmations. Delivery problems are logged and never
/// surface to the booking or settlement that triggered them.
pub struct Notifier {
    sms: Arc<dyn SmsSender>,
    public_base_url: String,
}

impl Notifier {
    pub fn new(sms: Arc<dyn SmsSender>, public_base_url: impl Into<String>) -> Self {
        Self {
            sms,
            public_base_url: public_base_url.into(),
        }
    }

    pub fn ticket_link(&self, ticket_id: uuid::Uuid, guest_secret: &str) -> String {
        format!(
            "{}/tickets/{}?secret={}",
            self.public_base_url, ticket_id, guest_secret
        )
    }

    pub fn confirmation_message(&self, settlement: &Settlement) -> String {
        let m = &settlement.football_match;
        let seats: Vec<&str> = settlement
            .tickets
            .iter()
            .map(|t| t.seat_number.as_str())
            .collect();
        let links: Vec<String> = settlement
            .tickets
            .iter()
            .map(|t| self.ticket_link(t.id, &t.guest_secret))
            .collect();

        let mut message = format!(
            "Tickets confirmed: {} at {}, {}. Seat(s): {}.",
            m.title(),
            m.venue,
            display_kickoff(m.match_date),
            seats.join(", ")
        );
        if let Some(receipt) = &settlement.request.mpesa_receipt {
            message.push_str(&format!(" M-Pesa ref: {}.", receipt));
        }
        message.push_str(&format!(" View: {}", links.join(" ")));
        message
    }

    pub async fn send_confirmation(&self, settlement: &Settlement) {
        let to = &settlement.request.phone;
        let message = self.confirmation_message(settlement);
        match self.sms.send(to, &message).await {
            Ok(receipt) => info!(
                checkout_request_id = %settlement.request.checkout_request_id,
                to = %mask_msisdn(to),
                status = %receipt.status,
                "Confirmation SMS sent"
            ),
            Err(e) => warn!(
                checkout_request_id = %settlement.request.checkout_request_id,
                to = %mask_msisdn(to),
                error = %e,
                "Confirmation SMS failed"
            ),
        }
    }

    pub fn spawn_confirmation(self: &Arc<Self>, settlement: Settlement) -> JoinHandle<()> {
        let notifier = Arc::clone(self);
        tokio::spawn(async move { notifier.send_confirmation(&settlement).await })
    }
}
