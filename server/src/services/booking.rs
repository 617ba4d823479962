//! Seat selection to STK push.
//!
//! Seats are held when the tickets are created, before the customer is
//! prompted, so a prompt is only ever sent for seats that exist. The hold is
//! released if the gateway refuses the push or, later, if the payment fails.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::BookingConfig;
use crate::gateways::{PaymentGateway, StkPushRequest};
use crate::models::{PaymentRequest, PaymentStatus, SeatType, TicketStatus};
use crate::store::{SeatHold, SeatReservation, Store};
use crate::utils::account_reference::AccountReference;
use crate::utils::error::AppError;
use crate::utils::phone::{mask_msisdn, normalize_msisdn};
use crate::utils::secret::generate_guest_secret;

const MAX_SEAT_LABEL_LEN: usize = 8;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookingRequest {
    pub match_id: Uuid,
    pub seats: Vec<SeatSelection>,
    pub phone: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeatSelection {
    pub seat_number: String,
    #[serde(default)]
    pub seat_type: SeatType,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BookedTicket {
    pub id: Uuid,
    pub seat_number: String,
    pub seat_type: SeatType,
    pub price: Decimal,
    pub status: TicketStatus,
    pub guest_secret: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BookingReceipt {
    pub checkout_request_id: String,
    pub merchant_request_id: String,
    pub customer_message: String,
    pub match_id: Uuid,
    pub amount: Decimal,
    pub tickets: Vec<BookedTicket>,
}

pub struct BookingService {
    store: Arc<dyn Store>,
    gateway: Arc<dyn PaymentGateway>,
    config: BookingConfig,
}

impl BookingService {
    pub fn new(
        store: Arc<dyn Store>,
        gateway: Arc<dyn PaymentGateway>,
        config: BookingConfig,
    ) -> Self {
        Self {
            store,
            gateway,
            config,
        }
    }

    pub async fn book(
        &self,
        request: BookingRequest,
        user_id: Option<String>,
    ) -> Result<BookingReceipt, AppError> {
        let phone = normalize_msisdn(&request.phone)?;
        let seats = self.validate_seats(&request.seats)?;

        let football_match = self.store.get_match(request.match_id).await?;
        if football_match.match_date <= Utc::now() {
            return Err(AppError::ValidationError(
                "Tickets are no longer on sale for this match".to_string(),
            ));
        }

        let mut holds = Vec::with_capacity(seats.len());
        for (seat_number, seat_type) in seats {
            let price = football_match.price_for(seat_type).ok_or_else(|| {
                AppError::ValidationError(format!(
                    "{} seats are not sold for this match",
                    seat_type.as_str()
                ))
            })?;
            holds.push(SeatHold {
                seat_number,
                seat_type,
                price,
                guest_secret: generate_guest_secret(),
            });
        }
        let total: Decimal = holds.iter().map(|h| h.price).sum();
        let amount = total
            .ceil()
            .to_u64()
            .filter(|a| *a > 0)
            .ok_or_else(|| AppError::ValidationError("Booking total must be positive".to_string()))?;

        let tickets = self
            .store
            .reserve_tickets(SeatReservation {
                match_id: football_match.id,
                user_id: user_id.clone(),
                seats: holds,
            })
            .await?;
        let ticket_ids: Vec<Uuid> = tickets.iter().map(|t| t.id).collect();
        let reference = AccountReference::new(football_match.id, ticket_ids.clone());

        let push = StkPushRequest {
            phone: phone.clone(),
            amount,
            account_reference: reference.gateway_label(),
            description: football_match.title(),
        };
        let accepted = match self.gateway.initiate_stk_push(&push).await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(match_id = %football_match.id, error = %e, "STK push failed, releasing seats");
                self.store
                    .abandon_reservation(football_match.id, &ticket_ids)
                    .await?;
                return Err(e.into());
            }
        };

        let now = Utc::now();
        let payment_request = PaymentRequest {
            checkout_request_id: accepted.checkout_request_id.clone(),
            merchant_request_id: accepted.merchant_request_id.clone(),
            match_id: football_match.id,
            user_id,
            account_reference: reference.to_string(),
            phone: phone.clone(),
            amount: Decimal::from(amount),
            status: PaymentStatus::Pending,
            result_code: None,
            result_desc: None,
            mpesa_receipt: None,
            created_at: now,
            updated_at: now,
        };
        if let Err(e) = self
            .store
            .open_payment_request(&payment_request, &ticket_ids)
            .await
        {
            // Without a stored request the callback cannot be matched.
            error!(
                checkout_request_id = %accepted.checkout_request_id,
                error = %e,
                "Payment prompt sent but request could not be recorded; releasing seats"
            );
            self.store
                .abandon_reservation(football_match.id, &ticket_ids)
                .await?;
            return Err(e.into());
        }

        info!(
            match_id = %football_match.id,
            checkout_request_id = %accepted.checkout_request_id,
            seats = tickets.len(),
            amount,
            phone = %mask_msisdn(&phone),
            "Booking awaiting payment"
        );

        Ok(BookingReceipt {
            checkout_request_id: accepted.checkout_request_id,
            merchant_request_id: accepted.merchant_request_id,
            customer_message: accepted.customer_message,
            match_id: football_match.id,
            amount: payment_request.amount,
            tickets: tickets
                .into_iter()
                .map(|t| BookedTicket {
                    id: t.id,
                    seat_number: t.seat_number,
                    seat_type: t.seat_type,
                    price: t.price,
                    status: t.status,
                    guest_secret: t.guest_secret,
                })
                .collect(),
        })
    }

    /// Normalised `(seat_number, seat_type)` pairs, in request order.
    fn validate_seats(
        &self,
        seats: &[SeatSelection],
    ) -> Result<Vec<(String, SeatType)>, AppError> {
        if seats.is_empty() {
            return Err(AppError::ValidationError(
                "Select at least one seat".to_string(),
            ));
        }
        if seats.len() > self.config.max_seats_per_booking {
            return Err(AppError::ValidationError(format!(
                "At most {} seats can be booked at once",
                self.config.max_seats_per_booking
            )));
        }

        let mut seen = HashSet::new();
        seats
            .iter()
            .map(|selection| {
                let label = normalize_seat_label(&selection.seat_number)?;
                if !seen.insert(label.clone()) {
                    return Err(AppError::ValidationError(format!(
                        "Seat {} was selected twice",
                        label
                    )));
                }
                Ok((label, selection.seat_type))
            })
            .collect()
    }
}

fn normalize_seat_label(raw: &str) -> Result<String, AppError> {
    let label = raw.trim().to_uppercase();
    let well_formed = !label.is_empty()
        && label.len() <= MAX_SEAT_LABEL_LEN
        && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-');
    if well_formed {
        Ok(label)
    } else {
        Err(AppError::ValidationError(format!(
            "'{}' is not a valid seat number",
            raw.trim()
        )))
    }
}
