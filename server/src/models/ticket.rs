use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::UnknownVariant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketStatus {
    PendingPayment,
    #[serde(alias = "confirmed")]
    Active,
    Used,
    Cancelled,
    PaymentFailed,
}

impl TicketStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TicketStatus::PendingPayment => "pending_payment",
            TicketStatus::Active => "active",
            TicketStatus::Used => "used",
            TicketStatus::Cancelled => "cancelled",
            TicketStatus::PaymentFailed => "payment_failed",
        }
    }

    /// A live ticket holds its seat.
    pub fn holds_seat(&self) -> bool {
        matches!(
            self,
            TicketStatus::PendingPayment | TicketStatus::Active | TicketStatus::Used
        )
    }

    pub fn can_transition_to(&self, next: TicketStatus) -> bool {
        matches!(
            (self, next),
            (TicketStatus::PendingPayment, TicketStatus::Active)
                | (TicketStatus::PendingPayment, TicketStatus::PaymentFailed)
                | (TicketStatus::Active, TicketStatus::Used)
                | (TicketStatus::Active, TicketStatus::Cancelled)
        )
    }
}

impl fmt::Display for TicketStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TicketStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending_payment" => Ok(TicketStatus::PendingPayment),
            "active" | "confirmed" => Ok(TicketStatus::Active),
            "used" => Ok(TicketStatus::Used),
            "cancelled" => Ok(TicketStatus::Cancelled),
            "payment_failed" => Ok(TicketStatus::PaymentFailed),
            other => Err(UnknownVariant::new("ticket status", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeatType {
    #[default]
    Regular,
    Vip,
}

impl SeatType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SeatType::Regular => "regular",
            SeatType::Vip => "vip",
        }
    }
}

impl FromStr for SeatType {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "regular" => Ok(SeatType::Regular),
            "vip" => Ok(SeatType::Vip),
            other => Err(UnknownVariant::new("seat type", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ticket {
    pub id: Uuid,
    pub match_id: Uuid,
    pub user_id: Option<String>,
    pub seat_number: String,
    pub seat_type: SeatType,
    pub price: Decimal,
    pub status: TicketStatus,
    #[serde(skip_serializing)]
    pub guest_secret: String,
    pub mpesa_checkout_request_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Ticket {
    pub fn is_owned_by(&self, user_id: &str) -> bool {
        self.user_id.as_deref() == Some(user_id)
    }

    /// Constant-time comparison of a presented guest secret.
    pub fn guest_secret_matches(&self, presented: &str) -> bool {
        let expected = self.guest_secret.as_bytes();
        let presented = presented.as_bytes();
        if expected.len() != presented.len() {
            return false;
        }
        expected
            .iter()
            .zip(presented)
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}
