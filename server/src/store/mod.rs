//! Persistence port for matches, tickets, payment requests and users.
//!
//! Every operation that touches more than one record (reserving seats,
//! settling a payment, cancelling a ticket) is atomic in each implementation,
//! so a seat count can never drift from the tickets holding it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use thiserror::Error;
use uuid::Uuid;

use crate::models::{
    Match, MatchUpdate, NewMatch, Payment, PaymentOutcome, PaymentRequest, Role, SeatType, Ticket,
    TicketStatus, UnknownVariant, User,
};

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("match {0} not found")]
    MatchNotFound(Uuid),

    #[error("ticket {0} not found")]
    TicketNotFound(Uuid),

    #[error("only {available} seat(s) available")]
    InsufficientSeats { available: i32 },

    #[error("seat {0} is already taken")]
    SeatTaken(String),

    #[error("match {0} has held seats or recorded payments")]
    SeatsSold(Uuid),

    #[error("{0}")]
    Conflict(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("corrupt record: {0}")]
    Corrupt(String),
}

impl From<UnknownVariant> for StoreError {
    fn from(err: UnknownVariant) -> Self {
        StoreError::Corrupt(err.to_string())
    }
}

/// One seat to hold for the duration of a payment attempt.
#[derive(Debug, Clone)]
pub struct SeatHold {
    pub seat_number: String,
    pub seat_type: SeatType,
    pub price: Decimal,
    pub guest_secret: String,
}

#[derive(Debug, Clone)]
pub struct SeatReservation {
    pub match_id: Uuid,
    pub user_id: Option<String>,
    pub seats: Vec<SeatHold>,
}

#[derive(Debug, Clone)]
pub struct NewUser {
    pub id: String,
    pub role: Role,
    pub display_name: Option<String>,
    pub phone: Option<String>,
}

/// Records touched by a settlement that this call performed.
#[derive(Debug, Clone)]
pub struct Settlement {
    pub request: PaymentRequest,
    pub tickets: Vec<Ticket>,
    pub football_match: Match,
}

#[derive(Debug, Clone)]
pub enum SettleResult {
    Applied(Settlement),
    /// The request had already left `pending`; nothing was changed.
    AlreadySettled(PaymentRequest),
    UnknownRequest,
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn list_matches(&self) -> Result<Vec<Match>, StoreError>;
    async fn get_match(&self, id: Uuid) -> Result<Match, StoreError>;
    async fn create_match(&self, new: NewMatch) -> Result<Match, StoreError>;
    async fn update_match(&self, id: Uuid, update: &MatchUpdate) -> Result<Match, StoreError>;
    /// Refused with [`StoreError::SeatsSold`] while any seat is held or once
    /// any payment was recorded for the match.
    async fn delete_match(&self, id: Uuid) -> Result<(), StoreError>;

    /// Decrements `available_seats` and inserts `pending_payment` tickets,
    /// or changes nothing.
    async fn reserve_tickets(&self, reservation: SeatReservation)
        -> Result<Vec<Ticket>, StoreError>;

    async fn open_payment_request(
        &self,
        request: &PaymentRequest,
        ticket_ids: &[Uuid],
    ) -> Result<(), StoreError>;

    /// Fails still-pending tickets of a booking whose payment never started
    /// and gives their seats back.
    async fn abandon_reservation(
        &self,
        match_id: Uuid,
        ticket_ids: &[Uuid],
    ) -> Result<(), StoreError>;

    async fn get_payment_request(
        &self,
        checkout_request_id: &str,
    ) -> Result<Option<PaymentRequest>, StoreError>;

    async fn stale_payment_requests(
        &self,
        opened_before: DateTime<Utc>,
    ) -> Result<Vec<PaymentRequest>, StoreError>;

    /// Moves a pending request to its final state exactly once.
    async fn settle_payment(
        &self,
        checkout_request_id: &str,
        outcome: &PaymentOutcome,
    ) -> Result<SettleResult, StoreError>;

    async fn payments_for_match(&self, match_id: Uuid) -> Result<Vec<Payment>, StoreError>;

    async fn get_ticket(&self, id: Uuid) -> Result<Ticket, StoreError>;
    async fn tickets_for_user(&self, user_id: &str) -> Result<Vec<Ticket>, StoreError>;
    async fn tickets_for_match(&self, match_id: Uuid) -> Result<Vec<Ticket>, StoreError>;
    async fn tickets_for_checkout(
        &self,
        checkout_request_id: &str,
    ) -> Result<Vec<Ticket>, StoreError>;

    /// Applies `from -> to` if the ticket is still in `from`. Leaving a
    /// seat-holding state for one that does not releases the seat.
    async fn transition_ticket(
        &self,
        id: Uuid,
        from: TicketStatus,
        to: TicketStatus,
    ) -> Result<Ticket, StoreError>;

    /// Returns the user, creating it on first sight. An admin role in `new`
    /// promotes an existing user; it never demotes.
    async fn ensure_user(&self, new: NewUser) -> Result<User, StoreError>;
}

pub(crate) fn check_transition(from: TicketStatus, to: TicketStatus) -> Result<(), StoreError> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(StoreError::Conflict(format!(
            "ticket cannot move from {} to {}",
            from, to
        )))
    }
}

pub(crate) fn ticket_ids_of(request: &PaymentRequest) -> Result<Vec<Uuid>, StoreError> {
    request
        .account_reference
        .parse::<crate::utils::account_reference::AccountReference>()
        .map(|reference| reference.ticket_ids)
        .map_err(|e| {
            StoreError::Corrupt(format!(
                "payment request {}: {}",
                request.checkout_request_id, e
            ))
        })
}

pub(crate) fn seat_count(n: usize) -> i32 {
    i32::try_from(n).unwrap_or(i32::MAX)
}
