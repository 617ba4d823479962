pub mod football_match;
pub mod payment;
pub mod ticket;
pub mod user;

pub use football_match::{Match, MatchUpdate, NewMatch};
pub use payment::{Payment, PaymentOutcome, PaymentRequest, PaymentStatus};
pub use ticket::{SeatType, Ticket, TicketStatus};
pub use user::{Role, User};

/// Raised when a stored status column holds a value this build does not know.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} '{value}'")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

impl UnknownVariant {
    pub(crate) fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}
