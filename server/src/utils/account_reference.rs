//! Booking correlation string carried with each payment request.
//!
//! The full form is `matchId_ticketId1_ticketId2...`. It is persisted on the
//! payment request and decides which tickets a settlement touches. M-Pesa
//! truncates AccountReference to twelve characters, so only a short label
//! derived from the match id is sent to the gateway.

use std::fmt;
use std::str::FromStr;

use uuid::Uuid;

const SEPARATOR: char = '_';
const GATEWAY_LABEL_PREFIX: &str = "TKT";
pub const GATEWAY_LABEL_MAX: usize = 12;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountReference {
    pub match_id: Uuid,
    pub ticket_ids: Vec<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AccountReferenceError {
    #[error("account reference is empty")]
    Empty,
    #[error("account reference lists no tickets")]
    NoTickets,
    #[error("invalid id '{0}' in account reference")]
    InvalidId(String),
}

impl AccountReference {
    pub fn new(match_id: Uuid, ticket_ids: Vec<Uuid>) -> Self {
        Self {
            match_id,
            ticket_ids,
        }
    }

    /// Short label shown on the customer's M-Pesa prompt and statement.
    pub fn gateway_label(&self) -> String {
        let hex = self.match_id.simple().to_string().to_uppercase();
        let room = GATEWAY_LABEL_MAX - GATEWAY_LABEL_PREFIX.len();
        format!(
            "{}{}",
            GATEWAY_LABEL_PREFIX,
            hex.chars().take(room).collect::<String>()
        )
    }
}

impl fmt::Display for AccountReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.match_id)?;
        for id in &self.ticket_ids {
            write!(f, "{}{}", SEPARATOR, id)?;
        }
        Ok(())
    }
}

impl FromStr for AccountReference {
    type Err = AccountReferenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(AccountReferenceError::Empty);
        }

        let mut parts = trimmed.split(SEPARATOR);
        let match_id = parts
            .next()
            .ok_or(AccountReferenceError::Empty)
            .and_then(parse_id)?;
        let ticket_ids = parts.map(parse_id).collect::<Result<Vec<_>, _>>()?;

        if ticket_ids.is_empty() {
            return Err(AccountReferenceError::NoTickets);
        }

        Ok(Self {
            match_id,
            ticket_ids,
        })
    }
}

fn parse_id(raw: &str) -> Result<Uuid, AccountReferenceError> {
    Uuid::parse_str(raw).map_err(|_| AccountReferenceError::InvalidId(raw.to_string()))
}
