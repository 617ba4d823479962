use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use super::SeatType;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Match {
    pub id: Uuid,
    pub home_team: String,
    pub away_team: String,
    pub venue: String,
    pub match_date: DateTime<Utc>,
    pub ticket_price: Decimal,
    pub vip_ticket_price: Option<Decimal>,
    pub total_seats: i32,
    pub available_seats: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Match {
    /// Price of a single seat of the given type, if this match sells it.
    pub fn price_for(&self, seat_type: SeatType) -> Option<Decimal> {
        match seat_type {
            SeatType::Regular => Some(self.ticket_price),
            SeatType::Vip => self.vip_ticket_price,
        }
    }

    pub fn sold_seats(&self) -> i32 {
        self.total_seats - self.available_seats
    }

    pub fn title(&self) -> String {
        format!("{} vs {}", self.home_team, self.away_team)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMatch {
    pub home_team: String,
    pub away_team: String,
    pub venue: String,
    pub match_date: DateTime<Utc>,
    pub ticket_price: Decimal,
    pub vip_ticket_price: Option<Decimal>,
    pub total_seats: i32,
}

/// Partial update of a match; absent fields keep their stored value.
/// `vipTicketPrice: null` stops VIP sales, an absent key leaves them as is.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchUpdate {
    pub home_team: Option<String>,
    pub away_team: Option<String>,
    pub venue: Option<String>,
    pub match_date: Option<DateTime<Utc>>,
    pub ticket_price: Option<Decimal>,
    #[serde(default, deserialize_with = "present")]
    pub vip_ticket_price: Option<Option<Decimal>>,
    pub total_seats: Option<i32>,
}

/// Distinguishes an explicit `null` from a missing key.
fn present<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

impl MatchUpdate {
    /// Applies the update to `current`, keeping `available_seats` consistent
    /// with any change to `total_seats`.
    pub fn apply_to(&self, current: &Match) -> Result<Match, String> {
        let mut next = current.clone();
        if let Some(home) = &self.home_team {
            next.home_team = home.clone();
        }
        if let Some(away) = &self.away_team {
            next.away_team = away.clone();
        }
        if let Some(venue) = &self.venue {
            next.venue = venue.clone();
        }
        if let Some(date) = self.match_date {
            next.match_date = date;
        }
        if let Some(price) = self.ticket_price {
            next.ticket_price = price;
        }
        if let Some(vip) = self.vip_ticket_price {
            next.vip_ticket_price = vip;
        }
        if let Some(total) = self.total_seats {
            let sold = current.sold_seats();
            if total < sold {
                return Err(format!(
                    "totalSeats cannot drop below the {} seat(s) already sold",
                    sold
                ));
            }
            next.total_seats = total;
            next.available_seats = total - sold;
        }
        Ok(next)
    }
}
