use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::response::Response;
use axum::Json;
use rust_decimal::Decimal;
use serde::Serialize;
use uuid::Uuid;

use crate::auth::AdminCaller;
use crate::handlers::json_body;
use crate::models::{Match, MatchUpdate, NewMatch, Payment, Ticket};
use crate::state::AppState;
use crate::utils::error::AppError;
use crate::utils::response::{created, empty_success, success};

const MAX_TEXT_LEN: usize = 120;

fn check_text(field: &str, value: &str) -> Result<(), AppError> {
    let trimmed = value.trim();
    if trimmed.is_empty() || trimmed.len() > MAX_TEXT_LEN {
        return Err(AppError::ValidationError(format!(
            "{} must be between 1 and {} characters",
            field, MAX_TEXT_LEN
        )));
    }
    Ok(())
}

fn check_price(field: &str, value: Decimal) -> Result<(), AppError> {
    if value <= Decimal::ZERO {
        return Err(AppError::ValidationError(format!(
            "{} must be greater than zero",
            field
        )));
    }
    Ok(())
}

fn check_seats(value: i32) -> Result<(), AppError> {
    if value <= 0 {
        return Err(AppError::ValidationError(
            "totalSeats must be greater than zero".to_string(),
        ));
    }
    Ok(())
}

fn validate_new_match(new: &NewMatch) -> Result<(), AppError> {
    check_text("homeTeam", &new.home_team)?;
    check_text("awayTeam", &new.away_team)?;
    check_text("venue", &new.venue)?;
    check_price("ticketPrice", new.ticket_price)?;
    if let Some(vip) = new.vip_ticket_price {
        check_price("vipTicketPrice", vip)?;
    }
    check_seats(new.total_seats)
}

fn validate_update(update: &MatchUpdate) -> Result<(), AppError> {
    if let Some(v) = &update.home_team {
        check_text("homeTeam", v)?;
    }
    if let Some(v) = &update.away_team {
        check_text("awayTeam", v)?;
    }
    if let Some(v) = &update.venue {
        check_text("venue", v)?;
    }
    if let Some(v) = update.ticket_price {
        check_price("ticketPrice", v)?;
    }
    if let Some(Some(v)) = update.vip_ticket_price {
        check_price("vipTicketPrice", v)?;
    }
    if let Some(v) = update.total_seats {
        check_seats(v)?;
    }
    Ok(())
}

pub async fn list_matches(State(state): State<AppState>) -> Result<Response, AppError> {
    let matches: Vec<Match> = state.store.list_matches().await?;
    Ok(success(matches, "Matches retrieved"))
}

pub async fn get_match(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Response, AppError> {
    let m = state.store.get_match(id).await?;
    Ok(success(m, "Match retrieved"))
}

pub async fn create_match(
    State(state): State<AppState>,
    AdminCaller(admin): AdminCaller,
    payload: Result<Json<NewMatch>, JsonRejection>,
) -> Result<Response, AppError> {
    let mut new = json_body(payload)?;
    validate_new_match(&new)?;
    new.home_team = new.home_team.trim().to_string();
    new.away_team = new.away_team.trim().to_string();
    new.venue = new.venue.trim().to_string();

    let m = state.store.create_match(new).await?;
    tracing::info!(match_id = %m.id, admin = %admin.id, "Match created");
    Ok(created(m, "Match created"))
}

pub async fn update_match(
    State(state): State<AppState>,
    AdminCaller(admin): AdminCaller,
    Path(id): Path<Uuid>,
    payload: Result<Json<MatchUpdate>, JsonRejection>,
) -> Result<Response, AppError> {
    let update = json_body(payload)?;
    validate_update(&update)?;

    let m = state.store.update_match(id, &update).await?;
    tracing::info!(match_id = %m.id, admin = %admin.id, "Match updated");
    Ok(success(m, "Match updated"))
}

pub async fn delete_match(
    State(state): State<AppState>,
    AdminCaller(admin): AdminCaller,
    Path(id): Path<Uuid>,
) -> Result<Response, AppError> {
    state.store.delete_match(id).await?;
    tracing::info!(match_id = %id, admin = %admin.id, "Match deleted");
    Ok(empty_success("Match deleted"))
}

#[derive(Serialize)]
struct MatchSales {
    #[serde(rename = "match")]
    football_match: Match,
    tickets: Vec<Ticket>,
    payments: Vec<Payment>,
}

pub async fn match_tickets(
    State(state): State<AppState>,
    AdminCaller(_): AdminCaller,
    Path(id): Path<Uuid>,
) -> Result<Response, AppError> {
    let football_match = state.store.get_match(id).await?;
    let tickets = state.store.tickets_for_match(id).await?;
    let payments = state.store.payments_for_match(id).await?;
    Ok(success(
        MatchSales {
            football_match,
            tickets,
            payments,
        },
        "Match sales retrieved",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn new_match() -> NewMatch {
        NewMatch {
            home_team: "Gor Mahia".to_string(),
            away_team: "AFC Leopards".to_string(),
            venue: "Nyayo Stadium".to_string(),
            match_date: Utc::now(),
            ticket_price: Decimal::new(500, 0),
            vip_ticket_price: Some(Decimal::new(1500, 0)),
            total_seats: 100,
        }
    }

    #[test]
    fn test_valid_match_passes() {
        assert!(validate_new_match(&new_match()).is_ok());
    }

    #[test]
    fn test_blank_team_and_free_tickets_are_rejected() {
        let mut blank = new_match();
        blank.home_team = "   ".to_string();
        assert!(validate_new_match(&blank).is_err());

        let mut free = new_match();
        free.ticket_price = Decimal::ZERO;
        assert!(validate_new_match(&free).is_err());

        let update = MatchUpdate {
            total_seats: Some(0),
            ..Default::default()
        };
        assert!(validate_update(&update).is_err());
    }
}
