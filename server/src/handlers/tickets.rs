use axum::extract::{Path, Query, State};
use axum::response::Response;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::auth::{AdminCaller, MaybeCaller};
use crate::models::{Match, Ticket, TicketStatus};
use crate::state::AppState;
use crate::store::StoreError;
use crate::utils::error::AppError;
use crate::utils::response::success;

#[derive(Debug, Deserialize)]
pub struct TicketAccess {
    secret: Option<String>,
}

#[derive(Serialize)]
struct TicketView {
    ticket: Ticket,
    #[serde(rename = "match")]
    football_match: Match,
}

/// Visible to the owner, to admins, and to anyone holding the guest secret.
/// Everyone else is told the ticket does not exist.
pub async fn get_ticket(
    State(state): State<AppState>,
    MaybeCaller(caller): MaybeCaller,
    Path(id): Path<Uuid>,
    Query(access): Query<TicketAccess>,
) -> Result<Response, AppError> {
    let hidden = || AppError::NotFound(format!("Ticket '{}' was not found", id));
    let ticket = match state.store.get_ticket(id).await {
        Ok(ticket) => ticket,
        Err(StoreError::TicketNotFound(_)) => return Err(hidden()),
        Err(e) => return Err(e.into()),
    };

    let by_caller = caller
        .as_ref()
        .is_some_and(|user| user.is_admin() || ticket.is_owned_by(&user.id));
    let by_secret = access
        .secret
        .as_deref()
        .is_some_and(|secret| ticket.guest_secret_matches(secret));
    if !by_caller && !by_secret {
        return Err(hidden());
    }

    let football_match = state.store.get_match(ticket.match_id).await?;
    Ok(success(
        TicketView {
            ticket,
            football_match,
        },
        "Ticket retrieved",
    ))
}

pub async fn redeem_ticket(
    State(state): State<AppState>,
    AdminCaller(admin): AdminCaller,
    Path(id): Path<Uuid>,
) -> Result<Response, AppError> {
    let ticket = state
        .store
        .transition_ticket(id, TicketStatus::Active, TicketStatus::Used)
        .await?;
    info!(ticket_id = %id, admin = %admin.id, "Ticket redeemed at the gate");
    Ok(success(ticket, "Ticket redeemed"))
}

pub async fn cancel_ticket(
    State(state): State<AppState>,
    AdminCaller(admin): AdminCaller,
    Path(id): Path<Uuid>,
) -> Result<Response, AppError> {
    let ticket = state
        .store
        .transition_ticket(id, TicketStatus::Active, TicketStatus::Cancelled)
        .await?;
    info!(ticket_id = %id, admin = %admin.id, "Ticket cancelled, seat released");
    Ok(success(ticket, "Ticket cancelled"))
}
