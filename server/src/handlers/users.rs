use axum::extract::State;
use axum::response::Response;

use crate::auth::Caller;
use crate::state::AppState;
use crate::utils::error::AppError;
use crate::utils::response::success;

pub async fn me(Caller(user): Caller) -> Response {
    success(user, "Profile retrieved")
}

pub async fn my_tickets(
    State(state): State<AppState>,
    Caller(user): Caller,
) -> Result<Response, AppError> {
    let tickets = state.store.tickets_for_user(&user.id).await?;
    Ok(success(tickets, "Tickets retrieved"))
}
