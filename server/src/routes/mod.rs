use axum::http::header::CACHE_CONTROL;
use axum::http::HeaderValue;
use axum::routing::{get, post};
use axum::Router;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

use crate::config::{create_cors_layer, create_security_headers_layer};
use crate::handlers::{health_check, matches, mpesa, sms, tickets, users};
use crate::state::AppState;

fn payment_routes() -> Router<AppState> {
    Router::new()
        .route("/bookings", post(mpesa::create_booking))
        .route("/mpesa/stk-push", post(mpesa::create_booking))
        .route("/mpesa/callback", post(mpesa::stk_callback))
        .route("/mpesa/check-payment", get(mpesa::check_payment))
        .layer(SetResponseHeaderLayer::overriding(
            CACHE_CONTROL,
            HeaderValue::from_static("no-store"),
        ))
}

fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health_check))
        .route(
            "/matches",
            get(matches::list_matches).post(matches::create_match),
        )
        .route(
            "/matches/:id",
            get(matches::get_match)
                .put(matches::update_match)
                .delete(matches::delete_match),
        )
        .route("/matches/:id/tickets", get(matches::match_tickets))
        .route("/tickets/:id", get(tickets::get_ticket))
        .route("/tickets/:id/redeem", post(tickets::redeem_ticket))
        .route("/tickets/:id/cancel", post(tickets::cancel_ticket))
        .route("/users/me", get(users::me))
        .route("/users/me/tickets", get(users::my_tickets))
        .route("/sms/send", post(sms::send_sms))
        .merge(payment_routes())
}

pub fn create_routes(state: AppState) -> Router {
    let config = state.config.clone();
    Router::new()
        .nest("/api", api_routes())
        .layer(TraceLayer::new_for_http())
        .layer(create_security_headers_layer(&config))
        .layer(create_cors_layer(&config))
        .with_state(state)
}
