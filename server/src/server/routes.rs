//! Router configuration.

use super::health::{health_check, metrics, readiness_check};
use super::state::AppState;
use crate::api::{lots, reservations, websocket};
use axum::{
    Router,
    routing::{get, post},
};

/// Build the complete router.
///
/// Health, readiness and metrics sit at the root; everything else is nested
/// under `/api`.
pub fn build_router(state: AppState) -> Router {
    let api_routes = Router::new()
        // Inventory
        .route("/lots", get(lots::list_lots))
        .route("/lots/:id", get(lots::get_lot))
        // Reservations
        .route("/reservations", post(reservations::create_reservation))
        .route("/reservations/active-load", get(reservations::active_load))
        .route(
            "/reservations/:txn",
            get(reservations::get_reservation_status).patch(reservations::update_share_count),
        )
        .route("/reservations/:txn/cancel", post(reservations::cancel_reservation))
        .route("/reservations/:txn/timeout", post(reservations::mark_timed_out))
        .route("/reservations/:txn/finalize", post(reservations::finalize))
        // Change feed
        .route("/ws/changes", get(websocket::change_stream));

    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/metrics", get(metrics))
        .nest("/api", api_routes)
        .with_state(state)
}
