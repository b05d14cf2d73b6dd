//! Reservation endpoints.
//!
//! - POST /api/reservations - Take a hold
//! - GET /api/reservations/active-load - Shares held per lot
//! - GET /api/reservations/:txn - Status and seconds remaining
//! - PATCH /api/reservations/:txn - Resize a hold
//! - POST /api/reservations/:txn/cancel - Release as canceled (idempotent)
//! - POST /api/reservations/:txn/timeout - Release as timed out (idempotent)
//! - POST /api/reservations/:txn/finalize - Commit ownership
//!
//! `:txn` is the client's 16-character transaction token. Cancel is also the
//! target of page-unload beacons, so it takes no body.

use super::error::AppError;
use crate::server::state::AppState;
use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use hisse_core::backend::{FinalizeReceipt, ReservationBackend};
use hisse_core::{
    HolderDetails, LotId, Reservation, ReservationLoad, ReservationStatusView, TransactionId,
};
use serde::Deserialize;
use uuid::Uuid;

/// Body of POST /api/reservations
#[derive(Debug, Deserialize)]
pub struct CreateReservationRequest {
    /// Client-generated token
    pub transaction_id: String,
    /// Lot to hold shares of
    pub lot_id: Uuid,
    /// Shares wanted
    pub share_count: u32,
}

/// Body of PATCH /api/reservations/:txn
#[derive(Debug, Deserialize)]
pub struct UpdateShareCountRequest {
    /// New size of the hold
    pub share_count: u32,
}

/// Body of POST /api/reservations/:txn/finalize
#[derive(Debug, Deserialize)]
pub struct FinalizeRequest {
    /// One entry per held share
    pub holders: Vec<HolderDetails>,
}

fn token(raw: &str) -> Result<TransactionId, AppError> {
    Ok(TransactionId::parse(raw)?)
}

/// Take a hold.
///
/// ```bash
/// curl -X POST http://localhost:8080/api/reservations \
///   -H "Content-Type: application/json" \
///   -d '{"transaction_id":"Xy7Qp2Lm9Rt4Vw1Z","lot_id":"7b0a3f4e-...","share_count":3}'
/// ```
///
/// # Errors
///
/// 422 `INVALID_INPUT`, 409 `INSUFFICIENT_INVENTORY`, 404 unknown lot.
pub async fn create_reservation(
    State(state): State<AppState>,
    Json(request): Json<CreateReservationRequest>,
) -> Result<(StatusCode, Json<Reservation>), AppError> {
    let transaction_id = token(&request.transaction_id)?;
    let reservation = state
        .service
        .create_reservation(
            transaction_id,
            LotId::from_uuid(request.lot_id),
            request.share_count,
        )
        .await?;
    Ok((StatusCode::CREATED, Json(reservation)))
}

/// Status of a hold, expiring it first if it lapsed.
///
/// # Errors
///
/// 404 for unknown tokens.
pub async fn get_reservation_status(
    State(state): State<AppState>,
    Path(txn): Path<String>,
) -> Result<Json<ReservationStatusView>, AppError> {
    let view = state.service.reservation_status(token(&txn)?).await?;
    Ok(Json(view))
}

/// Resize a hold. The expiry does not move.
///
/// # Errors
///
/// 409 `INSUFFICIENT_INVENTORY` (hold unchanged), 410 `RESERVATION_NOT_ACTIVE`.
pub async fn update_share_count(
    State(state): State<AppState>,
    Path(txn): Path<String>,
    Json(request): Json<UpdateShareCountRequest>,
) -> Result<Json<Reservation>, AppError> {
    let reservation = state
        .service
        .update_share_count(token(&txn)?, request.share_count)
        .await?;
    Ok(Json(reservation))
}

/// Release a hold as canceled.
///
/// # Errors
///
/// 404 for unknown tokens.
pub async fn cancel_reservation(
    State(state): State<AppState>,
    Path(txn): Path<String>,
) -> Result<Json<Reservation>, AppError> {
    let reservation = state.service.cancel_reservation(token(&txn)?).await?;
    Ok(Json(reservation))
}

/// Release a hold as timed out.
///
/// # Errors
///
/// 404 for unknown tokens.
pub async fn mark_timed_out(
    State(state): State<AppState>,
    Path(txn): Path<String>,
) -> Result<Json<Reservation>, AppError> {
    let reservation = state.service.mark_timed_out(token(&txn)?).await?;
    Ok(Json(reservation))
}

/// Commit a hold into ownership records.
///
/// # Errors
///
/// 422 `INVALID_INPUT`, 410 `RESERVATION_NOT_ACTIVE`, 409 `LOT_AT_CAPACITY`.
pub async fn finalize(
    State(state): State<AppState>,
    Path(txn): Path<String>,
    Json(request): Json<FinalizeRequest>,
) -> Result<(StatusCode, Json<FinalizeReceipt>), AppError> {
    let receipt = state
        .service
        .finalize(token(&txn)?, request.holders)
        .await?;
    Ok((StatusCode::CREATED, Json(receipt)))
}

/// Shares held by active reservations, per lot.
///
/// # Errors
///
/// 503/500 on storage failures.
pub async fn active_load(
    State(state): State<AppState>,
) -> Result<Json<Vec<ReservationLoad>>, AppError> {
    Ok(Json(state.service.active_loads().await?))
}
