//! Lot read endpoints:
//! - GET /api/lots - All lots with their "being purchased" counts
//! - GET /api/lots/:id - One lot

use super::error::AppError;
use crate::server::state::AppState;
use axum::{
    Json,
    extract::{Path, State},
};
use hisse_core::{Lot, LotId};
use serde::Serialize;
use uuid::Uuid;

/// A lot plus the shares currently held by open checkouts
#[derive(Debug, Serialize)]
pub struct LotResponse {
    /// The lot row
    #[serde(flatten)]
    pub lot: Lot,
    /// Shares held by active reservations
    pub being_purchased: u32,
}

/// List every lot in sequence order.
///
/// # Errors
///
/// 503/500 on storage failures.
pub async fn list_lots(State(state): State<AppState>) -> Result<Json<Vec<LotResponse>>, AppError> {
    let lots = state.service.lots().await?;
    let loads = state.service.active_loads().await?;

    let body = lots
        .into_iter()
        .map(|lot| {
            let being_purchased = loads
                .iter()
                .find(|load| load.lot_id == lot.id)
                .map_or(0, |load| load.active_share_count);
            LotResponse {
                lot,
                being_purchased,
            }
        })
        .collect();
    Ok(Json(body))
}

/// Fetch one lot.
///
/// # Errors
///
/// 404 for unknown ids.
pub async fn get_lot(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<LotResponse>, AppError> {
    let lot_id = LotId::from_uuid(id);
    let lot = state.service.lot(lot_id).await?;
    let being_purchased = state
        .service
        .reservations()
        .active_load(lot_id)
        .await?
        .active_share_count;
    Ok(Json(LotResponse {
        lot,
        being_purchased,
    }))
}
