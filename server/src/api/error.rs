//! HTTP error responses.
//!
//! Domain errors map onto stable status codes and machine-readable `code`
//! strings so browser clients can tell the four business rejections apart.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use hisse_core::ReservationError;
use serde::Serialize;
use std::fmt;

/// Application error returned by handlers
#[derive(Debug)]
pub struct AppError {
    status: StatusCode,
    message: String,
    code: &'static str,
    details: Option<serde_json::Value>,
    /// Logged, never sent to the client
    source: Option<anyhow::Error>,
}

impl AppError {
    /// Create an error
    #[must_use]
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            code,
            details: None,
            source: None,
        }
    }

    /// Attach structured details for the client
    #[must_use]
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Attach the underlying cause for logging
    #[must_use]
    pub fn with_source(mut self, source: anyhow::Error) -> Self {
        self.source = Some(source);
        self
    }

    /// 400
    #[must_use]
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "BAD_REQUEST", message)
    }

    /// 404
    #[must_use]
    pub fn not_found(resource: impl fmt::Display, id: impl fmt::Display) -> Self {
        Self::new(
            StatusCode::NOT_FOUND,
            "NOT_FOUND",
            format!("{resource} with id {id} not found"),
        )
    }

    /// 422
    #[must_use]
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNPROCESSABLE_ENTITY, "INVALID_INPUT", message)
    }

    /// 500
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "INTERNAL_SERVER_ERROR",
            message,
        )
    }

    /// 503
    #[must_use]
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, "SERVICE_UNAVAILABLE", message)
    }

    /// HTTP status
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        self.status
    }

    /// Machine-readable code
    #[must_use]
    pub const fn code(&self) -> &'static str {
        self.code
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for AppError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

/// JSON error body
#[derive(Debug, Serialize)]
struct ErrorResponse {
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<serde_json::Value>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            match &self.source {
                Some(source) => tracing::error!(
                    status = %self.status,
                    code = self.code,
                    message = %self.message,
                    error = %source,
                    "Internal server error"
                ),
                None => tracing::error!(
                    status = %self.status,
                    code = self.code,
                    message = %self.message,
                    "Internal server error"
                ),
            }
        }

        let body = ErrorResponse {
            code: self.code,
            message: self.message,
            details: self.details,
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<ReservationError> for AppError {
    fn from(err: ReservationError) -> Self {
        match &err {
            ReservationError::InvalidInput(message) => Self::invalid_input(message.clone()),
            ReservationError::InsufficientInventory {
                lot_id,
                requested,
                available,
            } => Self::new(StatusCode::CONFLICT, "INSUFFICIENT_INVENTORY", err.to_string())
                .with_details(serde_json::json!({
                    "lot_id": lot_id,
                    "requested": requested,
                    "available": available,
                })),
            ReservationError::ReservationNotActive { status, .. } => {
                Self::new(StatusCode::GONE, "RESERVATION_NOT_ACTIVE", err.to_string())
                    .with_details(serde_json::json!({ "status": status }))
            },
            ReservationError::LotAtCapacity {
                lot_id,
                owned,
                total,
                ..
            } => Self::new(StatusCode::CONFLICT, "LOT_AT_CAPACITY", err.to_string())
                .with_details(serde_json::json!({
                    "lot_id": lot_id,
                    "owned": owned,
                    "total": total,
                })),
            ReservationError::LotNotFound(id) => Self::not_found("Lot", id),
            ReservationError::ReservationNotFound(id) => Self::not_found("Reservation", id),
            ReservationError::Datastore(inner) if inner.is_transient() => {
                Self::unavailable("Storage is temporarily unavailable")
                    .with_source(anyhow::Error::new(inner.clone()))
            },
            ReservationError::Datastore(inner) => Self::internal("An internal error occurred")
                .with_source(anyhow::Error::new(inner.clone())),
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        Self::internal("An internal error occurred").with_source(err)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)] // Test code

    use super::*;
    use hisse_core::{DatastoreError, LotId, ReservationStatus, TransactionId};

    #[test]
    fn display_includes_code() {
        let err = AppError::bad_request("Missing body");
        assert_eq!(err.to_string(), "[BAD_REQUEST] Missing body");
    }

    #[test]
    fn business_rejections_map_to_distinct_codes() {
        let lot_id = LotId::new();
        let cases = [
            (
                ReservationError::InvalidInput("share count".into()),
                StatusCode::UNPROCESSABLE_ENTITY,
                "INVALID_INPUT",
            ),
            (
                ReservationError::InsufficientInventory {
                    lot_id,
                    requested: 5,
                    available: 4,
                },
                StatusCode::CONFLICT,
                "INSUFFICIENT_INVENTORY",
            ),
            (
                ReservationError::ReservationNotActive {
                    transaction_id: TransactionId::generate(),
                    status: ReservationStatus::Expired,
                },
                StatusCode::GONE,
                "RESERVATION_NOT_ACTIVE",
            ),
            (
                ReservationError::LotAtCapacity {
                    lot_id,
                    owned: 6,
                    requested: 2,
                    total: 7,
                },
                StatusCode::CONFLICT,
                "LOT_AT_CAPACITY",
            ),
            (
                ReservationError::LotNotFound(lot_id),
                StatusCode::NOT_FOUND,
                "NOT_FOUND",
            ),
        ];

        for (err, status, code) in cases {
            let app: AppError = err.into();
            assert_eq!(app.status(), status);
            assert_eq!(app.code(), code);
        }
    }

    #[test]
    fn transient_storage_failures_are_unavailable() {
        let app: AppError =
            ReservationError::Datastore(DatastoreError::Connection("reset".into())).into();
        assert_eq!(app.status(), StatusCode::SERVICE_UNAVAILABLE);

        let app: AppError =
            ReservationError::Datastore(DatastoreError::Query("syntax".into())).into();
        assert_eq!(app.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn insufficient_inventory_carries_the_available_count() {
        let app: AppError = ReservationError::InsufficientInventory {
            lot_id: LotId::new(),
            requested: 5,
            available: 4,
        }
        .into();
        assert_eq!(app.details.as_ref().unwrap()["available"], 4);
    }
}
