//! Error types for reservation operations and the storage collaborator.

use crate::types::{LotId, ReservationStatus, TransactionId};
use thiserror::Error;

/// Errors returned by ledger, reservation and finalize operations.
///
/// The four business rejections (`InvalidInput`, `InsufficientInventory`,
/// `ReservationNotActive`, `LotAtCapacity`) are distinguishable so callers can
/// react to each one differently.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ReservationError {
    /// Out-of-range share count, malformed token, missing holder field, ...
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// The conditional allocate found fewer unallocated shares than requested
    #[error("Insufficient inventory on lot {lot_id}: requested {requested}, available {available}")]
    InsufficientInventory {
        /// Lot
        lot_id: LotId,
        /// Shares requested
        requested: u32,
        /// Shares unallocated at the time of the attempt
        available: u32,
    },

    /// The reservation has already left `active`
    #[error("Reservation {transaction_id} is not active (status: {status})")]
    ReservationNotActive {
        /// Transaction
        transaction_id: TransactionId,
        /// Status found
        status: ReservationStatus,
    },

    /// Committing would push the lot's ownership count past its total
    #[error("Lot {lot_id} at capacity: {owned} owned + {requested} requested > {total}")]
    LotAtCapacity {
        /// Lot
        lot_id: LotId,
        /// Ownership records already present
        owned: u32,
        /// Records in this commit
        requested: u32,
        /// Lot total
        total: u32,
    },

    /// No lot with this id
    #[error("Lot not found: {0}")]
    LotNotFound(LotId),

    /// No reservation with this token
    #[error("Reservation not found: {0}")]
    ReservationNotFound(TransactionId),

    /// Storage failure
    #[error(transparent)]
    Datastore(#[from] DatastoreError),
}

impl ReservationError {
    /// Short machine-readable label, used for metrics and API error codes
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "invalid_input",
            Self::InsufficientInventory { .. } => "insufficient_inventory",
            Self::ReservationNotActive { .. } => "reservation_not_active",
            Self::LotAtCapacity { .. } => "lot_at_capacity",
            Self::LotNotFound(_) => "lot_not_found",
            Self::ReservationNotFound(_) => "reservation_not_found",
            Self::Datastore(_) => "datastore",
        }
    }

    /// Transport-level failure worth retrying for idempotent reads
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::Datastore(err) => err.is_transient(),
            _ => false,
        }
    }
}

/// Errors raised by a [`Datastore`](crate::datastore::Datastore) implementation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DatastoreError {
    /// Could not reach the database
    #[error("Connection error: {0}")]
    Connection(String),

    /// Statement failed
    #[error("Query error: {0}")]
    Query(String),

    /// A uniqueness or foreign-key constraint was violated
    #[error("Constraint violation: {0}")]
    Conflict(String),

    /// Stored data could not be mapped to domain types
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The change subscription ended
    #[error("Subscription closed: {0}")]
    SubscriptionClosed(String),
}

impl DatastoreError {
    /// Whether retrying the same read may succeed
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::SubscriptionClosed(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_connection_failures_are_transient() {
        assert!(DatastoreError::Connection("reset".into()).is_transient());
        assert!(!DatastoreError::Query("syntax".into()).is_transient());
        assert!(!DatastoreError::Conflict("dup".into()).is_transient());
    }

    #[test]
    fn datastore_errors_convert() {
        let err: ReservationError = DatastoreError::Query("boom".into()).into();
        assert_eq!(err.kind(), "datastore");
        assert_eq!(err.to_string(), "Query error: boom");
    }
}
