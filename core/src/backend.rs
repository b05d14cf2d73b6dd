//! The reservation API as seen by clients.
//!
//! [`ReservationBackend`] is the seam between the checkout flow controller and
//! whatever serves reservations: the in-process service in `hisse-server`, or
//! an HTTP client talking to it.

use crate::error::ReservationError;
use crate::types::{
    HolderDetails, Lot, LotId, OwnershipRecord, Reservation, ReservationLoad,
    ReservationStatusView, TransactionId,
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;

/// Boxed future returned by backend calls
pub type BackendFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<T, ReservationError>> + Send + 'a>>;

/// What a successful finalize hands back
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalizeReceipt {
    /// The reservation, now `completed`
    pub reservation: Reservation,
    /// One record per holder
    pub records: Vec<OwnershipRecord>,
}

/// Client-facing reservation operations.
///
/// Termination calls (`cancel_reservation`, `mark_timed_out`) are idempotent
/// and return the existing record when the reservation is already terminal.
pub trait ReservationBackend: Send + Sync {
    /// Current inventory.
    ///
    /// # Errors
    ///
    /// Storage failures.
    fn list_lots(&self) -> BackendFuture<'_, Vec<Lot>>;

    /// Active holds, used to render "being purchased" indicators.
    ///
    /// # Errors
    ///
    /// Storage failures.
    fn list_active_reservations(&self) -> BackendFuture<'_, Vec<Reservation>>;

    /// Take a hold on `share_count` shares of `lot_id`.
    ///
    /// # Errors
    ///
    /// `InvalidInput`, `InsufficientInventory`, `LotNotFound`.
    fn create_reservation(
        &self,
        transaction_id: TransactionId,
        lot_id: LotId,
        share_count: u32,
    ) -> BackendFuture<'_, Reservation>;

    /// Grow or shrink an active hold.
    ///
    /// # Errors
    ///
    /// `InvalidInput`, `InsufficientInventory` (hold unchanged), `ReservationNotActive`.
    fn update_share_count(
        &self,
        transaction_id: TransactionId,
        new_count: u32,
    ) -> BackendFuture<'_, Reservation>;

    /// Release a hold as `canceled`.
    ///
    /// # Errors
    ///
    /// `ReservationNotFound` for unknown tokens.
    fn cancel_reservation(&self, transaction_id: TransactionId) -> BackendFuture<'_, Reservation>;

    /// Release a hold as `timed_out`.
    ///
    /// # Errors
    ///
    /// `ReservationNotFound` for unknown tokens.
    fn mark_timed_out(&self, transaction_id: TransactionId) -> BackendFuture<'_, Reservation>;

    /// Status and remaining time of a hold.
    ///
    /// # Errors
    ///
    /// `ReservationNotFound` for unknown tokens.
    fn reservation_status(
        &self,
        transaction_id: TransactionId,
    ) -> BackendFuture<'_, ReservationStatusView>;

    /// Convert an active hold into ownership records.
    ///
    /// # Errors
    ///
    /// `InvalidInput`, `ReservationNotActive`, `LotAtCapacity`.
    fn finalize(
        &self,
        transaction_id: TransactionId,
        holders: Vec<HolderDetails>,
    ) -> BackendFuture<'_, FinalizeReceipt>;

    /// Shares held by active reservations on a lot.
    ///
    /// # Errors
    ///
    /// Storage failures.
    fn active_load(&self, lot_id: LotId) -> BackendFuture<'_, ReservationLoad>;
}
