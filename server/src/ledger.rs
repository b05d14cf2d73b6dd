//! Inventory ledger: the unallocated-share counter of each lot.
//!
//! New holds take shares through [`Datastore::conditional_allocate`], which
//! applies a delta atomically and only while `0 <= unallocated <= total`
//! holds afterwards. Ending or resizing a reservation applies the same guarded
//! delta inside the datastore step that changes the reservation. Two buyers racing for the last shares are resolved here
//! and nowhere else: the first conditional write wins and the loser gets
//! [`ReservationError::InsufficientInventory`].

use hisse_core::datastore::{AllocationOutcome, Datastore};
use hisse_core::{Lot, LotId, ReservationError};
use hisse_runtime::metrics::LedgerMetrics;
use std::sync::Arc;

/// Conditional allocate over a [`Datastore`]
#[derive(Clone)]
pub struct Ledger {
    datastore: Arc<dyn Datastore>,
}

impl Ledger {
    /// Create a ledger over `datastore`
    #[must_use]
    pub fn new(datastore: Arc<dyn Datastore>) -> Self {
        Self { datastore }
    }

    /// Take `shares` out of the unallocated pool.
    ///
    /// # Errors
    ///
    /// - [`ReservationError::InsufficientInventory`] if fewer than `shares` are unallocated
    /// - [`ReservationError::LotNotFound`] for unknown lots
    /// - [`ReservationError::Datastore`] on storage failure
    #[tracing::instrument(skip(self), fields(lot_id = %lot_id))]
    pub async fn hold(&self, lot_id: LotId, shares: u32) -> Result<Lot, ReservationError> {
        match self.allocate(lot_id, -i64::from(shares)).await? {
            AllocationOutcome::Applied(lot) => {
                tracing::debug!(unallocated = lot.unallocated_shares, "Shares held");
                Ok(lot)
            },
            AllocationOutcome::Rejected { unallocated } => {
                tracing::info!(requested = shares, available = unallocated, "Hold rejected");
                Err(ReservationError::InsufficientInventory {
                    lot_id,
                    requested: shares,
                    available: unallocated,
                })
            },
            AllocationOutcome::UnknownLot => Err(ReservationError::LotNotFound(lot_id)),
        }
    }

    /// Return `shares` to the unallocated pool.
    ///
    /// A release that would push the counter past `total_shares` is refused
    /// by storage; that means the counter has drifted and is logged, not
    /// surfaced, since the reservation transition that triggered it already won.
    ///
    /// # Errors
    ///
    /// - [`ReservationError::LotNotFound`] for unknown lots
    /// - [`ReservationError::Datastore`] on storage failure
    #[tracing::instrument(skip(self), fields(lot_id = %lot_id))]
    pub async fn release(&self, lot_id: LotId, shares: u32) -> Result<Option<Lot>, ReservationError> {
        match self.allocate(lot_id, i64::from(shares)).await? {
            AllocationOutcome::Applied(lot) => {
                tracing::debug!(unallocated = lot.unallocated_shares, "Shares released");
                Ok(Some(lot))
            },
            AllocationOutcome::Rejected { unallocated } => {
                tracing::error!(
                    released = shares,
                    unallocated,
                    "Release would exceed lot total; counter left unchanged"
                );
                Ok(None)
            },
            AllocationOutcome::UnknownLot => Err(ReservationError::LotNotFound(lot_id)),
        }
    }

    async fn allocate(&self, lot_id: LotId, delta: i64) -> Result<AllocationOutcome, ReservationError> {
        let outcome = self
            .datastore
            .conditional_allocate(lot_id, delta)
            .await
            .inspect_err(|error| tracing::error!(%error, delta, "Conditional allocate failed"))?;

        LedgerMetrics::record_allocation(match outcome {
            AllocationOutcome::Applied(_) => "applied",
            AllocationOutcome::Rejected { .. } => "rejected",
            AllocationOutcome::UnknownLot => "unknown_lot",
        });
        Ok(outcome)
    }
}
