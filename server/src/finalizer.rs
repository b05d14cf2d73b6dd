//! Allocation finalizer: turns an active hold into ownership records.
//!
//! The shares were already taken out of the unallocated pool when the hold
//! was created, so finalizing never touches the ledger counter. It inserts
//! one record per holder and completes the reservation in a single storage
//! transaction, guarded by the reservation still being `active` and by the
//! lot's ownership count staying within its total.

use crate::reservations::{ReservationStore, ensure_active};
use hisse_core::backend::FinalizeReceipt;
use hisse_core::datastore::{CommitOutcome, Datastore};
use hisse_core::environment::Clock;
use hisse_core::{HolderDetails, OwnershipRecord, ReservationError, TransactionId};
use hisse_runtime::metrics::ReservationMetrics;
use std::sync::Arc;

/// Commits holds into ownership records
#[derive(Clone)]
pub struct AllocationFinalizer {
    datastore: Arc<dyn Datastore>,
    reservations: ReservationStore,
    clock: Arc<dyn Clock>,
    default_delivery_fee: i64,
}

impl AllocationFinalizer {
    /// Create a finalizer. `reservations` is used to read holds with lazy expiry.
    #[must_use]
    pub fn new(
        datastore: Arc<dyn Datastore>,
        reservations: ReservationStore,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            datastore,
            reservations,
            clock,
            default_delivery_fee: 0,
        }
    }

    /// Fee charged to delivering holders that do not name one
    #[must_use]
    pub const fn with_default_delivery_fee(mut self, fee: i64) -> Self {
        self.default_delivery_fee = fee;
        self
    }

    /// Convert the hold `transaction_id` into one ownership record per holder.
    ///
    /// # Errors
    ///
    /// - [`ReservationError::ReservationNotActive`]: the hold ended (including by lapsing); nothing is written
    /// - [`ReservationError::InvalidInput`]: holder count differs from the share count,
    ///   more than one purchaser, blank contact fields or bad amounts
    /// - [`ReservationError::LotAtCapacity`]: the lot would exceed its total ownership
    /// - [`ReservationError::ReservationNotFound`]: unknown token
    #[tracing::instrument(skip(self, holders), fields(transaction_id = %transaction_id, holders = holders.len()))]
    pub async fn finalize(
        &self,
        transaction_id: &TransactionId,
        holders: Vec<HolderDetails>,
    ) -> Result<FinalizeReceipt, ReservationError> {
        let result = self.try_finalize(transaction_id, holders).await;
        if let Err(err) = &result {
            tracing::info!(error = %err, "Finalize rejected");
            ReservationMetrics::record_rejected(err.kind());
        }
        result
    }

    async fn try_finalize(
        &self,
        transaction_id: &TransactionId,
        mut holders: Vec<HolderDetails>,
    ) -> Result<FinalizeReceipt, ReservationError> {
        let reservation = self.reservations.get(transaction_id).await?;
        ensure_active(&reservation)?;

        if u32::try_from(holders.len()).ok() != Some(reservation.share_count) {
            return Err(ReservationError::InvalidInput(format!(
                "expected {} holders, got {}",
                reservation.share_count,
                holders.len()
            )));
        }
        assign_purchaser(&mut holders)?;

        let lot = self
            .datastore
            .get_lot(reservation.lot_id)
            .await?
            .ok_or(ReservationError::LotNotFound(reservation.lot_id))?;

        let now = self.clock.now();
        let records = holders
            .iter()
            .map(|holder| {
                OwnershipRecord::for_holder(holder, &lot, transaction_id, self.default_delivery_fee, now)
            })
            .collect::<Result<Vec<_>, _>>()?;
        let requested = reservation.share_count;

        match self
            .datastore
            .commit_ownership(transaction_id, records.clone())
            .await?
        {
            CommitOutcome::Committed(completed) => {
                ReservationMetrics::record_terminated(completed.status.as_str());
                ReservationMetrics::record_ownership(records.len());
                tracing::info!(lot_id = %lot.id, records = records.len(), "Reservation finalized");
                Ok(FinalizeReceipt {
                    reservation: completed,
                    records,
                })
            },
            CommitOutcome::AtCapacity { owned, total } => Err(ReservationError::LotAtCapacity {
                lot_id: lot.id,
                owned,
                requested,
                total,
            }),
            CommitOutcome::NotActive(Some(current)) => Err(ReservationError::ReservationNotActive {
                transaction_id: transaction_id.clone(),
                status: current.status,
            }),
            CommitOutcome::NotActive(None) => {
                Err(ReservationError::ReservationNotFound(transaction_id.clone()))
            },
        }
    }
}

/// Make exactly one holder the purchaser of record: the flagged one, or the
/// first holder when none is flagged.
///
/// # Errors
///
/// [`ReservationError::InvalidInput`] when more than one holder is flagged or
/// the list is empty.
pub fn assign_purchaser(holders: &mut [HolderDetails]) -> Result<(), ReservationError> {
    match holders.iter().filter(|h| h.is_purchaser).count() {
        0 => {
            let first = holders.first_mut().ok_or_else(|| {
                ReservationError::InvalidInput("at least one holder is required".to_string())
            })?;
            first.is_purchaser = true;
            Ok(())
        },
        1 => Ok(()),
        n => Err(ReservationError::InvalidInput(format!(
            "exactly one purchaser allowed, {n} flagged"
        ))),
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)] // Test code

    use super::*;
    use hisse_core::{LotId, ReservationStatus};
    use hisse_runtime::RetryPolicy;
    use hisse_testing::fixtures::holders;
    use hisse_testing::{InMemoryDatastore, ManualClock, test_time};

    struct Fixture {
        clock: ManualClock,
        datastore: Arc<InMemoryDatastore>,
        store: ReservationStore,
        finalizer: AllocationFinalizer,
        lot: LotId,
    }

    fn fixture() -> Fixture {
        let clock = ManualClock::at(test_time());
        let datastore = Arc::new(InMemoryDatastore::new(Arc::new(clock.clone())));
        let lot = datastore.seed_lot(1, 10_000).id;
        let store = ReservationStore::new(
            datastore.clone(),
            Arc::new(clock.clone()),
            chrono::Duration::minutes(10),
        )
        .with_read_retry(RetryPolicy::none());
        let finalizer =
            AllocationFinalizer::new(datastore.clone(), store.clone(), Arc::new(clock.clone()))
                .with_default_delivery_fee(500);
        Fixture {
            clock,
            datastore,
            store,
            finalizer,
            lot,
        }
    }

    #[tokio::test]
    async fn finalize_creates_one_record_per_share() {
        let f = fixture();
        let txn = TransactionId::generate();
        f.store.create(txn.clone(), f.lot, 3).await.unwrap();

        let receipt = f.finalizer.finalize(&txn, holders(3)).await.unwrap();

        assert_eq!(receipt.reservation.status, ReservationStatus::Completed);
        assert_eq!(receipt.records.len(), 3);
        assert_eq!(receipt.records.iter().filter(|r| r.is_purchaser).count(), 1);
        assert_eq!(f.datastore.ownership_count(f.lot), 3);
        assert_eq!(f.datastore.lot(f.lot).unwrap().unallocated_shares, 4);
    }

    #[tokio::test]
    async fn wrong_holder_count_is_invalid() {
        let f = fixture();
        let txn = TransactionId::generate();
        f.store.create(txn.clone(), f.lot, 3).await.unwrap();

        let err = f.finalizer.finalize(&txn, holders(2)).await.unwrap_err();
        assert!(matches!(err, ReservationError::InvalidInput(_)));
        assert_eq!(f.datastore.ownership_count(f.lot), 0);
    }

    #[tokio::test]
    async fn finalize_after_expiry_is_not_active() {
        let f = fixture();
        let txn = TransactionId::generate();
        f.store.create(txn.clone(), f.lot, 2).await.unwrap();
        f.clock.advance(chrono::Duration::minutes(11));

        let err = f.finalizer.finalize(&txn, holders(2)).await.unwrap_err();

        assert_eq!(
            err,
            ReservationError::ReservationNotActive {
                transaction_id: txn,
                status: ReservationStatus::Expired
            }
        );
        assert_eq!(f.datastore.ownership_count(f.lot), 0);
        assert_eq!(f.datastore.lot(f.lot).unwrap().unallocated_shares, 7);
    }

    #[tokio::test]
    async fn full_lot_refuses_finalize_and_keeps_the_hold() {
        let f = fixture();
        let lot = f.datastore.lot(f.lot).unwrap();
        let earlier = TransactionId::generate();
        for holder in holders(5) {
            let record =
                OwnershipRecord::for_holder(&holder, &lot, &earlier, 0, test_time()).unwrap();
            f.datastore.seed_ownership(record);
        }
        let txn = TransactionId::generate();
        f.store.create(txn.clone(), f.lot, 3).await.unwrap();

        let err = f.finalizer.finalize(&txn, holders(3)).await.unwrap_err();

        assert_eq!(
            err,
            ReservationError::LotAtCapacity {
                lot_id: f.lot,
                owned: 5,
                requested: 3,
                total: 7
            }
        );
        assert_eq!(
            f.datastore.reservation(&txn).unwrap().status,
            ReservationStatus::Active
        );
        assert_eq!(f.datastore.ownership_count(f.lot), 5);

        // Asking for fewer shares lets the buyer finish
        f.store.update_share_count(&txn, 2).await.unwrap();
        let receipt = f.finalizer.finalize(&txn, holders(2)).await.unwrap();
        assert_eq!(receipt.reservation.status, ReservationStatus::Completed);
        assert_eq!(f.datastore.ownership_count(f.lot), 7);
    }

    #[tokio::test]
    async fn delivery_fee_defaults_apply() {
        let f = fixture();
        let txn = TransactionId::generate();
        f.store.create(txn.clone(), f.lot, 1).await.unwrap();

        let mut holder = HolderDetails::new("Deniz", "555-0100");
        holder.delivery = hisse_core::DeliveryOption::Delivery;
        let receipt = f.finalizer.finalize(&txn, vec![holder]).await.unwrap();

        assert_eq!(receipt.records[0].price.delivery_fee, 500);
        assert_eq!(receipt.records[0].price.total_amount, 10_500);
        assert!(receipt.records[0].is_purchaser);
    }

    #[test]
    fn purchaser_defaults_to_first_holder() {
        let mut list = vec![HolderDetails::new("A", "1"), HolderDetails::new("B", "2")];
        assign_purchaser(&mut list).unwrap();
        assert!(list[0].is_purchaser);
        assert!(!list[1].is_purchaser);
    }

    #[test]
    fn two_purchasers_are_rejected() {
        let mut list = vec![
            HolderDetails::new("A", "1").purchaser(),
            HolderDetails::new("B", "2").purchaser(),
        ];
        assert!(matches!(
            assign_purchaser(&mut list),
            Err(ReservationError::InvalidInput(_))
        ));
    }
}
