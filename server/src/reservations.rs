//! Reservation store: time-boxed holds on shares of a lot.
//!
//! Every operation composes ledger calls with compare-and-set reservation
//! writes, so it stays correct when interleaved with any other caller
//! touching the same lot:
//!
//! - Create holds first, then inserts; a failed insert gives the shares back.
//! - Resizing changes the count and moves the difference through the lot
//!   counter in one atomic datastore step.
//! - Termination is a CAS out of `active` that returns the shares in the same
//!   step; only the winner releases. Losers get the existing record back,
//!   which makes cancel, timeout and expiry idempotent and race-safe against
//!   each other and against finalize. A failed termination changed nothing
//!   and can be retried.

use crate::ledger::Ledger;
use hisse_core::datastore::{Datastore, ResizeOutcome};
use hisse_core::environment::Clock;
use hisse_core::{
    DatastoreError, LotId, Reservation, ReservationError, ReservationLoad, ReservationStatus,
    ReservationStatusView, SHARES_PER_LOT, TransactionId,
};
use hisse_runtime::RetryPolicy;
use hisse_runtime::metrics::ReservationMetrics;
use hisse_runtime::retry::retry_read;
use std::sync::Arc;

/// Outcome of one sweep pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Stale reservations found
    pub scanned: usize,
    /// Reservations this pass moved to `expired`
    pub expired: Vec<TransactionId>,
    /// Shares returned to the ledger
    pub released_shares: u32,
    /// Reservations that could not be processed
    pub failed: usize,
}

/// Reservation lifecycle over a [`Datastore`] and a [`Ledger`]
#[derive(Clone)]
pub struct ReservationStore {
    datastore: Arc<dyn Datastore>,
    ledger: Ledger,
    clock: Arc<dyn Clock>,
    hold_duration: chrono::Duration,
    read_retry: RetryPolicy,
}

impl ReservationStore {
    /// Create a store whose holds last `hold_duration`
    #[must_use]
    pub fn new(
        datastore: Arc<dyn Datastore>,
        clock: Arc<dyn Clock>,
        hold_duration: chrono::Duration,
    ) -> Self {
        Self {
            ledger: Ledger::new(datastore.clone()),
            datastore,
            clock,
            hold_duration,
            read_retry: RetryPolicy::default(),
        }
    }

    /// Use `policy` for idempotent reads
    #[must_use]
    pub fn with_read_retry(mut self, policy: RetryPolicy) -> Self {
        self.read_retry = policy;
        self
    }

    /// The ledger this store allocates through
    #[must_use]
    pub const fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// Take a hold on `share_count` shares of `lot_id`.
    ///
    /// Retrying with the same token, lot and count while the hold is still
    /// active returns the existing reservation.
    ///
    /// # Errors
    ///
    /// - [`ReservationError::InvalidInput`]: count outside `1..=7`, or the token is taken
    /// - [`ReservationError::InsufficientInventory`]: not enough unallocated shares
    /// - [`ReservationError::LotNotFound`]: unknown lot
    #[tracing::instrument(skip(self), fields(transaction_id = %transaction_id, lot_id = %lot_id))]
    pub async fn create(
        &self,
        transaction_id: TransactionId,
        lot_id: LotId,
        share_count: u32,
    ) -> Result<Reservation, ReservationError> {
        let result = self.try_create(transaction_id, lot_id, share_count).await;
        match &result {
            Ok(_) => ReservationMetrics::record_created(),
            Err(err) => ReservationMetrics::record_rejected(err.kind()),
        }
        result
    }

    async fn try_create(
        &self,
        transaction_id: TransactionId,
        lot_id: LotId,
        share_count: u32,
    ) -> Result<Reservation, ReservationError> {
        validate_share_count(share_count)?;

        if let Some(existing) = self.datastore.get_reservation(&transaction_id).await? {
            let now = self.clock.now();
            if existing.is_active()
                && !existing.is_stale(now)
                && existing.lot_id == lot_id
                && existing.share_count == share_count
            {
                tracing::debug!("Replayed create, returning existing hold");
                return Ok(existing);
            }
            return Err(token_taken(&transaction_id));
        }

        self.ledger.hold(lot_id, share_count).await?;

        let reservation = Reservation::new(
            transaction_id.clone(),
            lot_id,
            share_count,
            self.clock.now(),
            self.hold_duration,
        );

        if let Err(err) = self.datastore.insert_reservation(reservation.clone()).await {
            tracing::warn!(error = %err, "Insert failed, returning held shares");
            if let Err(release_err) = self.ledger.release(lot_id, share_count).await {
                tracing::error!(error = %release_err, share_count, "Compensating release failed");
            }
            return Err(match err {
                DatastoreError::Conflict(_) => token_taken(&transaction_id),
                other => other.into(),
            });
        }

        tracing::info!(share_count, expires_at = %reservation.expires_at, "Reservation created");
        Ok(reservation)
    }

    /// Change the number of shares held. The expiry time is not extended.
    ///
    /// # Errors
    ///
    /// - [`ReservationError::InvalidInput`]: count outside `1..=7`
    /// - [`ReservationError::InsufficientInventory`]: not enough shares to grow; hold unchanged
    /// - [`ReservationError::ReservationNotActive`]: the hold has ended (including by lapsing)
    /// - [`ReservationError::ReservationNotFound`]: unknown token
    #[tracing::instrument(skip(self), fields(transaction_id = %transaction_id))]
    pub async fn update_share_count(
        &self,
        transaction_id: &TransactionId,
        new_count: u32,
    ) -> Result<Reservation, ReservationError> {
        let result = self.try_update(transaction_id, new_count).await;
        if let Err(err) = &result {
            ReservationMetrics::record_rejected(err.kind());
        }
        result
    }

    async fn try_update(
        &self,
        transaction_id: &TransactionId,
        new_count: u32,
    ) -> Result<Reservation, ReservationError> {
        validate_share_count(new_count)?;
        let current = self.get(transaction_id).await?;
        ensure_active(&current)?;

        let old_count = current.share_count;
        if new_count == old_count {
            return Ok(current);
        }

        match self.datastore.resize_reservation(transaction_id, new_count).await? {
            ResizeOutcome::Resized(updated) => {
                tracing::info!(old_count, new_count, "Hold resized");
                Ok(updated)
            },
            ResizeOutcome::Rejected { unallocated } => {
                tracing::info!(old_count, new_count, available = unallocated, "Growth rejected");
                Err(ReservationError::InsufficientInventory {
                    lot_id: current.lot_id,
                    requested: new_count.saturating_sub(old_count),
                    available: unallocated,
                })
            },
            ResizeOutcome::NotActive(Some(ended)) => Err(ReservationError::ReservationNotActive {
                transaction_id: transaction_id.clone(),
                status: ended.status,
            }),
            ResizeOutcome::NotActive(None) => {
                Err(ReservationError::ReservationNotFound(transaction_id.clone()))
            },
        }
    }

    /// Release a hold as `canceled`. A no-op returning the current record
    /// when the reservation is already terminal.
    ///
    /// # Errors
    ///
    /// [`ReservationError::ReservationNotFound`] for unknown tokens, or storage failures.
    pub async fn cancel(&self, transaction_id: &TransactionId) -> Result<Reservation, ReservationError> {
        self.terminate(transaction_id, ReservationStatus::Canceled).await
    }

    /// Release a hold as `timed_out` (the client's countdown reached zero).
    /// A no-op returning the current record when already terminal.
    ///
    /// # Errors
    ///
    /// [`ReservationError::ReservationNotFound`] for unknown tokens, or storage failures.
    pub async fn mark_timed_out(
        &self,
        transaction_id: &TransactionId,
    ) -> Result<Reservation, ReservationError> {
        self.terminate(transaction_id, ReservationStatus::TimedOut).await
    }

    /// Move an active reservation to the terminal status `to`, releasing its
    /// shares if and only if this call won the transition.
    ///
    /// # Errors
    ///
    /// [`ReservationError::ReservationNotFound`] for unknown tokens, or storage failures.
    #[tracing::instrument(skip(self), fields(transaction_id = %transaction_id, to = %to))]
    pub async fn terminate(
        &self,
        transaction_id: &TransactionId,
        to: ReservationStatus,
    ) -> Result<Reservation, ReservationError> {
        if !to.is_terminal() {
            return Err(ReservationError::InvalidInput(
                "target status must be terminal".to_string(),
            ));
        }

        if let Some(ended) = self.datastore.end_reservation(transaction_id, to).await? {
            ReservationMetrics::record_terminated(to.as_str());
            tracing::info!(lot_id = %ended.lot_id, shares = ended.share_count, "Reservation ended");
            return Ok(ended);
        }

        match self.datastore.get_reservation(transaction_id).await? {
            Some(existing) => {
                tracing::debug!(status = %existing.status, "Already terminal, nothing to do");
                Ok(existing)
            },
            None => Err(ReservationError::ReservationNotFound(transaction_id.clone())),
        }
    }

    /// Status snapshot, expiring the hold first if it has lapsed.
    ///
    /// # Errors
    ///
    /// [`ReservationError::ReservationNotFound`] for unknown tokens, or storage failures.
    #[tracing::instrument(skip(self), fields(transaction_id = %transaction_id))]
    pub async fn get_status(
        &self,
        transaction_id: &TransactionId,
    ) -> Result<ReservationStatusView, ReservationError> {
        let reservation = self.get(transaction_id).await?;
        Ok(reservation.status_view(self.clock.now()))
    }

    /// Fetch a reservation, expiring it first if it has lapsed.
    ///
    /// # Errors
    ///
    /// [`ReservationError::ReservationNotFound`] for unknown tokens, or storage failures.
    pub async fn get(&self, transaction_id: &TransactionId) -> Result<Reservation, ReservationError> {
        let found = retry_read(self.read_retry.clone(), || async {
            Ok(self.datastore.get_reservation(transaction_id).await?)
        })
        .await?;

        let reservation =
            found.ok_or_else(|| ReservationError::ReservationNotFound(transaction_id.clone()))?;

        if reservation.is_stale(self.clock.now()) {
            tracing::debug!("Hold lapsed, expiring on read");
            return self.terminate(transaction_id, ReservationStatus::Expired).await;
        }
        Ok(reservation)
    }

    /// Expire up to `limit` lapsed holds and return their shares.
    ///
    /// Individual failures are logged and counted; the pass carries on.
    ///
    /// # Errors
    ///
    /// Storage failures while listing candidates.
    #[tracing::instrument(skip(self))]
    pub async fn sweep_expired(&self, limit: usize) -> Result<SweepReport, ReservationError> {
        let now = self.clock.now();
        let stale = self.datastore.list_stale_reservations(now, limit).await?;

        let mut report = SweepReport {
            scanned: stale.len(),
            ..SweepReport::default()
        };

        for candidate in stale {
            let txn = &candidate.transaction_id;
            match self.datastore.end_reservation(txn, ReservationStatus::Expired).await {
                Ok(Some(expired)) => {
                    ReservationMetrics::record_terminated(ReservationStatus::Expired.as_str());
                    report.released_shares += expired.share_count;
                    report.expired.push(expired.transaction_id);
                },
                Ok(None) => {
                    tracing::debug!(transaction_id = %txn, "Ended by another path before sweep");
                },
                Err(error) => {
                    // Nothing changed; the hold stays stale for the next pass
                    tracing::error!(transaction_id = %txn, %error, "Expiry failed");
                    report.failed += 1;
                },
            }
        }

        if !report.expired.is_empty() {
            tracing::info!(
                expired = report.expired.len(),
                released = report.released_shares,
                "Expired lapsed reservations"
            );
        }
        Ok(report)
    }

    /// All active holds.
    ///
    /// # Errors
    ///
    /// Storage failures that persist through retries.
    pub async fn list_active(&self) -> Result<Vec<Reservation>, ReservationError> {
        retry_read(self.read_retry.clone(), || async {
            Ok(self.datastore.list_active_reservations().await?)
        })
        .await
    }

    /// Shares held by active reservations on `lot_id`.
    ///
    /// # Errors
    ///
    /// Storage failures that persist through retries.
    pub async fn active_load(&self, lot_id: LotId) -> Result<ReservationLoad, ReservationError> {
        let active_share_count = retry_read(self.read_retry.clone(), || async {
            Ok(self.datastore.active_load(lot_id).await?)
        })
        .await?;
        Ok(ReservationLoad {
            lot_id,
            active_share_count,
        })
    }
}

/// Reject counts outside `1..=SHARES_PER_LOT`.
///
/// # Errors
///
/// [`ReservationError::InvalidInput`] when out of range.
pub fn validate_share_count(share_count: u32) -> Result<(), ReservationError> {
    if (1..=SHARES_PER_LOT).contains(&share_count) {
        Ok(())
    } else {
        Err(ReservationError::InvalidInput(format!(
            "share count must be between 1 and {SHARES_PER_LOT}, got {share_count}"
        )))
    }
}

/// Fail with `ReservationNotActive` unless `reservation` is active.
///
/// # Errors
///
/// [`ReservationError::ReservationNotActive`] for terminal reservations.
pub fn ensure_active(reservation: &Reservation) -> Result<(), ReservationError> {
    if reservation.is_active() {
        Ok(())
    } else {
        Err(ReservationError::ReservationNotActive {
            transaction_id: reservation.transaction_id.clone(),
            status: reservation.status,
        })
    }
}

fn token_taken(transaction_id: &TransactionId) -> ReservationError {
    ReservationError::InvalidInput(format!("transaction id {transaction_id} is already in use"))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)] // Test code

    use super::*;
    use hisse_testing::{InMemoryDatastore, ManualClock, test_time};

    struct Fixture {
        clock: ManualClock,
        datastore: Arc<InMemoryDatastore>,
        store: ReservationStore,
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
        Fixture {
            clock,
            datastore,
            store,
            lot,
        }
    }

    fn unallocated(f: &Fixture) -> u32 {
        f.datastore.lot(f.lot).unwrap().unallocated_shares
    }

    #[tokio::test]
    async fn create_holds_shares_for_ten_minutes() {
        let f = fixture();
        let txn = TransactionId::generate();

        let r = f.store.create(txn.clone(), f.lot, 3).await.unwrap();

        assert_eq!(r.status, ReservationStatus::Active);
        assert_eq!(r.expires_at, test_time() + chrono::Duration::minutes(10));
        assert_eq!(unallocated(&f), 4);
    }

    #[tokio::test]
    async fn create_rejects_out_of_range_counts() {
        let f = fixture();
        for bad in [0, 8] {
            let err = f.store.create(TransactionId::generate(), f.lot, bad).await.unwrap_err();
            assert!(matches!(err, ReservationError::InvalidInput(_)));
        }
        assert_eq!(unallocated(&f), 7);
    }

    #[tokio::test]
    async fn replayed_create_returns_the_same_hold() {
        let f = fixture();
        let txn = TransactionId::generate();
        let first = f.store.create(txn.clone(), f.lot, 2).await.unwrap();
        let again = f.store.create(txn.clone(), f.lot, 2).await.unwrap();

        assert_eq!(first, again);
        assert_eq!(unallocated(&f), 5);

        let err = f.store.create(txn, f.lot, 3).await.unwrap_err();
        assert!(matches!(err, ReservationError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn unknown_lot_holds_nothing() {
        let f = fixture();
        let other_lot = LotId::new();
        let err = f.store.create(TransactionId::generate(), other_lot, 1).await.unwrap_err();
        assert_eq!(err, ReservationError::LotNotFound(other_lot));
        assert_eq!(unallocated(&f), 7);
    }

    #[tokio::test]
    async fn grow_and_shrink_move_the_counter() {
        let f = fixture();
        let txn = TransactionId::generate();
        f.store.create(txn.clone(), f.lot, 2).await.unwrap();

        let grown = f.store.update_share_count(&txn, 5).await.unwrap();
        assert_eq!(grown.share_count, 5);
        assert_eq!(unallocated(&f), 2);

        let shrunk = f.store.update_share_count(&txn, 1).await.unwrap();
        assert_eq!(shrunk.share_count, 1);
        assert_eq!(unallocated(&f), 6);
    }

    #[tokio::test]
    async fn update_does_not_extend_expiry() {
        let f = fixture();
        let txn = TransactionId::generate();
        let created = f.store.create(txn.clone(), f.lot, 2).await.unwrap();

        f.clock.advance(chrono::Duration::minutes(4));
        let updated = f.store.update_share_count(&txn, 3).await.unwrap();
        assert_eq!(updated.expires_at, created.expires_at);
    }

    #[tokio::test]
    async fn failed_grow_leaves_hold_unchanged() {
        let f = fixture();
        let txn = TransactionId::generate();
        f.store.create(txn.clone(), f.lot, 2).await.unwrap();
        f.store.create(TransactionId::generate(), f.lot, 4).await.unwrap();

        let err = f.store.update_share_count(&txn, 4).await.unwrap_err();
        assert!(matches!(
            err,
            ReservationError::InsufficientInventory { available: 1, .. }
        ));
        assert_eq!(f.datastore.reservation(&txn).unwrap().share_count, 2);
        assert_eq!(unallocated(&f), 1);
    }

    #[tokio::test]
    async fn cancel_and_timeout_are_idempotent() {
        let f = fixture();
        let txn = TransactionId::generate();
        f.store.create(txn.clone(), f.lot, 3).await.unwrap();

        let first = f.store.cancel(&txn).await.unwrap();
        let second = f.store.cancel(&txn).await.unwrap();
        let timed_out = f.store.mark_timed_out(&txn).await.unwrap();

        assert_eq!(first.status, ReservationStatus::Canceled);
        assert_eq!(second.status, ReservationStatus::Canceled);
        assert_eq!(timed_out.status, ReservationStatus::Canceled);
        assert_eq!(unallocated(&f), 7);
    }

    #[tokio::test]
    async fn failed_cancel_leaves_the_hold_retryable() {
        let f = fixture();
        let txn = TransactionId::generate();
        f.store.create(txn.clone(), f.lot, 3).await.unwrap();

        f.datastore.fail_next_writes(1);
        let err = f.store.cancel(&txn).await.unwrap_err();
        assert!(matches!(err, ReservationError::Datastore(_)));
        assert_eq!(
            f.datastore.reservation(&txn).unwrap().status,
            ReservationStatus::Active
        );
        assert_eq!(unallocated(&f), 4);

        let retried = f.store.cancel(&txn).await.unwrap();
        assert_eq!(retried.status, ReservationStatus::Canceled);
        assert_eq!(unallocated(&f), 7);
    }

    #[tokio::test]
    async fn failed_shrink_keeps_count_and_counter_together() {
        let f = fixture();
        let txn = TransactionId::generate();
        f.store.create(txn.clone(), f.lot, 5).await.unwrap();

        f.datastore.fail_next_writes(1);
        assert!(f.store.update_share_count(&txn, 2).await.is_err());
        assert_eq!(f.datastore.reservation(&txn).unwrap().share_count, 5);
        assert_eq!(unallocated(&f), 2);

        f.store.update_share_count(&txn, 2).await.unwrap();
        assert_eq!(unallocated(&f), 5);
    }

    #[tokio::test]
    async fn terminating_unknown_token_is_not_found() {
        let f = fixture();
        let txn = TransactionId::generate();
        assert_eq!(
            f.store.cancel(&txn).await.unwrap_err(),
            ReservationError::ReservationNotFound(txn)
        );
    }

    #[tokio::test]
    async fn update_after_cancel_is_not_active() {
        let f = fixture();
        let txn = TransactionId::generate();
        f.store.create(txn.clone(), f.lot, 3).await.unwrap();
        f.store.cancel(&txn).await.unwrap();

        let err = f.store.update_share_count(&txn, 2).await.unwrap_err();
        assert_eq!(
            err,
            ReservationError::ReservationNotActive {
                transaction_id: txn,
                status: ReservationStatus::Canceled
            }
        );
        assert_eq!(unallocated(&f), 7);
    }

    #[tokio::test]
    async fn status_read_expires_lapsed_holds() {
        let f = fixture();
        let txn = TransactionId::generate();
        f.store.create(txn.clone(), f.lot, 3).await.unwrap();

        let view = f.store.get_status(&txn).await.unwrap();
        assert_eq!(view.seconds_remaining, 600);

        f.clock.advance(chrono::Duration::minutes(11));
        let view = f.store.get_status(&txn).await.unwrap();
        assert_eq!(view.status, ReservationStatus::Expired);
        assert_eq!(view.seconds_remaining, 0);
        assert_eq!(unallocated(&f), 7);
    }

    #[tokio::test]
    async fn sweep_expires_only_lapsed_holds() {
        let f = fixture();
        let old = TransactionId::generate();
        f.store.create(old.clone(), f.lot, 3).await.unwrap();
        f.clock.advance(chrono::Duration::minutes(6));
        let fresh = TransactionId::generate();
        f.store.create(fresh.clone(), f.lot, 2).await.unwrap();
        f.clock.advance(chrono::Duration::minutes(5));

        let report = f.store.sweep_expired(100).await.unwrap();

        assert_eq!(report.expired, vec![old.clone()]);
        assert_eq!(report.released_shares, 3);
        assert_eq!(unallocated(&f), 5);
        assert_eq!(
            f.datastore.reservation(&old).unwrap().status,
            ReservationStatus::Expired
        );

        let again = f.store.sweep_expired(100).await.unwrap();
        assert!(again.expired.is_empty());
    }

    #[tokio::test]
    async fn failed_expiry_is_picked_up_by_the_next_sweep() {
        let f = fixture();
        let txn = TransactionId::generate();
        f.store.create(txn.clone(), f.lot, 3).await.unwrap();
        f.clock.advance(chrono::Duration::minutes(11));

        f.datastore.fail_next_writes(1);
        let report = f.store.sweep_expired(100).await.unwrap();
        assert_eq!(report.failed, 1);
        assert!(report.expired.is_empty());
        assert_eq!(unallocated(&f), 4);

        let report = f.store.sweep_expired(100).await.unwrap();
        assert_eq!(report.expired, vec![txn]);
        assert_eq!(unallocated(&f), 7);
    }

    #[tokio::test]
    async fn active_load_sums_active_holds() {
        let f = fixture();
        f.store.create(TransactionId::generate(), f.lot, 2).await.unwrap();
        let txn = TransactionId::generate();
        f.store.create(txn.clone(), f.lot, 3).await.unwrap();
        f.store.cancel(&txn).await.unwrap();

        let load = f.store.active_load(f.lot).await.unwrap();
        assert_eq!(load.active_share_count, 2);
        assert_eq!(f.store.list_active().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn transient_read_failures_are_retried() {
        let f = fixture();
        let store = f.store.clone().with_read_retry(
            RetryPolicy::builder()
                .max_retries(2)
                .initial_delay(std::time::Duration::from_millis(1))
                .build(),
        );
        f.datastore.fail_next_reads(2);
        let load = store.active_load(f.lot).await.unwrap();
        assert_eq!(load.active_share_count, 0);
    }
}
