//! The reservation subsystem behind one handle.
//!
//! [`ReservationService`] wires the ledger, the reservation store and the
//! finalizer over a single datastore and implements [`ReservationBackend`],
//! the interface the HTTP layer and the checkout flow controller talk to.

use crate::finalizer::AllocationFinalizer;
use crate::reservations::ReservationStore;
use hisse_core::backend::{BackendFuture, FinalizeReceipt, ReservationBackend};
use hisse_core::datastore::Datastore;
use hisse_core::environment::{Clock, SystemClock};
use hisse_core::{
    HolderDetails, Lot, LotId, Reservation, ReservationError, ReservationLoad,
    ReservationStatusView, TransactionId,
};
use hisse_runtime::RetryPolicy;
use hisse_runtime::retry::retry_read;
use std::sync::Arc;

/// Ledger, reservation store and finalizer over one datastore
#[derive(Clone)]
pub struct ReservationService {
    datastore: Arc<dyn Datastore>,
    reservations: ReservationStore,
    finalizer: AllocationFinalizer,
    read_retry: RetryPolicy,
}

/// Builder for [`ReservationService`]
pub struct ReservationServiceBuilder {
    datastore: Arc<dyn Datastore>,
    clock: Arc<dyn Clock>,
    hold_duration: chrono::Duration,
    default_delivery_fee: i64,
    read_retry: RetryPolicy,
}

impl ReservationServiceBuilder {
    /// Time source (defaults to the system clock)
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Hold lifetime (defaults to ten minutes)
    #[must_use]
    pub const fn hold_duration(mut self, hold_duration: chrono::Duration) -> Self {
        self.hold_duration = hold_duration;
        self
    }

    /// Fee for delivering holders that name none (defaults to zero)
    #[must_use]
    pub const fn default_delivery_fee(mut self, fee: i64) -> Self {
        self.default_delivery_fee = fee;
        self
    }

    /// Retry policy for idempotent reads
    #[must_use]
    pub fn read_retry(mut self, policy: RetryPolicy) -> Self {
        self.read_retry = policy;
        self
    }

    /// Build the service
    #[must_use]
    pub fn build(self) -> ReservationService {
        let reservations = ReservationStore::new(
            self.datastore.clone(),
            self.clock.clone(),
            self.hold_duration,
        )
        .with_read_retry(self.read_retry.clone());
        let finalizer =
            AllocationFinalizer::new(self.datastore.clone(), reservations.clone(), self.clock)
                .with_default_delivery_fee(self.default_delivery_fee);

        ReservationService {
            datastore: self.datastore,
            reservations,
            finalizer,
            read_retry: self.read_retry,
        }
    }
}

impl ReservationService {
    /// Start building a service over `datastore`
    #[must_use]
    pub fn builder(datastore: Arc<dyn Datastore>) -> ReservationServiceBuilder {
        ReservationServiceBuilder {
            datastore,
            clock: Arc::new(SystemClock),
            hold_duration: chrono::Duration::minutes(10),
            default_delivery_fee: 0,
            read_retry: RetryPolicy::default(),
        }
    }

    /// The reservation store (shared with the sweeper)
    #[must_use]
    pub const fn reservations(&self) -> &ReservationStore {
        &self.reservations
    }

    /// The underlying datastore
    #[must_use]
    pub fn datastore(&self) -> Arc<dyn Datastore> {
        self.datastore.clone()
    }

    /// All lots ordered by sequence number.
    ///
    /// # Errors
    ///
    /// Storage failures that persist through retries.
    pub async fn lots(&self) -> Result<Vec<Lot>, ReservationError> {
        retry_read(self.read_retry.clone(), || async {
            Ok(self.datastore.list_lots().await?)
        })
        .await
    }

    /// One lot.
    ///
    /// # Errors
    ///
    /// [`ReservationError::LotNotFound`], or storage failures that persist through retries.
    pub async fn lot(&self, lot_id: LotId) -> Result<Lot, ReservationError> {
        retry_read(self.read_retry.clone(), || async {
            Ok(self.datastore.get_lot(lot_id).await?)
        })
        .await?
        .ok_or(ReservationError::LotNotFound(lot_id))
    }

    /// Active load of every lot that has at least one active hold.
    ///
    /// # Errors
    ///
    /// Storage failures that persist through retries.
    pub async fn active_loads(&self) -> Result<Vec<ReservationLoad>, ReservationError> {
        let active = self.reservations.list_active().await?;
        let mut loads: Vec<ReservationLoad> = Vec::new();
        for reservation in active {
            match loads.iter_mut().find(|l| l.lot_id == reservation.lot_id) {
                Some(load) => load.active_share_count += reservation.share_count,
                None => loads.push(ReservationLoad {
                    lot_id: reservation.lot_id,
                    active_share_count: reservation.share_count,
                }),
            }
        }
        Ok(loads)
    }

    /// Whether storage answers.
    ///
    /// # Errors
    ///
    /// Storage is unreachable.
    pub async fn ping(&self) -> Result<(), ReservationError> {
        Ok(self.datastore.ping().await?)
    }
}

impl ReservationBackend for ReservationService {
    fn list_lots(&self) -> BackendFuture<'_, Vec<Lot>> {
        Box::pin(self.lots())
    }

    fn list_active_reservations(&self) -> BackendFuture<'_, Vec<Reservation>> {
        Box::pin(self.reservations.list_active())
    }

    fn create_reservation(
        &self,
        transaction_id: TransactionId,
        lot_id: LotId,
        share_count: u32,
    ) -> BackendFuture<'_, Reservation> {
        Box::pin(self.reservations.create(transaction_id, lot_id, share_count))
    }

    fn update_share_count(
        &self,
        transaction_id: TransactionId,
        new_count: u32,
    ) -> BackendFuture<'_, Reservation> {
        Box::pin(async move {
            self.reservations
                .update_share_count(&transaction_id, new_count)
                .await
        })
    }

    fn cancel_reservation(&self, transaction_id: TransactionId) -> BackendFuture<'_, Reservation> {
        Box::pin(async move { self.reservations.cancel(&transaction_id).await })
    }

    fn mark_timed_out(&self, transaction_id: TransactionId) -> BackendFuture<'_, Reservation> {
        Box::pin(async move { self.reservations.mark_timed_out(&transaction_id).await })
    }

    fn reservation_status(
        &self,
        transaction_id: TransactionId,
    ) -> BackendFuture<'_, ReservationStatusView> {
        Box::pin(async move { self.reservations.get_status(&transaction_id).await })
    }

    fn finalize(
        &self,
        transaction_id: TransactionId,
        holders: Vec<HolderDetails>,
    ) -> BackendFuture<'_, FinalizeReceipt> {
        Box::pin(async move { self.finalizer.finalize(&transaction_id, holders).await })
    }

    fn active_load(&self, lot_id: LotId) -> BackendFuture<'_, ReservationLoad> {
        Box::pin(self.reservations.active_load(lot_id))
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)] // Test code

    use super::*;
    use hisse_testing::fixtures::holders;
    use hisse_testing::{InMemoryDatastore, test_clock};

    fn service() -> (Arc<InMemoryDatastore>, ReservationService) {
        let datastore = Arc::new(InMemoryDatastore::new(Arc::new(test_clock())));
        let service = ReservationService::builder(datastore.clone())
            .clock(Arc::new(test_clock()))
            .read_retry(RetryPolicy::none())
            .build();
        (datastore, service)
    }

    #[tokio::test]
    async fn backend_calls_reach_the_store_and_finalizer() {
        let (datastore, service) = service();
        let lot = datastore.seed_lot(1, 10_000);
        let backend: Arc<dyn ReservationBackend> = Arc::new(service);
        let txn = TransactionId::generate();

        backend.create_reservation(txn.clone(), lot.id, 2).await.unwrap();
        backend.update_share_count(txn.clone(), 3).await.unwrap();
        assert_eq!(backend.active_load(lot.id).await.unwrap().active_share_count, 3);

        let receipt = backend.finalize(txn.clone(), holders(3)).await.unwrap();
        assert_eq!(receipt.records.len(), 3);
        assert_eq!(backend.list_lots().await.unwrap()[0].unallocated_shares, 4);
        assert!(backend.list_active_reservations().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn active_loads_group_by_lot() {
        let (datastore, service) = service();
        let a = datastore.seed_lot(1, 10_000);
        let b = datastore.seed_lot(2, 10_000);
        service.reservations().create(TransactionId::generate(), a.id, 1).await.unwrap();
        service.reservations().create(TransactionId::generate(), a.id, 2).await.unwrap();
        service.reservations().create(TransactionId::generate(), b.id, 4).await.unwrap();

        let loads = service.active_loads().await.unwrap();
        let load_of = |id| loads.iter().find(|l| l.lot_id == id).unwrap().active_share_count;
        assert_eq!(load_of(a.id), 3);
        assert_eq!(load_of(b.id), 4);
    }

    #[tokio::test]
    async fn unknown_lot_is_not_found() {
        let (_, service) = service();
        let missing = LotId::new();
        assert_eq!(
            service.lot(missing).await.unwrap_err(),
            ReservationError::LotNotFound(missing)
        );
        service.ping().await.unwrap();
    }
}
