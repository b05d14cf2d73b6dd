//! Storage collaborator for lots, reservations and ownership records.
//!
//! The [`Datastore`] trait is the only place the unallocated-share counter is
//! written. Every write to it is a conditional update that applies a delta
//! only if the result stays within `0..=total_shares`, evaluated atomically by
//! the storage engine. Ending and resizing a reservation carry that update in
//! the same atomic step as the reservation write, so a failure never leaves
//! one without the other.
//!
//! # Implementations
//!
//! - `PostgresDatastore` (in `hisse-postgres`): conditional `UPDATE` statements,
//!   transactions where two rows move together, and `LISTEN/NOTIFY` for row changes
//! - `InMemoryDatastore` (in `hisse-testing`): mutex-guarded tables for deterministic tests
//!
//! # Dyn Compatibility
//!
//! Methods return `Pin<Box<dyn Future>>` so services can hold `Arc<dyn Datastore>`.

use crate::error::DatastoreError;
use crate::types::{
    Lot, LotId, OwnershipRecord, Reservation, ReservationStatus, TransactionId,
};
use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;

/// Boxed future returned by datastore methods
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, DatastoreError>> + Send + 'a>>;

/// Stream of raw row changes
pub type RowChangeStream = Pin<Box<dyn Stream<Item = Result<RowChange, DatastoreError>> + Send>>;

/// Result of a conditional allocate
#[derive(Clone, Debug, PartialEq)]
pub enum AllocationOutcome {
    /// The delta was applied; carries the updated lot
    Applied(Lot),
    /// The guard failed; nothing changed
    Rejected {
        /// Unallocated shares observed when the guard failed
        unallocated: u32,
    },
    /// No such lot
    UnknownLot,
}

/// Result of committing a reservation into ownership records
#[derive(Clone, Debug, PartialEq)]
pub enum CommitOutcome {
    /// Records inserted and the reservation moved to `completed`
    Committed(Reservation),
    /// `owned + requested` would exceed `total`; nothing changed
    AtCapacity {
        /// Records already present for the lot
        owned: u32,
        /// Lot total
        total: u32,
    },
    /// The reservation is missing or no longer `active`; nothing changed
    NotActive(Option<Reservation>),
}

/// Result of resizing a reservation
#[derive(Clone, Debug, PartialEq)]
pub enum ResizeOutcome {
    /// Count changed and the difference moved through the lot counter
    Resized(Reservation),
    /// Not enough unallocated shares to grow; nothing changed
    Rejected {
        /// Unallocated shares observed when the guard failed
        unallocated: u32,
    },
    /// The reservation is missing or no longer `active`; nothing changed
    NotActive(Option<Reservation>),
}

/// Kind of row mutation
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOp {
    /// Row created
    Insert,
    /// Row modified
    Update,
    /// Row removed
    Delete,
}

/// A row-level change as emitted by storage, before normalization
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RowChange {
    /// Source table (`lots`, `reservations`, ...)
    pub table: String,
    /// Mutation kind
    pub op: ChangeOp,
    /// The row after the change (before it, for deletes)
    pub row: serde_json::Value,
}

/// Storage abstraction.
///
/// Every method that mutates a reservation is a compare-and-set against
/// `status = 'active'`, so concurrent termination paths resolve to exactly one
/// winner without application-level locking. Status changes that move shares
/// carry the counter update in the same atomic step.
pub trait Datastore: Send + Sync {
    /// Round-trip to storage, for readiness probes.
    ///
    /// # Errors
    ///
    /// Storage is unreachable.
    fn ping(&self) -> BoxFuture<'_, ()>;

    /// Insert a lot.
    ///
    /// # Errors
    ///
    /// `Conflict` if the id is taken.
    fn insert_lot(&self, lot: Lot) -> BoxFuture<'_, ()>;

    /// Fetch one lot.
    ///
    /// # Errors
    ///
    /// Storage failures.
    fn get_lot(&self, lot_id: LotId) -> BoxFuture<'_, Option<Lot>>;

    /// All lots ordered by sequence number.
    ///
    /// # Errors
    ///
    /// Storage failures.
    fn list_lots(&self) -> BoxFuture<'_, Vec<Lot>>;

    /// Atomically apply `delta` to `unallocated_shares` if the result stays in
    /// `0..=total_shares`. A negative delta holds shares, a positive one
    /// releases them.
    ///
    /// # Errors
    ///
    /// Storage failures. A failed guard is [`AllocationOutcome::Rejected`], not an error.
    fn conditional_allocate(&self, lot_id: LotId, delta: i64) -> BoxFuture<'_, AllocationOutcome>;

    /// Insert a new reservation.
    ///
    /// # Errors
    ///
    /// `Conflict` if the transaction id already exists.
    fn insert_reservation(&self, reservation: Reservation) -> BoxFuture<'_, ()>;

    /// Fetch a reservation by transaction id.
    ///
    /// # Errors
    ///
    /// Storage failures.
    fn get_reservation(&self, transaction_id: &TransactionId)
    -> BoxFuture<'_, Option<Reservation>>;

    /// All reservations currently `active`.
    ///
    /// # Errors
    ///
    /// Storage failures.
    fn list_active_reservations(&self) -> BoxFuture<'_, Vec<Reservation>>;

    /// Up to `limit` active reservations with `expires_at < now`, oldest first.
    ///
    /// # Errors
    ///
    /// Storage failures.
    fn list_stale_reservations(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> BoxFuture<'_, Vec<Reservation>>;

    /// Sum of `share_count` over active reservations on a lot.
    ///
    /// # Errors
    ///
    /// Storage failures.
    fn active_load(&self, lot_id: LotId) -> BoxFuture<'_, u32>;

    /// Move an `active` reservation to the terminal status `to` and return
    /// its shares to the lot, as one atomic step.
    ///
    /// Returns the updated record, or `None` if the reservation is missing or
    /// already terminal (another path won). When this returns an error nothing
    /// changed, so the call can be retried.
    ///
    /// # Errors
    ///
    /// Storage failures.
    fn end_reservation(
        &self,
        transaction_id: &TransactionId,
        to: ReservationStatus,
    ) -> BoxFuture<'_, Option<Reservation>>;

    /// Change the share count of an `active` reservation and move the
    /// difference through the lot counter, as one atomic step. Growing is
    /// guarded like [`Datastore::conditional_allocate`].
    ///
    /// # Errors
    ///
    /// Storage failures. Business rejections are reported through [`ResizeOutcome`].
    fn resize_reservation(
        &self,
        transaction_id: &TransactionId,
        new_count: u32,
    ) -> BoxFuture<'_, ResizeOutcome>;

    /// In one transaction: check the reservation is `active`, check lot
    /// capacity, insert `records` and mark the reservation `completed`.
    ///
    /// # Errors
    ///
    /// Storage failures. Business rejections are reported through [`CommitOutcome`].
    fn commit_ownership(
        &self,
        transaction_id: &TransactionId,
        records: Vec<OwnershipRecord>,
    ) -> BoxFuture<'_, CommitOutcome>;

    /// Ownership records on a lot.
    ///
    /// # Errors
    ///
    /// Storage failures.
    fn list_ownership(&self, lot_id: LotId) -> BoxFuture<'_, Vec<OwnershipRecord>>;

    /// Subscribe to raw row changes on `lots` and `reservations`.
    ///
    /// # Errors
    ///
    /// Returns an error if the subscription cannot be established.
    fn row_changes(&self) -> BoxFuture<'_, RowChangeStream>;
}
