//! In-memory [`Datastore`] for fast, deterministic tests.
//!
//! All tables live behind one mutex, so every method is atomic with respect
//! to every other, which gives the same guarantees the conditional SQL
//! statements give in production. Row changes to `lots` and `reservations`
//! are broadcast while the lock is held, in mutation order.

use chrono::{DateTime, Utc};
use hisse_core::datastore::{
    AllocationOutcome, BoxFuture, ChangeOp, CommitOutcome, Datastore, ResizeOutcome, RowChange,
    RowChangeStream,
};
use hisse_core::environment::Clock;
use hisse_core::{
    DatastoreError, Lot, LotId, OwnershipRecord, Reservation, ReservationStatus, Serialize,
    TransactionId,
};
use futures::StreamExt;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

const CHANGE_CAPACITY: usize = 4096;

#[derive(Default)]
struct Tables {
    lots: HashMap<LotId, Lot>,
    reservations: HashMap<TransactionId, Reservation>,
    ownership: Vec<OwnershipRecord>,
}

/// Mutex-backed [`Datastore`] with failure injection.
///
/// # Example
///
/// ```
/// use hisse_testing::{InMemoryDatastore, test_clock};
/// use std::sync::Arc;
///
/// let datastore = InMemoryDatastore::new(Arc::new(test_clock()));
/// let lot = datastore.seed_lot(1, 10_000);
/// assert_eq!(datastore.lot(lot.id).map(|l| l.unallocated_shares), Some(7));
/// ```
pub struct InMemoryDatastore {
    tables: Mutex<Tables>,
    changes: broadcast::Sender<RowChange>,
    clock: Arc<dyn Clock>,
    failing_reads: AtomicUsize,
    failing_writes: AtomicUsize,
}

impl InMemoryDatastore {
    /// Create an empty datastore stamping rows with `clock`
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CAPACITY);
        Self {
            tables: Mutex::new(Tables::default()),
            changes,
            clock,
            failing_reads: AtomicUsize::new(0),
            failing_writes: AtomicUsize::new(0),
        }
    }

    /// Insert a fresh, fully unallocated lot and return it
    pub fn seed_lot(&self, sequence_no: u32, unit_price: i64) -> Lot {
        let lot = Lot::new(sequence_no, unit_price, self.clock.now());
        let mut tables = self.lock();
        tables.lots.insert(lot.id, lot.clone());
        self.emit("lots", ChangeOp::Insert, &lot);
        lot
    }

    /// Insert an ownership record directly, bypassing reservations.
    ///
    /// Simulates records written outside the reservation path.
    pub fn seed_ownership(&self, record: OwnershipRecord) {
        self.lock().ownership.push(record);
    }

    /// Delete a lot row
    pub fn remove_lot(&self, lot_id: LotId) -> Option<Lot> {
        let mut tables = self.lock();
        let removed = tables.lots.remove(&lot_id);
        if let Some(lot) = &removed {
            self.emit("lots", ChangeOp::Delete, lot);
        }
        removed
    }

    /// Current state of a lot
    #[must_use]
    pub fn lot(&self, lot_id: LotId) -> Option<Lot> {
        self.lock().lots.get(&lot_id).cloned()
    }

    /// Current state of a reservation
    #[must_use]
    pub fn reservation(&self, transaction_id: &TransactionId) -> Option<Reservation> {
        self.lock().reservations.get(transaction_id).cloned()
    }

    /// Ownership records on a lot
    #[must_use]
    pub fn ownership_count(&self, lot_id: LotId) -> usize {
        self.lock()
            .ownership
            .iter()
            .filter(|r| r.lot_id == lot_id)
            .count()
    }

    /// Shares held by active reservations plus owned shares on a lot
    #[must_use]
    pub fn committed_shares(&self, lot_id: LotId) -> u32 {
        let tables = self.lock();
        let held: u32 = tables
            .reservations
            .values()
            .filter(|r| r.lot_id == lot_id && r.is_active())
            .map(|r| r.share_count)
            .sum();
        let owned = tables.ownership.iter().filter(|r| r.lot_id == lot_id).count();
        held + u32::try_from(owned).unwrap_or(u32::MAX)
    }

    /// Make the next `count` read calls fail with a connection error
    pub fn fail_next_reads(&self, count: usize) {
        self.failing_reads.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` write calls fail with a connection error
    pub fn fail_next_writes(&self, count: usize) {
        self.failing_writes.store(count, Ordering::SeqCst);
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn injected(counter: &AtomicUsize, what: &str) -> Result<(), DatastoreError> {
        let took = counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if took {
            Err(DatastoreError::Connection(format!("injected {what} failure")))
        } else {
            Ok(())
        }
    }

    fn read_gate(&self) -> Result<(), DatastoreError> {
        Self::injected(&self.failing_reads, "read")
    }

    fn write_gate(&self) -> Result<(), DatastoreError> {
        Self::injected(&self.failing_writes, "write")
    }

    fn emit<T: Serialize>(&self, table: &str, op: ChangeOp, row: &T) {
        match serde_json::to_value(row) {
            Ok(row) => {
                let _ = self.changes.send(RowChange {
                    table: table.to_string(),
                    op,
                    row,
                });
            },
            Err(error) => tracing::warn!(%error, table, "Could not encode row change"),
        }
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}

impl Datastore for InMemoryDatastore {
    fn ping(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move { self.read_gate() })
    }

    fn insert_lot(&self, lot: Lot) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.write_gate()?;
            let mut tables = self.lock();
            if tables.lots.contains_key(&lot.id) {
                return Err(DatastoreError::Conflict(format!("lot {} exists", lot.id)));
            }
            self.emit("lots", ChangeOp::Insert, &lot);
            tables.lots.insert(lot.id, lot);
            Ok(())
        })
    }

    fn get_lot(&self, lot_id: LotId) -> BoxFuture<'_, Option<Lot>> {
        Box::pin(async move {
            self.read_gate()?;
            Ok(self.lock().lots.get(&lot_id).cloned())
        })
    }

    fn list_lots(&self) -> BoxFuture<'_, Vec<Lot>> {
        Box::pin(async move {
            self.read_gate()?;
            let mut lots: Vec<Lot> = self.lock().lots.values().cloned().collect();
            lots.sort_by_key(|l| l.sequence_no);
            Ok(lots)
        })
    }

    fn conditional_allocate(&self, lot_id: LotId, delta: i64) -> BoxFuture<'_, AllocationOutcome> {
        Box::pin(async move {
            self.write_gate()?;
            let now = self.now();
            let mut tables = self.lock();
            let Some(lot) = tables.lots.get_mut(&lot_id) else {
                return Ok(AllocationOutcome::UnknownLot);
            };

            let next = i64::from(lot.unallocated_shares) + delta;
            if next < 0 || next > i64::from(lot.total_shares) {
                return Ok(AllocationOutcome::Rejected {
                    unallocated: lot.unallocated_shares,
                });
            }

            lot.unallocated_shares = u32::try_from(next)
                .map_err(|e| DatastoreError::Serialization(e.to_string()))?;
            lot.updated_at = now;
            let updated = lot.clone();
            self.emit("lots", ChangeOp::Update, &updated);
            Ok(AllocationOutcome::Applied(updated))
        })
    }

    fn insert_reservation(&self, reservation: Reservation) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.write_gate()?;
            let mut tables = self.lock();
            if tables.reservations.contains_key(&reservation.transaction_id) {
                return Err(DatastoreError::Conflict(format!(
                    "reservation {} exists",
                    reservation.transaction_id
                )));
            }
            if !tables.lots.contains_key(&reservation.lot_id) {
                return Err(DatastoreError::Conflict(format!(
                    "lot {} does not exist",
                    reservation.lot_id
                )));
            }
            self.emit("reservations", ChangeOp::Insert, &reservation);
            tables
                .reservations
                .insert(reservation.transaction_id.clone(), reservation);
            Ok(())
        })
    }

    fn get_reservation(
        &self,
        transaction_id: &TransactionId,
    ) -> BoxFuture<'_, Option<Reservation>> {
        let transaction_id = transaction_id.clone();
        Box::pin(async move {
            self.read_gate()?;
            Ok(self.lock().reservations.get(&transaction_id).cloned())
        })
    }

    fn list_active_reservations(&self) -> BoxFuture<'_, Vec<Reservation>> {
        Box::pin(async move {
            self.read_gate()?;
            let mut active: Vec<Reservation> = self
                .lock()
                .reservations
                .values()
                .filter(|r| r.is_active())
                .cloned()
                .collect();
            active.sort_by_key(|r| r.created_at);
            Ok(active)
        })
    }

    fn list_stale_reservations(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> BoxFuture<'_, Vec<Reservation>> {
        Box::pin(async move {
            self.read_gate()?;
            let mut stale: Vec<Reservation> = self
                .lock()
                .reservations
                .values()
                .filter(|r| r.is_stale(now))
                .cloned()
                .collect();
            stale.sort_by_key(|r| r.expires_at);
            stale.truncate(limit);
            Ok(stale)
        })
    }

    fn active_load(&self, lot_id: LotId) -> BoxFuture<'_, u32> {
        Box::pin(async move {
            self.read_gate()?;
            Ok(self
                .lock()
                .reservations
                .values()
                .filter(|r| r.lot_id == lot_id && r.is_active())
                .map(|r| r.share_count)
                .sum())
        })
    }

    fn end_reservation(
        &self,
        transaction_id: &TransactionId,
        to: ReservationStatus,
    ) -> BoxFuture<'_, Option<Reservation>> {
        let transaction_id = transaction_id.clone();
        Box::pin(async move {
            self.write_gate()?;
            let now = self.now();
            let mut tables = self.lock();
            let ended = match tables.reservations.get_mut(&transaction_id) {
                Some(reservation) if reservation.is_active() => {
                    reservation.status = to;
                    reservation.clone()
                },
                _ => return Ok(None),
            };
            self.emit("reservations", ChangeOp::Update, &ended);

            if let Some(lot) = tables.lots.get_mut(&ended.lot_id) {
                let next = lot.unallocated_shares.saturating_add(ended.share_count);
                if next <= lot.total_shares {
                    lot.unallocated_shares = next;
                    lot.updated_at = now;
                    let updated = lot.clone();
                    self.emit("lots", ChangeOp::Update, &updated);
                } else {
                    tracing::error!(
                        transaction_id = %ended.transaction_id,
                        shares = ended.share_count,
                        "Release would exceed lot total; counter left unchanged"
                    );
                }
            }
            Ok(Some(ended))
        })
    }

    fn resize_reservation(
        &self,
        transaction_id: &TransactionId,
        new_count: u32,
    ) -> BoxFuture<'_, ResizeOutcome> {
        let transaction_id = transaction_id.clone();
        Box::pin(async move {
            self.write_gate()?;
            let now = self.now();
            let mut tables = self.lock();
            let current = match tables.reservations.get(&transaction_id) {
                Some(r) if r.is_active() => r.clone(),
                other => return Ok(ResizeOutcome::NotActive(other.cloned())),
            };

            let delta = i64::from(current.share_count) - i64::from(new_count);
            if let Some(lot) = tables.lots.get_mut(&current.lot_id) {
                let next = i64::from(lot.unallocated_shares) + delta;
                if next < 0 {
                    return Ok(ResizeOutcome::Rejected {
                        unallocated: lot.unallocated_shares,
                    });
                }
                if next <= i64::from(lot.total_shares) {
                    lot.unallocated_shares = u32::try_from(next)
                        .map_err(|e| DatastoreError::Serialization(e.to_string()))?;
                    lot.updated_at = now;
                    let updated = lot.clone();
                    self.emit("lots", ChangeOp::Update, &updated);
                } else {
                    tracing::error!(
                        transaction_id = %current.transaction_id,
                        released = delta,
                        "Release would exceed lot total; counter left unchanged"
                    );
                }
            } else if delta < 0 {
                return Ok(ResizeOutcome::Rejected { unallocated: 0 });
            }

            let Some(stored) = tables.reservations.get_mut(&transaction_id) else {
                return Ok(ResizeOutcome::NotActive(None));
            };
            stored.share_count = new_count;
            let resized = stored.clone();
            self.emit("reservations", ChangeOp::Update, &resized);
            Ok(ResizeOutcome::Resized(resized))
        })
    }

    fn commit_ownership(
        &self,
        transaction_id: &TransactionId,
        records: Vec<OwnershipRecord>,
    ) -> BoxFuture<'_, CommitOutcome> {
        let transaction_id = transaction_id.clone();
        Box::pin(async move {
            self.write_gate()?;
            let mut tables = self.lock();

            let reservation = match tables.reservations.get(&transaction_id) {
                Some(r) if r.is_active() => r.clone(),
                other => return Ok(CommitOutcome::NotActive(other.cloned())),
            };
            let total = tables
                .lots
                .get(&reservation.lot_id)
                .map_or(0, |lot| lot.total_shares);
            let owned = u32::try_from(
                tables
                    .ownership
                    .iter()
                    .filter(|r| r.lot_id == reservation.lot_id)
                    .count(),
            )
            .unwrap_or(u32::MAX);
            let requested = u32::try_from(records.len()).unwrap_or(u32::MAX);

            if owned.saturating_add(requested) > total {
                return Ok(CommitOutcome::AtCapacity { owned, total });
            }

            tables.ownership.extend(records);
            let Some(stored) = tables.reservations.get_mut(&transaction_id) else {
                return Ok(CommitOutcome::NotActive(None));
            };
            stored.status = ReservationStatus::Completed;
            let completed = stored.clone();
            self.emit("reservations", ChangeOp::Update, &completed);
            Ok(CommitOutcome::Committed(completed))
        })
    }

    fn list_ownership(&self, lot_id: LotId) -> BoxFuture<'_, Vec<OwnershipRecord>> {
        Box::pin(async move {
            self.read_gate()?;
            Ok(self
                .lock()
                .ownership
                .iter()
                .filter(|r| r.lot_id == lot_id)
                .cloned()
                .collect())
        })
    }

    fn row_changes(&self) -> BoxFuture<'_, RowChangeStream> {
        let receiver = self.changes.subscribe();
        Box::pin(async move {
            let stream = BroadcastStream::new(receiver).map(|item| {
                item.map_err(|e| DatastoreError::SubscriptionClosed(e.to_string()))
            });
            Ok(Box::pin(stream) as RowChangeStream)
        })
    }
}

/// Raw JSON image of a row, for tests that feed hand-built changes to the relay
#[must_use]
pub fn row_image<T: Serialize>(row: &T) -> Value {
    serde_json::to_value(row).unwrap_or(Value::Null)
}
