//! Client replica cache: a local copy of lots and active holds.
//!
//! A replica is a pure consumer of the change feed. Each event is treated as
//! the latest known state of its row and overwrites the local copy, so
//! duplicated or replayed events are harmless. A deleted lot, or a gap in the
//! feed, triggers a full reload instead of a patch.

use futures::StreamExt;
use hisse_core::backend::ReservationBackend;
use hisse_core::change_feed::{ChangeEvent, ChangeFeed, FeedError, Topic};
use hisse_core::datastore::ChangeOp;
use hisse_core::{Lot, LotId, Reservation, ReservationError, TransactionId};
use hisse_runtime::RetryPolicy;
use hisse_runtime::metrics::FeedMetrics;
use hisse_runtime::retry::retry_read;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::watch;

/// What applying one event requires next
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The local copy now reflects the event
    Applied,
    /// The event cannot be patched in; reload everything
    NeedsResync,
}

#[derive(Default)]
struct ReplicaState {
    lots: HashMap<LotId, Lot>,
    holds: HashMap<TransactionId, Reservation>,
}

/// Local read model fed by the change feed
pub struct ReplicaCache {
    state: RwLock<ReplicaState>,
    backend: Arc<dyn ReservationBackend>,
    read_retry: RetryPolicy,
}

impl ReplicaCache {
    /// Create an empty replica that reloads through `backend`
    #[must_use]
    pub fn new(backend: Arc<dyn ReservationBackend>) -> Self {
        Self {
            state: RwLock::new(ReplicaState::default()),
            backend,
            read_retry: RetryPolicy::default(),
        }
    }

    /// Use `policy` for reload reads
    #[must_use]
    pub fn with_read_retry(mut self, policy: RetryPolicy) -> Self {
        self.read_retry = policy;
        self
    }

    /// Overwrite the local copy of the row named by `event`.
    pub fn apply(&self, event: &ChangeEvent) -> ApplyOutcome {
        let mut state = self.write();
        match event {
            ChangeEvent::Lot {
                op: ChangeOp::Delete,
                row,
            } => {
                tracing::debug!(lot_id = %row.id, "Lot deleted, replica needs reload");
                ApplyOutcome::NeedsResync
            },
            ChangeEvent::Lot { row, .. } => {
                state.lots.insert(row.id, row.clone());
                ApplyOutcome::Applied
            },
            ChangeEvent::Reservation { op, row } => {
                if *op == ChangeOp::Delete || !row.is_active() {
                    state.holds.remove(&row.transaction_id);
                } else {
                    state.holds.insert(row.transaction_id.clone(), row.clone());
                }
                ApplyOutcome::Applied
            },
        }
    }

    /// Replace the local copy with a fresh read of lots and active holds.
    ///
    /// # Errors
    ///
    /// Backend failures that persist through retries; the previous copy is kept.
    pub async fn resync(&self) -> Result<(), ReservationError> {
        let lots = retry_read(self.read_retry.clone(), || self.backend.list_lots()).await?;
        let holds = retry_read(self.read_retry.clone(), || {
            self.backend.list_active_reservations()
        })
        .await?;

        let mut state = self.write();
        state.lots = lots.into_iter().map(|lot| (lot.id, lot)).collect();
        state.holds = holds
            .into_iter()
            .map(|r| (r.transaction_id.clone(), r))
            .collect();
        FeedMetrics::record_resync();
        tracing::debug!(lots = state.lots.len(), holds = state.holds.len(), "Replica reloaded");
        Ok(())
    }

    /// Lots ordered by sequence number
    #[must_use]
    pub fn lots(&self) -> Vec<Lot> {
        let mut lots: Vec<Lot> = self.read().lots.values().cloned().collect();
        lots.sort_by_key(|l| l.sequence_no);
        lots
    }

    /// One lot
    #[must_use]
    pub fn lot(&self, lot_id: LotId) -> Option<Lot> {
        self.read().lots.get(&lot_id).cloned()
    }

    /// Unallocated shares of a lot, as last seen
    #[must_use]
    pub fn available(&self, lot_id: LotId) -> Option<u32> {
        self.read().lots.get(&lot_id).map(|l| l.unallocated_shares)
    }

    /// Shares held by active checkouts on a lot ("being purchased"), leaving
    /// out the hold named by `exclude` so a buyer sees only the others.
    #[must_use]
    pub fn being_purchased(&self, lot_id: LotId, exclude: Option<&TransactionId>) -> u32 {
        self.read()
            .holds
            .values()
            .filter(|r| r.lot_id == lot_id && Some(&r.transaction_id) != exclude)
            .map(|r| r.share_count)
            .sum()
    }

    /// An active hold, as last seen
    #[must_use]
    pub fn hold(&self, transaction_id: &TransactionId) -> Option<Reservation> {
        self.read().holds.get(transaction_id).cloned()
    }

    /// Subscribe, load, then follow `feed` until the shutdown signal flips to
    /// `true` or the feed closes. Lag and lot deletions trigger a reload.
    ///
    /// The subscription opens before the load, so a change committed while
    /// loading is either in the snapshot or queued on the stream.
    pub async fn follow(&self, feed: Arc<dyn ChangeFeed>, mut shutdown: watch::Receiver<bool>) {
        let mut events = match feed.subscribe(&[Topic::Lot, Topic::Reservation]).await {
            Ok(events) => events,
            Err(error) => {
                tracing::error!(%error, "Replica could not subscribe to the change feed");
                return;
            },
        };

        if let Err(error) = self.resync().await {
            tracing::warn!(%error, "Initial replica load failed");
        }

        while !*shutdown.borrow() {
            tokio::select! {
                item = events.next() => {
                    let needs_resync = match item {
                        Some(Ok(event)) => self.apply(&event) == ApplyOutcome::NeedsResync,
                        Some(Err(FeedError::Lagged(skipped))) => {
                            tracing::warn!(skipped, "Replica fell behind the change feed");
                            true
                        },
                        Some(Err(error)) => {
                            tracing::warn!(%error, "Change feed error");
                            false
                        },
                        None => break,
                    };
                    if needs_resync {
                        if let Err(error) = self.resync().await {
                            tracing::warn!(%error, "Replica reload failed");
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::debug!("Replica stopped following the change feed");
    }

    fn read(&self) -> RwLockReadGuard<'_, ReplicaState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, ReplicaState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)] // Test code

    use super::*;
    use crate::service::ReservationService;
    use hisse_core::ReservationStatus;
    use hisse_core::change_feed::ChangeStream;
    use hisse_core::datastore::Datastore;
    use hisse_runtime::BroadcastChangeFeed;
    use std::future::Future;
    use std::pin::Pin;
    use hisse_testing::{InMemoryDatastore, test_clock, test_time};

    fn setup() -> (Arc<InMemoryDatastore>, ReplicaCache) {
        let datastore = Arc::new(InMemoryDatastore::new(Arc::new(test_clock())));
        let service = ReservationService::builder(datastore.clone())
            .clock(Arc::new(test_clock()))
            .read_retry(RetryPolicy::none())
            .build();
        let replica = ReplicaCache::new(Arc::new(service)).with_read_retry(RetryPolicy::none());
        (datastore, replica)
    }

    fn hold(lot_id: LotId, shares: u32) -> Reservation {
        Reservation::new(
            TransactionId::generate(),
            lot_id,
            shares,
            test_time(),
            chrono::Duration::minutes(10),
        )
    }

    #[tokio::test]
    async fn resync_loads_lots_and_active_holds() {
        let (datastore, replica) = setup();
        let lot = datastore.seed_lot(1, 10_000);

        replica.resync().await.unwrap();

        assert_eq!(replica.lots(), vec![lot.clone()]);
        assert_eq!(replica.available(lot.id), Some(7));
        assert_eq!(replica.being_purchased(lot.id, None), 0);
    }

    #[test]
    fn events_overwrite_rows_and_drop_ended_holds() {
        let (_, replica) = setup();
        let mut lot = Lot::new(1, 10_000, test_time());
        replica.apply(&ChangeEvent::Lot {
            op: ChangeOp::Insert,
            row: lot.clone(),
        });
        lot.unallocated_shares = 4;
        let outcome = replica.apply(&ChangeEvent::Lot {
            op: ChangeOp::Update,
            row: lot.clone(),
        });
        assert_eq!(outcome, ApplyOutcome::Applied);
        assert_eq!(replica.available(lot.id), Some(4));

        let mut r = hold(lot.id, 3);
        replica.apply(&ChangeEvent::Reservation {
            op: ChangeOp::Insert,
            row: r.clone(),
        });
        // A replayed event changes nothing
        replica.apply(&ChangeEvent::Reservation {
            op: ChangeOp::Insert,
            row: r.clone(),
        });
        assert_eq!(replica.being_purchased(lot.id, None), 3);

        r.status = ReservationStatus::Canceled;
        replica.apply(&ChangeEvent::Reservation {
            op: ChangeOp::Update,
            row: r.clone(),
        });
        assert_eq!(replica.being_purchased(lot.id, None), 0);
        assert!(replica.hold(&r.transaction_id).is_none());
    }

    #[test]
    fn being_purchased_can_leave_out_the_callers_hold() {
        let (_, replica) = setup();
        let lot_id = LotId::new();
        let mine = hold(lot_id, 2);
        let theirs = hold(lot_id, 3);
        for r in [&mine, &theirs] {
            replica.apply(&ChangeEvent::Reservation {
                op: ChangeOp::Insert,
                row: r.clone(),
            });
        }

        assert_eq!(replica.being_purchased(lot_id, None), 5);
        assert_eq!(replica.being_purchased(lot_id, Some(&mine.transaction_id)), 3);
    }

    #[test]
    fn lot_delete_requests_reload() {
        let (_, replica) = setup();
        let lot = Lot::new(1, 10_000, test_time());
        let outcome = replica.apply(&ChangeEvent::Lot {
            op: ChangeOp::Delete,
            row: lot,
        });
        assert_eq!(outcome, ApplyOutcome::NeedsResync);
    }

    #[tokio::test]
    async fn follow_applies_feed_events_and_reloads_on_delete() {
        let (datastore, replica) = setup();
        let replica = Arc::new(replica);
        let kept = datastore.seed_lot(1, 10_000);
        let removed = datastore.seed_lot(2, 10_000);
        let feed = Arc::new(BroadcastChangeFeed::new(16));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let follower = {
            let replica = replica.clone();
            let feed: Arc<dyn ChangeFeed> = feed.clone();
            tokio::spawn(async move { replica.follow(feed, shutdown_rx).await })
        };
        for _ in 0..200 {
            if replica.lots().len() == 2 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert_eq!(replica.lots().len(), 2);

        let mut updated = kept.clone();
        updated.unallocated_shares = 2;
        feed.publish(ChangeEvent::Lot {
            op: ChangeOp::Update,
            row: updated,
        })
        .await
        .unwrap();

        datastore.remove_lot(removed.id);
        feed.publish(ChangeEvent::Lot {
            op: ChangeOp::Delete,
            row: removed,
        })
        .await
        .unwrap();

        for _ in 0..200 {
            if replica.lots().len() == 1 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert_eq!(replica.lots().len(), 1);
        // The reload read the datastore, which never saw the hand-published update
        assert_eq!(replica.available(kept.id), Some(7));

        shutdown_tx.send(true).unwrap();
        follower.await.unwrap();
    }

    /// Feed where a sale lands on `lot` after the replica asks to subscribe
    /// but before the subscription opens
    struct SaleWhileSubscribing {
        inner: BroadcastChangeFeed,
        datastore: Arc<InMemoryDatastore>,
        lot: LotId,
    }

    impl ChangeFeed for SaleWhileSubscribing {
        fn publish(
            &self,
            event: ChangeEvent,
        ) -> Pin<Box<dyn Future<Output = Result<usize, FeedError>> + Send + '_>> {
            self.inner.publish(event)
        }

        fn subscribe(
            &self,
            topics: &[Topic],
        ) -> Pin<Box<dyn Future<Output = Result<ChangeStream, FeedError>> + Send + '_>> {
            let topics = topics.to_vec();
            Box::pin(async move {
                self.datastore.conditional_allocate(self.lot, -3).await.unwrap();
                self.inner.subscribe(&topics).await
            })
        }
    }

    #[tokio::test]
    async fn changes_racing_the_first_load_are_not_lost() {
        let (datastore, replica) = setup();
        let replica = Arc::new(replica);
        let lot = datastore.seed_lot(1, 10_000);
        let feed: Arc<dyn ChangeFeed> = Arc::new(SaleWhileSubscribing {
            inner: BroadcastChangeFeed::new(16),
            datastore: datastore.clone(),
            lot: lot.id,
        });
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let follower = {
            let replica = replica.clone();
            tokio::spawn(async move { replica.follow(feed, shutdown_rx).await })
        };
        for _ in 0..200 {
            if replica.lot(lot.id).is_some() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }

        assert_eq!(replica.available(lot.id), Some(4));

        shutdown_tx.send(true).unwrap();
        follower.await.unwrap();
    }
}
