//! Reservation lifecycle: idempotent termination, expiry, finalize and the
//! complete buy-out of a lot.

#![allow(clippy::unwrap_used)] // Test code

use hisse_core::backend::ReservationBackend;
use hisse_core::{LotId, ReservationError, ReservationStatus, TransactionId};
use hisse_runtime::RetryPolicy;
use hisse_server::ReservationService;
use hisse_server::sweeper::ExpirySweeper;
use hisse_testing::fixtures::holders;
use hisse_testing::{InMemoryDatastore, ManualClock, test_time};
use std::sync::Arc;
use std::time::Duration;

struct World {
    clock: ManualClock,
    datastore: Arc<InMemoryDatastore>,
    service: ReservationService,
    lot: LotId,
}

fn world() -> World {
    let clock = ManualClock::at(test_time());
    let datastore = Arc::new(InMemoryDatastore::new(Arc::new(clock.clone())));
    let lot = datastore.seed_lot(1, 10_000).id;
    let service = ReservationService::builder(datastore.clone())
        .clock(Arc::new(clock.clone()))
        .hold_duration(chrono::Duration::minutes(10))
        .read_retry(RetryPolicy::none())
        .build();
    World {
        clock,
        datastore,
        service,
        lot,
    }
}

impl World {
    fn unallocated(&self) -> u32 {
        self.datastore.lot(self.lot).unwrap().unallocated_shares
    }
}

#[tokio::test]
async fn cancel_and_timeout_release_once() {
    let w = world();
    let txn = TransactionId::generate();
    w.service.create_reservation(txn.clone(), w.lot, 3).await.unwrap();
    assert_eq!(w.unallocated(), 4);

    let first = w.service.cancel_reservation(txn.clone()).await.unwrap();
    let second = w.service.cancel_reservation(txn.clone()).await.unwrap();
    let late_timeout = w.service.mark_timed_out(txn.clone()).await.unwrap();

    assert_eq!(first.status, ReservationStatus::Canceled);
    assert_eq!(second, first);
    // The first transition out of active is authoritative
    assert_eq!(late_timeout.status, ReservationStatus::Canceled);
    assert_eq!(w.unallocated(), 7);
}

#[tokio::test]
async fn timeout_twice_is_a_no_op() {
    let w = world();
    let txn = TransactionId::generate();
    w.service.create_reservation(txn.clone(), w.lot, 2).await.unwrap();

    w.service.mark_timed_out(txn.clone()).await.unwrap();
    let again = w.service.mark_timed_out(txn.clone()).await.unwrap();

    assert_eq!(again.status, ReservationStatus::TimedOut);
    assert_eq!(w.unallocated(), 7);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_terminations_release_once() {
    let w = world();
    let txn = TransactionId::generate();
    w.service.create_reservation(txn.clone(), w.lot, 3).await.unwrap();
    let backend: Arc<dyn ReservationBackend> = Arc::new(w.service.clone());

    let tasks: Vec<_> = (0..8)
        .map(|i| {
            let backend = backend.clone();
            let txn = txn.clone();
            tokio::spawn(async move {
                if i % 2 == 0 {
                    backend.cancel_reservation(txn).await
                } else {
                    backend.mark_timed_out(txn).await
                }
            })
        })
        .collect();
    let mut statuses = Vec::new();
    for task in tasks {
        statuses.push(task.await.unwrap().unwrap().status);
    }

    statuses.dedup();
    assert_eq!(statuses.len(), 1, "every caller sees the winning status");
    assert_eq!(w.unallocated(), 7);
}

#[tokio::test]
async fn unknown_token_cannot_be_canceled() {
    let w = world();
    let err = w
        .service
        .cancel_reservation(TransactionId::generate())
        .await
        .unwrap_err();
    assert!(matches!(err, ReservationError::ReservationNotFound(_)));
}

#[tokio::test]
async fn sweeper_expires_abandoned_holds_within_one_pass() {
    let w = world();
    let txn = TransactionId::generate();
    w.service.create_reservation(txn.clone(), w.lot, 3).await.unwrap();
    let (sweeper, _shutdown) =
        ExpirySweeper::new(w.service.reservations().clone(), Duration::from_secs(30), 100);

    // Not yet due
    sweeper.sweep_once().await.unwrap();
    assert_eq!(w.unallocated(), 4);

    w.clock.advance(chrono::Duration::minutes(10) + chrono::Duration::seconds(1));
    let report = sweeper.sweep_once().await.unwrap();

    assert_eq!(report.expired, vec![txn.clone()]);
    assert_eq!(
        w.datastore.reservation(&txn).unwrap().status,
        ReservationStatus::Expired
    );
    assert_eq!(w.unallocated(), 7);
}

#[tokio::test]
async fn status_read_expires_a_lapsed_hold() {
    let w = world();
    let txn = TransactionId::generate();
    w.service.create_reservation(txn.clone(), w.lot, 2).await.unwrap();

    let view = w.service.reservation_status(txn.clone()).await.unwrap();
    assert_eq!(view.seconds_remaining, 600);

    w.clock.advance(chrono::Duration::minutes(11));
    let view = w.service.reservation_status(txn).await.unwrap();
    assert_eq!(view.status, ReservationStatus::Expired);
    assert_eq!(view.seconds_remaining, 0);
    assert_eq!(w.unallocated(), 7);
}

#[tokio::test]
async fn resizing_keeps_the_original_expiry() {
    let w = world();
    let txn = TransactionId::generate();
    let created = w.service.create_reservation(txn.clone(), w.lot, 2).await.unwrap();

    w.clock.advance(chrono::Duration::minutes(4));
    let grown = w.service.update_share_count(txn.clone(), 5).await.unwrap();
    assert_eq!(grown.expires_at, created.expires_at);
    assert_eq!(w.unallocated(), 2);

    let shrunk = w.service.update_share_count(txn, 1).await.unwrap();
    assert_eq!(shrunk.share_count, 1);
    assert_eq!(w.unallocated(), 6);
}

#[tokio::test]
async fn refused_growth_leaves_the_hold_unchanged() {
    let w = world();
    let txn = TransactionId::generate();
    w.service.create_reservation(txn.clone(), w.lot, 2).await.unwrap();
    w.service
        .create_reservation(TransactionId::generate(), w.lot, 4)
        .await
        .unwrap();

    let err = w.service.update_share_count(txn.clone(), 4).await.unwrap_err();

    assert!(matches!(
        err,
        ReservationError::InsufficientInventory { available: 1, .. }
    ));
    assert_eq!(w.datastore.reservation(&txn).unwrap().share_count, 2);
    assert_eq!(w.unallocated(), 1);
}

#[tokio::test]
async fn finalize_after_any_termination_is_rejected() {
    for end in ["expired", "timed_out", "canceled"] {
        let w = world();
        let txn = TransactionId::generate();
        w.service.create_reservation(txn.clone(), w.lot, 2).await.unwrap();
        match end {
            "expired" => w.clock.advance(chrono::Duration::minutes(11)),
            "timed_out" => {
                w.service.mark_timed_out(txn.clone()).await.unwrap();
            },
            _ => {
                w.service.cancel_reservation(txn.clone()).await.unwrap();
            },
        }

        let err = w.service.finalize(txn.clone(), holders(2)).await.unwrap_err();

        assert!(
            matches!(err, ReservationError::ReservationNotActive { ref status, .. } if status.as_str() == end),
            "{end}: {err:?}"
        );
        assert_eq!(w.datastore.ownership_count(w.lot), 0);
        assert_eq!(w.unallocated(), 7);
    }
}

#[tokio::test]
async fn lot_sells_out_end_to_end() {
    let w = world();
    let t1 = TransactionId::generate();

    let held = w.service.create_reservation(t1.clone(), w.lot, 3).await.unwrap();
    assert_eq!(held.status, ReservationStatus::Active);
    assert_eq!(w.unallocated(), 4);

    let receipt = w.service.finalize(t1.clone(), holders(3)).await.unwrap();
    assert_eq!(receipt.reservation.status, ReservationStatus::Completed);
    assert_eq!(receipt.records.len(), 3);
    assert_eq!(w.datastore.ownership_count(w.lot), 3);
    assert_eq!(w.unallocated(), 4, "finalize does not touch the counter");

    let t2 = TransactionId::generate();
    let err = w
        .service
        .create_reservation(t2.clone(), w.lot, 5)
        .await
        .unwrap_err();
    assert_eq!(
        err,
        ReservationError::InsufficientInventory {
            lot_id: w.lot,
            requested: 5,
            available: 4
        }
    );

    w.service.create_reservation(t2.clone(), w.lot, 4).await.unwrap();
    assert_eq!(w.unallocated(), 0);

    let err = w
        .service
        .create_reservation(TransactionId::generate(), w.lot, 1)
        .await
        .unwrap_err();
    assert!(matches!(err, ReservationError::InsufficientInventory { .. }));

    // Freeing shares makes the lot available again
    w.service.cancel_reservation(t2).await.unwrap();
    w.service
        .create_reservation(TransactionId::generate(), w.lot, 1)
        .await
        .unwrap();
    assert_eq!(w.unallocated(), 3);
}

#[tokio::test]
async fn create_replay_returns_the_same_hold() {
    let w = world();
    let txn = TransactionId::generate();
    let first = w.service.create_reservation(txn.clone(), w.lot, 2).await.unwrap();
    let replay = w.service.create_reservation(txn.clone(), w.lot, 2).await.unwrap();

    assert_eq!(replay, first);
    assert_eq!(w.unallocated(), 5);

    let err = w.service.create_reservation(txn, w.lot, 3).await.unwrap_err();
    assert!(matches!(err, ReservationError::InvalidInput(_)));
}
