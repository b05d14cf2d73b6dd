//! Expiry sweeper: the authoritative backstop for abandoned holds.
//!
//! Clients cancel on page unload and report their own timeouts, but neither
//! is guaranteed to arrive. The sweeper periodically expires every active
//! reservation whose `expires_at` has passed and returns its shares, using
//! the same compare-and-set transition as every other termination path.

use crate::reservations::{ReservationStore, SweepReport};
use hisse_core::ReservationError;
use hisse_runtime::metrics::SweeperMetrics;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

/// Upper bound on batches drained in one pass
const MAX_BATCHES_PER_PASS: usize = 50;

/// Background task expiring lapsed holds on a fixed interval
pub struct ExpirySweeper {
    reservations: ReservationStore,
    interval: Duration,
    batch_size: usize,
    shutdown: watch::Receiver<bool>,
}

impl ExpirySweeper {
    /// Create a sweeper and the sender that stops it.
    ///
    /// Send `true` on the returned sender to stop [`run`](Self::run).
    #[must_use]
    pub fn new(
        reservations: ReservationStore,
        interval: Duration,
        batch_size: usize,
    ) -> (Self, watch::Sender<bool>) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        (
            Self::with_shutdown(reservations, interval, batch_size, shutdown_rx),
            shutdown_tx,
        )
    }

    /// Create a sweeper stopped by an existing shutdown channel
    #[must_use]
    pub fn with_shutdown(
        reservations: ReservationStore,
        interval: Duration,
        batch_size: usize,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            reservations,
            interval: interval.max(Duration::from_millis(1)),
            batch_size: batch_size.max(1),
            shutdown,
        }
    }

    /// One pass: expire lapsed holds batch by batch until none are left.
    ///
    /// # Errors
    ///
    /// Storage failures while listing candidates.
    pub async fn sweep_once(&self) -> Result<SweepReport, ReservationError> {
        let started = Instant::now();
        let mut total = SweepReport::default();

        for _ in 0..MAX_BATCHES_PER_PASS {
            let batch = self.reservations.sweep_expired(self.batch_size).await?;
            let drained = batch.scanned < self.batch_size || batch.expired.is_empty();

            total.scanned += batch.scanned;
            total.released_shares += batch.released_shares;
            total.failed += batch.failed;
            total.expired.extend(batch.expired);

            if drained {
                break;
            }
        }

        SweeperMetrics::record_sweep(total.expired.len(), started.elapsed());
        Ok(total)
    }

    /// Sweep every interval until the shutdown signal flips to `true`.
    ///
    /// The first pass runs immediately. A failed pass is logged and the
    /// sweeper carries on with the next tick.
    pub async fn run(mut self) {
        tracing::info!(
            interval_secs = self.interval.as_secs_f64(),
            batch_size = self.batch_size,
            "Starting expiry sweeper"
        );

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while !*self.shutdown.borrow() {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(error) = self.sweep_once().await {
                        tracing::error!(%error, "Sweep pass failed");
                    }
                }
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Expiry sweeper stopped");
    }
}
