//! Prometheus metrics for the reservation system.
//!
//! Covers the ledger, reservation lifecycle, sweeper, change feed and replica
//! resyncs, plus the store's reducer timings.
//!
//! # Example
//!
//! ```rust,no_run
//! use hisse_runtime::metrics::MetricsServer;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new("0.0.0.0:8080".parse()?);
//! server.start()?;
//!
//! // Scrape output for the `/metrics` route
//! let body = server.render();
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

pub use metrics::{counter, gauge, histogram};

/// Errors from installing the exporter
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Exporter configuration was rejected
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Global recorder could not be installed
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Installs the Prometheus recorder and renders the scrape body
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a server description for `addr` (used for logging only)
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Register metric descriptions and install the global recorder.
    ///
    /// # Errors
    ///
    /// Returns an error if the exporter cannot be built or installed. A
    /// recorder that is already installed is tolerated.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let builder = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        match builder.install_recorder() {
            Ok(handle) => {
                self.handle = Some(handle);
                tracing::info!(addr = %self.addr, "Metrics available at http://{}/metrics", self.addr);
                Ok(())
            },
            Err(e) => {
                let err_msg = e.to_string();
                if err_msg.contains("already initialized") {
                    tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
                    Ok(())
                } else {
                    Err(MetricsError::Install(err_msg))
                }
            },
        }
    }

    /// Exporter handle, if installed by this server
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Prometheus text format
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

fn register_metrics() {
    // Ledger
    describe_counter!(
        "hisse_ledger_allocations_total",
        "Conditional allocate attempts by outcome (applied, rejected, unknown_lot)"
    );

    // Reservations
    describe_counter!("hisse_reservations_created_total", "Reservations created");
    describe_counter!(
        "hisse_reservations_rejected_total",
        "Reservation operations rejected, by reason"
    );
    describe_counter!(
        "hisse_reservations_terminated_total",
        "Reservations moved to a terminal status, by status"
    );
    describe_counter!(
        "hisse_ownership_records_created_total",
        "Ownership records committed by finalize"
    );

    // Sweeper
    describe_counter!("hisse_sweeper_expired_total", "Reservations expired by the sweeper");
    describe_histogram!("hisse_sweep_duration_seconds", "Time taken by one sweep pass");

    // Change feed
    describe_counter!(
        "hisse_feed_events_relayed_total",
        "Row changes relayed onto the change feed, by entity"
    );
    describe_counter!(
        "hisse_feed_events_dropped_total",
        "Row changes that could not be normalized"
    );
    describe_counter!("hisse_replica_resyncs_total", "Full replica reloads");
    describe_gauge!("hisse_websocket_connections", "Open change-feed WebSocket connections");

    // Reads
    describe_counter!("hisse_read_retries_total", "Retried idempotent reads");

    // Store
    describe_histogram!("store_reducer_duration_seconds", "Time taken to run a reducer");
    describe_counter!("store_effects_executed_total", "Effects executed, by type");
}

/// Ledger metric helpers
pub struct LedgerMetrics;

impl LedgerMetrics {
    /// Record a conditional allocate outcome
    pub fn record_allocation(outcome: &'static str) {
        counter!("hisse_ledger_allocations_total", "outcome" => outcome).increment(1);
    }
}

/// Reservation lifecycle metric helpers
pub struct ReservationMetrics;

impl ReservationMetrics {
    /// A reservation was created
    pub fn record_created() {
        counter!("hisse_reservations_created_total").increment(1);
    }

    /// An operation was rejected
    pub fn record_rejected(reason: &'static str) {
        counter!("hisse_reservations_rejected_total", "reason" => reason).increment(1);
    }

    /// A reservation reached a terminal status
    pub fn record_terminated(status: &'static str) {
        counter!("hisse_reservations_terminated_total", "status" => status).increment(1);
    }

    /// Ownership records were committed
    pub fn record_ownership(count: usize) {
        counter!("hisse_ownership_records_created_total").increment(count as u64);
    }
}

/// Sweeper metric helpers
pub struct SweeperMetrics;

impl SweeperMetrics {
    /// One sweep pass finished
    pub fn record_sweep(expired: usize, duration: Duration) {
        counter!("hisse_sweeper_expired_total").increment(expired as u64);
        histogram!("hisse_sweep_duration_seconds").record(duration.as_secs_f64());
    }
}

/// Change feed metric helpers
pub struct FeedMetrics;

impl FeedMetrics {
    /// A row change was relayed
    pub fn record_relayed(entity: &'static str) {
        counter!("hisse_feed_events_relayed_total", "entity" => entity).increment(1);
    }

    /// A row change was dropped
    pub fn record_dropped() {
        counter!("hisse_feed_events_dropped_total").increment(1);
    }

    /// A replica reloaded from scratch
    pub fn record_resync() {
        counter!("hisse_replica_resyncs_total").increment(1);
    }

    /// Open change-stream sockets
    #[allow(clippy::cast_precision_loss)] // Connection counts stay far below 2^52
    pub fn record_websocket_connections(count: usize) {
        gauge!("hisse_websocket_connections").set(count as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn helpers_work_without_a_recorder() {
        LedgerMetrics::record_allocation("applied");
        ReservationMetrics::record_created();
        ReservationMetrics::record_rejected("insufficient_inventory");
        ReservationMetrics::record_terminated("canceled");
        ReservationMetrics::record_ownership(3);
        SweeperMetrics::record_sweep(2, Duration::from_millis(5));
        FeedMetrics::record_relayed("lot");
        FeedMetrics::record_dropped();
        FeedMetrics::record_resync();
    }

    #[test]
    fn render_is_none_before_start() {
        let server = MetricsServer::new(SocketAddr::from(([127, 0, 0, 1], 0)));
        assert!(server.render().is_none());
        assert!(server.handle().is_none());
    }
}
