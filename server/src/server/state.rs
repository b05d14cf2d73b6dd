//! Application state shared across handlers.

use crate::service::ReservationService;
use axum::extract::FromRef;
use hisse_core::change_feed::ChangeFeed;
use hisse_runtime::metrics::MetricsServer;
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;

/// Cheap to clone; every field is shared
#[derive(Clone)]
pub struct AppState {
    /// Reservation operations
    pub service: Arc<ReservationService>,
    /// Change events pushed to WebSocket clients
    pub feed: Arc<dyn ChangeFeed>,
    /// Installed Prometheus recorder, if any
    pub metrics: Option<Arc<MetricsServer>>,
    /// Open change-feed sockets
    pub websocket_connections: Arc<AtomicUsize>,
    /// Limit on open change-feed sockets
    pub max_websocket_connections: usize,
}

impl AppState {
    /// State without a metrics recorder and the default socket limit
    #[must_use]
    pub fn new(service: ReservationService, feed: Arc<dyn ChangeFeed>) -> Self {
        Self {
            service: Arc::new(service),
            feed,
            metrics: None,
            websocket_connections: Arc::new(AtomicUsize::new(0)),
            max_websocket_connections: 1000,
        }
    }

    /// Serve `/metrics` from `metrics`
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<MetricsServer>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Cap concurrent change-feed sockets
    #[must_use]
    pub const fn with_max_websocket_connections(mut self, max: usize) -> Self {
        self.max_websocket_connections = max;
        self
    }
}

impl FromRef<AppState> for Arc<ReservationService> {
    fn from_ref(state: &AppState) -> Self {
        state.service.clone()
    }
}
