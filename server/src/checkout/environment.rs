//! Dependencies of the checkout reducer.

use crate::config::CheckoutConfig;
use crate::replica::ReplicaCache;
use hisse_core::backend::ReservationBackend;
use hisse_core::environment::Clock;
use std::sync::Arc;
use std::time::Duration;

/// Injected collaborators and countdown settings
#[derive(Clone)]
pub struct CheckoutEnvironment {
    /// Where reservation calls go
    pub backend: Arc<dyn ReservationBackend>,
    /// Time source for the countdown
    pub clock: Arc<dyn Clock>,
    /// Local replica reloaded on errors; inventory is read from the backend without one
    pub replica: Option<Arc<ReplicaCache>>,
    /// Warning thresholds in seconds, descending
    pub warnings: Vec<u64>,
    /// Countdown tick period
    pub tick: Duration,
}

impl CheckoutEnvironment {
    /// Environment with warnings at three minutes and one minute, ticking every second
    #[must_use]
    pub fn new(backend: Arc<dyn ReservationBackend>, clock: Arc<dyn Clock>) -> Self {
        Self {
            backend,
            clock,
            replica: None,
            warnings: vec![180, 60],
            tick: Duration::from_secs(1),
        }
    }

    /// Reload through `replica` instead of reading the backend directly
    #[must_use]
    pub fn with_replica(mut self, replica: Arc<ReplicaCache>) -> Self {
        self.replica = Some(replica);
        self
    }

    /// Take warnings and tick period from configuration
    #[must_use]
    pub fn with_countdown(mut self, config: &CheckoutConfig) -> Self {
        let mut warnings = config.countdown_warnings_secs.clone();
        warnings.sort_unstable_by(|a, b| b.cmp(a));
        warnings.dedup();
        self.warnings = warnings;
        self.tick = config.tick().max(Duration::from_millis(1));
        self
    }
}
