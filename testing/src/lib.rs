//! # Hisse Testing
//!
//! Testing utilities for the Hisse reservation system.
//!
//! This crate provides:
//! - Deterministic clocks (`FixedClock`, `ManualClock`)
//! - An in-memory [`Datastore`](hisse_core::datastore::Datastore) with failure injection
//! - A Given-When-Then harness for reducers
//! - Fixtures and proptest strategies for domain types
//!
//! ## Example
//!
//! ```ignore
//! use hisse_testing::{InMemoryDatastore, ManualClock};
//!
//! #[tokio::test]
//! async fn holds_expire() {
//!     let clock = ManualClock::at(test_time());
//!     let datastore = InMemoryDatastore::new(Arc::new(clock.clone()));
//!     let lot = datastore.seed_lot(1, 10_000);
//!     // ...
//!     clock.advance(chrono::Duration::minutes(11));
//! }
//! ```

use chrono::{DateTime, Utc};
use hisse_core::environment::Clock;

/// In-memory datastore
pub mod datastore;

/// Reducer test harness
pub mod reducer_test;

/// Mock implementations of environment traits
pub mod mocks {
    use super::{Clock, DateTime, Utc};
    use std::sync::{Arc, Mutex, PoisonError};

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time.
    ///
    /// # Example
    ///
    /// ```
    /// use hisse_testing::mocks::FixedClock;
    /// use hisse_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// assert_eq!(clock.now(), clock.now());
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// A clock tests move forward by hand.
    ///
    /// Clones share the same instant, so a test can keep one handle and give
    /// another to the system under test.
    ///
    /// ```
    /// use hisse_testing::mocks::ManualClock;
    /// use hisse_core::environment::Clock;
    ///
    /// let clock = ManualClock::at(hisse_testing::test_time());
    /// let before = clock.now();
    /// clock.advance(chrono::Duration::seconds(30));
    /// assert_eq!(clock.now() - before, chrono::Duration::seconds(30));
    /// ```
    #[derive(Debug, Clone)]
    pub struct ManualClock {
        time: Arc<Mutex<DateTime<Utc>>>,
    }

    impl ManualClock {
        /// Start at `time`
        #[must_use]
        pub fn at(time: DateTime<Utc>) -> Self {
            Self {
                time: Arc::new(Mutex::new(time)),
            }
        }

        /// Move forward by `by`
        pub fn advance(&self, by: chrono::Duration) {
            let mut time = self.time.lock().unwrap_or_else(PoisonError::into_inner);
            *time += by;
        }

        /// Jump to `time`
        pub fn set(&self, time: DateTime<Utc>) {
            *self.time.lock().unwrap_or_else(PoisonError::into_inner) = time;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.time.lock().unwrap_or_else(PoisonError::into_inner)
        }
    }

    /// Create a default fixed clock for tests (see [`test_time`](super::test_time))
    #[must_use]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(super::test_time())
    }
}

/// Fixtures for common test data
pub mod fixtures {
    use hisse_core::HolderDetails;

    /// `count` holders with distinct names and phones; the first is the purchaser
    #[must_use]
    pub fn holders(count: usize) -> Vec<HolderDetails> {
        (0..count)
            .map(|i| {
                let holder = HolderDetails::new(format!("Holder {}", i + 1), format!("555-01{i:02}"));
                if i == 0 { holder.purchaser() } else { holder }
            })
            .collect()
    }
}

/// Property-based testing strategies
pub mod properties {
    use hisse_core::SHARES_PER_LOT;
    use proptest::prelude::*;

    /// A share count a buyer could legitimately ask for
    pub fn share_count() -> impl Strategy<Value = u32> {
        1..=SHARES_PER_LOT
    }

    /// A burst of concurrent share requests against one lot
    pub fn share_requests(max_len: usize) -> impl Strategy<Value = Vec<u32>> {
        prop::collection::vec(share_count(), 1..=max_len)
    }
}

/// The fixed instant used across tests: 2025-01-01 00:00:00 UTC
#[must_use]
pub fn test_time() -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(1_735_689_600, 0).unwrap_or_default()
}

/// Install a `tracing` subscriber writing to the test harness; repeated calls are harmless
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new("debug"))
        .with_test_writer()
        .try_init();
}

pub use datastore::InMemoryDatastore;
pub use mocks::{FixedClock, ManualClock, test_clock};
pub use reducer_test::{ReducerTest, assertions};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_clock_is_fixed() {
        let clock = test_clock();
        assert_eq!(clock.now(), clock.now());
        assert_eq!(clock.now().to_rfc3339(), "2025-01-01T00:00:00+00:00");
    }

    #[test]
    fn manual_clock_clones_share_time() {
        let clock = ManualClock::at(test_time());
        let handle = clock.clone();
        handle.advance(chrono::Duration::minutes(5));
        assert_eq!(clock.now(), test_time() + chrono::Duration::minutes(5));
    }

    #[test]
    fn first_fixture_holder_is_purchaser() {
        let holders = fixtures::holders(3);
        assert_eq!(holders.len(), 3);
        assert!(holders[0].is_purchaser);
        assert!(!holders[1].is_purchaser);
    }
}
