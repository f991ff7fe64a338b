//! # Cinema Testing
//!
//! Testing utilities for the cinema booking core.
//!
//! This crate provides:
//! - Deterministic clocks (`FixedClock`, and `ManualClock` for expiry scenarios)
//! - A predictable verification code generator (`SequentialCodes`)
//! - [`ReducerTest`], a Given-When-Then harness for reducers
//!
//! ## Example
//!
//! ```ignore
//! use cinema_testing::{ManualClock, test_clock};
//!
//! let clock = ManualClock::starting_at(test_clock().now());
//! // ... lock seats with a 15 minute hold ...
//! clock.advance(chrono::Duration::minutes(16));
//! // ... the sweeper now reclaims the hold ...
//! ```

use chrono::{DateTime, Utc};
use cinema_core::environment::{Clock, CodeGenerator};


/// Mock implementations of Environment traits
pub mod mocks {
    use super::{Clock, CodeGenerator, DateTime, Utc};
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::{Arc, Mutex, PoisonError};

    /// Fixed clock for deterministic tests
    ///
    /// # Example
    ///
    /// ```
    /// use cinema_testing::mocks::FixedClock;
    /// use cinema_core::environment::Clock;
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

    /// Clock that only moves when told to.
    ///
    /// Clones share the same instant, so a test can keep one copy and hand
    /// another to the code under test.
    ///
    /// ```
    /// use cinema_testing::mocks::{ManualClock, test_clock};
    /// use cinema_core::environment::Clock;
    ///
    /// let clock = ManualClock::starting_at(test_clock().now());
    /// let shared = clock.clone();
    /// clock.advance(chrono::Duration::minutes(5));
    /// assert_eq!(shared.now(), test_clock().now() + chrono::Duration::minutes(5));
    /// ```
    #[derive(Debug, Clone)]
    pub struct ManualClock {
        time: Arc<Mutex<DateTime<Utc>>>,
    }

    impl ManualClock {
        /// Create a clock frozen at `time`
        #[must_use]
        pub fn starting_at(time: DateTime<Utc>) -> Self {
            Self {
                time: Arc::new(Mutex::new(time)),
            }
        }

        /// Move the clock forward (or backward, with a negative delta)
        pub fn advance(&self, delta: chrono::Duration) {
            let mut time = self.time.lock().unwrap_or_else(PoisonError::into_inner);
            *time += delta;
        }

        /// Jump to an absolute instant
        pub fn set(&self, time: DateTime<Utc>) {
            *self.time.lock().unwrap_or_else(PoisonError::into_inner) = time;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.time.lock().unwrap_or_else(PoisonError::into_inner)
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    ///
    /// # Panics
    ///
    /// Panics if the hardcoded timestamp fails to parse, which cannot happen.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(
            DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
                .expect("hardcoded timestamp should always parse")
                .with_timezone(&Utc),
        )
    }

    /// Verification code generator yielding `<prefix>00000001`, `<prefix>00000002`, ...
    #[derive(Debug)]
    pub struct SequentialCodes {
        prefix: String,
        next: AtomicU64,
    }

    impl SequentialCodes {
        /// Create a generator with the given prefix
        #[must_use]
        pub fn new(prefix: impl Into<String>) -> Self {
            Self {
                prefix: prefix.into(),
                next: AtomicU64::new(1),
            }
        }

        /// Restart numbering, so the next code collides with one already issued
        pub fn rewind(&self) {
            self.next.store(1, Ordering::SeqCst);
        }
    }

    impl Default for SequentialCodes {
        fn default() -> Self {
            Self::new("TKT")
        }
    }

    impl CodeGenerator for SequentialCodes {
        fn generate(&self) -> String {
            let n = self.next.fetch_add(1, Ordering::SeqCst);
            format!("{}{n:08}", self.prefix)
        }
    }
}

pub use mocks::{FixedClock, ManualClock, SequentialCodes, test_clock};
pub use reducer_test::{ReducerTest, assertions};
