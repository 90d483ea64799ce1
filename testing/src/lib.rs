//! # Classbook Testing
//!
//! Testing utilities and helpers for Classbook admission control.
//!
//! This crate provides:
//! - Deterministic clocks
//! - A recording viability notifier
//! - A record store wrapper with failure injection
//! - [`ReducerTest`], a Given-When-Then harness for reducers
//!
//! ## Example
//!
//! ```ignore
//! use classbook_testing::{FlakyRecordStore, RecordingNotifier, test_clock};
//!
//! #[tokio::test]
//! async fn confirmation_write_failure_releases_the_seat() {
//!     let records = Arc::new(FlakyRecordStore::new(InMemoryRecordStore::new()));
//!     records.fail_next_saves(1);
//!     // build an engine over `records` and book a seat...
//! }
//! ```


pub use reducer_test::{RecordsDecision, ReducerTest, assertions};

/// Mock implementations of environment traits and ports
pub mod mocks {
    use async_trait::async_trait;
    use chrono::{DateTime, Duration, Utc};
    use classbook_core::environment::Clock;
    use classbook_core::error::StoreError;
    use classbook_core::ports::{RecordStore, ViabilityNotifier};
    use classbook_core::types::{ClassSession, Reservation, SessionId, Viability};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Mutex, PoisonError};

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use classbook_testing::mocks::FixedClock;
    /// use classbook_core::environment::Clock;
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

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    ///
    /// # Panics
    ///
    /// This function will panic if the hardcoded timestamp fails to parse,
    /// which should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(
            DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
                .expect("hardcoded timestamp should always parse")
                .with_timezone(&Utc),
        )
    }

    /// Clock a test moves by hand, for sweeper and cutoff scenarios
    #[derive(Debug)]
    pub struct ManualClock {
        time: Mutex<DateTime<Utc>>,
    }

    impl ManualClock {
        /// Clock starting at `time`
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self {
                time: Mutex::new(time),
            }
        }

        /// Move the clock forward
        pub fn advance(&self, by: Duration) {
            let mut time = self.time.lock().unwrap_or_else(PoisonError::into_inner);
            *time += by;
        }

        /// Jump to an instant
        pub fn set(&self, to: DateTime<Utc>) {
            *self.time.lock().unwrap_or_else(PoisonError::into_inner) = to;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.time.lock().unwrap_or_else(PoisonError::into_inner)
        }
    }

    /// One emitted viability decision
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Decided {
        /// Session decided
        pub session_id: SessionId,
        /// Outcome
        pub viability: Viability,
        /// Confirmed head count at the decision
        pub confirmed: u32,
    }

    /// Notifier that records every decision it receives
    #[derive(Debug, Default)]
    pub struct RecordingNotifier {
        decisions: Mutex<Vec<Decided>>,
    }

    impl RecordingNotifier {
        /// Empty recorder
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Decisions received so far, oldest first
        #[must_use]
        pub fn decisions(&self) -> Vec<Decided> {
            self.decisions
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        }
    }

    #[async_trait]
    impl ViabilityNotifier for RecordingNotifier {
        async fn session_decided(&self, session_id: SessionId, viability: Viability, confirmed: u32) {
            self.decisions
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(Decided {
                    session_id,
                    viability,
                    confirmed,
                });
        }
    }

    /// Record store wrapper that fails saves on demand.
    ///
    /// Loads always pass through. Saves fail with [`StoreError::Unavailable`]
    /// while the store is down, or for the next `n` calls after
    /// [`FlakyRecordStore::fail_next_saves`].
    #[derive(Debug)]
    pub struct FlakyRecordStore<S> {
        inner: S,
        down: AtomicBool,
        failures_left: AtomicUsize,
        save_attempts: AtomicUsize,
    }

    impl<S: RecordStore> FlakyRecordStore<S> {
        /// Healthy wrapper around `inner`
        #[must_use]
        pub const fn new(inner: S) -> Self {
            Self {
                inner,
                down: AtomicBool::new(false),
                failures_left: AtomicUsize::new(0),
                save_attempts: AtomicUsize::new(0),
            }
        }

        /// The wrapped store
        #[must_use]
        pub const fn inner(&self) -> &S {
            &self.inner
        }

        /// Fail every save until [`Self::recover`]
        pub fn go_down(&self) {
            self.down.store(true, Ordering::SeqCst);
        }

        /// Stop failing saves
        pub fn recover(&self) {
            self.down.store(false, Ordering::SeqCst);
            self.failures_left.store(0, Ordering::SeqCst);
        }

        /// Fail the next `n` saves
        pub fn fail_next_saves(&self, n: usize) {
            self.failures_left.store(n, Ordering::SeqCst);
        }

        /// Saves attempted so far, failed ones included
        #[must_use]
        pub fn save_attempts(&self) -> usize {
            self.save_attempts.load(Ordering::SeqCst)
        }

        fn check(&self) -> Result<(), StoreError> {
            self.save_attempts.fetch_add(1, Ordering::SeqCst);
            if self.down.load(Ordering::SeqCst) {
                return Err(StoreError::Unavailable("record store is down".into()));
            }
            let injected = self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
                .is_ok();
            if injected {
                return Err(StoreError::Unavailable("injected save failure".into()));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl<S: RecordStore> RecordStore for FlakyRecordStore<S> {
        async fn load_session(
            &self,
            session_id: SessionId,
        ) -> Result<Option<ClassSession>, StoreError> {
            self.inner.load_session(session_id).await
        }

        async fn load_reservations(
            &self,
            session_id: SessionId,
        ) -> Result<Vec<Reservation>, StoreError> {
            self.inner.load_reservations(session_id).await
        }

        async fn save_reservation(&self, reservation: &Reservation) -> Result<(), StoreError> {
            self.check()?;
            self.inner.save_reservation(reservation).await
        }

        async fn save_session(&self, session: &ClassSession) -> Result<(), StoreError> {
            self.check()?;
            self.inner.save_session(session).await
        }
    }
}

// Re-export commonly used items
pub use mocks::{Decided, FixedClock, FlakyRecordStore, ManualClock, RecordingNotifier, test_clock};
