//! Shared harness for the admission integration tests.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use chrono::{DateTime, Duration, Utc};
use classbook_admission::{AdmissionConfig, AdmissionEngine, InMemoryMembershipStore, InMemoryRecordStore};
use classbook_core::types::{
    Capacity, CenterId, ClassSession, InstructorId, MembershipWindow, SessionId, StudentId,
};
use classbook_testing::{FlakyRecordStore, ManualClock, RecordingNotifier};
use std::sync::Arc;

/// Scheduled start of every test session
pub fn start() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2025-06-02T18:00:00Z")
        .unwrap()
        .with_timezone(&Utc)
}

/// Well before the viability cutoff
pub fn early() -> DateTime<Utc> {
    start() - Duration::hours(5)
}

/// Default configuration with millisecond store backoff
pub fn fast_config() -> AdmissionConfig {
    AdmissionConfig {
        store_retry_initial_ms: 1,
        store_retry_max_ms: 5,
        sweep_interval_ms: 10,
        ..AdmissionConfig::default()
    }
}

pub struct Harness {
    pub engine: Arc<AdmissionEngine>,
    pub records: Arc<FlakyRecordStore<InMemoryRecordStore>>,
    pub memberships: Arc<InMemoryMembershipStore>,
    pub notifier: Arc<RecordingNotifier>,
    pub clock: Arc<ManualClock>,
    pub center: CenterId,
}

impl Harness {
    pub fn new(config: AdmissionConfig) -> Self {
        Self::over(config, Arc::new(FlakyRecordStore::new(InMemoryRecordStore::new())))
    }

    /// A second engine over the same stores, as after a restart
    pub fn restarted(&self) -> Self {
        let notifier = Arc::new(RecordingNotifier::new());
        let clock = Arc::new(ManualClock::new(early()));
        let engine = Arc::new(AdmissionEngine::new(
            self.engine.config().clone(),
            self.records.clone(),
            self.memberships.clone(),
            notifier.clone(),
            clock.clone(),
        ));
        Self {
            engine,
            records: self.records.clone(),
            memberships: self.memberships.clone(),
            notifier,
            clock,
            center: self.center,
        }
    }

    fn over(config: AdmissionConfig, records: Arc<FlakyRecordStore<InMemoryRecordStore>>) -> Self {
        let memberships = Arc::new(InMemoryMembershipStore::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let clock = Arc::new(ManualClock::new(early()));
        let engine = Arc::new(AdmissionEngine::new(
            config,
            records.clone(),
            memberships.clone(),
            notifier.clone(),
            clock.clone(),
        ));
        Self {
            engine,
            records,
            memberships,
            notifier,
            clock,
            center: CenterId::new(),
        }
    }

    /// Register a session starting at [`start`]
    pub async fn session(&self, min_attendees: u32, max_attendees: u32) -> SessionId {
        let session = ClassSession::new(
            "Evening HIIT",
            "hiit",
            self.center,
            InstructorId::new(),
            start(),
            Capacity::new(min_attendees, max_attendees).unwrap(),
        );
        let session_id = session.id;
        self.engine.register_session(session).await.unwrap();
        session_id
    }

    /// A student whose membership covers the whole test day
    pub fn member(&self) -> StudentId {
        let student = StudentId::new();
        self.memberships.insert(MembershipWindow::for_duration(
            student,
            self.center,
            "monthly",
            start() - Duration::days(10),
            30,
        ));
        student
    }

    /// A student whose membership ended a month ago
    pub fn lapsed_member(&self) -> StudentId {
        let student = StudentId::new();
        self.memberships.insert(MembershipWindow::for_duration(
            student,
            self.center,
            "monthly",
            start() - Duration::days(60),
            30,
        ));
        student
    }
}
