//! Classbook admission control: race-free seat booking for scheduled fitness
//! classes.
//!
//! Students ask for seats in capacity-bounded class sessions. The engine
//! guarantees that the number of pending plus confirmed reservations never
//! exceeds the session maximum, that one student holds at most one active
//! reservation per session, and that a session's viability (enough confirmed
//! attendees to run) is decided exactly once at a cutoff before it starts.
//!
//! # Architecture
//!
//! ```text
//!  request_reservation
//!         │
//!         ▼
//!  ┌──────────────┐   no lock   ┌──────────────────┐
//!  │  Admission   │────────────>│    Membership    │
//!  │   Engine     │             │    Validator     │
//!  └──────────────┘             └──────────────────┘
//!         │ session lock
//!         ▼
//!  ┌──────────────┐  effects    ┌──────────────────┐
//!  │ Reservation  │────────────>│   RecordStore    │
//!  │   Reducer    │<────────────│  (write-ahead)   │
//!  └──────────────┘  feedback   └──────────────────┘
//!     │        │
//!     ▼        ▼
//!  SeatLedger  ViabilityMonitor ──> ViabilityNotifier
//! ```
//!
//! A per-session sweeper releases stale pending holds, re-flushes lagging
//! writes and emits the viability decision at the cutoff.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod engine;
pub mod ledger;
pub mod membership;
pub mod memory;
pub mod metrics;
pub mod reservation;
pub mod retry;
pub mod sweeper;
pub mod viability;

pub use config::{AdmissionConfig, ConfirmationPolicy};
pub use engine::AdmissionEngine;
pub use ledger::{HoldState, SeatGrant, SeatLedger};
pub use membership::MembershipValidator;
pub use memory::{InMemoryMembershipStore, InMemoryRecordStore, TracingNotifier};
pub use retry::RetryPolicy;
pub use sweeper::{SweepReport, SweeperHandle};
pub use viability::{ViabilityCheck, ViabilityMonitor};
