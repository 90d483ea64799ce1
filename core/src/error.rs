//! Error types for admission control.
//!
//! Capacity, eligibility and duplicate-booking refusals are *outcomes*
//! ([`crate::types::RejectionReason`]), not errors. The types here are the
//! faults: caller bugs, broken invariants and store failures.

use crate::types::{ReservationId, ReservationStatus, SessionId};
use thiserror::Error;

/// Failure talking to an external store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The operation may succeed if retried
    #[error("transient store failure: {0}")]
    Transient(String),

    /// The store refused or cannot serve the operation
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Whether a retry may help
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// A seat operation addressed a hold that does not exist or is in the wrong
/// state. Always a caller bug, never a capacity condition.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid hold state for reservation {hold}: {detail}")]
pub struct InvalidHoldState {
    /// The hold that was addressed
    pub hold: ReservationId,
    /// What was wrong with it
    pub detail: &'static str,
}

/// Faults surfaced by the admission engine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdmissionError {
    /// No session with this id is registered or stored
    #[error("class session {0} not found")]
    SessionNotFound(SessionId),

    /// No reservation with this id is known
    #[error("reservation {0} not found")]
    ReservationNotFound(ReservationId),

    /// Attendee bounds violate `1 <= min <= max`
    #[error("invalid capacity: min {min_attendees}, max {max_attendees}")]
    InvalidCapacity {
        /// Requested minimum
        min_attendees: u32,
        /// Requested maximum
        max_attendees: u32,
    },

    /// Capacity edits are refused once seats are confirmed or when the new
    /// maximum is below the seats already held
    #[error("capacity of session {session_id} is locked: {reason}")]
    CapacityLocked {
        /// Session whose capacity was edited
        session_id: SessionId,
        /// Why the edit was refused
        reason: &'static str,
    },

    /// Cancellation attempted at or after the scheduled start
    #[error("reservation {0} can no longer be canceled: the session has started")]
    CancellationClosed(ReservationId),

    /// Approval or decline addressed a reservation that is not pending
    #[error("reservation {reservation_id} is {status}, expected pending")]
    NotPending {
        /// Addressed reservation
        reservation_id: ReservationId,
        /// Its current status
        status: ReservationStatus,
    },

    /// Internal invariant violation in seat accounting
    #[error(transparent)]
    InvalidHoldState(#[from] InvalidHoldState),

    /// A store failure that survived the retry budget
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl AdmissionError {
    /// Whether this error signals a bug or an infrastructure fault rather
    /// than a refused request
    #[must_use]
    pub const fn is_system_fault(&self) -> bool {
        matches!(self, Self::InvalidHoldState(_) | Self::Store(_))
    }
}
