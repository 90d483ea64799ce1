//! Domain types for class-session admission.
//!
//! Reservations reference their session and student by opaque key only;
//! there are no back-pointer collections. Index lookups live in the
//! session book and the external record store.

use crate::error::AdmissionError;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// ============================================================================
// Identifiers
// ============================================================================

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(Uuid);

        impl $name {
            #[doc = concat!("Creates a new random `", stringify!($name), "`")]
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            #[doc = concat!("Create a `", stringify!($name), "` from a `Uuid`")]
            #[must_use]
            pub const fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Get the inner UUID
            #[must_use]
            pub const fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

define_id!(
    /// Unique identifier for a scheduled class session
    SessionId
);
define_id!(
    /// Opaque key of a student in the identity provider
    StudentId
);
define_id!(
    /// Opaque key of a fitness center
    CenterId
);
define_id!(
    /// Opaque key of an instructor
    InstructorId
);
define_id!(
    /// Unique identifier for a reservation (and its seat hold)
    ReservationId
);

// ============================================================================
// Class sessions
// ============================================================================

/// Attendee bounds of a class session.
///
/// Always satisfies `1 <= min_attendees <= max_attendees`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capacity {
    min_attendees: u32,
    max_attendees: u32,
}

impl Capacity {
    /// Validates and creates attendee bounds.
    ///
    /// # Errors
    ///
    /// Returns [`AdmissionError::InvalidCapacity`] when either bound is zero
    /// or `min_attendees > max_attendees`.
    pub fn new(min_attendees: u32, max_attendees: u32) -> Result<Self, AdmissionError> {
        if min_attendees == 0 || min_attendees > max_attendees {
            return Err(AdmissionError::InvalidCapacity {
                min_attendees,
                max_attendees,
            });
        }
        Ok(Self {
            min_attendees,
            max_attendees,
        })
    }

    /// Minimum confirmed attendees for the session to run
    #[must_use]
    pub const fn min_attendees(&self) -> u32 {
        self.min_attendees
    }

    /// Maximum seats that may be held at once
    #[must_use]
    pub const fn max_attendees(&self) -> u32 {
        self.max_attendees
    }
}

/// One scheduled instance of a class.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassSession {
    /// Session identifier
    pub id: SessionId,
    /// Class title
    pub title: String,
    /// Kind of exercise (yoga, pilates, ...)
    pub exercise_type: String,
    /// Center hosting the session
    pub center_id: CenterId,
    /// Instructor teaching the session
    pub instructor_id: InstructorId,
    /// Scheduled start
    pub schedule: DateTime<Utc>,
    /// Attendee bounds
    pub capacity: Capacity,
}

impl ClassSession {
    /// Creates a session with a fresh id.
    #[must_use]
    pub fn new(
        title: impl Into<String>,
        exercise_type: impl Into<String>,
        center_id: CenterId,
        instructor_id: InstructorId,
        schedule: DateTime<Utc>,
        capacity: Capacity,
    ) -> Self {
        Self {
            id: SessionId::new(),
            title: title.into(),
            exercise_type: exercise_type.into(),
            center_id,
            instructor_id,
            schedule,
            capacity,
        }
    }

    /// Whether the session has started at `now`
    #[must_use]
    pub fn has_started(&self, now: DateTime<Utc>) -> bool {
        now >= self.schedule
    }
}

// ============================================================================
// Reservations
// ============================================================================

/// Lifecycle status of a reservation.
///
/// `Pending` and `Confirmed` hold a seat; `Rejected` and `Canceled` are terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReservationStatus {
    /// Seat held, confirmation not yet complete
    Pending,
    /// Seat confirmed
    Confirmed,
    /// Request refused; never held a seat or the hold was dropped
    Rejected,
    /// Canceled by the holder or an operator
    Canceled,
}

impl ReservationStatus {
    /// Terminal statuses are never left again
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Rejected | Self::Canceled)
    }

    /// Transition guard of the reservation state machine
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Confirmed | Self::Rejected | Self::Canceled)
                | (Self::Confirmed, Self::Canceled)
        )
    }
}

impl fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Confirmed => write!(f, "confirmed"),
            Self::Rejected => write!(f, "rejected"),
            Self::Canceled => write!(f, "canceled"),
        }
    }
}

/// Why a booking request did not end in a confirmed seat.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RejectionReason {
    /// No seat available
    CapacityExceeded,
    /// No membership covering the booking time
    MembershipInvalid,
    /// The student already holds a pending or confirmed reservation
    DuplicateReservation,
    /// The session has already started
    BookingClosed,
    /// The session was closed by an operator
    SessionClosed,
    /// A pending hold was not confirmed in time
    HoldExpired,
    /// An operator declined the pending reservation
    Declined,
    /// The confirmation could not be written durably; the hold was dropped
    ConfirmationFailed,
    /// The hold was canceled while its confirmation was in flight
    CanceledInFlight,
}

impl RejectionReason {
    /// Stable label used in logs and metrics
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::CapacityExceeded => "capacity_exceeded",
            Self::MembershipInvalid => "membership_invalid",
            Self::DuplicateReservation => "duplicate_reservation",
            Self::BookingClosed => "booking_closed",
            Self::SessionClosed => "session_closed",
            Self::HoldExpired => "hold_expired",
            Self::Declined => "declined",
            Self::ConfirmationFailed => "confirmation_failed",
            Self::CanceledInFlight => "canceled_in_flight",
        }
    }
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One student's claim on a seat in a class session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    /// Reservation identifier
    pub id: ReservationId,
    /// Student holding the reservation
    pub student_id: StudentId,
    /// Session the seat belongs to
    pub session_id: SessionId,
    /// Current status
    pub status: ReservationStatus,
    /// Set when `status` is `Rejected`
    pub rejection: Option<RejectionReason>,
    /// When the request arrived
    pub requested_at: DateTime<Utc>,
    /// When the request was confirmed or rejected
    pub decided_at: Option<DateTime<Utc>>,
    /// When the reservation was canceled
    pub canceled_at: Option<DateTime<Utc>>,
}

impl Reservation {
    /// A freshly granted seat hold
    #[must_use]
    pub const fn pending(
        id: ReservationId,
        student_id: StudentId,
        session_id: SessionId,
        requested_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            student_id,
            session_id,
            status: ReservationStatus::Pending,
            rejection: None,
            requested_at,
            decided_at: None,
            canceled_at: None,
        }
    }

    /// A request refused before any seat was held
    #[must_use]
    pub const fn rejected(
        id: ReservationId,
        student_id: StudentId,
        session_id: SessionId,
        reason: RejectionReason,
        requested_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            student_id,
            session_id,
            status: ReservationStatus::Rejected,
            rejection: Some(reason),
            requested_at,
            decided_at: Some(requested_at),
            canceled_at: None,
        }
    }

    /// Pending or confirmed
    #[must_use]
    pub const fn is_active(&self) -> bool {
        !self.status.is_terminal()
    }
}

// ============================================================================
// Memberships
// ============================================================================

/// Validity window of a student's membership at one center.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipWindow {
    /// Member
    pub student_id: StudentId,
    /// Center the membership is valid at
    pub center_id: CenterId,
    /// Membership kind (monthly, ten-class pass, ...)
    pub kind: String,
    /// First instant covered
    pub valid_from: DateTime<Utc>,
    /// Last instant covered
    pub valid_to: DateTime<Utc>,
}

impl MembershipWindow {
    /// Window covering `duration_days` whole days from `valid_from`
    #[must_use]
    pub fn for_duration(
        student_id: StudentId,
        center_id: CenterId,
        kind: impl Into<String>,
        valid_from: DateTime<Utc>,
        duration_days: u32,
    ) -> Self {
        Self {
            student_id,
            center_id,
            kind: kind.into(),
            valid_from,
            valid_to: valid_from + Duration::days(i64::from(duration_days)),
        }
    }

    /// Whether `at` lies within `[valid_from, valid_to]`
    #[must_use]
    pub fn covers(&self, at: DateTime<Utc>) -> bool {
        self.valid_from <= at && at <= self.valid_to
    }
}

// ============================================================================
// Outcomes
// ============================================================================

/// Whether a session meets its minimum-attendee threshold.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Viability {
    /// Cutoff not reached; not final
    Undetermined,
    /// Enough confirmed attendees at the cutoff
    Viable,
    /// Too few confirmed attendees at the cutoff
    NonViable,
}

impl Viability {
    /// Whether this outcome is frozen
    #[must_use]
    pub const fn is_final(self) -> bool {
        !matches!(self, Self::Undetermined)
    }

    /// Stable label used in logs and metrics
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Undetermined => "undetermined",
            Self::Viable => "viable",
            Self::NonViable => "non_viable",
        }
    }
}

impl fmt::Display for Viability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Seat accounting snapshot of one session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeatStatus {
    /// Confirmed seats
    pub confirmed: u32,
    /// Pending holds
    pub pending: u32,
    /// Seats released by cancellation so far
    pub canceled: u32,
    /// `max - confirmed - pending`
    pub available: u32,
    /// Maximum attendees
    pub max_attendees: u32,
    /// Minimum attendees
    pub min_attendees: u32,
}

/// Result of a booking request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReservationOutcome {
    /// Seat confirmed
    Confirmed {
        /// The confirmed reservation
        reservation_id: ReservationId,
    },
    /// Seat held, awaiting operator approval
    Pending {
        /// The pending reservation
        reservation_id: ReservationId,
    },
    /// Request refused
    Rejected {
        /// The rejected reservation, or the existing one for duplicates.
        /// `None` when the request was refused before a record was made.
        reservation_id: Option<ReservationId>,
        /// Why
        reason: RejectionReason,
    },
}

impl ReservationOutcome {
    /// Whether a seat was confirmed
    #[must_use]
    pub const fn is_confirmed(&self) -> bool {
        matches!(self, Self::Confirmed { .. })
    }

    /// The rejection reason, if any
    #[must_use]
    pub const fn rejection(&self) -> Option<RejectionReason> {
        match self {
            Self::Rejected { reason, .. } => Some(*reason),
            _ => None,
        }
    }

    /// The reservation the outcome refers to
    #[must_use]
    pub const fn reservation_id(&self) -> Option<ReservationId> {
        match self {
            Self::Confirmed { reservation_id } | Self::Pending { reservation_id } => {
                Some(*reservation_id)
            }
            Self::Rejected { reservation_id, .. } => *reservation_id,
        }
    }
}

/// Result of a cancellation request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CancelOutcome {
    /// The seat was released
    Canceled {
        /// When the cancellation took effect
        canceled_at: DateTime<Utc>,
    },
    /// Nothing changed; the reservation had already ended
    AlreadyTerminal {
        /// The terminal status it ended in
        status: ReservationStatus,
    },
}
