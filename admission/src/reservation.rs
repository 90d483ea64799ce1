//! Reservation state machine for one class session.
//!
//! ```text
//! Requested ─┬─> Pending ─┬─> Confirmed ──> Canceled
//!            │            ├─> Rejected
//!            │            └─> Canceled
//!            └─> Rejected
//! ```
//!
//! The reducer runs while the engine holds the session lock. It mutates the
//! [`SessionBook`] (seat ledger, reservation rows, viability) and returns
//! effects describing the durable writes, which the engine executes after the
//! lock is released. Write results come back as feedback actions.
//!
//! Confirmation is write-ahead: `ConfirmHold` only schedules the durable
//! write of the confirmed row. The ledger confirms when
//! `ConfirmationWritten` comes back; `ConfirmationFailed` drops the hold so
//! no seat leaks. Capacity edits are write-ahead too: the new bounds apply
//! once the session row is stored. Every other write is best effort: a
//! failed write marks the row unsynced and the sweeper flushes it again later.
//!
//! Before any seat mutation at or after the viability cutoff the reducer
//! freezes the viability decision on the pre-mutation head count, and leaves
//! it in [`SessionBook::announcement`] for the engine to emit.

use crate::ledger::{HoldState, SeatGrant, SeatLedger};
use crate::retry::{RetryPolicy, retry_store};
use crate::viability::{ViabilityCheck, ViabilityMonitor};
use chrono::{DateTime, Duration, Utc};
use classbook_core::effect::Effect;
use classbook_core::error::{AdmissionError, InvalidHoldState, StoreError};
use classbook_core::ports::RecordStore;
use classbook_core::reducer::Reducer;
use classbook_core::types::{
    Capacity, ClassSession, RejectionReason, Reservation, ReservationId, ReservationStatus,
    StudentId,
};
use classbook_core::{SmallVec, smallvec};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

// ============================================================================
// State
// ============================================================================

/// What the reducer decided for the last command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Decision {
    /// A pending hold was granted
    Held(ReservationId),
    /// The hold is confirmed
    Confirmed(ReservationId),
    /// The request was refused
    Rejected {
        /// Rejected reservation, or the existing one for duplicates
        reservation_id: Option<ReservationId>,
        /// Why
        reason: RejectionReason,
    },
    /// The reservation was canceled
    Canceled {
        /// When
        canceled_at: DateTime<Utc>,
    },
    /// Cancel addressed a reservation that had already ended
    AlreadyTerminal(ReservationStatus),
    /// Pending holds released by expiry
    Expired(Vec<ReservationId>),
    /// Reservations canceled by closing the session
    Closed(Vec<ReservationId>),
    /// Session accepts bookings again
    Reopened,
    /// Capacity bounds changed
    Resized(Capacity),
}

/// In-memory book of one class session. Guarded by the session lock.
#[derive(Clone, Debug)]
pub struct SessionBook {
    /// The session being booked
    pub session: ClassSession,
    /// Seat accounting
    pub ledger: SeatLedger,
    /// Frozen viability decision
    pub viability: ViabilityMonitor,
    /// Set by an operator; refuses new bookings
    pub closed: bool,
    /// Outcome of the last command, taken by the engine
    pub last_outcome: Option<Result<Decision, AdmissionError>>,
    /// Viability decided by the last command, taken and emitted by the engine
    pub announcement: Option<ViabilityCheck>,
    reservations: HashMap<ReservationId, Reservation>,
    active: HashMap<StudentId, ReservationId>,
    /// Engine-clock instant each pending hold was granted
    held_since: HashMap<ReservationId, DateTime<Utc>>,
    unsynced: HashSet<ReservationId>,
    session_unsynced: bool,
}

impl SessionBook {
    /// Empty book
    #[must_use]
    pub fn new(session: ClassSession) -> Self {
        Self {
            ledger: SeatLedger::new(session.capacity),
            session,
            viability: ViabilityMonitor::new(),
            closed: false,
            last_outcome: None,
            announcement: None,
            reservations: HashMap::new(),
            active: HashMap::new(),
            held_since: HashMap::new(),
            unsynced: HashSet::new(),
            session_unsynced: false,
        }
    }

    /// Rebuild a book from persisted reservation rows.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidHoldState`] if the rows hold the same seat twice.
    pub fn rebuild(
        session: ClassSession,
        rows: Vec<Reservation>,
    ) -> Result<Self, InvalidHoldState> {
        let mut book = Self::new(session);
        for row in rows {
            match row.status {
                ReservationStatus::Pending => book.ledger.restore(row.id, HoldState::Pending)?,
                ReservationStatus::Confirmed => {
                    book.ledger.restore(row.id, HoldState::Confirmed)?;
                }
                ReservationStatus::Canceled => book.ledger.restore_canceled(),
                ReservationStatus::Rejected => {}
            }
            if row.is_active() {
                book.active.insert(row.student_id, row.id);
            }
            book.reservations.insert(row.id, row);
        }
        Ok(book)
    }

    /// A reservation row
    #[must_use]
    pub fn reservation(&self, id: &ReservationId) -> Option<&Reservation> {
        self.reservations.get(id)
    }

    /// The student's pending or confirmed reservation, if any
    #[must_use]
    pub fn active_reservation(&self, student_id: &StudentId) -> Option<ReservationId> {
        self.active.get(student_id).copied()
    }

    /// All reservation rows
    pub fn reservations(&self) -> impl Iterator<Item = &Reservation> {
        self.reservations.values()
    }

    /// Rows whose last durable write failed
    #[must_use]
    pub fn unsynced(&self) -> usize {
        self.unsynced.len()
    }

    /// Whether every row and the session itself are durably stored
    #[must_use]
    pub fn is_synced(&self) -> bool {
        self.unsynced.is_empty() && !self.session_unsynced
    }

    /// Pending holds older than `hold_timeout` at `now`.
    ///
    /// Age counts from the engine-clock grant instant; holds rebuilt from
    /// the store fall back to their request time.
    #[must_use]
    pub fn stale_holds(&self, now: DateTime<Utc>, hold_timeout: Duration) -> Vec<ReservationId> {
        let mut stale: Vec<ReservationId> = self
            .reservations
            .values()
            .filter(|r| r.status == ReservationStatus::Pending)
            .filter(|r| {
                let held_at = self.held_since.get(&r.id).copied().unwrap_or(r.requested_at);
                held_at + hold_timeout <= now
            })
            .map(|r| r.id)
            .collect();
        stale.sort();
        stale
    }
}

// ============================================================================
// Actions (Commands + Events)
// ============================================================================

/// Inputs of the reservation state machine
#[derive(Clone, Debug)]
pub enum ReservationAction {
    // Commands
    /// A student asks for a seat; `eligible` is the membership check result
    RequestSeat {
        /// Id for the new reservation
        reservation_id: ReservationId,
        /// Requesting student
        student_id: StudentId,
        /// Membership validator answer
        eligible: bool,
        /// Arrival time, as seen by the caller
        requested_at: DateTime<Utc>,
        /// Engine-clock instant the hold ages from
        held_at: DateTime<Utc>,
    },

    /// Confirm a pending hold (auto-confirm, or operator approval)
    ConfirmHold {
        /// Pending reservation
        reservation_id: ReservationId,
        /// Decision time
        at: DateTime<Utc>,
    },

    /// Operator refuses a pending hold
    DeclineHold {
        /// Pending reservation
        reservation_id: ReservationId,
        /// Decision time
        at: DateTime<Utc>,
    },

    /// Holder or operator cancels
    Cancel {
        /// Reservation to cancel
        reservation_id: ReservationId,
        /// Cancellation time
        at: DateTime<Utc>,
    },

    /// Release pending holds older than the hold timeout
    ExpireHolds {
        /// Sweep time
        now: DateTime<Utc>,
    },

    /// Write every unsynced row again
    FlushUnsynced,

    /// Operator closes the session, canceling every active reservation
    CloseSession {
        /// Closing time
        at: DateTime<Utc>,
    },

    /// Operator reopens a closed or non-viable session
    ReopenSession,

    /// Change attendee bounds once the session row is stored
    ResizeCapacity {
        /// New bounds
        capacity: Capacity,
        /// Edit time
        at: DateTime<Utc>,
    },

    // Events
    /// The confirmed row reached the store
    ConfirmationWritten {
        /// Reservation being confirmed
        reservation_id: ReservationId,
        /// Decision time
        at: DateTime<Utc>,
    },

    /// The confirmed row could not be written
    ConfirmationFailed {
        /// Reservation being confirmed
        reservation_id: ReservationId,
        /// Decision time
        at: DateTime<Utc>,
        /// Store failure
        error: StoreError,
    },

    /// A best-effort write succeeded
    RecordSynced {
        /// Row written
        reservation_id: ReservationId,
        /// Status the written row carried
        status: ReservationStatus,
    },

    /// A best-effort write failed
    RecordWriteFailed {
        /// Row that failed
        reservation_id: ReservationId,
        /// Store failure
        error: StoreError,
    },

    /// The session row carrying new bounds reached the store
    CapacityWritten {
        /// Bounds written
        capacity: Capacity,
    },

    /// The session row carrying new bounds could not be written
    CapacityWriteFailed {
        /// Store failure
        error: StoreError,
    },

    /// A best-effort session write succeeded
    SessionSynced {
        /// Bounds the written row carried
        capacity: Capacity,
    },

    /// A best-effort session write failed
    SessionWriteFailed {
        /// Store failure
        error: StoreError,
    },
}

// ============================================================================
// Environment
// ============================================================================

/// Environment dependencies for the reservation reducer
#[derive(Clone)]
pub struct ReservationEnvironment {
    /// Durable record store
    pub records: Arc<dyn RecordStore>,
    /// Backoff for store writes
    pub retry: RetryPolicy,
    /// Lifetime of an unconfirmed hold
    pub hold_timeout: Duration,
    /// How long before the start viability is decided
    pub viability_cutoff: Duration,
}

impl ReservationEnvironment {
    /// Creates a new `ReservationEnvironment`
    #[must_use]
    pub fn new(
        records: Arc<dyn RecordStore>,
        retry: RetryPolicy,
        hold_timeout: Duration,
        viability_cutoff: Duration,
    ) -> Self {
        Self {
            records,
            retry,
            hold_timeout,
            viability_cutoff,
        }
    }

    /// Best-effort write of a row snapshot
    fn persist(&self, row: Reservation) -> Effect<ReservationAction> {
        let records = Arc::clone(&self.records);
        let retry = self.retry;
        Effect::Future(Box::pin(async move {
            let result = retry_store(retry, "save_reservation", || records.save_reservation(&row)).await;
            Some(match result {
                Ok(()) => ReservationAction::RecordSynced {
                    reservation_id: row.id,
                    status: row.status,
                },
                Err(error) => ReservationAction::RecordWriteFailed {
                    reservation_id: row.id,
                    error,
                },
            })
        }))
    }

    /// Write-ahead of a confirmed row
    fn write_confirmation(&self, row: Reservation, at: DateTime<Utc>) -> Effect<ReservationAction> {
        let records = Arc::clone(&self.records);
        let retry = self.retry;
        Effect::Future(Box::pin(async move {
            let result = retry_store(retry, "save_reservation", || records.save_reservation(&row)).await;
            Some(match result {
                Ok(()) => ReservationAction::ConfirmationWritten {
                    reservation_id: row.id,
                    at,
                },
                Err(error) => ReservationAction::ConfirmationFailed {
                    reservation_id: row.id,
                    at,
                    error,
                },
            })
        }))
    }

    /// Write-ahead of a session row carrying new bounds
    fn write_capacity(&self, session: ClassSession) -> Effect<ReservationAction> {
        let records = Arc::clone(&self.records);
        let retry = self.retry;
        Effect::Future(Box::pin(async move {
            let result = retry_store(retry, "save_session", || records.save_session(&session)).await;
            Some(match result {
                Ok(()) => ReservationAction::CapacityWritten {
                    capacity: session.capacity,
                },
                Err(error) => ReservationAction::CapacityWriteFailed { error },
            })
        }))
    }

    /// Best-effort write of the live session row
    fn save_session(&self, session: ClassSession) -> Effect<ReservationAction> {
        let records = Arc::clone(&self.records);
        let retry = self.retry;
        Effect::Future(Box::pin(async move {
            let result = retry_store(retry, "save_session", || records.save_session(&session)).await;
            Some(match result {
                Ok(()) => ReservationAction::SessionSynced {
                    capacity: session.capacity,
                },
                Err(error) => ReservationAction::SessionWriteFailed { error },
            })
        }))
    }
}

// ============================================================================
// Reducer
// ============================================================================

/// Reducer for the reservation state machine
#[derive(Clone, Debug, Default)]
pub struct ReservationReducer;

type Effects = SmallVec<[Effect<ReservationAction>; 4]>;

impl ReservationReducer {
    /// Creates a new `ReservationReducer`
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    fn decide(state: &mut SessionBook, decision: Decision) {
        state.last_outcome = Some(Ok(decision));
    }

    fn fail(state: &mut SessionBook, error: AdmissionError) {
        if let AdmissionError::InvalidHoldState(fault) = &error {
            tracing::error!(session_id = %state.session.id, %fault, "Seat accounting fault");
            crate::metrics::record_invalid_hold_state();
        }
        state.last_outcome = Some(Err(error));
    }

    /// Decide viability on the head count before a seat mutation at `at`.
    /// A no-op before the cutoff or once decided.
    fn freeze_viability(state: &mut SessionBook, env: &ReservationEnvironment, at: DateTime<Utc>) {
        let confirmed = state.ledger.confirmed();
        let check = state
            .viability
            .evaluate(&state.session, confirmed, env.viability_cutoff, at);
        if check.newly_decided {
            state.announcement = Some(check);
        }
    }

    fn request_seat(
        state: &mut SessionBook,
        env: &ReservationEnvironment,
        reservation_id: ReservationId,
        student_id: StudentId,
        eligible: bool,
        requested_at: DateTime<Utc>,
        held_at: DateTime<Utc>,
    ) -> Effects {
        Self::freeze_viability(state, env, requested_at);
        if state.closed {
            Self::decide(state, Decision::Rejected {
                reservation_id: None,
                reason: RejectionReason::SessionClosed,
            });
            return SmallVec::new();
        }
        if state.session.has_started(requested_at) {
            Self::decide(state, Decision::Rejected {
                reservation_id: None,
                reason: RejectionReason::BookingClosed,
            });
            return SmallVec::new();
        }
        if let Some(existing) = state.active.get(&student_id).copied() {
            Self::decide(state, Decision::Rejected {
                reservation_id: Some(existing),
                reason: RejectionReason::DuplicateReservation,
            });
            return SmallVec::new();
        }

        let session_id = state.session.id;
        let grant = if eligible {
            match state.ledger.try_reserve(reservation_id) {
                Ok(grant) => grant,
                Err(fault) => {
                    Self::fail(state, fault.into());
                    return SmallVec::new();
                }
            }
        } else {
            SeatGrant::Denied(RejectionReason::MembershipInvalid)
        };

        let row = match grant {
            SeatGrant::Granted => {
                tracing::debug!(%session_id, %reservation_id, %student_id, "Seat hold granted");
                state.active.insert(student_id, reservation_id);
                state.held_since.insert(reservation_id, held_at);
                Self::decide(state, Decision::Held(reservation_id));
                Reservation::pending(reservation_id, student_id, session_id, requested_at)
            }
            SeatGrant::Denied(reason) => {
                tracing::debug!(%session_id, %reservation_id, %student_id, %reason, "Seat request rejected");
                Self::decide(state, Decision::Rejected {
                    reservation_id: Some(reservation_id),
                    reason,
                });
                Reservation::rejected(reservation_id, student_id, session_id, reason, requested_at)
            }
        };

        state.reservations.insert(reservation_id, row.clone());
        smallvec![env.persist(row)]
    }

    fn confirm_hold(
        state: &mut SessionBook,
        env: &ReservationEnvironment,
        reservation_id: ReservationId,
        at: DateTime<Utc>,
    ) -> Effects {
        let Some(row) = state.reservations.get(&reservation_id) else {
            Self::fail(state, AdmissionError::ReservationNotFound(reservation_id));
            return SmallVec::new();
        };
        if row.status != ReservationStatus::Pending {
            let status = row.status;
            Self::fail(state, AdmissionError::NotPending {
                reservation_id,
                status,
            });
            return SmallVec::new();
        }

        let mut confirmed = row.clone();
        confirmed.status = ReservationStatus::Confirmed;
        confirmed.decided_at = Some(at);
        smallvec![env.write_confirmation(confirmed, at)]
    }

    fn confirmation_written(
        state: &mut SessionBook,
        env: &ReservationEnvironment,
        reservation_id: ReservationId,
        at: DateTime<Utc>,
    ) -> Effects {
        Self::freeze_viability(state, env, at);
        let Some(row) = state.reservations.get_mut(&reservation_id) else {
            Self::fail(state, AdmissionError::ReservationNotFound(reservation_id));
            return SmallVec::new();
        };

        if row.status != ReservationStatus::Pending {
            // Expired or canceled while the write was in flight; the stored
            // confirmed row is stale and gets overwritten.
            let reason = match row.status {
                ReservationStatus::Canceled => RejectionReason::CanceledInFlight,
                _ => row.rejection.unwrap_or(RejectionReason::HoldExpired),
            };
            let current = row.clone();
            tracing::warn!(%reservation_id, %reason, "Confirmation landed after the hold ended");
            Self::decide(state, Decision::Rejected {
                reservation_id: Some(reservation_id),
                reason,
            });
            return smallvec![env.persist(current)];
        }

        if let Err(fault) = state.ledger.confirm(reservation_id) {
            Self::fail(state, fault.into());
            return SmallVec::new();
        }
        row.status = ReservationStatus::Confirmed;
        row.decided_at = Some(at);
        state.unsynced.remove(&reservation_id);
        tracing::info!(session_id = %state.session.id, %reservation_id, "Reservation confirmed");
        Self::decide(state, Decision::Confirmed(reservation_id));
        SmallVec::new()
    }

    fn confirmation_failed(
        state: &mut SessionBook,
        env: &ReservationEnvironment,
        reservation_id: ReservationId,
        at: DateTime<Utc>,
        error: StoreError,
    ) -> Effects {
        tracing::error!(%reservation_id, %error, "Confirmation could not be written, dropping hold");
        let mut effects = SmallVec::new();

        let still_pending = state
            .reservations
            .get(&reservation_id)
            .is_some_and(|row| row.status == ReservationStatus::Pending);

        if still_pending {
            if let Err(fault) = state.ledger.reject(reservation_id) {
                Self::fail(state, fault.into());
                return effects;
            }
            if let Some(row) = state.reservations.get_mut(&reservation_id) {
                row.status = ReservationStatus::Rejected;
                row.rejection = Some(RejectionReason::ConfirmationFailed);
                row.decided_at = Some(at);
                state.active.remove(&row.student_id);
                effects.push(env.persist(row.clone()));
            }
        }

        Self::fail(state, AdmissionError::Store(error));
        effects
    }

    fn decline_hold(
        state: &mut SessionBook,
        env: &ReservationEnvironment,
        reservation_id: ReservationId,
        at: DateTime<Utc>,
    ) -> Effects {
        let Some(row) = state.reservations.get_mut(&reservation_id) else {
            Self::fail(state, AdmissionError::ReservationNotFound(reservation_id));
            return SmallVec::new();
        };
        if row.status != ReservationStatus::Pending {
            let status = row.status;
            Self::fail(state, AdmissionError::NotPending {
                reservation_id,
                status,
            });
            return SmallVec::new();
        }
        if let Err(fault) = state.ledger.reject(reservation_id) {
            Self::fail(state, fault.into());
            return SmallVec::new();
        }

        row.status = ReservationStatus::Rejected;
        row.rejection = Some(RejectionReason::Declined);
        row.decided_at = Some(at);
        state.active.remove(&row.student_id);
        let snapshot = row.clone();
        Self::decide(state, Decision::Rejected {
            reservation_id: Some(reservation_id),
            reason: RejectionReason::Declined,
        });
        smallvec![env.persist(snapshot)]
    }

    fn cancel(
        state: &mut SessionBook,
        env: &ReservationEnvironment,
        reservation_id: ReservationId,
        at: DateTime<Utc>,
    ) -> Effects {
        Self::freeze_viability(state, env, at);
        let Some(row) = state.reservations.get_mut(&reservation_id) else {
            Self::fail(state, AdmissionError::ReservationNotFound(reservation_id));
            return SmallVec::new();
        };
        if row.status.is_terminal() {
            let status = row.status;
            Self::decide(state, Decision::AlreadyTerminal(status));
            return SmallVec::new();
        }
        if state.session.has_started(at) {
            Self::fail(state, AdmissionError::CancellationClosed(reservation_id));
            return SmallVec::new();
        }
        if let Err(fault) = state.ledger.release(reservation_id) {
            Self::fail(state, fault.into());
            return SmallVec::new();
        }

        row.status = ReservationStatus::Canceled;
        row.canceled_at = Some(at);
        state.active.remove(&row.student_id);
        let snapshot = row.clone();
        tracing::info!(session_id = %state.session.id, %reservation_id, "Reservation canceled");
        Self::decide(state, Decision::Canceled { canceled_at: at });
        smallvec![env.persist(snapshot)]
    }

    fn expire_holds(
        state: &mut SessionBook,
        env: &ReservationEnvironment,
        now: DateTime<Utc>,
    ) -> Effects {
        Self::freeze_viability(state, env, now);
        let stale = state.stale_holds(now, env.hold_timeout);
        let mut writes = Vec::with_capacity(stale.len());

        for reservation_id in &stale {
            if let Err(fault) = state.ledger.reject(*reservation_id) {
                Self::fail(state, fault.into());
                return SmallVec::new();
            }
            if let Some(row) = state.reservations.get_mut(reservation_id) {
                row.status = ReservationStatus::Rejected;
                row.rejection = Some(RejectionReason::HoldExpired);
                row.decided_at = Some(now);
                state.active.remove(&row.student_id);
                writes.push(env.persist(row.clone()));
            }
        }

        state
            .held_since
            .retain(|id, _| state.reservations.get(id).is_some_and(|r| r.status == ReservationStatus::Pending));

        if !stale.is_empty() {
            tracing::warn!(session_id = %state.session.id, expired = stale.len(), "Released stale seat holds");
        }
        Self::decide(state, Decision::Expired(stale));
        smallvec![Effect::merge(writes)]
    }

    fn close_session(
        state: &mut SessionBook,
        env: &ReservationEnvironment,
        at: DateTime<Utc>,
    ) -> Effects {
        Self::freeze_viability(state, env, at);
        state.closed = true;
        let mut canceled: Vec<ReservationId> = state.active.values().copied().collect();
        canceled.sort();
        let mut writes = Vec::with_capacity(canceled.len());

        for reservation_id in &canceled {
            if let Err(fault) = state.ledger.release(*reservation_id) {
                Self::fail(state, fault.into());
                return SmallVec::new();
            }
            if let Some(row) = state.reservations.get_mut(reservation_id) {
                row.status = ReservationStatus::Canceled;
                row.canceled_at = Some(at);
                writes.push(env.persist(row.clone()));
            }
        }
        state.active.clear();

        tracing::info!(session_id = %state.session.id, canceled = canceled.len(), "Session closed");
        Self::decide(state, Decision::Closed(canceled));
        smallvec![Effect::merge(writes)]
    }

    fn resize(
        state: &mut SessionBook,
        env: &ReservationEnvironment,
        capacity: Capacity,
        at: DateTime<Utc>,
    ) -> Effects {
        Self::freeze_viability(state, env, at);
        if let Err(reason) = state.ledger.check_resize(capacity) {
            let session_id = state.session.id;
            Self::fail(state, AdmissionError::CapacityLocked { session_id, reason });
            return SmallVec::new();
        }

        let mut resized = state.session.clone();
        resized.capacity = capacity;
        smallvec![env.write_capacity(resized)]
    }

    fn capacity_written(
        state: &mut SessionBook,
        env: &ReservationEnvironment,
        capacity: Capacity,
    ) -> Effects {
        let session_id = state.session.id;
        if let Err(reason) = state.ledger.resize(capacity) {
            // Seats moved while the row was in flight; the stored bounds are
            // stale and the live ones get written back.
            tracing::warn!(%session_id, reason, "Capacity edit overtaken by bookings");
            state.session_unsynced = true;
            Self::fail(state, AdmissionError::CapacityLocked { session_id, reason });
            return smallvec![env.save_session(state.session.clone())];
        }

        state.session.capacity = capacity;
        state.session_unsynced = false;
        tracing::info!(
            %session_id,
            min_attendees = capacity.min_attendees(),
            max_attendees = capacity.max_attendees(),
            "Session capacity applied"
        );
        Self::decide(state, Decision::Resized(capacity));
        SmallVec::new()
    }
}

impl Reducer for ReservationReducer {
    type State = SessionBook;
    type Action = ReservationAction;
    type Environment = ReservationEnvironment;

    fn reduce(
        &self,
        state: &mut Self::State,
        action: Self::Action,
        env: &Self::Environment,
    ) -> SmallVec<[Effect<Self::Action>; 4]> {
        match action {
            // ========== Commands ==========
            ReservationAction::RequestSeat {
                reservation_id,
                student_id,
                eligible,
                requested_at,
                held_at,
            } => Self::request_seat(
                state,
                env,
                reservation_id,
                student_id,
                eligible,
                requested_at,
                held_at,
            ),

            ReservationAction::ConfirmHold { reservation_id, at } => {
                Self::confirm_hold(state, env, reservation_id, at)
            }

            ReservationAction::DeclineHold { reservation_id, at } => {
                Self::decline_hold(state, env, reservation_id, at)
            }

            ReservationAction::Cancel { reservation_id, at } => {
                Self::cancel(state, env, reservation_id, at)
            }

            ReservationAction::ExpireHolds { now } => Self::expire_holds(state, env, now),

            ReservationAction::FlushUnsynced => {
                let mut ids: Vec<ReservationId> = state.unsynced.iter().copied().collect();
                ids.sort();
                let mut writes: Vec<_> = ids
                    .iter()
                    .filter_map(|id| state.reservations.get(id))
                    .map(|row| env.persist(row.clone()))
                    .collect();
                if state.session_unsynced {
                    writes.push(env.save_session(state.session.clone()));
                }
                smallvec![Effect::merge(writes)]
            }

            ReservationAction::CloseSession { at } => Self::close_session(state, env, at),

            ReservationAction::ReopenSession => {
                state.closed = false;
                state.viability.reopen();
                tracing::info!(session_id = %state.session.id, "Session reopened");
                Self::decide(state, Decision::Reopened);
                SmallVec::new()
            }

            ReservationAction::ResizeCapacity { capacity, at } => {
                Self::resize(state, env, capacity, at)
            }

            // ========== Events ==========
            ReservationAction::ConfirmationWritten { reservation_id, at } => {
                Self::confirmation_written(state, env, reservation_id, at)
            }

            ReservationAction::ConfirmationFailed {
                reservation_id,
                at,
                error,
            } => Self::confirmation_failed(state, env, reservation_id, at, error),

            ReservationAction::RecordSynced {
                reservation_id,
                status,
            } => {
                let current = state.reservations.get(&reservation_id).map(|row| row.status);
                if current == Some(status) {
                    state.unsynced.remove(&reservation_id);
                } else {
                    // A newer transition raced this write; flush the latest row later.
                    state.unsynced.insert(reservation_id);
                }
                SmallVec::new()
            }

            ReservationAction::RecordWriteFailed {
                reservation_id,
                error,
            } => {
                tracing::warn!(%reservation_id, %error, "Reservation write lagging, queued for flush");
                state.unsynced.insert(reservation_id);
                SmallVec::new()
            }

            ReservationAction::CapacityWritten { capacity } => {
                Self::capacity_written(state, env, capacity)
            }

            ReservationAction::CapacityWriteFailed { error } => {
                tracing::error!(session_id = %state.session.id, %error, "Capacity edit could not be written");
                Self::fail(state, AdmissionError::Store(error));
                SmallVec::new()
            }

            ReservationAction::SessionSynced { capacity } => {
                state.session_unsynced = state.session.capacity != capacity;
                SmallVec::new()
            }

            ReservationAction::SessionWriteFailed { error } => {
                tracing::warn!(session_id = %state.session.id, %error, "Session write lagging, queued for flush");
                state.session_unsynced = true;
                SmallVec::new()
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::memory::InMemoryRecordStore;
    use classbook_core::types::{CenterId, InstructorId, Viability};
    use classbook_testing::assertions::{assert_no_effects, assert_scheduled_jobs};
    use classbook_testing::{RecordsDecision, ReducerTest};

    impl RecordsDecision for SessionBook {
        type Decision = Result<Decision, AdmissionError>;

        fn take_decision(&mut self) -> Option<Self::Decision> {
            self.last_outcome.take()
        }
    }

    fn start() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-06-02T18:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn early() -> DateTime<Utc> {
        start() - Duration::hours(5)
    }

    fn cutoff() -> DateTime<Utc> {
        start() - Duration::hours(2)
    }

    fn book(min: u32, max: u32) -> SessionBook {
        SessionBook::new(ClassSession::new(
            "Evening HIIT",
            "hiit",
            CenterId::new(),
            InstructorId::new(),
            start(),
            Capacity::new(min, max).unwrap(),
        ))
    }

    fn env() -> ReservationEnvironment {
        ReservationEnvironment::new(
            Arc::new(InMemoryRecordStore::new()),
            RetryPolicy::no_retry(),
            Duration::seconds(30),
            Duration::hours(2),
        )
    }

    fn session(min: u32, max: u32) -> ReducerTest<ReservationReducer> {
        ReducerTest::new(ReservationReducer::new())
            .with_env(env())
            .given_state(book(min, max))
    }

    fn request_at(reservation_id: ReservationId, at: DateTime<Utc>) -> ReservationAction {
        ReservationAction::RequestSeat {
            reservation_id,
            student_id: StudentId::new(),
            eligible: true,
            requested_at: at,
            held_at: at,
        }
    }

    fn request(reservation_id: ReservationId) -> ReservationAction {
        request_at(reservation_id, early())
    }

    fn written(reservation_id: ReservationId) -> ReservationAction {
        ReservationAction::ConfirmationWritten {
            reservation_id,
            at: early(),
        }
    }

    #[test]
    fn eligible_request_is_held_and_persisted() {
        let reservation_id = ReservationId::new();

        session(1, 2)
            .when_action(request(reservation_id))
            .then_decision(Ok(Decision::Held(reservation_id)))
            .then_state(move |state| {
                assert_eq!(state.ledger.pending(), 1);
                assert_eq!(
                    state.reservation(&reservation_id).unwrap().status,
                    ReservationStatus::Pending
                );
            })
            .then_effects(|effects| assert_scheduled_jobs(effects, 1))
            .run();
    }

    #[test]
    fn ineligible_request_never_touches_the_ledger() {
        session(1, 2)
            .when_action(ReservationAction::RequestSeat {
                reservation_id: ReservationId::new(),
                student_id: StudentId::new(),
                eligible: false,
                requested_at: early(),
                held_at: early(),
            })
            .then_decision_where(|decided| {
                matches!(
                    decided,
                    Ok(Decision::Rejected {
                        reason: RejectionReason::MembershipInvalid,
                        ..
                    })
                )
            })
            .then_state(|state| {
                assert_eq!(state.ledger.available(), 2);
                assert_eq!(state.ledger.pending(), 0);
            })
            .run();
    }

    #[test]
    fn second_active_request_is_a_duplicate() {
        let student_id = StudentId::new();
        let first = ReservationId::new();
        let seat = |reservation_id| ReservationAction::RequestSeat {
            reservation_id,
            student_id,
            eligible: true,
            requested_at: early(),
            held_at: early(),
        };

        session(1, 5)
            .given_actions([seat(first)])
            .when_action(seat(ReservationId::new()))
            .then_decision(Ok(Decision::Rejected {
                reservation_id: Some(first),
                reason: RejectionReason::DuplicateReservation,
            }))
            .then_state(|state| assert_eq!(state.ledger.pending(), 1))
            .then_effects(assert_no_effects)
            .run();
    }

    #[test]
    fn confirm_is_write_ahead() {
        let reservation_id = ReservationId::new();

        session(1, 1)
            .given_actions([request(reservation_id)])
            .when_action(ReservationAction::ConfirmHold {
                reservation_id,
                at: early(),
            })
            .then_no_decision()
            .then_state(|state| {
                assert_eq!(state.ledger.pending(), 1);
                assert_eq!(state.ledger.confirmed(), 0);
            })
            .then_effects(|effects| assert_scheduled_jobs(effects, 1))
            .run();
    }

    #[test]
    fn written_confirmation_confirms_the_seat() {
        let reservation_id = ReservationId::new();

        session(1, 1)
            .given_actions([request(reservation_id)])
            .when_action(written(reservation_id))
            .then_decision(Ok(Decision::Confirmed(reservation_id)))
            .then_state(|state| {
                assert_eq!(state.ledger.confirmed(), 1);
                assert_eq!(state.ledger.pending(), 0);
            })
            .run();
    }

    #[test]
    fn failed_confirmation_releases_the_hold() {
        let reservation_id = ReservationId::new();

        session(1, 1)
            .given_actions([request(reservation_id)])
            .when_action(ReservationAction::ConfirmationFailed {
                reservation_id,
                at: early(),
                error: StoreError::Unavailable("disk full".into()),
            })
            .then_decision(Err(AdmissionError::Store(StoreError::Unavailable(
                "disk full".into(),
            ))))
            .then_state(move |state| {
                assert_eq!(state.ledger.available(), 1);
                let row = state.reservation(&reservation_id).unwrap();
                assert_eq!(state.active_reservation(&row.student_id), None);
                assert_eq!(row.rejection, Some(RejectionReason::ConfirmationFailed));
            })
            .then_effects(|effects| assert_scheduled_jobs(effects, 1))
            .run();
    }

    #[test]
    fn cancel_twice_is_already_terminal() {
        let reservation_id = ReservationId::new();
        let cancel = ReservationAction::Cancel {
            reservation_id,
            at: early(),
        };

        session(1, 1)
            .given_actions([request(reservation_id), cancel.clone()])
            .when_action(cancel)
            .then_decision(Ok(Decision::AlreadyTerminal(ReservationStatus::Canceled)))
            .then_state(|state| {
                assert_eq!(state.ledger.canceled(), 1);
                assert_eq!(state.ledger.available(), 1);
            })
            .then_effects(assert_no_effects)
            .run();
    }

    #[test]
    fn cancel_after_start_is_refused() {
        let reservation_id = ReservationId::new();

        session(1, 1)
            .given_actions([request(reservation_id)])
            .when_action(ReservationAction::Cancel {
                reservation_id,
                at: start(),
            })
            .then_decision(Err(AdmissionError::CancellationClosed(reservation_id)))
            .then_state(|state| assert_eq!(state.ledger.pending(), 1))
            .run();
    }

    #[test]
    fn stale_holds_expire() {
        let stale = ReservationId::new();

        session(1, 3)
            .given_actions([request(stale)])
            .when_action(ReservationAction::ExpireHolds {
                now: early() + Duration::seconds(30),
            })
            .then_decision(Ok(Decision::Expired(vec![stale])))
            .then_state(move |state| {
                assert_eq!(state.ledger.pending(), 0);
                assert_eq!(
                    state.reservation(&stale).unwrap().rejection,
                    Some(RejectionReason::HoldExpired)
                );
            })
            .run();
    }

    /// A caller clock running behind does not age the hold.
    #[test]
    fn holds_age_from_the_grant_instant() {
        let reservation_id = ReservationId::new();

        session(1, 3)
            .given_actions([ReservationAction::RequestSeat {
                reservation_id,
                student_id: StudentId::new(),
                eligible: true,
                requested_at: early() - Duration::hours(1),
                held_at: early(),
            }])
            .when_action(ReservationAction::ExpireHolds {
                now: early() + Duration::seconds(10),
            })
            .then_decision(Ok(Decision::Expired(Vec::new())))
            .then_state(|state| assert_eq!(state.ledger.pending(), 1))
            .run();
    }

    #[test]
    fn late_confirmation_of_expired_hold_is_rejected() {
        let reservation_id = ReservationId::new();

        session(1, 3)
            .given_actions([
                request(reservation_id),
                ReservationAction::ExpireHolds {
                    now: early() + Duration::minutes(1),
                },
            ])
            .when_action(written(reservation_id))
            .then_decision(Ok(Decision::Rejected {
                reservation_id: Some(reservation_id),
                reason: RejectionReason::HoldExpired,
            }))
            .then_state(|state| assert_eq!(state.ledger.confirmed(), 0))
            .then_effects(|effects| assert_scheduled_jobs(effects, 1))
            .run();
    }

    /// The decision is taken on the head count before the first seat change
    /// past the cutoff, without anyone asking for it.
    #[test]
    fn viability_freezes_before_the_first_change_past_the_cutoff() {
        let (a, b, late) = (ReservationId::new(), ReservationId::new(), ReservationId::new());

        session(3, 10)
            .given_actions([request(a), written(a), request(b), written(b)])
            .when_action(request_at(late, cutoff() + Duration::seconds(1)))
            .then_decision(Ok(Decision::Held(late)))
            .then_state(|state| {
                let announced = state.announcement.unwrap();
                assert_eq!(announced.viability, Viability::NonViable);
                assert_eq!(announced.decided_on, 2);
                assert!(announced.newly_decided);
            })
            .run();
    }

    #[test]
    fn confirmation_past_the_cutoff_keeps_the_frozen_decision() {
        let (a, b, late) = (ReservationId::new(), ReservationId::new(), ReservationId::new());

        session(3, 10)
            .given_actions([
                request(a),
                written(a),
                request(b),
                written(b),
                request_at(late, cutoff() + Duration::seconds(1)),
            ])
            .when_action(ReservationAction::ConfirmationWritten {
                reservation_id: late,
                at: cutoff() + Duration::seconds(1),
            })
            .then_decision(Ok(Decision::Confirmed(late)))
            .then_state(|state| {
                assert_eq!(state.ledger.confirmed(), 3);
                assert_eq!(state.viability.decision(), Some(Viability::NonViable));
            })
            .run();
    }

    #[test]
    fn mutations_before_the_cutoff_decide_nothing() {
        session(3, 10)
            .when_action(request(ReservationId::new()))
            .then_state(|state| {
                assert!(state.announcement.is_none());
                assert_eq!(state.viability.decision(), None);
            })
            .run();
    }

    #[test]
    fn resize_locked_after_confirmation() {
        let reservation_id = ReservationId::new();

        session(1, 3)
            .given_actions([request(reservation_id), written(reservation_id)])
            .when_action(ReservationAction::ResizeCapacity {
                capacity: Capacity::new(1, 10).unwrap(),
                at: early(),
            })
            .then_decision_where(|decided| matches!(decided, Err(AdmissionError::CapacityLocked { .. })))
            .then_state(|state| assert_eq!(state.session.capacity.max_attendees(), 3))
            .then_effects(assert_no_effects)
            .run();
    }

    #[test]
    fn resize_waits_for_the_session_row() {
        session(1, 2)
            .when_action(ReservationAction::ResizeCapacity {
                capacity: Capacity::new(1, 6).unwrap(),
                at: early(),
            })
            .then_no_decision()
            .then_state(|state| {
                assert_eq!(state.ledger.capacity().max_attendees(), 2);
                assert_eq!(state.session.capacity.max_attendees(), 2);
            })
            .then_effects(|effects| assert_scheduled_jobs(effects, 1))
            .run();
    }

    #[test]
    fn written_capacity_applies_the_bounds() {
        let capacity = Capacity::new(2, 6).unwrap();

        session(1, 2)
            .given_actions([ReservationAction::ResizeCapacity { capacity, at: early() }])
            .when_action(ReservationAction::CapacityWritten { capacity })
            .then_decision(Ok(Decision::Resized(capacity)))
            .then_state(move |state| {
                assert_eq!(state.session.capacity, capacity);
                assert_eq!(state.ledger.available(), 6);
                assert!(state.is_synced());
            })
            .run();
    }

    #[test]
    fn failed_capacity_write_changes_nothing() {
        session(1, 2)
            .given_actions([ReservationAction::ResizeCapacity {
                capacity: Capacity::new(1, 6).unwrap(),
                at: early(),
            }])
            .when_action(ReservationAction::CapacityWriteFailed {
                error: StoreError::Unavailable("down".into()),
            })
            .then_decision(Err(AdmissionError::Store(StoreError::Unavailable("down".into()))))
            .then_state(|state| {
                assert_eq!(state.session.capacity.max_attendees(), 2);
                assert_eq!(state.ledger.available(), 2);
            })
            .then_effects(assert_no_effects)
            .run();
    }

    /// A shrink validated against one hold, overtaken by a second booking
    /// while the row was written, rewrites the live bounds.
    #[test]
    fn capacity_overtaken_in_flight_rewrites_live_row() {
        let shrunk = Capacity::new(1, 1).unwrap();

        session(1, 3)
            .given_actions([
                request(ReservationId::new()),
                ReservationAction::ResizeCapacity {
                    capacity: shrunk,
                    at: early(),
                },
                request(ReservationId::new()),
            ])
            .when_action(ReservationAction::CapacityWritten { capacity: shrunk })
            .then_decision_where(|decided| matches!(decided, Err(AdmissionError::CapacityLocked { .. })))
            .then_state(|state| {
                assert_eq!(state.session.capacity.max_attendees(), 3);
                assert_eq!(state.ledger.pending(), 2);
                assert!(!state.is_synced());
            })
            .then_effects(|effects| assert_scheduled_jobs(effects, 1))
            .run();
    }

    #[test]
    fn failed_writes_are_flushed_later() {
        let reservation_id = ReservationId::new();

        session(1, 3)
            .given_actions([
                request(reservation_id),
                ReservationAction::RecordWriteFailed {
                    reservation_id,
                    error: StoreError::Transient("timeout".into()),
                },
                ReservationAction::SessionWriteFailed {
                    error: StoreError::Transient("timeout".into()),
                },
            ])
            .when_action(ReservationAction::FlushUnsynced)
            .then_no_decision()
            .then_state(|state| {
                assert_eq!(state.unsynced(), 1);
                assert!(!state.is_synced());
            })
            .then_effects(|effects| assert_scheduled_jobs(effects, 2))
            .run();
    }

    #[test]
    fn stale_sync_keeps_the_row_queued() {
        let reservation_id = ReservationId::new();

        session(1, 3)
            .given_actions([
                request(reservation_id),
                ReservationAction::Cancel {
                    reservation_id,
                    at: early(),
                },
            ])
            .when_action(ReservationAction::RecordSynced {
                reservation_id,
                status: ReservationStatus::Pending,
            })
            .then_state(|state| assert_eq!(state.unsynced(), 1))
            .run();
    }
}
