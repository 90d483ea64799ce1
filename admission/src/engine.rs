//! The admission engine.
//!
//! Sessions live in a registry of per-session locks, so requests for
//! different sessions never contend. Every command runs the reservation
//! reducer synchronously under its session lock; the effects it returns
//! (store writes) run after the lock is released and may feed actions back
//! into the reducer. Membership checks run before any lock is taken.
//!
//! Books of sessions that have started and are fully stored can be unloaded;
//! their frozen viability decision is kept so a later reload never emits it
//! a second time.

use crate::config::{AdmissionConfig, ConfirmationPolicy};
use crate::membership::MembershipValidator;
use crate::reservation::{
    Decision, ReservationAction, ReservationEnvironment, ReservationReducer, SessionBook,
};
use crate::retry::retry_store;
use crate::viability::{ViabilityCheck, ViabilityMonitor};
use classbook_core::effect::Effect;
use classbook_core::environment::Clock;
use classbook_core::error::{AdmissionError, InvalidHoldState};
use classbook_core::ports::{MembershipStore, RecordStore, ViabilityNotifier};
use classbook_core::reducer::Reducer;
use classbook_core::types::{
    CancelOutcome, Capacity, ClassSession, RejectionReason, Reservation, ReservationId,
    ReservationOutcome, ReservationStatus, SeatStatus, SessionId, StudentId, Viability,
};
use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, join_all};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, RwLock};

type SessionHandle = Arc<Mutex<SessionBook>>;

/// Admission control for every class session.
pub struct AdmissionEngine {
    config: AdmissionConfig,
    records: Arc<dyn RecordStore>,
    membership: MembershipValidator,
    notifier: Arc<dyn ViabilityNotifier>,
    pub(crate) clock: Arc<dyn Clock>,
    reducer: ReservationReducer,
    env: ReservationEnvironment,
    sessions: RwLock<HashMap<SessionId, SessionHandle>>,
    reservation_index: RwLock<HashMap<ReservationId, SessionId>>,
    /// Viability of unloaded sessions
    retired: RwLock<HashMap<SessionId, ViabilityMonitor>>,
    /// Serializes capacity edits so write-ahead rows land in order
    capacity_edits: Mutex<()>,
}

impl AdmissionEngine {
    /// Creates an engine over the given collaborators
    #[must_use]
    pub fn new(
        config: AdmissionConfig,
        records: Arc<dyn RecordStore>,
        memberships: Arc<dyn MembershipStore>,
        notifier: Arc<dyn ViabilityNotifier>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let retry = config.retry_policy();
        let env = ReservationEnvironment::new(
            Arc::clone(&records),
            retry,
            config.hold_timeout(),
            config.viability_cutoff(),
        );
        Self {
            membership: MembershipValidator::new(memberships, retry),
            config,
            records,
            notifier,
            clock,
            reducer: ReservationReducer::new(),
            env,
            sessions: RwLock::new(HashMap::new()),
            reservation_index: RwLock::new(HashMap::new()),
            retired: RwLock::new(HashMap::new()),
            capacity_edits: Mutex::new(()),
        }
    }

    /// Engine configuration
    #[must_use]
    pub const fn config(&self) -> &AdmissionConfig {
        &self.config
    }

    /// Persist a new session and start tracking it.
    ///
    /// Registering an already tracked session is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`AdmissionError::Store`] if the session row cannot be written.
    pub async fn register_session(&self, session: ClassSession) -> Result<(), AdmissionError> {
        if self.sessions.read().await.contains_key(&session.id) {
            return Ok(());
        }
        retry_store(self.env.retry, "save_session", || self.records.save_session(&session)).await?;
        tracing::info!(
            session_id = %session.id,
            title = %session.title,
            schedule = %session.schedule,
            min_attendees = session.capacity.min_attendees(),
            max_attendees = session.capacity.max_attendees(),
            "Session registered"
        );
        self.session(session.id).await?;
        Ok(())
    }

    /// Ask for a seat on behalf of a student.
    ///
    /// Capacity, membership and duplicate refusals are outcomes, not errors.
    /// `now` drives the booking window and viability; the hold itself ages
    /// on the engine clock.
    ///
    /// # Errors
    ///
    /// - [`AdmissionError::SessionNotFound`] for an unknown session
    /// - [`AdmissionError::Store`] when the membership store or the
    ///   confirmation write fails after retries
    /// - [`AdmissionError::InvalidHoldState`] on a seat accounting fault
    pub async fn request_reservation(
        &self,
        student_id: StudentId,
        session_id: SessionId,
        now: DateTime<Utc>,
    ) -> Result<ReservationOutcome, AdmissionError> {
        let started = Instant::now();
        let handle = self.session(session_id).await?;

        let (center_id, refused) = {
            let book = handle.lock().await;
            (book.session.center_id, early_refusal(&book, student_id, now))
        };
        if let Some(outcome) = refused {
            crate::metrics::record_reservation_outcome(&outcome, started.elapsed());
            return Ok(outcome);
        }

        let eligible = self.membership.is_eligible(student_id, center_id, now).await?;

        let reservation_id = ReservationId::new();
        let decision = self
            .command(
                &handle,
                reservation_id,
                ReservationAction::RequestSeat {
                    reservation_id,
                    student_id,
                    eligible,
                    requested_at: now,
                    held_at: self.clock.now(),
                },
            )
            .await?;

        if self.book_has(&handle, reservation_id).await {
            self.reservation_index
                .write()
                .await
                .insert(reservation_id, session_id);
        }

        let outcome = match decision {
            Decision::Held(held) if self.config.confirmation == ConfirmationPolicy::Auto => {
                match self.confirm(&handle, held, now).await {
                    // The hold ended between grant and confirmation.
                    Err(AdmissionError::NotPending { .. }) => self.settled(&handle, held).await?,
                    other => other?,
                }
            }
            decision => to_outcome(reservation_id, decision)?,
        };

        tracing::info!(
            %session_id,
            %student_id,
            outcome = ?outcome,
            "Booking request answered"
        );
        crate::metrics::record_reservation_outcome(&outcome, started.elapsed());
        Ok(outcome)
    }

    /// Cancel a pending or confirmed reservation.
    ///
    /// # Errors
    ///
    /// - [`AdmissionError::ReservationNotFound`] for an unknown reservation
    /// - [`AdmissionError::CancellationClosed`] once the session has started
    pub async fn cancel_reservation(
        &self,
        reservation_id: ReservationId,
        now: DateTime<Utc>,
    ) -> Result<CancelOutcome, AdmissionError> {
        let handle = self.session_of(reservation_id).await?;
        let decision = self
            .command(
                &handle,
                reservation_id,
                ReservationAction::Cancel {
                    reservation_id,
                    at: now,
                },
            )
            .await?;

        match decision {
            Decision::Canceled { canceled_at } => {
                crate::metrics::record_cancellation();
                Ok(CancelOutcome::Canceled { canceled_at })
            }
            Decision::AlreadyTerminal(status) => Ok(CancelOutcome::AlreadyTerminal { status }),
            other => Err(unexpected(reservation_id, &other)),
        }
    }

    /// Operator approval of a pending reservation.
    ///
    /// # Errors
    ///
    /// Returns [`AdmissionError::NotPending`] if the reservation is no longer
    /// pending, or [`AdmissionError::Store`] if the confirmation write fails.
    pub async fn approve_reservation(
        &self,
        reservation_id: ReservationId,
        now: DateTime<Utc>,
    ) -> Result<ReservationOutcome, AdmissionError> {
        let handle = self.session_of(reservation_id).await?;
        self.confirm(&handle, reservation_id, now).await
    }

    /// Operator refusal of a pending reservation.
    ///
    /// # Errors
    ///
    /// Returns [`AdmissionError::NotPending`] if the reservation is no longer
    /// pending.
    pub async fn decline_reservation(
        &self,
        reservation_id: ReservationId,
        now: DateTime<Utc>,
    ) -> Result<ReservationOutcome, AdmissionError> {
        let handle = self.session_of(reservation_id).await?;
        let decision = self
            .command(
                &handle,
                reservation_id,
                ReservationAction::DeclineHold {
                    reservation_id,
                    at: now,
                },
            )
            .await?;
        to_outcome(reservation_id, decision)
    }

    /// Seat counters of a session.
    ///
    /// # Errors
    ///
    /// Returns [`AdmissionError::SessionNotFound`] for an unknown session.
    pub async fn seat_status(&self, session_id: SessionId) -> Result<SeatStatus, AdmissionError> {
        let handle = self.session(session_id).await?;
        let book = handle.lock().await;
        Ok(book.ledger.status())
    }

    /// Viability of a session at `now`.
    ///
    /// The first decision is sent to the notifier exactly once.
    ///
    /// # Errors
    ///
    /// Returns [`AdmissionError::SessionNotFound`] for an unknown session.
    pub async fn viability(
        &self,
        session_id: SessionId,
        now: DateTime<Utc>,
    ) -> Result<Viability, AdmissionError> {
        let handle = self.session(session_id).await?;
        let check = {
            let mut book = handle.lock().await;
            let confirmed = book.ledger.confirmed();
            let session = book.session.clone();
            book.viability
                .evaluate(&session, confirmed, self.config.viability_cutoff(), now)
        };

        if check.newly_decided {
            self.announce(session_id, check).await;
        }
        Ok(check.viability)
    }

    /// Change the attendee bounds of a session.
    ///
    /// The session row is written first; the bounds apply only once it is
    /// stored.
    ///
    /// # Errors
    ///
    /// - [`AdmissionError::InvalidCapacity`] for invalid bounds
    /// - [`AdmissionError::CapacityLocked`] once seats are confirmed, or when
    ///   the new maximum is below the seats already held
    /// - [`AdmissionError::Store`] if the session row cannot be written
    pub async fn update_capacity(
        &self,
        session_id: SessionId,
        min_attendees: u32,
        max_attendees: u32,
    ) -> Result<SeatStatus, AdmissionError> {
        let capacity = Capacity::new(min_attendees, max_attendees)?;
        let handle = self.session(session_id).await?;
        let _edit = self.capacity_edits.lock().await;
        let at = self.clock.now();
        if let Some(Err(error)) = self
            .dispatch(&handle, ReservationAction::ResizeCapacity { capacity, at })
            .await
        {
            return Err(error);
        }

        tracing::info!(%session_id, min_attendees, max_attendees, "Session capacity updated");
        let book = handle.lock().await;
        Ok(book.ledger.status())
    }

    /// Close a session: cancel every active reservation and refuse new
    /// bookings. Returns the canceled reservations.
    ///
    /// # Errors
    ///
    /// Returns [`AdmissionError::SessionNotFound`] for an unknown session.
    pub async fn close_session(
        &self,
        session_id: SessionId,
        now: DateTime<Utc>,
    ) -> Result<Vec<ReservationId>, AdmissionError> {
        let handle = self.session(session_id).await?;
        match self
            .dispatch(&handle, ReservationAction::CloseSession { at: now })
            .await
        {
            Some(Ok(Decision::Closed(canceled))) => {
                for _ in &canceled {
                    crate::metrics::record_cancellation();
                }
                Ok(canceled)
            }
            Some(Err(error)) => Err(error),
            _ => Ok(Vec::new()),
        }
    }

    /// Lift an operator closure and thaw the viability decision.
    ///
    /// # Errors
    ///
    /// Returns [`AdmissionError::SessionNotFound`] for an unknown session.
    pub async fn reopen_session(&self, session_id: SessionId) -> Result<(), AdmissionError> {
        let handle = self.session(session_id).await?;
        self.dispatch(&handle, ReservationAction::ReopenSession)
            .await
            .transpose()?;
        Ok(())
    }

    /// Current state of a reservation.
    ///
    /// # Errors
    ///
    /// Returns [`AdmissionError::ReservationNotFound`] for an unknown reservation.
    pub async fn reservation(
        &self,
        reservation_id: ReservationId,
    ) -> Result<Reservation, AdmissionError> {
        let handle = self.session_of(reservation_id).await?;
        let book = handle.lock().await;
        book.reservation(&reservation_id)
            .cloned()
            .ok_or(AdmissionError::ReservationNotFound(reservation_id))
    }

    /// Sessions with a book in memory
    pub async fn loaded_sessions(&self) -> Vec<SessionId> {
        self.sessions.read().await.keys().copied().collect()
    }

    /// Drop the book of a finished session from memory.
    ///
    /// Only a session that has started by `now`, has no pending hold, has
    /// every row stored and has a frozen viability decision is unloaded.
    /// Its reservations become addressable again once the session is loaded
    /// anew. Returns whether the book was dropped.
    pub async fn unload_session(&self, session_id: SessionId, now: DateTime<Utc>) -> bool {
        let mut sessions = self.sessions.write().await;
        let Some(handle) = sessions.get(&session_id).cloned() else {
            return false;
        };

        let (rows, monitor) = {
            let book = handle.lock().await;
            let finished = book.session.has_started(now)
                && book.ledger.pending() == 0
                && book.is_synced()
                && book.viability.decision().is_some();
            if !finished {
                return false;
            }
            let rows: Vec<ReservationId> = book.reservations().map(|row| row.id).collect();
            (rows, book.viability)
        };
        sessions.remove(&session_id);
        let loaded = sessions.len();
        drop(sessions);

        self.retired.write().await.insert(session_id, monitor);
        {
            let mut index = self.reservation_index.write().await;
            for id in &rows {
                index.remove(id);
            }
        }

        tracing::info!(%session_id, reservations = rows.len(), "Finished session unloaded");
        crate::metrics::set_sessions_loaded(loaded);
        true
    }

    /// Release stale holds of a session and re-flush lagging writes.
    /// Returns the released reservations.
    ///
    /// # Errors
    ///
    /// Returns [`AdmissionError::SessionNotFound`] for an unknown session.
    pub(crate) async fn expire_and_flush(
        &self,
        session_id: SessionId,
        now: DateTime<Utc>,
    ) -> Result<Vec<ReservationId>, AdmissionError> {
        let handle = self.session(session_id).await?;
        let expired = match self
            .dispatch(&handle, ReservationAction::ExpireHolds { now })
            .await
        {
            Some(Ok(Decision::Expired(expired))) => expired,
            Some(Err(error)) => return Err(error),
            _ => Vec::new(),
        };
        if !expired.is_empty() {
            crate::metrics::record_holds_expired(expired.len());
        }

        self.dispatch(&handle, ReservationAction::FlushUnsynced).await;
        Ok(expired)
    }

    // ========================================================================
    // Internals
    // ========================================================================

    /// Book of a session, loading it from the record store on first use.
    async fn session(&self, session_id: SessionId) -> Result<SessionHandle, AdmissionError> {
        if let Some(handle) = self.sessions.read().await.get(&session_id) {
            return Ok(Arc::clone(handle));
        }

        let session = retry_store(self.env.retry, "load_session", || {
            self.records.load_session(session_id)
        })
        .await?
        .ok_or(AdmissionError::SessionNotFound(session_id))?;
        let rows = retry_store(self.env.retry, "load_reservations", || {
            self.records.load_reservations(session_id)
        })
        .await?;

        let row_ids: Vec<ReservationId> = rows.iter().map(|row| row.id).collect();
        let mut book = SessionBook::rebuild(session, rows)?;
        if let Some(monitor) = self.retired.read().await.get(&session_id) {
            book.viability = *monitor;
        }

        let (handle, loaded) = {
            let mut sessions = self.sessions.write().await;
            let handle = Arc::clone(
                sessions
                    .entry(session_id)
                    .or_insert_with(|| Arc::new(Mutex::new(book))),
            );
            (handle, sessions.len())
        };
        {
            let mut index = self.reservation_index.write().await;
            for id in row_ids {
                index.insert(id, session_id);
            }
        }

        tracing::debug!(%session_id, "Session book loaded");
        crate::metrics::set_sessions_loaded(loaded);
        Ok(handle)
    }

    async fn session_of(&self, reservation_id: ReservationId) -> Result<SessionHandle, AdmissionError> {
        let session_id = self
            .reservation_index
            .read()
            .await
            .get(&reservation_id)
            .copied()
            .ok_or(AdmissionError::ReservationNotFound(reservation_id))?;
        self.session(session_id).await
    }

    async fn book_has(&self, handle: &SessionHandle, reservation_id: ReservationId) -> bool {
        handle.lock().await.reservation(&reservation_id).is_some()
    }

    /// Outcome of a reservation from its current row
    async fn settled(
        &self,
        handle: &SessionHandle,
        reservation_id: ReservationId,
    ) -> Result<ReservationOutcome, AdmissionError> {
        let book = handle.lock().await;
        let row = book
            .reservation(&reservation_id)
            .ok_or(AdmissionError::ReservationNotFound(reservation_id))?;
        Ok(match row.status {
            ReservationStatus::Pending => ReservationOutcome::Pending { reservation_id },
            ReservationStatus::Confirmed => ReservationOutcome::Confirmed { reservation_id },
            ReservationStatus::Rejected => ReservationOutcome::Rejected {
                reservation_id: Some(reservation_id),
                reason: row.rejection.unwrap_or(RejectionReason::HoldExpired),
            },
            ReservationStatus::Canceled => ReservationOutcome::Rejected {
                reservation_id: Some(reservation_id),
                reason: RejectionReason::CanceledInFlight,
            },
        })
    }

    async fn confirm(
        &self,
        handle: &SessionHandle,
        reservation_id: ReservationId,
        now: DateTime<Utc>,
    ) -> Result<ReservationOutcome, AdmissionError> {
        let decision = self
            .command(
                handle,
                reservation_id,
                ReservationAction::ConfirmHold {
                    reservation_id,
                    at: now,
                },
            )
            .await?;
        to_outcome(reservation_id, decision)
    }

    /// Dispatch a command that must produce a decision
    async fn command(
        &self,
        handle: &SessionHandle,
        reservation_id: ReservationId,
        action: ReservationAction,
    ) -> Result<Decision, AdmissionError> {
        self.dispatch(handle, action).await.unwrap_or_else(|| {
            Err(InvalidHoldState {
                hold: reservation_id,
                detail: "command produced no decision",
            }
            .into())
        })
    }

    /// Run an action and every action its effects feed back.
    ///
    /// The reducer runs under the session lock; effects run after it is
    /// released. The last decision recorded wins. Viability frozen along
    /// the way is emitted once the lock is released.
    async fn dispatch(
        &self,
        handle: &SessionHandle,
        action: ReservationAction,
    ) -> Option<Result<Decision, AdmissionError>> {
        let mut queue = VecDeque::from([action]);
        let mut outcome = None;

        while let Some(action) = queue.pop_front() {
            let (effects, announcement) = {
                let mut book = handle.lock().await;
                let effects = self.reducer.reduce(&mut book, action, &self.env);
                if let Some(decided) = book.last_outcome.take() {
                    outcome = Some(decided);
                }
                let announcement = book
                    .announcement
                    .take()
                    .map(|check| (book.session.id, check));
                (effects, announcement)
            };

            if let Some((session_id, check)) = announcement {
                self.announce(session_id, check).await;
            }
            for effect in effects {
                queue.extend(execute(effect).await);
            }
        }

        outcome
    }

    async fn announce(&self, session_id: SessionId, check: ViabilityCheck) {
        tracing::info!(
            %session_id,
            viability = %check.viability,
            confirmed = check.decided_on,
            "Session viability decided"
        );
        crate::metrics::record_viability_decision(check.viability);
        self.notifier
            .session_decided(session_id, check.viability, check.decided_on)
            .await;
    }
}

/// Execute an effect, collecting the actions it feeds back.
fn execute(effect: Effect<ReservationAction>) -> BoxFuture<'static, Vec<ReservationAction>> {
    Box::pin(async move {
        match effect {
            Effect::None => Vec::new(),
            Effect::Future(fut) => fut.await.into_iter().collect(),
            Effect::Parallel(effects) => join_all(effects.into_iter().map(execute))
                .await
                .into_iter()
                .flatten()
                .collect(),
        }
    })
}

/// Refusals decidable from the book alone, before membership is checked.
fn early_refusal(
    book: &SessionBook,
    student_id: StudentId,
    now: DateTime<Utc>,
) -> Option<ReservationOutcome> {
    let reason = if book.closed {
        RejectionReason::SessionClosed
    } else if book.session.has_started(now) {
        RejectionReason::BookingClosed
    } else if let Some(existing) = book.active_reservation(&student_id) {
        return Some(ReservationOutcome::Rejected {
            reservation_id: Some(existing),
            reason: RejectionReason::DuplicateReservation,
        });
    } else {
        return None;
    };

    Some(ReservationOutcome::Rejected {
        reservation_id: None,
        reason,
    })
}

fn to_outcome(
    reservation_id: ReservationId,
    decision: Decision,
) -> Result<ReservationOutcome, AdmissionError> {
    match decision {
        Decision::Held(reservation_id) => Ok(ReservationOutcome::Pending { reservation_id }),
        Decision::Confirmed(reservation_id) => Ok(ReservationOutcome::Confirmed { reservation_id }),
        Decision::Rejected {
            reservation_id,
            reason,
        } => Ok(ReservationOutcome::Rejected {
            reservation_id,
            reason,
        }),
        other => Err(unexpected(reservation_id, &other)),
    }
}

fn unexpected(reservation_id: ReservationId, decision: &Decision) -> AdmissionError {
    tracing::error!(%reservation_id, ?decision, "Command answered with an unrelated decision");
    InvalidHoldState {
        hold: reservation_id,
        detail: "unexpected decision",
    }
    .into()
}
