//! In-memory collaborators.
//!
//! Used by the demo binary and the test suites; a deployment plugs its own
//! database-backed implementations into the same traits.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use classbook_core::error::StoreError;
use classbook_core::ports::{MembershipStore, RecordStore, ViabilityNotifier};
use classbook_core::types::{
    CenterId, ClassSession, MembershipWindow, Reservation, ReservationId, SessionId, StudentId,
    Viability,
};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

/// Record store keeping sessions and reservation rows in hash maps.
#[derive(Debug, Default)]
pub struct InMemoryRecordStore {
    sessions: RwLock<HashMap<SessionId, ClassSession>>,
    reservations: RwLock<HashMap<ReservationId, Reservation>>,
}

impl InMemoryRecordStore {
    /// Empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a session row
    pub fn insert_session(&self, session: ClassSession) {
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(session.id, session);
    }

    /// Seed a reservation row
    pub fn insert_reservation(&self, reservation: Reservation) {
        self.reservations
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(reservation.id, reservation);
    }

    /// The stored row of a reservation
    #[must_use]
    pub fn reservation(&self, id: ReservationId) -> Option<Reservation> {
        self.reservations
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    /// The stored row of a session
    #[must_use]
    pub fn session(&self, id: SessionId) -> Option<ClassSession> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn load_session(
        &self,
        session_id: SessionId,
    ) -> Result<Option<ClassSession>, StoreError> {
        Ok(self.session(session_id))
    }

    async fn load_reservations(
        &self,
        session_id: SessionId,
    ) -> Result<Vec<Reservation>, StoreError> {
        let mut rows: Vec<Reservation> = self
            .reservations
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|row| row.session_id == session_id)
            .cloned()
            .collect();
        rows.sort_by_key(|row| (row.requested_at, row.id));
        Ok(rows)
    }

    async fn save_reservation(&self, reservation: &Reservation) -> Result<(), StoreError> {
        self.insert_reservation(reservation.clone());
        Ok(())
    }

    async fn save_session(&self, session: &ClassSession) -> Result<(), StoreError> {
        self.insert_session(session.clone());
        Ok(())
    }
}

/// Membership store keeping validity windows in a list.
#[derive(Debug, Default)]
pub struct InMemoryMembershipStore {
    windows: RwLock<Vec<MembershipWindow>>,
}

impl InMemoryMembershipStore {
    /// Empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a membership window
    pub fn insert(&self, window: MembershipWindow) {
        self.windows
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(window);
    }
}

#[async_trait]
impl MembershipStore for InMemoryMembershipStore {
    async fn lookup_membership(
        &self,
        student_id: StudentId,
        center_id: CenterId,
        at: DateTime<Utc>,
    ) -> Result<Option<MembershipWindow>, StoreError> {
        Ok(self
            .windows
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|w| w.student_id == student_id && w.center_id == center_id && w.covers(at))
            .cloned())
    }
}

/// Notifier that only logs the decision.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

#[async_trait]
impl ViabilityNotifier for TracingNotifier {
    async fn session_decided(&self, session_id: SessionId, viability: Viability, confirmed: u32) {
        tracing::info!(%session_id, %viability, confirmed, "Session viability decided");
    }
}
