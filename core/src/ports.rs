//! Collaborator interfaces consumed by the admission engine.
//!
//! Implementations live outside the engine: the durable record store, the
//! membership store and the notification channel that tells students and
//! instructors whether a session will run.

use crate::error::StoreError;
use crate::types::{
    CenterId, ClassSession, MembershipWindow, Reservation, SessionId, StudentId, Viability,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Durable persistence of class sessions and reservation rows.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Load a session's capacity bounds and schedule.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the store cannot be read.
    async fn load_session(&self, session_id: SessionId)
    -> Result<Option<ClassSession>, StoreError>;

    /// Load every reservation row recorded for a session.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the store cannot be read.
    async fn load_reservations(&self, session_id: SessionId)
    -> Result<Vec<Reservation>, StoreError>;

    /// Insert or overwrite a reservation row.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the write fails.
    async fn save_reservation(&self, reservation: &Reservation) -> Result<(), StoreError>;

    /// Insert or overwrite a session row.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the write fails.
    async fn save_session(&self, session: &ClassSession) -> Result<(), StoreError>;
}

/// Read-only access to membership validity windows.
#[async_trait]
pub trait MembershipStore: Send + Sync {
    /// Find the student's membership at `center_id` covering `at`, if any.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the store cannot be read.
    async fn lookup_membership(
        &self,
        student_id: StudentId,
        center_id: CenterId,
        at: DateTime<Utc>,
    ) -> Result<Option<MembershipWindow>, StoreError>;
}

/// Receives the one-shot viability decision of a session.
#[async_trait]
pub trait ViabilityNotifier: Send + Sync {
    /// Called once per decision with the confirmed head count at the cutoff.
    async fn session_decided(&self, session_id: SessionId, viability: Viability, confirmed: u32);
}
