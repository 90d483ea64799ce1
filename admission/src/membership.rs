//! Membership eligibility checks.
//!
//! A pure read against the external membership store. The validator runs
//! before the seat ledger is touched and without any session lock, so an
//! ineligible student never consumes a hold, not even transiently.

use crate::retry::{RetryPolicy, retry_store};
use classbook_core::error::StoreError;
use classbook_core::ports::MembershipStore;
use classbook_core::types::{CenterId, StudentId};
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Answers whether a student may book at a center at a given time.
#[derive(Clone)]
pub struct MembershipValidator {
    store: Arc<dyn MembershipStore>,
    retry: RetryPolicy,
}

impl MembershipValidator {
    /// Creates a validator over `store`
    #[must_use]
    pub fn new(store: Arc<dyn MembershipStore>, retry: RetryPolicy) -> Self {
        Self { store, retry }
    }

    /// Whether a membership of `student_id` at `center_id` covers `at`.
    ///
    /// Returns `false`, not an error, when no window covers `at`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the store stays unreachable after the
    /// retry budget.
    pub async fn is_eligible(
        &self,
        student_id: StudentId,
        center_id: CenterId,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let window = retry_store(self.retry, "lookup_membership", || {
            self.store.lookup_membership(student_id, center_id, at)
        })
        .await?;

        let eligible = window.is_some_and(|window| {
            window.student_id == student_id && window.center_id == center_id && window.covers(at)
        });

        tracing::debug!(%student_id, %center_id, %at, eligible, "Membership checked");
        Ok(eligible)
    }
}
