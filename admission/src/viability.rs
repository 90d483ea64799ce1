//! Session viability monitor.
//!
//! Before the cutoff (`schedule - cutoff`) the outcome is `Undetermined`.
//! The first evaluation at or after the cutoff freezes the outcome; later
//! cancellations or late sign-ups never change it. Only an explicit operator
//! reopen thaws it.

use chrono::{DateTime, Duration, Utc};
use classbook_core::types::{ClassSession, Viability};

/// Result of one evaluation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ViabilityCheck {
    /// Current outcome
    pub viability: Viability,
    /// Confirmed head count the frozen outcome was decided on
    pub decided_on: u32,
    /// True exactly once per decision: the caller must emit it
    pub newly_decided: bool,
}

/// Frozen viability state of one session.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ViabilityMonitor {
    decision: Option<(Viability, u32)>,
}

impl ViabilityMonitor {
    /// Nothing decided yet
    #[must_use]
    pub const fn new() -> Self {
        Self { decision: None }
    }

    /// The frozen outcome, if any
    #[must_use]
    pub fn decision(&self) -> Option<Viability> {
        self.decision.map(|(viability, _)| viability)
    }

    /// Evaluate against the live confirmed count.
    pub fn evaluate(
        &mut self,
        session: &ClassSession,
        confirmed: u32,
        cutoff: Duration,
        now: DateTime<Utc>,
    ) -> ViabilityCheck {
        if let Some((viability, decided_on)) = self.decision {
            return ViabilityCheck {
                viability,
                decided_on,
                newly_decided: false,
            };
        }

        if now < session.schedule - cutoff {
            return ViabilityCheck {
                viability: Viability::Undetermined,
                decided_on: confirmed,
                newly_decided: false,
            };
        }

        let viability = if confirmed >= session.capacity.min_attendees() {
            Viability::Viable
        } else {
            Viability::NonViable
        };
        self.decision = Some((viability, confirmed));

        ViabilityCheck {
            viability,
            decided_on: confirmed,
            newly_decided: true,
        }
    }

    /// Thaw the decision after an operator reopens the session
    pub const fn reopen(&mut self) {
        self.decision = None;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use classbook_core::types::{Capacity, CenterId, InstructorId};

    fn session(min: u32, max: u32) -> ClassSession {
        ClassSession::new(
            "Morning Flow",
            "yoga",
            CenterId::new(),
            InstructorId::new(),
            DateTime::parse_from_rfc3339("2025-06-02T10:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
            Capacity::new(min, max).unwrap(),
        )
    }

    #[test]
    fn undetermined_before_cutoff() {
        let session = session(1, 10);
        let mut monitor = ViabilityMonitor::new();
        let check = monitor.evaluate(
            &session,
            5,
            Duration::hours(2),
            session.schedule - Duration::hours(3),
        );

        assert_eq!(check.viability, Viability::Undetermined);
        assert!(!check.newly_decided);
        assert_eq!(monitor.decision(), None);
    }

    #[test]
    fn decided_once_at_cutoff() {
        let session = session(2, 10);
        let cutoff = Duration::hours(2);
        let at_cutoff = session.schedule - cutoff;
        let mut monitor = ViabilityMonitor::new();

        let first = monitor.evaluate(&session, 2, cutoff, at_cutoff);
        assert_eq!(first.viability, Viability::Viable);
        assert!(first.newly_decided);

        let second = monitor.evaluate(&session, 0, cutoff, at_cutoff + Duration::minutes(5));
        assert_eq!(second.viability, Viability::Viable);
        assert_eq!(second.decided_on, 2);
        assert!(!second.newly_decided);
    }

    #[test]
    fn non_viable_stays_frozen_until_reopened() {
        let session = session(3, 10);
        let cutoff = Duration::hours(1);
        let after = session.schedule - Duration::minutes(30);
        let mut monitor = ViabilityMonitor::new();

        assert_eq!(monitor.evaluate(&session, 2, cutoff, after).viability, Viability::NonViable);
        assert_eq!(monitor.evaluate(&session, 3, cutoff, after).viability, Viability::NonViable);

        monitor.reopen();
        let check = monitor.evaluate(&session, 3, cutoff, after);
        assert_eq!(check.viability, Viability::Viable);
        assert!(check.newly_decided);
    }
}
