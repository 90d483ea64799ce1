//! Seat ledger for one class session.
//!
//! The ledger is the single source of truth for seat accounting. It tracks
//! every hold by reservation id so that confirming or releasing a hold that
//! does not exist is detected as a fault instead of silently skewing the
//! counters.
//!
//! The ledger itself is plain data. Linearizability comes from the session
//! lock the engine holds around every call: `try_reserve` performs its
//! check-and-increment inside that critical section, so two requests racing
//! for the last seat can never both observe `available == 1`.

use classbook_core::error::InvalidHoldState;
use classbook_core::types::{Capacity, RejectionReason, ReservationId, SeatStatus};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// State of one seat hold.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum HoldState {
    /// Provisional claim
    Pending,
    /// Final claim
    Confirmed,
}

/// Answer to an admission attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SeatGrant {
    /// A pending hold was created
    Granted,
    /// Nothing changed; always [`RejectionReason::CapacityExceeded`]
    Denied(RejectionReason),
}

/// Authoritative seat counters of one session.
#[derive(Clone, Debug)]
pub struct SeatLedger {
    capacity: Capacity,
    holds: HashMap<ReservationId, HoldState>,
    confirmed: u32,
    pending: u32,
    canceled: u32,
}

impl SeatLedger {
    /// Empty ledger for the given bounds
    #[must_use]
    pub fn new(capacity: Capacity) -> Self {
        Self {
            capacity,
            holds: HashMap::new(),
            confirmed: 0,
            pending: 0,
            canceled: 0,
        }
    }

    /// Attendee bounds
    #[must_use]
    pub const fn capacity(&self) -> Capacity {
        self.capacity
    }

    /// Confirmed seats
    #[must_use]
    pub const fn confirmed(&self) -> u32 {
        self.confirmed
    }

    /// Pending holds
    #[must_use]
    pub const fn pending(&self) -> u32 {
        self.pending
    }

    /// Seats released by cancellation
    #[must_use]
    pub const fn canceled(&self) -> u32 {
        self.canceled
    }

    /// `max - confirmed - pending`
    #[must_use]
    pub const fn available(&self) -> u32 {
        self.capacity
            .max_attendees()
            .saturating_sub(self.confirmed + self.pending)
    }

    /// State of a hold, if it exists
    #[must_use]
    pub fn hold(&self, hold: &ReservationId) -> Option<HoldState> {
        self.holds.get(hold).copied()
    }

    /// Snapshot for callers outside the session lock
    #[must_use]
    pub const fn status(&self) -> SeatStatus {
        SeatStatus {
            confirmed: self.confirmed,
            pending: self.pending,
            canceled: self.canceled,
            available: self.available(),
            max_attendees: self.capacity.max_attendees(),
            min_attendees: self.capacity.min_attendees(),
        }
    }

    /// Atomically claim a seat as a pending hold.
    ///
    /// Denied leaves the ledger untouched.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidHoldState`] if `hold` already exists.
    pub fn try_reserve(&mut self, hold: ReservationId) -> Result<SeatGrant, InvalidHoldState> {
        if self.holds.contains_key(&hold) {
            return Err(InvalidHoldState {
                hold,
                detail: "hold already exists",
            });
        }
        if self.available() == 0 {
            return Ok(SeatGrant::Denied(RejectionReason::CapacityExceeded));
        }
        self.holds.insert(hold, HoldState::Pending);
        self.pending += 1;
        Ok(SeatGrant::Granted)
    }

    /// Move a pending hold to confirmed.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidHoldState`] unless `hold` is pending.
    pub fn confirm(&mut self, hold: ReservationId) -> Result<(), InvalidHoldState> {
        match self.holds.get_mut(&hold) {
            Some(state @ HoldState::Pending) => {
                *state = HoldState::Confirmed;
                self.pending -= 1;
                self.confirmed += 1;
                Ok(())
            }
            Some(HoldState::Confirmed) => Err(InvalidHoldState {
                hold,
                detail: "hold is already confirmed",
            }),
            None => Err(InvalidHoldState {
                hold,
                detail: "no such hold",
            }),
        }
    }

    /// Drop a pending hold that will never be confirmed.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidHoldState`] unless `hold` is pending.
    pub fn reject(&mut self, hold: ReservationId) -> Result<(), InvalidHoldState> {
        match self.holds.get(&hold) {
            Some(HoldState::Pending) => {
                self.holds.remove(&hold);
                self.pending -= 1;
                Ok(())
            }
            Some(HoldState::Confirmed) => Err(InvalidHoldState {
                hold,
                detail: "confirmed holds are released, not rejected",
            }),
            None => Err(InvalidHoldState {
                hold,
                detail: "no such hold",
            }),
        }
    }

    /// Release a pending or confirmed hold on cancellation.
    ///
    /// Returns the state the hold was in.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidHoldState`] if `hold` does not exist.
    pub fn release(&mut self, hold: ReservationId) -> Result<HoldState, InvalidHoldState> {
        let state = self.holds.remove(&hold).ok_or(InvalidHoldState {
            hold,
            detail: "no such hold",
        })?;
        match state {
            HoldState::Pending => self.pending -= 1,
            HoldState::Confirmed => self.confirmed -= 1,
        }
        self.canceled += 1;
        Ok(state)
    }

    /// Change the attendee bounds.
    ///
    /// # Errors
    ///
    /// Returns a reason when a seat is already confirmed or the new maximum
    /// is below the holds outstanding.
    pub fn resize(&mut self, capacity: Capacity) -> Result<(), &'static str> {
        self.check_resize(capacity)?;
        self.capacity = capacity;
        Ok(())
    }

    /// Whether [`Self::resize`] would accept `capacity` right now.
    ///
    /// # Errors
    ///
    /// Returns the reason the edit would be refused.
    pub const fn check_resize(&self, capacity: Capacity) -> Result<(), &'static str> {
        if self.confirmed > 0 {
            return Err("a reservation is already confirmed");
        }
        if capacity.max_attendees() < self.pending {
            return Err("new maximum is below the seats currently held");
        }
        Ok(())
    }

    /// Re-create a hold from a persisted reservation row.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidHoldState`] if `hold` already exists.
    pub fn restore(&mut self, hold: ReservationId, state: HoldState) -> Result<(), InvalidHoldState> {
        if self.holds.insert(hold, state).is_some() {
            return Err(InvalidHoldState {
                hold,
                detail: "hold restored twice",
            });
        }
        match state {
            HoldState::Pending => self.pending += 1,
            HoldState::Confirmed => self.confirmed += 1,
        }
        Ok(())
    }

    /// Count a cancellation recovered from a persisted row.
    pub const fn restore_canceled(&mut self) {
        self.canceled += 1;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn ledger(max: u32) -> SeatLedger {
        SeatLedger::new(Capacity::new(1, max).unwrap())
    }

    #[test]
    fn last_seat_is_granted_once() {
        let mut ledger = ledger(1);
        assert_eq!(ledger.try_reserve(ReservationId::new()).unwrap(), SeatGrant::Granted);
        assert_eq!(
            ledger.try_reserve(ReservationId::new()).unwrap(),
            SeatGrant::Denied(RejectionReason::CapacityExceeded)
        );
        assert_eq!(ledger.pending(), 1);
        assert_eq!(ledger.available(), 0);
    }

    #[test]
    fn confirm_moves_pending_to_confirmed() {
        let mut ledger = ledger(2);
        let hold = ReservationId::new();
        ledger.try_reserve(hold).unwrap();
        ledger.confirm(hold).unwrap();

        assert_eq!(ledger.pending(), 0);
        assert_eq!(ledger.confirmed(), 1);
        assert_eq!(ledger.available(), 1);
        assert_eq!(ledger.hold(&hold), Some(HoldState::Confirmed));
    }

    #[test]
    fn release_frees_a_confirmed_seat_immediately() {
        let mut ledger = ledger(1);
        let hold = ReservationId::new();
        ledger.try_reserve(hold).unwrap();
        ledger.confirm(hold).unwrap();

        assert_eq!(ledger.release(hold).unwrap(), HoldState::Confirmed);
        assert_eq!(ledger.available(), 1);
        assert_eq!(ledger.canceled(), 1);
    }

    #[test]
    fn unknown_holds_are_faults_not_capacity_conditions() {
        let mut ledger = ledger(1);
        let ghost = ReservationId::new();

        assert_eq!(ledger.confirm(ghost).unwrap_err().hold, ghost);
        assert!(ledger.reject(ghost).is_err());
        assert!(ledger.release(ghost).is_err());

        let hold = ReservationId::new();
        ledger.try_reserve(hold).unwrap();
        assert!(ledger.try_reserve(hold).is_err());
        ledger.confirm(hold).unwrap();
        assert!(ledger.confirm(hold).is_err());
        assert!(ledger.reject(hold).is_err());
        assert_eq!(ledger.confirmed(), 1);
    }

    #[test]
    fn resize_is_refused_once_confirmed() {
        let mut ledger = ledger(3);
        let hold = ReservationId::new();
        ledger.try_reserve(hold).unwrap();
        ledger.try_reserve(ReservationId::new()).unwrap();

        assert!(ledger.resize(Capacity::new(1, 1).unwrap()).is_err());
        ledger.resize(Capacity::new(1, 2).unwrap()).unwrap();
        assert_eq!(ledger.available(), 0);

        ledger.confirm(hold).unwrap();
        assert!(ledger.resize(Capacity::new(1, 5).unwrap()).is_err());
    }

    #[derive(Debug, Clone)]
    enum Op {
        Reserve,
        Confirm(usize),
        Reject(usize),
        Release(usize),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            3 => Just(Op::Reserve),
            2 => any::<usize>().prop_map(Op::Confirm),
            1 => any::<usize>().prop_map(Op::Reject),
            1 => any::<usize>().prop_map(Op::Release),
        ]
    }

    proptest! {
        #[test]
        fn counters_never_exceed_capacity(max in 1u32..6, ops in prop::collection::vec(op(), 0..64)) {
            let mut ledger = ledger(max);
            let mut seen: Vec<ReservationId> = Vec::new();

            for op in ops {
                match op {
                    Op::Reserve => {
                        let hold = ReservationId::new();
                        if ledger.try_reserve(hold).unwrap() == SeatGrant::Granted {
                            seen.push(hold);
                        }
                    }
                    Op::Confirm(i) if !seen.is_empty() => {
                        let _ = ledger.confirm(seen[i % seen.len()]);
                    }
                    Op::Reject(i) if !seen.is_empty() => {
                        let _ = ledger.reject(seen[i % seen.len()]);
                    }
                    Op::Release(i) if !seen.is_empty() => {
                        let _ = ledger.release(seen[i % seen.len()]);
                    }
                    _ => {}
                }

                prop_assert!(ledger.confirmed() + ledger.pending() <= max);
                prop_assert_eq!(ledger.available(), max - ledger.confirmed() - ledger.pending());
                let pending = seen.iter().filter(|h| ledger.hold(h) == Some(HoldState::Pending)).count();
                let confirmed = seen.iter().filter(|h| ledger.hold(h) == Some(HoldState::Confirmed)).count();
                prop_assert_eq!(pending as u32, ledger.pending());
                prop_assert_eq!(confirmed as u32, ledger.confirmed());
            }
        }
    }
}
