//! # Classbook Core
//!
//! Core traits and domain types for class-session admission control.
//!
//! Business logic is written as reducers: pure functions
//! `(State, Action, Environment) → (State, Effects)`. A reducer mutates the
//! in-memory book of one class session and returns descriptions of the side
//! effects (durable writes) that the engine executes after the session lock
//! has been released.
//!
//! ## Core Concepts
//!
//! - **State**: the seat book of one class session
//! - **Action**: commands (request a seat, cancel) and feedback events
//!   (confirmation written, persistence failed)
//! - **Reducer**: the reservation state machine
//! - **Effect**: side effect descriptions, never executed by the reducer
//! - **Environment**: injected collaborators (record store, clock)
//!
//! ## Example
//!
//! ```ignore
//! impl Reducer for ReservationReducer {
//!     type State = SessionBook;
//!     type Action = ReservationAction;
//!     type Environment = ReservationEnvironment;
//!
//!     fn reduce(
//!         &self,
//!         state: &mut SessionBook,
//!         action: ReservationAction,
//!         env: &ReservationEnvironment,
//!     ) -> SmallVec<[Effect<ReservationAction>; 4]> {
//!         // Business logic goes here
//!         SmallVec::new()
//!     }
//! }
//! ```

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use serde::{Deserialize, Serialize};
pub use smallvec::{SmallVec, smallvec};

/// Error taxonomy shared by the engine and its collaborators
pub mod error;

/// Narrow interfaces to the external record store, membership store and
/// notification channel
pub mod ports;

/// Identifiers, sessions, reservations and outcomes
pub mod types;

/// Reducer module - The core trait for business logic
pub mod reducer {
    use super::effect::Effect;
    use smallvec::SmallVec;

    /// The Reducer trait - core abstraction for business logic
    ///
    /// # Type Parameters
    ///
    /// - `State`: The domain state this reducer operates on
    /// - `Action`: The action type this reducer processes
    /// - `Environment`: The injected dependencies this reducer needs
    pub trait Reducer {
        /// The state type this reducer operates on
        type State;

        /// The action type this reducer processes
        type Action;

        /// The environment type with injected dependencies
        type Environment;

        /// Reduce an action into state changes and effects
        ///
        /// Called while the caller holds exclusive access to `state`, so
        /// implementations must stay synchronous and must not perform I/O.
        /// I/O is described through the returned effects instead.
        fn reduce(
            &self,
            state: &mut Self::State,
            action: Self::Action,
            env: &Self::Environment,
        ) -> SmallVec<[Effect<Self::Action>; 4]>;
    }
}

/// Effect module - Side effect descriptions
///
/// Effects are values: they describe work for the engine to run once the
/// session lock is released. A `Future` effect may feed an action back into
/// the reducer.
pub mod effect {
    use futures::future::BoxFuture;

    /// Effect type - describes a side effect to be executed
    pub enum Effect<Action> {
        /// No-op effect
        None,

        /// Run effects concurrently
        Parallel(Vec<Effect<Action>>),

        /// Arbitrary async computation
        ///
        /// Returns `Option<Action>` - if Some, the action is fed back into the reducer
        Future(BoxFuture<'static, Option<Action>>),
    }

    // Manual Debug implementation since Future doesn't implement Debug
    impl<Action> std::fmt::Debug for Effect<Action> {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            match self {
                Effect::None => write!(f, "Effect::None"),
                Effect::Parallel(effects) => {
                    f.debug_tuple("Effect::Parallel").field(effects).finish()
                },
                Effect::Future(_) => write!(f, "Effect::Future(<future>)"),
            }
        }
    }

    impl<Action> Effect<Action> {
        /// Combine effects to run concurrently
        ///
        /// Collapses to `Effect::None` for an empty list and to the single
        /// effect for a one-element list.
        #[must_use]
        pub fn merge(mut effects: Vec<Effect<Action>>) -> Effect<Action> {
            match effects.len() {
                0 => Effect::None,
                1 => effects.pop().unwrap_or(Effect::None),
                _ => Effect::Parallel(effects),
            }
        }

        /// Whether this effect does nothing when executed
        #[must_use]
        pub fn is_none(&self) -> bool {
            match self {
                Effect::None => true,
                Effect::Parallel(effects) => effects.iter().all(Effect::is_none),
                Effect::Future(_) => false,
            }
        }
    }
}

/// Environment module - Dependency injection traits
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Wall clock backed by [`Utc::now`]
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}
