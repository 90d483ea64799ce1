//! Per-session hold sweeper.
//!
//! A background task that periodically releases pending holds older than the
//! hold timeout, re-flushes reservation rows whose durable write lagged, and
//! evaluates session viability so the decision is emitted at the cutoff even
//! when nobody asks for it. Each tick locks only its own session. Once the
//! session has started and everything is stored, the sweeper unloads the
//! book and stops.

use crate::engine::AdmissionEngine;
use chrono::{DateTime, Utc};
use classbook_core::error::AdmissionError;
use classbook_core::types::{ReservationId, SessionId, Viability};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// What one sweep did.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SweepReport {
    /// Pending holds released
    pub expired: Vec<ReservationId>,
    /// Viability after the sweep
    pub viability: Viability,
}

/// Handle of a running sweeper task.
#[derive(Debug)]
pub struct SweeperHandle {
    session_id: SessionId,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SweeperHandle {
    /// Session the sweeper looks after
    #[must_use]
    pub const fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Stop the sweeper and wait for its last tick to finish.
    pub async fn shutdown(self) {
        self.shutdown.send(true).ok();
        if let Err(e) = self.task.await {
            tracing::error!(session_id = %self.session_id, error = ?e, "Sweeper task failed");
        }
    }
}

impl AdmissionEngine {
    /// Run one sweep of a session at `now`.
    ///
    /// # Errors
    ///
    /// Returns [`AdmissionError::SessionNotFound`] for an unknown session, or
    /// [`AdmissionError::InvalidHoldState`] on a seat accounting fault.
    pub async fn sweep_session(
        &self,
        session_id: SessionId,
        now: DateTime<Utc>,
    ) -> Result<SweepReport, AdmissionError> {
        let expired = self.expire_and_flush(session_id, now).await?;
        let viability = self.viability(session_id, now).await?;
        Ok(SweepReport { expired, viability })
    }

    /// Spawn the background sweeper of a session.
    ///
    /// Ticks every `sweep_interval` using the engine clock until
    /// [`SweeperHandle::shutdown`] is called or the session is unloaded.
    #[must_use]
    pub fn spawn_sweeper(self: &Arc<Self>, session_id: SessionId) -> SweeperHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let engine = Arc::clone(self);
        let period = self.config().sweep_interval();

        let task = tokio::spawn(async move {
            tracing::info!(%session_id, ?period, "Starting hold sweeper");
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            while !*shutdown_rx.borrow() {
                tokio::select! {
                    _ = ticker.tick() => {
                        let now = engine.clock.now();
                        match engine.sweep_session(session_id, now).await {
                            Ok(report) if !report.expired.is_empty() => {
                                tracing::debug!(
                                    %session_id,
                                    expired = report.expired.len(),
                                    viability = %report.viability,
                                    "Sweep released holds"
                                );
                            }
                            Ok(_) => {}
                            Err(e) => {
                                // Keep sweeping; the next tick retries.
                                tracing::error!(%session_id, error = %e, "Sweep failed");
                            }
                        }
                        if engine.unload_session(session_id, now).await {
                            break;
                        }
                    }

                    changed = shutdown_rx.changed() => {
                        // A dropped handle stops the sweeper too.
                        if changed.is_err() || *shutdown_rx.borrow() {
                            tracing::info!(%session_id, "Shutdown signal received");
                            break;
                        }
                    }
                }
            }

            tracing::info!(%session_id, "Hold sweeper stopped");
        });

        SweeperHandle {
            session_id,
            shutdown: shutdown_tx,
            task,
        }
    }
}
