//! Configuration for the admission engine.
//!
//! Loads configuration from environment variables with sensible defaults.

use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// How a granted seat hold becomes a confirmed reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfirmationPolicy {
    /// The engine confirms right after the grant
    #[default]
    Auto,
    /// Holds stay pending until an operator approves or declines them
    Manual,
}

impl FromStr for ConfirmationPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "manual" => Ok(Self::Manual),
            other => Err(format!("unknown confirmation policy: {other}")),
        }
    }
}

/// Admission engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionConfig {
    /// Viability is decided this many seconds before the scheduled start
    pub viability_cutoff_secs: i64,
    /// Lifetime of an unconfirmed seat hold in seconds
    pub hold_timeout_secs: i64,
    /// Sweeper tick in milliseconds
    pub sweep_interval_ms: u64,
    /// Auto or manual confirmation
    pub confirmation: ConfirmationPolicy,
    /// Store retry attempts after the first failure
    pub store_max_retries: u32,
    /// First store backoff in milliseconds
    pub store_retry_initial_ms: u64,
    /// Store backoff cap in milliseconds
    pub store_retry_max_ms: u64,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            viability_cutoff_secs: 7200, // 2 hours
            hold_timeout_secs: 30,
            sweep_interval_ms: 1000,
            confirmation: ConfirmationPolicy::Auto,
            store_max_retries: 3,
            store_retry_initial_ms: 50,
            store_retry_max_ms: 2000,
        }
    }
}

impl AdmissionConfig {
    /// Load configuration from environment variables.
    ///
    /// Unset or unparseable variables fall back to their defaults.
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            viability_cutoff_secs: env::var("CLASSBOOK_VIABILITY_CUTOFF_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.viability_cutoff_secs),
            hold_timeout_secs: env::var("CLASSBOOK_HOLD_TIMEOUT_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.hold_timeout_secs),
            sweep_interval_ms: env::var("CLASSBOOK_SWEEP_INTERVAL_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.sweep_interval_ms),
            confirmation: env::var("CLASSBOOK_CONFIRMATION")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.confirmation),
            store_max_retries: env::var("CLASSBOOK_STORE_MAX_RETRIES")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.store_max_retries),
            store_retry_initial_ms: env::var("CLASSBOOK_STORE_RETRY_INITIAL_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.store_retry_initial_ms),
            store_retry_max_ms: env::var("CLASSBOOK_STORE_RETRY_MAX_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.store_retry_max_ms),
        }
    }

    /// Set the confirmation policy
    #[must_use]
    pub const fn with_confirmation(mut self, confirmation: ConfirmationPolicy) -> Self {
        self.confirmation = confirmation;
        self
    }

    /// Set the hold timeout
    #[must_use]
    pub const fn with_hold_timeout_secs(mut self, secs: i64) -> Self {
        self.hold_timeout_secs = secs;
        self
    }

    /// Set the viability cutoff
    #[must_use]
    pub const fn with_viability_cutoff_secs(mut self, secs: i64) -> Self {
        self.viability_cutoff_secs = secs;
        self
    }

    /// Set the sweeper tick
    #[must_use]
    pub const fn with_sweep_interval_ms(mut self, ms: u64) -> Self {
        self.sweep_interval_ms = ms;
        self
    }

    /// Cutoff before the scheduled start
    #[must_use]
    pub fn viability_cutoff(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.viability_cutoff_secs.max(0))
    }

    /// Pending hold lifetime
    #[must_use]
    pub fn hold_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.hold_timeout_secs.max(0))
    }

    /// Sweeper tick, never zero
    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(1))
    }

    /// Backoff for store calls
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.store_max_retries,
            initial_delay: Duration::from_millis(self.store_retry_initial_ms),
            max_delay: Duration::from_millis(self.store_retry_max_ms),
            ..RetryPolicy::default()
        }
    }
}
