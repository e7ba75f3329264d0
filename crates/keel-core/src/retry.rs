//! Retry settings and backoff calculation.
//!
//! Portable, sync-only building blocks: the async retry execution lives in
//! `keel-store` (which has access to tokio), while this module provides
//! [`RetrySettings`] and the linear backoff schedule keyed by failure class.
//!
//! The schedule is linear, not exponential. Before the Nth retry the policy
//! waits `N` units after an ordinary transient failure and `N * 3` units
//! after a concurrency conflict — the stretched schedule spreads colliding
//! writers further apart under contention.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::ErrorClass;

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Default retry ceiling.
pub const DEFAULT_MAX_RETRY_COUNT: u32 = 11;
/// Default backoff unit in milliseconds (one second, the production scale).
pub const DEFAULT_BACKOFF_UNIT_MS: u64 = 1000;

/// Settings for the repository retry policy.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrySettings {
    /// Retry ceiling (default: 11). Each failed execution increments the
    /// attempt counter; when it reaches this ceiling the operation fails
    /// with `RetriesExhausted` instead of scheduling another retry, so a
    /// persistently failing operation executes exactly this many times.
    #[serde(default = "default_max_retry_count")]
    pub max_retry_count: u32,
    /// Linear backoff unit in milliseconds (default: 1000).
    #[serde(default = "default_backoff_unit_ms")]
    pub backoff_unit_ms: u64,
}

fn default_max_retry_count() -> u32 {
    DEFAULT_MAX_RETRY_COUNT
}
fn default_backoff_unit_ms() -> u64 {
    DEFAULT_BACKOFF_UNIT_MS
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retry_count: DEFAULT_MAX_RETRY_COUNT,
            backoff_unit_ms: DEFAULT_BACKOFF_UNIT_MS,
        }
    }
}

impl RetrySettings {
    /// The backoff unit as a [`Duration`].
    #[must_use]
    pub fn backoff_unit(&self) -> Duration {
        Duration::from_millis(self.backoff_unit_ms)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Backoff calculation
// ─────────────────────────────────────────────────────────────────────────────

/// Compute the wait before the Nth retry.
///
/// - [`ErrorClass::Concurrency`] waits `attempt * 3` units
/// - [`ErrorClass::Transient`] waits `attempt` units
/// - [`ErrorClass::Fatal`] is never retried; the delay is zero
///
/// `attempt` is 1-based: the wait before the first retry is one (or three)
/// units, before the second two (or six), and so on.
#[must_use]
pub fn backoff_delay(attempt: u32, class: ErrorClass, unit: Duration) -> Duration {
    match class {
        ErrorClass::Concurrency => unit * attempt.saturating_mul(3),
        ErrorClass::Transient => unit * attempt,
        ErrorClass::Fatal => Duration::ZERO,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
