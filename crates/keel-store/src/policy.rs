//! Composed timeout+retry policy, cached per repository type.
//!
//! The policy has two layers: an outer timeout (default 60 s, per-call
//! overridable) wrapping an inner retry loop. The loop re-executes an action
//! only when its failure is a retryable [`StoreError`]; the wait before the
//! Nth retry follows the linear schedule in [`keel_core::retry`]. One
//! [`RetryPolicy`] exists per repository type for the process lifetime,
//! built on first use through [`policy_for`].
//!
//! [`verify_policy_outcome`] is the single point translating a completed
//! policy execution into the caller-visible result: timeout rejections
//! become [`RepositoryError::Timeout`], everything else passes through
//! unchanged.

use std::any::TypeId;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use parking_lot::RwLock;
use tokio::time::error::Elapsed;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use keel_core::errors::{RepositoryError, Result};
use keel_core::retry::{backoff_delay, RetrySettings};

/// Default outer timeout applied to policy-wrapped executions.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

// ─────────────────────────────────────────────────────────────────────────────
// Policy
// ─────────────────────────────────────────────────────────────────────────────

/// The retry half of the composed policy: attempt ceiling plus backoff unit.
///
/// Read-only after construction and shared by every instance of a repository
/// type; concurrent executions each keep their own attempt counter and wait
/// schedule.
#[derive(Debug)]
pub struct RetryPolicy {
    max_retry_count: u32,
    backoff_unit: Duration,
}

impl RetryPolicy {
    /// Build a policy from settings. The ceiling is clamped to at least 1.
    #[must_use]
    pub fn from_settings(settings: &RetrySettings) -> Self {
        Self {
            max_retry_count: settings.max_retry_count.max(1),
            backoff_unit: settings.backoff_unit(),
        }
    }

    /// The attempt ceiling.
    #[must_use]
    pub fn max_retry_count(&self) -> u32 {
        self.max_retry_count
    }

    /// Execute `action`, retrying retryable store failures with linear
    /// backoff until the ceiling fires.
    ///
    /// Each failed execution increments the attempt counter and logs the
    /// failure, the attempt number, and the computed wait. When the counter
    /// reaches the ceiling the loop fails with
    /// [`RepositoryError::RetriesExhausted`] carrying the last store failure
    /// instead of scheduling the final retry, so a persistently failing
    /// action executes exactly `max_retry_count` times. Fatal store failures
    /// and non-store errors propagate immediately, unretried.
    ///
    /// Cancellation is checked before every execution and raced against each
    /// backoff sleep; a triggered token fails with
    /// [`RepositoryError::Cancelled`] and schedules no further attempts.
    pub async fn run<R, F, Fut>(
        &self,
        repository: &str,
        mut action: F,
        cancel: &CancellationToken,
    ) -> Result<R>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        let mut attempt = 0u32;
        loop {
            if cancel.is_cancelled() {
                return Err(RepositoryError::Cancelled);
            }

            let err = match action().await {
                Ok(value) => return Ok(value),
                Err(RepositoryError::Store(err)) if err.is_retryable() => err,
                Err(other) => return Err(other),
            };

            attempt += 1;
            let wait = backoff_delay(attempt, err.class, self.backoff_unit);
            warn!(
                error = %err,
                repository,
                attempt,
                wait_ms = u64::try_from(wait.as_millis()).unwrap_or(u64::MAX),
                "store operation failed, retrying"
            );

            if attempt >= self.max_retry_count {
                return Err(RepositoryError::RetriesExhausted {
                    attempts: attempt,
                    source: err,
                });
            }

            tokio::select! {
                () = tokio::time::sleep(wait) => {}
                () = cancel.cancelled() => return Err(RepositoryError::Cancelled),
            }
        }
    }

    /// Execute `action` under the composed policy: `timeout` wrapping the
    /// retry loop, with the outcome translated by [`verify_policy_outcome`].
    ///
    /// A timeout short-circuits regardless of remaining retry budget; the
    /// resulting error names `repository`.
    pub async fn execute<R, F, Fut>(
        &self,
        repository: &str,
        timeout: Duration,
        action: F,
        cancel: &CancellationToken,
    ) -> Result<R>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        let outcome = tokio::time::timeout(timeout, self.run(repository, action, cancel)).await;
        verify_policy_outcome(outcome, repository, timeout)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Outcome verification
// ─────────────────────────────────────────────────────────────────────────────

/// Captured outcome of a policy-wrapped execution: the inner result, or the
/// outer timeout rejection.
pub type PolicyOutcome<R> = std::result::Result<Result<R>, Elapsed>;

/// Translate a completed policy execution into the caller-visible result.
///
/// A timeout rejection becomes [`RepositoryError::Timeout`] naming the
/// repository. An inner failure is rethrown unchanged: store errors keep
/// their original diagnostics and are never re-wrapped, and the same holds
/// for every other taxonomy kind. Success passes the value through.
pub fn verify_policy_outcome<R>(
    outcome: PolicyOutcome<R>,
    repository: &str,
    timeout: Duration,
) -> Result<R> {
    match outcome {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(err),
        Err(_elapsed) => Err(RepositoryError::Timeout {
            repository: repository.to_string(),
            timeout_secs: timeout.as_secs(),
        }),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Per-type policy cache
// ─────────────────────────────────────────────────────────────────────────────

type PolicyCache = RwLock<HashMap<TypeId, Arc<RetryPolicy>>>;

static POLICIES: OnceLock<PolicyCache> = OnceLock::new();

/// Fetch the shared policy for repository type `T`, building it on first
/// use.
///
/// The policy survives for the process lifetime. Construction is safe under
/// concurrent first use: the registry is guarded, the first writer's policy
/// is kept, and `settings` passed by later callers are ignored.
pub fn policy_for<T: 'static>(settings: &RetrySettings) -> Arc<RetryPolicy> {
    let cache = POLICIES.get_or_init(|| RwLock::new(HashMap::new()));
    if let Some(policy) = cache.read().get(&TypeId::of::<T>()) {
        return Arc::clone(policy);
    }
    let mut cache = cache.write();
    Arc::clone(
        cache
            .entry(TypeId::of::<T>())
            .or_insert_with(|| Arc::new(RetryPolicy::from_settings(settings))),
    )
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
