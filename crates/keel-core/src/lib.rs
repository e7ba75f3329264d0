//! # keel-core
//!
//! Portable building blocks for the Keel resilient repository layer.
//!
//! - **Errors**: the [`RepositoryError`] taxonomy, the structured
//!   [`StoreError`] value, and retry classification via [`ErrorClass`]
//! - **Retry**: [`RetrySettings`] and the linear backoff schedule
//!
//! Async execution lives in `keel-store`; this crate stays sync-only so the
//! taxonomy and backoff math are usable from any runtime.

#![deny(unsafe_code)]

pub mod errors;
pub mod retry;

pub use errors::{
    classify, message_indicates_lock_contention, ErrorClass, RepositoryError, Result, StoreError,
    CONCURRENCY_CODES,
};
pub use retry::{backoff_delay, RetrySettings, DEFAULT_BACKOFF_UNIT_MS, DEFAULT_MAX_RETRY_COUNT};
