//! # keel-store
//!
//! Resilient SQLite-backed repository layer.
//!
//! - **Connections**: async [`ConnectionFactory`] implementations over
//!   direct and pooled SQLite handles, with the pragma profile applied to
//!   every connection.
//! - **Policy**: per-entity-type [`RetryPolicy`] composing a 60 s outer
//!   timeout with linear-backoff retries for lock contention, built once
//!   per type and shared process-wide.
//! - **Repositories**: the generic [`Repository`] CRUD core plus the
//!   [`EntityRepository`] surface concrete repositories implement.

#![deny(unsafe_code)]

pub mod connection;
pub mod policy;
pub mod repository;

pub use connection::{
    verify_pragmas, ConnectionConfig, ConnectionFactory, ConnectionPool, PooledConnectionFactory,
    PragmaState, SqliteConnectionFactory, StoreConnection,
};
pub use policy::{policy_for, verify_policy_outcome, PolicyOutcome, RetryPolicy, DEFAULT_TIMEOUT};
pub use repository::{short_type_name, Entity, EntityRepository, Repository};
