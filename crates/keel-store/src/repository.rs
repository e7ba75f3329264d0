//! Generic repository over a single entity table.
//!
//! [`Repository`] carries the shared per-entity machinery: a connection
//! factory, the table name, and the process-wide retry policy for the
//! entity type. Entity-specific repositories wrap it, add their own SQL,
//! and route write paths through [`Repository::execute_with_retry`] when
//! they opt in to the resilience policy. Base lookups run directly so a
//! plain read never pays for retry bookkeeping.

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::{Connection, Row};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use keel_core::errors::{RepositoryError, Result, StoreError};
use keel_core::retry::RetrySettings;

use crate::connection::{ConnectionFactory, StoreConnection};
use crate::policy::{policy_for, RetryPolicy, DEFAULT_TIMEOUT};

// ─────────────────────────────────────────────────────────────────────────────
// Entity
// ─────────────────────────────────────────────────────────────────────────────

/// A row-mapped type stored in its own table.
///
/// Tables are keyed by a `TEXT` primary key column named `id` holding the
/// canonical hyphenated UUID form, and carry nullable
/// `effective_interval_start_date` / `effective_interval_end_date` columns
/// feeding the effective-interval projection on single-row lookups.
pub trait Entity: Send + Sync + Sized + 'static {
    /// Stable identifier, stored in the table's `id` column.
    fn id(&self) -> Uuid;

    /// Table holding this entity. Defaults to the short type name.
    #[must_use]
    fn table_name() -> &'static str {
        short_type_name::<Self>()
    }

    /// Map one result row onto the entity.
    ///
    /// # Errors
    ///
    /// Returns the row error when a column is missing or fails conversion.
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self>;
}

/// Final segment of `T`'s type path.
#[must_use]
pub fn short_type_name<T>() -> &'static str {
    let full = std::any::type_name::<T>();
    full.rsplit("::").next().unwrap_or(full)
}

// ─────────────────────────────────────────────────────────────────────────────
// Repository
// ─────────────────────────────────────────────────────────────────────────────

/// Shared CRUD core for one entity type.
///
/// Cheap to clone; clones share the factory and the cached policy. Every
/// instance of the same entity type observes the same [`RetryPolicy`], the
/// one built from the settings seen at first construction.
pub struct Repository<T: Entity> {
    factory: Arc<dyn ConnectionFactory>,
    table: String,
    label: &'static str,
    policy: Arc<RetryPolicy>,
    _entity: PhantomData<fn() -> T>,
}

impl<T: Entity> Repository<T> {
    /// Repository over [`Entity::table_name`] with default retry settings.
    #[must_use]
    pub fn new(factory: Arc<dyn ConnectionFactory>) -> Self {
        Self::with_settings(factory, &RetrySettings::default())
    }

    /// Repository over [`Entity::table_name`] with explicit retry settings.
    ///
    /// Settings only take effect for the first repository of the entity
    /// type built in this process; later ones reuse the cached policy.
    #[must_use]
    pub fn with_settings(factory: Arc<dyn ConnectionFactory>, settings: &RetrySettings) -> Self {
        Self::bound(factory, T::table_name().to_string(), settings)
    }

    /// Repository over an explicit table, for entities mapped to more than
    /// one table (archive copies, shadow tables).
    #[must_use]
    pub fn with_table(factory: Arc<dyn ConnectionFactory>, table: impl Into<String>) -> Self {
        Self::bound(factory, table.into(), &RetrySettings::default())
    }

    fn bound(factory: Arc<dyn ConnectionFactory>, table: String, settings: &RetrySettings) -> Self {
        Self {
            factory,
            table,
            label: short_type_name::<T>(),
            policy: policy_for::<T>(settings),
            _entity: PhantomData,
        }
    }

    /// The table this repository reads and writes.
    #[must_use]
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Open a store connection through the configured factory.
    pub async fn connection(&self) -> Result<StoreConnection> {
        self.factory.connection().await
    }

    /// Run a synchronous statement task on a fresh connection, off the
    /// async runtime.
    pub async fn with_connection<R, F>(&self, task: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&Connection) -> Result<R> + Send + 'static,
    {
        let conn = self.factory.connection().await?;
        run_blocking(move || task(&conn)).await
    }

    /// Fetch the entity with `id`.
    ///
    /// # Errors
    ///
    /// Fails with [`RepositoryError::NotFound`] naming the table when no
    /// row matches.
    pub async fn find_by_id(&self, id: Uuid) -> Result<T> {
        self.try_find_by_id(id).await?.ok_or_else(|| RepositoryError::NotFound {
            table: self.table.clone(),
            id,
        })
    }

    /// Fetch the entity with `id`, or `None` when no row matches.
    pub async fn try_find_by_id(&self, id: Uuid) -> Result<Option<T>> {
        let sql = statements::select_by_id_sql(&self.table);
        self.with_connection(move |conn| statements::select_by_id::<T>(conn, &sql, id))
            .await
    }

    /// Fetch one entity per id, in the order given.
    ///
    /// Lookups run one at a time; the first missing id fails the whole
    /// call with [`RepositoryError::NotFound`].
    pub async fn find_by_ids(&self, ids: &[Uuid]) -> Result<Vec<T>> {
        let mut entities = Vec::with_capacity(ids.len());
        for &id in ids {
            entities.push(self.find_by_id(id).await?);
        }
        Ok(entities)
    }

    /// Delete the row for `entity`. Missing rows are a no-op.
    pub async fn delete(&self, entity: &T) -> Result<()> {
        self.delete_by_id(entity.id()).await
    }

    /// Delete the row with `id`. Missing rows are a no-op.
    pub async fn delete_by_id(&self, id: Uuid) -> Result<()> {
        let sql = statements::delete_by_id_sql(&self.table);
        let _affected = self
            .with_connection(move |conn| statements::delete_by_id(conn, &sql, id))
            .await?;
        Ok(())
    }

    /// Delete each entity in order, stopping at the first failure.
    ///
    /// Not atomic: rows deleted before a failure stay deleted.
    pub async fn delete_all(&self, entities: &[T]) -> Result<()> {
        for entity in entities {
            self.delete(entity).await?;
        }
        Ok(())
    }

    /// Whether a row with `id` exists.
    pub async fn exists(&self, id: Uuid) -> Result<bool> {
        let sql = statements::exists_sql(&self.table);
        self.with_connection(move |conn| statements::exists(conn, &sql, id))
            .await
    }

    /// Execute `action` under the entity type's resilience policy with the
    /// default outer timeout.
    pub async fn execute_with_retry<R, F, Fut>(
        &self,
        action: F,
        cancel: &CancellationToken,
    ) -> Result<R>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        self.execute_with_retry_within(DEFAULT_TIMEOUT, action, cancel)
            .await
    }

    /// Execute `action` under the entity type's resilience policy with an
    /// explicit outer timeout.
    pub async fn execute_with_retry_within<R, F, Fut>(
        &self,
        timeout: Duration,
        action: F,
        cancel: &CancellationToken,
    ) -> Result<R>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        self.policy.execute(self.label, timeout, action, cancel).await
    }
}

impl<T: Entity> Clone for Repository<T> {
    fn clone(&self) -> Self {
        Self {
            factory: Arc::clone(&self.factory),
            table: self.table.clone(),
            label: self.label,
            policy: Arc::clone(&self.policy),
            _entity: PhantomData,
        }
    }
}

impl<T: Entity> std::fmt::Debug for Repository<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repository")
            .field("entity", &self.label)
            .field("table", &self.table)
            .finish_non_exhaustive()
    }
}

/// Run `task` on the blocking pool, folding panics and runtime shutdown
/// into the store error taxonomy.
async fn run_blocking<R, F>(task: F) -> Result<R>
where
    R: Send + 'static,
    F: FnOnce() -> Result<R> + Send + 'static,
{
    match tokio::task::spawn_blocking(task).await {
        Ok(result) => result,
        Err(join) => Err(StoreError::fatal(format!("blocking store task failed: {join}")).into()),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Entity-specific surface
// ─────────────────────────────────────────────────────────────────────────────

/// Operations a concrete repository implements on top of [`Repository`]:
/// the statements that differ per entity.
#[async_trait]
pub trait EntityRepository<T: Entity>: Send + Sync {
    /// Filter accepted by [`EntityRepository::find_all_filtered`] and
    /// [`EntityRepository::delete_where`].
    type Filter: Send + 'static;

    /// Persist the entity, inserting or updating per store semantics, and
    /// return it with any store-generated fields populated.
    async fn save(&self, entity: T, cancel: &CancellationToken) -> Result<T>;

    /// Every entity in the table.
    async fn query(&self) -> Result<Vec<T>>;

    /// Entities matching `filter`.
    async fn find_all_filtered(&self, filter: Self::Filter) -> Result<Vec<T>>;

    /// Delete entities matching `filter`, returning the number removed.
    async fn delete_where(&self, filter: Self::Filter) -> Result<usize>;

    /// Save each entity in order, stopping at the first failure.
    ///
    /// Not atomic: entities saved before a failure stay saved, and later
    /// ones are never attempted.
    async fn save_all(&self, entities: Vec<T>, cancel: &CancellationToken) -> Result<Vec<T>> {
        let mut saved = Vec::with_capacity(entities.len());
        for entity in entities {
            saved.push(self.save(entity, cancel).await?);
        }
        Ok(saved)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Statements
// ─────────────────────────────────────────────────────────────────────────────

/// SQL builders and synchronous statement helpers shared by
/// [`Repository`] and entity-specific repositories.
pub mod statements {
    use rusqlite::types::Type;
    use rusqlite::{params, Connection, OptionalExtension};
    use uuid::Uuid;

    use keel_core::errors::Result;

    use super::Entity;

    /// Projection appended to single-row lookups: the entity's effective
    /// date window rendered as `start,end`, each side blank when the
    /// column is NULL.
    pub const EFFECTIVE_INTERVAL_PROJECTION: &str = "COALESCE(strftime('%Y-%m-%d', effective_interval_start_date), '') || ',' || COALESCE(strftime('%Y-%m-%d', effective_interval_end_date), '') AS effective_interval";

    /// `SELECT` returning at most one row for an id, with the
    /// effective-interval projection.
    #[must_use]
    pub fn select_by_id_sql(table: &str) -> String {
        format!("SELECT *, {EFFECTIVE_INTERVAL_PROJECTION} FROM {table} WHERE id = ?1 LIMIT 1")
    }

    /// `DELETE` for one id.
    #[must_use]
    pub fn delete_by_id_sql(table: &str) -> String {
        format!("DELETE FROM {table} WHERE id = ?1")
    }

    /// `COUNT` probe for one id.
    #[must_use]
    pub fn exists_sql(table: &str) -> String {
        format!("SELECT COUNT(id) FROM {table} WHERE id = ?1")
    }

    /// Parse a `TEXT` id column value into a [`Uuid`].
    ///
    /// # Errors
    ///
    /// Returns a row conversion error when the text is not a UUID.
    pub fn parse_id(value: &str) -> rusqlite::Result<Uuid> {
        value
            .parse()
            .map_err(|err| rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(err)))
    }

    /// Run a single-row lookup, mapping the row through [`Entity::from_row`].
    ///
    /// # Errors
    ///
    /// Fails with the translated store error when the statement errors;
    /// an empty result is `Ok(None)`.
    pub fn select_by_id<T: Entity>(conn: &Connection, sql: &str, id: Uuid) -> Result<Option<T>> {
        Ok(conn
            .query_row(sql, params![id.to_string()], T::from_row)
            .optional()?)
    }

    /// Run a one-row delete, returning the number of rows removed.
    ///
    /// # Errors
    ///
    /// Fails with the translated store error when the statement errors.
    pub fn delete_by_id(conn: &Connection, sql: &str, id: Uuid) -> Result<usize> {
        Ok(conn.execute(sql, params![id.to_string()])?)
    }

    /// Run an existence probe for one id.
    ///
    /// # Errors
    ///
    /// Fails with the translated store error when the statement errors.
    pub fn exists(conn: &Connection, sql: &str, id: Uuid) -> Result<bool> {
        let count: i64 = conn.query_row(sql, params![id.to_string()], |row| row.get(0))?;
        Ok(count > 0)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
