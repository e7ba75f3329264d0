//! End-to-end repository flows over a real SQLite file.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use async_trait::async_trait;
use rusqlite::types::Value;
use rusqlite::{params, Row};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use keel_core::errors::{ErrorClass, RepositoryError, Result, StoreError};
use keel_store::repository::statements;
use keel_store::{
    ConnectionConfig, ConnectionFactory, Entity, EntityRepository, PooledConnectionFactory,
    Repository,
};

const SCHEMA: &str = "CREATE TABLE bookings (
    id TEXT PRIMARY KEY,
    guest TEXT NOT NULL,
    nights INTEGER NOT NULL CHECK (nights > 0),
    effective_interval_start_date TEXT,
    effective_interval_end_date TEXT
)";

#[derive(Debug, Clone, PartialEq, Eq)]
struct Booking {
    id: Uuid,
    guest: String,
    nights: i64,
    effective_interval_start_date: Option<String>,
    effective_interval_end_date: Option<String>,
    effective_interval: Option<String>,
}

impl Entity for Booking {
    fn id(&self) -> Uuid {
        self.id
    }

    fn table_name() -> &'static str {
        "bookings"
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let id: String = row.get("id")?;
        Ok(Self {
            id: statements::parse_id(&id)?,
            guest: row.get("guest")?,
            nights: row.get("nights")?,
            effective_interval_start_date: row.get("effective_interval_start_date")?,
            effective_interval_end_date: row.get("effective_interval_end_date")?,
            // Only projected by single-row lookups.
            effective_interval: row.get("effective_interval").unwrap_or(None),
        })
    }
}

#[derive(Debug, Clone)]
enum BookingFilter {
    GuestIs(String),
    ShorterThan(i64),
}

impl BookingFilter {
    fn clause(&self) -> &'static str {
        match self {
            Self::GuestIs(_) => "guest = ?1",
            Self::ShorterThan(_) => "nights < ?1",
        }
    }

    fn bind(&self) -> Value {
        match self {
            Self::GuestIs(guest) => Value::Text(guest.clone()),
            Self::ShorterThan(nights) => Value::Integer(*nights),
        }
    }
}

struct BookingRepository {
    base: Repository<Booking>,
}

impl BookingRepository {
    fn new(factory: Arc<dyn ConnectionFactory>) -> Self {
        Self {
            base: Repository::new(factory),
        }
    }

    async fn upsert(&self, entity: Booking) -> Result<()> {
        self.base
            .with_connection(move |conn| {
                let _changed = conn.execute(
                    "INSERT INTO bookings
                         (id, guest, nights, effective_interval_start_date, effective_interval_end_date)
                     VALUES (?1, ?2, ?3, ?4, ?5)
                     ON CONFLICT(id) DO UPDATE SET
                         guest = excluded.guest,
                         nights = excluded.nights,
                         effective_interval_start_date = excluded.effective_interval_start_date,
                         effective_interval_end_date = excluded.effective_interval_end_date",
                    params![
                        entity.id.to_string(),
                        entity.guest,
                        entity.nights,
                        entity.effective_interval_start_date,
                        entity.effective_interval_end_date,
                    ],
                )?;
                Ok(())
            })
            .await
    }
}

#[async_trait]
impl EntityRepository<Booking> for BookingRepository {
    type Filter = BookingFilter;

    async fn save(&self, entity: Booking, cancel: &CancellationToken) -> Result<Booking> {
        self.base
            .execute_with_retry(|| self.upsert(entity.clone()), cancel)
            .await?;
        Ok(entity)
    }

    async fn query(&self) -> Result<Vec<Booking>> {
        self.base
            .with_connection(|conn| {
                let mut stmt = conn.prepare("SELECT * FROM bookings ORDER BY guest")?;
                let rows = stmt
                    .query_map([], Booking::from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await
    }

    async fn find_all_filtered(&self, filter: BookingFilter) -> Result<Vec<Booking>> {
        self.base
            .with_connection(move |conn| {
                let sql = format!(
                    "SELECT * FROM bookings WHERE {} ORDER BY guest",
                    filter.clause()
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(params![filter.bind()], Booking::from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await
    }

    async fn delete_where(&self, filter: BookingFilter) -> Result<usize> {
        self.base
            .with_connection(move |conn| {
                let sql = format!("DELETE FROM bookings WHERE {}", filter.clause());
                Ok(conn.execute(&sql, params![filter.bind()])?)
            })
            .await
    }
}

fn booking(guest: &str, nights: i64) -> Booking {
    Booking {
        id: Uuid::now_v7(),
        guest: guest.to_string(),
        nights,
        effective_interval_start_date: None,
        effective_interval_end_date: None,
        effective_interval: None,
    }
}

async fn setup() -> (TempDir, BookingRepository) {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("bookings.db");
    let factory =
        Arc::new(PooledConnectionFactory::new_file(&path, &ConnectionConfig::default()).unwrap());
    let conn = factory.connection().await.unwrap();
    conn.execute_batch(SCHEMA).unwrap();
    drop(conn);
    (dir, BookingRepository::new(factory))
}

#[tokio::test]
async fn lookups_distinguish_absent_rows() {
    let (_dir, repo) = setup().await;
    let id = Uuid::now_v7();

    assert!(repo.base.try_find_by_id(id).await.unwrap().is_none());
    let err = repo.base.find_by_id(id).await.unwrap_err();
    assert_matches!(
        err,
        RepositoryError::NotFound { ref table, .. } if table == "bookings"
    );
    assert_eq!(err.to_string(), format!("no bookings row with id {id}"));
}

#[tokio::test]
async fn save_then_find_round_trips_the_entity() {
    let (_dir, repo) = setup().await;
    let cancel = CancellationToken::new();

    let saved = repo.save(booking("ada", 3), &cancel).await.unwrap();

    let fetched = repo.base.find_by_id(saved.id).await.unwrap();
    assert_eq!(fetched.id, saved.id);
    assert_eq!(fetched.guest, "ada");
    assert_eq!(fetched.nights, 3);
    assert_eq!(fetched.effective_interval_start_date, None);
    assert!(repo.base.exists(saved.id).await.unwrap());

    // Saving the same id again updates in place.
    let mut updated = saved.clone();
    updated.guest = "ada lovelace".to_string();
    let updated = repo.save(updated, &cancel).await.unwrap();

    let fetched = repo.base.find_by_id(updated.id).await.unwrap();
    assert_eq!(fetched.guest, "ada lovelace");
    assert_eq!(repo.query().await.unwrap().len(), 1);
}

#[tokio::test]
async fn lookup_projects_the_effective_interval() {
    let (_dir, repo) = setup().await;
    let cancel = CancellationToken::new();

    let mut open_ended = booking("ada", 3);
    open_ended.effective_interval_start_date = Some("2024-03-08T14:30:00Z".to_string());
    let mut bounded = booking("bob", 2);
    bounded.effective_interval_start_date = Some("2024-03-08".to_string());
    bounded.effective_interval_end_date = Some("2024-04-01".to_string());
    let unbounded = booking("cyd", 1);

    let saved = repo
        .save_all(vec![open_ended, bounded, unbounded], &cancel)
        .await
        .unwrap();

    // Timestamps collapse to their date; a NULL side renders blank.
    let fetched = repo.base.find_by_id(saved[0].id).await.unwrap();
    assert_eq!(fetched.effective_interval.as_deref(), Some("2024-03-08,"));

    let fetched = repo.base.find_by_id(saved[1].id).await.unwrap();
    assert_eq!(
        fetched.effective_interval.as_deref(),
        Some("2024-03-08,2024-04-01")
    );

    let fetched = repo.base.find_by_id(saved[2].id).await.unwrap();
    assert_eq!(fetched.effective_interval.as_deref(), Some(","));
}

#[tokio::test]
async fn save_all_stops_at_the_first_failure() {
    let (_dir, repo) = setup().await;
    let cancel = CancellationToken::new();
    let good = booking("ada", 2);
    let bad = booking("bob", 0);
    let tail = booking("cyd", 1);

    let err = repo
        .save_all(vec![good.clone(), bad.clone(), tail.clone()], &cancel)
        .await
        .unwrap_err();

    // A CHECK violation is fatal, so the policy never retries it.
    assert_matches!(
        err,
        RepositoryError::Store(ref store) if store.class == ErrorClass::Fatal
    );
    assert!(repo.base.exists(good.id).await.unwrap());
    assert!(!repo.base.exists(bad.id).await.unwrap());
    assert!(!repo.base.exists(tail.id).await.unwrap());
}

#[tokio::test]
async fn query_returns_every_row_ordered_by_guest() {
    let (_dir, repo) = setup().await;
    let cancel = CancellationToken::new();
    let _ = repo
        .save_all(
            vec![booking("cyd", 1), booking("ada", 2), booking("bob", 3)],
            &cancel,
        )
        .await
        .unwrap();

    let all = repo.query().await.unwrap();
    let guests: Vec<&str> = all.iter().map(|b| b.guest.as_str()).collect();
    assert_eq!(guests, ["ada", "bob", "cyd"]);
}

#[tokio::test]
async fn filters_select_and_delete_matching_rows() {
    let (_dir, repo) = setup().await;
    let cancel = CancellationToken::new();
    let _ = repo
        .save_all(
            vec![booking("ada", 5), booking("bob", 2), booking("bob", 9)],
            &cancel,
        )
        .await
        .unwrap();

    let bobs = repo
        .find_all_filtered(BookingFilter::GuestIs("bob".into()))
        .await
        .unwrap();
    assert_eq!(bobs.len(), 2);
    assert!(bobs.iter().all(|b| b.guest == "bob"));

    let short = repo
        .find_all_filtered(BookingFilter::ShorterThan(4))
        .await
        .unwrap();
    assert_eq!(short.len(), 1);
    assert_eq!(short[0].nights, 2);

    let removed = repo
        .delete_where(BookingFilter::GuestIs("bob".into()))
        .await
        .unwrap();
    assert_eq!(removed, 2);
    assert_eq!(repo.query().await.unwrap().len(), 1);
}

#[test]
fn lock_contention_translates_to_a_retryable_concurrency_error() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("contended.db");

    let writer = rusqlite::Connection::open(&path).unwrap();
    writer.execute_batch(SCHEMA).unwrap();

    let blocked = rusqlite::Connection::open(&path).unwrap();
    blocked.busy_timeout(Duration::ZERO).unwrap();

    writer.execute_batch("BEGIN IMMEDIATE").unwrap();
    let err = blocked
        .execute(
            "INSERT INTO bookings (id, guest, nights) VALUES (?1, 'eve', 1)",
            params![Uuid::now_v7().to_string()],
        )
        .unwrap_err();
    writer.execute_batch("COMMIT").unwrap();

    let store = StoreError::from(err);
    assert_eq!(store.class, ErrorClass::Concurrency);
    assert!(store.is_retryable());
    assert_matches!(store.code, Some(_));
}

#[tokio::test]
async fn slow_actions_hit_the_outer_timeout() {
    let (_dir, repo) = setup().await;
    let cancel = CancellationToken::new();

    let err = repo
        .base
        .execute_with_retry_within(
            Duration::from_millis(5),
            || async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(())
            },
            &cancel,
        )
        .await
        .unwrap_err();

    assert_matches!(
        err,
        RepositoryError::Timeout { ref repository, .. } if repository == "Booking"
    );
}

#[tokio::test]
async fn cancelled_token_short_circuits_retry_execution() {
    let (_dir, repo) = setup().await;
    let cancel = CancellationToken::new();
    cancel.cancel();

    let executed = Arc::new(AtomicU32::new(0));
    let probe = Arc::clone(&executed);
    let err = repo
        .base
        .execute_with_retry(
            move || {
                let probe = Arc::clone(&probe);
                async move {
                    let _ = probe.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            },
            &cancel,
        )
        .await
        .unwrap_err();

    assert_matches!(err, RepositoryError::Cancelled);
    assert_eq!(executed.load(Ordering::SeqCst), 0);
}
