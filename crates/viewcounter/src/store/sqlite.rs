//! `SQLite`-backed counter store.
//!
//! Increments are a single upsert statement, so `SQLite`'s write lock makes
//! them atomic across every connection to the same database file. Changes
//! made through this handle are published immediately; changes committed by
//! other connections (other processes) are picked up by a background watcher
//! that polls `PRAGMA data_version` while anyone is subscribed.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::counter::CounterRecord;
use crate::error::{Error, Result};

use super::schema::{INCREMENT_COUNTER, INSERT_COUNTER_IF_ABSENT, SELECT_ALL_COUNTERS, SELECT_COUNTER};
use super::{migrations, ChangeFeed, CounterStore, Subscription};

/// How often the watcher looks for commits from other connections by default.
pub const DEFAULT_WATCH_INTERVAL: Duration = Duration::from_secs(1);

/// How long a statement waits on another connection's write lock.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Persistent counter store.
///
/// Cloning yields another handle to the same connection and change feed.
/// Opening the same file twice gives two independent clients.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    inner: Arc<SqliteInner>,
}

#[derive(Debug)]
struct SqliteInner {
    path: PathBuf,
    conn: Mutex<Connection>,
    feed: ChangeFeed,
    watch_interval: Duration,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

/// What the watcher saw on its previous poll.
#[derive(Debug)]
struct Snapshot {
    data_version: i64,
    counts: HashMap<String, u64>,
}

impl SqliteStore {
    /// Open or create a counter database at the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or schema initialization fails.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_interval(path, DEFAULT_WATCH_INTERVAL)
    }

    /// Open or create a counter database, polling for external changes at `watch_interval`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or schema initialization fails.
    pub fn open_with_interval(path: impl AsRef<Path>, watch_interval: Duration) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|source| Error::DirectoryCreate {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }

        debug!("Opening database at {}", path.display());
        let conn = Connection::open(&path).map_err(|source| Error::DatabaseOpen {
            path: path.clone(),
            source,
        })?;

        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        migrations::initialize_schema(&conn)?;

        info!("Database opened successfully at {}", path.display());
        Ok(Self::from_connection(path, conn, watch_interval))
    }

    /// Create an in-memory store, mostly for tests.
    ///
    /// # Errors
    ///
    /// Returns an error if the in-memory database cannot be created.
    pub fn open_in_memory() -> Result<Self> {
        let path = PathBuf::from(":memory:");
        let conn = Connection::open_in_memory().map_err(|source| Error::DatabaseOpen {
            path: path.clone(),
            source,
        })?;

        migrations::initialize_schema(&conn)?;
        Ok(Self::from_connection(path, conn, DEFAULT_WATCH_INTERVAL))
    }

    fn from_connection(path: PathBuf, conn: Connection, watch_interval: Duration) -> Self {
        Self {
            inner: Arc::new(SqliteInner {
                path,
                conn: Mutex::new(conn),
                feed: ChangeFeed::default(),
                watch_interval,
                watcher: Mutex::new(None),
            }),
        }
    }

    /// Get the path to the database file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Get the schema version recorded in the database.
    ///
    /// # Errors
    ///
    /// Returns an error if the metadata cannot be read.
    pub fn schema_version(&self) -> Result<i32> {
        let conn = self.inner.conn()?;
        migrations::get_schema_version(&conn)
    }

    /// List every counter in the database.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn counters(&self) -> Result<Vec<CounterRecord>> {
        let conn = self.inner.conn()?;
        select_all(&conn)
    }

    /// Run a database call off the async executor.
    async fn blocking<T, F>(&self, operation: &'static str, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&SqliteInner) -> Result<T> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || f(&inner))
            .await
            .map_err(|e| Error::store_unreachable(operation, e.to_string()))?
    }

    /// Start the external change watcher unless one is already running.
    fn ensure_watcher(&self) -> Result<()> {
        let mut slot = self
            .inner
            .watcher
            .lock()
            .map_err(|_| Error::internal("watcher lock poisoned"))?;

        if slot.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return Ok(());
        }

        debug!(
            interval_ms = self.inner.watch_interval.as_millis(),
            "Starting change watcher"
        );
        let weak = Arc::downgrade(&self.inner);
        *slot = Some(tokio::spawn(watch_external_changes(
            weak,
            self.inner.watch_interval,
        )));
        Ok(())
    }
}

impl SqliteInner {
    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::internal("database connection lock poisoned"))
    }

    /// Clear the watcher slot if nobody is subscribed.
    ///
    /// Runs under the slot lock that `ensure_watcher` takes, and
    /// `subscribe` registers its receiver before calling `ensure_watcher`:
    /// either that receiver is counted here, or `ensure_watcher` finds the
    /// slot empty and starts a new watcher.
    fn release_watcher_if_idle(&self) -> bool {
        let Ok(mut slot) = self.watcher.lock() else {
            return true;
        };
        if self.feed.receiver_count() > 0 {
            return false;
        }
        slot.take();
        true
    }

    fn fetch(&self, page_id: &str) -> Result<Option<CounterRecord>> {
        let conn = self.conn()?;
        Ok(conn
            .query_row(SELECT_COUNTER, [page_id], row_to_record)
            .optional()?)
    }

    fn initialize(&self, page_id: &str, initial_count: u64) -> Result<CounterRecord> {
        let initial = i64::try_from(initial_count)
            .map_err(|_| Error::internal(format!("initial count {initial_count} out of range")))?;
        let now = Utc::now().to_rfc3339();

        let conn = self.conn()?;
        let inserted = conn.execute(INSERT_COUNTER_IF_ABSENT, params![page_id, initial, now])?;
        let record = conn
            .query_row(SELECT_COUNTER, [page_id], row_to_record)
            .optional()?
            .ok_or_else(|| Error::internal(format!("counter '{page_id}' vanished after insert")))?;

        if inserted > 0 {
            debug!(%record, "Counter initialized");
            self.feed.publish(record.clone());
        } else {
            debug!(%record, "Counter already initialized");
        }
        Ok(record)
    }

    fn increment(&self, page_id: &str) -> Result<CounterRecord> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn()?;
        let record = conn.query_row(INCREMENT_COUNTER, params![page_id, now], row_to_record)?;

        // Publish while still holding the connection so changes go out in write order
        self.feed.publish(record.clone());
        Ok(record)
    }

    fn poll_changes(&self, previous: Option<Snapshot>) -> Result<(Snapshot, Vec<CounterRecord>)> {
        let conn = self.conn()?;
        let data_version: i64 = conn.query_row("PRAGMA data_version", [], |row| row.get(0))?;

        let previous = match previous {
            Some(prev) if prev.data_version == data_version => return Ok((prev, Vec::new())),
            other => other,
        };

        let records = select_all(&conn)?;
        let changed = match &previous {
            // First poll only establishes the baseline
            None => Vec::new(),
            Some(prev) => records
                .iter()
                .filter(|r| prev.counts.get(&r.page_id) != Some(&r.count))
                .cloned()
                .collect(),
        };

        let counts = records.into_iter().map(|r| (r.page_id, r.count)).collect();
        Ok((
            Snapshot {
                data_version,
                counts,
            },
            changed,
        ))
    }
}

impl Drop for SqliteInner {
    fn drop(&mut self) {
        if let Ok(slot) = self.watcher.get_mut() {
            if let Some(handle) = slot.take() {
                handle.abort();
            }
        }
    }
}

async fn watch_external_changes(inner: Weak<SqliteInner>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut snapshot = None;

    loop {
        ticker.tick().await;

        let Some(inner) = inner.upgrade() else {
            break;
        };
        if inner.feed.receiver_count() == 0 && inner.release_watcher_if_idle() {
            debug!("No subscribers left, stopping change watcher");
            break;
        }

        let polled = tokio::task::spawn_blocking(move || {
            let result = inner.poll_changes(snapshot);
            (inner, result)
        })
        .await;

        match polled {
            Ok((inner, Ok((next, changed)))) => {
                snapshot = Some(next);
                for record in changed {
                    debug!(%record, "External change detected");
                    inner.feed.publish(record);
                }
            }
            Ok((_, Err(err))) => {
                warn!(error = %err, "Change watcher poll failed");
                snapshot = None;
            }
            Err(err) => {
                warn!(error = %err, "Change watcher task failed");
                break;
            }
        }
    }
}

fn select_all(conn: &Connection) -> Result<Vec<CounterRecord>> {
    let mut stmt = conn.prepare(SELECT_ALL_COUNTERS)?;
    let records = stmt
        .query_map([], row_to_record)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(records)
}

/// Convert a database row to a `CounterRecord`.
fn row_to_record(row: &rusqlite::Row) -> rusqlite::Result<CounterRecord> {
    let page_id: String = row.get(0)?;
    let count: i64 = row.get(1)?;
    let updated_at: Option<String> = row.get(2)?;

    let count = u64::try_from(count).map_err(|_| rusqlite::Error::IntegralValueOutOfRange(1, count))?;
    let updated_at = updated_at
        .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|dt| dt.with_timezone(&Utc));

    Ok(CounterRecord {
        page_id,
        count,
        updated_at,
    })
}

#[async_trait::async_trait]
impl CounterStore for SqliteStore {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    async fn fetch(&self, page_id: &str) -> Result<Option<CounterRecord>> {
        let page_id = page_id.to_string();
        self.blocking("fetch", move |inner| inner.fetch(&page_id))
            .await
    }

    async fn initialize(&self, page_id: &str, initial_count: u64) -> Result<CounterRecord> {
        let page_id = page_id.to_string();
        self.blocking("initialize", move |inner| {
            inner.initialize(&page_id, initial_count)
        })
        .await
    }

    async fn increment(&self, page_id: &str) -> Result<CounterRecord> {
        let page_id = page_id.to_string();
        self.blocking("increment", move |inner| inner.increment(&page_id))
            .await
    }

    async fn subscribe(&self, page_id: &str) -> Result<Subscription> {
        let subscription = self.inner.feed.subscribe(page_id);
        self.ensure_watcher()?;
        Ok(subscription)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_store() -> SqliteStore {
        SqliteStore::open_in_memory().expect("failed to create test store")
    }

    fn temp_db_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "viewcounter_{name}_{}.db",
            std::process::id()
        ))
    }

    fn remove_db(path: &Path) {
        let _ = std::fs::remove_file(path);
        let _ = std::fs::remove_file(path.with_extension("db-wal"));
        let _ = std::fs::remove_file(path.with_extension("db-shm"));
    }

    #[tokio::test]
    async fn test_fetch_missing() {
        let store = create_test_store();
        assert!(store.fetch("main").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_initialize_then_fetch() {
        let store = create_test_store();

        let record = store.initialize("main", 0).await.unwrap();
        assert_eq!(record.count, 0);
        assert!(record.updated_at.is_some());

        let fetched = store.fetch("main").await.unwrap().unwrap();
        assert_eq!(fetched.count, 0);
    }

    #[tokio::test]
    async fn test_initialize_duplicate_returns_existing() {
        let store = create_test_store();
        store.initialize("main", 5).await.unwrap();

        let second = store.initialize("main", 0).await.unwrap();
        assert_eq!(second.count, 5);
    }

    #[tokio::test]
    async fn test_increment_returns_new_count() {
        let store = create_test_store();
        store.initialize("main", 10).await.unwrap();

        assert_eq!(store.increment("main").await.unwrap().count, 11);
        assert_eq!(store.increment("main").await.unwrap().count, 12);
    }

    #[tokio::test]
    async fn test_increment_creates_missing_record() {
        let store = create_test_store();
        assert_eq!(store.increment("fresh").await.unwrap().count, 1);
    }

    #[tokio::test]
    async fn test_subscriber_sees_own_increment() {
        let store = create_test_store();
        let mut sub = store.subscribe("main").await.unwrap();

        store.increment("main").await.unwrap();

        let record = sub.next().await.unwrap();
        assert_eq!(record.count, 1);
    }

    #[tokio::test]
    async fn test_counters_lists_all_pages() {
        let store = create_test_store();
        store.increment("b").await.unwrap();
        store.increment("a").await.unwrap();

        let pages: Vec<String> = store
            .counters()
            .unwrap()
            .into_iter()
            .map(|r| r.page_id)
            .collect();
        assert_eq!(pages, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_schema_version() {
        let store = create_test_store();
        assert_eq!(store.schema_version().unwrap(), migrations::CURRENT_VERSION);
    }

    #[test]
    fn test_path() {
        let store = create_test_store();
        assert_eq!(store.path().to_string_lossy(), ":memory:");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_increments_lose_nothing() {
        let store = create_test_store();

        let mut tasks = Vec::new();
        for _ in 0..100 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move { store.increment("main").await }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(store.fetch("main").await.unwrap().unwrap().count, 100);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_connections_lose_nothing() {
        let path = temp_db_path("connections");
        remove_db(&path);

        let clients: Vec<SqliteStore> = (0..4).map(|_| SqliteStore::open(&path).unwrap()).collect();

        let mut tasks = Vec::new();
        for client in &clients {
            for _ in 0..25 {
                let client = client.clone();
                tasks.push(tokio::spawn(async move { client.increment("main").await }));
            }
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(clients[0].fetch("main").await.unwrap().unwrap().count, 100);

        drop(clients);
        remove_db(&path);
    }

    #[tokio::test]
    async fn test_external_change_reaches_subscriber() {
        let path = temp_db_path("external");
        remove_db(&path);

        let reader = SqliteStore::open_with_interval(&path, Duration::from_millis(10)).unwrap();
        let writer = SqliteStore::open(&path).unwrap();
        reader.initialize("main", 0).await.unwrap();

        let mut sub = reader.subscribe("main").await.unwrap();
        // Let the watcher record its baseline before the other client writes
        tokio::time::sleep(Duration::from_millis(50)).await;
        writer.increment("main").await.unwrap();

        let record = tokio::time::timeout(Duration::from_secs(5), sub.next())
            .await
            .expect("external change not delivered")
            .unwrap();
        assert_eq!(record.count, 1);

        drop(sub);
        drop(reader);
        drop(writer);
        remove_db(&path);
    }

    #[tokio::test]
    async fn test_watcher_stops_without_subscribers() {
        let store = SqliteStore::open_in_memory().unwrap();
        let sub = store.subscribe("main").await.unwrap();
        sub.cancel();

        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(store.inner.watcher.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_watcher_kept_while_a_receiver_exists() {
        let store = SqliteStore::open_in_memory().unwrap();
        let sub = store.inner.feed.subscribe("main");

        assert!(!store.inner.release_watcher_if_idle());
        drop(sub);
        assert!(store.inner.release_watcher_if_idle());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_resubscribe_after_watcher_stopped() {
        let path = temp_db_path("resubscribe");
        remove_db(&path);

        let reader = SqliteStore::open_with_interval(&path, Duration::from_millis(10)).unwrap();
        let writer = SqliteStore::open(&path).unwrap();
        reader.initialize("main", 0).await.unwrap();

        reader.subscribe("main").await.unwrap().cancel();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(reader.inner.watcher.lock().unwrap().is_none());

        let mut sub = reader.subscribe("main").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        writer.increment("main").await.unwrap();

        let record = tokio::time::timeout(Duration::from_secs(5), sub.next())
            .await
            .expect("external change not delivered")
            .unwrap();
        assert_eq!(record.count, 1);

        drop(sub);
        drop(reader);
        drop(writer);
        remove_db(&path);
    }

    #[test]
    fn test_open_creates_parent_dirs() {
        let nested = std::env::temp_dir().join(format!(
            "viewcounter_test_{}/nested/db.sqlite",
            std::process::id()
        ));
        if let Some(parent) = nested.parent() {
            let _ = std::fs::remove_dir_all(parent);
        }

        let store = SqliteStore::open(&nested).unwrap();
        assert!(nested.exists());

        drop(store);
        if let Some(root) = nested.parent().and_then(Path::parent) {
            let _ = std::fs::remove_dir_all(root);
        }
    }

    #[test]
    fn test_negative_count_is_rejected() {
        let store = create_test_store();
        let conn = store.inner.conn().unwrap();
        let result = conn.execute(
            "INSERT INTO counters (page_id, count, created_at) VALUES ('bad', -1, 'now')",
            [],
        );
        assert!(result.is_err());
    }
}
