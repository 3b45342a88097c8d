use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use serde_json::Value;
use tracing::info;

use crate::errors::{AppError, AppResult};
use crate::models::{MapData, MapStatus};

pub struct DatabaseContext {
    pub connection: Connection,
    pub path: PathBuf,
}

pub fn bootstrap<P: AsRef<Path>>(data_dir: P, database_file: &str) -> AppResult<DatabaseContext> {
    let data_dir = data_dir.as_ref();
    std::fs::create_dir_all(data_dir)?;
    let db_path = data_dir.join(database_file);

    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE;
    let connection = Connection::open_with_flags(&db_path, flags)?;
    connection.execute_batch(
        r#"
        PRAGMA journal_mode = WAL;
        PRAGMA busy_timeout = 5000;
        "#,
    )?;
    run_migrations(&connection)?;

    info!(
        target: "database_bootstrap",
        path = %db_path.display(),
        "trip store ready"
    );
    Ok(DatabaseContext {
        connection,
        path: db_path,
    })
}

fn run_migrations(connection: &Connection) -> AppResult<()> {
    connection.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS trips (
            link TEXT PRIMARY KEY,
            title TEXT NOT NULL DEFAULT '',
            itinerary_data TEXT,
            created_at TEXT NOT NULL DEFAULT (DATETIME('now')),
            updated_at TEXT NOT NULL DEFAULT (DATETIME('now'))
        );
        "#,
    )?;

    ensure_column(connection, "trips", "map_status TEXT NOT NULL DEFAULT 'pending'")?;
    ensure_column(connection, "trips", "map_error TEXT")?;
    ensure_column(connection, "trips", "map_data TEXT")?;
    ensure_column(connection, "trips", "job_seq INTEGER")?;
    connection.execute(
        "CREATE INDEX IF NOT EXISTS idx_trips_map_status ON trips(map_status)",
        [],
    )?;
    Ok(())
}

fn ensure_column(connection: &Connection, table: &str, definition: &str) -> AppResult<()> {
    let column_name = definition
        .split_whitespace()
        .next()
        .ok_or_else(|| AppError::Config(format!("invalid column definition: {definition}")))?;
    if column_exists(connection, table, column_name)? {
        return Ok(());
    }
    let sql = format!("ALTER TABLE {table} ADD COLUMN {definition}");
    connection.execute(&sql, [])?;
    Ok(())
}

fn column_exists(connection: &Connection, table: &str, column: &str) -> AppResult<bool> {
    let pragma = format!("PRAGMA table_info({table})");
    let mut stmt = connection.prepare(&pragma)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339()
}

/// A trip left in `pending` or `processing` with a stored snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingTrip {
    pub link: String,
    pub itinerary_data: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobState {
    pub status: MapStatus,
    pub error: Option<String>,
}

/// Durable record of trips and their geocoding status. The source of truth
/// for job state; the in-memory queue only accelerates it.
pub trait TripStore: Send + Sync {
    /// Inserts or replaces the itinerary snapshot for a trip.
    fn save_trip(&self, link: &str, title: &str, snapshot: &Value) -> AppResult<()>;
    fn snapshot(&self, link: &str) -> AppResult<Option<Value>>;
    fn trips_needing_geocoding(&self) -> AppResult<Vec<PendingTrip>>;
    /// Writing any status other than `error` clears the stored error text.
    fn set_job_status(&self, link: &str, status: MapStatus, error: Option<&str>) -> AppResult<()>;
    fn job_status(&self, link: &str) -> AppResult<Option<JobState>>;
    fn map_data(&self, link: &str) -> AppResult<Option<MapData>>;

    /// Hands the trip to job `seq`: back to `pending`, error cleared. Any
    /// older job still holding the trip loses its claim.
    fn assign_job(&self, link: &str, seq: u64) -> AppResult<()>;
    /// Moves the trip to `processing` if job `seq` still owns it.
    /// `Ok(false)` means a newer job was assigned.
    fn start_job(&self, link: &str, seq: u64) -> AppResult<bool>;
    /// Writes the map, `ready` and a cleared error in one statement, only
    /// while job `seq` owns the trip.
    fn complete_job(&self, link: &str, seq: u64, map: &MapData) -> AppResult<bool>;
    fn fail_job(&self, link: &str, seq: u64, message: &str) -> AppResult<bool>;
}

#[derive(Clone)]
pub struct SqliteTripStore {
    db: Arc<Mutex<Connection>>,
}

impl SqliteTripStore {
    pub fn new(db: Arc<Mutex<Connection>>) -> Self {
        Self { db }
    }

    pub fn open<P: AsRef<Path>>(data_dir: P, database_file: &str) -> AppResult<Self> {
        let context = bootstrap(data_dir, database_file)?;
        Ok(Self::new(Arc::new(Mutex::new(context.connection))))
    }

    pub fn in_memory() -> AppResult<Self> {
        let connection = Connection::open_in_memory()?;
        run_migrations(&connection)?;
        Ok(Self::new(Arc::new(Mutex::new(connection))))
    }
}

impl TripStore for SqliteTripStore {
    fn save_trip(&self, link: &str, title: &str, snapshot: &Value) -> AppResult<()> {
        let encoded = serde_json::to_string(snapshot)?;
        let conn = self.db.lock();
        conn.execute(
            "INSERT INTO trips (link, title, itinerary_data, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(link) DO UPDATE SET
                title = excluded.title,
                itinerary_data = excluded.itinerary_data,
                updated_at = excluded.updated_at",
            params![link, title, encoded, now_timestamp()],
        )?;
        Ok(())
    }

    fn snapshot(&self, link: &str) -> AppResult<Option<Value>> {
        let raw: Option<Option<String>> = {
            let conn = self.db.lock();
            conn.query_row(
                "SELECT itinerary_data FROM trips WHERE link = ?1",
                [link],
                |row| row.get(0),
            )
            .optional()?
        };
        match raw.flatten() {
            Some(text) => Ok(Some(serde_json::from_str(&text)?)),
            None => Ok(None),
        }
    }

    fn trips_needing_geocoding(&self) -> AppResult<Vec<PendingTrip>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(
            "SELECT link, itinerary_data FROM trips
             WHERE map_status IN ('pending', 'processing')
               AND itinerary_data IS NOT NULL
             ORDER BY updated_at ASC, link ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(PendingTrip {
                link: row.get(0)?,
                itinerary_data: row.get(1)?,
            })
        })?;
        let mut trips = Vec::new();
        for row in rows {
            trips.push(row?);
        }
        Ok(trips)
    }

    fn set_job_status(&self, link: &str, status: MapStatus, error: Option<&str>) -> AppResult<()> {
        let error = match status {
            MapStatus::Error => error,
            _ => None,
        };
        let conn = self.db.lock();
        let updated = conn.execute(
            "UPDATE trips SET map_status = ?2, map_error = ?3, updated_at = ?4 WHERE link = ?1",
            params![link, status.as_str(), error, now_timestamp()],
        )?;
        if updated == 0 {
            return Err(AppError::NotFound(link.to_string()));
        }
        Ok(())
    }

    fn job_status(&self, link: &str) -> AppResult<Option<JobState>> {
        let row: Option<(String, Option<String>)> = {
            let conn = self.db.lock();
            conn.query_row(
                "SELECT map_status, map_error FROM trips WHERE link = ?1",
                [link],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?
        };
        match row {
            Some((status, error)) => Ok(Some(JobState {
                status: MapStatus::parse(&status)?,
                error,
            })),
            None => Ok(None),
        }
    }

    fn map_data(&self, link: &str) -> AppResult<Option<MapData>> {
        let raw: Option<Option<String>> = {
            let conn = self.db.lock();
            conn.query_row("SELECT map_data FROM trips WHERE link = ?1", [link], |row| {
                row.get(0)
            })
            .optional()?
        };
        match raw.flatten() {
            Some(text) => Ok(Some(serde_json::from_str(&text)?)),
            None => Ok(None),
        }
    }

    fn assign_job(&self, link: &str, seq: u64) -> AppResult<()> {
        let conn = self.db.lock();
        let updated = conn.execute(
            "UPDATE trips SET map_status = 'pending', map_error = NULL, job_seq = ?2, updated_at = ?3
             WHERE link = ?1",
            params![link, seq as i64, now_timestamp()],
        )?;
        if updated == 0 {
            return Err(AppError::NotFound(link.to_string()));
        }
        Ok(())
    }

    fn start_job(&self, link: &str, seq: u64) -> AppResult<bool> {
        let conn = self.db.lock();
        let updated = conn.execute(
            "UPDATE trips SET map_status = 'processing', map_error = NULL, job_seq = ?2, updated_at = ?3
             WHERE link = ?1 AND (job_seq IS NULL OR job_seq = ?2)",
            params![link, seq as i64, now_timestamp()],
        )?;
        claimed_or_missing(&conn, link, updated)
    }

    fn complete_job(&self, link: &str, seq: u64, map: &MapData) -> AppResult<bool> {
        let encoded = serde_json::to_string(map)?;
        let conn = self.db.lock();
        let updated = conn.execute(
            "UPDATE trips SET map_data = ?3, map_status = 'ready', map_error = NULL, updated_at = ?4
             WHERE link = ?1 AND job_seq = ?2",
            params![link, seq as i64, encoded, now_timestamp()],
        )?;
        claimed_or_missing(&conn, link, updated)
    }

    fn fail_job(&self, link: &str, seq: u64, message: &str) -> AppResult<bool> {
        let conn = self.db.lock();
        let updated = conn.execute(
            "UPDATE trips SET map_status = 'error', map_error = ?3, updated_at = ?4
             WHERE link = ?1 AND (job_seq IS NULL OR job_seq = ?2)",
            params![link, seq as i64, message, now_timestamp()],
        )?;
        claimed_or_missing(&conn, link, updated)
    }
}

/// Zero rows from a job-guarded update is either a lost claim or a trip
/// that no longer exists.
fn claimed_or_missing(conn: &Connection, link: &str, updated: usize) -> AppResult<bool> {
    if updated > 0 {
        return Ok(true);
    }
    let exists = conn
        .query_row("SELECT 1 FROM trips WHERE link = ?1", [link], |_| Ok(()))
        .optional()?
        .is_some();
    if exists {
        Ok(false)
    } else {
        Err(AppError::NotFound(link.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tempfile::tempdir;

    use super::*;
    use crate::models::LatLng;

    #[test]
    fn runs_migrations_and_creates_tables() {
        let dir = tempdir().unwrap();
        let ctx = bootstrap(dir.path(), "test.db").unwrap();

        for column in ["map_status", "map_error", "map_data", "itinerary_data", "job_seq"] {
            assert!(column_exists(&ctx.connection, "trips", column).unwrap());
        }
        assert!(ctx.path.ends_with("test.db"));

        // reopening an existing file is a no-op migration
        drop(ctx);
        assert!(bootstrap(dir.path(), "test.db").is_ok());
    }

    #[test]
    fn new_trips_start_pending_and_error_text_clears() {
        let store = SqliteTripStore::in_memory().unwrap();
        store.save_trip("vienna", "Vienna", &json!({"title": "Vienna"})).unwrap();

        let state = store.job_status("vienna").unwrap().unwrap();
        assert_eq!(state.status, MapStatus::Pending);

        store
            .set_job_status("vienna", MapStatus::Error, Some("provider down"))
            .unwrap();
        let failed = store.job_status("vienna").unwrap().unwrap();
        assert_eq!(failed.error.as_deref(), Some("provider down"));

        store.set_job_status("vienna", MapStatus::Pending, Some("ignored")).unwrap();
        let retried = store.job_status("vienna").unwrap().unwrap();
        assert_eq!(retried.status, MapStatus::Pending);
        assert!(retried.error.is_none());
    }

    #[test]
    fn unknown_trips_report_not_found() {
        let store = SqliteTripStore::in_memory().unwrap();
        assert!(store.job_status("missing").unwrap().is_none());
        assert!(store.snapshot("missing").unwrap().is_none());
        assert!(matches!(
            store.set_job_status("missing", MapStatus::Ready, None),
            Err(AppError::NotFound(_))
        ));
    }

    #[test]
    fn lists_only_unfinished_trips_with_snapshots() {
        let store = SqliteTripStore::in_memory().unwrap();
        store.save_trip("a", "A", &json!({"title": "A"})).unwrap();
        store.save_trip("b", "B", &json!({"title": "B"})).unwrap();
        store.save_trip("c", "C", &json!({"title": "C"})).unwrap();
        store.set_job_status("b", MapStatus::Processing, None).unwrap();
        store.set_job_status("c", MapStatus::Ready, None).unwrap();
        store
            .db
            .lock()
            .execute("INSERT INTO trips (link) VALUES ('bare')", [])
            .unwrap();

        let mut links: Vec<String> = store
            .trips_needing_geocoding()
            .unwrap()
            .into_iter()
            .map(|trip| trip.link)
            .collect();
        links.sort();
        assert_eq!(links, vec!["a", "b"]);
    }

    fn vienna_map() -> MapData {
        MapData {
            center: LatLng::new(48.2, 16.37),
            zoom: 12,
            markers: Vec::new(),
            error: None,
        }
    }

    #[test]
    fn completing_a_job_stores_map_and_status_together() {
        let store = SqliteTripStore::in_memory().unwrap();
        store.save_trip("vienna", "Vienna", &json!({})).unwrap();
        assert!(store.map_data("vienna").unwrap().is_none());

        store.assign_job("vienna", 1).unwrap();
        assert!(store.start_job("vienna", 1).unwrap());
        store
            .db
            .lock()
            .execute("UPDATE trips SET map_error = 'stale' WHERE link = 'vienna'", [])
            .unwrap();

        assert!(store.complete_job("vienna", 1, &vienna_map()).unwrap());
        assert_eq!(store.map_data("vienna").unwrap(), Some(vienna_map()));
        let state = store.job_status("vienna").unwrap().unwrap();
        assert_eq!(state.status, MapStatus::Ready);
        assert!(state.error.is_none());
    }

    #[test]
    fn superseded_job_cannot_touch_the_trip() {
        let store = SqliteTripStore::in_memory().unwrap();
        store.save_trip("vienna", "Vienna", &json!({})).unwrap();
        store.assign_job("vienna", 1).unwrap();
        assert!(store.start_job("vienna", 1).unwrap());

        store.assign_job("vienna", 2).unwrap();
        assert!(!store.complete_job("vienna", 1, &vienna_map()).unwrap());
        assert!(!store.fail_job("vienna", 1, "late failure").unwrap());
        assert!(!store.start_job("vienna", 1).unwrap());

        let state = store.job_status("vienna").unwrap().unwrap();
        assert_eq!(state.status, MapStatus::Pending);
        assert!(state.error.is_none());
        assert!(store.map_data("vienna").unwrap().is_none());

        assert!(store.start_job("vienna", 2).unwrap());
        assert!(store.fail_job("vienna", 2, "provider down").unwrap());
        let failed = store.job_status("vienna").unwrap().unwrap();
        assert_eq!(failed.status, MapStatus::Error);
        assert_eq!(failed.error.as_deref(), Some("provider down"));
    }

    #[test]
    fn job_updates_on_missing_trips_report_not_found() {
        let store = SqliteTripStore::in_memory().unwrap();
        assert!(matches!(store.assign_job("ghost", 1), Err(AppError::NotFound(_))));
        assert!(matches!(store.start_job("ghost", 1), Err(AppError::NotFound(_))));
        assert!(matches!(
            store.complete_job("ghost", 1, &vienna_map()),
            Err(AppError::NotFound(_))
        ));
    }
}
