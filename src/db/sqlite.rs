//! SQLite observation backend.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};

use super::models::*;
use super::store::{ObservationBackend, StoreError};

const SELECT_COLUMNS: &str = "SELECT id, service_name, service_status, host_name, timestamp FROM observations";

/// Thread-safe SQLite backend for single-host deployments.
///
/// `id` is the insertion identifier used to break timestamp ties.
#[derive(Clone)]
pub struct SqliteBackend {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteBackend {
    /// Open (or create) the database file at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path).map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn
                .lock()
                .map_err(|_| StoreError::Unavailable("connection mutex poisoned".to_string()))?;
            f(&conn)
        })
        .await
        .map_err(|e| StoreError::Unavailable(format!("spawn_blocking failed: {}", e)))?
    }
}

#[async_trait]
impl ObservationBackend for SqliteBackend {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.query_row("SELECT 1", [], |_| Ok(()))
                .map_err(read_error)
        })
        .await
    }

    async fn ensure_schema(&self) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute_batch(include_str!("../../migrations/000001_init.up.sql"))
                .map_err(|e| StoreError::Unavailable(format!("migration 1 failed: {}", e)))
        })
        .await
    }

    async fn append(&self, record: &ObservationRecord) -> Result<StoreId, StoreError> {
        let record = record.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO observations (service_name, service_status, host_name, timestamp) VALUES (?1, ?2, ?3, ?4)",
                params![
                    record.service_name,
                    record.service_status.as_str(),
                    record.host_name,
                    format_timestamp(&record.timestamp),
                ],
            )
            .map_err(write_error)?;
            Ok(StoreId(conn.last_insert_rowid().to_string()))
        })
        .await
    }

    async fn latest(&self, service: &str) -> Result<Option<StoredObservation>, StoreError> {
        let service = service.to_string();
        self.with_conn(move |conn| {
            let row = conn
                .query_row(
                    &format!(
                        "{} WHERE service_name = ?1 ORDER BY timestamp DESC, id DESC LIMIT 1",
                        SELECT_COLUMNS
                    ),
                    params![service],
                    RawRow::from_row,
                )
                .optional()
                .map_err(read_error)?;
            row.map(RawRow::into_stored).transpose()
        })
        .await
    }

    async fn history(&self, service: Option<&str>, limit: usize) -> Result<HistoryPage, StoreError> {
        let service = service.map(str::to_string);
        self.with_conn(move |conn| {
            let (total, rows) = match &service {
                Some(service) => {
                    let total: i64 = conn
                        .query_row(
                            "SELECT COUNT(*) FROM observations WHERE service_name = ?1",
                            params![service],
                            |r| r.get(0),
                        )
                        .map_err(read_error)?;
                    let mut stmt = conn
                        .prepare(&format!(
                            "{} WHERE service_name = ?1 ORDER BY timestamp DESC, id DESC LIMIT ?2",
                            SELECT_COLUMNS
                        ))
                        .map_err(read_error)?;
                    let rows = stmt
                        .query_map(params![service, limit as i64], RawRow::from_row)
                        .map_err(read_error)?
                        .collect::<Result<Vec<_>, _>>()
                        .map_err(read_error)?;
                    (total, rows)
                }
                None => {
                    let total: i64 = conn
                        .query_row("SELECT COUNT(*) FROM observations", [], |r| r.get(0))
                        .map_err(read_error)?;
                    let mut stmt = conn
                        .prepare(&format!(
                            "{} ORDER BY timestamp DESC, id DESC LIMIT ?1",
                            SELECT_COLUMNS
                        ))
                        .map_err(read_error)?;
                    let rows = stmt
                        .query_map(params![limit as i64], RawRow::from_row)
                        .map_err(read_error)?
                        .collect::<Result<Vec<_>, _>>()
                        .map_err(read_error)?;
                    (total, rows)
                }
            };

            let results = rows
                .into_iter()
                .map(|row| row.into_stored().map(|stored| stored.record))
                .collect::<Result<Vec<_>, _>>()?;

            Ok(HistoryPage {
                total: total as u64,
                results,
            })
        })
        .await
    }
}

/// A row before status and timestamp are validated.
struct RawRow {
    id: i64,
    service_name: String,
    service_status: String,
    host_name: String,
    timestamp: String,
}

impl RawRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            service_name: row.get(1)?,
            service_status: row.get(2)?,
            host_name: row.get(3)?,
            timestamp: row.get(4)?,
        })
    }

    fn into_stored(self) -> Result<StoredObservation, StoreError> {
        let service_status = self
            .service_status
            .parse()
            .map_err(|e| StoreError::Decode(format!("row {}: {}", self.id, e)))?;
        let timestamp = parse_timestamp(&self.timestamp).ok_or_else(|| {
            StoreError::Decode(format!("row {}: invalid timestamp {:?}", self.id, self.timestamp))
        })?;
        Ok(StoredObservation {
            id: StoreId(self.id.to_string()),
            record: ObservationRecord {
                service_name: self.service_name,
                service_status,
                host_name: self.host_name,
                timestamp,
            },
        })
    }
}

fn is_busy(e: &rusqlite::Error) -> bool {
    matches!(
        e.sqlite_error_code(),
        Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked) | Some(ErrorCode::CannotOpen)
    )
}

fn write_error(e: rusqlite::Error) -> StoreError {
    if is_busy(&e) {
        StoreError::Unavailable(e.to_string())
    } else {
        StoreError::Write(e.to_string())
    }
}

fn read_error(e: rusqlite::Error) -> StoreError {
    StoreError::Unavailable(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::HealthState;
    use chrono::{Duration as ChronoDuration, TimeZone, Utc};
    use tempfile::NamedTempFile;

    async fn open_temp() -> (NamedTempFile, SqliteBackend) {
        let tmp = NamedTempFile::new().unwrap();
        let backend = SqliteBackend::open(tmp.path()).unwrap();
        backend.ensure_schema().await.unwrap();
        (tmp, backend)
    }

    fn record_at(service: &str, status: HealthState, secs: i64) -> ObservationRecord {
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        ObservationRecord::at(service, status, "h1", base + ChronoDuration::seconds(secs))
    }

    #[tokio::test]
    async fn test_schema_is_idempotent() {
        let (_tmp, backend) = open_temp().await;
        backend.ensure_schema().await.unwrap();
        backend.ping().await.unwrap();
    }

    #[tokio::test]
    async fn test_append_and_latest() {
        let (_tmp, backend) = open_temp().await;

        let first = backend.append(&record_at("web", HealthState::Down, 60)).await.unwrap();
        let second = backend.append(&record_at("web", HealthState::Up, 30)).await.unwrap();
        assert_ne!(first, second);

        let latest = backend.latest("web").await.unwrap().unwrap();
        assert_eq!(latest.id, first);
        assert_eq!(latest.record, record_at("web", HealthState::Down, 60));
        assert!(backend.latest("db").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_latest_tie_breaks_on_insertion() {
        let (_tmp, backend) = open_temp().await;

        backend.append(&record_at("web", HealthState::Up, 0)).await.unwrap();
        let last = backend.append(&record_at("web", HealthState::Down, 0)).await.unwrap();

        let latest = backend.latest("web").await.unwrap().unwrap();
        assert_eq!(latest.id, last);
        assert_eq!(latest.record.service_status, HealthState::Down);
    }

    #[tokio::test]
    async fn test_history_filter_then_limit() {
        let (_tmp, backend) = open_temp().await;

        for secs in 0..5 {
            backend.append(&record_at("web", HealthState::Up, secs)).await.unwrap();
            backend.append(&record_at("db", HealthState::Down, secs * 10)).await.unwrap();
        }

        let page = backend.history(Some("web"), 2).await.unwrap();
        assert_eq!(page.total, 5);
        assert_eq!(
            page.results,
            vec![record_at("web", HealthState::Up, 4), record_at("web", HealthState::Up, 3)]
        );

        let page = backend.history(None, 100).await.unwrap();
        assert_eq!(page.total, 10);
        assert_eq!(page.results.len(), 10);
        assert_eq!(page.results[0], record_at("db", HealthState::Down, 40));
    }

    #[tokio::test]
    async fn test_rows_are_append_only() {
        let (_tmp, backend) = open_temp().await;
        backend.append(&record_at("web", HealthState::Up, 0)).await.unwrap();

        let result = backend
            .with_conn(|conn| {
                conn.execute("UPDATE observations SET service_status = 'DOWN'", [])
                    .map_err(write_error)
            })
            .await;
        assert!(matches!(result, Err(StoreError::Write(_))));
    }
}
