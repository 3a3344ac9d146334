use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info};

use super::{
    Coverage, DetectionQuery, DetectionRecord, DetectionResult, ResultStore, UpsertOutcome,
};
use crate::error::HivewatchError;

/// SQLite-backed result store. Calls run on the blocking pool and are bounded
/// by `timeout`; a timed out write still runs to completion.
#[derive(Clone)]
pub struct SqliteResultStore {
    conn: Arc<Mutex<Connection>>,
    timeout: Duration,
}

impl SqliteResultStore {
    pub fn open(path: impl AsRef<Path>, timeout: Duration) -> Result<Self, HivewatchError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        info!(target: "store", path = %path.display(), "Opened result store");
        Self::with_connection(conn, timeout)
    }

    pub fn open_in_memory(timeout: Duration) -> Result<Self, HivewatchError> {
        Self::with_connection(Connection::open_in_memory()?, timeout)
    }

    fn with_connection(conn: Connection, timeout: Duration) -> Result<Self, HivewatchError> {
        ensure_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            timeout,
        })
    }

    async fn run<T, F>(&self, operation: &'static str, f: F) -> Result<T, HivewatchError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, HivewatchError> + Send + 'static,
    {
        let conn = self.conn.clone();
        let task = tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| HivewatchError::Other("result store lock poisoned".to_string()))?;
            f(&mut guard)
        });

        match tokio::time::timeout(self.timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => Err(HivewatchError::Other(format!(
                "{} task failed: {}",
                operation, join_error
            ))),
            Err(_) => Err(HivewatchError::timeout(operation)),
        }
    }
}

fn ensure_schema(conn: &Connection) -> Result<(), HivewatchError> {
    conn.execute_batch(
        r#"
        PRAGMA journal_mode=WAL;
        PRAGMA synchronous=FULL;
        PRAGMA foreign_keys=ON;

        CREATE TABLE IF NOT EXISTS detections (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            hive_id TEXT NOT NULL,
            filename TEXT NOT NULL,
            timestamp_ms INTEGER NOT NULL,
            coverage_milli INTEGER NOT NULL,
            blob_count INTEGER,
            created_at_ms INTEGER NOT NULL,
            UNIQUE(hive_id, filename)
        );

        CREATE INDEX IF NOT EXISTS idx_detections_hive_time
            ON detections(hive_id, timestamp_ms);

        CREATE TABLE IF NOT EXISTS detection_images (
            detection_id INTEGER PRIMARY KEY REFERENCES detections(id),
            image BLOB NOT NULL
        );
        "#,
    )?;
    Ok(())
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>, HivewatchError> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| HivewatchError::Other(format!("stored timestamp {} is out of range", ms)))
}

#[async_trait]
impl ResultStore for SqliteResultStore {
    async fn upsert(
        &self,
        result: DetectionResult,
        image: Option<Vec<u8>>,
    ) -> Result<UpsertOutcome, HivewatchError> {
        self.run("store upsert", move |conn| {
            let tx = conn.transaction()?;
            let inserted = tx.execute(
                "INSERT INTO detections
                    (hive_id, filename, timestamp_ms, coverage_milli, blob_count, created_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(hive_id, filename) DO NOTHING",
                params![
                    result.hive_id,
                    result.filename,
                    result.timestamp.timestamp_millis(),
                    result.coverage.thousandths(),
                    result.blob_count,
                    Utc::now().timestamp_millis(),
                ],
            )?;

            let outcome = if inserted == 1 {
                let id = tx.last_insert_rowid();
                if let Some(image) = image {
                    tx.execute(
                        "INSERT INTO detection_images (detection_id, image) VALUES (?1, ?2)",
                        params![id, image],
                    )?;
                }
                UpsertOutcome::Inserted { id }
            } else {
                let id: i64 = tx.query_row(
                    "SELECT id FROM detections WHERE hive_id = ?1 AND filename = ?2",
                    params![result.hive_id, result.filename],
                    |row| row.get(0),
                )?;
                UpsertOutcome::Duplicate { id }
            };
            tx.commit()?;

            debug!(
                target: "store",
                hive_id = %result.hive_id,
                filename = %result.filename,
                ?outcome,
                "Upserted detection"
            );
            Ok(outcome)
        })
        .await
    }

    async fn list(&self, query: &DetectionQuery) -> Result<Vec<DetectionRecord>, HivewatchError> {
        if let Some(range) = &query.range {
            range.validate()?;
        }
        let hive_id = query.hive_id.clone();
        let start = query
            .range
            .and_then(|r| r.start)
            .map(|t| t.timestamp_millis());
        let end = query.range.and_then(|r| r.end).map(|t| t.timestamp_millis());

        self.run("store list", move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, hive_id, filename, timestamp_ms, coverage_milli, blob_count, created_at_ms
                 FROM detections
                 WHERE (?1 IS NULL OR hive_id = ?1)
                   AND (?2 IS NULL OR timestamp_ms >= ?2)
                   AND (?3 IS NULL OR timestamp_ms <= ?3)
                 ORDER BY timestamp_ms, id",
            )?;
            let rows = stmt.query_map(params![hive_id, start, end], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, u32>(4)?,
                    row.get::<_, Option<u32>>(5)?,
                    row.get::<_, i64>(6)?,
                ))
            })?;

            let mut records = Vec::new();
            for row in rows {
                let (id, hive_id, filename, timestamp_ms, coverage, blob_count, created_at_ms) =
                    row?;
                records.push(DetectionRecord {
                    id,
                    hive_id,
                    filename,
                    timestamp: from_millis(timestamp_ms)?,
                    coverage: Coverage::from_thousandths(coverage),
                    blob_count,
                    created_at: from_millis(created_at_ms)?,
                });
            }
            Ok(records)
        })
        .await
    }

    async fn get_image(&self, detection_id: i64) -> Result<Option<Vec<u8>>, HivewatchError> {
        self.run("store image read", move |conn| {
            let image = conn
                .query_row(
                    "SELECT image FROM detection_images WHERE detection_id = ?1",
                    params![detection_id],
                    |row| row.get::<_, Vec<u8>>(0),
                )
                .optional()?;
            Ok(image)
        })
        .await
    }
}
