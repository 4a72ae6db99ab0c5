// src/relay/outbox.rs
//
// Durable local queue of occupancy events awaiting delivery.
//
// SQLite in WAL mode with synchronous=FULL: `enqueue` returns only after
// the insert is committed to disk. Every statement takes the connection
// mutex for its own duration; nothing holds it across network I/O.
// Records are never deleted here; the worker only stamps them sent or
// annotates the failure.

use crate::error::OutboxError;
use crate::types::{OccupancyEvent, OutboxPayload};
use chrono::{SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, info};

/// Stored failure text is cut to this many characters.
const MAX_ERROR_CHARS: usize = 200;

#[derive(Debug, Clone, PartialEq)]
pub struct OutboxRecord {
    pub id: i64,
    pub ts_iso: String,
    pub lot_id: String,
    pub camera_id: String,
    pub occupied_count: u32,
    pub total_spots: u32,
    /// Exact request body sent to the ingest endpoint.
    pub payload_json: String,
    /// Full OccupancyEvent, kept for audit.
    pub event_json: String,
    pub sent_at: Option<String>,
    pub last_error: Option<String>,
    pub retry_count: u32,
}

impl OutboxRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            ts_iso: row.get(1)?,
            lot_id: row.get(2)?,
            camera_id: row.get(3)?,
            occupied_count: row.get(4)?,
            total_spots: row.get(5)?,
            payload_json: row.get(6)?,
            event_json: row.get(7)?,
            sent_at: row.get(8)?,
            last_error: row.get(9)?,
            retry_count: row.get(10)?,
        })
    }
}

const SELECT_COLUMNS: &str = "id, ts_iso, lot_id, camera_id, occupied_count, total_spots, \
     payload_json, event_json, sent_at, last_error, retry_count";

/// Cheap to clone; all clones share one connection and one wakeup signal.
#[derive(Clone)]
pub struct Outbox {
    conn: Arc<Mutex<Connection>>,
    notify: Arc<Notify>,
}

impl Outbox {
    /// Open (creating if needed) the queue at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, OutboxError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=FULL;",
        )?;
        let outbox = Self::with_connection(conn)?;
        info!(
            "📦 Outbox opened at {} ({} pending)",
            path.display(),
            outbox.pending_count()?
        );
        Ok(outbox)
    }

    pub fn in_memory() -> Result<Self, OutboxError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, OutboxError> {
        let outbox = Self {
            conn: Arc::new(Mutex::new(conn)),
            notify: Arc::new(Notify::new()),
        };
        outbox.init_schema()?;
        Ok(outbox)
    }

    fn init_schema(&self) -> Result<(), OutboxError> {
        let conn = self.conn.lock();
        conn.execute(
            "CREATE TABLE IF NOT EXISTS detections_outbox (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                ts_iso TEXT NOT NULL,
                lot_id TEXT NOT NULL,
                camera_id TEXT NOT NULL,
                occupied_count INTEGER NOT NULL,
                total_spots INTEGER NOT NULL,
                payload_json TEXT NOT NULL,
                event_json TEXT NOT NULL,
                sent_at TEXT,
                last_error TEXT,
                retry_count INTEGER NOT NULL DEFAULT 0
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_outbox_unsent ON detections_outbox(sent_at, id)",
            [],
        )?;
        Ok(())
    }

    /// Signal raised after every successful enqueue.
    pub fn notifier(&self) -> Arc<Notify> {
        self.notify.clone()
    }

    /// Durably append one event. Returns the new record id.
    pub fn enqueue(&self, event: &OccupancyEvent, payload: &OutboxPayload) -> Result<i64, OutboxError> {
        let payload_json = serde_json::to_string(payload)?;
        let event_json = serde_json::to_string(event)?;

        let id = {
            let conn = self.conn.lock();
            conn.execute(
                "INSERT INTO detections_outbox
                 (ts_iso, lot_id, camera_id, occupied_count, total_spots, payload_json, event_json)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    payload.ts_iso,
                    payload.lot_id,
                    payload.camera_id,
                    payload.occupied_count,
                    payload.total_spots,
                    payload_json,
                    event_json,
                ],
            )?;
            conn.last_insert_rowid()
        };

        debug!("Outbox enqueued #{} (occupied={})", id, payload.occupied_count);
        self.notify.notify_one();
        Ok(id)
    }

    /// Oldest unsent records, ascending id, at most `limit`.
    pub fn fetch_unsent(&self, limit: usize) -> Result<Vec<OutboxRecord>, OutboxError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM detections_outbox WHERE sent_at IS NULL ORDER BY id ASC LIMIT ?1",
            SELECT_COLUMNS
        ))?;
        let records = stmt
            .query_map(params![limit as i64], OutboxRecord::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    pub fn get(&self, id: i64) -> Result<Option<OutboxRecord>, OutboxError> {
        let conn = self.conn.lock();
        let record = conn
            .query_row(
                &format!("SELECT {} FROM detections_outbox WHERE id = ?1", SELECT_COLUMNS),
                params![id],
                OutboxRecord::from_row,
            )
            .optional()?;
        Ok(record)
    }

    /// Stamp a record acknowledged and clear its error.
    pub fn mark_sent(&self, id: i64) -> Result<(), OutboxError> {
        let sent_at = Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true);
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE detections_outbox SET sent_at = ?1, last_error = NULL WHERE id = ?2",
            params![sent_at, id],
        )?;
        Ok(())
    }

    /// Record a failed attempt. The record stays unsent.
    pub fn mark_error(&self, id: i64, error: &str) -> Result<(), OutboxError> {
        let truncated: String = error.chars().take(MAX_ERROR_CHARS).collect();
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE detections_outbox
             SET last_error = ?1, retry_count = retry_count + 1
             WHERE id = ?2",
            params![truncated, id],
        )?;
        Ok(())
    }

    pub fn pending_count(&self) -> Result<u64, OutboxError> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM detections_outbox WHERE sent_at IS NULL",
            [],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }

    pub fn total_count(&self) -> Result<u64, OutboxError> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM detections_outbox", [], |row| row.get(0))?;
        Ok(count.max(0) as u64)
    }
}

/// Removes the queue table so every later write fails.
#[cfg(test)]
impl Outbox {
    pub(crate) fn drop_table(&self) {
        self.conn
            .lock()
            .execute_batch("DROP TABLE detections_outbox")
            .unwrap();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(after: u32) -> OccupancyEvent {
        OccupancyEvent {
            ts: Utc::now(),
            gate: "G1".to_string(),
            delta: 1,
            track_id: 1_000_001,
            class_id: 2,
            speed: 20.0,
            ref_y: 40.0,
            occupancy_before: after.saturating_sub(1),
            occupancy_after: after,
        }
    }

    fn enqueue(outbox: &Outbox, after: u32) -> i64 {
        let ev = event(after);
        let payload = OutboxPayload::from_event(&ev, "96N", "96N-camera-1", 73);
        outbox.enqueue(&ev, &payload).unwrap()
    }

    #[test]
    fn test_enqueue_assigns_increasing_ids() {
        let outbox = Outbox::in_memory().unwrap();
        let a = enqueue(&outbox, 1);
        let b = enqueue(&outbox, 2);
        assert!(b > a);
        assert_eq!(outbox.pending_count().unwrap(), 2);
    }

    #[test]
    fn test_record_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("edge_data").join("edge_events.db");
        let id = {
            let outbox = Outbox::open(&db).unwrap();
            enqueue(&outbox, 11)
        };

        let reopened = Outbox::open(&db).unwrap();
        let record = reopened.get(id).unwrap().unwrap();
        assert_eq!(record.sent_at, None);
        assert_eq!(record.occupied_count, 11);
        assert_eq!(record.retry_count, 0);
        let payload: serde_json::Value = serde_json::from_str(&record.payload_json).unwrap();
        assert_eq!(payload["occupied_count"], 11);
        assert_eq!(payload["lot_id"], "96N");
    }

    #[test]
    fn test_fetch_unsent_is_ordered_and_bounded() {
        let outbox = Outbox::in_memory().unwrap();
        let ids: Vec<i64> = (1..=5).map(|n| enqueue(&outbox, n)).collect();
        outbox.mark_sent(ids[0]).unwrap();

        let batch = outbox.fetch_unsent(3).unwrap();
        let got: Vec<i64> = batch.iter().map(|r| r.id).collect();
        assert_eq!(got, vec![ids[1], ids[2], ids[3]]);
    }

    #[test]
    fn test_mark_error_then_sent() {
        let outbox = Outbox::in_memory().unwrap();
        let id = enqueue(&outbox, 3);
        let long = "x".repeat(500);
        outbox.mark_error(id, &long).unwrap();
        outbox.mark_error(id, "503 unavailable").unwrap();

        let record = outbox.get(id).unwrap().unwrap();
        assert_eq!(record.retry_count, 2);
        assert_eq!(record.last_error.as_deref(), Some("503 unavailable"));
        assert!(record.sent_at.is_none());

        outbox.mark_error(id, &long).unwrap();
        assert_eq!(outbox.get(id).unwrap().unwrap().last_error.unwrap().len(), MAX_ERROR_CHARS);

        outbox.mark_sent(id).unwrap();
        let record = outbox.get(id).unwrap().unwrap();
        assert!(record.sent_at.unwrap().ends_with('Z'));
        assert!(record.last_error.is_none());
        assert_eq!(outbox.pending_count().unwrap(), 0);
        assert_eq!(outbox.total_count().unwrap(), 1, "sent records are kept");
    }
}
