//! Event Journal
//!
//! Local append-only record of events, backed by SQLite in the data
//! directory. Events land here even when the registry is unreachable.

use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use tokio::sync::Mutex;

use super::{EventRecord, EventType};
use crate::error::{Error, Result};

/// SQLite-backed event journal
pub struct EventJournal {
    conn: Mutex<Connection>,
}

impl EventJournal {
    /// Create or open the journal in `data_dir`
    pub fn open(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)?;

        let conn = Connection::open(data_dir.join("events.db"))?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS events (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                node_id INTEGER NOT NULL,
                event TEXT NOT NULL,
                successful INTEGER NOT NULL,
                details TEXT NOT NULL,
                event_timestamp TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_events_event ON events(event);
            "#,
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Append an event
    pub async fn append(&self, event: &EventRecord) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            r#"
            INSERT INTO events (node_id, event, successful, details, event_timestamp)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![
                event.node_id,
                event.event_type.as_str(),
                event.successful,
                event.details,
                event.timestamp.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Most recent events, newest first
    pub async fn recent(&self, limit: usize) -> Result<Vec<EventRecord>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT node_id, event, successful, details, event_timestamp \
             FROM events ORDER BY seq DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok((
                row.get::<_, u32>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, bool>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;

        let mut events = Vec::new();
        for row in rows {
            let (node_id, event, successful, details, timestamp) = row?;
            let timestamp = DateTime::parse_from_rfc3339(&timestamp)
                .map_err(|e| Error::State(format!("Bad journal timestamp '{}': {}", timestamp, e)))?
                .with_timezone(&Utc);

            events.push(EventRecord {
                node_id,
                event_type: event.parse::<EventType>()?,
                successful,
                details,
                timestamp,
            });
        }

        Ok(events)
    }

    /// Number of journalled events of one type
    pub async fn count(&self, event_type: EventType) -> Result<u64> {
        let conn = self.conn.lock().await;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM events WHERE event = ?1",
            params![event_type.as_str()],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::State(format!("SQLite error: {}", e))
    }
}
