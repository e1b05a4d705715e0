//! Call History Database
//!
//! SQLite-Datenbank für die lokale Anrufliste.
//! Ein Eintrag pro Anrufversuch, eindeutig über die attempt_id.

use super::HistoryRecorder;
use crate::call_session::{CallHistoryEntry, CallId, PeerInfo};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum HistoryError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Failed to create database directory: {0}")]
    DirectoryCreation(#[from] std::io::Error),
}

// ============================================================================
// DATABASE
// ============================================================================

/// SQLite-Anrufliste (Thread-safe durch Mutex, billig klonbar)
#[derive(Clone)]
pub struct SqliteCallHistory {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteCallHistory {
    /// Öffnet oder erstellt die Datenbank unter `path`
    pub fn open(path: &Path) -> Result<Self, HistoryError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        tracing::info!("Opening call history at {:?}", path);

        let conn = Connection::open(path)?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init_schema()?;

        Ok(db)
    }

    /// Öffnet die Datenbank im App-Datenverzeichnis
    pub fn open_default() -> Result<Self, HistoryError> {
        Self::open(&Self::default_path()?)
    }

    /// In-Memory Datenbank für Tests
    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, HistoryError> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init_schema()?;
        Ok(db)
    }

    /// Ermittelt den Pfad zur Datenbank-Datei
    pub fn default_path() -> Result<PathBuf, HistoryError> {
        let proj_dirs = directories::ProjectDirs::from("com", "callcoordinator", "call-coordinator")
            .ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "Could not determine app data directory",
                )
            })?;

        let mut path = proj_dirs.data_dir().to_path_buf();
        path.push("call_history.db");
        Ok(path)
    }

    fn init_schema(&self) -> Result<(), HistoryError> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS call_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                attempt_id TEXT NOT NULL UNIQUE,
                call_id TEXT,
                direction TEXT NOT NULL,
                peer_id TEXT NOT NULL,
                peer_name TEXT NOT NULL,
                peer_avatar TEXT,
                media_kind TEXT NOT NULL,
                status TEXT NOT NULL,
                duration_secs INTEGER NOT NULL DEFAULT 0,
                started_at TEXT NOT NULL,
                connected_at TEXT,
                ended_at TEXT NOT NULL
            )
            "#,
            [],
        )?;

        conn.execute(
            r#"
            CREATE INDEX IF NOT EXISTS idx_call_history_ended_at ON call_history(ended_at)
            "#,
            [],
        )?;

        conn.execute(
            r#"
            CREATE INDEX IF NOT EXISTS idx_call_history_call_id ON call_history(call_id)
            "#,
            [],
        )?;

        Ok(())
    }

    /// Speichert einen Eintrag, `false` wenn der Versuch schon erfasst ist
    pub fn insert(&self, entry: &CallHistoryEntry) -> Result<bool, HistoryError> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            r#"
            INSERT OR IGNORE INTO call_history (
                attempt_id, call_id, direction, peer_id, peer_name, peer_avatar,
                media_kind, status, duration_secs, started_at, connected_at, ended_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
            params![
                entry.attempt.to_string(),
                entry.call_id.as_ref().map(CallId::as_str),
                entry.direction.as_str(),
                entry.peer.id,
                entry.peer.name,
                entry.peer.avatar,
                entry.media_kind.as_str(),
                entry.status.as_str(),
                entry.duration_secs as i64,
                entry.started_at.to_rfc3339(),
                entry.connected_at.map(|t| t.to_rfc3339()),
                entry.ended_at.to_rfc3339(),
            ],
        )?;
        Ok(changed > 0)
    }

    /// Die letzten `limit` Anrufe, neueste zuerst
    pub fn recent(&self, limit: usize) -> Result<Vec<CallHistoryEntry>, HistoryError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT attempt_id, call_id, direction, peer_id, peer_name, peer_avatar,
                   media_kind, status, duration_secs, started_at, connected_at, ended_at
            FROM call_history
            ORDER BY ended_at DESC, id DESC
            LIMIT ?1
            "#,
        )?;

        let entries = stmt
            .query_map(params![limit as i64], entry_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(entries)
    }

    /// Holt den Eintrag zu einer Backend-Call-ID
    pub fn get_by_call_id(&self, call_id: &CallId) -> Result<Option<CallHistoryEntry>, HistoryError> {
        let conn = self.conn.lock();
        let entry = conn
            .query_row(
                r#"
                SELECT attempt_id, call_id, direction, peer_id, peer_name, peer_avatar,
                       media_kind, status, duration_secs, started_at, connected_at, ended_at
                FROM call_history
                WHERE call_id = ?1
                "#,
                params![call_id.as_str()],
                entry_from_row,
            )
            .optional()?;
        Ok(entry)
    }

    fn insert_logged(&self, entry: &CallHistoryEntry) {
        match self.insert(entry) {
            Ok(true) => tracing::debug!("Recorded call history for attempt {}", entry.attempt),
            Ok(false) => tracing::debug!("Call history for attempt {} already recorded", entry.attempt),
            Err(e) => tracing::error!("Failed to record call history: {}", e),
        }
    }
}

impl HistoryRecorder for SqliteCallHistory {
    fn record(&self, entry: CallHistoryEntry) {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let db = self.clone();
                handle.spawn_blocking(move || db.insert_logged(&entry));
            }
            Err(_) => self.insert_logged(&entry),
        }
    }
}

impl std::fmt::Debug for SqliteCallHistory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteCallHistory").finish_non_exhaustive()
    }
}

// ============================================================================
// ROW MAPPING
// ============================================================================

fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<CallHistoryEntry> {
    Ok(CallHistoryEntry {
        attempt: parse_column(row, 0)?,
        call_id: row.get::<_, Option<String>>(1)?.map(CallId::new),
        direction: parse_column(row, 2)?,
        peer: PeerInfo {
            id: row.get(3)?,
            name: row.get(4)?,
            avatar: row.get(5)?,
        },
        media_kind: parse_column(row, 6)?,
        status: parse_column(row, 7)?,
        duration_secs: row.get::<_, i64>(8)?.max(0) as u64,
        started_at: timestamp_column(row, 9)?,
        connected_at: row
            .get::<_, Option<String>>(10)?
            .map(|raw| parse_timestamp(10, &raw))
            .transpose()?,
        ended_at: timestamp_column(row, 11)?,
    })
}

fn parse_column<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e: T::Err| {
        rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.to_string().into())
    })
}

fn timestamp_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_timestamp(idx, &raw)
}

fn parse_timestamp(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

// ============================================================================
// TESTS
// ============================================================================
