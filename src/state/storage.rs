//! Membership State Storage
//!
//! Durable home of the committed [`MembershipSnapshot`]. The manager loads
//! it once at construction and writes it synchronously whenever a
//! membership change commits or a truncation is reconciled.

use std::path::PathBuf;
use rusqlite::{Connection, OptionalExtension, params};

use super::snapshot::MembershipSnapshot;
use crate::error::Result;

/// Storage for the committed membership snapshot
pub trait StateStorage: Send {
    /// Last persisted snapshot, or the empty snapshot if none was ever written
    fn get_initial_state(&self) -> Result<MembershipSnapshot>;

    /// Durably replace the stored snapshot
    fn persist_store_data(&mut self, snapshot: &MembershipSnapshot) -> Result<()>;
}

/// SQLite-backed snapshot storage, owned by a single manager
pub struct SqliteStateStorage {
    conn: Connection,
}

impl SqliteStateStorage {
    /// Create or open `membership.db` in `data_dir`
    pub fn new(data_dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&data_dir)?;

        let db_path = data_dir.join("membership.db");
        let conn = Connection::open(&db_path)?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS membership_state (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                log_index INTEGER NOT NULL,
                snapshot BLOB NOT NULL,
                updated_at TEXT NOT NULL
            );
            "#,
        )?;

        Ok(Self { conn })
    }

    /// When the snapshot was last written, if ever
    pub fn last_updated(&self) -> Result<Option<chrono::DateTime<chrono::Utc>>> {
        let updated: Option<String> = self
            .conn
            .query_row(
                "SELECT updated_at FROM membership_state WHERE id = 1",
                [],
                |row| row.get(0),
            )
            .optional()?;

        match updated {
            Some(text) => chrono::DateTime::parse_from_rfc3339(&text)
                .map(|t| Some(t.with_timezone(&chrono::Utc)))
                .map_err(|e| crate::Error::StateCorrupted(format!("bad updated_at {:?}: {}", text, e))),
            None => Ok(None),
        }
    }
}

impl StateStorage for SqliteStateStorage {
    fn get_initial_state(&self) -> Result<MembershipSnapshot> {
        let blob: Option<Vec<u8>> = self
            .conn
            .query_row(
                "SELECT snapshot FROM membership_state WHERE id = 1",
                [],
                |row| row.get(0),
            )
            .optional()?;

        match blob {
            Some(bytes) => MembershipSnapshot::decode(&bytes),
            None => Ok(MembershipSnapshot::default()),
        }
    }

    fn persist_store_data(&mut self, snapshot: &MembershipSnapshot) -> Result<()> {
        let bytes = snapshot.encode()?;
        self.conn.execute(
            r#"
            INSERT INTO membership_state (id, log_index, snapshot, updated_at) VALUES (1, ?1, ?2, ?3)
            ON CONFLICT(id) DO UPDATE SET log_index = ?1, snapshot = ?2, updated_at = ?3
            "#,
            params![
                snapshot.log_index as i64,
                bytes,
                chrono::Utc::now().to_rfc3339()
            ],
        )?;
        Ok(())
    }
}

/// Snapshot storage kept in memory
#[derive(Debug, Default)]
pub struct InMemoryStateStorage {
    snapshot: Option<MembershipSnapshot>,
    writes: usize,
}

impl InMemoryStateStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an already persisted snapshot
    pub fn with_snapshot(snapshot: MembershipSnapshot) -> Self {
        Self {
            snapshot: Some(snapshot),
            writes: 0,
        }
    }

    /// Number of successful persists
    pub fn writes(&self) -> usize {
        self.writes
    }
}

impl StateStorage for InMemoryStateStorage {
    fn get_initial_state(&self) -> Result<MembershipSnapshot> {
        Ok(self.snapshot.clone().unwrap_or_default())
    }

    fn persist_store_data(&mut self, snapshot: &MembershipSnapshot) -> Result<()> {
        self.snapshot = Some(snapshot.clone());
        self.writes += 1;
        Ok(())
    }
}
