//! Local mirror store.
//!
//! Uses rusqlite with WAL mode to keep the last-known normalized snapshot and
//! status of every user/customer the engine has touched. The mirror is a
//! best-effort cache, never authoritative: remote success overwrites it,
//! remote failure retains the previous snapshot so the UI can degrade
//! gracefully. It also records unfinished create-then-link sagas
//! (`pending_link`) so a repair pass can complete them.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::fs;
use std::path::Path;
use std::sync::Mutex;
use tracing::{error, info, warn};

use crate::records::EntityKind;

/// Current schema version. Bump when adding new migrations.
const CURRENT_SCHEMA_VERSION: i32 = 1;

// ---------------------------------------------------------------------------
// Entry model
// ---------------------------------------------------------------------------

/// Linkage bookkeeping for a mirrored entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Counterpart exists and the foreign key is persisted.
    Linked,
    /// Counterpart was created but the follow-up FK write failed; a repair
    /// pass should re-issue it.
    PendingLink,
    /// No counterpart known.
    Unlinked,
}

impl LinkState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Linked => "linked",
            Self::PendingLink => "pending_link",
            Self::Unlinked => "unlinked",
        }
    }

    fn parse(raw: &str) -> Self {
        match raw {
            "linked" => Self::Linked,
            "pending_link" => Self::PendingLink,
            _ => Self::Unlinked,
        }
    }
}

/// A cached snapshot of one entity's last-known state.
#[derive(Debug, Clone, PartialEq)]
pub struct MirrorEntry {
    pub kind: EntityKind,
    pub id: i64,
    /// Normalized wire payload at last sync attempt.
    pub record: Value,
    pub active: bool,
    pub link_state: LinkState,
    /// RFC 3339 timestamp of the last write to this entry.
    pub last_sync: String,
}

impl MirrorEntry {
    pub fn new(kind: EntityKind, id: i64, record: Value, active: bool, link_state: LinkState) -> Self {
        Self {
            kind,
            id,
            record,
            active,
            link_state,
            last_sync: Utc::now().to_rfc3339(),
        }
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Keyed cache over (entity kind, entity id).
pub struct MirrorStore {
    conn: Mutex<Connection>,
}

impl MirrorStore {
    /// Open (or create) the mirror database at `{data_dir}/mirror.db`,
    /// apply pragmas, and run pending migrations.
    pub fn open(data_dir: &Path) -> Result<Self, String> {
        fs::create_dir_all(data_dir).map_err(|e| format!("failed to create data dir: {e}"))?;
        let db_path = data_dir.join("mirror.db");
        info!("opening mirror store at {}", db_path.display());

        let conn = open_and_configure(&db_path)?;
        run_migrations(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory store; used by tests and as a throwaway fallback.
    pub fn open_in_memory() -> Result<Self, String> {
        let conn = Connection::open_in_memory().map_err(|e| format!("sqlite open: {e}"))?;
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .map_err(|e| format!("pragma setup: {e}"))?;
        run_migrations(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Read the last-known snapshot for an entity, if any.
    pub fn read(&self, kind: EntityKind, id: i64) -> Option<MirrorEntry> {
        let conn = self.conn.lock().ok()?;
        conn.query_row(
            "SELECT record, status_active, link_state, last_sync
             FROM mirror_entries WHERE kind = ?1 AND entity_id = ?2",
            params![kind.as_str(), id],
            |row| {
                let record_raw: String = row.get(0)?;
                let active: i64 = row.get(1)?;
                let link_raw: String = row.get(2)?;
                let last_sync: String = row.get(3)?;
                Ok(MirrorEntry {
                    kind,
                    id,
                    record: serde_json::from_str(&record_raw).unwrap_or(Value::Null),
                    active: active == 1,
                    link_state: LinkState::parse(&link_raw),
                    last_sync,
                })
            },
        )
        .optional()
        .unwrap_or_else(|e| {
            warn!(kind = %kind, id, error = %e, "mirror read failed");
            None
        })
    }

    /// Upsert an entry. Called on every reconcile attempt, success or not.
    pub fn write(&self, entry: &MirrorEntry) -> Result<(), String> {
        let conn = self.conn.lock().map_err(|e| e.to_string())?;
        conn.execute(
            "INSERT INTO mirror_entries (kind, entity_id, record, status_active, link_state, last_sync)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(kind, entity_id) DO UPDATE SET
                record = excluded.record,
                status_active = excluded.status_active,
                link_state = excluded.link_state,
                last_sync = excluded.last_sync",
            params![
                entry.kind.as_str(),
                entry.id,
                entry.record.to_string(),
                if entry.active { 1 } else { 0 },
                entry.link_state.as_str(),
                entry.last_sync,
            ],
        )
        .map_err(|e| format!("mirror write: {e}"))?;
        Ok(())
    }

    /// Entries stuck in the `pending_link` saga state, oldest first.
    pub fn pending_links(&self) -> Vec<MirrorEntry> {
        let conn = match self.conn.lock() {
            Ok(c) => c,
            Err(e) => {
                error!(error = %e, "mirror lock poisoned");
                return Vec::new();
            }
        };
        let mut stmt = match conn.prepare(
            "SELECT kind, entity_id, record, status_active, last_sync
             FROM mirror_entries WHERE link_state = 'pending_link'
             ORDER BY last_sync ASC",
        ) {
            Ok(s) => s,
            Err(e) => {
                error!(error = %e, "pending_links prepare failed");
                return Vec::new();
            }
        };

        let rows = stmt.query_map([], |row| {
            let kind_raw: String = row.get(0)?;
            let id: i64 = row.get(1)?;
            let record_raw: String = row.get(2)?;
            let active: i64 = row.get(3)?;
            let last_sync: String = row.get(4)?;
            Ok((kind_raw, id, record_raw, active, last_sync))
        });

        match rows {
            Ok(rows) => rows
                .flatten()
                .filter_map(|(kind_raw, id, record_raw, active, last_sync)| {
                    let kind = EntityKind::parse(&kind_raw)?;
                    Some(MirrorEntry {
                        kind,
                        id,
                        record: serde_json::from_str(&record_raw).unwrap_or(Value::Null),
                        active: active == 1,
                        link_state: LinkState::PendingLink,
                        last_sync,
                    })
                })
                .collect(),
            Err(e) => {
                error!(error = %e, "pending_links query failed");
                Vec::new()
            }
        }
    }

    /// Promote a `pending_link` entry to `linked` once the FK write landed.
    pub fn mark_linked(&self, kind: EntityKind, id: i64) -> Result<(), String> {
        let conn = self.conn.lock().map_err(|e| e.to_string())?;
        conn.execute(
            "UPDATE mirror_entries SET link_state = 'linked', last_sync = ?3
             WHERE kind = ?1 AND entity_id = ?2",
            params![kind.as_str(), id, Utc::now().to_rfc3339()],
        )
        .map_err(|e| format!("mark_linked: {e}"))?;
        Ok(())
    }

    /// Explicit cache clear; the only path that deletes mirror entries.
    pub fn clear_all(&self) -> Result<(), String> {
        let conn = self.conn.lock().map_err(|e| e.to_string())?;
        conn.execute("DELETE FROM mirror_entries", [])
            .map_err(|e| format!("clear_all: {e}"))?;
        info!("mirror store cleared");
        Ok(())
    }
}

/// Open the database file and apply pragmas.
fn open_and_configure(path: &Path) -> Result<Connection, String> {
    let conn = Connection::open(path).map_err(|e| format!("sqlite open: {e}"))?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )
    .map_err(|e| format!("pragma setup: {e}"))?;
    Ok(conn)
}

/// Run all pending migrations up to `CURRENT_SCHEMA_VERSION`.
fn run_migrations(conn: &Connection) -> Result<(), String> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )
    .map_err(|e| format!("create schema_version: {e}"))?;

    let current: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current >= CURRENT_SCHEMA_VERSION {
        return Ok(());
    }

    if current < 1 {
        migrate_v1(conn)?;
    }

    info!("mirror schema migrated to v{CURRENT_SCHEMA_VERSION}");
    Ok(())
}

/// Migration v1: mirror entries table.
fn migrate_v1(conn: &Connection) -> Result<(), String> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS mirror_entries (
            kind TEXT NOT NULL CHECK (kind IN ('user', 'customer')),
            entity_id INTEGER NOT NULL,
            record TEXT NOT NULL DEFAULT '{}',
            status_active INTEGER NOT NULL DEFAULT 0,
            link_state TEXT NOT NULL DEFAULT 'unlinked'
                CHECK (link_state IN ('linked', 'pending_link', 'unlinked')),
            last_sync TEXT NOT NULL,
            PRIMARY KEY (kind, entity_id)
        );

        CREATE INDEX IF NOT EXISTS idx_mirror_entries_link_state
            ON mirror_entries(link_state);

        INSERT INTO schema_version (version) VALUES (1);
        ",
    )
    .map_err(|e| {
        error!("mirror migration v1 failed: {e}");
        format!("migration v1: {e}")
    })?;
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
