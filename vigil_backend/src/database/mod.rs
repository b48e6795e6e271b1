mod error;
pub mod migrations;
mod records;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};

use crate::directives;

pub use error::{StoreError, StoreResult};
pub use migrations::{Migration, MIGRATIONS};
pub use records::{
    ChatEntry, Directive, EvolutionEntry, JournalEntry, JournalKind, MiscEntry, PhilosophyEntry,
    SchemaVersion, TechnologyEntry, UserContextEntry, VersionEntry,
};

use records::row_timestamp;

pub const BOOTSTRAP_EVENT_KIND: &str = "system_event";

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const BASE_TABLES: &[(&str, &str)] = &[
    (
        "schema_versions",
        "CREATE TABLE IF NOT EXISTS schema_versions (id INTEGER PRIMARY KEY AUTOINCREMENT, version INTEGER UNIQUE, applied_at DATETIME DEFAULT CURRENT_TIMESTAMP)",
    ),
    (
        "ch",
        "CREATE TABLE IF NOT EXISTS ch (id INTEGER PRIMARY KEY AUTOINCREMENT, timestamp DATETIME DEFAULT CURRENT_TIMESTAMP, session_id TEXT, type TEXT, content TEXT, metadata TEXT)",
    ),
    (
        "vs",
        "CREATE TABLE IF NOT EXISTS vs (id INTEGER PRIMARY KEY AUTOINCREMENT, timestamp DATETIME DEFAULT CURRENT_TIMESTAMP, component TEXT, version TEXT, changelog TEXT)",
    ),
    (
        "user_context",
        "CREATE TABLE IF NOT EXISTS user_context (id INTEGER PRIMARY KEY AUTOINCREMENT, timestamp DATETIME DEFAULT CURRENT_TIMESTAMP, category TEXT, key TEXT, value TEXT, context TEXT)",
    ),
    (
        "sovereign",
        "CREATE TABLE IF NOT EXISTS sovereign (id INTEGER PRIMARY KEY AUTOINCREMENT, timestamp DATETIME DEFAULT CURRENT_TIMESTAMP, focus_area TEXT, entry_type TEXT, content TEXT, metadata TEXT)",
    ),
    (
        "evolution",
        "CREATE TABLE IF NOT EXISTS evolution (id INTEGER PRIMARY KEY AUTOINCREMENT, timestamp DATETIME DEFAULT CURRENT_TIMESTAMP, milestone TEXT, description TEXT, growth_index REAL DEFAULT 1.0)",
    ),
    (
        "prime_directives",
        "CREATE TABLE IF NOT EXISTS prime_directives (id INTEGER PRIMARY KEY AUTOINCREMENT, timestamp DATETIME DEFAULT CURRENT_TIMESTAMP, directive TEXT UNIQUE, description TEXT)",
    ),
    (
        "philosophy",
        "CREATE TABLE IF NOT EXISTS philosophy (id INTEGER PRIMARY KEY AUTOINCREMENT, timestamp DATETIME DEFAULT CURRENT_TIMESTAMP, topic TEXT, insight TEXT)",
    ),
    (
        "technologies",
        "CREATE TABLE IF NOT EXISTS technologies (id INTEGER PRIMARY KEY AUTOINCREMENT, timestamp DATETIME DEFAULT CURRENT_TIMESTAMP, topic TEXT, key TEXT, value TEXT, success_rate REAL DEFAULT 1.0)",
    ),
    (
        "jon",
        "CREATE TABLE IF NOT EXISTS jon (id INTEGER PRIMARY KEY AUTOINCREMENT, timestamp DATETIME DEFAULT CURRENT_TIMESTAMP, category TEXT, key TEXT, value TEXT, context TEXT)",
    ),
];

/// Summary returned by [`JournalStore::load_directives_from`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DirectiveLoadReport {
    pub parsed: usize,
    pub inserted: usize,
}

/// The process-owned journal database.
///
/// Writes share one connection behind a lock, held for one statement or one
/// migration transaction. Reads on a file-backed store open their own
/// read-only connection per call and run alongside the writer under WAL. An
/// in-memory store has no file to share, so its reads go through the writer.
///
/// Every method blocks; async callers go through [`JournalStore::blocking`].
pub struct JournalStore {
    writer: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl JournalStore {
    fn lock_writer(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.writer.lock().map_err(|_| StoreError::LockPoisoned)
    }

    fn read<T>(
        &self,
        table: &'static str,
        op: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> StoreResult<T> {
        match &self.path {
            Some(path) => {
                let conn = open_reader(path).map_err(|e| read_error(table, e))?;
                op(&conn).map_err(|e| read_error(table, e))
            }
            None => {
                let conn = self.lock_writer()?;
                op(&conn).map_err(|e| read_error(table, e))
            }
        }
    }

    /// Run store calls on tokio's blocking pool.
    pub async fn blocking<T, F>(self: &Arc<Self>, op: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&JournalStore) -> StoreResult<T> + Send + 'static,
    {
        let store = Arc::clone(self);
        tokio::task::spawn_blocking(move || op(&store)).await?
    }

    /// Open (creating if needed) the database file and bring its schema up to date.
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        Self::open_with_migrations(path, MIGRATIONS)
    }

    pub fn open_with_migrations<P: AsRef<Path>>(
        path: P,
        migrations: &[Migration],
    ) -> StoreResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Initialization {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        let conn = Connection::open(path).map_err(|e| StoreError::Open {
            path: path.to_path_buf(),
            source: e,
        })?;
        conn.busy_timeout(BUSY_TIMEOUT)
            .map_err(|e| StoreError::schema("busy_timeout", e))?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
            row.get::<_, String>(0)
        })
        .map_err(|e| StoreError::schema("journal_mode", e))?;

        let store = Self {
            writer: Mutex::new(conn),
            path: Some(path.to_path_buf()),
        };
        store.ensure_schema_with(migrations)?;
        tracing::debug!("Journal store ready at {:?}", path);
        Ok(store)
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory().map_err(|e| StoreError::Open {
            path: ":memory:".into(),
            source: e,
        })?;
        let store = Self {
            writer: Mutex::new(conn),
            path: None,
        };
        store.ensure_schema()?;
        Ok(store)
    }

    /// Create missing tables, apply pending migrations, seed the bootstrap marker.
    ///
    /// Safe to call any number of times.
    pub fn ensure_schema(&self) -> StoreResult<()> {
        self.ensure_schema_with(MIGRATIONS)
    }

    fn ensure_schema_with(&self, migrations: &[Migration]) -> StoreResult<()> {
        let mut conn = self.lock_writer()?;

        for (table, ddl) in BASE_TABLES {
            conn.execute(ddl, [])
                .map_err(|e| StoreError::schema(format!("create table {table}"), e))?;
        }

        migrations::apply_pending(&mut conn, migrations)?;

        let chat_rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM ch", [], |row| row.get(0))
            .map_err(|e| StoreError::schema("count chat rows", e))?;
        if chat_rows == 0 {
            let message = format!(
                "System initialized at {}: vigil is up and running.",
                Utc::now().to_rfc2822()
            );
            conn.execute(
                "INSERT INTO ch (type, content) VALUES (?1, ?2)",
                params![BOOTSTRAP_EVENT_KIND, message],
            )
            .map_err(|e| StoreError::schema("insert bootstrap marker", e))?;
        }

        Ok(())
    }

    pub fn applied_schema_versions(&self) -> StoreResult<Vec<SchemaVersion>> {
        self.read("schema_versions", |conn| {
            let mut stmt =
                conn.prepare("SELECT version, applied_at FROM schema_versions ORDER BY version ASC")?;
            let versions = stmt
                .query_map([], |row| {
                    Ok(SchemaVersion {
                        version: row.get(0)?,
                        applied_at: row_timestamp(row, 1)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(versions)
        })
    }

    /// Cheap liveness probe for diagnostics.
    pub fn ping(&self) -> StoreResult<()> {
        self.read("sqlite_master", |conn| {
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
                .map(|_| ())
        })
    }

    pub fn count(&self, kind: JournalKind) -> StoreResult<usize> {
        let count = self.read(kind.table(), |conn| {
            conn.query_row(&format!("SELECT COUNT(*) FROM {}", kind.table()), [], |row| {
                row.get::<_, i64>(0)
            })
        })?;
        Ok(count as usize)
    }

    // ------------------------------------------------------------------
    // Directives
    // ------------------------------------------------------------------

    /// Parse a directives manifest and insert every directive not yet stored.
    pub fn load_directives_from(&self, manifest: &str) -> StoreResult<DirectiveLoadReport> {
        let parsed = directives::parse_manifest(manifest);
        let mut report = DirectiveLoadReport {
            parsed: parsed.len(),
            inserted: 0,
        };
        for line in parsed {
            if self.insert_directive(&line.directive, &line.description)? {
                report.inserted += 1;
            }
        }
        Ok(report)
    }

    /// Returns `false` when an identical directive already exists.
    pub fn insert_directive(&self, directive: &str, description: &str) -> StoreResult<bool> {
        let conn = self.lock_writer()?;
        let changed = conn
            .execute(
                "INSERT OR IGNORE INTO prime_directives (directive, description) VALUES (?1, ?2)",
                params![directive, description],
            )
            .map_err(|e| write_error("prime_directives", e))?;
        Ok(changed > 0)
    }

    pub fn get_directives(&self, limit: usize) -> StoreResult<Vec<Directive>> {
        self.query_recent(JournalKind::Directives, "directive, description", limit, |row| {
            Ok(Directive {
                id: row.get(0)?,
                timestamp: row_timestamp(row, 1)?,
                directive: text(row, 2)?,
                description: text(row, 3)?,
            })
        })
    }

    // ------------------------------------------------------------------
    // Journal tables
    // ------------------------------------------------------------------

    pub fn insert_chat_entry(
        &self,
        session_id: Option<&str>,
        kind: &str,
        content: &str,
        metadata: Option<&str>,
    ) -> StoreResult<i64> {
        self.insert(
            JournalKind::Chat,
            "INSERT INTO ch (session_id, type, content, metadata) VALUES (?1, ?2, ?3, ?4)",
            params![session_id, kind, content, metadata],
        )
    }

    pub fn get_chat_entries(&self, limit: usize) -> StoreResult<Vec<ChatEntry>> {
        self.query_recent(
            JournalKind::Chat,
            "session_id, type, content, metadata",
            limit,
            |row| {
                Ok(ChatEntry {
                    id: row.get(0)?,
                    timestamp: row_timestamp(row, 1)?,
                    session_id: row.get(2)?,
                    kind: text(row, 3)?,
                    content: text(row, 4)?,
                    metadata: row.get(5)?,
                })
            },
        )
    }

    pub fn insert_version_entry(
        &self,
        component: &str,
        version: &str,
        changelog: &str,
    ) -> StoreResult<i64> {
        self.insert(
            JournalKind::Versions,
            "INSERT INTO vs (component, version, changelog) VALUES (?1, ?2, ?3)",
            params![component, version, changelog],
        )
    }

    pub fn get_version_entries(&self, limit: usize) -> StoreResult<Vec<VersionEntry>> {
        self.query_recent(
            JournalKind::Versions,
            "component, version, changelog",
            limit,
            |row| {
                Ok(VersionEntry {
                    id: row.get(0)?,
                    timestamp: row_timestamp(row, 1)?,
                    component: text(row, 2)?,
                    version: text(row, 3)?,
                    changelog: text(row, 4)?,
                })
            },
        )
    }

    pub fn insert_user_context_entry(
        &self,
        category: &str,
        key: &str,
        value: &str,
        context: &str,
    ) -> StoreResult<i64> {
        self.insert(
            JournalKind::UserContext,
            "INSERT INTO user_context (category, key, value, context) VALUES (?1, ?2, ?3, ?4)",
            params![category, key, value, context],
        )
    }

    pub fn get_user_context_entries(&self, limit: usize) -> StoreResult<Vec<UserContextEntry>> {
        self.query_recent(
            JournalKind::UserContext,
            "category, key, value, context",
            limit,
            |row| {
                Ok(UserContextEntry {
                    id: row.get(0)?,
                    timestamp: row_timestamp(row, 1)?,
                    category: text(row, 2)?,
                    key: text(row, 3)?,
                    value: text(row, 4)?,
                    context: text(row, 5)?,
                })
            },
        )
    }

    pub fn insert_journal_entry(
        &self,
        focus_area: &str,
        kind: &str,
        content: &str,
        metadata: Option<&str>,
    ) -> StoreResult<i64> {
        self.insert(
            JournalKind::SelfJournal,
            "INSERT INTO sovereign (focus_area, entry_type, content, metadata) VALUES (?1, ?2, ?3, ?4)",
            params![focus_area, kind, content, metadata],
        )
    }

    pub fn get_journal_entries(&self, limit: usize) -> StoreResult<Vec<JournalEntry>> {
        self.query_recent(
            JournalKind::SelfJournal,
            "focus_area, entry_type, content, metadata",
            limit,
            |row| {
                Ok(JournalEntry {
                    id: row.get(0)?,
                    timestamp: row_timestamp(row, 1)?,
                    focus_area: text(row, 2)?,
                    kind: text(row, 3)?,
                    content: text(row, 4)?,
                    metadata: row.get(5)?,
                })
            },
        )
    }

    /// `growth_index` falls back to the column default (1.0) when `None`.
    pub fn insert_evolution_entry(
        &self,
        milestone: &str,
        description: &str,
        growth_index: Option<f64>,
    ) -> StoreResult<i64> {
        self.insert(
            JournalKind::Evolution,
            "INSERT INTO evolution (milestone, description, growth_index) VALUES (?1, ?2, COALESCE(?3, 1.0))",
            params![milestone, description, growth_index],
        )
    }

    pub fn get_evolution_entries(&self, limit: usize) -> StoreResult<Vec<EvolutionEntry>> {
        self.query_recent(
            JournalKind::Evolution,
            "milestone, description, growth_index",
            limit,
            |row| {
                Ok(EvolutionEntry {
                    id: row.get(0)?,
                    timestamp: row_timestamp(row, 1)?,
                    milestone: text(row, 2)?,
                    description: text(row, 3)?,
                    growth_index: row.get::<_, Option<f64>>(4)?.unwrap_or(1.0),
                })
            },
        )
    }

    pub fn insert_philosophy_entry(&self, topic: &str, insight: &str) -> StoreResult<i64> {
        self.insert(
            JournalKind::Philosophy,
            "INSERT INTO philosophy (topic, insight) VALUES (?1, ?2)",
            params![topic, insight],
        )
    }

    pub fn get_philosophy_entries(&self, limit: usize) -> StoreResult<Vec<PhilosophyEntry>> {
        self.query_recent(JournalKind::Philosophy, "topic, insight", limit, |row| {
            Ok(PhilosophyEntry {
                id: row.get(0)?,
                timestamp: row_timestamp(row, 1)?,
                topic: text(row, 2)?,
                insight: text(row, 3)?,
            })
        })
    }

    /// `success_rate` falls back to the column default (1.0) when `None`.
    pub fn insert_technology_entry(
        &self,
        topic: &str,
        key: &str,
        value: &str,
        success_rate: Option<f64>,
    ) -> StoreResult<i64> {
        self.insert(
            JournalKind::Technology,
            "INSERT INTO technologies (topic, key, value, success_rate) VALUES (?1, ?2, ?3, COALESCE(?4, 1.0))",
            params![topic, key, value, success_rate],
        )
    }

    pub fn get_technology_entries(&self, limit: usize) -> StoreResult<Vec<TechnologyEntry>> {
        self.query_recent(
            JournalKind::Technology,
            "topic, key, value, success_rate",
            limit,
            |row| {
                Ok(TechnologyEntry {
                    id: row.get(0)?,
                    timestamp: row_timestamp(row, 1)?,
                    topic: text(row, 2)?,
                    key: text(row, 3)?,
                    value: text(row, 4)?,
                    success_rate: row.get::<_, Option<f64>>(5)?.unwrap_or(1.0),
                })
            },
        )
    }

    pub fn insert_misc_entry(
        &self,
        category: &str,
        key: &str,
        value: &str,
        context: &str,
    ) -> StoreResult<i64> {
        self.insert(
            JournalKind::Misc,
            "INSERT INTO jon (category, key, value, context) VALUES (?1, ?2, ?3, ?4)",
            params![category, key, value, context],
        )
    }

    pub fn get_misc_entries(&self, limit: usize) -> StoreResult<Vec<MiscEntry>> {
        self.query_recent(
            JournalKind::Misc,
            "category, key, value, context",
            limit,
            |row| {
                Ok(MiscEntry {
                    id: row.get(0)?,
                    timestamp: row_timestamp(row, 1)?,
                    category: text(row, 2)?,
                    key: text(row, 3)?,
                    value: text(row, 4)?,
                    context: text(row, 5)?,
                })
            },
        )
    }

    pub fn misc_value_exists(&self, value: &str) -> StoreResult<bool> {
        let found = self.read("jon", |conn| {
            conn.query_row("SELECT 1 FROM jon WHERE value = ?1 LIMIT 1", [value], |row| {
                row.get::<_, i64>(0)
            })
            .optional()
        })?;
        Ok(found.is_some())
    }

    /// External message ids recorded in chat metadata (`{"id": ...}`).
    pub fn chat_message_ids(&self) -> StoreResult<HashSet<String>> {
        let raw = self.read("ch", |conn| {
            let mut stmt = conn.prepare("SELECT metadata FROM ch WHERE metadata IS NOT NULL")?;
            let raw = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(raw)
        })?;

        Ok(raw
            .iter()
            .filter_map(|meta| serde_json::from_str::<serde_json::Value>(meta).ok())
            .filter_map(|meta| meta.get("id").and_then(|id| id.as_str()).map(str::to_string))
            .collect())
    }

    fn insert(
        &self,
        kind: JournalKind,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> StoreResult<i64> {
        let conn = self.lock_writer()?;
        conn.execute(sql, params)
            .map_err(|e| write_error(kind.table(), e))?;
        Ok(conn.last_insert_rowid())
    }

    /// Most recent rows first; ties on the second-resolution timestamp fall back to id.
    fn query_recent<T, F>(
        &self,
        kind: JournalKind,
        columns: &str,
        limit: usize,
        map: F,
    ) -> StoreResult<Vec<T>>
    where
        F: FnMut(&Row<'_>) -> rusqlite::Result<T>,
    {
        let table = kind.table();
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.read(table, |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT id, timestamp, {columns} FROM {table} ORDER BY timestamp DESC, id DESC LIMIT ?1"
            ))?;
            let rows = stmt
                .query_map([limit], map)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }
}

fn open_reader(path: &Path) -> rusqlite::Result<Connection> {
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    Ok(conn)
}

/// Nullable text column read as an empty string.
fn text(row: &Row<'_>, index: usize) -> rusqlite::Result<String> {
    Ok(row.get::<_, Option<String>>(index)?.unwrap_or_default())
}

fn write_error(table: &'static str, source: rusqlite::Error) -> StoreError {
    StoreError::Write { table, source }
}

fn read_error(table: &'static str, source: rusqlite::Error) -> StoreError {
    StoreError::Read { table, source }
}
