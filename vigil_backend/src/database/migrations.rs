use rusqlite::{params, Connection};

use super::error::{StoreError, StoreResult};

/// A schema upgrade recorded in `schema_versions` once applied.
pub struct Migration {
    pub version: i64,
    pub name: &'static str,
    pub apply: fn(&Connection) -> rusqlite::Result<()>,
}

/// Upgrades applied after the base tables exist, in this order.
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "baseline_journal_tables",
        apply: baseline,
    },
    Migration {
        version: 2,
        name: "journal_timestamp_indexes",
        apply: timestamp_indexes,
    },
    Migration {
        version: 3,
        name: "chat_session_index",
        apply: chat_session_index,
    },
];

fn baseline(_conn: &Connection) -> rusqlite::Result<()> {
    Ok(())
}

fn timestamp_indexes(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE INDEX IF NOT EXISTS idx_ch_timestamp ON ch(timestamp DESC);
         CREATE INDEX IF NOT EXISTS idx_vs_timestamp ON vs(timestamp DESC);
         CREATE INDEX IF NOT EXISTS idx_user_context_timestamp ON user_context(timestamp DESC);
         CREATE INDEX IF NOT EXISTS idx_sovereign_timestamp ON sovereign(timestamp DESC);
         CREATE INDEX IF NOT EXISTS idx_evolution_timestamp ON evolution(timestamp DESC);
         CREATE INDEX IF NOT EXISTS idx_philosophy_timestamp ON philosophy(timestamp DESC);
         CREATE INDEX IF NOT EXISTS idx_technologies_timestamp ON technologies(timestamp DESC);
         CREATE INDEX IF NOT EXISTS idx_jon_timestamp ON jon(timestamp DESC);
         CREATE INDEX IF NOT EXISTS idx_prime_directives_timestamp ON prime_directives(timestamp DESC);",
    )
}

fn chat_session_index(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_ch_session ON ch(session_id, id)",
        [],
    )?;
    Ok(())
}

pub fn applied_versions(conn: &Connection) -> StoreResult<Vec<i64>> {
    let mut stmt = conn
        .prepare("SELECT version FROM schema_versions ORDER BY version ASC")
        .map_err(|e| StoreError::Read {
            table: "schema_versions",
            source: e,
        })?;
    let versions = stmt
        .query_map([], |row| row.get::<_, i64>(0))
        .and_then(|rows| rows.collect::<Result<Vec<_>, _>>())
        .map_err(|e| StoreError::Read {
            table: "schema_versions",
            source: e,
        })?;
    Ok(versions)
}

/// Apply every migration newer than what the database has recorded.
///
/// Each migration commits together with its version row, so a crash between
/// migrations leaves the file at a consistent, recorded version.
pub fn apply_pending(conn: &mut Connection, migrations: &[Migration]) -> StoreResult<Vec<i64>> {
    let applied = applied_versions(conn)?;
    let mut pending: Vec<&Migration> = migrations
        .iter()
        .filter(|m| !applied.contains(&m.version))
        .collect();
    pending.sort_by_key(|m| m.version);

    let mut newly_applied = Vec::with_capacity(pending.len());
    for migration in pending {
        let step = format!("migration v{} ({})", migration.version, migration.name);
        let tx = conn
            .transaction()
            .map_err(|e| StoreError::schema(step.clone(), e))?;
        (migration.apply)(&tx).map_err(|e| StoreError::schema(step.clone(), e))?;
        tx.execute(
            "INSERT INTO schema_versions (version) VALUES (?1)",
            params![migration.version],
        )
        .map_err(|e| StoreError::schema(step.clone(), e))?;
        tx.commit().map_err(|e| StoreError::schema(step, e))?;

        tracing::info!(
            "Applied schema migration v{} ({})",
            migration.version,
            migration.name
        );
        newly_applied.push(migration.version);
    }

    Ok(newly_applied)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute(
            "CREATE TABLE schema_versions (id INTEGER PRIMARY KEY AUTOINCREMENT, version INTEGER UNIQUE, applied_at DATETIME DEFAULT CURRENT_TIMESTAMP)",
            [],
        )
        .unwrap();
        conn.execute(
            "CREATE TABLE migration_hits (id INTEGER PRIMARY KEY, hits INTEGER NOT NULL)",
            [],
        )
        .unwrap();
        conn.execute("INSERT INTO migration_hits (id, hits) VALUES (1, 0)", [])
            .unwrap();
        conn
    }

    fn bump(conn: &Connection) -> rusqlite::Result<()> {
        conn.execute("UPDATE migration_hits SET hits = hits + 1 WHERE id = 1", [])?;
        Ok(())
    }

    fn hits(conn: &Connection) -> i64 {
        conn.query_row("SELECT hits FROM migration_hits WHERE id = 1", [], |row| {
            row.get(0)
        })
        .unwrap()
    }

    #[test]
    fn applies_out_of_order_list_in_version_order_once() {
        let mut conn = setup_conn();
        let migrations = [
            Migration {
                version: 7,
                name: "later",
                apply: bump,
            },
            Migration {
                version: 2,
                name: "earlier",
                apply: bump,
            },
        ];

        let applied = apply_pending(&mut conn, &migrations).unwrap();
        assert_eq!(applied, vec![2, 7]);
        assert_eq!(hits(&conn), 2);

        let again = apply_pending(&mut conn, &migrations).unwrap();
        assert!(again.is_empty());
        assert_eq!(hits(&conn), 2);
        assert_eq!(applied_versions(&conn).unwrap(), vec![2, 7]);
    }

    fn touch_missing_table(conn: &Connection) -> rusqlite::Result<()> {
        conn.execute_batch("UPDATE missing_table SET x = 1")
    }

    #[test]
    fn failed_migration_is_not_recorded() {
        let mut conn = setup_conn();
        let migrations = [Migration {
            version: 1,
            name: "broken",
            apply: touch_missing_table,
        }];

        let err = apply_pending(&mut conn, &migrations).unwrap_err();
        assert!(matches!(err, StoreError::Schema { .. }));
        assert!(err.to_string().contains("migration v1 (broken)"));
        assert!(applied_versions(&conn).unwrap().is_empty());
    }
}
