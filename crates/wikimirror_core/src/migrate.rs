use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use rusqlite::{Connection, params};

use crate::runtime::ResolvedPaths;
use crate::timestamp::unix_now;

struct Migration {
    version: u32,
    name: &'static str,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "mirror",
        sql: include_str!("migrations/v001_mirror.sql"),
    },
    Migration {
        version: 2,
        name: "link_graph",
        sql: include_str!("migrations/v002_link_graph.sql"),
    },
    Migration {
        version: 3,
        name: "indexes",
        sql: include_str!("migrations/v003_indexes.sql"),
    },
];

/// Report returned after running migrations.
#[derive(Debug, Clone)]
pub struct MigrateReport {
    pub applied: Vec<AppliedMigration>,
    pub current_version: u32,
}

#[derive(Debug, Clone)]
pub struct AppliedMigration {
    pub version: u32,
    pub name: String,
}

/// Run all pending migrations against the database at `paths.db_path`.
/// Creates the database and parent directories if they do not exist.
pub fn run_migrations(paths: &ResolvedPaths) -> Result<MigrateReport> {
    ensure_db_parent(&paths.db_path)?;
    let connection = open_connection(&paths.db_path)?;
    migrate_connection(&connection)
}

/// Apply pending migrations on an already-open connection.
pub fn migrate_connection(connection: &Connection) -> Result<MigrateReport> {
    ensure_schema_migrations_table(connection)?;

    let current = current_version(connection)?;
    let mut applied = Vec::new();

    for migration in MIGRATIONS {
        if migration.version <= current {
            continue;
        }
        apply_migration(connection, migration).with_context(|| {
            format!(
                "failed to apply migration v{:03}_{}",
                migration.version, migration.name
            )
        })?;
        tracing::info!(version = migration.version, name = migration.name, "applied migration");
        applied.push(AppliedMigration {
            version: migration.version,
            name: migration.name.to_string(),
        });
    }

    let final_version = current_version(connection)?;
    Ok(MigrateReport {
        applied,
        current_version: final_version,
    })
}

/// Returns the number of migrations that have not yet been applied.
pub fn pending_migration_count(paths: &ResolvedPaths) -> Result<usize> {
    if !paths.db_path.exists() {
        return Ok(MIGRATIONS.len());
    }
    let connection = open_connection(&paths.db_path)?;
    ensure_schema_migrations_table(&connection)?;
    let current = current_version(&connection)?;
    Ok(MIGRATIONS.iter().filter(|m| m.version > current).count())
}

/// Returns the highest applied migration version, or 0 if none applied.
pub fn current_version(connection: &Connection) -> Result<u32> {
    let version: i64 = connection
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )
        .context("failed to read current migration version")?;
    u32::try_from(version).context("migration version does not fit into u32")
}

/// Open the mirror database and fail unless every migration has been applied.
pub fn open_mirror(paths: &ResolvedPaths) -> Result<Connection> {
    if pending_migration_count(paths)? > 0 {
        anyhow::bail!(
            "database at {} has pending migrations.\n{}",
            paths.db_path.display(),
            crate::runtime::MIGRATIONS_POLICY_MESSAGE
        );
    }
    open_connection(&paths.db_path)
}

pub fn open_connection(db_path: &Path) -> Result<Connection> {
    let connection = Connection::open(db_path)
        .with_context(|| format!("failed to open {}", db_path.display()))?;
    connection
        .busy_timeout(Duration::from_secs(5))
        .context("failed to set sqlite busy timeout")?;
    connection
        .pragma_update(None, "foreign_keys", "ON")
        .context("failed to enable foreign_keys pragma")?;
    connection
        .pragma_update(None, "journal_mode", "WAL")
        .context("failed to enable WAL journal mode")?;
    Ok(connection)
}

fn ensure_schema_migrations_table(connection: &Connection) -> Result<()> {
    connection
        .execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                applied_at_unix INTEGER NOT NULL
            );",
        )
        .context("failed to create schema_migrations table")
}

fn apply_migration(connection: &Connection, migration: &Migration) -> Result<()> {
    // Dropping the transaction on error rolls the migration back.
    let transaction = connection
        .unchecked_transaction()
        .context("failed to begin migration transaction")?;
    transaction
        .execute_batch(migration.sql)
        .with_context(|| format!("SQL execution failed for v{:03}", migration.version))?;
    transaction
        .execute(
            "INSERT INTO schema_migrations (version, name, applied_at_unix) VALUES (?1, ?2, ?3)",
            params![i64::from(migration.version), migration.name, unix_now()?],
        )
        .context("failed to record migration")?;
    transaction
        .commit()
        .context("failed to commit migration")
}

fn ensure_db_parent(db_path: &Path) -> Result<()> {
    let parent = db_path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("db path has no parent: {}", db_path.display()))?;
    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create database parent directory {}",
            parent.display()
        )
    })
}

/// Row counts for every mirrored table, in schema order.
pub fn table_row_counts(connection: &Connection) -> Result<Vec<(String, i64)>> {
    let mut statement = connection
        .prepare(
            "SELECT name FROM sqlite_master
             WHERE type = 'table' AND name NOT LIKE 'sqlite_%' AND name != 'schema_migrations'
             ORDER BY rowid",
        )
        .context("failed to list tables")?;
    let names = statement
        .query_map([], |row| row.get::<_, String>(0))
        .context("failed to query table names")?
        .collect::<rusqlite::Result<Vec<_>>>()
        .context("failed to decode table names")?;

    let mut out = Vec::with_capacity(names.len());
    for name in names {
        let count: i64 = connection
            .query_row(&format!("SELECT COUNT(*) FROM \"{name}\""), [], |row| {
                row.get(0)
            })
            .with_context(|| format!("failed to count rows in {name}"))?;
        out.push((name, count));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    fn test_paths() -> (tempfile::TempDir, ResolvedPaths) {
        let temp = tempdir().expect("tempdir");
        let paths = ResolvedPaths::under_root(&temp.path().join("project"));
        (temp, paths)
    }

    #[test]
    fn migrations_apply_on_fresh_db() {
        let (_temp, paths) = test_paths();
        let report = run_migrations(&paths).expect("run_migrations");
        assert_eq!(report.applied.len(), MIGRATIONS.len());
        assert_eq!(report.current_version, 3);
    }

    #[test]
    fn migrations_are_idempotent() {
        let (_temp, paths) = test_paths();
        let first = run_migrations(&paths).expect("first run");
        assert_eq!(first.applied.len(), MIGRATIONS.len());

        let second = run_migrations(&paths).expect("second run");
        assert!(second.applied.is_empty());
        assert_eq!(second.current_version, 3);
    }

    #[test]
    fn pending_count_tracks_state() {
        let (_temp, paths) = test_paths();
        assert_eq!(
            pending_migration_count(&paths).expect("pending count"),
            MIGRATIONS.len()
        );
        assert!(open_mirror(&paths).is_err());

        run_migrations(&paths).expect("run_migrations");
        assert_eq!(pending_migration_count(&paths).expect("pending count"), 0);
        open_mirror(&paths).expect("open migrated mirror");
    }

    #[test]
    fn row_counts_cover_mirror_and_derived_tables() {
        let (_temp, paths) = test_paths();
        run_migrations(&paths).expect("run_migrations");
        let connection = open_connection(&paths.db_path).expect("open");
        let counts = table_row_counts(&connection).expect("counts");
        let names = counts.iter().map(|(name, _)| name.as_str()).collect::<Vec<_>>();
        assert!(names.contains(&"page"));
        assert!(names.contains(&"ws_parser_cache_sync"));
        assert!(!names.contains(&"schema_migrations"));
        assert!(counts.iter().all(|(_, count)| *count == 0));
    }
}
