use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};

use crate::models::to_micros;
use crate::{StoreError, StoreResult};

pub const SCHEMA_VERSION: i64 = 6;

/// The DDL capability a migration step is allowed to use.
pub trait DdlExecutor {
    fn execute_ddl(&mut self, sql: &str) -> StoreResult<()>;
    fn table_exists(&mut self, table: &str) -> StoreResult<bool>;
    fn column_exists(&mut self, table: &str, column: &str) -> StoreResult<bool>;
}

pub struct SqliteDdl<'a> {
    conn: &'a Connection,
    operations: usize,
}

impl<'a> SqliteDdl<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self {
            conn,
            operations: 0,
        }
    }

    pub fn operations(&self) -> usize {
        self.operations
    }
}

impl DdlExecutor for SqliteDdl<'_> {
    fn execute_ddl(&mut self, sql: &str) -> StoreResult<()> {
        self.conn.execute_batch(sql)?;
        self.operations += 1;
        Ok(())
    }

    fn table_exists(&mut self, table: &str) -> StoreResult<bool> {
        table_exists(self.conn, table)
    }

    fn column_exists(&mut self, table: &str, column: &str) -> StoreResult<bool> {
        let mut stmt = self
            .conn
            .prepare("SELECT 1 FROM pragma_table_info(?1) WHERE name = ?2")?;
        Ok(stmt.exists(params![table, column])?)
    }
}

pub struct Migration {
    pub version: i64,
    pub description: &'static str,
    pub apply: fn(&mut dyn DdlExecutor) -> StoreResult<()>,
}

impl std::fmt::Debug for Migration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Migration")
            .field("version", &self.version)
            .field("description", &self.description)
            .finish()
    }
}

pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "events, states and recording runs",
        apply: baseline,
    },
    Migration {
        version: 2,
        description: "event context columns",
        apply: event_context,
    },
    Migration {
        version: 3,
        description: "link states to the previous state",
        apply: old_state_link,
    },
    Migration {
        version: 4,
        description: "time and entity indexes",
        apply: time_indexes,
    },
    Migration {
        version: 5,
        description: "statistics tables",
        apply: statistics_tables,
    },
    Migration {
        version: 6,
        description: "statistics last_reset",
        apply: statistics_last_reset,
    },
];

fn baseline(ddl: &mut dyn DdlExecutor) -> StoreResult<()> {
    ddl.execute_ddl(
        "CREATE TABLE IF NOT EXISTS events (
            event_id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_type TEXT NOT NULL,
            event_data TEXT NOT NULL,
            origin TEXT NOT NULL,
            time_fired INTEGER NOT NULL,
            created INTEGER NOT NULL
        )",
    )?;
    ddl.execute_ddl(
        "CREATE TABLE IF NOT EXISTS states (
            state_id INTEGER PRIMARY KEY AUTOINCREMENT,
            domain TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            state TEXT NOT NULL,
            attributes TEXT NOT NULL,
            event_id INTEGER REFERENCES events(event_id),
            last_changed INTEGER NOT NULL,
            last_updated INTEGER NOT NULL,
            created INTEGER NOT NULL
        )",
    )?;
    ddl.execute_ddl(
        "CREATE TABLE IF NOT EXISTS recording_runs (
            run_id INTEGER PRIMARY KEY AUTOINCREMENT,
            start INTEGER NOT NULL,
            \"end\" INTEGER,
            closed_incorrect INTEGER NOT NULL DEFAULT 0,
            created INTEGER NOT NULL
        )",
    )?;
    Ok(())
}

fn event_context(ddl: &mut dyn DdlExecutor) -> StoreResult<()> {
    add_columns(
        ddl,
        "events",
        &[
            ("context_id", "TEXT"),
            ("context_user_id", "TEXT"),
            ("context_parent_id", "TEXT"),
        ],
    )?;
    create_index(ddl, "ix_events_context_id", "events", "context_id")
}

fn old_state_link(ddl: &mut dyn DdlExecutor) -> StoreResult<()> {
    add_columns(
        ddl,
        "states",
        &[("old_state_id", "INTEGER REFERENCES states(state_id)")],
    )?;
    create_index(ddl, "ix_states_old_state_id", "states", "old_state_id")
}

fn time_indexes(ddl: &mut dyn DdlExecutor) -> StoreResult<()> {
    create_index(ddl, "ix_events_time_fired", "events", "time_fired")?;
    create_index(ddl, "ix_events_event_type_time_fired", "events", "event_type, time_fired")?;
    create_index(ddl, "ix_states_last_updated", "states", "last_updated")?;
    create_index(ddl, "ix_states_entity_id_last_updated", "states", "entity_id, last_updated")?;
    create_index(ddl, "ix_states_event_id", "states", "event_id")?;
    create_index(ddl, "ix_recording_runs_start_end", "recording_runs", "start, \"end\"")
}

fn statistics_tables(ddl: &mut dyn DdlExecutor) -> StoreResult<()> {
    ddl.execute_ddl(
        "CREATE TABLE IF NOT EXISTS statistics_meta (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            statistic_id TEXT NOT NULL UNIQUE,
            source TEXT NOT NULL,
            unit_of_measurement TEXT,
            has_mean INTEGER NOT NULL DEFAULT 0,
            has_sum INTEGER NOT NULL DEFAULT 0
        )",
    )?;
    for table in ["statistics_short_term", "statistics_long_term"] {
        ddl.execute_ddl(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                statistic_id TEXT NOT NULL,
                start INTEGER NOT NULL,
                mean REAL,
                min REAL,
                max REAL,
                sum REAL,
                state REAL,
                created INTEGER NOT NULL
            )"
        ))?;
        ddl.execute_ddl(&format!(
            "CREATE UNIQUE INDEX IF NOT EXISTS ix_{table}_statistic_id_start
             ON {table} (statistic_id, start)"
        ))?;
        create_index(ddl, &format!("ix_{table}_start"), table, "start")?;
    }
    ddl.execute_ddl(
        "CREATE TABLE IF NOT EXISTS statistics_runs (
            run_id INTEGER PRIMARY KEY AUTOINCREMENT,
            start INTEGER NOT NULL
        )",
    )?;
    create_index(ddl, "ix_statistics_runs_start", "statistics_runs", "start")
}

fn statistics_last_reset(ddl: &mut dyn DdlExecutor) -> StoreResult<()> {
    add_columns(ddl, "statistics_short_term", &[("last_reset", "INTEGER")])?;
    add_columns(ddl, "statistics_long_term", &[("last_reset", "INTEGER")])
}

/// Adds each column the table does not have yet.
fn add_columns(
    ddl: &mut dyn DdlExecutor,
    table: &str,
    columns: &[(&str, &str)],
) -> StoreResult<()> {
    for (column, definition) in columns {
        if ddl.column_exists(table, column)? {
            continue;
        }
        ddl.execute_ddl(&format!("ALTER TABLE {table} ADD COLUMN {column} {definition}"))?;
    }
    Ok(())
}

fn create_index(
    ddl: &mut dyn DdlExecutor,
    name: &str,
    table: &str,
    columns: &str,
) -> StoreResult<()> {
    ddl.execute_ddl(&format!(
        "CREATE INDEX IF NOT EXISTS {name} ON {table} ({columns})"
    ))
}

fn table_exists(conn: &Connection, table: &str) -> StoreResult<bool> {
    let mut stmt = conn.prepare("SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1")?;
    Ok(stmt.exists([table])?)
}

/// Version recorded in `schema_changes`. A database without audit rows is
/// version 1 if it already has the baseline tables and 0 when it is fresh.
pub fn schema_version(conn: &Connection) -> StoreResult<i64> {
    if table_exists(conn, "schema_changes")? {
        let version: Option<i64> = conn
            .query_row("SELECT MAX(schema_version) FROM schema_changes", [], |row| {
                row.get(0)
            })
            .optional()?
            .flatten();
        if let Some(version) = version {
            return Ok(version);
        }
    }
    if table_exists(conn, "events")? {
        Ok(1)
    } else {
        Ok(0)
    }
}

pub fn pending_migrations(current: i64) -> impl Iterator<Item = &'static Migration> {
    MIGRATIONS.iter().filter(move |m| m.version > current)
}

pub fn needs_migration(conn: &Connection) -> StoreResult<bool> {
    let current = schema_version(conn)?;
    check_supported(current)?;
    Ok(current < SCHEMA_VERSION)
}

fn check_supported(version: i64) -> StoreResult<()> {
    if version > SCHEMA_VERSION {
        return Err(StoreError::UnsupportedSchema {
            found: version,
            supported: SCHEMA_VERSION,
        });
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MigrationReport {
    pub from_version: i64,
    pub to_version: i64,
    pub ddl_operations: usize,
}

/// Brings the schema to [`SCHEMA_VERSION`]. Each step commits on its own, so
/// an interrupted run resumes at the first unrecorded step.
#[tracing::instrument(skip_all)]
pub fn migrate(conn: &Connection) -> StoreResult<MigrationReport> {
    let from_version = schema_version(conn)?;
    check_supported(from_version)?;

    let mut ddl_operations = 0;
    let mut current = from_version;
    for migration in pending_migrations(from_version) {
        tracing::info!(
            version = migration.version,
            description = migration.description,
            "applying schema migration"
        );
        ddl_operations += apply_step(conn, migration)
            .map_err(|err| StoreError::migration(migration.version, err.to_string()))?;
        current = migration.version;
    }

    if current != from_version {
        tracing::info!(from_version, to_version = current, "schema upgraded");
    }
    Ok(MigrationReport {
        from_version,
        to_version: current,
        ddl_operations,
    })
}

fn apply_step(conn: &Connection, migration: &Migration) -> StoreResult<usize> {
    let tx = conn.unchecked_transaction()?;
    let mut ddl = SqliteDdl::new(&tx);
    ddl.execute_ddl(
        "CREATE TABLE IF NOT EXISTS schema_changes (
            change_id INTEGER PRIMARY KEY AUTOINCREMENT,
            schema_version INTEGER NOT NULL,
            changed INTEGER NOT NULL
        )",
    )?;
    (migration.apply)(&mut ddl)?;
    let operations = ddl.operations();
    tx.execute(
        "INSERT INTO schema_changes (schema_version, changed) VALUES (?1, ?2)",
        params![migration.version, to_micros(Utc::now())],
    )?;
    tx.commit()?;
    Ok(operations)
}
