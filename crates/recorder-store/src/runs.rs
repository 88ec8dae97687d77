use chrono::{DateTime, Utc};
use rusqlite::{Connection, params};

use crate::models::{RecordingRun, to_micros};
use crate::StoreResult;

/// Tracks the recording run of this process.
///
/// Exactly one run is open while the recorder writes. Runs left open by a
/// previous process are closed with `closed_incorrect` at startup.
#[derive(Debug, Default)]
pub struct RunHistory {
    current: Option<RecordingRun>,
}

impl RunHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<&RecordingRun> {
        self.current.as_ref()
    }

    pub fn start(&mut self, conn: &Connection, now: DateTime<Utc>) -> StoreResult<RecordingRun> {
        let tx = conn.unchecked_transaction()?;
        let closed = tx.execute(
            "UPDATE recording_runs SET \"end\" = ?1, closed_incorrect = 1 WHERE \"end\" IS NULL",
            [to_micros(now)],
        )?;
        if closed > 0 {
            tracing::warn!(closed, "closed recording runs left open by an unclean shutdown");
        }
        tx.execute(
            "INSERT INTO recording_runs (start, \"end\", closed_incorrect, created)
             VALUES (?1, NULL, 0, ?2)",
            params![to_micros(now), to_micros(Utc::now())],
        )?;
        let run_id = tx.last_insert_rowid();
        tx.commit()?;

        let run = load_run(conn, run_id)?;
        tracing::debug!(run_id, "recording run started");
        self.current = Some(run.clone());
        Ok(run)
    }

    pub fn end(&mut self, conn: &Connection, now: DateTime<Utc>) -> StoreResult<()> {
        let Some(run) = self.current.take() else {
            return Ok(());
        };
        conn.execute(
            "UPDATE recording_runs SET \"end\" = ?1 WHERE run_id = ?2",
            params![to_micros(now), run.run_id],
        )?;
        tracing::debug!(run_id = run.run_id, "recording run ended");
        Ok(())
    }

    /// Forgets the open run without touching the database.
    pub fn clear(&mut self) {
        self.current = None;
    }
}

fn load_run(conn: &Connection, run_id: i64) -> StoreResult<RecordingRun> {
    Ok(conn.query_row(
        "SELECT run_id, start, \"end\", closed_incorrect, created
         FROM recording_runs WHERE run_id = ?1",
        [run_id],
        RecordingRun::from_row,
    )?)
}

pub fn load_runs(conn: &Connection) -> StoreResult<Vec<RecordingRun>> {
    let mut stmt = conn.prepare(
        "SELECT run_id, start, \"end\", closed_incorrect, created
         FROM recording_runs ORDER BY start, run_id",
    )?;
    let rows = stmt.query_map([], RecordingRun::from_row)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}
