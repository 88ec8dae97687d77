use chrono::{DateTime, Utc};
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, params_from_iter};
use std::collections::BTreeSet;

use crate::config::MAX_PURGE_BATCH_SIZE;
use crate::filter::EntityFilter;
use crate::models::to_micros;
use crate::StoreResult;

/// What the age-based purge should also remove once it has caught up.
#[derive(Debug, Clone, Copy)]
pub struct PurgeFilter<'a> {
    pub entity_filter: &'a EntityFilter,
    pub exclude_event_types: &'a [String],
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PurgeOutcome {
    /// False when rows are left and the task should run again.
    pub done: bool,
    pub states_removed: usize,
    pub events_removed: usize,
    pub purged_state_ids: Vec<i64>,
    pub purged_entity_ids: Vec<String>,
}

impl PurgeOutcome {
    fn absorb(&mut self, other: PurgeOutcome) {
        self.states_removed += other.states_removed;
        self.events_removed += other.events_removed;
        self.purged_state_ids.extend(other.purged_state_ids);
        self.purged_entity_ids.extend(other.purged_entity_ids);
    }
}

/// Removes one batch of states and events older than `purge_before`.
///
/// References to deleted rows are nulled before the delete so no
/// `old_state_id` or `event_id` is left dangling.
#[tracing::instrument(skip_all, fields(purge_before = %purge_before))]
pub fn purge_old_data(
    conn: &Connection,
    purge_before: DateTime<Utc>,
    filter: Option<&PurgeFilter<'_>>,
    batch_size: usize,
) -> StoreResult<PurgeOutcome> {
    let batch_size = batch_size.clamp(1, MAX_PURGE_BATCH_SIZE);
    let cutoff = to_micros(purge_before);
    let tx = conn.unchecked_transaction()?;

    let state_ids = select_ids(
        &tx,
        "SELECT state_id FROM states WHERE last_updated < ?1 ORDER BY state_id LIMIT ?2",
        cutoff,
        batch_size,
    )?;
    let event_ids = select_ids(
        &tx,
        "SELECT event_id FROM events WHERE time_fired < ?1 ORDER BY event_id LIMIT ?2",
        cutoff,
        batch_size,
    )?;

    let mut outcome = PurgeOutcome {
        states_removed: delete_states(&tx, &state_ids)?,
        events_removed: delete_events(&tx, &event_ids)?,
        purged_state_ids: state_ids.clone(),
        ..PurgeOutcome::default()
    };

    let aged_out = state_ids.len() < batch_size && event_ids.len() < batch_size;
    if aged_out {
        purge_housekeeping(&tx, cutoff)?;
        outcome.done = true;
        if let Some(filter) = filter {
            let filtered = purge_filtered_data(&tx, filter, batch_size)?;
            outcome.done = filtered.done;
            outcome.absorb(filtered);
        }
    }
    tx.commit()?;

    tracing::info!(
        states = outcome.states_removed,
        events = outcome.events_removed,
        done = outcome.done,
        "purged old recorder data"
    );
    Ok(outcome)
}

/// Closed runs, short-term statistics and statistics runs older than the
/// cutoff. The newest statistics run is always kept.
fn purge_housekeeping(conn: &Connection, cutoff: i64) -> StoreResult<()> {
    let runs = conn.execute(
        "DELETE FROM recording_runs WHERE \"end\" IS NOT NULL AND \"end\" < ?1",
        [cutoff],
    )?;
    let short_term = conn.execute(
        "DELETE FROM statistics_short_term WHERE start < ?1",
        [cutoff],
    )?;
    let statistics_runs = conn.execute(
        "DELETE FROM statistics_runs WHERE start < ?1
         AND run_id NOT IN (SELECT run_id FROM statistics_runs ORDER BY start DESC LIMIT 1)",
        [cutoff],
    )?;
    tracing::debug!(runs, short_term, statistics_runs, "purged housekeeping rows");
    Ok(())
}

/// Rows of entities the filter now excludes, and events of excluded types.
fn purge_filtered_data(
    conn: &Connection,
    filter: &PurgeFilter<'_>,
    batch_size: usize,
) -> StoreResult<PurgeOutcome> {
    let excluded: Vec<String> = distinct_entity_ids(conn)?
        .into_iter()
        .filter(|entity_id| !filter.entity_filter.matches(entity_id))
        .collect();
    let mut outcome = delete_entity_batch(conn, &excluded, batch_size)?;

    if !filter.exclude_event_types.is_empty() {
        let types: Vec<SqlValue> = filter
            .exclude_event_types
            .iter()
            .map(|t| SqlValue::Text(t.clone()))
            .collect();
        let sql = format!(
            "SELECT event_id FROM events WHERE event_type IN ({}) ORDER BY event_id LIMIT {}",
            placeholders(types.len()),
            batch_size
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(types), |row| row.get::<_, i64>(0))?;
        let event_ids = rows.collect::<Result<Vec<_>, _>>()?;
        outcome.events_removed += delete_events(conn, &event_ids)?;
        outcome.done = outcome.done && event_ids.len() < batch_size;
    }
    Ok(outcome)
}

/// Removes every row of the entities selected by `filter`, one batch per call.
#[tracing::instrument(skip_all)]
pub fn purge_entity_data(
    conn: &Connection,
    filter: &EntityFilter,
    batch_size: usize,
) -> StoreResult<PurgeOutcome> {
    let batch_size = batch_size.clamp(1, MAX_PURGE_BATCH_SIZE);
    let tx = conn.unchecked_transaction()?;
    let selected: Vec<String> = distinct_entity_ids(&tx)?
        .into_iter()
        .filter(|entity_id| filter.matches(entity_id))
        .collect();
    let outcome = delete_entity_batch(&tx, &selected, batch_size)?;
    tx.commit()?;

    tracing::info!(
        entities = selected.len(),
        states = outcome.states_removed,
        events = outcome.events_removed,
        done = outcome.done,
        "purged entity data"
    );
    Ok(outcome)
}

fn delete_entity_batch(
    conn: &Connection,
    entity_ids: &[String],
    batch_size: usize,
) -> StoreResult<PurgeOutcome> {
    let mut state_ids = Vec::new();
    let mut event_ids = BTreeSet::new();
    for chunk in entity_ids.chunks(MAX_PURGE_BATCH_SIZE) {
        let remaining = batch_size - state_ids.len();
        if remaining == 0 {
            break;
        }
        let sql = format!(
            "SELECT state_id, event_id FROM states WHERE entity_id IN ({})
             ORDER BY state_id LIMIT {remaining}",
            placeholders(chunk.len())
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(chunk.iter()), |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, Option<i64>>(1)?))
        })?;
        for row in rows {
            let (state_id, event_id) = row?;
            state_ids.push(state_id);
            if let Some(event_id) = event_id {
                event_ids.insert(event_id);
            }
        }
    }

    let states_removed = delete_states(conn, &state_ids)?;
    let event_ids: Vec<i64> = event_ids.into_iter().collect();
    let events_removed = delete_events(conn, &event_ids)?;
    let done = state_ids.len() < batch_size;
    Ok(PurgeOutcome {
        done,
        states_removed,
        events_removed,
        purged_state_ids: state_ids,
        purged_entity_ids: entity_ids.to_vec(),
    })
}

fn distinct_entity_ids(conn: &Connection) -> StoreResult<Vec<String>> {
    let mut stmt = conn.prepare("SELECT DISTINCT entity_id FROM states")?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

fn select_ids(conn: &Connection, sql: &str, cutoff: i64, limit: usize) -> StoreResult<Vec<i64>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(rusqlite::params![cutoff, limit as i64], |row| row.get(0))?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

fn delete_states(conn: &Connection, state_ids: &[i64]) -> StoreResult<usize> {
    let mut removed = 0;
    for chunk in state_ids.chunks(MAX_PURGE_BATCH_SIZE) {
        let list = placeholders(chunk.len());
        conn.execute(
            &format!("UPDATE states SET old_state_id = NULL WHERE old_state_id IN ({list})"),
            params_from_iter(chunk.iter()),
        )?;
        removed += conn.execute(
            &format!("DELETE FROM states WHERE state_id IN ({list})"),
            params_from_iter(chunk.iter()),
        )?;
    }
    Ok(removed)
}

fn delete_events(conn: &Connection, event_ids: &[i64]) -> StoreResult<usize> {
    let mut removed = 0;
    for chunk in event_ids.chunks(MAX_PURGE_BATCH_SIZE) {
        let list = placeholders(chunk.len());
        conn.execute(
            &format!("UPDATE states SET event_id = NULL WHERE event_id IN ({list})"),
            params_from_iter(chunk.iter()),
        )?;
        removed += conn.execute(
            &format!("DELETE FROM events WHERE event_id IN ({list})"),
            params_from_iter(chunk.iter()),
        )?;
    }
    Ok(removed)
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

/// Rebuilds the file to return freed pages to the filesystem. Must run
/// outside a transaction.
#[tracing::instrument(skip_all)]
pub fn repack(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch("VACUUM;")?;
    conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")?;
    tracing::info!("database repacked");
    Ok(())
}

pub fn periodic_cleanup(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch(
        "PRAGMA wal_checkpoint(TRUNCATE);
         PRAGMA optimize;",
    )?;
    tracing::debug!("periodic cleanup completed");
    Ok(())
}
