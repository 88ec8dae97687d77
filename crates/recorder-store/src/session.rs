use chrono::{DateTime, Utc};
use recorder_types::{Event, StateChangedData};
use rusqlite::{Connection, params};
use std::collections::HashMap;

use crate::connection::{DatabaseLocation, open_writer};
use crate::models::{EventRow, StateRow, to_micros};
use crate::StoreResult;

/// Latest row written for an entity, used to link the next one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingState {
    pub state_id: i64,
    pub last_updated: DateTime<Utc>,
}

/// The writable unit of work. Owned by the writer thread only.
///
/// Every recorded payload is kept until the transaction commits so the batch
/// can be replayed after a rollback.
pub struct Session {
    conn: Connection,
    location: DatabaseLocation,
    in_transaction: bool,
    batch: Vec<Event>,
    links: HashMap<String, PendingState>,
    snapshot: Option<HashMap<String, PendingState>>,
    commits_since_expire: u32,
    expire_after_commits: u32,
    #[cfg(test)]
    commit_faults: std::collections::VecDeque<std::os::raw::c_int>,
    #[cfg(test)]
    record_fault: Option<(usize, std::os::raw::c_int)>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("location", &self.location)
            .field("in_transaction", &self.in_transaction)
            .field("pending", &self.batch.len())
            .finish()
    }
}

impl Session {
    pub fn open(location: &DatabaseLocation, expire_after_commits: u32) -> StoreResult<Self> {
        let conn = open_writer(location)?;
        Ok(Self {
            conn,
            location: location.clone(),
            in_transaction: false,
            batch: Vec::new(),
            links: HashMap::new(),
            snapshot: None,
            commits_since_expire: 0,
            expire_after_commits,
            #[cfg(test)]
            commit_faults: Default::default(),
            #[cfg(test)]
            record_fault: None,
        })
    }

    pub fn location(&self) -> &DatabaseLocation {
        &self.location
    }

    pub fn expire_after_commits(&self) -> u32 {
        self.expire_after_commits
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    /// Number of payloads waiting for the next commit.
    pub fn pending(&self) -> usize {
        self.batch.len()
    }

    pub fn link_for(&self, entity_id: &str) -> Option<PendingState> {
        self.links.get(entity_id).copied()
    }

    /// Writes one payload inside its own savepoint. A failing payload is
    /// rolled back alone and the rest of the transaction stays intact.
    pub fn record(&mut self, event: Event) -> StoreResult<()> {
        self.begin()?;
        self.conn.execute_batch("SAVEPOINT payload")?;
        let links_before = if event.is_state_changed() {
            event
                .entity_id()
                .map(|id| (id.to_string(), self.links.get(id).copied()))
        } else {
            None
        };
        match self.apply(&event) {
            Ok(()) => {
                self.conn.execute_batch("RELEASE payload")?;
                self.batch.push(event);
                Ok(())
            }
            Err(err) => {
                self.conn
                    .execute_batch("ROLLBACK TO payload; RELEASE payload")?;
                if let Some((entity_id, previous)) = links_before {
                    match previous {
                        Some(pending) => self.links.insert(entity_id, pending),
                        None => self.links.remove(&entity_id),
                    };
                }
                Err(err)
            }
        }
    }

    fn begin(&mut self) -> StoreResult<()> {
        if self.in_transaction {
            return Ok(());
        }
        self.conn.execute_batch("BEGIN")?;
        self.snapshot = Some(self.links.clone());
        self.in_transaction = true;
        Ok(())
    }

    fn apply(&mut self, event: &Event) -> StoreResult<()> {
        #[cfg(test)]
        if let Some((skip, code)) = self.record_fault.take() {
            if skip == 0 {
                return Err(injected_fault(code));
            }
            self.record_fault = Some((skip - 1, code));
        }
        if !event.is_state_changed() {
            let row = EventRow::from_event(event)?;
            insert_event(&self.conn, &row)?;
            return Ok(());
        }

        let data = StateChangedData::from_event(event)?;
        let mut state = StateRow::from_state_changed(&data, event.time_fired)?;
        let event_id = insert_event(&self.conn, &EventRow::for_state_changed(event))?;
        state.event_id = Some(event_id);
        state.old_state_id = self.links.get(&data.entity_id).map(|p| p.state_id);
        let state_id = insert_state(&self.conn, &state)?;

        if data.new_state.is_some() {
            self.links.insert(
                data.entity_id,
                PendingState {
                    state_id,
                    last_updated: state.last_updated,
                },
            );
        } else {
            self.links.remove(&data.entity_id);
        }
        Ok(())
    }

    /// Commits the open transaction and returns how many payloads it held.
    pub fn commit(&mut self) -> StoreResult<usize> {
        if !self.in_transaction {
            return Ok(0);
        }
        #[cfg(test)]
        if let Some(code) = self.commit_faults.pop_front() {
            return Err(injected_fault(code));
        }
        self.conn.execute_batch("COMMIT")?;
        self.in_transaction = false;
        self.snapshot = None;
        let committed = self.batch.len();
        self.batch.clear();

        self.commits_since_expire += 1;
        if self.expire_after_commits > 0 && self.commits_since_expire >= self.expire_after_commits {
            self.expire();
        }
        Ok(committed)
    }

    /// Rolls back the open transaction. Retained payloads are kept for replay
    /// and the link cache returns to its state at `BEGIN`.
    pub fn rollback(&mut self) -> StoreResult<()> {
        if !self.in_transaction {
            return Ok(());
        }
        self.in_transaction = false;
        if let Some(snapshot) = self.snapshot.take() {
            self.links = snapshot;
        }
        if !self.conn.is_autocommit() {
            self.conn.execute_batch("ROLLBACK")?;
        }
        Ok(())
    }

    /// Rolls back and records every retained payload again in a new
    /// transaction. Payloads that no longer serialize are dropped. Any other
    /// failure stops the replay with the failed payload and everything after
    /// it still retained, so the next replay starts from the full batch.
    pub fn rollback_and_replay(&mut self) -> StoreResult<usize> {
        self.rollback()?;
        let mut remaining = std::mem::take(&mut self.batch).into_iter();
        let mut replayed = 0;
        while let Some(event) = remaining.next() {
            match self.record(event.clone()) {
                Ok(()) => replayed += 1,
                Err(err) if crate::recovery::classify(&err) == crate::ErrorClass::Serialization => {
                    tracing::warn!(error = %err, "dropping payload during replay");
                }
                Err(err) => {
                    self.batch.push(event);
                    self.batch.extend(remaining);
                    return Err(err);
                }
            }
        }
        Ok(replayed)
    }

    /// Rolls back and forgets the retained payloads.
    pub fn discard(&mut self) -> usize {
        if let Err(err) = self.rollback() {
            tracing::warn!(error = %err, "rollback failed while discarding batch");
        }
        let dropped = self.batch.len();
        self.batch.clear();
        dropped
    }

    /// Hands over the uncommitted payloads, leaving the transaction open.
    pub fn take_pending(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.batch)
    }

    /// Releases cached statements and spare capacity.
    pub fn expire(&mut self) {
        self.conn.flush_prepared_statement_cache();
        self.links.shrink_to_fit();
        self.batch.shrink_to_fit();
        self.commits_since_expire = 0;
        tracing::debug!(linked_entities = self.links.len(), "expired session caches");
    }

    /// Drops links to rows that no longer exist.
    pub fn evict_states(&mut self, state_ids: &[i64]) {
        if state_ids.is_empty() {
            return;
        }
        self.links
            .retain(|_, pending| !state_ids.contains(&pending.state_id));
    }

    pub fn forget_entities<'a>(&mut self, entity_ids: impl IntoIterator<Item = &'a String>) {
        for entity_id in entity_ids {
            self.links.remove(entity_id);
        }
    }

    pub fn close(mut self) -> StoreResult<()> {
        if self.in_transaction {
            self.rollback()?;
        }
        self.conn.close().map_err(|(_, err)| err.into())
    }

    /// Makes the next commit fail with `code`. Faults queue up, one per commit.
    #[cfg(test)]
    pub(crate) fn inject_commit_fault(&mut self, code: std::os::raw::c_int) {
        self.commit_faults.push_back(code);
    }

    /// Makes the next recorded payload fail with `code`.
    #[cfg(test)]
    pub(crate) fn inject_record_fault(&mut self, code: std::os::raw::c_int) {
        self.inject_record_fault_after(0, code);
    }

    /// Lets `skip` payloads through, then fails the next one with `code`.
    #[cfg(test)]
    pub(crate) fn inject_record_fault_after(&mut self, skip: usize, code: std::os::raw::c_int) {
        self.record_fault = Some((skip, code));
    }
}

#[cfg(test)]
fn injected_fault(code: std::os::raw::c_int) -> crate::StoreError {
    rusqlite::Error::SqliteFailure(rusqlite::ffi::Error::new(code), None).into()
}

fn insert_event(conn: &Connection, row: &EventRow) -> StoreResult<i64> {
    let mut stmt = conn.prepare_cached(
        "INSERT INTO events (event_type, event_data, origin, time_fired, created,
                             context_id, context_user_id, context_parent_id)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
    )?;
    stmt.execute(params![
        row.event_type,
        row.event_data,
        row.origin.as_str(),
        to_micros(row.time_fired),
        to_micros(Utc::now()),
        row.context_id,
        row.context_user_id,
        row.context_parent_id,
    ])?;
    Ok(conn.last_insert_rowid())
}

fn insert_state(conn: &Connection, row: &StateRow) -> StoreResult<i64> {
    let mut stmt = conn.prepare_cached(
        "INSERT INTO states (domain, entity_id, state, attributes, event_id,
                             last_changed, last_updated, created, old_state_id)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
    )?;
    stmt.execute(params![
        row.domain,
        row.entity_id,
        row.state,
        row.attributes,
        row.event_id,
        to_micros(row.last_changed),
        to_micros(row.last_updated),
        to_micros(Utc::now()),
        row.old_state_id,
    ])?;
    Ok(conn.last_insert_rowid())
}
