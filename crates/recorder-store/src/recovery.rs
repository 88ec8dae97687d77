use chrono::Utc;
use rusqlite::ErrorCode;
use std::time::Duration;

use crate::connection::{ReadPool, move_aside};
use crate::migration::migrate;
use crate::notify::{Notification, Notifier};
use crate::runs::RunHistory;
use crate::session::Session;
use crate::{StoreError, StoreResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Busy, locked or temporarily unreachable; retry after a pause.
    Transient,
    /// The file is damaged; the store has to be replaced.
    Corruption,
    /// One payload could not be encoded or decoded.
    Serialization,
    Fatal,
}

pub fn classify(err: &StoreError) -> ErrorClass {
    match err {
        StoreError::Pool(_) => ErrorClass::Transient,
        StoreError::Serialization(_) | StoreError::InvalidPayload(_) => ErrorClass::Serialization,
        StoreError::RetriesExhausted { source, .. } => classify(source),
        StoreError::Database(db) => match db.sqlite_error_code() {
            Some(ErrorCode::DatabaseBusy)
            | Some(ErrorCode::DatabaseLocked)
            | Some(ErrorCode::CannotOpen) => ErrorClass::Transient,
            Some(ErrorCode::DatabaseCorrupt) | Some(ErrorCode::NotADatabase) => {
                ErrorClass::Corruption
            }
            _ => ErrorClass::Fatal,
        },
        StoreError::InvalidConfig(_)
        | StoreError::Migration { .. }
        | StoreError::UnsupportedSchema { .. }
        | StoreError::Io(_)
        | StoreError::NotRunning => ErrorClass::Fatal,
    }
}

/// Retries transient failures with a fixed pause.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub wait: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, wait: Duration) -> Self {
        Self { max_retries, wait }
    }

    /// Runs `op` until it succeeds, fails with a non-transient error, or the
    /// retry budget is spent. `op` receives the zero-based attempt number.
    pub fn run<T>(
        &self,
        label: &str,
        mut op: impl FnMut(u32) -> StoreResult<T>,
    ) -> StoreResult<T> {
        let mut attempt = 0;
        loop {
            match op(attempt) {
                Ok(value) => return Ok(value),
                Err(err) if classify(&err) != ErrorClass::Transient => return Err(err),
                Err(err) if attempt >= self.max_retries => {
                    return Err(StoreError::RetriesExhausted {
                        attempts: attempt + 1,
                        source: Box::new(err),
                    });
                }
                Err(err) => {
                    tracing::warn!(
                        label,
                        attempt = attempt + 1,
                        max_retries = self.max_retries,
                        error = %err,
                        "transient database error, retrying"
                    );
                    std::thread::sleep(self.wait);
                    attempt += 1;
                }
            }
        }
    }
}

/// Replaces a damaged store with a fresh one without restarting the process.
///
/// The broken session is closed, the file moved aside, and a new session is
/// opened and migrated. A new recording run is started and readers are
/// pointed at the new file.
#[tracing::instrument(skip_all)]
pub fn recover_from_corruption(
    session: Session,
    runs: &mut RunHistory,
    read_pool: &ReadPool,
    notifier: &dyn Notifier,
    cause: &StoreError,
) -> StoreResult<Session> {
    tracing::error!(error = %cause, "database corruption detected, starting a new database");
    let location = session.location().clone();
    let expire_after_commits = session.expire_after_commits();
    if let Err(err) = session.close() {
        tracing::warn!(error = %err, "closing the damaged database failed");
    }
    runs.clear();
    read_pool.reset();

    let moved_to = match location.path() {
        Some(path) => Some(move_aside(path)?),
        None => None,
    };

    let session = Session::open(&location, expire_after_commits)?;
    migrate(session.connection())?;
    runs.start(session.connection(), Utc::now())?;

    let moved = moved_to.as_ref().map(|p| p.to_string_lossy().into_owned());
    notifier.notify(Notification::corruption_recovered(moved.as_deref()));
    Ok(session)
}
