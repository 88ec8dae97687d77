use chrono::Utc;
use recorder_types::Event;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::mpsc::Receiver;
use std::thread::JoinHandle;

use crate::config::RecorderConfig;
use crate::connection::{DatabaseLocation, ReadPool, validate_or_move_aside};
use crate::filter::EntityFilter;
use crate::migration::{SCHEMA_VERSION, migrate, schema_version};
use crate::notify::{Notification, Notifier};
use crate::purge::{self, PurgeFilter, PurgeOutcome};
use crate::queue::{
    IngestQueue, PurgeEntitiesTask, PurgeTask, RecorderTask, StatisticsTask, TaskReceiver,
};
use crate::recovery::{ErrorClass, RetryPolicy, classify, recover_from_corruption};
use crate::runs::RunHistory;
use crate::session::Session;
use crate::{StoreError, StoreResult, statistics};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecorderState {
    Init = 0,
    Connecting = 1,
    Migrating = 2,
    SchemaCurrent = 3,
    Ready = 4,
    Degraded = 5,
    Draining = 6,
    Stopped = 7,
}

impl RecorderState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => RecorderState::Init,
            1 => RecorderState::Connecting,
            2 => RecorderState::Migrating,
            3 => RecorderState::SchemaCurrent,
            4 => RecorderState::Ready,
            5 => RecorderState::Degraded,
            6 => RecorderState::Draining,
            _ => RecorderState::Stopped,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RecorderState::Init => "init",
            RecorderState::Connecting => "connecting",
            RecorderState::Migrating => "migrating",
            RecorderState::SchemaCurrent => "schema_current",
            RecorderState::Ready => "ready",
            RecorderState::Degraded => "degraded",
            RecorderState::Draining => "draining",
            RecorderState::Stopped => "stopped",
        }
    }
}

/// Lifecycle state readable from any thread, written by the worker.
#[derive(Debug)]
pub struct SharedState(AtomicU8);

impl SharedState {
    pub fn new() -> Self {
        Self(AtomicU8::new(RecorderState::Init as u8))
    }

    pub fn get(&self) -> RecorderState {
        RecorderState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn set(&self, state: RecorderState) {
        let previous = RecorderState::from_u8(self.0.swap(state as u8, Ordering::AcqRel));
        if previous != state {
            tracing::debug!(from = previous.as_str(), to = state.as_str(), "recorder state");
        }
    }
}

impl Default for SharedState {
    fn default() -> Self {
        Self::new()
    }
}

/// When to commit the open transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitPolicy {
    interval: u32,
    ticks_seen: u32,
}

impl CommitPolicy {
    pub fn new(interval: u32) -> Self {
        Self {
            interval,
            ticks_seen: 0,
        }
    }

    pub fn commit_after_event(&self) -> bool {
        self.interval == 0
    }

    pub fn on_tick(&mut self) -> bool {
        if self.interval == 0 {
            return false;
        }
        self.ticks_seen += 1;
        if self.ticks_seen >= self.interval {
            self.ticks_seen = 0;
            return true;
        }
        false
    }

    pub fn reset(&mut self) {
        self.ticks_seen = 0;
    }
}

/// Everything the writer thread shares with the `Recorder` handle.
pub(crate) struct WorkerContext {
    pub config: RecorderConfig,
    pub location: DatabaseLocation,
    pub queue: Arc<IngestQueue>,
    pub state: Arc<SharedState>,
    pub read_pool: Arc<ReadPool>,
    pub notifier: Arc<dyn Notifier>,
    pub final_write: Arc<AtomicBool>,
    pub startup_gate: Receiver<()>,
}

/// The single writer. Owns the only writable connection and drains the
/// task queue in order.
pub(crate) struct Worker {
    ctx: WorkerContext,
    rx: TaskReceiver,
    session: Option<Session>,
    runs: RunHistory,
    commit_policy: CommitPolicy,
    retry: RetryPolicy,
    entity_filter: EntityFilter,
    halted: bool,
}

impl Worker {
    pub fn spawn(
        ctx: WorkerContext,
        rx: TaskReceiver,
        entity_filter: EntityFilter,
    ) -> StoreResult<JoinHandle<()>> {
        let worker = Worker {
            commit_policy: CommitPolicy::new(ctx.config.commit_interval),
            retry: RetryPolicy::new(ctx.config.db_max_retries, ctx.config.retry_wait()),
            ctx,
            rx,
            session: None,
            runs: RunHistory::new(),
            entity_filter,
            halted: false,
        };
        let handle = std::thread::Builder::new()
            .name("recorder-writer".to_string())
            .spawn(move || worker.run())?;
        Ok(handle)
    }

    fn run(mut self) {
        tracing::info!("recorder writer started");
        if self.setup() {
            self.ctx.state.set(RecorderState::Ready);
            self.process();
            self.finish();
        }
        // close the channel before reporting Stopped
        let state = Arc::clone(&self.ctx.state);
        drop(self);
        state.set(RecorderState::Stopped);
        tracing::info!("recorder writer stopped");
    }

    /// Connects, migrates and opens the recording run. Returns false when the
    /// writer cannot continue.
    fn setup(&mut self) -> bool {
        let state = Arc::clone(&self.ctx.state);
        state.set(RecorderState::Connecting);

        if let Some(path) = self.ctx.location.path() {
            match validate_or_move_aside(path) {
                Ok(Some(moved)) => {
                    let moved = moved.to_string_lossy().into_owned();
                    self.ctx
                        .notifier
                        .notify(Notification::corruption_recovered(Some(&moved)));
                }
                Ok(None) => {}
                Err(err) => tracing::warn!(error = %err, "could not validate existing database"),
            }
        }

        let location = self.ctx.location.clone();
        let expire = self.ctx.config.expire_after_commits;
        let session = match self.retry.run("connect", |_| {
            let session = Session::open(&location, expire)?;
            let version = schema_version(session.connection())?;
            Ok((session, version))
        }) {
            Ok(opened) => opened,
            Err(err) => {
                tracing::error!(error = %err, "could not connect to the recorder database");
                self.ctx
                    .notifier
                    .notify(Notification::connection_failed(&err.to_string()));
                return false;
            }
        };
        let (session, version) = session;

        if version < SCHEMA_VERSION {
            if self.ctx.config.wait_for_startup {
                tracing::info!(version, "schema upgrade pending, waiting for startup to finish");
                let _ = self.ctx.startup_gate.recv();
            }
            state.set(RecorderState::Migrating);
        } else {
            state.set(RecorderState::SchemaCurrent);
        }
        if let Err(err) = migrate(session.connection()) {
            tracing::error!(error = %err, "schema migration failed, recorder stopping");
            self.ctx
                .notifier
                .notify(Notification::migration_failed(&err.to_string()));
            if let Err(err) = session.close() {
                tracing::warn!(error = %err, "closing database after failed migration");
            }
            return false;
        }

        if let Err(err) = self.runs.start(session.connection(), Utc::now()) {
            tracing::error!(error = %err, "could not start recording run");
            return false;
        }
        match statistics::hours_to_catch_up(session.connection(), Utc::now()) {
            Ok(hours) => {
                if !hours.is_empty() {
                    tracing::info!(hours = hours.len(), "catching up on missed statistics");
                }
                for start in hours {
                    self.ctx
                        .queue
                        .enqueue(RecorderTask::Statistics(StatisticsTask { start }));
                }
            }
            Err(err) => tracing::warn!(error = %err, "could not plan statistics catch-up"),
        }
        self.ctx.read_pool.reset();
        self.session = Some(session);
        true
    }

    fn process(&mut self) {
        while !self.halted {
            if self.ctx.final_write.load(Ordering::Acquire) {
                let dropped = self.rx.drain();
                tracing::warn!(dropped, "shutdown timed out, dropping queued tasks");
                break;
            }
            let Some(task) = self.rx.recv() else {
                break;
            };
            match task {
                RecorderTask::Event(event) => {
                    self.record(event);
                    if self.commit_policy.commit_after_event() {
                        self.commit();
                    }
                }
                RecorderTask::CommitTick => {
                    if self.commit_policy.on_tick() {
                        self.commit();
                    }
                }
                RecorderTask::Barrier(done) => {
                    self.commit();
                    let _ = done.send(());
                }
                RecorderTask::Purge(task) => self.purge(task),
                RecorderTask::PurgeEntities(task) => self.purge_entities(task),
                RecorderTask::Statistics(task) => {
                    self.maintenance("statistics", |conn| {
                        statistics::compile_statistics(conn, task.start)
                    });
                }
                RecorderTask::PeriodicCleanup => {
                    self.maintenance("periodic_cleanup", purge::periodic_cleanup);
                }
                RecorderTask::Shutdown => break,
                #[cfg(test)]
                RecorderTask::InjectFault(code) => {
                    if let Some(session) = self.session.as_mut() {
                        session.inject_commit_fault(code);
                    }
                }
                #[cfg(test)]
                RecorderTask::InjectRecordFault(code) => {
                    if let Some(session) = self.session.as_mut() {
                        session.inject_record_fault(code);
                    }
                }
            }
        }
    }

    fn finish(&mut self) {
        self.ctx.state.set(RecorderState::Draining);
        self.commit();
        let Some(session) = self.session.take() else {
            return;
        };
        if let Err(err) = self.runs.end(session.connection(), Utc::now()) {
            tracing::warn!(error = %err, "could not close recording run");
        }
        if let Err(err) = session.close() {
            tracing::warn!(error = %err, "closing recorder database failed");
        }
    }

    fn record(&mut self, event: Event) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let retry = self.retry;
        let result = retry.run("record", |_| session.record(event.clone()));
        let Err(err) = result else {
            return;
        };
        match classify(&err) {
            ErrorClass::Serialization => {
                tracing::warn!(event_type = %event.event_type, error = %err, "dropping event that could not be stored");
            }
            ErrorClass::Corruption => {
                self.recover(err);
                // the failed payload never reached the batch
                if self.session.is_some() {
                    self.record(event);
                }
            }
            ErrorClass::Transient | ErrorClass::Fatal => {
                tracing::error!(event_type = %event.event_type, error = %err, "failed to record event");
            }
        }
    }

    fn commit(&mut self) {
        self.commit_policy.reset();
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if !session.in_transaction() {
            return;
        }
        let retry = self.retry;
        let result = retry.run("commit", |attempt| {
            if attempt > 0 {
                session.rollback_and_replay()?;
            }
            session.commit()
        });
        match result {
            Ok(committed) => {
                tracing::trace!(committed, "committed batch");
                if self.ctx.state.get() == RecorderState::Degraded {
                    tracing::info!("database writes recovered");
                    self.ctx.state.set(RecorderState::Ready);
                }
            }
            Err(err) if classify(&err) == ErrorClass::Corruption => self.recover(err),
            Err(err) => {
                let dropped = session.discard();
                tracing::error!(dropped, error = %err, "commit failed, discarding batch");
                self.ctx.state.set(RecorderState::Degraded);
            }
        }
    }

    /// Runs a maintenance job in its own transaction after flushing pending
    /// events.
    fn maintenance<T>(
        &mut self,
        label: &str,
        mut job: impl FnMut(&rusqlite::Connection) -> StoreResult<T>,
    ) -> Option<T> {
        self.commit();
        let session = self.session.as_ref()?;
        let retry = self.retry;
        match retry.run(label, |_| job(session.connection())) {
            Ok(value) => Some(value),
            Err(err) if classify(&err) == ErrorClass::Corruption => {
                self.recover(err);
                None
            }
            Err(err) => {
                tracing::error!(task = label, error = %err, "maintenance task failed");
                None
            }
        }
    }

    fn purge(&mut self, task: PurgeTask) {
        let batch_size = self.ctx.config.purge_batch_size;
        let exclude_event_types = self.ctx.config.exclude_event_types.clone();
        let entity_filter = self.entity_filter.clone();
        let apply_filter = task.apply_filter;
        let outcome = self.maintenance("purge", |conn| {
            let filter = PurgeFilter {
                entity_filter: &entity_filter,
                exclude_event_types: &exclude_event_types,
            };
            purge::purge_old_data(
                conn,
                task.purge_before,
                apply_filter.then_some(&filter),
                batch_size,
            )
        });
        let Some(outcome) = outcome else {
            return;
        };
        self.evict(&outcome);
        if !outcome.done {
            self.ctx.queue.enqueue(RecorderTask::Purge(task));
            return;
        }
        if task.repack {
            self.maintenance("repack", purge::repack);
        }
        self.ctx.queue.enqueue(RecorderTask::PeriodicCleanup);
    }

    fn purge_entities(&mut self, task: PurgeEntitiesTask) {
        let batch_size = self.ctx.config.purge_batch_size;
        let outcome = self.maintenance("purge_entities", |conn| {
            purge::purge_entity_data(conn, &task.filter, batch_size)
        });
        let Some(outcome) = outcome else {
            return;
        };
        self.evict(&outcome);
        if !outcome.done {
            self.ctx.queue.enqueue(RecorderTask::PurgeEntities(task));
        }
    }

    fn evict(&mut self, outcome: &PurgeOutcome) {
        if let Some(session) = self.session.as_mut() {
            session.evict_states(&outcome.purged_state_ids);
            if outcome.done {
                session.forget_entities(&outcome.purged_entity_ids);
            }
        }
    }

    fn recover(&mut self, cause: StoreError) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        let pending = session.take_pending();
        match recover_from_corruption(
            session,
            &mut self.runs,
            &self.ctx.read_pool,
            self.ctx.notifier.as_ref(),
            &cause,
        ) {
            Ok(fresh) => {
                self.session = Some(fresh);
                self.ctx.state.set(RecorderState::Ready);
                let replayed = pending.len();
                for event in pending {
                    self.record(event);
                }
                self.commit();
                tracing::info!(replayed, "recorder continuing on a new database");
            }
            Err(err) => {
                tracing::error!(error = %err, "could not replace damaged database, recorder stopping");
                self.halted = true;
            }
        }
    }
}
