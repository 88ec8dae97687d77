use chrono::{DateTime, Duration as ChronoDuration, Utc};
use recorder_types::Event;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::config::RecorderConfig;
use crate::connection::ReadPool;
use crate::filter::EntityFilter;
use crate::history::HistoryReader;
use crate::notify::Notifier;
use crate::queue::{IngestQueue, PurgeEntitiesTask, PurgeTask, RecorderTask, StatisticsTask};
use crate::scheduler::{Schedule, Ticker};
use crate::statistics::floor_hour;
use crate::worker::{RecorderState, SharedState, Worker, WorkerContext};
use crate::StoreResult;

const SHUTDOWN_POLL: Duration = Duration::from_millis(10);

/// Handle to a running recorder. Cheap to clone; the writer stops when the
/// last handle is dropped or `shutdown` is called.
#[derive(Clone)]
pub struct Recorder {
    inner: Arc<RecorderInner>,
}

struct RecorderInner {
    config: RecorderConfig,
    queue: Arc<IngestQueue>,
    state: Arc<SharedState>,
    read_pool: Arc<ReadPool>,
    entity_filter: EntityFilter,
    exclude_event_types: HashSet<String>,
    enabled: AtomicBool,
    stopping: AtomicBool,
    final_write: Arc<AtomicBool>,
    startup_gate: Mutex<Option<Sender<()>>>,
    ticker: Mutex<Option<Ticker>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Recorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Recorder")
            .field("db_url", &self.inner.config.db_url)
            .field("state", &self.inner.state.get())
            .field("queue_depth", &self.inner.queue.depth())
            .finish()
    }
}

impl Recorder {
    /// Validates `config` and starts the writer and ticker threads. Connecting
    /// and migrating happen on the writer; events recorded meanwhile queue up.
    pub fn start(config: RecorderConfig, notifier: Arc<dyn Notifier>) -> StoreResult<Self> {
        config.validate()?;
        let location = config.location()?;
        let entity_filter = EntityFilter::new(&config.filter)?;

        let (queue, rx) = IngestQueue::new(config.max_queue_backlog);
        let queue = Arc::new(queue);
        let state = Arc::new(SharedState::new());
        let read_pool = Arc::new(ReadPool::new(location.clone()));
        let final_write = Arc::new(AtomicBool::new(false));
        let (gate_tx, gate_rx) = mpsc::channel();

        let worker = Worker::spawn(
            WorkerContext {
                config: config.clone(),
                location,
                queue: Arc::clone(&queue),
                state: Arc::clone(&state),
                read_pool: Arc::clone(&read_pool),
                notifier,
                final_write: Arc::clone(&final_write),
                startup_gate: gate_rx,
            },
            rx,
            entity_filter.clone(),
        )?;
        let ticker = match Ticker::spawn(
            Arc::clone(&queue),
            Schedule::new(&config, Utc::now()),
            config.tick_interval(),
        ) {
            Ok(ticker) => ticker,
            Err(err) => {
                queue.enqueue(RecorderTask::Shutdown);
                drop(gate_tx);
                let _ = worker.join();
                return Err(err);
            }
        };

        tracing::info!(db_url = %config.db_url, "recorder started");
        Ok(Self {
            inner: Arc::new(RecorderInner {
                exclude_event_types: config.exclude_event_types.iter().cloned().collect(),
                config,
                queue,
                state,
                read_pool,
                entity_filter,
                enabled: AtomicBool::new(true),
                stopping: AtomicBool::new(false),
                final_write,
                startup_gate: Mutex::new(Some(gate_tx)),
                ticker: Mutex::new(Some(ticker)),
                worker: Mutex::new(Some(worker)),
            }),
        })
    }

    /// Queues an event for recording. Returns `false` when the event is
    /// filtered out or the recorder cannot take it.
    pub fn record_event(&self, event: Event) -> bool {
        let inner = &self.inner;
        if !inner.enabled.load(Ordering::Acquire) {
            return false;
        }
        if inner.queue.is_detached() {
            return false;
        }
        if inner.exclude_event_types.contains(&event.event_type) {
            return false;
        }
        if event.is_state_changed()
            && let Some(entity_id) = event.entity_id()
            && !inner.entity_filter.matches(entity_id)
        {
            return false;
        }
        inner.queue.ingest(event)
    }

    /// Queues any task without filtering.
    pub fn enqueue(&self, task: RecorderTask) -> bool {
        self.inner.queue.enqueue(task)
    }

    /// Removes history older than `keep_days`. The cutoff is fixed now, so
    /// every batch of this purge uses the same one.
    pub fn purge(&self, keep_days: u32, repack: bool, apply_filter: bool) -> bool {
        let purge_before = Utc::now() - ChronoDuration::days(i64::from(keep_days));
        self.enqueue(RecorderTask::Purge(PurgeTask {
            purge_before,
            repack,
            apply_filter,
        }))
    }

    /// Removes all history of the selected entities.
    pub fn purge_entities(
        &self,
        entity_ids: &[String],
        domains: &[String],
        entity_globs: &[String],
    ) -> bool {
        let filter = match EntityFilter::include_only(entity_ids, domains, entity_globs) {
            Ok(filter) => filter,
            Err(err) => {
                tracing::warn!(error = %err, "invalid entity selection for purge");
                return false;
            }
        };
        if filter.is_empty() {
            tracing::warn!("purge_entities called without any entity selection");
            return false;
        }
        self.enqueue(RecorderTask::PurgeEntities(PurgeEntitiesTask { filter }))
    }

    /// Compiles statistics for the hour containing `start`.
    pub fn compile_statistics(&self, start: DateTime<Utc>) -> bool {
        self.enqueue(RecorderTask::Statistics(StatisticsTask {
            start: floor_hour(start),
        }))
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::Release);
        tracing::info!(enabled, "recording toggled");
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::Acquire)
    }

    pub fn state(&self) -> RecorderState {
        self.inner.state.get()
    }

    /// Lets a migration held back by `wait_for_startup` proceed.
    pub fn notify_startup_complete(&self) {
        self.inner.release_startup();
    }

    /// Waits until everything queued so far is committed and the queue has
    /// been seen empty. Returns `false` if the writer is gone.
    pub fn block_till_done(&self) -> bool {
        loop {
            let (done_tx, done_rx) = mpsc::channel();
            if !self.enqueue(RecorderTask::Barrier(done_tx)) {
                return false;
            }
            if done_rx.recv().is_err() {
                return false;
            }
            if self.inner.queue.depth() == 0 {
                return true;
            }
        }
    }

    pub fn history(&self) -> HistoryReader {
        HistoryReader::new(Arc::clone(&self.inner.read_pool))
    }

    pub fn queue_depth(&self) -> usize {
        self.inner.queue.depth()
    }

    pub fn is_ingest_detached(&self) -> bool {
        self.inner.queue.is_detached()
    }

    pub fn config(&self) -> &RecorderConfig {
        &self.inner.config
    }

    /// Stops the recorder: commits what was queued within
    /// `shutdown_timeout`, drops the rest, closes the run and the database.
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }
}

impl RecorderInner {
    fn release_startup(&self) {
        let gate = self
            .startup_gate
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(gate) = gate {
            let _ = gate.send(());
        }
    }

    fn shutdown(&self) {
        if self.stopping.swap(true, Ordering::AcqRel) {
            return;
        }
        self.release_startup();
        let ticker = self
            .ticker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut ticker) = ticker {
            ticker.stop();
        }

        self.queue.enqueue(RecorderTask::Shutdown);
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(worker) = worker else {
            return;
        };

        let deadline = Instant::now() + self.config.shutdown_timeout();
        while !worker.is_finished() && Instant::now() < deadline {
            std::thread::sleep(SHUTDOWN_POLL);
        }
        if !worker.is_finished() {
            tracing::warn!(
                pending = self.queue.depth(),
                "recorder did not finish in time, dropping queued work"
            );
            self.final_write.store(true, Ordering::Release);
            self.queue.enqueue(RecorderTask::Shutdown);
        }
        if worker.join().is_err() {
            tracing::error!("recorder writer panicked");
        }
        tracing::info!("recorder shut down");
    }
}

impl Drop for RecorderInner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::DatabaseLocation;
    use crate::filter::{EntityFilterConfig, FilterRules};
    use crate::history::SignificantStatesQuery;
    use crate::migration::migrate;
    use crate::notify::{ChannelNotifier, LogNotifier, Notification, NotificationId};
    use crate::runs::RunHistory;
    use crate::session::Session;
    use recorder_types::State;
    use rusqlite::Connection;
    use serde_json::json;
    use std::path::Path;
    use std::sync::mpsc::Receiver;
    use tempfile::tempdir;

    fn file_config(dir: &Path) -> RecorderConfig {
        RecorderConfig {
            db_url: format!("sqlite:///{}", dir.join("home.db").display()),
            tick_interval_ms: 20,
            db_retry_wait_ms: 10,
            shutdown_timeout_ms: 5_000,
            ..RecorderConfig::default()
        }
    }

    fn start_with_channel(config: RecorderConfig) -> (Recorder, Receiver<Notification>) {
        let (tx, rx) = mpsc::channel();
        let recorder = Recorder::start(config, Arc::new(ChannelNotifier::new(tx))).unwrap();
        (recorder, rx)
    }

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        condition()
    }

    fn count(recorder: &Recorder, sql: &str) -> i64 {
        recorder
            .history()
            .with_connection(|conn| Ok(conn.query_row(sql, [], |row| row.get(0))?))
            .unwrap()
    }

    fn state_event(entity_id: &str, value: &str, at: DateTime<Utc>) -> Event {
        Event::state_changed(entity_id, None, Some(State::new(entity_id, value).at(at)))
    }

    #[test]
    fn commit_every_event_is_visible_after_barrier() {
        let dir = tempdir().unwrap();
        let config = RecorderConfig {
            commit_interval: 0,
            tick_interval_ms: 60_000,
            ..file_config(dir.path())
        };
        let recorder = Recorder::start(config, Arc::new(LogNotifier)).unwrap();

        let t0 = Utc::now() - ChronoDuration::minutes(10);
        for (i, value) in ["1", "2", "3"].iter().enumerate() {
            let at = t0 + ChronoDuration::minutes(i as i64);
            assert!(recorder.record_event(state_event("sensor.power", value, at)));
        }
        assert!(recorder.block_till_done());
        assert_eq!(recorder.state(), RecorderState::Ready);

        assert_eq!(count(&recorder, "SELECT COUNT(*) FROM states"), 3);
        assert_eq!(
            count(&recorder, "SELECT COUNT(DISTINCT event_id) FROM states"),
            3
        );
        let chained = count(
            &recorder,
            "SELECT COUNT(*) FROM states s JOIN states p ON p.state_id = s.old_state_id
             WHERE p.entity_id = s.entity_id AND p.last_updated <= s.last_updated",
        );
        assert_eq!(chained, 2);

        let states = recorder
            .history()
            .get_significant_states(&SignificantStatesQuery::since(t0 - ChronoDuration::minutes(1)))
            .unwrap();
        assert_eq!(states["sensor.power"].len(), 3);
        recorder.shutdown();
    }

    #[test]
    fn backlog_over_limit_detaches_ingestion() {
        let dir = tempdir().unwrap();
        let config = RecorderConfig {
            wait_for_startup: true,
            max_queue_backlog: 10,
            ..file_config(dir.path())
        };
        let recorder = Recorder::start(config, Arc::new(LogNotifier)).unwrap();

        for n in 0..11 {
            assert!(recorder.record_event(Event::new("test_event", json!({ "n": n }))));
        }
        assert!(wait_until(|| recorder.is_ingest_detached()));
        assert!(!recorder.record_event(Event::new("test_event", json!({ "n": 11 }))));
        // administrative tasks still go through
        assert!(recorder.purge(10, false, false));

        recorder.notify_startup_complete();
        assert!(recorder.block_till_done());
        assert_eq!(
            count(&recorder, "SELECT COUNT(*) FROM events WHERE event_type = 'test_event'"),
            11
        );
        recorder.shutdown();
    }

    #[test]
    fn corruption_on_commit_switches_to_fresh_database() {
        let dir = tempdir().unwrap();
        let config = RecorderConfig {
            commit_interval: 1_000,
            ..file_config(dir.path())
        };
        let (recorder, notifications) = start_with_channel(config);
        let now = Utc::now();

        assert!(recorder.enqueue(RecorderTask::InjectFault(rusqlite::ffi::SQLITE_CORRUPT)));
        assert!(recorder.record_event(state_event("sensor.a", "1", now)));
        assert!(recorder.block_till_done());

        let notification = notifications
            .recv_timeout(Duration::from_secs(5))
            .unwrap();
        assert_eq!(notification.id, NotificationId::CorruptionRecovered);
        let moved_aside = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(Result::ok)
            .any(|entry| entry.file_name().to_string_lossy().contains(".corrupt."));
        assert!(moved_aside);

        assert!(recorder.record_event(state_event("sensor.a", "2", now + ChronoDuration::seconds(1))));
        assert!(recorder.block_till_done());
        let states = recorder
            .history()
            .get_significant_states(&SignificantStatesQuery::since(now - ChronoDuration::minutes(1)))
            .unwrap();
        let values: Vec<&str> = states["sensor.a"].iter().map(|s| s.state.as_str()).collect();
        assert_eq!(values, vec!["1", "2"]);
        assert_eq!(recorder.state(), RecorderState::Ready);
        recorder.shutdown();
    }

    #[test]
    fn corruption_while_recording_keeps_the_event() {
        let dir = tempdir().unwrap();
        let config = RecorderConfig {
            commit_interval: 1_000,
            ..file_config(dir.path())
        };
        let (recorder, notifications) = start_with_channel(config);
        let now = Utc::now();

        assert!(recorder.record_event(state_event("sensor.a", "1", now)));
        assert!(recorder.enqueue(RecorderTask::InjectRecordFault(rusqlite::ffi::SQLITE_CORRUPT)));
        assert!(recorder.record_event(state_event("sensor.a", "2", now + ChronoDuration::seconds(1))));
        assert!(recorder.block_till_done());

        let notification = notifications
            .recv_timeout(Duration::from_secs(5))
            .unwrap();
        assert_eq!(notification.id, NotificationId::CorruptionRecovered);

        let states = recorder
            .history()
            .get_significant_states(&SignificantStatesQuery::since(now - ChronoDuration::minutes(1)))
            .unwrap();
        let values: Vec<&str> = states["sensor.a"].iter().map(|s| s.state.as_str()).collect();
        assert_eq!(values, vec!["1", "2"]);
        assert_eq!(recorder.state(), RecorderState::Ready);
        recorder.shutdown();
    }

    #[test]
    fn busy_commit_is_retried_with_the_whole_batch() {
        let dir = tempdir().unwrap();
        let config = RecorderConfig {
            commit_interval: 1_000,
            db_max_retries: 3,
            ..file_config(dir.path())
        };
        let recorder = Recorder::start(config, Arc::new(LogNotifier)).unwrap();
        let now = Utc::now();

        assert!(recorder.enqueue(RecorderTask::InjectFault(rusqlite::ffi::SQLITE_BUSY)));
        assert!(recorder.enqueue(RecorderTask::InjectFault(rusqlite::ffi::SQLITE_LOCKED)));
        for (i, value) in ["1", "2", "3"].iter().enumerate() {
            let at = now + ChronoDuration::seconds(i as i64);
            assert!(recorder.record_event(state_event("sensor.power", value, at)));
        }
        assert!(recorder.block_till_done());

        assert_eq!(count(&recorder, "SELECT COUNT(*) FROM states"), 3);
        let chained = count(
            &recorder,
            "SELECT COUNT(*) FROM states s JOIN states p ON p.state_id = s.old_state_id",
        );
        assert_eq!(chained, 2);
        assert_eq!(recorder.state(), RecorderState::Ready);
        recorder.shutdown();
    }

    #[test]
    fn exhausted_retries_degrade_until_the_next_good_commit() {
        let dir = tempdir().unwrap();
        let config = RecorderConfig {
            commit_interval: 1_000,
            db_max_retries: 2,
            ..file_config(dir.path())
        };
        let recorder = Recorder::start(config, Arc::new(LogNotifier)).unwrap();
        let now = Utc::now();

        // one initial attempt plus two retries
        for _ in 0..3 {
            assert!(recorder.enqueue(RecorderTask::InjectFault(rusqlite::ffi::SQLITE_BUSY)));
        }
        assert!(recorder.record_event(state_event("sensor.lost", "1", now)));
        assert!(recorder.record_event(state_event("sensor.lost", "2", now)));
        assert!(recorder.block_till_done());
        assert_eq!(recorder.state(), RecorderState::Degraded);
        assert_eq!(count(&recorder, "SELECT COUNT(*) FROM states"), 0);

        assert!(recorder.record_event(state_event("sensor.kept", "1", now)));
        assert!(recorder.block_till_done());
        assert_eq!(recorder.state(), RecorderState::Ready);
        assert_eq!(
            count(&recorder, "SELECT COUNT(*) FROM states WHERE entity_id = 'sensor.kept'"),
            1
        );
        assert_eq!(
            count(&recorder, "SELECT COUNT(*) FROM states WHERE entity_id = 'sensor.lost'"),
            0
        );
        recorder.shutdown();
    }

    #[test]
    fn unclean_shutdown_is_marked_on_next_start() {
        let dir = tempdir().unwrap();
        let config = file_config(dir.path());
        {
            let location = config.location().unwrap();
            let session = Session::open(&location, 10).unwrap();
            migrate(session.connection()).unwrap();
            RunHistory::new()
                .start(session.connection(), Utc::now() - ChronoDuration::hours(1))
                .unwrap();
            session.close().unwrap();
        }

        let recorder = Recorder::start(config, Arc::new(LogNotifier)).unwrap();
        assert!(recorder.block_till_done());
        let runs = recorder.history().recording_runs().unwrap();
        assert_eq!(runs.len(), 2);
        assert!(runs[0].closed_incorrect);
        assert!(runs[0].end.is_some());
        assert!(runs[1].is_open());

        recorder.shutdown();
        let conn = Connection::open(dir.path().join("home.db")).unwrap();
        let open: i64 = conn
            .query_row("SELECT COUNT(*) FROM recording_runs WHERE \"end\" IS NULL", [], |r| r.get(0))
            .unwrap();
        assert_eq!(open, 0);
    }

    #[test]
    fn filters_and_excluded_event_types() {
        let dir = tempdir().unwrap();
        let config = RecorderConfig {
            commit_interval: 0,
            exclude_event_types: vec!["call_service".to_string()],
            filter: EntityFilterConfig {
                include: FilterRules::default(),
                exclude: FilterRules {
                    domains: vec!["light".to_string()],
                    entity_globs: vec!["sensor.*_rssi".to_string()],
                    ..FilterRules::default()
                },
            },
            ..file_config(dir.path())
        };
        let recorder = Recorder::start(config, Arc::new(LogNotifier)).unwrap();
        let now = Utc::now();

        assert!(!recorder.record_event(state_event("light.kitchen", "on", now)));
        assert!(!recorder.record_event(state_event("sensor.phone_rssi", "-60", now)));
        assert!(!recorder.record_event(Event::new("call_service", json!({ "domain": "light" }))));
        assert!(recorder.record_event(state_event("sensor.temperature", "21.5", now)));
        assert!(recorder.record_event(Event::new("automation_triggered", json!({}))));

        recorder.set_enabled(false);
        assert!(!recorder.record_event(state_event("sensor.temperature", "22", now)));
        recorder.set_enabled(true);

        assert!(recorder.block_till_done());
        assert_eq!(count(&recorder, "SELECT COUNT(*) FROM states"), 1);
        assert_eq!(
            count(&recorder, "SELECT COUNT(*) FROM events WHERE event_type = 'call_service'"),
            0
        );
        recorder.shutdown();
    }

    #[test]
    fn failed_migration_stops_the_writer() {
        let dir = tempdir().unwrap();
        let config = file_config(dir.path());
        {
            let conn = Connection::open(dir.path().join("home.db")).unwrap();
            conn.execute_batch(
                "CREATE TABLE schema_changes (change_id INTEGER PRIMARY KEY, schema_version INTEGER, changed INTEGER);
                 INSERT INTO schema_changes (schema_version, changed) VALUES (99, 0);",
            )
            .unwrap();
        }

        let (recorder, notifications) = start_with_channel(config);
        let notification = notifications
            .recv_timeout(Duration::from_secs(5))
            .unwrap();
        assert_eq!(notification.id, NotificationId::MigrationFailed);
        assert!(wait_until(|| recorder.state() == RecorderState::Stopped));

        assert!(!recorder.record_event(Event::new("test_event", json!({}))));
        assert!(!recorder.purge(10, false, false));
        assert!(!recorder.block_till_done());
        recorder.shutdown();
    }

    #[test]
    fn purge_through_the_queue() {
        let dir = tempdir().unwrap();
        let config = RecorderConfig {
            commit_interval: 0,
            purge_batch_size: 2,
            ..file_config(dir.path())
        };
        let recorder = Recorder::start(config, Arc::new(LogNotifier)).unwrap();
        let now = Utc::now();
        for days in [30, 20, 15] {
            let at = now - ChronoDuration::days(days);
            assert!(recorder.record_event(state_event("sensor.old", &days.to_string(), at)));
        }
        assert!(recorder.record_event(state_event("sensor.old", "0", now)));
        assert!(recorder.record_event(state_event("switch.pump", "on", now)));
        assert!(recorder.block_till_done());

        assert!(recorder.purge(10, false, false));
        assert!(recorder.block_till_done());
        assert_eq!(count(&recorder, "SELECT COUNT(*) FROM states"), 2);
        assert_eq!(
            count(
                &recorder,
                "SELECT COUNT(*) FROM states WHERE old_state_id IS NOT NULL
                 AND old_state_id NOT IN (SELECT state_id FROM states)"
            ),
            0
        );

        assert!(recorder.purge_entities(&[], &["switch".to_string()], &[]));
        assert!(!recorder.purge_entities(&[], &[], &[]));
        assert!(recorder.block_till_done());
        assert_eq!(count(&recorder, "SELECT COUNT(*) FROM states"), 1);

        // the chain continues from the surviving row
        assert!(recorder.record_event(state_event("sensor.old", "1", now + ChronoDuration::seconds(1))));
        assert!(recorder.block_till_done());
        assert_eq!(
            count(
                &recorder,
                "SELECT COUNT(*) FROM states WHERE old_state_id IS NOT NULL
                 AND old_state_id NOT IN (SELECT state_id FROM states)"
            ),
            0
        );
        recorder.shutdown();
    }

    #[test]
    fn in_memory_recorder_and_repeated_shutdown() {
        let config = RecorderConfig {
            commit_interval: 0,
            tick_interval_ms: 20,
            ..RecorderConfig::in_memory()
        };
        assert!(DatabaseLocation::parse(&config.db_url).unwrap().is_memory());
        let recorder = Recorder::start(config, Arc::new(LogNotifier)).unwrap();
        assert!(recorder.record_event(state_event("sensor.a", "1", Utc::now())));
        assert!(recorder.block_till_done());
        assert_eq!(count(&recorder, "SELECT COUNT(*) FROM states"), 1);

        recorder.shutdown();
        recorder.shutdown();
        assert_eq!(recorder.state(), RecorderState::Stopped);
        assert!(!recorder.record_event(state_event("sensor.a", "2", Utc::now())));
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = RecorderConfig {
            db_url: "postgres://localhost/recorder".to_string(),
            ..RecorderConfig::default()
        };
        assert!(Recorder::start(config, Arc::new(LogNotifier)).is_err());
    }
}
