use chrono::{DateTime, Datelike, Duration, NaiveTime, Utc, Weekday};
use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::JoinHandle;

use crate::config::RecorderConfig;
use crate::queue::{IngestQueue, PurgeTask, RecorderTask, StatisticsTask};
use crate::statistics::floor_hour;
use crate::StoreResult;

/// Minute past the hour at which hourly statistics are compiled.
const STATISTICS_MINUTE: i64 = 12;
const NIGHTLY_HOUR: u32 = 4;
const NIGHTLY_MINUTE: u32 = 12;

/// Wall-clock schedule for maintenance (UTC).
///
/// - every hour at :12, compile the previous hour
/// - every night at 04:12, purge (repacking on Sundays) or, with auto purge
///   off, run the periodic cleanup
#[derive(Debug, Clone)]
pub struct Schedule {
    auto_purge: bool,
    keep_days: u32,
    next_hourly: DateTime<Utc>,
    next_nightly: DateTime<Utc>,
}

impl Schedule {
    pub fn new(config: &RecorderConfig, now: DateTime<Utc>) -> Self {
        Self {
            auto_purge: config.auto_purge,
            keep_days: config.purge_keep_days,
            next_hourly: next_hourly_after(now),
            next_nightly: next_nightly_after(now),
        }
    }

    /// Tasks that became due at `now`. After a long pause each job fires
    /// once; statistics catch-up covers skipped hours.
    pub fn due(&mut self, now: DateTime<Utc>) -> Vec<RecorderTask> {
        let mut tasks = Vec::new();
        if now >= self.next_hourly {
            tasks.push(RecorderTask::Statistics(StatisticsTask {
                start: floor_hour(now) - Duration::hours(1),
            }));
            self.next_hourly = next_hourly_after(now);
        }
        if now >= self.next_nightly {
            if self.auto_purge {
                tasks.push(RecorderTask::Purge(PurgeTask {
                    purge_before: now - Duration::days(i64::from(self.keep_days)),
                    repack: now.weekday() == Weekday::Sun,
                    apply_filter: false,
                }));
            } else {
                tasks.push(RecorderTask::PeriodicCleanup);
            }
            self.next_nightly = next_nightly_after(now);
        }
        tasks
    }
}

fn next_hourly_after(now: DateTime<Utc>) -> DateTime<Utc> {
    let candidate = floor_hour(now) + Duration::minutes(STATISTICS_MINUTE);
    if candidate > now {
        candidate
    } else {
        candidate + Duration::hours(1)
    }
}

fn next_nightly_after(now: DateTime<Utc>) -> DateTime<Utc> {
    let time = NaiveTime::from_hms_opt(NIGHTLY_HOUR, NIGHTLY_MINUTE, 0).unwrap_or_default();
    let candidate = now.date_naive().and_time(time).and_utc();
    if candidate > now {
        candidate
    } else {
        candidate + Duration::days(1)
    }
}

/// Background thread that feeds the writer with commit ticks and scheduled
/// maintenance, and watches the queue backlog.
#[derive(Debug)]
pub struct Ticker {
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Ticker {
    pub fn spawn(
        queue: Arc<IngestQueue>,
        mut schedule: Schedule,
        interval: std::time::Duration,
    ) -> StoreResult<Self> {
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let handle = std::thread::Builder::new()
            .name("recorder-ticker".to_string())
            .spawn(move || {
                loop {
                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {}
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                    if !queue.enqueue(RecorderTask::CommitTick) {
                        break;
                    }
                    queue.check_backlog();
                    for task in schedule.due(Utc::now()) {
                        tracing::debug!(task = task.kind(), "scheduled task due");
                        queue.enqueue(task);
                    }
                }
                tracing::debug!("ticker stopped");
            })?;
        Ok(Self {
            stop: Some(stop_tx),
            handle: Some(handle),
        })
    }

    pub fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            tracing::error!("ticker thread panicked");
        }
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        self.stop();
    }
}
