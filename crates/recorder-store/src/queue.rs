use chrono::{DateTime, Utc};
use recorder_types::Event;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::time::Duration;

use crate::filter::EntityFilter;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PurgeTask {
    /// Fixed when the task is created so re-enqueued batches share it.
    pub purge_before: DateTime<Utc>,
    pub repack: bool,
    pub apply_filter: bool,
}

#[derive(Debug, Clone)]
pub struct PurgeEntitiesTask {
    pub filter: EntityFilter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatisticsTask {
    /// Start of the hour to compile.
    pub start: DateTime<Utc>,
}

/// Everything the writer thread can be asked to do.
#[derive(Debug)]
pub enum RecorderTask {
    Event(Event),
    Purge(PurgeTask),
    PurgeEntities(PurgeEntitiesTask),
    Statistics(StatisticsTask),
    PeriodicCleanup,
    CommitTick,
    /// Commit, then signal the sender.
    Barrier(Sender<()>),
    Shutdown,
    /// Fails the next commit with the given SQLite code.
    #[cfg(test)]
    InjectFault(std::os::raw::c_int),
    /// Fails the next recorded payload with the given SQLite code.
    #[cfg(test)]
    InjectRecordFault(std::os::raw::c_int),
}

impl RecorderTask {
    pub fn kind(&self) -> &'static str {
        match self {
            RecorderTask::Event(_) => "event",
            RecorderTask::Purge(_) => "purge",
            RecorderTask::PurgeEntities(_) => "purge_entities",
            RecorderTask::Statistics(_) => "statistics",
            RecorderTask::PeriodicCleanup => "periodic_cleanup",
            RecorderTask::CommitTick => "commit_tick",
            RecorderTask::Barrier(_) => "barrier",
            RecorderTask::Shutdown => "shutdown",
            #[cfg(test)]
            RecorderTask::InjectFault(_) => "inject_fault",
            #[cfg(test)]
            RecorderTask::InjectRecordFault(_) => "inject_record_fault",
        }
    }
}

/// Unbounded task channel with a depth gauge and a detach switch.
///
/// Sending never blocks. Once the depth passes `max_backlog` the queue
/// stops accepting events until the recorder is restarted; other tasks are
/// still accepted.
#[derive(Debug)]
pub struct IngestQueue {
    tx: Sender<RecorderTask>,
    depth: Arc<AtomicUsize>,
    detached: AtomicBool,
    max_backlog: usize,
}

/// Receiving half, owned by the writer.
#[derive(Debug)]
pub struct TaskReceiver {
    rx: Receiver<RecorderTask>,
    depth: Arc<AtomicUsize>,
}

impl IngestQueue {
    pub fn new(max_backlog: usize) -> (Self, TaskReceiver) {
        let (tx, rx) = mpsc::channel();
        let depth = Arc::new(AtomicUsize::new(0));
        (
            Self {
                tx,
                depth: Arc::clone(&depth),
                detached: AtomicBool::new(false),
                max_backlog,
            },
            TaskReceiver { rx, depth },
        )
    }

    /// Queues any task. Returns `false` once the writer has gone away.
    pub fn enqueue(&self, task: RecorderTask) -> bool {
        self.depth.fetch_add(1, Ordering::AcqRel);
        match self.tx.send(task) {
            Ok(()) => true,
            Err(_) => {
                self.depth.fetch_sub(1, Ordering::AcqRel);
                false
            }
        }
    }

    /// Queues an event unless ingestion has been detached.
    pub fn ingest(&self, event: Event) -> bool {
        if self.is_detached() {
            return false;
        }
        self.enqueue(RecorderTask::Event(event))
    }

    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Acquire)
    }

    pub fn max_backlog(&self) -> usize {
        self.max_backlog
    }

    pub fn is_detached(&self) -> bool {
        self.detached.load(Ordering::Acquire)
    }

    /// Detaches ingestion when the backlog is over the limit. Returns whether
    /// the queue is detached afterwards.
    pub fn check_backlog(&self) -> bool {
        if self.is_detached() {
            return true;
        }
        let depth = self.depth();
        if depth <= self.max_backlog {
            return false;
        }
        if !self.detached.swap(true, Ordering::AcqRel) {
            tracing::error!(
                depth,
                max_backlog = self.max_backlog,
                "recorder queue backlog exceeded, no longer recording events"
            );
        }
        true
    }
}

impl TaskReceiver {
    pub fn recv(&self) -> Option<RecorderTask> {
        let task = self.rx.recv().ok()?;
        self.depth.fetch_sub(1, Ordering::AcqRel);
        Some(task)
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<RecorderTask, RecvTimeoutError> {
        let task = self.rx.recv_timeout(timeout)?;
        self.depth.fetch_sub(1, Ordering::AcqRel);
        Ok(task)
    }

    pub fn try_recv(&self) -> Result<RecorderTask, TryRecvError> {
        let task = self.rx.try_recv()?;
        self.depth.fetch_sub(1, Ordering::AcqRel);
        Ok(task)
    }

    /// Empties the channel without processing anything. Barriers are still
    /// released so waiters do not hang. Returns the number of dropped tasks.
    pub fn drain(&self) -> usize {
        let mut dropped = 0;
        while let Ok(task) = self.try_recv() {
            if let RecorderTask::Barrier(done) = task {
                let _ = done.send(());
            } else {
                dropped += 1;
            }
        }
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(n: u32) -> Event {
        Event::new("test_event", json!({ "n": n }))
    }

    #[test]
    fn depth_follows_send_and_receive() {
        let (queue, rx) = IngestQueue::new(100);
        assert!(queue.ingest(event(1)));
        assert!(queue.enqueue(RecorderTask::CommitTick));
        assert_eq!(queue.depth(), 2);

        assert!(matches!(rx.recv(), Some(RecorderTask::Event(_))));
        assert_eq!(queue.depth(), 1);
        assert!(matches!(rx.try_recv(), Ok(RecorderTask::CommitTick)));
        assert_eq!(queue.depth(), 0);
    }

    #[test]
    fn backlog_over_ceiling_detaches_ingest() {
        let (queue, _rx) = IngestQueue::new(10);
        for n in 0..10 {
            assert!(queue.ingest(event(n)));
        }
        assert!(!queue.check_backlog());

        assert!(queue.ingest(event(10)));
        assert!(queue.check_backlog());
        assert!(queue.is_detached());
        assert!(!queue.ingest(event(11)));
        assert_eq!(queue.depth(), 11);

        // maintenance still gets through
        assert!(queue.enqueue(RecorderTask::PeriodicCleanup));
    }

    #[test]
    fn closed_receiver_rejects() {
        let (queue, rx) = IngestQueue::new(10);
        drop(rx);
        assert!(!queue.ingest(event(1)));
        assert_eq!(queue.depth(), 0);
    }

    #[test]
    fn drain_releases_barriers() {
        let (queue, rx) = IngestQueue::new(10);
        let (done_tx, done_rx) = mpsc::channel();
        queue.ingest(event(1));
        queue.enqueue(RecorderTask::Barrier(done_tx));
        queue.ingest(event(2));

        assert_eq!(rx.drain(), 2);
        assert_eq!(queue.depth(), 0);
        assert!(done_rx.try_recv().is_ok());
    }
}
