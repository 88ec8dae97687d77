use std::sync::Mutex;
use std::sync::mpsc::Sender;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotificationId {
    ConnectionFailed,
    MigrationFailed,
    CorruptionRecovered,
}

impl NotificationId {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationId::ConnectionFailed => "recorder_database_connection_failed",
            NotificationId::MigrationFailed => "recorder_database_migration_failed",
            NotificationId::CorruptionRecovered => "recorder_database_corrupt",
        }
    }
}

/// A persistent, user-visible notice raised by the recorder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub id: NotificationId,
    pub title: String,
    pub message: String,
}

impl Notification {
    pub fn connection_failed(detail: &str) -> Self {
        Self {
            id: NotificationId::ConnectionFailed,
            title: "Recorder database unavailable".to_string(),
            message: format!("The recorder could not connect to its database: {detail}"),
        }
    }

    pub fn migration_failed(detail: &str) -> Self {
        Self {
            id: NotificationId::MigrationFailed,
            title: "Recorder database upgrade failed".to_string(),
            message: format!(
                "The database schema could not be upgraded and recording has stopped: {detail}"
            ),
        }
    }

    pub fn corruption_recovered(moved_to: Option<&str>) -> Self {
        let message = match moved_to {
            Some(path) => format!(
                "The database was damaged and has been moved to {path}. A new database was started."
            ),
            None => "The database was damaged and a new database was started.".to_string(),
        };
        Self {
            id: NotificationId::CorruptionRecovered,
            title: "Recorder database recovered".to_string(),
            message,
        }
    }
}

/// Delivery of persistent notifications to the host.
pub trait Notifier: Send + Sync {
    fn notify(&self, notification: Notification);
}

/// Writes notifications to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, notification: Notification) {
        tracing::warn!(
            id = notification.id.as_str(),
            title = %notification.title,
            "{}",
            notification.message
        );
    }
}

/// Forwards notifications over a channel.
#[derive(Debug)]
pub struct ChannelNotifier {
    tx: Mutex<Sender<Notification>>,
}

impl ChannelNotifier {
    pub fn new(tx: Sender<Notification>) -> Self {
        Self { tx: Mutex::new(tx) }
    }
}

impl Notifier for ChannelNotifier {
    fn notify(&self, notification: Notification) {
        let tx = self.tx.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if tx.send(notification).is_err() {
            tracing::debug!("notification receiver dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn channel_notifier_forwards() {
        let (tx, rx) = mpsc::channel();
        let notifier = ChannelNotifier::new(tx);
        notifier.notify(Notification::migration_failed("disk full"));

        let received = rx.try_recv().unwrap();
        assert_eq!(received.id, NotificationId::MigrationFailed);
        assert!(received.message.contains("disk full"));
    }

    #[test]
    fn closed_channel_is_ignored() {
        let (tx, rx) = mpsc::channel();
        drop(rx);
        ChannelNotifier::new(tx).notify(Notification::connection_failed("refused"));
        LogNotifier.notify(Notification::corruption_recovered(Some("/tmp/x.corrupt")));
    }
}
