//! SQLite-backed history for a home automation event bus.
//!
//! A single writer thread owns the database and drains a task queue. Events
//! are batched into transactions; purge, statistics and repair run on the
//! same thread between batches. Reads go through a pool of read-only
//! connections.

mod config;
mod connection;
mod error;
mod filter;
mod history;
mod migration;
mod models;
mod notify;
mod purge;
mod queue;
mod recorder;
mod recovery;
mod runs;
mod scheduler;
mod session;
mod statistics;
mod worker;

pub use config::{MAX_PURGE_BATCH_SIZE, RecorderConfig};
pub use connection::{DatabaseLocation, ReadPool, move_aside, open_writer, validate_or_move_aside};
pub use error::{StoreError, StoreResult};
pub use filter::{EntityFilter, EntityFilterConfig, FilterRules};
pub use history::{HistoryReader, SIGNIFICANT_DOMAINS, SignificantStatesQuery};
pub use migration::{
    DdlExecutor, MIGRATIONS, Migration, MigrationReport, SCHEMA_VERSION, migrate,
    needs_migration, schema_version,
};
pub use models::{
    EventRow, RecordingRun, StateRow, StatisticMetadata, StatisticRow, StatisticsPeriod,
    StatisticsTable,
};
pub use notify::{ChannelNotifier, LogNotifier, Notification, NotificationId, Notifier};
pub use purge::{
    PurgeFilter, PurgeOutcome, periodic_cleanup, purge_entity_data, purge_old_data, repack,
};
pub use queue::{
    IngestQueue, PurgeEntitiesTask, PurgeTask, RecorderTask, StatisticsTask, TaskReceiver,
};
pub use recorder::Recorder;
pub use recovery::{ErrorClass, RetryPolicy, classify, recover_from_corruption};
pub use runs::{RunHistory, load_runs};
pub use scheduler::{Schedule, Ticker};
pub use session::{PendingState, Session};
pub use statistics::{
    CompileReport, MAX_STATISTICS_CATCH_UP_HOURS, ResetRule, StatisticKind, compile_statistics,
    floor_hour, hours_to_catch_up, statistic_kind,
};
pub use worker::{CommitPolicy, RecorderState};
