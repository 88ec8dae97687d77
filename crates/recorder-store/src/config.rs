use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::connection::DatabaseLocation;
use crate::filter::{EntityFilter, EntityFilterConfig};
use crate::{StoreError, StoreResult};

/// Largest number of bound ids SQLite accepts in one statement on old builds.
pub const MAX_PURGE_BATCH_SIZE: usize = 998;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecorderConfig {
    pub db_url: String,
    pub auto_purge: bool,
    pub purge_keep_days: u32,
    /// Number of scheduler ticks between commits. Zero commits every event.
    pub commit_interval: u32,
    pub db_max_retries: u32,
    pub db_retry_wait_ms: u64,
    pub max_queue_backlog: usize,
    pub expire_after_commits: u32,
    pub purge_batch_size: usize,
    pub tick_interval_ms: u64,
    /// Hold pending migrations until the host reports startup complete.
    pub wait_for_startup: bool,
    pub shutdown_timeout_ms: u64,
    pub filter: EntityFilterConfig,
    pub exclude_event_types: Vec<String>,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            db_url: "sqlite:///recorder.db".to_string(),
            auto_purge: true,
            purge_keep_days: 10,
            commit_interval: 1,
            db_max_retries: 10,
            db_retry_wait_ms: 3000,
            max_queue_backlog: 30_000,
            expire_after_commits: 120,
            purge_batch_size: MAX_PURGE_BATCH_SIZE,
            tick_interval_ms: 1000,
            wait_for_startup: false,
            shutdown_timeout_ms: 30_000,
            filter: EntityFilterConfig::default(),
            exclude_event_types: Vec::new(),
        }
    }
}

impl RecorderConfig {
    pub fn in_memory() -> Self {
        Self {
            db_url: "sqlite://".to_string(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> StoreResult<()> {
        DatabaseLocation::parse(&self.db_url)?;
        if self.purge_keep_days < 1 {
            return Err(StoreError::InvalidConfig(
                "purge_keep_days must be at least 1".to_string(),
            ));
        }
        if self.purge_batch_size == 0 || self.purge_batch_size > MAX_PURGE_BATCH_SIZE {
            return Err(StoreError::InvalidConfig(format!(
                "purge_batch_size must be between 1 and {MAX_PURGE_BATCH_SIZE}"
            )));
        }
        if self.max_queue_backlog < 1 {
            return Err(StoreError::InvalidConfig(
                "max_queue_backlog must be at least 1".to_string(),
            ));
        }
        if self.tick_interval_ms < 1 {
            return Err(StoreError::InvalidConfig(
                "tick_interval_ms must be at least 1".to_string(),
            ));
        }
        EntityFilter::new(&self.filter)?;
        Ok(())
    }

    pub fn location(&self) -> StoreResult<DatabaseLocation> {
        DatabaseLocation::parse(&self.db_url)
    }

    pub fn retry_wait(&self) -> Duration {
        Duration::from_millis(self.db_retry_wait_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}
