use thiserror::Error;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("schema migration to version {version} failed: {message}")]
    Migration { version: i64, message: String },

    #[error("database schema version {found} is newer than supported {supported}")]
    UnsupportedSchema { found: i64, supported: i64 },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("recorder is not running")]
    NotRunning,

    #[error("giving up after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: Box<StoreError>,
    },
}

impl StoreError {
    pub fn migration(version: i64, message: impl Into<String>) -> Self {
        Self::Migration {
            version,
            message: message.into(),
        }
    }

    /// The underlying SQLite error, looking through retry wrappers.
    pub fn sqlite(&self) -> Option<&rusqlite::Error> {
        match self {
            StoreError::Database(err) => Some(err),
            StoreError::RetriesExhausted { source, .. } => source.sqlite(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_context() {
        let err = StoreError::migration(4, "index already broken");
        assert!(err.to_string().contains("version 4"));
        assert!(err.to_string().contains("index already broken"));

        let err = StoreError::UnsupportedSchema {
            found: 9,
            supported: 6,
        };
        assert!(err.to_string().contains('9'));
    }

    #[test]
    fn sqlite_error_is_found_through_retries() {
        let inner = StoreError::Database(rusqlite::Error::QueryReturnedNoRows);
        let err = StoreError::RetriesExhausted {
            attempts: 3,
            source: Box::new(inner),
        };
        assert!(matches!(
            err.sqlite(),
            Some(rusqlite::Error::QueryReturnedNoRows)
        ));
        assert!(StoreError::NotRunning.sqlite().is_none());
    }
}
