use chrono::Utc;
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, ErrorCode, OpenFlags};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::{StoreError, StoreResult};

const BUSY_TIMEOUT: Duration = Duration::from_secs(15);
const POOL_CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);
const MIN_POOL_SIZE: u32 = 2;
const MAX_POOL_SIZE: u32 = 16;

static MEMORY_DATABASES: AtomicUsize = AtomicUsize::new(0);

/// Where the store lives, parsed from a `sqlite://` URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatabaseLocation {
    File(PathBuf),
    /// Shared-cache in-memory database; the name is unique per process.
    Memory(String),
}

impl DatabaseLocation {
    /// Accepted forms:
    /// - `sqlite://` and `sqlite:///:memory:` for an in-memory database
    /// - `sqlite:///relative/path.db`
    /// - `sqlite:////absolute/path.db`
    pub fn parse(url: &str) -> StoreResult<Self> {
        let rest = url.strip_prefix("sqlite://").ok_or_else(|| {
            StoreError::InvalidConfig(format!("unsupported database url: {url}"))
        })?;
        if rest.is_empty() || rest == ":memory:" || rest == "/:memory:" {
            let n = MEMORY_DATABASES.fetch_add(1, Ordering::Relaxed);
            return Ok(DatabaseLocation::Memory(format!(
                "recorder-mem-{}-{n}",
                std::process::id()
            )));
        }
        match rest.strip_prefix('/') {
            Some(path) if !path.is_empty() => Ok(DatabaseLocation::File(PathBuf::from(path))),
            _ => Err(StoreError::InvalidConfig(format!(
                "database url has no path: {url}"
            ))),
        }
    }

    pub fn file(path: impl Into<PathBuf>) -> Self {
        DatabaseLocation::File(path.into())
    }

    pub fn path(&self) -> Option<&Path> {
        match self {
            DatabaseLocation::File(path) => Some(path),
            DatabaseLocation::Memory(_) => None,
        }
    }

    pub fn is_memory(&self) -> bool {
        matches!(self, DatabaseLocation::Memory(_))
    }

    fn open_target(&self) -> String {
        match self {
            DatabaseLocation::File(path) => path.to_string_lossy().into_owned(),
            DatabaseLocation::Memory(name) => format!("file:{name}?mode=memory&cache=shared"),
        }
    }
}

/// Opens the single writable connection and applies the dialect tuning.
pub fn open_writer(location: &DatabaseLocation) -> StoreResult<Connection> {
    if let Some(parent) = location.path().and_then(Path::parent)
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_URI
        | OpenFlags::SQLITE_OPEN_NO_MUTEX;
    let conn = Connection::open_with_flags(location.open_target(), flags)?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    configure_connection(&conn, !location.is_memory())?;
    Ok(conn)
}

fn configure_connection(conn: &Connection, use_wal: bool) -> StoreResult<()> {
    if use_wal {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;",
        )?;
    } else {
        conn.execute_batch(
            "PRAGMA journal_mode = MEMORY;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;",
        )?;
    }
    Ok(())
}

/// Runs `PRAGMA quick_check` on an existing file and moves it aside when it
/// is not a usable database. Returns the new location of a moved file.
pub fn validate_or_move_aside(path: &Path) -> StoreResult<Option<PathBuf>> {
    if !path.exists() {
        return Ok(None);
    }
    match quick_check(path) {
        Ok(true) => Ok(None),
        Ok(false) => {
            tracing::error!(path = %path.display(), "database failed integrity check");
            move_aside(path).map(Some)
        }
        Err(err) if is_unusable(&err) => {
            tracing::error!(path = %path.display(), error = %err, "database file is unreadable");
            move_aside(path).map(Some)
        }
        Err(err) => Err(err.into()),
    }
}

fn quick_check(path: &Path) -> rusqlite::Result<bool> {
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;
    let result: String = conn.query_row("PRAGMA quick_check", [], |row| row.get(0))?;
    Ok(result == "ok")
}

fn is_unusable(err: &rusqlite::Error) -> bool {
    matches!(
        err.sqlite_error_code(),
        Some(ErrorCode::DatabaseCorrupt) | Some(ErrorCode::NotADatabase)
    )
}

/// Renames the database (and its `-wal`/`-shm` companions) to
/// `<file>.corrupt.<timestamp>` so a fresh one can be created in its place.
pub fn move_aside(path: &Path) -> StoreResult<PathBuf> {
    let stamp = Utc::now().format("%Y-%m-%dT%H%M%S%.6fZ");
    let mut target = path.as_os_str().to_owned();
    target.push(format!(".corrupt.{stamp}"));
    let target = PathBuf::from(target);

    if path.exists() {
        std::fs::rename(path, &target)?;
    }
    for suffix in ["-wal", "-shm"] {
        let mut companion = path.as_os_str().to_owned();
        companion.push(suffix);
        let companion = PathBuf::from(companion);
        if companion.exists() {
            let mut moved = target.as_os_str().to_owned();
            moved.push(suffix);
            std::fs::rename(&companion, PathBuf::from(moved))?;
        }
    }
    tracing::warn!(
        from = %path.display(),
        to = %target.display(),
        "moved damaged database aside"
    );
    Ok(target)
}

fn default_pool_size() -> u32 {
    std::thread::available_parallelism()
        .map(|p| (p.get() as u32).clamp(MIN_POOL_SIZE, MAX_POOL_SIZE))
        .unwrap_or(4)
}

/// Read-only connections for history and statistics queries.
///
/// Built on first use and dropped by [`ReadPool::reset`] after the database
/// file has been replaced.
///
/// File databases give readers WAL snapshot isolation. In-memory databases
/// share one page cache with the writer, and a shared-cache reader would get
/// `SQLITE_LOCKED` on any table the writer's open transaction touched. Those
/// readers therefore run with `read_uncommitted`, and they can see rows of a
/// batch that is not committed yet and may still be rolled back.
pub struct ReadPool {
    location: DatabaseLocation,
    max_size: u32,
    pool: RwLock<Option<Pool<SqliteConnectionManager>>>,
}

impl std::fmt::Debug for ReadPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadPool")
            .field("location", &self.location)
            .field("max_size", &self.max_size)
            .finish()
    }
}

impl ReadPool {
    pub fn new(location: DatabaseLocation) -> Self {
        Self::with_size(location, default_pool_size())
    }

    pub fn with_size(location: DatabaseLocation, max_size: u32) -> Self {
        Self {
            location,
            max_size: max_size.max(1),
            pool: RwLock::new(None),
        }
    }

    pub fn get(&self) -> StoreResult<PooledConnection<SqliteConnectionManager>> {
        let existing = self
            .pool
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        let pool = match existing {
            Some(pool) => pool,
            None => {
                let mut guard = self
                    .pool
                    .write()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                match guard.as_ref() {
                    Some(pool) => pool.clone(),
                    None => {
                        let pool = self.build()?;
                        *guard = Some(pool.clone());
                        pool
                    }
                }
            }
        };
        Ok(pool.get()?)
    }

    /// Drops every pooled connection; the next `get` reconnects.
    pub fn reset(&self) {
        let mut guard = self
            .pool
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = None;
    }

    fn build(&self) -> StoreResult<Pool<SqliteConnectionManager>> {
        let memory = self.location.is_memory();
        let manager = SqliteConnectionManager::file(self.location.open_target())
            .with_flags(
                OpenFlags::SQLITE_OPEN_READ_WRITE
                    | OpenFlags::SQLITE_OPEN_URI
                    | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )
            .with_init(move |conn| {
                conn.busy_timeout(BUSY_TIMEOUT)?;
                conn.execute_batch("PRAGMA query_only = ON;")?;
                // shared cache: read the writer's open batch instead of failing with LOCKED
                if memory {
                    conn.execute_batch("PRAGMA read_uncommitted = ON;")?;
                }
                Ok(())
            });
        let pool = Pool::builder()
            .max_size(self.max_size)
            .min_idle(Some(0))
            .connection_timeout(POOL_CONNECTION_TIMEOUT)
            .build(manager)?;
        Ok(pool)
    }
}
