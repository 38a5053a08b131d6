//! # Database Module
//!
//! Lifecycle and shared state of one database: a directory on disk, a map
//! from table name to table state, the live-transaction registry, the
//! monotonic segment-id counter, the latched background error, and the
//! exclusive process lock.
//!
//! ## Directory layout
//!
//! ```text
//! <path>/lockfile                      advisory flock target, always empty
//! <path>/<table>.keys.<id>             one pair per segment, id a decimal u64
//! <path>/<table>.data.<id>
//! <path>/<table>.merged..<seq>.keys.<id>   merge outputs (same discovery rules)
//! ```
//!
//! During writes, `.tmp` variants exist briefly; finding one at open means
//! a previous process died mid-write, which is reported as fatal.
//!
//! ## Concurrency
//!
//! The database mutex protects the tables map, the transaction registry,
//! the closing flag, and the error latch. Each table has its own mutex
//! over its segment list and in-flight count. Lock order is strictly
//! database → table. Poisoned locks are recovered with `into_inner`: all
//! guarded state is kept consistent while the lock is held, so a panicking
//! peer cannot leave it half-updated.
//!
//! ## Error latch
//!
//! Failures inside background tasks (merge worker, commit writers) cannot
//! surface through a call path, so they latch on the database; every
//! subsequent `begin_tx` and `commit_sync` then fails with the latched
//! message until close.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;

use thiserror::Error;
use tracing::{error, info};

use crate::compaction::{self, CompactionError};
use crate::config::DbConfig;
use crate::flock::FileLock;
use crate::segment::disk::DiskSegment;
use crate::segment::{SegmentError, SegmentHandle};
use crate::tasks::{Shutdown, WaitGroup};

const LOCKFILE: &str = "lockfile";

/// Serializes `open` / `close` / `remove` across every database in the
/// process, so directory creation and lock acquisition never interleave.
static OPEN_LOCK: Mutex<()> = Mutex::new(());

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors surfaced by the public database API.
#[derive(Debug, Error)]
pub enum DbError {
    /// Empty keys are rejected at write time.
    #[error("empty keys are not supported")]
    EmptyKey,

    /// Keys are bounded to 1024 bytes.
    #[error("key exceeds 1024 bytes")]
    KeyTooLong,

    /// The database is closed or closing.
    #[error("database closed")]
    DatabaseClosed,

    /// Another process holds the database's lock file.
    #[error("database in use")]
    DatabaseInUse,

    /// Close was requested while transactions are still open.
    #[error("database has open transactions")]
    DatabaseHasOpenTransactions,

    /// The path does not exist (and creation was not requested).
    #[error("no database found at {0}")]
    NoDatabaseFound(PathBuf),

    /// The path exists but is not a directory.
    #[error("not a directory: {0}")]
    NotADirectory(PathBuf),

    /// The directory holds files that are not segment pairs.
    #[error("not a valid database: unexpected entry {0}")]
    NotValidDatabase(PathBuf),

    /// A `.tmp` file was found at open — a previous process died mid-write.
    #[error("stale temp file from an interrupted write: {0}")]
    StaleTempFile(PathBuf),

    /// Rejected configuration value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A background task failed earlier; the database is poisoned until
    /// closed.
    #[error("a background task failed: {0}")]
    Background(String),

    /// Segment format or segment I/O failure.
    #[error(transparent)]
    Segment(#[from] SegmentError),

    /// The final close-time merge failed.
    #[error("compaction failed: {0}")]
    Compaction(#[from] CompactionError),

    /// Other filesystem failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

// ------------------------------------------------------------------------------------------------
// Shared state
// ------------------------------------------------------------------------------------------------

/// State behind the database mutex.
pub(crate) struct DbState {
    pub(crate) tables: HashMap<String, Arc<TableState>>,
    pub(crate) live_txs: HashSet<u64>,
    pub(crate) closing: bool,
    pub(crate) open: bool,
    /// Latched background failure; set once, cleared never.
    pub(crate) error: Option<String>,
}

/// One table: an ordered segment list (oldest first) and the count of
/// transactions currently holding its segments in an overlay.
pub(crate) struct TableState {
    pub(crate) name: String,
    inner: Mutex<TableInner>,
}

pub(crate) struct TableInner {
    pub(crate) segments: Vec<SegmentHandle>,
    pub(crate) in_flight: usize,
}

impl TableState {
    pub(crate) fn new(name: String, segments: Vec<SegmentHandle>) -> Self {
        TableState {
            name,
            inner: Mutex::new(TableInner {
                segments,
                in_flight: 0,
            }),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, TableInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub(crate) struct DbInner {
    pub(crate) path: PathBuf,
    pub(crate) config: DbConfig,
    state: Mutex<DbState>,
    pub(crate) next_seg_id: AtomicU64,
    pub(crate) next_tx_id: AtomicU64,
    pub(crate) next_merge_seq: AtomicU64,
    /// Outstanding commit writers; close drains this.
    pub(crate) writers: WaitGroup,
    pub(crate) shutdown: Arc<Shutdown>,
    worker: Mutex<Option<JoinHandle<()>>>,
    lockfile: Mutex<Option<FileLock>>,
}

impl DbInner {
    pub(crate) fn lock_state(&self) -> MutexGuard<'_, DbState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a background failure. First error wins; later ones are only
    /// logged.
    pub(crate) fn latch_error(&self, message: String) {
        error!(%message, "background task failed; latching database error");
        let mut state = self.lock_state();
        if state.error.is_none() {
            state.error = Some(message);
        }
    }
}

impl Drop for DbInner {
    fn drop(&mut self) {
        // Last handle dropped without close(): stop the worker and let the
        // lock file go with the struct. No final merge on this path.
        self.shutdown.signal();
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle
            && handle.thread().id() != std::thread::current().id()
        {
            let _ = handle.join();
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Database
// ------------------------------------------------------------------------------------------------

/// Handle to an open database. Cheap to clone; all clones share state.
/// Obtained via [`Database::open`].
#[derive(Clone)]
pub struct Database {
    pub(crate) inner: Arc<DbInner>,
}

impl Database {
    /// Open a database directory with the default configuration. Only one
    /// process can hold a database open; the handle itself may be shared
    /// freely between threads.
    ///
    /// With `create_if_missing`, a missing directory is created. Tables
    /// come into existence lazily on first
    /// [`begin_tx`](Database::begin_tx) against them.
    pub fn open(path: impl AsRef<Path>, create_if_missing: bool) -> Result<Database, DbError> {
        Self::open_with_config(path, create_if_missing, DbConfig::default())
    }

    pub fn open_with_config(
        path: impl AsRef<Path>,
        create_if_missing: bool,
        config: DbConfig,
    ) -> Result<Database, DbError> {
        config.validate()?;
        let _guard = OPEN_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
        let path = path.as_ref();

        match validate_database_dir(path, true) {
            Ok(()) => {}
            Err(DbError::NoDatabaseFound(_)) if create_if_missing => {
                fs::create_dir_all(path)?;
            }
            Err(err) => return Err(err),
        }

        let lockfile =
            FileLock::acquire(&path.join(LOCKFILE)).map_err(|_| DbError::DatabaseInUse)?;

        let inner = Arc::new(DbInner {
            path: path.to_path_buf(),
            config,
            state: Mutex::new(DbState {
                tables: HashMap::new(),
                live_txs: HashSet::new(),
                closing: false,
                open: true,
                error: None,
            }),
            next_seg_id: AtomicU64::new(0),
            next_tx_id: AtomicU64::new(0),
            next_merge_seq: AtomicU64::new(0),
            writers: WaitGroup::new(),
            shutdown: Arc::new(Shutdown::new()),
            worker: Mutex::new(None),
            lockfile: Mutex::new(Some(lockfile)),
        });

        // The worker holds only a weak reference so abandoned databases
        // can still be torn down by Drop.
        let weak = Arc::downgrade(&inner);
        let shutdown = Arc::clone(&inner.shutdown);
        let handle = std::thread::Builder::new()
            .name("stratadb-merge".into())
            .spawn(move || compaction::merge_worker(weak, shutdown))?;
        *inner
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);

        info!(path = %path.display(), "database opened");
        Ok(Database { inner })
    }

    /// Delete a database directory and everything in it. Fails with
    /// [`DbError::DatabaseInUse`] while any process holds it open.
    pub fn remove(path: impl AsRef<Path>) -> Result<(), DbError> {
        let _guard = OPEN_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
        let path = path.as_ref();

        validate_database_dir(path, false)?;
        let _lock = FileLock::acquire(&path.join(LOCKFILE)).map_err(|_| DbError::DatabaseInUse)?;

        fs::remove_dir_all(path)?;
        Ok(())
    }

    /// Close the database: drain background work, run a final merge down
    /// to the configured `max_segments`, release the lock file.
    ///
    /// Fails if transactions are still open. When a background error is
    /// latched the drain and release still happen, the final merge is
    /// skipped, and the latched error is returned.
    pub fn close(&self) -> Result<(), DbError> {
        self.shutdown_with_merge(Some(self.inner.config.max_segments))
    }

    /// [`close`](Database::close) with an explicit merge target; `0`
    /// disables the final merge entirely.
    pub fn close_with_merge(&self, segment_count: usize) -> Result<(), DbError> {
        self.shutdown_with_merge((segment_count > 0).then_some(segment_count))
    }

    fn shutdown_with_merge(&self, target: Option<usize>) -> Result<(), DbError> {
        let _guard = OPEN_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
        let inner = &self.inner;

        {
            let mut state = inner.lock_state();
            if !state.open || state.closing {
                return Err(DbError::DatabaseClosed);
            }
            if !state.live_txs.is_empty() {
                return Err(DbError::DatabaseHasOpenTransactions);
            }
            state.closing = true;
        }

        // Stop the merge worker, then wait for every in-flight commit
        // writer to splice its segment in.
        inner.shutdown.signal();
        let handle = inner
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
        inner.writers.wait();

        let latched = inner.lock_state().error.clone();
        let mut merge_result = Ok(());
        if latched.is_none()
            && let Some(target) = target
        {
            merge_result = compaction::merge_database(inner, target).map_err(DbError::from);
        }

        {
            let mut state = inner.lock_state();
            // Dropping the handles closes every open segment file.
            state.tables.clear();
            state.open = false;
        }
        *inner
            .lockfile
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = None;

        info!(path = %inner.path.display(), "database closed");

        if let Some(message) = latched {
            return Err(DbError::Background(message));
        }
        merge_result
    }
}

// ------------------------------------------------------------------------------------------------
// Directory validation and segment discovery
// ------------------------------------------------------------------------------------------------

/// A valid database directory contains nothing but the lock file and
/// segment pairs. Empty directories are valid. `reject_temp_files` is set
/// at open, where `.tmp` litter proves a writer died mid-rename; `remove`
/// tolerates it so a crashed database can still be deleted.
fn validate_database_dir(path: &Path, reject_temp_files: bool) -> Result<(), DbError> {
    let Ok(meta) = fs::metadata(path) else {
        return Err(DbError::NoDatabaseFound(path.to_path_buf()));
    };
    if !meta.is_dir() {
        return Err(DbError::NotADirectory(path.to_path_buf()));
    }

    for entry in fs::read_dir(path)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            return Err(DbError::NotValidDatabase(entry.path()));
        };
        if name == LOCKFILE {
            continue;
        }
        if name.ends_with(".tmp") {
            if reject_temp_files {
                return Err(DbError::StaleTempFile(entry.path()));
            }
            continue;
        }
        if !is_segment_filename(name) {
            return Err(DbError::NotValidDatabase(entry.path()));
        }
    }
    Ok(())
}

/// `<base>.keys.<digits>` or `<base>.data.<digits>`.
fn is_segment_filename(name: &str) -> bool {
    let marked = name.contains(".keys.") || name.contains(".data.");
    let Some((_, id)) = name.rsplit_once('.') else {
        return false;
    };
    marked && !id.is_empty() && id.bytes().all(|b| b.is_ascii_digit())
}

/// Enumerate a table's segment pairs, oldest (smallest id) first, and open
/// them. Called once per table, on its first transaction.
pub(crate) fn load_disk_segments(
    db: &DbInner,
    table: &str,
) -> Result<Vec<SegmentHandle>, DbError> {
    let prefix = format!("{table}.");
    let mut found: Vec<(u64, PathBuf, PathBuf)> = Vec::new();

    for entry in fs::read_dir(&db.path)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !name.starts_with(&prefix) {
            continue;
        }
        let Some((base, id)) = split_segment_name(name) else {
            continue;
        };
        let data_name = format!("{base}.data.{id}");
        found.push((id, db.path.join(name), db.path.join(data_name)));
    }
    found.sort_by_key(|(id, ..)| *id);

    let mut segments = Vec::with_capacity(found.len());
    let mut max_id = 0;
    for (id, key_path, data_path) in found {
        max_id = max_id.max(id);
        let segment = DiskSegment::open(&key_path, &data_path, id, None)?;
        segments.push(SegmentHandle::Disk(Arc::new(segment)));
    }

    // Fresh segment ids must sort above everything already on disk, or a
    // reopened database would write segments that load before older data.
    db.next_seg_id.fetch_max(max_id, Ordering::SeqCst);

    Ok(segments)
}

/// `("<base>", id)` for a key-file name `<base>.keys.<digits>`.
fn split_segment_name(name: &str) -> Option<(&str, u64)> {
    let at = name.find(".keys.")?;
    let id_str = &name[at + ".keys.".len()..];
    if id_str.is_empty() || !id_str.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some((&name[..at], id_str.parse().ok()?))
}
