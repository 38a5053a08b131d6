//! # stratadb
//!
//! An embedded, persistent, transactional ordered key-value store. Keys
//! and values are arbitrary byte strings (keys up to 1024 bytes); data is
//! grouped into named *tables*, each maintained as an independent
//! log-structured merge tree.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                        Database                           │
//! │                                                           │
//! │  Transaction ──► overlay ──┬────────────┬──────────────┐  │
//! │                            │            │              │  │
//! │                    ┌───────▼──┐  ┌──────▼───┐  ┌───────▼┐ │
//! │  table segments:   │ disk seg │  │ disk seg │  │ memory │ │
//! │  (oldest → newest) │  (files) │  │  (files) │  │  seg   │ │
//! │                    └──────────┘  └──────────┘  └────┬───┘ │
//! │                         ▲                           │     │
//! │                         │   commit + async writer   │     │
//! │                         └───────────────────────────┘     │
//! │                                                           │
//! │  ┌─────────────────────────────────────────────────────┐  │
//! │  │  merge worker: collapses runs of disk segments      │  │
//! │  └─────────────────────────────────────────────────────┘  │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`database`] | Lifecycle — open, close, remove, directory layout, process lock |
//! | [`transaction`] | Read snapshot, staged writes, commit hand-off |
//! | [`segment`] | Memory/disk segments, on-disk block format, overlay merge |
//! | [`compaction`] | Background worker merging on-disk segments |
//! | `tree` | Balanced ordered map backing the memory segment |
//!
//! ## Semantics
//!
//! - **Transactions** stage writes in memory and publish them atomically
//!   at commit; a transaction reads its own writes and a consistent
//!   snapshot of everything committed before it began.
//! - **Shadowing**: newer segments win. A deletion is a *tombstone* entry
//!   that shadows older values until compaction folds them together.
//! - **Durability**: committed segments are persisted by background
//!   writers through atomic temp-file renames. There is no write-ahead
//!   log and no synchronous fsync — a power loss can drop segments that
//!   were still in flight; `commit_sync` narrows that window to zero for
//!   the calling transaction.
//! - **Single process**: an advisory lock on the database directory keeps
//!   other processes out. Within the process, the handle is freely
//!   shareable; each transaction belongs to one thread.
//!
//! ## Quick start
//!
//! ```no_run
//! use stratadb::Database;
//!
//! let db = Database::open("/tmp/my-db", true)?;
//!
//! let mut tx = db.begin_tx("main")?;
//! tx.put(b"mykey", b"myvalue")?;
//! assert_eq!(tx.get(b"mykey")?, Some(b"myvalue".to_vec()));
//! tx.commit_sync()?;
//!
//! let tx = db.begin_tx("main")?;
//! for entry in tx.lookup(None, None)? {
//!     let (key, value) = entry?;
//!     println!("{:?} = {:?}", key, value);
//! }
//! tx.rollback();
//!
//! db.close()?;
//! # Ok::<(), stratadb::DbError>(())
//! ```

pub mod compaction;
pub mod config;
pub mod database;
mod flock;
pub mod segment;
mod tasks;
pub mod transaction;
mod tree;

pub use compaction::CompactionError;
pub use config::DbConfig;
pub use database::{Database, DbError};
pub use segment::SegmentError;
pub use transaction::{ScanIterator, Transaction};
