//! # Transaction Module
//!
//! A transaction names one table and owns two things for its lifetime: a
//! fresh memory segment receiving every mutation, and a multi-segment
//! overlay built at begin time over the table's segments with the memory
//! segment appended last. Reads go through the overlay (read-your-writes
//! falls out of the memory segment's position); writes touch only the
//! memory segment.
//!
//! ## Commit hand-off
//!
//! Commit appends the memory segment to the table's list — at that point
//! the writes are visible to every later transaction — and hands the
//! segment to a writer thread. The writer encodes it to a disk segment
//! pair and replaces the memory segment in the list *by identity*, so
//! concurrent appends to the list are never disturbed. `commit_sync` runs
//! the same writer inline and surfaces its error; plain `commit` returns
//! immediately and lets failures latch on the database.
//!
//! Completion consumes the transaction, so use-after-commit is a compile
//! error rather than a runtime one. Dropping an open transaction rolls it
//! back.
//!
//! A transaction is not thread-safe; keep it on the thread that began it.

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;

use tracing::{debug, trace};

use crate::database::{self, Database, DbError, DbInner, TableState};
use crate::segment::format::MAX_KEY_SIZE;
use crate::segment::memory::MemorySegment;
use crate::segment::multi::{MultiSegment, MultiSegmentIterator};
use crate::segment::writer::write_and_load_segment;
use crate::segment::{Entry, SegmentError, SegmentGetResult, SegmentHandle, SegmentIterator};

const BACKPRESSURE_SLEEP: Duration = Duration::from_millis(100);

// ------------------------------------------------------------------------------------------------
// begin_tx
// ------------------------------------------------------------------------------------------------

impl Database {
    /// Start a transaction against `table`, creating the table on first
    /// use. The transaction sees every segment the table had at this
    /// instant, plus its own staged writes.
    ///
    /// Blocks while the table holds far more segments than the merge
    /// target, which throttles writers whenever compaction cannot keep
    /// up.
    pub fn begin_tx(&self, table: &str) -> Result<Transaction, DbError> {
        let db = Arc::clone(&self.inner);

        let mut state = db.lock_state();
        if let Some(message) = &state.error {
            return Err(DbError::Background(message.clone()));
        }
        if state.closing || !state.open {
            return Err(DbError::DatabaseClosed);
        }

        let table_state = match state.tables.get(table) {
            Some(existing) => Arc::clone(existing),
            None => {
                // First transaction against this table: discover its
                // segment pairs on disk.
                let segments = database::load_disk_segments(&db, table)?;
                let created = Arc::new(TableState::new(table.to_string(), segments));
                state.tables.insert(table.to_string(), Arc::clone(&created));
                created
            }
        };

        loop {
            let backlog = table_state.lock().segments.len();
            if backlog <= db.config.backpressure_threshold() {
                break;
            }
            drop(state);
            thread::sleep(BACKPRESSURE_SLEEP);
            state = db.lock_state();
            if state.closing || !state.open {
                return Err(DbError::DatabaseClosed);
            }
        }

        let id = db.next_tx_id.fetch_add(1, Ordering::SeqCst) + 1;
        let memory = Arc::new(MemorySegment::new());
        let multi = {
            let mut guard = table_state.lock();
            guard.in_flight += 1;
            let mut segments = guard.segments.clone();
            segments.push(SegmentHandle::Memory(Arc::clone(&memory)));
            MultiSegment::writable(segments, Arc::clone(&memory))
        };

        state.live_txs.insert(id);
        drop(state);

        trace!(table, id, "transaction started");
        Ok(Transaction {
            db,
            table: table_state,
            id,
            memory,
            multi,
            open: true,
        })
    }
}

// ------------------------------------------------------------------------------------------------
// Transaction
// ------------------------------------------------------------------------------------------------

/// An open transaction on one table. See the module docs for the
/// completion and visibility rules.
pub struct Transaction {
    db: Arc<DbInner>,
    table: Arc<TableState>,
    id: u64,
    memory: Arc<MemorySegment>,
    multi: MultiSegment,
    open: bool,
}

impl Transaction {
    /// Process-unique transaction identifier.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Look up a key. Deleted and never-written keys both read as `None`.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, DbError> {
        check_key_len(key)?;
        match self.multi.get(key)? {
            SegmentGetResult::Value(value) => Ok(Some(value)),
            SegmentGetResult::Tombstone | SegmentGetResult::NotFound => Ok(None),
        }
    }

    /// Stage a write, overwriting any existing entry for the key.
    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), DbError> {
        if key.is_empty() {
            return Err(DbError::EmptyKey);
        }
        check_key_len(key)?;
        self.multi.put(key, value);
        Ok(())
    }

    /// Stage a deletion and return the value the key had, looked up
    /// through the overlay — it may come from an older on-disk segment.
    /// The tombstone is recorded even when the key was nowhere to be
    /// found.
    pub fn remove(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>, DbError> {
        check_key_len(key)?;
        let previous = match self.multi.get(key)? {
            SegmentGetResult::Value(value) => Some(value),
            SegmentGetResult::Tombstone | SegmentGetResult::NotFound => None,
        };
        self.multi.remove(key);
        Ok(previous)
    }

    /// Ordered scan of the live entries in `[lower, upper]`, inclusive on
    /// both ends; `None` bounds are unbounded. Deleted keys never appear.
    ///
    /// The iterator owns its view: it stays valid for the life of the
    /// process, but entries staged after its creation are not picked up.
    pub fn lookup(
        &self,
        lower: Option<&[u8]>,
        upper: Option<&[u8]>,
    ) -> Result<ScanIterator, DbError> {
        let inner = self.multi.lookup(lower, upper)?;
        Ok(ScanIterator { inner, done: false })
    }

    /// Publish the staged writes and return immediately; a background
    /// writer persists them. A writer failure latches on the database and
    /// poisons later transactions — use [`commit_sync`](Self::commit_sync)
    /// to observe it directly.
    pub fn commit(mut self) {
        // Register the writer before leaving the live set, so a close
        // racing this commit is guaranteed to drain it.
        self.db.writers.add(1);
        self.open = false;
        self.db.lock_state().live_txs.remove(&self.id);

        // The segment id is allocated in the same critical section as the
        // list append: discovery sorts by id at reopen, so id order must
        // match append order or an older commit could shadow a newer one.
        let segment_id = {
            let mut guard = self.table.lock();
            guard.in_flight -= 1;
            guard.segments.push(SegmentHandle::Memory(Arc::clone(&self.memory)));
            self.db.next_seg_id.fetch_add(1, Ordering::SeqCst) + 1
        };

        let db = Arc::clone(&self.db);
        let table = Arc::clone(&self.table);
        let memory = Arc::clone(&self.memory);
        thread::spawn(move || {
            if let Err(err) = flush_memory_segment(&db, &table, &memory, segment_id) {
                db.latch_error(format!("commit writer failed: {err}"));
            }
            db.writers.done();
        });

        trace!(id = self.id, segment_id, "transaction committed");
    }

    /// Publish the staged writes and persist them before returning.
    ///
    /// Unlike [`commit`](Self::commit) this surfaces write errors, and it
    /// guarantees the on-disk segment is in place when it returns — a
    /// reopened database sees the data unconditionally.
    pub fn commit_sync(mut self) -> Result<(), DbError> {
        self.db.writers.add(1);
        self.open = false;
        let latched = {
            let mut state = self.db.lock_state();
            state.live_txs.remove(&self.id);
            state.error.clone()
        };
        if let Some(message) = latched {
            self.table.lock().in_flight -= 1;
            self.db.writers.done();
            return Err(DbError::Background(message));
        }

        let segment_id = {
            let mut guard = self.table.lock();
            guard.in_flight -= 1;
            guard.segments.push(SegmentHandle::Memory(Arc::clone(&self.memory)));
            self.db.next_seg_id.fetch_add(1, Ordering::SeqCst) + 1
        };

        let result = flush_memory_segment(&self.db, &self.table, &self.memory, segment_id);
        self.db.writers.done();

        trace!(id = self.id, "transaction committed synchronously");
        result.map_err(DbError::from)
    }

    /// Discard the staged writes. Nothing reaches the table or the disk.
    pub fn rollback(mut self) {
        self.release();
        trace!(id = self.id, "transaction rolled back");
    }

    fn release(&mut self) {
        if !self.open {
            return;
        }
        self.open = false;
        self.db.lock_state().live_txs.remove(&self.id);
        self.table.lock().in_flight -= 1;
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        // An abandoned transaction rolls back; leaking the in-flight count
        // would stall compaction forever.
        self.release();
    }
}

fn check_key_len(key: &[u8]) -> Result<(), DbError> {
    if key.len() > MAX_KEY_SIZE {
        return Err(DbError::KeyTooLong);
    }
    Ok(())
}

// ------------------------------------------------------------------------------------------------
// Commit writer
// ------------------------------------------------------------------------------------------------

/// Encode a committed memory segment to a disk pair and swap it into the
/// table's list in the exact position the memory segment occupies,
/// located by identity. An empty segment (a commit that wrote nothing)
/// just leaves the list.
fn flush_memory_segment(
    db: &Arc<DbInner>,
    table: &Arc<TableState>,
    memory: &Arc<MemorySegment>,
    id: u64,
) -> Result<(), SegmentError> {
    let mut iter = memory.lookup(None, None);
    let key_path = db.path.join(format!("{}.keys.{}", table.name, id));
    let data_path = db.path.join(format!("{}.data.{}", table.name, id));

    let replacement = write_and_load_segment(&key_path, &data_path, id, &mut iter)?
        .map(|segment| SegmentHandle::Disk(Arc::new(segment)));

    let target = SegmentHandle::Memory(Arc::clone(memory));
    let mut guard = table.lock();
    let mut next: Vec<SegmentHandle> = Vec::with_capacity(guard.segments.len());
    for handle in guard.segments.iter() {
        if handle.same(&target) {
            if let Some(replacement) = &replacement {
                next.push(replacement.clone());
            }
        } else {
            next.push(handle.clone());
        }
    }
    guard.segments = next;
    drop(guard);

    debug!(table = %table.name, id, "memory segment flushed");
    Ok(())
}

// ------------------------------------------------------------------------------------------------
// ScanIterator
// ------------------------------------------------------------------------------------------------

/// Iterator over a transaction's visible entries, in key order. Yields
/// `(key, value)` pairs; tombstones are filtered, so removed keys never
/// appear. Fuses after the first error.
pub struct ScanIterator {
    inner: MultiSegmentIterator,
    done: bool,
}

impl Iterator for ScanIterator {
    type Item = Result<(Vec<u8>, Vec<u8>), DbError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            match self.inner.next_entry() {
                Ok(None) => {
                    self.done = true;
                    return None;
                }
                // A tombstone shadowing older segments; invisible to users.
                Ok(Some(Entry { value: None, .. })) => continue,
                Ok(Some(Entry {
                    key,
                    value: Some(value),
                })) => return Some(Ok((key, value))),
                Err(err) => {
                    self.done = true;
                    return Some(Err(err.into()));
                }
            }
        }
    }
}
