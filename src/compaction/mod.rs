//! # Compaction Module
//!
//! One background worker per database merges runs of adjacent on-disk
//! segments into single segments, bounding the number of runs a read must
//! consult. The worker never blocks writers: it writes the merged output
//! to fresh files first, and only swaps lists after the table has no
//! transaction in flight.
//!
//! ## Merge cycle
//!
//! For a table whose list exceeds the target, take the contiguous run of
//! *disk* segments at the scan index (a memory segment parked by a
//! concurrent commit ends the run), overlay them read-only, scan the
//! overlay to completion and write one new segment carrying the newest
//! input's id — which keeps the list's chronological invariant intact.
//! Then wait for the table's in-flight count to reach zero, re-verify the
//! inputs are still where they were, delete their files and splice the
//! replacement in.
//!
//! Merging drops shadowed entries — older versions of a key that also
//! appears in a newer input — but always keeps tombstones: a segment
//! outside the merged run may still hold an older value for the key, and
//! dropping the tombstone would resurrect it. Read paths filter
//! tombstones, so they cost bytes, never correctness.
//!
//! ## Failure policy
//!
//! Any I/O error latches on the database and stops the worker; subsequent
//! `begin_tx` / `commit_sync` calls surface it until close.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::io;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::database::{DbInner, TableState};
use crate::segment::disk::DiskSegment;
use crate::segment::multi::MultiSegment;
use crate::segment::writer::write_and_load_segment;
use crate::segment::{SegmentError, SegmentHandle};
use crate::tasks::Shutdown;

/// Idle delay between merge sweeps.
const IDLE_SLEEP: Duration = Duration::from_secs(1);

/// Delay when polling the in-flight count or waiting for a mergeable run.
const POLL_SLEEP: Duration = Duration::from_millis(100);

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors from the merge path.
#[derive(Debug, Error)]
pub enum CompactionError {
    /// Segment read/write failure.
    #[error(transparent)]
    Segment(#[from] SegmentError),

    /// Other filesystem failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

// ------------------------------------------------------------------------------------------------
// Worker loop
// ------------------------------------------------------------------------------------------------

/// Entry point of the per-database worker thread.
///
/// Holds only a weak reference between sweeps so that dropping the last
/// database handle tears the worker down; close() instead signals
/// `shutdown` and joins.
pub(crate) fn merge_worker(db: Weak<DbInner>, shutdown: Arc<Shutdown>) {
    loop {
        let Some(db) = db.upgrade() else { return };
        {
            let state = db.lock_state();
            if state.closing || state.error.is_some() {
                return;
            }
        }

        let target = db.config.max_segments;
        if let Err(err) = merge_database(&db, target) {
            db.latch_error(format!("unable to merge segments: {err}"));
            return;
        }

        drop(db);
        if shutdown.sleep(IDLE_SLEEP) {
            return;
        }
    }
}

/// Merge every table down to at most `target` segments. Also the final
/// close-time merge.
pub(crate) fn merge_database(db: &DbInner, target: usize) -> Result<(), CompactionError> {
    let tables: Vec<Arc<TableState>> = db.lock_state().tables.values().cloned().collect();
    for table in tables {
        merge_table_segments(db, &table, target)?;
    }
    Ok(())
}

// ------------------------------------------------------------------------------------------------
// Per-table merging
// ------------------------------------------------------------------------------------------------

fn merge_table_segments(
    db: &DbInner,
    table: &Arc<TableState>,
    target: usize,
) -> Result<(), CompactionError> {
    let mut index = 0usize;

    loop {
        let segments = table.lock().segments.clone();
        if segments.len() <= target {
            return Ok(());
        }
        if index >= segments.len() {
            index = 0;
            continue;
        }

        let batch_limit = (segments.len() / 2).max(4);

        // Contiguous run of disk segments at the scan index; a memory
        // segment parked by a concurrent commit ends the run.
        let mut inputs: Vec<Arc<DiskSegment>> = Vec::new();
        for handle in &segments[index..] {
            let Some(disk) = handle.as_disk() else { break };
            inputs.push(Arc::clone(disk));
            if inputs.len() == batch_limit {
                break;
            }
        }

        if inputs.len() < 2 {
            // A short run behind the scan index: rescan from the front,
            // where earlier merges may have opened up a longer one.
            if index > 0 {
                index = 0;
                continue;
            }
            // Blocked at the front of the list: a memory segment must
            // still be converted by its commit writer. Wait for it —
            // unless the database is shutting down, where a segment that
            // has not converted by now never will.
            if db.shutdown.is_signalled() {
                return Ok(());
            }
            thread::sleep(POLL_SLEEP);
            continue;
        }

        let run: Vec<SegmentHandle> = segments[index..index + inputs.len()].to_vec();
        let newest_id = inputs[inputs.len() - 1].id();
        let merged = write_merged_segment(db, &table.name, newest_id, run.clone())?;

        // Existing transactions hold the input segments in their overlays;
        // their files must not vanish under an open scan. Poll the
        // in-flight count down to zero before touching anything.
        let mut guard = table.lock();
        while guard.in_flight > 0 {
            drop(guard);
            thread::sleep(POLL_SLEEP);
            guard = table.lock();
        }

        // The inputs must still sit at their expected positions. They
        // always should — commits only append, and the writer replaces in
        // place — but a merge must never delete files it cannot account
        // for, so verify rather than trust.
        let intact = guard.segments.len() >= index + run.len()
            && run
                .iter()
                .zip(guard.segments[index..].iter())
                .all(|(expected, current)| expected.same(current));
        if !intact {
            warn!(table = %table.name, "segment list changed under merge; aborting cycle");
            drop(guard);
            let _ = merged.delete_files();
            return Ok(());
        }

        for input in &inputs {
            input.delete_files()?;
        }

        let mut next: Vec<SegmentHandle> = Vec::with_capacity(guard.segments.len() - run.len() + 1);
        next.extend_from_slice(&guard.segments[..index]);
        next.push(SegmentHandle::Disk(Arc::new(merged)));
        next.extend_from_slice(&guard.segments[index + run.len()..]);
        guard.segments = next;
        drop(guard);

        info!(
            table = %table.name,
            merged = inputs.len(),
            id = newest_id,
            "disk segments merged"
        );

        index += 1;
        thread::sleep(POLL_SLEEP);
    }
}

/// Scan a read-only overlay of the run and write it out as one segment.
///
/// The output takes the id of the newest input — it shadows exactly what
/// those inputs shadowed — under a `merged` name made unique by a
/// process-wide sequence number.
fn write_merged_segment(
    db: &DbInner,
    table: &str,
    id: u64,
    run: Vec<SegmentHandle>,
) -> Result<DiskSegment, CompactionError> {
    let seq = db.next_merge_seq.fetch_add(1, Ordering::SeqCst) + 1;
    let key_path = db.path.join(format!("{table}.merged..{seq}.keys.{id}"));
    let data_path = db.path.join(format!("{table}.merged..{seq}.data.{id}"));

    debug!(table, id, inputs = run.len(), "writing merged segment");

    let overlay = MultiSegment::read_only(run);
    let mut iter = overlay.lookup(None, None)?;
    let segment = write_and_load_segment(&key_path, &data_path, id, &mut iter)?.ok_or_else(|| {
        SegmentError::Corrupt("merge of non-empty segments produced no entries".into())
    })?;
    Ok(segment)
}
