//! Per-object coalescing queue.
//!
//! Each stream stages accepted records in a FIFO before handing them to
//! the pipeline, so that redundant records on the same object can be
//! suppressed while they still sit in the queue. Staged operations live
//! in an arena of slots; the FIFO and the per-object index both hold slot
//! indices, so the two views can never disagree on what they point at.
//!
//! # Suppression
//!
//! Whether an incoming record can be dropped is a static property of its
//! kind:
//! - **always**: bookkeeping records (`MARK`, legacy `IOCTL`) carry no
//!   database-relevant state.
//! - **covered**: data- and attribute-change records are dropped when a
//!   staged record for the same object already implies their effect (a
//!   `CLOSE` after a pending `CREATE` changes nothing the `CREATE`'s
//!   processing would not already capture).
//! - everything else is never dropped.
//!
//! Dropping a record must not lose its acknowledgment: when the dropped
//! id directly follows the covering operation's ack id, the covering op's
//! ack id is extended to swallow it, so retiring the covering op also
//! releases the dropped record upstream. Chains of consecutive drops keep
//! extending the same op. Wider gaps are left for a later, higher-id
//! clear to sweep over.

use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, VecDeque};
use xxhash_rust::xxh64::Xxh64Builder;

use crate::pipeline::OpHints;
use crate::record::{ChangeRecord, FileId, KIND_COUNT, RecordKind};

/// Seed for the object-id hasher. Fixed so bucket layout is reproducible
/// in tests.
const FID_HASH_SEED: u64 = 0x517cc1b727220a95;

// ── Suppression table ──────────────────────────────────────────────────────

enum Filter {
    /// Stage unconditionally.
    Never,
    /// Drop unconditionally.
    Always,
    /// Drop when a staged record for the same object has a kind in the
    /// mask.
    Covered(u32),
}

fn suppression_filter(kind: RecordKind) -> Filter {
    use RecordKind::*;

    let data_mask = Trunc.bit() | Close.bit() | Mtime.bit() | Create.bit();
    let attr_mask = Ctime.bit() | Setattr.bit() | Create.bit() | Mknod.bit() | Mkdir.bit();

    match kind {
        // Bookkeeping records with no database-relevant state.
        Mark | Ioctl => Filter::Always,

        // Data changes covered by a pending data change or creation.
        Trunc | Close => Filter::Covered(data_mask),
        Mtime => Filter::Covered(data_mask | Mknod.bit() | Mkdir.bit()),

        // Attribute changes covered by a pending attribute change or
        // creation.
        Ctime | Setattr => Filter::Covered(attr_mask),

        _ => Filter::Never,
    }
}

// ── Staged operations ──────────────────────────────────────────────────────

/// A record accepted by the reader and awaiting pipeline submission.
#[derive(Debug)]
pub struct StagedOp {
    pub record: ChangeRecord,
    /// Highest record id retired when this op is acknowledged. Starts at
    /// the record's own id and grows by suppression merges.
    pub ack_id: u64,
    /// When the reader staged the op; drives age-based drainage.
    pub arrival: DateTime<Utc>,
    pub hints: OpHints,
}

impl StagedOp {
    pub fn new(record: ChangeRecord, arrival: DateTime<Utc>, hints: OpHints) -> Self {
        let ack_id = record.rec_id;
        StagedOp {
            record,
            ack_id,
            arrival,
            hints,
        }
    }
}

/// Outcome of the suppression check for an incoming record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Suppression {
    /// Not suppressed; the record proceeds to the rewriter.
    None,
    /// The kind is always dropped.
    Always,
    /// A staged record for the same object covers this one. `merged`
    /// reports whether the covering op's ack id was extended over it.
    Covered { merged: bool },
}

// ── Queue ──────────────────────────────────────────────────────────────────

/// The per-stream coalescing queue: an arena of staged ops, a FIFO of
/// slot indices in arrival order, and an object-id index over the same
/// slots. Owned exclusively by the stream's reader task.
pub struct OpQueue {
    slots: Vec<Option<StagedOp>>,
    free: Vec<usize>,
    fifo: VecDeque<usize>,
    by_fid: HashMap<FileId, Vec<usize>, Xxh64Builder>,
}

impl Default for OpQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl OpQueue {
    pub fn new() -> Self {
        OpQueue {
            slots: Vec::new(),
            free: Vec::new(),
            fifo: VecDeque::new(),
            by_fid: HashMap::with_hasher(Xxh64Builder::new(FID_HASH_SEED)),
        }
    }

    pub fn len(&self) -> usize {
        self.fifo.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fifo.is_empty()
    }

    /// Decide whether `rec` can be dropped, applying the ack-id merge to
    /// the covering op when the ids are adjacent.
    pub fn check_suppression(&mut self, rec: &ChangeRecord) -> Suppression {
        let mask = match suppression_filter(rec.kind) {
            Filter::Never => return Suppression::None,
            Filter::Always => return Suppression::Always,
            Filter::Covered(mask) => mask,
        };

        // Buckets are keyed by the exact object id, so every entry here
        // already targets the same object. Scan newest-first: the most
        // recent covering record is the one whose ack id can be adjacent.
        let Some(bucket) = self.by_fid.get(&rec.target) else {
            return Suppression::None;
        };
        for &idx in bucket.iter().rev() {
            let op = self.slots[idx].as_mut().expect("indexed queue slot empty");
            if mask & op.record.kind.bit() == 0 {
                continue;
            }

            let merged = rec.rec_id == op.ack_id + 1;
            if merged {
                tracing::trace!(
                    covering = op.record.rec_id,
                    dropped = rec.rec_id,
                    "acknowledging covering record will acknowledge dropped record too"
                );
                op.ack_id += 1;
            }
            return Suppression::Covered { merged };
        }

        Suppression::None
    }

    /// Append an op to the queue and index it by object id.
    pub fn stage(&mut self, op: StagedOp) {
        let fid = op.record.target;
        let idx = match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = Some(op);
                idx
            }
            None => {
                self.slots.push(Some(op));
                self.slots.len() - 1
            }
        };
        self.fifo.push_back(idx);
        self.by_fid.entry(fid).or_default().push(idx);
    }

    /// Remove and return the head op when the drain policy says it must
    /// go: unconditionally with `push_all`, otherwise while the queue is
    /// at or above `max_size` or the head is older than `max_age`.
    pub fn pop_ready(
        &mut self,
        now: DateTime<Utc>,
        max_size: usize,
        max_age: Duration,
        push_all: bool,
    ) -> Option<StagedOp> {
        let &idx = self.fifo.front()?;
        if !push_all && self.fifo.len() < max_size {
            let arrival = self.slots[idx]
                .as_ref()
                .expect("indexed queue slot empty")
                .arrival;
            if arrival > now - max_age {
                return None;
            }
        }

        self.fifo.pop_front();
        let op = self.slots[idx].take().expect("indexed queue slot empty");
        self.free.push(idx);

        if let Some(bucket) = self.by_fid.get_mut(&op.record.target) {
            bucket.retain(|&i| i != idx);
            if bucket.is_empty() {
                self.by_fid.remove(&op.record.target);
            }
        }

        Some(op)
    }

    /// The `n` most recently staged records, newest first. Used for the
    /// post-mortem dump after a protocol violation.
    pub fn recent_records(&self, n: usize) -> Vec<&ChangeRecord> {
        self.fifo
            .iter()
            .rev()
            .take(n)
            .map(|&idx| {
                &self.slots[idx]
                    .as_ref()
                    .expect("indexed queue slot empty")
                    .record
            })
            .collect()
    }
}

// Keep the counter-array bound in sync with the suppression table.
const _: () = assert!(KIND_COUNT <= 32, "kind bits must fit a u32 coverage mask");
