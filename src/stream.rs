//! Per-stream state.
//!
//! One [`StreamState`] per configured metadata server, owned by its
//! reader task. The commit-side watermarks live in a shared
//! [`CommitState`] because the pipeline's worker tasks advance them from
//! the completion callback; everything else is reader-local.
//!
//! Watermark chain, per stream, between operations:
//! `last_cleared ≤ last_committed_persisted ≤ last_committed ≤
//! last_pushed ≤ last_read`.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::sync::atomic::AtomicU64;

use crate::coalesce::OpQueue;
use crate::config::{ReaderConfig, StreamDef};
use crate::record::KIND_COUNT;
use crate::rewrite::{PendingRename, ServerCapabilities};
use crate::watermark::{RecStats, Watermark};

// ── Counters ───────────────────────────────────────────────────────────────

/// Record counters since process start, plus the snapshot taken at the
/// last stat persist (for delta reporting).
#[derive(Debug, Default)]
pub struct StreamCounters {
    /// Per-kind counts, indexed by `RecordKind as usize`.
    pub per_kind: [u64; KIND_COUNT],
    /// Per-kind counts at the last stat persist.
    pub reported: [u64; KIND_COUNT],

    /// Records pulled from the source.
    pub nb_read: u64,
    /// Records that survived suppression.
    pub interesting: u64,
    /// Records suppressed or merged away.
    pub suppressed: u64,

    /// Unpaired rename/extension records observed.
    pub pairing_violations: u64,
    /// Overwritten rename targets that could not be materialized as
    /// unlinks.
    pub unlink_synthesis_failures: u64,
}

// ── Shared commit-side state ───────────────────────────────────────────────

/// Watermarks advanced by the completion callback.
#[derive(Debug, Default)]
pub struct CommitWatermarks {
    /// Last record durably committed to the database.
    pub last_committed: RecStats,
    /// Last value of `last_committed` persisted to the variable store.
    pub last_committed_persisted: Watermark,
    /// Last record acknowledged (cleared) on the upstream server.
    pub last_cleared: RecStats,
}

/// The slice of stream state shared between the reader task and the
/// pipeline workers running the completion callback.
#[derive(Debug, Default)]
pub struct CommitState {
    pub wm: tokio::sync::Mutex<CommitWatermarks>,
    /// Mirror of `last_pushed.rec_id`, read by the callback to refuse
    /// clearing past anything not yet pushed.
    pub last_pushed_id: AtomicU64,
}

// ── Stream state ───────────────────────────────────────────────────────────

/// All state for one change-log stream.
pub struct StreamState {
    pub def: StreamDef,
    /// Stream name shared with work items.
    pub name: Arc<str>,

    /// Last record pulled from the source.
    pub last_read: RecStats,
    /// Last record handed to the pipeline.
    pub last_pushed: RecStats,
    /// Commit-side watermarks, shared with the pipeline workers.
    pub commit: Arc<CommitState>,

    pub counters: StreamCounters,
    pub queue: OpQueue,
    pub pending_rename: PendingRename,
    pub caps: ServerCapabilities,

    /// Times the stream had to be reconnected.
    pub nb_reopen: u32,
    /// `nb_reopen` at the last stat report, for status derivation.
    pub reopen_at_report: u32,
    /// When stats were last persisted.
    pub last_report: DateTime<Utc>,
    /// The reader observed the stop request and is flushing.
    pub stopping: bool,
}

impl StreamState {
    pub fn new(def: StreamDef, cfg: &ReaderConfig) -> Self {
        let name: Arc<str> = def.name.as_str().into();
        StreamState {
            def,
            name,
            last_read: RecStats::default(),
            last_pushed: RecStats::default(),
            commit: Arc::new(CommitState::default()),
            counters: StreamCounters::default(),
            queue: OpQueue::new(),
            pending_rename: PendingRename::default(),
            caps: ServerCapabilities::new(cfg.server_has_rename_last, cfg.server_has_last_exists),
            nb_reopen: 0,
            reopen_at_report: 0,
            last_report: Utc::now(),
            stopping: false,
        }
    }
}
