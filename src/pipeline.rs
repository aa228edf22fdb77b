//! Entry-pipeline interface.
//!
//! The multi-stage entry pipeline that applies committed metadata changes
//! to the shadow database is an external collaborator. The ingestion core
//! only produces well-formed [`WorkItem`]s for it and consumes its
//! completion callbacks.
//!
//! # Completion contract
//!
//! For every pushed work item the pipeline invokes the attached
//! [`CommitSink`] exactly once, with its database session, after the
//! record's effects are durably committed. Within one stream, completions
//! arrive in non-decreasing ack-id order; the pipeline is free to reorder
//! across streams and across unrelated objects.

use async_trait::async_trait;
use std::sync::Arc;

use crate::db::VarStore;
use crate::error::FsMirrorError;
use crate::record::{ChangeRecord, FileId};

// ── Rewrite hints ──────────────────────────────────────────────────────────

/// Per-operation processing hints produced by the record rewriter and the
/// staging step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpHints {
    /// The unlinked object may still have other links; the pipeline must
    /// check the previous link count in the database.
    pub check_if_last: bool,
    /// The record's object id is not usable; the pipeline must look the
    /// object up by parent and name.
    pub get_fid_from_db: bool,
    /// The record was synthesized by the rewriter rather than read from
    /// the source.
    pub locally_allocated: bool,
}

// ── Work item ──────────────────────────────────────────────────────────────

/// One unit of work handed to the entry pipeline.
#[derive(Default)]
pub struct WorkItem {
    /// Pipeline-defined stage cursor. `allocate()` presets it to the
    /// pipeline's get-info-from-DB stage.
    pub stage: u32,
    /// This item originated from a change record (always true for items
    /// produced by the ingestion core).
    pub from_changelog: bool,
    /// The raw change record; owned by the item once pushed.
    pub record: Option<ChangeRecord>,
    /// Highest record id retired when this item is acknowledged. Starts
    /// at the record's own id and grows when suppressed records merge
    /// into it.
    pub ack_id: u64,
    /// Originating stream name.
    pub stream: Arc<str>,
    /// Target object id, unset when `hints.get_fid_from_db`.
    pub entry_id: Option<FileId>,
    /// Parent directory, used by the pipeline for stage locking.
    pub parent_id: Option<FileId>,
    /// Name within `parent_id`.
    pub name: Option<String>,
    pub hints: OpHints,
    /// Invoked by the pipeline exactly once, after durable commit.
    pub completion: Option<Arc<dyn CommitSink>>,
}

impl std::fmt::Debug for WorkItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkItem")
            .field("stage", &self.stage)
            .field("from_changelog", &self.from_changelog)
            .field("record", &self.record)
            .field("ack_id", &self.ack_id)
            .field("stream", &self.stream)
            .field("entry_id", &self.entry_id)
            .field("hints", &self.hints)
            .finish_non_exhaustive()
    }
}

// ── Completion sink ────────────────────────────────────────────────────────

/// Receiver of durable-commit notifications.
#[async_trait]
pub trait CommitSink: Send + Sync {
    /// Called once per pushed item after its effects are durable.
    async fn record_committed(
        &self,
        db: &dyn VarStore,
        item: &WorkItem,
    ) -> Result<(), FsMirrorError>;
}

// ── Pipeline trait ─────────────────────────────────────────────────────────

/// The external entry-processing pipeline, as consumed by the core.
#[async_trait]
pub trait EntryPipeline: Send + Sync {
    /// Produce a blank work item with the stage cursor preset.
    fn allocate(&self) -> WorkItem;

    /// Assign the entry id used for pipeline-stage locking.
    fn set_entry_id(&self, item: &mut WorkItem, id: FileId);

    /// Accept ownership of a work item. The intake is bounded; the call
    /// waits under backpressure.
    async fn push(&self, item: WorkItem) -> Result<(), FsMirrorError>;

    /// Drain pending work. With `flush` set, every accepted item is
    /// processed (and its callback invoked) before this returns.
    async fn terminate(&self, flush: bool) -> Result<(), FsMirrorError>;
}
