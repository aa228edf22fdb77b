//! Durable-commit callback and the upstream acknowledgment protocol.
//!
//! The pipeline invokes [`CommitHandler`] once per pushed work item after
//! the item's effects are durably committed. The handler advances
//! `last_committed`, persists it on a delta/delay policy so a restart
//! replays only a bounded window, and releases records on the upstream
//! server in batches.
//!
//! # Clear policy
//!
//! A clear releases every upstream record with id `≤ last_committed`.
//! Fire when any of:
//! - the batch size is 1 (acknowledge everything immediately),
//! - the commit caught up with everything ever pushed,
//! - at least `batch_ack_count` records committed since the last clear.
//!
//! After a successful clear, `last_committed` is persisted
//! unconditionally so a restart can never acknowledge the same records
//! twice.
//!
//! Clearing never uses an id beyond `last_pushed`: commits only refer to
//! pushed records, and the batching test above explicitly defers while
//! the commit id is behind the last push.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::sync::atomic::Ordering;

use crate::db::{self, VarStore};
use crate::error::FsMirrorError;
use crate::pipeline::{CommitSink, WorkItem};
use crate::source::ChangelogEndpoint;
use crate::stream::{CommitState, CommitWatermarks};

/// Per-stream commit handler; one per reader, shared with the pipeline
/// through the work items' completion slot.
pub struct CommitHandler {
    stream: Arc<str>,
    reader_id: String,
    state: Arc<CommitState>,
    endpoint: Arc<dyn ChangelogEndpoint>,

    batch_ack_count: u64,
    update_max_delta: u64,
    update_max_delay_secs: i64,
}

impl CommitHandler {
    pub fn new(
        stream: Arc<str>,
        reader_id: String,
        state: Arc<CommitState>,
        endpoint: Arc<dyn ChangelogEndpoint>,
        batch_ack_count: u64,
        update_max_delta: u64,
        update_max_delay_secs: i64,
    ) -> Self {
        CommitHandler {
            stream,
            reader_id,
            state,
            endpoint,
            batch_ack_count,
            update_max_delta,
            update_max_delay_secs,
        }
    }

    /// Persist `last_committed` so a restart does not replay records the
    /// database already holds. Unless forced, skips while the persisted
    /// copy is close enough in both record distance and wall time.
    ///
    /// Returns whether the value was persisted.
    async fn persist_last_committed(
        &self,
        db: &dyn VarStore,
        wm: &mut CommitWatermarks,
        force: bool,
        now: DateTime<Utc>,
    ) -> bool {
        let committed = wm.last_committed.mark;
        let delta_id = committed.rec_id - wm.last_committed_persisted.rec_id;
        let delta_secs = (now - wm.last_committed_persisted.step_time).num_seconds();

        if !force && delta_id < self.update_max_delta && delta_secs < self.update_max_delay_secs {
            return false;
        }

        if let Err(e) =
            db::store_watermark(db, db::VAR_LAST_COMMITTED, &self.stream, &committed).await
        {
            // The next callback retries; the persistence watermark stays.
            tracing::error!(
                stream = %self.stream,
                error = %e,
                "failed to persist last-committed record"
            );
            return false;
        }

        wm.last_committed_persisted =
            crate::watermark::Watermark::new(committed.rec_id, committed.rec_time, now);
        true
    }

    /// Acknowledge everything committed so far on the upstream server.
    async fn clear_records(
        &self,
        wm: &mut CommitWatermarks,
        now: DateTime<Utc>,
    ) -> Result<(), FsMirrorError> {
        let committed = wm.last_committed.mark;
        if committed.rec_id == 0 {
            // Clearing record 0 would discard every record upstream.
            return Ok(());
        }

        tracing::debug!(
            stream = %self.stream,
            reader_id = %self.reader_id,
            rec_id = committed.rec_id,
            "acknowledging change-log records"
        );

        if let Err(e) = self.endpoint.clear(&self.reader_id, committed.rec_id).await {
            // Records stay on the server; the next callback retries.
            tracing::error!(
                stream = %self.stream,
                reader_id = %self.reader_id,
                rec_id = committed.rec_id,
                error = %e,
                "upstream clear failed"
            );
            return Err(e.into());
        }

        wm.last_cleared
            .observe(committed.rec_id, committed.rec_time, now);
        Ok(())
    }

    /// Final acknowledgment of any remaining committed records, used at
    /// shutdown after the pipeline drained.
    pub async fn clear_remaining(&self, db: &dyn VarStore) -> Result<(), FsMirrorError> {
        let now = Utc::now();
        let mut wm = self.state.wm.lock().await;
        let rc = self.clear_records(&mut wm, now).await;
        if wm.last_committed.mark.rec_id != 0 {
            self.persist_last_committed(db, &mut wm, true, now).await;
        }
        rc
    }
}

#[async_trait]
impl CommitSink for CommitHandler {
    async fn record_committed(
        &self,
        db: &dyn VarStore,
        item: &WorkItem,
    ) -> Result<(), FsMirrorError> {
        let Some(rec) = &item.record else {
            tracing::error!(
                stream = %self.stream,
                "commit callback invoked for a work item without a change record"
            );
            return Err(FsMirrorError::Internal(
                "commit callback without change record".to_string(),
            ));
        };
        if !item.from_changelog {
            tracing::error!(
                stream = %self.stream,
                "commit callback invoked for a non-changelog work item"
            );
            return Err(FsMirrorError::Internal(
                "commit callback for non-changelog item".to_string(),
            ));
        }

        let now = Utc::now();
        let mut wm = self.state.wm.lock().await;

        wm.last_committed.observe(item.ack_id, rec.rec_time, now);

        let saved = self.persist_last_committed(db, &mut wm, false, now).await;

        // Batched acknowledgment: defer unless every record is acked
        // individually, the commit caught up with the last push, or the
        // batch is full.
        let committed = wm.last_committed.mark.rec_id;
        let last_pushed = self.state.last_pushed_id.load(Ordering::Acquire);
        if self.batch_ack_count > 1
            && committed < last_pushed
            && committed - wm.last_cleared.mark.rec_id < self.batch_ack_count
        {
            tracing::trace!(
                stream = %self.stream,
                committed,
                last_cleared = wm.last_cleared.mark.rec_id,
                last_pushed,
                "deferring upstream clear"
            );
            return Ok(());
        }

        let rc = self.clear_records(&mut wm, now).await;

        // Always persist after clearing; a restart must never replay ids
        // the server already discarded.
        if !saved {
            self.persist_last_committed(db, &mut wm, true, now).await;
        }

        rc
    }
}
