//! Per-stream reader task.
//!
//! One reader per configured metadata server. The loop alternates between
//! draining the coalescing queue into the pipeline (when the queue is
//! full or its head has aged out) and pulling the next record from the
//! source. End-of-stream closes and reopens the handle at `last_read + 1`
//! (or stops, in one-shot mode); transient errors sleep and retry.
//!
//! A stop request is observed between pulls (a pull blocked in follow
//! mode is abandoned via the stop channel), after which the queue is
//! flushed unconditionally and the task exits.

use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::sync::{Mutex, watch};

use crate::coalesce::{StagedOp, Suppression};
use crate::commit::CommitHandler;
use crate::config::ReaderConfig;
use crate::error::SourceError;
use crate::pipeline::{CommitSink, EntryPipeline};
use crate::record::{ChangeRecord, FLAG_LAST_UNLINK, RecordKind};
use crate::rewrite::{self, RewriteEvent};
use crate::source::{ChangelogEndpoint, ChangelogHandle, RecvOutcome};
use crate::stream::StreamState;

/// How many staged ops to dump after a protocol violation.
const VIOLATION_DUMP_OPS: usize = 32;

/// Sleep before retrying after a transient error or a failed reopen.
const RETRY_SLEEP: Duration = Duration::from_secs(1);

pub(crate) struct StreamReader {
    pub cfg: Arc<ReaderConfig>,
    pub state: Arc<Mutex<StreamState>>,
    pub endpoint: Arc<dyn ChangelogEndpoint>,
    pub pipeline: Arc<dyn EntryPipeline>,
    pub sink: Arc<CommitHandler>,
    pub stop: watch::Receiver<bool>,
    /// Stop at end-of-stream instead of reopening.
    pub one_shot: bool,
}

impl StreamReader {
    /// Reader main loop. Consumes the task; `handle` is the stream opened
    /// by the coordinator at the recovery position.
    pub async fn run(mut self, mut handle: Box<dyn ChangelogHandle>) {
        let check_interval = ChronoDuration::seconds(self.cfg.queue_check_interval_secs as i64);
        let mut next_push_time = Utc::now() + check_interval;

        loop {
            if *self.stop.borrow() {
                break;
            }

            // Time to flush?
            let queue_len = self.state.lock().await.queue.len();
            let now = Utc::now();
            if queue_len >= self.cfg.queue_max_size || next_push_time <= now {
                self.drain_queue(false).await;
                next_push_time = Utc::now() + check_interval;
            }

            let outcome = tokio::select! {
                _ = self.stop.changed() => continue,
                outcome = handle.recv() => outcome,
            };

            match outcome {
                Ok(RecvOutcome::Record(rec)) => {
                    let mut st = self.state.lock().await;
                    let now = Utc::now();
                    st.last_read.observe(rec.rec_id, rec.rec_time, now);
                    st.counters.nb_read += 1;
                    self.process_record(&mut st, rec);
                }

                Ok(RecvOutcome::Eof) => {
                    if self.one_shot {
                        break;
                    }
                    match self.reopen(&mut handle, None).await {
                        Ok(()) => {}
                        Err(()) => break, // stop requested while reopening
                    }
                }

                Err(e) if e.is_reopenable() => {
                    if self.one_shot {
                        break;
                    }
                    match self.reopen(&mut handle, Some(&e)).await {
                        Ok(()) => {}
                        Err(()) => break,
                    }
                }

                Err(e) if e.is_transient() => {
                    let stream_name = self.stream_name().await;
                    tracing::warn!(
                        stream = %stream_name,
                        error = %e,
                        "transient source error, retrying"
                    );
                    tokio::time::sleep(RETRY_SLEEP).await;
                }

                Err(e) => {
                    let stream_name = self.stream_name().await;
                    tracing::error!(
                        stream = %stream_name,
                        error = %e,
                        "fatal source error, stopping reader"
                    );
                    break;
                }
            }
        }

        // Stopping: flush the internal queue.
        self.state.lock().await.stopping = true;
        self.drain_queue(true).await;

        if let Err(e) = handle.close().await {
            let stream_name = self.stream_name().await;
            tracing::error!(
                stream = %stream_name,
                error = %e,
                "error closing changelog"
            );
        }

        let stream_name = self.stream_name().await;
        tracing::info!(stream = %stream_name, "changelog reader terminating");
    }

    async fn stream_name(&self) -> Arc<str> {
        self.state.lock().await.name.clone()
    }

    /// Close, wait, and reopen the stream at `last_read + 1`. Fails only
    /// when a stop request arrives while waiting.
    async fn reopen(
        &mut self,
        handle: &mut Box<dyn ChangelogHandle>,
        error: Option<&SourceError>,
    ) -> Result<(), ()> {
        if let Err(e) = handle.close().await {
            let stream_name = self.stream_name().await;
            tracing::error!(
                stream = %stream_name,
                error = %e,
                "error closing changelog"
            );
        }

        let sleep = if self.cfg.force_polling {
            let stream_name = self.stream_name().await;
            tracing::debug!(
                stream = %stream_name,
                interval_secs = self.cfg.polling_interval_secs,
                "end of changelog, reopening after polling interval"
            );
            self.cfg.polling_interval()
        } else {
            let stream_name = self.stream_name().await;
            match error {
                Some(e) => tracing::warn!(
                    stream = %stream_name,
                    error = %e,
                    "source error, reopening in 1s"
                ),
                None => tracing::warn!(
                    stream = %stream_name,
                    "end of changelog reached in follow mode, reopening in 1s"
                ),
            }
            Duration::from_secs(1)
        };

        let (start_rec, follow) = {
            let mut st = self.state.lock().await;
            st.nb_reopen += 1;
            (
                st.last_read.mark.rec_id + 1,
                !(self.one_shot || self.cfg.force_polling),
            )
        };

        loop {
            if self.interruptible_sleep(sleep).await.is_err() {
                return Err(());
            }
            match self.endpoint.open(start_rec, follow).await {
                Ok(h) => {
                    *handle = h;
                    return Ok(());
                }
                Err(e) => {
                    let stream_name = self.stream_name().await;
                    tracing::warn!(
                        stream = %stream_name,
                        start_rec,
                        error = %e,
                        "failed to reopen changelog, retrying"
                    );
                }
            }
        }
    }

    /// Sleep that wakes early on a stop request (`Err`).
    async fn interruptible_sleep(&mut self, dur: Duration) -> Result<(), ()> {
        tokio::select! {
            _ = tokio::time::sleep(dur) => Ok(()),
            _ = self.stop.changed() => Err(()),
        }
    }

    /// Classify one pulled record: suppress, rewrite, stage.
    fn process_record(&self, st: &mut StreamState, rec: ChangeRecord) {
        tracing::trace!(stream = %st.name, record = %rec, "record");

        st.counters.per_kind[rec.kind as usize] += 1;

        // The record might be of interest, but drop it if it would only
        // duplicate a staged operation.
        match st.queue.check_suppression(&rec) {
            Suppression::Always | Suppression::Covered { .. } => {
                tracing::trace!(
                    stream = %st.name,
                    rec_id = rec.rec_id,
                    kind = %rec.kind,
                    "ignoring redundant record"
                );
                st.counters.suppressed += 1;
                return;
            }
            Suppression::None => {}
        }

        st.counters.interesting += 1;

        let result = rewrite::rewrite_record(&st.def.name, rec, &mut st.pending_rename, &st.caps);

        for event in &result.events {
            match event {
                RewriteEvent::PairingViolation => {
                    st.counters.pairing_violations += 1;
                    for staged in st.queue.recent_records(VIOLATION_DUMP_OPS) {
                        tracing::error!(stream = %st.name, record = %staged, "staged op");
                    }
                }
                RewriteEvent::UnlinkSynthesisFailed => {
                    st.counters.unlink_synthesis_failures += 1;
                }
                RewriteEvent::CapabilityUpgrade => {}
            }
        }

        let now = Utc::now();
        for em in result.emissions {
            st.queue.stage(StagedOp::new(em.record, now, em.hints));
        }
    }

    /// Push queue entries to the pipeline, oldest first, until the drain
    /// policy is satisfied (everything, when flushing on stop).
    async fn drain_queue(&self, push_all: bool) {
        tracing::trace!("processing changelog queue");
        let max_age = ChronoDuration::seconds(self.cfg.queue_max_age_secs as i64);
        let now = Utc::now();

        loop {
            let (op, stream, commit) = {
                let mut st = self.state.lock().await;
                let Some(op) =
                    st.queue
                        .pop_ready(now, self.cfg.queue_max_size, max_age, push_all)
                else {
                    break;
                };
                (op, st.name.clone(), st.commit.clone())
            };

            tracing::trace!(
                stream = %stream,
                rec_id = op.record.rec_id,
                age_secs = (now - op.arrival).num_seconds(),
                "pushing change-log record"
            );

            let mut item = self.pipeline.allocate();
            item.from_changelog = true;
            item.stream = stream.clone();
            item.ack_id = op.ack_id;
            item.hints = op.hints;

            // An unlink not flagged as the last link always needs the
            // previous link count checked in the database.
            if op.record.kind == RecordKind::Unlink && !op.record.has_flag(FLAG_LAST_UNLINK) {
                item.hints.check_if_last = true;
            }

            if !item.hints.get_fid_from_db {
                self.pipeline.set_entry_id(&mut item, op.record.target);
            }

            // Parent and name are used by the pipeline for stage locking.
            if op.record.name.is_some() {
                item.name = op.record.name.clone();
                match op.record.parent {
                    Some(parent) => item.parent_id = Some(parent),
                    None => tracing::warn!(
                        stream = %stream,
                        rec_id = op.record.rec_id,
                        kind = %op.record.kind,
                        "record has a name but no parent id"
                    ),
                }
            }

            item.completion = Some(self.sink.clone() as Arc<dyn CommitSink>);

            let (ack_id, rec_time) = (op.ack_id, op.record.rec_time);
            item.record = Some(op.record);

            // Advance the push watermark before handing the record over:
            // its commit callback may fire at any point afterwards.
            {
                let mut st = self.state.lock().await;
                st.last_pushed.observe(ack_id, rec_time, Utc::now());
                commit.last_pushed_id.store(ack_id, Ordering::Release);
            }

            if let Err(e) = self.pipeline.push(item).await {
                // The record id drops out of acknowledgment tracking; a
                // later, higher-id clear sweeps the upstream copy.
                tracing::error!(
                    stream = %stream,
                    rec_id = ack_id,
                    error = %e,
                    "failed to push work item to the pipeline, record skipped"
                );
            }
        }
    }
}
