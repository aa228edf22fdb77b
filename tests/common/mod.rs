//! Shared test helpers: a scripted change-log source, a pipeline
//! simulator with controllable commit timing, and assertion helpers.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Mutex as AsyncMutex;

use fsmirror::config::{ReaderConfig, StreamDef};
use fsmirror::db::VarStore;
use fsmirror::error::{FsMirrorError, SourceError};
use fsmirror::pipeline::{EntryPipeline, WorkItem};
use fsmirror::record::{ChangeRecord, FileId, RecordKind};
use fsmirror::source::{ChangelogEndpoint, ChangelogHandle, RecvOutcome};
use fsmirror::stream::StreamState;

#[allow(dead_code)]
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_test_writer()
        .try_init();
}

// ── Record builders ────────────────────────────────────────────────────────

pub fn ts(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).unwrap()
}

pub fn fid(n: u32) -> FileId {
    FileId::new(0x200000401, n, 0)
}

pub fn rec(id: u64, kind: RecordKind, target: FileId) -> ChangeRecord {
    ChangeRecord::new(id, kind, target, ts(id as i64))
}

/// A config with one stream and thresholds that keep drainage out of the
/// way unless a test asks for it.
#[allow(dead_code)]
pub fn one_stream_config() -> ReaderConfig {
    ReaderConfig {
        streams: vec![StreamDef {
            name: "meta0000".to_string(),
            reader_id: "cl1".to_string(),
        }],
        batch_ack_count: 1,
        queue_max_size: 10_000,
        queue_max_age_secs: 3_600,
        queue_check_interval_secs: 3_600,
        ..ReaderConfig::default()
    }
}

// ── Scripted source ────────────────────────────────────────────────────────

/// One scripted event from the simulated server.
pub enum SimEvent {
    Rec(ChangeRecord),
    Eof,
    Err(SourceError),
}

/// A simulated metadata server: a shared event script consumed across
/// handle reopens, with every `open` and `clear` call recorded.
pub struct SimEndpoint {
    script: Arc<Mutex<VecDeque<SimEvent>>>,
    pub opens: Mutex<Vec<(u64, bool)>>,
    pub clears: Mutex<Vec<(String, u64)>>,
    fail_clear: AtomicBool,
}

impl SimEndpoint {
    pub fn new(script: Vec<SimEvent>) -> Arc<Self> {
        Arc::new(SimEndpoint {
            script: Arc::new(Mutex::new(script.into())),
            opens: Mutex::new(Vec::new()),
            clears: Mutex::new(Vec::new()),
            fail_clear: AtomicBool::new(false),
        })
    }

    #[allow(dead_code)]
    pub fn from_records(records: Vec<ChangeRecord>) -> Arc<Self> {
        Self::new(records.into_iter().map(SimEvent::Rec).collect())
    }

    #[allow(dead_code)]
    pub fn set_fail_clear(&self, fail: bool) {
        self.fail_clear.store(fail, Ordering::Relaxed);
    }

    pub fn script_len(&self) -> usize {
        self.script.lock().unwrap().len()
    }

    #[allow(dead_code)]
    pub fn clear_ids(&self) -> Vec<u64> {
        self.clears.lock().unwrap().iter().map(|(_, id)| *id).collect()
    }

    #[allow(dead_code)]
    pub fn last_clear_id(&self) -> Option<u64> {
        self.clears.lock().unwrap().last().map(|(_, id)| *id)
    }
}

pub struct SimHandle {
    script: Arc<Mutex<VecDeque<SimEvent>>>,
    start_rec: u64,
}

#[async_trait]
impl ChangelogHandle for SimHandle {
    async fn recv(&mut self) -> Result<RecvOutcome, SourceError> {
        loop {
            let event = self.script.lock().unwrap().pop_front();
            match event {
                Some(SimEvent::Rec(rec)) if rec.rec_id < self.start_rec => {
                    // Already acknowledged in a previous run; the server
                    // would not replay it at this cursor.
                    continue;
                }
                Some(SimEvent::Rec(rec)) => return Ok(RecvOutcome::Record(rec)),
                Some(SimEvent::Eof) => return Ok(RecvOutcome::Eof),
                Some(SimEvent::Err(e)) => return Err(e),
                // Script exhausted: behave like a follow-mode stream with
                // no new activity. The reader's stop signal interrupts us.
                None => futures_util::future::pending::<()>().await,
            }
        }
    }

    async fn close(&mut self) -> Result<(), SourceError> {
        Ok(())
    }
}

#[async_trait]
impl ChangelogEndpoint for SimEndpoint {
    async fn open(
        &self,
        start_rec: u64,
        follow: bool,
    ) -> Result<Box<dyn ChangelogHandle>, SourceError> {
        self.opens.lock().unwrap().push((start_rec, follow));
        Ok(Box::new(SimHandle {
            script: self.script.clone(),
            start_rec,
        }))
    }

    async fn clear(&self, reader_id: &str, rec_id: u64) -> Result<(), SourceError> {
        if self.fail_clear.load(Ordering::Relaxed) {
            return Err(SourceError::Io("injected clear failure".into()));
        }
        self.clears
            .lock()
            .unwrap()
            .push((reader_id.to_string(), rec_id));
        Ok(())
    }
}

// ── Pipeline simulator ─────────────────────────────────────────────────────

/// Pipeline double. In automatic mode every pushed item's callback runs
/// inside `push`, preserving intra-stream order trivially. In manual mode
/// items are buffered and the test drives commits one at a time;
/// `terminate(flush)` commits whatever remains.
pub struct SimPipeline {
    store: Arc<dyn VarStore>,
    auto_commit: bool,
    buffered: AsyncMutex<VecDeque<WorkItem>>,
    /// Ack ids in push order.
    pub pushed: Mutex<Vec<u64>>,
    /// Clones of the pushed records, for shape assertions.
    pub records: Mutex<Vec<ChangeRecord>>,
    /// Hints of the pushed items, parallel to `records`.
    pub hints: Mutex<Vec<fsmirror::pipeline::OpHints>>,
    /// Completion callbacks delivered (exactly-once check).
    pub callbacks: Mutex<Vec<u64>>,
}

impl SimPipeline {
    fn build(store: Arc<dyn VarStore>, auto_commit: bool) -> Arc<Self> {
        Arc::new(SimPipeline {
            store,
            auto_commit,
            buffered: AsyncMutex::new(VecDeque::new()),
            pushed: Mutex::new(Vec::new()),
            records: Mutex::new(Vec::new()),
            hints: Mutex::new(Vec::new()),
            callbacks: Mutex::new(Vec::new()),
        })
    }

    pub fn new(store: Arc<dyn VarStore>) -> Arc<Self> {
        Self::build(store, true)
    }

    /// Buffer pushed items until the test commits them explicitly.
    #[allow(dead_code)]
    pub fn manual(store: Arc<dyn VarStore>) -> Arc<Self> {
        Self::build(store, false)
    }

    pub fn pushed_ids(&self) -> Vec<u64> {
        self.pushed.lock().unwrap().clone()
    }

    pub fn pushed_records(&self) -> Vec<ChangeRecord> {
        self.records.lock().unwrap().clone()
    }

    #[allow(dead_code)]
    pub fn callback_count(&self) -> usize {
        self.callbacks.lock().unwrap().len()
    }

    async fn commit(&self, item: WorkItem) -> Result<(), FsMirrorError> {
        let sink = item
            .completion
            .clone()
            .expect("pushed item without completion callback");
        self.callbacks.lock().unwrap().push(item.ack_id);
        sink.record_committed(&*self.store, &item).await
    }

    /// Commit the oldest buffered item (manual mode).
    #[allow(dead_code)]
    pub async fn commit_one(&self) -> Result<(), FsMirrorError> {
        let item = self
            .buffered
            .lock()
            .await
            .pop_front()
            .expect("no buffered work item to commit");
        self.commit(item).await
    }

    #[allow(dead_code)]
    pub async fn buffered_len(&self) -> usize {
        self.buffered.lock().await.len()
    }
}

#[async_trait]
impl EntryPipeline for SimPipeline {
    fn allocate(&self) -> WorkItem {
        WorkItem::default()
    }

    fn set_entry_id(&self, item: &mut WorkItem, id: FileId) {
        item.entry_id = Some(id);
    }

    async fn push(&self, item: WorkItem) -> Result<(), FsMirrorError> {
        self.pushed.lock().unwrap().push(item.ack_id);
        if let Some(rec) = &item.record {
            self.records.lock().unwrap().push(rec.clone());
        }
        self.hints.lock().unwrap().push(item.hints);

        if self.auto_commit {
            // Commit failures (e.g. an injected clear error) are the
            // callback's business, not a push failure.
            let _ = self.commit(item).await;
        } else {
            self.buffered.lock().await.push_back(item);
        }
        Ok(())
    }

    async fn terminate(&self, flush: bool) -> Result<(), FsMirrorError> {
        if flush {
            loop {
                let item = self.buffered.lock().await.pop_front();
                match item {
                    Some(item) => {
                        let _ = self.commit(item).await;
                    }
                    None => break,
                }
            }
        }
        Ok(())
    }
}

// ── Assertions ─────────────────────────────────────────────────────────────

/// Check the per-stream watermark chain:
/// `cleared ≤ persisted ≤ committed ≤ pushed ≤ read`.
#[allow(dead_code)]
pub async fn assert_watermark_chain(st: &StreamState) {
    let wm = st.commit.wm.lock().await;
    let cleared = wm.last_cleared.mark.rec_id;
    let persisted = wm.last_committed_persisted.rec_id;
    let committed = wm.last_committed.mark.rec_id;
    let pushed = st.last_pushed.mark.rec_id;
    let read = st.last_read.mark.rec_id;

    assert!(cleared <= persisted, "cleared {cleared} > persisted {persisted}");
    assert!(persisted <= committed, "persisted {persisted} > committed {committed}");
    assert!(committed <= pushed, "committed {committed} > pushed {pushed}");
    // Suppression merges can push the ack id up to the id of a record
    // that was itself suppressed, but never past the last read record.
    assert!(pushed <= read, "pushed {pushed} > read {read}");
}

/// Poll `cond` until it holds or the timeout elapses.
#[allow(dead_code)]
pub async fn wait_until<F: FnMut() -> bool>(mut cond: F, what: &str) {
    for _ in 0..2_000 {
        if cond() {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Wait until the reader of `stream` pulled `n` records.
#[allow(dead_code)]
pub async fn wait_for_reads(readers: &fsmirror::service::ChangelogReaders, stream: usize, n: u64) {
    let state = readers.stream_state(stream).expect("stream index");
    for _ in 0..2_000 {
        if state.lock().await.counters.nb_read >= n {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {n} records to be read");
}
