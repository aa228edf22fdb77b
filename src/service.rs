//! Lifecycle coordination for the change-log readers.
//!
//! [`ChangelogReaders`] owns one reader task per configured stream plus
//! the shared stop signal. The sequence an embedding daemon runs:
//!
//! 1. [`ChangelogReaders::start`] — recover each stream's last committed
//!    record from the variable store, open the source just past it, and
//!    spawn the readers.
//! 2. [`ChangelogReaders::terminate`] — raise the stop flag; readers
//!    observe it between pulls, flush their queue, and exit.
//! 3. [`ChangelogReaders::join`] — wait for every reader to exit.
//! 4. [`ChangelogReaders::done`] — drain the pipeline, perform the final
//!    acknowledgment of committed records, dump and store final stats.
//!
//! Opening at `last_committed + 1` after a restart replays every record
//! that was not durably applied, so delivery into the pipeline is
//! at-least-once while acknowledgment remains at-most-once.

use std::sync::Arc;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;

use crate::commit::CommitHandler;
use crate::config::ReaderConfig;
use crate::db::{self, VarStore};
use crate::error::FsMirrorError;
use crate::pipeline::EntryPipeline;
use crate::reader::StreamReader;
use crate::source::ChangelogEndpoint;
use crate::stats;
use crate::stream::StreamState;

/// Reader behavior at end-of-stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Keep the stream open (or reopen it) and wait for new records.
    Follow,
    /// Stop at end-of-stream; used for catch-up passes.
    Once,
}

struct StreamRuntime {
    state: Arc<Mutex<StreamState>>,
    endpoint: Arc<dyn ChangelogEndpoint>,
    sink: Arc<CommitHandler>,
    join: Option<JoinHandle<()>>,
    started: bool,
}

/// Coordinator for every configured change-log reader.
pub struct ChangelogReaders {
    cfg: Arc<ReaderConfig>,
    pipeline: Arc<dyn EntryPipeline>,
    store: Arc<dyn VarStore>,
    streams: Vec<StreamRuntime>,
    stop_tx: watch::Sender<bool>,
}

impl ChangelogReaders {
    /// Build the coordinator. `endpoints` pairs with `cfg.streams` by
    /// index.
    pub fn new(
        cfg: ReaderConfig,
        endpoints: Vec<Arc<dyn ChangelogEndpoint>>,
        pipeline: Arc<dyn EntryPipeline>,
        store: Arc<dyn VarStore>,
    ) -> Result<Self, FsMirrorError> {
        cfg.validate()?;
        if endpoints.len() != cfg.streams.len() {
            return Err(FsMirrorError::Config(format!(
                "{} stream(s) configured but {} endpoint(s) supplied",
                cfg.streams.len(),
                endpoints.len()
            )));
        }

        let cfg = Arc::new(cfg);
        let (stop_tx, _) = watch::channel(false);

        let streams = cfg
            .streams
            .iter()
            .zip(endpoints)
            .map(|(def, endpoint)| {
                let state = StreamState::new(def.clone(), &cfg);
                let sink = Arc::new(CommitHandler::new(
                    state.name.clone(),
                    def.reader_id.clone(),
                    state.commit.clone(),
                    endpoint.clone(),
                    cfg.batch_ack_count,
                    cfg.commit_update_max_delta,
                    cfg.commit_update_max_delay_secs as i64,
                ));
                StreamRuntime {
                    state: Arc::new(Mutex::new(state)),
                    endpoint,
                    sink,
                    join: None,
                    started: false,
                }
            })
            .collect();

        Ok(ChangelogReaders {
            cfg,
            pipeline,
            store,
            streams,
            stop_tx,
        })
    }

    /// Open the sources and spawn the reader tasks. With `only` set,
    /// start a single stream by its index in the configuration.
    pub async fn start(&mut self, mode: RunMode, only: Option<usize>) -> Result<(), FsMirrorError> {
        if let Some(index) = only {
            if index >= self.streams.len() {
                return Err(FsMirrorError::Config(format!(
                    "stream index {index} exceeds the configured stream count {}",
                    self.streams.len()
                )));
            }
            tracing::info!(
                stream = %self.cfg.streams[index].name,
                "starting changelog reader for a single stream"
            );
        }

        let one_shot = mode == RunMode::Once;
        let follow = !(one_shot || self.cfg.force_polling);

        for (i, rt) in self.streams.iter_mut().enumerate() {
            if only.is_some_and(|index| index != i) {
                continue;
            }
            let def = &self.cfg.streams[i];

            // Retrieve from the first unacknowledged record.
            let start_rec = match db::load_last_committed(&*self.store, &def.name).await {
                Ok(Some(mark)) => mark.rec_id + 1,
                Ok(None) => 0,
                Err(e) => {
                    tracing::warn!(
                        stream = %def.name,
                        error = %e,
                        "could not recover last committed record, reading from the oldest"
                    );
                    0
                }
            };

            tracing::debug!(stream = %def.name, start_rec, "opening changelog");
            let handle = rt.endpoint.open(start_rec, follow).await.map_err(|e| {
                tracing::error!(stream = %def.name, error = %e, "error opening changelog");
                FsMirrorError::from(e)
            })?;

            let reader = StreamReader {
                cfg: self.cfg.clone(),
                state: rt.state.clone(),
                endpoint: rt.endpoint.clone(),
                pipeline: self.pipeline.clone(),
                sink: rt.sink.clone(),
                stop: self.stop_tx.subscribe(),
                one_shot,
            };
            rt.join = Some(tokio::spawn(reader.run(handle)));
            rt.started = true;
        }

        Ok(())
    }

    /// Ask every reader to stop. Readers flush their queue and exit;
    /// call [`ChangelogReaders::join`] to wait for them.
    pub fn terminate(&self) {
        let _ = self.stop_tx.send(true);
        tracing::info!("stop request sent to all changelog readers");
    }

    /// Wait for every reader task to exit.
    pub async fn join(&mut self) {
        for rt in &mut self.streams {
            if let Some(join) = rt.join.take() {
                if let Err(e) = join.await {
                    tracing::error!(error = %e, "changelog reader task failed");
                }
            }
        }
    }

    /// Drain the pipeline, release the last committed records upstream,
    /// and write final stats. Call after [`ChangelogReaders::join`].
    pub async fn done(&mut self) -> Result<(), FsMirrorError> {
        // Every pushed record must reach its commit callback before the
        // final acknowledgment, or committed work would be replayed on
        // the next start.
        self.pipeline.terminate(true).await?;

        for rt in self.streams.iter().filter(|rt| rt.started) {
            if let Err(e) = rt.sink.clear_remaining(&*self.store).await {
                tracing::error!(error = %e, "final changelog clear failed");
            }
        }

        self.dump_stats().await;
        self.store_stats().await?;
        Ok(())
    }

    /// Log the stat block of every started stream.
    pub async fn dump_stats(&self) {
        for rt in self.streams.iter().filter(|rt| rt.started) {
            let mut st = rt.state.lock().await;
            stats::dump_stream_stats(&self.cfg, &mut st).await;
        }
    }

    /// Checkpoint watermarks and counters of every started stream.
    pub async fn store_stats(&self) -> Result<(), FsMirrorError> {
        for rt in self.streams.iter().filter(|rt| rt.started) {
            let mut st = rt.state.lock().await;
            stats::store_stream_stats(&*self.store, &mut st).await?;
        }
        Ok(())
    }

    /// Shared state of one stream, for embedders that report on it.
    pub fn stream_state(&self, index: usize) -> Option<Arc<Mutex<StreamState>>> {
        self.streams.get(index).map(|rt| rt.state.clone())
    }
}
