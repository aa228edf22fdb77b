//! fsmirror — change-log ingestion for a parallel-filesystem metadata
//! mirror.
//!
//! A metadata mirror keeps a database shadow of filesystem state, fed by
//! a full namespace scan and by the live metadata change-log of each
//! metadata server. This crate is the change-log side: one reader task
//! per server pulls change records, coalesces redundant records per
//! object, normalizes rename/extension pairs, and feeds an external
//! entry-processing pipeline. Records are released on the upstream
//! server only after the database confirmed them, in batches, so the
//! at-least-once source becomes at-most-once at the acknowledgment
//! boundary.
//!
//! # Architecture
//!
//! - [`service::ChangelogReaders`] — lifecycle: start / terminate / join /
//!   done, one reader task per configured stream.
//! - [`reader`] — the per-stream loop: drain checks, pull, classify,
//!   reopen at `last_read + 1` on end-of-stream.
//! - [`coalesce::OpQueue`] — per-object suppression and age/size-driven
//!   drainage in arrival order.
//! - [`rewrite`] — rename/extension normalization, synthesized unlinks
//!   for overwritten targets, server capability discovery.
//! - [`commit::CommitHandler`] — the durable-commit callback: watermark
//!   advance, persistence policy, batched upstream clear.
//!
//! # Collaborators
//!
//! The upstream source ([`source::ChangelogEndpoint`]), the entry
//! pipeline ([`pipeline::EntryPipeline`]), and the variable store
//! ([`db::VarStore`]) are traits; the embedding daemon supplies the
//! implementations.

pub mod coalesce;
pub mod commit;
pub mod config;
pub mod db;
pub mod error;
pub mod pipeline;
pub mod reader;
pub mod record;
pub mod rewrite;
pub mod service;
pub mod source;
pub mod stats;
pub mod stream;
pub mod watermark;

pub use config::{ReaderConfig, StreamDef};
pub use error::{FsMirrorError, SourceError};
pub use record::{ChangeRecord, FileId, RecordKind};
pub use service::{ChangelogReaders, RunMode};
pub use watermark::Watermark;
