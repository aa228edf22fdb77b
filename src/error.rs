//! Error types for fsmirror.
//!
//! All errors produced by the ingestion core are represented by
//! [`FsMirrorError`]. Errors are propagated via `Result<T, FsMirrorError>`
//! throughout the crate; nothing is thrown across task boundaries.
//!
//! # Error Classification
//!
//! Source-side errors carry a classification that determines how a reader
//! reacts:
//! - **Reopenable** — end of stream, source disconnected, kernel channel
//!   protocol errors. The reader closes the handle and reopens it at
//!   `last_read + 1` (or stops, in one-shot mode).
//! - **Transient** — interrupts and unclassified I/O errors. The reader
//!   sleeps briefly and retries without touching any watermark.
//! - **Fatal** — the reader logs and stops.
//!
//! Database and upstream-clear failures are never fatal: the failed write
//! is retried by a later callback, and the affected watermark is simply
//! not advanced.

/// Errors raised by the upstream change-log source.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    // ── Reopenable — close, sleep, reopen at last_read + 1 ───────────────
    /// The source endpoint went away (e.g. filesystem unmounted).
    #[error("source disconnected: {0}")]
    Disconnected(String),

    /// Error on the kernel notification channel carrying the records.
    #[error("kernel channel error: {0}")]
    Channel(String),

    // ── Transient — sleep briefly and retry the pull ─────────────────────
    /// The pull was interrupted before a record arrived.
    #[error("receive interrupted")]
    Interrupted,

    /// An unclassified I/O error from the source.
    #[error("source I/O error: {0}")]
    Io(String),

    // ── Fatal — log and stop the reader ──────────────────────────────────
    /// The source reported an unrecoverable condition.
    #[error("fatal source error: {0}")]
    Fatal(String),
}

impl SourceError {
    /// Whether the reader should close and reopen the stream handle.
    pub fn is_reopenable(&self) -> bool {
        matches!(self, SourceError::Disconnected(_) | SourceError::Channel(_))
    }

    /// Whether the reader should retry the pull after a short sleep.
    pub fn is_transient(&self) -> bool {
        matches!(self, SourceError::Interrupted | SourceError::Io(_))
    }
}

/// Primary error type for the ingestion core.
#[derive(Debug, thiserror::Error)]
pub enum FsMirrorError {
    // ── Configuration errors ─────────────────────────────────────────────
    /// The reader configuration is invalid or could not be parsed.
    #[error("configuration error: {0}")]
    Config(String),

    // ── External collaborators ───────────────────────────────────────────
    /// An error from the upstream change-log source.
    #[error("changelog source error: {0}")]
    Source(#[from] SourceError),

    /// A variable-store (list manager) operation failed.
    #[error("database error: {0}")]
    Db(String),

    /// The entry pipeline refused or failed an operation.
    #[error("pipeline error: {0}")]
    Pipeline(String),

    // ── Data errors ──────────────────────────────────────────────────────
    /// A persisted variable value did not match the expected encoding.
    #[error("malformed variable value '{value}': {reason}")]
    VarFormat { value: String, reason: String },

    /// The change-log stream violated the record protocol
    /// (e.g. an unpaired rename/extension record).
    #[error("changelog protocol violation: {0}")]
    Protocol(String),

    // ── Internal errors — should not happen ──────────────────────────────
    /// An unexpected internal error. Indicates a bug.
    #[error("internal error: {0}")]
    Internal(String),
}

impl FsMirrorError {
    /// Whether the underlying condition warrants a stream reopen.
    pub fn is_reopenable(&self) -> bool {
        matches!(self, FsMirrorError::Source(e) if e.is_reopenable())
    }

    /// Whether the operation can be retried as-is after a short sleep.
    pub fn is_transient(&self) -> bool {
        match self {
            FsMirrorError::Source(e) => e.is_transient(),
            // Failed DB writes are retried by the next callback.
            FsMirrorError::Db(_) => true,
            _ => false,
        }
    }
}
