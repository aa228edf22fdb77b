//! Upstream change-log source interface.
//!
//! Each metadata server exposes an ordered stream of change records. A
//! [`ChangelogEndpoint`] names one such server; [`ChangelogEndpoint::open`]
//! yields a [`ChangelogHandle`] positioned at a starting record id, and
//! [`ChangelogEndpoint::clear`] acknowledges consumed records so the
//! server can discard them.
//!
//! Records stay on the server until cleared: reopening a handle at
//! `last_committed + 1` after a restart replays everything that was not
//! yet durably applied, which is what gives the core its at-least-once
//! delivery guarantee.

use async_trait::async_trait;

use crate::error::SourceError;
use crate::record::ChangeRecord;

/// Result of one pull from an open change-log handle.
#[derive(Debug)]
pub enum RecvOutcome {
    /// The next record in id order.
    Record(ChangeRecord),
    /// No further records are available right now. In follow mode the
    /// reader reopens after a short sleep; in one-shot mode it stops.
    Eof,
}

/// An open, positioned change-log stream.
#[async_trait]
pub trait ChangelogHandle: Send {
    /// Pull the next record. Blocks in follow mode until a record or an
    /// error arrives.
    async fn recv(&mut self) -> Result<RecvOutcome, SourceError>;

    /// Release the handle and its input buffers.
    async fn close(&mut self) -> Result<(), SourceError>;
}

/// One metadata server's change-log endpoint.
#[async_trait]
pub trait ChangelogEndpoint: Send + Sync {
    /// Open the stream at `start_rec`. With `follow` set the server keeps
    /// the handle blocked at end-of-stream instead of reporting EOF.
    async fn open(
        &self,
        start_rec: u64,
        follow: bool,
    ) -> Result<Box<dyn ChangelogHandle>, SourceError>;

    /// Discard records with id `<= rec_id` on the server, on behalf of
    /// the consumer identified by `reader_id`.
    async fn clear(&self, reader_id: &str, rec_id: u64) -> Result<(), SourceError>;
}
