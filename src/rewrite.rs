//! Rename/extension record rewriter.
//!
//! Servers report a rename in one of two shapes. Newer servers emit a
//! single extended `RENAME` record carrying the source parent, source
//! name, and source object id inline. Older servers emit a `RENAME`
//! followed (not necessarily contiguously) by an `EXT` record. Both
//! shapes may report that the target name already existed, in which case
//! the rename overwrote some object and the pipeline must see an explicit
//! unlink for it.
//!
//! The pipeline consumes the old two-record shape, so the rewriter
//! normalizes everything to it:
//! - an extended rename becomes a synthesized rename-from record plus the
//!   original record rewritten to `EXT`, both preceded by a synthesized
//!   unlink when a target was overwritten;
//! - a `RENAME`/`EXT` pair is held in a one-slot pending buffer until the
//!   `EXT` arrives, then released in order with the same unlink treatment.
//!
//! Synthesized records take id `original − 1` so acknowledging them never
//! releases the original record before it was processed.
//!
//! Server capabilities are discovered from observed record shape: the
//! first extended rename proves the server can tag last-link renames and
//! report overwritten targets, so both capability flags flip to true and
//! stay there.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::pipeline::OpHints;
use crate::record::{
    ChangeRecord, FLAG_HSM_EXISTS, FLAG_LAST_UNLINK, FLAG_RENAME_LAST, FLAG_RENAME_LAST_EXISTS,
    RecordKind,
};

// ── Server capabilities ────────────────────────────────────────────────────

/// What the metadata server is known to support, refined by observation.
/// Flags only ever flip from false to true.
#[derive(Debug, Default)]
pub struct ServerCapabilities {
    /// Renames carry last-link information (`FLAG_RENAME_LAST`).
    rename_last: AtomicBool,
    /// Renames report the overwritten target object.
    last_exists: AtomicBool,
}

impl ServerCapabilities {
    pub fn new(rename_last: bool, last_exists: bool) -> Self {
        ServerCapabilities {
            rename_last: AtomicBool::new(rename_last),
            last_exists: AtomicBool::new(last_exists),
        }
    }

    pub fn has_rename_last(&self) -> bool {
        self.rename_last.load(Ordering::Relaxed)
    }

    pub fn has_last_exists(&self) -> bool {
        self.last_exists.load(Ordering::Relaxed)
    }

    /// Record that an extended rename was seen. Returns true when this
    /// observation upgraded either flag.
    fn observe_extended_rename(&self) -> bool {
        let a = !self.rename_last.swap(true, Ordering::Relaxed);
        let b = !self.last_exists.swap(true, Ordering::Relaxed);
        a || b
    }

    /// Record that the server reported a real (or absent) overwritten
    /// target on an `EXT`. Returns true when this upgraded the flag.
    fn observe_last_exists(&self) -> bool {
        !self.last_exists.swap(true, Ordering::Relaxed)
    }
}

// ── Pending rename slot ────────────────────────────────────────────────────

/// The one-slot buffer holding a `RENAME` that awaits its paired `EXT`.
#[derive(Debug, Default)]
pub enum PendingRename {
    #[default]
    Idle,
    AwaitingExt(ChangeRecord),
}

// ── Rewrite output ─────────────────────────────────────────────────────────

/// One record to stage, with its processing hints.
#[derive(Debug)]
pub struct Emission {
    pub record: ChangeRecord,
    pub hints: OpHints,
}

/// Side observations the reader turns into counters and log dumps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RewriteEvent {
    /// Unpaired rename/extension record; the offender was discarded.
    PairingViolation,
    /// An overwritten target could not be materialized as an unlink.
    UnlinkSynthesisFailed,
    /// Observation upgraded a server capability flag.
    CapabilityUpgrade,
}

/// Result of rewriting one incoming record: the records to stage, in
/// order, plus any side observations.
#[derive(Debug, Default)]
pub struct RewriteResult {
    pub emissions: Vec<Emission>,
    pub events: Vec<RewriteEvent>,
}

// ── Flag translation ───────────────────────────────────────────────────────

/// Translate rename flags into unlink flags for a synthesized unlink,
/// deferring to the pipeline where the server lacks the capability.
pub fn rename_to_unlink_flags(flags: u32, caps: &ServerCapabilities, hints: &mut OpHints) -> u32 {
    let mut out = 0;

    if caps.has_rename_last() {
        if flags & FLAG_RENAME_LAST != 0 {
            out |= FLAG_LAST_UNLINK;
        }
        if flags & FLAG_RENAME_LAST_EXISTS != 0 {
            out |= FLAG_HSM_EXISTS;
        }
    } else {
        // The server doesn't tag last-link renames; the pipeline has to
        // check the previous link count itself.
        hints.check_if_last = true;
    }

    if !caps.has_last_exists() {
        // The server doesn't report which object the rename removed; the
        // pipeline has to resolve it from the database.
        hints.get_fid_from_db = true;
    }

    out
}

// ── Synthesis ──────────────────────────────────────────────────────────────

/// Build the fake unlink for a rename that overwrote its target.
///
/// `rec_in` is the record carrying the target information: the extended
/// `RENAME` in the single-record shape, the `EXT` in the two-record
/// shape. The unlink takes id `rec_in.rec_id − 1` so its acknowledgment
/// never outruns the record it was derived from.
fn synthesize_unlink(
    stream: &str,
    rec_in: &ChangeRecord,
    caps: &ServerCapabilities,
) -> Result<Emission, RewriteEvent> {
    let Some(name) = rec_in.name.clone() else {
        tracing::error!(
            stream,
            rec_id = rec_in.rec_id,
            "rename overwrote {} but carries no target name, cannot synthesize its unlink",
            rec_in.target,
        );
        return Err(RewriteEvent::UnlinkSynthesisFailed);
    };

    let mut hints = OpHints {
        locally_allocated: true,
        ..OpHints::default()
    };

    let mut rec = ChangeRecord::new(
        rec_in.rec_id.saturating_sub(1),
        RecordKind::Unlink,
        rec_in.target,
        rec_in.rec_time,
    );
    rec.flags = rename_to_unlink_flags(rec_in.flags, caps, &mut hints);
    rec.parent = rec_in.parent;
    rec.name = Some(name);

    tracing::debug!(
        stream,
        rec_id = rec.rec_id,
        object = %rec.target,
        name = rec.name.as_deref().unwrap_or(""),
        flags = rec.flags,
        "synthesized unlink for overwritten rename target"
    );

    Ok(Emission { record: rec, hints })
}

/// Build the old-fashioned rename-from record for an extended rename, so
/// the pipeline can remove the source path before it adds the target.
fn synthesize_rename_from(rec_in: &ChangeRecord) -> Emission {
    let ext = rec_in
        .rename
        .as_ref()
        .expect("extended rename without payload");

    let mut rec = ChangeRecord::new(
        // Not acknowledged until both halves are processed; retire n−1.
        rec_in.rec_id.saturating_sub(1),
        RecordKind::Rename,
        ext.source_fid,
        rec_in.rec_time,
    );
    rec.parent = Some(ext.source_parent);
    rec.name = Some(ext.source_name.clone());

    Emission {
        record: rec,
        hints: OpHints {
            locally_allocated: true,
            ..OpHints::default()
        },
    }
}

// ── Rewriter ───────────────────────────────────────────────────────────────

/// Rewrite one incoming record into the records to stage.
///
/// Keeping the output declarative lets the reader iterate and stage the
/// emissions without re-entering the rewriter.
pub fn rewrite_record(
    stream: &str,
    mut rec: ChangeRecord,
    pending: &mut PendingRename,
    caps: &ServerCapabilities,
) -> RewriteResult {
    let mut out = RewriteResult::default();

    match rec.kind {
        RecordKind::Rename => {
            if let PendingRename::AwaitingExt(stale) = std::mem::take(pending) {
                // Should never happen.
                tracing::error!(
                    stream,
                    pending = %stale,
                    incoming = %rec,
                    "got two RENAME records in a row without an EXT, discarding the pending one"
                );
                out.events.push(RewriteEvent::PairingViolation);
            }

            if rec.is_extended_rename() {
                // The server sent an extended record, so it has both
                // rename capabilities.
                if caps.observe_extended_rename() {
                    tracing::info!(
                        stream,
                        "server emits extended rename records, enabling rename capabilities"
                    );
                    out.events.push(RewriteEvent::CapabilityUpgrade);
                }

                if !rec.target.is_zero() {
                    match synthesize_unlink(stream, &rec, caps) {
                        Ok(em) => out.emissions.push(em),
                        Err(ev) => out.events.push(ev),
                    }
                }

                out.emissions.push(synthesize_rename_from(&rec));

                // The original becomes the rename-to half: EXT pointed at
                // the renamed object instead of the overwritten one.
                let source_fid = rec
                    .rename
                    .as_ref()
                    .expect("extended rename without payload")
                    .source_fid;
                rec.kind = RecordKind::Ext;
                rec.target = source_fid;
                out.emissions.push(Emission {
                    record: rec,
                    hints: OpHints::default(),
                });
            } else {
                // Two-record shape: hold the rename until its EXT shows up.
                *pending = PendingRename::AwaitingExt(rec);
            }
        }

        RecordKind::Ext => {
            let rename = match std::mem::take(pending) {
                PendingRename::AwaitingExt(rename) => rename,
                PendingRename::Idle => {
                    // Should never happen.
                    tracing::error!(
                        stream,
                        incoming = %rec,
                        "got EXT without a pending RENAME, discarding it"
                    );
                    out.events.push(RewriteEvent::PairingViolation);
                    return out;
                }
            };

            if !caps.has_last_exists()
                && (rec.target.is_zero() || rec.target != rename.target)
                && caps.observe_last_exists()
            {
                // A zero or differing target fid proves the server
                // distinguishes the overwritten object.
                tracing::info!(
                    stream,
                    "server reports overwritten rename targets, enabling capability"
                );
                out.events.push(RewriteEvent::CapabilityUpgrade);
            }

            if !rec.target.is_zero() {
                // "mv a b" with b existing: remove b explicitly.
                match synthesize_unlink(stream, &rec, caps) {
                    Ok(em) => out.emissions.push(em),
                    Err(ev) => out.events.push(ev),
                }
            }

            // The EXT now describes the renamed object itself.
            rec.target = rename.target;

            out.emissions.push(Emission {
                record: rename,
                hints: OpHints::default(),
            });
            out.emissions.push(Emission {
                record: rec,
                hints: OpHints::default(),
            });
        }

        _ => {
            out.emissions.push(Emission {
                record: rec,
                hints: OpHints::default(),
            });
        }
    }

    out
}
