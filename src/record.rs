//! Change-record model.
//!
//! A change record is a single metadata-change event emitted by a metadata
//! server. Records carry a per-stream monotonically increasing id, a kind
//! from a closed enumeration, the target object id, and, for namespace
//! operations, a parent object id and a name within that parent. Rename
//! records may additionally carry an inline extension payload (source
//! parent, source name, source object id); servers without extended-rename
//! support emit the extension as a separate `Ext` record instead.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// ── Record flags ───────────────────────────────────────────────────────────
//
// Flag bits are kind-contextual: the unlink and rename families reuse the
// low bits, matching the upstream wire encoding.

/// Unlink record: this was the last link to the object.
pub const FLAG_LAST_UNLINK: u32 = 0x0001;
/// Unlink record: an HSM copy of the object still exists.
pub const FLAG_HSM_EXISTS: u32 = 0x0002;
/// Rename record: the overwritten target was the last link.
pub const FLAG_RENAME_LAST: u32 = 0x0001;
/// Rename record: the overwritten target still has an HSM copy.
pub const FLAG_RENAME_LAST_EXISTS: u32 = 0x0002;
/// Record carries a job-id payload.
pub const FLAG_JOBID: u32 = 0x1000;
/// Rename record carries an inline extension payload (no separate `Ext`
/// record will follow).
pub const FLAG_EXTENDED_RENAME: u32 = 0x2000;

// ── Object identifier ──────────────────────────────────────────────────────

/// Server-assigned identifier for a filesystem object, stable across
/// renames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileId {
    pub seq: u64,
    pub oid: u32,
    pub ver: u32,
}

impl FileId {
    /// The absent object id. Used by rename records whose target name did
    /// not previously exist.
    pub const ZERO: FileId = FileId {
        seq: 0,
        oid: 0,
        ver: 0,
    };

    pub fn new(seq: u64, oid: u32, ver: u32) -> Self {
        FileId { seq, oid, ver }
    }

    pub fn is_zero(&self) -> bool {
        *self == FileId::ZERO
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:#x}:{:#x}:{:#x}]", self.seq, self.oid, self.ver)
    }
}

// ── Record kinds ───────────────────────────────────────────────────────────

/// The closed enumeration of change-record kinds.
///
/// Discriminants are contiguous so per-kind counters can live in a flat
/// array indexed by `kind as usize`. `Ioctl` is only emitted by legacy
/// servers; newer servers emit `Layout` instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum RecordKind {
    Mark = 0,
    Create = 1,
    Mkdir = 2,
    Hardlink = 3,
    Softlink = 4,
    Mknod = 5,
    Unlink = 6,
    Rmdir = 7,
    Rename = 8,
    Ext = 9,
    Open = 10,
    Close = 11,
    Ioctl = 12,
    Trunc = 13,
    Setattr = 14,
    Xattr = 15,
    Hsm = 16,
    Mtime = 17,
    Ctime = 18,
    Atime = 19,
    Migrate = 20,
    Flrw = 21,
    Resync = 22,
    Layout = 23,
}

/// Number of record kinds; bounds the per-kind counter arrays.
pub const KIND_COUNT: usize = 24;

impl RecordKind {
    /// All kinds, in discriminant order.
    pub const ALL: [RecordKind; KIND_COUNT] = [
        RecordKind::Mark,
        RecordKind::Create,
        RecordKind::Mkdir,
        RecordKind::Hardlink,
        RecordKind::Softlink,
        RecordKind::Mknod,
        RecordKind::Unlink,
        RecordKind::Rmdir,
        RecordKind::Rename,
        RecordKind::Ext,
        RecordKind::Open,
        RecordKind::Close,
        RecordKind::Ioctl,
        RecordKind::Trunc,
        RecordKind::Setattr,
        RecordKind::Xattr,
        RecordKind::Hsm,
        RecordKind::Mtime,
        RecordKind::Ctime,
        RecordKind::Atime,
        RecordKind::Migrate,
        RecordKind::Flrw,
        RecordKind::Resync,
        RecordKind::Layout,
    ];

    /// Decode a raw kind value from the source. Out-of-range values are
    /// a source protocol defect; callers log at error level and discard
    /// the record without advancing any counter.
    pub fn from_u32(raw: u32) -> Option<RecordKind> {
        RecordKind::ALL.get(raw as usize).copied()
    }

    /// Canonical short name, used in persisted counter variable names and
    /// stat reports.
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Mark => "MARK",
            RecordKind::Create => "CREATE",
            RecordKind::Mkdir => "MKDIR",
            RecordKind::Hardlink => "HARDLINK",
            RecordKind::Softlink => "SOFTLINK",
            RecordKind::Mknod => "MKNOD",
            RecordKind::Unlink => "UNLINK",
            RecordKind::Rmdir => "RMDIR",
            RecordKind::Rename => "RENAME",
            RecordKind::Ext => "EXT",
            RecordKind::Open => "OPEN",
            RecordKind::Close => "CLOSE",
            RecordKind::Ioctl => "IOCTL",
            RecordKind::Trunc => "TRUNC",
            RecordKind::Setattr => "SETATTR",
            RecordKind::Xattr => "XATTR",
            RecordKind::Hsm => "HSM",
            RecordKind::Mtime => "MTIME",
            RecordKind::Ctime => "CTIME",
            RecordKind::Atime => "ATIME",
            RecordKind::Migrate => "MIGRATE",
            RecordKind::Flrw => "FLRW",
            RecordKind::Resync => "RESYNC",
            RecordKind::Layout => "LAYOUT",
        }
    }

    /// Bit position for suppression coverage masks.
    pub fn bit(&self) -> u32 {
        1u32 << (*self as u32)
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Rename extension payload ───────────────────────────────────────────────

/// Source-side information of a rename, carried either inline in an
/// extended rename record or resolved from the paired `Ext` record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenameExt {
    /// The object being renamed.
    pub source_fid: FileId,
    /// The directory the object is renamed out of.
    pub source_parent: FileId,
    /// The name of the object in the source directory.
    pub source_name: String,
}

// ── Change record ──────────────────────────────────────────────────────────

/// A single metadata-change event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRecord {
    /// Monotonically increasing id within the originating stream.
    pub rec_id: u64,
    /// Server-side timestamp of the change.
    pub rec_time: DateTime<Utc>,
    pub kind: RecordKind,
    pub flags: u32,
    /// The object the change applies to. Zero for rename records whose
    /// target name did not previously exist.
    pub target: FileId,
    /// Parent directory, set whenever `name` is.
    pub parent: Option<FileId>,
    /// Name of the object within `parent`.
    pub name: Option<String>,
    /// Rename extension payload, present on extended rename records.
    pub rename: Option<RenameExt>,
    /// Job identifier of the process that caused the change.
    pub job_id: Option<String>,
}

impl ChangeRecord {
    pub fn new(rec_id: u64, kind: RecordKind, target: FileId, rec_time: DateTime<Utc>) -> Self {
        ChangeRecord {
            rec_id,
            rec_time,
            kind,
            flags: 0,
            target,
            parent: None,
            name: None,
            rename: None,
            job_id: None,
        }
    }

    pub fn has_flag(&self, flag: u32) -> bool {
        self.flags & flag != 0
    }

    /// A rename carrying its extension inline; no separate `Ext` record
    /// will follow it.
    pub fn is_extended_rename(&self) -> bool {
        self.kind == RecordKind::Rename
            && self.has_flag(FLAG_EXTENDED_RENAME)
            && self.rename.is_some()
    }
}

impl fmt::Display for ChangeRecord {
    /// One-line rendering used by per-record trace logging and the
    /// protocol-violation queue dump.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {:02}{} {}.{:06} {:#x} t={}",
            self.rec_id,
            self.kind as u32,
            self.kind.as_str(),
            self.rec_time.timestamp(),
            self.rec_time.timestamp_subsec_micros(),
            self.flags,
            self.target,
        )?;
        if let (Some(parent), Some(name)) = (&self.parent, &self.name) {
            write!(f, " p={parent} {name}")?;
        }
        if let Some(ext) = &self.rename {
            write!(
                f,
                " s={} sp={} {}",
                ext.source_fid, ext.source_parent, ext.source_name
            )?;
        }
        if let Some(job) = &self.job_id {
            write!(f, " J={job}")?;
        }
        Ok(())
    }
}
