//! Core data model: sites, files, history events and ignores (§3).

use serde::{Deserialize, Serialize};

/// Monotonic microseconds-since-epoch. Assigned once per process run and
/// reused for every mutation of that run, so one run == one generation.
pub type TimePoint = u64;

/// A backed-up FTP site. Credentials are immutable for the lifetime of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Site {
    pub id: u32,
    pub login: String,
    pub password: String,
}

/// `(fileId, timePoint, status)` — at generation `time_point`, `file_id`
/// underwent `status`. Append-only; never mutated or deleted.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[repr(i8)]
pub enum Status {
    Added = 0,
    Modified = 1,
    Deleted = -1,
}

/// A file or directory row as currently known for a site.
///
/// `id == 0` means the row has never been persisted. Deletion status is
/// never read from this struct — it lives solely in the latest history
/// event for the file (F2 in SPEC_FULL.md §3; the legacy
/// `crc32 == 0xFFFFFFFF` sentinel is intentionally not reproduced here).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct File {
    pub id: u32,
    pub full_name: String,
    pub is_directory: bool,
    /// For MLSD-listed files, the server's `modify` fact. For LIST-mode
    /// files without MDTM support, the generation timestamp is stored here
    /// instead (see SPEC_FULL.md §9, "Preserved: LIST-mode mtime quirk") —
    /// every subsequent generation will then see a spurious mtime diff and
    /// fall back to CRC comparison, which is correct, just redundant.
    pub modify_date: String,
    /// 0 for directories or files whose bytes have never been read.
    pub crc32: u32,
    pub time_point: TimePoint,
}

impl File {
    pub fn new_unsaved(full_name: String, modify_date: String, is_directory: bool) -> Self {
        Self {
            id: 0,
            full_name,
            is_directory,
            modify_date,
            crc32: 0,
            time_point: 0,
        }
    }
}

/// A history row paired with the file it describes, as returned by
/// `load_tree_at` — the planner needs both the static attributes and the
/// status of the specific revision.
#[derive(Debug, Clone)]
pub struct FileRevision {
    pub file: File,
    pub status: Status,
}

/// What attribute an [`Ignore`] entry filters on.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum IgnoreAttribute {
    Ext,
    Path,
}

/// `(siteId, attribute, operand)` — one ignore rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ignore {
    pub site_id: u32,
    pub attribute: IgnoreAttribute,
    pub operand: String,
}
