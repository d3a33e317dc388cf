//! Error taxonomy (§7, C12): typed error kinds so callers can distinguish
//! "abort the worker" from "log and continue" without matching on strings.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BackupError {
    /// FTP disconnect or timeout. The Tree Walker retries once at directory
    /// granularity (§4.4); a second failure surfaces as this variant.
    #[error("transport error: {0}")]
    Transport(String),

    /// Malformed listing entry or unreadable file. Logged and skipped by
    /// the Reconciler; never becomes a process-level failure on its own.
    #[error("entry error for {path}: {reason}")]
    PerEntry { path: String, reason: String },

    /// Archive packing or extraction failed. Fatal — aborts the generation.
    #[error("archiver error: {0}")]
    Archiver(#[source] anyhow::Error),

    /// Database mutation or query failed. Fatal — aborts the worker.
    #[error("persistence error: {0}")]
    Persistence(#[source] anyhow::Error),

    /// Missing or malformed configuration. Fatal — aborts the process
    /// before any worker starts.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Restore target doesn't exist (unknown site id, or no archive at or
    /// before the requested timestamp). Logged and exits 0, not a failure.
    #[error("not found: {0}")]
    NotFound(String),
}

pub type Result<T> = std::result::Result<T, BackupError>;
