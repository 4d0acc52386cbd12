//! Error types for hashing and depot maintenance.

use std::path::PathBuf;

use thiserror::Error;

/// Failures surfaced by the hash engine and the depot cache.
#[derive(Debug, Error)]
pub enum Error {
    /// Open/read/write/seek failure. Aborts the current file's operation;
    /// callers move on to the next item.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Corrupt or truncated container structure. Extent resolution for the
    /// affected file fails; the engine falls back to whole-file hashing.
    #[error("malformed box structure: {0}")]
    MalformedBox(String),

    /// Recognized but unimplemented container feature (e.g. external data
    /// references). Same fallback behavior as `MalformedBox`.
    #[error("unsupported container feature: {0}")]
    UnsupportedFeature(String),

    /// Full hash matched a stored record while the content hash did not, at
    /// the current algorithm version. This indicates a non-deterministic or
    /// corrupted hashing algorithm and must never be swallowed.
    #[error("hash inconsistency for {path}: full digest matches stored record but content digest does not (algorithm version {version})")]
    Inconsistent { path: PathBuf, version: u32 },

    /// A depot merge found the same key in source and target with different
    /// record content. Fatal to the merge operation only.
    #[error("depot key collision for {key:?} merging into {target}")]
    KeyCollision { key: String, target: PathBuf },

    /// The conflict resolver asked to stop the whole run.
    #[error("aborted at user request")]
    Aborted,

    /// The depot file exists but cannot be parsed in either format.
    #[error("cannot parse depot file {path}: {reason}")]
    DepotFormat { path: PathBuf, reason: String },
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, err))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether extent resolution may degrade to whole-file hashing after
    /// this error, instead of failing the file.
    pub fn allows_whole_file_fallback(&self) -> bool {
        matches!(self, Error::MalformedBox(_) | Error::UnsupportedFeature(_))
    }
}
