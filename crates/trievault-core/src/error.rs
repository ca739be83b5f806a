//! Error types for TrieVault operations
//!
//! Recoverable failures are represented by the [`TrieError`] enum. Broken
//! invariants (refcount underflow, corrupt free lists, double frees) are not
//! errors: they panic, because continuing would silently corrupt the arena.

use std::path::PathBuf;

use thiserror::Error;

use crate::directory::Tier;

/// TrieVault error types with detailed context
#[derive(Debug, Clone, Error)]
pub enum TrieError {
    /// I/O operation failed
    #[error("I/O error{}: {message} ({kind})", display_path(.path))]
    Io {
        /// The file path where the error occurred
        path: Option<PathBuf>,
        /// The underlying I/O error kind
        kind: std::io::ErrorKind,
        /// Human-readable description
        message: String,
    },

    /// A tier has no room left, even after evicting the least recently used page
    #[error("no free pages in {tier} tier for a {requested_bytes} byte object")]
    NoFreePages {
        /// Tier that could not satisfy the allocation
        tier: Tier,
        /// Size of the object being allocated
        requested_bytes: usize,
    },

    /// The object directory has handed out every identifier it can hold
    #[error("object directory exhausted: {max_objects} ids in use")]
    ObjectIdsExhausted {
        /// Capacity of the directory
        max_objects: u32,
    },

    /// A region file does not contain what it should
    #[error("corrupted region {}: {reason}", .path.display())]
    Corrupted {
        /// Region file that failed validation
        path: PathBuf,
        /// Description of the problem
        reason: String,
    },

    /// Region header checksum verification failed
    #[error("checksum mismatch in {}: expected 0x{expected:08x}, got 0x{actual:08x}", .path.display())]
    ChecksumMismatch {
        /// Region file whose header failed
        path: PathBuf,
        /// Checksum stored in the header
        expected: u32,
        /// Checksum computed over the header
        actual: u32,
    },

    /// Region was written by an incompatible format version
    #[error("unsupported format version {found} in {} (expected {expected})", .path.display())]
    VersionMismatch {
        /// Region file
        path: PathBuf,
        /// Version this build understands
        expected: u32,
        /// Version found on disk
        found: u32,
    },

    /// Key or value exceeds its configured maximum
    #[error("entry {component} too large: {entry_size} bytes exceeds limit of {max_size} bytes")]
    OversizedEntry {
        /// Size of the oversized component
        entry_size: u64,
        /// Maximum allowed size
        max_size: u64,
        /// Whether it's the key or value that's oversized
        component: String,
    },

    /// Keys must contain at least one byte
    #[error("keys must not be empty")]
    EmptyKey,

    /// Revision id outside of the configured revision ring
    #[error("revision {revision} out of range (ring holds {max} revisions)")]
    InvalidRevision {
        /// Requested revision
        revision: u32,
        /// Number of revision slots
        max: u32,
    },

    /// Configuration rejected by `Config::validate`
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

fn display_path(path: &Option<PathBuf>) -> String {
    match path {
        Some(path) => format!(" in {}", path.display()),
        None => String::new(),
    }
}

impl TrieError {
    /// Wrap an I/O error with the path it happened on.
    pub fn io_at(path: impl Into<PathBuf>, err: &std::io::Error, what: &str) -> Self {
        TrieError::Io {
            path: Some(path.into()),
            kind: err.kind(),
            message: format!("{}: {}", what, err),
        }
    }
}

/// Convert std::io::Error to TrieError::Io
impl From<std::io::Error> for TrieError {
    fn from(err: std::io::Error) -> Self {
        TrieError::Io {
            path: None,
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Result type alias for TrieVault operations
pub type TrieResult<T> = Result<T, TrieError>;
