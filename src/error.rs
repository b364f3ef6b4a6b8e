//! Error types for regionkv
//!
//! Format corruption never shows up here: damaged records are logged and read
//! back as absent. Only real I/O faults and worker lifecycle problems become
//! a `StorageError`.

use std::io;
use std::sync::Arc;

use thiserror::Error;

use crate::region::{ChunkPos, RegionPos};

/// Result type alias using StorageError
pub type Result<T> = std::result::Result<T, StorageError>;

/// Unified error type for regionkv operations
///
/// `Clone` so a single failed write can be reported to every caller whose
/// store was coalesced into it.
#[derive(Debug, Clone, Error)]
pub enum StorageError {
    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(Arc<io::Error>),

    #[error("failed to close {} region file(s): {}", .0.len(), summarize(.0))]
    Close(Vec<(RegionPos, Arc<io::Error>)>),

    // -------------------------------------------------------------------------
    // Worker Errors
    // -------------------------------------------------------------------------
    #[error("storage worker is closed")]
    Closed,

    #[error("storage worker stopped before replying")]
    WorkerGone,

    #[error("storage worker thread panicked")]
    WorkerPanicked,

    // -------------------------------------------------------------------------
    // Caller Errors
    // -------------------------------------------------------------------------
    #[error("scan of chunk {pos} failed: {reason}")]
    Scan { pos: ChunkPos, reason: String },

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<io::Error> for StorageError {
    fn from(err: io::Error) -> Self {
        StorageError::Io(Arc::new(err))
    }
}

fn summarize(failures: &[(RegionPos, Arc<io::Error>)]) -> String {
    failures
        .iter()
        .map(|(pos, err)| format!("{pos}: {err}"))
        .collect::<Vec<_>>()
        .join("; ")
}
