//! # regionkv
//!
//! A region-file storage engine for chunk-keyed binary records:
//! - 32x32 chunks per region file, 4096-byte sector allocation
//! - Oversized records spilled to per-chunk overflow files
//! - Crash-tolerant header loading (bad entries read as absent)
//! - Bounded LRU of open region files
//! - Single I/O thread with write coalescing and read-your-writes
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Caller Threads                          │
//! │          load / store / scan / synchronize / close           │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │ Tickets
//! ┌─────────────────────▼───────────────────────────────────────┐
//! │                   StorageWorker                              │
//! │   Foreground > Background (drain) > Shutdown lanes           │
//! │   Staged writes: chunk → { payload, waiters }                │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │
//!                       ▼
//!               ┌───────────────┐
//!               │RegionFileCache│   (LRU, 256 open files)
//!               └───────┬───────┘
//!                       ▼
//!               ┌───────────────┐      ┌──────────────┐
//!               │  RegionFile   │─────►│ SectorBitmap │
//!               │ r.X.Z.mca     │      └──────────────┘
//!               └───────────────┘
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;

pub mod region;
pub mod worker;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use error::{Result, StorageError};
pub use config::StorageConfig;
pub use region::{ChunkPos, Compression, RegionFile, RegionFileCache, RegionPos, SectorBitmap};
pub use worker::{PrefixProbe, RecordVisitor, StorageWorker, Ticket};

// =============================================================================
// Version Info
// =============================================================================

/// Current version of regionkv
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
