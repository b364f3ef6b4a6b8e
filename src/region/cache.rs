//! Region File Cache
//!
//! Bounded LRU of open region files.
//!
//! ## Responsibilities
//! - Open (or create) region files on first access
//! - Keep at most `capacity` files open, closing the least recently used
//! - Flush or close every open file on request

use std::fs;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use lru::LruCache;
use tracing::{debug, warn};

use crate::config::StorageConfig;
use crate::error::{Result, StorageError};

use super::{RegionFile, RegionFileOptions, RegionPos};

/// Owns every open region file handle of one storage directory
///
/// Not shared: the storage worker is its only user, so no locking is needed.
pub struct RegionFileCache {
    /// Directory holding region files
    dir: PathBuf,

    /// Region file extension (without the dot)
    extension: String,

    /// Options handed to every opened file
    options: RegionFileOptions,

    /// Open handles, most recently used first
    files: LruCache<RegionPos, RegionFile>,
}

impl RegionFileCache {
    /// Create an empty cache for the configured directory
    ///
    /// No files are opened and no directories are created until first use.
    pub fn new(config: &StorageConfig) -> Result<Self> {
        config.validate()?;
        let capacity = NonZeroUsize::new(config.max_open_regions).ok_or_else(|| {
            StorageError::Config("max_open_regions must be at least 1".to_string())
        })?;

        Ok(Self {
            dir: config.dir.clone(),
            extension: config.region_extension.clone(),
            options: RegionFileOptions {
                compression: config.compression,
                sync_writes: config.sync_writes,
            },
            files: LruCache::new(capacity),
        })
    }

    /// Get the region file, opening or creating it on a miss
    pub fn get(&mut self, pos: RegionPos) -> Result<&mut RegionFile> {
        if !self.files.contains(&pos) {
            fs::create_dir_all(&self.dir)?;
        }
        self.open_or_cached(pos)
    }

    /// Get the region file only if it already exists on disk
    pub fn get_existing(&mut self, pos: RegionPos) -> Result<Option<&mut RegionFile>> {
        if !self.files.contains(&pos) && !self.region_path(pos).is_file() {
            return Ok(None);
        }
        self.open_or_cached(pos).map(Some)
    }

    /// fsync every open region file
    pub fn flush_all(&mut self) -> Result<()> {
        for (_, file) in self.files.iter() {
            file.flush()?;
        }
        Ok(())
    }

    /// Close every open region file
    ///
    /// Every file gets a close attempt; failures are gathered into a single
    /// `StorageError::Close`.
    pub fn close(&mut self) -> Result<()> {
        let mut failures = Vec::new();
        while let Some((pos, file)) = self.files.pop_lru() {
            if let Err(e) = file.close() {
                warn!(region = %pos, error = %e, "Failed to close region file");
                failures.push((pos, into_io(e)));
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(StorageError::Close(failures))
        }
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Path of a region's file, whether or not it exists
    pub fn region_path(&self, pos: RegionPos) -> PathBuf {
        self.dir.join(pos.file_name(&self.extension))
    }

    /// Storage directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Number of open region files
    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Maximum number of open region files
    pub fn capacity(&self) -> usize {
        self.files.cap().get()
    }

    /// Whether a region's file is currently open
    pub fn contains(&self, pos: RegionPos) -> bool {
        self.files.contains(&pos)
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    /// Return the open file for `pos`, marking it most recently used, or
    /// open it and make room by closing the LRU file
    ///
    /// The new file is opened before anything is evicted, so a failed open
    /// leaves the cache untouched.
    fn open_or_cached(&mut self, pos: RegionPos) -> Result<&mut RegionFile> {
        let path = self.region_path(pos);
        let options = self.options;

        let opened = if self.files.contains(&pos) {
            None
        } else {
            let file = RegionFile::open(&path, options)?;
            self.evict_if_full();
            Some(file)
        };

        self.files.try_get_or_insert_mut(pos, || match opened {
            Some(file) => Ok(file),
            None => RegionFile::open(&path, options),
        })
    }

    /// Close the least recently used file when the cache is at capacity
    ///
    /// A failed close is logged; it must not fail the request that needed
    /// the slot.
    fn evict_if_full(&mut self) {
        if self.files.len() < self.capacity() {
            return;
        }
        if let Some((evicted, file)) = self.files.pop_lru() {
            debug!(region = %evicted, "Evicting region file");
            if let Err(e) = file.close() {
                warn!(region = %evicted, error = %e, "Failed to close evicted region file");
            }
        }
    }
}

/// Unwrap the I/O cause of a close failure for aggregation
fn into_io(err: StorageError) -> Arc<std::io::Error> {
    match err {
        StorageError::Io(e) => e,
        other => Arc::new(std::io::Error::other(other.to_string())),
    }
}
