//! Configuration for regionkv
//!
//! Centralized configuration with sensible defaults.

use std::path::PathBuf;

use crate::error::{Result, StorageError};
use crate::region::Compression;

/// Main configuration for a region storage directory
#[derive(Debug, Clone)]
pub struct StorageConfig {
    // -------------------------------------------------------------------------
    // Storage Configuration
    // -------------------------------------------------------------------------
    /// Directory holding region files and their external overflow files
    /// Internal structure:
    ///   {dir}/
    ///     ├── r.0.0.mca      (region files, one per 32x32 chunks)
    ///     ├── r.-1.0.mca
    ///     └── c.12.-40.mcc   (oversized records spilled out of a region)
    pub dir: PathBuf,

    /// File extension of region files (without the dot)
    pub region_extension: String,

    /// Codec used for newly written records
    pub compression: Compression,

    /// fsync the region file after every record write
    pub sync_writes: bool,

    // -------------------------------------------------------------------------
    // Cache Configuration
    // -------------------------------------------------------------------------
    /// Max number of region files held open at once
    pub max_open_regions: usize,

    // -------------------------------------------------------------------------
    // Worker Configuration
    // -------------------------------------------------------------------------
    /// Name given to the storage worker thread
    pub thread_name: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./region"),
            region_extension: "mca".to_string(),
            compression: Compression::Deflate,
            sync_writes: false,
            max_open_regions: 256,
            thread_name: "region-storage".to_string(),
        }
    }
}

impl StorageConfig {
    /// Create a new config builder
    pub fn builder() -> StorageConfigBuilder {
        StorageConfigBuilder::default()
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.max_open_regions == 0 {
            return Err(StorageError::Config(
                "max_open_regions must be at least 1".to_string(),
            ));
        }
        if self.region_extension.is_empty() || self.region_extension.contains('.') {
            return Err(StorageError::Config(format!(
                "invalid region extension: {:?}",
                self.region_extension
            )));
        }
        Ok(())
    }
}

/// Builder for StorageConfig
#[derive(Default)]
pub struct StorageConfigBuilder {
    config: StorageConfig,
}

impl StorageConfigBuilder {
    /// Set the storage directory
    pub fn dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.dir = path.into();
        self
    }

    /// Set the region file extension
    pub fn region_extension(mut self, ext: impl Into<String>) -> Self {
        self.config.region_extension = ext.into();
        self
    }

    /// Set the codec for new records
    pub fn compression(mut self, compression: Compression) -> Self {
        self.config.compression = compression;
        self
    }

    /// Enable or disable fsync after each record write
    pub fn sync_writes(mut self, sync: bool) -> Self {
        self.config.sync_writes = sync;
        self
    }

    /// Set the maximum number of open region files
    pub fn max_open_regions(mut self, count: usize) -> Self {
        self.config.max_open_regions = count;
        self
    }

    /// Set the worker thread name
    pub fn thread_name(mut self, name: impl Into<String>) -> Self {
        self.config.thread_name = name.into();
        self
    }

    pub fn build(self) -> StorageConfig {
        self.config
    }
}
