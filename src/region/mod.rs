//! Region Module
//!
//! Sector-allocated region files holding 32x32 chunk records each.
//!
//! ## Responsibilities
//! - Map chunk coordinates onto region files and header slots
//! - Allocate payload sectors without overlap
//! - Spill oversized records into external files
//! - Keep a bounded set of region files open
//!
//! ## File Format
//! ```text
//! ┌────────────────────────────────────────┐
//! │ Sector 0: Offset Table                 │
//! │   1024 x u32 BE = (sector << 8) | count│
//! │   0 = chunk absent                     │
//! ├────────────────────────────────────────┤
//! │ Sector 1: Timestamp Table              │
//! │   1024 x u32 BE seconds since epoch    │
//! ├────────────────────────────────────────┤
//! │ Sectors 2..: Records                   │
//! │ ┌──────────┬─────────┬──────────────┐  │
//! │ │ Len (4)  │ Tag (1) │ Payload      │  │
//! │ └──────────┴─────────┴──────────────┘  │
//! │ Len = payload bytes + 1 (BE)           │
//! │ Tag bit 7 = payload is in c.X.Z.mcc    │
//! └────────────────────────────────────────┘
//! ```

pub mod bitmap;
pub mod cache;
pub mod compression;
pub mod file;

use std::fmt;

pub use bitmap::SectorBitmap;
pub use cache::RegionFileCache;
pub use compression::Compression;
pub use file::{RegionEntry, RegionFile, RegionFileOptions};

// =============================================================================
// Format Constants
// =============================================================================

/// Size of one allocation unit in a region file
pub const SECTOR_BYTES: usize = 4096;

/// Number of u32 entries in each header table
pub const SECTOR_INTS: usize = SECTOR_BYTES / 4;

/// Offset table + timestamp table
pub const HEADER_SECTORS: u32 = 2;

/// Chunks per region along one axis
pub const REGION_WIDTH: i32 = 32;

/// Record header: declared length (4) + version tag (1)
pub const CHUNK_HEADER_SIZE: usize = 5;

/// Records needing this many sectors no longer fit the 8-bit count field
/// and are written as external stubs instead.
pub const EXTERNAL_THRESHOLD_SECTORS: usize = 256;

/// Version tag bit marking an external record
pub const EXTERNAL_STREAM_FLAG: u8 = 0x80;

/// Number of sectors needed to hold `bytes` bytes
pub fn sectors_for(bytes: usize) -> usize {
    bytes.div_ceil(SECTOR_BYTES)
}

// =============================================================================
// Coordinates
// =============================================================================

/// Key of one stored record: a chunk column coordinate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkPos {
    pub x: i32,
    pub z: i32,
}

impl ChunkPos {
    pub const fn new(x: i32, z: i32) -> Self {
        Self { x, z }
    }

    /// Region containing this chunk
    pub const fn region(self) -> RegionPos {
        RegionPos::new(self.x >> 5, self.z >> 5)
    }

    /// Slot of this chunk in its region's header tables, in [0, 1024)
    pub const fn local_index(self) -> usize {
        ((self.x & 31) + (self.z & 31) * REGION_WIDTH) as usize
    }
}

impl From<(i32, i32)> for ChunkPos {
    fn from((x, z): (i32, i32)) -> Self {
        Self::new(x, z)
    }
}

impl fmt::Display for ChunkPos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.x, self.z)
    }
}

/// Coordinate of a region file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegionPos {
    pub x: i32,
    pub z: i32,
}

impl RegionPos {
    pub const fn new(x: i32, z: i32) -> Self {
        Self { x, z }
    }

    /// Chunk stored at `local_index` of this region
    pub const fn chunk_at(self, local_index: usize) -> ChunkPos {
        let local = local_index as i32;
        ChunkPos::new(
            self.x * REGION_WIDTH + (local & 31),
            self.z * REGION_WIDTH + (local >> 5),
        )
    }

    /// File name of this region: `r.<x>.<z>.<ext>`
    pub fn file_name(self, extension: &str) -> String {
        format!("r.{}.{}.{}", self.x, self.z, extension)
    }

    /// Parse a region coordinate back out of a file name
    /// "r.-3.7.mca" → Some(RegionPos { x: -3, z: 7 })
    pub fn parse_file_name(name: &str) -> Option<Self> {
        let mut parts = name.strip_prefix("r.")?.splitn(3, '.');
        let x = parts.next()?.parse().ok()?;
        let z = parts.next()?.parse().ok()?;
        parts.next()?;
        Some(Self::new(x, z))
    }
}

impl fmt::Display for RegionPos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.x, self.z)
    }
}
