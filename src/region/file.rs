//! Region File
//!
//! One on-disk region: a two-sector header followed by sector-aligned chunk
//! records, plus the `c.<x>.<z>.mcc` overflow files of records too large to
//! describe with an 8-bit sector count.
//!
//! ## Write ordering
//! A record is written to freshly allocated sectors first, then its header
//! entry is updated, and only then are the previous sectors released. A crash
//! at any point leaves either the old or the new record reachable.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use tracing::{debug, error, trace, warn};

use crate::error::Result;

use super::{
    sectors_for, ChunkPos, Compression, SectorBitmap, CHUNK_HEADER_SIZE, EXTERNAL_STREAM_FLAG,
    EXTERNAL_THRESHOLD_SECTORS, HEADER_SECTORS, SECTOR_BYTES, SECTOR_INTS,
};

/// Both header tables
const HEADER_BYTES: usize = SECTOR_BYTES * HEADER_SECTORS as usize;

/// Settings a region file is opened with
#[derive(Debug, Clone, Copy, Default)]
pub struct RegionFileOptions {
    /// Codec for records written through this handle
    pub compression: Compression,

    /// fsync after every record write
    pub sync_writes: bool,
}

/// A present header slot, as reported by [`RegionFile::entries`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionEntry {
    /// Slot in the header tables, in [0, 1024)
    pub local_index: usize,
    /// First sector of the record
    pub sector: usize,
    /// Number of sectors allocated to the record
    pub sector_count: usize,
    /// Last modification, seconds since the epoch
    pub timestamp: u32,
}

/// An open region file with its header loaded into memory
pub struct RegionFile {
    path: PathBuf,
    /// Directory holding the external overflow files
    dir: PathBuf,
    file: File,
    options: RegionFileOptions,
    /// Packed `(sector << 8) | count` per local index
    offsets: Vec<u32>,
    timestamps: Vec<u32>,
    used: SectorBitmap,
}

impl RegionFile {
    /// Open or create a region file
    ///
    /// Header entries that point into the header, past the end of the file,
    /// or into sectors claimed by an earlier entry are logged and dropped so
    /// the chunk reads as absent.
    pub fn open(path: &Path, options: RegionFileOptions) -> Result<Self> {
        let dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let mut file_size = file.metadata()?.len();

        let mut header = Vec::with_capacity(HEADER_BYTES);
        (&mut file).take(HEADER_BYTES as u64).read_to_end(&mut header)?;
        if header.len() < HEADER_BYTES {
            if !header.is_empty() {
                warn!(
                    path = %path.display(),
                    bytes = header.len(),
                    "Region file has truncated header"
                );
            }
            header.resize(HEADER_BYTES, 0);
            file.set_len(HEADER_BYTES as u64)?;
            file_size = HEADER_BYTES as u64;
        }

        let mut offsets = vec![0u32; SECTOR_INTS];
        let mut timestamps = vec![0u32; SECTOR_INTS];
        for index in 0..SECTOR_INTS {
            offsets[index] = be_u32(&header[index * 4..]);
            timestamps[index] = be_u32(&header[SECTOR_BYTES + index * 4..]);
        }

        let mut used = SectorBitmap::new();
        used.force(0, HEADER_SECTORS as usize);

        for (index, entry) in offsets.iter_mut().enumerate() {
            if *entry == 0 {
                continue;
            }
            let (sector, count) = unpack(*entry);
            let problem = if sector < HEADER_SECTORS as usize {
                Some("overlaps the region header")
            } else if count == 0 {
                Some("has an invalid sector count")
            } else if sector_offset(sector) > file_size {
                Some("points past the end of the file")
            } else if !used.is_free(sector, count) {
                Some("overlaps another chunk")
            } else {
                None
            };

            match problem {
                Some(reason) => {
                    warn!(
                        path = %path.display(),
                        local_index = index,
                        sector,
                        count,
                        "Region header entry {reason}, dropping it"
                    );
                    *entry = 0;
                }
                None => used.force(sector, count),
            }
        }

        debug!(path = %path.display(), size = file_size, "Opened region file");

        Ok(Self {
            path: path.to_path_buf(),
            dir,
            file,
            options,
            offsets,
            timestamps,
            used,
        })
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Read and decode a chunk
    ///
    /// Returns:
    /// - `Ok(Some(bytes))`: the decoded payload
    /// - `Ok(None)`: chunk absent, or its record is damaged (logged)
    /// - `Err(_)`: the file could not be read
    pub fn read(&mut self, pos: ChunkPos) -> Result<Option<Bytes>> {
        let Some(mut stream) = self.read_stream(pos)? else {
            return Ok(None);
        };

        let mut decoded = Vec::new();
        match stream.read_to_end(&mut decoded) {
            Ok(_) => Ok(Some(Bytes::from(decoded))),
            Err(e) => {
                error!(chunk = %pos, path = %self.path.display(), error = %e, "Failed to decode chunk payload");
                Ok(None)
            }
        }
    }

    /// Open a decoding stream over a chunk's payload without decoding it
    /// up front
    pub fn read_stream(&mut self, pos: ChunkPos) -> Result<Option<Box<dyn Read + Send>>> {
        Ok(self
            .read_encoded(pos)?
            .map(|(compression, data)| compression.decoder(Cursor::new(data))))
    }

    /// Fetch the still-encoded payload of a chunk along with its codec
    fn read_encoded(&mut self, pos: ChunkPos) -> io::Result<Option<(Compression, Vec<u8>)>> {
        let entry = self.offsets[pos.local_index()];
        if entry == 0 {
            return Ok(None);
        }

        let (sector, count) = unpack(entry);
        let allocated = count * SECTOR_BYTES;
        let mut buf = Vec::with_capacity(allocated);
        self.file.seek(SeekFrom::Start(sector_offset(sector)))?;
        (&mut self.file).take(allocated as u64).read_to_end(&mut buf)?;

        if buf.len() < CHUNK_HEADER_SIZE {
            error!(
                chunk = %pos,
                path = %self.path.display(),
                "Chunk header is truncated: expected {} but read {}",
                allocated,
                buf.len()
            );
            return Ok(None);
        }

        let declared = be_u32(&buf) as usize;
        let tag = buf[4];
        if declared == 0 {
            warn!(chunk = %pos, path = %self.path.display(), "Chunk is allocated, but stream is missing");
            return Ok(None);
        }
        let Some(compression) = Compression::from_tag(tag) else {
            error!(chunk = %pos, path = %self.path.display(), tag, "Chunk has unknown stream version");
            return Ok(None);
        };
        let payload_len = declared - 1;

        if is_external(tag) {
            if payload_len != 0 {
                warn!(chunk = %pos, "Chunk has both internal and external streams");
            }
            let external = self.external_path(pos);
            if !external.is_file() {
                error!(chunk = %pos, path = %external.display(), "External chunk file is missing");
                return Ok(None);
            }
            return Ok(Some((compression, fs::read(&external)?)));
        }

        let available = buf.len() - CHUNK_HEADER_SIZE;
        if payload_len > available {
            error!(
                chunk = %pos,
                path = %self.path.display(),
                "Chunk stream is truncated: expected {} but read {}",
                payload_len,
                available
            );
            return Ok(None);
        }

        buf.truncate(CHUNK_HEADER_SIZE + payload_len);
        buf.drain(..CHUNK_HEADER_SIZE);
        Ok(Some((compression, buf)))
    }

    /// Whether the header has an entry for this chunk
    pub fn exists(&self, pos: ChunkPos) -> bool {
        self.offsets[pos.local_index()] != 0
    }

    /// Whether this chunk has a record that looks readable
    ///
    /// Only the record header (and the external file, for external records)
    /// is examined. Damage or I/O trouble reads as `false`.
    pub fn has_record(&mut self, pos: ChunkPos) -> bool {
        let (sector_count, declared, tag) = match self.peek_record(pos) {
            Ok(Some(header)) => header,
            Ok(None) => return false,
            Err(e) => {
                debug!(chunk = %pos, error = %e, "Could not read chunk record header");
                return false;
            }
        };

        if declared == 0 || Compression::from_tag(tag).is_none() {
            return false;
        }
        if is_external(tag) {
            return self.external_path(pos).is_file();
        }
        declared - 1 <= sector_count * SECTOR_BYTES - CHUNK_HEADER_SIZE
    }

    /// Whether the chunk is stored as an external stub
    pub fn is_external(&mut self, pos: ChunkPos) -> bool {
        matches!(self.peek_record(pos), Ok(Some((_, _, tag))) if is_external(tag))
    }

    /// Sector count, declared length and tag of a chunk's record
    fn peek_record(&mut self, pos: ChunkPos) -> io::Result<Option<(usize, usize, u8)>> {
        let entry = self.offsets[pos.local_index()];
        if entry == 0 {
            return Ok(None);
        }
        let (sector, count) = unpack(entry);

        let mut head = Vec::with_capacity(CHUNK_HEADER_SIZE);
        self.file.seek(SeekFrom::Start(sector_offset(sector)))?;
        (&mut self.file)
            .take(CHUNK_HEADER_SIZE as u64)
            .read_to_end(&mut head)?;
        if head.len() < CHUNK_HEADER_SIZE {
            return Ok(None);
        }
        Ok(Some((count, be_u32(&head) as usize, head[4])))
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Write a chunk, replacing any previous record
    ///
    /// Once the header entry points at the new record the write has
    /// happened: the old sectors are released even if removing a stale
    /// external file fails afterwards.
    pub fn write(&mut self, pos: ChunkPos, payload: &[u8]) -> Result<()> {
        let index = pos.local_index();
        let previous = self.offsets[index];
        let previous_external = self.is_external(pos);

        let compression = self.options.compression;
        let encoded = compression.encode(payload)?;
        let external = sectors_for(CHUNK_HEADER_SIZE + encoded.len()) >= EXTERNAL_THRESHOLD_SECTORS;

        let record = if external {
            self.write_external(pos, &encoded)?;
            record_bytes(compression.tag() | EXTERNAL_STREAM_FLAG, &[])
        } else {
            record_bytes(compression.tag(), &encoded)
        };

        let count = sectors_for(record.len());
        let sector = self.used.allocate(count);
        let committed = self
            .write_at(sector, &record)
            .and_then(|()| self.set_entry(index, pack(sector, count)));
        if let Err(e) = committed {
            self.used.free(sector, count);
            // An old external stub now refers to the new overflow file, so
            // that file stays
            if external && !previous_external {
                self.remove_external(pos);
            }
            return Err(e.into());
        }

        if previous != 0 {
            let (old_sector, old_count) = unpack(previous);
            self.used.free(old_sector, old_count);
        }
        if !external {
            self.remove_external(pos);
        }

        trace!(
            chunk = %pos,
            sector,
            count,
            bytes = encoded.len(),
            external,
            "Wrote chunk"
        );

        if self.options.sync_writes {
            self.file.sync_data()?;
        }
        Ok(())
    }

    /// Remove a chunk and release its sectors
    pub fn clear(&mut self, pos: ChunkPos) -> Result<()> {
        let index = pos.local_index();
        let previous = self.offsets[index];
        if previous == 0 {
            return Ok(());
        }

        self.set_entry(index, 0)?;

        let (sector, count) = unpack(previous);
        self.used.free(sector, count);
        self.remove_external(pos);

        trace!(chunk = %pos, sector, count, "Cleared chunk");
        Ok(())
    }

    /// fsync the region file
    pub fn flush(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    /// Pad to a whole sector, fsync and release the file
    pub fn close(self) -> Result<()> {
        let len = self.file.metadata()?.len();
        let remainder = len % SECTOR_BYTES as u64;
        if remainder != 0 {
            self.file.set_len(len + (SECTOR_BYTES as u64 - remainder))?;
        }
        self.file.sync_all()?;
        debug!(path = %self.path.display(), "Closed region file");
        Ok(())
    }

    // =========================================================================
    // Accessors (for tooling and tests)
    // =========================================================================

    /// Path of the region file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of the overflow file for a chunk
    pub fn external_path(&self, pos: ChunkPos) -> PathBuf {
        self.dir.join(format!("c.{}.{}.mcc", pos.x, pos.z))
    }

    /// Last modification time of a chunk's slot
    pub fn timestamp(&self, pos: ChunkPos) -> u32 {
        self.timestamps[pos.local_index()]
    }

    /// All present header entries, by local index
    pub fn entries(&self) -> Vec<RegionEntry> {
        self.offsets
            .iter()
            .enumerate()
            .filter(|&(_, &entry)| entry != 0)
            .map(|(local_index, &entry)| {
                let (sector, sector_count) = unpack(entry);
                RegionEntry {
                    local_index,
                    sector,
                    sector_count,
                    timestamp: self.timestamps[local_index],
                }
            })
            .collect()
    }

    /// Sector occupancy as currently tracked
    pub fn sector_bitmap(&self) -> &SectorBitmap {
        &self.used
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    fn write_at(&mut self, sector: usize, bytes: &[u8]) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(sector_offset(sector)))?;
        self.file.write_all(bytes)
    }

    /// Point a header slot at `entry` (0 for absent) and stamp it
    ///
    /// The in-memory tables only change if the header write succeeds.
    fn set_entry(&mut self, index: usize, entry: u32) -> io::Result<()> {
        let timestamp = now();
        // Timestamp first: the offset entry is what makes the change visible
        self.file
            .seek(SeekFrom::Start((SECTOR_BYTES + index * 4) as u64))?;
        self.file.write_all(&timestamp.to_be_bytes())?;
        self.file.seek(SeekFrom::Start((index * 4) as u64))?;
        self.file.write_all(&entry.to_be_bytes())?;

        self.offsets[index] = entry;
        self.timestamps[index] = timestamp;
        Ok(())
    }

    /// Write the overflow file through a temp file so a crash never leaves
    /// a half-written one in place
    fn write_external(&self, pos: ChunkPos, encoded: &[u8]) -> io::Result<()> {
        let target = self.external_path(pos);
        let temp = target.with_extension("mcc.tmp");
        let mut file = File::create(&temp)?;
        file.write_all(encoded)?;
        file.sync_all()?;
        fs::rename(&temp, &target)
    }

    /// Delete a chunk's overflow file if there is one
    ///
    /// Failures are logged only; the header no longer refers to the file.
    fn remove_external(&self, pos: ChunkPos) {
        let path = self.external_path(pos);
        match fs::remove_file(&path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => {
                warn!(chunk = %pos, path = %path.display(), error = %e, "Failed to remove external chunk file");
            }
            _ => {}
        }
    }
}

// =============================================================================
// Encoding Helpers
// =============================================================================

fn pack(sector: usize, count: usize) -> u32 {
    ((sector as u32) << 8) | count as u32
}

fn unpack(entry: u32) -> (usize, usize) {
    ((entry >> 8) as usize, (entry & 0xFF) as usize)
}

fn sector_offset(sector: usize) -> u64 {
    sector as u64 * SECTOR_BYTES as u64
}

fn is_external(tag: u8) -> bool {
    tag & EXTERNAL_STREAM_FLAG != 0
}

fn be_u32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

/// `[declared length][tag][payload]`
fn record_bytes(tag: u8, payload: &[u8]) -> Vec<u8> {
    let mut record = Vec::with_capacity(CHUNK_HEADER_SIZE + payload.len());
    record.extend_from_slice(&(payload.len() as u32 + 1).to_be_bytes());
    record.push(tag);
    record.extend_from_slice(payload);
    record
}

fn now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as u32)
        .unwrap_or(0)
}
