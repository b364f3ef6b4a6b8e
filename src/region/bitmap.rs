//! Sector Bitmap
//!
//! Occupancy of the sectors in one region file, one bit per sector.

use std::ops::Range;

const WORD_BITS: usize = 64;

/// Tracks which sectors of a region file are in use
///
/// The bitmap grows as sectors past the current end are forced or allocated;
/// sectors beyond the tracked length are free.
#[derive(Debug, Clone, Default)]
pub struct SectorBitmap {
    words: Vec<u64>,
}

impl SectorBitmap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `count` sectors starting at `offset` as used, regardless of
    /// their current state
    pub fn force(&mut self, offset: usize, count: usize) {
        self.ensure_len(offset + count);
        for sector in offset..offset + count {
            self.words[sector / WORD_BITS] |= 1u64 << (sector % WORD_BITS);
        }
    }

    /// Mark `count` sectors starting at `offset` as free
    pub fn free(&mut self, offset: usize, count: usize) {
        for sector in offset..offset + count {
            if let Some(word) = self.words.get_mut(sector / WORD_BITS) {
                *word &= !(1u64 << (sector % WORD_BITS));
            }
        }
    }

    /// Find the first run of `count` free sectors, mark it used and return
    /// its start
    pub fn allocate(&mut self, count: usize) -> usize {
        let mut start = 0;
        loop {
            // Jump to the next free sector, then measure the run from there
            start = self.next_free(start);
            let end = self.next_used(start, start + count);
            if end - start >= count {
                self.force(start, count);
                return start;
            }
            start = end;
        }
    }

    /// Whether a sector is marked used
    pub fn is_used(&self, sector: usize) -> bool {
        self.words
            .get(sector / WORD_BITS)
            .is_some_and(|&word| word & (1u64 << (sector % WORD_BITS)) != 0)
    }

    /// Whether every sector in the range is free
    pub fn is_free(&self, offset: usize, count: usize) -> bool {
        (offset..offset + count).all(|sector| !self.is_used(sector))
    }

    /// Number of sectors currently marked used
    pub fn used_count(&self) -> usize {
        self.words.iter().map(|word| word.count_ones() as usize).sum()
    }

    /// Maximal runs of used sectors, in ascending order
    pub fn used_ranges(&self) -> Vec<Range<usize>> {
        let mut ranges = Vec::new();
        let limit = self.words.len() * WORD_BITS;
        let mut sector = 0;
        while sector < limit {
            if self.is_used(sector) {
                let end = self.next_free(sector);
                ranges.push(sector..end);
                sector = end;
            } else {
                sector += 1;
            }
        }
        ranges
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    fn ensure_len(&mut self, sectors: usize) {
        let words = sectors.div_ceil(WORD_BITS);
        if words > self.words.len() {
            self.words.resize(words, 0);
        }
    }

    /// First free sector at or after `from`
    fn next_free(&self, from: usize) -> usize {
        let mut sector = from;
        while self.is_used(sector) {
            sector += 1;
        }
        sector
    }

    /// First used sector in `[from, limit)`, or `limit` if there is none
    fn next_used(&self, from: usize, limit: usize) -> usize {
        (from..limit)
            .find(|&sector| self.is_used(sector))
            .unwrap_or(limit)
    }
}
