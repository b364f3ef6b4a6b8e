//! Worker State
//!
//! Everything the storage worker owns: the region file cache, the staged
//! writes not yet applied to a region file, and the synchronize barriers
//! waiting on them. Only ever touched from the worker thread.

use std::collections::{HashMap, HashSet, VecDeque};
use std::io::Read;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, trace, warn};

use crate::error::{Result, StorageError};
use crate::region::{ChunkPos, RegionFileCache};

use super::queue::{Flow, Priority, TaskQueue};
use super::ticket::Reply;
use super::visitor::RecordVisitor;

// =============================================================================
// Pending Writes
// =============================================================================

/// A staged write and everyone waiting for it to land
struct PendingWrite {
    /// `None` stages a delete
    payload: Option<Bytes>,
    waiters: Vec<Reply<()>>,
}

/// Staged writes, one per chunk, oldest first
#[derive(Default)]
struct PendingWrites {
    entries: HashMap<ChunkPos, PendingWrite>,
    /// Chunks in staging order; holds exactly the keys of `entries`
    order: VecDeque<ChunkPos>,
}

impl PendingWrites {
    /// Stage a write, folding it into an already staged one for the chunk
    fn stage(&mut self, pos: ChunkPos, payload: Option<Bytes>, waiter: Reply<()>) {
        match self.entries.get_mut(&pos) {
            Some(pending) => {
                pending.payload = payload;
                pending.waiters.push(waiter);
                trace!(chunk = %pos, waiters = pending.waiters.len(), "Coalesced chunk write");
            }
            None => {
                self.entries.insert(
                    pos,
                    PendingWrite {
                        payload,
                        waiters: vec![waiter],
                    },
                );
                self.order.push_back(pos);
            }
        }
    }

    fn get(&self, pos: ChunkPos) -> Option<&PendingWrite> {
        self.entries.get(&pos)
    }

    fn pop_oldest(&mut self) -> Option<(ChunkPos, PendingWrite)> {
        let pos = self.order.pop_front()?;
        self.entries.remove(&pos).map(|pending| (pos, pending))
    }

    fn keys(&self) -> HashSet<ChunkPos> {
        self.order.iter().copied().collect()
    }

    fn len(&self) -> usize {
        self.order.len()
    }

    fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// A synchronize request waiting for a snapshot of pending chunks
struct SyncBarrier {
    outstanding: HashSet<ChunkPos>,
    flush: bool,
    /// First write failure among the outstanding chunks
    failure: Option<StorageError>,
    reply: Reply<()>,
}

/// Run a visitor over a payload, turning an error or a panic into a reason
fn visit<V: RecordVisitor>(
    visitor: &mut V,
    payload: &mut dyn Read,
) -> std::result::Result<(), String> {
    match panic::catch_unwind(AssertUnwindSafe(|| visitor.visit(payload))) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e.to_string()),
        Err(_) => Err("visitor panicked".to_string()),
    }
}

// =============================================================================
// Worker State
// =============================================================================

pub(crate) struct WorkerState {
    cache: RegionFileCache,
    pending: PendingWrites,
    barriers: Vec<SyncBarrier>,
    /// Used to reschedule the drain task
    queue: Arc<TaskQueue>,
    /// A drain task is sitting in the background lane
    drain_queued: bool,
}

impl WorkerState {
    pub(crate) fn new(cache: RegionFileCache, queue: Arc<TaskQueue>) -> Self {
        Self {
            cache,
            pending: PendingWrites::default(),
            barriers: Vec::new(),
            queue,
            drain_queued: false,
        }
    }

    // =========================================================================
    // Requests
    // =========================================================================

    /// Staged payload if there is one, otherwise the on-disk record
    pub(crate) fn load(&mut self, pos: ChunkPos) -> Result<Option<Bytes>> {
        if let Some(pending) = self.pending.get(pos) {
            return Ok(pending.payload.clone());
        }
        match self.cache.get_existing(pos.region())? {
            Some(file) => file.read(pos),
            None => Ok(None),
        }
    }

    /// Whether a load would find a record
    pub(crate) fn exists(&mut self, pos: ChunkPos) -> Result<bool> {
        if let Some(pending) = self.pending.get(pos) {
            return Ok(pending.payload.is_some());
        }
        Ok(self
            .cache
            .get_existing(pos.region())?
            .is_some_and(|file| file.has_record(pos)))
    }

    /// Stream the staged or on-disk payload through a visitor
    ///
    /// The visitor is caller code; a panic inside it fails this scan only.
    pub(crate) fn scan<V: RecordVisitor>(&mut self, pos: ChunkPos, mut visitor: V) -> Result<Option<V>> {
        let visited = if let Some(pending) = self.pending.get(pos) {
            match &pending.payload {
                Some(payload) => {
                    let mut reader: &[u8] = payload;
                    Some(visit(&mut visitor, &mut reader))
                }
                None => None,
            }
        } else {
            let stream = match self.cache.get_existing(pos.region())? {
                Some(file) => file.read_stream(pos)?,
                None => None,
            };
            stream.map(|mut stream| visit(&mut visitor, &mut stream))
        };

        match visited {
            Some(Ok(())) => Ok(Some(visitor)),
            Some(Err(reason)) => {
                warn!(chunk = %pos, %reason, "Scan visitor failed");
                Err(StorageError::Scan { pos, reason })
            }
            None => Ok(None),
        }
    }

    /// Stage a write; the reply fires once it reaches the region file
    pub(crate) fn stage(&mut self, pos: ChunkPos, payload: Option<Bytes>, reply: Reply<()>) {
        self.pending.stage(pos, payload, reply);
    }

    /// Register a barrier over every chunk pending right now
    pub(crate) fn add_barrier(&mut self, flush: bool, reply: Reply<()>) {
        let barrier = SyncBarrier {
            outstanding: self.pending.keys(),
            flush,
            failure: None,
            reply,
        };
        debug!(pending = barrier.outstanding.len(), flush, "Synchronize requested");

        if barrier.outstanding.is_empty() {
            self.finish_barrier(barrier);
        } else {
            self.barriers.push(barrier);
        }
    }

    // =========================================================================
    // Draining
    // =========================================================================

    /// Queue a drain task unless one is queued or there is nothing to drain
    pub(crate) fn schedule_drain(&mut self) {
        if self.drain_queued || self.pending.is_empty() {
            return;
        }
        self.drain_queued = true;
        self.queue.push(
            Priority::Background,
            Box::new(|state: &mut WorkerState| {
                state.drain_queued = false;
                state.write_oldest();
                state.schedule_drain();
                Flow::Continue
            }),
        );
    }

    /// Apply the oldest staged write; `false` if nothing was staged
    fn write_oldest(&mut self) -> bool {
        let Some((pos, pending)) = self.pending.pop_oldest() else {
            return false;
        };

        let result = self.apply(pos, pending.payload.as_deref());
        if let Err(e) = &result {
            warn!(chunk = %pos, error = %e, "Failed to store chunk");
        }
        for waiter in pending.waiters {
            let _ = waiter.send(result.clone());
        }
        self.settle_barriers(pos, &result);
        true
    }

    fn apply(&mut self, pos: ChunkPos, payload: Option<&[u8]>) -> Result<()> {
        match payload {
            Some(bytes) => self.cache.get(pos.region())?.write(pos, bytes),
            None => match self.cache.get_existing(pos.region())? {
                Some(file) => file.clear(pos),
                None => Ok(()),
            },
        }
    }

    /// Tick `pos` off every barrier and complete the ones left empty
    fn settle_barriers(&mut self, pos: ChunkPos, result: &Result<()>) {
        for barrier in &mut self.barriers {
            if barrier.outstanding.remove(&pos) {
                if let Err(e) = result {
                    barrier.failure.get_or_insert_with(|| e.clone());
                }
            }
        }

        let (done, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.barriers)
            .into_iter()
            .partition(|barrier| barrier.outstanding.is_empty());
        self.barriers = waiting;
        for barrier in done {
            self.finish_barrier(barrier);
        }
    }

    fn finish_barrier(&mut self, barrier: SyncBarrier) {
        let result = match barrier.failure {
            Some(e) => Err(e),
            None if barrier.flush => self.cache.flush_all(),
            None => Ok(()),
        };
        let _ = barrier.reply.send(result);
    }

    // =========================================================================
    // Shutdown
    // =========================================================================

    /// Apply every staged write, then close all region files
    pub(crate) fn shutdown(&mut self) -> Result<()> {
        let remaining = self.pending.len();
        if remaining > 0 {
            debug!(remaining, "Draining staged writes before shutdown");
        }
        while self.write_oldest() {}

        // Every barrier's chunks have been written by now
        for barrier in std::mem::take(&mut self.barriers) {
            self.finish_barrier(barrier);
        }

        self.cache.close()
    }
}
