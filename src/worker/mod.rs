//! Storage Worker
//!
//! The asynchronous front of the engine: one dedicated thread owns the
//! region file cache and performs every disk access, while any number of
//! caller threads submit requests and get back [`Ticket`]s.
//!
//! ## Scheduling
//! ```text
//!  callers ──► Foreground lane ──┐
//!                                ├──► worker thread ──► RegionFileCache
//!  drain   ──► Background lane ──┤
//!  close   ──► Shutdown lane ────┘
//! ```
//!
//! - `store` only stages the payload; a background drain task writes one
//!   staged chunk per run and requeues itself, so caller requests never wait
//!   behind a long backlog of writes.
//! - A second `store` to a chunk that is still staged replaces the payload;
//!   both callers are answered when the single write lands.
//! - `load` and `scan` see staged payloads before they reach disk.

mod queue;
mod state;
mod ticket;
mod visitor;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use bytes::Bytes;
use crossbeam::channel;
use parking_lot::Mutex;
use tracing::{debug, error, info};

use crate::config::StorageConfig;
use crate::error::{Result, StorageError};
use crate::region::{ChunkPos, RegionFileCache};

use queue::{Flow, Priority, TaskQueue};
use state::WorkerState;
use ticket::Reply;

pub use ticket::Ticket;
pub use visitor::{PrefixProbe, RecordVisitor};

/// Handle to the storage worker thread
///
/// All methods take `&self`; share it between threads with an `Arc`.
pub struct StorageWorker {
    queue: Arc<TaskQueue>,

    /// Taken by the first `close`
    thread: Mutex<Option<JoinHandle<()>>>,

    dir: PathBuf,
}

impl StorageWorker {
    /// Start a worker over the configured directory
    ///
    /// Region files are opened lazily; nothing is read here.
    pub fn open(config: StorageConfig) -> Result<Self> {
        let cache = RegionFileCache::new(&config)?;
        let queue = Arc::new(TaskQueue::new());
        let state = WorkerState::new(cache, Arc::clone(&queue));

        let worker_queue = Arc::clone(&queue);
        let thread = thread::Builder::new()
            .name(config.thread_name.clone())
            .spawn(move || run(worker_queue, state))?;

        info!(
            dir = %config.dir.display(),
            max_open_regions = config.max_open_regions,
            compression = ?config.compression,
            "Storage worker started"
        );

        Ok(Self {
            queue,
            thread: Mutex::new(Some(thread)),
            dir: config.dir,
        })
    }

    /// Open with a path (convenience method)
    ///
    /// Uses default config with the specified directory
    pub fn open_path(path: &Path) -> Result<Self> {
        Self::open(StorageConfig::builder().dir(path).build())
    }

    /// Load a chunk's payload
    ///
    /// A staged write is returned as-is without touching disk.
    pub fn load(&self, pos: ChunkPos) -> Ticket<Option<Bytes>> {
        self.request(move |state, reply| {
            let _ = reply.send(state.load(pos));
        })
    }

    /// Stage a write (`Some`) or delete (`None`) of a chunk
    ///
    /// The ticket resolves once the write has been handed to its region
    /// file, which is not necessarily on stable storage; see
    /// [`synchronize`](Self::synchronize).
    pub fn store(&self, pos: ChunkPos, payload: Option<Bytes>) -> Ticket<()> {
        self.request(move |state, reply| state.stage(pos, payload, reply))
    }

    /// Stream a chunk's payload through `visitor`
    ///
    /// Resolves to the visitor after it ran, or `None` if the chunk is
    /// absent.
    pub fn scan<V: RecordVisitor>(&self, pos: ChunkPos, visitor: V) -> Ticket<Option<V>> {
        self.request(move |state, reply| {
            let _ = reply.send(state.scan(pos, visitor));
        })
    }

    /// Whether a load of this chunk would find a record
    pub fn exists(&self, pos: ChunkPos) -> Ticket<bool> {
        self.request(move |state, reply| {
            let _ = reply.send(state.exists(pos));
        })
    }

    /// Wait for every write staged before this request to reach its region
    /// file; with `flush`, fsync the open region files afterwards
    ///
    /// Writes staged after the request are not waited for.
    pub fn synchronize(&self, flush: bool) -> Ticket<()> {
        self.request(move |state, reply| state.add_barrier(flush, reply))
    }

    /// Apply every staged write, close all region files and stop the thread
    ///
    /// Requests made after this begins resolve to `StorageError::Closed`.
    /// Calling it again is a no-op.
    pub fn close(&self) -> Result<()> {
        let Some(handle) = self.thread.lock().take() else {
            return Ok(());
        };

        let (tx, rx) = channel::bounded(1);
        self.queue.shut_down(Box::new(move |state: &mut WorkerState| {
            let _ = tx.send(state.shutdown());
            Flow::Stop
        }));

        if handle.join().is_err() {
            error!(dir = %self.dir.display(), "Storage worker panicked");
            return Err(StorageError::WorkerPanicked);
        }

        let result = rx.try_recv().unwrap_or(Err(StorageError::WorkerGone));
        info!(dir = %self.dir.display(), ok = result.is_ok(), "Storage worker closed");
        result
    }

    /// Storage directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    /// Queue a foreground request; a refused request resolves to `Closed`
    fn request<T, F>(&self, f: F) -> Ticket<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut WorkerState, Reply<T>) + Send + 'static,
    {
        let (tx, rx) = channel::bounded(1);
        let refused = tx.clone();

        let accepted = self.queue.submit(Box::new(move |state: &mut WorkerState| {
            f(state, tx);
            Flow::Continue
        }));
        if !accepted {
            let _ = refused.send(Err(StorageError::Closed));
        }

        Ticket::new(rx)
    }
}

impl Drop for StorageWorker {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            error!(dir = %self.dir.display(), error = %e, "Failed to close storage worker");
        }
    }
}

/// Worker thread body
fn run(queue: Arc<TaskQueue>, mut state: WorkerState) {
    // Whatever is still queued when this thread ends (normally or by panic)
    // is dropped, so no caller blocks forever on a task that will never run
    let _abandon = AbandonOnExit(Arc::clone(&queue));

    loop {
        let (priority, task) = queue.pop();
        if let Flow::Stop = task(&mut state) {
            break;
        }
        if priority == Priority::Foreground {
            state.schedule_drain();
        }
    }

    debug!("Storage worker thread exiting");
}

struct AbandonOnExit(Arc<TaskQueue>);

impl Drop for AbandonOnExit {
    fn drop(&mut self) {
        let dropped = self.0.abandon();
        if dropped > 0 {
            debug!(dropped, "Dropped queued storage tasks");
        }
    }
}
