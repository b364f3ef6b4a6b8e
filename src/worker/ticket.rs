//! Tickets
//!
//! The caller's end of a request to the storage worker.

use std::time::Duration;

use crossbeam::channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};

use crate::error::{Result, StorageError};

/// The worker's end of a request
pub(crate) type Reply<T> = Sender<Result<T>>;

/// Pending result of a storage request
///
/// Dropping a ticket discards the result; the request itself still runs.
#[must_use = "a ticket does nothing unless waited on; drop it explicitly to discard the result"]
#[derive(Debug)]
pub struct Ticket<T> {
    rx: Receiver<Result<T>>,
}

impl<T> Ticket<T> {
    pub(crate) fn new(rx: Receiver<Result<T>>) -> Self {
        Self { rx }
    }

    /// Block until the worker replies
    pub fn wait(self) -> Result<T> {
        self.rx.recv().unwrap_or(Err(StorageError::WorkerGone))
    }

    /// Block for at most `timeout`; `None` if the worker has not replied yet
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<T>> {
        match self.rx.recv_timeout(timeout) {
            Ok(result) => Some(result),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(Err(StorageError::WorkerGone)),
        }
    }

    /// Take the result if it is already available
    pub fn try_take(&self) -> Option<Result<T>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(StorageError::WorkerGone)),
        }
    }
}
