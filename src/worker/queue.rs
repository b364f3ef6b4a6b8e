//! Worker Task Queue
//!
//! Three FIFO lanes drained strictly by priority. Caller requests land in
//! the foreground lane, the self-rescheduling drain task in the background
//! lane, and the final shutdown task in the shutdown lane, so shutdown only
//! runs once everything above it is empty.

use std::collections::VecDeque;

use parking_lot::{Condvar, Mutex};

use super::state::WorkerState;

/// What the worker loop should do after a task
pub(crate) enum Flow {
    Continue,
    Stop,
}

/// A unit of work run on the worker thread
pub(crate) type Task = Box<dyn FnOnce(&mut WorkerState) -> Flow + Send>;

/// Lanes, highest priority first
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Priority {
    Foreground = 0,
    Background = 1,
    Shutdown = 2,
}

impl Priority {
    const ALL: [Priority; 3] = [Priority::Foreground, Priority::Background, Priority::Shutdown];
}

struct Lanes {
    queues: [VecDeque<Task>; 3],
    /// Cleared once shutdown starts; caller submissions are refused after
    accepting: bool,
}

/// Multi-producer, single-consumer priority queue
pub(crate) struct TaskQueue {
    lanes: Mutex<Lanes>,
    ready: Condvar,
}

impl TaskQueue {
    pub(crate) fn new() -> Self {
        Self {
            lanes: Mutex::new(Lanes {
                queues: Default::default(),
                accepting: true,
            }),
            ready: Condvar::new(),
        }
    }

    /// Enqueue caller work in the foreground lane
    ///
    /// Returns `false` (dropping the task) once shutdown has begun.
    pub(crate) fn submit(&self, task: Task) -> bool {
        let mut lanes = self.lanes.lock();
        if !lanes.accepting {
            return false;
        }
        lanes.queues[Priority::Foreground as usize].push_back(task);
        drop(lanes);
        self.ready.notify_one();
        true
    }

    /// Enqueue worker-internal work; accepted even while shutting down
    pub(crate) fn push(&self, priority: Priority, task: Task) {
        self.lanes.lock().queues[priority as usize].push_back(task);
        self.ready.notify_one();
    }

    /// Refuse further caller work and queue the final task
    pub(crate) fn shut_down(&self, task: Task) {
        let mut lanes = self.lanes.lock();
        lanes.accepting = false;
        lanes.queues[Priority::Shutdown as usize].push_back(task);
        drop(lanes);
        self.ready.notify_one();
    }

    /// Block until a task is available and take the highest-priority one
    pub(crate) fn pop(&self) -> (Priority, Task) {
        let mut lanes = self.lanes.lock();
        loop {
            for priority in Priority::ALL {
                if let Some(task) = lanes.queues[priority as usize].pop_front() {
                    return (priority, task);
                }
            }
            self.ready.wait(&mut lanes);
        }
    }

    /// Refuse further work and drop everything still queued, which
    /// disconnects the callers waiting on those tasks
    pub(crate) fn abandon(&self) -> usize {
        let dropped: Vec<Task> = {
            let mut lanes = self.lanes.lock();
            lanes.accepting = false;
            lanes.queues.iter_mut().flat_map(|queue| queue.drain(..)).collect()
        };
        dropped.len()
    }
}
