//! Task queue shared by the fuzzing workers.

use std::collections::VecDeque;
use std::sync::Mutex;

/// A single fuzz-target job: which package to enter and which target to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    /// Package path relative to the project root.
    pub package: String,
    /// Fuzz target name within the package.
    pub target: String,
}

/// Thread-safe FIFO queue of [`Task`]s.
///
/// The controller enqueues every task before workers start; workers then
/// drain the queue concurrently. An empty dequeue means there is no more
/// work, which workers treat as normal termination.
#[derive(Debug, Default)]
pub struct TaskQueue {
    tasks: Mutex<VecDeque<Task>>,
}

impl TaskQueue {
    /// Returns an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a task to the back of the queue.
    pub fn enqueue(&self, task: Task) {
        self.tasks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push_back(task);
    }

    /// Removes and returns the next task, or `None` when the queue is empty.
    pub fn dequeue(&self) -> Option<Task> {
        self.tasks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .pop_front()
    }

    /// Number of tasks currently queued.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    /// Whether the queue is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
