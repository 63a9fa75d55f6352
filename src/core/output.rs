// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Delivery of finished tasks back to the owner thread.

use super::task::Task;
use std::sync::{Mutex, PoisonError, RwLock};

/// Wake callback invoked whenever a finished task is buffered, so an external
/// event loop can schedule a drain.
pub type WakeFn = Box<dyn Fn() + Send + Sync>;

/// Buffers finished tasks until the owner thread drains them.
///
/// Workers (and single-shot threads) submit finished tasks from any thread;
/// the owner thread periodically drains the buffer, which runs each task's
/// completion phase. Delivery order is submission order (FIFO by finish
/// time), independent of task priority.
pub struct CompletionQueue {
    buffer: Mutex<Vec<Task>>,
    wake: RwLock<Option<WakeFn>>,
}

impl CompletionQueue {
    /// Creates an empty completion queue with no wake callback.
    pub fn new() -> Self {
        Self {
            buffer: Mutex::new(Vec::new()),
            wake: RwLock::new(None),
        }
    }

    /// Registers (or clears) the wake callback invoked on every submission.
    pub fn set_wake(&self, wake: Option<WakeFn>) {
        *self.wake.write().unwrap() = wake;
    }

    /// Appends a finished task to the buffer and invokes the wake callback,
    /// if any. Thread-safe.
    pub fn submit(&self, task: Task) {
        // Submission must stay usable while a worker thread unwinds, so a
        // buffer poisoned by a panicking drain doesn't propagate here.
        self.buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(task);

        let wake = self.wake.read().unwrap_or_else(PoisonError::into_inner);
        if let Some(wake) = wake.as_ref() {
            wake();
        }
    }

    /// Atomically swaps out the buffer and runs the completion phase of every
    /// buffered task, in submission order. Returns the number of tasks
    /// delivered; calling this with an empty buffer is a no-op.
    ///
    /// Must only be called on the owner thread.
    pub fn drain(&self) -> usize {
        let tasks = std::mem::take(&mut *self.buffer.lock().unwrap());
        let count = tasks.len();
        for task in tasks {
            task.complete();
        }
        count
    }

    /// Returns whether the buffer currently holds any finished task.
    pub fn is_empty(&self) -> bool {
        self.buffer.lock().unwrap().is_empty()
    }
}
