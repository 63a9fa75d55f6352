// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Worker threads: the run loop draining queues into the completion path.

use super::pool::{CpuPinningPolicy, PoolShared};
use super::queue::PriorityQueue;
use super::task::Task;
use crate::macros::{log_debug, log_error};
#[cfg(feature = "log_tasks")]
use crate::macros::log_trace;
#[cfg(all(
    not(miri),
    any(
        target_os = "android",
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "linux"
    )
))]
use crate::macros::log_warn;
// Platforms that support `libc::sched_setaffinity()`.
#[cfg(all(
    not(miri),
    any(
        target_os = "android",
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "linux"
    )
))]
use nix::{
    sched::{sched_setaffinity, CpuSet},
    unistd::Pid,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

/// Identity of a worker thread, fixed at spawn time.
///
/// Identity is explicit context handed to the worker's run loop rather than
/// ambient thread-local state, so diagnostics can tag log lines with it and
/// callers can enumerate it without touching the worker's thread.
#[derive(Clone, Debug)]
pub struct WorkerContext {
    thread_id: u32,
    worker_id: u32,
    name: String,
}

impl WorkerContext {
    pub(crate) fn new(thread_id: u32, worker_id: u32, name: String) -> Self {
        Self {
            thread_id,
            worker_id,
            name,
        }
    }

    /// The spawn-generation identifier, shared by all workers spawned
    /// together by one [`spawn_workers()`](crate::TaskPool::spawn_workers)
    /// call and unique across spawns within the process.
    pub fn thread_id(&self) -> u32 {
        self.thread_id
    }

    /// The index of this worker within its pool, in `0..num_threads`.
    pub fn worker_id(&self) -> u32 {
        self.worker_id
    }

    /// The human-readable pool name. The worker's OS thread is named
    /// `{name}-{worker_id}`.
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Handle to a worker thread owned by a pool.
pub(crate) struct Worker {
    context: WorkerContext,
    stop: Arc<AtomicBool>,
    queue: Option<Arc<PriorityQueue<Task>>>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    /// Spawns a worker thread running the fetch-and-run loop until stopped.
    ///
    /// In per-worker-queue mode, `queue` is this worker's private queue,
    /// drained before the pool's shared queue.
    pub(crate) fn spawn(
        context: WorkerContext,
        shared: Arc<PoolShared>,
        queue: Option<Arc<PriorityQueue<Task>>>,
        cpu_pinning: CpuPinningPolicy,
    ) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let handle = std::thread::Builder::new()
            .name(format!("{}-{}", context.name(), context.worker_id()))
            .spawn({
                let context = context.clone();
                let stop = stop.clone();
                let queue = queue.clone();
                move || {
                    #[cfg(all(
                        not(miri),
                        any(
                            target_os = "android",
                            target_os = "dragonfly",
                            target_os = "freebsd",
                            target_os = "linux"
                        )
                    ))]
                    match cpu_pinning {
                        CpuPinningPolicy::No => (),
                        CpuPinningPolicy::IfSupported => {
                            let id = context.worker_id() as usize;
                            let mut cpu_set = CpuSet::new();
                            if let Err(_e) = cpu_set.set(id) {
                                log_warn!("Failed to set CPU affinity for worker #{id}: {_e}");
                            } else if let Err(_e) = sched_setaffinity(Pid::from_raw(0), &cpu_set) {
                                log_warn!("Failed to set CPU affinity for worker #{id}: {_e}");
                            } else {
                                log_debug!("Pinned worker #{id} to CPU #{id}");
                            }
                        }
                        CpuPinningPolicy::Always => {
                            let id = context.worker_id() as usize;
                            let mut cpu_set = CpuSet::new();
                            if let Err(e) = cpu_set.set(id) {
                                panic!("Failed to set CPU affinity for worker #{id}: {e}");
                            } else if let Err(e) = sched_setaffinity(Pid::from_raw(0), &cpu_set) {
                                panic!("Failed to set CPU affinity for worker #{id}: {e}");
                            } else {
                                log_debug!("Pinned worker #{id} to CPU #{id}");
                            }
                        }
                    }
                    #[cfg(any(
                        miri,
                        not(any(
                            target_os = "android",
                            target_os = "dragonfly",
                            target_os = "freebsd",
                            target_os = "linux"
                        ))
                    ))]
                    let _ = cpu_pinning;
                    run(context, shared, queue, stop)
                }
            })
            .expect("Spawning a worker thread failed");
        Self {
            context,
            stop,
            queue,
            handle: Some(handle),
        }
    }

    /// The worker's identity.
    pub(crate) fn context(&self) -> &WorkerContext {
        &self.context
    }

    /// The worker's private queue, in per-worker-queue mode.
    pub(crate) fn queue(&self) -> Option<&Arc<PriorityQueue<Task>>> {
        self.queue.as_ref()
    }

    /// Takes the private queue out of the worker, for the pool to drain at
    /// teardown.
    pub(crate) fn take_queue(&mut self) -> Option<Arc<PriorityQueue<Task>>> {
        self.queue.take()
    }

    /// Asks the worker to stop after its current task, if any. The caller
    /// still has to wake and join it.
    pub(crate) fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    /// Joins the worker's thread.
    pub(crate) fn join(&mut self) -> std::thread::Result<()> {
        match self.handle.take() {
            Some(handle) => handle.join(),
            None => Ok(()),
        }
    }
}

/// Main function run by a worker thread.
///
/// Pops one task at a time, private queue first, then the shared queue;
/// blocks on the pool's wake condition when both are empty. Exits when asked
/// to stop, or when the pool is finalized and there is nothing left to pop.
#[cfg_attr(not(feature = "log"), allow(unused_variables))]
fn run(
    context: WorkerContext,
    shared: Arc<PoolShared>,
    queue: Option<Arc<PriorityQueue<Task>>>,
    stop: Arc<AtomicBool>,
) {
    log_debug!(
        "[worker {}-{}] Thread started (spawn generation {})",
        context.name(),
        context.worker_id(),
        context.thread_id()
    );
    loop {
        if stop.load(Ordering::Acquire) {
            log_debug!(
                "[worker {}-{}] Received stop signal",
                context.name(),
                context.worker_id()
            );
            break;
        }

        // The wake generation is sampled before trying to pop, so a push
        // happening between a failed pop and the wait below bumps the
        // generation and prevents this worker from going to sleep.
        let (generation, finalized) = shared.wake_state();
        let task = queue
            .as_ref()
            .and_then(|queue| queue.pop())
            .or_else(|| shared.queue.pop());
        match task {
            Some(task) => {
                #[cfg(feature = "log_tasks")]
                log_trace!(
                    "[worker {}-{}] Executing task (priority {}, tag {})",
                    context.name(),
                    context.worker_id(),
                    task.priority(),
                    task.tag()
                );
                // The guard forwards the task to the completion path even if
                // its execution panics, so no task is ever silently dropped.
                let mut guard = CompletionGuard {
                    #[cfg(feature = "log")]
                    label: &context,
                    shared: &shared,
                    task: Some(task),
                    tracked: true,
                };
                if let Some(task) = guard.task.as_mut() {
                    task.execute();
                }
                drop(guard);
            }
            None if finalized => {
                log_debug!(
                    "[worker {}-{}] Pool finalized and queues drained",
                    context.name(),
                    context.worker_id()
                );
                break;
            }
            None => shared.wait_for_wake(generation),
        }
    }
    log_debug!(
        "[worker {}-{}] Thread exiting",
        context.name(),
        context.worker_id()
    );
}

/// Spawns a detached thread executing a single task, outside of any worker
/// pool bookkeeping. The task's `prepare` must already have run on the
/// caller.
pub(crate) fn spawn_single_shot(shared: Arc<PoolShared>, task: Task) {
    let name = format!("{}-async", shared.name());
    // The handle is dropped immediately: the thread is detached and delivers
    // its result through the completion queue.
    std::thread::Builder::new()
        .name(name)
        .spawn(move || {
            #[cfg(feature = "log")]
            let label = WorkerContext::new(0, 0, format!("{}-async", shared.name()));
            let mut guard = CompletionGuard {
                #[cfg(feature = "log")]
                label: &label,
                shared: &shared,
                task: Some(task),
                tracked: false,
            };
            if let Some(task) = guard.task.as_mut() {
                task.execute();
            }
            drop(guard);
        })
        .expect("Spawning a single-shot thread failed");
}

/// Forwards a task to the completion path when dropped, marking it failed if
/// the thread is unwinding from a panic in the task's execution.
struct CompletionGuard<'a> {
    #[cfg(feature = "log")]
    label: &'a WorkerContext,
    shared: &'a PoolShared,
    task: Option<Task>,
    /// Whether the task counts towards the pool's in-flight bookkeeping.
    tracked: bool,
}

impl Drop for CompletionGuard<'_> {
    fn drop(&mut self) {
        if let Some(mut task) = self.task.take() {
            if std::thread::panicking() {
                log_error!(
                    "[worker {}-{}] Task execution panicked, completing the task as failed",
                    self.label.name(),
                    self.label.worker_id()
                );
                task.fail();
            }
            if self.tracked {
                self.shared.finish(task);
            } else {
                self.shared.submit_completion(task);
            }
        }
    }
}
