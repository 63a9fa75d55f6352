// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The worker pool: lifecycle, submission paths and owner-thread draining.

use super::output::{CompletionQueue, WakeFn};
use super::queue::PriorityQueue;
use super::sync::Status;
use super::task::Task;
use super::worker::{self, Worker, WorkerContext};
#[cfg(feature = "log_tasks")]
use crate::macros::log_info;
use crate::macros::{log_debug, log_error, log_warn};
use crossbeam_utils::CachePadded;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::ThreadId;
use std::time::{Duration, Instant};

/// Number of worker threads to spawn in a task pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThreadCount {
    /// Spawn the number of threads returned by
    /// [`std::thread::available_parallelism()`].
    AvailableParallelism,
    /// Spawn the given number of threads.
    Count(NonZeroUsize),
}

impl ThreadCount {
    /// Resolves the number of threads to spawn.
    pub fn count(self) -> NonZeroUsize {
        match self {
            ThreadCount::AvailableParallelism => std::thread::available_parallelism()
                .expect("Getting the available parallelism failed"),
            ThreadCount::Count(count) => count,
        }
    }
}

impl TryFrom<usize> for ThreadCount {
    type Error = <NonZeroUsize as TryFrom<usize>>::Error;

    fn try_from(thread_count: usize) -> Result<Self, Self::Error> {
        let count = NonZeroUsize::try_from(thread_count)?;
        Ok(ThreadCount::Count(count))
    }
}

/// Queue topology of a task pool.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum QueueStrategy {
    /// All workers drain one shared priority queue.
    Shared,
    /// Each worker additionally owns a private priority queue, fed by
    /// [`TaskPool::perform_batch()`] and drained before the shared queue.
    PerWorker,
}

/// Policy to pin worker threads to CPUs.
#[derive(Clone, Copy)]
pub enum CpuPinningPolicy {
    /// Don't pin worker threads to CPUs.
    No,
    /// Pin each worker thread to a CPU, if CPU pinning is supported and
    /// implemented on this platform.
    IfSupported,
    /// Pin each worker thread to a CPU. If CPU pinning isn't supported on
    /// this platform (or not implemented), spawning workers will panic.
    Always,
}

/// A builder for [`TaskPool`].
pub struct TaskPoolBuilder {
    /// Number of worker threads to spawn in the pool.
    pub num_threads: ThreadCount,
    /// Queue topology of the pool.
    pub queue_strategy: QueueStrategy,
    /// Policy to pin worker threads to CPUs.
    pub cpu_pinning: CpuPinningPolicy,
    /// Human-readable pool name, used to name worker threads and tag log
    /// lines.
    pub name: String,
}

impl TaskPoolBuilder {
    /// Creates a task pool using the given parameters.
    ///
    /// The calling thread becomes the pool's owner thread: the only thread
    /// allowed to manage the pool's lifecycle and to drain completions. No
    /// worker is spawned yet; call
    /// [`spawn_workers()`](TaskPool::spawn_workers) for that.
    ///
    /// ```
    /// # use std::time::Duration;
    /// # use tasklight::{CpuPinningPolicy, QueueStrategy, Task, TaskPoolBuilder, ThreadCount};
    /// let mut pool = TaskPoolBuilder {
    ///     num_threads: ThreadCount::try_from(2).unwrap(),
    ///     queue_strategy: QueueStrategy::Shared,
    ///     cpu_pinning: CpuPinningPolicy::No,
    ///     name: "doc".to_string(),
    /// }
    /// .build();
    ///
    /// pool.spawn_workers();
    /// pool.perform(Task::builder().execute(|_| true).build());
    /// assert!(pool.wait_for_all(Duration::from_secs(10)));
    /// pool.cancel_workers();
    /// ```
    pub fn build(&self) -> TaskPool {
        TaskPool::new(self)
    }
}

/// Signal waking idle workers. Every state change of interest to a sleeping
/// worker bumps the generation.
struct WakeSignal {
    generation: u64,
    finalized: bool,
}

/// State shared between the pool, its workers and its submission handles.
pub(crate) struct PoolShared {
    /// The shared work queue.
    pub(crate) queue: PriorityQueue<Task>,
    /// Finished tasks waiting for the owner thread.
    completions: CompletionQueue,
    /// Wake condition for idle workers.
    wake: Status<WakeSignal>,
    /// Exit condition, distinct from the wake condition: notified on every
    /// finished task so [`TaskPool::wait_for_all()`] can observe progress.
    exit: Status<u64>,
    /// Number of tasks submitted and not yet forwarded to the completion
    /// queue.
    pending: CachePadded<AtomicUsize>,
    /// Total number of tasks accepted for execution.
    submitted: CachePadded<AtomicU64>,
    /// Total number of completions delivered to the owner thread.
    completed: CachePadded<AtomicU64>,
    /// Human-readable pool name.
    name: String,
}

impl PoolShared {
    fn new(name: String) -> Self {
        Self {
            queue: PriorityQueue::new(),
            completions: CompletionQueue::new(),
            wake: Status::new(WakeSignal {
                generation: 0,
                finalized: false,
            }),
            exit: Status::new(0),
            pending: CachePadded::new(AtomicUsize::new(0)),
            submitted: CachePadded::new(AtomicU64::new(0)),
            completed: CachePadded::new(AtomicU64::new(0)),
            name,
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    /// Samples the wake signal: current generation and the finalized flag.
    pub(crate) fn wake_state(&self) -> (u64, bool) {
        self.wake.with(|signal| (signal.generation, signal.finalized))
    }

    /// Blocks until the wake generation moves past the sampled one.
    pub(crate) fn wait_for_wake(&self, seen_generation: u64) {
        let _guard = self
            .wake
            .wait_while(|signal| signal.generation == seen_generation);
    }

    fn wake_one(&self) {
        self.wake
            .update_one(|signal| signal.generation = signal.generation.wrapping_add(1));
    }

    fn wake_all(&self) {
        self.wake
            .update_all(|signal| signal.generation = signal.generation.wrapping_add(1));
    }

    fn finalize(&self) {
        self.wake.update_all(|signal| {
            signal.finalized = true;
            signal.generation = signal.generation.wrapping_add(1);
        });
    }

    fn reopen(&self) {
        self.wake.update_all(|signal| {
            signal.finalized = false;
            signal.generation = signal.generation.wrapping_add(1);
        });
    }

    fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    fn note_accepted(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
        self.pending.fetch_add(1, Ordering::AcqRel);
    }

    /// Runs the task's prepare phase and either queues it or routes it
    /// straight to completion, marked failed.
    pub(crate) fn submit(&self, mut task: Task, insert_first: bool) {
        if !task.prepare() {
            task.fail();
            self.completions.submit(task);
            return;
        }
        self.note_accepted();
        let priority = task.priority();
        self.queue.push(task, priority, insert_first);
        self.wake_one();
    }

    /// Runs the task's prepare phase on the calling thread, then hands the
    /// task to a dedicated detached thread.
    pub(crate) fn perform_async(self: &Arc<Self>, mut task: Task) {
        if !task.prepare() {
            task.fail();
            self.completions.submit(task);
            return;
        }
        worker::spawn_single_shot(self.clone(), task);
    }

    /// Forwards a finished in-flight task to the completion queue and
    /// notifies the exit condition.
    pub(crate) fn finish(&self, task: Task) {
        // The completion is buffered before the in-flight counter drops, so
        // an owner observing a zero counter can drain every completion.
        self.completions.submit(task);
        let previous = self.pending.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0);
        // The try-variant keeps a worker unwinding from a task panic from
        // panicking a second time.
        if let Err(_e) = self
            .exit
            .try_notify_one(|epoch| *epoch = epoch.wrapping_add(1))
        {
            log_error!("Failed to notify the exit condition, the mutex was poisoned: {_e:?}");
        }
    }

    /// Forwards a finished untracked task (single-shot path, prepare vetoes)
    /// to the completion queue.
    pub(crate) fn submit_completion(&self, task: Task) {
        self.completions.submit(task);
    }

    /// Blocks until a task finishes or the duration elapses.
    fn wait_for_exit(&self, duration: Duration) {
        self.exit
            .wait_timeout_while(duration, |_| self.pending() != 0);
    }
}

/// Identifier of the next spawn generation.
static NEXT_SPAWN_ID: AtomicU32 = AtomicU32::new(1);

fn next_spawn_id() -> u32 {
    NEXT_SPAWN_ID.fetch_add(1, Ordering::Relaxed)
}

/// A pool of worker threads draining a priority-ordered task queue.
///
/// The thread that builds the pool becomes its **owner thread**: the only
/// thread allowed to call the lifecycle operations
/// ([`spawn_workers()`](Self::spawn_workers),
/// [`cancel_workers()`](Self::cancel_workers)) and the draining operations
/// ([`update()`](Self::update), [`wait_for_all()`](Self::wait_for_all)).
/// This restriction is asserted in debug builds.
///
/// Tasks can be submitted from any thread: through the pool itself, or
/// through a cloneable [`PoolHandle`], including from inside another task's
/// execute phase. Completion callbacks only ever run on the owner thread,
/// inside [`update()`](Self::update) or [`wait_for_all()`](Self::wait_for_all).
///
/// Dropping the pool cancels it: outstanding tasks are failed and their
/// completions delivered, and worker threads are joined.
pub struct TaskPool {
    shared: Arc<PoolShared>,
    workers: Vec<Worker>,
    num_threads: NonZeroUsize,
    queue_strategy: QueueStrategy,
    cpu_pinning: CpuPinningPolicy,
    owner: ThreadId,
}

impl TaskPool {
    /// Creates a new task pool using the given parameters.
    fn new(builder: &TaskPoolBuilder) -> Self {
        Self {
            shared: Arc::new(PoolShared::new(builder.name.clone())),
            workers: Vec::new(),
            num_threads: builder.num_threads.count(),
            queue_strategy: builder.queue_strategy,
            cpu_pinning: builder.cpu_pinning,
            owner: std::thread::current().id(),
        }
    }

    /// Spawns the pool's worker threads. Owner-thread-only.
    ///
    /// Returns [`false`] (and spawns nothing) if workers are already
    /// running. Calling this again after
    /// [`cancel_workers()`](Self::cancel_workers) spawns a fresh set of
    /// workers.
    pub fn spawn_workers(&mut self) -> bool {
        self.assert_owner();
        if !self.workers.is_empty() {
            log_warn!(
                "[owner thread] Workers of pool `{}` are already spawned",
                self.shared.name()
            );
            return false;
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
        match self.cpu_pinning {
            CpuPinningPolicy::No => (),
            CpuPinningPolicy::IfSupported => {
                log_warn!("Pinning threads to CPUs is not implemented on this platform.")
            }
            CpuPinningPolicy::Always => {
                panic!("Pinning threads to CPUs is not implemented on this platform.")
            }
        }

        self.shared.reopen();
        let thread_id = next_spawn_id();
        for worker_id in 0..self.num_threads.get() {
            let context = WorkerContext::new(
                thread_id,
                worker_id as u32,
                self.shared.name().to_string(),
            );
            let queue = match self.queue_strategy {
                QueueStrategy::Shared => None,
                QueueStrategy::PerWorker => Some(Arc::new(PriorityQueue::new())),
            };
            self.workers
                .push(Worker::spawn(context, self.shared.clone(), queue, self.cpu_pinning));
        }
        log_debug!(
            "[owner thread] Spawned {} workers for pool `{}`",
            self.num_threads,
            self.shared.name()
        );
        true
    }

    /// Submits a task: runs its prepare phase on the calling thread, then
    /// appends it to the back of its priority level in the shared queue.
    ///
    /// Thread-safe, callable from any thread, including from within another
    /// task's execute phase (see [`handle()`](Self::handle)).
    pub fn perform(&self, task: Task) {
        self.shared.submit(task, false);
    }

    /// Like [`perform()`](Self::perform), but inserts the task at the front
    /// of its priority level. The task still never overtakes a higher
    /// priority level.
    pub fn perform_first(&self, task: Task) {
        self.shared.submit(task, true);
    }

    /// Routes tasks to specific workers' private queues, bypassing the
    /// shared queue, for work that must run on a specific worker (e.g.
    /// thread-bound external resources). Keys are worker indices, as in
    /// [`WorkerContext::worker_id()`].
    ///
    /// Returns [`false`] (failing every given task straight to completion)
    /// unless the pool uses [`QueueStrategy::PerWorker`] and has spawned
    /// workers. Tasks addressed to an out-of-range worker index are failed
    /// to completion as well; the others are still routed.
    ///
    /// On a worker's private queue, tasks respect priority relative to each
    /// other just like on the shared queue.
    pub fn perform_batch(&self, batches: HashMap<u32, Vec<Task>>) -> bool {
        if self.queue_strategy != QueueStrategy::PerWorker || self.workers.is_empty() {
            log_warn!(
                "[owner thread] Pool `{}` cannot route task batches, failing them",
                self.shared.name()
            );
            for tasks in batches.into_values() {
                for mut task in tasks {
                    task.fail();
                    self.shared.submit_completion(task);
                }
            }
            return false;
        }

        let mut routed = false;
        for (index, tasks) in batches {
            let Some(worker) = self.workers.get(index as usize) else {
                log_warn!(
                    "[owner thread] No worker #{index} in pool `{}`, failing {} batched tasks",
                    self.shared.name(),
                    tasks.len()
                );
                for mut task in tasks {
                    task.fail();
                    self.shared.submit_completion(task);
                }
                continue;
            };
            let queue = worker
                .queue()
                .expect("workers of a per-worker-queue pool have private queues");
            #[cfg(feature = "log_tasks")]
            log_info!(
                "Routing {} tasks to worker {}-{}",
                tasks.len(),
                worker.context().name(),
                worker.context().worker_id()
            );
            for mut task in tasks {
                if !task.prepare() {
                    task.fail();
                    self.shared.submit_completion(task);
                    continue;
                }
                self.shared.note_accepted();
                let priority = task.priority();
                queue.push(task, priority, false);
                routed = true;
            }
        }
        if routed {
            self.shared.wake_all();
        }
        true
    }

    /// Runs a single task on a dedicated, detached OS thread, bypassing the
    /// pool's queues and bookkeeping entirely.
    ///
    /// The task's prepare phase still runs synchronously on the calling
    /// thread (a veto short-circuits to completion), and its completion is
    /// still delivered through [`update()`](Self::update) on the owner
    /// thread. Intended for rare, latency-insensitive one-off work;
    /// [`wait_for_all()`](Self::wait_for_all) does not wait for it.
    pub fn perform_async(&self, task: Task) {
        self.shared.perform_async(task);
    }

    /// Returns a cloneable submission handle to this pool, usable from any
    /// thread, typically from inside a task's execute phase to submit
    /// follow-up work.
    pub fn handle(&self) -> PoolHandle {
        PoolHandle {
            shared: self.shared.clone(),
        }
    }

    /// Drains the completion queue once, synchronously running the
    /// completion phase of every finished task, in finish order. Returns the
    /// number of completions delivered. Owner-thread-only.
    ///
    /// This is the single point where worker-thread results cross back into
    /// owner-thread code; embedding event loops should call it once per
    /// tick. Calling it with nothing to deliver is a cheap no-op.
    pub fn update(&self) -> usize {
        self.assert_owner();
        let count = self.shared.completions.drain();
        if count > 0 {
            self.shared.completed.fetch_add(count as u64, Ordering::Relaxed);
        }
        count
    }

    /// Blocks until every in-flight task has finished and had its completion
    /// delivered, or until the timeout elapses. Periodically drains the
    /// completion queue while waiting, so progress is visible to completion
    /// callbacks. Owner-thread-only.
    ///
    /// Returns whether the pool fully drained ([`false`] means the timeout
    /// elapsed first). Tasks spawned with
    /// [`perform_async()`](Self::perform_async) are not waited for.
    pub fn wait_for_all(&self, timeout: Duration) -> bool {
        self.assert_owner();
        let deadline = Instant::now().checked_add(timeout);
        loop {
            if self.shared.pending() == 0 {
                // Completions are buffered before the in-flight counter
                // drops, so one final drain delivers everything.
                self.update();
                return true;
            }
            self.update();
            let wait = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return false;
                    }
                    remaining
                }
                // Absurd timeouts saturate to unbounded waiting.
                None => Duration::from_secs(86_400),
            };
            self.shared.wait_for_exit(wait);
        }
    }

    /// Marks the pool as shutting down and wakes every idle worker, without
    /// joining any thread. Idle workers exit once the queues are empty.
    ///
    /// This is the first half of a two-phase shutdown; call
    /// [`cancel_workers()`](Self::cancel_workers) to join the threads and
    /// flush outstanding tasks.
    pub fn finalize(&self) {
        log_debug!("Finalizing pool `{}`", self.shared.name());
        self.shared.finalize();
    }

    /// Stops and joins every worker, then fails every task that never made
    /// it to a worker and delivers all outstanding completions. Owner-thread
    /// -only.
    ///
    /// A worker busy executing a task finishes that task first (tasks are
    /// not preemptible); the task's completion reflects its real outcome.
    /// Every task still sitting in a queue is forced to completion with its
    /// success flag unset, so no task is ever silently lost.
    ///
    /// Returns [`false`] if there was no spawned worker to cancel.
    pub fn cancel_workers(&mut self) -> bool {
        self.assert_owner();
        if self.workers.is_empty() {
            log_warn!(
                "[owner thread] No spawned workers to cancel in pool `{}`",
                self.shared.name()
            );
            return false;
        }

        for worker in &self.workers {
            worker.request_stop();
        }
        self.shared.wake_all();

        log_debug!("[owner thread] Joining workers of pool `{}`...", self.shared.name());
        let mut private_queues = Vec::new();
        #[allow(clippy::unused_enumerate_index)]
        for (_i, mut worker) in self.workers.drain(..).enumerate() {
            if let Some(queue) = worker.take_queue() {
                private_queues.push(queue);
            }
            let result = worker.join();
            match result {
                Ok(_) => log_debug!("[owner thread] Worker {_i} joined with result: {result:?}"),
                Err(_) => log_error!("[owner thread] Worker {_i} joined with result: {result:?}"),
            }
        }

        // Everything still queued never reached a worker: force it through
        // the completion path, failed.
        let mut orphaned = self.shared.queue.drain();
        for queue in private_queues {
            orphaned.extend(queue.drain());
        }
        for mut task in orphaned {
            task.fail();
            self.shared.finish(task);
        }

        self.update();
        log_debug!("[owner thread] Cancelled workers of pool `{}`", self.shared.name());
        true
    }

    /// Convenience wrapper running the whole lifecycle at once: spawns
    /// workers (if not already running), waits for every in-flight task,
    /// then cancels the workers. Returns whether the pool fully drained
    /// before the timeout. Owner-thread-only.
    pub fn run_to_completion(&mut self, timeout: Duration) -> bool {
        self.spawn_workers();
        let drained = self.wait_for_all(timeout);
        self.cancel_workers();
        drained
    }

    /// Registers (or clears, with [`None`]) a wake callback invoked every
    /// time a finished task is buffered for the owner thread, so an external
    /// event loop can schedule a call to [`update()`](Self::update). The
    /// callback runs on whichever thread finished the task and must not
    /// block.
    pub fn set_completion_wake(&self, wake: Option<WakeFn>) {
        self.shared.completions.set_wake(wake);
    }

    /// Returns the number of worker threads this pool spawns.
    pub fn num_threads(&self) -> NonZeroUsize {
        self.num_threads
    }

    /// Returns the pool's queue topology.
    pub fn queue_strategy(&self) -> QueueStrategy {
        self.queue_strategy
    }

    /// Returns the pool's name.
    pub fn name(&self) -> &str {
        self.shared.name()
    }

    /// Returns the identities of the currently spawned workers.
    pub fn worker_contexts(&self) -> impl Iterator<Item = &WorkerContext> {
        self.workers.iter().map(Worker::context)
    }

    /// Returns whether the calling thread is the pool's owner thread, for
    /// "is this the thread I expect" assertions in embedding code.
    pub fn is_owner_thread(&self) -> bool {
        std::thread::current().id() == self.owner
    }

    /// Number of tasks submitted and not yet finished (queued or executing).
    pub fn pending(&self) -> usize {
        self.shared.pending()
    }

    /// Number of tasks currently sitting in the pool's queues.
    pub fn queued(&self) -> usize {
        let mut count = self.shared.queue.len();
        for worker in &self.workers {
            if let Some(queue) = worker.queue() {
                count += queue.len();
            }
        }
        count
    }

    /// Total number of tasks accepted for execution over the pool's
    /// lifetime.
    pub fn submitted(&self) -> u64 {
        self.shared.submitted.load(Ordering::Relaxed)
    }

    /// Total number of completions delivered to the owner thread over the
    /// pool's lifetime.
    pub fn completed(&self) -> u64 {
        self.shared.completed.load(Ordering::Relaxed)
    }

    fn assert_owner(&self) {
        debug_assert!(
            self.is_owner_thread(),
            "this operation is restricted to the pool's owner thread"
        );
    }
}

impl Drop for TaskPool {
    /// Cancels the pool: joins all the workers and delivers every
    /// outstanding completion, failing tasks that never executed.
    fn drop(&mut self) {
        if !self.workers.is_empty() {
            self.cancel_workers();
        } else {
            for mut task in self.shared.queue.drain() {
                task.fail();
                self.shared.finish(task);
            }
            self.shared.completions.drain();
        }
    }
}

/// A cloneable submission handle to a [`TaskPool`], usable from any thread.
///
/// The handle only submits work; lifecycle and draining stay with the pool's
/// owner. A handle keeps the pool's shared state alive, but outstanding
/// handles don't keep worker threads running: cancelling (or dropping) the
/// pool still tears everything down, and tasks submitted afterwards are
/// only executed once workers are spawned again.
#[derive(Clone)]
pub struct PoolHandle {
    shared: Arc<PoolShared>,
}

impl PoolHandle {
    /// Submits a task to the back of its priority level. See
    /// [`TaskPool::perform()`].
    pub fn perform(&self, task: Task) {
        self.shared.submit(task, false);
    }

    /// Submits a task to the front of its priority level. See
    /// [`TaskPool::perform_first()`].
    pub fn perform_first(&self, task: Task) {
        self.shared.submit(task, true);
    }

    /// Runs a task on a dedicated, detached OS thread. See
    /// [`TaskPool::perform_async()`].
    pub fn perform_async(&self, task: Task) {
        self.shared.perform_async(task);
    }
}
