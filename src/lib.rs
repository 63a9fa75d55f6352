// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

#![doc = include_str!("../README.md")]
#![forbid(missing_docs, unsafe_code)]

mod core;
mod macros;

pub use crate::core::{
    CpuPinningPolicy, PoolHandle, PriorityQueue, QueueStrategy, Task, TaskBuilder, TaskData,
    TaskPool, TaskPoolBuilder, ThreadCount, WakeFn, Work, WorkerContext,
};

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc::channel;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(60);

    fn build_pool(num_threads: usize, queue_strategy: QueueStrategy) -> TaskPool {
        TaskPoolBuilder {
            num_threads: ThreadCount::try_from(num_threads).unwrap(),
            queue_strategy,
            cpu_pinning: CpuPinningPolicy::No,
            name: "test".to_string(),
        }
        .build()
    }

    macro_rules! expand_tests {
        ( $queue_strategy:expr, ) => {};
        ( $queue_strategy:expr, $case:ident, $( $others:tt )* ) => {
            #[test]
            fn $case() {
                $crate::test::$case($queue_strategy);
            }

            expand_tests!($queue_strategy, $($others)*);
        };
    }

    macro_rules! scheduling_tests {
        ( $mod:ident, $queue_strategy:expr, $( $tests:tt )* ) => {
            mod $mod {
                use super::*;

                expand_tests!($queue_strategy, $($tests)*);
            }
        };
    }

    macro_rules! all_scheduling_tests {
        ( $mod:ident, $queue_strategy:expr ) => {
            scheduling_tests!(
                $mod,
                $queue_strategy,
                test_sum_of_tasks,
                test_completions_run_on_owner_thread,
                test_prepare_veto_completes_failed,
                test_submit_from_execute,
                test_cancel_completes_every_task_exactly_once,
                test_panic_in_execute_delivers_failed_completion,
                test_drop_delivers_unexecuted_completions,
                test_wait_for_all_times_out,
                test_update_with_no_completions_is_a_noop,
                test_counters_add_up,
            );
        };
    }

    all_scheduling_tests!(shared_queue, QueueStrategy::Shared);
    all_scheduling_tests!(per_worker_queue, QueueStrategy::PerWorker);

    fn test_sum_of_tasks(queue_strategy: QueueStrategy) {
        const NUM_TASKS: usize = 100;

        let mut pool = build_pool(2, queue_strategy);
        assert!(pool.spawn_workers());

        let sum = Arc::new(AtomicUsize::new(0));
        let successes = Arc::new(AtomicUsize::new(0));
        for i in 0..NUM_TASKS {
            let sum = sum.clone();
            let successes = successes.clone();
            pool.perform(
                Task::builder()
                    .execute(move |_| {
                        sum.fetch_add(i, Ordering::Relaxed);
                        true
                    })
                    .complete(move |data| {
                        if data.success() {
                            successes.fetch_add(1, Ordering::Relaxed);
                        }
                    })
                    .build(),
            );
        }

        assert!(pool.wait_for_all(WAIT));
        assert!(pool.cancel_workers());

        assert_eq!(sum.load(Ordering::Relaxed), NUM_TASKS * (NUM_TASKS - 1) / 2);
        assert_eq!(successes.load(Ordering::Relaxed), NUM_TASKS);
    }

    fn test_completions_run_on_owner_thread(queue_strategy: QueueStrategy) {
        const NUM_TASKS: usize = 50;

        let mut pool = build_pool(4, queue_strategy);
        assert!(pool.spawn_workers());

        let owner = std::thread::current().id();
        let mismatches = Arc::new(AtomicUsize::new(0));
        let completions = Arc::new(AtomicUsize::new(0));
        for _ in 0..NUM_TASKS {
            let mismatches = mismatches.clone();
            let completions = completions.clone();
            pool.perform(
                Task::builder()
                    .execute(|_| true)
                    .complete(move |_| {
                        if std::thread::current().id() != owner {
                            mismatches.fetch_add(1, Ordering::Relaxed);
                        }
                        completions.fetch_add(1, Ordering::Relaxed);
                    })
                    .build(),
            );
        }

        assert!(pool.wait_for_all(WAIT));
        assert_eq!(completions.load(Ordering::Relaxed), NUM_TASKS);
        assert_eq!(mismatches.load(Ordering::Relaxed), 0);
    }

    fn test_prepare_veto_completes_failed(queue_strategy: QueueStrategy) {
        let mut pool = build_pool(2, queue_strategy);
        assert!(pool.spawn_workers());

        let executed = Arc::new(AtomicUsize::new(0));
        let completed = Arc::new(Mutex::new(Vec::new()));
        pool.perform(
            Task::builder()
                .prepare(|_| false)
                .execute({
                    let executed = executed.clone();
                    move |_| {
                        executed.fetch_add(1, Ordering::Relaxed);
                        true
                    }
                })
                .complete({
                    let completed = completed.clone();
                    move |data| completed.lock().unwrap().push(data.success())
                })
                .build(),
        );

        // The vetoed task is already buffered: the very next update delivers
        // it without waiting for any worker.
        assert_eq!(pool.update(), 1);
        assert_eq!(executed.load(Ordering::Relaxed), 0);
        assert_eq!(*completed.lock().unwrap(), [false]);
    }

    fn test_submit_from_execute(queue_strategy: QueueStrategy) {
        let mut pool = build_pool(2, queue_strategy);
        assert!(pool.spawn_workers());

        let counter = Arc::new(AtomicUsize::new(0));
        let handle = pool.handle();
        pool.perform(
            Task::builder()
                .execute({
                    let counter = counter.clone();
                    move |_| {
                        counter.fetch_add(1, Ordering::Relaxed);
                        handle.perform(
                            Task::builder()
                                .execute({
                                    let counter = counter.clone();
                                    move |_| {
                                        counter.fetch_add(1, Ordering::Relaxed);
                                        true
                                    }
                                })
                                .build(),
                        );
                        true
                    }
                })
                .build(),
        );

        assert!(pool.wait_for_all(WAIT));
        assert_eq!(counter.load(Ordering::Relaxed), 2);
    }

    fn test_cancel_completes_every_task_exactly_once(queue_strategy: QueueStrategy) {
        const NUM_TASKS: usize = 20;

        let mut pool = build_pool(1, queue_strategy);
        assert!(pool.spawn_workers());

        // The first task parks the only worker so the others pile up in the
        // queue until it is released.
        let (release, blocked) = channel::<()>();
        pool.perform(
            Task::builder()
                .execute(move |_| blocked.recv().is_ok())
                .build(),
        );

        let executions = Arc::new(
            (0..NUM_TASKS)
                .map(|_| AtomicUsize::new(0))
                .collect::<Vec<_>>(),
        );
        let completions = Arc::new(
            (0..NUM_TASKS)
                .map(|_| AtomicUsize::new(0))
                .collect::<Vec<_>>(),
        );
        for i in 0..NUM_TASKS {
            let executions = executions.clone();
            let completions = completions.clone();
            pool.perform(
                Task::builder()
                    .tag(i as u32)
                    .execute(move |data| {
                        executions[data.tag() as usize].fetch_add(1, Ordering::Relaxed);
                        true
                    })
                    .complete(move |data| {
                        completions[data.tag() as usize].fetch_add(1, Ordering::Relaxed);
                    })
                    .build(),
            );
        }

        release.send(()).unwrap();
        assert!(pool.cancel_workers());

        // Whatever the worker managed to start before observing the stop
        // signal: every task executed at most once and completed exactly
        // once.
        for execution_count in executions.iter() {
            assert!(execution_count.load(Ordering::Relaxed) <= 1);
        }
        for completion_count in completions.iter() {
            assert_eq!(completion_count.load(Ordering::Relaxed), 1);
        }
        assert_eq!(pool.pending(), 0);
        assert_eq!(pool.queued(), 0);
    }

    fn test_panic_in_execute_delivers_failed_completion(queue_strategy: QueueStrategy) {
        let mut pool = build_pool(2, queue_strategy);
        assert!(pool.spawn_workers());

        let completed = Arc::new(Mutex::new(Vec::new()));
        pool.perform(
            Task::builder()
                .execute(|_| panic!("task panic"))
                .complete({
                    let completed = completed.clone();
                    move |data| completed.lock().unwrap().push(data.success())
                })
                .build(),
        );

        assert!(pool.wait_for_all(WAIT));
        assert_eq!(*completed.lock().unwrap(), [false]);
        pool.cancel_workers();
    }

    fn test_drop_delivers_unexecuted_completions(queue_strategy: QueueStrategy) {
        const NUM_TASKS: usize = 10;

        // Workers are never spawned: every task is still queued when the
        // pool is dropped.
        let pool = build_pool(2, queue_strategy);

        let executed = Arc::new(AtomicUsize::new(0));
        let failed_completions = Arc::new(AtomicUsize::new(0));
        for _ in 0..NUM_TASKS {
            let executed = executed.clone();
            let failed_completions = failed_completions.clone();
            pool.perform(
                Task::builder()
                    .execute(move |_| {
                        executed.fetch_add(1, Ordering::Relaxed);
                        true
                    })
                    .complete(move |data| {
                        if !data.success() {
                            failed_completions.fetch_add(1, Ordering::Relaxed);
                        }
                    })
                    .build(),
            );
        }

        drop(pool);
        assert_eq!(executed.load(Ordering::Relaxed), 0);
        assert_eq!(failed_completions.load(Ordering::Relaxed), NUM_TASKS);
    }

    fn test_wait_for_all_times_out(queue_strategy: QueueStrategy) {
        let mut pool = build_pool(1, queue_strategy);
        assert!(pool.spawn_workers());

        let (release, blocked) = channel::<()>();
        pool.perform(
            Task::builder()
                .execute(move |_| blocked.recv().is_ok())
                .build(),
        );

        assert!(!pool.wait_for_all(Duration::from_millis(10)));

        release.send(()).unwrap();
        assert!(pool.wait_for_all(WAIT));
        assert!(pool.cancel_workers());
    }

    fn test_update_with_no_completions_is_a_noop(queue_strategy: QueueStrategy) {
        let mut pool = build_pool(1, queue_strategy);
        assert!(pool.spawn_workers());
        assert_eq!(pool.update(), 0);
        assert_eq!(pool.update(), 0);
        assert!(pool.cancel_workers());
        assert_eq!(pool.update(), 0);
    }

    fn test_counters_add_up(queue_strategy: QueueStrategy) {
        const NUM_TASKS: usize = 30;

        let mut pool = build_pool(2, queue_strategy);
        assert!(pool.spawn_workers());

        for _ in 0..NUM_TASKS {
            pool.perform(Task::builder().execute(|_| true).build());
        }
        // A vetoed task is never counted as accepted.
        pool.perform(Task::builder().prepare(|_| false).build());

        assert!(pool.wait_for_all(WAIT));
        assert_eq!(pool.submitted(), NUM_TASKS as u64);
        assert_eq!(pool.completed(), NUM_TASKS as u64 + 1);
        assert_eq!(pool.pending(), 0);
    }
}
