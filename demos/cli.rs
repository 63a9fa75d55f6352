// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! CLI tool to run scheduling scenarios on a task pool.

use clap::{Parser, ValueEnum};
use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha12Rng;
use std::collections::HashMap;
use std::hint::black_box;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tasklight::{CpuPinningPolicy, QueueStrategy, Task, TaskPoolBuilder, ThreadCount};

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let mut pool = TaskPoolBuilder {
        num_threads: match cli.num_threads {
            Some(num_threads) => ThreadCount::Count(num_threads),
            None => ThreadCount::AvailableParallelism,
        },
        queue_strategy: match cli.queue_strategy {
            QueueStrategyCli::Shared => QueueStrategy::Shared,
            QueueStrategyCli::PerWorker => QueueStrategy::PerWorker,
        },
        cpu_pinning: CpuPinningPolicy::IfSupported,
        name: "cli".to_string(),
    }
    .build();
    pool.spawn_workers();

    let start = Instant::now();
    let checksum = Arc::new(AtomicU64::new(0));
    match cli.scenario {
        Scenario::Throughput => {
            for i in 0..cli.num_tasks {
                let checksum = checksum.clone();
                pool.perform(
                    Task::builder()
                        .execute(move |_| {
                            checksum.fetch_add(black_box(i), Ordering::Relaxed);
                            true
                        })
                        .build(),
                );
            }
        }
        Scenario::Priorities => {
            // Mixed priorities, fixed by a constant seed for reproducibility.
            let mut rng = ChaCha12Rng::seed_from_u64(42);
            for i in 0..cli.num_tasks {
                let checksum = checksum.clone();
                pool.perform(
                    Task::builder()
                        .priority(rng.random_range(-5..=5))
                        .execute(move |_| {
                            checksum.fetch_add(black_box(i), Ordering::Relaxed);
                            true
                        })
                        .build(),
                );
            }
        }
        Scenario::Batches => {
            let num_workers = pool.num_threads().get() as u64;
            let mut batches = HashMap::new();
            for worker in 0..num_workers {
                let tasks = (0..cli.num_tasks / num_workers)
                    .map(|i| {
                        let checksum = checksum.clone();
                        Task::builder()
                            .execute(move |_| {
                                checksum.fetch_add(black_box(i), Ordering::Relaxed);
                                true
                            })
                            .build()
                    })
                    .collect::<Vec<_>>();
                batches.insert(worker as u32, tasks);
            }
            if !pool.perform_batch(batches) {
                eprintln!("batch routing requires --queue-strategy per-worker");
            }
        }
    }

    let drained = pool.wait_for_all(Duration::from_secs(cli.timeout));
    pool.cancel_workers();

    println!(
        "{} tasks ({} completions) in {:?}, checksum = {}, drained = {drained}",
        pool.submitted(),
        pool.completed(),
        start.elapsed(),
        checksum.load(Ordering::Relaxed),
    );
}

/// CLI tool to run scheduling scenarios on a task pool.
#[derive(Parser, Debug, PartialEq, Eq)]
#[command(version)]
struct Cli {
    /// Number of worker threads. Default to the available parallelism.
    #[arg(long)]
    num_threads: Option<NonZeroUsize>,

    /// Queue topology of the pool.
    #[arg(long, value_enum)]
    queue_strategy: QueueStrategyCli,

    /// Scenario to run.
    #[arg(long, value_enum)]
    scenario: Scenario,

    /// Number of tasks to submit.
    #[arg(long, default_value_t = 1_000_000)]
    num_tasks: u64,

    /// Timeout in seconds to wait for the tasks to drain.
    #[arg(long, default_value_t = 60)]
    timeout: u64,
}

/// Queue topology of the pool.
#[derive(ValueEnum, Clone, Debug, PartialEq, Eq)]
enum QueueStrategyCli {
    /// All workers drain one shared priority queue.
    Shared,
    /// Each worker owns a private queue, fed by batch routing.
    PerWorker,
}

/// Scenario to run.
#[derive(ValueEnum, Clone, Debug, PartialEq, Eq)]
enum Scenario {
    /// Submit uniform tasks and drain them.
    Throughput,
    /// Submit tasks with mixed priorities and drain them.
    Priorities,
    /// Route one batch of tasks to each worker.
    Batches,
}
