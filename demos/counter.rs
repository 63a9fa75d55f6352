// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Simple program that spreads increments of a shared counter over a pool of
//! worker threads.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tasklight::{CpuPinningPolicy, QueueStrategy, Task, TaskPoolBuilder, ThreadCount};

fn main() {
    env_logger::init();

    let mut pool = TaskPoolBuilder {
        num_threads: ThreadCount::AvailableParallelism,
        queue_strategy: QueueStrategy::Shared,
        cpu_pinning: CpuPinningPolicy::IfSupported,
        name: "counter".to_string(),
    }
    .build();
    pool.spawn_workers();

    let num_tasks = 10_000;
    let counter = Arc::new(AtomicU64::new(0));
    for _ in 0..num_tasks {
        let counter = counter.clone();
        pool.perform(
            Task::builder()
                .execute(move |_| {
                    counter.fetch_add(1, Ordering::Relaxed);
                    true
                })
                .build(),
        );
    }

    let drained = pool.wait_for_all(Duration::from_secs(60));
    pool.cancel_workers();

    assert!(drained);
    println!("counter = {}", counter.load(Ordering::Relaxed));
}
