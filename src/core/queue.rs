// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Thread-safe priority-ordered work queue.

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;

/// Number of empty buckets kept around for reuse.
const MAX_SPARE_BUCKETS: usize = 16;

/// A thread-safe container mapping priority levels to FIFO sequences of
/// values.
///
/// [`pop()`](Self::pop) returns the oldest value of the highest non-empty
/// priority level. Within a level, values come out in insertion order, except
/// that a value pushed with `insert_first` goes to the front of its own level
/// (and of its own level only: it never jumps ahead of a higher level).
///
/// Internally, two mutually exclusive locks guard (a) the queue contents and
/// (b) a free list of recycled per-level buckets, so that producers releasing
/// storage don't contend with the popping consumer. The free list is purely
/// an allocation-reuse optimization: it has no effect on ordering.
pub struct PriorityQueue<T> {
    levels: Mutex<BTreeMap<i32, VecDeque<T>>>,
    spares: Mutex<Vec<VecDeque<T>>>,
}

impl<T> PriorityQueue<T> {
    /// Creates a new, empty queue.
    pub fn new() -> Self {
        Self {
            levels: Mutex::new(BTreeMap::new()),
            spares: Mutex::new(Vec::new()),
        }
    }

    /// Appends a value to the given priority level, at the front of the level
    /// if `insert_first` is set, otherwise at the back.
    pub fn push(&self, value: T, priority: i32, insert_first: bool) {
        // The spare bucket is grabbed outside of the contents lock; the two
        // locks are never held at the same time.
        let spare = self.take_spare();
        let unused = {
            let mut levels = self.levels.lock().unwrap();
            match levels.entry(priority) {
                Entry::Occupied(mut entry) => {
                    if insert_first {
                        entry.get_mut().push_front(value);
                    } else {
                        entry.get_mut().push_back(value);
                    }
                    spare
                }
                Entry::Vacant(entry) => {
                    let bucket = entry.insert(spare.unwrap_or_default());
                    bucket.push_back(value);
                    None
                }
            }
        };
        if let Some(bucket) = unused {
            self.put_spare(bucket);
        }
    }

    /// Removes and returns the oldest value of the highest non-empty priority
    /// level, or [`None`] if the queue is empty. Never blocks on anything but
    /// the internal locks.
    pub fn pop(&self) -> Option<T> {
        let (value, empty_bucket) = {
            let mut levels = self.levels.lock().unwrap();
            let mut entry = levels.last_entry()?;
            let value = entry
                .get_mut()
                .pop_front()
                .expect("a drained priority level is never left in the queue");
            let empty_bucket = if entry.get().is_empty() {
                Some(entry.remove())
            } else {
                None
            };
            (value, empty_bucket)
        };
        if let Some(bucket) = empty_bucket {
            self.put_spare(bucket);
        }
        Some(value)
    }

    /// Visits every queued value without removing it, in pop order, together
    /// with its priority.
    pub fn for_each(&self, mut f: impl FnMut(i32, &T)) {
        let levels = self.levels.lock().unwrap();
        for (&priority, bucket) in levels.iter().rev() {
            for value in bucket {
                f(priority, value);
            }
        }
    }

    /// Removes and returns every queued value, in pop order.
    pub fn drain(&self) -> Vec<T> {
        let levels = std::mem::take(&mut *self.levels.lock().unwrap());
        let mut values = Vec::new();
        for (_, mut bucket) in levels.into_iter().rev() {
            values.extend(bucket.drain(..));
            self.put_spare(bucket);
        }
        values
    }

    /// Returns the number of queued values.
    pub fn len(&self) -> usize {
        self.levels.lock().unwrap().values().map(VecDeque::len).sum()
    }

    /// Returns whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.levels.lock().unwrap().is_empty()
    }

    fn take_spare(&self) -> Option<VecDeque<T>> {
        self.spares.lock().unwrap().pop()
    }

    fn put_spare(&self, bucket: VecDeque<T>) {
        debug_assert!(bucket.is_empty());
        let mut spares = self.spares.lock().unwrap();
        if spares.len() < MAX_SPARE_BUCKETS {
            spares.push(bucket);
        }
    }
}

impl<T> Default for PriorityQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn pop_returns_highest_priority_first() {
        let queue = PriorityQueue::new();
        queue.push("low", 1, false);
        queue.push("high", 5, false);
        queue.push("mid", 3, false);

        assert_eq!(queue.pop(), Some("high"));
        assert_eq!(queue.pop(), Some("mid"));
        assert_eq!(queue.pop(), Some("low"));
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn fifo_within_a_level() {
        let queue = PriorityQueue::new();
        queue.push('a', 0, false);
        queue.push('b', 0, false);
        queue.push('c', 0, false);

        assert_eq!(queue.pop(), Some('a'));
        assert_eq!(queue.pop(), Some('b'));
        assert_eq!(queue.pop(), Some('c'));
    }

    #[test]
    fn insert_first_jumps_its_own_level_only() {
        let queue = PriorityQueue::new();
        queue.push("normal", 0, false);
        queue.push("urgent", 0, true);
        queue.push("higher", 1, false);

        // The urgent value overtakes its own level, not the higher one.
        assert_eq!(queue.pop(), Some("higher"));
        assert_eq!(queue.pop(), Some("urgent"));
        assert_eq!(queue.pop(), Some("normal"));
    }

    #[test]
    fn negative_priorities_sort_below_zero() {
        let queue = PriorityQueue::new();
        queue.push("background", -10, false);
        queue.push("default", 0, false);

        assert_eq!(queue.pop(), Some("default"));
        assert_eq!(queue.pop(), Some("background"));
    }

    #[test]
    fn len_and_is_empty() {
        let queue = PriorityQueue::new();
        assert!(queue.is_empty());
        assert_eq!(queue.len(), 0);

        queue.push(1, 0, false);
        queue.push(2, 7, false);
        assert!(!queue.is_empty());
        assert_eq!(queue.len(), 2);

        queue.pop();
        queue.pop();
        assert!(queue.is_empty());
    }

    #[test]
    fn for_each_visits_in_pop_order() {
        let queue = PriorityQueue::new();
        queue.push(20, 2, false);
        queue.push(10, 1, false);
        queue.push(21, 2, false);

        let mut visited = Vec::new();
        queue.for_each(|priority, &value| visited.push((priority, value)));
        assert_eq!(visited, [(2, 20), (2, 21), (1, 10)]);

        // Visiting doesn't remove anything.
        assert_eq!(queue.len(), 3);
    }

    #[test]
    fn drain_removes_everything_in_pop_order() {
        let queue = PriorityQueue::new();
        queue.push(10, 1, false);
        queue.push(0, 0, false);
        queue.push(11, 1, false);

        assert_eq!(queue.drain(), [10, 11, 0]);
        assert!(queue.is_empty());
        assert_eq!(queue.drain(), []);
    }

    #[test]
    fn bucket_recycling_preserves_fifo() {
        let queue = PriorityQueue::new();
        // Fill and fully drain a level several times, so pushes go through
        // recycled buckets, and check that ordering is unaffected.
        for round in 0..10 {
            for i in 0..100 {
                queue.push((round, i), 0, false);
            }
            for i in 0..100 {
                assert_eq!(queue.pop(), Some((round, i)));
            }
        }
    }

    #[test]
    fn concurrent_producers_single_consumer() {
        const NUM_PRODUCERS: usize = 4;
        const PER_PRODUCER: usize = 1000;

        let queue = Arc::new(PriorityQueue::new());

        let producers = (0..NUM_PRODUCERS)
            .map(|p| {
                std::thread::spawn({
                    let queue = queue.clone();
                    move || {
                        for i in 0..PER_PRODUCER {
                            queue.push((p, i), (i % 3) as i32, false);
                        }
                    }
                })
            })
            .collect::<Vec<_>>();
        for producer in producers {
            producer.join().unwrap();
        }

        let mut popped = Vec::new();
        while let Some(value) = queue.pop() {
            popped.push(value);
        }
        assert_eq!(popped.len(), NUM_PRODUCERS * PER_PRODUCER);

        // Per-producer FIFO within each priority level.
        for p in 0..NUM_PRODUCERS {
            for priority in 0..3 {
                let items = popped
                    .iter()
                    .filter(|(q, i)| *q == p && i % 3 == priority)
                    .collect::<Vec<_>>();
                assert!(items.windows(2).all(|w| w[0].1 < w[1].1));
            }
        }
    }
}
