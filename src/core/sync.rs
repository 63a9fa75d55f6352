// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Synchronization primitives.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// An ergonomic wrapper around a [`Mutex`]-[`Condvar`] pair.
pub struct Status<T> {
    mutex: Mutex<T>,
    condvar: Condvar,
}

impl<T> Status<T> {
    /// Creates a new status initialized with the given value.
    pub fn new(t: T) -> Self {
        Self {
            mutex: Mutex::new(t),
            condvar: Condvar::new(),
        }
    }

    /// Runs the given function on the status, without waiting nor notifying.
    pub fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        f(&mut self.mutex.lock().unwrap())
    }

    /// Updates the status with the given function and notifies one waiting
    /// thread.
    pub fn update_one(&self, f: impl FnOnce(&mut T)) {
        f(&mut self.mutex.lock().unwrap());
        self.condvar.notify_one();
    }

    /// Updates the status with the given function and notifies all waiting
    /// threads.
    pub fn update_all(&self, f: impl FnOnce(&mut T)) {
        f(&mut self.mutex.lock().unwrap());
        self.condvar.notify_all();
    }

    /// Attempts to update the status with the given function, notifying one
    /// waiting thread on success.
    ///
    /// Fails if the [`Mutex`] is poisoned. This is the variant to use on
    /// unwinding code paths, where a second panic would abort the process.
    pub fn try_notify_one(
        &self,
        f: impl FnOnce(&mut T),
    ) -> Result<(), PoisonError<MutexGuard<'_, T>>> {
        let mut guard = self.mutex.lock()?;
        f(&mut guard);
        self.condvar.notify_one();
        Ok(())
    }

    /// Waits until the predicate is false on this status.
    ///
    /// This returns a [`MutexGuard`], allowing to further inspect or modify
    /// the status.
    pub fn wait_while(&self, predicate: impl FnMut(&mut T) -> bool) -> MutexGuard<'_, T> {
        self.condvar
            .wait_while(self.mutex.lock().unwrap(), predicate)
            .unwrap()
    }

    /// Waits until the predicate is false on this status, or until the given
    /// duration has elapsed.
    ///
    /// Returns whether the wait timed out with the predicate still true.
    pub fn wait_timeout_while(
        &self,
        duration: Duration,
        predicate: impl FnMut(&mut T) -> bool,
    ) -> bool {
        let (_guard, result) = self
            .condvar
            .wait_timeout_while(self.mutex.lock().unwrap(), duration, predicate)
            .unwrap();
        result.timed_out()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn status_update_is_visible_to_waiter() {
        let status = Arc::new(Status::new(0));

        let waiter = std::thread::spawn({
            let status = status.clone();
            move || {
                let guard = status.wait_while(|x| *x < 10);
                *guard
            }
        });

        for _ in 0..10 {
            status.update_one(|x| *x += 1);
        }

        assert_eq!(waiter.join().unwrap(), 10);
    }

    #[test]
    fn status_wait_timeout_expires() {
        let status = Status::new(false);
        let timed_out = status.wait_timeout_while(Duration::from_millis(10), |done| !*done);
        assert!(timed_out);
    }

    #[test]
    fn status_wait_timeout_notified() {
        let status = Arc::new(Status::new(false));

        let notifier = std::thread::spawn({
            let status = status.clone();
            move || status.update_all(|done| *done = true)
        });

        let timed_out = status.wait_timeout_while(Duration::from_secs(60), |done| !*done);
        assert!(!timed_out);
        notifier.join().unwrap();
    }

    #[test]
    fn status_with_inspects_and_modifies() {
        let status = Status::new(41);
        status.with(|x| *x += 1);
        assert_eq!(status.with(|x| *x), 42);
    }

    #[test]
    fn status_try_notify_one_succeeds() {
        let status = Status::new(1);
        assert!(status.try_notify_one(|x| *x = 2).is_ok());
        assert_eq!(status.with(|x| *x), 2);
    }
}
