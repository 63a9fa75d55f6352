// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Schedulable unit of work and its three-phase contract.

use std::any::Any;
use std::fmt;

/// The three-phase contract of a schedulable unit of work.
///
/// Each phase receives the mutable [`TaskData`] of the task it belongs to, so
/// state (priority, tag, success flag, target object) flows through the
/// phases without any shared-memory coordination.
///
/// - [`prepare()`](Self::prepare) runs synchronously on the submitting
///   thread, at submission time. Returning [`false`] vetoes the submission:
///   the task skips [`execute()`](Self::execute) entirely and is routed
///   straight to completion, marked unsuccessful.
/// - [`execute()`](Self::execute) runs at most once, on exactly one worker
///   thread. Its return value becomes the task's success flag.
/// - [`complete()`](Self::complete) runs exactly once, on the owner thread,
///   when the owner drains the pool. It can read the success flag and the
///   target to notify the original caller.
///
/// All phases have defaults, so an implementation only writes the phases it
/// needs. A failing `execute` is a normal, expected outcome reported through
/// the success flag; the scheduler never retries a task.
pub trait Work: Send {
    /// Pre-flight check, run on the submitting thread. Returning [`false`]
    /// vetoes the submission.
    fn prepare(&mut self, data: &mut TaskData) -> bool {
        let _ = data;
        true
    }

    /// The work itself, run on a worker thread. The return value becomes the
    /// task's success flag.
    fn execute(&mut self, data: &mut TaskData) -> bool {
        let _ = data;
        true
    }

    /// Completion notification, run on the owner thread.
    fn complete(&mut self, data: &mut TaskData) {
        let _ = data;
    }
}

/// Data carried by a [`Task`] across its phases: priority, tag, success flag
/// and the optional target object.
pub struct TaskData {
    priority: i32,
    tag: u32,
    success: bool,
    target: Option<Box<dyn Any + Send>>,
}

impl TaskData {
    fn new() -> Self {
        Self {
            priority: 0,
            tag: 0,
            success: false,
            target: None,
        }
    }

    /// The task's priority. Higher priorities execute first.
    pub fn priority(&self) -> i32 {
        self.priority
    }

    /// The caller-assigned tag, carried around untouched by the scheduler.
    pub fn tag(&self) -> u32 {
        self.tag
    }

    /// Whether the task succeeded. Meaningful from the completion phase on:
    /// set from `execute`'s return value, or [`false`] if the task never
    /// executed (prepare veto, pool teardown).
    pub fn success(&self) -> bool {
        self.success
    }

    /// Borrows the target object, if one was attached and is of type `T`.
    ///
    /// The target is an arbitrary caller-supplied owned object kept alive for
    /// the task's whole lifetime, typically the resource the task operates
    /// on.
    pub fn target<T: Any>(&self) -> Option<&T> {
        self.target.as_ref()?.downcast_ref()
    }

    /// Mutably borrows the target object, if one was attached and is of type
    /// `T`.
    pub fn target_mut<T: Any>(&mut self) -> Option<&mut T> {
        self.target.as_mut()?.downcast_mut()
    }

    /// Takes the target object out of the task, if one was attached and is of
    /// type `T`. A target of another type is left in place.
    pub fn take_target<T: Any>(&mut self) -> Option<Box<T>> {
        match self.target.take()?.downcast() {
            Ok(target) => Some(target),
            Err(other) => {
                self.target = Some(other);
                None
            }
        }
    }
}

/// A unit of schedulable work: a [`Work`] implementation together with its
/// [`TaskData`].
///
/// A task is created by a producer on any thread and its ownership is moved
/// into the scheduler on submission. From then on exactly one party owns it
/// at a time: the queue while it waits, the worker while it executes, the
/// completion queue between execution and delivery. Completion consumes the
/// task, so every task completes at most once by construction.
pub struct Task {
    data: TaskData,
    work: Box<dyn Work>,
}

impl Task {
    /// Creates a task from a [`Work`] implementation, with priority 0, tag 0
    /// and no target.
    pub fn new(work: impl Work + 'static) -> Self {
        Self {
            data: TaskData::new(),
            work: Box::new(work),
        }
    }

    /// Starts building a task from closures, for callers that don't want to
    /// write a [`Work`] implementation.
    pub fn builder() -> TaskBuilder {
        TaskBuilder::new()
    }

    /// The task's priority. Higher priorities execute first.
    pub fn priority(&self) -> i32 {
        self.data.priority
    }

    /// The caller-assigned tag.
    pub fn tag(&self) -> u32 {
        self.data.tag
    }

    /// Whether the task succeeded. See [`TaskData::success()`].
    pub fn success(&self) -> bool {
        self.data.success
    }

    /// Runs the prepare phase on the calling thread.
    pub(crate) fn prepare(&mut self) -> bool {
        self.work.prepare(&mut self.data)
    }

    /// Runs the execute phase on the calling (worker) thread, recording its
    /// result as the success flag.
    pub(crate) fn execute(&mut self) {
        let success = self.work.execute(&mut self.data);
        self.data.success = success;
    }

    /// Marks the task as unsuccessful without executing it.
    pub(crate) fn fail(&mut self) {
        self.data.success = false;
    }

    /// Runs the completion phase, consuming the task.
    pub(crate) fn complete(mut self) {
        self.work.complete(&mut self.data);
    }

    /// Sets the task's priority. Only meaningful before submission.
    pub fn set_priority(&mut self, priority: i32) {
        self.data.priority = priority;
    }

    /// Sets the caller-assigned tag. Only meaningful before submission.
    pub fn set_tag(&mut self, tag: u32) {
        self.data.tag = tag;
    }

    /// Attaches a target object, kept alive for the task's whole lifetime.
    /// Replaces any previously attached target.
    pub fn set_target(&mut self, target: impl Any + Send) {
        self.data.target = Some(Box::new(target));
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("priority", &self.data.priority)
            .field("tag", &self.data.tag)
            .field("success", &self.data.success)
            .finish_non_exhaustive()
    }
}

type PrepareFn = Box<dyn FnOnce(&mut TaskData) -> bool + Send>;
type ExecuteFn = Box<dyn FnOnce(&mut TaskData) -> bool + Send>;
type CompleteFn = Box<dyn FnOnce(&mut TaskData) + Send>;

/// A builder assembling a [`Task`] from closures.
///
/// Every part is optional: an absent prepare or execute phase behaves as if
/// it returned [`true`], an absent complete phase does nothing.
pub struct TaskBuilder {
    priority: i32,
    tag: u32,
    target: Option<Box<dyn Any + Send>>,
    prepare: Option<PrepareFn>,
    execute: Option<ExecuteFn>,
    complete: Option<CompleteFn>,
}

impl TaskBuilder {
    fn new() -> Self {
        Self {
            priority: 0,
            tag: 0,
            target: None,
            prepare: None,
            execute: None,
            complete: None,
        }
    }

    /// Sets the task's priority. Higher priorities execute first; the
    /// default is 0.
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the caller-assigned tag. The scheduler carries it around
    /// untouched; the default is 0.
    pub fn tag(mut self, tag: u32) -> Self {
        self.tag = tag;
        self
    }

    /// Attaches a target object, kept alive for the task's whole lifetime
    /// and accessible from every phase via [`TaskData::target()`].
    pub fn target(mut self, target: impl Any + Send) -> Self {
        self.target = Some(Box::new(target));
        self
    }

    /// Sets the prepare phase.
    pub fn prepare(mut self, f: impl FnOnce(&mut TaskData) -> bool + Send + 'static) -> Self {
        self.prepare = Some(Box::new(f));
        self
    }

    /// Sets the execute phase.
    pub fn execute(mut self, f: impl FnOnce(&mut TaskData) -> bool + Send + 'static) -> Self {
        self.execute = Some(Box::new(f));
        self
    }

    /// Sets the complete phase.
    pub fn complete(mut self, f: impl FnOnce(&mut TaskData) + Send + 'static) -> Self {
        self.complete = Some(Box::new(f));
        self
    }

    /// Builds the task.
    pub fn build(self) -> Task {
        Task {
            data: TaskData {
                priority: self.priority,
                tag: self.tag,
                success: false,
                target: self.target,
            },
            work: Box::new(FnWork {
                prepare: self.prepare,
                execute: self.execute,
                complete: self.complete,
            }),
        }
    }
}

/// [`Work`] implementation backing [`TaskBuilder`].
struct FnWork {
    prepare: Option<PrepareFn>,
    execute: Option<ExecuteFn>,
    complete: Option<CompleteFn>,
}

impl Work for FnWork {
    fn prepare(&mut self, data: &mut TaskData) -> bool {
        match self.prepare.take() {
            Some(f) => f(data),
            None => true,
        }
    }

    fn execute(&mut self, data: &mut TaskData) -> bool {
        match self.execute.take() {
            Some(f) => f(data),
            None => true,
        }
    }

    fn complete(&mut self, data: &mut TaskData) {
        if let Some(f) = self.complete.take() {
            f(data);
        }
    }
}
