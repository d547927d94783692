// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! One-shot result channel between a worker thread and a submitter.

use super::util::Status;
use crate::error::TaskError;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

/// State of the slot shared by a [`Promise`] and its [`TaskFuture`].
enum Slot<R> {
    /// The task hasn't finished yet.
    Pending,
    /// The task finished, and the outcome hasn't been collected yet.
    Done(Result<R, TaskError>),
}

/// Creates a connected [`Promise`]-[`TaskFuture`] pair.
pub fn make_promise<R>() -> (Promise<R>, TaskFuture<R>) {
    let slot = Arc::new(Status::new(Slot::Pending));
    (
        Promise {
            slot: Some(slot.clone()),
        },
        TaskFuture { slot },
    )
}

/// Write side of a one-shot result channel.
///
/// Dropping a promise without fulfilling it delivers
/// [`TaskError::Abandoned`] to the future.
pub struct Promise<R> {
    slot: Option<Arc<Status<Slot<R>>>>,
}

/// Runs the given function, capturing a panic if any.
pub fn catch_panic<R>(f: impl FnOnce() -> R) -> Result<R, TaskError> {
    catch_unwind(AssertUnwindSafe(f)).map_err(TaskError::from_panic)
}

impl<R> Promise<R> {
    /// Fulfills this promise with the given outcome and wakes up the waiter.
    pub fn fulfill(mut self, outcome: Result<R, TaskError>) {
        if let Some(slot) = self.slot.take() {
            slot.update_and_notify_all(|state| *state = Slot::Done(outcome));
        }
    }
}

impl<R> Drop for Promise<R> {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            slot.update_and_notify_all(|state| *state = Slot::Done(Err(TaskError::Abandoned)));
        }
    }
}

/// Handle to the eventual outcome of a submitted task.
///
/// The outcome can be observed exactly once, via [`wait()`](Self::wait),
/// which consumes the handle. Dropping the handle discards the outcome but
/// doesn't cancel the task.
pub struct TaskFuture<R> {
    slot: Arc<Status<Slot<R>>>,
}

impl<R> TaskFuture<R> {
    /// Returns whether the task has finished, without blocking.
    pub fn is_ready(&self) -> bool {
        matches!(*self.slot.lock(), Slot::Done(_))
    }

    /// Blocks until the task has finished, and returns its output.
    ///
    /// Returns [`TaskError::Panicked`] if the task panicked, or
    /// [`TaskError::Abandoned`] if it was destroyed without running.
    pub fn wait(self) -> Result<R, TaskError> {
        let mut guard = self
            .slot
            .wait_while(|state| matches!(state, Slot::Pending));
        match std::mem::replace(&mut *guard, Slot::Pending) {
            Slot::Done(outcome) => outcome,
            Slot::Pending => unreachable!("woken up on a pending slot"),
        }
    }
}

impl<R> fmt::Debug for TaskFuture<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskFuture")
            .field("ready", &self.is_ready())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_fulfilled_from_another_thread() {
        let (promise, future) = make_promise();
        assert!(!future.is_ready());

        let worker = std::thread::spawn(move || promise.fulfill(catch_panic(|| 6 * 7)));
        assert_eq!(future.wait(), Ok(42));
        worker.join().unwrap();
    }

    #[test]
    fn test_ready_after_fulfill() {
        let (promise, future) = make_promise();
        promise.fulfill(Ok("done"));
        assert!(future.is_ready());
        assert_eq!(future.wait(), Ok("done"));
    }

    #[test]
    fn test_panic_is_captured() {
        let (promise, future) = make_promise::<u32>();
        promise.fulfill(catch_panic(|| panic!("task failure")));
        assert_eq!(
            future.wait(),
            Err(TaskError::Panicked("task failure".to_owned()))
        );
    }

    #[test]
    fn test_dropped_promise_is_abandoned() {
        let (promise, future) = make_promise::<u32>();
        drop(promise);
        assert!(future.is_ready());
        assert_eq!(future.wait(), Err(TaskError::Abandoned));
    }

    #[test]
    fn test_dropped_future_does_not_block_promise() {
        let (promise, future) = make_promise();
        drop(future);
        promise.fulfill(Ok(vec![1, 2, 3]));
    }
}
