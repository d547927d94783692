// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

/// An ergonomic wrapper around a [`Mutex`]-[`Condvar`] pair.
///
/// Poisoning is ignored: no user code ever runs while one of these mutexes is
/// held, so a poisoned state can only come from a panic in this crate between
/// two consistent updates.
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

    /// Locks the status without waiting on the condition variable.
    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.mutex.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Notifies one waiting thread. The caller is expected to have updated
    /// the status under [`lock()`](Self::lock) beforehand.
    pub fn notify_one(&self) {
        self.condvar.notify_one();
    }

    /// Applies the given update and notifies all waiting threads.
    pub fn update_and_notify_all(&self, f: impl FnOnce(&mut T)) {
        f(&mut *self.lock());
        self.condvar.notify_all();
    }

    /// Waits until the predicate is false on this status.
    ///
    /// This returns a [`MutexGuard`], allowing to further inspect or modify the
    /// status.
    pub fn wait_while(&self, predicate: impl FnMut(&mut T) -> bool) -> MutexGuard<'_, T> {
        self.condvar
            .wait_while(self.lock(), predicate)
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn status_wait_while() {
        let status = Arc::new(Status::new(0));

        let waiter = std::thread::spawn({
            let status = status.clone();
            move || *status.wait_while(|x| *x < 3)
        });

        for _ in 0..3 {
            status.update_and_notify_all(|x| *x += 1);
        }

        assert_eq!(waiter.join().unwrap(), 3);
        assert_eq!(*status.lock(), 3);
    }

    #[test]
    fn status_notify_one_wakes_a_waiter() {
        let status = Arc::new(Status::new(false));

        let waiter = std::thread::spawn({
            let status = status.clone();
            move || {
                let guard = status.wait_while(|ready| !*ready);
                *guard
            }
        });

        *status.lock() = true;
        status.notify_one();

        assert!(waiter.join().unwrap());
    }

    #[test]
    fn status_recovers_from_poison() {
        let status = Arc::new(Status::new(1));

        let _ = std::thread::spawn({
            let status = status.clone();
            move || {
                let _guard = status.lock();
                panic!("poison the mutex");
            }
        })
        .join();

        *status.lock() += 1;
        assert_eq!(*status.wait_while(|x| *x == 1), 2);
    }
}
