// Copyright 2024-2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! A fixed-size pool of worker threads sharing one FIFO task queue.

use super::affinity::{pin_current_thread, CpuPinningPolicy};
use super::future::{catch_panic, make_promise, TaskFuture};
use super::util::Status;
use crate::error::Error;
use crate::macros::{log_debug, log_error, log_trace, log_warn};
use crossbeam_utils::CachePadded;
use std::collections::VecDeque;
use std::convert::TryFrom;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{JoinHandle, ThreadId};

/// A type-erased unit of work, consumed by exactly one worker thread.
type Task = Box<dyn FnOnce(&SharedContext) + Send + 'static>;

/// Number of threads to spawn in a worker pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThreadCount {
    /// Spawn the number of threads returned by
    /// [`std::thread::available_parallelism()`], or a single thread if that
    /// number can't be determined.
    AvailableParallelism,
    /// Spawn the given number of threads.
    Count(NonZeroUsize),
}

impl ThreadCount {
    /// Resolves the number of threads to spawn.
    pub fn count(self) -> NonZeroUsize {
        match self {
            ThreadCount::AvailableParallelism => {
                std::thread::available_parallelism().unwrap_or(NonZeroUsize::MIN)
            }
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

/// A builder for [`WorkerPool`].
#[derive(Clone, Debug)]
pub struct WorkerPoolBuilder {
    /// Prefix of the worker thread names, which are `"{name}-{index}"`.
    pub name: String,
    /// Number of worker threads to spawn in the pool.
    pub num_threads: ThreadCount,
    /// Policy to pin worker threads to CPUs.
    pub cpu_pinning: CpuPinningPolicy,
}

impl WorkerPoolBuilder {
    /// Spawns a worker pool.
    ///
    /// ```
    /// # use tileflow::{CpuPinningPolicy, ThreadCount, WorkerPoolBuilder};
    /// let pool = WorkerPoolBuilder {
    ///     name: "worker".to_owned(),
    ///     num_threads: ThreadCount::try_from(2).unwrap(),
    ///     cpu_pinning: CpuPinningPolicy::No,
    /// }
    /// .build()
    /// .unwrap();
    ///
    /// let future = pool.submit(|| 6 * 7).unwrap();
    /// assert_eq!(future.wait(), Ok(42));
    /// ```
    pub fn build(&self) -> Result<WorkerPool, Error> {
        WorkerPool::new(self)
    }
}

/// Pending tasks and the stop flag, guarded by a single lock.
struct Queue {
    tasks: VecDeque<Task>,
    stopped: bool,
}

/// State shared between a pool handle and its worker threads.
struct SharedContext {
    /// Task queue and stop flag. Worker threads wait on the associated
    /// condition variable.
    queue: Status<Queue>,
    /// Number of tasks that worker threads have finished running.
    num_completed: CachePadded<AtomicUsize>,
    /// Number of worker threads that haven't exited yet.
    num_alive: Status<usize>,
}

/// A pool of worker threads executing submitted tasks in FIFO order.
///
/// The number of threads is fixed when the pool is built. Dropping the pool
/// is equivalent to calling [`shutdown()`](Self::shutdown): tasks that were
/// already submitted still run before the threads are joined.
pub struct WorkerPool {
    /// Name of the pool, used to name the worker threads.
    name: String,
    /// Number of worker threads that were spawned.
    num_threads: NonZeroUsize,
    /// Handles to the worker threads that haven't been joined yet.
    threads: Mutex<Vec<JoinHandle<()>>>,
    /// IDs of all the worker threads.
    thread_ids: Vec<ThreadId>,
    /// Context shared with the worker threads.
    shared_context: Arc<SharedContext>,
}

impl WorkerPool {
    /// Creates a new worker pool using the given parameters.
    fn new(builder: &WorkerPoolBuilder) -> Result<Self, Error> {
        let num_threads = builder.num_threads.count();
        let shared_context = Arc::new(SharedContext {
            queue: Status::new(Queue {
                tasks: VecDeque::new(),
                stopped: false,
            }),
            num_completed: CachePadded::new(AtomicUsize::new(0)),
            num_alive: Status::new(0),
        });

        let mut threads = Vec::with_capacity(num_threads.get());
        for id in 0..num_threads.get() {
            let mut context = ThreadContext {
                name: format!("{}-{id}", builder.name),
                cpu_pinning: builder.cpu_pinning,
                shared_context: shared_context.clone(),
            };
            // Counted before spawning, so that a shutdown never misses a
            // thread that hasn't started yet.
            *shared_context.num_alive.lock() += 1;
            let spawned = std::thread::Builder::new()
                .name(context.name.clone())
                .spawn(move || context.run());
            match spawned {
                Ok(handle) => threads.push(handle),
                Err(e) => {
                    log_error!("[{}] Failed to spawn worker thread #{id}: {e}", builder.name);
                    *shared_context.num_alive.lock() -= 1;
                    // Dropping the partial pool drains and joins the threads
                    // that did start.
                    drop(Self::from_parts(builder, num_threads, threads, shared_context));
                    return Err(Error::Spawn(e));
                }
            }
        }
        log_debug!("[{}] Spawned {num_threads} thread(s)", builder.name);

        Ok(Self::from_parts(builder, num_threads, threads, shared_context))
    }

    fn from_parts(
        builder: &WorkerPoolBuilder,
        num_threads: NonZeroUsize,
        threads: Vec<JoinHandle<()>>,
        shared_context: Arc<SharedContext>,
    ) -> Self {
        Self {
            name: builder.name.clone(),
            num_threads,
            thread_ids: threads.iter().map(|t| t.thread().id()).collect(),
            threads: Mutex::new(threads),
            shared_context,
        }
    }

    /// Returns the number of worker threads that have been spawned in this
    /// pool.
    pub fn num_threads(&self) -> NonZeroUsize {
        self.num_threads
    }

    /// Returns the name of this pool.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the number of submitted tasks that no worker thread has picked
    /// up yet.
    pub fn pending_tasks(&self) -> usize {
        self.shared_context.queue.lock().tasks.len()
    }

    /// Returns the number of tasks that worker threads have finished running,
    /// including the ones that panicked.
    pub fn completed_tasks(&self) -> usize {
        self.shared_context.num_completed.load(Ordering::Acquire)
    }

    /// Returns whether [`shutdown()`](Self::shutdown) was requested.
    pub fn is_stopped(&self) -> bool {
        self.shared_context.queue.lock().stopped
    }

    /// Submits a task to the pool, returning a handle to its eventual output.
    ///
    /// A panic inside `f` is captured and reported through the returned
    /// [`TaskFuture`]; the worker thread keeps running.
    ///
    /// Fails with [`Error::PoolStopped`] if the pool is shutting down, in
    /// which case `f` is dropped without running.
    pub fn submit<R, F>(&self, f: F) -> Result<TaskFuture<R>, Error>
    where
        R: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        let (promise, future) = make_promise();
        let task: Task = Box::new(move |context: &SharedContext| {
            let outcome = catch_panic(f);
            // Counted before the submitter can observe the outcome.
            context.num_completed.fetch_add(1, Ordering::Release);
            promise.fulfill(outcome);
        });

        {
            let mut queue = self.shared_context.queue.lock();
            if queue.stopped {
                log_warn!("[{}] Rejected a task submitted after shutdown", self.name);
                return Err(Error::PoolStopped);
            }
            queue.tasks.push_back(task);
            log_trace!("[{}] Enqueued a task, {} pending", self.name, queue.tasks.len());
        }
        self.shared_context.queue.notify_one();

        Ok(future)
    }

    /// Stops accepting new tasks, waits for the already submitted tasks to
    /// run, and joins all the worker threads.
    ///
    /// Calling this more than once, possibly from several threads at the same
    /// time, is harmless: every call returns once all the worker threads have
    /// exited. The only exception is a call from one of this pool's own tasks,
    /// which only stops the pool and returns immediately, as its thread can't
    /// wait for itself.
    pub fn shutdown(&self) {
        log_debug!("[{}] Notifying threads to finish...", self.name);
        self.shared_context
            .queue
            .update_and_notify_all(|queue| queue.stopped = true);

        if self.thread_ids.contains(&std::thread::current().id()) {
            // The worker threads exit on their own once the queue is empty.
            log_warn!(
                "[{}] Shutdown requested from a worker thread, not waiting",
                self.name
            );
            return;
        }

        let threads = std::mem::take(&mut *self.lock_threads());
        if !threads.is_empty() {
            log_debug!("[{}] Joining threads in the pool...", self.name);
        }
        for t in threads {
            log_trace!(
                "[{}] Joining {}",
                self.name,
                t.thread().name().unwrap_or_default()
            );
            if t.join().is_err() {
                log_error!("[{}] Failed to join a worker thread", self.name);
            }
        }

        // Another caller may have taken the handles first.
        drop(
            self.shared_context
                .num_alive
                .wait_while(|num_alive| *num_alive > 0),
        );
        log_debug!("[{}] Joined threads.", self.name);
    }

    fn lock_threads(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.threads.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for WorkerPool {
    /// Drains the queue and joins all the threads in the pool.
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Context object owned by a worker thread.
struct ThreadContext {
    /// Thread name, which includes its index in the pool.
    name: String,
    /// Policy to pin this thread to CPUs.
    cpu_pinning: CpuPinningPolicy,
    /// Context shared with the pool handle.
    shared_context: Arc<SharedContext>,
}

impl ThreadContext {
    /// Main function run by this thread.
    fn run(&mut self) {
        let _exit_notifier = ExitNotifier(&self.shared_context.num_alive);
        self.apply_cpu_pinning();

        loop {
            let task = {
                let mut queue = self
                    .shared_context
                    .queue
                    .wait_while(|queue| queue.tasks.is_empty() && !queue.stopped);
                match queue.tasks.pop_front() {
                    Some(task) => task,
                    // Stopped and fully drained.
                    None => break,
                }
            };

            log_trace!("[{}] Running a task", self.name);
            // Tasks capture their own panics into their promise.
            task(&self.shared_context);
        }

        log_debug!("[{}] Exiting", self.name);
    }

    fn apply_cpu_pinning(&self) {
        match self.cpu_pinning {
            CpuPinningPolicy::No => (),
            CpuPinningPolicy::IfSupported(range) => match pin_current_thread(range) {
                Ok(_pinned) => log_debug!(
                    "[{}] Pinned to CPUs {}..={}",
                    self.name,
                    _pinned.first,
                    _pinned.last
                ),
                Err(_e) => log_warn!("[{}] Failed to set CPU affinity: {_e}", self.name),
            },
        }
    }
}

/// Decrements the number of alive threads when dropped, including during
/// unwinding.
struct ExitNotifier<'a>(&'a Status<usize>);

impl Drop for ExitNotifier<'_> {
    fn drop(&mut self) {
        self.0.update_and_notify_all(|num_alive| *num_alive -= 1);
    }
}
