// Copyright 2024-2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Orchestrator composing a compute pool and a pipeline pool.

use crate::core::{
    parallelize_tiled_tasks, CpuPinningPolicy, TaskFuture, ThreadCount, WorkerPool,
    WorkerPoolBuilder,
};
use crate::error::Error;
use crate::macros::{log_debug, log_warn};
use std::num::NonZeroUsize;
use std::sync::{Mutex, OnceLock, PoisonError};

/// Configuration of the two pools owned by a [`Flow`].
#[derive(Clone, Debug)]
pub struct FlowBuilder {
    /// Pool running the tiles of
    /// [`parallelize_tiled_tasks()`](Flow::parallelize_tiled_tasks).
    pub compute: WorkerPoolBuilder,
    /// Pool running the tasks of [`add_pipeline()`](Flow::add_pipeline).
    pub pipeline: WorkerPoolBuilder,
}

impl FlowBuilder {
    /// Creates a configuration with the given number of compute and pipeline
    /// threads, without CPU pinning.
    pub fn new(workers: ThreadCount, pipelines: ThreadCount) -> Self {
        Self {
            compute: WorkerPoolBuilder {
                name: "compute".to_owned(),
                num_threads: workers,
                cpu_pinning: CpuPinningPolicy::No,
            },
            pipeline: WorkerPoolBuilder {
                name: "pipeline".to_owned(),
                num_threads: pipelines,
                cpu_pinning: CpuPinningPolicy::No,
            },
        }
    }
}

/// The two pools of an initialized [`Flow`].
struct Pools {
    compute: WorkerPool,
    pipeline: WorkerPool,
}

/// Process-wide access point to a compute pool, for data-parallel tiled
/// work, and a pipeline pool, for longer-lived stages.
///
/// A flow starts uninitialized and becomes usable after a single successful
/// call to [`init()`](Self::init). The two pools are independent schedulers,
/// so a pipeline task may itself dispatch tiles without deadlocking.
///
/// To share a flow with pipeline tasks, wrap it in an
/// [`Arc`](std::sync::Arc).
///
/// ```
/// # use tileflow::Flow;
/// # use std::sync::atomic::{AtomicUsize, Ordering};
/// # use std::sync::Arc;
/// let flow = Arc::new(Flow::new());
/// flow.init(4, 2).unwrap();
///
/// let total = Arc::new(AtomicUsize::new(0));
/// let stage = flow
///     .add_pipeline({
///         let flow = flow.clone();
///         let total = total.clone();
///         move || {
///             flow.parallelize_tiled_tasks(100, 16, move |_start, len| {
///                 total.fetch_add(len, Ordering::Relaxed);
///             })
///         }
///     })
///     .unwrap();
///
/// stage.wait().unwrap().unwrap();
/// assert_eq!(total.load(Ordering::Relaxed), 100);
/// ```
pub struct Flow {
    pools: OnceLock<Pools>,
    /// Serializes initialization, so that pools are built at most once.
    init_lock: Mutex<()>,
}

impl Default for Flow {
    fn default() -> Self {
        Self::new()
    }
}

impl Flow {
    /// Creates an uninitialized flow. No thread is spawned until
    /// [`init()`](Self::init).
    pub const fn new() -> Self {
        Self {
            pools: OnceLock::new(),
            init_lock: Mutex::new(()),
        }
    }

    /// Spawns `workers` compute threads and `pipelines` pipeline threads.
    ///
    /// Fails with [`Error::AlreadyInitialized`] if the flow was already
    /// initialized, leaving the existing pools untouched, and with
    /// [`Error::InvalidThreadCount`] if either count is zero.
    pub fn init(&self, workers: usize, pipelines: usize) -> Result<(), Error> {
        let workers = ThreadCount::try_from(workers).map_err(|_| Error::InvalidThreadCount)?;
        let pipelines = ThreadCount::try_from(pipelines).map_err(|_| Error::InvalidThreadCount)?;
        self.init_with(&FlowBuilder::new(workers, pipelines))
    }

    /// Spawns both pools using the given configuration.
    ///
    /// Fails with [`Error::AlreadyInitialized`] if the flow was already
    /// initialized, leaving the existing pools untouched.
    pub fn init_with(&self, builder: &FlowBuilder) -> Result<(), Error> {
        let _guard = self.init_lock.lock().unwrap_or_else(PoisonError::into_inner);
        if self.pools.get().is_some() {
            log_warn!("Flow is already initialized, ignoring");
            return Err(Error::AlreadyInitialized);
        }

        let compute = builder.compute.build()?;
        let pipeline = builder.pipeline.build()?;
        log_debug!(
            "Flow initialized with {} compute and {} pipeline thread(s)",
            compute.num_threads(),
            pipeline.num_threads()
        );

        if self.pools.set(Pools { compute, pipeline }).is_err() {
            unreachable!("flow pools were set outside of the init lock");
        }
        Ok(())
    }

    /// Returns whether [`init()`](Self::init) succeeded on this flow.
    pub fn is_initialized(&self) -> bool {
        self.pools.get().is_some()
    }

    /// Returns the number of compute threads, if initialized.
    pub fn compute_threads(&self) -> Option<NonZeroUsize> {
        self.pools.get().map(|pools| pools.compute.num_threads())
    }

    /// Returns the number of pipeline threads, if initialized.
    pub fn pipeline_threads(&self) -> Option<NonZeroUsize> {
        self.pools.get().map(|pools| pools.pipeline.num_threads())
    }

    /// Runs `f(start, len)` on every tile of `0..range` on the compute pool,
    /// and waits until all the tiles have finished.
    ///
    /// Tiles have length `tile`, except the last one which may be shorter.
    /// They run concurrently in no particular order. If some tiles panic, the
    /// other tiles still run to completion and all the failures are reported
    /// together as [`Error::Tiles`].
    ///
    /// The tile function may borrow local data.
    pub fn parallelize_tiled_tasks<F>(&self, range: usize, tile: usize, f: F) -> Result<(), Error>
    where
        F: Fn(usize, usize) + Sync,
    {
        parallelize_tiled_tasks(&self.pools()?.compute, range, tile, f)
    }

    /// Submits a single task to the pipeline pool and returns immediately
    /// with a handle to its eventual output.
    pub fn add_pipeline<R, F>(&self, f: F) -> Result<TaskFuture<R>, Error>
    where
        R: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        self.pools()?.pipeline.submit(f)
    }

    /// Stops both pools after draining their queues. Later submissions fail
    /// with [`Error::PoolStopped`].
    ///
    /// Concurrent calls all wait until both pools are drained.
    ///
    /// This also happens when the flow is dropped.
    pub fn shutdown(&self) {
        if let Some(pools) = self.pools.get() {
            // Pipeline stages may still dispatch tiles while draining.
            pools.pipeline.shutdown();
            pools.compute.shutdown();
        }
    }

    fn pools(&self) -> Result<&Pools, Error> {
        self.pools.get().ok_or(Error::NotInitialized)
    }
}

impl Drop for Flow {
    fn drop(&mut self) {
        self.shutdown();
    }
}
