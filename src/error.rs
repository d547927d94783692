// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Error types reported by worker pools and the [`Flow`](crate::Flow).

use std::any::Any;
use std::fmt;

/// Errors returned by worker pools and the [`Flow`](crate::Flow).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A task was submitted after the pool was asked to shut down. The task
    /// wasn't enqueued.
    #[error("submission to a stopped worker pool")]
    PoolStopped,

    /// [`Flow::init()`](crate::Flow::init) was called on an already
    /// initialized flow. The existing pools are left untouched.
    #[error("flow is already initialized")]
    AlreadyInitialized,

    /// Work was submitted to a [`Flow`](crate::Flow) before
    /// [`Flow::init()`](crate::Flow::init).
    #[error("flow is not initialized")]
    NotInitialized,

    /// A worker pool was configured with zero threads.
    #[error("a worker pool needs at least one thread")]
    InvalidThreadCount,

    /// A tiled dispatch was requested with a tile size of zero.
    #[error("tile size must be non-zero")]
    InvalidTileSize,

    /// The operating system refused to spawn a worker thread.
    #[error("failed to spawn a worker thread: {0}")]
    Spawn(#[source] std::io::Error),

    /// A single task failed.
    #[error(transparent)]
    Task(#[from] TaskError),

    /// One or more tiles of a tiled dispatch failed. Every submitted tile was
    /// still drained before this was returned.
    #[error(transparent)]
    Tiles(#[from] TileErrors),
}

/// Failure of a single task, delivered through its
/// [`TaskFuture`](crate::TaskFuture).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    /// The task panicked. Holds the panic message, if it was a string.
    #[error("task panicked: {0}")]
    Panicked(String),

    /// The task was destroyed before it could run.
    #[error("task was dropped before running")]
    Abandoned,
}

impl TaskError {
    /// Converts a payload caught by [`std::panic::catch_unwind()`].
    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = match payload.downcast::<String>() {
            Ok(message) => *message,
            Err(payload) => match payload.downcast::<&'static str>() {
                Ok(message) => (*message).to_owned(),
                Err(_) => "Box<dyn Any>".to_owned(),
            },
        };
        TaskError::Panicked(message)
    }
}

/// Failure of one tile in a tiled dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileFailure {
    /// First index of the tile.
    pub start: usize,
    /// Number of indices in the tile.
    pub len: usize,
    /// What went wrong.
    pub error: TaskError,
}

/// All the tile failures of one tiled dispatch, in ascending tile order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileErrors {
    /// Total number of tiles in the range.
    pub num_tiles: usize,
    /// Number of tiles that were submitted before the pool stopped accepting
    /// them. Equal to `num_tiles` unless the pool was shut down during the
    /// dispatch, in which case the remaining tiles never ran.
    pub num_submitted: usize,
    /// Failed tiles.
    pub failures: Vec<TileFailure>,
}

impl TileErrors {
    /// Returns whether the pool stopped before all the tiles were submitted.
    pub fn pool_stopped(&self) -> bool {
        self.num_submitted < self.num_tiles
    }
}

impl fmt::Display for TileErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} of {} tile(s) failed",
            self.failures.len(),
            self.num_tiles
        )?;
        if let Some(first) = self.failures.first() {
            write!(
                f,
                ", first at {}..{}: {}",
                first.start,
                first.start + first.len,
                first.error
            )?;
        }
        if self.pool_stopped() {
            write!(
                f,
                "; pool stopped after {} submitted tile(s)",
                self.num_submitted
            )?;
        }
        Ok(())
    }
}

impl std::error::Error for TileErrors {}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_task_error_from_panic_payloads() {
        let payload = std::panic::catch_unwind(|| panic!("static message")).unwrap_err();
        assert_eq!(
            TaskError::from_panic(payload),
            TaskError::Panicked("static message".to_owned())
        );

        let value = 42;
        let payload = std::panic::catch_unwind(|| panic!("formatted {value}")).unwrap_err();
        assert_eq!(
            TaskError::from_panic(payload),
            TaskError::Panicked("formatted 42".to_owned())
        );

        let payload = std::panic::catch_unwind(|| std::panic::panic_any(123u32)).unwrap_err();
        assert_eq!(
            TaskError::from_panic(payload),
            TaskError::Panicked("Box<dyn Any>".to_owned())
        );
    }

    #[test]
    fn test_tile_errors_display() {
        let mut errors = TileErrors {
            num_tiles: 4,
            num_submitted: 4,
            failures: vec![
                TileFailure {
                    start: 3,
                    len: 3,
                    error: TaskError::Panicked("boom".to_owned()),
                },
                TileFailure {
                    start: 9,
                    len: 1,
                    error: TaskError::Abandoned,
                },
            ],
        };
        assert_eq!(
            errors.to_string(),
            "2 of 4 tile(s) failed, first at 3..6: task panicked: boom"
        );
        assert_eq!(
            Error::from(errors.clone()).to_string(),
            "2 of 4 tile(s) failed, first at 3..6: task panicked: boom"
        );

        errors.num_submitted = 3;
        assert!(errors.pool_stopped());
        assert_eq!(
            errors.to_string(),
            "2 of 4 tile(s) failed, first at 3..6: task panicked: boom; \
             pool stopped after 3 submitted tile(s)"
        );
    }

    #[test]
    fn test_task_error_converts_with_question_mark() {
        fn run_stage(outcome: Result<u32, TaskError>) -> Result<u32, Error> {
            Ok(outcome? + 1)
        }

        assert_eq!(run_stage(Ok(1)).unwrap(), 2);
        let error = run_stage(Err(TaskError::Abandoned)).unwrap_err();
        assert!(matches!(error, Error::Task(TaskError::Abandoned)));
        assert_eq!(error.to_string(), "task was dropped before running");
    }
}
