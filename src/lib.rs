// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

#![doc = include_str!("../README.md")]
#![forbid(missing_docs)]
#![deny(unsafe_op_in_unsafe_fn)]

mod core;
mod error;
mod flow;
mod macros;

pub use crate::core::{
    parallelize_tiled_tasks, AffinityError, CoreRange, CpuPinningPolicy, TaskFuture, ThreadCount,
    Tiles, WorkerPool, WorkerPoolBuilder,
};
pub use error::{Error, TaskError, TileErrors, TileFailure};
pub use flow::{Flow, FlowBuilder};

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    /// Image-like buffer processed row by row by tiles.
    struct Image {
        width: usize,
        pixels: Vec<u32>,
    }

    impl Image {
        fn new(width: usize, height: usize) -> Self {
            Self {
                width,
                pixels: vec![0; width * height],
            }
        }

        /// Splits the image into rows that tiles can fill independently.
        fn rows_mut(&mut self) -> Vec<Mutex<&mut [u32]>> {
            self.pixels.chunks_mut(self.width).map(Mutex::new).collect()
        }

        fn row(&self, y: usize) -> &[u32] {
            &self.pixels[y * self.width..(y + 1) * self.width]
        }

        fn sum(&self) -> u64 {
            self.pixels.iter().copied().map(u64::from).sum()
        }
    }

    macro_rules! expand_tests {
        ( $workers:expr, ) => {};
        ( $workers:expr, $case:ident, $( $others:tt )* ) => {
            #[test]
            fn $case() {
                $crate::test::$case($workers);
            }

            expand_tests!($workers, $($others)*);
        };
    }

    macro_rules! flow_tests {
        ( $mod:ident, $workers:expr ) => {
            mod $mod {
                expand_tests!(
                    $workers,
                    test_tasks_complete_exactly_once,
                    test_tiled_fill,
                    test_tiled_then_pipeline_stages,
                    test_nested_pipelines_and_tiles,
                    test_tile_failures_are_isolated,
                );
            }
        };
    }

    flow_tests!(one_worker, 1);
    flow_tests!(two_workers, 2);
    flow_tests!(eight_workers, 8);

    fn test_tasks_complete_exactly_once(workers: usize) {
        const NUM_TASKS: usize = 500;

        let pool = WorkerPoolBuilder {
            name: "exactly-once".to_owned(),
            num_threads: ThreadCount::try_from(workers).unwrap(),
            cpu_pinning: CpuPinningPolicy::No,
        }
        .build()
        .unwrap();

        let executions = Arc::new((0..NUM_TASKS).map(|_| AtomicUsize::new(0)).collect::<Vec<_>>());
        let futures = (0..NUM_TASKS)
            .map(|i| {
                let executions = executions.clone();
                pool.submit(move || executions[i].fetch_add(1, Ordering::SeqCst))
                    .unwrap()
            })
            .collect::<Vec<_>>();
        for future in futures {
            assert_eq!(future.wait(), Ok(0));
        }
        assert!(executions.iter().all(|e| e.load(Ordering::SeqCst) == 1));
    }

    fn test_tiled_fill(workers: usize) {
        let flow = Flow::new();
        flow.init(workers, 1).unwrap();

        let mut image = Image::new(17, 33);
        let width = image.width;
        let rows = image.rows_mut();
        flow.parallelize_tiled_tasks(33, 4, |start, len| {
            for (y, row) in rows.iter().enumerate().skip(start).take(len) {
                for (x, pixel) in row.lock().unwrap().iter_mut().enumerate() {
                    *pixel = (x + y * width) as u32;
                }
            }
        })
        .unwrap();
        drop(rows);

        let n = 17 * 33;
        assert_eq!(image.sum(), (n * (n - 1) / 2) as u64);
    }

    fn test_tiled_then_pipeline_stages(workers: usize) {
        let flow = Arc::new(Flow::new());
        flow.init(workers, 2).unwrap();

        // Stage 1 fills, stage 2 sums, each dispatching tiles. The image is
        // handed from one stage to the next.
        let fill = flow
            .add_pipeline({
                let flow = flow.clone();
                move || {
                    let mut image = Image::new(8, 64);
                    let rows = image.rows_mut();
                    flow.parallelize_tiled_tasks(64, 5, |start, len| {
                        for row in &rows[start..start + len] {
                            row.lock().unwrap().fill(2);
                        }
                    })?;
                    drop(rows);
                    Ok::<_, Error>(image)
                }
            })
            .unwrap();
        let image = fill.wait().unwrap().unwrap();

        let sum = flow
            .add_pipeline({
                let flow = flow.clone();
                move || {
                    let total = AtomicUsize::new(0);
                    flow.parallelize_tiled_tasks(64, 9, |start, len| {
                        let partial = (start..start + len)
                            .map(|y| image.row(y).iter().sum::<u32>())
                            .sum::<u32>();
                        total.fetch_add(partial as usize, Ordering::SeqCst);
                    })
                    .map(|()| (total.into_inner(), image.sum()))
                }
            })
            .unwrap();
        assert_eq!(sum.wait().unwrap().unwrap(), (2 * 8 * 64, 2 * 8 * 64));
    }

    fn test_nested_pipelines_and_tiles(workers: usize) {
        let flow = Arc::new(Flow::new());
        flow.init(workers, 3).unwrap();

        let counter = Arc::new(AtomicUsize::new(0));
        let stages = (0..6)
            .map(|_| {
                let stage_flow = flow.clone();
                let counter = counter.clone();
                flow.add_pipeline(move || {
                    stage_flow.parallelize_tiled_tasks(100, 3, move |_, len| {
                        counter.fetch_add(len, Ordering::SeqCst);
                    })
                })
                .unwrap()
            })
            .collect::<Vec<_>>();
        for stage in stages {
            stage.wait().unwrap().unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 600);
    }

    fn test_tile_failures_are_isolated(workers: usize) {
        let flow = Flow::new();
        flow.init(workers, 1).unwrap();

        let completed = (0..10).map(|_| AtomicBool::new(false)).collect::<Vec<_>>();
        let result = flow.parallelize_tiled_tasks(10, 1, |start, _| {
            if start == 0 {
                panic!("first tile failed");
            }
            completed[start].store(true, Ordering::SeqCst);
        });

        let Err(Error::Tiles(errors)) = result else {
            panic!("expected tile errors");
        };
        assert_eq!(errors.num_tiles, 10);
        assert!(!errors.pool_stopped());
        assert_eq!(
            errors.failures,
            [TileFailure {
                start: 0,
                len: 1,
                error: TaskError::Panicked("first tile failed".to_owned()),
            }]
        );
        assert!(completed[1..].iter().all(|c| c.load(Ordering::SeqCst)));

        // The compute pool is still usable afterwards.
        flow.parallelize_tiled_tasks(10, 1, |_, _| ()).unwrap();
    }
}
