// Copyright 2024-2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Decomposition of an index range into tiles, and barrier-synchronized
//! dispatch of one task per tile.

use super::future::TaskFuture;
use super::thread_pool::WorkerPool;
use crate::error::{Error, TileErrors, TileFailure};
use crate::macros::{log_error, log_trace};
use std::collections::VecDeque;
use std::iter::FusedIterator;
use std::ptr::NonNull;

/// Iterator over the `(start, len)` tiles of `0..range`.
///
/// Tiles start at `0, tile, 2 * tile, ...` and all have length `tile`,
/// except the last one which may be shorter.
///
/// ```
/// # use tileflow::Tiles;
/// let tiles = Tiles::new(10, 3).collect::<Vec<_>>();
/// assert_eq!(tiles, [(0, 3), (3, 3), (6, 3), (9, 1)]);
/// ```
#[derive(Clone, Debug)]
pub struct Tiles {
    range: usize,
    tile: usize,
    next: usize,
}

impl Tiles {
    /// Creates the tiling of `0..range` with tiles of size `tile`.
    ///
    /// # Panics
    ///
    /// Panics if `tile` is zero.
    pub fn new(range: usize, tile: usize) -> Self {
        assert_ne!(tile, 0, "tile size must be non-zero");
        Self {
            range,
            tile,
            next: 0,
        }
    }
}

impl Iterator for Tiles {
    type Item = (usize, usize);

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.range {
            return None;
        }
        let start = self.next;
        let len = self.tile.min(self.range - start);
        self.next = start + len;
        Some((start, len))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = (self.range - self.next.min(self.range)).div_ceil(self.tile);
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for Tiles {}
impl FusedIterator for Tiles {}

/// A lifetime-erased reference to a tile function. This acts as a `&'a F`
/// whose lifetime is checked at runtime by the [`TileBarrier`] instead of the
/// borrow checker, so that it can be sent to `'static` tasks.
#[derive(Clone, Copy)]
struct TileFnView {
    ptr: NonNull<()>,
    call: unsafe fn(NonNull<()>, usize, usize),
}

impl TileFnView {
    fn new<F: Fn(usize, usize) + Sync>(f: &F) -> Self {
        Self {
            ptr: NonNull::from(f).cast(),
            call: call_tile_fn::<F>,
        }
    }

    /// Calls the underlying tile function.
    ///
    /// # Safety
    ///
    /// The underlying function must still be alive, i.e. the [`TileBarrier`]
    /// that guards it must not have been dropped yet.
    unsafe fn call(self, start: usize, len: usize) {
        // SAFETY: The pointer was created from a valid `&F` with the matching
        // `call_tile_fn::<F>`, and the caller ensures that `F` is alive.
        unsafe { (self.call)(self.ptr, start, len) }
    }
}

/// SAFETY:
///
/// A [`TileFnView`] acts as a `&F` where `F: Sync`, which is [`Send`].
unsafe impl Send for TileFnView {}

/// # Safety
///
/// `ptr` must point to a valid `F`.
unsafe fn call_tile_fn<F: Fn(usize, usize)>(ptr: NonNull<()>, start: usize, len: usize) {
    // SAFETY: Ensured by the caller.
    let f = unsafe { ptr.cast::<F>().as_ref() };
    f(start, len)
}

/// Futures of the tiles submitted so far.
///
/// Dropping a barrier waits for all the remaining futures, including during
/// unwinding, so that no task outlives the tile function it borrows.
struct TileBarrier {
    futures: VecDeque<(usize, usize, TaskFuture<()>)>,
}

impl TileBarrier {
    /// Waits for every tile, and returns the failed ones in ascending order.
    fn wait(mut self) -> Vec<TileFailure> {
        let mut failures = Vec::new();
        while let Some((start, len, future)) = self.futures.pop_front() {
            if let Err(error) = future.wait() {
                failures.push(TileFailure { start, len, error });
            }
        }
        failures
    }
}

impl Drop for TileBarrier {
    fn drop(&mut self) {
        for (_, _, future) in self.futures.drain(..) {
            let _ = future.wait();
        }
    }
}

/// Runs `f(start, len)` on every tile of `0..range` on the given pool, and
/// waits until all of them have finished.
///
/// Tiles are submitted in ascending order but may run concurrently and
/// complete in any order. Every tile is waited for, even when some of them
/// fail; the failures are then reported together as [`Error::Tiles`].
///
/// The tile function may borrow local data, as it is never called after this
/// function returns.
///
/// ```
/// # use tileflow::{parallelize_tiled_tasks, CpuPinningPolicy, ThreadCount, WorkerPoolBuilder};
/// # use std::sync::atomic::{AtomicU64, Ordering};
/// let pool = WorkerPoolBuilder {
///     name: "sum".to_owned(),
///     num_threads: ThreadCount::try_from(4).unwrap(),
///     cpu_pinning: CpuPinningPolicy::No,
/// }
/// .build()
/// .unwrap();
///
/// let input = (1..=100).collect::<Vec<u64>>();
/// let sum = AtomicU64::new(0);
/// parallelize_tiled_tasks(&pool, input.len(), 8, |start, len| {
///     let partial = input[start..start + len].iter().sum::<u64>();
///     sum.fetch_add(partial, Ordering::Relaxed);
/// })
/// .unwrap();
/// assert_eq!(sum.into_inner(), 5050);
/// ```
pub fn parallelize_tiled_tasks<F>(
    pool: &WorkerPool,
    range: usize,
    tile: usize,
    f: F,
) -> Result<(), Error>
where
    F: Fn(usize, usize) + Sync,
{
    if tile == 0 {
        return Err(Error::InvalidTileSize);
    }

    let tiles = Tiles::new(range, tile);
    let num_tiles = tiles.len();
    log_trace!(
        "[{}] Dispatching {num_tiles} tile(s) over 0..{range}",
        pool.name()
    );

    let view = TileFnView::new(&f);
    let mut barrier = TileBarrier {
        futures: VecDeque::new(),
    };
    let mut stopped = false;
    for (start, len) in tiles {
        // SAFETY: `f` outlives the barrier, which waits for this task before
        // being dropped. Once the task's future is resolved, the task doesn't
        // touch `f` anymore.
        match pool.submit(move || unsafe { view.call(start, len) }) {
            Ok(future) => barrier.futures.push_back((start, len, future)),
            Err(_) => {
                // The tiles already queued must still be drained.
                stopped = true;
                break;
            }
        }
    }
    let num_submitted = barrier.futures.len();
    let failures = barrier.wait();

    if failures.is_empty() && stopped {
        return Err(Error::PoolStopped);
    }
    if !failures.is_empty() {
        log_error!(
            "[{}] {} of {num_tiles} tile(s) failed, {num_submitted} submitted",
            pool.name(),
            failures.len()
        );
        return Err(Error::Tiles(TileErrors {
            num_tiles,
            num_submitted,
            failures,
        }));
    }
    Ok(())
}
