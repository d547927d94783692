// Copyright 2024-2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Best-effort placement of worker threads onto CPU cores.

// Platforms that support `libc::sched_setaffinity()`.
#[cfg(all(
    not(miri),
    any(
        target_os = "android",
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "linux"
    )
))]
use nix::{
    sched::{sched_setaffinity, CpuSet},
    unistd::Pid,
};

/// An inclusive range of CPU core indices.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CoreRange {
    /// First core of the range.
    pub first: usize,
    /// Last core of the range (included).
    pub last: usize,
}

impl CoreRange {
    /// Creates a range spanning cores `first..=last`.
    pub fn new(first: usize, last: usize) -> Self {
        Self { first, last }
    }

    /// Restricts this range to cores below `num_cores`. Returns [`None`] if
    /// nothing is left.
    fn clamp_to(self, num_cores: usize) -> Option<Self> {
        let last = self.last.min(num_cores.checked_sub(1)?);
        (self.first <= last).then_some(Self {
            first: self.first,
            last,
        })
    }
}

/// Policy to pin worker threads to CPUs.
///
/// Pinning is only a performance hint: failing to pin a thread is logged
/// and the thread keeps running wherever the OS schedules it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CpuPinningPolicy {
    /// Don't pin worker threads to CPUs.
    No,
    /// Restrict every worker thread to the given cores, if CPU pinning is
    /// supported and implemented on this platform.
    IfSupported(CoreRange),
}

/// Reasons why a worker thread couldn't be pinned.
#[derive(Debug, thiserror::Error)]
pub enum AffinityError {
    /// Pinning threads isn't implemented on this platform.
    #[error("pinning threads to CPUs is not implemented on this platform")]
    Unsupported,

    /// The requested range doesn't contain any addressable core.
    #[error("core range {first}..={last} is empty on this platform")]
    EmptyRange {
        /// First requested core.
        first: usize,
        /// Last requested core.
        last: usize,
    },

    /// The OS rejected the request.
    #[cfg(all(
        not(miri),
        any(
            target_os = "android",
            target_os = "dragonfly",
            target_os = "freebsd",
            target_os = "linux"
        )
    ))]
    #[error("sched_setaffinity failed: {0}")]
    Os(#[from] nix::errno::Errno),
}

/// Restricts the calling thread to the given cores.
#[cfg(all(
    not(miri),
    any(
        target_os = "android",
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "linux"
    )
))]
pub fn pin_current_thread(range: CoreRange) -> Result<CoreRange, AffinityError> {
    let clamped = range
        .clamp_to(CpuSet::count())
        .ok_or(AffinityError::EmptyRange {
            first: range.first,
            last: range.last,
        })?;

    let mut cpu_set = CpuSet::new();
    for cpu in clamped.first..=clamped.last {
        cpu_set.set(cpu)?;
    }
    sched_setaffinity(Pid::from_raw(0), &cpu_set)?;
    Ok(clamped)
}

/// Restricts the calling thread to the given cores.
#[cfg(any(
    miri,
    not(any(
        target_os = "android",
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "linux"
    ))
))]
pub fn pin_current_thread(_range: CoreRange) -> Result<CoreRange, AffinityError> {
    Err(AffinityError::Unsupported)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_core_range_clamp() {
        assert_eq!(CoreRange::new(4, 7).clamp_to(8), Some(CoreRange::new(4, 7)));
        assert_eq!(CoreRange::new(4, 7).clamp_to(6), Some(CoreRange::new(4, 5)));
        assert_eq!(CoreRange::new(4, 7).clamp_to(4), None);
        assert_eq!(CoreRange::new(0, 0).clamp_to(0), None);
        assert_eq!(CoreRange::new(3, 1).clamp_to(8), None);
    }

    #[cfg(all(
        not(miri),
        any(
            target_os = "android",
            target_os = "dragonfly",
            target_os = "freebsd",
            target_os = "linux"
        )
    ))]
    #[test]
    fn test_pin_current_thread_to_first_core() {
        // Runs on a dedicated thread to leave the test harness thread alone.
        let pinned = std::thread::spawn(|| pin_current_thread(CoreRange::new(0, 0)))
            .join()
            .unwrap();
        // Restricted environments may refuse, but never with an empty range.
        match pinned {
            Ok(range) => assert_eq!(range, CoreRange::new(0, 0)),
            Err(e) => assert!(matches!(e, AffinityError::Os(_)), "{e}"),
        }
    }

    #[test]
    fn test_pin_current_thread_empty_range() {
        let pinned = std::thread::spawn(|| pin_current_thread(CoreRange::new(usize::MAX, 0)))
            .join()
            .unwrap();
        assert!(pinned.is_err());
    }

    #[cfg(any(
        miri,
        not(any(
            target_os = "android",
            target_os = "dragonfly",
            target_os = "freebsd",
            target_os = "linux"
        ))
    ))]
    #[test]
    fn test_pin_current_thread_unsupported() {
        assert!(matches!(
            pin_current_thread(CoreRange::new(0, 0)),
            Err(AffinityError::Unsupported)
        ));
    }
}
