// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Named counters.
//!
//! Counters are updated concurrently by every queue worker, so each
//! [`StatU64`] is an atomic and is bumped through a shared reference.
//!
//! # Example
//!
//! To declare a new provider simply define a struct of named fields
//! with type [`StatU64`] and derive [`StatProvider`].
//!
//! ```
//! use trireme::stat::StatProvider;
//! use trireme::stat::StatU64;
//!
//! #[derive(StatProvider)]
//! struct SomeStats {
//!     pkts_in: StatU64,
//!     pkts_drop: StatU64,
//! }
//!
//! let stats = SomeStats::new();
//! stats.pkts_in.incr(1);
//! assert_eq!(stats.snapshot().pkts_in, 1);
//! ```

use core::sync::atomic::AtomicU64;
use core::sync::atomic::Ordering;

pub use stat_macro::StatProvider;

/// A provider of named counters.
///
/// Rather than implementing this trait manually, the stat-macro
/// should be used.
pub trait StatProvider {
    const NUM_FIELDS: u32;
    type Snap;

    fn new() -> Self;

    fn num_fields(&self) -> u32 {
        Self::NUM_FIELDS
    }

    /// Return a snapshot of the stats. This is how you obtain a copy,
    /// as opposed to the traditional clone().
    fn snapshot(&self) -> Self::Snap;

    /// Visit every counter by name, in declaration order.
    fn for_each(&self, f: &mut dyn FnMut(&'static str, u64));
}

/// A 64-bit unsigned counter.
#[derive(Debug, Default)]
pub struct StatU64 {
    value: AtomicU64,
}

impl StatU64 {
    pub fn new() -> Self {
        Self { value: AtomicU64::new(0) }
    }

    #[inline]
    pub fn incr(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn set(&self, val: u64) {
        self.value.store(val, Ordering::Relaxed);
    }

    pub fn val(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[derive(StatProvider)]
    struct TestStats {
        hits: StatU64,
        misses: StatU64,
    }

    #[test]
    fn derive_snapshot() {
        let stats = TestStats::new();
        stats.hits.incr(3);
        stats.misses.incr(1);
        stats.misses.set(7);
        assert_eq!(stats.num_fields(), 2);
        assert_eq!(
            stats.snapshot(),
            TestStatsSnap { hits: 3, misses: 7 }
        );

        let mut names = vec![];
        stats.for_each(&mut |name, val| names.push((name, val)));
        assert_eq!(names, vec![("hits", 3), ("misses", 7)]);
    }
}
