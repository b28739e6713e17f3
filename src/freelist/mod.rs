// Copyright © 2019 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The free-list arena family (spec §4.7).
//!
//! Four classes sharing one contract: allocate from a recycled free-list
//! when possible, fall back to the system allocator, and garbage-collect
//! under memory pressure. Each class is its own module; [`FreeListCaps`]
//! holds the per-list/global byte caps shared by all four (spec §3
//! `FreeListCaps` (expansion), §6 tunables).
//!
//! Cross-mutex ordering (spec §5): a class's list-of-heads mutex is always
//! taken before any individual head's mutex, and a head's mutex is never
//! held while a GC pass re-enters the list-of-heads. Each module below
//! follows that order by construction: `gc_class` takes the registry lock
//! once, then calls `gc_list` per head with the registry lock already
//! dropped.

pub mod array;
pub mod block;
pub mod factory;
pub mod regular;

use std::sync::atomic::{AtomicUsize, Ordering};

use static_assertions::const_assert;

/// Sentinel meaning "no cap", stored as `usize::MAX` (spec §3: "`-1`
/// sentinel stored as `usize::MAX`").
pub const NO_CAP: usize = usize::MAX;

/// Defaults from spec §4.7: "regular 64KB/1MB; array 256KB/4MB; block
/// 1MB/16MB; factory 1MB/16MB."
const DEFAULT_REGULAR_LIST_CAP: usize = 64 * 1024;
const DEFAULT_REGULAR_GLOBAL_CAP: usize = 1024 * 1024;
const DEFAULT_ARRAY_LIST_CAP: usize = 256 * 1024;
const DEFAULT_ARRAY_GLOBAL_CAP: usize = 4 * 1024 * 1024;
const DEFAULT_BLOCK_LIST_CAP: usize = 1024 * 1024;
const DEFAULT_BLOCK_GLOBAL_CAP: usize = 16 * 1024 * 1024;
const DEFAULT_FACTORY_LIST_CAP: usize = 1024 * 1024;
const DEFAULT_FACTORY_GLOBAL_CAP: usize = 16 * 1024 * 1024;

// A per-list cap larger than its class's global cap would make the
// narrower GC pass (`gc_list`) trigger strictly after the class-wide one
// already would have, defeating the point of having two tiers.
const_assert!(DEFAULT_REGULAR_LIST_CAP <= DEFAULT_REGULAR_GLOBAL_CAP);
const_assert!(DEFAULT_ARRAY_LIST_CAP <= DEFAULT_ARRAY_GLOBAL_CAP);
const_assert!(DEFAULT_BLOCK_LIST_CAP <= DEFAULT_BLOCK_GLOBAL_CAP);
const_assert!(DEFAULT_FACTORY_LIST_CAP <= DEFAULT_FACTORY_GLOBAL_CAP);

/// Per-list and global byte caps for each of the four free-list classes
/// (spec §6 "Tunables"). Exceeding a list's cap (or, failing that, a
/// class's global cap) triggers a targeted garbage-collect pass.
#[derive(Debug, Clone, Copy)]
pub struct FreeListCaps {
    pub regular_list_cap: usize,
    pub regular_global_cap: usize,
    pub array_list_cap: usize,
    pub array_global_cap: usize,
    pub block_list_cap: usize,
    pub block_global_cap: usize,
    pub factory_list_cap: usize,
    pub factory_global_cap: usize,
}

impl Default for FreeListCaps {
    fn default() -> Self {
        FreeListCaps {
            regular_list_cap: DEFAULT_REGULAR_LIST_CAP,
            regular_global_cap: DEFAULT_REGULAR_GLOBAL_CAP,
            array_list_cap: DEFAULT_ARRAY_LIST_CAP,
            array_global_cap: DEFAULT_ARRAY_GLOBAL_CAP,
            block_list_cap: DEFAULT_BLOCK_LIST_CAP,
            block_global_cap: DEFAULT_BLOCK_GLOBAL_CAP,
            factory_list_cap: DEFAULT_FACTORY_LIST_CAP,
            factory_global_cap: DEFAULT_FACTORY_GLOBAL_CAP,
        }
    }
}

static CAPS: [AtomicUsize; 8] = [
    AtomicUsize::new(DEFAULT_REGULAR_LIST_CAP),
    AtomicUsize::new(DEFAULT_REGULAR_GLOBAL_CAP),
    AtomicUsize::new(DEFAULT_ARRAY_LIST_CAP),
    AtomicUsize::new(DEFAULT_ARRAY_GLOBAL_CAP),
    AtomicUsize::new(DEFAULT_BLOCK_LIST_CAP),
    AtomicUsize::new(DEFAULT_BLOCK_GLOBAL_CAP),
    AtomicUsize::new(DEFAULT_FACTORY_LIST_CAP),
    AtomicUsize::new(DEFAULT_FACTORY_GLOBAL_CAP),
];

const REGULAR_LIST: usize = 0;
const REGULAR_GLOBAL: usize = 1;
const ARRAY_LIST: usize = 2;
const ARRAY_GLOBAL: usize = 3;
const BLOCK_LIST: usize = 4;
const BLOCK_GLOBAL: usize = 5;
const FACTORY_LIST: usize = 6;
const FACTORY_GLOBAL: usize = 7;

fn normalize(cap: usize) -> usize {
    if cap == NO_CAP { NO_CAP } else { cap }
}

impl FreeListCaps {
    /// Installs new caps process-wide. Any in-flight `free()` observes the
    /// new cap on its next check; this is advisory tuning, not a hard
    /// transactional update (spec §6: "settable via a single entry point").
    pub fn set(self) {
        CAPS[REGULAR_LIST].store(normalize(self.regular_list_cap), Ordering::Relaxed);
        CAPS[REGULAR_GLOBAL].store(normalize(self.regular_global_cap), Ordering::Relaxed);
        CAPS[ARRAY_LIST].store(normalize(self.array_list_cap), Ordering::Relaxed);
        CAPS[ARRAY_GLOBAL].store(normalize(self.array_global_cap), Ordering::Relaxed);
        CAPS[BLOCK_LIST].store(normalize(self.block_list_cap), Ordering::Relaxed);
        CAPS[BLOCK_GLOBAL].store(normalize(self.block_global_cap), Ordering::Relaxed);
        CAPS[FACTORY_LIST].store(normalize(self.factory_list_cap), Ordering::Relaxed);
        CAPS[FACTORY_GLOBAL].store(normalize(self.factory_global_cap), Ordering::Relaxed);
    }

    pub fn current() -> Self {
        FreeListCaps {
            regular_list_cap: CAPS[REGULAR_LIST].load(Ordering::Relaxed),
            regular_global_cap: CAPS[REGULAR_GLOBAL].load(Ordering::Relaxed),
            array_list_cap: CAPS[ARRAY_LIST].load(Ordering::Relaxed),
            array_global_cap: CAPS[ARRAY_GLOBAL].load(Ordering::Relaxed),
            block_list_cap: CAPS[BLOCK_LIST].load(Ordering::Relaxed),
            block_global_cap: CAPS[BLOCK_GLOBAL].load(Ordering::Relaxed),
            factory_list_cap: CAPS[FACTORY_LIST].load(Ordering::Relaxed),
            factory_global_cap: CAPS[FACTORY_GLOBAL].load(Ordering::Relaxed),
        }
    }
}

/// Free function mirroring the original `H5set_free_list_limits(int,int,...)`
/// call-site shape with eight named parameters, for fidelity alongside the
/// struct-of-fields [`FreeListCaps::set`] (spec §6 expansion).
#[allow(clippy::too_many_arguments)]
pub fn set_free_list_limits(
    reg_list_lim: i64,
    reg_glob_lim: i64,
    arr_list_lim: i64,
    arr_glob_lim: i64,
    blk_list_lim: i64,
    blk_glob_lim: i64,
    fac_list_lim: i64,
    fac_glob_lim: i64,
) {
    fn conv(lim: i64) -> usize {
        if lim < 0 { NO_CAP } else { lim as usize }
    }
    FreeListCaps {
        regular_list_cap: conv(reg_list_lim),
        regular_global_cap: conv(reg_glob_lim),
        array_list_cap: conv(arr_list_lim),
        array_global_cap: conv(arr_glob_lim),
        block_list_cap: conv(blk_list_lim),
        block_global_cap: conv(blk_glob_lim),
        factory_list_cap: conv(fac_list_lim),
        factory_global_cap: conv(fac_glob_lim),
    }
    .set()
}

pub(crate) fn regular_list_cap() -> usize {
    CAPS[REGULAR_LIST].load(Ordering::Relaxed)
}
pub(crate) fn regular_global_cap() -> usize {
    CAPS[REGULAR_GLOBAL].load(Ordering::Relaxed)
}
pub(crate) fn array_list_cap() -> usize {
    CAPS[ARRAY_LIST].load(Ordering::Relaxed)
}
pub(crate) fn array_global_cap() -> usize {
    CAPS[ARRAY_GLOBAL].load(Ordering::Relaxed)
}
pub(crate) fn block_list_cap() -> usize {
    CAPS[BLOCK_LIST].load(Ordering::Relaxed)
}
pub(crate) fn block_global_cap() -> usize {
    CAPS[BLOCK_GLOBAL].load(Ordering::Relaxed)
}
pub(crate) fn factory_list_cap() -> usize {
    CAPS[FACTORY_LIST].load(Ordering::Relaxed)
}
pub(crate) fn factory_global_cap() -> usize {
    CAPS[FACTORY_GLOBAL].load(Ordering::Relaxed)
}

/// Thread-local re-entrancy guard so a GC pass triggered from inside
/// `free()` can't recursively trigger another GC pass on the same class
/// (spec §4.7 expansion: "a thread-local re-entrancy flag rather than a
/// second lock tier").
pub(crate) mod reentrancy {
    use std::cell::Cell;

    thread_local! {
        static GC_ACTIVE: Cell<bool> = Cell::new(false);
    }

    struct ResetOnDrop;
    impl Drop for ResetOnDrop {
        fn drop(&mut self) {
            GC_ACTIVE.with(|flag| flag.set(false));
        }
    }

    /// Runs `f` unless a GC pass is already active on this thread, in which
    /// case it's skipped entirely (returns `None`).
    pub(crate) fn guarded<R>(f: impl FnOnce() -> R) -> Option<R> {
        let already_active = GC_ACTIVE.with(|flag| flag.replace(true));
        if already_active {
            return None;
        }
        let _reset = ResetOnDrop;
        Some(f())
    }
}
