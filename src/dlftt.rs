// Copyright © 2019-2020 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The DLFTT-aware mutex (spec §4.4).
//!
//! A composite of a plain mutex and the calling thread's DLFTT snapshot.
//! While the calling thread's DLFTT counter is nonzero, `acquire` is a
//! no-op — this lets the free-list arenas (§4.7) call into locking code
//! from contexts where the caller has already disabled per-thread locking,
//! without self-deadlocking (Design Note: "DLFTT semantics: not a
//! lock-elision optimization but a correctness mechanism").
//!
//! Design Note: "Any implementer must ensure that the matched release
//! observes the same DLFTT value as its paired acquire; store the snapshot
//! on the acquired mutex instance." We render that as a token returned by
//! `acquire` and consumed by `release`, rather than a field mutated on the
//! shared `DlfttMutex` itself: a field would race if one thread's real
//! acquisition overlaps another thread's no-op acquisition, whereas a
//! caller-held token can't.

use crate::sync::mutex::PlainMutex;
use crate::threadinfo;

/// Snapshot taken at `acquire` time; must be handed back to `release`
/// unchanged. Opaque to callers.
#[must_use = "a DlfttGuard must be passed to `release`, or the underlying mutex may leak locked"]
pub struct DlfttGuard {
    locked: bool,
}

pub struct DlfttMutex {
    inner: PlainMutex,
}

impl DlfttMutex {
    pub const fn new() -> Self {
        DlfttMutex {
            inner: PlainMutex::new(),
        }
    }

    /// Acquires the underlying mutex unless the calling thread's DLFTT
    /// counter is nonzero, in which case this is a no-op.
    #[inline]
    pub fn acquire(&self) -> DlfttGuard {
        if threadinfo::dlftt() == 0 {
            self.inner.acquire();
            DlfttGuard { locked: true }
        } else {
            DlfttGuard { locked: false }
        }
    }

    /// Releases the mutex iff the paired `acquire` actually locked it.
    #[inline]
    pub fn release(&self, guard: DlfttGuard) {
        if guard.locked {
            self.inner.release();
        }
    }
}

impl Default for DlfttMutex {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apilock::{user_cb_prepare, user_cb_restore};

    #[test]
    fn acquire_is_noop_under_dlftt() {
        let m = DlfttMutex::new();
        // Outer "real" acquisition.
        let outer = m.acquire();
        assert!(outer.locked);

        // Simulate re-entry from a user callback: DLFTT goes to 1, so a
        // nested acquire on the *same* thread must not deadlock against the
        // mutex this thread already (really) holds.
        user_cb_prepare();
        let inner = m.acquire();
        assert!(!inner.locked);
        m.release(inner);
        user_cb_restore();

        m.release(outer);
    }

    #[test]
    fn acquire_locks_for_real_when_dlftt_is_zero() {
        let m = DlfttMutex::new();
        let g = m.acquire();
        assert!(g.locked);
        assert!(!m.inner.try_acquire());
        m.release(g);
        assert!(m.inner.try_acquire());
        m.inner.release();
    }
}
