// Copyright © 2019 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The plain mutex primitive (spec §2 item 1).
//!
//! Unlike `std::sync::Mutex<T>`, this wrapper exposes manual `acquire`/
//! `release` rather than an RAII guard: [`crate::dlftt::DlfttMutex`] needs to
//! conditionally skip locking altogether depending on the calling thread's
//! DLFTT counter, which doesn't fit a guard whose lifetime is tied to a
//! single lexical scope. `parking_lot::RawMutex` already exposes exactly
//! this raw contract, so we build on it rather than reinvent a futex.

use lock_api::RawMutex as _;

/// A plain, non-recursive mutual-exclusion primitive with manual
/// `acquire`/`release`. Locking it twice from the same thread without an
/// intervening release deadlocks, same as a raw OS mutex.
pub struct PlainMutex {
    raw: parking_lot::RawMutex,
}

impl PlainMutex {
    pub const fn new() -> Self {
        PlainMutex {
            raw: parking_lot::RawMutex::INIT,
        }
    }

    /// Blocks until the mutex is acquired.
    #[inline]
    pub fn acquire(&self) {
        self.raw.lock();
    }

    /// Attempts to acquire the mutex without blocking.
    #[inline]
    pub fn try_acquire(&self) -> bool {
        self.raw.try_lock()
    }

    /// Releases the mutex.
    ///
    /// # Safety / contract
    /// Must only be called by the thread that last successfully called
    /// `acquire`/`try_acquire`; calling it otherwise is a programmer error
    /// (spec §4.1: "lock-not-owned release is a programming error").
    #[inline]
    pub fn release(&self) {
        unsafe { self.raw.unlock() };
    }
}

impl Default for PlainMutex {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn mutual_exclusion() {
        let m = Arc::new(PlainMutex::new());
        let counter = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let m = m.clone();
                let counter = counter.clone();
                thread::spawn(move || {
                    for _ in 0..1000 {
                        m.acquire();
                        counter.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                        m.release();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(counter.load(std::sync::atomic::Ordering::Relaxed), 8000);
    }

    #[test]
    fn try_acquire_reports_contention() {
        let m = PlainMutex::new();
        m.acquire();
        assert!(!m.try_acquire());
        m.release();
        assert!(m.try_acquire());
        m.release();
    }
}
