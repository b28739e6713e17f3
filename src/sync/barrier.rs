// Copyright © 2019-2020 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Thread barrier (spec §4.5). Intended for test orchestration (spec §4.5:
//! "Intended for testing orchestration"), and used internally by this
//! crate's own multi-thread tests to pin down interleavings deterministically
//! (testable scenario S7).

use std::sync::{Condvar, Mutex};

use crate::sys::{Backend, CurrentBackend};

enum Inner {
    /// The backend has a native rendezvous primitive; delegate to it.
    Native(std::sync::Barrier),
    /// Mutex + condvar emulation: a generation counter so the barrier is
    /// reusable across repeated `wait()` cycles (spec: "reusable for the
    /// next cycle", testable scenario S7).
    Emulated(Mutex<EmulatedState>, Condvar),
}

struct EmulatedState {
    entered: usize,
    generation: u64,
}

/// A count-down rendezvous: `threshold` calls to [`Barrier::wait`] must
/// happen before any of them return.
pub struct Barrier {
    inner: Inner,
    threshold: usize,
}

/// Result of [`Barrier::wait`]; exactly one caller per generation sees
/// `is_leader() == true`.
pub struct BarrierWaitResult(bool);

impl BarrierWaitResult {
    pub fn is_leader(&self) -> bool {
        self.0
    }
}

impl Barrier {
    /// Creates a barrier for `threshold` participants.
    pub fn new(threshold: usize) -> Self {
        let inner = if CurrentBackend::HAS_NATIVE_BARRIER {
            Inner::Native(std::sync::Barrier::new(threshold))
        } else {
            Inner::Emulated(
                Mutex::new(EmulatedState {
                    entered: 0,
                    generation: 0,
                }),
                Condvar::new(),
            )
        };
        Barrier { inner, threshold }
    }

    /// Blocks until `threshold` threads have called `wait`, then releases
    /// all of them atomically. Reusable for subsequent rendezvous.
    pub fn wait(&self) -> BarrierWaitResult {
        match &self.inner {
            Inner::Native(b) => BarrierWaitResult(b.wait().is_leader()),
            Inner::Emulated(mutex, cv) => {
                let mut state = mutex.lock().unwrap();
                let my_generation = state.generation;
                state.entered += 1;

                if state.entered == self.threshold {
                    state.entered = 0;
                    state.generation = state.generation.wrapping_add(1);
                    cv.notify_all();
                    BarrierWaitResult(true)
                } else {
                    while state.generation == my_generation {
                        state = cv.wait(state).unwrap();
                    }
                    BarrierWaitResult(false)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn rendezvous_releases_all_participants_together() {
        // Testable scenario S7.
        let barrier = Arc::new(Barrier::new(2));
        let arrived = Arc::new(AtomicUsize::new(0));
        let leaders = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let barrier = barrier.clone();
                let arrived = arrived.clone();
                let leaders = leaders.clone();
                thread::spawn(move || {
                    arrived.fetch_add(1, Ordering::SeqCst);
                    let result = barrier.wait();
                    // By the time any participant returns, both must have arrived.
                    assert_eq!(arrived.load(Ordering::SeqCst), 2);
                    if result.is_leader() {
                        leaders.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(leaders.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn barrier_is_reusable() {
        let barrier = Arc::new(Barrier::new(2));
        for _ in 0..3 {
            let b1 = barrier.clone();
            let b2 = barrier.clone();
            let t1 = thread::spawn(move || b1.wait().is_leader());
            let t2 = thread::spawn(move || b2.wait().is_leader());
            let r1 = t1.join().unwrap();
            let r2 = t2.join().unwrap();
            assert_ne!(r1, r2);
        }
    }
}
