// Copyright © 2019 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Recursive exclusive lock (spec §4.1).
//!
//! A single owner may reacquire the lock any number of times; the lock is
//! only released to other threads once the owner's acquire count returns to
//! zero. Built on a `Mutex`-guarded state struct plus a `Condvar`, in the
//! shape [`crate::rwlock::RwLock`] also uses, rather than atop
//! [`crate::sync::mutex::PlainMutex`]: recursion bookkeeping needs the owner
//! thread id and a wait queue, neither of which a raw mutex gives us for
//! free.

use std::sync::{Condvar, Mutex};

use crate::sys::{Backend, CurrentBackend};
use crate::threadinfo::{self, ThreadId};

struct State {
    /// `None` when unheld.
    owner: Option<ThreadId>,
    count: u32,
    /// Set on the 0→n transition (the lock going from unheld to held) and
    /// cleared on the transition back to 0, so cancellation is pinned for
    /// exactly as long as some thread holds the lock, not once per
    /// recursive `acquire_n`/`release_n` call.
    cancel_state: Option<<CurrentBackend as Backend>::CancelState>,
}

/// A mutex that the owning thread may reacquire without deadlocking itself
/// (spec testable scenario S2).
pub struct ExLock {
    state: Mutex<State>,
    cv: Condvar,
}

impl ExLock {
    pub fn new() -> Self {
        ExLock {
            state: Mutex::new(State {
                owner: None,
                count: 0,
                cancel_state: None,
            }),
            cv: Condvar::new(),
        }
    }

    /// Acquires the lock, blocking if another thread holds it. Acquiring
    /// while already the owner increments the recursion count instead of
    /// blocking.
    pub fn acquire(&self) {
        self.acquire_n(1);
    }

    /// Acquires the lock `n` times in one call, as if `acquire` had been
    /// called `n` times in a row (spec: "acquire_n/release_n, for batching
    /// repeated recursive acquisitions").
    pub fn acquire_n(&self, n: u32) {
        debug_assert!(n > 0);
        let me = threadinfo::thread_id();
        let mut state = self.state.lock().unwrap();
        loop {
            match state.owner {
                Some(owner) if owner == me => {
                    state.count += n;
                    break;
                }
                None => {
                    state.owner = Some(me);
                    state.count = n;
                    break;
                }
                Some(_) => {
                    state = self.cv.wait(state).unwrap();
                }
            }
        }
        // Cancellation is pinned once, on the 0→n transition, so a thread
        // can't be cancelled while holding a stake in the lock's internal
        // state (spec §4.1 "cancellability must be pinned around the
        // wait") — not re-armed on every recursive reacquisition.
        if state.cancel_state.is_none() {
            state.cancel_state = Some(CurrentBackend::disable_cancellation());
        }
    }

    /// Non-blocking variant of [`ExLock::acquire`]. Returns `true` if the
    /// lock was acquired (or the recursion count bumped).
    pub fn try_acquire(&self) -> bool {
        self.try_acquire_n(1)
    }

    /// Non-blocking variant of [`ExLock::acquire_n`]. Returns `true` if the
    /// lock was acquired (or its recursion count bumped by `n`); returns
    /// `false` immediately, without blocking, if another thread holds it.
    pub fn try_acquire_n(&self, n: u32) -> bool {
        debug_assert!(n > 0);
        let me = threadinfo::thread_id();
        let mut state = self.state.lock().unwrap();
        let acquired = match state.owner {
            Some(owner) if owner == me => {
                state.count += n;
                true
            }
            None => {
                state.owner = Some(me);
                state.count = n;
                true
            }
            Some(_) => false,
        };
        if acquired && state.cancel_state.is_none() {
            state.cancel_state = Some(CurrentBackend::disable_cancellation());
        }
        acquired
    }

    /// Releases one level of recursion. Wakes a waiter once the count drops
    /// to zero.
    pub fn release(&self) {
        self.release_n(1);
    }

    /// Releases `n` levels of recursion in one call.
    pub fn release_n(&self, n: u32) {
        let me = threadinfo::thread_id();
        let mut state = self.state.lock().unwrap();
        assert_eq!(
            state.owner,
            Some(me),
            "release called by a thread that doesn't hold the lock"
        );
        assert!(state.count >= n, "release_n exceeds held recursion depth");
        state.count -= n;
        if state.count == 0 {
            state.owner = None;
            // The n→0 transition: restore cancellability once, now that no
            // thread holds the lock at all.
            let cancel_state = state
                .cancel_state
                .take()
                .expect("cancel_state must be set while the lock is held");
            drop(state);
            CurrentBackend::restore_cancellation(cancel_state);
            self.cv.notify_one();
        }
    }

    /// Releases every recursion level the calling thread currently holds,
    /// in one call, returning the depth that was released (spec §6:
    /// "releases the entire recursive stack... returning the depth that was
    /// released"). Unlike [`ExLock::release_n`], this needn't be paired
    /// with a specific `acquire_n` call — several stacked acquisitions
    /// drain in one shot. Returns 0, without error, if the calling thread
    /// doesn't hold the lock at all.
    pub fn release_all(&self) -> u32 {
        let me = threadinfo::thread_id();
        let mut state = self.state.lock().unwrap();
        if state.owner != Some(me) {
            return 0;
        }
        let depth = state.count;
        state.count = 0;
        state.owner = None;
        let cancel_state = state
            .cancel_state
            .take()
            .expect("cancel_state must be set while the lock is held");
        drop(state);
        CurrentBackend::restore_cancellation(cancel_state);
        self.cv.notify_one();
        depth
    }

    /// The current recursion depth held by the calling thread, or 0 if it
    /// doesn't hold the lock.
    pub fn held_count(&self) -> u32 {
        let me = threadinfo::thread_id();
        let state = self.state.lock().unwrap();
        match state.owner {
            Some(owner) if owner == me => state.count,
            _ => 0,
        }
    }
}

impl Default for ExLock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;

    #[test]
    fn recursive_acquire_does_not_deadlock_owner() {
        // Testable scenario S2.
        let lock = ExLock::new();
        lock.acquire();
        lock.acquire();
        lock.acquire();
        assert_eq!(lock.held_count(), 3);
        lock.release();
        lock.release();
        assert_eq!(lock.held_count(), 1);
        lock.release();
        assert_eq!(lock.held_count(), 0);
    }

    #[test]
    fn acquire_n_and_release_n_are_equivalent_to_repeated_calls() {
        let lock = ExLock::new();
        lock.acquire_n(5);
        assert_eq!(lock.held_count(), 5);
        lock.release_n(2);
        assert_eq!(lock.held_count(), 3);
        lock.release_n(3);
        assert_eq!(lock.held_count(), 0);
    }

    #[test]
    fn second_thread_blocks_until_owner_fully_releases() {
        // Testable scenario S1: mutual exclusion.
        let lock = Arc::new(ExLock::new());
        lock.acquire();
        lock.acquire();

        let entered = Arc::new(AtomicBool::new(false));
        let lock2 = lock.clone();
        let entered2 = entered.clone();
        let handle = thread::spawn(move || {
            lock2.acquire();
            entered2.store(true, Ordering::SeqCst);
            lock2.release();
        });

        thread::sleep(std::time::Duration::from_millis(50));
        assert!(!entered.load(Ordering::SeqCst));

        lock.release();
        lock.release();
        handle.join().unwrap();
        assert!(entered.load(Ordering::SeqCst));
    }

    #[test]
    fn try_acquire_n_reserves_the_requested_depth() {
        let lock = ExLock::new();
        assert!(lock.try_acquire_n(4));
        assert_eq!(lock.held_count(), 4);
        lock.release_n(4);
        assert_eq!(lock.held_count(), 0);
    }

    #[test]
    fn try_acquire_fails_while_held_by_another_thread() {
        let lock = Arc::new(ExLock::new());
        lock.acquire();

        let lock2 = lock.clone();
        let handle = thread::spawn(move || lock2.try_acquire());
        assert!(!handle.join().unwrap());

        lock.release();
    }
}
