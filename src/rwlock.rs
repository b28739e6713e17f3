// Copyright © 2019 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Recursive reader/writer lock (spec §4.2).
//!
//! Three states — Idle, Readers-Active, Writer-Active — held behind a
//! `Mutex`, with a `Condvar` for waiters. Writer-preferring: once a writer
//! is waiting, newly arriving readers queue behind it rather than
//! continuing to join the active reader set, so a steady stream of readers
//! can't starve a writer (spec testable property #8). Each thread may
//! recursively reacquire either a read or a write hold it already owns; per
//! spec §4.2 this is tracked with a `thread_local!`-keyed map rather than a
//! single recursion counter, since distinct threads' recursion depths must
//! not be confused with each other.

use std::collections::HashMap;
use std::sync::{Condvar, Mutex};

use crate::threadinfo::{self, ThreadId};

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mode {
    Idle,
    Readers,
    Writer,
}

struct State {
    mode: Mode,
    active_readers: u32,
    /// Readers already holding the lock, recursively, keyed by thread id so
    /// each thread's own recursion depth can't be confused with another's.
    reader_holders: HashMap<ThreadId, u32>,
    writer_holder: Option<ThreadId>,
    writer_depth: u32,
    waiting_writers: u32,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RwLockStats {
    pub read_acquisitions: u64,
    pub write_acquisitions: u64,
}

pub struct RwLock {
    state: Mutex<State>,
    cv: Condvar,
    stats: Mutex<RwLockStats>,
}

impl RwLock {
    pub fn new() -> Self {
        RwLock {
            state: Mutex::new(State {
                mode: Mode::Idle,
                active_readers: 0,
                reader_holders: HashMap::new(),
                writer_holder: None,
                writer_depth: 0,
                waiting_writers: 0,
            }),
            cv: Condvar::new(),
            stats: Mutex::new(RwLockStats::default()),
        }
    }

    pub fn acquire_read(&self) {
        self.acquire_read_n(1);
    }

    /// Acquires (or recursively reacquires) a read hold, reserving `n`
    /// levels of recursion depth in one call.
    pub fn acquire_read_n(&self, n: u32) {
        debug_assert!(n > 0);
        let me = threadinfo::thread_id();
        let mut state = self.state.lock().unwrap();

        // Recursive read reacquisition by an existing holder always
        // succeeds immediately, even if writers are queued: a thread that
        // already holds a read lock can't be starved by itself.
        if let Some(count) = state.reader_holders.get_mut(&me) {
            *count += n;
            drop(state);
            self.stats.lock().unwrap().read_acquisitions += 1;
            return;
        }

        // A writer already recursively holding this lock from the same
        // thread is allowed to also take a nested read (writers imply read
        // access in this model).
        if state.writer_holder == Some(me) {
            drop(state);
            self.stats.lock().unwrap().read_acquisitions += 1;
            return;
        }

        loop {
            let can_join = match state.mode {
                Mode::Idle => true,
                Mode::Readers => state.waiting_writers == 0,
                Mode::Writer => false,
            };
            if can_join {
                state.mode = Mode::Readers;
                state.active_readers += 1;
                state.reader_holders.insert(me, n);
                break;
            }
            state = self.cv.wait(state).unwrap();
        }
        drop(state);
        self.stats.lock().unwrap().read_acquisitions += 1;
    }

    /// Non-blocking variant of [`RwLock::acquire_read_n`]. Returns `true`
    /// if the read hold was granted (or its recursion depth bumped by
    /// `n`); returns `false` immediately, without blocking, if a writer
    /// holds the lock or one is queued ahead of new readers.
    pub fn try_acquire_read_n(&self, n: u32) -> bool {
        debug_assert!(n > 0);
        let me = threadinfo::thread_id();
        let mut state = self.state.lock().unwrap();

        if let Some(count) = state.reader_holders.get_mut(&me) {
            *count += n;
            drop(state);
            self.stats.lock().unwrap().read_acquisitions += 1;
            return true;
        }
        if state.writer_holder == Some(me) {
            drop(state);
            self.stats.lock().unwrap().read_acquisitions += 1;
            return true;
        }

        let can_join = match state.mode {
            Mode::Idle => true,
            Mode::Readers => state.waiting_writers == 0,
            Mode::Writer => false,
        };
        if !can_join {
            return false;
        }
        state.mode = Mode::Readers;
        state.active_readers += 1;
        state.reader_holders.insert(me, n);
        drop(state);
        self.stats.lock().unwrap().read_acquisitions += 1;
        true
    }

    pub fn release_read(&self) {
        self.release_read_n(1);
    }

    /// Releases `n` levels of read-recursion depth in one call.
    pub fn release_read_n(&self, n: u32) {
        debug_assert!(n > 0);
        let me = threadinfo::thread_id();
        let mut state = self.state.lock().unwrap();

        if state.writer_holder == Some(me) && !state.reader_holders.contains_key(&me) {
            // This was a writer's implied read; nothing to release here.
            return;
        }

        let depth = state
            .reader_holders
            .get_mut(&me)
            .expect("release_read called without a matching acquire_read");
        assert!(*depth >= n, "release_read_n exceeds held recursion depth");
        *depth -= n;
        if *depth > 0 {
            return;
        }
        state.reader_holders.remove(&me);
        state.active_readers -= 1;
        if state.active_readers == 0 {
            state.mode = Mode::Idle;
            drop(state);
            self.cv.notify_all();
        }
    }

    pub fn acquire_write(&self) {
        self.acquire_write_n(1);
    }

    /// Acquires (or recursively reacquires) the write hold, reserving `n`
    /// levels of recursion depth in one call.
    pub fn acquire_write_n(&self, n: u32) {
        debug_assert!(n > 0);
        let me = threadinfo::thread_id();
        let mut state = self.state.lock().unwrap();

        if state.writer_holder == Some(me) {
            state.writer_depth += n;
            drop(state);
            self.stats.lock().unwrap().write_acquisitions += 1;
            return;
        }

        state.waiting_writers += 1;
        loop {
            if state.mode == Mode::Idle {
                state.waiting_writers -= 1;
                state.mode = Mode::Writer;
                state.writer_holder = Some(me);
                state.writer_depth = n;
                break;
            }
            state = self.cv.wait(state).unwrap();
        }
        drop(state);
        self.stats.lock().unwrap().write_acquisitions += 1;
    }

    /// Non-blocking variant of [`RwLock::acquire_write_n`]. Returns `true`
    /// if the write hold was granted (or its recursion depth bumped by
    /// `n`); returns `false` immediately, without blocking, if the lock is
    /// idle-but-contended by another thread in any mode.
    pub fn try_acquire_write_n(&self, n: u32) -> bool {
        debug_assert!(n > 0);
        let me = threadinfo::thread_id();
        let mut state = self.state.lock().unwrap();

        if state.writer_holder == Some(me) {
            state.writer_depth += n;
            drop(state);
            self.stats.lock().unwrap().write_acquisitions += 1;
            return true;
        }
        if state.mode != Mode::Idle {
            return false;
        }
        state.mode = Mode::Writer;
        state.writer_holder = Some(me);
        state.writer_depth = n;
        drop(state);
        self.stats.lock().unwrap().write_acquisitions += 1;
        true
    }

    pub fn release_write(&self) {
        self.release_write_n(1);
    }

    /// Releases `n` levels of write-recursion depth in one call.
    pub fn release_write_n(&self, n: u32) {
        debug_assert!(n > 0);
        let me = threadinfo::thread_id();
        let mut state = self.state.lock().unwrap();
        assert_eq!(state.writer_holder, Some(me), "release_write without matching acquire_write");
        assert!(state.writer_depth >= n, "release_write_n exceeds held recursion depth");
        state.writer_depth -= n;
        if state.writer_depth == 0 {
            state.writer_holder = None;
            state.mode = Mode::Idle;
            drop(state);
            self.cv.notify_all();
        }
    }

    /// Releases every write-recursion level the calling thread currently
    /// holds, in one call, returning the depth that was released (spec §6:
    /// "releases the entire recursive stack... returning the depth that
    /// was released"). Unlike [`RwLock::release_write_n`], this doesn't
    /// need to be paired with a specific `acquire_write_n` call — several
    /// stacked acquisitions drain in one shot. Returns 0, without error, if
    /// the calling thread doesn't currently hold a write lock.
    pub fn release_write_all(&self) -> u32 {
        let me = threadinfo::thread_id();
        let mut state = self.state.lock().unwrap();
        if state.writer_holder != Some(me) {
            return 0;
        }
        let depth = state.writer_depth;
        state.writer_depth = 0;
        state.writer_holder = None;
        state.mode = Mode::Idle;
        drop(state);
        self.cv.notify_all();
        depth
    }

    /// Releases every read-recursion level the calling thread currently
    /// holds, in one call, returning the depth that was released. Returns 0
    /// if the calling thread holds no read lock of its own (including the
    /// case where its only access is an implied read through a write hold).
    pub fn release_read_all(&self) -> u32 {
        let me = threadinfo::thread_id();
        let mut state = self.state.lock().unwrap();
        let depth = match state.reader_holders.remove(&me) {
            Some(depth) => depth,
            None => return 0,
        };
        state.active_readers -= 1;
        if state.active_readers == 0 {
            state.mode = Mode::Idle;
            drop(state);
            self.cv.notify_all();
        }
        depth
    }

    pub fn stats(&self) -> RwLockStats {
        *self.stats.lock().unwrap()
    }
}

impl Default for RwLock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn multiple_readers_proceed_concurrently() {
        let lock = Arc::new(RwLock::new());
        let concurrent = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let lock = lock.clone();
                let concurrent = concurrent.clone();
                let max_seen = max_seen.clone();
                thread::spawn(move || {
                    lock.acquire_read();
                    let n = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                    max_seen.fetch_max(n, Ordering::SeqCst);
                    thread::sleep(std::time::Duration::from_millis(20));
                    concurrent.fetch_sub(1, Ordering::SeqCst);
                    lock.release_read();
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert!(max_seen.load(Ordering::SeqCst) > 1);
    }

    #[test]
    fn writer_excludes_readers_and_other_writers() {
        let lock = Arc::new(RwLock::new());
        lock.acquire_write();

        let reader_entered = Arc::new(AtomicBool::new(false));
        let lock2 = lock.clone();
        let reader_entered2 = reader_entered.clone();
        let handle = thread::spawn(move || {
            lock2.acquire_read();
            reader_entered2.store(true, Ordering::SeqCst);
            lock2.release_read();
        });

        thread::sleep(std::time::Duration::from_millis(50));
        assert!(!reader_entered.load(Ordering::SeqCst));
        lock.release_write();
        handle.join().unwrap();
        assert!(reader_entered.load(Ordering::SeqCst));
    }

    #[test]
    fn recursive_read_and_write_reacquisition() {
        let lock = RwLock::new();
        lock.acquire_read();
        lock.acquire_read();
        lock.release_read();
        lock.release_read();

        lock.acquire_write();
        lock.acquire_write();
        lock.release_write();
        lock.release_write();
    }

    #[test]
    fn try_acquire_write_n_reserves_depth_and_fails_under_contention() {
        let lock = RwLock::new();
        assert!(lock.try_acquire_write_n(3));
        lock.release_write_n(3);

        let lock = Arc::new(RwLock::new());
        lock.acquire_write();
        let lock2 = lock.clone();
        let handle = thread::spawn(move || lock2.try_acquire_write_n(2));
        assert!(!handle.join().unwrap());
        lock.release_write();
    }

    #[test]
    fn waiting_writer_blocks_new_readers() {
        // Testable property #8: writer-preferring fairness.
        let lock = Arc::new(RwLock::new());
        lock.acquire_read();

        let writer_done = Arc::new(AtomicBool::new(false));
        let lock_w = lock.clone();
        let writer_done2 = writer_done.clone();
        let writer = thread::spawn(move || {
            lock_w.acquire_write();
            writer_done2.store(true, Ordering::SeqCst);
            lock_w.release_write();
        });
        thread::sleep(std::time::Duration::from_millis(30));

        let late_reader_entered = Arc::new(AtomicBool::new(false));
        let lock_r = lock.clone();
        let late_reader_entered2 = late_reader_entered.clone();
        let late_reader = thread::spawn(move || {
            lock_r.acquire_read();
            late_reader_entered2.store(true, Ordering::SeqCst);
            lock_r.release_read();
        });
        thread::sleep(std::time::Duration::from_millis(30));
        assert!(!late_reader_entered.load(Ordering::SeqCst));

        lock.release_read();
        writer.join().unwrap();
        late_reader.join().unwrap();
        assert!(writer_done.load(Ordering::SeqCst));
        assert!(late_reader_entered.load(Ordering::SeqCst));
    }
}
