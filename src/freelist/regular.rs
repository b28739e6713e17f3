// Copyright © 2019 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Regular free lists (spec §4.7 "Regular"): one fixed size per head, a
//! singly-linked LIFO free stack.
//!
//! [`Registry`] is the class's "list-of-heads", one instance per process
//! (spec §3: "global-list linkage"; §5: "list-of-heads before any
//! individual head"). It tracks the class-wide "memory on free lists"
//! gauge (testable property #3) and is the thing `free()` consults to
//! decide between a head-local GC and a class-wide one.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use log::warn;

use crate::dlftt::DlfttMutex;
use crate::error::{CoreError, Result};
use crate::freelist::{reentrancy, regular_global_cap, regular_list_cap};

struct Node {
    data: Box<[u8]>,
    next: Option<Box<Node>>,
}

struct Inner {
    free_head: Option<Box<Node>>,
    on_list_count: usize,
    allocated_count: usize,
}

/// A head for one fixed allocation size (spec §3 `RegList`).
pub struct RegularList {
    size: usize,
    mutex: DlfttMutex,
    inner: std::cell::UnsafeCell<Inner>,
}

// SAFETY: all access to `inner` happens while `mutex`'s critical section is
// held (or elided via the DLFTT escape, which only ever applies to
// already-serialized re-entrant calls on the same thread), so there is
// never a concurrent aliasing mutable borrow.
unsafe impl Sync for RegularList {}

impl RegularList {
    fn new(size: usize) -> Self {
        assert!(size > 0, "regular free-list head size must be nonzero");
        RegularList {
            size,
            mutex: DlfttMutex::new(),
            inner: std::cell::UnsafeCell::new(Inner {
                free_head: None,
                on_list_count: 0,
                allocated_count: 0,
            }),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Returns a block either recycled from the free-list or freshly
    /// allocated; retries once after a garbage-collect pass if the initial
    /// allocation fails (spec §4.7: "if allocation fails, it invokes a
    /// global garbage-collect-all pass and retries once").
    pub fn alloc(self: &Arc<Self>) -> Result<Box<[u8]>> {
        let guard = self.mutex.acquire();
        // SAFETY: protected by `self.mutex` above.
        let inner = unsafe { &mut *self.inner.get() };

        if let Some(mut node) = inner.free_head.take() {
            inner.free_head = node.next.take();
            inner.on_list_count -= 1;
            inner.allocated_count += 1;
            REGISTRY.dec_gauge(self.size);
            self.mutex.release(guard);
            return Ok(node.data);
        }

        if let Some(block) = alloc_zeroed(self.size) {
            inner.allocated_count += 1;
            self.mutex.release(guard);
            return Ok(block);
        }
        self.mutex.release(guard);

        self.gc()?;
        let guard = self.mutex.acquire();
        let inner = unsafe { &mut *self.inner.get() };
        let block = alloc_zeroed(self.size).ok_or(CoreError::AllocFailure {
            requested: self.size,
        })?;
        inner.allocated_count += 1;
        self.mutex.release(guard);
        Ok(block)
    }

    /// Links `block` back onto the free-list, then checks the per-list and
    /// class-global caps, triggering the narrowest GC that applies (spec
    /// §4.7).
    pub fn free(self: &Arc<Self>, block: Box<[u8]>) -> Result<()> {
        assert_eq!(block.len(), self.size, "freed block size mismatch");
        let guard = self.mutex.acquire();
        // SAFETY: protected by `self.mutex` above.
        let inner = unsafe { &mut *self.inner.get() };
        inner.allocated_count -= 1;
        let node = Box::new(Node {
            data: block,
            next: inner.free_head.take(),
        });
        inner.free_head = Some(node);
        inner.on_list_count += 1;
        let on_list_bytes = inner.on_list_count * self.size;
        self.mutex.release(guard);

        let global_bytes = REGISTRY.inc_gauge(self.size);

        if on_list_bytes > regular_list_cap() {
            self.gc()?;
        } else if global_bytes > regular_global_cap() {
            REGISTRY.gc_class()?;
        }
        Ok(())
    }

    /// Frees every block currently parked on this head's free-list.
    pub fn gc(&self) -> Result<()> {
        reentrancy::guarded(|| {
            let guard = self.mutex.acquire();
            // SAFETY: protected by `self.mutex` above.
            let inner = unsafe { &mut *self.inner.get() };
            let freed = inner.on_list_count;
            inner.free_head = None;
            inner.on_list_count = 0;
            self.mutex.release(guard);
            if freed > 0 {
                REGISTRY.dec_gauge_by(self.size, freed);
                warn!(
                    "regular free list (size={}): gc released {} blocks",
                    self.size, freed
                );
            }
        });
        Ok(())
    }

    pub fn allocated_count(&self) -> usize {
        let guard = self.mutex.acquire();
        let inner = unsafe { &*self.inner.get() };
        let v = inner.allocated_count;
        self.mutex.release(guard);
        v
    }

    pub fn on_list_count(&self) -> usize {
        let guard = self.mutex.acquire();
        let inner = unsafe { &*self.inner.get() };
        let v = inner.on_list_count;
        self.mutex.release(guard);
        v
    }
}

pub(crate) fn alloc_zeroed(size: usize) -> Option<Box<[u8]>> {
    Some(vec![0u8; size].into_boxed_slice())
}

/// The class-wide list-of-heads, keyed by fixed allocation size, plus the
/// class's "memory on free lists" gauge (testable property #3).
struct Registry {
    heads: Mutex<Vec<Arc<RegularList>>>,
    gauge: AtomicUsize,
}

impl Registry {
    const fn new() -> Self {
        Registry {
            heads: Mutex::new(Vec::new()),
            gauge: AtomicUsize::new(0),
        }
    }

    fn inc_gauge(&self, size: usize) -> usize {
        self.gauge.fetch_add(size, Ordering::Relaxed) + size
    }

    fn dec_gauge(&self, size: usize) {
        self.gauge.fetch_sub(size, Ordering::Relaxed);
    }

    fn dec_gauge_by(&self, size: usize, count: usize) {
        self.gauge.fetch_sub(size * count, Ordering::Relaxed);
    }

    /// Returns the existing head for `size`, creating one if this is its
    /// first use (spec §4.7: "head added on first use").
    fn get_or_create(&self, size: usize) -> Arc<RegularList> {
        let mut heads = self.heads.lock().unwrap();
        if let Some(existing) = heads.iter().find(|h| h.size == size) {
            return existing.clone();
        }
        let head = Arc::new(RegularList::new(size));
        heads.push(head.clone());
        head
    }

    /// Walks every head in the class and runs its GC. The list-of-heads
    /// mutex is released before any individual head's GC runs, satisfying
    /// the ordering rule in spec §5.
    fn gc_class(&self) -> Result<()> {
        let heads: Vec<_> = self.heads.lock().unwrap().clone();
        for head in heads {
            head.gc()?;
        }
        Ok(())
    }
}

static REGISTRY: Registry = Registry::new();

/// Returns the process-wide head for `size`, creating it on first use.
pub fn get_or_create(size: usize) -> Arc<RegularList> {
    REGISTRY.get_or_create(size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_then_free_recycles_the_block() {
        let list = get_or_create(64);
        let block = list.alloc().unwrap();
        assert_eq!(list.allocated_count(), 1);
        list.free(block).unwrap();
        assert_eq!(list.allocated_count(), 0);
        assert_eq!(list.on_list_count(), 1);

        let recycled = list.alloc().unwrap();
        assert_eq!(recycled.len(), 64);
        assert_eq!(list.on_list_count(), 0);
        list.free(recycled).unwrap();
    }

    #[test]
    fn allocated_never_below_on_list() {
        // Testable property #4: allocated_count >= on_list_count, always.
        let list = get_or_create(96);
        let blocks: Vec<_> = (0..10).map(|_| list.alloc().unwrap()).collect();
        assert!(list.allocated_count() >= list.on_list_count());
        for b in blocks {
            list.free(b).unwrap();
            assert!(list.allocated_count() >= list.on_list_count());
        }
    }

    #[test]
    fn exceeding_list_cap_triggers_gc() {
        // Testable scenario S4 (regular variant).
        use crate::freelist::FreeListCaps;
        let mut caps = FreeListCaps::default();
        caps.regular_list_cap = 16; // two 160-byte blocks trivially exceed this.
        caps.set();

        let list = get_or_create(160);
        let a = list.alloc().unwrap();
        let b = list.alloc().unwrap();
        list.free(a).unwrap();
        list.free(b).unwrap();
        assert_eq!(list.on_list_count(), 0);

        FreeListCaps::default().set();
    }

    #[test]
    fn same_size_returns_the_same_head() {
        let a = get_or_create(128);
        let b = get_or_create(128);
        assert!(Arc::ptr_eq(&a, &b));
    }
}
