// Copyright © 2019 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Factory free lists (spec §4.7 "Factory"): behaves like a regular free
//! list, but the caller creates and independently destroys each handle at
//! runtime rather than addressing a statically sized head.
//!
//! Factory handles form a doubly-linked global list per spec §3
//! (`FacList`: "Handles form a doubly-linked global list"); modeled, per
//! spec §9's Design Note on intrusive structures, as a registry `Vec` of
//! handles rather than literal back-pointers.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use log::warn;

use crate::dlftt::DlfttMutex;
use crate::error::{CoreError, Result};
use crate::freelist::{factory_global_cap, factory_list_cap, reentrancy};

struct Node {
    data: Box<[u8]>,
    next: Option<Box<Node>>,
}

struct Inner {
    free_head: Option<Box<Node>>,
    on_list_count: usize,
    allocated_count: usize,
}

/// A runtime-created handle for one caller-chosen fixed size (spec §3
/// `FacList`).
pub struct FactoryList {
    size: usize,
    mutex: DlfttMutex,
    inner: std::cell::UnsafeCell<Inner>,
}

// SAFETY: see RegularList's identical justification.
unsafe impl Sync for FactoryList {}

impl FactoryList {
    pub fn size(&self) -> usize {
        self.size
    }

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
        if on_list_bytes > factory_list_cap() {
            self.gc()?;
        } else if global_bytes > factory_global_cap() {
            REGISTRY.gc_class()?;
        }
        Ok(())
    }

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
                    "factory free list (size={}): gc released {} blocks",
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

fn alloc_zeroed(size: usize) -> Option<Box<[u8]>> {
    Some(vec![0u8; size].into_boxed_slice())
}

struct Registry {
    handles: Mutex<Vec<Arc<FactoryList>>>,
    gauge: AtomicUsize,
}

impl Registry {
    const fn new() -> Self {
        Registry {
            handles: Mutex::new(Vec::new()),
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

    fn gc_class(&self) -> Result<()> {
        let handles: Vec<_> = self.handles.lock().unwrap().clone();
        for handle in handles {
            handle.gc()?;
        }
        Ok(())
    }
}

static REGISTRY: Registry = Registry::new();

/// Creates a new, independent factory handle for `size`. Unlike
/// [`crate::freelist::regular::get_or_create`], repeated calls with the
/// same `size` return distinct handles — callers hold onto the handle they
/// get back and address it directly (spec: "User creates a handle for a
/// chosen fixed size").
pub fn create(size: usize) -> Arc<FactoryList> {
    assert!(size > 0, "factory free-list handle size must be nonzero");
    let handle = Arc::new(FactoryList {
        size,
        mutex: DlfttMutex::new(),
        inner: std::cell::UnsafeCell::new(Inner {
            free_head: None,
            on_list_count: 0,
            allocated_count: 0,
        }),
    });
    REGISTRY.handles.lock().unwrap().push(handle.clone());
    handle
}

/// Destroys a factory handle, failing if blocks allocated from it are
/// still outstanding rather than silently leaking them (spec §4.7
/// expansion: mirrors the original's `H5FL_fac_term` contract).
pub fn terminate(handle: Arc<FactoryList>) -> Result<()> {
    if handle.allocated_count() > 0 {
        return Err(CoreError::ProgrammerError(
            "factory free-list terminated with outstanding allocated blocks",
        ));
    }
    let guard = handle.mutex.acquire();
    // SAFETY: protected by `handle.mutex` above.
    let inner = unsafe { &mut *handle.inner.get() };
    let freed = inner.on_list_count;
    inner.free_head = None;
    inner.on_list_count = 0;
    handle.mutex.release(guard);
    if freed > 0 {
        REGISTRY.dec_gauge_by(handle.size, freed);
    }

    let mut handles = REGISTRY.handles.lock().unwrap();
    handles.retain(|h| !Arc::ptr_eq(h, &handle));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_then_free_then_terminate_succeeds_when_empty() {
        let handle = create(24);
        let block = handle.alloc().unwrap();
        handle.free(block).unwrap();
        terminate(handle).unwrap();
    }

    #[test]
    fn terminate_fails_with_outstanding_allocations() {
        // Testable property #4's factory sibling (spec §4.7 expansion).
        let handle = create(24);
        let _block = handle.alloc().unwrap();
        let result = terminate(handle.clone());
        assert!(result.is_err());
        // Clean up so the registry doesn't accumulate across test runs.
        handle.free(_block).unwrap();
        terminate(handle).unwrap();
    }

    #[test]
    fn distinct_handles_for_the_same_size_are_independent() {
        let a = create(40);
        let b = create(40);
        assert!(!Arc::ptr_eq(&a, &b));
        let block = a.alloc().unwrap();
        assert_eq!(a.allocated_count(), 1);
        assert_eq!(b.allocated_count(), 0);
        a.free(block).unwrap();
        terminate(a).unwrap();
        terminate(b).unwrap();
    }
}
