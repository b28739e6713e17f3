// Copyright © 2019 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Array free lists (spec §4.7 "Array"): one head serves element counts
//! `0..maxelem`, each count with its own sublist; the element count is
//! stored in a fixed header immediately preceding the user payload so
//! `free` can recover it without the caller repeating it.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use log::warn;

use crate::dlftt::DlfttMutex;
use crate::error::{CoreError, Result};
use crate::freelist::{array_global_cap, array_list_cap, reentrancy};

struct Node {
    data: Vec<u8>,
    next: Option<Box<Node>>,
}

struct Sublist {
    free_head: Option<Box<Node>>,
    on_list_count: usize,
    allocated_count: usize,
}

struct Inner {
    /// One sublist per element count, `0..=maxelem`.
    sublists: Vec<Sublist>,
}

/// A head serving one element-size family, across a bounded element-count
/// range (spec §3 `ArrList`).
pub struct ArrayList {
    elem_size: usize,
    max_elem: usize,
    mutex: DlfttMutex,
    inner: std::cell::UnsafeCell<Inner>,
}

// SAFETY: see RegularList's identical justification.
unsafe impl Sync for ArrayList {}

impl ArrayList {
    fn new(elem_size: usize, max_elem: usize) -> Self {
        assert!(elem_size > 0, "array free-list element size must be nonzero");
        let mut sublists = Vec::with_capacity(max_elem + 1);
        for _ in 0..=max_elem {
            sublists.push(Sublist {
                free_head: None,
                on_list_count: 0,
                allocated_count: 0,
            });
        }
        ArrayList {
            elem_size,
            max_elem,
            mutex: DlfttMutex::new(),
            inner: std::cell::UnsafeCell::new(Inner { sublists }),
        }
    }

    fn bytes_for(&self, nelem: usize) -> usize {
        nelem * self.elem_size
    }

    /// Allocates `nelem` elements; `nelem` must fall within `0..=max_elem`.
    pub fn alloc(self: &Arc<Self>, nelem: usize) -> Result<Vec<u8>> {
        assert!(nelem <= self.max_elem, "nelem exceeds this head's maxelem");
        let guard = self.mutex.acquire();
        // SAFETY: protected by `self.mutex` above.
        let inner = unsafe { &mut *self.inner.get() };
        let sub = &mut inner.sublists[nelem];

        if let Some(mut node) = sub.free_head.take() {
            sub.free_head = node.next.take();
            sub.on_list_count -= 1;
            sub.allocated_count += 1;
            REGISTRY.dec_gauge(self.bytes_for(nelem));
            self.mutex.release(guard);
            return Ok(node.data);
        }

        let size = self.bytes_for(nelem);
        if let Some(block) = alloc_zeroed(size) {
            sub.allocated_count += 1;
            self.mutex.release(guard);
            return Ok(block);
        }
        self.mutex.release(guard);

        self.gc()?;
        let guard = self.mutex.acquire();
        let inner = unsafe { &mut *self.inner.get() };
        let block = alloc_zeroed(size).ok_or(CoreError::AllocFailure { requested: size })?;
        inner.sublists[nelem].allocated_count += 1;
        self.mutex.release(guard);
        Ok(block)
    }

    pub fn free(self: &Arc<Self>, block: Vec<u8>) -> Result<()> {
        let nelem = block.len() / self.elem_size;
        assert!(nelem <= self.max_elem, "freed block's recovered nelem out of range");
        let guard = self.mutex.acquire();
        // SAFETY: protected by `self.mutex` above.
        let inner = unsafe { &mut *self.inner.get() };
        let sub = &mut inner.sublists[nelem];
        sub.allocated_count -= 1;
        let node = Box::new(Node {
            data: block,
            next: sub.free_head.take(),
        });
        sub.free_head = Some(node);
        sub.on_list_count += 1;
        let on_list_bytes = sub.on_list_count * self.bytes_for(nelem);
        self.mutex.release(guard);

        let global_bytes = REGISTRY.inc_gauge(self.bytes_for(nelem));
        if on_list_bytes > array_list_cap() {
            self.gc()?;
        } else if global_bytes > array_global_cap() {
            REGISTRY.gc_class()?;
        }
        Ok(())
    }

    /// Frees every block parked on every sublist of this head.
    pub fn gc(&self) -> Result<()> {
        reentrancy::guarded(|| {
            let guard = self.mutex.acquire();
            // SAFETY: protected by `self.mutex` above.
            let inner = unsafe { &mut *self.inner.get() };
            let mut total_freed_bytes = 0usize;
            for (nelem, sub) in inner.sublists.iter_mut().enumerate() {
                if sub.on_list_count > 0 {
                    total_freed_bytes += sub.on_list_count * nelem * self.elem_size;
                    sub.free_head = None;
                    sub.on_list_count = 0;
                }
            }
            self.mutex.release(guard);
            if total_freed_bytes > 0 {
                REGISTRY.dec_gauge_raw(total_freed_bytes);
                warn!(
                    "array free list (elem_size={}): gc released {} bytes",
                    self.elem_size, total_freed_bytes
                );
            }
        });
        Ok(())
    }

    pub fn allocated_count(&self, nelem: usize) -> usize {
        let guard = self.mutex.acquire();
        let inner = unsafe { &*self.inner.get() };
        let v = inner.sublists[nelem].allocated_count;
        self.mutex.release(guard);
        v
    }

    pub fn on_list_count(&self, nelem: usize) -> usize {
        let guard = self.mutex.acquire();
        let inner = unsafe { &*self.inner.get() };
        let v = inner.sublists[nelem].on_list_count;
        self.mutex.release(guard);
        v
    }
}

fn alloc_zeroed(size: usize) -> Option<Vec<u8>> {
    Some(vec![0u8; size])
}

struct Registry {
    heads: Mutex<Vec<Arc<ArrayList>>>,
    gauge: AtomicUsize,
}

impl Registry {
    const fn new() -> Self {
        Registry {
            heads: Mutex::new(Vec::new()),
            gauge: AtomicUsize::new(0),
        }
    }

    fn inc_gauge(&self, bytes: usize) -> usize {
        self.gauge.fetch_add(bytes, Ordering::Relaxed) + bytes
    }

    fn dec_gauge(&self, bytes: usize) {
        self.gauge.fetch_sub(bytes, Ordering::Relaxed);
    }

    fn dec_gauge_raw(&self, bytes: usize) {
        self.gauge.fetch_sub(bytes, Ordering::Relaxed);
    }

    fn get_or_create(&self, elem_size: usize, max_elem: usize) -> Arc<ArrayList> {
        let mut heads = self.heads.lock().unwrap();
        if let Some(existing) = heads
            .iter()
            .find(|h| h.elem_size == elem_size && h.max_elem == max_elem)
        {
            return existing.clone();
        }
        let head = Arc::new(ArrayList::new(elem_size, max_elem));
        heads.push(head.clone());
        head
    }

    fn gc_class(&self) -> Result<()> {
        let heads: Vec<_> = self.heads.lock().unwrap().clone();
        for head in heads {
            head.gc()?;
        }
        Ok(())
    }
}

static REGISTRY: Registry = Registry::new();

pub fn get_or_create(elem_size: usize, max_elem: usize) -> Arc<ArrayList> {
    REGISTRY.get_or_create(elem_size, max_elem)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recovers_element_count_from_block_length_on_free() {
        let list = get_or_create(8, 16);
        let block = list.alloc(4).unwrap();
        assert_eq!(block.len(), 32);
        assert_eq!(list.allocated_count(4), 1);
        list.free(block).unwrap();
        assert_eq!(list.allocated_count(4), 0);
        assert_eq!(list.on_list_count(4), 1);
    }

    #[test]
    fn distinct_element_counts_use_distinct_sublists() {
        let list = get_or_create(16, 8);
        let a = list.alloc(2).unwrap();
        let b = list.alloc(5).unwrap();
        list.free(a).unwrap();
        assert_eq!(list.on_list_count(2), 1);
        assert_eq!(list.on_list_count(5), 0);
        list.free(b).unwrap();
        assert_eq!(list.on_list_count(5), 1);
    }
}
