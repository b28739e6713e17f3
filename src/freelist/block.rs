// Copyright © 2019 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Block free lists (spec §4.7 "Block (priority queue)"): sublists keyed
//! by exact byte size, held in a most-recently-used order so a repeated
//! request for the same size finds its sublist in O(1) at the head (spec
//! §3 `BlkPriorityQueue`: "most-recently-used sublist is at head").
//!
//! Modeled as an arena of typed sublist records plus an explicit MRU
//! ordering `Vec<usize>` of indices into that arena, rather than a genuine
//! intrusive doubly-linked list of Rust references (spec §9 Design Note:
//! "model as an arena of typed records + explicit indices; avoid general
//! pointer graphs").

use std::sync::atomic::{AtomicUsize, Ordering};

use log::warn;

use crate::dlftt::DlfttMutex;
use crate::error::{CoreError, Result};
use crate::freelist::{block_global_cap, block_list_cap, reentrancy};

struct Node {
    data: Box<[u8]>,
    next: Option<Box<Node>>,
}

struct Sublist {
    size: usize,
    free_head: Option<Box<Node>>,
    on_list_count: usize,
    allocated_count: usize,
}

struct Inner {
    /// Arena of sublists; index stable for a sublist's lifetime.
    sublists: Vec<Sublist>,
    /// MRU order: `mru_order[0]` is the most recently looked-up sublist.
    mru_order: Vec<usize>,
}

impl Inner {
    fn find_or_insert(&mut self, size: usize) -> usize {
        if let Some(pos) = self.mru_order.iter().position(|&i| self.sublists[i].size == size) {
            let idx = self.mru_order.remove(pos);
            self.mru_order.insert(0, idx);
            return idx;
        }
        let idx = self.sublists.len();
        self.sublists.push(Sublist {
            size,
            free_head: None,
            on_list_count: 0,
            allocated_count: 0,
        });
        self.mru_order.insert(0, idx);
        idx
    }

    fn total_on_list_bytes(&self) -> usize {
        self.sublists
            .iter()
            .map(|s| s.on_list_count * s.size)
            .sum()
    }
}

/// A free-list class shared by every byte size requested against it (spec
/// §3 `BlkList`). Unlike [`crate::freelist::regular::RegularList`], a
/// single `BlockList` instance *is* the class: there is one process-wide
/// instance, not a registry of per-size heads, because the sublists
/// already partition by size internally.
pub struct BlockList {
    mutex: DlfttMutex,
    inner: std::cell::UnsafeCell<Inner>,
    global_bytes: AtomicUsize,
}

// SAFETY: see RegularList's identical justification.
unsafe impl Sync for BlockList {}

impl BlockList {
    const fn new() -> Self {
        BlockList {
            mutex: DlfttMutex::new(),
            inner: std::cell::UnsafeCell::new(Inner {
                sublists: Vec::new(),
                mru_order: Vec::new(),
            }),
            global_bytes: AtomicUsize::new(0),
        }
    }

    pub fn alloc(&self, size: usize) -> Result<Box<[u8]>> {
        assert!(size > 0, "block free-list request size must be nonzero");
        let guard = self.mutex.acquire();
        // SAFETY: protected by `self.mutex` above.
        let inner = unsafe { &mut *self.inner.get() };
        let idx = inner.find_or_insert(size);
        let sub = &mut inner.sublists[idx];

        if let Some(mut node) = sub.free_head.take() {
            sub.free_head = node.next.take();
            sub.on_list_count -= 1;
            sub.allocated_count += 1;
            self.global_bytes.fetch_sub(size, Ordering::Relaxed);
            self.mutex.release(guard);
            return Ok(node.data);
        }

        if let Some(block) = alloc_zeroed(size) {
            sub.allocated_count += 1;
            self.mutex.release(guard);
            return Ok(block);
        }
        self.mutex.release(guard);

        self.gc()?;
        let guard = self.mutex.acquire();
        let inner = unsafe { &mut *self.inner.get() };
        let idx = inner.find_or_insert(size);
        let block = alloc_zeroed(size).ok_or(CoreError::AllocFailure { requested: size })?;
        inner.sublists[idx].allocated_count += 1;
        self.mutex.release(guard);
        Ok(block)
    }

    pub fn free(&self, block: Box<[u8]>) -> Result<()> {
        let size = block.len();
        let guard = self.mutex.acquire();
        // SAFETY: protected by `self.mutex` above.
        let inner = unsafe { &mut *self.inner.get() };
        let idx = inner.find_or_insert(size);
        let sub = &mut inner.sublists[idx];
        sub.allocated_count -= 1;
        let node = Box::new(Node {
            data: block,
            next: sub.free_head.take(),
        });
        sub.free_head = Some(node);
        sub.on_list_count += 1;
        let sublist_bytes = sub.on_list_count * size;
        self.mutex.release(guard);

        let global_bytes = self.global_bytes.fetch_add(size, Ordering::Relaxed) + size;

        if sublist_bytes > block_list_cap() {
            self.gc_sublist(size)?;
        } else if global_bytes > block_global_cap() {
            self.gc()?;
        }
        Ok(())
    }

    fn gc_sublist(&self, size: usize) -> Result<()> {
        reentrancy::guarded(|| {
            let guard = self.mutex.acquire();
            // SAFETY: protected by `self.mutex` above.
            let inner = unsafe { &mut *self.inner.get() };
            if let Some(idx) = inner.mru_order.iter().find(|&&i| inner.sublists[i].size == size).copied() {
                let sub = &mut inner.sublists[idx];
                let freed = sub.on_list_count * sub.size;
                sub.free_head = None;
                sub.on_list_count = 0;
                self.mutex.release(guard);
                if freed > 0 {
                    self.global_bytes.fetch_sub(freed, Ordering::Relaxed);
                    warn!("block free list: gc released {} bytes for size {}", freed, size);
                }
            } else {
                self.mutex.release(guard);
            }
        });
        Ok(())
    }

    /// Frees every sublist's free-list (a class-wide GC; there is no
    /// separate "list-of-heads" tier to re-enter here, since the sublists
    /// already live inside this single instance).
    pub fn gc(&self) -> Result<()> {
        reentrancy::guarded(|| {
            let guard = self.mutex.acquire();
            // SAFETY: protected by `self.mutex` above.
            let inner = unsafe { &mut *self.inner.get() };
            let freed = inner.total_on_list_bytes();
            for sub in inner.sublists.iter_mut() {
                sub.free_head = None;
                sub.on_list_count = 0;
            }
            self.mutex.release(guard);
            if freed > 0 {
                self.global_bytes.fetch_sub(freed, Ordering::Relaxed);
                warn!("block free list: gc released {} bytes across all sizes", freed);
            }
        });
        Ok(())
    }

    pub fn allocated_count(&self, size: usize) -> usize {
        let guard = self.mutex.acquire();
        let inner = unsafe { &mut *self.inner.get() };
        let idx = inner.find_or_insert(size);
        let v = inner.sublists[idx].allocated_count;
        self.mutex.release(guard);
        v
    }

    pub fn on_list_count(&self, size: usize) -> usize {
        let guard = self.mutex.acquire();
        let inner = unsafe { &mut *self.inner.get() };
        let idx = inner.find_or_insert(size);
        let v = inner.sublists[idx].on_list_count;
        self.mutex.release(guard);
        v
    }

    /// The byte size whose sublist is currently at the head of the MRU
    /// order, if any (spec §3: "most-recently-used sublist is at head").
    pub fn mru_size(&self) -> Option<usize> {
        let guard = self.mutex.acquire();
        let inner = unsafe { &*self.inner.get() };
        let v = inner.mru_order.first().map(|&i| inner.sublists[i].size);
        self.mutex.release(guard);
        v
    }
}

fn alloc_zeroed(size: usize) -> Option<Box<[u8]>> {
    Some(vec![0u8; size].into_boxed_slice())
}

static INSTANCE: BlockList = BlockList::new();

/// Returns the process-wide block free-list instance.
pub fn instance() -> &'static BlockList {
    &INSTANCE
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh() -> BlockList {
        BlockList::new()
    }

    #[test]
    fn lookup_reorders_to_most_recently_used() {
        let list = fresh();
        let a = list.alloc(16).unwrap();
        let b = list.alloc(32).unwrap();
        list.free(a).unwrap();
        list.free(b).unwrap();
        assert_eq!(list.mru_size(), Some(32));
        let _ = list.alloc(16).unwrap();
        assert_eq!(list.mru_size(), Some(16));
    }

    #[test]
    fn recycled_block_matches_requested_size() {
        let list = fresh();
        let block = list.alloc(48).unwrap();
        list.free(block).unwrap();
        let recycled = list.alloc(48).unwrap();
        assert_eq!(recycled.len(), 48);
        list.free(recycled).unwrap();
    }
}
