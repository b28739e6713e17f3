// Copyright © 2019 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The in-memory file (spec §4.9): a growable buffer, optionally backed by
//! a [`PosixFile`], with optional page-aligned dirty-region tracking for
//! partial flushes.

use std::sync::Arc;

use crate::error::Result;
use crate::file::dirtyregion::DirtyRegionIndex;
use crate::file::posix::PosixFile;

const DEFAULT_INCREMENT: usize = 64 * 1024;
const DEFAULT_PAGE_SIZE: usize = 4096;

// Page-boundary rounding in the write path (spec §4.9) assumes a
// power-of-two granularity.
static_assertions::const_assert!(DEFAULT_PAGE_SIZE > 0 && (DEFAULT_PAGE_SIZE & (DEFAULT_PAGE_SIZE - 1)) == 0);

/// Tunables for one [`CoreFile`] (spec §3 `FileTunables` (expansion)).
#[derive(Debug, Clone, Copy)]
pub struct FileTunables {
    /// Buffer growth granularity; the buffer length is always a multiple
    /// of this.
    pub increment: usize,
    /// Dirty-region rounding granularity. Zero disables write tracking
    /// (spec §3: "page size 0 at open disables tracking").
    pub page_size: usize,
    pub ignore_disabled_locks: bool,
}

impl Default for FileTunables {
    fn default() -> Self {
        FileTunables {
            increment: DEFAULT_INCREMENT,
            page_size: DEFAULT_PAGE_SIZE,
            ignore_disabled_locks: false,
        }
    }
}

/// Caller-supplied allocation/free pair for image-backed opens, the
/// idiomatic rendition of the original's raw `alloc`/`free` C function
/// pointers (spec §4.9 expansion).
pub trait ImageAllocator: Send + Sync {
    fn alloc(&self, size: usize) -> Vec<u8>;
    fn free(&self, buf: Vec<u8>) {
        drop(buf);
    }
}

/// The default allocator: the system allocator via `Vec`.
pub struct DefaultImageAllocator;

impl ImageAllocator for DefaultImageAllocator {
    fn alloc(&self, size: usize) -> Vec<u8> {
        vec![0u8; size]
    }
}

fn round_up(value: usize, granularity: usize) -> usize {
    if granularity == 0 {
        return value;
    }
    value.div_ceil(granularity) * granularity
}

/// An in-memory, growable buffer optionally backed by a file (spec §3
/// `CoreFile`).
pub struct CoreFile {
    backing: Option<PosixFile>,
    buffer: Vec<u8>,
    tunables: FileTunables,
    dirty: bool,
    dirty_regions: Option<DirtyRegionIndex>,
    eoa: u64,
    /// User-supplied alloc/free pair for the buffer, if any (spec §4.9
    /// expansion). `None` means the system allocator via `Vec` owns it.
    allocator: Option<Arc<dyn ImageAllocator>>,
}

impl CoreFile {
    /// Opens from a supplied image buffer, always copying it (spec §4.9
    /// expansion: "this crate always copies for safety"). `backing`, if
    /// supplied, is the optional backing store flushed to on `flush`.
    pub fn open_from_image(image: &[u8], tunables: FileTunables, backing: Option<PosixFile>) -> Self {
        Self::open_from_image_with_allocator(image, tunables, backing, None)
    }

    /// As [`CoreFile::open_from_image`], but the buffer is obtained through
    /// `allocator` rather than the system allocator, and handed back to
    /// `allocator`'s `free` on [`CoreFile::close`] (spec §4.9 "the optional
    /// user-supplied allocation/free callback pair").
    pub fn open_from_image_with_allocator(
        image: &[u8],
        tunables: FileTunables,
        backing: Option<PosixFile>,
        allocator: Option<Arc<dyn ImageAllocator>>,
    ) -> Self {
        let len = round_up(image.len(), tunables.increment.max(1));
        let mut buffer = match &allocator {
            Some(a) => a.alloc(len),
            None => vec![0u8; len],
        };
        if buffer.len() < len {
            buffer.resize(len, 0);
        }
        buffer[..image.len()].copy_from_slice(image);
        let dirty_regions = (tunables.page_size > 0).then(DirtyRegionIndex::new);
        CoreFile {
            backing,
            buffer,
            tunables,
            dirty: false,
            dirty_regions,
            eoa: image.len() as u64,
            allocator,
        }
    }

    /// Opens empty, or by reading an existing backing file's contents into
    /// the buffer.
    pub fn open_with_backing(mut backing: PosixFile, tunables: FileTunables) -> Result<Self> {
        let eof = backing.get_eof();
        let len = round_up(eof as usize, tunables.increment.max(1));
        let mut buffer = vec![0u8; len];
        if eof > 0 {
            backing.read(0, &mut buffer[..eof as usize], None)?;
        }
        let dirty_regions = (tunables.page_size > 0).then(DirtyRegionIndex::new);
        Ok(CoreFile {
            backing: Some(backing),
            buffer,
            tunables,
            dirty: false,
            dirty_regions,
            eoa: eof,
            allocator: None,
        })
    }

    pub fn get_eoa(&self) -> u64 {
        self.eoa
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Reads `buf.len()` bytes at `addr`; reading past `eoa` is a
    /// programmer error (the caller is expected to track content length).
    pub fn read(&self, addr: u64, buf: &mut [u8]) {
        let start = addr as usize;
        let end = start + buf.len();
        assert!(end <= self.buffer.len(), "read out of buffer bounds");
        buf.copy_from_slice(&self.buffer[start..end]);
    }

    /// Extends the buffer as needed, writes `data` at `addr`, marks dirty,
    /// and (if tracking) inserts/merges a page-aligned dirty region (spec
    /// §4.9 "Write path").
    pub fn write(&mut self, addr: u64, data: &[u8]) {
        let end = addr + data.len() as u64;
        if end > self.eoa {
            self.eoa = end;
        }
        let needed = end as usize;
        if needed > self.buffer.len() {
            let new_len = round_up(needed, self.tunables.increment.max(1));
            self.buffer.resize(new_len, 0);
        }

        let start = addr as usize;
        self.buffer[start..start + data.len()].copy_from_slice(data);
        self.dirty = true;

        if let Some(index) = &mut self.dirty_regions {
            let page = self.tunables.page_size as u64;
            let region_start = (addr / page) * page;
            // "end is rounded up to one less than a page boundary, clamped
            // to current eof" (spec §4.9).
            let raw_end = end.div_ceil(page) * page;
            let region_end = (raw_end.saturating_sub(1)).min(self.eoa.saturating_sub(1));
            index.insert_merging(region_start, region_end);
        }
    }

    /// Writes the whole buffer, or just the dirty regions, to the backing
    /// store, then clears `dirty` (spec §4.9 "Flush path").
    pub fn flush(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        let Some(backing) = &mut self.backing else {
            self.dirty = false;
            return Ok(());
        };

        match &mut self.dirty_regions {
            None => {
                backing.write(0, &self.buffer[..self.eoa as usize], None)?;
            }
            Some(index) => {
                while let Some((start, end)) = index.remove_first() {
                    let end = end.min(self.eoa.saturating_sub(1));
                    if end < start {
                        continue;
                    }
                    let slice = &self.buffer[start as usize..=end as usize];
                    backing.write(start, slice, None)?;
                }
            }
        }
        self.dirty = false;
        Ok(())
    }

    /// Grows or shrinks the logical file. When `closing` is true and a
    /// backing store is present, both `eof` and the backing file's length
    /// are set to `eoa` (spec §4.9 "Truncate path").
    pub fn truncate(&mut self, closing: bool) -> Result<()> {
        if closing {
            if let Some(backing) = &mut self.backing {
                backing.set_eof(self.eoa)?;
                backing.truncate(Some(self.eoa))?;
            }
            return Ok(());
        }
        let new_len = round_up(self.eoa as usize, self.tunables.increment.max(1));
        if new_len > self.buffer.len() {
            self.buffer.resize(new_len, 0);
        }
        Ok(())
    }

    /// Best-effort flush, then tears down the dirty-region index, frees the
    /// buffer through the user-supplied allocator if one was given, and
    /// closes the backing file if open (spec §4.9 "Close path").
    pub fn close(mut self) -> Result<()> {
        let flush_result = self.flush();
        if let Some(index) = &mut self.dirty_regions {
            index.clear();
        }
        let buffer = std::mem::take(&mut self.buffer);
        if let Some(allocator) = self.allocator.take() {
            allocator.free(buffer);
        }
        if let Some(backing) = self.backing.take() {
            backing.close()?;
        }
        flush_result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_round_trips() {
        let tunables = FileTunables {
            increment: 128,
            page_size: 64,
            ignore_disabled_locks: false,
        };
        let mut f = CoreFile::open_from_image(&[], tunables, None);
        f.write(10, b"hello");
        let mut buf = [0u8; 5];
        f.read(10, &mut buf);
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn buffer_length_is_always_a_multiple_of_increment() {
        let tunables = FileTunables {
            increment: 64,
            page_size: 0,
            ignore_disabled_locks: false,
        };
        let mut f = CoreFile::open_from_image(&[], tunables, None);
        f.write(1000, b"x");
        assert_eq!(f.len() % 64, 0);
        assert!(f.len() as u64 >= f.get_eoa());
    }

    #[test]
    fn zero_page_size_disables_dirty_tracking() {
        let tunables = FileTunables {
            increment: 64,
            page_size: 0,
            ignore_disabled_locks: false,
        };
        let mut f = CoreFile::open_from_image(&[], tunables, None);
        f.write(0, b"x");
        assert!(f.dirty_regions.is_none());
    }

    #[test]
    fn dirty_region_merges_across_adjacent_pages() {
        // Testable scenario S5.
        let tunables = FileTunables {
            increment: 4096 * 4,
            page_size: 4096,
            ignore_disabled_locks: false,
        };
        let mut f = CoreFile::open_from_image(&[0u8; 8200], tunables, None);
        f.write(100, &[1u8; 10]);
        f.write(5000, &[1u8; 10]);
        f.write(4090, &[1u8; 20]);
        let regions: Vec<_> = f.dirty_regions.as_ref().unwrap().iter().collect();
        assert_eq!(regions.len(), 1);
        let (start, end) = regions[0];
        assert_eq!(start, 0);
        assert_eq!(end, 8191);
    }

    #[test]
    fn custom_allocator_supplies_and_reclaims_the_buffer() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        struct CountingAllocator {
            allocs: AtomicUsize,
            frees: AtomicUsize,
        }
        impl ImageAllocator for CountingAllocator {
            fn alloc(&self, size: usize) -> Vec<u8> {
                self.allocs.fetch_add(1, Ordering::SeqCst);
                vec![0u8; size]
            }
            fn free(&self, buf: Vec<u8>) {
                self.frees.fetch_add(1, Ordering::SeqCst);
                drop(buf);
            }
        }

        let allocator = Arc::new(CountingAllocator {
            allocs: AtomicUsize::new(0),
            frees: AtomicUsize::new(0),
        });
        let tunables = FileTunables::default();
        let f = CoreFile::open_from_image_with_allocator(
            b"hi",
            tunables,
            None,
            Some(allocator.clone() as Arc<dyn ImageAllocator>),
        );
        assert_eq!(allocator.allocs.load(Ordering::SeqCst), 1);
        f.close().unwrap();
        assert_eq!(allocator.frees.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn default_image_allocator_round_trips() {
        let tunables = FileTunables::default();
        let f = CoreFile::open_from_image_with_allocator(
            b"data",
            tunables,
            None,
            Some(Arc::new(DefaultImageAllocator) as Arc<dyn ImageAllocator>),
        );
        let mut buf = [0u8; 4];
        f.read(0, &mut buf);
        assert_eq!(&buf, b"data");
        f.close().unwrap();
    }

    #[test]
    fn open_from_image_always_copies() {
        let tunables = FileTunables::default();
        let image = vec![9u8; 16];
        let f = CoreFile::open_from_image(&image, tunables, None);
        // Mutating the source buffer afterward must not affect the file.
        let mut image2 = image.clone();
        image2[0] = 0;
        let mut buf = [0u8; 1];
        f.read(0, &mut buf);
        assert_eq!(buf[0], 9);
    }
}
