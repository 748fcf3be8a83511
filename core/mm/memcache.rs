//! Page-table memory cache
//!
//! Table pages are allocated while the MMU lock is held, where the general
//! allocator cannot be entered. Callers fill a cache beforehand and the
//! table code takes pages from it.
//!
//! In protected mode the hypervisor builds the guest's tables itself, from
//! pages the host donates through a [`HypMemCache`].

use super::{MmOps, PhysAddr, VirtAddr};
use crate::{Error, Result};
use heapless::Vec;

/// Pages a cache can hold
pub const MEMCACHE_CAPACITY: usize = 40;

/// Pre-allocated zeroed pages
#[derive(Debug, Default)]
pub struct MemCache {
    pages: Vec<VirtAddr, MEMCACHE_CAPACITY>,
}

impl MemCache {
    /// Create an empty cache
    pub const fn new() -> Self {
        Self { pages: Vec::new() }
    }

    /// Number of cached pages
    pub fn len(&self) -> usize {
        self.pages.len()
    }

    /// Whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// Make sure at least `min` pages are cached
    ///
    /// Fills the cache completely when below `min`. Succeeds if `min` was
    /// reached even when the allocator ran dry before the cache was full.
    pub fn topup(&mut self, mm: &dyn MmOps, min: usize) -> Result<()> {
        if min > MEMCACHE_CAPACITY {
            return Err(Error::InvalidArgument);
        }
        if self.pages.len() >= min {
            return Ok(());
        }

        while !self.pages.is_full() {
            let Some(page) = mm.alloc_zeroed_page() else {
                if self.pages.len() >= min {
                    break;
                }
                return Err(Error::OutOfMemory);
            };
            // Cannot fail, fullness checked above
            let _ = self.pages.push(page);
        }
        Ok(())
    }

    /// Take one page
    pub fn alloc(&mut self) -> Option<VirtAddr> {
        self.pages.pop()
    }

    /// Return every cached page to the allocator
    pub fn free(&mut self, mm: &dyn MmOps) {
        while let Some(page) = self.pages.pop() {
            mm.put_page(page);
        }
    }
}

/// Pages handed to the hypervisor for its own table allocations
///
/// Holds physical addresses, the hypervisor consumes pages from the top.
#[derive(Debug, Default)]
pub struct HypMemCache {
    pages: Vec<PhysAddr, MEMCACHE_CAPACITY>,
}

impl HypMemCache {
    pub const fn new() -> Self {
        Self { pages: Vec::new() }
    }

    pub fn nr_pages(&self) -> usize {
        self.pages.len()
    }

    /// Grow the cache to `min` pages
    ///
    /// Returns the number of pages added. Pages allocated before a failure
    /// stay in the cache.
    pub fn topup(&mut self, mm: &dyn MmOps, min: usize) -> Result<usize> {
        if min > MEMCACHE_CAPACITY {
            return Err(Error::InvalidArgument);
        }

        let before = self.pages.len();
        while self.pages.len() < min {
            let page = mm.alloc_zeroed_page().ok_or(Error::OutOfMemory)?;
            let _ = self.pages.push(mm.virt_to_phys(page));
        }
        Ok(self.pages.len() - before)
    }

    /// Take the most recently donated page
    pub fn pop(&mut self) -> Option<PhysAddr> {
        self.pages.pop()
    }

    /// Release every page back to the host, returns the number released
    pub fn free(&mut self, mm: &dyn MmOps) -> usize {
        let released = self.pages.len();

        while let Some(page) = self.pages.pop() {
            mm.put_page(mm.phys_to_virt(page));
        }
        released
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::FakeMm;

    #[test]
    fn test_topup_and_free() {
        let mm = FakeMm::new();
        let mut mc = MemCache::new();

        mc.topup(&mm, 3).unwrap();
        assert_eq!(mc.len(), MEMCACHE_CAPACITY);
        assert_eq!(mm.live_pages(), MEMCACHE_CAPACITY);

        let page = mc.alloc().unwrap();
        mc.topup(&mm, 3).unwrap();
        assert_eq!(mc.len(), MEMCACHE_CAPACITY - 1);

        mm.put_page(page);
        mc.free(&mm);
        assert!(mc.is_empty());
        assert_eq!(mm.live_pages(), 0);
    }

    #[test]
    fn test_topup_allocation_failure() {
        let mm = FakeMm::new();
        let mut mc = MemCache::new();

        mm.fail_allocs_after(2);
        assert_eq!(mc.topup(&mm, 3), Err(Error::OutOfMemory));
        assert_eq!(mc.len(), 2);
        assert!(mc.topup(&mm, 2).is_ok());
        mc.free(&mm);
    }

    #[test]
    fn test_hyp_memcache_tops_up_to_min() {
        let mm = FakeMm::new();
        let mut mc = HypMemCache::new();

        assert_eq!(mc.topup(&mm, 3), Ok(3));
        assert_eq!(mc.topup(&mm, 3), Ok(0));
        assert_eq!(mc.topup(&mm, 4), Ok(1));
        assert_eq!(mm.live_pages(), 4);

        let consumed = mc.pop().unwrap();
        assert_eq!(mc.free(&mm), 3);
        assert_eq!(mc.nr_pages(), 0);
        assert_eq!(mm.live_pages(), 1);
        mm.put_page(consumed as VirtAddr);
    }
}
