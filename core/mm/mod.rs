//! Memory management module
//!
//! The VM-level half of the stage-2 MMU: the callback sets the table code
//! is parameterised with, the memory cache feeding it table pages, the view
//! of host memory and memslots, and the engines built on top (abort
//! handling, dirty logging, protected-mode ownership tracking).

pub mod abort;
pub mod dirty;
pub mod host;
pub mod memcache;
pub mod memslot;
pub mod mmu;
pub mod pkvm;

pub use abort::FaultResolution;
pub use memcache::MemCache;
pub use mmu::VmMmu;

use crate::arch::arm64::mmu::stage2::Pte;
use crate::arch::arm64::mmu::Prot;

/// Physical address type
pub type PhysAddr = u64;

/// Virtual address type
pub type VirtAddr = usize;

/// Physical frame number
pub type Pfn = u64;

/// Guest frame number
pub type Gfn = u64;

/// Host virtual address of guest memory
pub type Hva = u64;

/// Memory-management callbacks used by the page-table code
///
/// Every table operation goes through one of these, so the same table code
/// can run against different backing allocators.
pub trait MmOps: Send + Sync {
    /// Allocate a zeroed page with a reference count of one
    ///
    /// May sleep; only called outside the MMU lock to fill a [`MemCache`].
    fn alloc_zeroed_page(&self) -> Option<VirtAddr>;

    /// Take a zeroed table page from `mc`
    fn zalloc_page(&self, mc: &mut MemCache) -> Option<VirtAddr> {
        mc.alloc()
    }

    /// Allocate `size` bytes of zeroed, physically contiguous pages
    fn zalloc_pages_exact(&self, size: usize) -> Option<VirtAddr>;

    /// Free pages obtained with [`MmOps::zalloc_pages_exact`]
    fn free_pages_exact(&self, addr: VirtAddr, size: usize);

    /// Take a reference on the page containing `addr`
    fn get_page(&self, addr: VirtAddr);

    /// Drop a reference on the page containing `addr`, freeing it on zero
    fn put_page(&self, addr: VirtAddr);

    /// Reference count of the page containing `addr`
    fn page_count(&self, addr: VirtAddr) -> u32;

    /// Linear map address of `phys`
    fn phys_to_virt(&self, phys: PhysAddr) -> VirtAddr;

    /// Physical address of a linear map address
    fn virt_to_phys(&self, addr: VirtAddr) -> PhysAddr;

    /// Clean and invalidate the data cache to the point of coherency
    fn dcache_clean_inval_poc(&self, addr: VirtAddr, size: usize);

    /// Invalidate the instruction cache to the point of unification
    fn icache_inval_pou(&self, addr: VirtAddr, size: usize);
}

/// Leaf policy callbacks
pub trait PteOps: Send + Sync {
    /// Whether `[addr, end)` must be mapped at page granularity
    fn force_pte(&self, _addr: u64, _end: u64, _prot: Prot) -> bool {
        false
    }

    /// Whether `pte` holds a reference on the table page containing it
    fn pte_is_counted(&self, pte: Pte, _level: u32) -> bool {
        pte != 0
    }
}

/// Policy of guest stage-2 tables: any granularity, every non-zero entry counted
#[derive(Debug, Default, Clone, Copy)]
pub struct Stage2PteOps;

impl PteOps for Stage2PteOps {}

/// Range of guest frames, `end` exclusive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GfnRange {
    pub start: Gfn,
    pub end: Gfn,
}

impl GfnRange {
    /// Frames `[start, end)`
    pub const fn new(start: Gfn, end: Gfn) -> Self {
        Self { start, end }
    }

    /// Number of frames
    pub const fn len(&self) -> u64 {
        self.end - self.start
    }

    /// Whether the range is empty
    pub const fn is_empty(&self) -> bool {
        self.end <= self.start
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_pte_policy() {
        let ops = Stage2PteOps;

        assert!(!ops.force_pte(0, 0x20_0000, Prot::RW));
        assert!(!ops.pte_is_counted(0, 3));
        assert!(ops.pte_is_counted(0x2, 3));
    }

    #[test]
    fn test_gfn_range() {
        let range = GfnRange::new(0x100, 0x180);
        assert_eq!(range.len(), 0x80);
        assert!(!range.is_empty());
        assert!(GfnRange::new(4, 4).is_empty());
    }
}
