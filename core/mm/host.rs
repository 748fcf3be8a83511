//! Host virtual memory interface
//!
//! Guest memory is ordinary host process memory. The fault engine looks up
//! the VMA backing a guest frame, borrows the physical page behind it and,
//! in protected mode, pins it for donation. Borrowed and pinned pages are
//! held through handles that give the reference back when dropped.

use super::{Hva, Pfn};
use crate::config::Granule;
use crate::Result;
use alloc::sync::Arc;
use bitflags::bitflags;

bitflags! {
    /// VMA properties the stage-2 code cares about
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VmaFlags: u32 {
        /// Backed by hugetlbfs
        const HUGETLB = 1 << 0;
        /// Raw pfn mapping, typically device memory
        const PFNMAP = 1 << 1;
        /// Shared mapping
        const SHARED = 1 << 2;
    }
}

/// A host virtual memory area
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Vma {
    /// First address
    pub start: Hva,
    /// End address, exclusive
    pub end: Hva,
    /// Offset in pages, the first pfn for `PFNMAP` areas
    pub pgoff: u64,
    /// Properties
    pub flags: VmaFlags,
    /// Huge page shift of a hugetlb area
    pub huge_page_shift: u32,
}

impl Vma {
    /// Largest mapping shift the VMA allows around `hva`
    ///
    /// Hugetlb areas report their huge page size. Pfn maps allow a block
    /// when `hva` and the physical address are equally aligned and the
    /// block lies within the VMA.
    pub fn page_shift(&self, hva: Hva, granule: Granule) -> u32 {
        let page_shift = granule.page_shift();

        if self.flags.contains(VmaFlags::HUGETLB) && !self.flags.contains(VmaFlags::PFNMAP) {
            return self.huge_page_shift;
        }
        if !self.flags.contains(VmaFlags::PFNMAP) {
            return page_shift;
        }

        let pa = (self.pgoff << page_shift) + (hva - self.start);
        for shift in [granule.pud_shift(), granule.pmd_shift()] {
            let size = 1u64 << shift;

            if hva & (size - 1) == pa & (size - 1)
                && align_down!(hva, size) >= self.start
                && align_up!(hva, size) <= self.end
            {
                return shift;
            }
        }
        page_shift
    }
}

/// Host memory-management services consumed by the fault engine
pub trait HostMm: Send + Sync {
    /// VMA containing `hva`
    fn vma_lookup(&self, hva: Hva) -> Option<Vma>;

    /// First VMA intersecting `[start, end)`
    fn find_vma_intersection(&self, start: Hva, end: Hva) -> Option<Vma>;

    /// Fault in and take a reference on the page at `hva`
    ///
    /// May block. Returns the pfn and whether the host maps it writable.
    /// `HwPoison` for a poisoned page, `BadAddress` when nothing can back
    /// the address.
    fn gfn_to_pfn(&self, hva: Hva, write: bool) -> Result<(Pfn, bool)>;

    /// Size of the host stage-1 mapping of `hva`, `Again` if it vanished
    fn user_mapping_size(&self, hva: Hva) -> Result<u64>;

    /// Take an extra reference on `pfn`
    fn get_pfn(&self, pfn: Pfn);

    /// Drop a reference taken by [`HostMm::gfn_to_pfn`] or [`HostMm::get_pfn`]
    fn release_pfn_clean(&self, pfn: Pfn);

    /// Mark `pfn` dirty
    fn set_pfn_dirty(&self, pfn: Pfn);

    /// Mark `pfn` accessed
    fn set_pfn_accessed(&self, pfn: Pfn);

    /// Whether `pfn` lies outside the host's memory map
    fn is_device_pfn(&self, pfn: Pfn) -> bool;

    /// Long-term pin of the page at `hva` for writing
    fn pin_user_page(&self, hva: Hva) -> Result<Pfn>;

    /// Release a pin
    fn unpin_user_page(&self, pfn: Pfn);

    /// Whether `pfn` is anonymous or shmem memory
    fn page_is_swap_backed(&self, pfn: Pfn) -> bool;

    /// Charge or uncharge `pages` against the locked memory limit
    fn account_locked_vm(&self, pages: i64) -> Result<()>;

    /// Deliver SIGBUS for a poisoned page to the faulting process
    fn send_hwpoison_signal(&self, hva: Hva, lsb: u32);

    /// Whether `pfn` is online memory that can hold MTE tags
    fn page_is_online(&self, pfn: Pfn) -> bool;

    /// Whether the MTE tags of `pfn` have been initialised
    fn page_mte_tagged(&self, pfn: Pfn) -> bool;

    /// Clear the MTE tags of `pfn` and mark them initialised
    fn mte_clear_page_tags(&self, pfn: Pfn);
}

/// A borrowed host page, released clean on drop
pub struct PfnRef<'a> {
    host: &'a dyn HostMm,
    pfn: Pfn,
}

impl<'a> PfnRef<'a> {
    /// Borrow the page backing `hva`
    pub fn get(host: &'a dyn HostMm, hva: Hva, write: bool) -> Result<(Self, bool)> {
        let (pfn, writable) = host.gfn_to_pfn(hva, write)?;
        Ok((Self { host, pfn }, writable))
    }

    pub fn pfn(&self) -> Pfn {
        self.pfn
    }

    /// Move the reference to `pfn`
    ///
    /// Used to hand a tail page's reference to the head of its huge page.
    pub fn transfer(&mut self, pfn: Pfn) {
        if pfn == self.pfn {
            return;
        }
        self.host.get_pfn(pfn);
        self.host.release_pfn_clean(self.pfn);
        self.pfn = pfn;
    }
}

impl Drop for PfnRef<'_> {
    fn drop(&mut self) {
        self.host.release_pfn_clean(self.pfn);
    }
}

impl core::fmt::Debug for PfnRef<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PfnRef").field("pfn", &self.pfn).finish()
    }
}

/// A long-term pinned host page, charged to the locked memory limit
///
/// Dropping it unpins the page and uncharges it.
pub struct PinnedPage {
    host: Arc<dyn HostMm>,
    pfn: Pfn,
}

impl PinnedPage {
    /// Charge and pin the page at `hva`
    pub fn pin(host: &Arc<dyn HostMm>, hva: Hva) -> Result<Self> {
        host.account_locked_vm(1)?;

        match host.pin_user_page(hva) {
            Ok(pfn) => Ok(Self { host: host.clone(), pfn }),
            Err(err) => {
                let _ = host.account_locked_vm(-1);
                Err(err)
            }
        }
    }

    pub fn pfn(&self) -> Pfn {
        self.pfn
    }

    /// Give up ownership without unpinning
    pub fn leak(self) -> Pfn {
        let pfn = self.pfn;
        core::mem::forget(self);
        pfn
    }
}

impl Drop for PinnedPage {
    fn drop(&mut self) {
        self.host.unpin_user_page(self.pfn);
        let _ = self.host.account_locked_vm(-1);
    }
}

impl core::fmt::Debug for PinnedPage {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PinnedPage").field("pfn", &self.pfn).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::FakeHost;
    use test_case::test_case;

    const SZ_2M: u64 = 0x20_0000;

    fn pfnmap(start: Hva, end: Hva, pgoff: u64) -> Vma {
        Vma { start, end, pgoff, flags: VmaFlags::PFNMAP, huge_page_shift: 0 }
    }

    #[test_case(pfnmap(0x4000_0000, 0x4080_0000, 0x8_0000), 0x4020_1000, 21 ; "aligned pfnmap")]
    #[test_case(pfnmap(0x4000_0000, 0x4080_0000, 0x8_0001), 0x4020_1000, 12 ; "misaligned pfnmap")]
    #[test_case(pfnmap(0x4000_0000, 0x4010_0000, 0x8_0000), 0x4000_1000, 12 ; "pfnmap smaller than a block")]
    #[test_case(pfnmap(0x4000_0000, 0x8000_0000, 0x4_0000), 0x4020_1000, 30 ; "pfnmap spanning a pud")]
    fn test_vma_page_shift(vma: Vma, hva: Hva, shift: u32) {
        assert_eq!(vma.page_shift(hva, Granule::Size4K), shift);
    }

    #[test]
    fn test_hugetlb_and_anon_shift() {
        let huge = Vma { start: 0, end: SZ_2M * 4, pgoff: 0, flags: VmaFlags::HUGETLB, huge_page_shift: 21 };
        let anon = Vma { flags: VmaFlags::empty(), ..huge };

        assert_eq!(huge.page_shift(0x1000, Granule::Size4K), 21);
        assert_eq!(anon.page_shift(0x1000, Granule::Size4K), 12);
    }

    #[test]
    fn test_pfn_ref_releases_once() {
        let host = FakeHost::new();
        host.add_anon(0x1000_0000, 0x1000_0000 + SZ_2M, 0x800);

        {
            let (mut page, writable) = PfnRef::get(&*host, 0x1000_3000, true).unwrap();
            assert!(writable);
            assert_eq!(page.pfn(), 0x803);
            assert_eq!(host.refs(0x803), 1);

            page.transfer(0x800);
            assert_eq!(host.refs(0x803), 0);
            assert_eq!(host.refs(0x800), 1);
        }
        assert_eq!(host.refs(0x800), 0);
    }

    #[test]
    fn test_pinned_page_unpins_and_uncharges() {
        let host = FakeHost::new();
        let ops: Arc<dyn HostMm> = host.clone();
        host.add_anon(0x1000_0000, 0x1000_0000 + SZ_2M, 0x800);

        let page = PinnedPage::pin(&ops, 0x1000_1000).unwrap();
        assert_eq!(host.pins(0x801), 1);
        assert_eq!(host.locked_vm(), 1);

        drop(page);
        assert_eq!(host.pins(0x801), 0);
        assert_eq!(host.locked_vm(), 0);

        // Failed pins are uncharged
        assert!(PinnedPage::pin(&ops, 0x9000_0000).is_err());
        assert_eq!(host.locked_vm(), 0);
    }
}
