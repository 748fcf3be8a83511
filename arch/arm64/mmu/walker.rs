//! Generic page-table walker
//!
//! Depth-first traversal of a stage-2 table over an input address range.
//! The walker only knows the descriptor format: what happens at each entry
//! is decided by a [`Visitor`], which may be called before descending into
//! a table, at each leaf (including invalid entries), and after a table's
//! children have been visited.

use super::stage2::{self, Pte, LAST_LEVEL};
use crate::config::Granule;
use crate::core::mm::{MmOps, PhysAddr, VirtAddr};
use crate::{Error, Result};
use alloc::sync::Arc;
use bitflags::bitflags;
use core::sync::atomic::{AtomicU64, Ordering};

bitflags! {
    /// Walk visitation flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct WalkFlags: u32 {
        /// Visit leaf entries, including invalid ones
        const LEAF = 1 << 0;
        /// Visit table entries before their children
        const TABLE_PRE = 1 << 1;
        /// Visit table entries after their children
        const TABLE_POST = 1 << 2;
        /// The walk runs under the shared MMU lock
        const SHARED = 1 << 3;
    }
}

/// One visited entry
pub struct VisitCtx<'a> {
    /// The entry
    pub ptep: &'a AtomicU64,
    /// Its value when the callback was invoked
    pub old: Pte,
    /// First input address the entry covers within the walk
    pub addr: u64,
    /// End of the walk
    pub end: u64,
    /// Level of the table holding the entry
    pub level: u32,
    /// Which callback this is
    pub visit: WalkFlags,
    /// Flags of the whole walk
    pub flags: WalkFlags,
    /// Memory-management callbacks of the table
    pub mm_ops: &'a dyn MmOps,
    /// Translation granule of the table
    pub granule: Granule,
}

impl VisitCtx<'_> {
    /// Linear map address of the entry, for refcounting its table page
    pub fn ptep_addr(&self) -> VirtAddr {
        self.ptep as *const AtomicU64 as VirtAddr
    }

    /// Bytes covered by an entry at this level
    pub fn granule_size(&self) -> u64 {
        self.granule.granule_size(self.level)
    }

    /// Linear map address of the table or page `pte` points to
    pub fn follow(&self, pte: Pte) -> VirtAddr {
        self.mm_ops.phys_to_virt(stage2::pte_to_phys(pte, self.granule))
    }

    /// Entries of the table at `table_va`
    ///
    /// # Safety
    /// `table_va` must be a live table page of this walk's table.
    pub unsafe fn table(&self, table_va: VirtAddr) -> &[AtomicU64] {
        // SAFETY: table pages are page aligned, hold ptrs_per_table
        // descriptors and are not freed while the MMU lock is held.
        unsafe { table_entries(table_va, self.granule) }
    }

    /// Current value of the entry
    pub fn load(&self) -> Pte {
        self.ptep.load(Ordering::Acquire)
    }

    /// Publish a new value for the entry
    pub fn set(&self, pte: Pte) {
        self.ptep.store(pte, Ordering::Release);
    }
}

/// Per-entry callbacks of a walk
pub trait Visitor {
    /// Which callbacks to invoke
    fn flags(&self) -> WalkFlags;

    /// Called for each leaf or invalid entry
    fn leaf(&mut self, _ctx: &VisitCtx<'_>) -> Result<()> {
        Ok(())
    }

    /// Called for each table entry before its children
    fn table_pre(&mut self, _ctx: &VisitCtx<'_>) -> Result<()> {
        Ok(())
    }

    /// Called for each table entry after its children
    fn table_post(&mut self, _ctx: &VisitCtx<'_>) -> Result<()> {
        Ok(())
    }
}

/// Descriptors of the table page at `va`
///
/// # Safety
/// `va` must point to a live, page aligned table page.
unsafe fn table_entries<'a>(va: VirtAddr, granule: Granule) -> &'a [AtomicU64] {
    // SAFETY: guaranteed by the caller
    unsafe { core::slice::from_raw_parts(va as *const AtomicU64, granule.ptrs_per_table()) }
}

struct WalkData<'v> {
    addr: u64,
    end: u64,
    flags: WalkFlags,
    visitor: &'v mut dyn Visitor,
}

/// A translation table
pub struct Pgtable {
    ia_bits: u32,
    start_level: u32,
    granule: Granule,
    pgd: VirtAddr,
    mm_ops: Arc<dyn MmOps>,
}

impl Pgtable {
    /// Allocate the (possibly concatenated) root of a new table
    pub fn new(ia_bits: u32, start_level: u32, granule: Granule, mm_ops: Arc<dyn MmOps>) -> Result<Self> {
        let size = stage2::pgd_pages(ia_bits, start_level, granule) * granule.page_size() as usize;
        let pgd = mm_ops.zalloc_pages_exact(size).ok_or(Error::OutOfMemory)?;

        Ok(Self { ia_bits, start_level, granule, pgd, mm_ops })
    }

    /// Input address size in bits
    pub fn ia_bits(&self) -> u32 {
        self.ia_bits
    }

    /// First level of the walk
    pub fn start_level(&self) -> u32 {
        self.start_level
    }

    /// Translation granule
    pub fn granule(&self) -> Granule {
        self.granule
    }

    /// Memory-management callbacks
    pub fn mm_ops(&self) -> &Arc<dyn MmOps> {
        &self.mm_ops
    }

    /// Size of the root in bytes
    pub fn pgd_size(&self) -> usize {
        stage2::pgd_pages(self.ia_bits, self.start_level, self.granule) * self.granule.page_size() as usize
    }

    /// Physical address of the root
    pub fn pgd_phys(&self) -> PhysAddr {
        self.mm_ops.virt_to_phys(self.pgd)
    }

    /// Whether the root is still allocated
    pub fn has_root(&self) -> bool {
        self.pgd != 0
    }

    /// Release the root after every child has been freed
    pub(crate) fn free_pgd(&mut self) {
        if self.pgd != 0 {
            self.mm_ops.free_pages_exact(self.pgd, self.pgd_size());
            self.pgd = 0;
        }
    }

    /// Walk `[addr, addr + size)`, rounded out to pages
    pub fn walk(&self, addr: u64, size: u64, visitor: &mut dyn Visitor) -> Result<()> {
        let page = self.granule.page_size();
        let start = align_down!(addr, page);
        let end = start.checked_add(size).map(|e| align_up!(e, page)).ok_or(Error::OutOfRange)?;
        let flags = visitor.flags();

        let mut data = WalkData { addr: start, end, flags, visitor };
        self.walk_root(&mut data)
    }

    fn walk_root(&self, data: &mut WalkData<'_>) -> Result<()> {
        let limit = 1u64 << self.ia_bits;

        if data.addr > limit || data.end > limit {
            return Err(Error::OutOfRange);
        }
        if self.pgd == 0 {
            log::error!("stage-2 walk on a table without a root");
            return Err(Error::NotInitialized);
        }

        let page = self.granule.page_size() as usize;
        let mut idx = stage2::pgd_index(data.addr, self.ia_bits, self.start_level, self.granule);

        while data.addr < data.end {
            // SAFETY: idx stays below pgd_pages while addr < 2^ia_bits
            let table = unsafe { table_entries(self.pgd + idx * page, self.granule) };
            self.walk_ptes(data, table, self.start_level)?;
            idx += 1;
        }
        Ok(())
    }

    fn walk_ptes(&self, data: &mut WalkData<'_>, table: &[AtomicU64], level: u32) -> Result<()> {
        let mut idx = stage2::pte_index(data.addr, level, self.granule);

        while idx < table.len() && data.addr < data.end {
            self.visit(data, &table[idx], level)?;
            idx += 1;
        }
        Ok(())
    }

    fn callback(&self, data: &mut WalkData<'_>, ptep: &AtomicU64, addr: u64, level: u32, visit: WalkFlags) -> Result<()> {
        let ctx = VisitCtx {
            ptep,
            old: ptep.load(Ordering::Acquire),
            addr,
            end: data.end,
            level,
            visit,
            flags: data.flags,
            mm_ops: &*self.mm_ops,
            granule: self.granule,
        };

        #[cfg(feature = "verbose")]
        log::trace!("visit {:?} addr {:#x} level {} pte {:#x}", visit, addr, level, ctx.old);

        if visit == WalkFlags::TABLE_PRE {
            data.visitor.table_pre(&ctx)
        } else if visit == WalkFlags::TABLE_POST {
            data.visitor.table_post(&ctx)
        } else {
            data.visitor.leaf(&ctx)
        }
    }

    fn visit(&self, data: &mut WalkData<'_>, ptep: &AtomicU64, level: u32) -> Result<()> {
        let addr = data.addr;
        let flags = data.flags;
        let mut pte = ptep.load(Ordering::Acquire);
        let mut table = stage2::pte_is_table(pte, level);

        if table && flags.contains(WalkFlags::TABLE_PRE) {
            self.callback(data, ptep, addr, level, WalkFlags::TABLE_PRE)?;
        }

        if !table && flags.contains(WalkFlags::LEAF) {
            self.callback(data, ptep, addr, level, WalkFlags::LEAF)?;
            pte = ptep.load(Ordering::Acquire);
            table = stage2::pte_is_table(pte, level);
        }

        if !table {
            let size = self.granule.granule_size(level);
            data.addr = align_down!(data.addr, size) + size;
            return Ok(());
        }

        // The pre-order callback may have cleared the entry; the children
        // are still reachable through the value read before it ran.
        let child = self.mm_ops.phys_to_virt(stage2::pte_to_phys(pte, self.granule));
        // SAFETY: a valid table descriptor points to a live table page
        let child = unsafe { table_entries(child, self.granule) };
        self.walk_ptes(data, child, level + 1)?;

        if flags.contains(WalkFlags::TABLE_POST) {
            self.callback(data, ptep, addr, level, WalkFlags::TABLE_POST)?;
        }
        Ok(())
    }

    /// Leaf entry translating `addr` and its level
    pub fn get_leaf(&self, addr: u64) -> Result<(Pte, u32)> {
        let mut visitor = LeafWalker { pte: 0, level: LAST_LEVEL };

        self.walk(addr, self.granule.page_size(), &mut visitor)?;
        Ok((visitor.pte, visitor.level))
    }
}

impl core::fmt::Debug for Pgtable {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Pgtable")
            .field("ia_bits", &self.ia_bits)
            .field("start_level", &self.start_level)
            .field("granule", &self.granule)
            .field("pgd", &format_args!("{:#x}", self.pgd))
            .finish()
    }
}

struct LeafWalker {
    pte: Pte,
    level: u32,
}

impl Visitor for LeafWalker {
    fn flags(&self) -> WalkFlags {
        WalkFlags::LEAF
    }

    fn leaf(&mut self, ctx: &VisitCtx<'_>) -> Result<()> {
        self.pte = ctx.old;
        self.level = ctx.level;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::FakeMm;
    use alloc::vec::Vec;

    struct Recorder {
        flags: WalkFlags,
        seen: Vec<(WalkFlags, u64, u32)>,
    }

    impl Visitor for Recorder {
        fn flags(&self) -> WalkFlags {
            self.flags
        }

        fn leaf(&mut self, ctx: &VisitCtx<'_>) -> Result<()> {
            self.seen.push((ctx.visit, ctx.addr, ctx.level));
            Ok(())
        }

        fn table_pre(&mut self, ctx: &VisitCtx<'_>) -> Result<()> {
            self.seen.push((ctx.visit, ctx.addr, ctx.level));
            Ok(())
        }

        fn table_post(&mut self, ctx: &VisitCtx<'_>) -> Result<()> {
            self.seen.push((ctx.visit, ctx.addr, ctx.level));
            Ok(())
        }
    }

    fn new_table(mm: &Arc<FakeMm>) -> Pgtable {
        let ops: Arc<dyn MmOps> = mm.clone();
        Pgtable::new(40, 1, Granule::Size4K, ops).unwrap()
    }

    #[test]
    fn test_walk_empty_table_visits_root_leaves() {
        let mm = Arc::new(FakeMm::new());
        let pgt = new_table(&mm);
        let mut rec = Recorder { flags: WalkFlags::LEAF | WalkFlags::TABLE_POST, seen: Vec::new() };

        // Two 1GB entries of the second concatenated root page
        pgt.walk(0x80_0000_0000, 0x8000_0000, &mut rec).unwrap();

        assert_eq!(rec.seen.len(), 2);
        assert_eq!(rec.seen[0], (WalkFlags::LEAF, 0x80_0000_0000, 1));
        assert_eq!(rec.seen[1], (WalkFlags::LEAF, 0x80_4000_0000, 1));

        let mut pgt = pgt;
        pgt.free_pgd();
        assert_eq!(mm.live_pages(), 0);
    }

    #[test]
    fn test_walk_descends_tables_in_order() {
        let mm = Arc::new(FakeMm::new());
        let pgt = new_table(&mm);
        let child = mm.alloc_zeroed_page().unwrap();

        // Hook a level 2 table under the first root entry by hand
        let root = unsafe { table_entries(pgt.pgd, Granule::Size4K) };
        root[0].store(stage2::init_table(mm.virt_to_phys(child), Granule::Size4K), Ordering::Relaxed);

        let mut rec = Recorder {
            flags: WalkFlags::LEAF | WalkFlags::TABLE_PRE | WalkFlags::TABLE_POST,
            seen: Vec::new(),
        };
        pgt.walk(0x1000, 0x40_0000, &mut rec).unwrap();

        assert_eq!(rec.seen.first(), Some(&(WalkFlags::TABLE_PRE, 0x1000, 1)));
        assert_eq!(rec.seen[1], (WalkFlags::LEAF, 0x1000, 2));
        assert_eq!(rec.seen[2], (WalkFlags::LEAF, 0x20_0000, 2));
        assert_eq!(rec.seen[3], (WalkFlags::LEAF, 0x40_0000, 2));
        assert_eq!(rec.seen[4], (WalkFlags::TABLE_POST, 0x1000, 1));
        assert_eq!(rec.seen.len(), 5);

        root[0].store(0, Ordering::Relaxed);
        mm.put_page(child);
        let mut pgt = pgt;
        pgt.free_pgd();
        assert_eq!(mm.live_pages(), 0);
    }

    #[test]
    fn test_walk_range_checks() {
        let mm = Arc::new(FakeMm::new());
        let mut pgt = new_table(&mm);
        let mut rec = Recorder { flags: WalkFlags::LEAF, seen: Vec::new() };

        assert_eq!(pgt.walk(1 << 40, 0x1000, &mut rec), Err(Error::OutOfRange));
        assert_eq!(pgt.walk((1 << 40) - 0x1000, 0x2000, &mut rec), Err(Error::OutOfRange));

        pgt.free_pgd();
        assert_eq!(pgt.walk(0, 0x1000, &mut rec), Err(Error::NotInitialized));
        assert_eq!(pgt.get_leaf(0), Err(Error::NotInitialized));
    }

    #[test]
    fn test_visitor_error_aborts_walk() {
        struct FailSecond(u32);

        impl Visitor for FailSecond {
            fn flags(&self) -> WalkFlags {
                WalkFlags::LEAF
            }

            fn leaf(&mut self, _ctx: &VisitCtx<'_>) -> Result<()> {
                self.0 += 1;
                if self.0 == 2 {
                    return Err(Error::OutOfMemory);
                }
                Ok(())
            }
        }

        let mm = Arc::new(FakeMm::new());
        let mut pgt = new_table(&mm);
        let mut visitor = FailSecond(0);

        assert_eq!(pgt.walk(0, 4 << 30, &mut visitor), Err(Error::OutOfMemory));
        assert_eq!(visitor.0, 2);
        pgt.free_pgd();
    }
}
