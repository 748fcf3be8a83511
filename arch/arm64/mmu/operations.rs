//! Stage-2 page table operations
//!
//! Map, unmap, coalesce and permission updates on a guest stage-2 table,
//! each expressed as a [`Visitor`] driven by the generic walker. Callers
//! hold the VM's MMU lock: exclusively for everything except permission
//! relaxation, which may run under the shared lock.
//!
//! Range operations are not transactional. A failure part way through a
//! range leaves the prefix already processed in its new state, and running
//! the same operation again over the whole range completes it.

use super::attrs::{self, Prot};
use super::stage2::{self, pte, s2, Pte, LAST_LEVEL};
use super::vttbr::S2Mmu;
use super::walker::{Pgtable, VisitCtx, Visitor, WalkFlags};
use crate::arch::arm64::hyp::HypCalls;
use crate::config::{CpuCaps, Granule, Stage2Flags};
use crate::core::mm::{MemCache, MmOps, PhysAddr, PteOps, VirtAddr};
use crate::core::sync::LockMode;
use crate::utils::{barrier, field_get, field_prep};
use crate::{Error, Result};
use alloc::sync::Arc;
use core::sync::atomic::{AtomicU64, Ordering};

/// A guest's stage-2 translation table
pub struct Stage2Pgtable {
    pgt: Pgtable,
    mmu: S2Mmu,
    flags: Stage2Flags,
    fwb: bool,
    pte_ops: Arc<dyn PteOps>,
    hyp: HypCalls,
}

impl Stage2Pgtable {
    /// Allocate the root of a new stage-2 table for `mmu`
    pub fn new(
        mut mmu: S2Mmu,
        mm_ops: Arc<dyn MmOps>,
        flags: Stage2Flags,
        pte_ops: Arc<dyn PteOps>,
        hyp: HypCalls,
        caps: &CpuCaps,
    ) -> Result<Self> {
        let vtcr = mmu.vtcr;
        let pgt = Pgtable::new(vtcr.ia_bits(), vtcr.start_level(), vtcr.granule(), mm_ops)?;

        mmu.pgd_phys = pgt.pgd_phys();
        let fwb = caps.stage2_fwb && !flags.contains(Stage2Flags::NOFWB);

        log::debug!(
            "stage-2 table: vmid {} ipa {} bits, start level {}, pgd {:#x}",
            mmu.vmid,
            pgt.ia_bits(),
            pgt.start_level(),
            mmu.pgd_phys
        );

        Ok(Self { pgt, mmu, flags, fwb, pte_ops, hyp })
    }

    /// The MMU context the table belongs to
    pub fn mmu(&self) -> &S2Mmu {
        &self.mmu
    }

    /// Input address size in bits
    pub fn ia_bits(&self) -> u32 {
        self.pgt.ia_bits()
    }

    /// First level of the walk
    pub fn start_level(&self) -> u32 {
        self.pgt.start_level()
    }

    /// Translation granule
    pub fn granule(&self) -> Granule {
        self.pgt.granule()
    }

    /// Whether stage-2 forces write-back cacheability
    pub fn has_fwb(&self) -> bool {
        self.fwb
    }

    /// Leaf entry translating `addr` and its level
    pub fn get_leaf(&self, addr: u64) -> Result<(Pte, u32)> {
        self.pgt.get_leaf(addr)
    }

    /// Protection of a leaf entry
    pub fn pte_prot(&self, pte: Pte) -> Prot {
        attrs::stage2_pte_prot(pte)
    }

    fn mm_ops(&self) -> &dyn MmOps {
        &**self.pgt.mm_ops()
    }

    fn is_counted(&self, pte: Pte, level: u32) -> bool {
        self.pte_ops.pte_is_counted(pte, level)
    }

    fn cacheable(&self, pte: Pte) -> bool {
        attrs::stage2_pte_cacheable(pte, self.fwb)
    }

    /// Invalidate the TLB entries for `addr`
    pub fn tlb_flush_vmid_ipa(&self, addr: u64, level: u32) -> Result<()> {
        self.hyp.tlb_flush_vmid_ipa(&self.mmu, addr, level)
    }

    /// Invalidate every TLB entry of this VM
    pub fn tlb_flush_vmid(&self) -> Result<()> {
        self.hyp.tlb_flush_vmid(&self.mmu)
    }

    /// Clear an entry and drop the reference it held on its table, if any
    ///
    /// Valid entries go through break-before-make.
    fn put_pte(&self, ctx: &VisitCtx<'_>) -> Result<()> {
        let old = ctx.load();
        let mut ret = Ok(());

        ctx.set(0);
        if stage2::pte_valid(old) {
            barrier::dsb_ishst();
            ret = self.tlb_flush_vmid_ipa(ctx.addr, ctx.level);
        }
        if self.is_counted(old, ctx.level) {
            ctx.mm_ops.put_page(ctx.ptep_addr());
        }
        ret
    }

    /// Map `[addr, addr + size)` to `phys` with `prot`
    ///
    /// Returns `Again` when every entry in the range already held exactly
    /// this mapping.
    pub fn map(&self, addr: u64, size: u64, phys: PhysAddr, prot: Prot, mc: Option<&mut MemCache>) -> Result<()> {
        if prot.contains(Prot::RANGEOP) {
            return Err(Error::InvalidArgument);
        }
        if self.flags.contains(Stage2Flags::IDMAP) && addr != phys {
            log::warn!("non-identity mapping {:#x} -> {:#x} in an identity table", addr, phys);
            return Err(Error::InvalidArgument);
        }

        let attr = attrs::stage2_set_prot_attr(prot, self.fwb)?;
        let mut data = MapVisitor {
            pgt: self,
            phys: Some(align_down!(phys, self.granule().page_size())),
            attr,
            annotation: 0,
            force_pte: self.pte_ops.force_pte(addr, addr.saturating_add(size), prot),
            memcache: mc,
            anchor: None,
            childp: 0,
            visited: false,
            changed: false,
        };

        let ret = self.pgt.walk(addr, size, &mut data);
        barrier::dsb_ishst();
        ret?;

        if data.visited && !data.changed {
            return Err(Error::Again);
        }
        Ok(())
    }

    /// Store `annotation` in the page entries of `[addr, addr + size)`
    ///
    /// Existing mappings in the range are removed. The annotation must not
    /// have the valid bit set.
    pub fn annotate(&self, addr: u64, size: u64, mc: Option<&mut MemCache>, annotation: Pte) -> Result<()> {
        if stage2::pte_valid(annotation) {
            return Err(Error::InvalidArgument);
        }

        let mut data = MapVisitor {
            pgt: self,
            phys: None,
            attr: 0,
            annotation,
            force_pte: true,
            memcache: mc,
            anchor: None,
            childp: 0,
            visited: false,
            changed: false,
        };

        let ret = self.pgt.walk(addr, size, &mut data);
        barrier::dsb_ishst();
        ret
    }

    /// Remove every mapping in `[addr, addr + size)`
    ///
    /// A block only partially covered by the range is removed entirely.
    pub fn unmap(&self, addr: u64, size: u64) -> Result<()> {
        self.pgt.walk(addr, size, &mut UnmapVisitor { pgt: self })
    }

    /// Fold page tables in `[addr, addr + size)` back into blocks
    pub fn reclaim_leaves(&self, addr: u64, size: u64) -> Result<()> {
        let page = self.granule().page_size();
        let mut data = ReclaimVisitor { pgt: self, start: align_down!(addr, page) };

        self.pgt.walk(addr, size, &mut data)
    }

    fn update_leaf_attrs(
        &self,
        addr: u64,
        size: u64,
        attr_set: u64,
        attr_clr: u64,
        mode: LockMode,
        flush_tlb: bool,
    ) -> Result<Option<(Pte, u32)>> {
        let mut data = AttrVisitor {
            pgt: self,
            attr_set: attr_set & pte::ATTR,
            attr_clr: attr_clr & pte::ATTR,
            shared: mode == LockMode::Shared,
            flush_tlb,
            last: None,
        };

        let ret = self.pgt.walk(addr, size, &mut data);
        barrier::dsb_ishst();
        ret?;
        Ok(data.last)
    }

    /// Remove write permission from every leaf in `[addr, addr + size)`
    ///
    /// The TLB is left for the caller to invalidate.
    pub fn wrprotect(&self, addr: u64, size: u64) -> Result<()> {
        self.update_leaf_attrs(addr, size, 0, s2::S2AP_W, LockMode::Exclusive, false)
            .map(|_| ())
    }

    /// Set the access flag of the leaf mapping `addr`, returning its old value
    pub fn mkyoung(&self, addr: u64) -> Result<Pte> {
        let last = self.update_leaf_attrs(addr, 1, s2::AF, 0, LockMode::Exclusive, false)?;
        Ok(last.map_or(0, |(pte, _)| pte))
    }

    /// Clear the access flag of the leaf mapping `addr`, returning its old value
    ///
    /// No TLB invalidation: a stale young entry only delays aging.
    pub fn mkold(&self, addr: u64) -> Result<Pte> {
        let last = self.update_leaf_attrs(addr, 1, 0, s2::AF, LockMode::Exclusive, false)?;
        Ok(last.map_or(0, |(pte, _)| pte))
    }

    /// Whether the leaf mapping `addr` has its access flag set
    pub fn is_young(&self, addr: u64) -> Result<bool> {
        let last = self.update_leaf_attrs(addr, 1, 0, 0, LockMode::Exclusive, false)?;
        Ok(last.map_or(false, |(pte, _)| pte & s2::AF != 0))
    }

    /// Add the permissions in `prot` to the leaves of `[addr, addr + size)`
    ///
    /// Permissions are never removed. Software bits are rejected. Under the
    /// shared lock a concurrent update of the same entry yields `Again`.
    pub fn relax_perms(&self, addr: u64, prot: Prot, size: u64, mode: LockMode) -> Result<()> {
        if prot.intersects(Prot::SW) {
            return Err(Error::InvalidArgument);
        }

        let mut set = 0;
        let mut clr = 0;
        if prot.contains(Prot::R) {
            set |= s2::S2AP_R;
        }
        if prot.contains(Prot::W) {
            set |= s2::S2AP_W;
        }
        if prot.contains(Prot::X) {
            clr |= s2::XN;
        }

        self.update_leaf_attrs(addr, size, set, clr, mode, true).map(|_| ())
    }

    /// Clean cacheable leaves of `[addr, addr + size)` to the point of coherency
    pub fn flush(&self, addr: u64, size: u64) -> Result<()> {
        if self.fwb {
            return Ok(());
        }
        self.pgt.walk(addr, size, &mut FlushVisitor { pgt: self })
    }

    /// Free every table page and drop every reference the table holds
    ///
    /// Performs no TLB maintenance.
    fn destroy_tables(&mut self) {
        let size = 1u64 << self.pgt.ia_bits();

        if !self.pgt.has_root() {
            return;
        }
        if let Err(err) = self.pgt.walk(0, size, &mut FreeVisitor { pgt: self }) {
            log::error!("stage-2 teardown walk failed: {}", err);
        }
        self.pgt.free_pgd();
        self.mmu.pgd_phys = 0;
    }

    /// Tear the table down
    pub fn destroy(mut self) {
        self.destroy_tables();
    }
}

impl Drop for Stage2Pgtable {
    fn drop(&mut self) {
        self.destroy_tables();
    }
}

impl core::fmt::Debug for Stage2Pgtable {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Stage2Pgtable")
            .field("pgt", &self.pgt)
            .field("mmu", &self.mmu)
            .field("flags", &self.flags)
            .field("fwb", &self.fwb)
            .finish()
    }
}

struct MapVisitor<'a, 'm> {
    pgt: &'a Stage2Pgtable,
    /// Next output address, `None` when installing an annotation
    phys: Option<PhysAddr>,
    attr: u64,
    annotation: Pte,
    force_pte: bool,
    memcache: Option<&'m mut MemCache>,
    /// Table entry being replaced by a block once its children are gone
    anchor: Option<VirtAddr>,
    childp: VirtAddr,
    visited: bool,
    changed: bool,
}

impl MapVisitor<'_, '_> {
    fn leaf_mapping_allowed(&self, addr: u64, end: u64, level: u32) -> bool {
        if self.force_pte && level < LAST_LEVEL {
            return false;
        }
        stage2::block_mapping_supported(addr, end, self.phys, level, self.pgt.granule())
    }

    /// Install a leaf, `Ok(false)` if this level is too coarse for the range
    fn try_leaf(&mut self, ctx: &VisitCtx<'_>) -> Result<bool> {
        let pgt = self.pgt;
        let level = ctx.level;

        if !self.leaf_mapping_allowed(ctx.addr, ctx.end, level) {
            return Ok(false);
        }

        let granule = ctx.granule_size();
        let new = match self.phys.as_mut() {
            Some(pa) => {
                let new = stage2::init_valid_leaf(*pa, self.attr, level, ctx.granule);
                *pa += granule;
                new
            }
            None => self.annotation,
        };
        let old = ctx.load();
        self.visited = true;

        if old == new {
            return Ok(true);
        }

        // Same output and memory type: update in place, no break-before-make
        let diff = old ^ new;
        if stage2::pte_valid(old) && stage2::pte_valid(new) && diff & !(s2::PERMS | s2::AF | pte::ATTR_HI_SW) == 0 {
            if attrs::stage2_pte_executable(new) && !attrs::stage2_pte_executable(old) {
                ctx.mm_ops.icache_inval_pou(ctx.follow(new), granule as usize);
            }
            ctx.set(new);
            if diff & s2::PERMS != 0 {
                barrier::dsb_ishst();
                pgt.tlb_flush_vmid_ipa(ctx.addr, level)?;
            }
            self.changed = true;
            return Ok(true);
        }

        if pgt.is_counted(old, level) {
            pgt.put_pte(ctx)?;
        }

        if stage2::pte_valid(new) {
            if !pgt.fwb && pgt.cacheable(new) {
                ctx.mm_ops.dcache_clean_inval_poc(ctx.follow(new), granule as usize);
            }
            if attrs::stage2_pte_executable(new) {
                ctx.mm_ops.icache_inval_pou(ctx.follow(new), granule as usize);
            }
        }

        ctx.set(new);
        if pgt.is_counted(new, level) {
            ctx.mm_ops.get_page(ctx.ptep_addr());
        }
        self.changed = true;
        Ok(true)
    }

    /// Replace a leaf that is too coarse with a table
    ///
    /// A valid block is copied into the new table so that the parts of it
    /// outside the mapped range stay mapped.
    fn split(&mut self, ctx: &VisitCtx<'_>) -> Result<()> {
        let pgt = self.pgt;
        let level = ctx.level;

        if level == LAST_LEVEL {
            log::warn!("no page mapping possible at {:#x}", ctx.addr);
            return Err(Error::InvalidArgument);
        }

        let mc = self.memcache.as_deref_mut().ok_or(Error::OutOfMemory)?;
        let childp = ctx.mm_ops.zalloc_page(mc).ok_or(Error::OutOfMemory)?;
        let old = ctx.load();

        if pgt.is_counted(old, level) {
            if stage2::pte_valid(old) {
                let child_level = level + 1;
                let size = ctx.granule.granule_size(child_level);
                let pa = stage2::pte_to_phys(old, ctx.granule);
                // SAFETY: freshly allocated table page owned by this walk
                let child = unsafe { ctx.table(childp) };

                for (i, entry) in child.iter().enumerate() {
                    let pte = stage2::init_valid_leaf(pa + i as u64 * size, stage2::pte_attr(old), child_level, ctx.granule);
                    entry.store(pte, Ordering::Relaxed);
                    ctx.mm_ops.get_page(childp);
                }
            }
            pgt.put_pte(ctx)?;
        }

        ctx.set(stage2::init_table(ctx.mm_ops.virt_to_phys(childp), ctx.granule));
        ctx.mm_ops.get_page(ctx.ptep_addr());
        self.changed = true;
        Ok(())
    }
}

impl Visitor for MapVisitor<'_, '_> {
    fn flags(&self) -> WalkFlags {
        WalkFlags::TABLE_PRE | WalkFlags::LEAF | WalkFlags::TABLE_POST
    }

    fn table_pre(&mut self, ctx: &VisitCtx<'_>) -> Result<()> {
        if self.anchor.is_some() {
            return Ok(());
        }
        if !self.leaf_mapping_allowed(ctx.addr, ctx.end, ctx.level) {
            return Ok(());
        }

        // The whole table is about to become one block: detach it now and
        // drop its children on the way down.
        self.childp = ctx.follow(ctx.old);
        ctx.set(0);
        barrier::dsb_ishst();
        self.pgt.tlb_flush_vmid()?;
        self.anchor = Some(ctx.ptep_addr());
        Ok(())
    }

    fn leaf(&mut self, ctx: &VisitCtx<'_>) -> Result<()> {
        if self.anchor.is_some() {
            if self.pgt.is_counted(ctx.old, ctx.level) {
                ctx.mm_ops.put_page(ctx.ptep_addr());
            }
            return Ok(());
        }

        if self.try_leaf(ctx)? {
            return Ok(());
        }
        self.split(ctx)
    }

    fn table_post(&mut self, ctx: &VisitCtx<'_>) -> Result<()> {
        let Some(anchor) = self.anchor else {
            return Ok(());
        };

        let mut ret = Ok(());
        let childp = if anchor == ctx.ptep_addr() {
            self.anchor = None;
            let childp = core::mem::take(&mut self.childp);
            ret = match self.try_leaf(ctx) {
                Ok(true) => Ok(()),
                Ok(false) => Err(Error::InvalidArgument),
                Err(err) => Err(err),
            };
            childp
        } else {
            ctx.follow(ctx.old)
        };

        ctx.mm_ops.put_page(childp);
        ctx.mm_ops.put_page(ctx.ptep_addr());
        ret
    }
}

struct UnmapVisitor<'a> {
    pgt: &'a Stage2Pgtable,
}

impl Visitor for UnmapVisitor<'_> {
    fn flags(&self) -> WalkFlags {
        WalkFlags::LEAF | WalkFlags::TABLE_POST
    }

    fn leaf(&mut self, ctx: &VisitCtx<'_>) -> Result<()> {
        self.unmap_entry(ctx)
    }

    fn table_post(&mut self, ctx: &VisitCtx<'_>) -> Result<()> {
        self.unmap_entry(ctx)
    }
}

impl UnmapVisitor<'_> {
    fn unmap_entry(&mut self, ctx: &VisitCtx<'_>) -> Result<()> {
        let pgt = self.pgt;
        let pte = ctx.old;
        let mut childp = None;
        let mut need_flush = false;

        if !stage2::pte_valid(pte) {
            if pgt.is_counted(pte, ctx.level) {
                ctx.set(0);
                ctx.mm_ops.put_page(ctx.ptep_addr());
            }
            return Ok(());
        }

        if stage2::pte_is_table(pte, ctx.level) {
            let child = ctx.follow(pte);

            if ctx.mm_ops.page_count(child) != 1 {
                return Ok(());
            }
            childp = Some(child);
        } else if pgt.cacheable(pte) {
            need_flush = !pgt.fwb;
        }

        let ret = pgt.put_pte(ctx);

        if need_flush {
            ctx.mm_ops.dcache_clean_inval_poc(ctx.follow(pte), ctx.granule_size() as usize);
        }
        if let Some(child) = childp {
            ctx.mm_ops.put_page(child);
        }
        ret
    }
}

struct ReclaimVisitor<'a> {
    pgt: &'a Stage2Pgtable,
    start: u64,
}

/// Union of the stage-2 permissions of a set of leaves
#[derive(Default)]
struct PermUnion {
    read: bool,
    write: bool,
    el0_exec: bool,
    el1_exec: bool,
    young: bool,
}

impl PermUnion {
    fn add(&mut self, pte: Pte) {
        let xn = field_get(s2::XN, pte);

        self.read |= pte & s2::S2AP_R != 0;
        self.write |= pte & s2::S2AP_W != 0;
        self.el0_exec |= xn == 0 || xn == s2::XN_PXN;
        self.el1_exec |= xn == 0 || xn == s2::XN_UXN;
        self.young |= pte & s2::AF != 0;
    }

    fn attr(&self) -> u64 {
        let xn = match (self.el0_exec, self.el1_exec) {
            (true, true) => 0,
            (true, false) => s2::XN_PXN,
            (false, true) => s2::XN_UXN,
            (false, false) => s2::XN_XN,
        };
        let mut attr = field_prep(s2::XN, xn);

        if self.read {
            attr |= s2::S2AP_R;
        }
        if self.write {
            attr |= s2::S2AP_W;
        }
        if self.young {
            attr |= s2::AF;
        }
        attr
    }
}

impl ReclaimVisitor<'_> {
    /// Block attributes for a table whose leaves form one contiguous run
    fn coalesced_attr(&self, ctx: &VisitCtx<'_>, child: &[AtomicU64], base_pa: PhysAddr) -> Option<u64> {
        let child_level = ctx.level + 1;
        let size = ctx.granule.granule_size(child_level);
        let mask = !(s2::PERMS | s2::AF);
        let first = child[0].load(Ordering::Acquire);
        let mut perms = PermUnion::default();

        for (i, entry) in child.iter().enumerate() {
            let pte = entry.load(Ordering::Acquire);

            if !stage2::pte_valid(pte) || stage2::pte_is_table(pte, child_level) {
                return None;
            }
            if stage2::pte_to_phys(pte, ctx.granule) != base_pa + i as u64 * size {
                return None;
            }
            if stage2::pte_attr(pte) & mask != stage2::pte_attr(first) & mask {
                return None;
            }
            perms.add(pte);
        }

        Some((stage2::pte_attr(first) & mask) | perms.attr())
    }
}

impl Visitor for ReclaimVisitor<'_> {
    fn flags(&self) -> WalkFlags {
        WalkFlags::TABLE_POST
    }

    fn table_post(&mut self, ctx: &VisitCtx<'_>) -> Result<()> {
        let pgt = self.pgt;
        let childp = ctx.follow(ctx.old);

        // Nothing left below this entry
        if ctx.mm_ops.page_count(childp) == 1 {
            let ret = pgt.put_pte(ctx);
            ctx.mm_ops.put_page(childp);
            return ret;
        }

        if !ctx.granule.level_supports_block(ctx.level) {
            return Ok(());
        }

        let size = ctx.granule_size();
        let base = align_down!(ctx.addr, size);
        if base < self.start || base + size > ctx.end {
            return Ok(());
        }

        // SAFETY: valid table entry, the table is live under the MMU lock
        let child = unsafe { ctx.table(childp) };
        let base_pa = stage2::pte_to_phys(child[0].load(Ordering::Acquire), ctx.granule);
        if !is_aligned!(base_pa, size) {
            return Ok(());
        }
        let Some(attr) = self.coalesced_attr(ctx, child, base_pa) else {
            return Ok(());
        };
        if pgt.pte_ops.force_pte(base, base + size, attrs::stage2_pte_prot(attr | pte::VALID)) {
            return Ok(());
        }

        ctx.set(0);
        barrier::dsb_ishst();
        let ret = pgt.tlb_flush_vmid();

        for entry in child {
            if pgt.is_counted(entry.load(Ordering::Relaxed), ctx.level + 1) {
                ctx.mm_ops.put_page(childp);
            }
        }
        ctx.mm_ops.put_page(childp);

        ctx.set(stage2::init_valid_leaf(base_pa, attr, ctx.level, ctx.granule));
        log::debug!("coalesced {:#x}..{:#x} into a level {} block", base, base + size, ctx.level);
        ret
    }
}

struct AttrVisitor<'a> {
    pgt: &'a Stage2Pgtable,
    attr_set: u64,
    attr_clr: u64,
    shared: bool,
    flush_tlb: bool,
    /// Old value and level of the last leaf visited
    last: Option<(Pte, u32)>,
}

impl Visitor for AttrVisitor<'_> {
    fn flags(&self) -> WalkFlags {
        if self.shared {
            WalkFlags::LEAF | WalkFlags::SHARED
        } else {
            WalkFlags::LEAF
        }
    }

    fn leaf(&mut self, ctx: &VisitCtx<'_>) -> Result<()> {
        let old = ctx.old;

        if !stage2::pte_valid(old) {
            return Ok(());
        }

        self.last = Some((old, ctx.level));
        let new = (old & !self.attr_clr) | self.attr_set;
        if new == old {
            return Ok(());
        }

        if attrs::stage2_pte_executable(new) && !attrs::stage2_pte_executable(old) {
            ctx.mm_ops.icache_inval_pou(ctx.follow(new), ctx.granule_size() as usize);
        }

        if ctx.flags.contains(WalkFlags::SHARED) {
            // Another vCPU may be updating the same entry
            if ctx.ptep.compare_exchange(old, new, Ordering::AcqRel, Ordering::Acquire).is_err() {
                return Err(Error::Again);
            }
        } else {
            ctx.set(new);
        }

        if self.flush_tlb {
            barrier::dsb_ishst();
            self.pgt.tlb_flush_vmid_ipa(ctx.addr, ctx.level)?;
        }
        Ok(())
    }
}

struct FlushVisitor<'a> {
    pgt: &'a Stage2Pgtable,
}

impl Visitor for FlushVisitor<'_> {
    fn flags(&self) -> WalkFlags {
        WalkFlags::LEAF
    }

    fn leaf(&mut self, ctx: &VisitCtx<'_>) -> Result<()> {
        if stage2::pte_valid(ctx.old) && self.pgt.cacheable(ctx.old) {
            ctx.mm_ops.dcache_clean_inval_poc(ctx.follow(ctx.old), ctx.granule_size() as usize);
        }
        Ok(())
    }
}

struct FreeVisitor<'a> {
    pgt: &'a Stage2Pgtable,
}

impl Visitor for FreeVisitor<'_> {
    fn flags(&self) -> WalkFlags {
        WalkFlags::LEAF | WalkFlags::TABLE_POST
    }

    fn leaf(&mut self, ctx: &VisitCtx<'_>) -> Result<()> {
        self.free_entry(ctx);
        Ok(())
    }

    fn table_post(&mut self, ctx: &VisitCtx<'_>) -> Result<()> {
        self.free_entry(ctx);
        Ok(())
    }
}

impl FreeVisitor<'_> {
    fn free_entry(&mut self, ctx: &VisitCtx<'_>) {
        let pte = ctx.old;

        if !self.pgt.is_counted(pte, ctx.level) {
            return;
        }
        ctx.mm_ops.put_page(ctx.ptep_addr());
        if stage2::pte_is_table(pte, ctx.level) {
            ctx.mm_ops.put_page(ctx.follow(pte));
        }
    }
}
