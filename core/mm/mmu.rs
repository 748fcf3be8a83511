//! VM-level stage-2 MMU
//!
//! Owns one VM's stage-2 table together with the state the fault engine
//! and the host's memory notifiers synchronise on: the MMU lock, the
//! invalidation sequence, the memslots and, in protected mode, the ledger
//! of pages donated to the hypervisor.
//!
//! Lock order is memslots, then the MMU lock.

use super::host::{HostMm, VmaFlags};
use super::memslot::{Memslot, Memslots};
use super::pkvm::{PinnedPages, SharedPfns};
use super::{GfnRange, MemCache, MmOps, Pfn, PhysAddr, Stage2PteOps};
use crate::arch::arm64::hyp::HypCalls;
use crate::arch::arm64::mmu::stage2::{pte_valid, s2};
use crate::arch::arm64::mmu::{Prot, S2Mmu, Stage2Pgtable, Vtcr};
use crate::config::{CpuCaps, Granule, Stage2Config};
use crate::core::sync::{cond_resched_write, RwLock, RwLockReadGuard, RwLockWriteGuard};
use crate::{Error, Result};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

/// State guarded by the MMU lock
#[derive(Debug)]
pub struct MmuState {
    /// Host-managed stage-2 table, absent in protected mode and after teardown
    pub pgt: Option<Stage2Pgtable>,
    /// Pages donated to the hypervisor, protected mode only
    pub pinned: PinnedPages,
}

pub(super) type StateGuard<'a> = RwLockWriteGuard<'a, MmuState>;

/// Stage-2 memory management of one VM
pub struct VmMmu {
    pub(super) config: Stage2Config,
    pub(super) caps: CpuCaps,
    pub(super) ipa_bits: u32,
    pub(super) mmu: S2Mmu,
    pub(super) mm_ops: Arc<dyn MmOps>,
    pub(super) hyp: HypCalls,
    pub(super) host: Arc<dyn HostMm>,
    /// The MMU lock
    pub(super) state: RwLock<MmuState>,
    pub(super) memslots: RwLock<Memslots>,
    invalidate_seq: AtomicU64,
    invalidate_in_progress: AtomicU64,
    pkvm_handle: AtomicU64,
    pub(super) protected_hyp_mem: AtomicU64,
    shared: SharedPfns,
}

impl VmMmu {
    /// Set up the stage-2 MMU of a new VM
    ///
    /// In protected mode the hypervisor owns the guest's table and no host
    /// table is allocated.
    pub fn new(
        vmid: u16,
        config: Stage2Config,
        caps: CpuCaps,
        mm_ops: Arc<dyn MmOps>,
        hyp: HypCalls,
        host: Arc<dyn HostMm>,
    ) -> Result<Self> {
        let ipa_bits = config.validate(&caps)?;
        let vtcr = Vtcr::new(ipa_bits, config.granule, caps.ipa_limit)?;
        let mut mmu = S2Mmu::new(vmid, vtcr);

        let pgt = if config.protected {
            None
        } else {
            let pgt = Stage2Pgtable::new(mmu, mm_ops.clone(), config.flags, Arc::new(Stage2PteOps), hyp.clone(), &caps)?;
            mmu = *pgt.mmu();
            Some(pgt)
        };

        log::info!(
            "vmid {}: {} bit IPA space, {:?} granule{}",
            vmid,
            ipa_bits,
            config.granule,
            if config.protected { ", protected" } else { "" }
        );

        let shared = SharedPfns::new(hyp.clone(), config.granule.page_shift());
        Ok(Self {
            config,
            caps,
            ipa_bits,
            mmu,
            mm_ops,
            hyp,
            host,
            state: RwLock::new(MmuState { pgt, pinned: PinnedPages::new() }),
            memslots: RwLock::new(Memslots::new()),
            invalidate_seq: AtomicU64::new(0),
            invalidate_in_progress: AtomicU64::new(0),
            pkvm_handle: AtomicU64::new(0),
            protected_hyp_mem: AtomicU64::new(0),
            shared,
        })
    }

    pub fn config(&self) -> &Stage2Config {
        &self.config
    }

    pub fn caps(&self) -> &CpuCaps {
        &self.caps
    }

    /// Whether the hypervisor owns guest memory
    pub fn is_protected(&self) -> bool {
        self.config.protected
    }

    pub fn ipa_bits(&self) -> u32 {
        self.ipa_bits
    }

    /// Size of the IPA space in bytes
    pub fn phys_size(&self) -> u64 {
        1 << self.ipa_bits
    }

    pub fn granule(&self) -> Granule {
        self.config.granule
    }

    pub(super) fn page_shift(&self) -> u32 {
        self.config.granule.page_shift()
    }

    pub(super) fn page_size(&self) -> u64 {
        self.config.granule.page_size()
    }

    pub fn vtcr(&self) -> Vtcr {
        self.mmu.vtcr
    }

    /// VTTBR_EL2 value for this VM, no table base once torn down
    pub fn vttbr(&self) -> u64 {
        match self.state.read().pgt.as_ref() {
            Some(pgt) => pgt.mmu().vttbr(),
            None => S2Mmu::new(self.mmu.vmid, self.mmu.vtcr).vttbr(),
        }
    }

    pub fn host(&self) -> &Arc<dyn HostMm> {
        &self.host
    }

    pub fn mm_ops(&self) -> &Arc<dyn MmOps> {
        &self.mm_ops
    }

    /// Take the MMU lock for reading
    pub fn read_state(&self) -> RwLockReadGuard<'_, MmuState> {
        self.state.read()
    }

    /// Pages a vCPU memory cache needs to resolve one fault
    pub fn mmu_cache_min_pages(&self) -> usize {
        self.mmu.vtcr.mmu_cache_min_pages()
    }

    /// Handle of the VM at the hypervisor, zero before it first ran
    pub fn pkvm_handle(&self) -> u64 {
        self.pkvm_handle.load(Ordering::Acquire)
    }

    pub fn set_pkvm_handle(&self, handle: u64) {
        self.pkvm_handle.store(handle, Ordering::Release);
    }

    /// Bytes donated to the hypervisor through vCPU memory caches
    pub fn protected_hyp_mem(&self) -> u64 {
        self.protected_hyp_mem.load(Ordering::Relaxed)
    }

    /// Pages shared with the hypervisor outside guest memory
    pub fn shared_pfns(&self) -> &SharedPfns {
        &self.shared
    }

    pub fn memslots(&self) -> RwLockReadGuard<'_, Memslots> {
        self.memslots.read()
    }

    /// Add or replace a memslot
    pub fn install_memslot(&self, slot: Memslot) {
        log::debug!(
            "memslot {}: gfn {:#x} + {:#x} pages at hva {:#x}",
            slot.id,
            slot.base_gfn,
            slot.npages,
            slot.userspace_addr
        );
        self.memslots.write().install(slot);
    }

    /// Remove a memslot and unmap its range
    pub fn delete_memslot(&self, id: u16) -> Option<Memslot> {
        let slot = self.memslots.write().remove(id)?;
        self.flush_shadow_memslot(&slot);
        Some(slot)
    }

    /// Run `op` over `[addr, end)` in chunks of the smallest block size
    ///
    /// With `resched`, the MMU lock is dropped and taken again between
    /// chunks. Stops at the first error and at a torn down table.
    pub(super) fn apply_range<'a>(
        &'a self,
        mut guard: StateGuard<'a>,
        mut addr: u64,
        end: u64,
        resched: bool,
        mut op: impl FnMut(&Stage2Pgtable, u64, u64) -> Result<()>,
    ) -> (StateGuard<'a>, Result<()>) {
        let granule = self.granule();
        let chunk = granule.granule_size(granule.min_block_level());

        while addr < end {
            let Some(pgt) = guard.pgt.as_ref() else {
                return (guard, Err(Error::InvalidArgument));
            };
            let next = (align_down!(addr, chunk) + chunk).min(end);

            if let Err(err) = op(pgt, addr, next - addr) {
                return (guard, Err(err));
            }
            addr = next;
            if resched && addr != end {
                guard = cond_resched_write(&self.state, guard);
            }
        }
        (guard, Ok(()))
    }

    pub(super) fn unmap_range_locked<'a>(
        &'a self,
        guard: StateGuard<'a>,
        start: u64,
        size: u64,
        may_block: bool,
    ) -> StateGuard<'a> {
        if size & (self.page_size() - 1) != 0 {
            log::warn!("unaligned stage-2 unmap of {:#x} bytes at {:#x}", size, start);
        }

        let (guard, ret) = self.apply_range(guard, start, start + size, may_block, |pgt, addr, size| pgt.unmap(addr, size));
        if let Err(err) = ret {
            log::warn!("stage-2 unmap of {:#x}..{:#x} failed: {}", start, start + size, err);
        }
        guard
    }

    /// Unmap `[start, start + size)` from the guest
    pub fn unmap_range(&self, start: u64, size: u64) {
        let guard = self.state.write();
        drop(self.unmap_range_locked(guard, start, size, true));
    }

    /// An invalidation of guest frames begins
    ///
    /// Faults that resolved a page before this point must not install it.
    pub fn invalidate_range_start(&self, range: GfnRange) {
        self.invalidate_in_progress.fetch_add(1, Ordering::AcqRel);
        self.unmap_gfn_range(range, true);
    }

    /// The invalidation started by the matching `invalidate_range_start` ended
    pub fn invalidate_range_end(&self) {
        let _guard = self.state.write();

        self.invalidate_seq.fetch_add(1, Ordering::AcqRel);
        self.invalidate_in_progress.fetch_sub(1, Ordering::AcqRel);
    }

    /// Snapshot of the invalidation sequence
    pub fn invalidate_seq(&self) -> u64 {
        self.invalidate_seq.load(Ordering::Acquire)
    }

    /// Whether a page resolved after taking `seq` may be stale
    ///
    /// Only meaningful with the MMU lock held.
    pub fn invalidate_retry(&self, seq: u64) -> bool {
        self.invalidate_in_progress.load(Ordering::Acquire) != 0 || self.invalidate_seq.load(Ordering::Acquire) != seq
    }

    /// Unmap guest frames on behalf of the host
    ///
    /// Returns whether the caller still needs to flush TLBs, which it never
    /// does since unmapping invalidates as it goes.
    pub fn unmap_gfn_range(&self, range: GfnRange, may_block: bool) -> bool {
        let guard = self.state.write();

        if guard.pgt.is_none() {
            return false;
        }

        let shift = self.page_shift();
        drop(self.unmap_range_locked(guard, range.start << shift, range.len() << shift, may_block));
        false
    }

    /// The host moved the page behind `gfn` to `pfn`
    ///
    /// Installs the new page read-only, without a memory cache: any block
    /// covering `gfn` was unmapped by the preceding invalidation.
    pub fn set_spte_gfn(&self, range: GfnRange, pfn: Pfn) -> bool {
        let state = self.state.write();
        let Some(pgt) = state.pgt.as_ref() else {
            return false;
        };

        if range.len() != 1 {
            log::warn!("set_spte on {} pages", range.len());
        }
        if self.sanitise_mte_tags(pfn, self.page_size()).is_err() {
            return false;
        }

        let shift = self.page_shift();
        if let Err(err) = pgt.map(range.start << shift, self.page_size(), pfn << shift, Prot::R, None) {
            log::debug!("set_spte at gfn {:#x}: {}", range.start, err);
        }
        false
    }

    /// Clear the access flag of the entry mapping `range`
    ///
    /// Returns whether the entry was valid and young.
    pub fn age_gfn(&self, range: GfnRange) -> bool {
        let state = self.state.write();
        let Some(pgt) = state.pgt.as_ref() else {
            return false;
        };

        let size = range.len() << self.page_shift();
        let granule = self.granule();
        if size != granule.page_size() && size != 1 << granule.pmd_shift() && size != 1 << granule.pud_shift() {
            log::warn!("aging {:#x} bytes at gfn {:#x}", size, range.start);
        }

        match pgt.mkold(range.start << self.page_shift()) {
            Ok(old) => pte_valid(old) && old & s2::AF != 0,
            Err(_) => false,
        }
    }

    /// Whether the entry mapping `range` has its access flag set
    pub fn test_age_gfn(&self, range: GfnRange) -> bool {
        let state = self.state.write();

        match state.pgt.as_ref() {
            Some(pgt) => pgt.is_young(range.start << self.page_shift()).unwrap_or(false),
            None => false,
        }
    }

    /// Map device memory `[pa, pa + size)` at `guest_ipa`
    ///
    /// Maps page by page, topping up a private memory cache before each.
    pub fn phys_addr_ioremap(&self, guest_ipa: u64, mut pa: PhysAddr, size: u64, writable: bool) -> Result<()> {
        if self.is_protected() {
            return Err(Error::PermissionDenied);
        }

        let page_size = self.page_size();
        let mut prot = Prot::DEVICE | Prot::R;
        if writable {
            prot |= Prot::W;
        }

        let size = size + (guest_ipa & (page_size - 1));
        let start = align_down!(guest_ipa, page_size);
        let mut cache = MemCache::new();
        let mut ret = Ok(());

        let mut addr = start;
        while addr < start + size {
            ret = cache.topup(&*self.mm_ops, self.mmu_cache_min_pages());
            if ret.is_err() {
                break;
            }

            let state = self.state.write();
            ret = match state.pgt.as_ref() {
                Some(pgt) => match pgt.map(addr, page_size, pa, prot, Some(&mut cache)) {
                    Err(Error::Again) => Ok(()),
                    ret => ret,
                },
                None => Err(Error::InvalidArgument),
            };
            drop(state);
            if ret.is_err() {
                break;
            }

            pa += page_size;
            addr += page_size;
        }

        cache.free(&*self.mm_ops);
        ret
    }

    /// Clean guest memory to the point of coherency
    ///
    /// Used when the guest turns its caches off.
    pub fn flush_vm(&self) {
        let memslots = self.memslots.read();
        let mut guard = self.state.write();

        if !self.is_protected() {
            for slot in memslots.iter() {
                let start = slot.base_ipa();
                let (next, ret) = self.apply_range(guard, start, start + slot.size(), true, |pgt, addr, size| {
                    pgt.flush(addr, size)
                });
                guard = next;
                if let Err(err) = ret {
                    log::warn!("flush of memslot {} failed: {}", slot.id, err);
                }
            }
        } else if !self.config.pvm {
            let pfns: Vec<Pfn> = guard.pinned.iter().map(|(_, pfn)| pfn).collect();
            let shift = self.page_shift();

            for pfn in pfns {
                let addr = self.mm_ops.phys_to_virt(pfn << shift);
                self.mm_ops.dcache_clean_inval_poc(addr, self.page_size() as usize);
                guard = cond_resched_write(&self.state, guard);
            }
        }
    }

    /// Tear down the stage-2 table
    ///
    /// The table is detached under the MMU lock and freed outside it.
    pub fn free_stage2_pgd(&self) {
        if self.is_protected() {
            return;
        }

        let pgt = self.state.write().pgt.take();
        if let Some(pgt) = pgt {
            log::debug!("vmid {}: freeing stage-2 table", self.mmu.vmid);
            pgt.destroy();
        }
    }

    /// Unmap everything, the VM is going away
    pub fn flush_shadow_all(&self) {
        self.free_stage2_pgd();
    }

    /// Unmap the range of a memslot being deleted or moved
    pub fn flush_shadow_memslot(&self, slot: &Memslot) {
        if self.is_protected() {
            return;
        }

        let guard = self.state.write();
        drop(self.unmap_range_locked(guard, slot.base_ipa(), slot.size(), true));
    }

    /// Unmap every memslot range backed by ordinary host memory
    ///
    /// Used on vCPU reset, where device mappings may stay.
    pub fn unmap_vm(&self) {
        let memslots = self.memslots.read();
        let mut guard = self.state.write();

        if guard.pgt.is_none() {
            return;
        }

        for slot in memslots.iter() {
            let reg_end = slot.userspace_addr + slot.size();
            let mut hva = slot.userspace_addr;

            while hva < reg_end {
                let Some(vma) = self.host.find_vma_intersection(hva, reg_end) else {
                    break;
                };
                let vm_start = hva.max(vma.start);
                let vm_end = reg_end.min(vma.end);

                if !vma.flags.contains(VmaFlags::PFNMAP) {
                    let gpa = slot.base_ipa() + (vm_start - slot.userspace_addr);
                    guard = self.unmap_range_locked(guard, gpa, vm_end - vm_start, true);
                }
                hva = vm_end;
            }
        }
    }
}

impl core::fmt::Debug for VmMmu {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("VmMmu")
            .field("vmid", &self.mmu.vmid)
            .field("ipa_bits", &self.ipa_bits)
            .field("protected", &self.config.protected)
            .finish_non_exhaustive()
    }
}
