//! Guest memory abort handling
//!
//! Resolves stage-2 faults taken by a vCPU: classifies the syndrome, finds
//! the memslot and host page behind the faulting IPA, picks the largest
//! mapping the host and the slot allow and installs it, or relaxes the
//! permissions of the entry already there.
//!
//! A host page is borrowed without the MMU lock held. The invalidation
//! sequence taken before borrowing is checked again under the lock, and a
//! fault that raced with an invalidation is retried by the guest.

use super::host::{PfnRef, VmaFlags};
use super::memslot::Memslot;
use super::mmu::{MmuState, VmMmu};
use super::{Hva, Pfn};
use crate::arch::arm64::mmu::stage2::{pte_to_phys, pte_valid};
use crate::arch::arm64::mmu::{ExceptionInfo, FaultInfo, FaultKind, Prot};
use crate::core::sync::{LockMode, RwLockReadGuard, RwLockWriteGuard};
use crate::core::vmm::Vcpu;
use crate::{Error, Result};
use core::ops::Deref;

/// Outcome of a guest abort
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultResolution {
    /// A mapping was installed or updated, resume the guest
    Resolved,
    /// Nothing was installed, resume the guest and let it fault again
    Retry,
    /// Inject an exception into the guest
    InjectException(ExceptionInfo),
    /// Access outside guest RAM, to be emulated at `ipa`
    Mmio { ipa: u64 },
    /// Cache maintenance outside guest RAM, skip the instruction
    SkipInstruction,
    /// The page is poisoned, a signal is pending for the VMM
    Poisoned,
}

/// The MMU lock as taken by a fault
enum MmuGuard<'a> {
    Shared(RwLockReadGuard<'a, MmuState>),
    Exclusive(RwLockWriteGuard<'a, MmuState>),
}

impl MmuGuard<'_> {
    fn mode(&self) -> LockMode {
        match self {
            MmuGuard::Shared(_) => LockMode::Shared,
            MmuGuard::Exclusive(_) => LockMode::Exclusive,
        }
    }
}

impl Deref for MmuGuard<'_> {
    type Target = MmuState;

    fn deref(&self) -> &MmuState {
        match self {
            MmuGuard::Shared(guard) => &**guard,
            MmuGuard::Exclusive(guard) => &**guard,
        }
    }
}

impl VmMmu {
    /// Handle a stage-2 abort taken by `vcpu`
    ///
    /// `esr` and `far` are the syndrome and faulting address, `ipa` the
    /// page-granular fault IPA.
    pub fn handle_guest_abort(&self, vcpu: &mut Vcpu, esr: u64, far: u64, ipa: u64) -> Result<FaultResolution> {
        let info = FaultInfo::from_esr(esr, far, ipa)?;

        if info.kind == FaultKind::Translation {
            // Beyond the sanitised PARange
            if ipa >= 1 << self.caps.ipa_limit {
                return Ok(FaultResolution::InjectException(ExceptionInfo::SizeFault));
            }

            // Between the VM's IPA range and PARange
            if !self.is_protected() && ipa >= self.phys_size() {
                let addr = info.full_ipa();
                let exception = if info.is_iabt {
                    ExceptionInfo::PrefetchAbort { addr }
                } else {
                    ExceptionInfo::DataAbort { addr }
                };
                return Ok(FaultResolution::InjectException(exception));
            }
        }

        match info.kind {
            FaultKind::Translation | FaultKind::Permission | FaultKind::AccessFlag => {}
            FaultKind::ExternalAbort => {
                log::warn!("synchronous external abort at ipa {:#x}, ESR_EL2={:#x}", ipa, esr);
                return Ok(FaultResolution::InjectException(ExceptionInfo::ExternalAbort));
            }
            _ => {
                log::error!("unsupported FSC: ESR_EL2={:#x} ({})", esr, info.description());
                return Err(Error::BadAddress);
            }
        }

        log::trace!("guest {} at ipa {:#x} far {:#x}", info.description(), ipa, far);

        let memslots = self.memslots.read();
        let gfn = ipa >> self.page_shift();
        let slot = memslots.find(gfn);
        let hva = slot.and_then(|slot| slot.gfn_to_hva(gfn));

        let (slot, hva) = match (slot, hva) {
            (Some(slot), Some((hva, writable))) if writable || !info.is_write_fault() => (slot, hva),
            _ => {
                // Instructions or page tables somewhere the VMM cannot help with
                if info.is_iabt {
                    return Ok(FaultResolution::InjectException(ExceptionInfo::PrefetchAbort { addr: far }));
                }
                if info.s1ptw {
                    return Ok(FaultResolution::InjectException(ExceptionInfo::DataAbort { addr: far }));
                }
                // Cache maintenance outside any memslot cannot be for RAM
                if hva.is_none() && info.cm {
                    return Ok(FaultResolution::SkipInstruction);
                }
                return Ok(FaultResolution::Mmio { ipa: info.full_ipa() });
            }
        };

        if info.kind == FaultKind::AccessFlag {
            self.handle_access_fault(ipa);
            return Ok(FaultResolution::Resolved);
        }

        let ret = if self.is_protected() {
            self.pkvm_mem_abort(vcpu, ipa, hva)
        } else {
            self.user_mem_abort(vcpu, &info, ipa, slot, hva)
        };

        match ret {
            Err(Error::NoExec) => Ok(FaultResolution::InjectException(ExceptionInfo::PrefetchAbort { addr: far })),
            ret => ret,
        }
    }

    /// Make the entry at `ipa` young again
    fn handle_access_fault(&self, ipa: u64) {
        let state = self.state.write();
        let pte = match state.pgt.as_ref().map(|pgt| pgt.mkyoung(ipa)) {
            Some(Ok(pte)) => pte,
            Some(Err(err)) => {
                log::debug!("mkyoung at ipa {:#x} failed: {}", ipa, err);
                0
            }
            None => 0,
        };
        drop(state);

        if pte_valid(pte) {
            self.host.set_pfn_accessed(pte_to_phys(pte, self.granule()) >> self.page_shift());
        }
    }

    /// Stage-2 mapping shift for a VMA allowing `vma_shift`
    ///
    /// Tries the VMA's size, then each smaller block and contiguous size,
    /// as long as the slot can hold a block of that size around `hva`.
    /// Returns the shift and whether the fault must be mapped with pages.
    fn stage2_mapping_shift(&self, slot: &Memslot, hva: Hva, vma_shift: u32) -> (u32, bool) {
        let granule = self.granule();
        let page_shift = granule.page_shift();
        let candidates = [
            granule.pud_shift(),
            granule.cont_pmd_shift(),
            granule.pmd_shift(),
            granule.cont_pte_shift(),
        ];

        if vma_shift == page_shift {
            return (page_shift, false);
        }

        let Some(first) = candidates.iter().position(|shift| *shift == vma_shift) else {
            log::warn!("unknown VMA shift {}", vma_shift);
            return (page_shift, true);
        };

        candidates[first..]
            .iter()
            .find(|shift| slot.supports_huge_mapping(hva, 1 << **shift))
            .map_or((page_shift, true), |shift| (*shift, false))
    }

    /// Map a transparent huge page with a block
    ///
    /// If `hva` is backed by a PMD-sized THP and the slot can hold the
    /// block, moves `ipa` and the page reference to the head of the huge
    /// page and returns the block size. Returns the page size otherwise.
    fn transparent_hugepage_adjust(&self, slot: &Memslot, hva: Hva, page: &mut PfnRef<'_>, ipa: &mut u64) -> Result<u64> {
        let granule = self.granule();
        let pmd_size = 1u64 << granule.pmd_shift();

        if !slot.supports_huge_mapping(hva, pmd_size) {
            return Ok(granule.page_size());
        }
        if self.host.user_mapping_size(hva)? < pmd_size {
            return Ok(granule.page_size());
        }

        *ipa &= !(pmd_size - 1);
        page.transfer(page.pfn() & !(granule.ptrs_per_table() as Pfn - 1));
        Ok(pmd_size)
    }

    /// Initialise the MTE tags of pages about to be mapped cacheable
    pub(super) fn sanitise_mte_tags(&self, pfn: Pfn, size: u64) -> Result<()> {
        if !self.caps.mte {
            return Ok(());
        }
        // Device memory may not support tags
        if !self.host.page_is_online(pfn) {
            return Err(Error::BadAddress);
        }

        for pfn in pfn..pfn + (size >> self.page_shift()) {
            if !self.host.page_mte_tagged(pfn) {
                self.host.mte_clear_page_tags(pfn);
            }
        }
        Ok(())
    }

    /// Resolve a translation or permission fault from host memory
    fn user_mem_abort(
        &self,
        vcpu: &mut Vcpu,
        info: &FaultInfo,
        fault_ipa: u64,
        slot: &Memslot,
        hva: Hva,
    ) -> Result<FaultResolution> {
        let granule = self.granule();
        let page_shift = granule.page_shift();
        let page_size = granule.page_size();
        let fault_granule = info.granule_size(granule);
        let write_fault = info.is_write_fault();
        let exec_fault = info.is_exec_fault();
        let perm_fault = info.kind == FaultKind::Permission;
        let logging = slot.is_logging();

        if perm_fault && !write_fault && !exec_fault {
            log::error!("unexpected stage-2 read permission fault at ipa {:#x}", fault_ipa);
            return Err(Error::BadAddress);
        }

        // Permission faults only need a table page to split a block for logging
        if !perm_fault || (logging && write_fault) {
            vcpu.mmu_page_cache.topup(&**self.mm_ops(), self.mmu_cache_min_pages())?;
        }

        let Some(vma) = self.host.vma_lookup(hva) else {
            log::error!("no VMA for hva {:#x}", hva);
            return Err(Error::BadAddress);
        };

        let (vma_shift, force_pte, use_read_lock) = if logging {
            (page_shift, true, perm_fault && write_fault && fault_granule == page_size)
        } else {
            let (shift, force_pte) = self.stage2_mapping_shift(slot, hva, vma.page_shift(hva, granule));
            (shift, force_pte, false)
        };
        let shared = vma.flags.contains(VmaFlags::SHARED);

        let mut vma_pagesize = 1u64 << vma_shift;
        let mut fault_ipa = fault_ipa & !(vma_pagesize - 1);
        let gfn = fault_ipa >> page_shift;
        let Some((gfn_hva, slot_writable)) = slot.gfn_to_hva(gfn) else {
            return Err(Error::BadAddress);
        };

        let mmu_seq = self.invalidate_seq();

        let (mut page, mut writable) = match PfnRef::get(&**self.host(), gfn_hva, write_fault) {
            Ok(ret) => ret,
            Err(Error::HwPoison) => {
                self.host.send_hwpoison_signal(hva, vma_shift);
                return Ok(FaultResolution::Poisoned);
            }
            Err(_) => return Err(Error::BadAddress),
        };

        // Device pages keep the size found from the VMA, no THP upgrade
        let device = self.host.is_device_pfn(page.pfn());
        writable &= slot_writable;
        if !device && logging && !write_fault {
            writable = false;
        }
        if exec_fault && device {
            return Err(Error::NoExec);
        }

        let state = if use_read_lock {
            MmuGuard::Shared(self.state.read())
        } else {
            MmuGuard::Exclusive(self.state.write())
        };

        let ret = 'install: {
            if self.invalidate_retry(mmu_seq) {
                break 'install Err(Error::Again);
            }
            let Some(pgt) = state.pgt.as_ref() else {
                log::error!("guest fault on a torn down stage-2 table");
                break 'install Err(Error::NotInitialized);
            };

            if vma_pagesize == page_size && !(force_pte || device) {
                vma_pagesize = if perm_fault && fault_granule > page_size {
                    fault_ipa &= !(fault_granule - 1);
                    fault_granule
                } else {
                    match self.transparent_hugepage_adjust(slot, hva, &mut page, &mut fault_ipa) {
                        Ok(size) => size,
                        Err(err) => break 'install Err(err),
                    }
                };
            }

            if !perm_fault && !device && self.caps.mte {
                // The VMM must not have introduced a shared mapping since
                let ret = if shared {
                    Err(Error::BadAddress)
                } else {
                    self.sanitise_mte_tags(page.pfn(), vma_pagesize)
                };
                if let Err(err) = ret {
                    break 'install Err(err);
                }
            }

            let mut prot = Prot::R;
            if writable {
                prot |= Prot::W;
            }
            if exec_fault {
                prot |= Prot::X;
            }
            if device {
                prot |= Prot::DEVICE;
            } else if self.caps.cache_dic {
                prot |= Prot::X;
            }

            let ret = if perm_fault && vma_pagesize >= fault_granule {
                pgt.relax_perms(fault_ipa, prot, vma_pagesize, state.mode())
            } else {
                if state.mode() == LockMode::Shared {
                    log::warn!("stage-2 map outside of the write lock");
                }
                let phys = page.pfn() << page_shift;
                pgt.map(fault_ipa, vma_pagesize, phys, prot, Some(&mut vcpu.mmu_page_cache))
            };

            if writable && ret.is_ok() {
                self.host.set_pfn_dirty(page.pfn());
                slot.mark_page_dirty(gfn);
            }
            ret
        };
        drop(state);

        self.host.set_pfn_accessed(page.pfn());
        drop(page);

        match ret {
            Ok(()) => {
                log::trace!("ipa {:#x} mapped with {:#x} bytes", fault_ipa, vma_pagesize);
                Ok(FaultResolution::Resolved)
            }
            Err(Error::Again) => {
                log::debug!("fault at ipa {:#x} raced, retrying", fault_ipa);
                Ok(FaultResolution::Retry)
            }
            Err(err) => Err(err),
        }
    }
}
