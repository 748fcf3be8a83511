//! Protected-mode ownership tracking
//!
//! When the hypervisor owns guest memory, the host pins each page a guest
//! faults on, donates it with `host_map_guest` and records the pin in a
//! ledger keyed by IPA. The ledger is the only way back to those pages:
//! teardown walks it to reclaim and unpin everything.
//!
//! Pages the host shares with the hypervisor for its own use (vCPU state,
//! control structures) are counted per pfn so that nested share requests
//! map to a single share call.

use super::abort::FaultResolution;
use super::host::PinnedPage;
use super::memcache::HypMemCache;
use super::mmu::VmMmu;
use super::{Hva, Pfn, PhysAddr};
use crate::arch::arm64::hyp::HypCalls;
use crate::core::sync::Mutex;
use crate::core::vmm::Vcpu;
use crate::{Error, Result};
use alloc::collections::BTreeMap;
use core::sync::atomic::Ordering;

/// Pages pinned on behalf of the hypervisor, keyed by guest IPA
#[derive(Debug, Default)]
pub struct PinnedPages {
    pages: BTreeMap<u64, PinnedPage>,
}

impl PinnedPages {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `page` as mapped at `ipa`
    ///
    /// A second record for the same IPA is refused. The page is kept pinned
    /// then, the hypervisor may already have it mapped.
    pub fn insert(&mut self, ipa: u64, page: PinnedPage) -> Result<()> {
        if let Some(old) = self.pages.get(&ipa) {
            log::error!(
                "pinned page already recorded at ipa {:#x}: pfn {:#x}, new pfn {:#x}",
                ipa,
                old.pfn(),
                page.pfn()
            );
            page.leak();
            return Err(Error::AlreadyExists);
        }

        self.pages.insert(ipa, page);
        Ok(())
    }

    /// Drop the record at `ipa`, handing back the pin
    pub fn remove(&mut self, ipa: u64) -> Result<PinnedPage> {
        self.pages.remove(&ipa).ok_or(Error::NotFound)
    }

    /// Pfn pinned at `ipa`
    pub fn get(&self, ipa: u64) -> Option<Pfn> {
        self.pages.get(&ipa).map(PinnedPage::pfn)
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// Records in IPA order
    pub fn iter(&self) -> impl Iterator<Item = (u64, Pfn)> + '_ {
        self.pages.iter().map(|(ipa, page)| (*ipa, page.pfn()))
    }

    /// Take back the page at `ipa` from a dying VM and unpin it
    pub fn reclaim(&mut self, hyp: &HypCalls, handle: u64, ipa: u64) -> Result<()> {
        let pfn = self.get(ipa).ok_or(Error::NotFound)?;

        hyp.reclaim_dying_guest_page(handle, pfn, ipa)?;
        self.pages.remove(&ipa);
        Ok(())
    }

    /// Reclaim and unpin every page of a VM being destroyed
    ///
    /// Each page is unpinned exactly once, in IPA order, even when the
    /// hypervisor fails to hand it back.
    pub fn teardown(&mut self, hyp: &HypCalls, handle: u64) {
        if handle != 0 {
            if let Err(err) = hyp.start_teardown_vm(handle) {
                log::warn!("start_teardown_vm({:#x}): {}", handle, err);
            }
        }

        while let Some((ipa, page)) = self.pages.pop_first() {
            if let Err(err) = hyp.reclaim_dying_guest_page(handle, page.pfn(), ipa) {
                log::warn!("reclaim of pfn {:#x} at ipa {:#x}: {}", page.pfn(), ipa, err);
            }
        }

        if handle != 0 {
            if let Err(err) = hyp.finalize_teardown_vm(handle) {
                log::warn!("finalize_teardown_vm({:#x}): {}", handle, err);
            }
        }
    }
}

/// Host pages shared with the hypervisor, with a share count each
pub struct SharedPfns {
    pfns: Mutex<BTreeMap<Pfn, u64>>,
    hyp: HypCalls,
    page_shift: u32,
}

impl SharedPfns {
    pub fn new(hyp: HypCalls, page_shift: u32) -> Self {
        Self { pfns: Mutex::new(BTreeMap::new()), hyp, page_shift }
    }

    /// Share `pfn`, issuing the share call on first use only
    ///
    /// If the hypervisor refuses, the pfn is not recorded.
    pub fn share_pfn(&self, pfn: Pfn) -> Result<()> {
        let mut pfns = self.pfns.lock();
        let count = pfns.entry(pfn).or_insert(0);

        *count += 1;
        if *count > 1 {
            return Ok(());
        }

        if let Err(err) = self.hyp.host_share_hyp(pfn) {
            pfns.remove(&pfn);
            return Err(err);
        }
        Ok(())
    }

    /// Drop one share of `pfn`, issuing the unshare call on last use
    pub fn unshare_pfn(&self, pfn: Pfn) -> Result<()> {
        let mut pfns = self.pfns.lock();
        let Some(count) = pfns.get_mut(&pfn) else {
            log::error!("unshare of pfn {:#x}, never shared", pfn);
            return Err(Error::NotFound);
        };

        *count -= 1;
        if *count > 0 {
            return Ok(());
        }

        pfns.remove(&pfn);
        self.hyp.host_unshare_hyp(pfn)
    }

    /// Share every page overlapping `[from, to)`
    pub fn share_range(&self, from: PhysAddr, to: PhysAddr) -> Result<()> {
        let page_size = 1u64 << self.page_shift;

        let mut cur = align_down!(from, page_size);
        while cur < align_up!(to, page_size) {
            self.share_pfn(cur >> self.page_shift)?;
            cur += page_size;
        }
        Ok(())
    }

    /// Unshare every page overlapping `[from, to)`, carrying on past errors
    pub fn unshare_range(&self, from: PhysAddr, to: PhysAddr) {
        let page_size = 1u64 << self.page_shift;

        let mut cur = align_down!(from, page_size);
        while cur < align_up!(to, page_size) {
            if let Err(err) = self.unshare_pfn(cur >> self.page_shift) {
                log::warn!("unshare of {:#x}: {}", cur, err);
            }
            cur += page_size;
        }
    }

    /// Share count of `pfn`
    pub fn count(&self, pfn: Pfn) -> u64 {
        self.pfns.lock().get(&pfn).copied().unwrap_or(0)
    }
}

impl core::fmt::Debug for SharedPfns {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SharedPfns").field("pfns", &self.pfns.lock().len()).finish()
    }
}

impl VmMmu {
    /// Make sure the hypervisor has enough pages to map one fault
    pub fn topup_hyp_memcache(&self, vcpu: &mut Vcpu) -> Result<()> {
        if !self.is_protected() {
            return Ok(());
        }

        // Pages added before a failed allocation stay in the cache
        let before = vcpu.hyp_memcache.nr_pages();
        let ret = vcpu.hyp_memcache.topup(&*self.mm_ops, self.mmu_cache_min_pages());
        let added = vcpu.hyp_memcache.nr_pages() - before;

        self.protected_hyp_mem.fetch_add((added as u64) << self.page_shift(), Ordering::Relaxed);
        ret.map(|_| ())
    }

    /// Return the pages of a hypervisor memory cache to the host
    pub fn free_hyp_memcache(&self, mc: &mut HypMemCache) {
        if !self.is_protected() {
            return;
        }

        let released = mc.free(&*self.mm_ops);
        self.protected_hyp_mem.fetch_sub((released as u64) << self.page_shift(), Ordering::Relaxed);
    }

    /// Resolve a fault of a VM whose memory the hypervisor owns
    ///
    /// Pins the host page at `hva` and donates it. A fault that lost the
    /// race to donate the same page is retried.
    pub(super) fn pkvm_mem_abort(&self, vcpu: &mut Vcpu, fault_ipa: u64, hva: Hva) -> Result<FaultResolution> {
        self.topup_hyp_memcache(vcpu).map_err(|_| Error::OutOfMemory)?;

        let page = match PinnedPage::pin(&self.host, hva) {
            Ok(page) => page,
            Err(Error::HwPoison) => {
                self.host.send_hwpoison_signal(hva, self.page_shift());
                return Ok(FaultResolution::Poisoned);
            }
            Err(Error::OutOfMemory) => return Err(Error::OutOfMemory),
            Err(_) => return Err(Error::BadAddress),
        };

        // Page cache pages could be written back behind the hypervisor's back
        if !self.host.page_is_swap_backed(page.pfn()) {
            return Err(Error::Io);
        }

        let mut state = self.state.write();
        match self.hyp.host_map_guest(page.pfn(), fault_ipa >> self.page_shift()) {
            Ok(()) => {}
            Err(Error::PermissionDenied) => {
                log::debug!("ipa {:#x} already donated by another vcpu", fault_ipa);
                drop(state);
                return Ok(FaultResolution::Retry);
            }
            Err(err) => return Err(err),
        }

        let pfn = page.pfn();
        // The duplicate is logged and its pin kept by the ledger
        let _ = state.pinned.insert(fault_ipa, page);
        log::trace!("ipa {:#x} donated, pfn {:#x}", fault_ipa, pfn);
        Ok(FaultResolution::Resolved)
    }

    /// Reclaim every donated page of a VM being destroyed
    pub fn destroy_hyp_vm(&self) {
        let handle = self.pkvm_handle();
        let mut state = self.state.write();

        state.pinned.teardown(&self.hyp, handle);
        self.set_pkvm_handle(0);
    }
}
