//! Host-side fakes for unit tests

use crate::arch::arm64::hyp::{HostHcall, HvcTransport, HypCalls, SmcccRes};
use crate::core::mm::host::{HostMm, Vma, VmaFlags};
use crate::core::mm::{Hva, MmOps, Pfn, PhysAddr, VirtAddr};
use crate::{Error, Result};
use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::vec::Vec;

const PAGE: usize = 4096;

struct PageRec {
    count: u32,
    /// Part of a `zalloc_pages_exact` block, freed only with the block
    exact: bool,
}

#[derive(Default)]
struct MmState {
    pages: HashMap<VirtAddr, PageRec>,
    allocs_left: Option<usize>,
    dcache: Vec<(VirtAddr, usize)>,
    icache: Vec<(VirtAddr, usize)>,
}

/// Refcounting page allocator backed by the test process heap
///
/// Physical and virtual addresses are the same.
#[derive(Default)]
pub struct FakeMm {
    state: Mutex<MmState>,
}

impl FakeMm {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pages currently allocated, table roots included
    pub fn live_pages(&self) -> usize {
        self.state.lock().unwrap().pages.len()
    }

    /// Let `n` more single-page allocations succeed
    pub fn fail_allocs_after(&self, n: usize) {
        self.state.lock().unwrap().allocs_left = Some(n);
    }

    /// Data cache maintenance issued so far
    pub fn dcache_ops(&self) -> Vec<(VirtAddr, usize)> {
        self.state.lock().unwrap().dcache.clone()
    }

    /// Instruction cache maintenance issued so far
    pub fn icache_ops(&self) -> Vec<(VirtAddr, usize)> {
        self.state.lock().unwrap().icache.clone()
    }

    pub fn clear_cache_ops(&self) {
        let mut state = self.state.lock().unwrap();
        state.dcache.clear();
        state.icache.clear();
    }

    fn layout(size: usize) -> Layout {
        Layout::from_size_align(size, PAGE).unwrap()
    }
}

impl MmOps for FakeMm {
    fn alloc_zeroed_page(&self) -> Option<VirtAddr> {
        let mut state = self.state.lock().unwrap();

        if let Some(left) = state.allocs_left.as_mut() {
            if *left == 0 {
                return None;
            }
            *left -= 1;
        }
        let addr = unsafe { alloc_zeroed(Self::layout(PAGE)) } as VirtAddr;
        assert_ne!(addr, 0);
        state.pages.insert(addr, PageRec { count: 1, exact: false });
        Some(addr)
    }

    fn zalloc_pages_exact(&self, size: usize) -> Option<VirtAddr> {
        let mut state = self.state.lock().unwrap();
        let addr = unsafe { alloc_zeroed(Self::layout(size)) } as VirtAddr;

        assert_ne!(addr, 0);
        for page in (addr..addr + size).step_by(PAGE) {
            state.pages.insert(page, PageRec { count: 1, exact: true });
        }
        Some(addr)
    }

    fn free_pages_exact(&self, addr: VirtAddr, size: usize) {
        let mut state = self.state.lock().unwrap();

        for page in (addr..addr + size).step_by(PAGE) {
            let rec = state.pages.remove(&page).expect("free of unknown page");
            assert!(rec.exact);
        }
        unsafe { dealloc(addr as *mut u8, Self::layout(size)) };
    }

    fn get_page(&self, addr: VirtAddr) {
        let mut state = self.state.lock().unwrap();
        let rec = state.pages.get_mut(&(addr & !(PAGE - 1))).expect("get_page on unknown page");

        rec.count += 1;
    }

    fn put_page(&self, addr: VirtAddr) {
        let page = addr & !(PAGE - 1);
        let mut state = self.state.lock().unwrap();
        let rec = state.pages.get_mut(&page).expect("put_page on unknown page");

        assert!(rec.count > 0, "page refcount underflow at {:#x}", page);
        rec.count -= 1;
        if rec.count == 0 && !rec.exact {
            state.pages.remove(&page);
            unsafe { dealloc(page as *mut u8, Self::layout(PAGE)) };
        }
    }

    fn page_count(&self, addr: VirtAddr) -> u32 {
        let state = self.state.lock().unwrap();
        state.pages.get(&(addr & !(PAGE - 1))).map_or(0, |rec| rec.count)
    }

    fn phys_to_virt(&self, phys: PhysAddr) -> VirtAddr {
        phys as VirtAddr
    }

    fn virt_to_phys(&self, addr: VirtAddr) -> PhysAddr {
        addr as PhysAddr
    }

    fn dcache_clean_inval_poc(&self, addr: VirtAddr, size: usize) {
        self.state.lock().unwrap().dcache.push((addr, size));
    }

    fn icache_inval_pou(&self, addr: VirtAddr, size: usize) {
        self.state.lock().unwrap().icache.push((addr, size));
    }
}

#[derive(Default)]
struct HypState {
    calls: Vec<(HostHcall, [u64; 3])>,
    errors: Vec<(HostHcall, i64)>,
    unavailable: bool,
}

/// Recording hypervisor
#[derive(Default)]
pub struct FakeHyp {
    state: Mutex<HypState>,
}

impl FakeHyp {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Typed call wrapper issuing through this fake
    pub fn calls_handle(self: &Arc<Self>) -> HypCalls {
        HypCalls::new(self.clone())
    }

    /// Make the next `call` return `errno`
    pub fn fail_next(&self, call: HostHcall, errno: i64) {
        self.state.lock().unwrap().errors.push((call, errno));
    }

    /// Fail every call at the SMCCC level
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().unwrap().unavailable = unavailable;
    }

    pub fn calls(&self) -> Vec<(HostHcall, [u64; 3])> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn count(&self, call: HostHcall) -> usize {
        self.state.lock().unwrap().calls.iter().filter(|(c, _)| *c == call).count()
    }

    pub fn clear(&self) {
        self.state.lock().unwrap().calls.clear();
    }
}

impl HvcTransport for FakeHyp {
    fn hvc(&self, func_id: u32, args: [u64; 3]) -> SmcccRes {
        let mut state = self.state.lock().unwrap();
        let call = HostHcall::from_func_id(func_id).expect("unknown host call");

        if state.unavailable {
            return SmcccRes { a0: u64::MAX, ..SmcccRes::default() };
        }
        state.calls.push((call, args));
        match state.errors.iter().position(|(c, _)| *c == call) {
            Some(idx) => SmcccRes::with_status(state.errors.remove(idx).1),
            None => SmcccRes::with_status(0),
        }
    }
}

const HOST_PAGE_SHIFT: u32 = 12;

struct VmaRec {
    vma: Vma,
    /// First pfn of an anonymous area, pfn maps use `pgoff`
    base_pfn: Pfn,
    writable: bool,
    /// Host stage-1 block size backing the area
    mapping_size: u64,
}

#[derive(Default)]
struct HostState {
    vmas: Vec<VmaRec>,
    refs: HashMap<Pfn, i64>,
    pins: HashMap<Pfn, i64>,
    poisoned: HashSet<Hva>,
    signals: Vec<(Hva, u32)>,
    locked_vm: i64,
    locked_limit: Option<i64>,
    dirty: HashSet<Pfn>,
    accessed: HashSet<Pfn>,
    file_backed: HashSet<Pfn>,
    offline: HashSet<Pfn>,
    tagged: HashSet<Pfn>,
    faults: usize,
}

impl HostState {
    fn lookup(&self, hva: Hva) -> Option<&VmaRec> {
        self.vmas.iter().find(|rec| rec.vma.start <= hva && hva < rec.vma.end)
    }

    fn pfn_of(&self, hva: Hva) -> Option<Pfn> {
        let rec = self.lookup(hva)?;
        let offset = (hva - rec.vma.start) >> HOST_PAGE_SHIFT;

        if rec.vma.flags.contains(VmaFlags::PFNMAP) {
            Some(rec.vma.pgoff + offset)
        } else {
            Some(rec.base_pfn + offset)
        }
    }
}

/// Host process memory with 4K pages
///
/// Anonymous areas are backed by consecutive pfns starting at the area's
/// base pfn. Borrowed and pinned pages are counted per pfn.
#[derive(Default)]
pub struct FakeHost {
    state: Mutex<HostState>,
}

impl FakeHost {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn add(&self, vma: Vma, base_pfn: Pfn, writable: bool, mapping_size: u64) {
        self.state.lock().unwrap().vmas.push(VmaRec { vma, base_pfn, writable, mapping_size });
    }

    /// Writable anonymous memory mapped with small pages
    pub fn add_anon(&self, start: Hva, end: Hva, base_pfn: Pfn) {
        let vma = Vma { start, end, pgoff: 0, flags: VmaFlags::empty(), huge_page_shift: 0 };
        self.add(vma, base_pfn, true, 1 << HOST_PAGE_SHIFT);
    }

    /// Anonymous memory the host maps read-only
    pub fn add_readonly(&self, start: Hva, end: Hva, base_pfn: Pfn) {
        let vma = Vma { start, end, pgoff: 0, flags: VmaFlags::empty(), huge_page_shift: 0 };
        self.add(vma, base_pfn, false, 1 << HOST_PAGE_SHIFT);
    }

    /// Anonymous memory backed by transparent huge pages of `size`
    pub fn add_thp(&self, start: Hva, end: Hva, base_pfn: Pfn, size: u64) {
        let vma = Vma { start, end, pgoff: 0, flags: VmaFlags::empty(), huge_page_shift: 0 };
        self.add(vma, base_pfn, true, size);
    }

    /// Any other area
    pub fn add_vma(&self, vma: Vma, base_pfn: Pfn) {
        self.add(vma, base_pfn, true, 1 << HOST_PAGE_SHIFT);
    }

    pub fn poison(&self, hva: Hva) {
        self.state.lock().unwrap().poisoned.insert(hva & !0xfff);
    }

    pub fn set_file_backed(&self, pfn: Pfn) {
        self.state.lock().unwrap().file_backed.insert(pfn);
    }

    pub fn set_offline(&self, pfn: Pfn) {
        self.state.lock().unwrap().offline.insert(pfn);
    }

    /// Fail locked memory charges beyond `pages`
    pub fn set_locked_limit(&self, pages: i64) {
        self.state.lock().unwrap().locked_limit = Some(pages);
    }

    /// Outstanding borrowed references on `pfn`
    pub fn refs(&self, pfn: Pfn) -> i64 {
        self.state.lock().unwrap().refs.get(&pfn).copied().unwrap_or(0)
    }

    /// Outstanding pins on `pfn`
    pub fn pins(&self, pfn: Pfn) -> i64 {
        self.state.lock().unwrap().pins.get(&pfn).copied().unwrap_or(0)
    }

    pub fn total_refs(&self) -> i64 {
        self.state.lock().unwrap().refs.values().sum()
    }

    pub fn total_pins(&self) -> i64 {
        self.state.lock().unwrap().pins.values().sum()
    }

    pub fn locked_vm(&self) -> i64 {
        self.state.lock().unwrap().locked_vm
    }

    pub fn signals(&self) -> Vec<(Hva, u32)> {
        self.state.lock().unwrap().signals.clone()
    }

    pub fn is_dirty(&self, pfn: Pfn) -> bool {
        self.state.lock().unwrap().dirty.contains(&pfn)
    }

    pub fn is_accessed(&self, pfn: Pfn) -> bool {
        self.state.lock().unwrap().accessed.contains(&pfn)
    }

    pub fn is_tagged(&self, pfn: Pfn) -> bool {
        self.state.lock().unwrap().tagged.contains(&pfn)
    }

    /// Number of pages faulted in through `gfn_to_pfn`
    pub fn faults(&self) -> usize {
        self.state.lock().unwrap().faults
    }
}

impl HostMm for FakeHost {
    fn vma_lookup(&self, hva: Hva) -> Option<Vma> {
        self.state.lock().unwrap().lookup(hva).map(|rec| rec.vma)
    }

    fn find_vma_intersection(&self, start: Hva, end: Hva) -> Option<Vma> {
        let state = self.state.lock().unwrap();

        state
            .vmas
            .iter()
            .filter(|rec| rec.vma.start < end && rec.vma.end > start)
            .min_by_key(|rec| rec.vma.start)
            .map(|rec| rec.vma)
    }

    fn gfn_to_pfn(&self, hva: Hva, write: bool) -> Result<(Pfn, bool)> {
        let mut state = self.state.lock().unwrap();

        if state.poisoned.contains(&(hva & !0xfff)) {
            return Err(Error::HwPoison);
        }
        let writable = state.lookup(hva).ok_or(Error::BadAddress)?.writable;
        if write && !writable {
            return Err(Error::BadAddress);
        }
        let pfn = state.pfn_of(hva).ok_or(Error::BadAddress)?;
        *state.refs.entry(pfn).or_default() += 1;
        state.faults += 1;
        Ok((pfn, writable))
    }

    fn user_mapping_size(&self, hva: Hva) -> Result<u64> {
        self.state.lock().unwrap().lookup(hva).map(|rec| rec.mapping_size).ok_or(Error::Again)
    }

    fn get_pfn(&self, pfn: Pfn) {
        *self.state.lock().unwrap().refs.entry(pfn).or_default() += 1;
    }

    fn release_pfn_clean(&self, pfn: Pfn) {
        let mut state = self.state.lock().unwrap();
        let refs = state.refs.entry(pfn).or_default();

        assert!(*refs > 0, "release of unreferenced pfn {:#x}", pfn);
        *refs -= 1;
        if *refs == 0 {
            state.refs.remove(&pfn);
        }
    }

    fn set_pfn_dirty(&self, pfn: Pfn) {
        self.state.lock().unwrap().dirty.insert(pfn);
    }

    fn set_pfn_accessed(&self, pfn: Pfn) {
        self.state.lock().unwrap().accessed.insert(pfn);
    }

    fn is_device_pfn(&self, pfn: Pfn) -> bool {
        let state = self.state.lock().unwrap();

        state.vmas.iter().any(|rec| {
            let pages = (rec.vma.end - rec.vma.start) >> HOST_PAGE_SHIFT;
            rec.vma.flags.contains(VmaFlags::PFNMAP) && rec.vma.pgoff <= pfn && pfn < rec.vma.pgoff + pages
        })
    }

    fn pin_user_page(&self, hva: Hva) -> Result<Pfn> {
        let mut state = self.state.lock().unwrap();

        if state.poisoned.contains(&(hva & !0xfff)) {
            return Err(Error::HwPoison);
        }
        let pfn = state.pfn_of(hva).ok_or(Error::BadAddress)?;
        *state.pins.entry(pfn).or_default() += 1;
        Ok(pfn)
    }

    fn unpin_user_page(&self, pfn: Pfn) {
        let mut state = self.state.lock().unwrap();
        let pins = state.pins.entry(pfn).or_default();

        assert!(*pins > 0, "unpin of unpinned pfn {:#x}", pfn);
        *pins -= 1;
        if *pins == 0 {
            state.pins.remove(&pfn);
        }
    }

    fn page_is_swap_backed(&self, pfn: Pfn) -> bool {
        !self.state.lock().unwrap().file_backed.contains(&pfn)
    }

    fn account_locked_vm(&self, pages: i64) -> Result<()> {
        let mut state = self.state.lock().unwrap();

        if pages > 0 && state.locked_limit.is_some_and(|limit| state.locked_vm + pages > limit) {
            return Err(Error::OutOfMemory);
        }
        state.locked_vm += pages;
        assert!(state.locked_vm >= 0, "locked_vm underflow");
        Ok(())
    }

    fn send_hwpoison_signal(&self, hva: Hva, lsb: u32) {
        self.state.lock().unwrap().signals.push((hva, lsb));
    }

    fn page_is_online(&self, pfn: Pfn) -> bool {
        !self.state.lock().unwrap().offline.contains(&pfn)
    }

    fn page_mte_tagged(&self, pfn: Pfn) -> bool {
        self.state.lock().unwrap().tagged.contains(&pfn)
    }

    fn mte_clear_page_tags(&self, pfn: Pfn) {
        self.state.lock().unwrap().tagged.insert(pfn);
    }
}
