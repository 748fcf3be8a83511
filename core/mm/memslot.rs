//! Guest memory slots
//!
//! A memslot maps a range of guest frames onto host virtual memory. Slots
//! with dirty logging enabled carry a bitmap that the fault path marks on
//! every write mapping it installs.

use super::host::VmaFlags;
use super::mmu::VmMmu;
use super::{Gfn, Hva};
use crate::utils::Bitmap;
use crate::{Error, Result};
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use bitflags::bitflags;

bitflags! {
    /// Userspace memslot flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MemslotFlags: u32 {
        const LOG_DIRTY_PAGES = 1 << 0;
        const READONLY = 1 << 1;
    }
}

/// Kind of memslot update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemslotChange {
    Create,
    Delete,
    Move,
    FlagsOnly,
}

/// A guest memory slot
#[derive(Debug)]
pub struct Memslot {
    pub id: u16,
    pub base_gfn: Gfn,
    pub npages: u64,
    pub userspace_addr: Hva,
    pub flags: MemslotFlags,
    page_shift: u32,
    dirty_bitmap: Option<Bitmap>,
}

impl Memslot {
    /// Describe a slot of `npages` host pages of `1 << page_shift` bytes
    ///
    /// A dirty bitmap is allocated when `LOG_DIRTY_PAGES` is requested.
    pub fn new(id: u16, base_gfn: Gfn, npages: u64, userspace_addr: Hva, flags: MemslotFlags, page_shift: u32) -> Self {
        let dirty_bitmap = flags
            .contains(MemslotFlags::LOG_DIRTY_PAGES)
            .then(|| Bitmap::new(npages as usize));

        Self { id, base_gfn, npages, userspace_addr, flags, page_shift, dirty_bitmap }
    }

    /// First guest physical address
    pub fn base_ipa(&self) -> u64 {
        self.base_gfn << self.page_shift
    }

    /// Size in bytes
    pub fn size(&self) -> u64 {
        self.npages << self.page_shift
    }

    pub fn contains(&self, gfn: Gfn) -> bool {
        gfn >= self.base_gfn && gfn - self.base_gfn < self.npages
    }

    pub fn is_readonly(&self) -> bool {
        self.flags.contains(MemslotFlags::READONLY)
    }

    /// Whether writes to the slot are being tracked
    pub fn is_logging(&self) -> bool {
        self.dirty_bitmap.is_some() && !self.is_readonly()
    }

    /// Host address backing `gfn` and whether the guest may write it
    pub fn gfn_to_hva(&self, gfn: Gfn) -> Option<(Hva, bool)> {
        if !self.contains(gfn) {
            return None;
        }
        let hva = self.userspace_addr + ((gfn - self.base_gfn) << self.page_shift);
        Some((hva, !self.is_readonly()))
    }

    /// Record a write to `gfn`
    pub fn mark_page_dirty(&self, gfn: Gfn) {
        if let Some(bitmap) = &self.dirty_bitmap {
            if self.contains(gfn) {
                bitmap.set_bit((gfn - self.base_gfn) as usize);
            }
        }
    }

    pub fn is_dirty(&self, gfn: Gfn) -> bool {
        match &self.dirty_bitmap {
            Some(bitmap) if self.contains(gfn) => bitmap.test((gfn - self.base_gfn) as usize),
            _ => false,
        }
    }

    /// Harvest the dirty bitmap, one word per 64 pages
    ///
    /// Bits are cleared as they are read. Empty when logging is off.
    pub fn take_dirty_log(&self) -> Vec<u64> {
        match &self.dirty_bitmap {
            Some(bitmap) => (0..bitmap.words()).map(|word| bitmap.take_word(word)).collect(),
            None => Vec::new(),
        }
    }

    /// Snapshot of the dirty bitmap, leaving it untouched
    pub fn dirty_log(&self) -> Vec<u64> {
        match &self.dirty_bitmap {
            Some(bitmap) => (0..bitmap.words()).map(|word| bitmap.load_word(word)).collect(),
            None => Vec::new(),
        }
    }

    /// Clear the dirty bits of `mask` in bitmap word `word`
    ///
    /// Returns the bits that were set.
    pub fn clear_dirty(&self, word: usize, mask: u64) -> u64 {
        self.dirty_bitmap.as_ref().map_or(0, |bitmap| bitmap.clear_mask(word, mask))
    }

    /// Set every dirty bit, for logging that starts with all pages dirty
    pub fn set_all_dirty(&self) {
        if let Some(bitmap) = &self.dirty_bitmap {
            bitmap.set_all();
        }
    }

    /// Whether a block of `map_size` around `hva` can be mapped at stage 2
    ///
    /// The block must be placed identically in the IPA and host address
    /// spaces, and must lie entirely within the slot.
    pub fn supports_huge_mapping(&self, hva: Hva, map_size: u64) -> bool {
        let uaddr_start = self.userspace_addr;
        let uaddr_end = uaddr_start + self.size();

        if self.base_ipa() & (map_size - 1) != uaddr_start & (map_size - 1) {
            return false;
        }

        let block = align_down!(hva, map_size);
        block >= uaddr_start && block + map_size <= uaddr_end
    }
}

/// The set of slots of one VM
#[derive(Debug, Default)]
pub struct Memslots {
    slots: BTreeMap<u16, Memslot>,
}

impl Memslots {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `slot`, replacing any slot with the same id
    pub fn install(&mut self, slot: Memslot) -> Option<Memslot> {
        self.slots.insert(slot.id, slot)
    }

    pub fn remove(&mut self, id: u16) -> Option<Memslot> {
        self.slots.remove(&id)
    }

    pub fn get(&self, id: u16) -> Option<&Memslot> {
        self.slots.get(&id)
    }

    /// Slot containing `gfn`
    pub fn find(&self, gfn: Gfn) -> Option<&Memslot> {
        self.slots.values().find(|slot| slot.contains(gfn))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Memslot> {
        self.slots.values()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

impl VmMmu {
    /// Check a memslot update before it is applied
    pub fn prepare_memory_region(&self, change: MemslotChange, new: Option<&Memslot>) -> Result<()> {
        if self.is_protected() {
            if matches!(change, MemslotChange::Delete | MemslotChange::Move) && self.pkvm_handle() != 0 {
                return Err(Error::PermissionDenied);
            }
            if new.is_some_and(|slot| {
                slot.flags.intersects(MemslotFlags::LOG_DIRTY_PAGES | MemslotFlags::READONLY)
            }) {
                return Err(Error::PermissionDenied);
            }
        }

        let new = match (change, new) {
            (MemslotChange::Create | MemslotChange::Move | MemslotChange::FlagsOnly, Some(slot)) => slot,
            (MemslotChange::Delete, _) => return Ok(()),
            (_, None) => return Err(Error::InvalidArgument),
        };

        if new.base_gfn + new.npages > self.phys_size() >> new.page_shift {
            return Err(Error::BadAddress);
        }

        let mut hva = new.userspace_addr;
        let reg_end = hva + new.size();
        while hva < reg_end {
            let Some(vma) = self.host().find_vma_intersection(hva, reg_end) else {
                break;
            };

            if self.caps().mte && vma.flags.contains(VmaFlags::SHARED) {
                return Err(Error::InvalidArgument);
            }
            if vma.flags.contains(VmaFlags::PFNMAP) && new.flags.contains(MemslotFlags::LOG_DIRTY_PAGES) {
                return Err(Error::InvalidArgument);
            }
            hva = vma.end;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::mm::host::Vma;
    use crate::core::mm::mmu::tests::Harness;
    use crate::{CpuCaps, Stage2Config};
    use test_case::test_case;

    const SLOT_HVA: Hva = 0x7f00_0000_0000;

    #[test]
    fn test_gfn_translation() {
        let slot = Memslot::new(0, 0x80000, 0x100, SLOT_HVA, MemslotFlags::empty(), 12);

        assert_eq!(slot.base_ipa(), 0x8000_0000);
        assert_eq!(slot.size(), 0x10_0000);
        assert_eq!(slot.gfn_to_hva(0x80010), Some((SLOT_HVA + 0x10000, true)));
        assert_eq!(slot.gfn_to_hva(0x80100), None);
        assert!(!slot.is_logging());

        let ro = Memslot::new(1, 0x90000, 0x10, SLOT_HVA, MemslotFlags::READONLY, 12);
        assert_eq!(ro.gfn_to_hva(0x90000), Some((SLOT_HVA, false)));
    }

    #[test]
    fn test_dirty_log() {
        let slot = Memslot::new(0, 0x80000, 0x100, SLOT_HVA, MemslotFlags::LOG_DIRTY_PAGES, 12);

        assert!(slot.is_logging());
        slot.mark_page_dirty(0x80001);
        slot.mark_page_dirty(0x80041);
        slot.mark_page_dirty(0x90000);
        assert!(slot.is_dirty(0x80001));

        let log = slot.take_dirty_log();
        assert_eq!(log, [0b10, 0b10, 0, 0]);
        assert!(slot.take_dirty_log().iter().all(|w| *w == 0));

        // Read-only slots are never logged
        let ro = Memslot::new(1, 0, 16, 0, MemslotFlags::LOG_DIRTY_PAGES | MemslotFlags::READONLY, 12);
        assert!(!ro.is_logging());
    }

    #[test_case(0x8_0000, 0x7f00_0000_1000, true ; "first block")]
    #[test_case(0x8_0000, 0x7f00_0020_1000, false ; "block past the end")]
    #[test_case(0x8_0001, 0x7f00_0000_1000, false ; "ipa and hva misaligned")]
    fn test_supports_huge_mapping(base_gfn: Gfn, hva: Hva, expected: bool) {
        // 3MiB slot: one full 2MiB block and half of a second one
        let slot = Memslot::new(0, base_gfn, 0x300, SLOT_HVA, MemslotFlags::empty(), 12);
        assert_eq!(slot.supports_huge_mapping(hva, 0x20_0000), expected);
    }

    #[test]
    fn test_memslots_lookup() {
        let mut slots = Memslots::new();
        slots.install(Memslot::new(0, 0x100, 0x10, SLOT_HVA, MemslotFlags::empty(), 12));
        slots.install(Memslot::new(3, 0x200, 0x10, SLOT_HVA + 0x10000, MemslotFlags::empty(), 12));

        assert_eq!(slots.find(0x205).map(|s| s.id), Some(3));
        assert!(slots.find(0x110).is_none());
        assert!(slots.remove(0).is_some());
        assert_eq!(slots.len(), 1);
    }

    #[test]
    fn test_prepare_rejects_slots_beyond_ipa_space() {
        let hx = Harness::new(Stage2Config::default(), CpuCaps::default());
        let beyond = Memslot::new(0, (1 << 28) - 0x10, 0x20, SLOT_HVA, MemslotFlags::empty(), 12);
        let inside = Memslot::new(0, 0x80000, 0x20, SLOT_HVA, MemslotFlags::empty(), 12);

        assert_eq!(hx.vm.prepare_memory_region(MemslotChange::Create, Some(&beyond)), Err(Error::BadAddress));
        assert_eq!(hx.vm.prepare_memory_region(MemslotChange::Create, Some(&inside)), Ok(()));
        assert_eq!(hx.vm.prepare_memory_region(MemslotChange::Delete, None), Ok(()));
    }

    #[test]
    fn test_prepare_vma_rules() {
        let caps = CpuCaps { mte: true, ..CpuCaps::default() };
        let hx = Harness::new(Stage2Config::default(), caps);
        hx.host.add_vma(
            Vma { start: SLOT_HVA, end: SLOT_HVA + 0x10000, pgoff: 0, flags: VmaFlags::SHARED, huge_page_shift: 0 },
            0x1000,
        );
        hx.host.add_vma(
            Vma { start: SLOT_HVA + 0x10000, end: SLOT_HVA + 0x20000, pgoff: 0x9_0000, flags: VmaFlags::PFNMAP, huge_page_shift: 0 },
            0,
        );

        let shared = Memslot::new(0, 0x80000, 0x10, SLOT_HVA, MemslotFlags::empty(), 12);
        assert_eq!(hx.vm.prepare_memory_region(MemslotChange::Create, Some(&shared)), Err(Error::InvalidArgument));

        let mmio_logged = Memslot::new(1, 0x90000, 0x10, SLOT_HVA + 0x10000, MemslotFlags::LOG_DIRTY_PAGES, 12);
        assert_eq!(
            hx.vm.prepare_memory_region(MemslotChange::FlagsOnly, Some(&mmio_logged)),
            Err(Error::InvalidArgument)
        );

        let mmio = Memslot::new(1, 0x90000, 0x10, SLOT_HVA + 0x10000, MemslotFlags::empty(), 12);
        assert_eq!(hx.vm.prepare_memory_region(MemslotChange::Create, Some(&mmio)), Ok(()));
    }

    #[test]
    fn test_prepare_protected_rules() {
        let config = Stage2Config { protected: true, ..Stage2Config::default() };
        let hx = Harness::new(config, CpuCaps::default());
        let logged = Memslot::new(0, 0x80000, 0x10, SLOT_HVA, MemslotFlags::LOG_DIRTY_PAGES, 12);
        let plain = Memslot::new(0, 0x80000, 0x10, SLOT_HVA, MemslotFlags::empty(), 12);

        assert_eq!(hx.vm.prepare_memory_region(MemslotChange::Create, Some(&logged)), Err(Error::PermissionDenied));
        assert_eq!(hx.vm.prepare_memory_region(MemslotChange::Delete, Some(&plain)), Ok(()));

        hx.vm.set_pkvm_handle(0x1000);
        assert_eq!(hx.vm.prepare_memory_region(MemslotChange::Delete, Some(&plain)), Err(Error::PermissionDenied));
        assert_eq!(hx.vm.prepare_memory_region(MemslotChange::Move, Some(&plain)), Err(Error::PermissionDenied));
        assert_eq!(hx.vm.prepare_memory_region(MemslotChange::Create, Some(&plain)), Ok(()));
    }
}
