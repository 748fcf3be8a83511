//! Dirty page logging
//!
//! When logging starts on a memslot its whole range is write-protected.
//! The first write to each page then takes a permission fault, which maps
//! the page writable again and records it in the slot's dirty bitmap.
//! Harvesting the bitmap write-protects the reported pages for the next
//! round.

use super::memslot::{Memslot, MemslotChange, MemslotFlags};
use super::mmu::{StateGuard, VmMmu};
use crate::{Error, Result};
use alloc::vec::Vec;

impl VmMmu {
    /// Write-protect `[start, end)`, dropping the lock between chunks
    fn stage2_wp_range<'a>(&'a self, guard: StateGuard<'a>, start: u64, end: u64) -> (StateGuard<'a>, Result<()>) {
        self.apply_range(guard, start, end, true, |pgt, addr, size| pgt.wrprotect(addr, size))
    }

    fn flush_tlb_locked(&self, guard: &StateGuard<'_>) -> Result<()> {
        match guard.pgt.as_ref() {
            Some(pgt) => pgt.tlb_flush_vmid(),
            None => Ok(()),
        }
    }

    /// Write-protect the pages of `slot` selected by one bitmap word
    ///
    /// Covers the pages from the lowest to the highest bit set in `mask`,
    /// including the clear ones in between.
    fn wp_masked_locked<'a>(
        &'a self,
        guard: StateGuard<'a>,
        slot: &Memslot,
        gfn_offset: u64,
        mask: u64,
    ) -> (StateGuard<'a>, Result<()>) {
        if mask == 0 {
            return (guard, Ok(()));
        }

        let base_gfn = slot.base_gfn + gfn_offset;
        let start = (base_gfn + u64::from(mask.trailing_zeros())) << self.page_shift();
        let end = (base_gfn + 64 - u64::from(mask.leading_zeros())) << self.page_shift();

        self.stage2_wp_range(guard, start, end)
    }

    /// Write-protect every mapping of a memslot
    pub fn wp_memory_region(&self, slot_id: u16) -> Result<()> {
        let memslots = self.memslots.read();
        let slot = memslots.get(slot_id).ok_or(Error::NotFound)?;
        let start = slot.base_ipa();

        let guard = self.state.write();
        let (guard, ret) = self.stage2_wp_range(guard, start, start + slot.size());
        let flushed = self.flush_tlb_locked(&guard);
        drop(guard);

        log::debug!("memslot {}: write-protected {:#x}..{:#x}", slot_id, start, start + slot.size());
        ret.and(flushed)
    }

    /// Write-protect the pages of a memslot selected by `mask`
    ///
    /// `gfn_offset` is the slot-relative frame of bit 0.
    pub fn write_protect_masked(&self, slot_id: u16, gfn_offset: u64, mask: u64) -> Result<()> {
        let memslots = self.memslots.read();
        let slot = memslots.get(slot_id).ok_or(Error::NotFound)?;

        let guard = self.state.write();
        let (guard, ret) = self.wp_masked_locked(guard, slot, gfn_offset, mask);
        let flushed = self.flush_tlb_locked(&guard);
        drop(guard);

        ret.and(flushed)
    }

    /// Re-arm dirty tracking for the pages selected by `mask`
    pub fn enable_log_dirty_pt_masked(&self, slot_id: u16, gfn_offset: u64, mask: u64) -> Result<()> {
        self.write_protect_masked(slot_id, gfn_offset, mask)
    }

    /// Finish a memslot update after the slot set changed
    ///
    /// Turning logging on write-protects the slot, unless the VMM protects
    /// pages itself, in which case every page starts out dirty.
    pub fn commit_memory_region(&self, change: MemslotChange, slot_id: u16) -> Result<()> {
        if change == MemslotChange::Delete {
            return Ok(());
        }

        {
            let memslots = self.memslots.read();
            let slot = memslots.get(slot_id).ok_or(Error::NotFound)?;

            if !slot.flags.contains(MemslotFlags::LOG_DIRTY_PAGES) {
                return Ok(());
            }
            if self.config.dirty_log_manual_protect {
                slot.set_all_dirty();
                return Ok(());
            }
        }

        self.wp_memory_region(slot_id)
    }

    /// Report the pages of a memslot written since the last call
    ///
    /// Returns one word per 64 pages. Unless the VMM protects pages itself,
    /// the bits are cleared and the reported pages write-protected.
    pub fn get_dirty_log(&self, slot_id: u16) -> Result<Vec<u64>> {
        let memslots = self.memslots.read();
        let slot = memslots.get(slot_id).ok_or(Error::NotFound)?;

        if !slot.flags.contains(MemslotFlags::LOG_DIRTY_PAGES) {
            return Err(Error::NotFound);
        }
        if self.config.dirty_log_manual_protect {
            return Ok(slot.dirty_log());
        }

        let words = slot.take_dirty_log();
        if words.iter().all(|word| *word == 0) {
            return Ok(words);
        }

        let mut guard = self.state.write();
        let mut ret = Ok(());
        for (idx, mask) in words.iter().enumerate() {
            let (next, wp) = self.wp_masked_locked(guard, slot, idx as u64 * 64, *mask);
            guard = next;
            if let Err(err) = wp {
                ret = Err(err);
                break;
            }
        }
        let flushed = self.flush_tlb_locked(&guard);
        drop(guard);

        ret.and(flushed).map(|_| words)
    }

    /// Clear dirty bits the VMM has harvested and write-protect those pages
    ///
    /// Only for VMMs that protect pages themselves. `gfn_offset` must be a
    /// multiple of 64.
    pub fn clear_dirty_log(&self, slot_id: u16, gfn_offset: u64, mask: u64) -> Result<()> {
        if !self.config.dirty_log_manual_protect || gfn_offset % 64 != 0 {
            return Err(Error::InvalidArgument);
        }

        let memslots = self.memslots.read();
        let slot = memslots.get(slot_id).ok_or(Error::NotFound)?;
        if gfn_offset >= slot.npages {
            return Err(Error::InvalidArgument);
        }

        let cleared = slot.clear_dirty((gfn_offset / 64) as usize, mask);
        if cleared == 0 {
            return Ok(());
        }

        let guard = self.state.write();
        let (guard, ret) = self.wp_masked_locked(guard, slot, gfn_offset, cleared);
        let flushed = self.flush_tlb_locked(&guard);
        drop(guard);

        ret.and(flushed)
    }
}
