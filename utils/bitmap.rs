//! Atomic bitmap
//!
//! Backs the per-memslot dirty log: bits are set concurrently from the
//! fault path without the MMU lock and harvested by the VMM.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

/// Bitmap structure
#[derive(Debug)]
pub struct Bitmap {
    /// Bitmap data
    data: Vec<AtomicU64>,
    /// Number of bits
    bits: usize,
}

impl Bitmap {
    /// Create a cleared bitmap of `bits` bits
    pub fn new(bits: usize) -> Self {
        let words = (bits + 63) / 64;
        let mut data = Vec::with_capacity(words);
        data.resize_with(words, || AtomicU64::new(0));
        Self { data, bits }
    }

    /// Get the number of bits
    pub fn bits(&self) -> usize {
        self.bits
    }

    /// Test if a bit is set
    pub fn test(&self, index: usize) -> bool {
        if index >= self.bits {
            return false;
        }
        (self.data[index / 64].load(Ordering::Relaxed) >> (index % 64)) & 1 == 1
    }

    /// Set a bit, returning its previous value
    pub fn set_bit(&self, index: usize) -> bool {
        if index >= self.bits {
            return false;
        }
        let mask = 1u64 << (index % 64);
        self.data[index / 64].fetch_or(mask, Ordering::Relaxed) & mask != 0
    }

    /// Clear a bit, returning its previous value
    pub fn clear_bit(&self, index: usize) -> bool {
        if index >= self.bits {
            return false;
        }
        let mask = 1u64 << (index % 64);
        self.data[index / 64].fetch_and(!mask, Ordering::Relaxed) & mask != 0
    }

    /// Atomically read and clear one 64-bit word
    pub fn take_word(&self, word: usize) -> u64 {
        self.data
            .get(word)
            .map_or(0, |w| w.swap(0, Ordering::Relaxed))
    }

    /// Read one 64-bit word
    pub fn load_word(&self, word: usize) -> u64 {
        self.data.get(word).map_or(0, |w| w.load(Ordering::Relaxed))
    }

    /// Clear the bits of `mask` in one word, returning those that were set
    pub fn clear_mask(&self, word: usize, mask: u64) -> u64 {
        self.data
            .get(word)
            .map_or(0, |w| w.fetch_and(!mask, Ordering::Relaxed) & mask)
    }

    /// Number of 64-bit words
    pub fn words(&self) -> usize {
        self.data.len()
    }

    /// Count the number of set bits
    pub fn count_ones(&self) -> usize {
        self.data
            .iter()
            .map(|w| w.load(Ordering::Relaxed).count_ones() as usize)
            .sum()
    }

    /// Check if no bits are set
    pub fn none(&self) -> bool {
        self.count_ones() == 0
    }

    /// Set all bits
    pub fn set_all(&self) {
        for (i, word) in self.data.iter().enumerate() {
            let remaining = self.bits - i * 64;
            let value = if remaining >= 64 { u64::MAX } else { (1u64 << remaining) - 1 };
            word.store(value, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_and_take() {
        let bm = Bitmap::new(130);
        assert_eq!(bm.words(), 3);
        assert!(!bm.set_bit(3));
        assert!(bm.set_bit(3));
        bm.set_bit(129);
        assert!(bm.test(129));
        assert_eq!(bm.count_ones(), 2);
        assert_eq!(bm.take_word(0), 1 << 3);
        assert!(!bm.test(3));
        assert!(!bm.set_bit(200));
    }

    #[test]
    fn test_clear_mask() {
        let bm = Bitmap::new(64);
        bm.set_bit(1);
        bm.set_bit(5);
        assert_eq!(bm.clear_mask(0, 0b110), 0b10);
        assert_eq!(bm.load_word(0), 1 << 5);
        assert_eq!(bm.clear_mask(4, u64::MAX), 0);
    }

    #[test]
    fn test_set_all_respects_length() {
        let bm = Bitmap::new(70);
        bm.set_all();
        assert_eq!(bm.count_ones(), 70);
        assert!(bm.clear_bit(69));
        assert_eq!(bm.count_ones(), 69);
    }
}
