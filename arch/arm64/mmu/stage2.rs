//! Stage-2 descriptor format for ARM64
//!
//! Encoding and decoding of VMSAv8-64 stage-2 table, block and page
//! descriptors, plus the geometry of the concatenated root table.
//! Reference: ARM DDI 0487I.a, D8.3 Translation table descriptor formats

use crate::config::Granule;
use crate::core::mm::PhysAddr;
use crate::utils::{bit, field_get, field_prep, genmask};

/// A raw stage-2 descriptor
pub type Pte = u64;

/// Deepest supported table hierarchy
pub const MAX_LEVELS: u32 = 4;

/// Level holding page descriptors
pub const LAST_LEVEL: u32 = MAX_LEVELS - 1;

/// Descriptor bits and masks shared by all levels
pub mod pte {
    use super::{bit, genmask};

    /// Valid bit (bit 0)
    pub const VALID: u64 = bit(0);

    /// Type bit (bit 1): table at levels 0-2, page at level 3
    pub const TYPE: u64 = bit(1);
    pub const TYPE_BLOCK: u64 = 0;
    pub const TYPE_PAGE: u64 = 1;
    pub const TYPE_TABLE: u64 = 1;

    /// PA bits [51:48] with the 64KB granule
    pub const ADDR_51_48: u64 = genmask(15, 12);

    /// Lower leaf attributes
    pub const ATTR_LO: u64 = genmask(11, 2);

    /// Upper leaf attributes
    pub const ATTR_HI: u64 = genmask(63, 51);

    /// Software-defined bits
    pub const ATTR_HI_SW: u64 = genmask(58, 55);

    /// Every leaf attribute bit
    pub const ATTR: u64 = ATTR_LO | ATTR_HI;
}

/// Stage-2 specific leaf attributes
pub mod s2 {
    use super::{bit, genmask};

    /// Memory attributes (bits [5:2])
    pub const MEMATTR: u64 = genmask(5, 2);

    /// Stage-2 read permission (bit 6)
    pub const S2AP_R: u64 = bit(6);

    /// Stage-2 write permission (bit 7)
    pub const S2AP_W: u64 = bit(7);

    /// Shareability (bits [9:8])
    pub const SH: u64 = genmask(9, 8);
    pub const SH_IS: u64 = 3;

    /// Access flag (bit 10)
    pub const AF: u64 = bit(10);

    /// Execute-never field (bits [54:53])
    pub const XN: u64 = genmask(54, 53);
    pub const XN_PXN: u64 = 1;
    pub const XN_XN: u64 = 2;
    pub const XN_UXN: u64 = 3;

    /// Bits a permission update may touch
    pub const PERMS: u64 = S2AP_R | S2AP_W | XN;
}

/// Stage-2 MemAttr values
pub mod memattr {
    /// Device-nGnRE
    pub const DEVICE_NGNRE: u64 = 0x1;
    /// Normal, inner/outer non-cacheable
    pub const NORMAL_NC: u64 = 0x5;
    /// Normal, inner/outer write-back
    pub const NORMAL: u64 = 0xf;
    /// Normal write-back when FWB reinterprets MemAttr
    pub const FWB_NORMAL: u64 = 0x6;
}

/// Output address bits carried directly in the descriptor
#[inline]
pub const fn addr_mask(granule: Granule) -> u64 {
    genmask(47, granule.page_shift())
}

/// Descriptor valid bit
#[inline]
pub const fn pte_valid(pte: Pte) -> bool {
    pte & pte::VALID != 0
}

/// Whether `pte` points to a next-level table
///
/// Level 3 descriptors are always pages.
#[inline]
pub const fn pte_is_table(pte: Pte, level: u32) -> bool {
    if level == LAST_LEVEL || !pte_valid(pte) {
        return false;
    }
    field_get(pte::TYPE, pte) == pte::TYPE_TABLE
}

/// Output address of a descriptor
pub const fn pte_to_phys(pte: Pte, granule: Granule) -> PhysAddr {
    let mut pa = pte & addr_mask(granule);

    if granule.page_shift() == 16 {
        pa |= field_get(pte::ADDR_51_48, pte) << 48;
    }
    pa
}

/// Place a physical address in descriptor layout
pub const fn phys_to_pte(pa: PhysAddr, granule: Granule) -> Pte {
    let mut pte = pa & addr_mask(granule);

    if granule.page_shift() == 16 {
        pte |= field_prep(pte::ADDR_51_48, pa >> 48);
    }
    pte
}

/// Table descriptor pointing at `pa`
pub const fn init_table(pa: PhysAddr, granule: Granule) -> Pte {
    phys_to_pte(pa, granule) | field_prep(pte::TYPE, pte::TYPE_TABLE) | pte::VALID
}

/// Valid block (levels 0-2) or page (level 3) descriptor
pub const fn init_valid_leaf(pa: PhysAddr, attr: u64, level: u32, granule: Granule) -> Pte {
    let ty = if level == LAST_LEVEL { pte::TYPE_PAGE } else { pte::TYPE_BLOCK };

    phys_to_pte(pa, granule) | (attr & pte::ATTR) | field_prep(pte::TYPE, ty) | pte::VALID
}

/// Leaf attributes of a descriptor
#[inline]
pub const fn pte_attr(pte: Pte) -> u64 {
    pte & pte::ATTR
}

/// Index of `addr` in the table at `level`
#[inline]
pub const fn pte_index(addr: u64, level: u32, granule: Granule) -> usize {
    ((addr >> granule.granule_shift(level as i32)) as usize) & (granule.ptrs_per_table() - 1)
}

/// Bits of input address resolved by a root page at `start_level`
#[inline]
const fn root_span_shift(start_level: u32, granule: Granule) -> u32 {
    granule.granule_shift(start_level as i32) + granule.page_shift() - 3
}

/// Concatenated root page that translates `addr`
pub const fn pgd_index(addr: u64, ia_bits: u32, start_level: u32, granule: Granule) -> usize {
    let mask = if ia_bits >= 64 { u64::MAX } else { bit(ia_bits) - 1 };
    ((addr & mask) >> root_span_shift(start_level, granule)) as usize
}

/// Number of concatenated root pages
pub const fn pgd_pages(ia_bits: u32, start_level: u32, granule: Granule) -> usize {
    pgd_index(u64::MAX, ia_bits, start_level, granule) + 1
}

/// Whether a block of `level` granularity may map `[addr, end)` to `phys`
///
/// An invalid `phys` means the entry carries an annotation, only the input
/// side needs to be aligned then.
pub fn block_mapping_supported(addr: u64, end: u64, phys: Option<PhysAddr>, level: u32, granule: Granule) -> bool {
    let size = granule.granule_size(level);

    if !granule.level_supports_block(level) {
        return false;
    }
    if size > end - addr {
        return false;
    }
    if let Some(pa) = phys {
        if !is_aligned!(pa, size) {
            return false;
        }
    }
    is_aligned!(addr, size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn test_leaf_type_bit() {
        let g = Granule::Size4K;
        let attr = s2::S2AP_R | s2::AF;

        let page = init_valid_leaf(0x8000_1000, attr, 3, g);
        assert_eq!(page & pte::TYPE, pte::TYPE);
        assert!(!pte_is_table(page, 3));

        let block = init_valid_leaf(0x8020_0000, attr, 2, g);
        assert_eq!(block & pte::TYPE, 0);
        assert!(!pte_is_table(block, 2));
        assert_eq!(pte_to_phys(block, g), 0x8020_0000);
        assert_eq!(pte_attr(block), attr);
    }

    #[test]
    fn test_table_descriptor() {
        let g = Granule::Size4K;
        let table = init_table(0x4_0000_3000, g);

        assert!(pte_is_table(table, 0));
        assert!(pte_is_table(table, 2));
        assert!(!pte_is_table(table, 3));
        assert!(!pte_is_table(table & !pte::VALID, 1));
        assert_eq!(pte_to_phys(table, g), 0x4_0000_3000);
    }

    #[test]
    fn test_52bit_pa_with_64k_granule() {
        let g = Granule::Size64K;
        let pa = 0x000f_1234_5678_0000;
        let pte = phys_to_pte(pa, g);

        assert_eq!(pte & pte::ADDR_51_48, 0xf << 12);
        assert_eq!(pte_to_phys(pte, g), pa);
        assert_eq!(pte_to_phys(pte, Granule::Size4K), pa & genmask(47, 12) | 0xf000);
    }

    #[test_case(40, 1, Granule::Size4K, 2 ; "40 bit ipa concatenates two level 1 tables")]
    #[test_case(48, 0, Granule::Size4K, 1 ; "48 bit ipa single level 0 table")]
    #[test_case(42, 2, Granule::Size64K, 1 ; "42 bit ipa single 64k root")]
    #[test_case(36, 1, Granule::Size4K, 1 ; "36 bit ipa single level 1 table")]
    fn test_pgd_pages(ia_bits: u32, start_level: u32, granule: Granule, pages: usize) {
        assert_eq!(pgd_pages(ia_bits, start_level, granule), pages);
    }

    #[test]
    fn test_pgd_index() {
        let g = Granule::Size4K;
        assert_eq!(pgd_index(0x0, 40, 1, g), 0);
        assert_eq!(pgd_index(0x7f_ffff_ffff, 40, 1, g), 0);
        assert_eq!(pgd_index(0xff_ffff_ffff, 40, 1, g), 1);
        assert_eq!(pte_index(0x80_4020_1000, 1, g), 1);
        assert_eq!(pte_index(0x80_4020_1000, 2, g), 1);
        assert_eq!(pte_index(0x80_4020_1000, 3, g), 1);
    }

    #[test]
    fn test_block_mapping_supported() {
        let g = Granule::Size4K;
        let two_mb = 0x20_0000;

        assert!(block_mapping_supported(0, two_mb, Some(two_mb), 2, g));
        assert!(!block_mapping_supported(0, two_mb, Some(0x1000), 2, g));
        assert!(!block_mapping_supported(0x1000, two_mb + 0x1000, Some(two_mb), 2, g));
        assert!(!block_mapping_supported(0, two_mb - 0x1000, None, 2, g));
        assert!(block_mapping_supported(0, two_mb, None, 2, g));
        assert!(!block_mapping_supported(0, 1 << 39, None, 0, g));
        assert!(block_mapping_supported(0x1000, 0x2000, Some(0x3000), 3, g));
    }
}
