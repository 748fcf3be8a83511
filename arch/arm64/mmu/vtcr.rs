//! VTCR_EL2 configuration for ARM64
//!
//! Derives the stage-2 translation geometry of a VM (input size, number of
//! levels, starting level) and the VTCR_EL2 image describing it.
//! Reference: ARM DDI 0487I.a, D13.2.130 VTCR_EL2

use super::stage2::MAX_LEVELS;
use crate::config::Granule;
use crate::{Error, Result};
use tock_registers::{register_bitfields, LocalRegisterCopy};

register_bitfields![u64,
    pub VTCR_EL2 [
        /// Size offset of the memory region addressed by VTTBR_EL2
        T0SZ OFFSET(0) NUMBITS(6) [],
        /// Starting level of the stage-2 walk
        SL0 OFFSET(6) NUMBITS(2) [],
        /// Inner cacheability for table walks
        IRGN0 OFFSET(8) NUMBITS(2) [
            NonCacheable = 0b00,
            WriteBackWriteAlloc = 0b01,
            WriteThrough = 0b10,
            WriteBackNoWriteAlloc = 0b11
        ],
        /// Outer cacheability for table walks
        ORGN0 OFFSET(10) NUMBITS(2) [
            NonCacheable = 0b00,
            WriteBackWriteAlloc = 0b01,
            WriteThrough = 0b10,
            WriteBackNoWriteAlloc = 0b11
        ],
        /// Shareability for table walks
        SH0 OFFSET(12) NUMBITS(2) [
            None = 0b00,
            Outer = 0b10,
            Inner = 0b11
        ],
        /// Granule size
        TG0 OFFSET(14) NUMBITS(2) [
            Granule4KB = 0b00,
            Granule64KB = 0b01,
            Granule16KB = 0b10
        ],
        /// Physical address size
        PS OFFSET(16) NUMBITS(3) [],
        /// 16-bit VMID
        VS OFFSET(19) NUMBITS(1) [],
        /// Reserved, RES1
        RES1 OFFSET(31) NUMBITS(1) []
    ]
];

/// PS field encoding for a physical address size
fn ps_from_bits(bits: u32) -> Result<u64> {
    let ps = match bits {
        32 => 0,
        36 => 1,
        40 => 2,
        42 => 3,
        44 => 4,
        48 => 5,
        52 => 6,
        _ => return Err(Error::InvalidArgument),
    };
    Ok(ps)
}

/// Base that SL0 is counted down from
const fn tgran_sl0_base(granule: Granule) -> u32 {
    match granule {
        Granule::Size4K => 2,
        _ => 3,
    }
}

/// Number of stage-2 levels needed to translate `ipa_bits`
///
/// Concatenating up to 16 tables at the first level saves one level, which
/// is where the 4 extra bits come from. At least two levels are needed.
pub const fn stage2_levels(ipa_bits: u32, granule: Granule) -> u32 {
    let levels = (ipa_bits - 8) / (granule.page_shift() - 3);

    if levels < 2 {
        2
    } else if levels > MAX_LEVELS {
        MAX_LEVELS
    } else {
        levels
    }
}

/// A VM's VTCR_EL2 value
#[derive(Clone, Copy)]
pub struct Vtcr {
    reg: LocalRegisterCopy<u64, VTCR_EL2::Register>,
    granule: Granule,
}

impl Vtcr {
    /// Compute VTCR_EL2 for an IPA size
    ///
    /// `pa_bits` is the sanitised PARange the table walker may output.
    pub fn new(ipa_bits: u32, granule: Granule, pa_bits: u32) -> Result<Self> {
        let levels = stage2_levels(ipa_bits, granule);
        let start_level = MAX_LEVELS - levels;
        let sl0 = tgran_sl0_base(granule)
            .checked_sub(start_level)
            .ok_or(Error::InvalidArgument)?;

        let tg0 = match granule {
            Granule::Size4K => VTCR_EL2::TG0::Granule4KB,
            Granule::Size16K => VTCR_EL2::TG0::Granule16KB,
            Granule::Size64K => VTCR_EL2::TG0::Granule64KB,
        };

        let mut reg = LocalRegisterCopy::new(0);
        reg.write(
            VTCR_EL2::T0SZ.val(u64::from(64 - ipa_bits))
                + VTCR_EL2::SL0.val(u64::from(sl0))
                + VTCR_EL2::IRGN0::WriteBackWriteAlloc
                + VTCR_EL2::ORGN0::WriteBackWriteAlloc
                + VTCR_EL2::SH0::Inner
                + tg0
                + VTCR_EL2::PS.val(ps_from_bits(pa_bits)?)
                + VTCR_EL2::RES1::SET,
        );

        Ok(Self { reg, granule })
    }

    /// Raw register value
    pub fn value(&self) -> u64 {
        self.reg.get()
    }

    /// Translation granule
    pub fn granule(&self) -> Granule {
        self.granule
    }

    /// Input address size in bits
    pub fn ia_bits(&self) -> u32 {
        64 - self.reg.read(VTCR_EL2::T0SZ) as u32
    }

    /// Level the hardware walk starts at
    pub fn start_level(&self) -> u32 {
        tgran_sl0_base(self.granule) - self.reg.read(VTCR_EL2::SL0) as u32
    }

    /// Number of levels walked
    pub fn levels(&self) -> u32 {
        MAX_LEVELS - self.start_level()
    }

    /// Table pages a single map may need to allocate
    pub fn mmu_cache_min_pages(&self) -> usize {
        self.levels() as usize - 1
    }
}

impl core::fmt::Debug for Vtcr {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Vtcr")
            .field("value", &format_args!("{:#x}", self.value()))
            .field("granule", &self.granule)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(40, Granule::Size4K, 3, 1, 1 ; "40 bit 4k")]
    #[test_case(48, Granule::Size4K, 4, 0, 2 ; "48 bit 4k")]
    #[test_case(32, Granule::Size4K, 2, 2, 0 ; "32 bit 4k")]
    #[test_case(36, Granule::Size16K, 2, 2, 1 ; "36 bit 16k")]
    #[test_case(48, Granule::Size64K, 3, 1, 2 ; "48 bit 64k")]
    fn test_geometry(ipa: u32, granule: Granule, levels: u32, start: u32, sl0: u64) {
        let vtcr = Vtcr::new(ipa, granule, 48).unwrap();

        assert_eq!(vtcr.levels(), levels);
        assert_eq!(vtcr.start_level(), start);
        assert_eq!(vtcr.ia_bits(), ipa);
        assert_eq!((vtcr.value() >> 6) & 3, sl0);
        assert_eq!(vtcr.mmu_cache_min_pages(), levels as usize - 1);
    }

    #[test]
    fn test_register_fields() {
        let vtcr = Vtcr::new(40, Granule::Size64K, 44).unwrap();
        let value = vtcr.value();

        assert_eq!(value & 0x3f, 24);
        assert_eq!((value >> 14) & 3, 0b01);
        assert_eq!((value >> 16) & 7, 4);
        assert_eq!((value >> 12) & 3, 0b11);
        assert_ne!(value & (1 << 31), 0);
    }

    #[test]
    fn test_bad_pa_size() {
        assert!(Vtcr::new(40, Granule::Size4K, 46).is_err());
    }
}
