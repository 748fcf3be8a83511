//! Memory attributes for ARM64 stage-2
//!
//! Translation between the architecture-neutral protection flags used by the
//! table operations and the stage-2 leaf attribute bits.

use super::stage2::{memattr, pte, s2, Pte};
use crate::utils::{field_get, field_prep};
use crate::{Error, Result};
use bitflags::bitflags;

bitflags! {
    /// Page-table protection bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Prot: u64 {
        /// Execute permission
        const X = 1 << 0;
        /// Write permission
        const W = 1 << 1;
        /// Read permission
        const R = 1 << 2;
        /// Device attributes
        const DEVICE = 1 << 3;
        /// Normal non-cacheable attributes
        const NC = 1 << 4;
        /// Privileged execute-never
        const PXN = 1 << 5;
        /// Unprivileged execute-never
        const UXN = 1 << 6;
        /// Software bits, stored in the descriptor untouched
        const SW0 = 1 << 55;
        const SW1 = 1 << 56;
        const SW2 = 1 << 57;
        const SW3 = 1 << 58;
        /// Elastic translation range operation
        const RANGEOP = 1 << 63;

        const RW = Self::R.bits() | Self::W.bits();
        const RWX = Self::RW.bits() | Self::X.bits();
    }
}

impl Prot {
    /// Software bit mask
    pub const SW: Prot = Prot::SW0.union(Prot::SW1).union(Prot::SW2).union(Prot::SW3);
}

/// Default memory protection for host stage-2 in protected mode
pub const PKVM_HOST_MEM_PROT: Prot = Prot::RWX;

/// Default MMIO protection for host stage-2 in protected mode
pub const PKVM_HOST_MMIO_PROT: Prot = Prot::RW;

/// Memory types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryType {
    /// Device-nGnRE
    Device,
    /// Normal memory, write-back
    Normal,
    /// Normal memory, non-cacheable
    NormalNC,
}

impl MemoryType {
    /// MemAttr field value
    pub const fn memattr(self, fwb: bool) -> u64 {
        match self {
            MemoryType::Device => memattr::DEVICE_NGNRE,
            MemoryType::NormalNC => memattr::NORMAL_NC,
            MemoryType::Normal if fwb => memattr::FWB_NORMAL,
            MemoryType::Normal => memattr::NORMAL,
        }
    }
}

/// Build the leaf attributes for `prot`
///
/// Device memory can be neither executable nor non-cacheable.
pub fn stage2_set_prot_attr(prot: Prot, fwb: bool) -> Result<u64> {
    let device = prot.contains(Prot::DEVICE);
    let mem = match (device, prot.contains(Prot::NC)) {
        (true, true) => return Err(Error::InvalidArgument),
        (true, false) => MemoryType::Device,
        (false, true) => MemoryType::NormalNC,
        (false, false) => MemoryType::Normal,
    };
    let mut attr = field_prep(s2::MEMATTR, mem.memattr(fwb));

    if !prot.contains(Prot::X) {
        attr |= field_prep(s2::XN, s2::XN_XN);
    } else if device {
        return Err(Error::InvalidArgument);
    } else if prot.contains(Prot::PXN) {
        attr |= field_prep(s2::XN, s2::XN_PXN);
    } else if prot.contains(Prot::UXN) {
        attr |= field_prep(s2::XN, s2::XN_UXN);
    }

    if prot.contains(Prot::R) {
        attr |= s2::S2AP_R;
    }
    if prot.contains(Prot::W) {
        attr |= s2::S2AP_W;
    }

    attr |= field_prep(s2::SH, s2::SH_IS);
    attr |= s2::AF;
    attr |= prot.bits() & pte::ATTR_HI_SW;

    Ok(attr)
}

/// Recover the protection of a leaf
pub fn stage2_pte_prot(pte: Pte) -> Prot {
    let mut prot = Prot::from_bits_truncate(pte & pte::ATTR_HI_SW);

    if !super::stage2::pte_valid(pte) {
        return prot;
    }
    if pte & s2::S2AP_R != 0 {
        prot |= Prot::R;
    }
    if pte & s2::S2AP_W != 0 {
        prot |= Prot::W;
    }
    match field_get(s2::XN, pte) {
        0 => prot |= Prot::X,
        s2::XN_PXN => prot |= Prot::X | Prot::PXN,
        s2::XN_UXN => prot |= Prot::X | Prot::UXN,
        _ => {}
    }
    match field_get(s2::MEMATTR, pte) {
        memattr::DEVICE_NGNRE => prot |= Prot::DEVICE,
        memattr::NORMAL_NC => prot |= Prot::NC,
        _ => {}
    }
    prot
}

/// Whether a leaf maps write-back cacheable memory
pub fn stage2_pte_cacheable(pte: Pte, fwb: bool) -> bool {
    field_get(s2::MEMATTR, pte) == MemoryType::Normal.memattr(fwb)
}

/// Whether a leaf is executable at some exception level
pub fn stage2_pte_executable(pte: Pte) -> bool {
    field_get(s2::XN, pte) != s2::XN_XN
}

/// Default attributes of a host stage-2 memory page
pub fn host_s2_mem_attr(fwb: bool) -> u64 {
    field_prep(s2::MEMATTR, MemoryType::Normal.memattr(fwb))
        | s2::S2AP_R
        | s2::S2AP_W
        | s2::AF
        | field_prep(s2::SH, s2::SH_IS)
}

/// Default attributes of a host stage-2 MMIO page
pub fn host_s2_mmio_attr(fwb: bool) -> u64 {
    host_s2_mem_attr(fwb) | field_prep(s2::XN, s2::XN_XN)
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn test_device_rejects_exec_and_nc() {
        assert_eq!(stage2_set_prot_attr(Prot::R | Prot::DEVICE | Prot::X, false), Err(Error::InvalidArgument));
        assert_eq!(stage2_set_prot_attr(Prot::R | Prot::DEVICE | Prot::NC, false), Err(Error::InvalidArgument));
        assert!(stage2_set_prot_attr(Prot::RW | Prot::DEVICE, false).is_ok());
    }

    #[test]
    fn test_normal_attr_bits() {
        let attr = stage2_set_prot_attr(Prot::RW, false).unwrap();

        assert_eq!(field_get(s2::MEMATTR, attr), memattr::NORMAL);
        assert_eq!(field_get(s2::XN, attr), s2::XN_XN);
        assert_eq!(field_get(s2::SH, attr), s2::SH_IS);
        assert_ne!(attr & s2::AF, 0);
        assert_eq!(attr & (s2::S2AP_R | s2::S2AP_W), s2::S2AP_R | s2::S2AP_W);
        assert_eq!(attr, host_s2_mmio_attr(false));

        let fwb = stage2_set_prot_attr(Prot::RWX, true).unwrap();
        assert_eq!(field_get(s2::MEMATTR, fwb), memattr::FWB_NORMAL);
        assert_eq!(field_get(s2::XN, fwb), 0);
        assert_eq!(fwb, host_s2_mem_attr(true));
    }

    #[test_case(Prot::R ; "read only")]
    #[test_case(Prot::RW ; "read write")]
    #[test_case(Prot::RWX ; "read write exec")]
    #[test_case(Prot::R | Prot::X | Prot::PXN ; "user exec only")]
    #[test_case(Prot::R | Prot::X | Prot::UXN ; "kernel exec only")]
    #[test_case(Prot::RW | Prot::DEVICE ; "device")]
    #[test_case(Prot::RW | Prot::NC | Prot::SW1 ; "non cacheable with sw bit")]
    fn test_pte_prot_inverts_attr(prot: Prot) {
        let attr = stage2_set_prot_attr(prot, false).unwrap();
        let leaf = attr | pte::VALID;

        assert_eq!(stage2_pte_prot(leaf), prot);
    }

    #[test]
    fn test_cacheable_and_executable() {
        let normal = stage2_set_prot_attr(Prot::RWX, false).unwrap();
        let device = stage2_set_prot_attr(Prot::RW | Prot::DEVICE, false).unwrap();

        assert!(stage2_pte_cacheable(normal, false));
        assert!(!stage2_pte_cacheable(normal, true));
        assert!(!stage2_pte_cacheable(device, false));
        assert!(stage2_pte_executable(normal));
        assert!(!stage2_pte_executable(device));
    }
}
