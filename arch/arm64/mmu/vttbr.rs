//! VTTBR_EL2 management for ARM64
//!
//! The stage-2 MMU context of a VM: its VMID, its translation control and
//! the root of its tables. TLB maintenance is addressed by this context.
//! Reference: ARM DDI 0487I.a, D13.2.131 VTTBR_EL2

use super::vtcr::Vtcr;
use crate::core::mm::PhysAddr;
use crate::utils::{field_get, field_prep, genmask};

/// VMID field (bits [63:48])
pub const VTTBR_VMID_MASK: u64 = genmask(63, 48);

/// Translation table base address (bits [47:1])
pub const VTTBR_BADDR_MASK: u64 = genmask(47, 1);

/// Common-not-private bit
pub const VTTBR_CNP_BIT: u64 = 1;

/// Create VTTBR_EL2 value from VMID and table base address
pub const fn make_vttbr(vmid: u16, baddr: PhysAddr) -> u64 {
    field_prep(VTTBR_VMID_MASK, vmid as u64) | (baddr & VTTBR_BADDR_MASK)
}

/// Extract VMID from VTTBR_EL2 value
pub const fn extract_vmid(vttbr: u64) -> u16 {
    field_get(VTTBR_VMID_MASK, vttbr) as u16
}

/// Extract table base address from VTTBR_EL2 value
pub const fn extract_baddr(vttbr: u64) -> PhysAddr {
    vttbr & VTTBR_BADDR_MASK
}

/// Stage-2 MMU context of one VM
#[derive(Debug, Clone, Copy)]
pub struct S2Mmu {
    /// Virtual machine identifier
    pub vmid: u16,
    /// Translation control
    pub vtcr: Vtcr,
    /// Root table, zero until the table is allocated
    pub pgd_phys: PhysAddr,
}

impl S2Mmu {
    /// Create a context without a root table
    pub fn new(vmid: u16, vtcr: Vtcr) -> Self {
        Self { vmid, vtcr, pgd_phys: 0 }
    }

    /// VTTBR_EL2 value to load when running this VM
    pub fn vttbr(&self) -> u64 {
        make_vttbr(self.vmid, self.pgd_phys)
    }
}
