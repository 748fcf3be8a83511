//! ARM64 (AArch64) Architecture Support for Ferrovisor
//!
//! This module provides the ARM64 pieces of the stage-2 MMU:
//! - Stage-2 descriptor format, attributes and the table walker
//! - VTCR_EL2/VTTBR_EL2 geometry for a VM's translation regime
//! - Stage-2 abort syndrome decoding
//! - The host-to-hypervisor call ABI used for TLB maintenance and, in
//!   protected mode, page ownership transfer
//!
//! ## References
//! - [ARM Architecture Reference Manual ARMv8-A](https://developer.arm.com/documentation/ddi0487/latest)
//! - [SMC Calling Convention](https://developer.arm.com/documentation/den0028/latest)

pub mod hyp;
pub mod mmu;

/// ARM64 architecture version
pub const ARCH_VERSION: &str = "arm64";

/// Largest physical address width the descriptor format can carry
pub const PA_WIDTH: u32 = 52;
