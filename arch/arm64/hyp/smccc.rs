//! SMCCC (SMC Calling Convention) host calls for ARM64
//!
//! Function identifiers and result decoding for the calls the host makes
//! into the EL2 hypervisor over HVC.
//! Reference: ARM DEN 0028A - SMC Calling Convention

use crate::{Error, Result};

/// SMCCC fast call bit
pub const SMCCC_FAST_CALL: u32 = 0x8000_0000;

/// SMCCC standard call bit
pub const SMCCC_STD_CALL: u32 = 0x0000_0000;

/// SMCCC 64-bit calling convention
pub const SMCCC_CALL_CONV_64: u32 = 0x4000_0000;

/// SMCCC 32-bit calling convention
pub const SMCCC_CALL_CONV_32: u32 = 0x0000_0000;

/// Owner field shift
pub const SMCCC_OWNER_SHIFT: u32 = 24;

/// Owner field mask (bits [29:24])
pub const SMCCC_OWNER_MASK: u32 = 0x3F;

/// Function number mask
pub const SMCCC_FUNC_MASK: u32 = 0xFFFF;

/// Call completed
pub const SMCCC_RET_SUCCESS: u64 = 0;

/// Call not supported
pub const SMCCC_RET_NOT_SUPPORTED: u64 = u64::MAX;

/// SMCCC service owner
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SmcccOwner {
    /// Arm Architecture calls
    Arch = 0x00,
    /// CPU service calls
    Cpu = 0x01,
    /// SIP service calls
    Sip = 0x02,
    /// OEM service calls
    Oem = 0x03,
    /// Standard secure service calls
    Standard = 0x04,
    /// Standard hypervisor service calls
    StandardHyp = 0x05,
    /// Vendor specific hypervisor calls
    VendorHyp = 0x06,
}

/// Build a function identifier
pub const fn smccc_call_val(fast: bool, conv64: bool, owner: SmcccOwner, func: u32) -> u32 {
    let call_type = if fast { SMCCC_FAST_CALL } else { SMCCC_STD_CALL };
    let conv = if conv64 { SMCCC_CALL_CONV_64 } else { SMCCC_CALL_CONV_32 };

    call_type | conv | ((owner as u32 & SMCCC_OWNER_MASK) << SMCCC_OWNER_SHIFT) | (func & SMCCC_FUNC_MASK)
}

/// Host calls into the hypervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum HostHcall {
    /// Invalidate all stage-1 and stage-2 TLB entries of all VMIDs
    FlushVmContext = 8,
    /// Invalidate stage-2 entries for one IPA
    TlbFlushVmidIpa = 9,
    /// Invalidate all entries of one VMID
    TlbFlushVmid = 10,
    /// Share a host page with the hypervisor
    HostShareHyp = 18,
    /// Revoke a page previously shared with the hypervisor
    HostUnshareHyp = 19,
    /// Donate a host page to the loaded protected guest
    HostMapGuest = 20,
    /// Begin destroying a protected VM
    StartTeardownVm = 28,
    /// Finish destroying a protected VM, returning its metadata pages
    FinalizeTeardownVm = 29,
    /// Take back a page of a VM being torn down
    ReclaimDyingGuestPage = 30,
}

impl HostHcall {
    /// SMCCC function identifier of this call
    pub const fn func_id(self) -> u32 {
        smccc_call_val(true, true, SmcccOwner::VendorHyp, self as u32)
    }

    /// Decode a function identifier
    pub fn from_func_id(id: u32) -> Option<Self> {
        if id & !SMCCC_FUNC_MASK != Self::FlushVmContext.func_id() & !SMCCC_FUNC_MASK {
            return None;
        }
        let call = match id & SMCCC_FUNC_MASK {
            8 => Self::FlushVmContext,
            9 => Self::TlbFlushVmidIpa,
            10 => Self::TlbFlushVmid,
            18 => Self::HostShareHyp,
            19 => Self::HostUnshareHyp,
            20 => Self::HostMapGuest,
            28 => Self::StartTeardownVm,
            29 => Self::FinalizeTeardownVm,
            30 => Self::ReclaimDyingGuestPage,
            _ => return None,
        };
        Some(call)
    }
}

/// Registers returned by an SMCCC call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SmcccRes {
    pub a0: u64,
    pub a1: u64,
    pub a2: u64,
    pub a3: u64,
}

impl SmcccRes {
    /// Result of a call that completed with status `ret`
    pub const fn with_status(ret: i64) -> Self {
        Self {
            a0: SMCCC_RET_SUCCESS,
            a1: ret as u64,
            a2: 0,
            a3: 0,
        }
    }

    /// Check if the call was dispatched
    pub fn is_success(&self) -> bool {
        self.a0 == SMCCC_RET_SUCCESS
    }

    /// Decode the status of a host call
    ///
    /// A failure to dispatch means the hypervisor is gone; the status in
    /// `a1` is an errno otherwise.
    pub fn into_result(self, call: HostHcall) -> Result<()> {
        if !self.is_success() {
            log::error!("{:?}: hypervisor call failed with {:#x}", call, self.a0);
            return Err(Error::HypUnavailable);
        }

        match Error::from_errno(self.a1 as i64) {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }
}
