//! Stage-2 abort syndrome decoding for ARM64
//!
//! Decodes the ESR_EL2 value of a guest instruction or data abort into the
//! facts the fault engine works from.
//! Reference: ARM DDI 0487I.a - Chapter D13 - Exception Syndrome Register

use crate::config::Granule;
use crate::utils::{bit, field_get, genmask};
use crate::{Error, Result};

/// ESR_EL2 fields
pub mod esr {
    use super::{bit, genmask};

    /// Exception class
    pub const EC: u64 = genmask(31, 26);
    /// Instruction abort from a lower exception level
    pub const EC_IABT_LOW: u64 = 0x20;
    /// Data abort from a lower exception level
    pub const EC_DABT_LOW: u64 = 0x24;

    /// Fault status code
    pub const FSC: u64 = genmask(5, 0);
    /// Fault type part of the status code
    pub const FSC_TYPE: u64 = 0x3c;
    /// Level part of the status code
    pub const FSC_LEVEL: u64 = 0x03;

    pub const FSC_SIZE: u64 = 0x00;
    pub const FSC_FAULT: u64 = 0x04;
    pub const FSC_ACCESS: u64 = 0x08;
    pub const FSC_PERM: u64 = 0x0c;
    /// Synchronous external abort
    pub const FSC_EXTABT: u64 = 0x10;
    /// Synchronous external abort on a table walk, levels 0-3
    pub const FSC_SEA_TTW0: u64 = 0x14;
    /// Synchronous parity or ECC error
    pub const FSC_SERROR: u64 = 0x18;
    /// Synchronous parity or ECC error on a table walk, levels 0-3
    pub const FSC_SECC_TTW0: u64 = 0x1c;

    /// Write not read
    pub const WNR: u64 = bit(6);
    /// Fault on a stage-1 table walk
    pub const S1PTW: u64 = bit(7);
    /// Cache maintenance operation
    pub const CM: u64 = bit(8);
}

/// Low bits of FAR completing a page-granular IPA
pub const FAR_MASK: u64 = genmask(11, 0);

/// Stage-2 fault types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// IPA beyond the configured output size
    AddressSize,
    /// Missing translation
    Translation,
    /// Access flag clear
    AccessFlag,
    /// Permission fault
    Permission,
    /// Synchronous external abort or memory error
    ExternalAbort,
    /// Anything else, raw status code
    Other(u8),
}

/// A decoded guest abort
#[derive(Debug, Clone, Copy)]
pub struct FaultInfo {
    /// Raw ESR_EL2
    pub esr: u64,
    /// Fault type
    pub kind: FaultKind,
    /// Table level reported by the status code
    pub level: u32,
    /// Faulting IPA, page granular
    pub ipa: u64,
    /// Faulting virtual address
    pub far: u64,
    /// Instruction abort rather than data abort
    pub is_iabt: bool,
    /// Fault on the guest's own table walk
    pub s1ptw: bool,
    /// Data abort caused by a cache maintenance instruction
    pub cm: bool,
    wnr: bool,
}

impl FaultInfo {
    /// Decode an abort taken to EL2
    ///
    /// `ipa` is the page-granular fault address derived from HPFAR_EL2.
    pub fn from_esr(esr: u64, far: u64, ipa: u64) -> Result<Self> {
        let is_iabt = match field_get(esr::EC, esr) {
            esr::EC_IABT_LOW => true,
            esr::EC_DABT_LOW => false,
            ec => {
                log::error!("not a guest abort: EC={:#x} ESR_EL2={:#x}", ec, esr);
                return Err(Error::BadAddress);
            }
        };
        let fsc = esr & esr::FSC;

        Ok(Self {
            esr,
            kind: Self::decode_kind(fsc),
            level: (fsc & esr::FSC_LEVEL) as u32,
            ipa,
            far,
            is_iabt,
            s1ptw: esr & esr::S1PTW != 0,
            cm: !is_iabt && esr & esr::CM != 0,
            wnr: esr & esr::WNR != 0,
        })
    }

    fn decode_kind(fsc: u64) -> FaultKind {
        if fsc == esr::FSC_EXTABT || fsc == esr::FSC_SERROR {
            return FaultKind::ExternalAbort;
        }

        match fsc & esr::FSC_TYPE {
            esr::FSC_SIZE => FaultKind::AddressSize,
            esr::FSC_FAULT => FaultKind::Translation,
            esr::FSC_ACCESS => FaultKind::AccessFlag,
            esr::FSC_PERM => FaultKind::Permission,
            esr::FSC_SEA_TTW0 | esr::FSC_SECC_TTW0 => FaultKind::ExternalAbort,
            _ => FaultKind::Other(fsc as u8),
        }
    }

    /// Whether the guest was fetching an instruction
    pub fn is_exec_fault(&self) -> bool {
        self.is_iabt && !self.s1ptw
    }

    /// Whether the access needs write permission
    ///
    /// A stage-1 walk only counts as a write on a permission fault, so that
    /// guest page tables in read-only memory still fault in read-only.
    pub fn is_write_fault(&self) -> bool {
        if self.s1ptw {
            return self.kind == FaultKind::Permission;
        }
        if self.is_iabt {
            return false;
        }
        self.wnr
    }

    /// Bytes covered by the entry that faulted
    pub fn granule_size(&self, granule: Granule) -> u64 {
        granule.granule_size(self.level)
    }

    /// IPA completed with the page offset from FAR
    pub fn full_ipa(&self) -> u64 {
        self.ipa | (self.far & FAR_MASK)
    }

    /// Human-readable fault description
    pub fn description(&self) -> &'static str {
        match self.kind {
            FaultKind::AddressSize => "address size fault",
            FaultKind::Translation => "translation fault",
            FaultKind::AccessFlag => "access flag fault",
            FaultKind::Permission => "permission fault",
            FaultKind::ExternalAbort => "synchronous external abort",
            FaultKind::Other(_) => "unsupported fault",
        }
    }
}

/// Exception to inject back into the guest
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionInfo {
    /// Address size fault, the IPA is beyond PARange
    SizeFault,
    /// Prefetch abort at `addr`
    PrefetchAbort { addr: u64 },
    /// Data abort at `addr`
    DataAbort { addr: u64 },
    /// Virtual SError for an external abort the host did not handle
    ExternalAbort,
}

/// Read the syndrome of the abort being handled
///
/// Returns ESR_EL2, FAR_EL2 and the page-granular IPA from HPFAR_EL2.
///
/// # Safety
/// Must be called from EL2 while handling a guest abort
#[cfg(target_arch = "aarch64")]
pub unsafe fn read_abort_syndrome() -> (u64, u64, u64) {
    let (esr, far, hpfar): (u64, u64, u64);

    // SAFETY: plain system register reads, guaranteed to be at EL2 by the caller
    unsafe {
        core::arch::asm!("mrs {}, esr_el2", out(reg) esr);
        core::arch::asm!("mrs {}, far_el2", out(reg) far);
        core::arch::asm!("mrs {}, hpfar_el2", out(reg) hpfar);
    }

    (esr, far, (hpfar & genmask(47, 4)) << 8)
}
