//! Host-to-hypervisor calls
//!
//! Stage-2 TLB maintenance always goes through EL2. In protected mode the
//! hypervisor also owns guest memory, and page ownership moves across this
//! boundary with the share/unshare/map-guest calls.

pub mod smccc;

pub use smccc::{HostHcall, SmcccRes};

use super::mmu::vttbr::S2Mmu;
use crate::core::mm::{Gfn, PhysAddr, Pfn};
use crate::Result;
use alloc::sync::Arc;

/// Conduit used to issue a host call
pub trait HvcTransport: Send + Sync {
    /// Issue `func_id` with up to three arguments
    fn hvc(&self, func_id: u32, args: [u64; 3]) -> SmcccRes;
}

/// HVC #0 from EL1
#[cfg(target_arch = "aarch64")]
#[derive(Debug, Default)]
pub struct Hvc;

#[cfg(target_arch = "aarch64")]
impl HvcTransport for Hvc {
    fn hvc(&self, func_id: u32, args: [u64; 3]) -> SmcccRes {
        let (a0, a1, a2, a3): (u64, u64, u64, u64);

        // SAFETY: the SMCCC ABI clobbers x0-x17 only, the hypervisor does
        // not touch host memory outside the buffers passed by address.
        unsafe {
            core::arch::asm!(
                "hvc #0",
                inout("x0") u64::from(func_id) => a0,
                inout("x1") args[0] => a1,
                inout("x2") args[1] => a2,
                inout("x3") args[2] => a3,
                out("x4") _, out("x5") _, out("x6") _, out("x7") _,
                out("x8") _, out("x9") _, out("x10") _, out("x11") _,
                out("x12") _, out("x13") _, out("x14") _, out("x15") _,
                out("x16") _, out("x17") _,
                options(nostack),
            );
        }

        SmcccRes { a0, a1, a2, a3 }
    }
}

/// Typed host calls
#[derive(Clone)]
pub struct HypCalls {
    transport: Arc<dyn HvcTransport>,
}

impl HypCalls {
    /// Wrap a transport
    pub fn new(transport: Arc<dyn HvcTransport>) -> Self {
        Self { transport }
    }

    fn call(&self, call: HostHcall, args: [u64; 3]) -> Result<()> {
        self.transport.hvc(call.func_id(), args).into_result(call)
    }

    /// Invalidate every guest TLB entry on all CPUs
    pub fn flush_vm_context(&self) -> Result<()> {
        self.call(HostHcall::FlushVmContext, [0; 3])
    }

    /// Invalidate the stage-2 entry for `ipa` of a table `level` mapping
    pub fn tlb_flush_vmid_ipa(&self, mmu: &S2Mmu, ipa: u64, level: u32) -> Result<()> {
        self.call(HostHcall::TlbFlushVmidIpa, [mmu.vttbr(), ipa, u64::from(level)])
    }

    /// Invalidate every entry tagged with the VMID of `mmu`
    pub fn tlb_flush_vmid(&self, mmu: &S2Mmu) -> Result<()> {
        self.call(HostHcall::TlbFlushVmid, [mmu.vttbr(), 0, 0])
    }

    /// Share a host page with the hypervisor
    pub fn host_share_hyp(&self, pfn: Pfn) -> Result<()> {
        self.call(HostHcall::HostShareHyp, [pfn, 0, 0])
    }

    /// Revoke a page shared with the hypervisor
    pub fn host_unshare_hyp(&self, pfn: Pfn) -> Result<()> {
        self.call(HostHcall::HostUnshareHyp, [pfn, 0, 0])
    }

    /// Donate `pfn` to the protected guest loaded on this CPU at `gfn`
    pub fn host_map_guest(&self, pfn: Pfn, gfn: Gfn) -> Result<()> {
        self.call(HostHcall::HostMapGuest, [pfn, gfn, 0])
    }

    /// Begin tearing down a protected VM
    pub fn start_teardown_vm(&self, handle: u64) -> Result<()> {
        self.call(HostHcall::StartTeardownVm, [handle, 0, 0])
    }

    /// Finish tearing down a protected VM
    pub fn finalize_teardown_vm(&self, handle: u64) -> Result<()> {
        self.call(HostHcall::FinalizeTeardownVm, [handle, 0, 0])
    }

    /// Reclaim `pfn`, mapped at `ipa` in a dying VM
    pub fn reclaim_dying_guest_page(&self, handle: u64, pfn: Pfn, ipa: PhysAddr) -> Result<()> {
        self.call(HostHcall::ReclaimDyingGuestPage, [handle, pfn, ipa])
    }
}

impl core::fmt::Debug for HypCalls {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HypCalls").finish_non_exhaustive()
    }
}
