//! Core hypervisor modules
//!
//! Architecture-independent half of the stage-2 MMU: the VM-level memory
//! management engine, the vCPU state it consumes, and locking.

pub mod mm;
pub mod sync;
pub mod vmm;
