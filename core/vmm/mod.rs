//! Virtual machine monitor state consumed by the MMU
//!
//! Only the per-vCPU pieces the fault path needs live here.

pub mod vcpu;

pub use vcpu::Vcpu;

/// VCPU identifier type
pub type VcpuId = u32;
