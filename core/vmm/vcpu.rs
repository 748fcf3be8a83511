//! Virtual CPU memory caches
//!
//! Each vCPU carries the page pools its faults are resolved from, so that
//! no allocation happens with the MMU lock held.

use super::VcpuId;
use crate::core::mm::memcache::HypMemCache;
use crate::core::mm::{MemCache, VmMmu};

/// Virtual CPU
#[derive(Debug)]
pub struct Vcpu {
    id: VcpuId,
    /// Table pages for the host-managed stage-2 table
    pub mmu_page_cache: MemCache,
    /// Pages donated to the hypervisor, protected mode only
    pub hyp_memcache: HypMemCache,
}

impl Vcpu {
    pub fn new(id: VcpuId) -> Self {
        Self { id, mmu_page_cache: MemCache::new(), hyp_memcache: HypMemCache::new() }
    }

    pub fn id(&self) -> VcpuId {
        self.id
    }

    /// Release unused cache pages, the vCPU is being destroyed
    pub fn free_caches(&mut self, vm: &VmMmu) {
        self.mmu_page_cache.free(&**vm.mm_ops());
        vm.free_hyp_memcache(&mut self.hyp_memcache);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::mm::mmu::tests::Harness;

    #[test]
    fn test_free_caches() {
        let hx = Harness::default();
        let mut vcpu = Vcpu::new(3);

        vcpu.mmu_page_cache.topup(&*hx.mm, 2).unwrap();
        assert!(!vcpu.mmu_page_cache.is_empty());

        vcpu.free_caches(&hx.vm);
        assert!(vcpu.mmu_page_cache.is_empty());
        assert_eq!(vcpu.id(), 3);
        hx.finish(vcpu);
    }
}
