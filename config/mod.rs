//! Configuration management
//!
//! Per-VM stage-2 configuration and the system-wide CPU capabilities the
//! MMU consults when building and populating stage-2 tables.

use crate::{Error, Result};
use bitflags::bitflags;

/// Smallest IPA size a VM may ask for
pub const MIN_PARANGE_BITS: u32 = 32;

/// IPA size used when the VMM does not ask for one
pub const DEFAULT_IPA_BITS: u32 = 40;

/// Translation granule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Granule {
    /// 4KB pages
    Size4K,
    /// 16KB pages
    Size16K,
    /// 64KB pages
    Size64K,
}

impl Granule {
    /// log2 of the page size
    pub const fn page_shift(self) -> u32 {
        match self {
            Granule::Size4K => 12,
            Granule::Size16K => 14,
            Granule::Size64K => 16,
        }
    }

    /// Page size in bytes
    pub const fn page_size(self) -> u64 {
        1 << self.page_shift()
    }

    /// Descriptors per table page
    pub const fn ptrs_per_table(self) -> usize {
        1 << (self.page_shift() - 3)
    }

    /// Address bits resolved by the input address at `level`
    ///
    /// Level may be -1 when computing the span of a concatenated root.
    pub const fn granule_shift(self, level: i32) -> u32 {
        ((self.page_shift() as i32 - 3) * (4 - level) + 3) as u32
    }

    /// Bytes mapped by one entry at `level`
    pub const fn granule_size(self, level: u32) -> u64 {
        1 << self.granule_shift(level as i32)
    }

    /// Shallowest level that may hold a block mapping
    pub const fn min_block_level(self) -> u32 {
        match self {
            Granule::Size4K => 1,
            _ => 2,
        }
    }

    /// Whether `level` may hold a block (or page) mapping
    pub const fn level_supports_block(self, level: u32) -> bool {
        level >= self.min_block_level()
    }

    /// Shift of a level 2 block
    pub const fn pmd_shift(self) -> u32 {
        self.granule_shift(2)
    }

    /// Shift of a level 1 block
    pub const fn pud_shift(self) -> u32 {
        self.granule_shift(1)
    }

    /// Shift of a run of pages sharing the contiguous hint
    pub const fn cont_pte_shift(self) -> u32 {
        let ptes: u32 = match self {
            Granule::Size4K => 4,
            Granule::Size16K => 7,
            Granule::Size64K => 5,
        };
        self.page_shift() + ptes
    }

    /// Shift of a run of level 2 blocks sharing the contiguous hint
    pub const fn cont_pmd_shift(self) -> u32 {
        let pmds: u32 = match self {
            Granule::Size4K => 4,
            Granule::Size16K | Granule::Size64K => 5,
        };
        self.pmd_shift() + pmds
    }
}

bitflags! {
    /// Stage-2 page-table flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Stage2Flags: u32 {
        /// Don't enforce Normal-WB even if the CPUs have stage-2 FWB
        const NOFWB = 1 << 0;
        /// Only use identity mappings
        const IDMAP = 1 << 1;
    }
}

/// System-wide CPU capabilities
#[derive(Debug, Clone, Copy)]
pub struct CpuCaps {
    /// Sanitised PARange in bits, the largest IPA any VM may use
    pub ipa_limit: u32,
    /// Stage-2 forced write-back
    pub stage2_fwb: bool,
    /// I-cache invalidation not required for data to instruction coherence
    pub cache_dic: bool,
    /// Memory tagging enabled for guests
    pub mte: bool,
}

impl Default for CpuCaps {
    fn default() -> Self {
        Self {
            ipa_limit: 48,
            stage2_fwb: false,
            cache_dic: false,
            mte: false,
        }
    }
}

/// Stage-2 configuration for one VM
#[derive(Debug, Clone, Copy)]
pub struct Stage2Config {
    /// Requested IPA size in bits, 0 for the default
    pub ipa_bits: u32,
    /// Translation granule
    pub granule: Granule,
    /// Stage-2 flags
    pub flags: Stage2Flags,
    /// Guest memory is owned by the privileged side
    pub protected: bool,
    /// The guest is a protected VM whose memory the host cannot access
    pub pvm: bool,
    /// The VMM write-protects dirty pages itself (manual protect, initially all set)
    pub dirty_log_manual_protect: bool,
}

impl Default for Stage2Config {
    fn default() -> Self {
        Self {
            ipa_bits: 0,
            granule: Granule::Size4K,
            flags: Stage2Flags::empty(),
            protected: false,
            pvm: false,
            dirty_log_manual_protect: false,
        }
    }
}

impl Stage2Config {
    /// Resolve the IPA size for this VM against the CPU limit
    pub fn validate(&self, caps: &CpuCaps) -> Result<u32> {
        if self.protected {
            return Ok(caps.ipa_limit);
        }

        if self.ipa_bits != 0 {
            if self.ipa_bits > caps.ipa_limit || self.ipa_bits < MIN_PARANGE_BITS {
                return Err(Error::InvalidArgument);
            }
            return Ok(self.ipa_bits);
        }

        if DEFAULT_IPA_BITS > caps.ipa_limit {
            log::warn!("using unsupported default IPA limit, upgrade your VMM");
            return Err(Error::InvalidArgument);
        }

        Ok(DEFAULT_IPA_BITS)
    }
}
