//! Memory Management Unit for ARM64
//!
//! Stage-2 translation: descriptor format, the generic walker, the table
//! operations built on it and the abort syndrome decoding that feeds the
//! fault engine.

/// Stage-2 descriptor format
pub mod stage2;

/// Generic table walker
pub mod walker;

/// Stage-2 table operations
pub mod operations;

/// VTTBR_EL2 and the stage-2 MMU context
pub mod vttbr;

/// VTCR_EL2 configuration
pub mod vtcr;

/// Memory attributes
pub mod attrs;

/// Guest abort syndrome decoding
pub mod fault;

// Re-export commonly used types
pub use attrs::Prot;
pub use fault::{ExceptionInfo, FaultInfo, FaultKind};
pub use operations::Stage2Pgtable;
pub use stage2::Pte;
pub use vtcr::Vtcr;
pub use vttbr::S2Mmu;
pub use walker::{Pgtable, VisitCtx, Visitor, WalkFlags};
