//! Architecture support
//!
//! Only the ARM64 stage-2 format is implemented. The descriptor code is
//! plain integer manipulation and builds on any host so that it can be
//! tested there; instructions are confined to `utils::barrier`.

pub mod arm64;
