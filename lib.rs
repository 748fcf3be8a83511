//! Ferrovisor stage-2 MMU
//!
//! Guest-physical to host-physical translation for the Ferrovisor ARM64
//! hypervisor: the stage-2 page-table format and generic walker, the table
//! operations built on it, the guest memory abort handler that populates the
//! tables on demand, and the protected-mode ownership bookkeeping used when a
//! more privileged component owns guest memory.

#![no_std]

extern crate alloc;

#[cfg(test)]
#[macro_use]
extern crate std;

// Core modules
#[macro_use]
pub mod utils;
pub mod config;

// Architecture-specific code
pub mod arch;

// Architecture-independent MMU engine
pub mod core;

#[cfg(test)]
mod testutil;

pub use crate::arch::arm64::mmu::{Prot, Stage2Pgtable};
pub use crate::config::{CpuCaps, Granule, Stage2Config};
pub use crate::core::mm::VmMmu;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Common error type
///
/// Variants mirror the status codes exchanged with the host kernel and the
/// privileged side, see [`Error::errno`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Invalid argument (EINVAL)
    InvalidArgument,
    /// Out of memory, top up the memory cache and retry (ENOMEM)
    OutOfMemory,
    /// Not found (ENOENT)
    NotFound,
    /// Permission denied (EPERM)
    PermissionDenied,
    /// Nothing done, a concurrent update won (EAGAIN)
    Again,
    /// Record already exists (EEXIST)
    AlreadyExists,
    /// Bad address (EFAULT)
    BadAddress,
    /// Execution refused (ENOEXEC)
    NoExec,
    /// I/O error (EIO)
    Io,
    /// Address outside the table's input range (ERANGE)
    OutOfRange,
    /// Memory poisoned (EHWPOISON)
    HwPoison,
    /// Hypervisor control plane unavailable (EOPNOTSUPP)
    HypUnavailable,
    /// Table missing or already torn down (ENODEV)
    NotInitialized,
}

impl Error {
    /// Negative Linux errno for this error
    pub const fn errno(self) -> i64 {
        match self {
            Error::InvalidArgument => -22,
            Error::OutOfMemory => -12,
            Error::NotFound => -2,
            Error::PermissionDenied => -1,
            Error::Again => -11,
            Error::AlreadyExists => -17,
            Error::BadAddress => -14,
            Error::NoExec => -8,
            Error::Io => -5,
            Error::OutOfRange => -34,
            Error::HwPoison => -133,
            Error::HypUnavailable => -95,
            Error::NotInitialized => -19,
        }
    }

    /// Map a negative errno back to an error, `None` for success
    ///
    /// Inverse of [`Error::errno`]. Codes no variant produces read as
    /// `InvalidArgument`.
    pub fn from_errno(errno: i64) -> Option<Self> {
        let err = match errno {
            0 => return None,
            -22 => Error::InvalidArgument,
            -12 => Error::OutOfMemory,
            -2 => Error::NotFound,
            -1 => Error::PermissionDenied,
            -11 => Error::Again,
            -17 => Error::AlreadyExists,
            -14 => Error::BadAddress,
            -8 => Error::NoExec,
            -5 => Error::Io,
            -34 => Error::OutOfRange,
            -133 => Error::HwPoison,
            -95 => Error::HypUnavailable,
            -19 => Error::NotInitialized,
            _ => {
                log::debug!("unknown errno {}", errno);
                Error::InvalidArgument
            }
        };
        Some(err)
    }
}

impl ::core::fmt::Display for Error {
    fn fmt(&self, f: &mut ::core::fmt::Formatter<'_>) -> ::core::fmt::Result {
        let msg = match self {
            Error::InvalidArgument => "invalid argument",
            Error::OutOfMemory => "out of memory",
            Error::NotFound => "not found",
            Error::PermissionDenied => "permission denied",
            Error::Again => "try again",
            Error::AlreadyExists => "already exists",
            Error::BadAddress => "bad address",
            Error::NoExec => "exec format error",
            Error::Io => "I/O error",
            Error::OutOfRange => "out of range",
            Error::HwPoison => "memory page has hardware error",
            Error::HypUnavailable => "hypervisor unavailable",
            Error::NotInitialized => "not initialized",
        };
        f.write_str(msg)
    }
}

/// Result type alias
pub type Result<T> = ::core::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn test_errno_mapping() {
        assert_eq!(Error::from_errno(0), None);
        assert_eq!(Error::Again.errno(), -11);
        assert_eq!(Error::from_errno(-4095), Some(Error::InvalidArgument));
    }

    #[test_case(Error::InvalidArgument)]
    #[test_case(Error::OutOfMemory)]
    #[test_case(Error::NotFound)]
    #[test_case(Error::PermissionDenied)]
    #[test_case(Error::Again)]
    #[test_case(Error::AlreadyExists)]
    #[test_case(Error::BadAddress)]
    #[test_case(Error::NoExec)]
    #[test_case(Error::Io)]
    #[test_case(Error::OutOfRange)]
    #[test_case(Error::HwPoison)]
    #[test_case(Error::HypUnavailable)]
    #[test_case(Error::NotInitialized)]
    fn test_errno_reverses(err: Error) {
        assert_eq!(Error::from_errno(err.errno()), Some(err));
    }
}
