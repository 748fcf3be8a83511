//! Utility functions and data structures
//!
//! Bit-field helpers shared by the descriptor codecs, power-of-two
//! alignment, memory barriers and the atomic bitmap used for dirty logging.

pub mod bitmap;

pub use self::bitmap::Bitmap;

/// Utility macros
#[macro_export]
macro_rules! align_up {
    ($addr:expr, $align:expr) => {
        (($addr + $align - 1) & !($align - 1))
    };
}

#[macro_export]
macro_rules! align_down {
    ($addr:expr, $align:expr) => {
        ($addr & !($align - 1))
    };
}

#[macro_export]
macro_rules! is_aligned {
    ($addr:expr, $align:expr) => {
        ($addr & ($align - 1)) == 0
    };
}

/// Bits `hi..=lo` set, like the kernel's `GENMASK()`
#[inline]
pub const fn genmask(hi: u32, lo: u32) -> u64 {
    (u64::MAX >> (63 - hi)) & (u64::MAX << lo)
}

/// Single bit
#[inline]
pub const fn bit(n: u32) -> u64 {
    1u64 << n
}

/// Extract the field described by `mask`
#[inline]
pub const fn field_get(mask: u64, val: u64) -> u64 {
    (val & mask) >> mask.trailing_zeros()
}

/// Place `val` in the field described by `mask`
#[inline]
pub const fn field_prep(mask: u64, val: u64) -> u64 {
    (val << mask.trailing_zeros()) & mask
}

/// Memory barriers around descriptor updates
///
/// Real `dsb`/`isb` on aarch64, compiler fences elsewhere so that the
/// table code can be exercised on the build host.
pub mod barrier {
    cfg_if::cfg_if! {
        if #[cfg(target_arch = "aarch64")] {
            use aarch64_cpu::asm::barrier;

            /// Make prior descriptor stores visible to the table walker
            #[inline]
            pub fn dsb_ishst() {
                barrier::dsb(barrier::ISHST);
            }

            /// Complete all prior memory accesses, inner shareable
            #[inline]
            pub fn dsb_ish() {
                barrier::dsb(barrier::ISH);
            }

            /// Synchronize context
            #[inline]
            pub fn isb() {
                barrier::isb(barrier::SY);
            }
        } else {
            use core::sync::atomic::{compiler_fence, Ordering};

            /// Make prior descriptor stores visible to the table walker
            #[inline]
            pub fn dsb_ishst() {
                compiler_fence(Ordering::Release);
            }

            /// Complete all prior memory accesses, inner shareable
            #[inline]
            pub fn dsb_ish() {
                compiler_fence(Ordering::SeqCst);
            }

            /// Synchronize context
            #[inline]
            pub fn isb() {
                compiler_fence(Ordering::SeqCst);
            }
        }
    }
}
