//! Shared utilities for the dynamic method subsystem: identity newtypes,
//! synchronization re-exports, bit-set macros and alignment helpers.
#[macro_use]
mod macros;
pub mod newtypes;
pub mod sync;

pub use newtypes::{CodeAddr, MethodSlot, ModuleId, RegionId, TableId};

pub const WORD_SIZE: usize = std::mem::size_of::<usize>();

/// Rounds `value` up to the next multiple of `align`, which must be a power of two.
/// Returns `None` on overflow.
#[inline]
pub fn align_up(value: usize, align: usize) -> Option<usize> {
    debug_assert!(align.is_power_of_two());
    let mask = align - 1;
    value.checked_add(mask).map(|v| v & !mask)
}

#[inline]
pub fn is_aligned(value: usize, align: usize) -> bool {
    value & (align - 1) == 0
}

#[cfg(feature = "memory-validation")]
pub fn validate_alignment(addr: CodeAddr, align: usize) {
    if !is_aligned(addr.as_usize(), align) {
        panic!("Alignment violation: address {} is not aligned to {}", addr, align);
    }
}

#[cfg(not(feature = "memory-validation"))]
#[inline(always)]
pub fn validate_alignment(_addr: CodeAddr, _align: usize) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 16), Some(0));
        assert_eq!(align_up(1, 16), Some(16));
        assert_eq!(align_up(16, 16), Some(16));
        assert_eq!(align_up(17, 8), Some(24));
        assert_eq!(align_up(usize::MAX, 8), None);
    }

    #[test]
    fn test_is_aligned() {
        assert!(is_aligned(64, 64));
        assert!(!is_aligned(72, 64));
        assert!(is_aligned(72, 8));
    }
}
