//! Typed memory access.
//!
//! Both directions dispatch on the byte width of the primitive type. Only
//! 1, 2, 4 and 8 byte cells exist in registers; the 16 and 32 byte types
//! and `void` are fatal.

use crate::error::EngineError;

use super::primtype::PrimType;
use super::value::MValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Width {
    W1,
    W2,
    W4,
    W8,
}

#[inline]
fn width_of(ty: PrimType) -> Result<Width, EngineError> {
    match ty.width() {
        1 => Ok(Width::W1),
        2 => Ok(Width::W2),
        4 => Ok(Width::W4),
        8 => Ok(Width::W8),
        _ => Err(EngineError::UnsupportedWidth(ty)),
    }
}

/// Reads a `ty` cell at `addr`.
///
/// The raw bits are masked to the type's width; the discriminant carries
/// the signedness.
///
/// # Safety
///
/// `addr` must be valid for reads of `ty.width()` bytes. No alignment is
/// required.
pub unsafe fn load(addr: *const u8, ty: PrimType) -> Result<MValue, EngineError> {
    let bits = unsafe {
        match width_of(ty)? {
            Width::W1 => addr.read() as u64,
            Width::W2 => (addr as *const u16).read_unaligned() as u64,
            Width::W4 => (addr as *const u32).read_unaligned() as u64,
            Width::W8 => (addr as *const u64).read_unaligned(),
        }
    };
    Ok(MValue::from_bits(ty, bits))
}

/// Writes `value` as a `ty` cell at `addr`.
///
/// The value's own type must be `ty` or at least as wide: narrowing
/// stores keep the low bytes, widening through a smaller value is a type
/// mismatch.
///
/// # Safety
///
/// `addr` must be valid for writes of `ty.width()` bytes. No alignment is
/// required.
pub unsafe fn store(addr: *mut u8, ty: PrimType, value: MValue) -> Result<(), EngineError> {
    check_store(ty, value)?;
    let bits = value.to_bits();
    unsafe {
        match width_of(ty)? {
            Width::W1 => addr.write(bits as u8),
            Width::W2 => (addr as *mut u16).write_unaligned(bits as u16),
            Width::W4 => (addr as *mut u32).write_unaligned(bits as u32),
            Width::W8 => (addr as *mut u64).write_unaligned(bits),
        }
    }
    Ok(())
}

/// The store typing rule on its own.
pub fn check_store(ty: PrimType, value: MValue) -> Result<(), EngineError> {
    let found = value.prim_type();
    if found == ty || ty.width() <= found.width() {
        Ok(())
    } else {
        Err(EngineError::TypeMismatch {
            expected: ty,
            found,
        })
    }
}
