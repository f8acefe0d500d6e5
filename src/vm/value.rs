//! Static-mode values.
//!
//! [`MValue`] is the typed register view: one variant per primitive type,
//! so reading a payload under the wrong discriminant is impossible. Frame
//! memory is made of [`Slot`]s (raw bits + discriminant) because `addrof`
//! hands out real addresses into frames; converting between the two is an
//! explicit decode/encode step.

use std::fmt;

use super::primtype::PrimType;

/// A typed static-mode value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MValue {
    Void,
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    U1(bool),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    Ptr(u64),
    Ref(u64),
    A32(u32),
    A64(u64),
    F32(f32),
    F64(f64),
    /// Reference-like cells of the string/object and dynamic types, plus the
    /// wide types that only ever pass through untouched.
    Opaque(PrimType, u64),
}

impl MValue {
    pub fn prim_type(&self) -> PrimType {
        match self {
            MValue::Void => PrimType::Void,
            MValue::I8(_) => PrimType::I8,
            MValue::I16(_) => PrimType::I16,
            MValue::I32(_) => PrimType::I32,
            MValue::I64(_) => PrimType::I64,
            MValue::U1(_) => PrimType::U1,
            MValue::U8(_) => PrimType::U8,
            MValue::U16(_) => PrimType::U16,
            MValue::U32(_) => PrimType::U32,
            MValue::U64(_) => PrimType::U64,
            MValue::Ptr(_) => PrimType::Ptr,
            MValue::Ref(_) => PrimType::Ref,
            MValue::A32(_) => PrimType::A32,
            MValue::A64(_) => PrimType::A64,
            MValue::F32(_) => PrimType::F32,
            MValue::F64(_) => PrimType::F64,
            MValue::Opaque(ty, _) => *ty,
        }
    }

    /// Raw payload as it sits in memory: zero-extended from the type's
    /// width, floats as their IEEE bit patterns.
    pub fn to_bits(&self) -> u64 {
        match *self {
            MValue::Void => 0,
            MValue::I8(v) => v as u8 as u64,
            MValue::I16(v) => v as u16 as u64,
            MValue::I32(v) => v as u32 as u64,
            MValue::I64(v) => v as u64,
            MValue::U1(v) => v as u64,
            MValue::U8(v) => v as u64,
            MValue::U16(v) => v as u64,
            MValue::U32(v) => v as u64,
            MValue::U64(v) => v,
            MValue::Ptr(v) | MValue::Ref(v) | MValue::A64(v) => v,
            MValue::A32(v) => v as u64,
            MValue::F32(v) => v.to_bits() as u64,
            MValue::F64(v) => v.to_bits(),
            MValue::Opaque(_, v) => v,
        }
    }

    /// Builds a value of type `ty` from raw bits, keeping only the low
    /// `width(ty)` bytes.
    pub fn from_bits(ty: PrimType, bits: u64) -> MValue {
        match ty {
            PrimType::Void => MValue::Void,
            PrimType::I8 => MValue::I8(bits as u8 as i8),
            PrimType::I16 => MValue::I16(bits as u16 as i16),
            PrimType::I32 => MValue::I32(bits as u32 as i32),
            PrimType::I64 => MValue::I64(bits as i64),
            PrimType::U1 => MValue::U1(bits & 0xff != 0),
            PrimType::U8 => MValue::U8(bits as u8),
            PrimType::U16 => MValue::U16(bits as u16),
            PrimType::U32 => MValue::U32(bits as u32),
            PrimType::U64 => MValue::U64(bits),
            PrimType::Ptr => MValue::Ptr(bits),
            PrimType::Ref => MValue::Ref(bits),
            PrimType::A32 => MValue::A32(bits as u32),
            PrimType::A64 => MValue::A64(bits),
            PrimType::F32 => MValue::F32(f32::from_bits(bits as u32)),
            PrimType::F64 => MValue::F64(f64::from_bits(bits)),
            other => MValue::Opaque(other, bits),
        }
    }

    /// Explicit bit-level reinterpretation under another type.
    ///
    /// The payload is truncated or zero-extended to the new width; no
    /// numeric conversion happens. Callers use this where the instruction,
    /// not the producer, decides how a cell is read.
    #[inline]
    pub fn retag(&self, ty: PrimType) -> MValue {
        if self.prim_type() == ty {
            *self
        } else {
            MValue::from_bits(ty, self.to_bits())
        }
    }

    /// Integer view, sign-extended for signed types.
    pub fn as_i64(&self) -> i64 {
        match *self {
            MValue::I8(v) => v as i64,
            MValue::I16(v) => v as i64,
            MValue::I32(v) => v as i64,
            MValue::I64(v) => v,
            MValue::F32(v) => v as i64,
            MValue::F64(v) => v as i64,
            _ => self.to_bits() as i64,
        }
    }

    /// Address carried by an address-class value.
    pub fn address(&self) -> u64 {
        self.to_bits()
    }

    pub fn is_zero(&self) -> bool {
        self.to_bits() & self.prim_type().mask() == 0
    }
}

impl fmt::Display for MValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            MValue::Void => write!(f, "void"),
            MValue::I8(v) => write!(f, "i8 {}", v),
            MValue::I16(v) => write!(f, "i16 {}", v),
            MValue::I32(v) => write!(f, "i32 {}", v),
            MValue::I64(v) => write!(f, "i64 {}", v),
            MValue::U1(v) => write!(f, "u1 {}", v as u8),
            MValue::U8(v) => write!(f, "u8 {}", v),
            MValue::U16(v) => write!(f, "u16 {}", v),
            MValue::U32(v) => write!(f, "u32 {}", v),
            MValue::U64(v) => write!(f, "u64 {}", v),
            MValue::F32(v) => write!(f, "f32 {}", v),
            MValue::F64(v) => write!(f, "f64 {}", v),
            other => write!(f, "{} {:#x}", other.prim_type(), other.to_bits()),
        }
    }
}

/// A frame cell: raw payload bits followed by the discriminant.
///
/// `bits` comes first so that the address of a slot is the address of its
/// payload.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    pub bits: u64,
    pub ty: PrimType,
}

impl Slot {
    /// Pattern written into the operand-stack base to catch over-pops.
    pub const POISON: u64 = 0xcafe_f00d_dead_beef;

    pub const EMPTY: Slot = Slot {
        bits: 0,
        ty: PrimType::Void,
    };

    pub fn poisoned() -> Slot {
        Slot {
            bits: Self::POISON,
            ty: PrimType::Void,
        }
    }

    #[inline]
    pub fn get(&self) -> MValue {
        MValue::from_bits(self.ty, self.bits)
    }

    #[inline]
    pub fn set(&mut self, value: MValue) {
        self.ty = value.prim_type();
        self.bits = value.to_bits();
    }

    pub fn is_poisoned(&self) -> bool {
        self.ty == PrimType::Void && self.bits == Self::POISON
    }
}

impl From<MValue> for Slot {
    fn from(value: MValue) -> Self {
        Slot {
            bits: value.to_bits(),
            ty: value.prim_type(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bits_round_trip() {
        let values = [
            MValue::I8(-5),
            MValue::I16(-300),
            MValue::I32(i32::MIN),
            MValue::I64(-1),
            MValue::U1(true),
            MValue::U16(65535),
            MValue::A64(0xdead_0000),
            MValue::F32(-1.5),
            MValue::F64(f64::MAX),
        ];
        for v in values {
            assert_eq!(MValue::from_bits(v.prim_type(), v.to_bits()), v);
        }
    }

    #[test]
    fn test_to_bits_is_width_masked() {
        assert_eq!(MValue::I8(-1).to_bits(), 0xff);
        assert_eq!(MValue::I32(-1).to_bits(), 0xffff_ffff);
    }

    #[test]
    fn test_retag_truncates() {
        let v = MValue::I64(0x1_0000_0005);
        assert_eq!(v.retag(PrimType::I32), MValue::I32(5));
        assert_eq!(MValue::I8(-1).retag(PrimType::U32), MValue::U32(0xff));
    }

    #[test]
    fn test_slot_layout_puts_payload_first() {
        let slot = Slot::from(MValue::I32(7));
        let base = &slot as *const Slot as usize;
        let bits = &slot.bits as *const u64 as usize;
        assert_eq!(base, bits);
        assert_eq!(slot.get(), MValue::I32(7));
    }

    #[test]
    fn test_display() {
        assert_eq!(MValue::I32(8).to_string(), "i32 8");
        assert_eq!(MValue::A64(16).to_string(), "a64 0x10");
    }
}
