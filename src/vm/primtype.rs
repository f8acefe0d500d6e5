//! Primitive types as numbered by the compiler.
//!
//! The byte value of each variant is what appears in instruction `ptyp`
//! fields and in method-header slot tables.

use crate::error::EngineError;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PrimType {
    Void = 1,
    I8 = 2,
    I16 = 3,
    I32 = 4,
    I64 = 5,
    U8 = 6,
    U16 = 7,
    U32 = 8,
    U64 = 9,
    U1 = 10,
    Ptr = 11,
    Ref = 12,
    A32 = 13,
    A64 = 14,
    F32 = 15,
    F64 = 16,
    F128 = 17,
    C64 = 18,
    C128 = 19,
    SimpleStr = 20,
    SimpleObj = 21,
    DynAny = 22,
    DynUndef = 23,
    DynNull = 24,
    DynBool = 25,
    DynI32 = 26,
    DynStr = 27,
    DynObj = 28,
    DynF64 = 29,
    DynF32 = 30,
    DynNone = 31,
}

/// Byte width per primitive type, indexed by the type's numeric value.
/// Zero marks types that have no in-register representation.
const WIDTH: [u8; 32] = [
    0,  // invalid
    0,  // void
    1,  // i8
    2,  // i16
    4,  // i32
    8,  // i64
    1,  // u8
    2,  // u16
    4,  // u32
    8,  // u64
    1,  // u1
    8,  // ptr
    8,  // ref
    4,  // a32
    8,  // a64
    4,  // f32
    8,  // f64
    16, // f128
    16, // c64
    32, // c128
    8,  // simplestr
    8,  // simpleobj
    8,  // dynany
    8,  // dynundef
    8,  // dynnull
    8,  // dynbool
    8,  // dyni32
    8,  // dynstr
    8,  // dynobj
    8,  // dynf64
    8,  // dynf32
    8,  // dynnone
];

impl PrimType {
    pub fn from_u8(byte: u8) -> Result<Self, EngineError> {
        use PrimType::*;
        Ok(match byte {
            1 => Void,
            2 => I8,
            3 => I16,
            4 => I32,
            5 => I64,
            6 => U8,
            7 => U16,
            8 => U32,
            9 => U64,
            10 => U1,
            11 => Ptr,
            12 => Ref,
            13 => A32,
            14 => A64,
            15 => F32,
            16 => F64,
            17 => F128,
            18 => C64,
            19 => C128,
            20 => SimpleStr,
            21 => SimpleObj,
            22 => DynAny,
            23 => DynUndef,
            24 => DynNull,
            25 => DynBool,
            26 => DynI32,
            27 => DynStr,
            28 => DynObj,
            29 => DynF64,
            30 => DynF32,
            31 => DynNone,
            other => return Err(EngineError::UnknownPrimType(other)),
        })
    }

    /// Storage width in bytes; 0 for `void`.
    #[inline(always)]
    pub fn width(self) -> usize {
        WIDTH[self as usize] as usize
    }

    /// Mask selecting the low `width` bytes of a 64-bit payload.
    #[inline]
    pub fn mask(self) -> u64 {
        match self.width() {
            1 => 0xff,
            2 => 0xffff,
            4 => 0xffff_ffff,
            _ => u64::MAX,
        }
    }

    pub fn is_signed_int(self) -> bool {
        matches!(self, PrimType::I8 | PrimType::I16 | PrimType::I32 | PrimType::I64)
    }

    pub fn is_unsigned_int(self) -> bool {
        matches!(
            self,
            PrimType::U1 | PrimType::U8 | PrimType::U16 | PrimType::U32 | PrimType::U64
        )
    }

    pub fn is_int(self) -> bool {
        self.is_signed_int() || self.is_unsigned_int()
    }

    pub fn is_float(self) -> bool {
        matches!(self, PrimType::F32 | PrimType::F64)
    }

    pub fn is_address(self) -> bool {
        matches!(self, PrimType::Ptr | PrimType::Ref | PrimType::A32 | PrimType::A64)
    }

    /// Types owned by the dynamic-mode value representation.
    pub fn is_dynamic(self) -> bool {
        (self as u8) >= PrimType::DynAny as u8
    }

    pub fn name(self) -> &'static str {
        use PrimType::*;
        match self {
            Void => "void",
            I8 => "i8",
            I16 => "i16",
            I32 => "i32",
            I64 => "i64",
            U8 => "u8",
            U16 => "u16",
            U32 => "u32",
            U64 => "u64",
            U1 => "u1",
            Ptr => "ptr",
            Ref => "ref",
            A32 => "a32",
            A64 => "a64",
            F32 => "f32",
            F64 => "f64",
            F128 => "f128",
            C64 => "c64",
            C128 => "c128",
            SimpleStr => "simplestr",
            SimpleObj => "simpleobj",
            DynAny => "dynany",
            DynUndef => "dynundef",
            DynNull => "dynnull",
            DynBool => "dynbool",
            DynI32 => "dyni32",
            DynStr => "dynstr",
            DynObj => "dynobj",
            DynF64 => "dynf64",
            DynF32 => "dynf32",
            DynNone => "dynnone",
        }
    }
}

impl std::fmt::Display for PrimType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_u8_covers_every_variant() {
        for byte in 1..=31u8 {
            let ty = PrimType::from_u8(byte).unwrap();
            assert_eq!(ty as u8, byte);
        }
        assert!(PrimType::from_u8(0).is_err());
        assert!(PrimType::from_u8(32).is_err());
    }

    #[test]
    fn test_widths() {
        assert_eq!(PrimType::U1.width(), 1);
        assert_eq!(PrimType::I16.width(), 2);
        assert_eq!(PrimType::F32.width(), 4);
        assert_eq!(PrimType::A64.width(), 8);
        assert_eq!(PrimType::C128.width(), 32);
        assert_eq!(PrimType::DynStr.width(), 8);
        assert_eq!(PrimType::Void.width(), 0);
    }

    #[test]
    fn test_classes() {
        assert!(PrimType::U1.is_unsigned_int());
        assert!(PrimType::I64.is_signed_int());
        assert!(!PrimType::F64.is_int());
        assert!(PrimType::A32.is_address());
        assert!(PrimType::DynAny.is_dynamic());
        assert!(!PrimType::SimpleObj.is_dynamic());
    }
}
