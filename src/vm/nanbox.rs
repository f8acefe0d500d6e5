//! Dynamic-mode NaN-boxed values.
//!
//! A cell is either a real IEEE-754 double or a boxed `(tag, payload)` pair:
//!
//! ```text
//!  63  62        52 51  48 47                                         0
//! +---+------------+------+--------------------------------------------+
//! | 0 | 1111111111 | tag  |                  payload                   |
//! +---+------------+------+--------------------------------------------+
//! ```
//!
//! Every pattern with the exponent bits all set is boxed; everything else
//! is a double. NaN and the infinities therefore never appear as raw
//! doubles: they are canonicalised into the `Nan` and `Infinity` tags.
//! Positive zero is `Number 0`; negative zero is the IEEE `-0.0` pattern.

use std::fmt;

const NAN_BASE: u64 = 0x7ff0;
const EXP_MASK: u64 = 0x7ff0_0000_0000_0000;
const TYPE_MASK: u64 = 0x7fff_0000_0000_0000;
const SIGN_BIT: u64 = 0x8000_0000_0000_0000;
const NEEDRC_MASK: u64 = 0x7ffc_0000_0000_0000;
const NEEDRC_BITS: u64 = 0x7ff4_0000_0000_0000;

/// Low 48 bits of a boxed cell.
pub const PAYLOAD_MASK: u64 = 0x0000_ffff_ffff_ffff;

/// Bit pattern poisoning the base of a dynamic operand stack.
pub const DYN_POISON: u64 = 0x7ff9_f00d_dead_beef;

/// Type tags of boxed cells, plus the distinguished `Double`.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JsTag {
    Infinity = 0,
    Null = 1,
    Boolean = 2,
    Number = 3,
    String = 4,
    Object = 5,
    Env = 6,
    Unknown = 8,
    Undefined = 9,
    None = 10,
    Nan = 11,
    SpBase = 12,
    FpBase = 13,
    GpBase = 14,
    Function = 15,
    Double = 16,
}

impl JsTag {
    fn from_nibble(nibble: u64) -> JsTag {
        match nibble {
            0 => JsTag::Infinity,
            1 => JsTag::Null,
            2 => JsTag::Boolean,
            3 => JsTag::Number,
            4 => JsTag::String,
            5 => JsTag::Object,
            6 => JsTag::Env,
            9 => JsTag::Undefined,
            10 => JsTag::None,
            11 => JsTag::Nan,
            12 => JsTag::SpBase,
            13 => JsTag::FpBase,
            14 => JsTag::GpBase,
            15 => JsTag::Function,
            // 7 is unassigned
            _ => JsTag::Unknown,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            JsTag::Infinity => "infinity",
            JsTag::Null => "null",
            JsTag::Boolean => "boolean",
            JsTag::Number => "number",
            JsTag::String => "string",
            JsTag::Object => "object",
            JsTag::Env => "env",
            JsTag::Unknown => "unknown",
            JsTag::Undefined => "undefined",
            JsTag::None => "none",
            JsTag::Nan => "nan",
            JsTag::SpBase => "spbase",
            JsTag::FpBase => "fpbase",
            JsTag::GpBase => "gpbase",
            JsTag::Function => "function",
            JsTag::Double => "double",
        }
    }
}

/// A NaN-boxed dynamic-mode cell.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct JsValue(u64);

impl JsValue {
    pub const UNDEFINED: JsValue = JsValue::boxed(JsTag::Undefined, 0);
    pub const NULL: JsValue = JsValue::boxed(JsTag::Null, 0);
    pub const NONE: JsValue = JsValue::boxed(JsTag::None, 0);
    pub const NAN: JsValue = JsValue::boxed(JsTag::Nan, 0);
    pub const TRUE: JsValue = JsValue::boxed(JsTag::Boolean, 1);
    pub const FALSE: JsValue = JsValue::boxed(JsTag::Boolean, 0);
    pub const POS_ZERO: JsValue = JsValue::boxed(JsTag::Number, 0);
    pub const NEG_ZERO: JsValue = JsValue(SIGN_BIT);
    pub const POS_INFINITY: JsValue = JsValue::boxed(JsTag::Infinity, 0);
    pub const NEG_INFINITY: JsValue = JsValue::boxed(JsTag::Infinity, 1);

    /// Encodes `(tag, payload)`. `tag` must not be `Double`; use
    /// [`JsValue::double`] for real doubles.
    pub const fn boxed(tag: JsTag, payload: u64) -> JsValue {
        JsValue(((NAN_BASE | tag as u64) << 48) | (payload & PAYLOAD_MASK))
    }

    /// Encodes a generic `(tag, payload)` pair; `Double` takes the payload as
    /// raw f64 bits.
    pub fn encode(tag: JsTag, payload: u64) -> JsValue {
        match tag {
            JsTag::Double => JsValue::double(f64::from_bits(payload)),
            _ => JsValue::boxed(tag, payload),
        }
    }

    /// Splits a cell into its tag and payload. Doubles yield their raw bits.
    #[inline]
    pub fn decode(self) -> (JsTag, u64) {
        (self.tag(), self.payload())
    }

    #[inline(always)]
    pub const fn from_raw(bits: u64) -> JsValue {
        JsValue(bits)
    }

    #[inline(always)]
    pub const fn raw(self) -> u64 {
        self.0
    }

    #[inline(always)]
    pub fn is_double(self) -> bool {
        self.0 & EXP_MASK != EXP_MASK
    }

    #[inline]
    pub fn tag(self) -> JsTag {
        if self.is_double() {
            JsTag::Double
        } else if self.0 & SIGN_BIT != 0 {
            JsTag::Unknown
        } else {
            JsTag::from_nibble((self.0 >> 48) & 0xf)
        }
    }

    #[inline]
    pub fn payload(self) -> u64 {
        if self.is_double() {
            self.0
        } else {
            self.0 & PAYLOAD_MASK
        }
    }

    /// Canonical projection handed to library routines: the tag drawn from
    /// [`JsTag`] (with `Double` for real doubles) and the decoded payload.
    /// `None` stays `None`.
    pub fn to_generic(self) -> (JsTag, u64) {
        self.decode()
    }

    pub fn number(v: i32) -> JsValue {
        JsValue::boxed(JsTag::Number, v as i64 as u64)
    }

    pub fn boolean(v: bool) -> JsValue {
        if v { JsValue::TRUE } else { JsValue::FALSE }
    }

    /// A double cell. NaN and the infinities become their tags; every other
    /// value, zeros included, keeps its IEEE pattern.
    pub fn double(v: f64) -> JsValue {
        if v.is_nan() {
            JsValue::NAN
        } else if v.is_infinite() {
            if v > 0.0 {
                JsValue::POS_INFINITY
            } else {
                JsValue::NEG_INFINITY
            }
        } else {
            JsValue(v.to_bits())
        }
    }

    pub fn string(handle: u32) -> JsValue {
        JsValue::boxed(JsTag::String, handle as u64)
    }

    pub fn object(handle: u32) -> JsValue {
        JsValue::boxed(JsTag::Object, handle as u64)
    }

    pub fn function(offset: u32) -> JsValue {
        JsValue::boxed(JsTag::Function, offset as u64)
    }

    pub fn is_number(self) -> bool {
        self.0 & TYPE_MASK == (NAN_BASE | JsTag::Number as u64) << 48
    }

    pub fn is_boolean(self) -> bool {
        self.0 & TYPE_MASK == (NAN_BASE | JsTag::Boolean as u64) << 48
    }

    pub fn is_none(self) -> bool {
        self.0 & TYPE_MASK == (NAN_BASE | JsTag::None as u64) << 48
    }

    /// True for strings, objects and environments, the reference-counted
    /// cells.
    #[inline(always)]
    pub fn needs_rc(self) -> bool {
        self.0 & NEEDRC_MASK == NEEDRC_BITS
    }

    /// Payload of a `Number` or `Boolean` cell read as `i32`.
    ///
    /// Precondition: the cell is a `Number` or `Boolean`. The low 32 bits of
    /// the payload carry the value.
    #[inline(always)]
    pub fn as_i32(self) -> i32 {
        self.0 as u32 as i32
    }

    /// Payload of a double cell.
    ///
    /// Precondition: `is_double()`.
    #[inline(always)]
    pub fn as_f64(self) -> f64 {
        f64::from_bits(self.0)
    }

    /// Heap handle of a reference-counted cell.
    pub fn handle(self) -> u32 {
        self.payload() as u32
    }

    /// Integral numeric value of a numeric cell, when it has one.
    pub fn to_f64(self) -> Option<f64> {
        match self.tag() {
            JsTag::Number => Some(self.as_i32() as f64),
            JsTag::Double => Some(self.as_f64()),
            JsTag::Nan => Some(f64::NAN),
            JsTag::Infinity => Some(if self.payload() == 0 {
                f64::INFINITY
            } else {
                f64::NEG_INFINITY
            }),
            _ => None,
        }
    }

    pub fn is_pos_zero(self) -> bool {
        self == JsValue::POS_ZERO
    }

    pub fn is_neg_zero(self) -> bool {
        self == JsValue::NEG_ZERO
    }
}

impl fmt::Debug for JsValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.tag() {
            JsTag::Double => write!(f, "Double({:?})", self.as_f64()),
            JsTag::Number => write!(f, "Number({})", self.as_i32()),
            tag => write!(f, "{}({:#x})", tag.name(), self.payload()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TAGS: [JsTag; 15] = [
        JsTag::Infinity,
        JsTag::Null,
        JsTag::Boolean,
        JsTag::Number,
        JsTag::String,
        JsTag::Object,
        JsTag::Env,
        JsTag::Unknown,
        JsTag::Undefined,
        JsTag::None,
        JsTag::Nan,
        JsTag::SpBase,
        JsTag::FpBase,
        JsTag::GpBase,
        JsTag::Function,
    ];

    #[test]
    fn test_encode_decode_every_tag() {
        for tag in TAGS {
            for payload in [0u64, 1, 0x7fff_ffff, 0xffff_ffff, PAYLOAD_MASK] {
                let v = JsValue::encode(tag, payload);
                assert!(!v.is_double());
                assert_eq!(v.decode(), (tag, payload));
            }
        }
    }

    #[test]
    fn test_zero_encodings() {
        assert_eq!(JsValue::POS_ZERO.decode(), (JsTag::Number, 0));
        assert_eq!(JsValue::NEG_ZERO.decode(), (JsTag::Double, 0x8000_0000_0000_0000));
        assert!(JsValue::NEG_ZERO.as_f64().is_sign_negative());
        assert_ne!(JsValue::POS_ZERO, JsValue::NEG_ZERO);
        assert_eq!(JsValue::encode(JsTag::Double, (-0.0f64).to_bits()), JsValue::NEG_ZERO);
    }

    #[test]
    fn test_double_canonicalisation() {
        assert_eq!(JsValue::double(f64::NAN), JsValue::NAN);
        assert_eq!(JsValue::double(f64::INFINITY), JsValue::POS_INFINITY);
        assert_eq!(JsValue::double(f64::NEG_INFINITY), JsValue::NEG_INFINITY);
        let v = JsValue::double(2.5);
        assert!(v.is_double());
        assert_eq!(v.as_f64(), 2.5);
    }

    #[test]
    fn test_number_payload_sign() {
        let v = JsValue::number(-7);
        assert!(v.is_number());
        assert_eq!(v.as_i32(), -7);
        assert_eq!(v.to_f64(), Some(-7.0));
    }

    #[test]
    fn test_needs_rc() {
        assert!(JsValue::string(3).needs_rc());
        assert!(JsValue::object(3).needs_rc());
        assert!(JsValue::boxed(JsTag::Env, 1).needs_rc());
        assert!(!JsValue::number(3).needs_rc());
        assert!(!JsValue::function(3).needs_rc());
        assert!(!JsValue::double(1.0).needs_rc());
    }

    #[test]
    fn test_exclusivity_sampled() {
        // xorshift sampling plus the edges of the boxed range
        let mut x: u64 = 0x9e37_79b9_7f4a_7c15;
        let mut samples = vec![
            0,
            SIGN_BIT,
            EXP_MASK,
            EXP_MASK | 1,
            0x7ff7_0000_0000_0000,
            0xfff0_0000_0000_0000,
            u64::MAX,
            DYN_POISON,
        ];
        for _ in 0..100_000 {
            x ^= x << 13;
            x ^= x >> 7;
            x ^= x << 17;
            samples.push(x);
            samples.push(x | EXP_MASK);
        }
        for bits in samples {
            let v = JsValue::from_raw(bits);
            let is_double = v.is_double();
            let has_tag = v.tag() != JsTag::Double;
            assert!(is_double ^ has_tag, "{:#x}", bits);
        }
    }

    #[test]
    fn test_none_survives_projection() {
        assert_eq!(JsValue::NONE.to_generic().0, JsTag::None);
        assert!(JsValue::NONE.is_none());
    }
}
