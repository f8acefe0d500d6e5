//! Dynamic-mode operators.
//!
//! Binary arithmetic has two entry points. [`fast_binary`] only accepts
//! `Number`/`Double` operands and is what the dispatch loop tries first;
//! [`general_binary`] applies `ToNumber` (or string concatenation for `+`)
//! to arbitrary cells. Both reduce their operands to [`Num`] and share
//! [`num_arith`], so the two paths agree bit for bit wherever both apply.

use std::cmp::Ordering;

use crate::error::EngineError;

use super::heap::{HeapObject, JsHeap};
use super::nanbox::{JsTag, JsValue};
use super::ops::Opcode;
use super::primtype::PrimType;

/// A numeric operand after `ToNumber`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Num {
    Int(i32),
    Float(f64),
}

impl Num {
    /// Numeric view of a cell that already holds a number.
    pub fn from_cell(v: JsValue) -> Option<Num> {
        match v.tag() {
            JsTag::Number => Some(Num::Int(v.as_i32())),
            JsTag::Double | JsTag::Nan | JsTag::Infinity => v.to_f64().map(Num::Float),
            _ => None,
        }
    }

    pub fn to_f64(self) -> f64 {
        match self {
            Num::Int(i) => i as f64,
            Num::Float(f) => f,
        }
    }

    pub fn into_value(self) -> JsValue {
        match self {
            Num::Int(i) => JsValue::number(i),
            Num::Float(f) => JsValue::double(f),
        }
    }
}

/// An `i64` intermediate of integer arithmetic. Values outside the `i32`
/// range are promoted to a double.
pub fn from_i64(r: i64) -> JsValue {
    match i32::try_from(r) {
        Ok(n) => JsValue::number(n),
        Err(_) => JsValue::double(r as f64),
    }
}

/// Arithmetic on two numeric operands.
///
/// `op` is one of `add sub mul div rem max min`; anything else yields NaN.
pub fn num_arith(op: Opcode, a: Num, b: Num) -> JsValue {
    if let (Num::Int(x), Num::Int(y)) = (a, b) {
        let (x64, y64) = (x as i64, y as i64);
        match op {
            Opcode::Add => return from_i64(x64 + y64),
            Opcode::Sub => return from_i64(x64 - y64),
            Opcode::Mul => {
                let r = x64 * y64;
                if r == 0 && (x < 0 || y < 0) {
                    return JsValue::NEG_ZERO;
                }
                return from_i64(r);
            }
            Opcode::Div if y != 0 => {
                if x == 0 && y < 0 {
                    return JsValue::NEG_ZERO;
                }
                if x64 % y64 == 0 {
                    return from_i64(x64 / y64);
                }
            }
            Opcode::Rem if y > 0 => {
                let r = x % y;
                if r == 0 && x < 0 {
                    return JsValue::NEG_ZERO;
                }
                return JsValue::number(r);
            }
            Opcode::Max => return JsValue::number(x.max(y)),
            Opcode::Min => return JsValue::number(x.min(y)),
            _ => {}
        }
    }

    let (x, y) = (a.to_f64(), b.to_f64());
    let r = match op {
        Opcode::Add => x + y,
        Opcode::Sub => x - y,
        Opcode::Mul => x * y,
        Opcode::Div => x / y,
        // f64 `%` is fmod: the sign follows the dividend
        Opcode::Rem => x % y,
        Opcode::Max | Opcode::Min => return float_extremum(op, x, y),
        _ => f64::NAN,
    };
    JsValue::double(r)
}

fn float_extremum(op: Opcode, x: f64, y: f64) -> JsValue {
    if x.is_nan() || y.is_nan() {
        return JsValue::NAN;
    }
    let pick_x = if x == y {
        // +0 beats -0 for max, -0 beats +0 for min
        (op == Opcode::Max) != x.is_sign_negative()
    } else {
        (op == Opcode::Max) == (x > y)
    };
    JsValue::double(if pick_x { x } else { y })
}

/// The dispatch loop's fast path for `add sub mul div rem`.
///
/// Returns `None` unless both operands are `Number` or `Double` cells.
#[inline]
pub fn fast_binary(op: Opcode, a: JsValue, b: JsValue) -> Option<JsValue> {
    if !matches!(op, Opcode::Add | Opcode::Sub | Opcode::Mul | Opcode::Div | Opcode::Rem) {
        return None;
    }
    let num = |v: JsValue| {
        if v.is_number() {
            Some(Num::Int(v.as_i32()))
        } else if v.is_double() {
            Some(Num::Float(v.as_f64()))
        } else {
            None
        }
    };
    Some(num_arith(op, num(a)?, num(b)?))
}

/// `add sub mul div rem max min` over arbitrary cells.
pub fn general_binary(heap: &mut JsHeap, op: Opcode, a: JsValue, b: JsValue) -> Result<JsValue, EngineError> {
    if op == Opcode::Add && (is_stringish(a) || is_stringish(b)) {
        return concat(heap, a, b);
    }
    Ok(num_arith(op, to_number(heap, a), to_number(heap, b)))
}

/// Operands that turn `+` into concatenation: strings, and objects whose
/// primitive form is their string form.
fn is_stringish(v: JsValue) -> bool {
    matches!(v.tag(), JsTag::String | JsTag::Object)
}

/// String concatenation of the display forms of `a` and `b`. The result is
/// a floating heap cell.
pub fn concat(heap: &mut JsHeap, a: JsValue, b: JsValue) -> Result<JsValue, EngineError> {
    let mut s = heap.to_display(a);
    s.push_str(&heap.to_display(b));
    heap.alloc_string(s)
}

// ========================================
// Conversions
// ========================================

/// `ToNumber` over primitives. Objects and functions are NaN.
pub fn to_number(heap: &JsHeap, v: JsValue) -> Num {
    match v.tag() {
        JsTag::Number | JsTag::Boolean => Num::Int(v.as_i32()),
        JsTag::Null => Num::Int(0),
        JsTag::Double | JsTag::Nan | JsTag::Infinity => Num::Float(v.to_f64().unwrap_or(f64::NAN)),
        JsTag::String => match heap.as_str(v) {
            Some(s) => parse_number(s),
            None => Num::Float(f64::NAN),
        },
        _ => Num::Float(f64::NAN),
    }
}

/// `StringToNumber`: surrounding whitespace is ignored, the empty string is
/// zero, integral values in `i32` range stay integers.
pub fn parse_number(s: &str) -> Num {
    let t = s.trim();
    if t.is_empty() {
        return Num::Int(0);
    }
    let f = match t {
        "Infinity" | "+Infinity" => f64::INFINITY,
        "-Infinity" => f64::NEG_INFINITY,
        _ => {
            let hex = t.strip_prefix("0x").or_else(|| t.strip_prefix("0X"));
            match hex {
                Some(digits) => match u64::from_str_radix(digits, 16) {
                    Ok(n) => n as f64,
                    Err(_) => f64::NAN,
                },
                // reject Rust-only spellings such as "inf" and "nan"
                None if t.bytes().all(|c| c.is_ascii_digit() || b"+-.eE".contains(&c)) => {
                    t.parse::<f64>().unwrap_or(f64::NAN)
                }
                None => f64::NAN,
            }
        }
    };
    float_to_num(f)
}

fn float_to_num(f: f64) -> Num {
    if f.fract() == 0.0 && f >= i32::MIN as f64 && f <= i32::MAX as f64 && !(f == 0.0 && f.is_sign_negative()) {
        Num::Int(f as i32)
    } else {
        Num::Float(f)
    }
}

/// `ToBoolean`.
pub fn to_boolean(heap: &JsHeap, v: JsValue) -> bool {
    match v.tag() {
        JsTag::Undefined | JsTag::Null | JsTag::None | JsTag::Nan => false,
        JsTag::Boolean | JsTag::Number => v.as_i32() != 0,
        JsTag::Double => v.as_f64() != 0.0,
        JsTag::Infinity => true,
        JsTag::String => heap.as_str(v).is_some_and(|s| !s.is_empty()),
        JsTag::Object | JsTag::Env | JsTag::Function => true,
        JsTag::SpBase | JsTag::FpBase | JsTag::GpBase => true,
        JsTag::Unknown => false,
    }
}

/// `ToInt32`: truncation modulo 2^32; NaN and the infinities are zero.
pub fn to_int32(heap: &JsHeap, v: JsValue) -> i32 {
    match to_number(heap, v) {
        Num::Int(i) => i,
        Num::Float(f) if !f.is_finite() => 0,
        Num::Float(f) => f.trunc().rem_euclid(4_294_967_296.0) as u32 as i32,
    }
}

pub fn type_of(v: JsValue) -> &'static str {
    match v.tag() {
        JsTag::Undefined | JsTag::None => "undefined",
        JsTag::Boolean => "boolean",
        JsTag::Number | JsTag::Double | JsTag::Nan | JsTag::Infinity => "number",
        JsTag::String => "string",
        JsTag::Function => "function",
        _ => "object",
    }
}

// ========================================
// Bitwise and unary
// ========================================

/// `shl ashr lshr band bior bxor land lior`.
pub fn bitwise(heap: &JsHeap, op: Opcode, a: JsValue, b: JsValue) -> Result<JsValue, EngineError> {
    if matches!(op, Opcode::Land | Opcode::Lior) {
        let (x, y) = (to_boolean(heap, a), to_boolean(heap, b));
        return Ok(JsValue::boolean(if op == Opcode::Land { x && y } else { x || y }));
    }
    let x = to_int32(heap, a);
    let y = to_int32(heap, b);
    let shift = (y & 31) as u32;
    let r = match op {
        Opcode::Shl => x.wrapping_shl(shift),
        Opcode::Ashr => x >> shift,
        Opcode::Lshr => return Ok(from_i64(((x as u32) >> shift) as i64)),
        Opcode::Band => x & y,
        Opcode::Bior => x | y,
        Opcode::Bxor => x ^ y,
        _ => return Err(EngineError::BadOperand { op: op.name(), ty: PrimType::DynAny }),
    };
    Ok(JsValue::number(r))
}

pub fn unary(heap: &JsHeap, op: Opcode, v: JsValue) -> Result<JsValue, EngineError> {
    Ok(match op {
        Opcode::Neg => match to_number(heap, v) {
            Num::Int(0) => JsValue::NEG_ZERO,
            Num::Int(i) => from_i64(-(i as i64)),
            Num::Float(f) => JsValue::double(-f),
        },
        Opcode::Bnot => JsValue::number(!to_int32(heap, v)),
        Opcode::Lnot => JsValue::boolean(!to_boolean(heap, v)),
        _ => return Err(EngineError::BadOperand { op: op.name(), ty: PrimType::DynAny }),
    })
}

// ========================================
// Comparison
// ========================================

fn relation(op: Opcode, ord: Option<Ordering>) -> bool {
    match (op, ord) {
        (Opcode::Eq, Some(o)) => o == Ordering::Equal,
        (Opcode::Ne, Some(o)) => o != Ordering::Equal,
        (Opcode::Ne, None) => true,
        (Opcode::Lt, Some(o)) => o == Ordering::Less,
        (Opcode::Le, Some(o)) => o != Ordering::Greater,
        (Opcode::Gt, Some(o)) => o == Ordering::Greater,
        (Opcode::Ge, Some(o)) => o != Ordering::Less,
        _ => false,
    }
}

/// `cmp cmpl cmpg` as a `Number` -1/0/1; unordered operands give 1, -1, 1.
fn three_way(op: Opcode, ord: Option<Ordering>) -> JsValue {
    JsValue::number(match ord {
        Some(Ordering::Less) => -1,
        Some(Ordering::Equal) => 0,
        Some(Ordering::Greater) => 1,
        None if op == Opcode::Cmpl => -1,
        None => 1,
    })
}

fn finish_compare(op: Opcode, ord: Option<Ordering>) -> JsValue {
    match op {
        Opcode::Cmp | Opcode::Cmpl | Opcode::Cmpg => three_way(op, ord),
        _ => JsValue::boolean(relation(op, ord)),
    }
}

/// The dispatch loop's fast path for comparisons.
///
/// Handles `Number`/`Boolean` pairs as `i32` and any `Double` paired with a
/// `Double` or `Number` as `f64`.
#[inline]
pub fn fast_compare(op: Opcode, a: JsValue, b: JsValue) -> Option<JsValue> {
    let int_like = |v: JsValue| v.is_number() || v.is_boolean();
    let ord = if int_like(a) && int_like(b) {
        Some(a.as_i32().cmp(&b.as_i32()))
    } else if (a.is_double() && (b.is_double() || b.is_number())) || (b.is_double() && a.is_number()) {
        let x = if a.is_double() { a.as_f64() } else { a.as_i32() as f64 };
        let y = if b.is_double() { b.as_f64() } else { b.as_i32() as f64 };
        x.partial_cmp(&y)
    } else {
        return None;
    };
    Some(finish_compare(op, ord))
}

/// `eq ne lt le gt ge cmp cmpl cmpg` over arbitrary cells. `eq`/`ne` are
/// loose equality.
pub fn general_compare(heap: &JsHeap, op: Opcode, a: JsValue, b: JsValue) -> JsValue {
    if matches!(op, Opcode::Eq | Opcode::Ne) {
        let eq = loose_eq(heap, a, b);
        return JsValue::boolean(eq == (op == Opcode::Eq));
    }
    let ord = match (heap.as_str(a), heap.as_str(b)) {
        // code-unit order, as strings are sequences of UTF-16 units
        (Some(x), Some(y)) => Some(x.encode_utf16().cmp(y.encode_utf16())),
        _ => to_number(heap, a).to_f64().partial_cmp(&to_number(heap, b).to_f64()),
    };
    finish_compare(op, ord)
}

fn is_numeric(v: JsValue) -> bool {
    matches!(v.tag(), JsTag::Number | JsTag::Double | JsTag::Nan | JsTag::Infinity)
}

fn is_nullish(v: JsValue) -> bool {
    matches!(v.tag(), JsTag::Undefined | JsTag::Null | JsTag::None)
}

/// Abstract equality (`==`).
pub fn loose_eq(heap: &JsHeap, a: JsValue, b: JsValue) -> bool {
    if is_nullish(a) || is_nullish(b) {
        return is_nullish(a) && is_nullish(b);
    }
    if is_numeric(a) && is_numeric(b) {
        return to_number(heap, a).to_f64() == to_number(heap, b).to_f64();
    }
    match (heap.as_str(a), heap.as_str(b)) {
        (Some(x), Some(y)) => return x == y,
        (Some(_), None) | (None, Some(_)) if a.tag() != JsTag::Object && b.tag() != JsTag::Object => {
            return to_number(heap, a).to_f64() == to_number(heap, b).to_f64();
        }
        _ => {}
    }
    if a.is_boolean() || b.is_boolean() {
        return to_number(heap, a).to_f64() == to_number(heap, b).to_f64();
    }
    if a.tag() == JsTag::Object && b.tag() == JsTag::Object {
        return a == b;
    }
    if a.tag() == JsTag::Object || b.tag() == JsTag::Object {
        // an object against a primitive compares through its string form
        let (obj, prim) = if a.tag() == JsTag::Object { (a, b) } else { (b, a) };
        let s = heap.to_display(obj);
        return match heap.as_str(prim) {
            Some(p) => p == s,
            None => parse_number(&s).to_f64() == to_number(heap, prim).to_f64(),
        };
    }
    a == b
}

/// Strict equality (`===`).
pub fn strict_eq(heap: &JsHeap, a: JsValue, b: JsValue) -> bool {
    if is_numeric(a) && is_numeric(b) {
        return to_number(heap, a).to_f64() == to_number(heap, b).to_f64();
    }
    match (heap.get(a), heap.get(b)) {
        (Some(HeapObject::String(x)), Some(HeapObject::String(y))) => x == y,
        _ => a == b || (a.tag() == JsTag::None && b.tag() == JsTag::Undefined),
    }
}
