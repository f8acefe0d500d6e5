//! Typed static-mode arithmetic.
//!
//! Every operation is keyed on the instruction's primitive type; operands
//! are read under that type and there is no implicit promotion. Integer
//! results wrap at the type's width.

use std::cmp::Ordering;

use crate::error::EngineError;

use super::ops::Opcode;
use super::primtype::PrimType;
use super::value::MValue;

/// Non-fatal arithmetic outcome that becomes a guest exception.
#[derive(Debug)]
pub enum ArithError {
    DivideByZero,
    Fatal(EngineError),
}

impl From<EngineError> for ArithError {
    fn from(e: EngineError) -> Self {
        ArithError::Fatal(e)
    }
}

#[derive(Debug, Clone, Copy)]
enum Num {
    Signed(i64),
    Unsigned(u64),
    Float(f64),
}

/// Integer-like or float view of `v` read as `ty`.
fn num(ty: PrimType, v: MValue) -> Result<Num, EngineError> {
    let v = v.retag(ty);
    Ok(match v {
        MValue::F32(x) => Num::Float(x as f64),
        MValue::F64(x) => Num::Float(x),
        _ if ty.is_signed_int() => Num::Signed(v.as_i64()),
        _ if ty.is_unsigned_int() || ty.is_address() => Num::Unsigned(v.to_bits()),
        _ => return Err(EngineError::BadOperand { op: "arithmetic", ty }),
    })
}

fn float_result(ty: PrimType, x: f64) -> MValue {
    match ty {
        PrimType::F32 => MValue::F32(x as f32),
        _ => MValue::F64(x),
    }
}

#[inline]
fn int_result(ty: PrimType, bits: u64) -> MValue {
    MValue::from_bits(ty, bits)
}

fn bool_result(ty: PrimType, b: bool) -> MValue {
    int_result(ty, b as u64)
}

/// `a op b` for the binary arithmetic and bitwise opcodes.
pub fn binary(op: Opcode, ty: PrimType, a: MValue, b: MValue) -> Result<MValue, ArithError> {
    use Opcode::*;

    // a64 +/- i64 delta
    if ty == PrimType::A64 && matches!(op, Add | Sub) {
        let base = a.to_bits();
        let delta = b.as_i64() as u64;
        let r = if op == Add { base.wrapping_add(delta) } else { base.wrapping_sub(delta) };
        return Ok(MValue::A64(r));
    }

    let width_bits = (ty.width() * 8) as u32;
    let lhs = num(ty, a)?;
    let rhs = num(ty, b)?;

    let result = match (lhs, rhs) {
        (Num::Float(x), Num::Float(y)) => {
            if ty == PrimType::F32 {
                let (x, y) = (x as f32, y as f32);
                match op {
                    Add => MValue::F32(x + y),
                    Sub => MValue::F32(x - y),
                    Mul => MValue::F32(x * y),
                    Div => MValue::F32(x / y),
                    Max => MValue::F32(if x.is_nan() || y.is_nan() { f32::NAN } else { x.max(y) }),
                    Min => MValue::F32(if x.is_nan() || y.is_nan() { f32::NAN } else { x.min(y) }),
                    _ => return Err(EngineError::BadOperand { op: op.name(), ty }.into()),
                }
            } else {
                match op {
                    Add => MValue::F64(x + y),
                    Sub => MValue::F64(x - y),
                    Mul => MValue::F64(x * y),
                    Div => MValue::F64(x / y),
                    Max => MValue::F64(if x.is_nan() || y.is_nan() { f64::NAN } else { x.max(y) }),
                    Min => MValue::F64(if x.is_nan() || y.is_nan() { f64::NAN } else { x.min(y) }),
                    _ => return Err(EngineError::BadOperand { op: op.name(), ty }.into()),
                }
            }
        }
        (Num::Signed(x), Num::Signed(y)) => match op {
            Add => int_result(ty, x.wrapping_add(y) as u64),
            Sub => int_result(ty, x.wrapping_sub(y) as u64),
            Mul => int_result(ty, x.wrapping_mul(y) as u64),
            Div => {
                if y == 0 {
                    return Err(ArithError::DivideByZero);
                }
                int_result(ty, x.wrapping_div(y) as u64)
            }
            Rem => {
                if y == 0 {
                    return Err(ArithError::DivideByZero);
                }
                int_result(ty, x.wrapping_rem(y) as u64)
            }
            Ashr => int_result(ty, (x >> (y as u32 & (width_bits - 1))) as u64),
            Lshr => {
                let bits = x as u64 & ty.mask();
                int_result(ty, bits >> (y as u32 & (width_bits - 1)))
            }
            Shl => int_result(ty, (x as u64) << (y as u32 & (width_bits - 1))),
            Band => int_result(ty, (x & y) as u64),
            Bior => int_result(ty, (x | y) as u64),
            Bxor => int_result(ty, (x ^ y) as u64),
            Land => bool_result(ty, x != 0 && y != 0),
            Lior => bool_result(ty, x != 0 || y != 0),
            Max => int_result(ty, x.max(y) as u64),
            Min => int_result(ty, x.min(y) as u64),
            _ => return Err(EngineError::BadOperand { op: op.name(), ty }.into()),
        },
        (Num::Unsigned(x), Num::Unsigned(y)) => match op {
            Add => int_result(ty, x.wrapping_add(y)),
            Sub => int_result(ty, x.wrapping_sub(y)),
            Mul => int_result(ty, x.wrapping_mul(y)),
            Div => {
                if y == 0 {
                    return Err(ArithError::DivideByZero);
                }
                int_result(ty, x / y)
            }
            Rem => {
                if y == 0 {
                    return Err(ArithError::DivideByZero);
                }
                int_result(ty, x % y)
            }
            // ashr on an unsigned type still replicates the type's top bit
            Ashr => {
                let shift = y as u32 & (width_bits - 1);
                let signed = ((x << (64 - width_bits)) as i64) >> (64 - width_bits);
                int_result(ty, (signed >> shift) as u64)
            }
            Lshr => int_result(ty, x >> (y as u32 & (width_bits - 1))),
            Shl => int_result(ty, x << (y as u32 & (width_bits - 1))),
            Band => int_result(ty, x & y),
            Bior => int_result(ty, x | y),
            Bxor => int_result(ty, x ^ y),
            Land => bool_result(ty, x != 0 && y != 0),
            Lior => bool_result(ty, x != 0 || y != 0),
            Max => int_result(ty, x.max(y)),
            Min => int_result(ty, x.min(y)),
            _ => return Err(EngineError::BadOperand { op: op.name(), ty }.into()),
        },
        _ => return Err(EngineError::BadOperand { op: op.name(), ty }.into()),
    };
    Ok(result)
}

fn order(operand: PrimType, a: MValue, b: MValue) -> Result<Option<Ordering>, EngineError> {
    Ok(match (num(operand, a)?, num(operand, b)?) {
        (Num::Signed(x), Num::Signed(y)) => Some(x.cmp(&y)),
        (Num::Unsigned(x), Num::Unsigned(y)) => Some(x.cmp(&y)),
        (Num::Float(x), Num::Float(y)) => x.partial_cmp(&y),
        _ => return Err(EngineError::BadOperand { op: "compare", ty: operand }),
    })
}

/// Comparison of `a` and `b` read as `operand`, producing a `ty` value.
pub fn compare(op: Opcode, ty: PrimType, operand: PrimType, a: MValue, b: MValue) -> Result<MValue, EngineError> {
    use Opcode::*;
    let ord = order(operand, a, b)?;
    let truth = |f: fn(Ordering) -> bool| ord.is_some_and(f);
    Ok(match op {
        Eq => bool_result(ty, truth(|o| o == Ordering::Equal)),
        Ne => bool_result(ty, !truth(|o| o == Ordering::Equal)),
        Lt => bool_result(ty, truth(|o| o == Ordering::Less)),
        Le => bool_result(ty, truth(|o| o != Ordering::Greater)),
        Gt => bool_result(ty, truth(|o| o == Ordering::Greater)),
        Ge => bool_result(ty, truth(|o| o != Ordering::Less)),
        Cmp | Cmpl | Cmpg => {
            let r: i64 = match ord {
                Some(Ordering::Less) => -1,
                Some(Ordering::Equal) => 0,
                Some(Ordering::Greater) => 1,
                None if op == Cmpl => -1,
                None => 1,
            };
            int_result(ty, r as u64)
        }
        _ => return Err(EngineError::BadOperand { op: op.name(), ty }),
    })
}

pub fn unary(op: Opcode, ty: PrimType, v: MValue) -> Result<MValue, EngineError> {
    use Opcode::*;
    Ok(match (op, num(ty, v)?) {
        (Neg, Num::Signed(x)) => int_result(ty, x.wrapping_neg() as u64),
        (Neg, Num::Unsigned(x)) => int_result(ty, x.wrapping_neg()),
        (Neg, Num::Float(x)) => float_result(ty, -x),
        (Bnot, Num::Signed(x)) => int_result(ty, !x as u64),
        (Bnot, Num::Unsigned(x)) => int_result(ty, !x),
        (Lnot, Num::Signed(x)) => bool_result(ty, x == 0),
        (Lnot, Num::Unsigned(x)) => bool_result(ty, x == 0),
        _ => return Err(EngineError::BadOperand { op: op.name(), ty }),
    })
}

fn float_to_int(to: PrimType, x: f64) -> MValue {
    // `as` saturates and maps NaN to zero
    match to {
        PrimType::I8 => MValue::I8(x as i8),
        PrimType::I16 => MValue::I16(x as i16),
        PrimType::I32 => MValue::I32(x as i32),
        PrimType::I64 => MValue::I64(x as i64),
        PrimType::U8 => MValue::U8(x as u8),
        PrimType::U16 => MValue::U16(x as u16),
        PrimType::U32 | PrimType::A32 => MValue::from_bits(to, x as u32 as u64),
        _ => MValue::from_bits(to, x as u64),
    }
}

/// Numeric conversion of `v` from `from` to `to`.
pub fn cvt(to: PrimType, from: PrimType, v: MValue) -> Result<MValue, EngineError> {
    let src = num(from, v)?;
    if to == PrimType::U1 {
        return Ok(MValue::U1(match src {
            Num::Signed(x) => x != 0,
            Num::Unsigned(x) => x != 0,
            Num::Float(x) => x != 0.0,
        }));
    }
    Ok(match src {
        Num::Float(x) if to.is_float() => float_result(to, x),
        Num::Float(x) if to.is_int() || to.is_address() => float_to_int(to, x),
        Num::Signed(x) if to.is_float() => float_result(to, x as f64),
        Num::Unsigned(x) if to.is_float() => float_result(to, x as f64),
        Num::Signed(x) if to.is_int() || to.is_address() => int_result(to, x as u64),
        Num::Unsigned(x) if to.is_int() || to.is_address() => int_result(to, x),
        _ => return Err(EngineError::BadOperand { op: "cvt", ty: to }),
    })
}

/// `sext`, `zext` and `extractbits` on the field `[offset, offset + size)`.
pub fn bit_field(op: Opcode, ty: PrimType, v: MValue, offset: u32, size: u32) -> Result<MValue, EngineError> {
    if size == 0 || offset + size > 64 {
        return Err(EngineError::BadOperand { op: op.name(), ty });
    }
    let field = (v.to_bits() >> offset) & (u64::MAX >> (64 - size));
    let signed = match op {
        Opcode::Sext => true,
        Opcode::Zext => false,
        _ => ty.is_signed_int(),
    };
    let bits = if signed {
        (((field << (64 - size)) as i64) >> (64 - size)) as u64
    } else {
        field
    };
    Ok(MValue::from_bits(ty, bits))
}
