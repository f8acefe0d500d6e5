//! FFI bridge to native C-ABI functions.
//!
//! Arguments are marshalled from typed values through a fixed primitive
//! type to ABI type table and the raw return bits come back tagged with
//! the caller-declared return type.

use std::collections::HashMap;
use std::ffi::c_void;

use libffi::middle::{Arg, Cif, CodePtr, Type};
use tracing::debug;

use crate::error::EngineError;

use super::primtype::PrimType;
use super::value::MValue;

/// ABI type for a primitive type, or `None` when the type cannot cross
/// the C boundary.
fn ffi_type(ty: PrimType) -> Option<Type> {
    use PrimType::*;
    Some(match ty {
        I8 => Type::i8(),
        I16 => Type::i16(),
        I32 => Type::i32(),
        I64 => Type::i64(),
        U1 | U8 => Type::u8(),
        U16 => Type::u16(),
        U32 => Type::u32(),
        U64 => Type::u64(),
        Ptr | Ref | A32 | A64 | SimpleStr | SimpleObj => Type::pointer(),
        F32 => Type::f32(),
        F64 => Type::f64(),
        Void => Type::void(),
        _ => return None,
    })
}

/// Argument storage; `Arg` borrows from these for the duration of a call.
#[derive(Debug, Clone, Copy)]
enum ArgValue {
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    Ptr(*const c_void),
    F32(f32),
    F64(f64),
}

impl ArgValue {
    fn from_value(v: MValue) -> Result<ArgValue, EngineError> {
        Ok(match v {
            MValue::I8(x) => ArgValue::I8(x),
            MValue::I16(x) => ArgValue::I16(x),
            MValue::I32(x) => ArgValue::I32(x),
            MValue::I64(x) => ArgValue::I64(x),
            MValue::U1(x) => ArgValue::U8(x as u8),
            MValue::U8(x) => ArgValue::U8(x),
            MValue::U16(x) => ArgValue::U16(x),
            MValue::U32(x) => ArgValue::U32(x),
            MValue::U64(x) => ArgValue::U64(x),
            MValue::F32(x) => ArgValue::F32(x),
            MValue::F64(x) => ArgValue::F64(x),
            MValue::Ptr(_) | MValue::Ref(_) | MValue::A32(_) | MValue::A64(_) => {
                ArgValue::Ptr(v.address() as *const c_void)
            }
            MValue::Opaque(PrimType::SimpleStr | PrimType::SimpleObj, bits) => ArgValue::Ptr(bits as *const c_void),
            other => {
                return Err(EngineError::FfiSignature(format!(
                    "{} cannot be passed to native code",
                    other.prim_type()
                )));
            }
        })
    }

    fn as_arg(&self) -> Arg {
        match self {
            ArgValue::I8(x) => Arg::new(x),
            ArgValue::I16(x) => Arg::new(x),
            ArgValue::I32(x) => Arg::new(x),
            ArgValue::I64(x) => Arg::new(x),
            ArgValue::U8(x) => Arg::new(x),
            ArgValue::U16(x) => Arg::new(x),
            ArgValue::U32(x) => Arg::new(x),
            ArgValue::U64(x) => Arg::new(x),
            ArgValue::Ptr(x) => Arg::new(x),
            ArgValue::F32(x) => Arg::new(x),
            ArgValue::F64(x) => Arg::new(x),
        }
    }
}

/// Calls the C function at `fn_ptr` with `args` and returns its result
/// tagged as `ret`.
///
/// # Safety
///
/// `fn_ptr` must be a C-ABI function whose real signature matches the
/// argument value types and `ret`.
pub unsafe fn call_with_ffi(fn_ptr: u64, ret: PrimType, args: &[MValue]) -> Result<MValue, EngineError> {
    if fn_ptr == 0 {
        return Err(EngineError::NullCallee);
    }
    let mut arg_types = Vec::with_capacity(args.len());
    for a in args {
        let t = ffi_type(a.prim_type()).filter(|_| a.prim_type() != PrimType::Void);
        arg_types.push(t.ok_or_else(|| {
            EngineError::FfiSignature(format!("argument type {} has no ABI mapping", a.prim_type()))
        })?);
    }
    let ret_type = ffi_type(ret)
        .ok_or_else(|| EngineError::FfiSignature(format!("return type {} has no ABI mapping", ret)))?;

    let storage = args
        .iter()
        .map(|&a| ArgValue::from_value(a))
        .collect::<Result<Vec<_>, _>>()?;
    let ffi_args: Vec<Arg> = storage.iter().map(ArgValue::as_arg).collect();

    debug!(target: "mire::call", "ffi call {:#x} ({} args) -> {}", fn_ptr, args.len(), ret);

    let cif = Cif::new(arg_types, ret_type);
    let code = CodePtr::from_ptr(fn_ptr as *const c_void);
    let value = unsafe {
        match ret {
            PrimType::Void => {
                cif.call::<()>(code, &ffi_args);
                MValue::Void
            }
            PrimType::F32 => MValue::F32(cif.call::<f32>(code, &ffi_args)),
            PrimType::F64 => MValue::F64(cif.call::<f64>(code, &ffi_args)),
            // integers narrower than a register come back widened
            other => MValue::from_bits(other, cif.call::<u64>(code, &ffi_args)),
        }
    };
    Ok(value)
}

extern "C" fn native_sqrt(x: f64) -> f64 {
    x.sqrt()
}

/// Name to function-pointer table for direct calls.
#[derive(Debug, Clone)]
pub struct NativeTable {
    entries: HashMap<String, u64>,
}

impl Default for NativeTable {
    fn default() -> Self {
        let mut table = NativeTable {
            entries: HashMap::new(),
        };
        table.register("abs", libc::abs as *const () as u64);
        table.register("labs", libc::labs as *const () as u64);
        table.register("atoi", libc::atoi as *const () as u64);
        table.register("strlen", libc::strlen as *const () as u64);
        table.register("toupper", libc::toupper as *const () as u64);
        table.register("sqrt", native_sqrt as *const () as u64);
        table
    }
}

impl NativeTable {
    pub fn empty() -> Self {
        NativeTable {
            entries: HashMap::new(),
        }
    }

    pub fn register(&mut self, name: &str, addr: u64) {
        self.entries.insert(name.to_string(), addr);
    }

    pub fn lookup(&self, name: &str) -> Option<u64> {
        self.entries.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    extern "C" fn add3(a: i32, b: i64, c: f64) -> f64 {
        a as f64 + b as f64 + c
    }

    extern "C" fn negate8(x: i8) -> i8 {
        -x
    }

    #[test]
    fn test_call_libc_abs() {
        let table = NativeTable::default();
        let abs = table.lookup("abs").unwrap();
        let r = unsafe { call_with_ffi(abs, PrimType::I32, &[MValue::I32(-7)]) }.unwrap();
        assert_eq!(r, MValue::I32(7));
    }

    #[test]
    fn test_mixed_register_classes() {
        let f = add3 as *const () as u64;
        let r = unsafe {
            call_with_ffi(f, PrimType::F64, &[MValue::I32(1), MValue::I64(2), MValue::F64(0.5)])
        }
        .unwrap();
        assert_eq!(r, MValue::F64(3.5));
    }

    #[test]
    fn test_narrow_return_is_masked() {
        let f = negate8 as *const () as u64;
        let r = unsafe { call_with_ffi(f, PrimType::I8, &[MValue::I8(5)]) }.unwrap();
        assert_eq!(r, MValue::I8(-5));
    }

    #[test]
    fn test_unmappable_types_fail() {
        let f = negate8 as *const () as u64;
        let err = unsafe { call_with_ffi(f, PrimType::C64, &[]) }.unwrap_err();
        assert!(matches!(err, EngineError::FfiSignature(_)));
        let err = unsafe { call_with_ffi(f, PrimType::I8, &[MValue::Opaque(PrimType::DynAny, 0)]) }.unwrap_err();
        assert!(matches!(err, EngineError::FfiSignature(_)));
    }

    #[test]
    fn test_null_callee() {
        assert!(matches!(
            unsafe { call_with_ffi(0, PrimType::Void, &[]) },
            Err(EngineError::NullCallee)
        ));
    }
}
