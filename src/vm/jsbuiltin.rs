//! Dynamic-mode intrinsics.
//!
//! Each intrinsic takes its operands bottom first and produces the value
//! the interpreter stores into retval0. A guest-visible failure comes back
//! as [`IntrinsicError::Throw`]; the interpreter turns it into an error
//! object and raises it through the handler stage machine.

use std::io::Write;

use thiserror::Error;
use tracing::debug;

use crate::error::EngineError;

use super::context::DynContext;
use super::heap::HeapObject;
use super::intrinsic::IntrinsicId;
use super::jsops;
use super::nanbox::{JsTag, JsValue};

/// A runtime error raised on behalf of guest code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JsError {
    #[error("TypeError: {0}")]
    TypeError(String),
    #[error("RangeError: {0}")]
    RangeError(String),
    #[error("ReferenceError: {0}")]
    ReferenceError(String),
    #[error("Error: {0}")]
    Error(String),
}

impl JsError {
    pub fn name(&self) -> &'static str {
        match self {
            JsError::TypeError(_) => "TypeError",
            JsError::RangeError(_) => "RangeError",
            JsError::ReferenceError(_) => "ReferenceError",
            JsError::Error(_) => "Error",
        }
    }

    pub fn message(&self) -> &str {
        match self {
            JsError::TypeError(m) | JsError::RangeError(m) | JsError::ReferenceError(m) | JsError::Error(m) => m,
        }
    }

    /// Use of a variable that was never defined.
    pub fn undefined_variable() -> Self {
        JsError::ReferenceError("variable is not defined".into())
    }

    /// Allocates the matching error object.
    pub fn into_value(self, ctx: &mut DynContext) -> Result<JsValue, EngineError> {
        ctx.heap.new_error(self.name(), self.message())
    }
}

#[derive(Debug, Error)]
pub enum IntrinsicError {
    #[error(transparent)]
    Throw(#[from] JsError),
    #[error(transparent)]
    Fatal(#[from] EngineError),
}

/// Where an `arguments` index write lands in the running frame.
#[derive(Debug, Clone, Copy, Default)]
pub struct ArgumentsMirror {
    /// Formal words that alias `arguments[0..formals]`; 0 in strict code.
    pub formals: usize,
}

fn expect_args(id: IntrinsicId, args: &[JsValue], n: usize) -> Result<(), EngineError> {
    if args.len() == n {
        Ok(())
    } else {
        Err(EngineError::malformed(
            0,
            format!("{} takes {} operands, got {}", id.name(), n, args.len()),
        ))
    }
}

fn check_defined(args: &[JsValue]) -> Result<(), JsError> {
    if args.iter().any(|v| v.is_none()) {
        return Err(JsError::undefined_variable());
    }
    Ok(())
}

/// Runs intrinsic `id` on `args`.
pub fn call(
    ctx: &mut DynContext,
    id: IntrinsicId,
    args: &[JsValue],
    mirror: ArgumentsMirror,
) -> Result<JsValue, IntrinsicError> {
    debug!(target: "mire::call", "intrinsic {} with {} operands", id.name(), args.len());
    if id != IntrinsicId::JsopTypeof {
        check_defined(args)?;
    }
    let value = match id {
        IntrinsicId::JsPrint => {
            let line: Vec<String> = args.iter().map(|&v| ctx.heap.to_display(v)).collect();
            writeln!(ctx.out(), "{}", line.join(" ")).map_err(|e| JsError::Error(e.to_string()))?;
            JsValue::number(0)
        }
        IntrinsicId::JsopConcat => {
            expect_args(id, args, 2)?;
            jsops::concat(&mut ctx.heap, args[0], args[1])?
        }
        IntrinsicId::JsopAdd => {
            expect_args(id, args, 2)?;
            match jsops::fast_binary(super::ops::Opcode::Add, args[0], args[1]) {
                Some(v) => v,
                None => jsops::general_binary(&mut ctx.heap, super::ops::Opcode::Add, args[0], args[1])?,
            }
        }
        IntrinsicId::JsNewObject0 => {
            expect_args(id, args, 0)?;
            ctx.heap.new_object()?
        }
        IntrinsicId::JsopGetpropByName => {
            expect_args(id, args, 2)?;
            get_prop(ctx, args[0], args[1])?
        }
        IntrinsicId::JsopSetpropByName => {
            expect_args(id, args, 3)?;
            set_prop(ctx, args[0], args[1], args[2], mirror)?;
            args[2]
        }
        IntrinsicId::JsNumber => {
            expect_args(id, args, 1)?;
            if args[0].is_number() || args[0].is_double() {
                args[0]
            } else {
                jsops::to_number(&ctx.heap, args[0]).into_value()
            }
        }
        IntrinsicId::JsBoolean => {
            expect_args(id, args, 1)?;
            JsValue::boolean(jsops::to_boolean(&ctx.heap, args[0]))
        }
        IntrinsicId::JsString => {
            expect_args(id, args, 1)?;
            if args[0].tag() == JsTag::String {
                args[0]
            } else {
                let s = ctx.heap.to_display(args[0]);
                ctx.heap.alloc_string(s)?
            }
        }
        IntrinsicId::JsopStrictEq | IntrinsicId::JsopStrictNe => {
            expect_args(id, args, 2)?;
            let eq = jsops::strict_eq(&ctx.heap, args[0], args[1]);
            JsValue::boolean(eq == (id == IntrinsicId::JsopStrictEq))
        }
        IntrinsicId::JsopTypeof => {
            expect_args(id, args, 1)?;
            ctx.heap.alloc_string(jsops::type_of(args[0]))?
        }
        IntrinsicId::JsError => {
            let message = match args.first() {
                Some(&v) if v.tag() != JsTag::Undefined => ctx.heap.to_display(v),
                _ => String::new(),
            };
            ctx.heap.new_error("Error", &message)?
        }
        IntrinsicId::JsopDeleteArgument => {
            expect_args(id, args, 1)?;
            let deleted = match (ctx.arguments(), index_of(ctx, args[0])) {
                (Some(obj), Some(idx)) => ctx.heap.delete_argument(obj, idx),
                _ => false,
            };
            JsValue::boolean(deleted)
        }
        IntrinsicId::JsGetArgumentObject => {
            expect_args(id, args, 0)?;
            ctx.arguments().unwrap_or(JsValue::UNDEFINED)
        }
        IntrinsicId::JsopLength => {
            expect_args(id, args, 1)?;
            match args[0].tag() {
                JsTag::Undefined | JsTag::Null => {
                    return Err(JsError::TypeError("cannot read property 'length' of null or undefined".into()).into());
                }
                _ => ctx.heap.get_prop(args[0], "length").unwrap_or(JsValue::UNDEFINED),
            }
        }
        IntrinsicId::JsIsNan => {
            expect_args(id, args, 1)?;
            JsValue::boolean(jsops::to_number(&ctx.heap, args[0]).to_f64().is_nan())
        }
        _ => return Err(EngineError::WrongMode { op: id.name(), mode: "dynamic" }.into()),
    };
    Ok(value)
}

/// Property key of a cell: strings by content, everything else by its
/// display form.
fn key_of(ctx: &DynContext, key: JsValue) -> String {
    ctx.heap.to_display(key)
}

fn index_of(ctx: &DynContext, key: JsValue) -> Option<usize> {
    match jsops::to_number(&ctx.heap, key) {
        jsops::Num::Int(i) if i >= 0 => Some(i as usize),
        _ => None,
    }
}

fn get_prop(ctx: &mut DynContext, obj: JsValue, key: JsValue) -> Result<JsValue, IntrinsicError> {
    let name = key_of(ctx, key);
    match obj.tag() {
        JsTag::Undefined | JsTag::Null => {
            let what = ctx.heap.to_display(obj);
            return Err(JsError::TypeError(format!("cannot read property '{}' of {}", name, what)).into());
        }
        JsTag::String | JsTag::Object => {}
        _ => return Ok(JsValue::UNDEFINED),
    }
    if let Some(HeapObject::Error { name: ename, message }) = ctx.heap.get(obj) {
        let field = match name.as_str() {
            "name" => Some(ename.clone()),
            "message" => Some(message.clone()),
            _ => None,
        };
        return match field {
            Some(s) => Ok(ctx.heap.alloc_string(s)?),
            None => Ok(JsValue::UNDEFINED),
        };
    }
    Ok(ctx.heap.get_prop(obj, &name).unwrap_or(JsValue::UNDEFINED))
}

fn set_prop(
    ctx: &mut DynContext,
    obj: JsValue,
    key: JsValue,
    value: JsValue,
    mirror: ArgumentsMirror,
) -> Result<(), IntrinsicError> {
    let name = key_of(ctx, key);
    if obj.tag() != JsTag::Object {
        let what = ctx.heap.to_display(obj);
        return Err(JsError::TypeError(format!("cannot set property '{}' of {}", name, what)).into());
    }
    if Some(obj) == ctx.arguments() {
        if let Some(idx) = index_of(ctx, key) {
            ctx.heap.set_argument(obj, idx, value);
            if idx < mirror.formals {
                ctx.set_frame_word(8 * (idx as i64 + 1), value)?;
            }
        }
        return Ok(());
    }
    if !ctx.heap.set_prop(obj, &name, value) {
        return Err(JsError::TypeError(format!("cannot set property '{}'", name)).into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::io;
    use std::rc::Rc;

    use super::*;
    use crate::config::RuntimeConfig;
    use crate::vm::image::{Image, Mode};

    #[derive(Clone, Default)]
    struct Captured(Rc<RefCell<Vec<u8>>>);

    impl Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.borrow_mut().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn context() -> (DynContext, Captured) {
        let image = Image::new(Mode::Dynamic, vec![0; 16], 0);
        let out = Captured::default();
        let ctx = DynContext::new(&image, &RuntimeConfig::default()).with_output(Box::new(out.clone()));
        (ctx, out)
    }

    fn run(ctx: &mut DynContext, id: IntrinsicId, args: &[JsValue]) -> Result<JsValue, IntrinsicError> {
        call(ctx, id, args, ArgumentsMirror::default())
    }

    #[test]
    fn test_print_joins_with_spaces() {
        let (mut ctx, out) = context();
        let s = ctx.heap.alloc_string("x =").unwrap();
        run(&mut ctx, IntrinsicId::JsPrint, &[s, JsValue::double(1.5), JsValue::NULL]).unwrap();
        assert_eq!(String::from_utf8(out.0.borrow().clone()).unwrap(), "x = 1.5 null\n");
    }

    #[test]
    fn test_properties() {
        let (mut ctx, _) = context();
        let obj = run(&mut ctx, IntrinsicId::JsNewObject0, &[]).unwrap();
        ctx.heap.inc(obj);
        let key = ctx.heap.alloc_string("k").unwrap();
        run(&mut ctx, IntrinsicId::JsopSetpropByName, &[obj, key, JsValue::number(4)]).unwrap();
        let v = run(&mut ctx, IntrinsicId::JsopGetpropByName, &[obj, key]).unwrap();
        assert_eq!(v, JsValue::number(4));
        let missing = ctx.heap.alloc_string("nope").unwrap();
        let v = run(&mut ctx, IntrinsicId::JsopGetpropByName, &[obj, missing]).unwrap();
        assert_eq!(v, JsValue::UNDEFINED);
    }

    #[test]
    fn test_property_of_undefined_is_type_error() {
        let (mut ctx, _) = context();
        let key = ctx.heap.alloc_string("k").unwrap();
        let err = run(&mut ctx, IntrinsicId::JsopGetpropByName, &[JsValue::UNDEFINED, key]).unwrap_err();
        assert!(matches!(err, IntrinsicError::Throw(JsError::TypeError(_))));
    }

    #[test]
    fn test_none_operand_is_reference_error() {
        let (mut ctx, _) = context();
        let err = run(&mut ctx, IntrinsicId::JsBoolean, &[JsValue::NONE]).unwrap_err();
        assert!(matches!(err, IntrinsicError::Throw(JsError::ReferenceError(_))));
        let t = run(&mut ctx, IntrinsicId::JsopTypeof, &[JsValue::NONE]).unwrap();
        assert_eq!(ctx.heap.as_str(t), Some("undefined"));
    }

    #[test]
    fn test_error_object_fields() {
        let (mut ctx, _) = context();
        let msg = ctx.heap.alloc_string("boom").unwrap();
        let e = run(&mut ctx, IntrinsicId::JsError, &[msg]).unwrap();
        assert_eq!(ctx.heap.to_display(e), "Error: boom");
        let key = ctx.heap.alloc_string("message").unwrap();
        let m = run(&mut ctx, IntrinsicId::JsopGetpropByName, &[e, key]).unwrap();
        assert_eq!(ctx.heap.as_str(m), Some("boom"));
    }

    #[test]
    fn test_conversions() {
        let (mut ctx, _) = context();
        let s = ctx.heap.alloc_string("42").unwrap();
        assert_eq!(run(&mut ctx, IntrinsicId::JsNumber, &[s]).unwrap(), JsValue::number(42));
        assert_eq!(run(&mut ctx, IntrinsicId::JsNumber, &[JsValue::UNDEFINED]).unwrap(), JsValue::NAN);
        assert_eq!(run(&mut ctx, IntrinsicId::JsIsNan, &[JsValue::UNDEFINED]).unwrap(), JsValue::TRUE);
        let len = run(&mut ctx, IntrinsicId::JsopLength, &[s]).unwrap();
        assert_eq!(len, JsValue::number(2));
        let str5 = run(&mut ctx, IntrinsicId::JsString, &[JsValue::number(5)]).unwrap();
        assert_eq!(ctx.heap.as_str(str5), Some("5"));
        let eq = run(&mut ctx, IntrinsicId::JsopStrictNe, &[str5, JsValue::number(5)]).unwrap();
        assert_eq!(eq, JsValue::TRUE);
    }

    #[test]
    fn test_static_intrinsic_rejected() {
        let (mut ctx, _) = context();
        let err = run(&mut ctx, IntrinsicId::CSqrt, &[JsValue::number(4)]).unwrap_err();
        assert!(matches!(err, IntrinsicError::Fatal(EngineError::WrongMode { .. })));
    }

    #[test]
    fn test_delete_argument() {
        let (mut ctx, _) = context();
        let args = ctx.heap.new_arguments(&[JsValue::number(1), JsValue::number(2)]).unwrap();
        ctx.heap.inc(args);
        ctx.set_arguments(Some(args));
        let r = run(&mut ctx, IntrinsicId::JsopDeleteArgument, &[JsValue::number(1)]).unwrap();
        assert_eq!(r, JsValue::TRUE);
        assert!(ctx.heap.argument_deleted(args, 1));
        let same = run(&mut ctx, IntrinsicId::JsGetArgumentObject, &[]).unwrap();
        assert_eq!(same, args);
    }
}
