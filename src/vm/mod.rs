//! The interpreter core: value representations, bytecode layout, both
//! dispatch loops and the pieces they share.

pub mod primtype;
pub mod value;
pub mod nanbox;
pub mod loadstore;
pub mod ops;
pub mod image;
pub mod asm;
pub mod disasm;

// static mode
pub mod runtime;
pub mod native;
pub mod intrinsic;
pub mod arith;
pub mod frame;
pub mod exception;
pub mod interp;

// dynamic mode
pub mod heap;
pub mod jsops;
pub mod jseh;
pub mod context;
pub mod jsbuiltin;
pub mod dyn_interp;

pub use dyn_interp::{DynEngine, ExecStatus};
pub use image::{Image, Mode};
pub use interp::StaticEngine;
pub use nanbox::{JsTag, JsValue};
pub use primtype::PrimType;
pub use runtime::{SimpleRuntime, StaticRuntime};
pub use value::MValue;
