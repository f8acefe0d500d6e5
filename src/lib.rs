//! mire - an interpreter core for compiler-produced register/stack bytecode.
//!
//! Two execution modes share one opcode set:
//!
//! - **static**: typed cells, precise reference counting and exact-type
//!   exceptions matched through compiled catch tables
//! - **dynamic**: NaN-boxed cells, ECMAScript-style coercions and a
//!   try/catch/finally stage machine
//!
//! Calls leave the interpreter either into another interpreted method
//! (recognised by a magic word in front of its header) or into native code
//! through libffi.

pub mod config;
pub mod error;
pub mod ffi;
pub mod vm;

pub use config::RuntimeConfig;
pub use error::{EngineError, ImageError};
