//! Error types.
//!
//! `EngineError` is the fatal tier: malformed bytecode, impossible type
//! combinations and broken invariants. Guest-level exceptions never travel
//! as `EngineError` while they can still be caught; static mode unwinds them
//! as [`Unwind::Exception`], dynamic mode keeps them in the handler stage
//! machine.

use thiserror::Error;

use crate::vm::primtype::PrimType;

/// Process status for an uncaught dynamic-mode exception.
pub const EXIT_UNCAUGHT: i32 = 3;

/// Process status for every other fatal error (same as `abort`).
pub const EXIT_FATAL: i32 = 134;

/// Errors raised while reading an image container.
#[derive(Debug, Error)]
pub enum ImageError {
    #[error("invalid magic number")]
    InvalidMagic,

    #[error("unsupported image version: {0}")]
    UnsupportedVersion(u32),

    #[error("unknown execution mode: {0}")]
    UnknownMode(u8),

    #[error("truncated {0} section")]
    Truncated(&'static str),

    #[error("global data size {0} is not a multiple of 8")]
    MisalignedGlobals(usize),

    #[error("entry offset {0:#x} lies outside the code section")]
    BadEntry(u32),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Fatal engine errors.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("malformed bytecode at {pc:#x}: {reason}")]
    Malformed { pc: usize, reason: String },

    #[error("unknown opcode {op:#04x} at {pc:#x}")]
    UnknownOpcode { op: u8, pc: usize },

    #[error("opcode {op} is not valid in {mode} mode")]
    WrongMode { op: &'static str, mode: &'static str },

    #[error("unknown primitive type {0:#04x}")]
    UnknownPrimType(u8),

    #[error("unsupported width for {0:?}")]
    UnsupportedWidth(PrimType),

    #[error("type mismatch: expected {expected:?}, found {found:?}")]
    TypeMismatch { expected: PrimType, found: PrimType },

    #[error("operation {op} is undefined for {ty:?}")]
    BadOperand { op: &'static str, ty: PrimType },

    #[error("operand stack underflow")]
    StackUnderflow,

    #[error("operand stack overflow")]
    StackOverflow,

    #[error("retsub with an empty gosub stack")]
    EmptyGosub,

    #[error("no active exception handler")]
    NoHandler,

    #[error("not a compiled method at {0:#x}")]
    NotAMethod(u64),

    #[error("null callee")]
    NullCallee,

    #[error("arity mismatch: callee declares {formals} formals, caller passes {actual}")]
    ArityMismatch { formals: u16, actual: usize },

    #[error("cannot build FFI call description: {0}")]
    FfiSignature(String),

    #[error("unknown intrinsic {0}")]
    UnknownIntrinsic(u8),

    #[error("unresolved call target `{0}`")]
    UnresolvedCall(String),

    #[error("address {0:#x} is outside emulated memory")]
    BadAddress(u64),

    #[error("dynamic heap exhausted ({0} bytes in use)")]
    OutOfMemory(usize),

    #[error("uncaught exception object {0:#x}")]
    UncaughtThrowable(u64),

    #[error("uncaught exception: {0}")]
    Uncaught(String),

    #[error(transparent)]
    Image(#[from] ImageError),
}

impl EngineError {
    pub fn malformed(pc: usize, reason: impl Into<String>) -> Self {
        EngineError::Malformed {
            pc,
            reason: reason.into(),
        }
    }

    /// Process exit status for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            EngineError::Uncaught(_) => EXIT_UNCAUGHT,
            _ => EXIT_FATAL,
        }
    }
}

/// How a static-mode invocation leaves its frame abnormally.
#[derive(Debug)]
pub enum Unwind {
    /// A guest exception object that no catch block in the frame matched.
    Exception(u64),
    /// A fatal error; never visible to guest catch blocks.
    Fatal(EngineError),
}

impl From<EngineError> for Unwind {
    fn from(e: EngineError) -> Self {
        Unwind::Fatal(e)
    }
}

impl From<ImageError> for Unwind {
    fn from(e: ImageError) -> Self {
        Unwind::Fatal(e.into())
    }
}

impl Unwind {
    /// Collapses an unwind reaching the embedder into a fatal error.
    pub fn into_engine_error(self) -> EngineError {
        match self {
            Unwind::Exception(obj) => EngineError::UncaughtThrowable(obj),
            Unwind::Fatal(e) => e,
        }
    }
}
