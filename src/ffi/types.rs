//! FFI type definitions for the C API.

use std::ffi::CString;

use tracing::error;

use crate::error::EngineError;
use crate::vm::StaticEngine;

/// Result codes for FFI operations.
///
/// These map to the `MireResult` enum in C.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MireResult {
    /// Operation succeeded
    Ok = 0,
    /// Fatal engine error during execution
    ErrorRuntime = 1,
    /// The image could not be loaded or has the wrong mode
    ErrorImage = 2,
    /// Invalid argument passed to function
    ErrorInvalidArg = 3,
    /// A guest exception escaped the invoked method
    ErrorUncaught = 4,
}

impl MireResult {
    pub fn is_ok(self) -> bool {
        self == MireResult::Ok
    }

    pub fn is_err(self) -> bool {
        self != MireResult::Ok
    }
}

impl From<&EngineError> for MireResult {
    fn from(e: &EngineError) -> Self {
        match e {
            EngineError::Image(_) | EngineError::WrongMode { .. } => MireResult::ErrorImage,
            EngineError::UncaughtThrowable(_) | EngineError::Uncaught(_) => MireResult::ErrorUncaught,
            _ => MireResult::ErrorRuntime,
        }
    }
}

/// Opaque static-mode engine handle.
///
/// Created by `mire_static_open()`, released by `mire_static_close()`.
#[repr(C)]
pub struct MireStatic {
    _private: [u8; 0],
}

/// Internal wrapper behind a `MireStatic` pointer.
pub(crate) struct StaticWrapper {
    /// None when the image failed to load; the reason is in `last_error`.
    pub engine: Option<StaticEngine>,
    /// Last error message (as CString for FFI compatibility)
    pub last_error: Option<CString>,
}

impl StaticWrapper {
    pub fn new(engine: Option<StaticEngine>) -> Self {
        Self {
            engine,
            last_error: None,
        }
    }

    /// Records an error message.
    pub fn set_error(&mut self, message: impl Into<String>) {
        let msg = message.into();
        error!(target: "mire::ffi", "{}", msg);
        self.last_error = Some(CString::new(msg).unwrap_or_default());
    }

    pub fn clear_error(&mut self) {
        self.last_error = None;
    }
}

/// Helper to get a mutable reference to the wrapper from a raw pointer.
///
/// Returns None if the pointer is null.
///
/// # Safety
/// `handle` must be null or come from `mire_static_open()` and not be closed.
pub(crate) unsafe fn wrapper_mut<'a>(handle: *mut MireStatic) -> Option<&'a mut StaticWrapper> {
    if handle.is_null() {
        None
    } else {
        // SAFETY: non-null handles are boxed `StaticWrapper`s per the contract
        Some(unsafe { &mut *(handle as *mut StaticWrapper) })
    }
}

/// Immutable counterpart of [`wrapper_mut`].
///
/// # Safety
/// As for [`wrapper_mut`].
pub(crate) unsafe fn wrapper<'a>(handle: *const MireStatic) -> Option<&'a StaticWrapper> {
    if handle.is_null() {
        None
    } else {
        // SAFETY: see `wrapper_mut`
        Some(unsafe { &*(handle as *const StaticWrapper) })
    }
}
