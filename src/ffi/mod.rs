//! C API for embedding the interpreter.
//!
//! All public functions use the `extern "C"` ABI; `build.rs` generates
//! `include/mire.h` from them.
//!
//! # Safety
//!
//! All FFI functions that take raw pointers require:
//! - Handles created by `mire_static_open()` and not yet closed
//! - NUL-terminated strings
//! - Argument arrays of the advertised length

mod engine;
mod error;
mod shim;
mod types;

pub use engine::*;
pub use error::*;
pub use shim::*;
pub use types::{MireResult, MireStatic};

/// Version information
pub const MIRE_VERSION_MAJOR: u32 = 0;
pub const MIRE_VERSION_MINOR: u32 = 1;
pub const MIRE_VERSION_PATCH: u32 = 0;

/// Get the version string
#[unsafe(no_mangle)]
pub extern "C" fn mire_version() -> *const std::ffi::c_char {
    static VERSION: &[u8] = b"0.1.0\0";
    VERSION.as_ptr() as *const std::ffi::c_char
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CStr;

    #[test]
    fn test_version() {
        let version = unsafe { CStr::from_ptr(mire_version()) };
        assert_eq!(
            version.to_str().unwrap(),
            format!("{}.{}.{}", MIRE_VERSION_MAJOR, MIRE_VERSION_MINOR, MIRE_VERSION_PATCH)
        );
    }
}
