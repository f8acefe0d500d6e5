//! Error handling FFI functions.

use std::ffi::c_char;

use super::types::{MireStatic, wrapper, wrapper_mut};

/// Get the last error message.
///
/// Returns a pointer to the error message string, or NULL if no error.
/// The returned pointer is valid until the next call on the same handle.
///
/// # Example (C)
/// ```c
/// MireResult res = mire_static_invoke(h, off, args, types, 2, &out);
/// if (res != Ok) {
///     printf("Error: %s\n", mire_get_error(h));
/// }
/// ```
///
/// # Safety
/// `handle` must be null or a live handle from `mire_static_open()`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn mire_get_error(handle: *const MireStatic) -> *const c_char {
    match unsafe { wrapper(handle) }.and_then(|w| w.last_error.as_ref()) {
        Some(error) => error.as_ptr(),
        None => std::ptr::null(),
    }
}

/// Clear the last error.
///
/// # Safety
/// `handle` must be null or a live handle from `mire_static_open()`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn mire_clear_error(handle: *mut MireStatic) {
    if let Some(w) = unsafe { wrapper_mut(handle) } {
        w.clear_error();
    }
}

/// Check if there is a pending error.
///
/// # Safety
/// `handle` must be null or a live handle from `mire_static_open()`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn mire_has_error(handle: *const MireStatic) -> bool {
    unsafe { wrapper(handle) }.is_some_and(|w| w.last_error.is_some())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ffi::types::StaticWrapper;
    use std::ffi::CStr;

    #[test]
    fn test_get_error() {
        let handle = Box::into_raw(Box::new(StaticWrapper::new(None))) as *mut MireStatic;
        unsafe {
            assert!(mire_get_error(handle).is_null());
            assert!(!mire_has_error(handle));

            wrapper_mut(handle).unwrap().set_error("test error message");
            assert!(mire_has_error(handle));
            let error = CStr::from_ptr(mire_get_error(handle)).to_str().unwrap();
            assert_eq!(error, "test error message");

            mire_clear_error(handle);
            assert!(mire_get_error(handle).is_null());
            drop(Box::from_raw(handle as *mut StaticWrapper));
        }
    }

    #[test]
    fn test_error_null_handle() {
        unsafe {
            assert!(mire_get_error(std::ptr::null()).is_null());
            assert!(!mire_has_error(std::ptr::null()));
            mire_clear_error(std::ptr::null_mut());
        }
    }
}
