//! Static-mode engine lifecycle and invocation.

use std::ffi::{CStr, c_char};
use std::path::Path;
use std::sync::Arc;

use tracing::debug;

use super::types::{MireResult, MireStatic, StaticWrapper, wrapper_mut};
use crate::config::RuntimeConfig;
use crate::error::EngineError;
use crate::vm::value::Slot;
use crate::vm::{Image, MValue, PrimType, SimpleRuntime, StaticEngine};

fn open(path: &Path) -> Result<StaticEngine, EngineError> {
    let image = Image::load(path)?;
    let mut config = RuntimeConfig::default();
    config.apply_env();
    Ok(StaticEngine::new(image, Arc::new(SimpleRuntime::new()))?.with_config(config))
}

/// Load a static-mode image from `path`.
///
/// Always returns a handle (NULL only for a NULL path). When loading fails
/// the handle carries the reason in `mire_get_error()` and every invoke
/// reports `ErrorImage`. Release it with `mire_static_close()`.
///
/// # Safety
/// `path` must be null or a NUL-terminated string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn mire_static_open(path: *const c_char) -> *mut MireStatic {
    if path.is_null() {
        return std::ptr::null_mut();
    }
    // SAFETY: non-null and NUL-terminated per the contract
    let path = unsafe { CStr::from_ptr(path) }.to_string_lossy().into_owned();
    let wrapper = match open(Path::new(&path)) {
        Ok(engine) => {
            debug!(target: "mire::ffi", "opened {}", path);
            StaticWrapper::new(Some(engine))
        }
        Err(e) => {
            let mut w = StaticWrapper::new(None);
            w.set_error(format!("{}: {}", path, e));
            w
        }
    };
    Box::into_raw(Box::new(wrapper)) as *mut MireStatic
}

/// Invoke the method at code offset `method_offset`.
///
/// `args[i]` holds the raw bits of argument `i`, typed by `ptypes[i]`
/// (primitive type numbers). On success the result's raw bits are written
/// to `out` (0 for void).
///
/// # Safety
/// `handle` must be a live handle; `args` and `ptypes` must point to
/// `nargs` elements each (or be null when `nargs` is 0); `out` must be
/// valid for a write or null.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn mire_static_invoke(
    handle: *mut MireStatic,
    method_offset: u32,
    args: *const u64,
    ptypes: *const u8,
    nargs: usize,
    out: *mut u64,
) -> MireResult {
    let Some(wrapper) = (unsafe { wrapper_mut(handle) }) else {
        return MireResult::ErrorInvalidArg;
    };
    if nargs > 0 && (args.is_null() || ptypes.is_null()) {
        wrapper.set_error("argument arrays are NULL");
        return MireResult::ErrorInvalidArg;
    }
    let (bits, types) = if nargs == 0 {
        (&[][..], &[][..])
    } else {
        // SAFETY: both arrays hold `nargs` elements per the contract
        unsafe { (std::slice::from_raw_parts(args, nargs), std::slice::from_raw_parts(ptypes, nargs)) }
    };
    let mut slots = Vec::with_capacity(nargs);
    for (&b, &t) in bits.iter().zip(types) {
        match PrimType::from_u8(t) {
            Ok(ty) => slots.push(Slot::from(MValue::from_bits(ty, b))),
            Err(e) => {
                wrapper.set_error(e.to_string());
                return MireResult::ErrorInvalidArg;
            }
        }
    }

    let Some(engine) = wrapper.engine.as_ref() else {
        return MireResult::ErrorImage;
    };
    let method = engine.method_addr(method_offset as usize);
    match engine.invoke(method, &mut slots) {
        Ok(v) => {
            if !out.is_null() {
                // SAFETY: `out` is writable per the contract
                unsafe { *out = v.to_bits() };
            }
            wrapper.clear_error();
            MireResult::Ok
        }
        Err(unwind) => {
            let e = unwind.into_engine_error();
            let code = MireResult::from(&e);
            wrapper.set_error(e.to_string());
            code
        }
    }
}

/// Code offset of the image's entry method, or `u32::MAX` when no image
/// is loaded.
///
/// # Safety
/// `handle` must be null or a live handle.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn mire_static_entry(handle: *mut MireStatic) -> u32 {
    unsafe { wrapper_mut(handle) }
        .and_then(|w| w.engine.as_ref())
        .map_or(u32::MAX, |e| e.image().entry())
}

/// Release a handle.
///
/// # Safety
/// `handle` must be null or come from `mire_static_open()` and not have
/// been closed already.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn mire_static_close(handle: *mut MireStatic) {
    if handle.is_null() {
        return;
    }
    // SAFETY: reconstructs the Box created by `mire_static_open`
    drop(unsafe { Box::from_raw(handle as *mut StaticWrapper) });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ffi::error::mire_get_error;
    use crate::vm::asm::{Assembler, MethodSpec};
    use crate::vm::image::Mode;
    use crate::vm::ops::Opcode;
    use std::ffi::CString;

    fn add_image(dir: &Path) -> CString {
        let mut asm = Assembler::new();
        let m = asm.begin_method(
            &MethodSpec::new()
                .formal(PrimType::I32, 0)
                .formal(PrimType::I32, 0)
                .reserved_slots()
                .eval_depth(2),
        );
        asm.dread(PrimType::I32, 1)
            .dread(PrimType::I32, 2)
            .binary(Opcode::Add, PrimType::I32)
            .ret(PrimType::I32);
        let path = dir.join("add.mire");
        asm.finish(Mode::Static, m).unwrap().save(&path).unwrap();
        CString::new(path.to_str().unwrap()).unwrap()
    }

    #[test]
    fn test_open_invoke_close() {
        let dir = tempfile::tempdir().unwrap();
        let path = add_image(dir.path());
        unsafe {
            let h = mire_static_open(path.as_ptr());
            assert!(!h.is_null());
            let entry = mire_static_entry(h);
            let args = [40u64, 2];
            let types = [PrimType::I32 as u8; 2];
            let mut out = 0u64;
            let res = mire_static_invoke(h, entry, args.as_ptr(), types.as_ptr(), 2, &mut out);
            assert_eq!(res, MireResult::Ok);
            assert_eq!(out, 42);
            mire_static_close(h);
        }
    }

    #[test]
    fn test_open_missing_file() {
        let path = CString::new("/nonexistent/image.mire").unwrap();
        unsafe {
            let h = mire_static_open(path.as_ptr());
            assert!(!h.is_null());
            assert!(!mire_get_error(h).is_null());
            let res = mire_static_invoke(h, 0, std::ptr::null(), std::ptr::null(), 0, std::ptr::null_mut());
            assert_eq!(res, MireResult::ErrorImage);
            mire_static_close(h);
        }
    }

    #[test]
    fn test_invoke_null_handle() {
        unsafe {
            let res = mire_static_invoke(
                std::ptr::null_mut(),
                0,
                std::ptr::null(),
                std::ptr::null(),
                0,
                std::ptr::null_mut(),
            );
            assert_eq!(res, MireResult::ErrorInvalidArg);
            mire_static_close(std::ptr::null_mut());
        }
    }
}
