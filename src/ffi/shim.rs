//! Dynamic-mode process entry.

use std::cell::RefCell;
use std::ffi::{CStr, c_char};
use std::path::Path;

use tracing::{debug, error};

use crate::config::RuntimeConfig;
use crate::error::EngineError;
use crate::vm::dyn_interp::exit_payload;
use crate::vm::{DynEngine, Image};

thread_local! {
    /// Engine of the image first loaded on this thread.
    static ENGINE: RefCell<Option<DynEngine>> = const { RefCell::new(None) };
}

/// Runs `first_arg` (0 for the image entry) in the thread's dynamic engine,
/// loading `path` on first use. Later calls reuse the loaded image and its
/// global memory.
pub(crate) fn shim(first_arg: u64, path: &Path) -> Result<i64, EngineError> {
    ENGINE.with(|cell| {
        let mut slot = cell.borrow_mut();
        let mut engine = match slot.take() {
            Some(engine) => engine,
            None => {
                let image = Image::load(path)?;
                let mut config = RuntimeConfig::default();
                config.apply_env();
                debug!(target: "mire::ffi", "loaded dynamic image {}", path.display());
                DynEngine::new(image, config)?
            }
        };
        let result = if first_arg == 0 {
            engine.run_main()
        } else {
            engine.run_method(first_arg as usize)
        };
        *slot = Some(engine);
        Ok(exit_payload(result?))
    })
}

/// Dynamic-mode entry: runs the method at code offset `first_arg` (0 for
/// the entry method) of the image at `app_path` and returns the result's
/// raw payload.
///
/// An uncaught guest exception prints its string form and exits with
/// status 3; a fatal error exits with 134.
///
/// # Safety
/// `app_path` must be a NUL-terminated string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn mire_engine_shim_dynamic(first_arg: u64, app_path: *const c_char) -> i64 {
    if app_path.is_null() {
        error!(target: "mire::ffi", "mire_engine_shim_dynamic: NULL path");
        std::process::exit(EngineError::NullCallee.exit_code());
    }
    // SAFETY: NUL-terminated per the contract
    let path = unsafe { CStr::from_ptr(app_path) }.to_string_lossy().into_owned();
    match shim(first_arg, Path::new(&path)) {
        Ok(payload) => payload,
        Err(e) => {
            match &e {
                EngineError::Uncaught(text) => eprintln!("uncaught exception: {}", text),
                _ => {
                    error!(target: "mire::ffi", "{}", e);
                    eprintln!("error: {}", e);
                }
            }
            std::process::exit(e.exit_code());
        }
    }
}
