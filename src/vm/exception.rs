//! Static-mode exception dispatch.
//!
//! A throw stores the exception object in the frame's thrown-value slot and
//! lands here. The active `javatry` lists its catch blocks; each
//! `javacatch` lists the class words it accepts, with a zero offset meaning
//! "catch everything". The first match in declaration order wins. With no
//! match the frame releases its counted formals and locals and the object
//! unwinds to the caller.

use tracing::debug;

use crate::error::{EngineError, Unwind};

use super::frame::Frame;
use super::image::Image;
use super::ops::{BASE_SIZE, Instr, Opcode, read_i32, read_u64};
use super::primtype::PrimType;
use super::runtime::{BuiltinException, StaticRuntime};

/// Routes the exception in the thrown-value slot.
///
/// Returns `Ok` with the frame positioned on the first instruction of the
/// matching catch block, or the unwind to hand to the caller.
pub fn dispatch(image: &Image, runtime: &dyn StaticRuntime, frame: &mut Frame<'_>) -> Result<(), Unwind> {
    if frame.thrown() == 0 {
        frame.set_thrown(runtime.new_exception(BuiltinException::NullPointer));
    }
    let thrown = frame.thrown();

    if let Some(try_pc) = frame.try_catch {
        if let Some(target) = find_catch(image, runtime, try_pc, thrown)? {
            debug!(target: "mire::exception", "caught {:#x} at {:#x}", thrown, target);
            frame.pc = target;
            frame.try_catch = None;
            frame.reset_sp();
            return Ok(());
        }
    }

    release_frame_refs(runtime, frame, thrown);
    frame.collapse();
    debug!(target: "mire::exception", "unwinding {:#x} from method at {:#x}", thrown, frame.header.at);
    Err(Unwind::Exception(thrown))
}

/// Scans the catch tables of the `javatry` at `try_pc`.
fn find_catch(
    image: &Image,
    runtime: &dyn StaticRuntime,
    try_pc: usize,
    thrown: u64,
) -> Result<Option<usize>, EngineError> {
    let code = image.code();
    let try_stmt = Instr::decode(code, try_pc)?;
    if try_stmt.op != Opcode::Javatry {
        return Err(EngineError::malformed(try_pc, "active try region is not a javatry"));
    }
    for i in 0..try_stmt.num_cases() {
        let field = try_pc + BASE_SIZE + 4 * i;
        let catch_pc = (field as i64 + read_i32(code, field)? as i64) as usize;
        let catch_stmt = Instr::decode(code, catch_pc)?;
        if catch_stmt.op != Opcode::Javacatch {
            return Err(EngineError::malformed(catch_pc, "catch table entry is not a javacatch"));
        }
        let num_types = catch_stmt.num_cases();
        for j in 0..num_types {
            let type_field = catch_pc + BASE_SIZE + 4 * j;
            let rel = read_i32(code, type_field)?;
            let matched = rel == 0 || {
                let class = read_u64(code, (type_field as i64 + rel as i64) as usize)?;
                runtime.instance_of(thrown, class)
            };
            if matched {
                return Ok(Some(catch_pc + BASE_SIZE + 4 * num_types));
            }
        }
    }
    Ok(None)
}

/// Reference-count cleanup on the unhandled path.
///
/// Formals marked 1 are released. Locals marked 2 or 3 holding a non-null
/// `a64` other than the thrown object are released; locals marked 4 or 5
/// are retained once more.
fn release_frame_refs(runtime: &dyn StaticRuntime, frame: &Frame<'_>, thrown: u64) {
    for (i, info) in frame.header.formals.iter().enumerate() {
        if info.rc_class != 1 {
            continue;
        }
        if let Ok(arg) = frame.formal(i + 1) {
            let obj = arg.to_bits();
            if obj != 0 {
                runtime.dec_ref(obj);
            }
        }
    }

    for (i, info) in frame.header.locals.iter().enumerate() {
        let Some(slot) = frame.local_slot(i) else {
            continue;
        };
        if slot.ty != PrimType::A64 || slot.bits == 0 {
            continue;
        }
        match info.rc_class {
            2 | 3 if slot.bits != thrown => runtime.dec_ref(slot.bits),
            4 | 5 => runtime.inc_ref(slot.bits),
            _ => {}
        }
    }
}
