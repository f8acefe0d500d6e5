//! Static-mode interpreter.
//!
//! One `StaticEngine` owns a loaded image, the runtime collaborator and the
//! native/intrinsic tables. It is shareable across threads: every call
//! chain runs on the invoking thread with its frames on that thread's
//! stack. Guest exceptions travel as `Unwind::Exception` through `Result`,
//! never as Rust panics.

use std::sync::Arc;
use std::sync::atomic::{Ordering, fence};

use tracing::{debug, trace, warn};

use crate::config::{RuntimeConfig, UnresolvedCallPolicy};
use crate::error::{EngineError, Unwind};

use super::arith::{self, ArithError};
use super::exception;
use super::frame::Frame;
use super::image::{Image, Mode};
use super::intrinsic::{IntrinsicId, IntrinsicTable};
use super::loadstore;
use super::native::{NativeTable, call_with_ffi};
use super::ops::{BASE_SIZE, Instr, Opcode, branch_target, call_name, read_i32, read_u32, read_u64};
use super::primtype::PrimType;
use super::runtime::{BuiltinException, ClassInitState, ClinitStatus, StaticRuntime};
use super::value::{MValue, Slot};

/// Addresses below this are treated as null.
const NULL_PAGE: u64 = 0x1000;

/// Interpreted call nesting limit.
pub const MAX_CALL_DEPTH: usize = 2048;

/// What the dispatch loop does after one instruction.
#[derive(Debug)]
enum Flow {
    Next,
    Jump(usize),
    Return(MValue),
    /// The thrown-value slot holds an exception to dispatch.
    Throw,
}

/// Where a callee address leads.
enum Callee {
    Interpreted(usize),
    Native(u64),
}

pub struct StaticEngine {
    image: Image,
    runtime: Arc<dyn StaticRuntime>,
    natives: NativeTable,
    intrinsics: IntrinsicTable,
    config: RuntimeConfig,
}

impl StaticEngine {
    pub fn new(image: Image, runtime: Arc<dyn StaticRuntime>) -> Result<Self, EngineError> {
        if image.mode() != Mode::Static {
            return Err(EngineError::WrongMode {
                op: "static invoke",
                mode: image.mode().name(),
            });
        }
        Ok(StaticEngine {
            image,
            runtime,
            natives: NativeTable::default(),
            intrinsics: IntrinsicTable::default(),
            config: RuntimeConfig::default(),
        })
    }

    pub fn with_config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn image(&self) -> &Image {
        &self.image
    }

    pub fn runtime(&self) -> &Arc<dyn StaticRuntime> {
        &self.runtime
    }

    pub fn natives_mut(&mut self) -> &mut NativeTable {
        &mut self.natives
    }

    pub fn intrinsics_mut(&mut self) -> &mut IntrinsicTable {
        &mut self.intrinsics
    }

    /// Absolute address of the method at code offset `offset`.
    pub fn method_addr(&self, offset: usize) -> u64 {
        self.image.addr_of(offset)
    }

    /// Invokes the interpreted method at absolute address `method`.
    ///
    /// `args` become the callee's formals in place; the callee may write
    /// them.
    pub fn invoke(&self, method: u64, args: &mut [Slot]) -> Result<MValue, Unwind> {
        match self.classify(method)? {
            Callee::Interpreted(offset) => self.invoke_at(offset, args, 0),
            Callee::Native(_) => Err(EngineError::NotAMethod(method).into()),
        }
    }

    /// Runs the image's entry method with `args` and collapses any unwind
    /// into a fatal error.
    pub fn run_entry(&self, args: &[MValue]) -> Result<MValue, EngineError> {
        let mut slots: Vec<Slot> = args.iter().map(|&v| Slot::from(v)).collect();
        let entry = self.method_addr(self.image.entry() as usize);
        self.invoke(entry, &mut slots).map_err(Unwind::into_engine_error)
    }

    fn classify(&self, addr: u64) -> Result<Callee, EngineError> {
        if addr == 0 {
            return Err(EngineError::NullCallee);
        }
        match self.image.offset_of(addr) {
            Some(offset) if self.image.is_method(offset) => Ok(Callee::Interpreted(offset)),
            _ => Ok(Callee::Native(addr)),
        }
    }

    fn invoke_at(&self, offset: usize, args: &mut [Slot], depth: usize) -> Result<MValue, Unwind> {
        if depth >= MAX_CALL_DEPTH {
            return Err(EngineError::StackOverflow.into());
        }
        let header = self.image.method_header(offset)?;
        if header.formals_num != 0 && header.formals_num as usize != args.len() {
            return Err(EngineError::ArityMismatch {
                formals: header.formals_num,
                actual: args.len(),
            }
            .into());
        }
        if self.config.trace.calls {
            debug!(target: "mire::call", "enter method {:#x} ({} args, depth {})", offset, args.len(), depth);
        }
        let mut frame = Frame::new(header, args);
        let result = self.execute(&mut frame, depth);
        if self.config.trace.calls {
            debug!(target: "mire::call", "leave method {:#x}", offset);
        }
        result
    }

    fn execute(&self, frame: &mut Frame<'_>, depth: usize) -> Result<MValue, Unwind> {
        let code = self.image.code();
        loop {
            let pc = frame.pc;
            let instr = Instr::decode(code, pc)?;
            if self.config.trace.opcodes {
                trace!(target: "mire::dispatch", pc, op = instr.op.name(), depth = frame.depth());
            }
            match self.execute_op(instr, frame, depth)? {
                Flow::Next => frame.pc = pc + instr.size(code, pc)?,
                Flow::Jump(target) => frame.pc = target,
                Flow::Return(value) => return Ok(value),
                Flow::Throw => exception::dispatch(&self.image, self.runtime.as_ref(), frame)?,
            }
        }
    }

    fn execute_op(&self, instr: Instr, frame: &mut Frame<'_>, depth: usize) -> Result<Flow, EngineError> {
        let code = self.image.code();
        let pc = frame.pc;

        match instr.op {
            // ========================================
            // Reads
            // ========================================
            Opcode::Dread | Opcode::Regread => {
                let ty = instr.prim_type()?;
                let idx = instr.frame_idx();
                let value = if idx > 0 {
                    let v = frame.formal(idx as usize)?;
                    if instr.op == Opcode::Regread { v.retag(ty) } else { v }
                } else {
                    frame.local((-(idx as i32)) as usize)?.retag(ty)
                };
                frame.push(value)?;
            }
            Opcode::Iread | Opcode::Ireadoff | Opcode::Ireadoff32 => {
                let ty = instr.prim_type()?;
                let base = frame.pop()?.address();
                if base < NULL_PAGE {
                    return Ok(self.throw_null(frame));
                }
                let offset = match instr.op {
                    Opcode::Iread => 0,
                    Opcode::Ireadoff => instr.offset() as i64,
                    _ => read_i32(code, pc + BASE_SIZE)? as i64,
                };
                let addr = base.wrapping_add(offset as u64);
                let value = unsafe { loadstore::load(addr as *const u8, ty)? };
                frame.push(value)?;
            }
            Opcode::Ireadfpoff | Opcode::Iassignfpoff => {
                return Err(EngineError::WrongMode {
                    op: instr.op.name(),
                    mode: "static",
                });
            }
            Opcode::Addrof => {
                let ty = instr.prim_type()?;
                let idx = instr.frame_idx();
                let addr = if idx > 0 {
                    frame.formal_addr(idx as usize)?
                } else {
                    frame.local_addr((-(idx as i32)) as usize)?
                };
                frame.push(MValue::from_bits(ty, addr))?;
            }
            Opcode::Addroffunc | Opcode::Conststr => {
                let ty = instr.prim_type()?;
                let offset = read_u32(code, pc + BASE_SIZE)? as usize;
                if offset >= code.len() {
                    return Err(EngineError::malformed(pc, "image offset out of range"));
                }
                frame.push(MValue::from_bits(ty, self.image.addr_of(offset)))?;
            }
            Opcode::Constval => {
                let ty = instr.prim_type()?;
                frame.push(constval(ty, instr.param, pc)?)?;
            }
            Opcode::Constval64 => {
                let ty = instr.prim_type()?;
                let bits = read_u64(code, pc + BASE_SIZE)?;
                frame.push(MValue::from_bits(ty, bits))?;
            }

            // ========================================
            // Writes
            // ========================================
            Opcode::Dassign | Opcode::Regassign => {
                let ty = instr.prim_type()?;
                let value = frame.pop()?;
                if instr.op == Opcode::Dassign && value.prim_type() != ty {
                    return Err(EngineError::TypeMismatch {
                        expected: ty,
                        found: value.prim_type(),
                    });
                }
                let idx = instr.frame_idx();
                if idx > 0 {
                    frame.set_formal(idx as usize, value)?;
                } else {
                    frame.set_local((-(idx as i32)) as usize, value)?;
                }
            }
            Opcode::Iassignoff | Opcode::Iassignoff32 => {
                let ty = instr.prim_type()?;
                let value = frame.pop()?;
                let base = frame.pop()?.address();
                if base < NULL_PAGE {
                    return Ok(self.throw_null(frame));
                }
                let offset = if instr.op == Opcode::Iassignoff {
                    instr.offset() as i64
                } else {
                    read_i32(code, pc + BASE_SIZE)? as i64
                };
                let addr = base.wrapping_add(offset as u64);
                unsafe { loadstore::store(addr as *mut u8, ty, value)? };
            }

            // ========================================
            // Arithmetic
            // ========================================
            Opcode::Add
            | Opcode::Sub
            | Opcode::Mul
            | Opcode::Div
            | Opcode::Rem
            | Opcode::Ashr
            | Opcode::Lshr
            | Opcode::Shl
            | Opcode::Band
            | Opcode::Bior
            | Opcode::Bxor
            | Opcode::Land
            | Opcode::Lior
            | Opcode::Max
            | Opcode::Min => {
                let ty = instr.prim_type()?;
                let b = frame.pop()?;
                let a = frame.pop()?;
                match arith::binary(instr.op, ty, a, b) {
                    Ok(v) => frame.push(v)?,
                    Err(ArithError::DivideByZero) => {
                        let ex = self.runtime.new_exception(BuiltinException::Arithmetic);
                        frame.set_thrown(ex);
                        return Ok(Flow::Throw);
                    }
                    Err(ArithError::Fatal(e)) => return Err(e),
                }
            }
            Opcode::Eq
            | Opcode::Ne
            | Opcode::Lt
            | Opcode::Le
            | Opcode::Gt
            | Opcode::Ge
            | Opcode::Cmp
            | Opcode::Cmpl
            | Opcode::Cmpg => {
                let ty = instr.prim_type()?;
                let operand = instr.op_ptyp()?;
                let b = frame.pop()?;
                let a = frame.pop()?;
                frame.push(arith::compare(instr.op, ty, operand, a, b)?)?;
            }
            Opcode::Neg | Opcode::Bnot | Opcode::Lnot => {
                let ty = instr.prim_type()?;
                let v = frame.pop()?;
                frame.push(arith::unary(instr.op, ty, v)?)?;
            }
            Opcode::Cvt => {
                let v = frame.pop()?;
                frame.push(arith::cvt(instr.prim_type()?, instr.op_ptyp()?, v)?)?;
            }
            Opcode::Retype => {
                let ty = instr.prim_type()?;
                let from = instr.op_ptyp()?;
                let v = frame.pop()?;
                if v.prim_type() != from {
                    return Err(EngineError::TypeMismatch {
                        expected: from,
                        found: v.prim_type(),
                    });
                }
                frame.push(v.retag(ty))?;
            }
            Opcode::Sext | Opcode::Zext | Opcode::Extractbits => {
                let ty = instr.prim_type()?;
                let v = frame.pop()?;
                frame.push(arith::bit_field(instr.op, ty, v, instr.bit_offset(), instr.bit_size())?)?;
            }
            Opcode::Select => {
                let if_false = frame.pop()?;
                let if_true = frame.pop()?;
                let cond = frame.pop()?;
                frame.push(if cond.is_zero() { if_false } else { if_true })?;
            }

            // ========================================
            // Control flow
            // ========================================
            Opcode::Goto => {
                let next = pc + BASE_SIZE + 4;
                if code.get(next) == Some(&(Opcode::Endtry as u8)) {
                    frame.try_catch = None;
                }
                return Ok(Flow::Jump(branch_target(code, pc + BASE_SIZE)?));
            }
            Opcode::Brtrue | Opcode::Brfalse => {
                let cond = !frame.pop()?.is_zero();
                if cond == (instr.op == Opcode::Brtrue) {
                    return Ok(Flow::Jump(branch_target(code, pc + BASE_SIZE)?));
                }
            }
            Opcode::Rangegoto => {
                let adjust = read_i32(code, pc + BASE_SIZE)? as i64;
                let v = frame.pop()?.retag(PrimType::I32).as_i64();
                let idx = v - adjust;
                if idx < 0 || idx as usize >= instr.num_cases() {
                    return Err(EngineError::malformed(
                        pc,
                        format!("rangegoto index {} out of {} cases", idx, instr.num_cases()),
                    ));
                }
                let field = pc + BASE_SIZE + 4 + 4 * idx as usize;
                return Ok(Flow::Jump(branch_target(code, field)?));
            }
            Opcode::Return => {
                if !frame.base_intact() {
                    return Err(EngineError::malformed(pc, "operand stack base overwritten"));
                }
                let value = if instr.num_opnds() == 0 { MValue::Void } else { frame.top()? };
                return Ok(Flow::Return(value));
            }
            Opcode::Eval => {
                frame.pop()?;
            }

            // ========================================
            // Calls
            // ========================================
            Opcode::Call => return self.direct_call(instr, frame),
            Opcode::Icall => {
                let ret = instr.prim_type()?;
                return self.indirect_call(ret, instr.num_opnds(), frame, depth);
            }
            Opcode::Intrinsiccall => return self.invoke_intrinsic(instr, frame, depth),

            // ========================================
            // Exceptions
            // ========================================
            Opcode::Javatry => frame.try_catch = Some(pc),
            Opcode::Javacatch => {}
            Opcode::Throw => {
                let obj = frame.pop()?.address();
                frame.set_thrown(obj);
                return Ok(Flow::Throw);
            }
            Opcode::Endtry | Opcode::Cleanuptry => frame.try_catch = None,
            Opcode::Jstry | Opcode::Jscatch | Opcode::Finally | Opcode::Gosub | Opcode::Retsub => {
                return Err(EngineError::WrongMode {
                    op: instr.op.name(),
                    mode: "static",
                });
            }

            // ========================================
            // Scheduling and memory ordering
            // ========================================
            Opcode::Checkpoint => {}
            Opcode::Membaracquire => fence(Ordering::Acquire),
            Opcode::Membarrelease => fence(Ordering::Release),
            Opcode::Membarstoreload => fence(Ordering::SeqCst),
            Opcode::Membarstorestore => fence(Ordering::Release),
        }
        Ok(Flow::Next)
    }

    fn throw_null(&self, frame: &mut Frame<'_>) -> Flow {
        // dispatch turns a null thrown value into a NullPointerException
        frame.set_thrown(0);
        Flow::Throw
    }

    /// Pops `n` argument values, bottom first.
    fn pop_args(frame: &mut Frame<'_>, n: usize) -> Result<Vec<MValue>, EngineError> {
        let values = frame.top_slots(n)?.iter().map(Slot::get).collect();
        frame.drop_n(n)?;
        Ok(values)
    }

    fn direct_call(&self, instr: Instr, frame: &mut Frame<'_>) -> Result<Flow, EngineError> {
        let ret = instr.prim_type()?;
        let nargs = instr.num_opnds();
        let name = call_name(self.image.code(), frame.pc)?;
        let args = Self::pop_args(frame, nargs)?;
        match self.natives.lookup(name) {
            Some(addr) => {
                debug!(target: "mire::call", "direct call {} ({} args)", name, nargs);
                let value = unsafe { call_with_ffi(addr, ret, &args)? };
                frame.set_returnval(value);
            }
            None => match self.config.unresolved_call {
                UnresolvedCallPolicy::Ignore => {}
                UnresolvedCallPolicy::Warn => {
                    warn!(target: "mire::call", "unresolved call target `{}`; {} arguments discarded", name, nargs);
                }
                UnresolvedCallPolicy::Error => return Err(EngineError::UnresolvedCall(name.to_string())),
            },
        }
        Ok(Flow::Next)
    }

    /// `icall`: the callee sits beneath its `nopnds - 1` arguments.
    fn indirect_call(&self, ret: PrimType, nopnds: usize, frame: &mut Frame<'_>, depth: usize) -> Result<Flow, EngineError> {
        if nopnds == 0 {
            return Err(EngineError::malformed(frame.pc, "icall without a callee operand"));
        }
        let actual = nopnds - 1;
        let callee = frame.top_slots(nopnds)?[0].bits;
        match self.classify(callee)? {
            Callee::Interpreted(offset) => {
                let formals = self.image.method_header(offset)?.formals_num as usize;
                // a zero-formal weak stub accepts any argument count
                if formals != 0 && formals != actual {
                    return Err(EngineError::ArityMismatch {
                        formals: formals as u16,
                        actual,
                    });
                }
                debug!(target: "mire::call", "icall interpreted {:#x} ({} args)", offset, actual);
                let result = {
                    let args = frame.top_slots(formals)?;
                    self.invoke_at(offset, args, depth + 1)
                };
                frame.drop_n(nopnds)?;
                match result {
                    Ok(value) => frame.set_returnval(value.retag(ret)),
                    Err(Unwind::Exception(obj)) => {
                        frame.set_thrown(obj);
                        return Ok(Flow::Throw);
                    }
                    Err(Unwind::Fatal(e)) => return Err(e),
                }
            }
            Callee::Native(addr) => {
                debug!(target: "mire::call", "icall native {:#x} ({} args)", addr, actual);
                let args = Self::pop_args(frame, actual)?;
                frame.drop_n(1)?;
                let value = unsafe { call_with_ffi(addr, ret, &args)? };
                frame.set_returnval(value);
            }
        }
        Ok(Flow::Next)
    }

    fn invoke_intrinsic(&self, instr: Instr, frame: &mut Frame<'_>, depth: usize) -> Result<Flow, EngineError> {
        let ret = instr.prim_type()?;
        let nargs = instr.intrinsic_opnds();
        let raw_id = instr.intrinsic_id();
        let id = IntrinsicId::from_u8(raw_id);
        debug!(target: "mire::call", "intrinsic {}", id.map_or("?", IntrinsicId::name));

        if let Some(addr) = self.intrinsics.native(raw_id) {
            let args = Self::pop_args(frame, nargs)?;
            let value = unsafe { call_with_ffi(addr, ret, &args)? };
            frame.set_returnval(value);
            if id.is_some_and(IntrinsicId::is_allocation) {
                self.runtime.on_new_object(value.address());
            }
            return Ok(Flow::Next);
        }

        match id {
            Some(IntrinsicId::MplClinitCheck) => self.clinit_check(frame, depth),
            Some(IntrinsicId::MplCleanupLocalRefVars) => {
                for _ in 0..nargs {
                    self.release(frame.pop()?);
                }
                Ok(Flow::Next)
            }
            Some(IntrinsicId::MplCleanupLocalRefVarsSkip) => {
                // the last argument is the value being kept
                frame.pop()?;
                for _ in 1..nargs {
                    self.release(frame.pop()?);
                }
                Ok(Flow::Next)
            }
            Some(IntrinsicId::MccCallSlowNative) => {
                self.runtime.enter_saferegion();
                let flow = self.indirect_call(ret, nargs, frame, depth);
                self.runtime.leave_saferegion();
                flow
            }
            Some(other) if other.is_dynamic() => Err(EngineError::WrongMode {
                op: other.name(),
                mode: "static",
            }),
            _ => Err(EngineError::UnknownIntrinsic(raw_id)),
        }
    }

    fn release(&self, value: MValue) {
        let obj = value.to_bits();
        if obj != 0 {
            self.runtime.dec_ref(obj);
        }
    }

    /// `MPL_CLINIT_CHECK`: runs the initializers `classinfo` depends on.
    fn clinit_check(&self, frame: &mut Frame<'_>, depth: usize) -> Result<Flow, EngineError> {
        let addr = frame.pop()?.address();
        if addr < NULL_PAGE {
            return Ok(self.throw_null(frame));
        }
        let classinfo = unsafe { (addr as *const u64).read_unaligned() };
        let steps = self.runtime.prepare_clinit(classinfo);

        let mut skip_children = false;
        let mut no_class_def: Option<u64> = None;
        let mut thrown: Option<u64> = None;

        for step in steps {
            if skip_children {
                self.runtime.finalize_clinit(step.class, ClinitStatus::Skipped);
                continue;
            }
            if step.class != 0 && self.runtime.class_init_state(step.class) == ClassInitState::Failure {
                no_class_def = Some(self.runtime.new_exception(BuiltinException::NoClassDefFound));
                skip_children = true;
                continue;
            }
            if step.clinit == 0 {
                continue;
            }
            debug!(target: "mire::call", "running class initializer {:#x}", step.clinit);
            let outcome = match self.classify(step.clinit)? {
                Callee::Interpreted(offset) => {
                    let header = self.image.method_header(offset)?;
                    if header.formals_num != 0 {
                        return Err(EngineError::ArityMismatch {
                            formals: header.formals_num,
                            actual: 0,
                        });
                    }
                    self.invoke_at(offset, &mut [], depth + 1).map(|_| ())
                }
                Callee::Native(fp) => unsafe { call_with_ffi(fp, PrimType::Void, &[]) }
                    .map(|_| ())
                    .map_err(Unwind::Fatal),
            };
            match outcome {
                Ok(()) => self.runtime.finalize_clinit(step.class, ClinitStatus::Normal),
                Err(Unwind::Exception(ex)) => {
                    thrown = Some(ex);
                    self.runtime.finalize_clinit(step.class, ClinitStatus::Thrown);
                    skip_children = true;
                }
                Err(Unwind::Fatal(e)) => return Err(e),
            }
        }

        if let Some(err) = no_class_def {
            frame.set_thrown(err);
            return Ok(Flow::Throw);
        }
        if let Some(ex) = thrown {
            let to_throw = if self.runtime.is_error(ex) {
                ex
            } else {
                self.runtime.dec_ref(ex);
                self.runtime.new_exception(BuiltinException::ExceptionInInitializer)
            };
            frame.set_thrown(to_throw);
            return Ok(Flow::Throw);
        }
        Ok(Flow::Next)
    }
}

/// Immediate of a 16-bit `constval`.
pub(super) fn constval(ty: PrimType, param: u16, pc: usize) -> Result<MValue, EngineError> {
    let bits = match ty {
        PrimType::I8 => param as u8 as i8 as i64 as u64,
        PrimType::I16 | PrimType::I32 | PrimType::I64 => param as i16 as i64 as u64,
        PrimType::U1 | PrimType::U8 => param as u8 as u64,
        PrimType::U16 | PrimType::U32 | PrimType::U64 | PrimType::A64 => param as u64,
        other => return Err(EngineError::malformed(pc, format!("constval of type {}", other))),
    };
    Ok(MValue::from_bits(ty, bits))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::asm::{Assembler, MethodSpec};
    use crate::vm::runtime::SimpleRuntime;

    fn engine(asm: Assembler, entry: usize) -> StaticEngine {
        let image = asm.finish(Mode::Static, entry).unwrap();
        StaticEngine::new(image, Arc::new(SimpleRuntime::new())).unwrap()
    }

    #[test]
    fn test_constval_extension() {
        assert_eq!(constval(PrimType::I8, 0x00ff, 0).unwrap(), MValue::I8(-1));
        assert_eq!(constval(PrimType::I64, 0xffff, 0).unwrap(), MValue::I64(-1));
        assert_eq!(constval(PrimType::U8, 0x01ff, 0).unwrap(), MValue::U8(0xff));
        assert_eq!(constval(PrimType::U64, 0xffff, 0).unwrap(), MValue::U64(0xffff));
        assert!(constval(PrimType::F64, 0, 0).is_err());
    }

    #[test]
    fn test_add_constants() {
        let mut asm = Assembler::new();
        let m = asm.begin_method(&MethodSpec::new().reserved_slots().eval_depth(2));
        asm.constval(PrimType::I32, 5)
            .constval(PrimType::I32, 3)
            .binary(Opcode::Add, PrimType::I32)
            .ret(PrimType::I32);
        let engine = engine(asm, m);
        assert_eq!(engine.run_entry(&[]).unwrap(), MValue::I32(8));
    }

    #[test]
    fn test_formals_and_locals() {
        let mut asm = Assembler::new();
        let m = asm.begin_method(
            &MethodSpec::new()
                .formal(PrimType::I64, 0)
                .reserved_slots()
                .local(PrimType::I64, 0)
                .eval_depth(2),
        );
        asm.dread(PrimType::I64, 1)
            .constval(PrimType::I64, 10)
            .binary(Opcode::Mul, PrimType::I64)
            .dassign(PrimType::I64, -2)
            .dread(PrimType::I64, -2)
            .ret(PrimType::I64);
        let engine = engine(asm, m);
        assert_eq!(engine.run_entry(&[MValue::I64(7)]).unwrap(), MValue::I64(70));
    }

    #[test]
    fn test_dassign_type_mismatch_is_fatal() {
        let mut asm = Assembler::new();
        let m = asm.begin_method(&MethodSpec::new().reserved_slots().local(PrimType::I64, 0).eval_depth(1));
        asm.constval(PrimType::I32, 1).dassign(PrimType::I64, -2).ret(PrimType::Void);
        let engine = engine(asm, m);
        assert!(matches!(engine.run_entry(&[]), Err(EngineError::TypeMismatch { .. })));
    }

    #[test]
    fn test_loop_with_branches() {
        // sum = 0; i = 10; while (i != 0) { sum += i; i -= 1 } return sum
        let mut asm = Assembler::new();
        let m = asm.begin_method(
            &MethodSpec::new()
                .reserved_slots()
                .local(PrimType::I32, 0)
                .local(PrimType::I32, 0)
                .eval_depth(2),
        );
        asm.constval(PrimType::I32, 10).dassign(PrimType::I32, -3);
        let top = asm.here();
        let done = asm.label();
        asm.dread(PrimType::I32, -3).branch(Opcode::Brfalse, done);
        asm.dread(PrimType::I32, -2)
            .dread(PrimType::I32, -3)
            .binary(Opcode::Add, PrimType::I32)
            .dassign(PrimType::I32, -2);
        asm.dread(PrimType::I32, -3)
            .constval(PrimType::I32, 1)
            .binary(Opcode::Sub, PrimType::I32)
            .dassign(PrimType::I32, -3);
        asm.branch(Opcode::Goto, top);
        asm.bind(done);
        asm.dread(PrimType::I32, -2).ret(PrimType::I32);
        let engine = engine(asm, m);
        assert_eq!(engine.run_entry(&[]).unwrap(), MValue::I32(55));
    }

    #[test]
    fn test_addrof_and_indirect_access() {
        let mut asm = Assembler::new();
        let m = asm.begin_method(&MethodSpec::new().reserved_slots().local(PrimType::I32, 0).eval_depth(3));
        asm.op(Opcode::Addrof, PrimType::A64, (-2i16) as u16)
            .constval(PrimType::I32, 41)
            .op(Opcode::Iassignoff, PrimType::I32, 0);
        asm.op(Opcode::Addrof, PrimType::A64, (-2i16) as u16)
            .op(Opcode::Iread, PrimType::I32, 0)
            .constval(PrimType::I32, 1)
            .binary(Opcode::Add, PrimType::I32)
            .ret(PrimType::I32);
        let engine = engine(asm, m);
        assert_eq!(engine.run_entry(&[]).unwrap(), MValue::I32(42));
    }

    #[test]
    fn test_unresolved_call_policies() {
        let build = || {
            let mut asm = Assembler::new();
            let m = asm.begin_method(&MethodSpec::new().reserved_slots().eval_depth(2));
            asm.constval(PrimType::I32, 1)
                .call(PrimType::I32, 1, "no_such_function")
                .constval(PrimType::I32, 2)
                .ret(PrimType::I32);
            engine(asm, m)
        };
        assert_eq!(build().run_entry(&[]).unwrap(), MValue::I32(2));

        let mut config = RuntimeConfig::default();
        config.unresolved_call = UnresolvedCallPolicy::Error;
        let err = build().with_config(config).run_entry(&[]).unwrap_err();
        assert!(matches!(err, EngineError::UnresolvedCall(name) if name == "no_such_function"));
    }

    #[test]
    fn test_direct_call_reaches_libc() {
        let mut asm = Assembler::new();
        let m = asm.begin_method(&MethodSpec::new().reserved_slots().eval_depth(2));
        asm.constval(PrimType::I32, -12)
            .call(PrimType::I32, 1, "abs")
            .regread(PrimType::I32, 0)
            .ret(PrimType::I32);
        let engine = engine(asm, m);
        assert_eq!(engine.run_entry(&[]).unwrap(), MValue::I32(12));
    }

    #[test]
    fn test_rangegoto() {
        let mut asm = Assembler::new();
        let m = asm.begin_method(&MethodSpec::new().formal(PrimType::I32, 0).reserved_slots().eval_depth(1));
        let cases = [asm.label(), asm.label(), asm.label()];
        asm.dread(PrimType::I32, 1).rangegoto(PrimType::I32, 10, &cases);
        for (i, l) in cases.iter().enumerate() {
            asm.bind(*l);
            asm.constval(PrimType::I32, 100 + i as i16).ret(PrimType::I32);
        }
        let engine = engine(asm, m);
        assert_eq!(engine.run_entry(&[MValue::I32(11)]).unwrap(), MValue::I32(101));
        assert!(matches!(
            engine.run_entry(&[MValue::I32(13)]),
            Err(EngineError::Malformed { .. })
        ));
    }

    #[test]
    fn test_select_and_compare() {
        let mut asm = Assembler::new();
        let m = asm.begin_method(&MethodSpec::new().reserved_slots().eval_depth(3));
        asm.constval(PrimType::I32, 3)
            .constval(PrimType::I32, 4)
            .compare(Opcode::Lt, PrimType::U1, PrimType::I32)
            .constval(PrimType::I32, 7)
            .constval(PrimType::I32, 9)
            .op(Opcode::Select, PrimType::I32, 0)
            .ret(PrimType::I32);
        let engine = engine(asm, m);
        assert_eq!(engine.run_entry(&[]).unwrap(), MValue::I32(7));
    }

    #[test]
    fn test_stack_underflow_is_fatal() {
        let mut asm = Assembler::new();
        let m = asm.begin_method(&MethodSpec::new().reserved_slots().eval_depth(1));
        asm.binary(Opcode::Add, PrimType::I32).ret(PrimType::Void);
        let engine = engine(asm, m);
        assert!(matches!(engine.run_entry(&[]), Err(EngineError::StackUnderflow)));
    }

    #[test]
    fn test_dynamic_opcode_rejected() {
        let mut asm = Assembler::new();
        let m = asm.begin_method(&MethodSpec::new().reserved_slots());
        asm.stmt(Opcode::Retsub);
        let engine = engine(asm, m);
        assert!(matches!(engine.run_entry(&[]), Err(EngineError::WrongMode { .. })));
    }
}
