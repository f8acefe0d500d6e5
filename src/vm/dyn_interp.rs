//! Dynamic-mode interpreter.
//!
//! A `DynEngine` owns the image and the [`DynContext`] of one program run.
//! Values are NaN-boxed [`JsValue`] cells; heap cells are counted by the
//! slots holding them (stack words, globals, registers, retval0, the
//! handler stack), never by the operand stack. Guest exceptions stay in the
//! handler stage machine: a frame either finds a target through
//! `get_eh_pc` or returns [`ExecStatus::HandleExc`] to its caller.

use std::io::Write;
use std::rc::Rc;
use std::sync::atomic::{Ordering, fence};

use tracing::{debug, trace};

use crate::config::RuntimeConfig;
use crate::error::EngineError;

use super::arith;
use super::context::{DynContext, from_mvalue};
use super::heap::JsHeap;
use super::image::{DynMethodHeader, Image, Mode};
use super::interp::{self, MAX_CALL_DEPTH};
use super::intrinsic::IntrinsicId;
use super::jsbuiltin::{self, ArgumentsMirror, IntrinsicError, JsError};
use super::jseh::EhEvent;
use super::jsops;
use super::nanbox::{DYN_POISON, JsTag, JsValue};
use super::ops::{BASE_SIZE, Instr, Opcode, branch_target, read_i32, read_u32, read_u64};
use super::primtype::PrimType;
use super::value::MValue;

/// Special register numbers of `regread`/`regassign`.
const REG_SP: i16 = -1;
const REG_FP: i16 = -2;
const REG_GP: i16 = -3;
const REG_THROWN: i16 = -4;
const REG_RETVAL0: i16 = -6;

/// Outcome of one instruction, and of a whole invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecStatus {
    /// A runtime error is pending and will be thrown.
    Error,
    /// Fall through to the next instruction.
    Ok,
    /// Branch taken; the pc is already set.
    Br,
    /// The method returned normally.
    Return,
    /// An exception escaped every handler.
    Terminate,
    /// `retsub` resumed at a saved return address.
    Retsub,
    /// An exception leaves this frame for the caller to resolve.
    HandleExc,
    /// Control moved to a catch or finally block.
    BrToStmt,
}

struct DynFrame {
    header: DynMethodHeader,
    id: u64,
    pc: usize,
    sp: usize,
    stack: Vec<JsValue>,
    /// Counted frame registers.
    regs: Vec<JsValue>,
    fault: Option<JsError>,
}

impl DynFrame {
    fn new(header: DynMethodHeader, id: u64) -> Self {
        let mut stack = vec![JsValue::UNDEFINED; header.eval_stack_depth as usize + 1];
        stack[0] = JsValue::from_raw(DYN_POISON);
        let pc = header.code_start();
        DynFrame {
            header,
            id,
            pc,
            sp: 0,
            stack,
            regs: Vec::new(),
            fault: None,
        }
    }

    #[inline]
    fn push(&mut self, v: JsValue) -> Result<(), EngineError> {
        let next = self.sp + 1;
        let slot = self.stack.get_mut(next).ok_or(EngineError::StackOverflow)?;
        *slot = v;
        self.sp = next;
        Ok(())
    }

    #[inline]
    fn pop(&mut self) -> Result<JsValue, EngineError> {
        if self.sp == 0 {
            return Err(EngineError::StackUnderflow);
        }
        let v = self.stack[self.sp];
        self.sp -= 1;
        Ok(v)
    }

    fn pop_n(&mut self, n: usize) -> Result<Vec<JsValue>, EngineError> {
        if self.sp < n {
            return Err(EngineError::StackUnderflow);
        }
        let args = self.stack[self.sp + 1 - n..=self.sp].to_vec();
        self.sp -= n;
        Ok(args)
    }

    fn base_intact(&self) -> bool {
        self.stack[0].raw() == DYN_POISON
    }

    fn reg(&self, idx: usize) -> JsValue {
        self.regs.get(idx).copied().unwrap_or(JsValue::UNDEFINED)
    }

    fn set_reg(&mut self, heap: &mut JsHeap, idx: usize, v: JsValue) {
        if idx >= self.regs.len() {
            self.regs.resize(idx + 1, JsValue::UNDEFINED);
        }
        heap.inc(v);
        let old = std::mem::replace(&mut self.regs[idx], v);
        heap.dec(old);
    }

    /// Empties the operand stack, freeing the uncounted cells it held.
    fn discard_stack(&mut self, heap: &mut JsHeap) {
        while self.sp > 0 {
            heap.release_if_floating(self.stack[self.sp]);
            self.sp -= 1;
        }
    }

    fn release_regs(&mut self, heap: &mut JsHeap) {
        for v in self.regs.drain(..) {
            heap.dec(v);
        }
    }

    fn fault(&mut self, e: JsError) -> ExecStatus {
        self.fault = Some(e);
        ExecStatus::Error
    }

    fn mirror(&self) -> ArgumentsMirror {
        let aliased = !self.header.is_strict() && self.header.uses_arguments();
        ArgumentsMirror {
            formals: if aliased { self.header.formals_num() } else { 0 },
        }
    }
}

pub struct DynEngine {
    image: Rc<Image>,
    ctx: DynContext,
    config: RuntimeConfig,
}

impl DynEngine {
    pub fn new(image: Image, config: RuntimeConfig) -> Result<Self, EngineError> {
        if image.mode() != Mode::Dynamic {
            return Err(EngineError::WrongMode {
                op: "dynamic invoke",
                mode: image.mode().name(),
            });
        }
        let ctx = DynContext::new(&image, &config);
        Ok(DynEngine {
            image: Rc::new(image),
            ctx,
            config,
        })
    }

    /// Redirects `JS_PRINT` output.
    pub fn with_output(mut self, out: Box<dyn Write>) -> Self {
        self.ctx = self.ctx.with_output(out);
        self
    }

    pub fn image(&self) -> &Image {
        &self.image
    }

    pub fn context(&self) -> &DynContext {
        &self.ctx
    }

    pub fn context_mut(&mut self) -> &mut DynContext {
        &mut self.ctx
    }

    /// Runs the image's entry method.
    pub fn run_main(&mut self) -> Result<JsValue, EngineError> {
        self.run_method(self.image.entry() as usize)
    }

    /// Runs the method at `offset` as a program entry and returns retval0.
    ///
    /// An exception that escapes every handler becomes
    /// [`EngineError::Uncaught`] carrying its string form.
    pub fn run_method(&mut self, offset: usize) -> Result<JsValue, EngineError> {
        if !self.image.is_method(offset) {
            return Err(EngineError::NotAMethod(self.image.addr_of(offset)));
        }
        let header = self.image.dyn_method_header(offset)?;
        let saved = self.ctx.set_current_fn(Some(offset));
        let status = self.invoke(header, 0);
        self.ctx.set_current_fn(saved);
        match status? {
            ExecStatus::Return => Ok(self.ctx.retval0()),
            _ => {
                self.ctx.settle_handlers();
                let thrown = self
                    .ctx
                    .ehs
                    .take_uncaught()
                    .or_else(|| self.ctx.ehs.thrown())
                    .unwrap_or(JsValue::UNDEFINED);
                let text = self.ctx.heap.to_display(thrown);
                self.ctx.heap.dec(thrown);
                Err(EngineError::Uncaught(text))
            }
        }
    }

    /// Opens a frame, runs it and closes it again.
    fn invoke(&mut self, header: DynMethodHeader, depth: usize) -> Result<ExecStatus, EngineError> {
        if depth >= MAX_CALL_DEPTH {
            return Err(EngineError::StackOverflow);
        }
        let frame_size = header.frame_size as usize;
        self.ctx.prolog(frame_size)?;
        let mut frame = DynFrame::new(header, self.ctx.new_frame_id());
        let status = self.execute(&mut frame, depth)?;
        frame.discard_stack(&mut self.ctx.heap);
        if status == ExecStatus::Return {
            self.ctx.ehs.unwind_frame(frame.id);
            self.ctx.settle_handlers();
        }
        frame.release_regs(&mut self.ctx.heap);
        self.ctx.eplog(frame_size)?;
        Ok(status)
    }

    fn execute(&mut self, frame: &mut DynFrame, depth: usize) -> Result<ExecStatus, EngineError> {
        let image = Rc::clone(&self.image);
        let code = image.code();
        loop {
            let pc = frame.pc;
            let instr = Instr::decode(code, pc)?;
            if self.config.trace.opcodes {
                trace!(target: "mire::dispatch", pc, op = instr.op.name(), depth = frame.sp);
            }
            let mut status = self.execute_op(code, instr, frame, depth)?;
            if status == ExecStatus::Error {
                let err = frame
                    .fault
                    .take()
                    .ok_or_else(|| EngineError::malformed(pc, "error status without a pending error"))?;
                debug!(target: "mire::exception", "runtime error at {:#x}: {}", pc, err);
                let value = err.into_value(&mut self.ctx)?;
                status = self.throw_value(frame, value)?;
            }
            match status {
                ExecStatus::Ok => frame.pc = pc + instr.size(code, pc)?,
                ExecStatus::Br | ExecStatus::BrToStmt | ExecStatus::Retsub => {}
                ExecStatus::Return | ExecStatus::HandleExc | ExecStatus::Terminate => return Ok(status),
                ExecStatus::Error => return Err(EngineError::malformed(pc, "unresolved runtime error")),
            }
        }
    }

    fn execute_op(&mut self, code: &[u8], instr: Instr, frame: &mut DynFrame, depth: usize) -> Result<ExecStatus, EngineError> {
        let pc = frame.pc;

        match instr.op {
            // ========================================
            // Reads
            // ========================================
            Opcode::Dread => {
                let idx = instr.frame_idx();
                let v = if idx > 0 {
                    self.ctx.frame_word(8 * idx as i64)?
                } else {
                    frame.reg((-(idx as i32)) as usize)
                };
                frame.push(v)?;
            }
            Opcode::Regread => {
                let v = match instr.frame_idx() {
                    REG_SP => JsValue::boxed(JsTag::SpBase, self.ctx.sp() as u64),
                    REG_FP => JsValue::boxed(JsTag::FpBase, self.ctx.fp() as u64),
                    REG_GP => JsValue::boxed(JsTag::GpBase, 0),
                    REG_THROWN => self.ctx.ehs.thrown().unwrap_or(JsValue::UNDEFINED),
                    REG_RETVAL0 => self.ctx.retval0(),
                    idx if idx >= 0 => frame.reg(idx as usize),
                    idx => return Err(EngineError::malformed(pc, format!("no special register {}", idx))),
                };
                frame.push(v)?;
            }
            Opcode::Iread | Opcode::Ireadoff | Opcode::Ireadoff32 => {
                let ty = instr.prim_type()?;
                let base = frame.pop()?;
                let offset = match instr.op {
                    Opcode::Iread => 0,
                    Opcode::Ireadoff => instr.offset() as i64,
                    _ => read_i32(code, pc + BASE_SIZE)? as i64,
                };
                frame.push(self.ctx.load(base, offset, ty)?)?;
            }
            Opcode::Ireadfpoff => {
                frame.push(self.ctx.frame_word(instr.offset() as i64)?)?;
            }
            Opcode::Addrof => {
                let idx = instr.frame_idx();
                if idx <= 0 {
                    return Err(EngineError::malformed(pc, "frame registers have no address"));
                }
                let addr = self.ctx.fp() as u64 + 8 * idx as u64;
                frame.push(JsValue::boxed(JsTag::FpBase, addr))?;
            }
            Opcode::Addroffunc => {
                let offset = read_u32(code, pc + BASE_SIZE)? as usize;
                if !self.image.is_method(offset) {
                    return Err(EngineError::malformed(pc, format!("no method at {:#x}", offset)));
                }
                frame.push(JsValue::function(offset as u32))?;
            }
            Opcode::Conststr => {
                let offset = read_u32(code, pc + BASE_SIZE)? as usize;
                let bytes = code
                    .get(offset..)
                    .and_then(|rest| rest.split(|&b| b == 0).next())
                    .ok_or_else(|| EngineError::malformed(pc, "string offset out of range"))?;
                let s = self.ctx.heap.alloc_string(String::from_utf8_lossy(bytes))?;
                frame.push(s)?;
            }
            Opcode::Constval => {
                let ty = instr.prim_type()?;
                let n = if ty.is_dynamic() {
                    instr.param as i16 as i32
                } else {
                    interp::constval(ty, instr.param, pc)?.as_i64() as i32
                };
                frame.push(JsValue::number(n))?;
            }
            Opcode::Constval64 => {
                let ty = instr.prim_type()?;
                let bits = read_u64(code, pc + BASE_SIZE)?;
                frame.push(constval64(ty, bits))?;
            }

            // ========================================
            // Writes
            // ========================================
            Opcode::Dassign | Opcode::Regassign => {
                let v = frame.pop()?;
                if v.is_none() {
                    return Ok(frame.fault(JsError::undefined_variable()));
                }
                match instr.frame_idx() {
                    REG_RETVAL0 if instr.op == Opcode::Regassign => self.ctx.set_retval0(v),
                    idx if idx > 0 && instr.op == Opcode::Dassign => self.assign_formal(frame, 8 * idx as i64, v)?,
                    idx if idx <= 0 && instr.op == Opcode::Dassign => {
                        frame.set_reg(&mut self.ctx.heap, (-(idx as i32)) as usize, v)
                    }
                    idx if idx >= 0 => frame.set_reg(&mut self.ctx.heap, idx as usize, v),
                    idx => return Err(EngineError::malformed(pc, format!("cannot assign register {}", idx))),
                }
            }
            Opcode::Iassignoff | Opcode::Iassignoff32 => {
                let ty = instr.prim_type()?;
                let v = frame.pop()?;
                let base = frame.pop()?;
                if v.is_none() {
                    return Ok(frame.fault(JsError::undefined_variable()));
                }
                let offset = if instr.op == Opcode::Iassignoff {
                    instr.offset() as i64
                } else {
                    read_i32(code, pc + BASE_SIZE)? as i64
                };
                self.ctx.store(base, offset, ty, v)?;
            }
            Opcode::Iassignfpoff => {
                let v = frame.pop()?;
                if v.is_none() {
                    return Ok(frame.fault(JsError::undefined_variable()));
                }
                self.assign_formal(frame, instr.offset() as i64, v)?;
            }

            // ========================================
            // Arithmetic
            // ========================================
            Opcode::Add | Opcode::Sub | Opcode::Mul | Opcode::Div | Opcode::Rem | Opcode::Max | Opcode::Min => {
                let b = frame.pop()?;
                let a = frame.pop()?;
                if a.is_none() || b.is_none() {
                    self.release_operands(JsValue::NONE, &[a, b]);
                    return Ok(frame.fault(JsError::undefined_variable()));
                }
                let v = match jsops::fast_binary(instr.op, a, b) {
                    Some(v) => v,
                    None => match address_arith(instr.op, a, b) {
                        Some(v) => v,
                        None => jsops::general_binary(&mut self.ctx.heap, instr.op, a, b)?,
                    },
                };
                self.release_operands(v, &[a, b]);
                frame.push(v)?;
            }
            Opcode::Ashr
            | Opcode::Lshr
            | Opcode::Shl
            | Opcode::Band
            | Opcode::Bior
            | Opcode::Bxor
            | Opcode::Land
            | Opcode::Lior => {
                let b = frame.pop()?;
                let a = frame.pop()?;
                if a.is_none() || b.is_none() {
                    self.release_operands(JsValue::NONE, &[a, b]);
                    return Ok(frame.fault(JsError::undefined_variable()));
                }
                let v = jsops::bitwise(&self.ctx.heap, instr.op, a, b)?;
                self.release_operands(v, &[a, b]);
                frame.push(v)?;
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
                let b = frame.pop()?;
                let a = frame.pop()?;
                if a.is_none() || b.is_none() {
                    self.release_operands(JsValue::NONE, &[a, b]);
                    return Ok(frame.fault(JsError::undefined_variable()));
                }
                let v = match jsops::fast_compare(instr.op, a, b) {
                    Some(v) => v,
                    None => jsops::general_compare(&self.ctx.heap, instr.op, a, b),
                };
                self.release_operands(v, &[a, b]);
                frame.push(v)?;
            }
            Opcode::Neg | Opcode::Bnot | Opcode::Lnot => {
                let v = frame.pop()?;
                if v.is_none() {
                    return Ok(frame.fault(JsError::undefined_variable()));
                }
                let r = jsops::unary(&self.ctx.heap, instr.op, v)?;
                self.release_operands(r, &[v]);
                frame.push(r)?;
            }
            Opcode::Cvt => {
                let v = frame.pop()?;
                let r = cvt(&self.ctx.heap, instr.prim_type()?, v);
                self.release_operands(r, &[v]);
                frame.push(r)?;
            }
            Opcode::Retype => {}
            Opcode::Sext | Opcode::Zext | Opcode::Extractbits => {
                let v = frame.pop()?;
                let x = jsops::to_int32(&self.ctx.heap, v);
                self.release_operands(JsValue::NONE, &[v]);
                let field = arith::bit_field(instr.op, PrimType::I64, MValue::I64(x as i64), instr.bit_offset(), instr.bit_size())?;
                frame.push(from_mvalue(field))?;
            }
            Opcode::Select => {
                let if_false = frame.pop()?;
                let if_true = frame.pop()?;
                let cond = frame.pop()?;
                let pick = jsops::to_boolean(&self.ctx.heap, cond);
                let r = if pick { if_true } else { if_false };
                self.release_operands(r, &[cond, if_true, if_false]);
                frame.push(r)?;
            }

            // ========================================
            // Control flow
            // ========================================
            Opcode::Goto => {
                frame.pc = branch_target(code, pc + BASE_SIZE)?;
                return Ok(ExecStatus::Br);
            }
            Opcode::Brtrue | Opcode::Brfalse => {
                let v = frame.pop()?;
                let cond = jsops::to_boolean(&self.ctx.heap, v);
                self.release_operands(JsValue::NONE, &[v]);
                if cond == (instr.op == Opcode::Brtrue) {
                    frame.pc = branch_target(code, pc + BASE_SIZE)?;
                    return Ok(ExecStatus::Br);
                }
            }
            Opcode::Rangegoto => {
                let adjust = read_i32(code, pc + BASE_SIZE)? as i64;
                let cell = frame.pop()?;
                let v = jsops::to_int32(&self.ctx.heap, cell) as i64;
                self.release_operands(JsValue::NONE, &[cell]);
                let idx = v - adjust;
                if idx < 0 || idx as usize >= instr.num_cases() {
                    return Err(EngineError::malformed(
                        pc,
                        format!("rangegoto index {} out of {} cases", idx, instr.num_cases()),
                    ));
                }
                frame.pc = branch_target(code, pc + BASE_SIZE + 4 + 4 * idx as usize)?;
                return Ok(ExecStatus::Br);
            }
            Opcode::Return => {
                if !frame.base_intact() {
                    return Err(EngineError::malformed(pc, "operand stack base overwritten"));
                }
                if instr.num_opnds() != 0 {
                    let v = frame.pop()?;
                    self.ctx.set_retval0(v);
                }
                return Ok(ExecStatus::Return);
            }
            Opcode::Eval => {
                let v = frame.pop()?;
                self.ctx.heap.release_if_floating(v);
            }

            // ========================================
            // Calls
            // ========================================
            Opcode::Call | Opcode::Javatry | Opcode::Javacatch => {
                return Err(EngineError::WrongMode {
                    op: instr.op.name(),
                    mode: "dynamic",
                });
            }
            Opcode::Icall => return self.icall(instr, frame, depth),
            Opcode::Intrinsiccall => return self.intrinsic(instr, frame),

            // ========================================
            // Exceptions
            // ========================================
            Opcode::Jstry => {
                let catch = optional_target(code, pc + BASE_SIZE)?;
                let finally = optional_target(code, pc + BASE_SIZE + 4)?;
                self.ctx.ehs.enter(pc, catch, finally, frame.id);
            }
            Opcode::Jscatch => self.ctx.ehs.update_state(EhEvent::Catch)?,
            Opcode::Finally => self.ctx.ehs.update_state(EhEvent::Finally)?,
            Opcode::Endtry | Opcode::Cleanuptry => {
                self.ctx.ehs.free_current();
                self.ctx.settle_handlers();
            }
            Opcode::Throw => {
                let v = frame.pop()?;
                return self.throw_value(frame, v);
            }
            Opcode::Gosub => {
                self.ctx.ehs.push_gosub(pc + BASE_SIZE + 4)?;
                frame.pc = branch_target(code, pc + BASE_SIZE)?;
                return Ok(ExecStatus::Br);
            }
            Opcode::Retsub => {
                if self.ctx.ehs.is_raised() {
                    return Ok(self.resolve(frame));
                }
                frame.pc = self.ctx.ehs.pop_gosub()?;
                return Ok(ExecStatus::Retsub);
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
        Ok(ExecStatus::Ok)
    }

    /// Stores a formal word and mirrors it into `arguments` where the
    /// function aliases the two.
    fn assign_formal(&mut self, frame: &DynFrame, offset: i64, v: JsValue) -> Result<(), EngineError> {
        self.ctx.set_frame_word(offset, v)?;
        if offset > 0 && frame.mirror().formals > 0 {
            if let Some(args) = self.ctx.arguments() {
                self.ctx.heap.set_argument(args, (offset / 8 - 1) as usize, v);
            }
        }
        Ok(())
    }

    // ========================================
    // Exceptions
    // ========================================

    /// Raises `value` in the current handler and resolves where it goes.
    fn throw_value(&mut self, frame: &mut DynFrame, value: JsValue) -> Result<ExecStatus, EngineError> {
        self.ctx.heap.inc(value);
        if self.ctx.ehs.depth() == 0 {
            debug!(target: "mire::exception", "throw of {:?} with no handler", value);
            self.ctx.ehs.escape(value);
            self.ctx.settle_handlers();
            return Ok(ExecStatus::Terminate);
        }
        self.ctx.ehs.raise(value)?;
        self.ctx.settle_handlers();
        Ok(self.resolve(frame))
    }

    /// Follows `get_eh_pc` for `frame`.
    fn resolve(&mut self, frame: &mut DynFrame) -> ExecStatus {
        let target = self.ctx.ehs.get_eh_pc(frame.id);
        self.ctx.settle_handlers();
        match target {
            Some(pc) => {
                debug!(target: "mire::exception", "handler target {:#x}", pc);
                frame.pc = pc;
                frame.discard_stack(&mut self.ctx.heap);
                ExecStatus::BrToStmt
            }
            None if self.ctx.ehs.depth() == 0 => ExecStatus::Terminate,
            None => ExecStatus::HandleExc,
        }
    }

    // ========================================
    // Calls
    // ========================================

    /// `icall`: the callee `FUNCTION` cell sits below its arguments.
    fn icall(&mut self, instr: Instr, frame: &mut DynFrame, depth: usize) -> Result<ExecStatus, EngineError> {
        let nopnds = instr.num_opnds();
        if nopnds == 0 {
            return Err(EngineError::malformed(frame.pc, "icall without a callee"));
        }
        let args = frame.pop_n(nopnds - 1)?;
        let callee = frame.pop()?;
        if callee.is_none() {
            return Ok(frame.fault(JsError::undefined_variable()));
        }
        if callee.tag() != JsTag::Function {
            let what = self.ctx.heap.to_display(callee);
            return Ok(frame.fault(JsError::TypeError(format!("{} is not a function", what))));
        }
        match self.func_call(callee.payload() as usize, &args, depth)? {
            ExecStatus::Return => Ok(ExecStatus::Ok),
            ExecStatus::HandleExc => Ok(self.resolve(frame)),
            other => Ok(other),
        }
    }

    /// Calls the function at `offset` with `this = undefined`.
    fn func_call(&mut self, offset: usize, args: &[JsValue], depth: usize) -> Result<ExecStatus, EngineError> {
        if !self.image.is_method(offset) {
            return Err(EngineError::NotAMethod(self.image.addr_of(offset)));
        }
        let header = self.image.dyn_method_header(offset)?;
        if self.config.trace.calls {
            debug!(target: "mire::call", "call {:#x} with {} arguments", offset, args.len());
        }
        let pushed = self
            .ctx
            .pass_arguments(JsValue::UNDEFINED, args, Some(header.formals_num()))?;
        let arguments = if header.uses_arguments() {
            let obj = self.ctx.heap.new_arguments(args)?;
            self.ctx.heap.inc(obj);
            Some(obj)
        } else {
            None
        };
        let saved_args = self.ctx.set_arguments(arguments);
        let saved_fn = self.ctx.set_current_fn(Some(offset));

        let status = self.invoke(header, depth + 1);

        self.ctx.set_current_fn(saved_fn);
        if let Some(obj) = self.ctx.set_arguments(saved_args) {
            self.ctx.heap.dec(obj);
        }
        self.ctx.pop_arguments(pushed)?;
        status
    }

    /// Frees consumed operands that nothing counted, unless one of them is
    /// the result itself.
    fn release_operands(&mut self, result: JsValue, operands: &[JsValue]) {
        for &v in operands {
            if v != result {
                self.ctx.heap.release_if_floating(v);
            }
        }
    }

    fn intrinsic(&mut self, instr: Instr, frame: &mut DynFrame) -> Result<ExecStatus, EngineError> {
        let raw = instr.intrinsic_id();
        let id = IntrinsicId::from_u8(raw).ok_or(EngineError::UnknownIntrinsic(raw))?;
        let args = frame.pop_n(instr.intrinsic_opnds())?;
        let result = jsbuiltin::call(&mut self.ctx, id, &args, frame.mirror());
        let status = match result {
            Ok(v) => {
                self.ctx.set_retval0(v);
                ExecStatus::Ok
            }
            Err(IntrinsicError::Throw(e)) => frame.fault(e),
            Err(IntrinsicError::Fatal(e)) => return Err(e),
        };
        let kept = self.ctx.retval0();
        self.release_operands(kept, &args);
        Ok(status)
    }
}

/// Result payload of a finished program, as handed to a process exit.
pub fn exit_payload(v: JsValue) -> i64 {
    match v.tag() {
        JsTag::Number | JsTag::Boolean => v.as_i32() as i64,
        _ => v.payload() as i64,
    }
}

/// `constval64` in dynamic mode: the type decides how the immediate is
/// boxed.
fn constval64(ty: PrimType, bits: u64) -> JsValue {
    match ty {
        PrimType::DynF64 | PrimType::F64 => JsValue::encode(JsTag::Double, bits),
        PrimType::DynF32 | PrimType::F32 => JsValue::double(f32::from_bits(bits as u32) as f64),
        PrimType::DynI32 | PrimType::I32 => JsValue::number(bits as u32 as i32),
        PrimType::DynBool | PrimType::U1 => JsValue::boolean(bits != 0),
        PrimType::DynNull => JsValue::NULL,
        PrimType::DynUndef => JsValue::UNDEFINED,
        PrimType::DynNone => JsValue::NONE,
        PrimType::DynAny | PrimType::DynStr | PrimType::DynObj => JsValue::from_raw(bits),
        other => from_mvalue(MValue::from_bits(other, bits)),
    }
}

/// Pointer arithmetic on `SPBASE`/`FPBASE`/`GPBASE` cells.
fn address_arith(op: Opcode, a: JsValue, b: JsValue) -> Option<JsValue> {
    let tag = a.tag();
    if !matches!(tag, JsTag::SpBase | JsTag::FpBase | JsTag::GpBase) || !b.is_number() {
        return None;
    }
    let delta = b.as_i32() as i64;
    let base = a.payload() as i64;
    let addr = match op {
        Opcode::Add => base + delta,
        Opcode::Sub => base - delta,
        _ => return None,
    };
    Some(JsValue::boxed(tag, addr as u64))
}

/// A `jstry` target field; zero means absent.
fn optional_target(code: &[u8], field: usize) -> Result<Option<usize>, EngineError> {
    if read_i32(code, field)? == 0 {
        return Ok(None);
    }
    branch_target(code, field).map(Some)
}

fn cvt(heap: &JsHeap, to: PrimType, v: JsValue) -> JsValue {
    match to {
        PrimType::U1 => JsValue::boolean(jsops::to_boolean(heap, v)),
        PrimType::U32 => jsops::from_i64(jsops::to_int32(heap, v) as u32 as i64),
        ty if ty.is_int() => JsValue::number(jsops::to_int32(heap, v)),
        ty if ty.is_float() => JsValue::double(jsops::to_number(heap, v).to_f64()),
        _ => v,
    }
}
