//! Static-mode call frame.
//!
//! ```text
//! stack: [ RETURNVAL | THROWVAL | locals... | POISON | eval stack ... ]
//!          0          1          ..locals_num  base
//! ```
//!
//! Locals share the slot array with the evaluation stack; `sp` points at
//! the top element and rests on the poisoned base slot when the stack is
//! empty. Formals are not copied: the frame borrows the caller's argument
//! slots directly.

use crate::error::EngineError;

use super::image::MethodHeader;
use super::value::{MValue, Slot};

pub const RETURNVAL: usize = 0;
pub const THROWVAL: usize = 1;

#[derive(Debug)]
pub struct Frame<'a> {
    pub header: MethodHeader,
    pub pc: usize,
    /// Offset of the active `javatry`, if any.
    pub try_catch: Option<usize>,
    sp: usize,
    base: usize,
    stack: Vec<Slot>,
    args: &'a mut [Slot],
}

impl<'a> Frame<'a> {
    pub fn new(header: MethodHeader, args: &'a mut [Slot]) -> Frame<'a> {
        let base = (header.locals_num as usize).max(THROWVAL + 1);
        let mut stack = vec![Slot::EMPTY; base + header.eval_depth as usize + 1];
        stack[base] = Slot::poisoned();
        for (slot, info) in stack.iter_mut().zip(header.locals.iter()) {
            if let Some(ty) = info.prim_type() {
                slot.ty = ty;
            }
        }
        let pc = header.code_start();
        Frame {
            header,
            pc,
            try_catch: None,
            sp: base,
            base,
            stack,
            args,
        }
    }

    /// Number of values on the evaluation stack.
    pub fn depth(&self) -> usize {
        self.sp - self.base
    }

    #[inline]
    pub fn push(&mut self, value: MValue) -> Result<(), EngineError> {
        let next = self.sp + 1;
        let slot = self.stack.get_mut(next).ok_or(EngineError::StackOverflow)?;
        slot.set(value);
        self.sp = next;
        Ok(())
    }

    #[inline]
    pub fn pop(&mut self) -> Result<MValue, EngineError> {
        if self.sp <= self.base {
            return Err(EngineError::StackUnderflow);
        }
        let v = self.stack[self.sp].get();
        self.sp -= 1;
        Ok(v)
    }

    #[inline]
    pub fn top(&self) -> Result<MValue, EngineError> {
        if self.sp <= self.base {
            return Err(EngineError::StackUnderflow);
        }
        Ok(self.stack[self.sp].get())
    }

    /// Drops `n` values.
    pub fn drop_n(&mut self, n: usize) -> Result<(), EngineError> {
        if self.depth() < n {
            return Err(EngineError::StackUnderflow);
        }
        self.sp -= n;
        Ok(())
    }

    /// The top `n` slots, bottom first; they become a callee's formals.
    pub fn top_slots(&mut self, n: usize) -> Result<&mut [Slot], EngineError> {
        if self.depth() < n {
            return Err(EngineError::StackUnderflow);
        }
        Ok(&mut self.stack[self.sp + 1 - n..=self.sp])
    }

    /// Empties the evaluation stack.
    pub fn reset_sp(&mut self) {
        self.sp = self.base;
    }

    /// True when the poisoned base slot is still intact.
    pub fn base_intact(&self) -> bool {
        self.stack[self.base].is_poisoned()
    }

    fn local_index(&self, idx: usize) -> Result<usize, EngineError> {
        if idx < self.base {
            Ok(idx)
        } else {
            Err(EngineError::malformed(self.pc, format!("local {} out of range", idx)))
        }
    }

    pub fn local(&self, idx: usize) -> Result<MValue, EngineError> {
        Ok(self.stack[self.local_index(idx)?].get())
    }

    pub fn set_local(&mut self, idx: usize, value: MValue) -> Result<(), EngineError> {
        let i = self.local_index(idx)?;
        self.stack[i].set(value);
        Ok(())
    }

    pub fn local_addr(&mut self, idx: usize) -> Result<u64, EngineError> {
        let i = self.local_index(idx)?;
        Ok(&mut self.stack[i] as *mut Slot as u64)
    }

    fn formal_index(&self, idx: usize) -> Result<usize, EngineError> {
        if idx >= 1 && idx <= self.args.len() {
            Ok(idx - 1)
        } else {
            Err(EngineError::malformed(self.pc, format!("formal {} out of range", idx)))
        }
    }

    /// Formal `idx`, counted from 1.
    pub fn formal(&self, idx: usize) -> Result<MValue, EngineError> {
        Ok(self.args[self.formal_index(idx)?].get())
    }

    pub fn set_formal(&mut self, idx: usize, value: MValue) -> Result<(), EngineError> {
        let i = self.formal_index(idx)?;
        self.args[i].set(value);
        Ok(())
    }

    pub fn formal_addr(&mut self, idx: usize) -> Result<u64, EngineError> {
        let i = self.formal_index(idx)?;
        Ok(&mut self.args[i] as *mut Slot as u64)
    }

    pub fn formal_count(&self) -> usize {
        self.args.len()
    }

    pub fn returnval(&self) -> MValue {
        self.stack[RETURNVAL].get()
    }

    pub fn set_returnval(&mut self, value: MValue) {
        self.stack[RETURNVAL].set(value);
    }

    /// Raw bits of the thrown-value slot.
    pub fn thrown(&self) -> u64 {
        self.stack[THROWVAL].bits
    }

    pub fn set_thrown(&mut self, obj: u64) {
        self.stack[THROWVAL].set(MValue::A64(obj));
    }

    /// Raw slot of local `idx`, for reference-count cleanup.
    pub fn local_slot(&self, idx: usize) -> Option<Slot> {
        self.stack.get(idx).copied().filter(|_| idx < self.base)
    }

    /// Leaves the frame with only the reserved slots live.
    pub fn collapse(&mut self) {
        self.sp = THROWVAL;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::asm::{Assembler, MethodSpec};
    use crate::vm::image::Mode;
    use crate::vm::primtype::PrimType;

    fn header(locals: usize, depth: u16) -> MethodHeader {
        let mut spec = MethodSpec::new().formal(PrimType::I32, 0).reserved_slots();
        for _ in 0..locals {
            spec = spec.local(PrimType::I64, 0);
        }
        let mut asm = Assembler::new();
        let m = asm.begin_method(&spec.eval_depth(depth));
        asm.ret(PrimType::Void);
        asm.finish(Mode::Static, m).unwrap().method_header(m).unwrap()
    }

    #[test]
    fn test_push_pop_and_poison() {
        let mut args = [Slot::from(MValue::I32(9))];
        let mut frame = Frame::new(header(1, 2), &mut args);
        assert!(frame.base_intact());
        frame.push(MValue::I32(1)).unwrap();
        frame.push(MValue::I32(2)).unwrap();
        assert!(matches!(frame.push(MValue::I32(3)), Err(EngineError::StackOverflow)));
        assert_eq!(frame.pop().unwrap(), MValue::I32(2));
        assert_eq!(frame.pop().unwrap(), MValue::I32(1));
        assert!(matches!(frame.pop(), Err(EngineError::StackUnderflow)));
        assert!(frame.base_intact());
    }

    #[test]
    fn test_locals_take_header_types() {
        let mut args = [];
        let frame = Frame::new(header(1, 1), &mut args);
        assert_eq!(frame.local(2).unwrap(), MValue::I64(0));
        assert!(frame.local(3).is_err());
    }

    #[test]
    fn test_formals_alias_caller_slots() {
        let mut args = [Slot::from(MValue::I32(9))];
        {
            let mut frame = Frame::new(header(0, 1), &mut args);
            assert_eq!(frame.formal(1).unwrap(), MValue::I32(9));
            frame.set_formal(1, MValue::I32(10)).unwrap();
            assert!(frame.formal(2).is_err());
        }
        assert_eq!(args[0].get(), MValue::I32(10));
    }

    #[test]
    fn test_top_slots() {
        let mut args = [];
        let mut frame = Frame::new(header(0, 3), &mut args);
        frame.push(MValue::I32(1)).unwrap();
        frame.push(MValue::I32(2)).unwrap();
        let slots = frame.top_slots(2).unwrap();
        assert_eq!(slots[0].get(), MValue::I32(1));
        assert_eq!(slots[1].get(), MValue::I32(2));
    }
}
