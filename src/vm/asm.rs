//! Programmatic image builder.
//!
//! Emits method headers and instructions in the exact encoding the dispatch
//! loops read, with labels for every relative offset (branches, try/catch
//! tables, jump tables).

use crate::error::EngineError;

use super::image::{DYN_METHOD_HEADER_SIZE, Image, METHOD_HEADER_FIXED, METHOD_MAGIC, MPLI_OFFSET, Mode};
use super::ops::Opcode;
use super::primtype::PrimType;

/// A position in the code section, bound once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(usize);

/// Layout of a static method header.
#[derive(Debug, Clone, Default)]
pub struct MethodSpec {
    formals: Vec<(PrimType, u8)>,
    locals: Vec<(PrimType, u8)>,
    eval_depth: u16,
    flags: u16,
}

impl MethodSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn formal(mut self, ty: PrimType, rc_class: u8) -> Self {
        self.formals.push((ty, rc_class));
        self
    }

    pub fn local(mut self, ty: PrimType, rc_class: u8) -> Self {
        self.locals.push((ty, rc_class));
        self
    }

    /// Adds the two reserved return/thrown slots as locals 0 and 1.
    pub fn reserved_slots(self) -> Self {
        self.local(PrimType::Void, 0).local(PrimType::A64, 0)
    }

    pub fn eval_depth(mut self, depth: u16) -> Self {
        self.eval_depth = depth;
        self
    }

    pub fn flags(mut self, flags: u16) -> Self {
        self.flags = flags;
        self
    }
}

/// Layout of a dynamic method header.
#[derive(Debug, Clone, Copy, Default)]
pub struct DynMethodSpec {
    pub up_formal_size: u16,
    pub frame_size: u16,
    pub eval_depth: u16,
    pub attribute: u16,
}

impl DynMethodSpec {
    /// A function taking `formals` arguments plus `this`, with `locals`
    /// 8-byte local words (the saved frame pointer is added here).
    pub fn function(formals: u16, locals: u16, eval_depth: u16) -> Self {
        DynMethodSpec {
            up_formal_size: 8 * (formals + 1),
            frame_size: 8 * (locals + 1),
            eval_depth,
            attribute: 0,
        }
    }

    /// A program entry: no formals, no `this`.
    pub fn main(locals: u16, eval_depth: u16) -> Self {
        DynMethodSpec {
            up_formal_size: 0,
            frame_size: 8 * (locals + 1),
            eval_depth,
            attribute: 0,
        }
    }

    pub fn attribute(mut self, attribute: u16) -> Self {
        self.attribute = attribute;
        self
    }
}

#[derive(Debug, Default)]
pub struct Assembler {
    code: Vec<u8>,
    labels: Vec<Option<usize>>,
    fixups: Vec<(usize, Label)>,
}

impl Assembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current code offset.
    pub fn offset(&self) -> usize {
        self.code.len()
    }

    pub fn label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    pub fn bind(&mut self, label: Label) {
        self.labels[label.0] = Some(self.code.len());
    }

    /// A label bound at the current offset.
    pub fn here(&mut self) -> Label {
        let l = self.label();
        self.bind(l);
        l
    }

    fn align(&mut self, to: usize) {
        while self.code.len() % to != 0 {
            self.code.push(0);
        }
    }

    fn u16(&mut self, v: u16) {
        self.code.extend_from_slice(&v.to_le_bytes());
    }

    fn u32(&mut self, v: u32) {
        self.code.extend_from_slice(&v.to_le_bytes());
    }

    fn u64(&mut self, v: u64) {
        self.code.extend_from_slice(&v.to_le_bytes());
    }

    fn fixup(&mut self, target: Label) {
        let field = self.code.len();
        self.fixups.push((field, target));
        self.u32(0);
    }

    // ========================================
    // Methods and data
    // ========================================

    /// Starts a static method; returns its offset.
    pub fn begin_method(&mut self, spec: &MethodSpec) -> usize {
        self.align(8);
        let start = self.code.len();
        self.code.resize(start + MPLI_OFFSET, 0);
        self.u32(METHOD_MAGIC);
        let slots = spec.formals.len() + spec.locals.len();
        let header_size = (METHOD_HEADER_FIXED + 2 * slots + 3) & !3;
        self.u32(header_size as u32);
        self.u16(spec.formals.len() as u16);
        self.u16(spec.locals.len() as u16);
        self.u16(spec.eval_depth);
        self.u16(spec.flags);
        for &(ty, rc) in spec.formals.iter().chain(spec.locals.iter()) {
            self.code.push(ty as u8);
            self.code.push(rc);
        }
        let header_start = start + MPLI_OFFSET + 4;
        self.code.resize(header_start + header_size, 0);
        start
    }

    /// Starts a dynamic method; returns its offset.
    pub fn begin_dyn_method(&mut self, spec: &DynMethodSpec) -> usize {
        self.align(8);
        let start = self.code.len();
        self.code.resize(start + MPLI_OFFSET, 0);
        self.u32(METHOD_MAGIC);
        self.u32(DYN_METHOD_HEADER_SIZE as u32);
        self.u16(spec.up_formal_size);
        self.u16(spec.frame_size);
        self.u16(spec.eval_depth);
        self.u16(spec.attribute);
        self.u16(0);
        self.u16(0);
        for _ in 0..4 {
            self.u32(0);
        }
        start
    }

    /// Emits an 8-byte data word; returns a label bound to it.
    pub fn data_u64(&mut self, value: u64) -> Label {
        self.align(8);
        let l = self.here();
        self.u64(value);
        l
    }

    /// Emits a NUL-terminated string; returns its offset.
    pub fn data_str(&mut self, s: &str) -> usize {
        let at = self.code.len();
        self.code.extend_from_slice(s.as_bytes());
        self.code.push(0);
        self.align(4);
        at
    }

    // ========================================
    // Instructions
    // ========================================

    pub fn op(&mut self, op: Opcode, ptyp: PrimType, param: u16) -> &mut Self {
        self.code.push(op as u8);
        self.code.push(ptyp as u8);
        self.u16(param);
        self
    }

    /// An instruction without type or parameter.
    pub fn stmt(&mut self, op: Opcode) -> &mut Self {
        self.op(op, PrimType::Void, 0)
    }

    pub fn constval(&mut self, ty: PrimType, value: i16) -> &mut Self {
        self.op(Opcode::Constval, ty, value as u16)
    }

    pub fn constval64(&mut self, ty: PrimType, bits: u64) -> &mut Self {
        self.op(Opcode::Constval64, ty, 0);
        self.u64(bits);
        self
    }

    pub fn dread(&mut self, ty: PrimType, idx: i16) -> &mut Self {
        self.op(Opcode::Dread, ty, idx as u16)
    }

    pub fn dassign(&mut self, ty: PrimType, idx: i16) -> &mut Self {
        self.op(Opcode::Dassign, ty, idx as u16)
    }

    pub fn regread(&mut self, ty: PrimType, idx: i16) -> &mut Self {
        self.op(Opcode::Regread, ty, idx as u16)
    }

    pub fn regassign(&mut self, ty: PrimType, idx: i16) -> &mut Self {
        self.op(Opcode::Regassign, ty, idx as u16)
    }

    pub fn binary(&mut self, op: Opcode, ty: PrimType) -> &mut Self {
        self.op(op, ty, 0)
    }

    /// Comparison producing `result` from operands of type `operand`.
    pub fn compare(&mut self, op: Opcode, result: PrimType, operand: PrimType) -> &mut Self {
        self.op(op, result, operand as u16)
    }

    pub fn cvt(&mut self, to: PrimType, from: PrimType) -> &mut Self {
        self.op(Opcode::Cvt, to, from as u16)
    }

    pub fn bits(&mut self, op: Opcode, ty: PrimType, offset: u8, size: u8) -> &mut Self {
        self.op(op, ty, (size as u16) << 8 | offset as u16)
    }

    pub fn with_imm32(&mut self, op: Opcode, ty: PrimType, param: u16, imm: u32) -> &mut Self {
        self.op(op, ty, param);
        self.u32(imm);
        self
    }

    /// `goto`, `brtrue`, `brfalse` or `gosub` to `target`.
    pub fn branch(&mut self, op: Opcode, target: Label) -> &mut Self {
        let ty = if op == Opcode::Goto || op == Opcode::Gosub {
            PrimType::Void
        } else {
            PrimType::U1
        };
        self.op(op, ty, 0);
        self.fixup(target);
        self
    }

    pub fn rangegoto(&mut self, ty: PrimType, adjust: i32, targets: &[Label]) -> &mut Self {
        self.op(Opcode::Rangegoto, ty, targets.len() as u16);
        self.u32(adjust as u32);
        for &t in targets {
            self.fixup(t);
        }
        self
    }

    pub fn ret(&mut self, ty: PrimType) -> &mut Self {
        let n = if ty == PrimType::Void { 0 } else { 1 };
        self.op(Opcode::Return, ty, n)
    }

    /// Direct call by name with `nargs` arguments.
    pub fn call(&mut self, ret: PrimType, nargs: u16, name: &str) -> &mut Self {
        self.op(Opcode::Call, ret, nargs);
        self.u16(name.len() as u16);
        self.code.extend_from_slice(name.as_bytes());
        self.align(4);
        self
    }

    /// Indirect call; `nopnds` counts the callee plus its arguments.
    pub fn icall(&mut self, ret: PrimType, nopnds: u16) -> &mut Self {
        self.op(Opcode::Icall, ret, nopnds)
    }

    pub fn intrinsic(&mut self, ret: PrimType, id: u8, nargs: u8) -> &mut Self {
        self.op(Opcode::Intrinsiccall, ret, (id as u16) << 8 | nargs as u16)
    }

    pub fn addroffunc(&mut self, ty: PrimType, method: usize) -> &mut Self {
        self.with_imm32(Opcode::Addroffunc, ty, 0, method as u32)
    }

    pub fn conststr(&mut self, ty: PrimType, offset: usize) -> &mut Self {
        self.with_imm32(Opcode::Conststr, ty, 0, offset as u32)
    }

    /// `javatry` listing its catch blocks.
    pub fn javatry(&mut self, catches: &[Label]) -> &mut Self {
        self.op(Opcode::Javatry, PrimType::Void, catches.len() as u16);
        for &c in catches {
            self.fixup(c);
        }
        self
    }

    /// `javacatch` listing class words; `None` is the catch-all marker.
    pub fn javacatch(&mut self, types: &[Option<Label>]) -> &mut Self {
        self.op(Opcode::Javacatch, PrimType::Void, types.len() as u16);
        for ty in types {
            match ty {
                Some(l) => self.fixup(*l),
                None => self.u32(0),
            }
        }
        self
    }

    pub fn jstry(&mut self, catch: Option<Label>, finally: Option<Label>) -> &mut Self {
        self.stmt(Opcode::Jstry);
        for target in [catch, finally] {
            match target {
                Some(l) => self.fixup(l),
                None => self.u32(0),
            }
        }
        self
    }

    /// Resolves every label reference and produces the image.
    pub fn finish(mut self, mode: Mode, entry: usize) -> Result<Image, EngineError> {
        for &(field, label) in &self.fixups {
            let target = self.labels[label.0]
                .ok_or_else(|| EngineError::malformed(field, "unbound label"))?;
            let rel = target as i64 - field as i64;
            self.code[field..field + 4].copy_from_slice(&(rel as i32).to_le_bytes());
        }
        Ok(Image::new(mode, self.code, entry as u32))
    }
}
