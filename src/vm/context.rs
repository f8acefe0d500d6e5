//! Dynamic-mode interpreter state.
//!
//! ```text
//! stack memory (byte offsets, grows down)
//!
//!   caller frame ...
//!   +------------------+ <- fp + 8·(n+1)
//!   | arg n-1          |
//!   | ...              |
//!   | arg 0            | fp + 8
//!   | this             | fp
//!   | saved fp         | fp - 8
//!   | locals ...       |
//!   +------------------+ <- sp = fp - frame_size
//! ```
//!
//! Addresses handed to guest code are `SPBASE`/`FPBASE`/`GPBASE` cells
//! whose payload is a byte offset into the stack memory or the global
//! memory. Words hold raw [`JsValue`] bits; a counted value stored into a
//! word is incremented and the value it replaces decremented.

use std::io::{self, Write};
use std::marker::PhantomData;
use std::rc::Rc;

use crate::config::RuntimeConfig;
use crate::error::EngineError;

use super::heap::JsHeap;
use super::image::Image;
use super::jseh::EhStack;
use super::jsops;
use super::loadstore;
use super::nanbox::{JsTag, JsValue};
use super::primtype::PrimType;
use super::value::MValue;

const WORD: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Region {
    Stack,
    Global,
}

/// Process-wide state of one dynamic-mode run.
///
/// Not `Send`: the handler stack, the current function and the heap all
/// belong to the thread that runs the program.
pub struct DynContext {
    pub heap: JsHeap,
    pub ehs: EhStack,
    stack: Vec<u64>,
    sp: usize,
    fp: usize,
    globals: Vec<u64>,
    global_tagged: Vec<bool>,
    global_counted: Vec<bool>,
    retval0: JsValue,
    /// `arguments` object of the running function, counted once.
    arguments: Option<JsValue>,
    /// Method offset of the running function.
    current_fn: Option<usize>,
    next_frame: u64,
    out: Box<dyn Write>,
    _not_send: PhantomData<Rc<()>>,
}

impl DynContext {
    /// Copies the image's global memory and bitmaps into a fresh context.
    pub fn new(image: &Image, config: &RuntimeConfig) -> Self {
        let globals: Vec<u64> = image
            .globals()
            .chunks(WORD)
            .map(|c| {
                let mut word = [0u8; WORD];
                word[..c.len()].copy_from_slice(c);
                u64::from_le_bytes(word)
            })
            .collect();
        let global_tagged = (0..globals.len()).map(|w| image.global_is_tagged(w)).collect();
        let global_counted = (0..globals.len()).map(|w| image.global_is_counted(w)).collect();
        let words = config.stack_words();
        DynContext {
            heap: JsHeap::new(config.heap_size_bytes()),
            ehs: EhStack::new(),
            stack: vec![0; words],
            sp: words * WORD,
            fp: words * WORD,
            globals,
            global_tagged,
            global_counted,
            retval0: JsValue::UNDEFINED,
            arguments: None,
            current_fn: None,
            next_frame: 0,
            out: Box::new(io::stdout()),
            _not_send: PhantomData,
        }
    }

    /// Redirects `JS_PRINT` output.
    pub fn with_output(mut self, out: Box<dyn Write>) -> Self {
        self.out = out;
        self
    }

    pub fn out(&mut self) -> &mut dyn Write {
        self.out.as_mut()
    }

    pub fn sp(&self) -> usize {
        self.sp
    }

    pub fn fp(&self) -> usize {
        self.fp
    }

    pub fn new_frame_id(&mut self) -> u64 {
        self.next_frame += 1;
        self.next_frame
    }

    pub fn current_fn(&self) -> Option<usize> {
        self.current_fn
    }

    pub fn set_current_fn(&mut self, f: Option<usize>) -> Option<usize> {
        std::mem::replace(&mut self.current_fn, f)
    }

    pub fn arguments(&self) -> Option<JsValue> {
        self.arguments
    }

    pub fn set_arguments(&mut self, args: Option<JsValue>) -> Option<JsValue> {
        std::mem::replace(&mut self.arguments, args)
    }

    pub fn retval0(&self) -> JsValue {
        self.retval0
    }

    /// Stores into retval0, counting the new value and releasing the old.
    pub fn set_retval0(&mut self, v: JsValue) {
        self.heap.inc(v);
        let old = std::mem::replace(&mut self.retval0, v);
        self.heap.dec(old);
    }

    /// Hands the handler stack's dropped values back to the heap.
    pub fn settle_handlers(&mut self) {
        for v in self.ehs.take_released() {
            self.heap.dec(v);
        }
    }

    // ========================================
    // Memory
    // ========================================

    fn memory(&self, region: Region) -> &[u64] {
        match region {
            Region::Stack => &self.stack,
            Region::Global => &self.globals,
        }
    }

    /// Resolves an address cell plus `offset` to a byte offset in a region.
    pub fn resolve(&self, base: JsValue, offset: i64) -> Result<(Region, usize), EngineError> {
        let region = match base.tag() {
            JsTag::SpBase | JsTag::FpBase => Region::Stack,
            JsTag::GpBase => Region::Global,
            _ => return Err(EngineError::BadAddress(base.raw())),
        };
        let addr = base.payload() as i64 + offset;
        if addr < 0 {
            return Err(EngineError::BadAddress(addr as u64));
        }
        Ok((region, addr as usize))
    }

    fn word_index(&self, region: Region, addr: usize) -> Result<usize, EngineError> {
        let idx = addr / WORD;
        if addr % WORD != 0 || idx >= self.memory(region).len() {
            return Err(EngineError::BadAddress(addr as u64));
        }
        Ok(idx)
    }

    fn word(&self, region: Region, addr: usize) -> Result<JsValue, EngineError> {
        let idx = self.word_index(region, addr)?;
        Ok(JsValue::from_raw(self.memory(region)[idx]))
    }

    /// Writes one word with the counting rule applied.
    fn set_word(&mut self, region: Region, addr: usize, v: JsValue) -> Result<(), EngineError> {
        let idx = self.word_index(region, addr)?;
        let counted = match region {
            Region::Stack => true,
            Region::Global => {
                self.global_tagged[idx] = true;
                if v.needs_rc() {
                    self.global_counted[idx] = true;
                }
                self.global_counted[idx]
            }
        };
        let slot = match region {
            Region::Stack => &mut self.stack[idx],
            Region::Global => &mut self.globals[idx],
        };
        let old = JsValue::from_raw(std::mem::replace(slot, v.raw()));
        if counted {
            self.heap.inc(v);
            self.heap.dec(old);
        }
        Ok(())
    }

    /// Typed read through an address cell.
    pub fn load(&self, base: JsValue, offset: i64, ty: PrimType) -> Result<JsValue, EngineError> {
        let (region, addr) = self.resolve(base, offset)?;
        if ty.is_dynamic() {
            let v = self.word(region, addr)?;
            if region == Region::Global && !self.global_tagged[addr / WORD] {
                // untagged global data is a plain integer word
                return Ok(jsops::from_i64(v.raw() as i64));
            }
            return Ok(v);
        }
        let mem = self.memory(region);
        if addr + ty.width() > mem.len() * WORD {
            return Err(EngineError::BadAddress(addr as u64));
        }
        // SAFETY: the range was bounds-checked against the backing words
        let value = unsafe { loadstore::load((mem.as_ptr() as *const u8).add(addr), ty)? };
        Ok(from_mvalue(value))
    }

    /// Typed write through an address cell.
    pub fn store(&mut self, base: JsValue, offset: i64, ty: PrimType, v: JsValue) -> Result<(), EngineError> {
        let (region, addr) = self.resolve(base, offset)?;
        if ty.is_dynamic() {
            return self.set_word(region, addr, v);
        }
        let value = to_mvalue(ty, v);
        let mem = match region {
            Region::Stack => &mut self.stack,
            Region::Global => &mut self.globals,
        };
        if addr + ty.width() > mem.len() * WORD {
            return Err(EngineError::BadAddress(addr as u64));
        }
        // SAFETY: the range was bounds-checked against the backing words
        unsafe { loadstore::store((mem.as_mut_ptr() as *mut u8).add(addr), ty, value) }
    }

    /// Word at `fp + offset`.
    pub fn frame_word(&self, offset: i64) -> Result<JsValue, EngineError> {
        let addr = self.fp as i64 + offset;
        if addr < 0 {
            return Err(EngineError::BadAddress(addr as u64));
        }
        self.word(Region::Stack, addr as usize)
    }

    pub fn set_frame_word(&mut self, offset: i64, v: JsValue) -> Result<(), EngineError> {
        let addr = self.fp as i64 + offset;
        if addr < 0 {
            return Err(EngineError::BadAddress(addr as u64));
        }
        self.set_word(Region::Stack, addr as usize, v)
    }

    // ========================================
    // Calling convention
    // ========================================

    /// Lays out `this` and the arguments below `sp` and moves `sp` down.
    ///
    /// With `formals` set, the frame gets exactly that many argument words:
    /// missing ones are `undefined` and extra ones stay out of the frame.
    /// Returns the number of bytes pushed.
    pub fn pass_arguments(&mut self, this: JsValue, args: &[JsValue], formals: Option<usize>) -> Result<usize, EngineError> {
        let n = formals.unwrap_or(args.len());
        let bytes = WORD * (n + 1);
        if self.sp < bytes {
            return Err(EngineError::StackOverflow);
        }
        let base = self.sp - bytes;
        self.stack[base / WORD] = this.raw();
        self.heap.inc(this);
        for i in 0..n {
            let v = args.get(i).copied().unwrap_or(JsValue::UNDEFINED);
            self.stack[base / WORD + i + 1] = v.raw();
            self.heap.inc(v);
        }
        self.sp = base;
        Ok(bytes)
    }

    /// Releases the argument words pushed by [`DynContext::pass_arguments`].
    pub fn pop_arguments(&mut self, bytes: usize) -> Result<(), EngineError> {
        let end = self.sp + bytes;
        if end > self.stack.len() * WORD {
            return Err(EngineError::StackUnderflow);
        }
        for idx in self.sp / WORD..end / WORD {
            let v = JsValue::from_raw(self.stack[idx]);
            if v.needs_rc() {
                self.heap.dec(v);
            }
            self.stack[idx] = 0;
        }
        self.sp = end;
        Ok(())
    }

    /// Opens a frame of `frame_size` bytes, the saved `fp` word included.
    pub fn prolog(&mut self, frame_size: usize) -> Result<(), EngineError> {
        let size = frame_size.max(WORD);
        if self.sp < size {
            return Err(EngineError::StackOverflow);
        }
        let top = self.sp / WORD;
        self.stack[top - 1] = self.fp as u64;
        self.stack[top - size / WORD..top - 1].fill(0);
        self.fp = self.sp;
        self.sp -= size;
        Ok(())
    }

    /// Closes the frame opened by [`DynContext::prolog`], releasing its
    /// counted locals.
    pub fn eplog(&mut self, frame_size: usize) -> Result<(), EngineError> {
        let size = frame_size.max(WORD);
        let top = self.fp / WORD;
        if top == 0 || top * WORD < size {
            return Err(EngineError::StackUnderflow);
        }
        for idx in top - size / WORD..top - 1 {
            let v = JsValue::from_raw(std::mem::take(&mut self.stack[idx]));
            if v.needs_rc() {
                self.heap.dec(v);
            }
        }
        let saved = self.stack[top - 1] as usize;
        self.sp = self.fp;
        self.fp = saved;
        Ok(())
    }
}

/// A typed memory value seen as a dynamic cell.
pub fn from_mvalue(v: MValue) -> JsValue {
    match v {
        MValue::I8(_) | MValue::I16(_) | MValue::I32(_) | MValue::U8(_) | MValue::U16(_) => {
            JsValue::number(v.as_i64() as i32)
        }
        MValue::U1(b) => JsValue::boolean(b),
        MValue::U32(_) | MValue::I64(_) | MValue::U64(_) => jsops::from_i64(v.as_i64()),
        MValue::F32(f) => JsValue::double(f as f64),
        MValue::F64(f) => JsValue::double(f),
        MValue::Void => JsValue::UNDEFINED,
        other => JsValue::from_raw(other.to_bits()),
    }
}

/// A dynamic cell narrowed to a typed memory value of `ty`.
pub fn to_mvalue(ty: PrimType, v: JsValue) -> MValue {
    match v.tag() {
        JsTag::Number | JsTag::Boolean if ty.is_float() => match ty {
            PrimType::F32 => MValue::F32(v.as_i32() as f32),
            _ => MValue::F64(v.as_i32() as f64),
        },
        JsTag::Number | JsTag::Boolean => MValue::from_bits(ty, v.as_i32() as i64 as u64),
        JsTag::Double if ty.is_float() => match ty {
            PrimType::F32 => MValue::F32(v.as_f64() as f32),
            _ => MValue::F64(v.as_f64()),
        },
        JsTag::Double => MValue::from_bits(ty, v.as_f64() as i64 as u64),
        _ => MValue::from_bits(ty, v.raw()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::image::Mode;

    fn context() -> DynContext {
        let image = Image::new(Mode::Dynamic, vec![0; 64], 0).with_globals(
            [7u64.to_le_bytes(), 0u64.to_le_bytes()].concat(),
            vec![0b10],
            vec![0],
        );
        let config = RuntimeConfig {
            stack_size_kb: 1,
            ..RuntimeConfig::default()
        };
        DynContext::new(&image, &config)
    }

    #[test]
    fn test_prolog_eplog_restore_pointers() {
        let mut ctx = context();
        let (sp, fp) = (ctx.sp(), ctx.fp());
        ctx.prolog(32).unwrap();
        assert_eq!(ctx.fp(), sp);
        assert_eq!(ctx.sp(), sp - 32);
        ctx.prolog(16).unwrap();
        ctx.eplog(16).unwrap();
        assert_eq!(ctx.sp(), sp - 32);
        ctx.eplog(32).unwrap();
        assert_eq!((ctx.sp(), ctx.fp()), (sp, fp));
    }

    #[test]
    fn test_arguments_layout_and_padding() {
        let mut ctx = context();
        let bytes = ctx
            .pass_arguments(JsValue::UNDEFINED, &[JsValue::number(1)], Some(3))
            .unwrap();
        assert_eq!(bytes, 32);
        ctx.prolog(8).unwrap();
        assert_eq!(ctx.frame_word(0).unwrap(), JsValue::UNDEFINED);
        assert_eq!(ctx.frame_word(8).unwrap(), JsValue::number(1));
        assert_eq!(ctx.frame_word(16).unwrap(), JsValue::UNDEFINED);
        assert_eq!(ctx.frame_word(24).unwrap(), JsValue::UNDEFINED);
        ctx.eplog(8).unwrap();
        ctx.pop_arguments(bytes).unwrap();
    }

    #[test]
    fn test_argument_counts_are_conserved() {
        let mut ctx = context();
        let s = ctx.heap.alloc_string("held").unwrap();
        ctx.heap.inc(s);
        let bytes = ctx.pass_arguments(JsValue::UNDEFINED, &[s, s], None).unwrap();
        assert_eq!(ctx.heap.rc(s), Some(3));
        ctx.pop_arguments(bytes).unwrap();
        assert_eq!(ctx.heap.rc(s), Some(1));
    }

    #[test]
    fn test_eplog_releases_locals() {
        let mut ctx = context();
        ctx.prolog(24).unwrap();
        let s = ctx.heap.alloc_string("local").unwrap();
        ctx.set_frame_word(-16, s).unwrap();
        assert_eq!(ctx.heap.rc(s), Some(1));
        ctx.eplog(24).unwrap();
        assert_eq!(ctx.heap.live(), 0);
    }

    #[test]
    fn test_global_words() {
        let mut ctx = context();
        let gp = JsValue::boxed(JsTag::GpBase, 0);
        // word 0 is untagged raw data, word 1 is tagged
        assert_eq!(ctx.load(gp, 0, PrimType::DynAny).unwrap(), JsValue::number(7));
        assert_eq!(ctx.load(gp, 8, PrimType::DynAny).unwrap(), JsValue::from_raw(0));
        ctx.store(gp, 0, PrimType::DynAny, JsValue::TRUE).unwrap();
        assert_eq!(ctx.load(gp, 0, PrimType::DynAny).unwrap(), JsValue::TRUE);
        assert!(matches!(ctx.load(gp, 16, PrimType::DynAny), Err(EngineError::BadAddress(_))));
        assert!(matches!(ctx.load(gp, 4, PrimType::DynAny), Err(EngineError::BadAddress(_))));
    }

    #[test]
    fn test_narrow_access() {
        let mut ctx = context();
        let gp = JsValue::boxed(JsTag::GpBase, 0);
        ctx.store(gp, 8, PrimType::I16, JsValue::number(-2)).unwrap();
        assert_eq!(ctx.load(gp, 8, PrimType::I16).unwrap(), JsValue::number(-2));
        assert_eq!(ctx.load(gp, 8, PrimType::U16).unwrap(), JsValue::number(0xfffe));
        ctx.store(gp, 8, PrimType::F64, JsValue::number(3)).unwrap();
        assert_eq!(ctx.load(gp, 8, PrimType::F64).unwrap(), JsValue::double(3.0));
    }

    #[test]
    fn test_retval0_counts() {
        let mut ctx = context();
        let a = ctx.heap.alloc_string("a").unwrap();
        ctx.set_retval0(a);
        assert_eq!(ctx.heap.rc(a), Some(1));
        ctx.set_retval0(JsValue::number(1));
        assert_eq!(ctx.heap.live(), 0);
    }

    #[test]
    fn test_bad_address_tags() {
        let ctx = context();
        assert!(matches!(
            ctx.load(JsValue::number(0), 0, PrimType::DynAny),
            Err(EngineError::BadAddress(_))
        ));
        let sp = JsValue::boxed(JsTag::SpBase, 0);
        assert!(ctx.resolve(sp, -8).is_err());
    }
}
