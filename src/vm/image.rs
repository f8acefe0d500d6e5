//! Loaded modules and compiled-method headers.
//!
//! Container format:
//! - Magic: "MIRE" (4 bytes)
//! - Version: u32
//! - Mode: u8 (0 = static, 1 = dynamic)
//! - Entry: u32 offset of the entry method within the code section
//! - Code: length + bytes
//! - Global data: length (multiple of 8) + bytes
//! - Type-tagged bitmap: length + bytes
//! - Ref-counted bitmap: length + bytes
//!
//! Inside the code section every method starts with `MPLI_OFFSET` bytes of
//! padding, the 4-byte magic word and its header, followed by its code.
//! A method is addressed by the offset (or absolute address) of its first
//! padding byte.

use std::io::{self, Read, Write};
use std::path::Path;

use crate::error::{EngineError, ImageError};

use super::ops::{read_u16, read_u32};
use super::primtype::PrimType;

/// Magic bytes for image files
pub const MAGIC: &[u8; 4] = b"MIRE";

/// Current image format version
pub const VERSION: u32 = 1;

/// Marker preceding every compiled method header ("MPLI").
pub const METHOD_MAGIC: u32 = 0x494c_504d;

/// Distance from a method address to its magic word.
#[cfg(target_arch = "aarch64")]
pub const MPLI_OFFSET: usize = 8;
#[cfg(not(target_arch = "aarch64"))]
pub const MPLI_OFFSET: usize = 0;

/// Method flag: strict semantics.
pub const FLAG_STRICT: u16 = 0x10;
/// Method flag: the method materialises an `arguments` object.
pub const FLAG_ARGUMENTS: u16 = 0x20;

/// Byte size of the fixed part of a static method header.
pub const METHOD_HEADER_FIXED: usize = 12;
/// Byte size of a dynamic method header.
pub const DYN_METHOD_HEADER_SIZE: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Static,
    Dynamic,
}

impl Mode {
    pub fn name(self) -> &'static str {
        match self {
            Mode::Static => "static",
            Mode::Dynamic => "dynamic",
        }
    }
}

/// A loaded module. The code section never moves once built, so absolute
/// addresses into it stay valid for the image's lifetime.
#[derive(Debug)]
pub struct Image {
    mode: Mode,
    entry: u32,
    code: Box<[u8]>,
    globals: Vec<u8>,
    type_tagged: Vec<u8>,
    ref_counted: Vec<u8>,
}

impl Image {
    pub fn new(mode: Mode, code: Vec<u8>, entry: u32) -> Self {
        Image {
            mode,
            entry,
            code: code.into_boxed_slice(),
            globals: Vec::new(),
            type_tagged: Vec::new(),
            ref_counted: Vec::new(),
        }
    }

    /// Attaches the global data image and its per-word bitmaps.
    pub fn with_globals(mut self, globals: Vec<u8>, type_tagged: Vec<u8>, ref_counted: Vec<u8>) -> Self {
        self.globals = globals;
        self.type_tagged = type_tagged;
        self.ref_counted = ref_counted;
        self
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn entry(&self) -> u32 {
        self.entry
    }

    pub fn code(&self) -> &[u8] {
        &self.code
    }

    pub fn globals(&self) -> &[u8] {
        &self.globals
    }

    pub fn type_tagged(&self) -> &[u8] {
        &self.type_tagged
    }

    pub fn ref_counted(&self) -> &[u8] {
        &self.ref_counted
    }

    /// Absolute address of the first code byte.
    pub fn base_addr(&self) -> u64 {
        self.code.as_ptr() as u64
    }

    pub fn addr_of(&self, offset: usize) -> u64 {
        self.base_addr() + offset as u64
    }

    /// Code offset of an absolute address inside this image.
    pub fn offset_of(&self, addr: u64) -> Option<usize> {
        let base = self.base_addr();
        if addr >= base && addr < base + self.code.len() as u64 {
            Some((addr - base) as usize)
        } else {
            None
        }
    }

    /// True when a method magic word sits at `offset + MPLI_OFFSET`.
    pub fn is_method(&self, offset: usize) -> bool {
        matches!(read_u32(&self.code, offset + MPLI_OFFSET), Ok(METHOD_MAGIC))
    }

    fn header_start(&self, offset: usize) -> Result<usize, EngineError> {
        if !self.is_method(offset) {
            return Err(EngineError::NotAMethod(offset as u64));
        }
        Ok(offset + MPLI_OFFSET + 4)
    }

    pub fn method_header(&self, offset: usize) -> Result<MethodHeader, EngineError> {
        let at = self.header_start(offset)?;
        MethodHeader::parse(&self.code, at)
    }

    pub fn dyn_method_header(&self, offset: usize) -> Result<DynMethodHeader, EngineError> {
        let at = self.header_start(offset)?;
        DynMethodHeader::parse(&self.code, at)
    }

    /// Bit `word` of the type-tagged global bitmap.
    pub fn global_is_tagged(&self, word: usize) -> bool {
        bit(&self.type_tagged, word)
    }

    /// Bit `word` of the ref-counted global bitmap.
    pub fn global_is_counted(&self, word: usize) -> bool {
        bit(&self.ref_counted, word)
    }

    pub fn load(path: &Path) -> Result<Image, ImageError> {
        let data = std::fs::read(path)?;
        deserialize(&data)
    }

    pub fn save(&self, path: &Path) -> Result<(), ImageError> {
        std::fs::write(path, serialize(self)?)?;
        Ok(())
    }
}

fn bit(map: &[u8], index: usize) -> bool {
    map.get(index / 8).is_some_and(|b| b & (1 << (index % 8)) != 0)
}

// ============================================================
// Method headers
// ============================================================

/// Per-slot entry of a static method header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotInfo {
    pub ptyp: u8,
    /// Reference-counting class: 0 not counted, 1 formal released on
    /// unwind, 2/3 local released on unwind, 4/5 local retained on unwind.
    pub rc_class: u8,
}

impl SlotInfo {
    pub fn prim_type(&self) -> Option<PrimType> {
        PrimType::from_u8(self.ptyp).ok()
    }
}

/// Static-mode method header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodHeader {
    /// Code offset of the header's first byte.
    pub at: usize,
    pub header_size: u32,
    pub formals_num: u16,
    pub locals_num: u16,
    pub eval_depth: u16,
    pub flags: u16,
    pub formals: Vec<SlotInfo>,
    pub locals: Vec<SlotInfo>,
}

impl MethodHeader {
    pub fn parse(code: &[u8], at: usize) -> Result<MethodHeader, EngineError> {
        let header_size = read_u32(code, at)?;
        let formals_num = read_u16(code, at + 4)?;
        let locals_num = read_u16(code, at + 6)?;
        let eval_depth = read_u16(code, at + 8)?;
        let flags = read_u16(code, at + 10)?;

        let table_end = METHOD_HEADER_FIXED + 2 * (formals_num as usize + locals_num as usize);
        if (header_size as usize) < table_end || at + header_size as usize > code.len() {
            return Err(EngineError::malformed(at, format!("bad header size {}", header_size)));
        }

        let slot = |i: usize| {
            let p = at + METHOD_HEADER_FIXED + 2 * i;
            SlotInfo {
                ptyp: code[p],
                rc_class: code[p + 1],
            }
        };
        let formals = (0..formals_num as usize).map(slot).collect();
        let locals = (formals_num as usize..formals_num as usize + locals_num as usize)
            .map(slot)
            .collect();

        Ok(MethodHeader {
            at,
            header_size,
            formals_num,
            locals_num,
            eval_depth,
            flags,
            formals,
            locals,
        })
    }

    /// Code offset of the method's first instruction.
    pub fn code_start(&self) -> usize {
        self.at + self.header_size as usize
    }

    pub fn is_strict(&self) -> bool {
        self.flags & FLAG_STRICT != 0
    }
}

/// Dynamic-mode method header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DynMethodHeader {
    pub at: usize,
    pub header_size: u32,
    pub up_formal_size: u16,
    pub frame_size: u16,
    pub eval_stack_depth: u16,
    pub attribute: u16,
    pub formal_words_byte_count: u16,
    pub local_words_bit_count: u16,
    pub formal_words_type_tagged: u32,
    pub formal_words_ref_counted: u32,
    pub local_words_type_tagged: u32,
    pub local_words_ref_counted: u32,
}

impl DynMethodHeader {
    pub fn parse(code: &[u8], at: usize) -> Result<DynMethodHeader, EngineError> {
        let header_size = read_u32(code, at)?;
        if (header_size as usize) < DYN_METHOD_HEADER_SIZE || at + header_size as usize > code.len() {
            return Err(EngineError::malformed(at, format!("bad header size {}", header_size)));
        }
        let frame_size = read_u16(code, at + 6)?;
        if frame_size % 8 != 0 {
            return Err(EngineError::malformed(at, format!("frame size {} not word aligned", frame_size)));
        }
        Ok(DynMethodHeader {
            at,
            header_size,
            up_formal_size: read_u16(code, at + 4)?,
            frame_size,
            eval_stack_depth: read_u16(code, at + 8)?,
            attribute: read_u16(code, at + 10)?,
            formal_words_byte_count: read_u16(code, at + 12)?,
            local_words_bit_count: read_u16(code, at + 14)?,
            formal_words_type_tagged: read_u32(code, at + 16)?,
            formal_words_ref_counted: read_u32(code, at + 20)?,
            local_words_type_tagged: read_u32(code, at + 24)?,
            local_words_ref_counted: read_u32(code, at + 28)?,
        })
    }

    pub fn code_start(&self) -> usize {
        self.at + self.header_size as usize
    }

    /// Number of declared formals, `this` excluded.
    pub fn formals_num(&self) -> usize {
        (self.up_formal_size as usize / 8).saturating_sub(1)
    }

    pub fn is_strict(&self) -> bool {
        self.attribute & FLAG_STRICT != 0
    }

    pub fn uses_arguments(&self) -> bool {
        self.attribute & FLAG_ARGUMENTS != 0
    }
}

// ============================================================
// Container
// ============================================================

/// Serialize an image to bytes
pub fn serialize(image: &Image) -> io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    write_image(&mut buf, image)?;
    Ok(buf)
}

/// Deserialize an image from bytes
pub fn deserialize(data: &[u8]) -> Result<Image, ImageError> {
    let mut cursor = io::Cursor::new(data);
    read_image(&mut cursor)
}

pub fn write_image<W: Write>(w: &mut W, image: &Image) -> io::Result<()> {
    w.write_all(MAGIC)?;
    w.write_all(&VERSION.to_le_bytes())?;
    w.write_all(&[match image.mode {
        Mode::Static => 0,
        Mode::Dynamic => 1,
    }])?;
    w.write_all(&image.entry.to_le_bytes())?;
    write_section(w, &image.code)?;
    write_section(w, &image.globals)?;
    write_section(w, &image.type_tagged)?;
    write_section(w, &image.ref_counted)?;
    Ok(())
}

pub fn read_image<R: Read>(r: &mut R) -> Result<Image, ImageError> {
    let mut magic = [0u8; 4];
    r.read_exact(&mut magic)
        .map_err(|_| ImageError::Truncated("header"))?;
    if &magic != MAGIC {
        return Err(ImageError::InvalidMagic);
    }

    let version = read_word(r, "header")?;
    if version != VERSION {
        return Err(ImageError::UnsupportedVersion(version));
    }

    let mut mode = [0u8; 1];
    r.read_exact(&mut mode)
        .map_err(|_| ImageError::Truncated("header"))?;
    let mode = match mode[0] {
        0 => Mode::Static,
        1 => Mode::Dynamic,
        other => return Err(ImageError::UnknownMode(other)),
    };
    let entry = read_word(r, "header")?;

    let code = read_section(r, "code")?;
    if entry as usize >= code.len().max(1) {
        return Err(ImageError::BadEntry(entry));
    }
    let globals = read_section(r, "globals")?;
    if globals.len() % 8 != 0 {
        return Err(ImageError::MisalignedGlobals(globals.len()));
    }
    let type_tagged = read_section(r, "type-tagged bitmap")?;
    let ref_counted = read_section(r, "ref-counted bitmap")?;

    Ok(Image::new(mode, code, entry).with_globals(globals, type_tagged, ref_counted))
}

fn write_section<W: Write>(w: &mut W, bytes: &[u8]) -> io::Result<()> {
    w.write_all(&(bytes.len() as u32).to_le_bytes())?;
    w.write_all(bytes)
}

fn read_word<R: Read>(r: &mut R, section: &'static str) -> Result<u32, ImageError> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)
        .map_err(|_| ImageError::Truncated(section))?;
    Ok(u32::from_le_bytes(buf))
}

fn read_section<R: Read>(r: &mut R, section: &'static str) -> Result<Vec<u8>, ImageError> {
    let len = read_word(r, section)? as usize;
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)
        .map_err(|_| ImageError::Truncated(section))?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_method() -> Vec<u8> {
        let mut code = vec![0u8; MPLI_OFFSET];
        code.extend_from_slice(&METHOD_MAGIC.to_le_bytes());
        // header_size, formals, locals, eval_depth, flags
        code.extend_from_slice(&16u32.to_le_bytes());
        code.extend_from_slice(&1u16.to_le_bytes());
        code.extend_from_slice(&1u16.to_le_bytes());
        code.extend_from_slice(&4u16.to_le_bytes());
        code.extend_from_slice(&FLAG_STRICT.to_le_bytes());
        code.extend_from_slice(&[PrimType::A64 as u8, 1, PrimType::I32 as u8, 0]);
        code.extend_from_slice(&[0x54, PrimType::Void as u8, 0, 0]);
        code
    }

    #[test]
    fn test_method_header_parse() {
        let image = Image::new(Mode::Static, tiny_method(), 0);
        assert!(image.is_method(0));
        let header = image.method_header(0).unwrap();
        assert_eq!(header.formals_num, 1);
        assert_eq!(header.locals_num, 1);
        assert_eq!(header.eval_depth, 4);
        assert!(header.is_strict());
        assert_eq!(header.formals[0].rc_class, 1);
        assert_eq!(header.locals[0].prim_type(), Some(PrimType::I32));
        assert_eq!(header.code_start(), MPLI_OFFSET + 4 + 16);
    }

    #[test]
    fn test_not_a_method() {
        let image = Image::new(Mode::Static, vec![0u8; 32], 0);
        assert!(!image.is_method(0));
        assert!(matches!(image.method_header(0), Err(EngineError::NotAMethod(0))));
    }

    #[test]
    fn test_roundtrip() {
        let image = Image::new(Mode::Dynamic, tiny_method(), 0).with_globals(
            vec![1, 2, 3, 4, 5, 6, 7, 8],
            vec![0b1],
            vec![0b0],
        );
        let restored = deserialize(&serialize(&image).unwrap()).unwrap();
        assert_eq!(restored.mode(), Mode::Dynamic);
        assert_eq!(restored.code(), image.code());
        assert_eq!(restored.globals(), image.globals());
        assert!(restored.global_is_tagged(0));
        assert!(!restored.global_is_counted(0));
    }

    #[test]
    fn test_invalid_magic() {
        let result = deserialize(b"NOPE\x01\x00\x00\x00");
        assert!(matches!(result, Err(ImageError::InvalidMagic)));
    }

    #[test]
    fn test_unsupported_version() {
        let mut data = MAGIC.to_vec();
        data.extend_from_slice(&99u32.to_le_bytes());
        assert!(matches!(deserialize(&data), Err(ImageError::UnsupportedVersion(99))));
    }

    #[test]
    fn test_misaligned_globals() {
        let mut image = Image::new(Mode::Dynamic, tiny_method(), 0);
        image.globals = vec![0; 5];
        let result = deserialize(&serialize(&image).unwrap());
        assert!(matches!(result, Err(ImageError::MisalignedGlobals(5))));
    }

    #[test]
    fn test_address_mapping() {
        let image = Image::new(Mode::Static, tiny_method(), 0);
        let addr = image.addr_of(4);
        assert_eq!(image.offset_of(addr), Some(4));
        assert_eq!(image.offset_of(image.base_addr() + 4096), None);
    }
}
