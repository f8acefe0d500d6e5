use crate::error::EngineError;

use super::primtype::PrimType;

/// Opcodes shared by the static and dynamic dispatch loops.
///
/// Every instruction starts with a 4-byte base:
///
/// ```text
/// +--------+--------+-----------------+
/// |   op   |  ptyp  |      param      |
/// +--------+--------+-----------------+
///   u8       u8       u16 (little-endian)
/// ```
///
/// Some opcodes carry trailing immediates or tables. Their exact size comes
/// from [`Opcode::layout`]; the loops never advance the program counter by
/// any other rule. Branch offsets are `i32` relative to the address of the
/// offset field itself.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    // ========================================
    // Reads
    // ========================================
    Dread = 0x01,
    Regread = 0x02,
    Iread = 0x03,
    Ireadoff = 0x04,
    Ireadoff32 = 0x05,
    Ireadfpoff = 0x06,
    Addrof = 0x07,
    Addroffunc = 0x08,
    Constval = 0x09,
    Constval64 = 0x0a,
    Conststr = 0x0b,

    // ========================================
    // Writes
    // ========================================
    Dassign = 0x10,
    Regassign = 0x11,
    Iassignoff = 0x12,
    Iassignoff32 = 0x13,
    Iassignfpoff = 0x14,

    // ========================================
    // Binary arithmetic
    // ========================================
    Add = 0x20,
    Sub = 0x21,
    Mul = 0x22,
    Div = 0x23,
    Rem = 0x24,
    Ashr = 0x25,
    Lshr = 0x26,
    Shl = 0x27,
    Band = 0x28,
    Bior = 0x29,
    Bxor = 0x2a,
    Land = 0x2b,
    Lior = 0x2c,
    Max = 0x2d,
    Min = 0x2e,

    // ========================================
    // Comparison
    // ========================================
    Eq = 0x30,
    Ne = 0x31,
    Lt = 0x32,
    Le = 0x33,
    Gt = 0x34,
    Ge = 0x35,
    Cmp = 0x36,
    Cmpl = 0x37,
    Cmpg = 0x38,

    // ========================================
    // Unary and conversions
    // ========================================
    Neg = 0x40,
    Bnot = 0x41,
    Lnot = 0x42,
    Cvt = 0x43,
    Retype = 0x44,
    Sext = 0x45,
    Zext = 0x46,
    Extractbits = 0x47,
    Select = 0x48,

    // ========================================
    // Control flow and calls
    // ========================================
    Goto = 0x50,
    Brtrue = 0x51,
    Brfalse = 0x52,
    Rangegoto = 0x53,
    Return = 0x54,
    Call = 0x55,
    Icall = 0x56,
    Intrinsiccall = 0x57,
    Eval = 0x58,

    // ========================================
    // Exceptions
    // ========================================
    Javatry = 0x60,
    Javacatch = 0x61,
    Throw = 0x62,
    Endtry = 0x63,
    Cleanuptry = 0x64,
    Jstry = 0x65,
    Jscatch = 0x66,
    Finally = 0x67,
    Gosub = 0x68,
    Retsub = 0x69,

    // ========================================
    // Scheduling and memory ordering
    // ========================================
    Checkpoint = 0x70,
    Membaracquire = 0x71,
    Membarrelease = 0x72,
    Membarstoreload = 0x73,
    Membarstorestore = 0x74,
}

/// Shape of an instruction after its 4-byte base.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    /// Base only.
    Base,
    /// One 32-bit immediate.
    Imm32,
    /// One 64-bit immediate.
    Imm64,
    /// `i32` adjust, then `param` table entries of 4 bytes.
    RangeTable,
    /// `param` table entries of 4 bytes.
    CaseTable,
    /// `u16` length and name bytes, padded to 4.
    Name,
    /// Catch and finally offsets.
    JsTry,
}

pub const BASE_SIZE: usize = 4;

impl Opcode {
    pub fn from_u8(byte: u8) -> Option<Opcode> {
        use Opcode::*;
        Some(match byte {
            0x01 => Dread,
            0x02 => Regread,
            0x03 => Iread,
            0x04 => Ireadoff,
            0x05 => Ireadoff32,
            0x06 => Ireadfpoff,
            0x07 => Addrof,
            0x08 => Addroffunc,
            0x09 => Constval,
            0x0a => Constval64,
            0x0b => Conststr,
            0x10 => Dassign,
            0x11 => Regassign,
            0x12 => Iassignoff,
            0x13 => Iassignoff32,
            0x14 => Iassignfpoff,
            0x20 => Add,
            0x21 => Sub,
            0x22 => Mul,
            0x23 => Div,
            0x24 => Rem,
            0x25 => Ashr,
            0x26 => Lshr,
            0x27 => Shl,
            0x28 => Band,
            0x29 => Bior,
            0x2a => Bxor,
            0x2b => Land,
            0x2c => Lior,
            0x2d => Max,
            0x2e => Min,
            0x30 => Eq,
            0x31 => Ne,
            0x32 => Lt,
            0x33 => Le,
            0x34 => Gt,
            0x35 => Ge,
            0x36 => Cmp,
            0x37 => Cmpl,
            0x38 => Cmpg,
            0x40 => Neg,
            0x41 => Bnot,
            0x42 => Lnot,
            0x43 => Cvt,
            0x44 => Retype,
            0x45 => Sext,
            0x46 => Zext,
            0x47 => Extractbits,
            0x48 => Select,
            0x50 => Goto,
            0x51 => Brtrue,
            0x52 => Brfalse,
            0x53 => Rangegoto,
            0x54 => Return,
            0x55 => Call,
            0x56 => Icall,
            0x57 => Intrinsiccall,
            0x58 => Eval,
            0x60 => Javatry,
            0x61 => Javacatch,
            0x62 => Throw,
            0x63 => Endtry,
            0x64 => Cleanuptry,
            0x65 => Jstry,
            0x66 => Jscatch,
            0x67 => Finally,
            0x68 => Gosub,
            0x69 => Retsub,
            0x70 => Checkpoint,
            0x71 => Membaracquire,
            0x72 => Membarrelease,
            0x73 => Membarstoreload,
            0x74 => Membarstorestore,
            _ => return None,
        })
    }

    pub fn layout(self) -> Layout {
        use Opcode::*;
        match self {
            Ireadoff32 | Iassignoff32 | Addroffunc | Conststr | Goto | Brtrue | Brfalse
            | Gosub => Layout::Imm32,
            Constval64 => Layout::Imm64,
            Rangegoto => Layout::RangeTable,
            Javatry | Javacatch => Layout::CaseTable,
            Call => Layout::Name,
            Jstry => Layout::JsTry,
            _ => Layout::Base,
        }
    }

    pub fn name(self) -> &'static str {
        use Opcode::*;
        match self {
            Dread => "dread",
            Regread => "regread",
            Iread => "iread",
            Ireadoff => "ireadoff",
            Ireadoff32 => "ireadoff32",
            Ireadfpoff => "ireadfpoff",
            Addrof => "addrof",
            Addroffunc => "addroffunc",
            Constval => "constval",
            Constval64 => "constval64",
            Conststr => "conststr",
            Dassign => "dassign",
            Regassign => "regassign",
            Iassignoff => "iassignoff",
            Iassignoff32 => "iassignoff32",
            Iassignfpoff => "iassignfpoff",
            Add => "add",
            Sub => "sub",
            Mul => "mul",
            Div => "div",
            Rem => "rem",
            Ashr => "ashr",
            Lshr => "lshr",
            Shl => "shl",
            Band => "band",
            Bior => "bior",
            Bxor => "bxor",
            Land => "land",
            Lior => "lior",
            Max => "max",
            Min => "min",
            Eq => "eq",
            Ne => "ne",
            Lt => "lt",
            Le => "le",
            Gt => "gt",
            Ge => "ge",
            Cmp => "cmp",
            Cmpl => "cmpl",
            Cmpg => "cmpg",
            Neg => "neg",
            Bnot => "bnot",
            Lnot => "lnot",
            Cvt => "cvt",
            Retype => "retype",
            Sext => "sext",
            Zext => "zext",
            Extractbits => "extractbits",
            Select => "select",
            Goto => "goto",
            Brtrue => "brtrue",
            Brfalse => "brfalse",
            Rangegoto => "rangegoto",
            Return => "return",
            Call => "call",
            Icall => "icall",
            Intrinsiccall => "intrinsiccall",
            Eval => "eval",
            Javatry => "javatry",
            Javacatch => "javacatch",
            Throw => "throw",
            Endtry => "endtry",
            Cleanuptry => "cleanuptry",
            Jstry => "jstry",
            Jscatch => "jscatch",
            Finally => "finally",
            Gosub => "gosub",
            Retsub => "retsub",
            Checkpoint => "checkpoint",
            Membaracquire => "membaracquire",
            Membarrelease => "membarrelease",
            Membarstoreload => "membarstoreload",
            Membarstorestore => "membarstorestore",
        }
    }
}

// ============================================================
// Byte readers
// ============================================================

#[inline(always)]
fn bytes<const N: usize>(code: &[u8], at: usize) -> Result<[u8; N], EngineError> {
    code.get(at..at + N)
        .and_then(|s| s.try_into().ok())
        .ok_or_else(|| EngineError::malformed(at, "read past end of code"))
}

#[inline(always)]
pub fn read_u16(code: &[u8], at: usize) -> Result<u16, EngineError> {
    Ok(u16::from_le_bytes(bytes(code, at)?))
}

#[inline(always)]
pub fn read_u32(code: &[u8], at: usize) -> Result<u32, EngineError> {
    Ok(u32::from_le_bytes(bytes(code, at)?))
}

#[inline(always)]
pub fn read_i32(code: &[u8], at: usize) -> Result<i32, EngineError> {
    Ok(i32::from_le_bytes(bytes(code, at)?))
}

#[inline(always)]
pub fn read_u64(code: &[u8], at: usize) -> Result<u64, EngineError> {
    Ok(u64::from_le_bytes(bytes(code, at)?))
}

/// Resolves an offset stored at `field` against the field's own address.
pub fn branch_target(code: &[u8], field: usize) -> Result<usize, EngineError> {
    let offset = read_i32(code, field)?;
    let target = field as i64 + offset as i64;
    if target < 0 || target as usize >= code.len() {
        return Err(EngineError::malformed(field, format!("branch target {} out of range", target)));
    }
    Ok(target as usize)
}

// ============================================================
// Decoded instruction base
// ============================================================

/// The 4-byte base of an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instr {
    pub op: Opcode,
    pub ptyp: u8,
    pub param: u16,
}

impl Instr {
    pub fn decode(code: &[u8], pc: usize) -> Result<Instr, EngineError> {
        let raw: [u8; 4] = bytes(code, pc)?;
        let op = Opcode::from_u8(raw[0]).ok_or(EngineError::UnknownOpcode { op: raw[0], pc })?;
        Ok(Instr {
            op,
            ptyp: raw[1],
            param: u16::from_le_bytes([raw[2], raw[3]]),
        })
    }

    /// Exact encoded size of the instruction at `pc`.
    pub fn size(&self, code: &[u8], pc: usize) -> Result<usize, EngineError> {
        Ok(match self.op.layout() {
            Layout::Base => BASE_SIZE,
            Layout::Imm32 => BASE_SIZE + 4,
            Layout::Imm64 => BASE_SIZE + 8,
            Layout::RangeTable => BASE_SIZE + 4 + 4 * self.num_cases(),
            Layout::CaseTable => BASE_SIZE + 4 * self.num_cases(),
            Layout::Name => {
                let len = read_u16(code, pc + BASE_SIZE)? as usize;
                BASE_SIZE + ((len + 2 + 3) & !3)
            }
            Layout::JsTry => BASE_SIZE + 8,
        })
    }

    #[inline]
    pub fn prim_type(&self) -> Result<PrimType, EngineError> {
        PrimType::from_u8(self.ptyp)
    }

    /// Local (`<= 0`) or formal (`> 0`) index.
    #[inline]
    pub fn frame_idx(&self) -> i16 {
        self.param as i16
    }

    /// Signed field offset of `ireadoff`, `iassignoff` and the fp forms.
    #[inline]
    pub fn offset(&self) -> i16 {
        self.param as i16
    }

    #[inline]
    pub fn num_opnds(&self) -> usize {
        self.param as usize
    }

    #[inline]
    pub fn num_cases(&self) -> usize {
        self.param as usize
    }

    /// Operand type carried in the low byte (comparisons, cvt, retype).
    #[inline]
    pub fn op_ptyp(&self) -> Result<PrimType, EngineError> {
        PrimType::from_u8(self.param as u8)
    }

    #[inline]
    pub fn bit_offset(&self) -> u32 {
        (self.param & 0xff) as u32
    }

    #[inline]
    pub fn bit_size(&self) -> u32 {
        (self.param >> 8) as u32
    }

    /// Argument count of `intrinsiccall`.
    #[inline]
    pub fn intrinsic_opnds(&self) -> usize {
        (self.param & 0xff) as usize
    }

    /// Intrinsic id of `intrinsiccall`.
    #[inline]
    pub fn intrinsic_id(&self) -> u8 {
        (self.param >> 8) as u8
    }
}

/// Reads the length-prefixed callee name of a `call` at `pc`.
pub fn call_name(code: &[u8], pc: usize) -> Result<&str, EngineError> {
    let len = read_u16(code, pc + BASE_SIZE)? as usize;
    let start = pc + BASE_SIZE + 2;
    let raw = code
        .get(start..start + len)
        .ok_or_else(|| EngineError::malformed(pc, "call name past end of code"))?;
    std::str::from_utf8(raw).map_err(|_| EngineError::malformed(pc, "call name is not UTF-8"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_round_trip() {
        for byte in 0..=u8::MAX {
            if let Some(op) = Opcode::from_u8(byte) {
                assert_eq!(op as u8, byte);
            }
        }
        assert_eq!(Opcode::from_u8(0), None);
        assert_eq!(Opcode::from_u8(0xff), None);
    }

    #[test]
    fn test_fixed_sizes() {
        let code = [0u8; 16];
        let size = |op: Opcode, param: u16| Instr { op, ptyp: 0, param }.size(&code, 0).unwrap();
        assert_eq!(size(Opcode::Add, 0), 4);
        assert_eq!(size(Opcode::Goto, 0), 8);
        assert_eq!(size(Opcode::Constval64, 0), 12);
        assert_eq!(size(Opcode::Jstry, 0), 12);
        assert_eq!(size(Opcode::Javatry, 3), 16);
        assert_eq!(size(Opcode::Rangegoto, 2), 16);
    }

    #[test]
    fn test_call_size_pads_name() {
        // call with name "abs": 4 + round_up(2 + 3, 4) = 12
        let mut code = vec![Opcode::Call as u8, PrimType::I32 as u8, 1, 0];
        code.extend_from_slice(&3u16.to_le_bytes());
        code.extend_from_slice(b"abs");
        code.push(0);
        let instr = Instr::decode(&code, 0).unwrap();
        assert_eq!(instr.size(&code, 0).unwrap(), 12);
        assert_eq!(call_name(&code, 0).unwrap(), "abs");
    }

    #[test]
    fn test_unknown_opcode() {
        let err = Instr::decode(&[0xee, 0, 0, 0], 0).unwrap_err();
        assert!(matches!(err, EngineError::UnknownOpcode { op: 0xee, pc: 0 }));
    }

    #[test]
    fn test_branch_target_relative_to_field() {
        let mut code = vec![0u8; 32];
        code[4..8].copy_from_slice(&(-4i32).to_le_bytes());
        assert_eq!(branch_target(&code, 4).unwrap(), 0);
        code[4..8].copy_from_slice(&100i32.to_le_bytes());
        assert!(branch_target(&code, 4).is_err());
    }

    #[test]
    fn test_param_views() {
        let instr = Instr {
            op: Opcode::Intrinsiccall,
            ptyp: 0,
            param: 0x0302,
        };
        assert_eq!(instr.intrinsic_opnds(), 2);
        assert_eq!(instr.intrinsic_id(), 3);
        let instr = Instr {
            op: Opcode::Dread,
            ptyp: 0,
            param: (-2i16) as u16,
        };
        assert_eq!(instr.frame_idx(), -2);
    }
}
