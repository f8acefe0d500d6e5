// ============================================================================
// Image disassembler
// ============================================================================

use std::fmt;

use serde::Serialize;

use crate::error::EngineError;

use super::image::{Image, Mode};
use super::intrinsic::IntrinsicId;
use super::ops::{BASE_SIZE, Instr, Layout, Opcode, branch_target, call_name, read_i32, read_u32, read_u64};
use super::primtype::PrimType;

/// Every method of an image, decoded.
#[derive(Debug, Clone, Serialize)]
pub struct Listing {
    pub mode: &'static str,
    pub entry: usize,
    pub methods: Vec<MethodListing>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MethodListing {
    pub offset: usize,
    pub header: HeaderInfo,
    pub instrs: Vec<InstrLine>,
    /// Bytes after the last terminator that do not decode (string data).
    pub trailing_data: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HeaderInfo {
    Static {
        formals: Vec<String>,
        locals: Vec<String>,
        eval_depth: u16,
        flags: u16,
    },
    Dynamic {
        up_formal_size: u16,
        frame_size: u16,
        eval_stack_depth: u16,
        attribute: u16,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct InstrLine {
    pub pc: usize,
    pub size: usize,
    pub op: &'static str,
    pub ptyp: &'static str,
    pub operands: String,
}

/// Offsets of every method in the image, in code order.
pub fn method_offsets(image: &Image) -> Vec<usize> {
    (0..image.code().len())
        .step_by(8)
        .filter(|&off| image.is_method(off))
        .collect()
}

/// Decodes every method of `image`.
pub fn disassemble(image: &Image) -> Result<Listing, EngineError> {
    let offsets = method_offsets(image);
    let mut methods = Vec::with_capacity(offsets.len());
    for (i, &offset) in offsets.iter().enumerate() {
        let end = offsets.get(i + 1).copied().unwrap_or(image.code().len());
        methods.push(method(image, offset, end)?);
    }
    Ok(Listing {
        mode: image.mode().name(),
        entry: image.entry() as usize,
        methods,
    })
}

/// Validates every header, instruction boundary, type byte and branch
/// target. Returns the number of instructions seen.
pub fn check(image: &Image) -> Result<usize, EngineError> {
    if !image.is_method(image.entry() as usize) {
        return Err(EngineError::NotAMethod(image.entry() as u64));
    }
    let listing = disassemble(image)?;
    let code = image.code();
    let mut count = 0;
    for m in &listing.methods {
        let start = m.instrs.first().map_or(m.offset, |l| l.pc);
        let end = m.instrs.last().map_or(start, |l| l.pc + l.size);
        for line in &m.instrs {
            let instr = Instr::decode(code, line.pc)?;
            for target in targets(code, instr, line.pc)? {
                if target < start || target >= end {
                    return Err(EngineError::malformed(
                        line.pc,
                        format!("{} target {:#x} leaves its method", line.op, target),
                    ));
                }
            }
            count += 1;
        }
    }
    Ok(count)
}

fn method(image: &Image, offset: usize, end: usize) -> Result<MethodListing, EngineError> {
    let (header, start) = match image.mode() {
        Mode::Static => {
            let h = image.method_header(offset)?;
            let slot = |s: &super::image::SlotInfo| match s.prim_type() {
                Some(ty) => format!("{}/{}", ty.name(), s.rc_class),
                None => format!("?{:#04x}/{}", s.ptyp, s.rc_class),
            };
            let info = HeaderInfo::Static {
                formals: h.formals.iter().map(slot).collect(),
                locals: h.locals.iter().map(slot).collect(),
                eval_depth: h.eval_depth,
                flags: h.flags,
            };
            (info, h.code_start())
        }
        Mode::Dynamic => {
            let h = image.dyn_method_header(offset)?;
            let info = HeaderInfo::Dynamic {
                up_formal_size: h.up_formal_size,
                frame_size: h.frame_size,
                eval_stack_depth: h.eval_stack_depth,
                attribute: h.attribute,
            };
            (info, h.code_start())
        }
    };

    let code = image.code();
    let mut instrs = Vec::new();
    let mut pc = start;
    let mut terminated = false;
    while pc < end {
        let decoded = Instr::decode(code, pc).and_then(|i| {
            PrimType::from_u8(i.ptyp)?;
            Ok((i, i.size(code, pc)?))
        });
        let (instr, size) = match decoded {
            Ok(d) if pc + d.1 <= end => d,
            // string data after the method's last terminator
            _ if terminated => break,
            Ok(_) => return Err(EngineError::malformed(pc, "instruction runs past its method")),
            Err(e) => return Err(e),
        };
        instrs.push(InstrLine {
            pc,
            size,
            op: instr.op.name(),
            ptyp: PrimType::from_u8(instr.ptyp).map_or("?", PrimType::name),
            operands: operands(code, instr, pc)?,
        });
        terminated |= matches!(
            instr.op,
            Opcode::Return | Opcode::Goto | Opcode::Throw | Opcode::Retsub | Opcode::Rangegoto
        );
        pc += size;
    }
    Ok(MethodListing {
        offset,
        header,
        instrs,
        trailing_data: end - pc,
    })
}

/// Branch targets an instruction can transfer to.
fn targets(code: &[u8], instr: Instr, pc: usize) -> Result<Vec<usize>, EngineError> {
    let field = pc + BASE_SIZE;
    Ok(match instr.op {
        Opcode::Goto | Opcode::Brtrue | Opcode::Brfalse | Opcode::Gosub => vec![branch_target(code, field)?],
        Opcode::Rangegoto => (0..instr.num_cases())
            .map(|i| branch_target(code, field + 4 + 4 * i))
            .collect::<Result<_, _>>()?,
        Opcode::Javatry => (0..instr.num_cases())
            .map(|i| branch_target(code, field + 4 * i))
            .collect::<Result<_, _>>()?,
        Opcode::Jstry => {
            let mut out = Vec::new();
            for f in [field, field + 4] {
                if read_i32(code, f)? != 0 {
                    out.push(branch_target(code, f)?);
                }
            }
            out
        }
        _ => Vec::new(),
    })
}

fn operands(code: &[u8], instr: Instr, pc: usize) -> Result<String, EngineError> {
    let field = pc + BASE_SIZE;
    let list = |v: Vec<usize>| v.iter().map(|t| format!("{:#x}", t)).collect::<Vec<_>>().join(", ");
    Ok(match instr.op {
        Opcode::Dread | Opcode::Regread | Opcode::Dassign | Opcode::Regassign | Opcode::Addrof => {
            format!("{}", instr.frame_idx())
        }
        Opcode::Ireadoff | Opcode::Iassignoff | Opcode::Ireadfpoff | Opcode::Iassignfpoff => {
            format!("{:+}", instr.offset())
        }
        Opcode::Ireadoff32 | Opcode::Iassignoff32 => format!("{:+}", read_i32(code, field)?),
        Opcode::Constval => format!("{}", instr.param as i16),
        Opcode::Constval64 => {
            let bits = read_u64(code, field)?;
            match PrimType::from_u8(instr.ptyp) {
                Ok(PrimType::F64 | PrimType::DynF64) => format!("{}", f64::from_bits(bits)),
                Ok(PrimType::F32 | PrimType::DynF32) => format!("{}", f32::from_bits(bits as u32)),
                _ => format!("{:#x}", bits),
            }
        }
        Opcode::Conststr => {
            let at = read_u32(code, field)? as usize;
            let text = code
                .get(at..)
                .and_then(|rest| rest.split(|&b| b == 0).next())
                .map(String::from_utf8_lossy)
                .unwrap_or_default();
            format!("{:?}", text)
        }
        Opcode::Addroffunc => format!("method {:#x}", read_u32(code, field)?),
        Opcode::Eq
        | Opcode::Ne
        | Opcode::Lt
        | Opcode::Le
        | Opcode::Gt
        | Opcode::Ge
        | Opcode::Cmp
        | Opcode::Cmpl
        | Opcode::Cmpg
        | Opcode::Cvt
        | Opcode::Retype => instr.op_ptyp().map_or_else(|_| "?".into(), |t| t.name().to_string()),
        Opcode::Sext | Opcode::Zext | Opcode::Extractbits => {
            format!("{}:{}", instr.bit_offset(), instr.bit_size())
        }
        Opcode::Return | Opcode::Icall => format!("{}", instr.num_opnds()),
        Opcode::Call => format!("{} ({})", call_name(code, pc)?, instr.num_opnds()),
        Opcode::Intrinsiccall => {
            let id = instr.intrinsic_id();
            let name = IntrinsicId::from_u8(id).map_or("?", IntrinsicId::name);
            format!("{} {:#04x} ({})", name, id, instr.intrinsic_opnds())
        }
        Opcode::Rangegoto => format!("adjust {} [{}]", read_i32(code, field)?, list(targets(code, instr, pc)?)),
        Opcode::Javacatch => {
            let types: Vec<String> = (0..instr.num_cases())
                .map(|i| read_u32(code, field + 4 * i).map(|t| format!("{:#x}", t)))
                .collect::<Result<_, _>>()?;
            format!("[{}]", types.join(", "))
        }
        Opcode::Jstry => {
            let slot = |f: usize| -> Result<String, EngineError> {
                Ok(if read_i32(code, f)? == 0 {
                    "-".into()
                } else {
                    format!("{:#x}", branch_target(code, f)?)
                })
            };
            format!("catch {} finally {}", slot(field)?, slot(field + 4)?)
        }
        op if op.layout() == Layout::Imm32 || op == Opcode::Javatry => {
            format!("-> {}", list(targets(code, instr, pc)?))
        }
        _ => String::new(),
    })
}

impl fmt::Display for Listing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "== {} image, entry {:#x} ==", self.mode, self.entry)?;
        for m in &self.methods {
            writeln!(f)?;
            match &m.header {
                HeaderInfo::Static {
                    formals,
                    locals,
                    eval_depth,
                    flags,
                } => writeln!(
                    f,
                    "== Method {:#x} (formals: [{}], locals: [{}], depth: {}, flags: {:#x}) ==",
                    m.offset,
                    formals.join(", "),
                    locals.join(", "),
                    eval_depth,
                    flags
                )?,
                HeaderInfo::Dynamic {
                    up_formal_size,
                    frame_size,
                    eval_stack_depth,
                    attribute,
                } => writeln!(
                    f,
                    "== Method {:#x} (up_formal_size: {}, frame_size: {}, depth: {}, attribute: {:#x}) ==",
                    m.offset, up_formal_size, frame_size, eval_stack_depth, attribute
                )?,
            }
            for line in &m.instrs {
                write!(f, "{:06x} [{:2}] {} {}", line.pc, line.size, line.op, line.ptyp)?;
                if !line.operands.is_empty() {
                    write!(f, " {}", line.operands)?;
                }
                writeln!(f)?;
            }
            if m.trailing_data > 0 {
                writeln!(f, "       ({} bytes of data)", m.trailing_data)?;
            }
        }
        Ok(())
    }
}
