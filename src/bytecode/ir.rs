use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::bytecode::block::split_operand;
use crate::bytecode::compile_error::{CompileError, Result};
use crate::bytecode::op::{self, CACHE, EXTENDED_ARG};
use crate::bytecode::resolve::{RawInstruction, ResolvedBlock};
use crate::bytecode::stack_check;
use crate::config::CompileConfig;
use crate::lang::value::Literal;

/// Locals-plus kind bits.
pub const CO_FAST_LOCAL: u8 = 0x20;
pub const CO_FAST_CELL: u8 = 0x40;
pub const CO_FAST_FREE: u8 = 0x80;

/// An assembled function body, laid out the way the target runtime stores it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeObject {
    pub argcount: u32,
    pub posonlyargcount: u32,
    pub kwonlyargcount: u32,
    pub nlocals: u32,
    pub stacksize: u32,
    pub flags: u32,
    /// Two bytes per code unit: opcode, operand.
    pub code: Vec<u8>,
    pub consts: Vec<Literal>,
    pub names: Vec<String>,
    pub localsplusnames: Vec<String>,
    pub localspluskinds: Vec<u8>,
    pub filename: String,
    pub name: String,
    pub qualname: String,
    pub firstlineno: u32,
    pub linetable: Vec<u8>,
    pub exceptiontable: Vec<u8>,
}

impl CodeObject {
    /// The code as logical instructions.
    pub fn instructions(&self) -> Result<Vec<Decoded>> {
        decode(&self.code)
    }

    /// Code objects held in the constant pool.
    pub fn nested(&self) -> impl Iterator<Item = &CodeObject> {
        self.consts.iter().filter_map(|c| match c {
            Literal::Code(code) => Some(code.as_ref()),
            _ => None,
        })
    }
}

fn to_u32(n: usize) -> Result<u32> {
    u32::try_from(n).map_err(|_| CompileError::OperandTooWide { value: n })
}

/// Turn a resolved body into a code object named `name`.
///
/// The encoded code is verified before it is returned.
pub fn assemble(block: ResolvedBlock, name: &str, config: &CompileConfig) -> Result<CodeObject> {
    let code = encode(&block.instructions)?;

    let kinds = (0..block.locals.len())
        .map(|slot| {
            let base = if block.cells.contains(&slot) {
                CO_FAST_FREE
            } else {
                CO_FAST_LOCAL
            };
            if block.made_cells.contains(&slot) {
                base | CO_FAST_CELL
            } else {
                base
            }
        })
        .collect();

    // doubled headroom; the verifier below checks it covers the real peak
    let stacksize = to_u32(usize::try_from(block.max_height.max(0)).unwrap_or(0) * 2)?;

    let code = CodeObject {
        argcount: to_u32(block.arg_count)?,
        posonlyargcount: 0,
        kwonlyargcount: 0,
        nlocals: to_u32(block.locals.len())?,
        stacksize,
        flags: config.code_flags,
        code,
        consts: block.consts,
        names: block.names,
        localsplusnames: block.locals,
        localspluskinds: kinds,
        filename: config.filename.clone(),
        name: name.to_string(),
        qualname: name.to_string(),
        firstlineno: 1,
        linetable: Vec::new(),
        exceptiontable: Vec::new(),
    };

    let peak = stack_check::check_code(&code.code)?;
    if peak > block.max_height.max(0) * 2 {
        return Err(CompileError::stack_check(format!(
            "{}: verified peak {} exceeds stack size {}",
            name, peak, stacksize
        )));
    }

    debug!(
        name,
        units = code.code.len() / 2,
        stacksize,
        peak,
        consts = code.consts.len(),
        "assembled code object"
    );
    Ok(code)
}

// =============================================================================
// Logical instructions
// =============================================================================

/// One logical instruction: extension prefixes, the opcode, its padding slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decoded {
    /// Code unit of the first prefix, or of the opcode when there is none.
    pub offset: usize,
    /// Units from `offset` through the last padding slot.
    pub len: usize,
    pub opcode: u8,
    /// Full operand with prefixes folded in.
    pub arg: u32,
}

impl Decoded {
    pub fn next(&self) -> usize {
        self.offset + self.len
    }

    /// Destination unit of a relative jump.
    pub fn jump_target(&self) -> Option<usize> {
        let arg = usize::try_from(self.arg).ok()?;
        if op::is_forward_jump(self.opcode) {
            Some(self.next() + arg)
        } else if op::is_backward_jump(self.opcode) {
            self.next().checked_sub(arg)
        } else {
            None
        }
    }

    pub fn is_jump(&self) -> bool {
        op::is_forward_jump(self.opcode) || op::is_backward_jump(self.opcode)
    }
}

/// Split raw `(opcode, arg)` units into logical instructions.
///
/// Operands above 255 without a prefix are taken as they are, so unencoded
/// resolver output groups the same way as encoded bytes.
fn group(units: &[(u8, u32)]) -> Result<Vec<Decoded>> {
    let mut out = Vec::new();
    let mut pos = 0;

    while pos < units.len() {
        let offset = pos;
        let mut prefix: Option<u64> = None;
        while let Some(&(EXTENDED_ARG, byte)) = units.get(pos) {
            prefix = Some((prefix.unwrap_or(0) << 8) | u64::from(byte & 0xff));
            pos += 1;
        }

        let &(opcode, raw) = units.get(pos).ok_or_else(|| {
            CompileError::internal(format!("extension prefix at unit {} has no instruction", offset))
        })?;
        let arg = match prefix {
            Some(high) => u32::try_from((high << 8) | u64::from(raw & 0xff))
                .map_err(|_| CompileError::internal(format!("operand at unit {} overflows", offset)))?,
            None => raw,
        };
        pos += 1;

        let padding = op::padding_slots(opcode);
        let slots = units.get(pos..pos + padding).ok_or_else(|| {
            CompileError::internal(format!("{} at unit {} is missing its padding", op::name(opcode), offset))
        })?;
        if slots.iter().any(|(o, _)| *o != CACHE) {
            return Err(CompileError::internal(format!(
                "{} at unit {} has a non-padding unit in its padding slots",
                op::name(opcode),
                offset
            )));
        }
        pos += padding;

        out.push(Decoded {
            offset,
            len: pos - offset,
            opcode,
            arg,
        });
    }

    Ok(out)
}

/// Parse encoded code bytes into logical instructions.
pub fn decode(code: &[u8]) -> Result<Vec<Decoded>> {
    if code.len() % 2 != 0 {
        return Err(CompileError::internal(format!(
            "code has odd length {}",
            code.len()
        )));
    }
    let units: Vec<(u8, u32)> = code
        .chunks_exact(2)
        .map(|pair| (pair[0], u32::from(pair[1])))
        .collect();
    group(&units)
}

fn unit_width(opcode: u8, arg: u32) -> usize {
    split_operand(arg).0.len() + 1 + op::padding_slots(opcode)
}

/// Encode resolved units into code bytes.
///
/// Operands above 255 get extension prefixes. Growing an instruction moves
/// everything after it, so jumps are re-pointed at the same logical
/// instruction they targeted before and the layout is repeated until no
/// instruction changes width.
pub fn encode(units: &[RawInstruction]) -> Result<Vec<u8>> {
    let pairs: Vec<(u8, u32)> = units.iter().map(|u| (u.opcode, u.arg)).collect();
    let instrs = group(&pairs)?;

    let index_of = |unit: usize| -> Result<usize> {
        if unit == pairs.len() {
            return Ok(instrs.len());
        }
        instrs
            .binary_search_by_key(&unit, |d| d.offset)
            .map_err(|_| CompileError::internal(format!("jump into the middle of an instruction at unit {}", unit)))
    };

    let mut targets = Vec::with_capacity(instrs.len());
    for d in &instrs {
        let target = if d.is_jump() {
            let unit = d.jump_target().ok_or_else(|| {
                CompileError::internal(format!("jump at unit {} lands before the code", d.offset))
            })?;
            Some(index_of(unit)?)
        } else {
            None
        };
        targets.push(target);
    }

    let mut args: Vec<u32> = instrs.iter().map(|d| d.arg).collect();
    let mut sizes: Vec<usize> = instrs.iter().map(|d| unit_width(d.opcode, d.arg)).collect();

    // each instruction can gain at most three prefixes
    let limit = 3 * instrs.len() + 2;
    let mut rounds = 0;
    loop {
        rounds += 1;
        if rounds > limit {
            return Err(CompileError::internal("jump layout did not settle"));
        }

        let mut starts = Vec::with_capacity(sizes.len() + 1);
        let mut at = 0;
        for size in &sizes {
            starts.push(at);
            at += size;
        }
        starts.push(at);

        for (i, d) in instrs.iter().enumerate() {
            let Some(t) = targets[i] else { continue };
            let next = starts[i] + sizes[i];
            let distance = if op::is_forward_jump(d.opcode) {
                starts[t].checked_sub(next)
            } else {
                next.checked_sub(starts[t])
            };
            let distance = distance.ok_or_else(|| {
                CompileError::internal(format!("{} at unit {} points the wrong way", op::name(d.opcode), d.offset))
            })?;
            args[i] = to_u32(distance)?;
        }

        let widths: Vec<usize> = instrs
            .iter()
            .zip(&args)
            .zip(&sizes)
            .map(|((d, arg), size)| unit_width(d.opcode, *arg).max(*size))
            .collect();
        if widths == sizes {
            break;
        }
        sizes = widths;
    }

    let mut code = Vec::with_capacity(sizes.iter().sum::<usize>() * 2);
    for ((d, arg), size) in instrs.iter().zip(&args).zip(&sizes) {
        let padding = op::padding_slots(d.opcode);
        let prefixes = size - 1 - padding;
        let bytes = arg.to_be_bytes();
        for byte in &bytes[3 - prefixes..3] {
            code.extend([EXTENDED_ARG, *byte]);
        }
        code.extend([d.opcode, bytes[3]]);
        code.extend(std::iter::repeat_n(0u8, padding * 2));
    }

    debug!(units = code.len() / 2, rounds, "encoded code");
    Ok(code)
}
