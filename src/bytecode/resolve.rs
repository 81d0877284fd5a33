use std::ops::Range;

use tracing::debug;

use crate::bytecode::block::{Block, Operand};
use crate::bytecode::compile_error::{CompileError, Result};
use crate::bytecode::op::{self, LOAD_GLOBAL, MAKE_CELL};
use crate::lang::value::Literal;

/// An instruction whose operand is a final slot index or raw value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawInstruction {
    pub opcode: u8,
    pub arg: u32,
}

/// A function or program body after name and constant resolution.
///
/// This is a different type from [`Block`]: it can be assembled, but there
/// is no way to feed it back through [`resolve`].
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedBlock {
    pub instructions: Vec<RawInstruction>,
    pub max_height: i32,
    pub arg_count: usize,
    pub consts: Vec<Literal>,
    pub names: Vec<String>,
    /// Arguments, then captured names, then every other local in first-use order.
    pub locals: Vec<String>,
    /// Slots of `locals` that hold captured cells.
    pub cells: Range<usize>,
    /// Local slots this body turns into cells for a nested closure.
    pub made_cells: Vec<usize>,
}

/// Append-only pools keyed by equality.
#[derive(Debug, Default)]
struct Tables {
    consts: Vec<Literal>,
    names: Vec<String>,
    locals: Vec<String>,
}

fn intern<T: PartialEq>(pool: &mut Vec<T>, value: T) -> usize {
    match pool.iter().position(|v| *v == value) {
        Some(idx) => idx,
        None => {
            pool.push(value);
            pool.len() - 1
        }
    }
}

/// `idx` as an operand, optionally shifted left by one with `low_bit` in bit 0.
fn slot_arg(idx: usize, shifted: bool, low_bit: bool) -> Result<u32> {
    let too_wide = || CompileError::OperandTooWide { value: idx };
    let slot = u32::try_from(idx).map_err(|_| too_wide())?;
    if !shifted {
        return Ok(slot);
    }
    slot.checked_mul(2)
        .map(|s| s | u32::from(low_bit))
        .ok_or_else(too_wide)
}

/// Give every symbolic operand in `block` its final slot.
///
/// Locals are seeded with the block's arguments followed by its captured
/// names, so parameters occupy the first slots and captures the ones right
/// after. Loads and stores that land in the capture range switch to their
/// cell variants. Function-style loads encode their slot as `(idx << 1) | 1`.
/// A global load always carries its name index in the upper bits, since the
/// interpreter reads bit 0 of that operand as the push-null flag.
pub fn resolve(block: Block) -> Result<ResolvedBlock> {
    let Block {
        instructions,
        max_height,
        args,
        cells,
        ..
    } = block;

    let arg_count = args.len();
    let cell_range = arg_count..arg_count + cells.len();
    let mut tables = Tables {
        locals: args.into_iter().chain(cells).collect(),
        ..Tables::default()
    };

    let mut resolved = Vec::with_capacity(instructions.len());
    let mut made_cells = Vec::new();

    for instr in instructions {
        let (opcode, arg) = match instr.operand {
            Operand::Raw(arg) => (instr.opcode, arg),
            Operand::Var(var) if var.local => {
                let idx = intern(&mut tables.locals, var.name);
                if instr.opcode == MAKE_CELL {
                    made_cells.push(idx);
                }
                let opcode = if cell_range.contains(&idx) {
                    op::cell_variant(instr.opcode)
                } else {
                    instr.opcode
                };
                (opcode, slot_arg(idx, var.func, true)?)
            }
            Operand::Var(var) => {
                let idx = intern(&mut tables.names, var.name);
                let shifted = var.func || instr.opcode == LOAD_GLOBAL;
                (instr.opcode, slot_arg(idx, shifted, var.func)?)
            }
            Operand::Const(value) => {
                let idx = intern(&mut tables.consts, value);
                (instr.opcode, slot_arg(idx, false, false)?)
            }
        };
        resolved.push(RawInstruction { opcode, arg });
    }

    debug!(
        consts = tables.consts.len(),
        names = tables.names.len(),
        locals = tables.locals.len(),
        cells = cell_range.len(),
        "resolved block"
    );

    Ok(ResolvedBlock {
        instructions: resolved,
        max_height,
        arg_count,
        consts: tables.consts,
        names: tables.names,
        locals: tables.locals,
        cells: cell_range,
        made_cells,
    })
}
