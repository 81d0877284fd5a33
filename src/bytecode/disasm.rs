use std::fmt::{self, Write};

use crate::bytecode::compile_error::{CompileError, Result};
use crate::bytecode::ir::{CodeObject, Decoded};
use crate::bytecode::op::{
    self, BINARY_OP, COMPARE_OP, CONTAINS_OP, DELETE_DEREF, DELETE_FAST, IS_OP, LOAD_CONST,
    LOAD_DEREF, LOAD_FAST, LOAD_GLOBAL, MAKE_CELL, SET_FUNCTION_ATTRIBUTE, STORE_DEREF,
    STORE_FAST, STORE_GLOBAL,
};
use crate::lang::node::{BinaryOperator, Comparison};

/// Print disassembly of a code object and every function nested in it.
pub fn print_code(code: &CodeObject) -> Result<()> {
    print!("{}", disassemble_to_string(code)?);
    Ok(())
}

/// Return disassembly as a String
pub fn disassemble_to_string(code: &CodeObject) -> Result<String> {
    let mut out = String::new();
    write_code(&mut out, code, 0)?;
    Ok(out)
}

fn write_code(out: &mut String, code: &CodeObject, indent: usize) -> Result<()> {
    let instrs = code.instructions()?;
    write_listing(out, code, &instrs, indent)
        .map_err(|_| CompileError::internal("failed to format disassembly"))?;

    for inner in code.nested() {
        write_code(out, inner, indent + 1)?;
    }
    Ok(())
}

fn write_listing(
    out: &mut String,
    code: &CodeObject,
    instrs: &[Decoded],
    indent: usize,
) -> fmt::Result {
    let prefix = "  ".repeat(indent);

    writeln!(out, "{}════════════════════════════════════════", prefix)?;
    writeln!(out, "{} {}  ({})", prefix, code.qualname, code.filename)?;
    writeln!(
        out,
        "{} args {}, locals {}, stack {}, flags {:#x}",
        prefix, code.argcount, code.nlocals, code.stacksize, code.flags
    )?;
    writeln!(
        out,
        "{} {} instructions, {} units",
        prefix,
        instrs.len(),
        code.code.len() / 2
    )?;
    writeln!(out, "{}════════════════════════════════════════", prefix)?;

    let targets: Vec<usize> = instrs.iter().filter_map(Decoded::jump_target).collect();
    for instr in instrs {
        let marked = targets.contains(&instr.offset);
        if marked {
            writeln!(out, "{}      ┌──────────────────────────────────", prefix)?;
        }
        writeln!(
            out,
            "{}{:04} {}{:<22} {}",
            prefix,
            instr.offset,
            if marked { "► " } else { "  " },
            op::name(instr.opcode),
            describe_arg(code, instr)
        )?;
    }
    writeln!(out)
}

fn lookup<T: ToString>(pool: &[T], idx: u32) -> String {
    usize::try_from(idx)
        .ok()
        .and_then(|i| pool.get(i))
        .map(|v| v.to_string())
        .unwrap_or_else(|| "<out of range>".to_string())
}

fn describe_arg(code: &CodeObject, instr: &Decoded) -> String {
    let arg = instr.arg;
    let annotation = match instr.opcode {
        LOAD_CONST => lookup(&code.consts, arg),
        LOAD_GLOBAL if arg & 1 == 1 => format!("NULL + {}", lookup(&code.names, arg >> 1)),
        LOAD_GLOBAL => lookup(&code.names, arg >> 1),
        STORE_GLOBAL => lookup(&code.names, arg),
        LOAD_FAST | STORE_FAST | DELETE_FAST | LOAD_DEREF | STORE_DEREF | DELETE_DEREF
        | MAKE_CELL => lookup(&code.localsplusnames, arg),
        BINARY_OP => match BinaryOperator::from_code(arg) {
            Some((op, true)) => format!("{}=", op.symbol()),
            Some((op, false)) => op.symbol().to_string(),
            None => String::new(),
        },
        COMPARE_OP => match Comparison::from_code(arg) {
            Some((op, true)) => format!("bool({})", op.symbol()),
            Some((op, false)) => op.symbol().to_string(),
            None => String::new(),
        },
        IS_OP if arg == 1 => "is not".to_string(),
        IS_OP => "is".to_string(),
        CONTAINS_OP if arg == 1 => "not in".to_string(),
        CONTAINS_OP => "in".to_string(),
        SET_FUNCTION_ATTRIBUTE if arg == op::FUNCTION_ATTR_CLOSURE => "closure".to_string(),
        _ => match instr.jump_target() {
            Some(target) => {
                let direction = if op::is_backward_jump(instr.opcode) { "↑" } else { "↓" };
                format!("{} (→ {:04})", direction, target)
            }
            None => String::new(),
        },
    };

    if annotation.is_empty() {
        format!("{}", arg)
    } else {
        format!("{:<4} ({})", arg, annotation)
    }
}
