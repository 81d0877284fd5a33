use crate::bytecode::compile_error::{CompileError, Result};
use crate::bytecode::ir::{Decoded, decode};
use crate::bytecode::op::{self, RETURN_VALUE};

/// Where control can go after `instr`.
fn successors(instr: &Decoded) -> Result<Vec<usize>> {
    if instr.opcode == RETURN_VALUE {
        return Ok(Vec::new());
    }

    let mut next = Vec::with_capacity(2);
    let unconditional = op::is_backward_jump(instr.opcode)
        || (op::is_forward_jump(instr.opcode) && !op::is_conditional_jump(instr.opcode));
    if !unconditional {
        next.push(instr.next());
    }
    if instr.is_jump() {
        let target = instr.jump_target().ok_or_else(|| {
            CompileError::stack_check(format!(
                "{} at unit {} jumps before the start of the code",
                op::name(instr.opcode),
                instr.offset
            ))
        })?;
        next.push(target);
    }
    Ok(next)
}

/// Walk encoded code along fall-through and jump edges, starting from an
/// empty stack, and return the highest stack level reached.
///
/// Fails on underflow, on two paths reaching the same instruction with
/// different heights, on jumps into the middle of an instruction, and on
/// paths that run off the end of the code.
pub fn check_code(code: &[u8]) -> Result<i32> {
    let instrs = decode(code)?;
    if instrs.is_empty() {
        return Ok(0);
    }
    let end = code.len() / 2;

    let mut entry: Vec<Option<i32>> = vec![None; instrs.len()];
    entry[0] = Some(0);
    let mut work = vec![0usize];
    let mut peak = 0;

    while let Some(i) = work.pop() {
        let instr = &instrs[i];
        let h = entry[i].ok_or_else(|| CompileError::internal("unvisited instruction on worklist"))?;

        let depth = op::depth(instr.opcode, instr.arg)?;
        if h + depth < 0 {
            return Err(CompileError::stack_check(format!(
                "stack underflow at unit {}, {} reads {} values with {} available",
                instr.offset,
                op::name(instr.opcode),
                -depth,
                h
            )));
        }
        let after = h + op::height(instr.opcode, instr.arg)?;
        peak = peak.max(h).max(after);

        for unit in successors(instr)? {
            if unit >= end {
                return Err(CompileError::stack_check(format!(
                    "execution runs past the end of the code after unit {}",
                    instr.offset
                )));
            }
            let j = instrs
                .binary_search_by_key(&unit, |d| d.offset)
                .map_err(|_| {
                    CompileError::stack_check(format!("jump into the middle of an instruction at unit {}", unit))
                })?;

            match entry[j] {
                None => {
                    entry[j] = Some(after);
                    work.push(j);
                }
                Some(seen) if seen != after => {
                    return Err(CompileError::stack_check(format!(
                        "stack height mismatch at unit {}: {} on one path, {} on another",
                        unit, seen, after
                    )));
                }
                Some(_) => {}
            }
        }
    }

    Ok(peak)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::op::{
        BINARY_OP, CACHE, JUMP_FORWARD, LOAD_SMALL_INT, POP_JUMP_IF_FALSE, POP_TOP, RESUME,
    };

    fn code(units: &[(u8, u8)]) -> Vec<u8> {
        units.iter().flat_map(|&(o, a)| [o, a]).collect()
    }

    #[test]
    fn test_simple_ops() {
        let bytes = code(&[
            (RESUME, 0),
            (LOAD_SMALL_INT, 1),
            (LOAD_SMALL_INT, 2),
            (BINARY_OP, 0),
            (CACHE, 0),
            (RETURN_VALUE, 0),
        ]);
        assert_eq!(check_code(&bytes).unwrap(), 2);
    }

    #[test]
    fn test_underflow() {
        let bytes = code(&[(BINARY_OP, 0), (CACHE, 0), (RETURN_VALUE, 0)]);
        let err = check_code(&bytes).unwrap_err();
        assert!(err.to_string().contains("underflow"));
    }

    #[test]
    fn test_diamond_merges_cleanly() {
        let bytes = code(&[
            (LOAD_SMALL_INT, 1),
            (POP_JUMP_IF_FALSE, 2),
            (CACHE, 0),
            (LOAD_SMALL_INT, 10),
            (JUMP_FORWARD, 1),
            (LOAD_SMALL_INT, 20),
            (RETURN_VALUE, 0),
        ]);
        assert_eq!(check_code(&bytes).unwrap(), 1);
    }

    #[test]
    fn test_merge_height_mismatch() {
        // fall-through pushes an extra value before the join
        let bytes = code(&[
            (LOAD_SMALL_INT, 1),
            (POP_JUMP_IF_FALSE, 1),
            (CACHE, 0),
            (LOAD_SMALL_INT, 5),
            (LOAD_SMALL_INT, 6),
            (RETURN_VALUE, 0),
        ]);
        let err = check_code(&bytes).unwrap_err();
        assert!(err.to_string().contains("mismatch"));
    }

    #[test]
    fn test_falling_off_the_end() {
        let bytes = code(&[(LOAD_SMALL_INT, 1), (POP_TOP, 0)]);
        let err = check_code(&bytes).unwrap_err();
        assert!(err.to_string().contains("past the end"));
    }

    #[test]
    fn test_dead_code_after_return_is_ignored() {
        // the skip jump after a returning branch is never reached
        let bytes = code(&[(LOAD_SMALL_INT, 1), (RETURN_VALUE, 0), (JUMP_FORWARD, 9)]);
        assert_eq!(check_code(&bytes).unwrap(), 1);
    }

    #[test]
    fn test_unsupported_opcode_is_reported() {
        let bytes = code(&[(20, 0)]);
        assert!(matches!(
            check_code(&bytes),
            Err(CompileError::UnsupportedInstruction { .. })
        ));
    }
}
