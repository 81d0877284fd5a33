use serde::{Deserialize, Serialize};

use crate::bytecode::compile_error::{CompileError, Result};
use crate::bytecode::op::{self, CACHE, EXTENDED_ARG, JUMP_FORWARD, LOAD_CONST, POP_TOP, RETURN_VALUE};
use crate::lang::value::Literal;

/// A name reference that has not been given a slot yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Variable {
    pub name: String,
    /// Local slot (otherwise a global name).
    pub local: bool,
    /// Loaded in call position, with a receiver slot pushed alongside.
    pub func: bool,
}

impl Variable {
    pub fn local(name: impl Into<String>) -> Self {
        Variable {
            name: name.into(),
            local: true,
            func: false,
        }
    }

    pub fn global(name: impl Into<String>, func: bool) -> Self {
        Variable {
            name: name.into(),
            local: false,
            func,
        }
    }
}

/// An instruction operand before name/constant resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Operand {
    Raw(u32),
    Var(Variable),
    Const(Literal),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instruction {
    pub opcode: u8,
    pub operand: Operand,
}

impl Instruction {
    pub fn raw(opcode: u8, arg: u32) -> Self {
        Instruction {
            opcode,
            operand: Operand::Raw(arg),
        }
    }

    fn cache() -> Self {
        Instruction::raw(CACHE, 0)
    }
}

/// A composable fragment of stack-machine code.
///
/// Alongside the instructions a block tracks its stack shape, measured as if
/// it were entered with an empty stack:
///
/// - `height`: net change in stack size from entry to exit
/// - `depth`: lowest level reached relative to entry (never above 0)
/// - `max_height`: highest level reached, used to size the frame
///
/// Padding slots are real instructions here: every unit in `instructions`
/// is one code unit of the final encoding, and jump offsets count them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub instructions: Vec<Instruction>,
    pub height: i32,
    pub depth: i32,
    pub max_height: i32,
    /// Parameter names; non-empty only for a complete function body.
    pub args: Vec<String>,
    /// Captured names, in closure order.
    pub cells: Vec<String>,
}

impl Block {
    /// The no-op block, identity of [`Block::then`].
    pub fn empty() -> Self {
        Block {
            instructions: Vec::new(),
            height: 0,
            depth: 0,
            max_height: 0,
            args: Vec::new(),
            cells: Vec::new(),
        }
    }

    /// Length in code units.
    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    pub fn is_function(&self) -> bool {
        !self.args.is_empty()
    }

    /// A single instruction followed by its padding slots.
    ///
    /// Symbolic operands are measured as they will resolve: a variable counts
    /// as its call-position bit, so a global loaded for a call is two slots
    /// tall; a constant counts as operand 0.
    pub fn from_instruction(opcode: u8, operand: Operand) -> Result<Self> {
        let info = op::info(opcode);
        let measured = match &operand {
            Operand::Raw(arg) => *arg,
            Operand::Var(var) => u32::from(var.func),
            Operand::Const(_) => 0,
        };
        let height = info.height(measured)?;
        let depth = info.depth(measured)?;

        let mut instructions = Vec::with_capacity(1 + usize::from(info.padding));
        instructions.push(Instruction { opcode, operand });
        instructions.extend(std::iter::repeat_n(Instruction::cache(), usize::from(info.padding)));

        Ok(Block {
            instructions,
            height,
            depth,
            max_height: height.max(0),
            args: Vec::new(),
            cells: Vec::new(),
        })
    }

    pub fn raw(opcode: u8, arg: u32) -> Result<Self> {
        Block::from_instruction(opcode, Operand::Raw(arg))
    }

    /// Sequential composition: `self` runs, then `other`.
    pub fn then(self, other: Block) -> Result<Block> {
        reject_function(&self)?;
        reject_function(&other)?;

        let mut instructions = self.instructions;
        instructions.extend(other.instructions);

        Ok(Block {
            instructions,
            height: self.height + other.height,
            depth: self.depth.min(self.height + other.depth),
            max_height: self.max_height.max(self.height + other.max_height),
            args: Vec::new(),
            cells: Vec::new(),
        })
    }

    /// Build a two-way diamond around a one-instruction conditional jump.
    ///
    /// Layout is `header, other, chosen`: when the jump is taken it skips
    /// `other` and lands on `chosen`. With `needs_skip`, `other` ends in an
    /// unconditional jump over `chosen`, so exactly one arm runs before the
    /// paths merge.
    pub fn construct_conditional(
        header: Block,
        chosen: Block,
        other: Block,
        needs_skip: bool,
    ) -> Result<Block> {
        reject_function(&header)?;
        reject_function(&chosen)?;
        reject_function(&other)?;

        if chosen.height != other.height {
            return Err(CompileError::BranchHeightMismatch {
                chosen: chosen.height,
                other: other.height,
            });
        }

        let other = if needs_skip {
            other.then(Block::jump_forward(chosen.len())?)?
        } else {
            other
        };
        let header = header.with_jump_offset(other.len())?;

        let base = header.height;
        let height = base + chosen.height;
        let depth = header
            .depth
            .min(base + other.depth)
            .min(base + chosen.depth);
        let max_height = header
            .max_height
            .max(base + other.max_height)
            .max(base + chosen.max_height);

        let mut instructions = header.instructions;
        instructions.extend(other.instructions);
        instructions.extend(chosen.instructions);

        Ok(Block {
            instructions,
            height,
            depth,
            max_height,
            args: Vec::new(),
            cells: Vec::new(),
        })
    }

    /// An unconditional forward jump over `units` code units.
    pub fn jump_forward(units: usize) -> Result<Block> {
        Block::raw(JUMP_FORWARD, 0)?.with_jump_offset(units)
    }

    /// Drop whatever this block leaves on the stack.
    ///
    /// The result always has height 0. A block that already consumed more
    /// than it pushed gets no pops; its shortfall is folded into the depth.
    pub fn pop_extraneous(self) -> Result<Block> {
        let shortfall = self.height.min(0);
        let extra = self.height.max(0);
        let mut block = (0..extra).try_fold(self, |block, _| block.then(Block::raw(POP_TOP, 0)?))?;
        block.height = 0;
        block.depth = block.depth.saturating_add(shortfall);
        Ok(block)
    }

    /// `return None`, appended as a safety tail to top-level programs.
    pub fn early_return() -> Result<Block> {
        Block::from_instruction(LOAD_CONST, Operand::Const(Literal::None))?
            .then(Block::raw(RETURN_VALUE, 0)?)
    }

    /// Set the operand of the block's last real instruction, widening it with
    /// extension prefixes when it does not fit in one byte.
    ///
    /// Only this instruction grows, so offsets already measured across other
    /// blocks stay valid.
    pub fn with_jump_offset(mut self, units: usize) -> Result<Block> {
        let value = u32::try_from(units).map_err(|_| CompileError::OperandTooWide { value: units })?;
        let pos = self
            .instructions
            .iter()
            .rposition(|i| i.opcode != CACHE)
            .ok_or_else(|| CompileError::internal("jump header has no instruction to patch"))?;

        let opcode = self.instructions[pos].opcode;
        self.instructions.truncate(pos);
        self.instructions.extend(widened(opcode, value));
        Ok(self)
    }
}

fn reject_function(block: &Block) -> Result<()> {
    if block.is_function() {
        return Err(CompileError::FunctionBodyConcat {
            args: block.args.clone(),
        });
    }
    Ok(())
}

// =============================================================================
// Operand extension
// =============================================================================

/// Split an operand into its extension prefix bytes and the low byte.
///
/// Bytes are big-endian with leading zeros dropped; each prefix byte becomes
/// one `EXTENDED_ARG` ahead of the instruction.
pub fn split_operand(value: u32) -> (Vec<u8>, u8) {
    let bytes = value.to_be_bytes();
    let (high, low) = bytes.split_at(3);
    let first = high.iter().position(|b| *b != 0).unwrap_or(high.len());
    (high[first..].to_vec(), low[0])
}

/// Inverse of [`split_operand`].
pub fn join_operand(prefix: &[u8], low: u8) -> u32 {
    prefix
        .iter()
        .chain(std::iter::once(&low))
        .fold(0u32, |acc, b| (acc << 8) | u32::from(*b))
}

/// `opcode` with a full-width operand: prefixes, the instruction, its padding.
pub fn widened(opcode: u8, value: u32) -> Vec<Instruction> {
    let (prefix, low) = split_operand(value);
    let padding = op::padding_slots(opcode);

    let mut out = Vec::with_capacity(prefix.len() + 1 + padding);
    out.extend(prefix.into_iter().map(|b| Instruction::raw(EXTENDED_ARG, u32::from(b))));
    out.push(Instruction::raw(opcode, u32::from(low)));
    out.extend(std::iter::repeat_n(Instruction::cache(), padding));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::op::{
        BINARY_OP, BUILD_TUPLE, CALL, LOAD_FAST, LOAD_GLOBAL, LOAD_SMALL_INT, NOP,
        POP_JUMP_IF_FALSE,
    };
    use proptest::prelude::*;

    fn push(n: u32) -> Block {
        Block::raw(LOAD_SMALL_INT, n).unwrap()
    }

    fn seq(blocks: Vec<Block>) -> Block {
        blocks
            .into_iter()
            .try_fold(Block::empty(), Block::then)
            .unwrap()
    }

    #[test]
    fn test_from_instruction_shape() {
        let b = push(5);
        assert_eq!(b.len(), 1);
        assert_eq!((b.height, b.depth, b.max_height), (1, 0, 1));

        let add = Block::raw(BINARY_OP, 0).unwrap();
        assert_eq!(add.len(), 2); // one padding slot
        assert_eq!((add.height, add.depth, add.max_height), (-1, -2, 0));
    }

    #[test]
    fn test_from_instruction_variable_heights() {
        let plain = Block::from_instruction(LOAD_GLOBAL, Operand::Var(Variable::global("f", false)))
            .unwrap();
        assert_eq!(plain.height, 1);
        assert_eq!(plain.len(), 5);

        let callee = Block::from_instruction(LOAD_GLOBAL, Operand::Var(Variable::global("f", true)))
            .unwrap();
        assert_eq!(callee.height, 2);
        assert_eq!(callee.max_height, 2);

        let local = Block::from_instruction(LOAD_FAST, Operand::Var(Variable::local("x"))).unwrap();
        assert_eq!(local.height, 1);
    }

    #[test]
    fn test_unsupported_instruction_is_rejected() {
        assert!(matches!(
            Block::raw(20, 0),
            Err(CompileError::UnsupportedInstruction { .. })
        ));
    }

    #[test]
    fn test_then_combines_metrics() {
        let b = seq(vec![push(1), push(2), Block::raw(BINARY_OP, 0).unwrap()]);
        assert_eq!(b.height, 1);
        assert_eq!(b.depth, 0);
        assert_eq!(b.max_height, 2);

        // a lone pop reads below its entry point
        let pop = Block::empty().then(Block::raw(POP_TOP, 0).unwrap()).unwrap();
        assert_eq!((pop.height, pop.depth, pop.max_height), (-1, -1, 0));
    }

    #[test]
    fn test_then_rejects_function_bodies() {
        let mut body = push(1);
        body.args = vec!["x".to_string()];

        assert!(matches!(
            body.clone().then(Block::empty()),
            Err(CompileError::FunctionBodyConcat { .. })
        ));
        assert!(Block::empty().then(body).is_err());
    }

    #[test]
    fn test_conditional_layout() {
        let header = Block::raw(POP_JUMP_IF_FALSE, 0).unwrap();
        let then = push(10);
        let otherwise = push(20);

        let b = Block::construct_conditional(header, otherwise, then, true).unwrap();
        let ops: Vec<(u8, Operand)> = b
            .instructions
            .iter()
            .map(|i| (i.opcode, i.operand.clone()))
            .collect();

        // jump over [LOAD 10, JUMP_FORWARD] and land on LOAD 20
        assert_eq!(ops[0], (POP_JUMP_IF_FALSE, Operand::Raw(2)));
        assert_eq!(ops[1], (CACHE, Operand::Raw(0)));
        assert_eq!(ops[2], (LOAD_SMALL_INT, Operand::Raw(10)));
        assert_eq!(ops[3], (JUMP_FORWARD, Operand::Raw(1)));
        assert_eq!(ops[4], (LOAD_SMALL_INT, Operand::Raw(20)));
        assert_eq!(b.height, 0);
        assert_eq!(b.depth, -1);
    }

    #[test]
    fn test_conditional_rejects_unequal_heights() {
        let header = Block::raw(POP_JUMP_IF_FALSE, 0).unwrap();
        let err = Block::construct_conditional(header, push(1), Block::empty(), true).unwrap_err();
        assert!(matches!(
            err,
            CompileError::BranchHeightMismatch {
                chosen: 1,
                other: 0
            }
        ));
    }

    #[test]
    fn test_long_branch_widens_header_only() {
        let header = Block::raw(POP_JUMP_IF_FALSE, 0).unwrap();
        let long = seq((0..300).map(|_| Block::raw(NOP, 0).unwrap()).collect());
        let other_len = long.len() + 1; // plus the skip jump

        let b = Block::construct_conditional(header, Block::empty(), long, true).unwrap();
        assert_eq!(b.instructions[0], Instruction::raw(EXTENDED_ARG, 1));
        assert_eq!(
            b.instructions[1],
            Instruction::raw(POP_JUMP_IF_FALSE, (other_len & 0xff) as u32)
        );
        assert_eq!(b.len(), 3 + other_len);
    }

    #[test]
    fn test_pop_extraneous() {
        let b = seq(vec![push(1), push(2)]).pop_extraneous().unwrap();
        assert_eq!(b.height, 0);
        assert_eq!(b.depth, 0);
        assert_eq!(b.max_height, 2);
        assert_eq!(b.len(), 4);
        assert!(b.instructions[2..].iter().all(|i| i.opcode == POP_TOP));
    }

    #[test]
    fn test_pop_extraneous_after_net_pop() {
        let pop = Block::raw(POP_TOP, 0).unwrap();
        let b = pop.clone().pop_extraneous().unwrap();
        assert_eq!(b.height, 0);
        assert_eq!(b.depth, -2);
        assert_eq!(b.instructions, pop.instructions);
    }

    #[test]
    fn test_early_return() {
        let b = Block::early_return().unwrap();
        assert_eq!(b.len(), 2);
        assert_eq!(b.instructions[0].operand, Operand::Const(Literal::None));
        assert_eq!(b.instructions[1].opcode, RETURN_VALUE);
        assert_eq!(b.depth, 0);
    }

    #[test]
    fn test_operand_extension_cases() {
        assert_eq!(split_operand(0), (vec![], 0));
        assert_eq!(split_operand(255), (vec![], 255));
        assert_eq!(split_operand(256), (vec![1], 0));
        assert_eq!(split_operand(65535), (vec![255], 255));
        assert_eq!(split_operand(0x1000000), (vec![1, 0, 0], 0));

        for v in [0, 255, 256, 65535, 0x1000000] {
            let (prefix, low) = split_operand(v);
            assert_eq!(join_operand(&prefix, low), v);
        }
    }

    #[test]
    fn test_widened_call_keeps_padding() {
        let units = widened(CALL, 300);
        assert_eq!(units.len(), 1 + 1 + 3);
        assert_eq!(units[0], Instruction::raw(EXTENDED_ARG, 1));
        assert_eq!(units[1], Instruction::raw(CALL, 44));
    }

    fn arb_block() -> impl Strategy<Value = Block> {
        let unit = prop_oneof![
            (0u32..=255).prop_map(|n| (LOAD_SMALL_INT, n)),
            Just((POP_TOP, 0u32)),
            Just((BINARY_OP, 0u32)),
            Just((RETURN_VALUE, 0u32)),
            (0u32..4).prop_map(|n| (CALL, n)),
            (0u32..4).prop_map(|n| (BUILD_TUPLE, n)),
            Just((NOP, 0u32)),
        ];
        prop::collection::vec(unit, 0..8).prop_map(|units| {
            seq(units
                .into_iter()
                .map(|(opcode, arg)| Block::raw(opcode, arg).unwrap())
                .collect())
        })
    }

    proptest! {
        #[test]
        fn prop_then_is_associative(a in arb_block(), b in arb_block(), c in arb_block()) {
            let left = a.clone().then(b.clone()).unwrap().then(c.clone()).unwrap();
            let right = a.then(b.then(c).unwrap()).unwrap();
            prop_assert_eq!(left, right);
        }

        #[test]
        fn prop_empty_is_identity(a in arb_block()) {
            prop_assert_eq!(Block::empty().then(a.clone()).unwrap(), a.clone());
            prop_assert_eq!(a.clone().then(Block::empty()).unwrap(), a);
        }

        #[test]
        fn prop_conditional_requires_equal_heights(a in arb_block(), b in arb_block()) {
            let header = Block::raw(POP_JUMP_IF_FALSE, 0).unwrap();
            let header_height = header.height;
            let result = Block::construct_conditional(header, a.clone(), b.clone(), true);
            if a.height == b.height {
                prop_assert_eq!(result.unwrap().height, header_height + a.height);
            } else {
                prop_assert!(result.is_err());
            }
        }

        #[test]
        fn prop_operand_round_trip(v in any::<u32>()) {
            let (prefix, low) = split_operand(v);
            prop_assert_eq!(join_operand(&prefix, low), v);
            let significant = (4 - v.leading_zeros() as usize / 8).max(1);
            prop_assert_eq!(prefix.len(), significant - 1);
        }
    }
}
