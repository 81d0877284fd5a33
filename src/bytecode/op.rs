use std::sync::LazyLock;

use crate::bytecode::compile_error::{CompileError, Result};

// =============================================================================
// Opcodes - the target machine's fixed numbering
// =============================================================================

pub const CACHE: u8 = 0;
pub const NOP: u8 = 27;
pub const POP_TOP: u8 = 31;
pub const PUSH_NULL: u8 = 33;
pub const RETURN_VALUE: u8 = 35;
pub const TO_BOOL: u8 = 39;
pub const MAKE_FUNCTION: u8 = 23;
pub const BINARY_OP: u8 = 44;
pub const BUILD_TUPLE: u8 = 50;
pub const CALL: u8 = 51;
pub const COMPARE_OP: u8 = 56;
pub const CONTAINS_OP: u8 = 57;
pub const COPY_FREE_VARS: u8 = 60;
pub const DELETE_DEREF: u8 = 62;
pub const DELETE_FAST: u8 = 63;
pub const EXTENDED_ARG: u8 = 68;
pub const IS_OP: u8 = 73;
pub const JUMP_BACKWARD: u8 = 74;
pub const JUMP_BACKWARD_NO_INTERRUPT: u8 = 75;
pub const JUMP_FORWARD: u8 = 76;
pub const LOAD_CONST: u8 = 81;
pub const LOAD_DEREF: u8 = 82;
pub const LOAD_FAST: u8 = 83;
pub const LOAD_GLOBAL: u8 = 89;
pub const LOAD_SMALL_INT: u8 = 91;
pub const MAKE_CELL: u8 = 94;
pub const POP_JUMP_IF_FALSE: u8 = 97;
pub const POP_JUMP_IF_NONE: u8 = 98;
pub const POP_JUMP_IF_NOT_NONE: u8 = 99;
pub const POP_JUMP_IF_TRUE: u8 = 100;
pub const SET_FUNCTION_ATTRIBUTE: u8 = 105;
pub const STORE_DEREF: u8 = 108;
pub const STORE_FAST: u8 = 109;
pub const STORE_GLOBAL: u8 = 112;
pub const RESUME: u8 = 149;

/// `SET_FUNCTION_ATTRIBUTE` flag selecting the closure slot.
pub const FUNCTION_ATTR_CLOSURE: u32 = 0x08;

// =============================================================================
// Stack effects
// =============================================================================

/// How an instruction changes the stack, either fixed or derived from its operand.
#[derive(Debug, Clone, Copy)]
pub enum Effect {
    Fixed(i32),
    Operand(fn(u32) -> i32),
    /// Outside the modelled subset; the compiler never selects these.
    Unsupported,
}

impl Effect {
    pub fn is_fixed(&self) -> bool {
        matches!(self, Effect::Fixed(_))
    }

    fn eval(&self, operand: u32) -> Option<i32> {
        match self {
            Effect::Fixed(n) => Some(*n),
            Effect::Operand(f) => Some(f(operand)),
            Effect::Unsupported => None,
        }
    }
}

/// Static metadata for one opcode.
#[derive(Debug, Clone)]
pub struct InstrInfo {
    pub name: &'static str,
    pub opcode: u8,
    /// Net change in stack size.
    pub height: Effect,
    /// Lowest level touched below the entry level.
    pub depth: Effect,
    /// Zero-filled slots that follow the instruction in the code string.
    pub padding: u8,
}

impl InstrInfo {
    pub fn height(&self, operand: u32) -> Result<i32> {
        self.height.eval(operand).ok_or_else(|| self.unsupported())
    }

    pub fn depth(&self, operand: u32) -> Result<i32> {
        self.depth.eval(operand).ok_or_else(|| self.unsupported())
    }

    pub fn is_supported(&self) -> bool {
        !matches!(self.height, Effect::Unsupported)
    }

    fn unsupported(&self) -> CompileError {
        CompileError::UnsupportedInstruction {
            opcode: self.opcode,
            name: self.name,
        }
    }
}

/// Number of opcode slots in the table.
pub const TABLE_SIZE: usize = 239;

const FIRST_GAP: u8 = 118;

fn signed(i: u32) -> i32 {
    i32::try_from(i).unwrap_or(i32::MAX)
}

/// Removing `i` operand-counted slots and `extra` fixed ones, saturating at `i32::MIN`.
fn pops(i: u32, extra: i32) -> i32 {
    (-signed(i)).saturating_sub(extra)
}

static TABLE: LazyLock<Vec<InstrInfo>> = LazyLock::new(|| {
    use Effect::{Fixed, Operand, Unsupported};

    let named: Vec<(&'static str, Effect, Effect)> = vec![
        ("CACHE", Fixed(0), Fixed(0)),
        ("BINARY_SLICE", Fixed(-2), Fixed(-3)),
        ("BINARY_SUBSCR", Fixed(-1), Fixed(-2)),
        ("<3>", Unsupported, Unsupported),
        ("CHECK_EG_MATCH", Unsupported, Unsupported),
        ("CHECK_EXC_MATCH", Unsupported, Unsupported),
        ("CLEANUP_THROW", Unsupported, Unsupported),
        ("DELETE_SUBSCR", Fixed(-2), Fixed(-2)),
        ("END_ASYNC_FOR", Unsupported, Unsupported),
        ("END_FOR", Unsupported, Unsupported),
        ("END_SEND", Unsupported, Unsupported),
        ("EXIT_INIT_CHECK", Unsupported, Unsupported),
        ("FORMAT_SIMPLE", Fixed(0), Fixed(-1)),
        ("FORMAT_WITH_SPEC", Fixed(-1), Fixed(-2)),
        ("GET_AITER", Unsupported, Unsupported),
        ("GET_ANEXT", Unsupported, Unsupported),
        ("GET_ITER", Unsupported, Unsupported),
        ("RESERVED", Unsupported, Unsupported),
        ("GET_LEN", Unsupported, Unsupported),
        ("GET_YIELD_FROM_ITER", Unsupported, Unsupported),
        ("INTERPRETER_EXIT", Unsupported, Unsupported),
        ("LOAD_BUILD_CLASS", Unsupported, Unsupported),
        ("LOAD_LOCALS", Unsupported, Unsupported),
        ("MAKE_FUNCTION", Fixed(0), Fixed(-1)),
        ("MATCH_KEYS", Unsupported, Unsupported),
        ("MATCH_MAPPING", Unsupported, Unsupported),
        ("MATCH_SEQUENCE", Unsupported, Unsupported),
        ("NOP", Fixed(0), Fixed(0)),
        ("NOT_TAKEN", Fixed(0), Fixed(0)),
        ("POP_EXCEPT", Unsupported, Unsupported),
        ("POP_ITER", Unsupported, Unsupported),
        ("POP_TOP", Fixed(-1), Fixed(-1)),
        ("PUSH_EXC_INFO", Unsupported, Unsupported),
        ("PUSH_NULL", Fixed(1), Fixed(0)),
        ("RETURN_GENERATOR", Unsupported, Unsupported),
        // stack-wise this is STACK.append(STACK.pop()) before the frame exits
        ("RETURN_VALUE", Fixed(0), Fixed(-1)),
        ("SETUP_ANNOTATIONS", Unsupported, Unsupported),
        ("STORE_SLICE", Fixed(-4), Fixed(-4)),
        ("STORE_SUBSCR", Fixed(-3), Fixed(-3)),
        ("TO_BOOL", Fixed(0), Fixed(-1)),
        ("UNARY_INVERT", Fixed(0), Fixed(-1)),
        ("UNARY_NEGATIVE", Fixed(0), Fixed(-1)),
        ("UNARY_NOT", Fixed(0), Fixed(-1)),
        ("WITH_EXCEPT_START", Unsupported, Unsupported),
        ("BINARY_OP", Fixed(-1), Fixed(-2)),
        ("BUILD_LIST", Operand(|i| 1 - signed(i)), Operand(|i| -signed(i))),
        (
            "BUILD_MAP",
            Operand(|i| 1 - signed(i).saturating_mul(2)),
            Operand(|i| pops(i, 0).saturating_mul(2)),
        ),
        ("BUILD_SET", Operand(|i| 1 - signed(i)), Operand(|i| -signed(i))),
        ("BUILD_SLICE", Operand(|i| 1 - signed(i)), Operand(|i| -signed(i))),
        ("BUILD_STRING", Operand(|i| 1 - signed(i)), Operand(|i| -signed(i))),
        ("BUILD_TUPLE", Operand(|i| 1 - signed(i)), Operand(|i| -signed(i))),
        ("CALL", Operand(|i| pops(i, 1)), Operand(|i| pops(i, 2))),
        ("CALL_FUNCTION_EX", Unsupported, Unsupported),
        ("CALL_INTRINSIC_1", Fixed(0), Fixed(-1)),
        ("CALL_INTRINSIC_2", Fixed(-1), Fixed(-2)),
        ("CALL_KW", Operand(|i| pops(i, 2)), Operand(|i| pops(i, 3))),
        ("COMPARE_OP", Fixed(-1), Fixed(-2)),
        ("CONTAINS_OP", Fixed(-1), Fixed(-2)),
        ("CONVERT_VALUE", Fixed(0), Fixed(-1)),
        ("COPY", Fixed(1), Operand(|i| -signed(i))),
        ("COPY_FREE_VARS", Fixed(0), Fixed(0)),
        ("DELETE_ATTR", Fixed(-1), Fixed(-1)),
        ("DELETE_DEREF", Fixed(0), Fixed(0)),
        ("DELETE_FAST", Fixed(0), Fixed(0)),
        ("DELETE_GLOBAL", Fixed(0), Fixed(0)),
        ("DELETE_NAME", Fixed(0), Fixed(0)),
        ("DICT_MERGE", Fixed(-1), Operand(|i| pops(i, 1))),
        ("DICT_UPDATE", Fixed(-1), Operand(|i| pops(i, 1))),
        ("EXTENDED_ARG", Fixed(0), Fixed(0)),
        ("FOR_ITER", Unsupported, Unsupported),
        ("GET_AWAITABLE", Unsupported, Unsupported),
        ("IMPORT_FROM", Unsupported, Unsupported),
        ("IMPORT_NAME", Unsupported, Unsupported),
        ("IS_OP", Fixed(-1), Fixed(-2)),
        ("JUMP_BACKWARD", Fixed(0), Fixed(0)),
        ("JUMP_BACKWARD_NO_INTERRUPT", Fixed(0), Fixed(0)),
        ("JUMP_FORWARD", Fixed(0), Fixed(0)),
        ("LIST_APPEND", Fixed(-1), Operand(|i| pops(i, 1))),
        ("LIST_EXTEND", Fixed(-1), Operand(|i| pops(i, 1))),
        ("LOAD_ATTR", Operand(|i| (i & 1) as i32), Fixed(-1)),
        ("LOAD_COMMON_CONSTANT", Fixed(1), Fixed(0)),
        ("LOAD_CONST", Fixed(1), Fixed(0)),
        ("LOAD_DEREF", Fixed(1), Fixed(0)),
        ("LOAD_FAST", Fixed(1), Fixed(0)),
        ("LOAD_FAST_AND_CLEAR", Fixed(1), Fixed(0)),
        ("LOAD_FAST_CHECK", Fixed(1), Fixed(0)),
        ("LOAD_FAST_LOAD_FAST", Fixed(2), Fixed(0)),
        ("LOAD_FROM_DICT_OR_DEREF", Fixed(0), Fixed(-1)),
        ("LOAD_FROM_DICT_OR_GLOBALS", Fixed(0), Fixed(-1)),
        // the low operand bit pushes a NULL receiver slot as well
        ("LOAD_GLOBAL", Operand(|i| 1 + (i & 1) as i32), Fixed(0)),
        ("LOAD_NAME", Fixed(1), Fixed(0)),
        ("LOAD_SMALL_INT", Fixed(1), Fixed(0)),
        ("LOAD_SPECIAL", Unsupported, Unsupported),
        ("LOAD_SUPER_ATTR", Unsupported, Unsupported),
        ("MAKE_CELL", Fixed(0), Fixed(0)),
        ("MAP_ADD", Fixed(-2), Operand(|i| pops(i, 2))),
        ("MATCH_CLASS", Unsupported, Unsupported),
        ("POP_JUMP_IF_FALSE", Fixed(-1), Fixed(-1)),
        ("POP_JUMP_IF_NONE", Fixed(-1), Fixed(-1)),
        ("POP_JUMP_IF_NOT_NONE", Fixed(-1), Fixed(-1)),
        ("POP_JUMP_IF_TRUE", Fixed(-1), Fixed(-1)),
        ("RAISE_VARARGS", Unsupported, Unsupported),
        ("RERAISE", Unsupported, Unsupported),
        ("SEND", Unsupported, Unsupported),
        ("SET_ADD", Fixed(-1), Operand(|i| pops(i, 1))),
        ("SET_FUNCTION_ATTRIBUTE", Fixed(-1), Fixed(-2)),
        ("SET_UPDATE", Fixed(-1), Operand(|i| pops(i, 1))),
        ("STORE_ATTR", Fixed(-2), Fixed(-2)),
        ("STORE_DEREF", Fixed(-1), Fixed(-1)),
        ("STORE_FAST", Fixed(-1), Fixed(-1)),
        ("STORE_FAST_LOAD_FAST", Fixed(0), Fixed(-1)),
        ("STORE_FAST_STORE_FAST", Fixed(-2), Fixed(-2)),
        ("STORE_GLOBAL", Fixed(-1), Fixed(-1)),
        ("STORE_NAME", Fixed(-1), Fixed(-1)),
        ("SWAP", Fixed(0), Operand(|i| -signed(i))),
        ("UNPACK_EX", Unsupported, Unsupported),
        ("UNPACK_SEQUENCE", Operand(|i| signed(i) - 1), Fixed(-1)),
        ("YIELD_VALUE", Unsupported, Unsupported),
    ];
    debug_assert_eq!(named.len(), FIRST_GAP as usize);

    let mut table: Vec<InstrInfo> = named
        .into_iter()
        .zip(0u8..)
        .map(|((name, height, depth), opcode)| InstrInfo {
            name,
            opcode,
            height,
            depth,
            padding: padding_for(opcode),
        })
        .collect();

    for opcode in FIRST_GAP..TABLE_SIZE as u8 {
        let (name, height, depth) = if opcode == RESUME {
            ("RESUME", Fixed(0), Fixed(0))
        } else {
            ("<unassigned>", Unsupported, Unsupported)
        };
        table.push(InstrInfo {
            name,
            opcode,
            height,
            depth,
            padding: 0,
        });
    }

    table
});

fn padding_for(opcode: u8) -> u8 {
    match opcode {
        79 => 9,                    // LOAD_ATTR
        LOAD_GLOBAL | 107 => 4,     // STORE_ATTR
        CALL | 55 | TO_BOOL => 3,   // CALL_KW
        BINARY_OP | 2 | 38 => 1,    // BINARY_SUBSCR, STORE_SUBSCR
        COMPARE_OP | CONTAINS_OP => 1,
        116 | 69 | 103 | 93 => 1,   // UNPACK_SEQUENCE, FOR_ITER, SEND, LOAD_SUPER_ATTR
        JUMP_BACKWARD => 1,
        POP_JUMP_IF_FALSE | POP_JUMP_IF_NONE | POP_JUMP_IF_NOT_NONE | POP_JUMP_IF_TRUE => 1,
        _ => 0,
    }
}

/// Metadata for `opcode`.
pub fn info(opcode: u8) -> &'static InstrInfo {
    // every u8 below TABLE_SIZE is populated; the rest share the last placeholder
    &TABLE[usize::from(opcode).min(TABLE_SIZE - 1)]
}

pub fn height(opcode: u8, operand: u32) -> Result<i32> {
    info(opcode).height(operand)
}

pub fn depth(opcode: u8, operand: u32) -> Result<i32> {
    info(opcode).depth(operand)
}

pub fn padding_slots(opcode: u8) -> usize {
    usize::from(info(opcode).padding)
}

pub fn name(opcode: u8) -> &'static str {
    info(opcode).name
}

/// Relative jumps whose operand counts code units forward from the next instruction.
pub fn is_forward_jump(opcode: u8) -> bool {
    matches!(
        opcode,
        JUMP_FORWARD | POP_JUMP_IF_FALSE | POP_JUMP_IF_NONE | POP_JUMP_IF_NOT_NONE | POP_JUMP_IF_TRUE
    )
}

pub fn is_backward_jump(opcode: u8) -> bool {
    matches!(opcode, JUMP_BACKWARD | JUMP_BACKWARD_NO_INTERRUPT)
}

pub fn is_conditional_jump(opcode: u8) -> bool {
    matches!(
        opcode,
        POP_JUMP_IF_FALSE | POP_JUMP_IF_NONE | POP_JUMP_IF_NOT_NONE | POP_JUMP_IF_TRUE
    )
}

/// The cell-slot counterpart of a local-slot instruction.
pub fn cell_variant(opcode: u8) -> u8 {
    match opcode {
        LOAD_FAST => LOAD_DEREF,
        STORE_FAST => STORE_DEREF,
        DELETE_FAST => DELETE_DEREF,
        other => other,
    }
}
