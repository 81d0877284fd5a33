pub mod block;
pub mod compile;
pub mod compile_error;
pub mod disasm;
pub mod ir;
pub mod marshal;
pub mod module;
pub mod op;
pub mod resolve;
pub mod stack_check;

pub use block::{Block, Instruction, Operand, Variable};
pub use ir::CodeObject;
