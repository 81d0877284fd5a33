//! # Cinder
//!
//! Compiler backend that lowers a program tree to stack-machine bytecode and
//! writes it out as a loadable module for a CPython 3.14 interpreter.
//!
//! The pipeline runs strictly one way:
//!
//! ```text
//! Node ──compile──▶ Block ──resolve──▶ ResolvedBlock ──assemble──▶ CodeObject ──serialize──▶ bytes
//! ```

pub mod bytecode;
pub mod config;
pub mod lang;

pub use bytecode::compile::Compiler;
pub use bytecode::compile_error::{CompileError, Result};
pub use bytecode::ir::CodeObject;
pub use config::CompileConfig;
pub use lang::node::Node;

/// Compile a top-level program tree to its code object.
pub fn compile_program(root: Node, config: &CompileConfig) -> Result<CodeObject> {
    Compiler::new(config).compile_program(root)
}

/// Compile a top-level program tree all the way to module file bytes.
pub fn compile_module(root: Node, config: &CompileConfig) -> Result<Vec<u8>> {
    let code = compile_program(root, config)?;
    bytecode::module::serialize(code, config)
}

/// Human-readable listing of a code object and its nested functions.
pub fn disassemble(code: &CodeObject) -> Result<String> {
    bytecode::disasm::disassemble_to_string(code)
}

/// Decode a postcard-encoded program tree.
pub fn decode_tree(bytes: &[u8]) -> Result<Node> {
    Ok(postcard::from_bytes(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lang::node::Comparison;

    #[test]
    fn test_module_bytes() {
        let root = Node::call(Node::callee("print"), vec![Node::literal(1)], true);
        let bytes = compile_module(root, &CompileConfig::default()).unwrap();

        assert_eq!(bytes[..4], [0x1d, 0x0e, b'\r', b'\n']);
        assert_eq!(bytes[16], b'c');
    }

    #[test]
    fn test_tree_decoding() {
        let root = Node::if_then(
            Node::compare(Comparison::Gt, Node::global("a"), Node::literal(1)),
            Node::store("b", false, Node::literal(2)),
        );
        let encoded = postcard::to_allocvec(&root).unwrap();
        assert_eq!(decode_tree(&encoded).unwrap(), root);

        assert!(matches!(
            decode_tree(&[0xff, 0xff]),
            Err(CompileError::Decode(_))
        ));
    }

    #[test]
    fn test_disassemble_hook() {
        let code = compile_program(Node::literal(3), &CompileConfig::default()).unwrap();
        assert!(disassemble(&code).unwrap().contains("LOAD_SMALL_INT"));
    }
}
