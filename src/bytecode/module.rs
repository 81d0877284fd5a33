use std::path::Path;

use tracing::{debug, info};

use crate::bytecode::block::{Block, Operand, Variable};
use crate::bytecode::compile_error::Result;
use crate::bytecode::ir::{CodeObject, assemble};
use crate::bytecode::marshal;
use crate::bytecode::op::{CALL, LOAD_CONST, LOAD_GLOBAL, MAKE_FUNCTION, POP_TOP, RESUME, STORE_GLOBAL};
use crate::bytecode::resolve::resolve;
use crate::config::CompileConfig;
use crate::lang::value::Literal;

pub const HEADER_LEN: usize = 16;

/// Build the top-level code object that defines `inner` as a global
/// function, calls it once, and returns None.
pub fn driver(inner: CodeObject, config: &CompileConfig) -> Result<CodeObject> {
    let name = inner.name.clone();

    let body = [
        Block::raw(RESUME, 0)?,
        Block::from_instruction(LOAD_CONST, Operand::Const(Literal::Code(Box::new(inner))))?,
        Block::raw(MAKE_FUNCTION, 0)?,
        Block::from_instruction(STORE_GLOBAL, Operand::Var(Variable::global(name.clone(), false)))?,
        Block::from_instruction(LOAD_GLOBAL, Operand::Var(Variable::global(name, true)))?,
        Block::raw(CALL, 0)?,
        Block::raw(POP_TOP, 0)?,
        Block::early_return()?,
    ]
    .into_iter()
    .try_fold(Block::empty(), Block::then)?;

    assemble(resolve(body)?, &config.module_name, config)
}

/// The 16-byte file header: magic, flags, source mtime, source size.
pub fn header(config: &CompileConfig) -> [u8; HEADER_LEN] {
    let mut out = [0u8; HEADER_LEN];
    out[0..2].copy_from_slice(&config.magic.to_le_bytes());
    out[2..4].copy_from_slice(b"\r\n");
    // flags stay zero: timestamp-based invalidation
    out[8..12].copy_from_slice(&config.source_mtime.to_le_bytes());
    out[12..16].copy_from_slice(&config.source_size.to_le_bytes());
    out
}

/// Header followed by the marshalled driver for `inner`.
pub fn serialize(inner: CodeObject, config: &CompileConfig) -> Result<Vec<u8>> {
    let driver = driver(inner, config)?;
    let body = marshal::dump_code(&driver)?;
    debug!(bytes = body.len(), "marshalled driver");

    let mut out = Vec::with_capacity(HEADER_LEN + body.len());
    out.extend_from_slice(&header(config));
    out.extend_from_slice(&body);
    Ok(out)
}

pub fn write(path: &Path, bytes: &[u8]) -> Result<()> {
    std::fs::write(path, bytes)?;
    info!(path = %path.display(), bytes = bytes.len(), "wrote module");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::op;

    fn inner() -> CodeObject {
        let body = Block::raw(RESUME, 0)
            .unwrap()
            .then(Block::early_return().unwrap())
            .unwrap();
        assemble(resolve(body).unwrap(), "main", &CompileConfig::default()).unwrap()
    }

    #[test]
    fn test_driver_layout() {
        let config = CompileConfig::default();
        let code = driver(inner(), &config).unwrap();

        assert_eq!(code.name, "<module>");
        assert_eq!(code.names, vec!["main"]);
        assert_eq!(code.consts.len(), 2);
        assert!(matches!(&code.consts[0], Literal::Code(c) if c.name == "main"));
        assert_eq!(code.consts[1], Literal::None);
        assert_eq!(code.stacksize, 4);

        let ops: Vec<(u8, u32)> = code
            .instructions()
            .unwrap()
            .iter()
            .map(|d| (d.opcode, d.arg))
            .collect();
        assert_eq!(
            ops,
            vec![
                (RESUME, 0),
                (LOAD_CONST, 0),
                (MAKE_FUNCTION, 0),
                (STORE_GLOBAL, 0),
                (LOAD_GLOBAL, 1),
                (CALL, 0),
                (POP_TOP, 0),
                (LOAD_CONST, 1),
                (op::RETURN_VALUE, 0),
            ]
        );
    }

    #[test]
    fn test_header() {
        let config = CompileConfig {
            source_mtime: 0x01020304,
            source_size: 42,
            ..CompileConfig::default()
        };
        let h = header(&config);
        assert_eq!(h[..4], [0x1d, 0x0e, b'\r', b'\n']);
        assert_eq!(h[4..8], [0, 0, 0, 0]);
        assert_eq!(h[8..12], [4, 3, 2, 1]);
        assert_eq!(h[12..16], [42, 0, 0, 0]);
    }

    #[test]
    fn test_serialize_starts_with_header_then_code() {
        let bytes = serialize(inner(), &CompileConfig::default()).unwrap();
        assert_eq!(bytes[..4], [0x1d, 0x0e, b'\r', b'\n']);
        assert_eq!(bytes[HEADER_LEN], b'c');
    }

    #[test]
    fn test_write_round_trip() {
        let path = std::env::temp_dir().join(format!("cinder-module-{}.pyc", std::process::id()));
        write(&path, b"abc").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"abc");
        std::fs::remove_file(&path).unwrap();
    }
}
