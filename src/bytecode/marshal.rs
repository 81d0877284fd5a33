//! The target runtime's object serialization, restricted to the value kinds a
//! compiled module can contain.

use crate::bytecode::compile_error::{CompileError, Result};
use crate::bytecode::ir::CodeObject;
use crate::lang::value::Literal;

const TYPE_NONE: u8 = b'N';
const TYPE_TRUE: u8 = b'T';
const TYPE_FALSE: u8 = b'F';
const TYPE_INT: u8 = b'i';
const TYPE_LONG: u8 = b'l';
const TYPE_BINARY_FLOAT: u8 = b'g';
const TYPE_STRING: u8 = b's';
const TYPE_UNICODE: u8 = b'u';
const TYPE_ASCII: u8 = b'a';
const TYPE_SHORT_ASCII: u8 = b'z';
const TYPE_TUPLE: u8 = b'(';
const TYPE_SMALL_TUPLE: u8 = b')';
const TYPE_CODE: u8 = b'c';

/// Digits of the arbitrary-precision integer encoding are 15 bits wide.
const LONG_SHIFT: u32 = 15;
const LONG_MASK: u64 = (1 << LONG_SHIFT) - 1;

#[derive(Debug, Default)]
struct Writer {
    buf: Vec<u8>,
}

fn length(n: usize) -> Result<u32> {
    u32::try_from(n).map_err(|_| CompileError::OperandTooWide { value: n })
}

impl Writer {
    fn byte(&mut self, b: u8) {
        self.buf.push(b);
    }

    fn long(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn unsigned(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn sized(&mut self, tag: u8, data: &[u8]) -> Result<()> {
        self.byte(tag);
        self.unsigned(length(data.len())?);
        self.buf.extend_from_slice(data);
        Ok(())
    }

    fn int(&mut self, n: i64) -> Result<()> {
        if let Ok(small) = i32::try_from(n) {
            self.byte(TYPE_INT);
            self.long(small);
            return Ok(());
        }

        let mut magnitude = n.unsigned_abs();
        let mut digits = Vec::new();
        while magnitude > 0 {
            // masked to 15 bits, so the narrowing is exact
            digits.push((magnitude & LONG_MASK) as u16);
            magnitude >>= LONG_SHIFT;
        }

        let count = i32::try_from(digits.len())
            .map_err(|_| CompileError::OperandTooWide { value: digits.len() })?;
        self.byte(TYPE_LONG);
        self.long(if n < 0 { -count } else { count });
        for d in digits {
            self.buf.extend_from_slice(&d.to_le_bytes());
        }
        Ok(())
    }

    fn str(&mut self, s: &str) -> Result<()> {
        if s.is_ascii() {
            if let Ok(short) = u8::try_from(s.len()) {
                self.byte(TYPE_SHORT_ASCII);
                self.byte(short);
                self.buf.extend_from_slice(s.as_bytes());
                return Ok(());
            }
            return self.sized(TYPE_ASCII, s.as_bytes());
        }
        self.sized(TYPE_UNICODE, s.as_bytes())
    }

    fn bytes(&mut self, b: &[u8]) -> Result<()> {
        self.sized(TYPE_STRING, b)
    }

    fn tuple_header(&mut self, len: usize) -> Result<()> {
        match u8::try_from(len) {
            Ok(small) => {
                self.byte(TYPE_SMALL_TUPLE);
                self.byte(small);
            }
            Err(_) => {
                self.byte(TYPE_TUPLE);
                self.unsigned(length(len)?);
            }
        }
        Ok(())
    }

    fn str_tuple(&mut self, items: &[String]) -> Result<()> {
        self.tuple_header(items.len())?;
        items.iter().try_for_each(|s| self.str(s))
    }

    fn literal(&mut self, value: &Literal) -> Result<()> {
        match value {
            Literal::None => self.byte(TYPE_NONE),
            Literal::Bool(true) => self.byte(TYPE_TRUE),
            Literal::Bool(false) => self.byte(TYPE_FALSE),
            Literal::Int(n) => self.int(*n)?,
            Literal::Float(x) => {
                self.byte(TYPE_BINARY_FLOAT);
                self.buf.extend_from_slice(&x.to_le_bytes());
            }
            Literal::Str(s) => self.str(s)?,
            Literal::Bytes(b) => self.bytes(b)?,
            Literal::Tuple(items) => {
                self.tuple_header(items.len())?;
                items.iter().try_for_each(|item| self.literal(item))?;
            }
            Literal::Code(code) => self.code(code)?,
        }
        Ok(())
    }

    fn code(&mut self, code: &CodeObject) -> Result<()> {
        self.byte(TYPE_CODE);
        for field in [
            code.argcount,
            code.posonlyargcount,
            code.kwonlyargcount,
            code.stacksize,
            code.flags,
        ] {
            self.unsigned(field);
        }

        self.bytes(&code.code)?;
        self.tuple_header(code.consts.len())?;
        code.consts.iter().try_for_each(|c| self.literal(c))?;
        self.str_tuple(&code.names)?;
        self.str_tuple(&code.localsplusnames)?;
        self.bytes(&code.localspluskinds)?;
        self.str(&code.filename)?;
        self.str(&code.name)?;
        self.str(&code.qualname)?;
        self.unsigned(code.firstlineno);
        self.bytes(&code.linetable)?;
        self.bytes(&code.exceptiontable)
    }
}

/// Serialize a code object and everything it holds.
pub fn dump_code(code: &CodeObject) -> Result<Vec<u8>> {
    let mut w = Writer::default();
    w.code(code)?;
    Ok(w.buf)
}

pub fn dump_literal(value: &Literal) -> Result<Vec<u8>> {
    let mut w = Writer::default();
    w.literal(value)?;
    Ok(w.buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_singletons() {
        assert_eq!(dump_literal(&Literal::None).unwrap(), b"N");
        assert_eq!(dump_literal(&Literal::Bool(true)).unwrap(), b"T");
        assert_eq!(dump_literal(&Literal::Bool(false)).unwrap(), b"F");
    }

    #[test]
    fn test_small_and_large_ints() {
        assert_eq!(dump_literal(&Literal::Int(5)).unwrap(), vec![b'i', 5, 0, 0, 0]);
        assert_eq!(
            dump_literal(&Literal::Int(-2)).unwrap(),
            vec![b'i', 0xfe, 0xff, 0xff, 0xff]
        );

        // 2**40 is digits [0, 0, 1024] in base 2**15
        assert_eq!(
            dump_literal(&Literal::Int(1 << 40)).unwrap(),
            vec![b'l', 3, 0, 0, 0, 0, 0, 0, 0, 0x00, 0x04]
        );
        assert_eq!(
            dump_literal(&Literal::Int(-(1 << 40))).unwrap()[..5],
            [b'l', 0xfd, 0xff, 0xff, 0xff]
        );
    }

    #[test]
    fn test_float() {
        let bytes = dump_literal(&Literal::Float(1.5)).unwrap();
        assert_eq!(bytes[0], b'g');
        assert_eq!(bytes[1..], 1.5f64.to_le_bytes());
    }

    #[test]
    fn test_strings() {
        assert_eq!(dump_literal(&Literal::from("hi")).unwrap(), b"z\x02hi");
        assert_eq!(
            dump_literal(&Literal::from("é")).unwrap(),
            vec![b'u', 2, 0, 0, 0, 0xc3, 0xa9]
        );

        let long = "x".repeat(300);
        let bytes = dump_literal(&Literal::Str(long)).unwrap();
        assert_eq!(bytes[..5], [b'a', 0x2c, 0x01, 0, 0]);
        assert_eq!(bytes.len(), 305);
    }

    #[test]
    fn test_bytes_and_tuples() {
        assert_eq!(
            dump_literal(&Literal::Bytes(vec![1, 2])).unwrap(),
            vec![b's', 2, 0, 0, 0, 1, 2]
        );
        assert_eq!(
            dump_literal(&Literal::Tuple(vec![Literal::Int(1), Literal::None])).unwrap(),
            vec![b')', 2, b'i', 1, 0, 0, 0, b'N']
        );

        let wide = Literal::Tuple(vec![Literal::None; 256]);
        assert_eq!(dump_literal(&wide).unwrap()[..5], [b'(', 0, 1, 0, 0]);
    }

    #[test]
    fn test_code_layout() {
        let code = CodeObject {
            argcount: 1,
            posonlyargcount: 0,
            kwonlyargcount: 0,
            nlocals: 1,
            stacksize: 2,
            flags: 2,
            code: vec![149, 0, 83, 0, 35, 0],
            consts: vec![],
            names: vec![],
            localsplusnames: vec!["x".to_string()],
            localspluskinds: vec![0x20],
            filename: "main.py".to_string(),
            name: "f".to_string(),
            qualname: "f".to_string(),
            firstlineno: 1,
            linetable: vec![],
            exceptiontable: vec![],
        };

        let mut expected = vec![b'c'];
        for field in [1u32, 0, 0, 2, 2] {
            expected.extend(field.to_le_bytes());
        }
        expected.extend([b's', 6, 0, 0, 0, 149, 0, 83, 0, 35, 0]);
        expected.extend([b')', 0]);
        expected.extend([b')', 0]);
        expected.extend([b')', 1, b'z', 1, b'x']);
        expected.extend([b's', 1, 0, 0, 0, 0x20]);
        expected.extend(b"z\x07main.py");
        expected.extend(b"z\x01f");
        expected.extend(b"z\x01f");
        expected.extend(1u32.to_le_bytes());
        expected.extend([b's', 0, 0, 0, 0]);
        expected.extend([b's', 0, 0, 0, 0]);

        assert_eq!(dump_code(&code).unwrap(), expected);
    }
}
