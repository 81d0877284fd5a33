use crate::bytecode::ir::CodeObject;
use serde::{Deserialize, Serialize};

/// A literal value that can live in a code object's constant pool.
///
/// Constants are pooled by structural equality, so `Int(1)`, `Float(1.0)`
/// and `Bool(true)` are three distinct entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Literal {
    /// The none-value.
    None,

    Bool(bool),

    /// Integer literal; the marshal layer widens past 32 bits as needed.
    Int(i64),

    Float(f64),

    /// UTF-8 string.
    Str(String),

    Bytes(Vec<u8>),

    Tuple(Vec<Literal>),

    /// A nested, fully assembled function body.
    Code(Box<CodeObject>),
}

impl Literal {
    pub fn is_none(&self) -> bool {
        matches!(self, Literal::None)
    }

    /// The operand for the small-integer load, if this literal qualifies.
    pub fn small_int(&self) -> Option<u32> {
        match self {
            Literal::Int(n) => u8::try_from(*n).ok().map(u32::from),
            _ => None,
        }
    }
}

impl PartialEq for Literal {
    /// Floats compare by bit pattern, so `0.0` and `-0.0` stay apart and a
    /// NaN matches itself.
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Literal::None, Literal::None) => true,
            (Literal::Bool(a), Literal::Bool(b)) => a == b,
            (Literal::Int(a), Literal::Int(b)) => a == b,
            (Literal::Float(a), Literal::Float(b)) => a.to_bits() == b.to_bits(),
            (Literal::Str(a), Literal::Str(b)) => a == b,
            (Literal::Bytes(a), Literal::Bytes(b)) => a == b,
            (Literal::Tuple(a), Literal::Tuple(b)) => a == b,
            (Literal::Code(a), Literal::Code(b)) => a == b,
            _ => false,
        }
    }
}

impl From<i64> for Literal {
    fn from(n: i64) -> Self {
        Literal::Int(n)
    }
}

impl From<i32> for Literal {
    fn from(n: i32) -> Self {
        Literal::Int(i64::from(n))
    }
}

impl From<&str> for Literal {
    fn from(s: &str) -> Self {
        Literal::Str(s.to_string())
    }
}

impl std::fmt::Display for Literal {
    /// Format a literal the way the target language would print its repr.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Literal::None => write!(f, "None"),
            Literal::Bool(true) => write!(f, "True"),
            Literal::Bool(false) => write!(f, "False"),
            Literal::Int(n) => write!(f, "{}", n),
            Literal::Float(x) if x.fract() == 0.0 && x.is_finite() => write!(f, "{:.1}", x),
            Literal::Float(x) => write!(f, "{}", x),
            Literal::Str(s) => write!(f, "{:?}", s),
            Literal::Bytes(b) => write!(f, "b{:?}", String::from_utf8_lossy(b)),
            Literal::Tuple(items) => {
                write!(f, "(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                if items.len() == 1 {
                    write!(f, ",")?;
                }
                write!(f, ")")
            }
            Literal::Code(code) => write!(f, "<code object {}>", code.name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_int_range() {
        assert_eq!(Literal::Int(0).small_int(), Some(0));
        assert_eq!(Literal::Int(255).small_int(), Some(255));
        assert_eq!(Literal::Int(256).small_int(), None);
        assert_eq!(Literal::Int(-1).small_int(), None);
        assert_eq!(Literal::Bool(true).small_int(), None);
    }

    #[test]
    fn test_structural_equality_keeps_types_apart() {
        assert_ne!(Literal::Int(1), Literal::Float(1.0));
        assert_ne!(Literal::Int(1), Literal::Bool(true));
        assert_eq!(Literal::from("x"), Literal::Str("x".to_string()));
    }

    #[test]
    fn test_float_equality_is_bitwise() {
        assert_ne!(Literal::Float(0.0), Literal::Float(-0.0));
        assert_eq!(Literal::Float(f64::NAN), Literal::Float(f64::NAN));
        assert_ne!(
            Literal::Tuple(vec![Literal::Float(0.0)]),
            Literal::Tuple(vec![Literal::Float(-0.0)])
        );
    }

    #[test]
    fn test_display() {
        assert_eq!(Literal::None.to_string(), "None");
        assert_eq!(Literal::Bool(false).to_string(), "False");
        assert_eq!(Literal::Float(2.0).to_string(), "2.0");
        assert_eq!(Literal::from("hi").to_string(), "\"hi\"");
        assert_eq!(Literal::Tuple(vec![Literal::Int(1)]).to_string(), "(1,)");
    }
}
