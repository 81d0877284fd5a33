use thiserror::Error;

pub type Result<T> = std::result::Result<T, CompileError>;

/// Everything that can abort a compilation. All of these are fatal: no
/// partial output is produced once one is raised.
#[derive(Debug, Error)]
pub enum CompileError {
    /// A sub-expression left the wrong number of values on the stack, or
    /// read below the point where it started.
    #[error("compile error: {construct}: expected {expected}, found height {height} depth {depth}{}", hint_suffix(.hint))]
    StackShape {
        construct: String,
        expected: String,
        height: i32,
        depth: i32,
        hint: Option<String>,
    },

    /// The two arms of a conditional do not leave the same stack height.
    #[error(
        "compile error: conditional branches must have equal height, found {chosen} and {other}"
    )]
    BranchHeightMismatch { chosen: i32, other: i32 },

    /// A complete function body was used as an operand of concatenation.
    #[error("compile error: tried to concatenate a function block ({args:?})")]
    FunctionBodyConcat { args: Vec<String> },

    /// A node whose variant and child count do not fit together.
    #[error("compile error: malformed '{node}' node with {children} children{}", hint_suffix(.hint))]
    MalformedNode {
        node: String,
        children: usize,
        hint: Option<String>,
    },

    /// An opcode whose stack effect is not modelled was selected.
    #[error("compile error: instruction {name} ({opcode}) is not supported")]
    UnsupportedInstruction { opcode: u8, name: &'static str },

    /// An operand that cannot be expressed even with extension prefixes.
    #[error("compile error: operand {value} does not fit in 32 bits")]
    OperandTooWide { value: usize },

    /// The assembled code failed verification.
    #[error("stack-check error: {0}")]
    StackCheck(String),

    /// The AST input could not be decoded.
    #[error("compile error: cannot decode AST: {0}")]
    Decode(#[from] postcard::Error),

    #[error("compile error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal compiler error (shouldn't happen in normal use)
    #[error("compile error: internal error: {0}")]
    Internal(String),
}

fn hint_suffix(hint: &Option<String>) -> String {
    match hint {
        Some(h) => format!("\n  hint: {}", h),
        None => String::new(),
    }
}

impl CompileError {
    /// A value-producing operand that is not exactly one slot tall.
    pub fn operand_shape(construct: &str, height: i32, depth: i32) -> Self {
        CompileError::StackShape {
            construct: construct.to_string(),
            expected: "height 1 and depth >= 0".to_string(),
            height,
            depth,
            hint: Some(format!(
                "inputs to {} must push exactly one value and not touch the stack below",
                construct
            )),
        }
    }

    pub fn shape(construct: &str, expected: impl Into<String>, height: i32, depth: i32) -> Self {
        CompileError::StackShape {
            construct: construct.to_string(),
            expected: expected.into(),
            height,
            depth,
            hint: None,
        }
    }

    pub fn malformed(node: &str, children: usize) -> Self {
        CompileError::MalformedNode {
            node: node.to_string(),
            children,
            hint: None,
        }
    }

    pub fn malformed_with_hint(node: &str, children: usize, hint: impl Into<String>) -> Self {
        CompileError::MalformedNode {
            node: node.to_string(),
            children,
            hint: Some(hint.into()),
        }
    }

    pub fn stack_check(msg: impl Into<String>) -> Self {
        CompileError::StackCheck(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        CompileError::Internal(msg.into())
    }
}
