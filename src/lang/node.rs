use super::value::Literal;
use crate::bytecode::block::Block;
use serde::{Deserialize, Serialize};

/// A node of the program tree handed over by the parser.
///
/// The operation says what the node does; the children are its operands in
/// evaluation order. Which child counts are legal depends on the operation
/// and is checked by the compiler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub op: Operation,
    pub children: Vec<Node>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Operation {
    // ───────────────────────────── Values ─────────────────────────────
    /// Push a literal.
    ///
    /// Children: none
    Literal(Literal),

    // ─────────────────────────── Operators ────────────────────────────
    /// Children: `[lhs, rhs]`
    BinaryOp {
        op: BinaryOperator,
        in_place: bool,
    },

    /// Children: `[lhs, rhs]`
    ///
    /// `force_convert` makes the comparison itself produce an exact
    /// boolean, which is what a conditional jump consumes.
    CompOp {
        op: Comparison,
        force_convert: bool,
    },

    /// Identity test. Children: `[lhs, rhs]`
    IsOp { inverted: bool },

    /// Membership test. Children: `[lhs, rhs]`
    InOp { inverted: bool },

    // ───────────────────────── Control flow ───────────────────────────
    /// Children: `[condition, then]`
    If,

    /// Children: `[condition, then, else]`
    IfElse,

    /// Run every child in order. Children: any number
    Sequence,

    // ─────────────────────────── Names ────────────────────────────────
    /// Children: none
    ///
    /// `func` loads the name in call position, reserving the receiver slot.
    LoadName {
        name: String,
        local: bool,
        func: bool,
    },

    /// Children: `[value]`
    StoreName { name: String, local: bool },

    // ─────────────────────────── Functions ────────────────────────────
    /// Children: `[callee, arg...]`
    Call { discard: bool },

    /// Children: `[body]`
    MakeFunction {
        args: Vec<String>,
        name: String,
        captures: Vec<String>,
    },

    /// Children: `[]` or `[value]`
    Return,

    /// Splice a prebuilt block verbatim. Children: none
    RawBlock(Block),
}

impl Operation {
    /// A short human-readable name, used in diagnostics.
    pub fn describe(&self) -> &'static str {
        match self {
            Operation::Literal(_) => "literal",
            Operation::BinaryOp { .. } => "binary operation",
            Operation::CompOp { .. } => "comparison",
            Operation::IsOp { .. } => "`is` operation",
            Operation::InOp { .. } => "`in` operation",
            Operation::If => "if",
            Operation::IfElse => "if-else",
            Operation::Sequence => "sequence",
            Operation::LoadName { .. } => "load",
            Operation::StoreName { .. } => "store",
            Operation::Call { .. } => "call",
            Operation::MakeFunction { .. } => "function definition",
            Operation::Return => "return",
            Operation::RawBlock(_) => "raw block",
        }
    }
}

/// Arithmetic and bitwise operators, numbered as the combining instruction expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum BinaryOperator {
    Add = 0,
    BitAnd = 1,
    FloorDiv = 2,
    LShift = 3,
    MatMul = 4,
    Mul = 5,
    Rem = 6,
    BitOr = 7,
    Pow = 8,
    RShift = 9,
    Sub = 10,
    TrueDiv = 11,
    BitXor = 12,
}

const BINARY_OPERATORS: [(BinaryOperator, &str); 13] = [
    (BinaryOperator::Add, "+"),
    (BinaryOperator::BitAnd, "&"),
    (BinaryOperator::FloorDiv, "//"),
    (BinaryOperator::LShift, "<<"),
    (BinaryOperator::MatMul, "@"),
    (BinaryOperator::Mul, "*"),
    (BinaryOperator::Rem, "%"),
    (BinaryOperator::BitOr, "|"),
    (BinaryOperator::Pow, "**"),
    (BinaryOperator::RShift, ">>"),
    (BinaryOperator::Sub, "-"),
    (BinaryOperator::TrueDiv, "/"),
    (BinaryOperator::BitXor, "^"),
];

/// Added to an operator's code for its augmented-assignment form.
const IN_PLACE_OFFSET: u32 = 13;

impl BinaryOperator {
    /// Parse an operator symbol such as `+`, `//` or `**=`, returning the
    /// operator and whether it is the in-place form.
    pub fn from_symbol(symbol: &str) -> Option<(Self, bool)> {
        let lookup = |s: &str| {
            BINARY_OPERATORS
                .iter()
                .find(|(_, sym)| *sym == s)
                .map(|(op, _)| *op)
        };
        if let Some(op) = lookup(symbol) {
            return Some((op, false));
        }
        let op = lookup(symbol.strip_suffix('=')?)?;
        Some((op, true))
    }

    /// The operand of the combining instruction.
    pub fn code(&self, in_place: bool) -> u32 {
        let code = *self as u32;
        if in_place { code + IN_PLACE_OFFSET } else { code }
    }

    pub fn symbol(&self) -> &'static str {
        BINARY_OPERATORS[*self as usize].1
    }

    /// Inverse of [`BinaryOperator::code`].
    pub fn from_code(code: u32) -> Option<(Self, bool)> {
        let in_place = code >= IN_PLACE_OFFSET;
        let base = if in_place { code - IN_PLACE_OFFSET } else { code };
        let (op, _) = BINARY_OPERATORS.get(usize::try_from(base).ok()?)?;
        Some((*op, in_place))
    }
}

/// Rich comparison operators, in the target machine's numbering order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Comparison {
    Lt,
    Le,
    Eq,
    Ne,
    Gt,
    Ge,
}

const UNORDERED: u32 = 1;
const LESS_THAN: u32 = 2;
const GREATER_THAN: u32 = 4;
const EQUALS: u32 = 8;

/// Set on a comparison operand to make the result an exact boolean.
pub const FORCE_BOOL: u32 = 16;

impl Comparison {
    pub fn from_symbol(symbol: &str) -> Option<Self> {
        Some(match symbol {
            "<" => Comparison::Lt,
            "<=" => Comparison::Le,
            "==" => Comparison::Eq,
            "!=" => Comparison::Ne,
            ">" => Comparison::Gt,
            ">=" => Comparison::Ge,
            _ => return None,
        })
    }

    fn mask(&self) -> u32 {
        match self {
            Comparison::Lt => LESS_THAN,
            Comparison::Le => LESS_THAN | EQUALS,
            Comparison::Eq => EQUALS,
            Comparison::Ne => UNORDERED | LESS_THAN | GREATER_THAN,
            Comparison::Gt => GREATER_THAN,
            Comparison::Ge => GREATER_THAN | EQUALS,
        }
    }

    /// The operand of the comparison instruction.
    pub fn code(&self, force_convert: bool) -> u32 {
        let index = *self as u32;
        let force = if force_convert { FORCE_BOOL } else { 0 };
        (index << 5) | force | self.mask()
    }

    /// Decode a comparison operand into the operator and its force-bool bit.
    pub fn from_code(code: u32) -> Option<(Self, bool)> {
        const ALL: [Comparison; 6] = [
            Comparison::Lt,
            Comparison::Le,
            Comparison::Eq,
            Comparison::Ne,
            Comparison::Gt,
            Comparison::Ge,
        ];
        let op = *ALL.get(usize::try_from(code >> 5).ok()?)?;
        Some((op, code & FORCE_BOOL != 0))
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            Comparison::Lt => "<",
            Comparison::Le => "<=",
            Comparison::Eq => "==",
            Comparison::Ne => "!=",
            Comparison::Gt => ">",
            Comparison::Ge => ">=",
        }
    }
}

// ───────────────────────────── Builders ─────────────────────────────

impl Node {
    pub fn new(op: Operation, children: Vec<Node>) -> Self {
        Node { op, children }
    }

    pub fn leaf(op: Operation) -> Self {
        Node::new(op, Vec::new())
    }

    pub fn literal(value: impl Into<Literal>) -> Self {
        Node::leaf(Operation::Literal(value.into()))
    }

    pub fn none() -> Self {
        Node::leaf(Operation::Literal(Literal::None))
    }

    pub fn binary(op: BinaryOperator, lhs: Node, rhs: Node) -> Self {
        Node::new(
            Operation::BinaryOp {
                op,
                in_place: false,
            },
            vec![lhs, rhs],
        )
    }

    pub fn compare(op: Comparison, lhs: Node, rhs: Node) -> Self {
        Node::new(
            Operation::CompOp {
                op,
                force_convert: false,
            },
            vec![lhs, rhs],
        )
    }

    pub fn is(inverted: bool, lhs: Node, rhs: Node) -> Self {
        Node::new(Operation::IsOp { inverted }, vec![lhs, rhs])
    }

    pub fn contains(inverted: bool, lhs: Node, rhs: Node) -> Self {
        Node::new(Operation::InOp { inverted }, vec![lhs, rhs])
    }

    pub fn if_then(condition: Node, then: Node) -> Self {
        Node::new(Operation::If, vec![condition, then])
    }

    pub fn if_else(condition: Node, then: Node, otherwise: Node) -> Self {
        Node::new(Operation::IfElse, vec![condition, then, otherwise])
    }

    pub fn sequence(children: Vec<Node>) -> Self {
        Node::new(Operation::Sequence, children)
    }

    pub fn local(name: &str) -> Self {
        Node::leaf(Operation::LoadName {
            name: name.to_string(),
            local: true,
            func: false,
        })
    }

    pub fn global(name: &str) -> Self {
        Node::leaf(Operation::LoadName {
            name: name.to_string(),
            local: false,
            func: false,
        })
    }

    /// A global loaded in call position.
    pub fn callee(name: &str) -> Self {
        Node::leaf(Operation::LoadName {
            name: name.to_string(),
            local: false,
            func: true,
        })
    }

    pub fn store(name: &str, local: bool, value: Node) -> Self {
        Node::new(
            Operation::StoreName {
                name: name.to_string(),
                local,
            },
            vec![value],
        )
    }

    pub fn call(callee: Node, args: Vec<Node>, discard: bool) -> Self {
        let mut children = Vec::with_capacity(args.len() + 1);
        children.push(callee);
        children.extend(args);
        Node::new(Operation::Call { discard }, children)
    }

    pub fn ret(value: Option<Node>) -> Self {
        Node::new(Operation::Return, value.into_iter().collect())
    }

    pub fn function(name: &str, args: &[&str], captures: &[&str], body: Node) -> Self {
        Node::new(
            Operation::MakeFunction {
                args: args.iter().map(|s| s.to_string()).collect(),
                name: name.to_string(),
                captures: captures.iter().map(|s| s.to_string()).collect(),
            },
            vec![body],
        )
    }

    pub fn is_none_literal(&self) -> bool {
        matches!(&self.op, Operation::Literal(Literal::None)) && self.children.is_empty()
    }

    /// Sequence this node with `next`, the way a parser appends a trailing return.
    pub fn then(self, next: Node) -> Node {
        match self.op {
            Operation::Sequence => {
                let mut children = self.children;
                children.push(next);
                Node::sequence(children)
            }
            _ => Node::sequence(vec![self, next]),
        }
    }
}
