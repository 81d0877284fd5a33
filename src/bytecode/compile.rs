use tracing::debug;

use crate::{
    bytecode::{
        block::{Block, Operand, Variable},
        compile_error::{CompileError, Result},
        ir::{CodeObject, assemble},
        op::{
            BINARY_OP, BUILD_TUPLE, CALL, COMPARE_OP, CONTAINS_OP, COPY_FREE_VARS,
            FUNCTION_ATTR_CLOSURE, IS_OP, LOAD_CONST, LOAD_FAST, LOAD_GLOBAL, LOAD_SMALL_INT,
            MAKE_CELL, MAKE_FUNCTION, POP_JUMP_IF_FALSE, POP_JUMP_IF_NONE, POP_JUMP_IF_NOT_NONE,
            POP_TOP, RESUME, RETURN_VALUE, SET_FUNCTION_ATTRIBUTE, STORE_FAST, STORE_GLOBAL,
            TO_BOOL,
        },
        resolve::resolve,
    },
    config::CompileConfig,
    lang::{
        node::{Node, Operation},
        value::Literal,
    },
};

/// Lowers program trees to blocks.
///
/// Nested function definitions are resolved and assembled as soon as their
/// body is compiled, so the enclosing block only ever sees a finished code
/// object in its constant pool.
pub struct Compiler<'a> {
    config: &'a CompileConfig,
}

/// Split a node's children into exactly `N` operands.
fn operands<const N: usize>(what: &'static str, children: Vec<Node>) -> Result<[Node; N]> {
    <[Node; N]>::try_from(children).map_err(|c| CompileError::malformed(what, c.len()))
}

fn count(n: usize) -> Result<u32> {
    u32::try_from(n).map_err(|_| CompileError::OperandTooWide { value: n })
}

impl<'a> Compiler<'a> {
    pub fn new(config: &'a CompileConfig) -> Self {
        Self { config }
    }

    /// Compile a complete top-level program into its code object.
    ///
    /// The body gets the frame-entry instruction up front and a `return None`
    /// tail, so a program that does not return explicitly still exits cleanly.
    pub fn compile_program(&self, root: Node) -> Result<CodeObject> {
        let body = Block::raw(RESUME, 0)?
            .then(self.compile(root)?)?
            .then(Block::early_return()?)?;
        if body.depth < 0 {
            return Err(CompileError::shape(
                "program",
                "depth >= 0",
                body.height,
                body.depth,
            ));
        }

        assemble(resolve(body)?, &self.config.module_name, self.config)
    }

    pub fn compile(&self, node: Node) -> Result<Block> {
        let Node { op, children } = node;
        let what = op.describe();

        match op {
            Operation::Literal(value) => {
                operands::<0>(what, children)?;
                self.literal(value)
            }

            Operation::BinaryOp { op, in_place } => {
                self.combine(what, children, BINARY_OP, op.code(in_place))
            }
            Operation::CompOp { op, force_convert } => {
                self.combine(what, children, COMPARE_OP, op.code(force_convert))
            }
            Operation::IsOp { inverted } => self.combine(what, children, IS_OP, u32::from(inverted)),
            Operation::InOp { inverted } => {
                self.combine(what, children, CONTAINS_OP, u32::from(inverted))
            }

            Operation::If => {
                let [condition, then] = operands::<2>(what, children)?;
                self.conditional(condition, then, None)
            }
            Operation::IfElse => {
                let [condition, then, otherwise] = operands::<3>(what, children)?;
                self.conditional(condition, then, Some(otherwise))
            }

            Operation::Sequence => children
                .into_iter()
                .try_fold(Block::empty(), |block, child| block.then(self.compile(child)?)),

            Operation::LoadName { name, local, func } => {
                operands::<0>(what, children)?;
                let opcode = if local { LOAD_FAST } else { LOAD_GLOBAL };
                Block::from_instruction(opcode, Operand::Var(Variable { name, local, func }))
            }
            Operation::StoreName { name, local } => {
                let [value] = operands::<1>(what, children)?;
                let opcode = if local { STORE_FAST } else { STORE_GLOBAL };
                let var = Variable {
                    name,
                    local,
                    func: false,
                };
                self.compile(value)?
                    .then(Block::from_instruction(opcode, Operand::Var(var))?)
            }

            Operation::Call { discard } => self.call(children, discard),

            Operation::MakeFunction {
                args,
                name,
                captures,
            } => {
                let [body] = operands::<1>(what, children)?;
                self.function(args, name, captures, body)
            }

            Operation::Return => {
                if children.len() > 1 {
                    return Err(CompileError::malformed_with_hint(
                        what,
                        children.len(),
                        "return takes at most one value",
                    ));
                }
                let value = children.into_iter().next().unwrap_or_else(Node::none);
                self.compile(value)?.then(Block::raw(RETURN_VALUE, 0)?)
            }

            Operation::RawBlock(block) => {
                operands::<0>(what, children)?;
                Ok(block)
            }
        }
    }

    fn literal(&self, value: Literal) -> Result<Block> {
        match value.small_int() {
            Some(n) => Block::raw(LOAD_SMALL_INT, n),
            None => Block::from_instruction(LOAD_CONST, Operand::Const(value)),
        }
    }

    /// Compile a child that must push exactly one value.
    fn value(&self, construct: &str, node: Node) -> Result<Block> {
        let block = self.compile(node)?;
        if block.height != 1 || block.depth < 0 {
            return Err(CompileError::operand_shape(construct, block.height, block.depth));
        }
        Ok(block)
    }

    /// `lhs`, `rhs`, then one instruction that combines them.
    fn combine(&self, what: &'static str, children: Vec<Node>, opcode: u8, arg: u32) -> Result<Block> {
        let [lhs, rhs] = operands::<2>(what, children)?;
        let lhs = self.value(what, lhs)?;
        let rhs = self.value(what, rhs)?;
        lhs.then(rhs)?.then(Block::raw(opcode, arg)?)
    }

    // =========================================================================
    // Control flow
    // =========================================================================

    /// The condition plus the jump that skips the then-branch.
    ///
    /// Comparisons are asked to produce an exact boolean directly. An identity
    /// test against None drops the None and branches on the other operand.
    /// Anything else is converted with `TO_BOOL` first.
    fn branch_header(&self, condition: Node) -> Result<Block> {
        let Node { op, mut children } = condition;

        let (subject, jump, needs_bool) = match op {
            Operation::CompOp { op, .. } => (
                Node::new(
                    Operation::CompOp {
                        op,
                        force_convert: true,
                    },
                    children,
                ),
                POP_JUMP_IF_FALSE,
                false,
            ),
            Operation::IsOp { inverted }
                if children.len() == 2 && children.iter().any(Node::is_none_literal) =>
            {
                let none_at = children
                    .iter()
                    .position(Node::is_none_literal)
                    .unwrap_or(0);
                children.remove(none_at);
                let subject = children
                    .pop()
                    .ok_or_else(|| CompileError::internal("identity test lost its operand"))?;
                // jump past the then-branch when the test fails
                let jump = if inverted {
                    POP_JUMP_IF_NONE
                } else {
                    POP_JUMP_IF_NOT_NONE
                };
                (subject, jump, false)
            }
            op => (Node::new(op, children), POP_JUMP_IF_FALSE, true),
        };

        let block = self.compile(subject)?;
        if block.height != 1 {
            return Err(CompileError::shape(
                "branch condition",
                "height 1",
                block.height,
                block.depth,
            ));
        }
        let block = if needs_bool {
            block.then(Block::raw(TO_BOOL, 0)?)?
        } else {
            block
        };
        block.then(Block::raw(jump, 0)?)
    }

    fn conditional(&self, condition: Node, then: Node, otherwise: Option<Node>) -> Result<Block> {
        let header = self.branch_header(condition)?;
        let then = self.compile(then)?;
        let otherwise = match otherwise {
            Some(node) => self.compile(node)?,
            None => Block::empty(),
        };
        Block::construct_conditional(header, otherwise, then, true)
    }

    // =========================================================================
    // Functions
    // =========================================================================

    fn call(&self, children: Vec<Node>, discard: bool) -> Result<Block> {
        let mut children = children.into_iter();
        let callee = children.next().ok_or_else(|| {
            CompileError::malformed_with_hint("call", 0, "a call needs a callee")
        })?;

        let callee = self.compile(callee)?;
        if callee.height != 2 {
            return Err(CompileError::StackShape {
                construct: "call".to_string(),
                expected: "callee height 2".to_string(),
                height: callee.height,
                depth: callee.depth,
                hint: Some("load the callee in call position so its receiver slot is reserved".to_string()),
            });
        }

        let mut argc = 0;
        let mut args = Block::empty();
        for arg in children {
            let arg = self.compile(arg)?;
            if arg.height <= 0 {
                return Err(CompileError::shape(
                    "call argument",
                    "height > 0",
                    arg.height,
                    arg.depth,
                ));
            }
            args = args.then(arg)?;
            argc += 1;
        }

        let block = callee.then(args)?.then(Block::raw(CALL, count(argc)?)?)?;
        if discard {
            block.then(Block::raw(POP_TOP, 0)?)
        } else {
            Ok(block)
        }
    }

    /// Compile, resolve and assemble a nested function, then build the
    /// instructions that create it at runtime.
    fn function(
        &self,
        args: Vec<String>,
        name: String,
        captures: Vec<String>,
        body: Node,
    ) -> Result<Block> {
        let entry = if captures.is_empty() {
            Block::raw(RESUME, 0)?
        } else {
            Block::raw(COPY_FREE_VARS, count(captures.len())?)?.then(Block::raw(RESUME, 0)?)?
        };

        let mut body = entry.then(self.compile(body)?)?;
        if body.height != 1 || body.depth < 0 {
            return Err(CompileError::StackShape {
                construct: format!("function '{}'", name),
                expected: "height 1 and depth >= 0".to_string(),
                height: body.height,
                depth: body.depth,
                hint: Some("a function body must leave exactly its return value".to_string()),
            });
        }
        body.args = args;
        body.cells = captures.clone();

        let code = assemble(resolve(body)?, &name, self.config)?;
        debug!(
            name = %code.name,
            argcount = code.argcount,
            captures = captures.len(),
            stacksize = code.stacksize,
            "assembled nested function"
        );

        let mut block = Block::empty();
        if !captures.is_empty() {
            for captured in &captures {
                let load = Operand::Var(Variable::local(captured.clone()));
                block = block.then(Block::from_instruction(LOAD_FAST, load)?)?;
            }
            block = block.then(Block::raw(BUILD_TUPLE, count(captures.len())?)?)?;
            for captured in &captures {
                let cell = Operand::Var(Variable::local(captured.clone()));
                block = block.then(Block::from_instruction(MAKE_CELL, cell)?)?;
            }
        }

        block = block
            .then(Block::from_instruction(
                LOAD_CONST,
                Operand::Const(Literal::Code(Box::new(code))),
            )?)?
            .then(Block::raw(MAKE_FUNCTION, 0)?)?;
        if !captures.is_empty() {
            block = block.then(Block::raw(SET_FUNCTION_ATTRIBUTE, FUNCTION_ATTR_CLOSURE)?)?;
        }

        block.cells = captures;
        Ok(block)
    }
}
