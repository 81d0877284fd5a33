//! # Program tree
//!
//! The tree handed to the compiler by the parser, and the literal values it
//! can carry.
//!
//! ## Conventions
//!
//! - Children are operands in evaluation order.
//! - A value-producing child leaves exactly one new stack slot.

pub mod node;
pub mod value;
