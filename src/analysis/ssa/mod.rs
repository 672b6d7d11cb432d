//! Structured SSA form for type-inferred MATLAB functions.
//!
//! Every variable of a function is assigned exactly once. Control flow is not
//! expressed through explicit edges: a block ends with at most one *ending
//! instruction* (`for`, `while`, `branch`, `break`, `continue`) and the
//! `for`/`while`/`branch` instructions own the blocks they transfer control
//! to. Values merging at a join are selected by phi nodes whose sources are
//! always block ends (see [`FunctionBody::block_end`]).
//!
//! # Architecture
//!
//! - [`types`] - the minimal variable type model and the [`TypeProvider`]
//!   lookup service
//! - [`phi`] - phi nodes for control flow merges
//! - [`instruction`] - the closed instruction set
//! - [`block`] - blocks and block identifiers
//! - [`function`] - the function body and its block table
//! - [`utils`] - queries over regions of blocks
//!
//! # Example
//!
//! ```text
//! #0: n$1 = arg 0
//!     $one = 1
//!     for $one, $one, n$1, #1, #2
//! #1: x$2 = phi #0:x$1, #1:x$3
//!     i$1 = iter
//!     x$3 = plus x$2, i$1
//! #2: x$4 = phi #0:x$1, #1:x$3
//! ```

mod block;
mod function;
mod instruction;
mod phi;
mod types;
pub mod utils;

pub use block::{BlockId, SsaBlock};
pub use function::{FunctionBody, FunctionProperties, InstructionLocation};
pub use instruction::{
    is_side_effect_function, AssignmentInput, ForLoop, Instruction, InstructionType,
    LoopProperty, RangeIndex,
};
pub use phi::{PhiNode, PhiOperand};
pub use types::{
    MatrixType, NumericClass, ScalarType, TypeProvider, TypeShape, VariableType, VariableTypes,
};
