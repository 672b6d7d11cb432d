//! Program analysis infrastructure for structured SSA functions.
//!
//! This module provides the program model and the analyses passes consult
//! before rewriting it.
//!
//! # Architecture
//!
//! - [`ssa`] - the SSA program model (instructions, blocks, functions, types)
//! - [`defuse`] - usage counts and def-use indices
//! - [`cfg`] - the control-flow relation implied by the block structure
//! - [`loops`] - conventional loop-variable analysis
//! - [`sizeinfo`] - symbolic size-group analysis
//! - [`validate`] - SSA invariant checking
//!
//! # Usage
//!
//! ```rust,ignore
//! use matopt::analysis::{validate, SizeGroupInformation, UsageMap};
//!
//! validate(&body)?;
//! let usages = UsageMap::build(&body);
//! let sizes = SizeGroupInformation::build(&body, &types);
//! ```
//!
//! Analyses are snapshots. Passes obtain them through the compiler's
//! analysis cache, which rebuilds them after a rewrite invalidates them.

pub mod cfg;
pub mod defuse;
pub mod loops;
pub mod sizeinfo;
pub mod ssa;
pub mod validate;

pub use cfg::StructuredCfg;
pub use defuse::{DefUseIndex, UsageMap};
pub use loops::{analyze_standard_loop, compute_conventional_variables, LoopVariable};
pub use sizeinfo::{ScalarValueInformation, SizeGroupBuilder, SizeGroupInformation};
pub use ssa::{
    AssignmentInput, BlockId, ForLoop, FunctionBody, FunctionProperties, Instruction,
    InstructionLocation, InstructionType, LoopProperty, MatrixType, NumericClass, PhiNode,
    PhiOperand, RangeIndex, ScalarType, SsaBlock, TypeProvider, TypeShape, VariableType,
    VariableTypes,
};
pub use validate::validate;
