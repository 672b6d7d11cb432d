//! Built-in SSA optimization passes.
//!
//! Each pass operates on one [`TypedFunction`](crate::compiler::TypedFunction)
//! at a time and records what it did in the context's
//! [`EventLog`](crate::compiler::EventLog).
//!
//! # Pipeline Order
//!
//! The [`PassScheduler`](crate::compiler::PassScheduler) runs the passes in a
//! fixed order:
//!
//! | Pass | Description |
//! |------|-------------|
//! | [`SsaValidatorPass`] | Checks SSA invariants (`initial`) |
//! | [`DeadCodeEliminationPass`] | Removes pure instructions whose results are unused |
//! | [`ColonEliminationPass`] | Replaces `colon` calls by loops or copies |
//! | [`VerticalFlattenEliminationPass`] | Replaces `A(:)` by a copy or a linear copy loop |
//! | [`DeadCodeEliminationPass`] | Cleans up after the rewrites |
//! | [`AllocationValueEliminationPass`] | Drops initializers of fully overwritten allocations |
//! | [`SsaValidatorPass`] | Checks SSA invariants (`mid`) |
//! | [`LoopInterchangePass`] | Reorders perfectly nested loops to match access order |
//! | [`LoopFusionPass`] | Merges adjacent loops with compatible iteration spaces |
//! | [`DeadCodeEliminationPass`] | Removes what fusion left unused |
//! | [`SsaValidatorPass`] | Checks SSA invariants (`final`) |
//!
//! The element-wise rewrites (dead code, colon, flatten) implement
//! [`InstructionRemovalPass`](crate::compiler::InstructionRemovalPass) or
//! [`SizeAwareInstructionRemovalPass`](crate::compiler::SizeAwareInstructionRemovalPass)
//! and are scheduled through the matching removal driver.

mod allocvalue;
mod colon;
mod deadcode;
mod flatten;
mod fusion;
mod interchange;
mod validator;

pub use self::allocvalue::{AllocationValueEliminationPass, SKIP_ALIASING};
pub use self::colon::ColonEliminationPass;
pub use self::deadcode::DeadCodeEliminationPass;
pub use self::flatten::VerticalFlattenEliminationPass;
pub use self::fusion::{
    combine_loop_properties, describe_first_loop, AccessIndex, LoopFusionPass, LoopLevel,
    LoopNestDescription, MatrixAccessPattern, SKIP_ONLY_RELATED,
};
pub use self::interchange::{
    ColumnMajorInterchangeFormat, InterchangeFormat, LoopInterchangePass,
    MemoryInterchangeFormat,
};
pub use self::validator::SsaValidatorPass;
