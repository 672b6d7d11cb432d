//! Dead code elimination pass.
//!
//! Removes instructions that compute values nobody reads. An instruction is
//! dead when:
//!
//! - it produces at least one output and every output is unused;
//! - it is pure: no observable effect, no runtime check, no control flow.
//!
//! Phis are ordinary pure instructions here. `iter` and `argument` define
//! values but are never removed: they describe the loop and the function's
//! interface rather than a computation.
//!
//! # Example
//!
//! Before:
//! ```text
//! $n$1 = numel A
//! $x$1 = 3
//! y = $x$1
//! ```
//!
//! After (if `y` and `$n$1` are unused):
//! ```text
//! (nothing)
//! ```
//!
//! Removing `y = $x$1` makes `$x$1` unused; the removal driver's rescan picks
//! it up on the next round, so chains of dead definitions disappear in one
//! run.
//!
//! Functions carrying
//! [`ASSUME_INDICES_IN_RANGE`](crate::analysis::FunctionProperties::ASSUME_INDICES_IN_RANGE)
//! also lose unused bounds-checked reads, since their only effect is a check
//! the user promised can not fail.

use crate::{
    analysis::{FunctionProperties, Instruction},
    compiler::{
        cache::AnalysisSet,
        removal::{Facts, InstructionRemovalPass, RemovalSite},
    },
    Result,
};

/// Dead code elimination pass.
pub struct DeadCodeEliminationPass;

impl Default for DeadCodeEliminationPass {
    fn default() -> Self {
        Self::new()
    }
}

impl DeadCodeEliminationPass {
    /// Creates a new dead code elimination pass.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    fn is_removable(instruction: &Instruction, facts: &Facts<'_>) -> bool {
        match instruction {
            Instruction::Iter { .. } | Instruction::Argument { .. } => false,
            Instruction::MatrixGet { .. } | Instruction::RangeGet { .. } => facts
                .body
                .has_property(FunctionProperties::ASSUME_INDICES_IN_RANGE),
            _ => !instruction.has_side_effects() && !instruction.is_ending(),
        }
    }
}

impl InstructionRemovalPass for DeadCodeEliminationPass {
    fn name(&self) -> &'static str {
        "dead_code_elimination"
    }

    fn can_eliminate(&self, instruction: &Instruction, facts: &Facts<'_>) -> bool {
        let outputs = instruction.outputs();
        !outputs.is_empty()
            && outputs.iter().all(|output| facts.usages.is_unused(output))
            && Self::is_removable(instruction, facts)
    }

    fn eliminate(&self, site: RemovalSite<'_>) -> Result<()> {
        site.remove();
        Ok(())
    }

    fn invalidates(&self) -> AnalysisSet {
        AnalysisSet::USAGES | AnalysisSet::SIZE_GROUPS
    }

    fn description(&self) -> &'static str {
        "Removes pure instructions whose outputs are never read"
    }
}
