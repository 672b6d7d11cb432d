//! Def-use information for SSA functions.
//!
//! This module provides two views over the variables of a [`FunctionBody`]:
//!
//! - [`UsageMap`]: how many times each variable is read. This is the cheap
//!   legality precondition most passes need ("is this value used anywhere
//!   else?"). Every operand occurrence counts, so `plus x, x` reads `x` twice.
//! - [`DefUseIndex`]: full definition and use sites by [`InstructionLocation`],
//!   for passes that need to walk from a variable to the instructions that
//!   produce or consume it.
//!
//! # Basic Usage
//!
//! ```rust,ignore
//! use matopt::analysis::{DefUseIndex, UsageMap};
//!
//! let usages = UsageMap::build(&body);
//! if usages.usage_count("x$1") == 0 {
//!     // x$1 is dead
//! }
//!
//! let index = DefUseIndex::build(&body);
//! if let Some(def) = index.definition("x$1") {
//!     println!("x$1 defined at {}", def);
//! }
//! ```
//!
//! Both structures are snapshots; they must be rebuilt (or invalidated through
//! the analysis cache) after the function is rewritten.

use std::collections::{HashMap, HashSet};

use crate::analysis::ssa::{BlockId, FunctionBody, Instruction, InstructionLocation};

/// Read counts per variable.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UsageMap {
    counts: HashMap<String, usize>,
}

impl UsageMap {
    /// Counts every operand occurrence in `body`.
    #[must_use]
    pub fn build(body: &FunctionBody) -> Self {
        let mut map = UsageMap::default();
        for (_, instruction) in body.iter_instructions() {
            map.add_instruction(instruction);
        }
        map
    }

    /// Number of reads of `variable`.
    #[must_use]
    pub fn usage_count(&self, variable: &str) -> usize {
        self.counts.get(variable).copied().unwrap_or(0)
    }

    /// Returns `true` if `variable` is never read.
    #[must_use]
    pub fn is_unused(&self, variable: &str) -> bool {
        self.usage_count(variable) == 0
    }

    /// Accounts for the reads of a newly inserted instruction.
    pub fn add_instruction(&mut self, instruction: &Instruction) {
        for input in instruction.inputs() {
            *self.counts.entry(input.to_string()).or_insert(0) += 1;
        }
    }

    /// Accounts for the reads of a removed instruction.
    pub fn remove_instruction(&mut self, instruction: &Instruction) {
        for input in instruction.inputs() {
            if let Some(count) = self.counts.get_mut(input) {
                *count = count.saturating_sub(1);
            }
        }
    }
}

/// Index for def-use queries on a function.
///
/// Built once from a [`FunctionBody`], it provides O(1) access to the
/// definition site of a variable and O(k) access to its use sites.
#[derive(Debug, Clone, Default)]
pub struct DefUseIndex {
    /// Variable to its single definition site.
    definitions: HashMap<String, InstructionLocation>,

    /// Variable to every location reading it (once per instruction).
    uses: HashMap<String, Vec<InstructionLocation>>,

    /// Location to variables defined there.
    defs_at_location: HashMap<InstructionLocation, Vec<String>>,

    /// Variables defined by phi nodes.
    phi_defs: HashSet<String>,

    /// Variables defined more than once. Non-empty only for invalid SSA.
    redefined: HashSet<String>,
}

impl DefUseIndex {
    /// Builds the index.
    ///
    /// # Arguments
    ///
    /// * `body` - The function to index.
    #[must_use]
    pub fn build(body: &FunctionBody) -> Self {
        let mut index = DefUseIndex::default();

        for (location, instruction) in body.iter_instructions() {
            for output in instruction.outputs() {
                if index
                    .definitions
                    .insert(output.to_string(), location)
                    .is_some()
                {
                    index.redefined.insert(output.to_string());
                }
                index
                    .defs_at_location
                    .entry(location)
                    .or_default()
                    .push(output.to_string());
                if matches!(instruction, Instruction::Phi(_)) {
                    index.phi_defs.insert(output.to_string());
                }
            }

            let mut seen = HashSet::new();
            for input in instruction.inputs() {
                if seen.insert(input) {
                    index
                        .uses
                        .entry(input.to_string())
                        .or_default()
                        .push(location);
                }
            }
        }

        index
    }

    /// Definition site of `variable`.
    #[must_use]
    pub fn definition(&self, variable: &str) -> Option<InstructionLocation> {
        self.definitions.get(variable).copied()
    }

    /// Locations that read `variable`.
    #[must_use]
    pub fn uses_of(&self, variable: &str) -> &[InstructionLocation] {
        self.uses.get(variable).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Number of instructions that read `variable`.
    #[must_use]
    pub fn use_count(&self, variable: &str) -> usize {
        self.uses_of(variable).len()
    }

    /// Returns `true` if the variable is defined and never read.
    #[must_use]
    pub fn is_unused(&self, variable: &str) -> bool {
        self.definitions.contains_key(variable) && self.use_count(variable) == 0
    }

    /// Variables defined at `location`.
    #[must_use]
    pub fn defs_at(&self, location: InstructionLocation) -> &[String] {
        self.defs_at_location
            .get(&location)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Variables defined in `block`.
    pub fn defs_in_block(&self, block: BlockId) -> impl Iterator<Item = &str> + '_ {
        self.definitions
            .iter()
            .filter(move |(_, loc)| loc.block == block)
            .map(|(var, _)| var.as_str())
    }

    /// Returns `true` if `variable` is defined by a phi.
    #[must_use]
    pub fn is_phi_def(&self, variable: &str) -> bool {
        self.phi_defs.contains(variable)
    }

    /// Every defined variable with no reads.
    pub fn unused_variables(&self) -> impl Iterator<Item = &str> + '_ {
        self.definitions
            .keys()
            .filter(|v| !self.uses.contains_key(v.as_str()))
            .map(String::as_str)
    }

    /// Variables written by more than one instruction.
    #[must_use]
    pub fn redefined_variables(&self) -> &HashSet<String> {
        &self.redefined
    }

    /// Number of defined variables.
    #[must_use]
    pub fn variable_count(&self) -> usize {
        self.definitions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::ssa::{ForLoop, PhiNode, SsaBlock};

    fn body() -> FunctionBody {
        // #0: a = arg 0 ; b = plus a, a ; for a, a, b, #1, #2
        // #1: i = iter
        // #2: c = phi #0:a, #1:b
        let mut body = FunctionBody::new("f");
        let l = body.new_block();
        let e = body.new_block();
        *body.block_mut(BlockId::ENTRY).unwrap() = SsaBlock::from_instructions(vec![
            Instruction::Argument {
                output: "a".into(),
                index: 0,
            },
            Instruction::call("plus", vec!["b".into()], vec!["a".into(), "a".into()]),
            Instruction::For(ForLoop::new("a", "a", "b", l, e)),
        ]);
        body.block_mut(l)
            .unwrap()
            .add_instruction(Instruction::Iter { output: "i".into() });
        body.block_mut(e)
            .unwrap()
            .add_instruction(Instruction::Phi(PhiNode::new(
                "c",
                vec!["a".into(), "b".into()],
                vec![BlockId::ENTRY, l],
            )));
        body
    }

    #[test]
    fn test_usage_counts_every_operand() {
        let usages = UsageMap::build(&body());
        // plus a, a ; for a, a, b ; phi a
        assert_eq!(usages.usage_count("a"), 5);
        assert_eq!(usages.usage_count("b"), 2);
        assert!(usages.is_unused("c"));
        assert!(usages.is_unused("i"));
    }

    #[test]
    fn test_usage_incremental() {
        let mut usages = UsageMap::build(&body());
        let inst = Instruction::call("numel", vec!["n".into()], vec!["c".into()]);
        usages.add_instruction(&inst);
        assert_eq!(usages.usage_count("c"), 1);
        usages.remove_instruction(&inst);
        assert_eq!(usages.usage_count("c"), 0);
    }

    #[test]
    fn test_definitions() {
        let index = DefUseIndex::build(&body());
        assert_eq!(
            index.definition("b"),
            Some(InstructionLocation::new(BlockId::ENTRY, 1))
        );
        assert!(index.is_phi_def("c"));
        assert!(!index.is_phi_def("b"));
        assert_eq!(index.defs_at(InstructionLocation::new(BlockId::new(1), 0)), ["i"]);
        assert!(index.redefined_variables().is_empty());
    }

    #[test]
    fn test_uses_once_per_instruction() {
        let index = DefUseIndex::build(&body());
        assert_eq!(index.use_count("a"), 3);
        assert_eq!(index.use_count("b"), 2);
    }

    #[test]
    fn test_unused_variables() {
        let index = DefUseIndex::build(&body());
        let mut unused: Vec<&str> = index.unused_variables().collect();
        unused.sort_unstable();
        assert_eq!(unused, vec!["c", "i"]);
        assert!(index.is_unused("c"));
        assert!(!index.is_unused("undefined"));
    }

    #[test]
    fn test_redefinition_detected() {
        let mut body = FunctionBody::new("f");
        let entry = body.block_mut(BlockId::ENTRY).unwrap();
        entry.add_instruction(Instruction::assign_integer("x", 1));
        entry.add_instruction(Instruction::assign_integer("x", 2));
        let index = DefUseIndex::build(&body);
        assert!(index.redefined_variables().contains("x"));
    }
}
