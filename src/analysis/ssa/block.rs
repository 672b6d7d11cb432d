//! SSA blocks and block identifiers.
//!
//! A block is an ordered list of instructions. Phi nodes come first (only line
//! markers and decorators may precede them), followed by straight-line code,
//! optionally terminated by a single *ending* instruction (`for`, `while`,
//! `branch`, `break`, `continue`) that owns references to other blocks.
//!
//! # Block Structure
//!
//! ```text
//! #1:
//!   x$2 = phi #0:x$1, #1:x$3      // phis at block entry
//!   i$1 = iter
//!   x$3 = plus x$2, i$1           // straight-line code
//!   branch c$1, #2, #3, #4        // optional ending instruction
//! ```
//!
//! Blocks are addressed by [`BlockId`], their position in the owning function's
//! block table.

use std::{collections::HashMap, fmt};

use crate::analysis::ssa::{Instruction, InstructionType, PhiNode};

/// Strongly-typed index of a block in a function's block table.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockId(pub(crate) usize);

impl BlockId {
    /// The function entry block.
    pub const ENTRY: BlockId = BlockId(0);

    /// Creates a new `BlockId` from a raw index.
    #[must_use]
    #[inline]
    pub const fn new(index: usize) -> Self {
        BlockId(index)
    }

    /// Returns the raw index.
    #[must_use]
    #[inline]
    pub const fn index(self) -> usize {
        self.0
    }
}

impl fmt::Debug for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockId({})", self.0)
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl From<usize> for BlockId {
    #[inline]
    fn from(index: usize) -> Self {
        BlockId(index)
    }
}

impl From<BlockId> for usize {
    #[inline]
    fn from(block: BlockId) -> Self {
        block.0
    }
}

/// An SSA block.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SsaBlock {
    instructions: Vec<Instruction>,
}

impl SsaBlock {
    /// Creates a new empty block.
    #[must_use]
    pub fn new() -> Self {
        SsaBlock::default()
    }

    /// Creates a block from a list of instructions.
    #[must_use]
    pub fn from_instructions(instructions: Vec<Instruction>) -> Self {
        SsaBlock { instructions }
    }

    /// Instructions in execution order.
    #[must_use]
    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    /// Mutable access to the instruction list.
    pub fn instructions_mut(&mut self) -> &mut Vec<Instruction> {
        &mut self.instructions
    }

    /// Number of instructions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    /// Returns `true` if the block has no instructions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    /// Appends an instruction.
    pub fn add_instruction(&mut self, instruction: Instruction) {
        self.instructions.push(instruction);
    }

    /// Appends several instructions.
    pub fn add_instructions(&mut self, instructions: impl IntoIterator<Item = Instruction>) {
        self.instructions.extend(instructions);
    }

    /// Inserts an instruction at `index`.
    pub fn insert_instruction(&mut self, index: usize, instruction: Instruction) {
        self.instructions.insert(index, instruction);
    }

    /// Inserts an instruction at the start of the block.
    pub fn prepend_instruction(&mut self, instruction: Instruction) {
        self.instructions.insert(0, instruction);
    }

    /// Inserts several instructions at `index`, preserving their order.
    pub fn insert_instructions(
        &mut self,
        index: usize,
        instructions: impl IntoIterator<Item = Instruction>,
    ) {
        let tail = self.instructions.split_off(index);
        self.instructions.extend(instructions);
        self.instructions.extend(tail);
    }

    /// Removes and returns the instruction at `index`.
    pub fn remove_instruction(&mut self, index: usize) -> Instruction {
        self.instructions.remove(index)
    }

    /// Removes and returns all instructions from `index` onwards.
    pub fn split_off(&mut self, index: usize) -> Vec<Instruction> {
        self.instructions.split_off(index)
    }

    /// Removes every instruction.
    pub fn clear(&mut self) {
        self.instructions.clear();
    }

    /// Returns the trailing control transfer, if any.
    #[must_use]
    pub fn ending_instruction(&self) -> Option<&Instruction> {
        self.instructions.last().filter(|i| i.is_ending())
    }

    /// Mutable access to the trailing control transfer, if any.
    pub fn ending_instruction_mut(&mut self) -> Option<&mut Instruction> {
        self.instructions.last_mut().filter(|i| i.is_ending())
    }

    /// Returns `true` if the block ends with a control transfer.
    #[must_use]
    pub fn has_ending_instruction(&self) -> bool {
        self.ending_instruction().is_some()
    }

    /// Returns `true` if any instruction has side effects.
    #[must_use]
    pub fn has_side_effects(&self) -> bool {
        self.instructions.iter().any(Instruction::has_side_effects)
    }

    /// Returns `true` if any instruction reads `variable`.
    #[must_use]
    pub fn uses_variable(&self, variable: &str) -> bool {
        self.instructions.iter().any(|i| i.uses(variable))
    }

    /// Leading phi nodes.
    ///
    /// Line markers and decorators between phis are skipped; the scan stops at
    /// the first other instruction.
    pub fn phis(&self) -> impl Iterator<Item = &PhiNode> + '_ {
        self.instructions
            .iter()
            .take_while(|i| {
                matches!(i, Instruction::Phi(_))
                    || matches!(
                        i.instruction_type(),
                        InstructionType::Line | InstructionType::Decorator
                    )
            })
            .filter_map(Instruction::as_phi)
    }

    /// Index right after the last leading phi.
    ///
    /// Inserting at this position keeps all phis at the block entry.
    #[must_use]
    pub fn after_phi_insertion_point(&self) -> usize {
        let mut last_phi = None;
        for (index, instruction) in self.instructions.iter().enumerate() {
            if matches!(instruction, Instruction::Phi(_)) {
                last_phi = Some(index);
                continue;
            }
            if !matches!(
                instruction.instruction_type(),
                InstructionType::Line | InstructionType::Decorator
            ) {
                break;
            }
        }
        last_phi.map_or(0, |i| i + 1)
    }

    /// Substitutes variable names in every instruction.
    pub fn rename_variables(&mut self, map: &HashMap<String, String>) {
        for instruction in &mut self.instructions {
            instruction.rename_variables(map);
        }
    }

    /// Substitutes block references in every instruction.
    pub fn rename_blocks(&mut self, old: &[BlockId], new: &[BlockId]) {
        for instruction in &mut self.instructions {
            instruction.rename_blocks(old, new);
        }
    }

    /// Redirects phi sources from `original` to `end`.
    pub fn break_block(&mut self, original: BlockId, end: BlockId) {
        for instruction in &mut self.instructions {
            instruction.break_block(original, end);
        }
    }
}

impl fmt::Display for SsaBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for instruction in &self.instructions {
            writeln!(f, "  {}", instruction)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::ssa::ForLoop;

    fn phi(out: &str) -> Instruction {
        Instruction::Phi(PhiNode::new(
            out,
            vec!["a".into(), "b".into()],
            vec![BlockId::new(0), BlockId::new(1)],
        ))
    }

    #[test]
    fn test_block_id() {
        let id = BlockId::new(3);
        assert_eq!(id.index(), 3);
        assert_eq!(id.to_string(), "#3");
        assert_eq!(usize::from(id), 3);
        assert!(BlockId::new(1) < BlockId::new(2));
    }

    #[test]
    fn test_ending_instruction() {
        let mut block = SsaBlock::new();
        block.add_instruction(Instruction::assign_integer("x", 1));
        assert!(block.ending_instruction().is_none());

        block.add_instruction(Instruction::For(ForLoop::new(
            "s",
            "i",
            "e",
            BlockId::new(1),
            BlockId::new(2),
        )));
        assert!(block.has_ending_instruction());
    }

    #[test]
    fn test_after_phi_insertion_point() {
        let mut block = SsaBlock::new();
        assert_eq!(block.after_phi_insertion_point(), 0);

        block.add_instruction(Instruction::Line { line: 3 });
        block.add_instruction(phi("x"));
        block.add_instruction(phi("y"));
        block.add_instruction(Instruction::assign_integer("z", 1));
        block.add_instruction(phi("w"));

        assert_eq!(block.after_phi_insertion_point(), 3);
        assert_eq!(block.phis().count(), 2);
    }

    #[test]
    fn test_insert_instructions() {
        let mut block = SsaBlock::from_instructions(vec![
            Instruction::assign_integer("a", 1),
            Instruction::assign_integer("d", 4),
        ]);
        block.insert_instructions(
            1,
            vec![
                Instruction::assign_integer("b", 2),
                Instruction::assign_integer("c", 3),
            ],
        );
        let outputs: Vec<&str> = block
            .instructions()
            .iter()
            .flat_map(Instruction::outputs)
            .collect();
        assert_eq!(outputs, vec!["a", "b", "c", "d"]);
    }
}
