//! Function bodies: the block arena plus function-level metadata.
//!
//! A [`FunctionBody`] is the unit every pass operates on. It owns the block
//! table (`Vec<SsaBlock>` addressed by [`BlockId`]) and the declared
//! [`FunctionProperties`] that let user annotations switch off
//! safety-generating rewrites.
//!
//! # Structure
//!
//! ```text
//! FunctionBody
//! ├── name: String
//! ├── blocks: Vec<SsaBlock>           // #0 is the entry block
//! ├── properties: FunctionProperties  // declared assumptions
//! └── skip_passes: BTreeSet<String>   // pass-specific opt-outs
//! ```
//!
//! # Block renumbering
//!
//! Blocks are referenced by index from control transfers and phi sources.
//! [`FunctionBody::remove_and_rename_blocks`] is the only operation that
//! removes blocks, and it rewrites every such reference atomically.

use std::{
    collections::{BTreeSet, HashMap, HashSet},
    fmt,
};

use bitflags::bitflags;

use crate::{
    analysis::ssa::{BlockId, Instruction, SsaBlock},
    Error, Result,
};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    /// Declared assumptions of a function.
    pub struct FunctionProperties: u32 {
        /// Matrices combined element-wise are assumed to have equal sizes.
        const ASSUME_MATRIX_SIZES_MATCH = 0x0001;
        /// Every matrix index is assumed to be within range.
        const ASSUME_INDICES_IN_RANGE = 0x0002;
        /// Loop nests should be ordered for column-major traversal.
        const PREFER_COLUMN_MAJOR = 0x0004;
    }
}

/// Position of an instruction inside a function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstructionLocation {
    /// Owning block
    pub block: BlockId,
    /// Index inside the block
    pub index: usize,
}

impl InstructionLocation {
    /// Creates a new location.
    #[must_use]
    pub const fn new(block: BlockId, index: usize) -> Self {
        InstructionLocation { block, index }
    }
}

impl fmt::Display for InstructionLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.block, self.index)
    }
}

/// The SSA body of a single function.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FunctionBody {
    name: String,
    blocks: Vec<SsaBlock>,
    properties: FunctionProperties,
    skip_passes: BTreeSet<String>,
}

impl FunctionBody {
    /// Creates a body with a single empty entry block.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        FunctionBody {
            name: name.into(),
            blocks: vec![SsaBlock::new()],
            properties: FunctionProperties::empty(),
            skip_passes: BTreeSet::new(),
        }
    }

    /// Function name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// All blocks, indexed by [`BlockId`].
    #[must_use]
    pub fn blocks(&self) -> &[SsaBlock] {
        &self.blocks
    }

    /// Number of blocks.
    #[must_use]
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Iterates over `(id, block)` pairs.
    pub fn iter_blocks(&self) -> impl Iterator<Item = (BlockId, &SsaBlock)> + '_ {
        self.blocks
            .iter()
            .enumerate()
            .map(|(i, b)| (BlockId::new(i), b))
    }

    /// Returns a block.
    #[must_use]
    pub fn block(&self, id: BlockId) -> Option<&SsaBlock> {
        self.blocks.get(id.index())
    }

    /// Returns a mutable block.
    pub fn block_mut(&mut self, id: BlockId) -> Option<&mut SsaBlock> {
        self.blocks.get_mut(id.index())
    }

    /// Returns a block or [`Error::BlockNotFound`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::BlockNotFound`] if `id` is out of range.
    pub fn try_block(&self, id: BlockId) -> Result<&SsaBlock> {
        self.blocks
            .get(id.index())
            .ok_or(Error::BlockNotFound(id.index()))
    }

    /// Returns a mutable block or [`Error::BlockNotFound`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::BlockNotFound`] if `id` is out of range.
    pub fn try_block_mut(&mut self, id: BlockId) -> Result<&mut SsaBlock> {
        self.blocks
            .get_mut(id.index())
            .ok_or(Error::BlockNotFound(id.index()))
    }

    /// Appends a block and returns its id.
    pub fn add_block(&mut self, block: SsaBlock) -> BlockId {
        self.blocks.push(block);
        BlockId::new(self.blocks.len() - 1)
    }

    /// Appends an empty block and returns its id.
    pub fn new_block(&mut self) -> BlockId {
        self.add_block(SsaBlock::new())
    }

    /// Declared function properties.
    #[must_use]
    pub const fn properties(&self) -> FunctionProperties {
        self.properties
    }

    /// Adds declared properties.
    pub fn add_properties(&mut self, properties: FunctionProperties) {
        self.properties |= properties;
    }

    /// Returns `true` if all of `properties` are declared.
    #[must_use]
    pub const fn has_property(&self, properties: FunctionProperties) -> bool {
        self.properties.contains(properties)
    }

    /// Opts the function out of a pass-specific behaviour.
    pub fn add_skip(&mut self, key: impl Into<String>) {
        self.skip_passes.insert(key.into());
    }

    /// Returns `true` if the function opted out of `key`.
    #[must_use]
    pub fn should_skip(&self, key: &str) -> bool {
        self.skip_passes.contains(key)
    }

    /// Iterates over every instruction with its location.
    pub fn iter_instructions(&self) -> impl Iterator<Item = (InstructionLocation, &Instruction)> {
        self.blocks.iter().enumerate().flat_map(|(b, block)| {
            block
                .instructions()
                .iter()
                .enumerate()
                .map(move |(i, inst)| (InstructionLocation::new(BlockId::new(b), i), inst))
        })
    }

    /// Returns the instruction at `location`.
    #[must_use]
    pub fn instruction_at(&self, location: InstructionLocation) -> Option<&Instruction> {
        self.block(location.block)?
            .instructions()
            .get(location.index)
    }

    /// Total number of instructions.
    #[must_use]
    pub fn instruction_count(&self) -> usize {
        self.blocks.iter().map(SsaBlock::len).sum()
    }

    /// Every variable written by some instruction.
    #[must_use]
    pub fn declared_variables(&self) -> HashSet<String> {
        self.iter_instructions()
            .flat_map(|(_, inst)| inst.outputs())
            .map(str::to_string)
            .collect()
    }

    /// Location of the instruction that writes `variable`.
    #[must_use]
    pub fn find_declaration(&self, variable: &str) -> Option<InstructionLocation> {
        self.iter_instructions()
            .find(|(_, inst)| inst.outputs().contains(&variable))
            .map(|(loc, _)| loc)
    }

    /// Follows nested control transfers from `block` to the block where
    /// control finally leaves the region that starts at `block`.
    ///
    /// A block without an ending instruction is its own end. A block ending in
    /// `for`/`while`/`branch` ends where that construct's end block ends.
    #[must_use]
    pub fn block_end(&self, block: BlockId) -> BlockId {
        let mut current = block;
        let mut steps = 0;
        while let Some(next) = self
            .block(current)
            .and_then(SsaBlock::ending_instruction)
            .and_then(Instruction::end_block)
        {
            current = next;
            steps += 1;
            if steps > self.blocks.len() {
                break;
            }
        }
        current
    }

    /// Substitutes variable names in the whole function.
    pub fn rename_variables(&mut self, map: &HashMap<String, String>) {
        if map.is_empty() {
            return;
        }
        for block in &mut self.blocks {
            block.rename_variables(map);
        }
    }

    /// Substitutes block references in the whole function.
    pub fn rename_blocks(&mut self, old: &[BlockId], new: &[BlockId]) {
        debug_assert_eq!(old.len(), new.len());
        for block in &mut self.blocks {
            block.rename_blocks(old, new);
        }
    }

    /// Records that `original` was split: control now leaves through `end`.
    ///
    /// Every phi that listed `original` as a source is redirected to `end`.
    pub fn break_block(&mut self, original: BlockId, end: BlockId) {
        for block in &mut self.blocks {
            block.break_block(original, end);
        }
    }

    /// Removes blocks and renumbers all remaining ones in a single step.
    ///
    /// Surviving blocks keep their relative order. Every owned-block reference
    /// and every phi source is rewritten to the new numbering; phi operands
    /// whose source block was removed are dropped.
    ///
    /// # Arguments
    ///
    /// * `removed` - Blocks to delete. The entry block cannot be removed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BlockNotFound`] for an out-of-range id and
    /// [`Error::Malformed`] when asked to remove the entry block or when a
    /// surviving control transfer still owns a removed block.
    pub fn remove_and_rename_blocks(&mut self, removed: &[BlockId]) -> Result<()> {
        let removed: HashSet<BlockId> = removed.iter().copied().collect();
        if removed.is_empty() {
            return Ok(());
        }
        if removed.contains(&BlockId::ENTRY) {
            return Err(malformed_error!("The entry block cannot be removed"));
        }
        if let Some(bad) = removed.iter().find(|b| b.index() >= self.blocks.len()) {
            return Err(Error::BlockNotFound(bad.index()));
        }

        for (id, block) in self.iter_blocks() {
            if removed.contains(&id) {
                continue;
            }
            for instruction in block.instructions() {
                if let Some(owned) = instruction
                    .owned_blocks()
                    .into_iter()
                    .find(|b| removed.contains(b))
                {
                    return Err(malformed_error!(
                        "Block {} is removed but still owned by '{}'",
                        owned,
                        instruction
                    ));
                }
            }
        }

        let mut mapping: HashMap<BlockId, BlockId> = HashMap::new();
        let mut next = 0;
        for index in 0..self.blocks.len() {
            let id = BlockId::new(index);
            if !removed.contains(&id) {
                mapping.insert(id, BlockId::new(next));
                next += 1;
            }
        }

        let old_blocks = std::mem::take(&mut self.blocks);
        for (index, mut block) in old_blocks.into_iter().enumerate() {
            if removed.contains(&BlockId::new(index)) {
                continue;
            }

            for instruction in block.instructions_mut() {
                if let Instruction::Phi(phi) = instruction {
                    for gone in &removed {
                        phi.remove_source(*gone);
                    }
                }
            }

            self.blocks.push(block);
        }

        let (old, new): (Vec<BlockId>, Vec<BlockId>) =
            mapping.into_iter().filter(|(o, n)| o != n).unzip();
        self.rename_blocks(&old, &new);

        Ok(())
    }
}

impl fmt::Display for FunctionBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Function {}", self.name)?;
        for (id, block) in self.iter_blocks() {
            writeln!(f, "block {}:", id)?;
            write!(f, "{}", block)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::ssa::{ForLoop, PhiNode};

    fn b(id: usize) -> BlockId {
        BlockId::new(id)
    }

    /// #0: for -> #1, #2 ; #1: empty ; #2: phi(#0, #1)
    fn loop_body() -> FunctionBody {
        let mut body = FunctionBody::new("f");
        let l = body.new_block();
        let e = body.new_block();
        body.block_mut(BlockId::ENTRY)
            .unwrap()
            .add_instruction(Instruction::For(ForLoop::new("s", "i", "n", l, e)));
        body.block_mut(e)
            .unwrap()
            .add_instruction(Instruction::Phi(PhiNode::new(
                "x$2",
                vec!["x$1".into(), "x$3".into()],
                vec![BlockId::ENTRY, l],
            )));
        body
    }

    #[test]
    fn test_block_end() {
        let body = loop_body();
        assert_eq!(body.block_end(b(0)), b(2));
        assert_eq!(body.block_end(b(1)), b(1));
    }

    #[test]
    fn test_remove_and_rename_blocks() {
        let mut body = loop_body();
        let extra = body.new_block();
        // move the contents so the unused block sits in the middle
        body.rename_blocks(&[b(2), extra], &[extra, b(2)]);
        let moved = std::mem::take(body.block_mut(b(2)).unwrap());
        *body.block_mut(extra).unwrap() = moved;

        body.remove_and_rename_blocks(&[b(2)]).unwrap();

        assert_eq!(body.block_count(), 3);
        let header = body.block(b(0)).unwrap().ending_instruction().unwrap();
        assert_eq!(header.owned_blocks(), vec![b(1), b(2)]);
        let phi = body.block(b(2)).unwrap().phis().next().unwrap();
        assert_eq!(phi.input_from(b(1)), Some("x$3"));
    }

    #[test]
    fn test_remove_owned_block_fails() {
        let mut body = loop_body();
        assert!(body.remove_and_rename_blocks(&[b(1)]).is_err());
        assert!(body.remove_and_rename_blocks(&[b(0)]).is_err());
        assert!(matches!(
            body.remove_and_rename_blocks(&[b(9)]),
            Err(Error::BlockNotFound(9))
        ));
    }

    #[test]
    fn test_properties() {
        let mut body = FunctionBody::new("f");
        assert!(!body.has_property(FunctionProperties::ASSUME_MATRIX_SIZES_MATCH));
        body.add_properties(FunctionProperties::ASSUME_MATRIX_SIZES_MATCH);
        assert!(body.has_property(FunctionProperties::ASSUME_MATRIX_SIZES_MATCH));
        body.add_skip("loop_fusion_only_related");
        assert!(body.should_skip("loop_fusion_only_related"));
    }

    #[test]
    fn test_find_declaration() {
        let body = loop_body();
        let loc = body.find_declaration("x$2").unwrap();
        assert_eq!(loc, InstructionLocation::new(b(2), 0));
        assert!(body.find_declaration("nope").is_none());
    }
}
