//! Phi-merge representation.
//!
//! Phi nodes represent the merging of values at control flow join points. A
//! phi node `v3 = phi(#1:v1, #2:v2)` means:
//! - If control came from block `#1`, use value `v1`
//! - If control came from block `#2`, use value `v2`
//!
//! Phi nodes are evaluated "instantaneously" at the entry of a block and must
//! appear before every other instruction of that block (only line markers may
//! precede them).
//!
//! # Source blocks
//!
//! In the structured IR, a phi source is always a *block end*: the last block
//! of a (possibly nested) region whose control reaches the phi's owning block.
//! For a loop block, the sources are the block containing the `for` header and
//! the last block of the loop body. For the block after a branch, the sources
//! are the ends of the two arms.
//!
//! Storing value and source as a single [`PhiOperand`] makes the "equal number
//! of inputs and sources" invariant structural.

use std::{collections::HashMap, fmt};

use crate::analysis::ssa::BlockId;

/// A single incoming value of a phi node.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PhiOperand {
    /// The variable providing the value.
    value: String,
    /// The predecessor block this value arrives from.
    source: BlockId,
}

impl PhiOperand {
    /// Creates a new phi operand.
    ///
    /// # Arguments
    ///
    /// * `value` - The variable providing the value
    /// * `source` - The predecessor block the value comes from
    #[must_use]
    pub fn new(value: impl Into<String>, source: BlockId) -> Self {
        PhiOperand {
            value: value.into(),
            source,
        }
    }

    /// Returns the variable providing the value.
    #[must_use]
    pub fn value(&self) -> &str {
        &self.value
    }

    /// Returns the predecessor block.
    #[must_use]
    pub const fn source(&self) -> BlockId {
        self.source
    }
}

impl fmt::Display for PhiOperand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.source, self.value)
    }
}

/// A phi node that merges values at a control flow join point.
#[derive(Debug, Clone, PartialEq)]
pub struct PhiNode {
    /// The variable defined by this phi node.
    output: String,
    /// Operands, one per predecessor.
    operands: Vec<PhiOperand>,
}

impl PhiNode {
    /// Creates a phi node from parallel value/source lists.
    ///
    /// # Arguments
    ///
    /// * `output` - The variable defined by the phi
    /// * `inputs` - Incoming values
    /// * `sources` - Predecessor blocks, parallel to `inputs`
    ///
    /// # Panics
    ///
    /// Panics if `inputs` and `sources` differ in length; that is an internal
    /// invariant violation of whoever built the phi.
    #[must_use]
    pub fn new(output: impl Into<String>, inputs: Vec<String>, sources: Vec<BlockId>) -> Self {
        assert_eq!(
            inputs.len(),
            sources.len(),
            "phi inputs and sources must have equal length"
        );

        PhiNode {
            output: output.into(),
            operands: inputs
                .into_iter()
                .zip(sources)
                .map(|(value, source)| PhiOperand { value, source })
                .collect(),
        }
    }

    /// Returns the variable defined by this phi.
    #[must_use]
    pub fn output(&self) -> &str {
        &self.output
    }

    /// Returns all operands.
    #[must_use]
    pub fn operands(&self) -> &[PhiOperand] {
        &self.operands
    }

    /// Returns the incoming values in operand order.
    pub fn inputs(&self) -> impl Iterator<Item = &str> + '_ {
        self.operands.iter().map(PhiOperand::value)
    }

    /// Returns the predecessor blocks in operand order.
    pub fn sources(&self) -> impl Iterator<Item = BlockId> + '_ {
        self.operands.iter().map(PhiOperand::source)
    }

    /// Returns the number of operands.
    #[must_use]
    pub fn len(&self) -> usize {
        self.operands.len()
    }

    /// Returns `true` if the phi has no operands.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.operands.is_empty()
    }

    /// Returns the value arriving from `source`, if any.
    #[must_use]
    pub fn input_from(&self, source: BlockId) -> Option<&str> {
        self.operands
            .iter()
            .find(|op| op.source == source)
            .map(PhiOperand::value)
    }

    /// Returns `true` if the operand sources are exactly `{a, b}`.
    #[must_use]
    pub fn has_sources(&self, a: BlockId, b: BlockId) -> bool {
        self.operands.len() == 2
            && self.input_from(a).is_some()
            && self.input_from(b).is_some()
            && a != b
    }

    /// Adds an operand.
    pub fn add_operand(&mut self, value: impl Into<String>, source: BlockId) {
        self.operands.push(PhiOperand::new(value, source));
    }

    /// Removes the operand arriving from `source`.
    ///
    /// # Returns
    ///
    /// `true` if an operand was removed.
    pub fn remove_source(&mut self, source: BlockId) -> bool {
        let before = self.operands.len();
        self.operands.retain(|op| op.source != source);
        self.operands.len() != before
    }

    /// Replaces variable names according to `map`.
    pub fn rename_variables(&mut self, map: &HashMap<String, String>) {
        if let Some(renamed) = map.get(&self.output) {
            self.output.clone_from(renamed);
        }
        for op in &mut self.operands {
            if let Some(renamed) = map.get(&op.value) {
                op.value.clone_from(renamed);
            }
        }
    }

    /// Replaces source blocks according to the parallel `old`/`new` lists.
    pub fn rename_blocks(&mut self, old: &[BlockId], new: &[BlockId]) {
        for op in &mut self.operands {
            if let Some(pos) = old.iter().position(|b| *b == op.source) {
                op.source = new[pos];
            }
        }
    }

    /// Updates sources after `original` was split into `original..=end`.
    ///
    /// Control that used to arrive from `original` now arrives from `end`.
    pub fn break_block(&mut self, original: BlockId, end: BlockId) {
        for op in &mut self.operands {
            if op.source == original {
                op.source = end;
            }
        }
    }
}

impl fmt::Display for PhiNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} = phi ", self.output)?;
        for (i, op) in self.operands.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", op)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn phi() -> PhiNode {
        PhiNode::new(
            "x$3",
            vec!["x$1".into(), "x$2".into()],
            vec![BlockId::new(0), BlockId::new(2)],
        )
    }

    #[test]
    fn test_phi_operands() {
        let phi = phi();
        assert_eq!(phi.output(), "x$3");
        assert_eq!(phi.len(), 2);
        assert_eq!(phi.input_from(BlockId::new(2)), Some("x$2"));
        assert_eq!(phi.input_from(BlockId::new(1)), None);
        assert!(phi.has_sources(BlockId::new(2), BlockId::new(0)));
    }

    #[test]
    #[should_panic]
    fn test_phi_length_mismatch() {
        let _ = PhiNode::new("x", vec!["a".into()], vec![]);
    }

    #[test]
    fn test_phi_rename_blocks() {
        let mut phi = phi();
        phi.rename_blocks(&[BlockId::new(2)], &[BlockId::new(5)]);
        assert_eq!(phi.input_from(BlockId::new(5)), Some("x$2"));
        phi.break_block(BlockId::new(0), BlockId::new(7));
        assert_eq!(phi.input_from(BlockId::new(7)), Some("x$1"));
    }

    #[test]
    fn test_phi_rename_variables() {
        let mut phi = phi();
        let map = HashMap::from([("x$1".to_string(), "y$1".to_string())]);
        phi.rename_variables(&map);
        assert_eq!(phi.input_from(BlockId::new(0)), Some("y$1"));
        assert_eq!(phi.output(), "x$3");
    }

    #[test]
    fn test_phi_display() {
        assert_eq!(phi().to_string(), "x$3 = phi #0:x$1, #2:x$2");
    }
}
