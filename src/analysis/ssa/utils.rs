//! Queries over regions of structured blocks.
//!
//! A *region* is a block together with every block it transitively owns
//! through control transfers. Block ownership is a tree: every block except
//! the entry is owned by exactly one instruction.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::analysis::ssa::{BlockId, FunctionBody, Instruction};

/// Every block in the region starting at `block`, in breadth-first order.
#[must_use]
pub fn contained_blocks(body: &FunctionBody, block: BlockId) -> Vec<BlockId> {
    let mut visited = HashSet::new();
    let mut order = Vec::new();
    let mut pending = VecDeque::from([block]);

    while let Some(current) = pending.pop_front() {
        if !visited.insert(current) {
            debug_assert!(false, "block {} owned by more than one block", current);
            continue;
        }
        order.push(current);

        if let Some(end) = body.block(current).and_then(|b| b.ending_instruction()) {
            pending.extend(end.owned_blocks());
        }
    }

    order
}

/// Returns `true` if any block in the region has side effects.
#[must_use]
pub fn has_nested_side_effects(body: &FunctionBody, block: BlockId) -> bool {
    contained_blocks(body, block)
        .into_iter()
        .filter_map(|b| body.block(b))
        .any(|b| b.has_side_effects())
}

/// A region is simple if it contains no `break` or `continue`.
#[must_use]
pub fn is_simple_section(body: &FunctionBody, block: BlockId) -> bool {
    contained_blocks(body, block)
        .into_iter()
        .filter_map(|b| body.block(b))
        .flat_map(|b| b.instructions())
        .all(|i| !matches!(i, Instruction::Break | Instruction::Continue))
}

/// Renames variables in every block of the region.
pub fn rename_variables_nested(
    body: &mut FunctionBody,
    block: BlockId,
    map: &HashMap<String, String>,
) {
    for id in contained_blocks(body, block) {
        if let Some(b) = body.block_mut(id) {
            b.rename_variables(map);
        }
    }
}

/// Variables written anywhere in the region.
#[must_use]
pub fn variables_declared_in_region(body: &FunctionBody, block: BlockId) -> HashSet<String> {
    contained_blocks(body, block)
        .into_iter()
        .filter_map(|b| body.block(b))
        .flat_map(|b| b.instructions())
        .flat_map(Instruction::outputs)
        .map(str::to_string)
        .collect()
}

/// Variables read anywhere in the region.
#[must_use]
pub fn variables_used_in_region(body: &FunctionBody, block: BlockId) -> HashSet<String> {
    contained_blocks(body, block)
        .into_iter()
        .filter_map(|b| body.block(b))
        .flat_map(|b| b.instructions())
        .flat_map(Instruction::inputs)
        .map(str::to_string)
        .collect()
}

/// Maps every block to the block whose ending instruction owns it.
#[must_use]
pub fn block_parents(body: &FunctionBody) -> HashMap<BlockId, BlockId> {
    let mut parents = HashMap::new();
    for (id, block) in body.iter_blocks() {
        if let Some(end) = block.ending_instruction() {
            for owned in end.owned_blocks() {
                parents.insert(owned, id);
            }
        }
    }
    parents
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::ssa::ForLoop;

    fn nested() -> FunctionBody {
        // #0: for #1, #2
        // #1: x = disp ; for #3, #4
        // #3: break
        let mut body = FunctionBody::new("f");
        let l1 = body.new_block();
        let e1 = body.new_block();
        let l2 = body.new_block();
        let e2 = body.new_block();
        body.block_mut(BlockId::ENTRY)
            .unwrap()
            .add_instruction(Instruction::For(ForLoop::new("a", "b", "c", l1, e1)));
        let b1 = body.block_mut(l1).unwrap();
        b1.add_instruction(Instruction::call("disp", vec![], vec!["x".into()]));
        b1.add_instruction(Instruction::For(ForLoop::new("a", "b", "c", l2, e2)));
        body.block_mut(l2).unwrap().add_instruction(Instruction::Break);
        body
    }

    #[test]
    fn test_contained_blocks() {
        let body = nested();
        let blocks = contained_blocks(&body, BlockId::new(1));
        assert_eq!(blocks, vec![BlockId::new(1), BlockId::new(3), BlockId::new(4)]);
    }

    #[test]
    fn test_side_effects_and_simple() {
        let body = nested();
        assert!(has_nested_side_effects(&body, BlockId::ENTRY));
        assert!(!has_nested_side_effects(&body, BlockId::new(3)));
        assert!(!is_simple_section(&body, BlockId::new(1)));
        assert!(is_simple_section(&body, BlockId::new(2)));
    }

    #[test]
    fn test_block_parents() {
        let body = nested();
        let parents = block_parents(&body);
        assert_eq!(parents.get(&BlockId::new(3)), Some(&BlockId::new(1)));
        assert_eq!(parents.get(&BlockId::ENTRY), None);
    }
}
