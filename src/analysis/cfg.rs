//! Control-flow view of a structured function body.
//!
//! The IR does not store explicit edges: control flow is implied by the
//! ending instructions of blocks and the regions they own. This module
//! derives the predecessor/successor relation from that structure.
//!
//! # Edges
//!
//! ```text
//!   X: for s,i,e,#L,#E      X -> L, X -> E, end(L) -> L, end(L) -> E,
//!                           <break> -> E, <continue> -> L
//!   X: while #L,#E          X -> L, end(L) -> L, <break> -> E, <continue> -> L
//!   X: branch c,#T,#F,#E    X -> T, X -> F, end(T) -> E, end(F) -> E
//! ```
//!
//! `end(B)` is [`FunctionBody::block_end`]. A region whose end block leaves
//! through `break` or `continue` does not fall through to the construct's end.
//!
//! The resulting relation is exactly what phi source lists must match.

use std::collections::BTreeSet;

use crate::analysis::ssa::{utils::contained_blocks, BlockId, FunctionBody, Instruction};

/// Predecessor/successor relation of a function.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StructuredCfg {
    predecessors: Vec<BTreeSet<BlockId>>,
    successors: Vec<BTreeSet<BlockId>>,
}

fn falls_through(body: &FunctionBody, block: BlockId) -> bool {
    !matches!(
        body.block(block).and_then(|b| b.ending_instruction()),
        Some(Instruction::Break | Instruction::Continue)
    )
}

impl StructuredCfg {
    /// Derives the control-flow relation of `body`.
    #[must_use]
    pub fn build(body: &FunctionBody) -> Self {
        let count = body.block_count();
        let mut cfg = StructuredCfg {
            predecessors: vec![BTreeSet::new(); count],
            successors: vec![BTreeSet::new(); count],
        };

        for (id, block) in body.iter_blocks() {
            let Some(ending) = block.ending_instruction() else {
                continue;
            };

            match ending {
                Instruction::For(header) => {
                    let body_end = body.block_end(header.loop_block);
                    cfg.add_edge(id, header.loop_block);
                    cfg.add_edge(id, header.end_block);
                    if falls_through(body, body_end) {
                        cfg.add_edge(body_end, header.loop_block);
                        cfg.add_edge(body_end, header.end_block);
                    }
                    cfg.add_jumps(body, header.loop_block, header.end_block);
                }
                Instruction::While {
                    loop_block,
                    end_block,
                } => {
                    let body_end = body.block_end(*loop_block);
                    cfg.add_edge(id, *loop_block);
                    if falls_through(body, body_end) {
                        cfg.add_edge(body_end, *loop_block);
                    }
                    cfg.add_jumps(body, *loop_block, *end_block);
                }
                Instruction::Branch {
                    true_block,
                    false_block,
                    end_block,
                    ..
                } => {
                    cfg.add_edge(id, *true_block);
                    cfg.add_edge(id, *false_block);
                    for arm in [*true_block, *false_block] {
                        let arm_end = body.block_end(arm);
                        if falls_through(body, arm_end) {
                            cfg.add_edge(arm_end, *end_block);
                        }
                    }
                }
                _ => {}
            }
        }

        cfg
    }

    /// Routes the `break`/`continue` jumps of a loop body.
    fn add_jumps(&mut self, body: &FunctionBody, loop_block: BlockId, end_block: BlockId) {
        for jump in Self::loop_exits(body, loop_block) {
            match body.block(jump).and_then(|b| b.ending_instruction()) {
                Some(Instruction::Break) => self.add_edge(jump, end_block),
                Some(Instruction::Continue) => self.add_edge(jump, loop_block),
                _ => {}
            }
        }
    }

    /// Blocks inside a loop body ending in `break`/`continue` that belong
    /// to this loop (not to a nested loop).
    fn loop_exits(body: &FunctionBody, loop_block: BlockId) -> Vec<BlockId> {
        let nested: BTreeSet<BlockId> = contained_blocks(body, loop_block)
            .into_iter()
            .filter_map(|b| body.block(b)?.ending_instruction())
            .filter_map(|i| match i {
                Instruction::While { loop_block, .. } => Some(*loop_block),
                Instruction::For(header) => Some(header.loop_block),
                _ => None,
            })
            .flat_map(|inner| contained_blocks(body, inner))
            .collect();

        contained_blocks(body, loop_block)
            .into_iter()
            .filter(|b| !nested.contains(b))
            .filter(|b| {
                matches!(
                    body.block(*b).and_then(|blk| blk.ending_instruction()),
                    Some(Instruction::Break | Instruction::Continue)
                )
            })
            .collect()
    }

    fn add_edge(&mut self, from: BlockId, to: BlockId) {
        if from.index() < self.successors.len() && to.index() < self.predecessors.len() {
            self.successors[from.index()].insert(to);
            self.predecessors[to.index()].insert(from);
        }
    }

    /// Blocks that may transfer control into `block`.
    #[must_use]
    pub fn predecessors(&self, block: BlockId) -> Option<&BTreeSet<BlockId>> {
        self.predecessors.get(block.index())
    }

    /// Blocks `block` may transfer control to.
    #[must_use]
    pub fn successors(&self, block: BlockId) -> Option<&BTreeSet<BlockId>> {
        self.successors.get(block.index())
    }

    /// Number of blocks covered.
    #[must_use]
    pub fn block_count(&self) -> usize {
        self.predecessors.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::ssa::ForLoop;

    fn b(id: usize) -> BlockId {
        BlockId::new(id)
    }

    #[test]
    fn test_for_edges() {
        // #0: for #1, #2 ; #1: branch #3, #4, #5
        let mut body = FunctionBody::new("f");
        let l = body.new_block();
        let e = body.new_block();
        let t = body.new_block();
        let f = body.new_block();
        let j = body.new_block();
        body.block_mut(b(0))
            .unwrap()
            .add_instruction(Instruction::For(ForLoop::new("s", "i", "n", l, e)));
        body.block_mut(l).unwrap().add_instruction(Instruction::Branch {
            condition: "c".into(),
            true_block: t,
            false_block: f,
            end_block: j,
        });

        let cfg = StructuredCfg::build(&body);
        let preds: Vec<BlockId> = cfg.predecessors(l).unwrap().iter().copied().collect();
        assert_eq!(preds, vec![b(0), j]);
        let preds: Vec<BlockId> = cfg.predecessors(e).unwrap().iter().copied().collect();
        assert_eq!(preds, vec![b(0), j]);
        let preds: Vec<BlockId> = cfg.predecessors(j).unwrap().iter().copied().collect();
        assert_eq!(preds, vec![t, f]);
        assert!(cfg.successors(b(0)).unwrap().contains(&l));
    }

    #[test]
    fn test_while_break() {
        // #0: while #1, #2 ; #1: branch #3, #4, #5 ; #3: break
        let mut body = FunctionBody::new("f");
        let l = body.new_block();
        let e = body.new_block();
        let t = body.new_block();
        let f = body.new_block();
        let j = body.new_block();
        body.block_mut(b(0)).unwrap().add_instruction(Instruction::While {
            loop_block: l,
            end_block: e,
        });
        body.block_mut(l).unwrap().add_instruction(Instruction::Branch {
            condition: "c".into(),
            true_block: t,
            false_block: f,
            end_block: j,
        });
        body.block_mut(t).unwrap().add_instruction(Instruction::Break);

        let cfg = StructuredCfg::build(&body);
        let preds: Vec<BlockId> = cfg.predecessors(e).unwrap().iter().copied().collect();
        assert_eq!(preds, vec![t]);
        let preds: Vec<BlockId> = cfg.predecessors(j).unwrap().iter().copied().collect();
        assert_eq!(preds, vec![f]);
        let preds: Vec<BlockId> = cfg.predecessors(l).unwrap().iter().copied().collect();
        assert_eq!(preds, vec![b(0), j]);
    }
}
