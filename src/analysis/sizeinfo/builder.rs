//! Construction of [`SizeGroupInformation`] from a function body.
//!
//! The builder walks the structured program from the entry block, following
//! control transfers into the blocks they own:
//!
//! - `for`: the loop block is walked *speculatively* on a copy of the
//!   information, assuming every matrix carried by a two-operand loop phi
//!   keeps the size it had before the loop. After the walk each assumption is
//!   checked against the value reaching the back-edge; if any fails the copy
//!   is discarded and the loop is walked again without assumptions.
//! - `while`: the body and the end block are walked without assumptions.
//! - `branch`: both arms are walked, then the join.
//! - `iter`: bounded by the loop's start and end when the step is known to be
//!   positive.
//!
//! Every other instruction goes through
//! [`SizeGroupInformation::add_instruction_information`].

use crate::analysis::{
    sizeinfo::SizeGroupInformation,
    ssa::{BlockId, ForLoop, FunctionBody, Instruction, TypeProvider},
};

/// Bounds of the iteration variable of the loop being walked.
#[derive(Debug, Clone, Copy)]
struct LoopBounds<'a> {
    start: &'a str,
    end: &'a str,
}

/// Walks a function body and accumulates size information.
pub struct SizeGroupBuilder<'a> {
    body: &'a FunctionBody,
    types: &'a dyn TypeProvider,
}

impl<'a> SizeGroupBuilder<'a> {
    /// Creates a builder over `body`.
    #[must_use]
    pub fn new(body: &'a FunctionBody, types: &'a dyn TypeProvider) -> Self {
        SizeGroupBuilder { body, types }
    }

    /// Builds the size information of the whole function.
    #[must_use]
    pub fn build(&self) -> SizeGroupInformation {
        let mut info = SizeGroupInformation::new();
        for (_, instruction) in self.body.iter_instructions() {
            info.learn_types(
                self.types,
                instruction
                    .inputs()
                    .into_iter()
                    .chain(instruction.outputs()),
            );
        }
        self.build_block(BlockId::ENTRY, None, info)
    }

    fn build_block(
        &self,
        block: BlockId,
        bounds: Option<LoopBounds<'_>>,
        mut info: SizeGroupInformation,
    ) -> SizeGroupInformation {
        let Some(instructions) = self.body.block(block).map(|b| b.instructions()) else {
            return info;
        };
        for instruction in instructions {
            info = self.handle_instruction(block, bounds, info, instruction);
        }
        info
    }

    fn handle_instruction(
        &self,
        block: BlockId,
        bounds: Option<LoopBounds<'_>>,
        mut info: SizeGroupInformation,
        instruction: &Instruction,
    ) -> SizeGroupInformation {
        match instruction {
            Instruction::Iter { output } => {
                if let Some(bounds) = bounds {
                    info.set_at_least(output, bounds.start);
                    info.set_up_to(output, bounds.end);
                }
                info
            }
            Instruction::For(header) => self.handle_for(block, header, info),
            Instruction::While {
                loop_block,
                end_block,
            } => {
                let info = self.build_block(*loop_block, None, info);
                self.build_block(*end_block, None, info)
            }
            Instruction::Branch {
                true_block,
                false_block,
                end_block,
                ..
            } => {
                let info = self.build_block(*true_block, None, info);
                let info = self.build_block(*false_block, None, info);
                self.build_block(*end_block, None, info)
            }
            Instruction::Break | Instruction::Continue => info,
            other => {
                info.add_instruction_information(other, self.types);
                info
            }
        }
    }

    fn handle_for(
        &self,
        container: BlockId,
        header: &ForLoop,
        info: SizeGroupInformation,
    ) -> SizeGroupInformation {
        let bounds = info
            .is_known_positive(&header.interval)
            .then_some(LoopBounds {
                start: &header.start,
                end: &header.end,
            });

        let standard =
            self.types.is_scalar(&header.start) && self.types.is_scalar(&header.interval);
        if standard {
            if let Some(speculated) = self.speculate_loop(container, header, bounds, info.copy()) {
                return self.build_block(header.end_block, None, speculated);
            }
        }

        let info = self.build_block(header.loop_block, bounds, info);
        self.build_block(header.end_block, None, info)
    }

    /// Walks the loop block assuming loop-carried matrices keep their size.
    ///
    /// Returns `None` if an assumption does not hold at the back-edge.
    fn speculate_loop(
        &self,
        container: BlockId,
        header: &ForLoop,
        bounds: Option<LoopBounds<'_>>,
        mut info: SizeGroupInformation,
    ) -> Option<SizeGroupInformation> {
        let mut assumptions: Vec<(&str, &str)> = Vec::new();

        for instruction in self.body.block(header.loop_block)?.instructions() {
            if let Instruction::Phi(phi) = instruction {
                if phi.len() == 2 {
                    if let Some(parent) = phi.input_from(container) {
                        if self.types.is_matrix(parent) {
                            let other = phi.inputs().find(|v| *v != parent).unwrap_or(parent);
                            info.learn_types(self.types, [phi.output()]);
                            info.build_matrix_with_same_size(phi.output(), parent);
                            assumptions.push((parent, other));
                            continue;
                        }
                    }
                }
            }
            info = self.handle_instruction(header.loop_block, bounds, info, instruction);
        }

        assumptions
            .iter()
            .all(|(parent, other)| info.are_same_size(parent, other))
            .then_some(info)
    }
}

impl SizeGroupInformation {
    /// Builds the size information of `body`.
    #[must_use]
    pub fn build(body: &FunctionBody, types: &dyn TypeProvider) -> Self {
        SizeGroupBuilder::new(body, types).build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::ssa::{PhiNode, TypeShape, VariableType, VariableTypes};

    /// X1 = zeros(n, n); for one:one:n { X2 = phi(X1, X3); i = iter;
    /// X3 = simple_set X2(i) = v } X4 = phi(X1, X3)
    fn filled(update: Instruction) -> (FunctionBody, VariableTypes) {
        let matrix = VariableType::double_matrix(TypeShape::with_ndims(2));
        let types = VariableTypes::from_pairs([
            ("n", VariableType::int()),
            ("one", VariableType::int_constant(1)),
            ("v", VariableType::double()),
            ("i", VariableType::int()),
            ("X1", matrix.clone()),
            ("X2", matrix.clone()),
            ("X3", matrix.clone()),
            ("X4", matrix.clone()),
            ("Z", matrix),
        ]);

        let mut body = FunctionBody::new("f");
        let l = body.new_block();
        let e = body.new_block();
        let entry = body.block_mut(BlockId::ENTRY).unwrap();
        entry.add_instruction(Instruction::call(
            "zeros",
            vec!["X1".into()],
            vec!["n".into(), "n".into()],
        ));
        entry.add_instruction(Instruction::For(ForLoop::new("one", "one", "n", l, e)));

        let lb = body.block_mut(l).unwrap();
        lb.add_instruction(Instruction::Phi(PhiNode::new(
            "X2",
            vec!["X1".into(), "X3".into()],
            vec![BlockId::ENTRY, l],
        )));
        lb.add_instruction(Instruction::Iter { output: "i".into() });
        lb.add_instruction(update);

        body.block_mut(e).unwrap().add_instruction(Instruction::Phi(PhiNode::new(
            "X4",
            vec!["X1".into(), "X3".into()],
            vec![BlockId::ENTRY, l],
        )));
        (body, types)
    }

    #[test]
    fn test_speculation_succeeds() {
        let (body, types) = filled(Instruction::SimpleSet {
            output: "X3".into(),
            matrix: "X2".into(),
            indices: vec!["i".into()],
            value: "v".into(),
        });
        let info = SizeGroupInformation::build(&body, &types);
        assert!(info.are_same_size("X1", "X2"));
        assert!(info.are_same_size("X1", "X3"));
        assert!(info.are_same_size("X1", "X4"));
    }

    #[test]
    fn test_speculation_falls_back() {
        let (body, types) = filled(Instruction::call(
            "zeros",
            vec!["X3".into()],
            vec!["i".into(), "i".into()],
        ));
        let info = SizeGroupInformation::build(&body, &types);
        assert!(!info.are_same_size("X1", "X2"));
        assert!(!info.are_same_size("X1", "X4"));
    }

    #[test]
    fn test_iter_is_bounded_by_end() {
        let (body, types) = filled(Instruction::SimpleSet {
            output: "X3".into(),
            matrix: "X2".into(),
            indices: vec!["i".into()],
            value: "v".into(),
        });
        let mut info = SizeGroupInformation::build(&body, &types);
        assert!(info.is_known_less_or_equal("i", "n"));
        assert!(!info.are_same_value("i", "n"));
        assert!(info.in_range_of_matrix(&["i".into(), "i".into()], "X2"));
    }
}
