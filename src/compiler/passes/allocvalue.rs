//! Allocation value elimination pass.
//!
//! Finds `zeros`/`ones` allocations whose every element is overwritten by a
//! fill loop before anything reads it, and replaces them by an allocation
//! that does not initialize its elements.
//!
//! ```text
//! X$1 = zeros $one, n                  X$1 = matisse_new_array_from_dims $one, n
//! for $one, $one, n, #1, #2            for $one, $one, n, #1, #2
//! #1: X$2 = phi #0:X$1, #1:X$3    =>   (unchanged)
//!     i = iter
//!     X$3 = simple_set X$2(i) = v
//! #2: X$4 = phi #0:X$1, #1:X$3
//! ```
//!
//! The allocation may only flow into the loop phis; the only other readers
//! allowed anywhere along the chain are `numel`, `size`, `ndims` and
//! `length`, which do not look at element values. Nested loops are followed
//! through their after-loop phis, so `X(i, j) = ...` inside a two-deep nest
//! qualifies when the two loops cover both dimensions.
//!
//! Coverage is not needed when the value leaving the nest is itself only
//! passed to those functions: `X = zeros(n); for i = 1:n, X(i) = i; end;
//! k = numel(X)` never looks at an element, written or not.
//!
//! The pass honours two skip keys: its own name, and
//! `allocation_value_elimination_aliasing`, which stops it from looking
//! through copies of iteration variables (`j = i`).

use std::collections::{HashMap, HashSet};

use crate::{
    analysis::{
        analyze_standard_loop, BlockId, ForLoop, FunctionBody, Instruction, InstructionLocation,
        LoopVariable, PhiNode, PhiOperand, SizeGroupInformation, TypeProvider, UsageMap,
        VariableTypes,
    },
    compiler::{
        cache::{AnalysisCache, AnalysisSet},
        context::CompilerContext,
        events::EventKind,
        pass::SsaPass,
        services::TypedFunction,
    },
    Result,
};

const ALLOCATION_FUNCTIONS: &[&str] = &["zeros", "ones"];
const DATA_INVARIANT_FUNCTIONS: &[&str] = &["numel", "size", "ndims", "length"];

/// Skip key that disables looking through copies of iteration variables.
pub const SKIP_ALIASING: &str = "allocation_value_elimination_aliasing";

/// Instruction facts gathered in one walk over the function.
#[derive(Default)]
struct Survey {
    allocations: HashMap<String, InstructionLocation>,
    iters: HashMap<BlockId, String>,
    iter_aliases: HashMap<String, String>,
    simple_sets: HashMap<String, (String, Vec<String>)>,
    phis: HashMap<String, PhiNode>,
    invariant_uses: HashMap<String, usize>,
}

impl Survey {
    fn collect(body: &FunctionBody, follow_aliases: bool) -> Self {
        let mut survey = Survey::default();
        let mut phi_uses: HashMap<String, usize> = HashMap::new();

        for (location, instruction) in body.iter_instructions() {
            match instruction {
                Instruction::Call {
                    function, outputs, ..
                } if ALLOCATION_FUNCTIONS.contains(&function.as_str()) && outputs.len() == 1 => {
                    survey.allocations.insert(outputs[0].clone(), location);
                }
                Instruction::Assignment { output, .. } if follow_aliases => {
                    if let [input] = instruction.inputs().as_slice() {
                        survey
                            .iter_aliases
                            .insert(output.clone(), (*input).to_string());
                    }
                }
                Instruction::Iter { output } => {
                    survey
                        .iters
                        .entry(location.block)
                        .or_insert_with(|| output.clone());
                }
                Instruction::SimpleSet {
                    output,
                    matrix,
                    indices,
                    ..
                } => {
                    survey
                        .simple_sets
                        .insert(output.clone(), (matrix.clone(), indices.clone()));
                }
                _ => {}
            }
        }

        for (_, instruction) in body.iter_instructions() {
            match instruction {
                Instruction::Phi(phi) => {
                    for input in phi.inputs() {
                        *phi_uses.entry(input.to_string()).or_default() += 1;
                    }
                    survey.phis.insert(phi.output().to_string(), phi.clone());
                }
                Instruction::Call {
                    function, inputs, ..
                } if DATA_INVARIANT_FUNCTIONS.contains(&function.as_str()) => {
                    for input in inputs {
                        *survey.invariant_uses.entry(input.clone()).or_default() += 1;
                    }
                }
                other => {
                    for input in other.inputs() {
                        survey.allocations.remove(input);
                    }
                }
            }
        }

        survey
            .allocations
            .retain(|name, _| phi_uses.get(name).copied().unwrap_or(0) == 2);
        survey
    }

    /// Uses of `name` other than size queries.
    fn value_uses(&self, usages: &UsageMap, name: &str) -> usize {
        usages
            .usage_count(name)
            .saturating_sub(self.invariant_uses.get(name).copied().unwrap_or(0))
    }
}

/// Allocation value elimination pass.
pub struct AllocationValueEliminationPass;

impl Default for AllocationValueEliminationPass {
    fn default() -> Self {
        Self::new()
    }
}

impl AllocationValueEliminationPass {
    /// Creates a new allocation value elimination pass.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    fn is_constant_one(types: &VariableTypes, name: &str) -> bool {
        types.variable_type(name).and_then(|t| t.constant()) == Some(1.0)
    }

    /// Header of a `for` ending `block` that counts from one in unit steps.
    fn unit_loop<'b>(
        body: &'b FunctionBody,
        types: &VariableTypes,
        block: BlockId,
    ) -> Option<&'b ForLoop> {
        let header = body.block(block)?.ending_instruction()?.as_for()?;
        let unit = Self::is_constant_one(types, &header.start)
            && Self::is_constant_one(types, &header.interval);
        unit.then_some(header)
    }

    /// Returns `true` if no initial element of `variable` can be observed.
    ///
    /// Either every element is written before the loop nest rooted at
    /// `loop_iters` finishes, or, with `unobserved`, the nest only writes
    /// elements and its result is only measured.
    #[allow(clippy::too_many_arguments)]
    fn is_fully_overwritten(
        body: &FunctionBody,
        types: &VariableTypes,
        sizes: &mut SizeGroupInformation,
        usages: &UsageMap,
        survey: &Survey,
        variable: &LoopVariable,
        loop_iters: Vec<String>,
        loop_ends: Vec<String>,
        unobserved: bool,
    ) -> bool {
        if survey.value_uses(usages, &variable.loop_end) != 2 {
            return false;
        }

        if let Some((matrix, indices)) = survey.simple_sets.get(&variable.loop_end) {
            if survey.value_uses(usages, &variable.loop_start) != 1
                || *matrix != variable.loop_start
            {
                return false;
            }
            if unobserved {
                return true;
            }

            let mut used = HashSet::new();
            for (position, index) in indices.iter().enumerate() {
                let iter = survey.iter_aliases.get(index).unwrap_or(index);
                let Some(level) = loop_iters.iter().position(|i| i == iter) else {
                    return false;
                };
                if !used.insert(iter.clone()) {
                    return false;
                }

                let size = if position + 1 == indices.len() {
                    sizes.get_size_since_result(&variable.loop_start, position)
                } else {
                    sizes.get_size_result(&variable.loop_start, position)
                };
                if !sizes.are_same_value(&loop_ends[level], &size) {
                    return false;
                }
            }
            return true;
        }

        let Some(phi) = survey.phis.get(&variable.loop_end) else {
            return false;
        };
        if survey.value_uses(usages, &variable.loop_start) != 2 || phi.len() != 2 {
            return false;
        }
        let Some(container) = phi
            .operands()
            .iter()
            .find(|op| op.value() == variable.loop_start)
            .map(PhiOperand::source)
        else {
            return false;
        };
        let Some(header) = Self::unit_loop(body, types, container) else {
            return false;
        };
        let Some(iter) = survey.iters.get(&header.loop_block) else {
            return false;
        };

        let Some(nested) = analyze_standard_loop(body, container, Some(types)).and_then(|vars| {
            vars.into_iter()
                .find(|v| v.after_loop.as_deref() == Some(variable.loop_end.as_str()))
        }) else {
            return false;
        };
        if nested.before_loop != variable.loop_start {
            return false;
        }

        let mut loop_iters = loop_iters;
        let mut loop_ends = loop_ends;
        loop_iters.push(iter.clone());
        loop_ends.push(header.end.clone());
        Self::is_fully_overwritten(
            body, types, sizes, usages, survey, &nested, loop_iters, loop_ends, unobserved,
        )
    }

    /// The cheaper allocation replacing `instruction`, if one applies.
    fn replacement(types: &VariableTypes, instruction: &Instruction) -> Option<Instruction> {
        let Instruction::Call {
            outputs, inputs, ..
        } = instruction
        else {
            return None;
        };
        if !types.is_matrix(&outputs[0]) {
            return None;
        }

        let (function, inputs) = match inputs.as_slice() {
            [input] if types.is_matrix(input) => ("matisse_new_array", inputs.clone()),
            [input] if types.is_scalar(input) => {
                ("matisse_new_array_from_dims", vec![input.clone(), input.clone()])
            }
            [_] => return None,
            _ if inputs.iter().all(|i| types.is_scalar(i)) => {
                ("matisse_new_array_from_dims", inputs.clone())
            }
            _ => return None,
        };
        Some(Instruction::call(function, outputs.clone(), inputs))
    }
}

impl SsaPass for AllocationValueEliminationPass {
    fn name(&self) -> &'static str {
        "allocation_value_elimination"
    }

    fn should_run(&self, function: &TypedFunction, _ctx: &CompilerContext) -> bool {
        !function.body.should_skip(self.name())
    }

    fn run_on_function(
        &self,
        function: &mut TypedFunction,
        cache: &mut AnalysisCache,
        ctx: &CompilerContext,
    ) -> Result<bool> {
        let survey = Survey::collect(&function.body, !function.body.should_skip(SKIP_ALIASING));
        if survey.allocations.is_empty() {
            return Ok(false);
        }

        let usages = cache.usages(&function.body).clone();
        let sizes = cache.size_groups(&function.body, &function.types);
        let body = &function.body;
        let types = &function.types;

        let mut proven: Vec<InstructionLocation> = Vec::new();
        for (block, _) in body.iter_blocks() {
            let Some(header) = Self::unit_loop(body, types, block) else {
                continue;
            };
            let Some(iter) = survey.iters.get(&header.loop_block) else {
                continue;
            };
            let Some(variables) = analyze_standard_loop(body, block, Some(types)) else {
                continue;
            };

            for variable in variables {
                let Some(after_loop) = &variable.after_loop else {
                    continue;
                };
                let Some(&location) = survey.allocations.get(&variable.before_loop) else {
                    continue;
                };
                if proven.contains(&location) {
                    continue;
                }
                let unobserved = survey.value_uses(&usages, after_loop) == 0;
                if Self::is_fully_overwritten(
                    body,
                    types,
                    sizes,
                    &usages,
                    &survey,
                    &variable,
                    vec![iter.clone()],
                    vec![header.end.clone()],
                    unobserved,
                ) {
                    proven.push(location);
                }
            }
        }

        let mut changed = false;
        for location in proven {
            let Some(original) = function.body.instruction_at(location) else {
                return Err(malformed_error!("allocation at {:?} disappeared", location));
            };
            let Some(replacement) = Self::replacement(&function.types, original) else {
                continue;
            };

            ctx.events
                .record(EventKind::AllocationSimplified)
                .at(function.body.name(), location.block.index())
                .pass(self.name())
                .message(format!("{} -> {}", original, replacement));

            let block = function.body.try_block_mut(location.block)?;
            block.instructions_mut()[location.index] = replacement;
            changed = true;
        }

        Ok(changed)
    }

    fn invalidates(&self) -> AnalysisSet {
        AnalysisSet::USAGES
    }

    fn description(&self) -> &'static str {
        "Skips initializing allocations that a fill loop overwrites entirely"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::{SsaBlock, TypeShape, VariableType};

    fn phi(out: &str, a: &str, b: &str, sa: BlockId, sb: BlockId) -> Instruction {
        Instruction::Phi(PhiNode::new(out, vec![a.into(), b.into()], vec![sa, sb]))
    }

    /// X$1 = zeros(dims); for 1:n { X$2 = phi; i = iter; X$3 = X$2(i) = i }
    /// X$4 = phi; k = numel X$4
    fn fill(dims: Vec<&str>) -> TypedFunction {
        let mut body = FunctionBody::new("f");
        let l = body.new_block();
        let e = body.new_block();
        let entry = body.block_mut(BlockId::ENTRY).unwrap();
        entry.add_instruction(Instruction::Argument {
            output: "n".into(),
            index: 0,
        });
        entry.add_instruction(Instruction::assign_integer("$one", 1));
        entry.add_instruction(Instruction::call(
            "zeros",
            vec!["X$1".into()],
            dims.into_iter().map(String::from).collect(),
        ));
        entry.add_instruction(Instruction::For(ForLoop::new("$one", "$one", "n", l, e)));
        *body.block_mut(l).unwrap() = SsaBlock::from_instructions(vec![
            phi("X$2", "X$1", "X$3", BlockId::ENTRY, l),
            Instruction::Iter {
                output: "i".into(),
            },
            Instruction::SimpleSet {
                output: "X$3".into(),
                matrix: "X$2".into(),
                indices: vec!["i".into()],
                value: "i".into(),
            },
        ]);
        let end = body.block_mut(e).unwrap();
        end.add_instruction(phi("X$4", "X$1", "X$3", BlockId::ENTRY, l));
        end.add_instruction(Instruction::call("numel", vec!["k".into()], vec!["X$4".into()]));

        let row = VariableType::double_matrix(TypeShape::from_dims(vec![Some(1), None]));
        let types = VariableTypes::from_pairs([
            ("n", VariableType::int()),
            ("$one", VariableType::int_constant(1)),
            ("i", VariableType::int()),
            ("X$1", row.clone()),
            ("X$2", row.clone()),
            ("X$3", row.clone()),
            ("X$4", row),
            ("k", VariableType::int()),
        ]);
        TypedFunction::new(body, types)
    }

    fn run(function: &mut TypedFunction) -> bool {
        AllocationValueEliminationPass::new()
            .run_on_function(function, &mut AnalysisCache::new(), &CompilerContext::new())
            .unwrap()
    }

    #[test]
    fn test_overwritten_row_is_not_initialized() {
        let mut function = fill(vec!["$one", "n"]);
        assert!(run(&mut function));
        assert_eq!(
            function.body.block(BlockId::ENTRY).unwrap().instructions()[2],
            Instruction::call(
                "matisse_new_array_from_dims",
                vec!["X$1".into()],
                vec!["$one".into(), "n".into()]
            )
        );
    }

    #[test]
    fn test_measured_square_allocation_is_not_initialized() {
        // zeros(n) is n-by-n and the fill leaves most of it untouched, but
        // only numel ever sees the result.
        let mut function = fill(vec!["n"]);
        assert!(run(&mut function));
        assert_eq!(
            function.body.block(BlockId::ENTRY).unwrap().instructions()[2],
            Instruction::call(
                "matisse_new_array_from_dims",
                vec!["X$1".into()],
                vec!["n".into(), "n".into()]
            )
        );
    }

    #[test]
    fn test_observed_partial_fill_is_kept() {
        let mut function = fill(vec!["n"]);
        function
            .body
            .block_mut(BlockId::new(2))
            .unwrap()
            .add_instruction(Instruction::call("disp", vec![], vec!["X$4".into()]));
        assert!(!run(&mut function));
    }

    #[test]
    fn test_observed_full_fill_is_rewritten() {
        let mut function = fill(vec!["$one", "n"]);
        function
            .body
            .block_mut(BlockId::new(2))
            .unwrap()
            .add_instruction(Instruction::call("disp", vec![], vec!["X$4".into()]));
        assert!(run(&mut function));
    }

    #[test]
    fn test_value_reader_blocks_rewrite() {
        let mut function = fill(vec!["$one", "n"]);
        function
            .body
            .block_mut(BlockId::ENTRY)
            .unwrap()
            .insert_instruction(
                3,
                Instruction::call("sum", vec!["s".into()], vec!["X$1".into()]),
            );
        function.types.add_variable("s", VariableType::double());
        assert!(!run(&mut function));
    }

    #[test]
    fn test_skip_key() {
        let mut function = fill(vec!["$one", "n"]);
        function.body.add_skip("allocation_value_elimination");
        assert!(!AllocationValueEliminationPass::new()
            .should_run(&function, &CompilerContext::new()));
    }
}
