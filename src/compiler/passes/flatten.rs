//! Vertical flatten elimination pass.
//!
//! Rewrites `Y = A(:)`. When `A` is already a column (or a scalar) the
//! flatten is a copy:
//!
//! ```text
//! Y = A
//! ```
//!
//! Otherwise `Y` is built element by element in linear order:
//!
//! ```text
//! #0: $numel$1 = numel A
//!     $one$1 = 1
//!     $flat$1 = matisse_new_array_from_dims $numel$1, $one$1
//!     for $one$1, $one$1, $numel$1, #1, #2
//! #1: $flat$2 = phi #0:$flat$1, #1:$flat$3
//!     $iter$1 = iter
//!     $value$1 = simple_get A($iter$1)
//!     $flat$3 = simple_set $flat$2($iter$1) = $value$1
//! #2: Y = phi #0:$flat$1, #1:$flat$3
//! ```
//!
//! Reading and writing through the same linear index keeps the column-major
//! element order of `A`.

use crate::{
    analysis::{Instruction, SizeGroupInformation, TypeProvider, VariableType},
    compiler::{
        cache::AnalysisSet,
        events::EventKind,
        removal::{Facts, RemovalSite, SizeAwareInstructionRemovalPass, SizeInfoUpdate},
    },
    Error, Result,
};

/// Vertical flatten elimination pass.
pub struct VerticalFlattenEliminationPass;

impl Default for VerticalFlattenEliminationPass {
    fn default() -> Self {
        Self::new()
    }
}

impl VerticalFlattenEliminationPass {
    /// Creates a new vertical flatten elimination pass.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Returns `true` if `input(:)` is `input` itself.
    fn is_column(types: &dyn TypeProvider, sizes: &mut SizeGroupInformation, input: &str) -> bool {
        match types.variable_type(input) {
            Some(VariableType::Scalar(_)) => true,
            Some(ty) if ty.shape().is_known_column() => true,
            Some(VariableType::Matrix(_)) => {
                let trailing = sizes.get_size_since_result(input, 1);
                sizes.is_known_equal(&trailing, 1.0)
            }
            _ => false,
        }
    }
}

impl SizeAwareInstructionRemovalPass for VerticalFlattenEliminationPass {
    fn name(&self) -> &'static str {
        "vertical_flatten_elimination"
    }

    fn can_eliminate(
        &self,
        instruction: &Instruction,
        facts: &Facts<'_>,
        _sizes: &mut SizeGroupInformation,
    ) -> bool {
        let Instruction::VerticalFlatten { output, input } = instruction else {
            return false;
        };
        facts.types.variable_type(output).is_some()
            && facts
                .types
                .variable_type(input)
                .is_some_and(|t| t.is_scalar() || t.is_matrix())
    }

    fn eliminate(&self, mut site: RemovalSite<'_>) -> Result<SizeInfoUpdate> {
        let Instruction::VerticalFlatten { output, input } = site.instruction.clone() else {
            return Err(malformed_error!("flatten elimination matched {}", site.instruction));
        };

        let column = match site.types_and_sizes() {
            (types, Some(sizes)) => Self::is_column(types, sizes, &input),
            (_, None) => false,
        };
        if column {
            let copy = Instruction::assign_variable(output, input);
            site.learn(&copy);
            site.replace(vec![copy]);
            return Ok(SizeInfoUpdate::Maintained);
        }

        let output_type = site
            .types
            .variable_type(&output)
            .ok_or_else(|| Error::UnknownVariable(output.clone()))?
            .without_constant();
        let (mut editor, _, tail) = site.into_editor();
        let container = editor.block();

        let numel = editor.add_simple_call("numel", vec![input.clone()])?;
        let one = editor.add_make_integer("one", 1);
        let initial = editor.make_temporary("flat", output_type.clone());
        editor.add_call_to(
            "matisse_new_array_from_dims",
            vec![initial.clone()],
            vec![numel.clone(), one.clone()],
        )?;

        let handles = editor.make_for_loop(&one, &one, &numel);
        let loop_start = editor.make_temporary("flat", output_type.clone());
        let loop_end = editor.make_temporary("flat", output_type);
        let back = editor.region_end(handles.loop_block);
        editor.add_phi(
            &loop_start,
            vec![initial.clone(), loop_end.clone()],
            vec![container, back],
        );
        let value = editor.add_simple_get(&input, vec![handles.iter.clone()]);
        editor.add_simple_set_to(&loop_end, &loop_start, vec![handles.iter], &value);

        editor.set_block(handles.end_block);
        editor.add_phi(&output, vec![initial, loop_end], vec![container, back]);
        editor.append_tail(tail);

        Ok(SizeInfoUpdate::Invalidated)
    }

    fn invalidates(&self) -> AnalysisSet {
        AnalysisSet::ALL
    }

    fn event_kind(&self) -> EventKind {
        EventKind::FlattenEliminated
    }

    fn description(&self) -> &'static str {
        "Replaces A(:) by a copy or a linear copy loop"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        analysis::{validate, BlockId, FunctionBody, TypeShape, VariableTypes},
        compiler::{
            cache::AnalysisCache, context::CompilerContext, pass::SsaPass,
            removal::SizeAwareRemovalDriver, services::TypedFunction,
        },
    };

    fn function(input: VariableType) -> TypedFunction {
        let mut body = FunctionBody::new("f");
        let entry = body.block_mut(BlockId::ENTRY).unwrap();
        entry.add_instruction(Instruction::Argument {
            output: "A".into(),
            index: 0,
        });
        entry.add_instruction(Instruction::VerticalFlatten {
            output: "Y".into(),
            input: "A".into(),
        });
        let types = VariableTypes::from_pairs([
            ("A", input),
            ("Y", VariableType::double_matrix(TypeShape::column())),
        ]);
        TypedFunction::new(body, types)
    }

    fn run(function: &mut TypedFunction) -> bool {
        SizeAwareRemovalDriver::new(VerticalFlattenEliminationPass::new())
            .run_on_function(function, &mut AnalysisCache::new(), &CompilerContext::new())
            .unwrap()
    }

    #[test]
    fn test_column_is_aliased() {
        let mut function = function(VariableType::double_matrix(TypeShape::column()));
        assert!(run(&mut function));
        assert_eq!(
            function.body.block(BlockId::ENTRY).unwrap().instructions()[1],
            Instruction::assign_variable("Y", "A")
        );
    }

    #[test]
    fn test_proven_column_is_aliased() {
        // A = zeros(n, 1) has a 2-D type; only the size groups know it is a column.
        let mut body = FunctionBody::new("f");
        let entry = body.block_mut(BlockId::ENTRY).unwrap();
        entry.add_instruction(Instruction::Argument {
            output: "n".into(),
            index: 0,
        });
        entry.add_instruction(Instruction::assign_integer("one", 1));
        entry.add_instruction(Instruction::call(
            "zeros",
            vec!["A".into()],
            vec!["n".into(), "one".into()],
        ));
        entry.add_instruction(Instruction::VerticalFlatten {
            output: "Y".into(),
            input: "A".into(),
        });
        let types = VariableTypes::from_pairs([
            ("n", VariableType::int()),
            ("one", VariableType::int_constant(1)),
            ("A", VariableType::double_matrix(TypeShape::with_ndims(2))),
            ("Y", VariableType::double_matrix(TypeShape::column())),
        ]);
        let mut function = TypedFunction::new(body, types);

        assert!(run(&mut function));
        assert_eq!(function.body.block_count(), 1);
        assert_eq!(
            function.body.block(BlockId::ENTRY).unwrap().instructions()[3],
            Instruction::assign_variable("Y", "A")
        );
    }

    #[test]
    fn test_matrix_is_copied_in_linear_order() {
        let mut function = function(VariableType::double_matrix(TypeShape::with_ndims(2)));
        assert!(run(&mut function));
        validate(&function.body).unwrap();

        assert!(!function
            .body
            .iter_instructions()
            .any(|(_, i)| matches!(i, Instruction::VerticalFlatten { .. })));

        let body = function.body.block(BlockId::new(1)).unwrap();
        let get = body
            .instructions()
            .iter()
            .find_map(|i| match i {
                Instruction::SimpleGet {
                    matrix, indices, ..
                } => Some((matrix.clone(), indices.clone())),
                _ => None,
            })
            .unwrap();
        let set = body
            .instructions()
            .iter()
            .find_map(|i| match i {
                Instruction::SimpleSet { indices, .. } => Some(indices.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(get.0, "A");
        assert_eq!(get.1, set);

        let end = function.body.block(BlockId::new(2)).unwrap();
        assert_eq!(end.phis().next().map(|p| p.output()), Some("Y"));
    }
}
