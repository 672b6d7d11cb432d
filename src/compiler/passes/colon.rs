//! Colon elimination pass.
//!
//! Replaces range construction `X = colon(start, end)` (and
//! `colon(start, 1, end)`) by an explicit allocation and a fill loop, which
//! the backend can lower without a runtime range helper.
//!
//! Before:
//! ```text
//! X = colon start, n
//! ```
//!
//! After (for a non-constant `start`):
//! ```text
//! #0: $one$1 = 1
//!     $minus$1 = minus start, $one$1            ; offset
//!     $minus$2 = minus n, $minus$1              ; element count
//!     $range$1 = matisse_new_array_from_dims $one$1, $minus$2
//!     for $one$1, $one$1, $minus$2, #1, #2
//! #1: $range$2 = phi #0:$range$1, #1:$range$3
//!     $iter$1 = iter
//!     $plus$1 = plus $iter$1, $minus$1
//!     $range$3 = simple_set $range$2($iter$1) = $plus$1
//! #2: X = phi #0:$range$1, #1:$range$3
//! ```
//!
//! When the result is statically a scalar the call collapses to
//! `X = start`. Non-integral ends are truncated with `fix`, matching the
//! element count of the range.

use crate::{
    analysis::{Instruction, SizeGroupInformation, TypeProvider, VariableType},
    compiler::{
        cache::AnalysisSet,
        editor::BlockEditor,
        events::EventKind,
        removal::{Facts, RemovalSite, SizeAwareInstructionRemovalPass, SizeInfoUpdate},
    },
    Error, Result,
};

/// Colon elimination pass.
pub struct ColonEliminationPass;

impl Default for ColonEliminationPass {
    fn default() -> Self {
        Self::new()
    }
}

impl ColonEliminationPass {
    /// Creates a new colon elimination pass.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    fn scalar(types: &dyn TypeProvider, name: &str) -> Option<VariableType> {
        types.variable_type(name).filter(VariableType::is_scalar)
    }

    /// Returns `end` as an integer, truncating it if needed.
    fn truncated(editor: &mut BlockEditor<'_>, end: &str) -> Result<String> {
        match editor.variable_type(end) {
            Some(ty) if ty.is_integer() => Ok(end.to_string()),
            _ => editor.add_simple_call("fix", vec![end.to_string()]),
        }
    }
}

impl SizeAwareInstructionRemovalPass for ColonEliminationPass {
    fn name(&self) -> &'static str {
        "colon_elimination"
    }

    fn can_eliminate(
        &self,
        instruction: &Instruction,
        facts: &Facts<'_>,
        _sizes: &mut SizeGroupInformation,
    ) -> bool {
        let Instruction::Call {
            function,
            outputs,
            inputs,
        } = instruction
        else {
            return false;
        };
        if function != "colon" || outputs.len() != 1 || !(2..=3).contains(&inputs.len()) {
            return false;
        }
        if facts.types.variable_type(&outputs[0]).is_none() {
            return false;
        }

        let start_is_integer =
            Self::scalar(facts.types, &inputs[0]).is_some_and(|t| t.is_integer());
        let unit_interval = inputs.len() == 2
            || Self::scalar(facts.types, &inputs[1]).and_then(|t| t.constant()) == Some(1.0);
        let end_is_scalar = Self::scalar(facts.types, &inputs[inputs.len() - 1]).is_some();

        start_is_integer && unit_interval && end_is_scalar
    }

    fn eliminate(&self, mut site: RemovalSite<'_>) -> Result<SizeInfoUpdate> {
        let Instruction::Call {
            outputs, inputs, ..
        } = &site.instruction
        else {
            return Err(malformed_error!("colon elimination matched {}", site.instruction));
        };
        let (Some(output), Some(start), Some(end)) =
            (outputs.first(), inputs.first(), inputs.last())
        else {
            return Err(malformed_error!("colon elimination matched {}", site.instruction));
        };
        let (output, start, end) = (output.clone(), start.clone(), end.clone());
        let output_type = site
            .types
            .variable_type(&output)
            .ok_or_else(|| Error::UnknownVariable(output.clone()))?;

        if output_type.is_scalar() {
            let assignment = Instruction::assign_variable(output, start);
            site.learn(&assignment);
            site.replace(vec![assignment]);
            return Ok(SizeInfoUpdate::Maintained);
        }

        let matrix_type = output_type.without_constant();
        let (mut editor, _, tail) = site.into_editor();
        let container = editor.block();

        let one = editor.add_make_integer("one", 1);
        let start_is_one = editor.variable_type(&start).and_then(|t| t.constant()) == Some(1.0);
        let (offset, count) = if start_is_one {
            (None, Self::truncated(&mut editor, &end)?)
        } else {
            let offset = editor.add_simple_call("minus", vec![start, one.clone()])?;
            let end = Self::truncated(&mut editor, &end)?;
            let count = editor.add_simple_call("minus", vec![end, offset.clone()])?;
            (Some(offset), count)
        };

        let initial = editor.make_temporary("range", matrix_type.clone());
        editor.add_call_to(
            "matisse_new_array_from_dims",
            vec![initial.clone()],
            vec![one.clone(), count.clone()],
        )?;

        let handles = editor.make_for_loop(&one, &one, &count);
        let loop_start = editor.make_temporary("range", matrix_type.clone());
        let loop_end = editor.make_temporary("range", matrix_type);
        let back = editor.region_end(handles.loop_block);
        editor.add_phi(
            &loop_start,
            vec![initial.clone(), loop_end.clone()],
            vec![container, back],
        );
        let value = match offset {
            Some(offset) => editor.add_simple_call("plus", vec![handles.iter.clone(), offset])?,
            None => handles.iter.clone(),
        };
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
        EventKind::ColonEliminated
    }

    fn description(&self) -> &'static str {
        "Replaces colon ranges by an allocation and a fill loop"
    }
}
