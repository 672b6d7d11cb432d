//! Safe construction of new code inside an existing function.
//!
//! [`BlockEditor`] is the single surface passes use to extend a function
//! while rewriting it. It keeps an *insertion point* (a block) and offers
//! operations that append instructions there, open structured control flow,
//! and merge values with phis, so that no pass re-derives block and phi
//! bookkeeping by hand.
//!
//! # Splitting blocks
//!
//! Opening a branch or a loop ends the current block with a control transfer
//! and continues the original code in a fresh join or end block. Phis
//! elsewhere that named the current block as the source of a value now see
//! that value arrive from the continuation instead; the editor redirects
//! them before linking the new blocks, so every handle it returns refers to
//! a block that is already part of the control flow.
//!
//! ```text
//!   before                         after make_for_loop(s, i, e)
//!   #B: a; b                       #B: a; b; for s, i, e, #L, #E
//!                                  #L: $iter$1 = iter     <- insertion point
//!                                  #E:                    <- continuation
//! ```
//!
//! # Misuse
//!
//! Appending to a block that already ends with a control transfer, or
//! pointing the editor at a block that does not exist, is a programming
//! error and panics.

use crate::{
    analysis::{
        AssignmentInput, BlockId, ForLoop, FunctionBody, Instruction, MatrixType, NumericClass,
        PhiNode, SizeGroupInformation, SsaBlock, TypeProvider, TypeShape, VariableType,
    },
    compiler::services::BuiltinProvider,
    Error, Result,
};

/// Blocks created by [`BlockEditor::make_branch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BranchHandles {
    /// Executed when the condition holds
    pub then_block: BlockId,
    /// Executed otherwise
    pub else_block: BlockId,
    /// Where both arms join; continues the original block
    pub join_block: BlockId,
}

/// Blocks and iteration variable created by [`BlockEditor::make_for_loop`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForLoopHandles {
    /// Loop body, already containing the `iter` instruction
    pub loop_block: BlockId,
    /// Code after the loop; continues the original block
    pub end_block: BlockId,
    /// The iteration variable
    pub iter: String,
}

/// Appends instructions and structured control flow to a function.
pub struct BlockEditor<'a> {
    body: &'a mut FunctionBody,
    types: &'a mut dyn TypeProvider,
    builtins: &'a dyn BuiltinProvider,
    block: BlockId,
    sizes: Option<&'a mut SizeGroupInformation>,
}

impl<'a> BlockEditor<'a> {
    /// Creates an editor whose insertion point is the end of `block`.
    ///
    /// # Panics
    ///
    /// Panics if `block` does not exist.
    pub fn new(
        body: &'a mut FunctionBody,
        types: &'a mut dyn TypeProvider,
        builtins: &'a dyn BuiltinProvider,
        block: BlockId,
    ) -> Self {
        assert!(
            body.block(block).is_some(),
            "editor block {} does not exist",
            block
        );
        BlockEditor {
            body,
            types,
            builtins,
            block,
            sizes: None,
        }
    }

    /// Teaches `sizes` every instruction the editor emits from now on.
    #[must_use]
    pub fn with_size_info(mut self, sizes: &'a mut SizeGroupInformation) -> Self {
        self.sizes = Some(sizes);
        self
    }

    /// Current insertion block.
    #[must_use]
    pub fn block(&self) -> BlockId {
        self.block
    }

    /// Moves the insertion point to the end of `block`.
    ///
    /// # Panics
    ///
    /// Panics if `block` does not exist.
    pub fn set_block(&mut self, block: BlockId) {
        assert!(
            self.body.block(block).is_some(),
            "editor block {} does not exist",
            block
        );
        self.block = block;
    }

    /// The function being edited.
    #[must_use]
    pub fn body(&self) -> &FunctionBody {
        self.body
    }

    /// Type of `name`, if known.
    #[must_use]
    pub fn variable_type(&self, name: &str) -> Option<VariableType> {
        self.types.variable_type(name)
    }

    /// Mints a fresh variable of type `ty`.
    pub fn make_temporary(&mut self, semantic: &str, ty: VariableType) -> String {
        self.types.make_temporary(semantic, ty)
    }

    /// Last block of the region starting at `block`.
    ///
    /// This is the block control leaves a region from, and therefore the
    /// source to name in a phi.
    #[must_use]
    pub fn region_end(&self, block: BlockId) -> BlockId {
        self.body.block_end(block)
    }

    fn current(&mut self) -> &mut SsaBlock {
        let block = self.block;
        match self.body.block_mut(block) {
            Some(current) => current,
            None => panic!("editor block {} does not exist", block),
        }
    }

    fn learn(&mut self, instruction: &Instruction) {
        if let Some(sizes) = self.sizes.as_deref_mut() {
            sizes.add_instruction_information(instruction, &*self.types);
        }
    }

    /// Appends `instruction` at the insertion point.
    ///
    /// # Panics
    ///
    /// Panics if the insertion block already ends with a control transfer.
    pub fn add_instruction(&mut self, instruction: Instruction) {
        let block = self.block;
        let current = self.current();
        assert!(
            !current.has_ending_instruction(),
            "cannot append '{}' to block {} after its ending instruction",
            instruction,
            block
        );
        self.learn(&instruction);
        self.current().add_instruction(instruction);
    }

    /// Appends previously cut instructions without analysing them.
    ///
    /// The list may end with a control transfer.
    ///
    /// # Panics
    ///
    /// Panics if the insertion block already ends with a control transfer.
    pub fn append_tail(&mut self, tail: Vec<Instruction>) {
        let block = self.block;
        let current = self.current();
        assert!(
            tail.is_empty() || !current.has_ending_instruction(),
            "cannot append to block {} after its ending instruction",
            block
        );
        current.add_instructions(tail);
    }

    /// Emits an integer constant.
    pub fn add_make_integer(&mut self, semantic: &str, value: i64) -> String {
        let output = self.make_temporary(semantic, VariableType::int_constant(value));
        self.add_instruction(Instruction::assign_integer(output.clone(), value));
        output
    }

    /// Emits a double constant.
    pub fn add_make_scalar(&mut self, semantic: &str, value: f64) -> String {
        let output = self.make_temporary(semantic, VariableType::double_constant(value));
        self.add_instruction(Instruction::Assignment {
            output: output.clone(),
            input: AssignmentInput::Number(value),
        });
        output
    }

    fn input_types(&self, inputs: &[String]) -> Result<Vec<VariableType>> {
        inputs
            .iter()
            .map(|input| {
                self.types
                    .variable_type(input)
                    .ok_or_else(|| Error::UnknownVariable(input.clone()))
            })
            .collect()
    }

    /// Emits a call to a builtin and returns its `nargout` fresh outputs.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownVariable`] if an input has no type and
    /// [`Error::UnknownFunction`] if the builtin does not resolve.
    pub fn add_call(
        &mut self,
        function: &str,
        inputs: Vec<String>,
        nargout: usize,
    ) -> Result<Vec<String>> {
        let input_types = self.input_types(&inputs)?;
        let signature = self
            .builtins
            .resolve(function, &input_types, nargout)
            .ok_or_else(|| Error::UnknownFunction(function.to_string()))?;

        let outputs: Vec<String> = signature
            .outputs
            .into_iter()
            .map(|ty| self.types.make_temporary(function, ty))
            .collect();
        self.add_instruction(Instruction::call(function, outputs.clone(), inputs));
        Ok(outputs)
    }

    /// Emits a call to a builtin with a single output.
    ///
    /// # Errors
    ///
    /// See [`add_call`](Self::add_call).
    pub fn add_simple_call(&mut self, function: &str, inputs: Vec<String>) -> Result<String> {
        let mut outputs = self.add_call(function, inputs, 1)?;
        outputs
            .pop()
            .ok_or_else(|| Error::UnknownFunction(function.to_string()))
    }

    /// Emits a call to a builtin writing to existing names.
    ///
    /// Outputs without a type are given the type from the signature.
    ///
    /// # Errors
    ///
    /// See [`add_call`](Self::add_call).
    pub fn add_call_to(
        &mut self,
        function: &str,
        outputs: Vec<String>,
        inputs: Vec<String>,
    ) -> Result<()> {
        let input_types = self.input_types(&inputs)?;
        let signature = self
            .builtins
            .resolve(function, &input_types, outputs.len())
            .ok_or_else(|| Error::UnknownFunction(function.to_string()))?;
        for (output, ty) in outputs.iter().zip(signature.outputs) {
            if self.types.variable_type(output).is_none() {
                self.types.add_variable(output, ty);
            }
        }
        self.add_instruction(Instruction::call(function, outputs, inputs));
        Ok(())
    }

    /// Emits `output = matrix(indices...)` without bounds checks.
    pub fn add_simple_get(&mut self, matrix: &str, indices: Vec<String>) -> String {
        let ty = self
            .types
            .variable_type(matrix)
            .map_or_else(VariableType::double, |t| t.element_type());
        let output = self.make_temporary("value", ty);
        self.add_instruction(Instruction::SimpleGet {
            output: output.clone(),
            matrix: matrix.to_string(),
            indices,
        });
        output
    }

    /// Emits `output = matrix; output(indices...) = value` without bounds
    /// checks and returns the new matrix version.
    pub fn add_simple_set(&mut self, matrix: &str, indices: Vec<String>, value: &str) -> String {
        let ty = self
            .types
            .variable_type(matrix)
            .map_or(VariableType::Opaque, |t| t.without_constant());
        let output = self.make_temporary("matrix", ty);
        self.add_simple_set_to(&output, matrix, indices, value);
        output
    }

    /// Like [`add_simple_set`](Self::add_simple_set), writing to an existing
    /// name.
    pub fn add_simple_set_to(
        &mut self,
        output: &str,
        matrix: &str,
        indices: Vec<String>,
        value: &str,
    ) {
        self.add_instruction(Instruction::SimpleSet {
            output: output.to_string(),
            matrix: matrix.to_string(),
            indices,
            value: value.to_string(),
        });
    }

    /// Emits `output = input`.
    pub fn add_assignment(&mut self, output: &str, input: &str) {
        if self.types.variable_type(output).is_none() {
            if let Some(ty) = self.types.variable_type(input) {
                self.types.add_variable(output, ty);
            }
        }
        self.add_instruction(Instruction::assign_variable(output, input));
    }

    /// Emits the value of `end` at position `index` of an access with
    /// `num_indices` indices.
    pub fn add_make_end(&mut self, matrix: &str, index: usize, num_indices: usize) -> String {
        let output = self.make_temporary("end", VariableType::int());
        self.add_instruction(Instruction::End {
            output: output.clone(),
            matrix: matrix.to_string(),
            index,
            num_indices,
        });
        output
    }

    /// Emits `output = input(:)`.
    pub fn add_vertical_flatten(&mut self, input: &str) -> String {
        let element = self
            .types
            .variable_type(input)
            .and_then(|t| t.numeric_class())
            .unwrap_or(NumericClass::Double);
        let output = self.make_temporary(
            "flat",
            VariableType::Matrix(MatrixType::new(element, TypeShape::column())),
        );
        self.add_instruction(Instruction::VerticalFlatten {
            output: output.clone(),
            input: input.to_string(),
        });
        output
    }

    /// Emits a runtime check of `condition`.
    pub fn add_validate_true(&mut self, condition: &str) {
        self.add_instruction(Instruction::ValidateTrue {
            condition: condition.to_string(),
        });
    }

    /// Ends the current block; `continuation` takes over its outgoing edges.
    fn split(&mut self, continuation: BlockId) {
        let block = self.block;
        assert!(
            !self.current().has_ending_instruction(),
            "block {} already ends with a control transfer",
            block
        );
        self.body.break_block(block, continuation);
    }

    /// Opens a two-way branch on `condition`.
    ///
    /// The insertion point moves to the `then` block.
    ///
    /// # Panics
    ///
    /// Panics if the insertion block already ends with a control transfer.
    pub fn make_branch(&mut self, condition: &str) -> BranchHandles {
        let then_block = self.body.new_block();
        let else_block = self.body.new_block();
        let join_block = self.body.new_block();
        self.split(join_block);

        self.current().add_instruction(Instruction::Branch {
            condition: condition.to_string(),
            true_block: then_block,
            false_block: else_block,
            end_block: join_block,
        });
        self.block = then_block;

        BranchHandles {
            then_block,
            else_block,
            join_block,
        }
    }

    /// Opens a counted loop `for start:interval:end`.
    ///
    /// The loop block is seeded with the `iter` instruction and becomes the
    /// insertion point.
    ///
    /// # Panics
    ///
    /// Panics if the insertion block already ends with a control transfer.
    pub fn make_for_loop(&mut self, start: &str, interval: &str, end: &str) -> ForLoopHandles {
        let loop_block = self.body.new_block();
        let end_block = self.body.new_block();
        self.split(end_block);

        self.current().add_instruction(Instruction::For(ForLoop::new(
            start, interval, end, loop_block, end_block,
        )));

        let integral = [start, interval]
            .iter()
            .all(|v| self.types.variable_type(v).is_some_and(|t| t.is_integer()));
        let ty = if integral {
            VariableType::int()
        } else {
            VariableType::double()
        };
        let iter = self.make_temporary("iter", ty);

        self.block = loop_block;
        self.add_instruction(Instruction::Iter {
            output: iter.clone(),
        });
        if let Some(sizes) = self.sizes.as_deref_mut() {
            if sizes.is_known_positive(interval) {
                sizes.set_at_least(&iter, start);
                sizes.set_up_to(&iter, end);
            }
        }

        ForLoopHandles {
            loop_block,
            end_block,
            iter,
        }
    }

    /// Merges `inputs` arriving from `sources` into a fresh variable.
    ///
    /// The phi is placed after the existing phis of the insertion block.
    /// `sources` must name region ends (see [`region_end`](Self::region_end)).
    ///
    /// # Panics
    ///
    /// Panics if `inputs` is empty or its length differs from `sources`.
    pub fn add_phi_merge(&mut self, inputs: Vec<String>, sources: Vec<BlockId>) -> String {
        assert!(!inputs.is_empty(), "phi merge without inputs");
        let ty = self
            .types
            .variable_type(&inputs[0])
            .map_or(VariableType::Opaque, |t| t.without_constant());
        let output = self.make_temporary("merge", ty);
        self.add_phi(&output, inputs, sources);
        output
    }

    /// Like [`add_phi_merge`](Self::add_phi_merge), writing to an existing
    /// name.
    ///
    /// # Panics
    ///
    /// Panics if the lengths of `inputs` and `sources` differ.
    pub fn add_phi(&mut self, output: &str, inputs: Vec<String>, sources: Vec<BlockId>) {
        assert_eq!(inputs.len(), sources.len(), "phi inputs and sources differ");
        let phi = Instruction::Phi(PhiNode::new(output, inputs, sources));
        self.learn(&phi);
        let current = self.current();
        let index = current.after_phi_insertion_point();
        current.insert_instruction(index, phi);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        analysis::{validate, VariableTypes},
        compiler::services::StandardBuiltins,
    };

    fn typed() -> (FunctionBody, VariableTypes) {
        let mut body = FunctionBody::new("f");
        body.block_mut(BlockId::ENTRY)
            .unwrap()
            .add_instruction(Instruction::Argument {
                output: "n".into(),
                index: 0,
            });
        let types = VariableTypes::from_pairs([("n", VariableType::int())]);
        (body, types)
    }

    #[test]
    fn test_counted_loop_with_carried_value() {
        let (mut body, mut types) = typed();
        let builtins = StandardBuiltins;
        {
            let mut editor = BlockEditor::new(&mut body, &mut types, &builtins, BlockId::ENTRY);
            let one = editor.add_make_integer("one", 1);
            let zero = editor.add_make_integer("zero", 0);
            let container = editor.block();

            let handles = editor.make_for_loop(&one, &one, "n");
            let sum_end = editor.make_temporary("sum", VariableType::int());
            let sum_start = editor.make_temporary("sum", VariableType::int());
            let back = editor.region_end(handles.loop_block);
            editor.add_phi(
                &sum_start,
                vec![zero.clone(), sum_end.clone()],
                vec![container, back],
            );
            editor
                .add_call_to("plus", vec![sum_end.clone()], vec![sum_start, handles.iter])
                .unwrap();

            editor.set_block(handles.end_block);
            let back = editor.region_end(handles.loop_block);
            let result = editor.add_phi_merge(vec![zero, sum_end], vec![container, back]);
            assert!(result.starts_with("$merge$"));
        }

        assert_eq!(body.block_count(), 3);
        validate(&body).unwrap();
    }

    #[test]
    fn test_split_redirects_phis() {
        // #0: for #1, #2 ; #1: x2 = phi(#0: x1, #1: x3) ; x3 = ... ; #2
        let (mut body, mut types) = typed();
        let l = body.new_block();
        let e = body.new_block();
        {
            let entry = body.block_mut(BlockId::ENTRY).unwrap();
            entry.add_instruction(Instruction::assign_integer("x1", 0));
            entry.add_instruction(Instruction::For(ForLoop::new("n", "n", "n", l, e)));
        }
        body.block_mut(l).unwrap().add_instruction(Instruction::Phi(PhiNode::new(
            "x2",
            vec!["x1".into(), "x3".into()],
            vec![BlockId::ENTRY, l],
        )));
        body.block_mut(l)
            .unwrap()
            .add_instruction(Instruction::assign_variable("x3", "x2"));
        for name in ["x1", "x2", "x3"] {
            types.add_variable(name, VariableType::int());
        }

        let builtins = StandardBuiltins;
        let handles = {
            let mut editor = BlockEditor::new(&mut body, &mut types, &builtins, l);
            let handles = editor.make_branch("n");
            editor.set_block(handles.join_block);
            handles
        };

        let phi = body.block(l).unwrap().phis().next().unwrap().clone();
        assert_eq!(phi.input_from(handles.join_block), Some("x3"));
        assert_eq!(body.block_end(l), handles.join_block);
    }

    #[test]
    fn test_unknown_builtin_is_an_error() {
        let (mut body, mut types) = typed();
        let builtins = StandardBuiltins;
        let mut editor = BlockEditor::new(&mut body, &mut types, &builtins, BlockId::ENTRY);
        assert!(matches!(
            editor.add_simple_call("fft", vec!["n".into()]),
            Err(Error::UnknownFunction(_))
        ));
        assert!(matches!(
            editor.add_simple_call("numel", vec!["ghost".into()]),
            Err(Error::UnknownVariable(_))
        ));
    }

    #[test]
    #[should_panic(expected = "already ends")]
    fn test_double_link_panics() {
        let (mut body, mut types) = typed();
        let builtins = StandardBuiltins;
        let mut editor = BlockEditor::new(&mut body, &mut types, &builtins, BlockId::ENTRY);
        editor.make_branch("n");
        editor.set_block(BlockId::ENTRY);
        editor.make_branch("n");
    }

    #[test]
    fn test_size_info_is_taught() {
        let (mut body, mut types) = typed();
        let builtins = StandardBuiltins;
        let mut sizes = SizeGroupInformation::new();
        let (a, b, count) = {
            let mut editor = BlockEditor::new(&mut body, &mut types, &builtins, BlockId::ENTRY)
                .with_size_info(&mut sizes);
            let a = editor
                .add_simple_call("zeros", vec!["n".into(), "n".into()])
                .unwrap();
            let b = editor
                .add_simple_call("matisse_new_array_from_matrix", vec![a.clone()])
                .unwrap();
            let count = editor.add_simple_call("numel", vec![b.clone()]).unwrap();
            (a, b, count)
        };

        assert!(sizes.are_same_size(&a, &b));
        assert!(sizes.have_same_numel(&a, &b));
        let numel = sizes.get_numel_result(&a);
        assert!(sizes.are_same_value(&numel, &count));
    }
}
