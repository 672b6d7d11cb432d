//! Fixtures for tests and benchmarks.
//!
//! [`FunctionBuilder`] assembles a [`TypedFunction`] block by block. The
//! associated constructors build the small programs the passes are tested
//! on; each documents its shape.

use crate::{
    analysis::{
        BlockId, ForLoop, FunctionBody, Instruction, PhiNode, TypeProvider, TypeShape,
        VariableType, VariableTypes,
    },
    compiler::TypedFunction,
};

/// Incremental builder of a typed function.
#[derive(Debug, Clone)]
pub struct FunctionBuilder {
    body: FunctionBody,
    types: VariableTypes,
    current: BlockId,
    arguments: usize,
}

fn matrix() -> VariableType {
    VariableType::double_matrix(TypeShape::with_ndims(2))
}

fn row() -> VariableType {
    VariableType::double_matrix(TypeShape::from_dims(vec![Some(1), None]))
}

impl FunctionBuilder {
    /// Starts a function with an empty entry block.
    #[must_use]
    pub fn new(name: &str) -> Self {
        FunctionBuilder {
            body: FunctionBody::new(name),
            types: VariableTypes::new(),
            current: BlockId::ENTRY,
            arguments: 0,
        }
    }

    /// Appends a fresh block and returns its id.
    pub fn new_block(&mut self) -> BlockId {
        self.body.new_block()
    }

    /// Moves the insertion point to `block`.
    pub fn at(&mut self, block: BlockId) -> &mut Self {
        self.current = block;
        self
    }

    /// Records the type of `name`.
    pub fn typed(&mut self, name: &str, ty: VariableType) -> &mut Self {
        self.types.add_variable(name, ty);
        self
    }

    /// Declares the next function argument.
    pub fn argument(&mut self, name: &str, ty: VariableType) -> &mut Self {
        let index = self.arguments;
        self.arguments += 1;
        self.typed(name, ty).push(Instruction::Argument {
            output: name.into(),
            index,
        })
    }

    /// Appends an instruction to the current block.
    ///
    /// # Panics
    ///
    /// Panics if the current block does not exist.
    pub fn push(&mut self, instruction: Instruction) -> &mut Self {
        match self.body.block_mut(self.current) {
            Some(block) => block.add_instruction(instruction),
            None => panic!("fixture block {} does not exist", self.current),
        }
        self
    }

    /// Appends `output = function(inputs)`.
    pub fn call(&mut self, output: &str, function: &str, inputs: &[&str]) -> &mut Self {
        self.push(Instruction::call(
            function,
            vec![output.into()],
            inputs.iter().map(|i| (*i).to_string()).collect(),
        ))
    }

    /// Appends a call without outputs, such as `disp`.
    pub fn effect(&mut self, function: &str, inputs: &[&str]) -> &mut Self {
        self.push(Instruction::call(
            function,
            Vec::new(),
            inputs.iter().map(|i| (*i).to_string()).collect(),
        ))
    }

    /// Appends a phi.
    pub fn phi(&mut self, output: &str, operands: &[(BlockId, &str)]) -> &mut Self {
        self.push(Instruction::Phi(PhiNode::new(
            output,
            operands.iter().map(|(_, v)| (*v).to_string()).collect(),
            operands.iter().map(|(b, _)| *b).collect(),
        )))
    }

    /// Ends the current block with `for start, interval, end`.
    pub fn for_loop(
        &mut self,
        start: &str,
        interval: &str,
        end: &str,
        loop_block: BlockId,
        end_block: BlockId,
    ) -> &mut Self {
        self.push(Instruction::For(ForLoop::new(
            start, interval, end, loop_block, end_block,
        )))
    }

    /// Appends `output = iter`.
    pub fn iter(&mut self, output: &str) -> &mut Self {
        self.push(Instruction::Iter {
            output: output.into(),
        })
    }

    /// Appends `output = simple_get matrix(indices)`.
    pub fn get(&mut self, output: &str, matrix: &str, indices: &[&str]) -> &mut Self {
        self.push(Instruction::SimpleGet {
            output: output.into(),
            matrix: matrix.into(),
            indices: indices.iter().map(|i| (*i).to_string()).collect(),
        })
    }

    /// Appends `output = simple_set matrix(indices) = value`.
    pub fn set(&mut self, output: &str, matrix: &str, indices: &[&str], value: &str) -> &mut Self {
        self.push(Instruction::SimpleSet {
            output: output.into(),
            matrix: matrix.into(),
            indices: indices.iter().map(|i| (*i).to_string()).collect(),
            value: value.into(),
        })
    }

    /// Finishes the function.
    #[must_use]
    pub fn build(&self) -> TypedFunction {
        TypedFunction::new(self.body.clone(), self.types.clone())
    }

    /// Two adjacent loops over `1:numel(A)` copying `A` into `X` and `Y`.
    ///
    /// ```text
    /// #0: A = argument 0; one = 1; n = numel A
    ///     X$1 = matisse_new_array_from_matrix A; Y$1 = ...(A)
    ///     for one, one, n, #1, #2
    /// #1: X$2 = phi #0:X$1, #1:X$3; i = iter; a = simple_get A(i)
    ///     X$3 = simple_set X$2(i) = a
    /// #2: X$4 = phi #0:X$1, #1:X$3
    ///     for one, one, n, #3, #4
    /// #3: Y$2 = phi #2:Y$1, #3:Y$3; j = iter; b = simple_get A(j)
    ///     Y$3 = simple_set Y$2(j) = b
    /// #4: Y$4 = phi #2:Y$1, #3:Y$3; disp X$4; disp Y$4
    /// ```
    ///
    /// With `side_effects`, both bodies also `disp` the element they read.
    #[must_use]
    pub fn two_fill_loops(name: &str, side_effects: bool) -> TypedFunction {
        let mut f = FunctionBuilder::new(name);
        let first = f.new_block();
        let middle = f.new_block();
        let second = f.new_block();
        let end = f.new_block();
        let entry = BlockId::ENTRY;

        for (var, ty) in [
            ("one", VariableType::int_constant(1)),
            ("n", VariableType::int()),
            ("i", VariableType::int()),
            ("j", VariableType::int()),
            ("a", VariableType::double()),
            ("b", VariableType::double()),
        ] {
            f.typed(var, ty);
        }
        for var in ["X$1", "X$2", "X$3", "X$4", "Y$1", "Y$2", "Y$3", "Y$4"] {
            f.typed(var, matrix());
        }

        f.argument("A", matrix())
            .push(Instruction::assign_integer("one", 1))
            .call("n", "numel", &["A"])
            .call("X$1", "matisse_new_array_from_matrix", &["A"])
            .call("Y$1", "matisse_new_array_from_matrix", &["A"])
            .for_loop("one", "one", "n", first, middle);

        f.at(first)
            .phi("X$2", &[(entry, "X$1"), (first, "X$3")])
            .iter("i")
            .get("a", "A", &["i"]);
        if side_effects {
            f.effect("disp", &["a"]);
        }
        f.set("X$3", "X$2", &["i"], "a");

        f.at(middle)
            .phi("X$4", &[(entry, "X$1"), (first, "X$3")])
            .for_loop("one", "one", "n", second, end);

        f.at(second)
            .phi("Y$2", &[(middle, "Y$1"), (second, "Y$3")])
            .iter("j")
            .get("b", "A", &["j"]);
        if side_effects {
            f.effect("disp", &["b"]);
        }
        f.set("Y$3", "Y$2", &["j"], "b");

        f.at(end)
            .phi("Y$4", &[(middle, "Y$1"), (second, "Y$3")])
            .effect("disp", &["X$4"])
            .effect("disp", &["Y$4"]);

        f.build()
    }

    /// A two-deep nest copying `A(j, i)` with `i` outermost.
    ///
    /// ```text
    /// #0: A = argument 0; m = argument 1; n = argument 2; one = 1
    ///     X$1 = matisse_new_array_from_matrix A
    ///     for one, one, n, #1, #2
    /// #1: X$2 = phi #0:X$1, #4:X$5; i = iter
    ///     for one, one, m, #3, #4
    /// #2: X$6 = phi #0:X$1, #4:X$5; disp X$6
    /// #3: X$3 = phi #1:X$2, #3:X$4; j = iter; a = simple_get A(j, i)
    ///     X$4 = simple_set X$3(j, i) = a
    /// #4: X$5 = phi #1:X$2, #3:X$4
    /// ```
    ///
    /// With `side_effects`, the inner body also `disp`s the element.
    #[must_use]
    pub fn transposed_copy(name: &str, side_effects: bool) -> TypedFunction {
        let mut f = FunctionBuilder::new(name);
        let outer = f.new_block();
        let after = f.new_block();
        let inner = f.new_block();
        let inner_after = f.new_block();
        let entry = BlockId::ENTRY;

        for (var, ty) in [
            ("one", VariableType::int_constant(1)),
            ("i", VariableType::int()),
            ("j", VariableType::int()),
            ("a", VariableType::double()),
        ] {
            f.typed(var, ty);
        }
        for var in ["X$1", "X$2", "X$3", "X$4", "X$5", "X$6"] {
            f.typed(var, matrix());
        }

        f.argument("A", matrix())
            .argument("m", VariableType::int())
            .argument("n", VariableType::int())
            .push(Instruction::assign_integer("one", 1))
            .call("X$1", "matisse_new_array_from_matrix", &["A"])
            .for_loop("one", "one", "n", outer, after);

        f.at(outer)
            .phi("X$2", &[(entry, "X$1"), (inner_after, "X$5")])
            .iter("i")
            .for_loop("one", "one", "m", inner, inner_after);

        f.at(after)
            .phi("X$6", &[(entry, "X$1"), (inner_after, "X$5")])
            .effect("disp", &["X$6"]);

        f.at(inner)
            .phi("X$3", &[(outer, "X$2"), (inner, "X$4")])
            .iter("j")
            .get("a", "A", &["j", "i"]);
        if side_effects {
            f.effect("disp", &["a"]);
        }
        f.set("X$4", "X$3", &["j", "i"], "a");

        f.at(inner_after)
            .phi("X$5", &[(outer, "X$2"), (inner, "X$4")]);

        f.build()
    }

    /// A 2-D fill nest followed by a flat loop reading the filled matrix
    /// linearly.
    ///
    /// ```text
    /// #0: m = argument 0; n = argument 1; one = 1
    ///     X$1 = zeros m, n; Y$1 = zeros m, n
    ///     for one, one, n, #1, #2
    /// #1: X$2 = phi #0:X$1, #4:X$5; i = iter
    ///     for one, one, m, #3, #4
    /// #2: X$6 = phi #0:X$1, #4:X$5; k = numel X$6
    ///     for one, one, k, #5, #6
    /// #3: X$3 = phi #1:X$2, #3:X$4; j = iter; v = plus i, j
    ///     X$4 = simple_set X$3(j, i) = v
    /// #4: X$5 = phi #1:X$2, #3:X$4
    /// #5: Y$2 = phi #2:Y$1, #5:Y$3; p = iter; w = simple_get X$6(p)
    ///     Y$3 = simple_set Y$2(p) = w
    /// #6: Y$4 = phi #2:Y$1, #5:Y$3; disp Y$4; disp X$6
    /// ```
    #[must_use]
    pub fn nest_then_flat(name: &str) -> TypedFunction {
        let mut f = FunctionBuilder::new(name);
        let outer = f.new_block();
        let middle = f.new_block();
        let inner = f.new_block();
        let inner_after = f.new_block();
        let flat = f.new_block();
        let end = f.new_block();
        let entry = BlockId::ENTRY;

        for (var, ty) in [
            ("one", VariableType::int_constant(1)),
            ("k", VariableType::int()),
            ("i", VariableType::int()),
            ("j", VariableType::int()),
            ("p", VariableType::int()),
            ("v", VariableType::int()),
            ("w", VariableType::double()),
        ] {
            f.typed(var, ty);
        }
        for var in [
            "X$1", "X$2", "X$3", "X$4", "X$5", "X$6", "Y$1", "Y$2", "Y$3", "Y$4",
        ] {
            f.typed(var, matrix());
        }

        f.argument("m", VariableType::int())
            .argument("n", VariableType::int())
            .push(Instruction::assign_integer("one", 1))
            .call("X$1", "zeros", &["m", "n"])
            .call("Y$1", "zeros", &["m", "n"])
            .for_loop("one", "one", "n", outer, middle);

        f.at(outer)
            .phi("X$2", &[(entry, "X$1"), (inner_after, "X$5")])
            .iter("i")
            .for_loop("one", "one", "m", inner, inner_after);

        f.at(middle)
            .phi("X$6", &[(entry, "X$1"), (inner_after, "X$5")])
            .call("k", "numel", &["X$6"])
            .for_loop("one", "one", "k", flat, end);

        f.at(inner)
            .phi("X$3", &[(outer, "X$2"), (inner, "X$4")])
            .iter("j")
            .call("v", "plus", &["i", "j"])
            .set("X$4", "X$3", &["j", "i"], "v");

        f.at(inner_after)
            .phi("X$5", &[(outer, "X$2"), (inner, "X$4")]);

        f.at(flat)
            .phi("Y$2", &[(middle, "Y$1"), (flat, "Y$3")])
            .iter("p")
            .get("w", "X$6", &["p"])
            .set("Y$3", "Y$2", &["p"], "w");

        f.at(end)
            .phi("Y$4", &[(middle, "Y$1"), (flat, "Y$3")])
            .effect("disp", &["Y$4"])
            .effect("disp", &["X$6"]);

        f.build()
    }

    /// `X = zeros(dims)` overwritten element by element over `1:n`.
    ///
    /// ```text
    /// #0: n = argument 0; one = 1; X$1 = zeros dims
    ///     for one, one, n, #1, #2
    /// #1: X$2 = phi #0:X$1, #1:X$3; i = iter
    ///     X$3 = simple_set X$2(i) = i
    /// #2: X$4 = phi #0:X$1, #1:X$3; k = numel X$4; disp k
    /// ```
    ///
    /// `dims` may name `n` and `one`.
    #[must_use]
    pub fn zeros_fill(name: &str, dims: &[&str]) -> TypedFunction {
        let mut f = FunctionBuilder::new(name);
        let body = f.new_block();
        let end = f.new_block();
        let entry = BlockId::ENTRY;

        for (var, ty) in [
            ("one", VariableType::int_constant(1)),
            ("i", VariableType::int()),
            ("k", VariableType::int()),
        ] {
            f.typed(var, ty);
        }
        let shape = if dims.len() == 1 { matrix() } else { row() };
        for var in ["X$1", "X$2", "X$3", "X$4"] {
            f.typed(var, shape.clone());
        }

        f.argument("n", VariableType::int())
            .push(Instruction::assign_integer("one", 1))
            .call("X$1", "zeros", dims)
            .for_loop("one", "one", "n", body, end);

        f.at(body)
            .phi("X$2", &[(entry, "X$1"), (body, "X$3")])
            .iter("i")
            .set("X$3", "X$2", &["i"], "i");

        f.at(end)
            .phi("X$4", &[(entry, "X$1"), (body, "X$3")])
            .call("k", "numel", &["X$4"])
            .effect("disp", &["k"]);

        f.build()
    }

    /// `Y = A(:)` of a 2-D matrix, then `disp Y`.
    #[must_use]
    pub fn flatten(name: &str) -> TypedFunction {
        let mut f = FunctionBuilder::new(name);
        f.typed("Y", VariableType::double_matrix(TypeShape::column()))
            .argument("A", matrix())
            .push(Instruction::VerticalFlatten {
                output: "Y".into(),
                input: "A".into(),
            })
            .effect("disp", &["Y"]);
        f.build()
    }

    /// `X = colon(one, n)`, then `disp X`.
    #[must_use]
    pub fn range(name: &str) -> TypedFunction {
        let mut f = FunctionBuilder::new(name);
        f.typed("one", VariableType::int_constant(1))
            .typed("X", row())
            .argument("n", VariableType::int())
            .push(Instruction::assign_integer("one", 1))
            .call("X", "colon", &["one", "n"])
            .effect("disp", &["X"]);
        f.build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::validate;

    #[test]
    fn test_fixtures_are_valid() {
        for function in [
            FunctionBuilder::two_fill_loops("a", false),
            FunctionBuilder::two_fill_loops("b", true),
            FunctionBuilder::transposed_copy("c", false),
            FunctionBuilder::nest_then_flat("d"),
            FunctionBuilder::zeros_fill("e", &["one", "n"]),
            FunctionBuilder::flatten("f"),
            FunctionBuilder::range("g"),
        ] {
            validate(&function.body).unwrap();
        }
    }

    #[test]
    fn test_arguments_are_numbered() {
        let mut f = FunctionBuilder::new("f");
        f.argument("a", VariableType::int())
            .argument("b", VariableType::int());
        let function = f.build();
        let indices: Vec<usize> = function
            .body
            .iter_instructions()
            .filter_map(|(_, i)| match i {
                Instruction::Argument { index, .. } => Some(*index),
                _ => None,
            })
            .collect();
        assert_eq!(indices, [0, 1]);
        assert!(function.types.variable_type("b").is_some());
    }
}
