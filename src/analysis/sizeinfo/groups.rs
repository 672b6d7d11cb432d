//! Size groups of matrices.

use std::{
    collections::{BTreeMap, HashMap},
    fmt,
};

use crate::analysis::{
    sizeinfo::ScalarValueInformation,
    ssa::{AssignmentInput, Instruction, RangeIndex, TypeProvider, TypeShape, VariableType},
};

/// Builtins whose single output has the size of their matrix operands.
const ELEMENTWISE_FUNCTIONS: &[&str] = &[
    "plus", "minus", "times", "rdivide", "ldivide", "power", "uminus", "not", "eq", "ne", "lt",
    "le", "gt", "ge", "and", "or", "fix", "floor", "ceil", "round", "abs", "sqrt", "exp", "log",
    "sin", "cos", "mod", "rem",
];

/// Symbolic size of one group of matrices.
///
/// Every entry names a scalar (either a real variable or a `#N` meta name)
/// known to hold the corresponding size.
#[derive(Debug, Clone, Default)]
struct SizeCategory {
    numel: Option<String>,
    /// Size of dimension `d`
    dims: BTreeMap<usize, String>,
    /// Product of the sizes of dimensions `d..`
    dims_since: BTreeMap<usize, String>,
}

impl fmt::Display for SizeCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "numel={}", self.numel.as_deref().unwrap_or("?"))?;
        for (d, v) in &self.dims {
            write!(f, " d{}={}", d, v)?;
        }
        for (d, v) in &self.dims_since {
            write!(f, " d{}..={}", d, v)?;
        }
        Ok(())
    }
}

/// Symbolic size-equality oracle for the matrices of one function.
///
/// Matrices that are known to have the same size share a *size group*. Each
/// group records which scalars hold its number of elements and its dimension
/// sizes, and the scalar values themselves are reasoned about by the embedded
/// [`ScalarValueInformation`].
///
/// Every query is conservative: `true` means proven, `false` means unknown.
/// [`are_same_size`](Self::are_same_size) implies
/// [`have_same_numel`](Self::have_same_numel).
///
/// The information is a snapshot of the function it was built from. After a
/// rewrite it is either rebuilt or taught the new instructions through
/// [`add_instruction_information`](Self::add_instruction_information).
#[derive(Debug, Clone, Default)]
pub struct SizeGroupInformation {
    scalars: ScalarValueInformation,
    categories: Vec<SizeCategory>,
    sizes: HashMap<String, usize>,
    size_matrices: HashMap<String, usize>,
    types: HashMap<String, VariableType>,
    meta_names: usize,
}

impl SizeGroupInformation {
    /// Creates an empty oracle.
    #[must_use]
    pub fn new() -> Self {
        SizeGroupInformation::default()
    }

    /// Independent copy used for speculative reasoning.
    #[must_use]
    pub fn copy(&self) -> Self {
        self.clone()
    }

    /// The scalar oracle.
    #[must_use]
    pub fn scalars(&self) -> &ScalarValueInformation {
        &self.scalars
    }

    /// Records the inferred type of `name`.
    pub fn learn_type(&mut self, name: &str, ty: VariableType) {
        if let Some(constant) = ty.constant() {
            self.scalars.learn_constant(name, constant);
        }
        self.types.insert(name.to_string(), ty);
    }

    /// Records the inferred types of every name in `names` that `types` knows.
    pub fn learn_types<'a>(
        &mut self,
        types: &dyn TypeProvider,
        names: impl IntoIterator<Item = &'a str>,
    ) {
        for name in names {
            if self.types.contains_key(name) {
                continue;
            }
            if let Some(ty) = types.variable_type(name) {
                self.learn_type(name, ty);
            }
        }
    }

    fn matrix_shape(&self, name: &str) -> Option<&TypeShape> {
        match self.types.get(name) {
            Some(VariableType::Matrix(m)) => Some(&m.shape),
            _ => None,
        }
    }

    fn matrix_ndims(&self, name: &str) -> Option<usize> {
        self.matrix_shape(name).and_then(TypeShape::ndims)
    }

    fn is_matrix(&self, name: &str) -> bool {
        self.types.get(name).is_some_and(VariableType::is_matrix)
    }

    fn is_scalar(&self, name: &str) -> bool {
        self.types.get(name).is_some_and(VariableType::is_scalar)
    }

    fn generate_meta_name(&mut self) -> String {
        self.meta_names += 1;
        format!("#{}", self.meta_names)
    }

    fn meta_constant(&mut self, value: f64) -> String {
        let name = self.generate_meta_name();
        self.scalars.specify_constant(&name, value);
        name
    }

    fn size_group(&mut self, matrix: &str) -> usize {
        if let Some(&group) = self.sizes.get(matrix) {
            return group;
        }
        self.categories.push(SizeCategory::default());
        let id = self.categories.len() - 1;
        self.sizes.insert(matrix.to_string(), id);
        id
    }

    /// Declares that `matrix` has `numel` elements.
    pub fn build_matrix_from_numel(&mut self, matrix: &str, numel: &str) {
        self.build_numel(matrix, numel);
    }

    /// Declares that `output` has the size of `input`.
    pub fn build_matrix_with_same_size(&mut self, output: &str, input: &str) {
        let group = self.size_group(input);
        self.sizes.insert(output.to_string(), group);
    }

    /// Declares that the scalar `numel` is the number of elements of `matrix`.
    pub fn build_numel(&mut self, matrix: &str, numel: &str) {
        let group = self.size_group(matrix);
        match self.categories[group].numel.clone() {
            Some(existing) => self.scalars.add_alias(&existing, numel),
            None => self.categories[group].numel = Some(numel.to_string()),
        }
    }

    /// Declares that the scalar `size` is dimension `index` (0-based) of
    /// `matrix`.
    pub fn build_size(&mut self, matrix: &str, index: usize, size: &str) {
        let group = self.size_group(matrix);
        match self.categories[group].dims.get(&index).cloned() {
            Some(existing) => self.scalars.add_alias(&existing, size),
            None => {
                self.categories[group]
                    .dims
                    .insert(index, size.to_string());
            }
        }
    }

    /// Declares that the scalar `size` is the product of dimensions `index..`
    /// of `matrix`.
    pub fn build_size_since(&mut self, matrix: &str, index: usize, size: &str) {
        if index == 0 {
            self.build_numel(matrix, size);
            return;
        }
        if self.matrix_ndims(matrix) == Some(index + 1) {
            self.build_size(matrix, index, size);
            return;
        }

        let group = self.size_group(matrix);
        match self.categories[group].dims_since.get(&index).cloned() {
            Some(existing) => self.scalars.add_alias(&existing, size),
            None => {
                self.categories[group]
                    .dims_since
                    .insert(index, size.to_string());
            }
        }
    }

    /// Declares that dimension `index` of `matrix` is at least `minimum`.
    pub fn set_size_at_least(&mut self, matrix: &str, index: usize, minimum: &str) {
        let group = self.size_group(matrix);
        let dim = match self.categories[group].dims.get(&index).cloned() {
            Some(dim) => dim,
            None => {
                let dim = self.generate_meta_name();
                self.categories[group].dims.insert(index, dim.clone());
                dim
            }
        };
        self.scalars.set_at_least(&dim, minimum);
    }

    /// Declares that the product of dimensions `index..` of `matrix` is at
    /// least `minimum`.
    pub fn set_size_since_at_least(&mut self, matrix: &str, index: usize, minimum: &str) {
        if index == 0 {
            self.set_numel_at_least(matrix, minimum);
            return;
        }
        if self.matrix_ndims(matrix) == Some(index + 1) {
            self.set_size_at_least(matrix, index, minimum);
            return;
        }

        let group = self.size_group(matrix);
        let dim = match self.categories[group].dims_since.get(&index).cloned() {
            Some(dim) => dim,
            None => {
                let dim = self.generate_meta_name();
                self.categories[group].dims_since.insert(index, dim.clone());
                dim
            }
        };
        self.scalars.set_at_least(&dim, minimum);
    }

    /// Declares that `matrix` has at least `minimum` elements.
    pub fn set_numel_at_least(&mut self, matrix: &str, minimum: &str) {
        let numel = self.get_numel_result(matrix);
        self.scalars.set_at_least(&numel, minimum);
    }

    /// Scalar holding the number of elements of `matrix`.
    ///
    /// A meta name is minted if no variable is known to hold it.
    pub fn get_numel_result(&mut self, matrix: &str) -> String {
        let group = self.size_group(matrix);
        if let Some(numel) = &self.categories[group].numel {
            return numel.clone();
        }

        let numel = self.generate_meta_name();
        if let Some(value) = self.matrix_shape(matrix).and_then(TypeShape::numel) {
            self.scalars.specify_constant(&numel, value as f64);
        }
        self.categories[group].numel = Some(numel.clone());
        numel
    }

    /// Records that `shape` is the result of `size(matrix)`.
    pub fn build_size_shape(&mut self, matrix: &str, shape: &str) {
        let group = self.size_group(matrix);
        self.size_matrices.insert(shape.to_string(), group);
    }

    /// Scalar holding dimension `index` (0-based) of `matrix`.
    pub fn get_size_result(&mut self, matrix: &str, index: usize) -> String {
        let size = self.generate_meta_name();
        self.build_size(matrix, index, &size);
        if let Some(dim) = self.matrix_shape(matrix).and_then(|s| s.dim(index)) {
            self.scalars.specify_constant(&size, dim as f64);
        }
        size
    }

    /// Scalar holding the product of dimensions `index..` of `matrix`.
    pub fn get_size_since_result(&mut self, matrix: &str, index: usize) -> String {
        if index == 0 {
            return self.get_numel_result(matrix);
        }

        let size = self.generate_meta_name();
        self.build_size_since(matrix, index, &size);

        let known = self.matrix_shape(matrix).and_then(|shape| {
            let ndims = shape.ndims()?;
            (index..ndims.max(index + 1)).try_fold(1usize, |acc, d| shape.dim(d).map(|v| acc * v))
        });
        if let Some(value) = known {
            self.scalars.specify_constant(&size, value as f64);
        }
        size
    }

    /// Returns `true` if the scalars `a` and `b` are known to be equal.
    #[must_use]
    pub fn are_same_value(&self, a: &str, b: &str) -> bool {
        self.scalars.are_same_value(a, b)
    }

    /// Returns `true` if the scalar `a` is known to equal `value`.
    #[must_use]
    pub fn is_known_equal(&self, a: &str, value: f64) -> bool {
        self.scalars.is_known_equal(a, value)
    }

    /// Returns `true` if `a <= b` is proven.
    #[must_use]
    pub fn is_known_less_or_equal(&self, a: &str, b: &str) -> bool {
        self.scalars.is_known_less_or_equal(a, b)
    }

    /// Returns `true` if `a < b` is proven.
    #[must_use]
    pub fn is_known_less_than(&self, a: &str, b: &str) -> bool {
        self.scalars.is_known_less_than(a, b)
    }

    /// Returns `true` if `a > 0` is proven.
    #[must_use]
    pub fn is_known_positive(&self, a: &str) -> bool {
        self.scalars.is_known_positive(a)
    }

    /// States that the scalars `a` and `b` hold the same value.
    pub fn add_alias(&mut self, a: &str, b: &str) {
        self.scalars.add_alias(a, b);
    }

    /// Declares that the logical `condition` holds.
    pub fn set_true(&mut self, condition: &str) {
        self.scalars.set_true(condition);
    }

    /// Records `value <= maximum`.
    pub fn set_up_to(&mut self, value: &str, maximum: &str) {
        self.scalars.set_up_to(value, maximum);
    }

    /// Records `value >= minimum`.
    pub fn set_at_least(&mut self, value: &str, minimum: &str) {
        self.scalars.set_at_least(value, minimum);
    }

    /// Returns `true` if `a` and `b` are proven to have the same size.
    #[must_use]
    pub fn are_same_size(&self, a: &str, b: &str) -> bool {
        if a == b {
            return true;
        }

        if let (Some(sa), Some(sb)) = (self.matrix_shape(a), self.matrix_shape(b)) {
            if sa.numel().is_some() && sa == sb {
                return true;
            }
        }

        let (Some(&ga), Some(&gb)) = (self.sizes.get(a), self.sizes.get(b)) else {
            return false;
        };
        if ga == gb {
            return true;
        }

        let (Some(ndims_a), Some(ndims_b)) = (self.matrix_ndims(a), self.matrix_ndims(b)) else {
            return false;
        };

        let common = ndims_a.min(ndims_b);
        let (ca, cb) = (&self.categories[ga], &self.categories[gb]);
        for dim in 0..common {
            let (Some(da), Some(db)) = (ca.dims.get(&dim), cb.dims.get(&dim)) else {
                return false;
            };
            if !self.are_same_value(da, db) {
                return false;
            }
        }

        if ndims_a > common {
            self.matrix_is_flat_since(ga, common, ndims_a)
        } else if ndims_b > common {
            self.matrix_is_flat_since(gb, common, ndims_b)
        } else {
            true
        }
    }

    fn matrix_is_flat_since(&self, group: usize, start: usize, ndims: usize) -> bool {
        let category = &self.categories[group];
        for dim in start..ndims {
            if category
                .dims_since
                .get(&dim)
                .is_some_and(|d| self.scalars.is_known_equal(d, 1.0))
            {
                return true;
            }
            match category.dims.get(&dim) {
                Some(d) if self.scalars.is_known_equal(d, 1.0) => {}
                _ => return false,
            }
        }
        true
    }

    /// Returns `true` if `a` and `b` are proven to have the same number of
    /// elements.
    #[must_use]
    pub fn have_same_numel(&self, a: &str, b: &str) -> bool {
        if self.are_same_size(a, b) {
            return true;
        }

        if let (Some(na), Some(nb)) = (
            self.matrix_shape(a).and_then(TypeShape::numel),
            self.matrix_shape(b).and_then(TypeShape::numel),
        ) {
            if na == nb {
                return true;
            }
        }

        let (Some(&ga), Some(&gb)) = (self.sizes.get(a), self.sizes.get(b)) else {
            return false;
        };
        match (&self.categories[ga].numel, &self.categories[gb].numel) {
            (Some(na), Some(nb)) => self.are_same_value(na, nb),
            _ => false,
        }
    }

    /// Returns `true` if every index is proven to be within the bounds of
    /// `matrix`.
    ///
    /// A single index is linear and is compared against the number of
    /// elements; the last of several indices is compared against the product
    /// of the remaining dimensions.
    pub fn in_range_of_matrix(&mut self, indices: &[String], matrix: &str) -> bool {
        if let [index] = indices {
            let numel = self.get_numel_result(matrix);
            return self.scalars.is_known_less_or_equal(index, &numel);
        }

        let ndims = self.matrix_ndims(matrix);
        for (position, index) in indices.iter().enumerate() {
            if ndims.is_some_and(|n| position >= n) {
                if !self.scalars.is_known_equal(index, 1.0) {
                    return false;
                }
                continue;
            }

            let size = if position + 1 == indices.len() {
                self.get_size_since_result(matrix, position)
            } else {
                self.get_size_result(matrix, position)
            };
            if !self.scalars.is_known_less_or_equal(index, &size) {
                return false;
            }
        }
        true
    }

    /// Returns `true` if `start:interval:end` is proven to run exactly once.
    #[must_use]
    pub fn is_single_iteration(&self, start: &str, interval: &str, end: &str) -> bool {
        self.scalars.is_known_not_equal(interval, 0.0) && self.scalars.are_same_value(start, end)
    }

    /// Returns `true` if `start:interval:end` is proven to be empty.
    #[must_use]
    pub fn is_empty_range(&self, start: &str, interval: &str, end: &str) -> bool {
        self.scalars.is_known_equal(interval, 0.0)
            || (self.scalars.is_known_positive(interval)
                && self.scalars.is_known_greater_than(start, end))
            || (self.scalars.is_known_negative(interval)
                && self.scalars.is_known_less_than(start, end))
    }

    /// Teaches the oracle the effect of `instruction`.
    ///
    /// Instructions owning blocks are ignored here; the builder walks them.
    pub fn add_instruction_information(
        &mut self,
        instruction: &Instruction,
        types: &dyn TypeProvider,
    ) {
        self.learn_types(
            types,
            instruction
                .inputs()
                .into_iter()
                .chain(instruction.outputs()),
        );

        match instruction {
            Instruction::Assume { condition } => self.scalars.set_true(condition),
            Instruction::Call {
                function,
                outputs,
                inputs,
            } => self.add_call_information(function, inputs, outputs),
            Instruction::Phi(phi) => {
                let output = phi.output();
                let inputs: Vec<&str> = phi.inputs().collect();
                let Some(first) = inputs.first().copied() else {
                    return;
                };
                if self.is_matrix(output) {
                    if inputs[1..].iter().all(|i| self.are_same_size(first, i)) {
                        self.build_matrix_with_same_size(output, first);
                    }
                } else if self.is_scalar(output)
                    && inputs[1..].iter().all(|i| self.are_same_value(first, i))
                {
                    self.scalars.build_scalar_copy(output, first);
                }
            }
            Instruction::Assignment { output, input } => match input {
                AssignmentInput::Number(value) => self.scalars.specify_constant(output, *value),
                AssignmentInput::Variable(input) => {
                    if self.is_matrix(output) {
                        self.build_matrix_with_same_size(output, input);
                    } else if self.is_scalar(output) {
                        self.scalars.build_scalar_copy(output, input);
                    }
                }
                AssignmentInput::Undefined => {}
            },
            Instruction::SimpleSet { output, matrix, .. } => {
                self.build_matrix_with_same_size(output, matrix);
            }
            Instruction::MatrixSet {
                output,
                matrix,
                indices,
                ..
            } => {
                if self.in_range_of_matrix(indices, matrix) {
                    self.build_matrix_with_same_size(output, matrix);
                }
            }
            Instruction::VerticalFlatten { output, input } => {
                let numel = self.get_numel_result(input);
                let group = self.size_group(output);
                let one = self.meta_constant(1.0);
                let category = &mut self.categories[group];
                category.numel = Some(numel.clone());
                category.dims.insert(0, numel);
                category.dims.insert(1, one);
            }
            Instruction::End {
                output,
                matrix,
                index,
                num_indices,
            } => self.build_end(matrix, *index, *num_indices, output),
            Instruction::RangeGet {
                output,
                matrix,
                indices,
            } => self.add_range_get_information(output, matrix, indices),
            Instruction::RangeSet {
                output,
                matrix,
                indices,
                ..
            } => self.add_range_set_information(output, matrix, indices),
            _ => {}
        }
    }

    fn build_end(&mut self, matrix: &str, index: usize, num_indices: usize, output: &str) {
        if index + 1 != num_indices {
            self.build_size(matrix, index, output);
        } else {
            self.build_size_since(matrix, index, output);
        }
    }

    fn add_range_get_information(&mut self, output: &str, matrix: &str, indices: &[RangeIndex]) {
        let Some(ndims) = self.matrix_ndims(matrix) else {
            return;
        };

        for (position, index) in indices.iter().enumerate() {
            let exact_dim = position + 1 < indices.len() || position + 1 == ndims;
            let size = match index {
                RangeIndex::Full => {
                    if exact_dim {
                        self.get_size_result(matrix, position)
                    } else {
                        self.get_size_since_result(matrix, position)
                    }
                }
                RangeIndex::Partial { start, end } => {
                    let size = self.generate_meta_name();
                    self.scalars.set_range_size(&size, start, end);
                    size
                }
                RangeIndex::Normal(_) => continue,
            };
            if exact_dim {
                self.build_size(output, position, &size);
            } else {
                self.build_size_since(output, position, &size);
            }
        }
    }

    fn add_range_set_information(&mut self, output: &str, matrix: &str, indices: &[RangeIndex]) {
        for (position, index) in indices.iter().enumerate() {
            let last = position + 1 == indices.len();
            match index {
                RangeIndex::Full => {
                    if last {
                        let size = self.get_size_since_result(matrix, position);
                        self.build_size_since(output, position, &size);
                    } else {
                        let size = self.get_size_result(matrix, position);
                        self.build_size(output, position, &size);
                    }
                }
                RangeIndex::Normal(index) => {
                    if last {
                        let size = self.get_size_since_result(matrix, position);
                        if self.scalars.is_known_less_or_equal(index, &size) {
                            self.build_size_since(output, position, &size);
                        } else {
                            self.set_size_since_at_least(output, position, &size);
                            self.set_size_since_at_least(output, position, index);
                        }
                    } else {
                        let size = self.get_size_result(matrix, position);
                        if self.scalars.is_known_less_or_equal(index, &size) {
                            self.build_size(output, position, &size);
                        } else {
                            self.set_size_at_least(output, position, &size);
                            self.set_size_at_least(output, position, index);
                        }
                    }
                }
                RangeIndex::Partial { .. } => {}
            }
        }
    }

    fn add_call_information(&mut self, function: &str, inputs: &[String], outputs: &[String]) {
        let Some(output) = outputs.first() else {
            return;
        };

        match (function, inputs, outputs.len()) {
            ("numel", [matrix], 1) => {
                self.build_numel(matrix, output);
                return;
            }
            ("size", [matrix, dim], 1) => {
                let index = self
                    .types
                    .get(dim.as_str())
                    .and_then(VariableType::integer_constant);
                if let Some(index) = index.filter(|i| *i >= 1) {
                    self.build_size(matrix, (index - 1) as usize, output);
                }
                return;
            }
            ("size", [matrix], 1) => {
                self.build_size_shape(matrix, output);
                return;
            }
            ("size", [matrix], count) => {
                for (index, out) in outputs.iter().enumerate() {
                    self.build_end(matrix, index, count, out);
                }
                return;
            }
            ("matisse_new_array_from_matrix", [matrix], 1) => {
                self.build_matrix_with_same_size(output, matrix);
                return;
            }
            ("matisse_new_array", [shape], 1) => {
                self.build_matrix_from_shape_matrix(shape, output);
                return;
            }
            ("zeros" | "ones", [shape], 1) if self.is_matrix(shape) => {
                self.build_matrix_from_shape_matrix(shape, output);
                return;
            }
            ("zeros" | "ones" | "matisse_new_array_from_dims", _, 1) => {
                self.allocate_from_scalar_arguments(inputs, output);
                return;
            }
            ("colon", [start, end], 1) => {
                self.build_range(output, start, end);
                return;
            }
            ("colon", [start, step, end], 1) if self.scalars.is_known_equal(step, 1.0) => {
                self.build_range(output, start, end);
                return;
            }
            _ => {}
        }

        if outputs.len() == 1 && ELEMENTWISE_FUNCTIONS.contains(&function) {
            let matrices: Vec<&String> = inputs.iter().filter(|i| self.is_matrix(i)).collect();
            if let Some(first) = matrices.first() {
                if matrices[1..].iter().all(|m| self.are_same_size(first, m)) {
                    self.build_matrix_with_same_size(output, first);
                }
                return;
            }
        }

        if inputs.iter().all(|i| self.is_scalar(i)) {
            let inputs: Vec<&str> = inputs.iter().map(String::as_str).collect();
            let outputs: Vec<&str> = outputs.iter().map(String::as_str).collect();
            self.scalars
                .add_scalar_function_call(function, &inputs, &outputs);
        }
    }

    fn build_range(&mut self, output: &str, start: &str, end: &str) {
        let size = self.generate_meta_name();
        let one = self.meta_constant(1.0);
        self.scalars.set_range_size(&size, start, end);
        self.build_numel(output, &size);
        self.build_size(output, 0, &one);
        self.build_size(output, 1, &size);
    }

    fn build_matrix_from_shape_matrix(&mut self, shape: &str, output: &str) {
        if let Some(&group) = self.size_matrices.get(shape) {
            self.sizes.insert(output.to_string(), group);
        }
    }

    fn allocate_from_scalar_arguments(&mut self, inputs: &[String], output: &str) {
        let mut non_one = Vec::new();
        let mut constant = Some(1.0);
        for input in inputs {
            let value = self.scalars.constant_of(input);
            if value != Some(1.0) {
                non_one.push(input.as_str());
            }
            constant = match (constant, value) {
                (Some(acc), Some(v)) => Some(acc * v),
                _ => None,
            };
        }

        if let [input] = inputs {
            self.build_size(output, 0, input);
            self.build_size(output, 1, input);
            constant = constant.map(|c| c * c);
        } else {
            if let [only] = non_one.as_slice() {
                self.build_matrix_from_numel(output, only);
            }
            for (index, input) in inputs.iter().enumerate() {
                self.build_size(output, index, input);
            }
        }

        if let Some(value) = constant {
            let numel = self.get_numel_result(output);
            self.scalars.specify_constant(&numel, value);
        }
    }
}

impl fmt::Display for SizeGroupInformation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "[size groups")?;
        writeln!(f, "  {}", self.scalars)?;
        for (id, category) in self.categories.iter().enumerate() {
            writeln!(f, "  {}: {}", id, category)?;
        }
        let mut sizes: Vec<_> = self.sizes.iter().collect();
        sizes.sort();
        for (matrix, group) in sizes {
            writeln!(f, "  {} -> {}", matrix, group)?;
        }
        write!(f, "]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::ssa::VariableTypes;

    fn types() -> VariableTypes {
        VariableTypes::from_pairs([
            ("n", VariableType::int()),
            ("m", VariableType::int()),
            ("one", VariableType::int_constant(1)),
            ("two", VariableType::int_constant(2)),
            ("A", VariableType::double_matrix(TypeShape::with_ndims(2))),
            ("B", VariableType::double_matrix(TypeShape::with_ndims(2))),
            ("C", VariableType::double_matrix(TypeShape::with_ndims(2))),
            ("D", VariableType::double_matrix(TypeShape::with_ndims(2))),
            ("Y", VariableType::double_matrix(TypeShape::column())),
            ("k", VariableType::int()),
            ("k2", VariableType::int()),
        ])
    }

    fn call(function: &str, outputs: &[&str], inputs: &[&str]) -> Instruction {
        Instruction::call(
            function,
            outputs.iter().map(|s| (*s).to_string()).collect(),
            inputs.iter().map(|s| (*s).to_string()).collect(),
        )
    }

    #[test]
    fn test_same_size_through_allocation() {
        let types = types();
        let mut info = SizeGroupInformation::new();
        info.add_instruction_information(&call("zeros", &["A"], &["n", "m"]), &types);
        info.add_instruction_information(&call("zeros", &["B"], &["n", "m"]), &types);
        info.add_instruction_information(&call("zeros", &["C"], &["m", "n"]), &types);

        assert!(info.are_same_size("A", "B"));
        assert!(info.have_same_numel("A", "B"));
        assert!(!info.are_same_size("A", "C"));
    }

    #[test]
    fn test_elementwise_keeps_size() {
        let types = types();
        let mut info = SizeGroupInformation::new();
        info.add_instruction_information(&call("zeros", &["A"], &["n", "m"]), &types);
        info.add_instruction_information(&call("plus", &["B"], &["A", "one"]), &types);
        assert!(info.are_same_size("A", "B"));
    }

    #[test]
    fn test_numel_and_size_results() {
        let types = types();
        let mut info = SizeGroupInformation::new();
        info.add_instruction_information(&call("zeros", &["A"], &["one", "n"]), &types);
        info.add_instruction_information(&call("numel", &["k"], &["A"]), &types);
        assert!(info.are_same_value("k", "n"));

        let dim = info.get_size_result("A", 1);
        assert!(info.are_same_value(&dim, "n"));
        let rows = info.get_size_result("A", 0);
        assert!(info.is_known_equal(&rows, 1.0));
    }

    #[test]
    fn test_constant_numel() {
        let types = types();
        let mut info = SizeGroupInformation::new();
        info.add_instruction_information(&call("zeros", &["A"], &["two"]), &types);
        let numel = info.get_numel_result("A");
        assert!(info.is_known_equal(&numel, 4.0));
    }

    #[test]
    fn test_same_size_implies_same_numel() {
        let types = types();
        let mut info = SizeGroupInformation::new();
        info.add_instruction_information(&call("zeros", &["A"], &["n", "m"]), &types);
        info.add_instruction_information(&call("zeros", &["B"], &["n", "m"]), &types);
        info.add_instruction_information(&call("zeros", &["C"], &["n", "n"]), &types);
        info.add_instruction_information(&call("numel", &["k"], &["C"]), &types);
        for a in ["A", "B", "C", "D", "Y"] {
            for b in ["A", "B", "C", "D", "Y"] {
                if info.are_same_size(a, b) {
                    assert!(info.have_same_numel(a, b), "{} {}", a, b);
                }
            }
        }
    }

    #[test]
    fn test_vertical_flatten() {
        let types = types();
        let mut info = SizeGroupInformation::new();
        info.add_instruction_information(&call("zeros", &["A"], &["n", "m"]), &types);
        info.add_instruction_information(
            &Instruction::VerticalFlatten {
                output: "Y".into(),
                input: "A".into(),
            },
            &types,
        );
        assert!(info.have_same_numel("A", "Y"));
        assert!(!info.are_same_size("A", "Y"));
    }

    #[test]
    fn test_in_range() {
        let types = types();
        let mut info = SizeGroupInformation::new();
        info.add_instruction_information(&call("zeros", &["A"], &["n", "m"]), &types);
        info.set_up_to("k", "n");
        info.set_up_to("k2", "m");
        assert!(info.in_range_of_matrix(&["k".into(), "k2".into()], "A"));
        assert!(!info.in_range_of_matrix(&["k2".into(), "k".into()], "A"));
    }

    #[test]
    fn test_phi_of_same_sized_matrices() {
        let types = types();
        let mut info = SizeGroupInformation::new();
        info.add_instruction_information(&call("zeros", &["A"], &["n", "m"]), &types);
        info.add_instruction_information(&call("ones", &["B"], &["n", "m"]), &types);
        info.add_instruction_information(
            &Instruction::Phi(crate::analysis::ssa::PhiNode::new(
                "C",
                vec!["A".into(), "B".into()],
                vec![crate::analysis::ssa::BlockId::new(1), crate::analysis::ssa::BlockId::new(2)],
            )),
            &types,
        );
        assert!(info.are_same_size("C", "A"));
    }

    #[test]
    fn test_ranges() {
        let mut info = SizeGroupInformation::new();
        info.learn_types(&types(), ["n", "m", "one", "two"]);
        assert!(info.is_single_iteration("n", "one", "n"));
        assert!(!info.is_single_iteration("n", "one", "m"));
        assert!(info.is_empty_range("two", "one", "one"));
        assert!(!info.is_empty_range("one", "one", "two"));
    }
}
