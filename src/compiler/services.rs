//! Services the pipeline consumes from the rest of the compiler.
//!
//! Type inference and the builtin library live upstream. Passes reach them
//! through two narrow interfaces:
//!
//! - [`TypeProvider`](crate::analysis::TypeProvider) (implemented by
//!   [`VariableTypes`]) answers "what is the type of `x`?" and mints fresh
//!   temporaries;
//! - [`BuiltinProvider`] resolves a builtin call to the types of its outputs,
//!   so that passes can synthesize new calls with correctly typed results.
//!
//! [`TypedFunction`] bundles a function body with its type table; it is the
//! unit the [`CompilerContext`](crate::compiler::CompilerContext) stores.

use crate::analysis::{
    FunctionBody, MatrixType, NumericClass, ScalarType, TypeShape, VariableType, VariableTypes,
};

/// A function together with the inferred types of its variables.
#[derive(Debug, Clone)]
pub struct TypedFunction {
    /// SSA body
    pub body: FunctionBody,
    /// Inferred variable types
    pub types: VariableTypes,
}

impl TypedFunction {
    /// Bundles a body with its types.
    #[must_use]
    pub fn new(body: FunctionBody, types: VariableTypes) -> Self {
        TypedFunction { body, types }
    }

    /// Name of the function.
    #[must_use]
    pub fn name(&self) -> &str {
        self.body.name()
    }
}

/// Resolved signature of a builtin call.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionSignature {
    /// Name of the builtin
    pub name: String,
    /// Types of the requested outputs, one per output
    pub outputs: Vec<VariableType>,
}

impl FunctionSignature {
    fn new(name: &str, outputs: Vec<VariableType>) -> Self {
        FunctionSignature {
            name: name.to_string(),
            outputs,
        }
    }
}

/// Builtin-function lookup service.
pub trait BuiltinProvider: Send + Sync {
    /// Resolves `name` applied to arguments of `inputs` with `nargout`
    /// requested outputs.
    ///
    /// Returns `None` if the builtin is unknown or does not accept these
    /// arguments.
    fn resolve(
        &self,
        name: &str,
        inputs: &[VariableType],
        nargout: usize,
    ) -> Option<FunctionSignature>;
}

/// The builtins the optimization passes synthesize calls to.
///
/// | Group               | Builtins                                    |
/// |---------------------|---------------------------------------------|
/// | sizes               | `size`, `numel`, `ndims`, `length`          |
/// | arithmetic          | `plus`, `minus`, `times`, `uminus`          |
/// | comparison          | `eq`, `lt`, `le`                            |
/// | logical             | `not`                                       |
/// | conversion          | `fix`                                       |
/// | allocation          | `zeros`, `ones`                             |
/// | range               | `colon`                                     |
/// | internal allocation | `matisse_new_array`, `matisse_new_array_from_dims`, `matisse_new_array_from_matrix` |
#[derive(Debug, Clone, Copy, Default)]
pub struct StandardBuiltins;

fn int_matrix(shape: TypeShape) -> VariableType {
    VariableType::Matrix(MatrixType::new(NumericClass::Int32, shape))
}

fn wider(a: NumericClass, b: NumericClass) -> NumericClass {
    match (a, b) {
        (NumericClass::Int32, _) | (_, NumericClass::Int32) => NumericClass::Int32,
        (NumericClass::Single, _) | (_, NumericClass::Single) => NumericClass::Single,
        _ => NumericClass::Double,
    }
}

/// Result type of an element-wise operation over `inputs`.
fn elementwise(inputs: &[VariableType], class: Option<NumericClass>) -> Option<VariableType> {
    let mut result_class = NumericClass::Logical;
    let mut shape = None;
    for input in inputs {
        let input_class = input.numeric_class()?;
        result_class = if result_class == NumericClass::Logical {
            match input_class {
                NumericClass::Logical => NumericClass::Double,
                other => other,
            }
        } else {
            wider(result_class, input_class)
        };
        if let VariableType::Matrix(m) = input {
            shape.get_or_insert_with(|| m.shape.clone());
        }
    }
    let class = class.unwrap_or(result_class);
    Some(match shape {
        Some(shape) => VariableType::Matrix(MatrixType::new(class, shape)),
        None => VariableType::Scalar(ScalarType::new(class)),
    })
}

/// Shape allocated by `zeros(a, b, ...)`-style calls.
fn allocation_shape(inputs: &[VariableType]) -> Option<TypeShape> {
    if !inputs.iter().all(VariableType::is_scalar) {
        if let [shape] = inputs {
            if shape.is_matrix() {
                return Some(TypeShape::unknown());
            }
        }
        return None;
    }
    let dims: Vec<Option<usize>> = inputs
        .iter()
        .map(|t| {
            t.integer_constant()
                .map(|v| usize::try_from(v.max(0)).unwrap_or(0))
        })
        .collect();
    Some(match dims.as_slice() {
        [] => TypeShape::known_2d(1, 1),
        [n] => TypeShape::from_dims(vec![*n, *n]),
        _ => TypeShape::from_dims(dims),
    })
}

impl BuiltinProvider for StandardBuiltins {
    fn resolve(
        &self,
        name: &str,
        inputs: &[VariableType],
        nargout: usize,
    ) -> Option<FunctionSignature> {
        let outputs = match (name, inputs, nargout) {
            ("numel" | "ndims" | "length", [_], 1) => vec![VariableType::int()],
            ("size", [_, dim], 1) if dim.is_scalar() => vec![VariableType::int()],
            ("size", [matrix], 1) => {
                let ndims = matrix.shape().ndims();
                vec![int_matrix(TypeShape::from_dims(vec![Some(1), ndims]))]
            }
            ("size", [_], n) if n > 1 => vec![VariableType::int(); n],
            ("plus" | "minus" | "times", [_, _], 1) => vec![elementwise(inputs, None)?],
            ("uminus" | "fix", [_], 1) => vec![elementwise(inputs, None)?],
            ("eq" | "lt" | "le", [_, _], 1) | ("not", [_], 1) => {
                vec![elementwise(inputs, Some(NumericClass::Logical))?]
            }
            ("zeros" | "ones" | "matisse_new_array_from_dims", _, 1) => {
                vec![VariableType::double_matrix(allocation_shape(inputs)?)]
            }
            ("matisse_new_array", [shape], 1) if shape.is_matrix() => {
                vec![VariableType::double_matrix(TypeShape::unknown())]
            }
            ("matisse_new_array_from_matrix", [matrix], 1) if matrix.is_matrix() => {
                vec![matrix.without_constant()]
            }
            ("colon", [start, end] | [start, _, end], 1) => {
                let class = match start.numeric_class()? {
                    NumericClass::Logical => NumericClass::Double,
                    other => other,
                };
                let length = match (start.integer_constant(), end.integer_constant()) {
                    (Some(s), Some(e)) if inputs.len() == 2 => {
                        Some(usize::try_from((e - s + 1).max(0)).unwrap_or(0))
                    }
                    _ => None,
                };
                vec![VariableType::Matrix(MatrixType::new(
                    class,
                    TypeShape::from_dims(vec![Some(1), length]),
                ))]
            }
            _ => return None,
        };
        Some(FunctionSignature::new(name, outputs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_queries() {
        let matrix = VariableType::double_matrix(TypeShape::with_ndims(3));
        let builtins = StandardBuiltins;

        let numel = builtins.resolve("numel", &[matrix.clone()], 1).unwrap();
        assert_eq!(numel.outputs, vec![VariableType::int()]);

        let shape = builtins.resolve("size", &[matrix.clone()], 1).unwrap();
        assert_eq!(
            shape.outputs[0].shape(),
            TypeShape::from_dims(vec![Some(1), Some(3)])
        );

        let dims = builtins.resolve("size", &[matrix], 3).unwrap();
        assert_eq!(dims.outputs.len(), 3);
    }

    #[test]
    fn test_arithmetic_keeps_matrix_shape() {
        let matrix = VariableType::double_matrix(TypeShape::known_2d(2, 3));
        let sum = StandardBuiltins
            .resolve("plus", &[matrix, VariableType::double()], 1)
            .unwrap();
        assert_eq!(sum.outputs[0].shape(), TypeShape::known_2d(2, 3));

        let compare = StandardBuiltins
            .resolve("lt", &[VariableType::int(), VariableType::int()], 1)
            .unwrap();
        assert_eq!(compare.outputs[0], VariableType::logical());

        let index = StandardBuiltins
            .resolve("plus", &[VariableType::int(), VariableType::int_constant(1)], 1)
            .unwrap();
        assert_eq!(index.outputs[0], VariableType::int());
    }

    #[test]
    fn test_allocations() {
        let n = VariableType::int();
        let square = StandardBuiltins.resolve("zeros", &[n.clone()], 1).unwrap();
        assert_eq!(square.outputs[0].shape().ndims(), Some(2));

        let column = StandardBuiltins
            .resolve(
                "matisse_new_array_from_dims",
                &[n, VariableType::int_constant(1)],
                1,
            )
            .unwrap();
        assert!(column.outputs[0].shape().is_known_column());

        let range = StandardBuiltins
            .resolve(
                "colon",
                &[VariableType::int_constant(1), VariableType::int_constant(4)],
                1,
            )
            .unwrap();
        assert_eq!(range.outputs[0].shape(), TypeShape::known_2d(1, 4));
    }

    #[test]
    fn test_unknown_builtin() {
        assert!(StandardBuiltins
            .resolve("fft", &[VariableType::double()], 1)
            .is_none());
        assert!(StandardBuiltins.resolve("numel", &[], 1).is_none());
    }
}
