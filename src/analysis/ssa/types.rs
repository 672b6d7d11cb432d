//! Minimal variable type model consumed by the middle-end.
//!
//! Type inference happens upstream; this module only models the parts of a
//! variable's type that the optimizer reasons about:
//!
//! - whether a value is a scalar or a matrix,
//! - the constant a scalar is known to hold (if any),
//! - the statically known shape of a matrix (number of dimensions and
//!   individual dimension sizes, each possibly unknown).
//!
//! The concrete numeric lattice is intentionally flattened to a handful of
//! [`NumericClass`]es.

use std::{collections::HashMap, fmt};

use strum::{Display, EnumIter};

/// Element class of a numeric value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter)]
pub enum NumericClass {
    /// 64-bit floating point
    #[strum(serialize = "double")]
    Double,
    /// 32-bit floating point
    #[strum(serialize = "single")]
    Single,
    /// 32-bit signed integer
    #[strum(serialize = "int32")]
    Int32,
    /// Boolean
    #[strum(serialize = "logical")]
    Logical,
}

impl NumericClass {
    /// Returns `true` for classes that can only hold integral values.
    #[must_use]
    pub const fn is_integer(self) -> bool {
        matches!(self, NumericClass::Int32 | NumericClass::Logical)
    }
}

/// Type of a scalar value.
#[derive(Debug, Clone, PartialEq)]
pub struct ScalarType {
    /// Element class
    pub class: NumericClass,
    /// Value the scalar is statically known to hold
    pub constant: Option<f64>,
}

impl ScalarType {
    /// Creates a scalar type with no known value.
    #[must_use]
    pub const fn new(class: NumericClass) -> Self {
        ScalarType {
            class,
            constant: None,
        }
    }

    /// Creates a scalar type with a known constant value.
    #[must_use]
    pub fn constant(class: NumericClass, value: f64) -> Self {
        ScalarType {
            class,
            constant: Some(value),
        }
    }

    /// Returns the same type with the constant information removed.
    #[must_use]
    pub fn without_constant(&self) -> Self {
        ScalarType {
            class: self.class,
            constant: None,
        }
    }
}

/// Statically known shape of a matrix.
///
/// `dims == None` means the number of dimensions is unknown. Otherwise every
/// entry is a dimension whose size may or may not be known.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TypeShape {
    dims: Option<Vec<Option<usize>>>,
}

impl TypeShape {
    /// Shape with unknown number of dimensions.
    #[must_use]
    pub const fn unknown() -> Self {
        TypeShape { dims: None }
    }

    /// Shape with a known number of dimensions but unknown sizes.
    #[must_use]
    pub fn with_ndims(ndims: usize) -> Self {
        TypeShape {
            dims: Some(vec![None; ndims.max(2)]),
        }
    }

    /// Shape with the given (possibly unknown) dimension sizes.
    #[must_use]
    pub fn from_dims(dims: Vec<Option<usize>>) -> Self {
        TypeShape { dims: Some(dims) }
    }

    /// Fully known 2D shape.
    #[must_use]
    pub fn known_2d(rows: usize, cols: usize) -> Self {
        TypeShape {
            dims: Some(vec![Some(rows), Some(cols)]),
        }
    }

    /// Shape of a column vector with unknown length.
    #[must_use]
    pub fn column() -> Self {
        TypeShape {
            dims: Some(vec![None, Some(1)]),
        }
    }

    /// Number of dimensions, if known.
    #[must_use]
    pub fn ndims(&self) -> Option<usize> {
        self.dims.as_ref().map(Vec::len)
    }

    /// Size of dimension `index` (0-based), if known.
    ///
    /// Dimensions past the last are implicitly `1`.
    #[must_use]
    pub fn dim(&self, index: usize) -> Option<usize> {
        let dims = self.dims.as_ref()?;
        match dims.get(index) {
            Some(value) => *value,
            None => Some(1),
        }
    }

    /// Total number of elements, if every dimension is known.
    #[must_use]
    pub fn numel(&self) -> Option<usize> {
        let dims = self.dims.as_ref()?;
        dims.iter().try_fold(1usize, |acc, d| d.map(|d| acc * d))
    }

    /// Returns `true` if the shape is known to be `N x 1`.
    #[must_use]
    pub fn is_known_column(&self) -> bool {
        matches!(self.dims.as_deref(), Some([_, Some(1)]))
    }

    /// Returns `true` if the shape is known to be `1 x 1`.
    #[must_use]
    pub fn is_known_scalar(&self) -> bool {
        self.numel() == Some(1)
    }
}

impl fmt::Display for TypeShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.dims {
            None => write!(f, "[?]"),
            Some(dims) => {
                write!(f, "[")?;
                for (i, dim) in dims.iter().enumerate() {
                    if i > 0 {
                        write!(f, "x")?;
                    }
                    match dim {
                        Some(d) => write!(f, "{}", d)?,
                        None => write!(f, "?")?,
                    }
                }
                write!(f, "]")
            }
        }
    }
}

/// Type of a matrix value.
#[derive(Debug, Clone, PartialEq)]
pub struct MatrixType {
    /// Element class
    pub element: NumericClass,
    /// Statically known shape
    pub shape: TypeShape,
}

impl MatrixType {
    /// Creates a matrix type of the given element class and shape.
    #[must_use]
    pub const fn new(element: NumericClass, shape: TypeShape) -> Self {
        MatrixType { element, shape }
    }
}

/// Inferred type of an SSA variable.
#[derive(Debug, Clone, PartialEq)]
pub enum VariableType {
    /// Scalar numeric value
    Scalar(ScalarType),
    /// Matrix of numeric values
    Matrix(MatrixType),
    /// Any non-numeric value (strings, cells, structs)
    Opaque,
}

impl VariableType {
    /// Non-constant double scalar.
    #[must_use]
    pub const fn double() -> Self {
        VariableType::Scalar(ScalarType::new(NumericClass::Double))
    }

    /// Non-constant int32 scalar.
    #[must_use]
    pub const fn int() -> Self {
        VariableType::Scalar(ScalarType::new(NumericClass::Int32))
    }

    /// Non-constant logical scalar.
    #[must_use]
    pub const fn logical() -> Self {
        VariableType::Scalar(ScalarType::new(NumericClass::Logical))
    }

    /// Constant int32 scalar.
    #[must_use]
    pub fn int_constant(value: i64) -> Self {
        VariableType::Scalar(ScalarType::constant(NumericClass::Int32, value as f64))
    }

    /// Constant double scalar.
    #[must_use]
    pub fn double_constant(value: f64) -> Self {
        VariableType::Scalar(ScalarType::constant(NumericClass::Double, value))
    }

    /// Double matrix with the given shape.
    #[must_use]
    pub const fn double_matrix(shape: TypeShape) -> Self {
        VariableType::Matrix(MatrixType::new(NumericClass::Double, shape))
    }

    /// Returns `true` for scalar types.
    #[must_use]
    pub const fn is_scalar(&self) -> bool {
        matches!(self, VariableType::Scalar(_))
    }

    /// Returns `true` for matrix types.
    #[must_use]
    pub const fn is_matrix(&self) -> bool {
        matches!(self, VariableType::Matrix(_))
    }

    /// Known constant value of a scalar type.
    #[must_use]
    pub fn constant(&self) -> Option<f64> {
        match self {
            VariableType::Scalar(s) => s.constant,
            _ => None,
        }
    }

    /// Known constant value of a scalar type, if it is integral.
    #[must_use]
    pub fn integer_constant(&self) -> Option<i64> {
        self.constant()
            .filter(|v| v.fract() == 0.0 && v.is_finite())
            .map(|v| v as i64)
    }

    /// Returns `true` if the value is statically known to be integral.
    #[must_use]
    pub fn is_integer(&self) -> bool {
        match self {
            VariableType::Scalar(s) => {
                s.class.is_integer() || s.constant.is_some_and(|c| c.fract() == 0.0)
            }
            _ => false,
        }
    }

    /// Element class of a scalar or matrix.
    #[must_use]
    pub const fn numeric_class(&self) -> Option<NumericClass> {
        match self {
            VariableType::Scalar(s) => Some(s.class),
            VariableType::Matrix(m) => Some(m.element),
            VariableType::Opaque => None,
        }
    }

    /// Static shape of the value. Scalars are `1x1`.
    #[must_use]
    pub fn shape(&self) -> TypeShape {
        match self {
            VariableType::Scalar(_) => TypeShape::known_2d(1, 1),
            VariableType::Matrix(m) => m.shape.clone(),
            VariableType::Opaque => TypeShape::unknown(),
        }
    }

    /// Same type with any constant information removed.
    #[must_use]
    pub fn without_constant(&self) -> Self {
        match self {
            VariableType::Scalar(s) => VariableType::Scalar(s.without_constant()),
            other => other.clone(),
        }
    }

    /// Scalar type of the elements of this value.
    #[must_use]
    pub fn element_type(&self) -> VariableType {
        match self {
            VariableType::Scalar(s) => VariableType::Scalar(s.without_constant()),
            VariableType::Matrix(m) => VariableType::Scalar(ScalarType::new(m.element)),
            VariableType::Opaque => VariableType::Opaque,
        }
    }
}

impl fmt::Display for VariableType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VariableType::Scalar(s) => match s.constant {
                Some(c) => write!(f, "{}({})", s.class, c),
                None => write!(f, "{}", s.class),
            },
            VariableType::Matrix(m) => write!(f, "matrix<{}>{}", m.element, m.shape),
            VariableType::Opaque => write!(f, "opaque"),
        }
    }
}

/// Typed-variable lookup service.
///
/// Type inference runs upstream; passes only query the inferred types and
/// register the types of the temporaries they create.
pub trait TypeProvider: Send + Sync {
    /// Inferred type of `name`, or `None` if unknown.
    fn variable_type(&self, name: &str) -> Option<VariableType>;

    /// Records the type of a (new) variable.
    fn add_variable(&mut self, name: &str, ty: VariableType);

    /// Mints a fresh variable name for the given semantic hint and records
    /// its type.
    ///
    /// The generated name has the form `$semantic$N` and is unique within the
    /// provider.
    fn make_temporary(&mut self, semantic: &str, ty: VariableType) -> String;

    /// Returns `true` if `name` is statically known to be a scalar.
    fn is_scalar(&self, name: &str) -> bool {
        self.variable_type(name).is_some_and(|t| t.is_scalar())
    }

    /// Returns `true` if `name` is statically known to be a matrix.
    fn is_matrix(&self, name: &str) -> bool {
        self.variable_type(name).is_some_and(|t| t.is_matrix())
    }

    /// Known constant value of `name`.
    fn constant(&self, name: &str) -> Option<f64> {
        self.variable_type(name).and_then(|t| t.constant())
    }
}

/// Type table of a single function.
#[derive(Debug, Clone, Default)]
pub struct VariableTypes {
    types: HashMap<String, VariableType>,
    temporaries: HashMap<String, usize>,
}

impl VariableTypes {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        VariableTypes::default()
    }

    /// Builds a table from `(name, type)` pairs.
    pub fn from_pairs<I, S>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (S, VariableType)>,
        S: Into<String>,
    {
        VariableTypes {
            types: pairs.into_iter().map(|(n, t)| (n.into(), t)).collect(),
            temporaries: HashMap::new(),
        }
    }

    /// Number of typed variables.
    #[must_use]
    pub fn len(&self) -> usize {
        self.types.len()
    }

    /// Returns `true` if no variable is typed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    /// Iterates over all typed variables.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &VariableType)> + '_ {
        self.types.iter().map(|(n, t)| (n.as_str(), t))
    }
}

impl TypeProvider for VariableTypes {
    fn variable_type(&self, name: &str) -> Option<VariableType> {
        self.types.get(name).cloned()
    }

    fn add_variable(&mut self, name: &str, ty: VariableType) {
        self.types.insert(name.to_string(), ty);
    }

    fn make_temporary(&mut self, semantic: &str, ty: VariableType) -> String {
        loop {
            let counter = self.temporaries.entry(semantic.to_string()).or_insert(0);
            *counter += 1;
            let name = format!("${}${}", semantic, counter);
            if !self.types.contains_key(&name) {
                self.types.insert(name.clone(), ty);
                return name;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shape_dims_past_end_are_one() {
        let shape = TypeShape::known_2d(3, 4);
        assert_eq!(shape.dim(0), Some(3));
        assert_eq!(shape.dim(2), Some(1));
        assert_eq!(shape.numel(), Some(12));
    }

    #[test]
    fn test_unknown_shape() {
        let shape = TypeShape::unknown();
        assert_eq!(shape.ndims(), None);
        assert_eq!(shape.dim(0), None);
        assert_eq!(shape.numel(), None);
    }

    #[test]
    fn test_column_shape() {
        assert!(TypeShape::column().is_known_column());
        assert!(!TypeShape::with_ndims(2).is_known_column());
    }

    #[test]
    fn test_integer_constant() {
        assert_eq!(VariableType::int_constant(4).integer_constant(), Some(4));
        assert_eq!(VariableType::double_constant(1.5).integer_constant(), None);
        assert!(VariableType::double_constant(2.0).is_integer());
        assert!(!VariableType::double().is_integer());
    }

    #[test]
    fn test_make_temporary() {
        let mut types = VariableTypes::from_pairs([("$i$1", VariableType::int())]);
        let name = types.make_temporary("i", VariableType::int_constant(1));
        assert_eq!(name, "$i$2");
        assert_eq!(types.constant(&name), Some(1.0));
        assert!(types.is_scalar(&name));
        let other = types.make_temporary("i", VariableType::int());
        assert_eq!(other, "$i$3");
    }

    #[test]
    fn test_display() {
        assert_eq!(VariableType::int_constant(1).to_string(), "int32(1)");
        assert_eq!(
            VariableType::double_matrix(TypeShape::with_ndims(2)).to_string(),
            "matrix<double>[?x?]"
        );
    }
}
