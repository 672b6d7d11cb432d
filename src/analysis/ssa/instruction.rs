//! SSA instruction model.
//!
//! Every operation of the middle-end IR is a variant of the closed
//! [`Instruction`] enum. Passes dispatch on variants with exhaustive `match`,
//! so adding a variant forces every analysis that cares about it to be
//! revisited.
//!
//! # Uniform queries
//!
//! Independently of its variant, every instruction answers:
//!
//! | Query                | Meaning                                              |
//! |----------------------|------------------------------------------------------|
//! | [`Instruction::inputs`]          | Variables read                           |
//! | [`Instruction::outputs`]         | Variables written                        |
//! | [`Instruction::instruction_type`]| Side-effect / control-flow classification|
//! | [`Instruction::owned_blocks`]    | Blocks this control transfer owns        |
//! | [`Instruction::is_ending`]       | Whether it may only appear last in a block|
//!
//! # Structured control flow
//!
//! Control transfers own their sub-blocks. A `for` header owns a loop block
//! and an end block; control enters the loop block, the last block of the
//! loop body jumps back to it, and when the loop exits execution resumes in
//! the end block:
//!
//! ```text
//!   #0: ... for s, i, e, #1, #2
//!   #1: <loop body>            (back-edge from block_end(#1))
//!   #2: <code after the loop>
//! ```
//!
//! A branch owns a true block, a false block and an end block (the join).

use std::{collections::HashMap, fmt};

use crate::analysis::ssa::{BlockId, PhiNode};

/// Builtins that are observable outside of the computed values.
const SIDE_EFFECT_FUNCTIONS: &[&str] = &[
    "disp", "printf", "fprintf", "error", "warning", "tic", "toc", "rand", "randn", "randi",
    "fopen", "fclose", "fwrite", "fread", "plot", "print",
];

/// Returns `true` if calling `function` has an effect beyond its outputs.
#[must_use]
pub fn is_side_effect_function(function: &str) -> bool {
    SIDE_EFFECT_FUNCTIONS.contains(&function)
}

/// Side-effect classification of an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InstructionType {
    /// Pure computation; may be moved or removed freely if unused.
    NoSideEffect,
    /// Observable effect (I/O, randomness, errors).
    SideEffect,
    /// May abort at runtime when a check fails (bounds, validation).
    ValidationSideEffect,
    /// Transfers control to other blocks.
    ControlFlow,
    /// Source position marker.
    Line,
    /// Annotation that does not compute anything.
    Decorator,
}

impl InstructionType {
    /// Returns `true` if instructions of this type cannot be reordered freely.
    #[must_use]
    pub const fn has_side_effects(self) -> bool {
        matches!(
            self,
            InstructionType::SideEffect | InstructionType::ValidationSideEffect
        )
    }
}

/// Annotation attached to a `for` header.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LoopProperty {
    /// Iterations are independent and may run in parallel.
    Parallel,
    /// The loop must not be fused with its neighbours.
    NoFusion,
    /// Any other backend-specific annotation.
    Named(String),
}

impl fmt::Display for LoopProperty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoopProperty::Parallel => write!(f, "parallel"),
            LoopProperty::NoFusion => write!(f, "no_fusion"),
            LoopProperty::Named(name) => write!(f, "{}", name),
        }
    }
}

/// Index of a range get/set.
#[derive(Debug, Clone, PartialEq)]
pub enum RangeIndex {
    /// `:` selects the entire dimension
    Full,
    /// A single index or index matrix
    Normal(String),
    /// `start:end`
    Partial {
        /// First index of the range
        start: String,
        /// Last index of the range
        end: String,
    },
}

impl RangeIndex {
    fn variables(&self) -> Vec<&str> {
        match self {
            RangeIndex::Full => Vec::new(),
            RangeIndex::Normal(v) => vec![v.as_str()],
            RangeIndex::Partial { start, end } => vec![start.as_str(), end.as_str()],
        }
    }

    fn rename(&mut self, map: &HashMap<String, String>) {
        match self {
            RangeIndex::Full => {}
            RangeIndex::Normal(v) => rename_in(v, map),
            RangeIndex::Partial { start, end } => {
                rename_in(start, map);
                rename_in(end, map);
            }
        }
    }
}

impl fmt::Display for RangeIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RangeIndex::Full => write!(f, ":"),
            RangeIndex::Normal(v) => write!(f, "{}", v),
            RangeIndex::Partial { start, end } => write!(f, "{}:{}", start, end),
        }
    }
}

/// Right-hand side of an assignment.
#[derive(Debug, Clone, PartialEq)]
pub enum AssignmentInput {
    /// Numeric literal
    Number(f64),
    /// Copy of another variable
    Variable(String),
    /// Explicitly undefined value (for phi inputs on paths where the variable
    /// does not exist yet)
    Undefined,
}

/// Counted loop header: `for start:interval:end`.
#[derive(Debug, Clone, PartialEq)]
pub struct ForLoop {
    /// First value of the iteration variable
    pub start: String,
    /// Step between iterations
    pub interval: String,
    /// Last value (inclusive bound)
    pub end: String,
    /// First block of the loop body
    pub loop_block: BlockId,
    /// Block where execution continues after the loop
    pub end_block: BlockId,
    /// Loop annotations
    pub properties: Vec<LoopProperty>,
}

impl ForLoop {
    /// Creates a loop header without properties.
    #[must_use]
    pub fn new(
        start: impl Into<String>,
        interval: impl Into<String>,
        end: impl Into<String>,
        loop_block: BlockId,
        end_block: BlockId,
    ) -> Self {
        ForLoop {
            start: start.into(),
            interval: interval.into(),
            end: end.into(),
            loop_block,
            end_block,
            properties: Vec::new(),
        }
    }
}

/// A single SSA instruction.
#[derive(Debug, Clone, PartialEq)]
pub enum Instruction {
    /// Call of a builtin or user function
    Call {
        /// Name of the callee
        function: String,
        /// Variables receiving the results
        outputs: Vec<String>,
        /// Arguments
        inputs: Vec<String>,
    },
    /// Phi merge
    Phi(PhiNode),
    /// Counted loop header
    For(ForLoop),
    /// Condition-controlled loop (condition checked via `Break` in the body)
    While {
        /// First block of the loop body
        loop_block: BlockId,
        /// Block after the loop
        end_block: BlockId,
    },
    /// Leaves the innermost enclosing `while`
    Break,
    /// Jumps to the next iteration of the innermost enclosing `while`
    Continue,
    /// Two-way branch
    Branch {
        /// Condition variable
        condition: String,
        /// Taken when the condition is true
        true_block: BlockId,
        /// Taken when the condition is false
        false_block: BlockId,
        /// Join block
        end_block: BlockId,
    },
    /// Current value of the enclosing `for` loop's iteration variable
    Iter {
        /// Receives the iteration value
        output: String,
    },
    /// Unchecked scalar element read; indices are known to be in range
    SimpleGet {
        /// Element read
        output: String,
        /// Matrix read from
        matrix: String,
        /// One-based indices
        indices: Vec<String>,
    },
    /// Checked element read
    MatrixGet {
        /// Element read
        output: String,
        /// Matrix read from
        matrix: String,
        /// One-based indices
        indices: Vec<String>,
    },
    /// Reads `matrix(index)` or, for scalars, the value itself
    GetOrFirst {
        /// Element read
        output: String,
        /// Matrix read from
        matrix: String,
        /// One-based index
        index: String,
    },
    /// Unchecked scalar element write; produces a new matrix version
    SimpleSet {
        /// New version of the matrix
        output: String,
        /// Previous version of the matrix
        matrix: String,
        /// One-based indices
        indices: Vec<String>,
        /// Element written
        value: String,
    },
    /// Checked element write that may grow the matrix
    MatrixSet {
        /// New version of the matrix
        output: String,
        /// Previous version of the matrix
        matrix: String,
        /// One-based indices
        indices: Vec<String>,
        /// Element written
        value: String,
    },
    /// Reads a sub-range of a matrix
    RangeGet {
        /// Extracted sub-matrix
        output: String,
        /// Matrix read from
        matrix: String,
        /// One entry per indexed dimension
        indices: Vec<RangeIndex>,
    },
    /// Writes a sub-range of a matrix
    RangeSet {
        /// New version of the matrix
        output: String,
        /// Previous version of the matrix
        matrix: String,
        /// One entry per indexed dimension
        indices: Vec<RangeIndex>,
        /// Value (scalar or matrix) written
        value: String,
    },
    /// Copy or literal assignment
    Assignment {
        /// Assigned variable
        output: String,
        /// Assigned value
        input: AssignmentInput,
    },
    /// Value of `end` in `matrix(..., end, ...)`
    End {
        /// Receives the bound
        output: String,
        /// Indexed matrix
        matrix: String,
        /// Position of `end` among the indices
        index: usize,
        /// Total number of indices of the access
        num_indices: usize,
    },
    /// `output = input(:)`
    VerticalFlatten {
        /// Column vector result
        output: String,
        /// Flattened matrix
        input: String,
    },
    /// Aborts at runtime if `condition` is false
    ValidateTrue {
        /// Checked condition
        condition: String,
    },
    /// Declares `condition` true without checking it
    Assume {
        /// Assumed condition
        condition: String,
    },
    /// Function argument
    Argument {
        /// Receives the argument
        output: String,
        /// Zero-based argument position
        index: usize,
    },
    /// Source line marker
    Line {
        /// Line number
        line: u32,
    },
    /// Free-form comment
    Comment {
        /// Comment text
        text: String,
    },
}

fn rename_in(name: &mut String, map: &HashMap<String, String>) {
    if let Some(renamed) = map.get(name.as_str()) {
        name.clone_from(renamed);
    }
}

fn rename_all(names: &mut [String], map: &HashMap<String, String>) {
    for name in names {
        rename_in(name, map);
    }
}

fn rename_block(block: &mut BlockId, old: &[BlockId], new: &[BlockId]) {
    if let Some(pos) = old.iter().position(|b| b == block) {
        *block = new[pos];
    }
}

impl Instruction {
    /// Creates a call instruction.
    #[must_use]
    pub fn call(function: impl Into<String>, outputs: Vec<String>, inputs: Vec<String>) -> Self {
        Instruction::Call {
            function: function.into(),
            outputs,
            inputs,
        }
    }

    /// Creates an assignment from an integer literal.
    #[must_use]
    pub fn assign_integer(output: impl Into<String>, value: i64) -> Self {
        Instruction::Assignment {
            output: output.into(),
            input: AssignmentInput::Number(value as f64),
        }
    }

    /// Creates a variable-to-variable assignment.
    #[must_use]
    pub fn assign_variable(output: impl Into<String>, input: impl Into<String>) -> Self {
        Instruction::Assignment {
            output: output.into(),
            input: AssignmentInput::Variable(input.into()),
        }
    }

    /// Variables read by this instruction, in operand order.
    #[must_use]
    pub fn inputs(&self) -> Vec<&str> {
        match self {
            Instruction::Call { inputs, .. } => inputs.iter().map(String::as_str).collect(),
            Instruction::Phi(phi) => phi.inputs().collect(),
            Instruction::For(header) => vec![
                header.start.as_str(),
                header.interval.as_str(),
                header.end.as_str(),
            ],
            Instruction::Branch { condition, .. }
            | Instruction::ValidateTrue { condition }
            | Instruction::Assume { condition } => vec![condition.as_str()],
            Instruction::SimpleGet {
                matrix, indices, ..
            }
            | Instruction::MatrixGet {
                matrix, indices, ..
            } => std::iter::once(matrix.as_str())
                .chain(indices.iter().map(String::as_str))
                .collect(),
            Instruction::GetOrFirst { matrix, index, .. } => vec![matrix.as_str(), index.as_str()],
            Instruction::SimpleSet {
                matrix,
                indices,
                value,
                ..
            }
            | Instruction::MatrixSet {
                matrix,
                indices,
                value,
                ..
            } => std::iter::once(matrix.as_str())
                .chain(indices.iter().map(String::as_str))
                .chain(std::iter::once(value.as_str()))
                .collect(),
            Instruction::RangeGet {
                matrix, indices, ..
            } => std::iter::once(matrix.as_str())
                .chain(indices.iter().flat_map(RangeIndex::variables))
                .collect(),
            Instruction::RangeSet {
                matrix,
                indices,
                value,
                ..
            } => std::iter::once(matrix.as_str())
                .chain(indices.iter().flat_map(RangeIndex::variables))
                .chain(std::iter::once(value.as_str()))
                .collect(),
            Instruction::Assignment { input, .. } => match input {
                AssignmentInput::Variable(v) => vec![v.as_str()],
                _ => Vec::new(),
            },
            Instruction::End { matrix, .. } => vec![matrix.as_str()],
            Instruction::VerticalFlatten { input, .. } => vec![input.as_str()],
            Instruction::While { .. }
            | Instruction::Break
            | Instruction::Continue
            | Instruction::Iter { .. }
            | Instruction::Argument { .. }
            | Instruction::Line { .. }
            | Instruction::Comment { .. } => Vec::new(),
        }
    }

    /// Variables written by this instruction.
    #[must_use]
    pub fn outputs(&self) -> Vec<&str> {
        match self {
            Instruction::Call { outputs, .. } => outputs.iter().map(String::as_str).collect(),
            Instruction::Phi(phi) => vec![phi.output()],
            Instruction::Iter { output }
            | Instruction::SimpleGet { output, .. }
            | Instruction::MatrixGet { output, .. }
            | Instruction::GetOrFirst { output, .. }
            | Instruction::SimpleSet { output, .. }
            | Instruction::MatrixSet { output, .. }
            | Instruction::RangeGet { output, .. }
            | Instruction::RangeSet { output, .. }
            | Instruction::Assignment { output, .. }
            | Instruction::End { output, .. }
            | Instruction::VerticalFlatten { output, .. }
            | Instruction::Argument { output, .. } => vec![output.as_str()],
            Instruction::For(_)
            | Instruction::While { .. }
            | Instruction::Break
            | Instruction::Continue
            | Instruction::Branch { .. }
            | Instruction::ValidateTrue { .. }
            | Instruction::Assume { .. }
            | Instruction::Line { .. }
            | Instruction::Comment { .. } => Vec::new(),
        }
    }

    /// Returns `true` if this instruction reads `variable`.
    #[must_use]
    pub fn uses(&self, variable: &str) -> bool {
        self.inputs().contains(&variable)
    }

    /// Side-effect classification.
    #[must_use]
    pub fn instruction_type(&self) -> InstructionType {
        match self {
            Instruction::Call { function, .. } => {
                if is_side_effect_function(function) {
                    InstructionType::SideEffect
                } else {
                    InstructionType::NoSideEffect
                }
            }
            Instruction::MatrixGet { .. }
            | Instruction::MatrixSet { .. }
            | Instruction::RangeGet { .. }
            | Instruction::RangeSet { .. }
            | Instruction::ValidateTrue { .. } => InstructionType::ValidationSideEffect,
            Instruction::For(_)
            | Instruction::While { .. }
            | Instruction::Break
            | Instruction::Continue
            | Instruction::Branch { .. } => InstructionType::ControlFlow,
            Instruction::Line { .. } => InstructionType::Line,
            Instruction::Comment { .. } | Instruction::Assume { .. } => InstructionType::Decorator,
            Instruction::Phi(_)
            | Instruction::Iter { .. }
            | Instruction::SimpleGet { .. }
            | Instruction::GetOrFirst { .. }
            | Instruction::SimpleSet { .. }
            | Instruction::Assignment { .. }
            | Instruction::End { .. }
            | Instruction::VerticalFlatten { .. }
            | Instruction::Argument { .. } => InstructionType::NoSideEffect,
        }
    }

    /// Returns `true` if this instruction has an observable or aborting effect.
    #[must_use]
    pub fn has_side_effects(&self) -> bool {
        self.instruction_type().has_side_effects()
    }

    /// Returns `true` if this instruction may only appear at the end of a block.
    #[must_use]
    pub const fn is_ending(&self) -> bool {
        matches!(
            self,
            Instruction::For(_)
                | Instruction::While { .. }
                | Instruction::Branch { .. }
                | Instruction::Break
                | Instruction::Continue
        )
    }

    /// Blocks owned by this control transfer.
    #[must_use]
    pub fn owned_blocks(&self) -> Vec<BlockId> {
        match self {
            Instruction::For(header) => vec![header.loop_block, header.end_block],
            Instruction::While {
                loop_block,
                end_block,
            } => vec![*loop_block, *end_block],
            Instruction::Branch {
                true_block,
                false_block,
                end_block,
                ..
            } => vec![*true_block, *false_block, *end_block],
            _ => Vec::new(),
        }
    }

    /// Block where execution continues after this control transfer.
    #[must_use]
    pub const fn end_block(&self) -> Option<BlockId> {
        match self {
            Instruction::For(ForLoop { end_block, .. })
            | Instruction::While { end_block, .. }
            | Instruction::Branch { end_block, .. } => Some(*end_block),
            _ => None,
        }
    }

    /// Returns the phi node if this is a phi.
    #[must_use]
    pub const fn as_phi(&self) -> Option<&PhiNode> {
        match self {
            Instruction::Phi(phi) => Some(phi),
            _ => None,
        }
    }

    /// Returns the loop header if this is a `for`.
    #[must_use]
    pub const fn as_for(&self) -> Option<&ForLoop> {
        match self {
            Instruction::For(header) => Some(header),
            _ => None,
        }
    }

    /// Returns `true` for line and comment markers.
    #[must_use]
    pub const fn is_marker(&self) -> bool {
        matches!(self, Instruction::Line { .. } | Instruction::Comment { .. })
    }

    /// Returns the function name if this is a call to a builtin.
    #[must_use]
    pub fn called_function(&self) -> Option<&str> {
        match self {
            Instruction::Call { function, .. } => Some(function.as_str()),
            _ => None,
        }
    }

    /// Substitutes variable names (inputs and outputs) according to `map`.
    pub fn rename_variables(&mut self, map: &HashMap<String, String>) {
        if map.is_empty() {
            return;
        }

        match self {
            Instruction::Call {
                outputs, inputs, ..
            } => {
                rename_all(outputs, map);
                rename_all(inputs, map);
            }
            Instruction::Phi(phi) => phi.rename_variables(map),
            Instruction::For(header) => {
                rename_in(&mut header.start, map);
                rename_in(&mut header.interval, map);
                rename_in(&mut header.end, map);
            }
            Instruction::Branch { condition, .. }
            | Instruction::ValidateTrue { condition }
            | Instruction::Assume { condition } => rename_in(condition, map),
            Instruction::Iter { output } | Instruction::Argument { output, .. } => {
                rename_in(output, map)
            }
            Instruction::SimpleGet {
                output,
                matrix,
                indices,
            }
            | Instruction::MatrixGet {
                output,
                matrix,
                indices,
            } => {
                rename_in(output, map);
                rename_in(matrix, map);
                rename_all(indices, map);
            }
            Instruction::GetOrFirst {
                output,
                matrix,
                index,
            } => {
                rename_in(output, map);
                rename_in(matrix, map);
                rename_in(index, map);
            }
            Instruction::SimpleSet {
                output,
                matrix,
                indices,
                value,
            }
            | Instruction::MatrixSet {
                output,
                matrix,
                indices,
                value,
            } => {
                rename_in(output, map);
                rename_in(matrix, map);
                rename_all(indices, map);
                rename_in(value, map);
            }
            Instruction::RangeGet {
                output,
                matrix,
                indices,
            } => {
                rename_in(output, map);
                rename_in(matrix, map);
                indices.iter_mut().for_each(|i| i.rename(map));
            }
            Instruction::RangeSet {
                output,
                matrix,
                indices,
                value,
            } => {
                rename_in(output, map);
                rename_in(matrix, map);
                indices.iter_mut().for_each(|i| i.rename(map));
                rename_in(value, map);
            }
            Instruction::Assignment { output, input } => {
                rename_in(output, map);
                if let AssignmentInput::Variable(v) = input {
                    rename_in(v, map);
                }
            }
            Instruction::End { output, matrix, .. }
            | Instruction::VerticalFlatten {
                output,
                input: matrix,
            } => {
                rename_in(output, map);
                rename_in(matrix, map);
            }
            Instruction::While { .. }
            | Instruction::Break
            | Instruction::Continue
            | Instruction::Line { .. }
            | Instruction::Comment { .. } => {}
        }
    }

    /// Substitutes only the variables this instruction reads.
    pub fn rename_inputs(&mut self, map: &HashMap<String, String>) {
        let outputs: Vec<String> = self.outputs().into_iter().map(str::to_string).collect();
        let filtered: HashMap<String, String> = map
            .iter()
            .filter(|(k, _)| !outputs.contains(k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        self.rename_variables(&filtered);
    }

    /// Substitutes block references (owned blocks and phi sources).
    ///
    /// `old` and `new` are parallel lists.
    pub fn rename_blocks(&mut self, old: &[BlockId], new: &[BlockId]) {
        match self {
            Instruction::Phi(phi) => phi.rename_blocks(old, new),
            Instruction::For(header) => {
                rename_block(&mut header.loop_block, old, new);
                rename_block(&mut header.end_block, old, new);
            }
            Instruction::While {
                loop_block,
                end_block,
            } => {
                rename_block(loop_block, old, new);
                rename_block(end_block, old, new);
            }
            Instruction::Branch {
                true_block,
                false_block,
                end_block,
                ..
            } => {
                rename_block(true_block, old, new);
                rename_block(false_block, old, new);
                rename_block(end_block, old, new);
            }
            _ => {}
        }
    }

    /// Updates phi sources after `original` was split and its tail moved so
    /// that control now leaves through `end`.
    pub fn break_block(&mut self, original: BlockId, end: BlockId) {
        if let Instruction::Phi(phi) = self {
            phi.break_block(original, end);
        }
    }
}

fn join(items: &[String]) -> String {
    items.join(", ")
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instruction::Call {
                function,
                outputs,
                inputs,
            } => {
                if outputs.is_empty() {
                    write!(f, "{} {}", function, join(inputs))
                } else {
                    write!(f, "{} = {} {}", join(outputs), function, join(inputs))
                }
            }
            Instruction::Phi(phi) => write!(f, "{}", phi),
            Instruction::For(header) => {
                write!(
                    f,
                    "for {}, {}, {}, {}, {}",
                    header.start, header.interval, header.end, header.loop_block, header.end_block
                )?;
                for property in &header.properties {
                    write!(f, " %!{}", property)?;
                }
                Ok(())
            }
            Instruction::While {
                loop_block,
                end_block,
            } => write!(f, "while {}, {}", loop_block, end_block),
            Instruction::Break => write!(f, "break"),
            Instruction::Continue => write!(f, "continue"),
            Instruction::Branch {
                condition,
                true_block,
                false_block,
                end_block,
            } => write!(
                f,
                "branch {}, {}, {}, {}",
                condition, true_block, false_block, end_block
            ),
            Instruction::Iter { output } => write!(f, "{} = iter", output),
            Instruction::SimpleGet {
                output,
                matrix,
                indices,
            } => write!(f, "{} = simple_get {}({})", output, matrix, join(indices)),
            Instruction::MatrixGet {
                output,
                matrix,
                indices,
            } => write!(f, "{} = get {}({})", output, matrix, join(indices)),
            Instruction::GetOrFirst {
                output,
                matrix,
                index,
            } => write!(f, "{} = get_or_first {}({})", output, matrix, index),
            Instruction::SimpleSet {
                output,
                matrix,
                indices,
                value,
            } => write!(
                f,
                "{} = simple_set {}({}), {}",
                output,
                matrix,
                join(indices),
                value
            ),
            Instruction::MatrixSet {
                output,
                matrix,
                indices,
                value,
            } => write!(f, "{} = set {}({}), {}", output, matrix, join(indices), value),
            Instruction::RangeGet {
                output,
                matrix,
                indices,
            } => {
                let idx: Vec<String> = indices.iter().map(ToString::to_string).collect();
                write!(f, "{} = range_get {}({})", output, matrix, idx.join(", "))
            }
            Instruction::RangeSet {
                output,
                matrix,
                indices,
                value,
            } => {
                let idx: Vec<String> = indices.iter().map(ToString::to_string).collect();
                write!(
                    f,
                    "{} = range_set {}({}), {}",
                    output,
                    matrix,
                    idx.join(", "),
                    value
                )
            }
            Instruction::Assignment { output, input } => match input {
                AssignmentInput::Number(n) => write!(f, "{} = {}", output, n),
                AssignmentInput::Variable(v) => write!(f, "{} = {}", output, v),
                AssignmentInput::Undefined => write!(f, "{} = !undefined", output),
            },
            Instruction::End {
                output,
                matrix,
                index,
                num_indices,
            } => write!(f, "{} = end {}, {}, {}", output, matrix, index, num_indices),
            Instruction::VerticalFlatten { output, input } => {
                write!(f, "{} = {}(:)", output, input)
            }
            Instruction::ValidateTrue { condition } => write!(f, "validate_true {}", condition),
            Instruction::Assume { condition } => write!(f, "assume {}", condition),
            Instruction::Argument { output, index } => write!(f, "{} = arg {}", output, index),
            Instruction::Line { line } => write!(f, "line {}", line),
            Instruction::Comment { text } => write!(f, "% {}", text),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn b(id: usize) -> BlockId {
        BlockId::new(id)
    }

    #[test]
    fn test_call_inputs_outputs() {
        let inst = Instruction::call(
            "plus",
            vec!["y$1".into()],
            vec!["a$1".into(), "b$1".into()],
        );
        assert_eq!(inst.inputs(), vec!["a$1", "b$1"]);
        assert_eq!(inst.outputs(), vec!["y$1"]);
        assert_eq!(inst.instruction_type(), InstructionType::NoSideEffect);
        assert!(!inst.is_ending());
    }

    #[test]
    fn test_side_effect_call() {
        let inst = Instruction::call("disp", vec![], vec!["a$1".into()]);
        assert!(inst.has_side_effects());
    }

    #[test]
    fn test_for_owned_blocks() {
        let inst = Instruction::For(ForLoop::new("s", "i", "e", b(1), b(2)));
        assert!(inst.is_ending());
        assert_eq!(inst.owned_blocks(), vec![b(1), b(2)]);
        assert_eq!(inst.end_block(), Some(b(2)));
        assert_eq!(inst.inputs(), vec!["s", "i", "e"]);
        assert!(inst.outputs().is_empty());
    }

    #[test]
    fn test_simple_set_io() {
        let inst = Instruction::SimpleSet {
            output: "A$2".into(),
            matrix: "A$1".into(),
            indices: vec!["i$1".into(), "j$1".into()],
            value: "v$1".into(),
        };
        assert_eq!(inst.inputs(), vec!["A$1", "i$1", "j$1", "v$1"]);
        assert_eq!(inst.outputs(), vec!["A$2"]);
    }

    #[test]
    fn test_rename_variables() {
        let mut inst = Instruction::SimpleGet {
            output: "x$1".into(),
            matrix: "A$1".into(),
            indices: vec!["i$1".into()],
        };
        let map = HashMap::from([
            ("i$1".to_string(), "k$1".to_string()),
            ("x$1".to_string(), "x$9".to_string()),
        ]);
        inst.rename_variables(&map);
        assert_eq!(inst.inputs(), vec!["A$1", "k$1"]);
        assert_eq!(inst.outputs(), vec!["x$9"]);
    }

    #[test]
    fn test_rename_inputs_only() {
        let mut inst = Instruction::assign_variable("x$1", "x$1_in");
        let map = HashMap::from([
            ("x$1".to_string(), "z".to_string()),
            ("x$1_in".to_string(), "w".to_string()),
        ]);
        inst.rename_inputs(&map);
        assert_eq!(inst.outputs(), vec!["x$1"]);
        assert_eq!(inst.inputs(), vec!["w"]);
    }

    #[test]
    fn test_rename_blocks() {
        let mut inst = Instruction::Branch {
            condition: "c".into(),
            true_block: b(1),
            false_block: b(2),
            end_block: b(3),
        };
        inst.rename_blocks(&[b(2), b(3)], &[b(5), b(6)]);
        assert_eq!(inst.owned_blocks(), vec![b(1), b(5), b(6)]);
    }

    #[test]
    fn test_display() {
        let inst = Instruction::For(ForLoop::new("$1", "$1", "n$1", b(1), b(2)));
        assert_eq!(inst.to_string(), "for $1, $1, n$1, #1, #2");
        let inst = Instruction::assign_integer("x", 3);
        assert_eq!(inst.to_string(), "x = 3");
    }
}
