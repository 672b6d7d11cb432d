//! Loop fusion pass.
//!
//! Merges two adjacent counted loops into one when their iteration spaces are
//! provably identical and running the second body right after the first body
//! (in the same iteration) cannot change what either computes.
//!
//! # Shape
//!
//! ```text
//! #S:  ...
//!      for s1, i1, e1, #L1, #M
//! #L1: (first body)
//! #M:  (middle block)
//!      for s2, i2, e2, #L2, #E
//! #L2: (second body)
//! #E:  ...
//! ```
//!
//! After fusion the first loop's body is followed by the second loop's body,
//! `#M` and `#L2` are gone and the first header now ends in `#E`. Middle block
//! instructions are split into a *prefix* hoisted in front of the first loop
//! and a *postfix* sunk after the fused loop.
//!
//! # Legality
//!
//! The analysis builds an immutable [`LoopNestDescription`] of each loop and
//! a partition of the middle block, then checks:
//!
//! 1. loop properties can be combined (`no_fusion` forbids fusion);
//! 2. neither body contains `break`/`continue`, and at most one has side
//!    effects;
//! 3. every middle instruction is either hoistable or not needed by the
//!    second loop;
//! 4. the second loop reads matrices built element by element by the first
//!    loop only at the element the same iteration wrote;
//! 5. start, interval and end of every nest level are the same values;
//! 6. the loops are related (they read a common matrix, or the second reads
//!    what the first built), unless the function skips
//!    `loop_fusion_only_related`.
//!
//! Nothing is changed before all checks passed.
//!
//! # Reshaped fusion
//!
//! A flat loop over `1:numel(A)` following an N-deep nest over the dimensions
//! of `A` can still be fused: its linear `simple_get`/`simple_set` accesses are
//! rewritten to N subscripts, first subscript innermost, and its body moves
//! into the innermost loop of the nest.

use std::collections::{HashMap, HashSet};

use crate::{
    analysis::{
        ssa::utils::{
            contained_blocks, has_nested_side_effects, is_simple_section, rename_variables_nested,
        },
        BlockId, ForLoop, FunctionBody, FunctionProperties, Instruction, LoopProperty, PhiNode,
        SizeGroupInformation, SsaBlock, TypeProvider, VariableTypes,
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

/// Skip key that allows fusing loops with nothing in common.
pub const SKIP_ONLY_RELATED: &str = "loop_fusion_only_related";

/// Builtins that may read a cooperatively built matrix in the middle block.
///
/// They only look at the size, which the matrix had before the first loop.
const SIZE_ONLY_FUNCTIONS: &[&str] = &["matisse_new_array_from_matrix", "numel", "size"];

/// One subscript of an element-by-element write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessIndex {
    /// The iteration variable of the nest level at this depth
    Iter(usize),
    /// Any other variable
    Variable(String),
}

/// A matrix a loop nest builds one element per iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatrixAccessPattern {
    /// Matrix entering the nest
    pub source: String,
    /// Matrix leaving this level, once the level wrote it
    pub built: Option<String>,
    /// Output of the innermost `simple_set`
    pub set_matrix: Option<String>,
    /// Subscripts of the innermost `simple_set`
    pub indices: Vec<AccessIndex>,
}

impl MatrixAccessPattern {
    fn entering(source: impl Into<String>) -> Self {
        MatrixAccessPattern {
            source: source.into(),
            built: None,
            set_matrix: None,
            indices: Vec::new(),
        }
    }

    /// Whether every level of a `depth`-deep nest subscripts the write.
    ///
    /// Only then does each iteration write its own element. A write at a
    /// loop-invariant index such as `X(k)` is overwritten by later iterations.
    #[must_use]
    pub fn writes_distinct_elements(&self, depth: usize) -> bool {
        (0..depth).all(|level| self.indices.contains(&AccessIndex::Iter(level)))
    }
}

/// One `for` of a nest.
#[derive(Debug, Clone, PartialEq)]
pub struct LoopLevel {
    /// Block ending with the header
    pub container: BlockId,
    /// First block of the body
    pub loop_block: BlockId,
    /// Last block of the body at this level
    pub last_block: BlockId,
    /// Block after the loop
    pub after_block: BlockId,
    /// First iteration value
    pub start: String,
    /// Step
    pub interval: String,
    /// Last iteration value
    pub end: String,
    /// Iteration variable, if the body reads it
    pub iter: Option<String>,
}

impl LoopLevel {
    fn new(header: &ForLoop, container: BlockId) -> Self {
        LoopLevel {
            container,
            loop_block: header.loop_block,
            last_block: header.loop_block,
            after_block: header.end_block,
            start: header.start.clone(),
            interval: header.interval.clone(),
            end: header.end.clone(),
            iter: None,
        }
    }
}

/// What fusion needs to know about a loop nest.
#[derive(Debug, Clone, Default)]
pub struct LoopNestDescription {
    /// Headers, outermost first
    pub levels: Vec<LoopLevel>,
    /// Matrices read by element accesses
    pub read_matrices: HashSet<String>,
    /// Cooperatively built matrices, keyed by their name at the outer level
    pub built: HashMap<String, MatrixAccessPattern>,
    /// Whether any block of the nest has side effects
    pub has_side_effects: bool,
}

impl LoopNestDescription {
    fn depth(&self) -> usize {
        self.levels.len()
    }

    fn iters(&self) -> Vec<Option<String>> {
        self.levels.iter().map(|l| l.iter.clone()).collect()
    }
}

fn read_matrix(instruction: &Instruction) -> Option<&str> {
    match instruction {
        Instruction::SimpleGet { matrix, .. }
        | Instruction::GetOrFirst { matrix, .. }
        | Instruction::MatrixGet { matrix, .. } => Some(matrix),
        _ => None,
    }
}

/// Walks the body of the loop headed by `header` at nesting `depth`.
///
/// `candidates` collects the matrices this level builds element by element.
/// Returns `false` if the level has an unexpected shape.
fn examine_first_level(
    body: &FunctionBody,
    types: &dyn TypeProvider,
    header: &ForLoop,
    container: BlockId,
    nest: &mut LoopNestDescription,
    candidates: &mut HashMap<String, MatrixAccessPattern>,
) -> bool {
    let depth = nest.levels.len();
    nest.levels.push(LoopLevel::new(header, container));

    let mut child_built: HashMap<String, MatrixAccessPattern> = HashMap::new();
    let mut nested_container = None;
    let mut next = Some(header.loop_block);
    let mut is_start = true;

    while let Some(current) = next.take() {
        let Some(block) = body.block(current) else {
            return false;
        };
        nest.levels[depth].last_block = current;

        for instruction in block.instructions() {
            match instruction {
                Instruction::Iter { output } => {
                    if !is_start || nest.levels[depth].iter.is_some() {
                        return false;
                    }
                    nest.levels[depth].iter = Some(output.clone());
                    continue;
                }
                Instruction::Phi(phi) => {
                    if types.is_matrix(phi.output()) {
                        if is_start {
                            if let Some(source) = phi.input_from(container) {
                                candidates.insert(
                                    phi.output().to_string(),
                                    MatrixAccessPattern::entering(source),
                                );
                            }
                        } else if let Some(parent) = nested_container {
                            record_nested_build(phi, parent, candidates, &child_built);
                        }
                    }
                    continue;
                }
                Instruction::SimpleSet {
                    output,
                    matrix,
                    indices,
                    ..
                } if nested_container.is_none() && !indices.is_empty() => {
                    if let Some(previous) = candidates.get(matrix).filter(|p| p.built.is_none()) {
                        let iters = nest.iters();
                        let pattern = MatrixAccessPattern {
                            source: previous.source.clone(),
                            built: Some(output.clone()),
                            set_matrix: Some(output.clone()),
                            indices: indices
                                .iter()
                                .map(|index| {
                                    match iters.iter().position(|i| i.as_deref() == Some(index)) {
                                        Some(level) => AccessIndex::Iter(level),
                                        None => AccessIndex::Variable(index.clone()),
                                    }
                                })
                                .collect(),
                        };
                        candidates.insert(output.clone(), pattern);
                    }
                }
                _ => {}
            }

            if let Some(matrix) = read_matrix(instruction) {
                nest.read_matrices.insert(matrix.to_string());
            }

            if let Instruction::For(nested) = instruction {
                if nested_container.is_none() {
                    let mut nested_nest = nest.clone();
                    let mut nested_built = HashMap::new();
                    if examine_first_level(
                        body,
                        types,
                        nested,
                        current,
                        &mut nested_nest,
                        &mut nested_built,
                    ) {
                        *nest = nested_nest;
                        child_built = nested_built;
                        nested_container = Some(current);
                    }
                }
            }

            if instruction.is_ending() {
                next = instruction.end_block();
                break;
            }
        }

        is_start = false;
    }

    true
}

/// Lifts a matrix built by a nested loop to the enclosing level.
///
/// `phi` is an after-loop phi of the nested loop whose container is
/// `parent`.
fn record_nested_build(
    phi: &PhiNode,
    parent: BlockId,
    candidates: &mut HashMap<String, MatrixAccessPattern>,
    child_built: &HashMap<String, MatrixAccessPattern>,
) {
    let Some(before) = phi.input_from(parent) else {
        return;
    };
    let Some(loop_end) = phi
        .operands()
        .iter()
        .find(|op| op.source() != parent)
        .map(|op| op.value())
    else {
        return;
    };

    let outer = candidates.get(before).filter(|p| p.built.is_none());
    let inner = child_built.get(loop_end).filter(|p| p.built.is_some());
    if let (Some(outer), Some(inner)) = (outer, inner) {
        let pattern = MatrixAccessPattern {
            source: outer.source.clone(),
            built: Some(phi.output().to_string()),
            set_matrix: inner.set_matrix.clone(),
            indices: inner.indices.clone(),
        };
        candidates.insert(phi.output().to_string(), pattern);
    }
}

/// Describes the nest headed by `header`, which ends `container`.
#[must_use]
pub fn describe_first_loop(
    body: &FunctionBody,
    types: &dyn TypeProvider,
    header: &ForLoop,
    container: BlockId,
) -> Option<LoopNestDescription> {
    let mut nest = LoopNestDescription::default();
    let mut built = HashMap::new();
    if !examine_first_level(body, types, header, container, &mut nest, &mut built) {
        return None;
    }
    nest.built = built;
    nest.has_side_effects = has_nested_side_effects(body, header.loop_block);
    Some(nest)
}

/// The middle block split into what moves before and after the fused loop.
#[derive(Debug, Clone, Default)]
struct MiddlePartition {
    prefix: Vec<Instruction>,
    postfix: Vec<Instruction>,
    blacklist: HashSet<String>,
    /// Middle phi output -> value the first loop built
    cooperative: HashMap<String, String>,
    /// Middle phi output -> how the first loop built it
    patterns: HashMap<String, MatrixAccessPattern>,
}

impl MiddlePartition {
    fn build(
        middle: &SsaBlock,
        container: BlockId,
        first: &LoopNestDescription,
        first_exit: BlockId,
        second_has_side_effects: bool,
    ) -> std::result::Result<Self, &'static str> {
        let mut partition = MiddlePartition::default();

        for instruction in middle.instructions() {
            match instruction {
                Instruction::Line { .. } | Instruction::Comment { .. } => {
                    partition.prefix.push(instruction.clone());
                }
                Instruction::Phi(phi) => {
                    partition.postfix.push(instruction.clone());
                    let output = phi.output().to_string();
                    let (Some(start), Some(built)) =
                        (phi.input_from(container), phi.input_from(first_exit))
                    else {
                        partition.blacklist.insert(output);
                        continue;
                    };
                    match first.built.get(built) {
                        Some(pattern)
                            if pattern.built.is_some()
                                && pattern.source == start
                                && pattern.writes_distinct_elements(first.depth()) =>
                        {
                            partition.cooperative.insert(output.clone(), built.to_string());
                            partition.patterns.insert(output, pattern.clone());
                        }
                        _ => {
                            partition.blacklist.insert(output);
                        }
                    }
                }
                Instruction::For(header) => {
                    if [&header.start, &header.interval, &header.end]
                        .iter()
                        .any(|v| partition.blacklist.contains(v.as_str()))
                    {
                        return Err("second loop header depends on the first loop");
                    }
                }
                _ => {
                    let size_only = instruction
                        .called_function()
                        .is_some_and(|f| SIZE_ONLY_FUNCTIONS.contains(&f));
                    let blocked = instruction.inputs().iter().any(|input| {
                        partition.blacklist.contains(*input)
                            || (!size_only && partition.cooperative.contains_key(*input))
                    }) || (instruction.has_side_effects() && first.has_side_effects);

                    if blocked {
                        partition.postfix.push(instruction.clone());
                        partition
                            .blacklist
                            .extend(instruction.outputs().into_iter().map(str::to_string));
                    } else {
                        partition.prefix.push(instruction.clone());
                    }
                }
            }
        }

        if second_has_side_effects && partition.postfix.iter().any(Instruction::has_side_effects) {
            return Err("middle block effect would move past the second loop's effects");
        }

        Ok(partition)
    }

    /// Prefix instructions with built matrices renamed to the matrices
    /// entering the first loop.
    fn hoisted_prefix(&self) -> Vec<Instruction> {
        let names: HashMap<String, String> = self
            .patterns
            .iter()
            .map(|(name, pattern)| (name.clone(), pattern.source.clone()))
            .collect();
        self.prefix
            .iter()
            .cloned()
            .map(|mut instruction| {
                instruction.rename_variables(&names);
                instruction
            })
            .collect()
    }
}

/// Walks the second loop, which must only read built matrices at the
/// element the first loop wrote in the same iteration.
fn describe_second_loop(
    body: &FunctionBody,
    header: &ForLoop,
    container: BlockId,
    middle: &MiddlePartition,
    sizes: &SizeGroupInformation,
    nest: &mut LoopNestDescription,
) -> bool {
    let depth = nest.levels.len();
    nest.levels.push(LoopLevel::new(header, container));
    let mut nested = false;
    let mut next = Some(header.loop_block);

    while let Some(current) = next.take() {
        let Some(block) = body.block(current) else {
            return false;
        };
        nest.levels[depth].last_block = current;

        for instruction in block.instructions() {
            if instruction
                .inputs()
                .iter()
                .any(|input| middle.blacklist.contains(*input))
            {
                return false;
            }
            if let Some(matrix) = read_matrix(instruction) {
                nest.read_matrices.insert(matrix.to_string());
            }

            if let Instruction::SimpleGet {
                matrix, indices, ..
            } = instruction
            {
                let Some(pattern) = middle.patterns.get(matrix).filter(|p| !p.indices.is_empty())
                else {
                    continue;
                };
                if pattern.indices.len() != indices.len() {
                    return false;
                }
                let iters = nest.iters();
                let matches = pattern.indices.iter().zip(indices).all(|(expected, index)| {
                    match expected {
                        AccessIndex::Iter(level) => {
                            iters.get(*level).and_then(Option::as_deref) == Some(index.as_str())
                        }
                        AccessIndex::Variable(variable) => sizes.are_same_value(index, variable),
                    }
                });
                if !matches {
                    return false;
                }
                continue;
            }

            if instruction
                .inputs()
                .iter()
                .any(|input| middle.cooperative.contains_key(*input))
            {
                return false;
            }

            match instruction {
                Instruction::Iter { output } => {
                    if nest.levels[depth].iter.is_some() {
                        return false;
                    }
                    nest.levels[depth].iter = Some(output.clone());
                }
                Instruction::For(inner) => {
                    if nested
                        || !describe_second_loop(body, inner, current, middle, sizes, nest)
                    {
                        return false;
                    }
                    nested = true;
                }
                other if !other.owned_blocks().is_empty() => return false,
                _ => {}
            }

            if instruction.is_ending() {
                next = instruction.end_block();
                break;
            }
        }
    }

    true
}

/// Combines the annotations of two fused headers.
///
/// Returns `None` if either annotation forbids fusion.
#[must_use]
pub fn combine_loop_properties(
    first: &[LoopProperty],
    second: &[LoopProperty],
) -> Option<Vec<LoopProperty>> {
    let mut combined = Vec::new();
    for property in first.iter().chain(second) {
        let in_first = first.contains(property);
        let in_second = second.contains(property);
        match property {
            LoopProperty::NoFusion => return None,
            LoopProperty::Parallel => {
                if in_first && in_second && !combined.contains(property) {
                    combined.push(property.clone());
                }
            }
            LoopProperty::Named(_) => {
                if !(in_first && in_second) {
                    return None;
                }
                if !combined.contains(property) {
                    combined.push(property.clone());
                }
            }
        }
    }
    Some(combined)
}

/// A phi of the flat loop carrying a matrix it writes element by element.
#[derive(Debug, Clone)]
struct FlatVariable {
    loop_start: String,
    before: String,
    generated: String,
}

/// Everything the rewrite needs, computed before anything changes.
#[derive(Debug)]
enum FusionPlan {
    /// Both nests have the same depth.
    Aligned {
        container: BlockId,
        first: ForLoop,
        second: ForLoop,
        properties: Vec<LoopProperty>,
        first_nest: LoopNestDescription,
        second_nest: LoopNestDescription,
        middle: MiddlePartition,
    },
    /// A flat loop moves into the innermost level of a nest.
    Reshaped {
        container: BlockId,
        first: ForLoop,
        second: ForLoop,
        first_nest: LoopNestDescription,
        middle: MiddlePartition,
        variables: Vec<FlatVariable>,
        body: Vec<Instruction>,
    },
}

impl FusionPlan {
    fn container(&self) -> BlockId {
        match self {
            FusionPlan::Aligned { container, .. } | FusionPlan::Reshaped { container, .. } => {
                *container
            }
        }
    }
}

/// Loop fusion pass.
pub struct LoopFusionPass;

impl Default for LoopFusionPass {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopFusionPass {
    /// Creates a new loop fusion pass.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    fn plan(
        body: &FunctionBody,
        types: &VariableTypes,
        sizes: &mut SizeGroupInformation,
        container: BlockId,
        first: &ForLoop,
        second: &ForLoop,
    ) -> std::result::Result<FusionPlan, &'static str> {
        let properties = combine_loop_properties(&first.properties, &second.properties)
            .ok_or("loop properties forbid fusion")?;

        if !is_simple_section(body, first.loop_block) || !is_simple_section(body, second.loop_block)
        {
            return Err("loop body contains break or continue");
        }
        let second_has_side_effects = has_nested_side_effects(body, second.loop_block);

        let first_nest = describe_first_loop(body, types, first, container)
            .ok_or("first loop has an unexpected shape")?;
        if first_nest.has_side_effects && second_has_side_effects {
            return Err("both loops have side effects");
        }

        let middle_block = body.block(first.end_block).ok_or("missing middle block")?;
        let middle = MiddlePartition::build(
            middle_block,
            container,
            &first_nest,
            body.block_end(first.loop_block),
            second_has_side_effects,
        )?;

        let mut second_nest = LoopNestDescription {
            has_side_effects: second_has_side_effects,
            ..LoopNestDescription::default()
        };
        if describe_second_loop(body, second, first.end_block, &middle, sizes, &mut second_nest) {
            if first_nest.depth() != second_nest.depth() {
                return Err("loops have different depths");
            }
            for (a, b) in first_nest.levels.iter().zip(&second_nest.levels) {
                if !sizes.are_same_value(&a.start, &b.start) {
                    return Err("can not prove both loops start at the same value");
                }
                if !sizes.are_same_value(&a.interval, &b.interval) {
                    return Err("can not prove both loops have the same interval");
                }
                if !sizes.are_same_value(&a.end, &b.end) {
                    return Err("can not prove both loops end at the same value");
                }
            }
            if !body.should_skip(SKIP_ONLY_RELATED)
                && !Self::are_related(&first_nest, &middle, &second_nest)
            {
                return Err("loops are unrelated");
            }

            return Ok(FusionPlan::Aligned {
                container,
                first: first.clone(),
                second: second.clone(),
                properties,
                first_nest,
                second_nest,
                middle,
            });
        }

        if first_nest.depth() < 2 {
            return Err("second loop reads built matrices out of step");
        }
        if !properties.is_empty() {
            return Err("reshaped fusion does not support loop properties");
        }
        Self::plan_reshaped(body, sizes, container, first, second, first_nest, middle)
    }

    fn are_related(
        first: &LoopNestDescription,
        middle: &MiddlePartition,
        second: &LoopNestDescription,
    ) -> bool {
        first
            .read_matrices
            .iter()
            .chain(middle.patterns.keys())
            .any(|m| second.read_matrices.contains(m))
    }

    fn plan_reshaped(
        body: &FunctionBody,
        sizes: &mut SizeGroupInformation,
        container: BlockId,
        first: &ForLoop,
        second: &ForLoop,
        first_nest: LoopNestDescription,
        middle: MiddlePartition,
    ) -> std::result::Result<FusionPlan, &'static str> {
        let depth = first_nest.depth();
        let unit = |name: &str| sizes.is_known_equal(name, 1.0);
        if !first_nest
            .levels
            .iter()
            .all(|l| unit(&l.start) && unit(&l.interval))
            || !unit(&second.start)
            || !unit(&second.interval)
        {
            return Err("reshaped fusion needs loops counting from one in unit steps");
        }

        let innermost = &first_nest.levels[depth - 1];
        if innermost.last_block != innermost.loop_block {
            return Err("innermost loop of the nest is not a single block");
        }
        let Some(iters) = first_nest
            .levels
            .iter()
            .rev()
            .map(|l| l.iter.clone())
            .collect::<Option<Vec<String>>>()
        else {
            return Err("nest level without iteration variable");
        };

        let flat = body.block(second.loop_block).ok_or("missing second loop block")?;
        if flat.has_ending_instruction() {
            return Err("flat loop is not a single block");
        }

        let middle_block = first.end_block;
        let flat_block = second.loop_block;
        let mut flat_iter: Option<&str> = None;
        let mut variables: Vec<FlatVariable> = Vec::new();
        let mut rewritten = Vec::new();
        let mut accessed: Vec<String> = Vec::new();
        let mut reads = 0;

        for instruction in flat.instructions() {
            if instruction
                .inputs()
                .iter()
                .any(|input| middle.blacklist.contains(*input))
            {
                return Err("flat loop uses a value computed after the first loop");
            }

            match instruction {
                Instruction::Phi(phi) => {
                    let (Some(before), Some(generated)) =
                        (phi.input_from(middle_block), phi.input_from(flat_block))
                    else {
                        return Err("flat loop phi has unexpected sources");
                    };
                    if middle.cooperative.contains_key(before) {
                        return Err("flat loop carries a matrix built by the nest");
                    }
                    variables.push(FlatVariable {
                        loop_start: phi.output().to_string(),
                        before: before.to_string(),
                        generated: generated.to_string(),
                    });
                    continue;
                }
                Instruction::Iter { output } => {
                    if flat_iter.is_some() {
                        return Err("flat loop has several iteration variables");
                    }
                    flat_iter = Some(output);
                    continue;
                }
                _ => {}
            }

            let uses_iter = flat_iter.is_some_and(|j| instruction.uses(j));
            match instruction {
                Instruction::SimpleGet {
                    output,
                    matrix,
                    indices,
                } if uses_iter => {
                    if indices.len() != 1 {
                        return Err("flat loop read is not linear");
                    }
                    let source = match middle.patterns.get(matrix) {
                        Some(pattern) => {
                            Self::check_reversed_pattern(sizes, pattern, depth)?;
                            pattern
                                .set_matrix
                                .clone()
                                .ok_or("built matrix has no element write")?
                        }
                        None => matrix.clone(),
                    };
                    accessed.push(matrix.clone());
                    reads += 1;
                    rewritten.push(Instruction::SimpleGet {
                        output: output.clone(),
                        matrix: source,
                        indices: iters.clone(),
                    });
                }
                Instruction::SimpleSet {
                    output,
                    matrix,
                    indices,
                    value,
                } if uses_iter => {
                    if indices.len() != 1 || flat_iter == Some(value.as_str()) {
                        return Err("flat loop write is not linear");
                    }
                    let carried = variables.iter().any(|v| {
                        v.loop_start == *matrix && v.generated == *output
                    });
                    if !carried {
                        return Err("flat loop write does not update its loop phi");
                    }
                    accessed.push(matrix.clone());
                    rewritten.push(Instruction::SimpleSet {
                        output: output.clone(),
                        matrix: matrix.clone(),
                        indices: iters.clone(),
                        value: value.clone(),
                    });
                }
                _ if uses_iter => {
                    return Err("flat loop uses its iteration variable outside an access");
                }
                other => {
                    if other
                        .inputs()
                        .iter()
                        .any(|input| middle.cooperative.contains_key(*input))
                    {
                        return Err("flat loop uses a built matrix outside an access");
                    }
                    rewritten.push(other.clone());
                }
            }
        }

        if reads == 0 {
            return Err("flat loop reads nothing");
        }
        let written: HashSet<&str> = rewritten
            .iter()
            .filter_map(|i| match i {
                Instruction::SimpleSet { matrix, .. } => Some(matrix.as_str()),
                _ => None,
            })
            .collect();
        if variables.iter().any(|v| !written.contains(v.loop_start.as_str())) {
            return Err("flat loop carries a value it does not write element-wise");
        }

        let end_block = body.block(second.end_block).ok_or("missing end block")?;
        for phi in end_block.phis() {
            let carried = phi
                .input_from(flat_block)
                .is_some_and(|value| variables.iter().any(|v| v.generated == value));
            if !carried {
                return Err("value leaving the flat loop is not a written matrix");
            }
        }

        if !body.has_property(FunctionProperties::ASSUME_MATRIX_SIZES_MATCH) {
            for dim in 0..depth {
                let end = &first_nest.levels[depth - dim - 1].end;
                for matrix in &accessed {
                    let size = if dim == depth - 1 {
                        sizes.get_size_since_result(matrix, dim)
                    } else {
                        sizes.get_size_result(matrix, dim)
                    };
                    if !sizes.are_same_value(end, &size) {
                        return Err("can not prove matrix dimensions match the nest");
                    }
                }
            }
        }
        let numel_matches = accessed.iter().any(|matrix| {
            let numel = sizes.get_numel_result(matrix);
            sizes.are_same_value(&numel, &second.end)
        });
        if !numel_matches {
            return Err("can not prove the flat loop covers every element");
        }

        Ok(FusionPlan::Reshaped {
            container,
            first: first.clone(),
            second: second.clone(),
            first_nest,
            middle,
            variables,
            body: rewritten,
        })
    }

    /// A matrix built by the nest can be read linearly only if the nest
    /// wrote it with the innermost iteration variable first.
    fn check_reversed_pattern(
        sizes: &SizeGroupInformation,
        pattern: &MatrixAccessPattern,
        depth: usize,
    ) -> std::result::Result<(), &'static str> {
        if pattern.indices.len() < depth {
            return Err("built matrix is not written with every iteration variable");
        }
        for (position, index) in pattern.indices.iter().enumerate() {
            let expected = if position < depth {
                matches!(index, AccessIndex::Iter(level) if *level == depth - position - 1)
            } else {
                matches!(index, AccessIndex::Variable(v) if sizes.is_known_equal(v, 1.0))
            };
            if !expected {
                return Err("built matrix is not written in reversed iteration order");
            }
        }
        Ok(())
    }

    /// Finds the first pair of adjacent loops that can be fused.
    fn find_plan(
        function: &TypedFunction,
        sizes: &mut SizeGroupInformation,
        rejections: &mut Vec<(BlockId, &'static str)>,
    ) -> Option<FusionPlan> {
        let body = &function.body;
        for (container, block) in body.iter_blocks() {
            let Some(first) = block.ending_instruction().and_then(Instruction::as_for) else {
                continue;
            };
            let Some(second) = body
                .block(first.end_block)
                .and_then(SsaBlock::ending_instruction)
                .and_then(Instruction::as_for)
            else {
                continue;
            };

            match Self::plan(body, &function.types, sizes, container, first, second) {
                Ok(plan) => return Some(plan),
                Err(reason) => rejections.push((container, reason)),
            }
        }
        None
    }
}

fn rename_phi_sources(
    body: &mut FunctionBody,
    block: BlockId,
    old: &[BlockId],
    new: &[BlockId],
) -> Result<()> {
    for instruction in body.try_block_mut(block)?.instructions_mut() {
        if let Instruction::Phi(phi) = instruction {
            phi.rename_blocks(old, new);
        }
    }
    Ok(())
}

/// Points the first header at `end_block`, combines properties and hoists
/// the prefix in front of it.
fn retarget_first_header(
    body: &mut FunctionBody,
    container: BlockId,
    end_block: BlockId,
    properties: Option<Vec<LoopProperty>>,
    prefix: Vec<Instruction>,
) -> Result<()> {
    let block = body.try_block_mut(container)?;
    let Some(Instruction::For(header)) = block.ending_instruction_mut() else {
        return Err(malformed_error!("block {} no longer ends with a for", container));
    };
    header.end_block = end_block;
    if let Some(properties) = properties {
        header.properties = properties;
    }
    let at = block.len() - 1;
    block.insert_instructions(at, prefix);
    Ok(())
}

/// Moves the postfix to the end block: phis first, then the rest after all
/// phis.
fn sink_postfix(
    body: &mut FunctionBody,
    end_block: BlockId,
    postfix: Vec<Instruction>,
    old_exit: BlockId,
    new_exit: BlockId,
) -> Result<()> {
    let (phis, others): (Vec<Instruction>, Vec<Instruction>) = postfix
        .into_iter()
        .partition(|i| matches!(i, Instruction::Phi(_)));
    let phis = phis.into_iter().map(|mut phi| {
        phi.rename_blocks(&[old_exit], &[new_exit]);
        phi
    });

    let block = body.try_block_mut(end_block)?;
    block.insert_instructions(0, phis);
    let at = block.after_phi_insertion_point();
    block.insert_instructions(at, others);
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn apply_aligned(
    function: &mut TypedFunction,
    container: BlockId,
    first: &ForLoop,
    second: &ForLoop,
    properties: Vec<LoopProperty>,
    first_nest: &LoopNestDescription,
    second_nest: &LoopNestDescription,
    middle: &MiddlePartition,
) -> Result<()> {
    let body = &mut function.body;
    let middle_block = first.end_block;
    let second_block = second.loop_block;
    let end_block = second.end_block;
    let first_exit = body.block_end(first.loop_block);
    let second_exit = body.block_end(second_block);

    let mut names = middle.cooperative.clone();
    let first_iter = first_nest.levels[0].iter.clone();
    if let (Some(kept), Some(merged)) = (&first_iter, &second_nest.levels[0].iter) {
        names.insert(merged.clone(), kept.clone());
    }
    rename_variables_nested(body, second_block, &names);

    let moved = std::mem::take(body.try_block_mut(second_block)?.instructions_mut());
    let mut phis = Vec::new();
    let mut iter = None;
    let mut rest = Vec::new();
    for instruction in moved {
        match instruction {
            Instruction::Phi(_) => phis.push(instruction),
            Instruction::Iter { .. } => iter = Some(instruction),
            other => rest.push(other),
        }
    }

    let loop_block = body.try_block_mut(first.loop_block)?;
    let at = loop_block.after_phi_insertion_point();
    loop_block.insert_instructions(at, phis);
    if let (None, Some(iter)) = (&first_iter, iter) {
        let at = loop_block.after_phi_insertion_point();
        loop_block.insert_instruction(at, iter);
    }
    body.try_block_mut(first_exit)?.add_instructions(rest);
    body.try_block_mut(middle_block)?.clear();

    retarget_first_header(body, container, end_block, Some(properties), middle.hoisted_prefix())?;
    let fused_exit = body.block_end(first.loop_block);

    rename_phi_sources(
        body,
        first.loop_block,
        &[middle_block, first_exit, second_exit],
        &[container, fused_exit, fused_exit],
    )?;
    rename_phi_sources(
        body,
        end_block,
        &[middle_block, second_exit],
        &[container, fused_exit],
    )?;
    sink_postfix(body, end_block, middle.postfix.clone(), first_exit, fused_exit)?;

    // Loops nested in the second body now start from the first loop's exit.
    for block in contained_blocks(body, first_exit) {
        rename_phi_sources(body, block, &[second_block], &[first_exit])?;
    }

    body.remove_and_rename_blocks(&[middle_block, second_block])
}

fn suggested_name(variable: &str) -> &str {
    variable
        .trim_start_matches('$')
        .split('$')
        .next()
        .filter(|s| !s.is_empty())
        .unwrap_or("matrix")
}

#[allow(clippy::too_many_arguments)]
fn apply_reshaped(
    function: &mut TypedFunction,
    container: BlockId,
    first: &ForLoop,
    second: &ForLoop,
    first_nest: &LoopNestDescription,
    middle: &MiddlePartition,
    variables: &[FlatVariable],
    flat_body: Vec<Instruction>,
) -> Result<()> {
    let levels = &first_nest.levels;
    let depth = levels.len();
    let innermost = levels[depth - 1].loop_block;
    let middle_block = first.end_block;
    let flat_block = second.loop_block;
    let end_block = second.end_block;
    let nest_exit = function.body.block_end(first.loop_block);

    let mut exit_names = HashMap::new();
    let mut innermost_phis = Vec::new();
    for variable in variables {
        let ty = function
            .types
            .variable_type(&variable.loop_start)
            .ok_or_else(|| crate::Error::UnknownVariable(variable.loop_start.clone()))?;
        let semantic = suggested_name(&variable.loop_start).to_string();
        let entries: Vec<String> = (0..depth - 1)
            .map(|_| function.types.make_temporary(&semantic, ty.clone()))
            .collect();
        let exits: Vec<String> = (0..depth - 1)
            .map(|_| function.types.make_temporary(&semantic, ty.clone()))
            .collect();

        for d in 0..depth - 1 {
            let before = if d == 0 {
                variable.before.clone()
            } else {
                entries[d - 1].clone()
            };
            let back = function.body.block_end(levels[d].loop_block);
            function.body.try_block_mut(levels[d].loop_block)?.prepend_instruction(
                Instruction::Phi(PhiNode::new(
                    entries[d].clone(),
                    vec![before, exits[d].clone()],
                    vec![levels[d].container, back],
                )),
            );

            let inner_exit = if d + 2 == depth {
                variable.generated.clone()
            } else {
                exits[d + 1].clone()
            };
            let inner_back = function.body.block_end(levels[d + 1].loop_block);
            function.body.try_block_mut(levels[d + 1].after_block)?.prepend_instruction(
                Instruction::Phi(PhiNode::new(
                    exits[d].clone(),
                    vec![entries[d].clone(), inner_exit],
                    vec![levels[d + 1].container, inner_back],
                )),
            );
        }

        innermost_phis.push(Instruction::Phi(PhiNode::new(
            variable.loop_start.clone(),
            vec![entries[depth - 2].clone(), variable.generated.clone()],
            vec![levels[depth - 1].container, innermost],
        )));
        exit_names.insert(variable.generated.clone(), exits[0].clone());
    }

    let body = &mut function.body;
    let block = body.try_block_mut(innermost)?;
    block.insert_instructions(0, innermost_phis);
    block.add_instructions(flat_body);

    body.try_block_mut(flat_block)?.clear();
    body.try_block_mut(middle_block)?.clear();
    retarget_first_header(body, container, end_block, None, middle.hoisted_prefix())?;

    for instruction in body.try_block_mut(end_block)?.instructions_mut() {
        if let Instruction::Phi(phi) = instruction {
            phi.rename_blocks(&[middle_block, flat_block], &[container, nest_exit]);
            phi.rename_variables(&exit_names);
        }
    }
    sink_postfix(body, end_block, middle.postfix.clone(), nest_exit, nest_exit)?;

    body.remove_and_rename_blocks(&[middle_block, flat_block])
}

impl SsaPass for LoopFusionPass {
    fn name(&self) -> &'static str {
        "loop_fusion"
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
        let mut changed = false;
        let mut rejections = Vec::new();

        // Every fusion removes two blocks, so this terminates.
        loop {
            rejections.clear();
            let sizes = cache.size_groups(&function.body, &function.types);
            let Some(plan) = Self::find_plan(function, sizes, &mut rejections) else {
                break;
            };

            let container = plan.container();
            match plan {
                FusionPlan::Aligned {
                    container,
                    first,
                    second,
                    properties,
                    first_nest,
                    second_nest,
                    middle,
                } => apply_aligned(
                    function,
                    container,
                    &first,
                    &second,
                    properties,
                    &first_nest,
                    &second_nest,
                    &middle,
                )?,
                FusionPlan::Reshaped {
                    container,
                    first,
                    second,
                    first_nest,
                    middle,
                    variables,
                    body,
                } => apply_reshaped(
                    function,
                    container,
                    &first,
                    &second,
                    &first_nest,
                    &middle,
                    &variables,
                    body,
                )?,
            }

            ctx.events
                .record(EventKind::LoopFused)
                .at(function.body.name(), container.index())
                .pass(self.name());
            // Iteration and cooperative variables were renamed.
            cache.invalidate(AnalysisSet::ALL);
            changed = true;
        }

        for (container, reason) in rejections {
            ctx.events
                .record(EventKind::FusionRejected)
                .at(function.body.name(), container.index())
                .pass(self.name())
                .message(reason);
        }

        Ok(changed)
    }

    fn invalidates(&self) -> AnalysisSet {
        AnalysisSet::ALL
    }

    fn description(&self) -> &'static str {
        "Fuses adjacent loops with identical iteration spaces"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        analysis::{validate, TypeShape, VariableType},
        testing::FunctionBuilder,
    };

    #[test]
    fn test_combine_properties() {
        use LoopProperty::*;
        assert_eq!(combine_loop_properties(&[], &[]), Some(vec![]));
        assert_eq!(
            combine_loop_properties(&[Parallel], &[Parallel]),
            Some(vec![Parallel])
        );
        assert_eq!(combine_loop_properties(&[Parallel], &[]), Some(vec![]));
        assert_eq!(combine_loop_properties(&[NoFusion], &[]), None);
        assert_eq!(combine_loop_properties(&[], &[Named("x".into())]), None);
        assert_eq!(
            combine_loop_properties(&[Named("x".into())], &[Named("x".into())]),
            Some(vec![Named("x".into())])
        );
    }

    fn run(function: &mut TypedFunction) -> (bool, CompilerContext) {
        let ctx = CompilerContext::new();
        let changed = LoopFusionPass::new()
            .run_on_function(function, &mut AnalysisCache::new(), &ctx)
            .unwrap();
        (changed, ctx)
    }

    fn loop_count(function: &TypedFunction) -> usize {
        function
            .body
            .iter_instructions()
            .filter(|(_, i)| matches!(i, Instruction::For(_)))
            .count()
    }

    #[test]
    fn test_fuses_disjoint_writers() {
        let mut function = FunctionBuilder::two_fill_loops("f", false);
        assert_eq!(loop_count(&function), 2);

        let (changed, ctx) = run(&mut function);
        assert!(changed);
        assert_eq!(loop_count(&function), 1);
        assert_eq!(ctx.events.count_kind(EventKind::LoopFused), 1);
        validate(&function.body).unwrap();

        let loop_block = function
            .body
            .iter_instructions()
            .find_map(|(_, i)| i.as_for().map(|h| h.loop_block))
            .unwrap();
        let block = function.body.block(loop_block).unwrap();
        assert_eq!(block.phis().count(), 2);
        let sets = block
            .instructions()
            .iter()
            .filter(|i| matches!(i, Instruction::SimpleSet { .. }))
            .count();
        assert_eq!(sets, 2);
        let iters = block
            .instructions()
            .iter()
            .filter(|i| matches!(i, Instruction::Iter { .. }))
            .count();
        assert_eq!(iters, 1);
    }

    #[test]
    fn test_rejects_when_both_have_side_effects() {
        let mut function = FunctionBuilder::two_fill_loops("f", true);
        let (changed, ctx) = run(&mut function);
        assert!(!changed);
        assert_eq!(loop_count(&function), 2);
        assert_eq!(ctx.events.count_kind(EventKind::FusionRejected), 1);
    }

    #[test]
    fn test_no_fusion_property() {
        let mut function = FunctionBuilder::two_fill_loops("f", false);
        if let Some(Instruction::For(header)) = function
            .body
            .block_mut(BlockId::ENTRY)
            .unwrap()
            .ending_instruction_mut()
        {
            header.properties.push(LoopProperty::NoFusion);
        }
        let (changed, _) = run(&mut function);
        assert!(!changed);
    }

    #[test]
    fn test_skip_key() {
        let mut function = FunctionBuilder::two_fill_loops("f", false);
        function.body.add_skip("loop_fusion");
        assert!(!LoopFusionPass::new().should_run(&function, &CompilerContext::new()));
    }

    #[test]
    fn test_describe_first_loop_records_build() {
        let function = FunctionBuilder::two_fill_loops("f", false);
        let header = function
            .body
            .block(BlockId::ENTRY)
            .unwrap()
            .ending_instruction()
            .and_then(Instruction::as_for)
            .unwrap()
            .clone();
        let nest =
            describe_first_loop(&function.body, &function.types, &header, BlockId::ENTRY).unwrap();

        assert_eq!(nest.depth(), 1);
        assert!(nest.read_matrices.contains("A"));
        let built = nest
            .built
            .values()
            .find(|p| p.built.is_some())
            .unwrap();
        assert_eq!(built.indices, vec![AccessIndex::Iter(0)]);
    }

    #[test]
    fn test_flat_loop_moves_into_nest() {
        let mut function = FunctionBuilder::nest_then_flat("f");
        function
            .body
            .add_properties(FunctionProperties::ASSUME_MATRIX_SIZES_MATCH);
        assert_eq!(loop_count(&function), 3);

        let (changed, ctx) = run(&mut function);
        assert!(changed);
        assert_eq!(ctx.events.count_kind(EventKind::LoopFused), 1);
        assert_eq!(loop_count(&function), 2);
        validate(&function.body).unwrap();

        // The flat read now uses both subscripts, first subscript innermost.
        let get = function
            .body
            .iter_instructions()
            .find_map(|(_, i)| match i {
                Instruction::SimpleGet {
                    output,
                    matrix,
                    indices,
                } if output == "w" => Some((matrix.clone(), indices.clone())),
                _ => None,
            })
            .unwrap();
        assert_eq!(get.0, "X$4");
        assert_eq!(get.1, ["j", "i"]);
    }

    /// `X(write) = i` over `1:n`, then `Y(j) = X(read)` over `1:n`.
    ///
    /// `ip`/`jp` are `i + 1`/`j + 1`; `k` is a loop-invariant argument.
    fn producer_consumer(write: &str, read: &str) -> TypedFunction {
        let mut f = FunctionBuilder::new("f");
        let first = f.new_block();
        let middle = f.new_block();
        let second = f.new_block();
        let end = f.new_block();
        let entry = BlockId::ENTRY;

        for var in ["one", "n", "k", "i", "j", "ip", "jp"] {
            f.typed(var, VariableType::int());
        }
        f.typed("b", VariableType::double());
        for var in ["X$1", "X$2", "X$3", "X$4", "Y$1", "Y$2", "Y$3", "Y$4"] {
            f.typed(var, VariableType::double_matrix(TypeShape::with_ndims(2)));
        }

        f.argument("A", VariableType::double_matrix(TypeShape::with_ndims(2)))
            .argument("k", VariableType::int())
            .push(Instruction::assign_integer("one", 1))
            .call("n", "numel", &["A"])
            .call("X$1", "matisse_new_array_from_matrix", &["A"])
            .call("Y$1", "matisse_new_array_from_matrix", &["A"])
            .for_loop("one", "one", "n", first, middle);

        f.at(first)
            .phi("X$2", &[(entry, "X$1"), (first, "X$3")])
            .iter("i")
            .call("ip", "plus", &["i", "one"])
            .set("X$3", "X$2", &[write], "i");

        f.at(middle)
            .phi("X$4", &[(entry, "X$1"), (first, "X$3")])
            .for_loop("one", "one", "n", second, end);

        f.at(second)
            .phi("Y$2", &[(middle, "Y$1"), (second, "Y$3")])
            .iter("j")
            .call("jp", "plus", &["j", "one"])
            .get("b", "X$4", &[read])
            .set("Y$3", "Y$2", &["j"], "b");

        f.at(end)
            .phi("Y$4", &[(middle, "Y$1"), (second, "Y$3")])
            .effect("disp", &["X$4"])
            .effect("disp", &["Y$4"]);

        f.build()
    }

    #[test]
    fn test_same_element_read_is_fused() {
        let mut function = producer_consumer("i", "j");
        let (changed, _) = run(&mut function);
        assert!(changed);
        assert_eq!(loop_count(&function), 1);
        validate(&function.body).unwrap();
    }

    #[test]
    fn test_loop_invariant_write_is_not_fused() {
        // X(k) holds n only after the first loop completes.
        let mut function = producer_consumer("k", "k");
        let (changed, ctx) = run(&mut function);
        assert!(!changed);
        assert_eq!(loop_count(&function), 2);
        assert_eq!(ctx.events.count_kind(EventKind::FusionRejected), 1);
    }

    #[test]
    fn test_offset_write_is_not_fused() {
        let mut function = producer_consumer("ip", "jp");
        let (changed, _) = run(&mut function);
        assert!(!changed);
        assert_eq!(loop_count(&function), 2);
    }

    #[test]
    fn test_read_ahead_of_write_is_not_fused() {
        // Iteration j would read X(j + 1) before the first body wrote it.
        let mut function = producer_consumer("i", "jp");
        let (changed, ctx) = run(&mut function);
        assert!(!changed);
        assert_eq!(loop_count(&function), 2);
        assert!(ctx.events.has(EventKind::FusionRejected));
    }

    #[test]
    fn test_variable_index_read_is_not_fused() {
        let mut function = producer_consumer("i", "k");
        let (changed, _) = run(&mut function);
        assert!(!changed);
        assert_eq!(loop_count(&function), 2);
    }

    #[test]
    fn test_distinct_element_writes() {
        let pattern = |indices: Vec<AccessIndex>| MatrixAccessPattern {
            source: "X$1".into(),
            built: Some("X$3".into()),
            set_matrix: Some("X$3".into()),
            indices,
        };
        assert!(pattern(vec![AccessIndex::Iter(0)]).writes_distinct_elements(1));
        assert!(pattern(vec![AccessIndex::Iter(1), AccessIndex::Iter(0)])
            .writes_distinct_elements(2));
        assert!(!pattern(vec![AccessIndex::Iter(0)]).writes_distinct_elements(2));
        assert!(!pattern(vec![AccessIndex::Variable("k".into())]).writes_distinct_elements(1));
    }

    #[test]
    fn test_sizes_are_rebuilt_after_fusion() {
        let mut function = FunctionBuilder::two_fill_loops("f", false);
        let mut cache = AnalysisCache::new();
        let ctx = CompilerContext::new();
        assert!(LoopFusionPass::new()
            .run_on_function(&mut function, &mut cache, &ctx)
            .unwrap());

        // The second loop's `j` was renamed to `i`.
        let sizes = cache.size_groups(&function.body, &function.types);
        assert!(sizes.is_known_less_or_equal("i", "n"));
        assert!(!sizes.is_known_less_or_equal("j", "n"));
    }

    #[test]
    fn test_suggested_name() {
        assert_eq!(suggested_name("X$3"), "X");
        assert_eq!(suggested_name("$range$2"), "range");
        assert_eq!(suggested_name("$$"), "matrix");
    }
}
