//! Loop interchange pass.
//!
//! Reorders the headers of a perfectly nested chain of counted loops so that
//! the loop whose iteration variable indexes the fastest-varying subscript
//! of the nest's accesses becomes the innermost one.
//!
//! ```text
//! for i = 1:n              for j = 1:m
//!   for j = 1:m      =>      for i = 1:n
//!     X(j, i) = A(j, i)        X(j, i) = A(j, i)
//! ```
//!
//! Only the headers and the `iter` instructions change: every level keeps
//! its blocks and phis, and the header a level now runs is the one whose
//! iteration variable its `iter` defines. Instructions between the loops
//! that do not depend on loop-carried values are moved into the innermost
//! body first, so they are recomputed under the new order.
//!
//! The access order is delegated to an [`InterchangeFormat`].

use std::collections::{HashMap, HashSet, VecDeque};

use crate::{
    analysis::{
        analyze_standard_loop,
        ssa::utils::{
            contained_blocks, has_nested_side_effects, is_simple_section,
            variables_declared_in_region,
        },
        BlockId, ForLoop, FunctionBody, FunctionProperties, Instruction, LoopVariable,
        TypeProvider, VariableTypes,
    },
    compiler::{
        cache::{AnalysisCache, AnalysisSet},
        config::InterchangeFormatKind,
        context::CompilerContext,
        events::EventKind,
        pass::SsaPass,
        services::TypedFunction,
    },
    Result,
};

/// Orders the iteration variables of a nest by how fast they vary in its
/// accesses.
pub trait InterchangeFormat: Send + Sync {
    /// Short identifier used in diagnostics.
    fn name(&self) -> &'static str;

    /// Iteration variables from fastest-varying to slowest.
    ///
    /// Each access is given as its subscripts in source order, each mapped
    /// to the iteration variable it is derived from (`None` if it is not
    /// derived from exactly one). Variables that no access orders may be
    /// left out.
    fn access_order(&self, accesses: &[Vec<Option<String>>]) -> Vec<String>;
}

fn collect_unique<'a>(subscripts: impl Iterator<Item = &'a Option<String>>, order: &mut Vec<String>) {
    for iter in subscripts.flatten() {
        if !order.contains(iter) {
            order.push(iter.clone());
        }
    }
}

/// The last subscript varies fastest.
#[derive(Debug, Default, Clone, Copy)]
pub struct MemoryInterchangeFormat;

impl InterchangeFormat for MemoryInterchangeFormat {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn access_order(&self, accesses: &[Vec<Option<String>>]) -> Vec<String> {
        let mut order = Vec::new();
        for access in accesses {
            collect_unique(access.iter().rev(), &mut order);
        }
        order
    }
}

/// The first subscript varies fastest, as in column-major storage.
#[derive(Debug, Default, Clone, Copy)]
pub struct ColumnMajorInterchangeFormat;

impl InterchangeFormat for ColumnMajorInterchangeFormat {
    fn name(&self) -> &'static str {
        "column_major"
    }

    fn access_order(&self, accesses: &[Vec<Option<String>>]) -> Vec<String> {
        let mut order = Vec::new();
        for access in accesses {
            collect_unique(access.iter(), &mut order);
        }
        order
    }
}

/// A legal reordering of one nest.
#[derive(Debug, Clone)]
struct InterchangePlan {
    /// Blocks ending with the headers, outermost first
    containers: Vec<BlockId>,
    headers: Vec<ForLoop>,
    iters: Vec<String>,
    /// `order[level]` is the index of the header that moves to `level`
    order: Vec<usize>,
    /// Outputs of intermediate instructions to move into the innermost body
    moved: HashSet<String>,
}

impl InterchangePlan {
    fn proposed_iters(&self) -> Vec<&str> {
        self.order.iter().map(|i| self.iters[*i].as_str()).collect()
    }
}

/// Finds nests of `for` loops where each inner loop ends its parent's body
/// and is followed only by straight-line code.
fn collect_nests(
    body: &FunctionBody,
    block: BlockId,
    parent: &[BlockId],
    nests: &mut Vec<Vec<BlockId>>,
) {
    let Some(ending) = body.block(block).and_then(|b| b.ending_instruction()) else {
        return;
    };

    if let Instruction::For(header) = ending {
        let perfectly_nested = body
            .block(header.end_block)
            .is_some_and(|b| !b.has_ending_instruction());
        if perfectly_nested {
            let mut address = parent.to_vec();
            address.push(block);
            nests.push(address.clone());
            collect_nests(body, header.loop_block, &address, nests);
        } else {
            nests.push(vec![block]);
            collect_nests(body, header.loop_block, &[block], nests);
            collect_nests(body, header.end_block, &[], nests);
        }
        return;
    }

    for owned in ending.owned_blocks() {
        collect_nests(body, owned, &[], nests);
    }
}

fn header(body: &FunctionBody, container: BlockId) -> Option<&ForLoop> {
    body.block(container)?.ending_instruction()?.as_for()
}

/// Nests at least two deep whose innermost body can be reordered.
fn candidate_nests(body: &FunctionBody) -> Vec<Vec<BlockId>> {
    let mut nests = Vec::new();
    collect_nests(body, BlockId::ENTRY, &[], &mut nests);

    let mut invalid = HashSet::new();
    nests.retain(|nest| {
        let Some(&innermost) = nest.last() else {
            return false;
        };
        let valid = header(body, innermost).is_some_and(|h| {
            !has_nested_side_effects(body, h.loop_block) && is_simple_section(body, h.loop_block)
        });
        if !valid {
            invalid.insert(innermost);
        }
        valid
    });

    for nest in &mut nests {
        let outer = &nest[..nest.len() - 1];
        if let Some(cut) = outer.iter().rposition(|c| invalid.contains(c)) {
            nest.drain(..=cut);
        }
    }
    nests.retain(|nest| nest.len() >= 2);
    nests
}

fn is_known_positive_integer(types: &dyn TypeProvider, name: &str) -> bool {
    types
        .constant(name)
        .is_some_and(|c| c > 0.0 && c.fract() == 0.0)
}

fn first_iter(body: &FunctionBody, block: BlockId) -> Option<&str> {
    body.block(block)?.instructions().iter().find_map(|i| match i {
        Instruction::Iter { output } => Some(output.as_str()),
        _ => None,
    })
}

/// Blocks of a body region reached through `Branch` joins, arms excluded.
fn straight_blocks(body: &FunctionBody, start: BlockId) -> Vec<BlockId> {
    let mut blocks = vec![start];
    let mut current = start;
    while let Some(Instruction::Branch { end_block, .. }) =
        body.block(current).and_then(|b| b.ending_instruction())
    {
        current = *end_block;
        blocks.push(current);
    }
    blocks
}

/// Records which iteration variable each value of `block` is derived from.
///
/// Values computed inside branch arms are marked as derived from no single
/// variable. Accesses inside branch arms are not supported.
fn derive_indices(
    body: &FunctionBody,
    block: BlockId,
    derived: &mut HashMap<String, Option<String>>,
) -> std::result::Result<(), &'static str> {
    for current in straight_blocks(body, block) {
        let Some(instructions) = body.block(current).map(|b| b.instructions()) else {
            return Err("missing block");
        };
        for instruction in instructions {
            let mut sources: Vec<Option<String>> = Vec::new();
            for input in instruction.inputs() {
                if let Some(source) = derived.get(input) {
                    if !sources.contains(source) {
                        sources.push(source.clone());
                    }
                }
            }
            if !sources.is_empty() {
                let source = if sources.len() == 1 {
                    sources.swap_remove(0)
                } else {
                    None
                };
                if let Some(output) = instruction.outputs().first() {
                    derived.insert((*output).to_string(), source);
                }
            }

            if let Instruction::Branch {
                condition,
                true_block,
                false_block,
                ..
            } = instruction
            {
                let mark_all = derived.contains_key(condition);
                for arm in [*true_block, *false_block] {
                    for inner in contained_blocks(body, arm) {
                        let Some(block) = body.block(inner) else {
                            continue;
                        };
                        for instruction in block.instructions() {
                            if matches!(
                                instruction,
                                Instruction::SimpleGet { .. }
                                    | Instruction::GetOrFirst { .. }
                                    | Instruction::SimpleSet { .. }
                            ) {
                                return Err("matrix access inside a branch");
                            }
                            if mark_all
                                || instruction.inputs().iter().any(|i| derived.contains_key(*i))
                            {
                                for output in instruction.outputs() {
                                    derived.insert(output.to_string(), None);
                                }
                            }
                        }
                    }
                }
            }
        }
    }
    Ok(())
}

/// `output = minus(source, c)` with `c` a known positive integer.
fn is_strictly_less(types: &dyn TypeProvider, instruction: &Instruction, source: &str) -> bool {
    matches!(
        instruction,
        Instruction::Call { function, inputs, .. }
            if function == "minus"
                && inputs.len() == 2
                && inputs[0] == source
                && is_known_positive_integer(types, &inputs[1])
    )
}

/// Records values that are an iteration variable minus a positive constant.
fn derive_strictly_smaller(
    body: &FunctionBody,
    types: &dyn TypeProvider,
    block: BlockId,
    derived: &HashMap<String, Option<String>>,
    smaller: &mut HashMap<String, String>,
) {
    for current in straight_blocks(body, block) {
        let Some(block) = body.block(current) else {
            continue;
        };
        for instruction in block.instructions() {
            let mut sources: Vec<String> = Vec::new();
            for input in instruction.inputs() {
                if derived.contains_key(input) {
                    let source = smaller.get(input).cloned().unwrap_or_else(|| input.to_string());
                    if !sources.contains(&source) {
                        sources.push(source);
                    }
                }
            }
            if let ([source], Some(output)) = (sources.as_slice(), instruction.outputs().first()) {
                if is_strictly_less(types, instruction, source) {
                    smaller.insert((*output).to_string(), source.clone());
                }
            }
        }
    }
}

#[derive(Debug)]
struct Access {
    matrix: String,
    output: Option<String>,
    indices: Vec<String>,
    write: bool,
}

fn accesses(body: &FunctionBody, block: BlockId) -> Vec<Access> {
    let mut found = Vec::new();
    for current in straight_blocks(body, block) {
        let Some(block) = body.block(current) else {
            continue;
        };
        for instruction in block.instructions() {
            match instruction {
                Instruction::SimpleGet {
                    matrix, indices, ..
                } => found.push(Access {
                    matrix: matrix.clone(),
                    output: None,
                    indices: indices.clone(),
                    write: false,
                }),
                Instruction::GetOrFirst { matrix, index, .. } => found.push(Access {
                    matrix: matrix.clone(),
                    output: None,
                    indices: vec![index.clone()],
                    write: false,
                }),
                Instruction::SimpleSet {
                    output,
                    matrix,
                    indices,
                    ..
                } => found.push(Access {
                    matrix: matrix.clone(),
                    output: Some(output.clone()),
                    indices: indices.clone(),
                    write: true,
                }),
                _ => {}
            }
        }
    }
    found
}

/// Accesses to a matrix carried by the innermost loop must not depend on
/// the iteration order: writes go to the element named by the iteration
/// variables, and reads see that element or one at smaller subscripts.
fn check_carried_accesses(
    body: &FunctionBody,
    innermost: BlockId,
    variables: &[LoopVariable],
    iters: &[String],
    found: &[Access],
    smaller: &HashMap<String, String>,
) -> std::result::Result<(), &'static str> {
    let mut versions: HashSet<&str> = variables.iter().map(|v| v.loop_start.as_str()).collect();
    let mut written: Vec<&[String]> = Vec::new();
    for access in found.iter().filter(|a| a.write) {
        if !versions.contains(access.matrix.as_str()) {
            continue;
        }
        if !access.indices.iter().all(|i| iters.contains(i)) {
            return Err("carried matrix written at a subscript that is not an iteration variable");
        }
        written.push(&access.indices);
        if let Some(output) = &access.output {
            versions.insert(output);
        }
    }

    for access in found.iter().filter(|a| !a.write) {
        if !versions.contains(access.matrix.as_str()) {
            continue;
        }
        for pattern in &written {
            let ordered = pattern.len() == access.indices.len()
                && pattern.iter().zip(&access.indices).all(|(write, read)| {
                    write == read || smaller.get(read).is_some_and(|s| s == write)
                });
            if !ordered {
                return Err("carried matrix read at an element of a later iteration");
            }
        }
    }

    for current in straight_blocks(body, innermost) {
        let Some(block) = body.block(current) else {
            continue;
        };
        for instruction in block.instructions() {
            let is_access = matches!(
                instruction,
                Instruction::Phi(_)
                    | Instruction::SimpleGet { .. }
                    | Instruction::GetOrFirst { .. }
                    | Instruction::SimpleSet { .. }
            ) || matches!(instruction.called_function(), Some("numel" | "size"));
            if !is_access && instruction.inputs().iter().any(|i| versions.contains(*i)) {
                return Err("carried matrix used as a whole");
            }
        }
    }

    Ok(())
}

/// Loop interchange pass.
pub struct LoopInterchangePass {
    format: Box<dyn InterchangeFormat>,
}

impl Default for LoopInterchangePass {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopInterchangePass {
    /// Creates a loop interchange pass using [`MemoryInterchangeFormat`].
    #[must_use]
    pub fn new() -> Self {
        Self::with_format(Box::new(MemoryInterchangeFormat))
    }

    /// Creates a loop interchange pass for a configured format.
    #[must_use]
    pub fn from_kind(kind: InterchangeFormatKind) -> Self {
        match kind {
            InterchangeFormatKind::Memory => Self::new(),
            InterchangeFormatKind::ColumnMajor => {
                Self::with_format(Box::new(ColumnMajorInterchangeFormat))
            }
        }
    }

    /// Creates a loop interchange pass with a custom format.
    #[must_use]
    pub fn with_format(format: Box<dyn InterchangeFormat>) -> Self {
        Self { format }
    }

    /// Decides whether the nest ending `containers` can be reordered.
    ///
    /// Returns `Ok(None)` if it already has the preferred order.
    fn plan(
        body: &FunctionBody,
        types: &VariableTypes,
        format: &dyn InterchangeFormat,
        containers: &[BlockId],
    ) -> std::result::Result<Option<InterchangePlan>, &'static str> {
        let headers: Vec<ForLoop> = containers
            .iter()
            .map(|c| header(body, *c).cloned())
            .collect::<Option<_>>()
            .ok_or("nest level does not end with a for")?;
        if headers
            .iter()
            .any(|h| !is_known_positive_integer(types, &h.interval))
        {
            return Err("interval is not a known positive constant");
        }

        let mut levels: Vec<Vec<LoopVariable>> = Vec::new();
        for container in containers {
            let variables =
                analyze_standard_loop(body, *container, None).ok_or("loop is not standard")?;
            if variables.is_empty() {
                return Err("loop carries no values");
            }
            if variables.iter().any(|v| v.after_loop.is_none()) {
                return Err("loop value is not merged after the loop");
            }
            levels.push(variables);
        }

        // Every level must thread the values of its parent straight through.
        let mut innermost_variables = levels[0].clone();
        for level in &levels[1..] {
            if level.len() != innermost_variables.len() {
                return Err("nest levels carry different values");
            }
            innermost_variables = innermost_variables
                .iter()
                .map(|outer| {
                    level
                        .iter()
                        .find(|v| {
                            v.before_loop == outer.loop_start
                                && v.after_loop.as_deref() == Some(outer.loop_end.as_str())
                        })
                        .cloned()
                })
                .collect::<Option<_>>()
                .ok_or("inner loop does not thread an outer value")?;
        }

        let iters: Vec<String> = headers
            .iter()
            .map(|h| first_iter(body, h.loop_block).map(str::to_string))
            .collect::<Option<_>>()
            .ok_or("loop without iteration variable")?;

        let innermost = headers[headers.len() - 1].loop_block;
        if contained_blocks(body, innermost).iter().any(|b| {
            body.block(*b)
                .and_then(|b| b.ending_instruction())
                .is_some_and(|i| matches!(i, Instruction::For(_) | Instruction::While { .. }))
        }) {
            return Err("innermost body contains a loop");
        }

        let (moved, blacklist, between) = Self::intermediate_values(body, &headers);
        if iters.iter().any(|i| blacklist.contains(i)) {
            return Err("iteration variable used outside the innermost loop");
        }
        if iters.iter().any(|i| between.contains(i)) {
            return Err("iteration variable used between loops");
        }
        if headers
            .iter()
            .flat_map(|h| [&h.start, &h.interval, &h.end])
            .any(|v| blacklist.contains(v))
        {
            return Err("loop bounds depend on a value computed inside the nest");
        }

        let mut derived: HashMap<String, Option<String>> =
            iters.iter().map(|i| (i.clone(), Some(i.clone()))).collect();
        for h in &headers {
            derive_indices(body, h.loop_block, &mut derived)?;
        }
        let mut smaller: HashMap<String, String> = HashMap::new();
        for h in &headers {
            derive_strictly_smaller(body, types, h.loop_block, &derived, &mut smaller);
        }

        let found = accesses(body, innermost);
        check_carried_accesses(body, innermost, &innermost_variables, &iters, &found, &smaller)?;

        let subscripts: Vec<Vec<Option<String>>> = found
            .iter()
            .map(|access| {
                access
                    .indices
                    .iter()
                    .map(|index| derived.get(index).cloned().flatten())
                    .collect()
            })
            .collect();
        let mut proposal: Vec<String> = format
            .access_order(&subscripts)
            .into_iter()
            .filter(|i| iters.contains(i))
            .collect();
        proposal.reverse();

        if proposal.len() != iters.len() {
            return Err("accesses do not order every iteration variable");
        }
        if proposal == iters {
            return Ok(None);
        }

        let order = proposal
            .iter()
            .map(|p| iters.iter().position(|i| i == p))
            .collect::<Option<Vec<usize>>>()
            .ok_or("proposal names an unknown iteration variable")?;

        Ok(Some(InterchangePlan {
            containers: containers.to_vec(),
            headers,
            iters,
            order,
            moved,
        }))
    }

    /// Splits the values computed between the loops of a nest.
    ///
    /// Returns the outputs that can move into the innermost body, the values
    /// that must stay where they are, and the values read after an inner loop.
    fn intermediate_values(
        body: &FunctionBody,
        headers: &[ForLoop],
    ) -> (HashSet<String>, HashSet<String>, HashSet<String>) {
        let mut blacklist: HashSet<String> = HashSet::new();
        let mut pinned_inputs: Vec<String> = Vec::new();
        let mut between: HashSet<String> = HashSet::new();
        let mut candidates: HashMap<String, &Instruction> = HashMap::new();

        for h in &headers[..headers.len() - 1] {
            if let Some(block) = body.block(h.loop_block) {
                for instruction in block.instructions() {
                    let movable = !matches!(
                        instruction,
                        Instruction::Phi(_) | Instruction::Iter { .. } | Instruction::For(_)
                    ) && !instruction.has_side_effects();
                    if movable {
                        for output in instruction.outputs() {
                            candidates.insert(output.to_string(), instruction);
                        }
                    } else {
                        let inputs = instruction.inputs().into_iter().map(str::to_string);
                        pinned_inputs.extend(inputs.clone());
                        blacklist.extend(inputs);
                    }
                }
            }

            if let Some(block) = body.block(body.block_end(h.loop_block)) {
                for instruction in block.instructions() {
                    between.extend(instruction.inputs().into_iter().map(str::to_string));
                    blacklist.extend(instruction.outputs().into_iter().map(str::to_string));
                }
            }
        }

        let declared = variables_declared_in_region(body, headers[0].loop_block);
        blacklist.retain(|v| declared.contains(v));

        let mut pending: VecDeque<String> = between.iter().cloned().chain(pinned_inputs).collect();
        while let Some(variable) = pending.pop_front() {
            if let Some(instruction) = candidates.remove(&variable) {
                for output in instruction.outputs() {
                    candidates.remove(output);
                }
                pending.extend(instruction.inputs().into_iter().map(str::to_string));
            }
        }

        (candidates.into_keys().collect(), blacklist, between)
    }

    fn apply(body: &mut FunctionBody, plan: &InterchangePlan) -> Result<()> {
        let innermost = plan.headers[plan.headers.len() - 1].loop_block;

        let mut extracted = Vec::new();
        for h in &plan.headers {
            let instructions = body.try_block_mut(h.loop_block)?.instructions_mut();
            let (moving, staying): (Vec<Instruction>, Vec<Instruction>) =
                std::mem::take(instructions).into_iter().partition(|i| {
                    i.outputs().iter().any(|o| plan.moved.contains(*o))
                });
            *instructions = staying;
            extracted.extend(moving);
        }

        let block = body.try_block_mut(innermost)?;
        if let Some(position) = block
            .instructions()
            .iter()
            .position(|i| matches!(i, Instruction::Iter { .. }))
        {
            let iter = block.remove_instruction(position);
            extracted.insert(0, iter);
        }
        let at = block.after_phi_insertion_point();
        block.insert_instructions(at, extracted);

        for (level, &source) in plan.order.iter().enumerate() {
            if source == level {
                continue;
            }
            let moved = &plan.headers[source];
            let block = body.try_block_mut(plan.containers[level])?;
            let Some(Instruction::For(header)) = block.ending_instruction_mut() else {
                return Err(malformed_error!(
                    "block {} no longer ends with a for",
                    plan.containers[level]
                ));
            };
            header.start = moved.start.clone();
            header.interval = moved.interval.clone();
            header.end = moved.end.clone();
            header.properties = moved.properties.clone();

            let loop_block = header.loop_block;
            let iter = body
                .try_block_mut(loop_block)?
                .instructions_mut()
                .iter_mut()
                .find_map(|i| match i {
                    Instruction::Iter { output } => Some(output),
                    _ => None,
                })
                .ok_or_else(|| malformed_error!("loop block {} lost its iter", loop_block))?;
            *iter = plan.iters[source].clone();
        }

        Ok(())
    }
}

impl SsaPass for LoopInterchangePass {
    fn name(&self) -> &'static str {
        "loop_interchange"
    }

    fn should_run(&self, function: &TypedFunction, _ctx: &CompilerContext) -> bool {
        !function.body.should_skip(self.name())
    }

    fn run_on_function(
        &self,
        function: &mut TypedFunction,
        _cache: &mut AnalysisCache,
        ctx: &CompilerContext,
    ) -> Result<bool> {
        let format: &dyn InterchangeFormat =
            if function.body.has_property(FunctionProperties::PREFER_COLUMN_MAJOR) {
                &ColumnMajorInterchangeFormat
            } else {
                self.format.as_ref()
            };

        let mut changed = false;
        // Each round settles one nest; the bound only guards formats that
        // contradict themselves.
        for _ in 0..=function.body.block_count() {
            let mut rejections = Vec::new();
            let mut applied = None;

            'nests: for nest in candidate_nests(&function.body) {
                for start in (0..nest.len() - 1).rev() {
                    match Self::plan(&function.body, &function.types, format, &nest[start..]) {
                        Ok(Some(plan)) => {
                            applied = Some(plan);
                            break 'nests;
                        }
                        Ok(None) => {}
                        Err(reason) => rejections.push((nest[start], reason)),
                    }
                }
            }

            let Some(plan) = applied else {
                for (container, reason) in rejections {
                    ctx.events
                        .record(EventKind::InterchangeRejected)
                        .at(function.body.name(), container.index())
                        .pass(self.name())
                        .message(reason);
                }
                break;
            };

            Self::apply(&mut function.body, &plan)?;
            ctx.events
                .record(EventKind::LoopInterchanged)
                .at(function.body.name(), plan.containers[0].index())
                .pass(self.name())
                .message(format!(
                    "{} order {:?} -> {:?}",
                    format.name(),
                    plan.iters,
                    plan.proposed_iters()
                ));
            changed = true;
        }

        Ok(changed)
    }

    fn invalidates(&self) -> AnalysisSet {
        AnalysisSet::ALL
    }

    fn description(&self) -> &'static str {
        "Reorders nested loops to follow the access order"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{analysis::validate, testing::FunctionBuilder};

    fn run(pass: &LoopInterchangePass, function: &mut TypedFunction) -> (bool, CompilerContext) {
        let ctx = CompilerContext::new();
        let changed = pass
            .run_on_function(function, &mut AnalysisCache::new(), &ctx)
            .unwrap();
        (changed, ctx)
    }

    fn outer_header(function: &TypedFunction) -> ForLoop {
        header(&function.body, BlockId::ENTRY).unwrap().clone()
    }

    #[test]
    fn test_formats() {
        let access = vec![vec![Some("j".to_string()), Some("i".to_string())]];
        assert_eq!(MemoryInterchangeFormat.access_order(&access), ["i", "j"]);
        assert_eq!(ColumnMajorInterchangeFormat.access_order(&access), ["j", "i"]);

        let mixed = vec![vec![None, Some("i".to_string())], vec![Some("i".to_string())]];
        assert_eq!(MemoryInterchangeFormat.access_order(&mixed), ["i"]);
    }

    #[test]
    fn test_candidate_nests() {
        let function = FunctionBuilder::transposed_copy("f", false);
        let nests = candidate_nests(&function.body);
        assert_eq!(nests.len(), 1);
        assert_eq!(nests[0].len(), 2);
        assert_eq!(nests[0][0], BlockId::ENTRY);
    }

    #[test]
    fn test_last_subscript_becomes_innermost() {
        let mut function = FunctionBuilder::transposed_copy("f", false);
        assert_eq!(outer_header(&function).end, "n");

        let (changed, ctx) = run(&LoopInterchangePass::new(), &mut function);
        assert!(changed);
        assert_eq!(ctx.events.count_kind(EventKind::LoopInterchanged), 1);
        validate(&function.body).unwrap();

        let outer = outer_header(&function);
        assert_eq!(outer.end, "m");
        assert_eq!(first_iter(&function.body, outer.loop_block), Some("j"));
        let inner = header(&function.body, outer.loop_block).unwrap();
        assert_eq!(inner.end, "n");
        assert_eq!(first_iter(&function.body, inner.loop_block), Some("i"));

        // Already in the preferred order.
        let (changed, ctx) = run(&LoopInterchangePass::new(), &mut function);
        assert!(!changed);
        assert!(ctx.events.is_empty());
    }

    #[test]
    fn test_interchange_invalidates_sizes() {
        let mut function = FunctionBuilder::transposed_copy("f", false);
        let mut cache = AnalysisCache::new();
        cache.size_groups(&function.body, &function.types);

        let pass = LoopInterchangePass::new();
        assert!(pass
            .run_on_function(&mut function, &mut cache, &CompilerContext::new())
            .unwrap());
        cache.invalidate(pass.invalidates());
        assert!(!cache.valid().contains(AnalysisSet::SIZE_GROUPS));

        let builds = cache.builds();
        let sizes = cache.size_groups(&function.body, &function.types);
        assert!(sizes.is_known_less_or_equal("j", "m"));
        assert!(sizes.is_known_less_or_equal("i", "n"));
        assert_eq!(cache.builds(), builds + 1);
    }

    #[test]
    fn test_column_major_keeps_order() {
        let mut function = FunctionBuilder::transposed_copy("f", false);
        let pass = LoopInterchangePass::from_kind(InterchangeFormatKind::ColumnMajor);
        let (changed, _) = run(&pass, &mut function);
        assert!(!changed);

        let mut function = FunctionBuilder::transposed_copy("f", false);
        function
            .body
            .add_properties(FunctionProperties::PREFER_COLUMN_MAJOR);
        let (changed, _) = run(&LoopInterchangePass::new(), &mut function);
        assert!(!changed);
        assert_eq!(outer_header(&function).end, "n");
    }

    #[test]
    fn test_side_effects_block_interchange() {
        let mut function = FunctionBuilder::transposed_copy("f", true);
        let (changed, _) = run(&LoopInterchangePass::new(), &mut function);
        assert!(!changed);
        assert_eq!(outer_header(&function).end, "n");
    }

    #[test]
    fn test_iter_used_between_loops() {
        let mut function = FunctionBuilder::transposed_copy("f", false);
        let inner_end = header(&function.body, BlockId::new(1)).unwrap().end_block;
        function
            .body
            .block_mut(inner_end)
            .unwrap()
            .add_instruction(Instruction::call("plus", vec!["k".into()], vec!["i".into(), "i".into()]));

        let (changed, ctx) = run(&LoopInterchangePass::new(), &mut function);
        assert!(!changed);
        assert_eq!(ctx.events.count_kind(EventKind::InterchangeRejected), 1);
    }

    #[test]
    fn test_backward_read_is_allowed() {
        let mut function = FunctionBuilder::transposed_copy("f", false);
        let inner = header(&function.body, BlockId::new(1)).unwrap().loop_block;
        let block = function.body.block_mut(inner).unwrap();
        // $p = minus j, one ; read X(p, i) before the write
        block.insert_instruction(
            2,
            Instruction::call("minus", vec!["p".into()], vec!["j".into(), "one".into()]),
        );
        block.insert_instruction(
            3,
            Instruction::SimpleGet {
                output: "b".into(),
                matrix: "X$3".into(),
                indices: vec!["p".into(), "i".into()],
            },
        );
        let (changed, _) = run(&LoopInterchangePass::new(), &mut function);
        assert!(changed);
    }
}
