//! Generic "find one match, rewrite it, rescan" driver.
//!
//! Most elimination passes share the same shape: find the first instruction
//! satisfying a legality predicate, replace it by something cheaper, and
//! repeat until nothing matches. Rewrites routinely split blocks and open
//! loops, which shifts every index a scan could be holding, so the driver
//! simply restarts after each rewrite.
//!
//! A pass implements either [`InstructionRemovalPass`] or
//! [`SizeAwareInstructionRemovalPass`] and is wrapped in a [`RemovalDriver`]
//! or [`SizeAwareRemovalDriver`] to become an [`SsaPass`].
//!
//! # Rewrite contract
//!
//! Before [`eliminate`](InstructionRemovalPass::eliminate) runs, the driver
//! cuts the matched instruction *and everything after it* out of its block.
//! The [`RemovalSite`] hands both back to the pass, so that it can rebuild
//! the remainder of the block inside newly created blocks (typically the
//! end block of a loop it opened) without losing anything.
//!
//! # Termination
//!
//! Each rewrite must make the matched instruction disappear. If an
//! instruction identical to the one just rewritten is still present and
//! still matches, the pass would loop forever; the driver reports
//! [`Error::NonTerminating`] instead.

use crate::{
    analysis::{
        BlockId, FunctionBody, Instruction, InstructionLocation, SizeGroupInformation, UsageMap,
        VariableTypes,
    },
    compiler::{
        cache::{AnalysisCache, AnalysisSet},
        context::CompilerContext,
        editor::BlockEditor,
        events::EventKind,
        pass::SsaPass,
        services::{BuiltinProvider, TypedFunction},
    },
    Error, Result,
};

/// Read-only view of the function handed to legality predicates.
pub struct Facts<'a> {
    /// Function being scanned
    pub body: &'a FunctionBody,
    /// Its variable types
    pub types: &'a VariableTypes,
    /// Usage counts of the current body
    pub usages: &'a UsageMap,
    /// Where the candidate instruction lives
    pub location: InstructionLocation,
}

/// The place a matched instruction was cut from.
pub struct RemovalSite<'a> {
    /// Function being rewritten
    pub body: &'a mut FunctionBody,
    /// Its variable types
    pub types: &'a mut VariableTypes,
    /// Builtin lookup for synthesized calls
    pub builtins: &'a dyn BuiltinProvider,
    /// Block the instruction was cut from
    pub block: BlockId,
    /// Index the instruction had in `block`
    pub index: usize,
    /// The matched instruction
    pub instruction: Instruction,
    /// Instructions that followed it, already removed from `block`
    pub tail: Vec<Instruction>,
    sizes: Option<&'a mut SizeGroupInformation>,
}

impl<'a> RemovalSite<'a> {
    /// Size information, for size-aware passes.
    pub fn sizes(&mut self) -> Option<&mut SizeGroupInformation> {
        self.sizes.as_deref_mut()
    }

    /// Variable types together with the size information.
    ///
    /// Borrows both at once, for queries that need the types while sizes are
    /// being refined.
    pub fn types_and_sizes(&mut self) -> (&VariableTypes, Option<&mut SizeGroupInformation>) {
        (&*self.types, self.sizes.as_deref_mut())
    }

    /// Teaches the size information, if any, the effect of `instruction`.
    pub fn learn(&mut self, instruction: &Instruction) {
        if let Some(sizes) = self.sizes.as_deref_mut() {
            sizes.add_instruction_information(instruction, &*self.types);
        }
    }

    /// Turns the site into an editor positioned where the instruction was.
    ///
    /// Size-aware sites return an editor that teaches the size information
    /// every emitted instruction.
    pub fn into_editor(self) -> (BlockEditor<'a>, Instruction, Vec<Instruction>) {
        let editor = BlockEditor::new(self.body, self.types, self.builtins, self.block);
        let editor = match self.sizes {
            Some(sizes) => editor.with_size_info(sizes),
            None => editor,
        };
        (editor, self.instruction, self.tail)
    }

    /// Drops the instruction and puts the tail back.
    pub fn remove(self) {
        if let Some(block) = self.body.block_mut(self.block) {
            block.add_instructions(self.tail);
        }
    }

    /// Replaces the instruction by `replacement` and puts the tail back.
    pub fn replace(self, replacement: Vec<Instruction>) {
        if let Some(block) = self.body.block_mut(self.block) {
            block.add_instructions(replacement);
            block.add_instructions(self.tail);
        }
    }
}

/// Whether a size-aware rewrite kept the size information current.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeInfoUpdate {
    /// The size information must be rebuilt.
    Invalidated,
    /// Every emitted instruction was taught to the size information.
    Maintained,
}

/// A pattern-driven pass that rewrites one instruction at a time.
pub trait InstructionRemovalPass: Send + Sync {
    /// Short snake_case name, used in events.
    fn name(&self) -> &'static str;

    /// Returns `true` if `instruction` can be rewritten.
    ///
    /// Must not mutate anything; the driver calls it for every instruction.
    fn can_eliminate(&self, instruction: &Instruction, facts: &Facts<'_>) -> bool;

    /// Rewrites the matched instruction.
    ///
    /// # Arguments
    ///
    /// * `site` - The cut instruction, its tail and the function.
    ///
    /// # Errors
    ///
    /// Returns an error if the function is found to be malformed.
    fn eliminate(&self, site: RemovalSite<'_>) -> Result<()>;

    /// Analyses made stale by one rewrite.
    fn invalidates(&self) -> AnalysisSet {
        AnalysisSet::ALL
    }

    /// Kind of event recorded for each rewrite.
    fn event_kind(&self) -> EventKind {
        EventKind::InstructionEliminated
    }

    /// One-line human description.
    fn description(&self) -> &'static str {
        self.name()
    }
}

/// Like [`InstructionRemovalPass`], for passes that consult size groups.
pub trait SizeAwareInstructionRemovalPass: Send + Sync {
    /// Short snake_case name, used in events.
    fn name(&self) -> &'static str;

    /// Returns `true` if `instruction` can be rewritten.
    ///
    /// `sizes` may be queried (queries can mint meta names) but no program
    /// facts may be added to it.
    fn can_eliminate(
        &self,
        instruction: &Instruction,
        facts: &Facts<'_>,
        sizes: &mut SizeGroupInformation,
    ) -> bool;

    /// Rewrites the matched instruction.
    ///
    /// The size information is available through [`RemovalSite::sizes`].
    ///
    /// # Errors
    ///
    /// Returns an error if the function is found to be malformed.
    fn eliminate(&self, site: RemovalSite<'_>) -> Result<SizeInfoUpdate>;

    /// Analyses made stale by one rewrite, including size groups.
    fn invalidates(&self) -> AnalysisSet {
        AnalysisSet::ALL
    }

    /// Kind of event recorded for each rewrite.
    fn event_kind(&self) -> EventKind {
        EventKind::InstructionEliminated
    }

    /// One-line human description.
    fn description(&self) -> &'static str {
        self.name()
    }
}

fn find_match<F>(body: &FunctionBody, mut matches: F) -> Option<InstructionLocation>
where
    F: FnMut(&Instruction, InstructionLocation) -> bool,
{
    body.iter_instructions()
        .find(|(location, instruction)| matches(instruction, *location))
        .map(|(location, _)| location)
}

/// Cuts the instruction at `location` and its tail out of the block.
fn cut(
    body: &mut FunctionBody,
    location: InstructionLocation,
) -> Result<(Instruction, Vec<Instruction>)> {
    let block = body.try_block_mut(location.block)?;
    let mut tail = block.split_off(location.index);
    if tail.is_empty() {
        return Err(malformed_error!(
            "instruction {} vanished from block {}",
            location.index,
            location.block
        ));
    }
    let instruction = tail.remove(0);
    Ok((instruction, tail))
}

fn record(
    ctx: &CompilerContext,
    kind: EventKind,
    pass: &'static str,
    function: &str,
    location: InstructionLocation,
    instruction: &Instruction,
) {
    ctx.events
        .record(kind)
        .at(function, location.block.index())
        .pass(pass)
        .message(format!("{}", instruction));
}

/// Runs an [`InstructionRemovalPass`] to fixpoint.
pub struct RemovalDriver<P> {
    pass: P,
}

impl<P: InstructionRemovalPass> RemovalDriver<P> {
    /// Wraps `pass`.
    pub fn new(pass: P) -> Self {
        RemovalDriver { pass }
    }

    /// The wrapped pass.
    pub fn inner(&self) -> &P {
        &self.pass
    }
}

impl<P: InstructionRemovalPass> SsaPass for RemovalDriver<P> {
    fn name(&self) -> &'static str {
        self.pass.name()
    }

    fn run_on_function(
        &self,
        function: &mut TypedFunction,
        cache: &mut AnalysisCache,
        ctx: &CompilerContext,
    ) -> Result<bool> {
        let mut changed = false;
        loop {
            let location = {
                let usages = cache.usages(&function.body);
                let (body, types) = (&function.body, &function.types);
                find_match(body, |instruction, location| {
                    let facts = Facts {
                        body,
                        types,
                        usages,
                        location,
                    };
                    self.pass.can_eliminate(instruction, &facts)
                })
            };
            let Some(location) = location else {
                break;
            };

            let (instruction, tail) = cut(&mut function.body, location)?;
            record(
                ctx,
                self.pass.event_kind(),
                self.pass.name(),
                function.body.name(),
                location,
                &instruction,
            );
            let matched = instruction.clone();
            self.pass.eliminate(RemovalSite {
                body: &mut function.body,
                types: &mut function.types,
                builtins: ctx.builtins(),
                block: location.block,
                index: location.index,
                instruction,
                tail,
                sizes: None,
            })?;
            cache.invalidate(self.pass.invalidates());
            changed = true;

            let usages = cache.usages(&function.body);
            let (body, types) = (&function.body, &function.types);
            let repeated = find_match(body, |instruction, location| {
                *instruction == matched
                    && self.pass.can_eliminate(
                        instruction,
                        &Facts {
                            body,
                            types,
                            usages,
                            location,
                        },
                    )
            });
            if repeated.is_some() {
                return Err(Error::NonTerminating(self.pass.name()));
            }
        }
        Ok(changed)
    }

    fn invalidates(&self) -> AnalysisSet {
        self.pass.invalidates()
    }

    fn description(&self) -> &'static str {
        self.pass.description()
    }
}

/// Runs a [`SizeAwareInstructionRemovalPass`] to fixpoint.
pub struct SizeAwareRemovalDriver<P> {
    pass: P,
}

impl<P: SizeAwareInstructionRemovalPass> SizeAwareRemovalDriver<P> {
    /// Wraps `pass`.
    pub fn new(pass: P) -> Self {
        SizeAwareRemovalDriver { pass }
    }

    /// The wrapped pass.
    pub fn inner(&self) -> &P {
        &self.pass
    }

    fn scan(
        &self,
        function: &TypedFunction,
        cache: &mut AnalysisCache,
        only: Option<&Instruction>,
    ) -> Option<InstructionLocation> {
        // Both analyses come from the cache; the usage map is a snapshot.
        let usages = cache.usages(&function.body).clone();
        let sizes = cache.size_groups(&function.body, &function.types);
        let (body, types) = (&function.body, &function.types);
        find_match(body, |instruction, location| {
            if only.is_some_and(|only| only != instruction) {
                return false;
            }
            let facts = Facts {
                body,
                types,
                usages: &usages,
                location,
            };
            self.pass.can_eliminate(instruction, &facts, sizes)
        })
    }
}

impl<P: SizeAwareInstructionRemovalPass> SsaPass for SizeAwareRemovalDriver<P> {
    fn name(&self) -> &'static str {
        self.pass.name()
    }

    fn run_on_function(
        &self,
        function: &mut TypedFunction,
        cache: &mut AnalysisCache,
        ctx: &CompilerContext,
    ) -> Result<bool> {
        let mut changed = false;
        while let Some(location) = self.scan(function, cache, None) {
            let (instruction, tail) = cut(&mut function.body, location)?;
            record(
                ctx,
                self.pass.event_kind(),
                self.pass.name(),
                function.body.name(),
                location,
                &instruction,
            );
            let matched = instruction.clone();

            let sizes = cache.size_groups(&function.body, &function.types);
            let update = self.pass.eliminate(RemovalSite {
                body: &mut function.body,
                types: &mut function.types,
                builtins: ctx.builtins(),
                block: location.block,
                index: location.index,
                instruction,
                tail,
                sizes: Some(sizes),
            })?;
            match update {
                SizeInfoUpdate::Invalidated => cache.invalidate(self.pass.invalidates()),
                SizeInfoUpdate::Maintained => {
                    cache.invalidate(self.pass.invalidates() - AnalysisSet::SIZE_GROUPS);
                }
            }
            changed = true;

            if self.scan(function, cache, Some(&matched)).is_some() {
                return Err(Error::NonTerminating(self.pass.name()));
            }
        }
        Ok(changed)
    }

    fn invalidates(&self) -> AnalysisSet {
        self.pass.invalidates()
    }

    fn description(&self) -> &'static str {
        self.pass.description()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::{TypeProvider, TypeShape, VariableType};

    /// Rewrites `x = 7` into `x = 8`.
    struct Bump;

    impl InstructionRemovalPass for Bump {
        fn name(&self) -> &'static str {
            "bump"
        }

        fn can_eliminate(&self, instruction: &Instruction, _facts: &Facts<'_>) -> bool {
            *instruction == Instruction::assign_integer("x", 7)
        }

        fn eliminate(&self, site: RemovalSite<'_>) -> Result<()> {
            site.replace(vec![Instruction::assign_integer("x", 8)]);
            Ok(())
        }
    }

    /// Claims to rewrite but puts the instruction back.
    struct Stuck;

    impl InstructionRemovalPass for Stuck {
        fn name(&self) -> &'static str {
            "stuck"
        }

        fn can_eliminate(&self, instruction: &Instruction, _facts: &Facts<'_>) -> bool {
            matches!(instruction, Instruction::Assignment { .. })
        }

        fn eliminate(&self, site: RemovalSite<'_>) -> Result<()> {
            let instruction = site.instruction.clone();
            site.replace(vec![instruction]);
            Ok(())
        }
    }

    /// Wraps every `numel` call in a one-iteration loop.
    struct Wrap;

    impl SizeAwareInstructionRemovalPass for Wrap {
        fn name(&self) -> &'static str {
            "wrap"
        }

        fn can_eliminate(
            &self,
            instruction: &Instruction,
            _facts: &Facts<'_>,
            _sizes: &mut SizeGroupInformation,
        ) -> bool {
            instruction.called_function() == Some("numel")
        }

        fn eliminate(&self, site: RemovalSite<'_>) -> Result<SizeInfoUpdate> {
            let (mut editor, instruction, tail) = site.into_editor();
            let Instruction::Call {
                outputs, inputs, ..
            } = instruction
            else {
                return Err(malformed_error!("expected a call"));
            };
            let one = editor.add_make_integer("one", 1);
            let handles = editor.make_for_loop(&one, &one, &one);
            editor.set_block(handles.end_block);
            editor.add_call_to("length", outputs, inputs)?;
            editor.append_tail(tail);
            Ok(SizeInfoUpdate::Maintained)
        }
    }

    fn function() -> TypedFunction {
        let mut body = FunctionBody::new("f");
        let entry = body.block_mut(BlockId::ENTRY).unwrap();
        entry.add_instruction(Instruction::Argument {
            output: "a".into(),
            index: 0,
        });
        entry.add_instruction(Instruction::assign_integer("x", 7));
        entry.add_instruction(Instruction::call("numel", vec!["n".into()], vec!["a".into()]));
        entry.add_instruction(Instruction::assign_variable("y", "n"));
        let mut types = VariableTypes::new();
        types.add_variable("a", VariableType::double_matrix(TypeShape::unknown()));
        types.add_variable("x", VariableType::int_constant(7));
        types.add_variable("n", VariableType::int());
        types.add_variable("y", VariableType::int());
        TypedFunction::new(body, types)
    }

    #[test]
    fn test_rewrite_keeps_tail() {
        let ctx = CompilerContext::new();
        let mut function = function();
        let mut cache = AnalysisCache::new();
        let driver = RemovalDriver::new(Bump);

        assert!(driver.run_on_function(&mut function, &mut cache, &ctx).unwrap());
        let entry = function.body.block(BlockId::ENTRY).unwrap();
        assert_eq!(entry.len(), 4);
        assert_eq!(entry.instructions()[1], Instruction::assign_integer("x", 8));
        assert_eq!(ctx.events.count_kind(EventKind::InstructionEliminated), 1);

        assert!(!driver.run_on_function(&mut function, &mut cache, &ctx).unwrap());
    }

    #[test]
    fn test_non_terminating_rewrite_is_reported() {
        let ctx = CompilerContext::new();
        let mut function = function();
        let mut cache = AnalysisCache::new();
        let result = RemovalDriver::new(Stuck).run_on_function(&mut function, &mut cache, &ctx);
        assert!(matches!(result, Err(Error::NonTerminating("stuck"))));
    }

    #[test]
    fn test_size_aware_rewrite_splits_block() {
        let ctx = CompilerContext::new();
        let mut function = function();
        let mut cache = AnalysisCache::new();
        let driver = SizeAwareRemovalDriver::new(Wrap);

        assert!(driver.run_on_function(&mut function, &mut cache, &ctx).unwrap());
        assert_eq!(function.body.block_count(), 3);
        crate::analysis::validate(&function.body).unwrap();

        let end = function.body.block(BlockId::new(2)).unwrap();
        assert_eq!(end.instructions()[0].called_function(), Some("length"));
        assert_eq!(end.instructions()[1], Instruction::assign_variable("y", "n"));
        assert!(cache.valid().contains(AnalysisSet::SIZE_GROUPS));
    }
}
