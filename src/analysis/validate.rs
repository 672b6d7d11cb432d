//! Structural validation of SSA functions.
//!
//! [`validate`] checks the invariants every pass relies on and every pass
//! must preserve:
//!
//! 1. every variable is declared exactly once;
//! 2. phis have at least one operand and no duplicated source blocks;
//! 3. an ending instruction is the last instruction of its block;
//! 4. every block referenced by a control transfer exists;
//! 5. every used variable is declared somewhere;
//! 6. phis appear at the start of their block (line markers may precede
//!    them);
//! 7. in the entry block, and within any block, no variable is read before
//!    its declaration (phi operands excepted);
//! 8. the source blocks of every phi are exactly the predecessors of its
//!    block.
//!
//! A violation is an internal error: it is reported as
//! [`Error::InvalidSsa`](crate::Error::InvalidSsa) and the function is
//! abandoned.

use std::collections::{BTreeSet, HashSet};

use crate::{
    analysis::{
        cfg::StructuredCfg,
        ssa::{BlockId, FunctionBody, Instruction, InstructionType},
    },
    Error, Result,
};

fn violation(body: &FunctionBody, message: impl Into<String>) -> Error {
    Error::InvalidSsa {
        function: body.name().to_string(),
        message: message.into(),
    }
}

/// Validates `body`.
///
/// # Errors
///
/// Returns [`Error::InvalidSsa`] describing the first violated invariant.
pub fn validate(body: &FunctionBody) -> Result<()> {
    let mut declared = HashSet::new();
    let mut used = BTreeSet::new();

    for (id, block) in body.iter_blocks() {
        let instructions = block.instructions();
        for (index, instruction) in instructions.iter().enumerate() {
            for output in instruction.outputs() {
                if !declared.insert(output) {
                    return Err(violation(
                        body,
                        format!("variable {} is declared multiple times", output),
                    ));
                }
            }
            used.extend(instruction.inputs());

            if let Instruction::Phi(phi) = instruction {
                if phi.is_empty() {
                    return Err(violation(body, format!("phi without inputs in {}", id)));
                }
                let sources: HashSet<BlockId> = phi.sources().collect();
                if sources.len() != phi.len() {
                    return Err(violation(
                        body,
                        format!("phi node has duplicated source blocks: {}", phi),
                    ));
                }
            }

            if instruction.is_ending() && index + 1 != instructions.len() {
                return Err(violation(
                    body,
                    format!("ending instruction in middle of block {}: {}", id, instruction),
                ));
            }

            for owned in instruction.owned_blocks() {
                if owned.index() >= body.block_count() {
                    return Err(violation(
                        body,
                        format!(
                            "reference to missing block {} (of {}) in {}",
                            owned,
                            body.block_count(),
                            instruction
                        ),
                    ));
                }
            }
        }
    }

    if let Some(missing) = used.iter().find(|v| !declared.contains(*v)) {
        return Err(violation(
            body,
            format!("variable {} is used but never declared", missing),
        ));
    }

    for (id, block) in body.iter_blocks() {
        let mut allow_phi = true;
        for instruction in block.instructions() {
            if instruction.instruction_type() == InstructionType::Line {
                continue;
            }
            match instruction {
                Instruction::Phi(phi) if !allow_phi => {
                    return Err(violation(
                        body,
                        format!("phi not at the beginning of block {}: {}", id, phi),
                    ));
                }
                Instruction::Phi(_) => {}
                _ => allow_phi = false,
            }
        }
    }

    if let Some(entry) = body.block(BlockId::ENTRY) {
        let mut available = HashSet::new();
        for instruction in entry.instructions() {
            if let Some(missing) = instruction.inputs().iter().find(|v| !available.contains(*v)) {
                return Err(violation(
                    body,
                    format!("variable {} is used before being declared", missing),
                ));
            }
            available.extend(instruction.outputs());
        }
    }

    for (id, block) in body.iter_blocks() {
        let mut read = HashSet::new();
        for instruction in block.instructions() {
            if let Some(output) = instruction.outputs().iter().find(|o| read.contains(*o)) {
                return Err(violation(
                    body,
                    format!("variable {} is used in block {} before being declared", output, id),
                ));
            }
            if !matches!(instruction, Instruction::Phi(_)) {
                read.extend(instruction.inputs());
            }
        }
    }

    let cfg = StructuredCfg::build(body);
    for (id, block) in body.iter_blocks() {
        let empty = BTreeSet::new();
        let predecessors = cfg.predecessors(id).unwrap_or(&empty);
        for phi in block.phis() {
            let sources: BTreeSet<BlockId> = phi.sources().collect();
            if &sources != predecessors {
                return Err(violation(
                    body,
                    format!(
                        "phi sources of {} do not match predecessors {:?}: {}",
                        id, predecessors, phi
                    ),
                ));
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::ssa::{ForLoop, PhiNode, SsaBlock};

    fn phi(out: &str, inputs: &[&str], sources: &[usize]) -> Instruction {
        Instruction::Phi(PhiNode::new(
            out,
            inputs.iter().map(|s| (*s).to_string()).collect(),
            sources.iter().map(|s| BlockId::new(*s)).collect(),
        ))
    }

    fn counted_loop() -> FunctionBody {
        let mut body = FunctionBody::new("f");
        let l = body.new_block();
        let e = body.new_block();
        *body.block_mut(BlockId::ENTRY).unwrap() = SsaBlock::from_instructions(vec![
            Instruction::Argument {
                output: "n".into(),
                index: 0,
            },
            Instruction::assign_integer("one", 1),
            Instruction::assign_integer("x1", 0),
            Instruction::For(ForLoop::new("one", "one", "n", l, e)),
        ]);
        *body.block_mut(l).unwrap() = SsaBlock::from_instructions(vec![
            phi("x2", &["x1", "x3"], &[0, 1]),
            Instruction::Iter { output: "i".into() },
            Instruction::call("plus", vec!["x3".into()], vec!["x2".into(), "i".into()]),
        ]);
        body.block_mut(e)
            .unwrap()
            .add_instruction(phi("x4", &["x1", "x3"], &[0, 1]));
        body
    }

    #[test]
    fn test_valid_loop() {
        assert!(validate(&counted_loop()).is_ok());
    }

    #[test]
    fn test_double_declaration() {
        let mut body = counted_loop();
        body.block_mut(BlockId::new(2))
            .unwrap()
            .add_instruction(Instruction::assign_integer("x1", 3));
        assert!(matches!(validate(&body), Err(Error::InvalidSsa { .. })));
    }

    #[test]
    fn test_undeclared_use() {
        let mut body = counted_loop();
        body.block_mut(BlockId::new(2))
            .unwrap()
            .add_instruction(Instruction::assign_variable("y", "ghost"));
        assert!(validate(&body).is_err());
    }

    #[test]
    fn test_phi_source_mismatch() {
        let mut body = counted_loop();
        body.block_mut(BlockId::new(2))
            .unwrap()
            .add_instruction(phi("x5", &["x1"], &[0]));
        let err = validate(&body).unwrap_err().to_string();
        assert!(err.contains("predecessors"), "{}", err);
    }

    #[test]
    fn test_ending_in_middle() {
        let mut body = counted_loop();
        body.block_mut(BlockId::ENTRY)
            .unwrap()
            .add_instruction(Instruction::assign_integer("z", 1));
        assert!(validate(&body).is_err());
    }

    #[test]
    fn test_use_before_declaration_in_entry() {
        let mut body = FunctionBody::new("f");
        *body.block_mut(BlockId::ENTRY).unwrap() = SsaBlock::from_instructions(vec![
            Instruction::assign_variable("a", "b"),
            Instruction::assign_integer("b", 1),
        ]);
        assert!(validate(&body).is_err());
    }
}
