//! Conventional loop-variable analysis.
//!
//! A *conventional* loop variable is a value threaded through a `for` loop in
//! the canonical SSA shape:
//!
//! ```text
//!   #C: x$before = ...
//!       for s, i, e, #L, #A
//!   #L: x$start = phi #C:x$before, #end(L):x$end     <- loop start
//!       ...
//!       x$end = ...                                   <- loop end
//!   #A: x$after = phi #C:x$before, #end(L):x$end      <- after loop (optional)
//! ```
//!
//! [`compute_conventional_variables`] finds every such quadruple.
//! [`analyze_standard_loop`] additionally requires the whole loop to be
//! *standard*: every loop-start phi and every after-loop phi belongs to a
//! conventional variable and the loop body contains no `break`/`continue`.

use std::collections::{HashSet, VecDeque};

use crate::analysis::ssa::{BlockId, ForLoop, FunctionBody, Instruction, TypeProvider};

/// A value carried across iterations of a `for` loop.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LoopVariable {
    /// Value before the loop (phi source from the container block)
    pub before_loop: String,
    /// Phi at the start of the loop block
    pub loop_start: String,
    /// Value at the end of the loop body (phi source from the back-edge)
    pub loop_end: String,
    /// Phi after the loop, if the value is used after the loop
    pub after_loop: Option<String>,
}

fn for_header(body: &FunctionBody, container: BlockId) -> Option<&ForLoop> {
    body.block(container)?.ending_instruction()?.as_for()
}

fn same_types(types: Option<&dyn TypeProvider>, vars: &[&str]) -> bool {
    let Some(types) = types else {
        return true;
    };
    let first = types.variable_type(vars[0]);
    vars[1..].iter().all(|v| types.variable_type(v) == first)
}

/// Computes the conventional loop variables of the `for` loop ending
/// `container`.
///
/// When `types` is given, the four variables of each quadruple must have the
/// same inferred type.
///
/// # Returns
///
/// `None` if `container` does not end with a `for`.
#[must_use]
pub fn compute_conventional_variables(
    body: &FunctionBody,
    container: BlockId,
    types: Option<&dyn TypeProvider>,
) -> Option<Vec<LoopVariable>> {
    let header = for_header(body, container)?;
    let loop_end = body.block_end(header.loop_block);

    let mut candidates: Vec<(String, String, String)> = Vec::new();
    for phi in body.block(header.loop_block)?.phis() {
        if phi.len() != 2 {
            continue;
        }
        let (Some(before), Some(end)) = (phi.input_from(container), phi.input_from(loop_end))
        else {
            continue;
        };
        candidates.push((before.to_string(), phi.output().to_string(), end.to_string()));
    }

    let mut variables = Vec::new();
    let mut used = HashSet::new();

    for phi in body.block(header.end_block)?.phis() {
        if phi.len() != 2 {
            continue;
        }
        let (Some(before), Some(end)) = (phi.input_from(container), phi.input_from(loop_end))
        else {
            continue;
        };

        let matched = candidates.iter().enumerate().find(|(i, (b, s, e))| {
            !used.contains(i)
                && b == before
                && e == end
                && same_types(types, &[before, s.as_str(), end, phi.output()])
        });
        if let Some((index, (b, s, e))) = matched {
            used.insert(index);
            variables.push(LoopVariable {
                before_loop: b.clone(),
                loop_start: s.clone(),
                loop_end: e.clone(),
                after_loop: Some(phi.output().to_string()),
            });
        }
    }

    for (index, (b, s, e)) in candidates.iter().enumerate() {
        if used.contains(&index) || !same_types(types, &[b.as_str(), s.as_str(), e.as_str()]) {
            continue;
        }
        variables.push(LoopVariable {
            before_loop: b.clone(),
            loop_start: s.clone(),
            loop_end: e.clone(),
            after_loop: None,
        });
    }

    Some(variables)
}

/// Computes the loop variables of a *standard* loop.
///
/// A loop is standard if every phi at the start of its loop block and every
/// phi in its end block is part of a conventional variable, and its body
/// contains no `break` or `continue` (jumps inside nested loops belong to
/// those loops and are ignored).
///
/// # Returns
///
/// `None` if `container` does not end with a `for` or the loop is not
/// standard.
#[must_use]
pub fn analyze_standard_loop(
    body: &FunctionBody,
    container: BlockId,
    types: Option<&dyn TypeProvider>,
) -> Option<Vec<LoopVariable>> {
    let variables = compute_conventional_variables(body, container, types)?;
    let header = for_header(body, container)?;

    let all_standard = body
        .block(header.loop_block)?
        .phis()
        .all(|phi| variables.iter().any(|v| v.loop_start == phi.output()));
    if !all_standard {
        return None;
    }

    let mut pending = VecDeque::from([header.loop_block]);
    while let Some(current) = pending.pop_front() {
        for instruction in body.block(current)?.instructions() {
            match instruction {
                Instruction::Break | Instruction::Continue => return None,
                Instruction::For(nested) => pending.push_back(nested.end_block),
                Instruction::While { end_block, .. } => pending.push_back(*end_block),
                other => pending.extend(other.owned_blocks()),
            }
        }
    }

    let after_standard = body.block(header.end_block)?.phis().all(|phi| {
        variables
            .iter()
            .any(|v| v.after_loop.as_deref() == Some(phi.output()))
    });
    if !after_standard {
        return None;
    }

    Some(variables)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::ssa::{PhiNode, SsaBlock};

    fn phi(out: &str, a: &str, b: &str, sa: BlockId, sb: BlockId) -> Instruction {
        Instruction::Phi(PhiNode::new(out, vec![a.into(), b.into()], vec![sa, sb]))
    }

    /// #0: for #1, #2
    /// #1: x$2 = phi #0:x$1, #1:x$3 ; i = iter ; x$3 = plus x$2, i
    /// #2: x$4 = phi #0:x$1, #1:x$3
    fn accumulator() -> FunctionBody {
        let mut body = FunctionBody::new("f");
        let l = body.new_block();
        let e = body.new_block();
        body.block_mut(BlockId::ENTRY)
            .unwrap()
            .add_instruction(Instruction::For(ForLoop::new("$1", "$1", "n", l, e)));
        *body.block_mut(l).unwrap() = SsaBlock::from_instructions(vec![
            phi("x$2", "x$1", "x$3", BlockId::ENTRY, l),
            Instruction::Iter {
                output: "i$1".into(),
            },
            Instruction::call(
                "plus",
                vec!["x$3".into()],
                vec!["x$2".into(), "i$1".into()],
            ),
        ]);
        body.block_mut(e)
            .unwrap()
            .add_instruction(phi("x$4", "x$1", "x$3", BlockId::ENTRY, l));
        body
    }

    #[test]
    fn test_conventional_variables() {
        let body = accumulator();
        let vars = compute_conventional_variables(&body, BlockId::ENTRY, None).unwrap();
        assert_eq!(
            vars,
            vec![LoopVariable {
                before_loop: "x$1".into(),
                loop_start: "x$2".into(),
                loop_end: "x$3".into(),
                after_loop: Some("x$4".into()),
            }]
        );
    }

    #[test]
    fn test_not_a_loop() {
        let body = accumulator();
        assert!(compute_conventional_variables(&body, BlockId::new(1), None).is_none());
    }

    #[test]
    fn test_standard_loop() {
        let body = accumulator();
        assert!(analyze_standard_loop(&body, BlockId::ENTRY, None).is_some());
    }

    #[test]
    fn test_break_makes_loop_non_standard() {
        let mut body = accumulator();
        let t = body.new_block();
        let f = body.new_block();
        let j = body.new_block();
        body.block_mut(t).unwrap().add_instruction(Instruction::Break);
        body.block_mut(BlockId::new(1))
            .unwrap()
            .add_instruction(Instruction::Branch {
                condition: "c".into(),
                true_block: t,
                false_block: f,
                end_block: j,
            });
        assert!(analyze_standard_loop(&body, BlockId::ENTRY, None).is_none());
    }

    #[test]
    fn test_unmatched_after_phi_is_non_standard() {
        let mut body = accumulator();
        body.block_mut(BlockId::new(2))
            .unwrap()
            .add_instruction(phi("y$2", "y$1", "x$3", BlockId::ENTRY, BlockId::new(1)));
        assert!(analyze_standard_loop(&body, BlockId::ENTRY, None).is_none());
    }
}
