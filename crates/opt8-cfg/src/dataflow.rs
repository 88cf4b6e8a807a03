//! Worklist dataflow driver.
//!
//! Facts are immutable per-block snapshots; a block is re-processed only
//! when the fact flowing into it changes. The driver records how many block
//! visits it needed so callers can check them against the lattice bound.

use std::fmt::Debug;

use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{trace, warn};

use crate::block::{BasicBlock, BlockId};
use crate::graph::Cfg;

/// Direction in which facts flow.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Backward,
}

/// A dataflow problem over a [`Cfg`].
pub trait Dataflow {
    type Fact: Clone + PartialEq + Debug;

    fn direction(&self) -> Direction;

    /// Least element of the lattice.
    fn bottom(&self) -> Self::Fact;

    /// Fact at the boundary: function entry (forward) or exit (backward).
    fn boundary(&self, cfg: &Cfg, block: &BasicBlock) -> Self::Fact;

    /// Join `other` into `acc`. Returns true if `acc` changed.
    fn join(&self, acc: &mut Self::Fact, other: &Self::Fact) -> bool;

    /// Transfer a fact across a whole block.
    fn transfer(&self, block: &BasicBlock, input: &Self::Fact) -> Self::Fact;
}

/// Fixpoint of a dataflow problem.
///
/// `input` is the fact flowing into each block's transfer function (block
/// entry for forward problems, block exit for backward ones) and `output`
/// the fact it produces. Forward problems only have facts for reached blocks.
#[derive(Clone, Debug)]
pub struct Solution<F> {
    pub input: FxHashMap<BlockId, F>,
    pub output: FxHashMap<BlockId, F>,
    /// Number of block visits performed.
    pub iterations: usize,
    /// Maximum number of visits allowed.
    pub bound: usize,
    /// False if the bound was hit before the worklist emptied.
    pub converged: bool,
}

/// Whether a block takes the boundary fact.
fn is_boundary<A: Dataflow + ?Sized>(analysis: &A, cfg: &Cfg, id: BlockId) -> bool {
    match analysis.direction() {
        Direction::Forward => id == cfg.entry(),
        Direction::Backward => cfg.is_exit(id) || cfg.successors(id).next().is_none(),
    }
}

fn flow_targets<A: Dataflow + ?Sized>(analysis: &A, cfg: &Cfg, id: BlockId) -> Vec<BlockId> {
    let mut targets: Vec<BlockId> = match analysis.direction() {
        Direction::Forward => cfg.successors(id).map(|edge| edge.to).collect(),
        Direction::Backward => cfg.predecessors(id).map(|edge| edge.from).collect(),
    };
    targets.dedup();
    targets
}

/// Run a dataflow problem to a fixpoint, visiting at most `bound` blocks.
pub fn solve<A: Dataflow + ?Sized>(analysis: &A, cfg: &Cfg, bound: usize) -> Solution<A::Fact> {
    let mut input: FxHashMap<BlockId, A::Fact> = FxHashMap::default();
    let mut output: FxHashMap<BlockId, A::Fact> = FxHashMap::default();
    let mut worklist: Vec<BlockId> = Vec::with_capacity(cfg.len());
    let mut in_worklist: FxHashSet<BlockId> = FxHashSet::default();

    match analysis.direction() {
        Direction::Forward => {
            if let Some(entry) = cfg.block(cfg.entry()) {
                input.insert(entry.id, analysis.boundary(cfg, entry));
                in_worklist.insert(entry.id);
                worklist.push(entry.id);
            }
        }
        Direction::Backward => {
            // Reverse address order reaches most blocks after their successors.
            let ids: Vec<BlockId> = cfg.block_ids().collect();
            for id in ids.into_iter().rev() {
                let Some(block) = cfg.block(id) else { continue };
                let fact = if is_boundary(analysis, cfg, id) {
                    analysis.boundary(cfg, block)
                } else {
                    analysis.bottom()
                };
                input.insert(id, fact);
                in_worklist.insert(id);
                worklist.push(id);
            }
        }
    }

    let mut idx = 0;
    let mut converged = true;
    while idx < worklist.len() {
        if idx >= bound {
            converged = false;
            warn!(bound, "dataflow did not converge within bound");
            break;
        }
        let id = worklist[idx];
        idx += 1;
        in_worklist.remove(&id);

        let (Some(block), Some(fact_in)) = (cfg.block(id), input.get(&id)) else {
            continue;
        };
        let fact_out = analysis.transfer(block, fact_in);
        let first_visit = !output.contains_key(&id);
        if !first_visit && output.get(&id) == Some(&fact_out) {
            continue;
        }

        for next in flow_targets(analysis, cfg, id) {
            let changed = match input.get_mut(&next) {
                Some(existing) => analysis.join(existing, &fact_out),
                None => {
                    let mut fresh = analysis.bottom();
                    analysis.join(&mut fresh, &fact_out);
                    input.insert(next, fresh);
                    true
                }
            };
            let unvisited = !output.contains_key(&next);
            if (changed || unvisited) && in_worklist.insert(next) {
                worklist.push(next);
            }
        }
        output.insert(id, fact_out);
    }

    trace!(iterations = idx, bound, "worklist complete");
    Solution {
        input,
        output,
        iterations: idx,
        bound,
        converged,
    }
}

/// Check that a solution is a fixpoint: re-applying every transfer function
/// reproduces the recorded outputs, and every flow edge is already absorbed
/// by the fact at its target.
pub fn is_fixpoint<A: Dataflow + ?Sized>(
    analysis: &A,
    cfg: &Cfg,
    solution: &Solution<A::Fact>,
) -> bool {
    for (id, fact_in) in &solution.input {
        let Some(block) = cfg.block(*id) else {
            return false;
        };
        let fact_out = analysis.transfer(block, fact_in);
        if solution.output.get(id) != Some(&fact_out) {
            return false;
        }
        for next in flow_targets(analysis, cfg, *id) {
            let Some(target) = solution.input.get(&next) else {
                return false;
            };
            let mut joined = target.clone();
            if analysis.join(&mut joined, &fact_out) {
                return false;
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use opt8_ir::{Cond, Function, Instruction, Opcode, Operand, Reg, Width};

    /// Counts the longest path length (in blocks) from the entry, capped.
    struct Depth;

    impl Dataflow for Depth {
        type Fact = u32;

        fn direction(&self) -> Direction {
            Direction::Forward
        }

        fn bottom(&self) -> u32 {
            0
        }

        fn boundary(&self, _cfg: &Cfg, _block: &BasicBlock) -> u32 {
            1
        }

        fn join(&self, acc: &mut u32, other: &u32) -> bool {
            if *other > *acc {
                *acc = *other;
                true
            } else {
                false
            }
        }

        fn transfer(&self, _block: &BasicBlock, input: &u32) -> u32 {
            (*input + 1).min(5)
        }
    }

    fn r(i: u8) -> Reg {
        Reg::new(i, Width::W8)
    }

    fn looped() -> Cfg {
        let func = Function::new("loop", vec![
            Instruction::mov_imm(0, r(1), 3),
            Instruction::alu(1, Opcode::Sub, r(1), Operand::Reg(r(1)), Operand::Imm(1)),
            Instruction::branch(2, Cond::Ne, Operand::Reg(r(1)), Operand::Imm(0), 1),
            Instruction::ret(3),
        ]);
        Cfg::build(&func).unwrap()
    }

    #[test]
    fn test_forward_converges_on_loop() {
        let cfg = looped();
        let solution = solve(&Depth, &cfg, 100);
        assert!(solution.converged);
        assert!(solution.iterations <= solution.bound);
        assert!(is_fixpoint(&Depth, &cfg, &solution));
        let body = cfg.block_at(1).unwrap();
        assert_eq!(solution.output[&body], 5);
    }

    #[test]
    fn test_bound_is_enforced() {
        let cfg = looped();
        let solution = solve(&Depth, &cfg, 2);
        assert!(!solution.converged);
        assert_eq!(solution.iterations, 2);
    }
}
