//! Dead store elimination.
//!
//! Register writes that no path reads before they are overwritten are
//! turned into `NOP`s, as are dead flag outputs. Stores are dead when
//! memory is not live after them, or when a later store in the same block
//! must-alias them with no memory read in between. Removed instructions
//! keep their address so that DCE can delete them later.

use opt8_cfg::{BasicBlock, Cfg};
use opt8_ir::{AliasRelation, Instruction, Invariant, Opcode, Operand};
use opt8_symbolic::{Access, SymbolicInterpreter, SymbolicState, address};
use tracing::{debug, trace_span};

use crate::liveness::{LiveSet, Liveness, LivenessResult, analyze};
use crate::pass::{AnalysisStats, BlockRewrite, Edit, Pass, PassContext, PassOutput, commit};

/// Whether removing `insn` only removes register writes.
pub(crate) fn is_pure(insn: &Instruction) -> bool {
    match insn.opcode {
        Opcode::Mov | Opcode::Load | Opcode::Nop => true,
        op => op.is_unary_alu() || op.is_binary_alu(),
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct DeadStoreElimination;

impl Pass for DeadStoreElimination {
    fn name(&self) -> &'static str {
        "dse"
    }

    fn run(&self, cfg: &Cfg, ctx: &PassContext<'_>) -> PassOutput {
        let _span = trace_span!("dse", blocks = cfg.len()).entered();
        let liveness = analyze(cfg, ctx.exit_live, ctx.invariants());
        let stats = AnalysisStats::of(&liveness.solution);
        let interp = SymbolicInterpreter::new(ctx.invariants());
        let rewrites: Vec<BlockRewrite> = cfg
            .blocks()
            .map(|block| dead_writes(block, &liveness, ctx, &interp))
            .filter(|rewrite| !rewrite.is_empty())
            .collect();
        debug!(candidates = rewrites.len(), "dead store proposals");
        commit(self.name(), cfg, ctx, rewrites).with_analysis(stats)
    }
}

fn dead_writes(
    block: &BasicBlock,
    liveness: &LivenessResult,
    ctx: &PassContext<'_>,
    interp: &SymbolicInterpreter,
) -> BlockRewrite {
    let live_out = liveness.live_out(block.id);
    let analysis = Liveness::new(&liveness.universe, ctx.exit_live, ctx.invariants());
    let after = analysis.live_after(block, &live_out);
    let overwritten = overwritten_stores(block, interp);

    let mut rewrite = BlockRewrite::new(block);
    let mut memory_dead = false;
    for (idx, insn) in block.instructions.iter().enumerate() {
        let live: &LiveSet = &after[idx];
        if insn.opcode == Opcode::Store {
            if overwritten[idx] {
                rewrite.push(Edit::replace(idx, insn.to_nop()));
            } else if !live.memory {
                rewrite.push(Edit::replace(idx, insn.to_nop()));
                memory_dead = true;
            }
            continue;
        }
        if insn.opcode == Opcode::Nop || !is_pure(insn) {
            continue;
        }
        if !insn.written_regs().any(|reg| live.is_live(reg)) {
            rewrite.push(Edit::replace(idx, insn.to_nop()));
            continue;
        }
        if let Some(flag) = insn.flag() {
            let dst_live = insn.dst().is_some_and(|dst| live.is_live(dst));
            if dst_live && Some(flag) != insn.dst() && !live.is_live(flag) {
                let operands: Vec<Operand> = insn.operands.iter().take(3).copied().collect();
                rewrite.push(Edit::replace(idx, insn.with_operands(operands)));
            }
        }
    }

    if memory_dead {
        // Memory is dead at exit only because nothing outside observes it.
        rewrite
            .observing(live_out.observed())
            .requiring(Invariant::NoExternalMemoryObservers)
    } else {
        let mut observed = live_out.observed();
        observed.memory = true;
        rewrite.observing(observed)
    }
}

/// Stores in `block` whose every byte is overwritten by a later store to
/// the same cell before memory can be read.
fn overwritten_stores(block: &BasicBlock, interp: &SymbolicInterpreter) -> Vec<bool> {
    let mut accesses: Vec<Option<Access>> = Vec::with_capacity(block.len());
    let mut state = SymbolicState::new();
    let mut events = Vec::new();
    for insn in &block.instructions {
        let access = if insn.opcode == Opcode::Store {
            insn.mem()
                .map(|mem| Access::new(address(&state, &mem), mem.width))
        } else {
            None
        };
        accesses.push(access);
        if interp.step(insn, &mut state, &mut events).is_some() {
            break;
        }
    }

    let mut dead = vec![false; block.len()];
    for (idx, access) in accesses.iter().enumerate() {
        let Some(access) = access else { continue };
        for (later, insn) in block.instructions.iter().enumerate().skip(idx + 1) {
            if insn.reads_memory() || insn.is_io() || insn.is_terminator() {
                break;
            }
            let Some(Some(next)) = accesses.get(later) else {
                continue;
            };
            if next.width == access.width
                && interp.alias().relation(access, next) == AliasRelation::MustAlias
            {
                dead[idx] = true;
                break;
            }
        }
    }
    dead
}

#[cfg(test)]
mod tests {
    use super::*;
    use opt8_ir::{ExitLiveness, Function, InvariantSet, Reg, Width, parse_listing};
    use opt8_verify::EquivalenceChecker;

    fn r(i: u8) -> Reg {
        Reg::new(i, Width::W8)
    }

    fn build(text: &str, live: &[u8]) -> (Cfg, ExitLiveness) {
        let func = Function::new("f", parse_listing(text, Width::W8).unwrap())
            .with_exit_live(live.iter().map(|i| r(*i)));
        (Cfg::build(&func).unwrap(), func.exit_live)
    }

    fn run(cfg: &Cfg, exit_live: &ExitLiveness, invariants: InvariantSet) -> PassOutput {
        let checker = EquivalenceChecker::builtin(invariants).with_workers(2);
        DeadStoreElimination.run(cfg, &PassContext::new(&checker, exit_live))
    }

    const SCENARIO_1: &str =
        "0x200: MOV R1, 5\n0x201: ADD R2, R1, R1\n0x202: STORE [R3], R2\n0x203: RET\n";

    #[test]
    fn test_store_kept_when_memory_is_observed() {
        let (cfg, exit_live) = build(SCENARIO_1, &[1, 3]);
        let out = run(&cfg, &exit_live, InvariantSet::default());
        let block = out.cfg.block(out.cfg.entry()).unwrap();
        assert_eq!(block.instructions[2].opcode, Opcode::Store);
    }

    #[test]
    fn test_store_removed_without_external_observers() {
        let (cfg, exit_live) = build(SCENARIO_1, &[1, 3]);
        let invariants = InvariantSet::default().with(Invariant::NoExternalMemoryObservers, true);
        let out = run(&cfg, &exit_live, invariants);
        let block = out.cfg.block(out.cfg.entry()).unwrap();
        // R2 only becomes dead once the store is gone; DCE removes the ADD.
        assert_eq!(block.instructions[1].opcode, Opcode::Add);
        assert_eq!(block.instructions[2].opcode, Opcode::Nop);
        assert!(
            out.committed[0]
                .obligation
                .requires
                .contains(&Invariant::NoExternalMemoryObservers)
        );
    }

    #[test]
    fn test_overwritten_store_is_dead() {
        let (cfg, exit_live) = build(
            "0x200: STORE [R3+1], R1\n0x201: MOV R4, R3\n0x202: STORE [R3+1], R2\n0x203: RET\n",
            &[1, 2, 3, 4],
        );
        let out = run(&cfg, &exit_live, InvariantSet::default());
        let block = out.cfg.block(out.cfg.entry()).unwrap();
        assert_eq!(block.instructions[0].opcode, Opcode::Nop);
        assert_eq!(block.instructions[2].opcode, Opcode::Store);
    }

    #[test]
    fn test_store_before_load_is_kept() {
        let (cfg, exit_live) = build(
            "0x200: STORE [R3], R1\n0x201: LOAD R4, [R5]\n0x202: STORE [R3], R2\n0x203: RET\n",
            &[1, 2, 3, 4, 5],
        );
        let out = run(&cfg, &exit_live, InvariantSet::default());
        assert!(out.committed.is_empty());
    }

    #[test]
    fn test_dead_flag_output_dropped() {
        let (cfg, exit_live) = build("0x200: ADD R1, R1, R2, R15\n0x201: RET\n", &[1]);
        let out = run(&cfg, &exit_live, InvariantSet::default());
        let block = out.cfg.block(out.cfg.entry()).unwrap();
        assert_eq!(block.instructions[0].flag(), None);
        assert_eq!(block.instructions[0].dst(), Some(r(1)));
    }

    #[test]
    fn test_io_is_never_removed() {
        let (cfg, exit_live) = build("0x200: IN R1, 3\n0x201: RET\n", &[]);
        let out = run(&cfg, &exit_live, InvariantSet::default());
        assert!(out.committed.is_empty());
    }
}
