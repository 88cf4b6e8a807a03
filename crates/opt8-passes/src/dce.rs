//! Dead code elimination.
//!
//! Deletes `NOP`s, pure instructions whose results are dead and jumps to
//! the address that follows them. Blocks that can no longer be reached are
//! dropped when every control transfer in the function is static.

use opt8_cfg::{BasicBlock, Cfg, ExitKind};
use opt8_ir::Opcode;
use rustc_hash::FxHashSet;
use tracing::{debug, trace_span};

use crate::dse::is_pure;
use crate::liveness::{Liveness, LivenessResult, analyze};
use crate::pass::{AnalysisStats, BlockRewrite, Edit, Pass, PassContext, PassOutput, commit};

#[derive(Clone, Copy, Debug, Default)]
pub struct DeadCodeElimination;

impl Pass for DeadCodeElimination {
    fn name(&self) -> &'static str {
        "dce"
    }

    fn run(&self, cfg: &Cfg, ctx: &PassContext<'_>) -> PassOutput {
        let _span = trace_span!("dce", blocks = cfg.len()).entered();
        let liveness = analyze(cfg, ctx.exit_live, ctx.invariants());
        let stats = AnalysisStats::of(&liveness.solution);
        let rewrites: Vec<BlockRewrite> = cfg
            .blocks()
            .map(|block| removable(block, &liveness, ctx))
            .filter(|rewrite| !rewrite.is_empty())
            .collect();
        debug!(candidates = rewrites.len(), "dead code proposals");
        let mut out = commit(self.name(), cfg, ctx, rewrites).with_analysis(stats);
        out.cfg = drop_unreachable(&out.cfg);
        out
    }
}

fn removable(block: &BasicBlock, liveness: &LivenessResult, ctx: &PassContext<'_>) -> BlockRewrite {
    let live_out = liveness.live_out(block.id);
    let analysis = Liveness::new(&liveness.universe, ctx.exit_live, ctx.invariants());
    let after = analysis.live_after(block, &live_out);
    let mut observed = live_out.observed();
    observed.memory = true;
    let mut rewrite = BlockRewrite::new(block).observing(observed);
    for (idx, insn) in block.instructions.iter().enumerate() {
        let dead = match insn.opcode {
            Opcode::Nop => true,
            Opcode::Jump => insn.target() == Some(block.end) && idx + 1 == block.len(),
            _ => is_pure(insn) && !insn.written_regs().any(|reg| after[idx].is_live(reg)),
        };
        if dead {
            rewrite.push(Edit::remove(idx));
        }
    }
    rewrite
}

/// Remove blocks unreachable from the entry. Skipped if any block has
/// unknown successors, since those may be reached dynamically.
fn drop_unreachable(cfg: &Cfg) -> Cfg {
    if cfg.blocks().any(|block| block.exit == ExitKind::Unknown) {
        return cfg.clone();
    }
    let reachable = cfg.reachable();
    let unreachable: FxHashSet<_> = cfg
        .block_ids()
        .filter(|id| !reachable.contains(id))
        .collect();
    if unreachable.is_empty() {
        return cfg.clone();
    }
    debug!(blocks = unreachable.len(), "dropping unreachable blocks");
    cfg.without_blocks(&unreachable)
}

#[cfg(test)]
mod tests {
    use super::*;
    use opt8_ir::{ExitLiveness, Function, InvariantSet, Reg, Width, parse_listing};
    use opt8_verify::EquivalenceChecker;

    fn build(text: &str, live: &[u8]) -> (Cfg, ExitLiveness) {
        let func = Function::new("f", parse_listing(text, Width::W8).unwrap())
            .with_exit_live(live.iter().map(|i| Reg::new(*i, Width::W8)));
        (Cfg::build(&func).unwrap(), func.exit_live)
    }

    fn run(cfg: &Cfg, exit_live: &ExitLiveness) -> PassOutput {
        let checker = EquivalenceChecker::builtin(InvariantSet::default()).with_workers(2);
        DeadCodeElimination.run(cfg, &PassContext::new(&checker, exit_live))
    }

    #[test]
    fn test_removes_nops_and_dead_arithmetic() {
        let (cfg, exit_live) = build(
            "0x200: MOV R1, 5\n0x201: NOP\n0x202: ADD R2, R1, R1\n0x203: RET\n",
            &[1],
        );
        let out = run(&cfg, &exit_live);
        let block = out.cfg.block(out.cfg.entry()).unwrap();
        let opcodes: Vec<Opcode> = block.instructions.iter().map(|i| i.opcode).collect();
        assert_eq!(opcodes, vec![Opcode::Mov, Opcode::Return]);
    }

    #[test]
    fn test_keeps_io_and_calls() {
        let (cfg, exit_live) = build("0x200: IN R1, 2\n0x201: CALL 0x400\n0x202: RET\n", &[]);
        let out = run(&cfg, &exit_live);
        assert!(out.committed.is_empty());
        assert_eq!(out.cfg.instruction_count(), 3);
    }

    #[test]
    fn test_jump_to_next_block_removed() {
        let (cfg, exit_live) = build("0x200: MOV R1, 1\n0x201: JMP 0x202\n0x202: RET\n", &[1]);
        let out = run(&cfg, &exit_live);
        let block = out.cfg.block(out.cfg.entry()).unwrap();
        assert_eq!(block.instructions.len(), 1);
        assert!(matches!(block.exit, ExitKind::Fallthrough(0x202)));
    }

    #[test]
    fn test_unreachable_block_dropped() {
        let (cfg, exit_live) = build("0x200: JMP 0x202\n0x201: MOV R1, 9\n0x202: RET\n", &[1]);
        let out = run(&cfg, &exit_live);
        assert!(out.cfg.block_at(0x201).is_none());
        assert!(out.cfg.validate().is_ok());
    }

    #[test]
    fn test_unreachable_kept_with_indirect_jump() {
        let (cfg, exit_live) = build("0x200: JMPI R2, 0\n0x201: MOV R1, 9\n0x202: RET\n", &[1]);
        let out = run(&cfg, &exit_live);
        assert!(out.cfg.block_at(0x201).is_some());
    }
}
