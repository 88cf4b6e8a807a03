//! Constant propagation.
//!
//! A forward analysis over the `Bottom ⊑ Constant ⊑ Top` lattice per
//! register. Block transfer functions run the symbolic interpreter from a
//! state holding the known constants, so every instruction is folded with
//! the same semantics the checker uses.

use std::collections::BTreeSet;

use opt8_cfg::{
    BasicBlock, CONST_LATTICE_HEIGHT, Cfg, ConstState, Dataflow, Direction, Solution, is_fixpoint,
    solve,
};
use opt8_ir::{Instruction, InvariantSet, MemRef, Opcode, Operand, Reg, SymbolicValue};
use opt8_symbolic::{Exit, SymbolicInterpreter, SymbolicState};
use opt8_verify::Observed;
use tracing::{debug, trace_span, warn};

use crate::liveness::register_universe;
use crate::pass::{AnalysisStats, BlockRewrite, Edit, Pass, PassContext, PassOutput, commit};

/// Forward constant analysis.
#[derive(Clone, Debug)]
pub struct ConstAnalysis<'a> {
    interp: SymbolicInterpreter,
    universe: &'a BTreeSet<Reg>,
    /// An indirect jump may enter any block, so no entry fact survives.
    /// Block extraction makes every instruction its own block in that case.
    indirect: bool,
}

impl<'a> ConstAnalysis<'a> {
    #[must_use]
    pub fn new(cfg: &Cfg, universe: &'a BTreeSet<Reg>, invariants: &InvariantSet) -> Self {
        let indirect = cfg.blocks().any(|block| {
            block
                .terminator()
                .is_some_and(|insn| insn.opcode == Opcode::JumpIndirect)
        });
        Self {
            interp: SymbolicInterpreter::new(invariants),
            universe,
            indirect,
        }
    }

    /// Worklist bound: one visit per block plus one per lattice step of
    /// each register at its entry.
    #[must_use]
    pub fn bound(&self, cfg: &Cfg) -> usize {
        cfg.len().max(1) * (CONST_LATTICE_HEIGHT * self.universe.len() + 2)
    }

    /// Fact assumed at the entry of a block that receives `fact`.
    #[must_use]
    pub fn entry_fact(&self, fact: &ConstState) -> ConstState {
        if self.indirect {
            ConstState::top(self.universe.iter().copied())
        } else {
            fact.clone()
        }
    }
}

/// Symbolic state holding the constants of `fact`; other registers are
/// unknown.
#[must_use]
pub fn state_from_constants(fact: &ConstState) -> SymbolicState {
    let mut state = SymbolicState::unknown_registers();
    for (reg, val) in fact.constants() {
        state.write_reg(reg, SymbolicValue::constant(val, reg.width));
    }
    state
}

impl Dataflow for ConstAnalysis<'_> {
    type Fact = ConstState;

    fn direction(&self) -> Direction {
        Direction::Forward
    }

    fn bottom(&self) -> ConstState {
        ConstState::new()
    }

    fn boundary(&self, _cfg: &Cfg, _block: &BasicBlock) -> ConstState {
        ConstState::top(self.universe.iter().copied())
    }

    fn join(&self, acc: &mut ConstState, other: &ConstState) -> bool {
        acc.merge(other)
    }

    fn transfer(&self, block: &BasicBlock, input: &ConstState) -> ConstState {
        let entry = state_from_constants(&self.entry_fact(input));
        let summary = self.interp.run(&block.instructions, block.end, entry);
        let mut out = ConstState::new();
        for reg in self.universe {
            match summary.state.read_reg(*reg).as_const() {
                Some(val) => out.set_constant(*reg, val),
                None => out.set_top(*reg),
            }
        }
        out
    }
}

/// Solve constant propagation over `cfg`.
#[must_use]
pub fn analyze_constants(
    cfg: &Cfg,
    universe: &BTreeSet<Reg>,
    invariants: &InvariantSet,
) -> Solution<ConstState> {
    let analysis = ConstAnalysis::new(cfg, universe, invariants);
    let solution = solve(&analysis, cfg, analysis.bound(cfg));
    debug_assert!(!solution.converged || is_fixpoint(&analysis, cfg, &solution));
    solution
}

/// Rewrites uses of provably constant registers into immediates, folds
/// fully constant computations into `MOV`s and resolves constant branches.
#[derive(Clone, Copy, Debug, Default)]
pub struct ConstantPropagation;

impl Pass for ConstantPropagation {
    fn name(&self) -> &'static str {
        "const-prop"
    }

    fn run(&self, cfg: &Cfg, ctx: &PassContext<'_>) -> PassOutput {
        let _span = trace_span!("const_prop", blocks = cfg.len()).entered();
        let universe = register_universe(cfg, ctx.exit_live);
        let analysis = ConstAnalysis::new(cfg, &universe, ctx.invariants());
        let solution = solve(&analysis, cfg, analysis.bound(cfg));
        let stats = AnalysisStats::of(&solution);
        if !solution.converged {
            warn!(iterations = solution.iterations, "constant propagation did not converge");
            return PassOutput::unchanged(cfg).with_analysis(stats);
        }

        let mut rewrites = Vec::new();
        for block in cfg.blocks() {
            // Unreached blocks have no fact.
            let Some(fact) = solution.input.get(&block.id) else {
                continue;
            };
            let entry = analysis.entry_fact(fact);
            let rewrite = fold_block(cfg, block, &entry, &analysis.interp);
            if !rewrite.is_empty() {
                rewrites.push(rewrite);
            }
        }
        debug!(candidates = rewrites.len(), "constant propagation proposals");
        commit(self.name(), cfg, ctx, rewrites).with_analysis(stats)
    }
}

fn fold_block(
    cfg: &Cfg,
    block: &BasicBlock,
    entry: &ConstState,
    interp: &SymbolicInterpreter,
) -> BlockRewrite {
    let mut rewrite = BlockRewrite::new(block)
        .assuming(entry.constants())
        .observing(Observed::everything());
    let mut state = state_from_constants(entry);
    let mut events = Vec::new();
    for (idx, insn) in block.instructions.iter().enumerate() {
        let before = state.clone();
        let exit = interp.step(insn, &mut state, &mut events);
        if let Some(folded) = fold(cfg, insn, &before, &state, exit.as_ref()) {
            rewrite.push(Edit::replace(idx, folded));
        }
        if exit.is_some() {
            break;
        }
    }
    rewrite
}

/// Constant-folded replacement for one instruction, if any.
fn fold(
    cfg: &Cfg,
    insn: &Instruction,
    before: &SymbolicState,
    after: &SymbolicState,
    exit: Option<&Exit>,
) -> Option<Instruction> {
    match insn.opcode {
        Opcode::Branch(_) | Opcode::JumpIndirect => {
            let Some(Exit::Goto(pc)) = exit else {
                return None;
            };
            let target = pc.as_const()?;
            if insn.opcode == Opcode::JumpIndirect && cfg.block_at(target).is_none() {
                return None;
            }
            if insn.is_conditional_branch() && target == insn.next_address() {
                return Some(insn.to_nop());
            }
            return Some(Instruction::jump(insn.address, target).sized(insn.size));
        }
        Opcode::Mov | Opcode::Load => {}
        op if op.is_unary_alu() || op.is_binary_alu() => {}
        _ => return substitute(insn, before),
    }

    let folded = insn
        .dst()
        .filter(|_| insn.flag().is_none())
        .and_then(|dst| after.read_reg(dst).as_const().map(|val| (dst, val)));
    let Some((dst, val)) = folded else {
        return substitute(insn, before);
    };
    if insn.opcode == Opcode::Mov && insn.operands.get(1) == Some(&Operand::Imm(val)) {
        return None;
    }
    Some(Instruction::mov_imm(insn.address, dst, val).sized(insn.size))
}

/// Replace constant register sources with immediates and constant memory
/// bases with absolute addresses.
fn substitute(insn: &Instruction, before: &SymbolicState) -> Option<Instruction> {
    let sources: &[usize] = match insn.opcode {
        Opcode::Mov | Opcode::Store => &[1],
        op if op.is_unary_alu() => &[1],
        op if op.is_binary_alu() => &[1, 2],
        _ => &[],
    };
    let mut operands = insn.operands.clone();
    let mut changed = false;
    for &idx in sources {
        let Some(Operand::Reg(reg)) = operands.get(idx).copied() else {
            continue;
        };
        if let Some(val) = before.read_reg(reg).as_const() {
            operands[idx] = Operand::Imm(val);
            changed = true;
        }
    }
    for op in &mut operands {
        let Operand::Mem(mem) = *op else { continue };
        let Some(base) = mem.base else { continue };
        let Some(val) = before.read_reg(base).as_const() else {
            continue;
        };
        let aw = mem.address_width();
        let addr = aw.truncate(val.wrapping_add(mem.offset as u64));
        *op = Operand::Mem(MemRef::absolute(addr, mem.width, aw));
        changed = true;
    }
    changed.then(|| insn.with_operands(operands))
}

#[cfg(test)]
mod tests {
    use super::*;
    use opt8_ir::{ExitLiveness, Function, Width, format_listing, parse_listing};
    use opt8_verify::EquivalenceChecker;

    fn r(i: u8) -> Reg {
        Reg::new(i, Width::W8)
    }

    fn build(text: &str) -> Cfg {
        let func = Function::new("f", parse_listing(text, Width::W8).unwrap());
        Cfg::build(&func).unwrap()
    }

    fn run(cfg: &Cfg) -> PassOutput {
        let checker = EquivalenceChecker::builtin(InvariantSet::default()).with_workers(2);
        let exit_live = ExitLiveness::All;
        ConstantPropagation.run(cfg, &PassContext::new(&checker, &exit_live))
    }

    #[test]
    fn test_folds_constant_arithmetic() {
        let cfg = build("0x200: MOV R1, 2\n0x201: MOV R2, 3\n0x202: ADD R3, R1, R2\n0x203: RET\n");
        let out = run(&cfg);
        assert_eq!(out.committed.len(), 1);
        let block = out.cfg.block(out.cfg.entry()).unwrap();
        assert_eq!(block.instructions[2], Instruction::mov_imm(0x202, r(3), 5));
    }

    #[test]
    fn test_constants_flow_across_blocks() {
        let cfg = build(
            "0x200: MOV R1, 4\n0x201: BEQ R2, 0, 0x203\n0x202: MOV R3, 1\n\
             0x203: ADD R4, R1, R2\n0x204: RET\n",
        );
        let out = run(&cfg);
        let join = out.cfg.block_at(0x203).unwrap();
        let text = format_listing(&out.cfg.block(join).unwrap().instructions);
        assert!(text.contains("ADD R4, 4, R2"), "{text}");
    }

    #[test]
    fn test_merge_of_different_constants_is_top() {
        let cfg = build(
            "0x200: MOV R1, 4\n0x201: BEQ R2, 0, 0x204\n0x202: MOV R1, 5\n0x203: JMP 0x204\n\
             0x204: ADD R3, R1, 1\n0x205: RET\n",
        );
        let universe = register_universe(&cfg, &ExitLiveness::All);
        let solution = analyze_constants(&cfg, &universe, &InvariantSet::default());
        let join = cfg.block_at(0x204).unwrap();
        assert_eq!(solution.input[&join].get(r(1)), opt8_cfg::ConstValue::Top);
        assert!(solution.converged);
        assert!(solution.iterations <= solution.bound);
    }

    #[test]
    fn test_constant_branch_becomes_jump() {
        let cfg =
            build("0x200: MOV R1, 0\n0x201: BEQ R1, 0, 0x203\n0x202: MOV R2, 9\n0x203: RET\n");
        let out = run(&cfg);
        let entry = out.cfg.block(out.cfg.entry()).unwrap();
        assert_eq!(entry.instructions[1], Instruction::jump(0x201, 0x203));
        assert!(!out.cfg.reachable().contains(&out.cfg.block_at(0x202).unwrap()));
    }

    #[test]
    fn test_loop_reaches_fixpoint() {
        let cfg = build(
            "0x200: MOV R1, 3\n0x201: MOV R5, 7\n0x202: SUB R1, R1, 1\n0x203: ADD R6, R5, 1\n\
             0x204: BNE R1, 0, 0x202\n0x205: RET\n",
        );
        let universe = register_universe(&cfg, &ExitLiveness::All);
        let analysis = ConstAnalysis::new(&cfg, &universe, &InvariantSet::default());
        let solution = solve(&analysis, &cfg, analysis.bound(&cfg));
        assert!(solution.converged);
        assert!(solution.iterations <= solution.bound);
        assert!(is_fixpoint(&analysis, &cfg, &solution));
        let body = cfg.block_at(0x202).unwrap();
        assert_eq!(solution.input[&body].get(r(5)).as_constant(), Some(7));
        assert_eq!(solution.input[&body].get(r(1)), opt8_cfg::ConstValue::Top);
    }

    #[test]
    fn test_indirect_jump_disables_entry_facts() {
        let cfg = build("0x200: MOV R1, 3\n0x201: JMPI R2, 0\n0x202: ADD R3, R1, 1\n0x203: RET\n");
        let out = run(&cfg);
        // 0x202 may be entered from the indirect jump with any R1.
        assert!(out.committed.iter().all(|c| c.block == out.cfg.entry()));
        let add = out.cfg.block_at(0x202).unwrap();
        assert_eq!(out.cfg.block(add).unwrap().instructions[0].to_string(), "ADD R3, R1, 1");
    }

    #[test]
    fn test_indirect_jump_into_block_middle() {
        // JMPI may land on 0x202 and skip the MOV.
        let cfg = build(
            "0x200: BEQ R5, 0, 0x204\n0x201: MOV R1, 7\n0x202: ADD R3, R1, 1\n0x203: RET\n\
             0x204: JMPI R2, 0\n",
        );
        assert!(cfg.block_at(0x202).is_some());
        let universe = register_universe(&cfg, &ExitLiveness::All);
        let solution = analyze_constants(&cfg, &universe, &InvariantSet::default());
        let add = cfg.block_at(0x202).unwrap();
        assert_eq!(solution.input[&add].get(r(1)), opt8_cfg::ConstValue::Top);

        let out = run(&cfg);
        let listing: Vec<String> = out
            .cfg
            .linearize()
            .instructions
            .iter()
            .map(ToString::to_string)
            .collect();
        assert!(listing.contains(&"ADD R3, R1, 1".to_string()));
        assert!(!listing.contains(&"MOV R3, 8".to_string()));
    }
}
