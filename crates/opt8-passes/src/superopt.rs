//! Search-based superoptimization of straight-line ALU windows.
//!
//! Every run of register-only arithmetic is split into windows. For each
//! window the search tries shorter sequences over the same registers and
//! constants: all single instructions first, then random samples of each
//! longer length. Candidates that agree with the window on a handful of
//! concrete inputs are sent to the checker, and the shortest proven one
//! wins. The result is best effort and depends on the seed.

use opt8_cfg::{BasicBlock, Cfg};
use opt8_ir::{Instruction, Opcode, Operand, Reg};
use opt8_symbolic::{ConcreteMachine, SeedEnv, mix};
use opt8_verify::{Observed, ProofObligation};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rustc_hash::FxHashSet;
use tracing::{debug, trace, trace_span};

use crate::config::{DEFAULT_BUDGET, DEFAULT_MAX_LEN, MAX_SEQUENCE_LEN};
use crate::liveness::{LiveSet, Liveness, analyze};
use crate::pass::{AnalysisStats, BlockRewrite, Edit, Pass, PassContext, PassOutput, commit};

/// Concrete inputs every survivor must agree on.
const TEST_VECTORS: u64 = 8;

/// Survivors of one length sent to the checker.
const MAX_PROOFS: usize = 16;

const BINARY: [Opcode; 8] = [
    Opcode::Add,
    Opcode::Sub,
    Opcode::Mul,
    Opcode::And,
    Opcode::Or,
    Opcode::Xor,
    Opcode::Shl,
    Opcode::Shr,
];

const UNARY: [Opcode; 2] = [Opcode::Not, Opcode::Neg];

#[derive(Clone, Copy, Debug)]
pub struct Superoptimizer {
    budget: usize,
    max_len: usize,
    seed: u64,
}

impl Default for Superoptimizer {
    fn default() -> Self {
        Self::new(DEFAULT_BUDGET, DEFAULT_MAX_LEN, 0)
    }
}

impl Superoptimizer {
    /// `budget` bounds the sequences tried per window; `max_len` the length
    /// of the sequences searched.
    #[must_use]
    pub fn new(budget: usize, max_len: usize, seed: u64) -> Self {
        Self {
            budget: budget.max(1),
            max_len: max_len.clamp(1, MAX_SEQUENCE_LEN),
            seed,
        }
    }

    /// Shortest verified replacement for `original`, if any.
    fn search(
        &self,
        original: &[Instruction],
        live: &LiveSet,
        ctx: &PassContext<'_>,
    ) -> Option<Vec<Instruction>> {
        let space = SearchSpace::new(original, live)?;
        let end = original.last()?.next_address();
        let mut rng = StdRng::seed_from_u64(self.seed ^ mix(original[0].address));
        let mut tried = 0usize;
        let longest = (original.len() - 1).min(self.max_len);

        for length in 1..=longest {
            let mut survivors: Vec<Vec<Instruction>> = Vec::new();
            if length == 1 {
                for candidate in space.singles() {
                    if tried >= self.budget || survivors.len() >= MAX_PROOFS {
                        break;
                    }
                    tried += 1;
                    if space.agrees(&candidate, end) {
                        survivors.push(candidate);
                    }
                }
            } else {
                // Split what is left evenly over the remaining lengths.
                let share = self.budget.saturating_sub(tried) / (longest - length + 1);
                let mut seen: FxHashSet<Vec<Instruction>> = FxHashSet::default();
                for _ in 0..share {
                    if survivors.len() >= MAX_PROOFS {
                        break;
                    }
                    tried += 1;
                    let candidate = space.sample(&mut rng, length);
                    if seen.insert(candidate.clone()) && space.agrees(&candidate, end) {
                        survivors.push(candidate);
                    }
                }
            }
            if survivors.is_empty() {
                continue;
            }

            trace!(length, survivors = survivors.len(), tried, "superopt survivors");
            let observed = Observed::regs(live.regs.iter().copied(), true);
            let obligations = survivors
                .iter()
                .map(|candidate| {
                    ProofObligation::new(original.to_vec(), space.placed(candidate), end)
                        .observing(observed.clone())
                })
                .collect();
            let verdicts = ctx.checker.check_all(obligations);
            if let Some(idx) = verdicts.iter().position(|verdict| verdict.is_equivalent()) {
                return Some(space.placed(&survivors[idx]));
            }
        }
        None
    }
}

impl Pass for Superoptimizer {
    fn name(&self) -> &'static str {
        "superopt"
    }

    fn run(&self, cfg: &Cfg, ctx: &PassContext<'_>) -> PassOutput {
        let _span = trace_span!("superopt", budget = self.budget, max_len = self.max_len).entered();
        let liveness = analyze(cfg, ctx.exit_live, ctx.invariants());
        let stats = AnalysisStats::of(&liveness.solution);
        let analysis = Liveness::new(&liveness.universe, ctx.exit_live, ctx.invariants());

        let mut rewrites = Vec::new();
        for block in cfg.blocks() {
            let live_out = liveness.live_out(block.id);
            let after = analysis.live_after(block, &live_out);
            let mut observed = live_out.observed();
            observed.memory = true;
            let mut rewrite = BlockRewrite::new(block).observing(observed);
            for (start, len) in windows(block, self.max_len + 1) {
                let original = &block.instructions[start..start + len];
                if let Some(best) = self.search(original, &after[start + len - 1], ctx) {
                    debug!(
                        block = %block.id,
                        from = len,
                        to = best.len(),
                        "shorter sequence found"
                    );
                    rewrite.push(Edit::window(start, len, best));
                }
            }
            if !rewrite.is_empty() {
                rewrites.push(rewrite);
            }
        }
        commit(self.name(), cfg, ctx, rewrites).with_analysis(stats)
    }
}

/// Whether the search can produce a replacement for `insn`.
fn searchable(insn: &Instruction) -> bool {
    matches!(insn.opcode, Opcode::Mov | Opcode::Nop)
        || insn.opcode.is_unary_alu()
        || insn.opcode.is_binary_alu()
}

/// Windows of at most `size` searchable instructions, each at least two
/// long.
fn windows(block: &BasicBlock, size: usize) -> Vec<(usize, usize)> {
    let mut out = Vec::new();
    let mut idx = 0;
    while idx < block.len() {
        if !searchable(&block.instructions[idx]) {
            idx += 1;
            continue;
        }
        let run = block.instructions[idx..]
            .iter()
            .take_while(|insn| searchable(insn))
            .count();
        let mut start = idx;
        while start < idx + run {
            let len = size.min(idx + run - start);
            if len >= 2 {
                out.push((start, len));
            }
            start += len;
        }
        idx += run;
    }
    out
}

/// Registers and constants a window computes with, and what it must
/// produce.
struct SearchSpace<'a> {
    original: &'a [Instruction],
    /// Written registers that are live afterwards.
    targets: Vec<Reg>,
    /// Registers a candidate may write.
    dsts: Vec<Reg>,
    pool: Vec<Operand>,
    /// Target values of the window under each test vector.
    expected: Vec<Vec<u64>>,
}

impl<'a> SearchSpace<'a> {
    fn new(original: &'a [Instruction], live: &LiveSet) -> Option<Self> {
        let mut dsts: Vec<Reg> = Vec::new();
        let mut pool: Vec<Operand> = Vec::new();
        for insn in original {
            for reg in insn.written_regs() {
                if !dsts.contains(&reg) {
                    dsts.push(reg);
                }
            }
            for op in insn.value_sources() {
                if !pool.contains(op) {
                    pool.push(*op);
                }
            }
        }
        for op in [Operand::Imm(0), Operand::Imm(1)]
            .into_iter()
            .chain(dsts.iter().map(|reg| Operand::Reg(*reg)))
        {
            if !pool.contains(&op) {
                pool.push(op);
            }
        }
        let targets: Vec<Reg> = dsts.iter().copied().filter(|reg| live.is_live(*reg)).collect();
        // Nothing live is produced; removing the window is a job for DCE.
        if targets.is_empty() {
            return None;
        }
        let end = original.last()?.next_address();
        let expected = (0..TEST_VECTORS)
            .map(|seed| outputs(original, end, seed, &targets))
            .collect();
        Some(Self {
            original,
            targets,
            dsts,
            pool,
            expected,
        })
    }

    /// Whether `candidate` matches the window on every test vector.
    fn agrees(&self, candidate: &[Instruction], end: u64) -> bool {
        (0..TEST_VECTORS)
            .zip(&self.expected)
            .all(|(seed, expected)| outputs(candidate, end, seed, &self.targets) == *expected)
    }

    /// Every single-instruction sequence, cheapest shapes first.
    fn singles(&self) -> impl Iterator<Item = Vec<Instruction>> + '_ {
        let moves = self.dsts.iter().flat_map(move |dst| {
            self.pool
                .iter()
                .map(move |src| Instruction::mov(0, *dst, *src))
                .chain(UNARY.iter().flat_map(move |op| {
                    self.pool
                        .iter()
                        .map(move |src| Instruction::unary(0, *op, *dst, *src))
                }))
        });
        let binaries = self.dsts.iter().flat_map(move |dst| {
            BINARY.iter().flat_map(move |op| {
                self.pool.iter().flat_map(move |lhs| {
                    self.pool
                        .iter()
                        .filter(move |rhs| lhs.as_reg().is_some() || rhs.as_reg().is_some())
                        .map(move |rhs| Instruction::alu(0, *op, *dst, *lhs, *rhs))
                })
            })
        });
        moves.chain(binaries).map(|insn| vec![insn])
    }

    /// A random sequence of `length` instructions.
    fn sample(&self, rng: &mut StdRng, length: usize) -> Vec<Instruction> {
        (0..length)
            .map(|_| {
                let dst = self.dsts[rng.gen_range(0..self.dsts.len())];
                let lhs = self.pool[rng.gen_range(0..self.pool.len())];
                let rhs = self.pool[rng.gen_range(0..self.pool.len())];
                match rng.gen_range(0..BINARY.len() + UNARY.len() + 1) {
                    0 => Instruction::mov(0, dst, lhs),
                    n if n <= UNARY.len() => Instruction::unary(0, UNARY[n - 1], dst, lhs),
                    n => Instruction::alu(0, BINARY[n - 1 - UNARY.len()], dst, lhs, rhs),
                }
            })
            .collect()
    }

    /// Give a candidate the addresses and sizes of the window's leading
    /// instructions.
    fn placed(&self, candidate: &[Instruction]) -> Vec<Instruction> {
        candidate
            .iter()
            .zip(self.original)
            .map(|(insn, slot)| {
                let mut insn = insn.clone();
                insn.address = slot.address;
                insn.size = slot.size;
                insn
            })
            .collect()
    }
}

fn outputs(insns: &[Instruction], end: u64, seed: u64, targets: &[Reg]) -> Vec<u64> {
    let env = SeedEnv::new(mix(seed ^ 0x5EED));
    let mut machine = ConcreteMachine::new(&env);
    machine.run(insns, end);
    targets.iter().map(|reg| machine.reg(*reg)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use opt8_ir::{ExitLiveness, Function, InvariantSet, Width, parse_listing};
    use opt8_verify::EquivalenceChecker;

    fn r(i: u8) -> Reg {
        Reg::new(i, Width::W8)
    }

    fn build(text: &str, live: &[u8]) -> (Cfg, ExitLiveness) {
        let func = Function::new("f", parse_listing(text, Width::W8).unwrap())
            .with_exit_live(live.iter().map(|i| r(*i)));
        (Cfg::build(&func).unwrap(), func.exit_live)
    }

    fn run(text: &str, live: &[u8], pass: Superoptimizer) -> PassOutput {
        let (cfg, exit_live) = build(text, live);
        let checker = EquivalenceChecker::builtin(InvariantSet::default()).with_workers(2);
        pass.run(&cfg, &PassContext::new(&checker, &exit_live))
    }

    #[test]
    fn test_finds_single_instruction_replacement() {
        // R2 = R1 + R1 needs only one instruction.
        let out = run(
            "0x200: MOV R2, R1\n0x201: ADD R2, R2, R2\n0x202: RET\n",
            &[1, 2],
            Superoptimizer::default(),
        );
        let block = out.cfg.block(out.cfg.entry()).unwrap();
        assert_eq!(block.len(), 2);
        assert_eq!(out.committed.len(), 1);
        let first = &block.instructions[0];
        assert_eq!(first.dst(), Some(r(2)));
        assert_eq!(first.address, 0x200);
    }

    #[test]
    fn test_dead_temporaries_are_free() {
        let out = run(
            "0x200: MOV R3, R1\n0x201: XOR R3, R3, 0xff\n0x202: MOV R2, R3\n0x203: RET\n",
            &[2],
            Superoptimizer::default(),
        );
        let block = out.cfg.block(out.cfg.entry()).unwrap();
        assert_eq!(block.len(), 2);
    }

    #[test]
    fn test_no_change_when_nothing_shorter() {
        let out = run(
            "0x200: ADD R3, R1, R2\n0x201: RET\n",
            &[3],
            Superoptimizer::new(50, 2, 7),
        );
        assert!(out.committed.is_empty());
    }

    #[test]
    fn test_windows_split_runs() {
        let (cfg, _) = build(
            "0x200: MOV R1, 1\n0x201: MOV R2, 2\n0x202: MOV R3, 3\n0x203: IN R4, 1\n\
             0x204: MOV R5, 5\n0x205: MOV R6, 6\n0x206: RET\n",
            &[],
        );
        let block = cfg.block(cfg.entry()).unwrap();
        assert_eq!(windows(block, 2), vec![(0, 2), (4, 2)]);
        assert_eq!(windows(block, 3), vec![(0, 3), (4, 2)]);
    }

    #[test]
    fn test_search_is_deterministic_for_a_seed() {
        let text = "0x200: MOV R3, R1\n0x201: ADD R3, R3, 1\n0x202: ADD R3, R3, 1\n\
                    0x203: MOV R2, R3\n0x204: RET\n";
        let a = run(text, &[2], Superoptimizer::new(300, 3, 11));
        let b = run(text, &[2], Superoptimizer::new(300, 3, 11));
        assert_eq!(a.cfg, b.cfg);
    }
}
