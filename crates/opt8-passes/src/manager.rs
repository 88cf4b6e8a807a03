//! Pass registry and the sequential pass driver.

use std::fmt;
use std::time::{Duration, Instant};

use opt8_cfg::Cfg;
use opt8_ir::Invariant;
use tracing::{debug, info_span, warn};

use crate::config::{PassSpec, PipelineConfig};
use crate::const_prop::ConstantPropagation;
use crate::dce::DeadCodeElimination;
use crate::dse::DeadStoreElimination;
use crate::pass::{AnalysisStats, Candidate, Pass, PassContext};
use crate::peephole::Peephole;
use crate::superopt::Superoptimizer;

/// Instantiate the pass described by `spec`.
#[must_use]
pub fn create_pass(spec: &PassSpec) -> Box<dyn Pass> {
    match *spec {
        PassSpec::ConstProp => Box::new(ConstantPropagation),
        PassSpec::Dse => Box::new(DeadStoreElimination),
        PassSpec::Dce => Box::new(DeadCodeElimination),
        PassSpec::Peephole { window } => Box::new(Peephole::new(window)),
        PassSpec::Superopt {
            budget,
            max_len,
            seed,
        } => Box::new(Superoptimizer::new(budget, max_len, seed)),
    }
}

/// What one pass did in one round.
#[derive(Clone, Debug)]
pub struct PassReport {
    pub pass: &'static str,
    pub round: usize,
    pub committed: Vec<Candidate>,
    pub rejected: usize,
    pub analysis: Option<AnalysisStats>,
    pub duration: Duration,
}

impl fmt::Display for PassReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (round {}): {} committed, {} rejected",
            self.pass,
            self.round,
            self.committed.len(),
            self.rejected
        )?;
        if let Some(stats) = &self.analysis {
            write!(f, ", fixpoint in {}/{} iterations", stats.iterations, stats.bound)?;
        }
        write!(f, " [{:.2?}]", self.duration)
    }
}

/// Final graph and the audit trail of a pipeline run.
#[derive(Clone, Debug)]
pub struct PipelineResult {
    pub cfg: Cfg,
    pub reports: Vec<PassReport>,
    /// Why the pipeline did not run, if it did not.
    pub skipped: Option<String>,
}

impl PipelineResult {
    /// All committed candidates in commit order.
    pub fn committed(&self) -> impl Iterator<Item = &Candidate> {
        self.reports.iter().flat_map(|report| report.committed.iter())
    }

    #[must_use]
    pub fn rejected(&self) -> usize {
        self.reports.iter().map(|report| report.rejected).sum()
    }
}

/// Runs an ordered list of passes over a CFG, each consuming the previous
/// pass's output.
pub struct PassManager {
    passes: Vec<Box<dyn Pass>>,
    rounds: usize,
}

impl Default for PassManager {
    fn default() -> Self {
        Self::from_config(&PipelineConfig::default())
    }
}

impl PassManager {
    #[must_use]
    pub fn new(passes: Vec<Box<dyn Pass>>) -> Self {
        Self { passes, rounds: 1 }
    }

    #[must_use]
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(config.passes.iter().map(create_pass).collect())
    }

    /// Repeat the pipeline up to `rounds` times, stopping early once a
    /// round commits nothing.
    #[must_use]
    pub fn with_rounds(mut self, rounds: usize) -> Self {
        self.rounds = rounds.max(1);
        self
    }

    pub fn pass_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.passes.iter().map(|pass| pass.name())
    }

    pub fn run(&self, cfg: &Cfg, ctx: &PassContext<'_>) -> PipelineResult {
        let _span = info_span!("pipeline", blocks = cfg.len()).entered();
        if let Some(reason) = self_modification_hazard(cfg, ctx) {
            warn!(%reason, "leaving function untouched");
            return PipelineResult {
                cfg: cfg.clone(),
                reports: Vec::new(),
                skipped: Some(reason),
            };
        }

        let mut current = cfg.clone();
        let mut reports = Vec::new();
        for round in 1..=self.rounds {
            let mut changed = false;
            for pass in &self.passes {
                let start = Instant::now();
                let output = pass.run(&current, ctx);
                let report = PassReport {
                    pass: pass.name(),
                    round,
                    rejected: output.rejected.len(),
                    analysis: output.analysis,
                    committed: output.committed,
                    duration: start.elapsed(),
                };
                debug!(%report, "pass finished");
                changed |= !report.committed.is_empty();
                current = output.cfg;
                reports.push(report);
            }
            if !changed {
                break;
            }
        }
        PipelineResult {
            cfg: current,
            reports,
            skipped: None,
        }
    }
}

/// Without the no-self-modifying-code invariant, code that writes memory
/// could be rewriting itself, so nothing about it can be trusted.
fn self_modification_hazard(cfg: &Cfg, ctx: &PassContext<'_>) -> Option<String> {
    if ctx.invariants().holds(Invariant::NoSelfModifyingCode) {
        return None;
    }
    let writer = cfg
        .blocks()
        .flat_map(|block| block.instructions.iter())
        .find(|insn| insn.writes_memory() || insn.is_barrier())?;
    Some(format!(
        "memory write at {:#06x} without the no-self-modifying-code invariant",
        writer.address
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use opt8_ir::{ExitLiveness, Function, InvariantSet, Opcode, Reg, Width, parse_listing};
    use opt8_verify::EquivalenceChecker;

    fn build(text: &str, live: &[u8]) -> (Cfg, ExitLiveness) {
        let func = Function::new("f", parse_listing(text, Width::W8).unwrap())
            .with_exit_live(live.iter().map(|i| Reg::new(*i, Width::W8)));
        (Cfg::build(&func).unwrap(), func.exit_live)
    }

    #[test]
    fn test_default_pipeline_order() {
        let manager = PassManager::default();
        let names: Vec<_> = manager.pass_names().collect();
        assert_eq!(names, vec!["const-prop", "dse", "dce", "peephole"]);
    }

    #[test]
    fn test_create_pass_from_config() {
        let config = PipelineConfig::parse("peephole:window=2,superopt:budget=10").unwrap();
        let manager = PassManager::from_config(&config);
        let names: Vec<_> = manager.pass_names().collect();
        assert_eq!(names, vec!["peephole", "superopt"]);
    }

    #[test]
    fn test_constant_folding_then_cleanup() {
        let (cfg, exit_live) = build(
            "0x200: MOV R1, 2\n0x201: MOV R2, 3\n0x202: ADD R3, R1, R2\n0x203: RET\n",
            &[3],
        );
        let checker = EquivalenceChecker::builtin(InvariantSet::default()).with_workers(2);
        let result = PassManager::default().run(&cfg, &PassContext::new(&checker, &exit_live));
        assert!(result.skipped.is_none());
        let block = result.cfg.block(result.cfg.entry()).unwrap();
        let opcodes: Vec<Opcode> = block.instructions.iter().map(|i| i.opcode).collect();
        assert_eq!(opcodes, vec![Opcode::Mov, Opcode::Return]);
        assert_eq!(block.instructions[0].to_string(), "MOV R3, 5");
        assert_eq!(result.reports.len(), 4);
        assert!(result.committed().count() >= 2);
    }

    #[test]
    fn test_rounds_stop_when_nothing_changes() {
        let (cfg, exit_live) = build("0x200: ADD R3, R1, R2\n0x201: RET\n", &[3]);
        let checker = EquivalenceChecker::builtin(InvariantSet::default()).with_workers(1);
        let result = PassManager::default()
            .with_rounds(5)
            .run(&cfg, &PassContext::new(&checker, &exit_live));
        assert_eq!(result.reports.len(), 4);
        assert!(result.reports.iter().all(|report| report.round == 1));
        assert_eq!(result.cfg, cfg);
    }

    #[test]
    fn test_memory_writes_without_invariant_skip_everything() {
        let (cfg, exit_live) = build(
            "0x200: MOV R1, 2\n0x201: NOP\n0x202: STORE [R3], R1\n0x203: RET\n",
            &[1],
        );
        let invariants = InvariantSet::default().with(Invariant::NoSelfModifyingCode, false);
        let checker = EquivalenceChecker::builtin(invariants);
        let result = PassManager::default().run(&cfg, &PassContext::new(&checker, &exit_live));
        assert!(result.skipped.is_some());
        assert!(result.reports.is_empty());
        assert_eq!(result.cfg, cfg);
    }

    #[test]
    fn test_register_only_code_runs_without_invariant() {
        let (cfg, exit_live) = build("0x200: MOV R1, 2\n0x201: NOP\n0x202: RET\n", &[1]);
        let invariants = InvariantSet::default().with(Invariant::NoSelfModifyingCode, false);
        let checker = EquivalenceChecker::builtin(invariants);
        let result = PassManager::default().run(&cfg, &PassContext::new(&checker, &exit_live));
        assert!(result.skipped.is_none());
        assert_eq!(result.cfg.instruction_count(), 2);
    }
}
