//! opt8 - verified optimizer for machine-level instruction streams.
//!
//! Decoded functions are split into basic blocks, linked into a control
//! flow graph and run through a pipeline of optimization passes. Every
//! rewrite is proven equivalent to the code it replaces before it is
//! committed.
//!
//! # Example
//!
//! ```ignore
//! use opt8::{Optimizer, OptimizerConfig, Function, Width, parse_listing};
//!
//! let insns = parse_listing("0x0: MOV R1, 2\n0x1: ADD R2, R1, R1\n0x2: RET", Width::W8)?;
//! let optimizer = Optimizer::new(OptimizerConfig::default());
//! let optimized = optimizer.optimize(&Function::new("f", insns))?;
//! println!("{}", optimized.program);
//! ```

// Re-export from sub-crates
pub use opt8_cfg::{
    BasicBlock, BlockId, Cfg, CfgError, Diagnostic, EdgeKind, ExitKind, LinearProgram,
};
pub use opt8_chip8::{Chip8Error, PROGRAM_BASE, decode_function, decode_program};
pub use opt8_ir::{
    ExitLiveness, Function, Instruction, InvalidInvariant, Invariant, InvariantSet, ListingError,
    Opcode, Operand, Reg, Width, format_listing, parse_listing,
};
pub use opt8_passes::{
    Candidate, ConfigError, Pass, PassManager, PassReport, PassSpec, PipelineConfig, PipelineResult,
};
pub use opt8_verify::{
    DEFAULT_TIMEOUT, EquivalenceChecker, ProofCache, Solver, SolverFactory, UnknownReason, Verdict,
};

mod error;
pub mod metrics;
mod pipeline;
mod source;

pub use error::*;
pub use pipeline::*;
pub use source::*;

use std::sync::Arc;
use std::time::Duration;

use rayon::prelude::*;

/// Run-wide optimizer settings.
#[derive(Clone, Debug)]
pub struct OptimizerConfig {
    pub invariants: InvariantSet,
    pub pipeline: PipelineConfig,
    /// Proof worker threads.
    pub workers: usize,
    /// Time allowed for each solver call.
    pub solver_timeout: Duration,
    /// Maximum pipeline repetitions per function.
    pub rounds: usize,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            invariants: InvariantSet::default(),
            pipeline: PipelineConfig::default(),
            workers: num_cpus::get(),
            solver_timeout: DEFAULT_TIMEOUT,
            rounds: 1,
        }
    }
}

impl OptimizerConfig {
    #[must_use]
    pub fn with_invariants(mut self, invariants: InvariantSet) -> Self {
        self.invariants = invariants;
        self
    }

    #[must_use]
    pub fn with_pipeline(mut self, pipeline: PipelineConfig) -> Self {
        self.pipeline = pipeline;
        self
    }

    /// Proof worker threads; 0 means one per CPU.
    #[must_use]
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = if workers == 0 { num_cpus::get() } else { workers };
        self
    }

    #[must_use]
    pub const fn with_solver_timeout(mut self, timeout: Duration) -> Self {
        self.solver_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_rounds(mut self, rounds: usize) -> Self {
        self.rounds = rounds.max(1);
        self
    }
}

/// Optimizes functions under one configuration. Shares one proof cache
/// across every function it sees.
pub struct Optimizer {
    config: OptimizerConfig,
    checker: EquivalenceChecker,
    manager: PassManager,
}

impl Optimizer {
    /// Optimizer backed by the built-in solver.
    #[must_use]
    pub fn new(config: OptimizerConfig) -> Self {
        let checker = EquivalenceChecker::builtin(config.invariants.clone());
        Self::with_checker(config, checker)
    }

    /// Optimizer backed by a custom solver.
    #[must_use]
    pub fn with_solver(config: OptimizerConfig, factory: Arc<dyn SolverFactory>) -> Self {
        let checker = EquivalenceChecker::new(config.invariants.clone(), factory);
        Self::with_checker(config, checker)
    }

    fn with_checker(config: OptimizerConfig, checker: EquivalenceChecker) -> Self {
        let checker = checker
            .with_workers(config.workers)
            .with_timeout(config.solver_timeout);
        let manager = PassManager::from_config(&config.pipeline).with_rounds(config.rounds);
        Self {
            config,
            checker,
            manager,
        }
    }

    #[must_use]
    pub const fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    #[must_use]
    pub const fn checker(&self) -> &EquivalenceChecker {
        &self.checker
    }

    /// Optimize one function.
    pub fn optimize(&self, func: &Function) -> Result<Optimized> {
        optimize_function(func, &self.manager, &self.checker)
    }

    /// Optimize independent functions in parallel. Results are in input
    /// order; one function failing does not affect the others.
    pub fn optimize_all(&self, funcs: &[Function]) -> Vec<Result<Optimized>> {
        funcs.par_iter().map(|func| self.optimize(func)).collect()
    }
}
