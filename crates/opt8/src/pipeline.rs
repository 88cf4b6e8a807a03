//! Single-function pipeline: function → CFG → passes → linear program.

use std::time::{Duration, Instant};

use opt8_cfg::{Cfg, LinearProgram};
use opt8_ir::Function;
use opt8_passes::{PassContext, PassManager, PipelineResult};
use opt8_verify::EquivalenceChecker;
use tracing::{info, info_span, warn};

use crate::Result;
use crate::metrics;

/// Outcome of optimizing one function.
#[derive(Clone, Debug)]
pub struct Optimized {
    pub name: String,
    /// Graph built from the input.
    pub original: Cfg,
    /// Final graph and per-pass reports.
    pub result: PipelineResult,
    /// Final graph in block address order.
    pub program: LinearProgram,
    pub duration: Duration,
}

impl Optimized {
    #[must_use]
    pub fn instructions_before(&self) -> usize {
        self.original.instruction_count()
    }

    #[must_use]
    pub fn instructions_after(&self) -> usize {
        self.program.instructions.len()
    }

    /// Whether any rewrite was committed.
    #[must_use]
    pub fn changed(&self) -> bool {
        self.result.committed().next().is_some()
    }
}

/// Build the CFG of `func` and run `manager` over it.
pub fn optimize_function(
    func: &Function,
    manager: &PassManager,
    checker: &EquivalenceChecker,
) -> Result<Optimized> {
    let _span = info_span!("optimize", function = %func.name).entered();
    let start = Instant::now();

    let original = Cfg::build(func)?;
    for diagnostic in original.diagnostics() {
        warn!(%diagnostic, "imprecise control flow");
    }

    let ctx = PassContext::new(checker, &func.exit_live);
    let result = manager.run(&original, &ctx);
    result.cfg.validate()?;
    let program = result.cfg.linearize();
    let duration = start.elapsed();

    let optimized = Optimized {
        name: func.name.clone(),
        original,
        result,
        program,
        duration,
    };
    info!(
        before = optimized.instructions_before(),
        after = optimized.instructions_after(),
        committed = optimized.result.committed().count(),
        rejected = optimized.result.rejected(),
        "function optimized"
    );
    metrics::record_function(
        duration,
        optimized.instructions_before(),
        optimized.instructions_after(),
    );
    metrics::record_cache_size(checker.cache().len());
    Ok(optimized)
}
