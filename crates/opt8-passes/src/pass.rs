//! Pass interface and the propose/verify/commit protocol.
//!
//! Passes never edit a [`Cfg`] directly. They describe rewrites as
//! [`BlockRewrite`]s, and [`commit`] turns them into proof obligations,
//! checks them in one batch and builds a new graph from the accepted ones.

use std::collections::BTreeSet;
use std::fmt;

use metrics::counter;
use opt8_cfg::{BasicBlock, BlockId, Cfg, Solution};
use opt8_ir::{ExitLiveness, Instruction, Invariant, InvariantSet, Reg};
use opt8_verify::{EquivalenceChecker, Observed, ProofObligation, Verdict};
use rustc_hash::FxHashMap;
use tracing::{debug, trace, warn};

/// Read-only inputs shared by every pass of one run.
#[derive(Clone, Copy, Debug)]
pub struct PassContext<'a> {
    pub checker: &'a EquivalenceChecker,
    pub exit_live: &'a ExitLiveness,
}

impl<'a> PassContext<'a> {
    #[must_use]
    pub const fn new(checker: &'a EquivalenceChecker, exit_live: &'a ExitLiveness) -> Self {
        Self { checker, exit_live }
    }

    #[must_use]
    pub const fn invariants(&self) -> &'a InvariantSet {
        self.checker.invariants()
    }
}

/// A CFG-to-CFG transformation.
pub trait Pass: Send + Sync {
    fn name(&self) -> &'static str;

    /// Propose, verify and commit rewrites. The input graph is not modified.
    fn run(&self, cfg: &Cfg, ctx: &PassContext<'_>) -> PassOutput;
}

/// Replacement of `len` instructions starting at `start`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Edit {
    pub start: usize,
    pub len: usize,
    pub replacement: Vec<Instruction>,
}

impl Edit {
    /// Replace one instruction.
    #[must_use]
    pub fn replace(idx: usize, insn: Instruction) -> Self {
        Self {
            start: idx,
            len: 1,
            replacement: vec![insn],
        }
    }

    /// Delete one instruction.
    #[must_use]
    pub const fn remove(idx: usize) -> Self {
        Self {
            start: idx,
            len: 1,
            replacement: Vec::new(),
        }
    }

    #[must_use]
    pub const fn window(start: usize, len: usize, replacement: Vec<Instruction>) -> Self {
        Self {
            start,
            len,
            replacement,
        }
    }

    const fn end(&self) -> usize {
        self.start + self.len
    }
}

/// Edits proposed for one block and the context needed to verify them.
#[derive(Clone, Debug)]
pub struct BlockRewrite {
    pub block: BlockId,
    pub end: u64,
    pub edits: Vec<Edit>,
    pub assumptions: Vec<(Reg, u64)>,
    pub observed: Observed,
    pub requires: BTreeSet<Invariant>,
}

impl BlockRewrite {
    /// Rewrite of `block` that observes everything and assumes nothing.
    #[must_use]
    pub fn new(block: &BasicBlock) -> Self {
        Self {
            block: block.id,
            end: block.end,
            edits: Vec::new(),
            assumptions: Vec::new(),
            observed: Observed::everything(),
            requires: BTreeSet::new(),
        }
    }

    #[must_use]
    pub fn assuming(mut self, assumptions: impl IntoIterator<Item = (Reg, u64)>) -> Self {
        self.assumptions.extend(assumptions);
        self
    }

    #[must_use]
    pub fn observing(mut self, observed: Observed) -> Self {
        self.observed = observed;
        self
    }

    #[must_use]
    pub fn requiring(mut self, invariant: Invariant) -> Self {
        self.requires.insert(invariant);
        self
    }

    pub fn push(&mut self, edit: Edit) {
        self.edits.push(edit);
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.edits.is_empty()
    }

    fn candidate<'e>(
        &self,
        original: &[Instruction],
        edits: impl IntoIterator<Item = &'e Edit>,
        pass: &'static str,
    ) -> Option<Candidate> {
        let proposed = apply_edits(original, edits);
        if proposed == original {
            return None;
        }
        let mut obligation = ProofObligation::new(original.to_vec(), proposed.clone(), self.end)
            .assuming(self.assumptions.iter().copied())
            .observing(self.observed.clone());
        for inv in &self.requires {
            obligation = obligation.requiring(*inv);
        }
        Some(Candidate {
            block: self.block,
            original: original.to_vec(),
            proposed,
            justification: pass,
            obligation,
        })
    }
}

/// Apply non-overlapping edits in index order. Overlapping edits after the
/// first are ignored.
#[must_use]
pub fn apply_edits<'e>(
    original: &[Instruction],
    edits: impl IntoIterator<Item = &'e Edit>,
) -> Vec<Instruction> {
    let mut edits: Vec<&Edit> = edits.into_iter().collect();
    edits.sort_by_key(|edit| edit.start);
    let mut out = Vec::with_capacity(original.len());
    let mut cursor = 0;
    for edit in edits {
        if edit.start < cursor || edit.end() > original.len() {
            continue;
        }
        out.extend_from_slice(&original[cursor..edit.start]);
        out.extend(edit.replacement.iter().cloned());
        cursor = edit.end();
    }
    out.extend_from_slice(&original[cursor..]);
    out
}

/// A rewrite awaiting (or past) verification.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Candidate {
    pub block: BlockId,
    pub original: Vec<Instruction>,
    pub proposed: Vec<Instruction>,
    /// Name of the pass that proposed it.
    pub justification: &'static str,
    pub obligation: ProofObligation,
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}: {} -> {} insns",
            self.justification,
            self.block,
            self.original.len(),
            self.proposed.len()
        )
    }
}

/// Iteration count of the analysis a pass ran.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AnalysisStats {
    pub iterations: usize,
    pub bound: usize,
    pub converged: bool,
}

impl AnalysisStats {
    #[must_use]
    pub const fn of<F>(solution: &Solution<F>) -> Self {
        Self {
            iterations: solution.iterations,
            bound: solution.bound,
            converged: solution.converged,
        }
    }
}

/// Result of one pass.
#[derive(Clone, Debug)]
pub struct PassOutput {
    pub cfg: Cfg,
    pub committed: Vec<Candidate>,
    pub rejected: Vec<(Candidate, Verdict)>,
    pub analysis: Option<AnalysisStats>,
}

impl PassOutput {
    /// Output that leaves the graph untouched.
    #[must_use]
    pub fn unchanged(cfg: &Cfg) -> Self {
        Self {
            cfg: cfg.clone(),
            committed: Vec::new(),
            rejected: Vec::new(),
            analysis: None,
        }
    }

    #[must_use]
    pub fn with_analysis(mut self, stats: AnalysisStats) -> Self {
        self.analysis = Some(stats);
        self
    }

    #[must_use]
    pub fn changed(&self) -> bool {
        !self.committed.is_empty()
    }

    /// Number of candidates checked.
    #[must_use]
    pub fn proposed(&self) -> usize {
        self.committed.len() + self.rejected.len()
    }
}

/// Verify the proposed rewrites and build the resulting graph.
///
/// All edits of a block are first checked together. If that candidate is
/// rejected and had several edits, each edit is checked on its own and the
/// first accepted one is kept. Only `Equivalent` verdicts are committed.
pub fn commit(
    pass: &'static str,
    cfg: &Cfg,
    ctx: &PassContext<'_>,
    rewrites: Vec<BlockRewrite>,
) -> PassOutput {
    let mut accepted: FxHashMap<BlockId, Candidate> = FxHashMap::default();
    let mut rejected: Vec<(Candidate, Verdict)> = Vec::new();

    let combined: Vec<(usize, Candidate)> = rewrites
        .iter()
        .enumerate()
        .filter_map(|(idx, rw)| {
            let block = cfg.block(rw.block)?;
            rw.candidate(&block.instructions, &rw.edits, pass)
                .map(|candidate| (idx, candidate))
        })
        .collect();
    let verdicts = check(ctx, pass, combined.iter().map(|(_, c)| c));

    let mut retry: Vec<Candidate> = Vec::new();
    for ((idx, candidate), verdict) in combined.into_iter().zip(verdicts) {
        if verdict.is_equivalent() {
            accepted.insert(candidate.block, candidate);
            continue;
        }
        let rw = &rewrites[idx];
        if rw.edits.len() > 1 {
            retry.extend(
                rw.edits
                    .iter()
                    .filter_map(|edit| rw.candidate(&candidate.original, [edit], pass)),
            );
        }
        rejected.push((candidate, verdict));
    }

    let verdicts = check(ctx, pass, retry.iter());
    for (candidate, verdict) in retry.into_iter().zip(verdicts) {
        if verdict.is_equivalent() && !accepted.contains_key(&candidate.block) {
            accepted.insert(candidate.block, candidate);
        } else if !verdict.is_equivalent() {
            rejected.push((candidate, verdict));
        }
    }

    for (candidate, verdict) in &rejected {
        if matches!(verdict, Verdict::Unknown(reason) if reason.is_transient()) {
            warn!(pass, block = %candidate.block, %verdict, "candidate rejected");
        } else {
            debug!(pass, block = %candidate.block, %verdict, "candidate rejected");
        }
    }

    let mut committed: Vec<Candidate> = accepted.into_values().collect();
    committed.sort_by_key(|candidate| candidate.block);
    for candidate in &committed {
        trace!(pass, %candidate, "candidate committed");
    }
    counter!("opt8_candidates_accepted_total", "pass" => pass).increment(committed.len() as u64);
    counter!("opt8_candidates_rejected_total", "pass" => pass).increment(rejected.len() as u64);

    let next = if committed.is_empty() {
        cfg.clone()
    } else {
        cfg.with_blocks_rewritten(
            committed
                .iter()
                .map(|candidate| (candidate.block, candidate.proposed.clone())),
        )
    };
    PassOutput {
        cfg: next,
        committed,
        rejected,
        analysis: None,
    }
}

fn check<'c>(
    ctx: &PassContext<'_>,
    pass: &'static str,
    candidates: impl Iterator<Item = &'c Candidate>,
) -> Vec<Verdict> {
    let obligations: Vec<ProofObligation> =
        candidates.map(|candidate| candidate.obligation.clone()).collect();
    if obligations.is_empty() {
        return Vec::new();
    }
    counter!("opt8_candidates_proposed_total", "pass" => pass).increment(obligations.len() as u64);
    ctx.checker.check_all(obligations)
}
