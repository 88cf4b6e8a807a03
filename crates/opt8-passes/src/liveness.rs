//! Backward liveness of registers and memory.
//!
//! Memory is tracked as a single bit: it is live at a point if some path
//! from there reads memory (a load, a memory-reading I/O operation or a
//! call) or leaves the function while memory is externally observable.
//! Stores never kill memory liveness.

use std::collections::BTreeSet;

use opt8_cfg::{
    BasicBlock, BlockId, Cfg, Dataflow, Direction, ExitKind, Solution, is_fixpoint, solve,
};
use opt8_ir::{ExitLiveness, Instruction, Invariant, InvariantSet, Reg};
use opt8_verify::Observed;
use tracing::trace_span;

/// Locations that may be read later.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LiveSet {
    pub regs: BTreeSet<Reg>,
    pub memory: bool,
}

impl LiveSet {
    /// Everything in `universe` plus memory.
    #[must_use]
    pub fn everything(universe: &BTreeSet<Reg>) -> Self {
        Self {
            regs: universe.clone(),
            memory: true,
        }
    }

    #[must_use]
    pub fn is_live(&self, reg: Reg) -> bool {
        self.regs.contains(&reg)
    }

    /// Union `other` into this set. Returns true if anything changed.
    pub fn union(&mut self, other: &Self) -> bool {
        let before = self.regs.len();
        self.regs.extend(other.regs.iter().copied());
        let changed = self.regs.len() != before || (other.memory && !self.memory);
        self.memory |= other.memory;
        changed
    }

    /// Transform the set live after `insn` into the set live before it.
    pub fn step_back(&mut self, insn: &Instruction, universe: &BTreeSet<Reg>) {
        if insn.is_barrier() {
            self.regs.extend(universe.iter().copied());
            self.memory = true;
            return;
        }
        for reg in insn.written_regs() {
            self.regs.remove(&reg);
        }
        self.regs.extend(insn.read_regs());
        self.memory |= insn.reads_memory();
    }

    /// Locations a rewrite of the region ending here must preserve.
    #[must_use]
    pub fn observed(&self) -> Observed {
        Observed::regs(self.regs.iter().copied(), self.memory)
    }

    /// Number of live locations, counting memory as one.
    #[must_use]
    pub fn len(&self) -> usize {
        self.regs.len() + usize::from(self.memory)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Liveness as a backward dataflow problem.
#[derive(Clone, Debug)]
pub struct Liveness<'a> {
    universe: &'a BTreeSet<Reg>,
    exit_live: &'a ExitLiveness,
    memory_observed_at_exit: bool,
}

impl<'a> Liveness<'a> {
    #[must_use]
    pub fn new(
        universe: &'a BTreeSet<Reg>,
        exit_live: &'a ExitLiveness,
        invariants: &InvariantSet,
    ) -> Self {
        Self {
            universe,
            exit_live,
            memory_observed_at_exit: !invariants.holds(Invariant::NoExternalMemoryObservers),
        }
    }

    /// Worklist bound: every block is visited once, then again at most
    /// once per location that becomes live at its exit.
    #[must_use]
    pub fn bound(&self, cfg: &Cfg) -> usize {
        cfg.len().max(1) * (self.universe.len() + 2)
    }

    /// Live sets after each instruction of `block`, given the set live at
    /// its exit.
    #[must_use]
    pub fn live_after(&self, block: &BasicBlock, live_out: &LiveSet) -> Vec<LiveSet> {
        let mut after = vec![LiveSet::default(); block.len()];
        let mut live = live_out.clone();
        for (idx, insn) in block.instructions.iter().enumerate().rev() {
            after[idx] = live.clone();
            live.step_back(insn, self.universe);
        }
        after
    }
}

impl Dataflow for Liveness<'_> {
    type Fact = LiveSet;

    fn direction(&self) -> Direction {
        Direction::Backward
    }

    fn bottom(&self) -> LiveSet {
        LiveSet::default()
    }

    fn boundary(&self, _cfg: &Cfg, block: &BasicBlock) -> LiveSet {
        if block.exit != ExitKind::Return {
            // Unknown successors may read anything.
            return LiveSet::everything(self.universe);
        }
        let regs = match self.exit_live {
            ExitLiveness::All => self.universe.clone(),
            ExitLiveness::Regs(regs) => regs.clone(),
        };
        LiveSet {
            regs,
            memory: self.memory_observed_at_exit,
        }
    }

    fn join(&self, acc: &mut LiveSet, other: &LiveSet) -> bool {
        acc.union(other)
    }

    fn transfer(&self, block: &BasicBlock, input: &LiveSet) -> LiveSet {
        let mut live = input.clone();
        for insn in block.instructions.iter().rev() {
            live.step_back(insn, self.universe);
        }
        live
    }
}

/// Liveness facts for a whole graph.
#[derive(Clone, Debug)]
pub struct LivenessResult {
    /// `input` holds the set live at each block's exit, `output` the set
    /// live at its entry.
    pub solution: Solution<LiveSet>,
    pub universe: BTreeSet<Reg>,
}

impl LivenessResult {
    /// Set live at the exit of `block`. Conservative if unknown.
    #[must_use]
    pub fn live_out(&self, block: BlockId) -> LiveSet {
        if !self.solution.converged {
            return LiveSet::everything(&self.universe);
        }
        self.solution
            .input
            .get(&block)
            .cloned()
            .unwrap_or_else(|| LiveSet::everything(&self.universe))
    }

    /// Set live at the entry of `block`. Conservative if unknown.
    #[must_use]
    pub fn live_in(&self, block: BlockId) -> LiveSet {
        if !self.solution.converged {
            return LiveSet::everything(&self.universe);
        }
        self.solution
            .output
            .get(&block)
            .cloned()
            .unwrap_or_else(|| LiveSet::everything(&self.universe))
    }
}

/// Every register the graph mentions, plus the registers live at exit.
#[must_use]
pub fn register_universe(cfg: &Cfg, exit_live: &ExitLiveness) -> BTreeSet<Reg> {
    let mut regs = BTreeSet::new();
    for insn in cfg.blocks().flat_map(|block| block.instructions.iter()) {
        regs.extend(insn.read_regs());
        regs.extend(insn.written_regs());
        if let Some(mem) = insn.mem() {
            regs.extend(mem.base);
        }
    }
    if let ExitLiveness::Regs(live) = exit_live {
        regs.extend(live.iter().copied());
    }
    regs
}

/// Solve liveness over `cfg`.
#[must_use]
pub fn analyze(cfg: &Cfg, exit_live: &ExitLiveness, invariants: &InvariantSet) -> LivenessResult {
    let _span = trace_span!("liveness", blocks = cfg.len()).entered();
    let universe = register_universe(cfg, exit_live);
    let analysis = Liveness::new(&universe, exit_live, invariants);
    let solution = solve(&analysis, cfg, analysis.bound(cfg));
    debug_assert!(!solution.converged || is_fixpoint(&analysis, cfg, &solution));
    LivenessResult { solution, universe }
}
