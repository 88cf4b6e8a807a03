//! Equivalence checking of an original and a candidate sequence.
//!
//! Both sequences are interpreted symbolically from the same entry state.
//! Every observation (live registers, written memory, exit address, I/O
//! operands, state at calls) becomes a pair of expressions, and the solver
//! is asked whether any pair can differ. Unsat proves equivalence.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use opt8_ir::{Expr, ExprRef, Invariant, InvariantSet, Reg, SymbolicValue};
use opt8_symbolic::{Event, Exit, SymbolicInterpreter, SymbolicState};
use tracing::{debug, trace, trace_span};

use crate::cache::{CacheKey, ProofCache};
use crate::obligation::{ObservedRegs, ProofObligation};
use crate::pool::{ProofPool, ProofTask};
use crate::solver::{
    BuiltinSolverFactory, CancelToken, Incomplete, SatResult, Solver, SolverFactory,
};
use crate::verdict::{Counterexample, UnknownReason, Verdict};

/// Default solver time per obligation.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

/// A value the two sequences must agree on.
#[derive(Debug)]
struct Observation {
    what: String,
    original: ExprRef,
    candidate: ExprRef,
}

/// Why observations could not be collected.
#[derive(Debug)]
enum Mismatch {
    /// The sequences differ in a way no input can hide.
    Structural(String),
    /// An observed value is unknown.
    Unknown,
}

struct Collector<'a> {
    interp: &'a SymbolicInterpreter,
    out: Vec<Observation>,
}

impl Collector<'_> {
    fn value(
        &mut self,
        what: String,
        original: &SymbolicValue,
        candidate: &SymbolicValue,
    ) -> Result<(), Mismatch> {
        match (original, candidate) {
            (SymbolicValue::Known(a), SymbolicValue::Known(b)) => {
                if a != b {
                    self.out.push(Observation {
                        what,
                        original: Arc::clone(a),
                        candidate: Arc::clone(b),
                    });
                }
                Ok(())
            }
            _ => {
                trace!(what, "observed value is unknown");
                Err(Mismatch::Unknown)
            }
        }
    }

    fn state(
        &mut self,
        prefix: &str,
        original: &SymbolicState,
        candidate: &SymbolicState,
        regs: &ObservedRegs,
        memory: bool,
    ) -> Result<(), Mismatch> {
        let compared: BTreeSet<Reg> = match regs {
            ObservedRegs::All => {
                if original.reg_default() != candidate.reg_default() {
                    return Err(Mismatch::Unknown);
                }
                original
                    .registers()
                    .chain(candidate.registers())
                    .map(|(reg, _)| reg)
                    .collect()
            }
            ObservedRegs::Only(regs) => regs.clone(),
        };
        for reg in compared {
            self.value(
                format!("{prefix}{reg}"),
                &original.read_reg(reg),
                &candidate.read_reg(reg),
            )?;
        }
        if !memory {
            return Ok(());
        }
        if original.version() != candidate.version() {
            return Err(Mismatch::Unknown);
        }
        let alias = self.interp.alias();
        for cell in original.cells().iter().chain(candidate.cells()) {
            let what = match &cell.access.addr {
                SymbolicValue::Known(addr) => format!("{prefix}mem{}[{addr}]", cell.access.width),
                SymbolicValue::Unknown(_) => return Err(Mismatch::Unknown),
            };
            self.value(
                what,
                &original.read_mem(&cell.access, alias),
                &candidate.read_mem(&cell.access, alias),
            )?;
        }
        Ok(())
    }

    fn events(&mut self, original: &[Event], candidate: &[Event]) -> Result<(), Mismatch> {
        if original.len() != candidate.len() {
            return Err(Mismatch::Structural(format!(
                "{} events vs {}",
                original.len(),
                candidate.len()
            )));
        }
        for (a, b) in original.iter().zip(candidate) {
            match (a, b) {
                (
                    Event::Io {
                        address: addr_a,
                        port: port_a,
                        reads: reads_a,
                    },
                    Event::Io {
                        address: addr_b,
                        port: port_b,
                        reads: reads_b,
                    },
                ) if addr_a == addr_b && port_a == port_b && reads_a.len() == reads_b.len() => {
                    for ((loc, va), (_, vb)) in reads_a.iter().zip(reads_b) {
                        self.value(format!("io@{addr_a:#x} {loc:?}"), va, vb)?;
                    }
                }
                (
                    Event::Call {
                        address: addr_a,
                        target: target_a,
                        state: state_a,
                    },
                    Event::Call {
                        address: addr_b,
                        target: target_b,
                        state: state_b,
                    },
                ) if addr_a == addr_b && target_a == target_b => {
                    let prefix = format!("call@{addr_a:#x} ");
                    self.state(&prefix, state_a, state_b, &ObservedRegs::All, true)?;
                }
                _ => return Err(Mismatch::Structural("external events differ".to_string())),
            }
        }
        Ok(())
    }

    fn exit(&mut self, original: &Exit, candidate: &Exit) -> Result<(), Mismatch> {
        match (original, candidate) {
            (Exit::Return, Exit::Return) => Ok(()),
            (Exit::Goto(a), Exit::Goto(b)) => self.value("pc".to_string(), a, b),
            _ => Err(Mismatch::Structural("exit kind differs".to_string())),
        }
    }
}

/// Entry state shared by both sequences.
fn entry_state(obligation: &ProofObligation) -> SymbolicState {
    let mut state = SymbolicState::new();
    for (reg, val) in &obligation.assumptions {
        state.write_reg(*reg, SymbolicValue::constant(*val, reg.width));
    }
    state
}

/// Precondition that does not hold for this obligation.
fn violated(obligation: &ProofObligation, invariants: &InvariantSet) -> Option<Invariant> {
    if let Some(inv) = obligation.requires.iter().find(|inv| !invariants.holds(**inv)) {
        return Some(*inv);
    }
    let writes_memory = obligation
        .original
        .iter()
        .chain(&obligation.candidate)
        .any(opt8_ir::Instruction::writes_memory);
    if writes_memory && !invariants.holds(Invariant::NoSelfModifyingCode) {
        return Some(Invariant::NoSelfModifyingCode);
    }
    None
}

fn observations(
    obligation: &ProofObligation,
    interp: &SymbolicInterpreter,
) -> Result<Vec<Observation>, Mismatch> {
    let entry = entry_state(obligation);
    let original = interp.run(&obligation.original, obligation.end, entry.clone());
    let candidate = interp.run(&obligation.candidate, obligation.end, entry);
    let mut collector = Collector {
        interp,
        out: Vec::new(),
    };
    collector.exit(&original.exit, &candidate.exit)?;
    collector.events(&original.events, &candidate.events)?;
    collector.state(
        "",
        &original.state,
        &candidate.state,
        &obligation.observed.regs,
        obligation.observed.memory,
    )?;
    Ok(collector.out)
}

/// Decide one obligation with a fresh `solver`.
pub fn decide(
    obligation: &ProofObligation,
    invariants: &InvariantSet,
    solver: &mut dyn Solver,
    timeout: Duration,
    cancel: &CancelToken,
) -> Verdict {
    let _span = trace_span!(
        "decide",
        original = obligation.original.len(),
        candidate = obligation.candidate.len()
    )
    .entered();
    if let Some(inv) = violated(obligation, invariants) {
        debug!(%inv, "required invariant inactive");
        return Verdict::Unknown(UnknownReason::InvariantViolationDetected(inv));
    }
    let interp = SymbolicInterpreter::new(invariants);
    let observed = match observations(obligation, &interp) {
        Ok(observed) => observed,
        Err(Mismatch::Structural(what)) => {
            return Verdict::NotEquivalent(Counterexample::structural(what));
        }
        Err(Mismatch::Unknown) => return Verdict::Unknown(UnknownReason::UnknownValue),
    };

    let formula = observed
        .iter()
        .map(|obs| Expr::ne(Arc::clone(&obs.original), Arc::clone(&obs.candidate)))
        .reduce(Expr::or)
        .unwrap_or_else(|| Expr::constant(0, opt8_ir::Width::W8));
    trace!(observations = observed.len(), nodes = formula.node_count(), "asserting difference");

    counter!("opt8_solver_calls_total").increment(1);
    solver.reset();
    solver.assert(formula);
    match solver.check_sat(timeout, cancel) {
        SatResult::Unsat => Verdict::Equivalent,
        SatResult::Sat(model) => {
            let differences = observed
                .iter()
                .filter_map(|obs| {
                    let a = obs.original.eval(&model);
                    let b = obs.candidate.eval(&model);
                    (a != b).then(|| format!("{}: {a:#x} != {b:#x}", obs.what))
                })
                .collect();
            Verdict::NotEquivalent(Counterexample { model, differences })
        }
        SatResult::Unknown(Incomplete::Timeout) => Verdict::Unknown(UnknownReason::SolverTimeout),
        SatResult::Unknown(Incomplete::Cancelled) => Verdict::Unknown(UnknownReason::Cancelled),
        SatResult::Unknown(Incomplete::Undecided) => Verdict::Unknown(UnknownReason::SolverUnknown),
    }
}

/// Proves candidate rewrites equivalent under a fixed invariant set.
pub struct EquivalenceChecker {
    invariants: InvariantSet,
    factory: Arc<dyn SolverFactory>,
    cache: Arc<ProofCache>,
    pool: ProofPool,
    timeout: Duration,
}

impl std::fmt::Debug for EquivalenceChecker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EquivalenceChecker")
            .field("invariants", &self.invariants)
            .field("cached", &self.cache.len())
            .field("pool", &self.pool)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl EquivalenceChecker {
    /// Checker with the given solver, a private cache and one worker per CPU.
    #[must_use]
    pub fn new(invariants: InvariantSet, factory: Arc<dyn SolverFactory>) -> Self {
        Self {
            invariants,
            factory,
            cache: Arc::new(ProofCache::new()),
            pool: ProofPool::new(num_cpus::get()),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Checker backed by the built-in solver.
    #[must_use]
    pub fn builtin(invariants: InvariantSet) -> Self {
        Self::new(invariants, Arc::new(BuiltinSolverFactory))
    }

    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.pool = ProofPool::new(workers);
        self
    }

    /// Share a cache with other checkers.
    #[must_use]
    pub fn with_cache(mut self, cache: Arc<ProofCache>) -> Self {
        self.cache = cache;
        self
    }

    #[must_use]
    pub const fn invariants(&self) -> &InvariantSet {
        &self.invariants
    }

    #[must_use]
    pub fn cache(&self) -> &ProofCache {
        &self.cache
    }

    /// Check one obligation on the calling thread.
    #[must_use]
    pub fn check(&self, obligation: &ProofObligation) -> Verdict {
        let key = CacheKey::new(obligation, &self.invariants);
        if let Some(verdict) = self.cache.get(&key) {
            return verdict;
        }
        let mut solver = self.factory.create();
        let verdict = decide(
            obligation,
            &self.invariants,
            solver.as_mut(),
            self.timeout,
            &CancelToken::new(),
        );
        self.cache.insert(key, &verdict);
        verdict
    }

    /// Check a batch of obligations on the worker pool. Verdicts are
    /// returned in input order.
    #[must_use]
    pub fn check_all(&self, obligations: Vec<ProofObligation>) -> Vec<Verdict> {
        let mut verdicts: Vec<Option<Verdict>> = Vec::with_capacity(obligations.len());
        let mut tasks: Vec<ProofTask> = Vec::new();
        let mut slots = Vec::new();
        for (idx, obligation) in obligations.into_iter().enumerate() {
            let key = CacheKey::new(&obligation, &self.invariants);
            if let Some(verdict) = self.cache.get(&key) {
                verdicts.push(Some(verdict));
                continue;
            }
            verdicts.push(None);
            slots.push((idx, key));
            let invariants = self.invariants.clone();
            let factory = Arc::clone(&self.factory);
            let timeout = self.timeout;
            tasks.push(Box::new(move |cancel: &CancelToken| {
                let mut solver = factory.create();
                decide(&obligation, &invariants, solver.as_mut(), timeout, cancel)
            }));
        }
        let results = self.pool.run(tasks, self.timeout);
        for ((idx, key), verdict) in slots.into_iter().zip(results) {
            self.cache.insert(key, &verdict);
            verdicts[idx] = Some(verdict);
        }
        verdicts
            .into_iter()
            .map(|v| v.unwrap_or(Verdict::Unknown(UnknownReason::Cancelled)))
            .collect()
    }
}
