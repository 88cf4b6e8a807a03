//! Solver capability and the built-in bit-vector solver.
//!
//! Formulas are boolean [`Expr`] trees: a formula holds when it evaluates
//! to a nonzero value. `check_sat` looks for an assignment of the leaves
//! (register inputs, opaque values, initial memory bytes) that makes every
//! asserted formula hold.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use opt8_ir::{Env, Expr, ExprRef, MemVersion, OpaqueId, Reg, Width, normalize};
use opt8_symbolic::mix;
use tracing::trace;

/// Concrete assignment of expression leaves. Unassigned leaves are zero.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Model {
    pub inputs: BTreeMap<Reg, u64>,
    pub opaques: BTreeMap<OpaqueId, u64>,
    pub memory: BTreeMap<(MemVersion, u64), u8>,
}

impl Env for Model {
    fn input(&self, reg: Reg) -> u64 {
        self.inputs.get(&reg).copied().unwrap_or(0)
    }

    fn opaque(&self, id: OpaqueId, _width: Width) -> u64 {
        self.opaques.get(&id).copied().unwrap_or(0)
    }

    fn memory_byte(&self, version: MemVersion, addr: u64) -> u8 {
        self.memory.get(&(version, addr)).copied().unwrap_or(0)
    }
}

impl fmt::Display for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        let mut sep = |f: &mut fmt::Formatter<'_>| {
            if first {
                first = false;
                Ok(())
            } else {
                f.write_str(", ")
            }
        };
        for (reg, val) in &self.inputs {
            sep(f)?;
            write!(f, "{reg}={val:#x}")?;
        }
        for (id, val) in &self.opaques {
            sep(f)?;
            write!(f, "io@{:#x}.{}={val:#x}", id.address, id.slot)?;
        }
        for ((version, addr), byte) in &self.memory {
            sep(f)?;
            match version {
                MemVersion::Entry => write!(f, "mem[{addr:#x}]={byte:#x}")?,
                MemVersion::AfterBarrier(at) => write!(f, "mem@{at:#x}[{addr:#x}]={byte:#x}")?,
            }
        }
        if first {
            f.write_str("any input")?;
        }
        Ok(())
    }
}

/// Why the solver gave up.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Incomplete {
    Timeout,
    Cancelled,
    /// The formula is outside the decidable fragment.
    Undecided,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SatResult {
    Sat(Model),
    Unsat,
    Unknown(Incomplete),
}

/// Shared cancellation flag for one solver call.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Decision procedure consumed by the equivalence checker.
pub trait Solver: Send {
    /// Add a formula that must hold.
    fn assert(&mut self, formula: ExprRef);

    /// Decide whether all asserted formulas can hold at once.
    fn check_sat(&mut self, timeout: Duration, cancel: &CancelToken) -> SatResult;

    /// Drop every assertion.
    fn reset(&mut self);
}

/// Creates a fresh solver per proof obligation.
pub trait SolverFactory: Send + Sync {
    fn create(&self) -> Box<dyn Solver>;
}

impl<F> SolverFactory for F
where
    F: Fn() -> Box<dyn Solver> + Send + Sync,
{
    fn create(&self) -> Box<dyn Solver> {
        self()
    }
}

/// Default number of random assignments tried before giving up on sampling.
pub const DEFAULT_SAMPLES: usize = 256;

/// Largest number of leaf bits enumerated exhaustively.
pub const DEFAULT_EXHAUSTIVE_BITS: u32 = 20;

/// Built-in solver over the expression language.
///
/// It simplifies each formula, then searches for a model with corner-case
/// and pseudo-random assignments, and finally enumerates every assignment
/// when the formulas depend on few enough bits. Formulas that survive
/// sampling but are too wide to enumerate yield `Unknown`.
#[derive(Clone, Debug)]
pub struct BuiltinSolver {
    assertions: Vec<ExprRef>,
    samples: usize,
    exhaustive_bits: u32,
}

impl Default for BuiltinSolver {
    fn default() -> Self {
        Self::new()
    }
}

impl BuiltinSolver {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            assertions: Vec::new(),
            samples: DEFAULT_SAMPLES,
            exhaustive_bits: DEFAULT_EXHAUSTIVE_BITS,
        }
    }

    #[must_use]
    pub const fn with_samples(mut self, samples: usize) -> Self {
        self.samples = samples;
        self
    }

    #[must_use]
    pub const fn with_exhaustive_bits(mut self, bits: u32) -> Self {
        self.exhaustive_bits = bits;
        self
    }

    fn holds<E: Env + ?Sized>(formulas: &[ExprRef], env: &E) -> bool {
        formulas.iter().all(|f| f.eval(env) != 0)
    }

    fn sample(
        &self,
        formulas: &[ExprRef],
        deadline: Instant,
        cancel: &CancelToken,
    ) -> Result<Option<Model>, Incomplete> {
        const CORNERS: [u64; 5] = [0, u64::MAX, 1, 0x8080_8080_8080_8080, 0x7F7F_7F7F_7F7F_7F7F];
        let fills = CORNERS
            .iter()
            .map(|c| Fill::Const(*c))
            .chain((0..self.samples as u64).map(Fill::Seed));
        for fill in fills {
            interrupted(deadline, cancel)?;
            if Self::holds(formulas, &fill) {
                return Ok(Some(materialize(formulas, &fill)));
            }
        }
        Ok(None)
    }

    fn enumerate(
        &self,
        formulas: &[ExprRef],
        deadline: Instant,
        cancel: &CancelToken,
    ) -> Result<Option<Model>, Incomplete> {
        let Some(slots) = slots(formulas) else {
            return Err(Incomplete::Undecided);
        };
        let bits: u32 = slots.iter().map(Slot::bits).sum();
        if bits > self.exhaustive_bits {
            return Err(Incomplete::Undecided);
        }
        trace!(bits, slots = slots.len(), "enumerating assignments");
        for n in 0..(1u64 << bits) {
            if n % 4096 == 0 {
                interrupted(deadline, cancel)?;
            }
            let model = assign(&slots, n);
            if Self::holds(formulas, &model) {
                return Ok(Some(model));
            }
        }
        Ok(None)
    }
}

impl Solver for BuiltinSolver {
    fn assert(&mut self, formula: ExprRef) {
        self.assertions.push(formula);
    }

    fn check_sat(&mut self, timeout: Duration, cancel: &CancelToken) -> SatResult {
        let deadline = Instant::now() + timeout;
        let mut formulas = Vec::with_capacity(self.assertions.len());
        for formula in &self.assertions {
            let norm = normalize(formula);
            match norm.as_const() {
                Some(0) => return SatResult::Unsat,
                Some(_) => {}
                None => formulas.push(norm),
            }
        }
        if formulas.is_empty() {
            return SatResult::Sat(Model::default());
        }
        match self.sample(&formulas, deadline, cancel) {
            Ok(Some(model)) => return SatResult::Sat(model),
            Ok(None) => {}
            Err(why) => return SatResult::Unknown(why),
        }
        match self.enumerate(&formulas, deadline, cancel) {
            Ok(Some(model)) => SatResult::Sat(model),
            Ok(None) => SatResult::Unsat,
            Err(why) => SatResult::Unknown(why),
        }
    }

    fn reset(&mut self) {
        self.assertions.clear();
    }
}

/// Factory for [`BuiltinSolver`].
#[derive(Clone, Copy, Debug, Default)]
pub struct BuiltinSolverFactory;

impl SolverFactory for BuiltinSolverFactory {
    fn create(&self) -> Box<dyn Solver> {
        Box::new(BuiltinSolver::new())
    }
}

fn interrupted(deadline: Instant, cancel: &CancelToken) -> Result<(), Incomplete> {
    if cancel.is_cancelled() {
        return Err(Incomplete::Cancelled);
    }
    if Instant::now() >= deadline {
        return Err(Incomplete::Timeout);
    }
    Ok(())
}

/// Leaf values drawn from a single pattern.
#[derive(Clone, Copy, Debug)]
enum Fill {
    Const(u64),
    Seed(u64),
}

impl Fill {
    fn value(self, key: u64, width: Width) -> u64 {
        match self {
            Self::Const(c) => width.truncate(c),
            Self::Seed(seed) => width.truncate(mix(seed ^ mix(key))),
        }
    }
}

impl Env for Fill {
    fn input(&self, reg: Reg) -> u64 {
        self.value(u64::from(reg.index) | (u64::from(reg.width.bits()) << 8), reg.width)
    }

    fn opaque(&self, id: OpaqueId, width: Width) -> u64 {
        self.value(id.address.rotate_left(24) ^ u64::from(id.slot) ^ (1 << 63), width)
    }

    fn memory_byte(&self, version: MemVersion, addr: u64) -> u8 {
        let tag = match version {
            MemVersion::Entry => 0,
            MemVersion::AfterBarrier(at) => mix(at),
        };
        (self.value(addr ^ tag ^ (1 << 62), Width::W8) & 0xFF) as u8
    }
}

/// Record every leaf value `env` supplies to `formulas`.
fn materialize<E: Env + ?Sized>(formulas: &[ExprRef], env: &E) -> Model {
    let mut model = Model::default();
    for formula in formulas {
        formula.for_each_leaf(&mut |leaf| match leaf {
            Expr::Input(reg) => {
                model.inputs.insert(*reg, env.input(*reg));
            }
            Expr::Opaque { id, width } => {
                model.opaques.insert(*id, env.opaque(*id, *width));
            }
            Expr::Load {
                version,
                addr,
                width,
            } => {
                let addr_width = addr.width();
                let base = addr.eval(env);
                for i in 0..width.bytes() {
                    let at = addr_width.truncate(base.wrapping_add(i));
                    model
                        .memory
                        .insert((*version, at), env.memory_byte(*version, at));
                }
            }
            _ => {}
        });
    }
    model
}

/// An enumerable leaf.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum Slot {
    Input(Reg),
    Opaque(OpaqueId, Width),
    Byte(MemVersion, u64),
}

impl Slot {
    const fn bits(&self) -> u32 {
        match self {
            Self::Input(reg) => reg.width.bits(),
            Self::Opaque(_, width) => width.bits(),
            Self::Byte(..) => 8,
        }
    }
}

/// Leaves of `formulas`, or `None` if a load address is not constant.
fn slots(formulas: &[ExprRef]) -> Option<Vec<Slot>> {
    let mut out = Vec::new();
    let mut enumerable = true;
    for formula in formulas {
        formula.for_each_leaf(&mut |leaf| match leaf {
            Expr::Input(reg) => out.push(Slot::Input(*reg)),
            Expr::Opaque { id, width } => out.push(Slot::Opaque(*id, *width)),
            Expr::Load {
                version,
                addr,
                width,
            } => match normalize(addr).as_const() {
                Some(base) => {
                    let addr_width = addr.width();
                    for i in 0..width.bytes() {
                        out.push(Slot::Byte(*version, addr_width.truncate(base.wrapping_add(i))));
                    }
                }
                None => enumerable = false,
            },
            _ => {}
        });
    }
    if !enumerable {
        return None;
    }
    out.sort_unstable();
    out.dedup();
    Some(out)
}

/// Assignment number `n`, packing slot values from the low bits up.
fn assign(slots: &[Slot], mut n: u64) -> Model {
    let mut model = Model::default();
    for slot in slots {
        let bits = slot.bits();
        let val = n & ((1u64 << bits) - 1);
        n >>= bits;
        match slot {
            Slot::Input(reg) => {
                model.inputs.insert(*reg, val);
            }
            Slot::Opaque(id, _) => {
                model.opaques.insert(*id, val);
            }
            Slot::Byte(version, addr) => {
                model.memory.insert((*version, *addr), (val & 0xFF) as u8);
            }
        }
    }
    model
}

#[cfg(test)]
mod tests {
    use super::*;

    fn r(i: u8) -> Reg {
        Reg::new(i, Width::W8)
    }

    fn check(formula: ExprRef) -> SatResult {
        let mut solver = BuiltinSolver::new();
        solver.assert(formula);
        solver.check_sat(Duration::from_secs(5), &CancelToken::new())
    }

    #[test]
    fn test_trivial_formulas() {
        assert_eq!(check(Expr::constant(0, Width::W8)), SatResult::Unsat);
        assert!(matches!(check(Expr::constant(1, Width::W8)), SatResult::Sat(_)));
    }

    #[test]
    fn test_normalization_proves_identity() {
        // x * 2 != x << 1
        let x = Expr::input(Reg::new(1, Width::W64));
        let lhs = Expr::mul(x.clone(), Expr::constant(2, Width::W64));
        let rhs = Expr::shl(x, Expr::constant(1, Width::W64));
        assert_eq!(check(Expr::ne(lhs, rhs)), SatResult::Unsat);
    }

    #[test]
    fn test_sampling_finds_model() {
        // x + 1 != x | 1 whenever bit 0 of x is set
        let x = Expr::input(Reg::new(1, Width::W32));
        let one = Expr::constant(1, Width::W32);
        let formula = Expr::ne(Expr::add(x.clone(), one.clone()), Expr::or(x.clone(), one));
        let SatResult::Sat(model) = check(formula.clone()) else {
            panic!("expected a model");
        };
        assert_ne!(formula.eval(&model), 0);
    }

    #[test]
    fn test_exhaustive_unsat() {
        // (x & y) + (x | y) == x + y holds for all 8-bit x, y
        let x = Expr::input(r(1));
        let y = Expr::input(r(2));
        let lhs = Expr::add(Expr::and(x.clone(), y.clone()), Expr::or(x.clone(), y.clone()));
        let rhs = Expr::add(x, y);
        assert_eq!(check(Expr::ne(lhs, rhs)), SatResult::Unsat);
    }

    #[test]
    fn test_rare_model_found_by_enumeration() {
        let x = Expr::input(r(1));
        let y = Expr::input(r(2));
        let formula = Expr::and(
            Expr::eq(x, Expr::constant(0x5A, Width::W8)),
            Expr::eq(y, Expr::constant(0xC3, Width::W8)),
        );
        let SatResult::Sat(model) = check(formula) else {
            panic!("expected a model");
        };
        assert_eq!(model.input(r(1)), 0x5A);
        assert_eq!(model.input(r(2)), 0xC3);
    }

    #[test]
    fn test_wide_formula_is_unknown() {
        // (x & y) + (x | y) == x + y over 64 bits cannot be enumerated
        let x = Expr::input(Reg::new(1, Width::W64));
        let y = Expr::input(Reg::new(2, Width::W64));
        let lhs = Expr::add(Expr::and(x.clone(), y.clone()), Expr::or(x.clone(), y.clone()));
        let rhs = Expr::add(x, y);
        assert_eq!(check(Expr::ne(lhs, rhs)), SatResult::Unknown(Incomplete::Undecided));
    }

    #[test]
    fn test_cancelled_before_start() {
        let token = CancelToken::new();
        token.cancel();
        let mut solver = BuiltinSolver::new();
        solver.assert(Expr::ne(Expr::input(r(1)), Expr::input(r(2))));
        solver.assert(Expr::eq(Expr::input(r(1)), Expr::input(r(2))));
        assert_eq!(
            solver.check_sat(Duration::from_secs(5), &token),
            SatResult::Unknown(Incomplete::Cancelled)
        );
    }

    #[test]
    fn test_reset_clears_assertions() {
        let mut solver = BuiltinSolver::new();
        solver.assert(Expr::constant(0, Width::W8));
        solver.reset();
        assert!(matches!(
            solver.check_sat(Duration::from_secs(1), &CancelToken::new()),
            SatResult::Sat(_)
        ));
    }
}
