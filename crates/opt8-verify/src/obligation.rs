//! Proof obligations and the observations they compare.

use std::collections::BTreeSet;
use std::fmt;

use opt8_ir::{Instruction, Invariant, Reg};

/// Registers observable after the region.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum ObservedRegs {
    /// Every register either sequence touches.
    #[default]
    All,
    Only(BTreeSet<Reg>),
}

impl ObservedRegs {
    #[must_use]
    pub fn contains(&self, reg: Reg) -> bool {
        match self {
            Self::All => true,
            Self::Only(regs) => regs.contains(&reg),
        }
    }
}

/// Locations read after the region.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Observed {
    pub regs: ObservedRegs,
    /// Whether memory written by either sequence is observed.
    pub memory: bool,
}

impl Default for Observed {
    fn default() -> Self {
        Self::everything()
    }
}

impl Observed {
    #[must_use]
    pub const fn everything() -> Self {
        Self {
            regs: ObservedRegs::All,
            memory: true,
        }
    }

    #[must_use]
    pub fn regs(regs: impl IntoIterator<Item = Reg>, memory: bool) -> Self {
        Self {
            regs: ObservedRegs::Only(regs.into_iter().collect()),
            memory,
        }
    }
}

/// Claim that `candidate` can replace `original`.
///
/// Both sequences start in the same state, in which every register in
/// `assumptions` holds the given constant, and fall through to `end` unless
/// they transfer control. The claim is checked only for the locations in
/// `observed`, and only if every invariant in `requires` is active.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ProofObligation {
    pub original: Vec<Instruction>,
    pub candidate: Vec<Instruction>,
    pub end: u64,
    pub requires: BTreeSet<Invariant>,
    pub assumptions: Vec<(Reg, u64)>,
    pub observed: Observed,
}

impl ProofObligation {
    /// Obligation with no assumptions that observes everything.
    #[must_use]
    pub fn new(original: Vec<Instruction>, candidate: Vec<Instruction>, end: u64) -> Self {
        Self {
            original,
            candidate,
            end,
            requires: BTreeSet::new(),
            assumptions: Vec::new(),
            observed: Observed::everything(),
        }
    }

    #[must_use]
    pub fn requiring(mut self, invariant: Invariant) -> Self {
        self.requires.insert(invariant);
        self
    }

    #[must_use]
    pub fn assuming(mut self, assumptions: impl IntoIterator<Item = (Reg, u64)>) -> Self {
        self.assumptions.extend(assumptions);
        self.assumptions.sort_unstable();
        self.assumptions.dedup();
        self
    }

    #[must_use]
    pub fn observing(mut self, observed: Observed) -> Self {
        self.observed = observed;
        self
    }
}

impl fmt::Display for ProofObligation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} -> {} insns, end {:#x}",
            self.original.len(),
            self.candidate.len(),
            self.end
        )?;
        for inv in &self.requires {
            write!(f, ", requires {inv}")?;
        }
        Ok(())
    }
}
