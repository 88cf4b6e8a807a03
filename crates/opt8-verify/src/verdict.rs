//! Outcomes of an equivalence check.

use std::fmt;

use opt8_ir::Invariant;
use thiserror::Error;

use crate::solver::Model;

/// Why a check ended without a decision. Every reason rejects the candidate.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnknownReason {
    #[error("solver timed out")]
    SolverTimeout,

    #[error("solver could not decide")]
    SolverUnknown,

    #[error("check was cancelled")]
    Cancelled,

    #[error("required invariant `{0}` does not hold")]
    InvariantViolationDetected(Invariant),

    #[error("an observed value is unknown")]
    UnknownValue,
}

impl UnknownReason {
    /// Whether a later check of the same obligation could decide it.
    #[must_use]
    pub const fn is_transient(self) -> bool {
        matches!(self, Self::SolverTimeout | Self::Cancelled)
    }
}

/// Input assignment under which the sequences disagree.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Counterexample {
    pub model: Model,
    /// Observations that differ under `model`, e.g. `R2: 0xa != 0xc`.
    pub differences: Vec<String>,
}

impl Counterexample {
    /// Mismatch that holds for every input.
    #[must_use]
    pub fn structural(what: impl Into<String>) -> Self {
        Self {
            model: Model::default(),
            differences: vec![what.into()],
        }
    }
}

impl fmt::Display for Counterexample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.model)?;
        for diff in &self.differences {
            write!(f, "; {diff}")?;
        }
        Ok(())
    }
}

/// Result of checking one proof obligation.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Verdict {
    Equivalent,
    NotEquivalent(Counterexample),
    Unknown(UnknownReason),
}

impl Verdict {
    #[must_use]
    pub const fn is_equivalent(&self) -> bool {
        matches!(self, Self::Equivalent)
    }

    /// Whether the verdict may be cached.
    #[must_use]
    pub const fn is_stable(&self) -> bool {
        match self {
            Self::Unknown(reason) => !reason.is_transient(),
            _ => true,
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Equivalent => f.write_str("equivalent"),
            Self::NotEquivalent(cex) => write!(f, "not equivalent ({cex})"),
            Self::Unknown(reason) => write!(f, "unknown ({reason})"),
        }
    }
}
