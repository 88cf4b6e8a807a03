//! Equivalence checking for the opt8 optimizer.
//!
//! An [`EquivalenceChecker`] turns a [`ProofObligation`] into a formula over
//! the symbolic effects of both sequences and hands it to a [`Solver`].
//! Only an `Unsat` answer accepts a rewrite; every other outcome is a
//! rejection.

mod cache;
mod checker;
mod obligation;
mod pool;
mod solver;
mod verdict;

pub use cache::*;
pub use checker::*;
pub use obligation::*;
pub use pool::*;
pub use solver::*;
pub use verdict::*;
