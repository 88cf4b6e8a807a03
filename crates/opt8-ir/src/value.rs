//! Symbolic values tracked by the interpreter.

use std::fmt;
use std::sync::Arc;

use crate::expr::{Expr, ExprRef};
use crate::width::Width;

/// Value of a location at a program point.
///
/// `Known(Const)` is a concrete constant, `Known(_)` any other symbolic
/// expression over region inputs, and `Unknown` the top value about which
/// nothing may be assumed.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SymbolicValue {
    Known(ExprRef),
    Unknown(Width),
}

impl SymbolicValue {
    #[must_use]
    pub fn constant(value: u64, width: Width) -> Self {
        Self::Known(Expr::constant(value, width))
    }

    #[must_use]
    pub fn width(&self) -> Width {
        match self {
            Self::Known(expr) => expr.width(),
            Self::Unknown(width) => *width,
        }
    }

    #[must_use]
    pub fn as_const(&self) -> Option<u64> {
        match self {
            Self::Known(expr) => expr.as_const(),
            Self::Unknown(_) => None,
        }
    }

    #[must_use]
    pub const fn as_expr(&self) -> Option<&ExprRef> {
        match self {
            Self::Known(expr) => Some(expr),
            Self::Unknown(_) => None,
        }
    }

    #[must_use]
    pub const fn is_unknown(&self) -> bool {
        matches!(self, Self::Unknown(_))
    }

    /// Combine two values with an expression builder, propagating `Unknown`.
    #[must_use]
    pub fn map2(
        &self,
        other: &Self,
        width: Width,
        f: impl FnOnce(ExprRef, ExprRef) -> ExprRef,
    ) -> Self {
        match (self, other) {
            (Self::Known(a), Self::Known(b)) => Self::Known(f(Arc::clone(a), Arc::clone(b))),
            _ => Self::Unknown(width),
        }
    }

    /// Transform a known value, propagating `Unknown`.
    #[must_use]
    pub fn map(&self, width: Width, f: impl FnOnce(ExprRef) -> ExprRef) -> Self {
        match self {
            Self::Known(a) => Self::Known(f(Arc::clone(a))),
            Self::Unknown(_) => Self::Unknown(width),
        }
    }
}

impl From<ExprRef> for SymbolicValue {
    fn from(expr: ExprRef) -> Self {
        Self::Known(expr)
    }
}

impl fmt::Display for SymbolicValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Known(expr) => expr.fmt(f),
            Self::Unknown(width) => write!(f, "unknown{width}"),
        }
    }
}
