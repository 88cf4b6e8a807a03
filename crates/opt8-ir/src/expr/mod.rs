//! Symbolic expressions over fixed-width bit vectors.
//!
//! Expressions are immutable trees shared through [`Arc`]. The factory
//! methods constant-fold and apply local algebraic identities, so a tree
//! built only from constants is always a single `Const` node.

mod normalize;

use std::fmt;
use std::sync::Arc;

use crate::location::Reg;
use crate::width::Width;

pub use normalize::normalize;

/// Shared expression handle.
pub type ExprRef = Arc<Expr>;

/// Unary operations.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub enum UnaryOp {
    Not,
    Neg,
}

impl UnaryOp {
    /// Apply to a concrete operand.
    #[must_use]
    pub const fn apply(self, val: u64, width: Width) -> u64 {
        match self {
            Self::Not => width.truncate(!val),
            Self::Neg => width.truncate(val.wrapping_neg()),
        }
    }

    const fn symbol(self) -> &'static str {
        match self {
            Self::Not => "~",
            Self::Neg => "-",
        }
    }
}

/// Binary operations. Comparisons produce an 8-bit 0/1 value.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    Eq,
    Ne,
    Ltu,
    Geu,
}

impl BinaryOp {
    #[must_use]
    pub const fn is_comparison(self) -> bool {
        matches!(self, Self::Eq | Self::Ne | Self::Ltu | Self::Geu)
    }

    #[must_use]
    pub const fn is_commutative(self) -> bool {
        matches!(
            self,
            Self::Add | Self::Mul | Self::And | Self::Or | Self::Xor | Self::Eq | Self::Ne
        )
    }

    /// Apply to concrete operands of `width`.
    ///
    /// Shift amounts at or above the width produce zero.
    #[must_use]
    pub const fn apply(self, lhs: u64, rhs: u64, width: Width) -> u64 {
        let l = width.truncate(lhs);
        let r = width.truncate(rhs);
        match self {
            Self::Add => width.truncate(l.wrapping_add(r)),
            Self::Sub => width.truncate(l.wrapping_sub(r)),
            Self::Mul => width.truncate(l.wrapping_mul(r)),
            Self::And => l & r,
            Self::Or => l | r,
            Self::Xor => l ^ r,
            Self::Shl => {
                if r >= width.bits() as u64 {
                    0
                } else {
                    width.truncate(l << r)
                }
            }
            Self::Shr => {
                if r >= width.bits() as u64 {
                    0
                } else {
                    l >> r
                }
            }
            Self::Eq => (l == r) as u64,
            Self::Ne => (l != r) as u64,
            Self::Ltu => (l < r) as u64,
            Self::Geu => (l >= r) as u64,
        }
    }

    const fn symbol(self) -> &'static str {
        match self {
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::And => "&",
            Self::Or => "|",
            Self::Xor => "^",
            Self::Shl => "<<",
            Self::Shr => ">>",
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Ltu => "<u",
            Self::Geu => ">=u",
        }
    }
}

/// Version of memory that an initial load observes.
///
/// Memory contents change identity after every call barrier, so loads on
/// either side of a call never compare equal.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub enum MemVersion {
    #[default]
    Entry,
    AfterBarrier(u64),
}

/// Identity of a value produced by an I/O operation or a call.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct OpaqueId {
    /// Address of the producing instruction.
    pub address: u64,
    /// Output slot within that instruction.
    pub slot: u32,
}

/// Expression tree node.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub enum Expr {
    Const {
        value: u64,
        width: Width,
    },
    /// Register value at region entry.
    Input(Reg),
    /// Little-endian load from memory as it was at `version`.
    Load {
        version: MemVersion,
        addr: ExprRef,
        width: Width,
    },
    Opaque {
        id: OpaqueId,
        width: Width,
    },
    Unary {
        op: UnaryOp,
        arg: ExprRef,
    },
    Binary {
        op: BinaryOp,
        lhs: ExprRef,
        rhs: ExprRef,
    },
    /// `cond != 0 ? then_val : else_val`.
    Select {
        cond: ExprRef,
        then_val: ExprRef,
        else_val: ExprRef,
    },
    /// Zero-extend or truncate to `width`.
    Resize {
        width: Width,
        arg: ExprRef,
    },
}

/// Assignment of concrete values to expression leaves.
pub trait Env {
    fn input(&self, reg: Reg) -> u64;
    fn opaque(&self, id: OpaqueId, width: Width) -> u64;
    fn memory_byte(&self, version: MemVersion, addr: u64) -> u8;
}

// These are factory methods, not trait implementations
#[allow(clippy::should_implement_trait)]
impl Expr {
    #[must_use]
    pub fn constant(value: u64, width: Width) -> ExprRef {
        Arc::new(Self::Const {
            value: width.truncate(value),
            width,
        })
    }

    #[must_use]
    pub fn input(reg: Reg) -> ExprRef {
        Arc::new(Self::Input(reg))
    }

    #[must_use]
    pub fn opaque(id: OpaqueId, width: Width) -> ExprRef {
        Arc::new(Self::Opaque { id, width })
    }

    #[must_use]
    pub fn load(version: MemVersion, addr: ExprRef, width: Width) -> ExprRef {
        Arc::new(Self::Load {
            version,
            addr,
            width,
        })
    }

    /// Unary operation with folding.
    #[must_use]
    pub fn unary(op: UnaryOp, arg: ExprRef) -> ExprRef {
        if let Self::Const { value, width } = *arg {
            return Self::constant(op.apply(value, width), width);
        }
        // Not(Not(x)) and Neg(Neg(x))
        if let Self::Unary { op: inner, arg: x } = arg.as_ref() {
            if *inner == op {
                return Arc::clone(x);
            }
        }
        Arc::new(Self::Unary { op, arg })
    }

    /// Binary operation with folding and identity simplification.
    #[must_use]
    pub fn binary(op: BinaryOp, lhs: ExprRef, rhs: ExprRef) -> ExprRef {
        let width = lhs.width();
        if let (Some(l), Some(r)) = (lhs.as_const(), rhs.as_const()) {
            let out = if op.is_comparison() { Width::W8 } else { width };
            return Self::constant(op.apply(l, r, width), out);
        }
        let ones = width.mask();
        let lc = lhs.as_const();
        let rc = rhs.as_const();
        let same = lhs == rhs;
        match op {
            BinaryOp::Add => {
                if rc == Some(0) {
                    return lhs;
                }
                if lc == Some(0) {
                    return rhs;
                }
            }
            BinaryOp::Sub => {
                if rc == Some(0) {
                    return lhs;
                }
                if same {
                    return Self::constant(0, width);
                }
            }
            BinaryOp::Mul => {
                if rc == Some(0) || lc == Some(0) {
                    return Self::constant(0, width);
                }
                if rc == Some(1) {
                    return lhs;
                }
                if lc == Some(1) {
                    return rhs;
                }
            }
            BinaryOp::And => {
                if rc == Some(0) || lc == Some(0) {
                    return Self::constant(0, width);
                }
                if rc == Some(ones) || same {
                    return lhs;
                }
                if lc == Some(ones) {
                    return rhs;
                }
            }
            BinaryOp::Or => {
                if rc == Some(ones) || lc == Some(ones) {
                    return Self::constant(ones, width);
                }
                if rc == Some(0) || same {
                    return lhs;
                }
                if lc == Some(0) {
                    return rhs;
                }
            }
            BinaryOp::Xor => {
                if same {
                    return Self::constant(0, width);
                }
                if rc == Some(0) {
                    return lhs;
                }
                if lc == Some(0) {
                    return rhs;
                }
            }
            BinaryOp::Shl | BinaryOp::Shr => {
                if rc == Some(0) {
                    return lhs;
                }
                if lc == Some(0) || rc.is_some_and(|s| s >= u64::from(width.bits())) {
                    return Self::constant(0, width);
                }
            }
            BinaryOp::Eq | BinaryOp::Geu if same => return Self::constant(1, Width::W8),
            BinaryOp::Ne | BinaryOp::Ltu if same => return Self::constant(0, Width::W8),
            BinaryOp::Ltu if rc == Some(0) => return Self::constant(0, Width::W8),
            BinaryOp::Geu if rc == Some(0) => return Self::constant(1, Width::W8),
            BinaryOp::Eq | BinaryOp::Ne | BinaryOp::Ltu | BinaryOp::Geu => {}
        }
        Arc::new(Self::Binary { op, lhs, rhs })
    }

    #[must_use]
    pub fn not(arg: ExprRef) -> ExprRef {
        Self::unary(UnaryOp::Not, arg)
    }

    #[must_use]
    pub fn neg(arg: ExprRef) -> ExprRef {
        Self::unary(UnaryOp::Neg, arg)
    }

    #[must_use]
    pub fn add(lhs: ExprRef, rhs: ExprRef) -> ExprRef {
        Self::binary(BinaryOp::Add, lhs, rhs)
    }

    #[must_use]
    pub fn sub(lhs: ExprRef, rhs: ExprRef) -> ExprRef {
        Self::binary(BinaryOp::Sub, lhs, rhs)
    }

    #[must_use]
    pub fn mul(lhs: ExprRef, rhs: ExprRef) -> ExprRef {
        Self::binary(BinaryOp::Mul, lhs, rhs)
    }

    #[must_use]
    pub fn and(lhs: ExprRef, rhs: ExprRef) -> ExprRef {
        Self::binary(BinaryOp::And, lhs, rhs)
    }

    #[must_use]
    pub fn or(lhs: ExprRef, rhs: ExprRef) -> ExprRef {
        Self::binary(BinaryOp::Or, lhs, rhs)
    }

    #[must_use]
    pub fn xor(lhs: ExprRef, rhs: ExprRef) -> ExprRef {
        Self::binary(BinaryOp::Xor, lhs, rhs)
    }

    #[must_use]
    pub fn shl(lhs: ExprRef, rhs: ExprRef) -> ExprRef {
        Self::binary(BinaryOp::Shl, lhs, rhs)
    }

    #[must_use]
    pub fn shr(lhs: ExprRef, rhs: ExprRef) -> ExprRef {
        Self::binary(BinaryOp::Shr, lhs, rhs)
    }

    #[must_use]
    pub fn eq(lhs: ExprRef, rhs: ExprRef) -> ExprRef {
        Self::binary(BinaryOp::Eq, lhs, rhs)
    }

    #[must_use]
    pub fn ne(lhs: ExprRef, rhs: ExprRef) -> ExprRef {
        Self::binary(BinaryOp::Ne, lhs, rhs)
    }

    #[must_use]
    pub fn ltu(lhs: ExprRef, rhs: ExprRef) -> ExprRef {
        Self::binary(BinaryOp::Ltu, lhs, rhs)
    }

    #[must_use]
    pub fn geu(lhs: ExprRef, rhs: ExprRef) -> ExprRef {
        Self::binary(BinaryOp::Geu, lhs, rhs)
    }

    /// Conditional value with folding.
    #[must_use]
    pub fn select(cond: ExprRef, then_val: ExprRef, else_val: ExprRef) -> ExprRef {
        if let Some(c) = cond.as_const() {
            return if c != 0 { then_val } else { else_val };
        }
        if then_val == else_val {
            return then_val;
        }
        Arc::new(Self::Select {
            cond,
            then_val,
            else_val,
        })
    }

    /// Zero-extend or truncate `arg` to `width`.
    #[must_use]
    pub fn resize(arg: ExprRef, width: Width) -> ExprRef {
        let from = arg.width();
        if from == width {
            return arg;
        }
        if let Self::Const { value, .. } = *arg {
            return Self::constant(value, width);
        }
        if let Self::Resize { width: mid, arg: inner } = arg.as_ref() {
            // zext-then-resize, or truncate-then-truncate
            if *mid >= inner.width() || width <= *mid {
                return Self::resize(Arc::clone(inner), width);
            }
        }
        Arc::new(Self::Resize { width, arg })
    }

    /// Nonzero test producing an 8-bit boolean.
    #[must_use]
    pub fn truthy(arg: ExprRef) -> ExprRef {
        if arg.is_boolean() {
            return arg;
        }
        let width = arg.width();
        Self::ne(arg, Self::constant(0, width))
    }

    /// Width of the value this expression produces.
    #[must_use]
    pub fn width(&self) -> Width {
        match self {
            Self::Const { width, .. }
            | Self::Load { width, .. }
            | Self::Opaque { width, .. }
            | Self::Resize { width, .. } => *width,
            Self::Input(reg) => reg.width,
            Self::Unary { arg, .. } => arg.width(),
            Self::Binary { op, lhs, .. } => {
                if op.is_comparison() {
                    Width::W8
                } else {
                    lhs.width()
                }
            }
            Self::Select { then_val, .. } => then_val.width(),
        }
    }

    #[must_use]
    pub const fn as_const(&self) -> Option<u64> {
        match self {
            Self::Const { value, .. } => Some(*value),
            _ => None,
        }
    }

    #[must_use]
    pub const fn is_const(&self) -> bool {
        matches!(self, Self::Const { .. })
    }

    /// Whether the expression is a comparison (always 0 or 1).
    #[must_use]
    pub const fn is_boolean(&self) -> bool {
        matches!(self, Self::Binary { op, .. } if op.is_comparison())
    }

    /// Evaluate under a concrete assignment of the leaves.
    pub fn eval<E: Env + ?Sized>(&self, env: &E) -> u64 {
        match self {
            Self::Const { value, .. } => *value,
            Self::Input(reg) => reg.width.truncate(env.input(*reg)),
            Self::Opaque { id, width } => width.truncate(env.opaque(*id, *width)),
            Self::Load {
                version,
                addr,
                width,
            } => {
                let addr_width = addr.width();
                let base = addr.eval(env);
                let mut value = 0u64;
                for i in 0..width.bytes() {
                    let byte_addr = addr_width.truncate(base.wrapping_add(i));
                    value |= u64::from(env.memory_byte(*version, byte_addr)) << (8 * i);
                }
                value
            }
            Self::Unary { op, arg } => op.apply(arg.eval(env), arg.width()),
            Self::Binary { op, lhs, rhs } => op.apply(lhs.eval(env), rhs.eval(env), lhs.width()),
            Self::Select {
                cond,
                then_val,
                else_val,
            } => {
                if cond.eval(env) != 0 {
                    then_val.eval(env)
                } else {
                    else_val.eval(env)
                }
            }
            Self::Resize { width, arg } => width.truncate(arg.eval(env)),
        }
    }

    /// Visit every leaf (register input, opaque value, initial load).
    ///
    /// Loads are visited before the leaves of their address.
    pub fn for_each_leaf<'a>(&'a self, f: &mut impl FnMut(&'a Self)) {
        match self {
            Self::Const { .. } => {}
            Self::Input(_) | Self::Opaque { .. } => f(self),
            Self::Load { addr, .. } => {
                f(self);
                addr.for_each_leaf(f);
            }
            Self::Unary { arg, .. } | Self::Resize { arg, .. } => arg.for_each_leaf(f),
            Self::Binary { lhs, rhs, .. } => {
                lhs.for_each_leaf(f);
                rhs.for_each_leaf(f);
            }
            Self::Select {
                cond,
                then_val,
                else_val,
            } => {
                cond.for_each_leaf(f);
                then_val.for_each_leaf(f);
                else_val.for_each_leaf(f);
            }
        }
    }

    /// Number of nodes in the tree.
    #[must_use]
    pub fn node_count(&self) -> usize {
        match self {
            Self::Const { .. } | Self::Input(_) | Self::Opaque { .. } => 1,
            Self::Load { addr, .. } => 1 + addr.node_count(),
            Self::Unary { arg, .. } | Self::Resize { arg, .. } => 1 + arg.node_count(),
            Self::Binary { lhs, rhs, .. } => 1 + lhs.node_count() + rhs.node_count(),
            Self::Select {
                cond,
                then_val,
                else_val,
            } => 1 + cond.node_count() + then_val.node_count() + else_val.node_count(),
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Const { value, .. } => write!(f, "{value:#x}"),
            Self::Input(reg) => write!(f, "{reg}"),
            Self::Load {
                version,
                addr,
                width,
            } => match version {
                MemVersion::Entry => write!(f, "mem{width}[{addr}]"),
                MemVersion::AfterBarrier(at) => write!(f, "mem{width}@{at:#x}[{addr}]"),
            },
            Self::Opaque { id, .. } => write!(f, "io@{:#x}.{}", id.address, id.slot),
            Self::Unary { op, arg } => write!(f, "{}({arg})", op.symbol()),
            Self::Binary { op, lhs, rhs } => write!(f, "({lhs} {} {rhs})", op.symbol()),
            Self::Select {
                cond,
                then_val,
                else_val,
            } => write!(f, "({cond} ? {then_val} : {else_val})"),
            Self::Resize { width, arg } => write!(f, "resize{width}({arg})"),
        }
    }
}

#[cfg(test)]
mod tests;
