//! Three-valued alias analysis over symbolic addresses.

use opt8_ir::{AliasGranularity, AliasRelation, Expr, ExprRef, SymbolicValue, Width, normalize};

/// A memory access: symbolic address plus access width.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Access {
    pub addr: SymbolicValue,
    pub width: Width,
}

impl Access {
    #[must_use]
    pub const fn new(addr: SymbolicValue, width: Width) -> Self {
        Self { addr, width }
    }
}

/// Address split into a symbolic base and a constant displacement.
#[derive(Debug)]
struct Decomposed {
    base: Option<ExprRef>,
    offset: u64,
    addr_width: Width,
}

fn decompose(addr: &ExprRef) -> Decomposed {
    let addr_width = addr.width();
    let norm = normalize(addr);
    match norm.as_ref() {
        Expr::Const { value, .. } => Decomposed {
            base: None,
            offset: *value,
            addr_width,
        },
        Expr::Binary {
            op: opt8_ir::BinaryOp::Add,
            lhs,
            rhs,
        } if rhs.is_const() => Decomposed {
            base: Some(lhs.clone()),
            offset: rhs.as_const().unwrap_or(0),
            addr_width,
        },
        _ => Decomposed {
            base: Some(norm),
            offset: 0,
            addr_width,
        },
    }
}

/// Alias oracle parameterised by the active granularity.
#[derive(Clone, Copy, Debug, Default)]
pub struct AliasAnalysis {
    granularity: AliasGranularity,
}

impl AliasAnalysis {
    #[must_use]
    pub const fn new(granularity: AliasGranularity) -> Self {
        Self { granularity }
    }

    /// Relation between two accesses.
    ///
    /// Accesses whose addresses share a symbolic base are compared by their
    /// constant displacements; anything else may alias.
    #[must_use]
    pub fn relation(&self, a: &Access, b: &Access) -> AliasRelation {
        let (Some(ea), Some(eb)) = (a.addr.as_expr(), b.addr.as_expr()) else {
            return AliasRelation::MayAlias;
        };
        let da = decompose(ea);
        let db = decompose(eb);
        if da.addr_width != db.addr_width || da.base != db.base {
            return AliasRelation::MayAlias;
        }
        let exact = da.offset == db.offset;
        match self.granularity {
            AliasGranularity::Cell => {
                if exact && a.width == b.width {
                    AliasRelation::MustAlias
                } else if exact {
                    AliasRelation::MayAlias
                } else {
                    AliasRelation::NoAlias
                }
            }
            AliasGranularity::Byte => {
                if exact && a.width == b.width {
                    return AliasRelation::MustAlias;
                }
                let space = da.addr_width;
                let a_to_b = space.truncate(db.offset.wrapping_sub(da.offset));
                let b_to_a = space.truncate(da.offset.wrapping_sub(db.offset));
                if a_to_b < a.width.bytes() || b_to_a < b.width.bytes() {
                    AliasRelation::MayAlias
                } else {
                    AliasRelation::NoAlias
                }
            }
        }
    }
}
