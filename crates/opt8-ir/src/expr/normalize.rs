//! Canonical form for expressions.
//!
//! Two expressions with the same normal form are equal for every
//! assignment of their leaves. The converse does not hold.
//!
//! Arithmetic over `Add`, `Sub`, `Neg`, `Not`, multiplication by a constant
//! and shifts left by a constant is rewritten as a linear combination
//! `c1*t1 + c2*t2 + ... + k` with terms in a fixed order. Chains of `And`,
//! `Or` and `Xor` are flattened and sorted; equality tests are rewritten as
//! `lhs - rhs == 0` over the linear form.

use std::collections::BTreeMap;
use std::sync::Arc;

use super::{BinaryOp, Expr, ExprRef, UnaryOp};
use crate::width::Width;

/// Normalize an expression.
#[must_use]
pub fn normalize(expr: &ExprRef) -> ExprRef {
    match expr.as_ref() {
        Expr::Const { .. } | Expr::Input(_) | Expr::Opaque { .. } => Arc::clone(expr),
        Expr::Load {
            version,
            addr,
            width,
        } => Expr::load(*version, normalize(addr), *width),
        Expr::Resize { width, arg } => Expr::resize(normalize(arg), *width),
        Expr::Select {
            cond,
            then_val,
            else_val,
        } => Expr::select(normalize(cond), normalize(then_val), normalize(else_val)),
        Expr::Unary { .. } => normalize_linear(expr),
        Expr::Binary { op, lhs, rhs } => match op {
            BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Shl => normalize_linear(expr),
            BinaryOp::And | BinaryOp::Or | BinaryOp::Xor => normalize_bitwise(*op, expr),
            BinaryOp::Eq | BinaryOp::Ne => normalize_equality(*op, lhs, rhs),
            BinaryOp::Shr | BinaryOp::Ltu | BinaryOp::Geu => {
                Expr::binary(*op, normalize(lhs), normalize(rhs))
            }
        },
    }
}

/// Linear combination of atomic terms plus a constant, modulo 2^width.
struct Linear {
    width: Width,
    terms: BTreeMap<ExprRef, u64>,
    constant: u64,
}

impl Linear {
    const fn new(width: Width) -> Self {
        Self {
            width,
            terms: BTreeMap::new(),
            constant: 0,
        }
    }

    fn add_constant(&mut self, coeff: u64, value: u64) {
        self.constant = self
            .width
            .truncate(self.constant.wrapping_add(coeff.wrapping_mul(value)));
    }

    fn add_term(&mut self, coeff: u64, term: ExprRef) {
        if let Some(value) = term.as_const() {
            self.add_constant(coeff, value);
            return;
        }
        let width = self.width;
        let entry = self.terms.entry(term).or_insert(0);
        *entry = width.truncate(entry.wrapping_add(coeff));
    }

    /// Accumulate `coeff * expr`.
    ///
    /// When `normalized` is set, `expr` is already in normal form and its
    /// non-linear subterms are taken as they are.
    fn collect(&mut self, coeff: u64, expr: &ExprRef, normalized: bool) {
        let width = self.width;
        match expr.as_ref() {
            Expr::Const { value, .. } => self.add_constant(coeff, *value),
            Expr::Unary {
                op: UnaryOp::Neg,
                arg,
            } => self.collect(coeff.wrapping_neg(), arg, normalized),
            // ~x == -x - 1
            Expr::Unary {
                op: UnaryOp::Not,
                arg,
            } => {
                self.collect(coeff.wrapping_neg(), arg, normalized);
                self.add_constant(coeff, width.mask());
            }
            Expr::Binary {
                op: BinaryOp::Add,
                lhs,
                rhs,
            } => {
                self.collect(coeff, lhs, normalized);
                self.collect(coeff, rhs, normalized);
            }
            Expr::Binary {
                op: BinaryOp::Sub,
                lhs,
                rhs,
            } => {
                self.collect(coeff, lhs, normalized);
                self.collect(coeff.wrapping_neg(), rhs, normalized);
            }
            Expr::Binary {
                op: BinaryOp::Mul,
                lhs,
                rhs,
            } => {
                let (l, r) = if normalized {
                    (Arc::clone(lhs), Arc::clone(rhs))
                } else {
                    (normalize(lhs), normalize(rhs))
                };
                if let Some(c) = r.as_const() {
                    self.collect(coeff.wrapping_mul(c), &l, true);
                } else if let Some(c) = l.as_const() {
                    self.collect(coeff.wrapping_mul(c), &r, true);
                } else {
                    let (a, b) = if l <= r { (l, r) } else { (r, l) };
                    self.add_term(coeff, Expr::mul(a, b));
                }
            }
            Expr::Binary {
                op: BinaryOp::Shl,
                lhs,
                rhs,
            } => {
                let amount = if normalized {
                    Arc::clone(rhs)
                } else {
                    normalize(rhs)
                };
                match amount.as_const() {
                    Some(s) if s >= u64::from(width.bits()) => {}
                    Some(s) => self.collect(coeff.wrapping_mul(1u64 << s), lhs, normalized),
                    None => {
                        let base = if normalized {
                            Arc::clone(lhs)
                        } else {
                            normalize(lhs)
                        };
                        self.add_term(coeff, Expr::shl(base, amount));
                    }
                }
            }
            _ => {
                let term = if normalized {
                    Arc::clone(expr)
                } else {
                    normalize(expr)
                };
                if is_linear_node(&term) && !normalized {
                    self.collect(coeff, &term, true);
                } else {
                    self.add_term(coeff, term);
                }
            }
        }
    }

    fn rebuild(self) -> ExprRef {
        let width = self.width;
        let mut sum: Option<ExprRef> = None;
        for (term, coeff) in self.terms {
            if coeff == 0 {
                continue;
            }
            let scaled = if coeff == 1 {
                term
            } else {
                Expr::mul(term, Expr::constant(coeff, width))
            };
            sum = Some(match sum {
                Some(acc) => Expr::add(acc, scaled),
                None => scaled,
            });
        }
        let constant = Expr::constant(self.constant, width);
        match sum {
            Some(acc) => Expr::add(acc, constant),
            None => constant,
        }
    }
}

const fn is_linear_node(expr: &Expr) -> bool {
    matches!(
        expr,
        Expr::Unary { .. }
            | Expr::Binary {
                op: BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Shl,
                ..
            }
    )
}

fn normalize_linear(expr: &ExprRef) -> ExprRef {
    let mut linear = Linear::new(expr.width());
    linear.collect(1, expr, false);
    linear.rebuild()
}

fn flatten_bitwise(op: BinaryOp, expr: &ExprRef, normalized: bool, out: &mut Vec<ExprRef>) {
    if let Expr::Binary { op: inner, lhs, rhs } = expr.as_ref() {
        if *inner == op {
            flatten_bitwise(op, lhs, normalized, out);
            flatten_bitwise(op, rhs, normalized, out);
            return;
        }
    }
    if normalized {
        out.push(Arc::clone(expr));
    } else {
        flatten_bitwise(op, &normalize(expr), true, out);
    }
}

fn normalize_bitwise(op: BinaryOp, expr: &ExprRef) -> ExprRef {
    let width = expr.width();
    let mut operands = Vec::new();
    flatten_bitwise(op, expr, false, &mut operands);

    let identity = match op {
        BinaryOp::And => width.mask(),
        _ => 0,
    };
    let mut constant = identity;
    let mut terms: Vec<ExprRef> = Vec::new();
    for operand in operands {
        match operand.as_const() {
            Some(value) => constant = op.apply(constant, value, width),
            None => terms.push(operand),
        }
    }
    terms.sort();
    if op == BinaryOp::Xor {
        // x ^ x == 0
        let mut kept: Vec<ExprRef> = Vec::with_capacity(terms.len());
        for term in terms {
            if kept.last() == Some(&term) {
                kept.pop();
            } else {
                kept.push(term);
            }
        }
        terms = kept;
    } else {
        terms.dedup();
    }

    let mut acc: Option<ExprRef> = None;
    for term in terms {
        acc = Some(match acc {
            Some(prev) => Expr::binary(op, prev, term),
            None => term,
        });
    }
    let constant = Expr::constant(constant, width);
    match acc {
        Some(prev) => Expr::binary(op, prev, constant),
        None => constant,
    }
}

fn normalize_equality(op: BinaryOp, lhs: &ExprRef, rhs: &ExprRef) -> ExprRef {
    let width = lhs.width();
    let mut linear = Linear::new(width);
    linear.collect(1, lhs, false);
    linear.collect(width.mask(), rhs, false);

    // Fix the sign so that `a == b` and `b == a` agree.
    let leading_negative = linear
        .terms
        .values()
        .find(|c| **c != 0)
        .is_some_and(|c| *c & width.sign_bit() != 0);
    if leading_negative {
        for coeff in linear.terms.values_mut() {
            *coeff = width.truncate(coeff.wrapping_neg());
        }
        linear.constant = width.truncate(linear.constant.wrapping_neg());
    }
    let rhs_const = width.truncate(linear.constant.wrapping_neg());
    linear.constant = 0;
    let diff = linear.rebuild();
    Expr::binary(op, diff, Expr::constant(rhs_const, width))
}
