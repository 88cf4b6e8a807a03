use super::*;

fn r(i: u8) -> ExprRef {
    Expr::input(Reg::new(i, Width::W8))
}

fn c(v: u64) -> ExprRef {
    Expr::constant(v, Width::W8)
}

/// Environment where register `Rn` holds `seed * (n + 1)` and memory byte
/// `a` holds `a ^ seed`.
struct SeedEnv(u64);

impl Env for SeedEnv {
    fn input(&self, reg: Reg) -> u64 {
        self.0.wrapping_mul(u64::from(reg.index) + 1)
    }

    fn opaque(&self, id: OpaqueId, _width: Width) -> u64 {
        id.address ^ self.0
    }

    fn memory_byte(&self, _version: MemVersion, addr: u64) -> u8 {
        (addr ^ self.0) as u8
    }
}

#[test]
fn test_constant_truncates() {
    assert_eq!(c(0x1FF).as_const(), Some(0xFF));
}

#[test]
fn test_add_folds_constants() {
    let e = Expr::add(c(2), c(3));
    assert_eq!(e.as_const(), Some(5));
    let e = Expr::add(c(0xFF), c(2));
    assert_eq!(e.as_const(), Some(1));
}

#[test]
fn test_add_zero_identity() {
    let x = r(1);
    assert_eq!(Expr::add(x.clone(), c(0)), x);
    assert_eq!(Expr::add(c(0), x.clone()), x);
}

#[test]
fn test_self_cancelling_ops() {
    let x = r(1);
    assert_eq!(Expr::sub(x.clone(), x.clone()).as_const(), Some(0));
    assert_eq!(Expr::xor(x.clone(), x.clone()).as_const(), Some(0));
    assert_eq!(Expr::and(x.clone(), x.clone()), x);
    assert_eq!(Expr::or(x.clone(), x.clone()), x);
    assert_eq!(Expr::ne(x.clone(), x.clone()).as_const(), Some(0));
    assert_eq!(Expr::eq(x.clone(), x).as_const(), Some(1));
}

#[test]
fn test_double_negation() {
    let x = r(1);
    assert_eq!(Expr::not(Expr::not(x.clone())), x);
    assert_eq!(Expr::neg(Expr::neg(x.clone())), x);
}

#[test]
fn test_shift_out_of_range_is_zero() {
    assert_eq!(BinaryOp::Shl.apply(1, 8, Width::W8), 0);
    assert_eq!(BinaryOp::Shr.apply(0x80, 9, Width::W8), 0);
    assert_eq!(Expr::shl(r(1), c(8)).as_const(), Some(0));
}

#[test]
fn test_comparisons_are_bytes() {
    let x = Expr::input(Reg::new(1, Width::W16));
    let e = Expr::ltu(x.clone(), Expr::constant(5, Width::W16));
    assert_eq!(e.width(), Width::W8);
    assert_eq!(Expr::ltu(x, Expr::constant(0, Width::W16)).as_const(), Some(0));
}

#[test]
fn test_select_folding() {
    let x = r(1);
    let y = r(2);
    assert_eq!(Expr::select(c(1), x.clone(), y.clone()), x);
    assert_eq!(Expr::select(c(0), x.clone(), y.clone()), y);
    assert_eq!(Expr::select(r(3), x.clone(), x.clone()), x);
}

#[test]
fn test_resize_chain() {
    let x = r(1);
    let wide = Expr::resize(x.clone(), Width::W32);
    assert_eq!(Expr::resize(wide, Width::W8), x);
    assert_eq!(
        Expr::resize(Expr::constant(0x1234, Width::W16), Width::W8).as_const(),
        Some(0x34)
    );
}

#[test]
fn test_load_is_little_endian() {
    let addr = Expr::constant(0x10, Width::W16);
    let e = Expr::load(MemVersion::Entry, addr, Width::W16);
    let env = SeedEnv(0);
    assert_eq!(e.eval(&env), 0x1110);
}

#[test]
fn test_normalize_commutative_add() {
    let a = Expr::add(r(1), r(2));
    let b = Expr::add(r(2), r(1));
    assert_ne!(a, b);
    assert_eq!(normalize(&a), normalize(&b));
}

#[test]
fn test_normalize_double_is_shift() {
    let sum = Expr::add(r(1), r(1));
    let shifted = Expr::shl(r(1), c(1));
    let scaled = Expr::mul(r(1), c(2));
    assert_eq!(normalize(&sum), normalize(&shifted));
    assert_eq!(normalize(&sum), normalize(&scaled));
}

#[test]
fn test_normalize_constant_offsets() {
    // (x + 3) + 4 == x + 7
    let a = Expr::add(Expr::add(r(1), c(3)), c(4));
    let b = Expr::add(r(1), c(7));
    assert_eq!(normalize(&a), normalize(&b));
    // (x + y) - y == x
    let d = Expr::sub(Expr::add(r(1), r(2)), r(2));
    assert_eq!(normalize(&d), r(1));
}

#[test]
fn test_normalize_not_as_negation() {
    // ~x + 1 == -x
    let a = Expr::add(Expr::not(r(1)), c(1));
    let b = Expr::neg(r(1));
    assert_eq!(normalize(&a), normalize(&b));
}

#[test]
fn test_normalize_xor_chain_cancels() {
    let e = Expr::xor(Expr::xor(r(1), r(2)), r(1));
    assert_eq!(normalize(&e), r(2));
}

#[test]
fn test_normalize_equality_orientation() {
    let a = Expr::eq(Expr::add(r(1), c(1)), c(6));
    let b = Expr::eq(c(5), r(1));
    assert_eq!(normalize(&a), normalize(&b));
}

#[test]
fn test_normalize_preserves_value() {
    let exprs = [
        Expr::sub(Expr::mul(r(1), c(6)), Expr::shl(r(2), c(2))),
        Expr::and(Expr::or(r(1), c(0x0F)), Expr::xor(r(2), r(3))),
        Expr::select(
            Expr::ltu(r(1), r(2)),
            Expr::not(r(3)),
            Expr::neg(Expr::add(r(1), c(9))),
        ),
        Expr::eq(Expr::sub(r(4), c(3)), Expr::add(r(5), r(5))),
        Expr::load(
            MemVersion::Entry,
            Expr::resize(Expr::add(r(1), c(1)), Width::W16),
            Width::W8,
        ),
    ];
    for seed in [0u64, 1, 7, 0x55, 0xFF, 0x1234_5678] {
        let env = SeedEnv(seed);
        for e in &exprs {
            assert_eq!(e.eval(&env), normalize(e).eval(&env), "{e}");
        }
    }
}

#[test]
fn test_normalize_idempotent() {
    let e = Expr::add(Expr::mul(r(1), c(3)), Expr::sub(r(2), Expr::not(r(1))));
    let once = normalize(&e);
    assert_eq!(normalize(&once), once);
}

#[test]
fn test_leaves() {
    let load = Expr::load(MemVersion::Entry, r(3), Width::W8);
    let e = Expr::add(load, Expr::opaque(OpaqueId { address: 4, slot: 0 }, Width::W8));
    let mut count = 0;
    e.for_each_leaf(&mut |_| count += 1);
    // load, R3, opaque
    assert_eq!(count, 3);
}
