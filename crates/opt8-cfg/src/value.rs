//! Constant lattice for register values.

use std::collections::BTreeMap;

use opt8_ir::Reg;

/// Abstract value of one location: `Bottom ⊑ Constant(v) ⊑ Top`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ConstValue {
    /// No value reaches this point yet.
    #[default]
    Bottom,
    Constant(u64),
    /// More than one value, or a value that is not constant.
    Top,
}

impl ConstValue {
    /// Least upper bound.
    #[must_use]
    pub const fn join(self, other: Self) -> Self {
        match (self, other) {
            (Self::Bottom, x) | (x, Self::Bottom) => x,
            (Self::Constant(a), Self::Constant(b)) if a == b => Self::Constant(a),
            _ => Self::Top,
        }
    }

    #[must_use]
    pub const fn as_constant(self) -> Option<u64> {
        match self {
            Self::Constant(val) => Some(val),
            _ => None,
        }
    }

    /// Height in the lattice (0 for bottom).
    #[must_use]
    pub const fn height(self) -> usize {
        match self {
            Self::Bottom => 0,
            Self::Constant(_) => 1,
            Self::Top => 2,
        }
    }
}

/// Height of the [`ConstValue`] lattice.
pub const CONST_LATTICE_HEIGHT: usize = 2;

/// Per-register constant facts. Registers not present are `Bottom`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConstState {
    regs: BTreeMap<Reg, ConstValue>,
}

impl ConstState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// State in which every listed register is `Top`.
    #[must_use]
    pub fn top(regs: impl IntoIterator<Item = Reg>) -> Self {
        Self {
            regs: regs.into_iter().map(|reg| (reg, ConstValue::Top)).collect(),
        }
    }

    #[must_use]
    pub fn get(&self, reg: Reg) -> ConstValue {
        self.regs.get(&reg).copied().unwrap_or_default()
    }

    pub fn set(&mut self, reg: Reg, value: ConstValue) {
        if value == ConstValue::Bottom {
            self.regs.remove(&reg);
        } else {
            self.regs.insert(reg, value);
        }
    }

    pub fn set_constant(&mut self, reg: Reg, val: u64) {
        self.set(reg, ConstValue::Constant(reg.width.truncate(val)));
    }

    pub fn set_top(&mut self, reg: Reg) {
        self.set(reg, ConstValue::Top);
    }

    /// Whether no value reaches this point (every register is `Bottom`).
    #[must_use]
    pub fn is_bottom(&self) -> bool {
        self.regs.is_empty()
    }

    /// Registers with a known constant value.
    pub fn constants(&self) -> impl Iterator<Item = (Reg, u64)> + '_ {
        self.regs
            .iter()
            .filter_map(|(reg, val)| val.as_constant().map(|c| (*reg, c)))
    }

    pub fn iter(&self) -> impl Iterator<Item = (Reg, ConstValue)> + '_ {
        self.regs.iter().map(|(reg, val)| (*reg, *val))
    }

    /// Join another state into this one. Returns true if anything changed.
    pub fn merge(&mut self, other: &Self) -> bool {
        let mut changed = false;
        for (reg, val) in &other.regs {
            let current = self.get(*reg);
            let merged = current.join(*val);
            if merged != current {
                self.set(*reg, merged);
                changed = true;
            }
        }
        changed
    }
}
