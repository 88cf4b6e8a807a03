//! Symbolic machine state: registers and memory cells.

use std::collections::BTreeMap;
use std::fmt;

use opt8_ir::{AliasRelation, Expr, MemVersion, OpaqueId, Reg, SymbolicValue};

use crate::alias::{Access, AliasAnalysis};

/// Value of a register that has not been written in the current region.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum RegDefault {
    /// The register's value at region entry.
    #[default]
    Input,
    /// Nothing is known.
    Unknown,
    /// Clobbered by the call at this address.
    Clobbered(u64),
}

/// Opaque slot used for a register clobbered by a call.
#[must_use]
pub fn clobber_slot(reg: Reg) -> u32 {
    (reg.width.bits() << 8) | u32::from(reg.index)
}

/// A memory cell written in the current region.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MemCell {
    pub access: Access,
    pub value: SymbolicValue,
}

/// Registers and memory at one program point.
///
/// Memory is the entry memory (at `version`) overlaid with the written cells,
/// oldest first.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct SymbolicState {
    regs: BTreeMap<Reg, SymbolicValue>,
    reg_default: RegDefault,
    cells: Vec<MemCell>,
    version: MemVersion,
}

impl SymbolicState {
    /// State in which every location holds its entry value.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// State in which unwritten registers are unknown.
    #[must_use]
    pub fn unknown_registers() -> Self {
        Self {
            reg_default: RegDefault::Unknown,
            ..Self::default()
        }
    }

    #[must_use]
    pub const fn reg_default(&self) -> RegDefault {
        self.reg_default
    }

    #[must_use]
    pub const fn version(&self) -> MemVersion {
        self.version
    }

    /// Written memory cells, oldest first.
    #[must_use]
    pub fn cells(&self) -> &[MemCell] {
        &self.cells
    }

    /// Registers with an explicit value.
    pub fn registers(&self) -> impl Iterator<Item = (Reg, &SymbolicValue)> + '_ {
        self.regs.iter().map(|(reg, val)| (*reg, val))
    }

    #[must_use]
    pub fn read_reg(&self, reg: Reg) -> SymbolicValue {
        if let Some(val) = self.regs.get(&reg) {
            return val.clone();
        }
        match self.reg_default {
            RegDefault::Input => SymbolicValue::Known(Expr::input(reg)),
            RegDefault::Unknown => SymbolicValue::Unknown(reg.width),
            RegDefault::Clobbered(address) => SymbolicValue::Known(Expr::opaque(
                OpaqueId {
                    address,
                    slot: clobber_slot(reg),
                },
                reg.width,
            )),
        }
    }

    pub fn write_reg(&mut self, reg: Reg, value: SymbolicValue) {
        self.regs.insert(reg, value);
    }

    /// Read memory, consulting written cells newest first.
    #[must_use]
    pub fn read_mem(&self, access: &Access, alias: &AliasAnalysis) -> SymbolicValue {
        for cell in self.cells.iter().rev() {
            match alias.relation(&cell.access, access) {
                AliasRelation::MustAlias => return cell.value.clone(),
                AliasRelation::MayAlias => return SymbolicValue::Unknown(access.width),
                AliasRelation::NoAlias => {}
            }
        }
        match &access.addr {
            SymbolicValue::Known(addr) => SymbolicValue::Known(Expr::load(
                self.version,
                addr.clone(),
                access.width,
            )),
            SymbolicValue::Unknown(_) => SymbolicValue::Unknown(access.width),
        }
    }

    /// Write memory. Must-aliased cells are replaced and may-aliased cells
    /// become unknown.
    pub fn write_mem(&mut self, access: Access, value: SymbolicValue, alias: &AliasAnalysis) {
        self.cells.retain_mut(|cell| match alias.relation(&cell.access, &access) {
            AliasRelation::MustAlias => false,
            AliasRelation::MayAlias => {
                cell.value = SymbolicValue::Unknown(cell.access.width);
                true
            }
            AliasRelation::NoAlias => true,
        });
        self.cells.push(MemCell { access, value });
    }

    /// Forget every register value.
    pub fn clobber_registers(&mut self) {
        self.regs.clear();
        self.reg_default = RegDefault::Unknown;
    }

    /// Apply a call barrier at `address`: every register and all memory get
    /// fresh identities tied to the call.
    pub fn clobber_all(&mut self, address: u64) {
        self.regs.clear();
        if self.reg_default != RegDefault::Unknown {
            self.reg_default = RegDefault::Clobbered(address);
        }
        self.cells.clear();
        self.version = MemVersion::AfterBarrier(address);
    }
}

impl fmt::Display for SymbolicState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (reg, val) in &self.regs {
            writeln!(f, "{reg} = {val}")?;
        }
        for cell in &self.cells {
            match &cell.access.addr {
                SymbolicValue::Known(addr) => {
                    writeln!(f, "mem{}[{addr}] = {}", cell.access.width, cell.value)?;
                }
                SymbolicValue::Unknown(_) => {
                    writeln!(f, "mem{}[?] = {}", cell.access.width, cell.value)?;
                }
            }
        }
        Ok(())
    }
}
