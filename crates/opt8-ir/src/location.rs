//! Registers, memory references and storage locations.

use std::fmt;

use crate::width::Width;

/// A machine register. The width is part of the register's identity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Reg {
    pub index: u8,
    pub width: Width,
}

impl Reg {
    #[must_use]
    pub const fn new(index: u8, width: Width) -> Self {
        Self { index, width }
    }
}

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "R{}", self.index)?;
        if self.width != Width::W8 {
            write!(f, ".{}", self.width)?;
        }
        Ok(())
    }
}

/// Syntactic memory reference `[base + offset]`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MemRef {
    /// Base register, or `None` for an absolute address.
    pub base: Option<Reg>,
    /// Signed displacement added to the base.
    pub offset: i64,
    /// Access width.
    pub width: Width,
    /// Width of the address computation when there is no base register.
    pub addr_width: Width,
}

impl MemRef {
    /// Memory reference relative to a base register.
    #[must_use]
    pub const fn based(base: Reg, offset: i64, width: Width) -> Self {
        Self {
            base: Some(base),
            offset,
            width,
            addr_width: base.width,
        }
    }

    /// Memory reference at an absolute address.
    #[must_use]
    pub const fn absolute(addr: u64, width: Width, addr_width: Width) -> Self {
        Self {
            base: None,
            offset: addr as i64,
            width,
            addr_width,
        }
    }

    /// Width of the computed address.
    #[must_use]
    pub const fn address_width(&self) -> Width {
        match self.base {
            Some(base) => base.width,
            None => self.addr_width,
        }
    }
}

impl fmt::Display for MemRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.base {
            Some(base) if self.offset == 0 => write!(f, "[{base}]")?,
            Some(base) if self.offset < 0 => write!(f, "[{base}-{}]", self.offset.unsigned_abs())?,
            Some(base) => write!(f, "[{base}+{}]", self.offset)?,
            None => write!(f, "[{:#x}]", self.offset as u64)?,
        }
        if self.width != Width::W8 {
            write!(f, ".{}", self.width)?;
        }
        Ok(())
    }
}

/// A storage location read or written by an instruction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Location {
    Reg(Reg),
    Mem(MemRef),
}

impl Location {
    #[must_use]
    pub const fn as_reg(&self) -> Option<Reg> {
        match self {
            Self::Reg(reg) => Some(*reg),
            Self::Mem(_) => None,
        }
    }

    #[must_use]
    pub const fn is_memory(&self) -> bool {
        matches!(self, Self::Mem(_))
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reg(reg) => reg.fmt(f),
            Self::Mem(mem) => mem.fmt(f),
        }
    }
}

/// Three-valued relation between two memory locations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AliasRelation {
    /// The locations never overlap.
    NoAlias,
    /// The locations may overlap.
    MayAlias,
    /// The locations always refer to exactly the same storage.
    MustAlias,
}

impl AliasRelation {
    /// Whether a write to one location can affect the other.
    #[must_use]
    pub const fn may_overlap(self) -> bool {
        !matches!(self, Self::NoAlias)
    }
}
