//! Bit-vector widths.
//!
//! These are generic machine word widths, not tied to any instruction set.

use std::fmt;

/// Width of a register, memory access or expression in bits.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Width {
    #[default]
    W8,
    W16,
    W32,
    W64,
}

impl Width {
    /// All widths, narrowest first.
    pub const ALL: [Self; 4] = [Self::W8, Self::W16, Self::W32, Self::W64];

    /// Number of bits.
    #[must_use]
    pub const fn bits(self) -> u32 {
        match self {
            Self::W8 => 8,
            Self::W16 => 16,
            Self::W32 => 32,
            Self::W64 => 64,
        }
    }

    /// Number of bytes.
    #[must_use]
    pub const fn bytes(self) -> u64 {
        (self.bits() / 8) as u64
    }

    /// Mask selecting the low `bits()` bits.
    #[must_use]
    pub const fn mask(self) -> u64 {
        match self {
            Self::W64 => u64::MAX,
            _ => (1u64 << self.bits()) - 1,
        }
    }

    /// Most significant bit of this width.
    #[must_use]
    pub const fn sign_bit(self) -> u64 {
        1u64 << (self.bits() - 1)
    }

    /// Truncate a value to this width.
    #[must_use]
    pub const fn truncate(self, val: u64) -> u64 {
        val & self.mask()
    }

    /// Interpret the low bits of `val` as a signed value of this width.
    #[must_use]
    pub const fn sign_extend(self, val: u64) -> i64 {
        let shift = 64 - self.bits();
        ((val << shift) as i64) >> shift
    }

    /// Width with the given number of bits.
    #[must_use]
    pub const fn from_bits(bits: u32) -> Option<Self> {
        match bits {
            8 => Some(Self::W8),
            16 => Some(Self::W16),
            32 => Some(Self::W32),
            64 => Some(Self::W64),
            _ => None,
        }
    }
}

impl fmt::Display for Width {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.bits())
    }
}
