//! Run-wide assumptions that gate which optimizations are legal.
//!
//! An [`InvariantSet`] is fixed before a pipeline starts and passed by
//! reference to every pass. Changing it means restarting from the original
//! function.

use std::fmt;

use thiserror::Error;

/// Boolean invariants that a rewrite may depend on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Invariant {
    /// Stores never modify the instruction stream being analysed.
    NoSelfModifyingCode,
    /// Memory writes never change register values.
    RegisterFileDisjointFromMemory,
    /// Nothing outside the function observes memory after it returns.
    NoExternalMemoryObservers,
}

impl Invariant {
    pub const ALL: [Self; 3] = [
        Self::NoSelfModifyingCode,
        Self::RegisterFileDisjointFromMemory,
        Self::NoExternalMemoryObservers,
    ];

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::NoSelfModifyingCode => "no-self-modifying-code",
            Self::RegisterFileDisjointFromMemory => "register-file-disjoint-from-memory",
            Self::NoExternalMemoryObservers => "no-external-memory-observers",
        }
    }
}

impl fmt::Display for Invariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Granularity at which memory accesses are compared for aliasing.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AliasGranularity {
    /// Accesses alias when their byte ranges overlap.
    #[default]
    Byte,
    /// Accesses alias only when they name the same cell (same base, offset
    /// and width); distinct cells never overlap.
    Cell,
}

impl fmt::Display for AliasGranularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Byte => f.write_str("byte"),
            Self::Cell => f.write_str("cell"),
        }
    }
}

/// Rejected invariant setting.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid invariant `{name}`: {reason}")]
pub struct InvalidInvariant {
    pub name: String,
    pub reason: String,
}

const GRANULARITY: &str = "memory-alias-granularity";

/// Immutable set of invariants for one optimization run.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct InvariantSet {
    no_self_modifying_code: bool,
    register_file_disjoint_from_memory: bool,
    no_external_memory_observers: bool,
    alias_granularity: AliasGranularity,
}

impl Default for InvariantSet {
    fn default() -> Self {
        Self {
            no_self_modifying_code: true,
            register_file_disjoint_from_memory: true,
            no_external_memory_observers: false,
            alias_granularity: AliasGranularity::Byte,
        }
    }
}

impl InvariantSet {
    /// Set with every boolean invariant false.
    #[must_use]
    pub const fn none() -> Self {
        Self {
            no_self_modifying_code: false,
            register_file_disjoint_from_memory: false,
            no_external_memory_observers: false,
            alias_granularity: AliasGranularity::Byte,
        }
    }

    #[must_use]
    pub const fn holds(&self, invariant: Invariant) -> bool {
        match invariant {
            Invariant::NoSelfModifyingCode => self.no_self_modifying_code,
            Invariant::RegisterFileDisjointFromMemory => self.register_file_disjoint_from_memory,
            Invariant::NoExternalMemoryObservers => self.no_external_memory_observers,
        }
    }

    #[must_use]
    pub const fn alias_granularity(&self) -> AliasGranularity {
        self.alias_granularity
    }

    /// Copy of this set with `invariant` set to `value`.
    #[must_use]
    pub const fn with(mut self, invariant: Invariant, value: bool) -> Self {
        match invariant {
            Invariant::NoSelfModifyingCode => self.no_self_modifying_code = value,
            Invariant::RegisterFileDisjointFromMemory => {
                self.register_file_disjoint_from_memory = value;
            }
            Invariant::NoExternalMemoryObservers => self.no_external_memory_observers = value,
        }
        self
    }

    #[must_use]
    pub const fn with_alias_granularity(mut self, granularity: AliasGranularity) -> Self {
        self.alias_granularity = granularity;
        self
    }

    /// Boolean invariants that hold.
    pub fn active(&self) -> impl Iterator<Item = Invariant> + '_ {
        Invariant::ALL.into_iter().filter(|inv| self.holds(*inv))
    }

    /// Copy of this set with the setting `name = value` applied.
    ///
    /// Names are matched ignoring case, `-` and `_`, so both
    /// `no-self-modifying-code` and `NoSelfModifyingCode` are accepted.
    pub fn set(self, name: &str, value: &str) -> Result<Self, InvalidInvariant> {
        let key = canonical_name(name);
        let invalid = |reason: String| InvalidInvariant {
            name: name.to_string(),
            reason,
        };
        if key == canonical_name(GRANULARITY) {
            let granularity = match value.trim().to_ascii_lowercase().as_str() {
                "byte" => AliasGranularity::Byte,
                "cell" => AliasGranularity::Cell,
                other => return Err(invalid(format!("expected `byte` or `cell`, got `{other}`"))),
            };
            return Ok(self.with_alias_granularity(granularity));
        }
        let Some(invariant) = Invariant::ALL
            .into_iter()
            .find(|inv| canonical_name(inv.name()) == key)
        else {
            return Err(invalid("unknown invariant".to_string()));
        };
        let flag = match value.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" | "on" | "1" => true,
            "false" | "no" | "off" | "0" => false,
            other => return Err(invalid(format!("expected a boolean, got `{other}`"))),
        };
        Ok(self.with(invariant, flag))
    }

    /// Apply a `name=value` assignment. A bare `name` means `name=true`.
    pub fn apply(self, assignment: &str) -> Result<Self, InvalidInvariant> {
        match assignment.split_once('=') {
            Some((name, value)) => self.set(name.trim(), value),
            None => self.set(assignment.trim(), "true"),
        }
    }
}

impl fmt::Display for InvariantSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for inv in Invariant::ALL {
            write!(f, "{}={},", inv.name(), self.holds(inv))?;
        }
        write!(f, "{GRANULARITY}={}", self.alias_granularity)
    }
}

fn canonical_name(name: &str) -> String {
    name.chars()
        .filter(|c| *c != '-' && *c != '_')
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let set = InvariantSet::default();
        assert!(set.holds(Invariant::NoSelfModifyingCode));
        assert!(set.holds(Invariant::RegisterFileDisjointFromMemory));
        assert!(!set.holds(Invariant::NoExternalMemoryObservers));
        assert_eq!(set.alias_granularity(), AliasGranularity::Byte);
    }

    #[test]
    fn test_set_by_either_spelling() {
        let set = InvariantSet::default()
            .set("NoExternalMemoryObservers", "true")
            .unwrap()
            .set("no-self-modifying-code", "false")
            .unwrap()
            .set("MemoryAliasGranularity", "cell")
            .unwrap();
        assert!(set.holds(Invariant::NoExternalMemoryObservers));
        assert!(!set.holds(Invariant::NoSelfModifyingCode));
        assert_eq!(set.alias_granularity(), AliasGranularity::Cell);
    }

    #[test]
    fn test_apply_bare_name() {
        let set = InvariantSet::none().apply("no-external-memory-observers").unwrap();
        assert_eq!(set.active().collect::<Vec<_>>(), vec![
            Invariant::NoExternalMemoryObservers
        ]);
    }

    #[test]
    fn test_invalid_settings() {
        assert!(InvariantSet::default().set("no-such-thing", "true").is_err());
        assert!(InvariantSet::default().set("no-self-modifying-code", "maybe").is_err());
        assert!(InvariantSet::default().set(GRANULARITY, "word").is_err());
    }

    #[test]
    fn test_sets_differ_in_hash_key() {
        let a = InvariantSet::default();
        let b = a.clone().with(Invariant::NoExternalMemoryObservers, true);
        assert_ne!(a, b);
        assert_ne!(a.to_string(), b.to_string());
    }
}
