//! Insert-only cache of proof results.

use metrics::counter;
use opt8_ir::InvariantSet;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::obligation::ProofObligation;
use crate::verdict::Verdict;

/// Full structural key: both sequences, their context and the invariants.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CacheKey {
    obligation: ProofObligation,
    invariants: InvariantSet,
}

impl CacheKey {
    #[must_use]
    pub fn new(obligation: &ProofObligation, invariants: &InvariantSet) -> Self {
        Self {
            obligation: obligation.clone(),
            invariants: invariants.clone(),
        }
    }
}

/// Shared verdict cache. Entries are never replaced once written.
#[derive(Debug, Default)]
pub struct ProofCache {
    entries: RwLock<FxHashMap<CacheKey, Verdict>>,
}

impl ProofCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, key: &CacheKey) -> Option<Verdict> {
        let hit = self.entries.read().get(key).cloned();
        if hit.is_some() {
            counter!("opt8_proof_cache_hits_total").increment(1);
        }
        hit
    }

    /// Record a verdict. Transient verdicts and existing keys are ignored.
    pub fn insert(&self, key: CacheKey, verdict: &Verdict) {
        if !verdict.is_stable() {
            return;
        }
        self.entries.write().entry(key).or_insert_with(|| verdict.clone());
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verdict::UnknownReason;
    use opt8_ir::Instruction;

    fn key() -> CacheKey {
        let ob = ProofObligation::new(vec![Instruction::nop(0)], Vec::new(), 1);
        CacheKey::new(&ob, &InvariantSet::default())
    }

    #[test]
    fn test_insert_only() {
        let cache = ProofCache::new();
        cache.insert(key(), &Verdict::Equivalent);
        cache.insert(key(), &Verdict::Unknown(UnknownReason::UnknownValue));
        assert_eq!(cache.get(&key()), Some(Verdict::Equivalent));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_transient_verdicts_not_cached() {
        let cache = ProofCache::new();
        cache.insert(key(), &Verdict::Unknown(UnknownReason::SolverTimeout));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_key_includes_invariants() {
        let ob = ProofObligation::new(vec![Instruction::nop(0)], Vec::new(), 1);
        let cache = ProofCache::new();
        cache.insert(CacheKey::new(&ob, &InvariantSet::default()), &Verdict::Equivalent);
        assert!(cache.get(&CacheKey::new(&ob, &InvariantSet::none())).is_none());
    }
}
