use crate::simulation::combination::{is_sub_multiset, FaultCombination};
use std::collections::{HashMap, HashSet};

/// Memoization table of chains already proven exploitable.
///
/// Keyed by the sorted model multiset of each chain so the relevant subset
/// for an arrangement can be gathered quickly. Owned by the coordinator and
/// updated only between arrangement iterations; workers receive a frozen
/// copy of the relevant chains with their work items.
#[derive(Default)]
pub struct KnownFaults {
    by_models: HashMap<Vec<u32>, Vec<FaultCombination>>,
    fingerprints: HashSet<u64>,
}

impl KnownFaults {
    /// All known chains whose model multiset fits into `arrangement`.
    ///
    /// Only those can prune chains built from `arrangement`.
    pub fn prepare(&self, arrangement: &[u32]) -> Vec<FaultCombination> {
        let mut sorted = arrangement.to_vec();
        sorted.sort_unstable();

        let mut relevant = Vec::new();
        for (models, chains) in &self.by_models {
            if is_sub_multiset(models, &sorted) {
                relevant.extend(chains.iter().cloned());
            }
        }
        relevant
    }

    /// Folds a freshly proven chain into the table. Returns false when a
    /// chain with the same fingerprint is already recorded.
    pub fn insert(&mut self, chain: FaultCombination) -> bool {
        if !self.fingerprints.insert(chain.fingerprint()) {
            return false;
        }
        self.by_models
            .entry(chain.model_multiset())
            .or_default()
            .push(chain);
        true
    }

    pub fn len(&self) -> usize {
        self.fingerprints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fingerprints.is_empty()
    }
}

/// A chain is redundant when the shape of a known exploitable chain is
/// contained in its shape: adding more faults to a working attack is not a
/// new finding.
pub fn is_redundant(chain: &FaultCombination, known: &[FaultCombination]) -> bool {
    known.iter().any(|candidate| chain.contains_shape(candidate))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulation::combination::{Fault, FaultTarget};

    fn chain(faults: &[(u32, u32, u64)]) -> FaultCombination {
        FaultCombination {
            faults: faults
                .iter()
                .map(|&(model, parameter, time)| Fault {
                    model,
                    parameter,
                    time,
                    address: 0x1000_0000 + time * 2,
                    target: FaultTarget::Instruction { size: 2 },
                })
                .collect(),
        }
    }

    #[test]
    fn prepare_filters_by_model_multiset() {
        let mut table = KnownFaults::default();
        assert!(table.insert(chain(&[(0, 0, 1)])));
        assert!(table.insert(chain(&[(1, 0, 2)])));
        assert!(table.insert(chain(&[(0, 0, 1), (0, 0, 4)])));

        let relevant = table.prepare(&[0, 0]);
        assert_eq!(relevant.len(), 2);
        assert!(relevant.iter().all(|c| c.model_multiset().iter().all(|&m| m == 0)));

        let relevant = table.prepare(&[0, 1]);
        assert_eq!(relevant.len(), 2);
    }

    #[test]
    fn insert_deduplicates_fingerprints() {
        let mut table = KnownFaults::default();
        assert!(table.insert(chain(&[(0, 0, 1)])));
        // same shape at another time
        assert!(!table.insert(chain(&[(0, 0, 9)])));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn supersets_of_known_chains_are_redundant() {
        let known = vec![chain(&[(0, 0, 1)])];
        assert!(is_redundant(&chain(&[(0, 0, 3)]), &known));
        assert!(is_redundant(&chain(&[(0, 0, 2), (1, 0, 5)]), &known));
        assert!(!is_redundant(&chain(&[(1, 0, 2)]), &known));
    }
}
