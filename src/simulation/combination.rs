use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use unicorn_engine::RegisterARM;

/// Where a concrete fault strikes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultTarget {
    /// An instruction of the collected order, identified by its width.
    Instruction { size: u8 },
    /// A CPU register.
    Register { register: RegisterARM },
}

/// A single concrete injection: model, parameter, time and location.
///
/// Models are referenced by their index into the engine's model table, so
/// combinations stay free of lifetimes and are cheap to ship across threads.
#[derive(Debug, Clone, PartialEq)]
pub struct Fault {
    /// Index into the model table of the running simulation.
    pub model: u32,
    /// Index into the model's parameter space.
    pub parameter: u32,
    /// Instruction counter at which the fault is injected.
    pub time: u64,
    /// Address of the targeted instruction site.
    pub address: u64,
    pub target: FaultTarget,
}

impl Fault {
    /// Time-independent key of the concrete parameters, including the
    /// targeted register where applicable. Two faults of the same model with
    /// equal keys have the same effect modulo timing.
    pub fn parameter_key(&self) -> u64 {
        match self.target {
            FaultTarget::Instruction { .. } => self.parameter as u64,
            FaultTarget::Register { register } => ((register as u64) << 32) | self.parameter as u64,
        }
    }
}

/// An ordered chain of faults injected into one replay.
///
/// Faults are kept in temporal order of injection; `time` values are
/// strictly increasing by construction.
#[derive(Debug, Clone, Default)]
pub struct FaultCombination {
    pub faults: Vec<Fault>,
}

impl FaultCombination {
    pub fn len(&self) -> usize {
        self.faults.len()
    }

    pub fn is_empty(&self) -> bool {
        self.faults.is_empty()
    }

    /// Returns a copy of this chain extended by one more fault.
    pub fn with(&self, fault: Fault) -> Self {
        let mut faults = self.faults.clone();
        faults.push(fault);
        Self { faults }
    }

    /// Canonical time-independent shape: the sorted list of
    /// (model, parameter key) pairs.
    pub fn shape(&self) -> Vec<(u32, u64)> {
        let mut shape: Vec<(u32, u64)> = self
            .faults
            .iter()
            .map(|fault| (fault.model, fault.parameter_key()))
            .collect();
        shape.sort_unstable();
        shape
    }

    /// Sorted multiset of the model indices used by this chain.
    pub fn model_multiset(&self) -> Vec<u32> {
        let mut models: Vec<u32> = self.faults.iter().map(|fault| fault.model).collect();
        models.sort_unstable();
        models
    }

    /// Canonical fingerprint of the shape, used for memoization and
    /// deduplication.
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.shape().hash(&mut hasher);
        hasher.finish()
    }

    /// True when `other`'s shape is a sub-multiset of this chain's shape.
    pub fn contains_shape(&self, other: &FaultCombination) -> bool {
        is_sub_multiset(&other.shape(), &self.shape())
    }
}

/// Merge scan over two sorted multisets.
pub(crate) fn is_sub_multiset<T: Ord>(sub: &[T], sup: &[T]) -> bool {
    let mut sup_iter = sup.iter();
    'outer: for needle in sub {
        for candidate in sup_iter.by_ref() {
            match candidate.cmp(needle) {
                std::cmp::Ordering::Less => continue,
                std::cmp::Ordering::Equal => continue 'outer,
                std::cmp::Ordering::Greater => return false,
            }
        }
        return false;
    }
    true
}
