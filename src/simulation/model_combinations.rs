use itertools::Itertools;

/// Enumerate the model arrangements to attack.
///
/// `model_counts[i]` is the multiplicity of model `i`. The result contains,
/// in increasing size and within a size in lexicographic multiset order,
/// every distinct arrangement (order-distinct sequence) of every admissible
/// model multiset of size `1..=max_simultaneous`. A value of 0 for
/// `max_simultaneous` means no upper limit beyond the total multiplicity.
///
/// A multiset of identical models contributes exactly one arrangement, so
/// every fault combination is simulated exactly once when placements are
/// made at strictly increasing times.
pub fn compute_model_combinations(model_counts: &[u32], max_simultaneous: u32) -> Vec<Vec<u32>> {
    let total: u32 = model_counts.iter().sum();
    let limit = if max_simultaneous == 0 {
        total
    } else {
        max_simultaneous.min(total)
    };

    let mut arrangements = Vec::new();
    for size in 1..=limit as usize {
        for multiset in (0..model_counts.len() as u32).combinations_with_replacement(size) {
            if exceeds_multiplicity(&multiset, model_counts) {
                continue;
            }
            for arrangement in multiset.iter().copied().permutations(size).unique() {
                arrangements.push(arrangement);
            }
        }
    }
    arrangements
}

fn exceeds_multiplicity(multiset: &[u32], model_counts: &[u32]) -> bool {
    model_counts
        .iter()
        .enumerate()
        .any(|(model, count)| multiset.iter().filter(|&&m| m == model as u32).count() > *count as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_model_with_multiplicity() {
        let arrangements = compute_model_combinations(&[2], 0);
        assert_eq!(arrangements, vec![vec![0], vec![0, 0]]);
    }

    #[test]
    fn distinct_models_yield_both_orders() {
        let arrangements = compute_model_combinations(&[1, 1], 2);
        assert_eq!(arrangements, vec![vec![0], vec![1], vec![0, 1], vec![1, 0]]);
    }

    #[test]
    fn respects_multiplicity_and_limit() {
        let arrangements = compute_model_combinations(&[2, 1], 2);
        // size 1: [0], [1]; size 2: [0,0], [0,1], [1,0]; never [1,1]
        assert_eq!(arrangements.len(), 5);
        assert!(!arrangements.contains(&vec![1, 1]));

        let capped = compute_model_combinations(&[2, 1], 1);
        assert_eq!(capped, vec![vec![0], vec![1]]);
    }

    #[test]
    fn arrangements_are_unique() {
        let arrangements = compute_model_combinations(&[3, 2], 0);
        let mut seen = std::collections::HashSet::new();
        for arrangement in &arrangements {
            assert!(seen.insert(arrangement.clone()), "duplicate: {arrangement:?}");
        }
        // sizes are non-decreasing
        for window in arrangements.windows(2) {
            assert!(window[0].len() <= window[1].len());
        }
    }
}
