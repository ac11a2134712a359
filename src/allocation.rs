//! Feature budget allocation across text paths.
//!
//! The budget is split by the most probable multinomial sample: counts
//! proportional to the path probabilities, rounded so that they sum
//! exactly to the requested total. The result is deterministic.

use tracing::debug;

use crate::discovery::SchemaTextIndex;

/// Relative gain below which a post-optimization move is not worth it.
const IMPROVEMENT_EPSILON: f64 = 1e-5;

/// Most probable allocation of `total` draws over the distribution `probs`.
///
/// `probs` are non-negative and sum to at most one; they are renormalized
/// first. The counts sum to `total` and each stays within one of
/// `total * p_i / sum(p)`. Ties are broken by the lowest index.
pub fn best_multinomial_sample(total: usize, probs: &[f64]) -> Vec<usize> {
    if probs.is_empty() {
        return Vec::new();
    }
    let total_prob: f64 = probs.iter().sum();
    debug_assert!(total_prob <= 1.0 + 1e-6, "probabilities sum to {total_prob}");
    if total_prob <= 0.0 {
        let mut counts = vec![0; probs.len()];
        counts[0] = total;
        return counts;
    }
    let normalized: Vec<f64> = probs.iter().map(|p| p / total_prob).collect();

    let mut frequencies = best_ceil_sample(total, &normalized);
    post_optimize(total, &normalized, &mut frequencies);

    let counts: Vec<usize> = frequencies.iter().map(|f| (f + 0.5).floor() as usize).collect();
    debug_assert_eq!(counts.iter().sum::<usize>(), total);
    counts
}

/// Starts from `ceil(total * p_i)` and removes one draw at a time from the
/// value that is the most over-represented, until the sum is `total`.
fn best_ceil_sample(total: usize, probs: &[f64]) -> Vec<f64> {
    let mut frequencies: Vec<f64> = probs.iter().map(|p| (total as f64 * p).ceil()).collect();
    let mut sum: f64 = frequencies.iter().sum();

    while sum > total as f64 + 1e-5 {
        let Some((remove, _)) = argmin_removal(probs, &frequencies, |_| true) else {
            break;
        };
        frequencies[remove] -= 1.0;
        sum -= 1.0;
    }
    frequencies
}

/// Index with the smallest `p_i / f_i` among the counts accepted by
/// `removable`: the value whose last draw is the least likely.
fn argmin_removal(probs: &[f64], frequencies: &[f64], removable: impl Fn(usize) -> bool) -> Option<(usize, f64)> {
    let mut best: Option<(usize, f64)> = None;
    for (i, (&p, &f)) in probs.iter().zip(frequencies).enumerate() {
        if f <= 0.0 || !removable(i) {
            continue;
        }
        let ratio = p / f;
        if best.is_none_or(|(_, r)| ratio < r) {
            best = Some((i, ratio));
        }
    }
    best
}

/// Index with the largest `p_i / (f_i + 1)` among the counts accepted by
/// `addable`: the value whose next draw is the most likely.
fn argmax_addition(probs: &[f64], frequencies: &[f64], addable: impl Fn(usize) -> bool) -> Option<(usize, f64)> {
    let mut best: Option<(usize, f64)> = None;
    for (i, (&p, &f)) in probs.iter().zip(frequencies).enumerate() {
        if !addable(i) {
            continue;
        }
        let ratio = p / (f + 1.0);
        if best.is_none_or(|(_, r)| ratio > r) {
            best = Some((i, ratio));
        }
    }
    best
}

/// Moves single draws from the least to the most deserving value while
/// this increases the likelihood of the sample.
///
/// Only counts above their expectation lose a draw and only counts below
/// it gain one, so every count stays within one of `total * p_i`.
fn post_optimize(total: usize, probs: &[f64], frequencies: &mut [f64]) {
    if total == 0 {
        return;
    }
    let expected: Vec<f64> = probs.iter().map(|p| total as f64 * p).collect();
    loop {
        let Some((remove, remove_ratio)) = argmin_removal(probs, frequencies, |i| frequencies[i] > expected[i]) else {
            break;
        };
        let Some((add, add_ratio)) = argmax_addition(probs, frequencies, |i| frequencies[i] < expected[i]) else {
            break;
        };
        if remove == add || add_ratio <= remove_ratio * (1.0 + IMPROVEMENT_EPSILON) {
            break;
        }
        frequencies[remove] -= 1.0;
        frequencies[add] += 1.0;
    }
}

/// Sets `allocated_count` on every root path so that the counts sum to
/// `feature_number`, proportionally to `exp(-cost)`.
pub fn allocate_budget(index: &mut SchemaTextIndex, feature_number: usize) {
    let paths = index.root_paths_mut();
    if paths.is_empty() {
        return;
    }
    if paths.len() == 1 {
        paths[0].allocated_count = feature_number;
        return;
    }

    let probs: Vec<f64> = paths.iter().map(|p| (-p.cost).exp()).collect();
    let counts = best_multinomial_sample(feature_number, &probs);
    for (path, count) in paths.iter_mut().zip(counts) {
        path.allocated_count = count;
    }
    debug!(
        "allocate_budget: paths={}, feature_number={}, selected={}",
        paths.len(),
        feature_number,
        paths.iter().filter(|p| p.allocated_count > 0).count()
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cost::compute_costs;
    use crate::discovery::discover;
    use rand::rngs::SmallRng;
    use rand::{Rng, SeedableRng};
    use rill::common::FieldType;
    use rill::schema::Schema;

    fn assert_close_to_expectation(total: usize, probs: &[f64], counts: &[usize]) {
        let sum: f64 = probs.iter().sum();
        assert_eq!(counts.iter().sum::<usize>(), total);
        for (p, &c) in probs.iter().zip(counts) {
            let expected = total as f64 * p / sum;
            assert!(
                (c as f64 - expected).abs() < 1.0 + 1e-9,
                "count {c} too far from {expected} (total={total}, probs={probs:?})"
            );
        }
    }

    #[test]
    fn test_exact_proportions() {
        assert_eq!(best_multinomial_sample(10, &[0.5, 0.3, 0.2]), vec![5, 3, 2]);
        assert_eq!(best_multinomial_sample(4, &[0.25; 4]), vec![1, 1, 1, 1]);
    }

    #[test]
    fn test_rounding() {
        let counts = best_multinomial_sample(3, &[0.5, 0.5]);
        assert_eq!(counts.iter().sum::<usize>(), 3);
        // Tie resolved towards the lowest index
        assert_eq!(counts, vec![1, 2]);

        let probs = [0.6, 0.3, 0.1];
        let counts = best_multinomial_sample(2, &probs);
        assert_eq!(counts, vec![1, 1, 0]);
        assert_close_to_expectation(2, &probs, &counts);
    }

    #[test]
    fn test_zero_total() {
        assert_eq!(best_multinomial_sample(0, &[0.7, 0.3]), vec![0, 0]);
        assert!(best_multinomial_sample(5, &[]).is_empty());
    }

    #[test]
    fn test_partial_probabilities_are_renormalized() {
        let probs = [0.2, 0.2, 0.1];
        let counts = best_multinomial_sample(10, &probs);
        assert_eq!(counts, vec![4, 4, 2]);
    }

    #[test]
    fn test_random_distributions() {
        let mut rng = SmallRng::seed_from_u64(17);
        for _ in 0..200 {
            let n = rng.random_range(1..12);
            let weights: Vec<f64> = (0..n).map(|_| rng.random::<f64>() + 1e-3).collect();
            let sum: f64 = weights.iter().sum();
            let probs: Vec<f64> = weights.iter().map(|w| w / sum * 0.9).collect();
            let total = rng.random_range(0..500);

            let counts = best_multinomial_sample(total, &probs);
            assert_close_to_expectation(total, &probs, &counts);
            assert_eq!(counts, best_multinomial_sample(total, &probs));
        }
    }

    #[test]
    fn test_allocate_single_path_gets_everything() {
        let mut schema = Schema::new();
        let root = schema.add_class("Root").unwrap();
        schema.add_field(root, "T1", FieldType::Text).unwrap();
        let mut index = discover(&schema, root);
        compute_costs(&mut index, 3.0);

        allocate_budget(&mut index, 7);
        assert_eq!(index.root_paths()[0].allocated_count, 7);
    }

    #[test]
    fn test_allocate_budget_follows_costs() {
        let mut schema = Schema::new();
        let root = schema.add_class("Root").unwrap();
        let order = schema.add_class("Order").unwrap();
        schema.add_field(root, "Name", FieldType::Text).unwrap();
        schema.add_field(root, "Orders", FieldType::ObjectArray(order)).unwrap();
        schema.add_field(order, "Comment", FieldType::Text).unwrap();
        schema.add_field(order, "Label", FieldType::Text).unwrap();

        let mut index = discover(&schema, root);
        compute_costs(&mut index, 0.0);
        allocate_budget(&mut index, 20);

        // Name: 1/2, Orders.Comment: 1/4, Orders.Label: 1/4
        let counts: Vec<usize> = index.root_paths().iter().map(|p| p.allocated_count).collect();
        assert_eq!(counts, vec![10, 5, 5]);
    }
}
