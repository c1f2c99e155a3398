//! Sample statistics used by the pilot

use rand::rngs::StdRng;
use rand::{seq::index, SeedableRng};

/// 95th percentile: sorted value at index `min(floor(n * 0.95), n - 1)`
pub fn p95(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let index = ((sorted.len() as f64 * 0.95).floor() as usize).min(sorted.len() - 1);
    Some(sorted[index])
}

/// Largest value, ignoring NaN
pub fn max(values: &[f64]) -> Option<f64> {
    values
        .iter()
        .copied()
        .filter(|v| !v.is_nan())
        .max_by(|a, b| a.total_cmp(b))
}

/// Indices of a uniform sample without replacement, ascending.
///
/// Every index is returned when `population <= sample_size`.
pub fn sample_indices(population: usize, sample_size: usize, seed: Option<u64>) -> Vec<usize> {
    if population <= sample_size {
        return (0..population).collect();
    }
    let mut rng = match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let mut picked = index::sample(&mut rng, population, sample_size).into_vec();
    picked.sort_unstable();
    picked
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_p95_index_rule() {
        assert_eq!(p95(&[10.0, 10.0, 10.0, 10.0, 20.0]), Some(20.0));
        let hundred: Vec<f64> = (1..=100).map(f64::from).collect();
        assert_eq!(p95(&hundred), Some(96.0));
        assert_eq!(p95(&[3.0]), Some(3.0));
        assert_eq!(p95(&[]), None);
    }

    #[test]
    fn test_max_skips_nan() {
        assert_eq!(max(&[1.0, f64::NAN, 4.5]), Some(4.5));
        assert_eq!(max(&[]), None);
    }

    #[test]
    fn test_sampling_is_seeded_and_unique() {
        let a = sample_indices(100, 10, Some(7));
        let b = sample_indices(100, 10, Some(7));
        assert_eq!(a, b);
        assert_eq!(a.len(), 10);
        let mut dedup = a.clone();
        dedup.dedup();
        assert_eq!(dedup.len(), 10);
        assert!(a.iter().all(|&i| i < 100));
    }

    #[test]
    fn test_small_population_takes_all() {
        assert_eq!(sample_indices(3, 10, None), vec![0, 1, 2]);
        assert_eq!(sample_indices(0, 10, None), Vec::<usize>::new());
    }
}
