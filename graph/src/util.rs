// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Small numeric helpers shared across the graph stages.

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("empty sample list")]
pub struct EmptyListError;

/// 10-quantile summary of an empirical distribution: sort ascending and
/// sample at positions `floor(i * n / 10)` for `i in 0..10`.
pub fn decile_transform(samples: &[f64]) -> Result<[f64; 10], EmptyListError> {
    if samples.is_empty() {
        return Err(EmptyListError);
    }
    let mut sorted = samples.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let step = sorted.len() as f64 / 10.0;
    let mut deciles = [0.0; 10];
    for (i, slot) in deciles.iter_mut().enumerate() {
        *slot = sorted[(i as f64 * step) as usize];
    }
    Ok(deciles)
}

/// `f64` ordered by `total_cmp`, usable as a priority.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct OrdF64(pub f64);

impl Eq for OrdF64 {}

impl PartialOrd for OrdF64 {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OrdF64 {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.total_cmp(&other.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn deciles_of_one_through_ten() {
        let input: Vec<f64> = (1..=10).map(f64::from).collect();
        assert_eq!(
            decile_transform(&input).unwrap(),
            [1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0, 10.0]
        );
    }

    #[test]
    fn deciles_of_a_singleton_repeat_it() {
        assert_eq!(decile_transform(&[7.5]).unwrap(), [7.5; 10]);
    }

    #[test]
    fn deciles_of_a_hundred_sample_every_tenth() {
        let input: Vec<f64> = (0..100).map(f64::from).collect();
        assert_eq!(
            decile_transform(&input).unwrap(),
            [0.0, 10.0, 20.0, 30.0, 40.0, 50.0, 60.0, 70.0, 80.0, 90.0]
        );
    }

    #[test]
    fn deciles_sort_their_input() {
        let got = decile_transform(&[3.0, 1.0, 2.0]).unwrap();
        assert_eq!(got[0], 1.0);
        assert_eq!(got[9], 3.0);
    }

    #[test]
    fn empty_input_is_an_error() {
        assert_eq!(decile_transform(&[]), Err(EmptyListError));
    }
}
