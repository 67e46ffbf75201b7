//! Two-sample Kolmogorov-Smirnov test

use crate::error::{DeployError, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// KS statistic with its asymptotic p-value
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct KsResult {
    /// Largest absolute gap between the two empirical CDFs
    pub statistic: f64,
    pub p_value: f64,
}

/// Two-sample Kolmogorov-Smirnov test. Stateless; the caller compares the
/// p-value against its own significance level.
#[derive(Debug, Clone, Copy, Default)]
pub struct KolmogorovSmirnovTest;

impl KolmogorovSmirnovTest {
    /// Sort a sample in place, NaN-safe
    pub fn sort(values: &mut [f64]) {
        values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
    }

    /// KS statistic between two sorted samples. Tied values advance both
    /// CDFs together, so identical samples give exactly 0.
    pub fn statistic(sorted_a: &[f64], sorted_b: &[f64]) -> f64 {
        let n1 = sorted_a.len() as f64;
        let n2 = sorted_b.len() as f64;
        let (mut i, mut j) = (0usize, 0usize);
        let mut d: f64 = 0.0;

        while i < sorted_a.len() && j < sorted_b.len() {
            let x = sorted_a[i].min(sorted_b[j]);
            while i < sorted_a.len() && sorted_a[i] <= x {
                i += 1;
            }
            while j < sorted_b.len() && sorted_b[j] <= x {
                j += 1;
            }
            d = d.max((i as f64 / n1 - j as f64 / n2).abs());
        }

        d
    }

    /// Asymptotic two-sample p-value with Stephens' small-sample correction
    pub fn p_value(statistic: f64, n1: usize, n2: usize) -> f64 {
        let en = ((n1 * n2) as f64 / (n1 + n2) as f64).sqrt();
        kolmogorov_survival((en + 0.12 + 0.11 / en) * statistic)
    }

    /// Test `sample` against an already sorted reference
    pub fn test_sorted_reference(reference: &[f64], sample: &[f64]) -> Result<KsResult> {
        if reference.is_empty() || sample.is_empty() {
            return Err(DeployError::ValidationError(
                "Empty arrays provided".to_string(),
            ));
        }

        let mut sorted = sample.to_vec();
        Self::sort(&mut sorted);

        let statistic = Self::statistic(reference, &sorted);
        Ok(KsResult {
            statistic,
            p_value: Self::p_value(statistic, reference.len(), sorted.len()),
        })
    }

    /// Test two unsorted samples
    pub fn test(reference: &[f64], sample: &[f64]) -> Result<KsResult> {
        let mut sorted_ref = reference.to_vec();
        Self::sort(&mut sorted_ref);
        Self::test_sorted_reference(&sorted_ref, sample)
    }
}

/// Survival function of the Kolmogorov distribution,
/// Q(l) = 2 * sum_{k>=1} (-1)^(k-1) exp(-2 k^2 l^2).
/// The series does not converge for small `l`, where Q is 1.
fn kolmogorov_survival(lambda: f64) -> f64 {
    if !lambda.is_finite() || lambda < 1e-3 {
        return 1.0;
    }

    let a2 = -2.0 * lambda * lambda;
    let mut factor = 2.0;
    let mut sum = 0.0;
    let mut previous_term: f64 = 0.0;

    for k in 1..=100 {
        let kf = k as f64;
        let term = factor * (a2 * kf * kf).exp();
        sum += term;
        if term.abs() <= 0.001 * previous_term || term.abs() <= 1e-8 * sum {
            return sum.clamp(0.0, 1.0);
        }
        factor = -factor;
        previous_term = term.abs();
    }

    1.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ks_test_no_drift() {
        // Same distribution
        let ref_data = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0, 10.0];
        let test_data = vec![1.5, 2.5, 3.5, 4.5, 5.5, 6.5, 7.5, 8.5, 9.5, 10.5];

        let result = KolmogorovSmirnovTest::test(&ref_data, &test_data).unwrap();

        assert!((result.statistic - 0.1).abs() < 1e-12);
        assert!(result.p_value > 0.05);
    }

    #[test]
    fn test_ks_test_with_drift() {
        // Different distributions
        let ref_data = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0, 10.0];
        let test_data = vec![100.0, 110.0, 120.0, 130.0, 140.0, 150.0, 160.0, 170.0, 180.0, 190.0];

        let result = KolmogorovSmirnovTest::test(&ref_data, &test_data).unwrap();

        assert_eq!(result.statistic, 1.0);
        assert!(result.p_value < 0.001);
    }

    #[test]
    fn test_identical_samples_have_zero_statistic() {
        let data: Vec<f64> = (0..50).map(|i| (i % 7) as f64).collect();
        let result = KolmogorovSmirnovTest::test(&data, &data).unwrap();
        assert_eq!(result.statistic, 0.0);
        assert_eq!(result.p_value, 1.0);
    }

    #[test]
    fn test_constant_samples() {
        let a = vec![3.0; 100];
        let b = vec![3.0; 100];
        assert_eq!(KolmogorovSmirnovTest::statistic(&a, &b), 0.0);

        let c = vec![4.0; 100];
        assert_eq!(KolmogorovSmirnovTest::statistic(&a, &c), 1.0);
    }

    #[test]
    fn test_p_value_monotone_in_statistic() {
        let p_small = KolmogorovSmirnovTest::p_value(0.05, 200, 200);
        let p_mid = KolmogorovSmirnovTest::p_value(0.15, 200, 200);
        let p_large = KolmogorovSmirnovTest::p_value(0.3, 200, 200);
        assert!(p_small > p_mid);
        assert!(p_mid > p_large);
        assert!(p_small > 0.9);
        assert!(p_large < 1e-6);
    }

    #[test]
    fn test_p_value_near_critical_value() {
        // Tabulated 5% critical value, c(0.05) * sqrt((n1 + n2) / (n1 * n2))
        let d = 1.36 * (1000.0_f64 / 250_000.0).sqrt();
        let p = KolmogorovSmirnovTest::p_value(d, 500, 500);
        assert!(p > 0.03 && p < 0.07, "p = {}", p);
    }

    #[test]
    fn test_empty_rejected() {
        assert!(KolmogorovSmirnovTest::test(&[], &[1.0]).is_err());
        assert!(KolmogorovSmirnovTest::test(&[1.0], &[]).is_err());
    }
}
