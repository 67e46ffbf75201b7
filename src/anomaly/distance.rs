//! Standardized distance scoring (diagonal Mahalanobis)

use crate::error::{DeployError, Result};
use crate::monitoring::RunningStats;
use ndarray::Array2;
use serde::{Deserialize, Serialize};

/// Per-feature z-score distance from the reference centroid.
///
/// The raw distance is the root mean squared z-score; it is mapped to
/// `d / (1 + d)` so scores sit in [0, 1) with higher meaning farther out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StandardizedDistance {
    means: Vec<f64>,
    std_devs: Vec<f64>,
}

impl StandardizedDistance {
    pub fn fit(x: &Array2<f64>) -> Result<Self> {
        let (n_samples, n_features) = x.dim();
        if n_samples < 2 || n_features == 0 {
            return Err(DeployError::InsufficientData {
                required: 2,
                actual: n_samples,
            });
        }

        let (means, std_devs) = x
            .columns()
            .into_iter()
            .map(|column| {
                let mut stats = RunningStats::new();
                column.iter().for_each(|&v| stats.push(v));
                // Constant features contribute only when a value moves off them
                let std = stats.sample_variance().sqrt();
                (stats.mean(), if std > 1e-12 { std } else { 1e-12 })
            })
            .unzip();

        Ok(Self { means, std_devs })
    }

    pub fn n_features(&self) -> usize {
        self.means.len()
    }

    /// Root mean squared z-score
    pub fn distance(&self, sample: &[f64]) -> f64 {
        let sum_sq: f64 = sample
            .iter()
            .zip(self.means.iter().zip(&self.std_devs))
            .map(|(&v, (&mean, &std))| {
                let z = (v - mean) / std;
                z * z
            })
            .sum();
        (sum_sq / self.means.len().max(1) as f64).sqrt()
    }

    pub fn score(&self, sample: &[f64]) -> f64 {
        let d = self.distance(sample);
        if d.is_finite() {
            d / (1.0 + d)
        } else {
            1.0
        }
    }
}
