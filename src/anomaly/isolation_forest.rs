//! Isolation Forest scoring

use crate::error::{DeployError, Result};
use ndarray::Array2;
use rand::seq::index;
use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Isolation Tree node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum IsolationTree {
    /// Internal node with split
    Internal {
        feature: usize,
        threshold: f64,
        /// Values < threshold
        left: Box<IsolationTree>,
        /// Values >= threshold
        right: Box<IsolationTree>,
    },
    /// External (leaf) node
    External {
        /// Number of samples in this node
        size: usize,
    },
}

impl IsolationTree {
    /// Build an isolation tree over the rows of `x` listed in `indices`
    pub fn build(
        x: &Array2<f64>,
        indices: &[usize],
        height: usize,
        max_height: usize,
        rng: &mut impl Rng,
    ) -> Self {
        let n_samples = indices.len();

        if height >= max_height || n_samples <= 1 {
            return IsolationTree::External { size: n_samples };
        }

        let feature = rng.gen_range(0..x.ncols());

        let (min_val, max_val) = indices
            .iter()
            .map(|&i| x[[i, feature]])
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
                (lo.min(v), hi.max(v))
            });

        // Constant feature in this subset
        if (max_val - min_val).abs() < 1e-10 {
            return IsolationTree::External { size: n_samples };
        }

        let threshold = rng.gen_range(min_val..max_val);

        let (left_indices, right_indices): (Vec<usize>, Vec<usize>) =
            indices.iter().partition(|&&i| x[[i, feature]] < threshold);

        if left_indices.is_empty() || right_indices.is_empty() {
            return IsolationTree::External { size: n_samples };
        }

        let left = Box::new(Self::build(x, &left_indices, height + 1, max_height, rng));
        let right = Box::new(Self::build(x, &right_indices, height + 1, max_height, rng));

        IsolationTree::Internal {
            feature,
            threshold,
            left,
            right,
        }
    }

    /// Path length for a sample, with the c(n) adjustment at leaves
    pub fn path_length(&self, sample: &[f64], current_height: usize) -> f64 {
        match self {
            IsolationTree::External { size } => current_height as f64 + average_path_length(*size),
            IsolationTree::Internal {
                feature,
                threshold,
                left,
                right,
            } => {
                if sample[*feature] < *threshold {
                    left.path_length(sample, current_height + 1)
                } else {
                    right.path_length(sample, current_height + 1)
                }
            }
        }
    }
}

/// Average path length of an unsuccessful BST search,
/// c(n) = 2 H(n-1) - 2(n-1)/n
pub(crate) fn average_path_length(n: usize) -> f64 {
    if n <= 1 {
        0.0
    } else if n == 2 {
        1.0
    } else {
        let n_f = n as f64;
        2.0 * ((n_f - 1.0).ln() + 0.5772156649) - 2.0 * (n_f - 1.0) / n_f
    }
}

/// Fitted isolation forest.
///
/// Scores lie in (0, 1]; values near 1 isolate quickly and are anomalous,
/// values well below 0.5 are ordinary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IsolationForest {
    trees: Vec<IsolationTree>,
    /// Rows drawn per tree
    samples_per_tree: usize,
    n_features: usize,
}

impl IsolationForest {
    /// Grow `n_estimators` trees, each on `max_samples` rows drawn without
    /// replacement. Trees are built in parallel from per-tree seeds derived
    /// from `seed`, so a fixed seed gives a reproducible forest.
    pub fn fit(
        x: &Array2<f64>,
        n_estimators: usize,
        max_samples: usize,
        seed: Option<u64>,
    ) -> Result<Self> {
        let (n_samples, n_features) = x.dim();
        if n_samples < 2 || n_features == 0 {
            return Err(DeployError::InsufficientData {
                required: 2,
                actual: n_samples,
            });
        }
        if n_estimators == 0 || max_samples == 0 {
            return Err(DeployError::invalid_parameter(
                "outlier.n_estimators",
                n_estimators.min(max_samples),
                "forest size and max_samples must be positive",
            ));
        }

        let samples_per_tree = max_samples.min(n_samples);
        let max_height = (samples_per_tree as f64).log2().ceil() as usize;

        let mut master = match seed {
            Some(seed) => Xoshiro256PlusPlus::seed_from_u64(seed),
            None => Xoshiro256PlusPlus::from_entropy(),
        };
        let tree_seeds: Vec<u64> = (0..n_estimators).map(|_| master.gen()).collect();

        let trees = tree_seeds
            .into_par_iter()
            .map(|tree_seed| {
                let mut rng = Xoshiro256PlusPlus::seed_from_u64(tree_seed);
                let indices = index::sample(&mut rng, n_samples, samples_per_tree).into_vec();
                IsolationTree::build(x, &indices, 0, max_height, &mut rng)
            })
            .collect();

        Ok(Self {
            trees,
            samples_per_tree,
            n_features,
        })
    }

    pub fn n_estimators(&self) -> usize {
        self.trees.len()
    }

    pub fn n_features(&self) -> usize {
        self.n_features
    }

    /// s(x, n) = 2^(-E[h(x)] / c(n))
    pub fn score(&self, sample: &[f64]) -> f64 {
        let avg_path_length = self
            .trees
            .iter()
            .map(|tree| tree.path_length(sample, 0))
            .sum::<f64>()
            / self.trees.len() as f64;

        let c_n = average_path_length(self.samples_per_tree).max(f64::EPSILON);
        2.0_f64.powf(-avg_path_length / c_n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster_with_outliers() -> Array2<f64> {
        // Normal data cluster: 50 points with 2 features each
        let mut data = Vec::new();
        for i in 0..50 {
            data.push((i % 10) as f64);
            data.push(((i % 10) + 1) as f64);
        }
        data.extend_from_slice(&[100.0, 100.0]);
        data.extend_from_slice(&[-50.0, -50.0]);
        Array2::from_shape_vec((52, 2), data).unwrap()
    }

    #[test]
    fn test_isolation_forest_ranks_outliers_higher() {
        let x = cluster_with_outliers();
        let forest = IsolationForest::fit(&x, 50, 256, Some(42)).unwrap();

        let inlier = forest.score(&[5.0, 6.0]);
        assert!(forest.score(&[100.0, 100.0]) > inlier);
        assert!(forest.score(&[-50.0, -50.0]) > inlier);
        assert!(inlier > 0.0 && inlier < 1.0);
    }

    #[test]
    fn test_seeded_forest_is_reproducible() {
        let x = cluster_with_outliers();
        let a = IsolationForest::fit(&x, 20, 32, Some(7)).unwrap();
        let b = IsolationForest::fit(&x, 20, 32, Some(7)).unwrap();
        assert_eq!(a.score(&[3.0, 4.0]), b.score(&[3.0, 4.0]));
        assert_eq!(a.n_estimators(), 20);
    }

    #[test]
    fn test_isolation_tree_path_length() {
        let x = Array2::from_shape_vec(
            (10, 2),
            vec![
                1.0, 1.0, 2.0, 2.0, 3.0, 3.0, 4.0, 4.0, 5.0, 5.0, 6.0, 6.0, 7.0, 7.0, 8.0, 8.0,
                9.0, 9.0, 10.0, 10.0,
            ],
        )
        .unwrap();

        let indices: Vec<usize> = (0..10).collect();
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(42);
        let tree = IsolationTree::build(&x, &indices, 0, 10, &mut rng);

        assert!(tree.path_length(&[5.0, 5.0], 0) > 0.0);
    }

    #[test]
    fn test_average_path_length_values() {
        assert_eq!(average_path_length(1), 0.0);
        assert_eq!(average_path_length(2), 1.0);
        // c(256) is about 10.24
        assert!((average_path_length(256) - 10.24).abs() < 0.05);
    }

    #[test]
    fn test_too_few_rows() {
        let x = Array2::from_elem((1, 3), 1.0);
        assert!(IsolationForest::fit(&x, 10, 10, Some(1)).is_err());
    }
}
