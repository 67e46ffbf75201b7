//! Rolling Statistics
//!
//! Fixed-capacity observation windows and streaming accumulators shared by
//! the drift detector, the outlier detector and the router's shadow analysis.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Statistics summary
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatsSummary {
    /// Number of observations
    pub count: u64,
    /// Minimum value
    pub min: f64,
    /// Maximum value
    pub max: f64,
    /// Average value
    pub avg: f64,
    /// Standard deviation
    pub std_dev: f64,
    /// Sum of all values
    pub sum: f64,
}

impl StatsSummary {
    /// Create a summary from an iterator of values
    pub fn from_values<'a>(values: impl IntoIterator<Item = &'a f64>) -> Self {
        let mut stats = RunningStats::new();
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        let mut sum = 0.0;

        for &x in values {
            stats.push(x);
            min = min.min(x);
            max = max.max(x);
            sum += x;
        }

        if stats.count() == 0 {
            return Self::default();
        }

        Self {
            count: stats.count(),
            min,
            max,
            avg: stats.mean(),
            std_dev: stats.population_variance().sqrt(),
            sum,
        }
    }
}

/// Fixed-capacity ring buffer of observations.
///
/// Length never exceeds `capacity`; pushing into a full window evicts the
/// oldest value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatWindow {
    capacity: usize,
    values: VecDeque<f64>,
}

impl StatWindow {
    /// Create a window holding at most `capacity` values (minimum 1)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            values: VecDeque::with_capacity(capacity),
        }
    }

    /// Push a value, returning the evicted one when the window was full
    pub fn push(&mut self, value: f64) -> Option<f64> {
        let evicted = if self.values.len() == self.capacity {
            self.values.pop_front()
        } else {
            None
        };
        self.values.push_back(value);
        evicted
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.values.len() == self.capacity
    }

    /// Fraction of capacity currently filled
    pub fn fill_ratio(&self) -> f64 {
        self.values.len() as f64 / self.capacity as f64
    }

    /// Drop every value
    pub fn clear(&mut self) {
        self.values.clear();
    }

    /// Values in arrival order, oldest first
    pub fn iter(&self) -> impl Iterator<Item = &f64> {
        self.values.iter()
    }

    /// Copy of the values in arrival order
    pub fn to_vec(&self) -> Vec<f64> {
        self.values.iter().copied().collect()
    }

    /// Mean of the current contents, 0.0 when empty
    pub fn mean(&self) -> f64 {
        if self.values.is_empty() {
            return 0.0;
        }
        self.values.iter().sum::<f64>() / self.values.len() as f64
    }

    pub fn summary(&self) -> StatsSummary {
        StatsSummary::from_values(self.values.iter())
    }
}

/// Welford accumulator for mean and variance
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RunningStats {
    count: u64,
    mean: f64,
    m2: f64,
}

impl RunningStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, x: f64) {
        self.count += 1;
        let delta = x - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (x - self.mean);
    }

    /// Combine two accumulators (Chan et al. parallel update)
    pub fn merge(&mut self, other: &RunningStats) {
        if other.count == 0 {
            return;
        }
        if self.count == 0 {
            *self = *other;
            return;
        }
        let total = self.count + other.count;
        let delta = other.mean - self.mean;
        self.mean += delta * other.count as f64 / total as f64;
        self.m2 += other.m2 + delta * delta * (self.count as f64 * other.count as f64) / total as f64;
        self.count = total;
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    pub fn population_variance(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.m2 / self.count as f64
        }
    }

    pub fn sample_variance(&self) -> f64 {
        if self.count < 2 {
            0.0
        } else {
            self.m2 / (self.count - 1) as f64
        }
    }
}

/// Streaming co-moment accumulator for Pearson correlation between paired
/// observations, without storing the pairs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RunningCovariance {
    count: u64,
    mean_x: f64,
    mean_y: f64,
    m2_x: f64,
    m2_y: f64,
    c_xy: f64,
}

impl RunningCovariance {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, x: f64, y: f64) {
        self.count += 1;
        let n = self.count as f64;
        let dx = x - self.mean_x;
        self.mean_x += dx / n;
        let dy = y - self.mean_y;
        self.mean_y += dy / n;
        // Uses the updated mean of y with the old deviation of x
        self.c_xy += dx * (y - self.mean_y);
        self.m2_x += dx * (x - self.mean_x);
        self.m2_y += dy * (y - self.mean_y);
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn covariance(&self) -> f64 {
        if self.count < 2 {
            0.0
        } else {
            self.c_xy / (self.count - 1) as f64
        }
    }

    /// Pearson correlation, `None` with fewer than two pairs or when either
    /// side has zero variance
    pub fn correlation(&self) -> Option<f64> {
        if self.count < 2 {
            return None;
        }
        let denom = (self.m2_x * self.m2_y).sqrt();
        if denom <= f64::EPSILON {
            return None;
        }
        Some((self.c_xy / denom).clamp(-1.0, 1.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_summary() {
        let values = vec![1.0, 2.0, 3.0, 4.0, 5.0];
        let stats = StatsSummary::from_values(&values);

        assert_eq!(stats.count, 5);
        assert_eq!(stats.min, 1.0);
        assert_eq!(stats.max, 5.0);
        assert!((stats.avg - 3.0).abs() < 1e-12);
        assert!((stats.sum - 15.0).abs() < 1e-12);
        assert!((stats.std_dev - 2.0_f64.sqrt()).abs() < 1e-12);
    }

    #[test]
    fn test_empty_summary() {
        let stats = StatsSummary::from_values(&Vec::<f64>::new());
        assert_eq!(stats.count, 0);
        assert_eq!(stats.avg, 0.0);
    }

    #[test]
    fn test_window_evicts_oldest() {
        let mut window = StatWindow::new(3);
        assert_eq!(window.push(1.0), None);
        assert_eq!(window.push(2.0), None);
        assert_eq!(window.push(3.0), None);
        assert!(window.is_full());

        assert_eq!(window.push(4.0), Some(1.0));
        assert_eq!(window.len(), 3);
        assert_eq!(window.to_vec(), vec![2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_window_zero_capacity_clamped() {
        let mut window = StatWindow::new(0);
        assert_eq!(window.capacity(), 1);
        window.push(7.0);
        assert_eq!(window.push(8.0), Some(7.0));
    }

    #[test]
    fn test_running_stats_matches_batch() {
        let values: Vec<f64> = (0..100).map(|i| (i as f64 * 0.37).sin()).collect();
        let mut running = RunningStats::new();
        values.iter().for_each(|&v| running.push(v));

        let summary = StatsSummary::from_values(&values);
        assert!((running.mean() - summary.avg).abs() < 1e-12);
        assert!((running.population_variance().sqrt() - summary.std_dev).abs() < 1e-12);
    }

    #[test]
    fn test_running_stats_merge() {
        let mut a = RunningStats::new();
        let mut b = RunningStats::new();
        let mut all = RunningStats::new();
        for i in 0..50 {
            let x = i as f64;
            a.push(x);
            all.push(x);
        }
        for i in 50..80 {
            let x = (i * i) as f64;
            b.push(x);
            all.push(x);
        }
        a.merge(&b);
        assert_eq!(a.count(), all.count());
        assert!((a.mean() - all.mean()).abs() < 1e-9);
        assert!((a.sample_variance() - all.sample_variance()).abs() / all.sample_variance() < 1e-9);
    }

    #[test]
    fn test_correlation_perfect_linear() {
        let mut cov = RunningCovariance::new();
        for i in 0..20 {
            let x = i as f64;
            cov.push(x, 2.0 * x + 1.0);
        }
        assert!((cov.correlation().unwrap() - 1.0).abs() < 1e-9);

        let mut neg = RunningCovariance::new();
        for i in 0..20 {
            let x = i as f64;
            neg.push(x, -x);
        }
        assert!((neg.correlation().unwrap() + 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_correlation_undefined_for_constant() {
        let mut cov = RunningCovariance::new();
        for i in 0..10 {
            cov.push(0.5, i as f64);
        }
        assert!(cov.correlation().is_none());
    }
}
