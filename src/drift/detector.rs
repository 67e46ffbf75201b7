//! Reference-fitted KS drift detector with batch and streaming modes

use super::{
    DriftConfig, DriftEvent, DriftReport, DriftSeverity, FeatureDrift, KolmogorovSmirnovTest,
    WindowMode,
};
use crate::error::{DeployError, Result};
use crate::events::{EngineEvent, EventPublisher};
use crate::monitoring::{StatWindow, StatsSummary};
use chrono::Utc;
use ndarray::{Array2, ArrayView1};
use parking_lot::{Mutex, RwLock};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Sorted reference sample for one feature
#[derive(Debug)]
struct FeatureReference {
    name: String,
    sorted: Vec<f64>,
    summary: StatsSummary,
}

#[derive(Debug)]
struct FeatureStream {
    window: StatWindow,
    /// Observations since the last check
    fresh: usize,
}

/// Everything produced by `fit`; swapped wholesale on refit
#[derive(Debug)]
struct Fitted {
    features: Vec<FeatureReference>,
    streams: Vec<Mutex<FeatureStream>>,
}

#[derive(Debug, Default)]
struct DriftLog {
    events: VecDeque<DriftEvent>,
    total_checks: u64,
    drift_checks: u64,
    p_value_sum: f64,
    p_value_count: u64,
    last_report: Option<DriftReport>,
}

/// Drift history for dashboards
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriftSummary {
    pub fitted: bool,
    pub n_features: usize,
    pub total_checks: u64,
    pub drift_checks: u64,
    pub drift_rate: f64,
    /// Mean per-feature p-value over all checks
    pub mean_p_value: f64,
    pub events_logged: usize,
    /// Mean fill ratio of the streaming windows
    pub window_fill: f64,
    pub reference_summaries: Vec<(String, StatsSummary)>,
    pub last_report: Option<DriftReport>,
}

/// Detects per-feature distribution shift against a fitted reference.
///
/// All methods take `&self`: the reference is an immutable `Arc` swapped on
/// refit and every streaming window sits behind its own lock, so different
/// features can be ingested in parallel.
pub struct DriftDetector {
    config: DriftConfig,
    state: RwLock<Option<Arc<Fitted>>>,
    log: Mutex<DriftLog>,
    publisher: Option<EventPublisher>,
}

impl DriftDetector {
    pub fn new(config: DriftConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            state: RwLock::new(None),
            log: Mutex::new(DriftLog::default()),
            publisher: None,
        })
    }

    /// Forward drift events to an event publisher
    pub fn with_publisher(mut self, publisher: EventPublisher) -> Self {
        self.publisher = Some(publisher);
        self
    }

    pub fn config(&self) -> &DriftConfig {
        &self.config
    }

    pub fn is_fitted(&self) -> bool {
        self.state.read().is_some()
    }

    pub fn n_features(&self) -> Option<usize> {
        self.state.read().as_ref().map(|f| f.features.len())
    }

    pub fn feature_names(&self) -> Vec<String> {
        self.state
            .read()
            .as_ref()
            .map(|f| f.features.iter().map(|r| r.name.clone()).collect())
            .unwrap_or_default()
    }

    fn fitted(&self) -> Result<Arc<Fitted>> {
        self.state
            .read()
            .as_ref()
            .map(Arc::clone)
            .ok_or(DeployError::NotFitted)
    }

    /// Store a bounded reference sample per feature (columns of `reference`).
    /// Refitting replaces the reference and discards streaming windows.
    pub fn fit(&self, reference: &Array2<f64>) -> Result<()> {
        let (n_rows, n_cols) = reference.dim();
        if n_cols == 0 {
            return Err(DeployError::ShapeError {
                expected: "at least one feature column".to_string(),
                actual: "0 columns".to_string(),
            });
        }
        if n_rows < self.config.min_samples {
            return Err(DeployError::InsufficientData {
                required: self.config.min_samples,
                actual: n_rows,
            });
        }
        if reference.iter().any(|v| !v.is_finite()) {
            return Err(DeployError::ValidationError(
                "reference contains non-finite values".to_string(),
            ));
        }

        let names = self.resolve_names(n_cols)?;
        let stride = stride_for(n_rows, self.config.max_reference_samples);

        let features: Vec<FeatureReference> = reference
            .columns()
            .into_iter()
            .zip(names)
            .map(|(column, name)| {
                let mut sorted: Vec<f64> = column.iter().step_by(stride).copied().collect();
                KolmogorovSmirnovTest::sort(&mut sorted);
                let summary = StatsSummary::from_values(&sorted);
                FeatureReference {
                    name,
                    sorted,
                    summary,
                }
            })
            .collect();

        let streams = (0..n_cols)
            .map(|_| {
                Mutex::new(FeatureStream {
                    window: StatWindow::new(self.config.window_size),
                    fresh: 0,
                })
            })
            .collect();

        let reference_size = features.first().map(|f| f.sorted.len()).unwrap_or(0);
        *self.state.write() = Some(Arc::new(Fitted { features, streams }));

        info!(
            n_features = n_cols,
            n_rows,
            reference_size,
            threshold = self.config.threshold,
            "Drift detector fitted"
        );
        Ok(())
    }

    fn resolve_names(&self, n_cols: usize) -> Result<Vec<String>> {
        if self.config.feature_names.is_empty() {
            return Ok((0..n_cols).map(|i| format!("feature_{}", i)).collect());
        }
        if self.config.feature_names.len() != n_cols {
            return Err(DeployError::ShapeError {
                expected: format!("{} named features", self.config.feature_names.len()),
                actual: format!("{} columns", n_cols),
            });
        }
        Ok(self.config.feature_names.clone())
    }

    /// Test every column of `batch` against the reference
    pub fn detect(&self, batch: &Array2<f64>) -> Result<DriftReport> {
        let fitted = self.fitted()?;
        let (n_rows, n_cols) = batch.dim();

        if n_cols != fitted.features.len() {
            return Err(DeployError::ShapeError {
                expected: format!("{} columns", fitted.features.len()),
                actual: format!("{} columns", n_cols),
            });
        }
        if n_rows < self.config.min_samples {
            return Err(DeployError::InsufficientData {
                required: self.config.min_samples,
                actual: n_rows,
            });
        }

        let columns: Vec<ArrayView1<f64>> = batch.columns().into_iter().collect();
        let features = fitted
            .features
            .par_iter()
            .zip(columns.par_iter())
            .map(|(reference, column)| {
                let sample: Vec<f64> = column.iter().copied().filter(|v| v.is_finite()).collect();
                self.test_feature(reference, &sample)
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(self.finish_check(features))
    }

    /// Push one feature vector into the streaming windows. Returns a report
    /// when at least one window became due for a check.
    pub fn observe(&self, features: &[f64]) -> Result<Option<DriftReport>> {
        let fitted = self.fitted()?;
        if features.len() != fitted.features.len() {
            return Err(DeployError::ShapeError {
                expected: format!("{} features", fitted.features.len()),
                actual: format!("{} features", features.len()),
            });
        }

        let mut results = Vec::new();
        for ((reference, stream), &value) in fitted
            .features
            .iter()
            .zip(fitted.streams.iter())
            .zip(features)
        {
            if !value.is_finite() {
                continue;
            }

            // Snapshot under the per-feature lock, test outside it
            let due = {
                let mut stream = stream.lock();
                stream.window.push(value);
                stream.fresh += 1;
                if self.window_due(&stream) {
                    let sample = stream.window.to_vec();
                    match self.config.window_mode {
                        WindowMode::Reset => stream.window.clear(),
                        WindowMode::Slide => {}
                    }
                    stream.fresh = 0;
                    Some(sample)
                } else {
                    None
                }
            };

            if let Some(sample) = due {
                results.push(self.test_feature(reference, &sample)?);
            }
        }

        if results.is_empty() {
            return Ok(None);
        }
        Ok(Some(self.finish_check(results)))
    }

    fn window_due(&self, stream: &FeatureStream) -> bool {
        if !stream.window.is_full() {
            return false;
        }
        match self.config.window_mode {
            WindowMode::Reset => true,
            WindowMode::Slide => stream.fresh >= (stream.window.capacity() / 2).max(1),
        }
    }

    fn test_feature(&self, reference: &FeatureReference, sample: &[f64]) -> Result<FeatureDrift> {
        if sample.len() < self.config.min_samples {
            return Err(DeployError::InsufficientData {
                required: self.config.min_samples,
                actual: sample.len(),
            });
        }

        let result = KolmogorovSmirnovTest::test_sorted_reference(&reference.sorted, sample)?;
        let is_drift = result.p_value < self.config.threshold;

        debug!(
            feature = %reference.name,
            statistic = result.statistic,
            p_value = result.p_value,
            "KS test"
        );

        Ok(FeatureDrift {
            feature_name: reference.name.clone(),
            statistic: result.statistic,
            p_value: result.p_value,
            is_drift,
            severity: DriftSeverity::from_p_value(result.p_value, self.config.threshold),
            reference_size: reference.sorted.len(),
            sample_size: sample.len(),
        })
    }

    fn finish_check(&self, features: Vec<FeatureDrift>) -> DriftReport {
        let n_drifted = features.iter().filter(|f| f.is_drift).count();
        let report = DriftReport {
            overall_is_drift: self.config.policy.is_drift(n_drifted, features.len()),
            n_drifted,
            policy: self.config.policy,
            threshold: self.config.threshold,
            timestamp: Utc::now(),
            features,
        };

        let events = report.events();
        {
            let mut log = self.log.lock();
            log.total_checks += 1;
            if report.overall_is_drift {
                log.drift_checks += 1;
            }
            for f in &report.features {
                log.p_value_sum += f.p_value;
                log.p_value_count += 1;
            }
            for event in &events {
                if log.events.len() >= self.config.event_log_capacity.max(1) {
                    log.events.pop_front();
                }
                log.events.push_back(event.clone());
            }
            log.last_report = Some(report.clone());
        }

        if report.overall_is_drift {
            warn!(
                n_drifted,
                features = ?report.drifted_features(),
                min_p_value = report.min_p_value(),
                "Drift detected"
            );
        }

        if let Some(publisher) = &self.publisher {
            for event in events {
                publisher.publish(EngineEvent::Drift(event));
            }
        }

        report
    }

    /// Most recent drift events, newest last
    pub fn recent_events(&self, limit: usize) -> Vec<DriftEvent> {
        let log = self.log.lock();
        let skip = log.events.len().saturating_sub(limit);
        log.events.iter().skip(skip).cloned().collect()
    }

    pub fn summary(&self) -> DriftSummary {
        let fitted = self.state.read().as_ref().map(Arc::clone);
        let log = self.log.lock();

        let (n_features, window_fill, reference_summaries) = match &fitted {
            Some(f) => {
                let fill = if f.streams.is_empty() {
                    0.0
                } else {
                    f.streams
                        .iter()
                        .map(|s| s.lock().window.fill_ratio())
                        .sum::<f64>()
                        / f.streams.len() as f64
                };
                let summaries = f
                    .features
                    .iter()
                    .map(|r| (r.name.clone(), r.summary.clone()))
                    .collect();
                (f.features.len(), fill, summaries)
            }
            None => (0, 0.0, Vec::new()),
        };

        DriftSummary {
            fitted: fitted.is_some(),
            n_features,
            total_checks: log.total_checks,
            drift_checks: log.drift_checks,
            drift_rate: if log.total_checks > 0 {
                log.drift_checks as f64 / log.total_checks as f64
            } else {
                0.0
            },
            mean_p_value: if log.p_value_count > 0 {
                log.p_value_sum / log.p_value_count as f64
            } else {
                1.0
            },
            events_logged: log.events.len(),
            window_fill,
            reference_summaries,
            last_report: log.last_report.clone(),
        }
    }

    /// Clear every streaming window; the reference is kept
    pub fn reset_windows(&self) {
        if let Some(fitted) = self.state.read().as_ref() {
            for stream in &fitted.streams {
                let mut stream = stream.lock();
                stream.window.clear();
                stream.fresh = 0;
            }
        }
        debug!("Drift windows reset");
    }
}

fn stride_for(n_rows: usize, max_samples: usize) -> usize {
    if max_samples == 0 || n_rows <= max_samples {
        1
    } else {
        (n_rows + max_samples - 1) / max_samples
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drift::DriftPolicy;
    use rand::SeedableRng;
    use rand_distr::{Distribution, Normal};
    use rand_xoshiro::Xoshiro256PlusPlus;

    fn normal_batch(rows: usize, cols: usize, mean: f64, seed: u64) -> Array2<f64> {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(seed);
        let normal = Normal::new(mean, 1.0).unwrap();
        Array2::from_shape_fn((rows, cols), |_| normal.sample(&mut rng))
    }

    #[test]
    fn test_detect_before_fit() {
        let detector = DriftDetector::new(DriftConfig::default()).unwrap();
        let batch = normal_batch(50, 2, 0.0, 1);
        assert!(matches!(detector.detect(&batch), Err(DeployError::NotFitted)));
        assert!(matches!(detector.observe(&[0.0, 0.0]), Err(DeployError::NotFitted)));
    }

    #[test]
    fn test_identical_sample_no_drift() {
        let detector = DriftDetector::new(DriftConfig::default()).unwrap();
        let reference = normal_batch(500, 3, 0.0, 7);
        detector.fit(&reference).unwrap();

        let report = detector.detect(&reference).unwrap();
        assert!(!report.overall_is_drift);
        for f in &report.features {
            assert!(!f.is_drift);
            assert!(f.p_value > 0.05);
        }
    }

    #[test]
    fn test_shifted_sample_drifts() {
        let detector = DriftDetector::new(DriftConfig::default()).unwrap();
        detector.fit(&normal_batch(500, 2, 0.0, 11)).unwrap();

        let report = detector.detect(&normal_batch(200, 2, 3.0, 12)).unwrap();
        assert!(report.overall_is_drift);
        assert_eq!(report.n_drifted, 2);
        for f in &report.features {
            assert!(f.p_value < 0.05);
            assert_eq!(f.severity, DriftSeverity::Critical);
        }
        assert_eq!(detector.recent_events(10).len(), 2);
    }

    #[test]
    fn test_small_batch_is_insufficient() {
        let detector = DriftDetector::new(DriftConfig::default()).unwrap();
        detector.fit(&normal_batch(100, 1, 0.0, 3)).unwrap();

        let err = detector.detect(&normal_batch(10, 1, 0.0, 4)).unwrap_err();
        assert!(matches!(
            err,
            DeployError::InsufficientData {
                required: 30,
                actual: 10
            }
        ));
    }

    #[test]
    fn test_column_mismatch_is_shape_error() {
        let detector = DriftDetector::new(DriftConfig::default()).unwrap();
        detector.fit(&normal_batch(100, 2, 0.0, 3)).unwrap();
        let err = detector.detect(&normal_batch(100, 3, 0.0, 4)).unwrap_err();
        assert!(matches!(err, DeployError::ShapeError { .. }));
    }

    #[test]
    fn test_majority_policy_needs_more_than_half() {
        let config = DriftConfig::default()
            .with_threshold(0.001)
            .with_policy(DriftPolicy::Majority);
        let detector = DriftDetector::new(config).unwrap();
        detector.fit(&normal_batch(400, 3, 0.0, 21)).unwrap();

        // Shift only the first of three features
        let mut batch = normal_batch(200, 3, 0.0, 22);
        batch.column_mut(0).mapv_inplace(|v| v + 3.0);

        let report = detector.detect(&batch).unwrap();
        assert_eq!(report.n_drifted, 1);
        assert!(!report.overall_is_drift);
        assert_eq!(report.drifted_features(), vec!["feature_0"]);
    }

    #[test]
    fn test_any_feature_policy_flags_single_feature() {
        let detector = DriftDetector::new(DriftConfig::default().with_threshold(0.001)).unwrap();
        detector.fit(&normal_batch(400, 3, 0.0, 21)).unwrap();

        let mut batch = normal_batch(200, 3, 0.0, 22);
        batch.column_mut(0).mapv_inplace(|v| v + 3.0);

        let report = detector.detect(&batch).unwrap();
        assert_eq!(report.n_drifted, 1);
        assert!(report.overall_is_drift);
    }

    #[test]
    fn test_streaming_identical_values_no_drift() {
        let config = DriftConfig::default()
            .with_window_size(100)
            .with_window_mode(WindowMode::Reset);
        let detector = DriftDetector::new(config).unwrap();
        detector.fit(&Array2::from_elem((100, 1), 5.0)).unwrap();

        for _ in 0..99 {
            assert!(detector.observe(&[5.0]).unwrap().is_none());
        }
        let report = detector.observe(&[5.0]).unwrap().unwrap();
        assert!(!report.overall_is_drift);
        assert_eq!(report.features[0].statistic, 0.0);

        // Reset mode empties the window after the check
        assert_eq!(detector.summary().window_fill, 0.0);
    }

    #[test]
    fn test_streaming_slide_rechecks_after_half_window() {
        let config = DriftConfig::default()
            .with_window_size(40)
            .with_window_mode(WindowMode::Slide);
        let detector = DriftDetector::new(config).unwrap();
        detector.fit(&normal_batch(200, 1, 0.0, 5)).unwrap();

        let mut checks = 0;
        for i in 0..100 {
            if detector.observe(&[(i % 10) as f64 / 10.0]).unwrap().is_some() {
                checks += 1;
            }
        }
        // First check at 40, then every 20 observations: 40, 60, 80, 100
        assert_eq!(checks, 4);
        assert_eq!(detector.summary().total_checks, 4);
        assert_eq!(detector.summary().window_fill, 1.0);
    }

    #[test]
    fn test_streaming_shift_emits_events() {
        let config = DriftConfig::default()
            .with_window_size(50)
            .with_window_mode(WindowMode::Reset)
            .with_feature_names(vec!["age".to_string(), "income".to_string()]);
        let detector = DriftDetector::new(config).unwrap();
        detector.fit(&normal_batch(300, 2, 0.0, 8)).unwrap();

        let shifted = normal_batch(50, 2, 4.0, 9);
        let mut last = None;
        for row in shifted.rows() {
            last = detector.observe(&[row[0], row[1]]).unwrap();
        }

        let report = last.unwrap();
        assert!(report.overall_is_drift);
        let events = detector.recent_events(10);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].feature_name, "age");
        assert!(events.iter().all(|e| e.is_drift));
    }

    #[test]
    fn test_reset_windows_and_summary() {
        let config = DriftConfig::default().with_window_size(50);
        let detector = DriftDetector::new(config).unwrap();
        detector.fit(&normal_batch(100, 2, 0.0, 1)).unwrap();

        for _ in 0..25 {
            detector.observe(&[0.1, 0.2]).unwrap();
        }
        assert!((detector.summary().window_fill - 0.5).abs() < 1e-12);

        detector.reset_windows();
        let summary = detector.summary();
        assert_eq!(summary.window_fill, 0.0);
        assert!(summary.fitted);
        assert_eq!(summary.n_features, 2);
        assert_eq!(summary.reference_summaries[1].0, "feature_1");
    }

    #[test]
    fn test_reference_is_subsampled() {
        let mut config = DriftConfig::default();
        config.max_reference_samples = 100;
        let detector = DriftDetector::new(config).unwrap();
        detector.fit(&normal_batch(1000, 1, 0.0, 2)).unwrap();

        let report = detector.detect(&normal_batch(100, 1, 0.0, 3)).unwrap();
        assert_eq!(report.features[0].reference_size, 100);
    }

    #[test]
    fn test_feature_name_count_mismatch() {
        let config = DriftConfig::default().with_feature_names(vec!["only".to_string()]);
        let detector = DriftDetector::new(config).unwrap();
        let err = detector.fit(&normal_batch(100, 2, 0.0, 1)).unwrap_err();
        assert!(matches!(err, DeployError::ShapeError { .. }));
    }
}
