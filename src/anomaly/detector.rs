//! Fitted outlier detector with running summary

use super::{
    IsolationForest, OutlierConfig, OutlierEvent, OutlierMethod, OutlierVerdict,
    StandardizedDistance,
};
use crate::error::{DeployError, Result};
use crate::events::{EngineEvent, EventPublisher};
use crate::monitoring::StatWindow;
use chrono::Utc;
use ndarray::Array2;
use parking_lot::{Mutex, RwLock};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug)]
enum Scorer {
    Forest(IsolationForest),
    Distance(StandardizedDistance),
}

impl Scorer {
    fn score(&self, sample: &[f64]) -> f64 {
        match self {
            Scorer::Forest(forest) => forest.score(sample),
            Scorer::Distance(distance) => distance.score(sample),
        }
    }
}

#[derive(Debug)]
struct FittedScorer {
    scorer: Scorer,
    threshold: f64,
    n_features: usize,
}

/// Verdicts for a batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutlierBatch {
    pub verdicts: Vec<OutlierVerdict>,
    pub n_outliers: usize,
    pub outlier_rate: f64,
    /// Rate exceeded `spike_factor * contamination`
    pub is_spike: bool,
}

/// Dashboard view of the detector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutlierSummary {
    pub fitted: bool,
    pub method: String,
    pub contamination: f64,
    pub threshold: Option<f64>,
    pub total_scored: u64,
    pub total_flagged: u64,
    pub flagged_fraction: f64,
    /// Outlier fraction over the most recent verdicts
    pub recent_rate: f64,
    pub max_batch_rate: f64,
}

/// Scores feature vectors against a fitted reference population
pub struct OutlierDetector {
    config: OutlierConfig,
    state: RwLock<Option<Arc<FittedScorer>>>,
    scored: AtomicU64,
    flagged: AtomicU64,
    recent: Mutex<StatWindow>,
    max_batch_rate: Mutex<f64>,
    publisher: Option<EventPublisher>,
}

impl OutlierDetector {
    pub fn new(config: OutlierConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            recent: Mutex::new(StatWindow::new(config.recent_window)),
            config,
            state: RwLock::new(None),
            scored: AtomicU64::new(0),
            flagged: AtomicU64::new(0),
            max_batch_rate: Mutex::new(0.0),
            publisher: None,
        })
    }

    /// Forward outlier events to an event publisher
    pub fn with_publisher(mut self, publisher: EventPublisher) -> Self {
        self.publisher = Some(publisher);
        self
    }

    pub fn config(&self) -> &OutlierConfig {
        &self.config
    }

    pub fn is_fitted(&self) -> bool {
        self.state.read().is_some()
    }

    /// Score threshold calibrated at fit time
    pub fn threshold(&self) -> Option<f64> {
        self.state.read().as_ref().map(|f| f.threshold)
    }

    fn fitted(&self) -> Result<Arc<FittedScorer>> {
        self.state
            .read()
            .as_ref()
            .map(Arc::clone)
            .ok_or(DeployError::NotFitted)
    }

    /// Fit the scorer and calibrate the threshold at the
    /// `(1 - contamination)` quantile of the reference scores
    pub fn fit(&self, reference: &Array2<f64>) -> Result<()> {
        let (n_rows, n_features) = reference.dim();
        if n_features == 0 {
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

        let scorer = match self.config.method {
            OutlierMethod::IsolationForest {
                n_estimators,
                max_samples,
            } => Scorer::Forest(IsolationForest::fit(
                reference,
                n_estimators,
                max_samples,
                self.config.seed,
            )?),
            OutlierMethod::StandardizedDistance => {
                Scorer::Distance(StandardizedDistance::fit(reference)?)
            }
        };

        let mut scores: Vec<f64> = reference
            .rows()
            .into_iter()
            .map(|row| row.to_vec())
            .collect::<Vec<_>>()
            .par_iter()
            .map(|row| scorer.score(row))
            .collect();
        let threshold = quantile(&mut scores, 1.0 - self.config.contamination);

        *self.state.write() = Some(Arc::new(FittedScorer {
            scorer,
            threshold,
            n_features,
        }));

        info!(
            method = self.config.method.name(),
            n_rows,
            n_features,
            threshold,
            contamination = self.config.contamination,
            "Outlier detector fitted"
        );
        Ok(())
    }

    fn check_vector(fitted: &FittedScorer, vector: &[f64]) -> Result<()> {
        if vector.len() != fitted.n_features {
            return Err(DeployError::ShapeError {
                expected: format!("{} features", fitted.n_features),
                actual: format!("{} features", vector.len()),
            });
        }
        if vector.iter().any(|v| !v.is_finite()) {
            return Err(DeployError::ValidationError(
                "feature vector contains non-finite values".to_string(),
            ));
        }
        Ok(())
    }

    fn verdict(fitted: &FittedScorer, vector: &[f64]) -> OutlierVerdict {
        let anomaly_score = fitted.scorer.score(vector);
        OutlierVerdict {
            anomaly_score,
            is_outlier: anomaly_score > fitted.threshold,
        }
    }

    fn count(&self, verdicts: &[OutlierVerdict]) {
        let n_flagged = verdicts.iter().filter(|v| v.is_outlier).count() as u64;
        self.scored.fetch_add(verdicts.len() as u64, Ordering::Relaxed);
        self.flagged.fetch_add(n_flagged, Ordering::Relaxed);

        let mut recent = self.recent.lock();
        for v in verdicts {
            recent.push(if v.is_outlier { 1.0 } else { 0.0 });
        }
    }

    /// Score one vector
    pub fn detect(&self, vector: &[f64]) -> Result<OutlierVerdict> {
        let fitted = self.fitted()?;
        Self::check_vector(&fitted, vector)?;

        let verdict = Self::verdict(&fitted, vector);
        self.count(std::slice::from_ref(&verdict));
        if verdict.is_outlier {
            debug!(score = verdict.anomaly_score, "Outlier detected");
        }
        Ok(verdict)
    }

    /// Score one request and publish the outcome when it is an outlier
    pub fn score_request(&self, request_id: &str, vector: &[f64]) -> Result<OutlierEvent> {
        let verdict = self.detect(vector)?;
        let event = OutlierEvent {
            timestamp: Utc::now(),
            request_id: request_id.to_string(),
            anomaly_score: verdict.anomaly_score,
            is_outlier: verdict.is_outlier,
        };

        if event.is_outlier {
            if let Some(publisher) = &self.publisher {
                publisher.publish(EngineEvent::Outlier(event.clone()));
            }
        }
        Ok(event)
    }

    /// Score every row of `batch`
    pub fn detect_batch(&self, batch: &Array2<f64>) -> Result<OutlierBatch> {
        let fitted = self.fitted()?;
        if batch.ncols() != fitted.n_features {
            return Err(DeployError::ShapeError {
                expected: format!("{} columns", fitted.n_features),
                actual: format!("{} columns", batch.ncols()),
            });
        }
        if batch.nrows() == 0 {
            return Err(DeployError::InsufficientData {
                required: 1,
                actual: 0,
            });
        }

        let rows: Vec<Vec<f64>> = batch.rows().into_iter().map(|r| r.to_vec()).collect();
        let verdicts = rows
            .par_iter()
            .map(|row| {
                Self::check_vector(&fitted, row)?;
                Ok(Self::verdict(&fitted, row))
            })
            .collect::<Result<Vec<_>>>()?;
        self.count(&verdicts);

        let n_outliers = verdicts.iter().filter(|v| v.is_outlier).count();
        let outlier_rate = n_outliers as f64 / verdicts.len() as f64;
        let is_spike = outlier_rate > self.config.spike_rate();

        {
            let mut max_rate = self.max_batch_rate.lock();
            *max_rate = max_rate.max(outlier_rate);
        }

        if is_spike {
            warn!(
                outlier_rate,
                expected = self.config.contamination,
                n_outliers,
                batch_size = verdicts.len(),
                "Outlier rate exceeds expected contamination"
            );
        }

        Ok(OutlierBatch {
            verdicts,
            n_outliers,
            outlier_rate,
            is_spike,
        })
    }

    pub fn summary(&self) -> OutlierSummary {
        let scored = self.scored.load(Ordering::Relaxed);
        let flagged = self.flagged.load(Ordering::Relaxed);

        OutlierSummary {
            fitted: self.is_fitted(),
            method: self.config.method.name().to_string(),
            contamination: self.config.contamination,
            threshold: self.threshold(),
            total_scored: scored,
            total_flagged: flagged,
            flagged_fraction: if scored > 0 {
                flagged as f64 / scored as f64
            } else {
                0.0
            },
            recent_rate: self.recent.lock().mean(),
            max_batch_rate: *self.max_batch_rate.lock(),
        }
    }
}

/// Value at quantile `q` of `values` (nearest rank)
fn quantile(values: &mut [f64], q: f64) -> f64 {
    if values.is_empty() {
        return f64::INFINITY;
    }
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(CmpOrdering::Equal));
    let rank = (q.clamp(0.0, 1.0) * values.len() as f64).ceil() as usize;
    values[rank.saturating_sub(1).min(values.len() - 1)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_distr::{Distribution, Normal};
    use rand_xoshiro::Xoshiro256PlusPlus;

    fn normal_batch(rows: usize, cols: usize, mean: f64, seed: u64) -> Array2<f64> {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(seed);
        let normal = Normal::new(mean, 1.0).unwrap();
        Array2::from_shape_fn((rows, cols), |_| normal.sample(&mut rng))
    }

    fn forest_detector() -> OutlierDetector {
        OutlierDetector::new(
            OutlierConfig::default()
                .with_seed(42)
                .with_method(OutlierMethod::IsolationForest {
                    n_estimators: 50,
                    max_samples: 128,
                }),
        )
        .unwrap()
    }

    #[test]
    fn test_not_fitted() {
        let detector = forest_detector();
        assert!(matches!(detector.detect(&[0.0]), Err(DeployError::NotFitted)));
    }

    #[test]
    fn test_reference_flag_rate_matches_contamination() {
        let detector = forest_detector();
        let reference = normal_batch(500, 3, 0.0, 1);
        detector.fit(&reference).unwrap();

        let batch = detector.detect_batch(&reference).unwrap();
        // Threshold is the 90th percentile of reference scores
        assert!(batch.outlier_rate <= 0.1 + 1e-9);
        assert!(batch.outlier_rate > 0.05);
        assert!(!batch.is_spike);
    }

    #[test]
    fn test_far_point_is_outlier() {
        let detector = forest_detector();
        detector.fit(&normal_batch(300, 2, 0.0, 3)).unwrap();

        let verdict = detector.detect(&[12.0, -12.0]).unwrap();
        assert!(verdict.is_outlier);
        assert!(verdict.anomaly_score > detector.threshold().unwrap());
    }

    #[test]
    fn test_shifted_batch_is_spike() {
        let detector = OutlierDetector::new(
            OutlierConfig::default().with_method(OutlierMethod::StandardizedDistance),
        )
        .unwrap();
        detector.fit(&normal_batch(400, 2, 0.0, 5)).unwrap();

        let batch = detector.detect_batch(&normal_batch(100, 2, 6.0, 6)).unwrap();
        assert!(batch.is_spike);
        assert!(batch.outlier_rate > 0.9);

        let summary = detector.summary();
        assert_eq!(summary.total_scored, 100);
        assert_eq!(summary.method, "standardized_distance");
        assert!(summary.max_batch_rate > 0.9);
        assert!(summary.recent_rate > 0.9);
    }

    #[test]
    fn test_score_request_builds_event() {
        let detector = forest_detector();
        detector.fit(&normal_batch(200, 2, 0.0, 9)).unwrap();

        let event = detector.score_request("req-1", &[0.0, 0.0]).unwrap();
        assert_eq!(event.request_id, "req-1");
        assert!(!event.is_outlier);
        assert_eq!(detector.summary().total_scored, 1);
    }

    #[test]
    fn test_wrong_dimension() {
        let detector = forest_detector();
        detector.fit(&normal_batch(100, 2, 0.0, 9)).unwrap();
        assert!(matches!(
            detector.detect(&[0.0, 0.0, 0.0]),
            Err(DeployError::ShapeError { .. })
        ));
        assert!(matches!(
            detector.detect(&[f64::NAN, 0.0]),
            Err(DeployError::ValidationError(_))
        ));
    }

    #[test]
    fn test_quantile_nearest_rank() {
        let mut v: Vec<f64> = (1..=10).map(|i| i as f64).collect();
        assert_eq!(quantile(&mut v, 0.9), 9.0);
        assert_eq!(quantile(&mut v, 1.0), 10.0);
        assert_eq!(quantile(&mut v, 0.0), 1.0);
    }
}
