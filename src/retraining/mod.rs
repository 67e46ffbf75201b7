//! Retraining Module
//!
//! Decides when accumulated feedback warrants a retraining job, runs one job
//! at a time against an external training routine, gates the result on
//! validation metrics and optionally hands the new version to the router.

mod metrics;
mod trigger;

pub use metrics::{GateMetric, ValidationMetrics};
pub use trigger::RetrainingTrigger;

use crate::error::{DeployError, Result};
use crate::router::ModelVersion;
use chrono::{DateTime, Utc};
use ndarray::{Array2, ArrayView1};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Retraining configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrainingConfig {
    /// Labeled feedback needed before retraining is considered
    pub min_samples: u64,
    /// Live performance below this, or a candidate gate metric below it,
    /// counts as failing
    pub performance_threshold: f64,
    /// Promote a candidate that passes the gate without operator action
    pub auto_deploy: bool,
    pub gate_metric: GateMetric,
    /// Fraction of the dataset held out for validation
    pub validation_split: f64,
    /// Score at or above which a prediction is positive
    pub decision_threshold: f64,
    /// Seed for the train/validation shuffle
    pub seed: Option<u64>,
    /// Finished jobs retained in history
    pub history_capacity: usize,
    /// Delay before a medium-severity alert's retraining check comes due
    pub delayed_check_secs: u64,
}

impl Default for RetrainingConfig {
    fn default() -> Self {
        Self {
            min_samples: 10_000,
            performance_threshold: 0.85,
            auto_deploy: false,
            gate_metric: GateMetric::F1,
            validation_split: 0.2,
            decision_threshold: 0.5,
            seed: None,
            history_capacity: 100,
            delayed_check_secs: 3600,
        }
    }
}

impl RetrainingConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder method to set the feedback sample gate
    pub fn with_min_samples(mut self, n: u64) -> Self {
        self.min_samples = n;
        self
    }

    /// Builder method to set the performance threshold
    pub fn with_performance_threshold(mut self, threshold: f64) -> Self {
        self.performance_threshold = threshold;
        self
    }

    /// Builder method to enable automatic deployment
    pub fn with_auto_deploy(mut self, enabled: bool) -> Self {
        self.auto_deploy = enabled;
        self
    }

    /// Builder method to set the gate metric
    pub fn with_gate_metric(mut self, metric: GateMetric) -> Self {
        self.gate_metric = metric;
        self
    }

    /// Builder method to set the shuffle seed
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_delayed_check_secs(mut self, secs: u64) -> Self {
        self.delayed_check_secs = secs;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.performance_threshold) {
            return Err(DeployError::invalid_parameter(
                "retraining.performance_threshold",
                self.performance_threshold,
                "must be within [0, 1]",
            ));
        }
        if !(self.validation_split > 0.0 && self.validation_split < 1.0) {
            return Err(DeployError::invalid_parameter(
                "retraining.validation_split",
                self.validation_split,
                "must be within (0, 1)",
            ));
        }
        if !(0.0..=1.0).contains(&self.decision_threshold) {
            return Err(DeployError::invalid_parameter(
                "retraining.decision_threshold",
                self.decision_threshold,
                "must be within [0, 1]",
            ));
        }
        if self.history_capacity == 0 {
            return Err(DeployError::invalid_parameter(
                "retraining.history_capacity",
                self.history_capacity,
                "must be positive",
            ));
        }
        Ok(())
    }
}

/// Retraining job lifecycle:
/// `pending -> running -> evaluating -> {deployed | rejected}`, with `failed`
/// reachable from `running` or `evaluating`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Evaluating,
    /// Passed the quality gate
    Deployed,
    /// Failed the quality gate
    Rejected,
    Failed,
}

impl JobStatus {
    /// Holding the single in-flight slot
    pub fn is_in_flight(&self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Running | JobStatus::Evaluating)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_in_flight()
    }

    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Failed)
                | (Running, Evaluating)
                | (Running, Failed)
                | (Evaluating, Deployed)
                | (Evaluating, Rejected)
                | (Evaluating, Failed)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Evaluating => "evaluating",
            JobStatus::Deployed => "deployed",
            JobStatus::Rejected => "rejected",
            JobStatus::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// Why a job ended in `failed`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "stage", content = "reason", rename_all = "snake_case")]
pub enum JobFailure {
    Training(String),
    Evaluation(String),
    /// Auto-deploy hand-off to the router failed
    Deployment(String),
    Cancelled,
}

impl fmt::Display for JobFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobFailure::Training(reason) => write!(f, "training failed: {}", reason),
            JobFailure::Evaluation(reason) => write!(f, "evaluation failed: {}", reason),
            JobFailure::Deployment(reason) => write!(f, "deployment failed: {}", reason),
            JobFailure::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// One retraining attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrainingJob {
    pub id: String,
    pub target_version: ModelVersion,
    pub status: JobStatus,
    pub sample_count: usize,
    pub train_count: usize,
    pub validation_count: usize,
    pub metrics: Option<ValidationMetrics>,
    pub failure: Option<JobFailure>,
    /// The router received the new version
    pub auto_deployed: bool,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl RetrainingJob {
    pub(crate) fn new(id: String, target_version: ModelVersion, sample_count: usize) -> Self {
        Self {
            id,
            target_version,
            status: JobStatus::Pending,
            sample_count,
            train_count: 0,
            validation_count: 0,
            metrics: None,
            failure: None,
            auto_deployed: false,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn duration_secs(&self) -> Option<f64> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds() as f64 / 1000.0),
            _ => None,
        }
    }
}

/// Feature rows with binary labels
#[derive(Debug, Clone)]
pub struct LabeledDataset {
    pub features: Array2<f64>,
    pub labels: Vec<bool>,
}

impl LabeledDataset {
    pub fn new(features: Array2<f64>, labels: Vec<bool>) -> Result<Self> {
        if features.nrows() != labels.len() {
            return Err(DeployError::ShapeError {
                expected: format!("{} labels", features.nrows()),
                actual: format!("{} labels", labels.len()),
            });
        }
        Ok(Self { features, labels })
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Rows at `indices`, in that order
    pub fn select(&self, indices: &[usize]) -> Self {
        Self {
            features: self.features.select(ndarray::Axis(0), indices),
            labels: indices.iter().map(|&i| self.labels[i]).collect(),
        }
    }
}

/// Trained model produced by a [`TrainingRoutine`]
pub trait ScoringModel: Send + Sync {
    /// Probability of the positive class
    fn score(&self, features: ArrayView1<'_, f64>) -> Result<f64>;
}

/// External training routine
pub trait TrainingRoutine: Send + Sync {
    /// Fit a model on `train`. Long-running routines should poll `cancel`.
    fn train(
        &self,
        train: &LabeledDataset,
        target: &ModelVersion,
        cancel: &CancelFlag,
    ) -> Result<Box<dyn ScoringModel>>;
}

/// Shared cancellation signal for an in-flight job
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_transitions() {
        use JobStatus::*;
        assert!(Pending.can_transition_to(Running));
        assert!(Running.can_transition_to(Evaluating));
        assert!(Evaluating.can_transition_to(Deployed));
        assert!(Evaluating.can_transition_to(Rejected));
        assert!(Running.can_transition_to(Failed));
        assert!(!Deployed.can_transition_to(Pending));
        assert!(!Failed.can_transition_to(Pending));
        assert!(!Running.can_transition_to(Deployed));
        assert!(Evaluating.is_in_flight());
        assert!(Rejected.is_terminal());
    }

    #[test]
    fn test_defaults() {
        let config = RetrainingConfig::default();
        assert_eq!(config.min_samples, 10_000);
        assert_eq!(config.performance_threshold, 0.85);
        assert!(!config.auto_deploy);
        assert_eq!(config.gate_metric, GateMetric::F1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_dataset_shape_checked() {
        let features = Array2::zeros((3, 2));
        assert!(LabeledDataset::new(features.clone(), vec![true, false]).is_err());
        let ds = LabeledDataset::new(features, vec![true, false, true]).unwrap();
        let sub = ds.select(&[2, 0]);
        assert_eq!(sub.len(), 2);
        assert_eq!(sub.labels, vec![true, true]);
    }

    #[test]
    fn test_cancel_flag_is_shared() {
        let flag = CancelFlag::new();
        let clone = flag.clone();
        clone.cancel();
        assert!(flag.is_cancelled());
    }

    #[test]
    fn test_failure_display() {
        assert_eq!(JobFailure::Cancelled.to_string(), "cancelled");
        assert!(JobFailure::Training("oom".into()).to_string().contains("oom"));
    }
}
