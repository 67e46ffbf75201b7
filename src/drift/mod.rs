//! Drift detection module
//!
//! Compares incoming feature distributions with a fitted reference using the
//! two-sample Kolmogorov-Smirnov test, in batch mode or over streaming
//! per-feature windows.

mod detector;
mod ks;

pub use detector::{DriftDetector, DriftSummary};
pub use ks::{KolmogorovSmirnovTest, KsResult};

use crate::error::{DeployError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How per-feature verdicts combine into the overall verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DriftPolicy {
    /// Any drifting feature flags the batch
    AnyFeature,
    /// More than half of the features must drift
    Majority,
    /// At least `count` features must drift
    AtLeast { count: usize },
}

impl DriftPolicy {
    pub fn is_drift(&self, drifted: usize, total: usize) -> bool {
        match self {
            DriftPolicy::AnyFeature => drifted >= 1,
            DriftPolicy::Majority => total > 0 && drifted * 2 > total,
            DriftPolicy::AtLeast { count } => drifted >= (*count).max(1),
        }
    }
}

impl Default for DriftPolicy {
    fn default() -> Self {
        DriftPolicy::AnyFeature
    }
}

/// What a streaming window does after a check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowMode {
    /// Clear the window; the next check waits for a full window of new values
    Reset,
    /// Keep evicting oldest-first and re-check after half a window of new values
    Slide,
}

impl Default for WindowMode {
    fn default() -> Self {
        WindowMode::Slide
    }
}

/// Per-feature drift severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriftSeverity {
    None,
    /// p-value below the threshold
    Warning,
    /// p-value below a tenth of the threshold
    Critical,
}

impl DriftSeverity {
    pub fn from_p_value(p_value: f64, threshold: f64) -> Self {
        if p_value < threshold / 10.0 {
            DriftSeverity::Critical
        } else if p_value < threshold {
            DriftSeverity::Warning
        } else {
            DriftSeverity::None
        }
    }
}

/// Drift detector configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DriftConfig {
    /// p-value below which a feature is drifting
    pub threshold: f64,
    /// Streaming window length per feature
    pub window_size: usize,
    /// Smallest batch accepted by `fit` and `detect`
    pub min_samples: usize,
    pub policy: DriftPolicy,
    pub window_mode: WindowMode,
    /// Reference values kept per feature; larger references are subsampled
    pub max_reference_samples: usize,
    /// Drift events retained in the in-memory log
    pub event_log_capacity: usize,
    /// Feature names; defaults to `feature_{i}` when empty
    pub feature_names: Vec<String>,
}

impl Default for DriftConfig {
    fn default() -> Self {
        Self {
            threshold: 0.05,
            window_size: 1000,
            min_samples: 30,
            policy: DriftPolicy::AnyFeature,
            window_mode: WindowMode::Slide,
            max_reference_samples: 10_000,
            event_log_capacity: 1000,
            feature_names: Vec::new(),
        }
    }
}

impl DriftConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder method to set the p-value threshold
    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    /// Builder method to set the streaming window size
    pub fn with_window_size(mut self, size: usize) -> Self {
        self.window_size = size;
        self
    }

    /// Builder method to set the minimum batch size
    pub fn with_min_samples(mut self, n: usize) -> Self {
        self.min_samples = n;
        self
    }

    /// Builder method to set the overall drift policy
    pub fn with_policy(mut self, policy: DriftPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Builder method to set the window mode
    pub fn with_window_mode(mut self, mode: WindowMode) -> Self {
        self.window_mode = mode;
        self
    }

    /// Builder method to name the features
    pub fn with_feature_names(mut self, names: Vec<String>) -> Self {
        self.feature_names = names;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.threshold > 0.0 && self.threshold < 1.0) {
            return Err(DeployError::invalid_parameter(
                "drift.threshold",
                self.threshold,
                "must be within (0, 1)",
            ));
        }
        if self.min_samples < 2 {
            return Err(DeployError::invalid_parameter(
                "drift.min_samples",
                self.min_samples,
                "must be at least 2",
            ));
        }
        if self.window_size < self.min_samples {
            return Err(DeployError::invalid_parameter(
                "drift.window_size",
                self.window_size,
                "must not be smaller than min_samples",
            ));
        }
        if self.max_reference_samples < self.min_samples {
            return Err(DeployError::invalid_parameter(
                "drift.max_reference_samples",
                self.max_reference_samples,
                "must not be smaller than min_samples",
            ));
        }
        Ok(())
    }
}

/// KS outcome for one feature
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureDrift {
    pub feature_name: String,
    pub statistic: f64,
    pub p_value: f64,
    pub is_drift: bool,
    pub severity: DriftSeverity,
    pub reference_size: usize,
    pub sample_size: usize,
}

/// Outcome of one drift check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriftReport {
    pub features: Vec<FeatureDrift>,
    pub n_drifted: usize,
    pub overall_is_drift: bool,
    pub policy: DriftPolicy,
    pub threshold: f64,
    pub timestamp: DateTime<Utc>,
}

impl DriftReport {
    pub fn drifted_features(&self) -> Vec<&str> {
        self.features
            .iter()
            .filter(|f| f.is_drift)
            .map(|f| f.feature_name.as_str())
            .collect()
    }

    /// Smallest p-value in the report, 1.0 when empty
    pub fn min_p_value(&self) -> f64 {
        self.features.iter().map(|f| f.p_value).fold(1.0, f64::min)
    }

    /// One event per drifting feature
    pub fn events(&self) -> Vec<DriftEvent> {
        self.features
            .iter()
            .filter(|f| f.is_drift)
            .map(|f| DriftEvent {
                timestamp: self.timestamp,
                feature_name: f.feature_name.clone(),
                p_value: f.p_value,
                statistic: f.statistic,
                severity: f.severity,
                is_drift: true,
            })
            .collect()
    }
}

/// Append-only record of a feature crossing the drift threshold
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriftEvent {
    pub timestamp: DateTime<Utc>,
    pub feature_name: String,
    pub p_value: f64,
    pub statistic: f64,
    pub severity: DriftSeverity,
    pub is_drift: bool,
}
