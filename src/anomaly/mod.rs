//! Outlier detection module
//!
//! Scores individual feature vectors against a fitted reference population.
//! Two scorers are available: an isolation forest and a standardized
//! (diagonal Mahalanobis) distance.

mod detector;
mod distance;
mod isolation_forest;

pub use detector::{OutlierBatch, OutlierDetector, OutlierSummary};
pub use distance::StandardizedDistance;
pub use isolation_forest::{IsolationForest, IsolationTree};

use crate::error::{DeployError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Scoring model fitted by the outlier detector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OutlierMethod {
    IsolationForest {
        n_estimators: usize,
        max_samples: usize,
    },
    StandardizedDistance,
}

impl OutlierMethod {
    pub fn name(&self) -> &'static str {
        match self {
            OutlierMethod::IsolationForest { .. } => "isolation_forest",
            OutlierMethod::StandardizedDistance => "standardized_distance",
        }
    }
}

impl Default for OutlierMethod {
    fn default() -> Self {
        OutlierMethod::IsolationForest {
            n_estimators: 100,
            max_samples: 256,
        }
    }
}

/// Outlier detector configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutlierConfig {
    /// Expected outlier fraction; sets the score threshold at fit time
    pub contamination: f64,
    pub method: OutlierMethod,
    /// Seed for the isolation forest
    pub seed: Option<u64>,
    /// Smallest reference batch accepted by `fit`
    pub min_samples: usize,
    /// Batch outlier rate above `spike_factor * contamination` is a spike
    pub spike_factor: f64,
    /// Recent verdicts kept for the rolling outlier rate
    pub recent_window: usize,
}

impl Default for OutlierConfig {
    fn default() -> Self {
        Self {
            contamination: 0.1,
            method: OutlierMethod::default(),
            seed: None,
            min_samples: 30,
            spike_factor: 2.0,
            recent_window: 1000,
        }
    }
}

impl OutlierConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder method to set contamination
    pub fn with_contamination(mut self, contamination: f64) -> Self {
        self.contamination = contamination;
        self
    }

    /// Builder method to set the scoring method
    pub fn with_method(mut self, method: OutlierMethod) -> Self {
        self.method = method;
        self
    }

    /// Builder method to set the random seed
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_min_samples(mut self, n: usize) -> Self {
        self.min_samples = n;
        self
    }

    /// Outlier rate above which a batch counts as a spike
    pub fn spike_rate(&self) -> f64 {
        self.contamination * self.spike_factor
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.contamination > 0.0 && self.contamination < 0.5) {
            return Err(DeployError::invalid_parameter(
                "outlier.contamination",
                self.contamination,
                "must be within (0, 0.5)",
            ));
        }
        if self.min_samples < 2 {
            return Err(DeployError::invalid_parameter(
                "outlier.min_samples",
                self.min_samples,
                "must be at least 2",
            ));
        }
        if self.spike_factor < 1.0 {
            return Err(DeployError::invalid_parameter(
                "outlier.spike_factor",
                self.spike_factor,
                "must be at least 1",
            ));
        }
        if let OutlierMethod::IsolationForest {
            n_estimators,
            max_samples,
        } = self.method
        {
            if n_estimators == 0 || max_samples < 2 {
                return Err(DeployError::invalid_parameter(
                    "outlier.method",
                    format!("{}x{}", n_estimators, max_samples),
                    "needs at least one tree of at least two samples",
                ));
            }
        }
        Ok(())
    }
}

/// Score for one vector
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OutlierVerdict {
    pub anomaly_score: f64,
    pub is_outlier: bool,
}

/// Scored request, published as an event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutlierEvent {
    pub timestamp: DateTime<Utc>,
    pub request_id: String,
    pub anomaly_score: f64,
    pub is_outlier: bool,
}
