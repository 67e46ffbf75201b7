//! Model routing module
//!
//! Decides which model version serves each request under a deployment
//! strategy, compares shadow traffic, and performs atomic promote/rollback:
//! - Shadow: primary serves, candidate scored on the side
//! - Canary: weighted random split between primary and candidate
//! - Blue-green: all traffic to the current primary

mod model_router;
mod shadow;

pub use model_router::{
    ModelRouter, RouterCounters, RouterState, RoutingDecision, ServedPrediction, ShadowHandle,
    ShadowOutcome, TransitionRecord,
};
pub use shadow::{ShadowAnalysis, ShadowComparisonRecord, ShadowTracker};

use crate::error::{DeployError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Canary weight used when a strategy string names no weight
pub const DEFAULT_CANARY_WEIGHT: f64 = 0.1;

/// Identifier of a deployed model version
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModelVersion(String);

impl ModelVersion {
    pub fn new(version: impl Into<String>) -> Self {
        Self(version.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ModelVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ModelVersion {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ModelVersion {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Deployment strategy
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RoutingStrategy {
    /// Primary answers, candidate is scored in parallel and only recorded
    Shadow,
    /// Fraction `weight` of traffic goes to the candidate
    Canary { weight: f64 },
    /// Everything goes to the current primary
    BlueGreen,
}

impl RoutingStrategy {
    /// Canary strategy with a validated weight in [0, 1]
    pub fn canary(weight: f64) -> Result<Self> {
        let strategy = RoutingStrategy::Canary { weight };
        strategy.validate()?;
        Ok(strategy)
    }

    /// Reject canary weights outside [0, 1]
    pub fn validate(&self) -> Result<()> {
        match self {
            RoutingStrategy::Canary { weight } if !(0.0..=1.0).contains(weight) => Err(
                DeployError::InvalidStrategy(format!("canary weight {} outside [0, 1]", weight)),
            ),
            _ => Ok(()),
        }
    }

    /// Canary weight, 0.0 for strategies that never send live traffic to the candidate
    pub fn canary_weight(&self) -> f64 {
        match self {
            RoutingStrategy::Canary { weight } => *weight,
            _ => 0.0,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            RoutingStrategy::Shadow => "shadow",
            RoutingStrategy::Canary { .. } => "canary",
            RoutingStrategy::BlueGreen => "blue-green",
        }
    }
}

impl Default for RoutingStrategy {
    fn default() -> Self {
        RoutingStrategy::Shadow
    }
}

impl fmt::Display for RoutingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoutingStrategy::Canary { weight } => write!(f, "canary:{}", weight),
            other => f.write_str(other.name()),
        }
    }
}

impl FromStr for RoutingStrategy {
    type Err = DeployError;

    /// Accepts `shadow`, `canary`, `canary:<weight>`, `blue-green`, `blue_green`
    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().to_ascii_lowercase();
        let (name, arg) = match normalized.split_once(':') {
            Some((name, arg)) => (name, Some(arg)),
            None => (normalized.as_str(), None),
        };

        match (name, arg) {
            ("shadow", None) => Ok(RoutingStrategy::Shadow),
            ("blue-green" | "blue_green" | "bluegreen", None) => Ok(RoutingStrategy::BlueGreen),
            ("canary", None) => RoutingStrategy::canary(DEFAULT_CANARY_WEIGHT),
            ("canary", Some(w)) => {
                let weight: f64 = w.trim().parse().map_err(|_| {
                    DeployError::InvalidStrategy(format!("invalid canary weight '{}'", w))
                })?;
                RoutingStrategy::canary(weight)
            }
            _ => Err(DeployError::InvalidStrategy(s.to_string())),
        }
    }
}

/// Lifecycle phase of a router
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentPhase {
    /// Only the primary receives traffic
    PrimaryOnly,
    /// Candidate scored in shadow
    ShadowActive,
    /// Candidate receives a weighted share of live traffic
    CanaryActive,
    /// Candidate swapped in as primary; previous primary retained for rollback
    Promoted,
}

impl DeploymentPhase {
    /// Phase implied by a strategy when a candidate is staged
    pub(crate) fn for_strategy(strategy: &RoutingStrategy) -> Self {
        match strategy {
            RoutingStrategy::Shadow => DeploymentPhase::ShadowActive,
            RoutingStrategy::Canary { .. } => DeploymentPhase::CanaryActive,
            RoutingStrategy::BlueGreen => DeploymentPhase::PrimaryOnly,
        }
    }
}

impl fmt::Display for DeploymentPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeploymentPhase::PrimaryOnly => "primary-only",
            DeploymentPhase::ShadowActive => "shadow-active",
            DeploymentPhase::CanaryActive => "canary-active",
            DeploymentPhase::Promoted => "promoted",
        };
        f.write_str(s)
    }
}

/// Which side of a deployment served a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelRole {
    Primary,
    Candidate,
}

/// Router configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Version serving traffic at startup
    pub primary_version: ModelVersion,
    /// Optional candidate staged at startup
    pub candidate_version: Option<ModelVersion>,
    /// Strategy applied once a candidate is staged
    pub strategy: RoutingStrategy,
    /// Score at or above which a prediction counts as positive
    pub decision_threshold: f64,
    /// Maximum shadow comparison records kept
    pub shadow_history_capacity: usize,
    /// Log every shadow comparison at debug level
    pub log_shadow_comparisons: bool,
    /// Seed for the canary split; entropy when absent
    pub seed: Option<u64>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            primary_version: ModelVersion::new("v1"),
            candidate_version: None,
            strategy: RoutingStrategy::Shadow,
            decision_threshold: 0.5,
            shadow_history_capacity: 1000,
            log_shadow_comparisons: true,
            seed: None,
        }
    }
}

impl RouterConfig {
    pub fn new(primary: impl Into<ModelVersion>) -> Self {
        Self {
            primary_version: primary.into(),
            ..Self::default()
        }
    }

    /// Builder method to stage a candidate
    pub fn with_candidate(mut self, candidate: impl Into<ModelVersion>) -> Self {
        self.candidate_version = Some(candidate.into());
        self
    }

    /// Builder method to set the strategy
    pub fn with_strategy(mut self, strategy: RoutingStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Builder method to set the decision threshold
    pub fn with_decision_threshold(mut self, threshold: f64) -> Self {
        self.decision_threshold = threshold;
        self
    }

    /// Builder method to set shadow history capacity
    pub fn with_shadow_history(mut self, capacity: usize) -> Self {
        self.shadow_history_capacity = capacity;
        self
    }

    /// Builder method to seed the canary split
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn validate(&self) -> Result<()> {
        self.strategy.validate()?;
        if self.primary_version.as_str().is_empty() {
            return Err(DeployError::ConfigError("primary version must not be empty".into()));
        }
        if let Some(candidate) = &self.candidate_version {
            if candidate == &self.primary_version {
                return Err(DeployError::ConfigError(format!(
                    "candidate version {} equals primary version",
                    candidate
                )));
            }
        }
        if !(0.0..=1.0).contains(&self.decision_threshold) {
            return Err(DeployError::invalid_parameter(
                "decision_threshold",
                self.decision_threshold,
                "must be within [0, 1]",
            ));
        }
        if self.shadow_history_capacity == 0 {
            return Err(DeployError::invalid_parameter(
                "shadow_history_capacity",
                0,
                "must be positive",
            ));
        }
        Ok(())
    }
}

/// Boundary to the scoring models: given a feature vector, return a
/// probability in [0, 1]. Failures should be reported as
/// [`DeployError::ModelUnavailable`].
pub trait ModelInvoker: Send + Sync {
    fn invoke(&self, version: &ModelVersion, features: &[f64]) -> Result<f64>;
}

impl<F> ModelInvoker for F
where
    F: Fn(&ModelVersion, &[f64]) -> Result<f64> + Send + Sync,
{
    fn invoke(&self, version: &ModelVersion, features: &[f64]) -> Result<f64> {
        self(version, features)
    }
}

/// Receiver of retraining hand-offs
pub trait DeploymentTarget: Send + Sync {
    /// Make `version` the serving primary
    fn deploy(&self, version: &ModelVersion) -> Result<()>;
}
