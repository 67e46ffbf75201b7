//! Engine configuration
//!
//! Every component config with the defaults of the deployment service, an
//! environment overlay for `KOLOSAL_*` variables and JSON loading for the CLI.

use crate::anomaly::OutlierConfig;
use crate::drift::DriftConfig;
use crate::error::{DeployError, Result};
use crate::events::EventConfig;
use crate::monitoring::AlertConfig;
use crate::retraining::RetrainingConfig;
use crate::router::{ModelVersion, RouterConfig, RoutingStrategy};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Configuration for the whole monitoring engine
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub router: RouterConfig,
    pub drift: DriftConfig,
    pub outlier: OutlierConfig,
    pub alerts: AlertConfig,
    pub retraining: RetrainingConfig,
    pub events: EventConfig,
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder method to set the router configuration
    pub fn with_router(mut self, router: RouterConfig) -> Self {
        self.router = router;
        self
    }

    /// Builder method to set the drift configuration
    pub fn with_drift(mut self, drift: DriftConfig) -> Self {
        self.drift = drift;
        self
    }

    /// Builder method to set the outlier configuration
    pub fn with_outlier(mut self, outlier: OutlierConfig) -> Self {
        self.outlier = outlier;
        self
    }

    /// Builder method to set the alert configuration
    pub fn with_alerts(mut self, alerts: AlertConfig) -> Self {
        self.alerts = alerts;
        self
    }

    /// Builder method to set the retraining configuration
    pub fn with_retraining(mut self, retraining: RetrainingConfig) -> Self {
        self.retraining = retraining;
        self
    }

    /// Builder method to set the event publisher configuration
    pub fn with_events(mut self, events: EventConfig) -> Self {
        self.events = events;
        self
    }

    /// Defaults overlaid with `KOLOSAL_*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::default().overlay(|key| std::env::var(key).ok())
    }

    /// Parse a JSON document; missing fields keep their defaults
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| DeployError::ConfigError(format!("invalid config JSON: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Apply overrides from `lookup`, which maps a variable name to its value
    pub fn overlay(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(v) = lookup("KOLOSAL_PRIMARY_VERSION") {
            self.router.primary_version = ModelVersion::new(v.trim());
        }
        if let Some(v) = lookup("KOLOSAL_CANDIDATE_VERSION") {
            let v = v.trim();
            self.router.candidate_version = if v.is_empty() {
                None
            } else {
                Some(ModelVersion::new(v))
            };
        }
        if let Some(v) = lookup("KOLOSAL_STRATEGY") {
            self.router.strategy = RoutingStrategy::from_str(&v)?;
        }
        if let Some(v) = lookup("KOLOSAL_CANARY_WEIGHT") {
            let weight: f64 = parse_var("KOLOSAL_CANARY_WEIGHT", &v)?;
            if let RoutingStrategy::Canary { .. } = self.router.strategy {
                self.router.strategy = RoutingStrategy::canary(weight)?;
            }
        }
        if let Some(v) = lookup("KOLOSAL_ROUTER_SEED") {
            self.router.seed = Some(parse_var("KOLOSAL_ROUTER_SEED", &v)?);
        }
        if let Some(v) = lookup("KOLOSAL_DRIFT_THRESHOLD") {
            self.drift.threshold = parse_var("KOLOSAL_DRIFT_THRESHOLD", &v)?;
        }
        if let Some(v) = lookup("KOLOSAL_DRIFT_WINDOW_SIZE") {
            self.drift.window_size = parse_var("KOLOSAL_DRIFT_WINDOW_SIZE", &v)?;
        }
        if let Some(v) = lookup("KOLOSAL_OUTLIER_CONTAMINATION") {
            let contamination = parse_var("KOLOSAL_OUTLIER_CONTAMINATION", &v)?;
            self.outlier.contamination = contamination;
            self.alerts.contamination_baseline = contamination;
        }
        if let Some(v) = lookup("KOLOSAL_MIN_SAMPLES") {
            self.retraining.min_samples = parse_var("KOLOSAL_MIN_SAMPLES", &v)?;
        }
        if let Some(v) = lookup("KOLOSAL_PERFORMANCE_THRESHOLD") {
            self.retraining.performance_threshold = parse_var("KOLOSAL_PERFORMANCE_THRESHOLD", &v)?;
        }
        if let Some(v) = lookup("KOLOSAL_AUTO_DEPLOY") {
            self.retraining.auto_deploy = parse_bool("KOLOSAL_AUTO_DEPLOY", &v)?;
        }
        if let Some(v) = lookup("KOLOSAL_EVENT_CHANNEL_CAPACITY") {
            self.events.channel_capacity = parse_var("KOLOSAL_EVENT_CHANNEL_CAPACITY", &v)?;
        }

        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        self.router.validate()?;
        self.drift.validate()?;
        self.outlier.validate()?;
        self.alerts.validate()?;
        self.retraining.validate()?;
        if self.events.channel_capacity == 0 {
            return Err(DeployError::invalid_parameter(
                "events.channel_capacity",
                0,
                "must be positive",
            ));
        }
        Ok(())
    }
}

fn parse_var<T: FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| DeployError::ConfigError(format!("{} has invalid value '{}'", name, value)))
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(DeployError::ConfigError(format!(
            "{} has invalid value '{}'",
            name, value
        ))),
    }
}
