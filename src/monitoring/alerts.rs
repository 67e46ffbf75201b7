//! Alert System
//!
//! Turns drift and outlier events into severity-graded alerts and fans them
//! out to registered handlers.

use crate::anomaly::OutlierEvent;
use crate::drift::DriftEvent;
use crate::error::{DeployError, Result};
use crate::events::{EngineEvent, EventPublisher};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::{BTreeSet, VecDeque};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Severity level for alerts
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    /// Recorded only
    Low,
    /// One feature drifting
    Medium,
    /// Several features drifting or an outlier spike
    High,
}

impl AlertSeverity {
    pub fn action(&self) -> AlertAction {
        match self {
            AlertSeverity::Low => AlertAction::RecordOnly,
            AlertSeverity::Medium => AlertAction::DelayedRetrainingCheck,
            AlertSeverity::High => AlertAction::ExpeditedRetraining,
        }
    }
}

impl fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AlertSeverity::Low => "low",
            AlertSeverity::Medium => "medium",
            AlertSeverity::High => "high",
        };
        write!(f, "{}", s)
    }
}

/// What the retraining side should do about an alert
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertAction {
    RecordOnly,
    DelayedRetrainingCheck,
    ExpeditedRetraining,
}

/// A raised alert
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub severity: AlertSeverity,
    pub action: AlertAction,
    /// Detector(s) that produced the evidence
    pub source: String,
    pub message: String,
    pub context: Map<String, Value>,
}

impl Alert {
    pub fn new(severity: AlertSeverity, source: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            severity,
            action: severity.action(),
            source: source.into(),
            message: message.into(),
            context: Map::new(),
        }
    }

    pub fn with_context(mut self, key: &str, value: Value) -> Self {
        self.context.insert(key.to_string(), value);
        self
    }
}

/// Receives dispatched alerts
pub trait AlertHandler: Send + Sync {
    fn name(&self) -> &str;
    fn handle(&self, alert: &Alert) -> Result<()>;
}

/// Logs alerts at a tracing level matching their severity
#[derive(Debug, Default)]
pub struct LogAlertHandler;

impl AlertHandler for LogAlertHandler {
    fn name(&self) -> &str {
        "log"
    }

    fn handle(&self, alert: &Alert) -> Result<()> {
        match alert.severity {
            AlertSeverity::High => error!(
                alert_id = %alert.id,
                source = %alert.source,
                action = ?alert.action,
                "{}",
                alert.message
            ),
            AlertSeverity::Medium => warn!(
                alert_id = %alert.id,
                source = %alert.source,
                action = ?alert.action,
                "{}",
                alert.message
            ),
            AlertSeverity::Low => info!(
                alert_id = %alert.id,
                source = %alert.source,
                "{}",
                alert.message
            ),
        }
        Ok(())
    }
}

/// Forwards alerts to the event publisher
#[derive(Debug, Clone)]
pub struct EventAlertHandler {
    publisher: EventPublisher,
}

impl EventAlertHandler {
    pub fn new(publisher: EventPublisher) -> Self {
        Self { publisher }
    }
}

impl AlertHandler for EventAlertHandler {
    fn name(&self) -> &str {
        "event"
    }

    fn handle(&self, alert: &Alert) -> Result<()> {
        if self.publisher.publish(EngineEvent::Alert(alert.clone())) {
            Ok(())
        } else {
            Err(DeployError::ChannelClosed(
                "alert event dropped by publisher".to_string(),
            ))
        }
    }
}

/// Alert manager configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    /// Alerts retained in history
    pub history_capacity: usize,
    /// Expected outlier fraction
    pub contamination_baseline: f64,
    /// Outlier rate above `spike_factor * contamination_baseline` is a spike
    pub spike_factor: f64,
    /// Outlier events needed before a rate can count as a spike
    pub min_outlier_events: usize,
    /// Distinct drifting features that make an alert high severity
    pub high_drift_features: usize,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            history_capacity: 1000,
            contamination_baseline: 0.1,
            spike_factor: 2.0,
            min_outlier_events: 10,
            high_drift_features: 2,
        }
    }
}

impl AlertConfig {
    pub fn with_history_capacity(mut self, capacity: usize) -> Self {
        self.history_capacity = capacity;
        self
    }

    pub fn with_contamination_baseline(mut self, contamination: f64) -> Self {
        self.contamination_baseline = contamination;
        self
    }

    pub fn with_min_outlier_events(mut self, n: usize) -> Self {
        self.min_outlier_events = n;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.history_capacity == 0 {
            return Err(DeployError::invalid_parameter(
                "alerts.history_capacity",
                self.history_capacity,
                "must be positive",
            ));
        }
        if !(self.contamination_baseline > 0.0 && self.contamination_baseline < 1.0) {
            return Err(DeployError::invalid_parameter(
                "alerts.contamination_baseline",
                self.contamination_baseline,
                "must be within (0, 1)",
            ));
        }
        if self.high_drift_features < 2 {
            return Err(DeployError::invalid_parameter(
                "alerts.high_drift_features",
                self.high_drift_features,
                "must be at least 2",
            ));
        }
        Ok(())
    }
}

/// Per-handler result of a dispatch
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DispatchReport {
    pub delivered: Vec<String>,
    /// (handler, reason)
    pub failed: Vec<(String, String)>,
}

impl DispatchReport {
    pub fn all_delivered(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Counts of alerts raised since startup
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertCounts {
    pub low: u64,
    pub medium: u64,
    pub high: u64,
    pub handler_failures: u64,
}

/// Classifies detector output and dispatches alerts
pub struct AlertManager {
    config: AlertConfig,
    handlers: RwLock<Vec<Arc<dyn AlertHandler>>>,
    history: Mutex<VecDeque<Alert>>,
    low: AtomicU64,
    medium: AtomicU64,
    high: AtomicU64,
    handler_failures: AtomicU64,
}

impl AlertManager {
    pub fn new(config: AlertConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            history: Mutex::new(VecDeque::with_capacity(config.history_capacity.min(1024))),
            config,
            handlers: RwLock::new(Vec::new()),
            low: AtomicU64::new(0),
            medium: AtomicU64::new(0),
            high: AtomicU64::new(0),
            handler_failures: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &AlertConfig {
        &self.config
    }

    /// Register a handler called for every dispatched alert
    pub fn add_handler(&self, handler: Arc<dyn AlertHandler>) {
        debug!(handler = handler.name(), "Alert handler registered");
        self.handlers.write().push(handler);
    }

    pub fn handler_names(&self) -> Vec<String> {
        self.handlers
            .read()
            .iter()
            .map(|h| h.name().to_string())
            .collect()
    }

    /// Grade drift and outlier evidence. Returns `None` when there is neither
    /// a drifting feature nor a flagged outlier.
    pub fn evaluate(
        &self,
        drift_events: &[DriftEvent],
        outlier_events: &[OutlierEvent],
    ) -> Option<Alert> {
        let drifted: BTreeSet<&str> = drift_events
            .iter()
            .filter(|e| e.is_drift)
            .map(|e| e.feature_name.as_str())
            .collect();

        let n_flagged = outlier_events.iter().filter(|e| e.is_outlier).count();
        let outlier_rate = if outlier_events.is_empty() {
            0.0
        } else {
            n_flagged as f64 / outlier_events.len() as f64
        };
        let spike_rate = self.config.contamination_baseline * self.config.spike_factor;
        let is_spike = outlier_events.len() >= self.config.min_outlier_events
            && outlier_rate > spike_rate;

        if drifted.is_empty() && n_flagged == 0 {
            return None;
        }

        let severity = if drifted.len() >= self.config.high_drift_features || is_spike {
            AlertSeverity::High
        } else if drifted.len() == 1 {
            AlertSeverity::Medium
        } else {
            AlertSeverity::Low
        };

        let source = match (drifted.is_empty(), n_flagged == 0) {
            (false, true) => "drift_detector",
            (true, false) => "outlier_detector",
            _ => "drift_detector,outlier_detector",
        };

        let mut parts = Vec::new();
        if !drifted.is_empty() {
            parts.push(format!(
                "drift in {} feature(s): {}",
                drifted.len(),
                drifted.iter().copied().collect::<Vec<_>>().join(", ")
            ));
        }
        if n_flagged > 0 {
            parts.push(format!(
                "{} of {} requests flagged as outliers ({:.1}%)",
                n_flagged,
                outlier_events.len(),
                outlier_rate * 100.0
            ));
        }

        let min_p_value = drift_events
            .iter()
            .filter(|e| e.is_drift)
            .map(|e| e.p_value)
            .fold(f64::INFINITY, f64::min);

        let mut alert = Alert::new(severity, source, parts.join("; "))
            .with_context("drifted_features", json!(drifted))
            .with_context("outlier_events", json!(outlier_events.len()))
            .with_context("outliers_flagged", json!(n_flagged))
            .with_context("outlier_rate", json!(outlier_rate))
            .with_context("outlier_spike", json!(is_spike));
        if min_p_value.is_finite() {
            alert = alert.with_context("min_p_value", json!(min_p_value));
        }
        Some(alert)
    }

    /// Send `alert` to the registered handlers
    pub fn dispatch(&self, alert: &Alert) -> DispatchReport {
        let handlers = self.handlers.read().clone();
        self.dispatch_to(alert, &handlers)
    }

    /// Send `alert` to each of `handlers`. A failing or panicking handler is
    /// logged and skipped; the rest still receive the alert.
    pub fn dispatch_to(&self, alert: &Alert, handlers: &[Arc<dyn AlertHandler>]) -> DispatchReport {
        let mut report = DispatchReport::default();

        for handler in handlers {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler.handle(alert)));
            let failure = match outcome {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e.to_string()),
                Err(payload) => Some(panic_message(payload.as_ref())),
            };

            match failure {
                None => report.delivered.push(handler.name().to_string()),
                Some(reason) => {
                    self.handler_failures.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        handler = handler.name(),
                        alert_id = %alert.id,
                        reason = %reason,
                        "Alert handler failed"
                    );
                    report.failed.push((handler.name().to_string(), reason));
                }
            }
        }

        report
    }

    /// Append to history, evicting the oldest alert when full
    pub fn record(&self, alert: &Alert) {
        match alert.severity {
            AlertSeverity::Low => self.low.fetch_add(1, Ordering::Relaxed),
            AlertSeverity::Medium => self.medium.fetch_add(1, Ordering::Relaxed),
            AlertSeverity::High => self.high.fetch_add(1, Ordering::Relaxed),
        };

        let mut history = self.history.lock();
        if history.len() >= self.config.history_capacity {
            history.pop_front();
        }
        history.push_back(alert.clone());
    }

    /// Evaluate, record and dispatch in one step
    pub fn raise(
        &self,
        drift_events: &[DriftEvent],
        outlier_events: &[OutlierEvent],
    ) -> Option<(Alert, DispatchReport)> {
        let alert = self.evaluate(drift_events, outlier_events)?;
        self.record(&alert);
        let report = self.dispatch(&alert);
        Some((alert, report))
    }

    /// Most recent alerts, newest first, optionally filtered by severity
    pub fn recent_alerts(&self, limit: usize, severity: Option<AlertSeverity>) -> Vec<Alert> {
        self.history
            .lock()
            .iter()
            .rev()
            .filter(|a| severity.map_or(true, |s| a.severity == s))
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn history_len(&self) -> usize {
        self.history.lock().len()
    }

    pub fn counts(&self) -> AlertCounts {
        AlertCounts {
            low: self.low.load(Ordering::Relaxed),
            medium: self.medium.load(Ordering::Relaxed),
            high: self.high.load(Ordering::Relaxed),
            handler_failures: self.handler_failures.load(Ordering::Relaxed),
        }
    }

    pub fn clear_history(&self) {
        self.history.lock().clear();
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panicked: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panicked: {}", s)
    } else {
        "panicked".to_string()
    }
}
