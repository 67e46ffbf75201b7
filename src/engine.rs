//! Monitoring engine
//!
//! Wires the router to the detectors, the alert manager and the retraining
//! trigger: served requests feed the streaming drift windows and the outlier
//! scorer, detector verdicts become alerts, and alerts feed retraining.

use crate::anomaly::{OutlierBatch, OutlierDetector, OutlierEvent, OutlierSummary};
use crate::config::EngineConfig;
use crate::drift::{DriftDetector, DriftReport, DriftSummary};
use crate::error::Result;
use crate::events::{EventPublisher, PublisherStats};
use crate::monitoring::{
    Alert, AlertCounts, AlertManager, EventAlertHandler, LogAlertHandler,
};
use crate::retraining::{LabeledDataset, RetrainingJob, RetrainingTrigger, TrainingRoutine};
use crate::router::{
    ModelInvoker, ModelRouter, ModelVersion, RouterState, ServedPrediction, ShadowAnalysis,
    ShadowComparisonRecord,
};
use chrono::{DateTime, Utc};
use ndarray::Array2;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Result of a batch check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchObservation {
    pub drift: DriftReport,
    pub outliers: OutlierBatch,
    pub alert: Option<Alert>,
}

/// Everything an operator dashboard needs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineStatus {
    pub router: RouterState,
    pub shadow: ShadowAnalysis,
    pub drift: DriftSummary,
    pub outliers: OutlierSummary,
    pub alerts: AlertCounts,
    pub retraining_in_flight: Option<RetrainingJob>,
    pub last_retraining: Option<RetrainingJob>,
    pub events: Option<PublisherStats>,
}

/// A spawned retraining job
pub type RetrainingHandle = (String, JoinHandle<Result<RetrainingJob>>);

/// Router plus monitoring pipeline
pub struct MonitoringEngine {
    config: EngineConfig,
    router: Arc<ModelRouter>,
    drift: DriftDetector,
    outlier: OutlierDetector,
    alerts: AlertManager,
    retraining: Arc<RetrainingTrigger>,
    publisher: Option<EventPublisher>,
    /// Outlier events since the last alert evaluation
    pending_outliers: Mutex<Vec<OutlierEvent>>,
}

impl MonitoringEngine {
    pub fn new(config: EngineConfig) -> Result<Self> {
        Self::build(config, None)
    }

    /// Engine whose drift, outlier and alert events go to `publisher`
    pub fn with_publisher(config: EngineConfig, publisher: EventPublisher) -> Result<Self> {
        Self::build(config, Some(publisher))
    }

    fn build(mut config: EngineConfig, publisher: Option<EventPublisher>) -> Result<Self> {
        config.alerts.contamination_baseline = config.outlier.contamination;
        config.validate()?;

        let router = Arc::new(ModelRouter::new(config.router.clone())?);
        let mut drift = DriftDetector::new(config.drift.clone())?;
        let mut outlier = OutlierDetector::new(config.outlier.clone())?;
        let alerts = AlertManager::new(config.alerts.clone())?;
        let retraining = Arc::new(RetrainingTrigger::new(config.retraining.clone())?);

        alerts.add_handler(Arc::new(LogAlertHandler));
        if let Some(publisher) = &publisher {
            drift = drift.with_publisher(publisher.clone());
            outlier = outlier.with_publisher(publisher.clone());
            alerts.add_handler(Arc::new(EventAlertHandler::new(publisher.clone())));
        }
        retraining.set_deploy_target(router.clone());

        info!(
            primary = %config.router.primary_version,
            strategy = %config.router.strategy,
            auto_deploy = config.retraining.auto_deploy,
            "Monitoring engine started"
        );

        Ok(Self {
            config,
            router,
            drift,
            outlier,
            alerts,
            retraining,
            publisher,
            pending_outliers: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn router(&self) -> &Arc<ModelRouter> {
        &self.router
    }

    pub fn drift(&self) -> &DriftDetector {
        &self.drift
    }

    pub fn outlier(&self) -> &OutlierDetector {
        &self.outlier
    }

    pub fn alerts(&self) -> &AlertManager {
        &self.alerts
    }

    pub fn retraining(&self) -> &Arc<RetrainingTrigger> {
        &self.retraining
    }

    /// Fit both detectors on the same reference population
    pub fn fit_reference(&self, reference: &Array2<f64>) -> Result<()> {
        self.drift.fit(reference)?;
        self.outlier.fit(reference)?;
        Ok(())
    }

    /// Route, invoke and monitor one request. The returned score is the
    /// served version's; monitoring problems are logged and never fail it.
    pub fn serve(
        &self,
        features: &[f64],
        invoker: Arc<dyn ModelInvoker>,
    ) -> Result<ServedPrediction> {
        let served = self.router.serve(features, invoker)?;
        self.monitor(&served.decision.request_id, features);
        Ok(served)
    }

    fn monitor(&self, request_id: &str, features: &[f64]) {
        if self.outlier.is_fitted() {
            match self.outlier.score_request(request_id, features) {
                Ok(event) => self.pending_outliers.lock().push(event),
                Err(e) => warn!(request_id, error = %e, "Outlier scoring skipped"),
            }
        }

        let report = if self.drift.is_fitted() {
            match self.drift.observe(features) {
                Ok(report) => report,
                Err(e) => {
                    warn!(request_id, error = %e, "Drift observation skipped");
                    None
                }
            }
        } else {
            None
        };

        let outliers_due = self.pending_outliers.lock().len() >= self.config.drift.window_size;
        if report.is_some() || outliers_due {
            let drift_events = report.map(|r| r.events()).unwrap_or_default();
            let outlier_events = std::mem::take(&mut *self.pending_outliers.lock());
            self.raise_alert(&drift_events, &outlier_events);
        }
    }

    fn raise_alert(
        &self,
        drift_events: &[crate::drift::DriftEvent],
        outlier_events: &[OutlierEvent],
    ) -> Option<Alert> {
        let (alert, report) = self.alerts.raise(drift_events, outlier_events)?;
        if !report.all_delivered() {
            debug!(failed = report.failed.len(), "Some alert handlers failed");
        }
        self.retraining.note_alert(&alert);
        Some(alert)
    }

    /// Batch drift and outlier check over `batch`, raising an alert if warranted
    pub fn observe_batch(&self, batch: &Array2<f64>) -> Result<BatchObservation> {
        let drift = self.drift.detect(batch)?;
        let outliers = self.outlier.detect_batch(batch)?;

        let now = Utc::now();
        let outlier_events: Vec<OutlierEvent> = outliers
            .verdicts
            .iter()
            .enumerate()
            .map(|(i, v)| OutlierEvent {
                timestamp: now,
                request_id: format!("batch-{}", i),
                anomaly_score: v.anomaly_score,
                is_outlier: v.is_outlier,
            })
            .collect();

        let alert = self.raise_alert(&drift.events(), &outlier_events);
        Ok(BatchObservation {
            drift,
            outliers,
            alert,
        })
    }

    /// Ground truth or shadow scores arriving after the response. A label
    /// for a shadowed request lands on its existing comparison.
    pub fn record_feedback(
        &self,
        request_id: &str,
        primary_score: f64,
        candidate_score: Option<f64>,
        ground_truth: Option<bool>,
    ) -> Result<Option<ShadowComparisonRecord>> {
        self.router
            .record_outcome(request_id, primary_score, candidate_score, ground_truth)
    }

    /// Whether a retraining decision should be made now: a high alert is
    /// pending or a delayed check has come due
    pub fn retraining_check_due(&self, now: DateTime<Utc>) -> bool {
        self.retraining.has_pending_alert() || self.retraining.check_due(now)
    }

    /// Spawn a retraining job if the router's labeled feedback warrants one.
    /// Live accuracy stands in for current performance; with no labels the
    /// performance gate is treated as met. Must be called within a tokio
    /// runtime.
    pub fn maybe_retrain(
        &self,
        dataset: LabeledDataset,
        target_version: impl Into<ModelVersion>,
        routine: Arc<dyn TrainingRoutine>,
    ) -> Result<Option<RetrainingHandle>> {
        let state = self.router.metrics();
        let feedback_count = state.counters.labeled_outcomes;
        let performance = state.live_accuracy().unwrap_or(1.0);

        if !self.retraining.should_retrain(feedback_count, performance) {
            debug!(feedback_count, performance, "Retraining not warranted");
            return Ok(None);
        }

        info!(feedback_count, performance, "Starting retraining");
        self.retraining
            .spawn_retraining(dataset, target_version, routine)
            .map(Some)
    }

    pub fn status(&self) -> EngineStatus {
        EngineStatus {
            router: self.router.metrics(),
            shadow: self.router.shadow_analysis(),
            drift: self.drift.summary(),
            outliers: self.outlier.summary(),
            alerts: self.alerts.counts(),
            retraining_in_flight: self.retraining.current_job(),
            last_retraining: self.retraining.history(1).into_iter().next(),
            events: self.publisher.as_ref().map(|p| p.stats()),
        }
    }
}

impl std::fmt::Debug for MonitoringEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonitoringEngine")
            .field("router", &self.router)
            .field("retraining", &self.retraining)
            .finish()
    }
}
