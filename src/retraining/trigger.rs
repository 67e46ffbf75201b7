//! Retraining trigger: gating, single-flight execution and hand-off

use super::{
    CancelFlag, JobFailure, JobStatus, LabeledDataset, RetrainingConfig, RetrainingJob,
    TrainingRoutine, ValidationMetrics,
};
use crate::error::{DeployError, Result};
use crate::monitoring::alerts::panic_message;
use crate::monitoring::{Alert, AlertSeverity};
use crate::router::{DeploymentTarget, ModelVersion};
use chrono::{DateTime, Duration, Utc};
use parking_lot::{Mutex, RwLock};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_xoshiro::Xoshiro256PlusPlus;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

struct InFlight {
    job: RetrainingJob,
    cancel: CancelFlag,
}

/// Decides when to retrain and runs at most one job at a time
pub struct RetrainingTrigger {
    config: RetrainingConfig,
    current: Mutex<Option<InFlight>>,
    history: Mutex<VecDeque<RetrainingJob>>,
    pending_high_alert: AtomicBool,
    next_check: Mutex<Option<DateTime<Utc>>>,
    deploy_target: RwLock<Option<Arc<dyn DeploymentTarget>>>,
}

impl RetrainingTrigger {
    pub fn new(config: RetrainingConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            current: Mutex::new(None),
            history: Mutex::new(VecDeque::new()),
            pending_high_alert: AtomicBool::new(false),
            next_check: Mutex::new(None),
            deploy_target: RwLock::new(None),
        })
    }

    /// Receiver of auto-deploy hand-offs
    pub fn with_deploy_target(self, target: Arc<dyn DeploymentTarget>) -> Self {
        *self.deploy_target.write() = Some(target);
        self
    }

    pub fn set_deploy_target(&self, target: Arc<dyn DeploymentTarget>) {
        *self.deploy_target.write() = Some(target);
    }

    pub fn config(&self) -> &RetrainingConfig {
        &self.config
    }

    pub fn is_in_flight(&self) -> bool {
        self.current.lock().is_some()
    }

    pub fn has_pending_alert(&self) -> bool {
        self.pending_high_alert.load(Ordering::SeqCst)
    }

    /// True iff no job is in flight, `feedback_count >= min_samples`, and
    /// either performance is below threshold or a high alert is pending
    pub fn should_retrain(&self, feedback_count: u64, current_performance: f64) -> bool {
        if self.is_in_flight() {
            debug!("Retraining check skipped, job in flight");
            return false;
        }
        if feedback_count < self.config.min_samples {
            return false;
        }
        current_performance < self.config.performance_threshold || self.has_pending_alert()
    }

    /// Feed an alert: high marks retraining as urgent, medium schedules a
    /// delayed check, low is ignored
    pub fn note_alert(&self, alert: &Alert) {
        match alert.severity {
            AlertSeverity::High => {
                self.pending_high_alert.store(true, Ordering::SeqCst);
                info!(alert_id = %alert.id, "High alert pending for retraining");
            }
            AlertSeverity::Medium => {
                let mut next = self.next_check.lock();
                if next.is_none() {
                    let due = alert.timestamp
                        + Duration::seconds(self.config.delayed_check_secs as i64);
                    *next = Some(due);
                    debug!(due = %due, "Delayed retraining check scheduled");
                }
            }
            AlertSeverity::Low => {}
        }
    }

    /// Consume the scheduled check if it is due at `now`
    pub fn check_due(&self, now: DateTime<Utc>) -> bool {
        let mut next = self.next_check.lock();
        match *next {
            Some(due) if due <= now => {
                *next = None;
                true
            }
            _ => false,
        }
    }

    pub fn next_check(&self) -> Option<DateTime<Utc>> {
        *self.next_check.lock()
    }

    /// Snapshot of the in-flight job
    pub fn current_job(&self) -> Option<RetrainingJob> {
        self.current.lock().as_ref().map(|f| f.job.clone())
    }

    /// Finished jobs, newest first
    pub fn history(&self, limit: usize) -> Vec<RetrainingJob> {
        self.history.lock().iter().rev().take(limit).cloned().collect()
    }

    /// Cancel the in-flight job. It moves to `failed` immediately and frees
    /// the slot; the routine sees the flag and its result is discarded.
    pub fn cancel(&self) -> Option<RetrainingJob> {
        let inflight = self.current.lock().take()?;
        inflight.cancel.cancel();

        let mut job = inflight.job;
        job.status = JobStatus::Failed;
        job.failure = Some(JobFailure::Cancelled);
        job.completed_at = Some(Utc::now());
        warn!(job_id = %job.id, "Retraining job cancelled");

        self.push_history(job.clone());
        Some(job)
    }

    /// Run a job to completion on the calling thread
    pub fn run_retraining(
        &self,
        dataset: &LabeledDataset,
        target_version: impl Into<ModelVersion>,
        routine: &dyn TrainingRoutine,
    ) -> Result<RetrainingJob> {
        let (job_id, cancel) = self.claim(target_version.into(), dataset.len())?;
        self.execute(&job_id, &cancel, dataset, routine)
    }

    /// Claim the slot now and run the job on the blocking pool.
    /// Must be called from within a tokio runtime.
    pub fn spawn_retraining(
        self: &Arc<Self>,
        dataset: LabeledDataset,
        target_version: impl Into<ModelVersion>,
        routine: Arc<dyn TrainingRoutine>,
    ) -> Result<(String, JoinHandle<Result<RetrainingJob>>)> {
        let (job_id, cancel) = self.claim(target_version.into(), dataset.len())?;

        let trigger = Arc::clone(self);
        let id = job_id.clone();
        let handle = tokio::task::spawn_blocking(move || {
            trigger.execute(&id, &cancel, &dataset, routine.as_ref())
        });

        Ok((job_id, handle))
    }

    fn claim(&self, target_version: ModelVersion, sample_count: usize) -> Result<(String, CancelFlag)> {
        let mut current = self.current.lock();
        if let Some(inflight) = current.as_ref() {
            return Err(DeployError::RetrainingInFlight {
                job_id: inflight.job.id.clone(),
            });
        }

        let job_id = Uuid::new_v4().to_string();
        let cancel = CancelFlag::new();
        *current = Some(InFlight {
            job: RetrainingJob::new(job_id.clone(), target_version.clone(), sample_count),
            cancel: cancel.clone(),
        });
        self.pending_high_alert.store(false, Ordering::SeqCst);

        info!(job_id = %job_id, target = %target_version, sample_count, "Retraining job created");
        Ok((job_id, cancel))
    }

    fn execute(
        &self,
        job_id: &str,
        cancel: &CancelFlag,
        dataset: &LabeledDataset,
        routine: &dyn TrainingRoutine,
    ) -> Result<RetrainingJob> {
        let target = self
            .update(job_id, JobStatus::Running, |job| job.started_at = Some(Utc::now()))
            .ok_or_else(|| self.stale(job_id))?
            .target_version;

        let (train, validation) = match self.split(dataset) {
            Ok(parts) => parts,
            Err(e) => return self.fail(job_id, JobFailure::Training(e.to_string())),
        };
        let (train_count, validation_count) = (train.len(), validation.len());

        let trained = panic::catch_unwind(AssertUnwindSafe(|| routine.train(&train, &target, cancel)));
        let model = match trained {
            _ if cancel.is_cancelled() => return self.fail(job_id, JobFailure::Cancelled),
            Ok(Ok(model)) => model,
            Ok(Err(e)) => return self.fail(job_id, JobFailure::Training(e.to_string())),
            Err(payload) => {
                return self.fail(job_id, JobFailure::Training(panic_message(payload.as_ref())))
            }
        };

        self.update(job_id, JobStatus::Evaluating, |job| {
            job.train_count = train_count;
            job.validation_count = validation_count;
        })
        .ok_or_else(|| self.stale(job_id))?;

        let scores = panic::catch_unwind(AssertUnwindSafe(|| {
            validation
                .features
                .rows()
                .into_iter()
                .map(|row| model.score(row))
                .collect::<Result<Vec<f64>>>()
        }));
        let scores = match scores {
            _ if cancel.is_cancelled() => return self.fail(job_id, JobFailure::Cancelled),
            Ok(Ok(scores)) => scores,
            Ok(Err(e)) => return self.fail(job_id, JobFailure::Evaluation(e.to_string())),
            Err(payload) => {
                return self.fail(job_id, JobFailure::Evaluation(panic_message(payload.as_ref())))
            }
        };
        if let Some(bad) = scores.iter().find(|s| !(0.0..=1.0).contains(*s)) {
            return self.fail(
                job_id,
                JobFailure::Evaluation(format!("score {} outside [0, 1]", bad)),
            );
        }

        let metrics =
            ValidationMetrics::compute(&scores, &validation.labels, self.config.decision_threshold);
        let passed = metrics.passes(self.config.gate_metric, self.config.performance_threshold);

        info!(
            job_id,
            gate = ?self.config.gate_metric,
            value = ?metrics.get(self.config.gate_metric),
            threshold = self.config.performance_threshold,
            passed,
            "Candidate evaluated"
        );

        if passed && self.config.auto_deploy {
            let target_router = self.deploy_target.read().clone();
            if let Some(router) = target_router {
                return self.hand_off(job_id, cancel, router.as_ref(), &target, metrics);
            }
            warn!(job_id, "Auto-deploy enabled but no deployment target set");
        }

        let status = if passed {
            JobStatus::Deployed
        } else {
            JobStatus::Rejected
        };
        self.finish(job_id, status, |job| job.metrics = Some(metrics))
            .ok_or_else(|| self.stale(job_id))
    }

    /// Deploy the candidate and retire the job under one hold of the slot
    /// lock, so a concurrent cancel() sees either the running job or the
    /// finished one, never a deployed job reported as cancelled.
    fn hand_off(
        &self,
        job_id: &str,
        cancel: &CancelFlag,
        router: &dyn DeploymentTarget,
        target: &ModelVersion,
        metrics: ValidationMetrics,
    ) -> Result<RetrainingJob> {
        let mut slot = self.current.lock();
        let still_current = slot.as_ref().map_or(false, |f| f.job.id == job_id);
        if !still_current || cancel.is_cancelled() {
            drop(slot);
            return self.fail(job_id, JobFailure::Cancelled);
        }

        let deployed = panic::catch_unwind(AssertUnwindSafe(|| router.deploy(target)));
        let failure = match deployed {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(payload) => Some(panic_message(payload.as_ref())),
        };
        if let Some(reason) = failure {
            if let Some(inflight) = slot.as_mut() {
                inflight.job.metrics = Some(metrics);
            }
            drop(slot);
            return self.fail(job_id, JobFailure::Deployment(reason));
        }

        let inflight = slot.take().ok_or_else(|| self.stale(job_id))?;
        drop(slot);
        info!(job_id, version = %target, "Candidate handed to router");

        Ok(self.complete(inflight.job, JobStatus::Deployed, |job| {
            job.metrics = Some(metrics);
            job.auto_deployed = true;
        }))
    }

    /// Seeded shuffle, then hold out `validation_split` of the rows
    fn split(&self, dataset: &LabeledDataset) -> Result<(LabeledDataset, LabeledDataset)> {
        let n = dataset.len();
        if n < 2 {
            return Err(DeployError::InsufficientData {
                required: 2,
                actual: n,
            });
        }

        let mut indices: Vec<usize> = (0..n).collect();
        let mut rng = match self.config.seed {
            Some(seed) => Xoshiro256PlusPlus::seed_from_u64(seed),
            None => Xoshiro256PlusPlus::from_entropy(),
        };
        indices.shuffle(&mut rng);

        let n_validation = ((n as f64 * self.config.validation_split).ceil() as usize).clamp(1, n - 1);
        let (validation, train) = indices.split_at(n_validation);
        Ok((dataset.select(train), dataset.select(validation)))
    }

    /// Move the current job to `status` if it is still `job_id`
    fn update(
        &self,
        job_id: &str,
        status: JobStatus,
        apply: impl FnOnce(&mut RetrainingJob),
    ) -> Option<RetrainingJob> {
        let mut current = self.current.lock();
        let inflight = current.as_mut().filter(|f| f.job.id == job_id)?;
        if inflight.job.status != status {
            debug_assert!(inflight.job.status.can_transition_to(status));
            debug!(job_id, from = %inflight.job.status, to = %status, "Job transition");
        }
        inflight.job.status = status;
        apply(&mut inflight.job);
        Some(inflight.job.clone())
    }

    fn finish(
        &self,
        job_id: &str,
        status: JobStatus,
        apply: impl FnOnce(&mut RetrainingJob),
    ) -> Option<RetrainingJob> {
        let job = {
            let mut current = self.current.lock();
            if current.as_ref().map_or(true, |f| f.job.id != job_id) {
                return None;
            }
            current.take()?.job
        };
        Some(self.complete(job, status, apply))
    }

    /// Stamp a job already taken out of the slot and file it in history
    fn complete(
        &self,
        mut job: RetrainingJob,
        status: JobStatus,
        apply: impl FnOnce(&mut RetrainingJob),
    ) -> RetrainingJob {
        job.status = status;
        job.completed_at = Some(Utc::now());
        apply(&mut job);

        match status {
            JobStatus::Deployed => info!(job_id = %job.id, version = %job.target_version, "Retraining job passed the gate"),
            JobStatus::Rejected => info!(job_id = %job.id, version = %job.target_version, "Retraining job rejected"),
            _ => {}
        }

        self.push_history(job.clone());
        job
    }

    fn fail(&self, job_id: &str, failure: JobFailure) -> Result<RetrainingJob> {
        let reason = failure.to_string();
        if self
            .finish(job_id, JobStatus::Failed, |job| job.failure = Some(failure))
            .is_some()
        {
            error!(job_id, reason = %reason, "Retraining job failed");
        }
        Err(DeployError::RetrainingFailed {
            job_id: job_id.to_string(),
            reason,
        })
    }

    /// The job was cancelled out from under the worker
    fn stale(&self, job_id: &str) -> DeployError {
        DeployError::RetrainingFailed {
            job_id: job_id.to_string(),
            reason: JobFailure::Cancelled.to_string(),
        }
    }

    fn push_history(&self, job: RetrainingJob) {
        let mut history = self.history.lock();
        if history.len() >= self.config.history_capacity {
            history.pop_front();
        }
        history.push_back(job);
    }
}

impl std::fmt::Debug for RetrainingTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetrainingTrigger")
            .field("config", &self.config)
            .field("in_flight", &self.is_in_flight())
            .field("pending_high_alert", &self.has_pending_alert())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retraining::{GateMetric, ScoringModel};
    use ndarray::{Array2, ArrayView1};

    /// Scores rows by their first feature
    struct FirstFeature;

    impl ScoringModel for FirstFeature {
        fn score(&self, features: ArrayView1<'_, f64>) -> Result<f64> {
            Ok(features[0].clamp(0.0, 1.0))
        }
    }

    struct FixedRoutine;

    impl TrainingRoutine for FixedRoutine {
        fn train(
            &self,
            _train: &LabeledDataset,
            _target: &ModelVersion,
            _cancel: &CancelFlag,
        ) -> Result<Box<dyn ScoringModel>> {
            Ok(Box::new(FirstFeature))
        }
    }

    struct BrokenRoutine;

    impl TrainingRoutine for BrokenRoutine {
        fn train(
            &self,
            _train: &LabeledDataset,
            _target: &ModelVersion,
            _cancel: &CancelFlag,
        ) -> Result<Box<dyn ScoringModel>> {
            Err(DeployError::ValidationError("diverged".to_string()))
        }
    }

    /// Feature 0 is 0.9 for positives and 0.1 for negatives, so the
    /// first-feature model is perfect
    fn separable(n: usize) -> LabeledDataset {
        let labels: Vec<bool> = (0..n).map(|i| i % 2 == 0).collect();
        let features =
            Array2::from_shape_fn((n, 2), |(i, j)| if j == 0 && labels[i] { 0.9 } else { 0.1 });
        LabeledDataset::new(features, labels).unwrap()
    }

    /// Feature 0 is high for negatives, so the first-feature model is
    /// always wrong
    fn inverted(n: usize) -> LabeledDataset {
        let labels: Vec<bool> = (0..n).map(|i| i % 2 == 0).collect();
        let features =
            Array2::from_shape_fn((n, 2), |(i, j)| if j == 0 && !labels[i] { 0.9 } else { 0.1 });
        LabeledDataset::new(features, labels).unwrap()
    }

    fn trigger(config: RetrainingConfig) -> RetrainingTrigger {
        RetrainingTrigger::new(config.with_seed(7)).unwrap()
    }

    #[test]
    fn test_should_retrain_needs_samples() {
        let t = trigger(RetrainingConfig::default());
        assert!(!t.should_retrain(9_999, 0.1));
        assert!(t.should_retrain(10_000, 0.5));
        assert!(!t.should_retrain(10_000, 0.9));
    }

    #[test]
    fn test_high_alert_forces_retrain() {
        let t = trigger(RetrainingConfig::default());
        t.note_alert(&Alert::new(AlertSeverity::High, "test", "drift"));
        assert!(t.should_retrain(10_000, 0.99));
        // Still gated on sample count
        assert!(!t.should_retrain(10, 0.99));
    }

    #[test]
    fn test_medium_alert_schedules_check() {
        let t = trigger(RetrainingConfig::default().with_delayed_check_secs(60));
        let alert = Alert::new(AlertSeverity::Medium, "test", "drift");
        t.note_alert(&alert);

        assert!(!t.check_due(alert.timestamp));
        assert!(t.check_due(alert.timestamp + Duration::seconds(61)));
        // Consumed
        assert!(!t.check_due(alert.timestamp + Duration::seconds(120)));
        assert!(!t.has_pending_alert());
    }

    #[test]
    fn test_passing_job_is_deployed() {
        let t = trigger(RetrainingConfig::default());
        let job = t.run_retraining(&separable(100), "v3", &FixedRoutine).unwrap();

        assert_eq!(job.status, JobStatus::Deployed);
        assert_eq!(job.validation_count, 20);
        assert_eq!(job.train_count, 80);
        assert_eq!(job.metrics.as_ref().unwrap().f1_score, 1.0);
        assert!(!job.auto_deployed);
        assert!(!t.is_in_flight());
        assert_eq!(t.history(10).len(), 1);
    }

    #[test]
    fn test_failing_gate_is_rejected() {
        let t = trigger(RetrainingConfig::default().with_gate_metric(GateMetric::Accuracy));
        let job = t.run_retraining(&inverted(100), "v3", &FixedRoutine).unwrap();
        assert_eq!(job.status, JobStatus::Rejected);
        assert_eq!(job.metrics.unwrap().accuracy, 0.0);
    }

    #[test]
    fn test_training_error_surfaces_as_failed() {
        let t = trigger(RetrainingConfig::default());
        let err = t.run_retraining(&separable(50), "v3", &BrokenRoutine).unwrap_err();
        assert!(matches!(err, DeployError::RetrainingFailed { .. }));

        let job = &t.history(1)[0];
        assert_eq!(job.status, JobStatus::Failed);
        assert!(matches!(job.failure, Some(JobFailure::Training(ref r)) if r.contains("diverged")));
    }

    #[test]
    fn test_tiny_dataset_fails() {
        let t = trigger(RetrainingConfig::default());
        assert!(t.run_retraining(&separable(1), "v3", &FixedRoutine).is_err());
        assert_eq!(t.history(1)[0].status, JobStatus::Failed);
    }

    #[test]
    fn test_second_claim_is_rejected() {
        let t = trigger(RetrainingConfig::default());
        let (first, _cancel) = t.claim(ModelVersion::new("v3"), 10).unwrap();
        let err = t.run_retraining(&separable(10), "v4", &FixedRoutine).unwrap_err();
        assert!(matches!(err, DeployError::RetrainingInFlight { ref job_id } if *job_id == first));
        assert!(!t.should_retrain(u64::MAX, 0.0));
    }

    #[test]
    fn test_cancel_moves_job_to_failed() {
        let t = trigger(RetrainingConfig::default());
        let (id, flag) = t.claim(ModelVersion::new("v3"), 10).unwrap();

        let job = t.cancel().unwrap();
        assert_eq!(job.id, id);
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.failure, Some(JobFailure::Cancelled));
        assert!(flag.is_cancelled());
        assert!(!t.is_in_flight());
        assert!(t.cancel().is_none());
    }

    struct RecordingTarget(Mutex<Vec<ModelVersion>>);

    impl DeploymentTarget for RecordingTarget {
        fn deploy(&self, version: &ModelVersion) -> Result<()> {
            self.0.lock().push(version.clone());
            Ok(())
        }
    }

    #[test]
    fn test_auto_deploy_hands_off() {
        let target = Arc::new(RecordingTarget(Mutex::new(Vec::new())));
        let t = trigger(RetrainingConfig::default().with_auto_deploy(true))
            .with_deploy_target(target.clone());

        let job = t.run_retraining(&separable(40), "v3", &FixedRoutine).unwrap();
        assert!(job.auto_deployed);
        assert_eq!(target.0.lock().as_slice(), &[ModelVersion::new("v3")]);

        // Rejected jobs are never handed off
        t.run_retraining(&inverted(40), "v4", &FixedRoutine).unwrap();
        assert_eq!(target.0.lock().len(), 1);
    }
}
