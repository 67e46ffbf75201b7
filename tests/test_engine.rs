//! Integration test: end-to-end monitoring engine
//! Tests: fit reference → serve traffic → drift alert → feedback → retrain → promote

use kolosal_deploy::anomaly::OutlierConfig;
use kolosal_deploy::config::EngineConfig;
use kolosal_deploy::drift::DriftConfig;
use kolosal_deploy::engine::MonitoringEngine;
use kolosal_deploy::events::{spawn_event_publisher, EventConfig, MemoryEventSink};
use kolosal_deploy::monitoring::AlertSeverity;
use kolosal_deploy::retraining::{
    CancelFlag, JobStatus, LabeledDataset, RetrainingConfig, ScoringModel, TrainingRoutine,
};
use kolosal_deploy::router::{ModelInvoker, ModelVersion, RouterConfig, RoutingStrategy};
use kolosal_deploy::Result;
use ndarray::{Array2, ArrayView1};
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use rand_xoshiro::Xoshiro256PlusPlus;
use std::sync::Arc;

fn gaussian(rows: usize, cols: usize, mean: f64, seed: u64) -> Array2<f64> {
    let mut rng = Xoshiro256PlusPlus::seed_from_u64(seed);
    let normal = Normal::new(mean, 1.0).unwrap();
    Array2::from_shape_fn((rows, cols), |_| normal.sample(&mut rng))
}

fn config(auto_deploy: bool) -> EngineConfig {
    EngineConfig::default()
        .with_router(
            RouterConfig::new("v1")
                .with_candidate("v2")
                .with_strategy(RoutingStrategy::Shadow)
                .with_seed(5),
        )
        .with_drift(DriftConfig::default().with_window_size(200).with_threshold(0.001))
        .with_outlier(OutlierConfig::default().with_seed(5))
        .with_retraining(
            RetrainingConfig::default()
                .with_min_samples(200)
                .with_auto_deploy(auto_deploy)
                .with_seed(5),
        )
}

/// Scores by the sign of the first feature
fn invoker() -> Arc<dyn ModelInvoker> {
    Arc::new(|_version: &ModelVersion, features: &[f64]| -> Result<f64> {
        Ok(if features[0] > 0.0 { 0.9 } else { 0.1 })
    })
}

struct SignModel;

impl ScoringModel for SignModel {
    fn score(&self, features: ArrayView1<'_, f64>) -> Result<f64> {
        Ok(if features[0] > 1.0 { 0.9 } else { 0.1 })
    }
}

struct SignRoutine;

impl TrainingRoutine for SignRoutine {
    fn train(
        &self,
        _train: &LabeledDataset,
        _target: &ModelVersion,
        _cancel: &CancelFlag,
    ) -> Result<Box<dyn ScoringModel>> {
        Ok(Box::new(SignModel))
    }
}

#[test]
fn test_unshifted_traffic_stays_quiet() {
    let engine = MonitoringEngine::new(config(false)).unwrap();
    engine.fit_reference(&gaussian(1000, 3, 0.0, 1)).unwrap();

    let traffic = gaussian(200, 3, 0.0, 2);
    for row in traffic.rows() {
        let served = engine.serve(row.as_slice().unwrap(), invoker()).unwrap();
        assert_eq!(served.decision.served_version.as_str(), "v1");
    }

    let status = engine.status();
    assert_eq!(status.router.counters.total_requests, 200);
    assert_eq!(status.drift.total_checks, 1);
    assert_eq!(status.drift.drift_checks, 0);
    assert_eq!(status.alerts.high, 0);
    assert!(!engine.retraining().has_pending_alert());
}

#[test]
fn test_serving_without_reference_still_routes() {
    let engine = MonitoringEngine::new(config(false)).unwrap();
    let served = engine.serve(&[1.0, 2.0, 3.0], invoker()).unwrap();
    assert_eq!(served.score, 0.9);
    assert!(!engine.status().drift.fitted);
}

#[tokio::test]
async fn test_drift_to_retraining_to_promotion() {
    let sink = Arc::new(MemoryEventSink::new());
    let (publisher, publisher_task) =
        spawn_event_publisher(&EventConfig::default(), sink.clone()).unwrap();
    let engine = MonitoringEngine::with_publisher(config(true), publisher.clone()).unwrap();
    engine.fit_reference(&gaussian(1000, 3, 0.0, 3)).unwrap();

    // Shifted traffic with labels the shifted world assigns
    let traffic = gaussian(400, 3, 2.0, 4);
    let mut labels = Vec::new();
    for row in traffic.rows() {
        let features = row.as_slice().unwrap();
        let served = engine.serve(features, invoker()).unwrap();
        let label = features[0] > 1.0;
        engine
            .record_feedback(&served.decision.request_id, served.score, None, Some(label))
            .unwrap();
        labels.push(label);
    }

    let status = engine.status();
    assert!(status.drift.drift_checks >= 1);
    assert!(status.alerts.high >= 1);
    assert_eq!(status.router.counters.labeled_outcomes, 400);
    assert!(engine.retraining_check_due(chrono::Utc::now()));

    let dataset = LabeledDataset::new(traffic, labels).unwrap();
    let (_, handle) = engine
        .maybe_retrain(dataset, "v3", Arc::new(SignRoutine))
        .unwrap()
        .expect("high alert with enough feedback should retrain");
    let job = handle.await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Deployed);
    assert!(job.auto_deployed);

    let status = engine.status();
    assert_eq!(status.router.primary_version.as_str(), "v3");
    // Feedback restarts with the new primary
    assert_eq!(status.router.counters.labeled_outcomes, 0);
    assert_eq!(status.last_retraining.unwrap().id, job.id);

    drop(engine);
    drop(publisher);
    publisher_task.await.unwrap();
    let alerts = sink
        .events()
        .into_iter()
        .filter(|e| e.kind() == "alert")
        .count();
    assert!(alerts >= 1);
}

#[test]
fn test_batch_observation_grades_alert() {
    let engine = MonitoringEngine::new(config(false)).unwrap();
    engine.fit_reference(&gaussian(1000, 3, 0.0, 6)).unwrap();

    let quiet = engine.observe_batch(&gaussian(300, 3, 0.0, 7)).unwrap();
    assert!(!quiet.drift.overall_is_drift);
    assert!(!quiet.outliers.is_spike);
    // Contamination-level outliers alone grade low
    if let Some(alert) = &quiet.alert {
        assert_eq!(alert.severity, AlertSeverity::Low);
    }

    let shifted = engine.observe_batch(&gaussian(300, 3, 3.0, 8)).unwrap();
    assert!(shifted.drift.overall_is_drift);
    assert_eq!(shifted.alert.unwrap().severity, AlertSeverity::High);
}

#[test]
fn test_maybe_retrain_respects_sample_gate() {
    let engine = MonitoringEngine::new(config(false)).unwrap();
    let dataset = LabeledDataset::new(gaussian(10, 3, 0.0, 9), vec![true; 10]).unwrap();
    let started = engine
        .maybe_retrain(dataset, "v3", Arc::new(SignRoutine))
        .unwrap();
    assert!(started.is_none());
}
