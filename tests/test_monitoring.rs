//! Integration test: drift and outlier monitoring feeding alerts
//! Tests: fit reference → detect shift → grade alert → publish events

use kolosal_deploy::anomaly::{OutlierConfig, OutlierDetector, OutlierMethod};
use kolosal_deploy::drift::{DriftConfig, DriftDetector, DriftPolicy, WindowMode};
use kolosal_deploy::events::{spawn_event_publisher, EngineEvent, EventConfig, MemoryEventSink};
use kolosal_deploy::monitoring::{
    AlertConfig, AlertManager, AlertSeverity, EventAlertHandler, LogAlertHandler,
};
use ndarray::Array2;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use rand_xoshiro::Xoshiro256PlusPlus;
use std::sync::Arc;

fn gaussian(rows: usize, means: &[f64], seed: u64) -> Array2<f64> {
    let mut rng = Xoshiro256PlusPlus::seed_from_u64(seed);
    let normal = Normal::new(0.0, 1.0).unwrap();
    Array2::from_shape_fn((rows, means.len()), |(_, j)| means[j] + normal.sample(&mut rng))
}

fn drift_detector(window: usize) -> DriftDetector {
    DriftDetector::new(
        DriftConfig::default()
            .with_window_size(window)
            .with_threshold(0.001)
            .with_feature_names(vec!["age".into(), "income".into(), "tenure".into()]),
    )
    .unwrap()
}

// ============================================================================
// Drift Detection Tests
// ============================================================================

#[test]
fn test_single_feature_shift_is_localized() {
    let detector = drift_detector(500);
    detector.fit(&gaussian(2000, &[0.0, 0.0, 0.0], 1)).unwrap();

    let report = detector.detect(&gaussian(500, &[0.0, 2.0, 0.0], 2)).unwrap();
    assert!(report.overall_is_drift);
    assert_eq!(report.n_drifted, 1);
    assert_eq!(report.drifted_features(), vec!["income"]);
}

#[test]
fn test_majority_policy_needs_most_features() {
    let detector = DriftDetector::new(
        DriftConfig::default()
            .with_threshold(0.001)
            .with_policy(DriftPolicy::Majority),
    )
    .unwrap();
    detector.fit(&gaussian(1000, &[0.0, 0.0, 0.0], 3)).unwrap();

    let one = detector.detect(&gaussian(400, &[3.0, 0.0, 0.0], 4)).unwrap();
    assert_eq!(one.n_drifted, 1);
    assert!(!one.overall_is_drift);

    let two = detector.detect(&gaussian(400, &[3.0, 3.0, 0.0], 5)).unwrap();
    assert_eq!(two.n_drifted, 2);
    assert!(two.overall_is_drift);
}

#[test]
fn test_streaming_reset_window_checks_every_full_window() {
    let detector = DriftDetector::new(
        DriftConfig::default()
            .with_window_size(100)
            .with_window_mode(WindowMode::Reset),
    )
    .unwrap();
    detector.fit(&gaussian(500, &[0.0, 0.0], 6)).unwrap();

    let stream = gaussian(350, &[0.0, 0.0], 7);
    let reports = stream
        .rows()
        .into_iter()
        .filter_map(|row| detector.observe(row.as_slice().unwrap()).unwrap())
        .count();
    assert_eq!(reports, 3);
    assert_eq!(detector.summary().total_checks, 3);
}

// ============================================================================
// Outlier Detection Tests
// ============================================================================

#[test]
fn test_isolation_forest_flags_far_points() {
    let detector = OutlierDetector::new(OutlierConfig::default().with_seed(21)).unwrap();
    detector.fit(&gaussian(1000, &[0.0, 0.0], 8)).unwrap();

    let far = detector.detect(&[8.0, -8.0]).unwrap();
    let near = detector.detect(&[0.0, 0.0]).unwrap();
    assert!(far.is_outlier);
    assert!(!near.is_outlier);
    assert!(far.anomaly_score > near.anomaly_score);
}

#[test]
fn test_batch_rate_near_contamination_on_reference_data() {
    let detector = OutlierDetector::new(
        OutlierConfig::default()
            .with_method(OutlierMethod::StandardizedDistance)
            .with_contamination(0.1),
    )
    .unwrap();
    detector.fit(&gaussian(2000, &[5.0, -1.0, 0.0], 9)).unwrap();

    let batch = detector.detect_batch(&gaussian(2000, &[5.0, -1.0, 0.0], 10)).unwrap();
    assert!(
        (0.05..0.15).contains(&batch.outlier_rate),
        "rate = {}",
        batch.outlier_rate
    );
    assert!(!batch.is_spike);

    let shifted = detector.detect_batch(&gaussian(500, &[9.0, 3.0, 4.0], 11)).unwrap();
    assert!(shifted.is_spike);
}

// ============================================================================
// Alert Pipeline Tests
// ============================================================================

#[test]
fn test_alert_severity_grading() {
    let drift = drift_detector(500);
    drift.fit(&gaussian(2000, &[0.0, 0.0, 0.0], 12)).unwrap();
    let manager = AlertManager::new(AlertConfig::default()).unwrap();

    let one = drift.detect(&gaussian(500, &[0.0, 2.5, 0.0], 13)).unwrap();
    let alert = manager.evaluate(&one.events(), &[]).unwrap();
    assert_eq!(alert.severity, AlertSeverity::Medium);

    let two = drift.detect(&gaussian(500, &[2.5, 2.5, 0.0], 14)).unwrap();
    let alert = manager.evaluate(&two.events(), &[]).unwrap();
    assert_eq!(alert.severity, AlertSeverity::High);

    let none = drift.detect(&gaussian(500, &[0.0, 0.0, 0.0], 15)).unwrap();
    assert!(manager.evaluate(&none.events(), &[]).is_none());
}

#[tokio::test]
async fn test_events_flow_to_sink() {
    let sink = Arc::new(MemoryEventSink::new());
    let (publisher, handle) = spawn_event_publisher(&EventConfig::default(), sink.clone()).unwrap();

    let drift = drift_detector(500).with_publisher(publisher.clone());
    drift.fit(&gaussian(2000, &[0.0, 0.0, 0.0], 16)).unwrap();

    let manager = AlertManager::new(AlertConfig::default()).unwrap();
    manager.add_handler(Arc::new(LogAlertHandler));
    manager.add_handler(Arc::new(EventAlertHandler::new(publisher.clone())));

    let report = drift.detect(&gaussian(500, &[3.0, 3.0, 3.0], 17)).unwrap();
    let (alert, dispatch) = manager.raise(&report.events(), &[]).unwrap();
    assert_eq!(alert.severity, AlertSeverity::High);
    assert!(dispatch.all_delivered());
    assert_eq!(manager.recent_alerts(10, None).len(), 1);

    drop(drift);
    drop(manager);
    drop(publisher);
    handle.await.unwrap();

    let events = sink.events();
    let drift_events = events.iter().filter(|e| e.kind() == "drift").count();
    assert!(drift_events >= 3, "expected per-feature drift events");
    assert!(events
        .iter()
        .any(|e| matches!(e, EngineEvent::Alert(a) if a.id == alert.id)));
}
