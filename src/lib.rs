//! Kolosal Deploy - model routing and production monitoring
//!
//! This crate provides the deployment side of a Kolosal model:
//! - Shadow, canary and blue-green routing between a primary and a candidate
//! - Streaming and batch data drift detection (two-sample KS test)
//! - Outlier scoring of live requests (Isolation Forest, standardized distance)
//! - Alert grading and dispatch to pluggable handlers
//! - Feedback-gated retraining with a validation quality gate
//!
//! # Modules
//!
//! ## Serving
//! - [`router`] - Traffic routing, shadow comparison, promotion and rollback
//! - [`engine`] - Router plus monitoring pipeline
//!
//! ## Monitoring
//! - [`drift`] - Per-feature drift detection
//! - [`anomaly`] - Outlier detection
//! - [`monitoring`] - Alerts and shared statistics
//! - [`events`] - Asynchronous event publishing
//!
//! ## Lifecycle
//! - [`retraining`] - Retraining trigger and job lifecycle
//!
//! ## Services
//! - [`config`] - Engine configuration
//! - [`cli`] - Command-line interface

// Core error handling
pub mod error;
pub mod config;

// Serving
pub mod router;
pub mod engine;

// Monitoring
pub mod drift;
pub mod anomaly;
pub mod monitoring;
pub mod events;

// Lifecycle
pub mod retraining;

// Services
pub mod cli;

pub use error::{DeployError, Result};

/// Re-export commonly used types
pub mod prelude {
    // Error handling
    pub use crate::error::{DeployError, ErrorKind, Result};

    // Configuration
    pub use crate::config::EngineConfig;

    // Routing
    pub use crate::router::{
        DeploymentPhase, DeploymentTarget, ModelInvoker, ModelRouter, ModelVersion,
        RouterConfig, RouterState, RoutingDecision, RoutingStrategy, ShadowAnalysis,
    };

    // Engine
    pub use crate::engine::{BatchObservation, EngineStatus, MonitoringEngine};

    // Drift detection
    pub use crate::drift::{DriftConfig, DriftDetector, DriftEvent, DriftPolicy, DriftReport};

    // Anomaly detection
    pub use crate::anomaly::{OutlierConfig, OutlierDetector, OutlierEvent, OutlierMethod};

    // Alerts
    pub use crate::monitoring::{Alert, AlertHandler, AlertManager, AlertSeverity};

    // Events
    pub use crate::events::{EngineEvent, EventPublisher, EventSink};

    // Retraining
    pub use crate::retraining::{
        JobStatus, LabeledDataset, RetrainingConfig, RetrainingJob, RetrainingTrigger,
        ScoringModel, TrainingRoutine,
    };
}
