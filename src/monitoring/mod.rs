//! Monitoring Module
//!
//! Rolling statistics shared by the detectors and the router, plus alerting.

mod stats;
pub mod alerts;

pub use stats::{RunningCovariance, RunningStats, StatWindow, StatsSummary};
pub use alerts::{
    Alert, AlertAction, AlertConfig, AlertCounts, AlertHandler, AlertManager, AlertSeverity,
    DispatchReport, EventAlertHandler, LogAlertHandler,
};
