//! Kolosal Deploy CLI Module
//!
//! Synthetic traffic simulation against the monitoring engine and config
//! inspection.

use clap::{Parser, Subcommand};
use colored::*;
use ndarray::{Array1, Array2, ArrayView1, Axis};
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use rand_xoshiro::Xoshiro256PlusPlus;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use crate::config::EngineConfig;
use crate::engine::{EngineStatus, MonitoringEngine};
use crate::error::{DeployError, Result};
use crate::retraining::{CancelFlag, LabeledDataset, ScoringModel, TrainingRoutine};
use crate::router::{ModelInvoker, ModelVersion, RoutingStrategy};

// ─── Styling helpers ───────────────────────────────────────────────────────────

fn dim(s: &str) -> ColoredString   { s.truecolor(100, 100, 100) }
fn accent(s: &str) -> ColoredString { s.truecolor(120, 170, 255) }
fn muted(s: &str) -> ColoredString  { s.truecolor(140, 140, 140) }
fn ok(s: &str) -> ColoredString     { s.truecolor(100, 210, 120) }
fn warn(s: &str) -> ColoredString   { s.truecolor(230, 180, 80) }

fn kv(key: &str, val: &str) {
    println!("  {:<22} {}", muted(key), val.white());
}

fn step_run(msg: &str) {
    print!("  {} {}... ", accent("›"), msg);
}

fn step_done(detail: &str) {
    println!("{} {}", ok("done"), dim(detail));
}

fn section(title: &str) {
    println!();
    println!("  {}", title.white().bold());
    println!("  {}", dim(&"─".repeat(56)));
}

// ─── CLI definition ────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "kolosal-deploy")]
#[command(author = "KolosalAI")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Model routing, drift monitoring and retraining for Kolosal deployments")]
#[command(long_about = None)]
pub struct Cli {
    /// JSON engine config; KOLOSAL_* environment variables override it
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Drive synthetic traffic through the engine and report its state
    Simulate {
        /// Requests to serve
        #[arg(short, long, default_value = "5000")]
        requests: usize,

        /// Features per request
        #[arg(short, long, default_value = "4")]
        features: usize,

        /// Reference rows used to fit the detectors
        #[arg(long, default_value = "2000")]
        reference: usize,

        /// Mean shift applied to every feature once drift starts
        #[arg(long, default_value = "0.0")]
        shift: f64,

        /// Request index at which drift starts (default: halfway)
        #[arg(long)]
        shift_after: Option<usize>,

        /// Also invert the label relationship once drift starts
        #[arg(long)]
        concept_drift: bool,

        /// Routing strategy (shadow, canary, canary:<weight>, blue_green)
        #[arg(short, long)]
        strategy: Option<String>,

        /// Candidate version (default: v2 when none is configured)
        #[arg(long)]
        candidate: Option<String>,

        /// Run a retraining job at the end if the engine warrants one
        #[arg(long)]
        retrain: bool,

        /// Override the labeled-feedback gate for retraining
        #[arg(long)]
        min_samples: Option<u64>,

        /// Traffic seed
        #[arg(long, default_value = "42")]
        seed: u64,

        /// Print the final status as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the effective configuration as JSON
    Config,
}

// ─── Config loading ────────────────────────────────────────────────────────────

/// Defaults or the JSON file at `path`, overlaid with the environment
pub fn load_config(path: Option<&Path>) -> anyhow::Result<EngineConfig> {
    let base = match path {
        Some(path) => {
            let text = std::fs::read_to_string(path)?;
            EngineConfig::from_json_str(&text)?
        }
        None => EngineConfig::default(),
    };
    Ok(base.overlay(|key| std::env::var(key).ok())?)
}

// ─── Synthetic models ──────────────────────────────────────────────────────────

fn sigmoid(z: f64) -> f64 {
    1.0 / (1.0 + (-z).exp())
}

/// Logistic scorers standing in for deployed models. The primary uses the
/// true weights; any other version is a slightly miscalibrated copy.
struct SyntheticModels {
    primary: ModelVersion,
    weights: Vec<f64>,
}

impl SyntheticModels {
    fn logit(&self, features: &[f64]) -> f64 {
        self.weights.iter().zip(features).map(|(w, x)| w * x).sum()
    }
}

impl ModelInvoker for SyntheticModels {
    fn invoke(&self, version: &ModelVersion, features: &[f64]) -> Result<f64> {
        if features.len() != self.weights.len() {
            return Err(DeployError::ModelUnavailable {
                version: version.to_string(),
                reason: format!(
                    "expected {} features, got {}",
                    self.weights.len(),
                    features.len()
                ),
            });
        }
        let z = self.logit(features);
        if *version == self.primary {
            Ok(sigmoid(z))
        } else {
            Ok(sigmoid(0.8 * z + 0.2))
        }
    }
}

/// Nearest-centroid retraining routine
struct CentroidRoutine;

struct CentroidModel {
    midpoint: Array1<f64>,
    direction: Array1<f64>,
}

impl ScoringModel for CentroidModel {
    fn score(&self, features: ArrayView1<'_, f64>) -> Result<f64> {
        if features.len() != self.direction.len() {
            return Err(DeployError::ShapeError {
                expected: format!("{} features", self.direction.len()),
                actual: format!("{} features", features.len()),
            });
        }
        Ok(sigmoid((&features - &self.midpoint).dot(&self.direction)))
    }
}

impl TrainingRoutine for CentroidRoutine {
    fn train(
        &self,
        train: &LabeledDataset,
        _target: &ModelVersion,
        cancel: &CancelFlag,
    ) -> Result<Box<dyn ScoringModel>> {
        let positive: Vec<usize> = (0..train.len()).filter(|&i| train.labels[i]).collect();
        let negative: Vec<usize> = (0..train.len()).filter(|&i| !train.labels[i]).collect();
        if positive.is_empty() || negative.is_empty() {
            return Err(DeployError::InsufficientData {
                required: 1,
                actual: positive.len().min(negative.len()),
            });
        }
        if cancel.is_cancelled() {
            return Err(DeployError::ValidationError("training cancelled".to_string()));
        }

        let centroid = |rows: &[usize]| -> Result<Array1<f64>> {
            train
                .features
                .select(Axis(0), rows)
                .mean_axis(Axis(0))
                .ok_or(DeployError::InsufficientData { required: 1, actual: 0 })
        };
        let pos = centroid(&positive)?;
        let neg = centroid(&negative)?;

        Ok(Box::new(CentroidModel {
            midpoint: (&pos + &neg) / 2.0,
            direction: &pos - &neg,
        }))
    }
}

// ─── Commands ──────────────────────────────────────────────────────────────────

/// Options for [`cmd_simulate`]
pub struct SimulateOptions {
    pub requests: usize,
    pub features: usize,
    pub reference: usize,
    pub shift: f64,
    pub shift_after: Option<usize>,
    pub concept_drift: bool,
    pub strategy: Option<String>,
    pub candidate: Option<String>,
    pub retrain: bool,
    pub min_samples: Option<u64>,
    pub seed: u64,
    pub json: bool,
}

pub async fn cmd_simulate(mut config: EngineConfig, opts: SimulateOptions) -> anyhow::Result<()> {
    if opts.features == 0 {
        anyhow::bail!("--features must be positive");
    }
    if let Some(candidate) = &opts.candidate {
        config.router.candidate_version = Some(ModelVersion::new(candidate.as_str()));
    } else if config.router.candidate_version.is_none() {
        config.router.candidate_version = Some(ModelVersion::new("v2"));
    }
    if let Some(strategy) = &opts.strategy {
        config.router.strategy = RoutingStrategy::from_str(strategy)?;
    }
    if let Some(n) = opts.min_samples {
        config.retraining.min_samples = n;
    }
    config.router.seed.get_or_insert(opts.seed);
    config.outlier.seed.get_or_insert(opts.seed);
    config.retraining.seed.get_or_insert(opts.seed);

    let shift_after = opts.shift_after.unwrap_or(opts.requests / 2);
    let primary = config.router.primary_version.clone();
    let engine = MonitoringEngine::new(config)?;

    let mut rng = Xoshiro256PlusPlus::seed_from_u64(opts.seed);
    let normal = Normal::new(0.0, 1.0)?;
    let weights: Vec<f64> = (0..opts.features).map(|i| 1.0 / (i + 1) as f64).collect();

    if !opts.json {
        section("Simulate");
    }

    let start = Instant::now();
    if !opts.json {
        step_run("Fitting reference");
    }
    let reference = Array2::from_shape_fn((opts.reference, opts.features), |_| {
        normal.sample(&mut rng)
    });
    engine.fit_reference(&reference)?;
    if !opts.json {
        step_done(&format!("{} rows × {} features in {:?}", opts.reference, opts.features, start.elapsed()));
    }

    let models = SyntheticModels {
        primary,
        weights: weights.clone(),
    };
    let invoker: Arc<dyn ModelInvoker> = Arc::new(models);

    let mut rows: Vec<f64> = Vec::with_capacity(opts.requests * opts.features);
    let mut labels: Vec<bool> = Vec::with_capacity(opts.requests);

    let start = Instant::now();
    if !opts.json {
        step_run(&format!("Serving {} requests", opts.requests));
    }
    for i in 0..opts.requests {
        let drifting = i >= shift_after;
        let offset = if drifting { opts.shift } else { 0.0 };
        let row: Vec<f64> = (0..opts.features)
            .map(|_| normal.sample(&mut rng) + offset)
            .collect();

        let served = engine.serve(&row, Arc::clone(&invoker))?;
        if let Some(shadow) = served.shadow {
            shadow.outcome().await;
        }

        let logit: f64 = weights.iter().zip(&row).map(|(w, x)| w * x).sum();
        let truth = if drifting && opts.concept_drift { -logit } else { logit };
        let label = rng.gen::<f64>() < sigmoid(truth);
        engine.record_feedback(&served.decision.request_id, served.score, None, Some(label))?;

        rows.extend_from_slice(&row);
        labels.push(label);
    }
    if !opts.json {
        step_done(&format!("{:?}", start.elapsed()));
    }

    let mut retrain_note = None;
    if opts.retrain {
        let dataset = LabeledDataset::new(
            Array2::from_shape_vec((labels.len(), opts.features), rows)?,
            labels,
        )?;
        match engine.maybe_retrain(dataset, "retrained", Arc::new(CentroidRoutine))? {
            Some((job_id, handle)) => {
                let job = handle.await??;
                retrain_note = Some(format!("job {} {}", job_id, job.status));
            }
            None => retrain_note = Some("not warranted".to_string()),
        }
    }

    let status = engine.status();
    if opts.json {
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        print_status(&status, retrain_note.as_deref());
    }
    Ok(())
}

fn print_status(status: &EngineStatus, retrain_note: Option<&str>) {
    section("Router");
    kv("Strategy", &status.router.strategy.to_string());
    kv("Phase", &status.router.phase.to_string());
    kv("Primary", status.router.primary_version.as_str());
    kv(
        "Candidate",
        status
            .router
            .candidate_version
            .as_ref()
            .map_or("-", |v| v.as_str()),
    );
    kv("Requests", &status.router.counters.total_requests.to_string());
    kv(
        "Candidate share",
        &format!("{:.1}%", status.router.candidate_fraction() * 100.0),
    );
    if let Some(accuracy) = status.router.live_accuracy() {
        kv("Live accuracy", &format!("{:.4}", accuracy));
    }
    if status.shadow.total_comparisons > 0 {
        kv(
            "Shadow agreement",
            &format!("{:.1}%", status.shadow.agreement_rate * 100.0),
        );
    }

    section("Monitoring");
    kv("Drift checks", &status.drift.total_checks.to_string());
    kv(
        "Drift rate",
        &format!("{:.1}%", status.drift.drift_rate * 100.0),
    );
    kv("Outliers scored", &status.outliers.total_scored.to_string());
    kv(
        "Outliers flagged",
        &status.outliers.total_flagged.to_string(),
    );
    let alerts = format!(
        "{} high, {} medium, {} low",
        status.alerts.high, status.alerts.medium, status.alerts.low
    );
    if status.alerts.high > 0 {
        println!("  {:<22} {}", muted("Alerts"), warn(&alerts));
    } else {
        kv("Alerts", &alerts);
    }

    if let Some(note) = retrain_note {
        section("Retraining");
        kv("Result", note);
        if let Some(job) = &status.last_retraining {
            if let Some(metrics) = &job.metrics {
                kv("Validation F1", &format!("{:.4}", metrics.f1_score));
                kv("Validation accuracy", &format!("{:.4}", metrics.accuracy));
            }
            if let Some(failure) = &job.failure {
                kv("Failure", &failure.to_string());
            }
        }
    }
    println!();
}

pub fn cmd_config(config: &EngineConfig) -> anyhow::Result<()> {
    println!("{}", config.to_json_pretty()?);
    Ok(())
}
