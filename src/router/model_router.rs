//! Model router implementation
//!
//! The deployment identity (strategy, phase, primary, candidate) lives in an
//! immutable `Deployment` record behind a `RwLock<Arc<_>>`: readers clone the
//! `Arc`, writers build a fresh record and swap it in one step, so no reader
//! ever observes a half-applied promote or rollback. Request counters are
//! lock-free atomics; shadow aggregates sit behind their own mutex.

use super::shadow::{ShadowAnalysis, ShadowComparisonRecord, ShadowTracker};
use super::{
    DeploymentPhase, DeploymentTarget, ModelInvoker, ModelRole, ModelVersion, RouterConfig,
    RoutingStrategy,
};
use crate::error::{DeployError, Result};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

const TRANSITION_LOG_CAPACITY: usize = 256;

/// Immutable deployment identity, replaced wholesale on every transition
#[derive(Debug, Clone)]
struct Deployment {
    strategy: RoutingStrategy,
    phase: DeploymentPhase,
    primary: ModelVersion,
    candidate: Option<ModelVersion>,
    /// Primary before the last promotion, kept until rollback or a new experiment
    previous_primary: Option<ModelVersion>,
    generation: u64,
}

impl Deployment {
    fn initial(config: &RouterConfig) -> Self {
        let (strategy, phase) = match &config.candidate_version {
            Some(_) => (config.strategy, DeploymentPhase::for_strategy(&config.strategy)),
            None => (RoutingStrategy::BlueGreen, DeploymentPhase::PrimaryOnly),
        };
        Self {
            strategy,
            phase,
            primary: config.primary_version.clone(),
            candidate: config.candidate_version.clone(),
            previous_primary: None,
            generation: 0,
        }
    }

    fn next(&self) -> Self {
        Self {
            generation: self.generation + 1,
            ..self.clone()
        }
    }
}

#[derive(Debug, Default)]
struct AtomicCounters {
    total: AtomicU64,
    primary: AtomicU64,
    candidate: AtomicU64,
    shadow: AtomicU64,
    outcomes: AtomicU64,
    labeled: AtomicU64,
    primary_correct: AtomicU64,
    invocation_errors: AtomicU64,
}

impl AtomicCounters {
    fn reset_routing(&self) {
        self.total.store(0, Ordering::Relaxed);
        self.primary.store(0, Ordering::Relaxed);
        self.candidate.store(0, Ordering::Relaxed);
        self.shadow.store(0, Ordering::Relaxed);
        self.invocation_errors.store(0, Ordering::Relaxed);
    }

    fn reset_feedback(&self) {
        self.outcomes.store(0, Ordering::Relaxed);
        self.labeled.store(0, Ordering::Relaxed);
        self.primary_correct.store(0, Ordering::Relaxed);
    }
}

/// Request and outcome counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterCounters {
    /// Requests routed
    pub total_requests: u64,
    /// Requests whose returned score came from the primary
    pub primary_requests: u64,
    /// Requests whose returned score came from the candidate (canary)
    pub candidate_requests: u64,
    /// Requests additionally marked for shadow scoring
    pub shadow_requests: u64,
    /// Completed shadow comparisons since the last identity change
    pub shadow_comparisons: u64,
    pub failed_shadow_comparisons: u64,
    pub outcomes_recorded: u64,
    /// Outcomes that carried ground truth since the primary last changed
    pub labeled_outcomes: u64,
    /// Labeled outcomes where the returned score matched the label
    pub correct_outcomes: u64,
    pub invocation_errors: u64,
}

/// Point-in-time copy of router state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterState {
    pub strategy: RoutingStrategy,
    pub canary_weight: f64,
    pub phase: DeploymentPhase,
    pub primary_version: ModelVersion,
    pub candidate_version: Option<ModelVersion>,
    pub previous_primary: Option<ModelVersion>,
    /// Incremented on every transition
    pub generation: u64,
    pub counters: RouterCounters,
}

impl RouterState {
    /// Share of routed requests answered by the candidate
    pub fn candidate_fraction(&self) -> f64 {
        if self.counters.total_requests == 0 {
            0.0
        } else {
            self.counters.candidate_requests as f64 / self.counters.total_requests as f64
        }
    }

    /// Accuracy of returned scores against ground truth, if any was recorded
    pub fn live_accuracy(&self) -> Option<f64> {
        if self.counters.labeled_outcomes == 0 {
            None
        } else {
            Some(self.counters.correct_outcomes as f64 / self.counters.labeled_outcomes as f64)
        }
    }
}

/// Where a request goes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub request_id: String,
    pub strategy: RoutingStrategy,
    pub phase: DeploymentPhase,
    /// Version whose score is returned to the caller
    pub served_version: ModelVersion,
    pub served_role: ModelRole,
    /// Version to score in parallel without returning its output
    pub shadow_version: Option<ModelVersion>,
    /// Deployment generation the decision was made against
    pub generation: u64,
}

/// Result of a shadow invocation
#[derive(Debug, Clone)]
pub enum ShadowOutcome {
    Compared(ShadowComparisonRecord),
    Failed { version: ModelVersion, reason: String },
    /// Deployment changed before the shadow score arrived; comparison dropped
    Stale,
}

/// Completion handle for a shadow invocation running off the request path
#[derive(Debug)]
pub struct ShadowHandle {
    rx: oneshot::Receiver<ShadowOutcome>,
}

impl ShadowHandle {
    /// Block until the shadow call finishes. Must not be called from async code.
    pub fn wait(self) -> Option<ShadowOutcome> {
        self.rx.blocking_recv().ok()
    }

    /// Await the shadow call
    pub async fn outcome(self) -> Option<ShadowOutcome> {
        self.rx.await.ok()
    }
}

/// Caller-visible result of [`ModelRouter::serve`]
#[derive(Debug)]
pub struct ServedPrediction {
    pub decision: RoutingDecision,
    /// Score of `decision.served_version`
    pub score: f64,
    pub shadow: Option<ShadowHandle>,
}

/// Phase change record for operators
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub action: String,
    pub from: DeploymentPhase,
    pub to: DeploymentPhase,
    pub primary_version: ModelVersion,
    pub candidate_version: Option<ModelVersion>,
    pub generation: u64,
    pub timestamp: DateTime<Utc>,
}

/// Routes requests between a primary and a candidate model version
pub struct ModelRouter {
    config: RouterConfig,
    deployment: RwLock<Arc<Deployment>>,
    counters: AtomicCounters,
    shadow: Mutex<ShadowTracker>,
    rng: Mutex<Xoshiro256PlusPlus>,
    transitions: Mutex<VecDeque<TransitionRecord>>,
}

impl std::fmt::Debug for ModelRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let deployment = self.current();
        f.debug_struct("ModelRouter")
            .field("strategy", &deployment.strategy)
            .field("phase", &deployment.phase)
            .field("primary", &deployment.primary)
            .field("candidate", &deployment.candidate)
            .finish()
    }
}

fn validate_features(features: &[f64]) -> Result<()> {
    if features.is_empty() {
        return Err(DeployError::ValidationError("empty feature vector".to_string()));
    }
    if features.iter().any(|v| !v.is_finite()) {
        return Err(DeployError::ValidationError(
            "feature vector contains non-finite values".to_string(),
        ));
    }
    Ok(())
}

fn validate_score(name: &str, score: f64) -> Result<()> {
    if !score.is_finite() || !(0.0..=1.0).contains(&score) {
        return Err(DeployError::ValidationError(format!(
            "{} score {} outside [0, 1]",
            name, score
        )));
    }
    Ok(())
}

/// Invoke a model and check that it returned a probability
fn invoke_checked(
    invoker: &dyn ModelInvoker,
    version: &ModelVersion,
    features: &[f64],
) -> Result<f64> {
    let score = invoker.invoke(version, features)?;
    if !score.is_finite() || !(0.0..=1.0).contains(&score) {
        return Err(DeployError::model_unavailable(
            version.as_str(),
            format!("returned score {} outside [0, 1]", score),
        ));
    }
    Ok(score)
}

impl ModelRouter {
    /// Create a router from configuration
    pub fn new(config: RouterConfig) -> Result<Self> {
        config.validate()?;

        let rng = match config.seed {
            Some(seed) => Xoshiro256PlusPlus::seed_from_u64(seed),
            None => Xoshiro256PlusPlus::from_entropy(),
        };
        let deployment = Deployment::initial(&config);

        info!(
            primary = %deployment.primary,
            candidate = ?deployment.candidate.as_ref().map(|c| c.as_str()),
            strategy = %deployment.strategy,
            phase = %deployment.phase,
            "Model router initialized"
        );

        Ok(Self {
            shadow: Mutex::new(ShadowTracker::new(
                config.shadow_history_capacity,
                config.decision_threshold,
            )),
            deployment: RwLock::new(Arc::new(deployment)),
            counters: AtomicCounters::default(),
            rng: Mutex::new(rng),
            transitions: Mutex::new(VecDeque::with_capacity(TRANSITION_LOG_CAPACITY)),
            config,
        })
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    fn current(&self) -> Arc<Deployment> {
        Arc::clone(&*self.deployment.read())
    }

    /// Decide which version(s) handle a request, with a generated request id
    pub fn route(&self, features: &[f64]) -> Result<RoutingDecision> {
        self.route_with_id(features, Uuid::new_v4().to_string())
    }

    /// Decide which version(s) handle a request
    pub fn route_with_id(
        &self,
        features: &[f64],
        request_id: impl Into<String>,
    ) -> Result<RoutingDecision> {
        validate_features(features)?;
        let deployment = self.current();

        let (served_role, shadow_version) = match deployment.strategy {
            RoutingStrategy::Shadow => (ModelRole::Primary, deployment.candidate.clone()),
            RoutingStrategy::Canary { weight } => {
                if !(0.0..=1.0).contains(&weight) {
                    return Err(DeployError::InvalidStrategy(format!(
                        "canary weight {} outside [0, 1]",
                        weight
                    )));
                }
                let draw: f64 = self.rng.lock().gen();
                if draw < weight && deployment.candidate.is_some() {
                    (ModelRole::Candidate, None)
                } else {
                    (ModelRole::Primary, None)
                }
            }
            RoutingStrategy::BlueGreen => (ModelRole::Primary, None),
        };

        let served_version = match (served_role, &deployment.candidate) {
            (ModelRole::Candidate, Some(candidate)) => candidate.clone(),
            _ => deployment.primary.clone(),
        };

        self.counters.total.fetch_add(1, Ordering::Relaxed);
        match served_role {
            ModelRole::Primary => self.counters.primary.fetch_add(1, Ordering::Relaxed),
            ModelRole::Candidate => self.counters.candidate.fetch_add(1, Ordering::Relaxed),
        };
        if shadow_version.is_some() {
            self.counters.shadow.fetch_add(1, Ordering::Relaxed);
        }

        let decision = RoutingDecision {
            request_id: request_id.into(),
            strategy: deployment.strategy,
            phase: deployment.phase,
            served_version,
            served_role,
            shadow_version,
            generation: deployment.generation,
        };

        debug!(
            request_id = %decision.request_id,
            served = %decision.served_version,
            strategy = %decision.strategy,
            "Routed request"
        );

        Ok(decision)
    }

    /// Route and invoke. The returned score always comes from
    /// `decision.served_version`; a shadow candidate is scored on the rayon
    /// pool and its failure never affects the returned result.
    pub fn serve(
        self: &Arc<Self>,
        features: &[f64],
        invoker: Arc<dyn ModelInvoker>,
    ) -> Result<ServedPrediction> {
        let decision = self.route(features)?;

        let score = match invoke_checked(invoker.as_ref(), &decision.served_version, features) {
            Ok(score) => score,
            Err(e) => {
                self.counters.invocation_errors.fetch_add(1, Ordering::Relaxed);
                warn!(
                    request_id = %decision.request_id,
                    version = %decision.served_version,
                    error = %e,
                    "Serving model invocation failed"
                );
                return Err(e);
            }
        };

        let shadow = decision.shadow_version.clone().map(|candidate| {
            let (tx, rx) = oneshot::channel();
            let router = Arc::clone(self);
            let invoker = Arc::clone(&invoker);
            let features = features.to_vec();
            let request_id = decision.request_id.clone();
            let primary = decision.served_version.clone();
            let generation = decision.generation;

            rayon::spawn(move || {
                let outcome = match invoke_checked(invoker.as_ref(), &candidate, &features) {
                    Ok(candidate_score) => router.record_comparison(
                        &request_id,
                        generation,
                        &primary,
                        &candidate,
                        score,
                        candidate_score,
                    ),
                    Err(e) => {
                        router.record_shadow_failure(&request_id, &e);
                        ShadowOutcome::Failed {
                            version: candidate,
                            reason: e.to_string(),
                        }
                    }
                };
                // Caller may have dropped the handle
                let _ = tx.send(outcome);
            });

            ShadowHandle { rx }
        });

        Ok(ServedPrediction {
            decision,
            score,
            shadow,
        })
    }

    fn record_comparison(
        &self,
        request_id: &str,
        generation: u64,
        primary: &ModelVersion,
        candidate: &ModelVersion,
        primary_score: f64,
        candidate_score: f64,
    ) -> ShadowOutcome {
        // Read lock held so a concurrent transition cannot reset the tracker in between
        let deployment = self.deployment.read();
        if deployment.generation != generation {
            debug!(request_id = %request_id, "Dropping stale shadow comparison");
            return ShadowOutcome::Stale;
        }
        let record = self.shadow.lock().record(
            request_id,
            primary,
            candidate,
            primary_score,
            candidate_score,
            None,
        );
        drop(deployment);

        if self.config.log_shadow_comparisons {
            debug!(
                request_id = %request_id,
                abs_difference = record.abs_difference,
                agreed = record.agreed,
                "Shadow comparison"
            );
        }
        ShadowOutcome::Compared(record)
    }

    /// Record the outcome of a served request. When a candidate score is
    /// supplied it is compared against the primary score; ground truth, when
    /// present, feeds accuracy and the closer-to-truth counts. A label for a
    /// request whose shadow comparison was already recorded on the serve path
    /// is attached to that comparison rather than recorded again.
    pub fn record_outcome(
        &self,
        request_id: &str,
        primary_score: f64,
        candidate_score: Option<f64>,
        ground_truth: Option<bool>,
    ) -> Result<Option<ShadowComparisonRecord>> {
        validate_score("primary", primary_score)?;
        if let Some(score) = candidate_score {
            validate_score("candidate", score)?;
        }

        let deployment = self.deployment.read();
        let mut shadow = self.shadow.lock();
        let record = if shadow.has_comparison(request_id) {
            ground_truth.and_then(|label| shadow.label(request_id, label))
        } else if let Some(candidate_score) = candidate_score {
            let candidate = deployment.candidate.as_ref().ok_or(DeployError::NoCandidate)?;
            Some(shadow.record(
                request_id,
                &deployment.primary,
                candidate,
                primary_score,
                candidate_score,
                ground_truth,
            ))
        } else {
            match ground_truth {
                // The shadow score may still be in flight
                Some(label) if matches!(deployment.strategy, RoutingStrategy::Shadow) => {
                    shadow.label(request_id, label)
                }
                _ => None,
            }
        };
        drop(shadow);

        self.counters.outcomes.fetch_add(1, Ordering::Relaxed);
        if let Some(label) = ground_truth {
            self.counters.labeled.fetch_add(1, Ordering::Relaxed);
            if (primary_score >= self.config.decision_threshold) == label {
                self.counters.primary_correct.fetch_add(1, Ordering::Relaxed);
            }
        }
        drop(deployment);

        Ok(record)
    }

    /// Count a shadow invocation that failed
    pub fn record_shadow_failure(&self, request_id: &str, error: &DeployError) {
        self.shadow.lock().record_failure();
        warn!(
            request_id = %request_id,
            error = %error,
            "Shadow invocation failed; primary result unaffected"
        );
    }

    /// Snapshot of strategy, identities and counters
    pub fn metrics(&self) -> RouterState {
        let deployment = self.current();
        let (comparisons, failures) = {
            let shadow = self.shadow.lock();
            (shadow.total(), shadow.failures())
        };

        RouterState {
            strategy: deployment.strategy,
            canary_weight: deployment.strategy.canary_weight(),
            phase: deployment.phase,
            primary_version: deployment.primary.clone(),
            candidate_version: deployment.candidate.clone(),
            previous_primary: deployment.previous_primary.clone(),
            generation: deployment.generation,
            counters: RouterCounters {
                total_requests: self.counters.total.load(Ordering::Relaxed),
                primary_requests: self.counters.primary.load(Ordering::Relaxed),
                candidate_requests: self.counters.candidate.load(Ordering::Relaxed),
                shadow_requests: self.counters.shadow.load(Ordering::Relaxed),
                shadow_comparisons: comparisons,
                failed_shadow_comparisons: failures,
                outcomes_recorded: self.counters.outcomes.load(Ordering::Relaxed),
                labeled_outcomes: self.counters.labeled.load(Ordering::Relaxed),
                correct_outcomes: self.counters.primary_correct.load(Ordering::Relaxed),
                invocation_errors: self.counters.invocation_errors.load(Ordering::Relaxed),
            },
        }
    }

    /// Aggregate shadow statistics since the last identity change
    pub fn shadow_analysis(&self) -> ShadowAnalysis {
        self.shadow.lock().analysis()
    }

    /// Most recent shadow comparisons, newest last
    pub fn recent_comparisons(&self, limit: usize) -> Vec<ShadowComparisonRecord> {
        self.shadow.lock().recent(limit)
    }

    /// Phase transitions, oldest first
    pub fn transitions(&self) -> Vec<TransitionRecord> {
        self.transitions.lock().iter().cloned().collect()
    }

    /// Zero the routing counters
    pub fn reset_counters(&self) {
        self.counters.reset_routing();
    }

    /// Stage `candidate` and score it in shadow
    pub fn start_shadow(&self, candidate: impl Into<ModelVersion>) -> Result<RouterState> {
        let candidate = candidate.into();
        self.transition("start_shadow", |current| {
            let mut next = current.next();
            if current.candidate.as_ref() != Some(&candidate) {
                next.previous_primary = None;
            }
            next.candidate = Some(candidate);
            next.strategy = RoutingStrategy::Shadow;
            next.phase = DeploymentPhase::ShadowActive;
            Ok(next)
        })
    }

    /// Send a `weight` share of live traffic to the staged candidate
    pub fn start_canary(&self, weight: f64) -> Result<RouterState> {
        let strategy = RoutingStrategy::canary(weight)?;
        self.transition("start_canary", |current| {
            if current.candidate.is_none() {
                return Err(DeployError::NoCandidate);
            }
            let mut next = current.next();
            next.strategy = strategy;
            next.phase = DeploymentPhase::CanaryActive;
            next.previous_primary = None;
            Ok(next)
        })
    }

    /// Apply a strategy to the current deployment
    pub fn set_strategy(&self, strategy: RoutingStrategy) -> Result<RouterState> {
        strategy.validate()?;
        self.transition("set_strategy", |current| {
            if current.candidate.is_none() && strategy != RoutingStrategy::BlueGreen {
                return Err(DeployError::NoCandidate);
            }
            let mut next = current.next();
            next.strategy = strategy;
            next.phase = match (strategy, current.phase) {
                (RoutingStrategy::BlueGreen, DeploymentPhase::Promoted) => DeploymentPhase::Promoted,
                (s, _) => DeploymentPhase::for_strategy(&s),
            };
            Ok(next)
        })
    }

    /// Swap primary and candidate atomically and switch to blue-green.
    /// The replaced primary is retained for [`rollback`](Self::rollback).
    pub fn promote(&self) -> Result<RouterState> {
        self.transition("promote", |current| {
            let candidate = current.candidate.clone().ok_or(DeployError::NoCandidate)?;
            let mut next = current.next();
            next.previous_primary = Some(current.primary.clone());
            next.candidate = Some(current.primary.clone());
            next.primary = candidate;
            next.strategy = RoutingStrategy::BlueGreen;
            next.phase = DeploymentPhase::Promoted;
            Ok(next)
        })
    }

    /// Stage `version` and promote it in a single transition. Promoting the
    /// current primary is a no-op.
    pub fn promote_version(&self, version: impl Into<ModelVersion>) -> Result<RouterState> {
        let version = version.into();
        if self.current().primary == version {
            return Ok(self.metrics());
        }
        self.transition("promote_version", |current| {
            if current.primary == version {
                return Ok(current.next());
            }
            let mut next = current.next();
            next.previous_primary = Some(current.primary.clone());
            next.candidate = Some(current.primary.clone());
            next.primary = version;
            next.strategy = RoutingStrategy::BlueGreen;
            next.phase = DeploymentPhase::Promoted;
            Ok(next)
        })
    }

    /// Return to primary-only service. After a promotion this restores the
    /// pre-promotion primary and keeps the demoted version as candidate;
    /// during shadow or canary it stops candidate traffic.
    pub fn rollback(&self) -> Result<RouterState> {
        self.transition("rollback", |current| {
            let mut next = current.next();
            match (current.phase, &current.previous_primary) {
                (DeploymentPhase::Promoted, Some(previous)) => {
                    next.candidate = Some(current.primary.clone());
                    next.primary = previous.clone();
                }
                (DeploymentPhase::ShadowActive | DeploymentPhase::CanaryActive, _) => {}
                (phase, _) => {
                    return Err(DeployError::InvalidTransition {
                        phase: phase.to_string(),
                        action: "rollback".to_string(),
                    })
                }
            }
            next.previous_primary = None;
            next.strategy = RoutingStrategy::BlueGreen;
            next.phase = DeploymentPhase::PrimaryOnly;
            Ok(next)
        })
    }

    /// Build the next deployment from the current one and swap it in under
    /// the write lock. Shadow aggregates and the shadow request count reset
    /// when either identity changes; feedback counters reset when the
    /// primary changes.
    fn transition<F>(&self, action: &str, build: F) -> Result<RouterState>
    where
        F: FnOnce(&Deployment) -> Result<Deployment>,
    {
        let mut guard = self.deployment.write();
        let current = Arc::clone(&*guard);
        let next = build(&current)?;

        if next.candidate.as_ref() == Some(&next.primary) {
            return Err(DeployError::ValidationError(format!(
                "{} would make {} both primary and candidate",
                action, next.primary
            )));
        }

        let primary_changed = next.primary != current.primary;
        let identity_changed = primary_changed || next.candidate != current.candidate;
        let record = TransitionRecord {
            action: action.to_string(),
            from: current.phase,
            to: next.phase,
            primary_version: next.primary.clone(),
            candidate_version: next.candidate.clone(),
            generation: next.generation,
            timestamp: Utc::now(),
        };

        *guard = Arc::new(next);
        if identity_changed {
            self.shadow.lock().reset();
            self.counters.shadow.store(0, Ordering::Relaxed);
        }
        if primary_changed {
            self.counters.reset_feedback();
        }
        drop(guard);

        info!(
            action = %record.action,
            from = %record.from,
            to = %record.to,
            primary = %record.primary_version,
            candidate = ?record.candidate_version.as_ref().map(|c| c.as_str()),
            generation = record.generation,
            "Deployment transition"
        );

        let mut log = self.transitions.lock();
        if log.len() == TRANSITION_LOG_CAPACITY {
            log.pop_front();
        }
        log.push_back(record);
        drop(log);

        Ok(self.metrics())
    }
}

impl DeploymentTarget for ModelRouter {
    fn deploy(&self, version: &ModelVersion) -> Result<()> {
        self.promote_version(version.clone()).map(|_| ())
    }
}
