//! Shadow comparison tracking
//!
//! Aggregates are maintained incrementally so they cover every comparison
//! since the last reset, while only a bounded tail of raw records is kept.

use super::ModelVersion;
use crate::monitoring::{RunningCovariance, RunningStats};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

/// One dual invocation: primary and candidate scored the same request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShadowComparisonRecord {
    pub request_id: String,
    pub primary_version: ModelVersion,
    pub candidate_version: ModelVersion,
    pub primary_score: f64,
    pub candidate_score: f64,
    /// Both scores fall on the same side of the decision threshold
    pub agreed: bool,
    pub abs_difference: f64,
    pub ground_truth: Option<bool>,
    pub timestamp: DateTime<Utc>,
}

/// Aggregate view over recorded comparisons
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShadowAnalysis {
    pub total_comparisons: u64,
    pub agreement_count: u64,
    pub disagreement_count: u64,
    pub agreement_rate: f64,
    pub mean_abs_difference: f64,
    pub max_abs_difference: f64,
    /// Pearson correlation between primary and candidate scores
    pub correlation: Option<f64>,
    /// Comparisons that carried ground truth
    pub labeled_comparisons: u64,
    /// Labeled comparisons where the primary score was closer to the label
    pub primary_closer: u64,
    /// Labeled comparisons where the candidate score was closer to the label
    pub candidate_closer: u64,
    pub ties: u64,
    /// Shadow invocations that errored; not part of `total_comparisons`
    pub failed_comparisons: u64,
    pub records_retained: usize,
}

/// Insertion-ordered map holding at most `capacity` entries; the oldest
/// entry is evicted first
#[derive(Debug, Clone)]
struct BoundedMap<V> {
    capacity: usize,
    entries: HashMap<String, V>,
    order: VecDeque<String>,
}

impl<V> BoundedMap<V> {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn insert(&mut self, key: &str, value: V) {
        if self.entries.insert(key.to_string(), value).is_none() {
            self.order.push_back(key.to_string());
        }
        while self.entries.len() > self.capacity {
            match self.order.pop_front() {
                Some(oldest) => {
                    self.entries.remove(&oldest);
                }
                None => break,
            }
        }
        // Keys removed through `take` leave stale order entries behind
        if self.order.len() > 2 * self.capacity {
            let entries = &self.entries;
            self.order.retain(|k| entries.contains_key(k));
        }
    }

    fn take(&mut self, key: &str) -> Option<V> {
        self.entries.remove(key)
    }

    fn get_mut(&mut self, key: &str) -> Option<&mut V> {
        self.entries.get_mut(key)
    }

    fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Bounded shadow comparison history plus running aggregates.
///
/// Recent comparisons stay indexed by request id, so a label arriving later
/// through feedback is attached to the existing comparison instead of
/// creating a second one. Labels that arrive
/// before the shadow score are held until the comparison is recorded.
#[derive(Debug, Clone)]
pub struct ShadowTracker {
    capacity: usize,
    decision_threshold: f64,
    history: VecDeque<ShadowComparisonRecord>,
    by_request: BoundedMap<ShadowComparisonRecord>,
    early_labels: BoundedMap<bool>,
    agreements: u64,
    differences: RunningStats,
    max_difference: f64,
    scores: RunningCovariance,
    primary_closer: u64,
    candidate_closer: u64,
    ties: u64,
    failures: u64,
}

impl ShadowTracker {
    pub fn new(capacity: usize, decision_threshold: f64) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            decision_threshold,
            history: VecDeque::with_capacity(capacity.min(4096)),
            by_request: BoundedMap::new(capacity),
            early_labels: BoundedMap::new(capacity),
            agreements: 0,
            differences: RunningStats::new(),
            max_difference: 0.0,
            scores: RunningCovariance::new(),
            primary_closer: 0,
            candidate_closer: 0,
            ties: 0,
            failures: 0,
        }
    }

    /// Append a comparison, evicting the oldest record when full
    pub fn record(
        &mut self,
        request_id: &str,
        primary_version: &ModelVersion,
        candidate_version: &ModelVersion,
        primary_score: f64,
        candidate_score: f64,
        ground_truth: Option<bool>,
    ) -> ShadowComparisonRecord {
        let agreed = (primary_score >= self.decision_threshold)
            == (candidate_score >= self.decision_threshold);
        let abs_difference = (primary_score - candidate_score).abs();
        let ground_truth = ground_truth.or_else(|| self.early_labels.take(request_id));

        if agreed {
            self.agreements += 1;
        }
        self.differences.push(abs_difference);
        self.max_difference = self.max_difference.max(abs_difference);
        self.scores.push(primary_score, candidate_score);

        if let Some(label) = ground_truth {
            self.count_closer(primary_score, candidate_score, label);
        }

        let record = ShadowComparisonRecord {
            request_id: request_id.to_string(),
            primary_version: primary_version.clone(),
            candidate_version: candidate_version.clone(),
            primary_score,
            candidate_score,
            agreed,
            abs_difference,
            ground_truth,
            timestamp: Utc::now(),
        };

        if self.history.len() == self.capacity {
            self.history.pop_front();
        }
        self.history.push_back(record.clone());
        self.by_request.insert(request_id, record.clone());
        record
    }

    fn count_closer(&mut self, primary_score: f64, candidate_score: f64, label: bool) {
        let target = if label { 1.0 } else { 0.0 };
        let primary_err = (primary_score - target).abs();
        let candidate_err = (candidate_score - target).abs();
        if primary_err < candidate_err {
            self.primary_closer += 1;
        } else if candidate_err < primary_err {
            self.candidate_closer += 1;
        } else {
            self.ties += 1;
        }
    }

    /// Whether a comparison for `request_id` is still indexed
    pub fn has_comparison(&self, request_id: &str) -> bool {
        self.by_request.contains(request_id)
    }

    /// Attach ground truth to the comparison recorded for `request_id`.
    /// Returns the labeled record, or `None` if it already carries a label
    /// or none was recorded; in the latter case the label is held for a
    /// comparison still in flight.
    pub fn label(&mut self, request_id: &str, label: bool) -> Option<ShadowComparisonRecord> {
        let Some(indexed) = self.by_request.get_mut(request_id) else {
            self.early_labels.insert(request_id, label);
            return None;
        };
        if indexed.ground_truth.is_some() {
            return None;
        }
        indexed.ground_truth = Some(label);
        let record = indexed.clone();
        self.count_closer(record.primary_score, record.candidate_score, label);

        if let Some(retained) = self
            .history
            .iter_mut()
            .rev()
            .find(|r| r.request_id == request_id)
        {
            retained.ground_truth = Some(label);
        }
        Some(record)
    }

    /// Comparisons currently indexed by request id
    pub fn indexed_len(&self) -> usize {
        self.by_request.len()
    }

    /// Count a shadow invocation that produced no score
    pub fn record_failure(&mut self) {
        self.failures += 1;
    }

    pub fn total(&self) -> u64 {
        self.differences.count()
    }

    pub fn failures(&self) -> u64 {
        self.failures
    }

    /// Most recent records, newest last
    pub fn recent(&self, limit: usize) -> Vec<ShadowComparisonRecord> {
        let skip = self.history.len().saturating_sub(limit);
        self.history.iter().skip(skip).cloned().collect()
    }

    pub fn analysis(&self) -> ShadowAnalysis {
        let total = self.total();
        let labeled = self.primary_closer + self.candidate_closer + self.ties;

        ShadowAnalysis {
            total_comparisons: total,
            agreement_count: self.agreements,
            disagreement_count: total - self.agreements,
            agreement_rate: if total > 0 {
                self.agreements as f64 / total as f64
            } else {
                0.0
            },
            mean_abs_difference: self.differences.mean(),
            max_abs_difference: self.max_difference,
            correlation: self.scores.correlation(),
            labeled_comparisons: labeled,
            primary_closer: self.primary_closer,
            candidate_closer: self.candidate_closer,
            ties: self.ties,
            failed_comparisons: self.failures,
            records_retained: self.history.len(),
        }
    }

    /// Drop history and aggregates
    pub fn reset(&mut self) {
        *self = Self::new(self.capacity, self.decision_threshold);
    }
}
