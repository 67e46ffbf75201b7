//! Validation metrics for retrained candidates

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Metric the quality gate compares against `performance_threshold`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateMetric {
    Accuracy,
    Precision,
    Recall,
    F1,
    RocAuc,
}

impl Default for GateMetric {
    fn default() -> Self {
        GateMetric::F1
    }
}

/// Binary classification metrics on the held-out split
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationMetrics {
    pub accuracy: f64,
    pub precision: f64,
    pub recall: f64,
    pub f1_score: f64,
    /// Undefined when the validation split holds a single class
    pub roc_auc: Option<f64>,
    pub n_samples: usize,
    pub n_positive: usize,
}

impl ValidationMetrics {
    /// Compute metrics from predicted probabilities; a score at or above
    /// `decision_threshold` predicts the positive class
    pub fn compute(scores: &[f64], labels: &[bool], decision_threshold: f64) -> Self {
        let (tp, fp, tn, fn_) = confusion_counts(scores, labels, decision_threshold);
        let n = scores.len().min(labels.len());

        let accuracy = if n > 0 {
            (tp + tn) as f64 / n as f64
        } else {
            0.0
        };
        let precision = if tp + fp > 0 {
            tp as f64 / (tp + fp) as f64
        } else {
            0.0
        };
        let recall = if tp + fn_ > 0 {
            tp as f64 / (tp + fn_) as f64
        } else {
            0.0
        };
        let f1_score = if precision + recall > 0.0 {
            2.0 * precision * recall / (precision + recall)
        } else {
            0.0
        };

        Self {
            accuracy,
            precision,
            recall,
            f1_score,
            roc_auc: roc_auc(scores, labels),
            n_samples: n,
            n_positive: tp + fn_,
        }
    }

    pub fn get(&self, metric: GateMetric) -> Option<f64> {
        match metric {
            GateMetric::Accuracy => Some(self.accuracy),
            GateMetric::Precision => Some(self.precision),
            GateMetric::Recall => Some(self.recall),
            GateMetric::F1 => Some(self.f1_score),
            GateMetric::RocAuc => self.roc_auc,
        }
    }

    /// Whether `metric` reaches `threshold`; an undefined metric fails
    pub fn passes(&self, metric: GateMetric, threshold: f64) -> bool {
        self.get(metric).map_or(false, |v| v >= threshold)
    }
}

fn confusion_counts(
    scores: &[f64],
    labels: &[bool],
    decision_threshold: f64,
) -> (usize, usize, usize, usize) {
    let mut tp = 0;
    let mut fp = 0;
    let mut tn = 0;
    let mut fn_ = 0;

    for (&score, &label) in scores.iter().zip(labels) {
        match (label, score >= decision_threshold) {
            (true, true) => tp += 1,
            (false, true) => fp += 1,
            (false, false) => tn += 1,
            (true, false) => fn_ += 1,
        }
    }

    (tp, fp, tn, fn_)
}

/// Area under the ROC curve via the rank-sum statistic, averaging ranks
/// across tied scores
fn roc_auc(scores: &[f64], labels: &[bool]) -> Option<f64> {
    let mut pairs: Vec<(f64, bool)> = scores.iter().copied().zip(labels.iter().copied()).collect();
    let n_pos = pairs.iter().filter(|(_, l)| *l).count();
    let n_neg = pairs.len() - n_pos;
    if n_pos == 0 || n_neg == 0 {
        return None;
    }

    pairs.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(Ordering::Equal));

    let mut positive_rank_sum = 0.0;
    let mut i = 0;
    while i < pairs.len() {
        let mut j = i;
        while j + 1 < pairs.len() && pairs[j + 1].0 == pairs[i].0 {
            j += 1;
        }
        // Ranks are 1-based; tied block i..=j shares the mean rank
        let mean_rank = (i + j) as f64 / 2.0 + 1.0;
        let positives = pairs[i..=j].iter().filter(|(_, l)| *l).count();
        positive_rank_sum += mean_rank * positives as f64;
        i = j + 1;
    }

    let n_pos = n_pos as f64;
    let n_neg = n_neg as f64;
    Some((positive_rank_sum - n_pos * (n_pos + 1.0) / 2.0) / (n_pos * n_neg))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_perfect_classifier() {
        let scores = [0.9, 0.8, 0.2, 0.1];
        let labels = [true, true, false, false];
        let m = ValidationMetrics::compute(&scores, &labels, 0.5);
        assert_eq!(m.accuracy, 1.0);
        assert_eq!(m.f1_score, 1.0);
        assert_eq!(m.roc_auc, Some(1.0));
        assert_eq!(m.n_positive, 2);
    }

    #[test]
    fn test_confusion_based_metrics() {
        // tp=1 fp=1 tn=1 fn=1
        let scores = [0.9, 0.7, 0.3, 0.2];
        let labels = [true, false, true, false];
        let m = ValidationMetrics::compute(&scores, &labels, 0.5);
        assert_eq!(m.accuracy, 0.5);
        assert_eq!(m.precision, 0.5);
        assert_eq!(m.recall, 0.5);
        assert_eq!(m.f1_score, 0.5);
        // Positive scores 0.9, 0.3 vs negative 0.7, 0.2: 3 of 4 pairs ordered
        assert_eq!(m.roc_auc, Some(0.75));
    }

    #[test]
    fn test_ties_count_half() {
        let scores = [0.5, 0.5];
        let labels = [true, false];
        let m = ValidationMetrics::compute(&scores, &labels, 0.5);
        assert_eq!(m.roc_auc, Some(0.5));
    }

    #[test]
    fn test_single_class_has_no_auc() {
        let m = ValidationMetrics::compute(&[0.2, 0.9], &[true, true], 0.5);
        assert_eq!(m.roc_auc, None);
        assert!(!m.passes(GateMetric::RocAuc, 0.1));
        assert!(m.passes(GateMetric::Precision, 1.0));
    }

    #[test]
    fn test_gate_default_is_f1() {
        let m = ValidationMetrics::compute(&[0.9, 0.1], &[true, false], 0.5);
        assert_eq!(GateMetric::default(), GateMetric::F1);
        assert!(m.passes(GateMetric::default(), 0.85));
    }
}
