// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025-2026 Reflexd Contributors

//! Per-binary behavioral baselines and the anomaly scorer.
//!
//! Each monitored binary (identified only by a one-way process hash) owns a
//! [`BaselineRecord`]: running mean and variance of its feature vector plus a
//! smoothed event-mix entropy. The default scorer is Mahalanobis distance on
//! the variance diagonal with an entropy deviation term; its coefficients
//! come from config, not constants; the model sketch upstream is explicitly
//! incomplete, so nothing here is hard-wired.
//!
//! Federated copies from trusted peers are merged with a trust-and-volume
//! weight, never adopted wholesale: local data always retains its share.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;

/// Baseline statistics for one monitored binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BaselineRecord {
    pub process_hash: String,
    pub mean: Vec<f64>,
    /// Variance per feature dimension (covariance diagonal).
    pub cov_diag: Vec<f64>,
    /// Locally observed samples.
    pub sample_count: u64,
    /// Samples contributed through federated merges (never counted as local).
    #[serde(default)]
    pub federated_samples: u64,
    /// Smoothed event-mix entropy.
    pub entropy: f64,
    pub updated_at: DateTime<Utc>,
}

impl BaselineRecord {
    pub fn new(process_hash: &str, dim: usize) -> Self {
        Self {
            process_hash: process_hash.to_string(),
            mean: vec![0.0; dim],
            cov_diag: vec![0.0; dim],
            sample_count: 0,
            federated_samples: 0,
            entropy: 0.0,
            updated_at: Utc::now(),
        }
    }

    /// Welford-style online update of mean and variance diagonal.
    pub fn observe(&mut self, features: &[f64]) {
        if features.len() != self.mean.len() {
            return; // dimension mismatch: ignore rather than corrupt
        }
        self.sample_count += 1;
        let n = self.sample_count as f64;
        for i in 0..features.len() {
            let delta = features[i] - self.mean[i];
            self.mean[i] += delta / n;
            let delta2 = features[i] - self.mean[i];
            // Population variance via incremental M2 folded into cov_diag.
            self.cov_diag[i] += (delta * delta2 - self.cov_diag[i]) / n;
        }
        let h = shannon_entropy(features);
        self.entropy += 0.1 * (h - self.entropy);
        self.updated_at = Utc::now();
    }

    pub fn total_samples(&self) -> u64 {
        self.sample_count + self.federated_samples
    }
}

/// Shannon entropy of a feature vector treated as an unnormalized
/// distribution. Zero vectors have zero entropy.
pub fn shannon_entropy(features: &[f64]) -> f64 {
    let total: f64 = features.iter().filter(|v| **v > 0.0).sum();
    if total <= 0.0 {
        return 0.0;
    }
    features
        .iter()
        .filter(|v| **v > 0.0)
        .map(|v| {
            let p = v / total;
            -p * p.ln()
        })
        .sum()
}

/// Anomaly scoring interface. Injected into the worker pool at construction
/// so the model can be swapped without touching the event pipeline.
pub trait Scorer: Send + Sync {
    /// Score a feature vector against a baseline. Must return a value in
    /// [0, 1]; the constitutional kernel rejects anything outside.
    fn score(&self, features: &[f64], baseline: Option<&BaselineRecord>) -> f64;
}

/// Default scorer: normalized Mahalanobis distance on the variance diagonal
/// plus a weighted entropy-deviation term.
pub struct MahalanobisScorer {
    /// Weight of the |ΔH| entropy term.
    pub entropy_weight: f64,
    /// Variance floor so a near-constant dimension cannot blow up distances.
    pub min_variance: f64,
    /// Samples required before a baseline is trusted for scoring.
    pub warmup_samples: u64,
}

impl MahalanobisScorer {
    pub fn new(entropy_weight: f64, min_variance: f64, warmup_samples: u64) -> Self {
        Self {
            entropy_weight,
            min_variance,
            warmup_samples,
        }
    }
}

impl Scorer for MahalanobisScorer {
    fn score(&self, features: &[f64], baseline: Option<&BaselineRecord>) -> f64 {
        let Some(b) = baseline else {
            return 0.0;
        };
        if b.total_samples() < self.warmup_samples || b.mean.len() != features.len() {
            return 0.0;
        }
        let mut dist2 = 0.0;
        for i in 0..features.len() {
            let var = b.cov_diag[i].max(self.min_variance);
            let d = features[i] - b.mean[i];
            dist2 += d * d / var;
        }
        let dist = dist2.sqrt();
        // Map distance into [0, 1): d/(d+k) with k=3 puts ~3σ around 0.5.
        let base = dist / (dist + 3.0);
        let entropy_term = self.entropy_weight * (shannon_entropy(features) - b.entropy).abs();
        (base + entropy_term).clamp(0.0, 1.0)
    }
}

/// Locally owned baseline map. Passed by reference into the worker pool and
/// the gossip layer; no ambient globals.
pub struct BaselineStore {
    dim: usize,
    records: Mutex<HashMap<String, BaselineRecord>>,
}

impl BaselineStore {
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            records: Mutex::new(HashMap::new()),
        }
    }

    /// Fold a local observation into the baseline for a process hash,
    /// creating it on first sight. Returns a clone of the updated record.
    pub fn observe(&self, process_hash: &str, features: &[f64]) -> BaselineRecord {
        let mut records = self.records.lock().expect("baseline mutex poisoned");
        let record = records
            .entry(process_hash.to_string())
            .or_insert_with(|| BaselineRecord::new(process_hash, self.dim));
        record.observe(features);
        record.clone()
    }

    pub fn get(&self, process_hash: &str) -> Option<BaselineRecord> {
        self.records
            .lock()
            .expect("baseline mutex poisoned")
            .get(process_hash)
            .cloned()
    }

    /// Baselines with enough local samples to be shared with peers.
    pub fn eligible_for_sharing(&self, min_samples: u64) -> Vec<BaselineRecord> {
        self.records
            .lock()
            .expect("baseline mutex poisoned")
            .values()
            .filter(|r| r.sample_count >= min_samples)
            .cloned()
            .collect()
    }

    /// Merge a federated baseline from a trusted peer.
    ///
    /// `w = trust_weight · n_fed / (n_local + n_fed)`: the peer's influence
    /// grows with both configured trust and its sample volume, and local data
    /// is never overwritten outright. A binary we have never seen locally
    /// starts from the federated statistics but with zero *local* samples, so
    /// the scorer's warmup gate still applies until federated volume covers it.
    pub fn merge_federated(
        &self,
        process_hash: &str,
        fed_mean: &[f64],
        fed_cov_diag: &[f64],
        fed_samples: u64,
        fed_entropy: f64,
        trust_weight: f64,
    ) {
        if fed_mean.len() != self.dim || fed_cov_diag.len() != self.dim || fed_samples == 0 {
            return;
        }
        let mut records = self.records.lock().expect("baseline mutex poisoned");
        let record = records
            .entry(process_hash.to_string())
            .or_insert_with(|| BaselineRecord::new(process_hash, self.dim));

        let n_local = record.total_samples() as f64;
        let n_fed = fed_samples as f64;
        let w = (trust_weight * n_fed / (n_local + n_fed)).clamp(0.0, 1.0);

        for i in 0..self.dim {
            record.mean[i] = (1.0 - w) * record.mean[i] + w * fed_mean[i];
            record.cov_diag[i] = (1.0 - w) * record.cov_diag[i] + w * fed_cov_diag[i];
        }
        record.entropy = (1.0 - w) * record.entropy + w * fed_entropy;
        record.federated_samples += (n_fed * w) as u64;
        record.updated_at = Utc::now();
    }

    pub fn len(&self) -> usize {
        self.records.lock().expect("baseline mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observe_converges_on_mean() {
        let mut r = BaselineRecord::new("h", 2);
        for _ in 0..100 {
            r.observe(&[2.0, 4.0]);
        }
        assert!((r.mean[0] - 2.0).abs() < 1e-9);
        assert!((r.mean[1] - 4.0).abs() < 1e-9);
        assert!(r.cov_diag[0] < 1e-9); // constant input: zero variance
        assert_eq!(r.sample_count, 100);
    }

    #[test]
    fn test_entropy_of_uniform_exceeds_skewed() {
        let uniform = shannon_entropy(&[1.0, 1.0, 1.0, 1.0]);
        let skewed = shannon_entropy(&[10.0, 0.1, 0.1, 0.1]);
        assert!(uniform > skewed);
        assert_eq!(shannon_entropy(&[0.0, 0.0]), 0.0);
    }

    #[test]
    fn test_scorer_cold_start_is_zero() {
        let scorer = MahalanobisScorer::new(0.3, 1e-6, 20);
        assert_eq!(scorer.score(&[1.0, 2.0], None), 0.0);
        let b = BaselineRecord::new("h", 2);
        assert_eq!(scorer.score(&[1.0, 2.0], Some(&b)), 0.0);
    }

    #[test]
    fn test_scorer_flags_outliers_after_warmup() {
        let scorer = MahalanobisScorer::new(0.3, 1e-3, 10);
        let mut b = BaselineRecord::new("h", 2);
        for i in 0..50 {
            // Small natural jitter around (1.0, 1.0).
            let j = (i % 5) as f64 * 0.01;
            b.observe(&[1.0 + j, 1.0 - j]);
        }
        let normal = scorer.score(&[1.0, 1.0], Some(&b));
        let outlier = scorer.score(&[25.0, 0.0], Some(&b));
        assert!(normal < 0.5, "normal scored {}", normal);
        assert!(outlier > normal);
        assert!(outlier <= 1.0);
    }

    #[test]
    fn test_score_always_in_unit_range() {
        let scorer = MahalanobisScorer::new(1.0, 1e-9, 1);
        let mut b = BaselineRecord::new("h", 3);
        b.observe(&[0.0, 0.0, 0.0]);
        let s = scorer.score(&[1e9, 1e9, 1e9], Some(&b));
        assert!((0.0..=1.0).contains(&s));
    }

    #[test]
    fn test_federated_merge_is_weighted_not_wholesale() {
        let store = BaselineStore::new(2);
        for _ in 0..100 {
            store.observe("h", &[1.0, 1.0]);
        }
        store.merge_federated("h", &[9.0, 9.0], &[0.5, 0.5], 100, 1.0, 0.3);
        let merged = store.get("h").unwrap();
        // w = 0.3 * 100/200 = 0.15 → mean = 0.85*1.0 + 0.15*9.0 = 2.2
        assert!((merged.mean[0] - 2.2).abs() < 1e-9);
        assert!(merged.mean[0] < 9.0, "local data must survive the merge");
    }

    #[test]
    fn test_federated_merge_unknown_binary_keeps_warmup_gate() {
        let store = BaselineStore::new(2);
        store.merge_federated("new", &[5.0, 5.0], &[1.0, 1.0], 10, 0.5, 0.3);
        let r = store.get("new").unwrap();
        assert_eq!(r.sample_count, 0);
        assert!(r.federated_samples > 0);
    }

    #[test]
    fn test_eligibility_requires_local_samples() {
        let store = BaselineStore::new(2);
        for _ in 0..5 {
            store.observe("a", &[1.0, 1.0]);
        }
        store.merge_federated("b", &[1.0, 1.0], &[1.0, 1.0], 1000, 0.5, 1.0);
        let eligible = store.eligible_for_sharing(3);
        assert_eq!(eligible.len(), 1);
        assert_eq!(eligible[0].process_hash, "a");
    }

    #[test]
    fn test_dimension_mismatch_ignored() {
        let store = BaselineStore::new(2);
        store.observe("h", &[1.0, 1.0]);
        store.merge_federated("h", &[1.0, 1.0, 1.0], &[1.0, 1.0, 1.0], 10, 0.5, 0.3);
        let r = store.get("h").unwrap();
        assert_eq!(r.federated_samples, 0);
    }
}
