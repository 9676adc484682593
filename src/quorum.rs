// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025-2026 Reflexd Contributors

//! Distributed corroboration signal.
//!
//! Peers report anomalous observations for a process hash via gossip. The
//! evaluator keeps a TTL window of those observations and produces
//! Q ∈ [0, 1]: 1.0 once at least `quorum_min` *distinct* nodes corroborate
//! within the window, scaling linearly toward 0 as corroborators age out.
//! One compromised or noisy node can therefore contribute at most
//! 1/quorum_min to the composite severity.

use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

#[derive(Debug, Clone)]
pub struct Observation {
    pub node_id: String,
    pub anomaly_score: f64,
    pub at: DateTime<Utc>,
}

pub struct QuorumEvaluator {
    quorum_min: usize,
    ttl: Duration,
    windows: Mutex<HashMap<String, Vec<Observation>>>,
}

impl QuorumEvaluator {
    pub fn new(quorum_min: usize, ttl: std::time::Duration) -> Self {
        Self {
            quorum_min: quorum_min.max(1),
            ttl: Duration::from_std(ttl).unwrap_or_else(|_| Duration::seconds(30)),
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Record a peer observation for a process hash. Repeat observations from
    /// the same node refresh its place in the window rather than stacking.
    pub fn record(&self, process_hash: &str, obs: Observation) {
        let mut windows = self.windows.lock().expect("quorum mutex poisoned");
        let window = windows.entry(process_hash.to_string()).or_default();
        window.retain(|o| o.node_id != obs.node_id);
        window.push(obs);
    }

    /// Corroboration signal for a process hash, evaluated at `now`.
    pub fn signal_at(&self, process_hash: &str, now: DateTime<Utc>) -> f64 {
        let mut windows = self.windows.lock().expect("quorum mutex poisoned");
        let Some(window) = windows.get_mut(process_hash) else {
            return 0.0;
        };
        window.retain(|o| now - o.at <= self.ttl);
        if window.is_empty() {
            windows.remove(process_hash);
            return 0.0;
        }
        let distinct: HashSet<&str> = window.iter().map(|o| o.node_id.as_str()).collect();
        (distinct.len() as f64 / self.quorum_min as f64).min(1.0)
    }

    pub fn signal(&self, process_hash: &str) -> f64 {
        self.signal_at(process_hash, Utc::now())
    }

    /// Number of process hashes currently holding live windows.
    pub fn tracked(&self) -> usize {
        self.windows.lock().expect("quorum mutex poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obs(node: &str, at: DateTime<Utc>) -> Observation {
        Observation {
            node_id: node.to_string(),
            anomaly_score: 0.9,
            at,
        }
    }

    #[test]
    fn test_single_node_below_quorum() {
        let q = QuorumEvaluator::new(2, std::time::Duration::from_secs(30));
        let now = Utc::now();
        q.record("hash-a", obs("n1", now));
        let signal = q.signal_at("hash-a", now);
        assert!(signal < 1.0);
        assert!((signal - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_two_distinct_nodes_reach_quorum() {
        let q = QuorumEvaluator::new(2, std::time::Duration::from_secs(30));
        let now = Utc::now();
        q.record("hash-a", obs("n1", now));
        q.record("hash-a", obs("n2", now));
        assert_eq!(q.signal_at("hash-a", now), 1.0);
    }

    #[test]
    fn test_same_node_does_not_stack() {
        let q = QuorumEvaluator::new(2, std::time::Duration::from_secs(30));
        let now = Utc::now();
        q.record("hash-a", obs("n1", now));
        q.record("hash-a", obs("n1", now));
        q.record("hash-a", obs("n1", now));
        assert!(q.signal_at("hash-a", now) < 1.0);
    }

    #[test]
    fn test_observations_age_out() {
        let q = QuorumEvaluator::new(2, std::time::Duration::from_secs(30));
        let now = Utc::now();
        q.record("hash-a", obs("n1", now - Duration::seconds(60)));
        q.record("hash-a", obs("n2", now));
        // n1 aged out: only one live corroborator.
        let signal = q.signal_at("hash-a", now);
        assert!(signal < 1.0);
    }

    #[test]
    fn test_empty_window_is_zero_and_evicted() {
        let q = QuorumEvaluator::new(2, std::time::Duration::from_secs(30));
        let now = Utc::now();
        q.record("hash-a", obs("n1", now - Duration::seconds(120)));
        assert_eq!(q.signal_at("hash-a", now), 0.0);
        assert_eq!(q.tracked(), 0);
    }

    #[test]
    fn test_unknown_hash_is_zero() {
        let q = QuorumEvaluator::new(2, std::time::Duration::from_secs(30));
        assert_eq!(q.signal("never-seen"), 0.0);
    }

    #[test]
    fn test_quorum_min_one_single_reporter_saturates() {
        let q = QuorumEvaluator::new(1, std::time::Duration::from_secs(30));
        let now = Utc::now();
        q.record("hash-a", obs("n1", now));
        assert_eq!(q.signal_at("hash-a", now), 1.0);
    }
}
