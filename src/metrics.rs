// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025-2026 Reflexd Contributors

//! In-process counters and gauges.
//!
//! Exposition (Prometheus formatting, HTTP scrape endpoint) is an external
//! collaborator; this core only maintains the numbers. Everything is a
//! relaxed atomic; these are statistics, not synchronization.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Metrics {
    pub events_processed: AtomicU64,
    pub events_dropped_queue_full: AtomicU64,
    pub events_malformed: AtomicU64,
    pub anomaly_evals: AtomicU64,
    pub state_transitions: AtomicU64,
    pub escalations_deferred: AtomicU64,
    pub decays: AtomicU64,
    pub budget_tokens: AtomicU64,
    pub gossip_accepted: AtomicU64,
    pub gossip_rejected: AtomicU64,
    pub gossip_dropped_backpressure: AtomicU64,
    pub decoy_connections: AtomicU64,
    pub baselines_merged: AtomicU64,
    pub tracked_pids: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot for the operator `status` command.
    pub fn snapshot(&self) -> serde_json::Value {
        serde_json::json!({
            "events_processed": self.events_processed.load(Ordering::Relaxed),
            "events_dropped_queue_full": self.events_dropped_queue_full.load(Ordering::Relaxed),
            "events_malformed": self.events_malformed.load(Ordering::Relaxed),
            "anomaly_evals": self.anomaly_evals.load(Ordering::Relaxed),
            "state_transitions": self.state_transitions.load(Ordering::Relaxed),
            "escalations_deferred": self.escalations_deferred.load(Ordering::Relaxed),
            "decays": self.decays.load(Ordering::Relaxed),
            "budget_tokens": self.budget_tokens.load(Ordering::Relaxed),
            "gossip_accepted": self.gossip_accepted.load(Ordering::Relaxed),
            "gossip_rejected": self.gossip_rejected.load(Ordering::Relaxed),
            "gossip_dropped_backpressure": self.gossip_dropped_backpressure.load(Ordering::Relaxed),
            "decoy_connections": self.decoy_connections.load(Ordering::Relaxed),
            "baselines_merged": self.baselines_merged.load(Ordering::Relaxed),
            "tracked_pids": self.tracked_pids.load(Ordering::Relaxed),
        })
    }
}
