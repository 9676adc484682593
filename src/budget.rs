// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025-2026 Reflexd Contributors

//! Token bucket limiting the rate of costly containment actions.
//!
//! Every state transition has a cost (see `IsolationState::token_cost`).
//! `consume` is atomic: it succeeds iff enough tokens remain, and the caller
//! must *defer* the escalation on failure: retry on the next event, never
//! drop the intent and never force the action through.
//!
//! Refill is a full reset to capacity on a fixed period, not incremental.
//! That bounds the worst case to `capacity` tokens worth of actions per
//! period while recovering immediately after a burst.

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::watch;

use crate::metrics::Metrics;

pub struct BudgetBucket {
    capacity: u64,
    tokens: Mutex<u64>,
}

impl BudgetBucket {
    pub fn new(capacity: u64) -> Self {
        Self {
            capacity,
            tokens: Mutex::new(capacity),
        }
    }

    /// Atomically take `cost` tokens. Returns false (and takes nothing) if
    /// fewer than `cost` remain.
    pub fn consume(&self, cost: u64) -> bool {
        let mut tokens = self.tokens.lock().expect("budget mutex poisoned");
        if *tokens >= cost {
            *tokens -= cost;
            true
        } else {
            false
        }
    }

    pub fn remaining(&self) -> u64 {
        *self.tokens.lock().expect("budget mutex poisoned")
    }

    /// Return tokens taken for a decision that was not applied. Saturates at
    /// capacity so a refund racing a refill cannot overfill the bucket.
    pub fn refund(&self, cost: u64) {
        let mut tokens = self.tokens.lock().expect("budget mutex poisoned");
        *tokens = (*tokens + cost).min(self.capacity);
    }

    /// Full refill: tokens = capacity.
    pub fn refill(&self) {
        let mut tokens = self.tokens.lock().expect("budget mutex poisoned");
        *tokens = self.capacity;
    }
}

/// Periodic full-refill loop. Runs until the shutdown watch flips.
pub async fn run_refill(
    bucket: Arc<BudgetBucket>,
    period: Duration,
    metrics: Arc<Metrics>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(period);
    interval.tick().await; // first tick fires immediately; skip it
    loop {
        tokio::select! {
            _ = interval.tick() => {
                bucket.refill();
                metrics.budget_tokens.store(bucket.remaining(), std::sync::atomic::Ordering::Relaxed);
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::IsolationState;

    #[test]
    fn test_consume_within_capacity() {
        let b = BudgetBucket::new(100);
        assert!(b.consume(30));
        assert_eq!(b.remaining(), 70);
    }

    #[test]
    fn test_consume_fails_when_insufficient() {
        let b = BudgetBucket::new(10);
        assert!(b.consume(10));
        assert_eq!(b.remaining(), 0);
        assert!(!b.consume(1));
        assert_eq!(b.remaining(), 0);
    }

    #[test]
    fn test_refund_returns_tokens_up_to_capacity() {
        let b = BudgetBucket::new(100);
        assert!(b.consume(50));
        b.refund(50);
        assert_eq!(b.remaining(), 100);
        b.refund(10);
        assert_eq!(b.remaining(), 100, "refund never exceeds capacity");
    }

    #[test]
    fn test_refill_restores_full_capacity() {
        let b = BudgetBucket::new(50);
        assert!(b.consume(37));
        b.refill();
        assert_eq!(b.remaining(), 50);
    }

    #[test]
    fn test_isolated_cost_scenario() {
        // capacity=10: two ISOLATED transitions (cost 5 each) fit exactly,
        // then any further nonzero cost must defer.
        let b = BudgetBucket::new(10);
        let cost = IsolationState::Isolated.token_cost();
        assert!(b.consume(cost));
        assert_eq!(b.remaining(), 5);
        assert!(b.consume(cost));
        assert_eq!(b.remaining(), 0);
        assert!(!b.consume(IsolationState::Pressure.token_cost()));
    }

    #[test]
    fn test_tokens_never_exceed_bounds() {
        let b = BudgetBucket::new(20);
        for _ in 0..100 {
            let _ = b.consume(7);
            assert!(b.remaining() <= 20);
        }
        b.refill();
        assert_eq!(b.remaining(), 20);
    }

    #[tokio::test]
    async fn test_refill_loop_stops_on_shutdown() {
        let bucket = Arc::new(BudgetBucket::new(10));
        let metrics = Arc::new(Metrics::new());
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(run_refill(
            bucket.clone(),
            Duration::from_millis(10),
            metrics,
            rx,
        ));
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("refill loop did not stop")
            .unwrap();
    }
}
