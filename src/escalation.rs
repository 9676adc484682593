// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025-2026 Reflexd Contributors

//! Escalation engine: turns anomaly evidence into isolation state changes.
//!
//! Pipeline per event: update the EWMA pressure accumulator, compute the
//! composite severity `S = w_A·A + w_Q·Q + w_I·I + w_P·P`, pick a target rung
//! from the ordered thresholds, then attempt the transition. Only two things
//! can stop a warranted escalation: an exhausted [`BudgetBucket`] (deferred,
//! retried on the next event) or a constitutional rejection. Neither can
//! ever force a process *down* the ladder. De-escalation exists solely as the
//! audited cooldown/operator decay path.

use crate::audit::Ledger;
use crate::budget::BudgetBucket;
use crate::constitution::{ConstitutionalKernel, Decision};
use crate::metrics::Metrics;
use crate::state::{IsolationState, ProcessState};
use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Severity weights for the composite formula.
#[derive(Debug, Clone, Copy)]
pub struct Weights {
    pub anomaly: f64,
    pub quorum: f64,
    pub integrity: f64,
    pub pressure: f64,
}

impl Default for Weights {
    fn default() -> Self {
        // Inputs all live in [0,1]; these sum to 10 so severity spans the
        // constitutional bound exactly.
        Self {
            anomaly: 4.0,
            quorum: 2.0,
            integrity: 2.0,
            pressure: 2.0,
        }
    }
}

/// Ordered severity thresholds, one per rung above NORMAL.
#[derive(Debug, Clone, Copy)]
pub struct Thresholds {
    pub pressure: f64,
    pub isolated: f64,
    pub frozen: f64,
    pub quarantined: f64,
    pub terminated: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            pressure: 1.0,
            isolated: 3.0,
            frozen: 6.0,
            quarantined: 8.5,
            terminated: 9.5,
        }
    }
}

impl Thresholds {
    pub fn ordered(&self) -> bool {
        self.pressure < self.isolated
            && self.isolated < self.frozen
            && self.frozen < self.quarantined
            && self.quarantined < self.terminated
    }
}

/// Named evidence inputs for one severity evaluation. Every field rides into
/// the decision's audit record.
#[derive(Debug, Clone, Copy, Default)]
pub struct Inputs {
    pub anomaly_score: f64,
    pub quorum_signal: f64,
    pub integrity_score: f64,
    pub pressure_score: f64,
}

impl Inputs {
    pub fn to_map(&self) -> BTreeMap<String, f64> {
        let mut m = BTreeMap::new();
        m.insert("anomaly_score".to_string(), self.anomaly_score);
        m.insert("quorum_signal".to_string(), self.quorum_signal);
        m.insert("integrity_score".to_string(), self.integrity_score);
        m.insert("pressure_score".to_string(), self.pressure_score);
        m
    }
}

pub fn compute_severity(inputs: &Inputs, w: &Weights) -> f64 {
    w.anomaly * inputs.anomaly_score
        + w.quorum * inputs.quorum_signal
        + w.integrity * inputs.integrity_score
        + w.pressure * inputs.pressure_score
}

/// Map a severity onto the state ladder. Returns the highest rung whose
/// threshold the severity clears.
pub fn target_state(severity: f64, t: &Thresholds) -> IsolationState {
    if severity >= t.terminated {
        IsolationState::Terminated
    } else if severity >= t.quarantined {
        IsolationState::Quarantined
    } else if severity >= t.frozen {
        IsolationState::Frozen
    } else if severity >= t.isolated {
        IsolationState::Isolated
    } else if severity >= t.pressure {
        IsolationState::Pressure
    } else {
        IsolationState::Normal
    }
}

/// EWMA pressure accumulator: `p ← α·a + (1-α)·p`.
#[derive(Debug, Clone, Copy)]
pub struct Accumulator {
    alpha: f64,
    pressure: f64,
}

impl Accumulator {
    pub fn new(alpha: f64) -> Self {
        Self {
            alpha: alpha.clamp(0.0, 1.0),
            pressure: 0.0,
        }
    }

    pub fn update(&mut self, anomaly_score: f64) -> f64 {
        self.pressure = self.alpha * anomaly_score + (1.0 - self.alpha) * self.pressure;
        self.pressure
    }
}

/// Kernel-enforcement seam. The engine decides; this applies the decision to
/// the operating system (or records it, in tests).
pub trait Containment: Send + Sync {
    fn enforce(&self, pid: u32, from: IsolationState, to: IsolationState) -> anyhow::Result<()>;
}

/// Signal-based enforcement. FROZEN maps to SIGSTOP, TERMINATED to SIGKILL,
/// decay out of FROZEN to SIGCONT. ISOLATED and QUARANTINED are enforced by
/// the network-layer collaborators that consume our state and hint files, so
/// they are no-ops here.
pub struct SignalContainment;

impl Containment for SignalContainment {
    fn enforce(&self, pid: u32, from: IsolationState, to: IsolationState) -> anyhow::Result<()> {
        let sig = if to == IsolationState::Terminated {
            Some(libc::SIGKILL)
        } else if to >= IsolationState::Frozen && from < IsolationState::Frozen {
            Some(libc::SIGSTOP)
        } else if from >= IsolationState::Frozen && to < IsolationState::Frozen {
            Some(libc::SIGCONT)
        } else {
            None
        };
        if let Some(sig) = sig {
            let rc = unsafe { libc::kill(pid as i32, sig) };
            if rc != 0 {
                // ESRCH just means the process already exited.
                let err = std::io::Error::last_os_error();
                if err.raw_os_error() != Some(libc::ESRCH) {
                    anyhow::bail!("kill({}, {}) failed: {}", pid, sig, err);
                }
            }
        }
        Ok(())
    }
}

/// Test/dry-run enforcement that records calls and touches nothing.
pub struct NullContainment;

impl Containment for NullContainment {
    fn enforce(&self, _pid: u32, _from: IsolationState, _to: IsolationState) -> anyhow::Result<()> {
        Ok(())
    }
}

/// State change notification delivered to the camouflage engine.
#[derive(Debug, Clone, Copy)]
pub struct Transition {
    pub pid: u32,
    pub from: IsolationState,
    pub to: IsolationState,
    pub severity: f64,
}

pub struct EscalationEngine {
    node_id: String,
    weights: Weights,
    thresholds: Thresholds,
    kernel: Arc<ConstitutionalKernel>,
    ledger: Arc<Ledger>,
    budget: Arc<BudgetBucket>,
    metrics: Arc<Metrics>,
    containment: Box<dyn Containment>,
    /// Best-effort fan-out to the camouflage engine; full channel drops.
    transition_tx: Option<mpsc::Sender<Transition>>,
}

impl EscalationEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        node_id: &str,
        weights: Weights,
        thresholds: Thresholds,
        kernel: Arc<ConstitutionalKernel>,
        ledger: Arc<Ledger>,
        budget: Arc<BudgetBucket>,
        metrics: Arc<Metrics>,
        containment: Box<dyn Containment>,
        transition_tx: Option<mpsc::Sender<Transition>>,
    ) -> Self {
        Self {
            node_id: node_id.to_string(),
            weights,
            thresholds,
            kernel,
            ledger,
            budget,
            metrics,
            containment,
            transition_tx,
        }
    }

    /// Evaluate one event's evidence against a process and escalate if
    /// warranted. Returns the applied decision, or `None` when no transition
    /// happened (below threshold, pinned, deferred, or rejected).
    pub fn consider(&self, ps: &mut ProcessState, inputs: Inputs) -> Option<Decision> {
        let severity = compute_severity(&inputs, &self.weights);
        let target = target_state(severity, &self.thresholds);
        let current = ps.current();
        if target <= current {
            return None;
        }
        if ps.pinned {
            // Operator holds this PID; evidence keeps accumulating but no
            // autonomous transition fires until the pin is lifted.
            return None;
        }

        let cost = target.token_cost();
        if !self.budget.consume(cost) {
            eprintln!(
                "[ESCALATE] budget exhausted, deferring pid={} target={} cost={} remaining={}",
                ps.pid,
                target,
                cost,
                self.budget.remaining()
            );
            Metrics::inc(&self.metrics.escalations_deferred);
            return None;
        }

        let mut decision = Decision::new(
            ps.pid,
            current,
            target,
            severity,
            &self.node_id,
            inputs.to_map(),
        );
        if let Err(violation) = self.kernel.validate(&mut decision) {
            // A rejected decision must leave the system untouched, including
            // the tokens it would have spent.
            self.budget.refund(cost);
            eprintln!(
                "[ESCALATE] rejected pid={} target={}: {}",
                ps.pid, target, violation
            );
            return None;
        }

        self.apply(ps, target, &decision);
        Some(decision)
    }

    /// The audited decay path: one rung down after `cooldown` with no events.
    /// Called from the owning worker's periodic tick, never from `consider`.
    pub fn maybe_cooldown_decay(
        &self,
        ps: &mut ProcessState,
        now: DateTime<Utc>,
        cooldown: Duration,
    ) -> Option<Decision> {
        if ps.pinned || ps.current() == IsolationState::Normal {
            return None;
        }
        // Each rung requires a full quiet cooldown of its own; a prior decay
        // restarts the clock so one idle period cannot cascade down the ladder.
        let quiet_since = match ps.last_decay {
            Some(d) if d > ps.last_event => d,
            _ => ps.last_event,
        };
        if now - quiet_since < cooldown {
            return None;
        }
        let decision = self.decay(ps, "cooldown");
        if decision.is_some() {
            ps.last_decay = Some(now);
        }
        decision
    }

    /// Operator-driven reset to NORMAL. Walks the ladder down one audited
    /// decision at a time so the chain records every rung.
    pub fn operator_reset(&self, ps: &mut ProcessState) -> Vec<Decision> {
        let mut decisions = Vec::new();
        while ps.current() != IsolationState::Normal {
            match self.decay(ps, "operator_reset") {
                Some(d) => decisions.push(d),
                None => break,
            }
        }
        decisions
    }

    fn decay(&self, ps: &mut ProcessState, reason: &str) -> Option<Decision> {
        let from = ps.current();
        let to = from.step_down();
        let mut inputs = BTreeMap::new();
        inputs.insert(format!("decay_{}", reason), 1.0);
        let mut decision = Decision::new(ps.pid, from, to, 0.0, &self.node_id, inputs);
        if let Err(violation) = self.kernel.validate(&mut decision) {
            eprintln!("[DECAY] rejected pid={}: {}", ps.pid, violation);
            return None;
        }
        let (_, applied) = match ps.decay_one() {
            Some(pair) => pair,
            None => return None,
        };
        if let Err(e) = self.containment.enforce(ps.pid, from, applied) {
            eprintln!("[DECAY] enforcement failed pid={}: {:#}", ps.pid, e);
        }
        if let Err(e) = self.ledger.append(&decision) {
            eprintln!("[DECAY] ledger write failed: {:#}", e);
        }
        Metrics::inc(&self.metrics.decays);
        eprintln!("[DECAY] pid={} {} -> {} ({})", ps.pid, from, applied, reason);
        self.notify(Transition {
            pid: ps.pid,
            from,
            to: applied,
            severity: 0.0,
        });
        Some(decision)
    }

    fn apply(&self, ps: &mut ProcessState, target: IsolationState, decision: &Decision) {
        let (from, to) = match ps.escalate(target) {
            Some(pair) => pair,
            // Unreachable given the target > current check above.
            None => return,
        };
        if let Err(e) = self.containment.enforce(ps.pid, from, to) {
            eprintln!("[ESCALATE] enforcement failed pid={}: {:#}", ps.pid, e);
        }
        if let Err(e) = self.ledger.append(decision) {
            eprintln!("[ESCALATE] ledger write failed: {:#}", e);
        }
        Metrics::inc(&self.metrics.state_transitions);
        self.metrics
            .budget_tokens
            .store(self.budget.remaining(), std::sync::atomic::Ordering::Relaxed);
        eprintln!(
            "[ESCALATE] pid={} {} -> {} severity={:.4} tokens={}",
            ps.pid,
            from,
            to,
            decision.severity,
            self.budget.remaining()
        );
        self.notify(Transition {
            pid: ps.pid,
            from,
            to,
            severity: decision.severity,
        });
    }

    fn notify(&self, t: Transition) {
        if let Some(tx) = &self.transition_tx {
            let _ = tx.try_send(t);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constitution::Bounds;
    use tempfile::tempdir;

    fn engine(capacity: u64) -> (EscalationEngine, tempfile::TempDir) {
        let dir = tempdir().expect("tempdir");
        let ledger = Ledger::open(&dir.path().join("ledger.jsonl")).expect("ledger");
        let engine = EscalationEngine::new(
            "test-node",
            Weights::default(),
            Thresholds::default(),
            Arc::new(ConstitutionalKernel::new(Bounds::default(), false)),
            Arc::new(ledger),
            Arc::new(BudgetBucket::new(capacity)),
            Arc::new(Metrics::new()),
            Box::new(NullContainment),
            None,
        );
        (engine, dir)
    }

    #[test]
    fn test_severity_formula() {
        let w = Weights::default();
        let inputs = Inputs {
            anomaly_score: 1.0,
            quorum_signal: 1.0,
            integrity_score: 1.0,
            pressure_score: 1.0,
        };
        assert!((compute_severity(&inputs, &w) - 10.0).abs() < 1e-9);
        let half = Inputs {
            anomaly_score: 0.5,
            ..Default::default()
        };
        assert!((compute_severity(&half, &w) - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_target_state_thresholds() {
        let t = Thresholds::default();
        assert_eq!(target_state(0.5, &t), IsolationState::Normal);
        assert_eq!(target_state(1.0, &t), IsolationState::Pressure);
        assert_eq!(target_state(4.2, &t), IsolationState::Isolated);
        assert_eq!(target_state(6.0, &t), IsolationState::Frozen);
        assert_eq!(target_state(8.7, &t), IsolationState::Quarantined);
        assert_eq!(target_state(9.9, &t), IsolationState::Terminated);
    }

    #[test]
    fn test_accumulator_ewma() {
        let mut acc = Accumulator::new(0.8);
        assert!((acc.update(1.0) - 0.8).abs() < 1e-9);
        assert!((acc.update(1.0) - 0.96).abs() < 1e-9);
        assert!(acc.update(0.0) < 0.96);
    }

    #[test]
    fn test_consider_escalates_and_audits() {
        let (engine, _dir) = engine(100);
        let mut ps = ProcessState::new(1234);
        let decision = engine
            .consider(
                &mut ps,
                Inputs {
                    anomaly_score: 0.9,
                    quorum_signal: 0.5,
                    integrity_score: 0.0,
                    pressure_score: 0.6,
                },
            )
            .expect("should escalate");
        // S = 4*0.9 + 2*0.5 + 2*0.6 = 5.8 → ISOLATED
        assert_eq!(ps.current(), IsolationState::Isolated);
        assert!(decision.constitutionally_valid);
        assert!(!decision.decision_hash.is_empty());
    }

    #[test]
    fn test_consider_never_deescalates() {
        let (engine, _dir) = engine(100);
        let mut ps = ProcessState::new(1);
        ps.escalate(IsolationState::Frozen);
        let r = engine.consider(
            &mut ps,
            Inputs {
                anomaly_score: 0.3,
                ..Default::default()
            },
        );
        assert!(r.is_none());
        assert_eq!(ps.current(), IsolationState::Frozen);
    }

    #[test]
    fn test_budget_exhaustion_defers() {
        let (engine, _dir) = engine(5);
        let hot = Inputs {
            anomaly_score: 1.0,
            quorum_signal: 0.4,
            pressure_score: 0.3,
            ..Default::default()
        };
        // S = 4.0 + 0.8 + 0.6 = 5.4 → ISOLATED, cost 5.
        let mut a = ProcessState::new(1);
        assert!(engine.consider(&mut a, hot).is_some());
        let mut b = ProcessState::new(2);
        assert!(engine.consider(&mut b, hot).is_none(), "tokens drained");
        assert_eq!(b.current(), IsolationState::Normal);
    }

    #[test]
    fn test_pinned_pid_holds_state() {
        let (engine, _dir) = engine(100);
        let mut ps = ProcessState::new(9);
        ps.pinned = true;
        let r = engine.consider(
            &mut ps,
            Inputs {
                anomaly_score: 1.0,
                quorum_signal: 1.0,
                integrity_score: 1.0,
                pressure_score: 1.0,
            },
        );
        assert!(r.is_none());
        assert_eq!(ps.current(), IsolationState::Normal);
    }

    #[test]
    fn test_cooldown_decay_requires_idle() {
        let (engine, _dir) = engine(100);
        let mut ps = ProcessState::new(3);
        ps.escalate(IsolationState::Isolated);
        let now = Utc::now();
        ps.touch(now);
        assert!(engine
            .maybe_cooldown_decay(&mut ps, now, Duration::seconds(60))
            .is_none());
        let later = now + Duration::seconds(120);
        let d = engine.maybe_cooldown_decay(&mut ps, later, Duration::seconds(60));
        assert!(d.is_some());
        assert_eq!(ps.current(), IsolationState::Pressure);
    }

    #[test]
    fn test_cooldown_decay_one_rung_per_cooldown() {
        let (engine, _dir) = engine(100);
        let mut ps = ProcessState::new(6);
        ps.escalate(IsolationState::Frozen);
        let start = Utc::now();
        ps.touch(start);
        let cooldown = Duration::seconds(60);

        let idle = start + Duration::seconds(120);
        assert!(engine.maybe_cooldown_decay(&mut ps, idle, cooldown).is_some());
        assert_eq!(ps.current(), IsolationState::Isolated);

        // The next tick arrives a second later; the rung just vacated must
        // not cascade off the same idle period.
        let next_tick = idle + Duration::seconds(1);
        assert!(engine.maybe_cooldown_decay(&mut ps, next_tick, cooldown).is_none());
        assert_eq!(ps.current(), IsolationState::Isolated);

        // A full further cooldown releases the next rung.
        let later = idle + Duration::seconds(61);
        assert!(engine.maybe_cooldown_decay(&mut ps, later, cooldown).is_some());
        assert_eq!(ps.current(), IsolationState::Pressure);
    }

    #[test]
    fn test_rejected_decision_returns_tokens() {
        let dir = tempdir().expect("tempdir");
        let ledger = Ledger::open(&dir.path().join("ledger.jsonl")).expect("ledger");
        let budget = Arc::new(BudgetBucket::new(100));
        let engine = EscalationEngine::new(
            "test-node",
            Weights::default(),
            Thresholds::default(),
            Arc::new(ConstitutionalKernel::new(Bounds::default(), false)),
            Arc::new(ledger),
            Arc::clone(&budget),
            Arc::new(Metrics::new()),
            Box::new(NullContainment),
            None,
        );
        let mut ps = ProcessState::new(5);
        // anomaly 2.5 clears the TERMINATED threshold (cost 50) but fails the
        // unit-range bounds check; the consumed tokens must come back.
        let r = engine.consider(
            &mut ps,
            Inputs {
                anomaly_score: 2.5,
                ..Default::default()
            },
        );
        assert!(r.is_none());
        assert_eq!(ps.current(), IsolationState::Normal);
        assert_eq!(budget.remaining(), 100);
    }

    #[test]
    fn test_operator_reset_walks_every_rung() {
        let (engine, _dir) = engine(100);
        let mut ps = ProcessState::new(4);
        ps.escalate(IsolationState::Quarantined);
        let decisions = engine.operator_reset(&mut ps);
        assert_eq!(decisions.len(), 4, "QUARANTINED is four rungs above NORMAL");
        assert_eq!(ps.current(), IsolationState::Normal);
        // Each decay decision chains to the previous one.
        for pair in decisions.windows(2) {
            assert_eq!(pair[1].parent_hash, pair[0].decision_hash);
        }
    }
}
