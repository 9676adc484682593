// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025-2026 Reflexd Contributors

//! Constitutional kernel: invariant checks on every escalation decision.
//!
//! Before any containment transition takes effect it must pass four checks:
//!
//! 1. **Time monotonicity**: a decision timestamped earlier than the previous
//!    accepted decision is rejected (wall-clock manipulation detection).
//!    Large *forward* skew is logged but allowed.
//! 2. **Bounded inputs**: severity ∈ [0, 10], every named numeric input
//!    ∈ [0, 1], and NaN/Inf anywhere is an immediate rejection.
//! 3. **Evidence**: a decision with an empty inputs map is rejected; every
//!    escalation must carry the evidence that produced it.
//! 4. **Determinism**: a canonical byte encoding of the decision is SHA-256
//!    hashed; the previous decision's hash becomes this one's parent, forming
//!    a tamper-evident chain independent of any storage engine.
//!
//! In strict mode (test/verification builds only) a violation aborts the
//! process. In production a violation is logged, counted, and the decision is
//! simply not applied; the process stays at its current state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

use crate::state::IsolationState;

/// Typed constitutional violation. The wire name (snake_case) is what lands
/// in logs and rejection records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Violation {
    NonDeterministic(String),
    UnboundedParameter(String),
    NonMonotonicTime(String),
    MissingAudit(String),
    NanOrInf(String),
}

impl Violation {
    pub fn wire_name(&self) -> &'static str {
        match self {
            Violation::NonDeterministic(_) => "non_deterministic_decision",
            Violation::UnboundedParameter(_) => "unbounded_parameter",
            Violation::NonMonotonicTime(_) => "non_monotonic_time",
            Violation::MissingAudit(_) => "missing_audit_trail",
            Violation::NanOrInf(_) => "nan_inf_detected",
        }
    }

    fn message(&self) -> &str {
        match self {
            Violation::NonDeterministic(m)
            | Violation::UnboundedParameter(m)
            | Violation::NonMonotonicTime(m)
            | Violation::MissingAudit(m)
            | Violation::NanOrInf(m) => m,
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "constitutional violation [{}]: {}",
            self.wire_name(),
            self.message()
        )
    }
}

impl std::error::Error for Violation {}

/// An escalation decision with its constitutional proof. Immutable once
/// validated; serialized into the audit ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub pid: u32,
    pub from_state: IsolationState,
    pub to_state: IsolationState,
    pub severity: f64,
    pub timestamp: DateTime<Utc>,
    pub node_id: String,
    /// Named numeric evidence (anomaly_score, quorum_signal, pressure_score, ...).
    /// BTreeMap so the canonical encoding is order-independent.
    pub inputs: BTreeMap<String, f64>,
    #[serde(default)]
    pub decision_hash: String,
    #[serde(default)]
    pub parent_hash: String,
    #[serde(default)]
    pub constitutionally_valid: bool,
}

impl Decision {
    pub fn new(
        pid: u32,
        from_state: IsolationState,
        to_state: IsolationState,
        severity: f64,
        node_id: &str,
        inputs: BTreeMap<String, f64>,
    ) -> Self {
        Self {
            pid,
            from_state,
            to_state,
            severity,
            timestamp: Utc::now(),
            node_id: node_id.to_string(),
            inputs,
            decision_hash: String::new(),
            parent_hash: String::new(),
            constitutionally_valid: false,
        }
    }

    /// Canonical, order-independent byte encoding of the decision fields that
    /// participate in the hash. Severity is fixed to 8 decimal places so two
    /// nodes computing the same decision encode identical bytes.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut canonical: BTreeMap<&str, serde_json::Value> = BTreeMap::new();
        canonical.insert("pid", self.pid.into());
        canonical.insert("from_state", self.from_state.as_u8().into());
        canonical.insert("to_state", self.to_state.as_u8().into());
        canonical.insert("severity", format!("{:.8}", self.severity).into());
        canonical.insert(
            "timestamp",
            self.timestamp.timestamp_nanos_opt().unwrap_or(0).into(),
        );
        canonical.insert("node_id", self.node_id.as_str().into());
        let inputs: BTreeMap<&str, serde_json::Value> = self
            .inputs
            .iter()
            .map(|(k, v)| (k.as_str(), serde_json::json!(format!("{:.8}", v))))
            .collect();
        canonical.insert("inputs", serde_json::json!(inputs));
        // BTreeMap serializes in sorted key order, so this is deterministic.
        serde_json::to_vec(&canonical).unwrap_or_default()
    }

    /// SHA-256 of the canonical bytes, hex-encoded.
    pub fn compute_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.canonical_bytes());
        hex::encode(hasher.finalize())
    }
}

/// Ceiling of the composite severity scale. Config validation holds the
/// weight sum (and the terminal threshold) at or under this so a maximal
/// decision is always constitutionally representable.
pub const SEVERITY_BOUND: f64 = 10.0;

/// Allowed parameter ranges. Inputs outside these bounds are rejected with
/// `unbounded_parameter`.
#[derive(Debug, Clone)]
pub struct Bounds {
    pub severity_max: f64,
    pub input_max: f64,
    pub forward_skew_tolerance: Duration,
    /// Backward skew at most this large is lock-ordering between shards, not
    /// clock manipulation, and is clamped to the chain head instead of
    /// rejected.
    pub backward_skew_tolerance: Duration,
}

impl Default for Bounds {
    fn default() -> Self {
        Self {
            severity_max: SEVERITY_BOUND,
            input_max: 1.0,
            forward_skew_tolerance: Duration::from_secs(5),
            backward_skew_tolerance: Duration::from_secs(1),
        }
    }
}

struct ChainHead {
    last_timestamp: DateTime<Utc>,
    last_hash: String,
    verified: u64,
    violations: u64,
}

/// Validates decisions and maintains the global hash-chain head.
///
/// The chain head is the only piece of shared mutable state; validation is a
/// short critical section behind a single mutex, as decisions are low
/// frequency compared to events.
pub struct ConstitutionalKernel {
    bounds: Bounds,
    strict: bool,
    head: Mutex<ChainHead>,
}

impl ConstitutionalKernel {
    /// `strict` converts violations into aborts; only for test/verification
    /// builds. Production runs with `strict = false`.
    pub fn new(bounds: Bounds, strict: bool) -> Self {
        Self {
            bounds,
            strict,
            head: Mutex::new(ChainHead {
                last_timestamp: Utc::now(),
                last_hash: String::new(),
                verified: 0,
                violations: 0,
            }),
        }
    }

    /// Validate a decision. On success the decision's hash, parent hash and
    /// `constitutionally_valid` flag are filled in and the chain head
    /// advances. On violation the chain head is untouched and the caller must
    /// not apply the transition.
    pub fn validate(&self, decision: &mut Decision) -> Result<(), Violation> {
        let mut head = self.head.lock().expect("constitution mutex poisoned");

        // Decisions are stamped at construction, before this lock is taken,
        // so two shards can arrive out of stamp order. Skew within tolerance
        // is clamped to the head; anything larger hits the monotonicity check.
        if decision.timestamp < head.last_timestamp {
            let skew = (head.last_timestamp - decision.timestamp)
                .to_std()
                .unwrap_or_default();
            if skew <= self.bounds.backward_skew_tolerance {
                decision.timestamp = head.last_timestamp;
            }
        }

        let result = Self::check(&self.bounds, &head, decision);
        match result {
            Ok(()) => {
                decision.decision_hash = decision.compute_hash();
                decision.parent_hash = head.last_hash.clone();
                decision.constitutionally_valid = true;
                head.last_hash = decision.decision_hash.clone();
                head.last_timestamp = decision.timestamp;
                head.verified += 1;
                Ok(())
            }
            Err(v) => {
                head.violations += 1;
                eprintln!(
                    "[CONSTITUTION] {} (pid={} total_violations={})",
                    v, decision.pid, head.violations
                );
                if self.strict {
                    drop(head);
                    panic!("constitutional violation in strict mode: {}", v);
                }
                Err(v)
            }
        }
    }

    fn check(bounds: &Bounds, head: &ChainHead, d: &Decision) -> Result<(), Violation> {
        // Time monotonicity: strictly-earlier rejects, forward skew only logs.
        if d.timestamp < head.last_timestamp {
            return Err(Violation::NonMonotonicTime(format!(
                "time went backwards: {} < {}",
                d.timestamp.to_rfc3339(),
                head.last_timestamp.to_rfc3339()
            )));
        }
        let skew = (d.timestamp - head.last_timestamp)
            .to_std()
            .unwrap_or_default();
        if skew > bounds.forward_skew_tolerance {
            eprintln!(
                "[CONSTITUTION] large forward timestamp skew: {:?} (tolerance {:?})",
                skew, bounds.forward_skew_tolerance
            );
        }

        // NaN/Inf anywhere is its own violation class.
        if !d.severity.is_finite() {
            return Err(Violation::NanOrInf(format!(
                "severity is not finite: {}",
                d.severity
            )));
        }
        for (name, value) in &d.inputs {
            if !value.is_finite() {
                return Err(Violation::NanOrInf(format!(
                    "input {} is not finite: {}",
                    name, value
                )));
            }
        }

        // Bounded inputs.
        if d.severity < 0.0 || d.severity > bounds.severity_max {
            return Err(Violation::UnboundedParameter(format!(
                "severity {:.2} outside [0.00, {:.2}]",
                d.severity, bounds.severity_max
            )));
        }
        for (name, value) in &d.inputs {
            if *value < 0.0 || *value > bounds.input_max {
                return Err(Violation::UnboundedParameter(format!(
                    "input {} = {:.4} outside [0.0, {:.1}]",
                    name, value, bounds.input_max
                )));
            }
        }

        // Evidence requirement: no inputs, no escalation.
        if d.inputs.is_empty() {
            return Err(Violation::MissingAudit(
                "decision carries no recorded inputs".to_string(),
            ));
        }

        Ok(())
    }

    /// Hash of the most recently accepted decision (empty before the first).
    pub fn chain_head(&self) -> String {
        self.head
            .lock()
            .expect("constitution mutex poisoned")
            .last_hash
            .clone()
    }

    pub fn stats(&self) -> (u64, u64) {
        let head = self.head.lock().expect("constitution mutex poisoned");
        (head.verified, head.violations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn evidence() -> BTreeMap<String, f64> {
        let mut m = BTreeMap::new();
        m.insert("anomaly_score".to_string(), 0.7);
        m.insert("quorum_signal".to_string(), 0.5);
        m.insert("pressure_score".to_string(), 0.6);
        m
    }

    fn kernel() -> ConstitutionalKernel {
        ConstitutionalKernel::new(Bounds::default(), false)
    }

    #[test]
    fn test_valid_decision_accepted() {
        let ck = kernel();
        let mut d = Decision::new(
            100,
            IsolationState::Normal,
            IsolationState::Isolated,
            5.5,
            "node-a",
            evidence(),
        );
        ck.validate(&mut d).unwrap();
        assert!(d.constitutionally_valid);
        assert_eq!(d.decision_hash.len(), 64);
        assert_eq!(d.parent_hash, "");
        assert_eq!(ck.chain_head(), d.decision_hash);
    }

    #[test]
    fn test_chain_links_consecutive_decisions() {
        let ck = kernel();
        let mut d1 = Decision::new(
            1,
            IsolationState::Normal,
            IsolationState::Pressure,
            1.5,
            "node-a",
            evidence(),
        );
        ck.validate(&mut d1).unwrap();
        let mut d2 = Decision::new(
            1,
            IsolationState::Pressure,
            IsolationState::Isolated,
            4.0,
            "node-a",
            evidence(),
        );
        ck.validate(&mut d2).unwrap();
        assert_eq!(d2.parent_hash, d1.decision_hash);
    }

    #[test]
    fn test_corrupting_a_field_breaks_the_hash() {
        let mut d = Decision::new(
            1,
            IsolationState::Normal,
            IsolationState::Pressure,
            1.5,
            "node-a",
            evidence(),
        );
        let original = d.compute_hash();
        d.severity = 1.6;
        assert_ne!(d.compute_hash(), original);
    }

    #[test]
    fn test_hash_is_deterministic() {
        let d = Decision::new(
            9,
            IsolationState::Normal,
            IsolationState::Frozen,
            7.0,
            "node-b",
            evidence(),
        );
        assert_eq!(d.compute_hash(), d.compute_hash());
    }

    #[test]
    fn test_severity_out_of_bounds_rejected() {
        let ck = kernel();
        let mut d = Decision::new(
            1,
            IsolationState::Normal,
            IsolationState::Terminated,
            15.0,
            "node-a",
            evidence(),
        );
        let err = ck.validate(&mut d).unwrap_err();
        assert_eq!(err.wire_name(), "unbounded_parameter");
        assert!(!d.constitutionally_valid);
    }

    #[test]
    fn test_nan_severity_rejected() {
        let ck = kernel();
        let mut d = Decision::new(
            1,
            IsolationState::Normal,
            IsolationState::Pressure,
            f64::NAN,
            "node-a",
            evidence(),
        );
        let err = ck.validate(&mut d).unwrap_err();
        assert_eq!(err.wire_name(), "nan_inf_detected");
    }

    #[test]
    fn test_infinite_input_rejected() {
        let ck = kernel();
        let mut inputs = evidence();
        inputs.insert("pressure_score".to_string(), f64::INFINITY);
        let mut d = Decision::new(
            1,
            IsolationState::Normal,
            IsolationState::Pressure,
            1.0,
            "node-a",
            inputs,
        );
        let err = ck.validate(&mut d).unwrap_err();
        assert_eq!(err.wire_name(), "nan_inf_detected");
    }

    #[test]
    fn test_input_out_of_unit_range_rejected() {
        let ck = kernel();
        let mut inputs = evidence();
        inputs.insert("anomaly_score".to_string(), 1.7);
        let mut d = Decision::new(
            1,
            IsolationState::Normal,
            IsolationState::Pressure,
            1.0,
            "node-a",
            inputs,
        );
        let err = ck.validate(&mut d).unwrap_err();
        assert_eq!(err.wire_name(), "unbounded_parameter");
    }

    #[test]
    fn test_empty_inputs_rejected() {
        let ck = kernel();
        let mut d = Decision::new(
            1,
            IsolationState::Normal,
            IsolationState::Pressure,
            1.0,
            "node-a",
            BTreeMap::new(),
        );
        let err = ck.validate(&mut d).unwrap_err();
        assert_eq!(err.wire_name(), "missing_audit_trail");
    }

    #[test]
    fn test_backwards_timestamp_rejected() {
        let ck = kernel();
        let mut d1 = Decision::new(
            1,
            IsolationState::Normal,
            IsolationState::Pressure,
            1.5,
            "node-a",
            evidence(),
        );
        ck.validate(&mut d1).unwrap();

        let mut d2 = Decision::new(
            1,
            IsolationState::Pressure,
            IsolationState::Isolated,
            4.0,
            "node-a",
            evidence(),
        );
        d2.timestamp = d1.timestamp - ChronoDuration::seconds(10);
        let err = ck.validate(&mut d2).unwrap_err();
        assert_eq!(err.wire_name(), "non_monotonic_time");
        // Chain head must not advance on rejection.
        assert_eq!(ck.chain_head(), d1.decision_hash);
    }

    #[test]
    fn test_sub_tolerance_backward_skew_clamped_not_rejected() {
        let ck = kernel();
        let mut d1 = Decision::new(
            1,
            IsolationState::Normal,
            IsolationState::Pressure,
            1.5,
            "node-a",
            evidence(),
        );
        ck.validate(&mut d1).unwrap();

        // A decision stamped by another shard just before d1 acquired the
        // lock: milliseconds behind the head, not a clock anomaly.
        let mut d2 = Decision::new(
            2,
            IsolationState::Normal,
            IsolationState::Pressure,
            1.5,
            "node-a",
            evidence(),
        );
        d2.timestamp = d1.timestamp - ChronoDuration::milliseconds(200);
        ck.validate(&mut d2).unwrap();
        assert!(d2.timestamp >= d1.timestamp, "clamped to the chain head");
        assert_eq!(d2.parent_hash, d1.decision_hash);
    }

    #[test]
    fn test_rejection_does_not_count_as_verified() {
        let ck = kernel();
        let mut bad = Decision::new(
            1,
            IsolationState::Normal,
            IsolationState::Pressure,
            99.0,
            "node-a",
            evidence(),
        );
        let _ = ck.validate(&mut bad);
        let (verified, violations) = ck.stats();
        assert_eq!(verified, 0);
        assert_eq!(violations, 1);
    }

    #[test]
    #[should_panic(expected = "strict mode")]
    fn test_strict_mode_aborts() {
        let ck = ConstitutionalKernel::new(Bounds::default(), true);
        let mut d = Decision::new(
            1,
            IsolationState::Normal,
            IsolationState::Pressure,
            f64::NAN,
            "node-a",
            evidence(),
        );
        let _ = ck.validate(&mut d);
    }
}
