// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025-2026 Reflexd Contributors

//! Isolation state model shared across all reflexd modules.
//!
//! Every observed process carries an [`IsolationState`] and a [`ProcessState`]
//! record. States are strictly ordered; the escalation engine may only move a
//! process *up* the ladder. The only way down is the explicit decay path
//! ([`ProcessState::decay_one`]) or an operator override, both separately
//! audited. This monotonicity is the load-bearing invariant of the agent.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Containment state ladder, ordered from least to most severe.
///
/// Implements `Ord` so `Terminated > Quarantined > ... > Normal`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum IsolationState {
    Normal,
    Pressure,
    Isolated,
    Frozen,
    Quarantined,
    Terminated,
}

impl fmt::Display for IsolationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IsolationState::Normal => write!(f, "NORMAL"),
            IsolationState::Pressure => write!(f, "PRESSURE"),
            IsolationState::Isolated => write!(f, "ISOLATED"),
            IsolationState::Frozen => write!(f, "FROZEN"),
            IsolationState::Quarantined => write!(f, "QUARANTINED"),
            IsolationState::Terminated => write!(f, "TERMINATED"),
        }
    }
}

impl IsolationState {
    pub fn as_u8(self) -> u8 {
        match self {
            IsolationState::Normal => 0,
            IsolationState::Pressure => 1,
            IsolationState::Isolated => 2,
            IsolationState::Frozen => 3,
            IsolationState::Quarantined => 4,
            IsolationState::Terminated => 5,
        }
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(IsolationState::Normal),
            1 => Some(IsolationState::Pressure),
            2 => Some(IsolationState::Isolated),
            3 => Some(IsolationState::Frozen),
            4 => Some(IsolationState::Quarantined),
            5 => Some(IsolationState::Terminated),
            _ => None,
        }
    }

    /// Budget tokens consumed to transition *into* this state.
    ///
    /// Strictly increasing with severity so a burst of terminations drains
    /// the bucket far faster than a burst of pressure marks.
    pub fn token_cost(self) -> u64 {
        match self {
            IsolationState::Normal => 0,
            IsolationState::Pressure => 1,
            IsolationState::Isolated => 5,
            IsolationState::Frozen => 10,
            IsolationState::Quarantined => 20,
            IsolationState::Terminated => 50,
        }
    }

    /// Defender utility U(s) for the camouflage control law.
    pub fn defender_utility(self) -> f64 {
        match self {
            IsolationState::Normal => 0.0,
            IsolationState::Pressure => 0.2,
            IsolationState::Isolated => 0.5,
            IsolationState::Frozen => 0.7,
            IsolationState::Quarantined => 0.9,
            IsolationState::Terminated => 1.0,
        }
    }

    /// One step down the ladder, saturating at Normal.
    pub fn step_down(self) -> Self {
        IsolationState::from_u8(self.as_u8().saturating_sub(1)).unwrap_or(IsolationState::Normal)
    }
}

/// Per-PID containment record. One per actively-observed process.
///
/// Created on the first kernel event for a PID, mutated only by the
/// escalation engine (and the operator override path), evicted after an
/// idle timeout by the owning worker.
#[derive(Debug, Clone)]
pub struct ProcessState {
    pub pid: u32,
    current: IsolationState,
    /// EWMA anomaly pressure, maintained by the accumulator.
    pub pressure: f64,
    pub last_event: DateTime<Utc>,
    /// When the last cooldown decay fired. Each rung requires a full cooldown
    /// of quiet measured from here or from `last_event`, whichever is later.
    pub last_decay: Option<DateTime<Utc>>,
    /// Set by an operator `pin` command; pinned PIDs skip autonomous escalation.
    pub pinned: bool,
}

impl ProcessState {
    pub fn new(pid: u32) -> Self {
        Self {
            pid,
            current: IsolationState::Normal,
            pressure: 0.0,
            last_event: Utc::now(),
            last_decay: None,
            pinned: false,
        }
    }

    pub fn current(&self) -> IsolationState {
        self.current
    }

    /// Record event activity for idle-eviction and cooldown bookkeeping.
    pub fn touch(&mut self, at: DateTime<Utc>) {
        self.last_event = at;
    }

    /// Apply an escalation. Returns the (from, to) pair iff `target` is
    /// strictly above the current state; a target at or below the current
    /// state is never applied here; that is what the decay path is for.
    pub fn escalate(&mut self, target: IsolationState) -> Option<(IsolationState, IsolationState)> {
        if target <= self.current {
            return None;
        }
        let from = self.current;
        self.current = target;
        Some((from, target))
    }

    /// The audited decay path: one step down the ladder after a cooldown.
    /// Never called as a side effect of severity computation.
    pub fn decay_one(&mut self) -> Option<(IsolationState, IsolationState)> {
        if self.current == IsolationState::Normal {
            return None;
        }
        let from = self.current;
        self.current = self.current.step_down();
        Some((from, self.current))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_ordering() {
        assert!(IsolationState::Normal < IsolationState::Pressure);
        assert!(IsolationState::Pressure < IsolationState::Isolated);
        assert!(IsolationState::Isolated < IsolationState::Frozen);
        assert!(IsolationState::Frozen < IsolationState::Quarantined);
        assert!(IsolationState::Quarantined < IsolationState::Terminated);
    }

    #[test]
    fn test_costs_strictly_increase() {
        let ladder = [
            IsolationState::Normal,
            IsolationState::Pressure,
            IsolationState::Isolated,
            IsolationState::Frozen,
            IsolationState::Quarantined,
            IsolationState::Terminated,
        ];
        for pair in ladder.windows(2) {
            assert!(pair[0].token_cost() < pair[1].token_cost());
        }
    }

    #[test]
    fn test_utility_monotone() {
        assert_eq!(IsolationState::Normal.defender_utility(), 0.0);
        assert_eq!(IsolationState::Terminated.defender_utility(), 1.0);
        assert!(
            IsolationState::Frozen.defender_utility()
                > IsolationState::Isolated.defender_utility()
        );
    }

    #[test]
    fn test_escalate_refuses_non_increase() {
        let mut ps = ProcessState::new(42);
        assert!(ps.escalate(IsolationState::Isolated).is_some());
        assert!(ps.escalate(IsolationState::Isolated).is_none());
        assert!(ps.escalate(IsolationState::Pressure).is_none());
        assert_eq!(ps.current(), IsolationState::Isolated);
    }

    #[test]
    fn test_decay_steps_down_one_level() {
        let mut ps = ProcessState::new(7);
        ps.escalate(IsolationState::Frozen);
        assert_eq!(
            ps.decay_one(),
            Some((IsolationState::Frozen, IsolationState::Isolated))
        );
        assert_eq!(ps.current(), IsolationState::Isolated);
    }

    #[test]
    fn test_decay_stops_at_normal() {
        let mut ps = ProcessState::new(7);
        assert!(ps.decay_one().is_none());
        assert_eq!(ps.current(), IsolationState::Normal);
    }

    #[test]
    fn test_roundtrip_u8() {
        for v in 0..=5u8 {
            assert_eq!(IsolationState::from_u8(v).unwrap().as_u8(), v);
        }
        assert!(IsolationState::from_u8(6).is_none());
    }

}
