// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025-2026 Reflexd Contributors

//! Kernel event intake and the per-PID worker pool.
//!
//! A dedicated reader task decodes fixed-size binary records from the kernel
//! event source and fans them out to a bounded pool of workers, sharded by
//! `pid % worker_count` so each PID's state is only ever touched by one
//! worker and needs no lock. A full shard queue drops the event with a
//! counter; fresh events matter more than complete history. Malformed
//! records are logged and skipped, never fatal.
//!
//! Each worker runs the scoring pipeline per event: feature window update,
//! baseline score, EWMA pressure, quorum signal, then hands the evidence to
//! the escalation engine. Decoy connections arrive on the same shard channel
//! as synthetic maximum-anomaly observations.

use crate::baseline::{BaselineStore, Scorer};
use crate::camouflage::DecoyEvent;
use crate::escalation::{Accumulator, EscalationEngine, Inputs};
use crate::gossip::OutboundObservation;
use crate::metrics::Metrics;
use crate::quorum::{Observation, QuorumEvaluator};
use crate::state::{IsolationState, ProcessState};
use anyhow::{bail, Result};
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{mpsc, oneshot, watch};

/// Wire size of one kernel event record.
pub const EVENT_RECORD_LEN: usize = 24;

/// Number of feature dimensions fed to the anomaly scorer.
pub const FEATURE_DIM: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Exec,
    FileOpen,
    NetConnect,
    PrivChange,
    PtraceAttach,
    ModuleLoad,
}

impl EventType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(EventType::Exec),
            2 => Some(EventType::FileOpen),
            3 => Some(EventType::NetConnect),
            4 => Some(EventType::PrivChange),
            5 => Some(EventType::PtraceAttach),
            6 => Some(EventType::ModuleLoad),
            _ => None,
        }
    }

    /// Feature dimension this event contributes to.
    fn feature_index(self) -> usize {
        match self {
            EventType::Exec | EventType::ModuleLoad => 0,
            EventType::FileOpen => 1,
            EventType::NetConnect => 2,
            EventType::PrivChange | EventType::PtraceAttach => 3,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct KernelEvent {
    pub pid: u32,
    pub uid: u32,
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
}

/// Decode one fixed-size record: `{pid:u32, uid:u32, event_type:u8, pad[7],
/// timestamp_ns:i64}`, all little-endian.
pub fn decode_record(buf: &[u8]) -> Result<KernelEvent> {
    if buf.len() != EVENT_RECORD_LEN {
        bail!("record is {} bytes, want {}", buf.len(), EVENT_RECORD_LEN);
    }
    let pid = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
    let uid = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
    let Some(event_type) = EventType::from_u8(buf[8]) else {
        bail!("unknown event type {}", buf[8]);
    };
    let ts_ns = i64::from_le_bytes([
        buf[16], buf[17], buf[18], buf[19], buf[20], buf[21], buf[22], buf[23],
    ]);
    Ok(KernelEvent {
        pid,
        uid,
        event_type,
        timestamp: Utc.timestamp_nanos(ts_ns),
    })
}

/// Messages delivered to a worker shard.
pub enum WorkerMsg {
    Event(KernelEvent),
    Decoy(DecoyEvent),
    Command(WorkerCommand),
}

/// Operator commands, routed to the shard that owns the PID (snapshots go to
/// every shard).
pub enum WorkerCommand {
    Reset {
        pid: u32,
        reply: oneshot::Sender<usize>,
    },
    Pin {
        pid: u32,
        pinned: bool,
        reply: oneshot::Sender<bool>,
    },
    Snapshot {
        reply: oneshot::Sender<Vec<ProcessSummary>>,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessSummary {
    pub pid: u32,
    pub state: String,
    pub pressure: f64,
    pub pinned: bool,
    pub last_event: DateTime<Utc>,
}

pub fn shard_for(pid: u32, worker_count: usize) -> usize {
    pid as usize % worker_count.max(1)
}

/// Read fixed-size records from the kernel event source and fan them out.
/// Shard-queue overflow is a counted drop, never a stall of the reader.
pub async fn run_reader<R: AsyncRead + Unpin>(
    mut source: R,
    shards: Vec<mpsc::Sender<WorkerMsg>>,
    metrics: Arc<Metrics>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut buf = [0u8; EVENT_RECORD_LEN];
    loop {
        tokio::select! {
            read = source.read_exact(&mut buf) => {
                match read {
                    Ok(_) => {}
                    Err(e) => {
                        eprintln!("[EVENTS] reader stopped: {}", e);
                        return;
                    }
                }
                let event = match decode_record(&buf) {
                    Ok(ev) => ev,
                    Err(e) => {
                        Metrics::inc(&metrics.events_malformed);
                        eprintln!("[EVENTS] malformed record skipped: {:#}", e);
                        continue;
                    }
                };
                let shard = shard_for(event.pid, shards.len());
                if shards[shard].try_send(WorkerMsg::Event(event)).is_err() {
                    Metrics::inc(&metrics.events_dropped_queue_full);
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    eprintln!("[EVENTS] reader stopping");
                    return;
                }
            }
        }
    }
}

/// Route decoy connections onto the owning PID's shard as synthetic events.
pub async fn run_decoy_router(
    mut rx: mpsc::Receiver<DecoyEvent>,
    shards: Vec<mpsc::Sender<WorkerMsg>>,
    metrics: Arc<Metrics>,
) {
    while let Some(event) = rx.recv().await {
        let shard = shard_for(event.pid, shards.len());
        if shards[shard].try_send(WorkerMsg::Decoy(event)).is_err() {
            Metrics::inc(&metrics.events_dropped_queue_full);
        }
    }
}

/// Decaying event-mix window feeding the feature vector. Rates halve every
/// `half_life` of quiet, so the vector tracks recent behavior.
#[derive(Debug, Clone)]
struct FeatureWindow {
    rates: [f64; FEATURE_DIM],
    last: DateTime<Utc>,
}

impl FeatureWindow {
    fn new(at: DateTime<Utc>) -> Self {
        Self {
            rates: [0.0; FEATURE_DIM],
            last: at,
        }
    }

    fn record(&mut self, index: usize, at: DateTime<Utc>) -> [f64; FEATURE_DIM] {
        let dt = (at - self.last).num_milliseconds().max(0) as f64 / 1000.0;
        let factor = 0.5f64.powf(dt / 10.0);
        for r in self.rates.iter_mut() {
            *r *= factor;
        }
        self.rates[index] += 1.0;
        self.last = at;
        self.rates
    }
}

struct TrackedProcess {
    state: ProcessState,
    accumulator: Accumulator,
    window: FeatureWindow,
    process_hash: String,
}

/// Tunables for the worker pipeline, resolved from config at startup.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub pressure_alpha: f64,
    /// Anomaly score at or above which an observation is recorded locally in
    /// the quorum window and shared with peers.
    pub share_threshold: f64,
    pub cooldown: Duration,
    /// NORMAL-state processes idle this long are evicted from tracking.
    pub idle_eviction: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            pressure_alpha: 0.8,
            share_threshold: 0.7,
            cooldown: Duration::seconds(30),
            idle_eviction: Duration::seconds(300),
        }
    }
}

pub struct Worker {
    node_id: String,
    settings: WorkerSettings,
    engine: Arc<EscalationEngine>,
    scorer: Arc<dyn Scorer>,
    baselines: Arc<BaselineStore>,
    quorum: Arc<QuorumEvaluator>,
    gossip_out: Option<mpsc::Sender<OutboundObservation>>,
    metrics: Arc<Metrics>,
    tracked: HashMap<u32, TrackedProcess>,
}

impl Worker {
    pub fn new(
        node_id: &str,
        settings: WorkerSettings,
        engine: Arc<EscalationEngine>,
        scorer: Arc<dyn Scorer>,
        baselines: Arc<BaselineStore>,
        quorum: Arc<QuorumEvaluator>,
        gossip_out: Option<mpsc::Sender<OutboundObservation>>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            node_id: node_id.to_string(),
            settings,
            engine,
            scorer,
            baselines,
            quorum,
            gossip_out,
            metrics,
            tracked: HashMap::new(),
        }
    }

    /// Consume shard messages until the channel closes or shutdown fires,
    /// running cooldown decay and idle eviction on a one-second tick.
    pub async fn run(
        mut self,
        mut rx: mpsc::Receiver<WorkerMsg>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(1));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                msg = rx.recv() => {
                    match msg {
                        Some(WorkerMsg::Event(event)) => self.handle_event(event),
                        Some(WorkerMsg::Decoy(event)) => self.handle_decoy(event),
                        Some(WorkerMsg::Command(cmd)) => self.handle_command(cmd),
                        None => return,
                    }
                }
                _ = ticker.tick() => self.tick(Utc::now()),
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }

    fn entry(&mut self, pid: u32, at: DateTime<Utc>) -> &mut TrackedProcess {
        let alpha = self.settings.pressure_alpha;
        let metrics = Arc::clone(&self.metrics);
        let tracked_len = self.tracked.len();
        self.tracked.entry(pid).or_insert_with(|| {
            metrics.tracked_pids.store(tracked_len as u64 + 1, Ordering::Relaxed);
            TrackedProcess {
                state: ProcessState::new(pid),
                accumulator: Accumulator::new(alpha),
                window: FeatureWindow::new(at),
                process_hash: process_hash(pid),
            }
        })
    }

    pub(crate) fn handle_event(&mut self, event: KernelEvent) {
        Metrics::inc(&self.metrics.events_processed);
        let (features, hash, utility) = {
            let tracked = self.entry(event.pid, event.timestamp);
            tracked.state.touch(event.timestamp);
            let features = tracked
                .window
                .record(event.event_type.feature_index(), event.timestamp);
            (
                features,
                tracked.process_hash.clone(),
                tracked.state.current().defender_utility(),
            )
        };

        // Score against the baseline as it was before this event, then fold
        // the event in.
        let baseline = self.baselines.get(&hash);
        let anomaly = self.scorer.score(&features, baseline.as_ref());
        Metrics::inc(&self.metrics.anomaly_evals);
        self.baselines.observe(&hash, &features);

        if anomaly >= self.settings.share_threshold {
            self.quorum.record(
                &hash,
                Observation {
                    node_id: self.node_id.clone(),
                    anomaly_score: anomaly,
                    at: event.timestamp,
                },
            );
            if let Some(out) = &self.gossip_out {
                let _ = out.try_send(OutboundObservation {
                    process_hash: hash.clone(),
                    anomaly_score: anomaly,
                    impact_score: utility,
                });
            }
        }

        let quorum_signal = self.quorum.signal(&hash);
        let Some(tracked) = self.tracked.get_mut(&event.pid) else {
            return;
        };
        let pressure = tracked.accumulator.update(anomaly);
        tracked.state.pressure = pressure;
        let inputs = Inputs {
            anomaly_score: anomaly,
            quorum_signal,
            integrity_score: 0.0,
            pressure_score: pressure,
        };
        self.engine.consider(&mut tracked.state, inputs);
    }

    /// A decoy connection is hard evidence: maximum anomaly, integrity signal
    /// raised, recorded in the quorum window like any other observation.
    pub(crate) fn handle_decoy(&mut self, event: DecoyEvent) {
        Metrics::inc(&self.metrics.events_processed);
        let hash = {
            let tracked = self.entry(event.pid, event.at);
            tracked.state.touch(event.at);
            tracked.process_hash.clone()
        };
        self.quorum.record(
            &hash,
            Observation {
                node_id: self.node_id.clone(),
                anomaly_score: 1.0,
                at: event.at,
            },
        );
        let quorum_signal = self.quorum.signal(&hash);
        let Some(tracked) = self.tracked.get_mut(&event.pid) else {
            return;
        };
        let pressure = tracked.accumulator.update(1.0);
        tracked.state.pressure = pressure;
        let inputs = Inputs {
            anomaly_score: 1.0,
            quorum_signal,
            integrity_score: 1.0,
            pressure_score: pressure,
        };
        self.engine.consider(&mut tracked.state, inputs);
    }

    pub(crate) fn handle_command(&mut self, cmd: WorkerCommand) {
        match cmd {
            WorkerCommand::Reset { pid, reply } => {
                let steps = match self.tracked.get_mut(&pid) {
                    Some(tracked) => {
                        tracked.state.pinned = false;
                        self.engine.operator_reset(&mut tracked.state).len()
                    }
                    None => 0,
                };
                let _ = reply.send(steps);
            }
            WorkerCommand::Pin { pid, pinned, reply } => {
                let known = match self.tracked.get_mut(&pid) {
                    Some(tracked) => {
                        tracked.state.pinned = pinned;
                        true
                    }
                    None => false,
                };
                let _ = reply.send(known);
            }
            WorkerCommand::Snapshot { reply } => {
                let summaries = self
                    .tracked
                    .values()
                    .map(|t| ProcessSummary {
                        pid: t.state.pid,
                        state: t.state.current().to_string(),
                        pressure: t.state.pressure,
                        pinned: t.state.pinned,
                        last_event: t.state.last_event,
                    })
                    .collect();
                let _ = reply.send(summaries);
            }
        }
    }

    /// Periodic maintenance: audited cooldown decay, then idle eviction of
    /// NORMAL-state processes.
    pub(crate) fn tick(&mut self, now: DateTime<Utc>) {
        for tracked in self.tracked.values_mut() {
            self.engine
                .maybe_cooldown_decay(&mut tracked.state, now, self.settings.cooldown);
        }
        let idle = self.settings.idle_eviction;
        self.tracked.retain(|_, t| {
            t.state.current() != IsolationState::Normal || now - t.state.last_event < idle
        });
        self.metrics
            .tracked_pids
            .store(self.tracked.len() as u64, Ordering::Relaxed);
    }

    #[cfg(test)]
    fn state_of(&self, pid: u32) -> Option<IsolationState> {
        self.tracked.get(&pid).map(|t| t.state.current())
    }
}

/// One-way binary identity for a PID: the sha256 of its executable path.
/// A vanished or unreadable process falls back to a PID-derived hash so the
/// pipeline still has a stable key for the process's remaining lifetime.
pub fn process_hash(pid: u32) -> String {
    let exe = std::fs::read_link(format!("/proc/{}/exe", pid))
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_else(|_| format!("pid:{}", pid));
    hex::encode(Sha256::digest(exe.as_bytes()))
}
