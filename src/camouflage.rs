// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025-2026 Reflexd Contributors

//! Defensive deception for processes that have climbed the isolation ladder.
//!
//! Three measures, gated by state:
//!   ISOLATED+    port shuffle: a deterministic per-(node, pid, epoch) port
//!                is published via an atomically-written hint file so
//!                legitimate collaborators can follow the rotation without a
//!                side channel.
//!   FROZEN+      loopback decoy listener: any connection is an active
//!                detection event: closed without a reply and fed back into
//!                the event pipeline as a synthetic anomaly observation.
//!   QUARANTINED+ IP-rotation hint file for network-layer collaborators.
//!
//! The attacker mutation-rate estimate follows the control law
//! `m ← clamp(m + λ1·A − λ2·(1−U), 0, 1)`. Epoch length shrinks as m rises:
//! `epoch = max(min_epoch, base_epoch·(1−m))`; faster rotation under
//! sustained pressure.

use crate::escalation::Transition;
use crate::metrics::Metrics;
use crate::state::IsolationState;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};

/// λ parameters of the mutation-rate control law.
#[derive(Debug, Clone, Copy)]
pub struct ControlLaw {
    pub lambda1: f64,
    pub lambda2: f64,
}

impl Default for ControlLaw {
    fn default() -> Self {
        Self {
            lambda1: 0.4,
            lambda2: 0.6,
        }
    }
}

/// One control-law step. Pure; clamped to [0, 1].
pub fn mutation_rate_step(m: f64, anomaly: f64, utility: f64, law: &ControlLaw) -> f64 {
    (m + law.lambda1 * anomaly - law.lambda2 * (1.0 - utility)).clamp(0.0, 1.0)
}

/// Map a composite severity onto an anomaly signal in (0, 1) via
/// `sigmoid(S/S_max)` with `sigmoid(x) = 1/(1+exp(-4(x-0.5)))`.
pub fn anomaly_signal(severity: f64, severity_max: f64) -> f64 {
    if severity_max <= 0.0 {
        return 0.0;
    }
    let x = (severity / severity_max).clamp(0.0, 1.0);
    1.0 / (1.0 + (-4.0 * (x - 0.5)).exp())
}

#[derive(Debug, Clone, Copy)]
pub struct EpochParams {
    pub base_secs: i64,
    pub min_secs: i64,
}

impl Default for EpochParams {
    fn default() -> Self {
        Self {
            base_secs: 3600,
            min_secs: 300,
        }
    }
}

/// `max(min_epoch, floor(base_epoch·(1−m)))`.
pub fn epoch_length_secs(m: f64, p: &EpochParams) -> i64 {
    let length = (p.base_secs as f64 * (1.0 - m)) as i64;
    length.max(p.min_secs)
}

/// Epoch index at a given unix time for a given mutation rate.
pub fn current_epoch(unix_secs: i64, m: f64, p: &EpochParams) -> i64 {
    unix_secs / epoch_length_secs(m, p)
}

/// Deterministic port in `[port_base, port_base + port_range)` from
/// `sha256(node_id || pid_le || epoch_le)`. Pure, so collaborators that know
/// the epoch can predict the assignment.
pub fn deterministic_port(
    node_id: &str,
    pid: u32,
    epoch: i64,
    port_base: u16,
    port_range: u16,
) -> u16 {
    let mut h = Sha256::new();
    h.update(node_id.as_bytes());
    h.update(pid.to_le_bytes());
    h.update((epoch as u64).to_le_bytes());
    let sum = h.finalize();
    let word = u32::from_le_bytes([sum[0], sum[1], sum[2], sum[3]]);
    // Widen before adding; the span is clamped so the result always fits a
    // port number even if base + range was configured past 65536.
    let base = port_base as u32;
    let span = (port_range as u32).max(1).min(65536 - base);
    (base + word % span) as u16
}

/// Settings for the camouflage engine, mapped from the `[camouflage]` config
/// section.
#[derive(Debug, Clone)]
pub struct CamouflageSettings {
    pub enabled: bool,
    pub port_base: u16,
    pub port_range: u16,
    pub decoy_enabled: bool,
    pub decoy_bind_addr: String,
    pub hint_dir: PathBuf,
    pub control_law: ControlLaw,
    pub epoch: EpochParams,
    pub severity_max: f64,
}

impl Default for CamouflageSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            port_base: 32768,
            port_range: 16384,
            decoy_enabled: true,
            decoy_bind_addr: "127.0.0.1".to_string(),
            hint_dir: PathBuf::from("/run/reflexd"),
            control_law: ControlLaw::default(),
            epoch: EpochParams::default(),
            severity_max: 10.0,
        }
    }
}

/// Synthetic anomaly observation emitted for every decoy connection.
#[derive(Debug, Clone)]
pub struct DecoyEvent {
    pub pid: u32,
    pub remote_addr: String,
    pub decoy_port: u16,
    pub at: DateTime<Utc>,
}

#[derive(Serialize)]
struct PortHint {
    pid: u32,
    new_port: u16,
    valid_from: DateTime<Utc>,
    epoch: i64,
    epoch_length_s: i64,
    mutation_rate: f64,
}

#[derive(Serialize)]
struct IpHint {
    pid: u32,
    reason: String,
    severity: f64,
    mutation_rate: f64,
    created_at: DateTime<Utc>,
}

struct ActiveEntry {
    state: IsolationState,
    mutation_rate: f64,
    decoy_port: Option<u16>,
    decoy_task: Option<tokio::task::JoinHandle<()>>,
}

pub struct CamouflageEngine {
    settings: CamouflageSettings,
    node_id: String,
    /// Feeds decoy connections back into the event pipeline. May be absent
    /// in tools that only exercise the pure functions.
    sink: Option<mpsc::Sender<DecoyEvent>>,
    metrics: Arc<Metrics>,
    active: Mutex<HashMap<u32, ActiveEntry>>,
}

impl CamouflageEngine {
    pub fn new(
        settings: CamouflageSettings,
        node_id: &str,
        sink: Option<mpsc::Sender<DecoyEvent>>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            settings,
            node_id: node_id.to_string(),
            sink,
            metrics,
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Apply the measures appropriate for `state`. Idempotent: a PID already
    /// active at this or a higher state is left untouched.
    pub async fn activate(&self, pid: u32, state: IsolationState, severity: f64) {
        if !self.settings.enabled || state < IsolationState::Isolated {
            return;
        }

        // Update the entry under the lock, then do I/O outside it.
        let (mt, already_has_decoy) = {
            let mut active = self.active.lock().expect("camouflage mutex poisoned");
            if let Some(entry) = active.get(&pid) {
                if entry.state >= state {
                    return;
                }
            }
            let entry = active.entry(pid).or_insert(ActiveEntry {
                state,
                mutation_rate: 0.0,
                decoy_port: None,
                decoy_task: None,
            });
            entry.state = state;
            let a = anomaly_signal(severity, self.settings.severity_max);
            entry.mutation_rate = mutation_rate_step(
                entry.mutation_rate,
                a,
                state.defender_utility(),
                &self.settings.control_law,
            );
            (entry.mutation_rate, entry.decoy_port.is_some())
        };

        let epoch = current_epoch(Utc::now().timestamp(), mt, &self.settings.epoch);
        let epoch_len = epoch_length_secs(mt, &self.settings.epoch);

        // Port shuffle (ISOLATED+).
        let new_port = deterministic_port(
            &self.node_id,
            pid,
            epoch,
            self.settings.port_base,
            self.settings.port_range,
        );
        self.write_hint(
            "port_hints.json",
            &PortHint {
                pid,
                new_port,
                valid_from: Utc::now(),
                epoch,
                epoch_length_s: epoch_len,
                mutation_rate: mt,
            },
        );
        eprintln!(
            "[CAMOUFLAGE] port shuffle pid={} port={} epoch_len={}s mt={:.3}",
            pid, new_port, epoch_len, mt
        );

        // Decoy listener (FROZEN+), loopback only by default.
        if state >= IsolationState::Frozen && self.settings.decoy_enabled && !already_has_decoy {
            let decoy_port = deterministic_port(
                &self.node_id,
                pid,
                epoch + 1,
                self.settings.port_base,
                self.settings.port_range,
            );
            let addr = format!("{}:{}", self.settings.decoy_bind_addr, decoy_port);
            match TcpListener::bind(&addr).await {
                Ok(listener) => {
                    let task = tokio::spawn(run_decoy(
                        listener,
                        pid,
                        decoy_port,
                        self.sink.clone(),
                        Arc::clone(&self.metrics),
                    ));
                    let mut active = self.active.lock().expect("camouflage mutex poisoned");
                    if let Some(entry) = active.get_mut(&pid) {
                        entry.decoy_port = Some(decoy_port);
                        entry.decoy_task = Some(task);
                    } else {
                        // Deactivated while we were binding.
                        task.abort();
                    }
                    eprintln!("[CAMOUFLAGE] decoy listening pid={} addr={}", pid, addr);
                }
                Err(e) => {
                    eprintln!("[CAMOUFLAGE] decoy bind failed pid={} addr={}: {}", pid, addr, e);
                }
            }
        }

        // IP rotation hint (QUARANTINED+).
        if state >= IsolationState::Quarantined {
            self.write_hint(
                "ip_hints.json",
                &IpHint {
                    pid,
                    reason: format!("state={} severity={:.2} mt={:.3}", state, severity, mt),
                    severity,
                    mutation_rate: mt,
                    created_at: Utc::now(),
                },
            );
            eprintln!("[CAMOUFLAGE] ip rotation hint pid={} mt={:.3}", pid, mt);
        }
    }

    /// Reverse every active measure for a PID. Idempotent.
    pub fn deactivate(&self, pid: u32) {
        let mut active = self.active.lock().expect("camouflage mutex poisoned");
        if let Some(entry) = active.remove(&pid) {
            if let Some(task) = entry.decoy_task {
                task.abort();
                eprintln!("[CAMOUFLAGE] decoy stopped pid={}", pid);
            }
        }
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().expect("camouflage mutex poisoned").len()
    }

    /// Consume state transitions until shutdown, activating and deactivating
    /// measures as processes move on the ladder.
    pub async fn run(
        self: Arc<Self>,
        mut transitions: mpsc::Receiver<Transition>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                t = transitions.recv() => {
                    match t {
                        Some(t) if t.to >= IsolationState::Isolated => {
                            self.activate(t.pid, t.to, t.severity).await;
                        }
                        Some(t) if t.to == IsolationState::Normal => {
                            self.deactivate(t.pid);
                        }
                        Some(_) => {}
                        None => break,
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        let pids: Vec<u32> = {
            let active = self.active.lock().expect("camouflage mutex poisoned");
            active.keys().copied().collect()
        };
        for pid in pids {
            self.deactivate(pid);
        }
    }

    /// Atomic hint write: tmp file with mode 0600, then rename into place so
    /// readers never observe a partial file.
    fn write_hint<T: Serialize>(&self, filename: &str, hint: &T) {
        if let Err(e) = write_hint_file(&self.settings.hint_dir, filename, hint) {
            eprintln!("[CAMOUFLAGE] hint write failed ({}): {:#}", filename, e);
        }
    }
}

fn write_hint_file<T: Serialize>(dir: &Path, filename: &str, hint: &T) -> anyhow::Result<()> {
    use anyhow::Context;
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    let path = dir.join(filename);
    let tmp = dir.join(format!("{}.tmp", filename));
    let data = serde_json::to_vec_pretty(hint)?;
    let mut f = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(&tmp)
        .with_context(|| format!("opening {}", tmp.display()))?;
    f.write_all(&data)?;
    f.sync_all()?;
    drop(f);
    std::fs::rename(&tmp, &path).with_context(|| format!("renaming into {}", path.display()))?;
    Ok(())
}

/// Decoy accept loop. Accepts, records, closes, never sends a byte. The
/// loop ends when the task is aborted (listener dropped with it).
async fn run_decoy(
    listener: TcpListener,
    pid: u32,
    port: u16,
    sink: Option<mpsc::Sender<DecoyEvent>>,
    metrics: Arc<Metrics>,
) {
    loop {
        let (conn, peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(_) => return,
        };
        drop(conn);
        Metrics::inc(&metrics.decoy_connections);
        eprintln!(
            "[CAMOUFLAGE] decoy connection pid={} port={} remote={}",
            pid, port, peer
        );
        if let Some(sink) = &sink {
            let event = DecoyEvent {
                pid,
                remote_addr: peer.to_string(),
                decoy_port: port,
                at: Utc::now(),
            };
            // Non-blocking toward the pipeline: a stuck consumer drops events
            // rather than wedging the accept loop.
            let _ = sink.try_send(event);
        }
    }
}
