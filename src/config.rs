// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025-2026 Reflexd Contributors

//! Configuration loading and validation.
//!
//! Defines the TOML schema for reflexd. The root [`Config`] has one section
//! per subsystem (general, escalation, budget, anomaly, gossip, camouflage,
//! operator), all with `#[serde(default)]` so missing sections fall back to
//! defaults. Loaded from `/etc/reflexd/config.toml` by default.
//!
//! An invalid config at startup is fatal. On SIGHUP hot-reload the new file
//! is validated first; a bad file is logged and the running config retained.

use crate::camouflage::{CamouflageSettings, ControlLaw, EpochParams};
use crate::constitution::SEVERITY_BOUND;
use crate::escalation::{Thresholds, Weights};
use crate::events::WorkerSettings;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/reflexd/config.toml";

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub escalation: EscalationConfig,
    #[serde(default)]
    pub budget: BudgetConfig,
    #[serde(default)]
    pub anomaly: AnomalyConfig,
    #[serde(default)]
    pub gossip: GossipConfig,
    #[serde(default)]
    pub camouflage: CamouflageConfig,
    #[serde(default)]
    pub operator: OperatorConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct GeneralConfig {
    /// Node identity used in decisions and gossip envelopes.
    #[serde(default = "default_node_id")]
    pub node_id: String,
    /// Append-only decision ledger (JSONL).
    #[serde(default = "default_ledger_path")]
    pub ledger_path: PathBuf,
    /// Kernel event source: a stream of fixed-size binary records.
    #[serde(default = "default_event_source")]
    pub event_source: PathBuf,
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    /// Per-shard queue depth; overflow drops events with a counter.
    #[serde(default = "default_queue_depth")]
    pub event_queue_depth: usize,
    /// Strict mode aborts on any constitutional violation. Test builds only.
    #[serde(default)]
    pub strict_constitution: bool,
}

fn default_node_id() -> String {
    std::fs::read_to_string("/etc/hostname")
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|_| "reflexd".to_string())
}
fn default_ledger_path() -> PathBuf {
    PathBuf::from("/var/lib/reflexd/ledger.jsonl")
}
fn default_event_source() -> PathBuf {
    PathBuf::from("/run/reflexd/events")
}
fn default_worker_count() -> usize {
    4
}
fn default_queue_depth() -> usize {
    1024
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            ledger_path: default_ledger_path(),
            event_source: default_event_source(),
            worker_count: default_worker_count(),
            event_queue_depth: default_queue_depth(),
            strict_constitution: false,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct EscalationConfig {
    #[serde(default = "default_weight_anomaly")]
    pub weight_anomaly: f64,
    #[serde(default = "default_weight_quorum")]
    pub weight_quorum: f64,
    #[serde(default = "default_weight_integrity")]
    pub weight_integrity: f64,
    #[serde(default = "default_weight_pressure")]
    pub weight_pressure: f64,
    #[serde(default = "default_threshold_pressure")]
    pub threshold_pressure: f64,
    #[serde(default = "default_threshold_isolated")]
    pub threshold_isolated: f64,
    #[serde(default = "default_threshold_frozen")]
    pub threshold_frozen: f64,
    #[serde(default = "default_threshold_quarantined")]
    pub threshold_quarantined: f64,
    #[serde(default = "default_threshold_terminated")]
    pub threshold_terminated: f64,
    /// EWMA smoothing factor α for per-PID pressure.
    #[serde(default = "default_pressure_alpha")]
    pub pressure_alpha: f64,
    /// Quiet time before a process decays one rung.
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    /// Idle time before a NORMAL-state process is evicted from tracking.
    #[serde(default = "default_idle_eviction_secs")]
    pub idle_eviction_secs: u64,
}

fn default_weight_anomaly() -> f64 {
    4.0
}
fn default_weight_quorum() -> f64 {
    2.0
}
fn default_weight_integrity() -> f64 {
    2.0
}
fn default_weight_pressure() -> f64 {
    2.0
}
fn default_threshold_pressure() -> f64 {
    1.0
}
fn default_threshold_isolated() -> f64 {
    3.0
}
fn default_threshold_frozen() -> f64 {
    6.0
}
fn default_threshold_quarantined() -> f64 {
    8.5
}
fn default_threshold_terminated() -> f64 {
    9.5
}
fn default_pressure_alpha() -> f64 {
    0.8
}
fn default_cooldown_secs() -> u64 {
    30
}
fn default_idle_eviction_secs() -> u64 {
    300
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            weight_anomaly: default_weight_anomaly(),
            weight_quorum: default_weight_quorum(),
            weight_integrity: default_weight_integrity(),
            weight_pressure: default_weight_pressure(),
            threshold_pressure: default_threshold_pressure(),
            threshold_isolated: default_threshold_isolated(),
            threshold_frozen: default_threshold_frozen(),
            threshold_quarantined: default_threshold_quarantined(),
            threshold_terminated: default_threshold_terminated(),
            pressure_alpha: default_pressure_alpha(),
            cooldown_secs: default_cooldown_secs(),
            idle_eviction_secs: default_idle_eviction_secs(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct BudgetConfig {
    #[serde(default = "default_budget_capacity")]
    pub capacity: u64,
    #[serde(default = "default_refill_period_secs")]
    pub refill_period_secs: u64,
}

fn default_budget_capacity() -> u64 {
    100
}
fn default_refill_period_secs() -> u64 {
    60
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            capacity: default_budget_capacity(),
            refill_period_secs: default_refill_period_secs(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AnomalyConfig {
    /// Weight of the entropy-deviation term in the anomaly score.
    #[serde(default = "default_entropy_weight")]
    pub entropy_weight: f64,
    /// Variance floor for the Mahalanobis diagonal.
    #[serde(default = "default_min_variance")]
    pub min_variance: f64,
    /// Baseline samples required before scores are trusted.
    #[serde(default = "default_warmup_samples")]
    pub warmup_samples: u64,
    /// Anomaly score at or above which observations enter the quorum window
    /// and are shared with peers.
    #[serde(default = "default_share_threshold")]
    pub share_threshold: f64,
}

fn default_entropy_weight() -> f64 {
    0.3
}
fn default_min_variance() -> f64 {
    1e-6
}
fn default_warmup_samples() -> u64 {
    20
}
fn default_share_threshold() -> f64 {
    0.7
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            entropy_weight: default_entropy_weight(),
            min_variance: default_min_variance(),
            warmup_samples: default_warmup_samples(),
            share_threshold: default_share_threshold(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct GossipConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_gossip_listen")]
    pub listen_addr: String,
    /// Distinct corroborating nodes required for a full quorum signal.
    #[serde(default = "default_quorum_min")]
    pub quorum_min: usize,
    #[serde(default = "default_envelope_ttl_secs")]
    pub envelope_ttl_secs: u64,
    /// Hex-encoded 32-byte ed25519 seed, mode 0600.
    #[serde(default = "default_signing_key_path")]
    pub signing_key_path: PathBuf,
    #[serde(default)]
    pub peers: Vec<PeerConfig>,
    #[serde(default)]
    pub federated_baseline: FederatedBaselineConfig,
}

fn default_gossip_listen() -> String {
    "0.0.0.0:9443".to_string()
}
fn default_quorum_min() -> usize {
    2
}
fn default_envelope_ttl_secs() -> u64 {
    30
}
fn default_signing_key_path() -> PathBuf {
    PathBuf::from("/etc/reflexd/node.key")
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen_addr: default_gossip_listen(),
            quorum_min: default_quorum_min(),
            envelope_ttl_secs: default_envelope_ttl_secs(),
            signing_key_path: default_signing_key_path(),
            peers: Vec::new(),
            federated_baseline: FederatedBaselineConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PeerConfig {
    pub node_id: String,
    pub addr: String,
    /// Hex-encoded ed25519 public key for envelope verification.
    pub public_key: String,
    #[serde(default = "default_trust_weight")]
    pub trust_weight: f64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct FederatedBaselineConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_share_interval_secs")]
    pub share_interval_secs: u64,
    /// Local samples required before a baseline may be shared.
    #[serde(default = "default_min_samples")]
    pub min_samples: u64,
    #[serde(default = "default_trust_weight")]
    pub trust_weight: f64,
}

fn default_share_interval_secs() -> u64 {
    300
}
fn default_min_samples() -> u64 {
    100
}
fn default_trust_weight() -> f64 {
    0.3
}

impl Default for FederatedBaselineConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            share_interval_secs: default_share_interval_secs(),
            min_samples: default_min_samples(),
            trust_weight: default_trust_weight(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CamouflageConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_port_base")]
    pub port_base: u16,
    #[serde(default = "default_port_range")]
    pub port_range: u16,
    #[serde(default = "default_true")]
    pub decoy_enabled: bool,
    /// Loopback by default: the threat model is local processes.
    #[serde(default = "default_decoy_bind")]
    pub decoy_bind_addr: String,
    #[serde(default = "default_hint_dir")]
    pub hint_dir: PathBuf,
    #[serde(default = "default_lambda1")]
    pub lambda1: f64,
    #[serde(default = "default_lambda2")]
    pub lambda2: f64,
    #[serde(default = "default_base_epoch_secs")]
    pub base_epoch_secs: i64,
    #[serde(default = "default_min_epoch_secs")]
    pub min_epoch_secs: i64,
}

fn default_true() -> bool {
    true
}
fn default_port_base() -> u16 {
    32768
}
fn default_port_range() -> u16 {
    16384
}
fn default_decoy_bind() -> String {
    "127.0.0.1".to_string()
}
fn default_hint_dir() -> PathBuf {
    PathBuf::from("/run/reflexd")
}
fn default_lambda1() -> f64 {
    0.4
}
fn default_lambda2() -> f64 {
    0.6
}
fn default_base_epoch_secs() -> i64 {
    3600
}
fn default_min_epoch_secs() -> i64 {
    300
}

impl Default for CamouflageConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port_base: default_port_base(),
            port_range: default_port_range(),
            decoy_enabled: true,
            decoy_bind_addr: default_decoy_bind(),
            hint_dir: default_hint_dir(),
            lambda1: default_lambda1(),
            lambda2: default_lambda2(),
            base_epoch_secs: default_base_epoch_secs(),
            min_epoch_secs: default_min_epoch_secs(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct OperatorConfig {
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,
    #[serde(default = "default_key_hash_path")]
    pub key_hash_path: PathBuf,
}

fn default_socket_path() -> PathBuf {
    PathBuf::from("/run/reflexd/operator.sock")
}
fn default_key_hash_path() -> PathBuf {
    PathBuf::from("/etc/reflexd/operator.key")
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            key_hash_path: default_key_hash_path(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config: {}", path.display()))?;
        let config: Config = toml::from_str(&content).context("failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    /// Schema-level sanity checks. Collected so the operator sees every
    /// problem at once instead of fixing them one restart at a time.
    pub fn validate(&self) -> Result<()> {
        let mut errs: Vec<String> = Vec::new();

        if self.general.node_id.trim().is_empty() {
            errs.push("general.node_id must not be empty".to_string());
        }
        if self.general.worker_count == 0 {
            errs.push("general.worker_count must be at least 1".to_string());
        }
        if self.general.event_queue_depth == 0 {
            errs.push("general.event_queue_depth must be at least 1".to_string());
        }

        let e = &self.escalation;
        if !(0.0..=1.0).contains(&e.pressure_alpha) {
            errs.push(format!(
                "escalation.pressure_alpha must be in [0.0, 1.0], got {}",
                e.pressure_alpha
            ));
        }
        if e.weight_anomaly < 0.0
            || e.weight_quorum < 0.0
            || e.weight_integrity < 0.0
            || e.weight_pressure < 0.0
        {
            errs.push("escalation weights must be non-negative".to_string());
        }
        // Maximal evidence (all inputs at 1.0) yields severity = weight sum;
        // past the constitutional bound every such decision would be rejected
        // and the strongest signals would never contain anything.
        let weight_sum =
            e.weight_anomaly + e.weight_quorum + e.weight_integrity + e.weight_pressure;
        if weight_sum > SEVERITY_BOUND {
            errs.push(format!(
                "escalation weights must sum to at most {} (the severity bound), got {}",
                SEVERITY_BOUND, weight_sum
            ));
        }
        if e.threshold_terminated > SEVERITY_BOUND {
            errs.push(format!(
                "escalation.threshold_terminated must not exceed the severity bound {}, got {}",
                SEVERITY_BOUND, e.threshold_terminated
            ));
        }
        if !self.thresholds().ordered() {
            errs.push(
                "escalation thresholds must be strictly increasing \
                 (pressure < isolated < frozen < quarantined < terminated)"
                    .to_string(),
            );
        }

        if self.budget.capacity == 0 {
            errs.push("budget.capacity must be at least 1".to_string());
        }
        if self.budget.refill_period_secs == 0 {
            errs.push("budget.refill_period_secs must be at least 1".to_string());
        }

        if !(0.0..=1.0).contains(&self.anomaly.entropy_weight) {
            errs.push(format!(
                "anomaly.entropy_weight must be in [0.0, 1.0], got {}",
                self.anomaly.entropy_weight
            ));
        }
        if !(0.0..=1.0).contains(&self.anomaly.share_threshold) {
            errs.push(format!(
                "anomaly.share_threshold must be in [0.0, 1.0], got {}",
                self.anomaly.share_threshold
            ));
        }

        if self.gossip.enabled {
            if self.gossip.quorum_min == 0 {
                errs.push("gossip.quorum_min must be at least 1".to_string());
            }
            if self.gossip.envelope_ttl_secs == 0 {
                errs.push("gossip.envelope_ttl_secs must be at least 1".to_string());
            }
            for peer in &self.gossip.peers {
                if hex::decode(peer.public_key.trim()).map(|b| b.len()) != Ok(32) {
                    errs.push(format!(
                        "gossip peer '{}' public_key must be 64 hex chars",
                        peer.node_id
                    ));
                }
                if !(0.0..=1.0).contains(&peer.trust_weight) {
                    errs.push(format!(
                        "gossip peer '{}' trust_weight must be in [0.0, 1.0]",
                        peer.node_id
                    ));
                }
            }
            let fed = &self.gossip.federated_baseline;
            if fed.enabled && !(0.0..=1.0).contains(&fed.trust_weight) {
                errs.push(format!(
                    "gossip.federated_baseline.trust_weight must be in [0.0, 1.0], got {}",
                    fed.trust_weight
                ));
            }
        }

        if self.camouflage.enabled {
            if self.camouflage.port_range == 0 {
                errs.push("camouflage.port_range must be at least 1".to_string());
            }
            let port_window = self.camouflage.port_base as u32 + self.camouflage.port_range as u32;
            if port_window > 65536 {
                errs.push(format!(
                    "camouflage.port_base + port_range must not exceed 65536, got {}",
                    port_window
                ));
            }
            if self.camouflage.min_epoch_secs <= 0
                || self.camouflage.base_epoch_secs < self.camouflage.min_epoch_secs
            {
                errs.push(
                    "camouflage epochs must satisfy 0 < min_epoch_secs <= base_epoch_secs"
                        .to_string(),
                );
            }
            if self.camouflage.lambda1 < 0.0 || self.camouflage.lambda2 < 0.0 {
                errs.push("camouflage lambda parameters must be non-negative".to_string());
            }
        }

        if errs.is_empty() {
            Ok(())
        } else {
            bail!("invalid configuration:\n  - {}", errs.join("\n  - "));
        }
    }

    pub fn weights(&self) -> Weights {
        Weights {
            anomaly: self.escalation.weight_anomaly,
            quorum: self.escalation.weight_quorum,
            integrity: self.escalation.weight_integrity,
            pressure: self.escalation.weight_pressure,
        }
    }

    pub fn thresholds(&self) -> Thresholds {
        Thresholds {
            pressure: self.escalation.threshold_pressure,
            isolated: self.escalation.threshold_isolated,
            frozen: self.escalation.threshold_frozen,
            quarantined: self.escalation.threshold_quarantined,
            terminated: self.escalation.threshold_terminated,
        }
    }

    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            pressure_alpha: self.escalation.pressure_alpha,
            share_threshold: self.anomaly.share_threshold,
            cooldown: chrono::Duration::seconds(self.escalation.cooldown_secs as i64),
            idle_eviction: chrono::Duration::seconds(self.escalation.idle_eviction_secs as i64),
        }
    }

    pub fn camouflage_settings(&self) -> CamouflageSettings {
        CamouflageSettings {
            enabled: self.camouflage.enabled,
            port_base: self.camouflage.port_base,
            port_range: self.camouflage.port_range,
            decoy_enabled: self.camouflage.decoy_enabled,
            decoy_bind_addr: self.camouflage.decoy_bind_addr.clone(),
            hint_dir: self.camouflage.hint_dir.clone(),
            control_law: ControlLaw {
                lambda1: self.camouflage.lambda1,
                lambda2: self.camouflage.lambda2,
            },
            epoch: EpochParams {
                base_secs: self.camouflage.base_epoch_secs,
                min_secs: self.camouflage.min_epoch_secs,
            },
            // The anomaly sigmoid saturates where severity tops out.
            severity_max: self.escalation.threshold_terminated.max(1.0),
        }
    }
}
