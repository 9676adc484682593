// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025-2026 Reflexd Contributors

//! Peer gossip: anomaly corroboration and federated baseline sharing.
//!
//! The wire protocol is newline-delimited JSON envelopes over TCP. Transport
//! authentication (mTLS) is terminated by the fronting stunnel/proxy layer;
//! every envelope additionally carries an ed25519 signature over its
//! canonical bytes, verified against the sender's configured public key, so
//! a compromised transport hop still cannot forge observations.
//!
//! An inbound envelope is accepted only if it is fresh (age within the TTL,
//! not more than a few seconds in the future), from a configured peer, and
//! correctly signed. Rejections carry a typed reason and never touch the
//! quorum window. Accepted envelopes are buffered toward the quorum and
//! baseline stores through a bounded channel; a slow scoring path drops
//! gossip (counted) rather than backing up the socket handlers.

use crate::baseline::BaselineStore;
use crate::metrics::Metrics;
use crate::quorum::{Observation, QuorumEvaluator};
use anyhow::{Context, Result};
use chrono::{TimeZone, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};

/// Forward skew allowed on inbound envelopes before rejection.
const FUTURE_SKEW_NS: i64 = 5_000_000_000;

/// Typed rejection reasons returned on the wire and logged locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    Stale,
    FutureSkew,
    UnknownPeer,
    BadSignature,
    Malformed,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::Stale => "stale",
            RejectReason::FutureSkew => "future_skew",
            RejectReason::UnknownPeer => "unknown_peer",
            RejectReason::BadSignature => "bad_signature",
            RejectReason::Malformed => "malformed",
        }
    }
}

/// Gossip wire envelope. `type` is the JSON discriminator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    ShareObservation {
        node_id: String,
        timestamp_ns: i64,
        process_hash: String,
        anomaly_score: f64,
        impact_score: f64,
        signature: String,
    },
    ShareBaseline {
        node_id: String,
        timestamp_ns: i64,
        process_hash: String,
        mean: Vec<f64>,
        cov_diag: Vec<f64>,
        sample_count: u64,
        entropy: f64,
        signature: String,
    },
    HealthCheck,
}

impl Envelope {
    fn node_id(&self) -> Option<&str> {
        match self {
            Envelope::ShareObservation { node_id, .. } => Some(node_id),
            Envelope::ShareBaseline { node_id, .. } => Some(node_id),
            Envelope::HealthCheck => None,
        }
    }

    fn timestamp_ns(&self) -> Option<i64> {
        match self {
            Envelope::ShareObservation { timestamp_ns, .. } => Some(*timestamp_ns),
            Envelope::ShareBaseline { timestamp_ns, .. } => Some(*timestamp_ns),
            Envelope::HealthCheck => None,
        }
    }

    fn signature_hex(&self) -> Option<&str> {
        match self {
            Envelope::ShareObservation { signature, .. } => Some(signature),
            Envelope::ShareBaseline { signature, .. } => Some(signature),
            Envelope::HealthCheck => None,
        }
    }

    /// Canonical bytes covered by the signature: sorted-key JSON of every
    /// field except the signature itself, floats fixed to 8 decimals so both
    /// ends encode identical bytes.
    pub fn signable_bytes(&self) -> Vec<u8> {
        let mut m: BTreeMap<&str, serde_json::Value> = BTreeMap::new();
        match self {
            Envelope::ShareObservation {
                node_id,
                timestamp_ns,
                process_hash,
                anomaly_score,
                impact_score,
                ..
            } => {
                m.insert("type", "share_observation".into());
                m.insert("node_id", node_id.as_str().into());
                m.insert("timestamp_ns", (*timestamp_ns).into());
                m.insert("process_hash", process_hash.as_str().into());
                m.insert("anomaly_score", format!("{:.8}", anomaly_score).into());
                m.insert("impact_score", format!("{:.8}", impact_score).into());
            }
            Envelope::ShareBaseline {
                node_id,
                timestamp_ns,
                process_hash,
                mean,
                cov_diag,
                sample_count,
                entropy,
                ..
            } => {
                let fixed = |v: &[f64]| {
                    serde_json::Value::Array(
                        v.iter().map(|x| format!("{:.8}", x).into()).collect(),
                    )
                };
                m.insert("type", "share_baseline".into());
                m.insert("node_id", node_id.as_str().into());
                m.insert("timestamp_ns", (*timestamp_ns).into());
                m.insert("process_hash", process_hash.as_str().into());
                m.insert("mean", fixed(mean));
                m.insert("cov_diag", fixed(cov_diag));
                m.insert("sample_count", (*sample_count).into());
                m.insert("entropy", format!("{:.8}", entropy).into());
            }
            Envelope::HealthCheck => {
                m.insert("type", "health_check".into());
            }
        }
        serde_json::to_vec(&m).unwrap_or_default()
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ShareResponse {
    pub accepted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rejection_reason: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub node_id: String,
    pub status: String,
    pub uptime_seconds: u64,
}

/// A configured peer: where to reach it and how to verify its envelopes.
#[derive(Debug, Clone)]
pub struct Peer {
    pub node_id: String,
    pub addr: String,
    pub verifying_key: VerifyingKey,
    pub trust_weight: f64,
}

/// Accepted gossip, queued toward the quorum/baseline stores.
#[derive(Debug)]
pub enum GossipUpdate {
    Observation {
        node_id: String,
        process_hash: String,
        anomaly_score: f64,
        timestamp_ns: i64,
    },
    Baseline {
        process_hash: String,
        mean: Vec<f64>,
        cov_diag: Vec<f64>,
        sample_count: u64,
        entropy: f64,
        trust_weight: f64,
    },
}

/// Outbound anomaly observation, produced by the worker pool when local
/// scoring crosses the share threshold.
#[derive(Debug, Clone)]
pub struct OutboundObservation {
    pub process_hash: String,
    pub anomaly_score: f64,
    pub impact_score: f64,
}

/// Load an ed25519 signing key from a hex-encoded 32-byte seed file.
pub fn load_signing_key(path: &Path) -> Result<SigningKey> {
    let hex_seed = std::fs::read_to_string(path)
        .with_context(|| format!("reading signing key {}", path.display()))?;
    let seed = hex::decode(hex_seed.trim()).context("signing key is not valid hex")?;
    let seed: [u8; 32] = seed
        .try_into()
        .map_err(|_| anyhow::anyhow!("signing key must be exactly 32 bytes"))?;
    Ok(SigningKey::from_bytes(&seed))
}

/// Parse a hex-encoded ed25519 public key (peer config).
pub fn parse_verifying_key(hex_key: &str) -> Result<VerifyingKey> {
    let bytes = hex::decode(hex_key.trim()).context("public key is not valid hex")?;
    let bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|_| anyhow::anyhow!("public key must be exactly 32 bytes"))?;
    VerifyingKey::from_bytes(&bytes).context("invalid ed25519 public key")
}

pub struct GossipNode {
    node_id: String,
    peers: HashMap<String, Peer>,
    envelope_ttl_ns: i64,
    signing_key: SigningKey,
    started_at: Instant,
    update_tx: mpsc::Sender<GossipUpdate>,
    metrics: Arc<Metrics>,
}

impl GossipNode {
    pub fn new(
        node_id: &str,
        peers: Vec<Peer>,
        envelope_ttl: std::time::Duration,
        signing_key: SigningKey,
        update_tx: mpsc::Sender<GossipUpdate>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            node_id: node_id.to_string(),
            peers: peers.into_iter().map(|p| (p.node_id.clone(), p)).collect(),
            envelope_ttl_ns: envelope_ttl.as_nanos() as i64,
            signing_key,
            started_at: Instant::now(),
            update_tx,
            metrics,
        }
    }

    /// Admission checks for a signed envelope: freshness, known peer,
    /// signature over canonical bytes.
    pub fn validate(&self, env: &Envelope, now_ns: i64) -> std::result::Result<(), RejectReason> {
        let ts = env.timestamp_ns().ok_or(RejectReason::Malformed)?;
        if now_ns - ts > self.envelope_ttl_ns {
            return Err(RejectReason::Stale);
        }
        if ts - now_ns > FUTURE_SKEW_NS {
            return Err(RejectReason::FutureSkew);
        }
        let node_id = env.node_id().ok_or(RejectReason::Malformed)?;
        let peer = self.peers.get(node_id).ok_or(RejectReason::UnknownPeer)?;
        let sig_hex = env.signature_hex().ok_or(RejectReason::Malformed)?;
        let sig_bytes = hex::decode(sig_hex).map_err(|_| RejectReason::BadSignature)?;
        let sig = Signature::from_slice(&sig_bytes).map_err(|_| RejectReason::BadSignature)?;
        peer.verifying_key
            .verify(&env.signable_bytes(), &sig)
            .map_err(|_| RejectReason::BadSignature)
    }

    /// Handle one inbound envelope and produce the wire response.
    pub fn handle(&self, env: Envelope) -> serde_json::Value {
        if matches!(env, Envelope::HealthCheck) {
            return serde_json::to_value(HealthResponse {
                node_id: self.node_id.clone(),
                status: "ok".to_string(),
                uptime_seconds: self.started_at.elapsed().as_secs(),
            })
            .unwrap_or_default();
        }

        let now_ns = Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX);
        if let Err(reason) = self.validate(&env, now_ns) {
            Metrics::inc(&self.metrics.gossip_rejected);
            eprintln!(
                "[GOSSIP] rejected envelope from {:?}: {}",
                env.node_id(),
                reason.as_str()
            );
            return serde_json::to_value(ShareResponse {
                accepted: false,
                rejection_reason: Some(reason.as_str().to_string()),
            })
            .unwrap_or_default();
        }

        let update = match env {
            Envelope::ShareObservation {
                node_id,
                timestamp_ns,
                process_hash,
                anomaly_score,
                ..
            } => GossipUpdate::Observation {
                node_id,
                process_hash,
                anomaly_score,
                timestamp_ns,
            },
            Envelope::ShareBaseline {
                node_id,
                process_hash,
                mean,
                cov_diag,
                sample_count,
                entropy,
                ..
            } => {
                let trust_weight = self
                    .peers
                    .get(&node_id)
                    .map(|p| p.trust_weight)
                    .unwrap_or(0.0);
                GossipUpdate::Baseline {
                    process_hash,
                    mean,
                    cov_diag,
                    sample_count,
                    entropy,
                    trust_weight,
                }
            }
            Envelope::HealthCheck => unreachable!("handled above"),
        };

        // Bounded toward the scoring path: drop with a counter on overflow.
        if self.update_tx.try_send(update).is_err() {
            Metrics::inc(&self.metrics.gossip_dropped_backpressure);
        } else {
            Metrics::inc(&self.metrics.gossip_accepted);
        }
        serde_json::to_value(ShareResponse {
            accepted: true,
            rejection_reason: None,
        })
        .unwrap_or_default()
    }

    pub fn sign_observation(&self, obs: &OutboundObservation) -> Envelope {
        let mut env = Envelope::ShareObservation {
            node_id: self.node_id.clone(),
            timestamp_ns: Utc::now().timestamp_nanos_opt().unwrap_or(0),
            process_hash: obs.process_hash.clone(),
            anomaly_score: obs.anomaly_score,
            impact_score: obs.impact_score,
            signature: String::new(),
        };
        let sig = self.signing_key.sign(&env.signable_bytes());
        if let Envelope::ShareObservation { signature, .. } = &mut env {
            *signature = hex::encode(sig.to_bytes());
        }
        env
    }

    pub fn sign_baseline(&self, record: &crate::baseline::BaselineRecord) -> Envelope {
        let mut env = Envelope::ShareBaseline {
            node_id: self.node_id.clone(),
            timestamp_ns: Utc::now().timestamp_nanos_opt().unwrap_or(0),
            process_hash: record.process_hash.clone(),
            mean: record.mean.clone(),
            cov_diag: record.cov_diag.clone(),
            sample_count: record.sample_count,
            entropy: record.entropy,
            signature: String::new(),
        };
        let sig = self.signing_key.sign(&env.signable_bytes());
        if let Envelope::ShareBaseline { signature, .. } = &mut env {
            *signature = hex::encode(sig.to_bytes());
        }
        env
    }

    /// Accept loop for inbound gossip. Stops accepting on shutdown; in-flight
    /// connections finish on their own tasks.
    pub async fn run_server(
        self: Arc<Self>,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) {
        eprintln!(
            "[GOSSIP] listening on {:?}",
            listener.local_addr().map(|a| a.to_string())
        );
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let node = Arc::clone(&self);
                            tokio::spawn(async move {
                                if let Err(e) = node.handle_conn(stream).await {
                                    eprintln!("[GOSSIP] connection error ({}): {:#}", peer, e);
                                }
                            });
                        }
                        Err(e) => {
                            eprintln!("[GOSSIP] accept error: {}", e);
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        eprintln!("[GOSSIP] server stopping");
                        return;
                    }
                }
            }
        }
    }

    async fn handle_conn(&self, stream: TcpStream) -> Result<()> {
        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let response = match serde_json::from_str::<Envelope>(&line) {
                Ok(env) => self.handle(env),
                Err(_) => {
                    Metrics::inc(&self.metrics.gossip_rejected);
                    serde_json::to_value(ShareResponse {
                        accepted: false,
                        rejection_reason: Some(RejectReason::Malformed.as_str().to_string()),
                    })
                    .unwrap_or_default()
                }
            };
            let json = serde_json::to_string(&response)?;
            writer.write_all(json.as_bytes()).await?;
            writer.write_all(b"\n").await?;
        }
        Ok(())
    }

    /// Broadcast locally produced anomaly observations to every peer.
    pub async fn run_broadcast(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<OutboundObservation>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                obs = rx.recv() => {
                    let Some(obs) = obs else { return };
                    let env = self.sign_observation(&obs);
                    for peer in self.peers.values() {
                        if let Err(e) = send_envelope(&peer.addr, &env).await {
                            eprintln!("[GOSSIP] share to {} failed: {:#}", peer.node_id, e);
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }

    /// Periodic federated baseline broadcast. Only baselines with enough
    /// local samples are shared, and only their statistics, never raw
    /// events or paths.
    pub async fn run_federated_share(
        self: Arc<Self>,
        baselines: Arc<BaselineStore>,
        interval: std::time::Duration,
        min_samples: u64,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await; // immediate first tick carries nothing new
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    for record in baselines.eligible_for_sharing(min_samples) {
                        let env = self.sign_baseline(&record);
                        for peer in self.peers.values() {
                            if let Err(e) = send_envelope(&peer.addr, &env).await {
                                eprintln!(
                                    "[GOSSIP] baseline share to {} failed: {:#}",
                                    peer.node_id, e
                                );
                            }
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }
}

/// One request/response exchange with a peer.
pub async fn send_envelope(addr: &str, env: &Envelope) -> Result<ShareResponse> {
    let stream = TcpStream::connect(addr)
        .await
        .with_context(|| format!("connecting to peer {}", addr))?;
    let (reader, mut writer) = stream.into_split();
    let json = serde_json::to_string(env)?;
    writer.write_all(json.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    let mut lines = BufReader::new(reader).lines();
    let line = lines
        .next_line()
        .await?
        .ok_or_else(|| anyhow::anyhow!("peer {} closed without responding", addr))?;
    Ok(serde_json::from_str(&line)?)
}

/// Drain accepted gossip into the quorum window and baseline store.
pub async fn run_apply(
    mut rx: mpsc::Receiver<GossipUpdate>,
    quorum: Arc<QuorumEvaluator>,
    baselines: Arc<BaselineStore>,
    metrics: Arc<Metrics>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            update = rx.recv() => {
                match update {
                    Some(GossipUpdate::Observation { node_id, process_hash, anomaly_score, timestamp_ns }) => {
                        let at = Utc
                            .timestamp_nanos(timestamp_ns);
                        quorum.record(&process_hash, Observation {
                            node_id,
                            anomaly_score,
                            at,
                        });
                    }
                    Some(GossipUpdate::Baseline { process_hash, mean, cov_diag, sample_count, entropy, trust_weight }) => {
                        baselines.merge_federated(
                            &process_hash,
                            &mean,
                            &cov_diag,
                            sample_count,
                            entropy,
                            trust_weight,
                        );
                        Metrics::inc(&metrics.baselines_merged);
                    }
                    None => return,
                }
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
    use rand::rngs::OsRng;

    fn test_key() -> SigningKey {
        SigningKey::generate(&mut OsRng)
    }

    fn node_with_peer(peer_key: &SigningKey) -> (Arc<GossipNode>, mpsc::Receiver<GossipUpdate>) {
        let (tx, rx) = mpsc::channel(16);
        let node = GossipNode::new(
            "local",
            vec![Peer {
                node_id: "peer-a".to_string(),
                addr: "127.0.0.1:1".to_string(),
                verifying_key: peer_key.verifying_key(),
                trust_weight: 0.3,
            }],
            std::time::Duration::from_secs(30),
            test_key(),
            tx,
            Arc::new(Metrics::new()),
        );
        (Arc::new(node), rx)
    }

    fn signed_observation(key: &SigningKey, node_id: &str, ts_ns: i64) -> Envelope {
        let mut env = Envelope::ShareObservation {
            node_id: node_id.to_string(),
            timestamp_ns: ts_ns,
            process_hash: "abc123".to_string(),
            anomaly_score: 0.8,
            impact_score: 0.5,
            signature: String::new(),
        };
        let sig = key.sign(&env.signable_bytes());
        if let Envelope::ShareObservation { signature, .. } = &mut env {
            *signature = hex::encode(sig.to_bytes());
        }
        env
    }

    fn now_ns() -> i64 {
        Utc::now().timestamp_nanos_opt().unwrap()
    }

    #[test]
    fn test_valid_envelope_accepted() {
        let peer_key = test_key();
        let (node, mut rx) = node_with_peer(&peer_key);
        let env = signed_observation(&peer_key, "peer-a", now_ns());
        assert!(node.validate(&env, now_ns()).is_ok());
        let response = node.handle(env);
        assert_eq!(response["accepted"], true);
        assert!(matches!(
            rx.try_recv(),
            Ok(GossipUpdate::Observation { .. })
        ));
    }

    #[test]
    fn test_stale_envelope_rejected() {
        let peer_key = test_key();
        let (node, _rx) = node_with_peer(&peer_key);
        let old = now_ns() - 60_000_000_000;
        let env = signed_observation(&peer_key, "peer-a", old);
        assert_eq!(node.validate(&env, now_ns()), Err(RejectReason::Stale));
    }

    #[test]
    fn test_future_skew_rejected() {
        let peer_key = test_key();
        let (node, _rx) = node_with_peer(&peer_key);
        let future = now_ns() + 30_000_000_000;
        let env = signed_observation(&peer_key, "peer-a", future);
        assert_eq!(node.validate(&env, now_ns()), Err(RejectReason::FutureSkew));
    }

    #[test]
    fn test_unknown_peer_rejected() {
        let peer_key = test_key();
        let (node, _rx) = node_with_peer(&peer_key);
        let env = signed_observation(&peer_key, "stranger", now_ns());
        assert_eq!(
            node.validate(&env, now_ns()),
            Err(RejectReason::UnknownPeer)
        );
    }

    #[test]
    fn test_wrong_key_rejected() {
        let peer_key = test_key();
        let (node, _rx) = node_with_peer(&peer_key);
        let impostor = test_key();
        let env = signed_observation(&impostor, "peer-a", now_ns());
        assert_eq!(
            node.validate(&env, now_ns()),
            Err(RejectReason::BadSignature)
        );
    }

    #[test]
    fn test_tampered_payload_rejected() {
        let peer_key = test_key();
        let (node, _rx) = node_with_peer(&peer_key);
        let mut env = signed_observation(&peer_key, "peer-a", now_ns());
        if let Envelope::ShareObservation { anomaly_score, .. } = &mut env {
            *anomaly_score = 0.01;
        }
        assert_eq!(
            node.validate(&env, now_ns()),
            Err(RejectReason::BadSignature)
        );
    }

    #[test]
    fn test_health_check_needs_no_signature() {
        let peer_key = test_key();
        let (node, _rx) = node_with_peer(&peer_key);
        let response = node.handle(Envelope::HealthCheck);
        assert_eq!(response["status"], "ok");
        assert_eq!(response["node_id"], "local");
    }

    #[test]
    fn test_signable_bytes_excludes_signature() {
        let key = test_key();
        let a = signed_observation(&key, "peer-a", 1000);
        let mut b = a.clone();
        if let Envelope::ShareObservation { signature, .. } = &mut b {
            *signature = "different".to_string();
        }
        assert_eq!(a.signable_bytes(), b.signable_bytes());
    }

    #[tokio::test]
    async fn test_wire_round_trip() {
        let peer_key = test_key();
        let (node, mut rx) = node_with_peer(&peer_key);
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr").to_string();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let server = tokio::spawn(Arc::clone(&node).run_server(listener, shutdown_rx));

        let env = signed_observation(&peer_key, "peer-a", now_ns());
        let response = send_envelope(&addr, &env).await.expect("exchange");
        assert!(response.accepted);
        assert!(response.rejection_reason.is_none());
        assert!(rx.recv().await.is_some());

        let bogus = signed_observation(&test_key(), "peer-a", now_ns());
        let response = send_envelope(&addr, &bogus).await.expect("exchange");
        assert!(!response.accepted);
        assert_eq!(response.rejection_reason.as_deref(), Some("bad_signature"));

        shutdown_tx.send(true).expect("shutdown");
        let _ = server.await;
    }

    #[tokio::test]
    async fn test_apply_feeds_quorum_and_baselines() {
        let (tx, rx) = mpsc::channel(16);
        let quorum = Arc::new(QuorumEvaluator::new(2, std::time::Duration::from_secs(30)));
        let baselines = Arc::new(BaselineStore::new(2));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run_apply(
            rx,
            Arc::clone(&quorum),
            Arc::clone(&baselines),
            Arc::new(Metrics::new()),
            shutdown_rx,
        ));

        tx.send(GossipUpdate::Observation {
            node_id: "peer-a".to_string(),
            process_hash: "h1".to_string(),
            anomaly_score: 0.9,
            timestamp_ns: now_ns(),
        })
        .await
        .expect("send");
        tx.send(GossipUpdate::Baseline {
            process_hash: "h2".to_string(),
            mean: vec![1.0, 2.0],
            cov_diag: vec![0.1, 0.1],
            sample_count: 50,
            entropy: 0.5,
            trust_weight: 0.3,
        })
        .await
        .expect("send");
        drop(tx);
        let _ = task.await;

        assert!(quorum.signal("h1") > 0.0);
        assert!(baselines.get("h2").is_some());
        let _ = shutdown_tx;
    }
}
