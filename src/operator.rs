// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025-2026 Reflexd Contributors

//! Operator override socket.
//!
//! A privilege-restricted Unix domain socket (mode 0600) accepting
//! newline-delimited JSON commands authenticated with an Argon2-hashed
//! operator key. The key is generated once by `reflexd generate-key`,
//! displayed to the operator, and never stored; only the hash is persisted.
//!
//! Supported commands: `status`, `reset`, `pin`, `unpin`. Resets and pins are
//! routed to the worker shard that owns the PID, so overrides flow through
//! the same audited decay path as autonomous decisions. Failed auth is rate
//! limited (3 failures, 1-hour lockout).

use crate::constitution::ConstitutionalKernel;
use crate::events::{shard_for, ProcessSummary, WorkerCommand, WorkerMsg};
use crate::metrics::Metrics;
use anyhow::{Context, Result};
use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixListener;
use tokio::sync::{mpsc, oneshot, watch, Mutex};

const KEY_PREFIX: &str = "RFXD-";
const KEY_BYTES: usize = 32;
const MAX_FAILURES: u32 = 3;
const LOCKOUT_DURATION: Duration = Duration::from_secs(3600);

#[derive(Debug, Deserialize)]
pub struct OperatorRequest {
    pub key: String,
    pub command: String,
    #[serde(default)]
    pub args: serde_json::Value,
}

#[derive(Debug, Serialize)]
pub struct OperatorResponse {
    pub ok: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl OperatorResponse {
    fn err(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            message: message.into(),
            data: None,
        }
    }

    fn ok(message: impl Into<String>, data: Option<serde_json::Value>) -> Self {
        Self {
            ok: true,
            message: message.into(),
            data,
        }
    }
}

#[derive(Debug)]
struct RateLimiter {
    failures: u32,
    lockout_until: Option<Instant>,
}

impl RateLimiter {
    fn new() -> Self {
        Self {
            failures: 0,
            lockout_until: None,
        }
    }

    fn is_locked_out(&self) -> bool {
        matches!(self.lockout_until, Some(until) if Instant::now() < until)
    }

    fn record_failure(&mut self) -> bool {
        self.failures += 1;
        if self.failures >= MAX_FAILURES {
            self.lockout_until = Some(Instant::now() + LOCKOUT_DURATION);
            true
        } else {
            false
        }
    }

    fn reset(&mut self) {
        self.failures = 0;
        self.lockout_until = None;
    }
}

/// Generate a new operator key: returns (display_key, argon2_hash).
pub fn generate_operator_key() -> Result<(String, String)> {
    use rand::RngCore;
    let mut key_bytes = [0u8; KEY_BYTES];
    OsRng.fill_bytes(&mut key_bytes);
    let display_key = format!("{}{}", KEY_PREFIX, hex::encode(key_bytes));
    let hash = hash_key(&display_key)?;
    Ok((display_key, hash))
}

pub fn hash_key(key: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(key.as_bytes(), &salt)
        .map_err(|e| anyhow::anyhow!("failed to hash key: {}", e))?;
    Ok(hash.to_string())
}

pub fn verify_key(key: &str, hash: &str) -> bool {
    let parsed = match PasswordHash::new(hash) {
        Ok(h) => h,
        Err(_) => return false,
    };
    Argon2::default()
        .verify_password(key.as_bytes(), &parsed)
        .is_ok()
}

/// Generate and display the operator key once, persisting only its hash.
/// Idempotent: refuses to overwrite an existing hash.
pub fn generate_and_show_key(hash_path: &Path) -> Result<bool> {
    if hash_path.exists() {
        eprintln!(
            "Operator key already exists at {}, skipping generation",
            hash_path.display()
        );
        return Ok(false);
    }
    let (display_key, hash) = generate_operator_key()?;
    if let Some(parent) = hash_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(hash_path, &hash)
        .with_context(|| format!("failed to write key hash to {}", hash_path.display()))?;
    eprintln!();
    eprintln!("OPERATOR KEY GENERATED: SAVE THIS NOW, IT WILL NOT BE SHOWN AGAIN:");
    eprintln!();
    eprintln!("  {}", display_key);
    eprintln!();
    Ok(true)
}

pub struct OperatorSocket {
    socket_path: PathBuf,
    key_hash_path: PathBuf,
    shards: Vec<mpsc::Sender<WorkerMsg>>,
    kernel: Arc<ConstitutionalKernel>,
    metrics: Arc<Metrics>,
    started_at: Instant,
    rate_limiter: Arc<Mutex<RateLimiter>>,
}

impl OperatorSocket {
    pub fn new(
        socket_path: PathBuf,
        key_hash_path: PathBuf,
        shards: Vec<mpsc::Sender<WorkerMsg>>,
        kernel: Arc<ConstitutionalKernel>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            socket_path,
            key_hash_path,
            shards,
            kernel,
            metrics,
            started_at: Instant::now(),
            rate_limiter: Arc::new(Mutex::new(RateLimiter::new())),
        }
    }

    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let _ = std::fs::remove_file(&self.socket_path);
        if let Some(parent) = self.socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let listener = UnixListener::bind(&self.socket_path).with_context(|| {
            format!("failed to bind operator socket at {}", self.socket_path.display())
        })?;
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.socket_path, std::fs::Permissions::from_mode(0o600))?;
        }
        eprintln!(
            "[OPERATOR] socket listening on {}",
            self.socket_path.display()
        );

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, _)) => {
                            let socket = Arc::clone(&self);
                            tokio::spawn(async move {
                                if let Err(e) = socket.handle_connection(stream).await {
                                    eprintln!("[OPERATOR] connection error: {:#}", e);
                                }
                            });
                        }
                        Err(e) => {
                            eprintln!("[OPERATOR] accept error: {}", e);
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        let _ = std::fs::remove_file(&self.socket_path);
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn handle_connection(&self, stream: tokio::net::UnixStream) -> Result<()> {
        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let response = self.process_request(&line).await;
            let json = serde_json::to_string(&response)?;
            writer.write_all(json.as_bytes()).await?;
            writer.write_all(b"\n").await?;
        }
        Ok(())
    }

    async fn process_request(&self, line: &str) -> OperatorResponse {
        let req: OperatorRequest = match serde_json::from_str(line) {
            Ok(r) => r,
            Err(e) => return OperatorResponse::err(format!("invalid request: {}", e)),
        };

        {
            let limiter = self.rate_limiter.lock().await;
            if limiter.is_locked_out() {
                return OperatorResponse::err("locked out after repeated auth failures");
            }
        }

        let key_hash = match std::fs::read_to_string(&self.key_hash_path) {
            Ok(h) => h,
            Err(_) => {
                return OperatorResponse::err(
                    "no operator key configured; run 'reflexd generate-key'",
                )
            }
        };
        if !verify_key(&req.key, key_hash.trim()) {
            let mut limiter = self.rate_limiter.lock().await;
            if limiter.record_failure() {
                eprintln!("[OPERATOR] auth failures exceeded, locking out for 1h");
            } else {
                eprintln!("[OPERATOR] auth failure");
            }
            return OperatorResponse::err("authentication failed");
        }
        self.rate_limiter.lock().await.reset();

        match req.command.as_str() {
            "status" => self.cmd_status().await,
            "reset" => self.cmd_reset(&req.args).await,
            "pin" => self.cmd_pin(&req.args, true).await,
            "unpin" => self.cmd_pin(&req.args, false).await,
            other => OperatorResponse::err(format!(
                "unknown command '{}' (expected status, reset, pin, unpin)",
                other
            )),
        }
    }

    async fn cmd_status(&self) -> OperatorResponse {
        let mut processes: Vec<ProcessSummary> = Vec::new();
        for shard in &self.shards {
            let (tx, rx) = oneshot::channel();
            if shard
                .send(WorkerMsg::Command(WorkerCommand::Snapshot { reply: tx }))
                .await
                .is_err()
            {
                continue;
            }
            if let Ok(mut summaries) = rx.await {
                processes.append(&mut summaries);
            }
        }
        processes.sort_by_key(|p| p.pid);
        let (validated, violations) = self.kernel.stats();
        let data = serde_json::json!({
            "uptime_seconds": self.started_at.elapsed().as_secs(),
            "chain_head": self.kernel.chain_head(),
            "decisions_validated": validated,
            "constitutional_violations": violations,
            "metrics": self.metrics.snapshot(),
            "processes": processes,
        });
        OperatorResponse::ok("ok", Some(data))
    }

    async fn cmd_reset(&self, args: &serde_json::Value) -> OperatorResponse {
        let Some(pid) = args.get("pid").and_then(|v| v.as_u64()) else {
            return OperatorResponse::err("reset requires args.pid");
        };
        let pid = pid as u32;
        let shard = &self.shards[shard_for(pid, self.shards.len())];
        let (tx, rx) = oneshot::channel();
        if shard
            .send(WorkerMsg::Command(WorkerCommand::Reset { pid, reply: tx }))
            .await
            .is_err()
        {
            return OperatorResponse::err("worker unavailable");
        }
        match rx.await {
            Ok(0) => OperatorResponse::ok(
                format!("pid {} not tracked or already NORMAL", pid),
                None,
            ),
            Ok(steps) => OperatorResponse::ok(
                format!("pid {} reset to NORMAL ({} audited decay steps)", pid, steps),
                None,
            ),
            Err(_) => OperatorResponse::err("worker dropped the request"),
        }
    }

    async fn cmd_pin(&self, args: &serde_json::Value, pinned: bool) -> OperatorResponse {
        let Some(pid) = args.get("pid").and_then(|v| v.as_u64()) else {
            return OperatorResponse::err("pin requires args.pid");
        };
        let pid = pid as u32;
        let shard = &self.shards[shard_for(pid, self.shards.len())];
        let (tx, rx) = oneshot::channel();
        if shard
            .send(WorkerMsg::Command(WorkerCommand::Pin {
                pid,
                pinned,
                reply: tx,
            }))
            .await
            .is_err()
        {
            return OperatorResponse::err("worker unavailable");
        }
        match rx.await {
            Ok(true) => OperatorResponse::ok(
                format!("pid {} {}", pid, if pinned { "pinned" } else { "unpinned" }),
                None,
            ),
            Ok(false) => OperatorResponse::err(format!("pid {} is not tracked", pid)),
            Err(_) => OperatorResponse::err("worker dropped the request"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constitution::Bounds;
    use tempfile::tempdir;

    #[test]
    fn test_generate_and_verify_key() {
        let (key, hash) = generate_operator_key().expect("generate");
        assert!(key.starts_with(KEY_PREFIX));
        assert!(verify_key(&key, &hash));
        assert!(!verify_key("RFXD-wrong", &hash));
        assert!(!verify_key("", &hash));
        assert!(!verify_key(&key, "not_a_valid_hash"));
    }

    #[test]
    fn test_key_generation_is_idempotent() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("operator.key");
        assert!(generate_and_show_key(&path).expect("first"));
        assert!(!generate_and_show_key(&path).expect("second"));
    }

    #[test]
    fn test_rate_limiter_locks_after_three() {
        let mut limiter = RateLimiter::new();
        assert!(!limiter.record_failure());
        assert!(!limiter.record_failure());
        assert!(limiter.record_failure());
        assert!(limiter.is_locked_out());
        limiter.reset();
        assert!(!limiter.is_locked_out());
    }

    fn socket_with_key(dir: &Path, shards: Vec<mpsc::Sender<WorkerMsg>>) -> (Arc<OperatorSocket>, String) {
        let (key, hash) = generate_operator_key().expect("generate");
        let hash_path = dir.join("operator.key");
        std::fs::write(&hash_path, hash).expect("write hash");
        let socket = OperatorSocket::new(
            dir.join("operator.sock"),
            hash_path,
            shards,
            Arc::new(ConstitutionalKernel::new(Bounds::default(), false)),
            Arc::new(Metrics::new()),
        );
        (Arc::new(socket), key)
    }

    #[tokio::test]
    async fn test_bad_key_rejected() {
        let dir = tempdir().expect("tempdir");
        let (socket, _key) = socket_with_key(dir.path(), vec![]);
        let response = socket
            .process_request(r#"{"key":"RFXD-bogus","command":"status"}"#)
            .await;
        assert!(!response.ok);
        assert!(response.message.contains("authentication failed"));
    }

    #[tokio::test]
    async fn test_status_reports_chain_and_metrics() {
        let dir = tempdir().expect("tempdir");
        let (socket, key) = socket_with_key(dir.path(), vec![]);
        let request = serde_json::json!({"key": key, "command": "status"}).to_string();
        let response = socket.process_request(&request).await;
        assert!(response.ok, "{}", response.message);
        let data = response.data.expect("status data");
        assert!(data["chain_head"].is_string());
        assert!(data["metrics"].is_object());
    }

    #[tokio::test]
    async fn test_reset_routes_to_owning_shard() {
        let dir = tempdir().expect("tempdir");
        let (tx, mut rx) = mpsc::channel(4);
        let (socket, key) = socket_with_key(dir.path(), vec![tx]);

        let worker = tokio::spawn(async move {
            match rx.recv().await {
                Some(WorkerMsg::Command(WorkerCommand::Reset { pid, reply })) => {
                    assert_eq!(pid, 42);
                    let _ = reply.send(2);
                }
                _ => panic!("expected reset command"),
            }
        });

        let request =
            serde_json::json!({"key": key, "command": "reset", "args": {"pid": 42}}).to_string();
        let response = socket.process_request(&request).await;
        assert!(response.ok, "{}", response.message);
        assert!(response.message.contains("2 audited decay steps"));
        worker.await.expect("worker");
    }

    #[tokio::test]
    async fn test_unknown_command_rejected() {
        let dir = tempdir().expect("tempdir");
        let (socket, key) = socket_with_key(dir.path(), vec![]);
        let request = serde_json::json!({"key": key, "command": "explode"}).to_string();
        let response = socket.process_request(&request).await;
        assert!(!response.ok);
        assert!(response.message.contains("unknown command"));
    }
}
