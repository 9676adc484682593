// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025-2026 Reflexd Contributors

//! Append-only decision ledger.
//!
//! Every accepted escalation decision is appended as one JSON line. Records
//! carry their own `decision_hash` and `parent_hash`, so the file is a
//! self-verifying chain: `reflexd verify-audit` recomputes each hash and
//! checks the parent linkage without needing any other state.

use anyhow::{bail, Context, Result};
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::constitution::Decision;

/// Writer half of the ledger. Appends are serialized behind a mutex; the
/// decision pipeline is low-frequency so contention is irrelevant.
pub struct Ledger {
    path: PathBuf,
    lock: Mutex<()>,
}

impl Ledger {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create ledger dir {}", parent.display()))?;
        }
        // Touch the file now so startup fails fast on a bad path.
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open ledger {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            lock: Mutex::new(()),
        })
    }

    /// Append a validated decision. Callers must only pass decisions the
    /// constitutional kernel accepted.
    pub fn append(&self, decision: &Decision) -> Result<()> {
        let _guard = self.lock.lock().expect("ledger mutex poisoned");
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open ledger {}", self.path.display()))?;
        let json = serde_json::to_string(decision).context("serialize decision")?;
        writeln!(file, "{}", json).context("append decision")?;
        Ok(())
    }
}

/// Outcome of a ledger verification pass.
#[derive(Debug)]
pub struct VerifyReport {
    pub records: usize,
}

/// Walk a ledger file checking (a) each record's hash recomputes from its
/// fields and (b) each record's parent_hash equals the previous record's
/// decision_hash. Returns the record count, or the first inconsistency found.
pub fn verify(path: &Path) -> Result<VerifyReport> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("open ledger {}", path.display()))?;
    let reader = BufReader::new(file);

    let mut expected_parent = String::new();
    let mut records = 0usize;

    for (lineno, line) in reader.lines().enumerate() {
        let line = line.context("read ledger line")?;
        if line.trim().is_empty() {
            continue;
        }
        let decision: Decision = serde_json::from_str(&line)
            .with_context(|| format!("line {}: malformed record", lineno + 1))?;

        let recomputed = decision.compute_hash();
        if recomputed != decision.decision_hash {
            bail!(
                "line {}: decision_hash mismatch (stored {}, recomputed {}): record tampered",
                lineno + 1,
                // The stored hash comes from an untrusted file; slice it only
                // on a valid char boundary.
                decision
                    .decision_hash
                    .get(..16)
                    .unwrap_or(decision.decision_hash.as_str()),
                &recomputed[..16]
            );
        }
        if decision.parent_hash != expected_parent {
            bail!(
                "line {}: chain break (parent_hash does not match previous decision_hash)",
                lineno + 1
            );
        }
        expected_parent = decision.decision_hash.clone();
        records += 1;
    }

    Ok(VerifyReport { records })
}

/// `reflexd verify-audit [PATH]` entry point.
pub fn run_verify_audit(path: Option<&str>, default_path: &str) -> Result<()> {
    let path = PathBuf::from(path.unwrap_or(default_path));
    match verify(&path) {
        Ok(report) => {
            eprintln!(
                "Ledger OK: {} decisions, chain intact ({})",
                report.records,
                path.display()
            );
            Ok(())
        }
        Err(e) => {
            eprintln!("Ledger verification FAILED: {:#}", e);
            std::process::exit(1);
        }
    }
}
