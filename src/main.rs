// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025-2026 Reflexd Contributors

//! reflexd: host-resident intrusion containment agent.
//!
//! Observes kernel security events, scores them against per-binary behavioral
//! baselines, and walks offending processes up a monotonic isolation ladder
//! (NORMAL → PRESSURE → ISOLATED → FROZEN → QUARANTINED → TERMINATED). Every
//! transition is validated by a constitutional kernel and appended to a
//! hash-chained audit ledger; action rate is bounded by a token budget.
//!
//! Subsystems, wired as a channel pipeline:
//! - **events**: kernel record reader → PID-sharded worker pool
//! - **escalation**: severity computation and state transitions
//! - **constitution**: invariant checks + decision hash chain
//! - **audit**: append-only JSONL ledger with offline verification
//! - **budget**: token bucket bounding high-impact action rate
//! - **quorum**: multi-node corroboration of anomaly observations
//! - **gossip**: signed peer envelopes + federated baseline sharing
//! - **camouflage**: port shuffle, decoy listeners, rotation hints
//! - **operator**: authenticated Unix socket for reset/pin overrides

mod audit;
mod baseline;
mod budget;
mod camouflage;
mod config;
mod constitution;
mod escalation;
mod events;
mod gossip;
mod metrics;
mod operator;
mod quorum;
mod state;

use anyhow::{Context, Result};
use config::Config;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

fn print_help() {
    eprintln!(
        r#"reflexd - host-resident intrusion containment agent

USAGE:
    reflexd [COMMAND] [OPTIONS]

COMMANDS:
    run [CONFIG]         Start the agent (default config: {default_config})
    verify-audit [PATH]  Verify decision ledger chain integrity
    generate-key         Generate the operator socket key (shown once)
    version              Print version
    help                 Show this help
"#,
        default_config = config::DEFAULT_CONFIG_PATH
    );
}

fn print_version() {
    eprintln!("reflexd {}", env!("CARGO_PKG_VERSION"));
}

fn ensure_root() {
    if unsafe { libc::geteuid() } != 0 {
        eprintln!("reflexd requires root privileges to enforce containment");
        std::process::exit(1);
    }
}

fn main() -> Result<()> {
    tokio::runtime::Runtime::new()?.block_on(async_main())
}

async fn async_main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let subcommand = args.get(1).map(|s| s.as_str()).unwrap_or("run");
    let rest_args: Vec<String> = args.iter().skip(2).cloned().collect();

    match subcommand {
        "help" | "--help" | "-h" => {
            print_help();
            Ok(())
        }
        "version" | "--version" | "-V" => {
            print_version();
            Ok(())
        }
        "verify-audit" => {
            let default_path = config::Config::default()
                .general
                .ledger_path
                .to_string_lossy()
                .into_owned();
            audit::run_verify_audit(rest_args.first().map(|s| s.as_str()), &default_path)
        }
        "generate-key" => {
            ensure_root();
            let hash_path = config::Config::default().operator.key_hash_path;
            operator::generate_and_show_key(&hash_path)?;
            Ok(())
        }
        _ => {
            ensure_root();
            let config_path = if subcommand == "run" {
                rest_args.first().map(PathBuf::from)
            } else {
                args.get(1).map(PathBuf::from)
            }
            .unwrap_or_else(|| PathBuf::from(config::DEFAULT_CONFIG_PATH));

            // Invalid startup config is fatal; a missing file runs defaults.
            let cfg = if config_path.exists() {
                Config::load(&config_path)?
            } else {
                eprintln!(
                    "[MAIN] no config at {}, using defaults",
                    config_path.display()
                );
                Config::default()
            };
            run_agent(config_path, cfg).await
        }
    }
}

async fn run_agent(config_path: PathBuf, cfg: Config) -> Result<()> {
    eprintln!(
        "[MAIN] reflexd {} starting, node_id={}",
        env!("CARGO_PKG_VERSION"),
        cfg.general.node_id
    );

    let metrics = Arc::new(metrics::Metrics::new());
    let kernel = Arc::new(constitution::ConstitutionalKernel::new(
        constitution::Bounds::default(),
        cfg.general.strict_constitution,
    ));
    let ledger = Arc::new(audit::Ledger::open(&cfg.general.ledger_path)?);
    let bucket = Arc::new(budget::BudgetBucket::new(cfg.budget.capacity));
    let quorum = Arc::new(quorum::QuorumEvaluator::new(
        cfg.gossip.quorum_min,
        std::time::Duration::from_secs(cfg.gossip.envelope_ttl_secs),
    ));
    let baselines = Arc::new(baseline::BaselineStore::new(events::FEATURE_DIM));
    let scorer: Arc<dyn baseline::Scorer> = Arc::new(baseline::MahalanobisScorer::new(
        cfg.anomaly.entropy_weight,
        cfg.anomaly.min_variance,
        cfg.anomaly.warmup_samples,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut task_handles = Vec::new();

    // Budget refill runs for the agent's lifetime.
    task_handles.push(tokio::spawn(budget::run_refill(
        Arc::clone(&bucket),
        std::time::Duration::from_secs(cfg.budget.refill_period_secs),
        Arc::clone(&metrics),
        shutdown_rx.clone(),
    )));

    // Camouflage engine consumes state transitions; its decoy connections
    // feed back into the worker pool as synthetic events.
    let (transition_tx, transition_rx) = mpsc::channel(256);
    let (decoy_tx, decoy_rx) = mpsc::channel(256);
    let camo = Arc::new(camouflage::CamouflageEngine::new(
        cfg.camouflage_settings(),
        &cfg.general.node_id,
        Some(decoy_tx),
        Arc::clone(&metrics),
    ));
    task_handles.push(tokio::spawn(
        Arc::clone(&camo).run(transition_rx, shutdown_rx.clone()),
    ));

    // Gossip layer (optional): signed envelope server, outbound sharing,
    // bounded application toward quorum/baselines.
    let gossip_out = if cfg.gossip.enabled {
        let signing_key = gossip::load_signing_key(&cfg.gossip.signing_key_path)?;
        let peers = cfg
            .gossip
            .peers
            .iter()
            .map(|p| {
                Ok(gossip::Peer {
                    node_id: p.node_id.clone(),
                    addr: p.addr.clone(),
                    verifying_key: gossip::parse_verifying_key(&p.public_key)
                        .with_context(|| format!("peer '{}'", p.node_id))?,
                    trust_weight: p.trust_weight,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let (update_tx, update_rx) = mpsc::channel(256);
        let node = Arc::new(gossip::GossipNode::new(
            &cfg.general.node_id,
            peers,
            std::time::Duration::from_secs(cfg.gossip.envelope_ttl_secs),
            signing_key,
            update_tx,
            Arc::clone(&metrics),
        ));
        let listener = tokio::net::TcpListener::bind(&cfg.gossip.listen_addr)
            .await
            .with_context(|| format!("binding gossip listener on {}", cfg.gossip.listen_addr))?;
        task_handles.push(tokio::spawn(
            Arc::clone(&node).run_server(listener, shutdown_rx.clone()),
        ));
        task_handles.push(tokio::spawn(gossip::run_apply(
            update_rx,
            Arc::clone(&quorum),
            Arc::clone(&baselines),
            Arc::clone(&metrics),
            shutdown_rx.clone(),
        )));
        let (out_tx, out_rx) = mpsc::channel(256);
        task_handles.push(tokio::spawn(
            Arc::clone(&node).run_broadcast(out_rx, shutdown_rx.clone()),
        ));
        if cfg.gossip.federated_baseline.enabled {
            task_handles.push(tokio::spawn(Arc::clone(&node).run_federated_share(
                Arc::clone(&baselines),
                std::time::Duration::from_secs(cfg.gossip.federated_baseline.share_interval_secs),
                cfg.gossip.federated_baseline.min_samples,
                shutdown_rx.clone(),
            )));
        }
        Some(out_tx)
    } else {
        None
    };

    let engine = Arc::new(escalation::EscalationEngine::new(
        &cfg.general.node_id,
        cfg.weights(),
        cfg.thresholds(),
        Arc::clone(&kernel),
        Arc::clone(&ledger),
        Arc::clone(&bucket),
        Arc::clone(&metrics),
        Box::new(escalation::SignalContainment),
        Some(transition_tx),
    ));

    // PID-sharded worker pool: each shard owns its PIDs' state exclusively.
    let mut shards = Vec::with_capacity(cfg.general.worker_count);
    let mut worker_handles = Vec::with_capacity(cfg.general.worker_count);
    for _ in 0..cfg.general.worker_count {
        let (tx, rx) = mpsc::channel(cfg.general.event_queue_depth);
        let worker = events::Worker::new(
            &cfg.general.node_id,
            cfg.worker_settings(),
            Arc::clone(&engine),
            Arc::clone(&scorer),
            Arc::clone(&baselines),
            Arc::clone(&quorum),
            gossip_out.clone(),
            Arc::clone(&metrics),
        );
        worker_handles.push(tokio::spawn(worker.run(rx, shutdown_rx.clone())));
        shards.push(tx);
    }
    eprintln!("[MAIN] {} event workers started", shards.len());

    task_handles.push(tokio::spawn(events::run_decoy_router(
        decoy_rx,
        shards.clone(),
        Arc::clone(&metrics),
    )));

    // Kernel event source. Failure to attach is fatal: no partial state.
    let source = tokio::fs::File::open(&cfg.general.event_source)
        .await
        .with_context(|| {
            format!(
                "opening kernel event source {}",
                cfg.general.event_source.display()
            )
        })?;
    task_handles.push(tokio::spawn(events::run_reader(
        source,
        shards.clone(),
        Arc::clone(&metrics),
        shutdown_rx.clone(),
    )));

    let operator_socket = Arc::new(operator::OperatorSocket::new(
        cfg.operator.socket_path.clone(),
        cfg.operator.key_hash_path.clone(),
        shards.clone(),
        Arc::clone(&kernel),
        Arc::clone(&metrics),
    ));
    {
        let shutdown_rx = shutdown_rx.clone();
        task_handles.push(tokio::spawn(async move {
            if let Err(e) = operator_socket.run(shutdown_rx).await {
                eprintln!("[OPERATOR] socket failed: {:#}", e);
            }
        }));
    }

    // SIGHUP: validate the new config; a bad file never displaces the
    // running one. Engine parameters apply on the next restart.
    {
        let config_path = config_path.clone();
        tokio::spawn(async move {
            let Ok(mut sighup) =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
            else {
                return;
            };
            while sighup.recv().await.is_some() {
                match Config::load(&config_path) {
                    Ok(_) => eprintln!(
                        "[MAIN] SIGHUP: config at {} is valid, applies on restart",
                        config_path.display()
                    ),
                    Err(e) => eprintln!(
                        "[MAIN] SIGHUP: reload failed, retaining running config: {:#}",
                        e
                    ),
                }
            }
        });
    }

    eprintln!("[MAIN] reflexd running");
    wait_for_shutdown_signal().await;

    // Cancellation propagates to every task through the watch channel; the
    // drain is bounded so a wedged task cannot block exit.
    eprintln!("[MAIN] shutdown signal received");
    let _ = shutdown_tx.send(true);
    let drain = async {
        for handle in worker_handles {
            let _ = handle.await;
        }
        for handle in task_handles {
            let _ = handle.await;
        }
    };
    if tokio::time::timeout(std::time::Duration::from_secs(5), drain)
        .await
        .is_err()
    {
        eprintln!("[MAIN] drain timeout, forcing exit");
    }
    eprintln!("[MAIN] shutdown complete");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("[MAIN] cannot install SIGTERM handler: {}", e);
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}
