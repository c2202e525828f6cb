// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! GSHIP sidecar entry point.
//!
//! Construction order matters for the pressure loop: the ingester's
//! queue exists first, the controller is built with the ingester as its
//! pressure source, and the controller handle is then wired back into
//! the ingester for reflex-time reassessment.
//!
//! ```bash
//! # Defaults (config.yaml if present, no TLS, no vault)
//! gship
//!
//! # Explicit config and verbose logging
//! gship --config /etc/gship/config.yaml --log-level debug
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use gship::config::Config;
use gship::ingest::Ingester;
use gship::metrics::EngineMetrics;
use gship::pressure::{
    Controller, Monitor, MonitorConfig, PressureSource, PressureState, CPU_SAMPLE_INTERVAL,
};
use gship::vault::{ReplayError, Replayer, Wal};
use gship_proto::control::v1::control_service_server::ControlServiceServer;
use gship_proto::logs::v1::logs_service_server::LogsServiceServer;

use gship_server::control::{spawn_zone_bridge, zone_health_task, ControlApi};
use gship_server::ingest_rpc::LogsIngestService;
use gship_server::security::{AuthInterceptor, AuthMode};
use gship_server::status::EngineDeps;
use gship_server::{tls, web};

/// GSHIP - homeostatic telemetry ingestion sidecar.
#[derive(Parser, Debug)]
#[command(name = "gship")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file (YAML). Falls back to GS_CONFIG, then
    /// ./config.yaml.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level when RUST_LOG is unset (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .init();

    // Pin the TLS crypto provider before any endpoint config is built.
    let _ = rustls::crypto::ring::default_provider().install_default();

    info!(version = env!("CARGO_PKG_VERSION"), "starting GSHIP engine");

    let cfg = match Config::load(args.config.as_deref()) {
        Ok(cfg) => cfg,
        Err(err) => {
            warn!(error = %err, "failed to load configuration; using defaults");
            Config::default()
        }
    };

    // === Pressure loop construction ===
    let metrics = Arc::new(EngineMetrics::new());
    let state = PressureState::new(Arc::clone(&metrics));
    let monitor = Monitor::new(
        MonitorConfig {
            max_ram: cfg.monitoring.max_ram,
            yellow_threshold: cfg.monitoring.yellow_threshold,
            red_threshold: cfg.monitoring.red_threshold,
            ingester_budget: cfg.monitoring.ingester_budget,
            vault_budget: cfg.monitoring.vault_budget,
            ..MonitorConfig::default()
        },
        Arc::clone(&state),
        Arc::clone(&metrics),
    );
    let pool = gship::buffer::BufferPool::new();
    let ingester = Ingester::new(
        cfg.ingester.buffer_size,
        Arc::clone(&pool),
        Arc::clone(&monitor),
        Arc::clone(&metrics),
    );
    let controller = Controller::new(
        Arc::clone(&ingester) as Arc<dyn PressureSource>,
        Arc::clone(&state),
    );
    ingester.attach_controller(Arc::clone(&controller));

    let deps = Arc::new(EngineDeps {
        state: Arc::clone(&state),
        monitor: Arc::clone(&monitor),
        pool: Arc::clone(&pool),
        metrics: Arc::clone(&metrics),
        ingester: Arc::clone(&ingester),
        start_time: Instant::now(),
    });

    let token = CancellationToken::new();
    let mut worker_threads = Vec::new();
    let mut server_tasks = Vec::new();

    // === Vault spill and startup replay ===
    let vault = if cfg.vault.dir.is_empty() {
        None
    } else {
        let wal = Wal::open(
            &cfg.vault.dir,
            cfg.vault.segment_size,
            Some(Arc::clone(&monitor)),
        )
        .context("failed to open vault")?;
        ingester.attach_vault(Arc::clone(&wal));

        let replayer = Replayer::new(
            Arc::clone(&wal),
            Arc::clone(&state),
            Arc::clone(&metrics),
            cfg.vault.replay_rate,
        );
        let replay_ingester = Arc::clone(&ingester);
        let replay_token = token.clone();
        worker_threads.push(
            std::thread::Builder::new()
                .name("gship-replay".into())
                .spawn(move || {
                    match replay_ingester.replay_vault(&replayer, &replay_token) {
                        Ok(()) => info!("vault replay complete"),
                        Err(ReplayError::Cancelled) => info!("vault replay cancelled"),
                        Err(err) => error!(error = %err, "vault replay failed"),
                    }
                })
                .context("failed to spawn replay thread")?,
        );
        Some(wal)
    };

    // === Background workers ===
    worker_threads.push(
        ingester
            .spawn_drain(token.clone())
            .context("failed to spawn drain worker")?,
    );

    {
        let monitor = Arc::clone(&monitor);
        let token = token.clone();
        server_tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(CPU_SAMPLE_INTERVAL);
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = ticker.tick() => {
                        let rt = tokio::runtime::Handle::current();
                        monitor.record_concurrency(rt.metrics().num_alive_tasks());
                    }
                }
            }
        }));
    }

    let zone_rx =
        spawn_zone_bridge(&state, token.clone()).context("failed to spawn zone bridge")?;

    // === Health ===
    let (health_reporter, health_service) = tonic_health::server::health_reporter();
    server_tasks.push(tokio::spawn(zone_health_task(
        health_reporter,
        zone_rx.clone(),
        token.clone(),
    )));

    // === Ingest RPC ===
    {
        let addr = normalize_addr(&cfg.ingester.addr)?;
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind ingest endpoint {addr}"))?;
        let service =
            LogsServiceServer::new(LogsIngestService::new(Arc::clone(&deps), token.clone()));
        let shutdown = token.clone();

        if cfg.ingester.tls.enabled() {
            anyhow::ensure!(
                !cfg.ingester.tls.cert_file.is_empty() && !cfg.ingester.tls.key_file.is_empty(),
                "incomplete TLS configuration: both cert_file and key_file are required"
            );
            let ca = (!cfg.ingester.tls.ca_file.is_empty()).then_some(cfg.ingester.tls.ca_file.as_str());
            let tls_config =
                tls::server_config(&cfg.ingester.tls.cert_file, &cfg.ingester.tls.key_file, ca)
                    .context("failed to build ingest TLS config")?;
            if ca.is_some() {
                info!(addr = %addr, "ingest endpoint listening (mTLS)");
            } else {
                info!(addr = %addr, "ingest endpoint listening (TLS 1.3)");
            }
            let incoming = tls::tls_incoming(listener, TlsAcceptor::from(Arc::new(tls_config)));
            server_tasks.push(tokio::spawn(async move {
                if let Err(err) = Server::builder()
                    .add_service(service)
                    .serve_with_incoming_shutdown(incoming, shutdown.cancelled_owned())
                    .await
                {
                    error!(error = %err, "ingest server failed");
                }
            }));
        } else {
            warn!(addr = %addr, "ingest endpoint listening WITHOUT TLS (insecure)");
            let incoming = TcpListenerStream::new(listener);
            server_tasks.push(tokio::spawn(async move {
                if let Err(err) = Server::builder()
                    .add_service(service)
                    .serve_with_incoming_shutdown(incoming, shutdown.cancelled_owned())
                    .await
                {
                    error!(error = %err, "ingest server failed");
                }
            }));
        }
    }

    // === Control plane: mTLS TCP ===
    {
        let addr = normalize_addr(&cfg.control.addr)?;
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind control endpoint {addr}"))?;
        let mode = if cfg.ingester.tls.mutual() {
            AuthMode::Mtls
        } else {
            AuthMode::Insecure
        };
        let api = ControlApi::new(
            Arc::clone(&deps),
            Some(Arc::clone(&controller)),
            zone_rx.clone(),
        );
        let service = ControlServiceServer::with_interceptor(api, AuthInterceptor::new(mode));
        let health = health_service.clone();
        let shutdown = token.clone();

        if mode == AuthMode::Mtls {
            let tls_config = tls::server_config(
                &cfg.ingester.tls.cert_file,
                &cfg.ingester.tls.key_file,
                Some(&cfg.ingester.tls.ca_file),
            )
            .context("failed to build control-plane TLS config")?;
            info!(addr = %addr, "control plane listening (mTLS)");
            let incoming = tls::tls_incoming(listener, TlsAcceptor::from(Arc::new(tls_config)));
            server_tasks.push(tokio::spawn(async move {
                if let Err(err) = Server::builder()
                    .add_service(service)
                    .add_service(health)
                    .serve_with_incoming_shutdown(incoming, shutdown.cancelled_owned())
                    .await
                {
                    error!(error = %err, "control server failed");
                }
            }));
        } else {
            // Health stays reachable; management methods are refused by
            // the interceptor on this listener.
            warn!(addr = %addr, "control plane listening without mTLS; management calls will be rejected");
            let incoming = TcpListenerStream::new(listener);
            server_tasks.push(tokio::spawn(async move {
                if let Err(err) = Server::builder()
                    .add_service(service)
                    .add_service(health)
                    .serve_with_incoming_shutdown(incoming, shutdown.cancelled_owned())
                    .await
                {
                    error!(error = %err, "control server failed");
                }
            }));
        }
    }

    // === Control plane: local socket ===
    #[cfg(unix)]
    if !cfg.control.socket_path.is_empty() {
        use std::os::unix::fs::PermissionsExt;

        let path = PathBuf::from(&cfg.control.socket_path);
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(err).with_context(|| format!("failed to remove stale socket {path:?}"))
            }
        }
        let listener = tokio::net::UnixListener::bind(&path)
            .with_context(|| format!("failed to bind local socket {path:?}"))?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o660))
            .with_context(|| format!("failed to set permissions on {path:?}"))?;

        let api = ControlApi::new(
            Arc::clone(&deps),
            Some(Arc::clone(&controller)),
            zone_rx.clone(),
        );
        let service =
            ControlServiceServer::with_interceptor(api, AuthInterceptor::new(AuthMode::LocalSocket));
        let health = health_service.clone();
        let shutdown = token.clone();
        let incoming = gship_server::security::uds_incoming(listener);
        info!(socket = %path.display(), "control plane listening (local socket)");
        server_tasks.push(tokio::spawn(async move {
            if let Err(err) = Server::builder()
                .add_service(service)
                .add_service(health)
                .serve_with_incoming_shutdown(incoming, shutdown.cancelled_owned())
                .await
            {
                error!(error = %err, "local control server failed");
            }
        }));
    }

    // === Dashboard ===
    if !cfg.web.addr.is_empty() {
        let addr = normalize_addr(&cfg.web.addr)?;
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind dashboard {addr}"))?;
        let web_deps = Arc::clone(&deps);
        let web_zone_rx = zone_rx.clone();
        let web_token = token.clone();
        server_tasks.push(tokio::spawn(async move {
            if let Err(err) = web::serve(listener, web_deps, web_zone_rx, web_token).await {
                error!(error = %err, "dashboard server failed");
            }
        }));
    }

    info!("GSHIP engine is active");
    wait_for_shutdown_signal().await;
    info!("shutdown signal received; draining");

    // === Graceful shutdown ===
    token.cancel();
    for task in server_tasks {
        if tokio::time::timeout(Duration::from_secs(5), task).await.is_err() {
            warn!("server task did not stop within the grace period");
        }
    }
    if let Some(wal) = vault {
        if let Err(err) = wal.close() {
            error!(error = %err, "vault close failed");
        }
    }
    for thread in worker_threads {
        let _ = thread.join();
    }

    info!("shutdown complete");
    Ok(())
}

/// Accept Go-style ":4317" shorthand alongside full socket addresses.
fn normalize_addr(addr: &str) -> anyhow::Result<std::net::SocketAddr> {
    let full = if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    };
    full.parse()
        .with_context(|| format!("invalid listen address {addr:?}"))
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            Ok(stream) => stream,
            Err(err) => {
                error!(error = %err, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
