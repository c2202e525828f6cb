// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! GSHIP diagnostic CLI.
//!
//! Talks to the engine's management plane over the local socket
//! (default) or mTLS TCP. Exit codes are machine-readable: 0/1/2 mirror
//! the Green/Yellow/Red zone, 128 is an application error, 129 a
//! connectivity failure, 130 an authentication failure.
//!
//! ```bash
//! # Zone-aware health check for scripts
//! gshipctl --socket /run/gship/control.sock status
//!
//! # Force a drain, then restore sensor control
//! gshipctl --socket /run/gship/control.sock override --zone red
//! gshipctl --socket /run/gship/control.sock override --zone none
//!
//! # Live dashboard over mTLS
//! gshipctl --tls --addr gship.internal:9092 \
//!     --cert client.crt --key client.key --ca ca.crt top
//! ```

mod format;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Endpoint, Identity, Uri};
use tonic::{Code, Request, Status};
use tracing_subscriber::EnvFilter;

use gship_proto::control::v1::control_service_client::ControlServiceClient;
use gship_proto::control::v1::{
    OverrideZoneRequest, PingRequest, StatusRequest, WatchStatusRequest, Zone,
};

use format::{exit_code_for_zone, OutputFormat, StatusView};

const EXIT_APP_ERROR: i32 = 128;
const EXIT_CONNECTIVITY: i32 = 129;
const EXIT_AUTHENTICATION: i32 = 130;

/// GSHIP engine diagnostics.
#[derive(Parser, Debug)]
#[command(name = "gshipctl")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the engine's local control socket.
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Address of the remote control plane (with --tls).
    #[arg(long, default_value = "localhost:9092")]
    addr: String,

    /// Connect over mTLS instead of the local socket.
    #[arg(long)]
    tls: bool,

    /// Client certificate for mTLS.
    #[arg(long)]
    cert: Option<PathBuf>,

    /// Client private key for mTLS.
    #[arg(long)]
    key: Option<PathBuf>,

    /// CA certificate that signed the server (and client) certs.
    #[arg(long)]
    ca: Option<PathBuf>,

    /// Server name expected on the control-plane certificate.
    #[arg(long, default_value = "localhost")]
    domain: String,

    /// Output format for status data.
    #[arg(long, value_enum, default_value_t = OutputFormat::Table)]
    output: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show engine health and the current pressure zone.
    Status {
        /// Render a synthetic zone without contacting the engine
        /// (0 Green, 1 Yellow, 2 Red). For exit-code scripting tests.
        #[arg(long)]
        mock_zone: Option<u32>,
    },
    /// Pin or release the pressure zone.
    Override {
        #[arg(long, value_enum)]
        zone: ZoneArg,
    },
    /// Live status dashboard streamed from the engine.
    Top {
        /// Refresh interval in milliseconds (floored to 100 by the engine).
        #[arg(long, default_value_t = 1000)]
        refresh_ms: u32,
    },
    /// Round-trip liveness check.
    Ping,
}

#[derive(ValueEnum, Debug, Clone, Copy)]
enum ZoneArg {
    Green,
    Yellow,
    Red,
    /// Clear the override and restore sensor control.
    None,
}

impl ZoneArg {
    fn to_proto(self) -> Zone {
        match self {
            ZoneArg::Green => Zone::Green,
            ZoneArg::Yellow => Zone::Yellow,
            ZoneArg::Red => Zone::Red,
            ZoneArg::None => Zone::Unspecified,
        }
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let _ = rustls::crypto::ring::default_provider().install_default();

    let code = run(args).await;
    std::process::exit(code);
}

async fn run(args: Args) -> i32 {
    match &args.command {
        Command::Status { mock_zone } => {
            if let Some(mock) = mock_zone {
                let zone = match *mock {
                    0 => Zone::Green,
                    1 => Zone::Yellow,
                    2 => Zone::Red,
                    _ => Zone::Unspecified,
                };
                let view = StatusView {
                    zone: format::zone_name(zone as i32),
                    pressure_score: 0,
                    memory_usage_bytes: 0,
                    heap_objects: 0,
                    task_count: 0,
                };
                return render_and_exit_code(&args, &view, zone as i32);
            }

            let mut client = match connect(&args).await {
                Ok(client) => client,
                Err(err) => return report_connect_error(err),
            };
            match client.get_status(Request::new(StatusRequest {})).await {
                Ok(response) => {
                    let status = response.into_inner();
                    let view = StatusView::from_response(&status);
                    render_and_exit_code(&args, &view, status.zone)
                }
                Err(status) => report_rpc_error(&status),
            }
        }

        Command::Override { zone } => {
            let mut client = match connect(&args).await {
                Ok(client) => client,
                Err(err) => return report_connect_error(err),
            };
            let target = zone.to_proto();
            match client
                .override_zone(Request::new(OverrideZoneRequest {
                    zone: target as i32,
                }))
                .await
            {
                Ok(_) => {
                    if target == Zone::Unspecified {
                        println!("Zone override cleared. Sensor control restored.");
                    } else {
                        println!("Zone overridden to {}.", format::zone_name(target as i32));
                    }
                    0
                }
                Err(status) => report_rpc_error(&status),
            }
        }

        Command::Top { refresh_ms } => {
            let mut client = match connect(&args).await {
                Ok(client) => client,
                Err(err) => return report_connect_error(err),
            };
            let stream = client
                .watch_status(Request::new(WatchStatusRequest {
                    refresh_interval_ms: *refresh_ms,
                }))
                .await;
            let mut stream = match stream {
                Ok(response) => response.into_inner(),
                Err(status) => return report_rpc_error(&status),
            };

            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => return 0,
                    message = stream.message() => match message {
                        Ok(Some(status)) => {
                            let view = StatusView::from_response(&status);
                            // Clear screen, home cursor, redraw.
                            print!("\x1B[2J\x1B[H");
                            match args.output.render(&view) {
                                Ok(text) => println!("{text}"),
                                Err(err) => {
                                    eprintln!("render error: {err}");
                                    return EXIT_APP_ERROR;
                                }
                            }
                        }
                        Ok(None) => {
                            eprintln!("stream closed by engine");
                            return 0;
                        }
                        Err(status) => return report_rpc_error(&status),
                    }
                }
            }
        }

        Command::Ping => {
            let mut client = match connect(&args).await {
                Ok(client) => client,
                Err(err) => return report_connect_error(err),
            };
            match client.ping(Request::new(PingRequest {})).await {
                Ok(response) => {
                    let body = response.into_inner();
                    println!("version {} up {}s", body.version, body.uptime_seconds);
                    0
                }
                Err(status) => report_rpc_error(&status),
            }
        }
    }
}

fn render_and_exit_code(args: &Args, view: &StatusView, raw_zone: i32) -> i32 {
    match args.output.render(view) {
        Ok(text) => {
            println!("{text}");
            exit_code_for_zone(raw_zone)
        }
        Err(err) => {
            eprintln!("render error: {err}");
            EXIT_APP_ERROR
        }
    }
}

/// Dial the control plane: local socket by default, mTLS with --tls.
async fn connect(args: &Args) -> anyhow::Result<ControlServiceClient<Channel>> {
    let channel = if args.tls {
        let cert = read_pem(args.cert.as_deref().context("--cert is required with --tls")?)?;
        let key = read_pem(args.key.as_deref().context("--key is required with --tls")?)?;
        let ca = read_pem(args.ca.as_deref().context("--ca is required with --tls")?)?;

        let tls = ClientTlsConfig::new()
            .ca_certificate(Certificate::from_pem(ca))
            .identity(Identity::from_pem(cert, key))
            .domain_name(args.domain.clone());

        Channel::from_shared(format!("https://{}", args.addr))
            .context("invalid control-plane address")?
            .tls_config(tls)
            .context("invalid TLS configuration")?
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(5))
            .connect()
            .await
            .context("failed to connect to the control plane")?
    } else {
        let path = args
            .socket
            .clone()
            .context("--socket is required unless --tls is set")?;
        // The URI is a placeholder; the connector dials the socket.
        Endpoint::from_static("http://control.gship.local")
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(5))
            .connect_with_connector(tower::service_fn(move |_: Uri| {
                let path = path.clone();
                async move {
                    Ok::<_, std::io::Error>(hyper_util::rt::TokioIo::new(
                        tokio::net::UnixStream::connect(path).await?,
                    ))
                }
            }))
            .await
            .context("failed to connect to the control socket")?
    };
    Ok(ControlServiceClient::new(channel))
}

fn read_pem(path: &std::path::Path) -> anyhow::Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))
}

fn report_connect_error(err: anyhow::Error) -> i32 {
    let text = format!("{err:#}").to_lowercase();
    if text.contains("tls")
        || text.contains("certificate")
        || text.contains("handshake")
        || text.contains("unknown issuer")
    {
        eprintln!("authentication failure: {err:#}");
        eprintln!("hint: verify client certificate, key and CA trust");
        return EXIT_AUTHENTICATION;
    }
    eprintln!("connection failure: {err:#}");
    eprintln!("hint: is the engine running, and is the address/socket correct?");
    EXIT_CONNECTIVITY
}

fn report_rpc_error(status: &Status) -> i32 {
    let code = classify_status(status);
    match code {
        EXIT_CONNECTIVITY => eprintln!("connection failure: {}", status.message()),
        EXIT_AUTHENTICATION => eprintln!("authentication failure: {}", status.message()),
        _ => eprintln!("engine error: {status}"),
    }
    code
}

/// Map gRPC status codes onto the exit-code contract.
fn classify_status(status: &Status) -> i32 {
    match status.code() {
        Code::Unavailable | Code::DeadlineExceeded | Code::Cancelled => EXIT_CONNECTIVITY,
        Code::Unauthenticated | Code::PermissionDenied => EXIT_AUTHENTICATION,
        _ => {
            let message = status.message().to_lowercase();
            if message.contains("tls") || message.contains("certificate") {
                EXIT_AUTHENTICATION
            } else {
                EXIT_APP_ERROR
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grpc_codes_map_to_exit_contract() {
        assert_eq!(
            classify_status(&Status::unavailable("connection refused")),
            EXIT_CONNECTIVITY
        );
        assert_eq!(
            classify_status(&Status::deadline_exceeded("timed out")),
            EXIT_CONNECTIVITY
        );
        assert_eq!(
            classify_status(&Status::permission_denied("security violation")),
            EXIT_AUTHENTICATION
        );
        assert_eq!(
            classify_status(&Status::unauthenticated("no cert")),
            EXIT_AUTHENTICATION
        );
        assert_eq!(
            classify_status(&Status::internal("tls: bad certificate")),
            EXIT_AUTHENTICATION
        );
        assert_eq!(
            classify_status(&Status::internal("boom")),
            EXIT_APP_ERROR
        );
    }
}
