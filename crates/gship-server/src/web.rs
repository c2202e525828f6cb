// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Embedded dashboard and metrics exposition.
//!
//! `/` serves the single-page dashboard, `/ws` pushes status snapshots
//! (every second and immediately on zone transitions), and `/metrics`
//! renders the engine registry in Prometheus text format.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::header;
use axum::response::{Html, IntoResponse};
use axum::routing::get;
use axum::Router;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use gship::pressure::Zone;

use crate::status::{status_json, EngineDeps};

const DASHBOARD_HTML: &str = include_str!("../assets/dashboard.html");

#[derive(Clone)]
struct WebCtx {
    deps: Arc<EngineDeps>,
    zone_rx: watch::Receiver<Zone>,
}

/// Build the dashboard router.
pub fn router(deps: Arc<EngineDeps>, zone_rx: watch::Receiver<Zone>) -> Router {
    let ctx = WebCtx { deps, zone_rx };
    Router::new()
        .route("/", get(index))
        .route("/ws", get(ws_upgrade))
        .route("/metrics", get(metrics))
        .with_state(ctx)
}

/// Serve the router until the token fires.
pub async fn serve(
    listener: tokio::net::TcpListener,
    deps: Arc<EngineDeps>,
    zone_rx: watch::Receiver<Zone>,
    token: CancellationToken,
) -> std::io::Result<()> {
    info!(addr = ?listener.local_addr().ok(), "dashboard listening");
    axum::serve(listener, router(deps, zone_rx))
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await
}

async fn index() -> Html<&'static str> {
    Html(DASHBOARD_HTML)
}

async fn metrics(State(ctx): State<WebCtx>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        ctx.deps.metrics.render_prometheus(),
    )
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(ctx): State<WebCtx>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| push_status(socket, ctx))
}

/// Push a snapshot every second, plus immediately on zone transitions.
async fn push_status(mut socket: WebSocket, ctx: WebCtx) {
    debug!("dashboard client connected");
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut zone_rx = ctx.zone_rx.clone();

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            changed = zone_rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
        let snapshot = status_json(&ctx.deps);
        if socket.send(Message::Text(snapshot)).await.is_err() {
            break;
        }
    }
    debug!("dashboard client disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dashboard_page_is_embedded() {
        assert!(DASHBOARD_HTML.contains("GSHIP"));
        assert!(DASHBOARD_HTML.contains("/ws"));
    }
}
