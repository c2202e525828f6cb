// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Management plane: Ping, GetStatus, WatchStatus, OverrideZone, plus
//! the gRPC health service.
//!
//! Watch streams do not poll the engine one task per client. A single
//! bridge thread owns the pressure-state subscription and fans zone
//! transitions out through a `tokio::sync::watch`; every stream then
//! selects over its own keepalive ticker and that shared watch, so
//! transitions appear immediately and idle streams still tick.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::RecvTimeoutError;
use tokio::sync::watch;
use tokio_stream::Stream;
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status};
use tonic_health::server::HealthReporter;
use tonic_health::ServingStatus;
use tracing::{debug, info};

use gship::pressure::{Controller, PressureState, Zone};
use gship_proto::control::v1::control_service_server::ControlService;
use gship_proto::control::v1::{
    OverrideZoneRequest, OverrideZoneResponse, PingRequest, PingResponse, StatusRequest,
    StatusResponse, WatchStatusRequest, Zone as ProtoZone,
};

use crate::status::{status_snapshot, EngineDeps};

/// Lower bound for watch cadence.
const WATCH_INTERVAL_FLOOR: Duration = Duration::from_millis(100);
/// Cadence when the client does not specify one.
const WATCH_INTERVAL_DEFAULT: Duration = Duration::from_secs(1);

/// Control-plane service implementation. One instance per listener.
#[derive(Clone)]
pub struct ControlApi {
    deps: Arc<EngineDeps>,
    controller: Option<Arc<Controller>>,
    zone_rx: watch::Receiver<Zone>,
}

impl ControlApi {
    pub fn new(
        deps: Arc<EngineDeps>,
        controller: Option<Arc<Controller>>,
        zone_rx: watch::Receiver<Zone>,
    ) -> Self {
        ControlApi {
            deps,
            controller,
            zone_rx,
        }
    }
}

#[tonic::async_trait]
impl ControlService for ControlApi {
    async fn ping(&self, _request: Request<PingRequest>) -> Result<Response<PingResponse>, Status> {
        Ok(Response::new(PingResponse {
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_seconds: self.deps.start_time.elapsed().as_secs() as i64,
        }))
    }

    async fn get_status(
        &self,
        _request: Request<StatusRequest>,
    ) -> Result<Response<StatusResponse>, Status> {
        Ok(Response::new(status_snapshot(&self.deps)))
    }

    type WatchStatusStream = Pin<Box<dyn Stream<Item = Result<StatusResponse, Status>> + Send>>;

    async fn watch_status(
        &self,
        request: Request<WatchStatusRequest>,
    ) -> Result<Response<Self::WatchStatusStream>, Status> {
        let interval = watch_interval(request.into_inner().refresh_interval_ms);
        let deps = Arc::clone(&self.deps);
        let mut zone_rx = self.zone_rx.clone();
        debug!(interval_ms = interval.as_millis() as u64, "status stream started");

        let stream = async_stream::stream! {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        yield Ok::<_, Status>(status_snapshot(&deps));
                    }
                    changed = zone_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        yield Ok::<_, Status>(status_snapshot(&deps));
                    }
                }
            }
        };
        Ok(Response::new(Box::pin(stream) as Self::WatchStatusStream))
    }

    async fn override_zone(
        &self,
        request: Request<OverrideZoneRequest>,
    ) -> Result<Response<OverrideZoneResponse>, Status> {
        let controller = self
            .controller
            .as_ref()
            .ok_or_else(|| Status::failed_precondition("no controller attached"))?;

        let requested = ProtoZone::try_from(request.into_inner().zone)
            .map_err(|_| Status::invalid_argument("unknown zone"))?;

        match requested {
            ProtoZone::Unspecified => {
                controller.clear_override();
                info!("zone override cleared by operator");
            }
            ProtoZone::Green => controller.override_zone(Zone::Green),
            ProtoZone::Yellow => controller.override_zone(Zone::Yellow),
            ProtoZone::Red => controller.override_zone(Zone::Red),
        }
        Ok(Response::new(OverrideZoneResponse {}))
    }
}

/// Floor to 100 ms; zero means the 1 s default.
fn watch_interval(refresh_interval_ms: u32) -> Duration {
    if refresh_interval_ms == 0 {
        WATCH_INTERVAL_DEFAULT
    } else {
        Duration::from_millis(refresh_interval_ms as u64).max(WATCH_INTERVAL_FLOOR)
    }
}

/// Bridge the engine's synchronous zone subscription into an async
/// watch channel. One thread serves every stream and the health task.
pub fn spawn_zone_bridge(
    state: &Arc<PressureState>,
    token: CancellationToken,
) -> std::io::Result<watch::Receiver<Zone>> {
    let (zone_events, subscription) = state.subscribe();
    let (tx, rx) = watch::channel(state.zone());
    let state = Arc::clone(state);

    std::thread::Builder::new()
        .name("gship-zone-bridge".into())
        .spawn(move || {
            let _subscription = subscription;
            // Notifications can be shed under a burst of transitions, so
            // publish the authoritative current zone rather than the
            // event payload, and reconcile again on every timeout.
            let publish = |tx: &watch::Sender<Zone>| {
                let current = state.zone();
                if *tx.borrow() != current {
                    tx.send_replace(current);
                }
            };
            loop {
                match zone_events.recv_timeout(Duration::from_millis(100)) {
                    Ok(_) => publish(&tx),
                    Err(RecvTimeoutError::Timeout) => {
                        if token.is_cancelled() {
                            return;
                        }
                        publish(&tx);
                    }
                    Err(RecvTimeoutError::Disconnected) => return,
                }
            }
        })?;

    Ok(rx)
}

/// Serving in Green and Yellow, not-serving in Red.
pub fn serving_status_for(zone: Zone) -> ServingStatus {
    if zone == Zone::Red {
        ServingStatus::NotServing
    } else {
        ServingStatus::Serving
    }
}

/// Keep the gRPC health service in lockstep with the zone.
pub async fn zone_health_task(
    mut reporter: HealthReporter,
    mut zone_rx: watch::Receiver<Zone>,
    token: CancellationToken,
) {
    loop {
        let status = serving_status_for(*zone_rx.borrow_and_update());
        reporter.set_service_status("", status).await;
        reporter
            .set_service_status("gship.control.v1.ControlService", status)
            .await;

        tokio::select! {
            _ = token.cancelled() => return,
            changed = zone_rx.changed() => {
                if changed.is_err() {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gship::buffer::BufferPool;
    use gship::ingest::Ingester;
    use gship::metrics::EngineMetrics;
    use gship::pressure::{Monitor, MonitorConfig, PressureSource};
    use std::time::Instant;

    fn deps() -> Arc<EngineDeps> {
        let metrics = Arc::new(EngineMetrics::new());
        let state = PressureState::new(Arc::clone(&metrics));
        let monitor = Monitor::new(
            MonitorConfig::default(),
            Arc::clone(&state),
            Arc::clone(&metrics),
        );
        let pool = BufferPool::new();
        let ingester = Ingester::new(
            16,
            Arc::clone(&pool),
            Arc::clone(&monitor),
            Arc::clone(&metrics),
        );
        Arc::new(EngineDeps {
            state,
            monitor,
            pool,
            metrics,
            ingester,
            start_time: Instant::now(),
        })
    }

    fn api(deps: &Arc<EngineDeps>, with_controller: bool) -> ControlApi {
        let controller = with_controller.then(|| {
            Controller::new(
                Arc::clone(&deps.ingester) as Arc<dyn PressureSource>,
                Arc::clone(&deps.state),
            )
        });
        let (_tx, rx) = watch::channel(Zone::Green);
        ControlApi::new(Arc::clone(deps), controller, rx)
    }

    #[test]
    fn watch_interval_floors_and_defaults() {
        assert_eq!(watch_interval(0), Duration::from_secs(1));
        assert_eq!(watch_interval(10), Duration::from_millis(100));
        assert_eq!(watch_interval(100), Duration::from_millis(100));
        assert_eq!(watch_interval(2500), Duration::from_millis(2500));
    }

    #[tokio::test]
    async fn ping_reports_version_and_uptime() {
        let deps = deps();
        let api = api(&deps, false);
        let response = api.ping(Request::new(PingRequest {})).await.expect("ping");
        let body = response.into_inner();
        assert_eq!(body.version, env!("CARGO_PKG_VERSION"));
        assert!(body.uptime_seconds >= 0);
    }

    #[tokio::test]
    async fn override_without_controller_fails_precondition() {
        let deps = deps();
        let api = api(&deps, false);
        let status = api
            .override_zone(Request::new(OverrideZoneRequest {
                zone: ProtoZone::Red as i32,
            }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::FailedPrecondition);
    }

    #[tokio::test]
    async fn override_pins_and_clear_restores() {
        let deps = deps();
        let api = api(&deps, true);

        api.override_zone(Request::new(OverrideZoneRequest {
            zone: ProtoZone::Red as i32,
        }))
        .await
        .expect("override");
        assert_eq!(deps.state.zone(), Zone::Red);

        api.override_zone(Request::new(OverrideZoneRequest {
            zone: ProtoZone::Unspecified as i32,
        }))
        .await
        .expect("clear");
        // Queue is empty, so reassessment recovers to Green.
        assert_eq!(deps.state.zone(), Zone::Green);
    }

    #[tokio::test]
    async fn get_status_carries_current_zone() {
        let deps = deps();
        let api = api(&deps, false);
        deps.state.set_zone(Zone::Yellow);
        let response = api
            .get_status(Request::new(StatusRequest {}))
            .await
            .expect("status");
        assert_eq!(response.into_inner().zone, ProtoZone::Yellow as i32);
    }

    #[test]
    fn health_is_not_serving_exactly_in_red() {
        assert!(matches!(
            serving_status_for(Zone::Green),
            ServingStatus::Serving
        ));
        assert!(matches!(
            serving_status_for(Zone::Yellow),
            ServingStatus::Serving
        ));
        assert!(matches!(
            serving_status_for(Zone::Red),
            ServingStatus::NotServing
        ));
    }

    #[test]
    fn zone_bridge_forwards_transitions() {
        let metrics = Arc::new(EngineMetrics::new());
        let state = PressureState::new(Arc::clone(&metrics));
        let token = CancellationToken::new();
        let mut rx = spawn_zone_bridge(&state, token.clone()).expect("bridge");

        assert_eq!(*rx.borrow(), Zone::Green);
        state.set_zone(Zone::Red);

        let deadline = Instant::now() + Duration::from_secs(2);
        while *rx.borrow_and_update() != Zone::Red && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(*rx.borrow(), Zone::Red);
        token.cancel();
    }
}
