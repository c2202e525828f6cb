// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Status snapshots shared by the control plane and the dashboard.

use std::sync::Arc;
use std::time::Instant;

use gship::buffer::BufferPool;
use gship::ingest::Ingester;
use gship::metrics::EngineMetrics;
use gship::pressure::{Monitor, PressureSource, PressureState, Zone};
use gship_proto::control::v1 as control_proto;

/// Handles every surface needs to describe the engine.
pub struct EngineDeps {
    pub state: Arc<PressureState>,
    pub monitor: Arc<Monitor>,
    pub pool: Arc<BufferPool>,
    pub metrics: Arc<EngineMetrics>,
    pub ingester: Arc<Ingester>,
    pub start_time: Instant,
}

/// Map the engine zone onto the wire enum.
pub fn proto_zone(zone: Zone) -> control_proto::Zone {
    match zone {
        Zone::Green => control_proto::Zone::Green,
        Zone::Yellow => control_proto::Zone::Yellow,
        Zone::Red => control_proto::Zone::Red,
    }
}

/// One status snapshot.
///
/// `heap_objects` reports live pool leases - the closest analog of
/// heap-resident ingest objects this runtime can observe - and
/// `goroutine_count` carries the monitor's sampled concurrency count
/// under its wire-pinned name.
pub fn status_snapshot(deps: &EngineDeps) -> control_proto::StatusResponse {
    control_proto::StatusResponse {
        zone: proto_zone(deps.state.zone()) as i32,
        pressure_score: deps.monitor.cpu_score(),
        memory_usage_bytes: deps.monitor.total_usage(),
        heap_objects: deps.pool.live_leases(),
        goroutine_count: deps.monitor.live_tasks(),
    }
}

/// Snapshot as the JSON document pushed to dashboard clients.
pub fn status_json(deps: &EngineDeps) -> String {
    let zone = deps.state.zone();
    serde_json::json!({
        "zone": zone.as_str(),
        "zone_index": zone as u32,
        "pressure_score": deps.monitor.cpu_score(),
        "memory_usage_bytes": deps.monitor.total_usage(),
        "heap_objects": deps.pool.live_leases(),
        "task_count": deps.monitor.live_tasks(),
        "spills_total": deps.metrics.spills_total(),
        "processed_total": deps.metrics.processed_total(),
        "queue_depth": deps.ingester.queue_depth(),
        "queue_capacity": deps.ingester.queue_capacity(),
        "uptime_seconds": deps.start_time.elapsed().as_secs(),
    })
    .to_string()
}
