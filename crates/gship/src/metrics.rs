// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Engine metrics: atomic counters and gauges with Prometheus text
//! exposition.
//!
//! Counters are updated from hot paths with relaxed atomics; rendering is
//! a cold path that snapshots everything into the standard text format.

use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};

use crate::pressure::Zone;

/// Shared registry for everything the engine exports.
#[derive(Debug, Default)]
pub struct EngineMetrics {
    zone: AtomicU32,
    spills_total: AtomicU64,
    processed_total: AtomicU64,
    ingester_usage_bytes: AtomicI64,
    vault_usage_bytes: AtomicI64,
    replay_starvation_milli: AtomicU64,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current zone as a gauge index (0 Green, 1 Yellow, 2 Red).
    pub fn set_zone(&self, zone: Zone) {
        self.zone.store(zone as u32, Ordering::Relaxed);
    }

    pub fn zone_index(&self) -> u32 {
        self.zone.load(Ordering::Relaxed)
    }

    /// One more record spilled by the reflex fallback.
    pub fn inc_spills(&self) {
        self.spills_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn spills_total(&self) -> u64 {
        self.spills_total.load(Ordering::Relaxed)
    }

    /// One more record drained and processed.
    pub fn inc_processed(&self) {
        self.processed_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn processed_total(&self) -> u64 {
        self.processed_total.load(Ordering::Relaxed)
    }

    pub fn set_ingester_usage(&self, bytes: i64) {
        self.ingester_usage_bytes.store(bytes, Ordering::Relaxed);
    }

    pub fn set_vault_usage(&self, bytes: i64) {
        self.vault_usage_bytes.store(bytes, Ordering::Relaxed);
    }

    /// Replay starvation score (sleep time over processing time), stored
    /// in milli-units so the gauge stays a plain atomic.
    pub fn set_replay_starvation_score(&self, score: f64) {
        let milli = (score * 1000.0).clamp(0.0, u64::MAX as f64) as u64;
        self.replay_starvation_milli.store(milli, Ordering::Relaxed);
    }

    pub fn replay_starvation_score(&self) -> f64 {
        self.replay_starvation_milli.load(Ordering::Relaxed) as f64 / 1000.0
    }

    /// Render every metric in Prometheus text exposition format.
    pub fn render_prometheus(&self) -> String {
        let mut out = String::with_capacity(1024);
        gauge(
            &mut out,
            "gship_ingester_zone_index",
            "Current pressure zone index (0 Green, 1 Yellow, 2 Red).",
            self.zone.load(Ordering::Relaxed) as f64,
        );
        counter(
            &mut out,
            "gship_ingester_spills_total",
            "Records spilled by the reflex fallback.",
            self.spills_total.load(Ordering::Relaxed),
        );
        counter(
            &mut out,
            "gship_ingester_processed_total",
            "Records drained and processed.",
            self.processed_total.load(Ordering::Relaxed),
        );
        gauge(
            &mut out,
            "gship_ingester_usage_bytes",
            "Active memory usage of the ingester in bytes.",
            self.ingester_usage_bytes.load(Ordering::Relaxed) as f64,
        );
        gauge(
            &mut out,
            "gship_vault_usage_bytes",
            "Mapped memory usage of the vault in bytes.",
            self.vault_usage_bytes.load(Ordering::Relaxed) as f64,
        );
        gauge(
            &mut out,
            "gship_replay_starvation_score",
            "Replayer sleep time divided by processing time, per segment.",
            self.replay_starvation_score(),
        );
        out
    }
}

fn gauge(out: &mut String, name: &str, help: &str, value: f64) {
    use std::fmt::Write;
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} gauge");
    let _ = writeln!(out, "{name} {value}");
}

fn counter(out: &mut String, name: &str, help: &str, value: u64) {
    use std::fmt::Write;
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} counter");
    let _ = writeln!(out, "{name} {value}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_contains_every_series() {
        let m = EngineMetrics::new();
        m.set_zone(Zone::Yellow);
        m.inc_spills();
        m.inc_processed();
        m.set_ingester_usage(512);
        m.set_vault_usage(1024);
        m.set_replay_starvation_score(1.5);

        let text = m.render_prometheus();
        assert!(text.contains("gship_ingester_zone_index 1"));
        assert!(text.contains("gship_ingester_spills_total 1"));
        assert!(text.contains("gship_ingester_processed_total 1"));
        assert!(text.contains("gship_ingester_usage_bytes 512"));
        assert!(text.contains("gship_vault_usage_bytes 1024"));
        assert!(text.contains("gship_replay_starvation_score 1.5"));
    }

    #[test]
    fn starvation_score_round_trips_through_milli_units() {
        let m = EngineMetrics::new();
        m.set_replay_starvation_score(0.25);
        assert!((m.replay_starvation_score() - 0.25).abs() < 1e-9);
    }
}
