// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Stochastic resource monitor.
//!
//! Sensing on every operation would put syscalls on the reflex path, so
//! the monitor samples: a padded atomic counter trips a full `sense()`
//! every N operations (N a power of two, tested with a precomputed mask).
//! Between samples, producers keep the component budgets accurate with
//! plain atomic adds.
//!
//! A sense pass reads four signals - process memory footprint, a CPU
//! proxy, ingester usage and vault usage - maps each to a zone through
//! its own yellow/red thresholds, and publishes the worst. All
//! transitions are advisory; the monitor never fails.

use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam::utils::CachePadded;
use tracing::warn;

use crate::metrics::EngineMetrics;
use crate::pressure::{PressureState, Zone};

/// Cadence of the background CPU-proxy sampler.
pub const CPU_SAMPLE_INTERVAL: Duration = Duration::from_secs(2);

/// CPU-proxy score at or above which the CPU signal is Red.
const CPU_RED_SCORE: u32 = 90;
/// CPU-proxy score at or above which the CPU signal is Yellow.
const CPU_YELLOW_SCORE: u32 = 75;

/// Monitor configuration. Budgets of zero disable the matching signal.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Sense every N operations. Power of two enables the mask fast path.
    pub sense_every: u64,
    /// Host RAM budget in bytes for the memory signal.
    pub max_ram: u64,
    /// Fraction of each budget at which the signal turns Yellow.
    pub yellow_threshold: f64,
    /// Fraction of each budget at which the signal turns Red.
    pub red_threshold: f64,
    /// Ingester byte budget.
    pub ingester_budget: u64,
    /// Vault byte budget.
    pub vault_budget: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        MonitorConfig {
            sense_every: 1024,
            max_ram: 512 * 1024 * 1024,
            yellow_threshold: 0.80,
            red_threshold: 0.95,
            ingester_budget: 64 * 1024 * 1024,
            vault_budget: 64 * 1024 * 1024,
        }
    }
}

/// Lock-free sensing monitor. Immutable after construction except for
/// its atomic counters.
pub struct Monitor {
    // Padded so RPC handlers hammering the counter do not share a cache
    // line with the cold configuration fields.
    ops: CachePadded<AtomicU64>,

    sense_every: u64,
    mask: u64,

    max_ram: u64,
    ram_yellow: u64,
    ram_red: u64,

    ingester_budget: u64,
    ingester_yellow: u64,
    ingester_red: u64,
    vault_budget: u64,
    vault_yellow: u64,
    vault_red: u64,

    cpu_score: AtomicU32,
    live_tasks: AtomicU32,

    ingester_usage: AtomicI64,
    vault_usage: AtomicI64,

    state: Arc<PressureState>,
    metrics: Arc<EngineMetrics>,
}

impl Monitor {
    pub fn new(
        config: MonitorConfig,
        state: Arc<PressureState>,
        metrics: Arc<EngineMetrics>,
    ) -> Arc<Self> {
        let sense_every = config.sense_every.max(1);
        let mask = if sense_every.is_power_of_two() {
            sense_every - 1
        } else {
            warn!(
                sense_every,
                "sense interval is not a power of two; falling back to modulo"
            );
            0
        };

        let scale = |budget: u64, fraction: f64| (budget as f64 * fraction) as u64;
        Arc::new(Monitor {
            ops: CachePadded::new(AtomicU64::new(0)),
            sense_every,
            mask,
            max_ram: config.max_ram,
            ram_yellow: scale(config.max_ram, config.yellow_threshold),
            ram_red: scale(config.max_ram, config.red_threshold),
            ingester_budget: config.ingester_budget,
            ingester_yellow: scale(config.ingester_budget, config.yellow_threshold),
            ingester_red: scale(config.ingester_budget, config.red_threshold),
            vault_budget: config.vault_budget,
            vault_yellow: scale(config.vault_budget, config.yellow_threshold),
            vault_red: scale(config.vault_budget, config.red_threshold),
            cpu_score: AtomicU32::new(0),
            live_tasks: AtomicU32::new(0),
            ingester_usage: AtomicI64::new(0),
            vault_usage: AtomicI64::new(0),
            state,
            metrics,
        })
    }

    /// True every N operations. One atomic increment, no locks.
    pub fn should_sense(&self) -> bool {
        let val = self.ops.fetch_add(1, Ordering::Relaxed) + 1;
        if self.mask != 0 {
            val & self.mask == 0
        } else {
            val % self.sense_every == 0
        }
    }

    /// Read every signal, elect the worst zone and publish it on change.
    pub fn sense(&self) {
        let memory = self.memory_signal();
        let cpu = self.cpu_signal();
        let ingester = self.ingester_signal();
        let vault = self.vault_signal();

        self.metrics
            .set_ingester_usage(self.ingester_usage.load(Ordering::Relaxed));
        self.metrics
            .set_vault_usage(self.vault_usage.load(Ordering::Relaxed));

        let candidate = memory.max(cpu).max(ingester).max(vault);
        let current = self.state.zone();
        if candidate != current {
            warn!(
                prev = current.as_str(),
                next = candidate.as_str(),
                memory = memory.as_str(),
                cpu = cpu.as_str(),
                ingester = ingester.as_str(),
                vault = vault.as_str(),
                "zone transition triggered by environment sensing"
            );
            self.state.set_zone(candidate);
        }
    }

    /// Atomic add to the ingester budget signal.
    pub fn report_ingester_usage(&self, delta: i64) {
        self.ingester_usage.fetch_add(delta, Ordering::Relaxed);
    }

    /// Atomic add to the vault budget signal.
    pub fn report_vault_usage(&self, delta: i64) {
        self.vault_usage.fetch_add(delta, Ordering::Relaxed);
    }

    /// Feed from the background sampler: maps the live concurrency count
    /// to a 0-100 load score. A thousand or more concurrent tasks reads
    /// as saturation.
    pub fn record_concurrency(&self, live_tasks: usize) {
        self.live_tasks
            .store(live_tasks.min(u32::MAX as usize) as u32, Ordering::Relaxed);
        let score = (live_tasks / 10).min(100) as u32;
        self.cpu_score.store(score, Ordering::Relaxed);
    }

    /// Last CPU-proxy score (0-100).
    pub fn cpu_score(&self) -> u32 {
        self.cpu_score.load(Ordering::Relaxed)
    }

    /// Last sampled concurrency count.
    pub fn live_tasks(&self) -> u32 {
        self.live_tasks.load(Ordering::Relaxed)
    }

    /// Combined component usage in bytes.
    pub fn total_usage(&self) -> u64 {
        let total =
            self.ingester_usage.load(Ordering::Relaxed) + self.vault_usage.load(Ordering::Relaxed);
        total.max(0) as u64
    }

    pub fn ingester_usage(&self) -> i64 {
        self.ingester_usage.load(Ordering::Relaxed)
    }

    pub fn vault_usage(&self) -> i64 {
        self.vault_usage.load(Ordering::Relaxed)
    }

    fn memory_signal(&self) -> Zone {
        if self.max_ram == 0 {
            return Zone::Green;
        }
        let usage = process_memory_bytes();
        threshold_zone(usage, self.ram_yellow, self.ram_red)
    }

    fn cpu_signal(&self) -> Zone {
        let score = self.cpu_score.load(Ordering::Relaxed);
        if score >= CPU_RED_SCORE {
            Zone::Red
        } else if score >= CPU_YELLOW_SCORE {
            Zone::Yellow
        } else {
            Zone::Green
        }
    }

    fn ingester_signal(&self) -> Zone {
        if self.ingester_budget == 0 {
            return Zone::Green;
        }
        let usage = self.ingester_usage.load(Ordering::Relaxed).max(0) as u64;
        threshold_zone(usage, self.ingester_yellow, self.ingester_red)
    }

    fn vault_signal(&self) -> Zone {
        if self.vault_budget == 0 {
            return Zone::Green;
        }
        let usage = self.vault_usage.load(Ordering::Relaxed).max(0) as u64;
        threshold_zone(usage, self.vault_yellow, self.vault_red)
    }
}

impl std::fmt::Debug for Monitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Monitor")
            .field("sense_every", &self.sense_every)
            .field("max_ram", &self.max_ram)
            .field("ingester_budget", &self.ingester_budget)
            .field("vault_budget", &self.vault_budget)
            .finish_non_exhaustive()
    }
}

fn threshold_zone(usage: u64, yellow: u64, red: u64) -> Zone {
    if usage >= red {
        Zone::Red
    } else if usage >= yellow {
        Zone::Yellow
    } else {
        Zone::Green
    }
}

/// Resident set size of this process in bytes. Zero where unsupported.
#[cfg(target_os = "linux")]
pub fn process_memory_bytes() -> u64 {
    // /proc/self/statm: size resident shared text lib data dt (pages)
    let Ok(statm) = std::fs::read_to_string("/proc/self/statm") else {
        return 0;
    };
    let resident_pages: u64 = statm
        .split_whitespace()
        .nth(1)
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    resident_pages.saturating_mul(page_size.max(0) as u64)
}

#[cfg(not(target_os = "linux"))]
pub fn process_memory_bytes() -> u64 {
    0
}
