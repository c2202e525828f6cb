// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The ingestion reflex.
//!
//! `ingest` is the engine's hot path and must stay at predictable,
//! single-digit-microsecond cost under contention: one amortized sensing
//! check, one non-blocking enqueue, and on queue-full an immediate pivot
//! to the spill fallback. Nothing on this path blocks, allocates (after
//! warm-up) or takes a lock.
//!
//! A single drain worker consumes the queue; replay feeds recovered
//! vault blocks back through the same queue with blocking sends so it
//! can never out-compete live traffic.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, SendTimeoutError, TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::buffer::{BufferPool, Lease};
use crate::metrics::EngineMetrics;
use crate::pressure::{Controller, Monitor, PressureSource};
use crate::vault::{ReplayError, Replayer, Wal};

/// Queue capacity when the configuration does not say otherwise.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// High-throughput entry point: bounded queue plus spill fallback.
pub struct Ingester {
    tx: Sender<Lease>,
    rx: Receiver<Lease>,
    capacity: usize,
    pool: Arc<BufferPool>,
    monitor: Arc<Monitor>,
    metrics: Arc<EngineMetrics>,
    controller: OnceLock<Arc<Controller>>,
    vault: OnceLock<Arc<Wal>>,
    processed: AtomicU64,
    spilled: AtomicU64,
}

impl Ingester {
    /// Build the queue first; the controller is wired in afterwards via
    /// [`Ingester::attach_controller`] because it needs the ingester as
    /// its pressure source.
    pub fn new(
        capacity: usize,
        pool: Arc<BufferPool>,
        monitor: Arc<Monitor>,
        metrics: Arc<EngineMetrics>,
    ) -> Arc<Self> {
        let capacity = if capacity == 0 {
            DEFAULT_QUEUE_CAPACITY
        } else {
            capacity
        };
        if !capacity.is_power_of_two() {
            warn!(
                requested = capacity,
                "queue capacity is not a power of two; scheduling may be less cache-friendly"
            );
        }
        let (tx, rx) = channel::bounded(capacity);
        Arc::new(Ingester {
            tx,
            rx,
            capacity,
            pool,
            monitor,
            metrics,
            controller: OnceLock::new(),
            vault: OnceLock::new(),
            processed: AtomicU64::new(0),
            spilled: AtomicU64::new(0),
        })
    }

    /// Wire in the controller. Later calls are ignored.
    pub fn attach_controller(&self, controller: Arc<Controller>) {
        let _ = self.controller.set(controller);
    }

    /// Route queue-full spills into a vault instead of dropping them.
    pub fn attach_vault(&self, vault: Arc<Wal>) {
        let _ = self.vault.set(vault);
    }

    /// The reflex. Never blocks, never fails.
    pub fn ingest(&self, lease: Lease, token: &CancellationToken) {
        // Amortized sensing: every Nth operation pays for a full
        // environment pass and a hysteresis reassessment.
        if self.monitor.should_sense() {
            self.monitor.sense();
            if let Some(controller) = self.controller.get() {
                controller.reassess();
            }
        }

        match self.tx.try_send(lease) {
            Ok(()) => {}
            Err(TrySendError::Full(lease)) => {
                if token.is_cancelled() {
                    self.discard(lease);
                } else {
                    self.fallback(lease);
                }
            }
            Err(TrySendError::Disconnected(lease)) => self.discard(lease),
        }
    }

    /// Queue-full pivot: persist (or release) the buffer before any
    /// logging so the reflex latency stays flat, then account for it.
    fn fallback(&self, lease: Lease) {
        let size = lease.len();
        match self.vault.get() {
            Some(vault) => vault.write(lease),
            None => drop(lease),
        }

        self.monitor.report_ingester_usage(-(size as i64));
        self.metrics.inc_spills();

        let dropped = self.spilled.fetch_add(1, Ordering::Relaxed) + 1;
        if dropped.is_power_of_two() {
            info!(
                size_bytes = size,
                total_spilled = dropped,
                "queue full: spilling to vault"
            );
        }
    }

    fn discard(&self, lease: Lease) {
        let size = lease.len();
        drop(lease);
        self.monitor.report_ingester_usage(-(size as i64));
    }

    /// Spawn the sole queue consumer. Exits on cancellation or when every
    /// sender is gone.
    pub fn spawn_drain(self: &Arc<Self>, token: CancellationToken) -> std::io::Result<JoinHandle<()>> {
        let ingester = Arc::clone(self);
        thread::Builder::new()
            .name("gship-drain".into())
            .spawn(move || ingester.drain_loop(&token))
    }

    fn drain_loop(&self, token: &CancellationToken) {
        loop {
            if token.is_cancelled() {
                info!("drain worker shutting down (cancelled)");
                return;
            }
            match self.rx.recv_timeout(Duration::from_millis(100)) {
                Ok(lease) => {
                    // Processing would branch on the current zone here;
                    // today draining just returns the buffer.
                    let size = lease.len();
                    drop(lease);
                    self.monitor.report_ingester_usage(-(size as i64));
                    self.processed.fetch_add(1, Ordering::Relaxed);
                    self.metrics.inc_processed();
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    info!("drain worker shutting down (queue closed)");
                    return;
                }
            }
        }
    }

    /// Stream a vault back into the queue through `replayer`.
    ///
    /// Sends block until space frees up, bailing out promptly on
    /// cancellation; throttling between blocks is the replayer's job.
    pub fn replay_vault(
        &self,
        replayer: &Replayer,
        token: &CancellationToken,
    ) -> Result<(), ReplayError> {
        replayer.stream_to(token, &mut |data| {
            let mut lease = self.pool.acquire(data.len());
            lease.vec_mut().extend_from_slice(data);
            self.monitor.report_ingester_usage(data.len() as i64);

            let mut pending = lease;
            loop {
                match self.tx.send_timeout(pending, Duration::from_millis(50)) {
                    Ok(()) => return Ok(()),
                    Err(SendTimeoutError::Timeout(lease)) => {
                        if token.is_cancelled() {
                            self.discard(lease);
                            return Err(ReplayError::Cancelled);
                        }
                        pending = lease;
                    }
                    Err(SendTimeoutError::Disconnected(lease)) => {
                        self.discard(lease);
                        return Err(ReplayError::Cancelled);
                    }
                }
            }
        })
    }

    /// Records drained so far.
    pub fn processed_count(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    /// Records spilled by the fallback so far.
    pub fn spilled_count(&self) -> u64 {
        self.spilled.load(Ordering::Relaxed)
    }

    /// Pool backing this ingester's leases.
    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }
}

impl PressureSource for Ingester {
    fn queue_depth(&self) -> usize {
        self.tx.len()
    }

    fn queue_capacity(&self) -> usize {
        self.capacity
    }
}

impl std::fmt::Debug for Ingester {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ingester")
            .field("capacity", &self.capacity)
            .field("depth", &self.queue_depth())
            .field("processed", &self.processed_count())
            .field("spilled", &self.spilled_count())
            .finish()
    }
}
