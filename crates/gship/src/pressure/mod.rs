// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Global pressure state and the homeostatic control loop around it.
//!
//! The zone is a process-wide tri-state - Green, Yellow, Red - held in a
//! single atomic. Readers (the reflex, the replayer throttle, the health
//! endpoint) pay one atomic load. Writers take a small lock whose only
//! job is coordinating the subscriber list and the zone gauge; the lock
//! is never on a hot path.
//!
//! Zone changes are multicast to subscribers over bounded channels with
//! non-blocking sends: a stuck subscriber loses notifications, it never
//! back-pressures the core. Each subscriber still converges on the latest
//! zone because every change is offered to every channel.

mod controller;
mod monitor;

pub use controller::{Controller, PressureSource};
pub use monitor::{Monitor, MonitorConfig, CPU_SAMPLE_INTERVAL};

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam::channel::{self, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use tracing::debug;

use crate::metrics::EngineMetrics;

/// The global system-pressure zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u32)]
pub enum Zone {
    /// Optimal: full processing.
    Green = 0,
    /// Under load: shed optional work.
    Yellow = 1,
    /// Critical: background tasks deep-sleep, health reports not-serving.
    Red = 2,
}

impl Zone {
    pub(crate) fn from_index(v: u32) -> Zone {
        match v {
            1 => Zone::Yellow,
            2 => Zone::Red,
            _ => Zone::Green,
        }
    }

    /// Sleep factor applied by background tasks that yield under
    /// pressure. Green keeps the configured pace, Yellow doubles it, Red
    /// is an effective suspension.
    pub fn throttle_multiplier(self) -> u32 {
        match self {
            Zone::Green => 1,
            Zone::Yellow => 2,
            Zone::Red => 50,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Zone::Green => "GREEN",
            Zone::Yellow => "YELLOW",
            Zone::Red => "RED",
        }
    }
}

impl std::fmt::Display for Zone {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

struct SubscriberEntry {
    id: u64,
    tx: Sender<Zone>,
}

/// Process-wide pressure state: atomic zone plus subscriber multicast.
///
/// Constructed once at startup and passed by handle to every component
/// that needs it; tests build their own instances.
pub struct PressureState {
    zone: AtomicU32,
    subscribers: Mutex<Vec<SubscriberEntry>>,
    next_id: AtomicU64,
    metrics: Arc<EngineMetrics>,
}

impl PressureState {
    pub fn new(metrics: Arc<EngineMetrics>) -> Arc<Self> {
        metrics.set_zone(Zone::Green);
        Arc::new(PressureState {
            zone: AtomicU32::new(Zone::Green as u32),
            subscribers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            metrics,
        })
    }

    /// Current zone. One atomic load.
    pub fn zone(&self) -> Zone {
        Zone::from_index(self.zone.load(Ordering::Acquire))
    }

    /// Shorthand for the current zone's throttle multiplier.
    pub fn throttle_multiplier(&self) -> u32 {
        self.zone().throttle_multiplier()
    }

    /// Update the zone. On change, updates the zone gauge and notifies
    /// subscribers without blocking.
    pub fn set_zone(&self, zone: Zone) {
        let mut subs = self.subscribers.lock();
        let prev = self.zone.swap(zone as u32, Ordering::AcqRel);
        if prev == zone as u32 {
            return;
        }
        self.metrics.set_zone(zone);
        subs.retain(|entry| match entry.tx.try_send(zone) {
            Ok(()) => true,
            // Full channel: the subscriber is slow, drop this notification.
            Err(TrySendError::Full(_)) => true,
            Err(TrySendError::Disconnected(_)) => false,
        });
    }

    /// Raise pressure one step, clamped at Red.
    pub fn raise(&self) {
        let current = self.zone();
        if current < Zone::Red {
            self.set_zone(Zone::from_index(current as u32 + 1));
        }
    }

    /// Ease pressure one step, clamped at Green.
    pub fn ease(&self) {
        let current = self.zone();
        if current > Zone::Green {
            self.set_zone(Zone::from_index(current as u32 - 1));
        }
    }

    /// Register for zone-change notifications.
    ///
    /// The channel holds a single pending zone; intermediate transitions
    /// a slow reader misses are superseded by later ones. The returned
    /// [`Subscription`] unregisters on drop (or via
    /// [`Subscription::cancel`], idempotently).
    pub fn subscribe(self: &Arc<Self>) -> (Receiver<Zone>, Subscription) {
        let (tx, rx) = channel::bounded(1);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.lock().push(SubscriberEntry { id, tx });
        debug!(subscriber = id, "pressure subscriber registered");
        (
            rx,
            Subscription {
                id,
                state: Some(Arc::clone(self)),
            },
        )
    }

    fn unsubscribe(&self, id: u64) {
        self.subscribers.lock().retain(|entry| entry.id != id);
    }

    #[cfg(test)]
    fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

impl std::fmt::Debug for PressureState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PressureState")
            .field("zone", &self.zone())
            .finish_non_exhaustive()
    }
}

/// Handle that removes its subscriber when cancelled or dropped.
pub struct Subscription {
    id: u64,
    state: Option<Arc<PressureState>>,
}

impl Subscription {
    /// Unregister. Safe to call more than once.
    pub fn cancel(&mut self) {
        if let Some(state) = self.state.take() {
            state.unsubscribe(self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}
