// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Hysteretic zone controller.
//!
//! Occupancy of the ingest queue is compared against two watermarks with
//! integer arithmetic: the controller escalates to Red at 85% and only
//! recovers to Green below 20%. The gap suppresses oscillation when the
//! queue hovers around a single boundary, and the integer compare keeps
//! floating-point drift out of the decision entirely.
//!
//! An operator can pin the zone through the override slot - Red to force
//! a drain, Green to smoke-test - which short-circuits reassessment until
//! cleared.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tracing::info;

use crate::pressure::{PressureState, Zone};

/// Occupancy percentage at or above which the controller goes Red.
const HIGH_WATERMARK: usize = 85;
/// Occupancy percentage below which the controller returns to Green.
const LOW_WATERMARK: usize = 20;

/// Implemented by components that expose queue occupancy - in practice
/// the ingester. Injected at construction to break the cycle between
/// controller and ingester.
pub trait PressureSource: Send + Sync {
    /// Items currently queued.
    fn queue_depth(&self) -> usize;
    /// Total queue capacity.
    fn queue_capacity(&self) -> usize;
}

/// Zone controller bound to one pressure source.
pub struct Controller {
    source: Arc<dyn PressureSource>,
    state: Arc<PressureState>,
    current: AtomicU32,
    // 0 = no override; otherwise zone index + 1.
    override_slot: AtomicU32,
}

impl Controller {
    pub fn new(source: Arc<dyn PressureSource>, state: Arc<PressureState>) -> Arc<Self> {
        Arc::new(Controller {
            source,
            state,
            current: AtomicU32::new(Zone::Green as u32),
            override_slot: AtomicU32::new(0),
        })
    }

    /// Evaluate queue pressure and publish the zone on change.
    ///
    /// Returns the forced zone while an override is set.
    pub fn reassess(&self) -> Zone {
        let forced = self.override_slot.load(Ordering::Acquire);
        if forced != 0 {
            return Zone::from_index(forced - 1);
        }

        let depth = self.source.queue_depth();
        let capacity = self.source.queue_capacity();
        if capacity == 0 {
            return Zone::Green;
        }

        let current = Zone::from_index(self.current.load(Ordering::Acquire));
        let next = if depth * 100 >= capacity * HIGH_WATERMARK {
            Zone::Red
        } else if depth * 100 < capacity * LOW_WATERMARK {
            Zone::Green
        } else {
            current
        };

        if next != current {
            self.current.store(next as u32, Ordering::Release);
            self.state.set_zone(next);
        }
        next
    }

    /// Force the zone until [`Controller::clear_override`].
    pub fn override_zone(&self, zone: Zone) {
        self.override_slot
            .store(zone as u32 + 1, Ordering::Release);
        self.current.store(zone as u32, Ordering::Release);
        self.state.set_zone(zone);
        info!(zone = zone.as_str(), "manual zone override engaged");
    }

    /// Drop the override and immediately reassess from occupancy.
    pub fn clear_override(&self) {
        self.override_slot.store(0, Ordering::Release);
        info!("manual zone override cleared");
        self.reassess();
    }

    /// True while an override is pinned.
    pub fn override_active(&self) -> bool {
        self.override_slot.load(Ordering::Acquire) != 0
    }
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field(
                "current",
                &Zone::from_index(self.current.load(Ordering::Relaxed)),
            )
            .field("override_active", &self.override_active())
            .finish()
    }
}
