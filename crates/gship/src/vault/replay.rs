// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Pressure-throttled vault replay.
//!
//! Replay streams finished segments back through a caller-provided sink
//! in write order. It is deliberately a second-class citizen: after every
//! block it consults the throttle multiplier and sleeps, so live
//! ingestion always wins the queue. Sleep time and work time accumulate
//! into starvation/processing counters; their ratio - the starvation
//! score - is logged per segment and exported as a gauge.
//!
//! Integrity failures quarantine: the current segment is abandoned at
//! the failing offset and later segments are not touched, preserving the
//! evidence for operators.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use memmap2::Mmap;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::metrics::EngineMetrics;
use crate::pressure::{PressureState, Zone};
use crate::vault::codec::HEADER_SIZE;
use crate::vault::{IntegrityError, Wal};

/// Minimum wait per block while the zone is Red.
pub const DEFAULT_MIN_DEEP_SLEEP: Duration = Duration::from_secs(5);

/// Fallback wait per block in Yellow when no base rate is configured.
pub const DEFAULT_YELLOW_THROTTLE: Duration = Duration::from_millis(100);

/// Replay failures.
#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("replay io error: {0}")]
    Io(#[from] std::io::Error),

    /// A block failed validation. The segment is quarantined at the
    /// reported offset; later segments are not streamed.
    #[error("integrity failure at offset {offset} in {path:?}: {source}")]
    Integrity {
        path: PathBuf,
        offset: u64,
        #[source]
        source: IntegrityError,
    },

    /// Cancellation observed at a block boundary.
    #[error("replay cancelled")]
    Cancelled,
}

/// Streams vault segments back into ingestion under zone throttling.
pub struct Replayer {
    wal: Arc<Wal>,
    state: Arc<PressureState>,
    metrics: Arc<EngineMetrics>,
    /// Base inter-block interval derived from the items/sec limit.
    throttle: Duration,
    min_deep_sleep: Duration,
    starvation_ns: AtomicU64,
    processing_ns: AtomicU64,
}

impl Replayer {
    /// `items_per_second` of zero means no base rate: full speed in
    /// Green, default throttles under pressure.
    pub fn new(
        wal: Arc<Wal>,
        state: Arc<PressureState>,
        metrics: Arc<EngineMetrics>,
        items_per_second: u32,
    ) -> Self {
        let throttle = if items_per_second > 0 {
            Duration::from_secs(1) / items_per_second
        } else {
            Duration::ZERO
        };
        Replayer {
            wal,
            state,
            metrics,
            throttle,
            min_deep_sleep: DEFAULT_MIN_DEEP_SLEEP,
            starvation_ns: AtomicU64::new(0),
            processing_ns: AtomicU64::new(0),
        }
    }

    /// Override the Red-zone floor. Tests use short floors.
    pub fn with_min_deep_sleep(mut self, floor: Duration) -> Self {
        self.min_deep_sleep = floor;
        self
    }

    /// Stream every finished segment, oldest first, delivering each
    /// decompressed block to `sink`.
    pub fn stream_to<F>(&self, token: &CancellationToken, sink: &mut F) -> Result<(), ReplayError>
    where
        F: FnMut(&[u8]) -> Result<(), ReplayError>,
    {
        let segments = self.wal.list_segments()?;
        debug!(count = segments.len(), "replay discovered segments");
        for path in segments {
            self.stream_segment(token, &path, sink)?;
        }
        Ok(())
    }

    /// Cumulative time spent asleep under throttling.
    pub fn starvation_time(&self) -> Duration {
        Duration::from_nanos(self.starvation_ns.load(Ordering::Relaxed))
    }

    /// Cumulative time spent decoding and delivering blocks.
    pub fn processing_time(&self) -> Duration {
        Duration::from_nanos(self.processing_ns.load(Ordering::Relaxed))
    }

    fn stream_segment<F>(
        &self,
        token: &CancellationToken,
        path: &Path,
        sink: &mut F,
    ) -> Result<(), ReplayError>
    where
        F: FnMut(&[u8]) -> Result<(), ReplayError>,
    {
        let file = File::open(path)?;
        if file.metadata()?.len() == 0 {
            return Ok(());
        }
        let map = unsafe { Mmap::map(&file)? };
        self.wal.report_vault_usage(map.len() as i64);
        let result = self.scan_mapped(token, path, &map, sink);
        self.wal.report_vault_usage(-(map.len() as i64));
        result
    }

    fn scan_mapped<F>(
        &self,
        token: &CancellationToken,
        path: &Path,
        map: &[u8],
        sink: &mut F,
    ) -> Result<(), ReplayError>
    where
        F: FnMut(&[u8]) -> Result<(), ReplayError>,
    {
        let segment_start = Instant::now();
        let mut offset = 0usize;

        while offset + HEADER_SIZE <= map.len() {
            if token.is_cancelled() {
                return Err(ReplayError::Cancelled);
            }

            // Pre-allocated tail: hop over zero runs instead of trying to
            // parse them as frames.
            if map[offset] == 0 {
                match map[offset..].iter().position(|&b| b != 0) {
                    None => break,
                    Some(skip) => {
                        offset += skip;
                        if offset + HEADER_SIZE > map.len() {
                            break;
                        }
                    }
                }
            }

            let work_start = Instant::now();
            let (block, consumed) =
                self.wal
                    .codec()
                    .decompress_block(&map[offset..])
                    .map_err(|source| {
                        error!(
                            path = %path.display(),
                            offset,
                            error = %source,
                            "integrity failure; quarantining segment"
                        );
                        ReplayError::Integrity {
                            path: path.to_path_buf(),
                            offset: offset as u64,
                            source,
                        }
                    })?;
            sink(block.bytes())?;
            drop(block);
            self.processing_ns
                .fetch_add(work_start.elapsed().as_nanos() as u64, Ordering::Relaxed);

            offset += consumed;
            self.throttle_block(token)?;
        }

        let processing = self.processing_time();
        let starvation = self.starvation_time();
        let score = if processing.as_nanos() > 0 {
            starvation.as_secs_f64() / processing.as_secs_f64()
        } else {
            0.0
        };
        self.metrics.set_replay_starvation_score(score);
        info!(
            path = %path.display(),
            processing_ms = processing.as_millis() as u64,
            starvation_ms = starvation.as_millis() as u64,
            segment_ms = segment_start.elapsed().as_millis() as u64,
            starvation_score = score,
            "segment streaming complete"
        );
        Ok(())
    }

    /// Yield between blocks according to the current zone.
    fn throttle_block(&self, token: &CancellationToken) -> Result<(), ReplayError> {
        let zone = self.state.zone();
        let wait = compute_wait(zone, self.throttle, self.min_deep_sleep);

        if zone != Zone::Green {
            warn!(
                zone = zone.as_str(),
                multiplier = zone.throttle_multiplier(),
                wait_ms = wait.as_millis() as u64,
                starvation_ms = self.starvation_time().as_millis() as u64,
                "replayer yielding under pressure"
            );
        }

        if !wait.is_zero() {
            let began = Instant::now();
            let cancelled = sleep_cancellable(token, wait);
            self.starvation_ns
                .fetch_add(began.elapsed().as_nanos() as u64, Ordering::Relaxed);
            if cancelled {
                return Err(ReplayError::Cancelled);
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for Replayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Replayer")
            .field("throttle", &self.throttle)
            .field("min_deep_sleep", &self.min_deep_sleep)
            .finish_non_exhaustive()
    }
}

/// Per-block wait for a zone given the configured base interval.
fn compute_wait(zone: Zone, base: Duration, min_deep_sleep: Duration) -> Duration {
    let multiplier = zone.throttle_multiplier();
    let mut wait = base * multiplier;
    if multiplier > 1 {
        if base.is_zero() && zone == Zone::Yellow {
            wait = DEFAULT_YELLOW_THROTTLE;
        }
        if zone == Zone::Red && wait < min_deep_sleep {
            wait = min_deep_sleep;
        }
    }
    wait
}

/// Sleep in cancellation-aware slices. Returns true when cancelled.
fn sleep_cancellable(token: &CancellationToken, duration: Duration) -> bool {
    let mut remaining = duration;
    while !remaining.is_zero() {
        if token.is_cancelled() {
            return true;
        }
        let slice = remaining.min(Duration::from_millis(50));
        std::thread::sleep(slice);
        remaining -= slice;
    }
    token.is_cancelled()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn green_keeps_the_configured_pace() {
        let base = Duration::from_millis(10);
        assert_eq!(
            compute_wait(Zone::Green, base, DEFAULT_MIN_DEEP_SLEEP),
            base
        );
        assert_eq!(
            compute_wait(Zone::Green, Duration::ZERO, DEFAULT_MIN_DEEP_SLEEP),
            Duration::ZERO
        );
    }

    #[test]
    fn yellow_doubles_or_falls_back() {
        let base = Duration::from_millis(10);
        assert_eq!(
            compute_wait(Zone::Yellow, base, DEFAULT_MIN_DEEP_SLEEP),
            Duration::from_millis(20)
        );
        // No base rate: the Yellow fallback applies.
        assert_eq!(
            compute_wait(Zone::Yellow, Duration::ZERO, DEFAULT_MIN_DEEP_SLEEP),
            DEFAULT_YELLOW_THROTTLE
        );
    }

    #[test]
    fn red_enforces_the_deep_sleep_floor() {
        let base = Duration::from_millis(10);
        // 10ms * 50 = 500ms, still under the 5s floor.
        assert_eq!(
            compute_wait(Zone::Red, base, DEFAULT_MIN_DEEP_SLEEP),
            DEFAULT_MIN_DEEP_SLEEP
        );
        // A long base rate already exceeds the floor.
        let slow = Duration::from_millis(200);
        assert_eq!(
            compute_wait(Zone::Red, slow, Duration::from_secs(5)),
            Duration::from_secs(10)
        );
    }

    #[test]
    fn sleep_cancellable_observes_cancellation() {
        let token = CancellationToken::new();
        token.cancel();
        let began = Instant::now();
        assert!(sleep_cancellable(&token, Duration::from_secs(10)));
        assert!(began.elapsed() < Duration::from_secs(1));
    }
}
