// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # GSHIP - Homeostatic Telemetry Ingestion Engine
//!
//! GSHIP is a single-process sidecar that accepts log records over an
//! OTLP-style export RPC and, under overload, spills them to a durable
//! on-disk vault instead of dropping them or exhausting memory.
//!
//! The engine is organised around a global pressure state - one of
//! Green, Yellow or Red - derived from resource signals. The zone drives
//! admission, background throttling and spill decisions, and is exposed
//! through a management plane served by the `gship-server` binary.
//!
//! ## Architecture
//!
//! ```text
//! +--------------------------------------------------------------------+
//! |  Export RPC (TLS 1.3)        Management RPC (mTLS / local socket)  |
//! +--------------------------------------------------------------------+
//! |  Ingester  -- bounded queue, non-blocking reflex, drain worker     |
//! |     | spill on queue-full                 ^ replay under throttle  |
//! |     v                                     |                        |
//! |  Vault -- mmap segments of framed LZ4 blocks --- Replayer          |
//! +--------------------------------------------------------------------+
//! |  Monitor (RAM / CPU proxy / budgets)  ->  Controller (hysteresis)  |
//! |                     -> PressureState (Green/Yellow/Red)            |
//! +--------------------------------------------------------------------+
//! |  BufferPool - recyclable leases shared by every byte-moving path   |
//! +--------------------------------------------------------------------+
//! ```
//!
//! ## Key Types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`buffer::BufferPool`] | Recyclable byte buffers handed out as leases |
//! | [`pressure::PressureState`] | Process-wide zone with subscriber multicast |
//! | [`pressure::Monitor`] | Stochastic resource sensing and budget accounting |
//! | [`pressure::Controller`] | Hysteretic zone transitions and manual override |
//! | [`vault::Wal`] | Memory-mapped segmented write-ahead log |
//! | [`vault::Replayer`] | Pressure-throttled segment streamer |
//! | [`ingest::Ingester`] | The non-blocking ingestion reflex |

pub mod buffer;
pub mod config;
pub mod ingest;
pub mod metrics;
pub mod pressure;
pub mod vault;

pub use buffer::{BufferPool, Lease};
pub use config::Config;
pub use ingest::Ingester;
pub use metrics::EngineMetrics;
pub use pressure::{Controller, Monitor, PressureSource, PressureState, Zone};
pub use vault::{Replayer, Wal};
