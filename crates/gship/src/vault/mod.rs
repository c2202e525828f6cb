// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The vault: a durable spill target for the ingestion reflex.
//!
//! # On-Disk Layout
//!
//! A vault directory holds fixed-size, memory-mapped segment files named
//! `gs-vault-<unix_millis>-<index>.log`; pre-allocation temporaries carry
//! a `-pre` infix. A segment is a run of framed blocks, optionally
//! followed by zero padding up to the pre-allocated size. On clean close
//! the active segment is truncated to its last frame boundary.
//!
//! # Frame Layout (big-endian)
//!
//! ```text
//! +--------+------------------+----------------+-------------------+
//! | 0..4   | 4..8             | 8..12          | 12..16            |
//! | magic  | uncompressed len | compressed len | CRC-32 of payload |
//! +--------+------------------+----------------+-------------------+
//! | 16..16+compressed_len : LZ4 block-compressed payload           |
//! +----------------------------------------------------------------+
//! ```
//!
//! Blocks hold at most 64 KiB of uncompressed data; larger writes split
//! across blocks and, when a segment fills, across segments.

mod codec;
mod replay;
mod wal;

pub use codec::{BlockCodec, HEADER_SIZE, MAX_BLOCK_SIZE, SEGMENT_MAGIC};
pub use replay::{ReplayError, Replayer, DEFAULT_MIN_DEEP_SLEEP, DEFAULT_YELLOW_THROTTLE};
pub use wal::{Wal, DEFAULT_SEGMENT_SIZE, SEGMENT_PREFIX, SEGMENT_SUFFIX};

use std::path::PathBuf;

use thiserror::Error;

/// Block-level integrity failures surfaced by the codec.
///
/// Any of these observed during replay quarantines the current segment.
#[derive(Debug, Error)]
pub enum IntegrityError {
    /// Frame header does not start with the segment magic.
    #[error("corrupt frame: magic {found:#010x}, expected {expected:#010x}")]
    CorruptFrame { found: u32, expected: u32 },

    /// Fewer bytes available than the header (or its payload) claims.
    #[error("truncated frame: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },

    /// Stored CRC-32 does not match the compressed payload.
    #[error("checksum mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    ChecksumMismatch { stored: u32, computed: u32 },

    /// Uncompressed length field exceeds the block size.
    #[error("oversized block: {len} bytes exceeds {max}")]
    OversizedBlock { len: usize, max: usize },

    /// LZ4 failure or decompressed-size mismatch.
    #[error("decompress failed: {0}")]
    Decompress(String),
}

/// Vault-level failures.
#[derive(Debug, Error)]
pub enum VaultError {
    #[error("vault io error: {0}")]
    Io(#[from] std::io::Error),

    /// Rotation could not install a fresh segment. Fatal to the WAL:
    /// subsequent writes release their buffers until close.
    #[error("segment rotation failed at {path:?}: {source}")]
    Rotation {
        path: PathBuf,
        source: std::io::Error,
    },

    /// A single write may not exceed the block size at the codec layer.
    #[error("payload of {len} bytes exceeds block size {max}")]
    BlockTooLarge { len: usize, max: usize },

    #[error(transparent)]
    Integrity(#[from] IntegrityError),
}
