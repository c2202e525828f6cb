// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Block codec: LZ4 framing with CRC-32 integrity.
//!
//! Compression and decompression scratch space comes from two dedicated
//! buffer pools so the vault write and replay paths stay allocation-free
//! after warm-up. Callers receive leases and must hand them back (drop
//! suffices).

use std::sync::Arc;

use byteorder::{BigEndian, ByteOrder};

use crate::buffer::{BufferPool, Lease};
use crate::vault::{IntegrityError, VaultError};

/// Frame magic, "VLZ4" in big endian.
pub const SEGMENT_MAGIC: u32 = 0x564C_5A34;

/// Maximum uncompressed bytes per block. 64 KiB keeps LZ4 in its sweet
/// spot and bounds replay memory.
pub const MAX_BLOCK_SIZE: usize = 64 * 1024;

/// Magic(4) + uncompressed len(4) + compressed len(4) + CRC-32(4).
pub const HEADER_SIZE: usize = 16;

/// Framing codec with pooled scratch buffers.
pub struct BlockCodec {
    compress_pool: Arc<BufferPool>,
    decompress_pool: Arc<BufferPool>,
}

impl Default for BlockCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockCodec {
    pub fn new() -> Self {
        let worst_case = lz4_flex::block::get_maximum_output_size(MAX_BLOCK_SIZE) + HEADER_SIZE;
        BlockCodec {
            compress_pool: BufferPool::with_limits(64, worst_case, worst_case),
            decompress_pool: BufferPool::with_limits(64, MAX_BLOCK_SIZE, MAX_BLOCK_SIZE),
        }
    }

    /// Compress `src` into a framed block.
    ///
    /// Returns the leased frame and its total length (header plus
    /// compressed payload). `src` must not exceed [`MAX_BLOCK_SIZE`].
    pub fn compress_block(&self, src: &[u8]) -> Result<(Lease, usize), VaultError> {
        if src.len() > MAX_BLOCK_SIZE {
            return Err(VaultError::BlockTooLarge {
                len: src.len(),
                max: MAX_BLOCK_SIZE,
            });
        }

        let bound = lz4_flex::block::get_maximum_output_size(src.len());
        let mut lease = self.compress_pool.acquire(HEADER_SIZE + bound);
        let frame = lease.vec_mut();
        frame.resize(HEADER_SIZE + bound, 0);

        BigEndian::write_u32(&mut frame[0..4], SEGMENT_MAGIC);
        BigEndian::write_u32(&mut frame[4..8], src.len() as u32);

        let compressed = lz4_flex::block::compress_into(src, &mut frame[HEADER_SIZE..])
            .map_err(|e| IntegrityError::Decompress(e.to_string()))?;
        BigEndian::write_u32(&mut frame[8..12], compressed as u32);

        let checksum = crc32fast::hash(&frame[HEADER_SIZE..HEADER_SIZE + compressed]);
        BigEndian::write_u32(&mut frame[12..16], checksum);

        frame.truncate(HEADER_SIZE + compressed);
        let total = HEADER_SIZE + compressed;
        Ok((lease, total))
    }

    /// Decode one framed block from the front of `framed`.
    ///
    /// Returns the leased uncompressed bytes and the total frame length
    /// consumed from the input.
    pub fn decompress_block(&self, framed: &[u8]) -> Result<(Lease, usize), IntegrityError> {
        if framed.len() < HEADER_SIZE {
            return Err(IntegrityError::Truncated {
                need: HEADER_SIZE,
                have: framed.len(),
            });
        }

        let magic = BigEndian::read_u32(&framed[0..4]);
        if magic != SEGMENT_MAGIC {
            return Err(IntegrityError::CorruptFrame {
                found: magic,
                expected: SEGMENT_MAGIC,
            });
        }

        let uncompressed_len = BigEndian::read_u32(&framed[4..8]) as usize;
        let compressed_len = BigEndian::read_u32(&framed[8..12]) as usize;
        let stored_crc = BigEndian::read_u32(&framed[12..16]);

        let total = HEADER_SIZE + compressed_len;
        if framed.len() < total {
            return Err(IntegrityError::Truncated {
                need: total,
                have: framed.len(),
            });
        }

        let payload = &framed[HEADER_SIZE..total];
        let computed = crc32fast::hash(payload);
        if computed != stored_crc {
            return Err(IntegrityError::ChecksumMismatch {
                stored: stored_crc,
                computed,
            });
        }

        if uncompressed_len > MAX_BLOCK_SIZE {
            return Err(IntegrityError::OversizedBlock {
                len: uncompressed_len,
                max: MAX_BLOCK_SIZE,
            });
        }

        let mut lease = self.decompress_pool.acquire(MAX_BLOCK_SIZE);
        let out = lease.vec_mut();
        out.resize(uncompressed_len, 0);
        let n = lz4_flex::block::decompress_into(payload, out)
            .map_err(|e| IntegrityError::Decompress(e.to_string()))?;
        if n != uncompressed_len {
            return Err(IntegrityError::Decompress(format!(
                "size mismatch: got {n}, expected {uncompressed_len}"
            )));
        }

        Ok((lease, total))
    }
}

impl std::fmt::Debug for BlockCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockCodec").finish_non_exhaustive()
    }
}
