// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Segmented, memory-mapped write-ahead log.
//!
//! One segment is active for writes at a time; rotated segments are
//! immutable. Incoming bytes accumulate into a 64 KiB uncompressed block
//! that is framed (compressed and checksummed) when full and copied into
//! the active segment's map. Rotation pulls the next file from a
//! background pre-allocation worker so the write path almost never waits
//! on `ftruncate`.
//!
//! Failure semantics: an error while installing a fresh segment is fatal
//! to the WAL - later writes release their buffers silently until close.
//! Flush and unmap hiccups during rotation are logged and tolerated.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crossbeam::channel::{self, Receiver, Sender, SendTimeoutError};
use memmap2::MmapMut;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::buffer::Lease;
use crate::pressure::Monitor;
use crate::vault::codec::{BlockCodec, MAX_BLOCK_SIZE};
use crate::vault::VaultError;

/// Default segment size: 64 MiB.
pub const DEFAULT_SEGMENT_SIZE: u64 = 64 * 1024 * 1024;

/// Mandatory prefix for segment files.
pub const SEGMENT_PREFIX: &str = "gs-vault-";

/// Mandatory suffix for segment files.
pub const SEGMENT_SUFFIX: &str = ".log";

/// Infix marking pre-allocated files not yet promoted to segments.
const PREALLOC_INFIX: &str = "-pre";

/// A segment must comfortably hold a worst-case frame, or flushing a
/// full block could never succeed.
const MIN_SEGMENT_SIZE: u64 = 2 * MAX_BLOCK_SIZE as u64;

struct ActiveSegment {
    file: File,
    map: MmapMut,
    write_at: u64,
    size: u64,
    path: PathBuf,
}

struct WalInner {
    active: Option<ActiveSegment>,
    /// Uncompressed accumulation block; small writes pack together here
    /// until a full 64 KiB frame is worth compressing.
    block: Vec<u8>,
    index: u64,
    failed: bool,
    closed: bool,
}

/// Directory of fixed-size memory-mapped segments.
pub struct Wal {
    dir: PathBuf,
    segment_size: u64,
    codec: BlockCodec,
    inner: Mutex<WalInner>,
    prealloc_rx: Receiver<PathBuf>,
    prealloc_token: CancellationToken,
    prealloc_thread: Mutex<Option<JoinHandle<()>>>,
    monitor: Option<Arc<Monitor>>,
}

impl Wal {
    /// Open (or create) a vault directory and activate its first segment.
    ///
    /// Existing segment names are scanned to recover the highest index so
    /// numbering stays monotonic across restarts.
    pub fn open(
        dir: impl AsRef<Path>,
        segment_size: u64,
        monitor: Option<Arc<Monitor>>,
    ) -> Result<Arc<Self>, VaultError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let mut segment_size = if segment_size == 0 {
            DEFAULT_SEGMENT_SIZE
        } else {
            segment_size
        };
        if segment_size < MIN_SEGMENT_SIZE {
            warn!(
                requested = segment_size,
                floor = MIN_SEGMENT_SIZE,
                "segment size below one frame bound; clamping"
            );
            segment_size = MIN_SEGMENT_SIZE;
        }

        let index = recover_index(&dir)?;

        let (tx, rx) = channel::bounded(1);
        let token = CancellationToken::new();
        let worker = {
            let dir = dir.clone();
            let token = token.clone();
            thread::Builder::new()
                .name("gship-vault-prealloc".into())
                .spawn(move || prealloc_worker(dir, segment_size, tx, token))?
        };

        let wal = Arc::new(Wal {
            dir: dir.clone(),
            segment_size,
            codec: BlockCodec::new(),
            inner: Mutex::new(WalInner {
                active: None,
                block: Vec::with_capacity(MAX_BLOCK_SIZE),
                index,
                failed: false,
                closed: false,
            }),
            prealloc_rx: rx,
            prealloc_token: token,
            prealloc_thread: Mutex::new(Some(worker)),
            monitor,
        });

        {
            let mut inner = wal.inner.lock();
            wal.rotate_locked(&mut inner)?;
        }

        info!(
            dir = %dir.display(),
            segment_size,
            start_index = index,
            "vault write-ahead log opened"
        );
        Ok(wal)
    }

    /// Append a lease's bytes, splitting across blocks and segments as
    /// needed. The lease is always released on return.
    ///
    /// Write errors never surface to the caller: they mark the WAL failed
    /// and subsequent writes release their buffers until [`Wal::close`].
    pub fn write(&self, lease: Lease) {
        let mut inner = self.inner.lock();
        if inner.closed || inner.failed || lease.is_empty() {
            return; // lease drop releases it
        }

        let mut remaining = lease.bytes();
        while !remaining.is_empty() {
            let space = MAX_BLOCK_SIZE - inner.block.len();
            let take = remaining.len().min(space);
            inner.block.extend_from_slice(&remaining[..take]);
            remaining = &remaining[take..];

            if inner.block.len() == MAX_BLOCK_SIZE {
                if let Err(err) = self.flush_block_locked(&mut inner) {
                    error!(error = %err, "vault write failed; WAL is now inert until close");
                    inner.failed = true;
                    return;
                }
            }
        }
    }

    /// Frame and persist the accumulation block, rotating first when the
    /// frame does not fit the active segment's remaining space.
    fn flush_block_locked(&self, inner: &mut WalInner) -> Result<(), VaultError> {
        if inner.block.is_empty() {
            return Ok(());
        }

        let (frame, total) = self.codec.compress_block(&inner.block)?;
        inner.block.clear();

        let needs_rotation = match inner.active.as_ref() {
            Some(seg) => seg.size - seg.write_at < total as u64,
            None => true,
        };
        if needs_rotation {
            self.rotate_locked(inner)?;
        }
        let Some(seg) = inner.active.as_mut() else {
            return Err(VaultError::Io(std::io::Error::other(
                "no active segment after rotation",
            )));
        };

        let at = seg.write_at as usize;
        seg.map[at..at + total].copy_from_slice(frame.bytes());
        seg.write_at += total as u64;
        Ok(())
    }

    /// Close the active segment and install the next one, preferring a
    /// pre-allocated file renamed into place.
    fn rotate_locked(&self, inner: &mut WalInner) -> Result<(), VaultError> {
        self.close_active_locked(inner);

        inner.index += 1;
        let final_path = self.dir.join(format!(
            "{SEGMENT_PREFIX}{}-{:06}{SEGMENT_SUFFIX}",
            unix_millis(),
            inner.index
        ));

        if let Ok(pre_path) = self.prealloc_rx.try_recv() {
            match fs::rename(&pre_path, &final_path) {
                Ok(()) => {
                    match self.map_segment(&final_path) {
                        Ok(seg) => {
                            inner.active = Some(seg);
                            debug!(path = %final_path.display(), "promoted pre-allocated segment");
                            return Ok(());
                        }
                        Err(err) => return Err(err),
                    }
                }
                Err(err) => {
                    warn!(
                        from = %pre_path.display(),
                        to = %final_path.display(),
                        error = %err,
                        "pre-allocation rename failed; falling back to synchronous allocation"
                    );
                    let _ = fs::remove_file(&pre_path);
                }
            }
        }

        // Synchronous fallback: create, preallocate and map in-line.
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&final_path)
            .map_err(|source| VaultError::Rotation {
                path: final_path.clone(),
                source,
            })?;
        file.set_len(self.segment_size)
            .map_err(|source| VaultError::Rotation {
                path: final_path.clone(),
                source,
            })?;
        drop(file);
        inner.active = Some(self.map_segment(&final_path)?);
        Ok(())
    }

    fn map_segment(&self, path: &Path) -> Result<ActiveSegment, VaultError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|source| VaultError::Rotation {
                path: path.to_path_buf(),
                source,
            })?;
        let map = unsafe { MmapMut::map_mut(&file) }.map_err(|source| VaultError::Rotation {
            path: path.to_path_buf(),
            source,
        })?;
        self.report_vault_usage(self.segment_size as i64);
        Ok(ActiveSegment {
            file,
            map,
            write_at: 0,
            size: self.segment_size,
            path: path.to_path_buf(),
        })
    }

    /// Flush, unmap, truncate to the last frame boundary and close.
    /// Map errors here are logged, not fatal: the data already reached
    /// the page cache and the truncate still runs.
    fn close_active_locked(&self, inner: &mut WalInner) {
        let Some(seg) = inner.active.take() else {
            return;
        };
        let ActiveSegment {
            file,
            map,
            write_at,
            path,
            ..
        } = seg;

        if let Err(err) = map.flush() {
            warn!(path = %path.display(), error = %err, "segment flush failed");
        }
        drop(map);
        self.report_vault_usage(-(self.segment_size as i64));

        if let Err(err) = file.set_len(write_at) {
            warn!(path = %path.display(), error = %err, "segment truncate failed");
        }
        if let Err(err) = file.sync_all() {
            warn!(path = %path.display(), error = %err, "segment sync failed");
        }
    }

    /// Flush the partial block, close the active segment, stop the
    /// pre-allocation worker and sweep its leftovers. Idempotent.
    pub fn close(&self) -> Result<(), VaultError> {
        {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Ok(());
            }
            inner.closed = true;

            if !inner.failed {
                if let Err(err) = self.flush_block_locked(&mut inner) {
                    warn!(error = %err, "failed to flush partial block on close");
                }
            }
            self.close_active_locked(&mut inner);
        }

        self.prealloc_token.cancel();
        if let Some(handle) = self.prealloc_thread.lock().take() {
            let _ = handle.join();
        }
        while let Ok(path) = self.prealloc_rx.try_recv() {
            let _ = fs::remove_file(path);
        }
        info!(dir = %self.dir.display(), "vault write-ahead log closed");
        Ok(())
    }

    /// Finished segment paths, lexicographically sorted. The name format
    /// makes that chronological order.
    pub fn list_segments(&self) -> std::io::Result<Vec<PathBuf>> {
        let mut segments = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.starts_with(SEGMENT_PREFIX)
                && name.ends_with(SEGMENT_SUFFIX)
                && !name.contains(PREALLOC_INFIX)
            {
                segments.push(entry.path());
            }
        }
        segments.sort();
        Ok(segments)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn segment_size(&self) -> u64 {
        self.segment_size
    }

    pub(crate) fn codec(&self) -> &BlockCodec {
        &self.codec
    }

    pub(crate) fn report_vault_usage(&self, delta: i64) {
        if let Some(monitor) = &self.monitor {
            monitor.report_vault_usage(delta);
        }
    }

    #[cfg(test)]
    fn current_index(&self) -> u64 {
        self.inner.lock().index
    }
}

impl Drop for Wal {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!(error = %err, "vault close during drop failed");
        }
    }
}

impl std::fmt::Debug for Wal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wal")
            .field("dir", &self.dir)
            .field("segment_size", &self.segment_size)
            .finish_non_exhaustive()
    }
}

/// Highest segment index present in `dir`, 0 when empty.
fn recover_index(dir: &Path) -> std::io::Result<u64> {
    let mut max = 0u64;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !name.starts_with(SEGMENT_PREFIX)
            || !name.ends_with(SEGMENT_SUFFIX)
            || name.contains(PREALLOC_INFIX)
        {
            continue;
        }
        let stem = &name[SEGMENT_PREFIX.len()..name.len() - SEGMENT_SUFFIX.len()];
        if let Some(idx) = stem.rsplit('-').next().and_then(|v| v.parse::<u64>().ok()) {
            max = max.max(idx);
        }
    }
    Ok(max)
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Produces the next segment file ahead of time so rotation is a rename
/// instead of a create-and-truncate.
fn prealloc_worker(dir: PathBuf, segment_size: u64, tx: Sender<PathBuf>, token: CancellationToken) {
    let mut seq = 0u64;
    while !token.is_cancelled() {
        seq += 1;
        let path = dir.join(format!(
            "{SEGMENT_PREFIX}{}-{:06}{PREALLOC_INFIX}{SEGMENT_SUFFIX}",
            unix_millis(),
            seq
        ));

        let created = File::create(&path).and_then(|f| f.set_len(segment_size));
        if let Err(err) = created {
            warn!(path = %path.display(), error = %err, "segment pre-allocation failed");
            let _ = fs::remove_file(&path);
            if pause(&token, Duration::from_millis(100)) {
                return;
            }
            continue;
        }

        // Rendezvous: park the file until rotation claims it.
        let mut pending = path;
        loop {
            match tx.send_timeout(pending, Duration::from_millis(200)) {
                Ok(()) => break,
                Err(SendTimeoutError::Timeout(p)) => {
                    if token.is_cancelled() {
                        let _ = fs::remove_file(&p);
                        return;
                    }
                    pending = p;
                }
                Err(SendTimeoutError::Disconnected(p)) => {
                    let _ = fs::remove_file(&p);
                    return;
                }
            }
        }
    }
}

/// Sleep in cancellation-aware slices. Returns true when cancelled.
fn pause(token: &CancellationToken, duration: Duration) -> bool {
    let mut remaining = duration;
    while !remaining.is_zero() {
        if token.is_cancelled() {
            return true;
        }
        let slice = remaining.min(Duration::from_millis(50));
        thread::sleep(slice);
        remaining -= slice;
    }
    token.is_cancelled()
}
