// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Durability tests: everything written and closed must replay, byte for
//! byte, and corruption must quarantine instead of propagating garbage.

use std::fs;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use gship::buffer::BufferPool;
use gship::metrics::EngineMetrics;
use gship::pressure::PressureState;
use gship::vault::{ReplayError, Replayer, Wal};

fn replay_all(dir: &std::path::Path) -> Result<Vec<u8>, ReplayError> {
    let metrics = Arc::new(EngineMetrics::new());
    let state = PressureState::new(Arc::clone(&metrics));
    let wal = Wal::open(dir, 1024 * 1024, None).expect("reopen wal");
    let replayer = Replayer::new(Arc::clone(&wal), state, metrics, 0);

    let token = CancellationToken::new();
    let mut collected = Vec::new();
    let result = replayer.stream_to(&token, &mut |block| {
        collected.extend_from_slice(block);
        Ok(())
    });
    wal.close().expect("close reopened wal");
    result.map(|()| collected)
}

fn write_payload(dir: &std::path::Path, segment_size: u64, payload: &[u8]) {
    let pool = BufferPool::new();
    let wal = Wal::open(dir, segment_size, None).expect("open wal");
    let mut lease = pool.acquire(payload.len());
    lease.vec_mut().extend_from_slice(payload);
    wal.write(lease);
    wal.close().expect("close wal");
}

#[test]
fn single_small_write_round_trips() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_payload(dir.path(), 1024 * 1024, b"hello wal");

    let replayed = replay_all(dir.path()).expect("replay");
    assert_eq!(replayed, b"hello wal");
}

#[test]
fn multiple_writes_concatenate_in_order() {
    let dir = tempfile::tempdir().expect("tempdir");
    let pool = BufferPool::new();
    let wal = Wal::open(dir.path(), 1024 * 1024, None).expect("open");

    let mut expected = Vec::new();
    for i in 0..50u32 {
        let chunk = format!("record-{i:04};");
        expected.extend_from_slice(chunk.as_bytes());
        let mut lease = pool.acquire(chunk.len());
        lease.vec_mut().extend_from_slice(chunk.as_bytes());
        wal.write(lease);
    }
    wal.close().expect("close");

    let replayed = replay_all(dir.path()).expect("replay");
    assert_eq!(replayed, expected);
}

#[test]
fn spanning_write_crosses_segments() {
    let dir = tempfile::tempdir().expect("tempdir");

    // Incompressible but deterministic, so the frames genuinely overflow
    // the small segments.
    let mut rng = fastrand::Rng::with_seed(0x6773_6869);
    let payload: Vec<u8> = (0..200 * 1024).map(|_| rng.u8(..)).collect();

    write_payload(dir.path(), 128 * 1024, &payload);

    let segment_count = fs::read_dir(dir.path())
        .expect("read_dir")
        .filter_map(|e| e.ok())
        .filter(|e| {
            let name = e.file_name().to_string_lossy().to_string();
            name.starts_with("gs-vault-") && name.ends_with(".log") && !name.contains("-pre")
        })
        .filter(|e| e.metadata().map(|m| m.len() > 0).unwrap_or(false))
        .count();
    assert!(segment_count >= 2, "expected >= 2 segments, got {segment_count}");

    let replayed = replay_all(dir.path()).expect("replay");
    assert_eq!(replayed, payload);
}

#[test]
fn corrupted_segment_is_quarantined() {
    let dir = tempfile::tempdir().expect("tempdir");

    let mut rng = fastrand::Rng::with_seed(7);
    let payload: Vec<u8> = (0..200 * 1024).map(|_| rng.u8(..)).collect();
    write_payload(dir.path(), 128 * 1024, &payload);

    // Flip one byte inside the first segment's first frame payload.
    let mut segments: Vec<_> = fs::read_dir(dir.path())
        .expect("read_dir")
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            let name = p.file_name().unwrap_or_default().to_string_lossy().to_string();
            name.starts_with("gs-vault-") && !name.contains("-pre")
        })
        .collect();
    segments.sort();
    let first = segments.first().expect("segment");
    let mut bytes = fs::read(first).expect("read segment");
    assert!(bytes.len() > 20);
    bytes[20] ^= 0xFF;
    fs::write(first, bytes).expect("rewrite segment");

    let metrics = Arc::new(EngineMetrics::new());
    let state = PressureState::new(Arc::clone(&metrics));
    let wal = Wal::open(dir.path(), 1024 * 1024, None).expect("reopen");
    let replayer = Replayer::new(Arc::clone(&wal), state, metrics, 0);

    let token = CancellationToken::new();
    let mut delivered = 0usize;
    let err = replayer
        .stream_to(&token, &mut |_| {
            delivered += 1;
            Ok(())
        })
        .unwrap_err();
    wal.close().expect("close");

    match err {
        ReplayError::Integrity { offset, ref path, .. } => {
            assert_eq!(offset, 0, "first frame should fail validation");
            assert_eq!(path, first);
        }
        other => panic!("expected integrity failure, got {other:?}"),
    }
    let message = err.to_string().to_lowercase();
    assert!(
        message.contains("checksum mismatch"),
        "unexpected failure kind: {message}"
    );
    // Quarantine: nothing from the corrupted segment or its successors.
    assert_eq!(delivered, 0);
}

#[test]
fn cancellation_stops_streaming_promptly() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_payload(dir.path(), 1024 * 1024, &vec![42u8; 100 * 1024]);

    let metrics = Arc::new(EngineMetrics::new());
    let state = PressureState::new(Arc::clone(&metrics));
    let wal = Wal::open(dir.path(), 1024 * 1024, None).expect("reopen");
    let replayer = Replayer::new(Arc::clone(&wal), state, metrics, 0);

    let token = CancellationToken::new();
    token.cancel();
    let err = replayer
        .stream_to(&token, &mut |_| Ok(()))
        .unwrap_err();
    wal.close().expect("close");
    assert!(matches!(err, ReplayError::Cancelled));
}
