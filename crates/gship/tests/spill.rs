// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Overload behavior: the reflex must spill instead of blocking, spilled
//! bytes must survive in the vault, and replay must feed them back
//! through the same queue.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use gship::buffer::{BufferPool, Lease};
use gship::ingest::Ingester;
use gship::metrics::EngineMetrics;
use gship::pressure::{Monitor, MonitorConfig, PressureState};
use gship::vault::{Replayer, Wal};

struct Fixture {
    ingester: Arc<Ingester>,
    pool: Arc<BufferPool>,
    metrics: Arc<EngineMetrics>,
    state: Arc<PressureState>,
    monitor: Arc<Monitor>,
}

fn fixture(capacity: usize) -> Fixture {
    let metrics = Arc::new(EngineMetrics::new());
    let state = PressureState::new(Arc::clone(&metrics));
    let monitor = Monitor::new(
        MonitorConfig::default(),
        Arc::clone(&state),
        Arc::clone(&metrics),
    );
    let pool = BufferPool::new();
    let ingester = Ingester::new(
        capacity,
        Arc::clone(&pool),
        Arc::clone(&monitor),
        Arc::clone(&metrics),
    );
    Fixture {
        ingester,
        pool,
        metrics,
        state,
        monitor,
    }
}

fn filled(pool: &Arc<BufferPool>, bytes: &[u8]) -> Lease {
    let mut lease = pool.acquire(bytes.len());
    lease.vec_mut().extend_from_slice(bytes);
    lease
}

#[test]
fn saturation_spills_exactly_one_record() {
    // Queue capacity 1, drain worker deliberately not running.
    let fx = fixture(1);
    let token = CancellationToken::new();

    fx.ingester.ingest(filled(&fx.pool, b"first"), &token);
    fx.ingester.ingest(filled(&fx.pool, b"second"), &token);

    assert_eq!(fx.ingester.spilled_count(), 1);
    assert_eq!(fx.metrics.spills_total(), 1);
    // The spilled lease was released immediately; the queued one is live.
    assert_eq!(fx.pool.live_leases(), 1);
}

#[test]
fn spilled_bytes_survive_in_the_vault() {
    let dir = tempfile::tempdir().expect("tempdir");
    let fx = fixture(1);
    let wal = Wal::open(dir.path(), 1024 * 1024, Some(Arc::clone(&fx.monitor))).expect("open");
    fx.ingester.attach_vault(Arc::clone(&wal));

    let token = CancellationToken::new();
    fx.ingester.ingest(filled(&fx.pool, b"kept-in-queue"), &token);
    fx.ingester.ingest(filled(&fx.pool, b"spilled-to-vault"), &token);
    assert_eq!(fx.ingester.spilled_count(), 1);

    wal.close().expect("close");

    // Replay the vault and confirm the spilled record came back intact.
    let replayed = {
        let metrics = Arc::new(EngineMetrics::new());
        let state = PressureState::new(Arc::clone(&metrics));
        let reopened = Wal::open(dir.path(), 1024 * 1024, None).expect("reopen");
        let replayer = Replayer::new(Arc::clone(&reopened), state, metrics, 0);
        let mut collected = Vec::new();
        replayer
            .stream_to(&CancellationToken::new(), &mut |block| {
                collected.extend_from_slice(block);
                Ok(())
            })
            .expect("replay");
        reopened.close().expect("close reopened");
        collected
    };
    assert_eq!(replayed, b"spilled-to-vault");
}

#[test]
fn replay_feeds_the_ingest_queue() {
    let dir = tempfile::tempdir().expect("tempdir");

    // Seed a vault with three records.
    {
        let pool = BufferPool::new();
        let wal = Wal::open(dir.path(), 1024 * 1024, None).expect("open");
        for record in [b"alpha".as_slice(), b"beta", b"gamma"] {
            let mut lease = pool.acquire(record.len());
            lease.vec_mut().extend_from_slice(record);
            wal.write(lease);
        }
        wal.close().expect("close");
    }

    let fx = fixture(8);
    let token = CancellationToken::new();
    let drain = fx.ingester.spawn_drain(token.clone()).expect("drain");

    let wal = Wal::open(dir.path(), 1024 * 1024, None).expect("reopen");
    let replayer = Replayer::new(
        Arc::clone(&wal),
        Arc::clone(&fx.state),
        Arc::clone(&fx.metrics),
        0,
    );
    fx.ingester.replay_vault(&replayer, &token).expect("replay");
    wal.close().expect("close");

    // Everything written with Close packs into one block, so the drain
    // worker sees a single queued record.
    let deadline = Instant::now() + Duration::from_secs(2);
    while fx.ingester.processed_count() < 1 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert!(fx.ingester.processed_count() >= 1);
    assert_eq!(fx.pool.live_leases(), 0);

    token.cancel();
    drain.join().expect("join");
}
