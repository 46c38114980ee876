//! Hot-path benchmarks for strata-relay.
//!
//! - Slot acquire/release
//! - Handoff queue offer/drain
//! - Pool dispatch (accepted and rejected)
//! - RTP payload slicing
//!
//! Run with: cargo bench --package strata-relay

use std::sync::Arc;

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

use strata_relay::metrics::PipelineMetrics;
use strata_relay::pool::{CopyTransform, SlotPool, WorkerPool};
use strata_relay::queue::handoff_queue;
use strata_relay::rtp;

// ─── Slots ───────────────────────────────────────────────────────────────

fn bench_slots(c: &mut Criterion) {
    let mut group = c.benchmark_group("slots");
    group.throughput(Throughput::Elements(1));

    group.bench_function("acquire_release", |b| {
        let slots = SlotPool::new(4);
        b.iter(|| {
            let guard = slots.try_acquire();
            black_box(&guard);
        });
    });

    group.bench_function("acquire_saturated", |b| {
        let slots = SlotPool::new(1);
        let _held = slots.try_acquire();
        b.iter(|| black_box(slots.try_acquire().is_none()));
    });

    group.finish();
}

// ─── Queue ───────────────────────────────────────────────────────────────

fn bench_queue(c: &mut Criterion) {
    let payload = Bytes::from(vec![0xABu8; 1200]);
    let mut group = c.benchmark_group("queue");
    group.throughput(Throughput::Elements(1));

    group.bench_function("offer_drain", |b| {
        let (tx, rx) = handoff_queue(100);
        b.iter(|| {
            let _ = tx.offer(black_box(payload.clone()));
            black_box(rx.receiver().try_recv().ok());
        });
    });

    group.bench_function("offer_full", |b| {
        let (tx, _rx) = handoff_queue(1);
        let _ = tx.offer(payload.clone());
        b.iter(|| black_box(tx.offer(payload.clone()).is_err()));
    });

    group.finish();
}

// ─── Dispatch ────────────────────────────────────────────────────────────

fn bench_dispatch(c: &mut Criterion) {
    let payload = Bytes::from(vec![0xABu8; 1200]);
    let mut group = c.benchmark_group("dispatch");
    group.throughput(Throughput::Elements(1));

    group.bench_function("copy_transform", |b| {
        let metrics = Arc::new(PipelineMetrics::new(false));
        let (tx, rx) = handoff_queue(1024);
        let pool = WorkerPool::new(4, Arc::new(CopyTransform), tx, metrics).unwrap();
        b.iter(|| {
            black_box(pool.dispatch(payload.clone()));
            while rx.receiver().try_recv().is_ok() {}
        });
    });

    group.finish();
}

// ─── RTP ─────────────────────────────────────────────────────────────────

fn bench_rtp(c: &mut Criterion) {
    let mut pkt = vec![0x80, 111, 0, 1, 0, 0, 0, 0, 0, 0, 0, 1];
    pkt.extend_from_slice(&[0x55; 160]);
    let pkt = Bytes::from(pkt);

    c.bench_function("rtp_payload", |b| {
        b.iter(|| black_box(rtp::payload(black_box(&pkt)).ok()));
    });
}

criterion_group!(benches, bench_slots, bench_queue, bench_dispatch, bench_rtp);
criterion_main!(benches);
