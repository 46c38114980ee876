//! # Bounded Worker Pool
//!
//! `N` worker threads fed by [`WorkerPool::dispatch`]. Dispatch takes one of
//! `N` slots with a single compare-and-swap and never waits: when every slot
//! is taken the packet is dropped and counted. A slot travels with its job
//! and is released when the worker finishes with it, whether the handoff
//! succeeded or not.
//!
//! Bounding is strict. A slot is held from dispatch until the worker's
//! handoff attempt returns, so queued plus running jobs never exceed `N`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use bytes::Bytes;
use crossbeam_channel::{bounded, Receiver, Sender};
use tracing::debug;

use crate::config::check_workers;
use crate::error::PipelineError;
use crate::metrics::{DropReason, PipelineMetrics};
use crate::queue::{OfferError, QueueProducer};

// ─── Transform ──────────────────────────────────────────────────────────────

/// Per-packet work run on a worker thread.
///
/// Implementations must not block; an error drops the packet.
pub trait Transform: Send + Sync + 'static {
    fn apply(&self, payload: &[u8]) -> anyhow::Result<Bytes>;
}

/// Copies the payload into a fresh buffer, detaching it from the source's
/// receive buffer.
#[derive(Debug, Default, Clone, Copy)]
pub struct CopyTransform;

impl Transform for CopyTransform {
    fn apply(&self, payload: &[u8]) -> anyhow::Result<Bytes> {
        Ok(Bytes::copy_from_slice(payload))
    }
}

impl<F> Transform for F
where
    F: Fn(&[u8]) -> anyhow::Result<Bytes> + Send + Sync + 'static,
{
    fn apply(&self, payload: &[u8]) -> anyhow::Result<Bytes> {
        self(payload)
    }
}

// ─── Slots ──────────────────────────────────────────────────────────────────

/// Fixed set of `capacity` interchangeable slots.
#[derive(Debug)]
pub struct SlotPool {
    in_use: AtomicUsize,
    capacity: usize,
}

impl SlotPool {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(SlotPool {
            in_use: AtomicUsize::new(0),
            capacity,
        })
    }

    /// Take a slot if one is free. Never blocks.
    pub fn try_acquire(self: &Arc<Self>) -> Option<SlotGuard> {
        let mut current = self.in_use.load(Ordering::Acquire);
        loop {
            if current >= self.capacity {
                return None;
            }
            match self.in_use.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    return Some(SlotGuard {
                        pool: Arc::clone(self),
                    })
                }
                Err(actual) => current = actual,
            }
        }
    }

    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Acquire)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// A held slot. Dropping it releases the slot, including during unwinding.
#[derive(Debug)]
pub struct SlotGuard {
    pool: Arc<SlotPool>,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.pool.in_use.fetch_sub(1, Ordering::AcqRel);
    }
}

// ─── Worker Pool ────────────────────────────────────────────────────────────

struct Job {
    payload: Bytes,
    slot: SlotGuard,
}

/// Outcome of a single dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Accepted,
    /// Dropped and counted; the pool never retries.
    Rejected,
}

pub struct WorkerPool {
    job_tx: Option<Sender<Job>>,
    slots: Arc<SlotPool>,
    metrics: Arc<PipelineMetrics>,
    handles: Vec<thread::JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `workers` threads handing transformed payloads to `producer`.
    ///
    /// The pool takes ownership of `producer`; the handoff queue closes once
    /// the pool is closed and every worker has exited.
    pub fn new(
        workers: usize,
        transform: Arc<dyn Transform>,
        producer: QueueProducer,
        metrics: Arc<PipelineMetrics>,
    ) -> Result<Self, PipelineError> {
        check_workers(workers)?;

        let (job_tx, job_rx) = bounded::<Job>(workers);
        let mut handles = Vec::with_capacity(workers);
        for i in 0..workers {
            let job_rx = job_rx.clone();
            let producer = producer.clone();
            let transform = transform.clone();
            let metrics = metrics.clone();
            let handle = thread::Builder::new()
                .name(format!("strata-relay-worker-{i}"))
                .spawn(move || worker_loop(job_rx, producer, transform, metrics))
                .map_err(|source| PipelineError::Spawn {
                    stage: "worker",
                    source,
                })?;
            handles.push(handle);
        }
        producer.close();

        Ok(Self {
            job_tx: Some(job_tx),
            slots: SlotPool::new(workers),
            metrics,
            handles,
        })
    }

    /// Hand one packet to a free worker, or drop it.
    ///
    /// Returns as soon as slot availability has been tested.
    pub fn dispatch(&self, payload: Bytes) -> Dispatch {
        self.metrics.record_dispatch();

        let Some(job_tx) = &self.job_tx else {
            self.metrics.record_drop(DropReason::QueueClosed);
            return Dispatch::Rejected;
        };
        let Some(slot) = self.slots.try_acquire() else {
            self.metrics.record_drop(DropReason::PoolFull);
            return Dispatch::Rejected;
        };

        // Jobs in the channel each hold a slot, so it never has more than
        // `workers` entries and this send cannot find it full.
        match job_tx.try_send(Job { payload, slot }) {
            Ok(()) => Dispatch::Accepted,
            Err(_) => {
                self.metrics.record_drop(DropReason::PoolFull);
                Dispatch::Rejected
            }
        }
    }

    /// Slots currently held by queued or running jobs.
    pub fn in_flight(&self) -> usize {
        self.slots.in_use()
    }

    pub fn capacity(&self) -> usize {
        self.slots.capacity()
    }

    /// Stop accepting packets and wait for dispatched work to finish.
    ///
    /// Idempotent. Later dispatches are rejected.
    pub fn close(&mut self) -> Result<(), PipelineError> {
        self.job_tx = None;
        let mut result = Ok(());
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                result = Err(PipelineError::Panicked("worker"));
            }
        }
        result
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

fn worker_loop(
    job_rx: Receiver<Job>,
    producer: QueueProducer,
    transform: Arc<dyn Transform>,
    metrics: Arc<PipelineMetrics>,
) {
    while let Ok(Job { payload, slot }) = job_rx.recv() {
        match transform.apply(&payload) {
            Ok(out) => match producer.offer(out) {
                Ok(()) => metrics.record_processed(),
                Err(OfferError::Full) => metrics.record_drop(DropReason::QueueFull),
                Err(OfferError::Closed) => metrics.record_drop(DropReason::QueueClosed),
            },
            Err(e) => {
                debug!(error = %e, len = payload.len(), "transform failed");
                metrics.record_drop(DropReason::TransformFailed);
            }
        }
        drop(slot);
    }
}
