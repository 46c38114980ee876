//! # Handoff Queue
//!
//! Fixed-capacity FIFO between the worker pool (many producers) and the
//! batching writer (one consumer). Offers never block: a full queue rejects
//! the payload and the caller counts it as a drop.
//!
//! The queue closes once every [`QueueProducer`] has been closed or
//! dropped. The consumer then drains whatever is still buffered and sees
//! [`Drain::Closed`].

use bytes::Bytes;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Why an offer was rejected. The payload is dropped in both cases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferError {
    /// Capacity reached.
    Full,
    /// The consumer is gone.
    Closed,
}

/// Result of a consumer-side pull.
#[derive(Debug, PartialEq, Eq)]
pub enum Drain {
    Payload(Bytes),
    /// Timed out with the queue still open.
    Empty,
    /// All producers closed and every buffered payload has been consumed.
    Closed,
}

/// Creates a handoff queue holding at most `capacity` payloads.
pub fn handoff_queue(capacity: usize) -> (QueueProducer, QueueConsumer) {
    let (tx, rx) = bounded(capacity);
    let producers = Arc::new(AtomicUsize::new(1));
    (
        QueueProducer {
            tx,
            producers: producers.clone(),
        },
        QueueConsumer {
            rx,
            capacity,
            producers,
        },
    )
}

/// Producer half. Clone one per worker.
pub struct QueueProducer {
    tx: Sender<Bytes>,
    producers: Arc<AtomicUsize>,
}

impl QueueProducer {
    /// Non-blocking insert.
    pub fn offer(&self, payload: Bytes) -> Result<(), OfferError> {
        match self.tx.try_send(payload) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(OfferError::Full),
            Err(TrySendError::Disconnected(_)) => Err(OfferError::Closed),
        }
    }

    /// Retire this producer. The queue closes when the last one is retired.
    pub fn close(self) {
        drop(self);
    }

    /// Producers still able to offer, this one included.
    pub fn live_producers(&self) -> usize {
        self.producers.load(Ordering::Acquire)
    }
}

impl Clone for QueueProducer {
    fn clone(&self) -> Self {
        self.producers.fetch_add(1, Ordering::AcqRel);
        Self {
            tx: self.tx.clone(),
            producers: self.producers.clone(),
        }
    }
}

impl Drop for QueueProducer {
    fn drop(&mut self) {
        self.producers.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Consumer half, owned by the writer.
pub struct QueueConsumer {
    rx: Receiver<Bytes>,
    capacity: usize,
    producers: Arc<AtomicUsize>,
}

impl QueueConsumer {
    /// Blocks for the next payload. `None` once closed and empty.
    pub fn drain(&self) -> Option<Bytes> {
        self.rx.recv().ok()
    }

    pub fn drain_timeout(&self, timeout: Duration) -> Drain {
        match self.rx.recv_timeout(timeout) {
            Ok(payload) => Drain::Payload(payload),
            Err(RecvTimeoutError::Timeout) => Drain::Empty,
            Err(RecvTimeoutError::Disconnected) => Drain::Closed,
        }
    }

    /// Underlying channel, for `select!` alongside a flush timer.
    pub fn receiver(&self) -> &Receiver<Bytes> {
        &self.rx
    }

    /// Payloads enqueued but not yet drained.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// True once every producer has been retired.
    pub fn is_closed(&self) -> bool {
        self.producers.load(Ordering::Acquire) == 0
    }
}
