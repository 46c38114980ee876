//! # Batching Writer
//!
//! Drains the handoff queue into small batches and writes them to the sink.
//! A batch is flushed as soon as it reaches `batch_size`, or on the next
//! flush tick if it is non-empty, so a lone payload waits at most one flush
//! interval. Closing the queue triggers a final flush; a failed sink write
//! ends the writer without retrying.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use crossbeam_channel::{select, tick};
use tracing::debug;

use crate::config::check_batch_size;
use crate::error::{ConfigError, PipelineError};
use crate::metrics::PipelineMetrics;
use crate::queue::QueueConsumer;
use crate::sink::Sink;

/// Payloads accumulated for one flush, in drain order.
#[derive(Debug)]
pub struct Batch {
    items: Vec<Bytes>,
    limit: usize,
}

impl Batch {
    pub fn new(limit: usize) -> Self {
        Batch {
            items: Vec::with_capacity(limit),
            limit,
        }
    }

    /// Append a payload. Returns true once the size threshold is reached.
    pub fn push(&mut self, payload: Bytes) -> bool {
        self.items.push(payload);
        self.is_full()
    }

    pub fn is_full(&self) -> bool {
        self.items.len() >= self.limit
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    fn drain(&mut self) -> std::vec::Drain<'_, Bytes> {
        self.items.drain(..)
    }
}

/// What the writer did before it terminated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriterReport {
    pub payloads: u64,
    pub bytes: u64,
    pub flushes: u64,
    /// Flushes triggered by reaching the batch size.
    pub size_flushes: u64,
    /// Flushes triggered by the flush timer.
    pub timed_flushes: u64,
    /// The final flush after the queue closed, 0 or 1.
    pub close_flushes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlushCause {
    Size,
    Timer,
    Close,
}

pub struct BatchingWriter<S: Sink> {
    sink: S,
    batch: Batch,
    flush_interval: Duration,
    metrics: Arc<PipelineMetrics>,
    report: WriterReport,
}

impl<S: Sink> BatchingWriter<S> {
    pub fn new(
        sink: S,
        batch_size: usize,
        flush_interval: Duration,
        metrics: Arc<PipelineMetrics>,
    ) -> Result<Self, ConfigError> {
        check_batch_size(batch_size)?;
        if flush_interval.is_zero() {
            return Err(ConfigError::ZeroFlushInterval);
        }
        Ok(BatchingWriter {
            sink,
            batch: Batch::new(batch_size),
            flush_interval,
            metrics,
            report: WriterReport::default(),
        })
    }

    /// Drain `queue` until it closes or the sink fails, then close the sink.
    ///
    /// The sink is closed exactly once on every path. A write error takes
    /// precedence over a close error.
    pub fn run(mut self, queue: QueueConsumer) -> Result<WriterReport, PipelineError> {
        let ticker = tick(self.flush_interval);

        let result = loop {
            select! {
                recv(queue.receiver()) -> msg => match msg {
                    Ok(payload) => {
                        if self.batch.push(payload) {
                            if let Err(e) = self.flush(FlushCause::Size) {
                                break Err(e);
                            }
                        }
                    }
                    Err(_) => break self.flush(FlushCause::Close),
                },
                recv(ticker) -> _ => {
                    if let Err(e) = self.flush(FlushCause::Timer) {
                        break Err(e);
                    }
                }
            }
        };
        // Stop accepting before the (possibly slow) sink close.
        drop(queue);

        let closed = self.sink.close();
        match (result, closed) {
            (Err(e), _) | (Ok(()), Err(e)) => Err(PipelineError::Sink(e)),
            (Ok(()), Ok(())) => Ok(self.report),
        }
    }

    fn flush(&mut self, cause: FlushCause) -> anyhow::Result<()> {
        if self.batch.is_empty() {
            return Ok(());
        }
        let count = self.batch.len();
        let mut bytes = 0usize;
        // On error the drain is dropped, discarding the rest of the batch.
        for payload in self.batch.drain() {
            self.sink.write(&payload)?;
            bytes += payload.len();
        }

        self.metrics.record_flush(count, bytes);
        self.report.payloads += count as u64;
        self.report.bytes += bytes as u64;
        self.report.flushes += 1;
        match cause {
            FlushCause::Size => self.report.size_flushes += 1,
            FlushCause::Timer => self.report.timed_flushes += 1,
            FlushCause::Close => {
                self.report.close_flushes += 1;
                debug!(count, bytes, "final flush");
            }
        }
        Ok(())
    }
}
