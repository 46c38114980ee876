//! # Pipeline Lifecycle
//!
//! Wires source → worker pool → handoff queue → batching writer → sink and
//! owns their threads.
//!
//! ```text
//!  reader thread            N worker threads        writer thread
//!  source.next() ──dispatch──▶ transform ──offer──▶ queue ──drain──▶ batch ──▶ sink
//! ```
//!
//! Shutdown runs in one direction only. A stop request (or the source
//! ending) ends the read loop; the reader then closes the pool, which waits
//! for dispatched work and retires the queue producers; the writer sees the
//! closed queue, flushes what is left and closes the sink. A sink failure
//! ends the writer and requests a stop so the reader unwinds as well.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread;

use tracing::{info, warn};

use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::metrics::{MetricsReporter, MetricsServer, MetricsSnapshot, PipelineMetrics};
use crate::pool::{Transform, WorkerPool};
use crate::queue::handoff_queue;
use crate::sink::Sink;
use crate::source::{PacketSource, Pull};
use crate::writer::{BatchingWriter, WriterReport};

// ─── State ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PipelineState {
    Running = 0,
    /// Reading has stopped; in-flight work and the final flush are finishing.
    Draining = 1,
    /// The writer has flushed and released the sink.
    Terminated = 2,
}

impl PipelineState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => PipelineState::Running,
            1 => PipelineState::Draining,
            _ => PipelineState::Terminated,
        }
    }
}

#[derive(Debug)]
struct Lifecycle {
    stop_requested: AtomicBool,
    state: AtomicU8,
}

/// Cloneable handle for requesting a stop from any thread.
#[derive(Debug, Clone)]
pub struct StopHandle {
    inner: Arc<Lifecycle>,
}

impl StopHandle {
    pub fn new() -> Self {
        StopHandle {
            inner: Arc::new(Lifecycle {
                stop_requested: AtomicBool::new(false),
                state: AtomicU8::new(PipelineState::Running as u8),
            }),
        }
    }

    /// Request a stop. Returns true only for the call that made the request;
    /// repeated calls have no further effect.
    pub fn stop(&self) -> bool {
        let first = !self.inner.stop_requested.swap(true, Ordering::AcqRel);
        if first {
            self.advance(PipelineState::Draining);
        }
        first
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stop_requested.load(Ordering::Acquire)
    }

    pub fn state(&self) -> PipelineState {
        PipelineState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    /// Move forward to `next`; never moves backwards.
    fn advance(&self, next: PipelineState) {
        self.inner.state.fetch_max(next as u8, Ordering::AcqRel);
    }
}

impl Default for StopHandle {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Report ─────────────────────────────────────────────────────────────────

/// Why the read loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    Stopped,
    SourceEnded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineReport {
    pub exit: ExitReason,
    pub writer: WriterReport,
    pub metrics: MetricsSnapshot,
}

// ─── Pipeline ───────────────────────────────────────────────────────────────

type StageHandle<T> = Option<thread::JoinHandle<Result<T, PipelineError>>>;

pub struct Pipeline {
    stop: StopHandle,
    metrics: Arc<PipelineMetrics>,
    reader: StageHandle<ExitReason>,
    writer: StageHandle<WriterReport>,
    reporter: Option<MetricsReporter>,
    server: Option<MetricsServer>,
}

impl Pipeline {
    /// Validate `config` and start every stage.
    ///
    /// Nothing is spawned if the configuration is invalid.
    pub fn spawn<P, S>(
        config: &PipelineConfig,
        source: P,
        sink: S,
        transform: Arc<dyn Transform>,
    ) -> Result<Self, PipelineError>
    where
        P: PacketSource + 'static,
        S: Sink + 'static,
    {
        Self::spawn_with_stop(config, source, sink, transform, StopHandle::new())
    }

    /// Like [`Pipeline::spawn`], but driven by an existing handle, e.g. one
    /// already wired to a signal handler. A handle that is already stopped
    /// yields a pipeline that drains immediately.
    pub fn spawn_with_stop<P, S>(
        config: &PipelineConfig,
        source: P,
        sink: S,
        transform: Arc<dyn Transform>,
        stop: StopHandle,
    ) -> Result<Self, PipelineError>
    where
        P: PacketSource + 'static,
        S: Sink + 'static,
    {
        config.validate()?;

        let metrics = Arc::new(PipelineMetrics::new(config.metrics.enabled));
        let (producer, consumer) = handoff_queue(config.queue_capacity);
        let writer = BatchingWriter::new(
            sink,
            config.batch_size,
            config.flush_interval,
            metrics.clone(),
        )?;
        let pool = WorkerPool::new(config.workers, transform, producer, metrics.clone())?;

        let writer_stop = stop.clone();
        let writer_handle = thread::Builder::new()
            .name("strata-relay-writer".into())
            .spawn(move || {
                let result = writer.run(consumer);
                if result.is_err() {
                    writer_stop.stop();
                }
                result
            })
            .map_err(|source| PipelineError::Spawn {
                stage: "writer",
                source,
            })?;

        let reader_stop = stop.clone();
        let reader_handle = thread::Builder::new()
            .name("strata-relay-reader".into())
            .spawn(move || read_loop(source, pool, reader_stop))
            .map_err(|source| PipelineError::Spawn {
                stage: "reader",
                source,
            })?;

        let reporter = if config.metrics.enabled {
            match MetricsReporter::start(metrics.clone(), config.metrics.report_interval) {
                Ok(r) => Some(r),
                Err(e) => {
                    warn!(error = %e, "metrics reporter unavailable");
                    None
                }
            }
        } else {
            None
        };
        let server = match config.metrics.port {
            Some(port) if config.metrics.enabled => {
                match MetricsServer::start(SocketAddr::from(([0, 0, 0, 0], port)), metrics.clone()) {
                    Ok(s) => Some(s),
                    Err(e) => {
                        warn!(port, error = %e, "prometheus endpoint unavailable");
                        None
                    }
                }
            }
            _ => None,
        };

        info!(
            workers = config.workers,
            queue_capacity = config.queue_capacity,
            batch_size = config.batch_size,
            flush_interval_ms = config.flush_interval.as_secs_f64() * 1000.0,
            "pipeline running"
        );

        Ok(Pipeline {
            stop,
            metrics,
            reader: Some(reader_handle),
            writer: Some(writer_handle),
            reporter,
            server,
        })
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Request a graceful stop. Idempotent.
    pub fn stop(&self) {
        self.stop.stop();
    }

    pub fn state(&self) -> PipelineState {
        self.stop.state()
    }

    pub fn metrics(&self) -> Arc<PipelineMetrics> {
        self.metrics.clone()
    }

    /// Where the Prometheus endpoint is listening, if one was started.
    pub fn metrics_addr(&self) -> Option<SocketAddr> {
        self.server.as_ref().map(MetricsServer::addr)
    }

    /// Block until every stage has terminated.
    ///
    /// A sink failure is reported in preference to a source failure.
    pub fn wait(mut self) -> Result<PipelineReport, PipelineError> {
        self.join()
    }

    fn join(&mut self) -> Result<PipelineReport, PipelineError> {
        let reader = join_stage(self.reader.take(), "reader");
        let writer = join_stage(self.writer.take(), "writer");
        self.stop.advance(PipelineState::Terminated);
        if let Some(mut reporter) = self.reporter.take() {
            reporter.stop();
        }
        if let Some(mut server) = self.server.take() {
            server.stop();
        }

        let writer = writer?;
        let exit = reader?;
        let metrics = self.metrics.snapshot();
        info!(
            processed = metrics.processed,
            dropped = metrics.dropped(),
            written = writer.payloads,
            "pipeline terminated"
        );
        Ok(PipelineReport {
            exit,
            writer,
            metrics,
        })
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        if self.reader.is_some() || self.writer.is_some() {
            self.stop.stop();
            let _ = self.join();
        }
    }
}

fn join_stage<T>(handle: StageHandle<T>, stage: &'static str) -> Result<T, PipelineError> {
    match handle {
        Some(h) => h.join().map_err(|_| PipelineError::Panicked(stage))?,
        None => Err(PipelineError::Panicked(stage)),
    }
}

fn read_loop<P: PacketSource>(
    mut source: P,
    mut pool: WorkerPool,
    stop: StopHandle,
) -> Result<ExitReason, PipelineError> {
    let outcome = loop {
        if stop.is_stopped() {
            break Ok(ExitReason::Stopped);
        }
        match source.next() {
            Ok(Pull::Packet(payload)) => {
                pool.dispatch(payload);
            }
            Ok(Pull::Idle) => {}
            Ok(Pull::End) => {
                info!("source reached end of stream");
                break Ok(ExitReason::SourceEnded);
            }
            Err(e) => break Err(PipelineError::Source(e)),
        }
    };

    stop.advance(PipelineState::Draining);
    // Lets dispatched work finish, then retires the queue producers.
    let closed = pool.close();
    let exit = outcome?;
    closed?;
    Ok(exit)
}

// ─── Direct Forwarding ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DirectReport {
    pub packets: u64,
    pub bytes: u64,
}

/// Copy packets straight from `source` to `sink` on the calling thread,
/// without pool, queue or batching. Stops on end of stream, a stop request
/// or the first error, and closes the sink exactly once.
pub fn forward_direct<P, S>(
    mut source: P,
    mut sink: S,
    stop: &StopHandle,
) -> Result<DirectReport, PipelineError>
where
    P: PacketSource,
    S: Sink,
{
    let mut report = DirectReport::default();
    let result = loop {
        if stop.is_stopped() {
            break Ok(());
        }
        match source.next() {
            Ok(Pull::Packet(payload)) => {
                if let Err(e) = sink.write(&payload) {
                    break Err(PipelineError::Sink(e));
                }
                report.packets += 1;
                report.bytes += payload.len() as u64;
            }
            Ok(Pull::Idle) => {}
            Ok(Pull::End) => break Ok(()),
            Err(e) => break Err(PipelineError::Source(e)),
        }
    };
    stop.advance(PipelineState::Draining);

    let closed = sink.close().map_err(PipelineError::Sink);
    stop.advance(PipelineState::Terminated);
    result?;
    closed?;
    Ok(report)
}
