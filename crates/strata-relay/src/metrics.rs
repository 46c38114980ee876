//! # Pipeline Metrics
//!
//! Process-wide counters shared by the read loop, the workers and the writer,
//! a periodic reporter that logs per-interval throughput, and Prometheus text
//! rendering with a tiny scrape endpoint.
//!
//! Counters are independent monotonic `AtomicU64`s updated with `Relaxed`
//! ordering: no counter is used to synchronize access to other data. Readers
//! that need exact totals (drop accounting) read after joining the threads
//! that wrote them, and the join supplies the happens-before edge.

use std::fmt::Write;
use std::io::{Read, Write as IoWrite};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use quanta::Instant;
use tracing::{debug, info, warn};

// ─── Drop Reason ────────────────────────────────────────────────────────────

/// Why a packet never reached the handoff queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DropReason {
    /// Every worker slot was busy at dispatch time.
    PoolFull,
    /// The handoff queue was at capacity.
    QueueFull,
    /// The transform returned an error.
    TransformFailed,
    /// The writer had already gone away.
    QueueClosed,
}

impl DropReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DropReason::PoolFull => "pool_full",
            DropReason::QueueFull => "queue_full",
            DropReason::TransformFailed => "transform_failed",
            DropReason::QueueClosed => "queue_closed",
        }
    }
}

// ─── Counters ───────────────────────────────────────────────────────────────

/// Minimum spacing between two drop warnings. Drops in between are counted
/// and reported as `suppressed` on the next warning.
pub const DROP_LOG_INTERVAL: Duration = Duration::from_millis(100);

const NEVER_LOGGED: u64 = u64::MAX;

/// Clock origin for drop-log rate limiting.
#[derive(Debug)]
struct LogClock {
    origin: Instant,
    last_ns: AtomicU64,
    suppressed: AtomicU64,
}

impl Default for LogClock {
    fn default() -> Self {
        LogClock {
            origin: Instant::now(),
            last_ns: AtomicU64::new(NEVER_LOGGED),
            suppressed: AtomicU64::new(0),
        }
    }
}

impl LogClock {
    /// Returns the number of drops suppressed since the last warning if this
    /// caller should warn now.
    fn admit(&self) -> Option<u64> {
        let now = self.origin.elapsed().as_nanos() as u64;
        let last = self.last_ns.load(Ordering::Relaxed);
        let due = last == NEVER_LOGGED
            || now.saturating_sub(last) >= DROP_LOG_INTERVAL.as_nanos() as u64;
        if due
            && self
                .last_ns
                .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
        {
            Some(self.suppressed.swap(0, Ordering::Relaxed))
        } else {
            self.suppressed.fetch_add(1, Ordering::Relaxed);
            None
        }
    }
}

/// Shared pipeline counters.
///
/// Counting always happens; `enabled` only controls drop warnings and the
/// periodic report.
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    enabled: bool,
    dispatched: AtomicU64,
    processed: AtomicU64,
    dropped_pool_full: AtomicU64,
    dropped_queue_full: AtomicU64,
    dropped_transform: AtomicU64,
    dropped_closed: AtomicU64,
    flushes: AtomicU64,
    payloads_written: AtomicU64,
    bytes_written: AtomicU64,
    // Reset every reporting interval.
    interval_processed: AtomicU64,
    interval_dropped: AtomicU64,
    drop_log: LogClock,
}

impl PipelineMetrics {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            ..Self::default()
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// One dispatch attempt, accepted or not.
    pub fn record_dispatch(&self) {
        self.dispatched.fetch_add(1, Ordering::Relaxed);
    }

    /// A payload made it into the handoff queue.
    pub fn record_processed(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        self.interval_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_drop(&self, reason: DropReason) {
        let counter = match reason {
            DropReason::PoolFull => &self.dropped_pool_full,
            DropReason::QueueFull => &self.dropped_queue_full,
            DropReason::TransformFailed => &self.dropped_transform,
            DropReason::QueueClosed => &self.dropped_closed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.interval_dropped.fetch_add(1, Ordering::Relaxed);
        if self.enabled {
            if let Some(suppressed) = self.drop_log.admit() {
                warn!(reason = reason.as_str(), suppressed, "packet dropped");
            }
        }
    }

    pub fn record_flush(&self, payloads: usize, bytes: usize) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
        self.payloads_written
            .fetch_add(payloads as u64, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Read and reset the per-interval counters: `(processed, dropped)`.
    pub fn take_interval(&self) -> (u64, u64) {
        (
            self.interval_processed.swap(0, Ordering::Relaxed),
            self.interval_dropped.swap(0, Ordering::Relaxed),
        )
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            dispatched: self.dispatched.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            dropped_pool_full: self.dropped_pool_full.load(Ordering::Relaxed),
            dropped_queue_full: self.dropped_queue_full.load(Ordering::Relaxed),
            dropped_transform: self.dropped_transform.load(Ordering::Relaxed),
            dropped_closed: self.dropped_closed.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            payloads_written: self.payloads_written.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the cumulative counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub dispatched: u64,
    pub processed: u64,
    pub dropped_pool_full: u64,
    pub dropped_queue_full: u64,
    pub dropped_transform: u64,
    pub dropped_closed: u64,
    pub flushes: u64,
    pub payloads_written: u64,
    pub bytes_written: u64,
}

impl MetricsSnapshot {
    pub fn dropped(&self) -> u64 {
        self.dropped_pool_full + self.dropped_queue_full + self.dropped_transform + self.dropped_closed
    }

    /// Every dispatch attempt ended up either processed or dropped.
    pub fn is_balanced(&self) -> bool {
        self.processed + self.dropped() == self.dispatched
    }
}

// ─── Periodic Reporter ──────────────────────────────────────────────────────

/// Background thread logging per-interval throughput.
///
/// Stops when dropped or when [`MetricsReporter::stop`] is called.
pub struct MetricsReporter {
    stop_tx: Option<Sender<()>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl MetricsReporter {
    pub fn start(metrics: Arc<PipelineMetrics>, interval: Duration) -> std::io::Result<Self> {
        let (stop_tx, stop_rx) = bounded::<()>(0);
        let handle = thread::Builder::new()
            .name("strata-relay-metrics".into())
            .spawn(move || {
                let mut last = Instant::now();
                loop {
                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {
                            let elapsed = last.elapsed().as_secs_f64().max(f64::EPSILON);
                            last = Instant::now();
                            let (processed, dropped) = metrics.take_interval();
                            let rate = (processed as f64 / elapsed).round() as u64;
                            info!(dropped, "Processed {} packets/sec", rate);
                        }
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
            })?;
        Ok(Self {
            stop_tx: Some(stop_tx),
            handle: Some(handle),
        })
    }

    /// Stop the reporter thread. Idempotent.
    pub fn stop(&mut self) {
        self.stop_tx = None;
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for MetricsReporter {
    fn drop(&mut self) {
        self.stop();
    }
}

// ─── Prometheus ─────────────────────────────────────────────────────────────

/// Render the counters in Prometheus text exposition format.
pub fn render_prometheus(s: &MetricsSnapshot) -> String {
    let mut out = String::with_capacity(1024);

    let counters = [
        (
            "strata_relay_dispatched_total",
            "Packets offered to the worker pool.",
            s.dispatched,
        ),
        (
            "strata_relay_processed_total",
            "Packets handed to the batching writer.",
            s.processed,
        ),
        (
            "strata_relay_flushes_total",
            "Batches flushed to the sink.",
            s.flushes,
        ),
        (
            "strata_relay_payloads_written_total",
            "Payloads written to the sink.",
            s.payloads_written,
        ),
        (
            "strata_relay_bytes_written_total",
            "Bytes written to the sink.",
            s.bytes_written,
        ),
    ];
    for (name, help, value) in counters {
        let _ = writeln!(out, "# HELP {name} {help}");
        let _ = writeln!(out, "# TYPE {name} counter");
        let _ = writeln!(out, "{name} {value}");
    }

    let _ = writeln!(
        out,
        "# HELP strata_relay_dropped_total Packets dropped before reaching the writer."
    );
    let _ = writeln!(out, "# TYPE strata_relay_dropped_total counter");
    for (reason, value) in [
        (DropReason::PoolFull, s.dropped_pool_full),
        (DropReason::QueueFull, s.dropped_queue_full),
        (DropReason::TransformFailed, s.dropped_transform),
        (DropReason::QueueClosed, s.dropped_closed),
    ] {
        let _ = writeln!(
            out,
            "strata_relay_dropped_total{{reason=\"{}\"}} {value}",
            reason.as_str()
        );
    }

    out
}

/// Minimal HTTP server answering `GET /metrics`.
pub struct MetricsServer {
    running: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
    addr: SocketAddr,
}

impl MetricsServer {
    pub fn start(bind_addr: SocketAddr, metrics: Arc<PipelineMetrics>) -> std::io::Result<Self> {
        let listener = TcpListener::bind(bind_addr)?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let running = Arc::new(AtomicBool::new(true));
        let running_clone = running.clone();

        let handle = thread::Builder::new()
            .name("strata-relay-scrape".into())
            .spawn(move || serve_loop(listener, metrics, running_clone))?;

        info!(%addr, "prometheus metrics server listening");
        Ok(MetricsServer {
            running,
            handle: Some(handle),
            addr,
        })
    }

    /// The address the server is actually listening on.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for MetricsServer {
    fn drop(&mut self) {
        self.stop();
    }
}

const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";
const SCRAPE_IO_TIMEOUT: Duration = Duration::from_secs(2);
const ACCEPT_IDLE: Duration = Duration::from_millis(50);

/// What a scrape request line asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scrape {
    Metrics,
    NotFound,
    MethodNotAllowed,
    BadRequest,
}

impl Scrape {
    fn classify(request_line: &str) -> Self {
        let mut parts = request_line.split_whitespace();
        let (Some(method), Some(target)) = (parts.next(), parts.next()) else {
            return Scrape::BadRequest;
        };
        let path = target.split('?').next().unwrap_or(target);
        match (method, path) {
            ("GET", "/metrics") => Scrape::Metrics,
            ("GET", _) => Scrape::NotFound,
            _ => Scrape::MethodNotAllowed,
        }
    }

    fn status(self) -> &'static str {
        match self {
            Scrape::Metrics => "200 OK",
            Scrape::NotFound => "404 Not Found",
            Scrape::MethodNotAllowed => "405 Method Not Allowed",
            Scrape::BadRequest => "400 Bad Request",
        }
    }
}

fn serve_loop(listener: TcpListener, metrics: Arc<PipelineMetrics>, running: Arc<AtomicBool>) {
    while running.load(Ordering::Relaxed) {
        let stream = match listener.accept() {
            Ok((stream, _)) => stream,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_IDLE);
                continue;
            }
            Err(e) => {
                debug!(error = %e, "scrape accept failed");
                thread::sleep(ACCEPT_IDLE * 2);
                continue;
            }
        };
        if let Err(e) = answer_scrape(stream, &metrics) {
            debug!(error = %e, "scrape connection dropped");
        }
    }
}

/// Read one request and answer it; the snapshot is taken only for a
/// `/metrics` hit.
fn answer_scrape(mut stream: TcpStream, metrics: &PipelineMetrics) -> std::io::Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(SCRAPE_IO_TIMEOUT))?;
    stream.set_write_timeout(Some(SCRAPE_IO_TIMEOUT))?;

    let mut head = [0u8; 1024];
    let n = stream.read(&mut head)?;
    let request = String::from_utf8_lossy(&head[..n]);
    let scrape = Scrape::classify(request.lines().next().unwrap_or_default());
    let body = match scrape {
        Scrape::Metrics => render_prometheus(&metrics.snapshot()),
        _ => String::new(),
    };

    write!(
        stream,
        "HTTP/1.1 {}\r\nContent-Type: {PROMETHEUS_CONTENT_TYPE}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        scrape.status(),
        body.len()
    )?;
    stream.write_all(body.as_bytes())
}
