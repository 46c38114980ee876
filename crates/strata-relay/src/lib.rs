//! # strata-relay
//!
//! Low-latency media packet relay.
//!
//! Packets read from a source (typically UDP/RTP) are dispatched onto a
//! fixed-size worker pool, handed off through a bounded queue and written to
//! a sink (typically an ffmpeg subprocess) in small time-bounded batches.
//! Every stage sheds load instead of blocking: a saturated pool or a full
//! queue drops the packet and counts it.
//!
//! ## Crate structure
//!
//! - [`config`]: Pipeline, source and sink settings; TOML input
//! - [`error`]: Configuration and pipeline error types
//! - [`queue`]: Bounded drop-on-full handoff queue
//! - [`pool`]: Slot-limited worker pool and the `Transform` seam
//! - [`writer`]: Size/time batching writer
//! - [`sink`]: Output sinks (ffmpeg, stdout, null)
//! - [`source`]: Packet sources (UDP, channel)
//! - [`rtp`]: RTP header parsing
//! - [`metrics`]: Counters, periodic report, Prometheus endpoint
//! - [`pipeline`]: Lifecycle controller and direct forwarding

pub mod config;
pub mod error;
pub mod metrics;
pub mod pipeline;
pub mod pool;
pub mod queue;
pub mod rtp;
pub mod sink;
pub mod source;
pub mod writer;

pub use config::{PipelineConfig, RelayConfig};
pub use error::{ConfigError, PipelineError};
pub use pipeline::{forward_direct, Pipeline, PipelineReport, PipelineState, StopHandle};
