//! # Strata Relay
//!
//! Receives RTP over UDP and pipes the payloads into ffmpeg for low-latency
//! HLS segmenting.
//!
//! ## Usage
//!
//! ```bash
//! # Opus audio → 25 ms ogg segments + stream.m3u8
//! strata-relay --bind 0.0.0.0:5004
//!
//! # Raw video preset, Prometheus metrics on :9090
//! strata-relay --preset vp8-hls --metrics-port 9090
//!
//! # Serial forwarding without the worker pool
//! strata-relay --direct --sink stdout > capture.opus
//!
//! # Everything from a file, CLI flags win
//! strata-relay --config relay.toml --workers 8
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use strata_relay::config::RelayConfigInput;
use strata_relay::pool::CopyTransform;
use strata_relay::sink::build_sink;
use strata_relay::source::UdpSource;
use strata_relay::{forward_direct, Pipeline, PipelineError, RelayConfig, StopHandle};

/// Low-latency RTP → ffmpeg relay.
#[derive(Parser, Debug)]
#[command(name = "strata-relay", about = "Strata low-latency RTP relay")]
struct Cli {
    /// TOML configuration file.
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// UDP listen address.
    #[arg(long, short = 'b')]
    bind: Option<String>,

    /// Maximum concurrent transforms.
    #[arg(long)]
    workers: Option<usize>,

    /// Handoff queue capacity.
    #[arg(long)]
    queue_capacity: Option<usize>,

    /// Payloads per batch.
    #[arg(long)]
    batch_size: Option<usize>,

    /// Maximum batch staleness in milliseconds.
    #[arg(long)]
    flush_interval_ms: Option<u64>,

    /// Disable the per-second throughput report.
    #[arg(long, default_value_t = false)]
    no_metrics: bool,

    /// Serve Prometheus metrics on this port.
    #[arg(long, short = 'm')]
    metrics_port: Option<u16>,

    /// Output sink: ffmpeg, stdout or null.
    #[arg(long)]
    sink: Option<String>,

    /// ffmpeg preset: opus-hls or vp8-hls.
    #[arg(long)]
    preset: Option<String>,

    /// Forward packets serially, bypassing pool, queue and batching.
    #[arg(long, default_value_t = false)]
    direct: bool,
}

impl Cli {
    fn into_config_input(self) -> anyhow::Result<(RelayConfigInput, bool)> {
        let mut input = match &self.config {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read config {}", path.display()))?;
                RelayConfigInput::from_toml_str(&text)?
            }
            None => RelayConfigInput::default(),
        };

        if let Some(bind) = self.bind {
            input.source.bind = Some(bind);
        }
        if let Some(v) = self.workers {
            input.pipeline.workers = Some(v);
        }
        if let Some(v) = self.queue_capacity {
            input.pipeline.queue_capacity = Some(v);
        }
        if let Some(v) = self.batch_size {
            input.pipeline.batch_size = Some(v);
        }
        if let Some(v) = self.flush_interval_ms {
            input.pipeline.flush_interval_ms = Some(v);
        }
        if self.no_metrics {
            input.metrics.enabled = Some(false);
        }
        if let Some(port) = self.metrics_port {
            input.metrics.port = Some(port);
        }
        if let Some(kind) = self.sink {
            input.sink.kind = Some(kind);
        }
        if let Some(preset) = self.preset {
            input.sink.preset = Some(preset);
            input.sink.args = None;
        }
        Ok((input, self.direct))
    }
}

fn main() -> anyhow::Result<()> {
    // ── Logging ─────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .compact()
        .init();

    // ── Configuration ───────────────────────────────────────────
    let (input, direct) = Cli::parse().into_config_input()?;
    let config = resolve_config(input).unwrap_or_else(|e| fail(e));

    tracing::info!(
        bind = %config.source.bind,
        workers = config.pipeline.workers,
        queue_capacity = config.pipeline.queue_capacity,
        batch_size = config.pipeline.batch_size,
        sink = ?config.sink,
        direct,
        "strata-relay starting"
    );

    // ── Graceful shutdown ───────────────────────────────────────
    let stop = StopHandle::new();
    {
        let stop = stop.clone();
        ctrlc::set_handler(move || {
            if stop.stop() {
                tracing::info!("shutting down...");
            }
        })
        .context("failed to install signal handler")?;
    }

    // ── Stages ──────────────────────────────────────────────────
    let source = match UdpSource::bind(&config.source) {
        Ok(source) => source,
        Err(e) => fail(PipelineError::Source(e)),
    };
    let sink = match build_sink(&config.sink) {
        Ok(sink) => sink,
        Err(e) => fail(PipelineError::Sink(e)),
    };

    if direct {
        return match forward_direct(source, sink, &stop) {
            Ok(report) => {
                tracing::info!(
                    packets = report.packets,
                    bytes = report.bytes,
                    "strata-relay stopped"
                );
                Ok(())
            }
            Err(e) => fail(e),
        };
    }

    let pipeline = match Pipeline::spawn_with_stop(
        &config.pipeline,
        source,
        sink,
        Arc::new(CopyTransform),
        stop,
    ) {
        Ok(pipeline) => pipeline,
        Err(e) => fail(e),
    };

    match pipeline.wait() {
        Ok(report) => {
            tracing::info!(
                processed = report.metrics.processed,
                dropped = report.metrics.dropped(),
                written = report.writer.payloads,
                exit = ?report.exit,
                "strata-relay stopped"
            );
            Ok(())
        }
        Err(e) => fail(e),
    }
}

/// Resolve layered input, tagging failures with the `config` stage.
fn resolve_config(input: RelayConfigInput) -> Result<RelayConfig, PipelineError> {
    Ok(input.resolve()?)
}

/// Report a fatal error once, naming the stage, and exit non-zero.
fn fail(e: PipelineError) -> ! {
    tracing::error!(stage = e.stage(), error = %e, "strata-relay failed");
    std::process::exit(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("strata-relay").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn flags_override_defaults() {
        let (input, direct) = cli(&["--workers", "8", "--sink", "null", "--direct"])
            .into_config_input()
            .unwrap();
        let config = resolve_config(input).unwrap();
        assert!(direct);
        assert_eq!(config.pipeline.workers, 8);
        assert_eq!(config.sink, strata_relay::config::SinkConfig::Null);
    }

    #[test]
    fn bad_flags_fail_in_config_stage() {
        for args in [
            &["--queue-capacity", "99999999"][..],
            &["--workers", "0"][..],
            &["--bind", "nowhere"][..],
            &["--preset", "h265"][..],
        ] {
            let (input, _) = cli(args).into_config_input().unwrap();
            let err = resolve_config(input).unwrap_err();
            assert_eq!(err.stage(), "config", "{args:?}");
        }
    }
}
