//! # Relay Configuration
//!
//! Concrete pipeline/source/sink settings plus the TOML input structs they
//! are resolved from. Input structs keep every field optional so a partial
//! file only overrides what it names.

use std::net::SocketAddr;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::sink::FfmpegPreset;

pub const CONFIG_VERSION: u32 = 1;

/// Upper bounds on pipeline sizing. Each one allocates up front (threads,
/// channel slots, batch buffer), so larger values are rejected.
pub const MAX_WORKERS: usize = 1024;
pub const MAX_QUEUE_CAPACITY: usize = 1 << 20;
pub const MAX_BATCH_SIZE: usize = 4096;
/// Largest UDP payload; bounds the source's receive buffer.
pub const MAX_DATAGRAM_SIZE: usize = 65_535;

// ─── Resolved Config ────────────────────────────────────────────────────────

/// Sizing and timing of the packet pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    /// Maximum number of concurrently running transforms.
    pub workers: usize,
    /// Fixed capacity of the handoff queue between workers and writer.
    pub queue_capacity: usize,
    /// Payloads per batch before an immediate flush.
    pub batch_size: usize,
    /// Upper bound on how long a non-empty batch waits before flushing.
    pub flush_interval: Duration,
    pub metrics: MetricsConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 100,
            batch_size: 5,
            flush_interval: Duration::from_millis(5),
            metrics: MetricsConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Reject sizes and intervals the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_workers(self.workers)?;
        check_queue_capacity(self.queue_capacity)?;
        check_batch_size(self.batch_size)?;
        if self.flush_interval.is_zero() {
            return Err(ConfigError::ZeroFlushInterval);
        }
        if self.metrics.enabled && self.metrics.report_interval.is_zero() {
            return Err(ConfigError::ZeroReportInterval);
        }
        Ok(())
    }
}

pub(crate) fn check_workers(workers: usize) -> Result<(), ConfigError> {
    match workers {
        0 => Err(ConfigError::ZeroWorkers),
        n if n > MAX_WORKERS => Err(ConfigError::TooManyWorkers(n)),
        _ => Ok(()),
    }
}

pub(crate) fn check_queue_capacity(capacity: usize) -> Result<(), ConfigError> {
    match capacity {
        0 => Err(ConfigError::ZeroQueueCapacity),
        n if n > MAX_QUEUE_CAPACITY => Err(ConfigError::QueueCapacityTooLarge(n)),
        _ => Ok(()),
    }
}

pub(crate) fn check_batch_size(size: usize) -> Result<(), ConfigError> {
    match size {
        0 => Err(ConfigError::ZeroBatchSize),
        n if n > MAX_BATCH_SIZE => Err(ConfigError::BatchSizeTooLarge(n)),
        _ => Ok(()),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub report_interval: Duration,
    /// Serve Prometheus text on `0.0.0.0:<port>/metrics` when set.
    pub port: Option<u16>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            report_interval: Duration::from_secs(1),
            port: None,
        }
    }
}

/// UDP packet source settings.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceConfig {
    pub bind: SocketAddr,
    /// Forward only the RTP payload instead of the whole datagram.
    pub strip_rtp: bool,
    /// How long a read may block before the loop re-checks for stop.
    pub read_timeout: Duration,
    pub max_packet_size: usize,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 5004)),
            strip_rtp: true,
            read_timeout: Duration::from_millis(100),
            max_packet_size: 1500,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SinkConfig {
    Ffmpeg { program: String, args: Vec<String> },
    Stdout,
    Null,
}

impl Default for SinkConfig {
    fn default() -> Self {
        SinkConfig::Ffmpeg {
            program: "ffmpeg".to_string(),
            args: FfmpegPreset::OpusHls.args(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RelayConfig {
    pub version: u32,
    pub pipeline: PipelineConfig,
    pub source: SourceConfig,
    pub sink: SinkConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            pipeline: PipelineConfig::default(),
            source: SourceConfig::default(),
            sink: SinkConfig::default(),
        }
    }
}

// ─── TOML Input ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RelayConfigInput {
    pub version: u32,
    pub pipeline: PipelineConfigInput,
    pub metrics: MetricsConfigInput,
    pub source: SourceConfigInput,
    pub sink: SinkConfigInput,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PipelineConfigInput {
    pub workers: Option<usize>,
    pub queue_capacity: Option<usize>,
    pub batch_size: Option<usize>,
    pub flush_interval_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MetricsConfigInput {
    pub enabled: Option<bool>,
    pub report_interval_ms: Option<u64>,
    pub port: Option<u16>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SourceConfigInput {
    pub bind: Option<String>,
    pub strip_rtp: Option<bool>,
    pub read_timeout_ms: Option<u64>,
    pub max_packet_size: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SinkConfigInput {
    pub kind: Option<String>,
    pub preset: Option<String>,
    pub program: Option<String>,
    pub args: Option<Vec<String>>,
}

impl RelayConfigInput {
    /// Parse without resolving, so callers can layer overrides on top.
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        toml::from_str(input).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn resolve(self) -> Result<RelayConfig, ConfigError> {
        let version = if self.version == 0 {
            CONFIG_VERSION
        } else {
            self.version
        };
        if version != CONFIG_VERSION {
            return Err(ConfigError::UnsupportedVersion(version));
        }

        let defaults = PipelineConfig::default();
        let metrics_defaults = MetricsConfig::default();
        let pipeline = PipelineConfig {
            workers: self.pipeline.workers.unwrap_or(defaults.workers),
            queue_capacity: self
                .pipeline
                .queue_capacity
                .unwrap_or(defaults.queue_capacity),
            batch_size: self.pipeline.batch_size.unwrap_or(defaults.batch_size),
            flush_interval: self
                .pipeline
                .flush_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.flush_interval),
            metrics: MetricsConfig {
                enabled: self.metrics.enabled.unwrap_or(metrics_defaults.enabled),
                report_interval: self
                    .metrics
                    .report_interval_ms
                    .map(Duration::from_millis)
                    .unwrap_or(metrics_defaults.report_interval),
                port: self.metrics.port,
            },
        };
        pipeline.validate()?;

        Ok(RelayConfig {
            version,
            pipeline,
            source: self.source.resolve()?,
            sink: self.sink.resolve()?,
        })
    }
}

impl SourceConfigInput {
    fn resolve(self) -> Result<SourceConfig, ConfigError> {
        let defaults = SourceConfig::default();
        let bind = match self.bind {
            Some(addr) => addr
                .trim()
                .parse::<SocketAddr>()
                .map_err(|e| ConfigError::InvalidSource(format!("bind '{}': {}", addr, e)))?,
            None => defaults.bind,
        };
        let max_packet_size = self.max_packet_size.unwrap_or(defaults.max_packet_size);
        if max_packet_size == 0 || max_packet_size > MAX_DATAGRAM_SIZE {
            return Err(ConfigError::InvalidSource(format!(
                "max_packet_size must be between 1 and {MAX_DATAGRAM_SIZE}"
            )));
        }
        Ok(SourceConfig {
            bind,
            strip_rtp: self.strip_rtp.unwrap_or(defaults.strip_rtp),
            // A zero read timeout means "block forever" to the OS; keep a floor.
            read_timeout: Duration::from_millis(
                self.read_timeout_ms
                    .unwrap_or(defaults.read_timeout.as_millis() as u64)
                    .max(1),
            ),
            max_packet_size,
        })
    }
}

impl SinkConfigInput {
    fn resolve(self) -> Result<SinkConfig, ConfigError> {
        let kind = self.kind.as_deref().map(str::trim).unwrap_or("ffmpeg");
        match kind {
            "ffmpeg" => {
                let args = match (self.args, self.preset.as_deref()) {
                    (Some(args), _) => args,
                    (None, Some(name)) => FfmpegPreset::from_name(name)
                        .ok_or_else(|| {
                            ConfigError::InvalidSink(format!("unknown ffmpeg preset '{name}'"))
                        })?
                        .args(),
                    (None, None) => FfmpegPreset::OpusHls.args(),
                };
                let program = self
                    .program
                    .map(|p| p.trim().to_string())
                    .filter(|p| !p.is_empty())
                    .unwrap_or_else(|| "ffmpeg".to_string());
                Ok(SinkConfig::Ffmpeg { program, args })
            }
            "stdout" => Ok(SinkConfig::Stdout),
            "null" => Ok(SinkConfig::Null),
            other => Err(ConfigError::InvalidSink(format!("unknown sink kind '{other}'"))),
        }
    }
}

impl RelayConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        if input.trim().is_empty() {
            return Ok(RelayConfig::default());
        }
        RelayConfigInput::from_toml_str(input)?.resolve()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = PipelineConfig::default();
        assert_eq!(cfg.workers, 4);
        assert_eq!(cfg.queue_capacity, 100);
        assert_eq!(cfg.batch_size, 5);
        assert_eq!(cfg.flush_interval, Duration::from_millis(5));
        assert!(cfg.metrics.enabled);
        assert_eq!(cfg.metrics.report_interval, Duration::from_secs(1));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn validate_rejects_zero_sizes() {
        let cases = [
            (
                PipelineConfig {
                    workers: 0,
                    ..PipelineConfig::default()
                },
                ConfigError::ZeroWorkers,
            ),
            (
                PipelineConfig {
                    queue_capacity: 0,
                    ..PipelineConfig::default()
                },
                ConfigError::ZeroQueueCapacity,
            ),
            (
                PipelineConfig {
                    batch_size: 0,
                    ..PipelineConfig::default()
                },
                ConfigError::ZeroBatchSize,
            ),
            (
                PipelineConfig {
                    flush_interval: Duration::ZERO,
                    ..PipelineConfig::default()
                },
                ConfigError::ZeroFlushInterval,
            ),
        ];
        for (cfg, expected) in cases {
            assert_eq!(cfg.validate().unwrap_err(), expected);
        }
    }

    #[test]
    fn zero_report_interval_only_matters_when_enabled() {
        let mut cfg = PipelineConfig::default();
        cfg.metrics.report_interval = Duration::ZERO;
        assert_eq!(cfg.validate().unwrap_err(), ConfigError::ZeroReportInterval);
        cfg.metrics.enabled = false;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn parse_toml_config_full() {
        let toml = r#"
            version = 1

            [pipeline]
            workers = 8
            queue_capacity = 256
            batch_size = 10
            flush_interval_ms = 2

            [metrics]
            enabled = false
            report_interval_ms = 500
            port = 9100

            [source]
            bind = "127.0.0.1:6000"
            strip_rtp = false
            read_timeout_ms = 20

            [sink]
            kind = "ffmpeg"
            preset = "vp8-hls"
        "#;

        let cfg = RelayConfig::from_toml_str(toml).unwrap();
        assert_eq!(cfg.pipeline.workers, 8);
        assert_eq!(cfg.pipeline.queue_capacity, 256);
        assert_eq!(cfg.pipeline.batch_size, 10);
        assert_eq!(cfg.pipeline.flush_interval, Duration::from_millis(2));
        assert!(!cfg.pipeline.metrics.enabled);
        assert_eq!(cfg.pipeline.metrics.port, Some(9100));
        assert_eq!(cfg.source.bind, "127.0.0.1:6000".parse::<SocketAddr>().unwrap());
        assert!(!cfg.source.strip_rtp);
        assert_eq!(cfg.source.read_timeout, Duration::from_millis(20));
        assert_eq!(
            cfg.sink,
            SinkConfig::Ffmpeg {
                program: "ffmpeg".into(),
                args: FfmpegPreset::Vp8Hls.args(),
            }
        );
    }

    #[test]
    fn empty_toml_is_default() {
        assert_eq!(RelayConfig::from_toml_str("  ").unwrap(), RelayConfig::default());
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let cfg = RelayConfig::from_toml_str("[pipeline]\nworkers = 2\n").unwrap();
        assert_eq!(cfg.pipeline.workers, 2);
        assert_eq!(cfg.pipeline.queue_capacity, 100);
        assert_eq!(cfg.sink, SinkConfig::default());
    }

    #[test]
    fn toml_zero_workers_rejected() {
        let err = RelayConfig::from_toml_str("[pipeline]\nworkers = 0\n").unwrap_err();
        assert_eq!(err, ConfigError::ZeroWorkers);
    }

    #[test]
    fn toml_oversized_capacities_rejected() {
        let err = RelayConfig::from_toml_str("[pipeline]\nqueue_capacity = 9223372036854775807\n")
            .unwrap_err();
        assert!(matches!(err, ConfigError::QueueCapacityTooLarge(_)), "{err:?}");

        let err = RelayConfig::from_toml_str("[pipeline]\nqueue_capacity = 2000000\n").unwrap_err();
        assert_eq!(err, ConfigError::QueueCapacityTooLarge(2_000_000));

        let err = RelayConfig::from_toml_str("[pipeline]\nworkers = 1025\n").unwrap_err();
        assert_eq!(err, ConfigError::TooManyWorkers(MAX_WORKERS + 1));

        let err = RelayConfig::from_toml_str("[pipeline]\nbatch_size = 100000\n").unwrap_err();
        assert_eq!(err, ConfigError::BatchSizeTooLarge(100_000));
    }

    #[test]
    fn limits_are_inclusive() {
        let cfg = PipelineConfig {
            workers: MAX_WORKERS,
            queue_capacity: MAX_QUEUE_CAPACITY,
            batch_size: MAX_BATCH_SIZE,
            ..PipelineConfig::default()
        };
        assert_eq!(cfg.validate(), Ok(()));
    }

    #[test]
    fn toml_unsupported_version() {
        let err = RelayConfig::from_toml_str("version = 7\n").unwrap_err();
        assert_eq!(err, ConfigError::UnsupportedVersion(7));
    }

    #[test]
    fn toml_unknown_sink_kind() {
        let err = RelayConfig::from_toml_str("[sink]\nkind = \"tape\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidSink(_)));
    }

    #[test]
    fn toml_explicit_args_override_preset() {
        let toml = r#"
            [sink]
            program = "/usr/local/bin/ffmpeg"
            preset = "vp8-hls"
            args = ["-i", "pipe:0", "-f", "null", "-"]
        "#;
        let cfg = RelayConfig::from_toml_str(toml).unwrap();
        match cfg.sink {
            SinkConfig::Ffmpeg { program, args } => {
                assert_eq!(program, "/usr/local/bin/ffmpeg");
                assert_eq!(args, vec!["-i", "pipe:0", "-f", "null", "-"]);
            }
            other => panic!("unexpected sink {other:?}"),
        }
    }

    #[test]
    fn toml_bad_bind_address() {
        let err = RelayConfig::from_toml_str("[source]\nbind = \"nowhere\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidSource(_)));
    }

    #[test]
    fn toml_oversized_packet_rejected() {
        let err = RelayConfig::from_toml_str("[source]\nmax_packet_size = 70000\n").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidSource(_)));
    }

    #[test]
    fn toml_syntax_error() {
        let err = RelayConfig::from_toml_str("[pipeline\nworkers = 1").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
