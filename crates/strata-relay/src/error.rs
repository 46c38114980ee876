//! Error types for configuration and pipeline stages.

use thiserror::Error;

/// Configuration rejected before any pipeline thread starts.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("worker pool size must be at least 1")]
    ZeroWorkers,
    #[error("worker pool size {0} exceeds the maximum of {max}", max = crate::config::MAX_WORKERS)]
    TooManyWorkers(usize),
    #[error("handoff queue capacity must be at least 1")]
    ZeroQueueCapacity,
    #[error("handoff queue capacity {0} exceeds the maximum of {max}", max = crate::config::MAX_QUEUE_CAPACITY)]
    QueueCapacityTooLarge(usize),
    #[error("batch size must be at least 1")]
    ZeroBatchSize,
    #[error("batch size {0} exceeds the maximum of {max}", max = crate::config::MAX_BATCH_SIZE)]
    BatchSizeTooLarge(usize),
    #[error("flush interval must be greater than zero")]
    ZeroFlushInterval,
    #[error("metrics report interval must be greater than zero")]
    ZeroReportInterval,
    #[error("unsupported config version {0}")]
    UnsupportedVersion(u32),
    #[error("invalid config TOML: {0}")]
    Parse(String),
    #[error("invalid sink: {0}")]
    InvalidSink(String),
    #[error("invalid source: {0}")]
    InvalidSource(String),
}

/// Fatal pipeline failure, tagged with the stage that failed.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("config: {0}")]
    Config(#[from] ConfigError),
    #[error("source read failed: {0}")]
    Source(#[source] anyhow::Error),
    #[error("sink write failed: {0}")]
    Sink(#[source] anyhow::Error),
    #[error("failed to spawn {stage} thread: {source}")]
    Spawn {
        stage: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("{0} thread panicked")]
    Panicked(&'static str),
}

impl PipelineError {
    /// Name of the stage that produced this error, for diagnostics.
    pub fn stage(&self) -> &'static str {
        match self {
            PipelineError::Config(_) => "config",
            PipelineError::Source(_) => "source",
            PipelineError::Sink(_) => "writer",
            PipelineError::Spawn { stage, .. } => stage,
            PipelineError::Panicked(stage) => stage,
        }
    }
}
