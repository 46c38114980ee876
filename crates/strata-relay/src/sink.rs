//! # Output Sinks
//!
//! Byte-stream consumers at the end of the pipeline. A sink is owned by the
//! batching writer and is only ever touched from the writer thread.

use std::io::Write;
use std::process::{Child, ChildStdin, Command, Stdio};

use anyhow::Context;
use tracing::{info, warn};

use crate::config::SinkConfig;

pub trait Sink: Send {
    /// Write one payload. An error is fatal to the writer.
    fn write(&mut self, data: &[u8]) -> anyhow::Result<()>;

    /// Release the sink. Called once by the writer on termination.
    fn close(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

impl Sink for Box<dyn Sink> {
    fn write(&mut self, data: &[u8]) -> anyhow::Result<()> {
        (**self).write(data)
    }

    fn close(&mut self) -> anyhow::Result<()> {
        (**self).close()
    }
}

/// Build the sink described by `config`, spawning ffmpeg if needed.
pub fn build_sink(config: &SinkConfig) -> anyhow::Result<Box<dyn Sink>> {
    Ok(match config {
        SinkConfig::Ffmpeg { program, args } => Box::new(FfmpegSink::spawn(program, args)?),
        SinkConfig::Stdout => Box::new(IoSink::stdout()),
        SinkConfig::Null => Box::new(NullSink::new()),
    })
}

// ─── Null ───────────────────────────────────────────────────────────────────

/// Discards output (monitor mode).
#[derive(Debug, Default)]
pub struct NullSink;

impl NullSink {
    pub fn new() -> Self {
        info!("output: monitor mode, payloads are discarded");
        NullSink
    }
}

impl Sink for NullSink {
    fn write(&mut self, _data: &[u8]) -> anyhow::Result<()> {
        Ok(())
    }
}

// ─── Generic Writer ─────────────────────────────────────────────────────────

/// Any `io::Write`, flushed on close.
pub struct IoSink<W: Write + Send> {
    inner: Option<W>,
}

impl IoSink<std::io::Stdout> {
    pub fn stdout() -> Self {
        info!("output: writing payloads to stdout");
        Self::new(std::io::stdout())
    }
}

impl<W: Write + Send> IoSink<W> {
    pub fn new(inner: W) -> Self {
        IoSink { inner: Some(inner) }
    }

    /// Give back the wrapped writer if the sink has not been closed.
    pub fn into_inner(mut self) -> Option<W> {
        self.inner.take()
    }
}

impl<W: Write + Send> Sink for IoSink<W> {
    fn write(&mut self, data: &[u8]) -> anyhow::Result<()> {
        let inner = self
            .inner
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("sink already closed"))?;
        inner.write_all(data)?;
        Ok(())
    }

    fn close(&mut self) -> anyhow::Result<()> {
        if let Some(mut inner) = self.inner.take() {
            inner.flush()?;
        }
        Ok(())
    }
}

// ─── ffmpeg ─────────────────────────────────────────────────────────────────

/// Canned ffmpeg argument sets for low-latency HLS segmenting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FfmpegPreset {
    /// Opus in, 25 ms ogg segments with a live m3u8 playlist.
    OpusHls,
    /// Raw 640x480 video in, x264 zerolatency, 50 ms fragmented mp4 segments.
    Vp8Hls,
}

impl FfmpegPreset {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "opus-hls" | "opus" => Some(FfmpegPreset::OpusHls),
            "vp8-hls" | "vp8" => Some(FfmpegPreset::Vp8Hls),
            _ => None,
        }
    }

    pub fn args(&self) -> Vec<String> {
        let args: &[&str] = match self {
            FfmpegPreset::OpusHls => &[
                "-hide_banner",
                "-loglevel",
                "warning",
                "-fflags",
                "+nobuffer+fastseek+flush_packets+discardcorrupt",
                "-flags",
                "low_delay",
                "-f",
                "opus",
                "-i",
                "pipe:0",
                "-c:a",
                "copy",
                "-f",
                "segment",
                "-segment_time",
                "0.025",
                "-segment_format",
                "ogg",
                "-segment_list_flags",
                "+live",
                "-segment_list_size",
                "2",
                "-segment_list",
                "stream.m3u8",
                "-segment_format_options",
                "flush_packets=1",
                "-max_delay",
                "0",
                "-avoid_negative_ts",
                "make_zero",
                "-segment_list_type",
                "m3u8",
                "-thread_queue_size",
                "512",
                "-segment_filename",
                "stream_%d.ogg",
            ],
            FfmpegPreset::Vp8Hls => &[
                "-hide_banner",
                "-loglevel",
                "warning",
                "-f",
                "rawvideo",
                "-pix_fmt",
                "yuv420p",
                "-s",
                "640x480",
                "-r",
                "30",
                "-i",
                "pipe:0",
                "-c:v",
                "libx264",
                "-preset",
                "veryfast",
                "-tune",
                "zerolatency",
                "-f",
                "segment",
                "-segment_time",
                "0.05",
                "-segment_format",
                "mp4",
                "-segment_list_flags",
                "+live",
                "-segment_list_size",
                "2",
                "-segment_list",
                "stream.m3u8",
                "-segment_format_options",
                "movflags=+frag_keyframe+empty_moov",
                "-max_delay",
                "0",
                "-avoid_negative_ts",
                "make_zero",
                "-segment_list_type",
                "m3u8",
                "-segment_filename",
                "stream_%d.mp4",
            ],
        };
        args.iter().map(|s| s.to_string()).collect()
    }
}

/// Pipes payloads into a child process's stdin.
pub struct FfmpegSink {
    child: Child,
    stdin: Option<ChildStdin>,
}

impl FfmpegSink {
    pub fn spawn(program: &str, args: &[String]) -> anyhow::Result<Self> {
        info!(program, "output: starting transcoder");

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .spawn()
            .with_context(|| format!("failed to start {program} (is it installed?)"))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow::anyhow!("failed to open {program} stdin"))?;

        Ok(FfmpegSink {
            child,
            stdin: Some(stdin),
        })
    }

    pub fn id(&self) -> u32 {
        self.child.id()
    }
}

impl Sink for FfmpegSink {
    fn write(&mut self, data: &[u8]) -> anyhow::Result<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("transcoder stdin already closed"))?;
        stdin.write_all(data)?;
        Ok(())
    }

    /// Close stdin to signal EOF, then wait for the process to exit.
    fn close(&mut self) -> anyhow::Result<()> {
        let Some(stdin) = self.stdin.take() else {
            return Ok(());
        };
        drop(stdin);
        let status = self.child.wait()?;
        if status.success() {
            info!("transcoder stopped");
        } else {
            warn!(%status, "transcoder exited with failure");
        }
        Ok(())
    }
}

impl Drop for FfmpegSink {
    fn drop(&mut self) {
        let _ = Sink::close(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_sink_writes_and_flushes() {
        let mut sink = IoSink::new(Vec::new());
        sink.write(b"ab").unwrap();
        sink.write(b"cd").unwrap();
        let inner = sink.into_inner().unwrap();
        assert_eq!(inner, b"abcd");
    }

    #[test]
    fn io_sink_rejects_write_after_close() {
        let mut sink = IoSink::new(Vec::new());
        sink.close().unwrap();
        sink.close().unwrap();
        assert!(sink.write(b"x").is_err());
    }

    #[test]
    fn preset_names() {
        assert_eq!(FfmpegPreset::from_name("opus-hls"), Some(FfmpegPreset::OpusHls));
        assert_eq!(FfmpegPreset::from_name(" VP8 "), Some(FfmpegPreset::Vp8Hls));
        assert_eq!(FfmpegPreset::from_name("h265"), None);
    }

    #[test]
    fn presets_read_from_stdin_pipe() {
        for preset in [FfmpegPreset::OpusHls, FfmpegPreset::Vp8Hls] {
            let args = preset.args();
            let i = args.iter().position(|a| a == "-i").unwrap();
            assert_eq!(args[i + 1], "pipe:0");
        }
        assert!(FfmpegPreset::OpusHls.args().contains(&"stream_%d.ogg".to_string()));
        assert!(FfmpegPreset::Vp8Hls.args().contains(&"stream_%d.mp4".to_string()));
    }

    #[test]
    fn spawn_missing_program_fails() {
        let err = FfmpegSink::spawn("strata-relay-no-such-binary", &[]).err().unwrap();
        assert!(err.to_string().contains("failed to start"));
    }

    #[cfg(unix)]
    #[test]
    fn child_process_receives_payloads() {
        // `cat` copies stdin to its stdout, which is discarded; this checks
        // the write path and that close waits for a clean exit.
        let mut sink = FfmpegSink::spawn("cat", &[]).unwrap();
        sink.write(b"hello").unwrap();
        sink.close().unwrap();
        sink.close().unwrap();
        assert!(sink.write(b"late").is_err());
    }

    #[test]
    fn boxed_sink_forwards() {
        let mut sink: Box<dyn Sink> = Box::new(NullSink);
        sink.write(b"x").unwrap();
        sink.close().unwrap();
    }
}
