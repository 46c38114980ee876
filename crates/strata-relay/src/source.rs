//! # Packet Sources
//!
//! Blocking pull interface feeding the read loop, plus a UDP/RTP source and
//! a channel-backed source for embedding.

use std::io::ErrorKind;
use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use tracing::{debug, info};

use crate::config::SourceConfig;
use crate::rtp;

/// Result of one pull.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pull {
    Packet(Bytes),
    /// Nothing arrived within the source's wait bound. The read loop uses
    /// this to notice a stop request while traffic is quiet.
    Idle,
    /// The source is exhausted.
    End,
}

pub trait PacketSource: Send {
    /// Block for the next packet. An error is fatal to the read loop.
    fn next(&mut self) -> anyhow::Result<Pull>;
}

impl PacketSource for Box<dyn PacketSource> {
    fn next(&mut self) -> anyhow::Result<Pull> {
        (**self).next()
    }
}

// ─── UDP ────────────────────────────────────────────────────────────────────

/// Reads datagrams from a UDP socket, optionally keeping only the RTP payload.
pub struct UdpSource {
    socket: UdpSocket,
    buf: BytesMut,
    max_packet_size: usize,
    strip_rtp: bool,
    malformed: u64,
}

impl UdpSource {
    pub fn bind(config: &SourceConfig) -> anyhow::Result<Self> {
        let socket = UdpSocket::bind(config.bind)?;
        info!(addr = %socket.local_addr()?, strip_rtp = config.strip_rtp, "source: listening for UDP");
        Self::from_socket(socket, config)
    }

    /// Use an already-bound socket. `config.bind` is ignored.
    pub fn from_socket(socket: UdpSocket, config: &SourceConfig) -> anyhow::Result<Self> {
        socket.set_read_timeout(Some(config.read_timeout.max(Duration::from_millis(1))))?;
        Ok(UdpSource {
            socket,
            buf: BytesMut::with_capacity(config.max_packet_size),
            max_packet_size: config.max_packet_size,
            strip_rtp: config.strip_rtp,
            malformed: 0,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Datagrams skipped because they were not valid RTP.
    pub fn malformed(&self) -> u64 {
        self.malformed
    }
}

impl PacketSource for UdpSource {
    fn next(&mut self) -> anyhow::Result<Pull> {
        self.buf.clear();
        self.buf.resize(self.max_packet_size, 0);
        let n = match self.socket.recv(&mut self.buf[..]) {
            Ok(n) => n,
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                return Ok(Pull::Idle)
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => return Ok(Pull::Idle),
            Err(e) => return Err(e.into()),
        };
        let datagram = self.buf.split_to(n).freeze();

        if !self.strip_rtp {
            return Ok(Pull::Packet(datagram));
        }
        match rtp::payload(&datagram) {
            Ok(payload) => Ok(Pull::Packet(payload)),
            Err(e) => {
                self.malformed += 1;
                debug!(error = %e, len = n, "skipping non-RTP datagram");
                Ok(Pull::Idle)
            }
        }
    }
}

// ─── Channel ────────────────────────────────────────────────────────────────

/// Pulls payloads from a crossbeam channel; ends when every sender is gone.
pub struct ChannelSource {
    rx: Receiver<Bytes>,
    poll: Duration,
}

impl ChannelSource {
    pub fn new(rx: Receiver<Bytes>) -> Self {
        Self::with_poll_interval(rx, Duration::from_millis(50))
    }

    pub fn with_poll_interval(rx: Receiver<Bytes>, poll: Duration) -> Self {
        ChannelSource { rx, poll }
    }
}

impl PacketSource for ChannelSource {
    fn next(&mut self) -> anyhow::Result<Pull> {
        match self.rx.recv_timeout(self.poll) {
            Ok(payload) => Ok(Pull::Packet(payload)),
            Err(RecvTimeoutError::Timeout) => Ok(Pull::Idle),
            Err(RecvTimeoutError::Disconnected) => Ok(Pull::End),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;

    fn test_config(strip_rtp: bool) -> SourceConfig {
        SourceConfig {
            bind: "127.0.0.1:0".parse().unwrap(),
            strip_rtp,
            read_timeout: Duration::from_millis(20),
            max_packet_size: 1500,
        }
    }

    fn rtp_packet(payload: &[u8]) -> Vec<u8> {
        let mut v = vec![0x80, 111, 0, 1, 0, 0, 0, 0, 0, 0, 0, 1];
        v.extend_from_slice(payload);
        v
    }

    #[test]
    fn udp_source_strips_rtp_header() {
        let mut src = UdpSource::bind(&test_config(true)).unwrap();
        let addr = src.local_addr().unwrap();
        let tx = UdpSocket::bind("127.0.0.1:0").unwrap();
        tx.send_to(&rtp_packet(b"opus-frame"), addr).unwrap();

        let mut got = None;
        for _ in 0..50 {
            if let Pull::Packet(p) = src.next().unwrap() {
                got = Some(p);
                break;
            }
        }
        assert_eq!(got.unwrap(), Bytes::from_static(b"opus-frame"));
    }

    #[test]
    fn udp_source_raw_mode_keeps_datagram() {
        let mut src = UdpSource::bind(&test_config(false)).unwrap();
        let addr = src.local_addr().unwrap();
        let tx = UdpSocket::bind("127.0.0.1:0").unwrap();
        tx.send_to(b"raw", addr).unwrap();

        let mut got = None;
        for _ in 0..50 {
            if let Pull::Packet(p) = src.next().unwrap() {
                got = Some(p);
                break;
            }
        }
        assert_eq!(got.unwrap(), Bytes::from_static(b"raw"));
    }

    #[test]
    fn udp_source_skips_malformed_and_idles() {
        let mut src = UdpSource::bind(&test_config(true)).unwrap();
        let addr = src.local_addr().unwrap();
        let tx = UdpSocket::bind("127.0.0.1:0").unwrap();
        tx.send_to(b"nope", addr).unwrap();

        for _ in 0..50 {
            assert_eq!(src.next().unwrap(), Pull::Idle);
            if src.malformed() == 1 {
                break;
            }
        }
        assert_eq!(src.malformed(), 1);
    }

    #[test]
    fn channel_source_ends_on_disconnect() {
        let (tx, rx) = unbounded();
        let mut src = ChannelSource::with_poll_interval(rx, Duration::from_millis(5));
        tx.send(Bytes::from_static(b"a")).unwrap();
        assert_eq!(src.next().unwrap(), Pull::Packet(Bytes::from_static(b"a")));
        assert_eq!(src.next().unwrap(), Pull::Idle);
        drop(tx);
        assert_eq!(src.next().unwrap(), Pull::End);
    }
}
