//! RTP fixed-header parsing (RFC 3550 §5.1) and zero-copy payload slicing.

use bytes::Bytes;
use thiserror::Error;

pub const RTP_VERSION: u8 = 2;
pub const FIXED_HEADER_LEN: usize = 12;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RtpError {
    #[error("packet too short for RTP header: {0} bytes")]
    TooShort(usize),
    #[error("unsupported RTP version {0}")]
    BadVersion(u8),
    #[error("header extends past end of packet")]
    Truncated,
    #[error("padding length exceeds payload")]
    BadPadding,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpHeader {
    pub marker: bool,
    pub payload_type: u8,
    pub sequence: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    pub csrc_count: u8,
    pub extension: bool,
    /// Bytes from the start of the packet to the payload.
    pub header_len: usize,
    /// Trailing padding bytes, 0 when the P bit is clear.
    pub padding_len: usize,
}

pub fn parse_header(buf: &[u8]) -> Result<RtpHeader, RtpError> {
    if buf.len() < FIXED_HEADER_LEN {
        return Err(RtpError::TooShort(buf.len()));
    }
    let version = buf[0] >> 6;
    if version != RTP_VERSION {
        return Err(RtpError::BadVersion(version));
    }
    let padding = buf[0] & 0x20 != 0;
    let extension = buf[0] & 0x10 != 0;
    let csrc_count = buf[0] & 0x0F;

    let mut header_len = FIXED_HEADER_LEN + 4 * csrc_count as usize;
    if buf.len() < header_len {
        return Err(RtpError::Truncated);
    }
    if extension {
        // 16-bit profile id, 16-bit length in 32-bit words.
        if buf.len() < header_len + 4 {
            return Err(RtpError::Truncated);
        }
        let words = u16::from_be_bytes([buf[header_len + 2], buf[header_len + 3]]) as usize;
        header_len += 4 + 4 * words;
        if buf.len() < header_len {
            return Err(RtpError::Truncated);
        }
    }

    let padding_len = if padding {
        let n = buf[buf.len() - 1] as usize;
        if n == 0 || header_len + n > buf.len() {
            return Err(RtpError::BadPadding);
        }
        n
    } else {
        0
    };

    Ok(RtpHeader {
        marker: buf[1] & 0x80 != 0,
        payload_type: buf[1] & 0x7F,
        sequence: u16::from_be_bytes([buf[2], buf[3]]),
        timestamp: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
        ssrc: u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]),
        csrc_count,
        extension,
        header_len,
        padding_len,
    })
}

/// Slice the payload out of an RTP packet without copying.
pub fn payload(packet: &Bytes) -> Result<Bytes, RtpError> {
    let header = parse_header(packet)?;
    Ok(packet.slice(header.header_len..packet.len() - header.padding_len))
}
