use std::fmt;
use std::io;

use bytes::Bytes;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Size of the fixed header preceding every multiplexed frame.
pub const HEADER_LEN: usize = 8;

/// Frames larger than this are treated as stream corruption.
pub const MAX_FRAME_LEN: u32 = 1024 * 1024;

const STREAM_STDOUT: u8 = 1;
const STREAM_STDERR: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamType {
    Stdout,
    Stderr,
    /// Stream kinds this client does not know about yet. Kept so newer
    /// servers do not abort older clients.
    Other(u8),
}

impl StreamType {
    pub fn from_u8(value: u8) -> Self {
        match value {
            STREAM_STDOUT => StreamType::Stdout,
            STREAM_STDERR => StreamType::Stderr,
            other => StreamType::Other(other),
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            StreamType::Stdout => STREAM_STDOUT,
            StreamType::Stderr => STREAM_STDERR,
            StreamType::Other(other) => other,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub stream: StreamType,
    pub len: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub stream: StreamType,
    pub payload: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameSection {
    Header,
    Payload,
}

impl fmt::Display for FrameSection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameSection::Header => f.write_str("header"),
            FrameSection::Payload => f.write_str("payload"),
        }
    }
}

#[derive(Debug, Error)]
pub enum FramingError {
    #[error("frame payload of {len} bytes exceeds the {limit} byte limit")]
    PayloadTooLarge { len: u32, limit: u32 },
    #[error("stream ended inside frame {section} after {got} of {expected} bytes")]
    Truncated {
        section: FrameSection,
        got: usize,
        expected: usize,
    },
    #[error("failed to read frame {section} after {got} bytes: {source}")]
    Io {
        section: FrameSection,
        /// Bytes of this section already received when the read failed.
        got: usize,
        #[source]
        source: io::Error,
    },
}

pub fn encode_header(header: FrameHeader) -> [u8; HEADER_LEN] {
    let mut buf = [0u8; HEADER_LEN];
    buf[0] = header.stream.as_u8();
    buf[4..].copy_from_slice(&header.len.to_be_bytes());
    buf
}

/// Decodes a header, rejecting lengths above `limit`. The three reserved
/// bytes are ignored.
pub fn decode_header_with_limit(
    bytes: &[u8; HEADER_LEN],
    limit: u32,
) -> Result<FrameHeader, FramingError> {
    let len = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
    if len > limit {
        return Err(FramingError::PayloadTooLarge { len, limit });
    }
    Ok(FrameHeader {
        stream: StreamType::from_u8(bytes[0]),
        len,
    })
}

pub fn decode_header(bytes: &[u8; HEADER_LEN]) -> Result<FrameHeader, FramingError> {
    decode_header_with_limit(bytes, MAX_FRAME_LEN)
}

pub fn encode_frame(stream: StreamType, payload: &[u8]) -> Result<Vec<u8>, FramingError> {
    let len = u32::try_from(payload.len()).unwrap_or(u32::MAX);
    if len > MAX_FRAME_LEN {
        return Err(FramingError::PayloadTooLarge {
            len,
            limit: MAX_FRAME_LEN,
        });
    }
    let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
    buf.extend_from_slice(&encode_header(FrameHeader { stream, len }));
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Pulls frames off a multiplexed byte stream.
pub struct FrameReader<R> {
    inner: R,
    limit: u32,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self::with_limit(inner, MAX_FRAME_LEN)
    }

    pub fn with_limit(inner: R, limit: u32) -> Self {
        Self { inner, limit }
    }

    /// Returns `Ok(None)` when the peer closes cleanly at a frame boundary.
    pub async fn next_frame(&mut self) -> Result<Option<Frame>, FramingError> {
        let mut header = [0u8; HEADER_LEN];
        let got = self.fill(&mut header, FrameSection::Header).await?;
        if got == 0 {
            return Ok(None);
        }
        if got < HEADER_LEN {
            return Err(FramingError::Truncated {
                section: FrameSection::Header,
                got,
                expected: HEADER_LEN,
            });
        }

        let header = decode_header_with_limit(&header, self.limit)?;
        tracing::trace!(
            stream = header.stream.as_u8(),
            len = header.len,
            "multiplexed frame header"
        );
        if header.len == 0 {
            return Ok(Some(Frame {
                stream: header.stream,
                payload: Bytes::new(),
            }));
        }

        let expected = header.len as usize;
        let mut payload = vec![0u8; expected];
        let got = self.fill(&mut payload, FrameSection::Payload).await?;
        if got < expected {
            return Err(FramingError::Truncated {
                section: FrameSection::Payload,
                got,
                expected,
            });
        }
        Ok(Some(Frame {
            stream: header.stream,
            payload: Bytes::from(payload),
        }))
    }

    async fn fill(&mut self, buf: &mut [u8], section: FrameSection) -> Result<usize, FramingError> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self
                .inner
                .read(&mut buf[filled..])
                .await
                .map_err(|source| FramingError::Io {
                    section,
                    got: filled,
                    source,
                })?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(filled)
    }
}
