//! Length-prefixed frame codec.
//!
//! Wire format: a 4-byte big-endian total length (header included) followed by
//! `total - 4` bytes of payload. There is no type tag, version, or checksum.
//!
//! TCP delivers a byte stream, so every read here loops until the header or
//! payload is complete. A frame is either returned whole or not at all.

use bytes::{BufMut, Bytes, BytesMut};
use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Size of the length prefix in bytes.
pub const HEADER_LEN: usize = 4;

/// Largest payload a single frame can carry.
pub const MAX_PAYLOAD_LEN: usize = u32::MAX as usize - HEADER_LEN;

/// Default upper bound on a frame's declared total length (64 MiB).
pub const DEFAULT_MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

/// Malformed frame conditions.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("truncated header: stream ended after {received} of 4 bytes")]
    TruncatedHeader { received: usize },

    #[error("truncated payload: expected {expected} bytes, received {received}")]
    TruncatedPayload { expected: usize, received: usize },

    #[error("invalid frame length {0}: must be at least 4")]
    InvalidLength(u32),

    #[error("frame length {length} exceeds limit of {max} bytes")]
    FrameTooLarge { length: u32, max: u32 },

    #[error("payload of {0} bytes does not fit in a frame")]
    PayloadTooLarge(usize),

    #[error("line exceeds limit of {max} bytes without a newline")]
    LineTooLong { max: usize },
}

/// Result type for sans-IO protocol operations.
pub type ProtocolResult<T> = std::result::Result<T, ProtocolError>;

/// Errors produced while reading or writing frames on a stream.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("read failed: {0}")]
    Read(#[source] io::Error),

    #[error("write failed: {0}")]
    Write(#[source] io::Error),
}

/// A single length-prefixed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    payload: Bytes,
}

impl Frame {
    /// Wraps a payload. Size is checked when the frame is encoded or written.
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
        }
    }

    /// Returns the payload bytes.
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Consumes the frame, returning the payload.
    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    /// Total encoded length including the header.
    pub fn total_len(&self) -> usize {
        self.payload.len() + HEADER_LEN
    }

    /// Encode this frame to a byte buffer.
    pub fn encode(&self, buf: &mut BytesMut) -> ProtocolResult<()> {
        encode_payload(&self.payload, buf)
    }

    /// Decode a frame from a byte buffer.
    ///
    /// Returns `Ok(None)` if there isn't enough data to decode a complete frame.
    /// On success, returns the decoded frame and the number of bytes consumed.
    pub fn decode(buf: &[u8]) -> ProtocolResult<Option<(Frame, usize)>> {
        if buf.len() < HEADER_LEN {
            return Ok(None);
        }

        let total = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let payload_len = payload_length(total)?;
        let consumed = HEADER_LEN + payload_len;

        if buf.len() < consumed {
            return Ok(None);
        }

        let payload = Bytes::copy_from_slice(&buf[HEADER_LEN..consumed]);
        Ok(Some((Frame { payload }, consumed)))
    }
}

/// Limits applied by [`read_frame_with_limits`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLimits {
    /// Maximum declared total length, header included. `None` accepts any `u32`.
    pub max_frame_len: Option<u32>,
}

impl Default for FrameLimits {
    fn default() -> Self {
        Self {
            max_frame_len: Some(DEFAULT_MAX_FRAME_LEN),
        }
    }
}

impl FrameLimits {
    /// Limits that accept every length the wire format can express.
    pub fn unbounded() -> Self {
        Self { max_frame_len: None }
    }

    fn check(&self, total: u32) -> ProtocolResult<usize> {
        let payload_len = payload_length(total)?;
        match self.max_frame_len {
            Some(max) if total > max => Err(ProtocolError::FrameTooLarge { length: total, max }),
            _ => Ok(payload_len),
        }
    }
}

/// Reads one complete frame from `stream` with default limits.
///
/// Returns `Ok(None)` when the stream ends cleanly before the first header byte.
pub async fn read_frame<R>(stream: &mut R) -> Result<Option<Frame>, FrameError>
where
    R: AsyncRead + Unpin,
{
    read_frame_with_limits(stream, FrameLimits::default()).await
}

/// Reads one complete frame from `stream`, enforcing `limits`.
pub async fn read_frame_with_limits<R>(
    stream: &mut R,
    limits: FrameLimits,
) -> Result<Option<Frame>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    let received = read_full(stream, &mut header).await?;
    match received {
        0 => return Ok(None),
        HEADER_LEN => {}
        received => return Err(ProtocolError::TruncatedHeader { received }.into()),
    }

    let total = u32::from_be_bytes(header);
    let payload_len = limits.check(total)?;

    let mut payload = BytesMut::zeroed(payload_len);
    let received = read_full(stream, &mut payload[..]).await?;
    if received < payload_len {
        return Err(ProtocolError::TruncatedPayload {
            expected: payload_len,
            received,
        }
        .into());
    }

    Ok(Some(Frame {
        payload: payload.freeze(),
    }))
}

/// Writes `payload` to `stream` as one frame.
///
/// Header and payload are assembled into one buffer so the frame goes out as a
/// single logical write, then the stream is flushed.
pub async fn write_frame<W>(stream: &mut W, payload: &[u8]) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = BytesMut::new();
    encode_payload(payload, &mut buf)?;

    stream.write_all(&buf).await.map_err(FrameError::Write)?;
    stream.flush().await.map_err(FrameError::Write)?;
    Ok(())
}

/// Reads into `buf` until it is full or the stream ends.
///
/// Returns the number of bytes read; anything short of `buf.len()` means EOF.
async fn read_full<R>(stream: &mut R, buf: &mut [u8]) -> Result<usize, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        match stream.read(&mut buf[filled..]).await {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(FrameError::Read(e)),
        }
    }
    Ok(filled)
}

fn payload_length(total: u32) -> ProtocolResult<usize> {
    if (total as usize) < HEADER_LEN {
        return Err(ProtocolError::InvalidLength(total));
    }
    Ok(total as usize - HEADER_LEN)
}

/// Appends `payload` to `buf` as one frame. Nothing is written if it does not fit.
fn encode_payload(payload: &[u8], buf: &mut BytesMut) -> ProtocolResult<()> {
    let total = total_length_for(payload.len())?;
    buf.reserve(payload.len() + HEADER_LEN);
    buf.put_u32(total);
    buf.put_slice(payload);
    Ok(())
}

fn total_length_for(payload_len: usize) -> ProtocolResult<u32> {
    if payload_len > MAX_PAYLOAD_LEN {
        return Err(ProtocolError::PayloadTooLarge(payload_len));
    }
    Ok((payload_len + HEADER_LEN) as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::io::Builder;

    fn encoded(payload: &[u8]) -> Vec<u8> {
        let mut buf = BytesMut::new();
        Frame::new(payload.to_vec()).encode(&mut buf).unwrap();
        buf.to_vec()
    }

    #[test]
    fn test_encode_header_is_total_length() {
        let bytes = encoded(b"ping");
        assert_eq!(&bytes[..4], &[0, 0, 0, 8]);
        assert_eq!(&bytes[4..], b"ping");
    }

    #[test]
    fn test_encode_empty_payload() {
        let bytes = encoded(b"");
        assert_eq!(bytes, vec![0, 0, 0, 4]);
    }

    #[test]
    fn test_decode_complete() {
        let bytes = encoded(b"hello world");
        let (frame, consumed) = Frame::decode(&bytes).unwrap().unwrap();
        assert_eq!(frame.payload().as_ref(), b"hello world");
        assert_eq!(consumed, bytes.len());
    }

    #[test]
    fn test_decode_incomplete_header() {
        assert_eq!(Frame::decode(&[0, 0]).unwrap(), None);
    }

    #[test]
    fn test_decode_incomplete_payload() {
        let bytes = encoded(b"hello");
        assert_eq!(Frame::decode(&bytes[..6]).unwrap(), None);
    }

    #[test]
    fn test_decode_invalid_length() {
        let result = Frame::decode(&[0, 0, 0, 2]);
        assert_eq!(result, Err(ProtocolError::InvalidLength(2)));
    }

    #[test]
    fn test_multiple_frames_in_buffer() {
        let mut buf = BytesMut::new();
        Frame::new(&b"one"[..]).encode(&mut buf).unwrap();
        Frame::new(&b"two"[..]).encode(&mut buf).unwrap();

        let (first, consumed1) = Frame::decode(&buf).unwrap().unwrap();
        let (second, consumed2) = Frame::decode(&buf[consumed1..]).unwrap().unwrap();
        assert_eq!(first.payload().as_ref(), b"one");
        assert_eq!(second.payload().as_ref(), b"two");
        assert_eq!(consumed1 + consumed2, buf.len());
    }

    #[tokio::test]
    async fn test_write_then_read_roundtrip() {
        for len in [0usize, 1, 4, 1024, 65531] {
            let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();

            let mut wire = Vec::new();
            write_frame(&mut wire, &payload).await.unwrap();
            assert_eq!(wire.len(), len + HEADER_LEN);

            let mut reader = &wire[..];
            let frame = read_frame(&mut reader).await.unwrap().unwrap();
            assert_eq!(frame.payload().as_ref(), &payload[..]);
            assert!(read_frame(&mut reader).await.unwrap().is_none());
        }
    }

    #[tokio::test]
    async fn test_read_one_byte_at_a_time() {
        let wire = encoded(b"fragmented delivery");

        let mut builder = Builder::new();
        for byte in &wire {
            builder.read(std::slice::from_ref(byte));
        }
        let mut stream = builder.build();

        let frame = read_frame(&mut stream).await.unwrap().unwrap();
        assert_eq!(frame.payload().as_ref(), b"fragmented delivery");
    }

    #[tokio::test]
    async fn test_read_split_across_header_and_payload() {
        let wire = encoded(b"abcdefgh");
        let mut stream = Builder::new()
            .read(&wire[..2])
            .read(&wire[2..5])
            .read(&wire[5..9])
            .read(&wire[9..])
            .build();

        let frame = read_frame(&mut stream).await.unwrap().unwrap();
        assert_eq!(frame.payload().as_ref(), b"abcdefgh");
    }

    #[tokio::test]
    async fn test_read_clean_eof_is_peer_closed() {
        let mut stream: &[u8] = &[];
        assert!(read_frame(&mut stream).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_read_truncated_header() {
        let mut stream: &[u8] = &[0, 0];
        let err = read_frame(&mut stream).await.unwrap_err();
        assert!(matches!(
            err,
            FrameError::Protocol(ProtocolError::TruncatedHeader { received: 2 })
        ));
    }

    #[tokio::test]
    async fn test_read_truncated_payload() {
        // Header declares 14 bytes total (10 payload) but only 3 arrive.
        let mut stream: &[u8] = &[0, 0, 0, 14, b'a', b'b', b'c'];
        let err = read_frame(&mut stream).await.unwrap_err();
        assert!(matches!(
            err,
            FrameError::Protocol(ProtocolError::TruncatedPayload {
                expected: 10,
                received: 3
            })
        ));
    }

    #[tokio::test]
    async fn test_read_invalid_length() {
        let mut stream: &[u8] = &[0, 0, 0, 2];
        let err = read_frame(&mut stream).await.unwrap_err();
        assert!(matches!(
            err,
            FrameError::Protocol(ProtocolError::InvalidLength(2))
        ));
    }

    #[tokio::test]
    async fn test_read_header_only_frame() {
        let mut stream: &[u8] = &[0, 0, 0, 4];
        let frame = read_frame(&mut stream).await.unwrap().unwrap();
        assert!(frame.payload().is_empty());
    }

    #[tokio::test]
    async fn test_read_frame_too_large() {
        let limits = FrameLimits {
            max_frame_len: Some(16),
        };
        let mut stream: &[u8] = &[0, 0, 0, 17];
        let err = read_frame_with_limits(&mut stream, limits).await.unwrap_err();
        assert!(matches!(
            err,
            FrameError::Protocol(ProtocolError::FrameTooLarge { length: 17, max: 16 })
        ));
    }

    #[tokio::test]
    async fn test_read_error_is_reported() {
        let mut stream = Builder::new()
            .read(&[0, 0])
            .read_error(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))
            .build();

        let err = read_frame(&mut stream).await.unwrap_err();
        match err {
            FrameError::Read(e) => assert_eq!(e.kind(), io::ErrorKind::ConnectionReset),
            other => panic!("expected read error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_write_failure_is_reported() {
        let mut stream = Builder::new()
            .write_error(io::Error::new(io::ErrorKind::BrokenPipe, "closed"))
            .build();

        let err = write_frame(&mut stream, b"data").await.unwrap_err();
        assert!(matches!(err, FrameError::Write(_)));
    }

    #[tokio::test]
    async fn test_write_frame_matches_encode() {
        let mut written: Vec<u8> = Vec::new();
        write_frame(&mut written, b"same bytes").await.unwrap();
        assert_eq!(written, encoded(b"same bytes"));

        let (frame, consumed) = Frame::decode(&written).unwrap().unwrap();
        assert_eq!(consumed, written.len());
        assert_eq!(frame.payload().as_ref(), b"same bytes");
    }

    #[test]
    fn test_unbounded_limits_accept_large_lengths() {
        assert_eq!(FrameLimits::unbounded().check(u32::MAX), Ok(MAX_PAYLOAD_LEN));
    }
}
