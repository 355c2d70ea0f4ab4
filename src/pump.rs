//! Directional pumps.
//!
//! A pump reads from one connection and writes to another until the source
//! closes, an I/O or protocol error occurs, or its cancellation token fires.
//! The token is only observed between units: a unit that has been read is
//! written out whole before the pump stops. Whatever the cause, the pump
//! closes the write side of its destination on the way out and reports
//! exactly once through its return value.

use std::fmt;
use std::future::Future;
use std::io;
use std::str::FromStr;
use std::time::Duration;

use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};
use tokio_util::sync::CancellationToken;

use crate::common::READ_BUFFER_SIZE;
use crate::frame::{read_frame_with_limits, write_frame, FrameError, FrameLimits, ProtocolError};

/// Buffer size for bulk stream copies.
pub const BULK_BUFFER_SIZE: usize = 64 * 1024;

/// Upper bound on closing the destination once a pump has stopped.
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Relay direction of a pump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToBackend,
    BackendToClient,
}

impl Direction {
    /// The pump running the other way.
    pub fn reverse(self) -> Self {
        match self {
            Direction::ClientToBackend => Direction::BackendToClient,
            Direction::BackendToClient => Direction::ClientToBackend,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::ClientToBackend => f.write_str("client->backend"),
            Direction::BackendToClient => f.write_str("backend->client"),
        }
    }
}

/// How a pump carves the source stream into units before forwarding them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RelayMode {
    /// Length-prefixed frames, forwarded whole.
    #[default]
    Framed,
    /// Each read chunk forwarded as is.
    Raw,
    /// Newline-terminated lines, forwarded whole.
    Line,
    /// Buffered stream copy until EOF.
    Bulk,
}

impl RelayMode {
    /// Names accepted by [`RelayMode::from_str`].
    pub const NAMES: [&'static str; 4] = ["framed", "raw", "line", "bulk"];

    pub fn as_str(&self) -> &'static str {
        match self {
            RelayMode::Framed => "framed",
            RelayMode::Raw => "raw",
            RelayMode::Line => "line",
            RelayMode::Bulk => "bulk",
        }
    }
}

impl fmt::Display for RelayMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RelayMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "framed" => Ok(RelayMode::Framed),
            "raw" => Ok(RelayMode::Raw),
            "line" => Ok(RelayMode::Line),
            "bulk" => Ok(RelayMode::Bulk),
            other => Err(format!(
                "unknown relay mode '{}', expected one of: {}",
                other,
                Self::NAMES.join(", ")
            )),
        }
    }
}

/// Per-session relay settings shared by both pumps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RelaySettings {
    pub mode: RelayMode,
    pub limits: FrameLimits,
}

/// Why a pump stopped.
#[derive(Debug)]
pub enum Termination {
    /// The source ended the stream between units.
    SourceClosed,
    /// The session cancelled the pump.
    Cancelled,
    /// Reading, parsing, or writing failed.
    Failed(FrameError),
    /// The pump task panicked or was aborted.
    Aborted(String),
}

impl Termination {
    /// Returns true for terminations that indicate a fault.
    pub fn is_failure(&self) -> bool {
        matches!(self, Termination::Failed(_) | Termination::Aborted(_))
    }
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Termination::SourceClosed => f.write_str("source closed"),
            Termination::Cancelled => f.write_str("cancelled"),
            Termination::Failed(e) => write!(f, "failed: {}", e),
            Termination::Aborted(reason) => write!(f, "aborted: {}", reason),
        }
    }
}

/// Final accounting for one pump.
#[derive(Debug)]
pub struct PumpReport {
    pub direction: Direction,
    /// Frames, lines, or chunks forwarded, depending on the mode.
    pub units: u64,
    /// Bytes forwarded, excluding frame headers.
    pub bytes: u64,
    pub termination: Termination,
}

impl PumpReport {
    pub(crate) fn aborted(direction: Direction, reason: String) -> Self {
        Self {
            direction,
            units: 0,
            bytes: 0,
            termination: Termination::Aborted(reason),
        }
    }
}

/// A unidirectional relay from `src` to `dst`.
pub struct Pump<R, W> {
    direction: Direction,
    settings: RelaySettings,
    src: R,
    dst: W,
    cancel: CancellationToken,
    units: u64,
    bytes: u64,
}

impl<R, W> Pump<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(
        direction: Direction,
        settings: RelaySettings,
        src: R,
        dst: W,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            direction,
            settings,
            src,
            dst,
            cancel,
            units: 0,
            bytes: 0,
        }
    }

    /// Runs the pump to completion and closes the destination.
    pub async fn run(mut self) -> PumpReport {
        let direction = self.direction;
        tracing::debug!(%direction, mode = %self.settings.mode, "pump started");

        let termination = self.relay().await;

        match &termination {
            Termination::SourceClosed => {
                tracing::info!(%direction, units = self.units, bytes = self.bytes, "source closed the connection");
            }
            Termination::Cancelled => {
                tracing::debug!(%direction, units = self.units, bytes = self.bytes, "pump cancelled");
            }
            Termination::Failed(e) => {
                tracing::warn!(%direction, units = self.units, bytes = self.bytes, error = %e, "pump failed");
            }
            Termination::Aborted(_) => {}
        }

        close_quietly(&mut self.dst, direction).await;

        PumpReport {
            direction,
            units: self.units,
            bytes: self.bytes,
            termination,
        }
    }

    async fn relay(&mut self) -> Termination {
        match self.settings.mode {
            RelayMode::Framed => self.relay_frames().await,
            RelayMode::Raw => self.relay_chunks().await,
            RelayMode::Line => self.relay_lines().await,
            RelayMode::Bulk => self.relay_bulk().await,
        }
    }

    async fn relay_frames(&mut self) -> Termination {
        loop {
            let read = tokio::select! {
                biased;
                () = self.cancel.cancelled() => return Termination::Cancelled,
                read = read_frame_with_limits(&mut self.src, self.settings.limits) => read,
            };
            let frame = match read {
                Ok(Some(frame)) => frame,
                Ok(None) => return Termination::SourceClosed,
                Err(e) => return Termination::Failed(e),
            };

            let write = write_frame(&mut self.dst, frame.payload());
            if let Err(termination) = finish_write(&self.cancel, self.direction, write).await {
                return termination;
            }

            self.units += 1;
            self.bytes += frame.payload().len() as u64;
            tracing::trace!(direction = %self.direction, len = frame.total_len(), "frame forwarded");
        }
    }

    async fn relay_chunks(&mut self) -> Termination {
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        loop {
            let read = tokio::select! {
                biased;
                () = self.cancel.cancelled() => return Termination::Cancelled,
                read = self.src.read(&mut buf) => read,
            };
            let n = match read {
                Ok(0) => return Termination::SourceClosed,
                Ok(n) => n,
                Err(e) => return Termination::Failed(FrameError::Read(e)),
            };

            let write = forward(&mut self.dst, &buf[..n]);
            if let Err(termination) = finish_write(&self.cancel, self.direction, write).await {
                return termination;
            }

            self.units += 1;
            self.bytes += n as u64;
        }
    }

    async fn relay_lines(&mut self) -> Termination {
        let max_line = self.settings.limits.max_frame_len.map(|max| max as usize);
        let mut reader = BufReader::new(&mut self.src);
        let mut line = Vec::with_capacity(READ_BUFFER_SIZE);
        loop {
            line.clear();
            // A final line without a trailing newline is still forwarded.
            let read = tokio::select! {
                biased;
                () = self.cancel.cancelled() => return Termination::Cancelled,
                read = read_line(&mut reader, &mut line, max_line) => read,
            };
            let n = match read {
                Ok(0) => return Termination::SourceClosed,
                Ok(n) => n,
                Err(e) => return Termination::Failed(e),
            };

            let write = forward(&mut self.dst, &line);
            if let Err(termination) = finish_write(&self.cancel, self.direction, write).await {
                return termination;
            }

            self.units += 1;
            self.bytes += n as u64;
        }
    }

    async fn relay_bulk(&mut self) -> Termination {
        let mut reader = BufReader::with_capacity(BULK_BUFFER_SIZE, &mut self.src);
        loop {
            let read = tokio::select! {
                biased;
                () = self.cancel.cancelled() => return Termination::Cancelled,
                read = reader.fill_buf() => read,
            };
            let chunk = match read {
                Ok([]) => return Termination::SourceClosed,
                Ok(chunk) => chunk,
                Err(e) => return Termination::Failed(FrameError::Read(e)),
            };
            let n = chunk.len();

            let write = forward(&mut self.dst, chunk);
            if let Err(termination) = finish_write(&self.cancel, self.direction, write).await {
                return termination;
            }
            reader.consume(n);

            self.units += 1;
            self.bytes += n as u64;
        }
    }
}

/// Drives a unit's write to completion.
///
/// Cancellation never interrupts a write: once the token fires the write gets
/// [`CLOSE_TIMEOUT`] to finish, so the destination sees whole units only.
async fn finish_write<F>(
    cancel: &CancellationToken,
    direction: Direction,
    write: F,
) -> Result<(), Termination>
where
    F: Future<Output = Result<(), FrameError>>,
{
    tokio::pin!(write);
    tokio::select! {
        biased;
        result = &mut write => return result.map_err(Termination::Failed),
        () = cancel.cancelled() => {}
    }

    tracing::debug!(%direction, "cancelled mid-write, draining");
    match tokio::time::timeout(CLOSE_TIMEOUT, write).await {
        Ok(result) => result.map_err(Termination::Failed),
        Err(_) => Err(Termination::Failed(FrameError::Write(io::Error::new(
            io::ErrorKind::TimedOut,
            "destination stalled while draining a unit",
        )))),
    }
}

/// Reads up to and including the next `\n`, failing once `max` bytes pass without one.
async fn read_line<R>(
    reader: &mut R,
    line: &mut Vec<u8>,
    max: Option<usize>,
) -> Result<usize, FrameError>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        let available = reader.fill_buf().await.map_err(FrameError::Read)?;
        if available.is_empty() {
            return Ok(line.len());
        }
        let (used, done) = match available.iter().position(|&b| b == b'\n') {
            Some(i) => (i + 1, true),
            None => (available.len(), false),
        };
        line.extend_from_slice(&available[..used]);
        reader.consume(used);

        if let Some(max) = max {
            if line.len() > max {
                return Err(ProtocolError::LineTooLong { max }.into());
            }
        }
        if done {
            return Ok(line.len());
        }
    }
}

async fn forward<W>(dst: &mut W, data: &[u8]) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    dst.write_all(data).await.map_err(FrameError::Write)?;
    dst.flush().await.map_err(FrameError::Write)
}

/// Shuts down the write side of `dst`.
///
/// The peer may already be gone, so errors and timeouts are only logged.
pub(crate) async fn close_quietly<W>(dst: &mut W, direction: Direction)
where
    W: AsyncWrite + Unpin,
{
    match tokio::time::timeout(CLOSE_TIMEOUT, dst.shutdown()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::debug!(%direction, error = %e, "destination already closed"),
        Err(_) => tracing::debug!(%direction, "timed out closing destination"),
    }
}
