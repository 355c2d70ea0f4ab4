//! Relay sessions.
//!
//! A session owns one accepted client connection, dials the backend for it,
//! and runs a pump in each direction. The first pump to stop tears the whole
//! session down: the session token is cancelled, the other pump unblocks and
//! closes its destination, and the session waits for it before reporting.
//!
//! ```text
//! Dialing -> Relaying -> Closing -> Closed
//!    \_________________________________/
//!          (dial failed or cancelled)
//! ```

use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::common::format_duration;
use crate::dialer::{DialError, Dialer};
use crate::pump::{close_quietly, Direction, Pump, PumpReport, RelaySettings};

/// Lifecycle state of a session. States only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    /// Waiting for the backend connection.
    Dialing,
    /// Both pumps are running.
    Relaying,
    /// One pump stopped; the other is being cancelled.
    Closing,
    /// Both connections are closed.
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Dialing => "dialing",
            SessionState::Relaying => "relaying",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// How a session ended.
#[derive(Debug)]
pub enum SessionOutcome {
    /// The backend could not be reached; no pumps ran.
    DialFailed(DialError),
    /// The session was cancelled before the backend dial completed.
    Cancelled,
    /// Both pumps ran. `first` is the one whose exit tore the session down.
    Relayed { first: PumpReport, second: PumpReport },
}

/// Summary produced once per session.
#[derive(Debug)]
pub struct SessionReport {
    pub id: u64,
    pub peer: SocketAddr,
    pub outcome: SessionOutcome,
    pub elapsed: Duration,
}

impl SessionReport {
    /// True if the dial failed or either pump failed.
    pub fn is_failure(&self) -> bool {
        match &self.outcome {
            SessionOutcome::DialFailed(_) => true,
            SessionOutcome::Cancelled => false,
            SessionOutcome::Relayed { first, second } => {
                first.termination.is_failure() || second.termination.is_failure()
            }
        }
    }

    /// Report for the given direction, if the session got as far as relaying.
    pub fn pump(&self, direction: Direction) -> Option<&PumpReport> {
        match &self.outcome {
            SessionOutcome::Relayed { first, second } => {
                [first, second].into_iter().find(|r| r.direction == direction)
            }
            _ => None,
        }
    }
}

/// One client connection relayed to one backend connection.
#[derive(Debug)]
pub struct Session {
    id: u64,
    peer: SocketAddr,
    state: SessionState,
    settings: RelaySettings,
    cancel: CancellationToken,
}

impl Session {
    /// Creates a session in the `Dialing` state.
    ///
    /// The session token is a child of `shutdown`, so cancelling `shutdown`
    /// ends the session the same way a closed connection does.
    pub fn new(
        id: u64,
        peer: SocketAddr,
        settings: RelaySettings,
        shutdown: &CancellationToken,
    ) -> Self {
        Self {
            id,
            peer,
            state: SessionState::Dialing,
            settings,
            cancel: shutdown.child_token(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Token that ends this session when cancelled. Cancelling twice is harmless.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Advances the state. Returns false, and changes nothing, if `next` is
    /// not ahead of the current state.
    fn set_state(&mut self, next: SessionState) -> bool {
        if next <= self.state {
            return false;
        }
        tracing::debug!(from = %self.state, to = %next, "session state");
        self.state = next;
        true
    }

    /// Dials the backend and relays until either direction stops.
    ///
    /// Both connections are closed by the time this returns.
    pub async fn run<C, D>(mut self, mut client: C, dialer: &D) -> SessionReport
    where
        C: AsyncRead + AsyncWrite + Send + Unpin + 'static,
        D: Dialer,
    {
        let started = Instant::now();
        let cancel = self.cancel.clone();

        let dialed = tokio::select! {
            result = dialer.dial() => Some(result),
            () = cancel.cancelled() => None,
        };

        let backend = match dialed {
            Some(Ok(backend)) => backend,
            Some(Err(e)) => {
                tracing::warn!(error = %e, "backend dial failed");
                close_quietly(&mut client, Direction::BackendToClient).await;
                self.set_state(SessionState::Closed);
                return self.finish(SessionOutcome::DialFailed(e), started);
            }
            None => {
                tracing::debug!("session cancelled while dialing");
                close_quietly(&mut client, Direction::BackendToClient).await;
                self.set_state(SessionState::Closed);
                return self.finish(SessionOutcome::Cancelled, started);
            }
        };

        self.set_state(SessionState::Relaying);

        let (client_rd, client_wr) = tokio::io::split(client);
        let (backend_rd, backend_wr) = tokio::io::split(backend);

        let mut c2b = tokio::spawn(
            Pump::new(
                Direction::ClientToBackend,
                self.settings,
                client_rd,
                backend_wr,
                cancel.clone(),
            )
            .run()
            .in_current_span(),
        );
        let mut b2c = tokio::spawn(
            Pump::new(
                Direction::BackendToClient,
                self.settings,
                backend_rd,
                client_wr,
                cancel.clone(),
            )
            .run()
            .in_current_span(),
        );

        let first = tokio::select! {
            joined = &mut c2b => pump_report(joined, Direction::ClientToBackend),
            joined = &mut b2c => pump_report(joined, Direction::BackendToClient),
        };

        self.set_state(SessionState::Closing);
        cancel.cancel();

        let remaining = match first.direction {
            Direction::ClientToBackend => b2c,
            Direction::BackendToClient => c2b,
        };
        let second = pump_report(remaining.await, first.direction.reverse());

        self.set_state(SessionState::Closed);
        self.finish(SessionOutcome::Relayed { first, second }, started)
    }

    fn finish(self, outcome: SessionOutcome, started: Instant) -> SessionReport {
        let report = SessionReport {
            id: self.id,
            peer: self.peer,
            outcome,
            elapsed: started.elapsed(),
        };

        let elapsed = format_duration(report.elapsed);
        match &report.outcome {
            SessionOutcome::DialFailed(_) | SessionOutcome::Cancelled => {
                tracing::info!(%elapsed, "session closed before relaying");
            }
            SessionOutcome::Relayed { first, second } => {
                let (up, down) = match first.direction {
                    Direction::ClientToBackend => (first, second),
                    Direction::BackendToClient => (second, first),
                };
                tracing::info!(
                    ended_by = %first.direction,
                    reason = %first.termination,
                    up_units = up.units,
                    up_bytes = up.bytes,
                    down_units = down.units,
                    down_bytes = down.bytes,
                    %elapsed,
                    "session closed"
                );
            }
        }

        report
    }
}

fn pump_report(joined: Result<PumpReport, JoinError>, direction: Direction) -> PumpReport {
    joined.unwrap_or_else(|e| {
        tracing::error!(%direction, error = %e, "pump task did not complete");
        PumpReport::aborted(direction, e.to_string())
    })
}
