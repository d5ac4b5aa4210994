//! Per-client session lifecycle.
//!
//! `Created -> Racing -> Relaying -> Closed`, never backwards. The client
//! connection is closed exactly once on every path and the final counters are
//! always reported.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::dialer::{CandidateDialer, DialStrategy, DEFAULT_CONNECT_TIMEOUT};
use super::log::{Logger, NullLogger};
use super::racer::{BroadcastFailurePolicy, ConnectionRacer, DEFAULT_RACE_WINDOW};
use super::relay::{ByteCounters, Direction, RelayEngine, RELAY_BUFFER_SIZE};
use super::stream::RelayStream;
use crate::error::SessionError;

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    Created,
    Racing,
    Relaying,
    Closed,
}

/// Settings shared by every session of a listener.
#[derive(Clone)]
pub struct SessionConfig {
    /// How candidates are dialed.
    pub dial: DialStrategy,
    /// Disable Nagle's algorithm on client and candidate sockets.
    pub disable_nagle: bool,
    /// Hex-encode payloads in trace output.
    pub hex_logging: bool,
    /// How long every candidate gets to answer.
    pub race_window: Duration,
    /// Per-candidate connect timeout.
    pub connect_timeout: Duration,
    /// Behavior when the first payload cannot be written to a candidate.
    pub broadcast_failure: BroadcastFailurePolicy,
    /// Session log sink.
    pub logger: Arc<dyn Logger>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            dial: DialStrategy::Plain,
            disable_nagle: false,
            hex_logging: false,
            race_window: DEFAULT_RACE_WINDOW,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            broadcast_failure: BroadcastFailurePolicy::default(),
            logger: Arc::new(NullLogger),
        }
    }
}

impl SessionConfig {
    pub fn with_logger(mut self, logger: Arc<dyn Logger>) -> Self {
        self.logger = logger;
        self
    }
}

impl fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionConfig")
            .field("dial", &self.dial)
            .field("disable_nagle", &self.disable_nagle)
            .field("hex_logging", &self.hex_logging)
            .field("race_window", &self.race_window)
            .field("connect_timeout", &self.connect_timeout)
            .field("broadcast_failure", &self.broadcast_failure)
            .finish_non_exhaustive()
    }
}

/// What a relayed session transferred.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    /// Candidate that won the race.
    pub winner: SocketAddr,
    /// Bytes delivered to the winner, first payload included.
    pub sent_bytes: u64,
    /// Bytes delivered to the client, replayed first response included.
    pub received_bytes: u64,
}

/// One client connection from accept to close.
pub struct ProxySession<C> {
    client: C,
    local_addr: SocketAddr,
    candidates: Vec<SocketAddr>,
    config: SessionConfig,
    counters: Arc<ByteCounters>,
    state: SessionState,
}

impl<C> ProxySession<C>
where
    C: RelayStream + 'static,
{
    /// Take ownership of an accepted client connection.
    ///
    /// `local_addr` is only used in diagnostics.
    pub fn new(
        client: C,
        local_addr: SocketAddr,
        candidates: Vec<SocketAddr>,
        config: SessionConfig,
    ) -> Self {
        Self {
            client,
            local_addr,
            candidates,
            config,
            counters: Arc::new(ByteCounters::new()),
            state: SessionState::Created,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Run the session to completion.
    pub async fn run(mut self) -> Result<SessionSummary, SessionError> {
        let log = Arc::clone(&self.config.logger);

        if self.config.disable_nagle {
            if let Err(e) = self.client.set_nodelay(true) {
                log.debug(format_args!("Failed to disable Nagle on client: {}", e));
            }
        }
        log.info(format_args!(
            "Opened {} >>> {} candidate(s)",
            self.local_addr,
            self.candidates.len()
        ));

        self.transition(SessionState::Racing);
        let first_payload = match self.read_first_payload().await {
            Ok(payload) => payload,
            Err(e) => {
                match &e {
                    SessionError::InitialRead(source) => {
                        log.warn(format_args!("Read failed '{}'", source));
                    }
                    other => log.debug(format_args!("{}", other)),
                }
                self.abort().await;
                return Err(e);
            }
        };

        let racer = ConnectionRacer::new(
            CandidateDialer::new(
                self.config.dial.clone(),
                self.config.disable_nagle,
                self.config.connect_timeout,
                Arc::clone(&log),
            ),
            self.config.race_window,
            self.config.broadcast_failure,
            Arc::clone(&log),
        );
        let winner = match racer.race(&first_payload, &self.candidates).await {
            Ok(winner) => winner,
            Err(e) => {
                log.warn(format_args!("Session aborted: {}", e));
                self.abort().await;
                return Err(e.into());
            }
        };

        let (winner_addr, backend, first_response) = winner.into_parts();
        self.counters
            .add(Direction::ClientToBackend, first_payload.len() as u64);

        self.transition(SessionState::Relaying);
        let engine = RelayEngine::new(
            self.config.hex_logging,
            Arc::clone(&self.counters),
            Arc::clone(&log),
        );
        engine.run(self.client, backend, &first_response).await;

        advance(&mut self.state, SessionState::Closed, log.as_ref());
        report_closed(log.as_ref(), &self.counters);

        Ok(SessionSummary {
            winner: winner_addr,
            sent_bytes: self.counters.sent(),
            received_bytes: self.counters.received(),
        })
    }

    /// Read exactly one payload from the client.
    async fn read_first_payload(&mut self) -> Result<Vec<u8>, SessionError> {
        let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
        match self.client.read(&mut buf).await {
            Ok(0) => Err(SessionError::ClientClosed),
            Ok(n) => {
                buf.truncate(n);
                Ok(buf)
            }
            Err(e) => Err(SessionError::InitialRead(e)),
        }
    }

    async fn abort(&mut self) {
        let _ = self.client.shutdown().await;
        self.transition(SessionState::Closed);
        report_closed(self.config.logger.as_ref(), &self.counters);
    }

    fn transition(&mut self, next: SessionState) {
        advance(&mut self.state, next, self.config.logger.as_ref());
    }
}

fn advance(state: &mut SessionState, next: SessionState, log: &dyn Logger) {
    debug_assert!(next > *state, "{:?} -> {:?}", state, next);
    log.trace(format_args!("Session {:?} -> {:?}", state, next));
    *state = next;
}

fn report_closed(log: &dyn Logger, counters: &ByteCounters) {
    log.info(format_args!(
        "Closed ({} bytes sent, {} bytes received)",
        counters.sent(),
        counters.received()
    ));
}
