//! Candidate racing.
//!
//! The client's first payload is sent to every candidate that could be
//! dialed, each candidate gets one read within a shared race window, and the
//! first candidate in address order that answered wins. Every other
//! connection is closed once the winner is known.

use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::{sleep_until, timeout_at, Instant};

use super::dialer::CandidateDialer;
use super::log::Logger;
use super::stream::BoxedStream;
use crate::error::RaceError;

/// Default race window (how long every candidate gets to answer).
pub const DEFAULT_RACE_WINDOW: Duration = Duration::from_secs(1);

/// Maximum size of a candidate's buffered first response.
pub const FIRST_RESPONSE_BUFFER: usize = 64 * 1024;

/// What happens when the first payload cannot be written to a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BroadcastFailurePolicy {
    /// Abort the whole session. The client's first payload has already been
    /// consumed and cannot be replayed.
    #[default]
    AbortSession,
    /// Drop only the failing candidate and keep racing the rest.
    DropCandidate,
}

impl FromStr for BroadcastFailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "abort" | "abort_session" => Ok(Self::AbortSession),
            "drop" | "drop_candidate" => Ok(Self::DropCandidate),
            other => Err(format!("unknown broadcast failure policy: {other}")),
        }
    }
}

/// Race outcome of a single candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Pending,
    Succeeded,
    Failed,
}

/// One outbound attempt taking part in a race.
pub struct CandidateConnection {
    remote_addr: SocketAddr,
    stream: BoxedStream,
    first_response: Vec<u8>,
    outcome: Outcome,
}

impl CandidateConnection {
    /// Wrap a dialed connection. The outcome starts as pending.
    pub fn new(remote_addr: SocketAddr, stream: BoxedStream) -> Self {
        Self {
            remote_addr,
            stream,
            first_response: Vec::new(),
            outcome: Outcome::Pending,
        }
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn outcome(&self) -> Outcome {
        self.outcome
    }

    /// Bytes read back from this candidate during the race.
    pub fn first_response(&self) -> &[u8] {
        &self.first_response
    }

    /// Hand the connection over to the relay.
    pub fn into_parts(self) -> (SocketAddr, BoxedStream, Vec<u8>) {
        (self.remote_addr, self.stream, self.first_response)
    }

    fn resolve(&mut self, outcome: Outcome, first_response: Vec<u8>) {
        debug_assert_eq!(self.outcome, Outcome::Pending, "outcome resolved twice");
        self.outcome = outcome;
        self.first_response = first_response;
    }

    async fn close(mut self) {
        let _ = self.stream.shutdown().await;
    }
}

/// Dials all candidates, broadcasts the first payload and picks a winner.
pub struct ConnectionRacer {
    dialer: CandidateDialer,
    race_window: Duration,
    broadcast_failure: BroadcastFailurePolicy,
    log: Arc<dyn Logger>,
}

impl ConnectionRacer {
    pub fn new(
        dialer: CandidateDialer,
        race_window: Duration,
        broadcast_failure: BroadcastFailurePolicy,
        log: Arc<dyn Logger>,
    ) -> Self {
        Self {
            dialer,
            race_window,
            broadcast_failure,
            log,
        }
    }

    /// Race `first_payload` across `addrs` and return the winning candidate.
    pub async fn race(
        &self,
        first_payload: &[u8],
        addrs: &[SocketAddr],
    ) -> Result<CandidateConnection, RaceError> {
        let candidates = self.dial_all(addrs).await;
        self.race_dialed(first_payload, candidates, addrs.len())
            .await
    }

    /// Dial every address concurrently, keeping address order.
    async fn dial_all(&self, addrs: &[SocketAddr]) -> Vec<CandidateConnection> {
        let dials = addrs.iter().map(|&addr| async move {
            self.dialer
                .dial(addr)
                .await
                .ok()
                .map(|stream| CandidateConnection::new(addr, stream))
        });

        join_all(dials).await.into_iter().flatten().collect()
    }

    pub(crate) async fn race_dialed(
        &self,
        first_payload: &[u8],
        candidates: Vec<CandidateConnection>,
        attempted: usize,
    ) -> Result<CandidateConnection, RaceError> {
        let candidates = self.broadcast(first_payload, candidates).await?;
        if candidates.is_empty() {
            return Err(RaceError::NoViableCandidate {
                candidates: attempted,
            });
        }

        // All candidates share one deadline so the wait lasts exactly one window.
        let deadline = Instant::now() + self.race_window;
        let evaluated = join_all(
            candidates
                .into_iter()
                .map(|candidate| self.await_first_response(candidate, deadline)),
        )
        .await;
        self.log.debug(format_args!("Race window elapsed"));

        self.select_winner(evaluated)
            .await
            .ok_or(RaceError::NoViableCandidate {
                candidates: attempted,
            })
    }

    /// Write the first payload to every candidate in address order.
    async fn broadcast(
        &self,
        first_payload: &[u8],
        candidates: Vec<CandidateConnection>,
    ) -> Result<Vec<CandidateConnection>, RaceError> {
        let mut kept = Vec::with_capacity(candidates.len());

        for mut candidate in candidates {
            let addr = candidate.remote_addr;
            let written = async {
                candidate.stream.write_all(first_payload).await?;
                candidate.stream.flush().await
            }
            .await;

            match written {
                Ok(()) => {
                    self.log.info(format_args!(
                        "Sent {} bytes to {}",
                        first_payload.len(),
                        addr
                    ));
                    kept.push(candidate);
                }
                Err(source) => {
                    self.log
                        .warn(format_args!("Write to {} failed: {}", addr, source));
                    match self.broadcast_failure {
                        BroadcastFailurePolicy::AbortSession => {
                            return Err(RaceError::Broadcast { addr, source });
                        }
                        BroadcastFailurePolicy::DropCandidate => {
                            candidate.close().await;
                        }
                    }
                }
            }
        }

        Ok(kept)
    }

    /// Give one candidate a single read before `deadline`, then wait out the
    /// rest of the window.
    ///
    /// The timeout around the read is the only place the outcome is decided,
    /// so a late answer can never flip a candidate after it was judged.
    async fn await_first_response(
        &self,
        mut candidate: CandidateConnection,
        deadline: Instant,
    ) -> CandidateConnection {
        let addr = candidate.remote_addr;
        self.log
            .info(format_args!("Reading response from {}", addr));

        let mut buf = vec![0u8; FIRST_RESPONSE_BUFFER];
        let (outcome, response) = match timeout_at(deadline, candidate.stream.read(&mut buf)).await
        {
            Ok(Ok(0)) => {
                self.log
                    .info(format_args!("{} closed before answering", addr));
                (Outcome::Failed, Vec::new())
            }
            Ok(Ok(n)) => {
                self.log
                    .info(format_args!("Read {} bytes from {}", n, addr));
                buf.truncate(n);
                (Outcome::Succeeded, buf)
            }
            Ok(Err(e)) => {
                self.log
                    .warn(format_args!("Read from {} failed: {}", addr, e));
                (Outcome::Failed, Vec::new())
            }
            Err(_) => {
                self.log
                    .debug(format_args!("No response from {} within race window", addr));
                (Outcome::Failed, Vec::new())
            }
        };

        sleep_until(deadline).await;
        candidate.resolve(outcome, response);
        candidate
    }

    /// Keep the first succeeded candidate in address order, close the rest.
    async fn select_winner(
        &self,
        evaluated: Vec<CandidateConnection>,
    ) -> Option<CandidateConnection> {
        let mut winner: Option<CandidateConnection> = None;
        let mut losers = Vec::with_capacity(evaluated.len());

        for candidate in evaluated {
            let addr = candidate.remote_addr;
            match candidate.outcome {
                Outcome::Succeeded if winner.is_none() => {
                    self.log
                        .info(format_args!("Connection to {} succeeded, keeping", addr));
                    winner = Some(candidate);
                }
                Outcome::Succeeded => {
                    self.log.warn(format_args!(
                        "Multiple candidates answered, dropping connection to {}",
                        addr
                    ));
                    losers.push(candidate);
                }
                Outcome::Failed | Outcome::Pending => {
                    self.log
                        .info(format_args!("Connection to {} failed, dropping", addr));
                    losers.push(candidate);
                }
            }
        }

        // Losers close concurrently; a stalled peer does not delay the winner.
        join_all(losers.into_iter().map(CandidateConnection::close)).await;
        winner
    }
}
