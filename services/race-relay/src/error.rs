//! Error taxonomy for the relay.
//!
//! Every failure is handled inside the session that produced it; nothing here
//! is ever propagated to another session.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

/// Failure to establish one candidate connection.
///
/// A dial error eliminates the candidate from the race. It only becomes
/// session-fatal when every candidate fails.
#[derive(Debug, Error)]
pub enum DialError {
    /// TCP connect failed.
    #[error("connect to {target} failed: {source}")]
    Connect {
        target: String,
        #[source]
        source: io::Error,
    },

    /// TCP connect did not finish within the configured timeout.
    #[error("connect to {target} timed out after {timeout:?}")]
    Timeout { target: String, timeout: Duration },

    /// The TLS handshake with the unwrap target failed.
    #[error("tls handshake with {target} failed: {source}")]
    Tls {
        target: String,
        #[source]
        source: io::Error,
    },
}

/// Race-level failures.
#[derive(Debug, Error)]
pub enum RaceError {
    /// All candidates failed to dial or none answered within the race window.
    #[error("no viable candidate among {candidates} address(es)")]
    NoViableCandidate { candidates: usize },

    /// Writing the client's first payload to a candidate failed.
    #[error("write of first payload to {addr} failed: {source}")]
    Broadcast {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
}

/// Reasons a session ended before reaching the relay phase.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Client closed the connection before sending anything.
    #[error("client closed before sending its first payload")]
    ClientClosed,

    /// Reading the client's first payload failed.
    #[error("initial read failed: {0}")]
    InitialRead(#[source] io::Error),

    /// The candidate race failed.
    #[error(transparent)]
    Race(#[from] RaceError),
}

impl SessionError {
    /// Short reason code used in listener logs.
    pub fn reason_code(&self) -> &'static str {
        match self {
            SessionError::ClientClosed => "client_closed",
            SessionError::InitialRead(_) => "initial_read_failed",
            SessionError::Race(RaceError::NoViableCandidate { .. }) => "no_viable_candidate",
            SessionError::Race(RaceError::Broadcast { .. }) => "broadcast_failed",
        }
    }
}

/// Whether an I/O error is an ordinary end-of-stream rather than a fault.
///
/// Peers that have already closed surface as resets or broken pipes on the
/// opposite leg.
pub fn is_clean_close(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
    )
}
