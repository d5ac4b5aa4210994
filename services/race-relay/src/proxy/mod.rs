//! Racing TCP relay.
//!
//! This module provides:
//! - TCP listener management
//! - Candidate dialing (plain TCP or TLS-unwrapped)
//! - Racing the client's first payload across candidates
//! - Full-duplex relaying to the winner
//!
//! ## Architecture
//!
//! ```text
//! Client -> Listener -> ProxySession -> ConnectionRacer -> CandidateDialer -> Candidates
//!                            |                 |
//!                            |              winner
//!                            v                 v
//!                       RelayEngine <----------+
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use proxy::{Listener, ListenerConfig};
//!
//! let candidates = vec!["10.0.0.1:5432".parse()?, "10.0.0.2:5432".parse()?];
//! let config = ListenerConfig::new("127.0.0.1:5433".parse()?, candidates);
//! let listener = Arc::new(Listener::bind(config).await?);
//! listener.run().await?;
//! ```

mod dialer;
mod listener;
mod log;
mod racer;
mod relay;
mod session;
mod stream;

pub use dialer::{CandidateDialer, DialStrategy, TlsUnwrap, DEFAULT_CONNECT_TIMEOUT};
pub use listener::{Listener, ListenerConfig, ListenerStats, DEFAULT_MAX_CONNECTIONS};
pub use log::{format_payload, Logger, NullLogger, TracingLogger};
pub use racer::{
    BroadcastFailurePolicy, CandidateConnection, ConnectionRacer, Outcome, DEFAULT_RACE_WINDOW,
    FIRST_RESPONSE_BUFFER,
};
pub use relay::{ByteCounters, Direction, RelayEngine, Shutdown, StopReason, RELAY_BUFFER_SIZE};
pub use session::{ProxySession, SessionConfig, SessionState, SessionSummary};
pub use stream::{BoxedStream, RelayStream};
