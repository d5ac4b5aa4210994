pub mod config;
pub mod error;
pub mod proxy;

pub use error::{DialError, RaceError, SessionError};
pub use proxy::{
    BroadcastFailurePolicy, CandidateConnection, CandidateDialer, ConnectionRacer, DialStrategy,
    Listener, ListenerConfig, Logger, NullLogger, ProxySession, RelayEngine, RelayStream,
    SessionConfig, SessionSummary, TlsUnwrap, TracingLogger,
};
