//! Outbound connections to candidate backends.
//!
//! A candidate is dialed either as plain TCP or, when a TLS-unwrap target is
//! configured, by opening a TLS session to that target and handing the
//! decrypted stream to the relay. In the TLS case the candidate address is
//! only a label.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::ServerName;
use rustls::ClientConfig;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;

use super::log::Logger;
use super::stream::{BoxedStream, RelayStream};
use crate::error::DialError;

/// Default connect timeout for candidate connections.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// TLS target used in place of every candidate address.
#[derive(Clone)]
pub struct TlsUnwrap {
    target: String,
    server_name: ServerName<'static>,
    connector: TlsConnector,
}

impl TlsUnwrap {
    /// Create a TLS-unwrap target.
    ///
    /// `target` is a `host:port` string resolved at dial time.
    pub fn new(
        target: impl Into<String>,
        server_name: ServerName<'static>,
        config: Arc<ClientConfig>,
    ) -> Self {
        Self {
            target: target.into(),
            server_name,
            connector: TlsConnector::from(config),
        }
    }

    /// The `host:port` this target dials.
    pub fn target(&self) -> &str {
        &self.target
    }
}

impl fmt::Debug for TlsUnwrap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsUnwrap")
            .field("target", &self.target)
            .field("server_name", &self.server_name)
            .finish_non_exhaustive()
    }
}

/// How candidates are reached.
#[derive(Debug, Clone, Default)]
pub enum DialStrategy {
    /// Dial each candidate address as plain TCP.
    #[default]
    Plain,
    /// Dial the TLS target for every candidate and unwrap it.
    TlsUnwrap(TlsUnwrap),
}

/// Establishes one outbound connection per candidate.
pub struct CandidateDialer {
    strategy: DialStrategy,
    disable_nagle: bool,
    connect_timeout: Duration,
    log: Arc<dyn Logger>,
}

impl CandidateDialer {
    pub fn new(
        strategy: DialStrategy,
        disable_nagle: bool,
        connect_timeout: Duration,
        log: Arc<dyn Logger>,
    ) -> Self {
        Self {
            strategy,
            disable_nagle,
            connect_timeout,
            log,
        }
    }

    /// Dial one candidate.
    ///
    /// Failures are logged at warning level; the caller drops the candidate.
    pub async fn dial(&self, addr: SocketAddr) -> Result<BoxedStream, DialError> {
        // The timeout bounds the whole dial, TLS handshake included.
        let connected = match timeout(self.connect_timeout, self.connect(addr)).await {
            Ok(result) => result,
            Err(_) => Err(DialError::Timeout {
                target: self.target_of(addr),
                timeout: self.connect_timeout,
            }),
        };

        match connected {
            Ok(stream) => {
                self.log
                    .info(format_args!("Opened candidate connection {}", addr));
                if self.disable_nagle {
                    if let Err(e) = stream.set_nodelay(true) {
                        self.log.debug(format_args!(
                            "Failed to disable Nagle on {}: {}",
                            addr, e
                        ));
                    }
                }
                Ok(stream)
            }
            Err(e) => {
                self.log
                    .warn(format_args!("Remote connection to {} failed: {}", addr, e));
                Err(e)
            }
        }
    }

    fn target_of(&self, addr: SocketAddr) -> String {
        match &self.strategy {
            DialStrategy::Plain => addr.to_string(),
            DialStrategy::TlsUnwrap(tls) => tls.target.clone(),
        }
    }

    async fn connect(&self, addr: SocketAddr) -> Result<BoxedStream, DialError> {
        match &self.strategy {
            DialStrategy::Plain => {
                let stream = connect_tcp(addr, addr.to_string()).await?;
                Ok(Box::new(stream))
            }
            DialStrategy::TlsUnwrap(tls) => {
                let tcp = connect_tcp(tls.target.as_str(), tls.target.clone()).await?;
                let stream = tls
                    .connector
                    .connect(tls.server_name.clone(), tcp)
                    .await
                    .map_err(|source| DialError::Tls {
                        target: tls.target.clone(),
                        source,
                    })?;
                Ok(Box::new(stream))
            }
        }
    }

}

async fn connect_tcp<A>(addr: A, target: String) -> Result<TcpStream, DialError>
where
    A: tokio::net::ToSocketAddrs,
{
    TcpStream::connect(addr)
        .await
        .map_err(|source| DialError::Connect { target, source })
}
