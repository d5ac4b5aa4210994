//! TCP listener and connection handling.
//!
//! Accepts client connections, enforces the concurrent session limit and
//! runs one `ProxySession` per client. Failures stay inside their session.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn, Instrument};

use super::session::{ProxySession, SessionConfig};

/// Default maximum concurrent connections per listener.
pub const DEFAULT_MAX_CONNECTIONS: usize = 10000;

/// Configuration for a listener.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Candidate backends raced for every client, in priority order.
    pub candidates: Vec<SocketAddr>,
    /// Settings handed to every session.
    pub session: SessionConfig,
}

impl ListenerConfig {
    /// Create a new listener configuration.
    pub fn new(bind_addr: SocketAddr, candidates: Vec<SocketAddr>) -> Self {
        Self {
            bind_addr,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            candidates,
            session: SessionConfig::default(),
        }
    }
}

/// Statistics for a listener.
#[derive(Debug, Default)]
pub struct ListenerStats {
    /// Total connections accepted.
    pub connections_accepted: AtomicU64,
    /// Total connections currently active.
    pub connections_active: AtomicU64,
    /// Total connections closed.
    pub connections_closed: AtomicU64,
    /// Connections rejected due to max limit.
    pub connections_rejected: AtomicU64,
    /// Sessions that reached the relay phase.
    pub sessions_relayed: AtomicU64,
    /// Sessions aborted before relaying.
    pub sessions_aborted: AtomicU64,
    /// Bytes proxied to backends.
    pub bytes_to_backend: AtomicU64,
    /// Bytes proxied from backends.
    pub bytes_from_backend: AtomicU64,
}

/// A TCP listener for the racing relay.
pub struct Listener {
    /// Listener configuration.
    config: ListenerConfig,
    /// The TCP listener.
    listener: TcpListener,
    /// Connection semaphore for limiting concurrent connections.
    conn_semaphore: Arc<Semaphore>,
    /// Statistics.
    stats: Arc<ListenerStats>,
}

impl Listener {
    /// Create a new listener.
    pub async fn bind(config: ListenerConfig) -> io::Result<Self> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        let local_addr = listener.local_addr()?;

        info!(
            bind_addr = %local_addr,
            max_connections = config.max_connections,
            candidate_count = config.candidates.len(),
            "Listener bound"
        );

        Ok(Self {
            conn_semaphore: Arc::new(Semaphore::new(config.max_connections)),
            listener,
            config,
            stats: Arc::new(ListenerStats::default()),
        })
    }

    /// Get the local address this listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Shared handle to the listener statistics.
    pub fn stats_handle(&self) -> Arc<ListenerStats> {
        Arc::clone(&self.stats)
    }

    /// Run the listener, accepting and handling connections.
    pub async fn run(self: Arc<Self>) -> io::Result<()> {
        let local_addr = self.listener.local_addr()?;
        info!(bind_addr = %local_addr, "Listener started");

        loop {
            match self.listener.accept().await {
                Ok((stream, peer_addr)) => {
                    // Try to acquire a permit
                    let permit = match self.conn_semaphore.clone().try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => {
                            self.stats
                                .connections_rejected
                                .fetch_add(1, Ordering::Relaxed);
                            warn!(peer_addr = %peer_addr, "Connection rejected: max connections reached");
                            continue;
                        }
                    };

                    self.stats
                        .connections_accepted
                        .fetch_add(1, Ordering::Relaxed);
                    self.stats
                        .connections_active
                        .fetch_add(1, Ordering::Relaxed);

                    let listener = Arc::clone(&self);
                    let stats = Arc::clone(&self.stats);

                    tokio::spawn(
                        async move {
                            listener.handle_connection(stream, peer_addr).await;

                            stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                            stats.connections_closed.fetch_add(1, Ordering::Relaxed);
                            drop(permit);
                        }
                        .instrument(tracing::info_span!("connection", peer = %peer_addr)),
                    );
                }
                Err(e) => {
                    error!(error = %e, "Accept error");
                    // Brief sleep to avoid tight loop on persistent errors
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    /// Handle a single connection.
    async fn handle_connection(&self, client: TcpStream, peer_addr: SocketAddr) {
        let local_addr = match client.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                debug!(peer_addr = %peer_addr, error = %e, "Connection error");
                return;
            }
        };
        debug!(peer_addr = %peer_addr, local_addr = %local_addr, "Handling connection");

        let session = ProxySession::new(
            client,
            local_addr,
            self.config.candidates.clone(),
            self.config.session.clone(),
        );

        match session.run().await {
            Ok(summary) => {
                self.stats
                    .bytes_to_backend
                    .fetch_add(summary.sent_bytes, Ordering::Relaxed);
                self.stats
                    .bytes_from_backend
                    .fetch_add(summary.received_bytes, Ordering::Relaxed);
                // Published last so readers of the session count see the bytes.
                self.stats.sessions_relayed.fetch_add(1, Ordering::Release);

                debug!(
                    winner = %summary.winner,
                    bytes_to_backend = summary.sent_bytes,
                    bytes_from_backend = summary.received_bytes,
                    "Connection closed"
                );
            }
            Err(e) => {
                self.stats.sessions_aborted.fetch_add(1, Ordering::Relaxed);
                debug!(
                    peer_addr = %peer_addr,
                    reason = e.reason_code(),
                    error = %e,
                    "Session aborted"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listener_config_default() {
        let config = ListenerConfig::new(
            "127.0.0.1:5433".parse().unwrap(),
            vec!["127.0.0.1:5432".parse().unwrap()],
        );
        assert_eq!(config.max_connections, DEFAULT_MAX_CONNECTIONS);
        assert_eq!(config.candidates.len(), 1);
    }

    #[tokio::test]
    async fn test_client_hanging_up_counts_as_aborted() {
        let config = ListenerConfig::new(
            "127.0.0.1:0".parse().unwrap(),
            vec!["127.0.0.1:9".parse().unwrap()],
        );
        let listener = Arc::new(Listener::bind(config).await.unwrap());
        let addr = listener.local_addr().unwrap();
        let stats = listener.stats_handle();
        tokio::spawn(listener.run());

        drop(TcpStream::connect(addr).await.unwrap());

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while stats.connections_closed.load(Ordering::Relaxed) == 0
            && tokio::time::Instant::now() < deadline
        {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(stats.connections_accepted.load(Ordering::Relaxed), 1);
        assert_eq!(stats.connections_active.load(Ordering::Relaxed), 0);
        assert_eq!(stats.sessions_aborted.load(Ordering::Relaxed), 1);
        assert_eq!(stats.sessions_relayed.load(Ordering::Relaxed), 0);
    }
}
