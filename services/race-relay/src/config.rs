//! Relay configuration.
//!
//! Everything is env-driven. Parsing goes through a lookup function so tests
//! never touch the process environment.

use std::fs::File;
use std::io::BufReader;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};

use crate::proxy::{
    BroadcastFailurePolicy, DialStrategy, ListenerConfig, Logger, SessionConfig, TlsUnwrap,
    DEFAULT_CONNECT_TIMEOUT, DEFAULT_MAX_CONNECTIONS, DEFAULT_RACE_WINDOW,
};

/// Relay configuration (env-driven).
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the relay listens on.
    pub listen_addr: SocketAddr,

    /// Candidate backends, in priority order.
    pub candidates: Vec<SocketAddr>,

    /// Optional TLS target dialed in place of every candidate.
    pub tls_unwrap_addr: Option<String>,

    /// Name used for SNI and certificate verification of the TLS target.
    pub tls_server_name: Option<String>,

    /// Extra PEM CA bundle trusted for the TLS target.
    pub tls_ca_file: Option<PathBuf>,

    /// Disable Nagle's algorithm on client and candidate sockets.
    pub disable_nagle: bool,

    /// Hex-encode relayed payloads in trace logs.
    pub hex_logging: bool,

    /// How long every candidate gets to answer.
    pub race_window: Duration,

    /// Per-candidate connect timeout.
    pub connect_timeout: Duration,

    /// What to do when the first payload cannot be written to a candidate.
    pub broadcast_failure: BroadcastFailurePolicy,

    /// Maximum concurrent sessions.
    pub max_connections: usize,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let listen_addr: SocketAddr = lookup("RELAY_LISTEN_ADDR")
            .unwrap_or_else(|| "127.0.0.1:5433".to_string())
            .parse()
            .context("RELAY_LISTEN_ADDR must be an ip:port socket address.")?;

        let candidates_raw = lookup("RELAY_CANDIDATES")
            .context("Missing candidate list. Set RELAY_CANDIDATES (comma-separated host:port).")?;
        let candidates = parse_candidates(&candidates_raw)?;

        let tls_unwrap_addr = lookup("RELAY_TLS_UNWRAP_ADDR").filter(|v| !v.is_empty());
        let tls_server_name = lookup("RELAY_TLS_SERVER_NAME").filter(|v| !v.is_empty());
        let tls_ca_file = lookup("RELAY_TLS_CA_FILE")
            .filter(|v| !v.is_empty())
            .map(PathBuf::from);

        let disable_nagle = lookup("RELAY_DISABLE_NAGLE")
            .map(|v| parse_flag(&v))
            .unwrap_or(false);

        let hex_logging = lookup("RELAY_HEX_LOG")
            .map(|v| parse_flag(&v))
            .unwrap_or(false);

        let race_window = lookup_millis(&lookup, "RELAY_RACE_WINDOW_MS")?
            .map(|ms| Duration::from_millis(ms.max(10)))
            .unwrap_or(DEFAULT_RACE_WINDOW);

        let connect_timeout = lookup_millis(&lookup, "RELAY_CONNECT_TIMEOUT_MS")?
            .map(|ms| Duration::from_millis(ms.max(10)))
            .unwrap_or(DEFAULT_CONNECT_TIMEOUT);

        let broadcast_failure = lookup("RELAY_BROADCAST_FAILURE")
            .map(|v| v.parse::<BroadcastFailurePolicy>())
            .transpose()
            .map_err(|e| anyhow!(e))
            .context("RELAY_BROADCAST_FAILURE must be `abort` or `drop`.")?
            .unwrap_or_default();

        let max_connections: usize = lookup("RELAY_MAX_CONNECTIONS")
            .map(|v| v.parse())
            .transpose()
            .context("RELAY_MAX_CONNECTIONS must be an integer.")?
            .unwrap_or(DEFAULT_MAX_CONNECTIONS)
            .max(1);

        let log_level = lookup("RELAY_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            listen_addr,
            candidates,
            tls_unwrap_addr,
            tls_server_name,
            tls_ca_file,
            disable_nagle,
            hex_logging,
            race_window,
            connect_timeout,
            broadcast_failure,
            max_connections,
            log_level,
        })
    }

    /// Build the dial strategy, loading TLS material when unwrapping.
    pub fn dial_strategy(&self) -> Result<DialStrategy> {
        let Some(target) = &self.tls_unwrap_addr else {
            return Ok(DialStrategy::Plain);
        };

        let name = match &self.tls_server_name {
            Some(name) => name.clone(),
            None => host_of(target).to_string(),
        };
        let server_name = ServerName::try_from(name.clone())
            .with_context(|| format!("invalid TLS server name: {name}"))?;
        let client_config = tls_client_config(self.tls_ca_file.as_deref())?;

        Ok(DialStrategy::TlsUnwrap(TlsUnwrap::new(
            target.clone(),
            server_name,
            client_config,
        )))
    }

    /// Build the listener configuration, injecting `logger` into sessions.
    pub fn listener_config(&self, logger: Arc<dyn Logger>) -> Result<ListenerConfig> {
        let mut listener = ListenerConfig::new(self.listen_addr, self.candidates.clone());
        listener.max_connections = self.max_connections;
        listener.session = SessionConfig {
            dial: self.dial_strategy()?,
            disable_nagle: self.disable_nagle,
            hex_logging: self.hex_logging,
            race_window: self.race_window,
            connect_timeout: self.connect_timeout,
            broadcast_failure: self.broadcast_failure,
            logger,
        };
        Ok(listener)
    }
}

fn parse_flag(value: &str) -> bool {
    value == "1" || value.eq_ignore_ascii_case("true")
}

fn lookup_millis<F>(lookup: &F, key: &str) -> Result<Option<u64>>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|v| v.parse::<u64>())
        .transpose()
        .with_context(|| format!("{key} must be an integer (milliseconds)."))
}

/// Resolve a comma-separated `host:port` list, keeping order.
fn parse_candidates(raw: &str) -> Result<Vec<SocketAddr>> {
    let mut candidates = Vec::new();
    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let addr = entry
            .to_socket_addrs()
            .with_context(|| format!("cannot resolve candidate {entry}"))?
            .next()
            .with_context(|| format!("candidate {entry} resolved to no addresses"))?;
        candidates.push(addr);
    }

    if candidates.is_empty() {
        bail!("RELAY_CANDIDATES must list at least one candidate.");
    }
    Ok(candidates)
}

/// Host part of a `host:port` string, with IPv6 brackets removed.
fn host_of(target: &str) -> &str {
    let host = target
        .rsplit_once(':')
        .map(|(host, _port)| host)
        .unwrap_or(target);
    host.trim_start_matches('[').trim_end_matches(']')
}

/// Client TLS config trusting the webpki roots plus an optional CA bundle.
pub fn tls_client_config(ca_file: Option<&Path>) -> Result<Arc<ClientConfig>> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    if let Some(path) = ca_file {
        let file =
            File::open(path).with_context(|| format!("cannot open CA file {}", path.display()))?;
        let mut reader = BufReader::new(file);
        for cert in rustls_pemfile::certs(&mut reader) {
            let cert =
                cert.with_context(|| format!("invalid certificate in {}", path.display()))?;
            roots
                .add(cert)
                .with_context(|| format!("rejected CA certificate from {}", path.display()))?;
        }
    }

    let config =
        ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
            .with_safe_default_protocol_versions()
            .context("TLS protocol versions unsupported by provider")?
            .with_root_certificates(roots)
            .with_no_client_auth();

    Ok(Arc::new(config))
}
