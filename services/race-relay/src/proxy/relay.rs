//! Full-duplex relay between the client and the winning candidate.
//!
//! The winner's buffered first response is replayed to the client, then two
//! copy tasks run until either leg fails. The first failure fires a
//! single-shot shutdown; the coordinator waits for it, tears down both tasks
//! and reports the byte counters.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Notify;

use super::log::{format_payload, Logger};
use crate::error::is_clean_close;

/// Per-iteration copy buffer size.
pub const RELAY_BUFFER_SIZE: usize = 64 * 1024;

/// Direction of a copy loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Client to backend ("sent").
    ClientToBackend,
    /// Backend to client ("received").
    BackendToClient,
}

/// Byte counters shared by the two copy tasks.
#[derive(Debug, Default)]
pub struct ByteCounters {
    sent: AtomicU64,
    received: AtomicU64,
}

impl ByteCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `n` bytes written in `direction`.
    pub fn add(&self, direction: Direction, n: u64) {
        match direction {
            Direction::ClientToBackend => self.sent.fetch_add(n, Ordering::Relaxed),
            Direction::BackendToClient => self.received.fetch_add(n, Ordering::Relaxed),
        };
    }

    /// Bytes written to the backend.
    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    /// Bytes written to the client.
    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }
}

/// Why a copy loop stopped.
#[derive(Debug)]
pub enum StopReason {
    /// The source reached end-of-stream.
    EndOfStream,
    /// Reading the source failed.
    Read(io::Error),
    /// Writing the destination failed.
    Write(io::Error),
}

/// Single-fire shutdown signal.
///
/// Only the first `trigger` closes the session, logs and notifies the
/// coordinator. Later calls are no-ops.
pub struct Shutdown {
    closed: AtomicBool,
    notify: Notify,
    log: Arc<dyn Logger>,
}

impl Shutdown {
    pub fn new(log: Arc<dyn Logger>) -> Self {
        Self {
            closed: AtomicBool::new(false),
            notify: Notify::new(),
            log,
        }
    }

    /// Close the session. Returns `true` only for the call that closed it.
    pub fn trigger(&self, direction: Direction, reason: &StopReason) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }

        match reason {
            StopReason::EndOfStream => {
                self.log
                    .debug(format_args!("{:?} reached end of stream", direction));
            }
            StopReason::Read(e) if is_clean_close(e) => {
                self.log.debug(format_args!("Read closed '{}'", e));
            }
            StopReason::Write(e) if is_clean_close(e) => {
                self.log.debug(format_args!("Write closed '{}'", e));
            }
            StopReason::Read(e) => self.log.warn(format_args!("Read failed '{}'", e)),
            StopReason::Write(e) => self.log.warn(format_args!("Write failed '{}'", e)),
        }

        // notify_one stores a permit, so a coordinator that has not started
        // waiting yet still wakes up.
        self.notify.notify_one();
        true
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Wait until the session has been closed.
    pub async fn wait(&self) {
        self.notify.notified().await;
    }
}

/// One direction of the relay.
struct Pipe {
    direction: Direction,
    hex_logging: bool,
    counters: Arc<ByteCounters>,
    shutdown: Arc<Shutdown>,
    log: Arc<dyn Logger>,
}

impl Pipe {
    async fn copy<R, W>(self, mut src: R, mut dst: W)
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let reason = self.copy_until_error(&mut src, &mut dst).await;
        self.shutdown.trigger(self.direction, &reason);
    }

    async fn copy_until_error<R, W>(&self, src: &mut R, dst: &mut W) -> StopReason
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
        loop {
            let n = match src.read(&mut buf).await {
                Ok(0) => return StopReason::EndOfStream,
                Ok(n) => n,
                Err(e) => return StopReason::Read(e),
            };
            let chunk = &buf[..n];

            match self.direction {
                Direction::ClientToBackend => {
                    self.log.debug(format_args!(">>> {} bytes sent", n));
                }
                Direction::BackendToClient => {
                    self.log.debug(format_args!("<<< {} bytes received", n));
                }
            }
            self.log
                .trace(format_args!("{}", format_payload(chunk, self.hex_logging)));

            let written = async {
                dst.write_all(chunk).await?;
                dst.flush().await
            }
            .await;
            if let Err(e) = written {
                return StopReason::Write(e);
            }
            self.counters.add(self.direction, n as u64);
        }
    }
}

/// Runs the steady-state relay for one session.
pub struct RelayEngine {
    hex_logging: bool,
    counters: Arc<ByteCounters>,
    log: Arc<dyn Logger>,
}

impl RelayEngine {
    pub fn new(hex_logging: bool, counters: Arc<ByteCounters>, log: Arc<dyn Logger>) -> Self {
        Self {
            hex_logging,
            counters,
            log,
        }
    }

    /// Replay `initial_backend_payload` to the client, then relay both
    /// directions until either leg fails.
    ///
    /// Both streams are dropped (closed) before this returns.
    pub async fn run<C, B>(&self, mut client: C, backend: B, initial_backend_payload: &[u8])
    where
        C: AsyncRead + AsyncWrite + Unpin + Send + 'static,
        B: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let shutdown = Arc::new(Shutdown::new(Arc::clone(&self.log)));

        self.log.info(format_args!(
            "Writing back {} bytes to client",
            initial_backend_payload.len()
        ));
        let replayed = async {
            client.write_all(initial_backend_payload).await?;
            client.flush().await
        }
        .await;
        if let Err(e) = replayed {
            shutdown.trigger(Direction::BackendToClient, &StopReason::Write(e));
            return;
        }
        self.counters
            .add(Direction::BackendToClient, initial_backend_payload.len() as u64);

        let (client_read, client_write) = tokio::io::split(client);
        let (backend_read, backend_write) = tokio::io::split(backend);

        let upstream = tokio::spawn(
            self.pipe(Direction::ClientToBackend, &shutdown)
                .copy(client_read, backend_write),
        );
        let downstream = tokio::spawn(
            self.pipe(Direction::BackendToClient, &shutdown)
                .copy(backend_read, client_write),
        );

        shutdown.wait().await;

        // The surviving direction may be parked on a read that never returns.
        upstream.abort();
        downstream.abort();
        let _ = upstream.await;
        let _ = downstream.await;
    }

    fn pipe(&self, direction: Direction, shutdown: &Arc<Shutdown>) -> Pipe {
        Pipe {
            direction,
            hex_logging: self.hex_logging,
            counters: Arc::clone(&self.counters),
            shutdown: Arc::clone(shutdown),
            log: Arc::clone(&self.log),
        }
    }
}
