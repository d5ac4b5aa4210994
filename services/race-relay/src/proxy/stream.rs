//! Byte streams the relay can carry.

use std::io;

use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;

/// A duplex byte stream with an optional low-latency write policy.
pub trait RelayStream: AsyncRead + AsyncWrite + Unpin + Send {
    /// Disable write coalescing where the transport supports it.
    ///
    /// Streams without a socket underneath accept the call and do nothing.
    fn set_nodelay(&self, _nodelay: bool) -> io::Result<()> {
        Ok(())
    }
}

/// Owned, type-erased candidate connection.
pub type BoxedStream = Box<dyn RelayStream>;

impl RelayStream for TcpStream {
    fn set_nodelay(&self, nodelay: bool) -> io::Result<()> {
        TcpStream::set_nodelay(self, nodelay)
    }
}

impl RelayStream for TlsStream<TcpStream> {
    fn set_nodelay(&self, nodelay: bool) -> io::Result<()> {
        self.get_ref().0.set_nodelay(nodelay)
    }
}

impl RelayStream for DuplexStream {}

#[cfg(test)]
impl RelayStream for tokio_test::io::Mock {}
