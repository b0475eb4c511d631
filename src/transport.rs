//! The secure-transport capability consumed by discovery and the tunnel
//! registry.

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::Result;

/// A bidirectional byte stream multiplexed over the transport.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

pub type ByteStream = Box<dyn AsyncStream>;

/// One authenticated connection to a remote host.
///
/// Every `open_*` call yields an independent stream and must be safe to call
/// concurrently.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Dial a Unix socket on the remote host (e.g. the Docker daemon socket).
    async fn open_socket(&self, path: &str) -> Result<ByteStream>;

    /// Dial a TCP port on the remote host.
    async fn open_tcp(&self, host: &str, port: u16) -> Result<ByteStream>;

    /// Run a one-off remote command and collect its output. Not used by the
    /// forwarding engine itself; kept so callers can run ad-hoc commands over
    /// the same authenticated connection.
    async fn exec(&self, command: &str) -> Result<String>;

    async fn close(&self) -> Result<()>;

    fn is_closed(&self) -> bool;
}
