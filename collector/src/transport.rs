use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

use crate::errors::{Error, Result};

pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(60);

/// Byte-exact, deadline-bounded reads and writes over one device connection.
///
/// Each connection owns its transport; nothing here is shared between sessions.
pub struct FrameTransport<S> {
    stream: S,
    io_timeout: Duration,
}

impl<S> FrameTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, io_timeout: Duration) -> Self {
        Self { stream, io_timeout }
    }

    /// Read exactly `n` bytes within the transport timeout.
    pub async fn read_exact(&mut self, n: usize) -> Result<Vec<u8>> {
        self.read_exact_within(n, self.io_timeout).await
    }

    /// Read exactly `n` bytes, waiting at most `limit`.
    pub async fn read_exact_within(&mut self, n: usize, limit: Duration) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; n];
        match timeout(limit, self.stream.read_exact(&mut buf)).await {
            Ok(Ok(_)) => Ok(buf),
            Ok(Err(e)) => Err(Error::Io(e)),
            Err(_) => Err(Error::Timeout(limit)),
        }
    }

    /// Write every byte of `bytes` and flush within the transport timeout.
    pub async fn write_exact(&mut self, bytes: &[u8]) -> Result<()> {
        let limit = self.io_timeout;
        let stream = &mut self.stream;
        let write = async move {
            stream.write_all(bytes).await?;
            stream.flush().await
        };
        match timeout(limit, write).await {
            Ok(result) => result.map_err(Error::Io),
            Err(_) => Err(Error::Timeout(limit)),
        }
    }

    pub async fn shutdown(&mut self) {
        // The peer may already be gone.
        let _ = self.stream.shutdown().await;
    }
}
