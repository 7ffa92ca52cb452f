//! Async stream abstraction for tokio.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

#[cfg(feature = "tokio-tls")]
use tokio_native_tls::TlsStream;

use crate::error::{Error, Result};
use crate::protocol::frame::FrameReader;

/// Bytes requested from the socket per read.
const READ_CHUNK: usize = 16 * 1024;

pub enum Stream {
    Tcp(TcpStream),
    #[cfg(feature = "tokio-tls")]
    Tls(Box<TlsStream<TcpStream>>),
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stream::Tcp(_) => f.write_str("Stream::Tcp"),
            #[cfg(feature = "tokio-tls")]
            Stream::Tls(_) => f.write_str("Stream::Tls"),
        }
    }
}

impl Stream {
    pub fn tcp(stream: TcpStream) -> Self {
        Self::Tcp(stream)
    }

    /// Read one raw byte (the answer to an SSL request).
    pub async fn read_u8(&mut self) -> Result<u8> {
        let byte = match self {
            Stream::Tcp(s) => s.read_u8().await?,
            #[cfg(feature = "tokio-tls")]
            Stream::Tls(s) => s.read_u8().await?,
        };
        Ok(byte)
    }

    /// Read whatever the socket has into `reader`.
    ///
    /// End of stream is reported as an `UnexpectedEof` I/O error.
    pub async fn read_into(&mut self, reader: &mut FrameReader) -> Result<()> {
        let spare = reader.spare(READ_CHUNK);
        let read = match self {
            Stream::Tcp(s) => s.read(spare).await,
            #[cfg(feature = "tokio-tls")]
            Stream::Tls(s) => s.read(spare).await,
        };
        let n = match read {
            Ok(n) => n,
            Err(e) => {
                reader.commit(READ_CHUNK, 0);
                return Err(e.into());
            }
        };
        reader.commit(READ_CHUNK, n);
        if n == 0 {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed by server",
            )));
        }
        tracing::trace!(bytes = n, "read");
        Ok(())
    }

    pub async fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        match self {
            Stream::Tcp(s) => s.write_all(buf).await,
            #[cfg(feature = "tokio-tls")]
            Stream::Tls(s) => s.write_all(buf).await,
        }
    }

    pub async fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Stream::Tcp(s) => s.flush().await,
            #[cfg(feature = "tokio-tls")]
            Stream::Tls(s) => s.flush().await,
        }
    }

    pub async fn shutdown(&mut self) -> std::io::Result<()> {
        match self {
            Stream::Tcp(s) => s.shutdown().await,
            #[cfg(feature = "tokio-tls")]
            Stream::Tls(s) => s.shutdown().await,
        }
    }

    /// Run the TLS handshake over the plain TCP stream, trusting only the
    /// root certificate in the PEM file at `root_cert`.
    #[cfg(feature = "tokio-tls")]
    pub async fn upgrade_to_tls(self, host: &str, root_cert: &std::path::Path) -> Result<Self> {
        let tcp = match self {
            Stream::Tcp(tcp) => tcp,
            Stream::Tls(_) => {
                return Err(Error::InvalidUsage("stream is already encrypted".into()));
            }
        };

        let pem = tokio::fs::read(root_cert).await?;
        let cert = native_tls::Certificate::from_pem(&pem)?;
        let connector = native_tls::TlsConnector::builder()
            .add_root_certificate(cert)
            .build()?;
        let connector = tokio_native_tls::TlsConnector::from(connector);
        let tls = connector.connect(host, tcp).await?;
        Ok(Stream::Tls(Box::new(tls)))
    }
}
