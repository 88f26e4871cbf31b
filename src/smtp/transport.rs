//! The opaque duplex stream a [`crate::smtp::session::Session`] reads and
//! writes over. Wraps either a plain `TcpStream` or a TLS-wrapped one, and
//! provides the STARTTLS in-place upgrade (spec.md §9, "Transport
//! replacement on STARTTLS").

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;

/// A byte-duplex stream that may currently be plaintext or TLS. Never
/// retained across an upgrade: `upgrade_to_tls` consumes the plain variant
/// and returns a fresh value, matching spec.md's "owned opaque duplex
/// stream" model.
pub enum Transport {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl Transport {
    pub fn is_tls(&self) -> bool {
        matches!(self, Transport::Tls(_))
    }

    /// Performs the server-side TLS handshake over the current plain
    /// stream, returning a new `Transport::Tls` on success. The caller is
    /// responsible for having already sent the `220 Ready to start TLS`
    /// reply and for discarding any buffered-but-unread plaintext (spec.md
    /// §9: pipelining across STARTTLS is forbidden).
    pub async fn upgrade_to_tls(self, acceptor: &TlsAcceptor) -> io::Result<Transport> {
        let plain = match self {
            Transport::Plain(stream) => stream,
            Transport::Tls(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "transport is already TLS",
                ))
            }
        };
        let tls = acceptor.accept(plain).await?;
        Ok(Transport::Tls(Box::new(tls)))
    }
}

impl AsyncRead for Transport {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Transport::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Transport {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Transport::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Transport::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(s) => Pin::new(s).poll_flush(cx),
            Transport::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Transport::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Accepts a raw TCP connection, optionally wrapping it in TLS immediately
/// (implicit-TLS / "submissions" style listeners, spec.md §4.4).
pub async fn accept_transport(stream: TcpStream, implicit_tls: Option<&Arc<TlsAcceptor>>) -> io::Result<Transport> {
    match implicit_tls {
        Some(acceptor) => {
            let tls = acceptor.accept(stream).await?;
            Ok(Transport::Tls(Box::new(tls)))
        }
        None => Ok(Transport::Plain(stream)),
    }
}
