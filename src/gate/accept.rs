//! Accept-time filtering of transport connections.
//!
//! Exactly one place checks the peer against the edge allowlist, chosen by
//! [`FilterStrategy`]:
//!
//! | Strategy | Disallowed peer sees |
//! |---|---|
//! | `handshake` | TLS alert, identical to a wrong SNI |
//! | `close` | TCP connection closed before any TLS byte |
//! | `decoy` | connection held open, nothing ever answered |
//!
//! With `handshake` the filter admits everything and hands its [`IpGate`] to the
//! certificate selector instead.
//!
//! [`AcceptFilter::admit`] runs inside each connection's own task, so a
//! refresh-on-miss for one peer never holds up the accept loop.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::trace;

use crate::config::FilterStrategy;
use crate::gate::IpGate;

/// Decides, per accepted connection, whether it may proceed to TLS.
#[derive(Debug, Clone)]
pub struct AcceptFilter {
    ip_gate: Option<IpGate>,
    strategy: FilterStrategy,
}

impl AcceptFilter {
    /// A filter applying `strategy` with `ip_gate`; `None` disables filtering.
    pub fn new(ip_gate: Option<IpGate>, strategy: FilterStrategy) -> Self {
        Self { ip_gate, strategy }
    }

    /// A filter that admits every connection.
    pub fn open() -> Self {
        Self::new(None, FilterStrategy::Handshake)
    }

    /// The configured strategy.
    pub fn strategy(&self) -> FilterStrategy {
        self.strategy
    }

    /// The gate the certificate selector must consult, if any.
    ///
    /// Only the in-handshake strategy delegates the check; the others have
    /// already filtered at accept time.
    pub fn handshake_gate(&self) -> Option<IpGate> {
        match self.strategy {
            FilterStrategy::Handshake => self.ip_gate.clone(),
            FilterStrategy::Close | FilterStrategy::Decoy => None,
        }
    }

    /// Admit, decoy, or close a freshly accepted connection.
    ///
    /// `None` means the connection was dropped, which closes it.
    pub async fn admit<S>(&self, stream: S, peer: SocketAddr) -> Option<GatedStream<S>> {
        let gate = match (&self.ip_gate, self.strategy) {
            (Some(gate), FilterStrategy::Close | FilterStrategy::Decoy) => gate,
            _ => return Some(GatedStream::Open(stream)),
        };

        if gate.is_allowed(peer).await {
            return Some(GatedStream::Open(stream));
        }

        trace!(strategy = ?self.strategy, "Connection refused at accept");
        match self.strategy {
            FilterStrategy::Decoy => Some(GatedStream::Decoy(DecoyStream::new(stream))),
            FilterStrategy::Close | FilterStrategy::Handshake => None,
        }
    }
}

/// An admitted connection, or a decoy.
#[derive(Debug)]
pub enum GatedStream<S> {
    /// Allowed peer; bytes flow normally
    Open(S),
    /// Disallowed peer under the decoy strategy
    Decoy(DecoyStream<S>),
}

impl<S> GatedStream<S> {
    /// Whether this connection is a decoy.
    pub fn is_decoy(&self) -> bool {
        matches!(self, Self::Decoy(_))
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for GatedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Open(s) => Pin::new(s).poll_read(cx, buf),
            Self::Decoy(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for GatedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Open(s) => Pin::new(s).poll_write(cx, buf),
            Self::Decoy(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Open(s) => Pin::new(s).poll_flush(cx),
            Self::Decoy(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Open(s) => Pin::new(s).poll_shutdown(cx),
            Self::Decoy(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// Holds the socket open but fails every read and write. Shutdown is a no-op.
#[derive(Debug)]
pub struct DecoyStream<S> {
    _socket: S,
}

impl<S> DecoyStream<S> {
    fn new(socket: S) -> Self {
        Self { _socket: socket }
    }

    /// Keep the socket open for `duration`, then drop it.
    pub async fn hold(self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

fn not_allowed() -> io::Error {
    io::Error::new(io::ErrorKind::PermissionDenied, "not an allowed origin")
}

impl<S> AsyncRead for DecoyStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Poll::Ready(Err(not_allowed()))
    }
}

impl<S> AsyncWrite for DecoyStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Poll::Ready(Err(not_allowed()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Err(not_allowed()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
