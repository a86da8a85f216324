//! Per-connection time bounds that hyper does not enforce itself.
//!
//! [`Activity`] counts requests in flight and remembers when the last one
//! started or finished. The connection task closes the connection once it has
//! been idle for `idle_timeout`. [`DeadlineIo`] fails a write that stalls for
//! `write_timeout`, and a read that stalls for `read_timeout` while a request
//! is being served. Reads between requests are left to the idle bound.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::{Instant, Sleep};

/// Request bookkeeping shared by a connection's service and its I/O.
#[derive(Debug)]
pub struct Activity {
    origin: Instant,
    /// Milliseconds after `origin` of the last request start or finish
    last_ms: AtomicU64,
    in_flight: AtomicUsize,
}

impl Activity {
    /// A connection that has just been established.
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            last_ms: AtomicU64::new(0),
            in_flight: AtomicUsize::new(0),
        }
    }

    /// Mark a request as started; it counts as in flight until the guard drops.
    pub fn begin(self: &Arc<Self>) -> RequestGuard {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        self.touch();
        RequestGuard(Arc::clone(self))
    }

    /// Whether any request is in flight.
    pub fn is_busy(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst) > 0
    }

    /// When the connection becomes idle for `idle`, or `None` while busy.
    pub fn idle_deadline(&self, idle: Duration) -> Option<Instant> {
        if self.is_busy() {
            return None;
        }
        let last = Duration::from_millis(self.last_ms.load(Ordering::SeqCst));
        Some(self.origin + last + idle)
    }

    fn touch(&self) {
        let ms = u64::try_from(self.origin.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.last_ms.store(ms, Ordering::SeqCst);
    }
}

impl Default for Activity {
    fn default() -> Self {
        Self::new()
    }
}

/// Keeps a request counted as in flight.
#[derive(Debug)]
pub struct RequestGuard(Arc<Activity>);

impl Drop for RequestGuard {
    fn drop(&mut self) {
        self.0.touch();
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// An I/O stream whose stalled reads and writes fail with `TimedOut`.
#[derive(Debug)]
pub struct DeadlineIo<S> {
    inner: S,
    activity: Arc<Activity>,
    read_timeout: Duration,
    write_timeout: Duration,
    read_deadline: Option<Pin<Box<Sleep>>>,
    write_deadline: Option<Pin<Box<Sleep>>>,
}

impl<S> DeadlineIo<S> {
    /// Wrap `inner`, consulting `activity` to tell serving from idling.
    pub fn new(
        inner: S,
        activity: Arc<Activity>,
        read_timeout: Duration,
        write_timeout: Duration,
    ) -> Self {
        Self {
            inner,
            activity,
            read_timeout,
            write_timeout,
            read_deadline: None,
            write_deadline: None,
        }
    }
}

/// Resolve a stalled operation: clear the deadline on progress, fail once it passes.
fn bounded<T>(
    poll: Poll<io::Result<T>>,
    deadline: &mut Option<Pin<Box<Sleep>>>,
    timeout: Duration,
    cx: &mut Context<'_>,
    op: &'static str,
) -> Poll<io::Result<T>> {
    if poll.is_ready() {
        *deadline = None;
        return poll;
    }
    let sleep = deadline.get_or_insert_with(|| Box::pin(tokio::time::sleep(timeout)));
    match sleep.as_mut().poll(cx) {
        Poll::Ready(()) => {
            *deadline = None;
            Poll::Ready(Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("{op} stalled for {timeout:?}"),
            )))
        }
        Poll::Pending => Poll::Pending,
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for DeadlineIo<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let poll = Pin::new(&mut this.inner).poll_read(cx, buf);
        if poll.is_pending() && !this.activity.is_busy() {
            this.read_deadline = None;
            return Poll::Pending;
        }
        bounded(poll, &mut this.read_deadline, this.read_timeout, cx, "read")
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for DeadlineIo<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let poll = Pin::new(&mut this.inner).poll_write(cx, buf);
        bounded(poll, &mut this.write_deadline, this.write_timeout, cx, "write")
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let poll = Pin::new(&mut this.inner).poll_flush(cx);
        bounded(poll, &mut this.write_deadline, this.write_timeout, cx, "flush")
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let poll = Pin::new(&mut this.inner).poll_shutdown(cx);
        bounded(poll, &mut this.write_deadline, this.write_timeout, cx, "shutdown")
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt, duplex};

    use super::*;

    const READ: Duration = Duration::from_secs(60);
    const WRITE: Duration = Duration::from_secs(30);

    #[tokio::test(start_paused = true)]
    async fn idle_deadline_follows_the_last_request() {
        let activity = Arc::new(Activity::new());
        let idle = Duration::from_secs(600);
        let opened = Instant::now();
        assert_eq!(activity.idle_deadline(idle), Some(opened + idle));

        tokio::time::advance(Duration::from_secs(5)).await;
        let guard = activity.begin();
        assert!(activity.is_busy());
        assert_eq!(activity.idle_deadline(idle), None);

        tokio::time::advance(Duration::from_secs(7)).await;
        drop(guard);
        assert!(!activity.is_busy());
        assert_eq!(
            activity.idle_deadline(idle),
            Some(opened + Duration::from_secs(12) + idle)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_write_times_out() {
        let (server, _client) = duplex(8);
        let mut io = DeadlineIo::new(server, Arc::new(Activity::new()), READ, WRITE);

        // nobody reads the other end, so the pipe fills and the write stalls
        let err = io.write_all(&[0_u8; 64]).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_read_during_a_request_times_out() {
        let (server, _client) = duplex(64);
        let activity = Arc::new(Activity::new());
        let mut io = DeadlineIo::new(server, Arc::clone(&activity), READ, WRITE);

        let _request = activity.begin();
        let mut buf = [0_u8; 8];
        let err = io.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_read_is_left_to_the_idle_bound() {
        let (server, _client) = duplex(64);
        let mut io = DeadlineIo::new(server, Arc::new(Activity::new()), READ, WRITE);

        let mut buf = [0_u8; 8];
        let waited = tokio::time::timeout(READ * 3, io.read(&mut buf)).await;
        assert!(waited.is_err(), "an idle read must not fail on the read bound");
    }

    #[tokio::test(start_paused = true)]
    async fn progress_resets_the_deadline() {
        let (server, mut client) = duplex(64);
        let activity = Arc::new(Activity::new());
        let mut io = DeadlineIo::new(server, Arc::clone(&activity), READ, WRITE);
        let _request = activity.begin();

        let writer = tokio::spawn(async move {
            for _ in 0..3 {
                tokio::time::sleep(READ / 2).await;
                client.write_all(b"x").await.unwrap();
            }
            client
        });

        let mut buf = [0_u8; 1];
        for _ in 0..3 {
            io.read_exact(&mut buf).await.unwrap();
        }
        assert_eq!(buf, *b"x");
        writer.await.unwrap();
    }
}
