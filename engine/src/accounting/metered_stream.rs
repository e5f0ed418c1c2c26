use super::{LimiterTable, UserCounters};
use bytes::{Buf, BytesMut};
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, ready};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::Sleep;

/// Stream decorator counting and throttling one user's bytes.
///
/// Reads count as uplink, writes as downlink. The limiter is looked up on
/// every call so a limit swap reaches connections that are already open.
pub struct MeteredStream<S> {
    inner: S,
    table: Arc<LimiterTable>,
    identity: String,
    counters: Arc<UserCounters>,
    /// Bytes already read from `inner` that wait for the limiter.
    held: BytesMut,
    read_delay: Option<Pin<Box<Sleep>>>,
    /// Bytes paid for but not written yet.
    write_credit: usize,
    write_delay: Option<Pin<Box<Sleep>>>,
}

impl<S> MeteredStream<S> {
    pub(super) fn new(
        inner: S,
        table: Arc<LimiterTable>,
        identity: String,
        counters: Arc<UserCounters>,
    ) -> Self {
        Self {
            inner,
            table,
            identity,
            counters,
            held: BytesMut::new(),
            read_delay: None,
            write_credit: 0,
            write_delay: None,
        }
    }
}

fn poll_delay(delay: &mut Option<Pin<Box<Sleep>>>, cx: &mut Context<'_>) -> Poll<()> {
    if let Some(sleep) = delay.as_mut() {
        ready!(sleep.as_mut().poll(cx));
        *delay = None;
    }
    Poll::Ready(())
}

impl<S: AsyncRead + Unpin> AsyncRead for MeteredStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if !this.held.is_empty() {
            ready!(poll_delay(&mut this.read_delay, cx));
            let n = this.held.len().min(buf.remaining());
            buf.put_slice(&this.held[..n]);
            this.held.advance(n);
            this.counters.add_up(n as u64);
            return Poll::Ready(Ok(()));
        }

        let before = buf.filled().len();
        ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;
        let n = buf.filled().len() - before;
        if n == 0 {
            return Poll::Ready(Ok(()));
        }

        let wait = match this.table.get(&this.identity) {
            Some(limiter) => limiter.reserve(n as u64),
            None => Duration::ZERO,
        };
        if wait.is_zero() {
            this.counters.add_up(n as u64);
            return Poll::Ready(Ok(()));
        }

        // hand the bytes out once the bucket has refilled
        this.held.extend_from_slice(&buf.filled()[before..]);
        buf.set_filled(before);
        this.read_delay = Some(Box::pin(tokio::time::sleep(wait)));
        ready!(poll_delay(&mut this.read_delay, cx));

        let n = this.held.len().min(buf.remaining());
        buf.put_slice(&this.held[..n]);
        this.held.advance(n);
        this.counters.add_up(n as u64);
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for MeteredStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(poll_delay(&mut this.write_delay, cx));

        if buf.is_empty() {
            return Pin::new(&mut this.inner).poll_write(cx, buf);
        }

        let len = if this.write_credit > 0 {
            buf.len().min(this.write_credit)
        } else {
            match this.table.get(&this.identity) {
                Some(limiter) => {
                    let chunk = buf.len().min(limiter.burst() as usize);
                    let wait = limiter.reserve(chunk as u64);
                    this.write_credit = chunk;
                    if !wait.is_zero() {
                        this.write_delay = Some(Box::pin(tokio::time::sleep(wait)));
                        ready!(poll_delay(&mut this.write_delay, cx));
                    }
                    chunk
                }
                None => buf.len(),
            }
        };

        let n = ready!(Pin::new(&mut this.inner).poll_write(cx, &buf[..len]))?;
        this.write_credit = this.write_credit.saturating_sub(n);
        this.counters.add_down(n as u64);
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
