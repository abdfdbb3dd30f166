use std::{
    future::Future,
    io,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    pin::Pin,
    task::{Context, Poll},
};

use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    time::{Instant, Sleep, sleep_until},
};

// Hook invoked exactly once when the stream closes, used by the owning
// upstream to deregister the stream without holding a strong reference
// in either direction.
pub(crate) type CloseHook = Box<dyn FnOnce() + Send>;

// A byte stream with per-call deadlines, layered over one SSH channel in
// production (any transport in tests). A deadline races the transport
// against a timer; expiry surfaces as `TimedOut` while the transport
// itself stays open, so a caller may retry or close as it sees fit.
pub(crate) struct ForwardedStream<S> {
    inner: S,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    read_deadline: Option<Instant>,
    write_deadline: Option<Instant>,
    read_timer: Option<Pin<Box<Sleep>>>,
    write_timer: Option<Pin<Box<Sleep>>>,
    on_close: Option<CloseHook>,
}

impl<S> ForwardedStream<S> {
    pub(crate) fn new(inner: S, local_addr: SocketAddr, on_close: Option<CloseHook>) -> Self {
        ForwardedStream {
            inner,
            local_addr,
            // The remote end has no TCP endpoint on the router side.
            remote_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            read_deadline: None,
            write_deadline: None,
            read_timer: None,
            write_timer: None,
            on_close,
        }
    }

    #[allow(dead_code)]
    pub(crate) fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    #[allow(dead_code)]
    pub(crate) fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    #[allow(dead_code)]
    pub(crate) fn set_deadline(&mut self, deadline: Option<Instant>) {
        self.set_read_deadline(deadline);
        self.set_write_deadline(deadline);
    }

    #[allow(dead_code)]
    pub(crate) fn set_read_deadline(&mut self, deadline: Option<Instant>) {
        self.read_deadline = deadline;
        self.read_timer = None;
    }

    #[allow(dead_code)]
    pub(crate) fn set_write_deadline(&mut self, deadline: Option<Instant>) {
        self.write_deadline = deadline;
        self.write_timer = None;
    }

    fn run_close_hook(&mut self) {
        if let Some(hook) = self.on_close.take() {
            hook();
        }
    }
}

fn poll_deadline(
    deadline: Option<Instant>,
    timer: &mut Option<Pin<Box<Sleep>>>,
    cx: &mut Context<'_>,
    operation: &str,
) -> Poll<io::Error> {
    let Some(deadline) = deadline else {
        return Poll::Pending;
    };
    let armed = timer.get_or_insert_with(|| Box::pin(sleep_until(deadline)));
    if armed.as_mut().poll(cx).is_ready() {
        // Disarm so a later call re-arms instead of polling a finished
        // timer.
        *timer = None;
        return Poll::Ready(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("{operation} deadline exceeded"),
        ));
    }
    Poll::Pending
}

impl<S: AsyncRead + Unpin> AsyncRead for ForwardedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if let Poll::Ready(error) =
            poll_deadline(this.read_deadline, &mut this.read_timer, cx, "read")
        {
            return Poll::Ready(Err(error));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for ForwardedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if let Poll::Ready(error) =
            poll_deadline(this.write_deadline, &mut this.write_timer, cx, "write")
        {
            return Poll::Ready(Err(error));
        }
        Pin::new(&mut this.inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        this.run_close_hook();
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}

impl<S> Drop for ForwardedStream<S> {
    fn drop(&mut self) {
        self.run_close_hook();
    }
}
