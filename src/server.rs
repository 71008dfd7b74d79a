//! HTTP/1 listener for image requests

use crate::error::{EdgeError, Result};
use crate::proxy::EdgeProxy;
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::{Instant, Sleep};
use tracing::{debug, error, info};

/// Accept loop feeding connections into an [`EdgeProxy`]
pub struct EdgeServer {
    proxy: Arc<EdgeProxy>,
    listener: TcpListener,
    timeout: Duration,
}

impl EdgeServer {
    /// Bind the listener; use port 0 to let the OS pick one
    pub async fn bind(proxy: Arc<EdgeProxy>, addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| EdgeError::Http(format!("Failed to bind {}: {}", addr, e)))?;
        let timeout = proxy.config().server_timeout();

        Ok(EdgeServer {
            proxy,
            listener,
            timeout,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .map_err(|e| EdgeError::Http(format!("Failed to read local address: {}", e)))
    }

    /// Serve connections until `shutdown` flips to true
    ///
    /// Connections still open at shutdown keep running on their own tasks
    /// until they finish or go idle for the connection timeout.
    pub async fn serve(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!("Image edge cache listening on http://{}", self.local_addr()?);

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => self.spawn_connection(stream, peer),
                        Err(e) => error!("Accept failed: {}", e),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Listener shutting down");
                        return Ok(());
                    }
                }
            }
        }
    }

    fn spawn_connection(&self, stream: TcpStream, peer: SocketAddr) {
        let io = TokioIo::new(IdleTimeout::new(stream, self.timeout));
        let proxy = Arc::clone(&self.proxy);
        let timeout = self.timeout;

        tokio::task::spawn(async move {
            let service = service_fn(move |req: Request<Incoming>| {
                let proxy = Arc::clone(&proxy);
                // GET-only service: the body is never read
                let (parts, _body) = req.into_parts();
                let req = Request::from_parts(parts, ());
                async move {
                    let response = proxy.handle(&req, Some(peer.ip())).await;
                    Ok::<_, Infallible>(response.map(Full::<Bytes>::new))
                }
            });

            if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                if is_idle_timeout(&err) {
                    debug!("Connection from {} idle for {:?}, closing", peer, timeout);
                } else {
                    error!("Error serving connection from {}: {:?}", peer, err);
                }
            }
        });
    }
}

fn is_idle_timeout(err: &hyper::Error) -> bool {
    std::error::Error::source(err)
        .and_then(|source| source.downcast_ref::<io::Error>())
        .is_some_and(|e| e.kind() == io::ErrorKind::TimedOut)
}

/// Stream wrapper that fails with `TimedOut` once no bytes have moved in
/// either direction for `timeout`
///
/// The deadline restarts on every completed read or write, so a slow but
/// progressing transfer is never cut off.
struct IdleTimeout<S> {
    inner: S,
    timeout: Duration,
    deadline: Pin<Box<Sleep>>,
}

impl<S> IdleTimeout<S> {
    fn new(inner: S, timeout: Duration) -> Self {
        IdleTimeout {
            inner,
            timeout,
            deadline: Box::pin(tokio::time::sleep(timeout)),
        }
    }

    fn touch(&mut self) {
        let next = Instant::now() + self.timeout;
        self.deadline.as_mut().reset(next);
    }

    fn poll_idle<T>(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<T>> {
        match self.deadline.as_mut().poll(cx) {
            Poll::Ready(()) => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "connection idle",
            ))),
            Poll::Pending => Poll::Pending,
        }
    }

    fn track<T>(&mut self, cx: &mut Context<'_>, poll: Poll<io::Result<T>>) -> Poll<io::Result<T>> {
        match poll {
            Poll::Ready(result) => {
                self.touch();
                Poll::Ready(result)
            }
            Poll::Pending => self.poll_idle(cx),
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for IdleTimeout<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        let poll = Pin::new(&mut this.inner).poll_read(cx, buf);
        this.track(cx, poll)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for IdleTimeout<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        let poll = Pin::new(&mut this.inner).poll_write(cx, buf);
        this.track(cx, poll)
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        let poll = Pin::new(&mut this.inner).poll_write_vectored(cx, bufs);
        this.track(cx, poll)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;
        let poll = Pin::new(&mut this.inner).poll_flush(cx);
        this.track(cx, poll)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
