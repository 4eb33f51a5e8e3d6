//! Raw connections and dialers

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};
use tokio::net::TcpStream;
use tracing::debug;

/// A byte stream the pool can split and drive
pub trait RawConnection: AsyncRead + AsyncWrite + Send + Unpin + 'static {
    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        None
    }
}

impl RawConnection for TcpStream {
    fn local_addr(&self) -> Option<SocketAddr> {
        TcpStream::local_addr(self).ok()
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.peer_addr().ok()
    }
}

impl RawConnection for DuplexStream {}

pub type BoxedConnection = Box<dyn RawConnection>;

impl RawConnection for BoxedConnection {
    fn local_addr(&self) -> Option<SocketAddr> {
        (**self).local_addr()
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        (**self).remote_addr()
    }
}

/// Opens a new physical connection to the remote endpoint
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self) -> io::Result<BoxedConnection>;
}

#[async_trait]
impl<D: Dialer + ?Sized> Dialer for Arc<D> {
    async fn dial(&self) -> io::Result<BoxedConnection> {
        (**self).dial().await
    }
}

/// Plain TCP dialer
#[derive(Debug, Clone)]
pub struct TcpDialer {
    addr: String,
    nodelay: bool,
}

impl TcpDialer {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            nodelay: true,
        }
    }

    /// Leave Nagle's algorithm on (small fragments may then coalesce)
    pub fn with_nagle(mut self) -> Self {
        self.nodelay = false;
        self
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self) -> io::Result<BoxedConnection> {
        let stream = TcpStream::connect(&self.addr).await?;
        stream.set_nodelay(self.nodelay)?;
        debug!("TCP connected to {}", self.addr);
        Ok(Box::new(stream))
    }
}

/// Dialer backed by an async closure
pub struct FnDialer<F> {
    f: F,
}

/// Wrap a closure returning a connection future as a `Dialer`
pub fn dial_fn<F, Fut, C>(f: F) -> FnDialer<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = io::Result<C>> + Send,
    C: RawConnection,
{
    FnDialer { f }
}

#[async_trait]
impl<F, Fut, C> Dialer for FnDialer<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = io::Result<C>> + Send,
    C: RawConnection,
{
    async fn dial(&self) -> io::Result<BoxedConnection> {
        let conn = (self.f)().await?;
        Ok(Box::new(conn))
    }
}
