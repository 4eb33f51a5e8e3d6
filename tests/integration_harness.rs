//! Integration Test Harness
#![allow(dead_code)]
//!
//! In-memory dialers that record every write a stream puts on each
//! physical connection, plus tracing setup.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use parking_lot::Mutex;
use shroud_transport::{Dialer, RawConnection, dial_fn};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, DuplexStream, ReadBuf};

/// Pipe capacity, large enough that no test write ever blocks
pub const PIPE_CAPACITY: usize = 1024 * 1024;

/// Install a test subscriber once (respects `RUST_LOG`)
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// What one physical connection saw
#[derive(Default)]
pub struct ConnectionLog {
    writes: Mutex<Vec<Vec<u8>>>,
    peer: Mutex<Option<DuplexStream>>,
}

impl ConnectionLog {
    /// Every accepted `poll_write`, in order
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.writes.lock().clone()
    }

    pub fn write_sizes(&self) -> Vec<usize> {
        self.writes.lock().iter().map(Vec::len).collect()
    }

    /// Everything written, concatenated
    pub fn bytes(&self) -> Vec<u8> {
        self.writes.lock().concat()
    }

    pub fn total(&self) -> usize {
        self.writes.lock().iter().map(Vec::len).sum()
    }

    /// Take the server end of the pipe (to write replies or close it)
    pub fn take_peer(&self) -> Option<DuplexStream> {
        self.peer.lock().take()
    }
}

/// Client end of a pipe that logs each write
pub struct RecordingConnection {
    inner: DuplexStream,
    log: Arc<ConnectionLog>,
}

impl AsyncRead for RecordingConnection {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for RecordingConnection {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        match Pin::new(&mut this.inner).poll_write(cx, buf) {
            Poll::Ready(Ok(n)) => {
                if n > 0 {
                    this.log.writes.lock().push(buf[..n].to_vec());
                }
                Poll::Ready(Ok(n))
            }
            other => other,
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

impl RawConnection for RecordingConnection {}

/// Dialer handing out recording pipes; one log per dial
#[derive(Clone, Default)]
pub struct RecordingDialer {
    connections: Arc<Mutex<Vec<Arc<ConnectionLog>>>>,
}

impl RecordingDialer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dialer(&self) -> Arc<dyn Dialer> {
        let connections = self.connections.clone();
        Arc::new(dial_fn(move || {
            let (client, server) = tokio::io::duplex(PIPE_CAPACITY);
            let log = Arc::new(ConnectionLog {
                writes: Mutex::new(Vec::new()),
                peer: Mutex::new(Some(server)),
            });
            connections.lock().push(log.clone());
            async move { Ok::<_, io::Error>(RecordingConnection { inner: client, log }) }
        }))
    }

    pub fn dials(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn connection(&self, index: usize) -> Arc<ConnectionLog> {
        self.connections.lock()[index].clone()
    }

    pub fn connections(&self) -> Vec<Arc<ConnectionLog>> {
        self.connections.lock().clone()
    }

    /// Bytes of every connection in dial order
    pub fn all_bytes(&self) -> Vec<u8> {
        self.connections().iter().flat_map(|c| c.bytes()).collect()
    }

    pub fn all_writes(&self) -> Vec<Vec<u8>> {
        self.connections().iter().flat_map(|c| c.writes()).collect()
    }
}

/// Dialer that always refuses
pub fn refusing_dialer() -> Arc<dyn Dialer> {
    Arc::new(dial_fn(|| async {
        Err::<DuplexStream, _>(io::Error::from(io::ErrorKind::ConnectionRefused))
    }))
}

/// Read whatever arrives within `wait`
pub async fn read_available(peer: &mut DuplexStream, wait: Duration) -> Vec<u8> {
    let mut out = Vec::new();
    let mut buf = vec![0u8; 64 * 1024];
    while let Ok(Ok(n)) = tokio::time::timeout(wait, peer.read(&mut buf)).await {
        if n == 0 {
            break;
        }
        out.extend_from_slice(&buf[..n]);
    }
    out
}

/// Deterministic filler that never looks like TLS or HTTP
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8 + 1).collect()
}
