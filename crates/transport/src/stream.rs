//! Logical evasion stream
//!
//! `EvasionStream` is a drop-in duplex connection. Writes are classified,
//! obfuscated, fragmented and spread over the rotation pool; reads merge the
//! per-connection readers back into one byte stream.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use shroud_obfuscation::{Obfuscator, Unpadder, WhitelistSet};
use shroud_protocol::{Classification, ClassificationState};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::EvasionConfig;
use crate::connection::Dialer;
use crate::engine::execute;
use crate::error::{ConfigError, PartialWrite, StreamError};
use crate::fragment::Fragmenter;
use crate::pool::{ConnectionPool, PoolSink, PoolStats, ReadEvent};
use crate::probe::detect_limit;

/// Point-in-time counters of one stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamStats {
    pub classification: Option<Classification>,
    /// Logical writes accepted
    pub writes: u64,
    /// Caller bytes delivered
    pub bytes_sent: u64,
    /// Bytes put on the wire for those writes, obfuscation included
    pub wire_bytes: u64,
    /// Bytes added by obfuscation (padding, entropy patterns, decoys)
    pub inflation: u64,
    /// Caller bytes returned by reads
    pub bytes_received: u64,
    pub pool: PoolStats,
}

#[derive(Debug, Default, Clone, Copy)]
struct Deadlines {
    read: Option<Instant>,
    write: Option<Instant>,
}

struct WriteState {
    class: ClassificationState,
    writes: u64,
}

struct ReadState {
    events: mpsc::Receiver<ReadEvent>,
    /// A connection reported end of stream
    eof_seen: bool,
    /// Padding removal state per connection
    unpadders: HashMap<u64, Unpadder>,
}

#[derive(Default)]
struct Counters {
    bytes_sent: AtomicU64,
    wire_bytes: AtomicU64,
    inflation: AtomicU64,
    bytes_received: AtomicU64,
}

struct StreamInner {
    pool: Arc<ConnectionPool>,
    fragmenter: Fragmenter,
    obfuscator: Obfuscator,
    write_state: AsyncMutex<WriteState>,
    read_state: AsyncMutex<ReadState>,
    deadlines: Mutex<Deadlines>,
    counters: Counters,
    cancel: CancellationToken,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl StreamInner {
    async fn write(&self, data: &[u8]) -> Result<usize, PartialWrite> {
        if self.cancel.is_cancelled() {
            return Err(PartialWrite::none(StreamError::Closed));
        }
        if data.is_empty() {
            return Ok(0);
        }

        // One logical write in flight at a time
        let mut state = self.write_state.lock().await;

        let deadline = self.deadlines.lock().write;
        if deadline.is_some_and(|at| Instant::now() >= at) {
            return Err(PartialWrite::none(StreamError::Timeout));
        }

        let first_write = !state.class.is_classified();
        let class = state.class.observe(data);
        if first_write {
            debug!("Stream classified as {}", class);
        }
        state.writes += 1;

        let obfuscated = self.obfuscator.apply(data, class, first_write);
        let wire = &obfuscated.data[..];
        let plan = self.fragmenter.plan(wire, class, state.writes);
        trace!(
            "Write #{} ({}): {} bytes, {} on the wire in {} fragments ({:?})",
            state.writes,
            class,
            data.len(),
            wire.len(),
            plan.len(),
            plan.strategy
        );

        let mut sink = PoolSink::new(&self.pool, deadline);
        let result = execute(&plan, wire, &mut sink, &self.cancel).await;

        let wire_sent = match &result {
            Ok(()) => wire.len(),
            Err(e) => e.flushed,
        };
        let sent = obfuscated.original_flushed(wire_sent);
        self.counters
            .wire_bytes
            .fetch_add(wire_sent as u64, Ordering::Relaxed);
        self.counters
            .bytes_sent
            .fetch_add(sent as u64, Ordering::Relaxed);
        if result.is_ok() {
            self.counters
                .inflation
                .fetch_add(obfuscated.inflation() as u64, Ordering::Relaxed);
        }

        match result {
            Ok(()) => Ok(data.len()),
            Err(e) => {
                debug!("Write #{} stopped after {} bytes: {}", state.writes, sent, e.source);
                Err(PartialWrite::new(sent, e.source))
            }
        }
    }

    /// Next chunk from any connection, `None` at end of stream
    async fn recv(&self) -> Result<Option<Bytes>, StreamError> {
        let mut state = self.read_state.lock().await;

        loop {
            if self.cancel.is_cancelled() {
                return Ok(None);
            }

            // Every reader has finished: deliver what is queued, then EOF
            let event = if state.eof_seen && self.pool.live_readers() == 0 {
                match state.events.try_recv() {
                    Ok(event) => event,
                    Err(_) => return Ok(None),
                }
            } else {
                let deadline = self.deadlines.lock().read;
                let next = async {
                    tokio::select! {
                        _ = self.cancel.cancelled() => None,
                        event = state.events.recv() => event,
                    }
                };
                let event = match deadline {
                    Some(at) => tokio::time::timeout_at(at, next)
                        .await
                        .map_err(|_| StreamError::Timeout)?,
                    None => next.await,
                };
                match event {
                    Some(event) => event,
                    None => return Ok(None),
                }
            };

            match event {
                ReadEvent::Data { slot, data } => {
                    let data = if self.obfuscator.pads() {
                        let range = state.unpadders.entry(slot).or_default().feed(&data);
                        data.slice(range)
                    } else {
                        data
                    };
                    if data.is_empty() {
                        continue;
                    }
                    self.counters
                        .bytes_received
                        .fetch_add(data.len() as u64, Ordering::Relaxed);
                    return Ok(Some(data));
                }
                ReadEvent::Eof { slot } => {
                    trace!("Connection #{} finished reading", slot);
                    state.unpadders.remove(&slot);
                    state.eof_seen = true;
                }
                ReadEvent::Failed { slot, error } => {
                    state.unpadders.remove(&slot);
                    state.eof_seen = true;
                    if self.pool.current_id() == Some(slot) {
                        return Err(StreamError::Io(error));
                    }
                    warn!("Read on retired connection #{} failed: {}", slot, error);
                }
            }
        }
    }

    async fn close(&self) {
        self.cancel.cancel();
        self.pool.close().await;
        if let Some(sweeper) = self.sweeper.lock().take() {
            sweeper.abort();
        }
    }
}

/// Duplex stream over a rotating set of physical connections
pub struct EvasionStream {
    inner: Arc<StreamInner>,
    pending: Bytes,
    read_fut: Option<BoxFuture<'static, io::Result<Option<Bytes>>>>,
    write_fut: Option<BoxFuture<'static, io::Result<usize>>>,
    shutdown_fut: Option<BoxFuture<'static, io::Result<()>>>,
}

impl EvasionStream {
    /// Open a stream with its own whitelist built from `config.whitelist`
    pub async fn connect(dialer: Arc<dyn Dialer>, config: EvasionConfig) -> Result<Self, StreamError> {
        let whitelist = Arc::new(config.whitelist.build());
        Self::connect_with_whitelist(dialer, config, whitelist).await
    }

    /// Open a stream sharing an existing whitelist
    ///
    /// The configuration is validated first; the first connection is dialed
    /// before this returns and a dial failure is returned as is.
    pub async fn connect_with_whitelist(
        dialer: Arc<dyn Dialer>,
        config: EvasionConfig,
        whitelist: Arc<WhitelistSet>,
    ) -> Result<Self, StreamError> {
        config.validate()?;
        let fragmenter = Fragmenter::new(config.fragment.clone())?;
        let obfuscator =
            Obfuscator::new(&config.obfuscation, whitelist).map_err(ConfigError::from)?;

        let ceiling = if config.multiplex.adaptive_limit {
            detect_limit(dialer.as_ref(), &config.multiplex).await.limit
        } else {
            config.multiplex.effective_limit()
        };

        let (pool, events) = ConnectionPool::new(dialer, config.multiplex.clone(), ceiling)?;
        pool.connect().await?;
        let sweeper = pool.start_sweeper();

        info!(
            "Stream connected (limit {} bytes, fragmentation {}, obfuscation {})",
            ceiling,
            if fragmenter.is_enabled() { "on" } else { "off" },
            if obfuscator.is_passthrough() { "off" } else { "on" }
        );

        let inner = StreamInner {
            cancel: pool.cancellation_token(),
            pool,
            fragmenter,
            obfuscator,
            write_state: AsyncMutex::new(WriteState {
                class: ClassificationState::new(),
                writes: 0,
            }),
            read_state: AsyncMutex::new(ReadState {
                events,
                eof_seen: false,
                unpadders: HashMap::new(),
            }),
            deadlines: Mutex::new(Deadlines::default()),
            counters: Counters::default(),
            sweeper: Mutex::new(Some(sweeper)),
        };

        Ok(Self {
            inner: Arc::new(inner),
            pending: Bytes::new(),
            read_fut: None,
            write_fut: None,
            shutdown_fut: None,
        })
    }

    /// Send one logical write
    ///
    /// On failure `flushed` counts the caller's bytes that reached the wire;
    /// the rest may be retried with another call.
    pub async fn write_payload(&self, data: &[u8]) -> Result<usize, PartialWrite> {
        self.inner.write(data).await
    }

    /// Next chunk of incoming data, `None` at end of stream
    pub async fn recv(&self) -> Result<Option<Bytes>, StreamError> {
        self.inner.recv().await
    }

    /// Close every physical connection
    pub async fn close(&self) {
        self.inner.close().await;
    }

    pub fn is_closed(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.pool.local_addr()
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.inner.pool.remote_addr()
    }

    /// Deadline for both directions (`None` clears it)
    pub fn set_deadline(&self, deadline: Option<Instant>) {
        let mut deadlines = self.inner.deadlines.lock();
        deadlines.read = deadline;
        deadlines.write = deadline;
    }

    pub fn set_read_deadline(&self, deadline: Option<Instant>) {
        self.inner.deadlines.lock().read = deadline;
    }

    pub fn set_write_deadline(&self, deadline: Option<Instant>) {
        self.inner.deadlines.lock().write = deadline;
    }

    /// Per-connection ceiling in use (configured or probed)
    pub fn data_limit(&self) -> u64 {
        self.inner.pool.ceiling()
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.inner.pool
    }

    pub async fn stats(&self) -> StreamStats {
        let (classification, writes) = {
            let state = self.inner.write_state.lock().await;
            (state.class.get(), state.writes)
        };
        let counters = &self.inner.counters;
        StreamStats {
            classification,
            writes,
            bytes_sent: counters.bytes_sent.load(Ordering::Relaxed),
            wire_bytes: counters.wire_bytes.load(Ordering::Relaxed),
            inflation: counters.inflation.load(Ordering::Relaxed),
            bytes_received: counters.bytes_received.load(Ordering::Relaxed),
            pool: self.inner.pool.stats().await,
        }
    }
}

impl std::fmt::Debug for EvasionStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EvasionStream")
            .field("limit", &self.inner.pool.ceiling())
            .field("current", &self.inner.pool.current_id())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Drop for EvasionStream {
    fn drop(&mut self) {
        self.inner.cancel.cancel();
        if let Some(sweeper) = self.inner.sweeper.lock().take() {
            sweeper.abort();
        }
    }
}

impl AsyncRead for EvasionStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;

        if this.pending.is_empty() {
            let fut = this.read_fut.get_or_insert_with(|| {
                let inner = this.inner.clone();
                Box::pin(async move { inner.recv().await.map_err(io::Error::from) })
            });
            let result = match fut.as_mut().poll(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(result) => result,
            };
            this.read_fut = None;
            match result? {
                Some(data) => this.pending = data,
                None => return Poll::Ready(Ok(())),
            }
        }

        let n = this.pending.len().min(buf.remaining());
        buf.put_slice(&this.pending.split_to(n));
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for EvasionStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        let fut = this.write_fut.get_or_insert_with(|| {
            let inner = this.inner.clone();
            let data = buf.to_vec();
            Box::pin(async move {
                match inner.write(&data).await {
                    Ok(n) => Ok(n),
                    // Short write: report what went out, the caller retries the rest
                    Err(e) if e.flushed > 0 => Ok(e.flushed),
                    Err(e) => Err(e.into()),
                }
            })
        });

        let result = match fut.as_mut().poll(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(result) => result,
        };
        this.write_fut = None;
        Poll::Ready(result)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Fragments are flushed as they are sent; only an unfinished write is waited on
        let this = &mut *self;
        if let Some(fut) = this.write_fut.as_mut() {
            let result = match fut.as_mut().poll(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(result) => result,
            };
            this.write_fut = None;
            result?;
        }
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;
        let fut = this.shutdown_fut.get_or_insert_with(|| {
            let inner = this.inner.clone();
            Box::pin(async move {
                inner.close().await;
                Ok(())
            })
        });

        let result = match fut.as_mut().poll(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(result) => result,
        };
        this.shutdown_fut = None;
        Poll::Ready(result)
    }
}
