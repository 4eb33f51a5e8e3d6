//! Connection rotation pool
//!
//! One logical stream spreads its bytes over a bounded set of physical
//! connections. Every connection carries at most `ceiling * safety_margin`
//! bytes (written plus read); when the current one is full the pool reuses a
//! lightly used connection or dials a new one, evicting the least recently
//! used connection when at capacity.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::{MultiplexConfig, rotation_threshold};
use crate::connection::{BoxedConnection, Dialer};
use crate::engine::{FragmentSink, write_counted};
use crate::error::{ConfigError, PartialWrite, StreamError};
use crate::ssh::{BannerStripper, SSH_BANNER, send_banner};

/// Buffered read events between the per-connection readers and the stream
const READ_QUEUE_DEPTH: usize = 64;

/// Read buffer per connection
const READ_CHUNK: usize = 16 * 1024;

/// Lifecycle of the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolPhase {
    /// No physical connection yet
    Empty,
    Active,
    /// Switching the current connection
    Rotating,
    Closed,
}

/// Output of the per-connection read workers
#[derive(Debug)]
pub enum ReadEvent {
    Data { slot: u64, data: Bytes },
    /// The peer closed this connection's read side
    Eof { slot: u64 },
    Failed { slot: u64, error: io::Error },
}

impl ReadEvent {
    pub fn slot(&self) -> u64 {
        match self {
            Self::Data { slot, .. } | Self::Eof { slot } | Self::Failed { slot, .. } => *slot,
        }
    }
}

/// One physical connection
pub struct ConnectionSlot {
    id: u64,
    created: Instant,
    last_used: Mutex<Instant>,
    bytes_written: AtomicU64,
    bytes_read: AtomicU64,
    writer: AsyncMutex<WriteHalf<BoxedConnection>>,
    local_addr: Option<SocketAddr>,
    remote_addr: Option<SocketAddr>,
    cancel: CancellationToken,
    /// The reader hit end of stream or an error
    read_done: AtomicBool,
}

impl ConnectionSlot {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn created(&self) -> Instant {
        self.created
    }

    pub fn last_used(&self) -> Instant {
        *self.last_used.lock()
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_used())
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read.load(Ordering::Relaxed)
    }

    /// Cumulative bytes moved in both directions
    pub fn usage(&self) -> u64 {
        self.bytes_written() + self.bytes_read()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Whether the peer side has finished, so the slot is not worth reusing
    pub fn is_read_done(&self) -> bool {
        self.read_done.load(Ordering::Acquire)
    }

    fn touch(&self) {
        *self.last_used.lock() = Instant::now();
    }

    /// Write all of `data`, counting whatever the socket accepted
    pub async fn write(&self, data: &[u8], deadline: Option<Instant>) -> Result<(), PartialWrite> {
        if self.is_closed() {
            return Err(PartialWrite::none(StreamError::Closed));
        }

        let mut writer = self.writer.lock().await;
        let result = tokio::select! {
            _ = self.cancel.cancelled() => Err(PartialWrite::none(StreamError::Closed)),
            result = async {
                write_counted(&mut *writer, data, deadline).await?;
                writer
                    .flush()
                    .await
                    .map_err(|e| PartialWrite::new(data.len(), e.into()))
            } => result,
        };

        let sent = match &result {
            Ok(()) => data.len(),
            Err(e) => e.flushed,
        };
        self.bytes_written.fetch_add(sent as u64, Ordering::Relaxed);
        self.touch();
        result
    }

    /// Cancel the reader and shut the write side down
    async fn close(&self) {
        self.cancel.cancel();
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            trace!("Shutdown of connection #{} failed: {}", self.id, e);
        }
    }
}

impl std::fmt::Debug for ConnectionSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionSlot")
            .field("id", &self.id)
            .field("bytes_written", &self.bytes_written())
            .field("bytes_read", &self.bytes_read())
            .field("remote_addr", &self.remote_addr)
            .finish()
    }
}

/// Point-in-time view of one slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotStats {
    pub id: u64,
    pub bytes_written: u64,
    pub bytes_read: u64,
    pub age: Duration,
    pub idle: Duration,
    pub current: bool,
}

/// Point-in-time view of the pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
    pub phase: PoolPhase,
    pub ceiling: u64,
    pub threshold: u64,
    pub current: Option<u64>,
    pub slots: Vec<SlotStats>,
    /// Connections dialed over the pool's lifetime
    pub dials: u64,
    pub rotations: u64,
    pub reuses: u64,
    pub evictions: u64,
    pub swept: u64,
}

impl PoolStats {
    pub fn total_written(&self) -> u64 {
        self.slots.iter().map(|s| s.bytes_written).sum()
    }

    pub fn total_read(&self) -> u64 {
        self.slots.iter().map(|s| s.bytes_read).sum()
    }
}

struct PoolState {
    slots: Vec<Arc<ConnectionSlot>>,
    current: Option<u64>,
    /// Where the reuse search starts next time
    cursor: usize,
    phase: PoolPhase,
}

impl PoolState {
    fn get(&self, id: u64) -> Option<&Arc<ConnectionSlot>> {
        self.slots.iter().find(|s| s.id == id)
    }

    fn take(&mut self, id: u64) -> Option<Arc<ConnectionSlot>> {
        let index = self.slots.iter().position(|s| s.id == id)?;
        if index < self.cursor {
            self.cursor -= 1;
        }
        Some(self.slots.remove(index))
    }
}

#[derive(Default)]
struct Counters {
    dials: AtomicU64,
    rotations: AtomicU64,
    reuses: AtomicU64,
    evictions: AtomicU64,
    swept: AtomicU64,
}

/// Bounded set of physical connections behind one logical stream
pub struct ConnectionPool {
    dialer: Arc<dyn Dialer>,
    config: MultiplexConfig,
    ceiling: u64,
    threshold: u64,
    watermark: u64,
    state: AsyncMutex<PoolState>,
    /// Mirror of `state.current` readable without the pool lock
    current_slot: Mutex<Option<Arc<ConnectionSlot>>>,
    next_id: AtomicU64,
    live_readers: Arc<AtomicUsize>,
    events: mpsc::Sender<ReadEvent>,
    counters: Counters,
    cancel: CancellationToken,
}

impl ConnectionPool {
    /// Create an empty pool with the given per-connection ceiling
    ///
    /// Read events from every connection arrive on the returned receiver.
    pub fn new(
        dialer: Arc<dyn Dialer>,
        config: MultiplexConfig,
        ceiling: u64,
    ) -> Result<(Arc<Self>, mpsc::Receiver<ReadEvent>), ConfigError> {
        config.validate()?;
        if ceiling == 0 {
            return Err(ConfigError::Zero("data limit"));
        }

        let (events, rx) = mpsc::channel(READ_QUEUE_DEPTH);
        let pool = Arc::new(Self {
            threshold: rotation_threshold(ceiling, config.safety_margin),
            watermark: (ceiling as f64 * config.reuse_watermark) as u64,
            dialer,
            config,
            ceiling,
            state: AsyncMutex::new(PoolState {
                slots: Vec::new(),
                current: None,
                cursor: 0,
                phase: PoolPhase::Empty,
            }),
            current_slot: Mutex::new(None),
            next_id: AtomicU64::new(1),
            live_readers: Arc::new(AtomicUsize::new(0)),
            events,
            counters: Counters::default(),
            cancel: CancellationToken::new(),
        });
        Ok((pool, rx))
    }

    pub fn ceiling(&self) -> u64 {
        self.ceiling
    }

    /// Usage level that triggers rotation
    pub fn threshold(&self) -> u64 {
        self.threshold
    }

    pub fn config(&self) -> &MultiplexConfig {
        &self.config
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn current_id(&self) -> Option<u64> {
        self.current_slot.lock().as_ref().map(|s| s.id)
    }

    /// Local address of the current connection
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.current_slot.lock().as_ref().and_then(|s| s.local_addr)
    }

    /// Remote address of the current connection
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.current_slot.lock().as_ref().and_then(|s| s.remote_addr)
    }

    /// Read workers still running
    pub fn live_readers(&self) -> usize {
        self.live_readers.load(Ordering::Acquire)
    }

    pub async fn phase(&self) -> PoolPhase {
        self.state.lock().await.phase
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.slots.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn current(&self) -> Option<Arc<ConnectionSlot>> {
        let state = self.state.lock().await;
        state.current.and_then(|id| state.get(id).cloned())
    }

    /// Bytes the slot may still carry before rotation
    pub fn capacity(&self, slot: &ConnectionSlot) -> u64 {
        if !self.config.rotate_on_limit {
            return u64::MAX;
        }
        self.threshold.saturating_sub(slot.usage())
    }

    /// Dial the first connection (Empty -> Active)
    pub async fn connect(&self) -> Result<Arc<ConnectionSlot>, StreamError> {
        let mut state = self.state.lock().await;
        if state.phase == PoolPhase::Closed {
            return Err(StreamError::Closed);
        }
        if let Some(slot) = state.current.and_then(|id| state.get(id).cloned()) {
            return Ok(slot);
        }

        let slot = self.dial_slot().await?;
        state.slots.push(slot.clone());
        self.set_current(&mut state, slot.id);
        state.phase = PoolPhase::Active;
        Ok(slot)
    }

    /// Current connection if it has room, otherwise rotate once
    pub async fn writable_slot(&self) -> Result<Arc<ConnectionSlot>, StreamError> {
        let mut state = self.state.lock().await;
        if state.phase == PoolPhase::Closed || self.is_closed() {
            return Err(StreamError::Closed);
        }

        if let Some(slot) = state.current.and_then(|id| state.get(id).cloned()) {
            if self.capacity(&slot) > 0 {
                return Ok(slot);
            }
        }

        let previous = state.phase;
        state.phase = PoolPhase::Rotating;
        let result = self.rotate(&mut state).await;
        state.phase = match &result {
            Ok(_) => PoolPhase::Active,
            Err(_) if state.slots.is_empty() => PoolPhase::Empty,
            Err(_) => previous,
        };

        let slot = result?;
        if self.capacity(&slot) == 0 {
            return Err(StreamError::NoCapacity(slot.id));
        }
        Ok(slot)
    }

    async fn rotate(&self, state: &mut PoolState) -> Result<Arc<ConnectionSlot>, StreamError> {
        if let Some(old) = state.current.and_then(|id| state.get(id)) {
            info!(
                "Rotating connection (current #{} used {} bytes)",
                old.id,
                old.usage()
            );
        }

        // Reuse a lightly used connection, round-robin from the cursor
        let count = state.slots.len();
        for step in 0..count {
            let index = (state.cursor + step) % count;
            let slot = &state.slots[index];
            if Some(slot.id) != state.current
                && !slot.is_closed()
                && !slot.is_read_done()
                && slot.usage() < self.watermark
            {
                let slot = slot.clone();
                debug!("Reusing connection #{} ({} bytes used)", slot.id, slot.usage());
                state.cursor = (index + 1) % count;
                self.counters.reuses.fetch_add(1, Ordering::Relaxed);
                self.note_rotation(state, slot.id);
                return Ok(slot);
            }
        }

        // Dial before evicting so a failed dial closes nothing
        let slot = self.dial_slot().await?;

        if state.slots.len() >= self.config.max_connections {
            let victim = state
                .slots
                .iter()
                .filter(|s| Some(s.id) != state.current)
                .min_by_key(|s| s.last_used())
                .or_else(|| state.slots.first())
                .map(|s| s.id);
            if let Some(victim) = victim.and_then(|id| state.take(id)) {
                debug!(
                    "Closed least recently used connection #{} ({} bytes used)",
                    victim.id,
                    victim.usage()
                );
                victim.close().await;
                self.counters.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }

        state.slots.push(slot.clone());
        self.note_rotation(state, slot.id);
        Ok(slot)
    }

    fn note_rotation(&self, state: &mut PoolState, id: u64) {
        if state.current.is_some() {
            self.counters.rotations.fetch_add(1, Ordering::Relaxed);
        }
        self.set_current(state, id);
    }

    fn set_current(&self, state: &mut PoolState, id: u64) {
        state.current = Some(id);
        *self.current_slot.lock() = state.get(id).cloned();
    }

    fn clear_current(&self, state: &mut PoolState) {
        state.current = None;
        *self.current_slot.lock() = None;
    }

    /// Dial, optionally mask, and start the reader for a new connection
    async fn dial_slot(&self) -> Result<Arc<ConnectionSlot>, StreamError> {
        let timeout = self.config.dial_timeout();
        let mut conn = tokio::select! {
            _ = self.cancel.cancelled() => return Err(StreamError::Closed),
            result = tokio::time::timeout(timeout, self.dialer.dial()) => match result {
                Ok(Ok(conn)) => conn,
                Ok(Err(e)) => {
                    warn!("Dial failed: {}", e);
                    return Err(StreamError::Dial(e));
                }
                Err(_) => {
                    warn!("Dial timed out after {:?}", timeout);
                    return Err(StreamError::DialTimeout(timeout));
                }
            },
        };

        let mut banner_sent = 0;
        if self.config.mask_as_ssh {
            send_banner(&mut conn).await.map_err(StreamError::Dial)?;
            banner_sent = SSH_BANNER.len() as u64;
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let local_addr = conn.local_addr();
        let remote_addr = conn.remote_addr();
        let (reader, writer) = tokio::io::split(conn);
        let now = Instant::now();

        let slot = Arc::new(ConnectionSlot {
            id,
            created: now,
            last_used: Mutex::new(now),
            bytes_written: AtomicU64::new(banner_sent),
            bytes_read: AtomicU64::new(0),
            writer: AsyncMutex::new(writer),
            local_addr,
            remote_addr,
            cancel: self.cancel.child_token(),
            read_done: AtomicBool::new(false),
        });

        self.live_readers.fetch_add(1, Ordering::AcqRel);
        tokio::spawn(read_loop(
            slot.clone(),
            reader,
            self.events.clone(),
            self.config.mask_as_ssh.then(BannerStripper::new),
            self.live_readers.clone(),
            self.cancel.clone(),
        ));

        self.counters.dials.fetch_add(1, Ordering::Relaxed);
        match remote_addr {
            Some(addr) => debug!("Created new connection #{} to {}", id, addr),
            None => debug!("Created new connection #{}", id),
        }
        Ok(slot)
    }

    /// Drop a broken connection; the next write rotates away from it
    pub async fn discard(&self, id: u64) {
        let mut state = self.state.lock().await;
        let Some(slot) = state.take(id) else {
            return;
        };
        if state.current == Some(id) {
            self.clear_current(&mut state);
        }
        if state.slots.is_empty() && state.phase != PoolPhase::Closed {
            state.phase = PoolPhase::Empty;
        }
        debug!("Discarded connection #{}", id);
        slot.close().await;
    }

    /// Close non-current connections idle for longer than the idle timeout
    pub async fn sweep_idle(&self) -> usize {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        let timeout = self.config.idle_timeout();

        let idle: Vec<u64> = state
            .slots
            .iter()
            .filter(|s| Some(s.id) != state.current && s.idle_for(now) > timeout)
            .map(|s| s.id)
            .collect();

        for id in &idle {
            if let Some(slot) = state.take(*id) {
                debug!("Closed idle connection #{}", id);
                slot.close().await;
            }
        }
        self.counters
            .swept
            .fetch_add(idle.len() as u64, Ordering::Relaxed);
        idle.len()
    }

    /// Spawn the periodic idle sweep, stopped by `close`
    pub fn start_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let pool = Arc::downgrade(self);
        let cancel = self.cancel.clone();
        let period = self.config.sweep_interval();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let Some(pool) = pool.upgrade() else {
                    break;
                };
                let swept = pool.sweep_idle().await;
                if swept > 0 {
                    debug!("Idle sweep closed {} connections", swept);
                }
            }
            trace!("Idle sweeper stopped");
        })
    }

    /// Write all of `data` across as many connections as the ceiling requires
    pub async fn write_all(&self, data: &[u8], deadline: Option<Instant>) -> Result<(), PartialWrite> {
        let mut sent = 0;
        while sent < data.len() {
            let slot = self
                .writable_slot()
                .await
                .map_err(|e| PartialWrite::new(sent, e))?;
            let room = self.capacity(&slot).min((data.len() - sent) as u64) as usize;

            if let Err(e) = slot.write(&data[sent..sent + room], deadline).await {
                if matches!(e.source, StreamError::Io(_)) {
                    warn!("Write on connection #{} failed: {}", slot.id, e.source);
                    self.discard(slot.id).await;
                }
                return Err(PartialWrite::new(sent + e.flushed, e.source));
            }
            trace!("Connection #{}: {} bytes used", slot.id, slot.usage());
            sent += room;
        }
        Ok(())
    }

    /// Close every connection; later reads and writes see end of stream
    pub async fn close(&self) {
        self.cancel.cancel();
        let mut state = self.state.lock().await;
        if state.phase == PoolPhase::Closed {
            return;
        }
        state.phase = PoolPhase::Closed;
        self.clear_current(&mut state);

        let slots = std::mem::take(&mut state.slots);
        for slot in &slots {
            slot.close().await;
        }
        info!("Connection pool closed ({} connections)", slots.len());
    }

    pub async fn stats(&self) -> PoolStats {
        let state = self.state.lock().await;
        let now = Instant::now();
        PoolStats {
            phase: state.phase,
            ceiling: self.ceiling,
            threshold: self.threshold,
            current: state.current,
            slots: state
                .slots
                .iter()
                .map(|s| SlotStats {
                    id: s.id,
                    bytes_written: s.bytes_written(),
                    bytes_read: s.bytes_read(),
                    age: now.saturating_duration_since(s.created),
                    idle: s.idle_for(now),
                    current: state.current == Some(s.id),
                })
                .collect(),
            dials: self.counters.dials.load(Ordering::Relaxed),
            rotations: self.counters.rotations.load(Ordering::Relaxed),
            reuses: self.counters.reuses.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            swept: self.counters.swept.load(Ordering::Relaxed),
        }
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Fragment sink spreading each fragment over the pool
pub struct PoolSink<'a> {
    pool: &'a ConnectionPool,
    deadline: Option<Instant>,
}

impl<'a> PoolSink<'a> {
    pub fn new(pool: &'a ConnectionPool, deadline: Option<Instant>) -> Self {
        Self { pool, deadline }
    }
}

#[async_trait]
impl<'a> FragmentSink for PoolSink<'a> {
    async fn send(&mut self, data: &[u8]) -> Result<(), PartialWrite> {
        self.pool.write_all(data, self.deadline).await
    }
}

/// Per-connection reader feeding the shared event queue
async fn read_loop(
    slot: Arc<ConnectionSlot>,
    mut reader: ReadHalf<BoxedConnection>,
    events: mpsc::Sender<ReadEvent>,
    mut stripper: Option<BannerStripper>,
    live: Arc<AtomicUsize>,
    pool_cancel: CancellationToken,
) {
    let id = slot.id;
    let mut buf = BytesMut::with_capacity(READ_CHUNK);

    let terminal = loop {
        buf.reserve(READ_CHUNK);
        let result = tokio::select! {
            _ = slot.cancel.cancelled() => break Some(ReadEvent::Eof { slot: id }),
            result = reader.read_buf(&mut buf) => result,
        };

        let data = match result {
            Ok(0) => {
                debug!("Connection #{} closed by peer", id);
                let rest = stripper.as_mut().map(|s| s.finish()).unwrap_or_default();
                if !rest.is_empty()
                    && events.send(ReadEvent::Data { slot: id, data: rest }).await.is_err()
                {
                    break None;
                }
                break Some(ReadEvent::Eof { slot: id });
            }
            Ok(n) => {
                slot.bytes_read.fetch_add(n as u64, Ordering::Relaxed);
                slot.touch();
                let chunk = buf.split().freeze();
                match stripper.as_mut() {
                    Some(s) => s.feed(chunk),
                    None => chunk,
                }
            }
            Err(e) => {
                debug!("Read on connection #{} failed: {}", id, e);
                break Some(ReadEvent::Failed { slot: id, error: e });
            }
        };

        if data.is_empty() {
            continue;
        }
        let sent = tokio::select! {
            _ = slot.cancel.cancelled() => break Some(ReadEvent::Eof { slot: id }),
            result = events.send(ReadEvent::Data { slot: id, data }) => result,
        };
        if sent.is_err() {
            // Stream dropped its receiver
            break None;
        }
    };

    slot.read_done.store(true, Ordering::Release);
    live.fetch_sub(1, Ordering::AcqRel);
    if let Some(terminal) = terminal {
        tokio::select! {
            _ = pool_cancel.cancelled() => {}
            result = events.send(terminal) => {
                if result.is_err() {
                    trace!("No receiver for connection #{} end of stream", id);
                }
            }
        }
    }
    trace!("Reader for connection #{} stopped", id);
}
