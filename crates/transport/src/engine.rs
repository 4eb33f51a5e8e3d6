//! Plan execution
//!
//! Fragments go out strictly in offset order, one underlying write each,
//! with the planned pause before every fragment. Execution stops at the first
//! failure and reports how many payload bytes reached the sink.

use std::io;

use async_trait::async_trait;
use shroud_protocol::{Classification, ClassificationState};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::config::FragmentConfig;
use crate::error::{ConfigError, PartialWrite, StreamError};
use crate::fragment::{FragmentPlan, Fragmenter};

/// Destination of planned fragments
#[async_trait]
pub trait FragmentSink: Send {
    /// Deliver one fragment completely, or report how much of it went out
    async fn send(&mut self, data: &[u8]) -> Result<(), PartialWrite>;
}

/// Run `plan` over `data`
///
/// `flushed` in the error counts bytes of `data` delivered before the failure.
/// Cancellation cuts any pending pause short and stops the loop with `Closed`.
pub async fn execute<S>(
    plan: &FragmentPlan,
    data: &[u8],
    sink: &mut S,
    cancel: &CancellationToken,
) -> Result<(), PartialWrite>
where
    S: FragmentSink + ?Sized,
{
    for fragment in plan.fragments() {
        if !fragment.delay.is_zero() {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(fragment.delay) => {}
            }
        }
        if cancel.is_cancelled() {
            return Err(PartialWrite::new(fragment.offset, StreamError::Closed));
        }

        trace!(
            "Sending fragment {}..{} after {:?}",
            fragment.offset,
            fragment.end(),
            fragment.delay
        );
        sink.send(fragment.slice(data))
            .await
            .map_err(|e| PartialWrite::new(fragment.offset + e.flushed, e.source))?;
    }
    Ok(())
}

/// `write_all` that keeps count of what was accepted before an error
pub async fn write_counted<W>(
    writer: &mut W,
    data: &[u8],
    deadline: Option<Instant>,
) -> Result<(), PartialWrite>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut written = 0;
    while written < data.len() {
        let result = match deadline {
            Some(at) => match tokio::time::timeout_at(at, writer.write(&data[written..])).await {
                Ok(result) => result,
                Err(_) => return Err(PartialWrite::new(written, StreamError::Timeout)),
            },
            None => writer.write(&data[written..]).await,
        };

        match result {
            Ok(0) => {
                return Err(PartialWrite::new(
                    written,
                    io::Error::from(io::ErrorKind::WriteZero).into(),
                ));
            }
            Ok(n) => written += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(PartialWrite::new(written, e.into())),
        }
    }
    Ok(())
}

/// Sink writing straight into one `AsyncWrite`, flushed after every fragment
struct WriterSink<'a, W: ?Sized> {
    writer: &'a mut W,
    deadline: Option<Instant>,
}

#[async_trait]
impl<'a, W> FragmentSink for WriterSink<'a, W>
where
    W: AsyncWrite + Unpin + Send + ?Sized,
{
    async fn send(&mut self, data: &[u8]) -> Result<(), PartialWrite> {
        write_counted(&mut *self.writer, data, self.deadline).await?;
        self.writer
            .flush()
            .await
            .map_err(|e| PartialWrite::new(data.len(), e.into()))
    }
}

/// Fragmenting writer over a single connection
///
/// Classifies the first payload, then plans and sends each payload through
/// the fragmentation engine. No rotation and no obfuscation.
pub struct FragmentWriter<W> {
    inner: W,
    fragmenter: Fragmenter,
    state: ClassificationState,
    writes: u64,
    write_deadline: Option<Instant>,
    cancel: CancellationToken,
}

impl<W> FragmentWriter<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(inner: W, config: FragmentConfig) -> Result<Self, ConfigError> {
        Ok(Self::with_fragmenter(inner, Fragmenter::new(config)?))
    }

    pub fn with_fragmenter(inner: W, fragmenter: Fragmenter) -> Self {
        Self {
            inner,
            fragmenter,
            state: ClassificationState::new(),
            writes: 0,
            write_deadline: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Token that aborts in-flight and future writes when cancelled
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn set_write_deadline(&mut self, deadline: Option<Instant>) {
        self.write_deadline = deadline;
    }

    pub fn classification(&self) -> Option<Classification> {
        self.state.get()
    }

    /// Number of payloads written so far
    pub fn writes(&self) -> u64 {
        self.writes
    }

    /// Fragment and send one payload
    pub async fn write_payload(&mut self, data: &[u8]) -> Result<usize, PartialWrite> {
        if self.cancel.is_cancelled() {
            return Err(PartialWrite::none(StreamError::Closed));
        }
        if data.is_empty() {
            return Ok(0);
        }

        let class = self.state.observe(data);
        self.writes += 1;
        let plan = self.fragmenter.plan(data, class, self.writes);
        trace!(
            "Write #{} ({}): {} bytes in {} fragments",
            self.writes,
            class,
            data.len(),
            plan.len()
        );

        if let Some(at) = self.write_deadline {
            if Instant::now() >= at {
                return Err(PartialWrite::none(StreamError::Timeout));
            }
        }

        let mut sink = WriterSink {
            writer: &mut self.inner,
            deadline: self.write_deadline,
        };
        execute(&plan, data, &mut sink, &self.cancel).await?;
        Ok(data.len())
    }

    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.cancel.cancel();
        self.inner.shutdown().await
    }

    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.inner
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}
