//! SSH banner masking
//!
//! A masked connection opens like an SSH session: the client sends an
//! OpenSSH identification line, and the first line the peer sends back is
//! dropped before any payload is delivered.

use std::io;

use bytes::{Bytes, BytesMut};
use shroud_obfuscation::DelayRange;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::trace;

/// Identification line sent on every masked connection
pub const SSH_BANNER: &[u8] = b"SSH-2.0-OpenSSH_8.9p1 Ubuntu-3ubuntu0.1\r\n";

/// Longest peer line treated as a banner
pub const MAX_BANNER_LINE: usize = 255;

/// Pause after the banner, before any payload
pub const BANNER_DELAY: DelayRange = DelayRange::new(10, 50);

/// Send the banner and wait out the post-banner pause
pub async fn send_banner<W>(writer: &mut W) -> io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    writer.write_all(SSH_BANNER).await?;
    writer.flush().await?;
    BANNER_DELAY.sleep().await;
    Ok(())
}

/// Drops the peer's identification line from the head of a read stream
///
/// If no CRLF shows up within `MAX_BANNER_LINE` bytes, nothing is dropped and
/// the buffered bytes pass through.
#[derive(Debug, Default)]
pub struct BannerStripper {
    buf: BytesMut,
    done: bool,
}

impl BannerStripper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the banner has been dealt with
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Feed raw bytes, get back the payload part (possibly empty)
    pub fn feed(&mut self, data: Bytes) -> Bytes {
        if self.done {
            return data;
        }

        self.buf.extend_from_slice(&data);
        let scan = &self.buf[..self.buf.len().min(MAX_BANNER_LINE)];

        if let Some(pos) = scan.windows(2).position(|w| w == b"\r\n") {
            self.done = true;
            trace!("Stripped {}-byte peer banner", pos + 2);
            let mut rest = std::mem::take(&mut self.buf);
            return rest.split_off(pos + 2).freeze();
        }

        if self.buf.len() >= MAX_BANNER_LINE {
            self.done = true;
            trace!("No peer banner within {} bytes", MAX_BANNER_LINE);
            return std::mem::take(&mut self.buf).freeze();
        }

        Bytes::new()
    }

    /// Release anything still held back (at end of stream)
    pub fn finish(&mut self) -> Bytes {
        self.done = true;
        std::mem::take(&mut self.buf).freeze()
    }
}
