//! Write half of one SDK session.
//!
//! Several tasks write to the same socket: every dispatch task that replies
//! and every notification relay of the vehicles this session connected.  The
//! write half therefore sits behind an async mutex, and each frame is written
//! and flushed while holding it, so frames never interleave on the wire.
//!
//! A write that fails or times out may have left part of a frame on the wire.
//! Appending the next frame to it would corrupt the SDK's line framing, so
//! the first failure closes the write direction for good and every later
//! frame is refused with [`SinkError::Closed`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, warn};

use anki_core::Response;

use crate::application::relay::{FrameSink, SinkError};

/// [`FrameSink`] over any async writer, with a per-frame write timeout.
pub struct SessionWriter<W> {
    writer: Mutex<W>,
    write_timeout: Duration,
    closed: AtomicBool,
}

impl<W> SessionWriter<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(writer: W, write_timeout: Duration) -> Self {
        Self {
            writer: Mutex::new(writer),
            write_timeout,
            closed: AtomicBool::new(false),
        }
    }

    /// Shuts the write direction down.  Errors are ignored; the peer is
    /// usually already gone when this runs.
    pub async fn shutdown(&self) {
        let mut writer = self.writer.lock().await;
        self.close(&mut *writer).await;
    }

    /// Whether an earlier failure or [`shutdown`](Self::shutdown) closed the
    /// writer.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self, writer: &mut W) {
        self.closed.store(true, Ordering::SeqCst);
        match timeout(self.write_timeout, writer.shutdown()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("session shutdown: {e}"),
            Err(_) => debug!("session shutdown timed out"),
        }
    }
}

#[async_trait]
impl<W> FrameSink for SessionWriter<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    async fn send(&self, response: &Response) -> Result<(), SinkError> {
        let frame = response.encode();
        let mut writer = self.writer.lock().await;
        if self.is_closed() {
            return Err(SinkError::Closed);
        }

        let write = async {
            writer.write_all(frame.as_bytes()).await?;
            writer.flush().await
        };
        let result = match timeout(self.write_timeout, write).await {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(e)) => SinkError::Io(e),
            Err(_) => SinkError::Timeout(self.write_timeout),
        };

        warn!("closing session writer: {result}");
        self.close(&mut *writer).await;
        Err(result)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
