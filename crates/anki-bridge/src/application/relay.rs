//! Notification relay: vehicle → SDK.
//!
//! Each connected vehicle gets one relay.  The relay is split in two halves so
//! the Bluetooth stack's delivery path never waits on a TCP socket:
//!
//! ```text
//!  BLE stack thread                 tokio task
//!  ────────────────                 ──────────
//!  callback(bytes) ──try_send──▶ [bounded queue] ──▶ worker ──▶ FrameSink
//!                     (drop if full)                  (write timeout)
//! ```
//!
//! A slow or dead peer therefore fills that one device's queue and loses
//! notifications for it, but never stalls the radio or another vehicle.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use anki_core::{DeviceAddress, Response};

use super::transport::NotificationCallback;

// ── Outbound sink ─────────────────────────────────────────────────────────────

/// Errors raised while writing a frame to the SDK.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("peer write failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("peer write timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("session writer closed after an earlier failed write")]
    Closed,
}

/// Destination for outbound frames, one per TCP session.
///
/// Implementations must serialize concurrent `send` calls so frames are never
/// interleaved on the wire.
#[async_trait]
pub trait FrameSink: Send + Sync + 'static {
    async fn send(&self, response: &Response) -> Result<(), SinkError>;
}

// ── Relay ─────────────────────────────────────────────────────────────────────

/// Spawns the per-device relay worker.
pub struct NotificationRelay;

impl NotificationRelay {
    /// Starts a relay for `address` that writes to `sink`.
    ///
    /// Returns the callback to register with the notify characteristic and
    /// the worker's handle.  The worker ends when the callback (and with it the
    /// queue's sender) is dropped, when the sink reports it is closed, or when
    /// the handle is aborted.
    ///
    /// `queue_depth` is clamped to at least 1.
    pub fn spawn(
        address: DeviceAddress,
        sink: Arc<dyn FrameSink>,
        queue_depth: usize,
    ) -> (NotificationCallback, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(queue_depth.max(1));

        let worker_address = address.clone();
        let worker = tokio::spawn(async move {
            while let Some(payload) = rx.recv().await {
                debug!(
                    "notification from {worker_address}: {}",
                    hex::encode(&payload)
                );
                let frame = Response::Notification {
                    address: worker_address.clone(),
                    payload,
                };
                match sink.send(&frame).await {
                    Ok(()) => {}
                    Err(SinkError::Closed) => {
                        debug!("relay {worker_address}: session writer closed");
                        break;
                    }
                    Err(e) => warn!("relay {worker_address}: dropping notification: {e}"),
                }
            }
            debug!("relay {worker_address} stopped");
        });

        let callback: NotificationCallback = Arc::new(move |payload: Vec<u8>| {
            match tx.try_send(payload) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!("relay {address}: queue full, dropping notification");
                }
                Err(TrySendError::Closed(_)) => {
                    debug!("relay {address}: worker gone, dropping notification");
                }
            }
        });

        (callback, worker)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
