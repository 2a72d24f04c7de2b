//! Time-bounded discovery of Anki vehicles.
//!
//! A scan collects advertisements into a fresh registry for a fixed duration
//! (or until [`DiscoveryEngine::cancel_scan`] is called), then stops the radio
//! and hands the registry back.  Only advertisements whose local name contains
//! the `Drive` marker are kept, and each normalized address is recorded once.
//!
//! # Lifecycle of one scan
//!
//! ```text
//!   scan_lock ─▶ enable (once) ─▶ start_scan(cb) ─▶ sleep | cancel
//!                                                         │
//!            return registry ◀─ stop_scan ◀─ close cb ◀───┘
//! ```
//!
//! The callback is closed before `stop_scan` is called, so an advertisement
//! delivered while the stack is shutting down never reaches the result.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{Mutex, Notify, OnceCell};
use tracing::{debug, info, warn};

use anki_core::domain::device::is_drive_vehicle;
use anki_core::{DeviceAddress, DeviceRecord, Registry};

use super::state::DiscoveredRegistry;
use super::transport::{Advertisement, AdvertisementCallback, Transport, TransportError};

/// Errors that abort a scan before any advertisement is collected.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("could not enable the radio: {0}")]
    Enable(#[source] TransportError),

    #[error("could not start observing: {0}")]
    Start(#[source] TransportError),
}

/// Runs scans against one transport, one at a time.
pub struct DiscoveryEngine<T: Transport> {
    transport: Arc<T>,
    enabled: OnceCell<()>,
    scan_lock: Mutex<()>,
    cancel: Notify,
}

impl<T: Transport> DiscoveryEngine<T> {
    pub fn new(transport: Arc<T>) -> Self {
        Self {
            transport,
            enabled: OnceCell::new(),
            scan_lock: Mutex::new(()),
            cancel: Notify::new(),
        }
    }

    /// Scans for `duration` and returns every vehicle seen.
    ///
    /// Concurrent callers queue behind each other.  The radio is enabled on
    /// the first successful call only; a failed enable is retried by the next
    /// scan.
    ///
    /// # Errors
    ///
    /// [`DiscoveryError`] if the radio cannot be enabled or observation cannot
    /// be started.  Failures while stopping are logged, not returned.
    pub async fn scan(&self, duration: Duration) -> Result<DiscoveredRegistry<T>, DiscoveryError> {
        let _scan = self.scan_lock.lock().await;

        self.enabled
            .get_or_try_init(|| async { self.transport.enable().await })
            .await
            .map_err(DiscoveryError::Enable)?;

        let found: Arc<DiscoveredRegistry<T>> = Arc::new(Registry::new());
        let open = Arc::new(AtomicBool::new(true));
        let callback = collector::<T>(Arc::clone(&found), Arc::clone(&open));

        // Registered before observation starts so a cancel issued right after
        // start_scan returns is not missed.
        let cancelled = self.cancel.notified();
        tokio::pin!(cancelled);
        cancelled.as_mut().enable();

        info!("scanning for vehicles for {duration:?}");
        if let Err(e) = self.transport.start_scan(callback).await {
            open.store(false, Ordering::Release);
            self.stop_observation().await;
            return Err(DiscoveryError::Start(e));
        }

        tokio::select! {
            _ = tokio::time::sleep(duration) => debug!("scan window elapsed"),
            _ = &mut cancelled => info!("scan cancelled"),
        }

        open.store(false, Ordering::Release);
        self.stop_observation().await;

        let devices = Registry::from_entries(found.drain());
        info!("scan finished: {} vehicle(s)", devices.len());
        Ok(devices)
    }

    /// Ends the running scan early.  No effect when no scan is running.
    pub fn cancel_scan(&self) {
        self.cancel.notify_waiters();
    }

    async fn stop_observation(&self) {
        if let Err(e) = self.transport.stop_scan().await {
            warn!("failed to stop scanning: {e}");
        }
    }
}

/// Builds the advertisement callback that fills `found` while `open` is set.
fn collector<T: Transport>(
    found: Arc<DiscoveredRegistry<T>>,
    open: Arc<AtomicBool>,
) -> AdvertisementCallback<T::Peripheral> {
    Arc::new(move |advertisement: Advertisement<T::Peripheral>| {
        if !open.load(Ordering::Acquire) {
            return;
        }
        if !is_drive_vehicle(advertisement.local_name.as_deref()) {
            return;
        }
        let address = match DeviceAddress::normalize(&advertisement.address) {
            Ok(address) => address,
            Err(e) => {
                debug!("ignoring advertisement: {e}");
                return;
            }
        };
        let record = DeviceRecord::from_advertisement(
            address.clone(),
            advertisement.manufacturer_data.as_deref(),
            advertisement.peripheral,
        );
        if found.insert_if_absent(address.clone(), record) {
            info!(
                "found vehicle {address} ({})",
                advertisement.local_name.as_deref().unwrap_or_default()
            );
        }
    })
}

// ── Tests ─────────────────────────────────────────────────────────────────────
