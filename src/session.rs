//! One call's worth of resources: playback, transport and capture.
//!
//! Only one session may hold the audio devices at a time. The slot hands
//! out a lease that frees itself on drop, so a session that fails halfway
//! through startup never leaves the slot taken.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::audio::{AudioBackend, AudioFormat, Capture, Playback};
use crate::error::CallError;
use crate::net_link::{LinkEvent, NetLink, NetLinkOptions};

/// Microphone permission as last reported by the UI.
#[derive(Debug, Default)]
pub struct PermissionGate {
    microphone: AtomicBool,
}

impl PermissionGate {
    pub fn new(granted: bool) -> Self {
        Self {
            microphone: AtomicBool::new(granted),
        }
    }

    pub fn set(&self, granted: bool) {
        let was = self.microphone.swap(granted, Ordering::SeqCst);
        if was != granted {
            log::info!("Microphone permission {}", if granted { "granted" } else { "revoked" });
        }
    }

    pub fn is_granted(&self) -> bool {
        self.microphone.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Default)]
pub struct SessionSlot {
    busy: AtomicBool,
}

impl SessionSlot {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn try_acquire(self: &Arc<Self>) -> Option<SessionLease> {
        self.busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| SessionLease { slot: self.clone() })
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
pub struct SessionLease {
    slot: Arc<SessionSlot>,
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        self.slot.busy.store(false, Ordering::SeqCst);
    }
}

/// Shared inputs for starting sessions.
#[derive(Clone)]
pub struct SessionDeps {
    pub backend: Arc<dyn AudioBackend>,
    pub permission: Arc<PermissionGate>,
    pub slot: Arc<SessionSlot>,
    pub options: NetLinkOptions,
    pub playback_queue: usize,
    pub events: mpsc::Sender<LinkEvent>,
}

pub struct StreamSession {
    id: Uuid,
    link: Arc<NetLink>,
    capture: Option<Capture>,
    lease: Option<SessionLease>,
}

impl StreamSession {
    /// Bring up playback, the connection and capture, in that order.
    ///
    /// Permission is checked before any device is touched. Whatever was
    /// opened before a failure is torn down again.
    pub async fn start(deps: &SessionDeps, url: &str) -> Result<Self, CallError> {
        let lease = deps.slot.try_acquire().ok_or(CallError::SessionBusy)?;
        if !deps.permission.is_granted() {
            log::warn!("Refusing to start call: microphone permission not granted");
            return Err(CallError::PermissionDenied);
        }

        let id = Uuid::new_v4();
        let format = AudioFormat::voice();
        log::info!("Starting session {} to {}", id, url);

        let playback = Arc::new(Playback::open(
            deps.backend.as_ref(),
            &format,
            deps.playback_queue,
        )?);
        let link = Arc::new(NetLink::new(
            id,
            deps.options.clone(),
            playback,
            deps.events.clone(),
        ));

        if let Err(e) = link.connect(url).await {
            link.disconnect().await;
            return Err(e);
        }

        let capture = match Capture::start(
            deps.backend.as_ref(),
            &format,
            deps.permission.is_granted(),
            link.clone(),
        ) {
            Ok(capture) => capture,
            Err(e) => {
                log::error!("Capture failed to start: {}", e);
                link.disconnect().await;
                return Err(e);
            }
        };

        Ok(Self {
            id,
            link,
            capture: Some(capture),
            lease: Some(lease),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn is_connected(&self) -> bool {
        self.link.is_connected()
    }

    /// Stop capture, then playback and the connection. Idempotent.
    pub async fn stop(&mut self) {
        if let Some(mut capture) = self.capture.take() {
            if !capture.is_running() {
                log::warn!("Capture had already stopped before hangup");
            }
            // Joining waits out at most one frame period
            if tokio::task::spawn_blocking(move || capture.stop()).await.is_err() {
                log::error!("Capture shutdown task panicked");
            }
        }
        self.link.disconnect().await;
        if self.lease.take().is_some() {
            log::info!("Session {} ended", self.id);
        }
    }
}
