//! Capture/encoder stage.
//!
//! Microphone → 20 ms PCM16 frame → µ-law → base64 media envelope → transport.
//! Runs on a dedicated `audio-capture` thread that owns the device, so the
//! device is released on every exit path, panics included.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::error::CallError;
use crate::protocol::MediaEnvelope;

use super::FRAME_DURATION_MS;
use super::device::{AudioBackend, AudioFormat, PcmSource};
use super::mulaw;

/// The capture stage's view of the transport.
pub trait OutboundMedia: Send + Sync {
    /// Best-effort liveness check.
    fn is_connected(&self) -> bool;

    /// Queue one text frame. Never blocks, never fails the caller.
    fn send(&self, text: String);

    /// Stream id announced by the remote side, if any.
    fn stream_sid(&self) -> Option<String> {
        None
    }

    /// The microphone failed for good; capture has stopped.
    fn capture_lost(&self, _reason: String) {}
}

pub struct Capture {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Capture {
    /// Open the microphone and start the read loop.
    ///
    /// * `backend`            - Device provider
    /// * `format`             - Capture format (8 kHz mono PCM16 for calls)
    /// * `permission_granted` - Microphone permission from the UI
    /// * `outbound`           - Where encoded frames go
    pub fn start(
        backend: &dyn AudioBackend,
        format: &AudioFormat,
        permission_granted: bool,
        outbound: Arc<dyn OutboundMedia>,
    ) -> Result<Self, CallError> {
        if !permission_granted {
            log::warn!("Capture refused: microphone permission not granted");
            return Err(CallError::PermissionDenied);
        }

        let source = backend.open_input(format)?;
        let running = Arc::new(AtomicBool::new(true));
        let frame_bytes = format.frame_bytes();

        let handle = {
            let running = running.clone();
            thread::Builder::new()
                .name("audio-capture".into())
                .spawn(move || record_thread(source, frame_bytes, outbound, &running))
                .map_err(|e| CallError::DeviceUnavailable(format!("failed to spawn capture thread: {}", e)))?
        };

        Ok(Self {
            running,
            handle: Some(handle),
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
            && self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Signal the loop to stop and wait for it to release the device.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(h) = self.handle.take() {
            if h.join().is_err() {
                log::error!("Capture thread panicked");
            }
        }
    }
}

impl Drop for Capture {
    fn drop(&mut self) {
        self.stop();
    }
}

fn record_thread(
    mut source: Box<dyn PcmSource>,
    frame_bytes: usize,
    outbound: Arc<dyn OutboundMedia>,
    running: &AtomicBool,
) {
    let frame_period = Duration::from_millis(FRAME_DURATION_MS);
    let mut frame = vec![0u8; frame_bytes];
    let mut next_deadline = Instant::now() + frame_period;
    let mut frames_sent: u64 = 0;
    let mut underruns: u64 = 0;

    log::info!("Recording started: frame_bytes={}", frame_bytes);

    while running.load(Ordering::Relaxed) {
        match source.read(&mut frame) {
            Ok(n) if n == frame_bytes => {
                if outbound.is_connected() {
                    let ulaw = mulaw::encode_frame(&frame);
                    let envelope = MediaEnvelope::media(&ulaw, outbound.stream_sid());
                    outbound.send(envelope.to_json());
                    frames_sent += 1;
                }
            }
            Ok(n) => {
                // Never emit a short frame; retry on the next pass
                underruns += 1;
                log::debug!("Capture underrun: {} of {} bytes", n, frame_bytes);
            }
            Err(e) => {
                log::warn!("Capture read error: {:#}, recovering...", e);
                if let Err(e2) = source.recover() {
                    log::error!("Failed to recover capture device: {:#}", e2);
                    outbound.capture_lost(format!("{:#}", e2));
                    break;
                }
            }
        }

        // Pace to real time: sleep only what is left of this 20 ms slot
        let now = Instant::now();
        if next_deadline > now {
            thread::sleep(next_deadline - now);
            next_deadline += frame_period;
        } else {
            next_deadline = now + frame_period;
        }
    }

    running.store(false, Ordering::SeqCst);
    log::info!(
        "Recording stopped: frames_sent={}, underruns={}",
        frames_sent,
        underruns
    );
    // `source` drops here and releases the microphone
}
