//! Decoder/playback stage.
//!
//! Inbound chunks are queued from the network task and written in order by
//! a dedicated `audio-play` thread, so a blocking device write never stalls
//! the runtime. The sink sits behind a mutex: writes, `flush` and `stop` may
//! come from different threads.

use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::error::CallError;

use super::device::{AudioBackend, AudioFormat, PcmSink};
use super::mulaw;

/// An inbound audio payload, tagged by whoever produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AudioChunk {
    /// µ-law bytes, decoded before writing
    Compressed(Vec<u8>),
    /// Little-endian PCM16, written as is
    Linear(Vec<u8>),
}

impl AudioChunk {
    /// PCM16 bytes ready for the device.
    pub fn into_pcm(self) -> Vec<u8> {
        match self {
            Self::Compressed(ulaw) => mulaw::decode_frame(&ulaw),
            Self::Linear(pcm) => pcm,
        }
    }
}

type SharedSink = Arc<Mutex<Option<Box<dyn PcmSink>>>>;

pub struct Playback {
    sink: SharedSink,
    queue: Mutex<Option<mpsc::Sender<AudioChunk>>>,
}

impl Playback {
    /// Open the output device and start the writer thread.
    ///
    /// * `backend`     - Device provider
    /// * `format`      - Output format (8 kHz mono PCM16 for calls)
    /// * `queue_depth` - Chunks buffered between the network and the writer
    pub fn open(
        backend: &dyn AudioBackend,
        format: &AudioFormat,
        queue_depth: usize,
    ) -> Result<Self, CallError> {
        let mut sink = backend.open_output(format)?;

        // The call is the only audio source while it lasts
        if let Err(e) = sink.set_max_volume() {
            log::warn!("Could not raise playback volume: {:#}", e);
        }

        Self::start(sink, queue_depth)
    }

    /// Start the writer thread over an already opened sink.
    pub fn start(sink: Box<dyn PcmSink>, queue_depth: usize) -> Result<Self, CallError> {
        let sink: SharedSink = Arc::new(Mutex::new(Some(sink)));
        let (tx, rx) = mpsc::channel::<AudioChunk>(queue_depth.max(1));

        let writer_sink = sink.clone();
        thread::Builder::new()
            .name("audio-play".into())
            .spawn(move || play_thread(writer_sink, rx))
            .map_err(|e| CallError::DeviceUnavailable(format!("failed to spawn playback thread: {}", e)))?;

        log::info!("Playback started: queue_depth={}", queue_depth);

        Ok(Self {
            sink,
            queue: Mutex::new(Some(tx)),
        })
    }

    /// Hand a chunk to the writer thread without blocking.
    ///
    /// A full queue drops the chunk: a gap is better than unbounded latency.
    pub fn enqueue(&self, chunk: AudioChunk) {
        let queue = self.queue.lock();
        let Some(tx) = queue.as_ref() else {
            log::debug!("Playback stopped, dropping inbound chunk");
            return;
        };
        match tx.try_send(chunk) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => log::warn!("Playback queue full, dropping chunk"),
            Err(TrySendError::Closed(_)) => log::debug!("Playback writer gone, dropping chunk"),
        }
    }

    /// Decode if needed and write one chunk to the device, bypassing the
    /// queue. Blocks until the device accepts the samples.
    pub fn play_audio(&self, chunk: AudioChunk) {
        write_chunk(&self.sink, chunk);
    }

    /// Discard audio buffered in the device.
    pub fn flush(&self) {
        if let Some(sink) = self.sink.lock().as_mut() {
            if let Err(e) = sink.flush() {
                log::warn!("Playback flush failed: {:#}", e);
            }
        }
    }

    /// Pause, flush, stop and release the device.
    ///
    /// Failures are logged and the remaining steps still run. Safe to call
    /// more than once.
    pub fn stop(&self) {
        // Closing the queue lets the writer thread exit once it drains
        self.queue.lock().take();

        let Some(mut sink) = self.sink.lock().take() else {
            return;
        };

        if let Err(e) = sink.pause() {
            log::warn!("Playback pause failed: {:#}", e);
        }
        if let Err(e) = sink.flush() {
            log::warn!("Playback flush failed: {:#}", e);
        }
        if let Err(e) = sink.stop() {
            log::warn!("Playback stop failed: {:#}", e);
        }
        drop(sink);
        log::info!("Playback stopped");
    }
}

impl Drop for Playback {
    fn drop(&mut self) {
        self.stop();
    }
}

fn write_chunk(sink: &Mutex<Option<Box<dyn PcmSink>>>, chunk: AudioChunk) {
    let pcm = chunk.into_pcm();
    if pcm.is_empty() {
        return;
    }

    let mut guard = sink.lock();
    let Some(sink) = guard.as_mut() else {
        return;
    };
    if let Err(e) = sink.write(&pcm) {
        log::error!("Playback write error: {:#}", e);
    }
}

fn play_thread(sink: SharedSink, mut rx: mpsc::Receiver<AudioChunk>) {
    // Block until a chunk arrives or every sender is gone
    while let Some(chunk) = rx.blocking_recv() {
        write_chunk(&sink, chunk);
    }
    log::info!("Playback channel closed");
}
