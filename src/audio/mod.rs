//! audio - Call audio capture, playback, and codec
//!
//! Uses ALSA for device I/O and G.711 µ-law for the wire format. Device I/O
//! runs on dedicated OS threads; the network side talks to it through
//! narrow handles only.

pub mod alsa_device;
pub mod capture;
pub mod device;
pub mod mulaw;
pub mod playback;

#[cfg(test)]
pub mod testing;

use std::str::FromStr;

pub use alsa_device::AlsaBackend;
pub use capture::{Capture, OutboundMedia};
pub use device::{AudioBackend, AudioFormat};
pub use playback::{AudioChunk, Playback};

/// Device sample rate in Hz.
pub const SAMPLE_RATE: u32 = 8000;
/// Mono on both directions.
pub const CHANNELS: u32 = 1;
/// Samples per 20 ms frame.
pub const FRAME_SAMPLES: usize = 160;
/// Linear PCM16 bytes per frame.
pub const FRAME_BYTES: usize = FRAME_SAMPLES * 2;
/// µ-law bytes per frame.
pub const COMPRESSED_FRAME_BYTES: usize = FRAME_SAMPLES;
/// Frame cadence in milliseconds.
pub const FRAME_DURATION_MS: u64 = 20;

/// How binary websocket frames from the media server are encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryFormat {
    /// Little-endian 16-bit linear PCM, played as is
    Pcm16,
    /// 8-bit µ-law, decoded before playback
    Mulaw,
}

impl FromStr for BinaryFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pcm16" | "pcm" | "linear" => Ok(Self::Pcm16),
            "mulaw" | "ulaw" | "pcmu" => Ok(Self::Mulaw),
            other => Err(format!("Unsupported binary format: {}", other)),
        }
    }
}

impl BinaryFormat {
    /// Tag a binary payload according to the configured format.
    pub fn tag(self, data: Vec<u8>) -> AudioChunk {
        match self {
            Self::Pcm16 => AudioChunk::Linear(data),
            Self::Mulaw => AudioChunk::Compressed(data),
        }
    }
}
