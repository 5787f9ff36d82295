//! Device seams between the call pipeline and the audio hardware.
//!
//! The pipeline only sees these traits. `AlsaBackend` is the real
//! implementation; tests use in-memory fakes.

use anyhow::Result;

use crate::error::CallError;

use super::{CHANNELS, FRAME_SAMPLES, SAMPLE_RATE};

/// Fixed device format for the call path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u32,
    /// Frame size in samples per channel
    pub frame_samples: usize,
}

impl AudioFormat {
    /// 8 kHz mono 16-bit with 20 ms frames.
    pub const fn voice() -> Self {
        Self {
            sample_rate: SAMPLE_RATE,
            channels: CHANNELS,
            frame_samples: FRAME_SAMPLES,
        }
    }

    /// Bytes in one linear PCM16 frame.
    pub fn frame_bytes(&self) -> usize {
        self.frame_samples * self.channels as usize * 2
    }
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self::voice()
    }
}

/// A microphone opened at `AudioFormat`.
///
/// Dropping the source releases the device.
pub trait PcmSource: Send {
    /// Read little-endian PCM16 bytes into `buf`, returning the byte count.
    /// A count below `buf.len()` is an underrun.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Try to bring the device back after a read error.
    fn recover(&mut self) -> Result<()> {
        Ok(())
    }
}

/// A speaker opened at `AudioFormat`.
///
/// Dropping the sink releases the device.
pub trait PcmSink: Send {
    /// Write little-endian PCM16 bytes.
    fn write(&mut self, pcm: &[u8]) -> Result<()>;

    /// Discard audio queued in the device but not yet played.
    fn flush(&mut self) -> Result<()>;

    fn pause(&mut self) -> Result<()>;

    fn stop(&mut self) -> Result<()>;

    /// Raise the output to full volume.
    fn set_max_volume(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Opens devices for a call.
pub trait AudioBackend: Send + Sync {
    fn open_input(&self, format: &AudioFormat) -> Result<Box<dyn PcmSource>, CallError>;

    fn open_output(&self, format: &AudioFormat) -> Result<Box<dyn PcmSink>, CallError>;
}
