//! ALSA PCM device wrappers for call capture and playback.

use alsa::mixer::{Mixer, SelemId};
use alsa::pcm::{Access, Format, HwParams, State, PCM};
use alsa::{Direction, ValueOr};
use anyhow::{Context, Result};

use crate::config::Config;
use crate::error::CallError;

use super::device::{AudioBackend, AudioFormat, PcmSink, PcmSource};

/// Playback gives up on a chunk after this many XRUN recoveries in a row.
const MAX_WRITE_RECOVERIES: u32 = 3;

/// Parameters negotiated with the ALSA hardware.
#[derive(Debug, Clone)]
pub struct AlsaParams {
    pub sample_rate: u32,
    pub channels: u32,
    /// Period size in frames
    pub period_size: usize,
    /// Ring buffer size in frames
    pub buffer_size: usize,
}

/// Opens ALSA devices named in the configuration.
#[derive(Debug, Clone)]
pub struct AlsaBackend {
    /// Capture PCM (e.g. "default", or a plug with echo cancellation)
    pub capture_device: String,
    pub playback_device: String,
    /// Playback buffer size as a multiple of the minimum period
    pub buffer_multiplier: u32,
    pub mixer_card: String,
    pub mixer_control: String,
}

impl AlsaBackend {
    pub fn from_config(config: &Config) -> Self {
        Self {
            capture_device: config.capture_device.to_string(),
            playback_device: config.playback_device.to_string(),
            buffer_multiplier: config.buffer_multiplier.max(1),
            mixer_card: config.mixer_card.to_string(),
            mixer_control: config.mixer_control.to_string(),
        }
    }
}

impl AudioBackend for AlsaBackend {
    fn open_input(&self, format: &AudioFormat) -> Result<Box<dyn PcmSource>, CallError> {
        let (pcm, params) = open_pcm(&self.capture_device, Direction::Capture, format, None)
            .map_err(|e| CallError::DeviceUnavailable(format!("{:#}", e)))?;
        Ok(Box::new(AlsaCapture {
            pcm,
            samples: vec![0i16; format.frame_samples * params.channels as usize],
        }))
    }

    fn open_output(&self, format: &AudioFormat) -> Result<Box<dyn PcmSink>, CallError> {
        let (pcm, _params) = open_pcm(
            &self.playback_device,
            Direction::Playback,
            format,
            Some(self.buffer_multiplier),
        )
        .map_err(|e| CallError::DeviceUnavailable(format!("{:#}", e)))?;
        Ok(Box::new(AlsaPlayback {
            pcm,
            mixer_card: self.mixer_card.clone(),
            mixer_control: self.mixer_control.clone(),
        }))
    }
}

fn open_pcm(
    device: &str,
    direction: Direction,
    format: &AudioFormat,
    buffer_multiplier: Option<u32>,
) -> Result<(PCM, AlsaParams)> {
    let dir_name = match direction {
        Direction::Capture => "Capture",
        Direction::Playback => "Playback",
    };

    let pcm = PCM::new(device, direction, false)
        .with_context(|| format!("Failed to open PCM device '{}' for {}", device, dir_name))?;

    {
        let hwp = HwParams::any(&pcm).with_context(|| "Failed to initialize HwParams")?;
        hwp.set_access(Access::RWInterleaved)?;
        hwp.set_format(Format::S16LE)?;
        hwp.set_channels(format.channels)?;
        hwp.set_rate(format.sample_rate, ValueOr::Nearest)
            .with_context(|| format!("{} Hz not supported by '{}'", format.sample_rate, device))?;
        hwp.set_period_size_near(format.frame_samples as alsa::pcm::Frames, ValueOr::Nearest)?;
        if let Some(multiplier) = buffer_multiplier {
            // Several minimum periods of headroom to absorb network jitter
            let min_period = hwp.get_period_size_min()?.max(format.frame_samples as alsa::pcm::Frames);
            hwp.set_buffer_size_near(min_period * multiplier as alsa::pcm::Frames)?;
        }
        pcm.hw_params(&hwp)?;
    }

    let params = {
        let hwp = pcm.hw_params_current()?;
        AlsaParams {
            sample_rate: hwp.get_rate()?,
            channels: hwp.get_channels()?,
            period_size: hwp.get_period_size()? as usize,
            buffer_size: hwp.get_buffer_size()? as usize,
        }
    };

    if params.sample_rate != format.sample_rate || params.channels != format.channels {
        anyhow::bail!(
            "'{}' negotiated {} Hz/{} ch, need {} Hz/{} ch",
            device,
            params.sample_rate,
            params.channels,
            format.sample_rate,
            format.channels
        );
    }

    if pcm.state() != State::Prepared {
        anyhow::bail!("'{}' did not reach the prepared state: {:?}", device, pcm.state());
    }

    log::info!(
        "ALSA {}: device={}, rate={}, channels={}, period_size={}, buffer_size={}",
        dir_name,
        device,
        params.sample_rate,
        params.channels,
        params.period_size,
        params.buffer_size,
    );

    Ok((pcm, params))
}

// ======================== Capture ========================

pub struct AlsaCapture {
    pcm: PCM,
    samples: Vec<i16>,
}

impl PcmSource for AlsaCapture {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let wanted = buf.len() / 2;
        if self.samples.len() < wanted {
            self.samples.resize(wanted, 0);
        }

        let io = self.pcm.io_i16()?;
        let frames = io.readi(&mut self.samples[..wanted])?;

        for (dst, sample) in buf.chunks_exact_mut(2).zip(&self.samples[..frames]) {
            dst.copy_from_slice(&sample.to_le_bytes());
        }
        Ok(frames * 2)
    }

    fn recover(&mut self) -> Result<()> {
        self.pcm.prepare()?;
        Ok(())
    }
}

impl Drop for AlsaCapture {
    fn drop(&mut self) {
        if let Err(e) = self.pcm.drop() {
            log::warn!("Failed to stop capture PCM: {}", e);
        }
        log::info!("Capture device released");
    }
}

// ======================== Playback ========================

pub struct AlsaPlayback {
    pcm: PCM,
    mixer_card: String,
    mixer_control: String,
}

impl PcmSink for AlsaPlayback {
    fn write(&mut self, pcm_bytes: &[u8]) -> Result<()> {
        let samples: Vec<i16> = pcm_bytes
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect();
        if samples.is_empty() {
            return Ok(());
        }

        if self.pcm.state() == State::Paused {
            self.pcm.pause(false)?;
        }

        let io = self.pcm.io_i16()?;
        let total_frames = samples.len();
        let mut frames_written = 0;
        let mut retry_count = 0u32;

        // Retry short writes and XRUNs without losing frames
        while frames_written < total_frames {
            match io.writei(&samples[frames_written..]) {
                Ok(n) => {
                    frames_written += n;
                    retry_count = 0;
                }
                Err(e) => {
                    log::warn!("ALSA XRUN or error: {}, recovering...", e);
                    retry_count += 1;
                    self.pcm
                        .prepare()
                        .with_context(|| "Failed to recover PCM playback")?;

                    if retry_count >= MAX_WRITE_RECOVERIES {
                        anyhow::bail!(
                            "Max recovery retries ({}) reached, dropped {} frames",
                            retry_count,
                            total_frames - frames_written
                        );
                    }
                }
            }
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.pcm.drop()?;
        self.pcm.prepare()?;
        Ok(())
    }

    fn pause(&mut self) -> Result<()> {
        if self.pcm.state() == State::Running {
            self.pcm.pause(true)?;
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.pcm.drop()?;
        Ok(())
    }

    fn set_max_volume(&mut self) -> Result<()> {
        let mixer = Mixer::new(&self.mixer_card, false)
            .with_context(|| format!("Failed to open mixer '{}'", self.mixer_card))?;
        let selem_id = SelemId::new(&self.mixer_control, 0);
        let selem = mixer
            .find_selem(&selem_id)
            .with_context(|| format!("Mixer control '{}' not found", self.mixer_control))?;
        let (_min, max) = selem.get_playback_volume_range();
        selem.set_playback_volume_all(max)?;
        log::info!("Playback volume set to max ({}) on '{}'", max, self.mixer_control);
        Ok(())
    }
}

impl Drop for AlsaPlayback {
    fn drop(&mut self) {
        log::info!("Playback device released");
    }
}
