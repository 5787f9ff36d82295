//! In-memory devices for tests.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use anyhow::Result;
use parking_lot::Mutex;

use crate::error::CallError;

use super::device::{AudioBackend, AudioFormat, PcmSink, PcmSource};

/// What a fake sink saw, shared with the test.
#[derive(Default)]
pub struct SinkLog {
    pub writes: Mutex<Vec<Vec<u8>>>,
    /// Ordered record of control calls: "flush", "pause", "stop", "volume"
    pub calls: Mutex<Vec<&'static str>>,
    pub released: AtomicBool,
}

impl SinkLog {
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.writes.lock().clone()
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().clone()
    }
}

pub struct FakeSink {
    pub log: Arc<SinkLog>,
    pub fail_controls: bool,
}

impl PcmSink for FakeSink {
    fn write(&mut self, pcm: &[u8]) -> Result<()> {
        self.log.writes.lock().push(pcm.to_vec());
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.log.calls.lock().push("flush");
        if self.fail_controls {
            anyhow::bail!("flush failed");
        }
        Ok(())
    }

    fn pause(&mut self) -> Result<()> {
        self.log.calls.lock().push("pause");
        if self.fail_controls {
            anyhow::bail!("pause failed");
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.log.calls.lock().push("stop");
        if self.fail_controls {
            anyhow::bail!("stop failed");
        }
        Ok(())
    }

    fn set_max_volume(&mut self) -> Result<()> {
        self.log.calls.lock().push("volume");
        Ok(())
    }
}

impl Drop for FakeSink {
    fn drop(&mut self) {
        self.log.released.store(true, Ordering::SeqCst);
    }
}

/// Scripted microphone. Each entry is the byte count the next read returns;
/// once the script runs out every read is a full frame. A broken source
/// fails every read and every recovery.
pub struct FakeSource {
    pub script: VecDeque<usize>,
    pub reads: Arc<AtomicUsize>,
    pub released: Arc<AtomicBool>,
    pub next_sample: i16,
    pub broken: bool,
}

impl PcmSource for FakeSource {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if self.broken {
            anyhow::bail!("input/output error");
        }
        let n = self.script.pop_front().unwrap_or(buf.len()).min(buf.len());
        for chunk in buf[..n].chunks_exact_mut(2) {
            chunk.copy_from_slice(&self.next_sample.to_le_bytes());
        }
        self.next_sample = self.next_sample.wrapping_add(1000);
        Ok(n)
    }

    fn recover(&mut self) -> Result<()> {
        if self.broken {
            anyhow::bail!("device disconnected");
        }
        Ok(())
    }
}

impl Drop for FakeSource {
    fn drop(&mut self) {
        self.released.store(true, Ordering::SeqCst);
    }
}

/// Backend handing out fake devices.
#[derive(Default)]
pub struct FakeBackend {
    pub sink_log: Arc<SinkLog>,
    pub source_reads: Arc<AtomicUsize>,
    pub source_released: Arc<AtomicBool>,
    pub input_opens: AtomicUsize,
    pub output_opens: AtomicUsize,
    pub fail_input: bool,
    pub fail_output: bool,
    pub broken_input: bool,
    pub source_script: Mutex<VecDeque<usize>>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AudioBackend for FakeBackend {
    fn open_input(&self, _format: &AudioFormat) -> Result<Box<dyn PcmSource>, CallError> {
        self.input_opens.fetch_add(1, Ordering::SeqCst);
        if self.fail_input {
            return Err(CallError::DeviceUnavailable("fake microphone missing".into()));
        }
        Ok(Box::new(FakeSource {
            script: std::mem::take(&mut *self.source_script.lock()),
            reads: self.source_reads.clone(),
            released: self.source_released.clone(),
            next_sample: 0,
            broken: self.broken_input,
        }))
    }

    fn open_output(&self, _format: &AudioFormat) -> Result<Box<dyn PcmSink>, CallError> {
        self.output_opens.fetch_add(1, Ordering::SeqCst);
        if self.fail_output {
            return Err(CallError::DeviceUnavailable("fake speaker missing".into()));
        }
        Ok(Box::new(FakeSink {
            log: self.sink_log.clone(),
            fail_controls: false,
        }))
    }
}

/// Poll `cond` until it holds or `timeout` elapses.
pub fn wait_until(timeout: std::time::Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = std::time::Instant::now() + timeout;
    while std::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(std::time::Duration::from_millis(5));
    }
    cond()
}
