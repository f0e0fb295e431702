//! Contract for the platform audio input the monitor samples from.

use super::{MonitorError, CHANNELS, INPUT_BUFFER_SAMPLES, SAMPLE_RATE_HZ};
use anyhow::Result;
use std::time::Duration;

/// Input configuration requested from an [`AudioSource`]. Samples are always
/// delivered as signed 16-bit PCM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputSpec {
    pub sample_rate_hz: u32,
    pub channels: u16,
    pub buffer_samples: usize,
}

impl InputSpec {
    /// Audio duration covered by `samples` frames at this rate.
    pub fn duration_of(&self, samples: usize) -> Duration {
        Duration::from_secs_f64(samples as f64 / f64::from(self.sample_rate_hz.max(1)))
    }
}

impl Default for InputSpec {
    fn default() -> Self {
        Self {
            sample_rate_hz: SAMPLE_RATE_HZ,
            channels: CHANNELS,
            buffer_samples: INPUT_BUFFER_SAMPLES,
        }
    }
}

/// Opens exclusive handles on an audio input device.
///
/// `open` is called on the sampling thread, so returned streams do not need to
/// be `Send`.
pub trait AudioSource: Send + Sync {
    fn open(&self, spec: &InputSpec) -> Result<Box<dyn InputStream>, MonitorError>;
}

/// An open input handle.
pub trait InputStream {
    /// Block until samples are available and copy up to `buf.len()` of them.
    ///
    /// Returns the number written. Zero is a valid (empty) read.
    fn read_block(&mut self, buf: &mut [i16]) -> Result<usize>;

    /// Release the underlying device. Called exactly once.
    fn close(&mut self);
}

/// Owns an open stream and closes it on every exit path, unwinding included.
pub(crate) struct StreamGuard {
    stream: Option<Box<dyn InputStream>>,
}

impl StreamGuard {
    pub(crate) fn new(stream: Box<dyn InputStream>) -> Self {
        Self {
            stream: Some(stream),
        }
    }

    pub(crate) fn read_block(&mut self, buf: &mut [i16]) -> Result<usize> {
        match self.stream.as_mut() {
            Some(stream) => stream.read_block(buf),
            None => Ok(0),
        }
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            stream.close();
            tracing::debug!("audio input released");
        }
    }
}
