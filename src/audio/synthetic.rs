//! Constant-amplitude input for headless runs and end-to-end tests.

use super::source::{AudioSource, InputSpec, InputStream};
use super::MonitorError;
use anyhow::Result;
use std::thread;
use std::time::Duration;

/// Square wave at a fixed amplitude, paced to real time.
///
/// Every sample has magnitude `|amplitude|`, so each closed window reads
/// `10 * log10(|amplitude|)` dB (or 0.0 for a zero amplitude).
#[derive(Debug, Clone, Copy)]
pub struct SyntheticSource {
    amplitude: i16,
    paced: bool,
}

impl SyntheticSource {
    pub fn new(amplitude: i16) -> Self {
        Self {
            amplitude,
            paced: true,
        }
    }

    /// Deliver blocks as fast as they are read instead of at the audio rate.
    #[must_use]
    pub fn unpaced(mut self) -> Self {
        self.paced = false;
        self
    }
}

impl AudioSource for SyntheticSource {
    fn open(&self, spec: &InputSpec) -> Result<Box<dyn InputStream>, MonitorError> {
        tracing::debug!(amplitude = self.amplitude, "synthetic input opened");
        Ok(Box::new(SyntheticStream {
            amplitude: self.amplitude,
            pace: self.paced.then_some(*spec),
            phase: false,
        }))
    }
}

struct SyntheticStream {
    amplitude: i16,
    pace: Option<InputSpec>,
    phase: bool,
}

impl InputStream for SyntheticStream {
    fn read_block(&mut self, buf: &mut [i16]) -> Result<usize> {
        if let Some(spec) = self.pace {
            thread::sleep(spec.duration_of(buf.len()));
        }
        let negative = self.amplitude.saturating_neg();
        for sample in buf.iter_mut() {
            *sample = if self.phase { negative } else { self.amplitude };
            self.phase = !self.phase;
        }
        Ok(buf.len())
    }

    fn close(&mut self) {
        tracing::debug!("synthetic input closed");
    }
}
