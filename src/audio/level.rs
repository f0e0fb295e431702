//! Windowed decibel computation over absolute sample magnitudes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Upper bound on the magnitude buffer reserved up front (10 s of mono audio).
/// Longer windows still grow on demand.
const MAX_RESERVED_SAMPLES: usize = 441_000;

/// `10 * log10(mean)`, or `0.0` when that is not finite.
///
/// An empty window (`mean` is NaN) and a zero mean (`-inf`) both collapse to
/// `0.0`, so a published level is always finite.
pub fn level_db(mean: f64) -> f64 {
    let db = 10.0 * mean.log10();
    if db.is_finite() {
        db
    } else {
        0.0
    }
}

/// Magnitudes collected during the current averaging window.
#[derive(Debug, Default)]
pub struct WindowAccumulator {
    magnitudes: Vec<f64>,
}

impl WindowAccumulator {
    /// Reserve room for `expected_samples`, clamped to a sane ceiling.
    pub fn with_expected_samples(expected_samples: usize) -> Self {
        Self {
            magnitudes: Vec::with_capacity(expected_samples.min(MAX_RESERVED_SAMPLES)),
        }
    }

    /// Append `|s|` for every non-zero sample. Returns how many exact zeros
    /// were skipped.
    pub fn push_block(&mut self, samples: &[i16]) -> usize {
        let before = self.magnitudes.len();
        self.magnitudes.extend(
            samples
                .iter()
                .filter(|&&sample| sample != 0)
                .map(|&sample| f64::from(sample).abs()),
        );
        samples.len() - (self.magnitudes.len() - before)
    }

    pub fn len(&self) -> usize {
        self.magnitudes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.magnitudes.is_empty()
    }

    /// Compute the window's level and clear it for the next window.
    pub fn close_window(&mut self) -> f64 {
        let sum: f64 = self.magnitudes.iter().sum();
        let mean = sum / self.magnitudes.len() as f64;
        self.magnitudes.clear();
        level_db(mean)
    }
}

/// Lock-free published level shared between the sampler and any readers.
///
/// The f64 is stored as raw bits so a reader never sees a torn value.
#[derive(Clone, Debug)]
pub struct LevelMeter {
    level_bits: Arc<AtomicU64>,
}

impl LevelMeter {
    pub fn new() -> Self {
        Self {
            level_bits: Arc::new(AtomicU64::new(0.0f64.to_bits())),
        }
    }

    /// Publish a new reading. Non-finite input is stored as `0.0`.
    pub fn publish(&self, db: f64) {
        let db = if db.is_finite() { db } else { 0.0 };
        self.level_bits.store(db.to_bits(), Ordering::Release);
    }

    pub fn level_db(&self) -> f64 {
        f64::from_bits(self.level_bits.load(Ordering::Acquire))
    }
}

impl Default for LevelMeter {
    fn default() -> Self {
        Self::new()
    }
}
