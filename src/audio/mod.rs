//! Microphone sampling and windowed noise-level measurement.
//!
//! The monitor opens one mono 16-bit 44.1 kHz input, reads fixed-size blocks on
//! a dedicated thread, and publishes one decibel reading per averaging window.
//! Window closing is checked once per block read, so the effective window is
//! the requested duration rounded up to a whole number of blocks (~145 ms each).

/// Sample rate the monitor opens the input at.
pub const SAMPLE_RATE_HZ: u32 = 44_100;

/// Mono input.
pub const CHANNELS: u16 = 1;

/// Samples consumed per read (~145 ms at 44.1 kHz).
pub const BLOCK_SAMPLES: usize = 6_400;

/// Device-side buffer requested when opening the input.
pub const INPUT_BUFFER_SAMPLES: usize = 12_800;

mod level;
mod mic;
mod monitor;
mod source;
mod synthetic;

pub use level::{level_db, LevelMeter, WindowAccumulator};
pub use mic::{list_input_devices, MicSource};
pub use monitor::{MonitorError, MonitorStats, NoiseLevelMonitor};
pub use source::{AudioSource, InputSpec, InputStream};
pub use synthetic::SyntheticSource;
