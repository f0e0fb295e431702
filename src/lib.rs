//! Shared NightShield library exports: microphone noise-level monitoring plus
//! the command bridge that front-ends drive it through.

pub mod audio;
pub mod clock;
pub mod config;
pub mod device;
pub mod ipc;
mod lock;
mod telemetry;

pub use audio::{MonitorError, NoiseLevelMonitor};
pub(crate) use lock::lock_or_recover;
pub use telemetry::{init_tracing, tracing_log_path};
