//! NightShield entry point: JSON command bridge on stdio, or a terminal level meter.

use anyhow::{Context, Result};
use nightshield::audio::{list_input_devices, AudioSource, MicSource, SyntheticSource};
use nightshield::config::AppConfig;
use nightshield::device::HeadlessDevice;
use nightshield::ipc::{run_ipc_mode, BridgeSession};
use nightshield::{init_tracing, NoiseLevelMonitor};
use std::io::{self, Write};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const METER_POLL_MS: u64 = 20;

fn main() -> Result<()> {
    let config = AppConfig::load()?;

    if config.list_input_devices {
        print_input_devices();
        return Ok(());
    }

    config.validate()?;
    init_tracing(&config);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "nightshield started");

    let monitor = NoiseLevelMonitor::new(build_source(&config))
        .with_stop_timeout(Duration::from_millis(config.stop_timeout_ms));

    let result = if config.meter {
        run_meter(&monitor, &config)
    } else {
        let mut session = BridgeSession::new(Arc::new(monitor), Box::new(HeadlessDevice::new()));
        run_ipc_mode(&mut session)
    };

    if let Err(ref err) = result {
        tracing::error!(error = %format!("{err:#}"), "nightshield exiting with error");
    }
    result
}

fn print_input_devices() {
    match list_input_devices() {
        Ok(devices) if devices.is_empty() => println!("No audio input devices detected."),
        Ok(devices) => {
            println!("Available audio input devices:");
            for name in devices {
                println!("  - {name}");
            }
        }
        Err(err) => eprintln!("Failed to list audio input devices: {err:#}"),
    }
}

fn build_source(config: &AppConfig) -> Arc<dyn AudioSource> {
    match config.synthetic_level {
        Some(amplitude) => Arc::new(SyntheticSource::new(amplitude)),
        None => Arc::new(MicSource::new(config.input_device.as_deref())),
    }
}

/// Print one line per closed window until `--meter-secs` elapses.
fn run_meter(monitor: &NoiseLevelMonitor, config: &AppConfig) -> Result<()> {
    monitor
        .start(config.window_ms)
        .context("failed to start noise monitor")?;
    println!(
        "Sampling noise level every {} ms for {} s",
        config.window_ms, config.meter_secs
    );

    let deadline = Instant::now()
        .checked_add(Duration::from_secs(config.meter_secs))
        .context("--meter-secs is out of range")?;
    let mut windows_seen = 0;
    let mut stdout = io::stdout();
    while Instant::now() < deadline {
        if !monitor.is_listening() {
            eprintln!("Audio input stopped unexpectedly");
            break;
        }
        let windows_closed = monitor.stats().windows_closed;
        if windows_closed != windows_seen {
            windows_seen = windows_closed;
            writeln!(stdout, "{:>7.1} dB", monitor.current_level())
                .and_then(|()| stdout.flush())
                .context("failed to write meter output")?;
        }
        thread::sleep(Duration::from_millis(METER_POLL_MS));
    }

    if !monitor.shutdown() {
        tracing::warn!("sampler did not exit after meter run");
    }
    Ok(())
}
