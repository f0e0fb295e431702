//! CPAL-backed microphone input.
//!
//! The CPAL callback runs on a realtime audio thread, so it only converts
//! samples to mono i16 and hands chunks over a bounded channel. The sampler
//! thread reassembles them into fixed-size blocks.

use super::source::{AudioSource, InputSpec, InputStream};
use super::MonitorError;
use anyhow::{anyhow, bail, Context, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use std::time::Duration;

const CHUNK_QUEUE_CAPACITY: usize = 64;
const READ_STALL_TIMEOUT_MS: u64 = 2000;

/// Names of the input devices the default host can see.
pub fn list_input_devices() -> Result<Vec<String>> {
    let host = cpal::default_host();
    let devices = host
        .input_devices()
        .context("failed to enumerate input devices")?;
    Ok(devices.filter_map(|device| device.name().ok()).collect())
}

/// Opens the default (or a named) microphone.
#[derive(Debug, Clone, Default)]
pub struct MicSource {
    device_name: Option<String>,
}

impl MicSource {
    pub fn new(device_name: Option<&str>) -> Self {
        Self {
            device_name: device_name.map(str::to_string),
        }
    }

    fn resolve_device(&self) -> Result<cpal::Device> {
        let host = cpal::default_host();
        match self.device_name.as_deref() {
            Some(name) => host
                .input_devices()
                .context("failed to enumerate input devices")?
                .find(|device| device.name().map(|n| n == name).unwrap_or(false))
                .ok_or_else(|| anyhow!("input device '{name}' not found")),
            None => host
                .default_input_device()
                .ok_or_else(|| anyhow!("no default input device available")),
        }
    }

    fn open_stream(&self, spec: &InputSpec) -> Result<MicStream> {
        let device = self.resolve_device()?;
        let device_label = device.name().unwrap_or_else(|_| "unknown".to_string());
        let device_config = device
            .default_input_config()
            .context("failed to query input config")?;
        let format = device_config.sample_format();
        // Capture at the device's native channel count and downmix to mono here.
        let config = stream_config(spec, device_config.channels());
        let channels = usize::from(config.channels);
        let (chunk_tx, chunk_rx) = bounded(CHUNK_QUEUE_CAPACITY);

        let stream = match format {
            cpal::SampleFormat::I16 => {
                build_stream::<i16>(&device, &config, channels, chunk_tx, |sample| sample)?
            }
            cpal::SampleFormat::F32 => {
                build_stream::<f32>(&device, &config, channels, chunk_tx, f32_to_i16)?
            }
            other => bail!("unsupported input sample format {other:?}"),
        };
        stream.play().context("failed to start input stream")?;
        tracing::debug!(
            device = %device_label,
            sample_rate = spec.sample_rate_hz,
            "microphone opened"
        );

        Ok(MicStream {
            stream: Some(stream),
            chunks: chunk_rx,
            pending: Vec::new(),
            pending_offset: 0,
        })
    }
}

impl AudioSource for MicSource {
    fn open(&self, spec: &InputSpec) -> Result<Box<dyn InputStream>, MonitorError> {
        self.open_stream(spec)
            .map(|stream| Box::new(stream) as Box<dyn InputStream>)
            .map_err(|err| MonitorError::ResourceUnavailable(format!("{err:#}")))
    }
}

fn stream_config(spec: &InputSpec, device_channels: u16) -> cpal::StreamConfig {
    cpal::StreamConfig {
        channels: device_channels.max(1),
        sample_rate: cpal::SampleRate(spec.sample_rate_hz),
        buffer_size: cpal::BufferSize::Default,
    }
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    channels: usize,
    chunk_tx: Sender<Vec<i16>>,
    convert: fn(T) -> i16,
) -> Result<cpal::Stream>
where
    T: cpal::SizedSample + Send + 'static,
{
    let stream = device.build_input_stream(
        config,
        move |data: &[T], _info: &cpal::InputCallbackInfo| {
            let chunk = downmix(data, channels, convert);
            // Reader fell behind: drop rather than block the audio callback.
            let _ = chunk_tx.try_send(chunk);
        },
        |err| tracing::warn!(%err, "input stream error"),
        None,
    )?;
    Ok(stream)
}

fn downmix<T: Copy>(data: &[T], channels: usize, convert: fn(T) -> i16) -> Vec<i16> {
    if channels <= 1 {
        return data.iter().map(|&sample| convert(sample)).collect();
    }
    data.chunks(channels)
        .map(|frame| {
            let sum: i32 = frame.iter().map(|&sample| i32::from(convert(sample))).sum();
            (sum / frame.len() as i32) as i16
        })
        .collect()
}

fn f32_to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * f32::from(i16::MAX)) as i16
}

struct MicStream {
    stream: Option<cpal::Stream>,
    chunks: Receiver<Vec<i16>>,
    pending: Vec<i16>,
    pending_offset: usize,
}

impl InputStream for MicStream {
    fn read_block(&mut self, buf: &mut [i16]) -> Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            if self.pending_offset >= self.pending.len() {
                match self
                    .chunks
                    .recv_timeout(Duration::from_millis(READ_STALL_TIMEOUT_MS))
                {
                    Ok(chunk) => {
                        self.pending = chunk;
                        self.pending_offset = 0;
                        continue;
                    }
                    Err(RecvTimeoutError::Timeout) if filled > 0 => break,
                    Err(RecvTimeoutError::Timeout) => {
                        bail!("no audio from input device for {READ_STALL_TIMEOUT_MS}ms")
                    }
                    Err(RecvTimeoutError::Disconnected) => bail!("input stream closed"),
                }
            }
            let available = &self.pending[self.pending_offset..];
            let take = available.len().min(buf.len() - filled);
            buf[filled..filled + take].copy_from_slice(&available[..take]);
            self.pending_offset += take;
            filled += take;
        }
        Ok(filled)
    }

    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            if let Err(err) = stream.pause() {
                tracing::debug!(%err, "failed to pause input stream before release");
            }
        }
        self.pending.clear();
    }
}
