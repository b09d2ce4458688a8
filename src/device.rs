//! `cpal`-backed device adapter: owns the output stream and, on every
//! callback, asks an `AudioPlaySource` for exactly as many frames as the
//! device wants. Unlike the engine this is grounded on, the play source
//! already owns its own ring buffers and scavenging discipline, so this
//! adapter's only RT-path job is deinterleaving planar channels into the
//! device's sample format.

use crate::error::{PlayCoreError, Result};
use crate::play_source::AudioPlaySource;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, SizedSample};
use std::cell::RefCell;
use std::sync::Arc;

thread_local! {
    static PLANAR_SCRATCH: RefCell<Vec<Vec<f32>>> = RefCell::new(Vec::new());
}

/// Picks the default output device and builds a `cpal::Stream` that pulls
/// from `source` on every callback. The stream must be kept alive (held or
/// stored) for playback to continue; dropping it stops the device.
pub struct CpalDeviceAdapter {
    stream: cpal::Stream,
    sample_rate: u32,
    channel_count: u16,
}

impl CpalDeviceAdapter {
    pub fn new(source: Arc<dyn AudioPlaySource>) -> Result<Self> {
        Self::with_device(source, None)
    }

    /// `device_name` selects a specific output device by its `cpal` name;
    /// `None` uses the host's default output device.
    pub fn with_device(source: Arc<dyn AudioPlaySource>, device_name: Option<&str>) -> Result<Self> {
        let host = cpal::default_host();
        let device = match device_name {
            Some(name) => host
                .output_devices()
                .map_err(|e| PlayCoreError::AudioDevice(format!("failed to enumerate output devices: {e}")))?
                .find(|d| d.name().map(|n| n == name).unwrap_or(false))
                .ok_or_else(|| PlayCoreError::AudioDevice(format!("no output device named {name:?}")))?,
            None => host
                .default_output_device()
                .ok_or_else(|| PlayCoreError::AudioDevice("no default output device available".into()))?,
        };

        let supported = device
            .default_output_config()
            .map_err(|e| PlayCoreError::AudioDevice(format!("failed to get default output config: {e}")))?;
        let sample_rate = supported.sample_rate().0;
        let channel_count = supported.channels();

        log::info!(
            "opening audio output: {} Hz, {} channels, format {:?}",
            sample_rate,
            channel_count,
            supported.sample_format()
        );

        let config = cpal::StreamConfig {
            channels: channel_count,
            sample_rate: cpal::SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let stream = match supported.sample_format() {
            cpal::SampleFormat::F32 => build_stream::<f32>(&device, &config, channel_count, source)?,
            cpal::SampleFormat::I16 => build_stream::<i16>(&device, &config, channel_count, source)?,
            cpal::SampleFormat::U16 => build_stream::<u16>(&device, &config, channel_count, source)?,
            other => {
                return Err(PlayCoreError::AudioFormat(format!("unsupported sample format: {other:?}")));
            }
        };

        Ok(Self { stream, sample_rate, channel_count })
    }

    pub fn play(&self) -> Result<()> {
        self.stream.play().map_err(|e| PlayCoreError::AudioDevice(format!("failed to start stream: {e}")))
    }

    pub fn pause(&self) -> Result<()> {
        self.stream.pause().map_err(|e| PlayCoreError::AudioDevice(format!("failed to pause stream: {e}")))
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channel_count(&self) -> u16 {
        self.channel_count
    }
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    channel_count: u16,
    source: Arc<dyn AudioPlaySource>,
) -> Result<cpal::Stream>
where
    T: SizedSample + FromSample<f32>,
{
    let channels = channel_count as usize;
    let stream = device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                audio_callback::<T>(data, channels, &source);
            },
            move |err| log::error!("audio stream error: {err}"),
            None,
        )
        .map_err(|e| PlayCoreError::AudioDevice(format!("failed to build output stream: {e}")))?;
    Ok(stream)
}

/// The RT callback itself. Pulls planar samples from the play source into a
/// thread-local scratch buffer, then interleaves them into `data`. Never
/// allocates once the scratch buffers have grown to the device's block size.
fn audio_callback<T>(data: &mut [T], channels: usize, source: &Arc<dyn AudioPlaySource>)
where
    T: SizedSample + FromSample<f32>,
{
    if channels == 0 {
        return;
    }
    let frame_count = data.len() / channels;

    PLANAR_SCRATCH.with(|cell| {
        let mut planar = cell.borrow_mut();
        if planar.len() != channels {
            planar.resize(channels, Vec::new());
        }
        for channel in planar.iter_mut() {
            if channel.len() < frame_count {
                channel.resize(frame_count, 0.0);
            }
            channel[..frame_count].fill(0.0);
        }

        let written = source.get_source_samples(&mut planar, frame_count);

        for frame in 0..frame_count {
            for (ch, channel) in planar.iter().enumerate() {
                let sample = if frame < written { channel[frame] } else { 0.0 };
                data[frame * channels + ch] = T::from_sample(sample);
            }
        }
    });
}
