//! Clip loading for the sampler path: `ClipMixer` needs exactly one
//! preloaded PCM clip (SparseModel/NoteModel playback with no plugin
//! assigned renders through it), loaded once up front rather than streamed.
//!
//! `ClipAudio` and `DefaultAudioLoader` are the load-once half of that;
//! `BatchResampler`/`StreamingResampler` are the two resampling strategies
//! used elsewhere in the core — `StreamingResampler` backs the device-rate
//! adaptation in `AudioCallbackPlaySource::get_source_samples`, and
//! `BatchResampler` is available for callers who want to conform a clip to
//! a specific native rate ahead of time instead of at load time.

mod batch_resampler;
mod default_loader;
mod load_options;
mod loader;
mod streaming_resampler;

use crate::error::{PlayCoreError, Result};
pub use batch_resampler::BatchResampler;
pub use default_loader::DefaultAudioLoader;
pub use load_options::{ConvertToMono, LoadOptions};
pub use loader::AudioDataLoader;
pub use streaming_resampler::{ResamplerType, StreamingResampler};
use std::sync::Arc;
use std::time::Duration;

/// A single clip's PCM, decoded once and held in memory for the lifetime of
/// the `ClipMixer` that plays it back. Interleaved, like every other sample
/// buffer this core hands between threads.
#[derive(Debug, Clone)]
pub struct ClipAudio {
    inner: Arc<ClipAudioInner>,
}

#[derive(Debug)]
struct ClipAudioInner {
    samples: Vec<f32>,
    sample_rate: u32,
    channels: u16,
    duration: Duration,
    total_frames: usize,
}

impl ClipAudio {
    pub(crate) fn new(samples: Vec<f32>, sample_rate: u32, channels: u16, duration: Duration) -> Self {
        let total_frames = samples.len() / channels.max(1) as usize;
        Self { inner: Arc::new(ClipAudioInner { samples, sample_rate, channels, duration, total_frames }) }
    }

    /// Loads a clip from a file path using the default Symphonia-based loader.
    pub fn from_path(path: &str) -> Result<Arc<Self>> {
        DefaultAudioLoader.load(path, &LoadOptions::default())
    }

    pub fn from_path_with_options(path: &str, options: &LoadOptions) -> Result<Arc<Self>> {
        DefaultAudioLoader.load(path, options)
    }

    pub fn from_path_with_loader<L: AudioDataLoader>(
        path: &str,
        loader: &L,
        options: &LoadOptions,
    ) -> Result<Arc<Self>> {
        loader.load(path, options)
    }

    pub fn sample_rate(&self) -> u32 {
        self.inner.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.inner.channels
    }

    pub fn duration(&self) -> Duration {
        self.inner.duration
    }

    pub fn samples(&self) -> &[f32] {
        &self.inner.samples
    }

    pub fn total_frames(&self) -> usize {
        self.inner.total_frames
    }

    pub fn is_empty(&self) -> bool {
        self.inner.samples.is_empty()
    }

    /// Planar samples for `channel` (0-indexed), the layout `ClipMixer` wants.
    pub fn channel_samples(&self, channel: usize) -> Result<Vec<f32>> {
        if channel >= self.inner.channels as usize {
            return Err(PlayCoreError::AudioFormat(format!(
                "channel {} out of range (max {})",
                channel,
                self.inner.channels.saturating_sub(1)
            )));
        }
        Ok(self
            .inner
            .samples
            .chunks(self.inner.channels as usize)
            .map(|frame| frame[channel])
            .collect())
    }

    /// All channels as planar buffers, in the layout `ClipMixer::new` wants.
    pub fn planar_channels(&self) -> Vec<Vec<f32>> {
        (0..self.inner.channels as usize)
            .map(|c| self.channel_samples(c).expect("channel index in range"))
            .collect()
    }

    /// Conforms this clip to `native_rate`, returning a new clip whose
    /// samples and rate have been resampled with `BatchResampler`. A no-op
    /// clone when the rates already match.
    pub fn resampled_to(&self, native_rate: u32) -> Result<Self> {
        if native_rate == self.inner.sample_rate {
            return Ok(self.clone());
        }
        let resampler =
            BatchResampler::new(self.inner.sample_rate, native_rate, self.inner.channels, Some(1024))?;
        let resampled = resampler.resample_interleaved(&self.inner.samples)?;
        let duration = Duration::from_secs_f64(
            resampled.len() as f64 / (native_rate * self.inner.channels as u32) as f64,
        );
        Ok(Self::new(resampled, native_rate, self.inner.channels, duration))
    }
}
