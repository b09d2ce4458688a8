//! Configuration surface for the play source.

/// Static minimum for the ring buffer: the buffer must hold at least two
/// device blocks at the maximum slowdown factor the caller plans to use, so
/// the fill thread never has to catch up from nothing.
pub const MIN_RING_BUFFER_BLOCKS: usize = 2;

/// Default polyphony ceiling for `ClipMixer`.
pub const DEFAULT_MAX_VOICES: usize = 64;

/// Fixed block size models/plugins are rendered in; `frame_count` passed to
/// `AudioGenerator::mix_model` must be a multiple of this.
pub const PLUGIN_BLOCK_SIZE: usize = 1024;

/// Length, in frames, of the fade applied at a looped selection boundary.
pub fn crossfade_frames(sample_rate: u32) -> usize {
    ((sample_rate as f64) * 0.015).round() as usize
}

/// Length, in frames, of a `ClipMixer` voice's fade-in/fade-out.
pub fn voice_fade_frames(sample_rate: u32) -> usize {
    ((sample_rate as f64) * 0.005).round() as usize
}

/// Minimum shortfall, in frames, before a short `get_source_samples` read is
/// reported as a `BufferUnderrun` event. Smaller shortfalls are absorbed
/// silently — they fall within ordinary ring-buffer edge jitter rather than
/// the fill thread genuinely falling behind.
pub const MIN_UNDERRUN_THRESHOLD: usize = 64;

/// Configuration for the `AudioCallbackPlaySource`. Supplied at construction
/// and mutated afterwards through the play source's setters, which take the
/// mutex and reallocate buffers as needed.
#[derive(Debug, Clone)]
pub struct PlaySourceConfig {
    /// Frames requested per callback at most. The device adapter may ask for
    /// fewer on a given call, never more.
    pub target_block_size: usize,
    /// Device output sample rate in Hz. May differ from any model's rate;
    /// the callback resamples on the fly when it does.
    pub target_sample_rate: u32,
    /// Extra latency, in frames, the caller wants reported as "not yet
    /// audible" by `current_playing_frame`.
    pub target_play_latency: usize,
    /// Number of interleaved output channels the device wants.
    pub target_channel_count: u16,
    /// Integer slowdown factor. 1 disables the time stretcher.
    pub slowdown_factor: u32,
    /// Ring buffer capacity in frames. Must be at least
    /// `MIN_RING_BUFFER_BLOCKS * target_block_size * slowdown_factor`; the
    /// play source's own `reconfigure` raises this further still when a
    /// device-rate resampler is installed, so a single fill-thread write
    /// (stretched and/or resampled) always fits.
    pub ring_buffer_size: usize,
}

impl Default for PlaySourceConfig {
    fn default() -> Self {
        let target_block_size = 1024;
        Self {
            target_block_size,
            target_sample_rate: 44_100,
            target_play_latency: 0,
            target_channel_count: 2,
            slowdown_factor: 1,
            ring_buffer_size: target_block_size * 8,
        }
    }
}

impl PlaySourceConfig {
    /// Clamp `ring_buffer_size` up to the minimum the current block size and
    /// slowdown factor require.
    pub fn normalized(mut self) -> Self {
        let min_size =
            MIN_RING_BUFFER_BLOCKS * self.target_block_size * self.slowdown_factor.max(1) as usize;
        if self.ring_buffer_size < min_size {
            self.ring_buffer_size = min_size;
        }
        self
    }
}
