//! `AudioCallbackPlaySource`: the double-buffered producer/consumer bridge
//! between the non-real-time fill thread and the real-time device callback
//! (§4.6). This is the largest component in the core — it owns the ring
//! buffers, the scavengers that reclaim them, the optional time stretcher,
//! and the device-rate resampler, and it is the only thing in this crate the
//! RT callback thread is allowed to touch.
//!
//! The RT path (`get_source_samples`) never allocates, never blocks, and
//! never takes the control mutex — it only `try_lock`s the small piece of
//! state (`rt_path`) it shares with the fill thread, exactly the discipline
//! `Scavenger::scavenge` already uses. Everything else (`add_model`, `play`,
//! `set_slowdown_factor`, ...) is a control-thread operation serialized by
//! the control mutex, matching §5's thread model.

use crate::audio_data::{ResamplerType, StreamingResampler};
use crate::config::{
    crossfade_frames, PlaySourceConfig, MIN_RING_BUFFER_BLOCKS, MIN_UNDERRUN_THRESHOLD, PLUGIN_BLOCK_SIZE,
};
use crate::error::{PlayCoreError, Result};
use crate::events::{EventDispatcher, PlayEvent};
use crate::generator::AudioGenerator;
use crate::model::{ModelHandle, ModelId, PlayParameters};
use crate::ring_buffer::RingBufferVector;
use crate::scavenger::Scavenger;
use crate::stretch::TimeStretcherData;

use crossbeam_channel::{bounded, Receiver, Sender};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Capacity of the bounded channel the RT callback uses to report events it
/// cannot emit directly (`EventDispatcher::emit` takes a mutex, which is not
/// RT-safe). The fill thread drains it on every wake.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Capability a play source exposes to a device adapter (§9 redesign flag:
/// re-expresses the original's virtual-inheritance play-source base as a
/// plain trait instead of a class hierarchy).
pub trait AudioPlaySource: Send + Sync {
    /// Real-time: fills up to `outputs[c][0..count)` per channel, returns
    /// the number of frames actually written. Never blocks or allocates.
    fn get_source_samples(&self, outputs: &mut [Vec<f32>], count: usize) -> usize;
    fn is_playing(&self) -> bool;
    /// Current playback position, latency-adjusted. Safe from any thread.
    fn current_playing_frame(&self) -> u64;
    /// Smoothed peak levels, `(left, right)`.
    fn output_levels(&self) -> (f32, f32);
}

/// Device-rate resampling, run entirely on the fill thread (§4.6 steps 4/5).
/// The RT callback never touches this — it only ever drains already-resampled
/// frames out of the ring buffers the fill thread wrote, so nothing here runs
/// under `rt_path`'s lock. `StreamingResampler::process_interleaved`
/// allocates internally (`rubato`'s own `Resampler::process` returns a fresh
/// `Vec<Vec<f32>>` every call), which is exactly why this state lives on the
/// control-thread side (`ControlState`) instead of `RtPath`.
struct ResampleState {
    resampler: StreamingResampler,
    input_chunk_frames: usize,
    channel_count: usize,
    interleave_in: Vec<f32>,
    interleave_out: Vec<f32>,
    planar_out: Vec<Vec<f32>>,
    max_out_frames: usize,
}

impl ResampleState {
    fn new(source_rate: u32, target_rate: u32, channels: u16, input_chunk_frames: usize) -> Result<Self> {
        let resampler = StreamingResampler::new(
            source_rate,
            target_rate,
            channels,
            input_chunk_frames,
            Some(ResamplerType::Sinc),
        )?;
        let channel_count = channels as usize;
        // rubato's fixed-input resamplers may emit a couple of frames more
        // or fewer than the nominal ratio depending on internal phase, so
        // this keeps a small margin over the exact ratio.
        let max_out_frames =
            ((input_chunk_frames as f64 * target_rate as f64 / source_rate as f64).ceil() as usize) + 16;
        Ok(Self {
            resampler,
            input_chunk_frames,
            channel_count,
            interleave_in: vec![0.0f32; input_chunk_frames * channel_count],
            interleave_out: vec![0.0f32; max_out_frames * channel_count],
            planar_out: vec![vec![0.0f32; max_out_frames]; channel_count],
            max_out_frames,
        })
    }

    /// Resamples exactly `input_chunk_frames` planar source-rate frames from
    /// `input` into `self.planar_out`, returning the number of target-rate
    /// frames produced. Called only from the fill thread.
    fn process_block(&mut self, input: &[Vec<f32>]) -> Result<usize> {
        for frame in 0..self.input_chunk_frames {
            for ch in 0..self.channel_count {
                self.interleave_in[frame * self.channel_count + ch] = input[ch][frame];
            }
        }
        let (out_frames, _) = self.resampler.process_interleaved(&self.interleave_in, &mut self.interleave_out)?;
        for frame in 0..out_frames {
            for ch in 0..self.channel_count {
                self.planar_out[ch][frame] = self.interleave_out[frame * self.channel_count + ch];
            }
        }
        Ok(out_frames)
    }

    fn latency_source_frames(&self) -> usize {
        self.resampler.latency_frames()
    }

    /// `source/target`, the factor that converts a count of drained
    /// target-rate frames back into the equivalent number of source-rate
    /// frames (§4.6 step 6).
    fn source_per_target(&self) -> f64 {
        self.resampler.resample_ratio()
    }

    fn reset(&mut self) {
        self.resampler.reset();
    }
}

/// Everything the RT callback reaches for, behind one `Mutex` it only ever
/// `try_lock`s. Replaced wholesale by the control thread on reconfigure; the
/// old instance is handed to the scavenger rather than dropped in place, in
/// case an in-flight `try_lock` still held a reference at the moment of swap.
/// Holds only already-target-rate data — resampling happens upstream, on the
/// fill thread, before anything is written in here.
struct RtPath {
    buffers: Arc<RingBufferVector>,
}

impl RtPath {
    fn silent(channels: u16, size: usize) -> Self {
        Self { buffers: Arc::new(RingBufferVector::new(channels, size)) }
    }

    fn reset(&mut self) {
        self.buffers.reset();
    }
}

/// Control-thread-only state, guarded by `Inner::control`. The fill thread
/// holds this lock for the duration of a single `fill_buffers` call, exactly
/// as the distilled spec's pseudocode describes.
struct ControlState {
    config: PlaySourceConfig,
    source_sample_rate: Option<u32>,
    last_model_end_frame: u64,
    write_fill_frame: u64,
    loop_region: Option<(u64, u64)>,
    loop_tail: Option<Vec<Vec<f32>>>,
    playback_ended_emitted: bool,
    time_stretcher: Option<TimeStretcherData>,
    mix_scratch: Vec<Vec<f32>>,
    stretch_scratch: Vec<Vec<f32>>,
    /// Device-rate resampler, rebuilt by `reconfigure` whenever the source
    /// rate, target rate, block size, or stretch ratio changes. Lives here
    /// (not in `RtPath`) because resampling allocates and must run on the
    /// fill thread, never under the RT-shared lock.
    resample: Option<ResampleState>,
}

impl ControlState {
    fn new(config: PlaySourceConfig) -> Self {
        let channels = config.target_channel_count as usize;
        let block = config.target_block_size;
        Self {
            mix_scratch: vec![vec![0.0f32; block]; channels],
            stretch_scratch: Vec::new(),
            config,
            source_sample_rate: None,
            last_model_end_frame: 0,
            write_fill_frame: 0,
            loop_region: None,
            loop_tail: None,
            playback_ended_emitted: false,
            time_stretcher: None,
            resample: None,
        }
    }
}

struct Inner {
    generator: Arc<AudioGenerator>,
    events: Arc<EventDispatcher>,
    control: Mutex<ControlState>,
    condvar: Condvar,
    playing: AtomicBool,
    exiting: AtomicBool,
    read_fill_frame: AtomicU64,
    rt_path: Mutex<RtPath>,
    buffer_scavenger: Scavenger<RtPath>,
    stretcher_scavenger: Scavenger<TimeStretcherData>,
    output_left: AtomicU32,
    output_right: AtomicU32,
    event_tx: Sender<PlayEvent>,
    event_rx: Receiver<PlayEvent>,
    /// `source_rate/target_rate` as f64 bits, published by `reconfigure` so
    /// the RT callback can convert drained target-rate frames back into
    /// source-rate frames (§4.6 step 6) without locking `control`.
    resample_ratio_bits: AtomicU64,
    /// Fractional remainder (f64 bits) left over from the last conversion in
    /// `get_source_samples`, carried forward so repeated rounding can't drift
    /// `read_fill_frame` over a long session.
    source_frame_carry_bits: AtomicU64,
    /// Resampler latency in source frames, published by `reconfigure`; 0 when
    /// no resampler is installed.
    resampler_latency: AtomicU64,
}

/// The playback core's producer/consumer bridge. One instance per playback
/// session (§9: no process-wide singleton).
pub struct AudioCallbackPlaySource {
    inner: Arc<Inner>,
    fill_thread: Option<JoinHandle<()>>,
}

impl AudioCallbackPlaySource {
    pub fn new(config: PlaySourceConfig) -> Result<Self> {
        let events = Arc::new(EventDispatcher::new());
        let generator = Arc::new(AudioGenerator::new(Arc::clone(&events)));
        Self::with_generator(config, generator)
    }

    /// Builds a play source around a generator the caller has already
    /// configured (with a clip mixer and/or plugin host installed). Events
    /// the generator emits (e.g. `PluginOverloadDisabled`) and events the
    /// play source itself emits share the generator's own dispatcher, so
    /// `events()` is the single subscription point for both.
    pub fn with_generator(config: PlaySourceConfig, generator: Arc<AudioGenerator>) -> Result<Self> {
        if config.target_block_size % PLUGIN_BLOCK_SIZE != 0 {
            return Err(PlayCoreError::Configuration(format!(
                "target_block_size {} must be a multiple of PLUGIN_BLOCK_SIZE ({})",
                config.target_block_size, PLUGIN_BLOCK_SIZE
            )));
        }
        let config = config.normalized();
        let events = Arc::clone(generator.events());
        let (event_tx, event_rx) = bounded(EVENT_CHANNEL_CAPACITY);
        let rt_path = RtPath::silent(config.target_channel_count, config.ring_buffer_size);

        let inner = Arc::new(Inner {
            generator,
            events,
            control: Mutex::new(ControlState::new(config)),
            condvar: Condvar::new(),
            playing: AtomicBool::new(false),
            exiting: AtomicBool::new(false),
            read_fill_frame: AtomicU64::new(0),
            rt_path: Mutex::new(rt_path),
            buffer_scavenger: Scavenger::new(),
            stretcher_scavenger: Scavenger::new(),
            output_left: AtomicU32::new(0),
            output_right: AtomicU32::new(0),
            event_tx,
            event_rx,
            resample_ratio_bits: AtomicU64::new(1.0f64.to_bits()),
            source_frame_carry_bits: AtomicU64::new(0.0f64.to_bits()),
            resampler_latency: AtomicU64::new(0),
        });

        let thread_inner = Arc::clone(&inner);
        let fill_thread = thread::Builder::new()
            .name("play-source-fill".into())
            .spawn(move || fill_thread_loop(thread_inner))
            .map_err(|e| PlayCoreError::Engine(format!("failed to spawn fill thread: {e}")))?;

        Ok(Self { inner, fill_thread: Some(fill_thread) })
    }

    pub fn events(&self) -> &Arc<EventDispatcher> {
        &self.inner.events
    }

    pub fn generator(&self) -> &Arc<AudioGenerator> {
        &self.inner.generator
    }

    /// Adds a model to the active set. The first model added adopts its
    /// sample rate as the play source's source rate; later models whose rate
    /// differs are rejected with `PlayCoreError::SampleRateMismatch` and a
    /// matching event, per §7.
    pub fn add_model(&self, handle: ModelHandle) -> Result<ModelId> {
        let id = ModelId::next();
        let rate = handle.sample_rate();
        let end_frame = handle.end_frame();
        {
            let mut control = self.inner.control.lock().unwrap();
            match control.source_sample_rate {
                Some(existing) if existing != rate => {
                    self.inner.events.emit(PlayEvent::SampleRateMismatch {
                        model: id,
                        model_rate: rate,
                        source_rate: existing,
                    });
                    return Err(PlayCoreError::SampleRateMismatch { model_rate: rate, source_rate: existing });
                }
                Some(_) => {}
                None => control.source_sample_rate = Some(rate),
            }
            control.last_model_end_frame = control.last_model_end_frame.max(end_frame);
            control.playback_ended_emitted = false;
        }
        self.inner.generator.add_model(id, handle);
        self.inner.events.emit(PlayEvent::ModelAdded { model: id });
        Ok(id)
    }

    /// Idempotent: removing a model twice (or one never added) is a no-op.
    pub fn remove_model(&self, id: ModelId) {
        self.inner.generator.remove_model(id);
        self.inner.events.emit(PlayEvent::ModelRemoved { model: id });
    }

    pub fn clear_models(&self) {
        self.inner.generator.clear_models();
        let mut control = self.inner.control.lock().unwrap();
        control.source_sample_rate = None;
        control.last_model_end_frame = 0;
    }

    pub fn set_play_parameters(&self, id: ModelId, params: PlayParameters) {
        let previous = self.inner.generator.play_parameters(id);
        self.inner.generator.set_play_parameters(id, params.clone());
        if let Some(previous) = previous {
            if (previous.gain - params.gain).abs() > f32::EPSILON {
                self.inner.events.emit(PlayEvent::SourceVolumeChanged {
                    model: id,
                    old_gain: previous.gain,
                    new_gain: params.gain,
                });
            }
            if (previous.pan - params.pan).abs() > f32::EPSILON {
                self.inner.events.emit(PlayEvent::SourcePanChanged {
                    model: id,
                    old_pan: previous.pan,
                    new_pan: params.pan,
                });
            }
        }
    }

    pub fn play_parameters(&self, id: ModelId) -> Option<PlayParameters> {
        self.inner.generator.play_parameters(id)
    }

    /// Starts (or restarts) playback from `start_frame`. Clears all buffered
    /// data and resets generator/model state so playback is exactly as if
    /// freshly seeked.
    pub fn play(&self, start_frame: u64) {
        {
            let mut control = self.inner.control.lock().unwrap();
            control.write_fill_frame = start_frame;
            control.playback_ended_emitted = false;
            control.loop_tail = None;
            if let Some(resample) = control.resample.as_mut() {
                resample.reset();
            }
        }
        self.inner.read_fill_frame.store(start_frame, Ordering::Relaxed);
        self.inner.source_frame_carry_bits.store(0.0f64.to_bits(), Ordering::Relaxed);
        if let Ok(mut path) = self.inner.rt_path.lock() {
            path.reset();
        }
        self.inner.generator.reset();
        self.inner.playing.store(true, Ordering::Release);
        self.inner.condvar.notify_all();
        self.inner.events.emit(PlayEvent::PlaybackStarted { frame: start_frame });
    }

    /// Stops playback. `is_playing()` observes `false` before this returns;
    /// at most one more `get_source_samples` call may still deliver residual
    /// ring-buffer content (§5 ordering guarantee).
    pub fn stop(&self) {
        self.inner.playing.store(false, Ordering::Release);
        self.inner.condvar.notify_all();
        self.inner.events.emit(PlayEvent::PlaybackStopped);
    }

    pub fn is_playing(&self) -> bool {
        self.inner.playing.load(Ordering::Acquire)
    }

    pub fn set_target_block_size(&self, frames: usize) -> Result<()> {
        if frames % PLUGIN_BLOCK_SIZE != 0 {
            return Err(PlayCoreError::Configuration(format!(
                "target_block_size {frames} must be a multiple of PLUGIN_BLOCK_SIZE ({PLUGIN_BLOCK_SIZE})"
            )));
        }
        let mut control = self.inner.control.lock().unwrap();
        control.config.target_block_size = frames;
        if control.time_stretcher.is_some() {
            let factor = control.config.slowdown_factor;
            let stretcher = TimeStretcherData::new(control.config.target_channel_count, factor, frames)?;
            if let Some(old) = control.time_stretcher.replace(stretcher) {
                self.inner.stretcher_scavenger.claim(old);
            }
        }
        self.reconfigure(&mut control);
        Ok(())
    }

    pub fn set_target_sample_rate(&self, rate: u32) {
        let mut control = self.inner.control.lock().unwrap();
        control.config.target_sample_rate = rate;
        self.reconfigure(&mut control);
    }

    pub fn set_target_play_latency(&self, frames: usize) {
        self.inner.control.lock().unwrap().config.target_play_latency = frames;
    }

    pub fn set_target_channel_count(&self, channels: u16) -> Result<()> {
        let mut control = self.inner.control.lock().unwrap();
        control.config.target_channel_count = channels.max(1);
        self.inner.generator.set_target_channel_count(control.config.target_channel_count);
        if control.time_stretcher.is_some() {
            let factor = control.config.slowdown_factor;
            let block = control.config.target_block_size;
            let stretcher = TimeStretcherData::new(control.config.target_channel_count, factor, block)?;
            if let Some(old) = control.time_stretcher.replace(stretcher) {
                self.inner.stretcher_scavenger.claim(old);
            }
        }
        self.reconfigure(&mut control);
        Ok(())
    }

    /// `factor` 1 disables the stretcher; any value > 1 installs a fresh
    /// `TimeStretcherData`, scavenging whatever was installed before.
    pub fn set_slowdown_factor(&self, factor: u32) -> Result<()> {
        let mut control = self.inner.control.lock().unwrap();
        let factor = factor.max(1);
        control.config.slowdown_factor = factor;
        if factor <= 1 {
            if let Some(old) = control.time_stretcher.take() {
                self.inner.stretcher_scavenger.claim(old);
            }
        } else {
            let stretcher = TimeStretcherData::new(
                control.config.target_channel_count,
                factor,
                control.config.target_block_size,
            )?;
            if let Some(old) = control.time_stretcher.replace(stretcher) {
                self.inner.stretcher_scavenger.claim(old);
            }
        }
        self.reconfigure(&mut control);
        Ok(())
    }

    /// Installs (or clears) a looping selection. `(start, end)` frames; the
    /// fill thread stitches the wrap with a `crossfade_frames`-long blend
    /// rather than a hard cut. Looping is quantized to block boundaries: the
    /// wrap lands on the block that first reaches `end`, not the exact
    /// sample (documented in DESIGN.md).
    pub fn set_loop_region(&self, region: Option<(u64, u64)>) {
        let mut control = self.inner.control.lock().unwrap();
        control.loop_region = region;
        control.loop_tail = None;
    }

    /// Returns `read_fill_frame - target_play_latency - stretcher_latency -
    /// resampler_latency`, clamped to `[0, last_model_end_frame]` (§4.6).
    /// Safe to call from any thread.
    pub fn current_playing_frame(&self) -> u64 {
        let control = self.inner.control.lock().unwrap();
        let stretch_latency = control.time_stretcher.as_ref().map(|s| s.latency() as i64).unwrap_or(0);
        let resampler_latency = self.inner.resampler_latency.load(Ordering::Relaxed) as i64;
        let raw = self.inner.read_fill_frame.load(Ordering::Relaxed) as i64
            - control.config.target_play_latency as i64
            - stretch_latency
            - resampler_latency;
        raw.clamp(0, control.last_model_end_frame as i64) as u64
    }

    pub fn output_levels(&self) -> (f32, f32) {
        (
            f32::from_bits(self.inner.output_left.load(Ordering::Relaxed)),
            f32::from_bits(self.inner.output_right.load(Ordering::Relaxed)),
        )
    }

    /// Real-time: fills up to `count` frames per channel into `outputs`.
    /// Never blocks, never allocates, never touches the control mutex. A
    /// contended `rt_path` lock (only possible mid-reconfigure) degrades to
    /// silence for this one call rather than waiting.
    pub fn get_source_samples(&self, outputs: &mut [Vec<f32>], count: usize) -> usize {
        if !self.inner.playing.load(Ordering::Acquire) {
            return 0;
        }
        let Ok(path) = self.inner.rt_path.try_lock() else {
            return 0;
        };

        // `buffers` always holds target-rate data: any resampling the device
        // rate needs already happened on the fill thread before it was
        // written in here (§4.6 — the RT path never allocates or calls into
        // `rubato`).
        let written = read_direct(&path.buffers, outputs, count);
        drop(path);

        if count > written && count - written >= MIN_UNDERRUN_THRESHOLD {
            let _ = self.inner.event_tx.try_send(PlayEvent::BufferUnderrun { frames_short: count - written });
        }

        // Advance read_fill_frame by the source-rate frame count these
        // `written` target-rate frames correspond to (§4.6 step 6), not by
        // `written` itself — the two differ whenever resampling is active.
        // The fractional remainder is carried forward so rounding can't
        // accumulate drift over a long session.
        let ratio = f64::from_bits(self.inner.resample_ratio_bits.load(Ordering::Relaxed));
        let carry = f64::from_bits(self.inner.source_frame_carry_bits.load(Ordering::Relaxed));
        let exact = written as f64 * ratio + carry;
        let whole = exact.floor();
        self.inner.source_frame_carry_bits.store((exact - whole).to_bits(), Ordering::Relaxed);
        self.inner.read_fill_frame.fetch_add(whole as u64, Ordering::Relaxed);

        update_levels(outputs, written, &self.inner.output_left, &self.inner.output_right);

        self.inner.buffer_scavenger.scavenge();
        self.inner.stretcher_scavenger.scavenge();
        self.inner.condvar.notify_one();

        written
    }

    /// Rebuilds everything whose sizing depends on block size, channel
    /// count, stretch ratio, or sample rates: the scratch buffers, the
    /// device-rate resampler (owned here, not by `RtPath` — see
    /// `ResampleState`), and the ring buffers themselves, sized for whatever
    /// the fill thread's largest single write can be.
    fn reconfigure(&self, control: &mut ControlState) {
        let channels = control.config.target_channel_count;
        let block = control.config.target_block_size;
        let stretch_ratio = control.time_stretcher.as_ref().map(|s| s.ratio()).unwrap_or(1) as usize;
        let source_block = block * stretch_ratio;

        let resample = match control.source_sample_rate {
            Some(source_rate) if source_rate != control.config.target_sample_rate => {
                match ResampleState::new(source_rate, control.config.target_sample_rate, channels, source_block) {
                    Ok(state) => Some(state),
                    Err(e) => {
                        log::warn!("failed to build device-rate resampler, falling back to direct copy: {e}");
                        None
                    }
                }
            }
            _ => None,
        };

        // The largest single write `fill_buffers` can make this reconfigure:
        // the resampler's worst-case output, or the stretched/raw source
        // block if no resampler is installed.
        let max_write = resample.as_ref().map(|r| r.max_out_frames).unwrap_or(source_block);
        let min_size = MIN_RING_BUFFER_BLOCKS * max_write;
        let size = control.config.ring_buffer_size.max(min_size);

        let new_path = RtPath { buffers: Arc::new(RingBufferVector::new(channels, size)) };
        let old_path = std::mem::replace(&mut *self.inner.rt_path.lock().unwrap(), new_path);
        self.inner.buffer_scavenger.claim(old_path);

        let (ratio, latency) = match resample.as_ref() {
            Some(r) => (r.source_per_target(), r.latency_source_frames()),
            None => (1.0, 0),
        };
        self.inner.resample_ratio_bits.store(ratio.to_bits(), Ordering::Relaxed);
        self.inner.resampler_latency.store(latency as u64, Ordering::Relaxed);
        control.resample = resample;

        control.mix_scratch = vec![vec![0.0f32; block]; channels as usize];
        control.stretch_scratch = match &control.time_stretcher {
            Some(_) => vec![vec![0.0f32; source_block]; channels as usize],
            None => Vec::new(),
        };
    }
}

impl AudioPlaySource for AudioCallbackPlaySource {
    fn get_source_samples(&self, outputs: &mut [Vec<f32>], count: usize) -> usize {
        AudioCallbackPlaySource::get_source_samples(self, outputs, count)
    }

    fn is_playing(&self) -> bool {
        self.is_playing()
    }

    fn current_playing_frame(&self) -> u64 {
        self.current_playing_frame()
    }

    fn output_levels(&self) -> (f32, f32) {
        self.output_levels()
    }
}

impl Drop for AudioCallbackPlaySource {
    fn drop(&mut self) {
        self.inner.exiting.store(true, Ordering::Release);
        self.inner.playing.store(false, Ordering::Release);
        self.inner.condvar.notify_all();
        if let Some(handle) = self.fill_thread.take() {
            let _ = handle.join();
        }
    }
}

fn read_direct(source: &RingBufferVector, outputs: &mut [Vec<f32>], count: usize) -> usize {
    let avail = source.min_read_space();
    let n = avail.min(count);
    for (ch, out) in outputs.iter_mut().enumerate() {
        if n > 0 {
            source.channel(ch).read(&mut out[..n]);
        }
        for sample in out[n..count].iter_mut() {
            *sample = 0.0;
        }
    }
    n
}

fn peak(samples: &[f32]) -> f32 {
    samples.iter().fold(0.0f32, |max, &s| max.max(s.abs()))
}

/// Exponential-decay peak hold: the published level rises instantly to a
/// new peak and decays a fixed fraction per callback otherwise, the same
/// "smooth-max" meter ballistics used throughout the pack's level meters.
fn update_levels(outputs: &[Vec<f32>], n: usize, left: &AtomicU32, right: &AtomicU32) {
    const DECAY: f32 = 0.85;
    let l_peak = outputs.first().map(|c| peak(&c[..n])).unwrap_or(0.0);
    let r_peak = outputs.get(1).map(|c| peak(&c[..n])).unwrap_or(l_peak);
    for (atomic, new_peak) in [(left, l_peak), (right, r_peak)] {
        let previous = f32::from_bits(atomic.load(Ordering::Relaxed));
        let smoothed = (previous * DECAY).max(new_peak);
        atomic.store(smoothed.to_bits(), Ordering::Relaxed);
    }
}

fn fill_thread_loop(inner: Arc<Inner>) {
    let mut control = inner.control.lock().unwrap();
    loop {
        while let Ok(event) = inner.event_rx.try_recv() {
            inner.events.emit(event);
        }
        if inner.exiting.load(Ordering::Acquire) {
            return;
        }
        if !inner.playing.load(Ordering::Acquire) {
            control = inner.condvar.wait(control).unwrap();
            continue;
        }
        let did_work = match fill_buffers(&inner, &mut control) {
            Ok(did_work) => did_work,
            Err(e) => {
                log::warn!("mix_models failed, skipping this block: {e}");
                true
            }
        };
        if !did_work {
            let (guard, _timeout) = inner.condvar.wait_timeout(control, Duration::from_millis(100)).unwrap();
            control = guard;
        }
    }
}

/// One pass of the fill thread's protocol (§4.6): checks write space, mixes
/// one block of models, optionally runs it through the time stretcher and
/// the device-rate resampler, and writes the result into the current ring
/// buffers. Returns whether any useful work was done.
fn fill_buffers(inner: &Inner, control: &mut ControlState) -> Result<bool> {
    let buffers = inner.rt_path.lock().unwrap().buffers.clone();
    let block = control.config.target_block_size;
    let stretch_ratio = control.time_stretcher.as_ref().map(|s| s.ratio()).unwrap_or(1) as usize;
    let source_block = block * stretch_ratio;
    // The actual write this call makes is `source_block` frames (possibly
    // stretched) and then, if resampling, up to `max_out_frames` of that
    // resampled — gate on whichever is the real output size so the ring
    // buffer's capping behavior in `write` never silently drops the tail of
    // a stretched/resampled block (§8 conservation property).
    let needed = control.resample.as_ref().map(|r| r.max_out_frames).unwrap_or(source_block);
    if buffers.min_write_space() < needed {
        return Ok(false);
    }

    for row in control.mix_scratch.iter_mut() {
        row.iter_mut().for_each(|s| *s = 0.0);
    }
    let frame = control.write_fill_frame;
    let rendered = inner.generator.mix_models(frame, block, &mut control.mix_scratch)?;
    let mut next_frame = frame + rendered as u64;

    // Blend in a tail captured by the *previous* call's loop wrap (if any)
    // before this block's own content is inspected for a new wrap — the
    // tail always belongs to the block immediately following the one that
    // captured it, never to that same block.
    if let Some(tail) = control.loop_tail.take() {
        let fade_len = tail.first().map(|t| t.len()).unwrap_or(0);
        for (ch, row) in control.mix_scratch.iter_mut().enumerate() {
            for i in 0..fade_len.min(row.len()) {
                let t = (i as f32 + 1.0) / (fade_len as f32 + 1.0);
                row[i] = tail[ch][i] * (1.0 - t).sqrt() + row[i] * t.sqrt();
            }
        }
    }

    if let Some((loop_start, loop_end)) = control.loop_region {
        if next_frame >= loop_end {
            let sample_rate = control.source_sample_rate.unwrap_or(control.config.target_sample_rate);
            let fade_len = crossfade_frames(sample_rate).min(rendered);
            let tail = control.mix_scratch.iter().map(|row| row[rendered - fade_len..rendered].to_vec()).collect();
            control.loop_tail = Some(tail);
            next_frame = loop_start;
        }
    } else if rendered < block && next_frame >= control.last_model_end_frame && !control.playback_ended_emitted {
        control.playback_ended_emitted = true;
        inner.events.emit(PlayEvent::PlaybackEnded);
    }

    let mut stretch_underran = false;
    if let Some(stretcher) = control.time_stretcher.as_mut() {
        stretch_underran = stretcher.process(&control.mix_scratch, &mut control.stretch_scratch, block)?;
    }
    if stretch_underran {
        log::debug!("time stretcher underran, zero-padding this block");
    }

    // The source-rate block to hand onward: the stretcher's output if one is
    // installed, otherwise the raw mix. Resampled into the ring buffer if a
    // device-rate resampler is installed, otherwise written straight in.
    if let Some(resample) = control.resample.as_mut() {
        let out_frames = if control.time_stretcher.is_some() {
            resample.process_block(&control.stretch_scratch)?
        } else {
            resample.process_block(&control.mix_scratch)?
        };
        for (ch, data) in resample.planar_out.iter().enumerate() {
            buffers.channel(ch).write(&data[..out_frames]);
        }
    } else if control.time_stretcher.is_some() {
        for (ch, data) in control.stretch_scratch.iter().enumerate() {
            buffers.channel(ch).write(&data[..source_block]);
        }
    } else {
        for (ch, data) in control.mix_scratch.iter().enumerate() {
            buffers.channel(ch).write(&data[..source_block]);
        }
    }

    control.write_fill_frame = next_frame;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DenseModel;
    use std::time::Instant;

    struct ConstDense {
        value: f32,
        channels: u16,
        rate: u32,
        end: u64,
    }

    impl DenseModel for ConstDense {
        fn sample_rate(&self) -> u32 {
            self.rate
        }
        fn channel_count(&self) -> u16 {
            self.channels
        }
        fn start_frame(&self) -> u64 {
            0
        }
        fn end_frame(&self) -> u64 {
            self.end
        }
        fn read(&self, _channel: u16, start: u64, out: &mut [f32]) -> usize {
            if start >= self.end {
                return 0;
            }
            let n = (out.len() as u64).min(self.end - start) as usize;
            for slot in out[..n].iter_mut() {
                *slot = self.value;
            }
            n
        }
    }

    fn test_config() -> PlaySourceConfig {
        PlaySourceConfig {
            target_block_size: 1024,
            target_sample_rate: 44_100,
            target_play_latency: 0,
            target_channel_count: 2,
            slowdown_factor: 1,
            ring_buffer_size: 1024 * 16,
        }
    }

    /// Pulls `count` frames per channel, retrying for up to `timeout` while
    /// the fill thread catches up. Mirrors how a real device adapter would
    /// poll a just-started play source.
    fn pull_until(
        source: &AudioCallbackPlaySource,
        outputs: &mut [Vec<f32>],
        count: usize,
        timeout: Duration,
    ) -> usize {
        let deadline = Instant::now() + timeout;
        loop {
            let n = source.get_source_samples(outputs, count);
            if n == count || Instant::now() > deadline {
                return n;
            }
            thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn steady_playback_returns_constant_value_blocks() {
        let source = AudioCallbackPlaySource::new(test_config()).unwrap();
        let model: Arc<dyn DenseModel> = Arc::new(ConstDense { value: 0.5, channels: 1, rate: 44_100, end: 1_000_000 });
        source.add_model(ModelHandle::Dense(model)).unwrap();
        source.play(0);

        let mut outputs = vec![vec![0.0f32; 1024], vec![0.0f32; 1024]];
        for _ in 0..3 {
            let n = pull_until(&source, &mut outputs, 1024, Duration::from_secs(2));
            assert_eq!(n, 1024);
            for ch in &outputs {
                for &s in ch.iter() {
                    assert!((s - 0.5).abs() < 1e-3);
                }
            }
        }
        assert_eq!(source.current_playing_frame(), 3 * 1024);
    }

    #[test]
    fn stop_flips_is_playing_before_returning() {
        let source = AudioCallbackPlaySource::new(test_config()).unwrap();
        let model: Arc<dyn DenseModel> = Arc::new(ConstDense { value: 0.5, channels: 1, rate: 44_100, end: 1_000_000 });
        source.add_model(ModelHandle::Dense(model)).unwrap();
        source.play(0);

        let mut outputs = vec![vec![0.0f32; 1024], vec![0.0f32; 1024]];
        pull_until(&source, &mut outputs, 1024, Duration::from_secs(2));

        source.stop();
        assert!(!source.is_playing());

        // Eventually the ring buffer drains and new pulls return silence.
        let deadline = Instant::now() + Duration::from_secs(1);
        loop {
            let n = source.get_source_samples(&mut outputs, 1024);
            if n == 0 || Instant::now() > deadline {
                break;
            }
        }
        let n = source.get_source_samples(&mut outputs, 1024);
        assert_eq!(n, 0);
    }

    #[test]
    fn second_model_with_mismatched_rate_is_rejected() {
        let source = AudioCallbackPlaySource::new(test_config()).unwrap();
        let stereo: Arc<dyn DenseModel> = Arc::new(ConstDense { value: 0.2, channels: 2, rate: 44_100, end: 1_000_000 });
        source.add_model(ModelHandle::Dense(stereo)).unwrap();

        let mismatched: Arc<dyn DenseModel> = Arc::new(ConstDense { value: 0.2, channels: 1, rate: 48_000, end: 1_000_000 });
        let result = source.add_model(ModelHandle::Dense(mismatched));
        assert!(matches!(result, Err(PlayCoreError::SampleRateMismatch { .. })));

        let same_rate_mono: Arc<dyn DenseModel> = Arc::new(ConstDense { value: 0.2, channels: 1, rate: 44_100, end: 1_000_000 });
        assert!(source.add_model(ModelHandle::Dense(same_rate_mono)).is_ok());
    }

    #[test]
    fn idempotent_removal_leaves_no_trace() {
        let source = AudioCallbackPlaySource::new(test_config()).unwrap();
        let model: Arc<dyn DenseModel> = Arc::new(ConstDense { value: 0.5, channels: 1, rate: 44_100, end: 1000 });
        let id = source.add_model(ModelHandle::Dense(model)).unwrap();
        source.remove_model(id);
        source.remove_model(id);
        assert_eq!(source.generator().model_count(), 0);
    }

    #[test]
    fn slowdown_factor_can_be_installed_and_cleared_without_error() {
        let source = AudioCallbackPlaySource::new(test_config()).unwrap();
        let model: Arc<dyn DenseModel> = Arc::new(ConstDense { value: 0.3, channels: 1, rate: 44_100, end: 1_000_000 });
        source.add_model(ModelHandle::Dense(model)).unwrap();
        source.play(0);

        source.set_slowdown_factor(2).unwrap();
        let mut outputs = vec![vec![0.0f32; 1024], vec![0.0f32; 1024]];
        let n = pull_until(&source, &mut outputs, 1024, Duration::from_secs(2));
        assert_eq!(n, 1024);

        source.set_slowdown_factor(1).unwrap();
        let n = pull_until(&source, &mut outputs, 1024, Duration::from_secs(2));
        assert_eq!(n, 1024);
    }
}
