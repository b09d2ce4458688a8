//! `AudioGenerator`: the polymorphic per-model renderer. Dispatches each
//! active model to a renderer strategy by variant (§4.5) — dense models by
//! direct sample read, sparse/note models by driving a shared `ClipMixer` or
//! a real-time synth plugin — and schedules note-on/note-off against each
//! model's own pending note-off set.
//!
//! Owned by the fill thread; never touched by the RT callback.

use crate::clip_mixer::{pan_gain, ClipMixer, NoteEnd, NoteStart};
use crate::config::PLUGIN_BLOCK_SIZE;
use crate::error::{PlayCoreError, Result};
use crate::events::{EventDispatcher, PlayEvent};
use crate::model::{DenseModel, ModelHandle, ModelId, NoteOff, PlayParameters};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

/// Converts a MIDI-style pitch number to a frequency in Hz (A4 = 69 = 440 Hz).
pub fn pitch_to_frequency(pitch: u8) -> f32 {
    440.0 * 2f32.powf((pitch as f32 - 69.0) / 12.0)
}

/// One scheduled event for a plugin synth within the current block.
#[derive(Debug, Clone, Copy)]
pub enum PluginEvent {
    NoteOn { frame_offset: usize, pitch: u8, velocity: u8 },
    NoteOff { frame_offset: usize, pitch: u8 },
}

/// Abstract real-time synth plugin host (§6, collaborator 4). Absence is
/// non-fatal: the sparse/note path falls back to `ClipMixer` whenever no
/// host is installed, or whenever the host reports overload for a model.
pub trait PluginHost: Send + Sync {
    /// Renders `block_size` frames driven by `events`, adding into
    /// `outputs`. An `Err` return means the plugin missed its CPU budget for
    /// this block; the generator disables that model's plugin for the rest
    /// of the session and falls back to `ClipMixer`.
    fn run(
        &self,
        plugin_id: &str,
        program: u32,
        block_size: usize,
        events: &[PluginEvent],
        outputs: &mut [Vec<f32>],
    ) -> Result<()>;
}

struct ModelEntry {
    handle: ModelHandle,
    params: PlayParameters,
    /// Pending note-offs ordered by frame (§3.1 `NoteOff`), used to close
    /// sampler/plugin voices as the block advances.
    pending_note_offs: BTreeSet<NoteOff>,
    /// Pitch -> sounding voice id, so a later note-off can find the voice a
    /// note-on started without the model handing back an explicit id.
    active_voices: HashMap<u8, u64>,
    plugin_disabled: bool,
    next_local_id: u64,
}

impl ModelEntry {
    fn new(handle: ModelHandle) -> Self {
        Self {
            handle,
            params: PlayParameters::default(),
            pending_note_offs: BTreeSet::new(),
            active_voices: HashMap::new(),
            plugin_disabled: false,
            next_local_id: 0,
        }
    }

    /// A voice id unique across the whole mixer's shared voice space: the
    /// owning model's id in the high bits, a per-model counter in the low
    /// bits.
    fn next_voice_id(&mut self, model_id: ModelId) -> u64 {
        self.next_local_id = self.next_local_id.wrapping_add(1);
        (model_id.raw() << 32) | (self.next_local_id & 0xFFFF_FFFF)
    }
}

/// Polymorphic per-model renderer, shared by every active model in a
/// playback session.
pub struct AudioGenerator {
    models: Mutex<HashMap<ModelId, ModelEntry>>,
    clip_mixer: Mutex<Option<ClipMixer>>,
    plugin_host: Option<Arc<dyn PluginHost>>,
    events: Arc<EventDispatcher>,
    target_channel_count: Mutex<u16>,
}

impl AudioGenerator {
    pub fn new(events: Arc<EventDispatcher>) -> Self {
        Self {
            models: Mutex::new(HashMap::new()),
            clip_mixer: Mutex::new(None),
            plugin_host: None,
            events,
            target_channel_count: Mutex::new(2),
        }
    }

    pub fn with_plugin_host(mut self, host: Arc<dyn PluginHost>) -> Self {
        self.plugin_host = Some(host);
        self
    }

    /// The dispatcher this generator emits its own events (currently just
    /// `PluginOverloadDisabled`) through. Callers that want a single
    /// subscription point for everything a play source built around this
    /// generator can emit should build the generator with the same
    /// dispatcher they hand to the play source.
    pub fn events(&self) -> &Arc<EventDispatcher> {
        &self.events
    }

    /// Installs the single shared clip every sparse/note model without a
    /// plugin assignment renders through.
    pub fn set_clip_mixer(&self, mixer: ClipMixer) {
        *self.clip_mixer.lock().unwrap() = Some(mixer);
    }

    pub fn has_clip_mixer(&self) -> bool {
        self.clip_mixer.lock().unwrap().is_some()
    }

    pub fn add_model(&self, id: ModelId, handle: ModelHandle) {
        self.models.lock().unwrap().insert(id, ModelEntry::new(handle));
    }

    pub fn remove_model(&self, id: ModelId) {
        self.models.lock().unwrap().remove(&id);
    }

    pub fn clear_models(&self) {
        self.models.lock().unwrap().clear();
    }

    pub fn model_count(&self) -> usize {
        self.models.lock().unwrap().len()
    }

    pub fn set_play_parameters(&self, id: ModelId, params: PlayParameters) {
        if let Some(entry) = self.models.lock().unwrap().get_mut(&id) {
            entry.params = params;
        }
    }

    pub fn play_parameters(&self, id: ModelId) -> Option<PlayParameters> {
        self.models.lock().unwrap().get(&id).map(|e| e.params.clone())
    }

    pub fn set_target_channel_count(&self, channels: u16) {
        *self.target_channel_count.lock().unwrap() = channels.max(1);
    }

    /// Clears every model's pending note-offs and resets the clip mixer and
    /// plugin state. Called on seek/restart.
    pub fn reset(&self) {
        for entry in self.models.lock().unwrap().values_mut() {
            entry.pending_note_offs.clear();
            entry.active_voices.clear();
            entry.plugin_disabled = false;
        }
        if let Some(mixer) = self.clip_mixer.lock().unwrap().as_mut() {
            mixer.reset();
        }
    }

    /// Renders every active model's contribution to `[start_frame,
    /// start_frame + frame_count)` into `outputs`, adding in place.
    /// `frame_count` must be a multiple of `PLUGIN_BLOCK_SIZE`. Returns the
    /// shortest render length across models — how far playback got before
    /// the first model to end stopped producing data.
    pub fn mix_models(
        &self,
        start_frame: u64,
        frame_count: usize,
        outputs: &mut [Vec<f32>],
    ) -> Result<usize> {
        if frame_count % PLUGIN_BLOCK_SIZE != 0 {
            return Err(PlayCoreError::Configuration(format!(
                "frame_count {frame_count} must be a multiple of PLUGIN_BLOCK_SIZE ({PLUGIN_BLOCK_SIZE})"
            )));
        }
        let mut models = self.models.lock().unwrap();
        if models.is_empty() {
            return Ok(frame_count);
        }
        let target_channels = *self.target_channel_count.lock().unwrap();
        let mut shortest = frame_count;
        let ids: Vec<ModelId> = models.keys().copied().collect();
        for id in ids {
            let rendered =
                self.mix_one(&mut models, id, start_frame, frame_count, outputs, target_channels);
            shortest = shortest.min(rendered);
        }
        Ok(shortest)
    }

    fn mix_one(
        &self,
        models: &mut HashMap<ModelId, ModelEntry>,
        id: ModelId,
        start_frame: u64,
        frame_count: usize,
        outputs: &mut [Vec<f32>],
        target_channels: u16,
    ) -> usize {
        let handle = models.get(&id).expect("model present").handle.clone();
        if models.get(&id).unwrap().params.mute {
            return remaining_frames(&handle, start_frame, frame_count);
        }
        match handle {
            ModelHandle::Dense(model) => {
                let entry = models.get(&id).unwrap();
                Self::mix_dense(model.as_ref(), entry.params.gain, entry.params.pan, start_frame, frame_count, outputs, target_channels)
            }
            ModelHandle::Sparse(model) => {
                self.mix_sparse(models, id, model, start_frame, frame_count, outputs, target_channels)
            }
            ModelHandle::Note(model) => {
                self.mix_note(models, id, model, start_frame, frame_count, outputs, target_channels)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn mix_dense(
        model: &dyn DenseModel,
        gain: f32,
        pan: f32,
        start_frame: u64,
        frame_count: usize,
        outputs: &mut [Vec<f32>],
        target_channels: u16,
    ) -> usize {
        let source_channels = model.channel_count();
        if source_channels == 0 || outputs.is_empty() {
            return frame_count;
        }

        let mut channel_reads: Vec<Vec<f32>> = Vec::with_capacity(source_channels as usize);
        let mut min_read = frame_count;
        for ch in 0..source_channels {
            let mut buf = vec![0.0f32; frame_count];
            let n = model.read(ch, start_frame, &mut buf);
            min_read = min_read.min(n);
            channel_reads.push(buf);
        }

        for frame in 0..min_read {
            match (source_channels, target_channels) {
                (1, 2) => {
                    let sample = channel_reads[0][frame] * gain;
                    outputs[0][frame] += sample * pan_gain(pan, 0, 2);
                    outputs[1][frame] += sample * pan_gain(pan, 1, 2);
                }
                (1, t) => {
                    let scale = 1.0 / (t as f32).sqrt();
                    let sample = channel_reads[0][frame] * gain * scale;
                    for output in outputs.iter_mut().take(t as usize) {
                        output[frame] += sample;
                    }
                }
                (s, t) if s == t => {
                    for (c, output) in outputs.iter_mut().take(s as usize).enumerate() {
                        output[frame] += channel_reads[c][frame] * gain;
                    }
                }
                (s, t) => {
                    for (c, reads) in channel_reads.iter().enumerate().take(s as usize) {
                        let tgt = c.min(t as usize - 1);
                        outputs[tgt][frame] += reads[frame] * gain;
                    }
                }
            }
        }
        min_read
    }

    fn mix_sparse(
        &self,
        models: &mut HashMap<ModelId, ModelEntry>,
        id: ModelId,
        model: Arc<dyn crate::model::SparseModel>,
        start_frame: u64,
        frame_count: usize,
        outputs: &mut [Vec<f32>],
        target_channels: u16,
    ) -> usize {
        let points = model.points_in(start_frame, start_frame + frame_count as u64);
        let reference_pitch = self.clip_mixer.lock().unwrap().as_ref().map(|m| m.reference_pitch());
        let Some(reference_pitch) = reference_pitch else {
            return frame_count;
        };
        let entry = models.get_mut(&id).unwrap();
        let new_notes: Vec<NoteStart> = points
            .iter()
            .map(|p| NoteStart {
                id: entry.next_voice_id(id),
                frame_offset: (p.frame - start_frame) as usize,
                frequency: reference_pitch,
                level: entry.params.gain,
                pan: entry.params.pan,
            })
            .collect();

        self.render_clip_mixer(&new_notes, &[], outputs, target_channels);
        frame_count
    }

    #[allow(clippy::too_many_arguments)]
    fn mix_note(
        &self,
        models: &mut HashMap<ModelId, ModelEntry>,
        id: ModelId,
        model: Arc<dyn crate::model::NoteModel>,
        start_frame: u64,
        frame_count: usize,
        outputs: &mut [Vec<f32>],
        target_channels: u16,
    ) -> usize {
        let end_frame = start_frame + frame_count as u64;
        let notes = model.notes_in(start_frame, end_frame);

        let use_plugin = {
            let entry = models.get(&id).unwrap();
            !entry.plugin_disabled
                && entry.params.plugin.plugin_id.is_some()
                && self.plugin_host.is_some()
        };

        if use_plugin {
            let host = self.plugin_host.clone().unwrap();
            let entry = models.get_mut(&id).unwrap();
            let plugin_id = entry.params.plugin.plugin_id.clone().unwrap();
            let program = entry.params.plugin.program.unwrap_or(0);

            let mut events: Vec<PluginEvent> = Vec::new();
            for note in &notes {
                events.push(PluginEvent::NoteOn {
                    frame_offset: (note.frame - start_frame) as usize,
                    pitch: note.pitch,
                    velocity: note.velocity,
                });
                entry.pending_note_offs.insert(NoteOff { frame: note.frame + note.duration, pitch: note.pitch });
            }
            let due: Vec<NoteOff> = entry
                .pending_note_offs
                .iter()
                .filter(|n| n.frame < end_frame)
                .copied()
                .collect();
            for off in &due {
                entry.pending_note_offs.remove(off);
                events.push(PluginEvent::NoteOff {
                    frame_offset: (off.frame.max(start_frame) - start_frame) as usize,
                    pitch: off.pitch,
                });
            }

            match host.run(&plugin_id, program, frame_count, &events, outputs) {
                Ok(()) => return frame_count,
                Err(_) => {
                    entry.plugin_disabled = true;
                    self.events.emit(PlayEvent::PluginOverloadDisabled { model: id });
                    // Fall through to the clip mixer fallback for this block.
                }
            }
        }

        let entry = models.get_mut(&id).unwrap();
        let mut new_notes = Vec::with_capacity(notes.len());
        for note in &notes {
            let voice_id = entry.next_voice_id(id);
            entry.active_voices.insert(note.pitch, voice_id);
            entry
                .pending_note_offs
                .insert(NoteOff { frame: note.frame + note.duration, pitch: note.pitch });
            new_notes.push(NoteStart {
                id: voice_id,
                frame_offset: (note.frame - start_frame) as usize,
                frequency: pitch_to_frequency(note.pitch),
                level: note.velocity as f32 / 127.0,
                pan: entry.params.pan,
            });
        }

        let due: Vec<NoteOff> = entry
            .pending_note_offs
            .iter()
            .filter(|n| n.frame < end_frame)
            .copied()
            .collect();
        let mut ending_notes = Vec::with_capacity(due.len());
        for off in &due {
            entry.pending_note_offs.remove(off);
            if let Some(voice_id) = entry.active_voices.remove(&off.pitch) {
                ending_notes.push(NoteEnd {
                    id: voice_id,
                    frame_offset: (off.frame.max(start_frame) - start_frame) as usize,
                });
            }
        }

        self.render_clip_mixer(&new_notes, &ending_notes, outputs, target_channels);
        frame_count
    }

    fn render_clip_mixer(
        &self,
        new_notes: &[NoteStart],
        ending_notes: &[NoteEnd],
        outputs: &mut [Vec<f32>],
        target_channels: u16,
    ) {
        let mut guard = self.clip_mixer.lock().unwrap();
        let Some(mixer) = guard.as_mut() else { return };
        let block_len = outputs.first().map(|c| c.len()).unwrap_or(0);
        let mut planar: Vec<Vec<f32>> = (0..target_channels.min(outputs.len() as u16))
            .map(|_| vec![0.0f32; block_len])
            .collect();
        mixer.mix(&mut planar, 1.0, new_notes, ending_notes);
        for (out, rendered) in outputs.iter_mut().zip(planar.iter()) {
            for (o, r) in out.iter_mut().zip(rendered.iter()) {
                *o += *r;
            }
        }
    }
}

fn remaining_frames(handle: &ModelHandle, start_frame: u64, frame_count: usize) -> usize {
    let end = handle.end_frame();
    if start_frame >= end {
        0
    } else {
        frame_count.min((end - start_frame) as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{NotePoint, SparseModel, SparsePoint};

    struct ConstDense {
        value: f32,
        channels: u16,
        end: u64,
    }

    impl DenseModel for ConstDense {
        fn sample_rate(&self) -> u32 {
            44_100
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

    struct FixedSparse {
        points: Vec<u64>,
    }

    impl SparseModel for FixedSparse {
        fn sample_rate(&self) -> u32 {
            44_100
        }
        fn start_frame(&self) -> u64 {
            0
        }
        fn end_frame(&self) -> u64 {
            u64::MAX
        }
        fn points_in(&self, start: u64, end: u64) -> Vec<SparsePoint> {
            self.points.iter().filter(|&&f| f >= start && f < end).map(|&f| SparsePoint { frame: f }).collect()
        }
    }

    fn test_clip_mixer() -> ClipMixer {
        ClipMixer::new(vec![vec![0.4f32; 4096]; 2], 44_100, 440.0, 44_100, 64)
    }

    #[test]
    fn dense_mono_pans_center_into_stereo() {
        let events = Arc::new(EventDispatcher::new());
        let gen = AudioGenerator::new(events);
        let model: Arc<dyn DenseModel> = Arc::new(ConstDense { value: 0.5, channels: 1, end: 10_000 });
        let id = ModelId::next();
        gen.add_model(id, ModelHandle::Dense(model));
        gen.set_play_parameters(id, PlayParameters { gain: 1.0, pan: 0.0, mute: false, ..Default::default() });
        gen.set_target_channel_count(2);

        let mut outputs = vec![vec![0.0f32; 1024], vec![0.0f32; 1024]];
        let rendered = gen.mix_models(0, 1024, &mut outputs).unwrap();
        assert_eq!(rendered, 1024);
        assert!((outputs[0][0] - outputs[1][0]).abs() < 1e-6);
        assert!(outputs[0][0] > 0.0);
    }

    #[test]
    fn muted_dense_model_produces_silence() {
        let events = Arc::new(EventDispatcher::new());
        let gen = AudioGenerator::new(events);
        let model: Arc<dyn DenseModel> = Arc::new(ConstDense { value: 0.5, channels: 1, end: 10_000 });
        let id = ModelId::next();
        gen.add_model(id, ModelHandle::Dense(model));
        gen.set_play_parameters(id, PlayParameters { mute: true, ..Default::default() });
        gen.set_target_channel_count(2);

        let mut outputs = vec![vec![0.0f32; 256], vec![0.0f32; 256]];
        gen.mix_models(0, 256, &mut outputs).unwrap();
        assert!(outputs[0].iter().all(|s| *s == 0.0));
    }

    #[test]
    fn sparse_instants_trigger_clip_mixer_voices() {
        let events = Arc::new(EventDispatcher::new());
        let gen = AudioGenerator::new(events);
        gen.set_clip_mixer(test_clip_mixer());
        let model: Arc<dyn SparseModel> = Arc::new(FixedSparse { points: vec![0, 512] });
        let id = ModelId::next();
        gen.add_model(id, ModelHandle::Sparse(model));
        gen.set_target_channel_count(2);

        let mut outputs = vec![vec![0.0f32; 1024], vec![0.0f32; 1024]];
        gen.mix_models(0, 1024, &mut outputs).unwrap();
        assert!(outputs[0].iter().any(|s| s.abs() > 1e-6));
    }

    #[test]
    fn reset_clears_pending_note_offs() {
        let events = Arc::new(EventDispatcher::new());
        let gen = AudioGenerator::new(events);
        gen.set_clip_mixer(test_clip_mixer());
        let id = ModelId::next();
        gen.add_model(id, ModelHandle::Note(Arc::new(FixedNotes { notes: vec![] })));
        {
            let mut models = gen.models.lock().unwrap();
            models.get_mut(&id).unwrap().pending_note_offs.insert(NoteOff { frame: 100, pitch: 60 });
        }
        gen.reset();
        let models = gen.models.lock().unwrap();
        assert!(models.get(&id).unwrap().pending_note_offs.is_empty());
    }

    struct FixedNotes {
        notes: Vec<NotePoint>,
    }

    impl crate::model::NoteModel for FixedNotes {
        fn sample_rate(&self) -> u32 {
            44_100
        }
        fn start_frame(&self) -> u64 {
            0
        }
        fn end_frame(&self) -> u64 {
            u64::MAX
        }
        fn notes_in(&self, start: u64, end: u64) -> Vec<NotePoint> {
            self.notes.iter().filter(|n| n.frame >= start && n.frame < end).copied().collect()
        }
    }
}
