//! Polyphonic sampler: plays any number of simultaneous pitched notes by
//! resampling a single preloaded clip, used as the default renderer for
//! sparse and note models that have no plugin assigned.

use crate::config::voice_fade_frames;
use std::f32::consts::PI;

/// Equal-power pan law. `channel_count != 2` falls back to an even split —
/// this core only has a stereo-pan concept, matching the `PlayParameters`
/// data model (§3.1: pan is a single scalar in [-1, 1]).
pub(crate) fn pan_gain(pan: f32, channel: u16, channel_count: u16) -> f32 {
    if channel_count != 2 {
        return if channel_count == 0 { 0.0 } else { 1.0 / (channel_count as f32).sqrt() };
    }
    let angle = (pan.clamp(-1.0, 1.0) + 1.0) * (PI / 4.0);
    if channel == 0 {
        angle.cos()
    } else {
        angle.sin()
    }
}

/// Raised-cosine ramp from 0 to 1 (`rising = true`) or 1 to 0 (`rising =
/// false`) as `t` goes from 0 to 1.
fn cosine_ramp(t: f32, rising: bool) -> f32 {
    let t = t.clamp(0.0, 1.0);
    let c = 0.5 - 0.5 * (PI * t).cos();
    if rising {
        c
    } else {
        1.0 - c
    }
}

/// A note to start this block.
#[derive(Debug, Clone, Copy)]
pub struct NoteStart {
    /// Caller-assigned identity, used to match a later `NoteEnd`.
    pub id: u64,
    /// Offset, in frames, into the current block where the note begins.
    pub frame_offset: usize,
    /// Target frequency in Hz.
    pub frequency: f32,
    pub level: f32,
    pub pan: f32,
}

/// A note to end this block, matched against a currently-sounding voice by
/// `id`. `frame_offset` is where in the block the note-off actually lands;
/// the voice keeps sounding at full level until then and fades out over the
/// remainder of the block from that point.
#[derive(Debug, Clone, Copy)]
pub struct NoteEnd {
    pub id: u64,
    pub frame_offset: usize,
}

struct FadeOut {
    start_offset: usize,
    frames_elapsed: usize,
    fade_len: usize,
}

struct Voice {
    id: u64,
    level: f32,
    pan: f32,
    /// Offset into the current block, in frames, before this voice starts
    /// rendering. Only meaningful during the block the voice was started in;
    /// zero for every later block.
    start_offset: usize,
    /// Fractional read position into the clip, in source-clip samples.
    phase: f64,
    /// Source samples to advance per output frame.
    ratio: f64,
    /// Output frames until the clip is exhausted at this pitch/rate.
    duration_frames: u64,
    frames_rendered: u64,
    fade_in_len: usize,
    fade_out: Option<FadeOut>,
}

/// A single preloaded clip, resampled on the fly to synthesize pitched
/// voices. `channels` holds planar PCM at the clip's native sample rate.
pub struct ClipMixer {
    channels: Vec<Vec<f32>>,
    clip_length: usize,
    native_rate: u32,
    reference_pitch: f32,
    output_rate: u32,
    max_voices: usize,
    voices: Vec<Voice>,
}

impl ClipMixer {
    pub fn new(
        channels: Vec<Vec<f32>>,
        native_rate: u32,
        reference_pitch: f32,
        output_rate: u32,
        max_voices: usize,
    ) -> Self {
        let clip_length = channels.first().map(|c| c.len()).unwrap_or(0);
        Self {
            channels,
            clip_length,
            native_rate,
            reference_pitch,
            output_rate,
            max_voices,
            voices: Vec::new(),
        }
    }

    pub fn voice_count(&self) -> usize {
        self.voices.len()
    }

    /// The clip's reference pitch in Hz — the frequency a voice plays back
    /// at its native rate and speed.
    pub fn reference_pitch(&self) -> f32 {
        self.reference_pitch
    }

    pub fn reset(&mut self) {
        self.voices.clear();
    }

    pub fn set_output_rate(&mut self, output_rate: u32) {
        self.output_rate = output_rate;
    }

    /// Renders one block into `outputs` (planar, one `Vec<f32>` per channel,
    /// all the same length). Adds into `outputs` rather than overwriting, so
    /// callers can mix several sources into the same buffers.
    pub fn mix(&mut self, outputs: &mut [Vec<f32>], gain: f32, new_notes: &[NoteStart], ending_notes: &[NoteEnd]) -> usize {
        let channel_count = outputs.len() as u16;
        let block_size = outputs.first().map(|c| c.len()).unwrap_or(0);
        if channel_count == 0 || block_size == 0 || self.clip_length < 2 {
            return block_size;
        }
        let fade_len = voice_fade_frames(self.output_rate).max(1);

        for end in ending_notes {
            if let Some(voice) = self.voices.iter_mut().find(|v| v.id == end.id) {
                if voice.fade_out.is_none() {
                    voice.fade_out = Some(FadeOut {
                        start_offset: end.frame_offset.min(block_size),
                        frames_elapsed: 0,
                        fade_len,
                    });
                }
            }
        }

        for note in new_notes {
            if self.voices.len() >= self.max_voices {
                self.voices.remove(0);
            }
            let ratio = (note.frequency as f64 / self.reference_pitch as f64)
                * (self.native_rate as f64 / self.output_rate as f64);
            if ratio <= 0.0 {
                continue;
            }
            let duration_frames = (self.clip_length as f64 / ratio).floor().max(0.0) as u64;
            self.voices.push(Voice {
                id: note.id,
                level: note.level,
                pan: note.pan,
                start_offset: note.frame_offset.min(block_size),
                phase: 0.0,
                ratio,
                duration_frames,
                frames_rendered: 0,
                fade_in_len: fade_len,
                fade_out: None,
            });
        }

        self.voices.retain_mut(|voice| {
            let mut kill = false;
            for frame in voice.start_offset..block_size {
                if voice.frames_rendered >= voice.duration_frames {
                    kill = true;
                    break;
                }
                let idx0 = voice.phase.floor() as usize;
                if idx0 + 1 >= self.clip_length {
                    kill = true;
                    break;
                }
                let frac = (voice.phase - idx0 as f64) as f32;

                let mut envelope = 1.0f32;
                if (voice.frames_rendered as usize) < voice.fade_in_len {
                    envelope *= cosine_ramp(voice.frames_rendered as f32 / voice.fade_in_len as f32, true);
                }
                let fading = voice.fade_out.as_ref().is_some_and(|fo| frame >= fo.start_offset);
                if let Some(fo) = &voice.fade_out {
                    if fading {
                        envelope *= cosine_ramp(fo.frames_elapsed as f32 / fo.fade_len as f32, false);
                    }
                }

                for (c, output) in outputs.iter_mut().enumerate() {
                    let clip_channel = c.min(self.channels.len() - 1);
                    let s0 = self.channels[clip_channel][idx0];
                    let s1 = self.channels[clip_channel][idx0 + 1];
                    let sample = s0 + (s1 - s0) * frac;
                    let level = gain * voice.level * pan_gain(voice.pan, c as u16, channel_count) * envelope;
                    output[frame] += sample * level;
                }

                voice.phase += voice.ratio;
                voice.frames_rendered += 1;
                if fading {
                    if let Some(fo) = &mut voice.fade_out {
                        fo.frames_elapsed += 1;
                        if fo.frames_elapsed >= fo.fade_len {
                            kill = true;
                        }
                    }
                }
                if kill {
                    break;
                }
            }
            voice.start_offset = 0;
            !kill
        });

        block_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn silent_clip(len: usize, channels: usize) -> Vec<Vec<f32>> {
        vec![vec![0.3f32; len]; channels]
    }

    #[test]
    fn equal_power_pan_preserves_energy_at_center() {
        let left = pan_gain(0.0, 0, 2);
        let right = pan_gain(0.0, 1, 2);
        assert!((left * left + right * right - 1.0).abs() < 1e-6);
        assert!((left - right).abs() < 1e-6);
    }

    #[test]
    fn hard_left_pan_silences_the_right_channel() {
        let right = pan_gain(-1.0, 1, 2);
        assert!(right.abs() < 1e-6);
    }

    #[test]
    fn new_note_produces_non_silent_output() {
        let mut mixer = ClipMixer::new(silent_clip(4096, 2), 44100, 440.0, 44100, 64);
        let mut outputs = vec![vec![0.0f32; 256]; 2];
        let notes = [NoteStart { id: 1, frame_offset: 0, frequency: 440.0, level: 1.0, pan: 0.0 }];
        mixer.mix(&mut outputs, 1.0, &notes, &[]);
        assert_eq!(mixer.voice_count(), 1);
        assert!(outputs[0].iter().any(|s| s.abs() > 1e-6));
    }

    #[test]
    fn ending_a_note_eventually_removes_its_voice() {
        let mut mixer = ClipMixer::new(silent_clip(44100 * 2, 1), 44100, 440.0, 44100, 64);
        let mut outputs = vec![vec![0.0f32; 256]];
        let notes = [NoteStart { id: 7, frame_offset: 0, frequency: 440.0, level: 1.0, pan: 0.0 }];
        mixer.mix(&mut outputs, 1.0, &notes, &[]);
        assert_eq!(mixer.voice_count(), 1);

        mixer.mix(&mut outputs, 1.0, &[], &[NoteEnd { id: 7, frame_offset: 0 }]);
        for _ in 0..10 {
            if mixer.voice_count() == 0 {
                break;
            }
            mixer.mix(&mut outputs, 1.0, &[], &[]);
        }
        assert_eq!(mixer.voice_count(), 0);
    }

    #[test]
    fn polyphony_ceiling_drops_oldest_voice() {
        let mut mixer = ClipMixer::new(silent_clip(4096, 1), 44100, 440.0, 44100, 2);
        let mut outputs = vec![vec![0.0f32; 64]];
        for id in 0..3u64 {
            let notes = [NoteStart { id, frame_offset: 0, frequency: 440.0, level: 1.0, pan: 0.0 }];
            mixer.mix(&mut outputs, 1.0, &notes, &[]);
        }
        assert_eq!(mixer.voice_count(), 2);
        assert!(mixer.voices.iter().all(|v| v.id != 0));
    }
}
