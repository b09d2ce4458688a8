//! Abstract model capability traits.
//!
//! The document/session model, waveform rendering, undo history and every
//! other collaborator that owns these models is out of scope for this crate
//! (see spec §1 non-goals). What the playback core needs from a model is a
//! small read-only capability interface, re-expressed here as traits instead
//! of the virtual class hierarchy the distilled spec describes in §9.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Opaque handle identifying a model added to a play source. Cheap to copy
/// and compare; carries no borrow of the model itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModelId(u64);

impl ModelId {
    pub(crate) fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ModelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "model#{}", self.0)
    }
}

/// Multi-channel PCM data, addressable by frame range.
pub trait DenseModel: Send + Sync {
    fn sample_rate(&self) -> u32;
    fn channel_count(&self) -> u16;
    fn start_frame(&self) -> u64;
    fn end_frame(&self) -> u64;

    /// Reads up to `out.len()` samples of channel `channel` starting at
    /// `start`, returning the number of samples actually written. Frames
    /// past `end_frame()` are simply not written (caller sees a short read).
    fn read(&self, channel: u16, start: u64, out: &mut [f32]) -> usize;
}

/// A time-stamped instant with no intrinsic duration or pitch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SparsePoint {
    pub frame: u64,
}

/// Time-stamped instants, e.g. onset markers or annotation points.
pub trait SparseModel: Send + Sync {
    fn sample_rate(&self) -> u32;
    fn start_frame(&self) -> u64;
    fn end_frame(&self) -> u64;

    /// All points with `start <= frame < end`, in ascending frame order.
    fn points_in(&self, start: u64, end: u64) -> Vec<SparsePoint>;
}

/// A pitched, timed note event.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NotePoint {
    pub frame: u64,
    pub duration: u64,
    pub pitch: u8,
    pub velocity: u8,
}

/// Time-stamped pitched notes with duration and velocity.
pub trait NoteModel: Send + Sync {
    fn sample_rate(&self) -> u32;
    fn start_frame(&self) -> u64;
    fn end_frame(&self) -> u64;

    /// All notes starting within `start <= frame < end`, in ascending frame
    /// order.
    fn notes_in(&self, start: u64, end: u64) -> Vec<NotePoint>;
}

/// Tagged union over the three model variants, dispatched with a `match`
/// rather than a class hierarchy (spec §9 redesign flag).
#[derive(Clone)]
pub enum ModelHandle {
    Dense(Arc<dyn DenseModel>),
    Sparse(Arc<dyn SparseModel>),
    Note(Arc<dyn NoteModel>),
}

impl ModelHandle {
    pub fn sample_rate(&self) -> u32 {
        match self {
            ModelHandle::Dense(m) => m.sample_rate(),
            ModelHandle::Sparse(m) => m.sample_rate(),
            ModelHandle::Note(m) => m.sample_rate(),
        }
    }

    pub fn start_frame(&self) -> u64 {
        match self {
            ModelHandle::Dense(m) => m.start_frame(),
            ModelHandle::Sparse(m) => m.start_frame(),
            ModelHandle::Note(m) => m.start_frame(),
        }
    }

    pub fn end_frame(&self) -> u64 {
        match self {
            ModelHandle::Dense(m) => m.end_frame(),
            ModelHandle::Sparse(m) => m.end_frame(),
            ModelHandle::Note(m) => m.end_frame(),
        }
    }
}

/// Per-model plugin selection, nullable (falls back to `ClipMixer`).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PluginSelection {
    pub plugin_id: Option<String>,
    pub program: Option<u32>,
}

/// Per-model playback parameters, read by the generator under the play
/// source mutex. Changes arrive through `AudioCallbackPlaySource::
/// set_play_parameters` and are read back with `play_parameters`.
#[derive(Debug, Clone, PartialEq)]
pub struct PlayParameters {
    /// Linear gain, >= 0. 1.0 is unity.
    pub gain: f32,
    /// Stereo pan in [-1, 1], 0 is center.
    pub pan: f32,
    pub mute: bool,
    pub plugin: PluginSelection,
}

impl Default for PlayParameters {
    fn default() -> Self {
        Self { gain: 1.0, pan: 0.0, mute: false, plugin: PluginSelection::default() }
    }
}

/// A pending note-off, ordered by frame so the generator can pop due
/// note-offs off the front as the block advances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct NoteOff {
    pub frame: u64,
    pub pitch: u8,
}
