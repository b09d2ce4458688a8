//! scopeplay-core: a real-time audio playback core for a waveform viewer and
//! annotation editor. Mixes dense PCM models, sparse instant markers, and
//! pitched note events into a device-rate stream, with optional integer-ratio
//! slowdown and deferred reclamation of buffers the real-time callback might
//! still be touching when the fill thread replaces them.

pub mod audio_data;
pub mod clip_mixer;
pub mod config;
pub mod device;
pub mod error;
pub mod events;
pub mod generator;
pub mod model;
pub mod play_source;
pub mod ring_buffer;
pub mod scavenger;
pub mod stretch;
pub mod window;

pub use audio_data::{AudioDataLoader, BatchResampler, ClipAudio, ConvertToMono, DefaultAudioLoader, LoadOptions, ResamplerType, StreamingResampler};
pub use clip_mixer::{ClipMixer, NoteEnd, NoteStart};
pub use config::{PlaySourceConfig, DEFAULT_MAX_VOICES, MIN_RING_BUFFER_BLOCKS, MIN_UNDERRUN_THRESHOLD, PLUGIN_BLOCK_SIZE};
pub use device::CpalDeviceAdapter;
pub use error::{PlayCoreError, Result};
pub use events::{EventDispatcher, PlayEvent};
pub use generator::{pitch_to_frequency, AudioGenerator, PluginEvent, PluginHost};
pub use model::{
    DenseModel, ModelHandle, ModelId, NoteModel, NoteOff, NotePoint, PlayParameters, PluginSelection,
    SparseModel, SparsePoint,
};
pub use play_source::{AudioCallbackPlaySource, AudioPlaySource};
pub use ring_buffer::{RingBuffer, RingBufferVector};
pub use scavenger::Scavenger;
pub use stretch::{IntegerTimeStretcher, TimeStretcherData};
pub use window::{Window, WindowType};
