use crate::audio_data::{ClipAudio, LoadOptions};
use crate::error::Result;
use std::sync::Arc;

/// Trait for loading a sampler clip from a file path.
///
/// `ClipAudio::from_path` uses the default Symphonia-based implementation
/// (`DefaultAudioLoader`); callers can bring their own loader for
/// specialized formats it doesn't cover via `ClipAudio::from_path_with_loader`.
/// `ClipMixer` itself never loads files — it's constructed from already
/// decoded planar channels (`ClipAudio::planar_channels`).
///
/// # Example
///
/// ```ignore
/// use scopeplay_core::audio_data::{AudioDataLoader, ClipAudio, LoadOptions};
/// use scopeplay_core::error::Result;
/// use std::sync::Arc;
///
/// struct MyCustomLoader;
///
/// impl AudioDataLoader for MyCustomLoader {
///     fn load(&self, path: &str, options: &LoadOptions) -> Result<Arc<ClipAudio>> {
///         todo!()
///     }
/// }
/// ```
pub trait AudioDataLoader {
    /// Loads and decodes a clip file, returning its PCM data at its native rate.
    fn load(&self, path: &str, options: &LoadOptions) -> Result<Arc<ClipAudio>>;
}
