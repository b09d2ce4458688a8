use crate::{
    audio_data::{AudioDataLoader, ClipAudio, ConvertToMono, LoadOptions},
    error::{PlayCoreError, Result},
};
use std::fs::File;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use symphonia::{
    core::{
        audio::SampleBuffer, codecs::DecoderOptions, errors::Error, formats::FormatOptions,
        io::MediaSourceStream, meta::MetadataOptions, probe::Hint,
    },
    default::{get_codecs, get_probe},
};

/// Default clip loader, backed by Symphonia. Decodes WAV/FLAC/MP3/Vorbis
/// into f32 PCM at the file's native sample rate; `ClipMixer` resamples on
/// the fly per voice, so the loader never resamples itself.
///
/// ```ignore
/// use scopeplay_core::audio_data::{DefaultAudioLoader, AudioDataLoader, LoadOptions};
///
/// let loader = DefaultAudioLoader;
/// let clip = loader.load("kick.wav", &LoadOptions::default())?;
/// ```
pub struct DefaultAudioLoader;

impl AudioDataLoader for DefaultAudioLoader {
    fn load(&self, path: &str, options: &LoadOptions) -> Result<Arc<ClipAudio>> {
        let file =
            File::open(path).map_err(|e| PlayCoreError::Io(std::io::Error::new(e.kind(), e)))?;

        let mss = MediaSourceStream::new(Box::new(file), Default::default());

        let mut hint = Hint::new();
        if let Some(ext) = Path::new(path).extension().and_then(|e| e.to_str()) {
            hint.with_extension(ext);
        }

        let probe = get_probe();
        let probed = probe
            .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
            .map_err(|e| PlayCoreError::ClipLoading(format!("failed to probe clip format: {e:?}")))?;

        let mut format = probed.format;

        let track = format
            .default_track()
            .ok_or_else(|| PlayCoreError::ClipLoading("no default audio track in clip".into()))?;

        let sample_rate = track
            .codec_params
            .sample_rate
            .ok_or_else(|| PlayCoreError::ClipLoading("clip has no sample rate".into()))?;

        let channels = track
            .codec_params
            .channels
            .ok_or_else(|| PlayCoreError::ClipLoading("clip has no channel layout".into()))?
            .count() as u16;

        let mut decoder = get_codecs()
            .make(&track.codec_params, &DecoderOptions::default())
            .map_err(|e| PlayCoreError::ClipLoading(format!("failed to create decoder: {e:?}")))?;

        let mut samples: Vec<f32> = Vec::new();

        loop {
            let packet = match format.next_packet() {
                Ok(packet) => packet,
                Err(Error::IoError(_)) => break,
                Err(e) => {
                    return Err(PlayCoreError::ClipLoading(format!("error reading packet: {e:?}")));
                }
            };

            let decoded = match decoder.decode(&packet) {
                Ok(decoded) => decoded,
                Err(Error::IoError(_)) => break,
                Err(Error::DecodeError(_)) => continue,
                Err(e) => {
                    return Err(PlayCoreError::ClipLoading(format!("error decoding packet: {e:?}")));
                }
            };

            let spec = *decoded.spec();
            let capacity = decoded.capacity();
            let mut tmp = SampleBuffer::<f32>::new(capacity as u64, spec);
            tmp.copy_interleaved_ref(decoded);
            samples.extend_from_slice(tmp.samples());
        }

        let (final_samples, final_channels) = match options.convert_to_mono {
            ConvertToMono::Original => (samples, channels),
            ConvertToMono::ForceMono if channels == 1 => (samples, 1),
            ConvertToMono::ForceMono => {
                let mono: Vec<f32> = samples
                    .chunks(channels as usize)
                    .map(|frame| frame.iter().sum::<f32>() / channels as f32)
                    .collect();
                (mono, 1)
            }
        };

        let duration = Duration::from_secs_f64(
            final_samples.len() as f64 / (sample_rate * final_channels as u32) as f64,
        );

        log::debug!(
            "loaded clip {path}: {sample_rate} Hz, {final_channels} ch, {:.2}s",
            duration.as_secs_f64()
        );

        Ok(Arc::new(ClipAudio::new(final_samples, sample_rate, final_channels, duration)))
    }
}
