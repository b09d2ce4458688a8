//! Error types for scopeplay-core

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PlayCoreError {
    #[error("audio device error: {0}")]
    AudioDevice(String),

    #[error("audio format error: {0}")]
    AudioFormat(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("clip loading error: {0}")]
    ClipLoading(String),

    #[error("ring buffer error: {0}")]
    RingBuffer(String),

    #[error("engine error: {0}")]
    Engine(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("sample rate mismatch: model is {model_rate} Hz, source is {source_rate} Hz")]
    SampleRateMismatch { model_rate: u32, source_rate: u32 },

    #[error("unknown model id {0}")]
    UnknownModel(u64),
}

pub type Result<T> = std::result::Result<T, PlayCoreError>;
