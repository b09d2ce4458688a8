//! Event types for scopeplay-core and the observer registry that replaces
//! the Qt signal/slot coupling of the original play source.

use crate::model::ModelId;
use std::sync::Mutex;

/// One playback-core event. Emitted from non-RT code (the fill thread or a
/// control thread) only; the RT callback never emits events, it only
/// degrades silently (see `PlayCoreError` policy).
#[derive(Debug, Clone, PartialEq)]
pub enum PlayEvent {
    SampleRateMismatch { model: ModelId, model_rate: u32, source_rate: u32 },
    ModelAdded { model: ModelId },
    ModelRemoved { model: ModelId },
    BufferUnderrun { frames_short: usize },
    BufferOverrun,
    StretcherOverload,
    PluginOverloadDisabled { model: ModelId },
    ClipLoadFailed { reason: String },
    SourceVolumeChanged { model: ModelId, old_gain: f32, new_gain: f32 },
    SourcePanChanged { model: ModelId, old_pan: f32, new_pan: f32 },
    PlaybackStarted { frame: u64 },
    PlaybackStopped,
    PlaybackEnded,
    EngineError { message: String },
}

impl PlayEvent {
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            Self::BufferUnderrun { .. }
                | Self::BufferOverrun
                | Self::StretcherOverload
                | Self::PluginOverloadDisabled { .. }
                | Self::ClipLoadFailed { .. }
                | Self::EngineError { .. }
        )
    }
}

type Listener = Box<dyn Fn(&PlayEvent) + Send + 'static>;

/// Observer list standing in for the play source's former signal/slot base
/// class. `subscribe` may be called from any thread; `emit` is only ever
/// called from non-RT code.
#[derive(Default)]
pub struct EventDispatcher {
    listeners: Mutex<Vec<Listener>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self { listeners: Mutex::new(Vec::new()) }
    }

    pub fn subscribe<F>(&self, listener: F)
    where
        F: Fn(&PlayEvent) + Send + 'static,
    {
        self.listeners.lock().unwrap().push(Box::new(listener));
    }

    pub fn emit(&self, event: PlayEvent) {
        let Ok(listeners) = self.listeners.lock() else { return };
        for listener in listeners.iter() {
            listener(&event);
        }
    }
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self.listeners.lock().map(|l| l.len()).unwrap_or(0);
        f.debug_struct("EventDispatcher").field("listeners", &count).finish()
    }
}
