//! Live media stream handed over by the avatar transport.
//!
//! The transport pushes decoded avatar audio into an [`AudioTap`]; the volume
//! gate reads the most recent frame from it through [`AudioFrameSource`].

use std::sync::{Arc, Mutex, PoisonError};

/// Anything the volume gate can sample.
pub trait AudioFrameSource: Send + 'static {
    /// The most recent mono frame, or `None` if nothing new is available.
    fn latest_frame(&mut self) -> Option<Vec<f32>>;

    /// Release resources held for analysis. Called at most once by the gate.
    fn release(&mut self) {}
}

#[derive(Debug, Default)]
struct TapState {
    latest: Option<Vec<f32>>,
    closed: bool,
}

/// Single-slot audio frame buffer shared between the transport and the gate.
///
/// Writers overwrite the slot; readers take it. After [`AudioTap::close`]
/// pushes are dropped and reads return `None`.
#[derive(Debug, Clone, Default)]
pub struct AudioTap {
    state: Arc<Mutex<TapState>>,
}

impl AudioTap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, frame: Vec<f32>) {
        let mut state = self.lock();
        if !state.closed {
            state.latest = Some(frame);
        }
    }

    pub fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        state.latest = None;
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TapState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl AudioFrameSource for AudioTap {
    fn latest_frame(&mut self) -> Option<Vec<f32>> {
        self.lock().latest.take()
    }

    fn release(&mut self) {
        self.close();
    }
}

/// Media stream reference held by the session while connected.
#[derive(Debug, Clone)]
pub struct MediaStream {
    /// Transport-assigned stream identifier.
    pub id: String,
    audio: Option<AudioTap>,
}

impl MediaStream {
    pub fn new(id: impl Into<String>, audio: Option<AudioTap>) -> Self {
        Self {
            id: id.into(),
            audio,
        }
    }

    /// Video-only stream (no analysable audio track).
    pub fn video_only(id: impl Into<String>) -> Self {
        Self::new(id, None)
    }

    /// Audio track as a sampling source for the volume gate.
    pub fn audio_source(&self) -> Option<Box<dyn AudioFrameSource>> {
        self.audio
            .clone()
            .map(|tap| Box::new(tap) as Box<dyn AudioFrameSource>)
    }

    pub fn has_audio(&self) -> bool {
        self.audio.is_some()
    }
}
