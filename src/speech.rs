//! Shared record of whether the avatar is talking and when it last did.
//!
//! The session layer writes it on every speech-related transport event; the
//! ending sequencer and the disconnect recheck read it. It lives for one
//! session and is reset on stop.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

/// Snapshot of avatar speech activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpeechActivity {
    pub is_avatar_speaking: bool,
    /// Most recent speech-related event. `None` until the avatar has spoken.
    pub last_speech_at: Option<Instant>,
}

impl SpeechActivity {
    /// Whether speech happened less than `window` before `now`.
    ///
    /// A missing timestamp or one later than `now` cannot be trusted and is
    /// reported as recent, so callers err on the side of "still talking".
    pub fn spoke_within(&self, window: Duration, now: Instant) -> bool {
        match self.last_speech_at {
            None => true,
            Some(at) if at > now => true,
            Some(at) => now.duration_since(at) < window,
        }
    }
}

/// Cloneable handle to the session's [`SpeechActivity`].
#[derive(Debug, Clone, Default)]
pub struct SharedSpeechActivity {
    inner: Arc<Mutex<SpeechActivity>>,
}

impl SharedSpeechActivity {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> SpeechActivity {
        *self.lock()
    }

    pub fn is_avatar_speaking(&self) -> bool {
        self.lock().is_avatar_speaking
    }

    pub fn avatar_started(&self, now: Instant) {
        let mut activity = self.lock();
        activity.is_avatar_speaking = true;
        activity.last_speech_at = Some(now);
    }

    pub fn avatar_stopped(&self, now: Instant) {
        let mut activity = self.lock();
        activity.is_avatar_speaking = false;
        activity.last_speech_at = Some(now);
    }

    /// Partial transcript from the avatar: it is still producing speech.
    pub fn touch(&self, now: Instant) {
        self.lock().last_speech_at = Some(now);
    }

    pub fn reset(&self) {
        *self.lock() = SpeechActivity::default();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SpeechActivity> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
