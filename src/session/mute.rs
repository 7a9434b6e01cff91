//! Microphone mute composition.
//!
//! Three independent sources can demand a mute: the user, the volume gate and
//! the presentation (idle/intro/ending/error screens, or a forced mute during
//! teardown). The microphone is muted whenever any of them asks for it. The
//! result is recomputed from the inputs on every change, never cached.

/// Who is asking for the microphone to be muted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MuteSource {
    User,
    VolumeGate,
    Presentation,
}

/// Inputs to the single authoritative mute flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MuteIntent {
    user: bool,
    volume_gate: bool,
    presentation: bool,
}

impl Default for MuteIntent {
    /// No session is running yet, so the presentation demands a mute.
    fn default() -> Self {
        Self {
            user: false,
            volume_gate: false,
            presentation: true,
        }
    }
}

impl MuteIntent {
    /// Record one source's demand. The latest call from a source wins.
    pub fn set(&mut self, source: MuteSource, muted: bool) {
        match source {
            MuteSource::User => self.user = muted,
            MuteSource::VolumeGate => self.volume_gate = muted,
            MuteSource::Presentation => self.presentation = muted,
        }
    }

    pub fn demand(&self, source: MuteSource) -> bool {
        match source {
            MuteSource::User => self.user,
            MuteSource::VolumeGate => self.volume_gate,
            MuteSource::Presentation => self.presentation,
        }
    }

    pub fn is_muted(&self) -> bool {
        self.user || self.volume_gate || self.presentation
    }

    /// Forced mute used on teardown: everything but the user's own choice resets.
    pub fn force(&mut self) {
        self.volume_gate = false;
        self.presentation = true;
    }
}
