//! Sustain-based hysteresis for the volume gate.

use std::time::Duration;
use tokio::time::Instant;

/// What the gate wants done with the microphone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateAction {
    Mute,
    Unmute,
}

/// Two-sided debounce over a loudness series.
///
/// The level has to stay above the threshold for longer than the sustain
/// duration before a mute fires, and below it for longer than the sustain
/// duration before an unmute fires. Each action fires once per crossing.
#[derive(Debug, Clone)]
pub struct Hysteresis {
    threshold: f32,
    sustain: Duration,
    above_since: Option<Instant>,
    below_since: Option<Instant>,
    muted: bool,
}

impl Hysteresis {
    pub fn new(threshold: f32, sustain: Duration) -> Self {
        Self {
            threshold,
            sustain,
            above_since: None,
            below_since: None,
            muted: false,
        }
    }

    /// Feed one sample taken at `now`.
    pub fn observe(&mut self, level: f32, now: Instant) -> Option<GateAction> {
        if level > self.threshold {
            self.below_since = None;
            let since = *self.above_since.get_or_insert(now);
            if !self.muted && now.duration_since(since) > self.sustain {
                self.muted = true;
                return Some(GateAction::Mute);
            }
        } else {
            self.above_since = None;
            let since = *self.below_since.get_or_insert(now);
            if self.muted && now.duration_since(since) > self.sustain {
                self.muted = false;
                return Some(GateAction::Unmute);
            }
        }
        None
    }

    /// The gate's own view of whether it last asked for a mute.
    pub fn is_muted(&self) -> bool {
        self.muted
    }

    pub fn reset(&mut self) {
        self.above_since = None;
        self.below_since = None;
        self.muted = false;
    }
}
