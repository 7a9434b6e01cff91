//! Debounce-then-countdown chain that decides a conversation has ended.
//!
//! `avatar stopped speaking` arms a debounce. When it expires the shared
//! [`SpeechActivity`](crate::speech::SpeechActivity) is consulted: recent or
//! untrustworthy speech aborts the chain, otherwise a countdown is armed.
//! When the countdown expires the sequencer asks for the session to be stopped
//! and, after a short settle delay, for the ending presentation.
//!
//! The sequencer never touches the session or the presentation itself; it only
//! returns [`EndingIntent`]s.

use crate::config::EndingConfig;
use crate::speech::SharedSpeechActivity;
use crate::timer::{self, TimerFired, TimerHandle, TimerKind, Timers};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// Observable phase of the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndingPhase {
    Idle,
    Debouncing,
    CountingDown,
}

/// Requests emitted when the chain runs to completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndingIntent {
    /// Countdown elapsed: tear the session down.
    StopSession,
    /// Settle delay after the stop elapsed: play the ending clip.
    ShowEnding { language: String },
}

pub struct EndingSequencer {
    config: EndingConfig,
    timers: Timers,
    speech: SharedSpeechActivity,
    language: String,
    debounce: Option<TimerHandle>,
    countdown: Option<TimerHandle>,
    settle: Option<TimerHandle>,
}

impl EndingSequencer {
    pub fn new(
        config: EndingConfig,
        timers: Timers,
        speech: SharedSpeechActivity,
        language: impl Into<String>,
    ) -> Self {
        Self {
            config,
            timers,
            speech,
            language: language.into(),
            debounce: None,
            countdown: None,
            settle: None,
        }
    }

    pub fn phase(&self) -> EndingPhase {
        if self.countdown.is_some() {
            EndingPhase::CountingDown
        } else if self.debounce.is_some() {
            EndingPhase::Debouncing
        } else {
            EndingPhase::Idle
        }
    }

    pub fn debounce_armed(&self) -> bool {
        self.debounce.is_some()
    }

    pub fn countdown_armed(&self) -> bool {
        self.countdown.is_some()
    }

    /// Language carried by the next ending request.
    pub fn set_language(&mut self, language: &str) {
        self.language = language.to_owned();
    }

    pub fn language(&self) -> &str {
        &self.language
    }

    /// Avatar went quiet: restart the chain from the debounce.
    pub fn on_avatar_stopped(&mut self) {
        self.cancel_chain();
        let delay = Duration::from_millis(self.config.debounce_ms);
        self.debounce = Some(self.timers.arm(TimerKind::Debounce, delay));
        debug!(debounce_ms = self.config.debounce_ms, "ending debounce armed");
    }

    /// Avatar or user speech: the conversation is still going.
    pub fn on_activity(&mut self) {
        if self.phase() != EndingPhase::Idle {
            debug!("speech activity, ending chain cancelled");
        }
        self.cancel_chain();
    }

    /// The session went away through some other path.
    ///
    /// A pending settle timer is left alone: it belongs to the stop this
    /// sequencer itself requested.
    pub fn on_session_stopped(&mut self) {
        self.cancel_chain();
    }

    /// Forget everything, including a pending ending request.
    pub fn reset(&mut self) {
        self.cancel_chain();
        self.settle = None;
    }

    fn cancel_chain(&mut self) {
        self.debounce = None;
        self.countdown = None;
    }

    /// Handle a timer owned by the sequencer. Stale or foreign fires return `None`.
    pub fn on_timer(&mut self, fired: &TimerFired, now: Instant) -> Option<EndingIntent> {
        if timer::claim(&mut self.debounce, fired) {
            let window = Duration::from_millis(self.config.recent_speech_window_ms);
            if self.speech.snapshot().spoke_within(window, now) {
                debug!("recent avatar speech at debounce expiry, ending chain aborted");
                return None;
            }
            let delay = Duration::from_millis(self.config.countdown_ms);
            self.countdown = Some(self.timers.arm(TimerKind::Countdown, delay));
            info!(countdown_ms = self.config.countdown_ms, "silence confirmed, ending countdown started");
            return None;
        }

        if timer::claim(&mut self.countdown, fired) {
            let delay = Duration::from_millis(self.config.settle_delay_ms);
            self.settle = Some(self.timers.arm(TimerKind::Settle, delay));
            info!("ending countdown elapsed, stopping session");
            return Some(EndingIntent::StopSession);
        }

        if timer::claim(&mut self.settle, fired) {
            return Some(EndingIntent::ShowEnding {
                language: self.language.clone(),
            });
        }

        None
    }
}
