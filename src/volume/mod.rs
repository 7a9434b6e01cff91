//! Speaker-volume microphone gate.
//!
//! Samples the avatar's audio track every `check_interval_ms`, measures its
//! loudness, and asks for the microphone to be muted while the avatar is
//! audibly talking. The gate only emits [`GateAction`]s; the authoritative
//! mute flag lives in the session layer.

pub mod analyzer;
pub mod hysteresis;

pub use analyzer::LoudnessAnalyzer;
pub use hysteresis::{GateAction, Hysteresis};

use crate::config::VolumeGateConfig;
use crate::stream::AudioFrameSource;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type SharedSource = Arc<Mutex<Option<Box<dyn AudioFrameSource>>>>;

/// A [`GateAction`] tagged with the gate that produced it.
///
/// Actions already queued when a gate is replaced carry the old generation
/// and are dropped by [`VolumeGate::accepts`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateSignal {
    pub generation: u64,
    pub action: GateAction,
}

/// Running (or inert) volume gate.
///
/// A gate that could not start is still a valid value: it simply never emits
/// anything. A missing microphone is not fatal to the session.
pub struct VolumeGate {
    cancel: CancellationToken,
    source: SharedSource,
    generation: u64,
    running: bool,
}

impl VolumeGate {
    /// Start sampling `source`, sending actions tagged with `generation` to
    /// `actions`.
    ///
    /// Must be called from within a tokio runtime. Logs and returns an inert
    /// gate if there is no source or the analyser cannot be built.
    pub fn start(
        config: &VolumeGateConfig,
        generation: u64,
        source: Option<Box<dyn AudioFrameSource>>,
        actions: mpsc::UnboundedSender<GateSignal>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let Some(source) = source else {
            warn!("volume gate: no analysable audio track, gate disabled");
            return Self::inert(cancel, generation);
        };
        let mut analyzer = match LoudnessAnalyzer::new(config) {
            Ok(a) => a,
            Err(e) => {
                warn!("volume gate: analyser init failed, gate disabled: {e}");
                let mut source = source;
                source.release();
                return Self::inert(cancel, generation);
            }
        };

        let shared: SharedSource = Arc::new(Mutex::new(Some(source)));
        let task_source = Arc::clone(&shared);
        let task_cancel = cancel.clone();
        let mut hysteresis = Hysteresis::new(config.volume_threshold, config.sustain_duration());
        let mut ticker = tokio::time::interval(config.check_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            threshold = config.volume_threshold,
            sustain_ms = config.sustain_duration_ms,
            interval_ms = config.check_interval_ms,
            "volume gate started"
        );

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = task_cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let frame = {
                            let mut guard = task_source.lock().unwrap_or_else(PoisonError::into_inner);
                            match guard.as_mut() {
                                Some(src) => src.latest_frame(),
                                None => break,
                            }
                        };
                        let Some(frame) = frame else { continue };
                        let level = analyzer.level(&frame);
                        if let Some(action) = hysteresis.observe(level, Instant::now()) {
                            debug!(level, ?action, generation, "volume gate flipped");
                            if actions.send(GateSignal { generation, action }).is_err() {
                                break;
                            }
                        }
                    }
                }
            }
            debug!("volume gate sampling loop exited");
        });

        Self {
            cancel,
            source: shared,
            generation,
            running: true,
        }
    }

    fn inert(cancel: CancellationToken, generation: u64) -> Self {
        Self {
            cancel,
            source: Arc::new(Mutex::new(None)),
            generation,
            running: false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Whether `signal` came from this gate while it is still running.
    pub fn accepts(&self, signal: &GateSignal) -> bool {
        self.running && signal.generation == self.generation
    }

    /// Stop sampling and release the audio source. Safe to call repeatedly.
    pub fn stop(&mut self) {
        self.cancel.cancel();
        let taken = self
            .source
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut source) = taken {
            source.release();
            info!("volume gate stopped");
        }
        self.running = false;
    }
}

impl Drop for VolumeGate {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::stream::AudioTap;
    use std::time::Duration;
    use tokio::sync::mpsc::error::TryRecvError;

    fn loud_frame() -> Vec<f32> {
        crate::test_utils::noise_frame(0.8, 512)
    }

    /// Source that yields the same frame on every read.
    struct Constant(Vec<f32>, Arc<Mutex<bool>>);

    impl AudioFrameSource for Constant {
        fn latest_frame(&mut self) -> Option<Vec<f32>> {
            Some(self.0.clone())
        }
        fn release(&mut self) {
            *self.1.lock().unwrap() = true;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn missing_source_is_inert() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut gate = VolumeGate::start(&VolumeGateConfig::default(), 1, None, tx);
        assert!(!gate.is_running());
        gate.stop();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(rx.try_recv(), Err(TryRecvError::Disconnected));
    }

    #[tokio::test(start_paused = true)]
    async fn bad_analyser_config_releases_source() {
        let released = Arc::new(Mutex::new(false));
        let config = VolumeGateConfig {
            fft_size: 100,
            ..VolumeGateConfig::default()
        };
        let (tx, _rx) = mpsc::unbounded_channel();
        let gate = VolumeGate::start(
            &config,
            1,
            Some(Box::new(Constant(loud_frame(), Arc::clone(&released)))),
            tx,
        );
        assert!(!gate.is_running());
        assert!(*released.lock().unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn sustained_loudness_mutes_once() {
        let released = Arc::new(Mutex::new(false));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut gate = VolumeGate::start(
            &VolumeGateConfig::default(),
            7,
            Some(Box::new(Constant(loud_frame(), Arc::clone(&released)))),
            tx,
        );
        assert!(gate.is_running());

        tokio::time::sleep(Duration::from_millis(1000)).await;
        let signal = rx.try_recv().unwrap();
        assert_eq!(signal.action, GateAction::Mute);
        assert!(gate.accepts(&signal));
        assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));

        gate.stop();
        assert!(*released.lock().unwrap());
    }

    #[test]
    fn signals_from_another_generation_are_rejected() {
        let gate = VolumeGate::inert(CancellationToken::new(), 2);
        let stale = GateSignal {
            generation: 1,
            action: GateAction::Mute,
        };
        assert!(!gate.accepts(&stale));

        let mut running = VolumeGate::inert(CancellationToken::new(), 2);
        running.running = true;
        assert!(!running.accepts(&stale));
        assert!(running.accepts(&GateSignal {
            generation: 2,
            action: GateAction::Unmute,
        }));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_is_idempotent_and_closes_tap() {
        let tap = AudioTap::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut gate =
            VolumeGate::start(&VolumeGateConfig::default(), 1, Some(Box::new(tap.clone())), tx);
        gate.stop();
        gate.stop();
        assert!(tap.is_closed());
        assert!(!gate.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn no_actions_after_stop() {
        let tap = AudioTap::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut gate =
            VolumeGate::start(&VolumeGateConfig::default(), 1, Some(Box::new(tap.clone())), tx);
        gate.stop();
        for _ in 0..10 {
            tap.push(loud_frame());
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_gate_stops_it() {
        let tap = AudioTap::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        drop(VolumeGate::start(
            &VolumeGateConfig::default(),
            1,
            Some(Box::new(tap.clone())),
            tx,
        ));
        assert!(tap.is_closed());
    }
}
