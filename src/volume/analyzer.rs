//! Frequency-domain loudness on a 0–100 scale.
//!
//! Mirrors the browser analyser node the gate was designed around: a
//! Blackman-windowed FFT, magnitudes converted to decibels and mapped onto a
//! byte range between `min_decibels` and `max_decibels`, then the RMS of those
//! bytes normalised to percent.

use crate::config::VolumeGateConfig;
use crate::error::{Result, StageError};
use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use std::sync::Arc;

/// Loudness meter for single audio frames.
pub struct LoudnessAnalyzer {
    fft: Arc<dyn Fft<f32>>,
    fft_size: usize,
    window: Vec<f32>,
    min_decibels: f32,
    max_decibels: f32,
    scratch: Vec<Complex<f32>>,
}

impl LoudnessAnalyzer {
    /// Build the analysis graph.
    ///
    /// # Errors
    ///
    /// Returns an error if `fft_size` is not a power of two or the decibel
    /// range is empty.
    pub fn new(config: &VolumeGateConfig) -> Result<Self> {
        if config.fft_size < 2 || !config.fft_size.is_power_of_two() {
            return Err(StageError::Config(format!(
                "analyser fft_size must be a power of two >= 2, got {}",
                config.fft_size
            )));
        }
        if config.min_decibels >= config.max_decibels {
            return Err(StageError::Config(format!(
                "analyser decibel range is empty: {}..{}",
                config.min_decibels, config.max_decibels
            )));
        }

        let fft_size = config.fft_size;
        let fft = FftPlanner::new().plan_fft_forward(fft_size);
        Ok(Self {
            fft,
            fft_size,
            window: blackman_window(fft_size),
            min_decibels: config.min_decibels,
            max_decibels: config.max_decibels,
            scratch: vec![Complex::new(0.0, 0.0); fft_size],
        })
    }

    /// Loudness of the most recent `fft_size` samples of `frame`, in 0..=100.
    ///
    /// Shorter frames are zero-padded; an empty frame is silent.
    pub fn level(&mut self, frame: &[f32]) -> f32 {
        if frame.is_empty() {
            return 0.0;
        }

        let tail = &frame[frame.len().saturating_sub(self.fft_size)..];
        for (i, slot) in self.scratch.iter_mut().enumerate() {
            let sample = tail.get(i).copied().unwrap_or(0.0);
            *slot = Complex::new(sample * self.window[i], 0.0);
        }
        self.fft.process(&mut self.scratch);

        let bins = self.fft_size / 2;
        let range = self.max_decibels - self.min_decibels;
        let scale = 1.0 / self.fft_size as f32;
        let sum_sq: f32 = self.scratch[..bins]
            .iter()
            .map(|c| {
                let magnitude = c.norm() * scale;
                let db = if magnitude > 0.0 {
                    20.0 * magnitude.log10()
                } else {
                    self.min_decibels
                };
                let byte = (255.0 * (db - self.min_decibels) / range).clamp(0.0, 255.0);
                byte * byte
            })
            .sum();

        let rms = (sum_sq / bins as f32).sqrt();
        (rms / 255.0 * 100.0).clamp(0.0, 100.0)
    }
}

fn blackman_window(size: usize) -> Vec<f32> {
    const ALPHA: f32 = 0.16;
    let a0 = 0.5 * (1.0 - ALPHA);
    let a1 = 0.5;
    let a2 = 0.5 * ALPHA;
    let n = size as f32;
    (0..size)
        .map(|i| {
            let x = i as f32 / n;
            a0 - a1 * (2.0 * std::f32::consts::PI * x).cos()
                + a2 * (4.0 * std::f32::consts::PI * x).cos()
        })
        .collect()
}
