//! Configuration types for the avatar stage.

use crate::error::{Result, StageError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Placeholder substituted with the active language tag in source templates.
pub const LANGUAGE_PLACEHOLDER: &str = "{lang}";

/// Top-level configuration for the avatar stage.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StageConfig {
    /// Speaker-volume microphone gate.
    pub volume: VolumeGateConfig,
    /// Debounce/countdown chain that ends a quiet conversation.
    pub ending: EndingConfig,
    /// Avatar session settings.
    pub session: SessionConfig,
    /// Video surfaces and reconciliation.
    pub presentation: PresentationConfig,
    /// Token and session registry services.
    pub services: ServiceConfig,
    /// Log filter and in-memory log buffer.
    pub logging: LoggingConfig,
}

/// Volume gate configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeGateConfig {
    /// Sampling interval in ms.
    pub check_interval_ms: u64,
    /// Loudness threshold on the 0–100 scale.
    ///
    /// Observed deployments used values between 13 and 20.
    pub volume_threshold: f32,
    /// How long the level must stay on one side of the threshold before the
    /// gate flips, in ms.
    pub sustain_duration_ms: u64,
    /// FFT size for the frequency analysis (must be a power of two).
    pub fft_size: usize,
    /// Magnitude mapped to 0 on the byte scale.
    pub min_decibels: f32,
    /// Magnitude mapped to 255 on the byte scale.
    pub max_decibels: f32,
}

impl Default for VolumeGateConfig {
    fn default() -> Self {
        Self {
            check_interval_ms: 100,
            volume_threshold: 20.0,
            sustain_duration_ms: 100,
            fft_size: 512,
            min_decibels: -100.0,
            max_decibels: -30.0,
        }
    }
}

impl VolumeGateConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }

    pub fn sustain_duration(&self) -> Duration {
        Duration::from_millis(self.sustain_duration_ms)
    }
}

/// Ending sequencer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EndingConfig {
    /// Quiet period after avatar-stopped-speaking before silence is re-checked.
    pub debounce_ms: u64,
    /// Speech newer than this (relative to the debounce expiry) aborts the chain.
    pub recent_speech_window_ms: u64,
    /// Grace period between confirmed silence and session teardown.
    ///
    /// 5000 ms is the usual value; 10000 ms is also in use.
    pub countdown_ms: u64,
    /// Delay between session stop and the ending presentation request.
    pub settle_delay_ms: u64,
}

impl Default for EndingConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 3000,
            recent_speech_window_ms: 2000,
            countdown_ms: 5000,
            settle_delay_ms: 100,
        }
    }
}

/// Stream quality requested from the avatar service.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AvatarQuality {
    Low,
    Medium,
    #[default]
    High,
}

/// Parameters handed to the transport when a session starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AvatarStartConfig {
    /// Avatar identifier on the streaming service.
    pub avatar_name: String,
    pub quality: AvatarQuality,
    /// Language tag spoken by the avatar (`en`, `tr`, ...).
    pub language: String,
    /// Speaking rate multiplier.
    pub voice_rate: f32,
    /// Knowledge base backing the avatar's answers.
    pub knowledge_base_id: Option<String>,
    /// Seconds of inactivity after which the service ends the session.
    pub activity_idle_timeout_secs: u32,
}

impl Default for AvatarStartConfig {
    fn default() -> Self {
        Self {
            avatar_name: "default".to_owned(),
            quality: AvatarQuality::High,
            language: "en".to_owned(),
            voice_rate: 1.0,
            knowledge_base_id: None,
            activity_idle_timeout_secs: 120,
        }
    }
}

impl AvatarStartConfig {
    /// Copy of this config with the language replaced.
    #[must_use]
    pub fn with_language(&self, language: &str) -> Self {
        Self {
            language: language.to_owned(),
            ..self.clone()
        }
    }
}

/// Avatar session configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Base path handed to the transport when it is constructed.
    pub base_path: String,
    /// How long a disconnect received mid-utterance is deferred.
    pub disconnect_grace_ms: u64,
    /// How many times a deferred disconnect may be re-deferred while the
    /// avatar keeps speaking.
    pub max_disconnect_rechecks: u32,
    /// Avatar start parameters.
    pub avatar: AvatarStartConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            base_path: "https://api.avatar.example.com".to_owned(),
            disconnect_grace_ms: 3000,
            max_disconnect_rechecks: 3,
            avatar: AvatarStartConfig::default(),
        }
    }
}

/// Presentation surfaces configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PresentationConfig {
    /// Upper bound on waiting for a surface to confirm it paused.
    pub pause_fallback_ms: u64,
    /// Drift reconciliation period.
    pub reconcile_interval_ms: u64,
    /// Language used before any session has started.
    pub default_language: String,
    /// Idle loop source (language independent).
    pub idle_source: String,
    /// Intro clip template, `{lang}` is substituted.
    pub intro_source: String,
    /// Ending clip template, `{lang}` is substituted.
    pub ending_source: String,
    /// Error clip template, `{lang}` is substituted.
    pub error_source: String,
}

impl Default for PresentationConfig {
    fn default() -> Self {
        Self {
            pause_fallback_ms: 500,
            reconcile_interval_ms: 500,
            default_language: "en".to_owned(),
            idle_source: "media/idle.mp4".to_owned(),
            intro_source: "media/intro_{lang}.mp4".to_owned(),
            ending_source: "media/ending_{lang}.mp4".to_owned(),
            error_source: "media/error_{lang}.mp4".to_owned(),
        }
    }
}

/// Token service and session registry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Base URL of the backend exposing the token and session endpoints.
    pub base_url: String,
    /// Per-request timeout.
    pub request_timeout_ms: u64,
    /// Retries after a failed force close before giving up.
    pub force_close_retries: u32,
    /// Backoff step between force-close attempts; retry `n` waits `n * step`.
    pub force_close_backoff_ms: u64,
    /// Wait between closing all sessions and re-listing them.
    pub cleanup_settle_ms: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:3000".to_owned(),
            request_timeout_ms: 10_000,
            force_close_retries: 3,
            force_close_backoff_ms: 1000,
            cleanup_settle_ms: 1000,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub filter: String,
    /// Records kept by the in-memory log buffer.
    pub buffer_capacity: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_owned(),
            buffer_capacity: 500,
        }
    }
}

impl StageConfig {
    /// Load configuration from a TOML file, falling back to defaults for missing fields.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or if the
    /// parsed values fail [`StageConfig::validate`].
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content).map_err(|e| StageError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written or the config cannot be serialized.
    pub fn save_to_file(&self, path: &std::path::Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| StageError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Returns the default config file path: `~/.config/avatar-stage/config.toml`.
    pub fn default_config_path() -> PathBuf {
        if let Some(config) = std::env::var_os("XDG_CONFIG_HOME") {
            PathBuf::from(config).join("avatar-stage").join("config.toml")
        } else if let Some(home) = std::env::var_os("HOME") {
            PathBuf::from(home)
                .join(".config")
                .join("avatar-stage")
                .join("config.toml")
        } else {
            PathBuf::from("/tmp/avatar-stage/config.toml")
        }
    }

    /// Reject values the runtime cannot work with.
    ///
    /// # Errors
    ///
    /// Returns [`StageError::Config`] naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        let v = &self.volume;
        if v.check_interval_ms == 0 {
            return Err(StageError::Config("volume.check_interval_ms must be > 0".into()));
        }
        if !(0.0..=100.0).contains(&v.volume_threshold) {
            return Err(StageError::Config(format!(
                "volume.volume_threshold must be within 0..=100, got {}",
                v.volume_threshold
            )));
        }
        if v.fft_size == 0 || !v.fft_size.is_power_of_two() {
            return Err(StageError::Config(format!(
                "volume.fft_size must be a non-zero power of two, got {}",
                v.fft_size
            )));
        }
        if v.min_decibels >= v.max_decibels {
            return Err(StageError::Config(
                "volume.min_decibels must be below volume.max_decibels".into(),
            ));
        }

        let e = &self.ending;
        if e.debounce_ms == 0 || e.countdown_ms == 0 {
            return Err(StageError::Config(
                "ending.debounce_ms and ending.countdown_ms must be > 0".into(),
            ));
        }

        let p = &self.presentation;
        if p.reconcile_interval_ms == 0 {
            return Err(StageError::Config(
                "presentation.reconcile_interval_ms must be > 0".into(),
            ));
        }
        for (name, template) in [
            ("intro_source", &p.intro_source),
            ("ending_source", &p.ending_source),
            ("error_source", &p.error_source),
        ] {
            if !template.contains(LANGUAGE_PLACEHOLDER) {
                return Err(StageError::Config(format!(
                    "presentation.{name} must contain {LANGUAGE_PLACEHOLDER}"
                )));
            }
        }

        if self.logging.buffer_capacity == 0 {
            return Err(StageError::Config("logging.buffer_capacity must be > 0".into()));
        }
        Ok(())
    }
}
