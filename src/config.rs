//! Configuration for the parley engine
//!
//! Device-dependent tuning values (volume thresholds, debounce windows,
//! chunk cadence) live here rather than as constants. Defaults carry the
//! values the engine shipped with.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::net::RetryPolicy;
use crate::{Error, Result};

/// Engine configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Conversation-turn settings
    pub call: CallConfig,

    /// Microphone capture settings
    pub capture: CaptureConfig,

    /// Voice-activity detection tuning
    pub vad: VadConfig,

    /// Speech-to-text boundary settings
    pub stt: SttConfig,

    /// Speech-synthesis boundary settings
    pub tts: TtsConfig,

    /// Chat-completion boundary settings
    pub completion: CompletionConfig,

    /// Retry policy for boundary requests
    pub retry: RetryPolicy,
}

/// Conversation-turn settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    /// Greeting spoken when the call starts; empty disables the greeting
    pub greeting: String,

    /// Utterance spoken when the completion boundary fails for a turn
    pub apology: String,

    /// How many recent turns are sent as completion context
    pub history_turns: usize,

    /// Whether user speech may interrupt assistant playback
    pub barge_in_allowed: bool,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            greeting: String::new(),
            apology: "Sorry, I ran into a problem. Could you say that again?".to_string(),
            history_turns: 5,
            barge_in_allowed: true,
        }
    }
}

/// Microphone capture settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Interval between recorded chunks on the cloud transcription path
    pub chunk_interval_ms: u64,

    /// Chunks smaller than this never reach the transcription boundary
    pub min_chunk_bytes: usize,

    /// Sample rate the engine processes at; device audio is resampled here
    pub engine_sample_rate: u32,

    /// Preference-ordered capture container formats
    pub formats: Vec<ChunkFormat>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            chunk_interval_ms: 3000,
            min_chunk_bytes: 5000,
            engine_sample_rate: 16_000,
            formats: vec![ChunkFormat::OggOpus, ChunkFormat::Wav],
        }
    }
}

impl CaptureConfig {
    /// Chunk interval as a [`Duration`]
    #[must_use]
    pub const fn chunk_interval(&self) -> Duration {
        Duration::from_millis(self.chunk_interval_ms)
    }
}

/// Audio container format for captured chunks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChunkFormat {
    /// Opus in an Ogg container
    OggOpus,
    /// Uncompressed PCM WAV
    Wav,
}

impl ChunkFormat {
    /// Mime type sent to the transcription boundary
    #[must_use]
    pub const fn mime(self) -> &'static str {
        match self {
            Self::OggOpus => "audio/ogg",
            Self::Wav => "audio/wav",
        }
    }
}

/// Voice-activity detection tuning.
///
/// Optimal values are device-dependent; these defaults are the empirically
/// derived production values.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VadConfig {
    /// Speech level threshold on a 0-255 scale, while the assistant is quiet
    pub threshold: f32,

    /// Added to `threshold` while the assistant is speaking, to resist echo
    /// on devices without hardware echo cancellation
    pub speaking_boost: f32,

    /// Consecutive above-threshold observations required before speech is
    /// declared
    pub confirmation_frames: u32,

    /// Minimum gap between two declared interruptions
    pub debounce_ms: u64,

    /// Chunks with average volume below this percentage never reach the
    /// transcription boundary
    pub min_chunk_volume_pct: f32,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            threshold: 60.0,
            speaking_boost: 15.0,
            confirmation_frames: 3,
            debounce_ms: 1000,
            min_chunk_volume_pct: 0.1,
        }
    }
}

impl VadConfig {
    /// Debounce window as a [`Duration`]
    #[must_use]
    pub const fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

/// Speech-to-text boundary settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SttConfig {
    /// Transcription endpoint URL
    pub endpoint: String,

    /// API key (`PARLEY_STT_API_KEY` overrides)
    pub api_key: String,

    /// Model identifier (e.g. "whisper-1")
    pub model: String,

    /// Expected speech language hint
    pub language: String,

    /// Hard deadline for one chunked transcription request; a timeout is
    /// "no result", not an error
    pub request_timeout_secs: u64,

    /// Local retries for retryable on-device recognizer errors before the
    /// session switches to the cloud adapter
    pub device_max_retries: u32,

    /// Linear backoff step between on-device retries
    pub device_retry_backoff_ms: u64,

    /// A final text extending the previous one by fewer than this many
    /// characters is treated as a correction and suppressed
    pub min_final_extension: usize,
}

impl Default for SttConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api.openai.com/v1/audio/transcriptions".to_string(),
            api_key: String::new(),
            model: "whisper-1".to_string(),
            language: "ru".to_string(),
            request_timeout_secs: 30,
            device_max_retries: 3,
            device_retry_backoff_ms: 1000,
            min_final_extension: 5,
        }
    }
}

impl SttConfig {
    /// Request deadline as a [`Duration`]
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Backoff step as a [`Duration`]
    #[must_use]
    pub const fn device_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.device_retry_backoff_ms)
    }
}

/// Speech-synthesis boundary settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TtsConfig {
    /// Synthesis endpoint URL
    pub endpoint: String,

    /// API key (`PARLEY_TTS_API_KEY` overrides)
    pub api_key: String,

    /// Model identifier
    pub model: String,

    /// Voice identifier
    pub voice: String,

    /// Speed multiplier
    pub speed: f64,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api.openai.com/v1/audio/speech".to_string(),
            api_key: String::new(),
            model: "tts-1-hd".to_string(),
            voice: "onyx".to_string(),
            speed: 1.0,
        }
    }
}

/// Chat-completion boundary settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CompletionConfig {
    /// Completion endpoint URL
    pub endpoint: String,

    /// API key (`PARLEY_COMPLETION_API_KEY` overrides)
    pub api_key: String,

    /// Model identifier
    pub model: String,

    /// System prompt prepended to every request
    pub system_prompt: String,

    /// Reply token cap
    pub max_tokens: u32,

    /// Sampling temperature
    pub temperature: f32,

    /// Request streamed replies and accumulate the chunks
    pub stream: bool,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api.openai.com/v1/chat/completions".to_string(),
            api_key: String::new(),
            model: "gpt-4o-mini".to_string(),
            system_prompt: "You are a helpful voice assistant. Keep responses short and conversational.".to_string(),
            max_tokens: 500,
            temperature: 0.6,
            stream: false,
        }
    }
}

impl Config {
    /// Load configuration from the given path, or the default location.
    ///
    /// Missing files are not an error; defaults apply. Environment
    /// variables override API keys and endpoints after the file is read.
    ///
    /// # Errors
    ///
    /// Returns error if the file exists but cannot be read or parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => Some(p.to_path_buf()),
            None => Self::default_path(),
        };

        let mut config = match path {
            Some(ref p) if p.exists() => {
                let text = std::fs::read_to_string(p)?;
                let config = toml::from_str(&text)?;
                tracing::debug!(path = %p.display(), "configuration loaded");
                config
            }
            _ => Self::default(),
        };

        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Default config file path (`<config dir>/parley/engine.toml`)
    #[must_use]
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("dev", "parley", "parley")
            .map(|dirs| dirs.config_dir().join("engine.toml"))
    }

    fn apply_env(&mut self) {
        if let Ok(key) = std::env::var("PARLEY_STT_API_KEY") {
            self.stt.api_key = key;
        }
        if let Ok(key) = std::env::var("PARLEY_TTS_API_KEY") {
            self.tts.api_key = key;
        }
        if let Ok(key) = std::env::var("PARLEY_COMPLETION_API_KEY") {
            self.completion.api_key = key;
        }
        // One key for all three boundaries when they share a provider
        if let Ok(key) = std::env::var("PARLEY_API_KEY") {
            if self.stt.api_key.is_empty() {
                self.stt.api_key = key.clone();
            }
            if self.tts.api_key.is_empty() {
                self.tts.api_key = key.clone();
            }
            if self.completion.api_key.is_empty() {
                self.completion.api_key = key;
            }
        }
        if let Ok(url) = std::env::var("PARLEY_STT_ENDPOINT") {
            self.stt.endpoint = url;
        }
        if let Ok(url) = std::env::var("PARLEY_TTS_ENDPOINT") {
            self.tts.endpoint = url;
        }
        if let Ok(url) = std::env::var("PARLEY_COMPLETION_ENDPOINT") {
            self.completion.endpoint = url;
        }
    }

    fn validate(&self) -> Result<()> {
        if self.capture.formats.is_empty() {
            return Err(Error::Config(
                "capture.formats must list at least one container format".to_string(),
            ));
        }
        if self.call.history_turns == 0 {
            return Err(Error::Config(
                "call.history_turns must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.capture.chunk_interval(), Duration::from_secs(3));
        assert_eq!(config.stt.request_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_toml_overrides() {
        let config: Config = toml::from_str(
            r#"
            [vad]
            threshold = 40.0
            debounce_ms = 500

            [capture]
            formats = ["wav"]
            "#,
        )
        .unwrap();

        assert!((config.vad.threshold - 40.0).abs() < f32::EPSILON);
        assert_eq!(config.vad.debounce(), Duration::from_millis(500));
        assert_eq!(config.capture.formats, vec![ChunkFormat::Wav]);
        // Untouched sections keep their defaults
        assert_eq!(config.stt.model, "whisper-1");
    }

    #[test]
    fn test_empty_formats_rejected() {
        let config: Config = toml::from_str("[capture]\nformats = []\n").unwrap();
        assert!(config.validate().is_err());
    }
}
