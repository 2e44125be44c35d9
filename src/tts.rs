//! Speech synthesis boundary client
//!
//! Turns reply text into MP3 bytes. The voice parameters carry a degraded
//! fallback configuration that callers switch to on the final retry
//! attempt, so persistent failures get a cheaper, more compatible request
//! on the last chance instead of failing outright.

use async_trait::async_trait;

use crate::config::TtsConfig;
use crate::{Error, Result};

/// Synthesis voice parameters for one request
#[derive(Debug, Clone, serde::Serialize)]
pub struct VoiceParams {
    /// Model identifier
    pub model: String,

    /// Voice identifier
    pub voice: String,

    /// Speed multiplier
    pub speed: f64,

    /// Audio container for the response
    pub response_format: &'static str,
}

impl VoiceParams {
    /// Parameters from configuration
    #[must_use]
    pub fn from_config(config: &TtsConfig) -> Self {
        Self {
            model: config.model.clone(),
            voice: config.voice.clone(),
            speed: config.speed,
            response_format: "mp3",
        }
    }

    /// The cheaper, maximally compatible configuration used on the final
    /// retry attempt
    #[must_use]
    pub fn degraded(&self) -> Self {
        Self {
            model: "tts-1".to_string(),
            voice: self.voice.clone(),
            speed: 1.0,
            response_format: "mp3",
        }
    }
}

/// Speech-synthesis boundary: text in, audio bytes out
#[async_trait]
pub trait SpeechSynthesis: Send + Sync {
    /// Synthesize one piece of text
    ///
    /// # Errors
    ///
    /// Returns error if the boundary rejects or fails the request
    async fn synthesize(&self, text: &str, params: &VoiceParams) -> Result<Vec<u8>>;
}

/// HTTP client for an OpenAI-shaped synthesis API
pub struct SpeechSynthesizer {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
}

impl SpeechSynthesizer {
    /// Create a synthesizer from configuration
    ///
    /// # Errors
    ///
    /// Returns error if the API key is missing
    pub fn new(config: &TtsConfig) -> Result<Self> {
        if config.api_key.is_empty() {
            return Err(Error::Config(
                "TTS API key required for speech synthesis".to_string(),
            ));
        }

        Ok(Self {
            http: reqwest::Client::new(),
            endpoint: config.endpoint.clone(),
            api_key: config.api_key.clone(),
        })
    }
}

#[async_trait]
impl SpeechSynthesis for SpeechSynthesizer {
    async fn synthesize(&self, text: &str, params: &VoiceParams) -> Result<Vec<u8>> {
        #[derive(serde::Serialize)]
        struct SynthesisRequest<'a> {
            model: &'a str,
            input: &'a str,
            voice: &'a str,
            speed: f64,
            response_format: &'a str,
        }

        let request = SynthesisRequest {
            model: &params.model,
            input: text,
            voice: &params.voice,
            speed: params.speed,
            response_format: params.response_format,
        };

        let response = self
            .http
            .post(&self.endpoint)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Api {
                service: "TTS",
                status,
                message: body,
            });
        }

        let audio = response.bytes().await?;
        if audio.is_empty() {
            return Err(Error::Tts("empty audio response".to_string()));
        }

        tracing::debug!(bytes = audio.len(), "speech synthesized");
        Ok(audio.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_degraded_params_are_cheaper() {
        let config = TtsConfig {
            model: "tts-1-hd".to_string(),
            voice: "onyx".to_string(),
            speed: 1.2,
            ..TtsConfig::default()
        };
        let params = VoiceParams::from_config(&config);
        let degraded = params.degraded();

        assert_eq!(degraded.model, "tts-1");
        assert!((degraded.speed - 1.0).abs() < f64::EPSILON);
        // Voice identity survives degradation
        assert_eq!(degraded.voice, "onyx");
    }

    #[test]
    fn test_missing_key_rejected() {
        let config = TtsConfig {
            api_key: String::new(),
            ..TtsConfig::default()
        };
        assert!(SpeechSynthesizer::new(&config).is_err());
    }
}
