//! Cloud transcription adapter
//!
//! The fallback path: periodic captured chunks are gated (size, volume) and
//! shipped to the speech-to-text boundary, with a hard deadline racing each
//! request. A timed-out request is abandoned as "no result" because the
//! live stream has already moved on; its late reply, if any, is still
//! subject to generation checking upstream.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::{CaptureConfig, SttConfig, VadConfig};
use crate::net::{RequestClient, RetryPolicy};
use crate::voice::{AudioChunk, VoiceActivityMonitor};
use crate::{Error, Result};

/// Speech-to-text boundary: short audio segments in, text out
#[async_trait]
pub trait SpeechToText: Send + Sync {
    /// Transcribe one audio segment
    ///
    /// # Errors
    ///
    /// Returns error if the boundary rejects or fails the request
    async fn transcribe(&self, audio: &[u8], mime: &str) -> Result<String>;
}

/// Whisper-shaped transcription response
#[derive(serde::Deserialize)]
struct TranscriptionResponse {
    text: String,
}

/// HTTP client for a Whisper-shaped transcription API
pub struct CloudTranscriber {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
    language: String,
}

impl CloudTranscriber {
    /// Create a transcriber from configuration
    ///
    /// # Errors
    ///
    /// Returns error if the API key is missing
    pub fn new(config: &SttConfig) -> Result<Self> {
        if config.api_key.is_empty() {
            return Err(Error::Config(
                "STT API key required for cloud transcription".to_string(),
            ));
        }

        Ok(Self {
            http: reqwest::Client::new(),
            endpoint: config.endpoint.clone(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            language: config.language.clone(),
        })
    }
}

#[async_trait]
impl SpeechToText for CloudTranscriber {
    async fn transcribe(&self, audio: &[u8], mime: &str) -> Result<String> {
        tracing::debug!(audio_bytes = audio.len(), mime, "starting transcription");

        let extension = match mime {
            "audio/ogg" => "ogg",
            _ => "wav",
        };

        let form = reqwest::multipart::Form::new()
            .part(
                "file",
                reqwest::multipart::Part::bytes(audio.to_vec())
                    .file_name(format!("chunk.{extension}"))
                    .mime_str(mime)
                    .map_err(|e| Error::Stt(e.to_string()))?,
            )
            .text("model", self.model.clone())
            .text("language", self.language.clone())
            .text("response_format", "json");

        let response = self
            .http
            .post(&self.endpoint)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .multipart(form)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Api {
                service: "STT",
                status,
                message: body,
            });
        }

        let result: TranscriptionResponse = response.json().await?;
        tracing::debug!(transcript = %result.text, "transcription complete");
        Ok(result.text)
    }
}

/// Gated, deadline-raced chunk transcription
pub struct CloudAdapter {
    boundary: Arc<dyn SpeechToText>,
    net: Arc<RequestClient>,
    policy: RetryPolicy,
    request_timeout: Duration,
    min_chunk_bytes: usize,
    min_volume_pct: f32,
}

impl CloudAdapter {
    /// Assemble the adapter from its boundary client and gates
    #[must_use]
    pub fn new(
        boundary: Arc<dyn SpeechToText>,
        net: Arc<RequestClient>,
        policy: RetryPolicy,
        stt: &SttConfig,
        capture: &CaptureConfig,
        vad: &VadConfig,
    ) -> Self {
        Self {
            boundary,
            net,
            policy,
            request_timeout: stt.request_timeout(),
            min_chunk_bytes: capture.min_chunk_bytes,
            min_volume_pct: vad.min_chunk_volume_pct,
        }
    }

    /// Gate and transcribe one captured chunk.
    ///
    /// Returns `Ok(None)` when the chunk is dropped at a gate, times out,
    /// or transcribes to nothing; none of these is an error for the
    /// session.
    ///
    /// # Errors
    ///
    /// Returns error when the boundary fails terminally (after retries);
    /// the failure is scoped to this one chunk.
    pub async fn transcribe_chunk(&self, chunk: &AudioChunk) -> Result<Option<String>> {
        if chunk.len() < self.min_chunk_bytes {
            tracing::debug!(bytes = chunk.len(), "chunk below size gate, skipping");
            return Ok(None);
        }

        let volume = VoiceActivityMonitor::chunk_volume(&chunk.bytes)?;
        if volume < self.min_volume_pct {
            tracing::debug!(volume_pct = volume, "chunk below volume gate, skipping");
            return Ok(None);
        }

        let request = self.net.execute("stt.transcribe", &self.policy, |_| {
            let boundary = Arc::clone(&self.boundary);
            let bytes = chunk.bytes.clone();
            let mime = chunk.mime;
            async move { boundary.transcribe(&bytes, mime).await }
        });

        let text = match tokio::time::timeout(self.request_timeout, request).await {
            Ok(result) => result?,
            Err(_) => {
                tracing::debug!(
                    timeout = ?self.request_timeout,
                    "transcription deadline passed, abandoning chunk"
                );
                return Ok(None);
            }
        };

        let text = text.trim();
        if text.is_empty() {
            return Ok(None);
        }
        Ok(Some(text.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use chrono::Utc;

    use crate::voice::samples_to_wav;

    struct StubBoundary {
        calls: AtomicU32,
        reply: String,
        delay: Duration,
    }

    #[async_trait]
    impl SpeechToText for StubBoundary {
        async fn transcribe(&self, _audio: &[u8], _mime: &str) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok(self.reply.clone())
        }
    }

    fn loud_chunk() -> AudioChunk {
        let samples: Vec<f32> = (0..24_000).map(|i| (i as f32 * 0.1).sin() * 0.5).collect();
        AudioChunk {
            bytes: samples_to_wav(&samples, 16_000).unwrap(),
            mime: "audio/wav",
            captured_at: Utc::now(),
            source_sample_rate: 16_000,
        }
    }

    fn silent_chunk() -> AudioChunk {
        AudioChunk {
            bytes: samples_to_wav(&vec![0.0f32; 24_000], 16_000).unwrap(),
            mime: "audio/wav",
            captured_at: Utc::now(),
            source_sample_rate: 16_000,
        }
    }

    fn adapter(boundary: Arc<StubBoundary>, timeout: Duration) -> CloudAdapter {
        let stt = SttConfig {
            request_timeout_secs: timeout.as_secs().max(1),
            ..SttConfig::default()
        };
        let mut adapter = CloudAdapter::new(
            boundary,
            Arc::new(RequestClient::new()),
            RetryPolicy {
                base_delay_ms: 1,
                ..RetryPolicy::default()
            },
            &stt,
            &CaptureConfig::default(),
            &VadConfig::default(),
        );
        adapter.request_timeout = timeout;
        adapter
    }

    fn boundary(reply: &str, delay: Duration) -> Arc<StubBoundary> {
        Arc::new(StubBoundary {
            calls: AtomicU32::new(0),
            reply: reply.to_string(),
            delay,
        })
    }

    #[tokio::test]
    async fn test_small_chunk_never_reaches_boundary() {
        let stub = boundary("текст", Duration::ZERO);
        let adapter = adapter(Arc::clone(&stub), Duration::from_secs(5));

        let tiny = AudioChunk {
            bytes: vec![0u8; 100],
            mime: "audio/wav",
            captured_at: Utc::now(),
            source_sample_rate: 16_000,
        };

        assert!(adapter.transcribe_chunk(&tiny).await.unwrap().is_none());
        assert_eq!(stub.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_silent_chunk_never_reaches_boundary() {
        let stub = boundary("текст", Duration::ZERO);
        let adapter = adapter(Arc::clone(&stub), Duration::from_secs(5));

        assert!(adapter
            .transcribe_chunk(&silent_chunk())
            .await
            .unwrap()
            .is_none());
        assert_eq!(stub.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_loud_chunk_transcribed() {
        let stub = boundary("покажи рецепт", Duration::ZERO);
        let adapter = adapter(Arc::clone(&stub), Duration::from_secs(5));

        let text = adapter.transcribe_chunk(&loud_chunk()).await.unwrap();
        assert_eq!(text.as_deref(), Some("покажи рецепт"));
        assert_eq!(stub.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_timeout_is_no_result_not_error() {
        let stub = boundary("слишком поздно", Duration::from_millis(200));
        let adapter = adapter(Arc::clone(&stub), Duration::from_millis(20));

        let result = adapter.transcribe_chunk(&loud_chunk()).await;
        assert!(matches!(result, Ok(None)));
    }

    #[tokio::test]
    async fn test_empty_transcript_is_no_result() {
        let stub = boundary("   ", Duration::ZERO);
        let adapter = adapter(Arc::clone(&stub), Duration::from_secs(5));

        assert!(adapter
            .transcribe_chunk(&loud_chunk())
            .await
            .unwrap()
            .is_none());
    }
}
