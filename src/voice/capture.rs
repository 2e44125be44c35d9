//! Audio capture from microphone
//!
//! One [`AudioCaptureController`] owns the live input stream for the whole
//! session. The cloud transcription path drains it into bounded
//! [`AudioChunk`]s on a fixed cadence; the voice-activity monitor reads the
//! tail of the same buffer without draining it.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleRate, Stream, StreamConfig};

use crate::config::{CaptureConfig, ChunkFormat};
use crate::error::MicrophoneError;
use crate::{Error, Result};

/// Immutable captured audio segment, consumed once by transcription
#[derive(Debug, Clone)]
pub struct AudioChunk {
    /// Encoded audio
    pub bytes: Vec<u8>,

    /// Container mime type
    pub mime: &'static str,

    /// When the chunk was sealed
    pub captured_at: DateTime<Utc>,

    /// Sample rate of the source device
    pub source_sample_rate: u32,
}

impl AudioChunk {
    /// Encoded size in bytes
    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether the chunk carries no audio
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Captures audio from the default input device.
///
/// Exclusively owns the microphone stream for the session's lifetime;
/// [`AudioCaptureController::stop`] is the only path that releases the
/// device.
pub struct AudioCaptureController {
    #[allow(dead_code)]
    device: Device,
    config: StreamConfig,
    device_rate: u32,
    engine_rate: u32,
    format: ChunkFormat,
    buffer: Arc<Mutex<Vec<f32>>>,
    stream: Option<Stream>,
}

impl AudioCaptureController {
    /// Open the default input device and negotiate a capture format.
    ///
    /// # Errors
    ///
    /// Returns a [`MicrophoneError`] naming the specific cause: no device,
    /// device busy, access denied, or no supported container format.
    pub fn new(capture: &CaptureConfig) -> Result<Self> {
        let format = negotiate_format(&capture.formats)?;

        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or(MicrophoneError::NotFound)?;

        let engine_rate = capture.engine_sample_rate;
        let config = select_input_config(&device, engine_rate)?;
        let device_rate = config.sample_rate.0;

        tracing::debug!(
            device = device.name().unwrap_or_default(),
            device_rate,
            engine_rate,
            channels = config.channels,
            format = ?format,
            "audio capture initialized"
        );

        Ok(Self {
            device,
            config,
            device_rate,
            engine_rate,
            format,
            buffer: Arc::new(Mutex::new(Vec::new())),
            stream: None,
        })
    }

    /// Start capturing. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns error if the stream cannot be built or started.
    pub fn start(&mut self) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }

        let buffer = Arc::clone(&self.buffer);
        let channels = usize::from(self.config.channels);

        let stream = self
            .device
            .build_input_stream(
                &self.config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    if let Ok(mut buf) = buffer.lock() {
                        if channels == 1 {
                            buf.extend_from_slice(data);
                        } else {
                            // Downmix to mono
                            buf.extend(data.chunks(channels).map(|frame| {
                                frame.iter().sum::<f32>() / frame.len() as f32
                            }));
                        }
                    }
                },
                |err| {
                    tracing::error!(error = %err, "audio capture error");
                },
                None,
            )
            .map_err(map_build_error)?;

        stream
            .play()
            .map_err(|e| MicrophoneError::Other(e.to_string()))?;
        self.stream = Some(stream);

        tracing::debug!("audio capture started");
        Ok(())
    }

    /// Stop capturing and release the microphone.
    ///
    /// The only path that destroys the device resource; safe to call twice.
    pub fn stop(&mut self) {
        if let Some(stream) = self.stream.take() {
            drop(stream);
            if let Ok(mut buf) = self.buffer.lock() {
                buf.clear();
            }
            tracing::debug!("audio capture stopped, microphone released");
        }
    }

    /// Seal everything captured since the last call into one chunk.
    ///
    /// Draining the shared buffer is the segmented stop/restart: the input
    /// stream keeps appending while the sealed chunk is encoded and shipped,
    /// so capture is never gapped by a slow network round-trip.
    ///
    /// Returns `None` when nothing was captured this interval.
    ///
    /// # Errors
    ///
    /// Returns error if resampling or encoding fails.
    pub fn take_chunk(&self) -> Result<Option<AudioChunk>> {
        let samples = self
            .buffer
            .lock()
            .map(|mut buf| std::mem::take(&mut *buf))
            .unwrap_or_default();

        if samples.is_empty() {
            return Ok(None);
        }

        let samples = if self.device_rate == self.engine_rate {
            samples
        } else {
            resample(&samples, self.device_rate, self.engine_rate)?
        };

        let bytes = match self.format {
            ChunkFormat::Wav => samples_to_wav(&samples, self.engine_rate)?,
            // Unreachable in practice: negotiation rejects formats without
            // an encoder. Kept explicit so a future encoder slots in here.
            ChunkFormat::OggOpus => {
                return Err(MicrophoneError::UnsupportedFormat("audio/ogg".to_string()).into());
            }
        };

        Ok(Some(AudioChunk {
            bytes,
            mime: self.format.mime(),
            captured_at: Utc::now(),
            source_sample_rate: self.device_rate,
        }))
    }

    /// Copy the most recent `window` samples without draining the buffer.
    /// Used by the voice-activity monitor.
    #[must_use]
    pub fn recent_samples(&self, window: usize) -> Vec<f32> {
        self.buffer
            .lock()
            .map(|buf| {
                let start = buf.len().saturating_sub(window);
                buf[start..].to_vec()
            })
            .unwrap_or_default()
    }

    /// Whether the stream is live
    #[must_use]
    pub const fn is_capturing(&self) -> bool {
        self.stream.is_some()
    }

    /// Sample rate of the source device
    #[must_use]
    pub const fn device_sample_rate(&self) -> u32 {
        self.device_rate
    }
}

/// Pick the first supported format from the preference list.
///
/// Fails fast with an explicit unsupported-format error rather than
/// silently producing unusable data.
fn negotiate_format(preferences: &[ChunkFormat]) -> Result<ChunkFormat> {
    for &format in preferences {
        match format {
            ChunkFormat::Wav => return Ok(format),
            // No opus encoder in the build; skip
            ChunkFormat::OggOpus => {}
        }
    }

    let wanted = preferences
        .iter()
        .map(|f| f.mime())
        .collect::<Vec<_>>()
        .join(", ");
    Err(MicrophoneError::UnsupportedFormat(wanted).into())
}

/// Find a usable input config: mono at the engine rate when the device
/// offers it, otherwise the device default (resampled later).
fn select_input_config(device: &Device, engine_rate: u32) -> Result<StreamConfig> {
    let native = device
        .supported_input_configs()
        .map_err(|e| map_backend_error(&e.to_string()))?
        .find(|c| {
            c.channels() == 1
                && c.min_sample_rate() <= SampleRate(engine_rate)
                && c.max_sample_rate() >= SampleRate(engine_rate)
        });

    if let Some(config) = native {
        return Ok(config.with_sample_rate(SampleRate(engine_rate)).config());
    }

    let default = device
        .default_input_config()
        .map_err(|e| map_backend_error(&e.to_string()))?;
    Ok(default.config())
}

fn map_build_error(error: cpal::BuildStreamError) -> Error {
    match error {
        cpal::BuildStreamError::DeviceNotAvailable => MicrophoneError::Busy.into(),
        other => map_backend_error(&other.to_string()),
    }
}

/// Backends report permission and contention failures as opaque strings;
/// map the recognizable ones to specific causes.
fn map_backend_error(message: &str) -> Error {
    let lower = message.to_lowercase();
    let specific = if lower.contains("permission") || lower.contains("denied") {
        MicrophoneError::Denied
    } else if lower.contains("busy") || lower.contains("in use") {
        MicrophoneError::Busy
    } else if lower.contains("no device") || lower.contains("not found") {
        MicrophoneError::NotFound
    } else {
        MicrophoneError::Other(message.to_string())
    };
    specific.into()
}

/// Convert f32 samples to WAV bytes for the transcription boundary
///
/// # Errors
///
/// Returns error if WAV encoding fails
pub fn samples_to_wav(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer =
            hound::WavWriter::new(&mut cursor, spec).map_err(|e| Error::Audio(e.to_string()))?;

        for &sample in samples {
            #[allow(clippy::cast_possible_truncation)]
            let sample_i16 = (sample * 32767.0).clamp(-32768.0, 32767.0) as i16;
            writer
                .write_sample(sample_i16)
                .map_err(|e| Error::Audio(e.to_string()))?;
        }

        writer.finalize().map_err(|e| Error::Audio(e.to_string()))?;
    }

    Ok(cursor.into_inner())
}

/// Resample mono audio between rates
#[allow(clippy::cast_possible_truncation)]
fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> Result<Vec<f32>> {
    use rubato::{FftFixedIn, Resampler};

    let chunk_size = 1024;
    let sub_chunks = 2;

    let mut resampler =
        FftFixedIn::<f64>::new(from_rate as usize, to_rate as usize, chunk_size, sub_chunks, 1)
            .map_err(|e| Error::Audio(format!("resampler init failed: {e}")))?;

    let input: Vec<f64> = samples.iter().map(|&s| f64::from(s)).collect();
    let mut output = Vec::new();

    for chunk in input.chunks(chunk_size) {
        if chunk.len() == chunk_size {
            let result = resampler
                .process(&[chunk.to_vec()], None)
                .map_err(|e| Error::Audio(format!("resample failed: {e}")))?;
            output.extend_from_slice(&result[0]);
        }
    }

    Ok(output.iter().map(|&s| s as f32).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wav_header() {
        let samples = vec![0.0f32, 0.5, -0.5, 1.0];
        let wav = samples_to_wav(&samples, 16_000).unwrap();

        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(&wav[8..12], b"WAVE");
        assert!(wav.len() > 44);
    }

    #[test]
    fn test_negotiation_prefers_first_supported() {
        let format = negotiate_format(&[ChunkFormat::OggOpus, ChunkFormat::Wav]).unwrap();
        assert_eq!(format, ChunkFormat::Wav);
    }

    #[test]
    fn test_negotiation_fails_fast_when_nothing_supported() {
        let error = negotiate_format(&[ChunkFormat::OggOpus]).unwrap_err();
        assert!(error.to_string().contains("unsupported capture format"));
    }

    #[test]
    fn test_resample_halves_length() {
        let samples: Vec<f32> = (0..8192).map(|i| (i as f32 * 0.01).sin()).collect();
        let resampled = resample(&samples, 32_000, 16_000).unwrap();

        // FFT resampler drops the trailing partial chunk; allow slack
        let expected = samples.len() / 2;
        assert!(resampled.len() > expected - 2048);
        assert!(resampled.len() <= expected);
    }

    #[test]
    fn test_backend_error_mapping() {
        assert!(matches!(
            map_backend_error("Permission denied by the system"),
            Error::Microphone(MicrophoneError::Denied)
        ));
        assert!(matches!(
            map_backend_error("device is busy"),
            Error::Microphone(MicrophoneError::Busy)
        ));
        assert!(matches!(
            map_backend_error("something else"),
            Error::Microphone(MicrophoneError::Other(_))
        ));
    }
}
