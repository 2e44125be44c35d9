//! Voice activity detection
//!
//! Watches the live capture buffer for speech onset. Used for two things:
//! barge-in detection while the assistant speaks, and a one-shot volume
//! probe that keeps silent chunks away from the transcription boundary.

use std::time::Instant;

use crate::config::VadConfig;
use crate::{Error, Result};

/// Detects speech in the live audio stream.
///
/// A rolling confirmation window (N consecutive loud observations) guards
/// against transient noise, the threshold is raised while the assistant is
/// speaking to resist echo, and interruptions are declared at most once per
/// debounce window.
#[derive(Debug)]
pub struct VoiceActivityMonitor {
    config: VadConfig,
    consecutive: u32,
    last_interruption: Option<Instant>,
}

impl VoiceActivityMonitor {
    /// Create a monitor with the given tuning
    #[must_use]
    pub fn new(config: VadConfig) -> Self {
        Self {
            config,
            consecutive: 0,
            last_interruption: None,
        }
    }

    /// Feed one observation window of samples.
    ///
    /// Returns `true` when an interruption is declared: the confirmation
    /// window filled with above-threshold observations and the debounce
    /// window since the previous declaration has passed.
    pub fn observe(&mut self, samples: &[f32], assistant_speaking: bool, now: Instant) -> bool {
        let level = level_0_255(samples);
        let threshold = if assistant_speaking {
            self.config.threshold + self.config.speaking_boost
        } else {
            self.config.threshold
        };

        if level <= threshold {
            self.consecutive = 0;
            return false;
        }

        self.consecutive += 1;
        if self.consecutive < self.config.confirmation_frames {
            return false;
        }

        let debounced = self
            .last_interruption
            .is_some_and(|at| now.duration_since(at) < self.config.debounce());
        if debounced {
            return false;
        }

        tracing::debug!(level, threshold, "speech interruption detected");
        self.last_interruption = Some(now);
        self.consecutive = 0;
        true
    }

    /// Reset the confirmation window, e.g. when a new turn starts
    pub fn reset(&mut self) {
        self.consecutive = 0;
    }

    /// Average volume of an encoded WAV chunk as a 0-100 percentage.
    ///
    /// One-shot probe used by the cloud chunk gate: chunks below the
    /// configured floor are dropped before they cost a network round-trip.
    ///
    /// # Errors
    ///
    /// Returns error if the chunk cannot be decoded.
    pub fn chunk_volume(wav_bytes: &[u8]) -> Result<f32> {
        let cursor = std::io::Cursor::new(wav_bytes);
        let mut reader =
            hound::WavReader::new(cursor).map_err(|e| Error::Audio(e.to_string()))?;

        let mut sum = 0.0f64;
        let mut count = 0u64;
        match reader.spec().sample_format {
            hound::SampleFormat::Int => {
                for sample in reader.samples::<i16>() {
                    let s = sample.map_err(|e| Error::Audio(e.to_string()))?;
                    sum += f64::from(s).abs() / f64::from(i16::MAX);
                    count += 1;
                }
            }
            hound::SampleFormat::Float => {
                for sample in reader.samples::<f32>() {
                    let s = sample.map_err(|e| Error::Audio(e.to_string()))?;
                    sum += f64::from(s.abs());
                    count += 1;
                }
            }
        }

        if count == 0 {
            return Ok(0.0);
        }

        #[allow(clippy::cast_possible_truncation)]
        Ok(((sum / count as f64) * 100.0) as f32)
    }

    /// Whether this chunk volume clears the configured floor
    #[must_use]
    pub fn clears_volume_floor(&self, volume_pct: f32) -> bool {
        volume_pct >= self.config.min_chunk_volume_pct
    }
}

/// Mean absolute amplitude scaled to the 0-255 range the thresholds are
/// tuned against
#[allow(clippy::cast_precision_loss)]
fn level_0_255(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let mean: f32 = samples.iter().map(|s| s.abs()).sum::<f32>() / samples.len() as f32;
    mean * 255.0
}
