//! Transcription strategies
//!
//! Two interchangeable adapters turn captured speech into transcript
//! candidates: a continuous on-device recognizer, and a cloud fallback fed
//! by periodic chunks. One is selected at call start by capability probing;
//! sustained on-device failure switches the session to the cloud for the
//! remainder of the call.

mod cloud;
mod device;
mod filter;

pub use cloud::{CloudAdapter, CloudTranscriber, SpeechToText};
pub use device::{
    DeviceAdapter, DeviceOutcome, ErrorDirective, LocalRecognizer, RecognizerError,
    RecognizerErrorKind, RecognizerEvent,
};
pub use filter::HallucinationFilter;

use crate::session::DeviceCapabilities;

/// Which adapter produced a candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranscriptSource {
    /// Continuous platform recognizer
    OnDevice,
    /// Chunked cloud transcription
    Cloud,
}

/// A raw transcript awaiting validation.
///
/// Carries the generation it was produced under; a candidate whose
/// generation no longer matches the session is discarded unconditionally.
#[derive(Debug, Clone)]
pub struct TranscriptCandidate {
    /// Recognized text
    pub text: String,

    /// Producing adapter
    pub source: TranscriptSource,

    /// Recognizer confidence, when the source reports one
    pub confidence: Option<f32>,

    /// Session epoch at production time
    pub generation: u64,
}

/// The active transcription strategy for one session
pub struct TranscriptionStrategy {
    active: TranscriptSource,
    device: Option<DeviceAdapter>,
    cloud: std::sync::Arc<CloudAdapter>,
}

impl TranscriptionStrategy {
    /// Select the starting adapter by capability probing: on-device when
    /// the platform provides a recognizer, cloud otherwise.
    #[must_use]
    pub fn select(
        capabilities: DeviceCapabilities,
        device: Option<DeviceAdapter>,
        cloud: CloudAdapter,
    ) -> Self {
        let active = if capabilities.local_recognizer && device.is_some() {
            TranscriptSource::OnDevice
        } else {
            TranscriptSource::Cloud
        };
        tracing::info!(adapter = ?active, "transcription strategy selected");

        Self {
            active,
            device,
            cloud: std::sync::Arc::new(cloud),
        }
    }

    /// The adapter currently feeding the session
    #[must_use]
    pub const fn active(&self) -> TranscriptSource {
        self.active
    }

    /// Switch to the cloud adapter for the remainder of the call.
    ///
    /// One-way: there is no automatic switch-back within a session.
    pub fn switch_to_cloud(&mut self) {
        if self.active == TranscriptSource::Cloud {
            return;
        }
        if let Some(device) = self.device.as_mut() {
            device.stop();
        }
        self.active = TranscriptSource::Cloud;
        tracing::info!("switched to cloud transcription for the rest of the call");
    }

    /// The on-device adapter, while one is attached
    pub fn device_mut(&mut self) -> Option<&mut DeviceAdapter> {
        self.device.as_mut()
    }

    /// The cloud adapter (always available as the fallback)
    #[must_use]
    pub fn cloud(&self) -> std::sync::Arc<CloudAdapter> {
        std::sync::Arc::clone(&self.cloud)
    }

    /// Release adapter resources at session teardown
    pub fn shutdown(&mut self) {
        if let Some(device) = self.device.as_mut() {
            device.stop();
        }
    }
}
