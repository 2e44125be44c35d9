//! On-device recognition adapter
//!
//! The platform speech recognizer is an injected capability: the host
//! provides a [`LocalRecognizer`] implementation when the device has one,
//! and the adapter turns its raw event stream into deduplicated transcript
//! candidates plus retry/switch decisions on failure.

use std::time::Duration;

use tokio::sync::mpsc;

use crate::Result;
use crate::config::SttConfig;

/// Raw events from a platform recognizer
#[derive(Debug, Clone)]
pub enum RecognizerEvent {
    /// Partial text, may still change
    Interim(String),
    /// Finalized text for the utterance so far
    Final(String),
    /// The recognizer failed
    Error(RecognizerError),
}

/// A recognizer failure with its classification
#[derive(Debug, Clone)]
pub struct RecognizerError {
    /// What went wrong
    pub kind: RecognizerErrorKind,
    /// Backend message
    pub message: String,
}

/// Recognizer failure classes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecognizerErrorKind {
    /// Connectivity to the recognizer backend dropped
    Network,
    /// The audio source stalled or disappeared
    AudioCapture,
    /// A transient permission revocation
    PermissionTransient,
    /// Recognition is not available on this platform
    Unsupported,
    /// Anything else
    Other,
}

impl RecognizerErrorKind {
    /// Whether retrying locally can help
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::Network | Self::AudioCapture | Self::PermissionTransient
        )
    }
}

/// A platform speech recognizer, injected by the host.
///
/// Implementations deliver [`RecognizerEvent`]s continuously once started;
/// `pause`/`resume` bracket assistant playback on devices prone to echo
/// feedback.
pub trait LocalRecognizer: Send {
    /// Begin continuous recognition, returning the event stream
    ///
    /// # Errors
    ///
    /// Returns error if recognition cannot start
    fn start(&mut self) -> Result<mpsc::Receiver<RecognizerEvent>>;

    /// Suspend recognition without releasing resources
    fn pause(&mut self);

    /// Resume after [`LocalRecognizer::pause`]
    fn resume(&mut self);

    /// Stop recognition and release resources
    fn stop(&mut self);
}

/// What to do with a text event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceOutcome {
    /// Hand the text onward as a transcript candidate
    Forward(String),
    /// Show as a live preview only
    Preview(String),
    /// Drop: duplicate or correction of already-forwarded text
    Suppressed,
}

/// What to do after a recognizer error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorDirective {
    /// Restart the recognizer after this delay
    RetryAfter(Duration),
    /// Retries exhausted or failure non-retryable: switch the session to
    /// the cloud adapter
    SwitchToCloud,
}

/// Wraps a [`LocalRecognizer`] with dedup and failure policy
pub struct DeviceAdapter {
    recognizer: Box<dyn LocalRecognizer>,
    last_final: String,
    retries: u32,
    max_retries: u32,
    backoff_step: Duration,
    min_extension: usize,
}

impl DeviceAdapter {
    /// Wrap a recognizer with the configured policy
    #[must_use]
    pub fn new(recognizer: Box<dyn LocalRecognizer>, config: &SttConfig) -> Self {
        Self {
            recognizer,
            last_final: String::new(),
            retries: 0,
            max_retries: config.device_max_retries,
            backoff_step: config.device_retry_backoff(),
            min_extension: config.min_final_extension,
        }
    }

    /// Start the underlying recognizer
    ///
    /// # Errors
    ///
    /// Returns error if recognition cannot start
    pub fn start(&mut self) -> Result<mpsc::Receiver<RecognizerEvent>> {
        self.recognizer.start()
    }

    /// Pause the recognizer during assistant playback
    pub fn pause(&mut self) {
        self.recognizer.pause();
    }

    /// Resume after playback ends
    pub fn resume(&mut self) {
        self.recognizer.resume();
    }

    /// Stop and release the recognizer
    pub fn stop(&mut self) {
        self.recognizer.stop();
    }

    /// Process a text event, deduplicating refined finals.
    ///
    /// A final that merely extends the previously forwarded final by fewer
    /// than the configured character threshold is the same utterance being
    /// refined, not new speech, and is suppressed.
    pub fn on_text(&mut self, event: &RecognizerEvent) -> DeviceOutcome {
        match event {
            RecognizerEvent::Interim(text) => {
                let trimmed = text.trim();
                if trimmed.is_empty() {
                    DeviceOutcome::Suppressed
                } else {
                    DeviceOutcome::Preview(trimmed.to_string())
                }
            }
            RecognizerEvent::Final(text) => {
                let trimmed = text.trim();
                if trimmed.is_empty() {
                    return DeviceOutcome::Suppressed;
                }

                if trimmed == self.last_final {
                    tracing::debug!(text = trimmed, "duplicate final suppressed");
                    return DeviceOutcome::Suppressed;
                }

                let is_correction = !self.last_final.is_empty()
                    && trimmed.starts_with(&self.last_final)
                    && trimmed.chars().count() - self.last_final.chars().count()
                        < self.min_extension;
                if is_correction {
                    tracing::debug!(text = trimmed, "correction suppressed");
                    self.last_final = trimmed.to_string();
                    return DeviceOutcome::Suppressed;
                }

                self.last_final = trimmed.to_string();
                self.retries = 0;
                DeviceOutcome::Forward(trimmed.to_string())
            }
            RecognizerEvent::Error(_) => DeviceOutcome::Suppressed,
        }
    }

    /// Decide how to react to a recognizer failure.
    ///
    /// Retryable failures back off linearly up to the retry cap; anything
    /// else, or an exhausted cap, switches the session to the cloud
    /// adapter permanently (no switch-back, to avoid oscillation).
    pub fn on_error(&mut self, error: &RecognizerError) -> ErrorDirective {
        if error.kind.is_retryable() && self.retries < self.max_retries {
            self.retries += 1;
            let delay = self.backoff_step * self.retries;
            tracing::warn!(
                kind = ?error.kind,
                message = %error.message,
                retry = self.retries,
                "recognizer error, retrying"
            );
            ErrorDirective::RetryAfter(delay)
        } else {
            tracing::warn!(
                kind = ?error.kind,
                message = %error.message,
                retries = self.retries,
                "recognizer failed, switching to cloud transcription"
            );
            ErrorDirective::SwitchToCloud
        }
    }

    /// Forget the last forwarded final, e.g. when a new utterance starts
    pub fn reset_dedup(&mut self) {
        self.last_final.clear();
    }
}
