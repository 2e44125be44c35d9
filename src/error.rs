//! Error types for the parley engine

use thiserror::Error;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the engine
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Audio device or codec error
    #[error("audio error: {0}")]
    Audio(String),

    /// Microphone capture error, with the specific cause
    #[error("microphone error: {0}")]
    Microphone(#[from] MicrophoneError),

    /// Speech-to-text error
    #[error("STT error: {0}")]
    Stt(String),

    /// Text-to-speech error
    #[error("TTS error: {0}")]
    Tts(String),

    /// Chat-completion error
    #[error("completion error: {0}")]
    Completion(String),

    /// Non-success status from a boundary API
    #[error("{service} API error {status}: {message}")]
    Api {
        /// Which boundary returned the status
        service: &'static str,
        /// HTTP status code
        status: reqwest::StatusCode,
        /// Response body, if any
        message: String,
    },

    /// Operation exceeded its deadline
    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Why microphone capture could not start or continue.
///
/// Fatal to the session's capture path; surfaced upward naming the specific
/// cause. None of these is retried.
#[derive(Debug, Error)]
pub enum MicrophoneError {
    /// Access to the input device was denied
    #[error("microphone access denied; check input permissions")]
    Denied,

    /// No input device is present
    #[error("no microphone found; check that an input device is connected")]
    NotFound,

    /// The device exists but is held by another process
    #[error("microphone is busy; another application is using it")]
    Busy,

    /// None of the preferred capture formats is supported
    #[error("unsupported capture format: {0}")]
    UnsupportedFormat(String),

    /// Anything the backend reports that does not fit the above
    #[error("{0}")]
    Other(String),
}
